//! Upstream gateway for the MÁV mobile ticketing service.
//!
//! This module provides the `Upstream` trait and `ApiClient`, its HTTP
//! implementation, plus the `ApiError` taxonomy every gateway operation
//! resolves to. Translation between the upstream wire format and the
//! crate's models lives in `wire`.
//!
//! The service authenticates with an opaque token returned by the login
//! endpoint; every request also carries a language tag and client id.

pub mod client;
pub mod error;
pub mod wire;

pub use client::{ApiClient, Upstream};
pub use error::{ApiError, ErrorBody, ErrorKind};
