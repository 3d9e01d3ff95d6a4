//! Core library for railticket: the upstream gateway, the request governor,
//! and the authenticated session lifecycle.

pub mod api;
pub mod auth;
pub mod config;
pub mod governor;
pub mod models;

pub use api::{ApiClient, ApiError, ErrorBody, ErrorKind, Upstream};
pub use auth::{SessionEvent, SessionManager, SessionSnapshot};
pub use config::{Config, Settings};
pub use governor::RateGovernor;
