//! Data models handed across the core's public surface.
//!
//! - `AuthGrant`, `PolicyDocument`: what a successful login yields
//! - `TicketRecord`: a flattened, displayable ticket
//! - `TicketImage`: base64 ticket image for one document

pub mod ticket;

pub use ticket::{AuthGrant, PolicyDocument, TicketImage, TicketRecord};
