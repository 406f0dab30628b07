//! Domain layer for the zagara coordination substrate.
//!
//! Core models, errors, and ports; no Redis plumbing lives here.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{ErrorKind, SwarmError, SwarmResult};
