//! Porthole Shared Library
//!
//! Wire protocol frames and error types shared by the tunnel client.

pub mod protocol;
pub mod error;

pub use error::{Error, Result, ValidationError};
