//! Diffusion Core - Panel/patch/intent types, stream protocol, and error taxonomy

pub mod error;
pub mod protocol;
pub mod types;

pub use error::{ApplyError, Error, ErrorCategory, Result};
pub use protocol::*;
pub use types::*;
