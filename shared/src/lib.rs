//! l7proxify shared library
//!
//! Error taxonomy, TLS record framing and the handshake message codec.

pub mod error;
pub mod handshake;
pub mod protocol;

pub use error::{Error, ErrorCategory, Result};
