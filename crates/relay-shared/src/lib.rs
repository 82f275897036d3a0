//! # relay-shared
//!
//! Types shared by the Relay store and the node binary: recipient ids,
//! timestamp helpers, protocol constants and the decrypted payload schema
//! handed over by the session layer.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::PayloadError;
pub use types::{RecipientId, ThreadType};
