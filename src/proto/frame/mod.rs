//! RESP frame types.
//!
//! Requests are arrays of bulk strings; replies are any of the variants of
//! [`Frame`].

/// Frame type definitions.
pub mod types;

pub use types::Frame;
