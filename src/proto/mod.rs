//! # Slotwise Proto
//!
//! The reply model and a minimal RESP2 codec used by the default TCP node
//! connection.
//!
//! ## Modules
//!
//! - [`codec`] - Encoder and decoder for RESP frames
//! - [`error`] - Error types shared by the whole crate
//! - [`frame`] - Frame types representing requests and replies

pub mod codec;
/// Error types.
pub mod error;
pub mod frame;
