//! # Slotwise Core
//!
//! The pieces the router builds on: commands that know their keys, the node
//! connection seam, and client configuration.
//!
//! ## Modules
//!
//! - [`command`] - Command builders with key positions
//! - [`connection`] - Node connection and connector traits, TCP implementation
//! - [`builder`] - Cluster client builder and configuration

pub use crate::proto::error::{Error, Result};

/// Client builder configuration.
pub mod builder;
/// Command construction helpers.
pub mod command;
/// Node connection management.
pub mod connection;
