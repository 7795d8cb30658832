//! # Slotwise
//!
//! Redis Cluster key routing: computes hash slots, keeps a live map of which
//! node owns each slot, sends commands there over pooled connections, and
//! follows MOVED/ASK redirects with bounded retries.
//!
//! ## Features
//!
//! - `test-utils` - In-memory [`testing::MockCluster`] for downstream tests
//!
//! ## Example
//!
//! ```no_run
//! use slotwise::{key_slot, ClusterClient, Cmd};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     assert_eq!(key_slot("{user:1}:name"), key_slot("{user:1}:email"));
//!
//!     let client = ClusterClient::connect("127.0.0.1:7000").await?;
//!     client.set("{user:1}:name", "alice").await?;
//!     let reply = client
//!         .execute(&Cmd::new("MGET").key("{user:1}:name").key("{user:1}:email"))
//!         .await?;
//!     println!("{:?}", reply);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod cluster;
pub mod core;
pub mod proto;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export high-level client types for convenience
pub use crate::cluster::{key_slot, validate_same_slot, ClusterClient};
pub use crate::core::builder::{ClusterClientBuilder, ClusterConfig};
pub use crate::core::command::Cmd;
pub use crate::core::{Error, Result};
pub use crate::proto::frame::Frame;
