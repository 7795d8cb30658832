//! # Slotwise Cluster
//!
//! Key routing and redirection for Redis Cluster.
//!
//! ## Features
//!
//! - **Slot hashing**: CRC16 with `{...}` hash tags, see [`key_slot`]
//! - **Topology map**: immutable snapshots built from `CLUSTER SLOTS` and
//!   `CLUSTER NODES`, swapped atomically on refresh
//! - **Redirect handling**: MOVED updates the map, ASK is followed once
//! - **Connection pooling**: bounded per-node pools, invalidated on failure
//! - **Cluster scan**: per-node cursors that survive failover
//!
//! ## Example
//!
//! ```no_run
//! # async fn example() -> slotwise::Result<()> {
//! use slotwise::ClusterClient;
//! use bytes::Bytes;
//!
//! // Connect to Redis Cluster (comma-separated seed nodes)
//! let client = ClusterClient::connect("127.0.0.1:7000,127.0.0.1:7001").await?;
//!
//! // Commands are routed to the node owning the key's slot
//! client.set("key", Bytes::from("value")).await?;
//! let value = client.get("key").await?;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod commands;
mod errors;
mod pool;
pub mod redirect;
mod scan;
mod slot;
mod topology;

pub use client::ClusterClient;
pub use errors::parse_redis_error;
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use redirect::{RetryPolicy, MAX_FREE_REDIRECTS};
pub use scan::{ClusterScan, NodeCursor, ScanConfig, ScanState};
pub use slot::{hash_tag, key_slot, validate_same_slot, SLOT_COUNT};
pub use topology::{
    parse_cluster_nodes, Migration, NodeEndpoint, NodeFlags, NodeId, NodeInfo, NodeRole,
    SlotRange, Topology, TopologyMap,
};
