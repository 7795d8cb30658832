//! Redis Cluster command builders.
//!
//! Management commands the router sends on its own: topology discovery and
//! the one-shot handshakes used during redirects.

use crate::core::command::Cmd;

/// Creates a CLUSTER SLOTS command.
///
/// Returns an array of slot ranges with their corresponding master and replica
/// nodes. This is the primary method for discovering cluster topology.
pub fn cluster_slots() -> Cmd {
    Cmd::new("CLUSTER").arg("SLOTS")
}

/// Creates a CLUSTER NODES command.
///
/// One line per node; the router reads it for MIGRATING and IMPORTING markers.
pub fn cluster_nodes() -> Cmd {
    Cmd::new("CLUSTER").arg("NODES")
}

/// Creates an ASKING command.
///
/// ASKING is a one-time flag: it only affects the immediately following
/// command on the same connection.
pub fn asking() -> Cmd {
    Cmd::new("ASKING")
}

/// Creates a READONLY command, sent once to each replica connection.
pub fn readonly() -> Cmd {
    Cmd::new("READONLY")
}
