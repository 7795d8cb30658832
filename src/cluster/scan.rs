//! Cluster-wide SCAN.
//!
//! SCAN cursors are per node. [`ClusterScan`] keeps one cursor per primary,
//! keyed by node id, and walks the nodes one after another until every
//! cursor is back to 0. Every key that lives through the whole scan is
//! returned at least once; duplicates are possible when slots move.

use std::collections::{BTreeMap, HashMap, VecDeque};

use bytes::Bytes;
use futures::stream::{self, Stream};
use tracing::{debug, warn};

use crate::core::command::{frame_to_scan_response, scan};
use crate::core::{Error, Result};

use super::client::ClusterClient;
use super::topology::{NodeEndpoint, NodeId, Topology};

/// Scan behavior on topology changes.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ScanConfig {
    /// Scan the slots of a vanished node again on their new owners.
    pub rescan_on_failover: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            rescan_on_failover: true,
        }
    }
}

/// Scan progress on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCursor {
    /// Node being scanned.
    pub node: NodeEndpoint,
    /// Cursor to send next.
    pub cursor: u64,
    /// True once the node returned cursor 0.
    pub finished: bool,
    /// Slots this cursor is responsible for.
    pub slots: Vec<u16>,
}

/// A resumable snapshot of a scan.
#[derive(Debug, Clone, Default)]
pub struct ScanState {
    /// `MATCH` pattern.
    pub pattern: Option<Bytes>,
    /// `COUNT` hint.
    pub count: Option<usize>,
    /// One cursor per node.
    pub cursors: BTreeMap<NodeId, NodeCursor>,
}

impl ScanState {
    /// Returns true when every node cursor has returned to 0.
    pub fn is_finished(&self) -> bool {
        self.cursors.values().all(|c| c.finished)
    }
}

/// A lazy SCAN over every primary.
///
/// # Example
///
/// ```no_run
/// # async fn example(client: slotwise::ClusterClient) -> slotwise::Result<()> {
/// let mut scan = client.scan(Some("{user:1}*"), Some(100)).await?;
/// while let Some(keys) = scan.next_batch().await? {
///     for key in keys {
///         println!("{:?}", key);
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ClusterScan {
    client: ClusterClient,
    state: ScanState,
}

impl ClusterScan {
    pub(crate) fn new(
        client: ClusterClient,
        topology: &Topology,
        pattern: Option<Bytes>,
        count: Option<usize>,
    ) -> Self {
        let cursors = topology
            .primaries()
            .into_iter()
            .map(|node| {
                let cursor = NodeCursor {
                    node: node.clone(),
                    cursor: 0,
                    finished: false,
                    slots: topology.slots_owned_by(&node.id),
                };
                (node.id.clone(), cursor)
            })
            .collect();

        Self {
            client,
            state: ScanState {
                pattern,
                count,
                cursors,
            },
        }
    }

    pub(crate) fn resume(client: ClusterClient, state: ScanState) -> Self {
        Self { client, state }
    }

    /// Returns the current progress, for [`ClusterClient::resume_scan`].
    pub fn state(&self) -> &ScanState {
        &self.state
    }

    /// Returns true when no keys are left to fetch.
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Fetches the next non-empty batch of keys.
    ///
    /// Returns `None` once every node cursor has returned to 0.
    ///
    /// # Errors
    ///
    /// Command errors are returned as is; the scan can be continued
    /// afterwards. A node that fails or leaves the topology is dropped from
    /// the scan instead.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Bytes>>> {
        loop {
            let Some((id, node, cursor)) = self
                .state
                .cursors
                .iter()
                .find(|(_, c)| !c.finished)
                .map(|(id, c)| (id.clone(), c.node.clone(), c.cursor))
            else {
                return Ok(None);
            };

            let present = self
                .client
                .topology()
                .primaries()
                .iter()
                .any(|p| p.id == id);
            if !present {
                debug!(node = %node, "node left the topology mid-scan");
                self.abandon(&id);
                continue;
            }

            let cmd = scan(cursor, self.state.pattern.as_ref(), self.state.count);
            match self.client.execute_on(&node, &cmd).await {
                Ok(frame) => {
                    let (next, keys) = frame_to_scan_response(frame)?;
                    if let Some(entry) = self.state.cursors.get_mut(&id) {
                        entry.cursor = next;
                        entry.finished = next == 0;
                    }
                    if !keys.is_empty() {
                        return Ok(Some(keys));
                    }
                }
                Err(e) if is_node_failure(&e) => {
                    warn!(node = %node, error = %e, "node failed mid-scan");
                    if let Err(e) = self.client.refresh_topology().await {
                        warn!(error = %e, "topology refresh after scan failure failed");
                    }
                    self.abandon(&id);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drops a node's cursor and, when configured, enrolls the new owners of
    /// its slots from cursor 0.
    fn abandon(&mut self, id: &NodeId) {
        let Some(abandoned) = self.state.cursors.remove(id) else {
            return;
        };
        if !self.client.config().scan.rescan_on_failover {
            return;
        }

        let topology = self.client.topology();
        let mut heirs: HashMap<NodeId, (NodeEndpoint, Vec<u16>)> = HashMap::new();
        for slot in abandoned.slots {
            match topology.owner(slot) {
                Some(owner) if owner.id != *id => {
                    heirs
                        .entry(owner.id.clone())
                        .or_insert_with(|| (owner.clone(), Vec::new()))
                        .1
                        .push(slot);
                }
                _ => {}
            }
        }

        for (heir, (node, slots)) in heirs {
            debug!(node = %node, slots = slots.len(), "rescanning inherited slots");
            let entry = self
                .state
                .cursors
                .entry(heir)
                .or_insert_with(|| NodeCursor {
                    node,
                    cursor: 0,
                    finished: false,
                    slots: Vec::new(),
                });
            entry.cursor = 0;
            entry.finished = false;
            entry.slots.extend(slots);
        }
    }

    /// Turns the scan into a stream of keys.
    ///
    /// The stream ends after the last key, or right after yielding an error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> {
        stream::unfold(
            (self, VecDeque::new(), false),
            |(mut scan, mut buffer, failed)| async move {
                if failed {
                    return None;
                }
                loop {
                    if let Some(key) = buffer.pop_front() {
                        return Some((Ok(key), (scan, buffer, false)));
                    }
                    match scan.next_batch().await {
                        Ok(Some(keys)) => buffer.extend(keys),
                        Ok(None) => return None,
                        Err(e) => return Some((Err(e), (scan, buffer, true))),
                    }
                }
            },
        )
    }
}

fn is_node_failure(error: &Error) -> bool {
    error.is_transport() || error.last_error().is_some_and(Error::is_transport)
}
