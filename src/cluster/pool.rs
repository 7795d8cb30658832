//! Connection pooling for Redis Cluster nodes.
//!
//! Connections are opened lazily per node id and handed out as
//! [`PooledConnection`] guards. A guard returns its connection to the pool on
//! drop unless the connection failed, was cancelled mid-request, or belongs to
//! a generation that [`ConnectionPool::invalidate`] has retired.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::debug;

use crate::core::connection::{Connector, NodeConnection};
use crate::core::{Error, Result};
use crate::proto::frame::Frame;

use super::commands::readonly;
use super::errors::parse_redis_error;
use super::topology::{NodeEndpoint, NodeId, NodeRole};

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of connections per node
    pub max_connections_per_node: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_node: 1,
        }
    }
}

struct NodeEntry {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn NodeConnection>>>,
    generation: AtomicU64,
}

impl NodeEntry {
    fn new(cap: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(cap)),
            idle: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
        }
    }

    fn idle(&self) -> MutexGuard<'_, Vec<Box<dyn NodeConnection>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn retire(&self) -> Vec<Box<dyn NodeConnection>> {
        self.generation.fetch_add(1, Ordering::AcqRel);
        std::mem::take(&mut *self.idle())
    }
}

/// Connection pool for Redis Cluster nodes.
///
/// The node map lock is only held to find or insert a node's entry; waiting
/// for a free connection happens on that node's semaphore.
pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    nodes: RwLock<HashMap<NodeId, Arc<NodeEntry>>>,
}

impl ConnectionPool {
    /// Creates a new connection pool.
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    async fn entry(&self, id: &NodeId) -> Arc<NodeEntry> {
        if let Some(entry) = self.nodes.read().await.get(id) {
            return entry.clone();
        }
        let mut nodes = self.nodes.write().await;
        nodes
            .entry(id.clone())
            .or_insert_with(|| Arc::new(NodeEntry::new(self.config.max_connections_per_node)))
            .clone()
    }

    /// Checks out a connection to `node`, waiting if the node is at its cap.
    ///
    /// An idle connection is reused; otherwise a new one is opened. Replica
    /// connections are switched to `READONLY` before first use.
    ///
    /// # Errors
    ///
    /// Returns the connector's error, or the `READONLY` failure for replicas.
    pub async fn acquire(&self, node: &NodeEndpoint) -> Result<PooledConnection> {
        let entry = self.entry(&node.id).await;
        let permit = entry
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::connection_closed())?;
        let generation = entry.generation.load(Ordering::Acquire);

        let idle = entry.idle().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => self.open(node).await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            entry,
            generation,
            node: node.clone(),
            in_flight: false,
            broken: false,
            _permit: permit,
        })
    }

    async fn open(&self, node: &NodeEndpoint) -> Result<Box<dyn NodeConnection>> {
        debug!(node = %node, id = %node.id, "opening node connection");
        let mut conn = self.connector.connect(&node.address()).await?;
        if node.role == NodeRole::Replica {
            if let Frame::Error(e) = conn.send(&readonly().into_frame()).await? {
                return Err(parse_redis_error(&e));
            }
        }
        Ok(conn)
    }

    /// Drops the idle connections of `node` and retires those checked out.
    ///
    /// The next `acquire` reconnects.
    pub async fn invalidate(&self, node: &NodeId) {
        let entry = self.nodes.read().await.get(node).cloned();
        if let Some(entry) = entry {
            let retired = entry.retire();
            debug!(node = %node, closed = retired.len(), "invalidated node connections");
        }
    }

    /// Forgets every node not in `live` and closes its idle connections.
    ///
    /// Connections still checked out for those nodes are dropped when their
    /// guards are.
    pub async fn retain(&self, live: &HashSet<NodeId>) {
        let departed: Vec<(NodeId, Arc<NodeEntry>)> = {
            let mut nodes = self.nodes.write().await;
            let stale: Vec<NodeId> = nodes.keys().filter(|id| !live.contains(*id)).cloned().collect();
            stale
                .into_iter()
                .filter_map(|id| nodes.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        for (id, entry) in departed {
            let retired = entry.retire();
            debug!(node = %id, closed = retired.len(), "dropping connections to departed node");
            for mut conn in retired {
                conn.close().await;
            }
        }
    }

    /// Closes every idle connection and forgets all nodes.
    pub async fn close_all(&self) {
        let entries: Vec<Arc<NodeEntry>> = self.nodes.write().await.drain().map(|(_, e)| e).collect();
        for entry in entries {
            for mut conn in entry.retire() {
                conn.close().await;
            }
        }
    }

    /// Returns the number of idle connections held for `node`.
    pub async fn idle_count(&self, node: &NodeId) -> usize {
        match self.nodes.read().await.get(node) {
            Some(entry) => entry.idle().len(),
            None => 0,
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A connection checked out of the pool.
///
/// Dropping the guard returns the connection unless it is broken, was
/// dropped while a request was in flight, or was invalidated meanwhile.
pub struct PooledConnection {
    conn: Option<Box<dyn NodeConnection>>,
    entry: Arc<NodeEntry>,
    generation: u64,
    node: NodeEndpoint,
    in_flight: bool,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Returns the node this connection talks to.
    pub fn node(&self) -> &NodeEndpoint {
        &self.node
    }

    /// Sends a frame and waits for the reply.
    ///
    /// A transport failure marks the connection broken.
    pub async fn send(&mut self, frame: &Frame) -> Result<Frame> {
        let conn = self.conn.as_mut().ok_or_else(Error::connection_closed)?;
        self.in_flight = true;
        let result = conn.send(frame).await;
        self.in_flight = false;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    /// Drops the connection instead of returning it to the pool.
    pub fn discard(mut self) {
        self.broken = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let current = self.entry.generation.load(Ordering::Acquire) == self.generation;
        if !self.broken && !self.in_flight && current {
            self.entry.idle().push(conn);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("node", &self.node)
            .field("generation", &self.generation)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}
