//! Redis Cluster client implementation.
//!
//! [`ClusterClient`] routes each command to the node owning its keys' slot,
//! follows MOVED and ASK redirects, retries transient failures within a
//! budget and a deadline, and keeps the topology current.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, warn};

use crate::core::builder::{ClusterClientBuilder, ClusterConfig};
use crate::core::command::{self, Cmd};
use crate::core::connection::NodeConnection;
use crate::core::{Error, Result};
use crate::proto::frame::Frame;

use super::commands::{asking, cluster_nodes, cluster_slots};
use super::pool::ConnectionPool;
use super::redirect::{classify, decide, Action, Outcome, PendingRetry, RetryTarget};
use super::scan::{ClusterScan, ScanState};
use super::slot::validate_same_slot;
use super::topology::{parse_cluster_nodes, NodeEndpoint, NodeId, NodeRole, Topology, TopologyMap};

struct Inner {
    config: ClusterConfig,
    topology: TopologyMap,
    pool: ConnectionPool,
    refresh_lock: Mutex<()>,
    refreshes: AtomicU64,
    next_primary: AtomicUsize,
}

/// Redis Cluster client.
///
/// Cheap to clone; clones share the topology and the connection pool.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> slotwise::Result<()> {
/// use slotwise::{ClusterClient, Cmd};
///
/// let client = ClusterClient::connect("127.0.0.1:7000,127.0.0.1:7001").await?;
///
/// client.set("{user:1}:name", "alice").await?;
/// let name = client.get("{user:1}:name").await?;
///
/// // Multi-key commands must keep their keys in one slot.
/// let reply = client
///     .execute(&Cmd::new("MGET").key("{user:1}:name").key("{user:1}:email"))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<Inner>,
}

/// Where a dispatch went and how it ended.
struct Dispatched {
    node: Option<NodeEndpoint>,
    outcome: Outcome,
}

impl ClusterClient {
    /// Connects to a Redis Cluster using seed nodes.
    ///
    /// The address can be a single node or a comma-separated list of nodes.
    /// The client discovers the full cluster topology from the seed nodes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for malformed addresses and
    /// `TopologyUnavailable` if no seed answers.
    pub async fn connect(addresses: &str) -> Result<Self> {
        ClusterClientBuilder::new()
            .seeds(addresses.split(',').map(str::trim).filter(|a| !a.is_empty()))
            .build()
            .await
    }

    /// Creates a client from a validated configuration without contacting
    /// any node.
    pub fn with_config(config: ClusterConfig) -> Self {
        let pool = ConnectionPool::new(config.pool.clone(), config.connector.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                topology: TopologyMap::new(),
                pool,
                refresh_lock: Mutex::new(()),
                refreshes: AtomicU64::new(0),
                next_primary: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns the configuration this client runs with.
    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// Returns the current topology snapshot.
    pub fn topology(&self) -> Arc<Topology> {
        self.inner.topology.snapshot()
    }

    /// Returns the number of known nodes in the cluster.
    pub fn node_count(&self) -> usize {
        self.inner.topology.snapshot().node_count()
    }

    /// Checks if the cluster covers all slots (0-16383).
    pub fn is_fully_covered(&self) -> bool {
        self.inner.topology.snapshot().is_fully_covered()
    }

    /// Reloads the topology from the cluster.
    ///
    /// Queries `CLUSTER SLOTS` on the known nodes, then the seeds, until one
    /// answers. Concurrent calls share one refresh.
    ///
    /// # Errors
    ///
    /// Returns `TopologyUnavailable` if no node answers.
    pub async fn refresh_topology(&self) -> Result<()> {
        let seen = self.inner.refreshes.load(Ordering::Acquire);
        self.refresh_since(seen).await
    }

    async fn refresh_since(&self, seen: u64) -> Result<()> {
        let _guard = self.inner.refresh_lock.lock().await;
        if self.inner.refreshes.load(Ordering::Acquire) != seen {
            debug!("topology refreshed by another caller");
            return Ok(());
        }

        let topology = self.fetch_topology().await?;
        let ranges = topology.ranges().len();
        let live: HashSet<NodeId> = topology.nodes().map(|n| n.id.clone()).collect();
        let epoch = self.inner.topology.replace(topology);
        self.inner.refreshes.fetch_add(1, Ordering::AcqRel);
        self.inner.pool.retain(&live).await;
        debug!(epoch, ranges, "topology refreshed");
        Ok(())
    }

    fn refresh_candidates(&self) -> Vec<String> {
        let snapshot = self.inner.topology.snapshot();
        let mut candidates: Vec<String> = snapshot.nodes().map(NodeEndpoint::address).collect();
        for seed in &self.inner.config.seeds {
            candidates.push(seed.clone());
        }
        let mut seen = HashSet::new();
        candidates.retain(|address| seen.insert(address.clone()));
        candidates
    }

    async fn fetch_topology(&self) -> Result<Topology> {
        let mut last_error = String::from("no nodes to query");
        for address in self.refresh_candidates() {
            match self.fetch_topology_from_node(&address).await {
                Ok(topology) => return Ok(topology),
                Err(e) => {
                    warn!(node = %address, error = %e, "topology query failed");
                    last_error = format!("{}: {}", address, e);
                }
            }
        }
        Err(Error::TopologyUnavailable {
            message: last_error,
        })
    }

    /// Fetches topology from a specific node over a fresh connection.
    async fn fetch_topology_from_node(&self, address: &str) -> Result<Topology> {
        let mut conn = self.inner.config.connector.connect(address).await?;
        let result = Self::query_topology(conn.as_mut(), address).await;
        conn.close().await;
        result
    }

    async fn query_topology(conn: &mut dyn NodeConnection, address: &str) -> Result<Topology> {
        let mut topology = match conn.send(&cluster_slots().into_frame()).await? {
            Frame::Error(e) => {
                let message = String::from_utf8_lossy(&e);
                if message.contains("cluster support disabled") {
                    debug!(node = %address, "cluster mode disabled, using single node");
                    return Topology::single_node(address);
                }
                return Err(Error::Server {
                    message: message.into_owned(),
                });
            }
            frame => Topology::from_cluster_slots(frame)?,
        };
        if topology.is_empty() {
            return Err(Error::protocol("CLUSTER SLOTS reported no assigned slots"));
        }

        // Migration markers are only in CLUSTER NODES; a failure here keeps
        // the slot map without them.
        match conn.send(&cluster_nodes().into_frame()).await {
            Ok(frame) => match frame.as_text().map(|text| parse_cluster_nodes(&text)) {
                Some(Ok(nodes)) => topology.apply_migrations(&nodes),
                Some(Err(e)) => debug!(node = %address, error = %e, "ignoring CLUSTER NODES"),
                None => debug!(node = %address, "CLUSTER NODES returned no text"),
            },
            Err(e) => debug!(node = %address, error = %e, "CLUSTER NODES failed"),
        }
        Ok(topology)
    }

    fn deadline(&self) -> Option<Instant> {
        self.inner
            .config
            .command_timeout
            .map(|timeout| Instant::now() + timeout)
    }

    /// Executes a command on the node owning its keys.
    ///
    /// Redirects and transient cluster errors are retried within the
    /// configured budget and command timeout.
    ///
    /// # Errors
    ///
    /// - `CrossSlot` if the keys span slots (nothing is sent)
    /// - `Server` for command errors, verbatim
    /// - `RetriesExhausted` or `Timeout` wrapping the last routing error
    /// - `TopologyUnavailable` if the slot's owner cannot be discovered
    pub async fn execute(&self, cmd: &Cmd) -> Result<Frame> {
        self.run(cmd, None, self.deadline()).await
    }

    /// Like [`execute`](Self::execute) with an explicit deadline.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn execute_with_deadline(&self, cmd: &Cmd, deadline: Instant) -> Result<Frame> {
        self.run(cmd, None, Some(deadline)).await
    }

    /// Executes a command on a chosen node, regardless of its keys.
    ///
    /// A MOVED reply still redirects the command to the slot's owner, and so
    /// does a transport failure when the command has keys.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute); a transport failure on the chosen node
    /// is returned directly for keyless commands.
    pub async fn execute_on(&self, node: &NodeEndpoint, cmd: &Cmd) -> Result<Frame> {
        self.run(cmd, Some(node.clone()), self.deadline()).await
    }

    /// Sends a command to every primary and collects the replies.
    ///
    /// # Errors
    ///
    /// Fails only if the topology cannot be loaded; per-node failures are in
    /// the returned list.
    pub async fn broadcast(&self, cmd: &Cmd) -> Result<Vec<(NodeEndpoint, Result<Frame>)>> {
        let snapshot = self.ready_snapshot().await?;
        let primaries: Vec<NodeEndpoint> = snapshot.primaries().into_iter().cloned().collect();
        let replies = join_all(primaries.iter().map(|node| self.execute_on(node, cmd))).await;
        Ok(primaries.into_iter().zip(replies).collect())
    }

    /// Sends a command to every primary and adds up the integer replies.
    ///
    /// For commands whose cluster-wide answer is a total over the shards,
    /// such as `DBSIZE` and `WAIT`.
    ///
    /// # Errors
    ///
    /// Returns the first node's error, or `Protocol` if a node replies with
    /// something other than an integer.
    pub async fn broadcast_sum(&self, cmd: &Cmd) -> Result<i64> {
        let mut total = 0;
        for (node, reply) in self.broadcast(cmd).await? {
            match reply? {
                Frame::Integer(n) => total += n,
                other => {
                    return Err(Error::protocol(format!(
                        "{} replied {:?}, expected an integer",
                        node, other
                    )))
                }
            }
        }
        Ok(total)
    }

    /// Sends a command to every primary and joins the array replies.
    ///
    /// For commands whose cluster-wide answer is the union of each shard's,
    /// such as `KEYS`.
    ///
    /// # Errors
    ///
    /// Returns the first node's error, or `Protocol` if a node replies with
    /// something other than an array.
    pub async fn broadcast_concat(&self, cmd: &Cmd) -> Result<Vec<Frame>> {
        let mut items = Vec::new();
        for (node, reply) in self.broadcast(cmd).await? {
            match reply? {
                Frame::Array(part) => items.extend(part),
                Frame::Null => {}
                other => {
                    return Err(Error::protocol(format!(
                        "{} replied {:?}, expected an array",
                        node, other
                    )))
                }
            }
        }
        Ok(items)
    }

    /// Starts a cluster-wide SCAN.
    ///
    /// `pattern` and `count` are passed to every node as `MATCH` and `COUNT`.
    ///
    /// # Errors
    ///
    /// Returns `TopologyUnavailable` if the topology cannot be loaded.
    pub async fn scan(&self, pattern: Option<&str>, count: Option<usize>) -> Result<ClusterScan> {
        let snapshot = self.ready_snapshot().await?;
        Ok(ClusterScan::new(
            self.clone(),
            &snapshot,
            pattern.map(|p| Bytes::copy_from_slice(p.as_bytes())),
            count,
        ))
    }

    /// Continues a scan from a saved [`ScanState`].
    pub fn resume_scan(&self, state: ScanState) -> ClusterScan {
        ClusterScan::resume(self.clone(), state)
    }

    async fn ready_snapshot(&self) -> Result<Arc<Topology>> {
        let snapshot = self.inner.topology.snapshot();
        if !snapshot.is_empty() {
            return Ok(snapshot);
        }
        self.refresh_topology().await?;
        Ok(self.inner.topology.snapshot())
    }

    async fn run(&self, cmd: &Cmd, pinned: Option<NodeEndpoint>, deadline: Option<Instant>) -> Result<Frame> {
        let slot = if cmd.keys().next().is_some() {
            Some(validate_same_slot(cmd.keys())?)
        } else {
            None
        };
        let first_key = cmd.keys().next().cloned();
        let frame = cmd.to_frame();
        let read_only = cmd.is_read_only();

        let mut pending = PendingRetry::new(slot, deadline);
        pending.pinned = pinned;

        loop {
            // A key already moved by a running migration goes to its target.
            if pending.ask.is_none() && pending.pinned.is_none() {
                if let (Some(slot), Some(key)) = (pending.slot, first_key.as_ref()) {
                    pending.ask = self.inner.topology.ask_target(slot, key);
                }
            }

            pending.attempts += 1;
            let dispatched = match within(pending.deadline, self.dispatch(&pending, &frame, read_only)).await {
                Some(dispatched) => dispatched?,
                None => return Err(pending.timeout()),
            };
            pending.ask = None;

            let retry = match decide(&pending, dispatched.outcome, &self.inner.config.retry) {
                Action::Return(frame) => return Ok(frame),
                Action::Fail(e) => return Err(e),
                Action::Exhausted(last) => {
                    warn!(attempts = pending.dispatches(), error = %last, "retries exhausted");
                    return Err(pending.exhausted(last));
                }
                Action::Retry(retry) => retry,
            };
            debug!(
                attempt = pending.attempts,
                node = ?dispatched.node.as_ref().map(NodeEndpoint::address),
                cause = %retry.cause,
                "retrying command"
            );

            if !retry.consumes_attempt {
                pending.attempts -= 1;
                pending.free_redirects += 1;
            }
            if retry.unpin {
                pending.pinned = None;
            }

            match retry.target {
                RetryTarget::Route => {}
                RetryTarget::Moved { slot, address } => {
                    let node = self.resolve(&address)?;
                    self.inner.topology.mark_moved(slot, &node);
                    pending.slot = Some(slot);
                }
                RetryTarget::Ask { slot, address } => {
                    let node = self.resolve(&address)?;
                    if let Some(key) = &first_key {
                        self.inner.topology.record_ask(slot, key, &node);
                    }
                    pending.ask = Some(node);
                }
            }

            if retry.invalidate {
                if let Some(node) = &dispatched.node {
                    self.inner.pool.invalidate(&node.id).await;
                }
            }

            pending.last_error = Some(retry.cause);

            if retry.refresh {
                let seen = self.inner.refreshes.load(Ordering::Acquire);
                match within(pending.deadline, self.refresh_since(seen)).await {
                    Some(refreshed) => refreshed?,
                    None => return Err(pending.timeout()),
                }
            }
            if !retry.backoff.is_zero() && within(pending.deadline, sleep(retry.backoff)).await.is_none() {
                return Err(pending.timeout());
            }
        }
    }

    /// Picks the node for the next dispatch: an ASK target, the pinned node,
    /// the slot's owner, or any primary for keyless commands.
    async fn target(&self, pending: &PendingRetry, read_only: bool) -> Result<NodeEndpoint> {
        if let Some(node) = pending.ask.as_ref().or(pending.pinned.as_ref()) {
            return Ok(node.clone());
        }
        let prefer_replica = read_only && self.inner.config.read_from_replicas;

        for refreshed in [false, true] {
            if refreshed {
                let seen = self.inner.refreshes.load(Ordering::Acquire);
                self.refresh_since(seen).await?;
            }
            let found = match pending.slot {
                Some(slot) => self.inner.topology.route(slot, prefer_replica),
                None => self.any_primary(),
            };
            if let Some(node) = found {
                return Ok(node);
            }
        }
        Err(Error::TopologyUnavailable {
            message: match pending.slot {
                Some(slot) => format!("no node serves slot {}", slot),
                None => "no primary known".to_string(),
            },
        })
    }

    fn any_primary(&self) -> Option<NodeEndpoint> {
        let snapshot = self.inner.topology.snapshot();
        let primaries = snapshot.primaries();
        if primaries.is_empty() {
            return None;
        }
        let turn = self.inner.next_primary.fetch_add(1, Ordering::Relaxed);
        Some(primaries[turn % primaries.len()].clone())
    }

    /// Sends one attempt and classifies the result.
    ///
    /// Only topology failures are `Err`; everything that happened on the wire
    /// is an [`Outcome`].
    async fn dispatch(&self, pending: &PendingRetry, frame: &Frame, read_only: bool) -> Result<Dispatched> {
        let node = self.target(pending, read_only).await?;

        let mut conn = match self.inner.pool.acquire(&node).await {
            Ok(conn) => conn,
            Err(e) => {
                return Ok(Dispatched {
                    node: Some(node),
                    outcome: classify(Err(e)),
                })
            }
        };

        if pending.ask.is_some() {
            match conn.send(&asking().into_frame()).await {
                Ok(Frame::Error(e)) => {
                    return Ok(Dispatched {
                        node: Some(node),
                        outcome: classify(Ok(Frame::Error(e))),
                    })
                }
                Ok(_) => {}
                Err(e) => {
                    return Ok(Dispatched {
                        node: Some(node),
                        outcome: classify(Err(e)),
                    })
                }
            }
        }

        let outcome = classify(conn.send(frame).await);
        Ok(Dispatched {
            node: Some(node),
            outcome,
        })
    }

    /// Finds a redirect target in the topology, or makes an address-only
    /// endpoint for a node not seen yet.
    fn resolve(&self, address: &str) -> Result<NodeEndpoint> {
        let snapshot = self.inner.topology.snapshot();
        match snapshot.node_by_address(address) {
            Some(node) => Ok(node.clone()),
            None => NodeEndpoint::from_address(address, NodeRole::Primary),
        }
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.inner.pool.close_all().await;
    }

    /// Gets a string value from Redis.
    ///
    /// # Returns
    ///
    /// Returns the value if the key exists, or None if the key does not exist.
    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        match self.execute(&command::get(key)).await? {
            Frame::BulkString(data) => Ok(data),
            Frame::Null => Ok(None),
            _ => Err(Error::protocol("unexpected response type for GET")),
        }
    }

    /// Sets a string value in Redis.
    pub async fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        self.execute(&command::set(key, value)).await?;
        Ok(())
    }

    /// Deletes keys that share a slot.
    ///
    /// # Returns
    ///
    /// Returns the number of keys removed.
    pub async fn del<K: Into<Bytes>>(&self, keys: impl IntoIterator<Item = K>) -> Result<i64> {
        self.integer(&command::del(keys)).await
    }

    /// Counts how many of the given keys exist. The keys must share a slot.
    pub async fn exists<K: Into<Bytes>>(&self, keys: impl IntoIterator<Item = K>) -> Result<i64> {
        self.integer(&command::exists(keys)).await
    }

    /// Counts the keys of the whole cluster.
    pub async fn dbsize(&self) -> Result<i64> {
        self.broadcast_sum(&command::dbsize()).await
    }

    /// Lists every key matching `pattern`, on all primaries.
    ///
    /// Blocks each node for a full keyspace walk; prefer [`scan`](Self::scan)
    /// on large clusters.
    pub async fn keys(&self, pattern: impl Into<Bytes>) -> Result<Vec<Bytes>> {
        self.broadcast_concat(&command::keys(pattern))
            .await?
            .into_iter()
            .map(|frame| match frame {
                Frame::BulkString(Some(key)) => Ok(key),
                _ => Err(Error::protocol("unexpected KEYS entry, expected a bulk string")),
            })
            .collect()
    }

    /// Waits for replication of earlier writes on every primary.
    ///
    /// # Returns
    ///
    /// Returns the number of acknowledging replicas, summed over the primaries.
    pub async fn wait(&self, numreplicas: u64, timeout_ms: u64) -> Result<i64> {
        self.broadcast_sum(&command::wait(numreplicas, timeout_ms)).await
    }

    async fn integer(&self, cmd: &Cmd) -> Result<i64> {
        match self.execute(cmd).await? {
            Frame::Integer(n) => Ok(n),
            _ => Err(Error::protocol("unexpected response type, expected integer")),
        }
    }
}

/// Runs `fut` until `deadline`; `None` means the deadline passed first.
async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("config", &self.inner.config)
            .field("epoch", &self.inner.topology.epoch())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{key_slot, Migration};
    use crate::testing::MockCluster;
    use std::time::Duration;

    const NODES: [&str; 3] = ["127.0.0.1:7000", "127.0.0.1:7001", "127.0.0.1:7002"];

    fn builder(mock: &MockCluster) -> ClusterClientBuilder {
        ClusterClientBuilder::new()
            .seed(NODES[0])
            .connector(mock.connector())
            .backoff(Duration::from_millis(1), Duration::from_millis(5))
    }

    async fn client_for(mock: &MockCluster) -> ClusterClient {
        builder(mock).build().await.unwrap()
    }

    fn topology_queries(mock: &MockCluster) -> usize {
        mock.commands()
            .iter()
            .filter(|c| c.args[0] == "CLUSTER" && c.args[1] == "SLOTS")
            .count()
    }

    #[tokio::test]
    async fn test_bootstrap_discovers_all_nodes() {
        let mock = MockCluster::new(&NODES);
        let client = client_for(&mock).await;
        assert_eq!(client.node_count(), 3);
        assert!(client.is_fully_covered());
        assert_eq!(client.topology().epoch(), 1);
    }

    #[tokio::test]
    async fn test_set_and_get_route_to_owner() {
        let mock = MockCluster::new(&NODES);
        let client = client_for(&mock).await;

        client.set("foo", "bar").await.unwrap();
        assert_eq!(client.get("foo").await.unwrap(), Some(Bytes::from("bar")));
        assert_eq!(client.get("missing").await.unwrap(), None);

        // slot 12182 lives on the third node
        assert_eq!(mock.commands_on(NODES[2], "SET").len(), 1);
        assert_eq!(mock.commands_on(NODES[2], "GET").len(), 1);
    }

    #[tokio::test]
    async fn test_cross_slot_rejected_before_sending() {
        let mock = MockCluster::new(&NODES);
        let client = builder(&mock).build_lazy().unwrap();

        let err = client.del(["foo", "bar"]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::CrossSlot {
                slots: Some((12182, 5061))
            }
        ));
        assert_eq!(mock.connects(), 0);
        assert!(mock.commands().is_empty());
    }

    #[tokio::test]
    async fn test_hash_tagged_keys_share_a_node() {
        let mock = MockCluster::new(&NODES);
        let client = client_for(&mock).await;

        client
            .execute(&command::mset([("{user:1}:name", "alice"), ("{user:1}:email", "a@x")]))
            .await
            .unwrap();
        assert_eq!(client.exists(["{user:1}:name", "{user:1}:email"]).await.unwrap(), 2);
        assert_eq!(client.del(["{user:1}:name", "{user:1}:email"]).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_moved_updates_map_without_refresh() {
        let mock = MockCluster::new(&NODES);
        let client = client_for(&mock).await;
        assert_eq!(key_slot("mykey"), 14687);

        // The slot moves to a node the client has never seen.
        mock.add_node("10.0.0.2:7002", "node-new");
        mock.assign(14687, 14687, "10.0.0.2:7002");
        mock.insert("mykey", "bar");
        mock.clear_log();

        assert_eq!(client.get("mykey").await.unwrap(), Some(Bytes::from("bar")));
        assert_eq!(
            client.topology().owner(14687).map(NodeEndpoint::address),
            Some("10.0.0.2:7002".to_string())
        );
        assert_eq!(topology_queries(&mock), 0);
        let gets: Vec<String> = mock.data_commands().into_iter().map(|c| c.address).collect();
        assert_eq!(gets, [NODES[2], "10.0.0.2:7002"]);

        // The next call goes straight to the new owner.
        mock.clear_log();
        client.get("mykey").await.unwrap();
        let gets: Vec<String> = mock.data_commands().into_iter().map(|c| c.address).collect();
        assert_eq!(gets, ["10.0.0.2:7002"]);
    }

    #[tokio::test]
    async fn test_moved_counts_against_budget() {
        let mock = MockCluster::new(&NODES);
        let client = builder(&mock).max_attempts(1).build().await.unwrap();
        mock.assign(14687, 14687, NODES[0]);

        let err = client.get("mykey").await.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 1, .. }));
        assert!(matches!(err.last_error(), Some(Error::Moved { slot: 14687, .. })));
    }

    #[tokio::test]
    async fn test_free_moved_does_not_consume_attempt() {
        let mock = MockCluster::new(&NODES);
        let client = builder(&mock)
            .max_attempts(1)
            .moved_consumes_attempt(false)
            .build()
            .await
            .unwrap();
        mock.assign(14687, 14687, NODES[0]);
        mock.insert("mykey", "v");

        assert_eq!(client.get("mykey").await.unwrap(), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn test_ask_sends_asking_on_same_connection() {
        let mock = MockCluster::new(&NODES);
        let client = client_for(&mock).await;

        // "foo" (12182) is migrating from the third node to the first and
        // has already been moved.
        mock.set_migrating(12182, NODES[0]);
        mock.insert_on(NODES[0], "foo", "bar");
        mock.clear_log();

        assert_eq!(client.get("foo").await.unwrap(), Some(Bytes::from("bar")));

        let log = mock.commands();
        assert_eq!(log.len(), 3);
        assert_eq!((log[0].address.as_str(), log[0].args[0].as_str()), (NODES[2], "GET"));
        assert_eq!((log[1].address.as_str(), log[1].args[0].as_str()), (NODES[0], "ASKING"));
        assert_eq!((log[2].address.as_str(), log[2].args[0].as_str()), (NODES[0], "GET"));
        assert_eq!(log[1].connection, log[2].connection);

        // ASK never changes ownership.
        assert_eq!(
            client.topology().owner(12182).map(NodeEndpoint::address),
            Some(NODES[2].to_string())
        );
    }

    #[tokio::test]
    async fn test_moved_key_goes_straight_to_migration_target() {
        let mock = MockCluster::new(&NODES);
        let client = client_for(&mock).await;
        mock.set_migrating(12182, NODES[0]);
        mock.insert_on(NODES[0], "foo", "bar");
        mock.insert("{foo}:other", "x");

        assert_eq!(client.get("foo").await.unwrap(), Some(Bytes::from("bar")));
        match client.topology().migration(12182) {
            Some(Migration::Migrating { target }) => assert_eq!(target.address(), NODES[0]),
            other => panic!("expected a migrating marker, got {other:?}"),
        }

        // The ASK is remembered: no detour through the owner.
        mock.clear_log();
        assert_eq!(client.get("foo").await.unwrap(), Some(Bytes::from("bar")));
        let log: Vec<(String, String)> = mock
            .commands()
            .into_iter()
            .map(|c| (c.address, c.args[0].clone()))
            .collect();
        assert_eq!(
            log,
            [
                (NODES[0].to_string(), "ASKING".to_string()),
                (NODES[0].to_string(), "GET".to_string())
            ]
        );

        // Other keys of the slot still go to the owner first.
        mock.clear_log();
        assert_eq!(client.get("{foo}:other").await.unwrap(), Some(Bytes::from("x")));
        let gets: Vec<String> = mock.data_commands().into_iter().map(|c| c.address).collect();
        assert_eq!(gets, [NODES[2]]);
    }

    #[tokio::test]
    async fn test_finished_migration_stops_asking() {
        let mock = MockCluster::new(&NODES);
        let client = client_for(&mock).await;
        mock.set_migrating(12182, NODES[0]);
        mock.insert_on(NODES[0], "foo", "bar");
        client.get("foo").await.unwrap();

        // The slot moves for good; the next refresh has no marker.
        mock.assign(12182, 12182, NODES[0]);
        mock.clear_migrating(12182);
        client.refresh_topology().await.unwrap();
        assert!(client.topology().migration(12182).is_none());

        mock.clear_log();
        assert_eq!(client.get("foo").await.unwrap(), Some(Bytes::from("bar")));
        assert!(mock.commands_on(NODES[0], "ASKING").is_empty());
        assert_eq!(mock.commands_on(NODES[0], "GET").len(), 1);
    }

    #[tokio::test]
    async fn test_tryagain_exhausts_budget() {
        let mock = MockCluster::new(&NODES);
        let client = builder(&mock).max_attempts(3).build().await.unwrap();
        for _ in 0..5 {
            mock.script(NODES[2], Frame::error("TRYAGAIN Multiple keys request during rehashing of slot"));
        }

        let err = client.get("foo").await.unwrap_err();
        match err {
            Error::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, Error::TryAgain { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(mock.commands_on(NODES[2], "GET").len(), 3);
    }

    #[tokio::test]
    async fn test_tryagain_then_success() {
        let mock = MockCluster::new(&NODES);
        let client = client_for(&mock).await;
        mock.insert("foo", "bar");
        mock.script(NODES[2], Frame::error("TRYAGAIN"));

        assert_eq!(client.get("foo").await.unwrap(), Some(Bytes::from("bar")));
        assert_eq!(mock.commands_on(NODES[2], "GET").len(), 2);
    }

    #[tokio::test]
    async fn test_clusterdown_refreshes_topology() {
        let mock = MockCluster::new(&NODES);
        let client = client_for(&mock).await;
        mock.insert("foo", "bar");
        mock.script(NODES[2], Frame::error("CLUSTERDOWN The cluster is down"));
        mock.clear_log();

        assert_eq!(client.get("foo").await.unwrap(), Some(Bytes::from("bar")));
        assert_eq!(topology_queries(&mock), 1);
        assert_eq!(client.topology().epoch(), 2);
    }

    #[tokio::test]
    async fn test_transport_failure_fails_over() {
        let mock = MockCluster::new(&NODES);
        let client = client_for(&mock).await;
        mock.insert("foo", "bar");
        assert_eq!(client.get("foo").await.unwrap(), Some(Bytes::from("bar")));

        mock.fail_over(NODES[2], NODES[1]);

        assert_eq!(client.get("foo").await.unwrap(), Some(Bytes::from("bar")));
        assert_eq!(
            client.topology().owner(12182).map(NodeEndpoint::address),
            Some(NODES[1].to_string())
        );
    }

    #[tokio::test]
    async fn test_server_error_passes_through() {
        let mock = MockCluster::new(&NODES);
        let client = client_for(&mock).await;
        let message = "WRONGTYPE Operation against a key holding the wrong kind of value";
        mock.script(NODES[2], Frame::error(message));

        let err = client.get("foo").await.unwrap_err();
        match err {
            Error::Server { message: got } => assert_eq!(got, message),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(mock.commands_on(NODES[2], "GET").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_the_call() {
        let mock = MockCluster::new(&NODES);
        let client = builder(&mock)
            .command_timeout(Some(Duration::from_millis(100)))
            .build()
            .await
            .unwrap();
        mock.set_delay(NODES[2], Duration::from_secs(10));

        let err = client.get("foo").await.unwrap_err();
        assert!(matches!(err, Error::Timeout { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_keyless_command_and_broadcast() {
        let mock = MockCluster::new(&NODES);
        let client = client_for(&mock).await;
        for i in 0..30 {
            mock.insert(format!("k{}", i), "v");
        }

        assert_eq!(
            client.execute(&Cmd::new("PING")).await.unwrap(),
            Frame::simple("PONG")
        );

        let replies = client.broadcast(&Cmd::new("DBSIZE")).await.unwrap();
        assert_eq!(replies.len(), 3);
        let total: i64 = replies
            .iter()
            .map(|(_, reply)| reply.as_ref().unwrap().as_integer().unwrap())
            .sum();
        assert_eq!(total, 30);
    }

    #[tokio::test]
    async fn test_execute_on_pins_node() {
        let mock = MockCluster::new(&NODES);
        let client = client_for(&mock).await;
        let node = client.topology().node_by_address(NODES[1]).unwrap().clone();

        client.execute_on(&node, &Cmd::new("DBSIZE")).await.unwrap();
        assert_eq!(mock.commands_on(NODES[1], "DBSIZE").len(), 1);
    }

    #[tokio::test]
    async fn test_execute_on_keyed_command_follows_failover() {
        let mock = MockCluster::new(&NODES);
        let client = client_for(&mock).await;
        mock.insert("foo", "bar");
        let node = client.topology().node_by_address(NODES[2]).unwrap().clone();

        mock.fail_over(NODES[2], NODES[1]);
        mock.clear_log();

        let reply = client.execute_on(&node, &command::get("foo")).await.unwrap();
        assert_eq!(reply, Frame::bulk("bar"));
        assert_eq!(topology_queries(&mock), 1);
        assert_eq!(mock.commands_on(NODES[1], "GET").len(), 1);
    }

    #[tokio::test]
    async fn test_execute_on_keyless_command_fails_fast() {
        let mock = MockCluster::new(&NODES);
        let client = client_for(&mock).await;
        let node = client.topology().node_by_address(NODES[2]).unwrap().clone();
        mock.set_down(NODES[2], true);
        mock.clear_log();

        let err = client.execute_on(&node, &Cmd::new("DBSIZE")).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(topology_queries(&mock), 0);
    }

    #[tokio::test]
    async fn test_cluster_wide_aggregates() {
        let mock = MockCluster::new(&NODES);
        for (i, primary) in NODES.iter().enumerate() {
            mock.add_replica(primary, &format!("127.0.0.1:710{}", i), &format!("replica-{}", i));
        }
        let client = client_for(&mock).await;
        for key in ["user:1", "user:2", "user:3", "session:1"] {
            mock.insert(key, "v");
        }

        assert_eq!(client.wait(1, 100).await.unwrap(), 3);
        assert_eq!(client.dbsize().await.unwrap(), 4);

        let mut users = client.keys("user:*").await.unwrap();
        users.sort();
        assert_eq!(users, ["user:1", "user:2", "user:3"]);

        // One failing primary fails the aggregate.
        mock.script(NODES[1], Frame::error("ERR boom"));
        let err = client.dbsize().await.unwrap_err();
        assert!(matches!(err, Error::Server { .. }));
    }

    #[tokio::test]
    async fn test_reads_from_replicas() {
        let mock = MockCluster::new(&NODES);
        mock.add_replica(NODES[2], "127.0.0.1:7102", "replica-2");
        let client = builder(&mock).read_from_replicas(true).build().await.unwrap();

        client.set("foo", "bar").await.unwrap();
        assert_eq!(client.get("foo").await.unwrap(), Some(Bytes::from("bar")));

        assert_eq!(mock.commands_on(NODES[2], "SET").len(), 1);
        assert_eq!(mock.commands_on("127.0.0.1:7102", "READONLY").len(), 1);
        assert_eq!(mock.commands_on("127.0.0.1:7102", "GET").len(), 1);
    }

    #[tokio::test]
    async fn test_cluster_disabled_uses_single_node() {
        let mock = MockCluster::new(&["127.0.0.1:6379"]);
        mock.set_cluster_disabled(true);
        let client = ClusterClientBuilder::new()
            .seed("127.0.0.1:6379")
            .connector(mock.connector())
            .build()
            .await
            .unwrap();

        assert_eq!(client.node_count(), 1);
        assert!(client.is_fully_covered());
        client.set("a", "1").await.unwrap();
        client.set("b", "2").await.unwrap();
        assert_eq!(client.get("b").await.unwrap(), Some(Bytes::from("2")));
    }

    #[tokio::test]
    async fn test_no_reachable_seed() {
        let mock = MockCluster::new(&NODES);
        for node in NODES {
            mock.set_down(node, true);
        }
        let err = builder(&mock).build().await.unwrap_err();
        assert!(matches!(err, Error::TopologyUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_cluster_recovers() {
        let mock = MockCluster::new(&NODES);
        for node in NODES {
            mock.set_down(node, true);
        }
        let client = builder(&mock).build_lazy().unwrap();

        let err = client.get("foo").await.unwrap_err();
        assert!(matches!(err, Error::TopologyUnavailable { .. }));

        for node in NODES {
            mock.set_down(node, false);
        }
        assert_eq!(client.get("foo").await.unwrap(), None);
        assert_eq!(client.node_count(), 3);
    }

    #[tokio::test]
    async fn test_refresh_drops_connections_to_unknown_nodes() {
        let mock = MockCluster::new(&NODES);
        let client = client_for(&mock).await;
        mock.add_node("10.0.0.2:7002", "node-new");
        mock.assign(14687, 14687, "10.0.0.2:7002");
        mock.insert("mykey", "bar");

        // Known only by the redirect's address until the next refresh.
        client.get("mykey").await.unwrap();
        let by_address = NodeId::new("10.0.0.2:7002");
        assert_eq!(client.inner.pool.idle_count(&by_address).await, 1);

        client.refresh_topology().await.unwrap();
        assert_eq!(client.inner.pool.idle_count(&by_address).await, 0);
        assert_eq!(client.topology().owner(14687).unwrap().id.as_str(), "node-new");

        client.get("mykey").await.unwrap();
        assert_eq!(client.inner.pool.idle_count(&NodeId::new("node-new")).await, 1);
    }

    #[tokio::test]
    async fn test_lazy_client_loads_topology_on_first_use() {
        let mock = MockCluster::new(&NODES);
        let client = builder(&mock).build_lazy().unwrap();
        assert_eq!(client.node_count(), 0);

        client.set("foo", "bar").await.unwrap();
        assert_eq!(client.node_count(), 3);
        assert_eq!(topology_queries(&mock), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_coalesce() {
        let mock = MockCluster::new(&NODES);
        let client = client_for(&mock).await;
        for node in NODES {
            mock.set_delay(node, Duration::from_millis(20));
        }
        mock.clear_log();

        let (a, b, c) = tokio::join!(
            client.refresh_topology(),
            client.refresh_topology(),
            client.refresh_topology()
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(topology_queries(&mock), 1);
        assert_eq!(client.topology().epoch(), 2);
    }
}
