//! Cluster topology data structures and parsers.
//!
//! A [`Topology`] is an immutable snapshot mapping every hash slot to the
//! shard that owns it (one primary plus replicas), along with MIGRATING and
//! IMPORTING markers. [`TopologyMap`] holds the current snapshot behind an
//! atomic pointer: readers never block, and every change, including a
//! single-slot MOVED update, publishes a whole new snapshot.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use bytes::Bytes;

use crate::core::{Error, Result};
use crate::proto::frame::Frame;

use super::slot::SLOT_COUNT;

/// Unique identifier for a Redis node in the cluster.
///
/// Node IDs are 40-character hex strings assigned by Redis. Nodes known only
/// by address (seeds, redirect targets not yet in the map) use the address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a new NodeId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the node ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a node within its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// Owns slots and accepts writes.
    Primary,
    /// Copies a primary; serves reads after `READONLY`.
    Replica,
}

/// Where a node lives and what it does.
///
/// Identity is the node id; host and port may change across refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeEndpoint {
    /// Node id.
    pub id: NodeId,
    /// Hostname or IP, without brackets for IPv6.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Primary or replica.
    pub role: NodeRole,
}

impl NodeEndpoint {
    /// Creates an endpoint with an explicit node id.
    pub fn new(id: impl Into<NodeId>, host: impl Into<String>, port: u16, role: NodeRole) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            role,
        }
    }

    /// Creates an endpoint known only by its `host:port` address.
    ///
    /// The address doubles as the node id until a refresh reveals the real one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the address has no valid port.
    pub fn from_address(address: &str, role: NodeRole) -> Result<Self> {
        let (host, port) = split_address(address).ok_or_else(|| Error::InvalidArgument {
            message: format!("invalid node address: {}", address),
        })?;
        Ok(Self {
            id: NodeId::new(address),
            host,
            port,
            role,
        })
    }

    /// Returns `host:port`, bracketing IPv6 hosts.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Returns true if both endpoints name the same node, by id or address.
    pub fn same_node(&self, other: &NodeEndpoint) -> bool {
        self.id == other.id || (self.host == other.host && self.port == other.port)
    }

    fn with_role(mut self, role: NodeRole) -> Self {
        self.role = role;
        self
    }
}

impl fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())
    }
}

fn split_address(address: &str) -> Option<(String, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some((host.to_string(), port))
}

/// Flags indicating the role and state of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeFlags {
    /// Node is a master
    pub master: bool,
    /// Node is a replica
    pub slave: bool,
    /// Node is myself (the current connection)
    pub myself: bool,
    /// Node is in PFAIL state (possibly failing)
    pub pfail: bool,
    /// Node is in FAIL state (confirmed failed)
    pub fail: bool,
    /// Node is a new node, not yet properly configured
    pub handshake: bool,
    /// Node has no known address
    pub noaddr: bool,
}

impl NodeFlags {
    /// Parses node flags from a comma-separated string.
    ///
    /// # Examples
    ///
    /// ```
    /// # use slotwise::cluster::NodeFlags;
    /// let flags = NodeFlags::parse("master,myself");
    /// assert!(flags.master);
    /// assert!(flags.myself);
    /// assert!(!flags.slave);
    /// ```
    pub fn parse(flags_str: &str) -> Self {
        let mut flags = Self::default();
        for flag in flags_str.split(',') {
            match flag.trim() {
                "master" => flags.master = true,
                "slave" => flags.slave = true,
                "myself" => flags.myself = true,
                "fail?" | "pfail" => flags.pfail = true,
                "fail" => flags.fail = true,
                "handshake" => flags.handshake = true,
                "noaddr" => flags.noaddr = true,
                _ => {}
            }
        }
        flags
    }

    /// Returns true if the node can currently serve traffic.
    pub fn is_available(&self) -> bool {
        !self.fail && !self.pfail && !self.handshake && !self.noaddr
    }
}

/// One line of a `CLUSTER NODES` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node ID (40-character hex string)
    pub id: NodeId,
    /// Network address (host:port), without the cluster bus port
    pub address: String,
    /// Node flags (master, replica, myself, etc.)
    pub flags: NodeFlags,
    /// Master node ID (for replicas)
    pub master_id: Option<NodeId>,
    /// Configuration epoch
    pub config_epoch: u64,
    /// Slot ranges assigned to this node
    pub slots: Vec<(u16, u16)>,
    /// Slots this node is handing over, with the receiving node
    pub migrating: Vec<(u16, NodeId)>,
    /// Slots this node is receiving, with the node handing them over
    pub importing: Vec<(u16, NodeId)>,
}

impl NodeInfo {
    /// Parses one `CLUSTER NODES` line.
    ///
    /// Format: `<id> <ip:port@cport[,hostname]> <flags> <master> <ping-sent>
    /// <pong-recv> <config-epoch> <link-state> <slot> <slot> ...` where a slot
    /// entry is `N`, `N-M`, `[N->-target]` or `[N-<-source]`.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the line has fewer than 8 fields or a slot
    /// entry is malformed.
    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(Error::protocol(format!(
                "CLUSTER NODES line has {} fields: {}",
                fields.len(),
                line
            )));
        }

        let address = fields[1]
            .split(&['@', ','][..])
            .next()
            .unwrap_or_default()
            .to_string();
        let master_id = match fields[3] {
            "-" => None,
            id => Some(NodeId::new(id)),
        };

        let mut info = NodeInfo {
            id: NodeId::new(fields[0]),
            address,
            flags: NodeFlags::parse(fields[2]),
            master_id,
            config_epoch: fields[6].parse().unwrap_or(0),
            slots: Vec::new(),
            migrating: Vec::new(),
            importing: Vec::new(),
        };

        for entry in &fields[8..] {
            if let Some(marker) = entry.strip_prefix('[').and_then(|e| e.strip_suffix(']')) {
                if let Some((slot, target)) = marker.split_once("->-") {
                    info.migrating.push((parse_slot(slot)?, NodeId::new(target)));
                } else if let Some((slot, source)) = marker.split_once("-<-") {
                    info.importing.push((parse_slot(slot)?, NodeId::new(source)));
                } else {
                    return Err(Error::protocol(format!("invalid slot marker: {}", entry)));
                }
            } else if let Some((start, end)) = entry.split_once('-') {
                info.slots.push((parse_slot(start)?, parse_slot(end)?));
            } else {
                let slot = parse_slot(entry)?;
                info.slots.push((slot, slot));
            }
        }

        Ok(info)
    }

    /// Returns true if this node is a master.
    pub fn is_master(&self) -> bool {
        self.flags.master
    }

    /// Returns true if this node is a replica.
    pub fn is_replica(&self) -> bool {
        self.flags.slave
    }

    fn endpoint(&self, role: NodeRole) -> Option<NodeEndpoint> {
        let (host, port) = split_address(&self.address)?;
        if host.is_empty() || port == 0 {
            return None;
        }
        Some(NodeEndpoint::new(self.id.clone(), host, port, role))
    }
}

/// Parses a whole `CLUSTER NODES` reply body.
///
/// # Errors
///
/// Returns a protocol error if any non-empty line is malformed.
pub fn parse_cluster_nodes(text: &str) -> Result<Vec<NodeInfo>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(NodeInfo::parse)
        .collect()
}

fn parse_slot(s: &str) -> Result<u16> {
    s.parse::<u16>()
        .ok()
        .filter(|slot| *slot < SLOT_COUNT)
        .ok_or_else(|| Error::protocol(format!("invalid slot: {}", s)))
}

/// A range of hash slots and the shard serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    /// Start of the slot range (inclusive)
    pub start: u16,
    /// End of the slot range (inclusive)
    pub end: u16,
    /// Primary node serving this slot range
    pub primary: NodeEndpoint,
    /// Replica nodes for this slot range
    pub replicas: Vec<NodeEndpoint>,
}

impl SlotRange {
    /// Returns true if the given slot is within this range.
    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Returns the number of slots in this range.
    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    /// Returns true if this range is empty (invalid).
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Migration state of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Migration {
    /// The owner is handing the slot to `target`.
    Migrating {
        /// Node receiving the slot.
        target: NodeEndpoint,
    },
    /// The slot is arriving from `source`.
    Importing {
        /// Node handing the slot over.
        source: NodeEndpoint,
    },
}

#[derive(Debug, Clone)]
struct Shard {
    primary: NodeEndpoint,
    replicas: Vec<NodeEndpoint>,
}

/// Immutable view of the cluster: slot owners, replicas and migrations.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Shard index per slot.
    slots: Vec<Option<u16>>,
    shards: Vec<Shard>,
    migrations: HashMap<u16, Migration>,
    epoch: u64,
}

impl Topology {
    /// Creates a topology that knows no owner for any slot.
    pub fn empty() -> Self {
        Self {
            slots: vec![None; SLOT_COUNT as usize],
            shards: Vec::new(),
            migrations: HashMap::new(),
            epoch: 0,
        }
    }

    /// Builds a topology from slot ranges.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for a range outside `0..16384` or with
    /// `start > end`.
    pub fn from_ranges(ranges: Vec<SlotRange>) -> Result<Self> {
        let mut topology = Self::empty();
        for range in ranges {
            if range.is_empty() || range.end >= SLOT_COUNT {
                return Err(Error::protocol(format!(
                    "invalid slot range {}-{}",
                    range.start, range.end
                )));
            }
            let index = topology.shard_index(range.primary, range.replicas);
            for slot in range.start..=range.end {
                topology.slots[slot as usize] = Some(index);
            }
        }
        Ok(topology)
    }

    /// The degenerate cluster: one node owning every slot.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the address is malformed.
    pub fn single_node(address: &str) -> Result<Self> {
        let primary = NodeEndpoint::from_address(address, NodeRole::Primary)?;
        Self::from_ranges(vec![SlotRange {
            start: 0,
            end: SLOT_COUNT - 1,
            primary,
            replicas: Vec::new(),
        }])
    }

    /// Parses cluster topology from a CLUSTER SLOTS response.
    ///
    /// Each entry is `[start, end, [ip, port, id?, ...], replicas...]`. A
    /// node without an id is identified by its address.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the reply is not an array or an entry is
    /// malformed.
    pub fn from_cluster_slots(frame: Frame) -> Result<Self> {
        let entries = match frame {
            Frame::Array(arr) => arr,
            _ => return Err(Error::protocol("CLUSTER SLOTS response must be an array")),
        };

        let mut ranges = Vec::with_capacity(entries.len());
        for entry in entries {
            let parts = match entry {
                Frame::Array(arr) if arr.len() >= 3 => arr,
                _ => return Err(Error::protocol("CLUSTER SLOTS entry must be an array of 3+")),
            };

            let start = slot_from_frame(&parts[0])?;
            let end = slot_from_frame(&parts[1])?;
            let primary = Self::parse_node_from_array(&parts[2], NodeRole::Primary)?;
            let replicas = parts[3..]
                .iter()
                .filter_map(|f| Self::parse_node_from_array(f, NodeRole::Replica).ok())
                .collect();

            ranges.push(SlotRange {
                start,
                end,
                primary,
                replicas,
            });
        }

        Self::from_ranges(ranges)
    }

    fn parse_node_from_array(frame: &Frame, role: NodeRole) -> Result<NodeEndpoint> {
        let node_arr = match frame {
            Frame::Array(arr) if arr.len() >= 2 => arr,
            _ => return Err(Error::protocol("node info must be an array of 2+")),
        };

        let host = node_arr[0]
            .as_text()
            .filter(|h| !h.is_empty() && h != "?")
            .ok_or_else(|| Error::protocol("node host must be a non-empty string"))?;
        let port = node_arr[1]
            .as_integer()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| Error::protocol("node port must be an integer"))?;

        let mut endpoint = NodeEndpoint::new(NodeId::new(""), host, port, role);
        endpoint.id = match node_arr.get(2).and_then(Frame::as_text) {
            Some(id) if !id.is_empty() => NodeId::new(id),
            _ => NodeId::new(endpoint.address()),
        };
        Ok(endpoint)
    }

    /// Builds a topology from parsed `CLUSTER NODES` lines.
    ///
    /// Failed or address-less nodes are left out. Migration markers are
    /// applied as well.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a slot range is invalid.
    pub fn from_cluster_nodes(nodes: &[NodeInfo]) -> Result<Self> {
        let mut ranges = Vec::new();
        for master in nodes
            .iter()
            .filter(|n| n.is_master() && n.flags.is_available())
        {
            let primary = match master.endpoint(NodeRole::Primary) {
                Some(endpoint) => endpoint,
                None => continue,
            };
            let replicas: Vec<NodeEndpoint> = nodes
                .iter()
                .filter(|n| {
                    n.is_replica()
                        && n.flags.is_available()
                        && n.master_id.as_ref() == Some(&master.id)
                })
                .filter_map(|n| n.endpoint(NodeRole::Replica))
                .collect();
            for &(start, end) in &master.slots {
                ranges.push(SlotRange {
                    start,
                    end,
                    primary: primary.clone(),
                    replicas: replicas.clone(),
                });
            }
        }

        let mut topology = Self::from_ranges(ranges)?;
        topology.apply_migrations(nodes);
        Ok(topology)
    }

    /// Records the MIGRATING and IMPORTING markers found in `CLUSTER NODES`.
    ///
    /// Markers naming a node with no usable address are skipped.
    pub fn apply_migrations(&mut self, nodes: &[NodeInfo]) {
        let by_id: HashMap<&NodeId, &NodeInfo> = nodes.iter().map(|n| (&n.id, n)).collect();
        let lookup = |id: &NodeId| by_id.get(id).and_then(|n| n.endpoint(NodeRole::Primary));

        for node in nodes {
            for (slot, target) in &node.migrating {
                if let Some(target) = lookup(target) {
                    self.migrations
                        .insert(*slot, Migration::Migrating { target });
                }
            }
            for (slot, source) in &node.importing {
                if let Some(source) = lookup(source) {
                    self.migrations
                        .insert(*slot, Migration::Importing { source });
                }
            }
        }
    }

    fn shard_index(&mut self, primary: NodeEndpoint, replicas: Vec<NodeEndpoint>) -> u16 {
        if let Some(index) = self.shards.iter().position(|s| s.primary.id == primary.id) {
            let shard = &mut self.shards[index];
            for replica in replicas {
                if !shard.replicas.iter().any(|r| r.id == replica.id) {
                    shard.replicas.push(replica);
                }
            }
            return index as u16;
        }
        self.shards.push(Shard { primary, replicas });
        (self.shards.len() - 1) as u16
    }

    fn shard(&self, slot: u16) -> Option<&Shard> {
        let index = (*self.slots.get(slot as usize)?)?;
        self.shards.get(index as usize)
    }

    /// Returns the primary owning `slot`.
    pub fn owner(&self, slot: u16) -> Option<&NodeEndpoint> {
        self.shard(slot).map(|s| &s.primary)
    }

    /// Returns the replicas of the shard owning `slot`.
    pub fn replicas(&self, slot: u16) -> &[NodeEndpoint] {
        self.shard(slot).map(|s| s.replicas.as_slice()).unwrap_or(&[])
    }

    /// Returns the migration marker on `slot`, if any.
    pub fn migration(&self, slot: u16) -> Option<&Migration> {
        self.migrations.get(&slot)
    }

    /// Returns the slot ranges in ascending order, merging adjacent slots
    /// owned by the same shard.
    pub fn ranges(&self) -> Vec<SlotRange> {
        let mut ranges: Vec<SlotRange> = Vec::new();
        let mut current: Option<(u16, u16, u16)> = None;

        let close = |run: (u16, u16, u16), ranges: &mut Vec<SlotRange>| {
            let shard = &self.shards[run.2 as usize];
            ranges.push(SlotRange {
                start: run.0,
                end: run.1,
                primary: shard.primary.clone(),
                replicas: shard.replicas.clone(),
            });
        };

        for (slot, owner) in self.slots.iter().enumerate() {
            let slot = slot as u16;
            match (current, owner) {
                (Some((start, end, index)), Some(o)) if *o == index && end + 1 == slot => {
                    current = Some((start, slot, index));
                }
                (run, owner) => {
                    if let Some(run) = run {
                        close(run, &mut ranges);
                    }
                    current = owner.map(|o| (slot, slot, o));
                }
            }
        }
        if let Some(run) = current {
            close(run, &mut ranges);
        }
        ranges
    }

    /// Returns every primary that owns at least one slot, in shard order.
    pub fn primaries(&self) -> Vec<&NodeEndpoint> {
        let mut owning = vec![false; self.shards.len()];
        for index in self.slots.iter().flatten() {
            owning[*index as usize] = true;
        }
        self.shards
            .iter()
            .zip(owning)
            .filter(|(_, owns)| *owns)
            .map(|(shard, _)| &shard.primary)
            .collect()
    }

    /// Returns the slots whose owner is `node`.
    pub fn slots_owned_by(&self, node: &NodeId) -> Vec<u16> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, index)| {
                let shard = &self.shards[(*index)? as usize];
                (shard.primary.id == *node).then_some(slot as u16)
            })
            .collect()
    }

    /// Iterates over every known endpoint, primaries first.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeEndpoint> {
        self.shards
            .iter()
            .map(|s| &s.primary)
            .chain(self.shards.iter().flat_map(|s| s.replicas.iter()))
    }

    /// Finds a known node by id.
    pub fn node(&self, id: &NodeId) -> Option<&NodeEndpoint> {
        self.nodes().find(|n| n.id == *id)
    }

    /// Finds a known node by `host:port`.
    pub fn node_by_address(&self, address: &str) -> Option<&NodeEndpoint> {
        let (host, port) = split_address(address)?;
        self.nodes().find(|n| n.host == host && n.port == port)
    }

    /// Returns the number of distinct known nodes.
    pub fn node_count(&self) -> usize {
        let mut ids: Vec<&NodeId> = self.nodes().map(|n| &n.id).collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }

    /// Returns true if every slot has an owner.
    pub fn is_fully_covered(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Returns true if no slot has an owner.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Monotonic version, bumped by every published change.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns a copy where `slot` is owned by `node`.
    ///
    /// `node` joins the shard it already leads, or becomes the primary of a new
    /// shard (a promoted replica after failover). The slot's migration marker
    /// is cleared: the move is done.
    pub fn with_moved(&self, slot: u16, node: &NodeEndpoint) -> Self {
        let mut next = self.clone();
        let known = self
            .nodes()
            .find(|n| n.same_node(node))
            .cloned()
            .unwrap_or_else(|| node.clone());
        let index = next.shard_index(known.with_role(NodeRole::Primary), Vec::new());
        next.slots[slot as usize] = Some(index);
        next.migrations.remove(&slot);
        next.epoch += 1;
        next
    }

    /// Returns a copy with the migration marker of `slot` set or cleared.
    pub fn with_migration(&self, slot: u16, migration: Option<Migration>) -> Self {
        let mut next = self.clone();
        match migration {
            Some(m) => {
                next.migrations.insert(slot, m);
            }
            None => {
                next.migrations.remove(&slot);
            }
        }
        next.epoch += 1;
        next
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::empty()
    }
}

fn slot_from_frame(frame: &Frame) -> Result<u16> {
    frame
        .as_integer()
        .and_then(|n| u16::try_from(n).ok())
        .filter(|slot| *slot < SLOT_COUNT)
        .ok_or_else(|| Error::protocol("slot must be an integer in 0..16384"))
}

/// Most keys remembered per migrating slot.
const MAX_ASKED_KEYS: usize = 1024;

/// The live topology shared by every clone of a client.
///
/// Reads are lock-free [`snapshot`](TopologyMap::snapshot)s; writers publish
/// a full replacement.
///
/// Keys that drew an ASK are remembered per slot while the slot's
/// `Migrating` marker stands, so later commands on them go straight to the
/// migration target.
#[derive(Debug)]
pub struct TopologyMap {
    current: ArcSwap<Topology>,
    next_replica: AtomicUsize,
    asked: Mutex<HashMap<u16, HashSet<Bytes>>>,
}

impl TopologyMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Topology::empty()),
            next_replica: AtomicUsize::new(0),
            asked: Mutex::new(HashMap::new()),
        }
    }

    fn asked(&self) -> MutexGuard<'_, HashMap<u16, HashSet<Bytes>>> {
        self.asked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<Topology> {
        self.current.load_full()
    }

    /// Returns the epoch of the current snapshot.
    pub fn epoch(&self) -> u64 {
        self.current.load().epoch
    }

    /// Replaces the whole map and returns the new epoch.
    ///
    /// Remembered ASK keys survive only for slots still marked `Migrating`.
    pub fn replace(&self, topology: Topology) -> u64 {
        let previous = self.current.rcu(|current| {
            let mut next = topology.clone();
            next.epoch = current.epoch + 1;
            Arc::new(next)
        });
        let current = self.current.load();
        self.asked()
            .retain(|slot, _| matches!(current.migration(*slot), Some(Migration::Migrating { .. })));
        previous.epoch + 1
    }

    /// Picks the node to send a command for `slot` to.
    ///
    /// With `prefer_replica`, replicas of the owning shard are used in turn;
    /// the primary is used when the shard has none.
    pub fn route(&self, slot: u16, prefer_replica: bool) -> Option<NodeEndpoint> {
        let topology = self.current.load();
        let primary = topology.owner(slot)?;
        let replicas = topology.replicas(slot);
        if prefer_replica && !replicas.is_empty() {
            let turn = self.next_replica.fetch_add(1, Ordering::Relaxed);
            return Some(replicas[turn % replicas.len()].clone());
        }
        Some(primary.clone())
    }

    /// Records that `slot` now belongs to `node`.
    ///
    /// Ends any migration of the slot.
    pub fn mark_moved(&self, slot: u16, node: &NodeEndpoint) {
        self.current
            .rcu(|current| Arc::new(current.with_moved(slot, node)));
        self.asked().remove(&slot);
    }

    /// Records that `slot` is being handed to `target`.
    ///
    /// Leaves the snapshot alone when the same marker is already set.
    pub fn mark_migrating(&self, slot: u16, target: NodeEndpoint) {
        if let Some(Migration::Migrating { target: known }) = self.current.load().migration(slot) {
            if known.same_node(&target) {
                return;
            }
        }
        let migration = Migration::Migrating { target };
        self.current
            .rcu(|current| Arc::new(current.with_migration(slot, Some(migration.clone()))));
        self.asked().remove(&slot);
    }

    /// Records that `key` in `slot` was answered with ASK to `target`.
    ///
    /// Marks the slot as migrating to `target` and remembers the key, so
    /// [`ask_target`](Self::ask_target) sends it there next time.
    pub fn record_ask(&self, slot: u16, key: &Bytes, target: &NodeEndpoint) {
        self.mark_migrating(slot, target.clone());
        let mut asked = self.asked();
        let keys = asked.entry(slot).or_default();
        if keys.len() < MAX_ASKED_KEYS {
            keys.insert(key.clone());
        }
    }

    /// Returns the migration target for `key` if it already drew an ASK
    /// and `slot` is still marked `Migrating`.
    pub fn ask_target(&self, slot: u16, key: &Bytes) -> Option<NodeEndpoint> {
        let topology = self.current.load();
        let Some(Migration::Migrating { target }) = topology.migration(slot) else {
            return None;
        };
        let asked = self.asked();
        asked
            .get(&slot)
            .filter(|keys| keys.contains(key))
            .map(|_| target.clone())
    }
}

impl Default for TopologyMap {
    fn default() -> Self {
        Self::new()
    }
}
