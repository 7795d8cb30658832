//! In-memory cluster for tests.
//!
//! [`MockCluster`] plays a small Redis Cluster behind the [`Connector`]
//! trait: it owns a slot table, answers `CLUSTER SLOTS`/`CLUSTER NODES`,
//! redirects with MOVED and ASK the way real nodes do, serves a handful of
//! key commands along with KEYS, WAIT and SCAN, and records every command it
//! receives. Tests change the server side (reassign slots, start migrations,
//! fail nodes over) and watch how the client reacts.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cluster::{key_slot, SLOT_COUNT};
use crate::core::connection::{Connector, NodeConnection};
use crate::proto::frame::Frame;
use crate::{Error, Result};

/// One command as a node received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCommand {
    /// Address of the receiving node.
    pub address: String,
    /// Connection the command arrived on.
    pub connection: usize,
    /// Command name and arguments, lossily decoded.
    pub args: Vec<String>,
}

#[derive(Debug, Default)]
struct MockNode {
    id: String,
    replica_of: Option<String>,
    down: bool,
    delay: Option<Duration>,
    data: BTreeMap<Bytes, Bytes>,
    scripted: VecDeque<Frame>,
}

#[derive(Debug)]
struct MockState {
    nodes: BTreeMap<String, MockNode>,
    slots: Vec<Option<String>>,
    migrating: HashMap<u16, String>,
    cluster_disabled: bool,
    log: Vec<MockCommand>,
}

/// A scripted Redis Cluster living in memory.
#[derive(Debug, Clone)]
pub struct MockCluster {
    state: Arc<Mutex<MockState>>,
    connects: Arc<AtomicUsize>,
}

impl MockCluster {
    /// Creates a cluster whose primaries split the slots evenly, in order.
    ///
    /// Node ids are `node-0`, `node-1`, and so on.
    pub fn new(primaries: &[&str]) -> Self {
        let mut nodes = BTreeMap::new();
        let mut slots = vec![None; SLOT_COUNT as usize];
        let share = SLOT_COUNT as usize / primaries.len().max(1);

        for (i, address) in primaries.iter().enumerate() {
            nodes.insert(
                address.to_string(),
                MockNode {
                    id: format!("node-{}", i),
                    ..Default::default()
                },
            );
            let start = i * share;
            let end = if i + 1 == primaries.len() {
                SLOT_COUNT as usize
            } else {
                start + share
            };
            for slot in &mut slots[start..end] {
                *slot = Some(address.to_string());
            }
        }

        Self {
            state: Arc::new(Mutex::new(MockState {
                nodes,
                slots,
                migrating: HashMap::new(),
                cluster_disabled: false,
                log: Vec::new(),
            })),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a connector that dials this cluster.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// Adds a node that owns no slots yet.
    pub fn add_node(&self, address: &str, id: &str) {
        self.state().nodes.insert(
            address.to_string(),
            MockNode {
                id: id.to_string(),
                ..Default::default()
            },
        );
    }

    /// Adds a replica of `primary`. It mirrors the primary's data.
    pub fn add_replica(&self, primary: &str, address: &str, id: &str) {
        self.state().nodes.insert(
            address.to_string(),
            MockNode {
                id: id.to_string(),
                replica_of: Some(primary.to_string()),
                ..Default::default()
            },
        );
    }

    /// Gives slots `start..=end` to `address` on the server side only.
    pub fn assign(&self, start: u16, end: u16, address: &str) {
        let mut state = self.state();
        for slot in start..=end {
            state.slots[slot as usize] = Some(address.to_string());
        }
    }

    /// Starts migrating `slot` from its owner to `target`.
    pub fn set_migrating(&self, slot: u16, target: &str) {
        self.state().migrating.insert(slot, target.to_string());
    }

    /// Ends the migration of `slot`, wherever its keys are.
    pub fn clear_migrating(&self, slot: u16) {
        self.state().migrating.remove(&slot);
    }

    /// Stores a key on the node owning its slot.
    pub fn insert(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        let key = key.into();
        let mut state = self.state();
        if let Some(owner) = state.slots[key_slot(&key) as usize].clone() {
            if let Some(node) = state.nodes.get_mut(&owner) {
                node.data.insert(key, value.into());
            }
        }
    }

    /// Stores a key on a specific node, wherever its slot lives.
    pub fn insert_on(&self, address: &str, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        if let Some(node) = self.state().nodes.get_mut(address) {
            node.data.insert(key.into(), value.into());
        }
    }

    /// Queues a reply for the next data command `address` receives.
    pub fn script(&self, address: &str, reply: Frame) {
        if let Some(node) = self.state().nodes.get_mut(address) {
            node.scripted.push_back(reply);
        }
    }

    /// Takes a node down or brings it back.
    pub fn set_down(&self, address: &str, down: bool) {
        if let Some(node) = self.state().nodes.get_mut(address) {
            node.down = down;
        }
    }

    /// Delays every reply from `address`.
    pub fn set_delay(&self, address: &str, delay: Duration) {
        if let Some(node) = self.state().nodes.get_mut(address) {
            node.delay = Some(delay);
        }
    }

    /// Makes every node answer as a standalone server.
    pub fn set_cluster_disabled(&self, disabled: bool) {
        self.state().cluster_disabled = disabled;
    }

    /// Kills `from` and hands its slots and data to `to`.
    pub fn fail_over(&self, from: &str, to: &str) {
        let mut state = self.state();
        for owner in state.slots.iter_mut().filter(|o| o.as_deref() == Some(from)) {
            *owner = Some(to.to_string());
        }
        let data = match state.nodes.get_mut(from) {
            Some(node) => {
                node.down = true;
                std::mem::take(&mut node.data)
            }
            None => BTreeMap::new(),
        };
        if let Some(node) = state.nodes.get_mut(to) {
            node.data.extend(data);
        }
    }

    /// Returns every command received so far.
    pub fn commands(&self) -> Vec<MockCommand> {
        self.state().log.clone()
    }

    /// Returns the arguments of each `name` command `address` received.
    pub fn commands_on(&self, address: &str, name: &str) -> Vec<Vec<String>> {
        self.state()
            .log
            .iter()
            .filter(|c| c.address == address && c.args[0].eq_ignore_ascii_case(name))
            .map(|c| c.args.clone())
            .collect()
    }

    /// Returns received commands other than cluster management.
    pub fn data_commands(&self) -> Vec<MockCommand> {
        self.state()
            .log
            .iter()
            .filter(|c| !is_management(&c.args[0]))
            .cloned()
            .collect()
    }

    /// Forgets the command log.
    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    /// Returns how many connections were opened.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockCluster {
    async fn connect(&self, address: &str) -> Result<Box<dyn NodeConnection>> {
        let available = matches!(self.state().nodes.get(address), Some(node) if !node.down);
        if !available {
            return Err(Error::Connect {
                address: address.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "node is down"),
            });
        }
        let id = self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            cluster: self.clone(),
            address: address.to_string(),
            id,
            asking: false,
            readonly: false,
        }))
    }
}

struct MockConnection {
    cluster: MockCluster,
    address: String,
    id: usize,
    asking: bool,
    readonly: bool,
}

#[async_trait]
impl NodeConnection for MockConnection {
    async fn send(&mut self, frame: &Frame) -> Result<Frame> {
        let args = match frame {
            Frame::Array(items) => items
                .iter()
                .map(|f| f.as_bytes().map(Bytes::copy_from_slice))
                .collect::<Option<Vec<Bytes>>>()
                .filter(|args| !args.is_empty())
                .ok_or_else(|| Error::protocol("request must be an array of bulk strings"))?,
            _ => return Err(Error::protocol("request must be an array")),
        };

        let delay = self
            .cluster
            .state()
            .nodes
            .get(&self.address)
            .and_then(|n| n.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let cluster = self.cluster.clone();
        let mut state = cluster.state();
        state.log.push(MockCommand {
            address: self.address.clone(),
            connection: self.id,
            args: args
                .iter()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect(),
        });
        match state.nodes.get(&self.address) {
            Some(node) if !node.down => {}
            _ => return Err(Error::connection_closed()),
        }
        Ok(self.handle(&mut state, &args))
    }
}

impl MockConnection {
    fn handle(&mut self, state: &mut MockState, args: &[Bytes]) -> Frame {
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();

        if !is_management(&name) {
            if let Some(reply) = state
                .nodes
                .get_mut(&self.address)
                .and_then(|n| n.scripted.pop_front())
            {
                self.asking = false;
                return reply;
            }
        }

        match name.as_str() {
            "CLUSTER" => {
                let sub = args
                    .get(1)
                    .map(|s| String::from_utf8_lossy(s).to_ascii_uppercase())
                    .unwrap_or_default();
                if state.cluster_disabled {
                    return Frame::error("ERR This instance has cluster support disabled");
                }
                match sub.as_str() {
                    "SLOTS" => cluster_slots(state),
                    "NODES" => Frame::bulk(cluster_nodes(state)),
                    _ => Frame::error("ERR unknown subcommand"),
                }
            }
            "ASKING" => {
                self.asking = true;
                Frame::simple("OK")
            }
            "READONLY" => {
                self.readonly = true;
                Frame::simple("OK")
            }
            "PING" => Frame::simple("PONG"),
            "SCAN" => self.scan(state, args),
            // Every live replica acknowledges at once.
            "WAIT" => Frame::Integer(
                state
                    .nodes
                    .values()
                    .filter(|n| n.replica_of.as_deref() == Some(self.address.as_str()) && !n.down)
                    .count() as i64,
            ),
            _ => {
                let asking = std::mem::replace(&mut self.asking, false);
                self.keyed(state, &name, args, asking)
            }
        }
    }

    fn scan(&self, state: &MockState, args: &[Bytes]) -> Frame {
        let cursor: usize = String::from_utf8_lossy(&args[1]).parse().unwrap_or(0);
        let mut pattern: Option<&[u8]> = None;
        let mut count = 10;
        let mut rest = args[2..].iter();
        while let Some(opt) = rest.next() {
            let value = rest.next();
            if opt.eq_ignore_ascii_case(b"MATCH") {
                pattern = value.map(|v| v.as_ref());
            } else if opt.eq_ignore_ascii_case(b"COUNT") {
                count = value
                    .and_then(|v| String::from_utf8_lossy(v).parse().ok())
                    .unwrap_or(10);
            }
        }

        let keys: Vec<&Bytes> = state
            .nodes
            .get(&self.address)
            .map(|n| n.data.keys().collect())
            .unwrap_or_default();
        let end = (cursor + count).min(keys.len());
        let page = keys
            .get(cursor..end)
            .unwrap_or(&[])
            .iter()
            .filter(|k| pattern.map_or(true, |p| glob_match(p, k)))
            .map(|k| Frame::BulkString(Some((*k).clone())))
            .collect();
        let next = if end >= keys.len() { 0 } else { end };
        Frame::Array(vec![Frame::bulk(next.to_string()), Frame::Array(page)])
    }

    fn keyed(&self, state: &mut MockState, name: &str, args: &[Bytes], asking: bool) -> Frame {
        let keys = command_keys(name, args);
        if let Some(first) = keys.first() {
            let slot = key_slot(first);
            if keys.iter().any(|k| key_slot(k) != slot) {
                return Frame::error("CROSSSLOT Keys in request don't hash to the same slot");
            }

            let owner = state.slots[slot as usize].clone();
            let node = &state.nodes[&self.address];
            let serves = match (&owner, &node.replica_of) {
                (Some(owner), None) => *owner == self.address,
                (Some(owner), Some(primary)) => {
                    *owner == *primary && self.readonly && crate::core::command::is_read_only_command(name.as_bytes())
                }
                (None, _) => return Frame::error("CLUSTERDOWN Hash slot not served"),
            };
            let importing = state.migrating.get(&slot) == Some(&self.address);

            if serves {
                if let Some(target) = state.migrating.get(&slot) {
                    let data = &state.nodes[&self.address].data;
                    if keys.iter().any(|k| !data.contains_key(k)) {
                        return Frame::error(&format!("ASK {} {}", slot, target));
                    }
                }
            } else if !(asking && importing) {
                let owner = owner.unwrap_or_default();
                return Frame::error(&format!("MOVED {} {}", slot, owner));
            }
        }

        let data_node = match state.nodes[&self.address].replica_of.clone() {
            Some(primary) => primary,
            None => self.address.clone(),
        };
        let Some(node) = state.nodes.get_mut(&data_node) else {
            return Frame::error("ERR no such node");
        };
        execute(name, args, &mut node.data)
    }
}

fn is_management(name: &str) -> bool {
    ["CLUSTER", "READONLY", "ASKING"]
        .iter()
        .any(|m| m.eq_ignore_ascii_case(name))
}

fn command_keys(name: &str, args: &[Bytes]) -> Vec<Bytes> {
    match name {
        "GET" | "SET" | "INCR" | "TYPE" | "TTL" => args.get(1).cloned().into_iter().collect(),
        "MSET" => args[1..].iter().step_by(2).cloned().collect(),
        "DEL" | "UNLINK" | "TOUCH" | "EXISTS" | "MGET" | "RENAME" | "RENAMENX" => args[1..].to_vec(),
        _ => Vec::new(),
    }
}

fn execute(name: &str, args: &[Bytes], data: &mut BTreeMap<Bytes, Bytes>) -> Frame {
    let count = |f: &dyn Fn(&Bytes) -> bool| Frame::Integer(args[1..].iter().filter(|&k| f(k)).count() as i64);
    match (name, args.len()) {
        ("GET", 2) => match data.get(&args[1]) {
            Some(v) => Frame::bulk(v.clone()),
            None => Frame::Null,
        },
        ("SET", 3) => {
            data.insert(args[1].clone(), args[2].clone());
            Frame::simple("OK")
        }
        ("MGET", n) if n > 1 => Frame::Array(
            args[1..]
                .iter()
                .map(|k| data.get(k).map_or(Frame::Null, |v| Frame::bulk(v.clone())))
                .collect(),
        ),
        ("MSET", n) if n > 1 && n % 2 == 1 => {
            for pair in args[1..].chunks(2) {
                data.insert(pair[0].clone(), pair[1].clone());
            }
            Frame::simple("OK")
        }
        ("DEL" | "UNLINK", n) if n > 1 => {
            Frame::Integer(args[1..].iter().filter(|k| data.remove(*k).is_some()).count() as i64)
        }
        ("EXISTS" | "TOUCH", n) if n > 1 => count(&|k| data.contains_key(k)),
        ("RENAME" | "RENAMENX", 3) => match data.remove(&args[1]) {
            Some(v) if name == "RENAMENX" && data.contains_key(&args[2]) => {
                data.insert(args[1].clone(), v);
                Frame::Integer(0)
            }
            Some(v) => {
                data.insert(args[2].clone(), v);
                if name == "RENAMENX" {
                    Frame::Integer(1)
                } else {
                    Frame::simple("OK")
                }
            }
            None => Frame::error("ERR no such key"),
        },
        ("RANDOMKEY", 1) => match data.keys().next() {
            Some(k) => Frame::bulk(k.clone()),
            None => Frame::Null,
        },
        ("DBSIZE", 1) => Frame::Integer(data.len() as i64),
        ("KEYS", 2) => Frame::Array(
            data.keys()
                .filter(|k| glob_match(&args[1], k))
                .map(|k| Frame::bulk(k.clone()))
                .collect(),
        ),
        ("FLUSHALL", _) => {
            data.clear();
            Frame::simple("OK")
        }
        _ => Frame::error(&format!("ERR unknown command '{}'", name)),
    }
}

fn split(address: &str) -> (String, i64) {
    match address.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(0)),
        None => (address.to_string(), 0),
    }
}

fn node_entry(state: &MockState, address: &str) -> Frame {
    let (host, port) = split(address);
    let id = state.nodes.get(address).map(|n| n.id.clone()).unwrap_or_default();
    Frame::Array(vec![Frame::bulk(host), Frame::Integer(port), Frame::bulk(id)])
}

fn owner_runs(state: &MockState) -> Vec<(u16, u16, String)> {
    let mut runs: Vec<(u16, u16, String)> = Vec::new();
    for (slot, owner) in state.slots.iter().enumerate() {
        let slot = slot as u16;
        let Some(owner) = owner else { continue };
        if let Some((_, end, o)) = runs.last_mut() {
            if o == owner && *end + 1 == slot {
                *end = slot;
                continue;
            }
        }
        runs.push((slot, slot, owner.clone()));
    }
    runs
}

fn cluster_slots(state: &MockState) -> Frame {
    let entries = owner_runs(state)
        .into_iter()
        .map(|(start, end, owner)| {
            let mut entry = vec![
                Frame::Integer(start as i64),
                Frame::Integer(end as i64),
                node_entry(state, &owner),
            ];
            for (address, node) in &state.nodes {
                if node.replica_of.as_deref() == Some(owner.as_str()) && !node.down {
                    entry.push(node_entry(state, address));
                }
            }
            Frame::Array(entry)
        })
        .collect();
    Frame::Array(entries)
}

fn cluster_nodes(state: &MockState) -> String {
    let runs = owner_runs(state);
    let id_of = |address: &str| state.nodes.get(address).map(|n| n.id.clone()).unwrap_or_default();
    let mut out = String::new();

    for (address, node) in &state.nodes {
        let (host, port) = split(address);
        let role = if node.replica_of.is_some() { "slave" } else { "master" };
        let flags = if node.down { format!("{},fail", role) } else { role.to_string() };
        let master = node.replica_of.as_deref().map(id_of).unwrap_or_else(|| "-".to_string());

        let mut line = format!(
            "{} {}:{}@{} {} {} 0 0 1 connected",
            node.id,
            host,
            port,
            port + 10000,
            flags,
            master
        );
        for (start, end, _) in runs.iter().filter(|(_, _, o)| o == address) {
            if start == end {
                line.push_str(&format!(" {}", start));
            } else {
                line.push_str(&format!(" {}-{}", start, end));
            }
        }
        for (slot, target) in &state.migrating {
            if state.slots[*slot as usize].as_deref() == Some(address.as_str()) {
                line.push_str(&format!(" [{}->-{}]", slot, id_of(target)));
            }
            if target == address {
                let source = state.slots[*slot as usize].as_deref().map(id_of).unwrap_or_default();
                line.push_str(&format!(" [{}-<-{}]", slot, source));
            }
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Redis-style glob matching with `*` and `?`.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Topology;

    #[test]
    fn test_glob_match() {
        assert!(glob_match(b"{key}*", b"{key}12"));
        assert!(glob_match(b"user:?", b"user:1"));
        assert!(!glob_match(b"user:?", b"user:10"));
        assert!(glob_match(b"*", b""));
        assert!(!glob_match(b"a*", b"b"));
    }

    #[tokio::test]
    async fn test_mock_topology_parses() {
        let mock = MockCluster::new(&["127.0.0.1:7000", "127.0.0.1:7001"]);
        mock.add_replica("127.0.0.1:7000", "127.0.0.1:7100", "replica-0");
        mock.set_migrating(42, "127.0.0.1:7001");

        let mut conn = mock.connect("127.0.0.1:7000").await.unwrap();
        let slots = conn
            .send(&Frame::Array(vec![Frame::bulk("CLUSTER"), Frame::bulk("SLOTS")]))
            .await
            .unwrap();
        let topology = Topology::from_cluster_slots(slots).unwrap();
        assert!(topology.is_fully_covered());
        assert_eq!(topology.replicas(0)[0].id.as_str(), "replica-0");

        let nodes = conn
            .send(&Frame::Array(vec![Frame::bulk("CLUSTER"), Frame::bulk("NODES")]))
            .await
            .unwrap();
        let nodes = crate::cluster::parse_cluster_nodes(&nodes.as_text().unwrap()).unwrap();
        assert_eq!(nodes.len(), 3);
        let source = nodes.iter().find(|n| n.id.as_str() == "node-0").unwrap();
        assert_eq!(source.migrating[0].0, 42);
    }

    #[tokio::test]
    async fn test_mock_redirects() {
        let mock = MockCluster::new(&["127.0.0.1:7000", "127.0.0.1:7001"]);
        let mut conn = mock.connect("127.0.0.1:7000").await.unwrap();
        // "foo" hashes to 12182, owned by the second node.
        let reply = conn
            .send(&Frame::Array(vec![Frame::bulk("GET"), Frame::bulk("foo")]))
            .await
            .unwrap();
        assert_eq!(reply, Frame::error("MOVED 12182 127.0.0.1:7001"));
    }
}
