//! In-memory cluster membership.
//!
//! [`NodeRegistry`] is the only owner of [`Node`] state. Every mutation happens under one
//! lock; readers get cloned snapshots, so a caller can iterate a node's connections without
//! holding the registry.
use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::protocol::{Connection, ConnectionId};

/// Advisory role of a node; carries no replication semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    pub fn from_replica_flag(is_replica: bool) -> Self {
        if is_replica { Role::Slave } else { Role::Master }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Slave => write!(f, "slave"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub role: Role,
    pub tags: Vec<String>,
    pub connections: Vec<Connection>,
    pub replicas: Vec<Connection>,
}

impl Node {
    fn new(id: &str, role: Role, tags: &[String]) -> Self {
        Self {
            id: id.to_string(),
            role,
            tags: tags.to_vec(),
            connections: Vec::new(),
            replicas: Vec::new(),
        }
    }

    /// Connections that have not been closed yet.
    pub fn live_connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter().filter(|c| !c.is_closed())
    }
}

#[derive(Default)]
struct Members {
    nodes: HashMap<String, Node>,
    masters: HashSet<String>,
    slaves: HashSet<String>,
}

impl Members {
    fn partition(&mut self, role: Role) -> &mut HashSet<String> {
        match role {
            Role::Master => &mut self.masters,
            Role::Slave => &mut self.slaves,
        }
    }

    fn insert(&mut self, id: &str, role: Role, tags: &[String]) -> &mut Node {
        if !self.nodes.contains_key(id) {
            info!("registering {role} node {id}");
            self.partition(role).insert(id.to_string());
        }
        let node = self
            .nodes
            .entry(id.to_string())
            .or_insert_with(|| Node::new(id, role, tags));
        if node.role != role {
            warn!("node {id} already registered as {}, ignoring {role}", node.role);
        }
        node
    }

    fn snapshot(&self, ids: &HashSet<String>) -> Vec<Node> {
        let mut nodes = ids
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .cloned()
            .collect::<Vec<_>>();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }
}

/// Directory of cluster members keyed by node id and partitioned by role.
#[derive(Default)]
pub struct NodeRegistry {
    members: Mutex<Members>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node. Adding an id that is already known returns the existing node
    /// unchanged.
    pub fn add_node(&self, id: &str, role: Role, tags: &[String]) -> Node {
        self.members.lock().insert(id, role, tags).clone()
    }

    /// Registers a node if needed and attaches `connection` to it in one step, so the node
    /// cannot be pruned in between.
    pub fn register(&self, id: &str, role: Role, tags: &[String], connection: Connection) -> Node {
        let mut members = self.members.lock();
        let node = members.insert(id, role, tags);
        if !node.connections.contains(&connection) {
            node.connections.push(connection);
        }
        node.clone()
    }

    pub fn remove_node(&self, id: &str) -> Option<Node> {
        let mut members = self.members.lock();
        let node = members.nodes.remove(id)?;
        members.partition(node.role).remove(id);
        info!("removed {} node {id}", node.role);
        Some(node)
    }

    pub fn get_node(&self, id: &str) -> Option<Node> {
        self.members.lock().nodes.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.lock().nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.members.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attaches a live socket to a registered node. Returns `false` for unknown ids.
    pub fn add_connection(&self, id: &str, connection: Connection) -> bool {
        let mut members = self.members.lock();
        match members.nodes.get_mut(id) {
            Some(node) => {
                if !node.connections.contains(&connection) {
                    node.connections.push(connection);
                }
                true
            }
            None => false,
        }
    }

    /// Appends a replica socket to a registered node. Returns `false` for unknown ids.
    ///
    /// The server only records joined connections; replica links are attached by the
    /// statement layer through [`MessageServer::registry`](super::MessageServer::registry).
    pub fn add_replica(&self, id: &str, connection: Connection) -> bool {
        let mut members = self.members.lock();
        match members.nodes.get_mut(id) {
            Some(node) => {
                if !node.replicas.contains(&connection) {
                    node.replicas.push(connection);
                }
                true
            }
            None => false,
        }
    }

    /// Detaches one socket from a node, dropping the node once it has none left.
    ///
    /// Returns whether the connection was known.
    pub fn remove_connection(&self, id: &str, connection: ConnectionId) -> bool {
        let mut members = self.members.lock();
        let Some(node) = members.nodes.get_mut(id) else {
            return false;
        };

        let before = node.connections.len() + node.replicas.len();
        node.connections.retain(|c| c.id() != connection);
        node.replicas.retain(|c| c.id() != connection);
        let removed = before != node.connections.len() + node.replicas.len();

        if node.connections.is_empty() && node.replicas.is_empty() {
            let role = node.role;
            members.nodes.remove(id);
            members.partition(role).remove(id);
            debug!("{role} node {id} has no connections left, removed");
        }
        removed
    }

    pub fn masters(&self) -> Vec<Node> {
        let members = self.members.lock();
        members.snapshot(&members.masters)
    }

    pub fn slaves(&self) -> Vec<Node> {
        let members = self.members.lock();
        members.snapshot(&members.slaves)
    }

    /// Every registered connection, paired with the id of the node that owns it.
    pub fn connections(&self) -> Vec<(String, Connection)> {
        let members = self.members.lock();
        members
            .nodes
            .values()
            .flat_map(|node| {
                node.connections
                    .iter()
                    .chain(node.replicas.iter())
                    .map(|c| (node.id.clone(), c.clone()))
            })
            .collect()
    }
}
