//! Relay node pool and selection policy
//!
//! Selection is least-loaded among eligible nodes. Ties go to the first
//! eligible node at or after a rotating cursor over the id-sorted pool, so
//! equally loaded nodes are handed out round-robin. Load and availability
//! are reported by the node store through `set_load`/`set_online`; selecting
//! a node only moves the cursor.

use serde::Serialize;
use std::ops::BitOr;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, trace};

/// Capability flags advertised by a relay node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    /// Node can serve clients using the Windows TAP driver
    pub const WINDOWS_DRIVER: Capabilities = Capabilities(1 << 0);
    /// Node runs in layer-2 (TAP) mode
    pub const TAP: Capabilities = Capabilities(1 << 1);

    pub fn bits(self) -> u32 {
        self.0
    }

    /// True when every flag in `other` is also set here
    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

/// A relay node known to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayNode {
    pub id: String,
    /// Public address clients dial
    pub address: String,
    pub port: u16,
    pub capabilities: Capabilities,
    pub load: u32,
    /// Maximum load, unlimited when `None`
    pub capacity: Option<u32>,
    pub online: bool,
}

impl RelayNode {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            capabilities: Capabilities::NONE,
            load: 0,
            capacity: None,
            online: true,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// `ip:port` string handed to clients
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn is_available(&self) -> bool {
        self.online && self.capacity.map_or(true, |cap| self.load < cap)
    }

    fn is_eligible(&self, required: Capabilities) -> bool {
        self.is_available() && self.capabilities.contains(required)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("no available node")]
    NoAvailableNode,
}

#[derive(Debug, Default)]
struct Pool {
    /// Kept sorted by id
    nodes: Vec<RelayNode>,
    cursor: usize,
}

/// Shared pool of relay nodes
#[derive(Debug, Default)]
pub struct NodeSelector {
    pool: Mutex<Pool>,
}

impl NodeSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(nodes: impl IntoIterator<Item = RelayNode>) -> Self {
        let selector = Self::new();
        for node in nodes {
            selector.register(node);
        }
        selector
    }

    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a node, replacing any node with the same id
    pub fn register(&self, node: RelayNode) {
        let mut pool = self.lock();
        debug!("Registering relay node {} at {}", node.id, node.server_address());
        match pool.nodes.binary_search_by(|n| n.id.as_str().cmp(&node.id)) {
            Ok(index) => pool.nodes[index] = node,
            Err(index) => pool.nodes.insert(index, node),
        }
    }

    pub fn remove(&self, id: &str) -> Option<RelayNode> {
        let mut pool = self.lock();
        let index = pool.nodes.iter().position(|n| n.id == id)?;
        let removed = pool.nodes.remove(index);
        if pool.cursor > index {
            pool.cursor -= 1;
        }
        if pool.cursor >= pool.nodes.len() {
            pool.cursor = 0;
        }
        Some(removed)
    }

    /// Pick a node satisfying `required`
    pub fn select(&self, required: Capabilities) -> Result<RelayNode, SelectError> {
        let mut pool = self.lock();
        let count = pool.nodes.len();

        let mut best: Option<usize> = None;
        for offset in 0..count {
            let index = (pool.cursor + offset) % count;
            let node = &pool.nodes[index];
            if !node.is_eligible(required) {
                continue;
            }
            match best {
                Some(current) if pool.nodes[current].load <= node.load => {}
                _ => best = Some(index),
            }
        }

        let index = best.ok_or(SelectError::NoAvailableNode)?;
        pool.cursor = (index + 1) % count;

        let node = pool.nodes[index].clone();
        trace!("Selected relay node {} (load {})", node.id, node.load);
        Ok(node)
    }

    pub fn set_load(&self, id: &str, load: u32) -> bool {
        self.update(id, |node| node.load = load)
    }

    pub fn set_online(&self, id: &str, online: bool) -> bool {
        self.update(id, |node| node.online = online)
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut RelayNode)) -> bool {
        let mut pool = self.lock();
        match pool.nodes.iter_mut().find(|n| n.id == id) {
            Some(node) => {
                f(node);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the pool in id order
    pub fn nodes(&self) -> Vec<RelayNode> {
        self.lock().nodes.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn available_count(&self) -> usize {
        self.lock().nodes.iter().filter(|n| n.is_available()).count()
    }
}
