//! Known server nodes and their connections.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};

use tracing::debug;

use crate::core::bridge::{BridgeCounters, ConnectionType, PhysicalBridge};
use crate::core::message::Message;
use crate::core::Shared;

/// Deployment shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerType {
    /// One master, possibly with slaves; no slot routing.
    #[default]
    Standalone,
    /// Redis Cluster; commands are routed by hash slot.
    Cluster,
}

#[derive(Debug, Default)]
struct Roles {
    is_slave: bool,
    master: Option<usize>,
    slaves: Vec<usize>,
}

/// One node: its bridges and its place in the master/slave graph.
pub struct ServerEndPoint {
    endpoint: String,
    index: usize,
    shared: Weak<Shared>,
    interactive: Arc<PhysicalBridge>,
    subscription: OnceLock<Arc<PhysicalBridge>>,
    roles: RwLock<Roles>,
}

/// Diagnostics for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCounters {
    /// The node's endpoint.
    pub endpoint: String,
    /// Whether the node is known to be a slave.
    pub is_slave: bool,
    /// Interactive bridge counters.
    pub interactive: BridgeCounters,
    /// Subscription bridge counters, if that bridge was ever created.
    pub subscription: Option<BridgeCounters>,
}

impl ServerEndPoint {
    pub(crate) fn new(endpoint: String, index: usize, shared: Weak<Shared>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            interactive: PhysicalBridge::new(
                endpoint.clone(),
                ConnectionType::Interactive,
                me.clone(),
                shared.clone(),
            ),
            subscription: OnceLock::new(),
            roles: RwLock::new(Roles::default()),
            endpoint,
            index,
            shared,
        })
    }

    /// The `host:port` of this node.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Whether the node is known to be a slave.
    pub fn is_slave(&self) -> bool {
        self.roles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_slave
    }

    /// Whether the interactive connection is established.
    pub fn is_connected(&self) -> bool {
        self.interactive.is_established()
    }

    /// Records this node's role. `master` is the registry index of its master.
    pub(crate) fn set_role(&self, is_slave: bool, master: Option<usize>) {
        let mut roles = self.roles.write().unwrap_or_else(PoisonError::into_inner);
        roles.is_slave = is_slave;
        roles.master = master;
    }

    pub(crate) fn set_slaves(&self, slaves: Vec<usize>) {
        self.roles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .slaves = slaves;
    }

    pub(crate) fn master_index(&self) -> Option<usize> {
        self.roles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .master
    }

    pub(crate) fn slave_indexes(&self) -> Vec<usize> {
        self.roles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .slaves
            .clone()
    }

    /// Can this node take new work right now?
    pub(crate) fn is_selectable(&self) -> bool {
        self.is_connected()
    }

    /// Queues `msg` on the bridge that carries it: (un)subscribes go to the
    /// subscription connection, everything else to the interactive one.
    pub(crate) fn try_enqueue(&self, msg: Arc<Message>) -> bool {
        if msg.is_subscription() {
            return self.subscription_bridge().try_enqueue(msg);
        }
        self.interactive.try_enqueue(msg)
    }

    pub(crate) fn bridge(&self) -> &Arc<PhysicalBridge> {
        &self.interactive
    }

    /// The pub/sub bridge, created on first use.
    pub(crate) fn subscription_bridge(&self) -> &Arc<PhysicalBridge> {
        self.subscription.get_or_init(|| {
            let bridge = PhysicalBridge::new(
                self.endpoint.clone(),
                ConnectionType::Subscription,
                self.interactive.server_ref(),
                self.shared.clone(),
            );
            bridge.try_connect();
            bridge
        })
    }

    pub(crate) fn activate(&self) {
        debug!(endpoint = %self.endpoint, "activating server");
        self.interactive.try_connect();
    }

    pub(crate) fn on_heartbeat(&self) {
        self.interactive.on_heartbeat();
        if let Some(bridge) = self.subscription.get() {
            bridge.on_heartbeat();
        }
    }

    pub(crate) fn dispose(&self) {
        self.interactive.dispose();
        if let Some(bridge) = self.subscription.get() {
            bridge.dispose();
        }
    }

    /// Returns diagnostic counters.
    pub fn counters(&self) -> ServerCounters {
        ServerCounters {
            endpoint: self.endpoint.clone(),
            is_slave: self.is_slave(),
            interactive: self.interactive.counters(),
            subscription: self.subscription.get().map(|b| b.counters()),
        }
    }
}

impl std::fmt::Debug for ServerEndPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEndPoint")
            .field("endpoint", &self.endpoint)
            .field("index", &self.index)
            .field("is_slave", &self.is_slave())
            .finish()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    servers: Vec<Arc<ServerEndPoint>>,
    by_endpoint: HashMap<String, usize>,
}

/// Append-only list of known servers.
///
/// Indexes are stable for the life of the multiplexer, so the slot map can
/// store them in plain atomics.
#[derive(Debug, Default)]
pub(crate) struct ServerRegistry {
    inner: RwLock<RegistryInner>,
}

impl ServerRegistry {
    pub(crate) fn get(&self, endpoint: &str) -> Option<Arc<ServerEndPoint>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_endpoint
            .get(endpoint)
            .map(|&i| inner.servers[i].clone())
    }

    pub(crate) fn by_index(&self, index: usize) -> Option<Arc<ServerEndPoint>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .servers
            .get(index)
            .cloned()
    }

    /// Returns the server for `endpoint`, creating it if needed.
    ///
    /// # Returns
    ///
    /// The server and whether it was just created (and still needs
    /// activating).
    pub(crate) fn get_or_create(
        &self,
        shared: &Weak<Shared>,
        endpoint: &str,
    ) -> (Arc<ServerEndPoint>, bool) {
        if let Some(server) = self.get(endpoint) {
            return (server, false);
        }
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(&i) = inner.by_endpoint.get(endpoint) {
            return (inner.servers[i].clone(), false);
        }
        let index = inner.servers.len();
        let server = ServerEndPoint::new(endpoint.to_string(), index, shared.clone());
        inner.servers.push(server.clone());
        inner.by_endpoint.insert(endpoint.to_string(), index);
        (server, true)
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<ServerEndPoint>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .servers
            .clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .servers
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_is_append_only() {
        let registry = ServerRegistry::default();
        let shared = Weak::new();
        let (a, created_a) = registry.get_or_create(&shared, "a:1");
        let (b, created_b) = registry.get_or_create(&shared, "b:2");
        let (a2, created_again) = registry.get_or_create(&shared, "a:1");

        assert!(created_a && created_b && !created_again);
        assert!(Arc::ptr_eq(&a, &a2));
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(registry.len(), 2);
        assert!(Arc::ptr_eq(&registry.by_index(1).unwrap(), &b));
        assert!(registry.get("c:3").is_none());
    }

    #[test]
    fn test_roles() {
        let registry = ServerRegistry::default();
        let (master, _) = registry.get_or_create(&Weak::new(), "m:1");
        let (slave, _) = registry.get_or_create(&Weak::new(), "s:1");
        slave.set_role(true, Some(master.index()));
        master.set_slaves(vec![slave.index()]);

        assert!(slave.is_slave());
        assert!(!master.is_slave());
        assert_eq!(slave.master_index(), Some(0));
        assert_eq!(master.slave_indexes(), vec![1]);
        assert!(!master.is_selectable());
    }
}
