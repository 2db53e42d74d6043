//! A node is one participant in a network of connected processes.
//!
//! Exactly one node per network is the broker. It assigns names to the nodes
//! it connects, introduces pairs of non-broker nodes that need to talk, and
//! relays messages whose attachments cannot cross a restricted transport.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use weft_memory::LinkMemory;
use weft_wire::{LinkSide, Message, NodeName, NodeType};

use crate::driver::{Driver, DriverObject, Transport};
use crate::error::Error;
use crate::node_link::{self, NodeLink};
use crate::portal::Portal;

type IntroductionCallback = Box<dyn FnOnce(Option<&Arc<NodeLink>>) + Send>;

struct NodeState {
    name: NodeName,
    broker_name: Option<NodeName>,
    connections: HashMap<NodeName, Arc<NodeLink>>,
    /// Callbacks waiting for a link to a node we have asked the broker to
    /// introduce us to, keyed by that node's name.
    pending_introductions: HashMap<NodeName, Vec<IntroductionCallback>>,
    /// Broker-side dedup of introductions currently being set up, keyed by
    /// the unordered pair of nodes involved.
    in_progress_introductions: HashSet<(NodeName, NodeName)>,
}

pub struct Node {
    node_type: NodeType,
    driver: Arc<dyn Driver>,
    state: Mutex<NodeState>,
}

pub(crate) fn random_name(driver: &dyn Driver) -> NodeName {
    loop {
        let name = NodeName::new(driver.random_u64(), driver.random_u64());
        if name.is_valid() {
            return name;
        }
    }
}

fn introduction_key(a: NodeName, b: NodeName) -> (NodeName, NodeName) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl Node {
    pub fn new(node_type: NodeType, driver: Arc<dyn Driver>) -> Arc<Self> {
        let name = match node_type {
            // Brokers name themselves; everyone else waits to be named.
            NodeType::Broker => random_name(driver.as_ref()),
            NodeType::Normal => NodeName::default(),
        };
        Arc::new(Self {
            node_type,
            driver,
            state: Mutex::new(NodeState {
                name,
                broker_name: None,
                connections: HashMap::new(),
                pending_introductions: HashMap::new(),
                in_progress_introductions: HashSet::new(),
            }),
        })
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn name(&self) -> NodeName {
        self.state.lock().name
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Connect to another node over `transport` and return the initial
    /// portals, paired one-to-one with the other side's. Exactly one end of
    /// the transport must belong to a broker.
    pub fn connect(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        num_initial_portals: usize,
    ) -> Result<Vec<Portal>, Error> {
        crate::connector::connect(self, transport, num_initial_portals)
    }

    /// A connected pair of portals local to this node.
    pub fn create_portal_pair(self: &Arc<Self>) -> (Portal, Portal) {
        Portal::pair(self)
    }

    /// Sever every connection. Remote routes observe disconnection; local
    /// portal pairs keep working.
    pub fn close(&self) {
        let (connections, pending) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.connections),
                std::mem::take(&mut state.pending_introductions),
            )
        };
        for (_, link) in connections {
            link.close(true);
        }
        for (_, callbacks) in pending {
            for callback in callbacks {
                callback(None);
            }
        }
    }

    // ==================================================================
    // Connections
    // ==================================================================

    pub(crate) fn set_assigned_name(&self, name: NodeName, broker_name: NodeName) {
        let mut state = self.state.lock();
        state.name = name;
        state.broker_name = Some(broker_name);
    }

    /// Register `link` and run any callbacks waiting on this remote node.
    /// Fails if a connection to the same node already exists.
    pub(crate) fn add_connection(&self, link: Arc<NodeLink>) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            let name = link.remote_node_name();
            if state.connections.contains_key(&name) {
                return false;
            }
            state.connections.insert(name, link.clone());
            state.pending_introductions.remove(&name).unwrap_or_default()
        };
        for callback in callbacks {
            callback(Some(&link));
        }
        true
    }

    pub(crate) fn connection_to(&self, name: NodeName) -> Option<Arc<NodeLink>> {
        self.state.lock().connections.get(&name).cloned()
    }

    fn broker_link(&self) -> Option<Arc<NodeLink>> {
        let state = self.state.lock();
        state
            .broker_name
            .and_then(|name| state.connections.get(&name).cloned())
    }

    pub(crate) fn drop_connection(&self, name: NodeName) {
        let orphaned = {
            let mut state = self.state.lock();
            state.connections.remove(&name);
            if state.broker_name == Some(name) {
                // Without a broker, no pending introduction can complete.
                std::mem::take(&mut state.pending_introductions)
            } else {
                HashMap::new()
            }
        };
        for (_, callbacks) in orphaned {
            for callback in callbacks {
                callback(None);
            }
        }
    }

    // ==================================================================
    // Introductions
    // ==================================================================

    /// Invoke `callback` with a link to `name`, asking the broker for an
    /// introduction if no direct connection exists yet.
    pub(crate) fn establish_link(
        self: &Arc<Self>,
        name: NodeName,
        callback: impl FnOnce(Option<&Arc<NodeLink>>) + Send + 'static,
    ) {
        enum Outcome {
            Ready(Arc<NodeLink>, IntroductionCallback),
            Request(Arc<NodeLink>),
            Queued,
            Unreachable(IntroductionCallback),
        }
        let callback: IntroductionCallback = Box::new(callback);
        let outcome = {
            let mut state = self.state.lock();
            if let Some(link) = state.connections.get(&name) {
                Outcome::Ready(link.clone(), callback)
            } else if self.node_type == NodeType::Broker {
                // A broker is connected to every node it can reach.
                Outcome::Unreachable(callback)
            } else {
                let broker = state
                    .broker_name
                    .and_then(|b| state.connections.get(&b).cloned());
                match broker {
                    None => Outcome::Unreachable(callback),
                    Some(broker) => {
                        let waiters = state.pending_introductions.entry(name).or_default();
                        let first = waiters.is_empty();
                        waiters.push(callback);
                        if first {
                            Outcome::Request(broker)
                        } else {
                            Outcome::Queued
                        }
                    }
                }
            }
        };
        match outcome {
            Outcome::Ready(link, callback) => callback(Some(&link)),
            Outcome::Request(broker) => {
                debug!(target = %name, "requesting introduction");
                broker.transmit(Message::RequestIntroduction { name }, Vec::new());
            }
            Outcome::Queued => {}
            Outcome::Unreachable(callback) => callback(None),
        }
    }

    /// Broker side of `RequestIntroduction`.
    pub(crate) fn handle_introduction_request(
        self: &Arc<Self>,
        from: &Arc<NodeLink>,
        name: NodeName,
    ) {
        let requester = from.remote_node_name();
        let key = introduction_key(requester, name);
        let target = {
            let mut state = self.state.lock();
            if !state.in_progress_introductions.insert(key) {
                return;
            }
            state.connections.get(&name).cloned()
        };
        match target {
            Some(target_link) => {
                self.introduce_remote_nodes(from, &target_link);
                self.state.lock().in_progress_introductions.remove(&key);
            }
            None => {
                self.state.lock().in_progress_introductions.remove(&key);
                debug!(requester = %requester, target = %name, "rejecting introduction");
                from.transmit(Message::RejectIntroduction { name }, Vec::new());
            }
        }
    }

    /// Hand both nodes the two ends of a fresh transport plus a shared
    /// memory region for their new link. The requester takes side A.
    fn introduce_remote_nodes(&self, requester: &Arc<NodeLink>, target: &Arc<NodeLink>) {
        let (requester_transport, target_transport) = self.driver.create_transport_pair();
        let (_, region) = LinkMemory::create(
            self.driver
                .allocate_region(LinkMemory::primary_buffer_words()),
        );
        debug!(
            requester = %requester.remote_node_name(),
            target = %target.remote_node_name(),
            "introducing nodes",
        );
        requester.transmit(
            Message::AcceptIntroduction {
                name: target.remote_node_name(),
                link_side: LinkSide::A,
                remote_node_type: target.remote_node_type(),
                transport: 0,
                memory: 1,
            },
            vec![
                DriverObject::Transport(requester_transport),
                DriverObject::Memory(region.clone()),
            ],
        );
        target.transmit(
            Message::AcceptIntroduction {
                name: requester.remote_node_name(),
                link_side: LinkSide::B,
                remote_node_type: requester.remote_node_type(),
                transport: 0,
                memory: 1,
            },
            vec![
                DriverObject::Transport(target_transport),
                DriverObject::Memory(region),
            ],
        );
    }

    /// Non-broker side of `AcceptIntroduction`: bring up the link and run
    /// whatever was waiting on it.
    pub(crate) fn accept_introduction(
        self: &Arc<Self>,
        name: NodeName,
        link_side: LinkSide,
        remote_node_type: NodeType,
        transport: Arc<dyn Transport>,
        region: weft_memory::Region,
    ) -> bool {
        if !name.is_valid() {
            return false;
        }
        let memory = Arc::new(LinkMemory::adopt(region));
        let link = NodeLink::new(
            self.clone(),
            link_side,
            name,
            remote_node_type,
            transport,
            memory,
        );
        if !self.add_connection(link.clone()) {
            // Lost a race with another introduction to the same node.
            link.close(true);
            return true;
        }
        link.activate();
        true
    }

    pub(crate) fn cancel_introduction(&self, name: NodeName) {
        let callbacks = self
            .state
            .lock()
            .pending_introductions
            .remove(&name)
            .unwrap_or_default();
        for callback in callbacks {
            callback(None);
        }
    }

    // ==================================================================
    // Relay
    // ==================================================================

    /// Route an encoded envelope for `destination` through the broker
    /// because the direct transport cannot carry its attachments.
    pub(crate) fn relay_message(
        &self,
        destination: NodeName,
        data: Vec<u8>,
        objects: Vec<DriverObject>,
    ) {
        let Some(broker) = self.broker_link() else {
            warn!(%destination, "dropping message with no relay path");
            return;
        };
        broker.transmit(Message::RelayMessage { destination, data }, objects);
    }

    /// Broker side: forward a relayed envelope to its destination.
    pub(crate) fn relay_from(
        &self,
        source: NodeName,
        destination: NodeName,
        data: Vec<u8>,
        objects: Vec<DriverObject>,
    ) {
        let Some(link) = self.connection_to(destination) else {
            debug!(%destination, "dropping relayed message for unknown node");
            return;
        };
        link.transmit(Message::AcceptRelayedMessage { source, data }, objects);
    }

    /// Receiving side: dispatch a relayed envelope as if it had arrived on
    /// the direct link to `source`.
    pub(crate) fn accept_relayed_message(
        &self,
        source: NodeName,
        data: Vec<u8>,
        objects: Vec<DriverObject>,
    ) -> bool {
        match self.connection_to(source) {
            Some(link) => node_link::dispatch_relayed_message(&link, &data, objects),
            // The direct link is already gone; nothing left to deliver to.
            None => true,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name())
            .field("node_type", &self.node_type)
            .finish_non_exhaustive()
    }
}
