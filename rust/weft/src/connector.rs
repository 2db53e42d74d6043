//! The connection handshake.
//!
//! Each side of a new transport sends exactly one connect message as
//! envelope zero and waits for the other side's. The broker allocates the
//! link memory and a name for its peer. Once both messages are exchanged the
//! transport is handed over to a full `NodeLink` and the initial portals are
//! paired up by index.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use weft_memory::{LinkMemory, MAX_INITIAL_PORTALS};
use weft_wire::{
    Envelope, LinkSide, LinkType, Message, NodeName, NodeType, SequenceNumber, SublinkId,
};

use crate::driver::{DriverObject, Frame, Transport, TransportListener};
use crate::error::Error;
use crate::link_state::RouterLinkState;
use crate::node::Node;
use crate::node_link::NodeLink;
use crate::portal::Portal;
use crate::router::Router;

pub(crate) fn connect(
    node: &Arc<Node>,
    transport: Arc<dyn Transport>,
    num_initial_portals: usize,
) -> Result<Vec<Portal>, Error> {
    if num_initial_portals > MAX_INITIAL_PORTALS {
        return Err(Error::InvalidArgument);
    }
    let routers: Vec<Arc<Router>> = (0..num_initial_portals).map(|_| Router::new()).collect();

    let message;
    let mut objects = Vec::new();
    let mut memory = None;
    let mut assigned_peer_name = None;
    match node.node_type() {
        NodeType::Broker => {
            let (link_memory, region) = LinkMemory::create(
                node.driver()
                    .allocate_region(LinkMemory::primary_buffer_words()),
            );
            let peer_name = crate::node::random_name(node.driver().as_ref());
            message = Message::ConnectFromBroker {
                broker_name: node.name(),
                assigned_name: peer_name,
                num_initial_portals: num_initial_portals as u32,
                buffer: 0,
            };
            objects.push(DriverObject::Memory(region));
            memory = Some(Arc::new(link_memory));
            assigned_peer_name = Some(peer_name);
        }
        NodeType::Normal => {
            message = Message::ConnectFromNonBroker {
                num_initial_portals: num_initial_portals as u32,
            };
        }
    }

    let connector = Arc::new(Connector {
        node: node.clone(),
        transport: transport.clone(),
        state: Mutex::new(ConnectorState {
            routers: routers.clone(),
            memory,
            assigned_peer_name,
            finished: false,
        }),
    });

    let envelope = Envelope {
        sequence_number: 0,
        message,
    };
    transport
        .transmit(Frame {
            data: envelope.encode(),
            objects,
        })
        .map_err(|_| Error::Unavailable)?;
    transport.activate(connector);

    Ok(routers
        .into_iter()
        .map(|router| Portal::new(node, router))
        .collect())
}

struct ConnectorState {
    routers: Vec<Arc<Router>>,
    /// Broker side only, created before the handshake.
    memory: Option<Arc<LinkMemory>>,
    assigned_peer_name: Option<NodeName>,
    finished: bool,
}

struct Connector {
    node: Arc<Node>,
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectorState>,
}

impl Connector {
    /// Both connect messages are in hand: build the link, wire up the
    /// initial portals, and let the link take over the transport.
    fn finish(
        &self,
        remote_name: NodeName,
        remote_node_type: NodeType,
        remote_portal_count: usize,
        memory: Arc<LinkMemory>,
    ) -> bool {
        let routers = {
            let mut state = self.state.lock();
            if state.finished {
                return false;
            }
            state.finished = true;
            std::mem::take(&mut state.routers)
        };

        let link_side = match self.node.node_type() {
            NodeType::Broker => LinkSide::A,
            NodeType::Normal => LinkSide::B,
        };
        let link = NodeLink::new(
            self.node.clone(),
            link_side,
            remote_name,
            remote_node_type,
            self.transport.clone(),
            memory,
        );
        if !self.node.add_connection(link.clone()) {
            warn!(remote = %remote_name, "duplicate connection");
            return false;
        }

        let paired = routers.len().min(remote_portal_count);
        for (index, router) in routers.iter().enumerate() {
            if index < paired {
                let Some(block) = link.memory().initial_link_state(index) else {
                    return false;
                };
                let Some(remote_link) = link.add_remote_router_link(
                    SublinkId(index as u64),
                    LinkType::Central,
                    link_side,
                    Some(RouterLinkState::over_block(block)),
                    false,
                    router.clone(),
                ) else {
                    return false;
                };
                router.set_outward_link(remote_link);
            } else {
                // The other side brought fewer portals; ours have no peer.
                router.accept_route_closure_from(LinkType::Central, SequenceNumber::ZERO);
            }
        }

        debug!(remote = %remote_name, portals = paired, "connection established");
        link.activate();
        for router in &routers {
            router.flush();
        }
        true
    }
}

impl TransportListener for Connector {
    fn on_frame(&self, frame: Frame) -> bool {
        let Ok(envelope) = Envelope::decode(&frame.data) else {
            return false;
        };
        match (self.node.node_type(), envelope.message) {
            (NodeType::Broker, Message::ConnectFromNonBroker { num_initial_portals }) => {
                let (memory, peer_name) = {
                    let state = self.state.lock();
                    match (&state.memory, state.assigned_peer_name) {
                        (Some(memory), Some(name)) => (memory.clone(), name),
                        _ => return false,
                    }
                };
                self.finish(
                    peer_name,
                    NodeType::Normal,
                    num_initial_portals as usize,
                    memory,
                )
            }
            (
                NodeType::Normal,
                Message::ConnectFromBroker {
                    broker_name,
                    assigned_name,
                    num_initial_portals,
                    buffer,
                },
            ) => {
                if !broker_name.is_valid() || !assigned_name.is_valid() {
                    return false;
                }
                let Some(DriverObject::Memory(region)) = frame.objects.get(buffer as usize)
                else {
                    return false;
                };
                self.node.set_assigned_name(assigned_name, broker_name);
                self.finish(
                    broker_name,
                    NodeType::Broker,
                    num_initial_portals as usize,
                    Arc::new(LinkMemory::adopt(region.clone())),
                )
            }
            _ => false,
        }
    }

    fn on_error(&self) {
        let routers = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            std::mem::take(&mut state.routers)
        };
        debug!("transport severed during handshake");
        for router in routers {
            router.accept_route_disconnected_from(LinkType::Central);
        }
    }
}
