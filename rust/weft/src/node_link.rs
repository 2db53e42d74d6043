//! One active connection between two nodes.
//!
//! A `NodeLink` multiplexes any number of routes over a single transport by
//! sublink id, owns the link's shared memory, and dispatches every inbound
//! wire message. Returning `false` from a handler reports a protocol
//! violation; the driver severs the transport and both sides observe a
//! disconnection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use weft_memory::{BlockAllocator, BlockRef, LinkMemory, LINK_STATE_WORDS};
use weft_wire::{
    BlockDescriptor, Envelope, HandleType, LinkSide, LinkType, Message, NodeName, NodeType,
    SequenceNumber, SublinkId,
};

use crate::driver::{DriverObject, Frame, Transport, TransportListener};
use crate::link_state::RouterLinkState;
use crate::node::Node;
use crate::parcel::{Attachment, Parcel};
use crate::remote_router_link::RemoteRouterLink;
use crate::router::Router;

/// Blocks granted per expansion buffer.
const EXPANSION_BUFFER_CAPACITY: u32 = 64;

struct Sublink {
    link_type: LinkType,
    receiver: Arc<Router>,
}

pub(crate) struct NodeLink {
    node: Arc<Node>,
    link_side: LinkSide,
    remote_node_name: NodeName,
    remote_node_type: NodeType,
    transport: Arc<dyn Transport>,
    memory: Arc<LinkMemory>,
    active: AtomicBool,
    next_outgoing_sequence: AtomicU64,
    sublinks: Mutex<HashMap<SublinkId, Sublink>>,
}

impl NodeLink {
    pub(crate) fn new(
        node: Arc<Node>,
        link_side: LinkSide,
        remote_node_name: NodeName,
        remote_node_type: NodeType,
        transport: Arc<dyn Transport>,
        memory: Arc<LinkMemory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node,
            link_side,
            remote_node_name,
            remote_node_type,
            transport,
            memory,
            // Cleared on close; a closed link accepts no new sublinks.
            active: AtomicBool::new(true),
            // The connection handshake used envelope 0.
            next_outgoing_sequence: AtomicU64::new(1),
            sublinks: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub(crate) fn memory(&self) -> &Arc<LinkMemory> {
        &self.memory
    }

    pub(crate) fn remote_node_name(&self) -> NodeName {
        self.remote_node_name
    }

    pub(crate) fn remote_node_type(&self) -> NodeType {
        self.remote_node_type
    }

    pub(crate) fn link_side(&self) -> LinkSide {
        self.link_side
    }

    /// Take over the transport and start dispatching frames, including any
    /// that queued up during the handshake.
    pub(crate) fn activate(self: &Arc<Self>) {
        self.transport
            .activate(Arc::new(NodeLinkListener(self.clone())));
    }

    /// Register a route over `sublink`, delivering its traffic to
    /// `receiver`. Fails if the sublink is already taken or the link has
    /// been torn down.
    pub(crate) fn add_remote_router_link(
        self: &Arc<Self>,
        sublink: SublinkId,
        link_type: LinkType,
        side: LinkSide,
        state: Option<RouterLinkState>,
        owns_state_block: bool,
        receiver: Arc<Router>,
    ) -> Option<Arc<RemoteRouterLink>> {
        let mut sublinks = self.sublinks.lock();
        if !self.active.load(Ordering::Acquire) || sublinks.contains_key(&sublink) {
            return None;
        }
        trace!(%sublink, %link_type, "adding remote router link");
        sublinks.insert(sublink, Sublink { link_type, receiver });
        Some(RemoteRouterLink::new(
            self.clone(),
            sublink,
            link_type,
            side,
            state,
            owns_state_block,
        ))
    }

    pub(crate) fn remove_sublink(&self, sublink: SublinkId) {
        self.sublinks.lock().remove(&sublink);
    }

    pub(crate) fn sublink_receiver(&self, sublink: SublinkId) -> Option<Arc<Router>> {
        self.sublinks
            .lock()
            .get(&sublink)
            .map(|s| s.receiver.clone())
    }

    fn sublink_entry(&self, sublink: SublinkId) -> Option<(LinkType, Arc<Router>)> {
        self.sublinks
            .lock()
            .get(&sublink)
            .map(|s| (s.link_type, s.receiver.clone()))
    }

    /// Send a message, falling back to a broker relay when the transport
    /// cannot carry one of the attached driver objects.
    pub(crate) fn transmit(&self, message: Message, objects: Vec<DriverObject>) {
        let envelope = Envelope {
            sequence_number: self.next_outgoing_sequence.fetch_add(1, Ordering::Relaxed),
            message,
        };
        let data = envelope.encode();
        if objects.iter().all(|o| self.transport.can_transmit(o)) {
            if self.transport.transmit(Frame { data, objects }).is_err() {
                trace!("dropping message for severed transport");
            }
        } else if self.remote_node_type == NodeType::Broker {
            // Broker links are the relay of last resort; there is nowhere
            // else to turn.
            warn!("dropping message with untransmittable objects");
        } else {
            self.node.relay_message(self.remote_node_name, data, objects);
        }
    }

    pub(crate) fn transmit_accept_bypass_link(
        &self,
        current_peer_node: NodeName,
        current_peer_sublink: SublinkId,
        inbound_sequence_length_from_bypassed_link: SequenceNumber,
        new_sublink: SublinkId,
        new_link_state: BlockDescriptor,
    ) {
        self.transmit(
            Message::AcceptBypassLink {
                current_peer_node,
                current_peer_sublink,
                inbound_sequence_length_from_bypassed_link,
                new_sublink,
                new_link_state,
            },
            Vec::new(),
        );
    }

    /// A link-state block from this link's memory pool, growing the pool by
    /// one shared buffer if the existing ones are full.
    pub(crate) fn allocate_link_state_block(&self) -> Option<BlockRef> {
        let size = (LINK_STATE_WORDS * 8) as u32;
        if let Some(block) = self.memory.allocate_block(size) {
            return Some(block);
        }
        if !self.add_block_capacity(size) {
            return None;
        }
        self.memory.allocate_block(size)
    }

    /// Allocate a new buffer of `block_size` blocks, register it locally,
    /// and share it with the other side.
    fn add_block_capacity(&self, block_size: u32) -> bool {
        let id = self.memory.allocate_new_buffer_id();
        let region = self.node.driver().allocate_region(
            BlockAllocator::words_required(block_size, EXPANSION_BUFFER_CAPACITY),
        );
        if !self
            .memory
            .register_block_buffer(id, block_size, region.clone(), true)
        {
            return false;
        }
        debug!(%id, block_size, "sharing new block buffer");
        self.transmit(
            Message::AddBlockBuffer {
                id,
                block_size,
                buffer: 0,
            },
            vec![DriverObject::Memory(region)],
        );
        true
    }

    /// Tear down every route on this link. Used for both transport failure
    /// and local node shutdown.
    pub(crate) fn close(self: &Arc<Self>, disconnect_transport: bool) {
        let sublinks = {
            let mut sublinks = self.sublinks.lock();
            self.active.store(false, Ordering::Release);
            std::mem::take(&mut *sublinks)
        };
        for (_, sublink) in sublinks {
            sublink
                .receiver
                .accept_route_disconnected_from(sublink.link_type);
        }
        if disconnect_transport {
            self.transport.deactivate();
            self.transport.disconnect();
        }
    }

    fn handle_transport_error(self: &Arc<Self>) {
        warn!(remote = %self.remote_node_name, "node link severed");
        self.close(false);
        self.node.drop_connection(self.remote_node_name);
    }

    fn handle_message(self: &Arc<Self>, message: Message, objects: Vec<DriverObject>) -> bool {
        match message {
            // The handshake is over by the time this link exists.
            Message::ConnectFromBroker { .. } | Message::ConnectFromNonBroker { .. } => false,

            Message::AcceptParcel {
                sublink,
                sequence_number,
                data,
                handle_types,
                new_routers,
            } => self.handle_accept_parcel(sublink, sequence_number, data, handle_types, new_routers, objects),

            Message::RouteClosed {
                sublink,
                sequence_length,
            } => match self.sublink_entry(sublink) {
                Some((link_type, receiver)) => {
                    receiver.accept_route_closure_from(link_type, sequence_length)
                }
                None => true,
            },

            Message::RouteDisconnected { sublink } => {
                if let Some((link_type, receiver)) = self.sublink_entry(sublink) {
                    receiver.accept_route_disconnected_from(link_type);
                }
                true
            }

            Message::FlushRouter { sublink } => {
                if let Some(receiver) = self.sublink_receiver(sublink) {
                    receiver.flush();
                }
                true
            }

            Message::RequestIntroduction { name } => {
                if self.node.node_type() != NodeType::Broker {
                    return false;
                }
                self.node.handle_introduction_request(self, name);
                true
            }

            Message::AcceptIntroduction {
                name,
                link_side,
                remote_node_type,
                transport,
                memory,
            } => {
                if self.remote_node_type != NodeType::Broker {
                    return false;
                }
                let Some(DriverObject::Transport(transport)) = objects.get(transport as usize)
                else {
                    return false;
                };
                let Some(DriverObject::Memory(region)) = objects.get(memory as usize) else {
                    return false;
                };
                self.node.accept_introduction(
                    name,
                    link_side,
                    remote_node_type,
                    transport.clone(),
                    region.clone(),
                )
            }

            Message::RejectIntroduction { name } => {
                if self.remote_node_type != NodeType::Broker {
                    return false;
                }
                self.node.cancel_introduction(name);
                true
            }

            Message::AddBlockBuffer {
                id,
                block_size,
                buffer,
            } => {
                let Some(DriverObject::Memory(region)) = objects.get(buffer as usize) else {
                    return false;
                };
                self.memory
                    .register_block_buffer(id, block_size, region.clone(), false)
            }

            Message::BypassPeer {
                sublink,
                bypass_target_node,
                bypass_target_sublink,
            } => match self.sublink_receiver(sublink) {
                Some(router) => {
                    router.bypass_peer(self, sublink, bypass_target_node, bypass_target_sublink)
                }
                None => true,
            },

            Message::AcceptBypassLink {
                current_peer_node,
                current_peer_sublink,
                inbound_sequence_length_from_bypassed_link,
                new_sublink,
                new_link_state,
            } => {
                let Some(old_node_link) = self.node.connection_to(current_peer_node) else {
                    // The link to the proxy is already gone; the route will
                    // resolve through disconnection instead.
                    return true;
                };
                let Some(target) = old_node_link.sublink_receiver(current_peer_sublink) else {
                    return true;
                };
                let state = self
                    .memory
                    .resolve(&new_link_state)
                    .map(RouterLinkState::over_block);
                let Some(new_link) = self.add_remote_router_link(
                    new_sublink,
                    LinkType::Central,
                    LinkSide::B,
                    state,
                    false,
                    target.clone(),
                ) else {
                    return false;
                };
                target.accept_bypass_link(
                    &old_node_link,
                    current_peer_sublink,
                    self.remote_node_name,
                    new_link,
                    inbound_sequence_length_from_bypassed_link,
                )
            }

            Message::StopProxying {
                sublink,
                inbound_sequence_length,
                outbound_sequence_length,
            } => match self.sublink_receiver(sublink) {
                Some(router) => {
                    router.stop_proxying(inbound_sequence_length, outbound_sequence_length)
                }
                None => true,
            },

            Message::ProxyWillStop {
                sublink,
                inbound_sequence_length,
            } => match self.sublink_receiver(sublink) {
                Some(router) => router.proxy_will_stop(inbound_sequence_length),
                None => true,
            },

            Message::BypassPeerWithLink {
                sublink,
                new_sublink,
                new_link_state,
                inbound_sequence_length,
            } => {
                let Some(router) = self.sublink_receiver(sublink) else {
                    return true;
                };
                let state = self
                    .memory
                    .resolve(&new_link_state)
                    .map(RouterLinkState::over_block);
                let Some(new_link) = self.add_remote_router_link(
                    new_sublink,
                    LinkType::Central,
                    LinkSide::B,
                    state,
                    false,
                    router.clone(),
                ) else {
                    return false;
                };
                router.accept_bypass_peer_with_link(
                    self,
                    sublink,
                    new_link,
                    inbound_sequence_length,
                )
            }

            Message::StopProxyingToLocalPeer {
                sublink,
                outbound_sequence_length,
            } => match self.sublink_receiver(sublink) {
                Some(router) => router.stop_proxying_to_local_peer(outbound_sequence_length),
                None => true,
            },

            Message::RelayMessage { destination, data } => {
                if self.node.node_type() != NodeType::Broker {
                    return false;
                }
                self.node
                    .relay_from(self.remote_node_name, destination, data, objects);
                true
            }

            Message::AcceptRelayedMessage { source, data } => {
                if self.remote_node_type != NodeType::Broker {
                    return false;
                }
                self.node.accept_relayed_message(source, data, objects)
            }
        }
    }

    fn handle_accept_parcel(
        self: &Arc<Self>,
        sublink: SublinkId,
        sequence_number: SequenceNumber,
        data: Vec<u8>,
        handle_types: Vec<HandleType>,
        new_routers: Vec<weft_wire::RouterDescriptor>,
        objects: Vec<DriverObject>,
    ) -> bool {
        let mut objects = objects.into_iter();
        let mut descriptors = new_routers.iter();
        let mut attachments = Vec::with_capacity(handle_types.len());
        for handle_type in &handle_types {
            match handle_type {
                HandleType::Portal => {
                    let Some(descriptor) = descriptors.next() else {
                        return false;
                    };
                    let Some(router) = Router::deserialize(descriptor, self) else {
                        return false;
                    };
                    attachments.push(Attachment::Router(router));
                }
                HandleType::Box => {
                    let Some(object) = objects.next() else {
                        return false;
                    };
                    attachments.push(Attachment::Object(object));
                }
            }
        }
        // Every attachment slot must be claimed by exactly one handle.
        if descriptors.next().is_some() || objects.next().is_some() {
            return false;
        }

        let mut parcel = Parcel::new(data, attachments);
        parcel.set_sequence_number(sequence_number);
        match self.sublink_entry(sublink) {
            Some((link_type, receiver)) => receiver.accept_parcel_from_link(link_type, parcel),
            None => {
                // Benign race with route teardown; any portals that moved
                // with the parcel observe closure.
                trace!(%sublink, "dropping parcel for unknown sublink");
                parcel.close_attachments();
                true
            }
        }
    }

    /// A relayed envelope from `self.remote_node_name`'s broker role,
    /// originally sent by `source`. Dispatched as if it had arrived on the
    /// direct link to `source`.
    fn dispatch_relayed(self: &Arc<Self>, data: &[u8], objects: Vec<DriverObject>) -> bool {
        let Ok(envelope) = Envelope::decode(data) else {
            return false;
        };
        self.handle_message(envelope.message, objects)
    }
}

pub(crate) fn dispatch_relayed_message(
    link: &Arc<NodeLink>,
    data: &[u8],
    objects: Vec<DriverObject>,
) -> bool {
    link.dispatch_relayed(data, objects)
}

struct NodeLinkListener(Arc<NodeLink>);

impl TransportListener for NodeLinkListener {
    fn on_frame(&self, frame: Frame) -> bool {
        match Envelope::decode(&frame.data) {
            Ok(envelope) => self.0.handle_message(envelope.message, frame.objects),
            Err(_) => false,
        }
    }

    fn on_error(&self) {
        self.0.handle_transport_error();
    }
}
