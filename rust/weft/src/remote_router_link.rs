use std::sync::Arc;

use parking_lot::Mutex;

use weft_wire::{
    BlockDescriptor, LinkSide, LinkType, Message, NodeName, SequenceNumber, SublinkId,
};

use crate::driver::DriverObject;
use crate::link_state::RouterLinkState;
use crate::node_link::NodeLink;
use crate::parcel::{Attachment, Parcel};
use crate::router_link::RouterLink;

/// One router's handle onto a sublink of a `NodeLink`.
///
/// Transmitting a parcel here is where route extension happens: any portal
/// attached to the parcel is serialized into a `RouterDescriptor`, its
/// router stays behind as a proxy, and a reconstructed router appears at the
/// other end.
pub(crate) struct RemoteRouterLink {
    node_link: Arc<NodeLink>,
    sublink: SublinkId,
    link_type: LinkType,
    side: LinkSide,
    /// Present on central links only. Set at construction; cloned out for
    /// use so no lock is held across shared-state operations.
    state: Mutex<Option<RouterLinkState>>,
    /// True on the side that allocated the state block from link memory.
    /// That side returns it to the pool on deactivation.
    owns_state_block: bool,
}

impl RemoteRouterLink {
    pub(crate) fn new(
        node_link: Arc<NodeLink>,
        sublink: SublinkId,
        link_type: LinkType,
        side: LinkSide,
        state: Option<RouterLinkState>,
        owns_state_block: bool,
    ) -> Arc<Self> {
        debug_assert!(state.is_none() || link_type == LinkType::Central);
        Arc::new(Self {
            node_link,
            sublink,
            link_type,
            side,
            state: Mutex::new(state),
            owns_state_block,
        })
    }

    fn link_state(&self) -> Option<RouterLinkState> {
        self.state.lock().clone()
    }

    fn transmit(&self, message: Message) {
        self.node_link.transmit(message, Vec::new());
    }
}

impl RouterLink for RemoteRouterLink {
    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn accept_parcel(&self, mut parcel: Parcel) {
        let handle_types = parcel.handle_types();
        let mut new_routers = Vec::new();
        let mut objects: Vec<DriverObject> = Vec::new();
        let mut moved = Vec::new();
        for attachment in parcel.take_attachments() {
            match attachment {
                Attachment::Router(router) => {
                    match router.serialize_new_router(&self.node_link) {
                        Some((descriptor, inward_link)) => {
                            new_routers.push(descriptor);
                            moved.push((router, inward_link));
                        }
                        // The node link is gone; this whole parcel is about
                        // to be dropped with it. Sever the moved route so
                        // its peer finds out.
                        None => {
                            router.accept_route_disconnected_from(LinkType::Central);
                        }
                    }
                }
                Attachment::Object(object) => objects.push(object),
            }
        }
        let message = Message::AcceptParcel {
            sublink: self.sublink,
            sequence_number: parcel.sequence_number(),
            data: parcel.into_data(),
            handle_types,
            new_routers,
        };
        self.node_link.transmit(message, objects);
        // Only once the descriptor is on the wire may the serialized routers
        // start forwarding to their moved counterparts.
        for (router, inward_link) in moved {
            router.begin_proxying_to_new_router(inward_link);
        }
    }

    fn accept_route_closure(&self, sequence_length: SequenceNumber) {
        self.transmit(Message::RouteClosed {
            sublink: self.sublink,
            sequence_length,
        });
    }

    fn accept_route_disconnected(&self) {
        self.transmit(Message::RouteDisconnected {
            sublink: self.sublink,
        });
    }

    fn deactivate(&self) {
        self.node_link.remove_sublink(self.sublink);
        let state = self.state.lock().take();
        if self.owns_state_block {
            if let Some(descriptor) = state.and_then(|s| s.block_descriptor()) {
                self.node_link.memory().free_block(&descriptor);
            }
        }
    }

    fn local_peer(&self) -> Option<Arc<crate::router::Router>> {
        None
    }

    fn mark_side_stable(&self) {
        let Some(state) = self.link_state() else { return };
        if state.mark_side_stable(self.side) {
            self.transmit(Message::FlushRouter {
                sublink: self.sublink,
            });
        }
    }

    fn try_lock_for_bypass(&self, bypass_request_source: NodeName) -> bool {
        let Some(state) = self.link_state() else {
            return false;
        };
        if !state.try_lock(self.side) {
            return false;
        }
        state.set_allowed_bypass_request_source(bypass_request_source);
        true
    }

    fn try_lock_for_closure(&self) -> bool {
        self.link_state().is_some_and(|state| state.try_lock(self.side))
    }

    fn unlock(&self) {
        let Some(state) = self.link_state() else { return };
        if state.unlock(self.side) {
            self.transmit(Message::FlushRouter {
                sublink: self.sublink,
            });
        }
    }

    fn try_mark_waiting(&self) -> bool {
        self.link_state()
            .is_some_and(|state| state.try_mark_waiting(self.side))
    }

    fn can_node_request_bypass(&self, node: NodeName) -> bool {
        self.link_state()
            .is_some_and(|state| state.can_node_request_bypass(self.side, node))
    }

    fn request_proxy_bypass(
        &self,
        bypass_target_node: NodeName,
        bypass_target_sublink: SublinkId,
    ) {
        self.transmit(Message::BypassPeer {
            sublink: self.sublink,
            bypass_target_node,
            bypass_target_sublink,
        });
    }

    fn stop_proxying(
        &self,
        inbound_sequence_length: SequenceNumber,
        outbound_sequence_length: SequenceNumber,
    ) {
        self.transmit(Message::StopProxying {
            sublink: self.sublink,
            inbound_sequence_length,
            outbound_sequence_length,
        });
    }

    fn proxy_will_stop(&self, inbound_sequence_length: SequenceNumber) {
        self.transmit(Message::ProxyWillStop {
            sublink: self.sublink,
            inbound_sequence_length,
        });
    }

    fn bypass_peer_with_link(
        &self,
        new_sublink: SublinkId,
        new_link_state: BlockDescriptor,
        inbound_sequence_length: SequenceNumber,
    ) {
        self.transmit(Message::BypassPeerWithLink {
            sublink: self.sublink,
            new_sublink,
            new_link_state,
            inbound_sequence_length,
        });
    }

    fn stop_proxying_to_local_peer(&self, outbound_sequence_length: SequenceNumber) {
        self.transmit(Message::StopProxyingToLocalPeer {
            sublink: self.sublink,
            outbound_sequence_length,
        });
    }

    fn is_remote_link_on(&self, node_link: &Arc<NodeLink>, sublink: SublinkId) -> bool {
        Arc::ptr_eq(&self.node_link, node_link) && self.sublink == sublink
    }

    fn remote_endpoint(&self) -> Option<(Arc<NodeLink>, SublinkId)> {
        Some((self.node_link.clone(), self.sublink))
    }

    fn describe(&self) -> String {
        format!(
            "{} {} (side {}) to {}",
            self.link_type,
            self.sublink,
            self.side,
            self.node_link.remote_node_name()
        )
    }
}
