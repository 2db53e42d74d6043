//! The router: one hop of one route.
//!
//! Every portal owns a terminal router. Moving a portal to another node
//! leaves its old router behind as a proxy, which forwards parcels in both
//! directions until the routers on either side of it agree to bypass it.
//!
//! Locking discipline: a router never calls into a link, another router, or
//! a trap handler while holding its own state lock. Work is collected under
//! the lock and performed after release, so links are free to call straight
//! back into any router.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use weft_wire::{LinkSide, LinkType, NodeName, RouterDescriptor, SequenceNumber, SublinkId};

use crate::error::Error;
use crate::link_state::RouterLinkState;
use crate::node_link::NodeLink;
use crate::parcel::Parcel;
use crate::route_edge::RouteEdge;
use crate::router_link::RouterLink;
use crate::sequenced_queue::SequencedQueue;
use crate::trap::{
    conditions, PortalStatus, TrapConditions, TrapEvent, TrapEventDispatcher, TrapHandler,
    TrapSet, UpdateReason,
};

struct RouterState {
    /// PEER_CLOSED / DEAD bits, refreshed on every relevant transition.
    status_flags: u64,
    traps: TrapSet,
    outward: RouteEdge,
    /// Present while this router proxies for a router that superseded it.
    inward: Option<RouteEdge>,
    /// Present after a portal merge joined this route to another.
    bridge: Option<RouteEdge>,
    /// Parcels traveling toward this side's terminal portal.
    inbound: SequencedQueue<Parcel>,
    /// Parcels traveling away from it.
    outbound: SequencedQueue<Parcel>,
    closed: bool,
    disconnected: bool,
    /// RouteClosed already forwarded inward (or across the bridge).
    inbound_closure_propagated: bool,
    /// RouteClosed already sent outward.
    outbound_closure_propagated: bool,
    in_two_phase_get: bool,
}

impl RouterState {
    fn new(outbound_base: SequenceNumber, inbound_base: SequenceNumber) -> Self {
        Self {
            status_flags: 0,
            traps: TrapSet::default(),
            outward: RouteEdge::default(),
            inward: None,
            bridge: None,
            inbound: SequencedQueue::new(inbound_base),
            outbound: SequencedQueue::new(outbound_base),
            closed: false,
            disconnected: false,
            inbound_closure_propagated: false,
            outbound_closure_propagated: false,
            in_two_phase_get: false,
        }
    }

    fn is_terminal(&self) -> bool {
        self.inward.is_none() && self.bridge.is_none()
    }

    /// The edge inbound parcels are forwarded to, for non-terminal routers.
    fn forward_edge(&mut self) -> Option<&mut RouteEdge> {
        self.inward.as_mut().or(self.bridge.as_mut())
    }

    fn portal_status(&self) -> PortalStatus {
        let mut flags = self.status_flags;
        if self.inbound.has_next_element() {
            flags |= conditions::NEW_LOCAL_PARCEL;
        }
        PortalStatus {
            flags,
            num_local_parcels: self.inbound.num_available(),
            num_local_bytes: self.inbound.available_bytes(),
        }
    }

    /// Recompute PEER_CLOSED / DEAD. Returns true on change.
    fn refresh_status_flags(&mut self) -> bool {
        let mut flags = 0;
        if self.is_terminal() && self.inbound.final_sequence_length().is_some() {
            flags |= conditions::PEER_CLOSED;
            if self.inbound.is_sequence_fully_consumed() {
                flags |= conditions::DEAD;
            }
        }
        let changed = flags != self.status_flags;
        self.status_flags = flags;
        changed
    }

    fn update_traps_on_peer_state_change(&mut self, dispatcher: &mut TrapEventDispatcher) {
        if self.refresh_status_flags() {
            let status = self.portal_status();
            self.traps
                .update(&status, UpdateReason::PeerStateChange, dispatcher);
        }
    }
}

/// See the module docs. All public entry points take `&Arc<Self>` because a
/// router frequently hands references to itself to links it creates.
pub struct Router {
    state: Mutex<RouterState>,
}

impl Router {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_sequence_bases(SequenceNumber::ZERO, SequenceNumber::ZERO)
    }

    fn with_sequence_bases(outbound: SequenceNumber, inbound: SequenceNumber) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RouterState::new(outbound, inbound)),
        })
    }

    /// A fresh pair of terminal routers joined by a local central link.
    pub(crate) fn pair() -> (Arc<Router>, Arc<Router>) {
        let a = Router::new();
        let b = Router::new();
        let (link_a, link_b) = crate::local_router_link::LocalRouterLink::new_pair(
            LinkType::Central,
            &a,
            &b,
        );
        a.state.lock().outward.set_primary_link(link_a);
        b.state.lock().outward.set_primary_link(link_b);
        (a, b)
    }

    // ==================================================================
    // Portal-facing operations
    // ==================================================================

    pub(crate) fn query_status(&self) -> PortalStatus {
        self.state.lock().portal_status()
    }

    /// The router on the other side of a local central link, if any.
    pub(crate) fn local_peer(&self) -> Option<Arc<Router>> {
        let state = self.state.lock();
        state.outward.primary_link().and_then(|l| l.local_peer())
    }

    pub(crate) fn send_outbound_parcel(self: &Arc<Self>, mut parcel: Parcel) -> Result<(), Error> {
        enum Path {
            Direct(Arc<dyn RouterLink>, Parcel),
            Queued,
            Failed(Error, Parcel),
        }
        let path = {
            let mut state = self.state.lock();
            if state.closed {
                Path::Failed(Error::InvalidArgument, parcel)
            } else if state.status_flags & conditions::PEER_CLOSED != 0 || state.disconnected {
                Path::Failed(Error::NotFound, parcel)
            } else {
                let n = state.outbound.current_sequence_length();
                parcel.set_sequence_number(n);
                let direct = if state.outbound.has_next_element() {
                    None
                } else {
                    state.outward.link_for_transmission(n).cloned()
                };
                match direct {
                    Some(link) => {
                        state.outbound.skip_next_sequence_number();
                        Path::Direct(link, parcel)
                    }
                    None => match state.outbound.push(n, parcel) {
                        Ok(()) => Path::Queued,
                        Err(parcel) => Path::Failed(Error::NotFound, parcel),
                    },
                }
            }
        };
        match path {
            Path::Direct(link, parcel) => {
                trace!(parcel = %parcel.sequence_number(), "transmitting parcel directly");
                link.accept_parcel(parcel);
            }
            Path::Queued => self.flush(),
            Path::Failed(error, mut parcel) => {
                // A refused parcel may carry portals whose peers are waiting.
                parcel.close_attachments();
                return Err(error);
            }
        }
        Ok(())
    }

    pub(crate) fn get_next_inbound_parcel(self: &Arc<Self>) -> Result<Parcel, Error> {
        let mut dispatcher = TrapEventDispatcher::default();
        let mut state = self.state.lock();
        if state.in_two_phase_get {
            return Err(Error::AlreadyExists);
        }
        match state.inbound.pop() {
            Some(parcel) => {
                state.update_traps_on_peer_state_change(&mut dispatcher);
                Ok(parcel)
            }
            None => {
                if state.inbound.final_sequence_length().is_some() {
                    Err(Error::NotFound)
                } else {
                    Err(Error::Unavailable)
                }
            }
        }
    }

    pub(crate) fn begin_get_inbound(self: &Arc<Self>) -> Result<Parcel, Error> {
        let mut dispatcher = TrapEventDispatcher::default();
        let mut state = self.state.lock();
        if state.in_two_phase_get {
            return Err(Error::AlreadyExists);
        }
        match state.inbound.pop() {
            Some(parcel) => {
                state.in_two_phase_get = true;
                state.update_traps_on_peer_state_change(&mut dispatcher);
                Ok(parcel)
            }
            None => {
                if state.inbound.final_sequence_length().is_some() {
                    Err(Error::NotFound)
                } else {
                    Err(Error::Unavailable)
                }
            }
        }
    }

    pub(crate) fn commit_get_inbound(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.in_two_phase_get);
        state.in_two_phase_get = false;
    }

    /// Return the rest of a partially consumed parcel to the queue front.
    pub(crate) fn restore_inbound_parcel(&self, parcel: Parcel) {
        let mut state = self.state.lock();
        debug_assert!(state.in_two_phase_get);
        state.in_two_phase_get = false;
        state.inbound.restore_front(parcel);
    }

    pub(crate) fn add_trap(
        &self,
        trap_conditions: TrapConditions,
        handler: TrapHandler,
        context: u64,
    ) -> Result<(), Error> {
        let fired = {
            let mut state = self.state.lock();
            let status = state.portal_status();
            match state.traps.add(trap_conditions, handler.clone(), context, &status) {
                Ok(()) => None,
                Err(flags) => Some((flags, status)),
            }
        };
        match fired {
            None => Ok(()),
            Some((flags, status)) => {
                handler(&TrapEvent {
                    context,
                    condition_flags: flags | conditions::WITHIN_API_CALL,
                    status,
                });
                Err(Error::FailedPrecondition)
            }
        }
    }

    /// Traps do not travel with a moved portal. Each one gets a REMOVED
    /// event before the router is packed into a parcel.
    pub(crate) fn remove_traps_for_transfer(&self) {
        let mut dispatcher = TrapEventDispatcher::default();
        {
            let mut state = self.state.lock();
            let status = state.portal_status();
            state.traps.remove_all(&status, &mut dispatcher);
        }
        drop(dispatcher);
    }

    /// Close this side of the route. The final outbound sequence length is
    /// fixed now; the other side learns it via RouteClosed and can keep
    /// retrieving everything sent before the close.
    pub(crate) fn close_route(self: &Arc<Self>) {
        let mut dispatcher = TrapEventDispatcher::default();
        let lock_target = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let final_len = state.outbound.current_sequence_length();
            let set = state.outbound.set_final_sequence_length(final_len);
            debug_assert!(set || state.disconnected);
            let status = state.portal_status();
            state.traps.remove_all(&status, &mut dispatcher);
            state.outward.primary_link().cloned()
        };
        debug!("closing route");
        // Keep the other side from starting a bypass around a link that is
        // about to carry closure.
        if let Some(link) = lock_target {
            let _ = link.try_lock_for_closure();
        }
        drop(dispatcher);
        self.flush();
    }

    /// Join this route to `other`'s via a bridge. Both routers must be
    /// unused terminals.
    pub(crate) fn merge_route(self: &Arc<Self>, other: &Arc<Router>) -> Result<(), Error> {
        if Arc::ptr_eq(self, other) || self.local_peer().is_some_and(|p| Arc::ptr_eq(&p, other)) {
            return Err(Error::InvalidArgument);
        }
        for router in [self, other] {
            let state = router.state.lock();
            let used = state.closed
                || state.bridge.is_some()
                || state.in_two_phase_get
                || state.outbound.current_sequence_length() != SequenceNumber::ZERO
                || state.inbound.next_sequence_number() != SequenceNumber::ZERO;
            if used {
                return Err(Error::FailedPrecondition);
            }
        }
        let (link_a, link_b) = crate::local_router_link::LocalRouterLink::new_pair(
            LinkType::Bridge,
            self,
            other,
        );
        for (router, link) in [(self, link_a), (other, link_b)] {
            let mut state = router.state.lock();
            let mut edge = RouteEdge::default();
            edge.set_primary_link(link);
            state.bridge = Some(edge);
        }
        self.flush();
        other.flush();
        Ok(())
    }

    // ==================================================================
    // Link-facing operations
    // ==================================================================

    pub(crate) fn set_outward_link(self: &Arc<Self>, link: Arc<dyn RouterLink>) {
        {
            let mut state = self.state.lock();
            if state.disconnected {
                // Disconnected while the link was in flight; the other side
                // still needs to hear about it.
                drop(state);
                link.accept_route_disconnected();
                link.deactivate();
                return;
            }
            state.outward.set_primary_link(link);
        }
        self.flush();
    }

    /// A parcel arrived over a link of type `link_type`.
    pub(crate) fn accept_parcel_from_link(
        self: &Arc<Self>,
        link_type: LinkType,
        parcel: Parcel,
    ) -> bool {
        if link_type.is_outward() {
            self.accept_inbound_parcel(parcel)
        } else {
            self.accept_outbound_parcel(parcel)
        }
    }

    fn accept_inbound_parcel(self: &Arc<Self>, parcel: Parcel) -> bool {
        let mut dispatcher = TrapEventDispatcher::default();
        let rejected = {
            let mut state = self.state.lock();
            let n = parcel.sequence_number();
            match state.inbound.push(n, parcel) {
                Ok(()) => {
                    trace!(parcel = %n, "accepted inbound parcel");
                    if state.is_terminal() {
                        let status = state.portal_status();
                        state
                            .traps
                            .update(&status, UpdateReason::NewLocalParcel, &mut dispatcher);
                    }
                    None
                }
                // A stale or duplicate sequence number. This can only follow
                // from a race already resolved elsewhere, so the parcel is
                // quietly dropped.
                Err(parcel) => Some(parcel),
            }
        };
        if let Some(mut parcel) = rejected {
            parcel.close_attachments();
            return true;
        }
        drop(dispatcher);
        self.flush();
        true
    }

    fn accept_outbound_parcel(self: &Arc<Self>, parcel: Parcel) -> bool {
        let rejected = {
            let mut state = self.state.lock();
            let n = parcel.sequence_number();
            state.outbound.push(n, parcel).err()
        };
        if let Some(mut parcel) = rejected {
            parcel.close_attachments();
            return true;
        }
        self.flush();
        true
    }

    /// The route beyond a link of type `link_type` closed cleanly at
    /// `sequence_length`. Returns false on a length that contradicts an
    /// earlier notification.
    pub(crate) fn accept_route_closure_from(
        self: &Arc<Self>,
        link_type: LinkType,
        sequence_length: SequenceNumber,
    ) -> bool {
        let mut dispatcher = TrapEventDispatcher::default();
        let ok = {
            let mut state = self.state.lock();
            let queue = if link_type.is_outward() {
                &mut state.inbound
            } else {
                &mut state.outbound
            };
            if !queue.set_final_sequence_length(sequence_length) {
                false
            } else {
                if link_type.is_outward() {
                    state.update_traps_on_peer_state_change(&mut dispatcher);
                }
                true
            }
        };
        if !ok {
            return false;
        }
        debug!(%sequence_length, ?link_type, "route closed");
        drop(dispatcher);
        self.flush();
        true
    }

    /// The route beyond a link of type `link_type` was severed without a
    /// final sequence length. Everything in flight that has not yet arrived
    /// is lost; everything already queued remains retrievable.
    pub(crate) fn accept_route_disconnected_from(self: &Arc<Self>, link_type: LinkType) -> bool {
        let mut dispatcher = TrapEventDispatcher::default();
        let links = {
            let mut state = self.state.lock();
            if state.disconnected {
                return true;
            }
            state.disconnected = true;
            state.inbound.force_terminate_sequence();
            state.outbound.force_terminate_sequence();
            let mut links = state.outward.take_all_links();
            if let Some(mut edge) = state.inward.take() {
                links.extend(edge.take_all_links());
            }
            if let Some(mut edge) = state.bridge.take() {
                links.extend(edge.take_all_links());
            }
            state.update_traps_on_peer_state_change(&mut dispatcher);
            links
        };
        debug!(?link_type, "route disconnected");
        for link in links {
            link.accept_route_disconnected();
            link.deactivate();
        }
        true
    }

    // ==================================================================
    // Route extension
    // ==================================================================

    /// Prepare this router to move to the other end of `node_link`. Returns
    /// the descriptor to transmit and the pre-registered inward link to
    /// adopt once the descriptor is on the wire, or `None` if the link was
    /// torn down in the meantime.
    pub(crate) fn serialize_new_router(
        self: &Arc<Self>,
        node_link: &Arc<NodeLink>,
    ) -> Option<(RouterDescriptor, Arc<dyn RouterLink>)> {
        let mut dispatcher = TrapEventDispatcher::default();
        let descriptor = {
            let mut state = self.state.lock();
            let status = state.portal_status();
            state.traps.remove_all(&status, &mut dispatcher);
            let peer_closed = state.inbound.final_sequence_length();
            if peer_closed.is_some() {
                // The descriptor already conveys closure; no RouteClosed
                // needs to follow it inward.
                state.inbound_closure_propagated = true;
            }
            RouterDescriptor {
                new_sublink: node_link.memory().allocate_sublink_ids(1),
                next_outgoing_sequence_number: state.outbound.current_sequence_length(),
                next_incoming_sequence_number: state.inbound.next_sequence_number(),
                peer_closed: peer_closed.is_some(),
                closed_peer_sequence_length: peer_closed,
            }
        };
        let link = node_link.add_remote_router_link(
            descriptor.new_sublink,
            LinkType::PeripheralInward,
            LinkSide::A,
            None,
            false,
            self.clone(),
        )?;
        drop(dispatcher);
        Some((descriptor, link as Arc<dyn RouterLink>))
    }

    /// Build the router described by `descriptor` on the receiving node.
    /// `None` means the descriptor was invalid.
    pub(crate) fn deserialize(
        descriptor: &RouterDescriptor,
        node_link: &Arc<NodeLink>,
    ) -> Option<Arc<Router>> {
        let router = Router::with_sequence_bases(
            descriptor.next_outgoing_sequence_number,
            descriptor.next_incoming_sequence_number,
        );
        if descriptor.peer_closed {
            let length = descriptor.closed_peer_sequence_length?;
            let mut state = router.state.lock();
            if !state.inbound.set_final_sequence_length(length) {
                return None;
            }
            state.refresh_status_flags();
        }
        match node_link.add_remote_router_link(
            descriptor.new_sublink,
            LinkType::PeripheralOutward,
            LinkSide::B,
            None,
            false,
            router.clone(),
        ) {
            Some(link) => router.state.lock().outward.set_primary_link(link),
            // A sublink collision or a dying link makes the new router dead
            // on arrival. With the peer already closed it needs no link at
            // all; otherwise it starts out disconnected.
            None if descriptor.peer_closed => {}
            None => {
                router.accept_route_disconnected_from(LinkType::PeripheralOutward);
            }
        }
        debug!(sublink = %descriptor.new_sublink, "deserialized router");
        Some(router)
    }

    /// Adopt the inward link to a router just moved away over it. From here
    /// on this router is a proxy.
    pub(crate) fn begin_proxying_to_new_router(self: &Arc<Self>, link: Arc<dyn RouterLink>) {
        let adopted = {
            let mut state = self.state.lock();
            if state.disconnected {
                false
            } else {
                let mut edge = RouteEdge::default();
                edge.set_primary_link(link.clone());
                state.inward = Some(edge);
                true
            }
        };
        if !adopted {
            link.accept_route_disconnected();
            link.deactivate();
            return;
        }
        debug!("proxying to moved router");
        self.flush();
    }

    // ==================================================================
    // Proxy bypass
    // ==================================================================

    /// Called on the router inward of a proxy: the proxy asked us to link
    /// directly to its outward peer, which lives on `bypass_target_node` and
    /// reaches the proxy over `bypass_target_sublink`.
    pub(crate) fn bypass_peer(
        self: &Arc<Self>,
        requestor_link: &Arc<NodeLink>,
        requestor_sublink: SublinkId,
        bypass_target_node: NodeName,
        bypass_target_sublink: SublinkId,
    ) -> bool {
        {
            let state = self.state.lock();
            let Some(primary) = state.outward.primary_link() else {
                return true;
            };
            if !primary.is_remote_link_on(requestor_link, requestor_sublink) {
                return false;
            }
        }
        let node = requestor_link.node();
        if bypass_target_node == node.name() {
            // The proxy's outward peer lives on this very node: the link to
            // bypass is another sublink of the same NodeLink.
            let Some(peer) = requestor_link.sublink_receiver(bypass_target_sublink) else {
                return true;
            };
            return self.bypass_peer_on_same_node(&peer);
        }
        let this = self.clone();
        let proxy_node = requestor_link.remote_node_name();
        let proxy_sublink = requestor_sublink;
        node.establish_link(bypass_target_node, move |link| {
            let Some(link) = link else {
                debug!(target = %bypass_target_node, "bypass abandoned, no link to target");
                return;
            };
            this.connect_new_bypass_link(link, proxy_node, proxy_sublink);
        });
        true
    }

    /// Second half of [`bypass_peer`] for a remote target: allocate a fresh
    /// central link to the target over `node_link` and hand it over with an
    /// AcceptBypassLink, decaying our own link to the proxy.
    fn connect_new_bypass_link(
        self: &Arc<Self>,
        node_link: &Arc<NodeLink>,
        proxy_node: NodeName,
        proxy_sublink: SublinkId,
    ) {
        let Some(state_block) = node_link.allocate_link_state_block() else {
            debug!("bypass abandoned, link memory exhausted");
            return;
        };
        let new_sublink = node_link.memory().allocate_sublink_ids(1);
        let Some(new_link) = node_link.add_remote_router_link(
            new_sublink,
            LinkType::Central,
            LinkSide::A,
            Some(RouterLinkState::over_block(state_block.clone())),
            true,
            self.clone(),
        ) else {
            return;
        };
        let sequence_length = {
            let mut state = self.state.lock();
            let length = state.outbound.current_sequence_length();
            if !state.outward.begin_primary_link_decay(Some(length), None) {
                return;
            }
            state.outward.set_primary_link(new_link);
            length
        };
        debug!(sublink = %new_sublink, "offering bypass link");
        node_link.transmit_accept_bypass_link(
            proxy_node,
            proxy_sublink,
            sequence_length,
            new_sublink,
            state_block.descriptor(),
        );
        self.flush();
    }

    /// [`bypass_peer`] when the proxy's outward peer is local to this node:
    /// replace both routers' links to the proxy with one local link.
    fn bypass_peer_on_same_node(self: &Arc<Self>, peer: &Arc<Router>) -> bool {
        let (self_link, peer_link) = crate::local_router_link::LocalRouterLink::new_pair(
            LinkType::Central,
            self,
            peer,
        );
        let (old_link, length_to_proxy) = {
            let mut state = self.state.lock();
            let length = state.outbound.current_sequence_length();
            let Some(old) = state.outward.primary_link().cloned() else {
                return true;
            };
            if !state.outward.begin_primary_link_decay(Some(length), None) {
                return false;
            }
            state.outward.set_primary_link(self_link);
            (old, length)
        };
        let Some(peer_length) = peer.adopt_local_bypass_link(peer_link, length_to_proxy) else {
            return false;
        };
        {
            let mut state = self.state.lock();
            state.outward.set_length_from_decaying_link(peer_length);
        }
        old_link.stop_proxying(peer_length, length_to_proxy);
        peer.flush();
        self.flush();
        true
    }

    /// Adopt `new_link` as the outward primary, decaying the current one.
    /// `length_from_peer` is the total number of parcels the router on the
    /// other end of `new_link` ever sent through the decaying path. Returns
    /// this router's own outbound length at the switch.
    fn adopt_local_bypass_link(
        self: &Arc<Self>,
        new_link: Arc<dyn RouterLink>,
        length_from_peer: SequenceNumber,
    ) -> Option<SequenceNumber> {
        let length = {
            let mut state = self.state.lock();
            let length = state.outbound.current_sequence_length();
            if !state
                .outward
                .begin_primary_link_decay(Some(length), Some(length_from_peer))
            {
                return None;
            }
            state.outward.set_primary_link(new_link);
            length
        };
        self.flush();
        Some(length)
    }

    /// Called on a proxy's outward peer: a router inward of the proxy built
    /// `new_link` directly to us. `old_node_link`/`old_sublink` identify our
    /// decaying link to the proxy; `inbound_sequence_length` is everything
    /// the sender ever routed through it toward us.
    pub(crate) fn accept_bypass_link(
        self: &Arc<Self>,
        old_node_link: &Arc<NodeLink>,
        old_sublink: SublinkId,
        sender_node: NodeName,
        new_link: Arc<dyn RouterLink>,
        inbound_sequence_length: SequenceNumber,
    ) -> bool {
        let (old_link, outbound_length) = {
            let mut state = self.state.lock();
            let Some(primary) = state.outward.primary_link().cloned() else {
                // Benign race with closure or disconnection.
                new_link.deactivate();
                return true;
            };
            if !primary.is_remote_link_on(old_node_link, old_sublink) {
                return false;
            }
            if !primary.can_node_request_bypass(sender_node) {
                return false;
            }
            let length = state.outbound.current_sequence_length();
            if !state
                .outward
                .begin_primary_link_decay(Some(length), Some(inbound_sequence_length))
            {
                return false;
            }
            state.outward.set_primary_link(new_link);
            (primary, length)
        };
        debug!("accepted bypass link");
        old_link.stop_proxying(outbound_length, inbound_sequence_length);
        self.flush();
        true
    }

    /// Called on a proxy once both of its neighbors agreed on the bypass:
    /// fix the final lengths of both decaying links. `inbound` counts
    /// parcels from the outward peer, `outbound` parcels from the inward
    /// router.
    pub(crate) fn stop_proxying(
        self: &Arc<Self>,
        inbound: SequenceNumber,
        outbound: SequenceNumber,
    ) -> bool {
        let proxy_will_stop = {
            let mut state = self.state.lock();
            if state.inward.is_none() {
                return true;
            }
            if state.outward.has_decaying_link() {
                // Decay already began during a local bypass; fill in
                // whatever lengths are still unknown.
                let _ = state.outward.set_length_to_decaying_link(outbound);
                let _ = state.outward.set_length_from_decaying_link(inbound);
            } else if !state
                .outward
                .begin_primary_link_decay(Some(outbound), Some(inbound))
            {
                return true;
            }
            let Some(inward) = state.inward.as_mut() else {
                return true;
            };
            if !inward.begin_primary_link_decay(Some(inbound), Some(outbound)) {
                return true;
            }
            inward.decaying_link().cloned()
        };
        debug!(%inbound, %outbound, "proxy stopping");
        if let Some(link) = proxy_will_stop {
            link.proxy_will_stop(inbound);
        }
        self.flush();
        true
    }

    /// Called on the router inward of a stopping proxy: the decaying link
    /// from the proxy carries inbound parcels only up to `sequence_length`.
    pub(crate) fn proxy_will_stop(self: &Arc<Self>, sequence_length: SequenceNumber) -> bool {
        {
            let mut state = self.state.lock();
            if !state.outward.set_length_from_decaying_link(sequence_length) {
                return true;
            }
        }
        debug!(%sequence_length, "proxy will stop");
        self.flush();
        true
    }

    /// Called on the router inward of a proxy whose outward peer shares the
    /// proxy's node. The proxy built `new_link` between us and that peer;
    /// `inbound_sequence_length` is everything the peer sent while the proxy
    /// still relayed.
    pub(crate) fn accept_bypass_peer_with_link(
        self: &Arc<Self>,
        requestor_link: &Arc<NodeLink>,
        requestor_sublink: SublinkId,
        new_link: Arc<dyn RouterLink>,
        inbound_sequence_length: SequenceNumber,
    ) -> bool {
        let (old_link, outbound_length) = {
            let mut state = self.state.lock();
            let Some(primary) = state.outward.primary_link().cloned() else {
                new_link.deactivate();
                return true;
            };
            if !primary.is_remote_link_on(requestor_link, requestor_sublink) {
                return false;
            }
            let length = state.outbound.current_sequence_length();
            if !state
                .outward
                .begin_primary_link_decay(Some(length), Some(inbound_sequence_length))
            {
                return false;
            }
            state.outward.set_primary_link(new_link);
            (primary, length)
        };
        debug!("accepted bypass of proxy with local peer");
        old_link.stop_proxying_to_local_peer(outbound_length);
        self.flush();
        true
    }

    /// Called on a proxy whose outward peer is local: the inward router has
    /// adopted the replacement link and will send `sequence_length` parcels
    /// through us in total.
    pub(crate) fn stop_proxying_to_local_peer(
        self: &Arc<Self>,
        sequence_length: SequenceNumber,
    ) -> bool {
        let local_peer = {
            let mut state = self.state.lock();
            let Some(inward) = state.inward.as_mut() else {
                return true;
            };
            inward.set_length_from_decaying_link(sequence_length);
            state.outward.set_length_to_decaying_link(sequence_length);
            state.outward.decaying_link().and_then(|l| l.local_peer())
        };
        if let Some(peer) = &local_peer {
            peer.set_outward_length_from_decaying_link(sequence_length);
        }
        self.flush();
        true
    }

    fn set_outward_length_from_decaying_link(self: &Arc<Self>, length: SequenceNumber) {
        {
            let mut state = self.state.lock();
            state.outward.set_length_from_decaying_link(length);
        }
        self.flush();
    }

    /// A proxy tries to arrange its own removal: lock the central link, then
    /// ask the inward router to bypass us.
    fn maybe_start_self_bypass(self: &Arc<Self>) {
        let (outward_link, inward_link, inward_peer_node) = {
            let state = self.state.lock();
            if state.disconnected || state.closed || state.bridge.is_some() {
                return;
            }
            let Some(inward) = &state.inward else { return };
            if !inward.is_stable() || !state.outward.is_stable() {
                return;
            }
            let Some(outward_link) = state.outward.primary_link() else {
                return;
            };
            if outward_link.link_type() != LinkType::Central {
                return;
            }
            let Some(inward_link) = inward.primary_link() else { return };
            let Some((inward_node_link, _)) = inward_link.remote_endpoint() else {
                // The inward link is local; nothing to bypass yet.
                return;
            };
            (
                outward_link.clone(),
                inward_link.clone(),
                inward_node_link.remote_node_name(),
            )
        };
        if !outward_link.try_lock_for_bypass(inward_peer_node) {
            // The other side is unstable or mid-operation; it owes us a
            // flush nudge when that resolves.
            let _ = outward_link.try_mark_waiting();
            return;
        }
        debug!("starting self-bypass");
        if let Some((outward_node_link, outward_sublink)) = outward_link.remote_endpoint() {
            inward_link.request_proxy_bypass(
                outward_node_link.remote_node_name(),
                outward_sublink,
            );
        } else if let Some(peer) = outward_link.local_peer() {
            self.start_self_bypass_to_local_peer(&peer, &inward_link);
        }
    }

    /// Self-bypass when the outward peer shares this node: build the
    /// replacement central link on the inward NodeLink ourselves, with the
    /// local peer as its receiver.
    fn start_self_bypass_to_local_peer(
        self: &Arc<Self>,
        peer: &Arc<Router>,
        inward_link: &Arc<dyn RouterLink>,
    ) {
        let Some((node_link, _)) = inward_link.remote_endpoint() else {
            return;
        };
        let Some(state_block) = node_link.allocate_link_state_block() else {
            return;
        };
        let new_sublink = node_link.memory().allocate_sublink_ids(1);
        let Some(new_link) = node_link.add_remote_router_link(
            new_sublink,
            LinkType::Central,
            LinkSide::A,
            Some(RouterLinkState::over_block(state_block.clone())),
            true,
            peer.clone(),
        ) else {
            return;
        };
        // The peer starts using the new link for everything past its current
        // outbound length; we will forward exactly that much to the inward
        // router.
        let Some(peer_length) = peer.begin_bypass_of_local_proxy(new_link) else {
            return;
        };
        {
            let mut state = self.state.lock();
            let inward = match state.inward.as_mut() {
                Some(edge) => edge,
                None => return,
            };
            if !inward.begin_primary_link_decay(Some(peer_length), None) {
                return;
            }
            if !state.outward.begin_primary_link_decay(None, Some(peer_length)) {
                return;
            }
        }
        debug!(sublink = %new_sublink, "bypassing self toward local peer");
        inward_link.bypass_peer_with_link(new_sublink, state_block.descriptor(), peer_length);
        self.flush();
    }

    /// The local peer's half of a local-proxy bypass: demote the local link,
    /// adopt the new remote central link, and report the outbound length at
    /// the switch.
    fn begin_bypass_of_local_proxy(
        self: &Arc<Self>,
        new_link: Arc<dyn RouterLink>,
    ) -> Option<SequenceNumber> {
        let length = {
            let mut state = self.state.lock();
            let length = state.outbound.current_sequence_length();
            if !state.outward.begin_primary_link_decay(Some(length), None) {
                return None;
            }
            state.outward.set_primary_link(new_link);
            length
        };
        self.flush();
        Some(length)
    }

    // ==================================================================
    // Flush
    // ==================================================================

    /// Drive every piece of deferred work this router owes: parcel
    /// forwarding, closure propagation, decaying-link retirement, link
    /// stability, and self-bypass. Always called without the state lock
    /// held; all external calls happen after it is released.
    pub(crate) fn flush(self: &Arc<Self>) {
        let mut parcels_to_send: Vec<(Arc<dyn RouterLink>, Parcel)> = Vec::new();
        let mut closures_to_send: Vec<(Arc<dyn RouterLink>, SequenceNumber)> = Vec::new();
        let mut links_to_deactivate: Vec<Arc<dyn RouterLink>> = Vec::new();
        let mut parcels_to_discard: Vec<Parcel> = Vec::new();
        let mut stable_candidate: Option<Arc<dyn RouterLink>> = None;

        {
            let mut state = self.state.lock();

            // Outbound parcels toward the outward edge.
            loop {
                if !state.outbound.has_next_element() {
                    break;
                }
                let n = state.outbound.next_sequence_number();
                let Some(link) = state.outward.link_for_transmission(n).cloned() else {
                    break;
                };
                let parcel = state.outbound.pop().expect("element available");
                parcels_to_send.push((link, parcel));
            }

            // Inbound parcels: forwarded for proxies and bridges, discarded
            // for closed terminals, left for the application otherwise.
            if !state.is_terminal() {
                loop {
                    if !state.inbound.has_next_element() {
                        break;
                    }
                    let n = state.inbound.next_sequence_number();
                    let link = state
                        .forward_edge()
                        .and_then(|edge| edge.link_for_transmission(n).cloned());
                    let Some(link) = link else { break };
                    let parcel = state.inbound.pop().expect("element available");
                    parcels_to_send.push((link, parcel));
                }
            } else if state.closed {
                while let Some(parcel) = state.inbound.pop() {
                    parcels_to_discard.push(parcel);
                }
            }

            // Closure propagation, once per direction.
            if let Some(final_length) = state.outbound.final_sequence_length() {
                if !state.outbound_closure_propagated {
                    let link = state
                        .outward
                        .link_for_transmission(final_length)
                        .cloned();
                    if let Some(link) = link {
                        state.outbound_closure_propagated = true;
                        closures_to_send.push((link, final_length));
                    }
                }
            }
            if let Some(final_length) = state.inbound.final_sequence_length() {
                if !state.is_terminal() && !state.inbound_closure_propagated {
                    let link = state
                        .forward_edge()
                        .and_then(|edge| edge.link_for_transmission(final_length).cloned());
                    if let Some(link) = link {
                        state.inbound_closure_propagated = true;
                        closures_to_send.push((link, final_length));
                    }
                }
            }

            // Retire decaying links whose traffic has fully passed.
            let outbound_sent = state.outbound.next_sequence_number();
            let inbound_received = state.inbound.contiguous_end();
            if let Some(link) = state
                .outward
                .maybe_finish_decay(outbound_sent, inbound_received)
            {
                links_to_deactivate.push(link);
            }
            let inbound_sent = state.inbound.next_sequence_number();
            let outbound_received = state.outbound.contiguous_end();
            if let Some(edge) = state.forward_edge() {
                if let Some(link) = edge.maybe_finish_decay(inbound_sent, outbound_received) {
                    links_to_deactivate.push(link);
                }
            }

            // A closed terminal drops its outward links once closure has
            // been sent and every outbound parcel with it.
            if state.closed
                && state.outbound_closure_propagated
                && state.outbound.is_sequence_fully_consumed()
                && !state.outward.has_decaying_link()
            {
                links_to_deactivate.extend(state.outward.take_all_links());
            }

            // A proxy or bridge router whose both directions have fully
            // drained has nothing left to forward; drop everything.
            if !state.is_terminal()
                && state.inbound.is_sequence_fully_consumed()
                && state.outbound.is_sequence_fully_consumed()
                && state.inbound_closure_propagated
                && state.outbound_closure_propagated
            {
                links_to_deactivate.extend(state.outward.take_all_links());
                if let Some(mut edge) = state.inward.take() {
                    links_to_deactivate.extend(edge.take_all_links());
                }
                if let Some(mut edge) = state.bridge.take() {
                    links_to_deactivate.extend(edge.take_all_links());
                }
            }

            // Mark our side of a central link stable once nothing near us
            // is decaying.
            let nothing_decaying = !state.outward.has_decaying_link()
                && state
                    .inward
                    .as_ref()
                    .map_or(true, |edge| !edge.has_decaying_link())
                && state.bridge.is_none();
            if nothing_decaying {
                if let Some(link) = state.outward.primary_link() {
                    if link.link_type() == LinkType::Central {
                        stable_candidate = Some(link.clone());
                    }
                }
            }
        }

        for (link, parcel) in parcels_to_send {
            link.accept_parcel(parcel);
        }
        for (link, sequence_length) in closures_to_send {
            link.accept_route_closure(sequence_length);
        }
        for link in links_to_deactivate {
            link.deactivate();
        }
        for mut parcel in parcels_to_discard {
            parcel.close_attachments();
        }
        if let Some(link) = stable_candidate {
            link.mark_side_stable();
        }
        self.maybe_start_self_bypass();
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        // Every teardown path removes traps before the last reference goes.
        debug_assert!(self.state.get_mut().traps.is_empty());
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Router")
            .field("terminal", &state.is_terminal())
            .field("closed", &state.closed)
            .field("disconnected", &state.disconnected)
            .field("inbound_next", &state.inbound.next_sequence_number())
            .field("outbound_next", &state.outbound.next_sequence_number())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    fn parcel(data: &[u8]) -> Parcel {
        Parcel::new(data.to_vec(), Vec::new())
    }

    #[test]
    fn local_pair_delivers_in_order() {
        let (a, b) = Router::pair();
        a.send_outbound_parcel(parcel(b"one")).unwrap();
        a.send_outbound_parcel(parcel(b"two")).unwrap();

        assert_eq!(b.get_next_inbound_parcel().unwrap().data(), b"one");
        assert_eq!(b.get_next_inbound_parcel().unwrap().data(), b"two");
        assert_eq!(b.get_next_inbound_parcel().unwrap_err(), Error::Unavailable);
    }

    #[test]
    fn closure_drains_before_death() {
        let (a, b) = Router::pair();
        a.send_outbound_parcel(parcel(b"last words")).unwrap();
        a.close_route();

        let status = b.query_status();
        assert!(status.is_peer_closed());
        assert!(!status.is_dead());

        assert_eq!(b.get_next_inbound_parcel().unwrap().data(), b"last words");
        assert!(b.query_status().is_dead());
        assert_eq!(b.get_next_inbound_parcel().unwrap_err(), Error::NotFound);
        assert_eq!(
            b.send_outbound_parcel(parcel(b"too late")).unwrap_err(),
            Error::NotFound
        );
    }

    #[test]
    fn dead_trap_fires_after_final_parcel_is_consumed() {
        let (a, b) = Router::pair();
        a.send_outbound_parcel(parcel(b"x")).unwrap();
        a.close_route();

        let fired = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&fired);
        b.add_trap(
            TrapConditions {
                flags: conditions::DEAD,
                min_local_parcels: None,
            },
            Arc::new(move |event: &TrapEvent| {
                seen.store(event.condition_flags, Ordering::Relaxed);
            }),
            0,
        )
        .unwrap();

        assert_eq!(fired.load(Ordering::Relaxed), 0);
        b.get_next_inbound_parcel().unwrap();
        assert_eq!(fired.load(Ordering::Relaxed) & conditions::DEAD, conditions::DEAD);
    }

    #[test]
    fn satisfied_trap_fires_synchronously_and_is_not_installed() {
        let (a, b) = Router::pair();
        a.close_route();

        let fired = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&fired);
        let result = b.add_trap(
            TrapConditions {
                flags: conditions::PEER_CLOSED,
                min_local_parcels: None,
            },
            Arc::new(move |event: &TrapEvent| {
                seen.store(event.condition_flags, Ordering::Relaxed);
            }),
            0,
        );
        assert_eq!(result.unwrap_err(), Error::FailedPrecondition);
        let flags = fired.load(Ordering::Relaxed);
        assert_ne!(flags & conditions::PEER_CLOSED, 0);
        assert_ne!(flags & conditions::WITHIN_API_CALL, 0);
    }

    #[test]
    fn merged_routes_pass_parcels_across_the_bridge() {
        let (a, b) = Router::pair();
        let (c, d) = Router::pair();
        b.merge_route(&c).unwrap();

        a.send_outbound_parcel(parcel(b"through the bridge")).unwrap();
        assert_eq!(
            d.get_next_inbound_parcel().unwrap().data(),
            b"through the bridge"
        );

        d.send_outbound_parcel(parcel(b"and back")).unwrap();
        assert_eq!(a.get_next_inbound_parcel().unwrap().data(), b"and back");

        a.close_route();
        assert!(d.query_status().is_peer_closed());
    }

    #[test]
    fn merge_rejects_used_or_paired_portals() {
        let (a, b) = Router::pair();
        assert_eq!(a.merge_route(&b).unwrap_err(), Error::InvalidArgument);

        let (c, d) = Router::pair();
        c.send_outbound_parcel(parcel(b"used")).unwrap();
        assert_eq!(a.merge_route(&c).unwrap_err(), Error::FailedPrecondition);
        let _ = d;
        let _ = b;
    }

    #[test]
    fn disconnection_terminates_both_directions() {
        let (a, b) = Router::pair();
        a.send_outbound_parcel(parcel(b"kept")).unwrap();
        assert!(a.accept_route_disconnected_from(LinkType::Central));

        // B saw the disconnection propagate over the local link.
        assert!(b.query_status().is_peer_closed());
        assert_eq!(b.get_next_inbound_parcel().unwrap().data(), b"kept");
        assert_eq!(b.get_next_inbound_parcel().unwrap_err(), Error::NotFound);
        assert_eq!(
            a.send_outbound_parcel(parcel(b"nope")).unwrap_err(),
            Error::NotFound
        );
    }
}
