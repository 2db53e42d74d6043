use std::sync::Arc;

use weft_wire::{BlockDescriptor, LinkType, NodeName, SequenceNumber, SublinkId};

use crate::node_link::NodeLink;
use crate::parcel::Parcel;
use crate::router::Router;

/// One router's handle onto one link of a route.
///
/// A link always joins exactly two routers, either within a node
/// ([`LocalRouterLink`](crate::local_router_link::LocalRouterLink)) or across
/// a `NodeLink` sublink
/// ([`RemoteRouterLink`](crate::remote_router_link::RemoteRouterLink)). All
/// methods are called without the calling router's lock held; a link is free
/// to call straight into the router on its other side.
pub trait RouterLink: Send + Sync {
    /// This link's role from the calling side's perspective.
    fn link_type(&self) -> LinkType;

    /// Pass a parcel to the router on the other side.
    fn accept_parcel(&self, parcel: Parcel);

    /// Tell the other side this side's terminal portal closed after sending
    /// exactly `sequence_length` parcels.
    fn accept_route_closure(&self, sequence_length: SequenceNumber);

    /// Tell the other side the route was severed with no final length.
    fn accept_route_disconnected(&self);

    /// Detach the link from its endpoints. Nothing is delivered afterwards.
    fn deactivate(&self);

    /// The router on the other side, if it shares this address space.
    fn local_peer(&self) -> Option<Arc<Router>>;

    // ------------------------------------------------------------------
    // Central link state. Peripheral links have none; these default to
    // no-ops that refuse every lock.
    // ------------------------------------------------------------------

    fn mark_side_stable(&self) {}

    /// Lock the link so this side can initiate a bypass, authorizing a
    /// bypass request from `bypass_request_source`.
    fn try_lock_for_bypass(&self, _bypass_request_source: NodeName) -> bool {
        false
    }

    /// Lock the link ahead of closing this side's route.
    fn try_lock_for_closure(&self) -> bool {
        false
    }

    /// Release this side's lock, nudging the other side if it noted itself
    /// waiting in the meantime.
    fn unlock(&self) {}

    /// Note that this side wanted the link's lock but found it held.
    fn try_mark_waiting(&self) -> bool {
        false
    }

    /// Whether a bypass request arriving from `node` was authorized by the
    /// other side.
    fn can_node_request_bypass(&self, _node: NodeName) -> bool {
        false
    }

    // ------------------------------------------------------------------
    // Bypass control. Each maps to one wire message; local links implement
    // only the subset that can occur within a node.
    // ------------------------------------------------------------------

    /// Over an inward link: ask the newer router to bypass this proxy by
    /// linking directly to the proxy's outward peer.
    fn request_proxy_bypass(
        &self,
        _bypass_target_node: NodeName,
        _bypass_target_sublink: SublinkId,
    ) {
    }

    /// Over a decaying central link: fix the final lengths in both
    /// directions so the proxy on the other side can retire.
    fn stop_proxying(
        &self,
        _inbound_sequence_length: SequenceNumber,
        _outbound_sequence_length: SequenceNumber,
    ) {
    }

    /// Over a decaying inward link: fix the final length of the sequence the
    /// proxy will still forward inward.
    fn proxy_will_stop(&self, _inbound_sequence_length: SequenceNumber) {}

    /// Over an inward link: bypass this proxy whose outward peer is local to
    /// it, adopting the pre-built central link at `new_sublink`.
    fn bypass_peer_with_link(
        &self,
        _new_sublink: SublinkId,
        _new_link_state: BlockDescriptor,
        _inbound_sequence_length: SequenceNumber,
    ) {
    }

    /// Reply to [`bypass_peer_with_link`](Self::bypass_peer_with_link),
    /// addressed to the proxy.
    fn stop_proxying_to_local_peer(&self, _outbound_sequence_length: SequenceNumber) {}

    // ------------------------------------------------------------------
    // Identification
    // ------------------------------------------------------------------

    /// True if this is the remote link at `sublink` on `node_link`.
    fn is_remote_link_on(&self, _node_link: &Arc<NodeLink>, _sublink: SublinkId) -> bool {
        false
    }

    /// The `NodeLink` and sublink this link occupies, for remote links.
    fn remote_endpoint(&self) -> Option<(Arc<NodeLink>, SublinkId)> {
        None
    }

    fn describe(&self) -> String;
}
