use std::sync::Arc;

use parking_lot::Mutex;

use weft_wire::{LinkSide, LinkType, NodeName, SequenceNumber};

use crate::link_state::RouterLinkState;
use crate::parcel::Parcel;
use crate::router::Router;
use crate::router_link::RouterLink;

struct Shared {
    link_type: LinkType,
    state: RouterLinkState,
    routers: Mutex<[Option<Arc<Router>>; 2]>,
}

/// One side's handle onto a link between two routers in the same process.
///
/// Only central and bridge links can be local: a peripheral pair implies a
/// proxy left behind by a move, and moves within a node hand the router
/// over directly instead of leaving one.
pub(crate) struct LocalRouterLink {
    side: LinkSide,
    shared: Arc<Shared>,
}

impl LocalRouterLink {
    pub(crate) fn new_pair(
        link_type: LinkType,
        a: &Arc<Router>,
        b: &Arc<Router>,
    ) -> (Arc<dyn RouterLink>, Arc<dyn RouterLink>) {
        debug_assert!(matches!(link_type, LinkType::Central | LinkType::Bridge));
        let shared = Arc::new(Shared {
            link_type,
            state: RouterLinkState::new_local(),
            routers: Mutex::new([Some(a.clone()), Some(b.clone())]),
        });
        (
            Arc::new(LocalRouterLink {
                side: LinkSide::A,
                shared: Arc::clone(&shared),
            }),
            Arc::new(LocalRouterLink {
                side: LinkSide::B,
                shared,
            }),
        )
    }

    fn other_router(&self) -> Option<Arc<Router>> {
        let routers = self.shared.routers.lock();
        routers[if self.side.is_side_a() { 1 } else { 0 }].clone()
    }
}

impl RouterLink for LocalRouterLink {
    fn link_type(&self) -> LinkType {
        self.shared.link_type
    }

    fn accept_parcel(&self, mut parcel: Parcel) {
        match self.other_router() {
            Some(router) => {
                router.accept_parcel_from_link(self.shared.link_type, parcel);
            }
            None => parcel.close_attachments(),
        }
    }

    fn accept_route_closure(&self, sequence_length: SequenceNumber) {
        if let Some(router) = self.other_router() {
            router.accept_route_closure_from(self.shared.link_type, sequence_length);
        }
    }

    fn accept_route_disconnected(&self) {
        if let Some(router) = self.other_router() {
            router.accept_route_disconnected_from(self.shared.link_type);
        }
    }

    fn deactivate(&self) {
        let mut routers = self.shared.routers.lock();
        routers[0] = None;
        routers[1] = None;
    }

    fn local_peer(&self) -> Option<Arc<Router>> {
        self.other_router()
    }

    fn mark_side_stable(&self) {
        if self.shared.state.mark_side_stable(self.side) {
            if let Some(router) = self.other_router() {
                router.flush();
            }
        }
    }

    fn try_lock_for_bypass(&self, bypass_request_source: NodeName) -> bool {
        if !self.shared.state.try_lock(self.side) {
            return false;
        }
        self.shared
            .state
            .set_allowed_bypass_request_source(bypass_request_source);
        true
    }

    fn try_lock_for_closure(&self) -> bool {
        self.shared.state.try_lock(self.side)
    }

    fn unlock(&self) {
        if self.shared.state.unlock(self.side) {
            if let Some(router) = self.other_router() {
                router.flush();
            }
        }
    }

    fn try_mark_waiting(&self) -> bool {
        self.shared.state.try_mark_waiting(self.side)
    }

    fn can_node_request_bypass(&self, node: NodeName) -> bool {
        self.shared.state.can_node_request_bypass(self.side, node)
    }

    fn describe(&self) -> String {
        format!("local {} link (side {})", self.shared.link_type, self.side)
    }
}
