//! The application-facing endpoint of a route.
//!
//! A portal wraps the terminal router on its side of a route. Putting a
//! parcel may move other portals: the moved portal's router stays behind as
//! a proxy and the receiving node builds a fresh terminal from its
//! descriptor. Dropping a portal closes its side of the route.

use std::sync::Arc;

use crate::driver::DriverObject;
use crate::error::Error;
use crate::node::Node;
use crate::parcel::{Attachment, Parcel};
use crate::router::Router;
use crate::trap::{PortalStatus, TrapConditions, TrapHandler};

/// Anything that can ride along with a parcel.
#[derive(Debug)]
pub enum Handle {
    Portal(Portal),
    Box(DriverObject),
}

#[derive(Debug)]
pub struct Portal {
    node: Arc<Node>,
    router: Option<Arc<Router>>,
}

impl Portal {
    pub(crate) fn new(node: &Arc<Node>, router: Arc<Router>) -> Self {
        Self {
            node: node.clone(),
            router: Some(router),
        }
    }

    pub(crate) fn pair(node: &Arc<Node>) -> (Portal, Portal) {
        let (a, b) = Router::pair();
        (Portal::new(node, a), Portal::new(node, b))
    }

    fn router(&self) -> &Arc<Router> {
        // Only `Drop` and the consuming methods clear the slot.
        self.router.as_ref().unwrap()
    }

    fn into_router(mut self) -> Arc<Router> {
        self.router.take().unwrap()
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Send one parcel to the other end of the route. Handles move with it;
    /// a moved portal must not be this portal or its local peer.
    pub fn put(&self, data: &[u8], handles: Vec<Handle>) -> Result<(), Error> {
        let router = self.router();
        let local_peer = router.local_peer();
        for handle in &handles {
            if let Handle::Portal(portal) = handle {
                let moved = portal.router();
                let is_self = Arc::ptr_eq(moved, router);
                let is_peer = local_peer.as_ref().is_some_and(|p| Arc::ptr_eq(moved, p));
                if is_self || is_peer {
                    return Err(Error::InvalidArgument);
                }
            }
        }
        let attachments = handles
            .into_iter()
            .map(|handle| match handle {
                Handle::Portal(portal) => {
                    let moved = portal.into_router();
                    moved.remove_traps_for_transfer();
                    Attachment::Router(moved)
                }
                Handle::Box(object) => Attachment::Object(object),
            })
            .collect();
        router.send_outbound_parcel(Parcel::new(data.to_vec(), attachments))
    }

    /// Retrieve the next parcel in sequence, if it has arrived.
    ///
    /// `Unavailable` means the next parcel is still in flight; `NotFound`
    /// means the sequence is exhausted and the peer is closed.
    pub fn get(&self) -> Result<(Vec<u8>, Vec<Handle>), Error> {
        let mut parcel = self.router().get_next_inbound_parcel()?;
        let handles = self.claim_attachments(&mut parcel);
        Ok((parcel.into_data(), handles))
    }

    /// Start a two-phase get. The parcel stays checked out until the
    /// transaction commits or is dropped; overlapping gets fail with
    /// `AlreadyExists`.
    pub fn begin_get(&self) -> Result<GetTransaction<'_>, Error> {
        let parcel = self.router().begin_get_inbound()?;
        Ok(GetTransaction {
            portal: self,
            parcel: Some(parcel),
        })
    }

    /// Start building an outbound parcel in place.
    pub fn begin_put(&self) -> PutTransaction<'_> {
        PutTransaction {
            portal: self,
            data: Vec::new(),
        }
    }

    pub fn query_status(&self) -> PortalStatus {
        self.router().query_status()
    }

    /// Install a trap observing this portal. If `conditions` are already
    /// satisfied the handler fires immediately with `WITHIN_API_CALL` set
    /// and nothing is installed.
    pub fn add_trap(
        &self,
        conditions: TrapConditions,
        handler: TrapHandler,
        context: u64,
    ) -> Result<(), Error> {
        self.router().add_trap(conditions, handler, context)
    }

    /// Fuse two routes into one: parcels sent toward either portal flow
    /// through to the other route's far end. Both portals must be unused.
    /// A failed merge hands both portals back intact in the error.
    pub fn merge(self, other: Portal) -> Result<(), MergeError> {
        let node = self.node.clone();
        let other_node = other.node.clone();
        let router = self.into_router();
        let other_router = other.into_router();
        match router.merge_route(&other_router) {
            Ok(()) => Ok(()),
            Err(error) => Err(MergeError {
                error,
                portals: (
                    Portal::new(&node, router),
                    Portal::new(&other_node, other_router),
                ),
            }),
        }
    }

    fn claim_attachments(&self, parcel: &mut Parcel) -> Vec<Handle> {
        parcel
            .take_attachments()
            .into_iter()
            .map(|attachment| match attachment {
                Attachment::Router(router) => Handle::Portal(Portal::new(&self.node, router)),
                Attachment::Object(object) => Handle::Box(object),
            })
            .collect()
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        if let Some(router) = self.router.take() {
            router.close_route();
        }
    }
}

/// A rejected [`Portal::merge`]. Neither route is disturbed; the portals
/// ride back out for further use.
#[derive(Debug)]
pub struct MergeError {
    pub error: Error,
    pub portals: (Portal, Portal),
}

/// An in-progress two-phase get. Dropping it without committing returns the
/// parcel to the front of the queue untouched.
pub struct GetTransaction<'a> {
    portal: &'a Portal,
    parcel: Option<Parcel>,
}

impl GetTransaction<'_> {
    pub fn data(&self) -> &[u8] {
        self.parcel.as_ref().unwrap().data()
    }

    pub fn num_handles(&self) -> usize {
        self.parcel.as_ref().unwrap().num_attachments()
    }

    /// Consume the whole parcel.
    pub fn commit(mut self) -> (Vec<u8>, Vec<Handle>) {
        let mut parcel = self.parcel.take().unwrap();
        let handles = self.portal.claim_attachments(&mut parcel);
        self.portal.router().commit_get_inbound();
        (parcel.into_data(), handles)
    }

    /// Consume `num_bytes` of payload plus every handle, leaving the rest of
    /// the payload at the front of the queue for the next get.
    pub fn commit_partial(mut self, num_bytes: usize) -> Result<(Vec<u8>, Vec<Handle>), Error> {
        let mut parcel = self.parcel.take().unwrap();
        if num_bytes > parcel.data().len() {
            self.parcel = Some(parcel);
            return Err(Error::InvalidArgument);
        }
        let handles = self.portal.claim_attachments(&mut parcel);
        let consumed = parcel.data()[..num_bytes].to_vec();
        parcel.consume_data(num_bytes);
        if parcel.data().is_empty() {
            self.portal.router().commit_get_inbound();
        } else {
            self.portal.router().restore_inbound_parcel(parcel);
        }
        Ok((consumed, handles))
    }
}

impl Drop for GetTransaction<'_> {
    fn drop(&mut self) {
        if let Some(parcel) = self.parcel.take() {
            self.portal.router().restore_inbound_parcel(parcel);
        }
    }
}

/// An outbound parcel being assembled. Dropping it without committing sends
/// nothing.
pub struct PutTransaction<'a> {
    portal: &'a Portal,
    data: Vec<u8>,
}

impl PutTransaction<'_> {
    pub fn append(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    pub fn commit(self, handles: Vec<Handle>) -> Result<(), Error> {
        self.portal.put(&self.data, handles)
    }
}
