use std::sync::Arc;

use weft_wire::SequenceNumber;

use crate::router_link::RouterLink;

/// A link being phased out of an edge.
///
/// Until `length_to` is known, new transmissions keep using the decaying
/// link; once known, sequence numbers at or beyond it go to the primary
/// link instead. The link can be dropped when transmissions have passed
/// `length_to` and receipts have passed `length_from`.
struct DecayingLink {
    link: Arc<dyn RouterLink>,
    length_to: Option<SequenceNumber>,
    length_from: Option<SequenceNumber>,
}

/// One side of a router: at most one primary link plus at most one link
/// still decaying after being superseded.
#[derive(Default)]
pub struct RouteEdge {
    primary: Option<Arc<dyn RouterLink>>,
    decaying: Option<DecayingLink>,
}

impl RouteEdge {
    pub fn primary_link(&self) -> Option<&Arc<dyn RouterLink>> {
        self.primary.as_ref()
    }

    pub fn decaying_link(&self) -> Option<&Arc<dyn RouterLink>> {
        self.decaying.as_ref().map(|d| &d.link)
    }

    pub fn has_decaying_link(&self) -> bool {
        self.decaying.is_some()
    }

    /// An edge is stable when it has a primary link and nothing decaying.
    pub fn is_stable(&self) -> bool {
        self.primary.is_some() && self.decaying.is_none()
    }

    pub fn set_primary_link(&mut self, link: Arc<dyn RouterLink>) {
        debug_assert!(self.primary.is_none());
        self.primary = Some(link);
    }

    /// Demote the primary link to decaying. Fails if another link is still
    /// decaying; an edge never tracks two.
    pub fn begin_primary_link_decay(
        &mut self,
        length_to: Option<SequenceNumber>,
        length_from: Option<SequenceNumber>,
    ) -> bool {
        if self.decaying.is_some() {
            return false;
        }
        let Some(link) = self.primary.take() else {
            return false;
        };
        self.decaying = Some(DecayingLink {
            link,
            length_to,
            length_from,
        });
        true
    }

    pub fn set_length_to_decaying_link(&mut self, length: SequenceNumber) -> bool {
        match &mut self.decaying {
            Some(d) if d.length_to.is_none() => {
                d.length_to = Some(length);
                true
            }
            _ => false,
        }
    }

    pub fn set_length_from_decaying_link(&mut self, length: SequenceNumber) -> bool {
        match &mut self.decaying {
            Some(d) if d.length_from.is_none() => {
                d.length_from = Some(length);
                true
            }
            _ => false,
        }
    }

    /// The link that must carry sequence number `n` out of this edge.
    pub fn link_for_transmission(&self, n: SequenceNumber) -> Option<&Arc<dyn RouterLink>> {
        if let Some(d) = &self.decaying {
            match d.length_to {
                Some(limit) if n >= limit => {}
                _ => return Some(&d.link),
            }
        }
        self.primary.as_ref()
    }

    /// Drop the decaying link if both directions have progressed past it:
    /// `sent` is the length of the sequence transmitted out of this edge so
    /// far, `received` the contiguous length received from it. Returns the
    /// retired link for deactivation.
    pub fn maybe_finish_decay(
        &mut self,
        sent: SequenceNumber,
        received: SequenceNumber,
    ) -> Option<Arc<dyn RouterLink>> {
        let d = self.decaying.as_ref()?;
        let done = d.length_to.is_some_and(|l| sent >= l)
            && d.length_from.is_some_and(|l| received >= l);
        if !done {
            return None;
        }
        self.decaying.take().map(|d| d.link)
    }

    /// Strip the edge bare, returning every link it held.
    pub fn take_all_links(&mut self) -> Vec<Arc<dyn RouterLink>> {
        self.primary
            .take()
            .into_iter()
            .chain(self.decaying.take().map(|d| d.link))
            .collect()
    }
}
