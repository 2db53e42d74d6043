//! Shared state for central links.
//!
//! Both routers on a central link see the same four-word block: one status
//! word driven by compare-and-swap, plus the name of the node allowed to
//! request a bypass of the locking side. The block lives in link memory for
//! remote links and in a private region for local ones.

use std::sync::atomic::{AtomicU64, Ordering};

use weft_memory::{BlockRef, Region, LINK_STATE_WORDS};
use weft_wire::{BlockDescriptor, LinkSide, NodeName};

// Status word bits.
const SIDE_A_STABLE: u64 = 1 << 0;
const SIDE_B_STABLE: u64 = 1 << 1;
const LOCKED_BY_A: u64 = 1 << 2;
const LOCKED_BY_B: u64 = 1 << 3;
const SIDE_A_WAITING: u64 = 1 << 4;
const SIDE_B_WAITING: u64 = 1 << 5;

const STATUS_WORD: usize = 0;
const BYPASS_SOURCE_HIGH_WORD: usize = 1;
const BYPASS_SOURCE_LOW_WORD: usize = 2;

fn stable_bit(side: LinkSide) -> u64 {
    match side {
        LinkSide::A => SIDE_A_STABLE,
        LinkSide::B => SIDE_B_STABLE,
    }
}

fn lock_bit(side: LinkSide) -> u64 {
    match side {
        LinkSide::A => LOCKED_BY_A,
        LinkSide::B => LOCKED_BY_B,
    }
}

fn waiting_bit(side: LinkSide) -> u64 {
    match side {
        LinkSide::A => SIDE_A_WAITING,
        LinkSide::B => SIDE_B_WAITING,
    }
}

#[derive(Clone)]
enum Backing {
    Shared(BlockRef),
    Local(Region),
}

/// One central link's shared state block. Cloning yields another handle
/// onto the same words.
#[derive(Clone)]
pub struct RouterLinkState {
    backing: Backing,
}

impl RouterLinkState {
    /// State for a link whose two routers share an address space.
    pub fn new_local() -> Self {
        Self {
            backing: Backing::Local(Region::allocate(LINK_STATE_WORDS)),
        }
    }

    /// State over a block of link memory shared with the remote node.
    pub fn over_block(block: BlockRef) -> Self {
        Self {
            backing: Backing::Shared(block),
        }
    }

    /// The link-memory descriptor of the backing block, if it came from a
    /// shared pool.
    pub fn block_descriptor(&self) -> Option<BlockDescriptor> {
        match &self.backing {
            Backing::Shared(block) => Some(block.descriptor()),
            Backing::Local(_) => None,
        }
    }

    fn word(&self, index: usize) -> &AtomicU64 {
        match &self.backing {
            Backing::Shared(block) => &block.words()[index],
            Backing::Local(region) => region.word(index),
        }
    }

    fn status(&self) -> &AtomicU64 {
        self.word(STATUS_WORD)
    }

    /// Declare `side` stable: it has no decaying links and will not spawn
    /// any without locking the link first. Returns true if the other side
    /// set its waiting bit; the caller then owes it a flush nudge.
    pub fn mark_side_stable(&self, side: LinkSide) -> bool {
        let other_waiting = waiting_bit(side.opposite());
        let mut current = self.status().load(Ordering::Acquire);
        loop {
            let next = (current | stable_bit(side)) & !other_waiting;
            if next == current {
                return false;
            }
            match self.status().compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current & other_waiting != 0,
                Err(actual) => current = actual,
            }
        }
    }

    /// Try to lock the link from `side` so it can initiate a bypass or a
    /// closure race-free. Requires both sides stable and no holder.
    pub fn try_lock(&self, side: LinkSide) -> bool {
        let mut current = self.status().load(Ordering::Acquire);
        loop {
            let both_stable = current & (SIDE_A_STABLE | SIDE_B_STABLE)
                == SIDE_A_STABLE | SIDE_B_STABLE;
            if !both_stable || current & (LOCKED_BY_A | LOCKED_BY_B) != 0 {
                return false;
            }
            match self.status().compare_exchange_weak(
                current,
                current | lock_bit(side),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_locked_by(&self, side: LinkSide) -> bool {
        self.status().load(Ordering::Acquire) & lock_bit(side) != 0
    }

    /// Release `side`'s lock. Returns true if the other side set its waiting
    /// bit while the lock was held; the caller then owes it a flush nudge.
    pub fn unlock(&self, side: LinkSide) -> bool {
        let other_waiting = waiting_bit(side.opposite());
        let previous = self
            .status()
            .fetch_and(!(lock_bit(side) | other_waiting), Ordering::AcqRel);
        previous & other_waiting != 0
    }

    /// Record that `side` wanted the lock but could not take it. Succeeds
    /// only while the other side still has a transition to make, that is it
    /// holds the lock or has not marked itself stable yet; otherwise nobody
    /// would ever deliver the wake-up.
    pub fn try_mark_waiting(&self, side: LinkSide) -> bool {
        let other = side.opposite();
        let mut current = self.status().load(Ordering::Acquire);
        loop {
            let other_pending = current & lock_bit(other) != 0
                || current & stable_bit(other) == 0;
            if !other_pending {
                return false;
            }
            match self.status().compare_exchange_weak(
                current,
                current | waiting_bit(side),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Name the node whose bypass request the lock holder has authorized.
    /// Only meaningful while the link is locked.
    pub fn set_allowed_bypass_request_source(&self, name: NodeName) {
        self.word(BYPASS_SOURCE_HIGH_WORD)
            .store(name.high, Ordering::Relaxed);
        self.word(BYPASS_SOURCE_LOW_WORD)
            .store(name.low, Ordering::Release);
    }

    /// Whether a bypass request arriving from `node` is authorized: the
    /// other side must hold the lock and have named `node` as the source.
    pub fn can_node_request_bypass(&self, side: LinkSide, node: NodeName) -> bool {
        if !self.is_locked_by(side.opposite()) {
            return false;
        }
        let low = self.word(BYPASS_SOURCE_LOW_WORD).load(Ordering::Acquire);
        let high = self.word(BYPASS_SOURCE_HIGH_WORD).load(Ordering::Relaxed);
        NodeName::new(high, low) == node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locking_requires_both_sides_stable() {
        let state = RouterLinkState::new_local();
        assert!(!state.try_lock(LinkSide::A));
        state.mark_side_stable(LinkSide::A);
        assert!(!state.try_lock(LinkSide::A));
        state.mark_side_stable(LinkSide::B);
        assert!(state.try_lock(LinkSide::A));
        assert!(state.is_locked_by(LinkSide::A));
        assert!(!state.try_lock(LinkSide::B));
    }

    #[test]
    fn unlock_reports_a_waiting_peer_exactly_once() {
        let state = RouterLinkState::new_local();
        state.mark_side_stable(LinkSide::A);
        state.mark_side_stable(LinkSide::B);
        assert!(state.try_lock(LinkSide::B));

        assert!(state.try_mark_waiting(LinkSide::A));
        assert!(state.unlock(LinkSide::B));
        assert!(state.try_lock(LinkSide::B));
        assert!(!state.unlock(LinkSide::B), "waiting bit was cleared");
    }

    #[test]
    fn waiting_requires_a_pending_transition_on_the_other_side() {
        let state = RouterLinkState::new_local();
        state.mark_side_stable(LinkSide::A);
        // B is not yet stable: A may wait for it.
        assert!(state.try_mark_waiting(LinkSide::A));
        // B becoming stable clears the bit and reports it.
        assert!(state.mark_side_stable(LinkSide::B));
        assert!(!state.try_mark_waiting(LinkSide::A), "no transition left");
    }

    #[test]
    fn bypass_authorization_names_one_node() {
        let state = RouterLinkState::new_local();
        state.mark_side_stable(LinkSide::A);
        state.mark_side_stable(LinkSide::B);
        let friend = NodeName::new(3, 4);

        assert!(!state.can_node_request_bypass(LinkSide::B, friend));
        assert!(state.try_lock(LinkSide::A));
        state.set_allowed_bypass_request_source(friend);
        assert!(state.can_node_request_bypass(LinkSide::B, friend));
        assert!(!state.can_node_request_bypass(LinkSide::B, NodeName::new(9, 9)));
        assert!(!state.can_node_request_bypass(LinkSide::A, friend));
    }
}
