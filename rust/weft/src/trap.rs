//! Traps: one-shot, edge-triggered observations of portal state.

use std::sync::Arc;

/// Condition and event flags.
pub mod conditions {
    /// The other side of the route is closed.
    pub const PEER_CLOSED: u64 = 1 << 0;
    /// The other side is closed and every parcel it sent has been retrieved.
    pub const DEAD: u64 = 1 << 1;
    /// A new parcel became retrievable.
    pub const NEW_LOCAL_PARCEL: u64 = 1 << 2;
    /// Event-only: the condition already held when the trap was requested,
    /// and the handler ran synchronously inside the requesting call.
    pub const WITHIN_API_CALL: u64 = 1 << 3;
    /// Event-only: the trap was removed without firing because its portal
    /// was closed or moved.
    pub const REMOVED: u64 = 1 << 4;
}

/// Point-in-time view of a portal, included with every trap event and
/// returned by status queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortalStatus {
    /// [`conditions`] flags currently true of the portal.
    pub flags: u64,
    /// Parcels retrievable right now.
    pub num_local_parcels: usize,
    /// Payload bytes retrievable right now.
    pub num_local_bytes: usize,
}

impl PortalStatus {
    pub fn is_peer_closed(&self) -> bool {
        self.flags & conditions::PEER_CLOSED != 0
    }

    pub fn is_dead(&self) -> bool {
        self.flags & conditions::DEAD != 0
    }
}

/// What a trap waits for. `flags` name the interesting conditions; a trap
/// fires on the first update where any of them holds.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapConditions {
    pub flags: u64,
    /// Fire once more than this many parcels are retrievable.
    pub min_local_parcels: Option<usize>,
}

impl TrapConditions {
    /// The subset of `flags` satisfied by `status`, plus NEW_LOCAL_PARCEL if
    /// the parcel threshold is crossed. Zero means not satisfied.
    fn satisfied_flags(&self, status: &PortalStatus) -> u64 {
        let mut fired = self.flags & status.flags;
        if self
            .min_local_parcels
            .is_some_and(|min| status.num_local_parcels > min)
        {
            fired |= conditions::NEW_LOCAL_PARCEL;
        }
        fired
    }
}

pub type TrapHandler = Arc<dyn Fn(&TrapEvent) + Send + Sync>;

/// Delivered to a trap's handler exactly once.
#[derive(Debug, Clone, Copy)]
pub struct TrapEvent {
    /// Caller-chosen value identifying the trap.
    pub context: u64,
    /// The [`conditions`] that caused the event.
    pub condition_flags: u64,
    pub status: PortalStatus,
}

struct Trap {
    conditions: TrapConditions,
    handler: TrapHandler,
    context: u64,
}

/// The reason a portal's status changed, used to gate edge-triggered flags:
/// a trap watching for new parcels must not fire merely because parcels were
/// already queued when some unrelated update happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
    NewLocalParcel,
    PeerStateChange,
}

/// The set of armed traps on one router.
#[derive(Default)]
pub struct TrapSet {
    traps: Vec<Trap>,
}

impl TrapSet {
    /// Arm a trap, unless its conditions already hold. In that case no trap
    /// is installed and the already-satisfied flags are returned so the
    /// caller can fire the handler synchronously.
    pub fn add(
        &mut self,
        conditions: TrapConditions,
        handler: TrapHandler,
        context: u64,
        status: &PortalStatus,
    ) -> Result<(), u64> {
        let fired = conditions.satisfied_flags(status);
        if fired != 0 {
            return Err(fired);
        }
        self.traps.push(Trap {
            conditions,
            handler,
            context,
        });
        Ok(())
    }

    /// Re-evaluate every armed trap against `status`. Satisfied traps are
    /// disarmed and their events queued on `dispatcher`.
    pub fn update(
        &mut self,
        status: &PortalStatus,
        reason: UpdateReason,
        dispatcher: &mut TrapEventDispatcher,
    ) {
        self.traps.retain(|trap| {
            let mut fired = trap.conditions.satisfied_flags(status);
            if reason != UpdateReason::NewLocalParcel {
                fired &= !conditions::NEW_LOCAL_PARCEL;
            }
            if fired == 0 {
                return true;
            }
            dispatcher.queue(
                trap.handler.clone(),
                TrapEvent {
                    context: trap.context,
                    condition_flags: fired,
                    status: *status,
                },
            );
            false
        });
    }

    /// Disarm everything, delivering a REMOVED event to each handler.
    pub fn remove_all(&mut self, status: &PortalStatus, dispatcher: &mut TrapEventDispatcher) {
        for trap in self.traps.drain(..) {
            dispatcher.queue(
                trap.handler,
                TrapEvent {
                    context: trap.context,
                    condition_flags: conditions::REMOVED,
                    status: *status,
                },
            );
        }
    }

    pub fn is_empty(&self) -> bool {
        self.traps.is_empty()
    }
}

/// Collects trap events while router locks are held and fires them on drop,
/// after every lock has been released. Handlers may therefore re-enter the
/// portal API freely.
#[derive(Default)]
pub struct TrapEventDispatcher {
    events: Vec<(TrapHandler, TrapEvent)>,
}

impl TrapEventDispatcher {
    fn queue(&mut self, handler: TrapHandler, event: TrapEvent) {
        self.events.push((handler, event));
    }
}

impl Drop for TrapEventDispatcher {
    fn drop(&mut self) {
        for (handler, event) in self.events.drain(..) {
            handler(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    fn recording_handler(seen: &Arc<AtomicU64>) -> TrapHandler {
        let seen = Arc::clone(seen);
        Arc::new(move |event: &TrapEvent| {
            seen.fetch_or(event.condition_flags, Ordering::Relaxed);
        })
    }

    #[test]
    fn satisfied_conditions_reject_installation() {
        let mut set = TrapSet::default();
        let status = PortalStatus {
            flags: conditions::PEER_CLOSED,
            ..Default::default()
        };
        let fired = set
            .add(
                TrapConditions {
                    flags: conditions::PEER_CLOSED,
                    min_local_parcels: None,
                },
                Arc::new(|_| {}),
                1,
                &status,
            )
            .unwrap_err();
        assert_eq!(fired, conditions::PEER_CLOSED);
        assert!(set.is_empty());
    }

    #[test]
    fn traps_fire_once_and_disarm() {
        let seen = Arc::new(AtomicU64::new(0));
        let mut set = TrapSet::default();
        set.add(
            TrapConditions {
                flags: conditions::NEW_LOCAL_PARCEL,
                min_local_parcels: None,
            },
            recording_handler(&seen),
            7,
            &PortalStatus::default(),
        )
        .unwrap();

        let status = PortalStatus {
            flags: conditions::NEW_LOCAL_PARCEL,
            num_local_parcels: 1,
            num_local_bytes: 3,
        };
        {
            let mut dispatcher = TrapEventDispatcher::default();
            set.update(&status, UpdateReason::NewLocalParcel, &mut dispatcher);
            assert_eq!(seen.load(Ordering::Relaxed), 0, "fires only on drop");
        }
        assert_eq!(seen.load(Ordering::Relaxed), conditions::NEW_LOCAL_PARCEL);
        assert!(set.is_empty());
    }

    #[test]
    fn parcel_arrival_flag_requires_a_parcel_arrival_update() {
        let seen = Arc::new(AtomicU64::new(0));
        let mut set = TrapSet::default();
        set.add(
            TrapConditions {
                flags: conditions::NEW_LOCAL_PARCEL,
                min_local_parcels: None,
            },
            recording_handler(&seen),
            0,
            &PortalStatus::default(),
        )
        .unwrap();

        let status = PortalStatus {
            flags: conditions::NEW_LOCAL_PARCEL | conditions::PEER_CLOSED,
            num_local_parcels: 1,
            num_local_bytes: 1,
        };
        let mut dispatcher = TrapEventDispatcher::default();
        set.update(&status, UpdateReason::PeerStateChange, &mut dispatcher);
        drop(dispatcher);
        assert_eq!(seen.load(Ordering::Relaxed), 0);
        assert!(!set.is_empty());
    }

    #[test]
    fn removal_delivers_removed_events() {
        let seen = Arc::new(AtomicU64::new(0));
        let mut set = TrapSet::default();
        set.add(
            TrapConditions {
                flags: conditions::DEAD,
                min_local_parcels: None,
            },
            recording_handler(&seen),
            0,
            &PortalStatus::default(),
        )
        .unwrap();

        let mut dispatcher = TrapEventDispatcher::default();
        set.remove_all(&PortalStatus::default(), &mut dispatcher);
        drop(dispatcher);
        assert_eq!(seen.load(Ordering::Relaxed), conditions::REMOVED);
    }
}
