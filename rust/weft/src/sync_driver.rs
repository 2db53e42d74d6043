//! In-process reference driver.
//!
//! Transports deliver frames synchronously on the transmitting thread, which
//! makes test failures deterministic and keeps the whole stack runnable
//! without an event loop. The routing layer never holds a lock across a
//! transmit, so reentrant delivery is safe.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::driver::{Driver, DriverObject, Frame, Transport, TransportError, TransportListener};
use weft_memory::Region;

/// Driver whose transports are in-process queues with synchronous delivery.
pub struct SyncDriver;

impl SyncDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }

    /// A transport pair that refuses to carry transports and memory regions
    /// out-of-band, forcing links built over it onto the broker relay path.
    pub fn create_restricted_transport_pair() -> (Arc<dyn Transport>, Arc<dyn Transport>) {
        SyncTransport::pair(false)
    }
}

impl Driver for SyncDriver {
    fn create_transport_pair(&self) -> (Arc<dyn Transport>, Arc<dyn Transport>) {
        SyncTransport::pair(true)
    }

    fn allocate_region(&self, num_words: usize) -> Region {
        Region::allocate(num_words)
    }
}

struct EndpointState {
    listener: Option<Arc<dyn TransportListener>>,
    queue: VecDeque<Frame>,
    severed: bool,
    draining: bool,
}

struct SyncTransport {
    peer: Mutex<Weak<SyncTransport>>,
    state: Mutex<EndpointState>,
    objects_transmittable: bool,
}

impl SyncTransport {
    fn pair(objects_transmittable: bool) -> (Arc<dyn Transport>, Arc<dyn Transport>) {
        let make = || {
            Arc::new(SyncTransport {
                peer: Mutex::new(Weak::new()),
                state: Mutex::new(EndpointState {
                    listener: None,
                    queue: VecDeque::new(),
                    severed: false,
                    draining: false,
                }),
                objects_transmittable,
            })
        };
        let a = make();
        let b = make();
        *a.peer.lock() = Arc::downgrade(&b);
        *b.peer.lock() = Arc::downgrade(&a);
        (a, b)
    }

    /// Deliver queued frames to the current listener, one at a time. Each
    /// frame is popped under the lock but handled outside it, so handlers may
    /// transmit, re-activate, or deactivate reentrantly. Only one drainer
    /// runs at a time: a transmit issued from inside a handler queues its
    /// frame and leaves delivery to the active drainer, preserving queue
    /// order.
    fn drain(&self) {
        {
            let mut state = self.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }
        loop {
            let (frame, listener) = {
                let mut state = self.state.lock();
                let Some(listener) = state.listener.clone() else {
                    state.draining = false;
                    return;
                };
                let Some(frame) = state.queue.pop_front() else {
                    state.draining = false;
                    return;
                };
                (frame, listener)
            };
            if !listener.on_frame(frame) {
                self.state.lock().draining = false;
                self.report_validation_failure();
                return;
            }
        }
    }

    /// A listener rejected a frame: sever both ends.
    fn report_validation_failure(&self) {
        let peer = self.peer.lock().upgrade();
        self.sever();
        if let Some(peer) = peer {
            peer.sever();
        }
    }

    fn sever(&self) {
        let listener = {
            let mut state = self.state.lock();
            if state.severed {
                return;
            }
            state.severed = true;
            state.queue.clear();
            state.listener.take()
        };
        if let Some(listener) = listener {
            listener.on_error();
        }
    }
}

impl Transport for SyncTransport {
    fn transmit(&self, frame: Frame) -> Result<(), TransportError> {
        let Some(peer) = self.peer.lock().upgrade() else {
            return Err(TransportError);
        };
        {
            let mut state = peer.state.lock();
            if state.severed {
                return Err(TransportError);
            }
            state.queue.push_back(frame);
        }
        peer.drain();
        Ok(())
    }

    fn activate(&self, listener: Arc<dyn TransportListener>) {
        {
            let mut state = self.state.lock();
            if state.severed {
                drop(state);
                listener.on_error();
                return;
            }
            state.listener = Some(listener);
        }
        self.drain();
    }

    fn deactivate(&self) {
        let mut state = self.state.lock();
        state.listener = None;
        state.queue.clear();
    }

    fn disconnect(&self) {
        let peer = self.peer.lock().upgrade();
        self.sever();
        if let Some(peer) = peer {
            peer.sever();
        }
    }

    fn can_transmit(&self, object: &DriverObject) -> bool {
        match object {
            DriverObject::Blob(_) => true,
            DriverObject::Transport(_) | DriverObject::Memory(_) => self.objects_transmittable,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Recorder {
        frames: Mutex<Vec<Vec<u8>>>,
        errors: AtomicUsize,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
                errors: AtomicUsize::new(0),
            })
        }
    }

    impl TransportListener for Recorder {
        fn on_frame(&self, frame: Frame) -> bool {
            self.frames.lock().push(frame.data);
            true
        }

        fn on_error(&self) {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn frames_queued_before_activation_are_delivered_in_order() {
        let driver = SyncDriver::new();
        let (a, b) = driver.create_transport_pair();
        a.transmit(Frame::data_only(vec![1])).unwrap();
        a.transmit(Frame::data_only(vec![2])).unwrap();

        let recorder = Recorder::new();
        b.activate(recorder.clone());
        a.transmit(Frame::data_only(vec![3])).unwrap();

        assert_eq!(*recorder.frames.lock(), vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn disconnect_reports_an_error_to_the_active_peer() {
        let driver = SyncDriver::new();
        let (a, b) = driver.create_transport_pair();
        let recorder = Recorder::new();
        b.activate(recorder.clone());

        a.disconnect();
        assert_eq!(recorder.errors.load(Ordering::Relaxed), 1);
        assert!(a.transmit(Frame::data_only(vec![9])).is_err());
    }

    struct Chained {
        far_end: Mutex<Option<Arc<dyn Transport>>>,
        completed: Mutex<Vec<u8>>,
    }

    impl TransportListener for Chained {
        fn on_frame(&self, frame: Frame) -> bool {
            let tag = frame.data[0];
            if tag == 1 {
                let far_end = self.far_end.lock().clone();
                if let Some(far_end) = far_end {
                    far_end.transmit(Frame::data_only(vec![2])).unwrap();
                }
            }
            self.completed.lock().push(tag);
            true
        }

        fn on_error(&self) {}
    }

    #[test]
    fn a_transmit_from_inside_a_handler_waits_its_turn() {
        let driver = SyncDriver::new();
        let (a, b) = driver.create_transport_pair();
        let listener = Arc::new(Chained {
            far_end: Mutex::new(Some(a.clone())),
            completed: Mutex::new(Vec::new()),
        });
        b.activate(listener.clone());

        // The handler for frame 1 transmits frame 2 back to itself. It must
        // finish before frame 2 is handled.
        a.transmit(Frame::data_only(vec![1])).unwrap();
        assert_eq!(*listener.completed.lock(), vec![1, 2]);
    }

    #[test]
    fn restricted_pair_rejects_object_transmission() {
        let (a, _b) = SyncDriver::create_restricted_transport_pair();
        assert!(a.can_transmit(&DriverObject::Blob(vec![1])));
        assert!(!a.can_transmit(&DriverObject::Memory(Region::allocate(4))));
    }
}
