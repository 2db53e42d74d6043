//! The driver seam: transports and shared memory are provided from outside.
//!
//! The routing layer never touches an OS primitive directly. Everything that
//! moves bytes between nodes or shares memory across them goes through a
//! [`Driver`], so the same router code runs over sockets, pipes, or the
//! in-process reference driver used by the test suite.

use std::sync::Arc;

use weft_memory::Region;

/// One unit of transmission on a [`Transport`]: an encoded wire envelope plus
/// any driver objects that ride out-of-band.
pub struct Frame {
    pub data: Vec<u8>,
    pub objects: Vec<DriverObject>,
}

impl Frame {
    pub fn data_only(data: Vec<u8>) -> Self {
        Self {
            data,
            objects: Vec::new(),
        }
    }
}

/// An object a driver can carry across a transport alongside message data.
#[derive(Clone)]
pub enum DriverObject {
    /// One end of a transport, used to introduce nodes to each other.
    Transport(Arc<dyn Transport>),
    /// A shared memory region.
    Memory(Region),
    /// An opaque application payload boxed into a parcel.
    Blob(Vec<u8>),
}

impl std::fmt::Debug for DriverObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverObject::Transport(_) => f.write_str("DriverObject::Transport"),
            DriverObject::Memory(region) => write!(f, "DriverObject::Memory({region:?})"),
            DriverObject::Blob(data) => write!(f, "DriverObject::Blob({}B)", data.len()),
        }
    }
}

/// The transport failed in a way that severs the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportError;

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("transport disconnected")
    }
}

impl std::error::Error for TransportError {}

/// Receives frames and error notifications from an active transport.
///
/// Returning `false` from [`on_frame`](TransportListener::on_frame) reports a
/// validation failure; the driver tears the transport down and the other side
/// observes a disconnection.
pub trait TransportListener: Send + Sync {
    fn on_frame(&self, frame: Frame) -> bool;
    fn on_error(&self);
}

/// One end of a bidirectional, sequenced, frame-oriented channel between two
/// nodes.
pub trait Transport: Send + Sync {
    /// Queue a frame for the other end. Delivery order matches transmission
    /// order. Fails only if the transport is already severed.
    fn transmit(&self, frame: Frame) -> Result<(), TransportError>;

    /// Install `listener` and begin delivering frames, including any queued
    /// before activation. May be called again to hand the transport to a new
    /// listener mid-stream.
    fn activate(&self, listener: Arc<dyn TransportListener>);

    /// Stop delivering frames. Queued and future frames are dropped.
    fn deactivate(&self);

    /// Sever the transport. The other end's listener gets `on_error`.
    fn disconnect(&self);

    /// Whether this transport can carry `object` out-of-band. When it cannot,
    /// the link falls back to relaying the whole message through the broker.
    fn can_transmit(&self, object: &DriverObject) -> bool;
}

/// Factory for the primitives the routing layer needs from its environment.
pub trait Driver: Send + Sync {
    /// A connected pair of transport ends.
    fn create_transport_pair(&self) -> (Arc<dyn Transport>, Arc<dyn Transport>);

    /// A zeroed shared memory region of `num_words` 64-bit words.
    fn allocate_region(&self, num_words: usize) -> Region;

    /// Entropy for node identities. Drivers backed by a platform CSPRNG may
    /// override this.
    fn random_u64(&self) -> u64 {
        rand::random()
    }
}
