use std::sync::Arc;

use weft_wire::{HandleType, SequenceNumber};

use crate::driver::DriverObject;
use crate::router::Router;
use crate::sequenced_queue::Sequenced;

/// One attachment slot of a parcel.
pub enum Attachment {
    /// A moved portal, represented by its router. Wrapped back into a portal
    /// when the application retrieves the parcel.
    Router(Arc<Router>),
    /// A boxed driver object.
    Object(DriverObject),
}

/// One application message traveling along a route.
pub struct Parcel {
    sequence_number: SequenceNumber,
    data: Vec<u8>,
    /// Bytes already consumed by partial two-phase gets.
    data_offset: usize,
    attachments: Vec<Attachment>,
}

impl Parcel {
    pub fn new(data: Vec<u8>, attachments: Vec<Attachment>) -> Self {
        Self {
            sequence_number: SequenceNumber::ZERO,
            data,
            data_offset: 0,
            attachments,
        }
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    pub fn set_sequence_number(&mut self, n: SequenceNumber) {
        self.sequence_number = n;
    }

    /// Unconsumed payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data[self.data_offset..]
    }

    /// Mark `num_bytes` of payload consumed.
    pub fn consume_data(&mut self, num_bytes: usize) {
        debug_assert!(num_bytes <= self.data().len());
        self.data_offset += num_bytes;
    }

    pub fn into_data(mut self) -> Vec<u8> {
        self.data.split_off(self.data_offset)
    }

    pub fn num_attachments(&self) -> usize {
        self.attachments.len()
    }

    pub fn take_attachments(&mut self) -> Vec<Attachment> {
        std::mem::take(&mut self.attachments)
    }

    /// The wire-visible slot layout of this parcel's attachments.
    pub fn handle_types(&self) -> Vec<HandleType> {
        self.attachments
            .iter()
            .map(|attachment| match attachment {
                Attachment::Router(_) => HandleType::Portal,
                Attachment::Object(_) => HandleType::Box,
            })
            .collect()
    }

    /// Close the routes of any portals still attached. Called when a parcel
    /// is discarded instead of delivered, so the other side of each attached
    /// route observes closure rather than silence.
    pub fn close_attachments(&mut self) {
        for attachment in self.attachments.drain(..) {
            if let Attachment::Router(router) = attachment {
                router.close_route();
            }
        }
    }
}

impl Sequenced for Parcel {
    fn size_in_bytes(&self) -> usize {
        self.data.len() - self.data_offset
    }
}

impl std::fmt::Debug for Parcel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Parcel({}, {}B, {} attachments)",
            self.sequence_number,
            self.data().len(),
            self.attachments.len()
        )
    }
}
