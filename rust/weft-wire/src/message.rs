use serde::{Deserialize, Serialize};

use crate::{
    BlockDescriptor, BufferId, HandleType, LinkSide, NodeName, NodeType, SequenceNumber, SublinkId,
};

/// Index into the driver-object array transmitted alongside a message.
///
/// Driver objects (transports, shared memory regions, boxed handles) cannot
/// be flattened into message bytes; they ride out-of-band on the frame and
/// messages reference them by slot.
pub type ObjectSlot = u32;

/// State snapshot used to reconstruct a router at the far end of a route
/// extension.
///
/// Sequence numbering must continue exactly where the serialized router left
/// off, and a peer closure observed before the move must survive it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterDescriptor {
    /// Sublink pre-registered by the sender for the peripheral link between
    /// the old router (now a proxy) and the new router.
    pub new_sublink: SublinkId,
    /// The next sequence number the new router assigns to an outbound parcel.
    pub next_outgoing_sequence_number: SequenceNumber,
    /// The first inbound sequence number the new router should expect; the
    /// proxy forwards everything it had queued, starting here.
    pub next_incoming_sequence_number: SequenceNumber,
    /// Whether the other side of the route was already known to be closed.
    pub peer_closed: bool,
    /// Final inbound sequence length, if `peer_closed`.
    pub closed_peer_sequence_length: Option<SequenceNumber>,
}

/// A message carried between two nodes over a `NodeLink`.
///
/// Variant order is wire-significant (postcard discriminants). Handlers for
/// messages addressed to a sublink treat an unknown sublink as a benign race,
/// except where unclaimed attachments would leak (see `AcceptParcel`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // ------------------------------------------------------------------
    // Connection bootstrap (handled before the NodeLink goes active)
    // ------------------------------------------------------------------
    /// First message from a broker on a new transport. Carries the shared
    /// primary buffer as a frame object and assigns the receiver its name.
    ConnectFromBroker {
        broker_name: NodeName,
        assigned_name: NodeName,
        num_initial_portals: u32,
        buffer: ObjectSlot,
    },

    /// First message from a non-broker on a new transport.
    ConnectFromNonBroker { num_initial_portals: u32 },

    // ------------------------------------------------------------------
    // Parcel flow
    // ------------------------------------------------------------------
    /// One parcel. `handle_types` describes the attachment slots in order:
    /// each `Portal` entry claims the next element of `new_routers`, each
    /// `Box` entry claims the next driver object on the frame.
    AcceptParcel {
        sublink: SublinkId,
        sequence_number: SequenceNumber,
        data: Vec<u8>,
        handle_types: Vec<HandleType>,
        new_routers: Vec<RouterDescriptor>,
    },

    /// The other side of the route closed cleanly after sending exactly
    /// `sequence_length` parcels.
    RouteClosed {
        sublink: SublinkId,
        sequence_length: SequenceNumber,
    },

    /// The route was severed without a clean handshake; no final sequence
    /// length could be negotiated.
    RouteDisconnected { sublink: SublinkId },

    /// Asks the addressed router to run a flush pass, used to nudge a peer
    /// whose link-state waiting bit was set.
    FlushRouter { sublink: SublinkId },

    // ------------------------------------------------------------------
    // Introductions
    // ------------------------------------------------------------------
    /// Non-broker asks its broker for a link to `name`.
    RequestIntroduction { name: NodeName },

    /// Broker hands the requester one end of a fresh transport plus the
    /// shared memory region for the new link.
    AcceptIntroduction {
        name: NodeName,
        link_side: LinkSide,
        remote_node_type: NodeType,
        transport: ObjectSlot,
        memory: ObjectSlot,
    },

    /// Broker does not know `name`.
    RejectIntroduction { name: NodeName },

    // ------------------------------------------------------------------
    // Link memory
    // ------------------------------------------------------------------
    /// Registers an additional block buffer with the receiving side's pool.
    AddBlockBuffer {
        id: BufferId,
        block_size: u32,
        buffer: ObjectSlot,
    },

    // ------------------------------------------------------------------
    // Proxy bypass
    // ------------------------------------------------------------------
    /// Sent by a proxy to its inward peer: reach out to the proxy's outward
    /// peer directly. The bypassed link is identified by the node that hosts
    /// the outward peer and the sublink joining it to the proxy.
    BypassPeer {
        sublink: SublinkId,
        bypass_target_node: NodeName,
        bypass_target_sublink: SublinkId,
    },

    /// Sent to the proxy's outward peer: adopt a new central link, decaying
    /// the link identified by `current_peer_node`/`current_peer_sublink`.
    /// `inbound_sequence_length_from_bypassed_link` is the total number of
    /// parcels the sender ever routed through the bypassed proxy.
    AcceptBypassLink {
        current_peer_node: NodeName,
        current_peer_sublink: SublinkId,
        inbound_sequence_length_from_bypassed_link: SequenceNumber,
        new_sublink: SublinkId,
        new_link_state: BlockDescriptor,
    },

    /// Fixes the final sequence lengths of a proxy's decaying links; once
    /// both directions progress past them the proxy can be dropped.
    StopProxying {
        sublink: SublinkId,
        inbound_sequence_length: SequenceNumber,
        outbound_sequence_length: SequenceNumber,
    },

    /// Tells the router inward of a proxy the final length of the inbound
    /// sequence still arriving over its decaying link.
    ProxyWillStop {
        sublink: SublinkId,
        inbound_sequence_length: SequenceNumber,
    },

    /// Bypass variant used when the proxy's outward peer lives on the proxy's
    /// own node: the proxy allocates the replacement central link itself.
    BypassPeerWithLink {
        sublink: SublinkId,
        new_sublink: SublinkId,
        new_link_state: BlockDescriptor,
        inbound_sequence_length: SequenceNumber,
    },

    /// Reply to `BypassPeerWithLink`: the final length of the outbound
    /// sequence the proxy should still expect over its decaying inward link.
    StopProxyingToLocalPeer {
        sublink: SublinkId,
        outbound_sequence_length: SequenceNumber,
    },

    // ------------------------------------------------------------------
    // Broker relay
    // ------------------------------------------------------------------
    /// Asks the broker to forward `data` (an encoded [`Envelope`]) and the
    /// frame's driver objects to `destination`.
    RelayMessage { destination: NodeName, data: Vec<u8> },

    /// A relayed envelope arriving from the broker on behalf of `source`.
    AcceptRelayedMessage { source: NodeName, data: Vec<u8> },
}

/// Frame-level wrapper pairing a message with its per-link sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Monotonic per-`NodeLink` transmission counter, used to merge relayed
    /// traffic back into transport order.
    pub sequence_number: u64,
    pub message: Message,
}

/// Failure to decode an inbound frame. Always a validation failure: the peer
/// transmitted something the protocol does not allow.
#[derive(Debug)]
pub struct DecodeError;

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("malformed wire message")
    }
}

impl std::error::Error for DecodeError {}

impl Envelope {
    pub fn encode(&self) -> Vec<u8> {
        // Serialization of these types cannot fail: no maps, no floats, and
        // postcard's alloc writer never errors.
        postcard::to_allocvec(self).expect("wire envelope serialization")
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        postcard::from_bytes(data).map_err(|_| DecodeError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip_preserves_parcel_fields() {
        let envelope = Envelope {
            sequence_number: 7,
            message: Message::AcceptParcel {
                sublink: SublinkId::new(12),
                sequence_number: SequenceNumber::new(3),
                data: b"hello".to_vec(),
                handle_types: vec![HandleType::Portal, HandleType::Box],
                new_routers: vec![RouterDescriptor {
                    new_sublink: SublinkId::new(40),
                    next_outgoing_sequence_number: SequenceNumber::new(5),
                    next_incoming_sequence_number: SequenceNumber::new(2),
                    peer_closed: false,
                    closed_peer_sequence_length: None,
                }],
            },
        };

        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn truncated_frame_is_a_decode_error() {
        let envelope = Envelope {
            sequence_number: 1,
            message: Message::FlushRouter {
                sublink: SublinkId::new(900),
            },
        };
        let bytes = envelope.encode();
        assert!(Envelope::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
