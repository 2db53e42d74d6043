use serde::{Deserialize, Serialize};

/// A monotonic position in one direction of one route segment.
///
/// Every parcel sent in one direction along a route carries a strictly
/// increasing `SequenceNumber`, assigned by the terminal router that
/// originated it. Receivers reassemble the sequence regardless of which
/// link each parcel happened to travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub const ZERO: Self = Self(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// The sequence number immediately after this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Identifies one logical route hop multiplexed over a `NodeLink`.
///
/// Sublinks 0..`MAX_INITIAL_PORTALS` are reserved for the initial portals
/// exchanged during the connection handshake; everything above is handed out
/// by the link memory's atomic generator, so either side may mint new ids
/// without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SublinkId(pub u64);

impl SublinkId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SublinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sublink:{}", self.0)
    }
}

/// Identifies one shared buffer registered with a link's memory pool.
///
/// Buffer 0 is always the primary buffer established at connection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BufferId(pub u64);

impl BufferId {
    /// The primary buffer shared by both sides of a `NodeLink`.
    pub const PRIMARY: Self = Self(0);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buffer:{}", self.0)
    }
}

/// A random 128-bit node identity.
///
/// Brokers generate their own names and assign names to the non-broker nodes
/// they connect. The all-zero name is reserved as "invalid".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct NodeName {
    pub high: u64,
    pub low: u64,
}

impl NodeName {
    pub const fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    pub const fn is_valid(&self) -> bool {
        self.high != 0 || self.low != 0
    }
}

impl std::fmt::Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.high, self.low)
    }
}

/// Which side of a two-sided link this endpoint occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkSide {
    A,
    B,
}

impl LinkSide {
    pub fn opposite(self) -> Self {
        match self {
            LinkSide::A => LinkSide::B,
            LinkSide::B => LinkSide::A,
        }
    }

    pub fn is_side_a(self) -> bool {
        self == LinkSide::A
    }
}

impl std::fmt::Display for LinkSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkSide::A => write!(f, "A"),
            LinkSide::B => write!(f, "B"),
        }
    }
}

/// The role a link plays within a route.
///
/// A `Central` link joins the innermost router of each side of the route, and
/// is the only kind of link with shared [`RouterLinkState`]-style status. A
/// `PeripheralInward`/`PeripheralOutward` pair joins a proxying router to the
/// newer router that superseded it on the same side. A `Bridge` joins the two
/// routes of a portal merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkType {
    Central,
    PeripheralInward,
    PeripheralOutward,
    Bridge,
}

impl LinkType {
    /// True if parcels arriving over this link travel toward this side's
    /// terminal router (and should be queued as inbound).
    pub fn is_outward(self) -> bool {
        matches!(self, LinkType::Central | LinkType::PeripheralOutward)
    }

    /// True if parcels arriving over this link travel away from this side's
    /// terminal router (and should be forwarded as outbound).
    pub fn is_inward(self) -> bool {
        matches!(self, LinkType::PeripheralInward | LinkType::Bridge)
    }
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkType::Central => "central",
            LinkType::PeripheralInward => "peripheral-inward",
            LinkType::PeripheralOutward => "peripheral-outward",
            LinkType::Bridge => "bridge",
        };
        f.write_str(s)
    }
}

/// Broker nodes mediate introductions and assign node names; normal nodes
/// reach other normal nodes only through a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Broker,
    Normal,
}

/// The kind of object occupying one attachment slot of a parcel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleType {
    /// A portal; consumes one entry of `AcceptParcel::new_routers`.
    Portal,
    /// A boxed driver object; consumes one entry of the frame's object array.
    Box,
}

/// Locates a block within a link's shared buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockDescriptor {
    pub buffer: BufferId,
    pub block_index: u32,
    pub block_size: u32,
}

impl BlockDescriptor {
    pub const NULL: Self = Self {
        buffer: BufferId(0),
        block_index: 0,
        block_size: 0,
    };

    pub fn is_null(&self) -> bool {
        self.block_size == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_ordered_and_advance() {
        let a = SequenceNumber::new(3);
        assert!(a < a.next());
        assert_eq!(a.next().value(), 4);
        assert_eq!(SequenceNumber::ZERO.value(), 0);
    }

    #[test]
    fn invalid_node_name_is_all_zero() {
        assert!(!NodeName::default().is_valid());
        assert!(NodeName::new(0, 1).is_valid());
        assert_eq!(NodeName::new(1, 2).to_string().len(), 32);
    }

    #[test]
    fn link_type_direction_classification() {
        assert!(LinkType::Central.is_outward());
        assert!(LinkType::PeripheralOutward.is_outward());
        assert!(LinkType::PeripheralInward.is_inward());
        assert!(LinkType::Bridge.is_inward());
    }

    #[test]
    fn null_block_descriptor() {
        assert!(BlockDescriptor::NULL.is_null());
        let d = BlockDescriptor {
            buffer: BufferId::PRIMARY,
            block_index: 3,
            block_size: 64,
        };
        assert!(!d.is_null());
    }
}
