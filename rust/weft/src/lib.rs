#![deny(unsafe_code)]

//! A routing layer for moving parcels between portals across process
//! boundaries.
//!
//! Applications see [`Node`] and [`Portal`]. A portal pair is a reliable,
//! ordered, two-way parcel pipe; portals themselves can travel inside
//! parcels, and the routing layer transparently collapses whatever chain of
//! proxies those moves leave behind. Transports and shared memory come from
//! a [`Driver`]; [`SyncDriver`] is the in-process reference driver.

mod connector;
mod driver;
mod error;
mod link_state;
mod local_router_link;
mod node;
mod node_link;
mod parcel;
mod portal;
mod remote_router_link;
mod route_edge;
mod router;
mod router_link;
mod sequenced_queue;
mod sync_driver;
mod trap;

pub use driver::{Driver, DriverObject, Frame, Transport, TransportError, TransportListener};
pub use error::Error;
pub use node::Node;
pub use portal::{GetTransaction, Handle, MergeError, Portal, PutTransaction};
pub use sync_driver::SyncDriver;
pub use trap::{conditions, PortalStatus, TrapConditions, TrapEvent, TrapHandler};

pub use weft_memory::Region;
pub use weft_wire::{NodeName, NodeType};
