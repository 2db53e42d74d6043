#![deny(unsafe_code)]

//! Wire-level types for the weft routing layer.
//!
//! Everything a `NodeLink` puts on a transport is defined here: the
//! identifier newtypes, the [`Message`] enum, and the [`Envelope`] framing
//! that carries a per-link sequence number. Variant order of [`Message`] is
//! wire-significant (postcard enum discriminants).

mod ids;
pub use ids::*;

mod message;
pub use message::*;
