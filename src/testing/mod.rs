//! Test doubles
//!
//! An in-process broker that speaks the transport contract, so connections and event
//! loops can be exercised without a network.

pub mod loopback;

pub use loopback::LoopbackBroker;
