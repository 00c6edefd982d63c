//! Connection to a broker
//!
//! - [`client`]: the [`Connection`] handle applications hold
//! - [`session`]: the task that owns correlation state for one connection
//! - [`outcome`]: completions and subscription acknowledgments
//! - [`state`]: lifecycle states and their transition function

pub mod client;
pub mod outcome;
mod session;
pub mod state;

pub use client::Connection;
pub use outcome::{Completion, Subscription, SubscriptionId};
pub use state::{next_state, ConnectionState, StateEvent};
