//! Network boundary of the agent.
//!
//! Strategies never talk to `reqwest` directly: they go through the
//! [`Fetch`] trait so they can run against a scripted network in tests.

mod client;
mod types;

#[cfg(test)]
pub mod testing;

pub use client::{is_hop_by_hop, HttpClient};
pub use types::{AgentRequest, AgentResponse, Fetch};
