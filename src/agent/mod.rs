//! Host side of the guest agent protocol.

mod client;

pub use client::AgentClient;
