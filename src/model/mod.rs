//! Data models shared by the relay and the peers
//!
//! [`message`] is the signaling wire format; [`probe`] is the latency probe
//! carried over the negotiated data channel.

pub mod message;
pub mod probe;
