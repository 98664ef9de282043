//! Signaling for the rover's camera links.
//!
//! A room-based relay ([`hub`], served by [`server`]) lets a rover and a
//! console that cannot reach each other directly exchange the offer/answer and
//! ICE candidates needed for a peer-to-peer WebRTC path. Each endpoint runs a
//! [`session::PeerSession`] that drives that exchange against a
//! [`engine::MediaEngine`].

pub mod config;
pub mod engine;
pub mod hub;
pub mod model;
pub mod peer;
pub mod server;
pub mod session;
pub mod util;
