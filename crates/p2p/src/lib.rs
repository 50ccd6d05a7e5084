//! libp2p-backed storage sessions for the pinnet client.
//!
//! This crate provides the production implementation of the client's
//! narrow session interface: a [`StorageSession`] wraps a libp2p swarm
//! (tcp + noise + yamux transport, identify + ping + Kademlia behaviours)
//! driven by a background task, and [`Libp2pSessionFactory`] opens one
//! session per storage node on demand. Block fetch and publish ride on
//! Kademlia records keyed by the content address bytes.

pub mod session;

pub use libp2p::{Multiaddr, PeerId};
pub use session::{
    Libp2pSessionFactory, SessionConfig, SessionError, SessionEvent, StorageSession,
};
