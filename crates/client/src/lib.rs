//! Pinnet content client.
//!
//! Timeout-bounded upload/fetch/pin/remove operations against a remote
//! content-addressed storage node, plus local directory listing. The
//! networking layer is consumed through the narrow [`session`] interface;
//! the libp2p implementation lives in `pinnet-p2p`, and
//! [`StubSessionFactory`] provides an offline stand-in for tests and
//! stub-mode nodes.

pub mod client;
pub mod deadline;
pub mod fslist;
pub mod pool;
pub mod session;

pub use client::{ClientConfig, ContentClient};
pub use deadline::{bound, DEFAULT_DEADLINE};
pub use pool::{PoolConfig, SessionLease, SessionPool};
pub use session::{NodeSession, SessionFactory, StubSessionFactory};
