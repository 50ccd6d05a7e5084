//! Pooled sessions keyed by node address.
//!
//! Replaces the open-close-per-call discipline with an explicit
//! lease/release one: a leased session is held exclusively by a single
//! operation, returns to the idle list when the lease drops, and idle
//! sessions are closed by a background sweep once they sit parked past the
//! idle timeout.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pinnet_types::{NodeAddress, Result};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::session::{NodeSession, SessionFactory};

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How long an idle session may sit parked before being closed.
    pub idle_timeout: Duration,
    /// Idle sessions kept per node address.
    pub max_idle_per_node: usize,
    /// Interval between idle sweeps.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            max_idle_per_node: 2,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

struct IdleSession {
    session: Arc<dyn NodeSession>,
    parked_at: Instant,
}

struct PoolInner {
    factory: Arc<dyn SessionFactory>,
    config: PoolConfig,
    idle: Mutex<HashMap<String, Vec<IdleSession>>>,
}

impl PoolInner {
    fn release(&self, node_key: &str, session: Arc<dyn NodeSession>) {
        let excess = {
            let mut idle = self.idle.lock();
            let sessions = idle.entry(node_key.to_string()).or_default();
            sessions.push(IdleSession {
                session,
                parked_at: Instant::now(),
            });
            if sessions.len() > self.config.max_idle_per_node {
                Some(sessions.remove(0).session)
            } else {
                None
            }
        };
        if let Some(session) = excess {
            close_in_background(session);
        }
    }
}

fn close_in_background(session: Arc<dyn NodeSession>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move { session.close().await });
    }
}

/// Sessions pooled by node address with exclusive lease/release.
pub struct SessionPool {
    inner: Arc<PoolInner>,
    sweeper: JoinHandle<()>,
}

impl SessionPool {
    /// Build the pool and spawn its idle sweep task.
    pub fn new(factory: Arc<dyn SessionFactory>, config: PoolConfig) -> Self {
        let inner = Arc::new(PoolInner {
            factory,
            config,
            idle: Mutex::new(HashMap::new()),
        });

        let sweep_inner = inner.clone();
        let sweeper = tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweep_inner.config.sweep_interval).await;
                sweep(&sweep_inner).await;
            }
        });

        Self { inner, sweeper }
    }

    /// Lease a session for `node`, reusing a parked one when available.
    ///
    /// The lease is exclusive: a parked session leaves the idle list while
    /// leased and returns on drop, so no locking is needed inside the
    /// session for the operation's duration.
    pub async fn lease(&self, node: &NodeAddress) -> Result<SessionLease> {
        let node_key = node.as_str().to_string();
        let parked = {
            let mut idle = self.inner.idle.lock();
            idle.get_mut(&node_key).and_then(|sessions| sessions.pop())
        };

        let session = match parked {
            Some(idle) => idle.session,
            None => self.inner.factory.open(node).await?,
        };

        Ok(SessionLease {
            session,
            node_key,
            inner: self.inner.clone(),
            park: AtomicBool::new(true),
        })
    }

    /// Idle sessions currently parked across all nodes.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().values().map(Vec::len).sum()
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

async fn sweep(inner: &PoolInner) {
    let idle_timeout = inner.config.idle_timeout;
    let expired: Vec<Arc<dyn NodeSession>> = {
        let mut idle = inner.idle.lock();
        let now = Instant::now();
        let mut expired = Vec::new();
        idle.retain(|_, sessions| {
            sessions.retain(|parked| {
                if now.duration_since(parked.parked_at) > idle_timeout {
                    expired.push(parked.session.clone());
                    false
                } else {
                    true
                }
            });
            !sessions.is_empty()
        });
        expired
    };

    if !expired.is_empty() {
        debug!(count = expired.len(), "closing idle sessions");
        for session in expired {
            session.close().await;
        }
    }
}

/// Exclusive hold on a pooled session.
///
/// Dropping the lease returns the session to the pool on every exit path;
/// [`SessionLease::discard`] closes it instead, for operations that have
/// reason to distrust the connection afterwards.
pub struct SessionLease {
    session: Arc<dyn NodeSession>,
    node_key: String,
    inner: Arc<PoolInner>,
    park: AtomicBool,
}

impl SessionLease {
    /// Close the session on drop instead of parking it.
    pub fn discard(&self) {
        self.park.store(false, Ordering::SeqCst);
    }
}

impl Deref for SessionLease {
    type Target = dyn NodeSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.park.load(Ordering::SeqCst) {
            self.inner.release(&self.node_key, self.session.clone());
        } else {
            close_in_background(self.session.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StubSessionFactory;

    fn node() -> NodeAddress {
        NodeAddress::parse("/dnsaddr/pool.example.org/p2p/QmPoolPeer").unwrap()
    }

    fn pool_with(factory: &StubSessionFactory, config: PoolConfig) -> SessionPool {
        SessionPool::new(Arc::new(factory.clone()), config)
    }

    #[tokio::test]
    async fn lease_reuses_parked_sessions() {
        let factory = StubSessionFactory::new();
        let pool = pool_with(&factory, PoolConfig::default());

        drop(pool.lease(&node()).await.unwrap());
        assert_eq!(pool.idle_count(), 1);

        drop(pool.lease(&node()).await.unwrap());
        assert_eq!(factory.open_count(&node()), 1);
    }

    #[tokio::test]
    async fn concurrent_leases_get_distinct_sessions() {
        let factory = StubSessionFactory::new();
        let pool = pool_with(&factory, PoolConfig::default());

        let first = pool.lease(&node()).await.unwrap();
        let second = pool.lease(&node()).await.unwrap();
        assert_eq!(factory.open_count(&node()), 2);

        drop(first);
        drop(second);
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn discarded_sessions_are_not_parked() {
        let factory = StubSessionFactory::new();
        let pool = pool_with(&factory, PoolConfig::default());

        let lease = pool.lease(&node()).await.unwrap();
        lease.discard();
        drop(lease);
        assert_eq!(pool.idle_count(), 0);

        drop(pool.lease(&node()).await.unwrap());
        assert_eq!(factory.open_count(&node()), 2);
    }

    #[tokio::test]
    async fn idle_list_is_bounded_per_node() {
        let factory = StubSessionFactory::new();
        let pool = pool_with(
            &factory,
            PoolConfig {
                max_idle_per_node: 1,
                ..PoolConfig::default()
            },
        );

        let first = pool.lease(&node()).await.unwrap();
        let second = pool.lease(&node()).await.unwrap();
        drop(first);
        drop(second);

        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_closes_sessions_idle_past_the_timeout() {
        let factory = StubSessionFactory::new();
        let pool = pool_with(
            &factory,
            PoolConfig {
                idle_timeout: Duration::from_secs(60),
                sweep_interval: Duration::from_secs(10),
                ..PoolConfig::default()
            },
        );

        drop(pool.lease(&node()).await.unwrap());
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(pool.idle_count(), 0);

        drop(pool.lease(&node()).await.unwrap());
        assert_eq!(factory.open_count(&node()), 2);
    }
}
