//! One connection to a content-addressed storage node.
//!
//! A session owns a libp2p swarm bootstrapped against the node's
//! multiaddress and exposes a small command API so the rest of the
//! workspace can drive it without importing libp2p directly. The swarm
//! runs on a background tokio task; commands and replies travel over
//! channels, and the task shuts down when the session is closed or
//! dropped.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::core::upgrade;
use libp2p::identify;
use libp2p::identity;
use libp2p::kad;
use libp2p::multiaddr::Protocol;
use libp2p::noise;
use libp2p::ping;
use libp2p::swarm::{NetworkBehaviour, Swarm, SwarmEvent};
use libp2p::tcp;
use libp2p::yamux;
use libp2p::{Multiaddr, PeerId, Transport};
use parking_lot::{Mutex, RwLock};
use pinnet_client::{NodeSession, SessionFactory};
use pinnet_types::{ContentAddress, Error, NodeAddress};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Session errors
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("invalid node address: {0}")]
    Address(String),
    #[error("failed to reach the storage node: {0}")]
    Connect(String),
    #[error("connect phase exceeded its deadline")]
    ConnectTimeout,
    #[error("transport setup failed: {0}")]
    Transport(String),
    #[error("session command channel closed")]
    ChannelClosed,
    #[error("query failed: {0}")]
    Query(String),
    #[error("peer events already consumed")]
    EventsTaken,
}

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Address(message) => Error::InvalidNodeAddress(message),
            SessionError::Connect(_) | SessionError::ConnectTimeout | SessionError::Transport(_) => {
                Error::Connect(err.to_string())
            }
            other => Error::Session(other.to_string()),
        }
    }
}

/// Configuration for one storage session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Addresses to listen on. Defaults to an ephemeral tcp port.
    pub listen_addresses: Vec<Multiaddr>,
    /// Bootstrap peers dialed on open; the storage node's address goes here.
    pub bootstrap: Vec<Multiaddr>,
    /// Bound on the bootstrap/connect phase.
    pub connect_deadline: Duration,
    /// Bound applied to individual Kademlia queries.
    pub query_timeout: Duration,
    /// Optional deterministic identity. If `None`, a new Ed25519 keypair is generated.
    pub identity_keypair: Option<identity::Keypair>,
    /// Identify protocol version.
    pub protocol_version: String,
    /// Identify agent version string.
    pub agent_version: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let default_listen =
            Multiaddr::from_str("/ip4/0.0.0.0/tcp/0").expect("valid default multiaddr");
        Self {
            listen_addresses: vec![default_listen],
            bootstrap: Vec::new(),
            connect_deadline: Duration::from_secs(60),
            query_timeout: Duration::from_secs(30),
            identity_keypair: None,
            protocol_version: "/pinnet/1.0.0".to_string(),
            agent_version: format!("pinnet-p2p/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Commands used to control the background swarm task.
enum SessionCommand {
    Fetch {
        key: kad::RecordKey,
        reply: oneshot::Sender<Result<Option<Vec<u8>>, SessionError>>,
    },
    Publish {
        record: kad::Record,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Shutdown,
}

/// Events produced by the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A peer became known via connection, identify, or routing updates.
    PeerDiscovered { peer: PeerId },
    /// Peer connected.
    PeerConnected { peer: PeerId },
    /// Peer disconnected.
    PeerDisconnected { peer: PeerId },
    /// Swarm listening on new address.
    NewListenAddr { address: Multiaddr },
}

/// Combined network behaviour exposed by the swarm.
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "ComposedEvent")]
struct ComposedBehaviour {
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    kademlia: kad::Behaviour<kad::store::MemoryStore>,
}

impl ComposedBehaviour {
    fn new(local_key: &identity::Keypair, peer_id: PeerId, config: &SessionConfig) -> Self {
        let identify = identify::Behaviour::new(
            identify::Config::new(config.protocol_version.clone(), local_key.public())
                .with_agent_version(config.agent_version.clone()),
        );

        let ping = ping::Behaviour::default();

        let mut kad_cfg = kad::Config::default();
        kad_cfg.set_query_timeout(config.query_timeout);
        let store = kad::store::MemoryStore::new(peer_id);
        let kademlia = kad::Behaviour::with_config(peer_id, store, kad_cfg);

        Self {
            identify,
            ping,
            kademlia,
        }
    }
}

/// Helper enum produced by the derived [`NetworkBehaviour`].
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
enum ComposedEvent {
    Identify(identify::Event),
    Ping(ping::Event),
    Kademlia(kad::Event),
}

impl From<identify::Event> for ComposedEvent {
    fn from(value: identify::Event) -> Self {
        ComposedEvent::Identify(value)
    }
}

impl From<ping::Event> for ComposedEvent {
    fn from(value: ping::Event) -> Self {
        ComposedEvent::Ping(value)
    }
}

impl From<kad::Event> for ComposedEvent {
    fn from(value: kad::Event) -> Self {
        ComposedEvent::Kademlia(value)
    }
}

/// Handle to one open connection to a storage node.
pub struct StorageSession {
    peer_id: PeerId,
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    events_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>>,
    discovered: Arc<RwLock<Vec<PeerId>>>,
    listen_addresses: Arc<RwLock<HashSet<Multiaddr>>>,
    closed: AtomicBool,
    _task: JoinHandle<()>,
}

impl StorageSession {
    /// Open a session: build the swarm, dial the bootstrap peers, and wait
    /// for the first connection within the configured connect deadline.
    ///
    /// With an empty bootstrap list the session is local-only and ready
    /// immediately.
    pub async fn open(config: SessionConfig) -> Result<Self, SessionError> {
        let keypair = config
            .identity_keypair
            .clone()
            .unwrap_or_else(identity::Keypair::generate_ed25519);
        let peer_id = PeerId::from(keypair.public());
        debug!("opening storage session as peer {}", peer_id);

        let tcp_transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true));
        let transport = tcp_transport
            .upgrade(upgrade::Version::V1)
            .authenticate(
                noise::Config::new(&keypair)
                    .map_err(|err| SessionError::Transport(err.to_string()))?,
            )
            .multiplex(yamux::Config::default())
            .boxed();

        let behaviour = ComposedBehaviour::new(&keypair, peer_id, &config);
        let swarm_config = libp2p::swarm::Config::with_tokio_executor();
        let mut swarm = Swarm::new(transport, behaviour, peer_id, swarm_config);
        swarm
            .behaviour_mut()
            .kademlia
            .set_mode(Some(kad::Mode::Server));

        let listen_addresses = Arc::new(RwLock::new(HashSet::<Multiaddr>::new()));
        for addr in &config.listen_addresses {
            match Swarm::listen_on(&mut swarm, addr.clone()) {
                Ok(_) => {
                    listen_addresses.write().insert(addr.clone());
                }
                Err(err) => warn!("Failed to listen on {addr}: {err}"),
            }
        }

        for address in &config.bootstrap {
            if let Some(peer) = extract_peer_id(address) {
                swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer, address.clone());
            }
            if let Err(err) = swarm.dial(address.clone()) {
                warn!("Failed to dial bootstrap {}: {}", address, err);
            }
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel::<SessionCommand>();
        let (event_tx, events_rx) = mpsc::unbounded_channel::<SessionEvent>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();

        let discovered = Arc::new(RwLock::new(Vec::<PeerId>::new()));
        let bootstrapping = !config.bootstrap.is_empty();

        let task = tokio::spawn(run_swarm(SwarmTask {
            swarm,
            command_rx,
            event_tx,
            ready_tx: bootstrapping.then_some(ready_tx),
            pending_fetches: HashMap::new(),
            pending_publishes: HashMap::new(),
            discovered: discovered.clone(),
            listen_addresses: listen_addresses.clone(),
            connections: 0,
        }));

        let session = Self {
            peer_id,
            command_tx,
            events_rx: Arc::new(Mutex::new(Some(events_rx))),
            discovered,
            listen_addresses,
            closed: AtomicBool::new(false),
            _task: task,
        };

        if bootstrapping {
            match tokio::time::timeout(config.connect_deadline, ready_rx).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(reason))) => {
                    session.close();
                    return Err(SessionError::Connect(reason));
                }
                Ok(Err(_)) => {
                    session.close();
                    return Err(SessionError::ChannelClosed);
                }
                Err(_) => {
                    session.close();
                    return Err(SessionError::ConnectTimeout);
                }
            }
        }

        Ok(session)
    }

    /// Returns the local peer ID.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Returns a snapshot of the addresses the session is listening on.
    pub fn listen_addresses(&self) -> Vec<Multiaddr> {
        self.listen_addresses.read().iter().cloned().collect()
    }

    /// Fetch a record by key. `None` means the network answered that no
    /// record exists under the key.
    pub async fn fetch(&self, key: Vec<u8>) -> Result<Option<Vec<u8>>, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Fetch {
                key: kad::RecordKey::from(key),
                reply: reply_tx,
            })
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Publish a record, making it retrievable from the connected node.
    pub async fn publish(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Publish {
                record: kad::Record::new(kad::RecordKey::from(key), value),
                reply: reply_tx,
            })
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Resolve the identity of the first peer discovered on this session.
    ///
    /// The event subscription is single-use: it is consumed by the first
    /// call and dropped as soon as a peer has been seen, so no listener
    /// outlives its one resolution.
    pub async fn first_peer(&self) -> Result<PeerId, SessionError> {
        if let Some(peer) = self.discovered.read().first().copied() {
            return Ok(peer);
        }

        let mut events = self
            .events_rx
            .lock()
            .take()
            .ok_or(SessionError::EventsTaken)?;

        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::PeerDiscovered { peer } | SessionEvent::PeerConnected { peer } => {
                    return Ok(peer);
                }
                _ => {}
            }
        }
        Err(SessionError::ChannelClosed)
    }

    /// Request session shutdown. Idempotent and safe to call at any time;
    /// the background task and its connections wind down asynchronously.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.command_tx.send(SessionCommand::Shutdown);
        }
    }
}

impl Drop for StorageSession {
    fn drop(&mut self) {
        self.close();
    }
}

struct SwarmTask {
    swarm: Swarm<ComposedBehaviour>,
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    ready_tx: Option<oneshot::Sender<Result<(), String>>>,
    pending_fetches: HashMap<kad::QueryId, oneshot::Sender<Result<Option<Vec<u8>>, SessionError>>>,
    pending_publishes: HashMap<kad::QueryId, oneshot::Sender<Result<(), SessionError>>>,
    discovered: Arc<RwLock<Vec<PeerId>>>,
    listen_addresses: Arc<RwLock<HashSet<Multiaddr>>>,
    connections: usize,
}

async fn run_swarm(mut task: SwarmTask) {
    loop {
        tokio::select! {
            swarm_event = task.swarm.select_next_some() => {
                task.handle_swarm_event(swarm_event);
            }
            cmd = task.command_rx.recv() => {
                match cmd {
                    Some(SessionCommand::Shutdown) | None => {
                        debug!("shutting down session swarm");
                        break;
                    }
                    Some(other) => task.handle_command(other),
                }
            }
        }
    }
    info!("session swarm task terminated");
}

impl SwarmTask {
    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Fetch { key, reply } => {
                let query_id = self.swarm.behaviour_mut().kademlia.get_record(key);
                self.pending_fetches.insert(query_id, reply);
            }
            SessionCommand::Publish { record, reply } => {
                match self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .put_record(record, kad::Quorum::One)
                {
                    Ok(query_id) => {
                        self.pending_publishes.insert(query_id, reply);
                    }
                    Err(err) => {
                        let _ = reply.send(Err(SessionError::Query(err.to_string())));
                    }
                }
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<ComposedEvent>) {
        match event {
            SwarmEvent::Behaviour(ComposedEvent::Kademlia(event)) => {
                self.handle_kademlia_event(event);
            }
            SwarmEvent::Behaviour(ComposedEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr);
                }
                self.note_peer(peer_id);
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                self.connections += 1;
                if let Some(ready) = self.ready_tx.take() {
                    let _ = ready.send(Ok(()));
                }
                self.note_peer(peer_id);
                let _ = self.event_tx.send(SessionEvent::PeerConnected { peer: peer_id });
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                self.connections = self.connections.saturating_sub(1);
                let _ = self
                    .event_tx
                    .send(SessionEvent::PeerDisconnected { peer: peer_id });
            }
            SwarmEvent::OutgoingConnectionError { error, .. } => {
                if self.connections == 0 {
                    if let Some(ready) = self.ready_tx.take() {
                        let _ = ready.send(Err(error.to_string()));
                    }
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                self.listen_addresses.write().insert(address.clone());
                let _ = self.event_tx.send(SessionEvent::NewListenAddr { address });
            }
            SwarmEvent::Behaviour(ComposedEvent::Identify(_))
            | SwarmEvent::Behaviour(ComposedEvent::Ping(_)) => {}
            _ => {}
        }
    }

    fn handle_kademlia_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed { id, result, .. } => match result {
                kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FoundRecord(peer_record))) => {
                    if let Some(reply) = self.pending_fetches.remove(&id) {
                        let _ = reply.send(Ok(Some(peer_record.record.value)));
                    }
                    // The first record answers the fetch; stop the query.
                    if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                        query.finish();
                    }
                }
                kad::QueryResult::GetRecord(Ok(
                    kad::GetRecordOk::FinishedWithNoAdditionalRecord { .. },
                )) => {
                    if let Some(reply) = self.pending_fetches.remove(&id) {
                        let _ = reply.send(Ok(None));
                    }
                }
                kad::QueryResult::GetRecord(Err(err)) => {
                    if let Some(reply) = self.pending_fetches.remove(&id) {
                        let outcome = match err {
                            kad::GetRecordError::NotFound { .. } => Ok(None),
                            other => Err(SessionError::Query(other.to_string())),
                        };
                        let _ = reply.send(outcome);
                    }
                }
                kad::QueryResult::PutRecord(Ok(_)) => {
                    if let Some(reply) = self.pending_publishes.remove(&id) {
                        let _ = reply.send(Ok(()));
                    }
                }
                kad::QueryResult::PutRecord(Err(err)) => {
                    if let Some(reply) = self.pending_publishes.remove(&id) {
                        let _ = reply.send(Err(SessionError::Query(err.to_string())));
                    }
                }
                _ => {}
            },
            kad::Event::RoutingUpdated { peer, .. } => {
                self.note_peer(peer);
            }
            _ => {}
        }
    }

    fn note_peer(&mut self, peer: PeerId) {
        if peer == *self.swarm.local_peer_id() {
            return;
        }
        let mut discovered = self.discovered.write();
        if !discovered.contains(&peer) {
            discovered.push(peer);
            let _ = self.event_tx.send(SessionEvent::PeerDiscovered { peer });
        }
    }
}

fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    for protocol in addr.iter() {
        if let Protocol::P2p(peer_id) = protocol {
            return Some(peer_id);
        }
    }
    None
}

/// Production session factory: one libp2p session per open, bootstrapped
/// against the target node's multiaddress.
pub struct Libp2pSessionFactory {
    config: SessionConfig,
}

impl Libp2pSessionFactory {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

impl Default for Libp2pSessionFactory {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

#[async_trait]
impl SessionFactory for Libp2pSessionFactory {
    async fn open(&self, node: &NodeAddress) -> pinnet_types::Result<Arc<dyn NodeSession>> {
        let address = Multiaddr::from_str(node.as_str())
            .map_err(|err| Error::InvalidNodeAddress(format!("{node}: {err}")))?;

        let mut config = self.config.clone();
        config.bootstrap = vec![address];

        let session = StorageSession::open(config).await.map_err(Error::from)?;
        Ok(Arc::new(Libp2pSession(session)))
    }
}

struct Libp2pSession(StorageSession);

#[async_trait]
impl NodeSession for Libp2pSession {
    async fn fetch_block(&self, address: &ContentAddress) -> pinnet_types::Result<Option<Vec<u8>>> {
        self.0.fetch(address.to_bytes()).await.map_err(Error::from)
    }

    async fn publish_block(
        &self,
        address: &ContentAddress,
        data: Vec<u8>,
    ) -> pinnet_types::Result<()> {
        self.0
            .publish(address.to_bytes(), data)
            .await
            .map_err(Error::from)
    }

    async fn first_peer(&self) -> pinnet_types::Result<String> {
        self.0
            .first_peer()
            .await
            .map(|peer| peer.to_string())
            .map_err(Error::from)
    }

    async fn close(&self) {
        self.0.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_has_listen_address() {
        let config = SessionConfig::default();
        assert!(!config.listen_addresses.is_empty());
        assert!(config.bootstrap.is_empty());
    }

    #[test]
    fn peer_id_extraction_from_multiaddr() {
        let peer_id = PeerId::from(identity::Keypair::generate_ed25519().public());
        let addr = Multiaddr::from_str("/ip4/127.0.0.1/tcp/4001")
            .unwrap()
            .with(Protocol::P2p(peer_id));
        assert_eq!(extract_peer_id(&addr), Some(peer_id));

        let bare = Multiaddr::from_str("/ip4/127.0.0.1/tcp/4001").unwrap();
        assert!(extract_peer_id(&bare).is_none());
    }

    #[tokio::test]
    async fn local_session_opens_without_bootstrap() {
        let config = SessionConfig {
            listen_addresses: vec![Multiaddr::from_str("/ip4/127.0.0.1/tcp/0").unwrap()],
            ..SessionConfig::default()
        };

        let session = StorageSession::open(config)
            .await
            .expect("expected session to open");
        assert!(!session.listen_addresses().is_empty());

        session.close();
        session.close();
    }

    #[tokio::test]
    async fn connect_failure_is_reported_within_the_deadline() {
        let config = SessionConfig {
            listen_addresses: vec![Multiaddr::from_str("/ip4/127.0.0.1/tcp/0").unwrap()],
            // Port 1 is reserved and refuses connections immediately.
            bootstrap: vec![Multiaddr::from_str("/ip4/127.0.0.1/tcp/1").unwrap()],
            connect_deadline: Duration::from_secs(5),
            ..SessionConfig::default()
        };

        let result = StorageSession::open(config).await;
        assert!(matches!(
            result,
            Err(SessionError::Connect(_)) | Err(SessionError::ConnectTimeout)
        ));
    }

    async fn dialable_address(session: &StorageSession) -> Multiaddr {
        // Listen addresses arrive asynchronously once the OS assigns a port.
        for _ in 0..50 {
            if let Some(addr) = session
                .listen_addresses()
                .into_iter()
                .find(|addr| !addr.to_string().ends_with("/tcp/0"))
            {
                return addr.with(Protocol::P2p(session.peer_id()));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("session never reported a concrete listen address");
    }

    #[tokio::test]
    async fn sessions_exchange_records_over_localhost() {
        let server = StorageSession::open(SessionConfig {
            listen_addresses: vec![Multiaddr::from_str("/ip4/127.0.0.1/tcp/0").unwrap()],
            ..SessionConfig::default()
        })
        .await
        .expect("server session");

        let server_addr = dialable_address(&server).await;

        let client = StorageSession::open(SessionConfig {
            listen_addresses: vec![Multiaddr::from_str("/ip4/127.0.0.1/tcp/0").unwrap()],
            bootstrap: vec![server_addr],
            connect_deadline: Duration::from_secs(10),
            ..SessionConfig::default()
        })
        .await
        .expect("client session");

        // The bootstrap peer is the first one the client discovers.
        let first = client.first_peer().await.expect("first peer");
        assert_eq!(first, server.peer_id());

        let key = b"record under test".to_vec();
        client
            .publish(key.clone(), b"payload".to_vec())
            .await
            .expect("publish");

        let fetched = server.fetch(key).await.expect("fetch");
        assert_eq!(fetched, Some(b"payload".to_vec()));

        client.close();
        server.close();
    }
}
