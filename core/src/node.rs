/// Envelope relay node
use crate::accounts::AccountManager;
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::p2p::envelope::{
    Envelope, EnvelopeHash, EnvelopeMeta, EnvelopeSource, EnvelopeStore, EnvelopeTracer, Topic,
};
use crate::p2p::peer::{read_message, write_message, ConnectionState, PeerManager};
use crate::p2p::protocol::Message;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// Outbound messages queued per link before new ones are dropped
const LINK_QUEUE_LEN: usize = 1024;
/// Tolerated clock skew for envelopes expiring further out than their ttl allows
const FUTURE_ALLOWANCE_SECS: u32 = 10;

type Link = mpsc::Sender<Message>;

/// P2P envelope relay node
#[derive(Clone)]
pub struct Node {
    /// Unique node identifier
    pub id: String,

    config: NodeConfig,

    peer_manager: PeerManager,

    envelopes: EnvelopeStore,

    /// Outbound queues of live connections, keyed by remote node id
    links: Arc<RwLock<HashMap<String, Link>>>,

    tracer: Option<Arc<dyn EnvelopeTracer>>,

    accounts: AccountManager,

    shutdown: Arc<watch::Sender<bool>>,

    stopped: Arc<watch::Sender<bool>>,
}

impl Node {
    /// Create a new node; `tracer` sees every envelope the node observes
    pub fn new(config: NodeConfig, tracer: Option<Arc<dyn EnvelopeTracer>>) -> Self {
        let id = Uuid::new_v4().to_string();
        let peer_manager = PeerManager::new(id.clone(), config.listen_addr.port());

        info!("Created new node with ID: {}", id);

        Self {
            id,
            config,
            peer_manager,
            envelopes: EnvelopeStore::new(),
            links: Arc::new(RwLock::new(HashMap::new())),
            tracer,
            accounts: AccountManager::new(),
            shutdown: Arc::new(watch::channel(false).0),
            stopped: Arc::new(watch::channel(false).0),
        }
    }

    /// Start the node in the background.
    ///
    /// The returned receiver resolves once the listener is bound (with the
    /// bound address) or with the bind error if the node could not start.
    pub fn start(&self) -> oneshot::Receiver<Result<SocketAddr>> {
        let (started_tx, started_rx) = oneshot::channel();
        let node = self.clone();
        tokio::spawn(async move { node.run(started_tx).await });
        started_rx
    }

    /// Resolves once the node has fully stopped
    pub async fn wait(&self) {
        let mut stopped = self.stopped.subscribe();
        wait_until_set(&mut stopped).await;
    }

    /// Ask all node tasks to stop
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn accounts(&self) -> &AccountManager {
        &self.accounts
    }

    /// (node id, connected peers, known peers)
    pub async fn status(&self) -> (String, usize, usize) {
        let connected = self.peer_manager.get_connected_peers().await.len();
        let total = self.peer_manager.get_all_peers().await.len();
        (self.id.clone(), connected, total)
    }

    /// Number of envelopes currently held
    pub async fn envelope_count(&self) -> usize {
        self.envelopes.len().await
    }

    /// Post a new envelope from this node using the configured ttl
    pub async fn post(&self, topic: Topic, data: Vec<u8>) -> Result<EnvelopeHash> {
        let ttl = self.config.envelope_ttl.as_secs().min(u32::MAX as u64) as u32;
        let envelope = Envelope::new(topic, ttl, data);
        let hash = envelope.hash();
        self.send_envelope(envelope).await?;
        Ok(hash)
    }

    /// Inject a locally built envelope; returns whether it was new to this node
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<bool> {
        if self.is_shutting_down() {
            return Err(NodeError::Connection("Node is shutting down".to_string()));
        }
        validate_expiry(&envelope, unix_now())?;

        let is_new = self.envelopes.add(envelope.clone()).await;
        self.trace(&EnvelopeMeta::new(&envelope, EnvelopeSource::Unknown, is_new, ""));
        if is_new {
            self.broadcast(Message::Envelope { envelope }, None).await;
        }
        Ok(is_new)
    }

    fn trace(&self, meta: &EnvelopeMeta) {
        if let Some(tracer) = &self.tracer {
            tracer.trace(meta);
        }
    }

    /// Handle an envelope received from `peer_id`
    async fn ingest(&self, envelope: Envelope, peer_id: &str) {
        if let Err(e) = validate_expiry(&envelope, unix_now()) {
            debug!("Dropping envelope from {}: {}", peer_id, e);
            return;
        }

        let is_new = self.envelopes.add(envelope.clone()).await;
        self.trace(&EnvelopeMeta::new(&envelope, EnvelopeSource::P2p, is_new, peer_id));

        if is_new {
            debug!("New envelope on topic {} from {}", envelope.topic, peer_id);
            self.broadcast(Message::Envelope { envelope }, Some(peer_id)).await;
        }
    }

    /// Queue a message on every live link except `except`
    async fn broadcast(&self, message: Message, except: Option<&str>) {
        let links = self.links.read().await;
        for (peer_id, link) in links.iter() {
            if Some(peer_id.as_str()) == except {
                continue;
            }
            match link.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Outbound queue to {} is full, dropping {}", peer_id, message);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Link to {} already closed", peer_id);
                }
            }
        }
    }

    async fn run(self, started: oneshot::Sender<Result<SocketAddr>>) {
        info!("Starting node {}", self.id);

        let listener = match TcpListener::bind(self.config.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind {}: {}", self.config.listen_addr, e);
                let _ = started.send(Err(NodeError::Io(e)));
                self.stopped.send_replace(true);
                return;
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                let _ = started.send(Err(NodeError::Io(e)));
                self.stopped.send_replace(true);
                return;
            }
        };

        info!("Listening on: {}", local_addr);
        info!("Known peers: {:?}", self.config.known_peers);

        for peer_addr in &self.config.known_peers {
            match peer_addr.parse::<SocketAddr>() {
                Ok(addr) => self.peer_manager.add_dial_target(addr).await,
                Err(_) => warn!("Ignoring invalid peer address: {}", peer_addr),
            }
        }

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        {
            let node = self.clone();
            handles.push(tokio::spawn(async move { node.run_listener(listener).await }));
        }
        {
            let node = self.clone();
            handles.push(tokio::spawn(async move { node.run_connector().await }));
        }
        {
            let node = self.clone();
            handles.push(tokio::spawn(async move { node.run_heartbeat().await }));
        }
        if self.config.handle_signals {
            let node = self.clone();
            tokio::spawn(async move {
                node.wait_for_signal().await;
                node.request_shutdown();
            });
        }

        let _ = started.send(Ok(local_addr));

        let mut shutdown = self.shutdown.subscribe();
        wait_until_set(&mut shutdown).await;
        info!("Shutdown requested, stopping node...");

        for handle in handles {
            let _ = handle.await;
        }
        self.links.write().await.clear();

        info!("Node stopped");
        self.stopped.send_replace(true);
    }

    /// Wait for Ctrl+C or SIGTERM
    async fn wait_for_signal(&self) {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Ctrl+C received"),
                Err(e) => {
                    error!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("SIGTERM received");
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
            _ = wait_until_set(&mut shutdown) => {},
        }
    }

    async fn run_listener(&self, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = wait_until_set(&mut shutdown) => break,
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let node = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = node.handle_incoming_connection(stream, addr).await {
                                    error!("Error handling incoming connection from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_incoming_connection(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!("Incoming connection from {}", addr);

        let (peer_id, protocol_version) = self.peer_manager.perform_handshake(&mut stream, true).await?;
        info!(
            "Handshake successful with {} (ID: {}, protocol: {})",
            addr, peer_id, protocol_version
        );

        self.peer_manager.add_peer(peer_id.clone(), addr).await;
        self.serve_peer(stream, peer_id).await
    }

    /// Dial configured peers that are not connected
    async fn run_connector(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut retry = interval(self.config.retry_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = wait_until_set(&mut shutdown) => break,
                _ = retry.tick() => {}
            }

            for peer in self.peer_manager.get_dial_targets().await {
                if peer.state != ConnectionState::Disconnected {
                    continue;
                }
                if peer.connection_attempts >= self.config.max_connection_attempts {
                    if !peer.cooled_down(self.config.redial_cooldown) {
                        continue;
                    }
                    debug!("Retrying {} after cooldown", peer.address);
                    self.peer_manager.reset_connection_attempts(&peer.node_id).await;
                }

                let node = self.clone();
                tokio::spawn(async move {
                    node.connect_to_peer(peer.node_id, peer.address).await;
                });
            }
        }
    }

    /// Dial a configured address and serve the connection
    async fn connect_to_peer(&self, temp_id: String, addr: SocketAddr) {
        self.peer_manager.update_peer_state(&temp_id, ConnectionState::Connecting).await;
        self.peer_manager.increment_connection_attempts(&temp_id).await;

        let mut stream = match timeout(self.config.connection_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Failed to connect to {}: {}", addr, e);
                self.peer_manager.update_peer_state(&temp_id, ConnectionState::Disconnected).await;
                return;
            }
            Err(_) => {
                warn!("Connection timeout to {}", addr);
                self.peer_manager.update_peer_state(&temp_id, ConnectionState::Disconnected).await;
                return;
            }
        };

        let (peer_id, protocol_version) = match self.peer_manager.perform_handshake(&mut stream, false).await {
            Ok(result) => result,
            Err(e) => {
                error!("Handshake failed with {}: {}", addr, e);
                self.peer_manager.update_peer_state(&temp_id, ConnectionState::Disconnected).await;
                return;
            }
        };

        if peer_id == self.id {
            warn!("Dialed ourselves at {}, dropping peer entry", addr);
            self.peer_manager.remove_peer(&temp_id).await;
            return;
        }

        if self.links.read().await.contains_key(&peer_id) {
            // Counts as a failed attempt so the dial target gives up eventually
            debug!("Already connected to {} through another connection", peer_id);
            self.peer_manager.update_peer_state(&temp_id, ConnectionState::Disconnected).await;
            return;
        }

        info!("Connected to peer {} (ID: {}, protocol: {})", addr, peer_id, protocol_version);

        // The dial target stays Connected while the handshaken peer is live
        self.peer_manager.update_peer_state(&temp_id, ConnectionState::Connected).await;
        self.peer_manager.add_peer(peer_id.clone(), addr).await;

        if let Err(e) = self.serve_peer(stream, peer_id).await {
            error!("Error in connection with {}: {}", addr, e);
        }

        self.peer_manager.update_peer_last_seen(&temp_id).await;
        self.peer_manager.update_peer_state(&temp_id, ConnectionState::Disconnected).await;
    }

    /// Register the link, run the connection, then clean up
    async fn serve_peer(&self, stream: TcpStream, peer_id: String) -> Result<()> {
        let (tx, rx) = mpsc::channel(LINK_QUEUE_LEN);
        {
            let mut links = self.links.write().await;
            if links.contains_key(&peer_id) {
                debug!("Already connected to {}, dropping duplicate connection", peer_id);
                return Ok(());
            }
            links.insert(peer_id.clone(), tx.clone());
        }

        self.peer_manager.update_peer_state(&peer_id, ConnectionState::Connected).await;
        self.peer_manager.update_peer_last_seen(&peer_id).await;

        let (reader, writer) = stream.into_split();
        let writer_task = tokio::spawn(run_writer(writer, rx));

        let result = self.handle_connection(reader, &peer_id, &tx).await;

        self.links.write().await.remove(&peer_id);
        if self.is_shutting_down() {
            let _ = tx.try_send(Message::Close {
                reason: "shutdown".to_string(),
            });
        }
        drop(tx);
        let _ = timeout(Duration::from_secs(1), writer_task).await;

        self.peer_manager.update_peer_state(&peer_id, ConnectionState::Disconnected).await;
        info!("Disconnected from {}", peer_id);
        result
    }

    /// Read loop of an established connection
    async fn handle_connection(
        &self,
        mut reader: tokio::net::tcp::OwnedReadHalf,
        peer_id: &str,
        tx: &Link,
    ) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let message = tokio::select! {
                _ = wait_until_set(&mut shutdown) => break,
                read = timeout(IDLE_TIMEOUT, read_message(&mut reader)) => match read {
                    Ok(Ok(message)) => message,
                    Ok(Err(NodeError::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        debug!("Connection closed by peer: {}", peer_id);
                        break;
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_) => {
                        warn!("Peer {} idle for {:?}, disconnecting", peer_id, IDLE_TIMEOUT);
                        break;
                    }
                }
            };

            self.peer_manager.update_peer_last_seen(peer_id).await;

            match message {
                Message::Ping { timestamp } => {
                    debug!("Received ping from {}", peer_id);
                    if tx.try_send(Message::Pong { timestamp }).is_err() {
                        debug!("Dropping pong to {}", peer_id);
                    }
                }
                Message::Pong { .. } => {
                    debug!("Received pong from {}", peer_id);
                }
                Message::Envelope { envelope } => {
                    self.ingest(envelope, peer_id).await;
                }
                Message::Close { reason } => {
                    info!("Peer {} closed connection: {}", peer_id, reason);
                    break;
                }
                other => {
                    debug!("Received unexpected {} from {}", other, peer_id);
                }
            }
        }

        Ok(())
    }

    /// Log peer counts, expire envelopes, drop stale peers
    async fn run_heartbeat(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut tick = interval(self.config.heartbeat_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = wait_until_set(&mut shutdown) => break,
                _ = tick.tick() => {}
            }

            let (_, connected, total) = self.status().await;
            debug!("Heartbeat - Connected: {}/{} peers", connected, total);

            let expired = self.envelopes.expire(unix_now()).await;
            if expired > 0 {
                debug!("Expired {} envelopes", expired);
            }

            let removed = self.peer_manager.remove_stale_peers(self.config.peer_stale_timeout).await;
            if removed > 0 {
                info!("Removed {} stale peers", removed);
            }
        }
    }
}

/// Drain a link's queue onto the socket, pinging when idle
async fn run_writer(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Message>) {
    let mut keepalive = interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
    keepalive.tick().await;

    loop {
        let message = tokio::select! {
            next = rx.recv() => match next {
                Some(message) => message,
                None => break,
            },
            _ = keepalive.tick() => Message::Ping {
                timestamp: chrono::Utc::now().timestamp(),
            },
        };

        if let Err(e) = write_message(&mut writer, &message).await {
            debug!("Write failed: {}", e);
            break;
        }
    }
}

/// Resolves once the flag is true (or its sender is gone)
async fn wait_until_set(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

fn unix_now() -> u32 {
    chrono::Utc::now().timestamp().max(0) as u32
}

fn validate_expiry(envelope: &Envelope, now: u32) -> Result<()> {
    if envelope.is_expired(now) {
        return Err(NodeError::Protocol("Envelope expired".to_string()));
    }
    let latest = now
        .saturating_add(envelope.ttl)
        .saturating_add(FUTURE_ALLOWANCE_SECS);
    if envelope.expiry > latest {
        return Err(NodeError::Protocol("Envelope expires too far in the future".to_string()));
    }
    Ok(())
}
