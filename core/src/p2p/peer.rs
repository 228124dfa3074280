/// Peer management and connection state
use crate::error::{NodeError, Result};
use crate::p2p::protocol::{Frame, Message, MAX_FRAME_LEN, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;
use tokio::time::timeout;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Id prefix of configured peers whose real node id is not known yet
pub const DIAL_TARGET_PREFIX: &str = "peer-";

/// Connection state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Fully connected and ready
    Connected,
}

/// Information about a peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub node_id: String,
    pub address: SocketAddr,
    pub state: ConnectionState,
    pub last_seen: Option<Instant>,
    pub last_attempt: Option<Instant>,
    pub connection_attempts: u32,
    pub added_at: Instant,
}

impl PeerInfo {
    pub fn new(node_id: String, address: SocketAddr) -> Self {
        Self {
            node_id,
            address,
            state: ConnectionState::Disconnected,
            last_seen: None,
            last_attempt: None,
            connection_attempts: 0,
            added_at: Instant::now(),
        }
    }

    /// Configured address entry rather than a handshaken node
    pub fn is_dial_target(&self) -> bool {
        self.node_id.starts_with(DIAL_TARGET_PREFIX)
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn update_last_seen(&mut self) {
        self.last_seen = Some(Instant::now());
    }

    /// True once `cooldown` has passed since the last dial attempt
    pub fn cooled_down(&self, cooldown: Duration) -> bool {
        self.last_attempt.map_or(true, |at| at.elapsed() >= cooldown)
    }

    /// Check if peer should be considered stale
    pub fn is_stale(&self, timeout: Duration) -> bool {
        // Freshly added peers get a grace period
        if self.added_at.elapsed() < Duration::from_secs(30) {
            return false;
        }

        match self.last_seen {
            Some(last_seen) => last_seen.elapsed() > timeout,
            None => self.added_at.elapsed() > timeout,
        }
    }
}

/// Peer manager for tracking and managing peer connections
#[derive(Clone)]
pub struct PeerManager {
    peers: Arc<RwLock<HashMap<String, PeerInfo>>>,
    our_node_id: String,
    our_listen_port: u16,
}

impl PeerManager {
    pub fn new(our_node_id: String, our_listen_port: u16) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            our_node_id,
            our_listen_port,
        }
    }

    /// Add or update a peer
    pub async fn add_peer(&self, node_id: String, address: SocketAddr) {
        let mut peers = self.peers.write().await;
        peers
            .entry(node_id.clone())
            .and_modify(|p| p.address = address)
            .or_insert_with(|| PeerInfo::new(node_id, address));
    }

    /// Register a configured bootstrap address to be dialed
    pub async fn add_dial_target(&self, address: SocketAddr) {
        self.add_peer(format!("{}{}", DIAL_TARGET_PREFIX, address), address).await;
    }

    pub async fn remove_peer(&self, node_id: &str) {
        self.peers.write().await.remove(node_id);
    }

    pub async fn update_peer_state(&self, node_id: &str, state: ConnectionState) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            peer.state = state;
            if state == ConnectionState::Connected {
                peer.connection_attempts = 0;
            }
        }
    }

    pub async fn update_peer_last_seen(&self, node_id: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            peer.update_last_seen();
        }
    }

    /// Handshaken peers with a live connection
    pub async fn get_connected_peers(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|p| p.is_connected() && !p.is_dial_target())
            .cloned()
            .collect()
    }

    /// All handshaken peers, connected or not
    pub async fn get_all_peers(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        peers.values().filter(|p| !p.is_dial_target()).cloned().collect()
    }

    /// Configured addresses, with their dial state
    pub async fn get_dial_targets(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().await;
        peers.values().filter(|p| p.is_dial_target()).cloned().collect()
    }

    /// Remove stale handshaken peers (only disconnected ones).
    /// Dial targets are configuration and are never removed.
    pub async fn remove_stale_peers(&self, timeout: Duration) -> usize {
        let mut peers = self.peers.write().await;
        let initial_len = peers.len();
        peers.retain(|_, peer| {
            peer.is_dial_target() || peer.state != ConnectionState::Disconnected || !peer.is_stale(timeout)
        });
        initial_len - peers.len()
    }

    pub async fn increment_connection_attempts(&self, node_id: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            peer.connection_attempts += 1;
            peer.last_attempt = Some(Instant::now());
        }
    }

    pub async fn reset_connection_attempts(&self, node_id: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(node_id) {
            peer.connection_attempts = 0;
        }
    }

    /// Perform handshake with a peer; returns the remote node id and protocol version
    pub async fn perform_handshake<S>(&self, stream: &mut S, is_incoming: bool) -> Result<(String, u8)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if is_incoming {
            // Wait for handshake from peer
            let handshake = timeout(HANDSHAKE_TIMEOUT, read_message(stream))
                .await
                .map_err(|_| NodeError::Timeout("Handshake timeout".to_string()))??;

            let (node_id, protocol_version) = match handshake {
                Message::Handshake {
                    node_id,
                    protocol_version,
                    ..
                } => {
                    check_version(protocol_version)?;
                    (node_id, protocol_version)
                }
                _ => return Err(NodeError::Protocol("Expected handshake message".to_string())),
            };

            let ack = Message::HandshakeAck {
                node_id: self.our_node_id.clone(),
                protocol_version: PROTOCOL_VERSION,
            };
            write_message(stream, &ack).await?;

            Ok((node_id, protocol_version))
        } else {
            let handshake = Message::Handshake {
                node_id: self.our_node_id.clone(),
                protocol_version: PROTOCOL_VERSION,
                listen_port: self.our_listen_port,
            };
            write_message(stream, &handshake).await?;

            let ack = timeout(HANDSHAKE_TIMEOUT, read_message(stream))
                .await
                .map_err(|_| NodeError::Timeout("Handshake ack timeout".to_string()))??;

            match ack {
                Message::HandshakeAck {
                    node_id,
                    protocol_version,
                } => {
                    check_version(protocol_version)?;
                    Ok((node_id, protocol_version))
                }
                _ => Err(NodeError::Protocol("Expected handshake ack".to_string())),
            }
        }
    }
}

fn check_version(protocol_version: u8) -> Result<()> {
    if protocol_version != PROTOCOL_VERSION {
        return Err(NodeError::Protocol(format!(
            "Protocol version mismatch: expected {}, got {}",
            PROTOCOL_VERSION, protocol_version
        )));
    }
    Ok(())
}

/// Read one length-prefixed frame and decode it
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let length = u32::from_be_bytes(len_buf) as usize;
    if length > MAX_FRAME_LEN {
        return Err(NodeError::Protocol(format!("Frame too large: {} bytes", length)));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Message::from_bytes(&payload).map_err(|e| NodeError::Protocol(format!("Invalid message: {}", e)))
}

/// Encode a message as one frame and write it
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = Frame::from_message(message)?;
    writer.write_all(&frame.to_bytes()).await?;
    Ok(())
}
