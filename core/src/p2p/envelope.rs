//! Envelopes, the store that deduplicates them, and the tracing hook the
//! node calls for every envelope it observes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Bytes of an envelope that are not payload: topic, expiry, ttl, nonce
pub const ENVELOPE_HEADER_LEN: usize = 4 + 4 + 4 + 8;

/// Envelope hash
pub type EnvelopeHash = [u8; 32];

/// Four-byte channel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Topic(pub [u8; 4]);

impl Topic {
    /// Derive a topic from an arbitrary name (first four bytes of its SHA-256)
    pub fn from_name(name: &str) -> Self {
        let hash = Sha256::digest(name.as_bytes());
        Topic([hash[0], hash[1], hash[2], hash[3]])
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// A single relayed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: Topic,
    /// Unix seconds after which the envelope is dropped
    pub expiry: u32,
    /// Seconds the envelope lives after it was created
    pub ttl: u32,
    pub nonce: u64,
    pub data: Vec<u8>,
}

impl Envelope {
    /// Build an envelope expiring `ttl` seconds from now
    pub fn new(topic: Topic, ttl: u32, data: Vec<u8>) -> Self {
        let now = chrono::Utc::now().timestamp().max(0) as u32;
        Self {
            topic,
            expiry: now.saturating_add(ttl),
            ttl,
            nonce: rand::random(),
            data,
        }
    }

    /// SHA-256 over the canonical field encoding
    pub fn hash(&self) -> EnvelopeHash {
        let mut hasher = Sha256::new();
        hasher.update(self.topic.0);
        hasher.update(self.expiry.to_be_bytes());
        hasher.update(self.ttl.to_be_bytes());
        hasher.update(self.nonce.to_be_bytes());
        hasher.update(&self.data);
        hasher.finalize().into()
    }

    /// Size in bytes used for volume accounting
    pub fn size(&self) -> u32 {
        (ENVELOPE_HEADER_LEN + self.data.len()).min(u32::MAX as usize) as u32
    }

    pub fn is_expired(&self, now: u32) -> bool {
        self.expiry < now
    }
}

/// Where an observed envelope came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeSource {
    /// Origin not known to the node (locally posted envelopes land here)
    Unknown,
    /// Received from a connected peer
    P2p,
}

impl EnvelopeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeSource::Unknown => "unknown",
            EnvelopeSource::P2p => "p2p",
        }
    }
}

impl fmt::Display for EnvelopeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the node reports about one observed envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeMeta {
    pub topic: Topic,
    pub source: EnvelopeSource,
    /// First time this node has seen the envelope hash
    pub is_new: bool,
    /// Node id of the peer the envelope arrived from; empty when local
    pub peer: String,
    pub size: u32,
}

impl EnvelopeMeta {
    pub fn new(envelope: &Envelope, source: EnvelopeSource, is_new: bool, peer: &str) -> Self {
        Self {
            topic: envelope.topic,
            source,
            is_new,
            peer: peer.to_string(),
            size: envelope.size(),
        }
    }
}

/// Hook called synchronously once per observed envelope.
///
/// Called from the node's connection tasks, possibly concurrently, so
/// implementations must not block or perform I/O.
pub trait EnvelopeTracer: Send + Sync {
    fn trace(&self, meta: &EnvelopeMeta);
}

/// Envelopes currently alive on this node, keyed by hash
#[derive(Clone, Default)]
pub struct EnvelopeStore {
    envelopes: Arc<RwLock<HashMap<EnvelopeHash, Envelope>>>,
}

impl EnvelopeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an envelope; returns true if the hash was not already stored
    pub async fn add(&self, envelope: Envelope) -> bool {
        let hash = envelope.hash();
        let mut envelopes = self.envelopes.write().await;
        if envelopes.contains_key(&hash) {
            return false;
        }
        envelopes.insert(hash, envelope);
        true
    }

    pub async fn contains(&self, hash: &EnvelopeHash) -> bool {
        self.envelopes.read().await.contains_key(hash)
    }

    pub async fn len(&self) -> usize {
        self.envelopes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop envelopes whose expiry is before `now`; returns how many were removed
    pub async fn expire(&self, now: u32) -> usize {
        let mut envelopes = self.envelopes.write().await;
        let before = envelopes.len();
        envelopes.retain(|_, e| !e.is_expired(now));
        before - envelopes.len()
    }
}
