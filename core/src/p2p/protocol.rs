/// Protocol definitions for P2P communication
use crate::p2p::envelope::Envelope;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on a single frame; larger length prefixes are treated as garbage
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Message types in the protocol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Message {
    /// Handshake message sent when establishing connection
    #[serde(rename = "handshake")]
    Handshake {
        node_id: String,
        protocol_version: u8,
        listen_port: u16,
    },

    /// Acknowledgment of handshake
    #[serde(rename = "handshake_ack")]
    HandshakeAck {
        node_id: String,
        protocol_version: u8,
    },

    /// A relayed envelope
    #[serde(rename = "envelope")]
    Envelope { envelope: Envelope },

    /// Ping message for keepalive
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },

    /// Pong response to ping
    #[serde(rename = "pong")]
    Pong { timestamp: i64 },

    /// Connection close notification
    #[serde(rename = "close")]
    Close { reason: String },
}

impl Message {
    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Get message type as string
    pub fn message_type(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "handshake",
            Message::HandshakeAck { .. } => "handshake_ack",
            Message::Envelope { .. } => "envelope",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Close { .. } => "close",
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message({})", self.message_type())
    }
}

/// Protocol frame with length prefix
#[derive(Debug)]
pub struct Frame {
    pub length: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame from a message
    pub fn from_message(message: &Message) -> Result<Self, serde_json::Error> {
        let payload = message.to_bytes()?;
        Ok(Self {
            length: payload.len() as u32,
            payload,
        })
    }

    /// Serialize frame to bytes (length prefix + payload)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.payload.len());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::envelope::Topic;

    #[test]
    fn test_envelope_message_tagged() {
        let msg = Message::Envelope {
            envelope: Envelope::new(Topic([1, 2, 3, 4]), 60, b"hi".to_vec()),
        };
        let json = String::from_utf8(msg.to_bytes().unwrap()).unwrap();
        assert!(json.contains("\"type\":\"envelope\""));
        assert_eq!(Message::from_bytes(json.as_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_frame_is_length_prefixed() {
        let msg = Message::Ping { timestamp: 12345 };
        let bytes = Frame::from_message(&msg).unwrap().to_bytes();
        let length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(length, bytes.len() - 4);
        assert_eq!(Message::from_bytes(&bytes[4..]).unwrap(), msg);
    }
}
