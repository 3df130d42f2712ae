//! Tunnel message types
//!
//! Messages travel inside frames (see `codec.rs`). Control traffic uses
//! channel 0; every other channel id names one virtual channel.
//!
//! # Link handshake
//!
//! 1. The site dials out and opens the physical connection
//! 2. Central sends `Hello` with a random nonce
//! 3. Site sends `Register` with its host certificate, its own nonce and a
//!    signature over the central nonce
//! 4. Central verifies and answers `RegisterAck`, carrying its own host
//!    certificate and a signature over the site nonce when accepted
//!
//! # Channel lifecycle
//!
//! Central sends `ChannelOpen` on a fresh channel id. The site answers with
//! `ChannelAccept` or `ChannelReject`. `Data` flows in both directions until
//! either end sends `ChannelClose`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::presence::PresenceUpdate;

/// Current protocol version string, sent in `Hello` and `Register`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    Register = 0x02,
    RegisterAck = 0x03,
    Heartbeat = 0x04,
    HeartbeatAck = 0x05,
    ChannelOpen = 0x10,
    ChannelAccept = 0x11,
    ChannelReject = 0x12,
    Data = 0x13,
    ChannelClose = 0x14,
    Presence = 0x20,
    Error = 0xFF,
}

impl MessageType {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Register),
            0x03 => Some(Self::RegisterAck),
            0x04 => Some(Self::Heartbeat),
            0x05 => Some(Self::HeartbeatAck),
            0x10 => Some(Self::ChannelOpen),
            0x11 => Some(Self::ChannelAccept),
            0x12 => Some(Self::ChannelReject),
            0x13 => Some(Self::Data),
            0x14 => Some(Self::ChannelClose),
            0x20 => Some(Self::Presence),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// Error codes carried by `ChannelReject`, `Error` and session-layer errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    AccessDenied = 1,
    AuthenticationFailed = 2,
    SessionNotFound = 3,
    SessionClosed = 4,
    SpawnFailed = 5,
    LimitExceeded = 6,
    InvalidMessage = 7,
    TargetUnreachable = 8,
}

/// Tunnel protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Central greets a freshly connected site
    Hello {
        nonce: Vec<u8>,
        version: String,
    },

    /// Site identifies itself
    Register {
        domain: String,
        host: String,
        /// Encoded host certificate
        certificate: Vec<u8>,
        /// Fresh nonce the central side must sign
        nonce: Vec<u8>,
        /// Signature over the `Hello` nonce with the certificate's key
        signature: Vec<u8>,
        #[serde(default)]
        version: Option<String>,
    },

    /// Registration outcome
    RegisterAck {
        accepted: bool,
        reason: Option<String>,
        /// Central host certificate (empty when rejected)
        certificate: Vec<u8>,
        /// Signature over the `Register` nonce (empty when rejected)
        signature: Vec<u8>,
    },

    /// Liveness ping from the site
    Heartbeat {
        timestamp: u64,
    },

    /// Heartbeat acknowledgment
    HeartbeatAck {
        /// Echo of the original timestamp
        timestamp: u64,
    },

    /// Request a new virtual channel towards `target` (a host name or address)
    ChannelOpen {
        target: String,
    },

    ChannelAccept,

    ChannelReject {
        code: ErrorCode,
        reason: String,
    },

    /// Opaque channel payload
    Data(Bytes),

    ChannelClose,

    /// Node or session presence snapshot, control channel only
    Presence(PresenceUpdate),

    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello { .. } => MessageType::Hello,
            Message::Register { .. } => MessageType::Register,
            Message::RegisterAck { .. } => MessageType::RegisterAck,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::HeartbeatAck { .. } => MessageType::HeartbeatAck,
            Message::ChannelOpen { .. } => MessageType::ChannelOpen,
            Message::ChannelAccept => MessageType::ChannelAccept,
            Message::ChannelReject { .. } => MessageType::ChannelReject,
            Message::Data(_) => MessageType::Data,
            Message::ChannelClose => MessageType::ChannelClose,
            Message::Presence(_) => MessageType::Presence,
            Message::Error { .. } => MessageType::Error,
        }
    }

    /// Bytes a site signs to answer the central side's `Hello` nonce
    pub fn register_payload(nonce: &[u8], domain: &str, host: &str) -> Vec<u8> {
        signed_payload(b"cf-tunnel-register\0", nonce, domain, host)
    }

    /// Bytes the central side signs to answer the site's `Register` nonce
    pub fn register_ack_payload(nonce: &[u8], domain: &str, host: &str) -> Vec<u8> {
        signed_payload(b"cf-tunnel-register-ack\0", nonce, domain, host)
    }
}

fn signed_payload(context: &[u8], nonce: &[u8], domain: &str, host: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(context.len() + nonce.len() + domain.len() + host.len() + 2);
    payload.extend_from_slice(context);
    payload.extend_from_slice(nonce);
    payload.push(0);
    payload.extend_from_slice(domain.as_bytes());
    payload.push(0);
    payload.extend_from_slice(host.as_bytes());
    payload
}
