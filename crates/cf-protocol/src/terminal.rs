//! Session-layer messages
//!
//! A participant talks to a node over one byte pipe: a tunnel channel or a
//! direct connection. Each pipe message carries one bincode-encoded
//! `SessionMessage`.
//!
//! 1. Node sends `Challenge`
//! 2. Participant sends `Start`, signing the challenge with its certificate key
//! 3. Node answers `Started` (or `Error`) and the pipe switches to
//!    `Input`/`Output`/`Resize` traffic until `Exited`, `Leave` or close

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::message::ErrorCode;

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Request to start or join an interactive session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    /// Remote login to run the process as
    pub login: String,
    /// Session to join, or the id to give a new session
    pub session_id: Option<String>,
    /// Fail with `SessionNotFound` instead of creating
    pub join_only: bool,
    /// Single command to run instead of the login shell
    pub command: Option<String>,
    pub size: TerminalSize,
    /// Encoded user certificate
    pub certificate: Vec<u8>,
    /// Signature over `challenge_payload`
    pub signature: Vec<u8>,
}

impl StartRequest {
    /// Bytes a participant signs to prove possession of its certificate key
    pub fn challenge_payload(nonce: &[u8], login: &str, session_id: Option<&str>) -> Vec<u8> {
        let mut payload = Vec::with_capacity(nonce.len() + login.len() + 32);
        payload.extend_from_slice(b"cf-session-start\0");
        payload.extend_from_slice(nonce);
        payload.push(0);
        payload.extend_from_slice(login.as_bytes());
        payload.push(0);
        if let Some(id) = session_id {
            payload.extend_from_slice(id.as_bytes());
        }
        payload
    }
}

/// Session-layer messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMessage {
    Challenge { nonce: Vec<u8> },
    Start(StartRequest),
    Started { session_id: String, joined: bool },
    Input(Bytes),
    Output(Bytes),
    Resize(TerminalSize),
    /// The session's process exited
    Exited { code: Option<i32> },
    /// The participant detaches without ending the session
    Leave,
    Error { code: ErrorCode, message: String },
}

impl SessionMessage {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(bytes)?)
    }
}
