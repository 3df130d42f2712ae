//! Message pipe abstraction
//!
//! A conduit is one bidirectional, ordered message pipe between a participant
//! and a node. Virtual tunnel channels and direct TCP connections both
//! implement it, so session code never knows which route it came over.

use async_trait::async_trait;
use bytes::Bytes;
use cf_protocol::SessionMessage;

use crate::error::{ConduitError, SessionError};

#[async_trait]
pub trait Conduit: Send {
    async fn send(&mut self, payload: Bytes) -> Result<(), ConduitError>;

    /// Next payload. `Ok(None)` once the far end closed cleanly.
    /// Cancel-safe.
    async fn recv(&mut self) -> Result<Option<Bytes>, ConduitError>;

    /// Close this end. Idempotent.
    async fn close(&mut self);

    /// Short description for logs
    fn describe(&self) -> String;
}

pub type BoxConduit = Box<dyn Conduit>;

/// Session-layer messages over any conduit
#[async_trait]
pub trait SessionConduit {
    async fn send_session(&mut self, message: &SessionMessage) -> Result<(), SessionError>;

    /// Next session message; `Ok(None)` once the far end closed
    async fn recv_session(&mut self) -> Result<Option<SessionMessage>, SessionError>;
}

#[async_trait]
impl<C: Conduit + ?Sized> SessionConduit for C {
    async fn send_session(&mut self, message: &SessionMessage) -> Result<(), SessionError> {
        let payload = message.encode()?;
        self.send(payload).await?;
        Ok(())
    }

    async fn recv_session(&mut self) -> Result<Option<SessionMessage>, SessionError> {
        match self.recv().await? {
            Some(payload) => Ok(Some(SessionMessage::decode(&payload)?)),
            None => Ok(None),
        }
    }
}

/// Copy payloads both ways until either side closes or fails, then close both
pub async fn splice(a: &mut dyn Conduit, b: &mut dyn Conduit) {
    loop {
        tokio::select! {
            from_a = a.recv() => match from_a {
                Ok(Some(payload)) => {
                    if b.send(payload).await.is_err() {
                        break;
                    }
                }
                _ => break,
            },
            from_b = b.recv() => match from_b {
                Ok(Some(payload)) => {
                    if a.send(payload).await.is_err() {
                        break;
                    }
                }
                _ => break,
            },
        }
    }
    a.close().await;
    b.close().await;
}
