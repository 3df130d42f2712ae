//! A caller's attachment to an interactive session on a node

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use cf_core::services::Permit;
use cf_core::traits::{BoxConduit, SessionConduit};
use cf_protocol::{SessionMessage, TerminalSize};

use super::error::GatewayError;

const RELAY_BUFFER: usize = 8192;

/// What the node sent back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    Data(Bytes),
    /// The session's process exited with this code
    Exited(Option<i32>),
}

/// Live session handle returned by `Gateway::connect`
pub struct ActiveSession {
    conduit: BoxConduit,
    session_id: String,
    joined: bool,
    _permit: Permit,
}

impl ActiveSession {
    pub(super) fn new(conduit: BoxConduit, session_id: String, joined: bool, permit: Permit) -> Self {
        Self {
            conduit,
            session_id,
            joined,
            _permit: permit,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether an existing session was joined rather than created
    pub fn joined(&self) -> bool {
        self.joined
    }

    pub async fn write(&mut self, data: Bytes) -> Result<(), GatewayError> {
        self.conduit
            .send_session(&SessionMessage::Input(data))
            .await?;
        Ok(())
    }

    pub async fn resize(&mut self, size: TerminalSize) -> Result<(), GatewayError> {
        self.conduit
            .send_session(&SessionMessage::Resize(size))
            .await?;
        Ok(())
    }

    /// Next output from the node. `Ok(None)` once the route closed without
    /// an exit status.
    pub async fn next(&mut self) -> Result<Option<SessionOutput>, GatewayError> {
        loop {
            match self.conduit.recv_session().await? {
                Some(SessionMessage::Output(data)) => return Ok(Some(SessionOutput::Data(data))),
                Some(SessionMessage::Exited { code }) => {
                    return Ok(Some(SessionOutput::Exited(code)))
                }
                Some(SessionMessage::Error { code, message }) => {
                    return Err(GatewayError::from_node(code, message))
                }
                Some(other) => {
                    debug!(session_id = %self.session_id, "Ignoring {:?} from node", other);
                }
                None => return Ok(None),
            }
        }
    }

    /// Detach without ending the session for the other participants
    pub async fn leave(mut self) {
        let _ = self.conduit.send_session(&SessionMessage::Leave).await;
        self.conduit.close().await;
    }

    /// Pump raw bytes between the session and a byte stream until the
    /// process exits, the route drops or the reader reaches EOF. Returns the
    /// exit code when the process exited.
    pub async fn relay<R, W>(mut self, mut reader: R, mut writer: W) -> Result<Option<i32>, GatewayError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut buf = vec![0u8; RELAY_BUFFER];
        loop {
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!(session_id = %self.session_id, "Caller closed, leaving session");
                        self.leave().await;
                        return Ok(None);
                    }
                    Ok(n) => self.write(Bytes::copy_from_slice(&buf[..n])).await?,
                    Err(e) => {
                        self.leave().await;
                        return Err(GatewayError::Internal(format!("caller stream failed: {}", e)));
                    }
                },

                output = self.next() => match output? {
                    Some(SessionOutput::Data(data)) => {
                        if let Err(e) = write_all(&mut writer, &data).await {
                            self.leave().await;
                            return Err(GatewayError::Internal(format!("caller stream failed: {}", e)));
                        }
                    }
                    Some(SessionOutput::Exited(code)) => {
                        let _ = writer.shutdown().await;
                        return Ok(code);
                    }
                    None => {
                        let _ = writer.shutdown().await;
                        return Err(GatewayError::SessionClosed);
                    }
                },
            }
        }
    }
}

async fn write_all<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

impl std::fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSession")
            .field("session_id", &self.session_id)
            .field("joined", &self.joined)
            .field("route", &self.conduit.describe())
            .finish()
    }
}
