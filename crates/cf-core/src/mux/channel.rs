//! One virtual channel riding a tunnel

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use cf_protocol::{ChannelId, ErrorCode, Frame, Message};

use super::tunnel::MuxShared;
use crate::error::ConduitError;
use crate::traits::Conduit;

/// What the tunnel delivers to a channel's consumer
#[derive(Debug)]
pub enum ChannelEvent {
    Data(Bytes),
    /// The far end closed the channel
    Closed,
    /// The tunnel was torn down
    Lost,
    /// Reset after the consumer let its queue fill up
    Overrun,
}

pub struct VirtualChannel {
    id: ChannelId,
    label: String,
    tunnel: Weak<MuxShared>,
    rx: mpsc::Receiver<ChannelEvent>,
    finished: bool,
}

impl VirtualChannel {
    pub(crate) fn new(
        id: ChannelId,
        tunnel: &Arc<MuxShared>,
        rx: mpsc::Receiver<ChannelEvent>,
    ) -> Self {
        Self {
            id,
            label: tunnel.label.clone(),
            tunnel: Arc::downgrade(tunnel),
            rx,
            finished: false,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    fn tunnel(&self) -> Result<Arc<MuxShared>, ConduitError> {
        match self.tunnel.upgrade() {
            Some(tunnel) if !tunnel.is_closed() => Ok(tunnel),
            _ => Err(ConduitError::TunnelLost),
        }
    }

    pub(crate) async fn send_message(&self, message: Message) -> Result<(), ConduitError> {
        self.tunnel()?
            .out_tx
            .send(Frame::new(self.id, message))
            .await
            .map_err(|_| ConduitError::TunnelLost)
    }

    /// Forget the channel locally without telling the far end
    fn detach(&mut self) {
        self.finished = true;
        if let Some(tunnel) = self.tunnel.upgrade() {
            tunnel.channels.remove(&self.id);
        }
    }
}

#[async_trait]
impl Conduit for VirtualChannel {
    async fn send(&mut self, payload: Bytes) -> Result<(), ConduitError> {
        if self.finished {
            return Err(ConduitError::Closed);
        }
        self.send_message(Message::Data(payload)).await
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, ConduitError> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(ChannelEvent::Data(data)) => Ok(Some(data)),
            Some(ChannelEvent::Closed) => {
                self.finished = true;
                Ok(None)
            }
            Some(ChannelEvent::Overrun) => {
                self.finished = true;
                Err(ConduitError::Overrun)
            }
            Some(ChannelEvent::Lost) | None => {
                self.finished = true;
                Err(ConduitError::TunnelLost)
            }
        }
    }

    async fn close(&mut self) {
        if self.finished {
            return;
        }
        self.detach();
        if let Ok(tunnel) = self.tunnel() {
            let _ = tunnel
                .out_tx
                .send(Frame::new(self.id, Message::ChannelClose))
                .await;
        }
    }

    fn describe(&self) -> String {
        format!("{} via {}", self.id, self.label)
    }
}

impl Drop for VirtualChannel {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.detach();
        if let Ok(tunnel) = self.tunnel() {
            let _ = tunnel
                .out_tx
                .try_send(Frame::new(self.id, Message::ChannelClose));
        }
    }
}

impl std::fmt::Debug for VirtualChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualChannel")
            .field("id", &self.id)
            .field("tunnel", &self.label)
            .field("finished", &self.finished)
            .finish()
    }
}

/// A channel the far end asked to open, awaiting accept or reject
#[derive(Debug)]
pub struct IncomingChannel {
    target: String,
    channel: VirtualChannel,
}

impl IncomingChannel {
    pub(crate) fn new(target: String, channel: VirtualChannel) -> Self {
        Self { target, channel }
    }

    /// Host name or address the opener wants to reach
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn id(&self) -> ChannelId {
        self.channel.id
    }

    pub async fn accept(self) -> Result<VirtualChannel, ConduitError> {
        self.channel.send_message(Message::ChannelAccept).await?;
        Ok(self.channel)
    }

    pub async fn reject(mut self, code: ErrorCode, reason: impl Into<String>) {
        let message = Message::ChannelReject {
            code,
            reason: reason.into(),
        };
        let _ = self.channel.send_message(message).await;
        self.channel.detach();
    }
}
