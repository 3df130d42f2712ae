//! Tunnel side of the multiplexer

use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cf_protocol::{ChannelId, ErrorCode, Frame, FrameCodec, Message};

use super::channel::{ChannelEvent, IncomingChannel, VirtualChannel};
use crate::error::TunnelError;

const OUTBOUND_QUEUE: usize = 256;
const CONTROL_QUEUE: usize = 64;
const INCOMING_QUEUE: usize = 64;

/// Which end of the tunnel this is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxRole {
    /// Central side; opens channels
    Dialer,
    /// Site side; accepts channels
    Acceptor,
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// How long `open_channel` waits for the far end's answer
    pub open_timeout: Duration,
    /// Undelivered payloads buffered per channel
    pub channel_buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(2),
            channel_buffer: 256,
        }
    }
}

type AckSender = oneshot::Sender<Result<(), TunnelError>>;

pub(crate) struct MuxShared {
    pub(crate) label: String,
    role: MuxRole,
    pub(crate) out_tx: mpsc::Sender<Frame>,
    pub(crate) channels: DashMap<ChannelId, mpsc::Sender<ChannelEvent>>,
    pending: DashMap<ChannelId, AckSender>,
    next_id: AtomicU32,
    shutdown: CancellationToken,
    channel_buffer: usize,
}

impl MuxShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn allocate_id(&self) -> ChannelId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != ChannelId::CONTROL.as_u32() {
                return ChannelId::new(id);
            }
        }
    }

    /// Close every channel id the tunnel owns and fail pending opens. Idempotent.
    fn teardown(&self) {
        self.shutdown.cancel();

        let ids: Vec<ChannelId> = self.channels.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.channels.remove(&id) {
                // A full queue still ends in Lost once the sender is dropped
                let _ = tx.try_send(ChannelEvent::Lost);
            }
        }

        let pending: Vec<ChannelId> = self.pending.iter().map(|e| *e.key()).collect();
        for id in pending {
            if let Some((_, ack)) = self.pending.remove(&id) {
                let _ = ack.send(Err(TunnelError::TunnelLost));
            }
        }
    }

    async fn send_frame(&self, channel_id: ChannelId, message: Message) {
        if self.out_tx.send(Frame::new(channel_id, message)).await.is_err() {
            debug!(tunnel = %self.label, %channel_id, "Outbound queue closed");
        }
    }
}

/// Control traffic and channel requests arriving from the far end
pub struct MuxEvents {
    /// Messages on the control channel
    pub control: mpsc::Receiver<Message>,
    /// Channels the far end wants opened (acceptor side only)
    pub incoming: mpsc::Receiver<IncomingChannel>,
}

/// Handle to a running multiplexed tunnel
#[derive(Clone)]
pub struct Mux {
    shared: Arc<MuxShared>,
    open_timeout: Duration,
}

impl Mux {
    /// Start multiplexing over `io`. Reader and writer tasks run until the
    /// connection fails or `close` is called.
    pub fn spawn<S>(
        io: S,
        role: MuxRole,
        config: MuxConfig,
        label: impl Into<String>,
    ) -> (Self, MuxEvents)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);

        let shared = Arc::new(MuxShared {
            label: label.into(),
            role,
            out_tx,
            channels: DashMap::new(),
            pending: DashMap::new(),
            next_id: AtomicU32::new(1),
            shutdown: CancellationToken::new(),
            channel_buffer: config.channel_buffer.max(1),
        });

        let (sink, stream) = Framed::new(io, FrameCodec::new()).split();
        tokio::spawn(write_loop(shared.clone(), sink, out_rx));

        let mux = Self {
            shared,
            open_timeout: config.open_timeout,
        };
        tokio::spawn(read_loop(mux.clone(), stream, control_tx, incoming_tx));

        (
            mux,
            MuxEvents {
                control: control_rx,
                incoming: incoming_rx,
            },
        )
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves once the tunnel is torn down
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }

    /// Number of channels currently open
    pub fn channel_count(&self) -> usize {
        self.shared.channels.len()
    }

    /// Tear the tunnel down; every open channel observes `TunnelLost`
    pub fn close(&self) {
        self.shared.teardown();
    }

    /// Send a message on the control channel
    pub async fn send_control(&self, message: Message) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::TunnelLost);
        }
        self.shared
            .out_tx
            .send(Frame::control(message))
            .await
            .map_err(|_| TunnelError::TunnelLost)
    }

    /// Ask the far end for a new channel towards `target`
    pub async fn open_channel(&self, target: &str) -> Result<VirtualChannel, TunnelError> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(TunnelError::TunnelLost);
        }

        let id = shared.allocate_id();
        let (tx, rx) = mpsc::channel(shared.channel_buffer);
        let (ack_tx, ack_rx) = oneshot::channel();
        shared.channels.insert(id, tx);
        shared.pending.insert(id, ack_tx);

        // Teardown may have run between the check above and the inserts
        if shared.is_closed() {
            shared.channels.remove(&id);
            shared.pending.remove(&id);
            return Err(TunnelError::TunnelLost);
        }

        let channel = VirtualChannel::new(id, shared, rx);
        let open = Message::ChannelOpen {
            target: target.to_string(),
        };
        if shared.out_tx.send(Frame::new(id, open)).await.is_err() {
            shared.pending.remove(&id);
            return Err(TunnelError::TunnelLost);
        }

        match tokio::time::timeout(self.open_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(tunnel = %shared.label, channel_id = %id, dest = target, "Channel open");
                Ok(channel)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(TunnelError::TunnelLost),
            Err(_) => {
                shared.pending.remove(&id);
                warn!(tunnel = %shared.label, channel_id = %id, dest = target, "Channel open timed out");
                // Dropping `channel` tells the far end to forget it
                Err(TunnelError::TunnelTimeout)
            }
        }
    }

    async fn dispatch(
        &self,
        frame: Frame,
        control_tx: &mpsc::Sender<Message>,
        incoming_tx: &mpsc::Sender<IncomingChannel>,
    ) {
        let shared = &self.shared;
        let id = frame.channel_id;

        if id.is_control() {
            if control_tx.send(frame.message).await.is_err() {
                debug!(tunnel = %shared.label, "Control message dropped, no listener");
            }
            return;
        }

        match frame.message {
            Message::ChannelOpen { target } => self.on_open(id, target, incoming_tx).await,
            Message::ChannelAccept => {
                if let Some((_, ack)) = shared.pending.remove(&id) {
                    let _ = ack.send(Ok(()));
                }
            }
            Message::ChannelReject { code, reason } => {
                shared.channels.remove(&id);
                if let Some((_, ack)) = shared.pending.remove(&id) {
                    let _ = ack.send(Err(TunnelError::ChannelRejected { code, reason }));
                }
            }
            Message::Data(data) => {
                let tx = shared.channels.get(&id).map(|e| e.value().clone());
                match tx {
                    Some(tx) => match tx.try_send(ChannelEvent::Data(data)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => self.overrun(id, tx),
                        Err(TrySendError::Closed(_)) => {
                            shared.channels.remove(&id);
                        }
                    },
                    None => debug!(tunnel = %shared.label, channel_id = %id, "Data for unknown channel"),
                }
            }
            Message::ChannelClose => {
                if let Some((_, ack)) = shared.pending.remove(&id) {
                    let _ = ack.send(Err(TunnelError::ChannelRejected {
                        code: ErrorCode::Unknown,
                        reason: "closed before accept".to_string(),
                    }));
                }
                if let Some((_, tx)) = shared.channels.remove(&id) {
                    deliver(tx, ChannelEvent::Closed);
                }
            }
            other => {
                warn!(
                    tunnel = %shared.label,
                    channel_id = %id,
                    "Unexpected {:?} on a data channel",
                    other.message_type()
                );
            }
        }
    }

    /// Reset a channel whose consumer stopped draining. Only that channel
    /// is affected; the read loop never waits on a channel queue.
    fn overrun(&self, id: ChannelId, tx: mpsc::Sender<ChannelEvent>) {
        let shared = &self.shared;
        if shared.channels.remove(&id).is_none() {
            return;
        }
        warn!(
            tunnel = %shared.label,
            channel_id = %id,
            buffer = shared.channel_buffer,
            "Channel reader fell behind, resetting channel"
        );
        deliver(tx, ChannelEvent::Overrun);

        let out_tx = shared.out_tx.clone();
        tokio::spawn(async move {
            let _ = out_tx.send(Frame::new(id, Message::ChannelClose)).await;
        });
    }

    async fn on_open(
        &self,
        id: ChannelId,
        target: String,
        incoming_tx: &mpsc::Sender<IncomingChannel>,
    ) {
        let shared = &self.shared;
        let reject = |reason: &str| Message::ChannelReject {
            code: ErrorCode::InvalidMessage,
            reason: reason.to_string(),
        };

        if shared.role != MuxRole::Acceptor {
            shared
                .send_frame(id, reject("channels are opened by the central side"))
                .await;
            return;
        }
        if shared.channels.contains_key(&id) {
            shared.send_frame(id, reject("channel id in use")).await;
            return;
        }

        let (tx, rx) = mpsc::channel(shared.channel_buffer);
        shared.channels.insert(id, tx);
        let incoming = IncomingChannel::new(target, VirtualChannel::new(id, shared, rx));

        if let Err(mpsc::error::SendError(incoming)) = incoming_tx.send(incoming).await {
            incoming
                .reject(ErrorCode::TargetUnreachable, "not accepting channels")
                .await;
        }
    }
}

/// Queue a final event behind whatever the consumer has not read yet
fn deliver(tx: mpsc::Sender<ChannelEvent>, event: ChannelEvent) {
    match tx.try_send(event) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(event)) => {
            tokio::spawn(async move {
                let _ = tx.send(event).await;
            });
        }
    }
}

async fn write_loop<S>(
    shared: Arc<MuxShared>,
    mut sink: SplitSink<Framed<S, FrameCodec>, Frame>,
    mut out_rx: mpsc::Receiver<Frame>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            frame = out_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        warn!(tunnel = %shared.label, "Tunnel write failed: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    shared.teardown();
    let _ = sink.close().await;
}

async fn read_loop<S>(
    mux: Mux,
    mut stream: SplitStream<Framed<S, FrameCodec>>,
    control_tx: mpsc::Sender<Message>,
    incoming_tx: mpsc::Sender<IncomingChannel>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = mux.shared.shutdown.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(frame)) => mux.dispatch(frame, &control_tx, &incoming_tx).await,
            Some(Err(e)) => {
                warn!(tunnel = %mux.shared.label, "Tunnel read failed: {}", e);
                break;
            }
            None => {
                debug!(tunnel = %mux.shared.label, "Peer closed the tunnel");
                break;
            }
        }
    }

    mux.shared.teardown();
}

impl std::fmt::Debug for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mux")
            .field("label", &self.shared.label)
            .field("role", &self.shared.role)
            .field("channels", &self.shared.channels.len())
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}
