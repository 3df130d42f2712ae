//! One interactive session: a PTY process shared by its participants
//!
//! A pump task owns the output side. It records every chunk before fanning it
//! out, and it is the only place a session is finalized, so the recording is
//! complete and `finalize` runs exactly once.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cf_core::config::InputPolicy;
use cf_core::services::Permit;
use cf_core::time::current_time_millis;
use cf_core::traits::AuditEvent;
use cf_core::{PartyId, SessionError, SessionId};
use cf_protocol::{PartySnapshot, PresenceUpdate, SessionHeartbeat, SessionPhase, TerminalSize};

use crate::pty::{PtyProcess, SpawnRequest};
use crate::state::NodeState;

const READ_CHUNK: usize = 4096;
const CHUNK_QUEUE: usize = 64;
const INPUT_QUEUE: usize = 64;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// How long to keep reading after the process exits
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const REAP_ATTEMPTS: usize = 50;
const REAP_INTERVAL: Duration = Duration::from_millis(20);

/// What participants receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    Data(Bytes),
    Exited(Option<i32>),
}

/// Per-node session settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Validated shell path
    pub shell: String,
    pub input_policy: InputPolicy,
    /// Output chunks buffered per participant
    pub output_buffer: usize,
}

/// A participant's handle on a session
pub struct Attachment {
    pub party_id: PartyId,
    pub output: broadcast::Receiver<SessionOutput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    /// Everyone left; the process is being stopped
    Closing,
    Closed,
}

struct Party {
    id: PartyId,
    user: String,
    joined_at: u64,
}

struct Inner {
    phase: Phase,
    /// In join order
    parties: Vec<Party>,
}

pub struct InteractiveSession {
    id: SessionId,
    login: String,
    created_at: u64,
    policy: InputPolicy,
    state: Arc<NodeState>,
    inner: Mutex<Inner>,
    process: Mutex<PtyProcess>,
    input_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    output: broadcast::Sender<SessionOutput>,
    permit: Mutex<Option<Permit>>,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A running process not yet wired to a session
pub(crate) struct SpawnedProcess {
    login: String,
    process: PtyProcess,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

impl SpawnedProcess {
    /// Opening the PTY and forking block, so it runs on the blocking pool
    pub(crate) async fn spawn(request: SpawnRequest) -> Result<Self, SessionError> {
        let login = request.login.clone();
        let (process, reader, writer) = tokio::task::spawn_blocking(move || PtyProcess::spawn(&request))
            .await
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?
            .map_err(|e| SessionError::SpawnFailed(format!("{:#}", e)))?;
        Ok(Self {
            login,
            process,
            reader,
            writer,
        })
    }
}

impl InteractiveSession {
    /// Wrap a spawned process with `creator` attached, then start the I/O tasks
    pub(crate) fn start(
        id: SessionId,
        spawned: SpawnedProcess,
        settings: &SessionSettings,
        state: Arc<NodeState>,
        permit: Permit,
        creator: &str,
    ) -> Result<(Arc<Self>, Attachment), SessionError> {
        let SpawnedProcess {
            login,
            process,
            reader,
            writer,
        } = spawned;

        let (output, _) = broadcast::channel(settings.output_buffer.max(1));
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE);

        info!(session = %id, %login, pid = ?process.pid(), "Session started");

        let session = Arc::new(Self {
            id: id.clone(),
            login,
            created_at: current_time_millis(),
            policy: settings.input_policy,
            state,
            inner: Mutex::new(Inner {
                phase: Phase::Running,
                parties: Vec::new(),
            }),
            process: Mutex::new(process),
            input_tx: Mutex::new(Some(input_tx)),
            output,
            permit: Mutex::new(Some(permit)),
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
        });

        // Attach before any output can be produced
        let attachment = session.attach(creator)?;
        spawn_reader(id.clone(), reader, chunk_tx);
        spawn_writer(id, writer, input_rx);
        tokio::spawn(session.clone().pump(chunk_rx));
        Ok((session, attachment))
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn party_count(&self) -> usize {
        lock(&self.inner).parties.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session is finalized
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Add a participant. Fails once the session is closing.
    pub fn attach(&self, user: &str) -> Result<Attachment, SessionError> {
        let (attachment, heartbeat) = {
            let mut inner = lock(&self.inner);
            if inner.phase != Phase::Running {
                return Err(SessionError::SessionClosed(self.id.to_string()));
            }
            let party_id = PartyId::generate();
            inner.parties.push(Party {
                id: party_id.clone(),
                user: user.to_string(),
                joined_at: current_time_millis(),
            });
            // Subscribe under the lock so no output falls between join and close
            let attachment = Attachment {
                party_id,
                output: self.output.subscribe(),
            };
            (attachment, self.snapshot(&inner))
        };
        debug!(session = %self.id, party = %attachment.party_id, %user, "Participant attached");
        self.state.publish(PresenceUpdate::Session(heartbeat));
        Ok(attachment)
    }

    /// Forward keystrokes, subject to the input policy
    pub async fn input(&self, party: &PartyId, data: Bytes) {
        if self.policy == InputPolicy::Owner {
            let inner = lock(&self.inner);
            if inner.parties.first().map(|p| &p.id) != Some(party) {
                return;
            }
        }
        let tx = lock(&self.input_tx).clone();
        if let Some(tx) = tx {
            let _ = tx.send(data).await;
        }
    }

    pub fn resize(&self, size: TerminalSize) {
        if let Err(e) = lock(&self.process).resize(size) {
            warn!(session = %self.id, error = %e, "Resize failed");
        }
    }

    /// Detach a participant. The last one out stops the process.
    pub async fn leave(&self, party: &PartyId) {
        let (heartbeat, last) = {
            let mut inner = lock(&self.inner);
            let before = inner.parties.len();
            inner.parties.retain(|p| &p.id != party);
            if inner.parties.len() == before {
                return;
            }
            let last = inner.parties.is_empty() && inner.phase == Phase::Running;
            if last {
                inner.phase = Phase::Closing;
            }
            (self.snapshot(&inner), last)
        };

        debug!(session = %self.id, %party, "Participant left");
        self.state.publish(PresenceUpdate::Session(heartbeat));
        self.state
            .audit(AuditEvent::SessionLeave {
                host: self.state.host.clone(),
                session_id: self.id.to_string(),
                party_id: party.to_string(),
            })
            .await;
        if last {
            self.shutdown.cancel();
        }
    }

    /// Stop the process regardless of participants
    pub fn terminate(&self) {
        {
            let mut inner = lock(&self.inner);
            if inner.phase == Phase::Running {
                inner.phase = Phase::Closing;
            }
        }
        self.shutdown.cancel();
    }

    /// Full snapshot for presence
    pub fn heartbeat(&self) -> SessionHeartbeat {
        self.snapshot(&lock(&self.inner))
    }

    fn snapshot(&self, inner: &Inner) -> SessionHeartbeat {
        SessionHeartbeat {
            domain: self.state.domain.clone(),
            host: self.state.host.clone(),
            session_id: self.id.to_string(),
            phase: if inner.phase == Phase::Closed {
                SessionPhase::Closed
            } else {
                SessionPhase::Open
            },
            parties: inner
                .parties
                .iter()
                .map(|p| PartySnapshot {
                    party_id: p.id.to_string(),
                    user: p.user.clone(),
                    login: self.login.clone(),
                    joined_at: p.joined_at,
                })
                .collect(),
            created_at: self.created_at,
            sent_at: current_time_millis(),
            seq: self.state.next_seq(),
        }
    }

    async fn pump(self: Arc<Self>, mut chunks: mpsc::Receiver<Bytes>) {
        let mut exit_poll = tokio::time::interval(EXIT_POLL_INTERVAL);
        exit_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit_code = loop {
            tokio::select! {
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => self.deliver(chunk).await,
                    None => break self.reap().await,
                },
                _ = exit_poll.tick() => {
                    let exited = lock(&self.process).try_wait();
                    if let Some(code) = exited {
                        self.drain(&mut chunks).await;
                        break Some(code);
                    }
                }
                _ = self.shutdown.cancelled() => {
                    lock(&self.process).kill();
                    self.drain(&mut chunks).await;
                    break None;
                }
            }
        };

        self.finish(exit_code).await;
    }

    async fn deliver(&self, chunk: Bytes) {
        if let Err(e) = self.state.services.recorder.write(&self.id, &chunk).await {
            warn!(session = %self.id, error = %e, "Recording write failed");
        }
        // No receivers is fine
        let _ = self.output.send(SessionOutput::Data(chunk));
    }

    /// Deliver what the reader still produces, for a bounded time
    async fn drain(&self, chunks: &mut mpsc::Receiver<Bytes>) {
        let deadline = tokio::time::sleep(DRAIN_GRACE);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => self.deliver(chunk).await,
                    None => return,
                },
                _ = &mut deadline => return,
            }
        }
    }

    /// The reader hit end-of-file; collect the exit code
    async fn reap(&self) -> Option<i32> {
        for _ in 0..REAP_ATTEMPTS {
            let exited = lock(&self.process).try_wait();
            if exited.is_some() {
                return exited;
            }
            tokio::time::sleep(REAP_INTERVAL).await;
        }
        lock(&self.process).kill();
        None
    }

    async fn finish(&self, exit_code: Option<i32>) {
        let heartbeat = {
            let mut inner = lock(&self.inner);
            inner.phase = Phase::Closed;
            self.snapshot(&inner)
        };
        lock(&self.input_tx).take();

        if let Err(e) = self.state.services.recorder.finalize(&self.id).await {
            warn!(session = %self.id, error = %e, "Recording finalize failed");
        }
        let _ = self.output.send(SessionOutput::Exited(exit_code));

        info!(session = %self.id, ?exit_code, "Session closed");
        self.state
            .audit(AuditEvent::SessionEnd {
                host: self.state.host.clone(),
                session_id: self.id.to_string(),
                exit_code,
            })
            .await;
        self.state.publish(PresenceUpdate::Session(heartbeat));

        lock(&self.permit).take();
        self.closed.cancel();
    }
}

impl std::fmt::Debug for InteractiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractiveSession")
            .field("id", &self.id)
            .field("login", &self.login)
            .finish()
    }
}

fn spawn_reader(id: SessionId, mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Bytes>) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                // EIO once the process side is gone
                Err(e) => {
                    debug!(session = %id, error = %e, "PTY reader stopped");
                    break;
                }
            }
        }
        debug!(session = %id, "PTY reader exiting");
    });
}

fn spawn_writer(id: SessionId, mut writer: Box<dyn Write + Send>, mut rx: mpsc::Receiver<Bytes>) {
    tokio::task::spawn_blocking(move || {
        while let Some(data) = rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                debug!(session = %id, error = %e, "PTY writer stopped");
                break;
            }
        }
    });
}
