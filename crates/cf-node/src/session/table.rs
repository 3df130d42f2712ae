//! Session table: create-or-join by id

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::info;

use cf_core::services::Permit;
use cf_core::time::current_time_millis;
use cf_core::traits::AuditEvent;
use cf_core::types::is_valid_name;
use cf_core::{SessionError, SessionId};
use cf_protocol::StartRequest;

use super::interactive::{Attachment, InteractiveSession, SessionSettings, SpawnedProcess};
use crate::pty::SpawnRequest;
use crate::state::NodeState;

/// Result of a successful start or join
pub struct Admission {
    pub session: Arc<InteractiveSession>,
    pub attachment: Attachment,
    /// Whether the participant joined an existing session
    pub joined: bool,
}

enum Slot {
    /// The creator is still spawning the process
    Starting(watch::Receiver<()>),
    Live(Arc<InteractiveSession>),
}

enum Step {
    Join(Arc<InteractiveSession>),
    Wait(watch::Receiver<()>),
    Create(Permit, watch::Sender<()>),
}

/// A session id claimed by its creator. Dropping it without `commit`
/// frees the id; either way waiters wake once it is gone.
struct Reservation<'a> {
    sessions: &'a DashMap<SessionId, Slot>,
    id: SessionId,
    _done: watch::Sender<()>,
}

impl Reservation<'_> {
    fn commit(self, session: Arc<InteractiveSession>) {
        self.sessions.insert(self.id.clone(), Slot::Live(session));
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.sessions
            .remove_if(&self.id, |_, slot| matches!(slot, Slot::Starting(_)));
    }
}

/// Live sessions plus tombstones of closed ones
pub struct SessionTable {
    state: Arc<NodeState>,
    settings: SessionSettings,
    sessions: DashMap<SessionId, Slot>,
    /// Closed session ids and when they closed; their ids are never reused
    tombstones: DashMap<SessionId, u64>,
}

impl SessionTable {
    pub fn new(state: Arc<NodeState>, settings: SessionSettings) -> Arc<Self> {
        Arc::new(Self {
            state,
            settings,
            sessions: DashMap::new(),
            tombstones: DashMap::new(),
        })
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    /// Attach `user` to the requested session, creating it when absent.
    ///
    /// Creation and joining are decided atomically per id: concurrent
    /// requests for the same new id yield one creator and joiners.
    pub async fn start_or_join(
        self: &Arc<Self>,
        request: &StartRequest,
        user: &str,
    ) -> Result<Admission, SessionError> {
        let id = match &request.session_id {
            Some(id) if is_valid_name(id) => SessionId::new(id.clone()),
            Some(id) => {
                return Err(SessionError::UnexpectedMessage(format!(
                    "invalid session id {:?}",
                    id
                )))
            }
            None => SessionId::generate(),
        };

        let outcome = self.admit(&id, request, user).await;

        match &outcome {
            Ok(admission) if admission.joined => {
                self.state
                    .audit(AuditEvent::SessionJoin {
                        host: self.state.host.clone(),
                        session_id: id.to_string(),
                        user: user.to_string(),
                        party_id: admission.attachment.party_id.to_string(),
                    })
                    .await;
            }
            Ok(admission) => {
                self.watch(admission.session.clone());
                self.state
                    .audit(AuditEvent::SessionStart {
                        host: self.state.host.clone(),
                        session_id: id.to_string(),
                        user: user.to_string(),
                        login: request.login.clone(),
                    })
                    .await;
            }
            Err(SessionError::SpawnFailed(reason)) => {
                self.state
                    .audit(AuditEvent::SessionSpawnFailed {
                        host: self.state.host.clone(),
                        session_id: id.to_string(),
                        reason: reason.clone(),
                    })
                    .await;
            }
            Err(_) => {}
        }
        outcome
    }

    async fn admit(
        &self,
        id: &SessionId,
        request: &StartRequest,
        user: &str,
    ) -> Result<Admission, SessionError> {
        loop {
            if self.tombstones.contains_key(id) {
                return Err(SessionError::SessionClosed(id.to_string()));
            }

            let step = match self.sessions.entry(id.clone()) {
                Entry::Occupied(entry) => match entry.get() {
                    Slot::Live(session) => Step::Join(session.clone()),
                    Slot::Starting(started) => Step::Wait(started.clone()),
                },
                Entry::Vacant(entry) => {
                    // Retirement tombstones before removing, so a racing close shows here
                    if self.tombstones.contains_key(id) {
                        return Err(SessionError::SessionClosed(id.to_string()));
                    }
                    if request.join_only {
                        return Err(SessionError::SessionNotFound(id.to_string()));
                    }
                    let permit = Permit::acquire(&self.state.services.limiter, user)
                        .ok_or(SessionError::LimitExceeded)?;
                    let (done, started) = watch::channel(());
                    entry.insert(Slot::Starting(started));
                    Step::Create(permit, done)
                }
            };

            match step {
                Step::Join(session) => {
                    if session.login() != request.login {
                        return Err(SessionError::AccessDenied);
                    }
                    let attachment = session.attach(user)?;
                    return Ok(Admission {
                        session,
                        attachment,
                        joined: true,
                    });
                }
                Step::Wait(mut started) => {
                    // Resolves once the creator commits or gives up
                    let _ = started.changed().await;
                }
                Step::Create(permit, done) => {
                    let reservation = Reservation {
                        sessions: &self.sessions,
                        id: id.clone(),
                        _done: done,
                    };
                    return self.create(reservation, request, user, permit).await;
                }
            }
        }
    }

    /// Spawn outside the map lock; only the reserved slot is visible meanwhile
    async fn create(
        &self,
        reservation: Reservation<'_>,
        request: &StartRequest,
        user: &str,
        permit: Permit,
    ) -> Result<Admission, SessionError> {
        let spawned = SpawnedProcess::spawn(SpawnRequest {
            shell: self.settings.shell.clone(),
            command: request.command.clone(),
            login: request.login.clone(),
            size: request.size,
            env: Vec::new(),
        })
        .await?;
        let (session, attachment) = InteractiveSession::start(
            reservation.id.clone(),
            spawned,
            &self.settings,
            self.state.clone(),
            permit,
            user,
        )?;
        reservation.commit(session.clone());
        Ok(Admission {
            session,
            attachment,
            joined: false,
        })
    }

    /// Retire the session once it closes
    fn watch(self: &Arc<Self>, session: Arc<InteractiveSession>) {
        let table = Arc::downgrade(self);
        tokio::spawn(async move {
            session.closed().await;
            if let Some(table) = table.upgrade() {
                table.retire(session.id());
            }
        });
    }

    fn retire(&self, id: &SessionId) {
        self.tombstones.insert(id.clone(), current_time_millis());
        self.sessions.remove(id);
        info!(session = %id, "Session retired");
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<InteractiveSession>> {
        match self.sessions.get(id)?.value() {
            Slot::Live(session) => Some(session.clone()),
            Slot::Starting(_) => None,
        }
    }

    /// Running sessions; ones still spawning are left out
    pub fn list(&self) -> Vec<Arc<InteractiveSession>> {
        self.sessions
            .iter()
            .filter_map(|e| match e.value() {
                Slot::Live(session) => Some(session.clone()),
                Slot::Starting(_) => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_tombstoned(&self, id: &SessionId) -> bool {
        self.tombstones.contains_key(id)
    }

    /// Forget tombstones older than `max_age`
    pub fn prune_tombstones(&self, max_age: Duration) -> usize {
        let cutoff = current_time_millis().saturating_sub(max_age.as_millis() as u64);
        let before = self.tombstones.len();
        self.tombstones.retain(|_, closed_at| *closed_at > cutoff);
        before - self.tombstones.len()
    }

    /// Stop every session, for shutdown
    pub fn terminate_all(&self) {
        for session in self.list() {
            session.terminate();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::SessionOutput;
    use crate::state::NodeServices;
    use async_trait::async_trait;
    use bytes::Bytes;
    use cf_core::config::InputPolicy;
    use cf_core::services::{MemoryEventLog, MemoryRecorder, Unlimited};
    use cf_core::traits::PresenceSink;
    use cf_core::TunnelError;
    use cf_protocol::{PresenceUpdate, TerminalSize};
    use tokio::sync::{broadcast, Mutex};

    #[derive(Default)]
    struct CollectPresence(Mutex<Vec<PresenceUpdate>>);

    #[async_trait]
    impl PresenceSink for CollectPresence {
        async fn publish(&self, update: PresenceUpdate) -> Result<(), TunnelError> {
            self.0.lock().await.push(update);
            Ok(())
        }
    }

    struct Fixture {
        table: Arc<SessionTable>,
        events: Arc<MemoryEventLog>,
        recorder: Arc<MemoryRecorder>,
    }

    fn fixture(policy: InputPolicy) -> Fixture {
        fixture_with_shell(policy, "/bin/sh")
    }

    fn fixture_with_shell(policy: InputPolicy, shell: &str) -> Fixture {
        let events = Arc::new(MemoryEventLog::new());
        let recorder = Arc::new(MemoryRecorder::new());
        let state = Arc::new(NodeState::new(
            "example.com",
            "server4",
            "127.0.0.1:3022",
            NodeServices {
                events: events.clone(),
                recorder: recorder.clone(),
                presence: Arc::new(CollectPresence::default()),
                limiter: Arc::new(Unlimited),
            },
        ));
        let table = SessionTable::new(
            state,
            SessionSettings {
                shell: shell.into(),
                input_policy: policy,
                output_buffer: 256,
            },
        );
        Fixture {
            table,
            events,
            recorder,
        }
    }

    fn request(session_id: Option<&str>, command: Option<&str>) -> StartRequest {
        StartRequest {
            login: "tester".into(),
            session_id: session_id.map(str::to_string),
            join_only: false,
            command: command.map(str::to_string),
            size: TerminalSize::default(),
            certificate: vec![],
            signature: vec![],
        }
    }

    async fn collect_until_exit(attachment: &mut Attachment) -> (String, Option<i32>) {
        let mut output = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(10), attachment.output.recv()).await {
                Ok(Ok(SessionOutput::Data(data))) => output.extend_from_slice(&data),
                Ok(Ok(SessionOutput::Exited(code))) => {
                    return (String::from_utf8_lossy(&output).into_owned(), code)
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                other => panic!("unexpected output event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_command_session_runs_and_is_recorded() {
        let fx = fixture(InputPolicy::Shared);
        let mut admission = fx
            .table
            .start_or_join(&request(Some("s1"), Some("echo recorded-output")), "alice")
            .await
            .unwrap();
        assert!(!admission.joined);

        let (output, code) = collect_until_exit(&mut admission.attachment).await;
        assert!(output.contains("recorded-output"));
        assert_eq!(code, Some(0));

        admission.session.closed().await;
        let id = SessionId::new("s1");
        assert!(fx.recorder.is_finalized(&id));
        let recording = fx.recorder.recording(&id).unwrap();
        assert!(String::from_utf8_lossy(&recording).contains("recorded-output"));

        // Retirement runs on its own task
        for _ in 0..50 {
            if fx.table.is_tombstoned(&id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let again = fx.table.start_or_join(&request(Some("s1"), None), "alice").await;
        assert!(matches!(again, Err(SessionError::SessionClosed(_))));

        let events = fx.events.events().await;
        assert!(events.iter().any(|e| matches!(e, AuditEvent::SessionStart { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, AuditEvent::SessionEnd { exit_code: Some(0), .. })));
    }

    #[tokio::test]
    async fn test_second_participant_joins_and_sees_output() {
        let fx = fixture(InputPolicy::Shared);
        let mut first = fx
            .table
            .start_or_join(&request(Some("shared"), None), "alice")
            .await
            .unwrap();
        let mut second = fx
            .table
            .start_or_join(&request(Some("shared"), None), "bob")
            .await
            .unwrap();
        assert!(second.joined);
        assert_eq!(first.session.party_count(), 2);

        second
            .session
            .input(&second.attachment.party_id, Bytes::from_static(b"echo from-bob; exit 3\n"))
            .await;

        let (seen_by_alice, code) = collect_until_exit(&mut first.attachment).await;
        assert!(seen_by_alice.contains("from-bob"));
        assert_eq!(code, Some(3));
        let (seen_by_bob, _) = collect_until_exit(&mut second.attachment).await;
        assert!(seen_by_bob.contains("from-bob"));
    }

    #[tokio::test]
    async fn test_owner_policy_ignores_other_input() {
        let fx = fixture(InputPolicy::Owner);
        let mut owner = fx
            .table
            .start_or_join(&request(Some("owned"), None), "alice")
            .await
            .unwrap();
        let guest = fx
            .table
            .start_or_join(&request(Some("owned"), None), "bob")
            .await
            .unwrap();

        guest
            .session
            .input(&guest.attachment.party_id, Bytes::from_static(b"exit 7\n"))
            .await;
        owner
            .session
            .input(&owner.attachment.party_id, Bytes::from_static(b"exit 5\n"))
            .await;

        let (_, code) = collect_until_exit(&mut owner.attachment).await;
        assert_eq!(code, Some(5));
    }

    #[tokio::test]
    async fn test_concurrent_starts_share_one_session() {
        let fx = fixture(InputPolicy::Shared);
        let first_request = request(Some("race"), None);
        let second_request = request(Some("race"), None);
        let (first, second) = tokio::join!(
            fx.table.start_or_join(&first_request, "alice"),
            fx.table.start_or_join(&second_request, "bob"),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_ne!(first.joined, second.joined);
        assert!(Arc::ptr_eq(&first.session, &second.session));
        assert_eq!(first.session.party_count(), 2);
        assert_eq!(fx.table.len(), 1);
        first.session.terminate();
    }

    #[tokio::test]
    async fn test_failed_spawn_frees_the_id() {
        let fx = fixture_with_shell(InputPolicy::Shared, "/nonexistent/cf-shell");

        for _ in 0..2 {
            let result = fx
                .table
                .start_or_join(&request(Some("broken"), None), "alice")
                .await;
            assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
            assert!(fx.table.is_empty());
            assert!(fx.table.get(&SessionId::new("broken")).is_none());
        }

        // A join-only request sees no half-created session
        let mut join = request(Some("broken"), None);
        join.join_only = true;
        let result = fx.table.start_or_join(&join, "bob").await;
        assert!(matches!(result, Err(SessionError::SessionNotFound(_))));

        let failures = fx
            .events
            .events()
            .await
            .iter()
            .filter(|e| matches!(e, AuditEvent::SessionSpawnFailed { .. }))
            .count();
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn test_join_only_missing_session() {
        let fx = fixture(InputPolicy::Shared);
        let mut req = request(Some("absent"), None);
        req.join_only = true;
        let result = fx.table.start_or_join(&req, "alice").await;
        assert!(matches!(result, Err(SessionError::SessionNotFound(_))));
        assert!(fx.table.is_empty());
    }

    #[tokio::test]
    async fn test_join_with_other_login_denied() {
        let fx = fixture(InputPolicy::Shared);
        let first = fx
            .table
            .start_or_join(&request(Some("s2"), None), "alice")
            .await
            .unwrap();
        let mut other = request(Some("s2"), None);
        other.login = "root".into();
        let result = fx.table.start_or_join(&other, "mallory").await;
        assert!(matches!(result, Err(SessionError::AccessDenied)));
        first.session.terminate();
    }

    #[tokio::test]
    async fn test_last_leave_closes_session() {
        let fx = fixture(InputPolicy::Shared);
        let admission = fx
            .table
            .start_or_join(&request(Some("lonely"), None), "alice")
            .await
            .unwrap();

        admission.session.leave(&admission.attachment.party_id).await;
        tokio::time::timeout(Duration::from_secs(5), admission.session.closed())
            .await
            .unwrap();
        assert!(fx
            .events
            .events()
            .await
            .iter()
            .any(|e| matches!(e, AuditEvent::SessionLeave { .. })));
    }

    #[tokio::test]
    async fn test_invalid_session_id() {
        let fx = fixture(InputPolicy::Shared);
        let result = fx
            .table
            .start_or_join(&request(Some("../../etc"), None), "alice")
            .await;
        assert!(matches!(result, Err(SessionError::UnexpectedMessage(_))));
    }
}
