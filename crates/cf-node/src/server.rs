//! Participant handshake and relay
//!
//! Every participant, whether it arrived over a tunnel channel or a direct
//! connection, goes through the same exchange: the node sends a fresh nonce,
//! the participant answers with its user certificate and a signature over the
//! nonce, and the node starts or joins the requested session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use cf_auth::keys::verify_signature;
use cf_auth::{CertChecker, Certificate, Identity, Role};
use cf_core::token::random_bytes;
use cf_core::traits::{BoxConduit, SessionConduit};
use cf_core::SessionError;
use cf_protocol::{SessionMessage, StartRequest};

use crate::session::{Admission, SessionOutput, SessionTable};
use crate::state::NodeState;

const NONCE_LEN: usize = 32;

/// Accepts participants for the sessions of one node
pub struct NodeServer {
    state: Arc<NodeState>,
    table: Arc<SessionTable>,
    checker: Arc<CertChecker>,
    /// Logins this node will run sessions under
    logins: Vec<String>,
    handshake_timeout: Duration,
}

impl NodeServer {
    pub fn new(
        state: Arc<NodeState>,
        table: Arc<SessionTable>,
        checker: Arc<CertChecker>,
        logins: Vec<String>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            state,
            table,
            checker,
            logins,
            handshake_timeout,
        }
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Drive one participant until it leaves, the session ends, or the
    /// conduit fails
    pub async fn serve(&self, mut conduit: BoxConduit) {
        let peer = conduit.describe();

        match self.admit(&mut conduit).await {
            Ok((identity, admission)) => {
                info!(
                    %peer,
                    user = %identity.subject,
                    session = %admission.session.id(),
                    joined = admission.joined,
                    "Participant admitted"
                );
                self.relay(conduit, admission).await;
            }
            Err(e) => {
                debug!(%peer, error = %e, "Participant refused");
                let reply = SessionMessage::Error {
                    code: e.code(),
                    message: e.to_string(),
                };
                let _ = conduit.send_session(&reply).await;
                conduit.close().await;
            }
        }
    }

    async fn admit(
        &self,
        conduit: &mut BoxConduit,
    ) -> Result<(Identity, Admission), SessionError> {
        let nonce = random_bytes(NONCE_LEN);
        conduit
            .send_session(&SessionMessage::Challenge {
                nonce: nonce.clone(),
            })
            .await?;

        let request = match tokio::time::timeout(self.handshake_timeout, conduit.recv_session())
            .await
        {
            Ok(Ok(Some(SessionMessage::Start(request)))) => request,
            Ok(Ok(Some(other))) => {
                return Err(SessionError::UnexpectedMessage(format!(
                    "expected start, got {:?}",
                    other
                )))
            }
            Ok(Ok(None)) => {
                return Err(SessionError::UnexpectedMessage(
                    "closed before start".to_string(),
                ))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!("Participant did not answer the challenge in time");
                return Err(SessionError::AccessDenied);
            }
        };

        let identity = self.authorize(&request, &nonce)?;
        let admission = self.table.start_or_join(&request, &identity.subject).await?;
        Ok((identity, admission))
    }

    /// Certificate, proof of possession, and login checks. Every failure
    /// reads the same to the participant.
    fn authorize(&self, request: &StartRequest, nonce: &[u8]) -> Result<Identity, SessionError> {
        let cert = Certificate::from_bytes(&request.certificate).map_err(|e| {
            debug!(error = %e, "Undecodable certificate");
            SessionError::AccessDenied
        })?;

        let identity = self
            .checker
            .verify(&cert, &[Role::User, Role::Admin])
            .map_err(|e| {
                debug!(subject = %cert.subject(), error = %e, "Certificate rejected");
                SessionError::AccessDenied
            })?;

        let payload =
            StartRequest::challenge_payload(nonce, &request.login, request.session_id.as_deref());
        if !verify_signature(&identity.public_key, &payload, &request.signature) {
            debug!(user = %identity.subject, "Challenge signature mismatch");
            return Err(SessionError::AccessDenied);
        }

        if !identity.allows_login(&request.login) || !self.logins.contains(&request.login) {
            debug!(user = %identity.subject, login = %request.login, "Login not permitted");
            return Err(SessionError::AccessDenied);
        }

        Ok(identity)
    }

    async fn relay(&self, mut conduit: BoxConduit, admission: Admission) {
        let Admission {
            session,
            mut attachment,
            joined,
        } = admission;
        let party = attachment.party_id.clone();

        let started = SessionMessage::Started {
            session_id: session.id().to_string(),
            joined,
        };

        if conduit.send_session(&started).await.is_ok() {
            loop {
                tokio::select! {
                    incoming = conduit.recv_session() => match incoming {
                        Ok(Some(SessionMessage::Input(data))) => session.input(&party, data).await,
                        Ok(Some(SessionMessage::Resize(size))) => session.resize(size),
                        Ok(Some(SessionMessage::Leave)) | Ok(None) => break,
                        Ok(Some(other)) => {
                            debug!(session = %session.id(), ?other, "Ignoring unexpected message");
                        }
                        Err(e) => {
                            debug!(session = %session.id(), %party, error = %e, "Participant conduit failed");
                            break;
                        }
                    },

                    output = attachment.output.recv() => match output {
                        Ok(SessionOutput::Data(data)) => {
                            if conduit.send_session(&SessionMessage::Output(data)).await.is_err() {
                                break;
                            }
                        }
                        Ok(SessionOutput::Exited(code)) => {
                            let _ = conduit.send_session(&SessionMessage::Exited { code }).await;
                            break;
                        }
                        Err(RecvError::Lagged(dropped)) => {
                            warn!(session = %session.id(), %party, dropped, "Participant fell behind; oldest output dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        }

        session.leave(&party).await;
        conduit.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use cf_auth::{CaClass, CertAuthority, CertKind, CertificateBody, KeyPair, TrustBundle};
    use cf_core::config::InputPolicy;
    use cf_core::mux::FramedConduit;
    use cf_core::services::{MemoryEventLog, MemoryRecorder, Unlimited};
    use cf_core::time::current_time_secs;
    use cf_core::traits::PresenceSink;
    use cf_core::TunnelError;
    use cf_protocol::{ErrorCode, PresenceUpdate, TerminalSize};

    use crate::session::SessionSettings;
    use crate::state::NodeServices;

    struct NoPresence;

    #[async_trait::async_trait]
    impl PresenceSink for NoPresence {
        async fn publish(&self, _update: PresenceUpdate) -> Result<(), TunnelError> {
            Ok(())
        }
    }

    struct Fixture {
        server: Arc<NodeServer>,
        authority: CertAuthority,
    }

    fn fixture() -> Fixture {
        let authority = CertAuthority::generate("example.com", CaClass::User, current_time_secs());
        let mut bundle = TrustBundle::default();
        bundle.insert(authority.public().unwrap());

        let state = Arc::new(NodeState::new(
            "example.com",
            "node-1",
            "127.0.0.1:3022",
            NodeServices {
                events: Arc::new(MemoryEventLog::new()),
                recorder: Arc::new(MemoryRecorder::new()),
                presence: Arc::new(NoPresence),
                limiter: Arc::new(Unlimited),
            },
        ));
        let table = SessionTable::new(
            state.clone(),
            SessionSettings {
                shell: "/bin/sh".to_string(),
                input_policy: InputPolicy::Shared,
                output_buffer: 64,
            },
        );
        let server = NodeServer::new(
            state,
            table,
            Arc::new(CertChecker::new(bundle)),
            vec!["alice".to_string()],
            Duration::from_secs(2),
        );
        Fixture {
            server: Arc::new(server),
            authority,
        }
    }

    fn user_cert(authority: &CertAuthority, key: &KeyPair, logins: &[&str]) -> Certificate {
        let now = current_time_secs();
        let signer = authority.signer().unwrap();
        CertificateBody {
            kind: CertKind::User,
            domain: "example.com".to_string(),
            subject: "alice".to_string(),
            role: Role::User,
            principals: logins.iter().map(|l| l.to_string()).collect(),
            public_key: key.public_key(),
            serial: 1,
            issued_at: now,
            expires_at: Some(now + 300),
            authority_key_id: signer.key_id(),
        }
        .sign(&signer)
        .unwrap()
    }

    fn connect(server: &Arc<NodeServer>) -> FramedConduit<tokio::io::DuplexStream> {
        let (client, node) = tokio::io::duplex(64 * 1024);
        let server = server.clone();
        tokio::spawn(async move {
            server.serve(Box::new(FramedConduit::new(node, "test"))).await;
        });
        FramedConduit::new(client, "node")
    }

    async fn challenge(conduit: &mut FramedConduit<tokio::io::DuplexStream>) -> Vec<u8> {
        match conduit.recv_session().await.unwrap() {
            Some(SessionMessage::Challenge { nonce }) => nonce,
            other => panic!("expected challenge, got {:?}", other),
        }
    }

    fn start(
        nonce: &[u8],
        key: &KeyPair,
        cert: &Certificate,
        login: &str,
        command: &str,
    ) -> SessionMessage {
        let payload = StartRequest::challenge_payload(nonce, login, None);
        SessionMessage::Start(StartRequest {
            login: login.to_string(),
            session_id: None,
            join_only: false,
            command: Some(command.to_string()),
            size: TerminalSize::default(),
            certificate: cert.to_bytes().unwrap(),
            signature: key.sign(&payload),
        })
    }

    #[tokio::test]
    async fn test_authenticated_command_runs() {
        let fx = fixture();
        let key = KeyPair::generate();
        let cert = user_cert(&fx.authority, &key, &["alice"]);

        let mut conduit = connect(&fx.server);
        let nonce = challenge(&mut conduit).await;
        conduit
            .send_session(&start(&nonce, &key, &cert, "alice", "echo fabric"))
            .await
            .unwrap();

        match conduit.recv_session().await.unwrap() {
            Some(SessionMessage::Started { joined, .. }) => assert!(!joined),
            other => panic!("expected started, got {:?}", other),
        }

        let mut output = Vec::new();
        let code = loop {
            match conduit.recv_session().await.unwrap() {
                Some(SessionMessage::Output(data)) => output.extend_from_slice(&data),
                Some(SessionMessage::Exited { code }) => break code,
                other => panic!("unexpected {:?}", other),
            }
        };
        assert_eq!(code, Some(0));
        assert!(String::from_utf8_lossy(&output).contains("fabric"));
    }

    #[tokio::test]
    async fn test_wrong_signature_denied() {
        let fx = fixture();
        let key = KeyPair::generate();
        let other = KeyPair::generate();
        let cert = user_cert(&fx.authority, &key, &["alice"]);

        let mut conduit = connect(&fx.server);
        let nonce = challenge(&mut conduit).await;
        conduit
            .send_session(&start(&nonce, &other, &cert, "alice", "true"))
            .await
            .unwrap();

        match conduit.recv_session().await.unwrap() {
            Some(SessionMessage::Error { code, .. }) => assert_eq!(code, ErrorCode::AccessDenied),
            other => panic!("expected error, got {:?}", other),
        }
        assert!(fx.server.table().is_empty());
    }

    #[tokio::test]
    async fn test_login_outside_principals_denied() {
        let fx = fixture();
        let key = KeyPair::generate();
        let cert = user_cert(&fx.authority, &key, &["bob"]);

        let mut conduit = connect(&fx.server);
        let nonce = challenge(&mut conduit).await;
        conduit
            .send_session(&start(&nonce, &key, &cert, "alice", "true"))
            .await
            .unwrap();

        match conduit.recv_session().await.unwrap() {
            Some(SessionMessage::Error { code, .. }) => assert_eq!(code, ErrorCode::AccessDenied),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_untrusted_authority_denied() {
        let fx = fixture();
        let rogue = CertAuthority::generate("example.com", CaClass::User, current_time_secs());
        let key = KeyPair::generate();
        let cert = user_cert(&rogue, &key, &["alice"]);

        let mut conduit = connect(&fx.server);
        let nonce = challenge(&mut conduit).await;
        conduit
            .send_session(&start(&nonce, &key, &cert, "alice", "true"))
            .await
            .unwrap();

        match conduit.recv_session().await.unwrap() {
            Some(SessionMessage::Error { code, .. }) => assert_eq!(code, ErrorCode::AccessDenied),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_garbage_instead_of_start() {
        let fx = fixture();
        let mut conduit = connect(&fx.server);
        let _ = challenge(&mut conduit).await;

        use cf_core::traits::Conduit;
        conduit.send(Bytes::from_static(b"\xff\xfe")).await.unwrap();

        match conduit.recv_session().await.unwrap() {
            Some(SessionMessage::Error { code, .. }) => assert_eq!(code, ErrorCode::InvalidMessage),
            other => panic!("expected error, got {:?}", other),
        }
    }
}
