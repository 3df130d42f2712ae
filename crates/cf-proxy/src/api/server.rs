//! API server implementation
//!
//! Listens on localhost TCP. The HTTP front end (or an operator's tooling)
//! talks to it; it is never exposed to the network.

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use cf_auth::WebSession;
use cf_protocol::TerminalSize;

use super::protocol::{ApiCall, ApiCookie, ApiRequest, ApiResponse, ApiSession};
use crate::gateway::{ActiveSession, ConnectRequest, Credentials, Gateway, GatewayError};

/// Line-delimited JSON front of the gateway
///
/// Listens on loopback only; connections from anywhere else are dropped.
pub struct ApiServer {
    /// Address to bind (127.0.0.1:port)
    pub address: String,
    gateway: Gateway,
    shutdown_token: CancellationToken,
}

impl ApiServer {
    pub fn new(address: String, gateway: Gateway) -> Self {
        Self {
            address,
            gateway,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Set the shutdown token (call before run)
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_token = token;
        self
    }

    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("Failed to bind API server to {}", self.address))?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("API server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("API server shutting down");
                    break;
                }

                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        if !peer_addr.ip().is_loopback() {
                            tracing::warn!("Rejected non-localhost connection from {}", peer_addr);
                            continue;
                        }

                        let gateway = self.gateway.clone();
                        let cancel = self.shutdown_token.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                result = handle_client(stream, gateway) => {
                                    if let Err(e) = result {
                                        tracing::warn!("API client error: {}", e);
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => tracing::error!("Failed to accept API connection: {}", e),
                },
            }
        }

        Ok(())
    }
}

async fn handle_client(stream: TcpStream, gateway: Gateway) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<ApiRequest>(trimmed) {
            Ok(request) => request,
            Err(e) => {
                let response = ApiResponse::Error {
                    code: "bad_request".to_string(),
                    message: format!("Invalid request: {}", e),
                };
                write_response(&mut writer, &response).await?;
                continue;
            }
        };

        let credentials = Credentials {
            bearer: request.bearer,
            cookie: request.cookie,
        };
        match request.call {
            ApiCall::Connect {
                site,
                host,
                login,
                session_id,
                join_only,
                command,
                rows,
                cols,
            } => {
                let connect = ConnectRequest {
                    site,
                    host,
                    login,
                    session_id,
                    join_only,
                    command,
                    size: TerminalSize::new(rows, cols),
                };
                match gateway.connect(&credentials, connect).await {
                    Ok(session) => return stream_session(session, reader, writer).await,
                    Err(e) => write_response(&mut writer, &error_response(&e)).await?,
                }
            }
            call => {
                let response = handle_call(&gateway, &credentials, call)
                    .await
                    .unwrap_or_else(|e| error_response(&e));
                write_response(&mut writer, &response).await?;
            }
        }
    }
}

/// Acknowledge the connect, then hand the connection over to raw bytes.
/// Bytes already buffered past the request line belong to the session.
async fn stream_session(
    session: ActiveSession,
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
) -> Result<()> {
    let session_id = session.session_id().to_string();
    let ack = ApiResponse::Connected {
        session_id: session_id.clone(),
        joined: session.joined(),
    };
    write_response(&mut writer, &ack).await?;

    match session.relay(reader, writer).await {
        Ok(code) => tracing::debug!(%session_id, ?code, "Session stream finished"),
        Err(e) => tracing::debug!(%session_id, error = %e, "Session stream ended"),
    }
    Ok(())
}

async fn handle_call(
    gateway: &Gateway,
    credentials: &Credentials,
    call: ApiCall,
) -> Result<ApiResponse, GatewayError> {
    let response = match call {
        ApiCall::Ping => ApiResponse::Pong,

        ApiCall::Login {
            user,
            password,
            otp_code,
        } => ApiResponse::Session(session_response(
            gateway.login(&user, &password, &otp_code).await?,
        )),

        ApiCall::Logout => {
            gateway.logout(credentials).await?;
            ApiResponse::Ok
        }

        ApiCall::CreateSignupToken {
            user,
            allowed_logins,
        } => {
            let invite = gateway
                .create_signup_token(credentials, &user, allowed_logins)
                .await?;
            ApiResponse::Invite {
                user: invite.user,
                token: invite.token,
                allowed_logins: invite.allowed_logins,
                otp_url: invite.otp_url,
                expires_at: invite.expires_at,
            }
        }

        ApiCall::GetSignupToken { token } => {
            let data = gateway.signup_token_data(&token).await?;
            ApiResponse::SignupToken {
                user: data.user,
                allowed_logins: data.allowed_logins,
                otp_url: data.otp_url,
                hotp_codes: data.hotp_codes,
            }
        }

        ApiCall::RedeemSignupToken {
            token,
            password,
            otp_code,
        } => ApiResponse::Session(session_response(
            gateway
                .redeem_signup_token(&token, &password, &otp_code)
                .await?,
        )),

        ApiCall::ListSites => ApiResponse::Sites {
            sites: gateway.list_sites(credentials).await?,
        },

        ApiCall::ListNodes { site } => ApiResponse::Nodes {
            nodes: gateway.list_nodes(credentials, &site).await?,
        },

        ApiCall::ListSessions { site, host } => ApiResponse::Sessions {
            sessions: gateway.list_sessions(credentials, &site, &host).await?,
        },

        ApiCall::Connect { .. } => {
            return Err(GatewayError::BadRequest("connect is handled by the stream".into()))
        }
    };
    Ok(response)
}

fn session_response(session: WebSession) -> ApiSession {
    ApiSession {
        user: session.user,
        bearer_token: session.bearer_token,
        cookies: session
            .cookies
            .into_iter()
            .map(|c| ApiCookie {
                name: c.name,
                value: c.value,
            })
            .collect(),
        expires_at: session.expires_at,
    }
}

fn error_response(error: &GatewayError) -> ApiResponse {
    ApiResponse::Error {
        code: error.code().to_string(),
        message: error.to_string(),
    }
}

async fn write_response<W>(writer: &mut W, response: &ApiResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut json = serde_json::to_string(response)?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
