//! API wire format
//!
//! One JSON object per line in each direction. A successful `connect`
//! answer is the last JSON line on its connection: from then on the
//! connection carries the session's raw terminal bytes.

use serde::{Deserialize, Serialize};

use crate::gateway::{NodeSummary, SessionSummary, SiteSummary};

/// One request with the credentials it is made under
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    pub call: ApiCall,
}

impl ApiRequest {
    /// A call made without credentials
    pub fn anonymous(call: ApiCall) -> Self {
        Self {
            bearer: None,
            cookie: None,
            call,
        }
    }

    pub fn with_session(session: &ApiSession, call: ApiCall) -> Self {
        Self {
            bearer: Some(session.bearer_token.clone()),
            cookie: session.cookies.first().map(|c| c.value.clone()),
            call,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiCall {
    Ping,

    Login {
        user: String,
        password: String,
        otp_code: String,
    },

    Logout,

    /// Admins only
    CreateSignupToken {
        user: String,
        allowed_logins: Vec<String>,
    },

    GetSignupToken { token: String },

    RedeemSignupToken {
        token: String,
        password: String,
        otp_code: String,
    },

    ListSites,

    ListNodes { site: String },

    ListSessions { site: String, host: String },

    /// Start or join a session; on success the connection turns raw
    Connect {
        site: String,
        host: String,
        login: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        join_only: bool,
        #[serde(default)]
        command: Option<String>,
        #[serde(default = "default_rows")]
        rows: u16,
        #[serde(default = "default_cols")]
        cols: u16,
    },
}

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCookie {
    pub name: String,
    pub value: String,
}

/// Credentials handed out by login and signup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSession {
    pub user: String,
    pub bearer_token: String,
    pub cookies: Vec<ApiCookie>,
    /// Unix seconds
    pub expires_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiResponse {
    Pong,

    Ok,

    Session(ApiSession),

    Invite {
        user: String,
        token: String,
        allowed_logins: Vec<String>,
        otp_url: String,
        expires_at: u64,
    },

    SignupToken {
        user: String,
        allowed_logins: Vec<String>,
        otp_url: String,
        hotp_codes: Vec<String>,
    },

    Sites { sites: Vec<SiteSummary> },

    Nodes { nodes: Vec<NodeSummary> },

    Sessions { sessions: Vec<SessionSummary> },

    Connected { session_id: String, joined: bool },

    Error { code: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_format() {
        let json = r#"{"bearer":"b","cookie":"c","call":{"type":"list_nodes","site":"-current-"}}"#;
        let request: ApiRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.bearer.as_deref(), Some("b"));
        assert!(matches!(request.call, ApiCall::ListNodes { ref site } if site == "-current-"));
    }

    #[test]
    fn test_connect_defaults() {
        let json = r#"{"call":{"type":"connect","site":"-current-","host":"node-1","login":"alice"}}"#;
        let request: ApiRequest = serde_json::from_str(json).unwrap();
        assert!(request.bearer.is_none());
        match request.call {
            ApiCall::Connect {
                session_id,
                join_only,
                rows,
                cols,
                ..
            } => {
                assert_eq!(session_id, None);
                assert!(!join_only);
                assert_eq!((rows, cols), (24, 80));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_response_format() {
        let response = ApiResponse::Error {
            code: "access_denied".into(),
            message: "Access denied".into(),
        };
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"type":"error","code":"access_denied","message":"Access denied"}"#
        );
    }
}
