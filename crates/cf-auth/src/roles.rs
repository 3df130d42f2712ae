//! Roles and the permission check seam

use serde::{Deserialize, Serialize};

/// Role carried by a certificate or a user account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
    Node,
    Proxy,
    RemoteSite,
}

impl Role {
    /// Roles that may appear on user certificates
    pub fn is_user_role(&self) -> bool {
        matches!(self, Role::Admin | Role::User)
    }

    /// Roles that may appear on host certificates
    pub fn is_host_role(&self) -> bool {
        matches!(self, Role::Node | Role::Proxy | Role::RemoteSite)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
            Role::Node => "node",
            Role::Proxy => "proxy",
            Role::RemoteSite => "remote_site",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            "node" => Ok(Role::Node),
            "proxy" => Ok(Role::Proxy),
            "remote_site" | "remote-site" => Ok(Role::RemoteSite),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Everything a role can be allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    IssueUserCert,
    IssueHostCert,
    ListSites,
    ListNodes,
    ListSessions,
    ConnectSession,
    CreateSignupToken,
    RegisterTunnel,
    PublishPresence,
}

/// Permission decisions for the authority and the gateway
pub trait Permissions: Send + Sync {
    /// May `role` perform `action`
    fn allows(&self, role: Role, action: Action) -> bool;

    /// May a caller holding `requester` obtain a certificate carrying `requested`
    fn may_grant(&self, requester: Role, requested: Role) -> bool;
}

/// Fixed allow-sets per role
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardPermissions;

impl StandardPermissions {
    fn allowed(role: Role) -> &'static [Action] {
        use Action::*;
        match role {
            Role::Admin => &[
                IssueUserCert,
                IssueHostCert,
                ListSites,
                ListNodes,
                ListSessions,
                ConnectSession,
                CreateSignupToken,
            ],
            Role::User => &[ListSites, ListNodes, ListSessions, ConnectSession],
            Role::Proxy => &[IssueUserCert, ListSites, ListNodes, ListSessions],
            Role::Node => &[RegisterTunnel, PublishPresence],
            Role::RemoteSite => &[RegisterTunnel, PublishPresence],
        }
    }
}

impl Permissions for StandardPermissions {
    fn allows(&self, role: Role, action: Action) -> bool {
        Self::allowed(role).contains(&action)
    }

    fn may_grant(&self, requester: Role, requested: Role) -> bool {
        match requester {
            Role::Admin => true,
            // The proxy mints short-lived certificates for web users only
            Role::Proxy => requested == Role::User,
            _ => false,
        }
    }
}
