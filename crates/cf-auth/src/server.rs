//! The credential authority service
//!
//! All state lives in a [`KeyValueStore`] as JSON records. Read-modify-write
//! cycles use compare-and-swap, so several authority instances may share one
//! store.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use cf_core::time::current_time_secs;
use cf_core::token::{generate_token, tokens_match};
use cf_core::traits::{AuditEvent, EventLog, KeyValueStore};
use cf_core::types::is_valid_name;

use crate::authority::{CaClass, CertAuthority};
use crate::cert::{CertKind, Certificate, CertificateBody};
use crate::checker::{CertChecker, Identity, TrustBundle};
use crate::error::{AuthError, CertError};
use crate::keys::KEY_LEN;
use crate::otp;
use crate::password::{hash_password, verify_password, PasswordCost};
use crate::records::{BearerIndex, SignupTokenRecord, UserRecord, WebSessionRecord};
use crate::roles::{Action, Permissions, Role};
use crate::store::{self, Versioned};

/// Name of the cookie that carries the web session id
pub const SESSION_COOKIE: &str = "cf_session";

/// How many codes signup shows ahead of time
const SIGNUP_CODES: usize = 5;

/// Compare-and-swap retries before giving up
const CAS_ATTEMPTS: usize = 8;

/// Second factor checked for users that have none
const DUMMY_OTP_SEED: &str = "0000000000000000000000000000000000000000";

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Domain of the local site; user certificates are signed by its authority
    pub domain: String,
    pub session_ttl: Duration,
    pub signup_token_ttl: Duration,
    /// How far ahead of the stored counter a code may be
    pub otp_window: u64,
    pub password_cost: PasswordCost,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            session_ttl: Duration::from_secs(8 * 3600),
            signup_token_ttl: Duration::from_secs(3600),
            otp_window: 5,
            password_cost: PasswordCost::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
}

/// Credentials handed to a browser after login or signup
#[derive(Debug, Clone)]
pub struct WebSession {
    pub user: String,
    pub session_id: String,
    pub bearer_token: String,
    pub cookies: Vec<SessionCookie>,
    /// Unix seconds
    pub expires_at: u64,
}

/// A validated web session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub user: String,
    pub role: Role,
    pub allowed_logins: Vec<String>,
    pub expires_at: u64,
}

/// Second factor provisioning returned by [`AuthServer::upsert_password`]
#[derive(Debug, Clone)]
pub struct PasswordSetup {
    pub otp_url: String,
    pub otp_seed_hex: String,
    pub next_counter: u64,
}

#[derive(Debug, Clone)]
pub struct UserSummary {
    pub name: String,
    pub role: Role,
    pub allowed_logins: Vec<String>,
}

/// What the signup page shows for an outstanding token
#[derive(Debug, Clone)]
pub struct SignupTokenData {
    pub user: String,
    pub allowed_logins: Vec<String>,
    pub otp_url: String,
    pub hotp_codes: Vec<String>,
}

/// Invitation handed out of band to a new user
#[derive(Debug, Clone)]
pub struct UserInvite {
    pub user: String,
    pub token: String,
    pub allowed_logins: Vec<String>,
    pub otp_url: String,
    pub expires_at: u64,
}

impl std::fmt::Display for UserInvite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Signup invitation for {}", self.user)?;
        writeln!(f, "  token:  {}", self.token)?;
        writeln!(f, "  logins: {}", self.allowed_logins.join(", "))?;
        writeln!(f, "  otp:    {}", self.otp_url)?;
        write!(f, "  expires at {} (unix seconds)", self.expires_at)
    }
}

/// Request for a short-lived user certificate
#[derive(Debug, Clone)]
pub struct UserCertRequest {
    pub user: String,
    pub public_key: [u8; KEY_LEN],
    pub role: Role,
    pub logins: Vec<String>,
    pub ttl: Duration,
}

/// Request for a host certificate
#[derive(Debug, Clone)]
pub struct HostCertRequest {
    pub domain: String,
    pub host: String,
    pub public_key: [u8; KEY_LEN],
    pub role: Role,
    /// Zero means the certificate never expires
    pub validity: Duration,
}

pub struct AuthServer {
    config: AuthConfig,
    store: Arc<dyn KeyValueStore>,
    events: Arc<dyn EventLog>,
    permissions: Arc<dyn Permissions>,
    dummy_hash: OnceLock<String>,
}

impl AuthServer {
    pub fn new(
        config: AuthConfig,
        store: Arc<dyn KeyValueStore>,
        events: Arc<dyn EventLog>,
        permissions: Arc<dyn Permissions>,
    ) -> Self {
        Self {
            config,
            store,
            events,
            permissions,
            dummy_hash: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn permissions(&self) -> &Arc<dyn Permissions> {
        &self.permissions
    }

    // ---- authorities ----

    /// Create the authority for `(domain, class)` if it does not exist.
    /// Returns whether it was created.
    pub async fn upsert_cert_authority(
        &self,
        domain: &str,
        class: CaClass,
    ) -> Result<bool, AuthError> {
        check_name("domain", domain)?;
        let authority = CertAuthority::generate(domain, class, current_time_secs());
        let created = store::swap(
            &*self.store,
            &store::authority_key(domain, class),
            None,
            &authority,
        )
        .await?;
        if created {
            info!(%domain, %class, "Created certificate authority");
        }
        Ok(created)
    }

    /// Store the public keys of another site's authority
    pub async fn import_authority(&self, bundle: &TrustBundle) -> Result<usize, AuthError> {
        let mut imported = 0;
        for keys in &bundle.authorities {
            if keys.domain == self.config.domain {
                continue;
            }
            check_name("domain", &keys.domain)?;
            let authority = CertAuthority::from_public(keys)?;
            store::save(
                &*self.store,
                &store::authority_key(&keys.domain, keys.class),
                &authority,
            )
            .await?;
            imported += 1;
        }
        Ok(imported)
    }

    /// Add a fresh active key; the previous keys stay trusted
    pub async fn rotate_cert_authority(
        &self,
        domain: &str,
        class: CaClass,
    ) -> Result<String, AuthError> {
        let new_id = self
            .update_authority(domain, class, |authority| {
                Some(authority.rotate(current_time_secs()))
            })
            .await?;
        info!(%domain, %class, key_id = %new_id, "Rotated certificate authority");
        Ok(new_id)
    }

    /// Drop retired keys whose certificates have all expired
    pub async fn prune_retired_keys(
        &self,
        domain: &str,
        class: CaClass,
    ) -> Result<usize, AuthError> {
        let mut pruned = 0;
        self.update_authority(domain, class, |authority| {
            pruned = authority.prune(current_time_secs());
            (pruned > 0).then_some(())
        })
        .await?;
        if pruned > 0 {
            info!(%domain, %class, pruned, "Pruned retired authority keys");
        }
        Ok(pruned)
    }

    /// Public keys of every known authority
    pub async fn export_trust_bundle(&self) -> Result<TrustBundle, AuthError> {
        let mut bundle = TrustBundle::default();
        for key in self.store.list(store::AUTHORITY_PREFIX).await? {
            if let Some(record) = store::load::<CertAuthority>(&*self.store, &key).await? {
                bundle.insert(record.value.public()?);
            }
        }
        Ok(bundle)
    }

    pub async fn checker(&self) -> Result<CertChecker, AuthError> {
        Ok(CertChecker::new(self.export_trust_bundle().await?))
    }

    pub async fn verify_certificate(
        &self,
        cert: &Certificate,
        accepted: &[Role],
    ) -> Result<Identity, AuthError> {
        Ok(self.checker().await?.verify(cert, accepted)?)
    }

    /// Apply `change` under compare-and-swap. `change` returns `None` when
    /// nothing needs writing.
    async fn update_authority<T, F>(
        &self,
        domain: &str,
        class: CaClass,
        mut change: F,
    ) -> Result<T, AuthError>
    where
        T: Default,
        F: FnMut(&mut CertAuthority) -> Option<T>,
    {
        check_name("domain", domain)?;
        let key = store::authority_key(domain, class);
        for _ in 0..CAS_ATTEMPTS {
            let current = store::load::<CertAuthority>(&*self.store, &key)
                .await?
                .ok_or_else(|| AuthError::NotFound(format!("{} {} authority", domain, class)))?;
            let mut authority = current.value;
            let Some(result) = change(&mut authority) else {
                return Ok(T::default());
            };
            if store::swap(&*self.store, &key, Some(&current.raw), &authority).await? {
                return Ok(result);
            }
        }
        Err(contention(&key))
    }

    // ---- certificates ----

    pub async fn issue_user_certificate(
        &self,
        requester: Role,
        request: UserCertRequest,
    ) -> Result<Certificate, AuthError> {
        if !self.permissions.allows(requester, Action::IssueUserCert)
            || !self.permissions.may_grant(requester, request.role)
            || !request.role.is_user_role()
        {
            return Err(AuthError::UntrustedRequester);
        }
        check_name("user", &request.user)?;

        let now = current_time_secs();
        let body = CertificateBody {
            kind: CertKind::User,
            domain: self.config.domain.clone(),
            subject: request.user,
            role: request.role,
            principals: request.logins,
            public_key: request.public_key,
            serial: rand::random(),
            issued_at: now,
            expires_at: Some(now + request.ttl.as_secs().max(1)),
            authority_key_id: String::new(),
        };
        self.sign(CaClass::User, body).await
    }

    pub async fn issue_host_certificate(
        &self,
        requester: Role,
        request: HostCertRequest,
    ) -> Result<Certificate, AuthError> {
        if !self.permissions.allows(requester, Action::IssueHostCert)
            || !self.permissions.may_grant(requester, request.role)
            || !request.role.is_host_role()
        {
            return Err(AuthError::UntrustedRequester);
        }
        check_name("host", &request.host)?;

        let now = current_time_secs();
        let expires_at = if request.validity.is_zero() {
            None
        } else {
            Some(now + request.validity.as_secs().max(1))
        };
        let body = CertificateBody {
            kind: CertKind::Host,
            domain: request.domain,
            subject: request.host,
            role: request.role,
            principals: Vec::new(),
            public_key: request.public_key,
            serial: rand::random(),
            issued_at: now,
            expires_at,
            authority_key_id: String::new(),
        };
        self.sign(CaClass::Host, body).await
    }

    async fn sign(
        &self,
        class: CaClass,
        mut body: CertificateBody,
    ) -> Result<Certificate, AuthError> {
        let key = store::authority_key(&body.domain, class);
        for _ in 0..CAS_ATTEMPTS {
            let current = store::load::<CertAuthority>(&*self.store, &key)
                .await?
                .ok_or(CertError::UnknownAuthority)?;
            let mut authority = current.value;
            let signer = authority.signer()?;
            body.authority_key_id = signer.key_id();

            if authority.note_signed(&body.authority_key_id, body.expires_at)
                && !store::swap(&*self.store, &key, Some(&current.raw), &authority).await?
            {
                continue;
            }

            debug!(
                subject = %body.subject,
                role = %body.role,
                key_id = %body.authority_key_id,
                "Issued certificate"
            );
            return Ok(body.sign(&signer)?);
        }
        Err(contention(&key))
    }

    // ---- accounts ----

    /// Set a password and provision a fresh second factor, creating the
    /// account if needed
    pub async fn upsert_password(
        &self,
        user: &str,
        password: &str,
    ) -> Result<PasswordSetup, AuthError> {
        check_name("user", user)?;
        if password.is_empty() {
            return Err(AuthError::BadParameter("password must not be empty".into()));
        }
        let hash = hash_password(password, self.config.password_cost)?;
        let seed = otp::generate_seed();
        let seed_hex = hex::encode(&seed);

        self.update_user(user, true, |record| {
            record.password_hash = Some(hash.clone());
            record.otp_seed = Some(seed_hex.clone());
            record.otp_counter = 0;
        })
        .await?;

        Ok(PasswordSetup {
            otp_url: otp::otp_url(&self.config.domain, user, &seed, 0),
            otp_seed_hex: seed_hex,
            next_counter: 0,
        })
    }

    /// Set the logins a user may assume, creating the account if needed
    pub async fn upsert_user(
        &self,
        user: &str,
        allowed_logins: Vec<String>,
    ) -> Result<(), AuthError> {
        check_name("user", user)?;
        for login in &allowed_logins {
            check_name("login", login)?;
        }
        self.update_user(user, true, |record| {
            record.allowed_logins = allowed_logins.clone();
        })
        .await
    }

    pub async fn set_user_role(&self, user: &str, role: Role) -> Result<(), AuthError> {
        check_name("user", user)?;
        if !role.is_user_role() {
            return Err(AuthError::BadParameter(format!("{} is not a user role", role)));
        }
        self.update_user(user, false, |record| record.role = role)
            .await
    }

    pub async fn get_user(&self, user: &str) -> Result<Option<UserSummary>, AuthError> {
        if !is_valid_name(user) {
            return Ok(None);
        }
        Ok(store::load::<UserRecord>(&*self.store, &store::user_key(user))
            .await?
            .map(|record| UserSummary {
                name: record.value.name,
                role: record.value.role,
                allowed_logins: record.value.allowed_logins,
            }))
    }

    async fn update_user<F>(&self, user: &str, create: bool, change: F) -> Result<(), AuthError>
    where
        F: Fn(&mut UserRecord),
    {
        let key = store::user_key(user);
        for _ in 0..CAS_ATTEMPTS {
            let current = store::load::<UserRecord>(&*self.store, &key).await?;
            let (mut record, expected) = match current {
                Some(Versioned { value, raw }) => (value, Some(raw)),
                None if create => (UserRecord::new(user, current_time_secs()), None),
                None => return Err(AuthError::NotFound(format!("user {}", user))),
            };
            change(&mut record);
            if store::swap(&*self.store, &key, expected.as_deref(), &record).await? {
                return Ok(());
            }
        }
        Err(contention(&key))
    }

    /// Check password and second factor and open a web session.
    ///
    /// Every failure is reported as `AccessDenied`.
    pub async fn authenticate(
        &self,
        user: &str,
        password: &str,
        otp_code: &str,
    ) -> Result<WebSession, AuthError> {
        let checked = self.check_credentials(user, password, otp_code).await;
        self.audit(AuditEvent::UserLogin {
            user: user.to_string(),
            success: checked.is_ok(),
        })
        .await;

        match checked {
            Ok(()) => self
                .create_web_session(user)
                .await
                .map_err(|e| deny("login", e)),
            Err(e) => Err(deny("login", e)),
        }
    }

    async fn check_credentials(
        &self,
        user: &str,
        password: &str,
        otp_code: &str,
    ) -> Result<(), AuthError> {
        let key = store::user_key(user);
        for _ in 0..CAS_ATTEMPTS {
            let current = if is_valid_name(user) {
                store::load::<UserRecord>(&*self.store, &key).await?
            } else {
                None
            };
            let stored = current.as_ref().and_then(|c| {
                Some((
                    c.value.password_hash.as_deref()?,
                    c.value.otp_seed.as_deref()?,
                    c.value.otp_counter,
                ))
            });
            let usable = stored.is_some();

            // Unknown users and accounts without credentials cost the same hash work
            let (hash, seed_hex, counter) = stored.unwrap_or((self.dummy_hash(), DUMMY_OTP_SEED, 0));
            let password_ok = verify_password(password, hash);
            let seed = hex::decode(seed_hex).unwrap_or_default();
            let next = otp::verify(&seed, counter, otp_code, self.config.otp_window).map_err(internal)?;

            let (Some(current), true, Some(next)) = (current, usable && password_ok, next) else {
                return Err(AuthError::AccessDenied);
            };
            let mut record = current.value;
            record.otp_counter = next;
            // A concurrent login may have consumed the same code; re-check
            if store::swap(&*self.store, &key, Some(&current.raw), &record).await? {
                return Ok(());
            }
        }
        Err(AuthError::AccessDenied)
    }

    /// Hash checked in place of a missing one, at the configured cost
    fn dummy_hash(&self) -> &str {
        self.dummy_hash.get_or_init(|| {
            hash_password("cf-unused-password", self.config.password_cost).unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build the placeholder password hash");
                String::new()
            })
        })
    }

    // ---- web sessions ----

    async fn create_web_session(&self, user: &str) -> Result<WebSession, AuthError> {
        let now = current_time_secs();
        let session_id = generate_token();
        let bearer_token = generate_token();
        let expires_at = now + self.config.session_ttl.as_secs();

        let record = WebSessionRecord {
            user: user.to_string(),
            bearer_token: bearer_token.clone(),
            created_at: now,
            expires_at,
        };
        store::save(&*self.store, &store::session_key(&session_id), &record).await?;
        store::save(
            &*self.store,
            &store::bearer_key(&bearer_token),
            &BearerIndex {
                session_id: session_id.clone(),
            },
        )
        .await?;

        Ok(WebSession {
            user: user.to_string(),
            cookies: vec![SessionCookie {
                name: SESSION_COOKIE.to_string(),
                value: session_id.clone(),
            }],
            session_id,
            bearer_token,
            expires_at,
        })
    }

    /// Resolve a bearer token (and cookie) to its user.
    ///
    /// With `require_cookie` both must be presented and belong together.
    pub async fn validate_session(
        &self,
        bearer: Option<&str>,
        cookie: Option<&str>,
        require_cookie: bool,
    ) -> Result<SessionInfo, AuthError> {
        self.lookup_session(bearer, cookie, require_cookie)
            .await
            .map_err(|e| deny("session", e))
    }

    async fn lookup_session(
        &self,
        bearer: Option<&str>,
        cookie: Option<&str>,
        require_cookie: bool,
    ) -> Result<SessionInfo, AuthError> {
        let bearer = bearer
            .filter(|b| is_valid_name(b))
            .ok_or(AuthError::AccessDenied)?;
        let session_id = match cookie.filter(|c| !c.is_empty()) {
            Some(cookie) => cookie.to_string(),
            None if require_cookie => return Err(AuthError::AccessDenied),
            None => {
                store::load::<BearerIndex>(&*self.store, &store::bearer_key(bearer))
                    .await?
                    .ok_or(AuthError::AccessDenied)?
                    .value
                    .session_id
            }
        };
        if !is_valid_name(&session_id) {
            return Err(AuthError::AccessDenied);
        }

        let session_key = store::session_key(&session_id);
        let record = store::load::<WebSessionRecord>(&*self.store, &session_key)
            .await?
            .ok_or(AuthError::AccessDenied)?
            .value;
        if !tokens_match(bearer, &record.bearer_token) {
            return Err(AuthError::AccessDenied);
        }
        if record.expires_at <= current_time_secs() {
            self.store.delete(&session_key).await?;
            self.store.delete(&store::bearer_key(bearer)).await?;
            return Err(AuthError::AccessDenied);
        }

        let user = store::load::<UserRecord>(&*self.store, &store::user_key(&record.user))
            .await?
            .ok_or(AuthError::AccessDenied)?
            .value;
        Ok(SessionInfo {
            user: record.user,
            role: user.role,
            allowed_logins: user.allowed_logins,
            expires_at: record.expires_at,
        })
    }

    /// Remove the session behind `bearer`. Unknown tokens are not an error.
    pub async fn invalidate_session(&self, bearer: &str) -> Result<(), AuthError> {
        if !is_valid_name(bearer) {
            return Ok(());
        }
        let index_key = store::bearer_key(bearer);
        if let Some(index) = store::load::<BearerIndex>(&*self.store, &index_key).await? {
            if is_valid_name(&index.value.session_id) {
                self.store
                    .delete(&store::session_key(&index.value.session_id))
                    .await?;
            }
        }
        self.store.delete(&index_key).await?;
        Ok(())
    }

    // ---- signup ----

    /// Mint a single-use invitation for a new user
    pub async fn create_signup_token(
        &self,
        user: &str,
        allowed_logins: Vec<String>,
    ) -> Result<String, AuthError> {
        check_name("user", user)?;
        for login in &allowed_logins {
            check_name("login", login)?;
        }
        if self.store.get(&store::user_key(user)).await?.is_some() {
            return Err(AuthError::AlreadyExists(format!("user {}", user)));
        }

        let now = current_time_secs();
        let token = generate_token();
        let record = SignupTokenRecord {
            user: user.to_string(),
            allowed_logins,
            otp_seed: hex::encode(otp::generate_seed()),
            created_at: now,
            expires_at: now + self.config.signup_token_ttl.as_secs(),
            consumed: false,
        };
        if !store::swap(&*self.store, &store::signup_key(&token), None, &record).await? {
            return Err(AuthError::AlreadyExists("signup token".into()));
        }
        info!(%user, "Created signup token");
        Ok(token)
    }

    async fn load_signup(
        &self,
        token: &str,
    ) -> Result<Versioned<SignupTokenRecord>, AuthError> {
        if !is_valid_name(token) {
            return Err(AuthError::TokenNotFound);
        }
        let key = store::signup_key(token);
        let record = store::load::<SignupTokenRecord>(&*self.store, &key)
            .await?
            .ok_or(AuthError::TokenNotFound)?;
        if record.value.consumed {
            return Err(AuthError::TokenAlreadyUsed);
        }
        if record.value.expires_at <= current_time_secs() {
            self.store.delete(&key).await?;
            return Err(AuthError::TokenNotFound);
        }
        Ok(record)
    }

    pub async fn signup_token_data(&self, token: &str) -> Result<SignupTokenData, AuthError> {
        let record = self.load_signup(token).await?.value;
        let seed = hex::decode(&record.otp_seed).map_err(internal)?;
        Ok(SignupTokenData {
            otp_url: otp::otp_url(&self.config.domain, &record.user, &seed, 0),
            hotp_codes: otp::next_codes(&seed, 0, SIGNUP_CODES).map_err(internal)?,
            user: record.user,
            allowed_logins: record.allowed_logins,
        })
    }

    pub async fn render_user_invite(&self, token: &str) -> Result<UserInvite, AuthError> {
        let record = self.load_signup(token).await?.value;
        let seed = hex::decode(&record.otp_seed).map_err(internal)?;
        Ok(UserInvite {
            otp_url: otp::otp_url(&self.config.domain, &record.user, &seed, 0),
            token: token.to_string(),
            user: record.user,
            allowed_logins: record.allowed_logins,
            expires_at: record.expires_at,
        })
    }

    /// Consume a signup token, create the user and log them in
    pub async fn redeem_signup_token(
        &self,
        token: &str,
        password: &str,
        otp_code: &str,
    ) -> Result<WebSession, AuthError> {
        let current = self.load_signup(token).await?;
        let mut record = current.value;
        if password.is_empty() {
            return Err(AuthError::BadParameter("password must not be empty".into()));
        }

        let seed = hex::decode(&record.otp_seed).map_err(internal)?;
        let next_counter = otp::verify(&seed, 0, otp_code, self.config.otp_window)
            .map_err(internal)?
            .ok_or(AuthError::BadSecondFactor)?;

        let hash = hash_password(password, self.config.password_cost)?;

        let signup_key = store::signup_key(token);
        record.consumed = true;
        let consumed = serde_json::to_vec(&record)?;
        if !self
            .store
            .compare_and_swap(&signup_key, Some(&current.raw), consumed.clone())
            .await?
        {
            return Err(AuthError::TokenAlreadyUsed);
        }

        let user = UserRecord {
            name: record.user.clone(),
            password_hash: Some(hash),
            otp_seed: Some(record.otp_seed.clone()),
            otp_counter: next_counter,
            allowed_logins: record.allowed_logins.clone(),
            role: Role::User,
            created_at: current_time_secs(),
        };
        let created = match store::swap(&*self.store, &store::user_key(&record.user), None, &user).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(AuthError::AlreadyExists(format!("user {}", record.user))),
            Err(e) => Err(e),
        };
        if let Err(e) = created {
            // Hand the token back so the invite can be retried
            if let Err(restore) = self
                .store
                .compare_and_swap(&signup_key, Some(&consumed), current.raw)
                .await
            {
                warn!(user = %record.user, error = %restore, "Failed to restore signup token");
            }
            return Err(e);
        }

        info!(user = %record.user, "User signed up");
        self.audit(AuditEvent::UserSignup {
            user: record.user.clone(),
        })
        .await;
        self.create_web_session(&record.user).await
    }

    async fn audit(&self, event: AuditEvent) {
        if let Err(e) = self.events.emit(event).await {
            warn!(error = %e, "Failed to record audit event");
        }
    }
}

fn check_name(what: &str, value: &str) -> Result<(), AuthError> {
    if is_valid_name(value) {
        Ok(())
    } else {
        Err(AuthError::BadParameter(format!("invalid {}: {:?}", what, value)))
    }
}

fn internal(e: impl std::fmt::Display) -> AuthError {
    AuthError::Internal(e.to_string())
}

fn contention(key: &str) -> AuthError {
    AuthError::Internal(format!("too much contention on {}", key))
}

/// Collapse any failure to `AccessDenied`, keeping the cause in the log
fn deny(context: &str, e: AuthError) -> AuthError {
    match e {
        AuthError::AccessDenied => debug!(context, "Access denied"),
        other => warn!(context, error = %other, "Access denied after internal error"),
    }
    AuthError::AccessDenied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use crate::roles::StandardPermissions;
    use cf_core::services::{MemoryEventLog, MemoryStore};

    const DOMAIN: &str = "example.com";

    async fn server() -> (AuthServer, Arc<MemoryEventLog>) {
        server_with_cost(PasswordCost::minimal()).await
    }

    async fn server_with_cost(password_cost: PasswordCost) -> (AuthServer, Arc<MemoryEventLog>) {
        let events = Arc::new(MemoryEventLog::new());
        let config = AuthConfig {
            domain: DOMAIN.to_string(),
            password_cost,
            ..Default::default()
        };
        let server = AuthServer::new(
            config,
            Arc::new(MemoryStore::new()),
            events.clone(),
            Arc::new(StandardPermissions),
        );
        server.upsert_cert_authority(DOMAIN, CaClass::User).await.unwrap();
        server.upsert_cert_authority(DOMAIN, CaClass::Host).await.unwrap();
        (server, events)
    }

    fn user_request(role: Role) -> UserCertRequest {
        UserCertRequest {
            user: "alice".into(),
            public_key: KeyPair::generate().public_key(),
            role,
            logins: vec!["admin".into()],
            ttl: Duration::from_secs(300),
        }
    }

    async fn user_with_password(server: &AuthServer) -> Vec<u8> {
        let setup = server.upsert_password("alice", "secret").await.unwrap();
        server
            .upsert_user("alice", vec!["admin".into()])
            .await
            .unwrap();
        hex::decode(setup.otp_seed_hex).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_authority_is_idempotent() {
        let (server, _) = server().await;
        assert!(!server
            .upsert_cert_authority(DOMAIN, CaClass::User)
            .await
            .unwrap());
        assert_eq!(server.export_trust_bundle().await.unwrap().authorities.len(), 2);
    }

    #[tokio::test]
    async fn test_user_certificate_roundtrip() {
        let (server, _) = server().await;
        let cert = server
            .issue_user_certificate(Role::Proxy, user_request(Role::User))
            .await
            .unwrap();

        let identity = server
            .verify_certificate(&cert, &[Role::User])
            .await
            .unwrap();
        assert_eq!(identity.subject, "alice");
        assert_eq!(identity.role, Role::User);
        assert!(identity.allows_login("admin"));
    }

    #[tokio::test]
    async fn test_untrusted_requester() {
        let (server, _) = server().await;
        let result = server
            .issue_user_certificate(Role::User, user_request(Role::User))
            .await;
        assert!(matches!(result, Err(AuthError::UntrustedRequester)));

        let result = server
            .issue_user_certificate(Role::Proxy, user_request(Role::Admin))
            .await;
        assert!(matches!(result, Err(AuthError::UntrustedRequester)));
    }

    #[tokio::test]
    async fn test_host_certificate_forever_and_rotation() {
        let (server, _) = server().await;
        let request = HostCertRequest {
            domain: DOMAIN.into(),
            host: "server4".into(),
            public_key: KeyPair::generate().public_key(),
            role: Role::Node,
            validity: Duration::ZERO,
        };
        let cert = server
            .issue_host_certificate(Role::Admin, request)
            .await
            .unwrap();
        assert_eq!(cert.body.expires_at, None);

        server
            .rotate_cert_authority(DOMAIN, CaClass::Host)
            .await
            .unwrap();
        // The old key signed a non-expiring certificate and stays trusted
        assert_eq!(
            server
                .prune_retired_keys(DOMAIN, CaClass::Host)
                .await
                .unwrap(),
            0
        );
        assert!(server
            .verify_certificate(&cert, &[Role::Node])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_host_certificate_unknown_domain() {
        let (server, _) = server().await;
        let request = HostCertRequest {
            domain: "other.example".into(),
            host: "server4".into(),
            public_key: KeyPair::generate().public_key(),
            role: Role::Node,
            validity: Duration::from_secs(60),
        };
        let result = server.issue_host_certificate(Role::Admin, request).await;
        assert!(matches!(
            result,
            Err(AuthError::Cert(CertError::UnknownAuthority))
        ));
    }

    #[tokio::test]
    async fn test_authenticate_advances_counter() {
        let (server, events) = server().await;
        let seed = user_with_password(&server).await;

        let code = otp::hotp(&seed, 0).unwrap();
        let session = server.authenticate("alice", "secret", &code).await.unwrap();
        assert_eq!(session.cookies.len(), 1);
        assert_eq!(session.user, "alice");

        // Replay of the same code fails
        let replay = server.authenticate("alice", "secret", &code).await;
        assert!(matches!(replay, Err(AuthError::AccessDenied)));

        let next = otp::hotp(&seed, 1).unwrap();
        assert!(server.authenticate("alice", "secret", &next).await.is_ok());

        let logins: Vec<bool> = events
            .events()
            .await
            .into_iter()
            .filter_map(|e| match e {
                AuditEvent::UserLogin { success, .. } => Some(success),
                _ => None,
            })
            .collect();
        assert_eq!(logins, vec![true, false, true]);
    }

    #[tokio::test]
    async fn test_authenticate_failures_are_uniform() {
        let (server, _) = server().await;
        let seed = user_with_password(&server).await;
        let code = otp::hotp(&seed, 0).unwrap();

        for (user, password, otp_code) in [
            ("alice", "wrong", code.as_str()),
            ("alice", "secret", "000000x"),
            ("alice", "", code.as_str()),
            ("nobody", "secret", code.as_str()),
            ("../etc", "secret", code.as_str()),
        ] {
            let result = server.authenticate(user, password, otp_code).await;
            assert!(matches!(result, Err(AuthError::AccessDenied)), "{user}");
        }
    }

    #[tokio::test]
    async fn test_unknown_user_costs_a_hash_check() {
        let (server, _) = server_with_cost(PasswordCost {
            memory_kib: 2048,
            iterations: 2,
        })
        .await;
        let seed = user_with_password(&server).await;
        server.upsert_user("bob", vec!["bob".into()]).await.unwrap();
        let code = otp::hotp(&seed, 0).unwrap();

        async fn timed(server: &AuthServer, user: &str, code: &str) -> Duration {
            let started = std::time::Instant::now();
            for _ in 0..3 {
                let result = server.authenticate(user, "wrong", code).await;
                assert!(matches!(result, Err(AuthError::AccessDenied)), "{user}");
            }
            started.elapsed()
        }

        // Builds the placeholder hash up front
        timed(&server, "nobody", &code).await;

        let known = timed(&server, "alice", &code).await;
        let unknown = timed(&server, "nobody", &code).await;
        let no_password = timed(&server, "bob", &code).await;
        assert!(unknown * 4 >= known, "known {:?}, unknown {:?}", known, unknown);
        assert!(no_password * 4 >= known, "known {:?}, no password {:?}", known, no_password);
    }

    #[tokio::test]
    async fn test_session_validation_modes() {
        let (server, _) = server().await;
        let seed = user_with_password(&server).await;
        let session = server
            .authenticate("alice", "secret", &otp::hotp(&seed, 0).unwrap())
            .await
            .unwrap();
        let cookie = session.cookies[0].value.as_str();
        let bearer = session.bearer_token.as_str();

        let info = server
            .validate_session(Some(bearer), Some(cookie), true)
            .await
            .unwrap();
        assert_eq!(info.user, "alice");
        assert_eq!(info.allowed_logins, vec!["admin".to_string()]);

        assert!(server.validate_session(Some(bearer), None, true).await.is_err());
        assert!(server.validate_session(Some(bearer), None, false).await.is_ok());
        assert!(server.validate_session(None, Some(cookie), false).await.is_err());

        // Bearer from one session with the cookie of another
        let other = server
            .authenticate("alice", "secret", &otp::hotp(&seed, 1).unwrap())
            .await
            .unwrap();
        assert!(server
            .validate_session(Some(&other.bearer_token), Some(cookie), true)
            .await
            .is_err());

        server.invalidate_session(bearer).await.unwrap();
        server.invalidate_session(bearer).await.unwrap();
        assert!(server
            .validate_session(Some(bearer), Some(cookie), true)
            .await
            .is_err());
        assert!(server
            .validate_session(Some(&other.bearer_token), Some(&other.session_id), true)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_signup_flow() {
        let (server, events) = server().await;
        let token = server
            .create_signup_token("bob", vec!["bob".into()])
            .await
            .unwrap();

        let data = server.signup_token_data(&token).await.unwrap();
        assert_eq!(data.user, "bob");
        assert_eq!(data.hotp_codes.len(), SIGNUP_CODES);
        let invite = server.render_user_invite(&token).await.unwrap();
        assert!(invite.to_string().contains(&token));

        let bad = server.redeem_signup_token(&token, "pw", "000000").await;
        assert!(matches!(bad, Err(AuthError::BadSecondFactor)));

        let session = server
            .redeem_signup_token(&token, "pw", &data.hotp_codes[0])
            .await
            .unwrap();
        assert_eq!(session.user, "bob");

        let again = server
            .redeem_signup_token(&token, "pw", &data.hotp_codes[1])
            .await;
        assert!(matches!(again, Err(AuthError::TokenAlreadyUsed)));

        // The code consumed at signup cannot log in; the next one can
        assert!(server
            .authenticate("bob", "pw", &data.hotp_codes[0])
            .await
            .is_err());
        assert!(server
            .authenticate("bob", "pw", &data.hotp_codes[1])
            .await
            .is_ok());

        assert!(events
            .events()
            .await
            .contains(&AuditEvent::UserSignup { user: "bob".into() }));
    }

    #[tokio::test]
    async fn test_signup_token_survives_failed_account_creation() {
        let store = Arc::new(MemoryStore::new());
        let server = AuthServer::new(
            AuthConfig {
                domain: DOMAIN.to_string(),
                password_cost: PasswordCost::minimal(),
                ..Default::default()
            },
            store.clone(),
            Arc::new(MemoryEventLog::new()),
            Arc::new(StandardPermissions),
        );
        let token = server
            .create_signup_token("erin", vec!["erin".into()])
            .await
            .unwrap();
        let data = server.signup_token_data(&token).await.unwrap();

        // Someone else claims the name between invite and redeem
        server.upsert_user("erin", vec![]).await.unwrap();
        let clash = server
            .redeem_signup_token(&token, "pw", &data.hotp_codes[0])
            .await;
        assert!(matches!(clash, Err(AuthError::AlreadyExists(_))));

        assert!(server.signup_token_data(&token).await.is_ok());
        assert!(store.delete("users/erin").await.unwrap());
        let session = server
            .redeem_signup_token(&token, "pw", &data.hotp_codes[0])
            .await
            .unwrap();
        assert_eq!(session.user, "erin");
    }

    #[tokio::test]
    async fn test_signup_unknown_token() {
        let (server, _) = server().await;
        assert!(matches!(
            server.signup_token_data("missing").await,
            Err(AuthError::TokenNotFound)
        ));
        assert!(matches!(
            server.redeem_signup_token("../x", "pw", "123456").await,
            Err(AuthError::TokenNotFound)
        ));
    }

    #[tokio::test]
    async fn test_signup_for_existing_user_rejected() {
        let (server, _) = server().await;
        user_with_password(&server).await;
        assert!(matches!(
            server.create_signup_token("alice", vec![]).await,
            Err(AuthError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_import_remote_authority() {
        let (server, _) = server().await;
        let (remote, _) = {
            let events = Arc::new(MemoryEventLog::new());
            let remote = AuthServer::new(
                AuthConfig {
                    domain: "remote.example".into(),
                    password_cost: PasswordCost::minimal(),
                    ..Default::default()
                },
                Arc::new(MemoryStore::new()),
                events.clone(),
                Arc::new(StandardPermissions),
            );
            remote
                .upsert_cert_authority("remote.example", CaClass::Host)
                .await
                .unwrap();
            (remote, events)
        };

        let cert = remote
            .issue_host_certificate(
                Role::Admin,
                HostCertRequest {
                    domain: "remote.example".into(),
                    host: "gateway".into(),
                    public_key: KeyPair::generate().public_key(),
                    role: Role::RemoteSite,
                    validity: Duration::ZERO,
                },
            )
            .await
            .unwrap();
        assert!(server
            .verify_certificate(&cert, &[Role::RemoteSite])
            .await
            .is_err());

        let bundle = remote.export_trust_bundle().await.unwrap();
        assert_eq!(server.import_authority(&bundle).await.unwrap(), 1);
        assert!(server
            .verify_certificate(&cert, &[Role::RemoteSite])
            .await
            .is_ok());
    }
}
