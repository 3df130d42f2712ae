//! cf-auth: Credential authority for the cluster fabric
//!
//! Two certificate authorities exist per site domain: one signs user
//! certificates, the other host certificates, so either trust root can rotate
//! without disturbing the other. Certificates are the only artifact trusted
//! between hosts and from users to hosts. Bearer sessions guard the request
//! layer and never substitute for a certificate.

pub mod authority;
pub mod cert;
pub mod checker;
pub mod error;
pub mod keys;
pub mod otp;
pub mod password;
pub mod records;
pub mod roles;
pub mod server;
mod store;

pub use authority::{CaClass, CertAuthority};
pub use cert::{CertKind, Certificate, CertificateBody};
pub use checker::{CertChecker, Identity, TrustBundle};
pub use error::{AuthError, CertError};
pub use keys::KeyPair;
pub use roles::{Action, Permissions, Role, StandardPermissions};
pub use server::{
    AuthConfig, AuthServer, HostCertRequest, PasswordSetup, SessionInfo, SignupTokenData,
    UserCertRequest, UserInvite, WebSession,
};
