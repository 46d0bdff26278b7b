//! Role-based authorization of RPC calls.
//!
//! Callers are identified by the DNS names in their client certificate's
//! subject alternative names. Each name is a role, and each role maps to a
//! set of permissions in the [`PolicyStore`].

pub mod identity;
pub mod policy;

pub use identity::roles_from_certificate;
pub use policy::{methods, AuthorizationGate, PolicyStore};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthzError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("no peer certificate presented")]
    MissingCertificate,

    #[error("invalid peer certificate: {0}")]
    InvalidCertificate(String),
}
