use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;

use crate::authz::AuthzError;

/// Full gRPC paths of the worker service methods.
pub mod methods {
    pub const START: &str = "/worker.WorkerService/Start";
    pub const STOP: &str = "/worker.WorkerService/Stop";
    pub const QUERY: &str = "/worker.WorkerService/Query";
    pub const STREAM: &str = "/worker.WorkerService/Stream";

    pub const ALL: [&str; 4] = [START, STOP, QUERY, STREAM];
}

pub const READ: &str = "read";
pub const WRITE: &str = "write";

/// Role and method permission tables.
///
/// A role grants a set of permissions; a method requires at least one
/// permission out of its set. Methods absent from the table are denied to
/// everyone.
///
/// When deserialized, a table left out of the input is empty; the built-in
/// tables of [`PolicyStore::default`] are never merged in.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PolicyStore {
    #[serde(default)]
    roles: HashMap<String, HashSet<String>>,
    #[serde(default)]
    methods: HashMap<String, HashSet<String>>,
}

impl PolicyStore {
    /// A store with no roles and no methods. Denies every call.
    pub fn empty() -> Self {
        Self {
            roles: HashMap::new(),
            methods: HashMap::new(),
        }
    }

    pub fn with_role<I, P>(mut self, role: impl Into<String>, permissions: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.roles.insert(
            role.into(),
            permissions.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn with_method<I, P>(mut self, method: impl Into<String>, permissions: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.methods.insert(
            method.into(),
            permissions.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn role_permissions(&self, role: &str) -> Option<&HashSet<String>> {
        self.roles.get(role)
    }

    pub fn method_permissions(&self, method: &str) -> Option<&HashSet<String>> {
        self.methods.get(method)
    }
}

/// `read` may Query and Stream; `write` may additionally Start and Stop.
impl Default for PolicyStore {
    fn default() -> Self {
        Self::empty()
            .with_role(READ, [READ])
            .with_role(WRITE, [READ, WRITE])
            .with_method(methods::START, [WRITE])
            .with_method(methods::STOP, [WRITE])
            .with_method(methods::QUERY, [READ])
            .with_method(methods::STREAM, [READ])
    }
}

/// Decides whether a set of caller roles may invoke a method.
#[derive(Debug, Clone)]
pub struct AuthorizationGate {
    policy: Arc<PolicyStore>,
}

impl AuthorizationGate {
    pub fn new(policy: Arc<PolicyStore>) -> Self {
        Self { policy }
    }

    pub fn authorize<S: AsRef<str>>(&self, method: &str, roles: &[S]) -> Result<(), AuthzError> {
        let Some(required) = self.policy.method_permissions(method) else {
            tracing::debug!(method, "No permissions configured for method");
            return Err(AuthzError::Unauthorized);
        };

        let granted = roles
            .iter()
            .filter_map(|role| self.policy.role_permissions(role.as_ref()))
            .any(|permissions| !permissions.is_disjoint(required));

        if granted {
            Ok(())
        } else {
            tracing::debug!(
                method,
                roles = ?roles.iter().map(AsRef::as_ref).collect::<Vec<_>>(),
                "No role grants a required permission"
            );
            Err(AuthzError::Unauthorized)
        }
    }
}
