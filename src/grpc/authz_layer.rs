//! Tower layer that authorizes every call before it reaches the service.
//!
//! tonic interceptors do not see the method being called, so authorization
//! sits one level lower, on the HTTP request: the gRPC method is the URI path
//! and the verified client certificate is in the TLS connect info that tonic
//! stores in the request extensions.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tonic::body::BoxBody;
use tonic::codegen::http::{Extensions, Request, Response};
use tonic::transport::server::{TcpConnectInfo, TlsConnectInfo};
use tonic::Status;
use tower::{Layer, Service};

use crate::authz::{roles_from_certificate, AuthorizationGate, AuthzError};

type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

#[derive(Debug, Clone)]
pub struct AuthzLayer {
    gate: Arc<AuthorizationGate>,
}

impl AuthzLayer {
    pub fn new(gate: Arc<AuthorizationGate>) -> Self {
        Self { gate }
    }
}

impl<S> Layer<S> for AuthzLayer {
    type Service = AuthzService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthzService {
            inner,
            gate: self.gate.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthzService<S> {
    inner: S,
    gate: Arc<AuthorizationGate>,
}

impl<S, B> Service<Request<B>> for AuthzService<S>
where
    S: Service<Request<B>, Response = Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response<BoxBody>;
    type Error = S::Error;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let method = req.uri().path();

        match authorize(&self.gate, method, req.extensions()) {
            Ok(()) => {
                // Call the instance that was driven to readiness and leave a
                // fresh clone in its place.
                let clone = self.inner.clone();
                let mut inner = std::mem::replace(&mut self.inner, clone);
                Box::pin(inner.call(req))
            }
            Err(reason) => {
                tracing::debug!(method, %reason, "Call denied");
                let response = Status::permission_denied(AuthzError::Unauthorized.to_string())
                    .into_http();
                Box::pin(async move { Ok(response) })
            }
        }
    }
}

/// Authorize a request given its method path and extensions.
pub fn authorize(
    gate: &AuthorizationGate,
    method: &str,
    extensions: &Extensions,
) -> Result<(), AuthzError> {
    let certs = extensions
        .get::<TlsConnectInfo<TcpConnectInfo>>()
        .and_then(|info| info.peer_certs())
        .ok_or(AuthzError::MissingCertificate)?;
    let leaf = certs.first().ok_or(AuthzError::MissingCertificate)?;

    let roles = roles_from_certificate(leaf.as_ref())?;
    gate.authorize(method, &roles)
}
