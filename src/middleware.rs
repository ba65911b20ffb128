//! Generic tower middleware exposing the guard to any service stack.
//!
//! The HTTP framework binding stays outside this crate: a request type opts
//! in by implementing [`ProtectedRequest`], and a response type receives the
//! pipeline's headers through [`ProtectedResponse`].

use crate::context::ProtectionContext;
use crate::error::GuardError;
use crate::guard::Guard;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Extracts the immutable per-request context from a framework request.
pub trait ProtectedRequest {
    fn protection_context(&self) -> ProtectionContext;
}

/// Receives the pipeline's response headers.
pub trait ProtectedResponse {
    fn apply_header(&mut self, name: &str, value: &str);
}

/// A layer that runs every request through a [`Guard`].
#[derive(Clone)]
pub struct ShieldLayer {
    guard: Arc<Guard>,
}

impl ShieldLayer {
    pub fn new(guard: Arc<Guard>) -> Self {
        Self { guard }
    }
}

impl<S> Layer<S> for ShieldLayer {
    type Service = ShieldService<S>;

    fn layer(&self, service: S) -> Self::Service {
        ShieldService { inner: service, guard: self.guard.clone() }
    }
}

/// Middleware service enforcing the protection pipeline.
#[derive(Clone)]
pub struct ShieldService<S> {
    inner: S,
    guard: Arc<Guard>,
}

impl<S, Req> Service<Req> for ShieldService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: ProtectedResponse + Send + 'static,
    S::Error: Send + 'static,
    Req: ProtectedRequest + Send + 'static,
{
    type Response = S::Response;
    type Error = GuardError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::Handler)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let guard = self.guard.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let ctx = req.protection_context();
            let protected = guard
                .protect(&ctx, move || async move { inner.call(req).await })
                .await?;
            let mut response = protected.value;
            for (name, value) in &protected.headers {
                response.apply_header(name, value);
            }
            Ok(response)
        })
    }
}
