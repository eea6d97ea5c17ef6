//! Tower middleware that admits or rejects requests through a [`RateLimiter`].
//!
//! The layer does not know how to read a request. A [`Classify`] implementation supplies
//! the caller's identifier, tier, applicable limits, and cost; the limiter decides.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tower_layer::Layer;
use tower_service::Service;

use crate::error::RateLimitError;
use crate::limiter::RateLimiter;
use crate::types::{Identifier, LimitConfig, RateLimitResult};

/// Everything the limiter needs to know about one request.
#[derive(Debug, Clone)]
pub struct Admission {
    pub identifier: Identifier,
    pub tier: String,
    pub limits: Arc<[LimitConfig]>,
    pub cost: f64,
}

/// Resolves a request into an [`Admission`].
pub trait Classify<Req>: Send + Sync {
    fn classify(&self, request: &Req) -> Admission;
}

impl<Req, F> Classify<Req> for F
where
    F: Fn(&Req) -> Admission + Send + Sync,
{
    fn classify(&self, request: &Req) -> Admission {
        self(request)
    }
}

/// Error returned by [`RateLimitService`].
#[derive(Debug, Error)]
pub enum LimitedError<E> {
    /// The request was denied; the result carries `retry_after` and the answer's source.
    #[error("rate limited (retry after {:?}, source: {})", .0.retry_after, .0.source)]
    Denied(RateLimitResult),
    /// The admission could not be evaluated (unknown tier, bad limit or cost).
    #[error(transparent)]
    Configuration(RateLimitError),
    #[error(transparent)]
    Inner(E),
}

impl<E> LimitedError<E> {
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied(_))
    }

    pub fn denial(&self) -> Option<&RateLimitResult> {
        match self {
            Self::Denied(result) => Some(result),
            _ => None,
        }
    }
}

/// A layer that enforces rate limits using a [`RateLimiter`].
#[derive(Debug)]
pub struct RateLimitLayer<C> {
    limiter: RateLimiter,
    classifier: Arc<C>,
}

impl<C> Clone for RateLimitLayer<C> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), classifier: Arc::clone(&self.classifier) }
    }
}

impl<C> RateLimitLayer<C> {
    pub fn new(limiter: RateLimiter, classifier: C) -> Self {
        Self { limiter, classifier: Arc::new(classifier) }
    }
}

impl<S, C> Layer<S> for RateLimitLayer<C> {
    type Service = RateLimitService<S, C>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            classifier: Arc::clone(&self.classifier),
        }
    }
}

/// Middleware service that enforces rate limits.
#[derive(Debug)]
pub struct RateLimitService<S, C> {
    inner: S,
    limiter: RateLimiter,
    classifier: Arc<C>,
}

impl<S: Clone, C> Clone for RateLimitService<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            classifier: Arc::clone(&self.classifier),
        }
    }
}

impl<S, C, Req> Service<Req> for RateLimitService<S, C>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    C: Classify<Req> + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = LimitedError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(LimitedError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let admission = self.classifier.classify(&req);
        let limiter = self.limiter.clone();
        // Keep the service that was polled ready; leave a fresh clone in its place.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let result = limiter
                .check_and_consume(&admission.identifier, &admission.tier, &admission.limits, admission.cost)
                .await
                .map_err(LimitedError::Configuration)?;
            if !result.allowed {
                return Err(LimitedError::Denied(result));
            }
            if result.is_degraded() {
                tracing::debug!(identifier = %admission.identifier, "admitted in degraded mode");
            }
            inner.call(req).await.map_err(LimitedError::Inner)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;
    use crate::types::Criticality;
    use std::convert::Infallible;
    use tower::{service_fn, ServiceExt};

    fn admission(user: &str) -> Admission {
        Admission {
            identifier: Identifier::user(user),
            tier: "pro".into(),
            limits: Arc::from(vec![LimitConfig::new("api", 2.0, 1.0, 60).with_criticality(Criticality::Critical)]),
            cost: 1.0,
        }
    }

    fn limiter() -> RateLimiter {
        let clock = ManualClock::starting_at(0);
        RateLimiter::builder(InMemoryStore::with_clock(clock.clone())).clock(clock).build().unwrap()
    }

    #[tokio::test]
    async fn admits_until_the_bucket_is_empty() {
        let layer = RateLimitLayer::new(limiter(), |req: &&'static str| admission(req));
        let svc = layer.layer(service_fn(|req: &'static str| async move { Ok::<_, Infallible>(req.len()) }));

        assert_eq!(svc.clone().oneshot("alice").await.unwrap(), 5);
        assert_eq!(svc.clone().oneshot("alice").await.unwrap(), 5);
        let err = svc.clone().oneshot("alice").await.unwrap_err();
        assert!(err.is_denied());
        assert_eq!(err.denial().unwrap().retry_after, Some(std::time::Duration::from_secs(1)));

        // Other callers have their own buckets.
        assert!(svc.oneshot("bob").await.is_ok());
    }

    #[tokio::test]
    async fn configuration_errors_are_distinguishable() {
        let layer = RateLimitLayer::new(limiter(), |_: &()| Admission { tier: "gold".into(), ..admission("x") });
        let svc = layer.layer(service_fn(|_: ()| async { Ok::<_, Infallible>(()) }));
        let err = svc.oneshot(()).await.unwrap_err();
        assert!(matches!(err, LimitedError::Configuration(_)));
        assert_eq!(err.to_string(), "unknown tier 'gold'");
    }

    #[tokio::test]
    async fn inner_errors_pass_through() {
        let layer = RateLimitLayer::new(limiter(), |_: &()| admission("y"));
        let svc = layer.layer(service_fn(|_: ()| async { Err::<(), _>(std::io::Error::other("boom")) }));
        let err = svc.oneshot(()).await.unwrap_err();
        assert!(matches!(err, LimitedError::Inner(_)));
    }
}
