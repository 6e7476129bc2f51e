use crate::error::LimitError;
use crate::rate_limit::bucket::{RateLimiter, RateLimiterConfig};
use crate::rate_limit::key::LimiterKey;
use crate::rate_limit::registry::RateLimiterRegistry;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// Who is calling which route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    /// Empty means "unidentified"; such requests are not limited.
    pub caller_id: String,
    pub method: String,
    pub path: String,
}

/// Derives the limiter identity of an inbound request.
pub trait KeyExtractor<Req>: Send + Sync {
    fn extract(&self, req: &Req) -> RequestIdentity;
}

impl<Req, F> KeyExtractor<Req> for F
where
    F: Fn(&Req) -> RequestIdentity + Send + Sync,
{
    fn extract(&self, req: &Req) -> RequestIdentity {
        self(req)
    }
}

/// What to do with a request when the limiter backend (store or lock) fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendFailurePolicy {
    /// Let the request through.
    FailOpen,
    /// Reject the request with [`RateLimitRejection::Backend`].
    #[default]
    FailClosed,
}

/// Error returned by [`RateLimitService`].
#[derive(Debug)]
pub enum RateLimitRejection<E> {
    /// The caller's bucket is empty.
    Limited { retry_after: Duration },
    /// The limiter could not decide.
    Backend(LimitError),
    /// The wrapped service failed.
    Inner(E),
}

impl<E> RateLimitRejection<E> {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Limited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Whole seconds for a `Retry-After` header.
    pub fn retry_after_header(&self) -> Option<String> {
        self.retry_after().map(|d| format!("{:.0}", d.as_secs_f64()))
    }
}

impl<E: fmt::Display> fmt::Display for RateLimitRejection<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited { retry_after } => {
                write!(f, "rate limit exceeded, retry after {:?}", retry_after)
            }
            Self::Backend(e) => write!(f, "rate limiter unavailable: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RateLimitRejection<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend(e) => Some(e),
            Self::Inner(e) => Some(e),
            Self::Limited { .. } => None,
        }
    }
}

/// Tower layer limiting inbound requests per caller and route.
pub struct RateLimitLayer<K> {
    registry: Arc<RateLimiterRegistry>,
    prefix: Arc<str>,
    config: RateLimiterConfig,
    extractor: Arc<K>,
    on_backend_failure: BackendFailurePolicy,
}

impl<K> Clone for RateLimitLayer<K> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            prefix: self.prefix.clone(),
            config: self.config,
            extractor: self.extractor.clone(),
            on_backend_failure: self.on_backend_failure,
        }
    }
}

impl<K> RateLimitLayer<K> {
    pub fn new(
        registry: Arc<RateLimiterRegistry>,
        prefix: impl Into<Arc<str>>,
        config: RateLimiterConfig,
        extractor: K,
    ) -> Self {
        Self {
            registry,
            prefix: prefix.into(),
            config,
            extractor: Arc::new(extractor),
            on_backend_failure: BackendFailurePolicy::default(),
        }
    }

    pub fn on_backend_failure(mut self, policy: BackendFailurePolicy) -> Self {
        self.on_backend_failure = policy;
        self
    }
}

impl<S, K> Layer<S> for RateLimitLayer<K> {
    type Service = RateLimitService<S, K>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService { inner, layer: self.clone() }
    }
}

/// Middleware service that enforces rate limits.
pub struct RateLimitService<S, K> {
    inner: S,
    layer: RateLimitLayer<K>,
}

impl<S: Clone, K> Clone for RateLimitService<S, K> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<S, K, Req> Service<Req> for RateLimitService<S, K>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    K: KeyExtractor<Req> + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = RateLimitRejection<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(RateLimitRejection::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let identity = self.layer.extractor.extract(&req);
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if identity.caller_id.is_empty() {
            return Box::pin(async move { inner.call(req).await.map_err(RateLimitRejection::Inner) });
        }

        let key = LimiterKey::new(
            self.layer.prefix.as_ref(),
            identity.caller_id,
            identity.method,
            identity.path,
        );
        let limiter = self.layer.registry.get_or_create(key.clone(), self.layer.config);
        let policy = self.layer.on_backend_failure;

        Box::pin(async move {
            match limiter.limit().await {
                Ok(()) => {}
                Err(LimitError::RateLimitExceeded { retry_after }) => {
                    return Err(RateLimitRejection::Limited { retry_after });
                }
                Err(error) if error.is_backend_failure() && policy == BackendFailurePolicy::FailOpen => {
                    tracing::warn!(target: "reelguard::rate_limit", key = %key, %error, "limiter unavailable, failing open");
                }
                Err(error) => {
                    tracing::warn!(target: "reelguard::rate_limit", key = %key, %error, "limiter unavailable, rejecting");
                    return Err(RateLimitRejection::Backend(error));
                }
            }
            inner.call(req).await.map_err(RateLimitRejection::Inner)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::rate_limit::store::InMemoryStore;
    use futures::future::{ready, Ready};
    use std::convert::Infallible;
    use tower::service_fn;
    use tower::util::ServiceFn;
    use tower::ServiceExt;

    #[derive(Clone)]
    struct Request {
        caller: &'static str,
    }

    fn layer(store: &InMemoryStore) -> RateLimitLayer<impl KeyExtractor<Request>> {
        let registry = RateLimiterRegistry::builder(Arc::new(store.clone()))
            .bucket_clock(MonotonicClock::default())
            .build()
            .unwrap();
        RateLimitLayer::new(Arc::new(registry), "movie", RateLimiterConfig::default(), |r: &Request| {
            RequestIdentity {
                caller_id: r.caller.to_string(),
                method: "GET".into(),
                path: "/movies".into(),
            }
        })
    }

    fn echo_ok(_req: Request) -> Ready<Result<&'static str, Infallible>> {
        ready(Ok("ok"))
    }

    fn echo() -> ServiceFn<fn(Request) -> Ready<Result<&'static str, Infallible>>> {
        service_fn(echo_ok as fn(Request) -> Ready<Result<&'static str, Infallible>>)
    }

    #[tokio::test(start_paused = true)]
    async fn third_request_is_limited_with_retry_after() {
        let store = InMemoryStore::new();
        let svc = layer(&store).layer(echo());

        for _ in 0..2 {
            let resp = svc.clone().oneshot(Request { caller: "10.0.0.1" }).await.unwrap();
            assert_eq!(resp, "ok");
        }
        let err = svc.clone().oneshot(Request { caller: "10.0.0.1" }).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(err.retry_after_header().as_deref(), Some("3"));

        // another caller has its own bucket
        assert!(svc.oneshot(Request { caller: "10.0.0.2" }).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_caller_is_not_limited() {
        let store = InMemoryStore::new();
        let svc = layer(&store).layer(echo());
        for _ in 0..5 {
            assert!(svc.clone().oneshot(Request { caller: "" }).await.is_ok());
        }
        assert_eq!(store.live_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backend_failure_policy() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);

        let closed = layer(&store).layer(echo());
        let err = closed.oneshot(Request { caller: "a" }).await.unwrap_err();
        assert!(matches!(err, RateLimitRejection::Backend(LimitError::BackendUnavailable(_))));

        let open = layer(&store).on_backend_failure(BackendFailurePolicy::FailOpen).layer(echo());
        assert_eq!(open.oneshot(Request { caller: "a" }).await.unwrap(), "ok");
    }
}
