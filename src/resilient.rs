//! Resilient outbound calls: retry around circuit breaker around per-attempt timeout.
//!
//! Each attempt asks the breaker for a permit, runs the call under the timeout, classifies
//! the result, and reports it to the breaker. The retry policy then decides whether to
//! back off and try again. A breaker rejection ends the sequence immediately with
//! [`ResilienceError::CircuitOpen`].
//!
//! ```rust
//! use reelguard::{ResilientCallWrapper, RpcStatus};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let movies = ResilientCallWrapper::builder("movie-service").build();
//! let title = movies
//!     .invoke(|| async { Ok::<_, RpcStatus>("Heat".to_string()) })
//!     .await
//!     .unwrap();
//! assert_eq!(title, "Heat");
//! # });
//! ```

use crate::classify::{CallOutcome, ErrorClassifier, StatusClassifier};
use crate::{CircuitBreakerPolicy, Failure, ResilienceError, RetryPolicy, TimeoutPolicy};
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Composed retry, breaker, and timeout policies for one downstream dependency.
///
/// Cheap to clone; clones share the breaker.
pub struct ResilientCallWrapper<C = StatusClassifier> {
    name: Arc<str>,
    retry: RetryPolicy,
    breaker: CircuitBreakerPolicy,
    timeout: TimeoutPolicy,
    classifier: Arc<C>,
}

impl<C> Clone for ResilientCallWrapper<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            retry: self.retry.clone(),
            breaker: self.breaker.clone(),
            timeout: self.timeout,
            classifier: self.classifier.clone(),
        }
    }
}

impl<C> fmt::Debug for ResilientCallWrapper<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientCallWrapper")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field("breaker", &self.breaker)
            .field("timeout", &self.timeout.duration())
            .finish()
    }
}

impl ResilientCallWrapper<StatusClassifier> {
    pub fn builder(name: impl Into<Arc<str>>) -> ResilientCallWrapperBuilder<StatusClassifier> {
        ResilientCallWrapperBuilder {
            name: name.into(),
            retry: RetryPolicy::default(),
            breaker: None,
            timeout: TimeoutPolicy::default(),
            classifier: StatusClassifier::default(),
        }
    }
}

impl<C> ResilientCallWrapper<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreakerPolicy {
        &self.breaker
    }

    /// Run `call` with retries, breaker protection and a per-attempt timeout.
    ///
    /// `call` is invoked once per attempt. Dropping the returned future cancels the attempt
    /// in flight and any pending backoff.
    pub async fn invoke<T, E, F, Fut>(&self, mut call: F) -> Result<T, ResilienceError<E>>
    where
        C: ErrorClassifier<E>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let name = &self.name;
        let timeout = self.timeout;
        let classifier = self.classifier.as_ref();

        self.retry
            .execute(|attempt| {
                let admitted = self.breaker.try_acquire().map(|permit| (permit, call()));
                async move {
                    let (permit, fut) = match admitted {
                        Ok(admitted) => admitted,
                        Err(open) => {
                            tracing::debug!(
                                target: "reelguard::resilient",
                                service = %name,
                                attempt,
                                remaining_ms = open.remaining.as_millis() as u64,
                                "rejected by open circuit"
                            );
                            return Err(ResilienceError::from(open));
                        }
                    };
                    let outcome = CallOutcome::from_result(timeout.execute(fut).await, classifier);
                    match &outcome {
                        CallOutcome::Success(_) => permit.record_success(),
                        CallOutcome::Failure { verdict, failure } => {
                            tracing::debug!(
                                target: "reelguard::resilient",
                                service = %name,
                                attempt,
                                timeout = failure.is_timeout(),
                                retryable = verdict.is_retryable(),
                                "attempt failed"
                            );
                            permit.record(verdict.trips_breaker);
                        }
                    }
                    Ok(outcome)
                }
            })
            .await
    }
}

/// Builder for [`ResilientCallWrapper`]. Unset parts use the documented defaults.
pub struct ResilientCallWrapperBuilder<C> {
    name: Arc<str>,
    retry: RetryPolicy,
    breaker: Option<CircuitBreakerPolicy>,
    timeout: TimeoutPolicy,
    classifier: C,
}

impl<C> ResilientCallWrapperBuilder<C> {
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Share an existing breaker; otherwise each wrapper gets its own.
    pub fn breaker(mut self, breaker: CircuitBreakerPolicy) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn classifier<C2>(self, classifier: C2) -> ResilientCallWrapperBuilder<C2> {
        ResilientCallWrapperBuilder {
            name: self.name,
            retry: self.retry,
            breaker: self.breaker,
            timeout: self.timeout,
            classifier,
        }
    }

    pub fn build(self) -> ResilientCallWrapper<C> {
        let breaker = self
            .breaker
            .unwrap_or_else(|| CircuitBreakerPolicy::default().named(self.name.clone()));
        ResilientCallWrapper {
            name: self.name,
            retry: self.retry,
            breaker,
            timeout: self.timeout,
            classifier: Arc::new(self.classifier),
        }
    }
}

/// Tower layer applying a [`ResilientCallWrapper`] to every request.
///
/// Requests must be `Clone` since each attempt sends its own copy.
pub struct ResilientCallLayer<C = StatusClassifier> {
    wrapper: ResilientCallWrapper<C>,
}

impl<C> ResilientCallLayer<C> {
    pub fn new(wrapper: ResilientCallWrapper<C>) -> Self {
        Self { wrapper }
    }
}

impl<C> Clone for ResilientCallLayer<C> {
    fn clone(&self) -> Self {
        Self { wrapper: self.wrapper.clone() }
    }
}

impl<S, C> Layer<S> for ResilientCallLayer<C> {
    type Service = ResilientCallService<S, C>;

    fn layer(&self, inner: S) -> Self::Service {
        ResilientCallService { inner, wrapper: self.wrapper.clone() }
    }
}

/// Service produced by [`ResilientCallLayer`].
pub struct ResilientCallService<S, C = StatusClassifier> {
    inner: S,
    wrapper: ResilientCallWrapper<C>,
}

impl<S: Clone, C> Clone for ResilientCallService<S, C> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), wrapper: self.wrapper.clone() }
    }
}

impl<S, C, Req> Service<Req> for ResilientCallService<S, C>
where
    Req: Clone + Send + 'static,
    S: Service<Req> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    S::Future: Send + 'static,
    C: ErrorClassifier<S::Error> + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(|e| ResilienceError::Fatal(Failure::Call(e)))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let wrapper = self.wrapper.clone();
        let inner = self.inner.clone();
        // take the service that was driven to readiness
        let mut inner = std::mem::replace(&mut self.inner, inner);
        Box::pin(async move { wrapper.invoke(move || inner.call(req.clone())).await })
    }
}
