//! Error classification for outbound calls.
//!
//! A classifier turns the failure of one attempt into a [`Verdict`]: whether the attempt
//! may be retried, and whether it counts as a failure for the circuit breaker. Fatal
//! errors such as an invalid argument do not trip the breaker unless configured to.
//!
//! [`StatusClassifier`] decides from the structured status code of the error, never from
//! its message text.

use crate::error::Failure;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Canonical RPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    const ALL: [StatusCode; 17] = [
        StatusCode::Ok,
        StatusCode::Cancelled,
        StatusCode::Unknown,
        StatusCode::InvalidArgument,
        StatusCode::DeadlineExceeded,
        StatusCode::NotFound,
        StatusCode::AlreadyExists,
        StatusCode::PermissionDenied,
        StatusCode::ResourceExhausted,
        StatusCode::FailedPrecondition,
        StatusCode::Aborted,
        StatusCode::OutOfRange,
        StatusCode::Unimplemented,
        StatusCode::Internal,
        StatusCode::Unavailable,
        StatusCode::DataLoss,
        StatusCode::Unauthenticated,
    ];

    /// Map a numeric wire code; unrecognised values map to `None`.
    pub fn from_i32(code: i32) -> Option<Self> {
        usize::try_from(code).ok().and_then(|idx| Self::ALL.get(idx).copied())
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Implemented by transport errors that carry a structured status code.
pub trait HasStatusCode {
    fn status_code(&self) -> Option<StatusCode>;
}

/// A status-coded error returned by a remote procedure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct RpcStatus {
    pub code: StatusCode,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }
}

impl HasStatusCode for RpcStatus {
    fn status_code(&self) -> Option<StatusCode> {
        Some(self.code)
    }
}

/// Whether a failed attempt may be re-attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Retryable,
    Fatal,
}

/// Classification of one failed attempt plus its breaker accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub classification: Classification,
    /// Record the attempt as a failure in the breaker window.
    pub trips_breaker: bool,
}

impl Verdict {
    /// Retryable failures always count against the breaker.
    pub fn retryable() -> Self {
        Self { classification: Classification::Retryable, trips_breaker: true }
    }

    pub fn fatal(trips_breaker: bool) -> Self {
        Self { classification: Classification::Fatal, trips_breaker }
    }

    pub fn is_retryable(&self) -> bool {
        self.classification == Classification::Retryable
    }
}

/// Tagged result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome<T, E> {
    Success(T),
    Failure { verdict: Verdict, failure: Failure<E> },
}

impl<T, E> CallOutcome<T, E> {
    /// Classify the raw result of an attempt.
    pub fn from_result<C>(result: Result<T, Failure<E>>, classifier: &C) -> Self
    where
        C: ErrorClassifier<E> + ?Sized,
    {
        match result {
            Ok(value) => CallOutcome::Success(value),
            Err(failure) => {
                let verdict = classifier.classify(&failure);
                CallOutcome::Failure { verdict, failure }
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success(_))
    }

    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            CallOutcome::Success(_) => None,
            CallOutcome::Failure { verdict, .. } => Some(*verdict),
        }
    }
}

/// Maps a failed attempt to a [`Verdict`].
pub trait ErrorClassifier<E>: Send + Sync {
    fn classify(&self, failure: &Failure<E>) -> Verdict;
}

/// Which status codes are retryable, and which fatal ones still trip the breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub retryable: HashSet<StatusCode>,
    /// Fatal codes that still count as breaker failures.
    pub fatal_trips_breaker: HashSet<StatusCode>,
    /// How a per-attempt timeout is classified.
    pub timeout: Classification,
    /// Breaker accounting for errors that carry no status code at all.
    pub unknown_trips_breaker: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            retryable: HashSet::from([
                StatusCode::Unavailable,
                StatusCode::DeadlineExceeded,
                StatusCode::ResourceExhausted,
                StatusCode::Aborted,
            ]),
            fatal_trips_breaker: HashSet::new(),
            timeout: Classification::Retryable,
            unknown_trips_breaker: true,
        }
    }
}

impl ClassifierConfig {
    pub fn retry_on(mut self, code: StatusCode) -> Self {
        self.fatal_trips_breaker.remove(&code);
        self.retryable.insert(code);
        self
    }

    /// Treat `code` as fatal but still count it against the breaker.
    pub fn fatal_tripping(mut self, code: StatusCode) -> Self {
        self.retryable.remove(&code);
        self.fatal_trips_breaker.insert(code);
        self
    }

    pub fn timeout_classification(mut self, classification: Classification) -> Self {
        self.timeout = classification;
        self
    }
}

/// Classifier driven by the error's status code.
#[derive(Debug, Clone, Default)]
pub struct StatusClassifier {
    config: ClassifierConfig,
}

impl StatusClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    fn classify_code(&self, code: Option<StatusCode>) -> Verdict {
        match code {
            Some(code) if self.config.retryable.contains(&code) => Verdict::retryable(),
            Some(code) => Verdict::fatal(self.config.fatal_trips_breaker.contains(&code)),
            None => Verdict::fatal(self.config.unknown_trips_breaker),
        }
    }
}

impl<E: HasStatusCode> ErrorClassifier<E> for StatusClassifier {
    fn classify(&self, failure: &Failure<E>) -> Verdict {
        match failure {
            Failure::Timeout { .. } => match self.config.timeout {
                Classification::Retryable => Verdict::retryable(),
                Classification::Fatal => Verdict::fatal(true),
            },
            Failure::Call(e) => self.classify_code(e.status_code()),
        }
    }
}

/// Classifier backed by a closure, for call sites with ad-hoc rules.
#[derive(Clone)]
pub struct FnClassifier<F> {
    f: F,
}

impl<F> fmt::Debug for FnClassifier<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnClassifier").field("f", &"<closure>").finish()
    }
}

/// Build a classifier from a closure.
pub fn classifier_fn<E, F>(f: F) -> FnClassifier<F>
where
    F: Fn(&Failure<E>) -> Verdict + Send + Sync,
{
    FnClassifier { f }
}

impl<E, F> ErrorClassifier<E> for FnClassifier<F>
where
    F: Fn(&Failure<E>) -> Verdict + Send + Sync,
{
    fn classify(&self, failure: &Failure<E>) -> Verdict {
        (self.f)(failure)
    }
}
