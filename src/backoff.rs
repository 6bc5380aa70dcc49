//! Backoff policy: retry eligibility and delay for a given attempt.
//!
//! Attempt semantics: attempt `0` is the initial call; the retry executor asks for
//! `delay(attempt + 1)` before re-running a failed attempt. Delays are exponential,
//! `min(max_delay, base_delay * 2^attempt)`, plus jitter (additive `[0, 100ms]` by default).
//! Computations that would overflow saturate to [`MAX_BACKOFF`].
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use bulwark::{BackoffPolicy, FailureSignal, Jitter};
//!
//! let policy = BackoffPolicy::default_policy().with_jitter(Jitter::None);
//! assert_eq!(policy.delay(1), Duration::from_millis(400));
//! assert_eq!(policy.delay(10), Duration::from_millis(2000)); // capped
//! assert!(policy.should_retry(0, &FailureSignal::http(503)));
//! assert!(!policy.should_retry(0, &FailureSignal::http(400)));
//! ```

use crate::error::{NetworkErrorKind, ProviderError};
use crate::jitter::Jitter;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// What a failed attempt looked like, as far as retry eligibility is concerned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureSignal {
    /// HTTP status, when the provider answered.
    pub status: Option<u16>,
    /// Network failure kind, when it did not.
    pub network: Option<NetworkErrorKind>,
}

impl FailureSignal {
    pub fn http(status: u16) -> Self {
        Self { status: Some(status), network: None }
    }

    pub fn network(kind: NetworkErrorKind) -> Self {
        Self { status: None, network: Some(kind) }
    }
}

/// Errors that can describe themselves as a [`FailureSignal`].
pub trait Classify {
    fn failure_signal(&self) -> FailureSignal;
}

impl Classify for ProviderError {
    fn failure_signal(&self) -> FailureSignal {
        FailureSignal { status: self.status_code(), network: self.network_kind() }
    }
}

/// Retry eligibility rule.
#[derive(Clone)]
pub enum RetryOn {
    /// Timeouts, refused, aborted or reset connections, DNS failures, HTTP 5xx and 429.
    /// Never other 4xx and never unclassified network errors.
    Transient,
    /// HTTP 5xx only.
    ServerErrors,
    /// Any network failure, plus HTTP 5xx, 429 and 408.
    TransientAndTimeouts,
    /// Caller-supplied predicate.
    Custom(Arc<dyn Fn(&FailureSignal) -> bool + Send + Sync>),
}

impl RetryOn {
    pub fn matches(&self, signal: &FailureSignal) -> bool {
        match self {
            RetryOn::Transient => match signal.status {
                Some(status) => status >= 500 || status == 429,
                None => matches!(
                    signal.network,
                    Some(
                        NetworkErrorKind::Timeout
                            | NetworkErrorKind::ConnectionRefused
                            | NetworkErrorKind::ConnectionAborted
                            | NetworkErrorKind::ConnectionReset
                            | NetworkErrorKind::HostNotFound
                    )
                ),
            },
            RetryOn::ServerErrors => signal.status.is_some_and(|s| s >= 500),
            RetryOn::TransientAndTimeouts => match signal.status {
                Some(status) => status >= 500 || status == 429 || status == 408,
                None => signal.network.is_some(),
            },
            RetryOn::Custom(predicate) => predicate(signal),
        }
    }
}

impl fmt::Debug for RetryOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryOn::Transient => f.write_str("Transient"),
            RetryOn::ServerErrors => f.write_str("ServerErrors"),
            RetryOn::TransientAndTimeouts => f.write_str("TransientAndTimeouts"),
            RetryOn::Custom(_) => f.write_str("Custom(<predicate>)"),
        }
    }
}

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    MaxMustBePositive,
    MaxLessThanBase { base: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::MaxMustBePositive => write!(f, "max_delay must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max_delay ({:?}) must be >= base_delay ({:?})", max, base)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

/// Immutable retry/backoff configuration, passed explicitly to the retry executor.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    retries: usize,
    base_delay: Duration,
    max_delay: Duration,
    jitter: Jitter,
    retry_on: RetryOn,
}

impl BackoffPolicy {
    /// Build a policy retrying on transient failures; `max_delay` must be >= `base_delay`.
    pub fn new(
        retries: usize,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Result<Self, BackoffError> {
        if max_delay.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max_delay < base_delay {
            return Err(BackoffError::MaxLessThanBase { base: base_delay, max: max_delay });
        }
        Ok(Self { retries, base_delay, max_delay, jitter: Jitter::additive(), retry_on: RetryOn::Transient })
    }

    /// 3 retries, 200ms base, 2s cap; network failures, 5xx and 429.
    pub fn default_policy() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(2000),
            jitter: Jitter::additive(),
            retry_on: RetryOn::Transient,
        }
    }

    /// 2 retries, 500ms base, 3s cap; 5xx only.
    pub fn conservative() -> Self {
        Self {
            retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(3000),
            jitter: Jitter::additive(),
            retry_on: RetryOn::ServerErrors,
        }
    }

    /// 5 retries, 100ms base, 5s cap; network failures, 5xx, 429 and 408.
    pub fn aggressive() -> Self {
        Self {
            retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            jitter: Jitter::additive(),
            retry_on: RetryOn::TransientAndTimeouts,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self { retries: 0, ..Self::default_policy() }
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retry_on(mut self, retry_on: RetryOn) -> Self {
        self.retry_on = retry_on;
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Number of retries after the initial attempt.
    pub fn retries(&self) -> usize {
        self.retries
    }

    pub fn base(&self) -> Duration {
        self.base_delay
    }

    pub fn max(&self) -> Duration {
        self.max_delay
    }

    /// Whether a failure on `attempt` (0-based) may be followed by another attempt.
    pub fn should_retry(&self, attempt: usize, signal: &FailureSignal) -> bool {
        attempt < self.retries && self.retry_on.matches(signal)
    }

    /// Exponential delay before `attempt`, capped at `max_delay`, without jitter.
    pub fn base_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let nanos = self.base_delay.as_nanos().saturating_mul(multiplier);
        let exp_delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        exp_delay.min(self.max_delay).min(MAX_BACKOFF)
    }

    /// Delay before `attempt`: capped exponential delay plus jitter.
    pub fn delay(&self, attempt: usize) -> Duration {
        self.jitter.apply(self.base_delay(attempt))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::default_policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_doubles_then_caps() {
        let policy = BackoffPolicy::default_policy().with_jitter(Jitter::None);
        assert_eq!(policy.delay(0), Duration::from_millis(200));
        assert_eq!(policy.delay(1), Duration::from_millis(400));
        assert_eq!(policy.delay(2), Duration::from_millis(800));
        assert_eq!(policy.delay(3), Duration::from_millis(1600));
        assert_eq!(policy.delay(4), Duration::from_millis(2000)); // capped
        assert_eq!(policy.delay(40), Duration::from_millis(2000));
    }

    #[test]
    fn jitter_is_added_after_the_cap() {
        let policy = BackoffPolicy::default_policy();
        for _ in 0..100 {
            let delay = policy.delay(10);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay <= Duration::from_millis(2100));
        }
    }

    #[test]
    fn default_policy_retries_transient_failures() {
        let policy = BackoffPolicy::default_policy();
        assert!(policy.should_retry(0, &FailureSignal::http(500)));
        assert!(policy.should_retry(0, &FailureSignal::http(503)));
        assert!(policy.should_retry(0, &FailureSignal::http(429)));
        assert!(policy.should_retry(0, &FailureSignal::network(NetworkErrorKind::ConnectionRefused)));
        assert!(policy.should_retry(0, &FailureSignal::network(NetworkErrorKind::Timeout)));
        assert!(policy.should_retry(0, &FailureSignal::network(NetworkErrorKind::HostNotFound)));
    }

    #[test]
    fn default_policy_never_retries_client_errors() {
        let policy = BackoffPolicy::default_policy();
        for status in [400, 401, 403, 404, 408, 422] {
            assert!(!policy.should_retry(0, &FailureSignal::http(status)), "status {status}");
        }
        assert!(!policy.should_retry(0, &FailureSignal::default()));
    }

    #[test]
    fn default_policy_skips_unclassified_network_errors() {
        let policy = BackoffPolicy::default_policy();
        assert!(policy.should_retry(0, &FailureSignal::network(NetworkErrorKind::ConnectionReset)));
        assert!(policy.should_retry(0, &FailureSignal::network(NetworkErrorKind::ConnectionAborted)));
        assert!(!policy.should_retry(0, &FailureSignal::network(NetworkErrorKind::Other)));
        assert!(BackoffPolicy::aggressive()
            .should_retry(0, &FailureSignal::network(NetworkErrorKind::Other)));
    }

    #[test]
    fn conservative_policy_only_retries_server_errors() {
        let policy = BackoffPolicy::conservative();
        assert_eq!(policy.retries(), 2);
        assert!(policy.should_retry(0, &FailureSignal::http(502)));
        assert!(!policy.should_retry(0, &FailureSignal::http(429)));
        assert!(!policy.should_retry(0, &FailureSignal::network(NetworkErrorKind::Timeout)));
    }

    #[test]
    fn aggressive_policy_includes_request_timeout() {
        let policy = BackoffPolicy::aggressive();
        assert_eq!(policy.retries(), 5);
        assert!(policy.should_retry(0, &FailureSignal::http(408)));
        assert!(policy.should_retry(0, &FailureSignal::http(429)));
        assert!(policy.should_retry(0, &FailureSignal::network(NetworkErrorKind::Other)));
        assert!(!policy.should_retry(0, &FailureSignal::default()));
        assert!(!policy.should_retry(0, &FailureSignal::http(404)));
    }

    #[test]
    fn no_retry_once_attempts_are_spent() {
        let policy = BackoffPolicy::default_policy();
        assert!(policy.should_retry(2, &FailureSignal::http(500)));
        assert!(!policy.should_retry(3, &FailureSignal::http(500)));
        assert!(!BackoffPolicy::no_retry().should_retry(0, &FailureSignal::http(500)));
    }

    #[test]
    fn custom_predicate_is_consulted() {
        let policy = BackoffPolicy::default_policy()
            .with_retry_on(RetryOn::Custom(Arc::new(|s| s.status == Some(418))));
        assert!(policy.should_retry(0, &FailureSignal::http(418)));
        assert!(!policy.should_retry(0, &FailureSignal::http(500)));
    }

    #[test]
    fn provider_errors_classify_into_signals() {
        let signal = ProviderError::status(503).failure_signal();
        assert_eq!(signal, FailureSignal::http(503));
        let signal = ProviderError::network(NetworkErrorKind::ConnectionReset, "rst").failure_signal();
        assert_eq!(signal, FailureSignal::network(NetworkErrorKind::ConnectionReset));
    }

    #[test]
    fn new_validates_bounds() {
        assert_eq!(
            BackoffPolicy::new(3, Duration::from_millis(10), Duration::ZERO).unwrap_err(),
            BackoffError::MaxMustBePositive
        );
        assert!(matches!(
            BackoffPolicy::new(3, Duration::from_secs(5), Duration::from_secs(1)),
            Err(BackoffError::MaxLessThanBase { .. })
        ));
        let ok = BackoffPolicy::new(1, Duration::from_millis(10), Duration::from_millis(50)).unwrap();
        assert_eq!(ok.retries(), 1);
    }

    #[test]
    fn very_large_attempt_saturates() {
        let policy = BackoffPolicy::new(1, Duration::from_secs(2), MAX_BACKOFF * 2)
            .unwrap()
            .with_jitter(Jitter::None);
        assert_eq!(policy.delay(usize::MAX), MAX_BACKOFF);
    }
}
