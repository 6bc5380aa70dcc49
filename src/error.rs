//! Error types shared across the resilience layer.
//!
//! Failure taxonomy:
//! - transient network (timeout, reset, refused): always retryable
//! - provider rejected (4xx other than 429/408): never retryable
//! - rate limited (429/408): retryable under the default and aggressive policies
//! - circuit open: admission denied before any network call
//! - unavailable: every fallback exhausted and no cache of any age
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Network-level failure kinds reported by an [`HttpClient`](crate::http::HttpClient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkErrorKind {
    /// Per-call timeout elapsed (treated like a connection abort).
    Timeout,
    ConnectionRefused,
    ConnectionAborted,
    ConnectionReset,
    /// DNS resolution failed.
    HostNotFound,
    Other,
}

impl NetworkErrorKind {
    /// Stable tag written to the call log.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::ConnectionRefused => "CONNECTION_REFUSED",
            Self::ConnectionAborted => "CONNECTION_ABORTED",
            Self::ConnectionReset => "CONNECTION_RESET",
            Self::HostNotFound => "HOST_NOT_FOUND",
            Self::Other => "NETWORK_ERROR",
        }
    }
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Coarse classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    TransientNetwork,
    /// HTTP 5xx.
    ServerError,
    /// HTTP 429 or 408.
    RateLimited,
    /// Any other 4xx.
    ProviderRejected,
    /// The provider answered but the body could not be used.
    Malformed,
}

/// Failure of a single provider call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("network error ({kind}): {message}")]
    Network { kind: NetworkErrorKind, message: String },
    #[error("provider responded with HTTP {status}")]
    Status { status: u16, body: Option<String> },
    #[error("malformed provider response: {0}")]
    Decode(String),
    #[error("provider misconfigured: {0}")]
    Misconfigured(String),
}

impl ProviderError {
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self::Network { kind, message: message.into() }
    }

    pub fn status(status: u16) -> Self {
        Self::Status { status, body: None }
    }

    /// HTTP status code, if the provider answered at all.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn network_kind(&self) -> Option<NetworkErrorKind> {
        match self {
            Self::Network { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Network { .. } => ErrorClass::TransientNetwork,
            Self::Status { status, .. } => match *status {
                429 | 408 => ErrorClass::RateLimited,
                s if s >= 500 => ErrorClass::ServerError,
                _ => ErrorClass::ProviderRejected,
            },
            Self::Decode(_) | Self::Misconfigured(_) => ErrorClass::Malformed,
        }
    }

    /// Error tag written to the call log (`HTTP_503`, `TIMEOUT`, ...).
    pub fn error_type(&self) -> String {
        match self {
            Self::Network { kind, .. } => kind.as_tag().to_string(),
            Self::Status { status, .. } => format!("HTTP_{status}"),
            Self::Decode(_) => "DECODE_ERROR".to_string(),
            Self::Misconfigured(_) => "MISCONFIGURED".to_string(),
        }
    }
}

/// Persistence failure from one of the store traits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound { entity, key: key.into() }
    }
}

/// Error returned by [`CircuitBreaker::execute`](crate::CircuitBreaker::execute).
///
/// `Inner` carries the operation's own error unchanged, so callers can tell "we did not even
/// try" (`CircuitOpen`) from "we tried and failed" (`Inner`).
#[derive(Debug, Clone, Error)]
pub enum ResilienceError<E> {
    /// Admission denied before the operation ran.
    #[error("circuit breaker open for provider '{provider}'")]
    CircuitOpen { provider: String, open_until: Option<DateTime<Utc>> },
    /// The health store could not be consulted, so admission could not be decided.
    #[error("circuit breaker store failure: {0}")]
    Store(#[source] StoreError),
    /// The underlying operation failed
    #[error(transparent)]
    Inner(E),
}

impl<E> ResilienceError<E> {
    /// Check if this error is due to circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Access the open-until timestamp of a circuit-open rejection.
    pub fn open_until(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::CircuitOpen { open_until, .. } => *open_until,
            _ => None,
        }
    }
}

/// Why one provider in the fallback chain did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub provider: String,
    pub reason: String,
}

/// Terminal error of the resilient fetch pipeline.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Fresh cache, every provider and the stale cache were all exhausted.
    #[error("{class} unavailable for '{fingerprint}': all providers failed and no cached data is available")]
    Unavailable {
        class: String,
        fingerprint: String,
        /// The original request parameters.
        params: BTreeMap<String, String>,
        attempts: Vec<AttemptFailure>,
    },
    /// A result was obtained but lacks the requested item (e.g. an unknown currency).
    #[error("{class} '{fingerprint}' has no entry for '{item}'")]
    Missing { class: String, fingerprint: String, item: String },
    /// The cache could not be read, so no decision could be made.
    #[error("cache lookup failed: {0}")]
    Store(#[from] StoreError),
}

impl FetchError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Original request parameters carried by an `Unavailable` error.
    pub fn params(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::Unavailable { params, .. } => Some(params),
            _ => None,
        }
    }
}
