//! Failover classification.
//!
//! When a provider fails, the orchestrator asks this module whether switching
//! to another provider could help. Rate limits, outages, network trouble and
//! missing credentials trigger failover; malformed requests and everything
//! that isn't a provider error do not.

use std::fmt;
use tandem_core::{Error, ProviderError};

/// Why a provider was abandoned. Reported in `provider.fallback` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverReason {
    RateLimited,
    Network,
    Timeout,
    Unavailable,
    Auth,
    NotConfigured,
    ModelNotFound,
    StreamInterrupted,
}

impl FailoverReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::Auth => "auth",
            Self::NotConfigured => "not_configured",
            Self::ModelNotFound => "model_not_found",
            Self::StreamInterrupted => "stream_interrupted",
        }
    }
}

impl fmt::Display for FailoverReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a run error. `Some(reason)` means another provider may succeed.
pub fn classify(error: &Error) -> Option<FailoverReason> {
    match error {
        Error::Provider(e) => classify_provider_error(e),
        _ => None,
    }
}

fn classify_provider_error(error: &ProviderError) -> Option<FailoverReason> {
    match error {
        ProviderError::RateLimited { .. } => Some(FailoverReason::RateLimited),
        ProviderError::Network(_) => Some(FailoverReason::Network),
        ProviderError::Timeout(_) => Some(FailoverReason::Timeout),
        ProviderError::AuthenticationFailed(_) => Some(FailoverReason::Auth),
        ProviderError::NotConfigured(_) => Some(FailoverReason::NotConfigured),
        ProviderError::ModelNotFound(_) => Some(FailoverReason::ModelNotFound),
        ProviderError::StreamInterrupted(_) => Some(FailoverReason::StreamInterrupted),
        ProviderError::ApiError { status_code, .. } => match status_code {
            429 => Some(FailoverReason::RateLimited),
            408 => Some(FailoverReason::Timeout),
            401 | 403 => Some(FailoverReason::Auth),
            500..=599 => Some(FailoverReason::Unavailable),
            _ => None,
        },
        ProviderError::InvalidRequest(_) => None,
    }
}
