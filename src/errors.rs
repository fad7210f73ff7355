// =============================================================================
// Crate-wide error kinds (spec §7)
// =============================================================================
//
// `EngineError` is the typed boundary every core subsystem returns through.
// I/O-heavy modules (the Binance adapter, the in-memory datastore) keep using
// `anyhow::Result` internally the way the teacher's `binance::client` module
// does, and convert to `EngineError` at the seam where a core subsystem
// consumes the result — the conversions below encode that seam.
//
// `RiskDenied` from the original spec is deliberately NOT a variant here: a
// risk-manager refusal is a normal control-flow outcome (`TradeDecision`),
// never propagated as an `Err`.
// =============================================================================

use crate::types::TenantId;

/// Classification of an `ExchangeError`. `transient` kinds (rate limits,
/// 5xx, network timeouts) are retryable by the *caller's* explicit decision
/// — `OrderManager` itself never retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeErrorKind {
    RateLimited,
    ServerError,
    Timeout,
    Rejected,
    UnknownOrder,
    Other,
}

impl ExchangeErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeErrorKind::RateLimited | ExchangeErrorKind::ServerError | ExchangeErrorKind::Timeout
        )
    }

    /// Classify an HTTP status the way spec §7 requires: 429 and 5xx are
    /// transient, other 4xx are permanent.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            429 => ExchangeErrorKind::RateLimited,
            500..=599 => ExchangeErrorKind::ServerError,
            400..=499 => ExchangeErrorKind::Rejected,
            _ => ExchangeErrorKind::Other,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("exchange error ({kind:?}, status {http_status:?}): {message}")]
    Exchange {
        kind: ExchangeErrorKind,
        http_status: Option<u16>,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("no engine for tenant {0}")]
    NotFound(TenantId),

    #[error("engine already exists for tenant {0}")]
    AlreadyExists(TenantId),
}

impl EngineError {
    pub fn transient(&self) -> bool {
        matches!(self, EngineError::Exchange { kind, .. } if kind.is_transient())
    }

    pub fn exchange(kind: ExchangeErrorKind, http_status: Option<u16>, message: impl Into<String>) -> Self {
        EngineError::Exchange { kind, http_status, message: message.into() }
    }

    /// Wrap an opaque `anyhow::Error` surfaced by an I/O boundary (HTTP call,
    /// datastore write) as an `Internal` engine error, preserving its chain
    /// in the rendered message the way `anyhow::Context` does.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        EngineError::Internal(format!("{err:#}"))
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::from_anyhow(err)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_429_is_transient() {
        assert!(ExchangeErrorKind::from_http_status(429).is_transient());
    }

    #[test]
    fn status_500_is_transient() {
        assert!(ExchangeErrorKind::from_http_status(503).is_transient());
    }

    #[test]
    fn status_400_is_permanent() {
        assert!(!ExchangeErrorKind::from_http_status(400).is_transient());
    }
}
