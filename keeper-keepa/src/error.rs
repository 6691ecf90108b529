use thiserror::Error;

/// Error taxonomy of the external price API client. Callers branch on these
/// variants: exhausted tokens are retried at the next loop iteration, a
/// denied deal endpoint flips the process to product-query fallback, and
/// malformed responses surface without retry.
#[derive(Debug, Error)]
pub enum KeepaError {
    #[error("invalid product code: {0} (must be 10 alphanumeric characters)")]
    InvalidAsin(String),

    #[error("timed out after {waited_secs}s waiting for {cost} tokens")]
    TokensExhausted { cost: u32, waited_secs: u64 },

    #[error("deal endpoint not available for this access tier")]
    DealAccessDenied,

    #[error("upstream throttled the request (429)")]
    Throttled,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("unexpected response shape: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for KeepaError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            KeepaError::UpstreamUnavailable(e.to_string())
        } else if e.is_decode() {
            KeepaError::InvalidResponse(e.to_string())
        } else {
            KeepaError::UpstreamUnavailable(e.to_string())
        }
    }
}

pub type KeepaResult<T> = Result<T, KeepaError>;
