use aqo_core::ErrorClass;
use thiserror::Error;

/// Errors returned by provider backends.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network or TLS failure from the underlying HTTP client.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A single attempt exceeded the provider's deadline.
    #[error("provider '{provider}' timed out after {timeout_ms} ms")]
    Timeout { provider: String, timeout_ms: u64 },

    /// HTTP 429. `retry_after_secs` is taken from the `Retry-After` header when present.
    #[error("provider '{provider}' rate limited the request")]
    RateLimited {
        provider: String,
        retry_after_secs: Option<u64>,
    },

    /// Non-retriable 4xx response (bad credentials, malformed request).
    #[error("provider '{provider}' rejected the request with HTTP {status}: {message}")]
    Rejected {
        provider: String,
        status: u16,
        message: String,
    },

    /// 5xx response.
    #[error("provider '{provider}' returned HTTP {status}")]
    Server { provider: String, status: u16 },

    /// The response body could not be deserialized into the expected type.
    #[error("JSON deserialization error for {context}: {source}")]
    Deserialize {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// The provider answered, but the answer itself reports a failure.
    #[error("provider '{provider}' reported a captured failure: {message}")]
    Captured { provider: String, message: String },

    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("async provider '{0}' has no status endpoint")]
    MissingStatusEndpoint(String),
}

impl ProviderError {
    /// Maps this failure onto the execution error taxonomy.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Http(e) if e.is_timeout() => ErrorClass::ProviderTimeout,
            ProviderError::Http(_) | ProviderError::Server { .. } => {
                ErrorClass::ProviderUnavailable
            }
            ProviderError::Timeout { .. } => ErrorClass::ProviderTimeout,
            ProviderError::RateLimited { .. } => ErrorClass::ProviderRateLimited,
            ProviderError::Captured { .. } => ErrorClass::CapturedFailure,
            ProviderError::Rejected { .. }
            | ProviderError::Deserialize { .. }
            | ProviderError::InvalidEndpoint { .. }
            | ProviderError::MissingStatusEndpoint(_) => ErrorClass::ProviderHardError,
        }
    }

    /// Returns `true` for errors that are worth retrying after a back-off delay.
    ///
    /// **Retriable:** network timeouts and connect failures, attempt
    /// deadlines, rate limits (the next attempt draws a different key) and
    /// 5xx responses.
    ///
    /// **Not retriable:** rejected requests, malformed bodies, captured
    /// failures and configuration problems. Retrying won't fix them.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            ProviderError::Http(e) => {
                e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| s.is_server_error())
            }
            ProviderError::Timeout { .. }
            | ProviderError::RateLimited { .. }
            | ProviderError::Server { .. } => true,
            ProviderError::Rejected { .. }
            | ProviderError::Deserialize { .. }
            | ProviderError::Captured { .. }
            | ProviderError::InvalidEndpoint { .. }
            | ProviderError::MissingStatusEndpoint(_) => false,
        }
    }

    /// HTTP 401/403: the key itself is bad, not the request.
    #[must_use]
    pub fn is_credential_error(&self) -> bool {
        matches!(
            self,
            ProviderError::Rejected {
                status: 401 | 403,
                ..
            }
        )
    }

    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}
