//! Error types for the PostgreSQL cluster controller

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::resources::exec::ExecError;
use crate::resources::repmgr_db::DatabaseError;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `ExecError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    #[error("repmgr database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("Remote command failed: {0}")]
    ExecError(#[from] ExecError),

    #[error("Nodes spec is empty, cannot choose a primary node")]
    EmptySpecError,

    #[error("Update still conflicting after {retries} retries: {source}")]
    ConflictError {
        retries: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Transient error (will retry): {0}")]
    TransientError(String),
}

impl Error {
    /// Check if this error indicates a resource was not found
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(e) => is_api_code(e, 404),
            _ => false,
        }
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(e) if is_api_code(e, 409) && !is_already_exists(e))
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::TransientError(_) => true,
            Error::DatabaseError(_) => true,
            Error::ExecError(_) => true,
            Error::ConflictError { .. } => true,
            Error::NotFound(_) => true,
            Error::FinalizerError(_) => true,
            // An empty spec stays empty until the user edits it
            Error::EmptySpecError => false,
            Error::InvalidConfig(_) => false,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
        }
    }
}

/// Whether a kube error is an API response with the given HTTP code
pub fn is_api_code(error: &kube::Error, code: u16) -> bool {
    matches!(error, kube::Error::Api(api_err) if api_err.code == code)
}

/// Whether a kube error reports that a created object already exists
pub fn is_already_exists(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(api_err) if api_err.code == 409 && api_err.reason == "AlreadyExists")
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the delay for an error, with different handling for retryable vs non-retryable
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            self.max_delay
        }
    }
}

/// Bounded retry policy for optimistic-concurrency conflicts
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Backoff between attempts
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_secs(1),
                multiplier: 2.0,
                jitter: 0.1,
            },
        }
    }
}

impl RetryConfig {
    /// A policy that retries immediately, used where timing is irrelevant
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: BackoffConfig {
                initial_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                multiplier: 1.0,
                jitter: 0.0,
            },
        }
    }
}

/// Run a read-modify-write operation, retrying while it hits conflicts.
///
/// Any non-conflict error is returned immediately. Exhausting the retries
/// yields [`Error::ConflictError`] wrapping the last conflict.
pub async fn retry_on_conflict<T, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_conflict() => {
                if attempt >= config.max_retries {
                    return Err(Error::ConflictError {
                        retries: attempt,
                        source: Box::new(e),
                    });
                }
                let delay = config.backoff.delay_for_attempt(attempt);
                debug!(attempt, ?delay, "Conflict, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
