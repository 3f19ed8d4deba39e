//! Shared error taxonomy. Every component returns `Result<T, OracleError>`
//! so the Job Engine can branch on retryability without knowing each
//! component's internal error shapes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("transient fetch failure: {0}")]
    TransientFetchFailure(String),

    #[error("permanent fetch failure: {0}")]
    PermanentFetchFailure(String),

    #[error("proof generation failed: {0}")]
    ProofGenerationFailure(String),

    #[error("proof generation timed out")]
    ProofTimeout,

    #[error("transaction rejected permanently: {0}")]
    TxRejectedPermanent(String),

    #[error("transaction timed out waiting for receipt")]
    TxTimeout,

    #[error("deep reorg detected beneath last safe block: {0}")]
    ReorgDetected(String),

    #[error("store failure: {0}")]
    Store(String),

    #[error("key not found: {namespace}/{key}")]
    NotFound { namespace: String, key: String },

    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    #[error("compute adapter unavailable")]
    ComputeUnavailable,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("chain decode error: {0}")]
    Decode(String),
}

impl OracleError {
    /// Whether the Job Engine should retry the job that produced this
    /// error (incrementing `attempts`) rather than dead-lettering it
    /// immediately.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            OracleError::TransientFetchFailure(_)
                | OracleError::TxTimeout
                | OracleError::ProofTimeout
                | OracleError::HandlerPanic(_)
        )
    }

    /// Whether this error should halt the whole process rather than
    /// just the job or handler that produced it.
    pub fn fatal(&self) -> bool {
        matches!(self, OracleError::Store(_) | OracleError::ReorgDetected(_))
    }
}
