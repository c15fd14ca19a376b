use concord_storage::StorageError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Identity verification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("No blockchain configuration for agent {0}")]
    NotConfigured(String),

    #[error("Blockchain ID mismatch for agent {0}")]
    Mismatch(String),
}

/// Decision oracle failures. Runners treat every variant as "no decision".
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("oracle request failed: {0}")]
    Transport(String),

    #[error("oracle returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("unparseable oracle output: {0}")]
    Parse(String),

    #[error("invalid decision payload: {0}")]
    InvalidPayload(String),

    #[error("oracle call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Engine errors.
///
/// Gate failures surface as statuses on the operation outcomes. They appear
/// here only where a caller needs the cause, e.g. when registering agents.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("reputation {score} below threshold {threshold}")]
    ReputationTooLow { score: u32, threshold: u32 },

    #[error("no eligible voters")]
    NoEligibleVoters,

    #[error("storage error: {0}")]
    Store(#[from] StorageError),

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error("not found: {0}")]
    NotFound(String),
}

impl EngineError {
    /// Whether a retry may succeed. Transient failures leave the item for
    /// the stale sweep.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_transient(),
            EngineError::Timeout { .. } => true,
            _ => false,
        }
    }
}
