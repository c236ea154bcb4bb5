use bitcoin::Amount;

/// Failures of the JSON-RPC transport used by the chain backend.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server error {code}: {message}")]
    ServerError { code: i64, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("batch response missing item with id {id}")]
    MissingBatchItem { id: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InputValidation(String),

    #[error("insufficient funds: target {target} (allocations plus fee) exceeds available {available}")]
    InsufficientFunds { target: Amount, available: Amount },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("signing failed for input {input}: {message}")]
    SigningFailure { input: usize, message: String },

    #[error("broadcast rejected: {0}")]
    BroadcastFailure(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("nothing to cancel: plan {0} has no pending transaction")]
    NothingToCancel(String),

    #[error("execution conflict: {0}")]
    ExecutionConflict(String),

    #[error("RPC communication failure: {0}")]
    Rpc(#[from] RpcError),

    #[error("collaborator call failed: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}
