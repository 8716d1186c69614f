use thiserror::Error;

/// Errors raised by the settlement pipeline.
///
/// The variants mirror the retry semantics at the webhook boundary:
/// authentication and validation failures must not be retried by the
/// provider (4xx), chain and storage failures should be (5xx), and
/// business rejections are recorded and acknowledged.
#[derive(Debug, Error)]
pub enum SettleError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("insufficient inventory: requested {requested}, available {available}")]
    InsufficientInventory { requested: u64, available: u64 },

    #[error("chain error: {0}")]
    Chain(String),

    /// A chain call timed out locally with the transaction possibly still in
    /// flight. Carries the submitted transaction hash when one is known so the
    /// reconciler can resolve the outcome later.
    #[error("chain call outcome unknown (tx: {tx_hash:?})")]
    ChainIndeterminate { tx_hash: Option<String> },

    #[error("state conflict: {0}")]
    StateConflict(String),

    /// The server is shedding load; the caller should retry later.
    #[error("overloaded: {0}")]
    Overloaded(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl SettleError {
    /// True when the provider should retry the delivery (transient failure on
    /// our side). Authentication, validation and business rejections are
    /// terminal for the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SettleError::Chain(_)
                | SettleError::ChainIndeterminate { .. }
                | SettleError::Storage(_)
                | SettleError::Overloaded(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_http_mapping() {
        assert!(SettleError::Chain("rpc down".into()).is_retryable());
        assert!(SettleError::ChainIndeterminate { tx_hash: None }.is_retryable());
        assert!(SettleError::Overloaded("lock map full".into()).is_retryable());

        assert!(!SettleError::Authentication("bad signature".into()).is_retryable());
        assert!(!SettleError::Validation("bad payload".into()).is_retryable());
        assert!(!SettleError::InsufficientInventory {
            requested: 10,
            available: 1
        }
        .is_retryable());
        assert!(!SettleError::StateConflict("terminal".into()).is_retryable());
    }
}
