//! The transaction entity and the business outcomes of running it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::activity::ActivityError;

/// Status string carried by a successful phase-1 result.
pub const STATUS_INITIALIZED: &str = "Initialization successful";
/// Status string carried by a completed instance.
pub const STATUS_COMPLETED: &str = "Transaction completed";

/// A two-phase money transfer. `id` doubles as the orchestration instance id
/// and the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub source_account: String,
    pub target_account: String,
    /// Amount in minor currency units
    pub amount: i64,
}

impl Transaction {
    pub fn new(
        id: impl Into<String>,
        source_account: impl Into<String>,
        target_account: impl Into<String>,
        amount: i64,
    ) -> Self {
        Self {
            id: id.into(),
            source_account: source_account.into(),
            target_account: target_account.into(),
            amount,
        }
    }

    /// Transaction with a freshly generated id.
    pub fn generate(
        source_account: impl Into<String>,
        target_account: impl Into<String>,
        amount: i64,
    ) -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            source_account,
            target_account,
            amount,
        )
    }

    /// Copy of this transaction under a different id.
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..self.clone()
        }
    }

    /// Check the preconditions for initialization.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if self.amount <= 0 {
            return Err(ValidationError::InvalidAmount(self.amount));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("transaction id must not be empty")]
    EmptyId,
    #[error("invalid Amount: {0}")]
    InvalidAmount(i64),
}

/// Result value returned by the update handler and by a completed instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResult {
    pub transaction_id: String,
    pub status: String,
}

impl TxResult {
    pub fn initialized(transaction_id: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            status: STATUS_INITIALIZED.to_string(),
        }
    }

    pub fn completed(transaction_id: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            status: STATUS_COMPLETED.to_string(),
        }
    }
}

/// Terminal failure of an instance.
///
/// `InitFailed` is a business rejection: the transaction never took effect
/// and was cleanly cancelled. The other two are operational failures that
/// need follow-up outside the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum TransactionError {
    #[error("{0}")]
    InitFailed(ActivityError),

    #[error("cancelling the transaction failed: {cause}")]
    CancellationFailed {
        init_error: ActivityError,
        cause: ActivityError,
    },

    #[error("completing the transaction failed: {0}")]
    CompletionFailed(ActivityError),
}

/// How a caller should react to a [`TransactionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// Init rejected the transaction; nothing to undo.
    BusinessRejection,
    /// The remedial cancel step failed; needs out-of-band follow-up.
    CancellationFailed,
    /// Completion failed after a successful init; state must be reconciled.
    CompletionFailed,
}

impl TransactionError {
    pub fn classification(&self) -> FailureClass {
        match self {
            Self::InitFailed(_) => FailureClass::BusinessRejection,
            Self::CancellationFailed { .. } => FailureClass::CancellationFailed,
            Self::CompletionFailed(_) => FailureClass::CompletionFailed,
        }
    }

    /// The phase-1 error, when phase 1 is what failed.
    pub fn init_error(&self) -> Option<&ActivityError> {
        match self {
            Self::InitFailed(err) => Some(err),
            Self::CancellationFailed { init_error, .. } => Some(init_error),
            Self::CompletionFailed(_) => None,
        }
    }

    /// The underlying activity error surfaced as the phase-2 outcome.
    pub fn cause(&self) -> &ActivityError {
        match self {
            Self::InitFailed(err) => err,
            Self::CancellationFailed { cause, .. } => cause,
            Self::CompletionFailed(err) => err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_validate_amount() {
        let tx = Transaction::new("t1", "Bob", "Alice", 100);
        assert!(tx.validate().is_ok());

        assert_eq!(
            tx.with_id("t2").validate(),
            Ok(())
        );
        let zero = Transaction::new("t2", "Bob", "Alice", 0);
        assert_eq!(zero.validate(), Err(ValidationError::InvalidAmount(0)));

        let negative = Transaction::new("t3", "Bob", "Alice", -5);
        assert!(negative.validate().is_err());

        let empty = Transaction::new("  ", "Bob", "Alice", 5);
        assert_eq!(empty.validate(), Err(ValidationError::EmptyId));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = Transaction::generate("Bob", "Alice", 1);
        let b = Transaction::generate("Bob", "Alice", 1);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_error_classification() {
        let rejected = ActivityError::rejected("InitTransaction", "invalid Amount: 0");
        let failed = ActivityError::execution_failed("CancelTransaction", "ledger offline");

        let init = TransactionError::InitFailed(rejected.clone());
        assert_eq!(init.classification(), FailureClass::BusinessRejection);
        assert_eq!(init.init_error(), Some(&rejected));

        let cancel = TransactionError::CancellationFailed {
            init_error: rejected.clone(),
            cause: failed.clone(),
        };
        assert_eq!(cancel.classification(), FailureClass::CancellationFailed);
        assert_eq!(cancel.cause(), &failed);
        assert_eq!(cancel.init_error(), Some(&rejected));
        assert!(cancel
            .to_string()
            .starts_with("cancelling the transaction failed"));

        let complete = TransactionError::CompletionFailed(failed);
        assert_eq!(complete.classification(), FailureClass::CompletionFailed);
        assert!(complete.init_error().is_none());
    }
}
