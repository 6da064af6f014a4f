//! The four steps of a two-phase transaction.
//!
//! Each step sleeps for a configurable latency to stand in for the real
//! ledger call and records every invocation in a shared [`TransactionLedger`].
//! Failures can be injected per step to exercise the remedial paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{Activity, ActivityError, ActivityRegistry};
use crate::core::errors::Result;
use crate::transaction::Transaction;

pub const REGISTER_TRANSACTION_ID: &str = "RegisterTransactionID";
pub const INIT_TRANSACTION: &str = "InitTransaction";
pub const CANCEL_TRANSACTION: &str = "CancelTransaction";
pub const COMPLETE_TRANSACTION: &str = "CompleteTransaction";

/// Simulated latency of each step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLatencies {
    pub register: Duration,
    pub init: Duration,
    pub cancel: Duration,
    pub complete: Duration,
}

impl Default for TransactionLatencies {
    fn default() -> Self {
        Self {
            register: Duration::from_millis(10),
            init: Duration::from_millis(10),
            cancel: Duration::from_millis(10),
            complete: Duration::from_millis(100),
        }
    }
}

impl TransactionLatencies {
    pub fn zero() -> Self {
        Self {
            register: Duration::ZERO,
            init: Duration::ZERO,
            cancel: Duration::ZERO,
            complete: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub activity: String,
    pub transaction_id: String,
    pub succeeded: bool,
    pub at: DateTime<Utc>,
}

/// Shared record of what the transaction steps did.
#[derive(Debug, Default)]
pub struct TransactionLedger {
    registered: DashMap<String, DateTime<Utc>>,
    entries: DashMap<String, Vec<LedgerEntry>>,
    faults: DashMap<String, ActivityError>,
}

impl TransactionLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_registered(&self, transaction_id: &str) -> bool {
        self.registered.contains_key(transaction_id)
    }

    /// Number of invocations of `activity` for `transaction_id`, including failed ones.
    pub fn count(&self, activity: &str, transaction_id: &str) -> usize {
        self.entries
            .get(transaction_id)
            .map(|e| e.iter().filter(|entry| entry.activity == activity).count())
            .unwrap_or(0)
    }

    pub fn entries(&self, transaction_id: &str) -> Vec<LedgerEntry> {
        self.entries
            .get(transaction_id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Make every subsequent call of `activity` fail with `error`.
    pub fn inject_failure(&self, activity: &str, error: ActivityError) {
        self.faults.insert(activity.to_string(), error);
    }

    pub fn clear_failure(&self, activity: &str) {
        self.faults.remove(activity);
    }

    fn record(&self, activity: &str, transaction_id: &str, succeeded: bool) {
        self.entries
            .entry(transaction_id.to_string())
            .or_default()
            .push(LedgerEntry {
                activity: activity.to_string(),
                transaction_id: transaction_id.to_string(),
                succeeded,
                at: Utc::now(),
            });
    }

    fn injected(&self, activity: &str) -> Option<ActivityError> {
        self.faults.get(activity).map(|f| f.value().clone())
    }
}

/// Run the shared part of a step: sleep, honour injected faults, record.
async fn run_step(
    ledger: &TransactionLedger,
    activity: &str,
    latency: Duration,
    tx: &Transaction,
) -> std::result::Result<(), ActivityError> {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
    if let Some(err) = ledger.injected(activity) {
        ledger.record(activity, &tx.id, false);
        return Err(err);
    }
    ledger.record(activity, &tx.id, true);
    Ok(())
}

pub struct RegisterTransactionId {
    ledger: Arc<TransactionLedger>,
    latency: Duration,
}

#[async_trait]
impl Activity for RegisterTransactionId {
    fn name(&self) -> &str {
        REGISTER_TRANSACTION_ID
    }

    async fn execute(&self, tx: &Transaction) -> std::result::Result<(), ActivityError> {
        run_step(&self.ledger, REGISTER_TRANSACTION_ID, self.latency, tx).await?;
        self.ledger.registered.entry(tx.id.clone()).or_insert_with(Utc::now);
        info!(transaction_id = %tx.id, "Transaction ID registered");
        Ok(())
    }
}

pub struct InitTransaction {
    ledger: Arc<TransactionLedger>,
    latency: Duration,
}

#[async_trait]
impl Activity for InitTransaction {
    fn name(&self) -> &str {
        INIT_TRANSACTION
    }

    async fn execute(&self, tx: &Transaction) -> std::result::Result<(), ActivityError> {
        if let Err(e) = tx.validate() {
            self.ledger.record(INIT_TRANSACTION, &tx.id, false);
            return Err(ActivityError::rejected(INIT_TRANSACTION, e.to_string()));
        }
        run_step(&self.ledger, INIT_TRANSACTION, self.latency, tx).await?;
        info!(transaction_id = %tx.id, amount = tx.amount, "Transaction initialized");
        Ok(())
    }
}

pub struct CancelTransaction {
    ledger: Arc<TransactionLedger>,
    latency: Duration,
}

#[async_trait]
impl Activity for CancelTransaction {
    fn name(&self) -> &str {
        CANCEL_TRANSACTION
    }

    async fn execute(&self, tx: &Transaction) -> std::result::Result<(), ActivityError> {
        run_step(&self.ledger, CANCEL_TRANSACTION, self.latency, tx).await?;
        info!(transaction_id = %tx.id, "Transaction cancelled");
        Ok(())
    }
}

pub struct CompleteTransaction {
    ledger: Arc<TransactionLedger>,
    latency: Duration,
}

#[async_trait]
impl Activity for CompleteTransaction {
    fn name(&self) -> &str {
        COMPLETE_TRANSACTION
    }

    async fn execute(&self, tx: &Transaction) -> std::result::Result<(), ActivityError> {
        run_step(&self.ledger, COMPLETE_TRANSACTION, self.latency, tx).await?;
        info!(transaction_id = %tx.id, "Transaction completed");
        Ok(())
    }
}

/// Register all four transaction steps against one ledger.
pub fn register_all(
    registry: &ActivityRegistry,
    ledger: Arc<TransactionLedger>,
    latencies: &TransactionLatencies,
) -> Result<()> {
    registry.register(Arc::new(RegisterTransactionId {
        ledger: Arc::clone(&ledger),
        latency: latencies.register,
    }))?;
    registry.register(Arc::new(InitTransaction {
        ledger: Arc::clone(&ledger),
        latency: latencies.init,
    }))?;
    registry.register(Arc::new(CancelTransaction {
        ledger: Arc::clone(&ledger),
        latency: latencies.cancel,
    }))?;
    registry.register(Arc::new(CompleteTransaction {
        ledger,
        latency: latencies.complete,
    }))?;
    Ok(())
}
