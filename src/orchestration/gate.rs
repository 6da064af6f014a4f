//! One-shot readiness gate between an instance's main flow and its update
//! handlers.

use tokio::sync::watch;

use crate::activity::ActivityError;

pub type InitOutcome = Result<(), ActivityError>;

/// Holds the phase-1 outcome once the main flow has produced it.
///
/// The main flow is the only writer. Any number of handlers may wait; a
/// waiter that arrives after the write sees the stored value immediately.
pub struct InitGate {
    tx: watch::Sender<Option<InitOutcome>>,
}

impl Default for InitGate {
    fn default() -> Self {
        Self::new()
    }
}

impl InitGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Gate that is already open, used when replaying a finished phase 1.
    pub fn ready(outcome: InitOutcome) -> Self {
        let (tx, _) = watch::channel(Some(outcome));
        Self { tx }
    }

    /// Store the phase-1 outcome and wake every waiter. Must be called once.
    pub fn signal_ready(&self, outcome: InitOutcome) {
        let previous = self.tx.send_replace(Some(outcome));
        debug_assert!(previous.is_none(), "init gate signalled twice");
    }

    /// Wait for the phase-1 outcome.
    pub async fn await_ready(&self) -> InitOutcome {
        let mut rx = self.tx.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or(Ok(())),
            // Unreachable while `self` is alive: the sender lives in the gate.
            Err(_) => Err(ActivityError::unavailable("InitTransaction", "init gate closed")),
        };
        outcome
    }

    pub fn is_ready(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn outcome(&self) -> Option<InitOutcome> {
        self.tx.borrow().clone()
    }
}
