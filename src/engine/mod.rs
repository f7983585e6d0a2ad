//! The scheduling-and-reply-reconciliation engine.
//!
//! Two independent periodic passes drive every message through its
//! lifecycle: the [`Dispatcher`] sends due `pending` messages and the
//! [`Reconciler`] looks for replies to `sent` ones. Both claim a row with a
//! conditional state update before acting on it, so any number of passes may
//! run concurrently against one store.

pub mod dispatcher;
pub mod observe;
pub mod reconciler;
pub mod runner;

use std::future::Future;
use std::time::Duration;

use crate::error::{DatabaseError, MailboxError};
use crate::store::{Database, RecoveryReport, libsql_backend::INTERRUPTED_SEND_REASON};

pub use dispatcher::{DispatchOutcome, DispatchReport, Dispatcher};
pub use observe::{FailureSink, StoreFailureSink, TracingFailureSink};
pub use reconciler::{CheckOutcome, ReconcileReport, Reconciler};
pub use runner::{EngineHandle, PeriodicPass, Shutdown, spawn_ticker};

/// Await a registry call, turning an elapsed budget into a transient error.
///
/// The call's own future is dropped on timeout; blocking work it spawned is
/// left to finish in the background.
pub async fn call_with_timeout<T>(
    budget: Duration,
    call: impl Future<Output = Result<T, MailboxError>>,
) -> Result<T, MailboxError> {
    match tokio::time::timeout(budget, call).await {
        Ok(result) => result,
        Err(_) => Err(MailboxError::timed_out(budget)),
    }
}

/// Release claims left by an interrupted run and report each abandoned
/// send to `failures` exactly once. Run before the engine starts.
pub async fn recover_interrupted(
    store: &dyn Database,
    failures: &dyn FailureSink,
) -> Result<RecoveryReport, DatabaseError> {
    let report = store.recover_interrupted_claims().await?;
    for id in &report.abandoned_sends {
        failures.record_failure(*id, INTERRUPTED_SEND_REASON).await;
    }
    Ok(report)
}
