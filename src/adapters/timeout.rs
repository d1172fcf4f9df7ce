//! Time budgets for adapter operations

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::error::{EngineError, EngineResult};

/// Run `op` on a worker thread and wait at most `budget` for it
///
/// The worker is detached on timeout. Adapter calls cannot be interrupted,
/// so it keeps running until the call returns and its result is discarded.
/// A retry therefore may overlap with the abandoned attempt.
pub fn run_with_timeout<T, F>(operation: &str, budget: Duration, op: F) -> EngineResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> EngineResult<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("adapter-{operation}"))
        .spawn(move || {
            // The receiver is gone after a timeout
            let _ = tx.send(op());
        })
        .map_err(EngineError::Io)?;

    match rx.recv_timeout(budget) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(EngineError::Timeout {
            operation: operation.to_string(),
            budget_ms: budget.as_millis() as u64,
        }),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(EngineError::Storage(format!(
            "worker for '{operation}' exited without a result"
        ))),
    }
}

/// Call `attempt` once more if the first call timed out
///
/// Inputs are deterministic, so a second timeout is reported rather than
/// retried again.
pub fn retry_on_timeout<T, F>(operation: &str, mut attempt: F) -> EngineResult<T>
where
    F: FnMut() -> EngineResult<T>,
{
    match attempt() {
        Err(err @ EngineError::Timeout { .. }) => {
            warn!(operation, error = %err, "Operation timed out, retrying once");
            attempt()
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_run_with_timeout_ok() {
        let value = run_with_timeout("quick", Duration::from_secs(5), || Ok(7)).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_run_with_timeout_expires() {
        let result: EngineResult<()> = run_with_timeout("slow", Duration::from_millis(20), || {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        assert!(matches!(result, Err(EngineError::Timeout { budget_ms: 20, .. })));
    }

    #[test]
    fn test_retry_once_then_report() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result: EngineResult<()> = retry_on_timeout("probe", || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::Timeout {
                operation: "probe".into(),
                budget_ms: 1,
            })
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_recovers() {
        let mut first = true;
        let result = retry_on_timeout("probe", || {
            if std::mem::take(&mut first) {
                Err(EngineError::Timeout {
                    operation: "probe".into(),
                    budget_ms: 1,
                })
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
    }

    #[test]
    fn test_other_errors_not_retried() {
        let mut calls = 0;
        let result: EngineResult<()> = retry_on_timeout("read", || {
            calls += 1;
            Err(EngineError::Storage("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
