//! Compensating action log.
//!
//! Side effects that a resource's own rollback cannot reverse (an external
//! notification, a file moved, a remote registration) register an undo action
//! here. On scope rollback the log replays newest-first, so effects unwind in
//! the opposite order they were applied.

use std::error::Error;
use std::fmt;

use tracing::error;

/// Boxed error raised by a failed undo.
pub type UndoError = Box<dyn Error + Send + Sync + 'static>;

/// A caller-supplied reversal for a side effect already applied outside the
/// write resource's own rollback.
pub trait UndoableAction: Send {
    /// Short name used in diagnostics and failure reports.
    fn name(&self) -> &str;

    /// Reverse the side effect.
    fn undo(&mut self) -> Result<(), UndoError>;
}

/// One failed compensation from a rollback replay.
#[derive(Debug)]
pub struct CompensationFailure {
    pub action: String,
    pub error: UndoError,
}

impl fmt::Display for CompensationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.action, self.error)
    }
}

/// Ordered list of undo actions, replayed in reverse on rollback.
#[derive(Default)]
pub struct CompensationLog {
    actions: Vec<Box<dyn UndoableAction>>,
}

impl CompensationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: Box<dyn UndoableAction>) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }

    /// Replay every action newest-first, draining the log.
    ///
    /// A failing action never short-circuits the replay; all remaining
    /// actions still get their chance to run. Failures are collected for the
    /// caller to escalate.
    pub fn replay(&mut self) -> Vec<CompensationFailure> {
        let mut failures = Vec::new();
        while let Some(mut action) = self.actions.pop() {
            if let Err(cause) = action.undo() {
                error!(
                    action = action.name(),
                    error = %cause,
                    "compensation failed during rollback replay"
                );
                failures.push(CompensationFailure {
                    action: action.name().to_string(),
                    error: cause,
                });
            }
        }
        failures
    }
}

impl fmt::Debug for CompensationLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompensationLog")
            .field("pending", &self.actions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorded {
        name: String,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl UndoableAction for Recorded {
        fn name(&self) -> &str {
            &self.name
        }

        fn undo(&mut self) -> Result<(), UndoError> {
            self.log.lock().unwrap().push(self.name.clone());
            if self.fail {
                Err(format!("{} refused to undo", self.name).into())
            } else {
                Ok(())
            }
        }
    }

    fn recorded(name: &str, fail: bool, log: &Arc<Mutex<Vec<String>>>) -> Box<dyn UndoableAction> {
        Box::new(Recorded {
            name: name.to_string(),
            fail,
            log: log.clone(),
        })
    }

    #[test]
    fn test_replay_runs_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut log = CompensationLog::new();
        log.push(recorded("u1", false, &order));
        log.push(recorded("u2", false, &order));
        log.push(recorded("u3", false, &order));

        let failures = log.replay();
        assert!(failures.is_empty());
        assert!(log.is_empty());
        assert_eq!(*order.lock().unwrap(), vec!["u3", "u2", "u1"]);
    }

    #[test]
    fn test_replay_collects_failures_without_short_circuit() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut log = CompensationLog::new();
        log.push(recorded("u1", false, &order));
        log.push(recorded("u2", true, &order));
        log.push(recorded("u3", false, &order));

        let failures = log.replay();
        assert_eq!(*order.lock().unwrap(), vec!["u3", "u2", "u1"]);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].action, "u2");
        assert!(failures[0].to_string().contains("refused to undo"));
    }
}
