//! Ordered multicast of fallible callbacks
//!
//! The services communicate through callback lists attached to dictionary
//! slots and to each other. A [`CallbackHandler`] invokes its callbacks in
//! insertion order; what happens when one fails depends on the handler's
//! [`FailMode`].

use std::sync::{Arc, Mutex};

use snafu::Snafu;

/// Error returned by a rejected or failed callback
#[derive(Debug, Snafu)]
#[snafu(display("callback failed: {reason}"))]
pub struct CallbackError {
    /// Human readable description of the failure
    pub reason: String,
}

impl CallbackError {
    /// Create a new error from a reason
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Determines how a [`CallbackHandler`] treats callback failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    /// Failures are logged and swallowed; all callbacks run
    #[default]
    Ignore,
    /// The first failure stops the chain and propagates
    FirstFail,
    /// All callbacks run; the first failure (if any) is returned after
    /// completion
    LateFail,
}

/// Identifies a registered callback for removal and membership tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

type Callback<A> = Arc<dyn Fn(&A) -> Result<(), CallbackError> + Send + Sync>;

struct Entries<A: ?Sized> {
    next_id: u64,
    callbacks: Vec<(CallbackId, Callback<A>)>,
}

/// An ordered list of callables invoked with a shared argument
pub struct CallbackHandler<A: ?Sized> {
    entries: Mutex<Entries<A>>,
    fail_mode: FailMode,
}

impl<A: ?Sized> Default for CallbackHandler<A> {
    fn default() -> Self {
        Self::new(FailMode::default())
    }
}

impl<A: ?Sized> CallbackHandler<A> {
    /// Create a new handler with the given fail mode
    pub fn new(fail_mode: FailMode) -> Self {
        Self {
            entries: Mutex::new(Entries {
                next_id: 0,
                callbacks: Vec::new(),
            }),
            fail_mode,
        }
    }

    /// Append a callback; it will be invoked after all previously added ones
    pub fn add(
        &self,
        callback: impl Fn(&A) -> Result<(), CallbackError> + Send + Sync + 'static,
    ) -> CallbackId {
        self.add_arc(Arc::new(callback))
    }

    /// Append an already-shared callback
    pub fn add_arc(&self, callback: Callback<A>) -> CallbackId {
        let mut entries = self.entries.lock().unwrap();
        let id = CallbackId(entries.next_id);
        entries.next_id += 1;
        entries.callbacks.push((id, callback));
        id
    }

    /// Remove a callback; returns false if it was not registered
    pub fn remove(&self, id: CallbackId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let len_before = entries.callbacks.len();
        entries.callbacks.retain(|(cb_id, _)| *cb_id != id);
        entries.callbacks.len() != len_before
    }

    /// Returns true if the callback is currently registered
    pub fn contains(&self, id: CallbackId) -> bool {
        self.entries
            .lock()
            .unwrap()
            .callbacks
            .iter()
            .any(|(cb_id, _)| *cb_id == id)
    }

    /// Returns true if no callbacks are registered
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().callbacks.is_empty()
    }

    /// Invoke all callbacks in insertion order
    ///
    /// The list is snapshotted before invocation, so callbacks may add or
    /// remove entries (taking effect on the next call) without deadlocking.
    pub fn call(&self, arg: &A) -> Result<(), CallbackError> {
        let snapshot: Vec<Callback<A>> = self
            .entries
            .lock()
            .unwrap()
            .callbacks
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();

        let mut first_error = None;
        for callback in snapshot {
            match callback(arg) {
                Ok(()) => {}
                Err(e) => match self.fail_mode {
                    FailMode::FirstFail => return Err(e),
                    FailMode::LateFail => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                    FailMode::Ignore => {
                        log::debug!("Ignored error in callback handler: {e}");
                    }
                },
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_handler(
        fail_mode: FailMode,
        outcomes: &[Result<(), &'static str>],
    ) -> (CallbackHandler<()>, Arc<Mutex<Vec<usize>>>) {
        let handler = CallbackHandler::new(fail_mode);
        let calls = Arc::new(Mutex::new(Vec::new()));
        for (i, outcome) in outcomes.iter().enumerate() {
            let calls = calls.clone();
            let outcome = *outcome;
            handler.add(move |_: &()| {
                calls.lock().unwrap().push(i);
                outcome.map_err(CallbackError::new)
            });
        }
        (handler, calls)
    }

    #[test]
    fn test_insertion_order() {
        let (handler, calls) = recording_handler(FailMode::Ignore, &[Ok(()), Ok(()), Ok(())]);
        handler.call(&()).unwrap();
        assert_eq!(vec![0, 1, 2], *calls.lock().unwrap());
    }

    #[test]
    fn test_ignore_runs_all() {
        let (handler, calls) = recording_handler(FailMode::Ignore, &[Err("a"), Err("b"), Ok(())]);
        handler.call(&()).unwrap();
        assert_eq!(vec![0, 1, 2], *calls.lock().unwrap());
    }

    #[test]
    fn test_first_fail_stops_chain() {
        let (handler, calls) = recording_handler(FailMode::FirstFail, &[Ok(()), Err("b"), Ok(())]);
        let err = handler.call(&()).unwrap_err();
        assert_eq!("b", err.reason);
        assert_eq!(vec![0, 1], *calls.lock().unwrap());
    }

    #[test]
    fn test_late_fail_runs_all_and_reports_first() {
        let (handler, calls) =
            recording_handler(FailMode::LateFail, &[Err("a"), Err("b"), Ok(())]);
        let err = handler.call(&()).unwrap_err();
        assert_eq!("a", err.reason);
        assert_eq!(vec![0, 1, 2], *calls.lock().unwrap());
    }

    #[test]
    fn test_remove_and_contains() {
        let handler: CallbackHandler<()> = CallbackHandler::default();
        let id = handler.add(|_| Ok(()));
        assert!(handler.contains(id));
        assert!(handler.remove(id));
        assert!(!handler.contains(id));
        assert!(!handler.remove(id));
    }
}
