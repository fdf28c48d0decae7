//! All-or-nothing treatment of an async block with respect to a declared
//! set of variables and sequence locks.
//!
//! A guard snapshots the block's variables on entry, watches the block's
//! sequence locks for failure, and at completion either commits (keeps the
//! block's writes) or reverts (restores every guarded variable to its
//! snapshot).  Output rollback is the buffer's job: the caller pushes a
//! revert marker into the block's buffer scope (see
//! [`crate::buffer::OutputBuffer::push_revert`]).

use crate::buffer::OutputBuffer;
use crate::frame::Frame;
use crate::locks;

use cascada_core::errors::{dedup_errors, RuntimeError};
use cascada_core::values::{PendingValue, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

// ---------------------------------------------------------------------------
// GuardState
// ---------------------------------------------------------------------------

/// Snapshot and failure-detection state for one guarded block.
pub struct GuardState {
    names: Vec<String>,
    snapshot: HashMap<String, Value>,
    sequence_errors: Rc<RefCell<Vec<Rc<RuntimeError>>>>,
    detection: RefCell<Vec<PendingValue>>,
}

impl GuardState {
    /// The guarded variable names.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The snapshot taken at block entry (by reference, no deep clone).
    pub fn snapshot(&self, name: &str) -> Option<&Value> {
        self.snapshot.get(name)
    }
}

/// Snapshot the guarded variables.  Every name must already be present in
/// the block frame's `async_vars` — the compiler declares reads/writes for
/// the block, so a missing name is a wiring bug, reported as an error.
pub fn init(frame: &Rc<Frame>, names: &[&str]) -> Result<GuardState, Rc<RuntimeError>> {
    let mut snapshot = HashMap::with_capacity(names.len());
    for name in names {
        let Some(value) = frame.async_var(name) else {
            return Err(Rc::new(RuntimeError::new(format!(
                "guarded variable '{name}' is not tracked by this block"
            ))));
        };
        snapshot.insert((*name).to_string(), value);
    }
    Ok(GuardState {
        names: names.iter().map(|n| (*n).to_string()).collect(),
        snapshot,
        sequence_errors: Rc::new(RefCell::new(Vec::new())),
        detection: RefCell::new(Vec::new()),
    })
}

/// Repair the block's sequence locks after a failure.
///
/// For each lock: the current value (possibly still pending) is tailed
/// asynchronously so a failure is recorded in the guard's error set, and a
/// trivially-released value is installed as the new lock state so
/// operations queued behind the failed one do not inherit its failure
/// through the lock.
pub fn repair_sequence_locks(frame: &Rc<Frame>, state: &GuardState, lock_names: &[&str]) {
    for name in lock_names {
        let current = frame.lookup(name);
        match current {
            Value::Pending(p) => {
                let errors = Rc::clone(&state.sequence_errors);
                let detector = PendingValue::new(async move {
                    if let Value::Poison(poison) = p.wait().await {
                        errors.borrow_mut().extend(poison.errors().iter().cloned());
                    }
                    Value::Bool(true)
                });
                state.detection.borrow_mut().push(detector);
            }
            Value::Poison(poison) => {
                state
                    .sequence_errors
                    .borrow_mut()
                    .extend(poison.errors().iter().cloned());
            }
            _ => {}
        }
        locks::release_lock(frame, name);
    }
}

/// Collect every failure attributable to the guarded block: poison markers
/// in its buffer targeted at the allowed handlers, guarded variables that
/// now hold poison, and failures observed on monitored sequence locks.
pub async fn get_errors(
    frame: &Rc<Frame>,
    state: &GuardState,
    buffer: &Rc<OutputBuffer>,
    allowed_handlers: &[&str],
) -> Vec<Rc<RuntimeError>> {
    let detectors: Vec<PendingValue> = state.detection.borrow().clone();
    for d in detectors {
        d.wait().await;
    }

    let mut errors: Vec<Rc<RuntimeError>> = state.sequence_errors.borrow().clone();
    buffer.collect_marker_errors(allowed_handlers, &mut errors);
    for name in &state.names {
        if let Some(Value::Poison(poison)) = frame.async_var(name) {
            errors.extend(poison.errors().iter().cloned());
        }
    }
    dedup_errors(errors)
}

/// Finish the guarded block.  With `revert`, every guarded variable is
/// restored to its snapshot first.  Either way each name's write counter is
/// released by one, which is what lets the block's promisified slots
/// resolve.
pub fn complete(frame: &Rc<Frame>, state: &GuardState, revert: bool) {
    if revert {
        for (name, value) in &state.snapshot {
            frame.set_async_var(name, value.clone());
        }
    }
    for name in &state.names {
        frame.count_write(name, 1);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
