//! Sequence locks: serializing marked effects on a statically-known path.
//!
//! A sequence lock is just a variable whose name starts with `!`, living in
//! the root frame and promisified through the ordinary frame machinery.
//! Each marked operation snapshots the previous lock value, installs a new
//! pending one, awaits the snapshot, runs, and resolves — so consecutive
//! marked operations chain while everything unmarked stays concurrent.
//!
//! The compiler guarantees the marker only ever lands on a call with a
//! static path; this module only deals in the resulting lock names.

use crate::frame::Frame;

use cascada_core::values::Value;
use std::future::Future;
use std::rc::Rc;

/// Lock name for `obj.path!.method(...)`: one lock per object path; every
/// marked method on that path serializes against the others.
pub fn path_lock_name(path: &[&str]) -> String {
    format!("!{}", path.join("."))
}

/// Lock name for `obj.path.method!(...)`: one lock per method on that
/// path; different marked methods on the same object stay independent.
pub fn method_lock_name(path: &[&str], method: &str) -> String {
    format!("!{}#{}", path.join("."), method)
}

/// `true` for names the frame layer treats as lazily-created root locks.
pub fn is_lock_name(name: &str) -> bool {
    name.starts_with('!')
}

/// Run `op` serialized behind every earlier operation on `key`.
///
/// `block_frame` must be an async block pushed with a write count of one
/// for `key`; its snapshot of the lock is the previous operation's pending
/// result.  A failed predecessor fails this operation too (the failure is
/// inherited *through the lock*; see [`release_lock`] for the repair path).
pub async fn run_sequenced<F, Fut>(block_frame: &Rc<Frame>, key: &str, op: F) -> Value
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Value>,
{
    let prior = block_frame.get(key).unwrap_or(Value::Bool(true));
    let prior = prior.settled().await;
    if prior.is_poison() {
        block_frame.set_resolve_up(key, prior.clone());
        return prior;
    }

    let result = op().await;
    if result.is_poison() {
        block_frame.set_resolve_up(key, result.clone());
    } else {
        block_frame.set_resolve_up(key, Value::Bool(true));
    }
    result
}

/// Overwrite a lock slot with a trivially-released value, wherever the
/// slot currently lives.  Downstream operations chained on the lock no
/// longer inherit a predecessor's failure through it — they inherit it
/// through whatever variable actually captured the error, if any.
pub fn release_lock(frame: &Rc<Frame>, name: &str) {
    match frame.lookup_and_locate(name) {
        Some((owner, true)) => owner.set_async_var(name, Value::Bool(true)),
        Some((owner, false)) => owner.set(name, Value::Bool(true)),
        None => {
            let mut root = Rc::clone(frame);
            while let Some(p) = root.parent().cloned() {
                root = p;
            }
            root.set(name, Value::Bool(true));
        }
    }
}

/// Frame-level repair: release every named lock.  The guard layer builds
/// on this with failure detection (see [`crate::guard`]).
pub fn repair_sequence_locks(frame: &Rc<Frame>, names: &[&str]) {
    for name in names {
        release_lock(frame, name);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
