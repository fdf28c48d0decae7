//! Scoped variable environment with write-count coordination.
//!
//! A [`Frame`] is a node in a parent chain, like a classic interpreter
//! frame, with two slot namespaces:
//!
//! - `variables` — the ordinary lexical scope.
//! - `async_vars` — per-async-block snapshots.  Reads prefer `async_vars`
//!   over `variables` on the same frame, so a block sees the world as it
//!   was when the block was entered, plus its own writes.
//!
//! When a block that writes variables owned by ancestors is spawned,
//! [`Frame::push_async_block`] installs a *pending* value in each owed
//! parent slot and records how many writes the block will perform.  Every
//! write (including writes on branches that end up not taken — see
//! [`Frame::skip_branch_writes`]) decrements the counter; at zero the slot
//! resolves with the block's final value, possibly poison.  A concurrent
//! reader therefore sees either the pre-block snapshot or the fully
//! resolved value, never a half-written state.
//!
//! # Invariants
//!
//! 1. A promisified slot resolves exactly once, when its counter reaches
//!    zero.
//! 2. Counter zero propagates a single decrement to the nearest enclosing
//!    counting frame, stopping at the variable's declaring frame, unless
//!    the finishing frame is a sequential loop body.
//! 3. Writes never resolve upward past a frame marked `isolate_writes`.

use cascada_core::errors::PoisonedValue;
use cascada_core::values::{PendingValue, Value, ValueResolver};

use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

// ---------------------------------------------------------------------------
// OwedWrite
// ---------------------------------------------------------------------------

/// Bookkeeping for one promisified parent slot: the resolver for the
/// pending value installed there, plus enough information to write the
/// settled value back into the slot — but only while the slot still holds
/// *our* pending value.  A later block may have replaced it, taking over
/// responsibility for the slot.
struct OwedWrite {
    resolver: ValueResolver,
    pending_id: u64,
    owner: Rc<Frame>,
    in_async_vars: bool,
}

impl OwedWrite {
    fn write_back(&self, name: &str, value: &Value) {
        let slot_map = if self.in_async_vars {
            &self.owner.async_vars
        } else {
            &self.owner.variables
        };
        let mut map = slot_map.borrow_mut();
        if let Some(slot) = map.get_mut(name) {
            let ours = matches!(slot, Value::Pending(p) if p.id() == self.pending_id);
            if ours {
                *slot = value.clone();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A variable scope.  Always handled through `Rc`; the parent chain keeps
/// ancestors alive for the lifetime of any block that references them.
pub struct Frame {
    variables: RefCell<IndexMap<String, Value>>,
    async_vars: RefCell<IndexMap<String, Value>>,
    write_counters: RefCell<HashMap<String, usize>>,
    promise_resolves: RefCell<HashMap<String, OwedWrite>>,
    parent: Option<Rc<Frame>>,
    isolate_writes: bool,
    create_scope: bool,
    top_level: bool,
    is_async_block: bool,
    sequential_loop_body: Cell<bool>,
}

impl Frame {
    fn bare(parent: Option<Rc<Frame>>) -> Frame {
        Frame {
            variables: RefCell::new(IndexMap::new()),
            async_vars: RefCell::new(IndexMap::new()),
            write_counters: RefCell::new(HashMap::new()),
            promise_resolves: RefCell::new(HashMap::new()),
            parent,
            isolate_writes: false,
            create_scope: true,
            top_level: false,
            is_async_block: false,
            sequential_loop_body: Cell::new(false),
        }
    }

    /// The outermost frame of a render.
    pub fn root() -> Rc<Frame> {
        Rc::new(Frame {
            top_level: true,
            ..Frame::bare(None)
        })
    }

    /// Push an ordinary child scope.
    pub fn push(self: &Rc<Self>) -> Rc<Frame> {
        Rc::new(Frame::bare(Some(Rc::clone(self))))
    }

    /// Push a child scope whose writes never resolve upward past it.
    pub fn push_isolate(self: &Rc<Self>) -> Rc<Frame> {
        Rc::new(Frame {
            isolate_writes: true,
            ..Frame::bare(Some(Rc::clone(self)))
        })
    }

    /// Leave this scope, returning the parent.
    pub fn pop(self: &Rc<Self>) -> Option<Rc<Frame>> {
        self.parent.clone()
    }

    pub fn parent(&self) -> Option<&Rc<Frame>> {
        self.parent.as_ref()
    }

    pub fn is_top_level(&self) -> bool {
        self.top_level
    }

    pub fn is_async_block(&self) -> bool {
        self.is_async_block
    }

    /// Flag used by the while-loop driver: a sequential loop body does not
    /// propagate counter completion to its parent, because the loop itself
    /// accounts for the writes of all iterations.
    pub fn set_sequential_loop_body(&self, on: bool) {
        self.sequential_loop_body.set(on);
    }

    fn root_frame(self: &Rc<Self>) -> Rc<Frame> {
        let mut cur = Rc::clone(self);
        while let Some(p) = cur.parent.clone() {
            cur = p;
        }
        cur
    }

    // -- reads ---------------------------------------------------------

    /// Chain read: `async_vars` first, then `variables`, then the parent.
    /// `Undefined` when no frame has the name.
    pub fn lookup(&self, name: &str) -> Value {
        if let Some(v) = self.async_vars.borrow().get(name) {
            return v.clone();
        }
        if let Some(v) = self.variables.borrow().get(name) {
            return v.clone();
        }
        match &self.parent {
            Some(p) => p.lookup(name),
            None => Value::Undefined,
        }
    }

    /// Single-frame read.
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.async_vars.borrow().get(name) {
            return Some(v.clone());
        }
        self.variables.borrow().get(name).cloned()
    }

    /// `true` iff any frame in the chain has the name.
    pub fn has(&self, name: &str) -> bool {
        if self.async_vars.borrow().contains_key(name)
            || self.variables.borrow().contains_key(name)
        {
            return true;
        }
        self.parent.as_ref().is_some_and(|p| p.has(name))
    }

    /// This frame's block-local snapshot of `name`, if any.
    pub fn async_var(&self, name: &str) -> Option<Value> {
        self.async_vars.borrow().get(name).cloned()
    }

    /// Overwrite this frame's block-local snapshot of `name`.
    pub fn set_async_var(&self, name: &str, value: Value) {
        self.async_vars.borrow_mut().insert(name.to_string(), value);
    }

    /// Find the frame whose `variables` owns `name`.  For writes the walk
    /// stops at an `isolate_writes` boundary.
    pub fn resolve(self: &Rc<Self>, name: &str, for_write: bool) -> Option<Rc<Frame>> {
        if self.variables.borrow().contains_key(name) {
            return Some(Rc::clone(self));
        }
        if for_write && self.isolate_writes {
            return None;
        }
        self.parent.as_ref().and_then(|p| p.resolve(name, for_write))
    }

    /// Locate the slot currently holding `name`: the nearest frame, and
    /// whether the slot is in that frame's `async_vars` (`true`) or
    /// `variables` (`false`).
    pub fn lookup_and_locate(self: &Rc<Self>, name: &str) -> Option<(Rc<Frame>, bool)> {
        if self.async_vars.borrow().contains_key(name) {
            return Some((Rc::clone(self), true));
        }
        if self.variables.borrow().contains_key(name) {
            return Some((Rc::clone(self), false));
        }
        self.parent.as_ref().and_then(|p| p.lookup_and_locate(name))
    }

    // -- writes --------------------------------------------------------

    /// Ordinary (non-resolve-up) write into this frame's `variables`.
    /// Dotted names auto-nest, creating intermediate maps as needed.
    /// `!`-prefixed lock names are opaque and never nest.
    pub fn set(&self, name: &str, value: Value) {
        if name.starts_with('!') {
            self.variables.borrow_mut().insert(name.to_string(), value);
            return;
        }
        match name.split_once('.') {
            None => {
                self.variables.borrow_mut().insert(name.to_string(), value);
            }
            Some((head, rest)) => {
                let root = {
                    let mut vars = self.variables.borrow_mut();
                    let slot = vars.entry(head.to_string()).or_insert_with(Value::map);
                    if !matches!(slot, Value::Map(_)) {
                        *slot = Value::map();
                    }
                    slot.clone()
                };
                set_nested(&root, &rest.split('.').collect::<Vec<_>>(), value);
            }
        }
    }

    /// Resolve-up write (the `set` tag).  Only simple names.
    ///
    /// Finds (or creates) the scope frame for `name`, then walks upward
    /// from here writing into the first `async_vars` snapshot found, or
    /// into the scope frame's `variables` — whichever comes first.
    /// Finally accounts for one write on this frame.
    pub fn set_resolve_up(self: &Rc<Self>, name: &str, value: Value) {
        debug_assert!(!name.contains('.'), "resolve-up writes use simple names");
        let scope = match self.resolve(name, true) {
            Some(f) => f,
            None => {
                // Delegate creation to the nearest scope-creating frame.
                let mut f = Rc::clone(self);
                while !f.create_scope {
                    match f.parent.clone() {
                        Some(p) => f = p,
                        None => break,
                    }
                }
                f.variables
                    .borrow_mut()
                    .insert(name.to_string(), Value::Undefined);
                f
            }
        };

        let mut cur = Rc::clone(self);
        loop {
            if cur.async_vars.borrow().contains_key(name) {
                cur.async_vars.borrow_mut().insert(name.to_string(), value);
                break;
            }
            if Rc::ptr_eq(&cur, &scope) {
                cur.variables.borrow_mut().insert(name.to_string(), value);
                break;
            }
            match cur.parent.clone() {
                Some(p) => cur = p,
                None => {
                    cur.variables.borrow_mut().insert(name.to_string(), value);
                    break;
                }
            }
        }

        self.count_write(name, 1);
    }

    // -- async blocks ---------------------------------------------------

    /// Build the child frame for an async block.
    ///
    /// `reads` are snapshotted into the child's `async_vars` (the value may
    /// itself be pending or poison).  For each `(name, count)` in `writes`
    /// the current value is snapshotted, a fresh pending value is installed
    /// in the slot that currently holds the variable (created lazily in the
    /// root frame for `!`-prefixed lock names), and the child remembers the
    /// resolver and the remaining write count.
    pub fn push_async_block(
        self: &Rc<Self>,
        reads: &[&str],
        writes: &[(&str, usize)],
    ) -> Rc<Frame> {
        let child = Rc::new(Frame {
            is_async_block: true,
            create_scope: false,
            ..Frame::bare(Some(Rc::clone(self)))
        });

        for name in reads {
            let current = self.lookup(name);
            child
                .async_vars
                .borrow_mut()
                .insert((*name).to_string(), current);
        }

        for (name, count) in writes {
            child.promisify_parent_var(name, *count);
        }

        child
    }

    fn promisify_parent_var(self: &Rc<Self>, name: &str, count: usize) {
        let parent = self
            .parent
            .clone()
            .expect("async block frames always have a parent");

        let (owner, in_async_vars) = match parent.lookup_and_locate(name) {
            Some(loc) => loc,
            None => {
                // Lock variables materialize lazily in the root frame.
                // Anything else lands in the nearest scope-creating frame.
                let target = if name.starts_with('!') {
                    parent.root_frame()
                } else {
                    let mut f = Rc::clone(&parent);
                    while !f.create_scope {
                        match f.parent.clone() {
                            Some(p) => f = p,
                            None => break,
                        }
                    }
                    f
                };
                target
                    .variables
                    .borrow_mut()
                    .insert(name.to_string(), Value::Undefined);
                (target, false)
            }
        };

        let snapshot = {
            let map = if in_async_vars {
                owner.async_vars.borrow()
            } else {
                owner.variables.borrow()
            };
            map.get(name).cloned().unwrap_or(Value::Undefined)
        };
        self.async_vars
            .borrow_mut()
            .insert(name.to_string(), snapshot);

        let (pending, resolver) = PendingValue::channel();
        let slot_value = Value::Pending(pending.clone());
        {
            let mut map = if in_async_vars {
                owner.async_vars.borrow_mut()
            } else {
                owner.variables.borrow_mut()
            };
            map.insert(name.to_string(), slot_value);
        }

        self.promise_resolves.borrow_mut().insert(
            name.to_string(),
            OwedWrite {
                resolver,
                pending_id: pending.id(),
                owner,
                in_async_vars,
            },
        );
        self.write_counters.borrow_mut().insert(name.to_string(), count);
    }

    // -- write accounting -----------------------------------------------

    /// Decrement the write counter for `name` by `amount` on the nearest
    /// counting frame, walking upward but never past the variable's
    /// declaring frame.  No-op when nothing in range counts the name
    /// (sync-mode writes).
    pub fn count_write(self: &Rc<Self>, name: &str, amount: usize) {
        let mut cur = Rc::clone(self);
        loop {
            if cur.write_counters.borrow().contains_key(name) {
                cur.apply_decrement(name, amount);
                return;
            }
            if cur.variables.borrow().contains_key(name) {
                return;
            }
            match cur.parent.clone() {
                Some(p) => cur = p,
                None => return,
            }
        }
    }

    fn apply_decrement(self: &Rc<Self>, name: &str, amount: usize) {
        let remaining = {
            let mut counters = self.write_counters.borrow_mut();
            let Some(c) = counters.get_mut(name) else {
                return;
            };
            *c = c.saturating_sub(amount);
            *c
        };
        if remaining == 0 {
            self.finalize_write(name);
        }
    }

    /// Counter hit zero: resolve the owed parent slot with this block's
    /// final value and propagate one decrement upward.
    fn finalize_write(self: &Rc<Self>, name: &str) {
        self.write_counters.borrow_mut().remove(name);

        let value = self
            .async_vars
            .borrow()
            .get(name)
            .cloned()
            .unwrap_or(Value::Undefined);

        if let Some(owed) = self.promise_resolves.borrow_mut().remove(name) {
            owed.write_back(name, &value);
            owed.resolver.resolve(value);
        }

        if !self.sequential_loop_body.get() {
            if let Some(parent) = self.parent.clone() {
                parent.count_write(name, 1);
            }
        }
    }

    /// Account for the writes of a branch that was not taken.
    pub fn skip_branch_writes<'a>(
        self: &Rc<Self>,
        counts: impl IntoIterator<Item = (&'a str, usize)>,
    ) {
        for (name, amount) in counts {
            self.count_write(name, amount);
        }
    }

    /// Poison the variables a failed branch would have written, then
    /// account for the branch's writes.  The poison lands in this frame's
    /// `async_vars` snapshot when present, otherwise in the variable's
    /// scope frame.
    pub fn poison_branch_writes<'a>(
        self: &Rc<Self>,
        poison: &PoisonedValue,
        counts: impl IntoIterator<Item = (&'a str, usize)>,
    ) {
        for (name, amount) in counts {
            let value = Value::Poison(poison.clone());
            if self.async_vars.borrow().contains_key(name) {
                self.async_vars.borrow_mut().insert(name.to_string(), value);
            } else if let Some(scope) = self.resolve(name, false) {
                scope
                    .variables
                    .borrow_mut()
                    .insert(name.to_string(), value);
            } else {
                self.async_vars.borrow_mut().insert(name.to_string(), value);
            }
            self.count_write(name, amount);
        }
    }
}

/// Lenient nested write used by dotted-name auto-nesting: scalar
/// intermediates are replaced with fresh maps rather than erroring, so a
/// template can deepen a path it previously set to a scalar.
fn set_nested(map_value: &Value, segs: &[&str], value: Value) {
    let Value::Map(map) = map_value else {
        return;
    };
    let [head, rest @ ..] = segs else {
        return;
    };
    if rest.is_empty() {
        map.borrow_mut().insert((*head).to_string(), value);
        return;
    }
    let next = {
        let mut m = map.borrow_mut();
        let slot = m.entry((*head).to_string()).or_insert_with(Value::map);
        if !matches!(slot, Value::Map(_)) {
            *slot = Value::map();
        }
        slot.clone()
    };
    set_nested(&next, rest, value);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
