//! Render context: the user's variables, block override chains, and the
//! export list of a template.

use crate::environment::Environment;
use crate::runner::BlockFn;

use cascada_core::errors::RuntimeError;
use cascada_core::values::{PendingValue, Value, ValueResolver};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::Rc;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Per-render context.
///
/// Block names map to ordered definition lists: the base template's
/// definition first, overrides after.  `get_super` walks that list by
/// identity, which is what makes `super()` work through arbitrarily deep
/// override chains.
pub struct Context {
    env: Rc<Environment>,
    vars: Value,
    blocks: RefCell<IndexMap<String, Vec<BlockFn>>>,
    exported: RefCell<Vec<String>>,
    gate: RefCell<Option<PendingValue>>,
    gate_resolver: RefCell<Option<ValueResolver>>,
}

impl Context {
    pub fn new(env: Rc<Environment>, vars: Value) -> Rc<Self> {
        Rc::new(Self {
            env,
            vars,
            blocks: RefCell::new(IndexMap::new()),
            exported: RefCell::new(Vec::new()),
            gate: RefCell::new(None),
            gate_resolver: RefCell::new(None),
        })
    }

    pub fn env(&self) -> &Rc<Environment> {
        &self.env
    }

    /// The raw context variables.
    pub fn vars(&self) -> &Value {
        &self.vars
    }

    /// Context lookup: a name present in the environment's globals but
    /// absent from the local context resolves to the global; otherwise the
    /// local context wins.
    pub fn lookup(&self, name: &str) -> Value {
        let has_local =
            matches!(&self.vars, Value::Map(m) if m.borrow().contains_key(name));
        if has_local {
            self.vars.member(name)
        } else {
            self.env.global(name)
        }
    }

    /// Write a context variable (used by `import`-style statements).
    pub fn set(&self, name: &str, value: Value) {
        if let Value::Map(m) = &self.vars {
            m.borrow_mut().insert(name.to_string(), value);
        }
    }

    // -- blocks --------------------------------------------------------

    /// Register a block definition.  Base templates register before their
    /// overrides.
    pub fn add_block(&self, name: &str, block: BlockFn) {
        self.blocks
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .push(block);
    }

    /// The active (first-registered) definition of a block.
    pub fn get_block(&self, name: &str) -> Result<BlockFn, Rc<RuntimeError>> {
        self.blocks
            .borrow()
            .get(name)
            .and_then(|defs| defs.first().cloned())
            .ok_or_else(|| Rc::new(RuntimeError::new(format!("unknown block '{name}'"))))
    }

    /// The definition after `current` in the override chain.
    pub fn get_super(&self, name: &str, current: &BlockFn) -> Result<BlockFn, Rc<RuntimeError>> {
        let blocks = self.blocks.borrow();
        let defs = blocks
            .get(name)
            .ok_or_else(|| Rc::new(RuntimeError::new(format!("unknown block '{name}'"))))?;
        let position = defs
            .iter()
            .position(|b| Rc::ptr_eq(b, current))
            .ok_or_else(|| {
                Rc::new(RuntimeError::new(format!(
                    "current definition of block '{name}' is not registered"
                )))
            })?;
        defs.get(position + 1).cloned().ok_or_else(|| {
            Rc::new(RuntimeError::new(format!(
                "block '{name}' has no super block"
            )))
        })
    }

    // -- async block handshake ------------------------------------------

    /// Open the registration gate.  Inner templates resolved across async
    /// boundaries call [`Context::get_async_block`], which waits until
    /// [`Context::finalize_blocks`] signals that every override has been
    /// registered.
    pub fn prepare_for_async_blocks(&self) {
        let (pending, resolver) = PendingValue::channel();
        *self.gate.borrow_mut() = Some(pending);
        *self.gate_resolver.borrow_mut() = Some(resolver);
    }

    /// Signal that block registration has settled.
    pub fn finalize_blocks(&self) {
        if let Some(resolver) = self.gate_resolver.borrow_mut().take() {
            resolver.resolve(Value::Bool(true));
        }
    }

    /// Await the registration gate (if open), then resolve the block.
    pub async fn get_async_block(&self, name: &str) -> Result<BlockFn, Rc<RuntimeError>> {
        let gate = self.gate.borrow().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        self.get_block(name)
    }

    // -- exports --------------------------------------------------------

    /// Mark a name as exported (`import`/`from` statements).
    pub fn add_export(&self, name: &str) {
        self.exported.borrow_mut().push(name.to_string());
    }

    pub fn exported_names(&self) -> Vec<String> {
        self.exported.borrow().clone()
    }

    /// The exported subset of the context variables, as a map.
    pub fn get_exported(&self) -> Value {
        Value::from_pairs(
            self.exported
                .borrow()
                .iter()
                .map(|name| (name.clone(), self.vars.member(name))),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
