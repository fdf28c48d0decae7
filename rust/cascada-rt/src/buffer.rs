//! The output buffer: a tree of deferred outputs flattened exactly once,
//! at the end of a render.
//!
//! Compiled code appends entries in *emission* order (synchronously, on
//! entry to each region), so the flattened text always follows template
//! source order no matter when the underlying values settle.  Entries may
//! be plain values (possibly pending or poison), nested scopes, handler
//! commands, revert markers, poison markers standing in for effects of a
//! failed branch, and a trailing post-processing function applied to a
//! sub-scope's joined text.
//!
//! Two flatten paths exist:
//!
//! - the fast text path ([`OutputBuffer::flatten_text`]) for plain
//!   template renders, and
//! - the script path ([`OutputBuffer::flatten_script`]) which dispatches
//!   commands to registered handlers and assembles a structured result.
//!
//! Both collect *every* poison error they encounter and fail with a single
//! aggregated [`PoisonError`]; neither short-circuits.

use crate::environment::Environment;
use crate::handlers::CommandHandler;

use cascada_core::errors::{
    dedup_errors, handle_error, PoisonError, RuntimeError, SourceInfo,
};
use cascada_core::values::Value;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// A handler command captured in the buffer: `@handler.subpath.command(args)`.
pub struct CommandCall {
    /// `None` (or `"text"`) targets the implicit text channel.
    pub handler: Option<String>,
    /// `None` means handler-as-function: `@handler(args)`.
    pub command: Option<String>,
    pub subpath: Vec<String>,
    pub args: Vec<Value>,
    pub pos: SourceInfo,
}

impl CommandCall {
    fn is_text(&self) -> bool {
        matches!(self.handler.as_deref(), None | Some("text"))
    }
}

/// Which handlers a revert marker rewinds.
pub enum RevertTargets {
    /// The universal target `'_'`: every handler in the current scope.
    All,
    Handlers(Vec<String>),
}

impl RevertTargets {
    fn covers(&self, handler: &str) -> bool {
        match self {
            RevertTargets::All => true,
            RevertTargets::Handlers(hs) => hs.iter().any(|h| h == handler),
        }
    }
}

/// A placeholder for effects of a branch now known to be unreachable due
/// to failure.  Carries already-positioned errors.
pub struct PoisonMarker {
    pub errors: Vec<Rc<RuntimeError>>,
    pub handler: Option<String>,
}

/// Applied to the enclosing scope's joined text (last entry of the scope).
pub type PostFn = Rc<dyn Fn(String) -> String>;

pub enum EntryKind {
    /// Text-ish value: string/number/bool, a pending value, poison, or an
    /// embedded structured result.
    Val(Value),
    Scope(Rc<OutputBuffer>),
    Command(CommandCall),
    Revert(RevertTargets),
    Marker(PoisonMarker),
    Post(PostFn),
}

impl EntryKind {
    /// The single decision point mapping an entry to the handler whose
    /// output channel it belongs to.  `None` for entries that contribute
    /// no output of their own (scopes, reverts, post-processing).
    pub fn handler_name(&self) -> Option<&str> {
        match self {
            EntryKind::Val(_) => Some("text"),
            EntryKind::Command(c) => Some(c.handler.as_deref().unwrap_or("text")),
            EntryKind::Marker(m) => Some(m.handler.as_deref().unwrap_or("text")),
            EntryKind::Scope(_) | EntryKind::Revert(_) | EntryKind::Post(_) => None,
        }
    }
}

struct BufNode {
    kind: EntryKind,
    reverted: Cell<bool>,
}

impl BufNode {
    fn new(kind: EntryKind) -> Rc<Self> {
        Rc::new(Self {
            kind,
            reverted: Cell::new(false),
        })
    }
}

// ---------------------------------------------------------------------------
// OutputBuffer
// ---------------------------------------------------------------------------

/// One scope in the output tree.
pub struct OutputBuffer {
    entries: RefCell<Vec<Rc<BufNode>>>,
    scope_root: Cell<bool>,
    has_revert: Cell<bool>,
    reverts_processed: Cell<bool>,
}

impl OutputBuffer {
    /// The root scope of a render.
    pub fn root() -> Rc<Self> {
        let buf = Rc::new(Self::empty());
        buf.scope_root.set(true);
        buf
    }

    fn empty() -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            scope_root: Cell::new(false),
            has_revert: Cell::new(false),
            reverts_processed: Cell::new(false),
        }
    }

    /// Append a nested scope and return it.  `scope_root` marks an
    /// independent output region (an async block, a loop iteration body)
    /// for the purposes of revert processing.
    pub fn child_scope(self: &Rc<Self>, scope_root: bool) -> Rc<Self> {
        let child = Rc::new(Self::empty());
        child.scope_root.set(scope_root);
        self.entries
            .borrow_mut()
            .push(BufNode::new(EntryKind::Scope(Rc::clone(&child))));
        child
    }

    pub fn is_scope_root(&self) -> bool {
        self.scope_root.get()
    }

    /// Append a text-ish value (may be pending or poison).
    pub fn push_value(&self, value: Value) {
        self.entries
            .borrow_mut()
            .push(BufNode::new(EntryKind::Val(value)));
    }

    pub fn push_str(&self, s: &str) {
        self.push_value(Value::from(s));
    }

    pub fn push_command(&self, cmd: CommandCall) {
        self.entries
            .borrow_mut()
            .push(BufNode::new(EntryKind::Command(cmd)));
    }

    /// Append a revert marker and flag this scope for revert processing.
    pub fn push_revert(&self, targets: RevertTargets) {
        self.has_revert.set(true);
        self.entries
            .borrow_mut()
            .push(BufNode::new(EntryKind::Revert(targets)));
    }

    /// Append a poison marker standing in for a failed branch's effects on
    /// `handler` (`None` for the text channel).
    pub fn push_poison_marker(&self, errors: Vec<Rc<RuntimeError>>, handler: Option<String>) {
        self.entries
            .borrow_mut()
            .push(BufNode::new(EntryKind::Marker(PoisonMarker {
                errors,
                handler,
            })));
    }

    /// Append a post-processing function applied to this scope's joined
    /// text.  By convention it sits at the last position of the scope.
    pub fn push_post_process(&self, f: PostFn) {
        self.entries
            .borrow_mut()
            .push(BufNode::new(EntryKind::Post(f)));
    }

    /// Gather poison-marker errors for the named handlers, recursively.
    /// Used by the guard layer to decide whether a guarded block failed.
    pub fn collect_marker_errors(
        self: &Rc<Self>,
        allowed_handlers: &[&str],
        out: &mut Vec<Rc<RuntimeError>>,
    ) {
        for node in self.entries.borrow().iter() {
            match &node.kind {
                EntryKind::Marker(m) => {
                    let name = m.handler.as_deref().unwrap_or("text");
                    if allowed_handlers.iter().any(|h| *h == name) {
                        out.extend(m.errors.iter().cloned());
                    }
                }
                EntryKind::Scope(child) => child.collect_marker_errors(allowed_handlers, out),
                _ => {}
            }
        }
    }

    // -- revert processing ---------------------------------------------

    /// Lazy, single-pass revert processing.  Runs at most once per scope;
    /// collects the scope's linear nodes (recursing into child scopes,
    /// which are thereby marked processed too) and, for each revert
    /// marker, walks backwards marking nodes of the targeted handlers as
    /// reverted, stopping at a prior marker covering the same handler.
    pub fn process_reverts(self: &Rc<Self>) {
        if self.reverts_processed.get() {
            return;
        }
        if !self.has_revert.get() {
            self.reverts_processed.set(true);
            return;
        }

        let mut nodes: Vec<Rc<BufNode>> = Vec::new();
        self.collect_linear(&mut nodes);

        for i in 0..nodes.len() {
            let EntryKind::Revert(targets) = &nodes[i].kind else {
                continue;
            };
            match targets {
                RevertTargets::All => {
                    for j in (0..i).rev() {
                        match &nodes[j].kind {
                            EntryKind::Revert(RevertTargets::All) => break,
                            EntryKind::Revert(_) => {}
                            _ => nodes[j].reverted.set(true),
                        }
                    }
                }
                RevertTargets::Handlers(hs) => {
                    for handler in hs {
                        for j in (0..i).rev() {
                            match &nodes[j].kind {
                                EntryKind::Revert(prior) if prior.covers(handler) => break,
                                kind => {
                                    if kind.handler_name() == Some(handler.as_str()) {
                                        nodes[j].reverted.set(true);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn collect_linear(self: &Rc<Self>, out: &mut Vec<Rc<BufNode>>) {
        self.reverts_processed.set(true);
        for node in self.entries.borrow().iter() {
            match &node.kind {
                EntryKind::Scope(child) => child.collect_linear(out),
                EntryKind::Post(_) => {}
                _ => out.push(Rc::clone(node)),
            }
        }
    }

    // -- fast text path -------------------------------------------------

    /// Flatten to a plain string.  Any poison encountered anywhere in the
    /// tree fails the whole render with one aggregated error.
    pub async fn flatten_text(self: &Rc<Self>) -> Result<String, PoisonError> {
        let (text, errors) = collect_text(Rc::clone(self)).await;
        if errors.is_empty() {
            Ok(text)
        } else {
            Err(PoisonError::from_errors(dedup_errors(errors)))
        }
    }

    // -- script path ----------------------------------------------------

    /// Flatten with handler dispatch, assembling a structured result
    /// (`{ text?, <handler>? ... }`), optionally focused on a single key.
    pub async fn flatten_script(
        self: &Rc<Self>,
        env: &Rc<Environment>,
        context_vars: &Value,
        focus: Option<&str>,
    ) -> Result<Value, PoisonError> {
        let dispatch = Rc::new(Dispatch {
            env: Rc::clone(env),
            context_vars: context_vars.clone(),
            instances: RefCell::new(IndexMap::new()),
            errors: RefCell::new(Vec::new()),
        });
        let text = walk_script(Rc::clone(self), Rc::clone(&dispatch)).await;

        let errors = dispatch.errors.take();
        if !errors.is_empty() {
            return Err(PoisonError::from_errors(dedup_errors(errors)));
        }

        let structure = env.result_structure();
        let result = Value::map();
        if let Value::Map(m) = &result {
            if !text.is_empty() {
                m.borrow_mut()
                    .insert(structure.text_key.clone(), Value::from(text));
            }
            for (name, instance) in dispatch.instances.borrow().iter() {
                if let Some(v) = instance.borrow().return_value() {
                    let key = if name == "data" {
                        structure.data_key.clone()
                    } else {
                        name.clone()
                    };
                    m.borrow_mut().insert(key, v);
                }
            }
        }

        match focus {
            None => Ok(result),
            Some(key) => {
                let focused = result.member(key);
                if focused.is_undefined() {
                    Err(PoisonError::from_errors([Rc::new(RuntimeError::new(
                        format!("unknown focus target '{key}'"),
                    ))]))
                } else {
                    Ok(focused)
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fast text walk
// ---------------------------------------------------------------------------

fn collect_text(
    scope: Rc<OutputBuffer>,
) -> LocalBoxFuture<'static, (String, Vec<Rc<RuntimeError>>)> {
    async move {
        scope.process_reverts();
        let mut text = String::new();
        let mut errors: Vec<Rc<RuntimeError>> = Vec::new();
        let mut post: Option<PostFn> = None;

        let entries: Vec<Rc<BufNode>> = scope.entries.borrow().clone();
        for node in entries {
            if node.reverted.get() {
                continue;
            }
            match &node.kind {
                EntryKind::Val(v) => match v.clone().settled().await {
                    Value::Poison(p) => errors.extend(p.errors().iter().cloned()),
                    other => text.push_str(&other.to_string()),
                },
                EntryKind::Scope(child) => {
                    let (t, e) = collect_text(Rc::clone(child)).await;
                    text.push_str(&t);
                    errors.extend(e);
                }
                EntryKind::Command(cmd) if cmd.is_text() => {
                    for arg in &cmd.args {
                        match arg.clone().settled().await {
                            Value::Poison(p) => errors.extend(p.errors().iter().cloned()),
                            other => text.push_str(&other.to_string()),
                        }
                    }
                }
                EntryKind::Command(cmd) => {
                    errors.push(handle_error(
                        Rc::new(RuntimeError::new(format!(
                            "command '@{}' requires a script render",
                            cmd.handler.as_deref().unwrap_or("?"),
                        ))),
                        &cmd.pos,
                    ));
                }
                EntryKind::Marker(m) => errors.extend(m.errors.iter().cloned()),
                EntryKind::Revert(_) => {}
                EntryKind::Post(f) => post = Some(Rc::clone(f)),
            }
        }

        if let Some(f) = post {
            text = f(text);
        }
        (text, errors)
    }
    .boxed_local()
}

// ---------------------------------------------------------------------------
// Script walk & handler dispatch
// ---------------------------------------------------------------------------

struct Dispatch {
    env: Rc<Environment>,
    context_vars: Value,
    instances: RefCell<IndexMap<String, Rc<RefCell<dyn CommandHandler>>>>,
    errors: RefCell<Vec<Rc<RuntimeError>>>,
}

impl Dispatch {
    /// Resolve a handler: cached instance, then singleton registry, then
    /// factory class registry.  Freshly resolved handlers get their
    /// per-render `init` call with the context variables.
    fn resolve_handler(
        &self,
        name: &str,
    ) -> Result<Rc<RefCell<dyn CommandHandler>>, Rc<RuntimeError>> {
        if let Some(h) = self.instances.borrow().get(name) {
            return Ok(Rc::clone(h));
        }
        let resolved = if let Some(h) = self.env.handler_singleton(name) {
            h
        } else if let Some(factory) = self.env.handler_factory(name) {
            factory(&self.context_vars, &self.env)
        } else {
            return Err(Rc::new(RuntimeError::new(format!(
                "unknown command handler '{name}'"
            ))));
        };
        resolved.borrow_mut().init(&self.context_vars);
        self.instances
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(&resolved));
        Ok(resolved)
    }

    fn push_error(&self, err: Rc<RuntimeError>) {
        self.errors.borrow_mut().push(err);
    }
}

fn walk_script(scope: Rc<OutputBuffer>, dispatch: Rc<Dispatch>) -> LocalBoxFuture<'static, String> {
    async move {
        scope.process_reverts();
        let mut text = String::new();
        let mut post: Option<PostFn> = None;

        let entries: Vec<Rc<BufNode>> = scope.entries.borrow().clone();
        for node in entries {
            if node.reverted.get() {
                continue;
            }
            match &node.kind {
                EntryKind::Val(v) => match v.clone().settled().await {
                    Value::Poison(p) => {
                        for e in p.errors() {
                            dispatch.push_error(Rc::clone(e));
                        }
                    }
                    other if is_embedded_result(&other) => {
                        unwrap_embedded_result(&other, &dispatch, &mut text);
                    }
                    other => text.push_str(&other.to_string()),
                },
                EntryKind::Scope(child) => {
                    let t = walk_script(Rc::clone(child), Rc::clone(&dispatch)).await;
                    text.push_str(&t);
                }
                EntryKind::Command(cmd) if cmd.is_text() => {
                    for arg in &cmd.args {
                        match arg.clone().settled().await {
                            Value::Poison(p) => {
                                for e in p.errors() {
                                    dispatch.push_error(handle_error(Rc::clone(e), &cmd.pos));
                                }
                            }
                            other => text.push_str(&other.to_string()),
                        }
                    }
                }
                EntryKind::Command(cmd) => {
                    run_command(cmd, &dispatch).await;
                }
                EntryKind::Marker(m) => {
                    for e in &m.errors {
                        dispatch.push_error(Rc::clone(e));
                    }
                }
                EntryKind::Revert(_) => {}
                EntryKind::Post(f) => post = Some(Rc::clone(f)),
            }
        }

        if let Some(f) = post {
            text = f(text);
        }
        text
    }
    .boxed_local()
}

async fn run_command(cmd: &CommandCall, dispatch: &Rc<Dispatch>) {
    // Settle all arguments first; a poisoned argument skips the call (the
    // handler never observes poison) but every error is kept.
    let mut settled = Vec::with_capacity(cmd.args.len());
    let mut arg_errors: Vec<Rc<RuntimeError>> = Vec::new();
    for arg in &cmd.args {
        let v = arg.clone().settled().await;
        if let Value::Poison(p) = &v {
            arg_errors.extend(p.errors().iter().cloned());
        }
        settled.push(v);
    }
    if !arg_errors.is_empty() {
        for e in arg_errors {
            dispatch.push_error(handle_error(e, &cmd.pos));
        }
        return;
    }

    let name = cmd.handler.as_deref().unwrap_or("text");
    let handler = match dispatch.resolve_handler(name) {
        Ok(h) => h,
        Err(e) => {
            dispatch.push_error(handle_error(e, &cmd.pos));
            return;
        }
    };
    let outcome = handler
        .borrow_mut()
        .invoke(&cmd.subpath, cmd.command.as_deref(), settled);
    if let Err(e) = outcome {
        dispatch.push_error(handle_error(Rc::new(e), &cmd.pos));
    }
}

/// A structured result returned by a macro/script call into a buffer slot:
/// a map with a string `text` member.  Its text joins the text stream and
/// its other keys merge into the matching handlers.
fn is_embedded_result(v: &Value) -> bool {
    matches!(v, Value::Map(_)) && matches!(v.member("text"), Value::Str(_))
}

fn unwrap_embedded_result(v: &Value, dispatch: &Rc<Dispatch>, text: &mut String) {
    let Value::Map(map) = v else {
        return;
    };
    let entries: Vec<(String, Value)> = map
        .borrow()
        .iter()
        .map(|(k, val)| (k.clone(), val.clone()))
        .collect();
    for (key, val) in entries {
        if key == "text" {
            text.push_str(&val.to_string());
            continue;
        }
        match dispatch.resolve_handler(&key) {
            Ok(handler) => {
                let supported = handler.borrow().supports_merge();
                if supported {
                    if let Err(e) = handler.borrow_mut().merge_root(&val) {
                        dispatch.push_error(Rc::new(e));
                    }
                } else {
                    dispatch.push_error(Rc::new(RuntimeError::new(format!(
                        "handler '{key}' does not accept embedded results"
                    ))));
                }
            }
            Err(e) => dispatch.push_error(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
