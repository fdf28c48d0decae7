//! Environment: the registry a render runs against.
//!
//! Holds user registrations — filters, tests, globals, extensions, data
//! methods, command handler classes and singletons, result-structure keys
//! — and the template lookup cache.  Registration happens before
//! rendering; during a render the registry is read-only.
//!
//! Two variants share one configuration API: [`Environment`] drives
//! renders to completion synchronously (with a thin one-shot callback
//! adapter), and [`AsyncEnvironment`] exposes the same renders as plain
//! `async fn`s.  Filters are normalized to the async-capable [`NativeFn`]
//! shape at registration, so both variants call them uniformly.

use crate::handlers::{CommandHandler, DataHandler, DataMethod, HandlerFactory};
use crate::runner::Template;

use cascada_core::errors::{dedup_errors, PoisonError, PoisonedValue, RuntimeError};
use cascada_core::values::{NativeFn, Value};

use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

// ---------------------------------------------------------------------------
// ResultStructure
// ---------------------------------------------------------------------------

/// Key names of the assembled script result.  Reserved for callers that
/// need `text`/`data` to land under different names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultStructure {
    pub text_key: String,
    pub data_key: String,
}

impl Default for ResultStructure {
    fn default() -> Self {
        Self {
            text_key: "text".to_string(),
            data_key: "data".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Extension
// ---------------------------------------------------------------------------

/// A named extension hook.  The runtime core only tracks registration;
/// extension tags are compiled against the extension object directly.
pub trait Extension {
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// The synchronous environment variant.
pub struct Environment {
    filters: RefCell<HashMap<String, NativeFn>>,
    tests: RefCell<HashMap<String, NativeFn>>,
    globals: RefCell<IndexMap<String, Value>>,
    extensions: RefCell<IndexMap<String, Rc<dyn Extension>>>,
    data_methods: RefCell<HashMap<String, DataMethod>>,
    handler_factories: RefCell<HashMap<String, HandlerFactory>>,
    handler_singletons: RefCell<HashMap<String, Rc<RefCell<dyn CommandHandler>>>>,
    result_structure: RefCell<ResultStructure>,
    templates: RefCell<HashMap<String, Rc<Template>>>,
    dev: Cell<bool>,
}

impl Environment {
    pub fn new() -> Rc<Self> {
        let env = Rc::new(Self {
            filters: RefCell::new(HashMap::new()),
            tests: RefCell::new(HashMap::new()),
            globals: RefCell::new(IndexMap::new()),
            extensions: RefCell::new(IndexMap::new()),
            data_methods: RefCell::new(HashMap::new()),
            handler_factories: RefCell::new(HashMap::new()),
            handler_singletons: RefCell::new(HashMap::new()),
            result_structure: RefCell::new(ResultStructure::default()),
            templates: RefCell::new(HashMap::new()),
            dev: Cell::new(false),
        });
        // The data handler ships built in: a fresh tree per render, seeded
        // with whatever extra methods were registered on the environment.
        env.add_command_handler_class(
            "data",
            Rc::new(|_ctx_vars: &Value, env: &Environment| {
                Rc::new(RefCell::new(DataHandler::new(env.data_methods_snapshot())))
                    as Rc<RefCell<dyn CommandHandler>>
            }),
        );
        env
    }

    /// Dev mode preserves full cause chains in rendered errors.
    pub fn set_dev(&self, on: bool) {
        self.dev.set(on);
    }

    pub fn dev(&self) -> bool {
        self.dev.get()
    }

    // -- filters --------------------------------------------------------

    /// Register a synchronous filter.
    pub fn add_filter(&self, name: &str, f: impl Fn(Vec<Value>) -> Value + 'static) {
        self.add_filter_async(name, NativeFn::sync(name.to_string(), f));
    }

    /// Register an async-capable filter.
    pub fn add_filter_async(&self, name: &str, f: NativeFn) {
        self.filters.borrow_mut().insert(name.to_string(), f);
    }

    pub fn get_filter(&self, name: &str) -> Option<NativeFn> {
        self.filters.borrow().get(name).cloned()
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.filters.borrow().contains_key(name)
    }

    /// Invoke a filter.  Arguments are settled first; any poisoned
    /// argument short-circuits to a merged poison without calling the
    /// filter.
    pub async fn call_filter(&self, name: &str, args: Vec<Value>) -> Value {
        let Some(filter) = self.get_filter(name) else {
            return Value::poison_msg(format!("filter not found: {name}"));
        };
        match settle_arguments(args).await {
            Ok(settled) => filter.call(settled).await,
            Err(poison) => Value::Poison(poison),
        }
    }

    // -- tests ----------------------------------------------------------

    /// Register a test (`value is name`).
    pub fn add_test(&self, name: &str, f: impl Fn(Vec<Value>) -> bool + 'static) {
        self.tests.borrow_mut().insert(
            name.to_string(),
            NativeFn::sync(name.to_string(), move |args| Value::Bool(f(args))),
        );
    }

    pub fn get_test(&self, name: &str) -> Option<NativeFn> {
        self.tests.borrow().get(name).cloned()
    }

    pub fn has_test(&self, name: &str) -> bool {
        self.tests.borrow().contains_key(name)
    }

    pub async fn call_test(&self, name: &str, args: Vec<Value>) -> Value {
        let Some(test) = self.get_test(name) else {
            return Value::poison_msg(format!("test not found: {name}"));
        };
        match settle_arguments(args).await {
            Ok(settled) => test.call(settled).await,
            Err(poison) => Value::Poison(poison),
        }
    }

    // -- globals --------------------------------------------------------

    pub fn add_global(&self, name: &str, value: Value) {
        self.globals.borrow_mut().insert(name.to_string(), value);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.borrow().get(name).cloned()
    }

    /// Global lookup with `Undefined` for missing names (the shape context
    /// resolution wants).
    pub fn global(&self, name: &str) -> Value {
        self.get_global(name).unwrap_or(Value::Undefined)
    }

    pub fn has_global(&self, name: &str) -> bool {
        self.globals.borrow().contains_key(name)
    }

    // -- extensions -----------------------------------------------------

    pub fn add_extension(&self, name: &str, ext: Rc<dyn Extension>) {
        self.extensions.borrow_mut().insert(name.to_string(), ext);
    }

    pub fn get_extension(&self, name: &str) -> Option<Rc<dyn Extension>> {
        self.extensions.borrow().get(name).cloned()
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.borrow().contains_key(name)
    }

    pub fn remove_extension(&self, name: &str) {
        self.extensions.borrow_mut().shift_remove(name);
    }

    // -- data methods & handlers ---------------------------------------

    /// Merge extra methods into the built-in data handler.
    pub fn add_data_methods(&self, methods: HashMap<String, DataMethod>) {
        self.data_methods.borrow_mut().extend(methods);
    }

    pub fn data_methods_snapshot(&self) -> HashMap<String, DataMethod> {
        self.data_methods.borrow().clone()
    }

    /// Factory registration: a fresh handler instance per render.
    pub fn add_command_handler_class(&self, name: &str, factory: HandlerFactory) {
        self.handler_factories
            .borrow_mut()
            .insert(name.to_string(), factory);
    }

    /// Singleton registration: one shared instance across renders.
    pub fn add_command_handler(&self, name: &str, instance: Rc<RefCell<dyn CommandHandler>>) {
        self.handler_singletons
            .borrow_mut()
            .insert(name.to_string(), instance);
    }

    pub fn handler_factory(&self, name: &str) -> Option<HandlerFactory> {
        self.handler_factories.borrow().get(name).cloned()
    }

    pub fn handler_singleton(&self, name: &str) -> Option<Rc<RefCell<dyn CommandHandler>>> {
        self.handler_singletons.borrow().get(name).cloned()
    }

    // -- result structure ----------------------------------------------

    pub fn set_result_structure(&self, structure: ResultStructure) {
        *self.result_structure.borrow_mut() = structure;
    }

    pub fn result_structure(&self) -> ResultStructure {
        self.result_structure.borrow().clone()
    }

    // -- templates ------------------------------------------------------

    /// Put a compiled template into the lookup cache.
    pub fn register_template(&self, name: &str, template: Template) -> Rc<Template> {
        let template = Rc::new(template);
        self.templates
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(&template));
        template
    }

    pub fn get_template(&self, name: &str) -> Result<Rc<Template>, Rc<RuntimeError>> {
        self.templates
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| Rc::new(RuntimeError::new(format!("template not found: {name}"))))
    }

    // -- render ---------------------------------------------------------

    /// Render a registered template to completion on the calling thread.
    pub fn render_template(
        self: &Rc<Self>,
        name: &str,
        context_vars: Value,
    ) -> Result<Value, PoisonError> {
        let template = self
            .get_template(name)
            .map_err(|e| PoisonError::from_errors([e]))?;
        futures::executor::block_on(template.render(self, context_vars, None))
    }

    /// Render an unregistered template ("string" surface).
    pub fn render(
        self: &Rc<Self>,
        template: &Template,
        context_vars: Value,
        focus: Option<&str>,
    ) -> Result<Value, PoisonError> {
        futures::executor::block_on(template.render(self, context_vars, focus))
    }

    /// Callback adapter around [`Environment::render_template`].  The
    /// callback is `FnOnce`: exactly one invocation per render, by
    /// construction.
    pub fn render_template_cb(
        self: &Rc<Self>,
        name: &str,
        context_vars: Value,
        cb: impl FnOnce(Result<Value, PoisonError>),
    ) {
        cb(self.render_template(name, context_vars));
    }
}

/// Settle every argument; any poison merges into one container (all
/// argument errors are kept, none short-circuits the others).
async fn settle_arguments(args: Vec<Value>) -> Result<Vec<Value>, PoisonedValue> {
    let mut settled = Vec::with_capacity(args.len());
    let mut errors = Vec::new();
    for arg in args {
        let v = arg.settled().await;
        if let Value::Poison(p) = &v {
            errors.extend(p.errors().iter().cloned());
        }
        settled.push(v);
    }
    if errors.is_empty() {
        Ok(settled)
    } else {
        Err(PoisonedValue::new(dedup_errors(errors)))
    }
}

// ---------------------------------------------------------------------------
// AsyncEnvironment
// ---------------------------------------------------------------------------

/// The async environment variant: identical configuration API, renders
/// exposed as futures.
pub struct AsyncEnvironment {
    inner: Rc<Environment>,
}

impl AsyncEnvironment {
    pub fn new() -> Self {
        Self {
            inner: Environment::new(),
        }
    }

    pub fn from_env(inner: Rc<Environment>) -> Self {
        Self { inner }
    }

    /// The shared registry.
    pub fn env(&self) -> &Rc<Environment> {
        &self.inner
    }

    pub fn add_filter(&self, name: &str, f: impl Fn(Vec<Value>) -> Value + 'static) {
        self.inner.add_filter(name, f);
    }

    pub fn add_filter_async(&self, name: &str, f: NativeFn) {
        self.inner.add_filter_async(name, f);
    }

    pub fn add_test(&self, name: &str, f: impl Fn(Vec<Value>) -> bool + 'static) {
        self.inner.add_test(name, f);
    }

    pub fn add_global(&self, name: &str, value: Value) {
        self.inner.add_global(name, value);
    }

    pub fn add_data_methods(&self, methods: HashMap<String, DataMethod>) {
        self.inner.add_data_methods(methods);
    }

    pub fn add_command_handler_class(&self, name: &str, factory: HandlerFactory) {
        self.inner.add_command_handler_class(name, factory);
    }

    pub fn add_command_handler(&self, name: &str, instance: Rc<RefCell<dyn CommandHandler>>) {
        self.inner.add_command_handler(name, instance);
    }

    pub fn set_result_structure(&self, structure: ResultStructure) {
        self.inner.set_result_structure(structure);
    }

    pub fn register_template(&self, name: &str, template: Template) -> Rc<Template> {
        self.inner.register_template(name, template)
    }

    /// Promise-returning template lookup.
    pub async fn get_template(&self, name: &str) -> Result<Rc<Template>, Rc<RuntimeError>> {
        self.inner.get_template(name)
    }

    /// Render a registered template.
    pub async fn render_template(
        &self,
        name: &str,
        context_vars: Value,
    ) -> Result<Value, PoisonError> {
        let template = self
            .inner
            .get_template(name)
            .map_err(|e| PoisonError::from_errors([e]))?;
        template.render(&self.inner, context_vars, None).await
    }

    /// Render a registered script, optionally focused on one result key.
    pub async fn render_script(
        &self,
        name: &str,
        context_vars: Value,
        focus: Option<&str>,
    ) -> Result<Value, PoisonError> {
        let template = self
            .inner
            .get_template(name)
            .map_err(|e| PoisonError::from_errors([e]))?;
        template.render(&self.inner, context_vars, focus).await
    }

    /// Render an unregistered template ("string" surface).
    pub async fn render(
        &self,
        template: &Template,
        context_vars: Value,
        focus: Option<&str>,
    ) -> Result<Value, PoisonError> {
        template.render(&self.inner, context_vars, focus).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
