//! The Cascada runtime value type.
//!
//! Every template expression evaluates to a [`Value`].  Beyond the usual
//! scalar and container variants there are three runtime-only variants:
//!
//! - [`Value::Pending`] — a value that will exist later; a cheap-to-clone
//!   shared future.  Reads that need the real value call
//!   [`Value::settled`].
//! - [`Value::Poison`] — an inspectable error container (see
//!   [`crate::errors`]).  Detectable synchronously, so branches can skip
//!   work without awaiting.
//! - [`Value::Stream`] — an async sequence, the loop driver's view of an
//!   async iterator.  `next()` calls are serialized behind an async lock so
//!   bounded worker pools never call into the underlying stream
//!   concurrently.
//!
//! Values are deliberately `!Send`: the runtime is single-threaded
//! cooperative, and all sharing is `Rc`-based.

use crate::errors::{PoisonedValue, RuntimeError};

use futures::channel::oneshot;
use futures::future::{FutureExt, LocalBoxFuture, Shared};
use futures::stream::{self, LocalBoxStream, Stream, StreamExt};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A runtime value.
#[derive(Clone)]
pub enum Value {
    /// Absent value; renders as the empty string.
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    /// Insertion-ordered map — object iteration order is observable.
    Map(Rc<RefCell<IndexMap<String, Value>>>),
    /// A callable registered from the host (globals, filters, handlers).
    Func(NativeFn),
    /// An async sequence of values.
    Stream(ValueStream),
    /// A value that will exist later.
    Pending(PendingValue),
    /// A failed value carrying its errors.
    Poison(PoisonedValue),
}

impl Value {
    /// Build a list value.
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    /// Build an empty map value.
    pub fn map() -> Value {
        Value::Map(Rc::new(RefCell::new(IndexMap::new())))
    }

    /// Build a map from key/value pairs, preserving order.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, Value)>) -> Value {
        Value::Map(Rc::new(RefCell::new(pairs.into_iter().collect())))
    }

    /// Build a single-error poison from a message.
    pub fn poison_msg(message: impl Into<String>) -> Value {
        Value::Poison(PoisonedValue::from_error(Rc::new(RuntimeError::new(
            message,
        ))))
    }

    /// Build a poison from an error.
    pub fn poison(err: Rc<RuntimeError>) -> Value {
        Value::Poison(PoisonedValue::from_error(err))
    }

    /// Synchronous poison check.  Never awaits; a pending value that will
    /// settle to poison reports `false` here (use
    /// [`crate::errors::is_error`] for the async check).
    pub fn is_poison(&self) -> bool {
        matches!(self, Value::Poison(_))
    }

    /// Borrow the poison container, if poisoned.
    pub fn as_poison(&self) -> Option<&PoisonedValue> {
        match self {
            Value::Poison(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Value::Pending(_))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Await pending chains until the value is settled (possibly poison).
    pub async fn settled(self) -> Value {
        let mut v = self;
        loop {
            match v {
                Value::Pending(p) => v = p.wait().await,
                other => return other,
            }
        }
    }

    /// Truthiness for settled values, JS-flavored: empty strings and zero
    /// are falsy, containers are always truthy.  Poison is falsy so that
    /// code which failed to check for it does not take a branch on garbage.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null | Value::Poison(_) => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(x) => *x != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(_) | Value::Map(_) | Value::Func(_) | Value::Stream(_) => true,
            Value::Pending(_) => true,
        }
    }

    /// A short type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) | Value::Float(_) => "number",
            Value::Str(_) => "string",
            Value::List(_) => "array",
            Value::Map(_) => "object",
            Value::Func(_) => "function",
            Value::Stream(_) => "stream",
            Value::Pending(_) => "pending",
            Value::Poison(_) => "poison",
        }
    }

    /// Map member lookup; `Undefined` for anything else.
    pub fn member(&self, key: &str) -> Value {
        match self {
            Value::Map(m) => m.borrow().get(key).cloned().unwrap_or(Value::Undefined),
            Value::Poison(_) => self.clone(),
            _ => Value::Undefined,
        }
    }

    /// List index lookup; `Undefined` out of range or for non-lists.
    pub fn index(&self, i: usize) -> Value {
        match self {
            Value::List(items) => items.borrow().get(i).cloned().unwrap_or(Value::Undefined),
            Value::Poison(_) => self.clone(),
            _ => Value::Undefined,
        }
    }

    /// Walk a property chain.  Poison propagates; a missing step yields
    /// `Undefined`.
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Value {
        let mut current = self.clone();
        for seg in path {
            current = current.member(seg.as_ref());
        }
        current
    }

    /// Write through a property chain on a map, creating intermediate maps
    /// for missing or undefined steps.
    pub fn set_path<S: AsRef<str>>(&self, path: &[S], value: Value) -> Result<(), Rc<RuntimeError>> {
        let Value::Map(map) = self else {
            return Err(Rc::new(RuntimeError::new(format!(
                "cannot set property on {}",
                self.type_name()
            ))));
        };
        let Some(first) = path.first() else {
            return Err(Rc::new(RuntimeError::new("empty property path")));
        };
        let key = first.as_ref();
        if path.len() == 1 {
            map.borrow_mut().insert(key.to_string(), value);
            return Ok(());
        }
        let next = {
            let mut m = map.borrow_mut();
            match m.get(key) {
                Some(Value::Map(inner)) => Value::Map(Rc::clone(inner)),
                Some(Value::Undefined) | None => {
                    let fresh = Value::map();
                    m.insert(key.to_string(), fresh.clone());
                    fresh
                }
                Some(other) => {
                    return Err(Rc::new(RuntimeError::new(format!(
                        "cannot set property '{}' on {}",
                        path[1].as_ref(),
                        other.type_name()
                    ))))
                }
            }
        };
        next.set_path(&path[1..], value)
    }

    /// Call the value.  Non-callables and poison produce poison rather than
    /// unwinding, so call sites stay uniform.
    pub async fn call(&self, args: Vec<Value>) -> Value {
        match self {
            Value::Func(f) => f.call(args).await,
            Value::Poison(_) => self.clone(),
            other => Value::poison_msg(format!("{} is not callable", other.type_name())),
        }
    }

    /// Convert from a JSON tree (context construction, test fixtures).
    pub fn from_json(v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::from(s.as_str()),
            serde_json::Value::Array(items) => {
                Value::list(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::from_pairs(
                map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))),
            ),
        }
    }

    /// Convert to a JSON tree.  Runtime-only variants do not serialize.
    pub fn to_json(&self) -> Result<serde_json::Value, Rc<RuntimeError>> {
        match self {
            Value::Undefined | Value::Null => Ok(serde_json::Value::Null),
            Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
            Value::Int(i) => Ok(serde_json::Value::from(*i)),
            Value::Float(x) => Ok(serde_json::Number::from_f64(*x)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null)),
            Value::Str(s) => Ok(serde_json::Value::String(s.to_string())),
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.borrow().len());
                for item in items.borrow().iter() {
                    out.push(item.to_json()?);
                }
                Ok(serde_json::Value::Array(out))
            }
            Value::Map(m) => {
                let mut out = serde_json::Map::new();
                for (k, v) in m.borrow().iter() {
                    out.insert(k.clone(), v.to_json()?);
                }
                Ok(serde_json::Value::Object(out))
            }
            other => Err(Rc::new(RuntimeError::new(format!(
                "{} is not serializable",
                other.type_name()
            )))),
        }
    }
}

impl fmt::Display for Value {
    /// The output-text form used by buffer flattening: `undefined` and
    /// `null` contribute nothing, lists join with commas, maps render as
    /// JSON.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined | Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::List(items) => {
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
            Value::Map(_) => match self.to_json() {
                Ok(json) => write!(f, "{json}"),
                Err(_) => write!(f, "[object]"),
            },
            Value::Func(func) => write!(f, "[function {}]", func.name()),
            Value::Stream(_) => write!(f, "[stream]"),
            Value::Pending(_) => write!(f, "[pending]"),
            Value::Poison(_) => write!(f, "[poisoned]"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "Undefined"),
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::List(items) => write!(f, "List({:?})", items.borrow()),
            Value::Map(m) => {
                write!(f, "Map{{")?;
                for (i, (k, v)) in m.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k:?}: {v:?}")?;
                }
                write!(f, "}}")
            }
            Value::Func(func) => write!(f, "Func({})", func.name()),
            Value::Stream(_) => write!(f, "Stream"),
            Value::Pending(p) => write!(f, "Pending(#{})", p.id()),
            Value::Poison(p) => write!(f, "{p:?}"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Func(a), Value::Func(b)) => a.ptr_eq(b),
            (Value::Stream(a), Value::Stream(b)) => Rc::ptr_eq(&a.inner, &b.inner),
            (Value::Pending(a), Value::Pending(b)) => a.id() == b.id(),
            (Value::Poison(a), Value::Poison(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s.as_str()))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

// ---------------------------------------------------------------------------
// PendingValue
// ---------------------------------------------------------------------------

static NEXT_PENDING_ID: AtomicU64 = AtomicU64::new(1);

/// A shared future resolving to a [`Value`].
///
/// Carries a process-unique id so a variable slot can be compared for
/// identity: a resolver only writes its settled value back into a slot that
/// still holds *its own* pending value (a later writer may have replaced
/// it, taking over responsibility for the slot).
#[derive(Clone)]
pub struct PendingValue {
    id: u64,
    fut: Shared<LocalBoxFuture<'static, Value>>,
}

impl PendingValue {
    /// Wrap a future.
    pub fn new(fut: impl Future<Output = Value> + 'static) -> Self {
        Self {
            id: NEXT_PENDING_ID.fetch_add(1, Ordering::Relaxed),
            fut: fut.boxed_local().shared(),
        }
    }

    /// Create a pending value together with its one-shot resolver.
    ///
    /// If the resolver is dropped unresolved the pending value settles to
    /// poison, so a lost write surfaces as an error instead of a hang.
    pub fn channel() -> (Self, ValueResolver) {
        let (tx, rx) = oneshot::channel();
        let pending = Self::new(async move {
            match rx.await {
                Ok(v) => v,
                Err(_) => Value::poison_msg("value slot dropped before it was resolved"),
            }
        });
        (pending, ValueResolver { tx })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Await the settled value.  Clones of the same pending value all
    /// observe the same result.
    pub async fn wait(&self) -> Value {
        self.fut.clone().await
    }
}

/// The write side of [`PendingValue::channel`].
pub struct ValueResolver {
    tx: oneshot::Sender<Value>,
}

impl ValueResolver {
    /// Resolve the paired pending value.  Consumes the resolver — a slot
    /// resolves exactly once.
    pub fn resolve(self, value: Value) {
        let _ = self.tx.send(value);
    }
}

// ---------------------------------------------------------------------------
// ValueStream
// ---------------------------------------------------------------------------

/// An async sequence of values.
///
/// `Ok(value)` items are loop iterations (a poisoned value is a *soft*
/// failure: that iteration's effects poison but the loop continues).
/// An `Err` item is a *hard* failure of the source itself and stops
/// iteration.
#[derive(Clone)]
pub struct ValueStream {
    inner: Rc<futures::lock::Mutex<LocalBoxStream<'static, Result<Value, Rc<RuntimeError>>>>>,
}

impl ValueStream {
    pub fn new(s: impl Stream<Item = Result<Value, Rc<RuntimeError>>> + 'static) -> Self {
        Self {
            inner: Rc::new(futures::lock::Mutex::new(s.boxed_local())),
        }
    }

    /// A stream over already-materialized values.
    pub fn from_values(items: Vec<Value>) -> Self {
        Self::new(stream::iter(items.into_iter().map(Ok)))
    }

    /// Pull the next item.  The async lock is the `next()` gate: no two
    /// callers are ever inside the underlying stream at once, which is what
    /// makes the bounded worker pool safe.
    pub async fn next(&self) -> Option<Result<Value, Rc<RuntimeError>>> {
        let mut guard = self.inner.lock().await;
        guard.next().await
    }
}

// ---------------------------------------------------------------------------
// NativeFn
// ---------------------------------------------------------------------------

type NativeFnInner = dyn Fn(Vec<Value>) -> LocalBoxFuture<'static, Value>;

/// A host-registered callable.  Failures are returned as poison values,
/// never unwound.
#[derive(Clone)]
pub struct NativeFn {
    name: Rc<str>,
    f: Rc<NativeFnInner>,
}

impl NativeFn {
    pub fn new(
        name: impl Into<Rc<str>>,
        f: impl Fn(Vec<Value>) -> LocalBoxFuture<'static, Value> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            f: Rc::new(f),
        }
    }

    /// Wrap a synchronous function.
    pub fn sync(name: impl Into<Rc<str>>, f: impl Fn(Vec<Value>) -> Value + 'static) -> Self {
        Self::new(name, move |args| {
            futures::future::ready(f(args)).boxed_local()
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, args: Vec<Value>) -> Value {
        (self.f)(args).await
    }

    pub fn ptr_eq(&self, other: &NativeFn) -> bool {
        Rc::ptr_eq(&self.f, &other.f)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
