//! Command handlers: the user-registered capabilities behind `@name.…`
//! commands in the output buffer.
//!
//! A handler is addressed as `@name.sub.path.method(args)`.  Dispatch is a
//! method-lookup capability: the flattener hands the handler its subpath,
//! command name, and settled arguments, and the handler either runs the
//! effect or returns an error the flattener positions.  Statically-typed
//! handlers implement the lookup directly; nothing in the runtime walks
//! properties reflectively.
//!
//! Two registration shapes exist on the environment:
//!
//! - *factory* ([`HandlerFactory`]) — a fresh instance per render, built
//!   from the render's context variables.
//! - *singleton* — one shared instance across renders; the [`CommandHandler::init`]
//!   hook runs at the start of each render so per-render state can reset.
//!
//! The built-in `data` handler assembles a result tree from `set`/`push`/
//! `merge`/`deep_merge` commands and whatever extra methods were registered
//! through `add_data_methods`.

use crate::environment::Environment;

use cascada_core::errors::RuntimeError;
use cascada_core::values::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

// ---------------------------------------------------------------------------
// CommandHandler
// ---------------------------------------------------------------------------

/// A capability invoked from the output buffer.
pub trait CommandHandler {
    /// Per-render reset hook; receives the render's context variables.
    fn init(&mut self, _context_vars: &Value) {}

    /// Dispatch `command` under `subpath` with already-settled arguments.
    ///
    /// `command == None` means the handler itself was called
    /// (`@name(args)`); handlers that are not callable as functions should
    /// return a "not callable" error for that case.
    fn invoke(
        &mut self,
        subpath: &[String],
        command: Option<&str>,
        args: Vec<Value>,
    ) -> Result<Value, RuntimeError>;

    /// Whether this handler accepts root merges from embedded structured
    /// results (`merge(null, value)`).
    fn supports_merge(&self) -> bool {
        false
    }

    /// Root merge from an embedded structured result.
    fn merge_root(&mut self, _value: &Value) -> Result<(), RuntimeError> {
        Err(RuntimeError::new("merge is not supported by this handler"))
    }

    /// The handler's contribution to the assembled result, if any.
    fn return_value(&self) -> Option<Value> {
        None
    }
}

/// Factory for per-render handler instances: `(context_variables, env)`.
pub type HandlerFactory = Rc<dyn Fn(&Value, &Environment) -> Rc<RefCell<dyn CommandHandler>>>;

/// An extra method for the built-in data handler, registered through
/// `add_data_methods`.  Receives the data root, the command's subpath, and
/// the raw settled arguments; argument parsing is up to the method.
pub type DataMethod =
    Rc<dyn Fn(&Value, &[String], Vec<Value>) -> Result<(), RuntimeError>>;

// ---------------------------------------------------------------------------
// DataHandler
// ---------------------------------------------------------------------------

/// The built-in `data` handler: builds a value tree addressed by dotted
/// paths (`@data.set(out.users, v)`) or by subpath
/// (`@data.out.users.set(v)`), and returns the tree as its result
/// contribution.
pub struct DataHandler {
    root: Value,
    methods: HashMap<String, DataMethod>,
}

impl DataHandler {
    pub fn new(methods: HashMap<String, DataMethod>) -> Self {
        Self {
            root: Value::map(),
            methods,
        }
    }

    /// The assembled tree.
    pub fn root(&self) -> &Value {
        &self.root
    }

    fn set(&mut self, path: &[String], value: Value) -> Result<(), RuntimeError> {
        if path.is_empty() {
            self.root = value;
            return Ok(());
        }
        self.ensure_map_root();
        self.root
            .set_path(path, value)
            .map_err(|e| RuntimeError::new(e.message()))
    }

    fn push(&mut self, path: &[String], value: Value) -> Result<(), RuntimeError> {
        let target = if path.is_empty() {
            self.root.clone()
        } else {
            self.ensure_map_root();
            match self.root.get_path(path) {
                Value::Undefined => {
                    let fresh = Value::list(Vec::new());
                    self.root
                        .set_path(path, fresh.clone())
                        .map_err(|e| RuntimeError::new(e.message()))?;
                    fresh
                }
                existing => existing,
            }
        };
        match target {
            Value::List(items) => {
                items.borrow_mut().push(value);
                Ok(())
            }
            other => Err(RuntimeError::new(format!(
                "cannot push into {}",
                other.type_name()
            ))),
        }
    }

    fn merge(&mut self, path: &[String], value: Value, deep: bool) -> Result<(), RuntimeError> {
        if path.is_empty() {
            return self.merge_into_root(&value, deep);
        }
        self.ensure_map_root();
        let target = match self.root.get_path(path) {
            Value::Undefined => {
                let fresh = Value::map();
                self.root
                    .set_path(path, fresh.clone())
                    .map_err(|e| RuntimeError::new(e.message()))?;
                fresh
            }
            existing => existing,
        };
        merge_maps(&target, &value, deep)
    }

    /// Root merge semantics: deep merge when both sides are maps,
    /// wholesale replacement otherwise.
    fn merge_into_root(&mut self, value: &Value, deep: bool) -> Result<(), RuntimeError> {
        if matches!((&self.root, value), (Value::Map(_), Value::Map(_))) {
            merge_maps(&self.root, value, deep)
        } else {
            self.root = value.clone();
            Ok(())
        }
    }

    fn ensure_map_root(&mut self) {
        if !matches!(self.root, Value::Map(_)) {
            self.root = Value::map();
        }
    }
}

impl CommandHandler for DataHandler {
    fn init(&mut self, _context_vars: &Value) {
        self.root = Value::map();
    }

    fn invoke(
        &mut self,
        subpath: &[String],
        command: Option<&str>,
        args: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        let Some(cmd) = command else {
            return Err(RuntimeError::new(
                "the data handler is not callable; use a method such as data.set",
            ));
        };
        if let Some(method) = self.methods.get(cmd).cloned() {
            method(&self.root, subpath, args)?;
            return Ok(Value::Undefined);
        }
        let (path, value) = split_path_args(subpath, args)?;
        match cmd {
            "set" => self.set(&path, value)?,
            "push" => self.push(&path, value)?,
            "merge" => self.merge(&path, value, false)?,
            "deep_merge" => self.merge(&path, value, true)?,
            other => {
                return Err(RuntimeError::new(format!(
                    "data handler has no method '{other}'"
                )))
            }
        }
        Ok(Value::Undefined)
    }

    fn supports_merge(&self) -> bool {
        true
    }

    fn merge_root(&mut self, value: &Value) -> Result<(), RuntimeError> {
        self.merge_into_root(value, true)
    }

    fn return_value(&self) -> Option<Value> {
        Some(self.root.clone())
    }
}

/// Split data-command arguments into `(target path, value)`.
///
/// One argument: the value, targeting the subpath.  Two arguments: a path
/// (dotted string, list of strings, or null for the root) followed by the
/// value; the path extends the subpath.
fn split_path_args(
    subpath: &[String],
    mut args: Vec<Value>,
) -> Result<(Vec<String>, Value), RuntimeError> {
    let mut path: Vec<String> = subpath.to_vec();
    let value = match args.len() {
        1 => args.pop().expect("len checked"),
        2 => {
            let value = args.pop().expect("len checked");
            let raw = args.pop().expect("len checked");
            path.extend(parse_path_value(&raw)?);
            value
        }
        n => {
            return Err(RuntimeError::new(format!(
                "expected (path, value) or (value), got {n} arguments"
            )))
        }
    };
    Ok((path, value))
}

fn parse_path_value(v: &Value) -> Result<Vec<String>, RuntimeError> {
    match v {
        Value::Undefined | Value::Null => Ok(Vec::new()),
        Value::Str(s) => Ok(s.split('.').map(str::to_string).collect()),
        Value::List(items) => items
            .borrow()
            .iter()
            .map(|item| match item {
                Value::Str(s) => Ok(s.to_string()),
                other => Err(RuntimeError::new(format!(
                    "data path segments must be strings, got {}",
                    other.type_name()
                ))),
            })
            .collect(),
        other => Err(RuntimeError::new(format!(
            "invalid data path ({})",
            other.type_name()
        ))),
    }
}

/// Merge `src` (a map) into `dst` (a map).  Shallow merge replaces values
/// key by key; deep merge recurses where both sides are maps.
fn merge_maps(dst: &Value, src: &Value, deep: bool) -> Result<(), RuntimeError> {
    let (Value::Map(dst_map), Value::Map(src_map)) = (dst, src) else {
        return Err(RuntimeError::new(format!(
            "can only merge objects, got {} into {}",
            src.type_name(),
            dst.type_name()
        )));
    };
    let entries: Vec<(String, Value)> = src_map
        .borrow()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (key, src_val) in entries {
        let nested = deep
            && matches!(src_val, Value::Map(_))
            && matches!(dst_map.borrow().get(&key), Some(Value::Map(_)));
        if nested {
            let dst_val = dst_map.borrow().get(&key).cloned().expect("just checked");
            merge_maps(&dst_val, &src_val, true)?;
        } else {
            dst_map.borrow_mut().insert(key, src_val);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invoke(h: &mut DataHandler, cmd: &str, args: Vec<Value>) {
        h.invoke(&[], Some(cmd), args).unwrap();
    }

    #[test]
    fn set_builds_nested_paths() {
        let mut h = DataHandler::new(HashMap::new());
        invoke(&mut h, "set", vec![Value::from("out.users"), Value::Int(3)]);
        assert_eq!(
            h.return_value().unwrap().to_json().unwrap(),
            json!({"out": {"users": 3}})
        );
    }

    #[test]
    fn subpath_addresses_the_same_tree() {
        let mut h = DataHandler::new(HashMap::new());
        h.invoke(
            &["out".to_string(), "users".to_string()],
            Some("set"),
            vec![Value::Int(3)],
        )
        .unwrap();
        assert_eq!(
            h.return_value().unwrap().to_json().unwrap(),
            json!({"out": {"users": 3}})
        );
    }

    #[test]
    fn push_creates_the_list_on_first_use() {
        let mut h = DataHandler::new(HashMap::new());
        invoke(&mut h, "push", vec![Value::from("log"), Value::from("a")]);
        invoke(&mut h, "push", vec![Value::from("log"), Value::from("b")]);
        assert_eq!(
            h.return_value().unwrap().to_json().unwrap(),
            json!({"log": ["a", "b"]})
        );
    }

    #[test]
    fn push_into_scalar_is_an_error() {
        let mut h = DataHandler::new(HashMap::new());
        invoke(&mut h, "set", vec![Value::from("n"), Value::Int(1)]);
        let err = h
            .invoke(&[], Some("push"), vec![Value::from("n"), Value::Int(2)])
            .unwrap_err();
        assert!(err.message().contains("cannot push"));
    }

    #[test]
    fn shallow_merge_replaces_nested_maps() {
        let mut h = DataHandler::new(HashMap::new());
        invoke(
            &mut h,
            "set",
            vec![Value::from("cfg"), Value::from_json(&json!({"a": {"x": 1}, "b": 2}))],
        );
        invoke(
            &mut h,
            "merge",
            vec![Value::from("cfg"), Value::from_json(&json!({"a": {"y": 9}}))],
        );
        assert_eq!(
            h.return_value().unwrap().to_json().unwrap(),
            json!({"cfg": {"a": {"y": 9}, "b": 2}})
        );
    }

    #[test]
    fn deep_merge_recurses() {
        let mut h = DataHandler::new(HashMap::new());
        invoke(
            &mut h,
            "set",
            vec![Value::from("cfg"), Value::from_json(&json!({"a": {"x": 1}}))],
        );
        invoke(
            &mut h,
            "deep_merge",
            vec![Value::from("cfg"), Value::from_json(&json!({"a": {"y": 2}}))],
        );
        assert_eq!(
            h.return_value().unwrap().to_json().unwrap(),
            json!({"cfg": {"a": {"x": 1, "y": 2}}})
        );
    }

    #[test]
    fn root_merge_deep_merges_maps_and_replaces_otherwise() {
        let mut h = DataHandler::new(HashMap::new());
        invoke(
            &mut h,
            "set",
            vec![Value::Null, Value::from_json(&json!({"a": {"x": 1}}))],
        );
        h.merge_root(&Value::from_json(&json!({"a": {"y": 2}}))).unwrap();
        assert_eq!(
            h.return_value().unwrap().to_json().unwrap(),
            json!({"a": {"x": 1, "y": 2}})
        );

        h.merge_root(&Value::from("flat")).unwrap();
        assert_eq!(h.return_value().unwrap(), Value::from("flat"));
    }

    #[test]
    fn registered_methods_take_precedence() {
        let mut methods: HashMap<String, DataMethod> = HashMap::new();
        methods.insert(
            "tag".to_string(),
            Rc::new(|root, _subpath, args| {
                root.set_path(&["tagged"], args.into_iter().next().unwrap_or(Value::Null))
                    .map_err(|e| RuntimeError::new(e.message()))
            }),
        );
        let mut h = DataHandler::new(methods);
        invoke(&mut h, "tag", vec![Value::from("v1")]);
        assert_eq!(
            h.return_value().unwrap().to_json().unwrap(),
            json!({"tagged": "v1"})
        );
    }

    #[test]
    fn data_handler_is_not_callable_as_a_function() {
        let mut h = DataHandler::new(HashMap::new());
        let err = h.invoke(&[], None, vec![Value::Int(1)]).unwrap_err();
        assert!(err.message().contains("not callable"));
    }

    #[test]
    fn unknown_method_is_an_error() {
        let mut h = DataHandler::new(HashMap::new());
        let err = h
            .invoke(&[], Some("explode"), vec![Value::Int(1)])
            .unwrap_err();
        assert!(err.message().contains("no method 'explode'"));
    }

    #[test]
    fn init_resets_per_render_state() {
        let mut h = DataHandler::new(HashMap::new());
        invoke(&mut h, "set", vec![Value::from("k"), Value::Int(1)]);
        h.init(&Value::map());
        assert_eq!(h.return_value().unwrap().to_json().unwrap(), json!({}));
    }
}
