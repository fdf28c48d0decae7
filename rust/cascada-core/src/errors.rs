//! Error and poison model for the Cascada runtime.
//!
//! A failed expression does not unwind the render.  Instead it produces a
//! *poisoned value* — an inspectable container of one or more positioned
//! errors — that contaminates every downstream consumer.  Poison is
//! detectable synchronously ([`Value::is_poison`](crate::values::Value)),
//! so branches and handler calls can skip work without awaiting, and it is
//! consumed by throwing a single aggregated [`PoisonError`] at the end of
//! the render.
//!
//! # Invariants
//!
//! 1. A [`PoisonedValue`] always carries at least one error and is treated
//!    as immutable once created.
//! 2. Positioning is idempotent: once an error carries a line number, no
//!    later layer overwrites it ([`handle_error`]).
//! 3. Aggregation never nests: a [`PoisonError`]'s `errors` list is a flat,
//!    deduplicated list of underlying [`RuntimeError`]s.  Two errors are
//!    "the same" when they are the same allocation (`Rc::ptr_eq`).

use crate::values::Value;

use std::fmt;
use std::rc::Rc;
use thiserror::Error;

// ---------------------------------------------------------------------------
// SourceInfo
// ---------------------------------------------------------------------------

/// Position and context attached to errors raised while evaluating a
/// template region: line/column in the template source, the template path,
/// and a short context tag such as `@data.set` or `for loop`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceInfo {
    pub lineno: Option<u32>,
    pub colno: Option<u32>,
    pub path: Option<String>,
    pub tag: Option<String>,
}

impl SourceInfo {
    /// Position-only info.
    pub fn at(lineno: u32, colno: u32) -> Self {
        Self {
            lineno: Some(lineno),
            colno: Some(colno),
            ..Self::default()
        }
    }

    /// Attach a context tag (e.g. `@handler.method`).
    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Attach a template path.
    pub fn in_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

// ---------------------------------------------------------------------------
// RuntimeError
// ---------------------------------------------------------------------------

/// A positioned runtime error.
///
/// Wraps a cause with the template position at which the failure became
/// observable.  Position fields are optional because errors are often
/// created deep inside a user function and positioned later, exactly once,
/// by [`handle_error`].
#[derive(Debug)]
pub struct RuntimeError {
    message: String,
    pub lineno: Option<u32>,
    pub colno: Option<u32>,
    pub path: Option<String>,
    /// Short context tag, e.g. `@data.set` or `for loop`.
    pub tag: Option<String>,
    source: Option<Rc<dyn std::error::Error + 'static>>,
}

impl RuntimeError {
    /// Create an unpositioned error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            lineno: None,
            colno: None,
            path: None,
            tag: None,
            source: None,
        }
    }

    /// Create an error wrapping a source cause.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + 'static,
    ) -> Self {
        Self {
            source: Some(Rc::new(source)),
            ..Self::new(message)
        }
    }

    /// Attach a position (builder form, used at error creation sites that
    /// already know where they are).
    pub fn at(mut self, lineno: u32, colno: u32) -> Self {
        self.lineno = Some(lineno);
        self.colno = Some(colno);
        self
    }

    /// Attach a context tag.
    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Attach a template path.
    pub fn in_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// The bare message, without position decoration.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// `true` once this error carries a line number.
    pub fn is_positioned(&self) -> bool {
        self.lineno.is_some()
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref path) = self.path {
            write!(f, "({path}) ")?;
        }
        match (self.lineno, self.colno) {
            (Some(l), Some(c)) => write!(f, "[Line {l}, Column {c}] ")?,
            (Some(l), None) => write!(f, "[Line {l}] ")?,
            _ => {}
        }
        if let Some(ref tag) = self.tag {
            write!(f, "{tag}: ")?;
        }
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref()
    }
}

// ---------------------------------------------------------------------------
// handle_error
// ---------------------------------------------------------------------------

/// Position an error, idempotently.
///
/// If `err` already carries a line number it is returned unchanged — the
/// same allocation, so identity-based deduplication still collapses it.
/// Otherwise a new [`RuntimeError`] is built around it with the position,
/// path, and tag from `info`.
pub fn handle_error(err: Rc<RuntimeError>, info: &SourceInfo) -> Rc<RuntimeError> {
    if err.is_positioned() {
        return err;
    }
    Rc::new(RuntimeError {
        message: err.message.clone(),
        lineno: info.lineno,
        colno: info.colno,
        path: info.path.clone().or_else(|| err.path.clone()),
        tag: info.tag.clone().or_else(|| err.tag.clone()),
        source: Some(err),
    })
}

// ---------------------------------------------------------------------------
// PoisonedValue
// ---------------------------------------------------------------------------

/// An inspectable error container flowing through the value graph.
///
/// Cheap to clone; the error list is shared.  Constructed through
/// [`create_poison`] (which positions each member) or directly from
/// already-positioned errors.
#[derive(Clone)]
pub struct PoisonedValue {
    errors: Rc<Vec<Rc<RuntimeError>>>,
}

impl PoisonedValue {
    /// Build from a list of errors.  An empty list is replaced by a single
    /// "unknown error" so the non-empty invariant holds.
    pub fn new(errors: Vec<Rc<RuntimeError>>) -> Self {
        let errors = if errors.is_empty() {
            vec![Rc::new(RuntimeError::new("unknown error"))]
        } else {
            errors
        };
        Self {
            errors: Rc::new(errors),
        }
    }

    /// Build from a single error.
    pub fn from_error(err: Rc<RuntimeError>) -> Self {
        Self {
            errors: Rc::new(vec![err]),
        }
    }

    /// The underlying errors, in the order they were attached.
    pub fn errors(&self) -> &[Rc<RuntimeError>] {
        &self.errors
    }

    /// The thrown/awaited form: a deduplicated [`PoisonError`].
    pub fn to_error(&self) -> PoisonError {
        PoisonError::from_errors(self.errors.iter().cloned())
    }

    /// Union of two poisons, deduplicated, left-to-right order preserved.
    pub fn merged(&self, other: &PoisonedValue) -> PoisonedValue {
        let mut all: Vec<Rc<RuntimeError>> = self.errors.as_ref().clone();
        all.extend(other.errors.iter().cloned());
        PoisonedValue::new(dedup_errors(all))
    }
}

impl fmt::Debug for PoisonedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoisonedValue")
            .field("errors", &self.errors.len())
            .field("first", &self.errors[0].to_string())
            .finish()
    }
}

impl PartialEq for PoisonedValue {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.errors, &other.errors)
    }
}

/// Normalize errors into a poison: each member that lacks position info is
/// positioned from `info`; already-positioned members are preserved
/// verbatim.  Duplicates (same allocation) collapse.
pub fn create_poison(
    errors: impl IntoIterator<Item = Rc<RuntimeError>>,
    info: &SourceInfo,
) -> PoisonedValue {
    let positioned: Vec<Rc<RuntimeError>> = errors
        .into_iter()
        .map(|e| handle_error(e, info))
        .collect();
    PoisonedValue::new(dedup_errors(positioned))
}

// ---------------------------------------------------------------------------
// PoisonError
// ---------------------------------------------------------------------------

/// The thrown form of one or more runtime errors.
///
/// Callers of a failed render see exactly one of these; `errors` is the
/// flat, deduplicated list of every underlying error the render produced.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PoisonError {
    errors: Vec<Rc<RuntimeError>>,
    message: String,
}

impl PoisonError {
    /// Aggregate errors, deduplicating by identity and composing the
    /// summary message.
    pub fn from_errors(errors: impl IntoIterator<Item = Rc<RuntimeError>>) -> Self {
        let errors = dedup_errors(errors.into_iter().collect());
        let errors = if errors.is_empty() {
            vec![Rc::new(RuntimeError::new("unknown error"))]
        } else {
            errors
        };
        let message = if errors.len() == 1 {
            errors[0].to_string()
        } else {
            let mut msg = format!("Multiple errors occurred ({}):", errors.len());
            for (i, e) in errors.iter().enumerate() {
                msg.push_str(&format!("\n  {}. {e}", i + 1));
            }
            msg
        };
        Self { errors, message }
    }

    /// The deduplicated underlying errors.
    pub fn errors(&self) -> &[Rc<RuntimeError>] {
        &self.errors
    }

    /// Detect a poison error behind an arbitrary `dyn Error`, walking the
    /// source chain.
    ///
    /// The dynamically-typed original needed a process-wide sentinel here
    /// because errors could cross realm boundaries; in-process Rust has no
    /// such boundary, so a downcast over the chain is sufficient.
    pub fn is(err: &(dyn std::error::Error + 'static)) -> bool {
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(e) = current {
            if e.downcast_ref::<PoisonError>().is_some() {
                return true;
            }
            current = e.source();
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Poison helpers over values
// ---------------------------------------------------------------------------

/// Settle every value (even after the first failure), then return the
/// deduplicated union of all errors observed in poisoned results.
///
/// Never short-circuits: a parallel render must surface *every*
/// user-observable error, not just the first.
pub async fn collect_errors(values: Vec<Value>) -> Vec<Rc<RuntimeError>> {
    let settled =
        futures::future::join_all(values.into_iter().map(|v| async move { v.settled().await }))
            .await;
    let mut errors = Vec::new();
    for v in settled {
        if let Value::Poison(p) = v {
            errors.extend(p.errors().iter().cloned());
        }
    }
    dedup_errors(errors)
}

/// Async failure detection: `true` when the value is poison, or is a
/// pending value that settles to poison.
pub async fn is_error(value: Value) -> bool {
    value.settled().await.is_poison()
}

/// Introspect a value's failure state without unwrapping it.
///
/// For a poisoned value, returns the poison itself.  For anything else,
/// returns a poison *describing* the healthy case, so diagnostic code has a
/// uniform shape to print.
pub fn peek_error(value: &Value) -> PoisonedValue {
    match value {
        Value::Poison(p) => p.clone(),
        other => PoisonedValue::from_error(Rc::new(RuntimeError::new(format!(
            "value is not poisoned ({})",
            other.type_name()
        )))),
    }
}

/// Identity-based deduplication, preserving first-seen order.
pub fn dedup_errors(errors: Vec<Rc<RuntimeError>>) -> Vec<Rc<RuntimeError>> {
    let mut out: Vec<Rc<RuntimeError>> = Vec::with_capacity(errors.len());
    for e in errors {
        if !out.iter().any(|seen| Rc::ptr_eq(seen, &e)) {
            out.push(e);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::values::PendingValue;

    #[test]
    fn positioning_is_idempotent() {
        let raw = Rc::new(RuntimeError::new("boom"));
        let p1 = SourceInfo::at(3, 7);
        let p2 = SourceInfo::at(9, 1);

        let once = handle_error(Rc::clone(&raw), &p1);
        let twice = handle_error(Rc::clone(&once), &p2);

        assert!(Rc::ptr_eq(&once, &twice));
        assert_eq!(once.lineno, Some(3));
        assert_eq!(once.colno, Some(7));
    }

    #[test]
    fn positioned_errors_pass_through_create_poison() {
        let positioned = Rc::new(RuntimeError::new("early").at(1, 1));
        let poison = create_poison([Rc::clone(&positioned)], &SourceInfo::at(5, 5));
        assert!(Rc::ptr_eq(&poison.errors()[0], &positioned));
        assert_eq!(poison.errors()[0].lineno, Some(1));
    }

    #[test]
    fn display_includes_path_position_and_tag() {
        let err = RuntimeError::new("no such method")
            .at(12, 4)
            .tagged("@data.set")
            .in_path("report.casc");
        assert_eq!(
            err.to_string(),
            "(report.casc) [Line 12, Column 4] @data.set: no such method"
        );
    }

    #[test]
    fn single_error_message_matches_underlying() {
        let err = Rc::new(RuntimeError::new("fetch failed").at(2, 2));
        let pe = PoisonError::from_errors([err.clone()]);
        assert_eq!(pe.to_string(), err.to_string());
        assert_eq!(pe.errors().len(), 1);
    }

    #[test]
    fn multi_error_message_is_numbered() {
        let a = Rc::new(RuntimeError::new("first"));
        let b = Rc::new(RuntimeError::new("second"));
        let pe = PoisonError::from_errors([a, b]);
        let msg = pe.to_string();
        assert!(msg.starts_with("Multiple errors occurred (2):"));
        assert!(msg.contains("1. first"));
        assert!(msg.contains("2. second"));
    }

    #[test]
    fn dedup_is_by_identity_not_message() {
        let a = Rc::new(RuntimeError::new("same message"));
        let b = Rc::new(RuntimeError::new("same message"));
        let pe = PoisonError::from_errors([a.clone(), a.clone(), b]);
        // Same allocation collapses; equal text does not.
        assert_eq!(pe.errors().len(), 2);
    }

    #[test]
    fn merged_poisons_union_without_duplicates() {
        let a = Rc::new(RuntimeError::new("a"));
        let b = Rc::new(RuntimeError::new("b"));
        let p1 = PoisonedValue::new(vec![a.clone(), b.clone()]);
        let p2 = PoisonedValue::new(vec![b, Rc::new(RuntimeError::new("c"))]);
        let merged = p1.merged(&p2);
        assert_eq!(merged.errors().len(), 3);
    }

    #[test]
    fn poison_error_detection_walks_source_chain() {
        let pe = PoisonError::from_errors([Rc::new(RuntimeError::new("inner"))]);
        let wrapped = RuntimeError::with_source("outer", pe);
        assert!(PoisonError::is(&wrapped));
        assert!(!PoisonError::is(&RuntimeError::new("plain")));
    }

    #[test]
    fn peek_error_reports_healthy_values() {
        let healthy = peek_error(&Value::from(1i64));
        assert!(healthy.errors()[0].message().contains("not poisoned"));

        let err = Rc::new(RuntimeError::new("bad"));
        let poisoned = Value::Poison(PoisonedValue::from_error(err.clone()));
        let peeked = peek_error(&poisoned);
        assert!(Rc::ptr_eq(&peeked.errors()[0], &err));
    }

    #[tokio::test]
    async fn collect_errors_settles_everything() {
        let e1 = Rc::new(RuntimeError::new("one"));
        let e2 = Rc::new(RuntimeError::new("two"));

        let immediate = Value::Poison(PoisonedValue::from_error(e1.clone()));
        let e2c = e2.clone();
        let deferred = Value::Pending(PendingValue::new(async move {
            Value::Poison(PoisonedValue::from_error(e2c))
        }));
        let fine = Value::from("ok");

        let errors = collect_errors(vec![immediate, deferred, fine]).await;
        assert_eq!(errors.len(), 2);
        assert!(Rc::ptr_eq(&errors[0], &e1));
        assert!(Rc::ptr_eq(&errors[1], &e2));
    }

    #[tokio::test]
    async fn is_error_sees_through_pending() {
        let pending = Value::Pending(PendingValue::new(async {
            Value::poison_msg("late failure")
        }));
        assert!(is_error(pending).await);
        assert!(!is_error(Value::Null).await);
    }
}
