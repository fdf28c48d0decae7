//! The loop driver: iteration over arrays, objects, and async sequences
//! under three concurrency policies.
//!
//! Policies:
//!
//! - *sequential* — each body awaited before the next item is pulled.
//! - *parallel* — every body fired without awaiting; completion is tracked
//!   by the surrounding async-block counters.
//! - *bounded* — a worker pool of `limit` tasks; for async sources the
//!   `next()` gate inside [`ValueStream`] guarantees the underlying
//!   sequence is never pulled concurrently.
//!
//! Arrays and objects expose exact `loop.length`/`loop.last` bindings.  A
//! parallel async source exposes them as pending values that settle when
//! the source is exhausted (length) or the next item arrives (last);
//! sequential and bounded async iteration leave the length undefined.
//!
//! The `else` branch runs iff zero iterations ran and no hard failure
//! aborted the source.  Side effects of branches that end up not running
//! are accounted for through the frame's write counters; failed loops
//! poison them instead (see [`poison_loop_effects`]).

use crate::buffer::OutputBuffer;
use crate::frame::Frame;
use crate::state::AsyncState;

use cascada_core::errors::{
    dedup_errors, handle_error, PoisonError, PoisonedValue, RuntimeError, SourceInfo,
};
use cascada_core::values::{PendingValue, Value, ValueResolver, ValueStream};

use futures::future::LocalBoxFuture;
use futures::stream;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

// ---------------------------------------------------------------------------
// Options & bindings
// ---------------------------------------------------------------------------

/// Compiler-provided description of one loop statement.
pub struct LoopOptions {
    /// Force one-at-a-time iteration.
    pub sequential: bool,
    /// Concurrency cap: `Undefined`/`Null`/`0` mean unlimited, `1` is a
    /// sequential override, and a pending value is awaited first.
    pub concurrent_limit: Value,
    /// Writes the body would perform on enclosing variables.
    pub body_write_counts: Vec<(String, usize)>,
    /// Writes the `else` branch would perform.
    pub else_write_counts: Vec<(String, usize)>,
    /// Handlers the body would emit to (`"text"` for the text channel).
    pub body_handlers: Vec<String>,
    /// Handlers the `else` branch would emit to.
    pub else_handlers: Vec<String>,
    /// Position/context for errors raised by this loop.
    pub info: SourceInfo,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            sequential: false,
            concurrent_limit: Value::Undefined,
            body_write_counts: Vec::new(),
            else_write_counts: Vec::new(),
            body_handlers: Vec::new(),
            else_handlers: Vec::new(),
            info: SourceInfo::default(),
        }
    }
}

/// Per-iteration bindings handed to the compiled body.
pub struct LoopIteration {
    /// Destructured loop variables.
    pub values: Vec<Value>,
    /// 0-based index.
    pub index: usize,
    /// Total length: an `Int` for arrays/objects, a pending value for a
    /// parallel async source, `Undefined` otherwise.
    pub length: Value,
    /// Whether this is the final iteration; same settledness rules as
    /// `length`.
    pub last: Value,
}

pub type LoopBody = Rc<dyn Fn(LoopIteration) -> LocalBoxFuture<'static, ()>>;
pub type LoopElse = Rc<dyn Fn() -> LocalBoxFuture<'static, ()>>;

/// Hard failure plus whether any iteration ran before it.
type HardError = (Vec<Rc<RuntimeError>>, bool);

// ---------------------------------------------------------------------------
// iterate
// ---------------------------------------------------------------------------

/// Drive one loop statement to completion.
///
/// Returns whether any iteration ran.  Hard source failures (a broken
/// iterator, a rejected source, an invalid concurrency limit) poison the
/// loop's declared effects and are also returned as an error; soft
/// failures (poisoned items) flow through the bodies as ordinary poison.
pub async fn iterate(
    source: Value,
    body: LoopBody,
    loop_else: Option<LoopElse>,
    frame: &Rc<Frame>,
    buffer: &Rc<OutputBuffer>,
    state: &Rc<AsyncState>,
    loop_vars: usize,
    opts: LoopOptions,
) -> Result<bool, PoisonError> {
    // A synchronously poisoned source fails both branches without running
    // either; the failure surfaces through the poisoned effects.
    if let Value::Poison(p) = &source {
        poison_loop_effects(frame, buffer, &opts, p.errors().to_vec(), false);
        return Ok(false);
    }

    let was_pending = source.is_pending();
    let source = source.settled().await;
    if let Value::Poison(p) = &source {
        poison_loop_effects(frame, buffer, &opts, p.errors().to_vec(), false);
        // A rejected source is a hard failure of the loop statement itself.
        debug_assert!(was_pending);
        return Err(p.to_error());
    }

    let limit = match normalize_limit(&opts.concurrent_limit).await {
        Ok(l) => l,
        Err(errors) => {
            poison_loop_effects(frame, buffer, &opts, errors.clone(), false);
            return Err(PoisonError::from_errors(errors));
        }
    };
    let sequential = opts.sequential || limit == Some(1);
    let limit = if sequential { None } else { limit };

    let outcome: Result<bool, HardError> = match &source {
        Value::List(items) => {
            let items = items.borrow().clone();
            run_array(items, &body, state, loop_vars, sequential, limit).await
        }
        Value::Map(map) => {
            if loop_vars != 2 {
                Err((
                    vec![Rc::new(RuntimeError::new(
                        "object iteration requires exactly two loop variables",
                    ))],
                    false,
                ))
            } else {
                let pairs: Vec<Value> = map
                    .borrow()
                    .iter()
                    .map(|(k, v)| Value::list(vec![Value::from(k.as_str()), v.clone()]))
                    .collect();
                run_array(pairs, &body, state, 2, sequential, limit).await
            }
        }
        Value::Stream(s) => {
            run_stream(s.clone(), &body, state, loop_vars, sequential, limit).await
        }
        other => Err((
            vec![Rc::new(RuntimeError::new(format!(
                "expected an iterable, got {}",
                other.type_name()
            )))],
            false,
        )),
    };

    let body_counts = || {
        opts.body_write_counts
            .iter()
            .map(|(n, c)| (n.as_str(), *c))
            .collect::<Vec<_>>()
    };
    let else_counts = || {
        opts.else_write_counts
            .iter()
            .map(|(n, c)| (n.as_str(), *c))
            .collect::<Vec<_>>()
    };

    match outcome {
        Ok(did_iterate) => {
            // Per-iteration blocks carry their own counters; the loop-level
            // body accounting is released here exactly once.
            frame.skip_branch_writes(body_counts());
            if did_iterate {
                frame.skip_branch_writes(else_counts());
            } else if let Some(run_else) = loop_else {
                run_else().await;
            } else {
                frame.skip_branch_writes(else_counts());
            }
            Ok(did_iterate)
        }
        Err((errors, did_iterate)) => {
            if did_iterate {
                frame.skip_branch_writes(else_counts());
            }
            poison_loop_effects(frame, buffer, &opts, errors.clone(), did_iterate);
            Err(PoisonError::from_errors(errors))
        }
    }
}

async fn normalize_limit(v: &Value) -> Result<Option<usize>, Vec<Rc<RuntimeError>>> {
    match v.clone().settled().await {
        Value::Undefined | Value::Null | Value::Int(0) => Ok(None),
        Value::Int(n) if n > 0 => Ok(Some(n as usize)),
        Value::Float(x) if x.is_finite() && x > 0.0 => Ok(Some((x.floor() as usize).max(1))),
        Value::Poison(p) => Err(p.errors().to_vec()),
        other => Err(vec![Rc::new(RuntimeError::new(format!(
            "concurrency limit must be a finite positive number, got {}",
            other.type_name()
        )))]),
    }
}

/// Broadcast poison across all destructured slots; spread arrays; fail
/// anything else that cannot satisfy a multi-variable loop.
fn destructure(value: Value, loop_vars: usize) -> Result<Vec<Value>, Rc<RuntimeError>> {
    if loop_vars <= 1 {
        return Ok(vec![value]);
    }
    match value {
        Value::Poison(_) => Ok(vec![value; loop_vars]),
        Value::List(items) => {
            let items = items.borrow();
            Ok((0..loop_vars)
                .map(|i| items.get(i).cloned().unwrap_or(Value::Undefined))
                .collect())
        }
        _ => Err(Rc::new(RuntimeError::new(
            "Expected an array for destructuring",
        ))),
    }
}

// ---------------------------------------------------------------------------
// Array strategies
// ---------------------------------------------------------------------------

async fn run_array(
    items: Vec<Value>,
    body: &LoopBody,
    state: &Rc<AsyncState>,
    loop_vars: usize,
    sequential: bool,
    limit: Option<usize>,
) -> Result<bool, HardError> {
    let len = items.len();
    if len == 0 {
        return Ok(false);
    }

    if sequential {
        for (i, item) in items.into_iter().enumerate() {
            let values = match destructure(item, loop_vars) {
                Ok(v) => v,
                Err(e) => return Err((vec![e], i > 0)),
            };
            body(LoopIteration {
                values,
                index: i,
                length: Value::Int(len as i64),
                last: Value::Bool(i == len - 1),
            })
            .await;
        }
        return Ok(true);
    }

    if let Some(limit) = limit {
        let next = Rc::new(Cell::new(0usize));
        let started = Rc::new(Cell::new(0usize));
        let failed: Rc<RefCell<Vec<Rc<RuntimeError>>>> = Rc::new(RefCell::new(Vec::new()));
        let items = Rc::new(items);

        let workers = (0..limit.min(len)).map(|_| {
            let next = Rc::clone(&next);
            let started = Rc::clone(&started);
            let failed = Rc::clone(&failed);
            let items = Rc::clone(&items);
            let body = Rc::clone(body);
            async move {
                loop {
                    if !failed.borrow().is_empty() {
                        break;
                    }
                    let i = next.get();
                    if i >= len {
                        break;
                    }
                    next.set(i + 1);
                    match destructure(items[i].clone(), loop_vars) {
                        Ok(values) => {
                            started.set(started.get() + 1);
                            body(LoopIteration {
                                values,
                                index: i,
                                length: Value::Int(len as i64),
                                last: Value::Bool(i == len - 1),
                            })
                            .await;
                        }
                        Err(e) => {
                            failed.borrow_mut().push(e);
                            break;
                        }
                    }
                }
            }
        });
        futures::future::join_all(workers.collect::<Vec<_>>()).await;

        let errors = failed.take();
        if !errors.is_empty() {
            return Err((errors, started.get() > 0));
        }
        return Ok(true);
    }

    // Parallel: fire every body without awaiting.
    let mut started = 0usize;
    for (i, item) in items.into_iter().enumerate() {
        match destructure(item, loop_vars) {
            Ok(values) => {
                started += 1;
                state.spawn(body(LoopIteration {
                    values,
                    index: i,
                    length: Value::Int(len as i64),
                    last: Value::Bool(i == len - 1),
                }));
            }
            Err(e) => return Err((vec![e], started > 0)),
        }
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Async-source strategies
// ---------------------------------------------------------------------------

async fn run_stream(
    source: ValueStream,
    body: &LoopBody,
    state: &Rc<AsyncState>,
    loop_vars: usize,
    sequential: bool,
    limit: Option<usize>,
) -> Result<bool, HardError> {
    if sequential {
        let mut count = 0usize;
        loop {
            match source.next().await {
                None => break,
                Some(Err(e)) => return Err((vec![e], count > 0)),
                Some(Ok(item)) => {
                    let values = match destructure(item, loop_vars) {
                        Ok(v) => v,
                        Err(e) => return Err((vec![e], count > 0)),
                    };
                    body(LoopIteration {
                        values,
                        index: count,
                        length: Value::Undefined,
                        last: Value::Undefined,
                    })
                    .await;
                    count += 1;
                }
            }
        }
        return Ok(count > 0);
    }

    if let Some(limit) = limit {
        let limit = limit.max(1);
        let count = Rc::new(Cell::new(0usize));
        let failed: Rc<RefCell<Vec<Rc<RuntimeError>>>> = Rc::new(RefCell::new(Vec::new()));

        let workers = (0..limit).map(|_| {
            let source = source.clone();
            let count = Rc::clone(&count);
            let failed = Rc::clone(&failed);
            let body = Rc::clone(body);
            async move {
                loop {
                    if !failed.borrow().is_empty() {
                        break;
                    }
                    match source.next().await {
                        None => break,
                        Some(Err(e)) => {
                            failed.borrow_mut().push(e);
                            break;
                        }
                        Some(Ok(item)) => match destructure(item, loop_vars) {
                            Ok(values) => {
                                let i = count.get();
                                count.set(i + 1);
                                body(LoopIteration {
                                    values,
                                    index: i,
                                    length: Value::Undefined,
                                    last: Value::Bool(false),
                                })
                                .await;
                            }
                            Err(e) => {
                                failed.borrow_mut().push(e);
                                break;
                            }
                        },
                    }
                }
            }
        });
        futures::future::join_all(workers.collect::<Vec<_>>()).await;

        let errors = failed.take();
        if !errors.is_empty() {
            return Err((errors, count.get() > 0));
        }
        return Ok(count.get() > 0);
    }

    // Parallel: bodies fire as items arrive; `loop.length` and `loop.last`
    // are promises settled by later progress of the source.
    let (len_pending, len_resolver) = PendingValue::channel();
    let mut len_resolver = Some(len_resolver);
    let mut prev_last: Option<ValueResolver> = None;
    let mut index = 0usize;
    loop {
        match source.next().await {
            None => {
                if let Some(r) = prev_last.take() {
                    r.resolve(Value::Bool(true));
                }
                if let Some(r) = len_resolver.take() {
                    r.resolve(Value::Int(index as i64));
                }
                return Ok(index > 0);
            }
            Some(Err(e)) => {
                let poison = Value::poison(Rc::clone(&e));
                if let Some(r) = prev_last.take() {
                    r.resolve(poison.clone());
                }
                if let Some(r) = len_resolver.take() {
                    r.resolve(poison);
                }
                return Err((vec![e], index > 0));
            }
            Some(Ok(item)) => {
                if let Some(r) = prev_last.take() {
                    r.resolve(Value::Bool(false));
                }
                let (last_pending, last_resolver) = PendingValue::channel();
                prev_last = Some(last_resolver);
                match destructure(item, loop_vars) {
                    Ok(values) => {
                        state.spawn(body(LoopIteration {
                            values,
                            index,
                            length: Value::Pending(len_pending.clone()),
                            last: Value::Pending(last_pending),
                        }));
                        index += 1;
                    }
                    Err(e) => {
                        let poison = Value::poison(Rc::clone(&e));
                        if let Some(r) = prev_last.take() {
                            r.resolve(poison.clone());
                        }
                        if let Some(r) = len_resolver.take() {
                            r.resolve(poison);
                        }
                        return Err((vec![e], index > 0));
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// While loops
// ---------------------------------------------------------------------------

/// The async source behind `while` loops: a child frame flagged as a
/// sequential loop body, a condition re-evaluated in it before every
/// iteration, and the iteration count as the yielded value.  A condition
/// that fails (returns poison) is a hard failure and stops iteration.
pub fn while_source(
    frame: &Rc<Frame>,
    condition: Rc<dyn Fn(Rc<Frame>) -> LocalBoxFuture<'static, Value>>,
) -> ValueStream {
    let child = frame.push();
    child.set_sequential_loop_body(true);

    ValueStream::new(stream::unfold(
        (child, condition, 0i64, false),
        |(child, condition, n, done)| async move {
            if done {
                return None;
            }
            let verdict = condition(Rc::clone(&child)).await.settled().await;
            match verdict {
                Value::Poison(p) => {
                    let err = if p.errors().len() == 1 {
                        Rc::clone(&p.errors()[0])
                    } else {
                        Rc::new(RuntimeError::new(p.to_error().to_string()))
                    };
                    Some((Err(err), (child, condition, n, true)))
                }
                v if v.truthy() => Some((Ok(Value::Int(n)), (child, condition, n + 1, false))),
                _ => None,
            }
        },
    ))
}

// ---------------------------------------------------------------------------
// Failure propagation
// ---------------------------------------------------------------------------

/// Poison the loop's declared side effects after a hard failure: every
/// error is positioned with the loop's context, the body's variables and
/// handler channels are poisoned, and — when no iteration ran — the `else`
/// branch's effects as well.
pub fn poison_loop_effects(
    frame: &Rc<Frame>,
    buffer: &Rc<OutputBuffer>,
    opts: &LoopOptions,
    errors: Vec<Rc<RuntimeError>>,
    did_iterate: bool,
) {
    let positioned: Vec<Rc<RuntimeError>> = errors
        .into_iter()
        .map(|e| handle_error(e, &opts.info))
        .collect();
    let poison = PoisonedValue::new(dedup_errors(positioned));

    frame.poison_branch_writes(
        &poison,
        opts.body_write_counts.iter().map(|(n, c)| (n.as_str(), *c)),
    );
    for handler in &opts.body_handlers {
        buffer.push_poison_marker(poison.errors().to_vec(), marker_handler(handler));
    }

    if !did_iterate {
        frame.poison_branch_writes(
            &poison,
            opts.else_write_counts.iter().map(|(n, c)| (n.as_str(), *c)),
        );
        for handler in &opts.else_handlers {
            buffer.push_poison_marker(poison.errors().to_vec(), marker_handler(handler));
        }
    }
}

fn marker_handler(name: &str) -> Option<String> {
    if name == "text" {
        None
    } else {
        Some(name.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn collecting_body(log: Rc<RefCell<Vec<String>>>) -> LoopBody {
        Rc::new(move |it: LoopIteration| {
            let log = Rc::clone(&log);
            async move {
                let len = it.length.settled().await;
                let last = it.last.settled().await;
                log.borrow_mut().push(format!(
                    "{}:{:?}@{} len={} last={}",
                    it.index,
                    it.values.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
                    it.index,
                    len,
                    last
                ));
            }
            .boxed_local()
        })
    }

    fn simple_env() -> (Rc<Frame>, Rc<OutputBuffer>, Rc<AsyncState>, crate::state::TaskQueue) {
        let (state, queue) = AsyncState::new();
        (Frame::root(), OutputBuffer::root(), state, queue)
    }

    #[tokio::test]
    async fn array_sequential_preserves_order_and_bindings() {
        let (frame, buffer, state, _queue) = simple_env();
        let log = Rc::new(RefCell::new(Vec::new()));
        let order = Rc::clone(&log);
        let body: LoopBody = Rc::new(move |it| {
            let order = Rc::clone(&order);
            async move {
                let last = it.last.settled().await;
                order
                    .borrow_mut()
                    .push(format!("{}={} last={}", it.index, it.values[0], last));
            }
            .boxed_local()
        });

        let did = iterate(
            Value::list(vec![Value::from("a"), Value::from("b")]),
            body,
            None,
            &frame,
            &buffer,
            &state,
            1,
            LoopOptions {
                sequential: true,
                ..LoopOptions::default()
            },
        )
        .await
        .unwrap();

        assert!(did);
        assert_eq!(*log.borrow(), vec!["0=a last=false", "1=b last=true"]);
    }

    #[tokio::test]
    async fn array_parallel_fires_all_bodies() {
        let (frame, buffer, state, queue) = simple_env();
        let hits = Rc::new(Cell::new(0usize));
        let h = Rc::clone(&hits);
        let body: LoopBody = Rc::new(move |_it| {
            let h = Rc::clone(&h);
            async move {
                tokio::task::yield_now().await;
                h.set(h.get() + 1);
            }
            .boxed_local()
        });

        let items: Vec<Value> = (0..10i64).map(Value::from).collect();
        let did = iterate(
            Value::list(items),
            body,
            None,
            &frame,
            &buffer,
            &state,
            1,
            LoopOptions::default(),
        )
        .await
        .unwrap();
        assert!(did);
        // Bodies are in flight, not finished, until the driver runs them.
        assert_eq!(hits.get(), 0);
        queue.drive().await;
        assert_eq!(hits.get(), 10);
    }

    #[tokio::test]
    async fn bounded_array_caps_concurrency() {
        let (frame, buffer, state, _queue) = simple_env();
        let in_flight = Rc::new(Cell::new(0usize));
        let peak = Rc::new(Cell::new(0usize));
        let (fl, pk) = (Rc::clone(&in_flight), Rc::clone(&peak));
        let body: LoopBody = Rc::new(move |_it| {
            let (fl, pk) = (Rc::clone(&fl), Rc::clone(&pk));
            async move {
                fl.set(fl.get() + 1);
                pk.set(pk.get().max(fl.get()));
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                fl.set(fl.get() - 1);
            }
            .boxed_local()
        });

        let items: Vec<Value> = (0..12i64).map(Value::from).collect();
        iterate(
            Value::list(items),
            body,
            None,
            &frame,
            &buffer,
            &state,
            1,
            LoopOptions {
                concurrent_limit: Value::Int(3),
                ..LoopOptions::default()
            },
        )
        .await
        .unwrap();

        assert!(peak.get() <= 3, "peak {} exceeded limit", peak.get());
        assert!(peak.get() >= 2, "pool never overlapped");
    }

    #[tokio::test]
    async fn limit_one_downgrades_to_sequential() {
        let (frame, buffer, state, _queue) = simple_env();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = Rc::clone(&log);
        let body: LoopBody = Rc::new(move |it| {
            let l = Rc::clone(&l);
            async move {
                tokio::task::yield_now().await;
                l.borrow_mut().push(it.index);
            }
            .boxed_local()
        });

        iterate(
            Value::list((0..4i64).map(Value::from).collect()),
            body,
            None,
            &frame,
            &buffer,
            &state,
            1,
            LoopOptions {
                concurrent_limit: Value::Int(1),
                ..LoopOptions::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(*log.borrow(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn pending_limit_is_awaited() {
        let (frame, buffer, state, _queue) = simple_env();
        let body: LoopBody = Rc::new(|_| async {}.boxed_local());
        let limit = Value::Pending(PendingValue::new(async { Value::Int(2) }));

        let did = iterate(
            Value::list(vec![Value::Int(1)]),
            body,
            None,
            &frame,
            &buffer,
            &state,
            1,
            LoopOptions {
                concurrent_limit: limit,
                ..LoopOptions::default()
            },
        )
        .await
        .unwrap();
        assert!(did);
    }

    #[tokio::test]
    async fn else_runs_only_when_empty() {
        let (frame, buffer, state, _queue) = simple_env();
        let ran_else = Rc::new(Cell::new(false));
        let r = Rc::clone(&ran_else);
        let run_else: LoopElse = Rc::new(move || {
            let r = Rc::clone(&r);
            async move {
                r.set(true);
            }
            .boxed_local()
        });
        let body: LoopBody = Rc::new(|_| async {}.boxed_local());

        let did = iterate(
            Value::list(Vec::new()),
            Rc::clone(&body),
            Some(Rc::clone(&run_else)),
            &frame,
            &buffer,
            &state,
            1,
            LoopOptions::default(),
        )
        .await
        .unwrap();
        assert!(!did);
        assert!(ran_else.get());

        ran_else.set(false);
        iterate(
            Value::list(vec![Value::Int(1)]),
            body,
            Some(run_else),
            &frame,
            &buffer,
            &state,
            1,
            LoopOptions::default(),
        )
        .await
        .unwrap();
        assert!(!ran_else.get());
    }

    #[tokio::test]
    async fn poisoned_source_poisons_both_branches_without_running_either() {
        let (frame, buffer, state, _queue) = simple_env();
        frame.set("total", Value::Int(0));
        frame.set("fallback", Value::Bool(false));
        let block = frame.push_async_block(&[], &[("total", 1), ("fallback", 1)]);

        let body: LoopBody = Rc::new(|_| {
            async { panic!("body must not run") }.boxed_local()
        });
        let run_else: LoopElse = Rc::new(|| {
            async { panic!("else must not run") }.boxed_local()
        });

        let source_err = Rc::new(RuntimeError::new("Array fetch failed"));
        let did = iterate(
            Value::poison(Rc::clone(&source_err)),
            body,
            Some(run_else),
            &block,
            &buffer,
            &state,
            1,
            LoopOptions {
                body_write_counts: vec![("total".to_string(), 1)],
                else_write_counts: vec![("fallback".to_string(), 1)],
                body_handlers: vec!["text".to_string()],
                else_handlers: vec!["text".to_string()],
                info: SourceInfo::at(4, 2).tagged("for loop"),
                ..LoopOptions::default()
            },
        )
        .await
        .unwrap();

        assert!(!did);
        assert!(frame.lookup("total").settled().await.is_poison());
        assert!(frame.lookup("fallback").settled().await.is_poison());

        let err = buffer.flatten_text().await.unwrap_err();
        assert!(err.to_string().contains("Array fetch failed"));
        assert!(err.errors()[0].lineno == Some(4));
    }

    #[tokio::test]
    async fn destructure_broadcasts_poison_and_rejects_non_arrays() {
        let poison = Value::poison_msg("bad pair");
        let spread = destructure(poison, 2).unwrap();
        assert!(spread[0].is_poison() && spread[1].is_poison());

        let err = destructure(Value::Int(3), 2).unwrap_err();
        assert_eq!(err.message(), "Expected an array for destructuring");
    }

    #[tokio::test]
    async fn object_iteration_yields_pairs_in_insertion_order() {
        let (frame, buffer, state, _queue) = simple_env();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = Rc::clone(&log);
        let body: LoopBody = Rc::new(move |it| {
            let l = Rc::clone(&l);
            async move {
                l.borrow_mut()
                    .push(format!("{}={}", it.values[0], it.values[1]));
            }
            .boxed_local()
        });

        let obj = Value::from_pairs([
            ("b".to_string(), Value::Int(2)),
            ("a".to_string(), Value::Int(1)),
        ]);
        iterate(
            obj,
            body,
            None,
            &frame,
            &buffer,
            &state,
            2,
            LoopOptions {
                sequential: true,
                ..LoopOptions::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(*log.borrow(), vec!["b=2", "a=1"]);
    }

    #[tokio::test]
    async fn object_iteration_requires_two_loop_vars() {
        let (frame, buffer, state, _queue) = simple_env();
        let body: LoopBody = Rc::new(|_| async {}.boxed_local());
        let err = iterate(
            Value::from_pairs([("a".to_string(), Value::Int(1))]),
            body,
            None,
            &frame,
            &buffer,
            &state,
            1,
            LoopOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("two loop variables"));
    }

    #[tokio::test]
    async fn stream_sequential_passes_soft_poison_through() {
        let (frame, buffer, state, _queue) = simple_env();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = Rc::clone(&log);
        let body: LoopBody = Rc::new(move |it| {
            let l = Rc::clone(&l);
            async move {
                l.borrow_mut().push(it.values[0].is_poison());
            }
            .boxed_local()
        });

        let source = ValueStream::from_values(vec![
            Value::Int(1),
            Value::poison_msg("soft failure"),
            Value::Int(3),
        ]);
        let did = iterate(
            Value::Stream(source),
            body,
            None,
            &frame,
            &buffer,
            &state,
            1,
            LoopOptions {
                sequential: true,
                ..LoopOptions::default()
            },
        )
        .await
        .unwrap();
        assert!(did);
        assert_eq!(*log.borrow(), vec![false, true, false]);
    }

    #[tokio::test]
    async fn stream_hard_error_stops_iteration() {
        let (frame, buffer, state, _queue) = simple_env();
        let count = Rc::new(Cell::new(0usize));
        let c = Rc::clone(&count);
        let body: LoopBody = Rc::new(move |_| {
            let c = Rc::clone(&c);
            async move {
                c.set(c.get() + 1);
            }
            .boxed_local()
        });

        let source = ValueStream::new(stream::iter(vec![
            Ok(Value::Int(1)),
            Err(Rc::new(RuntimeError::new("generator exploded"))),
            Ok(Value::Int(3)),
        ]));
        let err = iterate(
            Value::Stream(source),
            body,
            None,
            &frame,
            &buffer,
            &state,
            1,
            LoopOptions {
                sequential: true,
                ..LoopOptions::default()
            },
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("generator exploded"));
        assert_eq!(count.get(), 1);
    }

    #[tokio::test]
    async fn stream_parallel_resolves_length_and_last() {
        let (frame, buffer, state, queue) = simple_env();
        let log = Rc::new(RefCell::new(Vec::new()));
        let body = collecting_body(Rc::clone(&log));

        let source = ValueStream::from_values(vec![Value::from("x"), Value::from("y")]);
        let did = iterate(
            Value::Stream(source),
            body,
            None,
            &frame,
            &buffer,
            &state,
            1,
            LoopOptions::default(),
        )
        .await
        .unwrap();
        assert!(did);
        queue.drive().await;

        let log = log.borrow();
        assert!(log.iter().any(|s| s.contains("len=2") && s.contains("last=false")));
        assert!(log.iter().any(|s| s.contains("len=2") && s.contains("last=true")));
    }

    #[tokio::test]
    async fn while_source_counts_iterations() {
        let frame = Frame::root();
        frame.set("n", Value::Int(0));
        let f = Rc::clone(&frame);
        let condition: Rc<dyn Fn(Rc<Frame>) -> LocalBoxFuture<'static, Value>> =
            Rc::new(move |loop_frame: Rc<Frame>| {
                let f = Rc::clone(&f);
                async move {
                    let n = match f.lookup("n") {
                        Value::Int(i) => i,
                        _ => 0,
                    };
                    f.set("n", Value::Int(n + 1));
                    let _ = loop_frame;
                    Value::Bool(n < 3)
                }
                .boxed_local()
            });

        let source = while_source(&frame, condition);
        let mut yielded = Vec::new();
        while let Some(item) = source.next().await {
            yielded.push(item.unwrap());
        }
        assert_eq!(
            yielded,
            vec![Value::Int(0), Value::Int(1), Value::Int(2)]
        );
    }

    #[tokio::test]
    async fn while_condition_failure_is_hard() {
        let frame = Frame::root();
        let condition: Rc<dyn Fn(Rc<Frame>) -> LocalBoxFuture<'static, Value>> =
            Rc::new(|_| async { Value::poison_msg("condition broke") }.boxed_local());

        let source = while_source(&frame, condition);
        let first = source.next().await.unwrap();
        assert!(first.is_err());
        assert!(source.next().await.is_none());
    }
}
