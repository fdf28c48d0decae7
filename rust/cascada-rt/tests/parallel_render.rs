//! End-to-end parallelism semantics: independent expressions overlap,
//! marked effects serialize, and results are deterministic regardless of
//! completion order.

use cascada_rt::buffer::CommandCall;
use cascada_rt::environment::Environment;
use cascada_rt::errors::SourceInfo;
use cascada_rt::locks;
use cascada_rt::runner::{RunHandle, Template, TemplateMode};
use cascada_rt::values::Value;

use futures::FutureExt;
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

fn data_set(path: &str, value: Value) -> CommandCall {
    CommandCall {
        handler: Some("data".to_string()),
        command: Some("set".to_string()),
        subpath: Vec::new(),
        args: vec![Value::from(path), value],
        pos: SourceInfo::at(1, 1).tagged("@data.set"),
    }
}

/// `set a = fetch("users")` / `set b = fetch("config")` +
/// `@data.set(out.users, a)` / `@data.set(out.config, b)`.
///
/// The two fetches must overlap, and the result must not depend on which
/// finishes first — the slower fetch here is the one emitted first.
#[tokio::test]
async fn parallel_fetch_and_assembly() {
    let env = Environment::new();
    let events: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    let ev = Rc::clone(&events);
    let template = Template::new(
        Some("fetch.casc"),
        TemplateMode::Script,
        Rc::new(move |run: RunHandle| {
            let events = Rc::clone(&ev);
            async move {
                run.frame.set("a", Value::Undefined);
                run.frame.set("b", Value::Undefined);

                let ev_a = Rc::clone(&events);
                run.spawn_block(&[], &[("a", 1)], move |h| {
                    async move {
                        ev_a.borrow_mut().push("start:users".into());
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        ev_a.borrow_mut().push("done:users".into());
                        h.frame.set_resolve_up("a", Value::from("alice,bob"));
                    }
                    .boxed_local()
                });

                let ev_b = Rc::clone(&events);
                run.spawn_block(&[], &[("b", 1)], move |h| {
                    async move {
                        ev_b.borrow_mut().push("start:config".into());
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        ev_b.borrow_mut().push("done:config".into());
                        h.frame.set_resolve_up("b", Value::from("dark-mode"));
                    }
                    .boxed_local()
                });

                // Commands are emitted synchronously; their arguments are
                // the promisified slots.
                run.buffer
                    .push_command(data_set("out.users", run.frame.lookup("a")));
                run.buffer
                    .push_command(data_set("out.config", run.frame.lookup("b")));
            }
            .boxed_local()
        }),
    );

    let result = template.render(&env, Value::map(), None).await.unwrap();
    assert_eq!(
        result.to_json().unwrap(),
        json!({"data": {"out": {"users": "alice,bob", "config": "dark-mode"}}})
    );

    // Both fetches started before either finished.
    let events = events.borrow();
    let second_start = events
        .iter()
        .position(|e| e == "start:config")
        .expect("config started");
    let first_done = events
        .iter()
        .position(|e| e.starts_with("done:"))
        .expect("something finished");
    assert!(second_start < first_done, "fetches did not overlap: {events:?}");
}

/// Three `sequencer!.runOp(id, delay)` calls with delays 20/10/30 and one
/// unmarked `logAfterDelay("p", 10)`.  The marked ops serialize in source
/// order; the unmarked one overtakes them all.
#[tokio::test]
async fn sequence_lock_serializes_marked_effects_only() {
    let env = Environment::new();
    let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    let log_outer = Rc::clone(&log);
    let template = Template::new(
        Some("sequence.casc"),
        TemplateMode::Text,
        Rc::new(move |run: RunHandle| {
            let log = Rc::clone(&log_outer);
            async move {
                let key = locks::path_lock_name(&["sequencer"]);

                for (id, delay) in [("id1", 20u64), ("id2", 10), ("id3", 30)] {
                    let log = Rc::clone(&log);
                    let op_key = key.clone();
                    run.spawn_block(&[], &[(key.as_str(), 1)], move |h| {
                        async move {
                            locks::run_sequenced(&h.frame, &op_key, || async move {
                                tokio::time::sleep(Duration::from_millis(delay)).await;
                                log.borrow_mut().push(id.to_string());
                                Value::Bool(true)
                            })
                            .await;
                        }
                        .boxed_local()
                    });
                }

                let log = Rc::clone(&log);
                run.spawn_block(&[], &[], move |_h| {
                    async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        log.borrow_mut().push("p".to_string());
                    }
                    .boxed_local()
                });
            }
            .boxed_local()
        }),
    );

    template.render(&env, Value::map(), None).await.unwrap();
    assert_eq!(*log.borrow(), vec!["p", "id1", "id2", "id3"]);
}

/// Unmarked parallelism is deterministic in *result*: two racing blocks
/// write different variables, and the flattened output follows emission
/// order even when the later-emitted value settles first.
#[tokio::test]
async fn unmarked_effects_on_disjoint_state_are_order_independent() {
    let env = Environment::new();

    let template = Template::new(
        Some("race.casc"),
        TemplateMode::Text,
        Rc::new(|run: RunHandle| {
            async move {
                run.frame.set("slow", Value::Undefined);
                run.frame.set("fast", Value::Undefined);
                run.spawn_block(&[], &[("slow", 1)], |h| {
                    async move {
                        tokio::time::sleep(Duration::from_millis(15)).await;
                        h.frame.set_resolve_up("slow", Value::from("S"));
                    }
                    .boxed_local()
                });
                run.spawn_block(&[], &[("fast", 1)], |h| {
                    async move {
                        h.frame.set_resolve_up("fast", Value::from("F"));
                    }
                    .boxed_local()
                });
                run.buffer.push_value(run.frame.lookup("slow"));
                run.buffer.push_value(run.frame.lookup("fast"));
            }
            .boxed_local()
        }),
    );

    let out = template.render(&env, Value::map(), None).await.unwrap();
    assert_eq!(out, Value::from("SF"));
}
