//! The template runner: compiled code, render setup, and result delivery.
//!
//! A compiled template is a closure over a [`RunHandle`] — the bundle of
//! environment, context, frame, buffer, and async state the compiler's
//! output needs.  The runner builds the root of each of those, spawns the
//! root closure as the first async block, drives the task queue until the
//! spawn counter drains, and flattens the buffer exactly once.
//!
//! Compile failures are carried inside the [`Template`] and surface as a
//! positioned error on first render, wrapped with the template path (and,
//! in dev mode, the full cause chain).

use crate::buffer::OutputBuffer;
use crate::context::Context;
use crate::environment::Environment;
use crate::frame::Frame;
use crate::state::AsyncState;

use cascada_core::errors::{handle_error, PoisonError, RuntimeError, SourceInfo};
use cascada_core::values::Value;
use futures::future::LocalBoxFuture;
use std::rc::Rc;

// ---------------------------------------------------------------------------
// Compiled code types
// ---------------------------------------------------------------------------

/// A compiled template root.
pub type RootFn = Rc<dyn Fn(RunHandle) -> LocalBoxFuture<'static, ()>>;

/// A compiled block body (same shape as a root).
pub type BlockFn = RootFn;

/// Everything compiled code needs to run one region of a template.
#[derive(Clone)]
pub struct RunHandle {
    pub env: Rc<Environment>,
    pub context: Rc<Context>,
    pub frame: Rc<Frame>,
    pub buffer: Rc<OutputBuffer>,
    pub state: Rc<AsyncState>,
}

impl RunHandle {
    /// The same render, scoped to a different frame and buffer region.
    pub fn with_scope(&self, frame: Rc<Frame>, buffer: Rc<OutputBuffer>) -> RunHandle {
        RunHandle {
            env: Rc::clone(&self.env),
            context: Rc::clone(&self.context),
            frame,
            buffer,
            state: Rc::clone(&self.state),
        }
    }

    /// Spawn an async block: a child frame wired for the declared reads
    /// and writes, its own buffer scope, and a task on the render's queue.
    pub fn spawn_block<F>(&self, reads: &[&str], writes: &[(&str, usize)], f: F)
    where
        F: FnOnce(RunHandle) -> LocalBoxFuture<'static, ()>,
    {
        let frame = self.frame.push_async_block(reads, writes);
        let buffer = self.buffer.child_scope(true);
        let handle = self.with_scope(frame, buffer);
        self.state.spawn(f(handle));
    }

    /// Variable resolution for compiled expressions: the frame chain
    /// first, then the context (which consults the environment's globals).
    pub fn lookup(&self, name: &str) -> Value {
        let from_frame = self.frame.lookup(name);
        if from_frame.is_undefined() && !self.frame.has(name) {
            self.context.lookup(name)
        } else {
            from_frame
        }
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// Whether a render flattens to plain text or to a structured result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateMode {
    Text,
    Script,
}

/// A compiled template (or the compile failure that produced it).
pub struct Template {
    name: Option<String>,
    mode: TemplateMode,
    root: Result<RootFn, Rc<RuntimeError>>,
}

impl Template {
    pub fn new(name: Option<&str>, mode: TemplateMode, root: RootFn) -> Self {
        Self {
            name: name.map(str::to_string),
            mode,
            root: Ok(root),
        }
    }

    /// A template whose compilation failed; rendering reports the error.
    pub fn from_compile_error(name: Option<&str>, err: Rc<RuntimeError>) -> Self {
        Self {
            name: name.map(str::to_string),
            mode: TemplateMode::Text,
            root: Err(err),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn mode(&self) -> TemplateMode {
        self.mode
    }

    /// Render against an environment.  `focus` selects a single key of a
    /// script result.
    pub async fn render(
        &self,
        env: &Rc<Environment>,
        context_vars: Value,
        focus: Option<&str>,
    ) -> Result<Value, PoisonError> {
        let root = match &self.root {
            Ok(root) => Rc::clone(root),
            Err(err) => {
                let wrapped = self.prettify(Rc::clone(err), env.dev());
                return Err(PoisonError::from_errors([wrapped]));
            }
        };

        let context = Context::new(Rc::clone(env), context_vars.clone());
        let frame = Frame::root();
        let buffer = OutputBuffer::root();
        let (state, queue) = AsyncState::new();

        let run = RunHandle {
            env: Rc::clone(env),
            context,
            frame,
            buffer: Rc::clone(&buffer),
            state: Rc::clone(&state),
        };
        state.spawn(root(run));
        queue.drive().await;

        let outcome = match self.mode {
            TemplateMode::Text => buffer.flatten_text().await.map(Value::from),
            TemplateMode::Script => buffer.flatten_script(env, &context_vars, focus).await,
        };
        outcome.map_err(|err| self.decorate_failure(err, env.dev()))
    }

    /// Attach the template path to an error, and in dev mode fold the full
    /// cause chain into the message.
    fn prettify(&self, err: Rc<RuntimeError>, dev: bool) -> Rc<RuntimeError> {
        let info = SourceInfo {
            path: self.name.clone(),
            ..SourceInfo::default()
        };
        let positioned = handle_error(err, &info);
        if !dev {
            return positioned;
        }
        let mut message = positioned.to_string();
        let mut cause = std::error::Error::source(positioned.as_ref());
        while let Some(err) = cause {
            message.push_str(&format!("\n  caused by: {err}"));
            cause = err.source();
        }
        Rc::new(RuntimeError::new(message).in_path(self.name.clone().unwrap_or_default()))
    }

    fn decorate_failure(&self, err: PoisonError, dev: bool) -> PoisonError {
        PoisonError::from_errors(
            err.errors()
                .iter()
                .map(|e| self.prettify(Rc::clone(e), dev)),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn text_template(name: &str, parts: &'static [&'static str]) -> Template {
        Template::new(
            Some(name),
            TemplateMode::Text,
            Rc::new(move |run: RunHandle| {
                async move {
                    for part in parts {
                        run.buffer.push_str(part);
                    }
                }
                .boxed_local()
            }),
        )
    }

    #[tokio::test]
    async fn renders_text_in_emission_order() {
        let env = Environment::new();
        let template = text_template("hello.casc", &["Hello, ", "world!"]);
        let out = template.render(&env, Value::map(), None).await.unwrap();
        assert_eq!(out, Value::from("Hello, world!"));
    }

    #[tokio::test]
    async fn spawned_blocks_finish_before_flatten() {
        let env = Environment::new();
        let template = Template::new(
            Some("blocks.casc"),
            TemplateMode::Text,
            Rc::new(|run: RunHandle| {
                async move {
                    run.buffer.push_str("a");
                    run.spawn_block(&[], &[], |inner| {
                        async move {
                            tokio::task::yield_now().await;
                            inner.buffer.push_str("b");
                        }
                        .boxed_local()
                    });
                    run.buffer.push_str("c");
                }
                .boxed_local()
            }),
        );

        // The block's buffer scope was emitted between "a" and "c", so its
        // late-written text still lands in the middle.
        let out = template.render(&env, Value::map(), None).await.unwrap();
        assert_eq!(out, Value::from("abc"));
    }

    #[tokio::test]
    async fn compile_errors_surface_with_path() {
        let env = Environment::new();
        let template = Template::from_compile_error(
            Some("broken.casc"),
            Rc::new(RuntimeError::new("unexpected token '}'")),
        );
        let err = template.render(&env, Value::map(), None).await.unwrap_err();
        assert!(err.to_string().contains("broken.casc"));
        assert!(err.to_string().contains("unexpected token"));
    }

    #[tokio::test]
    async fn dev_mode_includes_the_cause_chain() {
        let env = Environment::new();
        env.set_dev(true);
        let cause = RuntimeError::new("inner detail");
        let template = Template::from_compile_error(
            Some("broken.casc"),
            Rc::new(RuntimeError::with_source("compile failed", cause)),
        );
        let err = template.render(&env, Value::map(), None).await.unwrap_err();
        assert!(err.to_string().contains("caused by: inner detail"));
    }

    #[tokio::test]
    async fn lookup_prefers_frame_over_context() {
        let env = Environment::new();
        env.add_global("x", Value::from("global"));
        let template = Template::new(
            None,
            TemplateMode::Text,
            Rc::new(|run: RunHandle| {
                async move {
                    run.buffer.push_value(run.lookup("x"));
                    run.frame.set("x", Value::from("frame"));
                    run.buffer.push_str("/");
                    run.buffer.push_value(run.lookup("x"));
                }
                .boxed_local()
            }),
        );
        let out = template.render(&env, Value::map(), None).await.unwrap();
        assert_eq!(out, Value::from("global/frame"));
    }
}
