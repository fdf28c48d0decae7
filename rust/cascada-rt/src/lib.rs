//! Cascada RT — the parallel asynchronous runtime core of the Cascada
//! template/script engine.
//!
//! Provides the async frame variable model, sequence locks, the output
//! buffer and its flatten/revert passes, guarded blocks, the loop driver,
//! the template runner, and the environment registry.  Compiled template
//! code (produced by the compiler, outside this crate) runs against these
//! pieces through [`runner::RunHandle`].
#![warn(clippy::all)]

pub mod buffer;
pub mod context;
pub mod environment;
pub mod frame;
pub mod guard;
pub mod handlers;
pub mod locks;
pub mod loops;
pub mod runner;
pub mod state;

// Re-export core types so downstream code needs only this crate.
pub use cascada_core::{errors, values};
