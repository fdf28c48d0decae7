//! Cascada Core
//!
//! Shared value and error types used across the Cascada runtime: the
//! [`values::Value`] enum every template expression evaluates to, and the
//! poison error model ([`errors::PoisonedValue`], [`errors::PoisonError`],
//! [`errors::RuntimeError`]) that lets parallel branches fail independently
//! while still surfacing every user-observable error exactly once.

pub mod errors;
pub mod values;
