//! Leaf reliability primitives that every other warden component
//! builds on.
//!
//! - [`circuit_breaker`]: per-operation failure tracking with a terminal
//!   permanent-open state, plus the process-wide breaker registry
//! - [`scheduler`]: the single owner of every recurring and one-shot timer
//! - [`shutdown`]: signal handling that releases every scheduled task on exit

pub mod circuit_breaker;
pub mod scheduler;
pub mod shutdown;
