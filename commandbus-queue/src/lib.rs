//! Typed PGMQ queue adapter (`spec.md` component C1).
//!
//! This crate is a thin, typed surface over PGMQ's `send`/`read`/`delete`/
//! `archive`/`set_vt` primitives plus `LISTEN`/`NOTIFY` wake-ups. It has no
//! knowledge of commands, batches, or processes — those domain concerns live
//! in `commandbus-core`.

mod circuit_breaker;
mod client;
mod error;
mod listener;
mod message;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState};
pub use client::{QueueAdapter, QueueOperations};
pub use error::{QueueError, QueueResult};
pub use message::{Message, QueueNames};
