#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Batch execution engine: adaptive concurrency tuning, strategy-driven batch
//! sizing with retry/backoff, and the pausable streaming translator.

pub mod processor;
pub mod scheduler;
pub mod stream;
pub mod tuner;
