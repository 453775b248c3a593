#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Persistent priority job queue with a single coordinator loop, capped
//! concurrent dispatch, automatic retry and typed lifecycle events.

pub mod events;
pub mod queue;
pub mod worker;
