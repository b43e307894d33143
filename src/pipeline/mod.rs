//! Forwarding pipeline.
//!
//! Live messages flow from the transport stream into
//! `ForwardingCoordinator::handle()`, which looks up candidate tasks in the
//! `TaskIndex`, rewrites the text with `rules::apply()` and sends the result.
//! History tasks are driven by the backfill worker through the same
//! per-task path.

pub mod backfill;
pub mod coordinator;
pub mod index;
pub mod matcher;
pub mod rules;
pub mod types;
