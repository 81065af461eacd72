//! # brood-log
//!
//! Durable, ordered record of every inter-agent message and lifecycle event.
//!
//! The hub owns the single [`MessageLog`] writer. Everyone else reads the
//! JSONL file directly, either as a finite snapshot via [`MessageLog::read`]
//! or continuously via [`LogFollower`].

mod follow;
mod log;

pub use follow::LogFollower;
pub use log::{LogFilter, LogIter, MessageLog};
