//! # brood-core
//!
//! Core types for the brood helper orchestration system.
//!
//! A director runs an agent in a container and lets it spawn helpers, each
//! in its own container, arranged as a bounded tree. This crate holds what
//! every other brood crate agrees on:
//!
//! - Identities are B-ary tree positions (`child = parent * B + 1 + k`)
//! - Spawn budgets bound depth and breadth below each helper
//! - Peer channels are directory triples between sibling pairs
//! - Hub traffic is newline-delimited JSON over a Unix socket

pub mod config;
mod error;
pub mod identity;
pub mod layout;
pub mod protocol;
mod types;

pub use config::{BroodConfig, BudgetArtifact, HubPaths};
pub use error::{BroodError, ErrorKind, Result};
pub use identity::Numbering;
pub use layout::{BroadcastChannel, ChannelLayout, PeerChannel, PeerLink, BUDGET_ARTIFACT};
pub use types::*;
