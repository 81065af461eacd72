//! # brood-hub
//!
//! The host-side hub every helper talks to over a Unix socket.
//!
//! ## Architecture
//!
//! - [`HubServer`] accepts connections, one request per connection
//!   (subscriptions stay open for pushes)
//! - A single actor task owns the [`Registry`] and the message log, so state
//!   transitions and sequence numbers follow one total order
//! - Slow work (directories, container launch and teardown) runs on the
//!   connection task after the actor has committed the transition
//! - [`Launcher`] and [`HelperFs`] are the seams to the outside world;
//!   [`MockLauncher`] stands in for the container runtime in tests

mod actor;
mod effects;
mod fs;
mod launcher;
pub mod mounts;
mod registry;
mod server;

pub use actor::{spawn_actor, HubHandle};
pub use effects::Effects;
pub use fs::{HelperFs, LocalFs};
pub use launcher::{
    ContainerLauncher, LaunchSpec, Launcher, MockLauncher, Mount, ProcessHandle, TerminateOutcome,
};
pub use registry::{CleanupStep, ConnId, HelperRecord, LaunchPlan, Registry, StopPlan};
pub use server::{HubServer, ShutdownHandle};
