//! Slow side effects run by connection handlers after the actor commits

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use brood_core::config::ContainerConfig;
use brood_core::{BudgetArtifact, ChannelLayout, HelperId, Numbering, Result};
use tracing::{debug, instrument, warn};

use crate::fs::HelperFs;
use crate::launcher::{Launcher, ProcessHandle, TerminateOutcome};
use crate::mounts;
use crate::registry::LaunchPlan;

pub struct Effects {
    fs: Arc<dyn HelperFs>,
    launcher: Arc<dyn Launcher>,
    layout: ChannelLayout,
    numbering: Numbering,
    socket: PathBuf,
    container: ContainerConfig,
    grace: Duration,
}

impl Effects {
    pub fn new(
        fs: Arc<dyn HelperFs>,
        launcher: Arc<dyn Launcher>,
        layout: ChannelLayout,
        numbering: Numbering,
        socket: PathBuf,
        container: ContainerConfig,
        grace: Duration,
    ) -> Self {
        Self {
            fs,
            launcher,
            layout,
            numbering,
            socket,
            container,
            grace,
        }
    }

    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    /// Create the helper's tree, its peer channels and the budget artifact.
    /// Safe to repeat; an existing budget artifact is left untouched.
    #[instrument(skip(self, plan), fields(identity = plan.identity))]
    pub async fn materialize(&self, plan: &LaunchPlan) -> Result<()> {
        let id = plan.identity;
        let broadcast = self.layout.broadcast();

        let mut dirs = self.layout.helper_dirs(id);
        dirs.push(broadcast.ro);
        dirs.push(broadcast.rw);
        for &peer in &plan.peers {
            dirs.extend(self.layout.pair(id, peer)?.dirs().map(|p| p.to_path_buf()));
            dirs.push(self.layout.peers_dir(peer));
        }
        self.fs.create_dirs(&dirs).await?;

        for &peer in &plan.peers {
            for link in self.layout.peer_links(id, peer)? {
                self.fs.link(&link).await?;
            }
            for link in self.layout.peer_links(peer, id)? {
                self.fs.link(&link).await?;
            }
        }

        let artifact_path = self.layout.budget_artifact(id);
        if self.fs.exists(&artifact_path).await {
            debug!("Budget artifact already present");
        } else {
            let artifact = BudgetArtifact {
                identity: id,
                parent: plan.parent,
                spawn: plan.budget,
            };
            self.fs
                .write_readonly(&artifact_path, &artifact.to_toml()?)
                .await?;
        }
        Ok(())
    }

    pub async fn launch(&self, plan: &LaunchPlan) -> Result<ProcessHandle> {
        let spec = mounts::launch_spec(
            &self.container,
            &self.layout,
            &self.socket,
            plan.identity,
            &plan.peers,
            plan.model.as_deref(),
        )?;
        self.launcher.launch(&spec).await
    }

    pub async fn terminate(&self, handle: &ProcessHandle) -> Result<TerminateOutcome> {
        let outcome = self.launcher.terminate(handle, self.grace).await?;
        if outcome == TerminateOutcome::AlreadyExited {
            warn!("Helper {} had already exited", handle.identity);
        }
        Ok(outcome)
    }

    /// Remove a helper's tree, every channel it shares with a sibling slot
    /// and the siblings' links to it
    #[instrument(skip(self))]
    pub async fn remove_helper(&self, id: HelperId) -> Result<()> {
        self.fs.remove_tree(&self.layout.helper_root(id)).await?;

        let Some(parent) = self.numbering.parent_of(id) else {
            return Ok(());
        };
        for k in 0..self.numbering.base() {
            let sibling = self.numbering.nth_child(parent, k)?;
            if sibling == id {
                continue;
            }
            let channel = self.layout.pair(id, sibling)?;
            self.fs.remove_tree(channel.root()).await?;
            for link in self.layout.peer_links(sibling, id)? {
                self.fs.remove_tree(&link.link).await?;
            }
        }
        Ok(())
    }
}
