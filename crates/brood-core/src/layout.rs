//! Directory layout for helper trees and their channels
//!
//! Everything here is pure path computation. Creating or removing the
//! directories is left to the filesystem collaborator.
//!
//! ```text
//! helpers/
//!   all/ro  all/rw                 broadcast channel
//!   channels/1-2/1-ro              written by 2, read by 1
//!   channels/1-2/2-ro              written by 1, read by 2
//!   channels/1-2/rw                shared
//!   1/workspace  1/vault/share-ro  1/vault/share-rw
//!   1/peers/2-ro -> helpers/channels/1-2/1-ro
//!   1/spawn.toml                   budget artifact
//! ```

use std::path::{Path, PathBuf};

use crate::error::{BroodError, Result};
use crate::types::HelperId;

/// Name of the budget artifact inside a helper tree
pub const BUDGET_ARTIFACT: &str = "spawn.toml";

/// Three directories shared by a pair of sibling helpers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerChannel {
    /// Readable by `a`, written by `b`
    pub a_ro: PathBuf,
    /// Readable by `b`, written by `a`
    pub b_ro: PathBuf,
    /// Read/write for both
    pub shared_rw: PathBuf,
}

impl PeerChannel {
    /// Directory holding all three channel directories
    pub fn root(&self) -> &Path {
        self.shared_rw.parent().unwrap_or(&self.shared_rw)
    }

    pub fn dirs(&self) -> [&Path; 3] {
        [&self.a_ro, &self.b_ro, &self.shared_rw]
    }
}

/// Broadcast directories for one director tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastChannel {
    /// Written only by the director
    pub ro: PathBuf,
    pub rw: PathBuf,
}

/// A symlink to create: `link` points at `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLink {
    pub target: PathBuf,
    pub link: PathBuf,
}

/// Path computation rooted at a director's `helpers/` directory
#[derive(Debug, Clone)]
pub struct ChannelLayout {
    root: PathBuf,
}

impl ChannelLayout {
    pub fn new(helpers_root: impl Into<PathBuf>) -> Self {
        Self {
            root: helpers_root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Channel directories for the unordered pair `(a, b)`
    pub fn pair(&self, a: HelperId, b: HelperId) -> Result<PeerChannel> {
        if a == b {
            return Err(BroodError::InvalidRequest(format!(
                "helper {} cannot share a channel with itself",
                a
            )));
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let dir = self.root.join("channels").join(format!("{}-{}", lo, hi));
        Ok(PeerChannel {
            a_ro: dir.join(format!("{}-ro", a)),
            b_ro: dir.join(format!("{}-ro", b)),
            shared_rw: dir.join("rw"),
        })
    }

    /// Broadcast directories visible to every helper in the tree
    pub fn broadcast(&self) -> BroadcastChannel {
        let dir = self.root.join("all");
        BroadcastChannel {
            ro: dir.join("ro"),
            rw: dir.join("rw"),
        }
    }

    pub fn helper_root(&self, id: HelperId) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn workspace(&self, id: HelperId) -> PathBuf {
        self.helper_root(id).join("workspace")
    }

    pub fn vault_ro(&self, id: HelperId) -> PathBuf {
        self.helper_root(id).join("vault").join("share-ro")
    }

    pub fn vault_rw(&self, id: HelperId) -> PathBuf {
        self.helper_root(id).join("vault").join("share-rw")
    }

    pub fn peers_dir(&self, id: HelperId) -> PathBuf {
        self.helper_root(id).join("peers")
    }

    pub fn budget_artifact(&self, id: HelperId) -> PathBuf {
        self.helper_root(id).join(BUDGET_ARTIFACT)
    }

    /// Directories that make up a helper's own tree
    pub fn helper_dirs(&self, id: HelperId) -> Vec<PathBuf> {
        vec![
            self.workspace(id),
            self.vault_ro(id),
            self.vault_rw(id),
            self.peers_dir(id),
        ]
    }

    /// Symlinks in `owner/peers/` for its channel with `peer`
    ///
    /// `{peer}-ro` is what the owner reads, `{peer}-wo` is what the owner
    /// writes for the peer, `{peer}-rw` is the shared directory.
    pub fn peer_links(&self, owner: HelperId, peer: HelperId) -> Result<Vec<PeerLink>> {
        let channel = self.pair(owner, peer)?;
        let peers = self.peers_dir(owner);
        Ok(vec![
            PeerLink {
                target: channel.a_ro,
                link: peers.join(format!("{}-ro", peer)),
            },
            PeerLink {
                target: channel.b_ro,
                link: peers.join(format!("{}-wo", peer)),
            },
            PeerLink {
                target: channel.shared_rw,
                link: peers.join(format!("{}-rw", peer)),
            },
        ])
    }
}
