//! Container view of a helper's directory tree
//!
//! Host symlinks in `peers/` do not resolve inside a container, so each
//! peer channel directory is bind-mounted directly at the path the link
//! would have given it.

use std::path::{Path, PathBuf};

use brood_core::config::{ContainerConfig, ENV_HELPER_ID, ENV_SOCKET, ENV_SPAWN_FILE};
use brood_core::{ChannelLayout, HelperId, Result, DIRECTOR};

use crate::launcher::{LaunchSpec, Mount};

pub const CONTAINER_HOME: &str = "/home/agent";

pub fn container_path(rel: &str) -> PathBuf {
    Path::new(CONTAINER_HOME).join(rel)
}

pub fn container_socket() -> PathBuf {
    container_path(".brood/hub.sock")
}

pub fn container_budget_artifact() -> PathBuf {
    container_path("spawn.toml")
}

/// Shell run when no custom entrypoint is configured: register with the hub,
/// source shared broadcast scripts, report running, then become the agent
/// (`"$@"`).
pub const HELPER_INIT: &str = r#"set -e
brood helper register "$BROOD_HELPER_ID" --wait 30
for script in /home/agent/all/ro/*.sh; do
    if [ -f "$script" ]; then . "$script"; fi
done
brood helper running "$BROOD_HELPER_ID"
exec "$@""#;

/// Bind mounts for helper `id` with channels to `peers`
pub fn helper_mounts(
    layout: &ChannelLayout,
    id: HelperId,
    peers: &[HelperId],
    socket: &Path,
) -> Result<Vec<Mount>> {
    let broadcast = layout.broadcast();
    let mut mounts = vec![
        Mount::rw(layout.workspace(id), container_path("workspace")),
        Mount::ro(layout.vault_ro(id), container_path("vault/share-ro")),
        Mount::rw(layout.vault_rw(id), container_path("vault/share-rw")),
        Mount::ro(broadcast.ro, container_path("all/ro")),
        Mount::rw(broadcast.rw, container_path("all/rw")),
        Mount::ro(layout.budget_artifact(id), container_budget_artifact()),
        Mount::rw(socket, container_socket()),
    ];

    for &peer in peers {
        let channel = layout.pair(id, peer)?;
        mounts.push(Mount::ro(
            channel.a_ro,
            container_path(&format!("peers/{}-ro", peer)),
        ));
        mounts.push(Mount::rw(
            channel.b_ro,
            container_path(&format!("peers/{}-wo", peer)),
        ));
        mounts.push(Mount::rw(
            channel.shared_rw,
            container_path(&format!("peers/{}-rw", peer)),
        ));
    }
    Ok(mounts)
}

/// Full launch description for one helper
pub fn launch_spec(
    config: &ContainerConfig,
    layout: &ChannelLayout,
    socket: &Path,
    id: HelperId,
    peers: &[HelperId],
    model: Option<&str>,
) -> Result<LaunchSpec> {
    let mut env = vec![
        (ENV_HELPER_ID.to_string(), id.to_string()),
        (ENV_SOCKET.to_string(), container_socket().display().to_string()),
        (
            ENV_SPAWN_FILE.to_string(),
            container_budget_artifact().display().to_string(),
        ),
    ];
    if let Some(model) = model {
        env.push(("BROOD_MODEL".to_string(), model.to_string()));
    }
    env.extend(config.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut agent = config.agent_command.clone();
    if let Some(model) = model {
        agent.push("--model".to_string());
        agent.push(model.to_string());
    }

    // A custom entrypoint takes over registration itself
    let (entrypoint, command) = match &config.entrypoint {
        Some(entrypoint) => (entrypoint.clone(), agent),
        None => {
            let mut command = vec![
                "-c".to_string(),
                HELPER_INIT.to_string(),
                "brood-init".to_string(),
            ];
            command.extend(agent);
            ("sh".to_string(), command)
        }
    };

    Ok(LaunchSpec {
        identity: id,
        name: container_name(config, id),
        image: config.image.clone(),
        mounts: helper_mounts(layout, id, peers, socket)?,
        env,
        entrypoint: Some(entrypoint),
        command,
        workdir: Some(container_path("workspace")),
    })
}

pub fn container_name(config: &ContainerConfig, id: HelperId) -> String {
    if id == DIRECTOR {
        format!("{}-director", config.name_prefix)
    } else {
        format!("{}-{}", config.name_prefix, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_dirs_mounted_directly() {
        let layout = ChannelLayout::new("/h");
        let mounts = helper_mounts(&layout, 2, &[1], Path::new("/run/hub.sock")).unwrap();

        let ro = mounts
            .iter()
            .find(|m| m.container == Path::new("/home/agent/peers/1-ro"))
            .unwrap();
        assert_eq!(ro.host, PathBuf::from("/h/channels/1-2/2-ro"));
        assert!(ro.read_only);

        let wo = mounts
            .iter()
            .find(|m| m.container == Path::new("/home/agent/peers/1-wo"))
            .unwrap();
        assert_eq!(wo.host, PathBuf::from("/h/channels/1-2/1-ro"));
        assert!(!wo.read_only);
    }

    #[test]
    fn test_launch_spec_env_and_name() {
        let layout = ChannelLayout::new("/h");
        let config = ContainerConfig::default();
        let spec = launch_spec(&config, &layout, Path::new("/run/hub.sock"), 6, &[], Some("opus")).unwrap();

        assert_eq!(spec.name, "brood-helper-6");
        assert!(spec
            .env
            .contains(&("BROOD_SOCKET".to_string(), "/home/agent/.brood/hub.sock".to_string())));
        assert!(spec
            .env
            .contains(&("BROOD_MODEL".to_string(), "opus".to_string())));
        assert!(spec
            .mounts
            .iter()
            .any(|m| m.container == Path::new("/home/agent/spawn.toml") && m.read_only));

        // Registers before handing over to the agent
        assert_eq!(spec.entrypoint.as_deref(), Some("sh"));
        assert_eq!(spec.command[0], "-c");
        let script = &spec.command[1];
        let register = script.find("brood helper register").unwrap();
        let running = script.find("brood helper running").unwrap();
        let exec = script.find("exec \"$@\"").unwrap();
        assert!(register < running && running < exec);
        assert_eq!(&spec.command[3..], ["claude", "--model", "opus"]);
    }

    #[test]
    fn test_custom_entrypoint_runs_agent_directly() {
        let layout = ChannelLayout::new("/h");
        let config = ContainerConfig {
            entrypoint: Some("/usr/local/bin/agent-init".to_string()),
            ..Default::default()
        };
        let spec = launch_spec(&config, &layout, Path::new("/run/hub.sock"), 2, &[], None).unwrap();

        assert_eq!(spec.entrypoint.as_deref(), Some("/usr/local/bin/agent-init"));
        assert_eq!(spec.command, vec!["claude".to_string()]);
    }
}
