//! Brood CLI - recursive helper trees with brokered messaging
//!
//! Usage:
//!   brood init                      Write the default configuration
//!   brood hub run                   Run the hub in the foreground
//!   brood hub stop                  Stop the hub and every helper
//!   brood helper spawn              Spawn a child helper
//!   brood helper list               Show live helpers
//!   brood helper send <id> <msg>    Send a message to one helper
//!   brood helper log --follow       Tail the message log

use anyhow::{Context, Result};
use brood_client::HubClient;
use brood_core::config::{ENV_HELPER_ID, ENV_ROOT};
use brood_core::protocol::{HelperSummary, LogQuery, Push};
use brood_core::{BroodConfig, BudgetArtifact, HelperId, HubPaths, DIRECTOR};
use brood_hub::{ContainerLauncher, HubServer, LocalFs};
use brood_log::{LogFilter, LogFollower};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "brood")]
#[command(author, version, about = "Recursive helper trees with brokered messaging")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Project root holding the .brood directory
    #[arg(long, global = true, env = ENV_ROOT, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration to .brood/config.toml
    Init,

    /// Hub lifecycle
    Hub {
        #[command(subcommand)]
        action: HubCommands,
    },

    /// Helper management and messaging
    Helper {
        #[command(subcommand)]
        action: HelperCommands,
    },
}

#[derive(Subcommand)]
enum HubCommands {
    /// Run the hub in the foreground until stopped
    Run,

    /// Stop a running hub and every live helper
    Stop,
}

#[derive(Subcommand)]
enum HelperCommands {
    /// Spawn a child of the calling helper
    Spawn {
        /// Depth budget for the child (defaults to the most allowed)
        #[arg(long)]
        depth: Option<u32>,

        /// Breadth budget for the child
        #[arg(long)]
        breadth: Option<u32>,

        /// Model the child should run
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Show live helpers
    List,

    /// Stop a helper, keeping its files
    Stop {
        /// Helper identity
        id: HelperId,
    },

    /// Stop a helper and remove its files
    Cleanup {
        /// Helper identity
        id: HelperId,

        /// Also clean up every descendant
        #[arg(long)]
        cascade: bool,
    },

    /// Launch a stopped helper again
    Respawn {
        /// Helper identity
        id: HelperId,
    },

    /// Send a message to one helper
    Send {
        /// Recipient identity
        to: HelperId,

        /// Message text
        message: String,
    },

    /// Send a message to every other helper
    Broadcast {
        /// Message text
        message: String,
    },

    /// Show the message log
    Log {
        /// Keep printing new records as they arrive
        #[arg(short, long)]
        follow: bool,

        /// Only records sent by this helper
        #[arg(long, value_name = "ID")]
        from: Option<HelperId>,

        /// Only the last N records
        #[arg(long, value_name = "N")]
        last: Option<usize>,

        /// Only records with this sequence number or later
        #[arg(long, value_name = "SEQ")]
        since: Option<u64>,
    },

    /// Tell the hub this helper is up
    Register {
        /// Helper identity
        id: HelperId,

        /// Seconds to wait for the hub socket to appear
        #[arg(long, value_name = "SECS")]
        wait: Option<u64>,
    },

    /// Tell the hub this helper started its work
    Running {
        /// Helper identity
        id: HelperId,
    },

    /// Print messages pushed to a helper until the hub closes the stream
    Subscribe {
        /// Helper identity
        id: HelperId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Init => cmd_init(cli.root),
        Commands::Hub { action } => cmd_hub(cli.root, action).await,
        Commands::Helper { action } => cmd_helper(cli.root, action).await,
    }
}

/// `RUST_LOG` wins unless `--verbose` is given
fn init_logging(verbose: bool) -> Result<()> {
    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_writer(std::io::stderr);

    if !verbose && std::env::var_os("RUST_LOG").is_some() {
        let subscriber = builder.with_env_filter(EnvFilter::from_default_env()).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let level = if verbose { Level::DEBUG } else { Level::INFO };
        let subscriber = builder.with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

fn load_config(root: &Path) -> Result<BroodConfig> {
    BroodConfig::load_or_default(root)
        .with_context(|| format!("Failed to load {}", BroodConfig::path(root).display()))
}

fn client(root: &Path) -> Result<HubClient> {
    let config = load_config(root)?;
    let paths = HubPaths::from_env(root, &config);
    Ok(HubClient::new(paths.socket, config.request_timeout()))
}

/// Identity of the caller: `BROOD_HELPER_ID`, then the budget artifact,
/// then the director
fn own_identity() -> Result<HelperId> {
    if let Ok(value) = std::env::var(ENV_HELPER_ID) {
        return value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: {:?}", ENV_HELPER_ID, value));
    }
    let artifact = BudgetArtifact::from_env().context("Failed to read budget artifact")?;
    Ok(artifact.map(|a| a.identity).unwrap_or(DIRECTOR))
}

fn cmd_init(root: PathBuf) -> Result<()> {
    let path = BroodConfig::path(&root);
    if path.exists() {
        println!("Configuration already exists at {}", path.display());
        return Ok(());
    }
    BroodConfig::write_default(&root).context("Failed to write configuration")?;
    println!("Initialized brood in {}", root.display());
    println!("Created:");
    println!("  {}", path.display());
    Ok(())
}

async fn cmd_hub(root: PathBuf, action: HubCommands) -> Result<()> {
    match action {
        HubCommands::Run => {
            let config = load_config(&root)?;
            let paths = HubPaths::new(&root, &config);
            let launcher = ContainerLauncher::detect(config.container.runtime.as_deref()).await;
            info!("Using container runtime {}", launcher.runtime());

            let server = HubServer::bind(&paths, &config, Arc::new(launcher), Arc::new(LocalFs))
                .await
                .context("Failed to start hub")?;
            let shutdown = server.shutdown_handle();
            let stopper = HubClient::new(server.socket_path(), config.request_timeout());

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupted; stopping helpers");
                    if let Err(e) = stopper.shutdown().await {
                        warn!("Orderly shutdown failed: {}", e);
                        shutdown.trigger();
                    }
                }
            });

            println!("Hub listening on {}", paths.socket.display());
            server.run().await.context("Hub failed")?;
            println!("Hub stopped");
            Ok(())
        }
        HubCommands::Stop => {
            client(&root)?
                .shutdown()
                .await
                .context("Failed to stop hub")?;
            println!("Hub stopped");
            Ok(())
        }
    }
}

async fn cmd_helper(root: PathBuf, action: HelperCommands) -> Result<()> {
    match action {
        HelperCommands::Spawn {
            depth,
            breadth,
            model,
        } => {
            let parent = own_identity()?;
            let outcome = client(&root)?
                .spawn(parent, breadth, depth, model)
                .await
                .context("Spawn failed")?;
            println!("Spawned helper {} ({})", outcome.identity, outcome.budget);
            if let Some(container) = outcome.container {
                println!("  container: {}", container);
            }
            if !outcome.peers.is_empty() {
                let peers: Vec<String> = outcome.peers.iter().map(|p| p.to_string()).collect();
                println!("  peers: {}", peers.join(", "));
            }
            Ok(())
        }
        HelperCommands::List => {
            let report = client(&root)?
                .status(None)
                .await
                .context("Failed to query hub")?;
            println!(
                "{:>6}  {:>6}  {:<10}  {:<20}  {:<10}  CONTAINER",
                "ID", "PARENT", "STATUS", "BUDGET", "SUBSCRIBED"
            );
            for helper in &report.helpers {
                print_summary_row(helper);
            }
            println!("\nLast log sequence: {}", report.last_sequence);
            Ok(())
        }
        HelperCommands::Stop { id } => {
            let summary = client(&root)?
                .stop(id)
                .await
                .with_context(|| format!("Failed to stop helper {}", id))?;
            print_transition(id, summary);
            Ok(())
        }
        HelperCommands::Cleanup { id, cascade } => {
            let outcome = client(&root)?
                .cleanup(id, cascade)
                .await
                .with_context(|| format!("Failed to clean up helper {}", id))?;
            for removed in outcome.removed {
                println!("Removed helper {}", removed);
            }
            Ok(())
        }
        HelperCommands::Respawn { id } => {
            let summary = client(&root)?
                .respawn(id)
                .await
                .with_context(|| format!("Failed to respawn helper {}", id))?;
            print_transition(id, summary);
            Ok(())
        }
        HelperCommands::Send { to, message } => {
            let from = own_identity()?;
            let outcome = client(&root)?
                .send(from, to, message)
                .await
                .with_context(|| format!("Failed to send to helper {}", to))?;
            println!(
                "Sent #{} to helper {} ({})",
                outcome.sequence,
                to,
                if outcome.delivered > 0 { "delivered" } else { "logged" }
            );
            Ok(())
        }
        HelperCommands::Broadcast { message } => {
            let from = own_identity()?;
            let outcome = client(&root)?
                .broadcast(from, message)
                .await
                .context("Broadcast failed")?;
            println!(
                "Broadcast #{} delivered to {} helper(s)",
                outcome.sequence, outcome.delivered
            );
            Ok(())
        }
        HelperCommands::Log {
            follow,
            from,
            last,
            since,
        } => cmd_log(&root, follow, from, last, since).await,
        HelperCommands::Register { id, wait } => {
            let client = client(&root)?;
            if let Some(secs) = wait {
                client
                    .wait_ready(Duration::from_secs(secs))
                    .await
                    .context("Hub did not come up")?;
            }
            let summary = client
                .register(id)
                .await
                .with_context(|| format!("Failed to register helper {}", id))?;
            println!("Helper {} {} ({})", id, summary.status, summary.budget);
            Ok(())
        }
        HelperCommands::Running { id } => {
            let summary = client(&root)?
                .running(id)
                .await
                .with_context(|| format!("Failed to mark helper {} running", id))?;
            println!("Helper {} {}", id, summary.status);
            Ok(())
        }
        HelperCommands::Subscribe { id } => {
            let mut subscription = client(&root)?
                .subscribe(id)
                .await
                .with_context(|| format!("Failed to subscribe helper {}", id))?;
            info!("Subscribed as helper {}", subscription.identity());
            while let Some(push) = subscription.next().await? {
                let Push::Message {
                    sequence,
                    timestamp,
                    from,
                    recipients,
                    content,
                } = push;
                println!(
                    "{:>6}  {}  [{} -> {}]  {}",
                    sequence,
                    timestamp.format("%H:%M:%S"),
                    from,
                    recipients,
                    content
                );
            }
            info!("Hub closed the subscription");
            Ok(())
        }
    }
}

async fn cmd_log(
    root: &Path,
    follow: bool,
    sender: Option<HelperId>,
    last_n: Option<usize>,
    from_sequence: Option<u64>,
) -> Result<()> {
    let query = LogQuery {
        from_sequence,
        sender,
        last_n,
    };

    if !follow {
        let records = client(root)?
            .log_query(query)
            .await
            .context("Failed to read message log")?;
        for record in records {
            println!("{}", record.display_line());
        }
        return Ok(());
    }

    let config = load_config(root)?;
    let paths = HubPaths::new(root, &config);
    let mut follower = LogFollower::new(&paths.log, LogFilter::from(&query))
        .with_context(|| format!("Failed to follow {}", paths.log.display()))?;
    loop {
        tokio::select! {
            record = follower.next() => println!("{}", record?.display_line()),
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn print_summary_row(helper: &HelperSummary) {
    let parent = helper
        .parent
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:>6}  {:>6}  {:<10}  {:<20}  {:<10}  {}",
        helper.identity,
        parent,
        helper.status.to_string(),
        helper.budget.to_string(),
        if helper.subscribed { "yes" } else { "no" },
        helper.container.as_deref().unwrap_or("-")
    );
}

fn print_transition(id: HelperId, summary: Option<HelperSummary>) {
    match summary {
        Some(helper) => println!("Helper {} {}", id, helper.status),
        None => println!("Helper {} is gone", id),
    }
}
