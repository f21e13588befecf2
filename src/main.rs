use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::time::sleep;

use raft_election::config::parse_node_list;
use raft_election::{ClusterConfig, LocalCluster};

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[derive(Parser)]
#[command(name = "raft-election")]
#[command(about = "Raft leader election running on an in-process cluster")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a local cluster and report leadership changes
    Cluster {
        /// JSON cluster config; overrides the defaults below
        #[arg(short, long)]
        config: Option<String>,

        /// Comma-separated node ids, e.g. a,b,c
        #[arg(short, long)]
        nodes: Option<String>,

        /// How long to keep the cluster running
        #[arg(short, long, default_value_t = 5)]
        duration_secs: u64,

        /// Partition the current leader away after this many seconds
        #[arg(long)]
        isolate_leader_after_secs: Option<u64>,

        /// Keep each node's term and vote under this directory across runs
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Print a cluster config, ready to be edited and passed to --config
    Config {
        /// Comma-separated node ids, e.g. a,b,c
        #[arg(short, long)]
        nodes: Option<String>,
    },
}

fn cluster_config(config: Option<String>, nodes: Option<String>) -> anyhow::Result<ClusterConfig> {
    let mut cfg = match config {
        Some(path) => ClusterConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => ClusterConfig::default(),
    };
    if let Some(raw) = nodes {
        cfg.nodes = parse_node_list(&raw);
    }
    if cfg.nodes.is_empty() {
        bail!("at least one node id is required");
    }
    Ok(cfg)
}

async fn run_cluster(
    cfg: ClusterConfig,
    duration: Duration,
    isolate_after: Option<Duration>,
) -> anyhow::Result<()> {
    let settle = Duration::from_millis(cfg.election_timeout_max_ms * 10);
    let mut cluster = LocalCluster::start(cfg.node_configs()?).await?;

    match cluster.wait_for_leader(settle).await {
        Some((leader, term)) => info!("Node {leader} leads term {term}"),
        None => warn!("No leader elected within {settle:?}"),
    }

    if let Some(after) = isolate_after.filter(|after| *after < duration) {
        sleep(after).await;
        if let Some((leader, term)) = cluster.wait_for_leader(settle).await {
            info!("Isolating leader {leader} of term {term}");
            cluster.isolate(&leader);
            match cluster.wait_for_leader_after(term + 1, settle).await {
                Some((next, next_term)) => info!("Node {next} took over in term {next_term}"),
                None => warn!("No new leader after isolating {leader}"),
            }
            cluster.heal(&leader);
        }
        sleep(duration - after).await;
    } else {
        sleep(duration).await;
    }

    for (id, snapshot) in cluster.snapshots().await {
        println!("{id}: {snapshot}");
    }
    cluster.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Cluster {
            config,
            nodes,
            duration_secs,
            isolate_leader_after_secs,
            data_dir,
        } => {
            let mut cfg = cluster_config(config, nodes)?;
            if data_dir.is_some() {
                cfg.data_dir = data_dir;
            }
            info!("Starting local cluster {:?}", cfg.nodes);
            run_cluster(
                cfg,
                Duration::from_secs(duration_secs),
                isolate_leader_after_secs.map(Duration::from_secs),
            )
            .await?;
        }
        Command::Config { nodes } => {
            let cfg = cluster_config(None, nodes)?;
            println!("{}", cfg.to_json()?);
        }
    }

    Ok(())
}
