use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::warn;

use edgerun_common::{Config, Coordinates, EnginePolicy, InMemoryRegistry};
use edgerun_lb::LbProxy;
use edgerun_node::cleaner::spawn_cleaner;
use edgerun_node::docker::DockerDriver;
use edgerun_node::Node;
use edgerun_scheduler::{build_engine, HttpOffloader, Scheduler};
use edgerun_server::AppState;

#[derive(Parser)]
#[command(name = "edgerun", about = "Serverless edge worker node and fleet load balancer")]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Run a worker node.
    Node(NodeArgs),
    /// Run the fleet load-balancer proxy.
    Lb(LbArgs),
}

#[derive(Args)]
struct NodeArgs {
    /// api.port
    #[arg(long, default_value_t = 1323)]
    port: u16,
    /// scheduling.policy.version: mem | flux
    #[arg(long, default_value = "flux")]
    scheduling_policy: EnginePolicy,
    /// container.expiration.time, seconds
    #[arg(long, default_value_t = 600)]
    container_expiration: u64,
    /// CPU shares available to sandboxes
    #[arg(long, default_value_t = 4.0)]
    cpus: f64,
    /// Memory available to sandboxes, MB
    #[arg(long, default_value_t = 4096)]
    mem_mb: i64,
    #[arg(long, default_value = "default")]
    region: String,
    /// Cloud peer to offload to
    #[arg(long)]
    cloud_url: Option<String>,
    #[arg(long, default_value = "127.0.0.1")]
    advertised_host: String,
    #[arg(long, default_value_t = 0.0)]
    coord_x: f64,
    #[arg(long, default_value_t = 0.0)]
    coord_y: f64,
}

#[derive(Args)]
struct LbArgs {
    /// api.port
    #[arg(long, default_value_t = 1323)]
    port: u16,
    #[arg(long, default_value = "default")]
    region: String,
    /// Seconds between target refreshes
    #[arg(long, default_value_t = 3)]
    target_refresh: u64,
    /// mab.agent.enabled
    #[arg(long)]
    mab_agent: bool,
    /// mab.agent.interval, seconds
    #[arg(long, default_value_t = 300)]
    mab_interval: u64,
    #[arg(long, default_value = "127.0.0.1")]
    advertised_host: String,
    #[arg(long, default_value_t = 0.0)]
    coord_x: f64,
    #[arg(long, default_value_t = 0.0)]
    coord_y: f64,
}

/// How often the cleaner sweeps expired warm containers.
const CLEANER_PERIOD: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Cli::parse().role {
        Role::Node(args) => run_node(args).await,
        Role::Lb(args) => run_lb(args).await,
    }
}

async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    let cfg = Config {
        api_port: args.port,
        scheduling_policy: args.scheduling_policy,
        container_expiration_secs: args.container_expiration,
        region: args.region,
        advertised_host: args.advertised_host,
        cloud_url: args.cloud_url,
        total_cpus: args.cpus,
        total_mem_mb: args.mem_mb,
        coordinates: Coordinates {
            x: args.coord_x,
            y: args.coord_y,
        },
        ..Default::default()
    };

    let driver = Arc::new(DockerDriver::connect()?);
    let node = Arc::new(Node::new(driver, &cfg));
    spawn_cleaner(node.clone(), CLEANER_PERIOD);

    let cloud = cfg.cloud_url.clone().unwrap_or_default();
    if cloud.is_empty() {
        warn!("no cloud peer configured; offload attempts will fail");
    }
    let remote = Arc::new(HttpOffloader::new(cloud));

    let registry = Arc::new(InMemoryRegistry::new());
    let engine = build_engine(cfg.scheduling_policy, node.clone());
    let scheduler = Scheduler::new(node, engine, remote, registry.clone());

    edgerun_server::serve(AppState {
        scheduler,
        registry,
        cfg,
    })
    .await?;
    Ok(())
}

async fn run_lb(args: LbArgs) -> anyhow::Result<()> {
    let cfg = Config {
        api_port: args.port,
        region: args.region,
        advertised_host: args.advertised_host,
        target_refresh_secs: args.target_refresh,
        mab_agent_enabled: args.mab_agent,
        mab_agent_interval_secs: args.mab_interval,
        coordinates: Coordinates {
            x: args.coord_x,
            y: args.coord_y,
        },
        ..Default::default()
    };

    let registry = Arc::new(InMemoryRegistry::new());
    LbProxy::new(registry, cfg).serve().await?;
    Ok(())
}
