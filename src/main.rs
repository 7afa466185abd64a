use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use marlin_supervisor::config::SupervisorConfig;
use marlin_supervisor::introspection::run_introspection;
use marlin_supervisor::mds::MemoryStore;
use marlin_supervisor::shutdown::install_shutdown_handler;
use marlin_supervisor::supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "marlin-supervisor")]
#[command(about = "Supervisor for multi-phase batch jobs over a shared metadata store")]
struct Args {
    /// Supervisor identity used in conditional writes (generated if omitted)
    #[arg(long)]
    uuid: Option<String>,

    /// Per-supervisor reconciliation period in milliseconds
    #[arg(long, default_value = "1000")]
    tick_interval_ms: u64,

    /// Polling period for unassigned-job discovery in milliseconds
    #[arg(long, default_value = "5000")]
    find_interval_ms: u64,

    /// Age in milliseconds beyond which an owned job counts as abandoned
    #[arg(long, default_value = "30000")]
    stale_after_ms: u64,

    /// Metadata-store bucket holding job records
    #[arg(long, default_value = "marlinJobs")]
    jobs_bucket: String,

    /// Metadata-store bucket holding task-group records
    #[arg(long, default_value = "marlinTaskGroups")]
    task_groups_bucket: String,

    /// Maximum number of jobs this supervisor will own at once
    #[arg(long, default_value = "128")]
    max_owned_jobs: usize,

    /// Port for the read-only introspection API (disabled if omitted)
    #[arg(long)]
    introspection_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match args.uuid {
        Some(uuid) => SupervisorConfig::new(uuid),
        None => SupervisorConfig::default(),
    };
    config.tick_interval = Duration::from_millis(args.tick_interval_ms);
    config.find_interval = Duration::from_millis(args.find_interval_ms);
    config.stale_after = Duration::from_millis(args.stale_after_ms);
    config.jobs_bucket = args.jobs_bucket;
    config.task_groups_bucket = args.task_groups_bucket;
    config.max_owned_jobs = args.max_owned_jobs;
    config.introspection_addr = match args.introspection_port {
        Some(port) => Some(format!("0.0.0.0:{port}").parse::<SocketAddr>()?),
        None => None,
    };

    tracing::info!(
        uuid = %config.uuid,
        tick_interval_ms = args.tick_interval_ms,
        find_interval_ms = args.find_interval_ms,
        jobs_bucket = %config.jobs_bucket,
        task_groups_bucket = %config.task_groups_bucket,
        "Starting marlin-supervisor"
    );

    // Standalone mode runs against the in-memory store; deployments
    // against an external metadata store supply their own MetadataStore
    // implementation and embed the supervisor as a library.
    let store = Arc::new(MemoryStore::new());
    let introspection_addr = config.introspection_addr;
    let supervisor = Supervisor::new(store, config);

    if let Some(addr) = introspection_addr {
        let handle = supervisor.clone();
        tokio::spawn(async move {
            run_introspection(addr, handle).await;
        });
    }

    let shutdown = install_shutdown_handler();
    supervisor.run(shutdown).await;

    Ok(())
}
