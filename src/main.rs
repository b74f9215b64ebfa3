use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use buildfarm::broker::{BrokerService, BrokerStatus, Resource};
use buildfarm::build::BackendKind;
use buildfarm::config::{
    BrokerConfig, BuilderConfig, ClientConfig, HeartbeatConfig, ProvisionerConfig, QueueConfig,
    ReleasePolicy, DEFAULT_PORT,
};
use buildfarm::dashboard::{run_dashboard, DashboardState};
use buildfarm::protocol::Architecture;
use buildfarm::provision::{CommandProvisioner, ProvisioningBackend, StaticProvisioner};
use buildfarm::session::{fetch_status, run_build, BuildJob, BuilderServer, QueueServer};
use buildfarm::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "buildfarm")]
#[command(version)]
#[command(about = "A container build farm with a builder reservation queue")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the queue server that hands out builders
    Queue(QueueArgs),

    /// Run the build agent on a builder machine
    Builder(BuilderArgs),

    /// Build an image on the farm
    Build(BuildArgs),

    /// Show the queue's builder pool
    Status {
        #[command(flatten)]
        queue: QueueAddrArgs,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Queue Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct QueueArgs {
    /// Port to listen on for clients
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Upper bound on builders alive at once
    #[arg(long, default_value = "5")]
    max_total: usize,

    /// Idle builders kept warm for the next client
    #[arg(long, default_value = "2")]
    max_reserve: usize,

    /// What to do with a builder once its client is done
    #[arg(long)]
    release: Option<ReleaseArg>,

    /// Seconds between reconciles against the backend's live builders
    #[arg(long, default_value = "60")]
    reconcile_secs: u64,

    /// Seconds to wait before restarting a failed accept loop
    #[arg(long, default_value = "5")]
    restart_delay_secs: u64,

    // === Provisioning ===
    /// Fixed builders instead of a provisioning backend (comma-separated,
    /// format: "id:host:port"). Implies --release recycle, and no builders
    /// are created, so --max-reserve has no effect.
    /// Example: "b1:10.0.0.5:8080,b2:10.0.0.6:8080"
    #[arg(long)]
    builders: Option<String>,

    /// Command printing one new builder as JSON
    #[arg(long, default_value = "/usr/local/bin/RequestCreateBuilder")]
    create_command: String,

    /// Command destroying the builder whose id is appended
    #[arg(long, default_value = "/usr/local/bin/DestroyBuilder")]
    destroy_command: String,

    /// Command printing every live builder as a JSON array
    #[arg(long, default_value = "/usr/local/bin/ListBuilders")]
    list_command: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReleaseArg {
    Destroy,
    Recycle,
}

// =============================================================================
// Builder Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct BuilderArgs {
    /// Port to listen on for clients
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Build backend: singularity, docker, or command:<template> where the
    /// template may use {recipe}, {image} and {arch}
    #[arg(long, default_value = "singularity")]
    backend: BackendKind,

    /// Parent directory for per-session scratch directories
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Milliseconds between heartbeats sent to each client
    #[arg(long, default_value = "5000")]
    pulse_ms: u64,

    /// Milliseconds with nothing received before a connection is considered hung
    #[arg(long, default_value = "10000")]
    watchdog_ms: u64,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct QueueAddrArgs {
    /// Queue server host
    #[arg(long, env = "QUEUE_HOST", default_value = "127.0.0.1")]
    queue_host: String,

    /// Queue server port
    #[arg(long, env = "QUEUE_PORT", default_value_t = DEFAULT_PORT)]
    queue_port: u16,
}

#[derive(Parser, Debug)]
struct BuildArgs {
    /// Container recipe to build
    recipe: PathBuf,

    /// Where to write the built image
    image: PathBuf,

    /// Target architecture (x86_64 or ppc64le)
    #[arg(long, default_value = "x86_64")]
    arch: Architecture,

    /// Tell the builder output goes to a terminal (detected by default)
    #[arg(long)]
    tty: bool,

    #[command(flatten)]
    queue: QueueAddrArgs,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_tracing() {
    // Build output owns stdout; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_resources(label: &str, resources: &[Resource]) {
    println!("{} ({}):", label, resources.len());
    for resource in resources {
        println!("  {:<20} {}", resource.id, resource.address());
    }
}

// =============================================================================
// Queue Implementation
// =============================================================================

async fn run_queue(args: QueueArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;

    let (backend, default_release): (Arc<dyn ProvisioningBackend>, ReleasePolicy) =
        match &args.builders {
            Some(list) => (
                Arc::new(StaticProvisioner::parse(list)?),
                ReleasePolicy::Recycle,
            ),
            None => (
                Arc::new(CommandProvisioner::new(ProvisionerConfig {
                    create_command: args.create_command.clone(),
                    destroy_command: args.destroy_command.clone(),
                    list_command: args.list_command.clone(),
                })),
                ReleasePolicy::Destroy,
            ),
        };
    let release_policy = match args.release {
        Some(ReleaseArg::Destroy) => ReleasePolicy::Destroy,
        Some(ReleaseArg::Recycle) => ReleasePolicy::Recycle,
        None => default_release,
    };

    let broker = BrokerConfig {
        reconcile_interval_ms: (args.reconcile_secs > 0).then(|| args.reconcile_secs * 1000),
        ..BrokerConfig::new(args.max_total, args.max_reserve).with_release_policy(release_policy)
    };
    broker.validate()?;

    let config = QueueConfig {
        listen_addr: SocketAddr::from(([0, 0, 0, 0], args.port)),
        dashboard_addr: args
            .dashboard_port
            .map(|p| SocketAddr::from(([0, 0, 0, 0], p))),
        broker,
        ..QueueConfig::default()
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        dashboard_addr = ?config.dashboard_addr,
        max_total = config.broker.max_total_resources,
        max_reserve = config.broker.max_reserve_resources,
        release_policy = ?config.broker.release_policy,
        "Starting queue server"
    );

    let (broker, broker_task) =
        BrokerService::spawn(config.broker.clone(), backend, shutdown.clone());

    if let Some(addr) = config.dashboard_addr {
        let state = DashboardState {
            broker: broker.clone(),
        };
        tokio::spawn(run_dashboard(addr, state));
    }

    let restart_delay = Duration::from_secs(args.restart_delay_secs);
    loop {
        match QueueServer::bind(config.listen_addr, broker.clone(), config.protocol.clone()).await
        {
            Ok(server) => match server.run(shutdown.clone()).await {
                Ok(()) => break,
                Err(e) => tracing::error!(error = %e, "Queue server failed"),
            },
            Err(e) => tracing::error!(error = %e, addr = %config.listen_addr, "Failed to bind"),
        }

        tracing::info!(delay_secs = restart_delay.as_secs(), "Restarting queue server");
        tokio::select! {
            _ = tokio::time::sleep(restart_delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    let _ = broker_task.await;
    Ok(())
}

// =============================================================================
// Builder Implementation
// =============================================================================

async fn run_builder(args: BuilderArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;

    let defaults = BuilderConfig::default();
    let config = BuilderConfig {
        listen_addr: SocketAddr::from(([0, 0, 0, 0], args.port)),
        backend: args.backend,
        work_dir: args.work_dir.unwrap_or(defaults.work_dir),
        heartbeat: HeartbeatConfig {
            pulse_interval_ms: args.pulse_ms,
            watchdog_timeout_ms: args.watchdog_ms,
            ..HeartbeatConfig::default()
        },
        protocol: defaults.protocol,
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        work_dir = %config.work_dir.display(),
        pulse_ms = config.heartbeat.pulse_interval_ms,
        watchdog_ms = config.heartbeat.watchdog_timeout_ms,
        "Starting builder"
    );

    let server = BuilderServer::bind(config).await?;
    server.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_build(args: BuildArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let config = ClientConfig::new(&args.queue.queue_host, args.queue.queue_port);
    let job = BuildJob::new(args.recipe, args.image)
        .with_arch(args.arch)
        .with_tty(args.tty || std::io::stdout().is_terminal());

    let mut stdout = tokio::io::stdout();
    let exit_code = run_build(&config, &job, &mut stdout).await?;
    if exit_code == 0 {
        tracing::info!(image = %job.image.display(), "Build succeeded");
    }
    Ok(exit_code)
}

async fn handle_status(
    queue: QueueAddrArgs,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::new(&queue.queue_host, queue.queue_port);
    let status: BrokerStatus = fetch_status(&config).await?;

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        OutputFormat::Table => {
            println!("Builder Pool");
            println!("{}", "=".repeat(40));
            println!("Pending reservations: {}", status.pending_reservations);
            if let Some(since) = status.oldest_pending_since {
                println!("Oldest pending since: {}", since.to_rfc3339());
            }
            println!("Creates in flight:    {}", status.in_flight_creates);
            println!();
            print_resources("Active", &status.active);
            print_resources("Reserve", &status.reserve);
            print_resources("Destroying", &status.destroying);
            if !status.abandoned.is_empty() {
                print_resources("Abandoned", &status.abandoned);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    match args.command {
        Commands::Queue(queue_args) => {
            run_queue(queue_args).await?;
        }
        Commands::Builder(builder_args) => {
            run_builder(builder_args).await?;
        }
        Commands::Build(build_args) => {
            let exit_code = handle_build(build_args).await?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
        }
        Commands::Status { queue, output } => {
            handle_status(queue, &output).await?;
        }
    }

    Ok(())
}
