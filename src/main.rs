use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use nodeflow::FlowsRuntime;
use nodeflow::builtin::register_builtin;
use nodeflow::config::RuntimeConfig;
use nodeflow::logger::init_tracing;
use nodeflow::module::ModuleCatalog;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "nodeflow", about = "Flow worker for the nodeflow coordinator", version)]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the coordinator and serve flows
    Run(RunArgs),

    /// List the node types found in the nodes directory
    Nodes,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Coordinator socket, overrides the configuration
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Node package directory, overrides the configuration
    #[arg(long)]
    nodes: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = RuntimeConfig::load(cli.config.as_deref()).context("could not load configuration")?;
    let command = cli.command.unwrap_or(Commands::Run(RunArgs::default()));
    if let Commands::Run(args) = &command {
        if let Some(socket) = &args.socket {
            config.socket_path = socket.clone();
        }
        if let Some(nodes) = &args.nodes {
            config.nodes_path = nodes.clone();
        }
        if let Some(level) = &args.log_level {
            config.log_level = level.clone();
        }
    }
    let telemetry = init_tracing(&config.log_level, config.log_dir.as_deref(), config.otel_endpoint.as_deref())?;
    if telemetry.is_exporting() {
        info!(endpoint = config.otel_endpoint.as_deref().unwrap_or_default(), "exporting logs and metrics");
    }

    let result = match command {
        Commands::Run(_) => run(config).await,
        Commands::Nodes => {
            list_nodes(&config);
            Ok(())
        }
    };
    tokio::task::spawn_blocking(move || telemetry.shutdown()).await?;
    result
}

fn list_nodes(config: &RuntimeConfig) {
    let catalog = catalog(config);
    let mut descriptors = catalog.descriptors();
    descriptors.sort_by(|a, b| a.node_type.cmp(&b.node_type));
    for d in descriptors {
        let artifact = d.artifact.map(|p| p.display().to_string()).unwrap_or_default();
        println!("{:<32} {:<24} {:<8} {}", d.node_type, d.package, d.kind.as_ref(), artifact);
    }
}

fn catalog(config: &RuntimeConfig) -> ModuleCatalog {
    let catalog = ModuleCatalog::new();
    match catalog.discover(&config.nodes_path) {
        Ok(found) => info!(path = %config.nodes_path.display(), found, "node packages scanned"),
        Err(e) => warn!(path = %config.nodes_path.display(), error = %e, "could not scan node packages"),
    }
    register_builtin(&catalog);
    catalog
}

async fn run(config: RuntimeConfig) -> anyhow::Result<()> {
    info!(socket = %config.socket_path.display(), pid = std::process::id(), "nodeflow worker starting");

    let catalog = Arc::new(catalog(&config));
    let runtime = FlowsRuntime::new(config, catalog);
    runtime.start()?;

    let connector = runtime.clone();
    let connected = tokio::task::spawn_blocking(move || connector.connect()).await?;
    if let Err(e) = connected {
        error!(error = %e, "could not reach coordinator");
        let rt = runtime.clone();
        tokio::task::spawn_blocking(move || rt.shutdown()).await?;
        bail!(e);
    }

    let watcher = runtime.clone();
    let stopped = tokio::task::spawn_blocking(move || wait_for_stop(&watcher));
    tokio::select! {
        reason = stopped => info!(reason = reason.unwrap_or("unknown"), "stopping"),
        signal = shutdown_signal() => {
            signal?;
            info!("signal received, stopping");
        }
    }

    let rt = runtime.clone();
    tokio::task::spawn_blocking(move || rt.shutdown()).await?;
    info!("nodeflow worker stopped");
    Ok(())
}

// Blocks until the coordinator asks for shutdown or goes away.
fn wait_for_stop(runtime: &FlowsRuntime) -> &'static str {
    loop {
        if runtime.wait_for_shutdown_request(Some(Duration::from_secs(1))) {
            return "shutdown requested";
        }
        if runtime.connection().is_none_or(|c| c.is_closed()) {
            return "coordinator connection lost";
        }
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    Ok(())
}
