use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};
use metrics::counter;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod config;
mod lsp;
mod printer;
mod supply_chain;
mod workload;

use config::{Config, GlobalArgs};

#[derive(Parser, Debug)]
#[command(name = "apps", version, about = "Manage carto.run workloads and supply chains")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Workload lifecycle: apply, wait, tail, delete
    Workload {
        #[command(subcommand)]
        cmd: workload::WorkloadCmd,
    },
    /// Inspect cluster supply chains
    #[command(alias = "csc")]
    ClusterSupplyChain {
        #[command(subcommand)]
        cmd: supply_chain::SupplyChainCmd,
    },
    /// Local source proxy diagnostics
    #[command(alias = "lsp")]
    LocalSourceProxy {
        #[command(subcommand)]
        cmd: lsp::LspCmd,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Workload { .. } => "workload",
            Commands::ClusterSupplyChain { .. } => "cluster-supply-chain",
            Commands::LocalSourceProxy { .. } => "local-source-proxy",
        }
    }
}

fn init_tracing() {
    let env = std::env::var("APPS_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("APPS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid APPS_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = Config::load(&cli.global).await?;
    let name = cli.command.name();
    info!(command = name, ns = %cfg.namespace, "command invoked");
    counter!("apps_commands_total", 1u64, "command" => name);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            debug!("Ctrl-C received; cancelling");
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::Workload { cmd } => workload::run(&cfg, cmd, &cancel).await,
        Commands::ClusterSupplyChain { cmd } => supply_chain::run(&cfg, cmd).await,
        Commands::LocalSourceProxy { cmd } => lsp::run(&cfg, cmd).await,
    }
}
