//! `apps local-source-proxy ...`

use anyhow::{Context, Result};
use clap::Subcommand;
use tracing::info;

use apps_ops::lsp::{get_status, HEALTH_PATH};
use apps_ops::proxy::local_registry_transport;

use crate::config::Config;
use crate::printer::{write_structured, OutputFormat};

#[derive(Subcommand, Debug)]
pub enum LspCmd {
    /// Report whether the local source proxy is installed, reachable and authenticated
    Health {
        #[arg(short = 'o', long = "output", value_enum, default_value_t = OutputFormat::Yaml)]
        output: OutputFormat,
    },
}

pub async fn run(cfg: &Config, cmd: LspCmd) -> Result<()> {
    match cmd {
        LspCmd::Health { output } => {
            let transport = local_registry_transport(cfg.client.clone(), &[HEALTH_PATH])?;
            let status = get_status(&transport).await.context("querying local source proxy health")?;
            info!(healthy = status.is_healthy(), "local source proxy health");
            write_structured(&mut std::io::stdout().lock(), output, &status)
        }
    }
}
