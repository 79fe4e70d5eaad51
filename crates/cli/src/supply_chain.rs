//! `apps cluster-supply-chain ...`

use std::io::Write;

use anyhow::{anyhow, Context, Result};
use clap::Subcommand;
use kube::api::{Api, ListParams};
use tracing::debug;

use apps_kubehub::ClusterSupplyChain;

use crate::config::Config;
use crate::printer::{describe_ready, write_structured, write_table, OutputFormat, Row};

#[derive(Subcommand, Debug)]
pub enum SupplyChainCmd {
    /// Table listing of cluster supply chains
    List {
        #[arg(short = 'o', long = "output", value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Detailed information about a cluster supply chain
    Get {
        name: String,
        #[arg(short = 'o', long = "output", value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
}

pub async fn run(cfg: &Config, cmd: SupplyChainCmd) -> Result<()> {
    let api: Api<ClusterSupplyChain> = Api::all(cfg.client.clone());
    match cmd {
        SupplyChainCmd::List { output } => {
            let list = api.list(&ListParams::default()).await.context("listing cluster supply chains")?;
            debug!(count = list.items.len(), "cluster supply chains listed");
            let mut out = std::io::stdout().lock();
            if output != OutputFormat::Table {
                return write_structured(&mut out, output, &list.items);
            }
            let rows: Vec<Row> = list
                .items
                .iter()
                .map(|c| Row::new(c.metadata.name.as_deref(), c.ready_condition(), c.metadata.creation_timestamp.as_ref()))
                .collect();
            write_table(&mut out, &rows, "No cluster supply chains found.")
        }
        SupplyChainCmd::Get { name, output } => {
            let chain = match api.get(&name).await {
                Ok(c) => c,
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Err(anyhow!("Cluster Supply Chain {name:?} not found")),
                Err(e) => return Err(e).context("reading cluster supply chain"),
            };
            let mut out = std::io::stdout().lock();
            if output != OutputFormat::Table {
                return write_structured(&mut out, output, &chain);
            }
            writeln!(out, "name:  {name}")?;
            writeln!(out, "ready: {}", describe_ready(chain.ready_condition()))?;
            if let Some(selector) = chain.spec.fields.get("selector").and_then(|s| s.as_object()) {
                writeln!(out, "selector:")?;
                for (k, v) in selector {
                    writeln!(out, "  {k}: {}", v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))?;
                }
            }
            Ok(())
        }
    }
}
