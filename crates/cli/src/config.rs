//! Command configuration: global flags resolved against the kubeconfig.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use kube::Client;
use tracing::debug;

use apps_ops::wait::DEFAULT_BACKOFF;

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Kubernetes namespace (default: kubeconfig context namespace)
    #[arg(short = 'n', long = "namespace", global = true, env = "APPS_NAMESPACE")]
    pub namespace: Option<String>,

    /// How long a condition must hold before a wait succeeds
    #[arg(long = "ready-delay", global = true, env = "APPS_READY_DELAY", default_value = "1s", value_parser = humantime::parse_duration)]
    pub ready_delay: Duration,

    /// Poll interval while waiting for a deletion
    #[arg(long = "delete-backoff", global = true, env = "APPS_DELETE_BACKOFF", default_value = "5s", value_parser = humantime::parse_duration)]
    pub delete_backoff: Duration,
}

/// Everything a command needs; passed explicitly instead of read from ambient state.
#[derive(Clone)]
pub struct Config {
    pub client: Client,
    pub namespace: String,
    pub ready_delay: Duration,
    pub delete_backoff: Duration,
}

impl Config {
    pub async fn load(args: &GlobalArgs) -> Result<Self> {
        let client = Client::try_default().await.context("loading kubeconfig")?;
        let namespace = args.namespace.clone().unwrap_or_else(|| client.default_namespace().to_string());
        debug!(ns = %namespace, "client ready");
        Ok(Self {
            client,
            namespace,
            ready_delay: args.ready_delay,
            delete_backoff: if args.delete_backoff.is_zero() { DEFAULT_BACKOFF } else { args.delete_backoff },
        })
    }
}

/// Render a duration the way the flags accept it, e.g. `10m` or `1m 30s`.
pub fn fmt_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}
