//! `apps workload ...`

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Subcommand, ValueHint};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use apps_core::NamespacedName;
use apps_kubehub::crd::{workload_ready, WorkloadSpec};
use apps_kubehub::{GitRef, GitSource, KubeObjects, Workload, LOCAL_SOURCE_PROXY_ANNOTATION};
use apps_ops::proxy::local_registry_transport;
use apps_ops::source::{load_exclusions, package, publish_local_source};
use apps_ops::tail::{tail_workload, LogLine, TailOptions};
use apps_ops::wait::{race, until_condition, until_delete, worker, WaitError, Worker};

use crate::config::{fmt_duration, Config};
use crate::printer::{describe_ready, write_structured, write_table, OutputFormat, Row};

const FIELD_MANAGER: &str = "apps-cli";
const TAIL_QUEUE: usize = 1024;

#[derive(Subcommand, Debug)]
pub enum WorkloadCmd {
    /// Table listing of workloads
    List {
        #[arg(short = 'o', long = "output", value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Detailed information about a workload
    Get {
        name: String,
        #[arg(short = 'o', long = "output", value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Create or update a workload from a YAML file, flags, or both
    Apply {
        /// Workload name; may be omitted when the file names it
        name: Option<String>,
        #[arg(short = 'f', long = "file", value_hint = ValueHint::FilePath)]
        file: Option<PathBuf>,
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        follow: FollowArgs,
    },
    /// Wait for a workload to become ready
    Wait {
        name: String,
        #[command(flatten)]
        follow: FollowArgs,
    },
    /// Delete one or more workloads
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
        /// Confirm deletion
        #[arg(short = 'y', long = "yes", action = ArgAction::SetTrue)]
        yes: bool,
        /// Wait until every workload is gone
        #[arg(long = "wait", action = ArgAction::SetTrue)]
        wait: bool,
        #[arg(long = "wait-timeout", env = "APPS_WAIT_TIMEOUT", default_value = "1m", value_parser = humantime::parse_duration)]
        wait_timeout: Duration,
    },
    /// Follow the logs of every pod a workload produced
    Tail {
        name: String,
        /// Start reading logs this far back
        #[arg(long = "since", default_value = "1m", value_parser = humantime::parse_duration)]
        since: Duration,
        #[arg(short = 't', long = "timestamp", action = ArgAction::SetTrue)]
        timestamp: bool,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct FollowArgs {
    /// Wait for the workload to become ready
    #[arg(long = "wait", action = ArgAction::SetTrue)]
    pub wait: bool,
    /// Show workload logs while waiting
    #[arg(long = "tail", action = ArgAction::SetTrue)]
    pub tail: bool,
    /// Show workload logs with timestamps while waiting
    #[arg(long = "tail-timestamp", action = ArgAction::SetTrue)]
    pub tail_timestamp: bool,
    #[arg(long = "wait-timeout", env = "APPS_WAIT_TIMEOUT", default_value = "10m", value_parser = humantime::parse_duration)]
    pub wait_timeout: Duration,
}

/// Source flags, layered over whatever `-f` provides.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct SourceArgs {
    /// Pre-built image to deploy, skipping the source and build steps
    #[arg(long = "image", conflicts_with_all = ["git_repo", "git_branch", "git_tag", "git_commit", "local_path"])]
    pub image: Option<String>,
    /// Git repository to build from
    #[arg(long = "git-repo", conflicts_with = "local_path")]
    pub git_repo: Option<String>,
    #[arg(long = "git-branch", conflicts_with = "local_path")]
    pub git_branch: Option<String>,
    #[arg(long = "git-tag", conflicts_with = "local_path")]
    pub git_tag: Option<String>,
    #[arg(long = "git-commit", conflicts_with = "local_path")]
    pub git_commit: Option<String>,
    /// Directory to publish through the local source proxy
    #[arg(long = "local-path", value_hint = ValueHint::DirPath)]
    pub local_path: Option<PathBuf>,
}

impl SourceArgs {
    fn any_git(&self) -> bool {
        self.git_repo.is_some() || self.git_branch.is_some() || self.git_tag.is_some() || self.git_commit.is_some()
    }
}

impl FollowArgs {
    fn any_tail(&self) -> bool { self.tail || self.tail_timestamp }
}

pub async fn run(cfg: &Config, cmd: WorkloadCmd, cancel: &CancellationToken) -> Result<()> {
    match cmd {
        WorkloadCmd::List { output } => list(cfg, output).await,
        WorkloadCmd::Get { name, output } => get(cfg, &name, output).await,
        WorkloadCmd::Apply { name, file, source, follow } => {
            let target = apply(cfg, name.as_deref(), file.as_deref(), &source).await?;
            if follow.wait || follow.any_tail() {
                wait_ready(cfg, &target, &follow, cancel).await?;
            }
            Ok(())
        }
        WorkloadCmd::Wait { name, follow } => {
            let target = NamespacedName::parse(&name, &cfg.namespace)?;
            wait_ready(cfg, &target, &follow, cancel).await
        }
        WorkloadCmd::Delete { names, yes, wait, wait_timeout } => delete(cfg, &names, yes, wait, wait_timeout, cancel).await,
        WorkloadCmd::Tail { name, since, timestamp } => {
            let opts = TailOptions { since: Some(since), timestamps: timestamp };
            follow_logs(cfg.client.clone(), &cfg.namespace, &name, opts, cancel).await
        }
    }
}

async fn list(cfg: &Config, output: OutputFormat) -> Result<()> {
    let api: Api<Workload> = Api::namespaced(cfg.client.clone(), &cfg.namespace);
    let list = api.list(&ListParams::default()).await.context("listing workloads")?;
    debug!(ns = %cfg.namespace, count = list.items.len(), "workloads listed");
    let mut out = std::io::stdout().lock();
    if output != OutputFormat::Table {
        return write_structured(&mut out, output, &list.items);
    }
    let rows: Vec<Row> = list
        .items
        .iter()
        .map(|w| Row::new(w.metadata.name.as_deref(), w.ready_condition(), w.metadata.creation_timestamp.as_ref()))
        .collect();
    write_table(&mut out, &rows, &format!("No workloads found in namespace {:?}.", cfg.namespace))
}

async fn get(cfg: &Config, name: &str, output: OutputFormat) -> Result<()> {
    let target = NamespacedName::parse(name, &cfg.namespace)?;
    let api: Api<Workload> = Api::namespaced(cfg.client.clone(), &target.namespace);
    let w = match api.get(&target.name).await {
        Ok(w) => w,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            return Err(anyhow!("Workload {:?} not found in namespace {:?}", target.name, target.namespace))
        }
        Err(e) => return Err(e).context("reading workload"),
    };
    let mut out = std::io::stdout().lock();
    if output != OutputFormat::Table {
        return write_structured(&mut out, output, &w);
    }
    writeln!(out, "name:      {}", target.name)?;
    writeln!(out, "namespace: {}", target.namespace)?;
    if let Some(t) = w.metadata.labels.as_ref().and_then(|l| l.get("apps.tanzu.vmware.com/workload-type")) {
        writeln!(out, "type:      {t}")?;
    }
    writeln!(out, "ready:     {}", describe_ready(w.ready_condition()))?;
    if let Some(chain) = w.status.as_ref().and_then(|s| s.supply_chain_ref.as_ref()).and_then(|r| r.get("name")) {
        writeln!(out, "supply chain: {}", chain.as_str().unwrap_or_default())?;
    }
    Ok(())
}

fn load_workload(file: &Path) -> Result<Workload> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("unable to open file {:?}", file.display().to_string()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("unable to load file {:?}", file.display().to_string()))
}

/// Settle the workload's name and namespace from the argument, the file and the default namespace.
fn resolve_target(w: &mut Workload, name: Option<&str>, default_ns: &str) -> Result<NamespacedName> {
    let inline = w.metadata.name.clone();
    match (name, inline.as_deref()) {
        (Some(arg), Some(inline)) if arg != inline => {
            bail!("workload name {arg:?} does not match {inline:?} from the file")
        }
        (Some(arg), _) => w.metadata.name = Some(arg.to_string()),
        (None, Some(_)) => {}
        (None, None) => bail!("a workload name is required, either as an argument or in --file"),
    }
    let namespace = w.metadata.namespace.get_or_insert_with(|| default_ns.to_string()).clone();
    Ok(NamespacedName::new(namespace, w.metadata.name.clone().unwrap_or_default()))
}

/// Apply `--image` and the `--git-*` flags. `--local-path` is applied once the source is published.
fn apply_source_flags(w: &mut Workload, source: &SourceArgs) -> Result<()> {
    if let Some(image) = &source.image {
        w.set_image(image);
        w.remove_annotation(LOCAL_SOURCE_PROXY_ANNOTATION);
    }
    if source.any_git() {
        w.set_git(GitSource {
            url: source.git_repo.clone().unwrap_or_default(),
            git_ref: GitRef {
                branch: source.git_branch.clone(),
                tag: source.git_tag.clone(),
                commit: source.git_commit.clone(),
            },
        });
        if w.git_source().map_or(true, |g| g.url.is_empty()) {
            bail!("no git repository to build from, pass --git-repo");
        }
        w.remove_annotation(LOCAL_SOURCE_PROXY_ANNOTATION);
    }
    Ok(())
}

/// Package `dir` and push it through the local source proxy; returns the digested image.
async fn publish_source(cfg: &Config, target: &NamespacedName, dir: &Path) -> Result<String> {
    println!("Publishing source in {:?}...", dir.display().to_string());
    let root = dir.to_path_buf();
    let image = tokio::task::spawn_blocking(move || {
        let exclusions = load_exclusions(&root)?;
        package(&root, &exclusions)
    })
    .await
    .context("packaging source")??;

    let wrapper = local_registry_transport(cfg.client.clone(), &[])?;
    let tag = format!("{}-{}", target.namespace, target.name);
    publish_local_source(&wrapper, &tag, &image).await.context("publishing source through the local source proxy")
}

/// Server-side apply of a Workload built from the file and flags; returns its name.
async fn apply(cfg: &Config, name: Option<&str>, file: Option<&Path>, source: &SourceArgs) -> Result<NamespacedName> {
    let mut w = match file {
        Some(f) => load_workload(f)?,
        None => Workload { metadata: Default::default(), spec: WorkloadSpec::default(), status: None },
    };
    let target = resolve_target(&mut w, name, &cfg.namespace)?;
    // server-side apply rejects these
    w.metadata.managed_fields = None;
    w.metadata.resource_version = None;
    apply_source_flags(&mut w, source)?;

    let api: Api<Workload> = Api::namespaced(cfg.client.clone(), &target.namespace);
    if let Some(dir) = &source.local_path {
        let current = api.get_opt(&target.name).await.with_context(|| format!("reading workload {:?}", target.name))?;
        let image = publish_source(cfg, &target, dir).await?;
        if current.as_ref().and_then(Workload::source_image) == Some(image.as_str()) {
            println!("No source code is changed");
        } else {
            println!("Published source");
        }
        w.set_source_image(&image);
        w.set_annotation(LOCAL_SOURCE_PROXY_ANNOTATION, &image);
    }

    let pp = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(&target.name, &pp, &Patch::Apply(&w)).await.with_context(|| format!("applying workload {:?}", target.name))?;
    info!(ns = %target.namespace, name = %target.name, "workload applied");
    println!("Workload {:?} applied in namespace {:?}", target.name, target.namespace);
    Ok(target)
}

async fn wait_ready(cfg: &Config, target: &NamespacedName, follow: &FollowArgs, cancel: &CancellationToken) -> Result<()> {
    println!("Waiting for workload {:?} to become ready...", target.name);
    let objects = KubeObjects::new(cfg.client.clone());
    let delay = cfg.ready_delay;
    let mut workers: Vec<Worker<anyhow::Error>> = vec![{
        let target = target.clone();
        worker(move |token: CancellationToken| async move {
            until_condition::<Workload, _, _>(&token, &objects, &target, workload_ready, delay).await?;
            Ok(())
        })
    }];
    if follow.any_tail() {
        let client = cfg.client.clone();
        let target = target.clone();
        let opts = TailOptions { since: Some(Duration::from_secs(60)), timestamps: follow.tail_timestamp };
        workers.push(worker(move |token: CancellationToken| async move {
            follow_logs(client, &target.namespace, &target.name, opts, &token).await?;
            // Log output alone never decides the outcome.
            token.cancelled().await;
            Ok(())
        }));
    }

    match race(cancel, follow.wait_timeout, workers).await {
        Ok(()) => {
            println!("Workload {:?} is ready", target.name);
            Ok(())
        }
        Err(e) if matches!(e.downcast_ref::<WaitError>(), Some(WaitError::DeadlineExceeded)) => Err(anyhow!(
            "timeout after {} waiting for {:?} to become ready",
            fmt_duration(follow.wait_timeout),
            target.name
        )),
        Err(e) => Err(e),
    }
}

async fn delete(
    cfg: &Config,
    names: &[String],
    yes: bool,
    wait: bool,
    wait_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let objects = KubeObjects::new(cfg.client.clone());
    for raw in names {
        let target = NamespacedName::parse(raw, &cfg.namespace)?;
        if !yes {
            println!("Skipping workload {:?}, pass --yes to confirm deletion", target.name);
            continue;
        }
        let api: Api<Workload> = objects.api(&target.namespace);
        match api.delete(&target.name, &DeleteParams::default()).await {
            Ok(_) => println!("Deleted workload {:?}", target.name),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                println!("Workload {:?} does not exist in namespace {:?}", target.name, target.namespace);
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("deleting workload {:?}", target.name)),
        }
        if !wait {
            continue;
        }

        println!("Waiting for workload {:?} to be deleted...", target.name);
        let backoff = cfg.delete_backoff;
        let workers: Vec<Worker<anyhow::Error>> = vec![{
            let objects = objects.clone();
            let target = target.clone();
            worker(move |token: CancellationToken| async move {
                until_delete::<Workload, _>(&token, &objects, &target, backoff).await?;
                Ok(())
            })
        }];
        match race(cancel, wait_timeout, workers).await {
            Ok(()) => println!("Workload {:?} was deleted", target.name),
            Err(e) if matches!(e.downcast_ref::<WaitError>(), Some(WaitError::DeadlineExceeded)) => {
                return Err(anyhow!(
                    "timeout after {} waiting for {:?} to be deleted",
                    fmt_duration(wait_timeout),
                    target.name
                ))
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Print workload logs to stdout until cancelled.
async fn follow_logs(
    client: kube::Client,
    namespace: &str,
    name: &str,
    opts: TailOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<LogLine>(TAIL_QUEUE);
    let printer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            println!("{line}");
        }
    });
    let res = tail_workload(cancel, client, namespace, name, opts, tx).await;
    // the sender is gone once tail_workload returns, so the printer drains and exits
    let _ = printer.await;
    res
}
