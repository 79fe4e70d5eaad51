//! Follow the logs of every pod a workload produces.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, LogParams},
    runtime::watcher::{self, Event},
    Client,
};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use apps_kubehub::WORKLOAD_LABEL_NAME;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub pod: String,
    pub container: String,
    pub line: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]: {}", self.pod, self.container, self.line)
    }
}

#[derive(Debug, Clone)]
pub struct TailOptions {
    /// Only return logs newer than this.
    pub since: Option<Duration>,
    pub timestamps: bool,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self { since: Some(Duration::from_secs(60)), timestamps: false }
    }
}

/// Stream logs of running pods labelled for `workload` into `sink` until cancelled.
///
/// Pods are discovered through a watch, so pods created after the call starts
/// are followed too. Each container has at most one live stream.
pub async fn tail_workload(
    cancel: &CancellationToken,
    client: Client,
    namespace: &str,
    workload: &str,
    opts: TailOptions,
    sink: mpsc::Sender<LogLine>,
) -> anyhow::Result<()> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let selector = format!("{WORKLOAD_LABEL_NAME}={workload}");
    let mut events = watcher::watcher(api.clone(), watcher::Config::default().labels(&selector)).boxed();
    info!(ns = %namespace, selector = %selector, "tailing workload logs");

    let lp = LogParams {
        follow: true,
        since_seconds: opts.since.map(|d| d.as_secs() as i64),
        timestamps: opts.timestamps,
        ..LogParams::default()
    };
    let streams_token = cancel.child_token();
    let mut followed = Followed::default();

    let outcome = loop {
        let pods = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            Some((pod, container)) = followed.finished(), if !followed.is_empty() => {
                debug!(pod = %pod, container = %container, "log stream ended");
                Vec::new()
            }
            ev = events.try_next() => match ev {
                Ok(Some(Event::Applied(p))) => vec![p],
                Ok(Some(Event::Restarted(list))) => list,
                Ok(Some(Event::Deleted(_))) => Vec::new(),
                Ok(None) => break Ok(()),
                Err(e) => break Err(anyhow::Error::new(e).context("watching workload pods")),
            },
        };
        for (pod, container) in pods.iter().flat_map(running_containers) {
            let mut params = lp.clone();
            params.container = Some(container.clone());
            let pump = stream_container(api.clone(), pod.clone(), container.clone(), params, sink.clone(), streams_token.clone());
            if followed.start((pod.clone(), container.clone()), pump) {
                debug!(pod = %pod, container = %container, "starting log stream");
            }
        }
    };

    streams_token.cancel();
    followed.shutdown().await;
    outcome
}

/// Containers with a live log pump, keyed by `(pod, container)`.
///
/// A key is released when its pump ends, so a restarted container is
/// followed again on the next pod event.
#[derive(Default)]
struct Followed {
    live: HashSet<(String, String)>,
    pumps: JoinSet<(String, String)>,
}

impl Followed {
    fn is_empty(&self) -> bool {
        self.pumps.is_empty()
    }

    /// Spawn `pump` unless `key` is already being followed.
    fn start<F>(&mut self, key: (String, String), pump: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.reap();
        if !self.live.insert(key.clone()) {
            return false;
        }
        self.pumps.spawn(async move {
            pump.await;
            key
        });
        true
    }

    fn reap(&mut self) {
        while let Some(joined) = self.pumps.try_join_next() {
            self.release(joined);
        }
    }

    /// Wait for the next pump to end and release its key.
    async fn finished(&mut self) -> Option<(String, String)> {
        loop {
            let joined = self.pumps.join_next().await?;
            if let Some(key) = self.release(joined) {
                return Some(key);
            }
        }
    }

    fn release(&mut self, joined: Result<(String, String), tokio::task::JoinError>) -> Option<(String, String)> {
        match joined {
            Ok(key) => {
                self.live.remove(&key);
                Some(key)
            }
            Err(e) => {
                warn!(error = %e, "log pump task failed");
                None
            }
        }
    }

    async fn shutdown(mut self) {
        while self.pumps.join_next().await.is_some() {}
    }
}

fn running_containers(pod: &Pod) -> Vec<(String, String)> {
    let running = pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running");
    let name = match pod.metadata.name.clone() {
        Some(n) if running => n,
        _ => return Vec::new(),
    };
    pod.spec
        .as_ref()
        .map(|s| s.containers.iter().map(|c| (name.clone(), c.name.clone())).collect())
        .unwrap_or_default()
}

async fn stream_container(
    api: Api<Pod>,
    pod: String,
    container: String,
    params: LogParams,
    tx: mpsc::Sender<LogLine>,
    cancel: CancellationToken,
) {
    use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};

    let reader = tokio::select! {
        _ = cancel.cancelled() => return,
        res = api.log_stream(&pod, &params) => match res {
            Ok(r) => r,
            Err(e) => {
                warn!(pod = %pod, container = %container, error = %e, "log_stream failed to open");
                return;
            }
        },
    };
    // futures::io::AsyncRead -> tokio::io::AsyncRead -> Stream<Bytes>
    let stream = ReaderStream::new(reader.compat());
    pump_bytes_to_lines(stream, tx, cancel, &pod, &container).await;
}

/// Consume a byte stream, split it into lines and forward them over a bounded channel.
/// Drops lines when the channel is full. Flushes the last partial line on end.
pub(crate) async fn pump_bytes_to_lines<S, E>(
    stream: S,
    tx: mpsc::Sender<LogLine>,
    cancel: CancellationToken,
    pod: &str,
    container: &str,
) where
    S: futures::Stream<Item = Result<bytes::Bytes, E>>,
    E: fmt::Display,
{
    let line = |bytes: &[u8]| LogLine {
        pod: pod.to_string(),
        container: container.to_string(),
        line: String::from_utf8_lossy(bytes).into_owned(),
    };
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => { debug!(pod = %pod, container = %container, "log pump cancelled"); break; }
            next = stream.next() => match next {
                Some(Ok(chunk)) => {
                    buf.extend_from_slice(&chunk);
                    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        let l = buf.split_to(pos);
                        let _ = buf.split_to(1);
                        let _ = tx.try_send(line(&l));
                    }
                }
                Some(Err(e)) => { warn!(pod = %pod, container = %container, error = %e, "log stream error"); break; }
                None => break,
            }
        }
    }
    if !buf.is_empty() {
        let _ = tx.try_send(line(&buf));
    }
    debug!(pod = %pod, container = %container, "log pump ended");
}
