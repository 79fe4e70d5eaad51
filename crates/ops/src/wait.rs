//! Readiness waits: watch-driven condition waits with a debounce window,
//! polled deletion waits, and a first-wins race over cooperative workers.

use std::future::Future;
use std::time::Duration;

use futures::{future::BoxFuture, FutureExt, StreamExt};
use kube::Resource;
use metrics::{counter, histogram};
use tokio::{sync::mpsc, task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use apps_core::NamespacedName;
use apps_kubehub::{ObjectGetter, ObjectWatcher};

/// Poll interval used by [`until_delete`] when the caller has no preference.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

/// Floor for debounce windows and poll intervals. `interval` panics on zero
/// and a zero debounce would spin on every unsatisfied tick.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("wait cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error(transparent)]
    Condition(anyhow::Error),
    #[error(transparent)]
    Kube(#[from] apps_kubehub::Error),
    #[error("watch for {0} ended before the condition settled")]
    WatchClosed(NamespacedName),
}

/// Wait until `condition` holds for `target` and stays held for `delay`.
///
/// Every satisfied observation restarts the debounce timer; an unsatisfied one
/// only clears the flag the timer checks when it fires. The first timer is
/// armed at call start, so success never comes earlier than `delay`.
///
/// Watcher errors are logged and skipped since the watcher re-lists on its own
/// (a 410 desync, for example). Any other stream error ends the wait.
pub async fn until_condition<K, W, F>(
    cancel: &CancellationToken,
    watcher: &W,
    target: &NamespacedName,
    condition: F,
    delay: Duration,
) -> Result<(), WaitError>
where
    K: Resource,
    W: ObjectWatcher<K> + ?Sized,
    F: Fn(&K) -> anyhow::Result<bool>,
{
    let started = Instant::now();
    let delay = delay.max(MIN_INTERVAL);
    let mut events = watcher.watch(&target.namespace)?;
    let debounce = tokio::time::sleep(delay);
    tokio::pin!(debounce);
    let mut satisfied = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            _ = &mut debounce => {
                if satisfied {
                    histogram!("apps_wait_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "condition");
                    info!(target = %target, "condition settled");
                    return Ok(());
                }
                debounce.as_mut().reset(Instant::now() + delay);
            }
            next = events.next() => match next {
                Some(Ok(ev)) => {
                    let obj = ev.object();
                    let meta = obj.meta();
                    if target.matches(meta.namespace.as_deref(), meta.name.as_deref()) {
                        if condition(obj).map_err(WaitError::Condition)? {
                            debounce.as_mut().reset(Instant::now() + delay);
                            satisfied = true;
                        } else {
                            if satisfied {
                                counter!("apps_wait_condition_flaps_total", 1u64);
                                debug!(target = %target, "condition flapped back to unsatisfied");
                            }
                            satisfied = false;
                        }
                    }
                }
                Some(Err(apps_kubehub::Error::Watch(e))) => {
                    counter!("apps_wait_watch_errors_total", 1u64);
                    warn!(target = %target, error = %e, "watch error; waiting for the watcher to recover");
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(WaitError::WatchClosed(target.clone())),
            }
        }
    }
}

/// Poll `target` every `backoff` (at least [`MIN_INTERVAL`]) until it is gone.
pub async fn until_delete<K, G>(
    cancel: &CancellationToken,
    getter: &G,
    target: &NamespacedName,
    backoff: Duration,
) -> Result<(), WaitError>
where
    G: ObjectGetter<K> + ?Sized,
{
    let started = Instant::now();
    let backoff = backoff.max(MIN_INTERVAL);
    let mut ticker = tokio::time::interval_at(Instant::now() + backoff, backoff);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            _ = ticker.tick() => {}
        }
        let res = tokio::select! {
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            res = getter.get(target) => res,
        };
        match res {
            Ok(_) => debug!(target = %target, "still present"),
            Err(e) if e.is_not_found() => {
                histogram!("apps_wait_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "delete");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// A unit of work for [`race`]. It must return promptly once its token is cancelled.
pub type Worker<E> = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), E>> + Send>;

pub fn worker<E, F, Fut>(f: F) -> Worker<E>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    Box::new(move |token| f(token).boxed())
}

/// Run every worker concurrently under one deadline; the first to finish decides the result.
///
/// Finishing workers cancel their siblings. The call only returns after every
/// worker and the deadline watcher have returned. A worker panic is resumed on
/// the caller once everything else has been joined.
pub async fn race<E>(cancel: &CancellationToken, timeout: Duration, workers: Vec<Worker<E>>) -> Result<(), E>
where
    E: From<WaitError> + Send + 'static,
{
    let token = cancel.child_token();
    // Every task sends exactly once, so senders never wait on capacity.
    let (tx, mut rx) = mpsc::channel::<Result<(), E>>(workers.len() + 1);
    let mut tasks = JoinSet::new();

    {
        let token = token.clone();
        let tx = tx.clone();
        tasks.spawn(async move {
            let err = tokio::select! {
                _ = tokio::time::sleep(timeout) => WaitError::DeadlineExceeded,
                _ = token.cancelled() => WaitError::Cancelled,
            };
            let _ = tx.send(Err(err.into())).await;
            token.cancel();
        });
    }

    for w in workers {
        let token = token.clone();
        let tx = tx.clone();
        tasks.spawn(async move {
            let _cancel_on_exit = token.clone().drop_guard();
            let res = w(token).await;
            let _ = tx.send(res).await;
        });
    }
    drop(tx);

    let mut panicked = None;
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() && panicked.is_none() {
                panicked = Some(e.into_panic());
            }
        }
    }
    if let Some(payload) = panicked {
        std::panic::resume_unwind(payload);
    }
    rx.recv().await.unwrap_or_else(|| Err(WaitError::Cancelled.into()))
}
