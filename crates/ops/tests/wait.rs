#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::{stream, StreamExt};
use kube::api::ObjectMeta;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use apps_core::{Condition, ConditionStatus, NamespacedName};
use apps_kubehub::crd::{workload_ready, WorkloadSpec, WorkloadStatus};
use apps_kubehub::{Error, EventStream, ObjectGetter, ObjectWatcher, WatchEvent, Workload};
use apps_ops::wait::{race, until_condition, until_delete, worker, WaitError, Worker, MIN_INTERVAL};

type Feed = mpsc::UnboundedSender<apps_kubehub::Result<WatchEvent<Workload>>>;

/// Watcher fed by the test through a channel; it can be opened once.
struct ChannelWatcher {
    rx: Mutex<Option<mpsc::UnboundedReceiver<apps_kubehub::Result<WatchEvent<Workload>>>>>,
}

fn channel_watcher() -> (Feed, ChannelWatcher) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ChannelWatcher { rx: Mutex::new(Some(rx)) })
}

impl ObjectWatcher<Workload> for ChannelWatcher {
    fn watch(&self, _namespace: &str) -> apps_kubehub::Result<EventStream<Workload>> {
        let rx = self.rx.lock().unwrap().take().expect("watch opened twice");
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) }).boxed())
    }
}

fn workload(ns: &str, name: &str, ready: ConditionStatus) -> Workload {
    Workload {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(ns.into()),
            generation: Some(1),
            ..Default::default()
        },
        spec: WorkloadSpec::default(),
        status: Some(WorkloadStatus {
            observed_generation: Some(1),
            conditions: vec![Condition::new("Ready", ready).with_message("Reason", "something went wrong")],
            supply_chain_ref: None,
        }),
    }
}

fn applied(ns: &str, name: &str, ready: ConditionStatus) -> apps_kubehub::Result<WatchEvent<Workload>> {
    Ok(WatchEvent::Applied(workload(ns, name, ready)))
}

fn target() -> NamespacedName { NamespacedName::new("default", "my-workload") }

const DELAY: Duration = Duration::from_secs(1);

#[tokio::test(start_paused = true)]
async fn ready_workload_settles_after_delay() {
    let (feed, watcher) = channel_watcher();
    feed.send(applied("default", "my-workload", ConditionStatus::True)).unwrap();

    let started = Instant::now();
    until_condition(&CancellationToken::new(), &watcher, &target(), workload_ready, DELAY).await.unwrap();
    assert!(started.elapsed() >= DELAY);
    assert!(started.elapsed() < DELAY * 2);
}

#[tokio::test(start_paused = true)]
async fn unsatisfied_observation_delays_success() {
    let (feed, watcher) = channel_watcher();
    tokio::spawn(async move {
        feed.send(applied("default", "my-workload", ConditionStatus::True)).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        feed.send(applied("default", "my-workload", ConditionStatus::Unknown)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        feed.send(applied("default", "my-workload", ConditionStatus::True)).unwrap();
        // keep the watch open
        tokio::time::sleep(Duration::from_secs(3600)).await;
    });

    let started = Instant::now();
    until_condition(&CancellationToken::new(), &watcher, &target(), workload_ready, DELAY).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(1800), "settled at {:?}", started.elapsed());
}

#[tokio::test(start_paused = true)]
async fn flap_before_timer_fires_is_not_success() {
    let (feed, watcher) = channel_watcher();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let script = tokio::spawn(async move {
        feed.send(applied("default", "my-workload", ConditionStatus::True)).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        feed.send(applied("default", "my-workload", ConditionStatus::Unknown)).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        trigger.cancel();
        // the watch must outlive the cancel, or the wait may see a closed stream first
        feed
    });

    let err = until_condition(&cancel, &watcher, &target(), workload_ready, DELAY).await.unwrap_err();
    assert!(matches!(err, WaitError::Cancelled), "got {err:?}");
    drop(script.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn timer_rearms_until_condition_recovers() {
    let (feed, watcher) = channel_watcher();
    let script = tokio::spawn(async move {
        feed.send(applied("default", "my-workload", ConditionStatus::True)).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        feed.send(applied("default", "my-workload", ConditionStatus::Unknown)).unwrap();
        // the timer fires unsatisfied at 1s and re-arms
        tokio::time::sleep(Duration::from_millis(1000)).await;
        feed.send(applied("default", "my-workload", ConditionStatus::True)).unwrap();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        feed
    });

    let started = Instant::now();
    until_condition(&CancellationToken::new(), &watcher, &target(), workload_ready, DELAY).await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(2500), "settled at {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "settled at {elapsed:?}");
    script.abort();
}

#[tokio::test(start_paused = true)]
async fn zero_delay_is_floored() {
    let (feed, watcher) = channel_watcher();
    feed.send(applied("default", "my-workload", ConditionStatus::True)).unwrap();

    let started = Instant::now();
    until_condition(&CancellationToken::new(), &watcher, &target(), workload_ready, Duration::ZERO).await.unwrap();
    assert!(started.elapsed() >= MIN_INTERVAL);
    drop(feed);
}

#[tokio::test(start_paused = true)]
async fn other_objects_are_ignored() {
    let (feed, watcher) = channel_watcher();
    feed.send(applied("default", "anotherworkload", ConditionStatus::True)).unwrap();
    feed.send(applied("other-ns", "my-workload", ConditionStatus::True)).unwrap();
    feed.send(applied("default", "anotherworkload", ConditionStatus::False)).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });
    let err = until_condition(&cancel, &watcher, &target(), workload_ready, DELAY).await.unwrap_err();
    assert!(matches!(err, WaitError::Cancelled), "got {err:?}");
    drop(feed);
}

#[tokio::test(start_paused = true)]
async fn predicate_error_ends_wait() {
    let (feed, watcher) = channel_watcher();
    feed.send(applied("default", "my-workload", ConditionStatus::False)).unwrap();

    let err = until_condition(&CancellationToken::new(), &watcher, &target(), workload_ready, DELAY).await.unwrap_err();
    assert!(matches!(err, WaitError::Condition(_)), "got {err:?}");
    assert_eq!(err.to_string(), "Failed to become ready: something went wrong");
}

#[tokio::test(start_paused = true)]
async fn closed_watch_is_reported() {
    let (feed, watcher) = channel_watcher();
    feed.send(applied("default", "my-workload", ConditionStatus::Unknown)).unwrap();
    drop(feed);

    let err = until_condition(&CancellationToken::new(), &watcher, &target(), workload_ready, DELAY).await.unwrap_err();
    assert!(matches!(err, WaitError::WatchClosed(ref t) if *t == target()), "got {err:?}");
}

#[tokio::test(start_paused = true)]
async fn stream_error_ends_wait() {
    let (feed, watcher) = channel_watcher();
    feed.send(Err(Error::NotFound { kind: "Workload".into(), target: "default/my-workload".into() })).unwrap();

    let err = until_condition(&CancellationToken::new(), &watcher, &target(), workload_ready, DELAY).await.unwrap_err();
    assert!(matches!(err, WaitError::Kube(_)), "got {err:?}");
}

#[tokio::test(start_paused = true)]
async fn watcher_desync_is_skipped() {
    let (feed, watcher) = channel_watcher();
    let gone = kube::core::ErrorResponse {
        status: "Failure".into(),
        message: "too old resource version".into(),
        reason: "Expired".into(),
        code: 410,
    };
    feed.send(Err(Error::Watch(kube::runtime::watcher::Error::WatchError(gone)))).unwrap();
    feed.send(applied("default", "my-workload", ConditionStatus::True)).unwrap();

    let started = Instant::now();
    until_condition(&CancellationToken::new(), &watcher, &target(), workload_ready, DELAY).await.unwrap();
    assert!(started.elapsed() >= DELAY);
    drop(feed);
}

/// Returns the object for the first `present` reads, then a not-found error.
struct CountdownGetter {
    present: usize,
    calls: AtomicUsize,
    fail_with: Option<u16>,
}

#[async_trait::async_trait]
impl ObjectGetter<Workload> for CountdownGetter {
    async fn get(&self, target: &NamespacedName) -> apps_kubehub::Result<Workload> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = self.fail_with {
            return Err(Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: "boom".into(),
                reason: "InternalError".into(),
                code,
            })));
        }
        if n < self.present {
            Ok(workload(&target.namespace, &target.name, ConditionStatus::True))
        } else {
            Err(Error::NotFound { kind: "Workload".into(), target: target.to_string() })
        }
    }
}

#[tokio::test(start_paused = true)]
async fn delete_wait_polls_until_not_found() {
    let getter = CountdownGetter { present: 2, calls: AtomicUsize::new(0), fail_with: None };
    let backoff = Duration::from_secs(5);

    let started = Instant::now();
    until_delete(&CancellationToken::new(), &getter, &target(), backoff).await.unwrap();
    assert_eq!(getter.calls.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= backoff * 3);
}

#[tokio::test(start_paused = true)]
async fn delete_wait_propagates_other_errors() {
    let getter = CountdownGetter { present: 0, calls: AtomicUsize::new(0), fail_with: Some(500) };
    let err = until_delete(&CancellationToken::new(), &getter, &target(), Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, WaitError::Kube(_)), "got {err:?}");
}

#[tokio::test(start_paused = true)]
async fn delete_wait_honours_cancellation() {
    let getter = CountdownGetter { present: usize::MAX, calls: AtomicUsize::new(0), fail_with: None };
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(12)).await;
        trigger.cancel();
    });
    let err = until_delete(&cancel, &getter, &target(), Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, WaitError::Cancelled), "got {err:?}");
    assert_eq!(getter.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn zero_backoff_polls_at_the_floor() {
    let getter = CountdownGetter { present: 3, calls: AtomicUsize::new(0), fail_with: None };

    let started = Instant::now();
    until_delete(&CancellationToken::new(), &getter, &target(), Duration::ZERO).await.unwrap();
    assert_eq!(getter.calls.load(Ordering::SeqCst), 4);
    assert!(started.elapsed() >= MIN_INTERVAL * 4);
}

#[tokio::test(start_paused = true)]
async fn race_over_condition_wait_times_out() {
    let (feed, watcher) = channel_watcher();
    let watcher = std::sync::Arc::new(watcher);
    let workers: Vec<Worker<WaitError>> = vec![worker(move |token: CancellationToken| async move {
        until_condition(&token, watcher.as_ref(), &target(), workload_ready, DELAY).await
    })];

    let err = race(&CancellationToken::new(), Duration::from_secs(3), workers).await.unwrap_err();
    assert!(matches!(err, WaitError::DeadlineExceeded), "got {err:?}");
    drop(feed);
}
