use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backoff::Backoff;
use super::job::{JobError, JobSummary, Priority, TransferJob};

const EVENT_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueSnapshot {
    /// Not-yet-started jobs, including those waiting out a retry delay.
    pub pending: usize,
    pub inflight: usize,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    QueueChanged(QueueSnapshot),
    JobStarted(JobSummary),
    JobCompleted(JobSummary),
    JobRetry {
        job: JobSummary,
        attempt: u32,
        delay: Duration,
        error: JobError,
    },
    JobFailed {
        job: JobSummary,
        error: JobError,
    },
    JobCancelled(JobSummary),
}

struct RunningJob {
    dedup_key: String,
    cancel: CancellationToken,
}

struct WaitingRetry {
    job_id: u64,
    cancel: CancellationToken,
}

struct QueueState {
    pending: BTreeMap<(Priority, u64), TransferJob>,
    pending_keys: HashMap<String, (Priority, u64)>,
    running: HashMap<u64, RunningJob>,
    retrying: HashMap<String, WaitingRetry>,
    next_seq: u64,
    online: bool,
    concurrency: usize,
}

impl QueueState {
    fn snapshot(&self) -> QueueSnapshot {
        let pending = self.pending.len() + self.retrying.len();
        let inflight = self.running.len();
        QueueSnapshot {
            pending,
            inflight,
            total: pending + inflight,
        }
    }

    fn key_running(&self, key: &str) -> bool {
        self.running.values().any(|job| job.dedup_key == key)
    }

    fn insert_pending(&mut self, job: TransferJob) {
        let slot = (job.priority, self.next_seq);
        self.next_seq += 1;
        self.pending_keys.insert(job.dedup_key.clone(), slot);
        self.pending.insert(slot, job);
    }

    fn remove_pending_key(&mut self, key: &str) -> Option<TransferJob> {
        let slot = self.pending_keys.remove(key)?;
        self.pending.remove(&slot)
    }

    /// Highest-priority pending job whose key is not already running.
    fn next_runnable(&self) -> Option<(Priority, u64)> {
        self.pending
            .iter()
            .find(|(_, job)| !self.key_running(&job.dedup_key))
            .map(|(slot, _)| *slot)
    }
}

struct Shared {
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
    snapshot: watch::Sender<QueueSnapshot>,
    backoff: Backoff,
}

/// Priority-ordered job scheduler with a concurrency bound, per-key
/// deduplication and retry with exponential backoff.
#[derive(Clone)]
pub struct TransferQueue {
    shared: Arc<Shared>,
}

impl TransferQueue {
    pub fn new(concurrency: usize) -> Self {
        Self::with_backoff(concurrency, Backoff::job_retry())
    }

    pub fn with_backoff(concurrency: usize, backoff: Backoff) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (snapshot, _) = watch::channel(QueueSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    pending: BTreeMap::new(),
                    pending_keys: HashMap::new(),
                    running: HashMap::new(),
                    retrying: HashMap::new(),
                    next_seq: 0,
                    online: true,
                    concurrency: concurrency.max(1),
                }),
                events,
                snapshot,
                backoff,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.shared.events.send(event);
    }

    fn publish(&self, snapshot: QueueSnapshot) {
        self.shared.snapshot.send_replace(snapshot);
        self.emit(QueueEvent::QueueChanged(snapshot));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.lock().snapshot()
    }

    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    pub fn concurrency(&self) -> usize {
        self.lock().concurrency
    }

    /// Adds `job`, replacing any not-yet-started job with the same key.
    /// Returns the job id.
    pub fn enqueue(&self, job: TransferJob) -> u64 {
        let id = job.id;
        let key = job.dedup_key.clone();
        let (replaced, snapshot) = {
            let mut state = self.lock();
            let replaced = state.remove_pending_key(&key);
            if let Some(waiting) = state.retrying.remove(&key) {
                // The retry task sees the token and reports the cancellation.
                waiting.cancel.cancel();
            }
            state.insert_pending(job);
            (replaced, state.snapshot())
        };
        if let Some(old) = replaced {
            debug!("superseded pending job {} ({})", old.id, old.dedup_key);
            old.cancel.cancel();
            self.emit(QueueEvent::JobCancelled(old.summary()));
        }
        self.publish(snapshot);
        self.schedule();
        id
    }

    fn schedule(&self) {
        let (started, snapshot) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let mut started = Vec::new();
            while state.online && state.running.len() < state.concurrency {
                let Some(slot) = state.next_runnable() else {
                    break;
                };
                let Some(job) = state.pending.remove(&slot) else {
                    break;
                };
                state.pending_keys.remove(&job.dedup_key);
                state.running.insert(
                    job.id,
                    RunningJob {
                        dedup_key: job.dedup_key.clone(),
                        cancel: job.cancel.clone(),
                    },
                );
                started.push(job);
            }
            (started, state.snapshot())
        };
        if started.is_empty() {
            return;
        }
        self.publish(snapshot);
        for job in started {
            self.emit(QueueEvent::JobStarted(job.summary()));
            let queue = self.clone();
            tokio::spawn(async move { queue.execute(job).await });
        }
    }

    async fn execute(&self, mut job: TransferJob) {
        let outcome = if job.cancel.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            job.run().await
        };

        match outcome {
            Ok(()) => {
                self.finish(job.id);
                self.emit(QueueEvent::JobCompleted(job.summary()));
            }
            Err(err) if matches!(err, JobError::Cancelled) || job.cancel.is_cancelled() => {
                self.finish(job.id);
                self.emit(QueueEvent::JobCancelled(job.summary()));
            }
            Err(err) if job.retry_count < job.max_retries => {
                job.retry_count += 1;
                let delay = self.shared.backoff.delay(job.retry_count - 1);
                self.park_for_retry(job, delay, err);
            }
            Err(err) => {
                self.finish(job.id);
                warn!(
                    "{} {} failed after {} attempts: {}",
                    job.kind,
                    job.remote_path,
                    job.retry_count + 1,
                    err
                );
                self.emit(QueueEvent::JobFailed {
                    job: job.summary(),
                    error: err,
                });
            }
        }
        self.schedule();
    }

    fn finish(&self, job_id: u64) {
        let snapshot = {
            let mut state = self.lock();
            state.running.remove(&job_id);
            state.snapshot()
        };
        self.publish(snapshot);
    }

    fn park_for_retry(&self, job: TransferJob, delay: Duration, error: JobError) {
        let superseded = {
            let mut state = self.lock();
            state.running.remove(&job.id);
            let superseded = state.pending_keys.contains_key(&job.dedup_key);
            if !superseded {
                state.retrying.insert(
                    job.dedup_key.clone(),
                    WaitingRetry {
                        job_id: job.id,
                        cancel: job.cancel.clone(),
                    },
                );
            }
            superseded
        };

        if superseded {
            // A newer job for the same resource is already waiting.
            job.cancel.cancel();
            self.publish(self.snapshot());
            self.emit(QueueEvent::JobCancelled(job.summary()));
            return;
        }

        debug!(
            "retrying {} {} in {:?} (attempt {})",
            job.kind, job.remote_path, delay, job.retry_count
        );
        self.publish(self.snapshot());
        self.emit(QueueEvent::JobRetry {
            job: job.summary(),
            attempt: job.retry_count,
            delay,
            error,
        });

        let queue = self.clone();
        tokio::spawn(async move {
            let token = job.cancel.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => {}
            }
            queue.requeue(job);
        });
    }

    fn requeue(&self, job: TransferJob) {
        let cancelled = {
            let mut state = self.lock();
            let owns_slot = state
                .retrying
                .get(&job.dedup_key)
                .is_some_and(|waiting| waiting.job_id == job.id);
            if owns_slot {
                state.retrying.remove(&job.dedup_key);
            }
            if job.cancel.is_cancelled() {
                Some(job)
            } else {
                state.insert_pending(job);
                None
            }
        };
        if let Some(job) = cancelled {
            self.emit(QueueEvent::JobCancelled(job.summary()));
        }
        self.publish(self.snapshot());
        self.schedule();
    }

    /// Gates dispatch; running jobs are unaffected.
    pub fn set_online(&self, online: bool) {
        let changed = {
            let mut state = self.lock();
            let changed = state.online != online;
            state.online = online;
            changed
        };
        if changed {
            debug!("transfer queue {}", if online { "online" } else { "offline" });
        }
        if online {
            self.schedule();
        }
    }

    pub fn update_concurrency(&self, concurrency: usize) {
        self.lock().concurrency = concurrency.max(1);
        self.schedule();
    }

    /// Cancels the pending, waiting or running job for `key`. Returns whether
    /// anything matched. A running job only sees its token.
    pub fn cancel_by_key(&self, key: &str) -> bool {
        let (removed, matched, snapshot) = {
            let mut state = self.lock();
            let removed = state.remove_pending_key(key);
            let mut matched = removed.is_some();
            if let Some(waiting) = state.retrying.get(key) {
                waiting.cancel.cancel();
                matched = true;
            }
            for running in state.running.values().filter(|job| job.dedup_key == key) {
                running.cancel.cancel();
                matched = true;
            }
            (removed, matched, state.snapshot())
        };
        if let Some(job) = removed {
            job.cancel.cancel();
            self.emit(QueueEvent::JobCancelled(job.summary()));
            self.publish(snapshot);
        }
        matched
    }

    /// Cancels every job the queue knows about.
    pub fn cancel_all(&self) {
        let (removed, snapshot) = {
            let mut state = self.lock();
            state.pending_keys.clear();
            let removed: Vec<TransferJob> =
                std::mem::take(&mut state.pending).into_values().collect();
            for waiting in state.retrying.values() {
                waiting.cancel.cancel();
            }
            for running in state.running.values() {
                running.cancel.cancel();
            }
            (removed, state.snapshot())
        };
        for job in &removed {
            job.cancel.cancel();
            self.emit(QueueEvent::JobCancelled(job.summary()));
        }
        self.publish(snapshot);
    }

    /// Resolves once nothing is pending, waiting or running.
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.snapshot.subscribe();
        let _ = rx.wait_for(|snapshot| snapshot.total == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::job::JobKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_queue(concurrency: usize) -> TransferQueue {
        TransferQueue::with_backoff(
            concurrency,
            Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
        )
    }

    fn gated_job(remote: &str, gate: Arc<Notify>, log: Arc<Mutex<Vec<String>>>) -> TransferJob {
        let name = remote.to_string();
        TransferJob::new(JobKind::Upload, remote, move |_| {
            let gate = Arc::clone(&gate);
            let log = Arc::clone(&log);
            let name = name.clone();
            async move {
                gate.notified().await;
                log.lock().unwrap().push(name);
                Ok(())
            }
        })
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<QueueEvent>, mut pred: F) -> QueueEvent
    where
        F: FnMut(&QueueEvent) -> bool,
    {
        timeout(WAIT, async {
            loop {
                let event = rx.recv().await.expect("event stream");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for queue event")
    }

    #[tokio::test]
    async fn later_job_with_same_key_replaces_pending_one() {
        let queue = fast_queue(1);
        queue.set_online(false);
        let mut rx = queue.subscribe();
        let ran = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let ran = Arc::clone(&ran);
            TransferJob::new(JobKind::Upload, "/r/a", move |_| {
                let ran = Arc::clone(&ran);
                async move {
                    ran.lock().unwrap().push("first");
                    Ok(())
                }
            })
        };
        let second = {
            let ran = Arc::clone(&ran);
            TransferJob::new(JobKind::Upload, "/r/a", move |_| {
                let ran = Arc::clone(&ran);
                async move {
                    ran.lock().unwrap().push("second");
                    Ok(())
                }
            })
        };
        let first_id = queue.enqueue(first);
        let second_id = queue.enqueue(second);
        assert_eq!(queue.snapshot().pending, 1);

        let cancelled = next_matching(&mut rx, |e| matches!(e, QueueEvent::JobCancelled(_))).await;
        match cancelled {
            QueueEvent::JobCancelled(job) => assert_eq!(job.id, first_id),
            other => panic!("unexpected event {other:?}"),
        }

        queue.set_online(true);
        let completed =
            next_matching(&mut rx, |e| matches!(e, QueueEvent::JobCompleted(_))).await;
        match completed {
            QueueEvent::JobCompleted(job) => assert_eq!(job.id, second_id),
            other => panic!("unexpected event {other:?}"),
        }
        queue.wait_idle().await;
        assert_eq!(*ran.lock().unwrap(), vec!["second"]);
    }

    #[tokio::test]
    async fn dispatches_by_priority_then_enqueue_order() {
        let queue = fast_queue(1);
        queue.set_online(false);
        let gate = Arc::new(Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        queue.enqueue(gated_job("/low", Arc::clone(&gate), Arc::clone(&log)).with_priority(Priority::Low));
        queue.enqueue(gated_job("/n1", Arc::clone(&gate), Arc::clone(&log)));
        queue.enqueue(gated_job("/high", Arc::clone(&gate), Arc::clone(&log)).with_priority(Priority::High));
        queue.enqueue(gated_job("/n2", Arc::clone(&gate), Arc::clone(&log)));

        queue.set_online(true);
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            gate.notify_one();
        }
        timeout(WAIT, queue.wait_idle()).await.expect("drained");
        assert_eq!(*log.lock().unwrap(), vec!["/high", "/n1", "/n2", "/low"]);
    }

    #[tokio::test]
    async fn running_count_respects_concurrency_bound() {
        let queue = fast_queue(2);
        queue.set_online(false);
        let gate = Arc::new(Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        for n in 0..5 {
            queue.enqueue(gated_job(&format!("/f{n}"), Arc::clone(&gate), Arc::clone(&log)));
        }
        queue.set_online(true);

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.inflight, 2);
        assert_eq!(snapshot.pending, 3);

        gate.notify_one();
        let mut rx = queue.shared.snapshot.subscribe();
        timeout(WAIT, rx.wait_for(|s| s.pending == 2)).await.expect("admitted").ok();
        assert_eq!(queue.snapshot().inflight, 2);

        for _ in 0..4 {
            gate.notify_one();
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(queue.snapshot().inflight <= 2);
        }
        timeout(WAIT, queue.wait_idle()).await.expect("drained");
        assert_eq!(log.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn failing_job_is_attempted_max_retries_plus_one_times() {
        let queue = fast_queue(1);
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut rx = queue.subscribe();
        let job = {
            let attempts = Arc::clone(&attempts);
            TransferJob::new(JobKind::Upload, "/r/broken", move |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(JobError::Transfer("disk full".into())) }
            })
            .with_max_retries(3)
        };
        queue.enqueue(job);

        let failed = next_matching(&mut rx, |e| matches!(e, QueueEvent::JobFailed { .. })).await;
        match failed {
            QueueEvent::JobFailed { job, error } => {
                assert_eq!(job.retry_count, 3);
                assert_eq!(error, JobError::Transfer("disk full".into()));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        timeout(WAIT, queue.wait_idle()).await.expect("drained");
    }

    #[tokio::test]
    async fn flaky_job_completes_after_retries() {
        let queue = fast_queue(1);
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut rx = queue.subscribe();
        let job = {
            let attempts = Arc::clone(&attempts);
            TransferJob::new(JobKind::Download, "/r/flaky", move |_| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(JobError::Timeout(Duration::from_millis(1)))
                    } else {
                        Ok(())
                    }
                }
            })
            .with_max_retries(3)
        };
        queue.enqueue(job);

        let mut retries = 0;
        loop {
            match next_matching(&mut rx, |_| true).await {
                QueueEvent::JobRetry { attempt, .. } => {
                    retries += 1;
                    assert_eq!(attempt, retries);
                }
                QueueEvent::JobCompleted(_) => break,
                QueueEvent::JobFailed { .. } => panic!("job should not fail"),
                _ => {}
            }
        }
        assert_eq!(retries, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn offline_queue_holds_jobs_until_online() {
        let queue = fast_queue(2);
        queue.set_online(false);
        let gate = Arc::new(Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.enqueue(gated_job("/a", Arc::clone(&gate), Arc::clone(&log)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.snapshot().inflight, 0);
        assert_eq!(queue.snapshot().pending, 1);

        queue.set_online(true);
        assert_eq!(queue.snapshot().inflight, 1);
        gate.notify_one();
        timeout(WAIT, queue.wait_idle()).await.expect("drained");
    }

    #[tokio::test]
    async fn cancel_by_key_removes_pending_job() {
        let queue = fast_queue(1);
        queue.set_online(false);
        let mut rx = queue.subscribe();
        let job = TransferJob::new(JobKind::Delete, "/r/gone", |_| async { Ok(()) });
        let key = job.dedup_key.clone();
        queue.enqueue(job);

        assert!(queue.cancel_by_key(&key));
        assert!(!queue.cancel_by_key("DELETE:/r/other"));
        next_matching(&mut rx, |e| matches!(e, QueueEvent::JobCancelled(_))).await;
        assert_eq!(queue.snapshot().total, 0);
    }

    #[tokio::test]
    async fn same_key_never_runs_twice_at_once() {
        let queue = fast_queue(4);
        let gate = Arc::new(Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.enqueue(gated_job("/same", Arc::clone(&gate), Arc::clone(&log)));
        queue.enqueue(gated_job("/same", Arc::clone(&gate), Arc::clone(&log)));

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.inflight, 1);
        assert_eq!(snapshot.pending, 1);

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();
        timeout(WAIT, queue.wait_idle()).await.expect("drained");
        assert_eq!(log.lock().unwrap().len(), 2);
    }
}
