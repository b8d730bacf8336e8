//! Component F: the scheduler contract (`spec.md` §4.8) and its Tokio
//! binding, grounded in the `tokio::time::timeout` + `oneshot` pairing
//! `services/server`'s websocket handlers already use for per-connection
//! serialization and timeouts (`ws_forwarder.rs`).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::{CoreError, CoreResult};

/// A unit of work posted to the scheduler. Receives `signum`: `0` for a
/// normal run, non-zero if the job was cancelled before it could run
/// (`spec.md` §5: "cancellation propagates via `signum != 0` on job
/// entry").
pub type Job = Box<dyn FnOnce(i32) + Send + 'static>;

/// Opaque job-queue key (`spec.md` §4.8: "group, an opaque pointer").
/// Jobs posted to the same group run serially, in submission order;
/// distinct groups may run concurrently. Cloning shares the same
/// underlying key (the teacher's `ForwarderCommand` reply channels are
/// the closest idiom for "hand out a cheap token that identifies a lane").
#[derive(Clone)]
pub struct GroupToken(Arc<()>);

impl GroupToken {
    #[must_use]
    pub fn new() -> Self {
        GroupToken(Arc::new(()))
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl Default for GroupToken {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for GroupToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for GroupToken {}

/// `spec.md` §4.8's scheduler contract.
pub trait Scheduler: Send + Sync {
    /// Enqueues `job` on `group`'s lane, after `delay`. If `timeout` elapses
    /// before the job starts running, it is invoked with `signum != 0`
    /// instead of being skipped (matching the original's "signaled" path).
    fn post_job(&self, group: GroupToken, delay: Duration, timeout: Duration, job: Job);

    /// Cooperative suspend primitive: blocks the *caller's async task*
    /// (not a worker thread) until `completion` resolves or `timeout`
    /// elapses, whichever comes first.
    fn sched_sync(
        &self,
        timeout: Duration,
        completion: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send>>;
}

/// One lane item: a job plus the bookkeeping needed to decide its
/// `signum` once the lane's single worker actually gets to it.
struct LaneItem {
    delay: Duration,
    timeout: Duration,
    queued_at: Instant,
    job: Job,
}

/// `Scheduler` implementation built on `tokio::task::spawn`. Each group
/// gets its own unbounded channel and a single dedicated worker task
/// draining it — a channel's FIFO delivery to one consumer gives strict
/// submission order for free, which a shared mutex (merely mutual
/// exclusion, not ordering) cannot, matching `SPEC_FULL.md` §4's
/// scheduler binding.
#[derive(Default)]
pub struct TokioScheduler {
    lanes: Mutex<HashMap<usize, mpsc::UnboundedSender<LaneItem>>>,
}

impl TokioScheduler {
    #[must_use]
    pub fn new() -> Self {
        TokioScheduler {
            lanes: Mutex::new(HashMap::new()),
        }
    }

    fn lane_for(&self, group: &GroupToken) -> mpsc::UnboundedSender<LaneItem> {
        self.lanes
            .lock()
            .entry(group.key())
            .or_insert_with(Self::spawn_lane_worker)
            .clone()
    }

    fn spawn_lane_worker() -> mpsc::UnboundedSender<LaneItem> {
        let (tx, mut rx) = mpsc::unbounded_channel::<LaneItem>();
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                if !item.delay.is_zero() {
                    tokio::time::sleep(item.delay).await;
                }
                let signum = if item.queued_at.elapsed() >= item.timeout { 1 } else { 0 };
                (item.job)(signum);
            }
        });
        tx
    }
}

impl Scheduler for TokioScheduler {
    fn post_job(&self, group: GroupToken, delay: Duration, timeout: Duration, job: Job) {
        let lane = self.lane_for(&group);
        let _ = lane.send(LaneItem { delay, timeout, queued_at: Instant::now(), job });
    }

    fn sched_sync(
        &self,
        timeout: Duration,
        completion: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send>> {
        Box::pin(async move {
            tokio::time::timeout(timeout, completion)
                .await
                .map_err(|_| CoreError::Cancelled)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn jobs_on_same_group_run_in_submission_order() {
        let scheduler = TokioScheduler::new();
        let group = GroupToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel::<()>();
        let mut tx = Some(tx);

        for i in 0..3u32 {
            let order = order.clone();
            let last = if i == 2 { tx.take() } else { None };
            scheduler.post_job(group.clone(), Duration::ZERO, Duration::from_secs(5), Box::new(move |_signum| {
                order.lock().push(i);
                if let Some(tx) = last {
                    let _ = tx.send(());
                }
            }));
        }
        let _ = rx.await;
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn submission_order_holds_on_a_multi_threaded_runtime() {
        let scheduler = TokioScheduler::new();
        let group = GroupToken::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel::<()>();
        let mut tx = Some(tx);

        for i in 0..50u32 {
            let order = order.clone();
            let last = if i == 49 { tx.take() } else { None };
            scheduler.post_job(group.clone(), Duration::ZERO, Duration::from_secs(5), Box::new(move |_signum| {
                order.lock().push(i);
                if let Some(tx) = last {
                    let _ = tx.send(());
                }
            }));
        }
        let _ = rx.await;
        assert_eq!(*order.lock(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn distinct_groups_do_not_block_each_other() {
        let scheduler = TokioScheduler::new();
        let hits = Arc::new(AtomicU32::new(0));
        let (tx, rx) = oneshot::channel::<()>();
        let h = hits.clone();
        scheduler.post_job(GroupToken::new(), Duration::ZERO, Duration::from_secs(5), Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        }));
        let _ = rx.await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sched_sync_times_out_when_completion_never_resolves() {
        let scheduler = TokioScheduler::new();
        let never = Box::pin(std::future::pending::<()>());
        let result = scheduler.sched_sync(Duration::from_millis(10), never).await;
        assert_eq!(result, Err(CoreError::Cancelled));
    }

    #[tokio::test]
    async fn sched_sync_succeeds_when_completion_resolves_in_time() {
        let scheduler = TokioScheduler::new();
        let ready = Box::pin(async {});
        let result = scheduler.sched_sync(Duration::from_secs(5), ready).await;
        assert_eq!(result, Ok(()));
    }
}
