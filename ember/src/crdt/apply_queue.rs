//! Serializes head merges and coalesces their updates.

use std::{collections::VecDeque, fmt, sync::Arc};

use futures::{future::BoxFuture, stream::BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{futures::Notified, oneshot, Notify};

use super::helpers::DocUpdate;
use crate::{
    error::{Error, Result},
    types::ClockHead,
};

/// A head to merge.
#[derive(Debug, Clone)]
pub struct ApplyHeadTask {
    pub new_head: ClockHead,
    pub prev_head: ClockHead,
    /// The local writes that produced `new_head`, or `None` for merged heads.
    pub updates: Option<Vec<DocUpdate>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// The head moved by merging rather than by fast forward.
    pub merged: bool,
}

/// Updates of one or more applied tasks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyHeadBatch {
    pub updates: Vec<DocUpdate>,
    /// Every task of this batch and every task still queued carries its updates, so
    /// `updates` is complete.
    pub all: bool,
    pub merged: bool,
}

/// Applies one head: `(new_head, prev_head, local_updates)`.
pub type ApplyWorker =
    Arc<dyn Fn(ClockHead, ClockHead, bool) -> BoxFuture<'static, Result<ApplyOutcome>> + Send + Sync>;

type Done = oneshot::Sender<std::result::Result<(), Arc<Error>>>;

/// Result of pushing a task.
pub struct Pushed {
    /// Resolves once the task was applied, by whichever drain picked it up.
    pub done: oneshot::Receiver<std::result::Result<(), Arc<Error>>>,
    /// Drives the queue. Empty when another drain is already running.
    pub batches: BoxStream<'static, Result<ApplyHeadBatch>>,
}

impl fmt::Debug for Pushed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pushed")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

struct Queued {
    task: ApplyHeadTask,
    done: Option<Done>,
}

#[derive(Default)]
struct State {
    tasks: VecDeque<Queued>,
    running: bool,
}

struct Inner {
    state: Mutex<State>,
    worker: ApplyWorker,
    idle: Notify,
}

/// FIFO of head merges with a single consumer at a time.
#[derive(Clone)]
pub struct HeadApplyQueue {
    inner: Arc<Inner>,
}

impl fmt::Debug for HeadApplyQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("HeadApplyQueue")
            .field("size", &state.tasks.len())
            .field("running", &state.running)
            .finish()
    }
}

impl HeadApplyQueue {
    pub fn new(worker: ApplyWorker) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Default::default(),
                worker,
                idle: Notify::new(),
            }),
        }
    }

    /// Number of queued tasks.
    pub fn size(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Resolves when a drain finishes. Must be created before checking the queue state.
    pub fn idle(&self) -> Notified<'_> {
        self.inner.idle.notified()
    }

    pub fn push(&self, task: ApplyHeadTask) -> Pushed {
        let (tx, rx) = oneshot::channel();
        self.inner.state.lock().tasks.push_back(Queued {
            task,
            done: Some(tx),
        });
        Pushed {
            done: rx,
            batches: self.drain(),
        }
    }

    /// A lazy drain of the queue. It ends when the queue is empty or a task fails.
    pub fn drain(&self) -> BoxStream<'static, Result<ApplyHeadBatch>> {
        let drain = Drain {
            inner: self.inner.clone(),
            guard: None,
            batch: Batch::default(),
            finished: false,
        };
        futures::stream::unfold(drain, |mut drain| async move {
            drain.step().await.map(|item| (item, drain))
        })
        .boxed()
    }
}

/// Clears the running flag if a drain is dropped midway.
struct RunningGuard {
    inner: Arc<Inner>,
    armed: bool,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state.lock().running = false;
            self.inner.idle.notify_waiters();
        }
    }
}

struct Batch {
    updates: Vec<DocUpdate>,
    all: bool,
    merged: bool,
}

impl Default for Batch {
    fn default() -> Self {
        Self {
            updates: Vec::new(),
            all: true,
            merged: false,
        }
    }
}

struct Drain {
    inner: Arc<Inner>,
    guard: Option<RunningGuard>,
    batch: Batch,
    finished: bool,
}

impl Drain {
    async fn step(&mut self) -> Option<Result<ApplyHeadBatch>> {
        loop {
            if self.finished {
                return None;
            }
            let queued = {
                let mut state = self.inner.state.lock();
                if self.guard.is_none() {
                    if state.running {
                        self.finished = true;
                        return None;
                    }
                    state.running = true;
                    self.guard = Some(RunningGuard {
                        inner: self.inner.clone(),
                        armed: true,
                    });
                }
                // merges without updates go first, keeping the order otherwise
                state
                    .tasks
                    .make_contiguous()
                    .sort_by_key(|queued| queued.task.updates.is_some());
                match state.tasks.pop_front() {
                    Some(queued) => queued,
                    None => {
                        state.running = false;
                        if let Some(guard) = self.guard.as_mut() {
                            guard.armed = false;
                        }
                        self.finished = true;
                        drop(state);
                        self.inner.idle.notify_waiters();
                        return None;
                    }
                }
            };

            let Queued { task, done } = queued;
            let has_updates = task.updates.is_some();
            match (self.inner.worker)(task.new_head, task.prev_head, has_updates).await {
                Ok(outcome) => {
                    self.batch.merged |= outcome.merged;
                    match task.updates {
                        Some(updates) => self.batch.updates.extend(updates),
                        None => self.batch.all = false,
                    }
                    if let Some(done) = done {
                        done.send(Ok(())).ok();
                    }
                    let (pending_updates, all_pending_have_updates) = {
                        let state = self.inner.state.lock();
                        (
                            state.tasks.iter().any(|q| q.task.updates.is_some()),
                            state.tasks.iter().all(|q| q.task.updates.is_some()),
                        )
                    };
                    if !pending_updates || has_updates {
                        let batch = std::mem::take(&mut self.batch);
                        return Some(Ok(ApplyHeadBatch {
                            updates: batch.updates,
                            all: batch.all && all_pending_have_updates,
                            merged: batch.merged,
                        }));
                    }
                }
                Err(err) => {
                    let err = Arc::new(err);
                    if let Some(done) = done {
                        done.send(Err(err.clone())).ok();
                    }
                    self.finished = true;
                    // releases the running flag
                    self.guard = None;
                    return Some(Err(Error::from(err)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ember_base::{Codec, Link};
    use futures::FutureExt;
    use serde_json::json;

    use super::*;

    fn head(n: u8) -> ClockHead {
        vec![Link::sha256(Codec::DAG_CBOR, &[n])]
    }

    fn recording_worker(calls: Arc<Mutex<Vec<ClockHead>>>, fail_on: Option<ClockHead>) -> ApplyWorker {
        Arc::new(move |new_head: ClockHead, _prev: ClockHead, _local: bool| {
            let calls = calls.clone();
            let fail = fail_on.as_ref() == Some(&new_head);
            async move {
                if fail {
                    return Err(Error::Consistency("worker failed".to_string()));
                }
                calls.lock().push(new_head);
                Ok(ApplyOutcome { merged: false })
            }
            .boxed()
        })
    }

    fn task(n: u8, updates: Option<Vec<DocUpdate>>) -> ApplyHeadTask {
        ApplyHeadTask {
            new_head: head(n),
            prev_head: Vec::new(),
            updates,
        }
    }

    #[tokio::test]
    async fn merges_run_before_local_writes() -> anyhow::Result<()> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let queue = HeadApplyQueue::new(recording_worker(calls.clone(), None));
        let write = DocUpdate::put("a", json!(1));
        let first = queue.push(task(1, Some(vec![write.clone()])));
        let second = queue.push(task(2, None));
        assert_eq!(queue.size(), 2);
        assert!(format!("{first:?}").starts_with("Pushed"));

        let batches: Vec<_> = first.batches.collect().await;
        // the second stream finds the queue drained
        assert!(second.batches.collect::<Vec<_>>().await.is_empty());
        assert_eq!(*calls.lock(), vec![head(2), head(1)]);
        assert_eq!(batches.len(), 1);
        let batch = batches.into_iter().next().unwrap()?;
        assert_eq!(batch.updates, vec![write]);
        assert!(!batch.all, "the merge carried no updates");
        assert!(first.done.await?.is_ok());
        assert!(second.done.await?.is_ok());
        assert_eq!(queue.size(), 0);
        assert!(!queue.is_running());
        Ok(())
    }

    #[tokio::test]
    async fn every_local_write_yields_a_batch() -> anyhow::Result<()> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let queue = HeadApplyQueue::new(recording_worker(calls.clone(), None));
        let pushed = queue.push(task(1, Some(vec![DocUpdate::put("a", json!(1))])));
        queue.push(task(2, Some(vec![DocUpdate::put("b", json!(2))])));
        let batches: Vec<_> = pushed.batches.collect().await;
        assert_eq!(batches.len(), 2);
        for batch in batches {
            let batch = batch?;
            assert!(batch.all);
            assert_eq!(batch.updates.len(), 1);
        }
        Ok(())
    }

    #[tokio::test]
    async fn a_running_drain_picks_up_new_tasks() -> anyhow::Result<()> {
        let counter = Arc::new(AtomicUsize::new(0));
        let hits = counter.clone();
        let queue = HeadApplyQueue::new(Arc::new(move |_: ClockHead, _: ClockHead, _: bool| {
            hits.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::task::yield_now().await;
                Ok::<_, Error>(ApplyOutcome { merged: true })
            }
            .boxed()
        }));
        let mut first = queue.push(task(1, None));
        let next = first.batches.next().await;
        assert!(next.is_some());
        assert!(queue.is_running());

        let second = queue.push(task(2, None));
        assert!(second.batches.collect::<Vec<_>>().await.is_empty());
        let rest: Vec<_> = first.batches.collect().await;
        assert_eq!(rest.len(), 1);
        assert!(rest[0].as_ref().map(|b| b.merged).unwrap_or(false));
        assert!(second.done.await?.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn failures_end_the_drain_and_keep_the_rest() -> anyhow::Result<()> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let queue = HeadApplyQueue::new(recording_worker(calls.clone(), Some(head(1))));
        let failing = queue.push(task(1, None));
        let waiting = queue.push(task(2, Some(Vec::new())));

        let batches: Vec<_> = failing.batches.collect().await;
        assert_eq!(batches.len(), 1);
        assert!(matches!(batches[0], Err(Error::Consistency(_))));
        assert!(failing.done.await?.is_err());
        assert_eq!(queue.size(), 1);
        assert!(!queue.is_running());

        let batches: Vec<_> = queue.drain().collect().await;
        assert_eq!(batches.len(), 1);
        assert!(waiting.done.await?.is_ok());
        assert_eq!(*calls.lock(), vec![head(2)]);
        Ok(())
    }
}
