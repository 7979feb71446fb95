//! The current head of the document clock and its watchers.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Weak},
};

use ember_base::{BlockFetcher, Link};
use futures::{FutureExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, instrument, warn};

use super::{
    apply_queue::{ApplyHeadBatch, ApplyHeadTask, ApplyOutcome, HeadApplyQueue},
    helpers::{changes_since, DocUpdate},
    tree::resolve_tree,
};
use crate::{
    blockstore::Blockstore,
    clock::advance,
    error::{Error, Result},
    types::{same_head, sort_head, ClockHead, CommitOpts, CrdtMeta, GENESIS_KEY},
};

pub type TickFn = Arc<dyn Fn(&[DocUpdate]) + Send + Sync>;
pub type TockFn = Arc<dyn Fn() + Send + Sync>;

/// Handle of a registered watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WatchId(u64);

#[derive(Default)]
struct Watchers {
    next_id: u64,
    tick: BTreeMap<WatchId, TickFn>,
    tock: BTreeMap<WatchId, TockFn>,
    zoom: BTreeMap<WatchId, TockFn>,
}

impl Watchers {
    fn next(&mut self) -> WatchId {
        self.next_id += 1;
        WatchId(self.next_id)
    }
}

/// Owns the head of the document clock and merges new heads into it.
#[derive(Clone)]
pub struct CrdtClock {
    inner: Arc<Inner>,
}

/// A clock reference that does not keep the clock alive.
#[derive(Clone)]
pub struct WeakClock(Weak<Inner>);

impl WeakClock {
    pub fn upgrade(&self) -> Option<CrdtClock> {
        self.0.upgrade().map(|inner| CrdtClock { inner })
    }
}

struct Inner {
    head: Arc<RwLock<ClockHead>>,
    blockstore: Blockstore<CrdtMeta>,
    queue: HeadApplyQueue,
    watchers: Mutex<Watchers>,
}

impl fmt::Debug for CrdtClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrdtClock")
            .field("head", &*self.inner.head.read())
            .field("queue", &self.inner.queue)
            .finish()
    }
}

impl CrdtClock {
    /// A clock over `blockstore` whose head lives in `head`.
    pub fn new(blockstore: Blockstore<CrdtMeta>, head: Arc<RwLock<ClockHead>>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let queue = HeadApplyQueue::new(Arc::new(
                move |new_head: ClockHead, prev_head: ClockHead, local_updates: bool| {
                    let clock = WeakClock(weak.clone()).upgrade();
                    async move {
                        match clock {
                            Some(clock) => {
                                clock
                                    .int_apply_head(new_head, prev_head, local_updates)
                                    .await
                            }
                            None => Err(Error::Consistency("clock was dropped".to_string())),
                        }
                    }
                    .boxed()
                },
            ));
            Inner {
                head,
                blockstore,
                queue,
                watchers: Default::default(),
            }
        });
        Self { inner }
    }

    pub fn downgrade(&self) -> WeakClock {
        WeakClock(Arc::downgrade(&self.inner))
    }

    pub fn head(&self) -> ClockHead {
        self.inner.head.read().clone()
    }

    pub fn blockstore(&self) -> &Blockstore<CrdtMeta> {
        &self.inner.blockstore
    }

    pub fn queue(&self) -> &HeadApplyQueue {
        &self.inner.queue
    }

    fn set_head(&self, head: ClockHead) {
        *self.inner.head.write() = head;
    }

    /// Called with the updates of every applied batch.
    pub fn on_tick(&self, f: impl Fn(&[DocUpdate]) + Send + Sync + 'static) -> WatchId {
        let mut watchers = self.inner.watchers.lock();
        let id = watchers.next();
        watchers.tick.insert(id, Arc::new(f));
        id
    }

    /// Called after every applied batch.
    pub fn on_tock(&self, f: impl Fn() + Send + Sync + 'static) -> WatchId {
        let mut watchers = self.inner.watchers.lock();
        let id = watchers.next();
        watchers.tock.insert(id, Arc::new(f));
        id
    }

    /// Called when the head moved by merging concurrent history.
    pub fn on_zoom(&self, f: impl Fn() + Send + Sync + 'static) -> WatchId {
        let mut watchers = self.inner.watchers.lock();
        let id = watchers.next();
        watchers.zoom.insert(id, Arc::new(f));
        id
    }

    pub fn unwatch(&self, id: WatchId) {
        let mut watchers = self.inner.watchers.lock();
        watchers.tick.remove(&id);
        watchers.tock.remove(&id);
        watchers.zoom.remove(&id);
    }

    /// Merges `new_head` into the clock and waits until it was applied.
    ///
    /// `prev_head` is the head the new head was written on, and `updates` the local writes
    /// that produced it.
    pub async fn apply_head(
        &self,
        new_head: ClockHead,
        prev_head: ClockHead,
        updates: Option<Vec<DocUpdate>>,
    ) -> Result<()> {
        let pushed = self.inner.queue.push(ApplyHeadTask {
            new_head,
            prev_head: prev_head.clone(),
            updates,
        });
        let mut done = pushed.done;
        let mut batches = pushed.batches;
        loop {
            while let Some(batch) = batches.next().await {
                match batch {
                    Ok(batch) => self.process_updates(batch, &prev_head).await?,
                    // the failed task reports to its own caller
                    Err(err) => debug!("apply batch failed: {err}"),
                }
            }

            let idle = self.inner.queue.idle();
            tokio::pin!(idle);
            idle.as_mut().enable();
            match done.try_recv() {
                Ok(result) => return result.map_err(Error::from),
                Err(TryRecvError::Closed) => {
                    return Err(Error::Consistency("head task was dropped".to_string()))
                }
                Err(TryRecvError::Empty) => {}
            }
            if !self.inner.queue.is_running() {
                batches = self.inner.queue.drain();
                continue;
            }
            tokio::select! {
                result = &mut done => {
                    return match result {
                        Ok(result) => result.map_err(Error::from),
                        Err(_) => Err(Error::Consistency("head task was dropped".to_string())),
                    };
                }
                _ = idle => {
                    batches = self.inner.queue.drain();
                }
            }
        }
    }

    async fn process_updates(&self, batch: ApplyHeadBatch, prev_head: &[Link]) -> Result<()> {
        let (tick, tock, zoom) = {
            let watchers = self.inner.watchers.lock();
            (
                watchers.tick.values().cloned().collect::<Vec<_>>(),
                watchers.tock.values().cloned().collect::<Vec<_>>(),
                watchers.zoom.values().cloned().collect::<Vec<_>>(),
            )
        };
        let mut updates = batch.updates;
        if !tick.is_empty() && !batch.all {
            updates = changes_since(
                &self.inner.blockstore,
                &self.head(),
                prev_head,
                Default::default(),
            )
            .await?;
        }
        if batch.merged {
            for f in &zoom {
                f();
            }
        }
        for f in &tock {
            f();
        }
        updates.retain(|update| update.id != GENESIS_KEY);
        if !updates.is_empty() {
            for f in &tick {
                f(&updates);
            }
        }
        Ok(())
    }

    /// Applies one head. Runs inside the apply queue only.
    #[instrument(skip_all, fields(heads = new_head.len()))]
    pub(crate) async fn int_apply_head(
        &self,
        new_head: ClockHead,
        prev_head: ClockHead,
        local_updates: bool,
    ) -> Result<ApplyOutcome> {
        let current = self.head();
        let new_head = sort_head(new_head);
        if same_head(&current, &new_head) {
            return Ok(ApplyOutcome::default());
        }
        if same_head(&current, &prev_head) {
            self.set_head(new_head);
            return Ok(ApplyOutcome::default());
        }

        for link in &new_head {
            if self.inner.blockstore.get(link).await?.is_none() {
                return Err(Error::MissingBlock(*link));
            }
        }

        let opts = CommitOpts {
            no_loader: !local_updates,
            ..Default::default()
        };
        let result = self
            .inner
            .blockstore
            .transaction(
                |tx| async move {
                    let mut head = current;
                    for link in &new_head {
                        match advance(&tx, &head, *link).await {
                            Ok(next) => head = next,
                            Err(err) => warn!(%link, "skipping head that cannot be advanced: {err:#}"),
                        }
                    }
                    let resolved = resolve_tree(&tx, &head).await?;
                    for block in resolved.additions {
                        tx.put(block);
                    }
                    Ok(CrdtMeta { head })
                },
                opts,
            )
            .await?;
        debug!(head = ?result.meta.head, "merged head");
        self.set_head(result.meta.head);
        Ok(ApplyOutcome { merged: true })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ember_base::Block;
    use serde_json::json;

    use super::*;
    use crate::{config::DatabaseOptions, crdt::tree::apply_ops};

    async fn clock(name: &str) -> anyhow::Result<CrdtClock> {
        let options = DatabaseOptions::memory(name)?;
        let blockstore = Blockstore::open(&options, name, None).await?;
        Ok(CrdtClock::new(blockstore, Default::default()))
    }

    /// Commits one write on top of `head` and returns the new head.
    async fn write(clock: &CrdtClock, head: &[Link], id: &str) -> anyhow::Result<ClockHead> {
        let head = head.to_vec();
        let update = DocUpdate::put(id, json!({"id": id}));
        let result = clock
            .blockstore()
            .transaction(
                |tx| async move {
                    let value = tx.put_value(&update.to_value())?;
                    let applied = apply_ops(&tx, &head, vec![(update.id.clone(), value)]).await?;
                    for block in applied.additions {
                        tx.put(block);
                    }
                    tx.put(applied.event);
                    Ok(CrdtMeta { head: applied.head })
                },
                Default::default(),
            )
            .await?;
        Ok(result.meta.head)
    }

    #[tokio::test]
    async fn same_head_is_a_no_op_and_prev_head_fast_forwards() -> anyhow::Result<()> {
        let clock = clock("fast").await?;
        let tocks = Arc::new(AtomicUsize::new(0));
        let counter = tocks.clone();
        clock.on_tock(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let h1 = write(&clock, &[], "a").await?;
        let log_len = clock.blockstore().loader().car_log_len();
        // the previous head is the current one, so the new head is taken as is
        clock.apply_head(h1.clone(), Vec::new(), Some(Vec::new())).await?;
        assert_eq!(clock.head(), h1);
        assert_eq!(clock.blockstore().loader().car_log_len(), log_len);

        clock.apply_head(h1.clone(), Vec::new(), None).await?;
        assert_eq!(clock.head(), h1);
        assert_eq!(clock.blockstore().loader().car_log_len(), log_len);
        assert_eq!(tocks.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_heads_merge_and_zoom() -> anyhow::Result<()> {
        let clock = clock("merge").await?;
        let zooms = Arc::new(AtomicUsize::new(0));
        let counter = zooms.clone();
        clock.on_zoom(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let sink = ticks.clone();
        clock.on_tick(move |updates| {
            sink.lock().extend(updates.iter().map(|u| u.id.clone()));
        });

        let base = write(&clock, &[], "base").await?;
        clock.apply_head(base.clone(), Vec::new(), None).await?;
        let left = write(&clock, &base, "left").await?;
        let right = write(&clock, &base, "right").await?;
        clock.apply_head(left.clone(), base.clone(), None).await?;
        assert_eq!(zooms.load(Ordering::SeqCst), 0);

        clock.apply_head(right.clone(), base.clone(), None).await?;
        assert_eq!(zooms.load(Ordering::SeqCst), 1);
        assert!(same_head(&clock.head(), &[left[0], right[0]]));
        // merged heads recompute their updates from the clock
        assert!(ticks.lock().contains(&"right".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn missing_blocks_leave_the_head_alone() -> anyhow::Result<()> {
        let clock = clock("missing").await?;
        let h1 = write(&clock, &[], "a").await?;
        clock.apply_head(h1.clone(), Vec::new(), None).await?;

        let unknown = Block::encode("never stored")?.link;
        let res = clock.apply_head(vec![unknown], Vec::new(), None).await;
        assert!(matches!(res, Err(Error::MissingBlock(link)) if link == unknown));
        assert_eq!(clock.head(), h1);

        // the queue keeps working afterwards
        let h2 = write(&clock, &h1, "b").await?;
        clock.apply_head(h2.clone(), h1, None).await?;
        assert_eq!(clock.head(), h2);
        Ok(())
    }
}
