//! The document store.
//!
//! Documents live in a prolly tree keyed by id. Every write adds an event to the merkle
//! clock that records the tree root after the write, so replicas that exchange commits
//! converge on the same documents. Secondary indexes are kept in a second blockstore named
//! `<name>-idx`.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use ember_base::{Block, Link, MemoryBlockstore, Overlay};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tracing::{debug, instrument};

pub mod apply_queue;
pub mod clock;
pub mod helpers;
pub mod tree;

pub use self::{
    clock::{CrdtClock, WatchId},
    helpers::{ChangesOptions, DocUpdate},
};
use self::{
    helpers::{changes_since, do_compact, load_doc_value},
    tree::{apply_ops, resolve_tree, DocTree},
};
use crate::{
    blockstore::{Blockstore, CompactFn, CompactionFetcher},
    config::DatabaseOptions,
    error::{Error, Result},
    gateway::Unsubscribe,
    indexer::{Index, IndexDefinition, IndexRegistry, IndexTransactionMeta},
    types::{ClockHead, CommitOpts, CrdtMeta, FileMeta, GENESIS_KEY},
};

/// Documents read at a head.
#[derive(Debug, Clone, PartialEq)]
pub struct DocsResponse {
    pub rows: Vec<DocUpdate>,
    pub head: ClockHead,
}

/// Outcome of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkResponse {
    pub head: ClockHead,
}

/// A database: documents, their clock and their indexes.
#[derive(Clone)]
pub struct Crdt {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    clock: CrdtClock,
    index_blockstore: Blockstore<IndexTransactionMeta>,
    indexes: Arc<Mutex<IndexRegistry>>,
    subscriptions: Mutex<Vec<Unsubscribe>>,
}

impl fmt::Debug for Crdt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crdt")
            .field("name", &self.inner.name)
            .field("clock", &self.inner.clock)
            .finish_non_exhaustive()
    }
}

impl Crdt {
    /// Opens the database described by `options` and merges its latest local and remote
    /// commits.
    #[instrument(skip_all, fields(name = %options.name))]
    pub async fn open(options: DatabaseOptions) -> Result<Self> {
        let head: Arc<RwLock<ClockHead>> = Default::default();
        let compact_head = head.clone();
        let compact_fn: CompactFn<CrdtMeta> =
            Arc::new(move |fetcher: CompactionFetcher<CrdtMeta>| {
                let head = compact_head.read().clone();
                async move {
                    do_compact(&fetcher, &head).await?;
                    Ok::<_, Error>(CrdtMeta { head })
                }
                .boxed()
            });
        let blockstore = Blockstore::open(&options, &options.name, Some(compact_fn)).await?;
        let clock = CrdtClock::new(blockstore.clone(), head);
        let weak = clock.downgrade();
        blockstore.loader().set_apply_meta(Arc::new(move |meta: CrdtMeta| {
            let clock = weak.upgrade();
            async move {
                match clock {
                    Some(clock) => clock.apply_head(meta.head, Vec::new(), None).await,
                    None => Ok(()),
                }
            }
            .boxed()
        }));

        let indexes: Arc<Mutex<IndexRegistry>> = Default::default();
        let index_blockstore = Blockstore::<IndexTransactionMeta>::open(
            &options,
            &format!("{}-idx", options.name),
            None,
        )
        .await?;
        let registry = indexes.clone();
        index_blockstore
            .loader()
            .set_apply_meta(Arc::new(move |meta: IndexTransactionMeta| {
                registry.lock().apply_meta(meta);
                async { Ok::<_, Error>(()) }.boxed()
            }));
        let registry = indexes.clone();
        clock.on_zoom(move || registry.lock().reset());

        blockstore.ready().await?;
        index_blockstore.ready().await?;
        let mut subscriptions = Vec::new();
        subscriptions.extend(blockstore.loader().remote_meta_subscription().await?);
        subscriptions.extend(index_blockstore.loader().remote_meta_subscription().await?);
        debug!(head = ?clock.head(), "opened");

        Ok(Self {
            inner: Arc::new(Inner {
                name: options.name,
                clock,
                index_blockstore,
                indexes,
                subscriptions: Mutex::new(subscriptions),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn clock(&self) -> &CrdtClock {
        &self.inner.clock
    }

    pub fn head(&self) -> ClockHead {
        self.inner.clock.head()
    }

    /// The blockstore of the documents.
    pub fn blockstore(&self) -> &Blockstore<CrdtMeta> {
        self.inner.clock.blockstore()
    }

    /// The blockstore of the indexes.
    pub fn index_blockstore(&self) -> &Blockstore<IndexTransactionMeta> {
        &self.inner.index_blockstore
    }

    pub(crate) fn index_registry(&self) -> &Arc<Mutex<IndexRegistry>> {
        &self.inner.indexes
    }

    /// Writes `updates` as one event and waits until the clock applied it.
    ///
    /// The very first write of a database is preceded by the genesis document.
    #[instrument(skip_all, fields(name = %self.inner.name, updates = updates.len()))]
    pub async fn bulk(&self, updates: Vec<DocUpdate>) -> Result<BulkResponse> {
        let clock = &self.inner.clock;
        if updates.is_empty() {
            return Ok(BulkResponse { head: clock.head() });
        }
        let mut prev_head = clock.head();
        if prev_head.is_empty() {
            let genesis = DocUpdate::put(GENESIS_KEY, json!({ "_id": GENESIS_KEY }));
            let head = self.write(Vec::new(), vec![genesis.clone()]).await?;
            clock.apply_head(head, Vec::new(), Some(vec![genesis])).await?;
            prev_head = clock.head();
        }
        let head = self.write(prev_head.clone(), updates.clone()).await?;
        clock
            .apply_head(head.clone(), prev_head, Some(updates))
            .await?;
        Ok(BulkResponse { head })
    }

    async fn write(&self, prev_head: ClockHead, updates: Vec<DocUpdate>) -> Result<ClockHead> {
        let result = self
            .blockstore()
            .transaction(
                |tx| async move {
                    let mut ops = Vec::with_capacity(updates.len());
                    for update in &updates {
                        let link = tx.put_value(&update.to_value())?;
                        ops.push((update.id.clone(), link));
                    }
                    let applied = apply_ops(&tx, &prev_head, ops).await?;
                    for block in applied.additions {
                        tx.put(block);
                    }
                    tx.put(applied.event);
                    Ok(CrdtMeta { head: applied.head })
                },
                CommitOpts::default(),
            )
            .await?;
        Ok(result.meta.head)
    }

    /// The document tree at `head` and the blocks created to resolve it.
    async fn tree_at(&self, head: &[Link]) -> Result<(DocTree, MemoryBlockstore)> {
        let resolved = resolve_tree(self.blockstore(), head).await?;
        let local = MemoryBlockstore::new();
        for block in resolved.additions {
            local.put_block(block);
        }
        Ok((resolved.tree, local))
    }

    /// The current value of document `id`. Deleted documents read as `None`.
    pub async fn get(&self, id: &str) -> Result<Option<Value>> {
        let (tree, local) = self.tree_at(&self.head()).await?;
        let overlay = Overlay::new(&local, self.blockstore());
        let Some(link) = tree.get(&overlay, &id.to_string()).await? else {
            return Ok(None);
        };
        let value = load_doc_value(&overlay, &link).await?;
        Ok(if value.del { None } else { value.doc })
    }

    /// Every live document in id order.
    pub async fn all_docs(&self) -> Result<DocsResponse> {
        let head = self.head();
        let (tree, local) = self.tree_at(&head).await?;
        let overlay = Overlay::new(&local, self.blockstore());
        let rows = helpers::all_docs(&overlay, &tree).await?;
        Ok(DocsResponse { rows, head })
    }

    /// The latest change of every document written after `since`, oldest first.
    pub async fn changes(&self, since: &[Link], opts: ChangesOptions) -> Result<DocsResponse> {
        let head = self.head();
        let rows = changes_since(self.blockstore(), &head, since, opts).await?;
        Ok(DocsResponse { rows, head })
    }

    /// Rewrites the commit history into a single commit holding the current state.
    pub async fn compact(&self) -> Result<()> {
        self.blockstore().compact().await
    }

    /// The clock as a Graphviz digraph.
    pub async fn vis(&self) -> Result<String> {
        let lines = crate::clock::vis(self.blockstore(), &self.head()).await?;
        Ok(lines.join("\n"))
    }

    /// Stores a file outside the document tree.
    pub async fn put_file(&self, data: Bytes, public: bool) -> Result<FileMeta> {
        let block = Block::from_raw(data);
        let cid = block.link;
        let size = block.data.len() as u64;
        let public = public || self.blockstore().loader().opts().public;
        let car = self
            .blockstore()
            .loader()
            .commit_files(vec![block], cid, public)
            .await?;
        Ok(FileMeta {
            cid,
            car,
            size,
            public,
        })
    }

    pub async fn get_file(&self, meta: &FileMeta) -> Result<Bytes> {
        let car = self.blockstore().loader().load_file_car(meta.car).await?;
        let block = car
            .blocks
            .get_sync(&meta.cid)
            .ok_or(Error::MissingBlock(meta.cid))?;
        Ok(block.data)
    }

    /// Defines an index, or returns the existing index of the same name.
    pub fn index(&self, definition: IndexDefinition) -> Index {
        let state = self.inner.indexes.lock().register(definition);
        Index::new(self.clone(), state)
    }

    /// Ends remote subscriptions and closes the stores.
    pub async fn close(&self) -> Result<()> {
        let subscriptions = std::mem::take(&mut *self.inner.subscriptions.lock());
        drop(subscriptions);
        self.blockstore().close().await?;
        self.inner.index_blockstore.close().await
    }

    /// Removes all local data of the database and its indexes.
    pub async fn destroy(&self) -> Result<()> {
        let subscriptions = std::mem::take(&mut *self.inner.subscriptions.lock());
        drop(subscriptions);
        self.blockstore().destroy().await?;
        self.inner.index_blockstore.destroy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(name: &str) -> anyhow::Result<Crdt> {
        Ok(Crdt::open(DatabaseOptions::memory(name)?).await?)
    }

    #[tokio::test]
    async fn first_write_adds_genesis() -> anyhow::Result<()> {
        let crdt = open("genesis").await?;
        assert!(crdt.head().is_empty());
        let res = crdt.bulk(vec![DocUpdate::put("a", json!({"n": 1}))]).await?;
        assert_eq!(crdt.head(), res.head);
        assert_eq!(crdt.get(GENESIS_KEY).await?, Some(json!({"_id": GENESIS_KEY})));

        let all = crdt.all_docs().await?;
        assert_eq!(all.rows.len(), 1);
        assert_eq!(all.rows[0].id, "a");
        // genesis never shows up in change feeds
        let changes = crdt.changes(&[], Default::default()).await?;
        assert_eq!(changes.rows.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn empty_bulk_writes_nothing() -> anyhow::Result<()> {
        let crdt = open("empty").await?;
        let res = crdt.bulk(Vec::new()).await?;
        assert!(res.head.is_empty());
        assert_eq!(crdt.blockstore().loader().car_log_len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn files_round_trip() -> anyhow::Result<()> {
        let crdt = open("files").await?;
        let data = Bytes::from_static(b"attachment body");
        let meta = crdt.put_file(data.clone(), false).await?;
        assert_eq!(meta.size, data.len() as u64);
        assert!(!meta.public);
        assert_eq!(crdt.get_file(&meta).await?, data);
        // without a remote the upload stays queued
        let queued = crdt.blockstore().loader().wal().state().file_operations;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].cid, meta.car);
        Ok(())
    }

    #[tokio::test]
    async fn vis_renders_the_clock() -> anyhow::Result<()> {
        let crdt = open("vis").await?;
        crdt.bulk(vec![DocUpdate::put("a", json!(1))]).await?;
        let dot = crdt.vis().await?;
        assert!(dot.starts_with("digraph clock {"));
        assert_eq!(dot.matches("shape=oval").count(), 2);
        Ok(())
    }
}
