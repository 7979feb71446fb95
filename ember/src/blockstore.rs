//! Transactional block storage over the committed history of a [`Loader`].

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use ember_base::{Block, BlockFetcher, Link, MemoryBlockstore};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error_span, instrument, warn, Instrument};

use crate::{
    config::DatabaseOptions,
    error::{Error, Result},
    loader::Loader,
    store::{RemoteStores, Stores},
    types::{CarGroup, CommitOpts, TxMeta},
};

/// Produces the meta of a compaction commit. Every block it reads through the fetcher is
/// kept by the compaction.
pub type CompactFn<M> =
    Arc<dyn Fn(CompactionFetcher<M>) -> BoxFuture<'static, Result<M>> + Send + Sync>;

/// Outcome of a committed transaction.
#[derive(Debug, Clone)]
pub struct TransactionResult<M> {
    pub meta: M,
    pub cars: CarGroup,
}

/// A write overlay over the blockstore. Reads see the transaction's own writes first.
#[derive(Clone)]
pub struct Transaction {
    id: u64,
    local: MemoryBlockstore,
    parent: Arc<dyn BlockFetcher>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("blocks", &self.local.len())
            .finish()
    }
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn put(&self, block: Block) {
        self.local.put_block(block);
    }

    /// Encodes `value` as a block, stores it and returns its link.
    pub fn put_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<Link> {
        let block = Block::encode(value)?;
        let link = block.link;
        self.put(block);
        Ok(link)
    }

    pub async fn get_block(&self, link: &Link) -> Result<Option<Block>> {
        Ok(self.get(link).await?)
    }

    /// Blocks written so far, in insertion order.
    pub fn entries(&self) -> Vec<Block> {
        self.local.entries()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }
}

#[async_trait]
impl BlockFetcher for Transaction {
    async fn get(&self, link: &Link) -> anyhow::Result<Option<Block>> {
        if let Some(block) = self.local.get_sync(link) {
            return Ok(Some(block));
        }
        self.parent.get(link).await
    }
}

/// Blocks of open transactions layered over the loader.
pub struct Blockstore<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Clone for Blockstore<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M> fmt::Debug for Blockstore<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blockstore")
            .field("loader", &self.inner.loader)
            .field("open_transactions", &self.inner.transactions.lock().len())
            .finish_non_exhaustive()
    }
}

struct Inner<M> {
    loader: Loader<M>,
    transactions: Mutex<Vec<Transaction>>,
    next_tx: AtomicU64,
    last_tx_meta: Mutex<Option<M>>,
    compact_fn: Option<CompactFn<M>>,
}

impl<M: TxMeta> Blockstore<M> {
    /// Opens the local and remote stores named `name` and a loader over them.
    pub async fn open(
        options: &DatabaseOptions,
        name: &str,
        compact_fn: Option<CompactFn<M>>,
    ) -> Result<Self> {
        let stores = Stores::open(&options.registry, &options.base_url, name).await?;
        let remote = match &options.remote_url {
            Some(url) => Some(RemoteStores::open(&options.registry, url, name).await?),
            None => None,
        };
        let loader = Loader::open(name, options.blockstore, stores, remote).await?;
        Ok(Self::new(loader, compact_fn))
    }

    pub fn new(loader: Loader<M>, compact_fn: Option<CompactFn<M>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                loader,
                transactions: Default::default(),
                next_tx: AtomicU64::new(0),
                last_tx_meta: Default::default(),
                compact_fn,
            }),
        }
    }

    pub fn loader(&self) -> &Loader<M> {
        &self.inner.loader
    }

    pub fn last_tx_meta(&self) -> Option<M> {
        self.inner.last_tx_meta.lock().clone()
    }

    /// Merges the latest local and remote commits.
    pub async fn ready(&self) -> Result<()> {
        self.inner.loader.ready().await
    }

    /// Opens a transaction whose blocks are visible to readers of this blockstore until it
    /// is closed.
    pub fn open_transaction(&self) -> Transaction {
        let tx = Transaction {
            id: self.inner.next_tx.fetch_add(1, Ordering::Relaxed),
            local: MemoryBlockstore::new(),
            parent: Arc::new(self.clone()),
        };
        self.inner.transactions.lock().push(tx.clone());
        tx
    }

    pub fn close_transaction(&self, tx: &Transaction) {
        self.inner.transactions.lock().retain(|open| open.id != tx.id);
    }

    /// Commits the blocks of `tx` with `meta` through the loader.
    pub async fn commit_transaction(
        &self,
        tx: &Transaction,
        meta: M,
        opts: CommitOpts,
    ) -> Result<TransactionResult<M>> {
        *self.inner.last_tx_meta.lock() = Some(meta.clone());
        let cars = self.inner.loader.commit(tx.entries(), meta.clone(), opts).await?;
        Ok(TransactionResult { meta, cars })
    }

    /// Runs `f` in a new transaction and commits what it wrote with the meta it returns.
    pub async fn transaction<F, Fut>(&self, f: F, opts: CommitOpts) -> Result<TransactionResult<M>>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<M>>,
    {
        let tx = self.open_transaction();
        let result = match f(tx.clone()).await {
            Ok(meta) => self.commit_transaction(&tx, meta, opts).await,
            Err(err) => Err(err),
        };
        self.close_transaction(&tx);
        let result = result?;

        let auto_compact = self.inner.loader.opts().auto_compact;
        if !opts.compact && self.inner.loader.car_log_len() > auto_compact {
            let this = self.clone();
            tokio::spawn(
                async move {
                    if let Err(err) = this.compact().await {
                        warn!("auto compaction failed: {err:#}");
                    }
                }
                .instrument(error_span!("auto_compact", name = %self.inner.loader.name())),
            );
        }
        Ok(result)
    }

    /// Rewrites the car log into a single group holding only the blocks the compaction
    /// function reads.
    ///
    /// Does nothing while another compaction runs or when there is nothing to merge.
    #[instrument(skip_all, fields(name = %self.inner.loader.name()))]
    pub async fn compact(&self) -> Result<()> {
        let loader = &self.inner.loader;
        if loader.car_log_len() < 2 {
            return Ok(());
        }
        let Some(_guard) = loader.start_compaction() else {
            debug!("compaction already running");
            return Ok(());
        };
        let superseded = loader.car_log();
        let fetcher = CompactionFetcher {
            blockstore: self.clone(),
            logged: MemoryBlockstore::new(),
        };
        let meta = match &self.inner.compact_fn {
            Some(compact_fn) => compact_fn(fetcher.clone()).await?,
            None => self.default_compact(&fetcher).await?,
        };
        let blocks = fetcher.logged.entries();
        debug!(
            blocks = blocks.len(),
            groups = superseded.len(),
            "compacting"
        );
        loader.commit_compaction(blocks, meta, superseded).await?;
        Ok(())
    }

    async fn default_compact(&self, fetcher: &CompactionFetcher<M>) -> Result<M> {
        for block in self.inner.loader.entries(true).await? {
            fetcher.log(block);
        }
        self.last_tx_meta()
            .ok_or_else(|| Error::Consistency("no transaction to compact".to_string()))
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.loader.close().await
    }

    pub async fn destroy(&self) -> Result<()> {
        self.inner.loader.destroy().await
    }
}

#[async_trait]
impl<M: TxMeta> BlockFetcher for Blockstore<M> {
    async fn get(&self, link: &Link) -> anyhow::Result<Option<Block>> {
        let open: Vec<MemoryBlockstore> = self
            .inner
            .transactions
            .lock()
            .iter()
            .map(|tx| tx.local.clone())
            .collect();
        if let Some(block) = open.iter().find_map(|local| local.get_sync(link)) {
            return Ok(Some(block));
        }
        Ok(self.inner.loader.get_block(link).await?)
    }
}

/// Reads through a blockstore and records every block it returns.
pub struct CompactionFetcher<M> {
    blockstore: Blockstore<M>,
    logged: MemoryBlockstore,
}

impl<M> Clone for CompactionFetcher<M> {
    fn clone(&self) -> Self {
        Self {
            blockstore: self.blockstore.clone(),
            logged: self.logged.clone(),
        }
    }
}

impl<M> fmt::Debug for CompactionFetcher<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactionFetcher")
            .field("logged", &self.logged.len())
            .finish_non_exhaustive()
    }
}

impl<M> CompactionFetcher<M> {
    /// Keeps `block` without reading it.
    pub fn log(&self, block: Block) {
        self.logged.put_block(block);
    }

    pub fn logged(&self) -> &MemoryBlockstore {
        &self.logged
    }
}

#[async_trait]
impl<M: TxMeta> BlockFetcher for CompactionFetcher<M> {
    async fn get(&self, link: &Link) -> anyhow::Result<Option<Block>> {
        let block = self.blockstore.get(link).await?;
        if let Some(block) = &block {
            self.logged.put_block(block.clone());
        }
        Ok(block)
    }
}
