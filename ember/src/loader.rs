//! Persistence of committed transactions as CAR files.
//!
//! The [`Loader`] owns the car log of a database. Commits are packed into one or more CAR
//! files, encrypted unless the database is public, written to the data store and queued on
//! the [`RemoteWal`]. Reads resolve blocks through a cache of decoded CARs, falling back to
//! the remote replica when a CAR is not available locally.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock, Weak,
    },
};

use ember_base::{Block, Link, MemoryBlockstore};
use futures::{
    future::{self, BoxFuture, Shared},
    FutureExt, StreamExt,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error_span, instrument, trace, warn, Instrument};

use crate::{
    car::{decode_car, encode_car, split_commit, CarBlocks},
    config::BlockstoreOptions,
    crypto::{decrypt_car, encrypt_car, EncryptionKey},
    error::{Error, Result},
    gateway::Unsubscribe,
    store::{DataStore, RemoteStores, Stores},
    types::{CarGroup, CarHeader, CarLog, CommitOpts, DbMeta, HeaderEnvelope, TxMeta},
    wal::RemoteWal,
};

/// Car groups probed concurrently when resolving a block.
const GROUP_BATCH: usize = 5;
/// CAR files fetched concurrently when prefetching a merged log.
const PREFETCH_CONCURRENCY: usize = 5;

/// Called with the transaction meta of every commit merged from elsewhere.
pub type ApplyMetaFn<M> = Arc<dyn Fn(M) -> BoxFuture<'static, Result<()>> + Send + Sync>;

type CarFuture = Shared<BoxFuture<'static, std::result::Result<Arc<CarBlocks>, Arc<Error>>>>;

/// Owns the car log and moves commits in and out of storage.
pub struct Loader<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Clone for Loader<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M> fmt::Debug for Loader<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("name", &self.inner.name)
            .field("car_log", &self.inner.car_log.read().len())
            .finish_non_exhaustive()
    }
}

struct Inner<M> {
    name: String,
    opts: BlockstoreOptions,
    stores: Stores,
    remote: Option<RemoteStores>,
    car_log: Arc<RwLock<CarLog>>,
    commit_lock: tokio::sync::Mutex<()>,
    car_readers: Mutex<HashMap<Link, CarFuture>>,
    block_cache: MemoryBlockstore,
    seen_compacted: Mutex<HashSet<CarGroup>>,
    seen_meta: Mutex<HashSet<DbMeta>>,
    key: RwLock<Option<EncryptionKey>>,
    compacting: Arc<AtomicBool>,
    wal: RemoteWal,
    apply_meta: OnceLock<ApplyMetaFn<M>>,
}

/// Marks a compaction as running until dropped.
#[derive(Debug)]
pub struct CompactionGuard(Arc<AtomicBool>);

impl Drop for CompactionGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn unique_groups(
    groups: impl IntoIterator<Item = CarGroup>,
    exclude: &HashSet<CarGroup>,
) -> CarLog {
    let mut seen = HashSet::new();
    groups
        .into_iter()
        .filter(|group| !exclude.contains(group) && seen.insert(group.clone()))
        .collect()
}

impl<M: TxMeta> Loader<M> {
    pub async fn open(
        name: impl Into<String>,
        opts: BlockstoreOptions,
        stores: Stores,
        remote: Option<RemoteStores>,
    ) -> Result<Self> {
        let name = name.into();
        let car_log: Arc<RwLock<CarLog>> = Default::default();
        let wal = RemoteWal::open(name.clone(), stores.clone(), remote.clone(), car_log.clone())
            .await?;
        Ok(Self {
            inner: Arc::new(Inner {
                name,
                opts,
                stores,
                remote,
                car_log,
                commit_lock: Default::default(),
                car_readers: Default::default(),
                block_cache: MemoryBlockstore::new(),
                seen_compacted: Default::default(),
                seen_meta: Default::default(),
                key: Default::default(),
                compacting: Default::default(),
                wal,
                apply_meta: OnceLock::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn opts(&self) -> &BlockstoreOptions {
        &self.inner.opts
    }

    pub fn stores(&self) -> &Stores {
        &self.inner.stores
    }

    pub fn remote(&self) -> Option<&RemoteStores> {
        self.inner.remote.as_ref()
    }

    pub fn wal(&self) -> &RemoteWal {
        &self.inner.wal
    }

    /// A copy of the car log, newest first.
    pub fn car_log(&self) -> CarLog {
        self.inner.car_log.read().clone()
    }

    pub fn car_log_len(&self) -> usize {
        self.inner.car_log.read().len()
    }

    pub fn key(&self) -> Option<EncryptionKey> {
        self.inner.key.read().clone()
    }

    /// Installs the hook that applies merged transaction metas. Only the first call wins.
    pub fn set_apply_meta(&self, apply: ApplyMetaFn<M>) -> bool {
        self.inner.apply_meta.set(apply).is_ok()
    }

    /// Adopts the hex encoded `key`. A different key than the current one is rejected.
    pub fn set_key(&self, hex_key: &str) -> Result<()> {
        let key = EncryptionKey::from_hex(hex_key)?;
        let mut current = self.inner.key.write();
        match current.as_ref() {
            Some(existing) if *existing != key => Err(Error::KeyMismatch),
            Some(_) => Ok(()),
            None => {
                *current = Some(key);
                Ok(())
            }
        }
    }

    fn ensure_key(&self) -> EncryptionKey {
        self.inner
            .key
            .write()
            .get_or_insert_with(EncryptionKey::generate)
            .clone()
    }

    /// Marks a compaction as running. Returns `None` when one already is.
    pub fn start_compaction(&self) -> Option<CompactionGuard> {
        self.inner
            .compacting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| CompactionGuard(self.inner.compacting.clone()))
    }

    pub fn is_compacting(&self) -> bool {
        self.inner.compacting.load(Ordering::SeqCst)
    }

    /// Loads the latest local and remote metas and merges them.
    #[instrument(skip_all, fields(name = %self.inner.name))]
    pub async fn ready(&self) -> Result<()> {
        if let Some(meta) = self.inner.stores.meta.load().await? {
            self.handle_db_metas(vec![meta]).await?;
        }
        if let Some(remote) = &self.inner.remote {
            match remote.meta.load().await {
                Ok(Some(meta)) => self.handle_db_metas(vec![meta]).await?,
                Ok(None) => {}
                Err(err) => warn!("remote meta unavailable: {err:#}"),
            }
        }
        Ok(())
    }

    /// Writes `blocks` with `meta` as one commit and returns the new car group.
    #[instrument(skip_all, fields(name = %self.inner.name, blocks = blocks.len()))]
    pub async fn commit(&self, blocks: Vec<Block>, meta: M, opts: CommitOpts) -> Result<CarGroup> {
        self.commit_with(blocks, meta, opts, None).await
    }

    /// Commits a compaction that supersedes the groups of `superseded`.
    ///
    /// Groups committed after the snapshot was taken stay in the log.
    #[instrument(skip_all, fields(name = %self.inner.name, blocks = blocks.len()))]
    pub async fn commit_compaction(
        &self,
        blocks: Vec<Block>,
        meta: M,
        superseded: CarLog,
    ) -> Result<CarGroup> {
        let opts = CommitOpts {
            compact: true,
            no_loader: true,
            public: false,
        };
        self.commit_with(blocks, meta, opts, Some(superseded)).await
    }

    async fn commit_with(
        &self,
        blocks: Vec<Block>,
        meta: M,
        opts: CommitOpts,
        superseded: Option<CarLog>,
    ) -> Result<CarGroup> {
        let _guard = self.inner.commit_lock.lock().await;
        let log = match superseded {
            Some(superseded) if opts.compact => superseded,
            _ => self.car_log(),
        };
        let header = if opts.compact {
            CarHeader {
                cars: Vec::new(),
                compact: log.clone(),
                meta,
            }
        } else {
            CarHeader {
                cars: log.clone(),
                compact: Vec::new(),
                meta,
            }
        };
        let header_block = Block::encode(&HeaderEnvelope { fp: header })?;
        let key = self.commit_key(opts.public);

        let mut group = Vec::new();
        for (root, file_blocks) in split_commit(header_block, blocks.clone(), self.inner.opts.threshold)
        {
            let plain = MemoryBlockstore::new();
            for block in &file_blocks {
                plain.put_block(block.clone());
            }
            let link = self
                .write_car(&self.inner.stores.data, key.as_ref(), root, file_blocks)
                .await?;
            let reader: CarFuture = future::ready(Ok(Arc::new(CarBlocks {
                roots: vec![root],
                blocks: plain,
            })))
            .boxed()
            .shared();
            self.inner.car_readers.lock().insert(link, reader);
            group.push(link);
        }
        for block in blocks {
            self.inner.block_cache.put_block(block);
        }

        let db_meta = DbMeta {
            cars: group.clone(),
            key: self.key().map(|key| key.to_hex()),
        };
        self.inner.seen_meta.lock().insert(db_meta.clone());
        self.inner.wal.enqueue(db_meta.clone(), opts).await?;
        self.inner.stores.meta.save(&db_meta).await?;

        if opts.compact {
            self.finish_compaction(log, group.clone()).await;
        } else {
            self.inner.car_log.write().insert(0, group.clone());
        }
        debug!(cars = group.len(), compact = opts.compact, "committed");
        Ok(group)
    }

    fn commit_key(&self, public: bool) -> Option<EncryptionKey> {
        if self.inner.opts.public || public {
            None
        } else {
            Some(self.ensure_key())
        }
    }

    async fn write_car(
        &self,
        store: &DataStore,
        key: Option<&EncryptionKey>,
        root: Link,
        blocks: Vec<Block>,
    ) -> Result<Link> {
        let (root, blocks) = match key {
            Some(key) => encrypt_car(key, root, &blocks)?,
            None => (root, blocks),
        };
        let car = encode_car(vec![root], &blocks).await?;
        store.save(&car.link, car.bytes).await?;
        Ok(car.link)
    }

    async fn finish_compaction(&self, old_log: CarLog, group: CarGroup) {
        {
            let mut seen = self.inner.seen_compacted.lock();
            seen.extend(old_log.iter().cloned());
            let mut log = self.inner.car_log.write();
            let merged = unique_groups(std::iter::once(group).chain(log.iter().cloned()), &seen);
            *log = merged;
        }

        // The previous compaction is only dropped now, so readers holding the old log
        // still find its CARs.
        let Some(oldest) = old_log.last() else {
            return;
        };
        let header = match self.load_car_header(oldest).await {
            Ok(header) => header,
            Err(err) => {
                warn!("cannot read header of compacted group: {err:#}");
                return;
            }
        };
        for car in header.compact.iter().flatten() {
            self.inner.car_readers.lock().remove(car);
            if let Err(err) = self.inner.stores.data.remove(car).await {
                warn!(%car, "removing compacted car failed: {err:#}");
            }
        }
    }

    /// Writes a file commit to the file store and queues it for upload.
    #[instrument(skip_all, fields(name = %self.inner.name))]
    pub async fn commit_files(&self, blocks: Vec<Block>, root: Link, public: bool) -> Result<Link> {
        let public = self.inner.opts.public || public;
        let key = self.commit_key(public);
        let link = self
            .write_car(&self.inner.stores.file, key.as_ref(), root, blocks)
            .await?;
        self.inner.wal.enqueue_file(link, public).await?;
        Ok(link)
    }

    /// Reads back a file CAR written by [`Self::commit_files`].
    pub async fn load_file_car(&self, link: Link) -> Result<CarBlocks> {
        let remote = self.inner.remote.as_ref().map(|remote| &remote.file);
        self.fetch_car(&self.inner.stores.file, remote, link).await
    }

    /// Loads a data CAR. Concurrent loads of the same CAR share one fetch.
    pub async fn load_car(&self, link: Link) -> Result<Arc<CarBlocks>> {
        let reader = {
            let mut readers = self.inner.car_readers.lock();
            readers
                .entry(link)
                .or_insert_with(|| {
                    let this = self.clone();
                    async move {
                        let remote = this.inner.remote.as_ref().map(|remote| &remote.data);
                        this.fetch_car(&this.inner.stores.data, remote, link)
                            .await
                            .map(Arc::new)
                            .map_err(Arc::new)
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };
        match reader.await {
            Ok(car) => Ok(car),
            Err(err) => {
                self.inner.car_readers.lock().remove(&link);
                Err(err.into())
            }
        }
    }

    async fn fetch_car(
        &self,
        local: &DataStore,
        remote: Option<&DataStore>,
        link: Link,
    ) -> Result<CarBlocks> {
        let bytes = match local.load(&link).await {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => {
                let Some(remote) = remote else {
                    return Err(err);
                };
                let bytes = remote.load(&link).await?;
                local.save(&link, bytes.clone()).await?;
                bytes
            }
            Err(err) => return Err(err),
        };
        let car = decode_car(&link, &bytes).await?;
        if !car.is_encrypted() {
            return Ok(car);
        }
        let key = self.key().ok_or_else(|| {
            Error::Configuration(format!("car {link} is encrypted but no key is known"))
        })?;
        decrypt_car(&key, &car).await
    }

    /// Decodes the header at the root of a group's first CAR.
    pub async fn load_car_header(&self, group: &[Link]) -> Result<CarHeader<M>> {
        let first = *group.first().ok_or(Error::MalformedHeader)?;
        let car = self.load_car(first).await?;
        let root = car.root()?;
        let block = car.blocks.get_sync(&root).ok_or(Error::MalformedHeader)?;
        let envelope: HeaderEnvelope<M> = block.decode().map_err(|_| Error::MalformedHeader)?;
        Ok(envelope.fp)
    }

    async fn get_block_in_group(&self, group: &CarGroup, link: Link) -> Result<Block> {
        for car in group {
            let car = self.load_car(*car).await?;
            if let Some(block) = car.blocks.get_sync(&link) {
                return Ok(block);
            }
        }
        Err(Error::MissingBlock(link))
    }

    async fn find_in_groups(&self, groups: &[CarGroup], link: Link) -> Option<Block> {
        for batch in groups.chunks(GROUP_BATCH) {
            let probes = batch
                .iter()
                .map(|group| self.get_block_in_group(group, link).boxed());
            match future::select_ok(probes).await {
                Ok((block, _)) => return Some(block),
                Err(err) => trace!(%link, "not in batch: {err}"),
            }
        }
        None
    }

    /// Resolves a committed block, or `None` when no CAR of the log has it.
    pub async fn get_block(&self, link: &Link) -> Result<Option<Block>> {
        if let Some(block) = self.inner.block_cache.get_sync(link) {
            return Ok(Some(block));
        }
        let log = self.car_log();
        if let Some(block) = self.find_in_groups(&log, *link).await {
            return Ok(Some(block));
        }
        let Some(oldest) = log.last() else {
            return Ok(None);
        };
        let compacted = match self.load_car_header(oldest).await {
            Ok(header) => header.compact,
            Err(err) => {
                debug!("no compacted groups to search: {err:#}");
                return Ok(None);
            }
        };
        Ok(self.find_in_groups(&compacted, *link).await)
    }

    /// Every cached block, plus every block of the car log when `include_log` is set.
    pub async fn entries(&self, include_log: bool) -> Result<Vec<Block>> {
        let mut seen = HashSet::new();
        let mut out: Vec<Block> = self
            .inner
            .block_cache
            .entries()
            .into_iter()
            .filter(|block| seen.insert(block.link))
            .collect();
        if include_log {
            for car in self.car_log().into_iter().flatten() {
                let car = self.load_car(car).await?;
                out.extend(
                    car.blocks
                        .entries()
                        .into_iter()
                        .filter(|block| seen.insert(block.link)),
                );
            }
        }
        Ok(out)
    }

    pub async fn handle_db_metas(&self, metas: Vec<DbMeta>) -> Result<()> {
        for meta in metas {
            self.merge_db_meta_into_clock(meta).await?;
        }
        Ok(())
    }

    /// Merges a commit made elsewhere into the car log and hands its meta to the clock.
    #[instrument(skip_all, fields(name = %self.inner.name))]
    pub async fn merge_db_meta_into_clock(&self, meta: DbMeta) -> Result<()> {
        if self.is_compacting() {
            return Err(Error::Compacting);
        }
        if self.inner.seen_meta.lock().contains(&meta) {
            trace!("meta already seen");
            return Ok(());
        }
        if let Some(key) = &meta.key {
            self.set_key(key)?;
        }
        if self.inner.car_log.read().contains(&meta.cars) {
            self.inner.seen_meta.lock().insert(meta);
            return Ok(());
        }

        let header = self.load_car_header(&meta.cars).await?;
        self.inner
            .seen_compacted
            .lock()
            .extend(header.compact.iter().cloned());
        futures::stream::iter(header.cars.iter().flatten().copied())
            .map(|car| async move {
                if let Err(err) = self.load_car(car).await {
                    debug!(%car, "prefetch failed: {err:#}");
                }
            })
            .buffer_unordered(PREFETCH_CONCURRENCY)
            .collect::<()>()
            .await;

        {
            let seen = self.inner.seen_compacted.lock();
            let mut log = self.inner.car_log.write();
            let merged = unique_groups(
                std::iter::once(meta.cars.clone())
                    .chain(log.iter().cloned())
                    .chain(header.cars.iter().cloned()),
                &seen,
            );
            *log = merged;
        }
        debug!(cars = meta.cars.len(), "merged db meta");

        if let Some(apply) = self.inner.apply_meta.get() {
            apply(header.meta).await?;
        }
        self.inner.seen_meta.lock().insert(meta);
        Ok(())
    }

    /// Merges every meta the remote replica announces from now on.
    pub async fn remote_meta_subscription(&self) -> Result<Option<Unsubscribe>> {
        let Some(remote) = &self.inner.remote else {
            return Ok(None);
        };
        let weak: Weak<Inner<M>> = Arc::downgrade(&self.inner);
        let name = self.inner.name.clone();
        let unsubscribe = remote
            .meta
            .subscribe(move |meta| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let loader = Loader { inner };
                tokio::spawn(
                    async move {
                        if let Err(err) = loader.handle_db_metas(vec![meta]).await {
                            warn!("merging remote meta failed: {err:#}");
                        }
                    }
                    .instrument(error_span!("remote_meta", name = %name)),
                );
            })
            .await?;
        Ok(Some(unsubscribe))
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.stores.close().await
    }

    /// Removes all local data of this database.
    pub async fn destroy(&self) -> Result<()> {
        self.inner.car_log.write().clear();
        self.inner.car_readers.lock().clear();
        self.inner.stores.destroy().await
    }
}
