//! Write-ahead log of uploads to a remote replica.
//!
//! Every local commit is queued here and uploaded in the background. The queue is persisted
//! through the [`WalStore`](crate::store::WalStore) and an entry only leaves it once the
//! remote confirmed the write, so pending uploads survive restarts.

use std::sync::Arc;

use anyhow::anyhow;
use ember_base::Link;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, error_span, instrument, warn, Instrument};

use crate::{
    error::{Error, Result},
    store::{RemoteStores, Stores},
    types::{CarLog, CommitOpts, DbMeta},
};

/// Uploads in flight during one pass.
const MAX_CONCURRENT_UPLOADS: usize = 5;

/// A pending file upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOp {
    pub cid: Link,
    pub public: bool,
}

/// The persisted upload queues.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalState {
    /// Commits whose meta is pushed to the remote once uploaded.
    pub operations: Vec<DbMeta>,
    /// Commits that are uploaded without moving the remote meta.
    #[serde(rename = "noLoaderOps")]
    pub no_loader_ops: Vec<DbMeta>,
    #[serde(rename = "fileOperations")]
    pub file_operations: Vec<FileOp>,
}

impl WalState {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
            && self.no_loader_ops.is_empty()
            && self.file_operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len() + self.no_loader_ops.len() + self.file_operations.len()
    }
}

#[derive(Debug, Clone)]
enum Item {
    Op(DbMeta),
    NoLoaderOp(DbMeta),
    File(FileOp),
}

fn remove_first<T: PartialEq>(list: &mut Vec<T>, item: &T) {
    if let Some(pos) = list.iter().position(|x| x == item) {
        list.remove(pos);
    }
}

/// Queue of uploads to the remote replica.
#[derive(Debug, Clone)]
pub struct RemoteWal {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    name: String,
    state: Mutex<WalState>,
    local: Stores,
    remote: Option<RemoteStores>,
    car_log: Arc<RwLock<CarLog>>,
    /// Newest commit of this session whose meta the remote has not seen yet.
    newest: Mutex<Option<DbMeta>>,
    process_lock: tokio::sync::Mutex<()>,
}

impl RemoteWal {
    /// Opens the log, reloading any state left by a previous session.
    pub async fn open(
        name: impl Into<String>,
        local: Stores,
        remote: Option<RemoteStores>,
        car_log: Arc<RwLock<CarLog>>,
    ) -> Result<Self> {
        let state = local.wal.load().await?.unwrap_or_default();
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(state),
                local,
                remote,
                car_log,
                newest: Mutex::new(None),
                process_lock: Default::default(),
            }),
        })
    }

    /// A copy of the current queues.
    pub fn state(&self) -> WalState {
        self.inner.state.lock().clone()
    }

    pub fn has_remote(&self) -> bool {
        self.inner.remote.is_some()
    }

    /// Queues the CARs of a commit for upload.
    pub async fn enqueue(&self, meta: DbMeta, opts: CommitOpts) -> Result<()> {
        let state = {
            let mut state = self.inner.state.lock();
            if opts.no_loader {
                state.no_loader_ops.push(meta);
            } else {
                *self.inner.newest.lock() = Some(meta.clone());
                state.operations.push(meta);
            }
            state.clone()
        };
        self.inner.local.wal.save(&state).await?;
        self.spawn_process();
        Ok(())
    }

    /// Queues a file CAR for upload.
    pub async fn enqueue_file(&self, cid: Link, public: bool) -> Result<()> {
        let state = {
            let mut state = self.inner.state.lock();
            state.file_operations.push(FileOp { cid, public });
            state.clone()
        };
        self.inner.local.wal.save(&state).await?;
        self.spawn_process();
        Ok(())
    }

    /// Starts a background drain.
    pub fn spawn_process(&self) {
        if self.inner.remote.is_none() {
            return;
        }
        let this = self.clone();
        tokio::spawn(
            async move {
                if let Err(err) = this.process().await {
                    warn!("wal upload failed, will retry on next commit: {err:#}");
                }
            }
            .instrument(error_span!("wal", name = %self.inner.name)),
        );
    }

    /// Uploads everything queued, until the queue is empty or a pass fails.
    #[instrument(skip_all, fields(name = %self.inner.name))]
    pub async fn process(&self) -> Result<()> {
        let Some(remote) = self.inner.remote.as_ref() else {
            return Ok(());
        };
        let _guard = self.inner.process_lock.lock().await;
        loop {
            let snapshot = self.state();
            if snapshot.is_empty() {
                return Ok(());
            }
            self.process_pass(remote, snapshot).await?;
        }
    }

    async fn process_pass(&self, remote: &RemoteStores, snapshot: WalState) -> Result<()> {
        let last_op = snapshot.operations.last().cloned();
        let items: Vec<Item> = snapshot
            .operations
            .into_iter()
            .map(Item::Op)
            .chain(snapshot.no_loader_ops.into_iter().map(Item::NoLoaderOp))
            .chain(snapshot.file_operations.into_iter().map(Item::File))
            .collect();
        let total = items.len();
        debug!(total, "uploading");

        let results: Vec<(Item, Result<()>)> = futures::stream::iter(items)
            .map(|item| async move {
                let res = self.upload(remote, &item).await;
                (item, res)
            })
            .buffer_unordered(MAX_CONCURRENT_UPLOADS)
            .collect()
            .await;

        let mut failures = 0;
        let state = {
            let mut state = self.inner.state.lock();
            for (item, res) in results {
                match res {
                    Ok(()) => match &item {
                        Item::Op(meta) => remove_first(&mut state.operations, meta),
                        Item::NoLoaderOp(meta) => remove_first(&mut state.no_loader_ops, meta),
                        Item::File(op) => remove_first(&mut state.file_operations, op),
                    },
                    Err(err) => {
                        failures += 1;
                        error!(?item, "upload failed: {err:#}");
                    }
                }
            }
            state.clone()
        };
        self.inner.local.wal.save(&state).await?;
        if failures > 0 {
            return Err(Error::gateway(anyhow!(
                "{failures} of {total} uploads failed"
            )));
        }

        // retried operations are older than the ones uploaded before, so the remote meta
        // only moves once the whole queue is through, and then to the newest commit
        let meta = {
            let state = self.inner.state.lock();
            if state.operations.is_empty() {
                self.inner.newest.lock().take().or(last_op)
            } else {
                None
            }
        };
        if let Some(meta) = meta {
            if let Err(err) = remote.meta.save(&meta).await {
                error!("pushing remote meta failed: {err:#}");
                let state = {
                    let mut state = self.inner.state.lock();
                    state.operations.push(meta);
                    state.clone()
                };
                self.inner.local.wal.save(&state).await?;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn upload(&self, remote: &RemoteStores, item: &Item) -> Result<()> {
        match item {
            Item::Op(meta) | Item::NoLoaderOp(meta) => {
                for car in &meta.cars {
                    let bytes = match self.inner.local.data.load(car).await {
                        Ok(bytes) => bytes,
                        Err(err) if err.is_not_found() => {
                            if self.inner.car_log.read().contains(&meta.cars) {
                                return Err(err);
                            }
                            debug!(%car, "dropping upload of compacted car");
                            return Ok(());
                        }
                        Err(err) => return Err(err),
                    };
                    remote.data.save(car, bytes).await?;
                }
                Ok(())
            }
            Item::File(op) => {
                let bytes = self.inner.local.file.load(&op.cid).await?;
                remote.file.save(&op.cid, bytes).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use ember_base::Codec;
    use url::Url;

    use super::*;
    use crate::gateway::{
        query_param, Gateway, GatewayRegistry, MemoryGateway, SubscribeCallback, Unsubscribe,
    };

    async fn setup(with_remote: bool) -> anyhow::Result<(RemoteWal, Stores, Option<RemoteStores>)> {
        let registry = GatewayRegistry::memory();
        let local = Stores::open(&registry, &Url::parse("memory://local")?, "db").await?;
        let remote = if with_remote {
            Some(RemoteStores::open(&registry, &Url::parse("memory://remote")?, "db").await?)
        } else {
            None
        };
        let wal = RemoteWal::open("db", local.clone(), remote.clone(), Default::default()).await?;
        Ok((wal, local, remote))
    }

    #[tokio::test]
    async fn without_remote_the_queue_is_kept() -> anyhow::Result<()> {
        let (wal, local, _) = setup(false).await?;
        let car = Link::sha256(Codec::CAR, b"car");
        let meta = DbMeta {
            cars: vec![car],
            key: None,
        };
        wal.enqueue(meta.clone(), CommitOpts::default()).await?;
        wal.process().await?;
        assert_eq!(wal.state().operations, vec![meta]);

        // the queue survives a reopen
        let reopened = RemoteWal::open("db", local, None, Default::default()).await?;
        assert_eq!(reopened.state().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn uploads_cars_files_and_meta() -> anyhow::Result<()> {
        let (wal, local, remote) = setup(true).await?;
        let remote = remote.unwrap();
        let car = Link::sha256(Codec::CAR, b"car");
        local.data.save(&car, Bytes::from_static(b"car")).await?;
        let file = Link::sha256(Codec::CAR, b"file");
        local.file.save(&file, Bytes::from_static(b"file")).await?;
        let meta = DbMeta {
            cars: vec![car],
            key: None,
        };
        wal.inner.car_log.write().insert(0, meta.cars.clone());

        wal.enqueue(meta.clone(), CommitOpts::default()).await?;
        wal.enqueue_file(file, true).await?;
        wal.process().await?;

        assert!(wal.state().is_empty());
        assert_eq!(remote.data.load(&car).await?, Bytes::from_static(b"car"));
        assert_eq!(remote.file.load(&file).await?, Bytes::from_static(b"file"));
        assert_eq!(remote.meta.load().await?, Some(meta));
        Ok(())
    }

    #[tokio::test]
    async fn missing_cars_fail_only_while_in_the_log() -> anyhow::Result<()> {
        let (wal, _local, remote) = setup(true).await?;
        let remote = remote.unwrap();
        let gone = DbMeta {
            cars: vec![Link::sha256(Codec::CAR, b"gone")],
            key: None,
        };
        wal.inner.car_log.write().insert(0, gone.cars.clone());
        wal.enqueue(gone.clone(), CommitOpts {
            no_loader: true,
            ..Default::default()
        })
        .await?;
        assert!(matches!(wal.process().await, Err(Error::Gateway(_))));
        assert_eq!(wal.state().no_loader_ops, vec![gone.clone()]);

        wal.inner.car_log.write().clear();
        wal.process().await?;
        assert!(wal.state().is_empty());
        // no-loader ops never move the remote meta
        assert_eq!(remote.meta.load().await?, None);
        Ok(())
    }

    /// Refuses uploads of one CAR.
    #[derive(Debug, Clone, Default)]
    struct RefusingGateway {
        inner: MemoryGateway,
        refused: Arc<Mutex<Option<Link>>>,
    }

    #[async_trait::async_trait]
    impl Gateway for RefusingGateway {
        async fn destroy(&self, base: &Url) -> Result<()> {
            self.inner.destroy(base).await
        }

        async fn put(&self, url: &Url, body: Bytes) -> Result<()> {
            let refused = self.refused.lock().map(|car| car.to_string());
            if refused.is_some() && query_param(url, "key") == refused {
                return Err(Error::gateway(anyhow!("upload refused")));
            }
            self.inner.put(url, body).await
        }

        async fn get(&self, url: &Url) -> Result<Bytes> {
            self.inner.get(url).await
        }

        async fn delete(&self, url: &Url) -> Result<()> {
            self.inner.delete(url).await
        }

        async fn subscribe(&self, url: &Url, callback: SubscribeCallback) -> Result<Unsubscribe> {
            self.inner.subscribe(url, callback).await
        }
    }

    #[tokio::test]
    async fn a_failed_upload_keeps_only_its_operation() -> anyhow::Result<()> {
        let gateway = RefusingGateway::default();
        let registry = GatewayRegistry::memory().with("refusing", gateway.clone());
        let local = Stores::open(&registry, &Url::parse("memory://local")?, "db").await?;
        let remote = RemoteStores::open(&registry, &Url::parse("refusing://remote")?, "db").await?;
        let wal = RemoteWal::open("db", local.clone(), Some(remote.clone()), Default::default()).await?;

        let mut metas = Vec::new();
        for name in ["first", "second"] {
            let car = Link::sha256(Codec::CAR, name.as_bytes());
            local.data.save(&car, Bytes::from(name)).await?;
            wal.inner.car_log.write().insert(0, vec![car]);
            metas.push(DbMeta {
                cars: vec![car],
                key: None,
            });
        }
        *gateway.refused.lock() = Some(metas[0].cars[0]);
        for meta in &metas {
            wal.enqueue(meta.clone(), CommitOpts::default()).await?;
        }

        assert!(matches!(wal.process().await, Err(Error::Gateway(_))));
        assert_eq!(wal.state().operations, vec![metas[0].clone()]);
        assert_eq!(remote.data.load(&metas[1].cars[0]).await?, Bytes::from("second"));
        assert_eq!(remote.meta.load().await?, None);

        *gateway.refused.lock() = None;
        wal.process().await?;
        assert!(wal.state().is_empty());
        assert_eq!(remote.data.load(&metas[0].cars[0]).await?, Bytes::from("first"));
        // the retried commit is the older one, the remote points at the newest
        assert_eq!(remote.meta.load().await?, Some(metas[1].clone()));
        Ok(())
    }
}
