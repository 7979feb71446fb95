use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::trace;
use url::Url;

use super::{query_param, Gateway, SubscribeCallback, Unsubscribe};
use crate::error::{Error, Result};

/// A gateway that keeps everything in process memory.
///
/// Clones share the same storage, so several databases can sync through one instance.
#[derive(Debug, Clone, Default)]
pub struct MemoryGateway {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug, Default)]
struct Inner {
    data: RwLock<BTreeMap<String, Bytes>>,
    #[debug(skip)]
    subscribers: Mutex<HashMap<String, Vec<(u64, SubscribeCallback)>>>,
    next_id: AtomicU64,
}

/// Storage key of a URL: the URL without its `version` parameter.
fn storage_key(url: &Url) -> String {
    let mut key = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "version")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        key.set_query(None);
    } else {
        key.query_pairs_mut().clear().extend_pairs(pairs);
    }
    key.to_string()
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.inner.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Storage keys of all items, in order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.data.read().keys().cloned().collect()
    }

    fn notify(&self, key: &str, body: &Bytes) {
        let callbacks: Vec<SubscribeCallback> = self
            .inner
            .subscribers
            .lock()
            .get(key)
            .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(body.clone());
        }
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn destroy(&self, base: &Url) -> Result<()> {
        let name = query_param(base, "name");
        let mut data = self.inner.data.write();
        data.retain(|key, _| match Url::parse(key) {
            Ok(url) => {
                url.scheme() != base.scheme()
                    || url.host_str() != base.host_str()
                    || url.path() != base.path()
                    || query_param(&url, "name") != name
            }
            Err(_) => true,
        });
        Ok(())
    }

    async fn put(&self, url: &Url, body: Bytes) -> Result<()> {
        let key = storage_key(url);
        trace!(%key, len = body.len(), "put");
        self.inner.data.write().insert(key.clone(), body.clone());
        self.notify(&key, &body);
        Ok(())
    }

    async fn get(&self, url: &Url) -> Result<Bytes> {
        let key = storage_key(url);
        self.inner
            .data
            .read()
            .get(&key)
            .cloned()
            .ok_or(Error::NotFound(key))
    }

    async fn delete(&self, url: &Url) -> Result<()> {
        self.inner.data.write().remove(&storage_key(url));
        Ok(())
    }

    async fn subscribe(&self, url: &Url, callback: SubscribeCallback) -> Result<Unsubscribe> {
        let key = storage_key(url);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .entry(key.clone())
            .or_default()
            .push((id, callback));
        let inner = Arc::downgrade(&self.inner);
        Ok(Unsubscribe::new(move || {
            if let Some(inner) = inner.upgrade() {
                let mut subscribers = inner.subscribers.lock();
                if let Some(subs) = subscribers.get_mut(&key) {
                    subs.retain(|(sub, _)| *sub != id);
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::gateway::set_query_param;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn put_get_delete() -> anyhow::Result<()> {
        let gateway = MemoryGateway::new();
        let base = gateway.start(&url("memory://a?store=data&name=db")).await?;
        let item = gateway.build_url(&base, "k1").await?;
        assert!(matches!(gateway.get(&item).await, Err(Error::NotFound(_))));

        gateway.put(&item, Bytes::from_static(b"v1")).await?;
        assert_eq!(gateway.get(&item).await?, Bytes::from_static(b"v1"));
        assert_eq!(gateway.get_plain(&base, "k1").await?, Bytes::from_static(b"v1"));

        // the version is not part of the identity of an item
        let mut unversioned = url("memory://a?store=data&name=db");
        set_query_param(&mut unversioned, "key", "k1");
        assert_eq!(gateway.get(&unversioned).await?, Bytes::from_static(b"v1"));

        gateway.delete(&item).await?;
        assert!(gateway.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn subscribers_see_puts_until_dropped() -> anyhow::Result<()> {
        let gateway = MemoryGateway::new();
        let meta = url("memory://a?store=meta&name=db&key=main");
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let sub = gateway
            .subscribe(
                &meta,
                Arc::new(move |body: Bytes| {
                    s.fetch_add(body.len(), Ordering::SeqCst);
                }),
            )
            .await?;
        gateway.put(&meta, Bytes::from_static(b"abc")).await?;
        gateway
            .put(&url("memory://a?store=meta&name=other&key=main"), Bytes::new())
            .await?;
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        drop(sub);
        gateway.put(&meta, Bytes::from_static(b"abcd")).await?;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn destroy_only_touches_one_database() -> anyhow::Result<()> {
        let gateway = MemoryGateway::new();
        for name in ["db", "db-idx"] {
            for store in ["data", "meta"] {
                let u = url(&format!("memory://a?store={store}&name={name}&key=k"));
                gateway.put(&u, Bytes::new()).await?;
            }
        }
        gateway
            .put(&url("memory://b?store=data&name=db&key=k"), Bytes::new())
            .await?;
        gateway.destroy(&url("memory://a?store=data&name=db")).await?;
        assert_eq!(gateway.len(), 3);
        assert!(gateway.keys().iter().all(|k| !k.contains("a?store=data&name=db&")));
        Ok(())
    }
}
