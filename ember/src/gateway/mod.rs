//! Pluggable storage backends.
//!
//! A [`Gateway`] stores opaque byte payloads under URLs. Stores build on top of it by
//! encoding the store kind, database name and item key into the URL query. Backends are
//! resolved through a [`GatewayRegistry`] that maps URL schemes to gateways.

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::error::{Error, Result};

mod memory;

pub use self::memory::MemoryGateway;

/// Storage layout version recorded in started store URLs.
pub const STORAGE_VERSION: &str = "v0.1-ember";

/// Callback invoked with the payload of every put to a subscribed URL.
pub type SubscribeCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// A storage backend.
#[async_trait]
pub trait Gateway: Send + Sync + fmt::Debug {
    /// URL of the item `key` below `base`.
    async fn build_url(&self, base: &Url, key: &str) -> Result<Url> {
        let mut url = base.clone();
        set_query_param(&mut url, "key", key);
        Ok(url)
    }

    /// Prepares a store URL for use and returns the URL to use from now on.
    async fn start(&self, base: &Url) -> Result<Url> {
        let mut url = base.clone();
        set_query_param(&mut url, "version", STORAGE_VERSION);
        Ok(url)
    }

    async fn close(&self, _base: &Url) -> Result<()> {
        Ok(())
    }

    /// Removes everything stored for the database named in `base`.
    async fn destroy(&self, base: &Url) -> Result<()>;

    async fn put(&self, url: &Url, body: Bytes) -> Result<()>;

    /// Returns [`Error::NotFound`] when nothing is stored at `url`.
    async fn get(&self, url: &Url) -> Result<Bytes>;

    async fn delete(&self, url: &Url) -> Result<()>;

    /// Calls `callback` for every put to `url` until the returned handle is dropped.
    async fn subscribe(&self, _url: &Url, _callback: SubscribeCallback) -> Result<Unsubscribe> {
        Err(Error::Configuration(
            "subscribe is not supported by this gateway".to_string(),
        ))
    }

    /// Reads the item `key` below `base`.
    async fn get_plain(&self, base: &Url, key: &str) -> Result<Bytes> {
        let url = self.build_url(base, key).await?;
        self.get(&url).await
    }
}

/// Replaces or adds one query parameter, keeping the order of the others.
pub fn set_query_param(url: &mut Url, name: &str, value: &str) {
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != name)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut query = url.query_pairs_mut();
    query.clear();
    for (k, v) in &pairs {
        query.append_pair(k, v);
    }
    query.append_pair(name, value);
}

/// Reads one query parameter.
pub fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Ends a subscription when dropped.
#[must_use = "the subscription ends when this is dropped"]
pub struct Unsubscribe {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Unsubscribe {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Ends the subscription now.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel()
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel()
        }
    }
}

/// Gateways by URL scheme.
#[derive(Debug, Clone, Default)]
pub struct GatewayRegistry {
    gateways: BTreeMap<String, Arc<dyn Gateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry serving the `memory` scheme from a fresh [`MemoryGateway`].
    pub fn memory() -> Self {
        Self::new().with("memory", MemoryGateway::default())
    }

    pub fn with(mut self, scheme: impl Into<String>, gateway: impl Gateway + 'static) -> Self {
        self.register(scheme, Arc::new(gateway));
        self
    }

    pub fn register(&mut self, scheme: impl Into<String>, gateway: Arc<dyn Gateway>) {
        self.gateways.insert(scheme.into(), gateway);
    }

    /// The gateway responsible for `url`.
    pub fn get(&self, url: &Url) -> Result<Arc<dyn Gateway>> {
        self.gateways.get(url.scheme()).cloned().ok_or_else(|| {
            Error::Configuration(format!("no gateway registered for scheme {}", url.scheme()))
        })
    }
}
