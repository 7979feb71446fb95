//! Typed stores on top of a [`Gateway`].
//!
//! Every database uses four stores below its base URL, told apart by the `store` query
//! parameter: `data` for commit CARs, `file` for attachment CARs, `meta` for the latest
//! [`DbMeta`] and `wal` for the [`WalState`].

use std::sync::Arc;

use bytes::Bytes;
use ember_base::{codec, Link};
use tracing::warn;
use url::Url;

use crate::{
    error::Result,
    gateway::{set_query_param, Gateway, GatewayRegistry, Unsubscribe},
    types::DbMeta,
    wal::WalState,
};

/// Key of the single item kept by the meta and WAL stores.
pub const MAIN_KEY: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum StoreKind {
    #[display("data")]
    Data,
    #[display("file")]
    File,
    #[display("meta")]
    Meta,
    #[display("wal")]
    Wal,
}

#[derive(Debug, Clone)]
struct StoreBase {
    gateway: Arc<dyn Gateway>,
    url: Url,
}

impl StoreBase {
    async fn open(
        registry: &GatewayRegistry,
        base: &Url,
        name: &str,
        kind: StoreKind,
    ) -> Result<Self> {
        let gateway = registry.get(base)?;
        let mut url = base.clone();
        set_query_param(&mut url, "store", &kind.to_string());
        set_query_param(&mut url, "name", name);
        let url = gateway.start(&url).await?;
        Ok(Self { gateway, url })
    }

    async fn item(&self, key: &str) -> Result<Url> {
        self.gateway.build_url(&self.url, key).await
    }
}

/// Content addressed CAR storage.
#[derive(Debug, Clone)]
pub struct DataStore {
    base: StoreBase,
}

impl DataStore {
    pub async fn save(&self, link: &Link, bytes: Bytes) -> Result<()> {
        let url = self.base.item(&link.to_string()).await?;
        self.base.gateway.put(&url, bytes).await
    }

    /// Fails with [`Error::NotFound`](crate::Error::NotFound) for unknown links.
    pub async fn load(&self, link: &Link) -> Result<Bytes> {
        self.base.gateway.get_plain(&self.base.url, &link.to_string()).await
    }

    pub async fn remove(&self, link: &Link) -> Result<()> {
        let url = self.base.item(&link.to_string()).await?;
        self.base.gateway.delete(&url).await
    }

    pub fn url(&self) -> &Url {
        &self.base.url
    }
}

/// Holds the latest [`DbMeta`] of a database.
#[derive(Debug, Clone)]
pub struct MetaStore {
    base: StoreBase,
}

impl MetaStore {
    pub async fn save(&self, meta: &DbMeta) -> Result<()> {
        let url = self.base.item(MAIN_KEY).await?;
        let bytes = codec::encode(meta)?;
        self.base.gateway.put(&url, bytes.into()).await
    }

    /// Returns `None` when no meta was ever saved.
    pub async fn load(&self) -> Result<Option<DbMeta>> {
        match self.base.gateway.get_plain(&self.base.url, MAIN_KEY).await {
            Ok(bytes) => Ok(Some(codec::decode(&bytes)?)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Calls `callback` with every meta saved to this store by anyone.
    pub async fn subscribe(
        &self,
        callback: impl Fn(DbMeta) + Send + Sync + 'static,
    ) -> Result<Unsubscribe> {
        let url = self.base.item(MAIN_KEY).await?;
        self.base
            .gateway
            .subscribe(
                &url,
                Arc::new(move |bytes: Bytes| match codec::decode::<DbMeta>(&bytes) {
                    Ok(meta) => callback(meta),
                    Err(err) => warn!("ignoring undecodable meta: {err}"),
                }),
            )
            .await
    }
}

/// Persists the [`WalState`].
#[derive(Debug, Clone)]
pub struct WalStore {
    base: StoreBase,
}

impl WalStore {
    pub async fn save(&self, state: &WalState) -> Result<()> {
        let url = self.base.item(MAIN_KEY).await?;
        let bytes = codec::encode(state)?;
        self.base.gateway.put(&url, bytes.into()).await
    }

    pub async fn load(&self) -> Result<Option<WalState>> {
        match self.base.gateway.get_plain(&self.base.url, MAIN_KEY).await {
            Ok(bytes) => Ok(Some(codec::decode(&bytes)?)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// The local stores of one database.
#[derive(Debug, Clone)]
pub struct Stores {
    pub data: DataStore,
    pub file: DataStore,
    pub meta: MetaStore,
    pub wal: WalStore,
}

impl Stores {
    pub async fn open(registry: &GatewayRegistry, base: &Url, name: &str) -> Result<Self> {
        Ok(Self {
            data: DataStore {
                base: StoreBase::open(registry, base, name, StoreKind::Data).await?,
            },
            file: DataStore {
                base: StoreBase::open(registry, base, name, StoreKind::File).await?,
            },
            meta: MetaStore {
                base: StoreBase::open(registry, base, name, StoreKind::Meta).await?,
            },
            wal: WalStore {
                base: StoreBase::open(registry, base, name, StoreKind::Wal).await?,
            },
        })
    }

    /// Closes every store with its gateway.
    pub async fn close(&self) -> Result<()> {
        for base in self.bases() {
            base.gateway.close(&base.url).await?;
        }
        Ok(())
    }

    /// Removes everything stored for this database.
    pub async fn destroy(&self) -> Result<()> {
        for base in self.bases() {
            base.gateway.destroy(&base.url).await?;
        }
        Ok(())
    }

    fn bases(&self) -> [&StoreBase; 4] {
        [
            &self.data.base,
            &self.file.base,
            &self.meta.base,
            &self.wal.base,
        ]
    }
}

/// The stores of a remote replica. Only CARs and the meta pointer are shared.
#[derive(Debug, Clone)]
pub struct RemoteStores {
    pub data: DataStore,
    pub file: DataStore,
    pub meta: MetaStore,
}

impl RemoteStores {
    pub async fn open(registry: &GatewayRegistry, base: &Url, name: &str) -> Result<Self> {
        Ok(Self {
            data: DataStore {
                base: StoreBase::open(registry, base, name, StoreKind::Data).await?,
            },
            file: DataStore {
                base: StoreBase::open(registry, base, name, StoreKind::File).await?,
            },
            meta: MetaStore {
                base: StoreBase::open(registry, base, name, StoreKind::Meta).await?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use ember_base::Codec;

    use super::*;
    use crate::gateway::MemoryGateway;

    #[tokio::test]
    async fn stores_are_separated_by_kind_and_name() -> anyhow::Result<()> {
        let gateway = MemoryGateway::new();
        let registry = GatewayRegistry::new().with("memory", gateway.clone());
        let base = Url::parse("memory://local")?;
        let a = Stores::open(&registry, &base, "a").await?;
        let b = Stores::open(&registry, &base, "b").await?;

        let link = Link::sha256(Codec::CAR, b"car");
        a.data.save(&link, Bytes::from_static(b"car")).await?;
        assert_eq!(a.data.load(&link).await?, Bytes::from_static(b"car"));
        assert!(a.file.load(&link).await.unwrap_err().is_not_found());
        assert!(b.data.load(&link).await.unwrap_err().is_not_found());

        assert_eq!(a.meta.load().await?, None);
        let meta = DbMeta {
            cars: vec![link],
            key: Some("00".repeat(32)),
        };
        a.meta.save(&meta).await?;
        assert_eq!(a.meta.load().await?, Some(meta));
        assert_eq!(b.meta.load().await?, None);

        a.destroy().await?;
        assert!(gateway.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn wal_state_roundtrips() -> anyhow::Result<()> {
        let registry = GatewayRegistry::memory();
        let stores = Stores::open(&registry, &Url::parse("memory://local")?, "w").await?;
        assert_eq!(stores.wal.load().await?, None);
        let link = Link::sha256(Codec::CAR, b"x");
        let state = WalState {
            operations: vec![DbMeta {
                cars: vec![link],
                key: None,
            }],
            ..Default::default()
        };
        stores.wal.save(&state).await?;
        assert_eq!(stores.wal.load().await?, Some(state));
        Ok(())
    }
}
