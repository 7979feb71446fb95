//! Persisted records shared by the loader, the WAL and the CRDT.

use std::fmt;

use ember_base::Link;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// CAR files written by one commit. The first one holds the header block.
pub type CarGroup = Vec<Link>;

/// Commit groups, newest first.
pub type CarLog = Vec<CarGroup>;

/// The frontier of the merkle clock.
pub type ClockHead = Vec<Link>;

/// Key under which the genesis document is written.
pub const GENESIS_KEY: &str = "_genesis";

/// Metadata that rides along with every committed transaction.
pub trait TxMeta: Serialize + DeserializeOwned + Clone + Send + Sync + fmt::Debug + 'static {}

impl<T> TxMeta for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + fmt::Debug + 'static
{}

/// The pointer persisted to the meta store: where the latest commit lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbMeta {
    pub cars: CarGroup,
    /// Hex encoded encryption key, absent for public databases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Header block at the root of the first CAR of every commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarHeader<M> {
    pub cars: CarLog,
    pub compact: CarLog,
    pub meta: M,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct HeaderEnvelope<M> {
    pub fp: CarHeader<M>,
}

/// Transaction metadata of the document store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdtMeta {
    pub head: ClockHead,
}

/// Options for a single commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOpts {
    /// Queue the commit for upload without pushing the remote meta pointer.
    pub no_loader: bool,
    /// The commit replaces the whole car log.
    pub compact: bool,
    /// Skip encryption for this commit.
    pub public: bool,
}

/// Reference to a stored file attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Link of the raw file block.
    pub cid: Link,
    /// The CAR holding the file.
    pub car: Link,
    pub size: u64,
    pub public: bool,
}

/// Sorts a head by the text form of its links.
pub fn sort_head(mut head: ClockHead) -> ClockHead {
    head.sort_by_cached_key(|link| link.to_string());
    head
}

/// Compares two heads as sets.
pub fn same_head(a: &[Link], b: &[Link]) -> bool {
    sort_head(a.to_vec()) == sort_head(b.to_vec())
}
