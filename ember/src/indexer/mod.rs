//! Secondary indexes over the documents of a [`Crdt`].
//!
//! An index runs a map function over every document and keeps two prolly trees: `by_key`
//! maps the encoded `[emitted key, document id]` to the emitted value, and `by_id` maps a
//! document id to the `by_key` keys it emitted, so stale rows can be removed when the
//! document changes. Indexes update lazily, on query, from the changes since the clock head
//! they were last built at.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    ops::Bound,
    sync::Arc,
};

use bytes::Bytes;
use ember_base::Link;
use ember_prolly::{HashChunker, Op, ProllyTree};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::{
    crdt::{Crdt, DocsResponse},
    error::{Error, Result},
    types::{same_head, ClockHead, CommitOpts},
};

pub mod keys;

/// Maps a document to index rows. Rows are added through the [`Emitter`]. A function that
/// emits nothing but returns a key indexes the document under that key.
pub type MapFn = Arc<dyn Fn(&Value, &mut Emitter) -> Option<Value> + Send + Sync>;

type KeyTree = ProllyTree<Bytes, Option<Value>, HashChunker>;
type IdTree = ProllyTree<String, Vec<Bytes>, HashChunker>;

/// Collects the rows a map function emits for one document.
#[derive(Debug, Default)]
pub struct Emitter {
    rows: Vec<(Value, Option<Value>)>,
}

impl Emitter {
    pub fn emit(&mut self, key: Value, value: Value) {
        self.rows.push((key, Some(value)));
    }
}

/// A named, versioned map function.
///
/// The identity `name@version` is persisted with the index. Bump the version whenever the
/// map function changes so stored rows are not reused.
#[derive(Clone)]
pub struct IndexDefinition {
    pub name: String,
    pub version: u32,
    pub map: MapFn,
}

impl fmt::Debug for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexDefinition")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl IndexDefinition {
    pub fn new(
        name: impl Into<String>,
        version: u32,
        map: impl Fn(&Value, &mut Emitter) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            map: Arc::new(map),
        }
    }

    /// Indexes documents by the value of one top level field.
    pub fn field(field: impl Into<String>) -> Self {
        let field = field.into();
        let name = field.clone();
        Self::new(name, 1, move |doc: &Value, _: &mut Emitter| doc.get(&field).cloned())
    }

    pub fn identity(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    fn rows(&self, doc: &Value) -> Vec<(Value, Option<Value>)> {
        let mut emitter = Emitter::default();
        let returned = (self.map)(doc, &mut emitter);
        if emitter.rows.is_empty() {
            if let Some(key) = returned {
                emitter.rows.push((key, None));
            }
        }
        emitter.rows
    }
}

/// Persisted state of one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    #[serde(rename = "byId")]
    pub by_id: Option<Link>,
    #[serde(rename = "byKey")]
    pub by_key: Option<Link>,
    /// The document clock head the trees were built at.
    pub head: ClockHead,
    /// Identity of the map function.
    pub map: String,
    pub name: String,
}

/// Transaction meta of the index blockstore: every known index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexTransactionMeta {
    pub indexes: BTreeMap<String, IndexMeta>,
}

/// One row of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRow {
    pub key: Value,
    pub id: String,
    pub value: Option<Value>,
    pub doc: Option<Value>,
}

/// Selects and shapes the rows of a query. Without a lookup every row is returned.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub key: Option<Value>,
    pub keys: Option<Vec<Value>>,
    /// Inclusive bounds of the emitted key.
    pub range: Option<(Value, Value)>,
    /// Leading elements of an array key.
    pub prefix: Option<Vec<Value>>,
    pub descending: bool,
    pub limit: Option<usize>,
    pub include_docs: bool,
    /// Keep only rows of documents changed after this head.
    pub since: Option<ClockHead>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            key: None,
            keys: None,
            range: None,
            prefix: None,
            descending: false,
            limit: None,
            include_docs: true,
            since: None,
        }
    }
}

#[derive(Debug, Default)]
struct Trees {
    by_id: IdTree,
    by_key: KeyTree,
    head: ClockHead,
    /// Bumped whenever the trees are replaced from outside an update.
    generation: u64,
}

#[derive(Debug)]
pub(crate) struct IndexState {
    definition: IndexDefinition,
    trees: Mutex<Trees>,
    update_lock: tokio::sync::Mutex<()>,
}

impl IndexState {
    fn new(definition: IndexDefinition) -> Self {
        Self {
            definition,
            trees: Default::default(),
            update_lock: Default::default(),
        }
    }

    fn meta(&self) -> IndexMeta {
        let trees = self.trees.lock();
        IndexMeta {
            by_id: trees.by_id.root(),
            by_key: trees.by_key.root(),
            head: trees.head.clone(),
            map: self.definition.identity(),
            name: self.definition.name.clone(),
        }
    }

    /// Takes over persisted trees built by the same map function.
    fn adopt(&self, meta: &IndexMeta) {
        let mut trees = self.trees.lock();
        trees.by_id = IdTree::with_root(meta.by_id, HashChunker::default());
        trees.by_key = KeyTree::with_root(meta.by_key, HashChunker::default());
        trees.head = meta.head.clone();
        trees.generation += 1;
    }

    fn reset(&self) {
        let mut trees = self.trees.lock();
        trees.by_id = Default::default();
        trees.by_key = Default::default();
        trees.head.clear();
        trees.generation += 1;
    }
}

/// Indexes defined on a database, plus persisted indexes not defined yet.
#[derive(Debug, Default)]
pub(crate) struct IndexRegistry {
    states: BTreeMap<String, Arc<IndexState>>,
    pending: BTreeMap<String, IndexMeta>,
}

impl IndexRegistry {
    pub(crate) fn register(&mut self, definition: IndexDefinition) -> Arc<IndexState> {
        if let Some(state) = self.states.get(&definition.name) {
            if state.definition.identity() != definition.identity() {
                warn!(
                    current = %state.definition.identity(),
                    requested = %definition.identity(),
                    "index is already defined, keeping the current definition"
                );
            }
            return state.clone();
        }
        let state = Arc::new(IndexState::new(definition));
        let identity = state.definition.identity();
        if let Some(meta) = self.pending.remove(&state.definition.name) {
            if meta.map == identity {
                state.adopt(&meta);
            } else {
                warn!(
                    stored = %meta.map,
                    current = %identity,
                    "map function changed, rebuilding index"
                );
            }
        }
        self.states
            .insert(state.definition.name.clone(), state.clone());
        state
    }

    /// Rehydrates indexes from a merged index commit.
    pub(crate) fn apply_meta(&mut self, meta: IndexTransactionMeta) {
        for (name, meta) in meta.indexes {
            match self.states.get(&name) {
                Some(state) if state.definition.identity() == meta.map => state.adopt(&meta),
                Some(state) => warn!(
                    stored = %meta.map,
                    current = %state.definition.identity(),
                    "ignoring index meta of a different map function"
                ),
                None => {
                    self.pending.insert(name, meta);
                }
            }
        }
    }

    /// Drops every built index. They rebuild on their next query.
    pub(crate) fn reset(&self) {
        for state in self.states.values() {
            state.reset();
        }
    }

    fn metas(&self) -> IndexTransactionMeta {
        let mut indexes = self.pending.clone();
        for (name, state) in &self.states {
            indexes.insert(name.clone(), state.meta());
        }
        IndexTransactionMeta { indexes }
    }
}

/// A secondary index of a database.
#[derive(Clone)]
pub struct Index {
    crdt: Crdt,
    state: Arc<IndexState>,
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("definition", &self.state.definition)
            .field("head", &self.head())
            .finish()
    }
}

/// The stored form of a document as seen by map functions: the body with its `_id`.
fn doc_with_id(doc: &Value, id: &str) -> Value {
    match doc {
        Value::Object(map) if !map.contains_key("_id") => {
            let mut map = map.clone();
            map.insert("_id".to_string(), Value::String(id.to_string()));
            Value::Object(map)
        }
        other => other.clone(),
    }
}

impl Index {
    pub(crate) fn new(crdt: Crdt, state: Arc<IndexState>) -> Self {
        Self { crdt, state }
    }

    pub fn name(&self) -> &str {
        &self.state.definition.name
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.state.definition
    }

    /// The document clock head the index was last built at.
    pub fn head(&self) -> ClockHead {
        self.state.trees.lock().head.clone()
    }

    pub fn meta(&self) -> IndexMeta {
        self.state.meta()
    }

    /// Brings the index up to the current head of the database.
    #[instrument(skip_all, fields(index = %self.state.definition.name))]
    pub async fn update(&self) -> Result<()> {
        let _update = self.state.update_lock.lock().await;
        let (generation, index_head, mut by_id, mut by_key) = {
            let trees = self.state.trees.lock();
            (
                trees.generation,
                trees.head.clone(),
                trees.by_id.clone(),
                trees.by_key.clone(),
            )
        };
        if same_head(&index_head, &self.crdt.head()) {
            return Ok(());
        }

        let changes: DocsResponse = if index_head.is_empty() {
            self.crdt.all_docs().await?
        } else {
            match self.crdt.changes(&index_head, Default::default()).await {
                Ok(changes) => changes,
                Err(Error::MissingBlock(link)) => {
                    warn!(%link, "index head is not part of the clock, rebuilding");
                    by_id = IdTree::default();
                    by_key = KeyTree::default();
                    self.crdt.all_docs().await?
                }
                Err(err) => return Err(err),
            }
        };

        let fetcher = self.crdt.index_blockstore();
        let ids: Vec<String> = changes.rows.iter().map(|row| row.id.clone()).collect();
        let mut key_ops = Vec::new();
        for stale in by_id.get_many(fetcher, &ids).await?.into_iter().flatten() {
            key_ops.extend(stale.into_iter().map(Op::Del));
        }
        let mut id_ops = Vec::with_capacity(changes.rows.len());
        for row in &changes.rows {
            let rows = match (&row.value, row.del) {
                (Some(doc), false) => self.state.definition.rows(&doc_with_id(doc, &row.id)),
                _ => Vec::new(),
            };
            let mut emitted = Vec::with_capacity(rows.len());
            for (key, value) in rows {
                let encoded = keys::encode_row(&key, &row.id);
                key_ops.push(Op::Put(encoded.clone(), value));
                emitted.push(encoded);
            }
            id_ops.push(if emitted.is_empty() {
                Op::Del(row.id.clone())
            } else {
                Op::Put(row.id.clone(), emitted)
            });
        }

        let by_key = by_key.bulk(fetcher, key_ops).await?;
        let by_id = by_id.bulk(fetcher, id_ops).await?;
        let meta = IndexMeta {
            by_id: Some(by_id.root),
            by_key: Some(by_key.root),
            head: changes.head.clone(),
            map: self.state.definition.identity(),
            name: self.state.definition.name.clone(),
        };
        let mut all = self.crdt.index_registry().lock().metas();
        all.indexes.insert(meta.name.clone(), meta);
        let blocks: Vec<_> = by_key.blocks.into_iter().chain(by_id.blocks).collect();
        debug!(
            changes = changes.rows.len(),
            blocks = blocks.len(),
            "updating index"
        );
        fetcher
            .transaction(
                |tx| async move {
                    for block in blocks {
                        tx.put(block);
                    }
                    Ok(all)
                },
                CommitOpts::default(),
            )
            .await?;

        let mut trees = self.state.trees.lock();
        if trees.generation == generation {
            trees.by_id = by_id.tree;
            trees.by_key = by_key.tree;
            trees.head = changes.head;
        } else {
            debug!("index was replaced during the update");
        }
        Ok(())
    }

    /// Updates the index and returns the rows selected by `opts`.
    pub async fn query(&self, opts: QueryOptions) -> Result<Vec<IndexRow>> {
        self.update().await?;
        let by_key = self.state.trees.lock().by_key.clone();
        let fetcher = self.crdt.index_blockstore();

        let entries = if let Some(key) = &opts.key {
            scan_prefix(&by_key, fetcher, &keys::key_prefix(key)).await?
        } else if let Some(list) = &opts.keys {
            let mut entries = Vec::new();
            for key in list {
                entries.extend(scan_prefix(&by_key, fetcher, &keys::key_prefix(key)).await?);
            }
            entries
        } else if let Some((low, high)) = &opts.range {
            let lower = keys::key_prefix(low);
            let upper = keys::prefix_end(&keys::key_prefix(high));
            let upper = match &upper {
                Some(end) => Bound::Excluded(end),
                None => Bound::Unbounded,
            };
            by_key
                .range(fetcher, Bound::Included(&lower), upper)
                .await?
        } else if let Some(prefix) = &opts.prefix {
            scan_prefix(&by_key, fetcher, &keys::array_prefix(prefix)).await?
        } else {
            by_key.entries(fetcher).await?
        };

        let mut rows = entries
            .into_iter()
            .map(|(encoded, value)| {
                let (key, id) = keys::decode_row(&encoded)?;
                Ok(IndexRow {
                    key,
                    id,
                    value,
                    doc: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(since) = &opts.since {
            let changed: HashSet<String> = self
                .crdt
                .changes(since, Default::default())
                .await?
                .rows
                .into_iter()
                .map(|row| row.id)
                .collect();
            rows.retain(|row| changed.contains(&row.id));
        }
        if opts.descending {
            rows.reverse();
        }
        if let Some(limit) = opts.limit {
            rows.truncate(limit);
        }
        if opts.include_docs {
            for row in &mut rows {
                row.doc = self.crdt.get(&row.id).await?;
            }
        }
        Ok(rows)
    }
}

async fn scan_prefix(
    tree: &KeyTree,
    fetcher: &crate::blockstore::Blockstore<IndexTransactionMeta>,
    prefix: &Bytes,
) -> Result<Vec<(Bytes, Option<Value>)>> {
    let end = keys::prefix_end(prefix);
    let upper = match &end {
        Some(end) => Bound::Excluded(end),
        None => Bound::Unbounded,
    };
    Ok(tree.range(fetcher, Bound::Included(prefix), upper).await?)
}
