use std::collections::HashSet;

use ember_base::{fetch_decoded, BlockFetcher, Link};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::tree::{load_event, resolve_tree, DocTree};
use crate::{
    blockstore::CompactionFetcher,
    error::Result,
    types::{TxMeta, GENESIS_KEY},
};

/// The stored value of a document: its body, or a tombstone.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DocValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub del: bool,
}

/// A write, or a row of a change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct DocUpdate {
    pub id: String,
    pub value: Option<Value>,
    pub del: bool,
    /// The event that carried the change.
    pub clock: Option<Link>,
}

impl DocUpdate {
    pub fn put(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            value: Some(value),
            del: false,
            clock: None,
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: None,
            del: true,
            clock: None,
        }
    }

    pub(crate) fn to_value(&self) -> DocValue {
        if self.del {
            DocValue {
                doc: None,
                del: true,
            }
        } else {
            DocValue {
                doc: self.value.clone(),
                del: false,
            }
        }
    }
}

/// Options of a change feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangesOptions {
    /// Skip events that cannot be loaded instead of failing.
    pub dirty: bool,
    /// Maximum number of rows.
    pub limit: Option<usize>,
}

pub async fn load_doc_value<F: BlockFetcher + ?Sized>(fetcher: &F, link: &Link) -> Result<DocValue> {
    Ok(fetch_decoded(fetcher, link).await?)
}

/// The latest change of every key written after `since`, oldest first.
///
/// The walk stops descending wherever it reaches a level of the clock that contains one of
/// the `since` links. It is depth first from the head links in order, so when concurrent
/// branches wrote the same key the row carries the value of the branch visited first. That
/// can differ from the merged document that [`resolve_tree`] and `get` return.
///
/// With `opts.dirty` set, events that cannot be loaded or decoded are logged and skipped.
pub async fn changes_since<F: BlockFetcher + ?Sized>(
    fetcher: &F,
    head: &[Link],
    since: &[Link],
    opts: ChangesOptions,
) -> Result<Vec<DocUpdate>> {
    let limit = opts.limit.unwrap_or(usize::MAX);
    let reached_since = |links: &[Link]| links.iter().any(|link| since.contains(link));
    let mut updates = Vec::new();
    let mut keys = HashSet::new();
    let mut done = HashSet::new();
    let mut stack: Vec<(Vec<Link>, usize)> = Vec::new();
    if !reached_since(head) {
        stack.push((head.to_vec(), 0));
    }

    'walk: while let Some((links, next)) = stack.last_mut() {
        let Some(&link) = links.get(*next) else {
            stack.pop();
            continue;
        };
        *next += 1;
        if !done.insert(link) {
            continue;
        }
        let event = match load_event(fetcher, &link).await {
            Ok(event) => event,
            Err(err) if opts.dirty => {
                warn!(%link, "skipping unreadable event: {err:#}");
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        for (key, value) in event.data.ops().into_iter().rev() {
            if updates.len() >= limit {
                break 'walk;
            }
            if key == GENESIS_KEY || !keys.insert(key.to_string()) {
                continue;
            }
            let doc = load_doc_value(fetcher, &value).await?;
            updates.push(DocUpdate {
                id: key.to_string(),
                value: doc.doc,
                del: doc.del,
                clock: Some(link),
            });
        }
        if !event.parents.is_empty() && !reached_since(&event.parents) {
            stack.push((event.parents, 0));
        }
    }
    updates.reverse();
    Ok(updates)
}

/// Every key and value link of the tree except the genesis document.
pub async fn get_all_entries<F: BlockFetcher + ?Sized>(
    fetcher: &F,
    tree: &DocTree,
) -> Result<Vec<(String, Link)>> {
    let entries = tree.entries(fetcher).await?;
    Ok(entries
        .into_iter()
        .filter(|(key, _)| key != GENESIS_KEY)
        .collect())
}

/// Every live document at `tree`, in key order.
pub async fn all_docs<F: BlockFetcher + ?Sized>(fetcher: &F, tree: &DocTree) -> Result<Vec<DocUpdate>> {
    let mut docs = Vec::new();
    for (id, link) in get_all_entries(fetcher, tree).await? {
        let value = load_doc_value(fetcher, &link).await?;
        if value.del {
            continue;
        }
        docs.push(DocUpdate {
            id,
            value: value.doc,
            del: false,
            clock: None,
        });
    }
    Ok(docs)
}

/// Reads every block needed to serve `head` through the compaction fetcher.
pub async fn do_compact<M: TxMeta>(fetcher: &CompactionFetcher<M>, head: &[Link]) -> Result<()> {
    for link in head {
        fetcher.get_required(link).await?;
    }

    let resolved = resolve_tree(fetcher, head).await?;
    for block in resolved.additions {
        fetcher.log(block);
    }
    let overlay = ember_base::Overlay::new(fetcher.logged(), fetcher);
    for (_, link) in resolved.tree.entries(&overlay).await? {
        fetcher.get_required(&link).await?;
    }
    resolved.tree.node_links(&overlay).await?;

    // every event and every value the change feed reports, which for concurrent writes
    // includes values the merged tree does not hold
    changes_since(fetcher, head, &[], ChangesOptions::default()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use ember_base::{Block, MemoryBlockstore};
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::{crdt::tree::apply_ops, error::Error};

    async fn write(
        store: &MemoryBlockstore,
        head: &[Link],
        updates: &[DocUpdate],
    ) -> anyhow::Result<Vec<Link>> {
        let mut ops = Vec::new();
        for update in updates {
            let block = Block::encode(&update.to_value())?;
            ops.push((update.id.clone(), block.link));
            store.put_block(block);
        }
        let result = apply_ops(store, head, ops).await?;
        for block in result.additions {
            store.put_block(block);
        }
        store.put_block(result.event);
        Ok(result.head)
    }

    #[test]
    fn tombstones_encode_compactly() {
        let value = DocUpdate::delete("x").to_value();
        let bytes = ember_base::codec::encode(&value).unwrap();
        let decoded: serde_json::Map<String, Value> = ember_base::codec::decode(&bytes).unwrap();
        assert_eq!(Value::Object(decoded), json!({"del": true}));
    }

    #[tokio::test]
    async fn changes_keep_the_newest_value_per_key() -> anyhow::Result<()> {
        let store = MemoryBlockstore::new();
        let h1 = write(&store, &[], &[DocUpdate::put("a", json!(1))]).await?;
        let h2 = write(&store, &h1, &[DocUpdate::put("b", json!(2))]).await?;
        let h3 = write(
            &store,
            &h2,
            &[DocUpdate::put("a", json!(3)), DocUpdate::delete("b")],
        )
        .await?;

        let all = changes_since(&store, &h3, &[], Default::default()).await?;
        let rows: Vec<_> = all.iter().map(|u| (u.id.as_str(), u.del)).collect();
        assert_eq!(rows, [("a", false), ("b", true)]);
        assert_eq!(all[0].value, Some(json!(3)));
        assert_eq!(all[0].clock, Some(h3[0]));

        let since_h1 = changes_since(&store, &h3, &h1, Default::default()).await?;
        assert_eq!(since_h1.len(), 2);
        assert!(changes_since(&store, &h3, &h3, Default::default()).await?.is_empty());

        let limited = changes_since(
            &store,
            &h3,
            &[],
            ChangesOptions {
                limit: Some(1),
                ..Default::default()
            },
        )
        .await?;
        assert_eq!(limited.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_writes_report_the_first_head_branch() -> anyhow::Result<()> {
        let store = MemoryBlockstore::new();
        let base = write(&store, &[], &[DocUpdate::put("base", json!(0))]).await?;
        let left = write(&store, &base, &[DocUpdate::put("k", json!("left"))]).await?;
        let right = write(&store, &base, &[DocUpdate::put("k", json!("right"))]).await?;

        let value_of_k = |rows: Vec<DocUpdate>| {
            rows.into_iter()
                .find(|row| row.id == "k")
                .and_then(|row| row.value)
        };
        let head = [left[0], right[0]];
        let rows = changes_since(&store, &head, &[], Default::default()).await?;
        assert_eq!(rows.len(), 2);
        assert_eq!(value_of_k(rows), Some(json!("left")));

        let head = [right[0], left[0]];
        let rows = changes_since(&store, &head, &[], Default::default()).await?;
        assert_eq!(value_of_k(rows), Some(json!("right")));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn dirty_feeds_skip_unreadable_events() -> anyhow::Result<()> {
        let store = MemoryBlockstore::new();
        let h1 = write(&store, &[], &[DocUpdate::put("a", json!(1))]).await?;
        let h2 = write(&store, &h1, &[DocUpdate::put("b", json!(2))]).await?;
        let dirty_opts = ChangesOptions {
            dirty: true,
            ..Default::default()
        };

        let missing = MemoryBlockstore::new();
        let corrupt = MemoryBlockstore::new();
        for block in store.entries() {
            if block.link != h1[0] {
                missing.put_block(block.clone());
                corrupt.put_block(block);
            }
        }
        corrupt.put(h1[0], vec![0xff, 0x00, 0x13]);

        assert!(matches!(
            changes_since(&missing, &h2, &[], Default::default()).await,
            Err(Error::MissingBlock(_))
        ));
        assert!(changes_since(&corrupt, &h2, &[], Default::default())
            .await
            .is_err());

        for partial in [&missing, &corrupt] {
            let dirty = changes_since(partial, &h2, &[], dirty_opts).await?;
            assert_eq!(dirty.len(), 1);
            assert_eq!(dirty[0].id, "b");
        }
        assert!(logs_contain("skipping unreadable event"));
        Ok(())
    }

    #[tokio::test]
    async fn all_docs_skip_tombstones_and_genesis() -> anyhow::Result<()> {
        let store = MemoryBlockstore::new();
        let head = write(
            &store,
            &[],
            &[
                DocUpdate::put(GENESIS_KEY, json!({"_id": GENESIS_KEY})),
                DocUpdate::put("live", json!({"n": 1})),
                DocUpdate::delete("gone"),
            ],
        )
        .await?;
        let tree = resolve_tree(&store, &head).await?.tree;
        let docs = all_docs(&store, &tree).await?;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "live");
        assert_eq!(get_all_entries(&store, &tree).await?.len(), 2);
        Ok(())
    }
}
