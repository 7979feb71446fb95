//! The document tree at a clock head.
//!
//! Every clock event records the root of the document tree after its operation. A single
//! head resolves to that root directly. Concurrent heads are merged by replaying the events
//! since their common ancestor, heaviest first.

use std::collections::HashMap;

use anyhow::{bail, Result};
use ember_base::{fetch_decoded, Block, BlockFetcher, Link, MemoryBlockstore, Overlay};
use ember_prolly::{HashChunker, Op, ProllyTree};
use futures::{future::BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use crate::{
    clock::{self, Event},
    types::ClockHead,
};

/// Document id to document value block.
pub type DocTree = ProllyTree<String, Link, HashChunker>;

/// One key of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOp {
    pub key: String,
    pub value: Link,
}

/// Payload of a clock event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Put { root: Link, key: String, value: Link },
    Batch { root: Link, ops: Vec<BatchOp> },
}

impl Operation {
    pub fn root(&self) -> Link {
        match self {
            Operation::Put { root, .. } | Operation::Batch { root, .. } => *root,
        }
    }

    /// The written keys in order.
    pub fn ops(&self) -> Vec<(&str, Link)> {
        match self {
            Operation::Put { key, value, .. } => vec![(key.as_str(), *value)],
            Operation::Batch { ops, .. } => ops.iter().map(|op| (op.key.as_str(), op.value)).collect(),
        }
    }
}

pub type ClockEvent = Event<Operation>;

/// A resolved tree plus the blocks that were created to resolve it.
#[derive(Debug)]
pub struct ResolvedTree {
    pub tree: DocTree,
    pub additions: Vec<Block>,
}

/// Result of writing on top of a head.
#[derive(Debug)]
pub struct ApplyResult {
    pub head: ClockHead,
    pub root: Link,
    pub event: Block,
    /// Tree blocks created by the write, including those of a merge.
    pub additions: Vec<Block>,
}

pub async fn load_event<F: BlockFetcher + ?Sized>(fetcher: &F, link: &Link) -> Result<ClockEvent> {
    fetch_decoded(fetcher, link).await
}

/// The document tree at `head`.
pub async fn resolve_tree<F: BlockFetcher + ?Sized>(fetcher: &F, head: &[Link]) -> Result<ResolvedTree> {
    match head {
        [] => Ok(ResolvedTree {
            tree: DocTree::default(),
            additions: Vec::new(),
        }),
        [single] => {
            let event = load_event(fetcher, single).await?;
            Ok(ResolvedTree {
                tree: DocTree::load(event.data.root(), HashChunker::default()),
                additions: Vec::new(),
            })
        }
        _ => merge_heads(fetcher, head).await,
    }
}

async fn merge_heads<F: BlockFetcher + ?Sized>(fetcher: &F, head: &[Link]) -> Result<ResolvedTree> {
    let Some(ancestor) = find_common_ancestor(fetcher, head.to_vec()).await? else {
        bail!("no common ancestor for head {head:?}");
    };
    let mut tree = DocTree::load(
        load_event(fetcher, &ancestor).await?.data.root(),
        HashChunker::default(),
    );
    let local = MemoryBlockstore::new();
    let overlay = Overlay::new(&local, fetcher);
    for event in find_sorted_events(fetcher, head, ancestor).await? {
        let ops = event
            .data
            .ops()
            .into_iter()
            .map(|(key, value)| Op::Put(key.to_string(), value));
        let result = tree.bulk(&overlay, ops).await?;
        for block in result.blocks {
            local.put_block(block);
        }
        tree = result.tree;
    }
    Ok(ResolvedTree {
        tree,
        additions: local.entries(),
    })
}

fn find_common_ancestor<'a, F: BlockFetcher + ?Sized>(
    fetcher: &'a F,
    children: Vec<Link>,
) -> BoxFuture<'a, Result<Option<Link>>> {
    async move {
        if children.is_empty() {
            return Ok(None);
        }
        let mut candidates: Vec<Vec<Link>> = children.into_iter().map(|c| vec![c]).collect();
        loop {
            let mut changed = false;
            for i in 0..candidates.len() {
                let Some(&last) = candidates[i].last() else {
                    continue;
                };
                let Some(next) = find_ancestor_candidate(fetcher, last).await? else {
                    continue;
                };
                // a root event has no further ancestors
                if next == last {
                    continue;
                }
                changed = true;
                candidates[i].push(next);
                if let Some(common) = find_common(&candidates) {
                    return Ok(Some(common));
                }
            }
            if !changed {
                return Ok(None);
            }
        }
    }
    .boxed()
}

async fn find_ancestor_candidate<F: BlockFetcher + ?Sized>(
    fetcher: &F,
    link: Link,
) -> Result<Option<Link>> {
    let event = load_event(fetcher, &link).await?;
    match event.parents.as_slice() {
        [] => Ok(Some(link)),
        [parent] => Ok(Some(*parent)),
        parents => find_common_ancestor(fetcher, parents.to_vec()).await,
    }
}

/// The first link found in every candidate chain.
fn find_common(candidates: &[Vec<Link>]) -> Option<Link> {
    for (i, chain) in candidates.iter().enumerate() {
        for link in chain {
            let everywhere = candidates
                .iter()
                .enumerate()
                .all(|(j, other)| i == j || other.contains(link));
            if everywhere {
                return Some(*link);
            }
        }
    }
    None
}

/// Events between `head` and `tail`, heaviest first. Weight is the summed depth of an
/// event below the head entries, so earlier events come first. Ties sort by link.
async fn find_sorted_events<F: BlockFetcher + ?Sized>(
    fetcher: &F,
    head: &[Link],
    tail: Link,
) -> Result<Vec<ClockEvent>> {
    if head == [tail] {
        return Ok(Vec::new());
    }
    let mut weights: HashMap<Link, (ClockEvent, usize)> = HashMap::new();
    for link in head {
        for (link, event, depth) in find_events(fetcher, *link, tail, 0).await? {
            weights
                .entry(link)
                .and_modify(|(_, weight)| *weight += depth)
                .or_insert((event, depth));
        }
    }
    let mut sorted: Vec<(Link, ClockEvent, usize)> = weights
        .into_iter()
        .map(|(link, (event, weight))| (link, event, weight))
        .collect();
    sorted.sort_by_cached_key(|(link, _, weight)| (std::cmp::Reverse(*weight), link.to_string()));
    Ok(sorted.into_iter().map(|(_, event, _)| event).collect())
}

fn find_events<'a, F: BlockFetcher + ?Sized>(
    fetcher: &'a F,
    start: Link,
    end: Link,
    depth: usize,
) -> BoxFuture<'a, Result<Vec<(Link, ClockEvent, usize)>>> {
    async move {
        if start == end {
            return Ok(Vec::new());
        }
        let event = load_event(fetcher, &start).await?;
        let parents = event.parents.clone();
        let mut acc = vec![(start, event, depth)];
        if parents == [end] {
            return Ok(acc);
        }
        for parent in parents {
            acc.extend(find_events(fetcher, parent, end, depth + 1).await?);
        }
        Ok(acc)
    }
    .boxed()
}

/// Writes `ops` as one event on top of `head`.
pub async fn apply_ops<F: BlockFetcher + ?Sized>(
    fetcher: &F,
    head: &[Link],
    ops: Vec<(String, Link)>,
) -> Result<ApplyResult> {
    if ops.is_empty() {
        bail!("cannot write an empty batch");
    }
    let base = resolve_tree(fetcher, head).await?;
    let local = MemoryBlockstore::new();
    for block in base.additions {
        local.put_block(block);
    }
    let overlay = Overlay::new(&local, fetcher);
    let result = base
        .tree
        .bulk(
            &overlay,
            ops.iter().map(|(key, value)| Op::Put(key.clone(), *value)),
        )
        .await?;
    for block in result.blocks {
        local.put_block(block);
    }
    let root = result.root;

    let data = match <[_; 1]>::try_from(ops) {
        Ok([(key, value)]) => Operation::Put { root, key, value },
        Err(ops) => Operation::Batch {
            root,
            ops: ops
                .into_iter()
                .map(|(key, value)| BatchOp { key, value })
                .collect(),
        },
    };
    let event = Event::new(data, head.to_vec()).to_block()?;
    let additions = local.entries();
    local.put_block(event.clone());
    let head = clock::advance(&overlay, head, event.link).await?;
    Ok(ApplyResult {
        head,
        root,
        event,
        additions,
    })
}
