//! A merkle clock: a DAG of events where each event links to the head it was created on.

use std::collections::{HashSet, VecDeque};

use anyhow::Result;
use ember_base::{codec::CodecError, fetch_decoded, Block, BlockFetcher, Link};
use serde::{Deserialize, Serialize};

use crate::types::ClockHead;

/// One event of the clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    pub parents: Vec<Link>,
    pub data: T,
}

impl<T: Serialize> Event<T> {
    pub fn new(data: T, parents: Vec<Link>) -> Self {
        Self { parents, data }
    }

    pub fn to_block(&self) -> Result<Block, CodecError> {
        Block::encode(self)
    }
}

/// An event with its payload ignored.
#[derive(Debug, Deserialize)]
struct Parents {
    parents: Vec<Link>,
}

async fn parents_of<F: BlockFetcher + ?Sized>(fetcher: &F, link: &Link) -> Result<Vec<Link>> {
    Ok(fetch_decoded::<Parents>(fetcher, link).await?.parents)
}

/// Advances `head` by `event`.
///
/// Head entries the event descends from are replaced by it. An event that some head entry
/// already descends from leaves the head unchanged, and a concurrent event is added.
pub async fn advance<F: BlockFetcher + ?Sized>(
    fetcher: &F,
    head: &[Link],
    event: Link,
) -> Result<ClockHead> {
    if head.contains(&event) {
        return Ok(head.to_vec());
    }

    let mut next = Vec::with_capacity(head.len() + 1);
    let mut changed = false;
    for link in head {
        if contains(fetcher, &event, link).await? {
            changed = true;
        } else {
            next.push(*link);
        }
    }
    if changed {
        next.push(event);
        return Ok(next);
    }

    for link in head {
        if contains(fetcher, link, &event).await? {
            return Ok(head.to_vec());
        }
    }
    let mut next = head.to_vec();
    next.push(event);
    Ok(next)
}

/// Whether event `a` descends from event `b`.
pub async fn contains<F: BlockFetcher + ?Sized>(fetcher: &F, a: &Link, b: &Link) -> Result<bool> {
    if a == b {
        return Ok(true);
    }
    let b_parents = parents_of(fetcher, b).await?;
    let mut queue: VecDeque<Link> = parents_of(fetcher, a).await?.into();
    let mut visited = HashSet::new();
    while let Some(link) = queue.pop_front() {
        if link == *b {
            return Ok(true);
        }
        // b cannot be below one of its own parents
        if b_parents.contains(&link) || !visited.insert(link) {
            continue;
        }
        queue.extend(parents_of(fetcher, &link).await?);
    }
    Ok(false)
}

/// Renders the clock below `head` as Graphviz lines.
pub async fn vis<F: BlockFetcher + ?Sized>(fetcher: &F, head: &[Link]) -> Result<Vec<String>> {
    let mut lines = vec![
        "digraph clock {".to_string(),
        "  node [shape=point fontname=\"Courier\"]; head;".to_string(),
    ];
    let mut nodes = HashSet::new();
    let mut queue = VecDeque::new();
    for link in head {
        nodes.insert(*link);
        lines.push(node_line(link));
        lines.push(format!("  head -> {link};"));
        let parents = parents_of(fetcher, link).await?;
        lines.extend(parents.iter().map(|p| format!("  {link} -> {p};")));
        queue.extend(parents);
    }
    while let Some(link) = queue.pop_front() {
        if !nodes.insert(link) {
            continue;
        }
        lines.push(node_line(&link));
        let parents = parents_of(fetcher, &link).await?;
        lines.extend(parents.iter().map(|p| format!("  {link} -> {p};")));
        queue.extend(parents);
    }
    lines.push("}".to_string());
    Ok(lines)
}

fn node_line(link: &Link) -> String {
    format!(
        "  node [shape=oval fontname=\"Courier\"]; {link} [label=\"{}\"];",
        link.fmt_short()
    )
}
