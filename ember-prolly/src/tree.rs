use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    marker::PhantomData,
    ops::{Bound, RangeBounds},
};

use anyhow::{bail, Context, Result};
use ember_base::{codec, fetch_decoded, Block, BlockFetcher, Link};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::chunker::{Chunker, HashChunker};

/// A stored tree node.
///
/// Branch entries carry the first key of the child they point at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Node<K, V> {
    Leaf(Vec<(K, V)>),
    Branch(Vec<(K, Link)>),
}

/// A single mutation for [`ProllyTree::bulk`].
#[derive(Debug, Clone, PartialEq)]
pub enum Op<K, V> {
    Put(K, V),
    Del(K),
}

impl<K, V> Op<K, V> {
    pub fn key(&self) -> &K {
        match self {
            Op::Put(key, _) | Op::Del(key) => key,
        }
    }
}

/// Outcome of building or mutating a tree.
#[derive(Debug)]
pub struct BulkResult<K, V, C = HashChunker> {
    pub tree: ProllyTree<K, V, C>,
    pub root: Link,
    /// Blocks of the new tree that the previous tree did not have.
    pub blocks: Vec<Block>,
}

/// A handle on a prolly tree root. `None` is the empty tree with no blocks.
pub struct ProllyTree<K, V, C = HashChunker> {
    root: Option<Link>,
    chunker: C,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V, C: fmt::Debug> fmt::Debug for ProllyTree<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProllyTree")
            .field("root", &self.root)
            .field("chunker", &self.chunker)
            .finish()
    }
}

impl<K, V, C: Clone> Clone for ProllyTree<K, V, C> {
    fn clone(&self) -> Self {
        Self {
            root: self.root,
            chunker: self.chunker.clone(),
            _types: PhantomData,
        }
    }
}

impl<K, V, C: Default> Default for ProllyTree<K, V, C> {
    fn default() -> Self {
        Self::with_root(None, C::default())
    }
}

impl<K, V, C> ProllyTree<K, V, C> {
    pub fn with_root(root: Option<Link>, chunker: C) -> Self {
        Self {
            root,
            chunker,
            _types: PhantomData,
        }
    }

    pub fn load(root: Link, chunker: C) -> Self {
        Self::with_root(Some(root), chunker)
    }

    pub fn root(&self) -> Option<Link> {
        self.root
    }

    pub fn chunker(&self) -> &C {
        &self.chunker
    }
}

impl<K, V, C> ProllyTree<K, V, C>
where
    K: Ord + Clone + Serialize + DeserializeOwned + Send + Sync,
    V: Clone + Serialize + DeserializeOwned + Send + Sync,
    C: Chunker,
{
    /// Builds a tree from scratch. Later duplicates of a key win.
    pub fn create(
        entries: impl IntoIterator<Item = (K, V)>,
        chunker: C,
    ) -> Result<BulkResult<K, V, C>> {
        let entries: BTreeMap<K, V> = entries.into_iter().collect();
        Self::build(entries.into_iter().collect(), chunker)
    }

    fn build(entries: Vec<(K, V)>, chunker: C) -> Result<BulkResult<K, V, C>> {
        if entries.is_empty() {
            let block = Block::encode(&Node::<K, V>::Leaf(Vec::new()))?;
            let root = block.link;
            return Ok(BulkResult {
                tree: Self::load(root, chunker),
                root,
                blocks: vec![block],
            });
        }

        let mut leaves = Self::leaf_writer();
        for (key, value) in entries {
            leaves.push(&chunker, key, value)?;
        }
        leaves.close()?;
        let (level, blocks) = leaves.finish();
        Self::build_branches(level, blocks, chunker)
    }

    /// Stacks branch levels on top of `level` until a single node remains.
    fn build_branches(
        mut level: Vec<(K, Link)>,
        mut blocks: Vec<Block>,
        chunker: C,
    ) -> Result<BulkResult<K, V, C>> {
        // every branch but the last holds at least two children, so each level shrinks
        while level.len() > 1 {
            let mut branches = Self::branch_writer();
            for (key, link) in level {
                branches.push(&chunker, key, link)?;
            }
            branches.close()?;
            let (next, new_blocks) = branches.finish();
            blocks.extend(new_blocks);
            level = next;
        }

        let root = level.first().map(|(_, link)| *link).context("no root")?;
        Ok(BulkResult {
            tree: Self::load(root, chunker),
            root,
            blocks,
        })
    }

    fn leaf_writer() -> LevelWriter<K, V> {
        LevelWriter::new(1, |chunk| Ok(Block::encode(&Node::<K, V>::Leaf(chunk))?))
    }

    fn branch_writer() -> LevelWriter<K, Link> {
        LevelWriter::new(2, |chunk| Ok(Block::encode(&Node::<K, V>::Branch(chunk))?))
    }

    fn leaf_items(node: Node<K, V>) -> Result<Vec<(K, V)>> {
        match node {
            Node::Leaf(entries) => Ok(entries),
            Node::Branch(_) => bail!("expected a leaf node"),
        }
    }

    fn branch_items(node: Node<K, V>) -> Result<Vec<(K, Link)>> {
        match node {
            Node::Branch(children) => Ok(children),
            Node::Leaf(_) => bail!("expected a branch node"),
        }
    }

    pub async fn get<F>(&self, fetcher: &F, key: &K) -> Result<Option<V>>
    where
        F: BlockFetcher + ?Sized,
    {
        let Some(mut link) = self.root else {
            return Ok(None);
        };
        loop {
            match fetch_decoded::<Node<K, V>>(fetcher, &link).await? {
                Node::Leaf(mut entries) => {
                    return Ok(match entries.binary_search_by(|(k, _)| k.cmp(key)) {
                        Ok(i) => Some(entries.swap_remove(i).1),
                        Err(_) => None,
                    });
                }
                Node::Branch(children) => {
                    let idx = children.partition_point(|(k, _)| k <= key);
                    match idx.checked_sub(1).and_then(|i| children.get(i)) {
                        Some((_, child)) => link = *child,
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    pub async fn get_many<F>(&self, fetcher: &F, keys: &[K]) -> Result<Vec<Option<V>>>
    where
        F: BlockFetcher + ?Sized,
    {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(fetcher, key).await?);
        }
        Ok(out)
    }

    /// Entries with keys inside the bounds, in key order.
    pub async fn range<F>(
        &self,
        fetcher: &F,
        lower: Bound<&K>,
        upper: Bound<&K>,
    ) -> Result<Vec<(K, V)>>
    where
        F: BlockFetcher + ?Sized,
    {
        let mut out = Vec::new();
        let Some(root) = self.root else {
            return Ok(out);
        };
        let mut stack = vec![root];
        while let Some(link) = stack.pop() {
            match fetch_decoded::<Node<K, V>>(fetcher, &link).await? {
                Node::Leaf(entries) => {
                    out.extend(
                        entries
                            .into_iter()
                            .filter(|(k, _)| (lower, upper).contains(k)),
                    );
                }
                Node::Branch(children) => {
                    let selected: Vec<Link> = children
                        .iter()
                        .enumerate()
                        .filter(|(i, (first, _))| {
                            let next = children.get(i + 1).map(|(k, _)| k);
                            overlaps(first, next, lower, upper)
                        })
                        .map(|(_, (_, child))| *child)
                        .collect();
                    stack.extend(selected.into_iter().rev());
                }
            }
        }
        Ok(out)
    }

    pub async fn entries<F>(&self, fetcher: &F) -> Result<Vec<(K, V)>>
    where
        F: BlockFetcher + ?Sized,
    {
        self.range(fetcher, Bound::Unbounded, Bound::Unbounded)
            .await
    }

    /// Links of every node in the tree, parents before children.
    pub async fn node_links<F>(&self, fetcher: &F) -> Result<Vec<Link>>
    where
        F: BlockFetcher + ?Sized,
    {
        let mut links = Vec::new();
        let Some(root) = self.root else {
            return Ok(links);
        };
        let mut stack = vec![root];
        while let Some(link) = stack.pop() {
            links.push(link);
            if let Node::Branch(children) = fetch_decoded::<Node<K, V>>(fetcher, &link).await? {
                stack.extend(children.into_iter().rev().map(|(_, child)| child));
            }
        }
        Ok(links)
    }

    /// Applies `ops` in order and returns the new tree.
    ///
    /// Only the nodes whose entries change are loaded and rewritten, together with the
    /// neighbours needed until the chunk boundaries line up with the old tree again, and
    /// the branches above them.
    pub async fn bulk<F>(
        &self,
        fetcher: &F,
        ops: impl IntoIterator<Item = Op<K, V>>,
    ) -> Result<BulkResult<K, V, C>>
    where
        F: BlockFetcher + ?Sized,
    {
        let mut changes = BTreeMap::new();
        for op in ops {
            match op {
                Op::Put(key, value) => changes.insert(key, Some(value)),
                Op::Del(key) => changes.insert(key, None),
            };
        }

        let cursor = match self.root {
            Some(root) => Cursor::open(fetcher, root).await?,
            None => None,
        };
        let Some(mut cursor) = cursor else {
            let entries = changes
                .into_iter()
                .filter_map(|(key, value)| value.map(|value| (key, value)))
                .collect();
            let mut result = Self::build(entries, self.chunker.clone())?;
            result.blocks.retain(|block| Some(block.link) != self.root);
            return Ok(result);
        };
        if changes.is_empty() {
            return Ok(BulkResult {
                tree: self.clone(),
                root: cursor.root,
                blocks: Vec::new(),
            });
        }

        let (mut above, mut blocks) = cursor
            .rewrite(
                0,
                changes,
                &self.chunker,
                Self::leaf_writer(),
                Self::leaf_items,
            )
            .await?;
        for level in 1..=cursor.height {
            let (next, new_blocks) = cursor
                .rewrite(
                    level,
                    above,
                    &self.chunker,
                    Self::branch_writer(),
                    Self::branch_items,
                )
                .await?;
            blocks.extend(new_blocks);
            above = next;
        }

        // the old root is always rewritten, so the puts left are the complete top level
        let top: Vec<(K, Link)> = above
            .into_iter()
            .filter_map(|(key, link)| link.map(|link| (key, link)))
            .collect();
        if top.is_empty() {
            return Self::build(Vec::new(), self.chunker.clone());
        }
        let mut result = Self::build_branches(top, blocks, self.chunker.clone())?;

        // a shrinking tree leaves single child branches above its real root
        loop {
            let node = match result.blocks.iter().find(|block| block.link == result.root) {
                Some(block) => block.decode::<Node<K, V>>()?,
                None => cursor.node(result.root).await?,
            };
            match node {
                Node::Branch(children) if children.len() == 1 => result.root = children[0].1,
                _ => break,
            }
        }
        result.tree = Self::load(result.root, self.chunker.clone());
        result.blocks = reachable::<K, V>(result.root, result.blocks, &cursor.replaced)?;
        Ok(result)
    }
}

/// Groups the items of one tree level into nodes.
struct LevelWriter<K, T> {
    /// Items a node needs before a boundary may close it.
    min_len: usize,
    encode: fn(Vec<(K, T)>) -> Result<Block>,
    chunk: Vec<(K, T)>,
    nodes: Vec<(K, Link)>,
    blocks: Vec<Block>,
}

impl<K: Clone + Serialize, T: Serialize> LevelWriter<K, T> {
    fn new(min_len: usize, encode: fn(Vec<(K, T)>) -> Result<Block>) -> Self {
        Self {
            min_len,
            encode,
            chunk: Vec::new(),
            nodes: Vec::new(),
            blocks: Vec::new(),
        }
    }

    fn push<C: Chunker>(&mut self, chunker: &C, key: K, item: T) -> Result<()> {
        let boundary = chunker.is_boundary(&codec::encode(&(&key, &item))?);
        self.chunk.push((key, item));
        if boundary && self.chunk.len() >= self.min_len {
            self.close()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.chunk.is_empty() {
            return Ok(());
        }
        let first = chunk_start(&self.chunk)?;
        let block = (self.encode)(std::mem::take(&mut self.chunk))?;
        self.nodes.push((first, block.link));
        self.blocks.push(block);
        Ok(())
    }

    /// Whether the last pushed item closed a node.
    fn is_aligned(&self) -> bool {
        self.chunk.is_empty()
    }

    fn finish(self) -> (Vec<(K, Link)>, Vec<Block>) {
        (self.nodes, self.blocks)
    }
}

/// Lazily loaded view of an existing, non-empty tree.
///
/// Levels count up from the leaves at 0 to the root at `height`.
struct Cursor<'a, K, V, F: ?Sized> {
    fetcher: &'a F,
    root: Link,
    root_key: K,
    height: usize,
    nodes: HashMap<Link, Node<K, V>>,
    /// Old nodes that a rewrite replaced.
    replaced: HashSet<Link>,
}

impl<'a, K, V, F> Cursor<'a, K, V, F>
where
    K: Ord + Clone + Serialize + DeserializeOwned + Send + Sync,
    V: Clone + Serialize + DeserializeOwned + Send + Sync,
    F: BlockFetcher + ?Sized,
{
    async fn open(fetcher: &'a F, root: Link) -> Result<Option<Self>> {
        let node: Node<K, V> = fetch_decoded(fetcher, &root).await?;
        let root_key = match &node {
            Node::Leaf(entries) => match entries.first() {
                Some((key, _)) => key.clone(),
                None => return Ok(None),
            },
            Node::Branch(children) => chunk_start(children)?,
        };
        let mut cursor = Self {
            fetcher,
            root,
            root_key,
            height: 0,
            nodes: HashMap::from([(root, node)]),
            replaced: HashSet::new(),
        };
        let mut link = root;
        while let Node::Branch(children) = cursor.node(link).await? {
            link = children.first().map(|(_, child)| *child).context("empty branch")?;
            cursor.height += 1;
        }
        Ok(Some(cursor))
    }

    async fn node(&mut self, link: Link) -> Result<Node<K, V>> {
        if let Some(node) = self.nodes.get(&link) {
            return Ok(node.clone());
        }
        let node: Node<K, V> = fetch_decoded(self.fetcher, &link).await?;
        self.nodes.insert(link, node.clone());
        Ok(node)
    }

    async fn children(&mut self, link: Link) -> Result<Vec<(K, Link)>> {
        match self.node(link).await? {
            Node::Branch(children) if !children.is_empty() => Ok(children),
            _ => bail!("expected a branch node at {link}"),
        }
    }

    /// The node at `level` whose key range holds `key`.
    async fn containing(&mut self, level: usize, key: &K) -> Result<(K, Link)> {
        let mut found = (self.root_key.clone(), self.root);
        for _ in level..self.height {
            let children = self.children(found.1).await?;
            let idx = children.partition_point(|(k, _)| k <= key).saturating_sub(1);
            found = children[idx].clone();
        }
        Ok(found)
    }

    /// The node at `level` right after the one starting at `key`.
    async fn after(&mut self, level: usize, key: &K) -> Result<Option<(K, Link)>> {
        let mut link = self.root;
        let mut next = None;
        for current in (level + 1..=self.height).rev() {
            let children = self.children(link).await?;
            let idx = children.partition_point(|(k, _)| k <= key).saturating_sub(1);
            if let Some(sibling) = children.get(idx + 1) {
                next = Some((current - 1, sibling.clone()));
            }
            link = children[idx].1;
        }
        let Some((mut at, mut found)) = next else {
            return Ok(None);
        };
        while at > level {
            let children = self.children(found.1).await?;
            found = children[0].clone();
            at -= 1;
        }
        Ok(Some(found))
    }

    /// Re-chunks the nodes at `level` that `changes` touch and returns the changes for the
    /// level above: the replaced nodes as deletes and the new nodes as puts.
    ///
    /// A run of rewritten nodes ends once a node closes exactly where an old node ended,
    /// from there on the old nodes are kept.
    async fn rewrite<T, C>(
        &mut self,
        level: usize,
        changes: BTreeMap<K, Option<T>>,
        chunker: &C,
        mut writer: LevelWriter<K, T>,
        items: fn(Node<K, V>) -> Result<Vec<(K, T)>>,
    ) -> Result<(BTreeMap<K, Option<Link>>, Vec<Block>)>
    where
        T: Serialize + Send + Sync,
        C: Chunker,
    {
        let mut above = BTreeMap::new();
        let mut pending = changes.into_iter().peekable();
        while let Some(start) = pending.peek().map(|(key, _)| key.clone()) {
            let mut current = Some(self.containing(level, &start).await?);
            while let Some((key, link)) = current.take() {
                let next = self.after(level, &key).await?;
                above.insert(key, None);
                self.replaced.insert(link);

                let mut merged: BTreeMap<K, Option<T>> = items(self.node(link).await?)?
                    .into_iter()
                    .map(|(key, item)| (key, Some(item)))
                    .collect();
                while let Some((key, change)) = pending
                    .next_if(|(key, _)| next.as_ref().map_or(true, |(first, _)| key < first))
                {
                    merged.insert(key, change);
                }
                for (key, item) in merged {
                    if let Some(item) = item {
                        writer.push(chunker, key, item)?;
                    }
                }

                match next {
                    None => writer.close()?,
                    Some(next) if !writer.is_aligned() => current = Some(next),
                    Some(_) => {}
                }
            }
        }
        let (nodes, blocks) = writer.finish();
        above.extend(nodes.into_iter().map(|(key, link)| (key, Some(link))));
        Ok((above, blocks))
    }
}

/// The blocks reachable from `root`, minus those the old tree already had.
fn reachable<K, V>(root: Link, blocks: Vec<Block>, old: &HashSet<Link>) -> Result<Vec<Block>>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    let mut by_link: HashMap<Link, Block> =
        blocks.into_iter().map(|block| (block.link, block)).collect();
    let mut kept = Vec::new();
    let mut stack = vec![root];
    while let Some(link) = stack.pop() {
        let Some(block) = by_link.remove(&link) else {
            continue;
        };
        if let Node::Branch(children) = block.decode::<Node<K, V>>()? {
            stack.extend(children.into_iter().map(|(_, child)| child));
        }
        if !old.contains(&link) {
            kept.push(block);
        }
    }
    Ok(kept)
}

fn chunk_start<K: Clone, T>(chunk: &[(K, T)]) -> Result<K> {
    chunk.first().map(|(k, _)| k.clone()).context("empty chunk")
}

fn overlaps<K: Ord>(first: &K, next: Option<&K>, lower: Bound<&K>, upper: Bound<&K>) -> bool {
    let below_upper = match upper {
        Bound::Included(hi) => first <= hi,
        Bound::Excluded(hi) => first < hi,
        Bound::Unbounded => true,
    };
    let above_lower = match (next, lower) {
        (None, _) | (_, Bound::Unbounded) => true,
        (Some(next), Bound::Included(lo) | Bound::Excluded(lo)) => next > lo,
    };
    below_upper && above_lower
}
