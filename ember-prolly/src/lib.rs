//! Prolly trees: sorted maps stored as content addressed blocks.
//!
//! Node boundaries are chosen from the content of the entries, so the same set of entries
//! always produces the same blocks and the same root, regardless of insertion history.
//! Trees are immutable values. Every mutation returns a new root plus the blocks that the
//! old tree did not already contain.

mod chunker;
mod tree;

pub use crate::{
    chunker::{Chunker, HashChunker},
    tree::{BulkResult, Node, Op, ProllyTree},
};
