//! Copy-on-write B+tree index over fixed-size pages.
//!
//! Coppice maps byte-string keys to byte-string values and persists its
//! nodes as 4KB pages addressed by opaque 64-bit page numbers. It is the
//! ordering core of a key-value storage engine: the host supplies page
//! storage through the [PageStore] callbacks (`fetch`/`allocate`/`free`)
//! and the tree supplies ordered insert/get/delete plus range iteration
//! on top of them.
//!
//! Every mutation is copy-on-write: the affected pages are rebuilt bottom
//! up into fresh buffers, oversized nodes are split into 1-3 page-sized
//! successors, and the old chain is freed once the new root is in place.
//! Committed pages are never modified.
//!
//! ```
//! use coppice::{MemStore, Tree};
//!
//! let mut tree = Tree::new(MemStore::new());
//! tree.insert(b"apple", b"red")?;
//! tree.insert(b"banana", b"yellow")?;
//! assert_eq!(tree.get(b"apple")?.as_deref(), Some(&b"red"[..]));
//! assert!(tree.get(b"cherry")?.is_none());
//! assert!(tree.delete(b"apple")?);
//! # Ok::<(), coppice::Error>(())
//! ```
//!
//! Durability, free-list management, transactions and crash recovery are
//! the host's concern; [MemStore] is an in-memory host suitable for tests
//! and throw-away trees.
#![warn(clippy::all)]

#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate log;

mod bytes;
mod cursor;
mod error;
mod node;
mod repr;
mod store;
mod tree;
mod utils;

#[cfg(test)]
mod tests;

pub use crate::{
    bytes::Bytes,
    cursor::RangeIter,
    error::Error,
    repr::{PageBuf, PageId},
    store::{MemStore, PageStore},
    tree::Tree,
};

/// Size in bytes of a committed page.
pub const PAGE_SIZE: usize = 4096;
/// Max key length in bytes.
pub const MAX_KEY_SIZE: usize = 1000;
/// Max value length in bytes.
pub const MAX_VALUE_SIZE: usize = 3000;

pub(crate) type HashMap<K, V> = hashbrown::HashMap<K, V>;
