use std::ops::{Bound, RangeBounds};

use crate::{bytes::Bytes, error::Error, node::Node, repr::PageId, store::PageStore, tree::Tree};

/// Key value pairs iterator
///
/// Yields entries in ascending key order. Pages are fetched lazily from the
/// host while iterating, so host failures surface as `Err` items.
pub struct RangeIter<'tree, S: PageStore> {
    cursor: Cursor<'tree, S>,
    end: Bound<Vec<u8>>,
    started: bool,
    exhausted: bool,
}

impl<S: PageStore> std::fmt::Debug for RangeIter<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeIter")
            .field("depth", &self.cursor.stack.len())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl<'tree, S: PageStore> RangeIter<'tree, S> {
    pub(crate) fn new<K: AsRef<[u8]>>(
        tree: &'tree Tree<S>,
        bounds: impl RangeBounds<K>,
    ) -> Result<Self, Error> {
        let mut cursor = Cursor::new(tree);
        match bounds.start_bound() {
            Bound::Unbounded => cursor.first()?,
            Bound::Included(b) => {
                cursor.seek(b.as_ref())?;
            }
            Bound::Excluded(b) => {
                if cursor.seek(b.as_ref())? {
                    cursor.next()?;
                }
            }
        }
        // the sentinel entry is not part of the user's key space
        if cursor.peek_key().is_some_and(|k| k.is_empty()) {
            cursor.next()?;
        }
        let end = match bounds.end_bound() {
            Bound::Unbounded => Bound::Unbounded,
            Bound::Included(b) => Bound::Included(b.as_ref().to_vec()),
            Bound::Excluded(b) => Bound::Excluded(b.as_ref().to_vec()),
        };
        Ok(Self {
            cursor,
            end,
            started: false,
            exhausted: false,
        })
    }
}

impl<S: PageStore> Iterator for RangeIter<'_, S> {
    type Item = Result<(Bytes, Bytes), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        if self.started {
            if let Err(e) = self.cursor.next() {
                self.exhausted = true;
                return Some(Err(e));
            }
        } else {
            self.started = true;
        }
        let Some((key, value)) = self.cursor.peek() else {
            self.exhausted = true;
            return None;
        };
        let in_range = match &self.end {
            Bound::Unbounded => true,
            Bound::Included(end) => key.as_ref() <= end.as_slice(),
            Bound::Excluded(end) => key.as_ref() < end.as_slice(),
        };
        if !in_range {
            self.exhausted = true;
            return None;
        }
        Some(Ok((key, value)))
    }
}

/// Walks the tree keeping the path from the root to the current entry as a
/// stack of (node, entry index) pairs.
pub(crate) struct Cursor<'tree, S: PageStore> {
    tree: &'tree Tree<S>,
    stack: Vec<(Node, usize)>,
}

impl<'tree, S: PageStore> Cursor<'tree, S> {
    pub(crate) fn new(tree: &'tree Tree<S>) -> Self {
        Cursor {
            tree,
            stack: Vec::new(),
        }
    }

    /// Positions at the first entry of the tree, or exhausts if empty.
    pub fn first(&mut self) -> Result<(), Error> {
        self.stack.clear();
        if self.tree.root() == 0 {
            return Ok(());
        }
        self.descend_first(self.tree.root())
    }

    /// Positions at the first entry `>= key`. Returns whether the entry is
    /// an exact match.
    pub fn seek(&mut self, key: &[u8]) -> Result<bool, Error> {
        self.stack.clear();
        if self.tree.root() == 0 {
            return Ok(false);
        }
        let mut page_id = self.tree.root();
        loop {
            let node = self.tree.fetch_node(page_id)?;
            let view = node.view();
            let idx = view.lookup_le(key);
            if view.is_leaf() {
                let exact = view.key(idx) == key;
                self.stack.push((node, idx));
                if !exact {
                    // lookup_le lands on the last entry <= key, the first
                    // entry of the range is the one after it
                    self.next()?;
                }
                return Ok(exact);
            }
            let child = view.ptr(idx);
            self.stack.push((node, idx));
            page_id = child;
        }
    }

    /// Advances to the next entry; exhausts past the last one.
    pub fn next(&mut self) -> Result<(), Error> {
        let mut descend_from = None;
        while let Some((node, idx)) = self.stack.last_mut() {
            let view = node.view();
            if *idx + 1 < view.nkeys() {
                *idx += 1;
                if view.is_leaf() {
                    return Ok(());
                }
                descend_from = Some(view.ptr(*idx));
                break;
            }
            self.stack.pop();
        }
        match descend_from {
            Some(page_id) => self.descend_first(page_id),
            None => Ok(()),
        }
    }

    pub fn peek(&self) -> Option<(Bytes, Bytes)> {
        let (node, idx) = self.stack.last()?;
        debug_assert!(node.view().is_leaf());
        Some((node.key_bytes(*idx), node.val_bytes(*idx)))
    }

    pub fn peek_key(&self) -> Option<Bytes> {
        let (node, idx) = self.stack.last()?;
        Some(node.key_bytes(*idx))
    }

    fn descend_first(&mut self, mut page_id: PageId) -> Result<(), Error> {
        loop {
            let node = self.tree.fetch_node(page_id)?;
            let view = node.view();
            if view.is_leaf() {
                self.stack.push((node, 0));
                return Ok(());
            }
            let child = view.ptr(0);
            self.stack.push((node, 0));
            page_id = child;
        }
    }
}
