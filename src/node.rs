use std::ops::Range;

use smallvec::SmallVec;
use triomphe::Arc;
use zerocopy::{
    little_endian::{U16, U64},
    IntoBytes, Ref,
};

use crate::{
    bytes::Bytes,
    error::{error_corrupted, Error},
    repr::{
        header_cast, header_cast_mut, NodeHeader, PageBuf, PageId, PairHeader, ENTRY_HEAD_SIZE,
        NODE_HEADER_SIZE, NODE_INNER, NODE_LEAF, PAIR_HEADER_SIZE,
    },
    utils::EscapedBytes,
    MAX_KEY_SIZE, MAX_VALUE_SIZE, PAGE_SIZE,
};

/// Borrowed read-only view over the bytes of one node.
///
/// Works over committed pages as well as transient oversized buffers, the
/// accessors only assume the layout invariants. Out-of-range entry indexes
/// are programmer errors and panic.
#[derive(Clone, Copy)]
pub(crate) struct NodeRef<'a> {
    data: &'a [u8],
}

impl<'a> NodeRef<'a> {
    #[inline]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    #[inline]
    fn header(&self) -> &'a NodeHeader {
        header_cast(self.data)
    }

    #[inline]
    pub fn kind(&self) -> u16 {
        self.header().kind.get()
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.kind() == NODE_LEAF
    }

    #[inline]
    pub fn is_inner(&self) -> bool {
        self.kind() == NODE_INNER
    }

    #[inline]
    pub fn nkeys(&self) -> usize {
        self.header().num_keys.get() as usize
    }

    #[inline]
    fn ptrs(&self) -> &'a [U64] {
        let n = self.nkeys();
        Ref::into_ref(
            Ref::<_, [U64]>::from_bytes(&self.data[NODE_HEADER_SIZE..][..8 * n]).unwrap(),
        )
    }

    #[inline]
    fn offs(&self) -> &'a [U16] {
        let n = self.nkeys();
        Ref::into_ref(
            Ref::<_, [U16]>::from_bytes(&self.data[NODE_HEADER_SIZE + 8 * n..][..2 * n]).unwrap(),
        )
    }

    /// Child page number of entry `i`. Always 0 in a leaf.
    #[inline]
    pub fn ptr(&self, i: usize) -> PageId {
        self.ptrs()[i].get()
    }

    /// Byte offset of the end of entry `i - 1` relative to the kv region.
    /// `off(0)` is implicitly 0.
    #[inline]
    pub fn off(&self, i: usize) -> usize {
        if i == 0 {
            0
        } else {
            self.offs()[i - 1].get() as usize
        }
    }

    /// Position of entry `i` in the buffer, valid for `0 <= i <= nkeys`.
    #[inline]
    pub fn kv_pos(&self, i: usize) -> usize {
        debug_assert!(i <= self.nkeys());
        NODE_HEADER_SIZE + ENTRY_HEAD_SIZE * self.nkeys() + self.off(i)
    }

    #[inline]
    fn pair_header(&self, i: usize) -> &'a PairHeader {
        debug_assert!(i < self.nkeys());
        header_cast(&self.data[self.kv_pos(i)..])
    }

    #[inline]
    pub fn key_range(&self, i: usize) -> Range<usize> {
        let start = self.kv_pos(i) + PAIR_HEADER_SIZE;
        start..start + self.pair_header(i).klen.get() as usize
    }

    #[inline]
    pub fn val_range(&self, i: usize) -> Range<usize> {
        let ph = self.pair_header(i);
        let start = self.kv_pos(i) + PAIR_HEADER_SIZE + ph.klen.get() as usize;
        start..start + ph.vlen.get() as usize
    }

    #[inline]
    pub fn key(&self, i: usize) -> &'a [u8] {
        &self.data[self.key_range(i)]
    }

    #[inline]
    pub fn val(&self, i: usize) -> &'a [u8] {
        &self.data[self.val_range(i)]
    }

    /// Total node size in bytes.
    #[inline]
    pub fn nbytes(&self) -> usize {
        self.kv_pos(self.nkeys())
    }

    /// Greatest `i` such that `key(i) <= search_key` under byte order.
    ///
    /// Total because entry 0 is the sentinel: its key compares less than or
    /// equal to every possible search key on the path that reaches it.
    pub fn lookup_le(&self, search_key: &[u8]) -> usize {
        let mut lo = 0;
        let mut hi = self.nkeys();
        // loop invariant: key(lo) <= search_key < key(hi)
        while lo + 1 < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key(mid) <= search_key {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

/// Checks that `data` decodes as a structurally valid node: known kind,
/// consistent offset chain, entries in bounds and within length limits.
/// Key ordering is not verified here, lookups don't depend on it for
/// memory safety.
pub(crate) fn validate_node(data: &[u8]) -> Result<(), Error> {
    let header = header_cast::<NodeHeader>(data);
    let kind = header.kind.get();
    if kind != NODE_LEAF && kind != NODE_INNER {
        return Err(error_corrupted!("unknown node kind {kind}"));
    }
    let n = header.num_keys.get() as usize;
    if n == 0 {
        return Err(error_corrupted!("node with zero entries"));
    }
    let kv_base = NODE_HEADER_SIZE + ENTRY_HEAD_SIZE * n;
    if kv_base > data.len() {
        return Err(error_corrupted!("entry arrays exceed the page ({n} entries)"));
    }
    let node = NodeRef::new(data);
    for i in 0..n {
        let pos = kv_base + node.off(i);
        if pos + PAIR_HEADER_SIZE > data.len() {
            return Err(error_corrupted!("entry {i} header out of bounds"));
        }
        let ph = header_cast::<PairHeader>(&data[pos..]);
        let (klen, vlen) = (ph.klen.get() as usize, ph.vlen.get() as usize);
        if klen > MAX_KEY_SIZE || vlen > MAX_VALUE_SIZE {
            return Err(error_corrupted!("entry {i} lengths out of range ({klen}/{vlen})"));
        }
        let end = node.off(i) + PAIR_HEADER_SIZE + klen + vlen;
        if node.off(i + 1) != end {
            return Err(error_corrupted!("broken offset chain at entry {i}"));
        }
        if kv_base + end > data.len() {
            return Err(error_corrupted!("entry {i} data out of bounds"));
        }
        match kind {
            NODE_LEAF if node.ptr(i) != 0 => {
                return Err(error_corrupted!("leaf entry {i} carries a child pointer"));
            }
            NODE_INNER if node.ptr(i) == 0 => {
                return Err(error_corrupted!("inner entry {i} has no child pointer"));
            }
            _ => (),
        }
    }
    Ok(())
}

/// A committed node: an immutable page plus the page number it lives under.
pub(crate) struct Node {
    id: PageId,
    page: PageBuf,
}

impl Node {
    pub fn from_page(id: PageId, page: PageBuf) -> Result<Self, Error> {
        validate_node(&page[..])?;
        Ok(Self { id, page })
    }

    #[inline]
    pub fn id(&self) -> PageId {
        self.id
    }

    #[inline]
    pub fn view(&self) -> NodeRef<'_> {
        NodeRef::new(&self.page[..])
    }

    #[inline]
    pub fn key_bytes(&self, i: usize) -> Bytes {
        Bytes::from_page(self.page.clone(), self.view().key_range(i))
    }

    #[inline]
    pub fn val_bytes(&self, i: usize) -> Bytes {
        Bytes::from_page(self.page.clone(), self.view().val_range(i))
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let node = self.view();
        let mut df = f.debug_struct("Node");
        df.field("id", &self.id);
        df.field("kind", &node.kind());
        for i in 0..node.nkeys() {
            if node.is_leaf() {
                df.field(
                    &format!("kv {i}"),
                    &(EscapedBytes(node.key(i)), EscapedBytes(node.val(i))),
                );
            } else {
                df.field(&format!("kp {i}"), &(EscapedBytes(node.key(i)), node.ptr(i)));
            }
        }
        df.finish()
    }
}

/// Destination buffer for building a fresh node one entry at a time.
///
/// Built with the final entry count in the header up front; entries must
/// then be appended in index order, which keeps the offset chain correct.
/// Scratch buffers are twice the page size so the insert path can
/// materialize a transiently oversized node before splitting it.
pub(crate) struct NodeBuf {
    buf: Vec<u8>,
}

impl NodeBuf {
    pub fn scratch() -> Self {
        Self {
            buf: vec![0; 2 * PAGE_SIZE],
        }
    }

    pub fn page() -> Self {
        Self {
            buf: vec![0; PAGE_SIZE],
        }
    }

    #[inline]
    pub fn view(&self) -> NodeRef<'_> {
        NodeRef::new(&self.buf)
    }

    pub fn set_header(&mut self, kind: u16, nkeys: usize) {
        debug_assert!(kind == NODE_LEAF || kind == NODE_INNER);
        let header = header_cast_mut::<NodeHeader>(&mut self.buf);
        header.kind = U16::new(kind);
        header.num_keys = U16::new(nkeys as u16);
    }

    #[inline]
    fn set_ptr(&mut self, i: usize, ptr: PageId) {
        debug_assert!(i < self.view().nkeys());
        let pos = NODE_HEADER_SIZE + 8 * i;
        self.buf[pos..pos + 8].copy_from_slice(U64::new(ptr).as_bytes());
    }

    #[inline]
    fn set_off(&mut self, i: usize, off: usize) {
        debug_assert!(i >= 1 && i <= self.view().nkeys());
        let pos = NODE_HEADER_SIZE + 8 * self.view().nkeys() + 2 * (i - 1);
        self.buf[pos..pos + 2].copy_from_slice(U16::new(off as u16).as_bytes());
    }

    /// Appends entry `idx`. Entries `0..idx` must already be in place.
    pub fn append_kv(&mut self, idx: usize, ptr: PageId, key: &[u8], val: &[u8]) {
        debug_assert!(key.len() <= MAX_KEY_SIZE && val.len() <= MAX_VALUE_SIZE);
        self.set_ptr(idx, ptr);
        let pos = self.view().kv_pos(idx);
        let klen = key.len();
        let end = pos + PAIR_HEADER_SIZE + klen + val.len();
        debug_assert!(end <= self.buf.len());
        self.buf[pos..pos + 2].copy_from_slice(U16::new(klen as u16).as_bytes());
        self.buf[pos + 2..pos + 4].copy_from_slice(U16::new(val.len() as u16).as_bytes());
        self.buf[pos + 4..pos + 4 + klen].copy_from_slice(key);
        self.buf[pos + 4 + klen..end].copy_from_slice(val);
        let next_off = self.view().off(idx) + PAIR_HEADER_SIZE + klen + val.len();
        self.set_off(idx + 1, next_off);
    }

    /// Copies `n` consecutive entries from `src` starting at `src_idx` into
    /// `self` starting at `dst_idx`, preserving pointers.
    pub fn append_range(&mut self, src: NodeRef<'_>, dst_idx: usize, src_idx: usize, n: usize) {
        for i in 0..n {
            self.append_kv(
                dst_idx + i,
                src.ptr(src_idx + i),
                src.key(src_idx + i),
                src.val(src_idx + i),
            );
        }
    }

    /// Freezes the buffer into a committed page image.
    /// The node must fit, splitting oversized nodes is the caller's job.
    pub fn into_page(self) -> PageBuf {
        let nbytes = self.view().nbytes();
        assert!(nbytes <= PAGE_SIZE, "node does not fit a page ({nbytes} bytes)");
        let mut page = [0u8; PAGE_SIZE];
        page.copy_from_slice(&self.buf[..PAGE_SIZE]);
        Arc::new(page)
    }
}

impl std::fmt::Debug for NodeBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let node = self.view();
        f.debug_struct("NodeBuf")
            .field("kind", &node.kind())
            .field("nkeys", &node.nkeys())
            .field("nbytes", &node.nbytes())
            .finish()
    }
}

/// Rebuilds `old` with `(key, val)` inserted at position `idx`.
pub(crate) fn leaf_insert(old: NodeRef<'_>, idx: usize, key: &[u8], val: &[u8]) -> NodeBuf {
    let mut new = NodeBuf::scratch();
    new.set_header(NODE_LEAF, old.nkeys() + 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, 0, key, val);
    new.append_range(old, idx + 1, idx, old.nkeys() - idx);
    new
}

/// Rebuilds `old` with the value of entry `idx` replaced.
pub(crate) fn leaf_update(old: NodeRef<'_>, idx: usize, key: &[u8], val: &[u8]) -> NodeBuf {
    debug_assert_eq!(old.key(idx), key);
    let mut new = NodeBuf::scratch();
    new.set_header(NODE_LEAF, old.nkeys());
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, 0, key, val);
    new.append_range(old, idx + 1, idx + 1, old.nkeys() - idx - 1);
    new
}

/// Rebuilds `old` without entry `idx`.
pub(crate) fn leaf_delete(old: NodeRef<'_>, idx: usize) -> NodeBuf {
    let mut new = NodeBuf::page();
    new.set_header(NODE_LEAF, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_range(old, idx, idx + 1, old.nkeys() - idx - 1);
    new
}

/// Rebuilds the inner node `old` with entry `idx` replaced by one entry per
/// child in `kids`, each carrying the child's page number and first key.
/// This is how child splits propagate upward.
pub(crate) fn node_replace_kid_n(
    old: NodeRef<'_>,
    idx: usize,
    kids: &[(PageId, &[u8])],
) -> NodeBuf {
    let mut new = NodeBuf::scratch();
    new.set_header(NODE_INNER, old.nkeys() + kids.len() - 1);
    new.append_range(old, 0, 0, idx);
    for (i, (kid, first_key)) in kids.iter().enumerate() {
        new.append_kv(idx + i, *kid, first_key, b"");
    }
    new.append_range(old, idx + kids.len(), idx + 1, old.nkeys() - idx - 1);
    new
}

/// Rebuilds the inner node `old` with entries `idx` and `idx + 1` replaced
/// by a single entry for the merged child. The result can outgrow a page
/// when the merged child's first key is longer than the separator it
/// replaces, so it gets a scratch buffer.
pub(crate) fn node_replace_2_kid(
    old: NodeRef<'_>,
    idx: usize,
    merged: PageId,
    first_key: &[u8],
) -> NodeBuf {
    let mut new = NodeBuf::scratch();
    new.set_header(NODE_INNER, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, merged, first_key, b"");
    new.append_range(old, idx + 1, idx + 2, old.nkeys() - idx - 2);
    new
}

/// Concatenates two siblings into one node. The caller is responsible for
/// checking that the result fits in a page.
pub(crate) fn node_merge(left: NodeRef<'_>, right: NodeRef<'_>) -> NodeBuf {
    debug_assert_eq!(left.kind(), right.kind());
    let mut new = NodeBuf::page();
    new.set_header(left.kind(), left.nkeys() + right.nkeys());
    new.append_range(left, 0, 0, left.nkeys());
    new.append_range(right, left.nkeys(), 0, right.nkeys());
    new
}

/// Splits `old` in two on an entry boundary around the midpoint. The right
/// half always fits in a page; the left half may still be oversized and is
/// given a scratch buffer, `node_split_3` re-splits it if needed.
pub(crate) fn node_split_2(old: NodeRef<'_>) -> (NodeBuf, NodeBuf) {
    let n = old.nkeys();
    debug_assert!(n >= 2);
    let left_bytes = |nl: usize| NODE_HEADER_SIZE + ENTRY_HEAD_SIZE * nl + old.off(nl);
    let right_bytes = |nl: usize| old.nbytes() - left_bytes(nl) + NODE_HEADER_SIZE;
    let mut n_left = n / 2;
    while left_bytes(n_left) > PAGE_SIZE {
        n_left -= 1;
    }
    debug_assert!(n_left >= 1);
    while right_bytes(n_left) > PAGE_SIZE {
        n_left += 1;
    }
    debug_assert!(n_left < n);

    let mut left = NodeBuf::scratch();
    left.set_header(old.kind(), n_left);
    left.append_range(old, 0, 0, n_left);
    let mut right = NodeBuf::page();
    right.set_header(old.kind(), n - n_left);
    right.append_range(old, 0, n_left, n - n_left);
    debug_assert!(right.view().nbytes() <= PAGE_SIZE);
    (left, right)
}

/// Splits a possibly oversized node into 1-3 page-sized nodes, preserving
/// the order and the exact entry contents of the input.
pub(crate) fn node_split_3(old: NodeBuf) -> SmallVec<[NodeBuf; 3]> {
    let mut parts = SmallVec::new();
    if old.view().nbytes() <= PAGE_SIZE {
        parts.push(old);
        return parts;
    }
    let (left, right) = node_split_2(old.view());
    if left.view().nbytes() <= PAGE_SIZE {
        trace!("split node into 2 ({} / {} keys)", left.view().nkeys(), right.view().nkeys());
        parts.push(left);
        parts.push(right);
        return parts;
    }
    // One insertion can only overflow a page's worth of bytes, but a child
    // pointer update may replace one entry with up to three, so the left
    // half of the first split can itself exceed a page once more.
    let (left_left, middle) = node_split_2(left.view());
    debug_assert!(left_left.view().nbytes() <= PAGE_SIZE);
    trace!(
        "split node into 3 ({} / {} / {} keys)",
        left_left.view().nkeys(),
        middle.view().nkeys(),
        right.view().nkeys()
    );
    parts.push(left_left);
    parts.push(middle);
    parts.push(right);
    parts
}
