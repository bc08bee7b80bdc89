use crate::{
    error::{error_corrupted, Error},
    repr::{PageBuf, PageId},
    HashMap,
};

/// Page storage contract between the tree and its host.
///
/// The tree drives these three callbacks for every mutation and never
/// mutates a page after handing it to [PageStore::allocate]. The host is
/// free to back them with a file, a page cache or plain memory; it is also
/// responsible for making a mutation's allocations and frees durable
/// together with the new root (the tree only swaps its root after the full
/// chain has been allocated).
pub trait PageStore {
    /// Returns the exact bytes previously allocated under `id`.
    fn fetch(&self, id: PageId) -> Result<PageBuf, Error>;

    /// Stores a page and returns its new nonzero page number.
    fn allocate(&mut self, page: PageBuf) -> Result<PageId, Error>;

    /// Releases a page number. Called at most once per page per mutation.
    fn free(&mut self, id: PageId) -> Result<(), Error>;
}

/// In-memory [PageStore] for tests and throw-away trees.
///
/// Page numbers are handed out monotonically and freed pages are dropped
/// immediately; there is no free-list reuse.
#[derive(Debug, Default)]
pub struct MemStore {
    pages: HashMap<PageId, PageBuf>,
    next_id: PageId,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (allocated and not freed) pages.
    #[inline]
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }
}

impl PageStore for MemStore {
    fn fetch(&self, id: PageId) -> Result<PageBuf, Error> {
        self.pages
            .get(&id)
            .cloned()
            .ok_or_else(|| error_corrupted!("fetch of unallocated page {id}"))
    }

    fn allocate(&mut self, page: PageBuf) -> Result<PageId, Error> {
        self.next_id += 1;
        self.pages.insert(self.next_id, page);
        Ok(self.next_id)
    }

    fn free(&mut self, id: PageId) -> Result<(), Error> {
        if self.pages.remove(&id).is_none() {
            return Err(error_corrupted!("free of unallocated page {id}"));
        }
        Ok(())
    }
}
