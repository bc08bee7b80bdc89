use std::mem::size_of;

use triomphe::Arc;
use zerocopy::{
    little_endian::{U16, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout, Ref, Unaligned,
};

use crate::PAGE_SIZE;

/// Opaque page number handed out by the host. Page 0 means "no page".
pub type PageId = u64;

/// A committed page: exactly [PAGE_SIZE] immutable bytes.
pub type PageBuf = Arc<[u8; PAGE_SIZE]>;

pub(crate) const NODE_LEAF: u16 = 1;
pub(crate) const NODE_INNER: u16 = 2;

/// On-page node header. All multi-byte fields are little-endian.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct NodeHeader {
    pub kind: U16,
    pub num_keys: U16,
}

/// Per-entry length prefix inside the kv region.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct PairHeader {
    pub klen: U16,
    pub vlen: U16,
}

pub(crate) const NODE_HEADER_SIZE: usize = size_of::<NodeHeader>();
pub(crate) const PAIR_HEADER_SIZE: usize = size_of::<PairHeader>();

/// Per-entry cost in the pointer and offset arrays.
pub(crate) const ENTRY_HEAD_SIZE: usize = size_of::<U64>() + size_of::<U16>();

/// Cast the start of a node buffer to a header
#[inline(always)]
pub(crate) fn header_cast<T>(data: &[u8]) -> &T
where
    T: FromBytes + IntoBytes + KnownLayout + Immutable + Unaligned,
{
    Ref::into_ref(Ref::<_, T>::from_bytes(&data[..size_of::<T>()]).unwrap())
}

#[inline(always)]
pub(crate) fn header_cast_mut<T>(data: &mut [u8]) -> &mut T
where
    T: FromBytes + IntoBytes + KnownLayout + Immutable + Unaligned,
{
    Ref::into_mut(Ref::<_, T>::from_bytes(&mut data[..size_of::<T>()]).unwrap())
}
