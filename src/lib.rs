//! Cache-line-aware hash maps with interoperable typed and type-erased APIs.
//!
//! [`CellMap`] is an open-addressed Robin Hood hash table whose keys, values
//! and hash words live in three separately *cell-packed* segments: every slot
//! is naturally aligned and no slot ever straddles a cache line, so probing
//! touches the minimum number of lines and two distinct slots never share one
//! unless they share a cell. Deletion is tombstone-based, the load factor is
//! bounded at 75%, and capacity (always a power of two, at least 64) is
//! encoded in the low bits of the allocation's cache-line-aligned base
//! address.
//!
//! The same in-memory layout is served by two APIs:
//!
//! - the **typed** surface, [`CellMap<K, V>`], where the descriptor is a
//!   compile-time constant and everything inlines, and
//! - the **type-erased** core, [`RawMap`], driven by a runtime [`MapInfo`]
//!   descriptor (cell packings plus hash and equality function pointers) for
//!   callers whose key and value types are only known at runtime.
//!
//! Both may be used interchangeably on a single map instance.
//!
//! Keys and values are stored bytewise and never dropped by the container,
//! so the typed surface requires `Copy` types; keys additionally implement
//! [`MapKey`], which hashes their bytes with the [`fnv`] family by default.
//!
//! # Examples
//!
//! ```
//! use cellmap::CellMap;
//!
//! let mut map: CellMap<u64, u64> = CellMap::new();
//! for i in 0..100 {
//!     map.insert(i, i * i);
//! }
//! assert_eq!(map.len(), 100);
//! assert_eq!(map.get(&7), Some(&49));
//!
//! map.remove(&7);
//! assert!(!map.contains_key(&7));
//! ```

#![warn(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

pub mod fnv;
mod map;
pub mod raw;

pub use crate::map::{CellMap, MapKey};
pub use crate::raw::{AllocError, Allocator, CellInfo, Global, MapInfo, RawMap, CACHE_LINE_SIZE};

use core::alloc::Layout;
use core::fmt;

/// The error returned by the fallible allocating operations.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TryReserveError {
    /// The computed table size exceeded what the implementation can hold:
    /// a capacity exponent above 63, or an allocation above `isize::MAX`
    /// bytes.
    CapacityOverflow,

    /// The memory allocator returned an error.
    AllocError {
        /// The layout of the allocation request that failed.
        layout: Layout,
    },
}

impl fmt::Display for TryReserveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryReserveError::CapacityOverflow => {
                write!(f, "requested capacity exceeds the maximum table size")
            }
            TryReserveError::AllocError { layout } => write!(
                f,
                "the allocator could not provide {} bytes",
                layout.size()
            ),
        }
    }
}

impl std::error::Error for TryReserveError {}
