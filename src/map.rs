#[cfg(test)]
mod tests_cell_map;

use crate::fnv;
use crate::raw::{Allocator, CellInfo, Global, MapInfo, RawMap};
use crate::TryReserveError;
use core::ffi::CStr;
use core::fmt::{self, Debug};
use core::marker::PhantomData;

/// A key type usable with the typed [`CellMap`] surface.
///
/// The trait supplies the hash half of the table's key protocol; equality
/// comes from the `PartialEq` bound. The `Copy` bound encodes the table's
/// storage model: keys are copied into the table bytewise and never dropped,
/// so only trivially copyable keys are admissible.
///
/// Implementations must uphold the hash-word contract (top bit clear, never
/// zero) and the usual coherence rule that equal keys hash equally. Every
/// provided implementation hashes the key's bytes with the
/// [`fnv`](crate::fnv) family, which enforces the contract itself.
pub trait MapKey: Copy + PartialEq {
    /// Hashes the key with the given seed.
    fn hash_key(&self, seed: u64) -> u64;
}

macro_rules! impl_map_key_for_int {
    ($($int:ty),* $(,)?) => {
        $(
            impl MapKey for $int {
                #[cfg_attr(feature = "inline-more", inline)]
                fn hash_key(&self, seed: u64) -> u64 {
                    fnv::hash_sized(&self.to_ne_bytes(), seed)
                }
            }
        )*
    };
}

impl_map_key_for_int!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);

impl MapKey for bool {
    #[cfg_attr(feature = "inline-more", inline)]
    fn hash_key(&self, seed: u64) -> u64 {
        fnv::hash_sized(&[*self as u8], seed)
    }
}

impl MapKey for char {
    #[cfg_attr(feature = "inline-more", inline)]
    fn hash_key(&self, seed: u64) -> u64 {
        fnv::hash_sized(&(*self as u32).to_ne_bytes(), seed)
    }
}

impl<const N: usize> MapKey for [u8; N] {
    #[cfg_attr(feature = "inline-more", inline)]
    fn hash_key(&self, seed: u64) -> u64 {
        // Monomorphization settles this branch per `N`: short arrays take the
        // unrolled fixed-size mix, longer ones the slice loop.
        if N <= 16 {
            fnv::hash_sized(self, seed)
        } else {
            fnv::hash_bytes(self, seed)
        }
    }
}

/// The reference itself is the stored key (pointer and length); the hash
/// covers the pointed-to contents, matching `&str` equality.
impl<'a> MapKey for &'a str {
    #[cfg_attr(feature = "inline-more", inline)]
    fn hash_key(&self, seed: u64) -> u64 {
        fnv::hash_str(self, seed)
    }
}

/// Hashes the pointed-to bytes up to the NUL terminator, matching `&CStr`
/// equality.
impl<'a> MapKey for &'a CStr {
    #[cfg_attr(feature = "inline-more", inline)]
    fn hash_key(&self, seed: u64) -> u64 {
        fnv::hash_c_str(self, seed)
    }
}

/// Adapts [`MapKey::hash_key`] to the erased [`HashFn`](crate::raw::HashFn)
/// signature.
///
/// # Safety
///
/// `key` must point to a valid, initialized `K`.
unsafe fn hash_erased<K: MapKey>(key: *const u8, seed: u64) -> u64 {
    (*key.cast::<K>()).hash_key(seed)
}

/// Adapts `K`'s `PartialEq` to the erased [`EqFn`](crate::raw::EqFn)
/// signature.
///
/// # Safety
///
/// Both pointers must point to valid, initialized `K`s.
unsafe fn eq_erased<K: MapKey>(a: *const u8, b: *const u8) -> bool {
    *a.cast::<K>() == *b.cast::<K>()
}

impl MapInfo {
    /// Builds the descriptor for statically known `K → V` at compile time.
    ///
    /// A [`RawMap`] driven through a descriptor from this constructor and the
    /// [`CellMap<K, V>`] typed surface observe and mutate identical state, so
    /// the two APIs can be mixed freely on one map.
    pub const fn of<K: MapKey, V: Copy>() -> MapInfo {
        MapInfo::new(
            CellInfo::new::<K>(),
            CellInfo::new::<V>(),
            hash_erased::<K>,
            eq_erased::<K>,
        )
    }
}

/// A hash map from `K` to `V` packed into cache-line cells, with Robin Hood
/// probing.
///
/// This is the monomorphic surface over [`RawMap`]: the descriptor is the
/// compile-time constant [`MapInfo::of::<K, V>()`](MapInfo::of), so the raw
/// engine's calls through its function pointers devirtualize once these
/// methods inline, and the cell indexing folds to plain array indexing
/// whenever the packing has no internal padding.
///
/// Keys and values live in separate cell-packed segments; no key or value
/// ever straddles a cache line. Both are stored bytewise (hence the `Copy`
/// bounds) and the map never runs drop glue for them.
///
/// # Examples
///
/// ```
/// use cellmap::CellMap;
///
/// let mut ages: CellMap<&str, u32> = CellMap::new();
/// ages.insert("ada", 36);
/// ages.insert("grace", 85);
///
/// assert_eq!(ages.get(&"ada"), Some(&36));
/// assert_eq!(ages.len(), 2);
///
/// assert!(ages.remove(&"ada"));
/// assert_eq!(ages.get(&"ada"), None);
/// ```
pub struct CellMap<K: MapKey, V: Copy, A: Allocator = Global> {
    raw: RawMap<A>,
    marker: PhantomData<(K, V)>,
}

impl<K: MapKey, V: Copy> CellMap<K, V, Global> {
    /// Creates an empty map. No memory is allocated until the first insert
    /// or reserve.
    #[inline]
    pub const fn new() -> Self {
        Self::new_in(Global)
    }

    /// Creates a map with at least `capacity` slots pre-allocated.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_in(capacity, Global)
    }
}

impl<K: MapKey, V: Copy, A: Allocator> CellMap<K, V, A> {
    const INFO: MapInfo = MapInfo::of::<K, V>();

    /// Creates an empty map using the given allocator. No memory is
    /// allocated until the first insert or reserve.
    #[inline]
    pub const fn new_in(alloc: A) -> Self {
        Self {
            raw: RawMap::new_in(alloc),
            marker: PhantomData,
        }
    }

    /// Creates a map with at least `capacity` slots pre-allocated from the
    /// given allocator.
    pub fn with_capacity_in(capacity: usize, alloc: A) -> Self {
        let mut map = Self::new_in(alloc);
        map.reserve(capacity);
        map
    }

    /// Returns the number of live entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns `true` if the map holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Returns the number of slots, or 0 before the first allocation.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.raw.capacity()
    }

    /// Returns a reference to the underlying allocator.
    #[inline]
    pub fn allocator(&self) -> &A {
        self.raw.allocator()
    }

    /// Returns the compile-time descriptor this map drives the raw engine
    /// with. An equivalent descriptor built at runtime may be used for
    /// type-erased operations on [`raw_mut`](CellMap::raw_mut).
    #[inline]
    pub fn descriptor(&self) -> MapInfo {
        Self::INFO
    }

    /// Borrows the underlying type-erased map.
    #[inline]
    pub fn raw(&self) -> &RawMap<A> {
        &self.raw
    }

    /// Mutably borrows the underlying type-erased map.
    ///
    /// Erased operations require a descriptor compatible with
    /// [`descriptor`](CellMap::descriptor); they then observe and mutate
    /// exactly the state the typed methods do.
    #[inline]
    pub fn raw_mut(&mut self) -> &mut RawMap<A> {
        &mut self.raw
    }

    /// Wraps an existing raw map in the typed surface. The wrapper takes
    /// over releasing the region on drop.
    ///
    /// # Safety
    ///
    /// If `raw` is allocated, its region must have been allocated with a
    /// descriptor compatible with [`MapInfo::of::<K, V>()`](MapInfo::of).
    #[inline]
    pub unsafe fn from_raw(raw: RawMap<A>) -> Self {
        Self {
            raw,
            marker: PhantomData,
        }
    }

    /// Unwraps the underlying raw map. The caller becomes responsible for
    /// eventually releasing its region with [`RawMap::free`].
    #[inline]
    pub fn into_raw(self) -> RawMap<A> {
        let this = core::mem::ManuallyDrop::new(self);
        // SAFETY: `this` is never touched again and its `Drop` is
        // suppressed, so the raw map has a single owner.
        unsafe { core::ptr::read(&this.raw) }
    }

    /// Inserts `key → value` and returns a reference to the stored value.
    /// An existing entry for the key is overwritten in place.
    ///
    /// # Panics
    ///
    /// Panics or aborts if the table needed to grow and the allocation
    /// failed (see [`try_insert`](CellMap::try_insert) for the fallible
    /// variant).
    #[cfg_attr(feature = "inline-more", inline)]
    pub fn insert(&mut self, key: K, value: V) -> &mut V {
        // SAFETY: the pointers are valid for the call, and `INFO` is this
        // map's own descriptor.
        unsafe {
            let value_ptr = self.raw.insert_infallible(
                &Self::INFO,
                (&key as *const K).cast(),
                (&value as *const V).cast(),
            );
            &mut *value_ptr.as_ptr().cast::<V>()
        }
    }

    /// Fallible [`insert`](CellMap::insert).
    #[cfg_attr(feature = "inline-more", inline)]
    pub fn try_insert(&mut self, key: K, value: V) -> Result<&mut V, TryReserveError> {
        // SAFETY: as for `insert`.
        unsafe {
            let value_ptr = self.raw.insert(
                &Self::INFO,
                (&key as *const K).cast(),
                (&value as *const V).cast(),
            )?;
            Ok(&mut *value_ptr.as_ptr().cast::<V>())
        }
    }

    /// Returns a reference to the value stored for `key`.
    #[cfg_attr(feature = "inline-more", inline)]
    pub fn get(&self, key: &K) -> Option<&V> {
        // SAFETY: the key pointer is valid for the call, and `INFO` is this
        // map's own descriptor.
        unsafe {
            match self.raw.find(&Self::INFO, (key as *const K).cast()) {
                Some(value_ptr) => Some(&*value_ptr.as_ptr().cast::<V>()),
                None => None,
            }
        }
    }

    /// Returns a mutable reference to the value stored for `key`.
    #[cfg_attr(feature = "inline-more", inline)]
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        // SAFETY: as for `get`.
        unsafe {
            match self.raw.find(&Self::INFO, (key as *const K).cast()) {
                Some(value_ptr) => Some(&mut *value_ptr.as_ptr().cast::<V>()),
                None => None,
            }
        }
    }

    /// Returns `true` if `key` has an entry.
    #[cfg_attr(feature = "inline-more", inline)]
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Removes the entry for `key`, returning whether one was present.
    #[cfg_attr(feature = "inline-more", inline)]
    pub fn remove(&mut self, key: &K) -> bool {
        // SAFETY: as for `get`.
        unsafe { self.raw.erase(&Self::INFO, (key as *const K).cast()) }
    }

    /// Removes every entry, keeping the allocated capacity.
    #[cfg_attr(feature = "inline-more", inline)]
    pub fn clear(&mut self) {
        // SAFETY: `INFO` is this map's own descriptor.
        unsafe { self.raw.clear(&Self::INFO) }
    }

    /// Ensures the map has at least `capacity` slots.
    ///
    /// This reserves *slots*, not insertions: the 75% load factor still
    /// applies on top of the resulting capacity.
    ///
    /// # Panics
    ///
    /// Panics or aborts on allocation failure (see
    /// [`try_reserve`](CellMap::try_reserve)).
    #[cfg_attr(feature = "inline-more", inline)]
    pub fn reserve(&mut self, capacity: usize) {
        // SAFETY: `INFO` is this map's own descriptor.
        unsafe { self.raw.reserve_infallible(&Self::INFO, capacity) }
    }

    /// Fallible [`reserve`](CellMap::reserve).
    #[cfg_attr(feature = "inline-more", inline)]
    pub fn try_reserve(&mut self, capacity: usize) -> Result<(), TryReserveError> {
        // SAFETY: `INFO` is this map's own descriptor.
        unsafe { self.raw.reserve(&Self::INFO, capacity) }
    }

    /// Halves the capacity if the current entries fit the smaller table
    /// within the load factor; otherwise does nothing. Capacity never drops
    /// below the 64-slot minimum.
    ///
    /// # Panics
    ///
    /// Panics or aborts on allocation failure (see
    /// [`try_shrink`](CellMap::try_shrink)).
    #[cfg_attr(feature = "inline-more", inline)]
    pub fn shrink(&mut self) {
        // SAFETY: `INFO` is this map's own descriptor.
        unsafe { self.raw.shrink_infallible(&Self::INFO) }
    }

    /// Fallible [`shrink`](CellMap::shrink).
    #[cfg_attr(feature = "inline-more", inline)]
    pub fn try_shrink(&mut self) -> Result<(), TryReserveError> {
        // SAFETY: `INFO` is this map's own descriptor.
        unsafe { self.raw.shrink(&Self::INFO) }
    }
}

impl<K: MapKey, V: Copy, A: Allocator> Drop for CellMap<K, V, A> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: `INFO` is this map's own descriptor; stored entries carry
        // no drop glue, so releasing the raw region is all there is to do.
        unsafe { self.raw.free(&Self::INFO) }
    }
}

impl<K: MapKey, V: Copy, A: Allocator + Default> Default for CellMap<K, V, A> {
    #[inline]
    fn default() -> Self {
        Self::new_in(A::default())
    }
}

impl<K: MapKey, V: Copy, A: Allocator> Debug for CellMap<K, V, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellMap")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
