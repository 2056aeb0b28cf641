// This code partially use code from the [`Hashbrown`] crate
// [`Hashbrown`]: https://github.com/rust-lang/hashbrown

//! The type-erased core: [`RawMap`] and the descriptors that drive it.
//!
//! Everything in this module operates on raw key and value pointers through
//! a [`MapInfo`] descriptor, so one compiled copy of the engine serves every
//! key/value pairing. The typed [`CellMap`](crate::CellMap) surface wraps
//! this module with a compile-time descriptor.


mod alloc;
mod cell;

pub use self::alloc::{AllocError, Allocator, Global};
pub(crate) use self::alloc::do_alloc;
pub use self::cell::{CellInfo, CACHE_LINE_SIZE};

use crate::TryReserveError;
use core::alloc::Layout;
use core::ptr::{self, NonNull};
use core::{fmt, hint};
use std::alloc::handle_alloc_error;

// On stable we can use #[cold] to get an equivalent effect to the nightly
// branch prediction intrinsics: this attribute suggests that the function is
// unlikely to be called.
#[inline]
#[cold]
fn cold() {}

#[inline]
fn likely(b: bool) -> bool {
    if !b {
        cold();
    }
    b
}

#[inline]
fn unlikely(b: bool) -> bool {
    if b {
        cold();
    }
    b
}

/// Tag bit of a stored hash word marking a tombstone. The remaining bits keep
/// the original hash, so probe distances stay meaningful for dead slots.
pub(crate) const TOMBSTONE_BIT: u64 = 1 << 63;

/// The capacity exponent lives in the low six bits of the data word; the
/// cache-line-aligned base address supplies at least that many zero bits.
const LOG2_MASK: usize = 0x3f;

/// Smallest allocated capacity is `1 << MIN_LOG2` slots.
pub(crate) const MIN_LOG2: u32 = 6;

/// Largest capacity exponent the tag can encode.
const MAX_LOG2: u32 = 63;

/// Checks whether a hash word marks an empty slot.
#[inline]
fn is_empty_hash(hash: u64) -> bool {
    hash == 0
}

/// Checks whether a hash word marks a tombstone (top bit is set).
#[inline]
fn is_tombstone(hash: u64) -> bool {
    hash & TOMBSTONE_BIT != 0
}

/// Checks whether a hash word marks a live entry.
#[inline]
fn is_full_hash(hash: u64) -> bool {
    hash != 0 && hash & TOMBSTONE_BIT == 0
}

/// Slot a hash wants to live in: its low bits modulo the capacity.
#[inline]
#[allow(clippy::cast_possible_truncation)]
fn desired_index(hash: u64, mask: usize) -> usize {
    // On 32-bit platforms we simply ignore the higher hash bits.
    (hash as usize) & mask
}

/// Distance of `index` from the slot `hash` wants to live in, modulo the
/// capacity. Applies to tombstones too, since they keep their low hash bits.
#[inline]
fn probe_distance(hash: u64, index: usize, mask: usize) -> usize {
    index.wrapping_sub(desired_index(hash, mask)) & mask
}

/// Largest number of live entries a table of `buckets` slots may hold: the
/// 75% load factor. `buckets` is a power of two of at least 64, so this
/// equals `floor(buckets * 75 / 100)` with no overflow for any capacity.
#[inline]
fn resize_threshold(buckets: usize) -> usize {
    buckets / 4 * 3
}

/// Exponent of the smallest power of two that is `>= n`. `n` must not exceed
/// `1 << 63`.
#[inline]
fn ceil_log2(n: usize) -> u32 {
    n.next_power_of_two().trailing_zeros()
}

/// Whether memory allocation errors should return an error or abort.
#[derive(Copy, Clone)]
enum Fallibility {
    Fallible,
    Infallible,
}

impl Fallibility {
    /// Error to return on capacity overflow.
    #[cfg_attr(feature = "inline-more", inline)]
    fn capacity_overflow(self) -> TryReserveError {
        match self {
            Fallibility::Fallible => TryReserveError::CapacityOverflow,
            Fallibility::Infallible => panic!("Hash table capacity overflow"),
        }
    }

    /// Error to return on allocation error.
    #[cfg_attr(feature = "inline-more", inline)]
    fn alloc_err(self, layout: Layout) -> TryReserveError {
        match self {
            Fallibility::Fallible => TryReserveError::AllocError { layout },
            Fallibility::Infallible => handle_alloc_error(layout),
        }
    }
}

/// Type-erased hash function: hashes the key behind `key` with `seed`.
///
/// Implementations must uphold the hash-word contract of the
/// [`fnv`](crate::fnv) family: top bit clear, never zero.
pub type HashFn = unsafe fn(key: *const u8, seed: u64) -> u64;

/// Type-erased key equality over two key pointers.
pub type EqFn = unsafe fn(a: *const u8, b: *const u8) -> bool;

/// Runtime descriptor of one key/value pairing: the cell packings of both
/// types plus the hash and equality functions for the key.
///
/// A descriptor can be built at compile time from statically known types with
/// [`MapInfo::of`], or assembled at runtime from raw parts with
/// [`MapInfo::new`] for callers whose types are not visible to the compiler.
/// Either way it fully drives a [`RawMap`]; the map itself stores no type
/// information.
#[derive(Copy, Clone, Debug)]
pub struct MapInfo {
    key: CellInfo,
    value: CellInfo,
    hasher: HashFn,
    equals: EqFn,
}

impl MapInfo {
    /// Assembles a descriptor from raw parts.
    pub const fn new(key: CellInfo, value: CellInfo, hasher: HashFn, equals: EqFn) -> Self {
        Self {
            key,
            value,
            hasher,
            equals,
        }
    }

    /// The key type's cell packing.
    #[inline]
    pub const fn key(&self) -> CellInfo {
        self.key
    }

    /// The value type's cell packing.
    #[inline]
    pub const fn value(&self) -> CellInfo {
        self.value
    }

    /// The key hash function.
    #[inline]
    pub const fn hasher(&self) -> HashFn {
        self.hasher
    }

    /// The key equality function.
    #[inline]
    pub const fn equals(&self) -> EqFn {
        self.equals
    }
}

/// Packing of the hash words themselves. A `u64` always divides the cache
/// line, so hash cells have no internal padding and the segment indexes as a
/// plain array.
const HASH_CELL: CellInfo = CellInfo::new::<u64>();

/// Returns the [`Layout`] of the allocation required for a table of
/// `buckets` slots, and the byte offset of the hash-word segment within it
/// (the one segment that needs initialization). Returns `None` if an
/// overflow occurs.
//
// Rough model of our memory for a capacity of `cap` (each segment is rounded
// up to a whole number of cache lines, and the base address itself is
// cache-line-aligned):
//
//  base                                     hashes_offset
//  ∨                                        ∨
//  K0, ..., Kcap-1, ~, V0, ..., Vcap-1, ~,  H0, ..., Hcap-1, ~, SK0, SK1, ~, SV0, SV1, ~
//
// where K/V are the cell-packed key and value slots, H the cell-packed hash
// words, `~` cache-line padding, and SK/SV the two scratch key and value
// slots the type-erased insert parks displaced entries in.
fn calculate_layout(info: &MapInfo, buckets: usize) -> Option<(Layout, usize)> {
    debug_assert!(buckets.is_power_of_two());

    let keys_len = info.key.size_of_array(buckets)?;
    let values_len = info.value.size_of_array(buckets)?;
    let hashes_len = HASH_CELL.size_of_array(buckets)?;
    let scratch_keys_len = info.key.size_of_array(2)?;
    let scratch_values_len = info.value.size_of_array(2)?;

    let hashes_offset = keys_len.checked_add(values_len)?;
    let scratch_keys_offset = hashes_offset.checked_add(hashes_len)?;
    let scratch_values_offset = scratch_keys_offset.checked_add(scratch_keys_len)?;
    let size = scratch_values_offset.checked_add(scratch_values_len)?;

    // We need an additional check to ensure that the allocation doesn't
    // exceed `isize::MAX` (https://github.com/rust-lang/rust/pull/95295).
    if size > isize::MAX as usize {
        return None;
    }

    Some((
        // SAFETY: the size was just bounded and the alignment is a
        // power of two.
        unsafe { Layout::from_size_align_unchecked(size, CACHE_LINE_SIZE) },
        hashes_offset,
    ))
}

/// Resolved segment base pointers of one allocated region, plus the slot
/// mask. Rebuilt per operation from the tagged data word; all arithmetic was
/// validated when the region was allocated.
#[derive(Copy, Clone)]
struct Segments {
    keys: *mut u8,
    values: *mut u8,
    hashes: *mut u64,
    scratch_keys: *mut u8,
    scratch_values: *mut u8,
    mask: usize,
}

impl Segments {
    /// Re-derives the segment bases of a region allocated for `buckets`
    /// slots of `info`'s layout.
    ///
    /// # Safety
    ///
    /// `base` must be the base of a live region allocated with exactly this
    /// `info` and `buckets`.
    #[cfg_attr(feature = "inline-more", inline)]
    unsafe fn resolve(base: *mut u8, info: &MapInfo, buckets: usize) -> Segments {
        let keys_len = info.key.size_of_array_unchecked(buckets);
        let values_len = info.value.size_of_array_unchecked(buckets);
        let hashes_len = HASH_CELL.size_of_array_unchecked(buckets);
        let scratch_keys_len = info.key.size_of_array_unchecked(2);
        Segments {
            keys: base,
            values: base.add(keys_len),
            hashes: base.add(keys_len + values_len).cast::<u64>(),
            scratch_keys: base.add(keys_len + values_len + hashes_len),
            scratch_values: base.add(keys_len + values_len + hashes_len + scratch_keys_len),
            mask: buckets - 1,
        }
    }

    /// Pointer to key slot `index`.
    #[cfg_attr(feature = "inline-more", inline)]
    unsafe fn key_ptr(&self, info: &MapInfo, index: usize) -> *mut u8 {
        debug_assert!(index <= self.mask);
        self.keys.add(info.key.offset_of(index))
    }

    /// Pointer to value slot `index`.
    #[cfg_attr(feature = "inline-more", inline)]
    unsafe fn value_ptr(&self, info: &MapInfo, index: usize) -> *mut u8 {
        debug_assert!(index <= self.mask);
        self.values.add(info.value.offset_of(index))
    }

    /// Loads the hash word of slot `index`.
    #[cfg_attr(feature = "inline-more", inline)]
    unsafe fn hash_at(&self, index: usize) -> u64 {
        debug_assert!(index <= self.mask);
        *self.hashes.add(index)
    }

    /// Stores the hash word of slot `index`.
    #[cfg_attr(feature = "inline-more", inline)]
    unsafe fn set_hash(&self, index: usize, hash: u64) {
        debug_assert!(index <= self.mask);
        *self.hashes.add(index) = hash;
    }

    /// Pointer to scratch key slot `which` (0 or 1).
    #[cfg_attr(feature = "inline-more", inline)]
    unsafe fn scratch_key(&self, info: &MapInfo, which: usize) -> *mut u8 {
        debug_assert!(which < 2);
        self.scratch_keys.add(info.key.offset_of(which))
    }

    /// Pointer to scratch value slot `which` (0 or 1).
    #[cfg_attr(feature = "inline-more", inline)]
    unsafe fn scratch_value(&self, info: &MapInfo, which: usize) -> *mut u8 {
        debug_assert!(which < 2);
        self.scratch_values.add(info.value.offset_of(which))
    }

    /// Robin Hood placement of an entry known not to be in the table.
    ///
    /// Walks the probe sequence of `hash`. An empty slot takes the carried
    /// entry outright. A resident entry closer to its desired slot than the
    /// carried one is "rich": a resident tombstone is overwritten in place
    /// (the probe chains running through it stay intact, since every entry
    /// behind it is at least as far from home), while a live resident swaps
    /// places with the carried entry, which then continues the walk from the
    /// resident's distance. Displaced entries are parked in the scratch
    /// slots, alternating between the two so the source and destination of a
    /// park never alias.
    ///
    /// Returns the address of the value slot first claimed by the *supplied*
    /// entry, which is where its bytes live until a later insertion displaces
    /// them.
    ///
    /// # Safety
    ///
    /// The region must hold at least one slot that is not a live entry, the
    /// carried key must not equal any live key, and `key`/`value` must be
    /// valid for reads of the key and value sizes.
    unsafe fn insert_unique(
        &self,
        info: &MapInfo,
        mut hash: u64,
        mut key: *const u8,
        mut value: *const u8,
    ) -> *mut u8 {
        debug_assert!(is_full_hash(hash));

        let key_size = info.key.size_of_type();
        let value_size = info.value.size_of_type();
        let mut index = desired_index(hash, self.mask);
        let mut dist = 0;
        let mut claimed: *mut u8 = ptr::null_mut();
        // Which scratch pair the next displaced entry parks in.
        let mut park = 0;

        loop {
            let stored = self.hash_at(index);
            if likely(is_empty_hash(stored)) {
                ptr::copy_nonoverlapping(key, self.key_ptr(info, index), key_size);
                ptr::copy_nonoverlapping(value, self.value_ptr(info, index), value_size);
                self.set_hash(index, hash);
                if claimed.is_null() {
                    claimed = self.value_ptr(info, index);
                }
                return claimed;
            }

            let stored_dist = probe_distance(stored, index, self.mask);
            if stored_dist < dist {
                if is_tombstone(stored) {
                    ptr::copy_nonoverlapping(key, self.key_ptr(info, index), key_size);
                    ptr::copy_nonoverlapping(value, self.value_ptr(info, index), value_size);
                    self.set_hash(index, hash);
                    if claimed.is_null() {
                        claimed = self.value_ptr(info, index);
                    }
                    return claimed;
                }

                // Steal from the rich: park the resident entry, move the
                // carried one in, continue the walk carrying the resident.
                let parked_key = self.scratch_key(info, park);
                let parked_value = self.scratch_value(info, park);
                ptr::copy_nonoverlapping(self.key_ptr(info, index), parked_key, key_size);
                ptr::copy_nonoverlapping(self.value_ptr(info, index), parked_value, value_size);
                ptr::copy_nonoverlapping(key, self.key_ptr(info, index), key_size);
                ptr::copy_nonoverlapping(value, self.value_ptr(info, index), value_size);
                let parked_hash = stored;
                self.set_hash(index, hash);
                if claimed.is_null() {
                    claimed = self.value_ptr(info, index);
                }
                hash = parked_hash;
                key = parked_key;
                value = parked_value;
                park ^= 1;
                dist = stored_dist;
            }

            index = (index + 1) & self.mask;
            dist += 1;
        }
    }
}

/// A hash table driven entirely by a runtime [`MapInfo`] descriptor, with an
/// unsafe pointer-based API.
///
/// The table owns a single region laid out as five cache-line-aligned
/// segments (keys, values, hash words, scratch keys, scratch values) and a
/// tagged data word whose low six bits encode the capacity exponent. Keys and
/// values are copied in and out bytewise and are **never dropped**: erasing,
/// clearing and freeing leave or discard raw bytes. Only store types without
/// drop glue through this API.
///
/// A `RawMap` does not know its own descriptor, so it has no `Drop`; a map
/// that was ever allocated must be released with [`free`](RawMap::free), or
/// its region leaks. The typed [`CellMap`](crate::CellMap) wrapper owns a
/// compile-time descriptor and handles this automatically.
///
/// Every operation taking a `&MapInfo` requires, beyond its own listed
/// conditions, that the descriptor is *compatible* with the one the current
/// region was allocated with: identical key and value cell packings, and hash
/// and equality functions with identical observable behavior. The typed and
/// type-erased APIs may be mixed freely on one map under that rule.
pub struct RawMap<A: Allocator = Global> {
    /// Zero, or `base | log2(capacity)` with the exponent in the low six
    /// bits of the cache-line-aligned base address.
    data: usize,
    /// Number of live entries (tombstones excluded).
    len: usize,
    alloc: A,
}

impl RawMap<Global> {
    /// Creates an empty map without allocating any memory.
    #[inline]
    pub const fn new() -> Self {
        Self::new_in(Global)
    }

    /// Allocates a map with `1 << log2_capacity` slots up front.
    ///
    /// Exponents below the 64-slot minimum are raised to it; exponents above
    /// 63 fail with [`TryReserveError::CapacityOverflow`].
    pub fn allocate(info: &MapInfo, log2_capacity: u32) -> Result<Self, TryReserveError> {
        Self::allocate_in(info, log2_capacity, Global)
    }
}

impl<A: Allocator> RawMap<A> {
    /// Creates an empty map without allocating any memory, using the given
    /// allocator.
    #[inline]
    pub const fn new_in(alloc: A) -> Self {
        Self {
            data: 0,
            len: 0,
            alloc,
        }
    }

    /// Allocates a map with `1 << log2_capacity` slots up front, using the
    /// given allocator.
    ///
    /// Exponents below the 64-slot minimum are raised to it; exponents above
    /// 63 fail with [`TryReserveError::CapacityOverflow`].
    pub fn allocate_in(info: &MapInfo, log2_capacity: u32, alloc: A) -> Result<Self, TryReserveError> {
        let mut map = Self::new_in(alloc);
        let log2 = u32::max(log2_capacity, MIN_LOG2);
        map.data = map.alloc_region(info, log2, Fallibility::Fallible)?;
        Ok(map)
    }

    /// Returns the number of live entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the map holds no live entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of slots, or 0 before the first allocation.
    #[inline]
    pub fn capacity(&self) -> usize {
        if self.data == 0 {
            0
        } else {
            1 << self.log2_capacity()
        }
    }

    /// Returns a reference to the underlying allocator.
    #[inline]
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    #[inline]
    fn log2_capacity(&self) -> u32 {
        (self.data & LOG2_MASK) as u32
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        (self.data & !LOG2_MASK) as *mut u8
    }

    /// Segment bases of the current region. Must not be called before the
    /// first allocation.
    #[inline]
    fn segments(&self, info: &MapInfo) -> Segments {
        debug_assert!(self.data != 0);
        // SAFETY: the region was allocated with this descriptor's layout.
        unsafe { Segments::resolve(self.base(), info, 1 << self.log2_capacity()) }
    }

    /// Inserts `key → value`, copying both bytewise, and returns the address
    /// of the stored value.
    ///
    /// If the key is already present its value is overwritten in place and
    /// the length does not change. Otherwise the entry is placed by Robin
    /// Hood displacement, growing the table first when the insertion would
    /// cross the 75% load factor. The returned address is where the supplied
    /// entry's value landed; it stays valid until the next operation that
    /// mutates the map.
    ///
    /// # Safety
    ///
    /// `info` must be compatible with this map (see the type docs), and
    /// `key` and `value` must be valid for reads of the key and value sizes
    /// for the duration of the call.
    pub unsafe fn insert(
        &mut self,
        info: &MapInfo,
        key: *const u8,
        value: *const u8,
    ) -> Result<NonNull<u8>, TryReserveError> {
        self.insert_impl(info, key, value, Fallibility::Fallible)
    }

    /// [`insert`](RawMap::insert) without the returned address, for callers
    /// that only need success or failure.
    ///
    /// # Safety
    ///
    /// As for [`insert`](RawMap::insert).
    pub unsafe fn add(
        &mut self,
        info: &MapInfo,
        key: *const u8,
        value: *const u8,
    ) -> Result<(), TryReserveError> {
        self.insert_impl(info, key, value, Fallibility::Fallible).map(|_| ())
    }

    /// Infallible insert: aborts on allocation failure instead of returning
    /// an error. Used by the typed surface.
    pub(crate) unsafe fn insert_infallible(
        &mut self,
        info: &MapInfo,
        key: *const u8,
        value: *const u8,
    ) -> NonNull<u8> {
        // Avoid `Result::unwrap_or_else` because it bloats LLVM IR.
        match self.insert_impl(info, key, value, Fallibility::Infallible) {
            Ok(value_ptr) => value_ptr,
            Err(_) => hint::unreachable_unchecked(),
        }
    }

    unsafe fn insert_impl(
        &mut self,
        info: &MapInfo,
        key: *const u8,
        value: *const u8,
        fallibility: Fallibility,
    ) -> Result<NonNull<u8>, TryReserveError> {
        let hash = (info.hasher)(key, 0);

        if self.data != 0 {
            // Existing key: overwrite the value in place, length unchanged.
            if let Some(index) = self.find_inner(info, hash, key) {
                let seg = self.segments(info);
                let value_dst = seg.value_ptr(info, index);
                ptr::copy_nonoverlapping(value, value_dst, info.value.size_of_type());
                return Ok(NonNull::new_unchecked(value_dst));
            }
            if unlikely(self.len + 1 >= resize_threshold(self.capacity())) {
                self.resize(info, self.log2_capacity() + 1, fallibility)?;
            }
        } else {
            self.data = self.alloc_region(info, MIN_LOG2, fallibility)?;
        }

        let claimed = self.segments(info).insert_unique(info, hash, key, value);
        self.len += 1;
        Ok(NonNull::new_unchecked(claimed))
    }

    /// Looks the key up and returns the address of its value, if present.
    ///
    /// The address stays valid until the next operation that mutates the
    /// map.
    ///
    /// # Safety
    ///
    /// `info` must be compatible with this map, and `key` must be valid for
    /// reads of the key size for the duration of the call.
    pub unsafe fn find(&self, info: &MapInfo, key: *const u8) -> Option<NonNull<u8>> {
        if self.data == 0 {
            return None;
        }
        let hash = (info.hasher)(key, 0);
        // Avoid `Option::map` because it bloats LLVM IR.
        match self.find_inner(info, hash, key) {
            Some(index) => Some(NonNull::new_unchecked(
                self.segments(info).value_ptr(info, index),
            )),
            None => None,
        }
    }

    /// Returns `true` if the key is present.
    ///
    /// # Safety
    ///
    /// As for [`find`](RawMap::find).
    pub unsafe fn contains(&self, info: &MapInfo, key: *const u8) -> bool {
        self.find(info, key).is_some()
    }

    /// Erases the key's entry by tombstoning its slot. Returns whether the
    /// key was present. The key and value bytes are left in place as dead
    /// data.
    ///
    /// # Safety
    ///
    /// As for [`find`](RawMap::find).
    pub unsafe fn erase(&mut self, info: &MapInfo, key: *const u8) -> bool {
        if self.data == 0 {
            return false;
        }
        let hash = (info.hasher)(key, 0);
        match self.find_inner(info, hash, key) {
            Some(index) => {
                let seg = self.segments(info);
                // Tag the top bit only: the low bits must keep carrying the
                // original hash for probe distances over this slot.
                seg.set_hash(index, seg.hash_at(index) | TOMBSTONE_BIT);
                self.len -= 1;
                true
            }
            None => false,
        }
    }

    /// Marks every slot empty without releasing the region. Key and value
    /// bytes are left in place as dead data.
    ///
    /// # Safety
    ///
    /// `info` must be compatible with this map.
    pub unsafe fn clear(&mut self, info: &MapInfo) {
        if self.data != 0 {
            let buckets = 1usize << self.log2_capacity();
            ptr::write_bytes(self.segments(info).hashes, 0, buckets);
        }
        self.len = 0;
    }

    /// Ensures the map has at least `capacity` slots, migrating live entries
    /// if a larger region is needed. Requests at or below the current
    /// capacity leave the map untouched.
    ///
    /// Note that this reserves *slots*, not insertions: the 75% load factor
    /// still applies on top of the resulting capacity.
    ///
    /// # Safety
    ///
    /// `info` must be compatible with this map.
    pub unsafe fn reserve(&mut self, info: &MapInfo, capacity: usize) -> Result<(), TryReserveError> {
        self.reserve_inner(info, capacity, Fallibility::Fallible)
    }

    /// Infallible reserve: aborts on allocation failure. Used by the typed
    /// surface.
    pub(crate) unsafe fn reserve_infallible(&mut self, info: &MapInfo, capacity: usize) {
        // Avoid `Result::unwrap_or_else` because it bloats LLVM IR.
        if self
            .reserve_inner(info, capacity, Fallibility::Infallible)
            .is_err()
        {
            hint::unreachable_unchecked()
        }
    }

    unsafe fn reserve_inner(
        &mut self,
        info: &MapInfo,
        capacity: usize,
        fallibility: Fallibility,
    ) -> Result<(), TryReserveError> {
        if capacity > isize::MAX as usize {
            return Err(fallibility.capacity_overflow());
        }
        let log2_new = ceil_log2(usize::max(capacity, 1 << MIN_LOG2));
        if self.data == 0 {
            self.data = self.alloc_region(info, log2_new, fallibility)?;
            Ok(())
        } else if self.log2_capacity() >= log2_new {
            Ok(())
        } else {
            self.resize(info, log2_new, fallibility)
        }
    }

    /// Doubles the capacity (or performs the initial 64-slot allocation on a
    /// never-allocated map), migrating every live entry.
    ///
    /// # Safety
    ///
    /// `info` must be compatible with this map.
    pub unsafe fn grow(&mut self, info: &MapInfo) -> Result<(), TryReserveError> {
        if self.data == 0 {
            self.data = self.alloc_region(info, MIN_LOG2, Fallibility::Fallible)?;
            Ok(())
        } else {
            self.resize(info, self.log2_capacity() + 1, Fallibility::Fallible)
        }
    }

    /// Halves the capacity if the surviving region could hold the current
    /// entries within the load factor; otherwise (or at the 64-slot minimum,
    /// or before the first allocation) succeeds without mutating anything.
    ///
    /// # Safety
    ///
    /// `info` must be compatible with this map.
    pub unsafe fn shrink(&mut self, info: &MapInfo) -> Result<(), TryReserveError> {
        self.shrink_inner(info, Fallibility::Fallible)
    }

    /// Infallible shrink: aborts on allocation failure. Used by the typed
    /// surface.
    pub(crate) unsafe fn shrink_infallible(&mut self, info: &MapInfo) {
        // Avoid `Result::unwrap_or_else` because it bloats LLVM IR.
        if self.shrink_inner(info, Fallibility::Infallible).is_err() {
            hint::unreachable_unchecked()
        }
    }

    unsafe fn shrink_inner(
        &mut self,
        info: &MapInfo,
        fallibility: Fallibility,
    ) -> Result<(), TryReserveError> {
        if self.data == 0 || self.log2_capacity() == MIN_LOG2 {
            return Ok(());
        }
        if self.len >= resize_threshold(self.capacity() / 2) {
            return Ok(());
        }
        self.resize(info, self.log2_capacity() - 1, fallibility)
    }

    /// Releases the region, leaving the map empty and unallocated. Key and
    /// value bytes are discarded without being dropped.
    ///
    /// # Safety
    ///
    /// `info` must be compatible with this map. Addresses previously
    /// returned by [`insert`](RawMap::insert) or [`find`](RawMap::find) are
    /// dangling afterwards.
    pub unsafe fn free(&mut self, info: &MapInfo) {
        if self.data != 0 {
            self.free_region(info, self.data);
            self.data = 0;
        }
        self.len = 0;
    }

    /// Shared lookup walk. Returns the slot index of the live entry for
    /// `key`, whose hash is `hash`. Requires an allocated region.
    #[cfg_attr(feature = "inline-more", inline)]
    unsafe fn find_inner(&self, info: &MapInfo, hash: u64, key: *const u8) -> Option<usize> {
        let seg = self.segments(info);
        let mut index = desired_index(hash, seg.mask);
        let mut dist = 0;
        loop {
            let stored = seg.hash_at(index);
            if is_empty_hash(stored) {
                return None;
            }
            // Robin Hood early exit: every entry placed through this slot
            // sits at least as far from home as we have already walked, so a
            // resident closer to home proves the key was never inserted.
            // Tombstones keep their distance in the low bits and take part
            // like live entries.
            if dist > probe_distance(stored, index, seg.mask) {
                return None;
            }
            // A tombstone's top bit keeps `stored == hash` false, so one
            // compare filters dead slots and hash misses together.
            if stored == hash && (info.equals)(key, seg.key_ptr(info, index)) {
                return Some(index);
            }
            index = (index + 1) & seg.mask;
            dist += 1;
        }
    }

    /// Allocates a region for `1 << log2` slots, zero-fills its hash
    /// segment, and returns the tagged data word.
    fn alloc_region(
        &self,
        info: &MapInfo,
        log2: u32,
        fallibility: Fallibility,
    ) -> Result<usize, TryReserveError> {
        if log2 > MAX_LOG2 || log2 >= usize::BITS {
            return Err(fallibility.capacity_overflow());
        }
        let buckets = 1usize << log2;
        let (layout, hashes_offset) = match calculate_layout(info, buckets) {
            Some(layout) => layout,
            None => return Err(fallibility.capacity_overflow()),
        };
        let base = match do_alloc(&self.alloc, layout) {
            Ok(base) => base.as_ptr(),
            Err(_) => return Err(fallibility.alloc_err(layout)),
        };
        // The tag encoding relies on the base address having its low bits
        // free; an allocator that ignores the requested alignment is broken.
        assert!(
            base as usize & (CACHE_LINE_SIZE - 1) == 0,
            "allocator returned an address not aligned to the cache line"
        );
        // SAFETY: the hash segment lies inside the fresh allocation.
        unsafe { ptr::write_bytes(base.add(hashes_offset).cast::<u64>(), 0, buckets) };
        Ok(base as usize | log2 as usize)
    }

    /// Releases the region tagged in `data`.
    unsafe fn free_region(&self, info: &MapInfo, data: usize) {
        let buckets = 1usize << (data & LOG2_MASK);
        let (layout, _) = match calculate_layout(info, buckets) {
            Some(layout) => layout,
            // The layout was validated when this region was allocated.
            None => hint::unreachable_unchecked(),
        };
        self.alloc
            .deallocate(NonNull::new_unchecked((data & !LOG2_MASK) as *mut u8), layout);
    }

    /// Allocates a region for `1 << new_log2` slots and migrates every live
    /// entry into it by its *stored* hash, then frees the old region. Keys
    /// are not re-hashed and no equality calls are made: live entries are
    /// unique and tombstones are simply dropped. On failure the map is left
    /// exactly as it was.
    #[cold]
    #[inline(never)]
    unsafe fn resize(
        &mut self,
        info: &MapInfo,
        new_log2: u32,
        fallibility: Fallibility,
    ) -> Result<(), TryReserveError> {
        let new_data = self.alloc_region(info, new_log2, fallibility)?;

        let old_data = self.data;
        if old_data != 0 {
            let old_buckets = 1usize << (old_data & LOG2_MASK);
            let old_seg =
                Segments::resolve((old_data & !LOG2_MASK) as *mut u8, info, old_buckets);
            let new_seg =
                Segments::resolve((new_data & !LOG2_MASK) as *mut u8, info, 1usize << new_log2);
            for index in 0..old_buckets {
                let stored = old_seg.hash_at(index);
                if !is_full_hash(stored) {
                    continue;
                }
                new_seg.insert_unique(
                    info,
                    stored,
                    old_seg.key_ptr(info, index),
                    old_seg.value_ptr(info, index),
                );
            }
            self.free_region(info, old_data);
        }

        self.data = new_data;
        Ok(())
    }
}

impl<A: Allocator + Default> Default for RawMap<A> {
    #[inline]
    fn default() -> Self {
        Self::new_in(A::default())
    }
}

impl<A: Allocator> fmt::Debug for RawMap<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMap")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}
