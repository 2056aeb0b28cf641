use cfg_if::cfg_if;
use core::mem;

cfg_if! {
    // Cache lines are 128 bytes on modern Apple and POWER hardware; everything
    // else common today transfers 64 bytes at a time. The constant only needs
    // to be an upper bound that is a power of two, so two tiers suffice.
    if #[cfg(any(target_arch = "aarch64", target_arch = "powerpc64"))] {
        /// Size in bytes of the hardware cache transfer unit on the target.
        pub const CACHE_LINE_SIZE: usize = 128;
    } else {
        /// Size in bytes of the hardware cache transfer unit on the target.
        pub const CACHE_LINE_SIZE: usize = 64;
    }
}

/// Describes how values of one type pack into cache-line-sized *cells*.
///
/// A cell is a cache-line-aligned packet holding one or more consecutively
/// stored elements of a single type. Types smaller than a line share one
/// (`elements_per_cell = CACHE_LINE_SIZE / size`, leftover bytes pad the
/// cell); types of a line or more get a private cell rounded up to a whole
/// number of lines. Either way no element ever straddles a line boundary, so
/// two logical slots never share a line unless they share a cell.
///
/// Two invariants hold for every constructed value: `size_of_cell` is a
/// multiple of [`CACHE_LINE_SIZE`], and `align_of_type` divides the stride
/// between elements inside a cell.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CellInfo {
    size_of_type: usize,
    align_of_type: usize,
    size_of_cell: usize,
    elements_per_cell: usize,
}

impl CellInfo {
    /// Computes the packing of `T`.
    #[inline]
    pub const fn new<T>() -> Self {
        Self::from_raw(mem::size_of::<T>(), mem::align_of::<T>())
    }

    /// Computes the packing of a type known only by size and alignment, for
    /// descriptors built at runtime.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two, exceeds
    /// [`CACHE_LINE_SIZE`] (the table only guarantees cache-line alignment
    /// of its allocations, so types over-aligned beyond the line cannot be
    /// stored), or does not divide `size`: elements within a cell are laid
    /// out at `size`-byte strides, so a size that is not a multiple of the
    /// alignment would misalign every odd element.
    pub const fn from_raw(size: usize, align: usize) -> Self {
        assert!(align.is_power_of_two());
        assert!(align <= CACHE_LINE_SIZE);
        assert!(size % align == 0);

        if size == 0 {
            // Zero-sized elements: keep the divisions defined. Every copy of
            // such an element is a zero-byte no-op, so the offsets produced
            // for this packing are never dereferenced for more than 0 bytes.
            Self {
                size_of_type: 0,
                align_of_type: align,
                size_of_cell: CACHE_LINE_SIZE,
                elements_per_cell: CACHE_LINE_SIZE,
            }
        } else if size < CACHE_LINE_SIZE {
            Self {
                size_of_type: size,
                align_of_type: align,
                size_of_cell: CACHE_LINE_SIZE,
                elements_per_cell: CACHE_LINE_SIZE / size,
            }
        } else {
            Self {
                size_of_type: size,
                align_of_type: align,
                size_of_cell: round_up(size, CACHE_LINE_SIZE),
                elements_per_cell: 1,
            }
        }
    }

    /// Byte size of one element.
    #[inline]
    pub const fn size_of_type(&self) -> usize {
        self.size_of_type
    }

    /// Alignment requirement of one element.
    #[inline]
    pub const fn align_of_type(&self) -> usize {
        self.align_of_type
    }

    /// Byte size of one cell.
    #[inline]
    pub const fn size_of_cell(&self) -> usize {
        self.size_of_cell
    }

    /// Number of elements stored in each cell.
    #[inline]
    pub const fn elements_per_cell(&self) -> usize {
        self.elements_per_cell
    }

    /// Byte offset of logical slot `index` within a cell-packed array.
    ///
    /// When the descriptor is known at compile time the division constants
    /// fold away entirely; the common single- and double-element packings
    /// additionally avoid the division on the erased path.
    #[cfg_attr(feature = "inline-more", inline)]
    pub fn offset_of(&self, index: usize) -> usize {
        match self.elements_per_cell {
            1 => index * self.size_of_cell,
            2 => (index >> 1) * self.size_of_cell + (index & 1) * self.size_of_type,
            epc => (index / epc) * self.size_of_cell + (index % epc) * self.size_of_type,
        }
    }

    /// Bytes occupied by a cell-packed array of `len` elements, rounded up to
    /// whole cache lines so the next segment of an allocation can start
    /// line-aligned. Returns `None` on overflow.
    pub(crate) fn size_of_array(&self, len: usize) -> Option<usize> {
        let whole_cells = (len / self.elements_per_cell).checked_mul(self.size_of_cell)?;
        // The tail stays below one cell, so the multiplication cannot
        // overflow on its own.
        let bytes = whole_cells.checked_add((len % self.elements_per_cell) * self.size_of_type)?;
        bytes.checked_add(CACHE_LINE_SIZE - 1).map(|b| b & !(CACHE_LINE_SIZE - 1))
    }

    /// Non-checked variant of [`size_of_array`](Self::size_of_array) for hot
    /// paths that re-derive segment bases of an already validated allocation.
    #[cfg_attr(feature = "inline-more", inline)]
    pub(crate) fn size_of_array_unchecked(&self, len: usize) -> usize {
        let bytes = (len / self.elements_per_cell) * self.size_of_cell
            + (len % self.elements_per_cell) * self.size_of_type;
        round_up(bytes, CACHE_LINE_SIZE)
    }
}

/// Rounds `n` up to the next multiple of `to`, which must be a power of two.
#[inline]
pub(crate) const fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}
