//! Byte count to (alignment group, size group) mapping.
//!
//! | group | range     | granularity | shift |
//! |-------|-----------|-------------|-------|
//! | 1     | 4B..1K    | 4B          | 2     |
//! | 2     | 1K..4K    | 16B         | 4     |
//! | 3     | 4K..32K   | 128B        | 7     |
//! | 4     | 32K..512K | 2K          | 11    |
//! | 5     | 512K..8M  | 32K         | 15    |
//! | 6     | 8M..128M  | 512K        | 19    |
//!
//! Group 0 is never used, so an all-zero address field means "not ours".

// =============================================================================
// Constants
// =============================================================================

/// Alignment groups, including the unused group 0.
pub const A_GROUPS: usize = 7;
/// Size groups per alignment group.
pub const S_GROUPS: usize = 256;

/// Bit position of the alignment group in a heap offset.
pub const GROUP_SHIFT: u32 = 44;
/// Bit position of the size group in a heap offset.
pub const CLASS_SHIFT: u32 = 36;

/// Address span owned by one alignment group (16 TiB).
pub const GROUP_SPAN: usize = 1 << GROUP_SHIFT;
/// Address span owned by one size class (64 GiB).
pub const CLASS_SPAN: usize = 1 << CLASS_SHIFT;
const OFFSET_MASK: usize = CLASS_SPAN - 1;

/// Per-group shift: slot size is `(s_group + 1) << ALIGN_SHIFT[a_group]`.
pub const ALIGN_SHIFT: [u32; A_GROUPS] = [0, 2, 4, 7, 11, 15, 19];

/// Largest request served by a size class (128 MiB).
pub const MAX_SMALL_SIZE: usize = S_GROUPS << ALIGN_SHIFT[A_GROUPS - 1];

/// Alignment group by `leading_zeros(bytes - 1)`; 0 marks sizes past the table.
const GROUP_BY_LZ: [u8; 64] = build_group_table();

const _: () = assert!(MAX_SMALL_SIZE == 128 << 20);
const _: () = assert!(S_GROUPS * CLASS_SPAN == GROUP_SPAN);
const _: () = assert!(A_GROUPS * GROUP_SPAN <= 1 << 47);
const _: () = assert!(GROUP_BY_LZ[63 - 9] == 1 && GROUP_BY_LZ[63 - 10] == 2);
const _: () = assert!(GROUP_BY_LZ[63 - 26] == 6 && GROUP_BY_LZ[63 - 27] == 0);

/// Largest byte count served by `a_group`.
const fn group_max(a_group: usize) -> usize {
  S_GROUPS << ALIGN_SHIFT[a_group]
}

/// For every bit position `b` of `bytes - 1`, the first group whose largest
/// slot still covers `2^(b+1)` bytes.
const fn build_group_table() -> [u8; 64] {
  let mut table = [0u8; 64];
  let mut lz = 0;
  while lz < 64 {
    let bit = 63 - lz;
    let mut group = 1;
    while group < A_GROUPS {
      if bit + 1 < usize::BITS as usize && (1usize << (bit + 1)) <= group_max(group) {
        table[lz] = group as u8;
        break;
      }
      group += 1;
    }
    lz += 1;
  }
  table
}

// =============================================================================
// SizeClass
// =============================================================================

/// One (alignment group, size group) cell: a fixed slot size and its own
/// 64 GiB address window.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SizeClass {
  a_group: u8,
  s_group: u8,
}

impl SizeClass {
  /// Builds a class from raw coordinates. `a_group` must be in `1..=6`.
  #[inline]
  pub const fn new(a_group: u8, s_group: u8) -> Self {
    debug_assert!(a_group >= 1 && (a_group as usize) < A_GROUPS);
    Self { a_group, s_group }
  }

  /// Smallest class whose slot holds `bytes`; `None` above [`MAX_SMALL_SIZE`].
  /// A zero-byte request maps to the smallest class.
  #[inline]
  pub fn from_size(bytes: usize) -> Option<Self> {
    if bytes > MAX_SMALL_SIZE {
      return None;
    }
    let bytes = bytes.max(1);
    // `| 1` keeps a request of one byte out of the all-zero bucket.
    let lz = ((bytes - 1) | 1).leading_zeros() as usize;
    let a_group = GROUP_BY_LZ[lz];
    debug_assert!(a_group != 0);

    let shift = ALIGN_SHIFT[a_group as usize];
    let rem = (bytes & ((1 << shift) - 1) != 0) as usize;
    let s_group = (bytes >> shift) + rem - 1;
    debug_assert!(s_group < S_GROUPS);
    Some(Self::new(a_group, s_group as u8))
  }

  /// Splits a heap offset (address minus base) into its class and the byte
  /// offset inside the class window. `None` when the group field is 0 or 7.
  #[inline]
  pub fn from_offset(offset: usize) -> Option<(Self, usize)> {
    let a_group = offset >> GROUP_SHIFT;
    if a_group == 0 || a_group >= A_GROUPS {
      return None;
    }
    let s_group = (offset >> CLASS_SHIFT) & (S_GROUPS - 1);
    Some((Self::new(a_group as u8, s_group as u8), offset & OFFSET_MASK))
  }

  #[inline]
  pub const fn a_group(self) -> u8 {
    self.a_group
  }

  #[inline]
  pub const fn s_group(self) -> u8 {
    self.s_group
  }

  #[inline]
  pub const fn align_shift(self) -> u32 {
    ALIGN_SHIFT[self.a_group as usize]
  }

  /// Slot size in bytes.
  #[inline]
  pub const fn size(self) -> usize {
    (self.s_group as usize + 1) << self.align_shift()
  }

  /// Largest power of two dividing every slot address of this class.
  #[inline]
  pub const fn slot_align(self) -> usize {
    1 << self.size().trailing_zeros()
  }

  /// Offset of the class window from the heap base.
  #[inline]
  pub const fn window_offset(self) -> usize {
    (self.a_group as usize) << GROUP_SHIFT | (self.s_group as usize) << CLASS_SHIFT
  }

  /// Number of size-group bits folded into the top of the index field.
  #[inline]
  pub const fn s_bits(self) -> u32 {
    s_bits(self.s_group)
  }

  /// Slot indices the compressed encoding can express for this class.
  #[inline]
  pub const fn index_capacity(self) -> u32 {
    1 << (31 - self.s_bits())
  }

  /// Slots available under a committed-byte `limit`.
  #[inline]
  pub const fn slot_capacity(self, limit: usize) -> u32 {
    let by_bytes = limit / self.size();
    let by_index = self.index_capacity() as usize;
    if by_bytes < by_index { by_bytes as u32 } else { by_index as u32 }
  }
}

/// `floor(log2(s_group))`, with 0 for groups 0 and 1.
#[inline]
pub(crate) const fn s_bits(s_group: u8) -> u32 {
  if s_group < 2 { 0 } else { 7 - s_group.leading_zeros() }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn size_of(bytes: usize) -> usize {
    SizeClass::from_size(bytes).unwrap().size()
  }

  #[test]
  fn documented_examples() {
    assert_eq!(size_of(42), 44);
    // 5000 sits in the 4K..32K range, whose granularity is 128 bytes.
    assert_eq!(size_of(5000), 5120);
  }

  #[test]
  fn group_boundaries() {
    let edges = [
      (1, 1, 0, 4),
      (4, 1, 0, 4),
      (5, 1, 1, 8),
      (1024, 1, 255, 1024),
      (1025, 2, 64, 1040),
      (4096, 2, 255, 4096),
      (4097, 3, 32, 4224),
      (32 << 10, 3, 255, 32 << 10),
      ((32 << 10) + 1, 4, 16, 34 << 10),
      (512 << 10, 4, 255, 512 << 10),
      ((512 << 10) + 1, 5, 16, 544 << 10),
      (8 << 20, 5, 255, 8 << 20),
      ((8 << 20) + 1, 6, 16, (8 << 20) + (512 << 10)),
      (128 << 20, 6, 255, 128 << 20),
    ];
    for (bytes, a, s, size) in edges {
      let class = SizeClass::from_size(bytes).unwrap();
      assert_eq!((class.a_group(), class.s_group()), (a, s), "bytes = {bytes}");
      assert_eq!(class.size(), size, "bytes = {bytes}");
    }
  }

  #[test]
  fn zero_maps_to_smallest_class() {
    assert_eq!(SizeClass::from_size(0), Some(SizeClass::new(1, 0)));
  }

  #[test]
  fn past_the_table_is_none() {
    assert_eq!(SizeClass::from_size(MAX_SMALL_SIZE + 1), None);
    assert_eq!(SizeClass::from_size(usize::MAX), None);
  }

  #[test]
  fn every_size_up_to_64k_is_minimal() {
    let mut prev = 0;
    for bytes in 1..=(64 << 10) {
      let size = size_of(bytes);
      assert!(size >= bytes);
      assert!(size >= prev);
      // The next smaller slot in the same group would not fit.
      let class = SizeClass::from_size(bytes).unwrap();
      let granule = 1 << class.align_shift();
      assert!(size - granule < bytes, "bytes = {bytes}, size = {size}");
      prev = size;
    }
  }

  #[test]
  fn window_offsets_round_trip() {
    for a in 1..A_GROUPS as u8 {
      for s in [0u8, 1, 2, 77, 128, 255] {
        let class = SizeClass::new(a, s);
        let (back, off) = SizeClass::from_offset(class.window_offset() + 12345).unwrap();
        assert_eq!(back, class);
        assert_eq!(off, 12345);
      }
    }
    assert_eq!(SizeClass::from_offset(123), None);
    assert_eq!(SizeClass::from_offset(7 << GROUP_SHIFT), None);
  }

  #[test]
  fn s_bits_is_floor_log2() {
    assert_eq!(s_bits(0), 0);
    assert_eq!(s_bits(1), 0);
    assert_eq!(s_bits(2), 1);
    assert_eq!(s_bits(3), 1);
    assert_eq!(s_bits(4), 2);
    assert_eq!(s_bits(127), 6);
    assert_eq!(s_bits(128), 7);
    assert_eq!(s_bits(255), 7);
  }

  #[test]
  fn slot_capacity_respects_index_width() {
    // 1 KiB slots: 2^26 fit in the window but the index holds only 2^24.
    let class = SizeClass::new(1, 255);
    assert_eq!(class.slot_capacity(CLASS_SPAN), 1 << 24);
    // 128 MiB slots are bounded by bytes.
    let class = SizeClass::new(6, 255);
    assert_eq!(class.slot_capacity(CLASS_SPAN), 512);
  }

  #[test]
  fn slot_align_divides_size() {
    assert_eq!(SizeClass::new(1, 10).slot_align(), 4); // 44
    assert_eq!(SizeClass::new(1, 3).slot_align(), 16); // 16
    assert_eq!(SizeClass::new(6, 255).slot_align(), 128 << 20);
  }
}
