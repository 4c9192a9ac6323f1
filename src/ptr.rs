//! Compressed pointers.
//!
//! A [`CompressedPtr`] names a slot by (alignment group, size group, index)
//! packed into 39 bits, leaving 25 high bits to the caller as a tag:
//!
//! ```text
//!  63        39 38   36 35  33  32  31                          0
//! +------------+-------+------+-----+----------------------------+
//! |    tag     |a_group|s_bits|s_low|  s_group high bits | index |
//! +------------+-------+------+-----+----------------------------+
//! ```
//!
//! The size group is split: its low bit lives in `s_low`, the rest sits in
//! the top `s_bits + 1` bits of the 32-bit index field, above the slot index.
//! Small groups therefore leave more room for the index, which is what lets
//! the small, numerous classes address more slots.

use core::{fmt, ptr::NonNull};

use crate::{region, size_class::{self, SizeClass}};

// =============================================================================
// Constants
// =============================================================================

const S_LOW_SHIFT: u32 = 32;
const S_BITS_SHIFT: u32 = 33;
const A_GROUP_SHIFT: u32 = 36;
const TAG_SHIFT: u32 = 39;

/// Width of the caller-owned tag.
pub const TAG_BITS: u32 = 25;
/// Largest tag value.
pub const TAG_MAX: u32 = (1 << TAG_BITS) - 1;

const UNTAGGED_MASK: u64 = (1 << TAG_SHIFT) - 1;

/// Index mask for each `s_bits` value.
const IDX_MASK: [u32; 8] = {
  let mut masks = [0u32; 8];
  let mut bits = 0;
  while bits < 8 {
    masks[bits] = (1 << (31 - bits)) - 1;
    bits += 1;
  }
  masks
};

const _: () = assert!(TAG_SHIFT + TAG_BITS == 64);
const _: () = assert!(IDX_MASK[0] == 0x7FFF_FFFF && IDX_MASK[7] == 0x00FF_FFFF);

// =============================================================================
// CompressedPtr
// =============================================================================

/// A slot reference that converts to and from a real address by arithmetic
/// alone.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CompressedPtr(u64);

impl CompressedPtr {
  /// Group 0 never holds slots, so all-zero bits are free to mean "null".
  pub const NULL: Self = Self(0);

  /// Encodes a slot. `index` must fit in the class's index field.
  #[inline]
  pub const fn from_parts(a_group: u8, s_group: u8, index: u32) -> Self {
    debug_assert!(a_group >= 1 && (a_group as usize) < size_class::A_GROUPS);
    let s_bits = size_class::s_bits(s_group);
    debug_assert!(index <= IDX_MASK[s_bits as usize]);
    let high = ((s_group & !1) as u32) << (31 - s_bits);
    let packed = high | index;
    Self(
      packed as u64
        | ((s_group & 1) as u64) << S_LOW_SHIFT
        | (s_bits as u64) << S_BITS_SHIFT
        | (a_group as u64) << A_GROUP_SHIFT,
    )
  }

  /// Encodes the slot `index` of `class`.
  #[inline]
  pub const fn new(class: SizeClass, index: u32) -> Self {
    Self::from_parts(class.a_group(), class.s_group(), index)
  }

  /// Decodes a heap offset (address minus base). Interior offsets resolve to
  /// the slot that contains them.
  #[inline]
  pub fn from_offset(offset: usize) -> Option<Self> {
    let (class, within) = SizeClass::from_offset(offset)?;
    let index = within / class.size();
    if index > IDX_MASK[class.s_bits() as usize] as usize {
      return None;
    }
    Some(Self::new(class, index as u32))
  }

  /// Decodes a raw address handed out by this allocator.
  #[inline]
  pub fn from_raw(address: usize) -> Option<Self> {
    Self::from_offset(address.wrapping_sub(region::base()))
  }

  /// Reinterprets bits produced by [`to_bits`](Self::to_bits).
  #[inline]
  pub const fn from_bits(bits: u64) -> Self {
    Self(bits)
  }

  #[inline]
  pub const fn to_bits(self) -> u64 {
    self.0
  }

  #[inline]
  pub const fn is_null(self) -> bool {
    self.a_group() == 0
  }

  #[inline]
  pub const fn a_group(self) -> u8 {
    ((self.0 >> A_GROUP_SHIFT) & 0b111) as u8
  }

  #[inline]
  const fn s_bits(self) -> u32 {
    ((self.0 >> S_BITS_SHIFT) & 0b111) as u32
  }

  #[inline]
  pub const fn s_group(self) -> u8 {
    let s_bits = self.s_bits();
    let packed = self.0 as u32;
    let s_low = ((self.0 >> S_LOW_SHIFT) & 1) as u32;
    (s_low | (packed & !IDX_MASK[s_bits as usize]) >> (31 - s_bits)) as u8
  }

  #[inline]
  pub const fn index(self) -> u32 {
    self.0 as u32 & IDX_MASK[self.s_bits() as usize]
  }

  #[inline]
  pub const fn class(self) -> SizeClass {
    SizeClass::new(self.a_group(), self.s_group())
  }

  /// Slot size in bytes.
  #[inline]
  pub const fn size(self) -> usize {
    (self.s_group() as usize + 1) << size_class::ALIGN_SHIFT[self.a_group() as usize]
  }

  #[inline]
  pub const fn tag(self) -> u32 {
    (self.0 >> TAG_SHIFT) as u32
  }

  /// Replaces the tag; bits above [`TAG_BITS`] are dropped.
  #[inline]
  pub const fn with_tag(self, tag: u32) -> Self {
    Self(self.0 & UNTAGGED_MASK | ((tag & TAG_MAX) as u64) << TAG_SHIFT)
  }

  #[inline]
  pub const fn without_tag(self) -> Self {
    Self(self.0 & UNTAGGED_MASK)
  }

  /// Offset of the slot from the heap base.
  #[inline]
  pub const fn offset(self) -> usize {
    self.class().window_offset() | self.index() as usize * self.size()
  }

  /// Real address of the slot.
  #[inline]
  pub fn address(self) -> usize {
    region::base() + self.offset()
  }

  #[inline]
  pub fn as_ptr(self) -> *mut u8 {
    self.address() as *mut u8
  }

  /// # Panics
  ///
  /// Panics on [`CompressedPtr::NULL`].
  #[inline]
  pub fn as_non_null(self) -> NonNull<u8> {
    assert!(!self.is_null(), "null compressed pointer");
    // SAFETY: group >= 1 puts the address at or above 2^44.
    unsafe { NonNull::new_unchecked(self.as_ptr()) }
  }
}

impl Default for CompressedPtr {
  fn default() -> Self {
    Self::NULL
  }
}

impl fmt::Debug for CompressedPtr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_null() {
      return f.write_str("CompressedPtr(null)");
    }
    f.debug_struct("CompressedPtr")
      .field("a_group", &self.a_group())
      .field("s_group", &self.s_group())
      .field("index", &self.index())
      .field("tag", &self.tag())
      .finish()
  }
}
