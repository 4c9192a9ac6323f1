//! Intrusive slot lists with relative links.
//!
//! The first four bytes of a free slot hold the distance to the next free
//! slot minus one, so a link of 0 means "the slot right after me". A freshly
//! committed (zeroed) run of slots is therefore already a valid ascending
//! list; only the last slot needs a link to [`NIL`].

/// Slot index that is never issued; terminates every list.
pub(crate) const NIL: u32 = u32::MAX;

#[inline(always)]
pub(crate) const fn encode_link(from: u32, to: u32) -> u32 {
  to.wrapping_sub(from).wrapping_sub(1)
}

#[inline(always)]
pub(crate) const fn decode_link(from: u32, link: u32) -> u32 {
  from.wrapping_add(link).wrapping_add(1)
}

/// A singly-linked list of free slots of one size class.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct FreeList {
  pub(crate) head: u32,
  pub(crate) count: u32,
}

impl FreeList {
  pub(crate) const EMPTY: Self = Self { head: NIL, count: 0 };

  #[inline(always)]
  pub(crate) const fn is_empty(&self) -> bool {
    self.count == 0
  }

  /// Detaches the head slot.
  ///
  /// # Safety
  ///
  /// `class_base` and `size` must describe the class this list belongs to,
  /// and every slot on the list must be committed and owned by the caller.
  #[inline(always)]
  pub(crate) unsafe fn pop(&mut self, class_base: usize, size: usize) -> Option<u32> {
    if self.count == 0 {
      debug_assert_eq!(self.head, NIL);
      return None;
    }
    let index = self.head;
    let link = unsafe { slot_link(class_base, size, index).read() };
    self.head = decode_link(index, link);
    self.count -= 1;
    debug_assert!(self.count > 0 || self.head == NIL, "unterminated free list");
    Some(index)
  }

  /// Prepends slot `index`.
  ///
  /// # Safety
  ///
  /// Same as [`pop`](Self::pop); additionally `index` must be a committed slot
  /// that is not on any list.
  #[inline(always)]
  pub(crate) unsafe fn push(&mut self, class_base: usize, size: usize, index: u32) {
    unsafe { slot_link(class_base, size, index).write(encode_link(index, self.head)) };
    self.head = index;
    self.count += 1;
  }
}

/// Link field of slot `index`. Slot sizes are multiples of 4 and class bases
/// are 2^36-aligned, so the field is always aligned.
#[inline(always)]
pub(crate) fn slot_link(class_base: usize, size: usize, index: u32) -> *mut u32 {
  (class_base + index as usize * size) as *mut u32
}
