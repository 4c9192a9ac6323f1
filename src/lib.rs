#![allow(clippy::missing_safety_doc)]

//! A thread-caching allocator whose small objects live at addresses that
//! encode their own size class.
//!
//! Requests up to [`MAX_SMALL_SIZE`] are served from fixed per-class address
//! windows, so every such allocation can also be named by a 64-bit
//! [`CompressedPtr`] and freed without a size or a lookup. Anything larger
//! is mapped directly.

use core::{
  alloc::{GlobalAlloc, Layout},
  ptr::{NonNull, copy_nonoverlapping, null_mut, write_bytes},
};

mod config;
mod error;
mod freelist;
mod heap;
mod large;
mod pool;
mod ptr;
mod region;
mod size_class;
mod trace;
mod typed;

#[cfg(feature = "c_api")]
pub mod c_api;

pub use config::Config;
pub use error::AllocError;
pub use ptr::{CompressedPtr, TAG_BITS, TAG_MAX};
pub use region::{active_config, init, init_with, page_size};
pub use size_class::{A_GROUPS, ALIGN_SHIFT, MAX_SMALL_SIZE, S_GROUPS, SizeClass};
pub use typed::{Allocate, Compressed, Uncompressed};

use crate::{
  heap::{alloc_small, free_small},
  large::{LARGE_HEADER, alloc_large, free_large, large_size},
  region::Regions,
};

// =============================================================================
// Dispatch
// =============================================================================

/// The reservation and compressed form of `address`, if it is one of our
/// slots. Everything else is either a large allocation or foreign.
#[inline(always)]
fn classify(address: usize) -> Option<(&'static Regions, CompressedPtr)> {
  let regions = region::try_get()?;
  regions.owner(address)?;
  Some((regions, CompressedPtr::from_raw(address)?))
}

/// Allocates `size` bytes, aligned to the largest power of two dividing the
/// slot size (at least 4) or to 16 for large requests.
///
/// Requests above [`MAX_SMALL_SIZE`] are mapped directly. So are smaller ones
/// whose class window could not be reserved, or that arrive while this
/// thread is already inside the allocator.
pub fn malloc(size: usize) -> Result<NonNull<u8>, AllocError> {
  let Some(class) = SizeClass::from_size(size) else {
    return alloc_large(size, LARGE_HEADER);
  };
  match alloc_small(region::get(), class) {
    Ok(ptr) => Ok(ptr.as_non_null()),
    Err(AllocError::ClassUnavailable { .. } | AllocError::ThreadCacheUnavailable) => {
      alloc_large(size, LARGE_HEADER)
    }
    Err(err) => Err(err),
  }
}

/// Releases memory from [`malloc`], [`compressed_alloc`] or the typed
/// handles.
///
/// # Safety
///
/// `ptr` must come from this allocator and must not be freed twice.
pub unsafe fn free(ptr: NonNull<u8>) {
  match classify(ptr.as_ptr() as usize) {
    Some((regions, slot)) => unsafe { free_small(regions, slot) },
    None => unsafe { free_large(ptr) },
  }
}

/// Usable bytes behind `ptr`: the slot size for small objects, the
/// requested size for large ones.
///
/// # Safety
///
/// `ptr` must be a live allocation from this allocator.
pub unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
  match classify(ptr.as_ptr() as usize) {
    Some((_, slot)) => slot.size(),
    None => unsafe { large_size(ptr) },
  }
}

/// Allocates a slot able to hold `size` bytes and returns its compressed
/// name. Never falls back to a direct mapping.
pub fn compressed_alloc(size: usize) -> Result<CompressedPtr, AllocError> {
  let class = SizeClass::from_size(size).ok_or(AllocError::TooLarge { size })?;
  alloc_small(region::get(), class)
}

/// # Safety
///
/// `ptr` must come from [`compressed_alloc`] (any tag) and must not be freed
/// twice.
pub unsafe fn compressed_free(ptr: CompressedPtr) {
  debug_assert!(!ptr.is_null());
  if let Some(regions) = region::try_get() {
    unsafe { free_small(regions, ptr.without_tag()) };
  }
}

/// A compressed slot for one `T`.
#[inline]
pub fn typed_allocate<T>() -> Result<CompressedPtr, AllocError> {
  compressed_alloc_layout(Layout::new::<T>())
}

/// A compressed slot for `n` contiguous `T`s; fails with
/// [`AllocError::TooLarge`] past [`MAX_SMALL_SIZE`].
#[inline]
pub fn typed_allocate_n<T>(n: usize) -> Result<CompressedPtr, AllocError> {
  let layout = Layout::array::<T>(n).map_err(|_| AllocError::SizeOverflow)?;
  compressed_alloc_layout(layout)
}

/// Size a request must be rounded to so its slot lands on `layout.align()`.
/// Class bases are 2^36-aligned, and a slot size that is a multiple of the
/// alignment keeps every slot aligned.
#[inline(always)]
pub(crate) fn padded_size(layout: Layout) -> usize {
  layout.pad_to_align().size().max(layout.align())
}

pub(crate) fn compressed_alloc_layout(layout: Layout) -> Result<CompressedPtr, AllocError> {
  compressed_alloc(padded_size(layout))
}

/// Layouts up to 16-aligned take the [`malloc`] path. Stricter ones prefer a
/// size class, whose slots are aligned to `slot_align`, and fall back to a
/// padded direct mapping.
pub(crate) fn alloc_layout(layout: Layout) -> Result<NonNull<u8>, AllocError> {
  let size = padded_size(layout);
  if layout.align() <= LARGE_HEADER {
    return malloc(size);
  }
  match compressed_alloc(size) {
    Ok(slot) => {
      debug_assert!(slot.class().slot_align() >= layout.align());
      Ok(slot.as_non_null())
    }
    Err(
      AllocError::TooLarge { .. }
      | AllocError::ClassUnavailable { .. }
      | AllocError::ThreadCacheUnavailable,
    ) => alloc_large(size, layout.align()),
    Err(err) => Err(err),
  }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// Zero-sized handle for `#[global_allocator]`.
pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    alloc_layout(layout).map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    if let Some(ptr) = NonNull::new(ptr) {
      unsafe { free(ptr) }
    }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
      return null_mut();
    };

    // Same size class: the slot already fits.
    if let Some((_, slot)) = classify(ptr as usize)
      && SizeClass::from_size(padded_size(new_layout)) == Some(slot.class())
    {
      return ptr;
    }

    let new_ptr = unsafe { self.alloc(new_layout) };
    if !new_ptr.is_null() {
      unsafe {
        copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
        self.dealloc(ptr, layout);
      }
    }
    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn padding_keeps_slots_aligned() {
    for align in [1, 2, 4, 8, 16, 32, 64, 128, 4096] {
      for size in [0, 1, 3, 17, 100, 1000, 5000, 70_000] {
        let layout = Layout::from_size_align(size, align).unwrap();
        let class = SizeClass::from_size(padded_size(layout)).unwrap();
        assert!(class.slot_align() >= align, "size = {size}, align = {align}");
      }
    }
  }

  #[test]
  fn small_and_large_dispatch() {
    let small = malloc(100).unwrap();
    let large = malloc(MAX_SMALL_SIZE + 1).unwrap();
    unsafe {
      assert_eq!(usable_size(small), 100);
      assert_eq!(usable_size(large), MAX_SMALL_SIZE + 1);
      assert!(classify(small.as_ptr() as usize).is_some());
      assert!(classify(large.as_ptr() as usize).is_none());
      free(small);
      free(large);
    }
  }

  #[test]
  fn compressed_alloc_rejects_large() {
    assert_eq!(
      compressed_alloc(MAX_SMALL_SIZE + 1),
      Err(AllocError::TooLarge { size: MAX_SMALL_SIZE + 1 })
    );
  }

  #[test]
  fn tagged_pointers_free_cleanly() {
    let p = compressed_alloc(24).unwrap();
    let cached = heap::cached_slots(p.class());
    unsafe { compressed_free(p.with_tag(TAG_MAX)) };
    assert_eq!(heap::cached_slots(p.class()), cached + 1);
  }

  #[test]
  fn over_aligned_layouts_past_the_classes_are_mapped() {
    let a = Allocator;
    for align in [32, 4096] {
      let layout = Layout::from_size_align(MAX_SMALL_SIZE + 1, align).unwrap();
      unsafe {
        let p = a.alloc(layout);
        assert!(!p.is_null(), "align = {align}");
        assert_eq!(p as usize % align, 0);
        assert!(classify(p as usize).is_none());
        assert_eq!(usable_size(NonNull::new_unchecked(p)), padded_size(layout));
        p.add(MAX_SMALL_SIZE).write(9);
        a.dealloc(p, layout);
      }
    }
  }

  #[test]
  fn over_aligned_fallback_when_the_cache_is_busy() {
    // A nested call finds the thread cache taken and must still succeed.
    let layout = Layout::from_size_align(256, 64).unwrap();
    let nested = heap::nested(|| alloc_layout(layout)).unwrap();
    let p = nested.unwrap();
    assert_eq!(p.as_ptr() as usize % 64, 0);
    assert!(classify(p.as_ptr() as usize).is_none());
    unsafe { free(p) };
  }

  #[test]
  fn realloc_in_place_within_a_class() {
    let a = Allocator;
    let layout = Layout::from_size_align(40, 8).unwrap();
    unsafe {
      let p = a.alloc(layout);
      assert!(!p.is_null());
      assert_eq!(a.realloc(p, layout, 38), p);
      p.write_bytes(7, 38);
      let q = a.realloc(p, Layout::from_size_align(38, 8).unwrap(), 4000);
      assert_ne!(q, p);
      assert_eq!(*q.add(37), 7);
      a.dealloc(q, Layout::from_size_align(4000, 8).unwrap());
    }
  }
}
