//! Direct-mapped allocations, for requests no size class can hold.
//!
//! The 16 bytes right before the payload hold the requested size and the
//! distance back to the start of the mapping, so over-aligned payloads can
//! sit anywhere inside it. Nothing here is compressed or cached: free unmaps
//! immediately.

use core::ptr::NonNull;

use crate::{
  error::AllocError,
  region::{self, os_mmap, os_munmap},
  trace,
};

/// Bytes in front of every large allocation; also the alignment a mapping
/// gives without padding.
pub(crate) const LARGE_HEADER: usize = 16;

/// Maps `size` bytes aligned to `align` (a power of two).
pub(crate) fn alloc_large(size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
  debug_assert!(align.is_power_of_two());
  let align = align.max(LARGE_HEADER);
  // Room for the header plus the worst-case distance to an aligned address.
  let pad = if align == LARGE_HEADER { LARGE_HEADER } else { align + LARGE_HEADER };
  let total = size.checked_add(pad).ok_or(AllocError::SizeOverflow)?;
  let raw = unsafe { os_mmap(total) }.map_err(|errno| AllocError::MapFailed { size: total, errno })?;
  trace::large_mapped(total);

  let base = raw as usize;
  let payload = (base + LARGE_HEADER).next_multiple_of(align);
  let offset = payload - base;

  // Give back whole pages past the payload; `free_large` only knows
  // `offset + size`.
  let page = region::page_size();
  let used = (offset + size).next_multiple_of(page);
  let mapped = total.next_multiple_of(page);
  if mapped > used {
    unsafe { os_munmap(raw.add(used), mapped - used) };
  }

  unsafe {
    let header = raw.add(offset - LARGE_HEADER).cast::<usize>();
    header.write(size);
    header.add(1).write(offset);
    Ok(NonNull::new_unchecked(raw.add(offset)))
  }
}

/// Requested size of a large allocation.
///
/// # Safety
///
/// `ptr` must come from [`alloc_large`] and still be live.
#[inline]
pub(crate) unsafe fn large_size(ptr: NonNull<u8>) -> usize {
  unsafe { ptr.as_ptr().sub(LARGE_HEADER).cast::<usize>().read() }
}

/// # Safety
///
/// `ptr` must come from [`alloc_large`] and must not be used afterwards.
pub(crate) unsafe fn free_large(ptr: NonNull<u8>) {
  unsafe {
    let header = ptr.as_ptr().sub(LARGE_HEADER).cast::<usize>();
    let size = header.read();
    let offset = header.add(1).read();
    os_munmap(ptr.as_ptr().sub(offset), offset + size);
  }
}
