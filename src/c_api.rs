//! C allocation entry points (enabled with `--features c_api`).
//!
//! Linking the `cdylib` or `staticlib` with this feature replaces the process
//! allocator. Every failure is reported the C way: a null return, or an
//! errno value from `posix_memalign`.

use core::{
  alloc::Layout,
  ptr::{NonNull, copy_nonoverlapping, null_mut, write_bytes},
};

use crate::{SizeClass, alloc_layout, classify, padded_size, usable_size};

/// `alignof(max_align_t)` on the 64-bit targets we support.
const MIN_ALIGN: usize = 16;

/// Every block is suitably aligned for any C object, so requests are
/// rounded up to a multiple of [`MIN_ALIGN`] before picking a class.
#[inline]
fn c_layout(size: usize) -> Option<Layout> {
  Layout::from_size_align(size, MIN_ALIGN).ok()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  c_layout(size)
    .and_then(|layout| alloc_layout(layout).ok())
    .map_or(null_mut(), NonNull::as_ptr)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  if let Some(ptr) = NonNull::new(ptr) {
    unsafe { crate::free(ptr) }
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    return null_mut();
  };
  let ptr = unsafe { malloc(total) };
  if !ptr.is_null() {
    // Recycled slots carry old contents and free-list links.
    unsafe { write_bytes(ptr, 0, total) };
  }
  ptr
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  let Some(old) = NonNull::new(ptr) else {
    return unsafe { malloc(size) };
  };

  if size == 0 {
    unsafe { crate::free(old) };
    return null_mut();
  }

  if let Some((_, slot)) = classify(ptr as usize)
    && let Some(layout) = c_layout(size)
    && SizeClass::from_size(padded_size(layout)) == Some(slot.class())
  {
    return ptr;
  }

  let new_ptr = unsafe { malloc(size) };
  if !new_ptr.is_null() {
    unsafe {
      copy_nonoverlapping(ptr, new_ptr, usable_size(old).min(size));
      crate::free(old);
    }
  }
  new_ptr
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> i32 {
  if !alignment.is_power_of_two() || alignment < core::mem::size_of::<*mut u8>() {
    return libc::EINVAL;
  }
  let Ok(layout) = Layout::from_size_align(size, alignment) else {
    return libc::ENOMEM;
  };
  match alloc_layout(layout) {
    Ok(ptr) => {
      unsafe { *memptr = ptr.as_ptr() };
      0
    }
    Err(_) => libc::ENOMEM,
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  match NonNull::new(ptr) {
    Some(ptr) => unsafe { usable_size(ptr) },
    None => 0,
  }
}
