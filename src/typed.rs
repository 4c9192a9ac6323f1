//! Generic allocator handles for containers.
//!
//! Data structures take an `A: Allocate<Node>` and never see how memory is
//! obtained. [`Compressed`] hands out 64-bit [`CompressedPtr`]s (which leave
//! 25 bits free for the container's own tags); [`Uncompressed`] hands out
//! plain pointers and accepts any size.

use core::{alloc::Layout, fmt, marker::PhantomData, ptr::NonNull};

use crate::{error::AllocError, ptr::CompressedPtr};

pub trait Allocate<T> {
  /// Handle to an allocation of one or more `T`s.
  type Ptr: Copy;

  /// Room for one `T`.
  #[inline]
  fn allocate(&self) -> Result<Self::Ptr, AllocError> {
    self.allocate_n(1)
  }

  /// Room for `n` contiguous `T`s.
  fn allocate_n(&self, n: usize) -> Result<Self::Ptr, AllocError>;

  /// Usable bytes behind `ptr`; at least what was requested.
  fn size(&self, ptr: Self::Ptr) -> usize;

  /// Address of the first `T`.
  fn as_ptr(&self, ptr: Self::Ptr) -> *mut T;

  /// # Safety
  ///
  /// `ptr` must come from this allocator and must not be used afterwards.
  unsafe fn free(&self, ptr: Self::Ptr);
}

fn array_layout<T>(n: usize) -> Result<Layout, AllocError> {
  Layout::array::<T>(n).map_err(|_| AllocError::SizeOverflow)
}

// =============================================================================
// Compressed
// =============================================================================

/// Size-class allocation with compressed handles. Requests above
/// [`MAX_SMALL_SIZE`](crate::MAX_SMALL_SIZE) fail with
/// [`AllocError::TooLarge`].
pub struct Compressed<T>(PhantomData<fn() -> T>);

impl<T> Compressed<T> {
  pub const fn new() -> Self {
    Self(PhantomData)
  }
}

impl<T> Allocate<T> for Compressed<T> {
  type Ptr = CompressedPtr;

  #[inline]
  fn allocate_n(&self, n: usize) -> Result<CompressedPtr, AllocError> {
    crate::compressed_alloc_layout(array_layout::<T>(n)?)
  }

  #[inline]
  fn size(&self, ptr: CompressedPtr) -> usize {
    ptr.size()
  }

  #[inline]
  fn as_ptr(&self, ptr: CompressedPtr) -> *mut T {
    ptr.as_ptr().cast()
  }

  #[inline]
  unsafe fn free(&self, ptr: CompressedPtr) {
    unsafe { crate::compressed_free(ptr) }
  }
}

// =============================================================================
// Uncompressed
// =============================================================================

/// Plain pointers, any size. Large requests go straight to the OS.
pub struct Uncompressed<T>(PhantomData<fn() -> T>);

impl<T> Uncompressed<T> {
  pub const fn new() -> Self {
    Self(PhantomData)
  }
}

impl<T> Allocate<T> for Uncompressed<T> {
  type Ptr = NonNull<T>;

  #[inline]
  fn allocate_n(&self, n: usize) -> Result<NonNull<T>, AllocError> {
    crate::alloc_layout(array_layout::<T>(n)?).map(NonNull::cast)
  }

  #[inline]
  fn size(&self, ptr: NonNull<T>) -> usize {
    unsafe { crate::usable_size(ptr.cast()) }
  }

  #[inline]
  fn as_ptr(&self, ptr: NonNull<T>) -> *mut T {
    ptr.as_ptr()
  }

  #[inline]
  unsafe fn free(&self, ptr: NonNull<T>) {
    unsafe { crate::free(ptr.cast()) }
  }
}

// Handles are stateless; none of these should depend on `T`.
macro_rules! stateless_handle {
  ($name:ident) => {
    impl<T> Clone for $name<T> {
      fn clone(&self) -> Self {
        *self
      }
    }

    impl<T> Copy for $name<T> {}

    impl<T> Default for $name<T> {
      fn default() -> Self {
        Self::new()
      }
    }

    impl<T> fmt::Debug for $name<T> {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(stringify!($name))
      }
    }
  };
}

stateless_handle!(Compressed);
stateless_handle!(Uncompressed);
