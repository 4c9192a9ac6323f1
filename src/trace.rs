//! Allocator events.
//!
//! With the `tracing` feature these emit structured `tracing` events; without
//! it every hook is an empty inline function. Hooks only fire on slow paths
//! (reservation, commit, donation failure, large mappings), never per slot.

#[cfg(feature = "tracing")]
mod internal {
  pub fn group_reserved(a_group: u8, address: usize, bytes: usize) {
    tracing::info!(a_group, address, bytes, "group_reserved");
  }

  pub fn class_window_taken(a_group: u8, s_group: u8, address: usize) {
    tracing::warn!(a_group, s_group, address, "class_window_taken");
  }

  pub fn reservation_failed(a_group: u8, errno: i32) {
    tracing::error!(a_group, errno, "reservation_failed");
  }

  pub fn chunk_committed(a_group: u8, s_group: u8, chunk: u64, slots: u32) {
    tracing::debug!(a_group, s_group, chunk, slots, "chunk_committed");
  }

  pub fn commit_failed(a_group: u8, s_group: u8, errno: i32) {
    tracing::warn!(a_group, s_group, errno, "commit_failed");
  }

  pub fn region_exhausted(a_group: u8, s_group: u8) {
    tracing::warn!(a_group, s_group, "region_exhausted");
  }

  pub fn pool_exhausted(count: u32) {
    tracing::trace!(count, "pool_exhausted");
  }

  pub fn large_mapped(bytes: usize) {
    tracing::trace!(bytes, "large_mapped");
  }
}

#[cfg(not(feature = "tracing"))]
mod internal {
  #[inline(always)]
  pub fn group_reserved(_a_group: u8, _address: usize, _bytes: usize) {}

  #[inline(always)]
  pub fn class_window_taken(_a_group: u8, _s_group: u8, _address: usize) {}

  #[inline(always)]
  pub fn reservation_failed(_a_group: u8, _errno: i32) {}

  #[inline(always)]
  pub fn chunk_committed(_a_group: u8, _s_group: u8, _chunk: u64, _slots: u32) {}

  #[inline(always)]
  pub fn commit_failed(_a_group: u8, _s_group: u8, _errno: i32) {}

  #[inline(always)]
  pub fn region_exhausted(_a_group: u8, _s_group: u8) {}

  #[inline(always)]
  pub fn pool_exhausted(_count: u32) {}

  #[inline(always)]
  pub fn large_mapped(_bytes: usize) {}
}

pub(crate) use internal::*;
