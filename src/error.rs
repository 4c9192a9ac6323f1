use thiserror::Error;

/// Reasons an allocation request can fail.
///
/// Carries no heap data so it can be built and returned from inside the
/// allocator itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  /// The class has committed all of its addressable budget.
  #[error("size class ({a_group}, {s_group}) exhausted its committed budget")]
  RegionExhausted { a_group: u8, s_group: u8 },

  /// `mprotect` refused read/write access to a fresh chunk.
  #[error("committing a chunk for size class ({a_group}, {s_group}) failed: errno {errno}")]
  CommitFailed { a_group: u8, s_group: u8, errno: i32 },

  /// The one-time address-space reservation for a group failed.
  #[error("reserving alignment group {a_group} failed: errno {errno}")]
  ReservationFailed { a_group: u8, errno: i32 },

  /// The class window was already occupied when the group was reserved.
  #[error("size class ({a_group}, {s_group}) has no reserved window")]
  ClassUnavailable { a_group: u8, s_group: u8 },

  /// Anonymous mapping for a large object failed.
  #[error("mapping {size} bytes failed: errno {errno}")]
  MapFailed { size: usize, errno: i32 },

  /// The request does not fit the largest compressible size class.
  #[error("{size} bytes exceeds the largest compressible size class")]
  TooLarge { size: usize },

  #[error("allocation size overflows usize")]
  SizeOverflow,

  /// The calling thread's cache is busy (re-entrant call) or already torn down.
  #[error("thread cache is unavailable")]
  ThreadCacheUnavailable,

  #[error("invalid configuration: {0}")]
  InvalidConfig(&'static str),

  #[error("allocator is already initialized")]
  AlreadyInitialized,
}

impl AllocError {
  /// Whether the error reflects the OS or the address space running out.
  pub fn is_out_of_memory(&self) -> bool {
    matches!(
      self,
      Self::RegionExhausted { .. }
        | Self::CommitFailed { .. }
        | Self::MapFailed { .. }
        | Self::ClassUnavailable { .. }
    )
  }
}

/// Last OS error number for the calling thread.
pub(crate) fn errno() -> i32 {
  std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
