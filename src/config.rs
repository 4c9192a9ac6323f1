//! Allocator configuration.
//!
//! Settings can be built programmatically or read from the environment. The
//! environment is read with `getenv` and parsed in place, so loading it never
//! allocates (the allocator may be the one serving those allocations).
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `CPTRALLOC_BASE` | Offset added to every heap address, multiple of 2^44 | 0 |
//! | `CPTRALLOC_CLASS_LIMIT` | Max committed bytes per size class, at most 2^36 | 2^36 |
//! | `CPTRALLOC_CHUNK_SIZE` | Minimum commit chunk, power of two, at least a page | 512 KiB |
//! | `CPTRALLOC_DONATE_THRESHOLD` | Thread list length that triggers donation | 128 |
//!
//! Numbers are decimal or `0x`-prefixed hex. Invalid values are ignored.

use core::ffi::CStr;

use crate::{
  error::AllocError,
  region,
  size_class::{A_GROUPS, CLASS_SPAN, GROUP_SPAN},
};

const DEFAULT_CHUNK_SIZE: usize = 512 << 10;
const DEFAULT_DONATE_THRESHOLD: u32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  base: usize,
  class_limit: usize,
  chunk_size: usize,
  donate_threshold: u32,
}

impl Config {
  pub const fn new() -> Self {
    Self {
      base: 0,
      class_limit: CLASS_SPAN,
      chunk_size: DEFAULT_CHUNK_SIZE,
      donate_threshold: DEFAULT_DONATE_THRESHOLD,
    }
  }

  /// Defaults overridden by any valid `CPTRALLOC_*` variables.
  pub fn from_env() -> Self {
    let mut config = Self::new();
    let mut apply = |name: &CStr, set: fn(Self, usize) -> Self| {
      if let Some(value) = env_usize(name) {
        let candidate = set(config, value);
        if candidate.validate().is_ok() {
          config = candidate;
        }
      }
    };
    apply(c"CPTRALLOC_BASE", Self::with_base);
    apply(c"CPTRALLOC_CLASS_LIMIT", Self::with_class_limit);
    apply(c"CPTRALLOC_CHUNK_SIZE", Self::with_chunk_size);
    apply(c"CPTRALLOC_DONATE_THRESHOLD", |c, v| {
      c.with_donate_threshold(u32::try_from(v).unwrap_or(u32::MAX))
    });
    config
  }

  /// Offset added to every heap address.
  pub fn with_base(mut self, base: usize) -> Self {
    self.base = base;
    self
  }

  /// Committed-byte budget of each size class.
  pub fn with_class_limit(mut self, limit: usize) -> Self {
    self.class_limit = limit;
    self
  }

  /// Minimum number of bytes committed at a time.
  pub fn with_chunk_size(mut self, size: usize) -> Self {
    self.chunk_size = size;
    self
  }

  /// Thread-local list length at which the list is handed to the global pool.
  pub fn with_donate_threshold(mut self, threshold: u32) -> Self {
    self.donate_threshold = threshold;
    self
  }

  pub fn validate(&self) -> Result<(), AllocError> {
    if self.base % GROUP_SPAN != 0 {
      return Err(AllocError::InvalidConfig("base must be a multiple of 2^44"));
    }
    if self.base.checked_add(A_GROUPS * GROUP_SPAN).is_none() {
      return Err(AllocError::InvalidConfig("base leaves no room for the heap"));
    }
    if self.class_limit == 0 || self.class_limit > CLASS_SPAN {
      return Err(AllocError::InvalidConfig("class limit must be in 1..=2^36"));
    }
    if !self.chunk_size.is_power_of_two()
      || self.chunk_size < region::page_size()
      || self.chunk_size > CLASS_SPAN
    {
      return Err(AllocError::InvalidConfig(
        "chunk size must be a power of two between a page and 2^36",
      ));
    }
    if self.donate_threshold == 0 {
      return Err(AllocError::InvalidConfig("donate threshold must be positive"));
    }
    Ok(())
  }

  pub fn base(&self) -> usize {
    self.base
  }

  pub fn class_limit(&self) -> usize {
    self.class_limit
  }

  pub fn chunk_size(&self) -> usize {
    self.chunk_size
  }

  pub fn donate_threshold(&self) -> u32 {
    self.donate_threshold
  }
}

impl Default for Config {
  fn default() -> Self {
    Self::new()
  }
}

fn env_usize(name: &CStr) -> Option<usize> {
  let value = unsafe { libc::getenv(name.as_ptr()) };
  if value.is_null() {
    return None;
  }
  let value = unsafe { CStr::from_ptr(value) };
  parse_usize(value.to_str().ok()?)
}

fn parse_usize(text: &str) -> Option<usize> {
  let text = text.trim();
  match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
    Some(hex) => usize::from_str_radix(hex, 16).ok(),
    None => text.parse().ok(),
  }
}
