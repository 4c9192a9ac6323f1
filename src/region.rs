//! Address-space layout and the OS calls behind it.
//!
//! Every alignment group 1..=6 owns the 16 TiB window at
//! `base + (a_group << 44)`, reserved once with no access rights. Each size
//! class owns the 64 GiB sub-window at `s_group << 36` inside it. Committing
//! memory later only flips protection on a prefix of a class window, so slot
//! addresses never move and never need a lookup table.

use core::{
  fmt::{self, Write},
  ptr::null_mut,
};
use std::sync::{
  OnceLock,
  atomic::{AtomicUsize, Ordering},
};

use crate::{
  config::Config,
  error::{self, AllocError},
  size_class::{A_GROUPS, CLASS_SHIFT, CLASS_SPAN, GROUP_SHIFT, GROUP_SPAN, S_GROUPS, SizeClass},
  trace,
};

// =============================================================================
// Platform
// =============================================================================

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_FIXED_NOREPLACE: libc::c_int = libc::MAP_FIXED_NOREPLACE;

// Elsewhere the address is only a hint; a mismatch is treated as "taken".
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_FIXED_NOREPLACE: libc::c_int = 0;

#[cfg(any(
  target_os = "linux",
  target_os = "android",
  target_vendor = "apple",
  target_os = "netbsd",
  target_os = "solaris",
  target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
  target_os = "linux",
  target_os = "android",
  target_vendor = "apple",
  target_os = "netbsd",
  target_os = "solaris",
  target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
  static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

  match PAGE_SIZE.load(Ordering::Relaxed) {
    0 => {
      let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
      PAGE_SIZE.store(page_size, Ordering::Relaxed);
      page_size
    }
    page_size => page_size,
  }
}

/// Reserves `[address, address + len)` with no access. Fails with `EEXIST`
/// when any part of the range is already mapped.
unsafe fn os_reserve(address: usize, len: usize) -> Result<(), i32> {
  let ptr = unsafe {
    libc::mmap(
      address as *mut libc::c_void,
      len,
      libc::PROT_NONE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | MAP_NORESERVE | MAP_FIXED_NOREPLACE,
      -1,
      0,
    )
  };
  if ptr == libc::MAP_FAILED {
    return Err(error::errno());
  }
  if ptr as usize != address {
    // Kernel ignored the placement request.
    unsafe { libc::munmap(ptr, len) };
    return Err(libc::EEXIST);
  }
  Ok(())
}

/// Grants read/write access to part of a reservation.
pub(crate) unsafe fn os_commit(address: usize, len: usize) -> Result<(), i32> {
  let rc = unsafe {
    libc::mprotect(
      address as *mut libc::c_void,
      len,
      libc::PROT_READ | libc::PROT_WRITE,
    )
  };
  if rc == 0 { Ok(()) } else { Err(error::errno()) }
}

pub(crate) unsafe fn os_mmap(len: usize) -> Result<*mut u8, i32> {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      len,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };
  if ptr == libc::MAP_FAILED {
    Err(error::errno())
  } else {
    Ok(ptr as *mut u8)
  }
}

pub(crate) unsafe fn os_munmap(ptr: *mut u8, len: usize) {
  unsafe { libc::munmap(ptr.cast(), len) };
}

/// Fixed-size line buffer, so reporting a fatal error never allocates.
struct StackLine {
  buf: [u8; 192],
  len: usize,
}

impl fmt::Write for StackLine {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    let n = s.len().min(self.buf.len() - self.len);
    self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
    self.len += n;
    Ok(())
  }
}

/// Writes `err` to stderr and aborts without allocating or unwinding.
pub(crate) fn fatal(err: AllocError) -> ! {
  let mut line = StackLine { buf: [0; 192], len: 0 };
  let _ = writeln!(line, "cptralloc: {err}");
  unsafe { libc::write(libc::STDERR_FILENO, line.buf.as_ptr().cast(), line.len) };
  std::process::abort()
}

// =============================================================================
// Regions
// =============================================================================

/// The process-wide reservation, built once before the first allocation.
pub(crate) struct Regions {
  base: usize,
  config: Config,
  /// Class windows this process actually owns.
  reserved: [[bool; S_GROUPS]; A_GROUPS],
}

static REGIONS: OnceLock<Regions> = OnceLock::new();
/// Copy of `Regions::base` readable before initialization (as 0).
static BASE: AtomicUsize = AtomicUsize::new(0);

impl Regions {
  fn reserve(config: Config) -> Self {
    let base = config.base();
    let mut regions = Self {
      base,
      config,
      reserved: [[false; S_GROUPS]; A_GROUPS],
    };
    for a_group in 1..A_GROUPS {
      regions.reserve_group(a_group as u8);
    }
    BASE.store(base, Ordering::Release);
    regions
  }

  /// Claims every window on paper without touching the address space.
  #[cfg(test)]
  pub(crate) fn unreserved(config: Config) -> Self {
    Self {
      base: config.base(),
      config,
      reserved: [[true; S_GROUPS]; A_GROUPS],
    }
  }

  fn reserve_group(&mut self, a_group: u8) {
    let start = self.base + ((a_group as usize) << GROUP_SHIFT);
    match unsafe { os_reserve(start, GROUP_SPAN) } {
      Ok(()) => {
        self.reserved[a_group as usize] = [true; S_GROUPS];
        trace::group_reserved(a_group, start, GROUP_SPAN);
      }
      // Something (typically the executable or its heap) already lives in
      // this window: claim the class windows around it one by one.
      Err(libc::EEXIST) => {
        for s_group in 0..S_GROUPS {
          let address = start + (s_group << CLASS_SHIFT);
          match unsafe { os_reserve(address, CLASS_SPAN) } {
            Ok(()) => self.reserved[a_group as usize][s_group] = true,
            Err(libc::EEXIST) => trace::class_window_taken(a_group, s_group as u8, address),
            Err(errno) => Self::abort(a_group, errno),
          }
        }
      }
      Err(errno) => Self::abort(a_group, errno),
    }
  }

  fn abort(a_group: u8, errno: i32) -> ! {
    trace::reservation_failed(a_group, errno);
    fatal(AllocError::ReservationFailed { a_group, errno })
  }

  #[inline]
  pub(crate) fn config(&self) -> &Config {
    &self.config
  }

  #[inline]
  pub(crate) fn is_reserved(&self, class: SizeClass) -> bool {
    self.reserved[class.a_group() as usize][class.s_group() as usize]
  }

  /// Address of slot 0 of `class`.
  #[inline]
  pub(crate) fn class_base(&self, class: SizeClass) -> usize {
    self.base + class.window_offset()
  }

  /// The class owning `address`, if it falls inside a window we reserved.
  #[inline]
  pub(crate) fn owner(&self, address: usize) -> Option<SizeClass> {
    let (class, _) = SizeClass::from_offset(address.wrapping_sub(self.base))?;
    self.is_reserved(class).then_some(class)
  }
}

/// The reservation, created from the environment on first use.
#[inline]
pub(crate) fn get() -> &'static Regions {
  REGIONS.get_or_init(|| Regions::reserve(Config::from_env()))
}

/// The reservation, if something already created it.
#[inline]
pub(crate) fn try_get() -> Option<&'static Regions> {
  REGIONS.get()
}

/// Heap base address; 0 until the allocator is initialized.
#[inline]
pub(crate) fn base() -> usize {
  BASE.load(Ordering::Relaxed)
}

/// Reserves the address space using `CPTRALLOC_*` settings. Idempotent.
pub fn init() {
  get();
}

/// Reserves the address space with an explicit configuration.
///
/// Must run before any allocation: once the reservation exists its layout
/// is fixed and this returns [`AllocError::AlreadyInitialized`].
pub fn init_with(config: Config) -> Result<(), AllocError> {
  config.validate()?;
  let mut created = false;
  REGIONS.get_or_init(|| {
    created = true;
    Regions::reserve(config)
  });
  if created { Ok(()) } else { Err(AllocError::AlreadyInitialized) }
}

/// The configuration the allocator runs with, once initialized.
pub fn active_config() -> Option<Config> {
  try_get().map(|regions| *regions.config())
}
