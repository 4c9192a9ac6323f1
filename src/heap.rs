//! Small-object allocation: per-thread caches in front of per-class global
//! state.
//!
//! Allocation tries, in order: the thread's primary list, its backup list, a
//! list donated to the global pool by some thread, and finally a freshly
//! committed chunk. The thread-local part is never synchronized; only the
//! pool stacks and the bump cursor are shared.

use core::{
  cell::{Cell, UnsafeCell},
  ops::Range,
  sync::atomic::{AtomicU64, Ordering},
};

use crate::{
  error::AllocError,
  freelist::{FreeList, NIL, encode_link, slot_link},
  pool::{EMPTY_STACK, POOL},
  ptr::CompressedPtr,
  region::{self, Regions},
  size_class::{A_GROUPS, S_GROUPS, SizeClass},
  trace,
};

// =============================================================================
// Global per-class state
// =============================================================================

struct ClassState {
  /// Stack of pool cells holding lists donated by threads.
  donated: AtomicU64,
  /// Chunks committed so far.
  bump: AtomicU64,
}

impl ClassState {
  const fn new() -> Self {
    Self {
      donated: AtomicU64::new(EMPTY_STACK),
      bump: AtomicU64::new(0),
    }
  }
}

static CLASSES: [[ClassState; S_GROUPS]; A_GROUPS] =
  [const { [const { ClassState::new() }; S_GROUPS] }; A_GROUPS];

#[inline(always)]
fn class_state(class: SizeClass) -> &'static ClassState {
  &CLASSES[class.a_group() as usize][class.s_group() as usize]
}

// =============================================================================
// Committer
// =============================================================================

/// How a class window is carved into commit chunks.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChunkGeometry {
  size: usize,
  chunk: usize,
  max_chunks: u64,
  capacity: u32,
}

impl ChunkGeometry {
  pub(crate) fn new(class: SizeClass, min_chunk: usize, limit: usize, page: usize) -> Self {
    let size = class.size();
    let chunk = min_chunk.max(size).next_multiple_of(page);
    let capacity = class.slot_capacity(limit);
    let by_bytes = limit / chunk;
    let by_index = (capacity as usize * size).div_ceil(chunk);
    Self {
      size,
      chunk,
      max_chunks: by_bytes.min(by_index) as u64,
      capacity,
    }
  }

  #[inline]
  pub(crate) fn chunk_bytes(&self) -> usize {
    self.chunk
  }

  #[inline]
  pub(crate) fn max_chunks(&self) -> u64 {
    self.max_chunks
  }

  #[inline]
  pub(crate) fn chunk_offset(&self, chunk: u64) -> usize {
    chunk as usize * self.chunk
  }

  /// Slots lying wholly inside `chunk`. Slots straddling a chunk boundary
  /// are never issued.
  pub(crate) fn slots(&self, chunk: u64) -> Range<u32> {
    let start = self.chunk_offset(chunk);
    let first = start.div_ceil(self.size).min(self.capacity as usize);
    let end = ((start + self.chunk) / self.size).min(self.capacity as usize);
    first as u32..end.max(first) as u32
  }
}

/// Commits the next chunk of `class` and hands its slots to `list`.
fn commit(regions: &Regions, class: SizeClass, list: &mut FreeList) -> Result<(), AllocError> {
  debug_assert!(list.is_empty());
  let config = regions.config();
  let geometry = ChunkGeometry::new(
    class,
    config.chunk_size(),
    config.class_limit(),
    region::page_size(),
  );
  let state = class_state(class);
  let class_base = regions.class_base(class);
  let (a_group, s_group) = (class.a_group(), class.s_group());

  loop {
    let chunk = state
      .bump
      .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |n| {
        (n < geometry.max_chunks()).then_some(n + 1)
      })
      .map_err(|_| {
        trace::region_exhausted(a_group, s_group);
        AllocError::RegionExhausted { a_group, s_group }
      })?;

    let slots = geometry.slots(chunk);
    if slots.is_empty() {
      continue;
    }

    let address = class_base + geometry.chunk_offset(chunk);
    unsafe { region::os_commit(address, geometry.chunk_bytes()) }.map_err(|errno| {
      trace::commit_failed(a_group, s_group, errno);
      AllocError::CommitFailed { a_group, s_group, errno }
    })?;

    // Zeroed slots already link to their successor; terminate the run.
    let last = slots.end - 1;
    unsafe { slot_link(class_base, geometry.size, last).write(encode_link(last, NIL)) };

    list.head = slots.start;
    list.count = slots.end - slots.start;
    trace::chunk_committed(a_group, s_group, chunk, list.count);
    return Ok(());
  }
}

// =============================================================================
// Thread cache
// =============================================================================

/// Two lists per class; `lists[0]` is the one allocations pop from.
#[derive(Clone, Copy)]
struct ClassCache {
  lists: [FreeList; 2],
}

impl ClassCache {
  const EMPTY: Self = Self {
    lists: [FreeList::EMPTY; 2],
  };
}

pub(crate) struct ThreadCache {
  classes: [[ClassCache; S_GROUPS]; A_GROUPS],
}

impl ThreadCache {
  const fn new() -> Self {
    Self {
      classes: [[ClassCache::EMPTY; S_GROUPS]; A_GROUPS],
    }
  }

  fn alloc(&mut self, regions: &Regions, class: SizeClass) -> Result<CompressedPtr, AllocError> {
    let class_base = regions.class_base(class);
    let size = class.size();
    let state = class_state(class);
    let cache = &mut self.classes[class.a_group() as usize][class.s_group() as usize];

    loop {
      if let Some(index) = unsafe { cache.lists[0].pop(class_base, size) } {
        return Ok(CompressedPtr::new(class, index));
      }
      if !cache.lists[1].is_empty() {
        cache.lists.swap(0, 1);
        continue;
      }
      if POOL.pop(&state.donated, &mut cache.lists[0]) {
        continue;
      }
      commit(regions, class, &mut cache.lists[0])?;
    }
  }

  fn free(&mut self, regions: &Regions, ptr: CompressedPtr) {
    let class = ptr.class();
    let class_base = regions.class_base(class);
    let threshold = regions.config().donate_threshold();
    let cache = &mut self.classes[class.a_group() as usize][class.s_group() as usize];

    let shorter = (cache.lists[1].count < cache.lists[0].count) as usize;
    let list = &mut cache.lists[shorter];
    unsafe { list.push(class_base, class.size(), ptr.index()) };

    if list.count >= threshold
      && POOL.push(&class_state(class).donated, list)
      && shorter == 0
    {
      cache.lists.swap(0, 1);
    }
  }

  /// Slots held by this cache for `class`.
  #[cfg(test)]
  fn cached(&self, class: SizeClass) -> u32 {
    let cache = &self.classes[class.a_group() as usize][class.s_group() as usize];
    cache.lists[0].count + cache.lists[1].count
  }
}

impl Drop for ThreadCache {
  fn drop(&mut self) {
    // Hand everything to the pool so other threads can reuse it. Lists the
    // pool has no room for stay unreachable.
    for (a_group, row) in self.classes.iter_mut().enumerate().skip(1) {
      for (s_group, cache) in row.iter_mut().enumerate() {
        let state = &CLASSES[a_group][s_group];
        for list in cache.lists.iter_mut().filter(|list| !list.is_empty()) {
          POOL.push(&state.donated, list);
        }
      }
    }
  }
}

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static CACHE: UnsafeCell<ThreadCache> = const { UnsafeCell::new(ThreadCache::new()) };
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` on this thread's cache. `None` when the call is re-entrant
/// (e.g. a tracing subscriber allocating from inside the allocator) or the
/// thread's storage is already being torn down.
fn with_cache<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
  let entered = IN_ALLOC.try_with(|flag| !flag.replace(true)).ok()?;
  if !entered {
    return None;
  }
  let result = CACHE
    .try_with(|cache| {
      // SAFETY: IN_ALLOC guarantees this is the only live reference.
      let cache = unsafe { &mut *cache.get() };
      f(cache)
    })
    .ok();
  let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  result
}

// =============================================================================
// Small allocation / free
// =============================================================================

pub(crate) fn alloc_small(regions: &Regions, class: SizeClass) -> Result<CompressedPtr, AllocError> {
  if !regions.is_reserved(class) {
    return Err(AllocError::ClassUnavailable {
      a_group: class.a_group(),
      s_group: class.s_group(),
    });
  }
  with_cache(|cache| cache.alloc(regions, class)).unwrap_or(Err(AllocError::ThreadCacheUnavailable))
}

/// # Safety
///
/// `ptr` must come from [`alloc_small`] and must not be freed twice.
pub(crate) unsafe fn free_small(regions: &Regions, ptr: CompressedPtr) {
  if with_cache(|cache| cache.free(regions, ptr)).is_none() {
    donate_one(regions, ptr);
  }
}

/// Frees a single slot straight into the pool as a one-element list.
fn donate_one(regions: &Regions, ptr: CompressedPtr) {
  let class = ptr.class();
  let mut list = FreeList::EMPTY;
  unsafe { list.push(regions.class_base(class), class.size(), ptr.index()) };
  POOL.push(&class_state(class).donated, &mut list);
}

/// Slots of `class` cached by the calling thread.
#[cfg(test)]
pub(crate) fn cached_slots(class: SizeClass) -> u32 {
  with_cache(|cache| cache.cached(class)).unwrap_or(0)
}

/// Runs `f` as if called from inside the allocator.
#[cfg(test)]
pub(crate) fn nested<R>(f: impl FnOnce() -> R) -> Option<R> {
  with_cache(|_| f())
}
