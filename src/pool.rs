//! Global free-list-of-free-lists.
//!
//! A fixed array of cells, each able to carry one whole thread-local free
//! list. Cells live on exactly one lock-free stack at a time: the "unused"
//! stack, or the donated stack of some size class. Cells are never freed,
//! only moved between stacks, and stack heads pack a 32-bit version next to
//! the cell index so a stale compare-and-swap cannot succeed (ABA).
//!
//! Cell `next` links are relative like slot links, which makes the zeroed
//! array a complete ascending "unused" stack without any setup.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::{
  freelist::{FreeList, NIL, decode_link, encode_link},
  trace,
};

/// Cells in the process-wide pool.
pub(crate) const POOL_CAPACITY: usize = 1 << 16;

/// Head value of a stack with no cells (version 0).
pub(crate) const EMPTY_STACK: u64 = NIL as u64;

pub(crate) static POOL: Pool<POOL_CAPACITY> = Pool::new();

#[inline(always)]
const fn pack(version: u32, cell: u32) -> u64 {
  (version as u64) << 32 | cell as u64
}

struct Cell {
  next: AtomicU32,
  head: AtomicU32,
  count: AtomicU32,
}

impl Cell {
  const fn new() -> Self {
    Self {
      next: AtomicU32::new(0),
      head: AtomicU32::new(NIL),
      count: AtomicU32::new(0),
    }
  }
}

pub(crate) struct Pool<const N: usize> {
  cells: [Cell; N],
  unused: AtomicU64,
}

impl<const N: usize> Pool<N> {
  pub(crate) const fn new() -> Self {
    assert!(N > 0 && N < NIL as usize);
    Self {
      cells: [const { Cell::new() }; N],
      unused: AtomicU64::new(pack(0, 0)),
    }
  }

  #[inline]
  fn next_of(&self, cell: u32) -> u32 {
    let next = decode_link(cell, self.cells[cell as usize].next.load(Ordering::Relaxed));
    if next as usize >= N { NIL } else { next }
  }

  fn pop_cell(&self, stack: &AtomicU64) -> Option<u32> {
    let mut packed = stack.load(Ordering::Acquire);
    loop {
      let top = packed as u32;
      if top as usize >= N {
        return None;
      }
      // May read a link the owner is rewriting; the version check below then
      // rejects the swap.
      let next = self.next_of(top);
      let version = (packed >> 32) as u32;
      match stack.compare_exchange_weak(
        packed,
        pack(version.wrapping_add(1), next),
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return Some(top),
        Err(current) => packed = current,
      }
    }
  }

  fn push_cell(&self, stack: &AtomicU64, cell: u32) {
    let mut packed = stack.load(Ordering::Relaxed);
    loop {
      let top = packed as u32;
      self.cells[cell as usize]
        .next
        .store(encode_link(cell, top), Ordering::Relaxed);
      let version = (packed >> 32) as u32;
      match stack.compare_exchange_weak(
        packed,
        pack(version.wrapping_add(1), cell),
        Ordering::Release,
        Ordering::Relaxed,
      ) {
        Ok(_) => return,
        Err(current) => packed = current,
      }
    }
  }

  /// Donates `list` to `stack`, leaving `list` empty. Returns `false`, with
  /// `list` untouched, when no spare cell is left.
  pub(crate) fn push(&self, stack: &AtomicU64, list: &mut FreeList) -> bool {
    debug_assert!(!list.is_empty());
    let Some(cell) = self.pop_cell(&self.unused) else {
      trace::pool_exhausted(list.count);
      return false;
    };
    let slot = &self.cells[cell as usize];
    slot.head.store(list.head, Ordering::Relaxed);
    slot.count.store(list.count, Ordering::Relaxed);
    *list = FreeList::EMPTY;
    self.push_cell(stack, cell);
    true
  }

  /// Takes the most recently donated list off `stack` into `list`, which must
  /// be empty. Returns `false` if nothing was donated.
  pub(crate) fn pop(&self, stack: &AtomicU64, list: &mut FreeList) -> bool {
    debug_assert!(list.is_empty());
    let Some(cell) = self.pop_cell(stack) else {
      return false;
    };
    let slot = &self.cells[cell as usize];
    list.head = slot.head.swap(NIL, Ordering::Relaxed);
    list.count = slot.count.swap(0, Ordering::Relaxed);
    self.push_cell(&self.unused, cell);
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{sync::Arc, thread};

  fn list(head: u32, count: u32) -> FreeList {
    FreeList { head, count }
  }

  #[test]
  fn zeroed_pool_is_a_full_unused_stack() {
    let pool = Pool::<4>::new();
    let order: Vec<u32> = std::iter::from_fn(|| pool.pop_cell(&pool.unused)).collect();
    assert_eq!(order, [0, 1, 2, 3]);
  }

  #[test]
  fn donated_lists_come_back_lifo() {
    let pool = Pool::<4>::new();
    let stack = AtomicU64::new(EMPTY_STACK);

    let mut a = list(10, 3);
    let mut b = list(20, 7);
    assert!(pool.push(&stack, &mut a));
    assert!(pool.push(&stack, &mut b));
    assert_eq!(a, FreeList::EMPTY);
    assert_eq!(b, FreeList::EMPTY);

    let mut out = FreeList::EMPTY;
    assert!(pool.pop(&stack, &mut out));
    assert_eq!(out, list(20, 7));
    let mut out = FreeList::EMPTY;
    assert!(pool.pop(&stack, &mut out));
    assert_eq!(out, list(10, 3));
    assert!(!pool.pop(&stack, &mut FreeList::EMPTY));
  }

  #[test]
  fn exhaustion_leaves_the_list_with_its_owner() {
    let pool = Pool::<2>::new();
    let stack = AtomicU64::new(EMPTY_STACK);
    assert!(pool.push(&stack, &mut list(1, 1)));
    assert!(pool.push(&stack, &mut list(2, 1)));

    let mut third = list(3, 1);
    assert!(!pool.push(&stack, &mut third));
    assert_eq!(third, list(3, 1));

    // Draining returns cells to the unused stack.
    assert!(pool.pop(&stack, &mut FreeList::EMPTY));
    assert!(pool.push(&stack, &mut third));
  }

  #[test]
  fn stacks_are_independent() {
    let pool = Pool::<8>::new();
    let small = AtomicU64::new(EMPTY_STACK);
    let large = AtomicU64::new(EMPTY_STACK);
    assert!(pool.push(&small, &mut list(1, 4)));
    assert!(pool.push(&large, &mut list(2, 5)));

    let mut out = FreeList::EMPTY;
    assert!(pool.pop(&small, &mut out));
    assert_eq!(out, list(1, 4));
    assert!(!pool.pop(&small, &mut FreeList::EMPTY));
    assert!(pool.pop(&large, &mut FreeList::EMPTY));
  }

  #[test]
  fn concurrent_donations_are_not_lost() {
    const THREADS: u32 = 8;
    const ROUNDS: u32 = 2_000;

    let pool = Arc::new(Pool::<16>::new());
    let stack = Arc::new(AtomicU64::new(EMPTY_STACK));

    let handles: Vec<_> = (0..THREADS)
      .map(|t| {
        let pool = Arc::clone(&pool);
        let stack = Arc::clone(&stack);
        thread::spawn(move || {
          let mut seen = 0u64;
          for round in 0..ROUNDS {
            let mut mine = list(t * ROUNDS + round, 1);
            while !pool.push(&stack, &mut mine) {
              std::hint::spin_loop();
            }
            let mut got = FreeList::EMPTY;
            if pool.pop(&stack, &mut got) {
              assert_eq!(got.count, 1);
              seen += 1;
            }
          }
          seen
        })
      })
      .collect();

    let popped: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    let mut left = 0;
    while pool.pop(&stack, &mut FreeList::EMPTY) {
      left += 1;
    }
    assert_eq!(popped + left, u64::from(THREADS * ROUNDS));
  }
}
