//! The whole test binary runs on the allocator.

use std::{collections::HashMap, thread};

use cptralloc::{Allocator, CompressedPtr};

#[global_allocator]
static GLOBAL: Allocator = Allocator;

#[test]
fn std_collections_work() {
  let mut map: HashMap<String, Vec<u32>> = HashMap::new();
  for i in 0..10_000u32 {
    map.entry(format!("key-{}", i % 500)).or_default().push(i);
  }
  assert_eq!(map.len(), 500);
  assert_eq!(map["key-7"].len(), 20);
  assert!(map.values().all(|v| v.windows(2).all(|w| w[0] < w[1])));
}

#[test]
fn boxes_live_in_class_windows() {
  let boxed = Box::new([0u8; 100]);
  let address = &*boxed as *const [u8; 100] as usize;
  let p = CompressedPtr::from_raw(address).unwrap();
  assert_eq!(p.size(), 100);
  assert_eq!(p.address(), address);
}

#[test]
fn growing_vectors_keep_their_contents() {
  let mut v: Vec<u64> = Vec::new();
  for i in 0..1_000_000u64 {
    v.push(i);
  }
  assert!(v.iter().enumerate().all(|(i, &x)| x == i as u64));
  v.truncate(10);
  v.shrink_to_fit();
  assert_eq!(v, (0..10).collect::<Vec<_>>());

  let zeroed = vec![0u128; 4096];
  assert!(zeroed.iter().all(|&x| x == 0));
}

#[test]
fn over_aligned_types() {
  #[repr(align(4096))]
  struct Page([u8; 4096]);

  let pages: Vec<Box<Page>> = (0..8).map(|_| Box::new(Page([1; 4096]))).collect();
  for page in &pages {
    assert_eq!(&**page as *const Page as usize % 4096, 0);
    assert_eq!(page.0[4095], 1);
  }
}

#[test]
fn threads_exchange_allocations() {
  let (tx, rx) = std::sync::mpsc::channel::<Vec<String>>();
  let producers: Vec<_> = (0..4)
    .map(|t| {
      let tx = tx.clone();
      thread::spawn(move || {
        for round in 0..200 {
          tx.send((0..50).map(|i| format!("{t}:{round}:{i}")).collect()).unwrap();
        }
      })
    })
    .collect();
  drop(tx);

  let consumer = thread::spawn(move || rx.into_iter().map(|batch| batch.len()).sum::<usize>());
  for producer in producers {
    producer.join().unwrap();
  }
  assert_eq!(consumer.join().unwrap(), 4 * 200 * 50);
}

#[test]
fn over_aligned_buffers_past_the_largest_class() {
  use std::alloc::{Layout, alloc, dealloc};

  let layout = Layout::from_size_align(cptralloc::MAX_SMALL_SIZE + 1, 32).unwrap();
  unsafe {
    let p = alloc(layout);
    assert!(!p.is_null());
    assert_eq!(p as usize % 32, 0);
    p.add(cptralloc::MAX_SMALL_SIZE).write(3);
    dealloc(p, layout);
  }
}
