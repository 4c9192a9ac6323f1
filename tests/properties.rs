//! Property tests for the size-class table and the pointer codec.

use cptralloc::{ALIGN_SHIFT, CompressedPtr, MAX_SMALL_SIZE, SizeClass, TAG_MAX};
use proptest::prelude::*;

/// Valid (a_group, s_group, index) triples.
fn slot() -> impl Strategy<Value = (u8, u8, u32)> {
  (1u8..=6, any::<u8>()).prop_flat_map(|(a, s)| {
    let capacity = SizeClass::new(a, s).index_capacity();
    (Just(a), Just(s), 0..capacity)
  })
}

/// Slots lying wholly inside their 64 GiB class window.
fn windowed_slot() -> impl Strategy<Value = (u8, u8, u32)> {
  (1u8..=6, any::<u8>()).prop_flat_map(|(a, s)| {
    let capacity = SizeClass::new(a, s).slot_capacity(1 << 36);
    (Just(a), Just(s), 0..capacity)
  })
}

/// Request sizes, biased towards group edges.
fn request_size() -> impl Strategy<Value = usize> {
  prop_oneof![
    1usize..=MAX_SMALL_SIZE,
    (1u32..=27).prop_flat_map(|bit| {
      let edge = 1usize << bit;
      (edge - 2..=edge + 2).prop_filter("in range", |&n| (1..=MAX_SMALL_SIZE).contains(&n))
    }),
  ]
}

proptest! {
  /// The chosen class fits the request and nothing in its group is tighter.
  #[test]
  fn size_class_is_minimal(bytes in request_size()) {
    let class = SizeClass::from_size(bytes).unwrap();
    let granule = 1usize << ALIGN_SHIFT[class.a_group() as usize];
    prop_assert!(class.size() >= bytes);
    prop_assert!(class.size() - granule < bytes);
    prop_assert_eq!(class.size() % granule, 0);
  }

  /// Larger requests never map to smaller slots.
  #[test]
  fn size_class_is_monotonic(a in request_size(), b in request_size()) {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    prop_assert!(SizeClass::from_size(lo).unwrap().size() <= SizeClass::from_size(hi).unwrap().size());
  }

  #[test]
  fn past_the_table_is_rejected(bytes in (MAX_SMALL_SIZE + 1)..usize::MAX) {
    prop_assert_eq!(SizeClass::from_size(bytes), None);
  }

  #[test]
  fn codec_round_trip((a, s, index) in slot(), tag in 0..=TAG_MAX) {
    let p = CompressedPtr::from_parts(a, s, index).with_tag(tag);
    prop_assert_eq!(p.a_group(), a);
    prop_assert_eq!(p.s_group(), s);
    prop_assert_eq!(p.index(), index);
    prop_assert_eq!(p.tag(), tag);
    prop_assert_eq!(CompressedPtr::from_bits(p.to_bits()), p);
  }

  /// Every byte of a slot decodes back to that slot.
  #[test]
  fn offsets_decode_to_their_slot((a, s, index) in windowed_slot(), within in any::<usize>()) {
    let p = CompressedPtr::from_parts(a, s, index);
    let interior = p.offset() + within % p.size();
    prop_assert_eq!(CompressedPtr::from_offset(interior), Some(p));
  }
}
