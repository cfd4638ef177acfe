// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for tagged references and object headers.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{FLAG_BINARY, FLAG_GC_DONE, Header, Oop, SMALL_INT_MAX, SMALL_INT_MIN};
use proptest::prelude::*;

#[test]
fn small_int_tagging() {
    let o = Oop::small(42);
    assert!(o.is_small_int());
    assert!(!o.is_reference());
    assert_eq!(o.value(), 42);
    assert_eq!(o.raw(), 42 << 1 | 1);
}

#[test]
fn small_int_negative() {
    let o = Oop::small(-7);
    assert!(o.is_small_int());
    assert_eq!(o.value(), -7);
}

#[test]
fn small_int_extremes() {
    assert_eq!(Oop::small(SMALL_INT_MAX).value(), SMALL_INT_MAX);
    assert_eq!(Oop::small(SMALL_INT_MIN).value(), SMALL_INT_MIN);
    assert_eq!(Oop::small(0).value(), 0);
}

#[test]
fn fits_small_int_range() {
    assert!(Oop::fits_small_int(0));
    assert!(Oop::fits_small_int(i64::from(SMALL_INT_MAX)));
    assert!(Oop::fits_small_int(i64::from(SMALL_INT_MIN)));
    assert!(!Oop::fits_small_int(i64::from(SMALL_INT_MAX) + 1));
    assert!(!Oop::fits_small_int(i64::from(SMALL_INT_MIN) - 1));
}

#[test]
fn reference_word_round_trip() {
    let o = Oop::reference(12);
    assert!(o.is_reference());
    assert!(!o.is_small_int());
    assert_eq!(o.word(), 12);
}

#[test]
fn reference_raw_is_even() {
    // Objects start on even word indices, so the raw encoding is a
    // multiple of 8 and never collides with the small-integer tag.
    for word in [0usize, 2, 4, 100, 4096] {
        let o = Oop::reference(word);
        assert_eq!(o.raw() % 8, 0);
    }
}

#[test]
fn header_pointer_object() {
    let h = Header::pointer(5);
    assert_eq!(h.size(), 5);
    assert!(!h.is_binary());
    assert!(!h.is_forwarded());
    assert_eq!(h.body_words(), 5);
    // 2 header words + 5 fields + 1 pad = 8
    assert_eq!(h.total_words(), 8);
}

#[test]
fn header_binary_object() {
    let h = Header::binary(10);
    assert_eq!(h.size(), 10);
    assert!(h.is_binary());
    // 10 bytes pack into 3 words, padded to 4
    assert_eq!(h.body_words(), 3);
    assert_eq!(h.total_words(), 6);
}

#[test]
fn header_empty_objects() {
    assert_eq!(Header::pointer(0).total_words(), 2);
    assert_eq!(Header::binary(0).total_words(), 2);
}

#[test]
fn header_flags_round_trip() {
    let h = Header::pointer(3).forwarded();
    assert!(h.is_forwarded());
    assert_eq!(h.size(), 3);
    assert_eq!(h.raw() & FLAG_GC_DONE, FLAG_GC_DONE);

    let b = Header::binary(3);
    assert_eq!(b.raw() & FLAG_BINARY, FLAG_BINARY);
    assert_eq!(Header::from_raw(b.raw()), b);
}

#[test]
fn total_words_always_even() {
    for size in 0..64 {
        assert_eq!(Header::pointer(size).total_words() % 2, 0);
        assert_eq!(Header::binary(size).total_words() % 2, 0);
    }
}

proptest! {
    #[test]
    fn prop_small_int_round_trip(v in SMALL_INT_MIN..=SMALL_INT_MAX) {
        let o = Oop::small(v);
        prop_assert!(o.is_small_int());
        prop_assert_eq!(o.value(), v);
    }

    #[test]
    fn prop_raw_round_trip(v in SMALL_INT_MIN..=SMALL_INT_MAX) {
        let o = Oop::small(v);
        prop_assert_eq!(Oop::from_raw(o.raw()), o);
    }

    #[test]
    fn prop_header_size_preserved(size in 0usize..(1 << 20)) {
        prop_assert_eq!(Header::pointer(size).size(), size);
        prop_assert_eq!(Header::binary(size).size(), size);
    }
}
