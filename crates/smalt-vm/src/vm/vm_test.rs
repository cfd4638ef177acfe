// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the assembled machine: well-known roots, globals,
//! interning and allocation helpers.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::fixtures::World;
use crate::object::Oop;

#[test]
fn well_known_objects_are_distinct() {
    let world = World::new();
    let vm = &world.vm;
    assert_ne!(vm.nil(), vm.true_obj());
    assert_ne!(vm.nil(), vm.false_obj());
    assert_ne!(vm.true_obj(), vm.false_obj());
    assert_eq!(vm.boolean(true), vm.true_obj());
    assert_eq!(vm.boolean(false), vm.false_obj());
}

#[test]
fn class_of_small_integers() {
    let world = World::new();
    let vm = &world.vm;
    assert_eq!(vm.class_of(Oop::small(7)), vm.small_int_class());
    assert_eq!(vm.class_of(Oop::small(-7)), vm.small_int_class());
}

#[test]
fn class_of_heap_objects() {
    let mut world = World::new();
    let text = world.vm.new_string("abc").unwrap();
    assert_eq!(world.vm.class_of(text), world.vm.string_class());
}

#[test]
fn globals_resolve_by_name() {
    let world = World::new();
    let vm = &world.vm;
    for name in ["Array", "Block", "Context", "SmallInt", "Object"] {
        let cls = vm.lookup_global(name).unwrap();
        assert_eq!(vm.class_name(cls), name);
    }
    assert!(vm.lookup_global("NoSuchThing").is_none());
}

#[test]
fn strings_round_trip_text() {
    let mut world = World::new();
    let text = world.vm.new_string("hello, image").unwrap();
    assert_eq!(world.vm.read_text(text), "hello, image");
    assert_eq!(world.vm.memory.size_of(text), 12);
}

#[test]
fn interning_is_idempotent() {
    let mut world = World::new();
    let first = world.symbol("fresh:selector:");
    let second = world.symbol("fresh:selector:");
    assert_eq!(first, second, "textual equality implies identity");

    let other = world.symbol("different");
    assert_ne!(first, other);
}

#[test]
fn interning_finds_bootstrap_symbols() {
    let mut world = World::new();
    // "+" was created by the world build; interning must not make a
    // second copy.
    let plus = world.symbol("+");
    assert_eq!(plus, world.vm.binary_selector(2));
}

#[test]
fn interned_symbols_have_the_symbol_class() {
    let mut world = World::new();
    let sym = world.symbol("brandNew");
    let symbol_class = world.vm.lookup_global("Symbol").unwrap();
    assert_eq!(world.vm.class_of(sym), symbol_class);
}

#[test]
fn new_array_is_nil_filled() {
    let mut world = World::new();
    let array = world.vm.new_array(3).unwrap();
    assert_eq!(world.vm.class_of(array), world.vm.array_class());
    for i in 0..3 {
        assert_eq!(world.vm.memory.field(array, i), world.vm.nil());
    }
}

#[test]
fn set_initial_method_repoints_the_root() {
    let mut world = World::new();
    let replacement = world.vm.new_array(0).unwrap();
    world.vm.set_initial_method(replacement);
    assert_eq!(world.vm.initial_method(), replacement);
}

#[test]
fn collect_keeps_the_world_consistent() {
    let mut world = World::new();
    let before = {
        world.vm.collect();
        world.vm.memory.object_census()
    };
    world.vm.collect();
    assert_eq!(world.vm.memory.object_census(), before);
    // Roots follow their objects across the flip.
    assert_eq!(world.vm.class_name(world.vm.class_of(world.vm.nil())), "Undefined");
    assert_eq!(world.vm.read_text(world.vm.binary_selector(1)), "<=");
    assert_eq!(
        world.vm.lookup_global("Smalltalk").unwrap(),
        world.vm.globals()
    );
}

#[test]
fn object_footprint_includes_padding() {
    let mut world = World::new();
    let odd = world.vm.new_array(3).unwrap();
    assert_eq!(world.vm.object_footprint(odd), 6);
    let even = world.vm.new_array(4).unwrap();
    assert_eq!(world.vm.object_footprint(even), 6);
}
