// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Image save/load tests: round trips, identity, and refusal of
//! malformed files.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io::{Read, Seek, SeekFrom, Write};

use super::{ImageError, MAGIC, read_image, write_image};
use crate::bytecode::{op, special};
use crate::fixtures::{MethodBuilder, World};
use crate::object::Oop;

const SPACE: usize = 60_000;

/// A world whose entry method answers 3 + 4.
fn world_with_sum_entry() -> World {
    let mut world = World::new();
    let mut builder = MethodBuilder::new(4, 0);
    builder
        .op(op::PUSH_CONSTANT, 3)
        .op(op::PUSH_CONSTANT, 4)
        .op(op::SEND_BINARY, 2)
        .special(special::STACK_RETURN);
    let owner = world.class_named("Object");
    let entry = builder.finish(&mut world, "main", owner);
    world.vm.set_initial_method(entry);
    world
}

fn save(world: &mut World) -> Vec<u8> {
    let mut buffer = Vec::new();
    write_image(&mut world.vm, &mut buffer).unwrap();
    buffer
}

#[test]
fn round_trip_preserves_structure() {
    let mut world = world_with_sum_entry();
    let buffer = save(&mut world);
    let census_before = world.vm.memory.object_census();

    let vm = read_image(&mut buffer.as_slice(), SPACE).unwrap();
    assert_eq!(vm.memory.object_census(), census_before);

    // Well-known linkage.
    assert_eq!(vm.class_name(vm.class_of(vm.nil())), "Undefined");
    assert_eq!(vm.class_name(vm.class_of(vm.true_obj())), "True");
    assert_eq!(vm.class_name(vm.class_of(vm.false_obj())), "False");
    assert_eq!(vm.read_text(vm.binary_selector(0)), "<");
    assert_eq!(vm.read_text(vm.binary_selector(1)), "<=");
    assert_eq!(vm.read_text(vm.binary_selector(2)), "+");
    assert_eq!(vm.read_text(vm.bad_method_selector()), "doesNotUnderstand:");
    assert_eq!(vm.class_name(vm.array_class()), "Array");
}

#[test]
fn round_trip_preserves_shared_identity() {
    let mut world = World::new();
    let buffer = save(&mut world);
    let vm = read_image(&mut buffer.as_slice(), SPACE).unwrap();

    // The globals dictionary maps "Smalltalk" to itself; sharing must
    // survive the trip as identity, not as a copy.
    let smalltalk = vm.lookup_global("Smalltalk").unwrap();
    assert_eq!(smalltalk, vm.globals());
    assert_eq!(vm.lookup_global("nil").unwrap(), vm.nil());
    assert_eq!(vm.lookup_global("true").unwrap(), vm.true_obj());
}

#[test]
fn reloaded_image_runs_the_entry_method() {
    let mut world = world_with_sum_entry();
    let first = save(&mut world);

    let vm = read_image(&mut first.as_slice(), SPACE).unwrap();
    let mut reloaded = World { vm };
    let entry = reloaded.vm.initial_method();
    let proc_obj = reloaded.new_process(entry);
    assert_eq!(reloaded.run_to_result(proc_obj), Oop::small(7));
}

#[test]
fn save_load_save_is_byte_identical() {
    let mut world = world_with_sum_entry();
    let first = save(&mut world);

    let vm = read_image(&mut first.as_slice(), SPACE).unwrap();
    let mut reloaded = World { vm };
    let second = save(&mut reloaded);
    assert_eq!(first, second, "resaving a loaded image must not drift");
}

#[test]
fn consecutive_saves_are_identical() {
    let mut world = World::new();
    let first = save(&mut world);
    let second = save(&mut world);
    assert_eq!(first, second);
}

#[test]
fn root_offsets_are_even() {
    let mut world = World::new();
    let buffer = save(&mut world);
    // Six root offsets follow magic, version and cellCount.
    for i in 0..6 {
        let at = 12 + i * 4;
        let offset = u32::from_le_bytes(buffer[at..at + 4].try_into().unwrap());
        assert_eq!(offset % 2, 0, "root {i} offset {offset} is odd");
    }
}

#[test]
fn survives_a_file_on_disk() {
    let mut world = world_with_sum_entry();
    let mut file = tempfile::tempfile().unwrap();
    write_image(&mut world.vm, &mut file).unwrap();

    file.seek(SeekFrom::Start(0)).unwrap();
    let vm = read_image(&mut file, SPACE).unwrap();
    let mut reloaded = World { vm };
    let entry = reloaded.vm.initial_method();
    let proc_obj = reloaded.new_process(entry);
    assert_eq!(reloaded.run_to_result(proc_obj), Oop::small(7));
}

#[test]
fn bad_magic_is_refused() {
    let err = read_image(&mut &b"not an image at all"[..], SPACE).unwrap_err();
    assert!(matches!(err, ImageError::BadMagic));
}

#[test]
fn old_versions_are_refused() {
    for version in [0u32, 1, 2] {
        let mut data = Vec::new();
        data.write_all(&MAGIC).unwrap();
        data.write_all(&version.to_le_bytes()).unwrap();
        data.write_all(&0u32.to_le_bytes()).unwrap();
        let err = read_image(&mut data.as_slice(), SPACE).unwrap_err();
        assert!(
            matches!(err, ImageError::UnsupportedVersion(v) if v == version),
            "version {version}"
        );
    }
}

#[test]
fn oversized_image_is_refused() {
    let mut world = World::new();
    let buffer = save(&mut world);
    let err = read_image(&mut buffer.as_slice(), 100).unwrap_err();
    assert!(matches!(err, ImageError::TooLarge { .. }));
}

#[test]
fn corrupt_root_offset_is_refused() {
    let mut world = World::new();
    let mut buffer = save(&mut world);
    // The globals offset sits right after magic, version, cellCount;
    // an odd offset can never reference an object.
    buffer[12..16].copy_from_slice(&1u32.to_le_bytes());
    let err = read_image(&mut buffer.as_slice(), SPACE).unwrap_err();
    assert!(matches!(err, ImageError::BadOffset { offset: 1 }));
}

#[test]
fn truncated_body_is_refused() {
    let mut world = World::new();
    let mut buffer = save(&mut world);
    buffer.truncate(buffer.len() / 2);
    assert!(read_image(&mut buffer.as_slice(), SPACE).is_err());
}

#[test]
fn trailing_garbage_in_reader_is_not_consumed() {
    let mut world = world_with_sum_entry();
    let mut buffer = save(&mut world);
    buffer.extend_from_slice(b"trailing");
    let mut cursor = std::io::Cursor::new(buffer);
    let vm = read_image(&mut cursor, SPACE).unwrap();
    assert_eq!(vm.class_name(vm.array_class()), "Array");
    let mut rest = String::new();
    cursor.read_to_string(&mut rest).unwrap();
    assert_eq!(rest, "trailing");
}
