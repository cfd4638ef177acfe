// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Heap image reading and writing, format version 3.
//!
//! An image persists the entire live object graph:
//!
//! ```text
//! magic         : 4 bytes "lst!"
//! version       : u32 = 3
//! cellCount     : u32, words of object data
//! globals       : u32 offset     ── well-known roots
//! initialMethod : u32 offset
//! binary[0..2]  : u32 offset × 3    ("<", "<=", "+")
//! badMethodSym  : u32 offset        ("doesNotUnderstand:")
//! objects       : packed object images, low address first
//! ```
//!
//! Every wire word is little-endian. A reference is encoded as its
//! distance from the top of the heap in VM words; since objects start
//! on even word boundaries the low bit is free, and a field word with
//! the low bit set is an inline small integer, exactly as in memory.
//! Offsets are position independent: the reader rebuilds the heap at
//! whatever address range its own space occupies.
//!
//! Saving forces a collection first, so the image is compact and
//! carries no forwarding state. Versions 0 through 2 used host
//! pointer encodings and are refused.

#[cfg(test)]
mod image_test;

use std::io::{Read, Write};

use thiserror::Error;
use tracing::{debug, info};

use crate::memory::ObjectMemory;
use crate::object::{Header, Oop};
use crate::vm::{Vm, WellKnownSeed};

/// Image file magic.
pub const MAGIC: [u8; 4] = *b"lst!";

/// The only supported format version.
pub const VERSION: u32 = 3;

/// Globals the loader must resolve by name after the body is read.
const NAMED_GLOBALS: [&str; 10] = [
    "nil",
    "true",
    "false",
    "SmallInt",
    "Integer",
    "Array",
    "Block",
    "Context",
    "String",
    "ByteArray",
];

/// Failures reading or writing an image.
#[derive(Debug, Error)]
pub enum ImageError {
    /// Underlying I/O failure.
    #[error("image i/o: {0}")]
    Io(#[from] std::io::Error),
    /// The file does not start with the image magic.
    #[error("not an image file (bad magic)")]
    BadMagic,
    /// The file is an image of an unsupported version.
    #[error("unsupported image version {0}, only version {VERSION} is readable")]
    UnsupportedVersion(u32),
    /// The image body does not fit one heap space.
    #[error("image holds {cells} words but a heap space holds {capacity}")]
    TooLarge {
        /// Words of object data in the image.
        cells: u32,
        /// Words available in one space.
        capacity: usize,
    },
    /// A reference offset points outside the image body.
    #[error("reference offset {offset} outside the image body")]
    BadOffset {
        /// The offending offset, in words from the heap top.
        offset: u32,
    },
    /// An object header describes an object past the image end.
    #[error("object at word {word} overruns the image body")]
    Truncated {
        /// Word index of the offending object.
        word: usize,
    },
    /// A structural expectation does not hold.
    #[error("malformed image: {0}")]
    Malformed(&'static str),
    /// A named global the interpreter needs is missing.
    #[error("global '{0}' missing from the image")]
    MissingGlobal(&'static str),
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, ImageError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<(), ImageError> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

/// Restore a machine from an image.
///
/// `space_words` sizes each heap space; the image must fit in one.
///
/// # Errors
///
/// Any [`ImageError`] variant; the heap under construction is
/// discarded on failure.
pub fn read_image<R: Read>(reader: &mut R, space_words: usize) -> Result<Vm, ImageError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(ImageError::BadMagic);
    }
    let version = read_u32(reader)?;
    if version != VERSION {
        return Err(ImageError::UnsupportedVersion(version));
    }

    let mut memory = ObjectMemory::new(space_words);
    let cells = read_u32(reader)?;
    if cells as usize > memory.space_words() {
        return Err(ImageError::TooLarge {
            cells,
            capacity: memory.space_words(),
        });
    }
    let top = memory.top();
    let pointer = top - cells as usize;
    memory.set_allocation_pointer(pointer);

    let resolve = |offset: u32| -> Result<Oop, ImageError> {
        if offset == 0 || offset as usize > cells as usize || offset % 2 != 0 {
            return Err(ImageError::BadOffset { offset });
        }
        Ok(Oop::reference(top - offset as usize))
    };

    let globals = resolve(read_u32(reader)?)?;
    let initial_method = resolve(read_u32(reader)?)?;
    let mut binary_selectors = [Oop::small(0); 3];
    for selector in &mut binary_selectors {
        *selector = resolve(read_u32(reader)?)?;
    }
    let bad_method_selector = resolve(read_u32(reader)?)?;

    // Read the object bodies, low address first.
    let mut word = pointer;
    let mut objects = 0usize;
    while word < top {
        let header = Header::from_raw(read_u32(reader)?);
        if header.is_forwarded() {
            return Err(ImageError::Malformed("forwarded object in image"));
        }
        if word + header.total_words() > top {
            return Err(ImageError::Truncated { word });
        }
        memory.set_word_at(word, header.raw());
        memory.set_word_at(word + 1, resolve(read_u32(reader)?)?.raw());

        if header.is_binary() {
            let obj = Oop::reference(word);
            let mut buf = [0u8; 1];
            for i in 0..header.size() {
                reader.read_exact(&mut buf)?;
                memory.set_byte(obj, i, buf[0]);
            }
        } else {
            for i in 0..header.size() {
                let field = read_u32(reader)?;
                if field & 1 != 0 {
                    memory.set_word_at(word + 2 + i, field);
                } else {
                    memory.set_word_at(word + 2 + i, resolve(field)?.raw());
                }
            }
        }
        word += header.total_words();
        objects += 1;
    }

    if globals.is_small_int()
        || memory.header(globals).is_binary()
        || memory.size_of(globals) < 2
    {
        return Err(ImageError::Malformed("globals root is not a dictionary"));
    }

    let mut named = [Oop::small(0); NAMED_GLOBALS.len()];
    for (slot, name) in named.iter_mut().zip(NAMED_GLOBALS) {
        *slot = crate::dictionary::lookup_by_text(&memory, globals, name)
            .ok_or(ImageError::MissingGlobal(name))?;
    }

    info!(cells, objects, "image loaded");

    let seed = WellKnownSeed {
        nil: named[0],
        true_obj: named[1],
        false_obj: named[2],
        globals,
        initial_method,
        binary_selectors,
        bad_method_selector,
        small_int_class: named[3],
        integer_class: named[4],
        array_class: named[5],
        block_class: named[6],
        context_class: named[7],
        string_class: named[8],
        byte_array_class: named[9],
    };
    Ok(Vm::new(memory, &seed))
}

/// Save the machine's live heap as an image.
///
/// Forces a full collection first, so only live objects are written
/// and the heap is compact.
///
/// # Errors
///
/// [`ImageError::Io`] on write failure.
pub fn write_image<W: Write>(vm: &mut Vm, writer: &mut W) -> Result<u32, ImageError> {
    vm.collect();

    let top = vm.memory.top();
    let cells = (top - vm.memory.pointer()) as u32;
    let offset_of = |oop: Oop| (top - oop.word()) as u32;

    writer.write_all(&MAGIC)?;
    write_u32(writer, VERSION)?;
    write_u32(writer, cells)?;

    write_u32(writer, offset_of(vm.globals()))?;
    write_u32(writer, offset_of(vm.initial_method()))?;
    for i in 0..3 {
        write_u32(writer, offset_of(vm.binary_selector(i)))?;
    }
    write_u32(writer, offset_of(vm.bad_method_selector()))?;

    let mut objects = 0usize;
    let mem = &vm.memory;
    for obj in mem.objects() {
        let header = mem.header(obj);
        write_u32(writer, header.raw())?;
        write_u32(writer, offset_of(mem.class_word(obj)))?;
        if header.is_binary() {
            for i in 0..header.size() {
                writer.write_all(&[mem.byte(obj, i)])?;
            }
        } else {
            for i in 0..header.size() {
                let field = mem.field(obj, i);
                if field.is_small_int() {
                    write_u32(writer, field.raw())?;
                } else {
                    write_u32(writer, offset_of(field))?;
                }
            }
        }
        objects += 1;
    }

    debug!(cells, objects, "image written");
    Ok(cells)
}
