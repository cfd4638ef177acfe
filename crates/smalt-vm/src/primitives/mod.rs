// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Host primitives.
//!
//! The interpreter resolves a small essential set of primitive
//! numbers itself (arithmetic, allocation, block invocation); every
//! other number lands here. A primitive receives its arguments as an
//! argument array and either returns a result object or signals
//! failure, in which case the interpreter falls through to the
//! bytecode fallback path of the calling method.
//!
//! Shipped numbers: console character I/O (3, 9), file handling
//! (100-103), image save (104), byte-array read/write/seek (106-108),
//! substring search (150) and a debug timestamp (160). Unknown
//! numbers fail; new primitives are a pure extension.


use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{info, warn};

use crate::image;
use crate::object::Oop;
use crate::vm::Vm;

/// Most host files open at once.
pub const FILE_MAX: usize = 200;

/// Signalled when a primitive cannot produce a result; the caller
/// runs the bytecode fallback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("primitive failed")]
pub struct PrimitiveFailed;

/// Open host files, indexed by the small-integer handles handed to
/// image code.
#[derive(Debug)]
pub struct FileTable {
    slots: Vec<Option<File>>,
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Store a file and return its handle, or `None` when
    /// [`FILE_MAX`] files are already open.
    pub fn insert(&mut self, file: File) -> Option<usize> {
        if let Some(free) = self.slots.iter().position(Option::is_none) {
            self.slots[free] = Some(file);
            return Some(free);
        }
        if self.slots.len() >= FILE_MAX {
            return None;
        }
        self.slots.push(Some(file));
        Some(self.slots.len() - 1)
    }

    /// Borrow an open file.
    pub fn get_mut(&mut self, handle: usize) -> Option<&mut File> {
        self.slots.get_mut(handle)?.as_mut()
    }

    /// Remove a file from the table, leaving its slot free.
    pub fn take(&mut self, handle: usize) -> Option<File> {
        self.slots.get_mut(handle)?.take()
    }

    /// Put a file back into its slot.
    pub fn restore(&mut self, handle: usize, file: File) {
        if let Some(slot) = self.slots.get_mut(handle) {
            *slot = Some(file);
        }
    }

    /// Close a file. Returns whether the handle was open.
    pub fn close(&mut self, handle: usize) -> bool {
        self.take(handle).is_some()
    }
}

fn int_arg(vm: &Vm, args: Oop, index: usize) -> Result<i32, PrimitiveFailed> {
    if index >= vm.memory.size_of(args) {
        return Err(PrimitiveFailed);
    }
    let value = vm.memory.field(args, index);
    if value.is_small_int() {
        Ok(value.value())
    } else {
        Err(PrimitiveFailed)
    }
}

fn byte_arg(vm: &Vm, args: Oop, index: usize) -> Result<Oop, PrimitiveFailed> {
    if index >= vm.memory.size_of(args) {
        return Err(PrimitiveFailed);
    }
    let value = vm.memory.field(args, index);
    if value.is_reference() && vm.memory.header(value).is_binary() {
        Ok(value)
    } else {
        Err(PrimitiveFailed)
    }
}

fn handle_arg(vm: &Vm, args: Oop, index: usize) -> Result<usize, PrimitiveFailed> {
    let handle = int_arg(vm, args, index)?;
    if handle < 0 || handle as usize >= FILE_MAX {
        return Err(PrimitiveFailed);
    }
    Ok(handle as usize)
}

/// Execute host primitive `number` with the given argument array.
///
/// # Errors
///
/// [`PrimitiveFailed`] when the number is unknown, the arguments do
/// not fit, or the host operation fails; the interpreter then runs
/// the bytecode fallback path.
pub fn primitive(vm: &mut Vm, number: u8, args: Oop) -> Result<Oop, PrimitiveFailed> {
    match number {
        // write one character to standard output
        3 => {
            let value = int_arg(vm, args, 0)?;
            let byte = u8::try_from(value).map_err(|_| PrimitiveFailed)?;
            let mut out = std::io::stdout();
            out.write_all(&[byte]).map_err(|_| PrimitiveFailed)?;
            let _ = out.flush();
            Ok(vm.memory.field(args, 0))
        }

        // read one character from standard input
        9 => {
            let mut buf = [0u8; 1];
            match std::io::stdin().read(&mut buf) {
                Ok(0) | Err(_) => Ok(vm.nil()),
                Ok(_) => Ok(Oop::small(i32::from(buf[0]))),
            }
        }

        // open a file: (path, mode) -> handle
        100 => {
            let path = byte_arg(vm, args, 0)?;
            let mode = byte_arg(vm, args, 1)?;
            let path = vm.read_text(path);
            let mode = vm.read_text(mode);
            let file = open_with_mode(&path, &mode).ok_or(PrimitiveFailed)?;
            let handle = vm.files.insert(file).ok_or(PrimitiveFailed)?;
            Ok(Oop::small(handle as i32))
        }

        // read a single character from a file
        101 => {
            let handle = handle_arg(vm, args, 0)?;
            let file = vm.files.get_mut(handle).ok_or(PrimitiveFailed)?;
            let mut buf = [0u8; 1];
            match file.read(&mut buf) {
                Ok(0) | Err(_) => Ok(vm.nil()),
                Ok(_) => Ok(Oop::small(i32::from(buf[0]))),
            }
        }

        // write a single character to a file
        102 => {
            let handle = handle_arg(vm, args, 0)?;
            let value = int_arg(vm, args, 1)?;
            let byte = u8::try_from(value).map_err(|_| PrimitiveFailed)?;
            let file = vm.files.get_mut(handle).ok_or(PrimitiveFailed)?;
            file.write_all(&[byte]).map_err(|_| PrimitiveFailed)?;
            Ok(vm.nil())
        }

        // close a file
        103 => {
            let handle = handle_arg(vm, args, 0)?;
            if vm.files.close(handle) {
                Ok(vm.nil())
            } else {
                Err(PrimitiveFailed)
            }
        }

        // save the image to an open file
        104 => {
            let handle = handle_arg(vm, args, 0)?;
            let mut file = vm.files.take(handle).ok_or(PrimitiveFailed)?;
            let result = image::write_image(vm, &mut file);
            vm.files.restore(handle, file);
            match result {
                Ok(cells) => Ok(Oop::small(cells as i32)),
                Err(err) => {
                    warn!(%err, "image save failed");
                    Err(PrimitiveFailed)
                }
            }
        }

        // read up to N bytes into a fresh byte array; nil at EOF
        106 => {
            let handle = handle_arg(vm, args, 0)?;
            let count = int_arg(vm, args, 1)?;
            if count < 0 {
                return Err(PrimitiveFailed);
            }
            let mut buf = vec![0u8; count as usize];
            let file = vm.files.get_mut(handle).ok_or(PrimitiveFailed)?;
            let n = file.read(&mut buf).map_err(|_| PrimitiveFailed)?;
            if n == 0 && count > 0 {
                return Ok(vm.nil());
            }
            let array = vm.alloc_binary(n).map_err(|_| PrimitiveFailed)?;
            let class = vm.byte_array_class();
            vm.memory.set_class_word(array, class);
            vm.memory.set_bytes(array, &buf[..n]);
            Ok(array)
        }

        // write a byte array; returns the byte count written
        107 => {
            let handle = handle_arg(vm, args, 0)?;
            let data = byte_arg(vm, args, 1)?;
            let bytes = vm.memory.bytes(data);
            let file = vm.files.get_mut(handle).ok_or(PrimitiveFailed)?;
            file.write_all(&bytes).map_err(|_| PrimitiveFailed)?;
            Ok(Oop::small(bytes.len() as i32))
        }

        // seek to an absolute position
        108 => {
            let handle = handle_arg(vm, args, 0)?;
            let position = int_arg(vm, args, 1)?;
            if position < 0 {
                return Err(PrimitiveFailed);
            }
            let file = vm.files.get_mut(handle).ok_or(PrimitiveFailed)?;
            file.seek(SeekFrom::Start(u64::from(position as u32)))
                .map_err(|_| PrimitiveFailed)?;
            Ok(Oop::small(position))
        }

        // index of a substring, 1-based
        150 => {
            let haystack = byte_arg(vm, args, 0)?;
            let needle = byte_arg(vm, args, 1)?;
            let haystack = vm.memory.bytes(haystack);
            let needle = vm.memory.bytes(needle);
            find_subslice(&haystack, &needle)
                .map(|at| Oop::small(at as i32 + 1))
                .ok_or(PrimitiveFailed)
        }

        // log a microsecond timestamp with a message
        160 => {
            let message = byte_arg(vm, args, 0)?;
            let message = vm.read_text(message);
            let micros = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_micros() as u64)
                .unwrap_or(0);
            info!(micros, message = %message, "timestamp");
            Ok(vm.nil())
        }

        _ => {
            warn!(number, "unknown primitive");
            Err(PrimitiveFailed)
        }
    }
}

fn open_with_mode(path: &str, mode: &str) -> Option<File> {
    let mut options = OpenOptions::new();
    match mode.chars().next()? {
        'r' => options.read(true),
        'w' => options.write(true).create(true).truncate(true),
        'a' => options.append(true).create(true),
        _ => return None,
    };
    if mode.contains('+') {
        options.read(true).write(true);
    }
    options.open(path).ok()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
