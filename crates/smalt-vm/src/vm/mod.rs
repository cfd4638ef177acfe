// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The assembled machine: heap, well-known roots, method cache and
//! host primitive state in one value.
//!
//! Nothing in the VM is process-global; everything a core function
//! needs travels through a `&mut Vm`. The well-known objects are held
//! as static-root handles, so reading them after a collection always
//! yields the current location.

#[cfg(test)]
mod vm_test;

use crate::cache::MethodCache;
use crate::dictionary;
use crate::memory::{MemoryError, ObjectMemory, RootHandle};
use crate::object::Oop;
use crate::object::layout::{SYMBOLS_IN_SYMBOL_CLASS, class, node};
use crate::primitives::FileTable;

/// Raw references to the well-known objects, gathered by the image
/// loader (or a test fixture) before registration.
#[derive(Debug, Clone, Copy)]
pub struct WellKnownSeed {
    /// The nil object.
    pub nil: Oop,
    /// The true object.
    pub true_obj: Oop,
    /// The false object.
    pub false_obj: Oop,
    /// The globals dictionary.
    pub globals: Oop,
    /// The entry method invoked at startup.
    pub initial_method: Oop,
    /// The cached binary selectors `<`, `<=`, `+`.
    pub binary_selectors: [Oop; 3],
    /// The `doesNotUnderstand:` selector.
    pub bad_method_selector: Oop,
    /// Class of tagged small integers.
    pub small_int_class: Oop,
    /// Class of image-level large integers.
    pub integer_class: Oop,
    /// Class of plain arrays.
    pub array_class: Oop,
    /// Class of blocks.
    pub block_class: Oop,
    /// Class of method activations.
    pub context_class: Oop,
    /// Class of strings.
    pub string_class: Oop,
    /// Class of byte arrays.
    pub byte_array_class: Oop,
}

/// Static-root handles for the well-known objects.
#[derive(Debug)]
struct WellKnown {
    nil: RootHandle,
    true_obj: RootHandle,
    false_obj: RootHandle,
    globals: RootHandle,
    initial_method: RootHandle,
    binary_selectors: [RootHandle; 3],
    bad_method_selector: RootHandle,
    small_int_class: RootHandle,
    integer_class: RootHandle,
    array_class: RootHandle,
    block_class: RootHandle,
    context_class: RootHandle,
    string_class: RootHandle,
    byte_array_class: RootHandle,
}

impl WellKnown {
    fn register(memory: &mut ObjectMemory, seed: &WellKnownSeed) -> Self {
        Self {
            nil: memory.register_static_root(seed.nil),
            true_obj: memory.register_static_root(seed.true_obj),
            false_obj: memory.register_static_root(seed.false_obj),
            globals: memory.register_static_root(seed.globals),
            initial_method: memory.register_static_root(seed.initial_method),
            binary_selectors: seed
                .binary_selectors
                .map(|selector| memory.register_static_root(selector)),
            bad_method_selector: memory.register_static_root(seed.bad_method_selector),
            small_int_class: memory.register_static_root(seed.small_int_class),
            integer_class: memory.register_static_root(seed.integer_class),
            array_class: memory.register_static_root(seed.array_class),
            block_class: memory.register_static_root(seed.block_class),
            context_class: memory.register_static_root(seed.context_class),
            string_class: memory.register_static_root(seed.string_class),
            byte_array_class: memory.register_static_root(seed.byte_array_class),
        }
    }
}

/// The virtual machine.
#[derive(Debug)]
pub struct Vm {
    /// The managed heap.
    pub memory: ObjectMemory,
    /// The inline method cache.
    pub cache: MethodCache,
    /// Host file handles for the file primitives.
    pub files: FileTable,
    wk: WellKnown,
}

impl Vm {
    /// Assemble a machine from a populated heap and its well-known
    /// references.
    #[must_use]
    pub fn new(mut memory: ObjectMemory, seed: &WellKnownSeed) -> Self {
        let wk = WellKnown::register(&mut memory, seed);
        Self {
            memory,
            cache: MethodCache::new(),
            files: FileTable::new(),
            wk,
        }
    }

    // ------------------------------------------------------------------
    // Well-known objects
    // ------------------------------------------------------------------

    /// The nil object.
    #[inline]
    #[must_use]
    pub fn nil(&self) -> Oop {
        self.memory.static_root(self.wk.nil)
    }

    /// The true object.
    #[inline]
    #[must_use]
    pub fn true_obj(&self) -> Oop {
        self.memory.static_root(self.wk.true_obj)
    }

    /// The false object.
    #[inline]
    #[must_use]
    pub fn false_obj(&self) -> Oop {
        self.memory.static_root(self.wk.false_obj)
    }

    /// The true or false object.
    #[inline]
    #[must_use]
    pub fn boolean(&self, value: bool) -> Oop {
        if value { self.true_obj() } else { self.false_obj() }
    }

    /// The globals dictionary.
    #[inline]
    #[must_use]
    pub fn globals(&self) -> Oop {
        self.memory.static_root(self.wk.globals)
    }

    /// The entry method.
    #[inline]
    #[must_use]
    pub fn initial_method(&self) -> Oop {
        self.memory.static_root(self.wk.initial_method)
    }

    /// Repoint the entry method, e.g. before saving an image that
    /// should boot into different code.
    #[inline]
    pub fn set_initial_method(&mut self, target: Oop) {
        self.memory.set_static_root(self.wk.initial_method, target);
    }

    /// One of the cached binary selectors `<`, `<=`, `+`.
    #[inline]
    #[must_use]
    pub fn binary_selector(&self, index: usize) -> Oop {
        self.memory.static_root(self.wk.binary_selectors[index])
    }

    /// The `doesNotUnderstand:` selector.
    #[inline]
    #[must_use]
    pub fn bad_method_selector(&self) -> Oop {
        self.memory.static_root(self.wk.bad_method_selector)
    }

    /// Class of tagged small integers.
    #[inline]
    #[must_use]
    pub fn small_int_class(&self) -> Oop {
        self.memory.static_root(self.wk.small_int_class)
    }

    /// Class of image-level large integers.
    #[inline]
    #[must_use]
    pub fn integer_class(&self) -> Oop {
        self.memory.static_root(self.wk.integer_class)
    }

    /// Class of plain arrays.
    #[inline]
    #[must_use]
    pub fn array_class(&self) -> Oop {
        self.memory.static_root(self.wk.array_class)
    }

    /// Class of blocks.
    #[inline]
    #[must_use]
    pub fn block_class(&self) -> Oop {
        self.memory.static_root(self.wk.block_class)
    }

    /// Class of method activations.
    #[inline]
    #[must_use]
    pub fn context_class(&self) -> Oop {
        self.memory.static_root(self.wk.context_class)
    }

    /// Class of strings.
    #[inline]
    #[must_use]
    pub fn string_class(&self) -> Oop {
        self.memory.static_root(self.wk.string_class)
    }

    /// Class of byte arrays.
    #[inline]
    #[must_use]
    pub fn byte_array_class(&self) -> Oop {
        self.memory.static_root(self.wk.byte_array_class)
    }

    /// The class of any value; small integers report the small
    /// integer class.
    #[inline]
    #[must_use]
    pub fn class_of(&self, oop: Oop) -> Oop {
        if oop.is_small_int() {
            self.small_int_class()
        } else {
            self.memory.class_word(oop)
        }
    }

    /// Look up an entry of the globals dictionary by name.
    #[must_use]
    pub fn lookup_global(&self, name: &str) -> Option<Oop> {
        dictionary::lookup_by_text(&self.memory, self.globals(), name)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate a pointer object with nil class and fields, flushing
    /// the method cache if a collection ran.
    ///
    /// # Errors
    ///
    /// Propagates [`MemoryError`] from the heap.
    pub fn alloc_object(&mut self, fields: usize) -> Result<Oop, MemoryError> {
        let passes = self.memory.stats().count;
        let nil = self.nil();
        let obj = self.memory.allocate(fields, nil)?;
        if self.memory.stats().count != passes {
            self.cache.flush();
        }
        Ok(obj)
    }

    /// Allocate a byte object with nil class and zeroed payload,
    /// flushing the method cache if a collection ran.
    ///
    /// # Errors
    ///
    /// Propagates [`MemoryError`] from the heap.
    pub fn alloc_binary(&mut self, bytes: usize) -> Result<Oop, MemoryError> {
        let passes = self.memory.stats().count;
        let nil = self.nil();
        let obj = self.memory.allocate_binary(bytes, nil)?;
        if self.memory.stats().count != passes {
            self.cache.flush();
        }
        Ok(obj)
    }

    /// Allocate an Array with `fields` nil slots.
    ///
    /// # Errors
    ///
    /// Propagates [`MemoryError`] from the heap.
    pub fn new_array(&mut self, fields: usize) -> Result<Oop, MemoryError> {
        let obj = self.alloc_object(fields)?;
        let class = self.array_class();
        self.memory.set_class_word(obj, class);
        Ok(obj)
    }

    /// Allocate a String holding `text`.
    ///
    /// # Errors
    ///
    /// Propagates [`MemoryError`] from the heap.
    pub fn new_string(&mut self, text: &str) -> Result<Oop, MemoryError> {
        let obj = self.alloc_binary(text.len())?;
        let class = self.string_class();
        self.memory.set_class_word(obj, class);
        self.memory.set_bytes(obj, text.as_bytes());
        Ok(obj)
    }

    /// Read a byte object as host text, replacing invalid UTF-8.
    #[must_use]
    pub fn read_text(&self, obj: Oop) -> String {
        String::from_utf8_lossy(&self.memory.bytes(obj)).into_owned()
    }

    /// The name of a class, for diagnostics.
    #[must_use]
    pub fn class_name(&self, class_obj: Oop) -> String {
        if class_obj == self.nil() || class_obj.is_small_int() {
            return String::from("(nil)");
        }
        let name = self.memory.field(class_obj, class::NAME);
        if name == self.nil() || name.is_small_int() || !self.memory.header(name).is_binary() {
            return String::from("(anonymous)");
        }
        self.read_text(name)
    }

    /// Force a collection and keep the method cache coherent.
    pub fn collect(&mut self) {
        self.memory.collect();
        self.cache.flush();
    }

    // ------------------------------------------------------------------
    // Symbols
    // ------------------------------------------------------------------

    /// Intern a symbol: return the existing symbol with this text, or
    /// create one and insert it into the symbol tree.
    ///
    /// Returns `Ok(None)` when the image carries no `Symbol` class to
    /// hang the tree on.
    ///
    /// # Errors
    ///
    /// Propagates [`MemoryError`] from the heap.
    pub fn intern_symbol(&mut self, text: &str) -> Result<Option<Oop>, MemoryError> {
        let Some(symbol_class) = self.lookup_global("Symbol") else {
            return Ok(None);
        };
        if symbol_class.is_small_int()
            || self.memory.size_of(symbol_class) <= SYMBOLS_IN_SYMBOL_CLASS
        {
            return Ok(None);
        }
        let tree = self.memory.field(symbol_class, SYMBOLS_IN_SYMBOL_CLASS);
        if let Some(existing) =
            dictionary::tree_lookup(&self.memory, tree, self.nil(), text.as_bytes())
        {
            return Ok(Some(existing));
        }

        // Allocate the symbol and its node first; the tree walk below
        // must not be interrupted by a collection.
        let symbol = self.alloc_binary(text.len())?;
        self.memory.set_bytes(symbol, text.as_bytes());
        self.memory.push_root(symbol)?;
        let node_obj = self.alloc_object(node::SIZE)?;
        let symbol = self.memory.pop_root();

        // Re-resolve everything that may have moved.
        let Some(symbol_class) = self.lookup_global("Symbol") else {
            return Ok(None);
        };
        self.memory.set_class_word(symbol, symbol_class);
        if let Some(node_class) = self.lookup_global("Node") {
            self.memory.set_class_word(node_obj, node_class);
        }
        self.memory.set_field(node_obj, node::VALUE, symbol);

        let nil = self.nil();
        let mut parent = nil;
        let mut side = node::LEFT;
        let mut current = self.memory.field(symbol_class, SYMBOLS_IN_SYMBOL_CLASS);
        while current != nil {
            parent = current;
            let probe = self.memory.field(current, node::VALUE);
            if dictionary::compare_symbol_to_text(&self.memory, probe, text.as_bytes())
                == core::cmp::Ordering::Greater
            {
                side = node::LEFT;
                current = self.memory.field(current, node::LEFT);
            } else {
                side = node::RIGHT;
                current = self.memory.field(current, node::RIGHT);
            }
        }
        if parent == nil {
            self.memory
                .set_field(symbol_class, SYMBOLS_IN_SYMBOL_CLASS, node_obj);
        } else {
            self.memory.set_field(parent, side, node_obj);
        }
        Ok(Some(symbol))
    }

    /// Total words an object occupies, including header, class and
    /// alignment padding.
    #[must_use]
    pub fn object_footprint(&self, obj: Oop) -> usize {
        self.memory.header(obj).total_words()
    }
}
