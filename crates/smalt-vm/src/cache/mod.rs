// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Method lookup and the inline method cache.
//!
//! Lookup walks the receiver's class chain, searching each class's
//! method dictionary by binary search, until the selector resolves or
//! the chain ends at nil. A direct-mapped cache keyed on
//! (selector, class) short-circuits repeated sends.
//!
//! The cache holds raw heap references, so it must be flushed after
//! every collection and whenever a method dictionary changes; stale
//! entries would otherwise point at moved or replaced methods.


use crate::dictionary;
use crate::memory::ObjectMemory;
use crate::object::Oop;
use crate::object::layout::class;

/// Number of cache entries. Must stay a power of two.
pub const CACHE_ENTRIES: usize = 1024;

const _: () = assert!(CACHE_ENTRIES.is_power_of_two());

#[derive(Debug, Clone, Copy)]
struct Entry {
    selector: Oop,
    class: Oop,
    method: Oop,
}

/// Direct-mapped inline cache for method lookup.
#[derive(Debug)]
pub struct MethodCache {
    entries: Vec<Option<Entry>>,
    /// Sends resolved from the cache.
    pub hits: u64,
    /// Sends that required a full chain walk.
    pub misses: u64,
}

impl Default for MethodCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: vec![None; CACHE_ENTRIES],
            hits: 0,
            misses: 0,
        }
    }

    /// Resolve `selector` for a receiver of `start_class`.
    ///
    /// On a cache miss the full chain walk runs and the entry is
    /// replaced. Returns `None` when the chain exhausts without a
    /// match; the caller decides on the does-not-understand retry.
    pub fn lookup(
        &mut self,
        mem: &ObjectMemory,
        nil: Oop,
        selector: Oop,
        start_class: Oop,
    ) -> Option<Oop> {
        let slot = Self::slot(selector, start_class);
        if let Some(entry) = &self.entries[slot]
            && entry.selector == selector
            && entry.class == start_class
        {
            self.hits += 1;
            return Some(entry.method);
        }
        self.misses += 1;
        let method = lookup_method(mem, nil, start_class, selector)?;
        self.entries[slot] = Some(Entry {
            selector,
            class: start_class,
            method,
        });
        Some(method)
    }

    /// Drop every entry.
    pub fn flush(&mut self) {
        for entry in &mut self.entries {
            *entry = None;
        }
    }

    fn slot(selector: Oop, class: Oop) -> usize {
        (((selector.raw() ^ class.raw()) >> 2) as usize) & (CACHE_ENTRIES - 1)
    }
}

/// Walk the class chain resolving `selector`, without the cache.
#[must_use]
pub fn lookup_method(
    mem: &ObjectMemory,
    nil: Oop,
    start_class: Oop,
    selector: Oop,
) -> Option<Oop> {
    let mut current = start_class;
    while current != nil {
        let methods = mem.field(current, class::METHODS);
        if let Some(method) = dictionary::lookup(mem, methods, selector) {
            return Some(method);
        }
        current = mem.field(current, class::PARENT);
    }
    None
}
