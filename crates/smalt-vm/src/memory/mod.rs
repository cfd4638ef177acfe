// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Two-space object heap with a Baker-style copying collector.
//!
//! The heap is one word arena split into two equal spaces. At any
//! moment one space is active; allocation bumps a pointer downward
//! from the top of the active space:
//!
//! ```text
//! active space:
//! base (low)                                        top (high)
//! │                                                 │
//! │         FREE            │ [obj][obj][obj][obj]  │
//! │                         ▲                       │
//! │                     pointer (grows down)        │
//! ```
//!
//! When an allocation would cross `base`, the spaces flip and every
//! object reachable from the root set is copied into the new active
//! space. A moved object's old header gets the gc-done flag and its
//! old class word holds the forwarding reference; copied objects are
//! scanned from a work stack until none remain, which handles cyclic
//! graphs the same as a Cheney scan.
//!
//! Two root sets exist: a bounded dynamic root stack that callers push
//! onto across allocation-sensitive regions, and a static root
//! registry for the well-known objects, addressed through
//! [`RootHandle`]s so the registry slots can be rewritten in place
//! when a collection moves their referents.


use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::object::{BYTES_PER_WORD, Header, Oop};

/// Capacity of the dynamic root stack.
pub const ROOT_STACK_LIMIT: usize = 2000;

/// Default size of one space, in words (4 MiB).
pub const DEFAULT_SPACE_WORDS: usize = 1 << 20;

/// Fatal memory-management failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    /// The request does not fit even after a full collection.
    #[error("heap exhausted: {words} words requested after collection")]
    HeapExhausted {
        /// Total words the failing request needed.
        words: usize,
    },
    /// The dynamic root stack is full.
    #[error("dynamic root stack overflow (limit {ROOT_STACK_LIMIT})")]
    RootStackOverflow,
}

/// Collector statistics, updated after every pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    /// Number of collections run.
    pub count: u64,
    /// Time spent across all collections.
    pub total_pause: Duration,
    /// Longest single pause.
    pub max_pause: Duration,
    /// Bytes copied across all collections.
    pub bytes_copied: u64,
    /// Most bytes copied in a single collection.
    pub max_bytes_copied: u64,
}

/// Handle to one slot of the static root registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootHandle(usize);

/// The managed object heap.
#[derive(Debug)]
pub struct ObjectMemory {
    /// Both spaces, back to back.
    words: Box<[u32]>,
    /// Words per space; even, so each space base is 8-byte aligned.
    space_words: usize,
    in_space_one: bool,
    /// Word index of the active space base.
    base: usize,
    /// Allocation pointer; objects live in `pointer..top`.
    pointer: usize,
    /// Word index one past the active space.
    top: usize,
    /// From-space bounds, valid only during a collection.
    old_base: usize,
    old_top: usize,
    root_stack: Vec<Oop>,
    static_roots: Vec<Oop>,
    stats: GcStats,
}

impl ObjectMemory {
    /// Create a heap with `space_words` words per space.
    ///
    /// The size is rounded up to an even word count so that both
    /// space bases are 8-byte aligned.
    #[must_use]
    pub fn new(space_words: usize) -> Self {
        let space_words = space_words + (space_words & 1);
        let words = vec![0u32; space_words * 2].into_boxed_slice();
        Self {
            words,
            space_words,
            in_space_one: true,
            base: 0,
            pointer: space_words,
            top: space_words,
            old_base: 0,
            old_top: 0,
            root_stack: Vec::with_capacity(ROOT_STACK_LIMIT),
            static_roots: Vec::new(),
            stats: GcStats::default(),
        }
    }

    /// Words per space.
    #[inline]
    #[must_use]
    pub const fn space_words(&self) -> usize {
        self.space_words
    }

    /// Unallocated words remaining in the active space.
    #[inline]
    #[must_use]
    pub const fn free_words(&self) -> usize {
        self.pointer - self.base
    }

    /// Word index of the active space base.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Current allocation pointer, in words.
    #[inline]
    #[must_use]
    pub const fn pointer(&self) -> usize {
        self.pointer
    }

    /// Word index one past the active space.
    #[inline]
    #[must_use]
    pub const fn top(&self) -> usize {
        self.top
    }

    /// Collector statistics so far.
    #[inline]
    #[must_use]
    pub const fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Check whether a reference points into the allocated part of
    /// the active space.
    #[must_use]
    pub fn contains_active(&self, oop: Oop) -> bool {
        oop.is_reference() && {
            let w = oop.word();
            w >= self.pointer && w < self.top
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate a pointer object with `fields` slots.
    ///
    /// The class word and every field are initialized to `fill`
    /// (normally nil), so the object is traversable immediately. The
    /// caller stores the real class afterwards.
    ///
    /// # Errors
    ///
    /// [`MemoryError::HeapExhausted`] if the request does not fit
    /// after a collection; [`MemoryError::RootStackOverflow`] if the
    /// root stack cannot protect `fill` across that collection.
    pub fn allocate(&mut self, fields: usize, fill: Oop) -> Result<Oop, MemoryError> {
        let header = Header::pointer(fields);
        let (w, fill) = self.reserve(header.total_words(), fill)?;
        self.words[w] = header.raw();
        for slot in &mut self.words[w + 1..w + header.total_words()] {
            *slot = fill.raw();
        }
        let body_end = w + 2 + header.body_words();
        for pad in &mut self.words[body_end..w + header.total_words()] {
            *pad = 0;
        }
        Ok(Oop::reference(w))
    }

    /// Allocate a byte object with `bytes` bytes of zeroed payload.
    ///
    /// The class word is initialized to `fill`; the caller stores the
    /// real class afterwards.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`ObjectMemory::allocate`].
    pub fn allocate_binary(&mut self, bytes: usize, fill: Oop) -> Result<Oop, MemoryError> {
        let header = Header::binary(bytes);
        let (w, fill) = self.reserve(header.total_words(), fill)?;
        self.words[w] = header.raw();
        self.words[w + 1] = fill.raw();
        for slot in &mut self.words[w + 2..w + header.total_words()] {
            *slot = 0;
        }
        Ok(Oop::reference(w))
    }

    /// Reserve `total` words, collecting once if needed. Returns the
    /// object's word index and the (possibly moved) `fill` reference.
    fn reserve(&mut self, total: usize, fill: Oop) -> Result<(usize, Oop), MemoryError> {
        let mut fill = fill;
        if self.free_words() < total {
            self.push_root(fill)?;
            self.collect();
            fill = self.pop_root();
            if self.free_words() < total {
                return Err(MemoryError::HeapExhausted { words: total });
            }
        }
        self.pointer -= total;
        Ok((self.pointer, fill))
    }

    // ------------------------------------------------------------------
    // Object access
    // ------------------------------------------------------------------

    /// The header of a heap object.
    #[inline]
    #[must_use]
    pub fn header(&self, obj: Oop) -> Header {
        Header::from_raw(self.words[obj.word()])
    }

    /// Field count (pointer object) or byte count (byte object).
    #[inline]
    #[must_use]
    pub fn size_of(&self, obj: Oop) -> usize {
        self.header(obj).size()
    }

    /// The class word of a heap object.
    #[inline]
    #[must_use]
    pub fn class_word(&self, obj: Oop) -> Oop {
        Oop::from_raw(self.words[obj.word() + 1])
    }

    /// Store the class word of a heap object.
    #[inline]
    pub fn set_class_word(&mut self, obj: Oop, class: Oop) {
        let w = obj.word();
        self.words[w + 1] = class.raw();
    }

    /// Read field `index` of a pointer object.
    #[inline]
    #[must_use]
    pub fn field(&self, obj: Oop, index: usize) -> Oop {
        debug_assert!(index < self.size_of(obj));
        Oop::from_raw(self.words[obj.word() + 2 + index])
    }

    /// Store field `index` of a pointer object.
    #[inline]
    pub fn set_field(&mut self, obj: Oop, index: usize, value: Oop) {
        debug_assert!(index < self.size_of(obj));
        let w = obj.word();
        self.words[w + 2 + index] = value.raw();
    }

    /// Read byte `index` of a byte object.
    #[inline]
    #[must_use]
    pub fn byte(&self, obj: Oop, index: usize) -> u8 {
        debug_assert!(index < self.size_of(obj));
        let word = self.words[obj.word() + 2 + index / BYTES_PER_WORD];
        (word >> (8 * (index % BYTES_PER_WORD))) as u8
    }

    /// Store byte `index` of a byte object.
    #[inline]
    pub fn set_byte(&mut self, obj: Oop, index: usize, value: u8) {
        debug_assert!(index < self.size_of(obj));
        let w = obj.word() + 2 + index / BYTES_PER_WORD;
        let shift = 8 * (index % BYTES_PER_WORD);
        self.words[w] = (self.words[w] & !(0xFF << shift)) | (u32::from(value) << shift);
    }

    /// Copy out the payload of a byte object.
    #[must_use]
    pub fn bytes(&self, obj: Oop) -> Vec<u8> {
        let size = self.size_of(obj);
        (0..size).map(|i| self.byte(obj, i)).collect()
    }

    /// Overwrite the payload of a byte object. `data` must not exceed
    /// the object's size.
    pub fn set_bytes(&mut self, obj: Oop, data: &[u8]) {
        debug_assert!(data.len() <= self.size_of(obj));
        for (i, b) in data.iter().enumerate() {
            self.set_byte(obj, i, *b);
        }
    }

    /// Raw arena word, for the image reader/writer.
    #[inline]
    #[must_use]
    pub(crate) fn word_at(&self, index: usize) -> u32 {
        self.words[index]
    }

    /// Store a raw arena word, for the image reader.
    #[inline]
    pub(crate) fn set_word_at(&mut self, index: usize, value: u32) {
        self.words[index] = value;
    }

    /// Seat the allocation pointer, for the image reader.
    pub(crate) fn set_allocation_pointer(&mut self, word: usize) {
        debug_assert!(word >= self.base && word <= self.top);
        self.pointer = word;
    }

    /// Iterate over the objects of the active space, low to high.
    pub fn objects(&self) -> impl Iterator<Item = Oop> + '_ {
        let mut w = self.pointer;
        let top = self.top;
        core::iter::from_fn(move || {
            if w >= top {
                return None;
            }
            let obj = Oop::reference(w);
            w += Header::from_raw(self.words[w]).total_words();
            Some(obj)
        })
    }

    /// Count of live objects in the active space.
    #[must_use]
    pub fn object_census(&self) -> usize {
        self.objects().count()
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    /// Push a reference onto the dynamic root stack.
    ///
    /// # Errors
    ///
    /// [`MemoryError::RootStackOverflow`] when the stack is full.
    pub fn push_root(&mut self, oop: Oop) -> Result<(), MemoryError> {
        if self.root_stack.len() >= ROOT_STACK_LIMIT {
            return Err(MemoryError::RootStackOverflow);
        }
        self.root_stack.push(oop);
        Ok(())
    }

    /// Pop the most recent dynamic root. The value reflects any
    /// collection that ran since the matching push.
    pub fn pop_root(&mut self) -> Oop {
        debug_assert!(!self.root_stack.is_empty());
        self.root_stack.pop().unwrap_or(Oop::small(0))
    }

    /// Depth of the dynamic root stack.
    #[inline]
    #[must_use]
    pub fn root_depth(&self) -> usize {
        self.root_stack.len()
    }

    /// Read a dynamic root by index; index 0 is the oldest entry.
    #[inline]
    #[must_use]
    pub fn root_at(&self, index: usize) -> Oop {
        self.root_stack[index]
    }

    /// Register a static root slot holding `oop` and return its
    /// handle. Slots live for the rest of the run.
    pub fn register_static_root(&mut self, oop: Oop) -> RootHandle {
        self.static_roots.push(oop);
        RootHandle(self.static_roots.len() - 1)
    }

    /// Current referent of a static root slot.
    #[inline]
    #[must_use]
    pub fn static_root(&self, handle: RootHandle) -> Oop {
        self.static_roots[handle.0]
    }

    /// Repoint a static root slot.
    #[inline]
    pub fn set_static_root(&mut self, handle: RootHandle, oop: Oop) {
        self.static_roots[handle.0] = oop;
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Run a full collection: flip the spaces and copy everything
    /// reachable from the two root sets into the new active space.
    pub fn collect(&mut self) {
        let started = Instant::now();

        self.old_base = self.base;
        self.old_top = self.top;
        self.base = if self.in_space_one { self.space_words } else { 0 };
        self.in_space_one = !self.in_space_one;
        self.top = self.base + self.space_words;
        self.pointer = self.top;

        let mut pending: Vec<usize> = Vec::with_capacity(64);
        for i in 0..self.root_stack.len() {
            let moved = self.forward(self.root_stack[i], &mut pending);
            self.root_stack[i] = moved;
        }
        for i in 0..self.static_roots.len() {
            let moved = self.forward(self.static_roots[i], &mut pending);
            self.static_roots[i] = moved;
        }
        self.scan(&mut pending);

        let copied = ((self.top - self.pointer) * BYTES_PER_WORD) as u64;
        let pause = started.elapsed();
        self.stats.count += 1;
        self.stats.total_pause += pause;
        self.stats.max_pause = self.stats.max_pause.max(pause);
        self.stats.bytes_copied += copied;
        self.stats.max_bytes_copied = self.stats.max_bytes_copied.max(copied);

        debug!(
            pass = self.stats.count,
            copied_bytes = copied,
            pause_us = pause.as_micros() as u64,
            "garbage collection"
        );
    }

    /// Move one reference into the new space, if it has not moved
    /// already, and return its new location.
    fn forward(&mut self, oop: Oop, pending: &mut Vec<usize>) -> Oop {
        if oop.is_small_int() {
            return oop;
        }
        let w = oop.word();
        if w < self.old_base || w >= self.old_top {
            // Already in the new space; nothing to move.
            debug_assert!(w >= self.pointer && w < self.top);
            return oop;
        }
        let header = Header::from_raw(self.words[w]);
        if header.is_forwarded() {
            return Oop::from_raw(self.words[w + 1]);
        }
        let total = header.total_words();
        self.pointer -= total;
        let new_w = self.pointer;
        self.words.copy_within(w..w + total, new_w);
        let target = Oop::reference(new_w);
        self.words[w] = header.forwarded().raw();
        self.words[w + 1] = target.raw();
        pending.push(new_w);
        target
    }

    /// Scan copied objects until the work stack is empty, forwarding
    /// their class words and, for pointer objects, every field.
    fn scan(&mut self, pending: &mut Vec<usize>) {
        while let Some(w) = pending.pop() {
            let header = Header::from_raw(self.words[w]);
            let class = Oop::from_raw(self.words[w + 1]);
            let class = self.forward(class, pending);
            self.words[w + 1] = class.raw();
            if header.is_binary() {
                continue;
            }
            for i in 0..header.size() {
                let field = Oop::from_raw(self.words[w + 2 + i]);
                if field.is_reference() {
                    let moved = self.forward(field, pending);
                    self.words[w + 2 + i] = moved.raw();
                }
            }
        }
    }
}
