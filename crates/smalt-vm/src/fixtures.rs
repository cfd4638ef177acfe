// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Test universe: a minimal class world plus a method assembler.
//!
//! Production images come out of the bootstrap compiler; tests build
//! an equivalent miniature by hand. The build runs in one shot with
//! no intervening collection (asserted at the end), so plain host
//! references stay valid while the world is wired up. Afterwards all
//! mutation goes through the rooted, collection-safe paths.
//!
//! The fixture flattens the metaclass pattern: every class's class is
//! `Class`. The full pattern belongs to the bootstrap compiler.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;

use crate::bytecode::{encode, encode_wide, op, special};
use crate::dictionary;
use crate::interp::{Outcome, VmFault, execute};
use crate::memory::ObjectMemory;
use crate::object::Oop;
use crate::object::layout::{
    SYMBOLS_IN_SYMBOL_CLASS, class, context, dictionary as dict_layout, method, node, process,
};
use crate::vm::{Vm, WellKnownSeed};

const CLASS_NAMES: [&str; 17] = [
    "Array",
    "Block",
    "ByteArray",
    "Class",
    "Context",
    "Dictionary",
    "False",
    "Integer",
    "Method",
    "Node",
    "Object",
    "Process",
    "SmallInt",
    "String",
    "Symbol",
    "True",
    "Undefined",
];

/// A ready-to-run machine over the miniature class world.
pub struct World {
    pub vm: Vm,
}

impl World {
    /// Build the world with a default-sized heap.
    pub fn new() -> Self {
        Self::with_heap(60_000)
    }

    /// Build the world with `space_words` words per heap space. The
    /// build itself must fit without a collection.
    pub fn with_heap(space_words: usize) -> Self {
        let mut mem = ObjectMemory::new(space_words);

        // The very first object: nil. Its class is patched once the
        // Undefined class exists.
        let nil = mem.allocate(0, Oop::small(0)).unwrap();

        let mut symbols: HashMap<String, Oop> = HashMap::new();
        let mut raw_symbol = |mem: &mut ObjectMemory, text: &str| -> Oop {
            if let Some(existing) = symbols.get(text) {
                return *existing;
            }
            let sym = mem.allocate_binary(text.len(), nil).unwrap();
            mem.set_bytes(sym, text.as_bytes());
            symbols.insert(text.to_owned(), sym);
            sym
        };

        // Classes, flat: parents wired below, class-of patched below.
        let mut classes: HashMap<&str, Oop> = HashMap::new();
        for name in CLASS_NAMES {
            let fields = if name == "Symbol" {
                SYMBOLS_IN_SYMBOL_CLASS + 1
            } else {
                class::SIZE
            };
            let cls = mem.allocate(fields, nil).unwrap();
            let sym = raw_symbol(&mut mem, name);
            mem.set_field(cls, class::NAME, sym);
            mem.set_field(cls, class::INSTANCE_SIZE, Oop::small(0));
            classes.insert(name, cls);
        }
        let class_class = classes["Class"];
        let object_class = classes["Object"];
        for (name, cls) in &classes {
            mem.set_class_word(*cls, class_class);
            if *name != "Object" {
                mem.set_field(*cls, class::PARENT, object_class);
            }
        }
        mem.set_class_word(nil, classes["Undefined"]);

        let array_class = classes["Array"];
        let empty_variables = mem.allocate(0, nil).unwrap();
        mem.set_class_word(empty_variables, array_class);

        // One empty method dictionary per class.
        let dictionary_class = classes["Dictionary"];
        for cls in classes.values() {
            let keys = mem.allocate(0, nil).unwrap();
            mem.set_class_word(keys, array_class);
            let values = mem.allocate(0, nil).unwrap();
            mem.set_class_word(values, array_class);
            let dict = mem.allocate(dict_layout::SIZE, nil).unwrap();
            mem.set_class_word(dict, dictionary_class);
            mem.set_field(dict, dict_layout::KEYS, keys);
            mem.set_field(dict, dict_layout::VALUES, values);
            mem.set_field(*cls, class::METHODS, dict);
            mem.set_field(*cls, class::VARIABLES, empty_variables);
        }

        // Booleans.
        let true_obj = mem.allocate(0, nil).unwrap();
        mem.set_class_word(true_obj, classes["True"]);
        let false_obj = mem.allocate(0, nil).unwrap();
        mem.set_class_word(false_obj, classes["False"]);

        // Well-known selectors.
        let less = raw_symbol(&mut mem, "<");
        let less_equal = raw_symbol(&mut mem, "<=");
        let plus = raw_symbol(&mut mem, "+");
        let bad_method = raw_symbol(&mut mem, "doesNotUnderstand:");
        let main_sym = raw_symbol(&mut mem, "main");
        let smalltalk = raw_symbol(&mut mem, "Smalltalk");
        let nil_sym = raw_symbol(&mut mem, "nil");
        let true_sym = raw_symbol(&mut mem, "true");
        let false_sym = raw_symbol(&mut mem, "false");

        // The globals dictionary, keys sorted by the symbol order.
        let mut entries: Vec<(Oop, Oop)> = CLASS_NAMES
            .iter()
            .map(|name| (symbols[*name], classes[name]))
            .collect();
        entries.push((nil_sym, nil));
        entries.push((true_sym, true_obj));
        entries.push((false_sym, false_obj));
        let globals = {
            let keys = mem.allocate(entries.len() + 1, nil).unwrap();
            mem.set_class_word(keys, array_class);
            let values = mem.allocate(entries.len() + 1, nil).unwrap();
            mem.set_class_word(values, array_class);
            let dict = mem.allocate(dict_layout::SIZE, nil).unwrap();
            mem.set_class_word(dict, dictionary_class);
            mem.set_field(dict, dict_layout::KEYS, keys);
            mem.set_field(dict, dict_layout::VALUES, values);
            entries.push((smalltalk, dict));
            entries.sort_by(|a, b| {
                let left = mem.bytes(a.0);
                let right = mem.bytes(b.0);
                left.cmp(&right)
            });
            for (i, (key, value)) in entries.iter().enumerate() {
                mem.set_field(keys, i, *key);
                mem.set_field(values, i, *value);
            }
            dict
        };

        // Symbol tree: every symbol so far, so interning stays
        // identity-preserving.
        let symbol_class = classes["Symbol"];
        let node_class = classes["Node"];
        let all_symbols: Vec<Oop> = symbols.values().copied().collect();
        for sym in &all_symbols {
            mem.set_class_word(*sym, symbol_class);
        }
        for sym in &all_symbols {
            let fresh = mem.allocate(node::SIZE, nil).unwrap();
            mem.set_class_word(fresh, node_class);
            mem.set_field(fresh, node::VALUE, *sym);
            let text = mem.bytes(*sym);
            let mut parent = nil;
            let mut side = node::LEFT;
            let mut current = mem.field(symbol_class, SYMBOLS_IN_SYMBOL_CLASS);
            while current != nil {
                parent = current;
                let probe = mem.field(current, node::VALUE);
                if dictionary::compare_symbol_to_text(&mem, probe, &text)
                    == core::cmp::Ordering::Greater
                {
                    side = node::LEFT;
                    current = mem.field(current, node::LEFT);
                } else {
                    side = node::RIGHT;
                    current = mem.field(current, node::RIGHT);
                }
            }
            if parent == nil {
                mem.set_field(symbol_class, SYMBOLS_IN_SYMBOL_CLASS, fresh);
            } else {
                mem.set_field(parent, side, fresh);
            }
        }

        // A trivial entry method: ^ 0.
        let byte_array_class = classes["ByteArray"];
        let method_class = classes["Method"];
        let initial_method = {
            let mut code = Vec::new();
            encode(&mut code, op::PUSH_CONSTANT, 0);
            encode(&mut code, op::DO_SPECIAL, special::STACK_RETURN);
            let bytes = mem.allocate_binary(code.len(), nil).unwrap();
            mem.set_class_word(bytes, byte_array_class);
            mem.set_bytes(bytes, &code);
            let literals = mem.allocate(0, nil).unwrap();
            mem.set_class_word(literals, array_class);
            let mth = mem.allocate(method::SIZE, nil).unwrap();
            mem.set_class_word(mth, method_class);
            mem.set_field(mth, method::NAME, main_sym);
            mem.set_field(mth, method::BYTE_CODES, bytes);
            mem.set_field(mth, method::LITERALS, literals);
            mem.set_field(mth, method::STACK_SIZE, Oop::small(4));
            mem.set_field(mth, method::TEMPORARY_SIZE, Oop::small(0));
            mem.set_field(mth, method::OWNING_CLASS, object_class);
            mth
        };

        assert_eq!(mem.stats().count, 0, "world build must not collect");

        let seed = WellKnownSeed {
            nil,
            true_obj,
            false_obj,
            globals,
            initial_method,
            binary_selectors: [less, less_equal, plus],
            bad_method_selector: bad_method,
            small_int_class: classes["SmallInt"],
            integer_class: classes["Integer"],
            array_class,
            block_class: classes["Block"],
            context_class: classes["Context"],
            string_class: classes["String"],
            byte_array_class,
        };
        Self {
            vm: Vm::new(mem, &seed),
        }
    }

    /// Intern a symbol through the machine's symbol tree.
    pub fn symbol(&mut self, text: &str) -> Oop {
        self.vm
            .intern_symbol(text)
            .unwrap()
            .expect("world has a Symbol class")
    }

    /// A class from the globals dictionary.
    pub fn class_named(&self, name: &str) -> Oop {
        self.vm.lookup_global(name).expect("class registered")
    }

    /// Create a class and register it in the globals dictionary.
    pub fn new_class(&mut self, name: &str, parent: Oop) -> Oop {
        let vm = &mut self.vm;
        vm.memory.push_root(parent).unwrap();
        let name_sym = self.symbol(name);
        let vm = &mut self.vm;
        vm.memory.push_root(name_sym).unwrap();
        let cls = vm.alloc_object(class::SIZE).unwrap();
        vm.memory.push_root(cls).unwrap();
        let keys = vm.new_array(0).unwrap();
        {
            let cls = vm.memory.root_at(vm.memory.root_depth() - 1);
            vm.memory.set_field(cls, dict_layout::KEYS, keys);
        }
        let values = vm.new_array(0).unwrap();
        {
            let cls = vm.memory.root_at(vm.memory.root_depth() - 1);
            vm.memory.set_field(cls, dict_layout::VALUES, values);
        }
        let dict = vm.alloc_object(dict_layout::SIZE).unwrap();
        let cls = vm.memory.pop_root();
        let name_sym = vm.memory.pop_root();
        let parent = vm.memory.pop_root();

        // The keys/values stashed in the class fields above were only
        // parked there to survive the allocations; move them over.
        let keys = vm.memory.field(cls, dict_layout::KEYS);
        let values = vm.memory.field(cls, dict_layout::VALUES);
        let dictionary_class = self.class_named("Dictionary");
        let vm = &mut self.vm;
        vm.memory.set_class_word(dict, dictionary_class);
        vm.memory.set_field(dict, dict_layout::KEYS, keys);
        vm.memory.set_field(dict, dict_layout::VALUES, values);

        let class_class = self.class_named("Class");
        let vm = &mut self.vm;
        vm.memory.set_class_word(cls, class_class);
        vm.memory.set_field(cls, class::NAME, name_sym);
        vm.memory.set_field(cls, class::PARENT, parent);
        vm.memory.set_field(cls, class::METHODS, dict);
        vm.memory.set_field(cls, class::INSTANCE_SIZE, Oop::small(0));
        let nil = vm.nil();
        vm.memory.set_field(cls, class::VARIABLES, nil);

        // Register the class so it survives collections and can be
        // re-derived by name.
        vm.memory.push_root(cls).unwrap();
        let globals = vm.globals();
        self.dict_insert(globals, name_sym, cls);
        self.vm.memory.pop_root()
    }

    /// Insert (or replace) an entry in a sorted dictionary,
    /// collection-safe.
    fn dict_insert(&mut self, dict: Oop, sym: Oop, value: Oop) {
        let vm = &mut self.vm;
        let keys = vm.memory.field(dict, dict_layout::KEYS);
        let values = vm.memory.field(dict, dict_layout::VALUES);
        let count = vm.memory.size_of(keys);
        for i in 0..count {
            if vm.memory.field(keys, i) == sym {
                vm.memory.set_field(values, i, value);
                return;
            }
        }

        vm.memory.push_root(dict).unwrap();
        vm.memory.push_root(sym).unwrap();
        vm.memory.push_root(value).unwrap();
        let new_keys = vm.new_array(count + 1).unwrap();
        vm.memory.push_root(new_keys).unwrap();
        let new_values = vm.new_array(count + 1).unwrap();
        let new_keys = vm.memory.pop_root();
        let value = vm.memory.pop_root();
        let sym = vm.memory.pop_root();
        let dict = vm.memory.pop_root();

        let keys = vm.memory.field(dict, dict_layout::KEYS);
        let values = vm.memory.field(dict, dict_layout::VALUES);
        let text = vm.memory.bytes(sym);
        let mut at = count;
        for i in 0..count {
            let probe = vm.memory.field(keys, i);
            if dictionary::compare_symbol_to_text(&vm.memory, probe, &text)
                == core::cmp::Ordering::Greater
            {
                at = i;
                break;
            }
        }
        for i in 0..at {
            let k = vm.memory.field(keys, i);
            let v = vm.memory.field(values, i);
            vm.memory.set_field(new_keys, i, k);
            vm.memory.set_field(new_values, i, v);
        }
        vm.memory.set_field(new_keys, at, sym);
        vm.memory.set_field(new_values, at, value);
        for i in at..count {
            let k = vm.memory.field(keys, i);
            let v = vm.memory.field(values, i);
            vm.memory.set_field(new_keys, i + 1, k);
            vm.memory.set_field(new_values, i + 1, v);
        }
        vm.memory.set_field(dict, dict_layout::KEYS, new_keys);
        vm.memory.set_field(dict, dict_layout::VALUES, new_values);
    }

    /// Allocate an instance of `cls` with nil fields.
    pub fn instance_of(&mut self, cls: Oop, fields: usize) -> Oop {
        let vm = &mut self.vm;
        vm.memory.push_root(cls).unwrap();
        let obj = vm.alloc_object(fields).unwrap();
        let cls = vm.memory.pop_root();
        vm.memory.set_class_word(obj, cls);
        obj
    }

    /// Install `target` under `selector` in the class's method
    /// dictionary, keeping the keys sorted and the cache coherent.
    pub fn install_method(&mut self, cls: Oop, selector: &str, target: Oop) {
        let vm = &mut self.vm;
        vm.memory.push_root(cls).unwrap();
        vm.memory.push_root(target).unwrap();
        let sym = self.symbol(selector);
        let vm = &mut self.vm;
        let target = vm.memory.pop_root();
        let cls = vm.memory.pop_root();

        let dict = vm.memory.field(cls, class::METHODS);
        self.dict_insert(dict, sym, target);
        self.vm.cache.flush();
    }

    /// Build a process executing `target` with no receiver.
    pub fn new_process(&mut self, target: Oop) -> Oop {
        self.build_process(target, None)
    }

    /// Build a process executing `target` with `receiver` as
    /// argument 0.
    pub fn new_process_with_receiver(&mut self, target: Oop, receiver: Oop) -> Oop {
        self.build_process(target, Some(receiver))
    }

    fn build_process(&mut self, target: Oop, receiver: Option<Oop>) -> Oop {
        let vm = &mut self.vm;
        let stack_size = vm.memory.field(target, method::STACK_SIZE).value() as usize;
        let temporary_size = vm.memory.field(target, method::TEMPORARY_SIZE).value() as usize;

        vm.memory.push_root(target).unwrap();
        if let Some(r) = receiver {
            vm.memory.push_root(r).unwrap();
        }
        let ctx = vm.alloc_object(context::SIZE).unwrap();
        let context_class = vm.context_class();
        vm.memory.set_class_word(ctx, context_class);
        vm.memory.push_root(ctx).unwrap();
        let stack = vm.new_array(stack_size).unwrap();
        {
            let ctx = vm.memory.root_at(vm.memory.root_depth() - 1);
            vm.memory.set_field(ctx, context::STACK, stack);
        }
        let temporaries = vm.new_array(temporary_size).unwrap();
        {
            let ctx = vm.memory.root_at(vm.memory.root_depth() - 1);
            vm.memory.set_field(ctx, context::TEMPORARIES, temporaries);
        }
        let arguments = if receiver.is_some() {
            let args = vm.new_array(1).unwrap();
            let depth = vm.memory.root_depth();
            let r = vm.memory.root_at(depth - 2);
            vm.memory.set_field(args, 0, r);
            args
        } else {
            vm.nil()
        };
        let ctx = vm.memory.pop_root();
        if receiver.is_some() {
            vm.memory.pop_root();
        }
        let target = vm.memory.pop_root();

        vm.memory.set_field(ctx, context::METHOD, target);
        vm.memory.set_field(ctx, context::ARGUMENTS, arguments);
        vm.memory.set_field(ctx, context::BYTE_POINTER, Oop::small(0));
        vm.memory.set_field(ctx, context::STACK_TOP, Oop::small(0));
        let nil = vm.nil();
        vm.memory.set_field(ctx, context::PREVIOUS_CONTEXT, nil);

        vm.memory.push_root(ctx).unwrap();
        let proc_obj = vm.alloc_object(process::SIZE).unwrap();
        let ctx = vm.memory.pop_root();
        let process_class = self.class_named("Process");
        let vm = &mut self.vm;
        vm.memory.set_class_word(proc_obj, process_class);
        vm.memory.set_field(proc_obj, process::CONTEXT, ctx);
        proc_obj
    }

    /// Root the process, run it, unroot it.
    pub fn run(&mut self, proc_obj: Oop, ticks: u32) -> Result<Outcome, VmFault> {
        self.vm.memory.push_root(proc_obj).unwrap();
        let outcome = execute(&mut self.vm, ticks);
        self.vm.memory.pop_root();
        outcome
    }

    /// Root the process, run it, return its result slot.
    pub fn run_to_result(&mut self, proc_obj: Oop) -> Oop {
        self.vm.memory.push_root(proc_obj).unwrap();
        let outcome = execute(&mut self.vm, 0).unwrap();
        assert_eq!(outcome, Outcome::Returned);
        let proc_obj = self.vm.memory.pop_root();
        self.vm.memory.field(proc_obj, process::RESULT)
    }
}

/// Literal table entry for [`MethodBuilder`].
pub enum Literal {
    /// A small integer literal.
    Small(i32),
    /// An interned symbol.
    Symbol(String),
    /// A value from the globals dictionary, by name.
    Global(String),
}

/// Assembles a compiled method the way the bootstrap compiler would.
pub struct MethodBuilder {
    code: Vec<u8>,
    literals: Vec<Literal>,
    stack_size: i32,
    temporary_size: i32,
}

impl MethodBuilder {
    pub fn new(stack_size: i32, temporary_size: i32) -> Self {
        Self {
            code: Vec::new(),
            literals: Vec::new(),
            stack_size,
            temporary_size,
        }
    }

    /// Emit one instruction, extended form when needed.
    pub fn op(&mut self, opcode: u8, argument: u8) -> &mut Self {
        encode(&mut self.code, opcode, argument);
        self
    }

    /// Emit a DoSpecial instruction.
    pub fn special(&mut self, argument: u8) -> &mut Self {
        encode(&mut self.code, op::DO_SPECIAL, argument);
        self
    }

    /// Emit a raw byte (primitive numbers, operands).
    pub fn byte(&mut self, value: u8) -> &mut Self {
        self.code.push(value);
        self
    }

    /// Emit a primitive call.
    pub fn primitive(&mut self, argument_count: u8, number: u8) -> &mut Self {
        encode(&mut self.code, op::DO_PRIMITIVE, argument_count);
        self.code.push(number);
        self
    }

    /// Current bytecode position, for backward branch targets.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    /// Emit a branch special with a known target.
    pub fn branch_to(&mut self, kind: u8, target: usize) -> &mut Self {
        encode(&mut self.code, op::DO_SPECIAL, kind);
        encode_wide(&mut self.code, target as u16);
        self
    }

    /// Emit a branch special with a placeholder target; returns the
    /// patch position for [`MethodBuilder::patch`].
    pub fn branch_forward(&mut self, kind: u8) -> usize {
        encode(&mut self.code, op::DO_SPECIAL, kind);
        let at = self.code.len();
        encode_wide(&mut self.code, 0);
        at
    }

    /// Emit a PushBlock with the argument slot; returns the patch
    /// position for the skip target.
    pub fn push_block(&mut self, argument_location: u8) -> usize {
        encode(&mut self.code, op::PUSH_BLOCK, argument_location);
        let at = self.code.len();
        encode_wide(&mut self.code, 0);
        at
    }

    /// Patch a placeholder with the current position.
    pub fn patch(&mut self, at: usize) -> &mut Self {
        let target = self.code.len() as u16;
        self.code[at] = (target & 0xFF) as u8;
        self.code[at + 1] = (target >> 8) as u8;
        self
    }

    /// Add a literal and return its index.
    pub fn literal(&mut self, entry: Literal) -> u8 {
        self.literals.push(entry);
        (self.literals.len() - 1) as u8
    }

    /// Materialize the method object.
    pub fn finish(self, world: &mut World, name: &str, owner: Oop) -> Oop {
        let vm = &mut world.vm;
        vm.memory.push_root(owner).unwrap();

        let bytes = vm.alloc_binary(self.code.len()).unwrap();
        let byte_array_class = vm.byte_array_class();
        vm.memory.set_class_word(bytes, byte_array_class);
        vm.memory.set_bytes(bytes, &self.code);
        vm.memory.push_root(bytes).unwrap();

        let literals = vm.new_array(self.literals.len()).unwrap();
        vm.memory.push_root(literals).unwrap();

        for (i, entry) in self.literals.iter().enumerate() {
            let value = match entry {
                Literal::Small(v) => Oop::small(*v),
                Literal::Symbol(text) => world.symbol(text),
                Literal::Global(text) => world.class_named(text),
            };
            let vm = &mut world.vm;
            let depth = vm.memory.root_depth();
            let literals = vm.memory.root_at(depth - 1);
            vm.memory.set_field(literals, i, value);
        }

        let name_sym = world.symbol(name);
        let vm = &mut world.vm;
        vm.memory.push_root(name_sym).unwrap();
        let mth = vm.alloc_object(method::SIZE).unwrap();
        let name_sym = vm.memory.pop_root();
        let literals = vm.memory.pop_root();
        let bytes = vm.memory.pop_root();
        let owner = vm.memory.pop_root();

        let method_class = world.class_named("Method");
        let vm = &mut world.vm;
        vm.memory.set_class_word(mth, method_class);
        vm.memory.set_field(mth, method::NAME, name_sym);
        vm.memory.set_field(mth, method::BYTE_CODES, bytes);
        vm.memory.set_field(mth, method::LITERALS, literals);
        vm.memory
            .set_field(mth, method::STACK_SIZE, Oop::small(self.stack_size));
        vm.memory
            .set_field(mth, method::TEMPORARY_SIZE, Oop::small(self.temporary_size));
        vm.memory.set_field(mth, method::OWNING_CLASS, owner);
        mth
    }
}
