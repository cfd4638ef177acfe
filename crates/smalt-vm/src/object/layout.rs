// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Fixed field indices of the well-known instance shapes.
//!
//! The image and the compiler bake these ordinals in; they must never
//! change. Field index 0 is the first slot after the class reference.

/// A class: name, parent, method dictionary, instance size, variables.
pub mod class {
    /// Symbol naming the class.
    pub const NAME: usize = 0;
    /// Parent class, or nil at the root.
    pub const PARENT: usize = 1;
    /// Dictionary mapping selector symbols to methods.
    pub const METHODS: usize = 2;
    /// Small integer: instance field count.
    pub const INSTANCE_SIZE: usize = 3;
    /// Array of instance variable name symbols.
    pub const VARIABLES: usize = 4;
    /// Field count of a class object.
    pub const SIZE: usize = 5;
}

/// Slot in the `Symbol` class object that roots the symbol tree.
///
/// The slot lies beyond the ordinary class fields; the `Symbol` class
/// object is allocated one field larger than other classes.
pub const SYMBOLS_IN_SYMBOL_CLASS: usize = 5;

/// A compiled method.
pub mod method {
    /// Selector symbol.
    pub const NAME: usize = 0;
    /// Byte object holding the bytecodes.
    pub const BYTE_CODES: usize = 1;
    /// Literal array.
    pub const LITERALS: usize = 2;
    /// Small integer: operand stack slots needed by an activation.
    pub const STACK_SIZE: usize = 3;
    /// Small integer: temporary slots needed by an activation.
    pub const TEMPORARY_SIZE: usize = 4;
    /// Class the method is installed on.
    pub const OWNING_CLASS: usize = 5;
    /// Source text string.
    pub const TEXT: usize = 6;
    /// Field count of a method object.
    pub const SIZE: usize = 7;
}

/// A method activation record.
pub mod context {
    /// The method being executed.
    pub const METHOD: usize = 0;
    /// Argument array; element 0 is the receiver.
    pub const ARGUMENTS: usize = 1;
    /// Temporary array.
    pub const TEMPORARIES: usize = 2;
    /// Operand stack array.
    pub const STACK: usize = 3;
    /// Small integer: next bytecode index.
    pub const BYTE_POINTER: usize = 4;
    /// Small integer: operand stack depth.
    pub const STACK_TOP: usize = 5;
    /// Invoking context, or nil at top level.
    pub const PREVIOUS_CONTEXT: usize = 6;
    /// Field count of a context object.
    pub const SIZE: usize = 7;
}

/// A block: a context with three extra fields.
///
/// The first seven fields alias the context shape; a block shares its
/// method, arguments, temporaries and stack with the creating context.
pub mod block {
    /// Small integer: temporary slot where block arguments land.
    pub const ARGUMENT_LOCATION: usize = 7;
    /// Context whose activation created the block.
    pub const CREATING_CONTEXT: usize = 8;
    /// Small integer: bytecode index of the block body.
    ///
    /// Kept apart from the context byte-pointer field so activation
    /// does not clobber the body entry point.
    pub const BLOCK_BYTE_POINTER: usize = 9;
    /// Field count of a block object.
    pub const SIZE: usize = 10;
}

/// A process: the unit of execution handed to the interpreter.
pub mod process {
    /// Currently active context.
    pub const CONTEXT: usize = 0;
    /// Scheduling status slot; owned by image-level code.
    pub const STATUS: usize = 1;
    /// Result slot: the top-level return value, or the selector that
    /// could not be resolved.
    pub const RESULT: usize = 2;
    /// Field count of a process object.
    pub const SIZE: usize = 3;
}

/// A dictionary: parallel sorted key and value arrays.
pub mod dictionary {
    /// Array of symbols, sorted ascending by the symbol comparator.
    pub const KEYS: usize = 0;
    /// Array of values, parallel to the keys.
    pub const VALUES: usize = 1;
    /// Field count of a dictionary object.
    pub const SIZE: usize = 2;
}

/// A binary tree node, used by the symbol table.
pub mod node {
    /// Payload of this node.
    pub const VALUE: usize = 0;
    /// Left subtree, or nil.
    pub const LEFT: usize = 1;
    /// Right subtree, or nil.
    pub const RIGHT: usize = 2;
    /// Field count of a tree node.
    pub const SIZE: usize = 3;
}
