// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Bytecode format for the Smalt VM.
//!
//! Each instruction is one byte: the high nibble is the opcode, the
//! low nibble an immediate argument. When the immediate does not fit
//! in four bits, the byte carries opcode 0 (the extended prefix) with
//! the real opcode in the low nibble, followed by one argument byte.
//! Multi-byte operands (branch targets, block skip offsets) are two
//! bytes, little-endian.


/// Major opcodes (high nibble).
pub mod op {
    /// Prefix: low nibble is the real opcode, next byte the argument.
    pub const EXTENDED: u8 = 0;
    /// Push a receiver instance field.
    pub const PUSH_INSTANCE: u8 = 1;
    /// Push an argument; argument 0 is the receiver.
    pub const PUSH_ARGUMENT: u8 = 2;
    /// Push a temporary.
    pub const PUSH_TEMPORARY: u8 = 3;
    /// Push a literal-array entry.
    pub const PUSH_LITERAL: u8 = 4;
    /// Push a constant; see [`super::constant`].
    pub const PUSH_CONSTANT: u8 = 5;
    /// Store the stack top into a receiver instance field (no pop).
    pub const ASSIGN_INSTANCE: u8 = 6;
    /// Store the stack top into a temporary (no pop).
    pub const ASSIGN_TEMPORARY: u8 = 7;
    /// Pop N items into a fresh argument array, push the array.
    pub const MARK_ARGUMENTS: u8 = 8;
    /// Send the selector at a literal index to the marked arguments.
    pub const SEND_MESSAGE: u8 = 9;
    /// Send a unary shortcut; see [`super::unary`].
    pub const SEND_UNARY: u8 = 10;
    /// Send a binary shortcut; see [`super::binary`].
    pub const SEND_BINARY: u8 = 11;
    /// Create a block; argument is the block's argument count, the
    /// next two bytes the bytecode index just past the body.
    pub const PUSH_BLOCK: u8 = 12;
    /// Call a primitive; argument is the argument count, the next
    /// byte the primitive number.
    pub const DO_PRIMITIVE: u8 = 13;
    /// Special operation; see [`super::special`].
    pub const DO_SPECIAL: u8 = 15;
}

/// Arguments of [`op::DO_SPECIAL`].
pub mod special {
    /// Return the receiver from the current method.
    pub const SELF_RETURN: u8 = 1;
    /// Return the stack top from the current method.
    pub const STACK_RETURN: u8 = 2;
    /// Return the stack top from the block's home method.
    pub const BLOCK_RETURN: u8 = 3;
    /// Push the stack top again.
    pub const DUPLICATE: u8 = 4;
    /// Discard the stack top.
    pub const POP_TOP: u8 = 5;
    /// Unconditional branch; next two bytes are the target.
    pub const BRANCH: u8 = 6;
    /// Pop; branch when the popped value is true.
    pub const BRANCH_IF_TRUE: u8 = 7;
    /// Pop; branch when the popped value is false.
    pub const BRANCH_IF_FALSE: u8 = 8;
    /// Send starting at the superclass of the method's owner; next
    /// byte is the selector's literal index.
    pub const SEND_TO_SUPER: u8 = 11;
    /// Suspend execution; reserved for debuggers.
    pub const BREAKPOINT: u8 = 12;
}

/// Arguments of [`op::PUSH_CONSTANT`]. Values 0 through 9 push the
/// corresponding small integer.
pub mod constant {
    /// The nil object.
    pub const NIL: u8 = 10;
    /// The true object.
    pub const TRUE: u8 = 11;
    /// The false object.
    pub const FALSE: u8 = 12;
}

/// Arguments of [`op::SEND_UNARY`].
pub mod unary {
    /// Push whether the popped value is nil.
    pub const IS_NIL: u8 = 0;
    /// Push whether the popped value is not nil.
    pub const NOT_NIL: u8 = 1;
}

/// Arguments of [`op::SEND_BINARY`]. The order matches the cached
/// binary selectors of the image format.
pub mod binary {
    /// `<` on two small integers, else a full send.
    pub const LESS_THAN: u8 = 0;
    /// `<=` on two small integers, else a full send.
    pub const LESS_OR_EQUAL: u8 = 1;
    /// `+` on two small integers, else a full send.
    pub const ADD: u8 = 2;
}

/// Split an instruction byte into opcode and immediate nibbles.
#[inline]
#[must_use]
pub const fn decode(byte: u8) -> (u8, u8) {
    (byte >> 4, byte & 0x0F)
}

/// Encode one instruction, using the extended prefix when the
/// argument does not fit in four bits.
pub fn encode(code: &mut Vec<u8>, opcode: u8, argument: u8) {
    debug_assert!(opcode <= 0x0F && opcode != op::EXTENDED);
    if argument < 16 {
        code.push(opcode << 4 | argument);
    } else {
        code.push(op::EXTENDED << 4 | opcode);
        code.push(argument);
    }
}

/// Append a little-endian two-byte operand.
pub fn encode_wide(code: &mut Vec<u8>, value: u16) {
    code.push((value & 0xFF) as u8);
    code.push((value >> 8) as u8);
}

/// Read a little-endian two-byte operand at `index`.
#[inline]
#[must_use]
pub const fn decode_wide(low: u8, high: u8) -> u16 {
    (low as u16) | ((high as u16) << 8)
}
