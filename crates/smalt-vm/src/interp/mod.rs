// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The bytecode interpreter.
//!
//! [`execute`] runs one process until it returns, faults, or exhausts
//! its tick budget. All interpreter state lives in heap objects (the
//! process, its context chain, blocks); the host locals cached in a
//! [`Frame`] are written back before any allocation and reloaded
//! afterwards, because every allocation may run the collector and
//! move every object.
//!
//! The discipline for every allocation site is the same:
//!
//! 1. write the byte pointer and stack top back into the context,
//! 2. push the context and any other live references on the dynamic
//!    root stack,
//! 3. allocate,
//! 4. pop the (possibly moved) references back and reload the frame.

#[cfg(test)]
mod scenario_test;

use thiserror::Error;
use tracing::trace;

use crate::bytecode::{binary, constant, decode, decode_wide, op, special, unary};
use crate::memory::MemoryError;
use crate::object::Oop;
use crate::object::layout::{block, class, context, method, process};
use crate::primitives::{self, PrimitiveFailed};
use crate::vm::Vm;

/// Essential primitive numbers resolved inside the interpreter.
pub mod prim {
    /// Reference identity of two values.
    pub const IDENTITY: u8 = 1;
    /// Class of a value.
    pub const CLASS: u8 = 2;
    /// Field or byte count of an object.
    pub const SIZE: u8 = 4;
    /// Store into a pointer object, 1-based: (object, index, value).
    pub const AT_PUT: u8 = 5;
    /// Run a process: (process, ticks) -> result code.
    pub const EXECUTE: u8 = 6;
    /// Allocate a pointer object: (class, size).
    pub const NEW_OBJECT: u8 = 7;
    /// Invoke a block: (block, arguments...).
    pub const BLOCK_INVOKE: u8 = 8;
    /// Small-integer addition.
    pub const SMALL_ADD: u8 = 10;
    /// Small-integer division, truncating.
    pub const SMALL_QUO: u8 = 11;
    /// Small-integer remainder.
    pub const SMALL_REM: u8 = 12;
    /// Small-integer less-than.
    pub const SMALL_LESS: u8 = 13;
    /// Small-integer equality.
    pub const SMALL_EQUAL: u8 = 14;
    /// Small-integer multiplication.
    pub const SMALL_MUL: u8 = 15;
    /// Small-integer subtraction.
    pub const SMALL_SUB: u8 = 16;
    /// Terminate the process with a user-defined result: (result).
    pub const TERMINATE: u8 = 19;
    /// Allocate a byte object: (class, size).
    pub const NEW_BYTE_OBJECT: u8 = 20;
    /// Load a byte, 1-based: (object, index).
    pub const BYTE_AT: u8 = 21;
    /// Store a byte, 1-based: (object, index, value).
    pub const BYTE_AT_PUT: u8 = 22;
    /// Load from a pointer object, 1-based: (object, index).
    pub const OBJECT_AT: u8 = 24;
    /// Order two byte objects: -1, 0 or 1.
    pub const BYTE_COMPARE: u8 = 26;
    /// Intern a symbol: (string) -> symbol.
    pub const SYMBOL_INTERN: u8 = 32;
    /// Hash the payload of a byte object.
    pub const BYTE_HASH: u8 = 33;
    /// Flush the method cache after a method install.
    pub const FLUSH_CACHE: u8 = 34;
}

/// How a run of [`execute`] ended. The numeric codes double as the
/// result of the process-execute primitive and the CLI exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Image code terminated the process deliberately.
    UserDefined = 2,
    /// A selector could not be resolved even as doesNotUnderstand:,
    /// or a block return escaped its home method.
    BadMethod = 3,
    /// The top-level method returned.
    Returned = 4,
    /// The tick budget ran out; the process is resumable.
    TimeExpired = 5,
    /// A breakpoint instruction suspended the process.
    Breakpoint = 6,
}

impl Outcome {
    /// The numeric result code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }
}

/// Unrecoverable interpreter failures: heap exhaustion, root stack
/// overflow, or a method/image the machine cannot trust.
#[derive(Debug, Error)]
pub enum VmFault {
    /// The heap or root stack gave out.
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// An opcode or operand the interpreter does not know.
    #[error("invalid bytecode {opcode}/{argument}")]
    InvalidBytecode {
        /// Major opcode.
        opcode: u8,
        /// Immediate argument.
        argument: u8,
    },
    /// The byte pointer ran past the end of the method.
    #[error("byte pointer ran past the end of the method")]
    CodeOverrun,
    /// A push exceeded the method's declared stack size.
    #[error("operand stack overflow")]
    StackOverflow,
    /// A pop on an empty operand stack.
    #[error("operand stack underflow")]
    StackUnderflow,
    /// A context or method field held a value of the wrong shape.
    #[error("corrupt context or method object")]
    CorruptContext,
}

/// Host-local mirror of the active context.
struct Frame {
    ctx: Oop,
    byte_codes: Oop,
    literals: Oop,
    arguments: Oop,
    temporaries: Oop,
    stack: Oop,
    bp: usize,
    stack_top: usize,
}

impl Frame {
    /// Mirror `ctx`, taking the byte pointer and stack top from its
    /// fields.
    fn load(vm: &Vm, ctx: Oop) -> Result<Self, VmFault> {
        let mut frame = Self {
            ctx,
            byte_codes: ctx,
            literals: ctx,
            arguments: ctx,
            temporaries: ctx,
            stack: ctx,
            bp: 0,
            stack_top: 0,
        };
        frame.reload(vm)?;
        Ok(frame)
    }

    /// Refresh every cached reference from the context object, after
    /// an allocation may have moved the world.
    fn reload(&mut self, vm: &Vm) -> Result<(), VmFault> {
        let mem = &vm.memory;
        let ctx = self.ctx;
        let mth = mem.field(ctx, context::METHOD);
        if mth.is_small_int() {
            return Err(VmFault::CorruptContext);
        }
        self.byte_codes = mem.field(mth, method::BYTE_CODES);
        self.literals = mem.field(mth, method::LITERALS);
        self.arguments = mem.field(ctx, context::ARGUMENTS);
        self.temporaries = mem.field(ctx, context::TEMPORARIES);
        self.stack = mem.field(ctx, context::STACK);
        if self.byte_codes.is_small_int() || self.stack.is_small_int() {
            return Err(VmFault::CorruptContext);
        }
        let bp = mem.field(ctx, context::BYTE_POINTER);
        let top = mem.field(ctx, context::STACK_TOP);
        if !bp.is_small_int() || !top.is_small_int() || bp.value() < 0 || top.value() < 0 {
            return Err(VmFault::CorruptContext);
        }
        self.bp = bp.value() as usize;
        self.stack_top = top.value() as usize;
        Ok(())
    }

    /// Write the byte pointer and stack top back into the context.
    fn store(&self, vm: &mut Vm) {
        vm.memory
            .set_field(self.ctx, context::BYTE_POINTER, Oop::small(self.bp as i32));
        vm.memory
            .set_field(self.ctx, context::STACK_TOP, Oop::small(self.stack_top as i32));
    }

    /// The method currently executing.
    fn method(&self, vm: &Vm) -> Oop {
        vm.memory.field(self.ctx, context::METHOD)
    }

    fn next_byte(&mut self, vm: &Vm) -> Result<u8, VmFault> {
        if self.bp >= vm.memory.size_of(self.byte_codes) {
            return Err(VmFault::CodeOverrun);
        }
        let byte = vm.memory.byte(self.byte_codes, self.bp);
        self.bp += 1;
        Ok(byte)
    }

    fn next_wide(&mut self, vm: &Vm) -> Result<usize, VmFault> {
        let low = self.next_byte(vm)?;
        let high = self.next_byte(vm)?;
        Ok(decode_wide(low, high) as usize)
    }

    fn push(&mut self, vm: &mut Vm, value: Oop) -> Result<(), VmFault> {
        if self.stack_top >= vm.memory.size_of(self.stack) {
            return Err(VmFault::StackOverflow);
        }
        vm.memory.set_field(self.stack, self.stack_top, value);
        self.stack_top += 1;
        Ok(())
    }

    fn pop(&mut self, vm: &Vm) -> Result<Oop, VmFault> {
        if self.stack_top == 0 {
            return Err(VmFault::StackUnderflow);
        }
        self.stack_top -= 1;
        Ok(vm.memory.field(self.stack, self.stack_top))
    }

    fn top(&self, vm: &Vm) -> Result<Oop, VmFault> {
        if self.stack_top == 0 {
            return Err(VmFault::StackUnderflow);
        }
        Ok(vm.memory.field(self.stack, self.stack_top - 1))
    }

    /// Stack item `index` of the `count` topmost, oldest first.
    fn arg_at(&self, vm: &Vm, count: usize, index: usize) -> Oop {
        vm.memory
            .field(self.stack, self.stack_top - count + index)
    }

    /// Drop the `count` topmost stack items.
    fn drop_args(&mut self, count: usize) -> Result<(), VmFault> {
        if count > self.stack_top {
            return Err(VmFault::StackUnderflow);
        }
        self.stack_top -= count;
        Ok(())
    }

    /// Allocate a pointer object while keeping the frame coherent.
    fn alloc(&mut self, vm: &mut Vm, fields: usize) -> Result<Oop, VmFault> {
        self.store(vm);
        vm.memory.push_root(self.ctx)?;
        let obj = vm.alloc_object(fields)?;
        self.ctx = vm.memory.pop_root();
        self.reload(vm)?;
        Ok(obj)
    }

    /// Allocate while additionally protecting one extra reference;
    /// returns the object and the refreshed extra.
    fn alloc_with(
        &mut self,
        vm: &mut Vm,
        extra: Oop,
        fields: usize,
        binary: bool,
    ) -> Result<(Oop, Oop), VmFault> {
        self.store(vm);
        vm.memory.push_root(self.ctx)?;
        vm.memory.push_root(extra)?;
        let obj = if binary {
            vm.alloc_binary(fields)?
        } else {
            vm.alloc_object(fields)?
        };
        let extra = vm.memory.pop_root();
        self.ctx = vm.memory.pop_root();
        self.reload(vm)?;
        Ok((obj, extra))
    }
}

/// Execute the process on top of the dynamic root stack.
///
/// The caller pushes the process before the call and pops it after;
/// the interpreter peeks at it for suspension and result recording.
/// `ticks` bounds the number of bytecodes executed; 0 is unbounded.
///
/// # Errors
///
/// [`VmFault`] on unrecoverable failures; the §7 result taxonomy is
/// the `Ok` side.
pub fn execute(vm: &mut Vm, ticks: u32) -> Result<Outcome, VmFault> {
    debug_assert!(vm.memory.root_depth() > 0, "process must be rooted");
    let process_slot = vm.memory.root_depth() - 1;
    let ctx = {
        let proc_obj = vm.memory.root_at(process_slot);
        vm.memory.field(proc_obj, process::CONTEXT)
    };
    if ctx == vm.nil() {
        return Ok(Outcome::Returned);
    }
    let mut frame = Frame::load(vm, ctx)?;
    let mut remaining = ticks;

    loop {
        if ticks != 0 {
            if remaining == 0 {
                suspend(vm, &mut frame, process_slot);
                return Ok(Outcome::TimeExpired);
            }
            remaining -= 1;
        }

        let instruction = frame.next_byte(vm)?;
        let (mut opcode, mut argument) = decode(instruction);
        if opcode == op::EXTENDED {
            opcode = argument;
            argument = frame.next_byte(vm)?;
        }
        trace!(opcode, argument, bp = frame.bp, "step");

        match opcode {
            op::PUSH_INSTANCE => {
                let receiver = vm.memory.field(frame.arguments, 0);
                let value = vm.memory.field(receiver, argument as usize);
                frame.push(vm, value)?;
            }

            op::PUSH_ARGUMENT => {
                let value = vm.memory.field(frame.arguments, argument as usize);
                frame.push(vm, value)?;
            }

            op::PUSH_TEMPORARY => {
                let value = vm.memory.field(frame.temporaries, argument as usize);
                frame.push(vm, value)?;
            }

            op::PUSH_LITERAL => {
                let value = vm.memory.field(frame.literals, argument as usize);
                frame.push(vm, value)?;
            }

            op::PUSH_CONSTANT => match argument {
                0..=9 => frame.push(vm, Oop::small(i32::from(argument)))?,
                constant::NIL => {
                    let nil = vm.nil();
                    frame.push(vm, nil)?;
                }
                constant::TRUE => {
                    let t = vm.true_obj();
                    frame.push(vm, t)?;
                }
                constant::FALSE => {
                    let f = vm.false_obj();
                    frame.push(vm, f)?;
                }
                _ => return Err(VmFault::InvalidBytecode { opcode, argument }),
            },

            op::ASSIGN_INSTANCE => {
                let value = frame.top(vm)?;
                let receiver = vm.memory.field(frame.arguments, 0);
                vm.memory.set_field(receiver, argument as usize, value);
            }

            op::ASSIGN_TEMPORARY => {
                let value = frame.top(vm)?;
                vm.memory
                    .set_field(frame.temporaries, argument as usize, value);
            }

            op::MARK_ARGUMENTS => {
                let count = argument as usize;
                if count > frame.stack_top {
                    return Err(VmFault::StackUnderflow);
                }
                let array = frame.alloc(vm, count)?;
                let array_class = vm.array_class();
                vm.memory.set_class_word(array, array_class);
                for i in 0..count {
                    let value = frame.arg_at(vm, count, i);
                    vm.memory.set_field(array, i, value);
                }
                frame.drop_args(count)?;
                frame.push(vm, array)?;
            }

            op::SEND_MESSAGE => {
                let selector = vm.memory.field(frame.literals, argument as usize);
                let args = frame.pop(vm)?;
                if let Some(outcome) = send(vm, &mut frame, process_slot, selector, args, None)? {
                    return Ok(outcome);
                }
            }

            op::SEND_UNARY => {
                let value = frame.pop(vm)?;
                let nil = vm.nil();
                let result = match argument {
                    unary::IS_NIL => vm.boolean(value == nil),
                    unary::NOT_NIL => vm.boolean(value != nil),
                    _ => return Err(VmFault::InvalidBytecode { opcode, argument }),
                };
                frame.push(vm, result)?;
            }

            op::SEND_BINARY => {
                if argument > binary::ADD {
                    return Err(VmFault::InvalidBytecode { opcode, argument });
                }
                let right = frame.pop(vm)?;
                let left = frame.pop(vm)?;
                if left.is_small_int() && right.is_small_int() {
                    let l = i64::from(left.value());
                    let r = i64::from(right.value());
                    match argument {
                        binary::LESS_THAN => {
                            let result = vm.boolean(l < r);
                            frame.push(vm, result)?;
                            continue;
                        }
                        binary::LESS_OR_EQUAL => {
                            let result = vm.boolean(l <= r);
                            frame.push(vm, result)?;
                            continue;
                        }
                        _ => {
                            let sum = l + r;
                            if Oop::fits_small_int(sum) {
                                frame.push(vm, Oop::small(sum as i32))?;
                                continue;
                            }
                            // Overflow falls through to the full send.
                        }
                    }
                }
                if let Some(outcome) =
                    send_binary_message(vm, &mut frame, process_slot, argument, left, right)?
                {
                    return Ok(outcome);
                }
            }

            op::PUSH_BLOCK => {
                let target = frame.next_wide(vm)?;
                let body_start = frame.bp;
                let blk = frame.alloc(vm, block::SIZE)?;
                let block_class = vm.block_class();
                vm.memory.set_class_word(blk, block_class);
                for field in [
                    context::METHOD,
                    context::ARGUMENTS,
                    context::TEMPORARIES,
                    context::STACK,
                ] {
                    let shared = vm.memory.field(frame.ctx, field);
                    vm.memory.set_field(blk, field, shared);
                }
                vm.memory
                    .set_field(blk, context::BYTE_POINTER, Oop::small(0));
                vm.memory.set_field(
                    blk,
                    context::STACK_TOP,
                    Oop::small(frame.stack_top as i32),
                );
                vm.memory.set_field(
                    blk,
                    block::ARGUMENT_LOCATION,
                    Oop::small(i32::from(argument)),
                );
                vm.memory.set_field(blk, block::CREATING_CONTEXT, frame.ctx);
                vm.memory.set_field(
                    blk,
                    block::BLOCK_BYTE_POINTER,
                    Oop::small(body_start as i32),
                );
                frame.push(vm, blk)?;
                frame.bp = target;
            }

            op::DO_PRIMITIVE => {
                let count = argument as usize;
                let number = frame.next_byte(vm)?;
                if count > frame.stack_top {
                    return Err(VmFault::StackUnderflow);
                }
                if let Some(outcome) =
                    do_primitive(vm, &mut frame, process_slot, number, count)?
                {
                    return Ok(outcome);
                }
            }

            op::DO_SPECIAL => match argument {
                special::SELF_RETURN => {
                    let value = vm.memory.field(frame.arguments, 0);
                    if let Some(outcome) = method_return(vm, &mut frame, process_slot, value)? {
                        return Ok(outcome);
                    }
                }

                special::STACK_RETURN => {
                    let value = frame.pop(vm)?;
                    if let Some(outcome) = method_return(vm, &mut frame, process_slot, value)? {
                        return Ok(outcome);
                    }
                }

                special::BLOCK_RETURN => {
                    let value = frame.pop(vm)?;
                    if let Some(outcome) = block_return(vm, &mut frame, process_slot, value)? {
                        return Ok(outcome);
                    }
                }

                special::DUPLICATE => {
                    let value = frame.top(vm)?;
                    frame.push(vm, value)?;
                }

                special::POP_TOP => {
                    frame.pop(vm)?;
                }

                special::BRANCH => {
                    let target = frame.next_wide(vm)?;
                    frame.bp = target;
                }

                special::BRANCH_IF_TRUE => {
                    let target = frame.next_wide(vm)?;
                    let value = frame.pop(vm)?;
                    if value == vm.true_obj() {
                        frame.bp = target;
                    }
                }

                special::BRANCH_IF_FALSE => {
                    let target = frame.next_wide(vm)?;
                    let value = frame.pop(vm)?;
                    if value == vm.false_obj() {
                        frame.bp = target;
                    }
                }

                special::SEND_TO_SUPER => {
                    let index = frame.next_byte(vm)?;
                    let selector = vm.memory.field(frame.literals, index as usize);
                    let args = frame.pop(vm)?;
                    let owner = vm.memory.field(frame.method(vm), method::OWNING_CLASS);
                    let parent = vm.memory.field(owner, class::PARENT);
                    if let Some(outcome) =
                        send(vm, &mut frame, process_slot, selector, args, Some(parent))?
                    {
                        return Ok(outcome);
                    }
                }

                special::BREAKPOINT => {
                    suspend(vm, &mut frame, process_slot);
                    return Ok(Outcome::Breakpoint);
                }

                _ => return Err(VmFault::InvalidBytecode { opcode, argument }),
            },

            _ => return Err(VmFault::InvalidBytecode { opcode, argument }),
        }
    }
}

/// Write the frame back so the process can be resumed later.
fn suspend(vm: &mut Vm, frame: &mut Frame, process_slot: usize) {
    frame.store(vm);
    let proc_obj = vm.memory.root_at(process_slot);
    vm.memory.set_field(proc_obj, process::CONTEXT, frame.ctx);
}

/// Return `value` from the current method to its invoking context.
fn method_return(
    vm: &mut Vm,
    frame: &mut Frame,
    process_slot: usize,
    value: Oop,
) -> Result<Option<Outcome>, VmFault> {
    let previous = vm.memory.field(frame.ctx, context::PREVIOUS_CONTEXT);
    return_to(vm, frame, process_slot, previous, value)
}

/// Reinstate `target` as the current context and push `value` on its
/// stack; a nil target is a top-level return.
fn return_to(
    vm: &mut Vm,
    frame: &mut Frame,
    process_slot: usize,
    target: Oop,
    value: Oop,
) -> Result<Option<Outcome>, VmFault> {
    if target == vm.nil() {
        let nil = vm.nil();
        let proc_obj = vm.memory.root_at(process_slot);
        vm.memory.set_field(proc_obj, process::RESULT, value);
        vm.memory.set_field(proc_obj, process::CONTEXT, nil);
        return Ok(Some(Outcome::Returned));
    }
    frame.ctx = target;
    frame.reload(vm)?;
    frame.push(vm, value)?;
    Ok(None)
}

/// Non-local return: `value` becomes the result of the block's home
/// method. Fails as bad-method when the home context already left the
/// chain.
fn block_return(
    vm: &mut Vm,
    frame: &mut Frame,
    process_slot: usize,
    value: Oop,
) -> Result<Option<Outcome>, VmFault> {
    if vm.memory.size_of(frame.ctx) < block::SIZE {
        return Err(VmFault::CorruptContext);
    }
    let creating = vm.memory.field(frame.ctx, block::CREATING_CONTEXT);
    let nil = vm.nil();
    let mut walk = frame.ctx;
    while walk != nil && walk != creating {
        walk = vm.memory.field(walk, context::PREVIOUS_CONTEXT);
    }
    if walk == nil {
        // The home method already returned; the block escaped.
        let proc_obj = vm.memory.root_at(process_slot);
        vm.memory.set_field(proc_obj, process::RESULT, nil);
        return Ok(Some(bad_method(vm, frame, process_slot)));
    }
    let target = vm.memory.field(creating, context::PREVIOUS_CONTEXT);
    return_to(vm, frame, process_slot, target, value)
}

/// Give up on the current send, leaving the context chain in place
/// for a back-trace. The process result slot already names the
/// selector that could not be resolved.
fn bad_method(vm: &mut Vm, frame: &mut Frame, process_slot: usize) -> Outcome {
    suspend(vm, frame, process_slot);
    Outcome::BadMethod
}

/// Dispatch `selector` to the receiver in `args[0]` and activate the
/// resolved method. `start_class` overrides the receiver's class for
/// super sends.
fn send(
    vm: &mut Vm,
    frame: &mut Frame,
    process_slot: usize,
    selector: Oop,
    args: Oop,
    start_class: Option<Oop>,
) -> Result<Option<Outcome>, VmFault> {
    if args.is_small_int() {
        return Err(VmFault::CorruptContext);
    }
    let receiver = if vm.memory.size_of(args) > 0 {
        vm.memory.field(args, 0)
    } else {
        vm.nil()
    };
    let start = start_class.unwrap_or_else(|| vm.class_of(receiver));
    let nil = vm.nil();
    let resolved = vm.cache.lookup(&vm.memory, nil, selector, start);

    match resolved {
        Some(found) => {
            activate(vm, frame, found, args)?;
            Ok(None)
        }
        None => {
            // Retry once as doesNotUnderstand: with the original
            // selector as the argument. When the retry itself cannot
            // resolve, the result slot keeps naming the original
            // selector.
            let bad_selector = vm.bad_method_selector();
            if selector == bad_selector {
                return Ok(Some(bad_method(vm, frame, process_slot)));
            }
            let proc_obj = vm.memory.root_at(process_slot);
            vm.memory.set_field(proc_obj, process::RESULT, selector);

            frame.store(vm);
            vm.memory.push_root(frame.ctx)?;
            vm.memory.push_root(receiver)?;
            vm.memory.push_root(selector)?;
            let retry_args = vm.new_array(2)?;
            let selector = vm.memory.pop_root();
            let receiver = vm.memory.pop_root();
            frame.ctx = vm.memory.pop_root();
            frame.reload(vm)?;
            vm.memory.set_field(retry_args, 0, receiver);
            vm.memory.set_field(retry_args, 1, selector);

            send(vm, frame, process_slot, bad_selector, retry_args, None)
        }
    }
}

/// Build the argument array for a binary selector and run the full
/// send.
fn send_binary_message(
    vm: &mut Vm,
    frame: &mut Frame,
    process_slot: usize,
    which: u8,
    left: Oop,
    right: Oop,
) -> Result<Option<Outcome>, VmFault> {
    frame.store(vm);
    vm.memory.push_root(frame.ctx)?;
    vm.memory.push_root(left)?;
    vm.memory.push_root(right)?;
    let args = vm.new_array(2)?;
    let right = vm.memory.pop_root();
    let left = vm.memory.pop_root();
    frame.ctx = vm.memory.pop_root();
    frame.reload(vm)?;
    vm.memory.set_field(args, 0, left);
    vm.memory.set_field(args, 1, right);
    let selector = vm.binary_selector(which as usize);
    send(vm, frame, process_slot, selector, args, None)
}

/// Activate `target` with `args`: allocate the context, its stack and
/// temporaries, link it in front of the current context and switch
/// the frame over.
fn activate(vm: &mut Vm, frame: &mut Frame, target: Oop, args: Oop) -> Result<(), VmFault> {
    let stack_size = small_field(vm, target, method::STACK_SIZE)?;
    let temporary_size = small_field(vm, target, method::TEMPORARY_SIZE)?;

    frame.store(vm);
    vm.memory.push_root(frame.ctx)?;
    vm.memory.push_root(args)?;
    vm.memory.push_root(target)?;

    let ctx = vm.alloc_object(context::SIZE)?;
    let ctx_class = vm.context_class();
    vm.memory.set_class_word(ctx, ctx_class);
    vm.memory.push_root(ctx)?;

    let stack = vm.new_array(stack_size)?;
    {
        let ctx = vm.memory.root_at(vm.memory.root_depth() - 1);
        vm.memory.set_field(ctx, context::STACK, stack);
    }
    let temporaries = vm.new_array(temporary_size)?;

    let ctx = vm.memory.pop_root();
    let target = vm.memory.pop_root();
    let args = vm.memory.pop_root();
    frame.ctx = vm.memory.pop_root();

    vm.memory.set_field(ctx, context::TEMPORARIES, temporaries);
    vm.memory.set_field(ctx, context::METHOD, target);
    vm.memory.set_field(ctx, context::ARGUMENTS, args);
    vm.memory.set_field(ctx, context::BYTE_POINTER, Oop::small(0));
    vm.memory.set_field(ctx, context::STACK_TOP, Oop::small(0));
    vm.memory.set_field(ctx, context::PREVIOUS_CONTEXT, frame.ctx);

    frame.ctx = ctx;
    frame.reload(vm)
}

fn small_field(vm: &Vm, obj: Oop, index: usize) -> Result<usize, VmFault> {
    let value = vm.memory.field(obj, index);
    if !value.is_small_int() || value.value() < 0 {
        return Err(VmFault::CorruptContext);
    }
    Ok(value.value() as usize)
}

/// Run primitive `number` on the `count` topmost stack items. The
/// items are consumed either way; a successful primitive pushes its
/// result, a failed one leaves the bytecode fallback path to run.
#[allow(clippy::too_many_lines)]
fn do_primitive(
    vm: &mut Vm,
    frame: &mut Frame,
    process_slot: usize,
    number: u8,
    count: usize,
) -> Result<Option<Outcome>, VmFault> {
    match number {
        prim::IDENTITY if count == 2 => {
            let a = frame.arg_at(vm, count, 0);
            let b = frame.arg_at(vm, count, 1);
            frame.drop_args(count)?;
            let result = vm.boolean(a == b);
            frame.push(vm, result)?;
        }

        prim::CLASS if count == 1 => {
            let value = frame.arg_at(vm, count, 0);
            frame.drop_args(count)?;
            let result = vm.class_of(value);
            frame.push(vm, result)?;
        }

        prim::SIZE if count == 1 => {
            let value = frame.arg_at(vm, count, 0);
            frame.drop_args(count)?;
            let size = if value.is_small_int() {
                0
            } else {
                vm.memory.size_of(value)
            };
            frame.push(vm, Oop::small(size as i32))?;
        }

        prim::AT_PUT if count == 3 => {
            let target = frame.arg_at(vm, count, 0);
            let index = frame.arg_at(vm, count, 1);
            let value = frame.arg_at(vm, count, 2);
            frame.drop_args(count)?;
            if target.is_reference()
                && !vm.memory.header(target).is_binary()
                && index.is_small_int()
                && index.value() >= 1
                && index.value() as usize <= vm.memory.size_of(target)
            {
                vm.memory
                    .set_field(target, index.value() as usize - 1, value);
                frame.push(vm, target)?;
            }
        }

        prim::EXECUTE if count == 2 => {
            let child = frame.arg_at(vm, count, 0);
            let child_ticks = frame.arg_at(vm, count, 1);
            frame.drop_args(count)?;
            if child.is_reference() && child_ticks.is_small_int() && child_ticks.value() >= 0 {
                frame.store(vm);
                vm.memory.push_root(frame.ctx)?;
                vm.memory.push_root(child)?;
                let outcome = execute(vm, child_ticks.value() as u32)?;
                vm.memory.pop_root();
                frame.ctx = vm.memory.pop_root();
                frame.reload(vm)?;
                frame.push(vm, Oop::small(outcome.code()))?;
            }
        }

        prim::NEW_OBJECT if count == 2 => {
            let wanted_class = frame.arg_at(vm, count, 0);
            let size = frame.arg_at(vm, count, 1);
            frame.drop_args(count)?;
            if size.is_small_int() && size.value() >= 0 {
                let (obj, wanted_class) =
                    frame.alloc_with(vm, wanted_class, size.value() as usize, false)?;
                vm.memory.set_class_word(obj, wanted_class);
                frame.push(vm, obj)?;
            }
        }

        prim::BLOCK_INVOKE if count >= 1 => {
            return invoke_block(vm, frame, count);
        }

        prim::SMALL_ADD
        | prim::SMALL_QUO
        | prim::SMALL_REM
        | prim::SMALL_LESS
        | prim::SMALL_EQUAL
        | prim::SMALL_MUL
        | prim::SMALL_SUB
            if count == 2 =>
        {
            let a = frame.arg_at(vm, count, 0);
            let b = frame.arg_at(vm, count, 1);
            frame.drop_args(count)?;
            if a.is_small_int() && b.is_small_int() {
                small_int_primitive(vm, frame, number, a.value(), b.value())?;
            }
        }

        prim::TERMINATE => {
            let result = if count >= 1 {
                frame.arg_at(vm, count, 0)
            } else {
                vm.nil()
            };
            frame.drop_args(count)?;
            let proc_obj = vm.memory.root_at(process_slot);
            vm.memory.set_field(proc_obj, process::RESULT, result);
            suspend(vm, frame, process_slot);
            return Ok(Some(Outcome::UserDefined));
        }

        prim::NEW_BYTE_OBJECT if count == 2 => {
            let wanted_class = frame.arg_at(vm, count, 0);
            let size = frame.arg_at(vm, count, 1);
            frame.drop_args(count)?;
            if size.is_small_int() && size.value() >= 0 {
                let (obj, wanted_class) =
                    frame.alloc_with(vm, wanted_class, size.value() as usize, true)?;
                vm.memory.set_class_word(obj, wanted_class);
                frame.push(vm, obj)?;
            }
        }

        prim::BYTE_AT if count == 2 => {
            let target = frame.arg_at(vm, count, 0);
            let index = frame.arg_at(vm, count, 1);
            frame.drop_args(count)?;
            if target.is_reference()
                && vm.memory.header(target).is_binary()
                && index.is_small_int()
                && index.value() >= 1
                && index.value() as usize <= vm.memory.size_of(target)
            {
                let byte = vm.memory.byte(target, index.value() as usize - 1);
                frame.push(vm, Oop::small(i32::from(byte)))?;
            }
        }

        prim::BYTE_AT_PUT if count == 3 => {
            let target = frame.arg_at(vm, count, 0);
            let index = frame.arg_at(vm, count, 1);
            let value = frame.arg_at(vm, count, 2);
            frame.drop_args(count)?;
            if target.is_reference()
                && vm.memory.header(target).is_binary()
                && index.is_small_int()
                && index.value() >= 1
                && index.value() as usize <= vm.memory.size_of(target)
                && value.is_small_int()
                && (0..=255).contains(&value.value())
            {
                vm.memory
                    .set_byte(target, index.value() as usize - 1, value.value() as u8);
                frame.push(vm, target)?;
            }
        }

        prim::OBJECT_AT if count == 2 => {
            let target = frame.arg_at(vm, count, 0);
            let index = frame.arg_at(vm, count, 1);
            frame.drop_args(count)?;
            if target.is_reference()
                && !vm.memory.header(target).is_binary()
                && index.is_small_int()
                && index.value() >= 1
                && index.value() as usize <= vm.memory.size_of(target)
            {
                let value = vm.memory.field(target, index.value() as usize - 1);
                frame.push(vm, value)?;
            }
        }

        prim::BYTE_COMPARE if count == 2 => {
            let a = frame.arg_at(vm, count, 0);
            let b = frame.arg_at(vm, count, 1);
            frame.drop_args(count)?;
            if a.is_reference()
                && b.is_reference()
                && vm.memory.header(a).is_binary()
                && vm.memory.header(b).is_binary()
            {
                let order = crate::dictionary::compare_symbols(&vm.memory, a, b);
                frame.push(vm, Oop::small(order as i32))?;
            }
        }

        prim::SYMBOL_INTERN if count == 1 => {
            let text_obj = frame.arg_at(vm, count, 0);
            frame.drop_args(count)?;
            if text_obj.is_reference() && vm.memory.header(text_obj).is_binary() {
                let text = vm.read_text(text_obj);
                frame.store(vm);
                vm.memory.push_root(frame.ctx)?;
                let interned = vm.intern_symbol(&text)?;
                frame.ctx = vm.memory.pop_root();
                frame.reload(vm)?;
                if let Some(symbol) = interned {
                    frame.push(vm, symbol)?;
                }
            }
        }

        prim::BYTE_HASH if count == 1 => {
            let target = frame.arg_at(vm, count, 0);
            frame.drop_args(count)?;
            if target.is_reference() && vm.memory.header(target).is_binary() {
                let mut hash: u32 = 0x811C_9DC5;
                for i in 0..vm.memory.size_of(target) {
                    hash ^= u32::from(vm.memory.byte(target, i));
                    hash = hash.wrapping_mul(0x0100_0193);
                }
                frame.push(vm, Oop::small((hash & 0x3FFF_FFFF) as i32))?;
            }
        }

        prim::FLUSH_CACHE => {
            frame.drop_args(count)?;
            vm.cache.flush();
            let nil = vm.nil();
            frame.push(vm, nil)?;
        }

        _ => {
            // Host primitive: materialize the argument array and hand
            // the call over.
            let args = frame.alloc(vm, count)?;
            let array_class = vm.array_class();
            vm.memory.set_class_word(args, array_class);
            for i in 0..count {
                let value = frame.arg_at(vm, count, i);
                vm.memory.set_field(args, i, value);
            }
            frame.drop_args(count)?;

            frame.store(vm);
            vm.memory.push_root(frame.ctx)?;
            let result = primitives::primitive(vm, number, args);
            frame.ctx = vm.memory.pop_root();
            frame.reload(vm)?;
            match result {
                Ok(value) => frame.push(vm, value)?,
                Err(PrimitiveFailed) => {}
            }
        }
    }
    Ok(None)
}

fn small_int_primitive(
    vm: &mut Vm,
    frame: &mut Frame,
    number: u8,
    a: i32,
    b: i32,
) -> Result<(), VmFault> {
    let result = match number {
        prim::SMALL_ADD => checked_small(i64::from(a) + i64::from(b)),
        prim::SMALL_SUB => checked_small(i64::from(a) - i64::from(b)),
        prim::SMALL_MUL => checked_small(i64::from(a) * i64::from(b)),
        prim::SMALL_QUO => {
            if b == 0 {
                None
            } else {
                checked_small(i64::from(a) / i64::from(b))
            }
        }
        prim::SMALL_REM => {
            if b == 0 {
                None
            } else {
                checked_small(i64::from(a) % i64::from(b))
            }
        }
        prim::SMALL_LESS => Some(vm.boolean(a < b)),
        prim::SMALL_EQUAL => Some(vm.boolean(a == b)),
        _ => None,
    };
    if let Some(value) = result {
        frame.push(vm, value)?;
    }
    Ok(())
}

fn checked_small(value: i64) -> Option<Oop> {
    Oop::fits_small_int(value).then(|| Oop::small(value as i32))
}

/// Activate a block: copy the call arguments into the shared
/// temporaries and seat the block as the current context.
fn invoke_block(vm: &mut Vm, frame: &mut Frame, count: usize) -> Result<Option<Outcome>, VmFault> {
    let blk = frame.arg_at(vm, count, 0);
    let block_class = vm.block_class();
    if blk.is_small_int() || vm.class_of(blk) != block_class {
        frame.drop_args(count)?;
        return Ok(None);
    }
    let location = vm.memory.field(blk, block::ARGUMENT_LOCATION);
    let temporaries = vm.memory.field(blk, context::TEMPORARIES);
    if !location.is_small_int()
        || location.value() < 0
        || location.value() as usize + (count - 1) > vm.memory.size_of(temporaries)
    {
        frame.drop_args(count)?;
        return Ok(None);
    }
    for i in 0..count - 1 {
        let value = frame.arg_at(vm, count, i + 1);
        vm.memory
            .set_field(temporaries, location.value() as usize + i, value);
    }
    frame.drop_args(count)?;
    frame.store(vm);

    // A plain return from the block lands at the caller of the value
    // send; the activation of the value method is bypassed.
    let caller = vm.memory.field(frame.ctx, context::PREVIOUS_CONTEXT);
    vm.memory.set_field(blk, context::PREVIOUS_CONTEXT, caller);
    let entry = vm.memory.field(blk, block::BLOCK_BYTE_POINTER);
    vm.memory.set_field(blk, context::BYTE_POINTER, entry);

    frame.ctx = blk;
    frame.reload(vm)?;
    Ok(None)
}

/// Format the context chain for diagnostics: one line per activation
/// with the method name and the classes of its arguments.
#[must_use]
pub fn backtrace(vm: &Vm, top_context: Oop) -> String {
    let nil = vm.nil();
    let mut lines = String::from("back trace\n");
    let mut ctx = top_context;
    while ctx != nil && ctx.is_reference() {
        let mth = vm.memory.field(ctx, context::METHOD);
        let name = if mth == nil || mth.is_small_int() {
            String::from("(none)")
        } else {
            vm.read_text(vm.memory.field(mth, method::NAME))
        };
        lines.push_str("message ");
        lines.push_str(&name);
        let args = vm.memory.field(ctx, context::ARGUMENTS);
        if args != nil && args.is_reference() {
            lines.push_str(" (");
            for i in 0..vm.memory.size_of(args) {
                if i > 0 {
                    lines.push_str(", ");
                }
                let arg_class = vm.class_of(vm.memory.field(args, i));
                lines.push_str(&vm.class_name(arg_class));
            }
            lines.push(')');
        }
        lines.push('\n');
        ctx = vm.memory.field(ctx, context::PREVIOUS_CONTEXT);
    }
    lines
}
