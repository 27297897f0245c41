//! The front-end API.
//!
//! A bytecode translator drives compilation through this interface:
//! declare the frame shape with [`Compiler::init`], announce logical
//! instructions with [`Compiler::start_logical_ip`] and jump targets with
//! [`Compiler::visit_logical_ip`], build operands and append operations,
//! then [`Compiler::compile`] and [`Compiler::write_to`]. Speculative
//! paths are recorded between [`Compiler::save_state`] and
//! [`Compiler::restore_state`].

use bumpalo::Bump;
use std::cell::Cell;

use crate::assembler::{
    Assembler, BinaryOperation, Client, OperandConstraint, TernaryOperation, TraceHandler,
    UnaryOperation,
};
use crate::core::context::{ArchInfo, Context, LogicalInstruction};
use crate::core::event::Link;
use crate::core::fork::ForkId;
use crate::core::frame::{Local, StackElem};
use crate::core::promise::PromiseId;
use crate::core::site::FrameIndex;
use crate::core::value::{ReadId, ValueId};
use crate::error::CompileResult;
use crate::{ceiling, pad, BYTES_PER_WORD};

/// Call flag: the call site must be aligned for atomic patching.
pub const CALL_ALIGNED: u32 = 1;

/// One outgoing call argument.
#[derive(Debug, Clone, Copy)]
pub struct Argument {
    pub value: ValueId,
    pub size: u32,
}

/// Read-only view of an operand-stack entry.
#[derive(Clone, Copy)]
pub struct StackElement<'a> {
    elem: &'a StackElem<'a>,
}

impl<'a> StackElement<'a> {
    pub fn size_words(&self) -> u32 {
        self.elem.size_words
    }

    pub fn padding_words(&self) -> u32 {
        self.elem.padding_words.get()
    }

    pub fn value(&self) -> ValueId {
        self.elem.value
    }
}

pub struct Compiler<'a, A: Assembler, C: Client> {
    pub(crate) ctx: Context<'a>,
    pub(crate) asm: A,
    pub(crate) client: C,
}

impl<'a, A: Assembler, C: Client> Compiler<'a, A, C> {
    pub fn new(arena: &'a Bump, asm: A, client: C) -> Compiler<'a, A, C> {
        let info = ArchInfo::new(asm.arch());
        Compiler {
            ctx: Context::new(arena, info),
            asm,
            client,
        }
    }

    /// Declares the compilation's shape: the number of logical
    /// instructions, the incoming parameter footprint, the local-variable
    /// footprint and the aligned frame size, all in words.
    pub fn init(
        &mut self,
        logical_code_length: u32,
        parameter_footprint: u32,
        local_footprint: u32,
        aligned_frame_size: u32,
    ) {
        self.ctx.init(
            logical_code_length,
            parameter_footprint,
            local_footprint,
            aligned_frame_size,
        );
    }

    // Fork points.

    /// Snapshots the compilation state; the front-end can later rewind
    /// here with [`Compiler::restore_state`] and take a different path.
    pub fn save_state(&mut self) -> ForkId {
        self.ctx.save_state()
    }

    pub fn restore_state(&mut self, state: ForkId) {
        self.ctx.restore_state(state);
    }

    // Logical instructions.

    /// Begins a new logical instruction. Every instruction index may be
    /// started exactly once.
    pub fn start_logical_ip(&mut self, logical_ip: u32) {
        debug_assert!((logical_ip as usize) < self.ctx.logical_code.len());
        debug_assert!(self.ctx.logical_code[logical_ip as usize].is_none());

        if let Some(current) = self.ctx.logical_ip {
            if self.ctx.instruction(current).last_event.is_none() {
                self.ctx.append_dummy();
            }
        }

        if let Some(p) = self.ctx.predecessor {
            let stack = self.ctx.stack;
            let locals = self.ctx.locals;
            self.ctx.event_mut(p).stack_after = stack;
            self.ctx.event_mut(p).locals_after = Some(locals);
        }

        self.ctx.logical_code[logical_ip as usize] = Some(LogicalInstruction {
            index: logical_ip,
            first_event: None,
            last_event: None,
            stack: self.ctx.stack,
            locals: self.ctx.locals,
            machine_offset_token: None,
            machine_offset: None,
        });
        self.ctx.logical_ip = Some(logical_ip);
    }

    /// Declares that control flow reaches the already-started instruction
    /// `logical_ip` from the current position, forming a junction edge.
    pub fn visit_logical_ip(&mut self, logical_ip: u32) {
        debug_assert!((logical_ip as usize) < self.ctx.logical_code.len());
        let Some(e) = self.ctx.instruction(logical_ip).first_event else {
            panic!("jump target {logical_ip} has no events");
        };

        if let Some(p) = self.ctx.predecessor {
            let stack = self.ctx.stack;
            let locals = self.ctx.locals;
            self.ctx.event_mut(p).stack_after = stack;
            self.ctx.event_mut(p).locals_after = Some(locals);

            let link = Link {
                predecessor: p,
                next_predecessor: self.ctx.event(e).predecessors,
                successor: e,
                next_successor: self.ctx.event(p).successors,
                fork_state: self.ctx.fork_state,
                junction_state: None,
            };
            let id = self.ctx.push_link(link);
            self.ctx.event_mut(e).predecessors = Some(id);
            self.ctx.event_mut(p).successors = Some(id);
            if let Some(last) = self.ctx.last_event {
                self.ctx.event_mut(last).visit_links.push(id);
            }

            log::trace!("junction edge into {}", logical_ip);
            self.ctx.populate_junction_reads(id);
        }

        self.ctx.fork_state = None;
    }

    // Promises.

    /// A promise for the machine address of a logical instruction.
    pub fn machine_ip(&mut self, logical_ip: u32) -> PromiseId {
        self.ctx.ip_promise(logical_ip)
    }

    /// A promise for the code address just past the current logical
    /// instruction's last event.
    pub fn machine_ip_here(&mut self) -> PromiseId {
        let Some(ip) = self.ctx.logical_ip else {
            panic!("no logical instruction started");
        };
        let Some(e) = self.ctx.instruction(ip).last_event else {
            panic!("current logical instruction has no events");
        };
        let promise = self.ctx.code_promise(None);
        self.ctx.event_mut(e).promises.push(promise);
        promise
    }

    /// An already-resolved promise, usable wherever a promise is taken.
    pub fn resolved_promise(&mut self, value: i64) -> PromiseId {
        self.ctx.resolved_promise(value)
    }

    /// Appends a constant-pool word; the promise resolves to the slot's
    /// address after layout.
    pub fn pool_append(&mut self, value: i64) -> PromiseId {
        let value = self.ctx.resolved_promise(value);
        self.pool_append_promise(value)
    }

    pub fn pool_append_promise(&mut self, value: PromiseId) -> PromiseId {
        self.ctx.pool_append_promise(value)
    }

    pub fn promise_resolved(&self, promise: PromiseId) -> bool {
        self.ctx.promise_resolved(promise)
    }

    pub fn promise_value(&self, promise: PromiseId) -> CompileResult<i64> {
        self.ctx.promise_value(promise)
    }

    // Operand constructors.

    pub fn constant(&mut self, value: i64) -> ValueId {
        let promise = self.ctx.resolved_promise(value);
        self.promise_constant(promise)
    }

    pub fn promise_constant(&mut self, value: PromiseId) -> ValueId {
        let site = self.ctx.constant_site(value);
        self.ctx.new_value_with(Some(site), None)
    }

    pub fn address(&mut self, address: PromiseId) -> ValueId {
        let site = self.ctx.address_site(address);
        self.ctx.new_value_with(Some(site), None)
    }

    /// A value computed from a base register, a displacement and an
    /// optional scaled index, materialised as a memory operand.
    pub fn memory(
        &mut self,
        base: ValueId,
        displacement: i32,
        index: Option<ValueId>,
        scale: u8,
    ) -> ValueId {
        let result = self.ctx.new_value();
        self.ctx
            .append_memory_event(base, displacement, index, scale, result);
        result
    }

    /// The stack-pointer register as an operand.
    pub fn stack(&mut self) -> ValueId {
        let register = self.ctx.arch.stack;
        let site = self.ctx.register_site(register, None);
        self.ctx.new_value_with(Some(site), Some(site))
    }

    /// The thread register as an operand.
    pub fn thread(&mut self) -> ValueId {
        let register = self.ctx.arch.thread;
        let site = self.ctx.register_site(register, None);
        self.ctx.new_value_with(Some(site), Some(site))
    }

    /// The top of the operand stack as a frame-slot memory operand.
    pub fn stack_top(&mut self) -> ValueId {
        let Some(top) = self.ctx.stack else {
            panic!("operand stack is empty");
        };
        let index = self
            .ctx
            .frame_index(top.index + self.ctx.local_footprint, top.size_words);
        let site = self.ctx.frame_site(index);
        self.ctx.new_value_with(Some(site), Some(site))
    }

    // Operand stack.

    fn stack_elem(&mut self, value: ValueId, size_words: u32) {
        let index = self
            .ctx
            .stack
            .map_or(0, |s| s.index + s.size_words);
        let elem = self.ctx.arena.alloc(StackElem {
            index,
            size_words,
            padding_words: Cell::new(0),
            value,
            next: self.ctx.stack,
        });
        self.ctx.stack = Some(elem);
    }

    fn push_raw(&mut self, size: u32, value: ValueId) {
        debug_assert!(ceiling(size, BYTES_PER_WORD) > 0);
        self.ctx.value_mut(value).local = true;
        self.stack_elem(value, ceiling(size, BYTES_PER_WORD));
    }

    /// Pushes a fresh, uninitialised value.
    pub fn push(&mut self, size: u32) {
        let value = self.ctx.new_value();
        self.stack_elem(value, ceiling(size, BYTES_PER_WORD));
    }

    /// Pushes `value`, buddying it first when it also lives in a local so
    /// both copies track the same sites.
    pub fn push_value(&mut self, size: u32, value: ValueId) {
        let value = self.maybe_buddy(value, size);
        self.push_raw(size, value);
    }

    pub fn pop(&mut self, size: u32) -> ValueId {
        let Some(top) = self.ctx.stack else {
            panic!("pop from an empty operand stack");
        };
        debug_assert_eq!(ceiling(size, BYTES_PER_WORD), top.size_words);
        self.ctx.stack = top.next;
        let value = top.value;
        self.ctx.value_mut(value).local = false;
        value
    }

    /// Accounts for a word an external party (the callee of the preceding
    /// call, typically) pushed: the value is parked at its frame slot.
    pub fn pushed(&mut self) {
        let value = self.ctx.new_value();
        let index = self
            .ctx
            .frame_index(self.ctx.stack.map_or(0, |s| s.index) + self.ctx.local_footprint, 1);
        self.ctx
            .append_frame_site_event(value, BYTES_PER_WORD, index);
        self.stack_elem(value, 1);
    }

    /// Accounts for a word an external party popped.
    pub fn popped(&mut self) {
        let Some(top) = self.ctx.stack else {
            panic!("popped on an empty operand stack");
        };
        self.ctx.stack = top.next;
    }

    pub fn top(&self) -> Option<StackElement<'a>> {
        self.ctx.stack.map(|elem| StackElement { elem })
    }

    /// The value `index` words down from the top of the stack.
    pub fn peek(&self, size: u32, index: u32) -> ValueId {
        let mut remaining = index as i64;
        let mut cursor = self.ctx.stack;
        while remaining > 0 {
            let Some(elem) = cursor else {
                panic!("peek past the bottom of the operand stack");
            };
            remaining -= elem.size_words as i64;
            cursor = elem.next;
        }
        let Some(elem) = cursor else {
            panic!("peek past the bottom of the operand stack");
        };
        debug_assert_eq!(elem.size_words, ceiling(size, BYTES_PER_WORD));
        elem.value
    }

    // Calls and returns.

    /// Calls `address`, passing `arguments` per the target's convention.
    /// The result value carries the return register(s) after the call.
    pub fn call(
        &mut self,
        address: ValueId,
        flags: u32,
        trace_handler: Option<Box<dyn TraceHandler>>,
        result_size: u32,
        arguments: &[Argument],
    ) -> ValueId {
        let old_stack = self.ctx.stack;
        for argument in arguments.iter().rev() {
            self.push_raw(argument.size, argument.value);
        }
        let argument_stack = self.ctx.stack;
        self.ctx.stack = old_stack;

        let result = self.ctx.new_value();
        self.ctx.append_call_event(
            address,
            flags,
            trace_handler,
            result,
            result_size,
            argument_stack,
            arguments.len() as u32,
            0,
        );
        result
    }

    /// Calls `address` with `argument_footprint` words of arguments
    /// already on the operand stack.
    pub fn stack_call(
        &mut self,
        address: ValueId,
        flags: u32,
        trace_handler: Option<Box<dyn TraceHandler>>,
        result_size: u32,
        argument_footprint: u32,
    ) -> ValueId {
        let result = self.ctx.new_value();
        let stack = self.ctx.stack;
        self.ctx.append_call_event(
            address,
            flags,
            trace_handler,
            result,
            result_size,
            stack,
            0,
            argument_footprint,
        );
        result
    }

    pub fn ret(&mut self, size: u32, value: Option<ValueId>) {
        self.ctx.append_return_event(size, value);
    }

    // Locals.

    pub fn init_local(&mut self, size: u32, index: u32) {
        debug_assert!(index < self.ctx.local_footprint);
        let value = self.ctx.new_value();
        let frame_index = self.ctx.frame_index_for_local(index, size);
        log::trace!("init local {:?} of size {} at {}", value, size, index);
        self.ctx.append_frame_site_event(value, size, frame_index);
        self.ctx.locals[index as usize].set(Local {
            value: Some(value),
            size_bytes: size,
        });
    }

    /// Re-initialises the locals array to the shape it has at the start
    /// of `logical_ip`, parking fresh values at the occupied slots.
    pub fn init_locals_from_logical_ip(&mut self, logical_ip: u32) {
        debug_assert!((logical_ip as usize) < self.ctx.logical_code.len());

        let footprint = self.ctx.local_footprint as usize;
        self.ctx.locals = self
            .ctx
            .arena
            .alloc_slice_fill_with(footprint, |_| Cell::new(Local::default()));

        let Some(e) = self.ctx.instruction(logical_ip).first_event else {
            panic!("jump target {logical_ip} has no events");
        };
        let template = self.ctx.event(e).locals_before;
        for i in 0..footprint {
            let local = template[i].get();
            if local.value.is_some() {
                self.init_local(local.size_bytes, i as u32);
            }
        }
    }

    /// Stores `src` into local `index`. The locals snapshot is copied
    /// first so earlier events keep their view; the stored value buddies
    /// its stack copy when it is also live on the operand stack.
    pub fn store_local(&mut self, size: u32, src: ValueId, index: u32) {
        debug_assert!(index < self.ctx.local_footprint);

        if let Some(old) = self.ctx.locals[index as usize].get().value {
            self.ctx.value_mut(old).local = false;
        }

        let arena = self.ctx.arena;
        let old = self.ctx.locals;
        self.ctx.locals = arena.alloc_slice_fill_with(old.len(), |i| Cell::new(old[i].get()));

        let value = self.maybe_buddy(src, size);
        self.ctx.value_mut(value).local = true;
        self.ctx.locals[index as usize].set(Local {
            value: Some(value),
            size_bytes: size,
        });
    }

    pub fn load_local(&mut self, size: u32, index: u32) -> ValueId {
        debug_assert!(index < self.ctx.local_footprint);
        let local = self.ctx.locals[index as usize].get();
        let Some(value) = local.value else {
            panic!("load of uninitialised local {index}");
        };
        debug_assert_eq!(pad(local.size_bytes), pad(size));
        value
    }

    fn maybe_buddy(&mut self, value: ValueId, size: u32) -> ValueId {
        if self.ctx.value(value).local {
            let buddy = self.ctx.new_value();
            self.ctx.append_buddy_event(value, buddy, size);
            buddy
        } else {
            value
        }
    }

    // Guards.

    /// Emits a bounds check of `index` against the length stored at
    /// `object + length_offset`, calling `handler` when out of bounds.
    pub fn check_bounds(&mut self, object: ValueId, length_offset: u32, index: ValueId, handler: i64) {
        self.ctx
            .append_bounds_check_event(object, length_offset, index, handler);
    }

    // Moves.

    pub fn store(&mut self, size: u32, src: ValueId, dst: ValueId) {
        self.append_move(BinaryOperation::Move, size, src, size, dst);
    }

    pub fn load(&mut self, size: u32, src: ValueId) -> ValueId {
        let dst = self.ctx.new_value();
        self.append_move(BinaryOperation::Move, size, src, size, dst);
        dst
    }

    /// Zero-extending load.
    pub fn loadz(&mut self, size: u32, src: ValueId) -> ValueId {
        let dst = self.ctx.new_value();
        self.append_move(BinaryOperation::MoveZ, size, src, size, dst);
        dst
    }

    /// Sign-extends a 32-bit value into a full word.
    pub fn load4_to_8(&mut self, src: ValueId) -> ValueId {
        let dst = self.ctx.new_value();
        self.append_move(BinaryOperation::Move, 4, src, 8, dst);
        dst
    }

    // Comparisons and branches.

    /// Three-way comparison of two 64-bit values, yielding -1, 0 or 1.
    pub fn lcmp(&mut self, a: ValueId, b: ValueId) -> ValueId {
        let result = self.ctx.new_value();
        self.append_combine(TernaryOperation::LongCompare, 8, a, 8, b, 8, result);
        result
    }

    pub fn cmp(&mut self, size: u32, a: ValueId, b: ValueId) {
        let plan = self
            .asm
            .arch()
            .plan_binary(BinaryOperation::Compare, size, size);
        assert!(!plan.thunk, "no thunk fallback for comparisons");
        let first_read = self.constrained_read(size, plan.src);
        let second_read = self.constrained_read(size, plan.dst);
        self.ctx
            .append_compare_event(size, a, b, first_read, second_read);
    }

    pub fn jl(&mut self, address: ValueId) {
        self.ctx
            .append_branch_event(UnaryOperation::JumpIfLess, address);
    }

    pub fn jg(&mut self, address: ValueId) {
        self.ctx
            .append_branch_event(UnaryOperation::JumpIfGreater, address);
    }

    pub fn jle(&mut self, address: ValueId) {
        self.ctx
            .append_branch_event(UnaryOperation::JumpIfLessOrEqual, address);
    }

    pub fn jge(&mut self, address: ValueId) {
        self.ctx
            .append_branch_event(UnaryOperation::JumpIfGreaterOrEqual, address);
    }

    pub fn je(&mut self, address: ValueId) {
        self.ctx
            .append_branch_event(UnaryOperation::JumpIfEqual, address);
    }

    pub fn jne(&mut self, address: ValueId) {
        self.ctx
            .append_branch_event(UnaryOperation::JumpIfNotEqual, address);
    }

    pub fn jmp(&mut self, address: ValueId) {
        self.ctx.append_branch_event(UnaryOperation::Jump, address);
    }

    // Arithmetic and logic.

    pub fn add(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::Add, size, a, b)
    }

    pub fn sub(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::Subtract, size, a, b)
    }

    pub fn mul(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::Multiply, size, a, b)
    }

    pub fn div(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::Divide, size, a, b)
    }

    pub fn rem(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::Remainder, size, a, b)
    }

    /// Shift left; `a` is the shift count, `b` the value.
    pub fn shl(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        let result = self.ctx.new_value();
        self.append_combine(
            TernaryOperation::ShiftLeft,
            BYTES_PER_WORD,
            a,
            size,
            b,
            size,
            result,
        );
        result
    }

    pub fn shr(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        let result = self.ctx.new_value();
        self.append_combine(
            TernaryOperation::ShiftRight,
            BYTES_PER_WORD,
            a,
            size,
            b,
            size,
            result,
        );
        result
    }

    pub fn ushr(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        let result = self.ctx.new_value();
        self.append_combine(
            TernaryOperation::UnsignedShiftRight,
            BYTES_PER_WORD,
            a,
            size,
            b,
            size,
            result,
        );
        result
    }

    pub fn and(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::And, size, a, b)
    }

    pub fn or(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::Or, size, a, b)
    }

    pub fn xor(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::Xor, size, a, b)
    }

    pub fn neg(&mut self, size: u32, a: ValueId) -> ValueId {
        let result = self.ctx.new_value();
        self.append_translate(BinaryOperation::Negate, size, a, result);
        result
    }

    fn combine(&mut self, op: TernaryOperation, size: u32, a: ValueId, b: ValueId) -> ValueId {
        let result = self.ctx.new_value();
        self.append_combine(op, size, a, size, b, size, result);
        result
    }

    // Append wrappers that consult the architecture's operand plans.

    fn constrained_read(&mut self, size: u32, constraint: OperandConstraint) -> ReadId {
        self.ctx.read_single(
            size,
            constraint.type_mask,
            constraint.register_mask,
            FrameIndex::Any,
        )
    }

    fn append_move(
        &mut self,
        op: BinaryOperation,
        src_size: u32,
        src: ValueId,
        dst_size: u32,
        dst: ValueId,
    ) {
        let plan = self.asm.arch().plan_binary(op, src_size, dst_size);
        assert!(!plan.thunk, "no thunk fallback for moves");
        let src_read = self.constrained_read(src_size, plan.src);
        let dst_read = self.constrained_read(dst_size, plan.dst);
        self.ctx
            .append_move_event(op, src_size, src, dst_size, dst, src_read, dst_read);
    }

    fn append_translate(&mut self, op: BinaryOperation, size: u32, value: ValueId, result: ValueId) {
        let plan = self.asm.arch().plan_binary(op, size, size);
        assert!(!plan.thunk, "no thunk fallback for unary operations");
        let result_read = self.constrained_read(size, plan.dst);
        let value_read = if self.ctx.arch.condensed_addressing {
            result_read
        } else {
            self.constrained_read(size, plan.src)
        };
        self.ctx
            .append_translate_event(op, size, value, result, value_read, result_read);
    }

    /// Appends a three-operand operation, or lowers it to a call of a
    /// runtime helper when the architecture cannot encode it.
    #[allow(clippy::too_many_arguments)]
    fn append_combine(
        &mut self,
        op: TernaryOperation,
        first_size: u32,
        first: ValueId,
        second_size: u32,
        second: ValueId,
        result_size: u32,
        result: ValueId,
    ) {
        let plan = self
            .asm
            .arch()
            .plan_ternary(op, first_size, second_size, result_size);

        if plan.thunk {
            let old_stack = self.ctx.stack;
            self.push_raw(second_size, second);
            self.push_raw(first_size, first);
            let argument_stack = self.ctx.stack;
            self.ctx.stack = old_stack;

            let thunk = self.client.get_thunk(op, result_size);
            let promise = self.ctx.resolved_promise(thunk);
            let site = self.ctx.constant_site(promise);
            let address = self.ctx.new_value_with(Some(site), None);
            self.ctx.append_call_event(
                address,
                0,
                None,
                result,
                result_size,
                argument_stack,
                2,
                0,
            );
        } else {
            let result_read = self.constrained_read(result_size, plan.result);
            let second_read = if self.ctx.arch.condensed_addressing {
                result_read
            } else {
                self.constrained_read(second_size, plan.second)
            };
            let first_read = self.constrained_read(first_size, plan.first);
            self.ctx.append_combine_event(
                op,
                first_size,
                first,
                second_size,
                second,
                result_size,
                result,
                first_read,
                second_read,
                result_read,
            );
        }
    }

    // Final assembly.

    /// The assembler this compiler drives.
    pub fn assembler(&self) -> &A {
        &self.asm
    }

    pub fn assembler_mut(&mut self) -> &mut A {
        &mut self.asm
    }

    /// Runs the compile pass and returns the machine-code size in bytes.
    pub fn compile(&mut self) -> CompileResult<u32> {
        self.run_compile_pass()
    }

    /// Size in bytes of the constant pool appended after the code.
    pub fn pool_size(&self) -> u32 {
        self.ctx.pool_word_count() * BYTES_PER_WORD
    }

    /// Writes the machine code followed by the word-aligned constant
    /// pool into `dst`, resolving all promises against its address.
    pub fn write_to(&mut self, dst: &mut [u8]) -> CompileResult<()> {
        self.ctx.machine_code = Some(dst.as_ptr() as u64);
        {
            let Self { ctx, asm, .. } = self;
            asm.write_to(dst, &*ctx);
        }

        let word = BYTES_PER_WORD as usize;
        let base = pad(self.ctx.machine_code_size) as usize;
        for i in 0..self.ctx.constants.len() {
            let value = self.ctx.promise_value(self.ctx.constants[i])?;
            let offset = base + i * word;
            dst[offset..offset + word].copy_from_slice(&value.to_le_bytes()[..word]);
        }
        Ok(())
    }
}
