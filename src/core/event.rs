//! Per-operation event nodes and their compile methods.
//!
//! The front-end appends one or more events per logical instruction. Each
//! event registers reads against its input values at append time (the
//! scan phase); the compile pass later walks the list in order, assigns
//! sites and calls the per-kind compile method, which drives the
//! assembler. Events form a graph: predecessor/successor links carry fork
//! and junction bookkeeping across control-flow edges.

use std::cell::Cell;

use crate::assembler::{
    Assembler, BinaryOperation, Client, OperandType, Operation, TernaryOperation, TraceHandler,
    TypeMask, UnaryOperation, ANY_REGISTER_MASK,
};
use crate::compiler::{Compiler, CALL_ALIGNED};
use crate::error::{CompileError, CompileResult};
use crate::{ceiling, BYTES_PER_WORD};

use super::context::{ConstantCompare, Context, Pass};
use super::fork::{ForkId, JunctionId};
use super::frame::{same_locals, same_stack, Locals, StackRef};
use super::site::{FrameIndex, SiteKind, SiteRecord};
use super::value::ValueId;

/// Handle to a pooled [`Event`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub(crate) u32);

impl std::fmt::Debug for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Handle to a pooled [`Link`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub(crate) u32);

impl std::fmt::Debug for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "l{}", self.0)
    }
}

/// Per-frame-slot site agreements, indexed like the frame walk. Each slot
/// holds the detached copies of the sites every path must agree on.
pub type SiteTable<'a> = &'a [Cell<Option<&'a [SiteRecord]>>];

/// A directed predecessor→successor edge.
#[derive(Debug)]
pub struct Link {
    pub predecessor: EventId,
    pub next_predecessor: Option<LinkId>,
    pub successor: EventId,
    pub next_successor: Option<LinkId>,
    /// Present when the edge was created by restoring a fork.
    pub fork_state: Option<ForkId>,
    /// Present on junction edges; resolves stub reads at the merge.
    pub junction_state: Option<JunctionId>,
}

pub enum EventKind {
    Call {
        address: ValueId,
        flags: u32,
        trace: Option<Box<dyn TraceHandler>>,
        result: ValueId,
        result_size: u32,
        /// Frame index below which stack-temporary sites die at the call.
        pop_index: u32,
    },
    Return {
        size: u32,
        value: Option<ValueId>,
    },
    Move {
        op: BinaryOperation,
        src_size: u32,
        src: ValueId,
        dst_size: u32,
        dst: ValueId,
        dst_read: super::value::ReadId,
    },
    Compare {
        size: u32,
        first: ValueId,
        second: ValueId,
    },
    Combine {
        op: TernaryOperation,
        first_size: u32,
        first: ValueId,
        second_size: u32,
        second: ValueId,
        result_size: u32,
        result: ValueId,
        result_read: super::value::ReadId,
    },
    Translate {
        op: BinaryOperation,
        size: u32,
        value: ValueId,
        result: ValueId,
        result_read: super::value::ReadId,
    },
    Memory {
        base: ValueId,
        displacement: i32,
        index: Option<ValueId>,
        scale: u8,
        result: ValueId,
    },
    Branch {
        op: UnaryOperation,
        address: ValueId,
    },
    BoundsCheck {
        object: ValueId,
        length_offset: u32,
        index: ValueId,
        handler: i64,
    },
    FrameSite {
        value: ValueId,
        size: u32,
        index: u32,
    },
    Buddy {
        original: ValueId,
        buddy: ValueId,
    },
    Dummy,
}

pub struct Event<'a> {
    pub kind: EventKind,
    pub name: &'static str,
    pub next: Option<EventId>,
    pub stack_before: StackRef<'a>,
    pub locals_before: Locals<'a>,
    pub stack_after: StackRef<'a>,
    pub locals_after: Option<Locals<'a>>,
    /// Code promises pinned to the offset just past this event's code.
    pub promises: Vec<super::promise::PromiseId>,
    pub reads: Option<super::value::ReadId>,
    pub read_count: u32,
    pub junction_sites: Option<SiteTable<'a>>,
    pub saved_sites: Option<SiteTable<'a>>,
    pub predecessors: Option<LinkId>,
    pub successors: Option<LinkId>,
    /// Junction edges to visit once this event has compiled.
    pub visit_links: Vec<LinkId>,
    pub block: Option<u32>,
    pub logical_instruction: u32,
    pub is_branch: bool,
}

impl<'a> Context<'a> {
    pub(crate) fn new_event(&mut self, name: &'static str, kind: EventKind) -> EventId {
        let Some(ip) = self.logical_ip else {
            panic!("event appended before any logical instruction was started");
        };
        let is_branch = matches!(kind, EventKind::Branch { .. });
        let id = EventId(self.events.len() as u32);
        self.events.push(Event {
            kind,
            name,
            next: None,
            stack_before: self.stack,
            locals_before: self.locals,
            stack_after: None,
            locals_after: None,
            promises: Vec::new(),
            reads: None,
            read_count: 0,
            junction_sites: None,
            saved_sites: None,
            predecessors: None,
            successors: None,
            visit_links: Vec::new(),
            block: None,
            logical_instruction: ip,
            is_branch,
        });
        id
    }

    /// Links a constructed event into the list and graph. Inserts a dummy
    /// first when the entry state no longer matches the instruction's
    /// snapshot, so jump targets always find the snapshot state.
    pub(crate) fn finish_append(&mut self, e: EventId) {
        debug_assert_eq!(self.pass, Pass::Scan);
        let ip = self.event(e).logical_instruction;
        let (inst_stack, inst_locals) = {
            let inst = self.instruction(ip);
            (inst.stack, inst.locals)
        };
        if !same_stack(self.stack, inst_stack) || !same_locals(self.locals, inst_locals) {
            self.append_dummy();
        }

        log::trace!(
            "append {} at {} with {} stack before",
            self.event(e).name,
            ip,
            self.event(e)
                .stack_before
                .map_or(0, |s| s.index + s.size_words)
        );

        match self.last_event {
            Some(last) => self.event_mut(last).next = Some(e),
            None => self.first_event = Some(e),
        }
        self.last_event = Some(e);

        if let Some(p) = self.predecessor {
            let link = Link {
                predecessor: p,
                next_predecessor: self.event(e).predecessors,
                successor: e,
                next_successor: self.event(p).successors,
                fork_state: self.fork_state,
                junction_state: None,
            };
            let id = self.push_link(link);
            self.event_mut(e).predecessors = Some(id);
            self.event_mut(p).successors = Some(id);
        }
        self.fork_state = None;
        self.predecessor = Some(e);

        if self.instruction(ip).first_event.is_none() {
            self.instruction_mut(ip).first_event = Some(e);
        }
        self.instruction_mut(ip).last_event = Some(e);
    }

    /// An event that carries a state snapshot without emitting code, used
    /// at stack/locals discontinuities.
    pub(crate) fn append_dummy(&mut self) {
        let Some(ip) = self.logical_ip else {
            return;
        };
        let saved_stack = self.stack;
        let saved_locals = self.locals;
        {
            let inst = self.instruction(ip);
            let (new_stack, new_locals) = (inst.stack, inst.locals);
            self.stack = new_stack;
            self.locals = new_locals;
        }
        let e = self.new_event("DummyEvent", EventKind::Dummy);
        self.finish_append(e);
        self.stack = saved_stack;
        self.locals = saved_locals;
    }

    pub(crate) fn count_predecessors(&self, mut link: Option<LinkId>) -> u32 {
        let mut n = 0;
        while let Some(l) = link {
            n += 1;
            link = self.link(l).next_predecessor;
        }
        n
    }

    pub(crate) fn last_predecessor(&self, mut link: LinkId) -> LinkId {
        while let Some(next) = self.link(link).next_predecessor {
            link = next;
        }
        link
    }

    pub(crate) fn count_successors(&self, mut link: Option<LinkId>) -> u32 {
        let mut n = 0;
        while let Some(l) = link {
            n += 1;
            link = self.link(l).next_successor;
        }
        n
    }

    // Event constructors. Each registers the event's reads at append time.

    pub(crate) fn append_move_event(
        &mut self,
        op: BinaryOperation,
        src_size: u32,
        src: ValueId,
        dst_size: u32,
        dst: ValueId,
        src_read: super::value::ReadId,
        dst_read: super::value::ReadId,
    ) {
        let e = self.new_event(
            "MoveEvent",
            EventKind::Move {
                op,
                src_size,
                src,
                dst_size,
                dst,
                dst_read,
            },
        );
        self.add_read(Some(e), src, src_read);
        self.finish_append(e);
    }

    pub(crate) fn append_compare_event(
        &mut self,
        size: u32,
        first: ValueId,
        second: ValueId,
        first_read: super::value::ReadId,
        second_read: super::value::ReadId,
    ) {
        let e = self.new_event("CompareEvent", EventKind::Compare { size, first, second });
        self.add_read(Some(e), first, first_read);
        self.add_read(Some(e), second, second_read);
        self.finish_append(e);
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn append_combine_event(
        &mut self,
        op: TernaryOperation,
        first_size: u32,
        first: ValueId,
        second_size: u32,
        second: ValueId,
        result_size: u32,
        result: ValueId,
        first_read: super::value::ReadId,
        second_read: super::value::ReadId,
        result_read: super::value::ReadId,
    ) {
        let e = self.new_event(
            "CombineEvent",
            EventKind::Combine {
                op,
                first_size,
                first,
                second_size,
                second,
                result_size,
                result,
                result_read,
            },
        );
        self.add_read(Some(e), first, first_read);
        self.add_read(Some(e), second, second_read);
        self.finish_append(e);
    }

    pub(crate) fn append_translate_event(
        &mut self,
        op: BinaryOperation,
        size: u32,
        value: ValueId,
        result: ValueId,
        value_read: super::value::ReadId,
        result_read: super::value::ReadId,
    ) {
        let e = self.new_event(
            "TranslateEvent",
            EventKind::Translate {
                op,
                size,
                value,
                result,
                result_read,
            },
        );
        self.add_read(Some(e), value, value_read);
        self.finish_append(e);
    }

    pub(crate) fn append_memory_event(
        &mut self,
        base: ValueId,
        displacement: i32,
        index: Option<ValueId>,
        scale: u8,
        result: ValueId,
    ) {
        let e = self.new_event(
            "MemoryEvent",
            EventKind::Memory {
                base,
                displacement,
                index,
                scale,
                result,
            },
        );
        let base_read = self.any_register_read(BYTES_PER_WORD);
        self.add_read(Some(e), base, base_read);
        if let Some(index) = index {
            let index_read = self.register_or_constant_read(BYTES_PER_WORD);
            self.add_read(Some(e), index, index_read);
        }
        self.finish_append(e);
    }

    pub(crate) fn append_branch_event(&mut self, op: UnaryOperation, address: ValueId) {
        let e = self.new_event("BranchEvent", EventKind::Branch { op, address });
        let read = self.read_single(
            BYTES_PER_WORD,
            TypeMask::ALL,
            ANY_REGISTER_MASK,
            FrameIndex::Any,
        );
        self.add_read(Some(e), address, read);
        self.finish_append(e);
    }

    pub(crate) fn append_bounds_check_event(
        &mut self,
        object: ValueId,
        length_offset: u32,
        index: ValueId,
        handler: i64,
    ) {
        let e = self.new_event(
            "BoundsCheckEvent",
            EventKind::BoundsCheck {
                object,
                length_offset,
                index,
                handler,
            },
        );
        let object_read = self.any_register_read(BYTES_PER_WORD);
        self.add_read(Some(e), object, object_read);
        let index_read = self.register_or_constant_read(BYTES_PER_WORD);
        self.add_read(Some(e), index, index_read);
        self.finish_append(e);
    }

    pub(crate) fn append_frame_site_event(&mut self, value: ValueId, size: u32, index: u32) {
        let e = self.new_event("FrameSiteEvent", EventKind::FrameSite { value, size, index });
        self.finish_append(e);
    }

    pub(crate) fn append_buddy_event(&mut self, original: ValueId, buddy: ValueId, size: u32) {
        let e = self.new_event("BuddyEvent", EventKind::Buddy { original, buddy });
        let read = self.read_single(size, TypeMask::ALL, ANY_REGISTER_MASK, FrameIndex::Any);
        self.add_read(Some(e), original, read);
        self.finish_append(e);
    }

    pub(crate) fn append_return_event(&mut self, size: u32, value: Option<ValueId>) {
        let e = self.new_event("ReturnEvent", EventKind::Return { size, value });
        if let Some(value) = value {
            let high = if size > BYTES_PER_WORD {
                Some(self.arch.return_high)
            } else {
                None
            };
            let low = self.arch.return_low;
            let read = self.fixed_register_read(size, low, high);
            self.add_read(Some(e), value, read);
        }
        self.finish_append(e);
    }

    /// Builds the call event's read set: outgoing arguments pinned to the
    /// argument registers or to frame slots beyond the consumed
    /// footprint, plus a memory read at the canonical save slot for every
    /// live stack temporary and local, which forces caller-saved values
    /// out to the frame before the call compiles.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn append_call_event(
        &mut self,
        address: ValueId,
        flags: u32,
        trace: Option<Box<dyn TraceHandler>>,
        result: ValueId,
        result_size: u32,
        argument_stack: StackRef<'a>,
        argument_count: u32,
        stack_argument_footprint: u32,
    ) {
        let e = self.new_event(
            "CallEvent",
            EventKind::Call {
                address,
                flags,
                trace,
                result,
                result_size,
                pop_index: 0,
            },
        );

        let mut mask: u32 = !0;
        let mut s = argument_stack;
        let mut index = 0u32;
        let mut frame_index = 0u32;
        for _ in 0..argument_count {
            let Some(elem) = s else {
                debug_assert!(false, "argument stack shorter than argument count");
                break;
            };
            let size_bytes = elem.size_words * BYTES_PER_WORD;
            let target = if (index as usize) < self.arch.argument_registers.len() {
                let r = self.arch.argument_registers[index as usize];
                mask &= !(1 << r);
                self.fixed_register_read(size_bytes, r, None)
            } else {
                let read = self.read_single(
                    size_bytes,
                    TypeMask::of(OperandType::Memory),
                    0,
                    FrameIndex::At(frame_index),
                );
                frame_index += elem.size_words;
                read
            };
            self.add_read(Some(e), elem.value, target);
            index += elem.size_words;
            s = elem.next;
        }

        let address_read = self.read_single(
            BYTES_PER_WORD,
            TypeMask::ALL,
            ((mask as u64) << 32) | mask as u64,
            FrameIndex::Any,
        );
        self.add_read(Some(e), address, address_read);

        let mut footprint = stack_argument_footprint as i64;
        let mut s = self.event(e).stack_before;
        let mut pop_index = 0u32;
        while let Some(elem) = s {
            if footprint > 0 {
                let read = self.read_single(
                    elem.size_words * BYTES_PER_WORD,
                    TypeMask::of(OperandType::Memory),
                    0,
                    FrameIndex::At(frame_index),
                );
                self.add_read(Some(e), elem.value, read);
            } else {
                let save_index =
                    self.frame_index(elem.index + self.local_footprint, elem.size_words);
                if footprint == 0 {
                    debug_assert!(save_index >= frame_index);
                    elem.padding_words.set(save_index - frame_index);
                    pop_index = save_index;
                }
                let read = self.read_single(
                    elem.size_words * BYTES_PER_WORD,
                    TypeMask::of(OperandType::Memory),
                    0,
                    FrameIndex::At(save_index),
                );
                self.add_read(Some(e), elem.value, read);
            }
            frame_index += elem.size_words;
            footprint -= elem.size_words as i64;
            s = elem.next;
        }

        for li in 0..self.local_footprint {
            let local = self.event(e).locals_before[li as usize].get();
            if let Some(value) = local.value {
                let save_index = self.frame_index(li, ceiling(local.size_bytes, BYTES_PER_WORD));
                let read = self.read_single(
                    local.size_bytes,
                    TypeMask::of(OperandType::Memory),
                    0,
                    FrameIndex::At(save_index),
                );
                self.add_read(Some(e), value, read);
            }
        }

        if let EventKind::Call { pop_index: slot, .. } = &mut self.event_mut(e).kind {
            *slot = pop_index;
        }
        self.finish_append(e);
    }

    /// Drops every site that does not survive a call: only frame slots at
    /// or above `pop_index` stay, so live values reload from their
    /// canonical save slots afterwards. Then retires the call's reads.
    pub(crate) fn clean_after_call(
        &mut self,
        e: EventId,
        stack: StackRef<'a>,
        locals: Locals<'a>,
        pop_index: u32,
    ) {
        let elements: Vec<_> = self.frame_iter(stack, locals).collect();
        for el in elements {
            self.clean_value(el.value, pop_index);
        }

        let mut cursor = self.event(e).reads;
        while let Some(r) = cursor {
            let next = self.read(r).event_next;
            if let Some(v) = self.read(r).value {
                self.next_read(Some(e), v);
            }
            cursor = next;
        }
    }

    fn clean_value(&mut self, v: ValueId, pop_index: u32) {
        let stack_register = self.arch.stack;
        let mut prev: Option<super::site::SiteId> = None;
        let mut cursor = self.value(v).sites;
        while let Some(s) = cursor {
            let next = self.site(s).next;
            let survives = match self.site(s).kind {
                SiteKind::Memory { base, offset, .. } if base == stack_register => {
                    self.offset_to_frame_index(offset as u32) >= pop_index
                }
                _ => false,
            };
            if survives {
                prev = Some(s);
            } else {
                self.site_release(s);
                match prev {
                    Some(p) => self.site_mut(p).next = next,
                    None => self.value_mut(v).sites = next,
                }
            }
            cursor = next;
        }
    }
}

impl<'a, A: Assembler, C: Client> Compiler<'a, A, C> {
    /// Dispatches an event's compile method. The kind is taken out of the
    /// pool node; after compilation only the graph bookkeeping on the
    /// event is consulted again.
    pub(crate) fn compile_event(&mut self, e: EventId) -> CompileResult<()> {
        let kind = std::mem::replace(&mut self.ctx.event_mut(e).kind, EventKind::Dummy);
        let is_compare = matches!(kind, EventKind::Compare { .. });
        match kind {
            EventKind::Call {
                address,
                flags,
                trace,
                result,
                result_size,
                pop_index,
            } => self.compile_call(e, address, flags, trace, result, result_size, pop_index)?,
            EventKind::Return { value, .. } => self.compile_return(e, value)?,
            EventKind::Move {
                op,
                src_size,
                src,
                dst_size,
                dst,
                dst_read,
            } => self.compile_move(e, op, src_size, src, dst_size, dst, dst_read)?,
            EventKind::Compare { size, first, second } => {
                self.compile_compare(e, size, first, second)?
            }
            EventKind::Combine {
                op,
                first_size,
                first,
                second_size,
                second,
                result_size,
                result,
                result_read,
            } => self.compile_combine(
                e,
                op,
                first_size,
                first,
                second_size,
                second,
                result_size,
                result,
                result_read,
            )?,
            EventKind::Translate {
                op,
                size,
                value,
                result,
                result_read,
            } => self.compile_translate(e, op, size, value, result, result_read)?,
            EventKind::Memory {
                base,
                displacement,
                index,
                scale,
                result,
            } => self.compile_memory(e, base, displacement, index, scale, result)?,
            EventKind::Branch { op, address } => self.compile_branch(e, op, address)?,
            EventKind::BoundsCheck {
                object,
                length_offset,
                index,
                handler,
            } => self.compile_bounds_check(e, object, length_offset, index, handler)?,
            EventKind::FrameSite { value, size, index } => {
                self.compile_frame_site(e, value, size, index)?
            }
            EventKind::Buddy { original, buddy } => self.compile_buddy(e, original, buddy),
            EventKind::Dummy => {}
        }
        if !is_compare {
            self.ctx.constant_compare = ConstantCompare::None;
        }
        Ok(())
    }

    fn source_of(&self, v: ValueId) -> CompileResult<super::site::SiteId> {
        self.ctx
            .value(v)
            .source
            .ok_or(CompileError::Inconsistent("operand source was not selected"))
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_call(
        &mut self,
        e: EventId,
        address: ValueId,
        flags: u32,
        trace: Option<Box<dyn TraceHandler>>,
        result: ValueId,
        result_size: u32,
        pop_index: u32,
    ) -> CompileResult<()> {
        let op = if flags & CALL_ALIGNED != 0 {
            UnaryOperation::AlignedCall
        } else {
            UnaryOperation::Call
        };
        let address_source = self.source_of(address)?;
        self.apply_unary_sites(op, BYTES_PER_WORD, address_source)?;

        if let Some(mut trace) = trace {
            let token = self.asm.offset();
            let promise = self.ctx.code_promise(Some(token));
            trace.handle_trace(promise);
        }

        let stack = self.ctx.event(e).stack_before;
        let locals = self.ctx.event(e).locals_before;
        self.ctx.clean_after_call(e, stack, locals, pop_index);

        if result_size > 0 && self.ctx.live(result) {
            let high = if result_size > BYTES_PER_WORD {
                Some(self.ctx.arch.return_high)
            } else {
                None
            };
            let low = self.ctx.arch.return_low;
            let site = self.ctx.register_site(low, high);
            self.add_site(None, &[], result_size, result, site)?;
        }
        Ok(())
    }

    fn compile_return(&mut self, e: EventId, value: Option<ValueId>) -> CompileResult<()> {
        if let Some(value) = value {
            self.ctx.next_read(Some(e), value);
        }
        self.asm.pop_frame();
        self.asm.apply_op(Operation::Return);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_move(
        &mut self,
        e: EventId,
        op: BinaryOperation,
        src_size: u32,
        src: ValueId,
        dst_size: u32,
        dst: ValueId,
        dst_read: super::value::ReadId,
    ) -> CompileResult<()> {
        let stack = self.ctx.event(e).stack_before;
        let locals = self.ctx.event(e).locals_before;
        let is_store = !self.ctx.live(dst);

        let mut target = self.ctx.target_or_register(dst);
        let source = self.source_of(src)?;
        let cost = self.ctx.site_copy_cost(source, Some(target));
        if cost == 0 {
            target = source;
        }

        if target == source {
            self.maybe_preserve(stack, locals, src_size, src, target)?;
            self.ctx.remove_site(src, target);
        }

        if !is_store {
            self.add_site(stack, locals, dst_size, dst, target)?;
        }

        if cost != 0 || op != BinaryOperation::Move {
            let (tm, rm, fi) = self.ctx.read_constraints(dst_read);
            let memory_to_memory = self.ctx.site_operand_type(target) == OperandType::Memory
                && self.ctx.site_operand_type(source) == OperandType::Memory;

            if self.ctx.site_matches(target, tm, rm, fi) && !memory_to_memory {
                self.apply_binary_sites(op, src_size, source, dst_size, target)?;
            } else {
                debug_assert!(tm.contains(OperandType::Register));
                let tmp = self.ctx.free_register_site(rm);
                self.add_site(stack, locals, dst_size, dst, tmp)?;
                self.apply_binary_sites(op, src_size, source, dst_size, tmp)?;

                if is_store {
                    self.ctx.remove_site(dst, tmp);
                }
                if memory_to_memory || is_store {
                    self.apply_binary_sites(
                        BinaryOperation::Move,
                        dst_size,
                        tmp,
                        dst_size,
                        target,
                    )?;
                } else {
                    self.ctx.remove_site(dst, target);
                }
            }
        }

        if is_store {
            self.ctx.remove_site(dst, target);
        }

        self.ctx.next_read(Some(e), src);
        Ok(())
    }

    fn compile_compare(
        &mut self,
        e: EventId,
        size: u32,
        first: ValueId,
        second: ValueId,
    ) -> CompileResult<()> {
        let first_constant = self.ctx.find_constant_site(first);
        let second_constant = self.ctx.find_constant_site(second);

        if let (Some((_, fp)), Some((_, sp))) = (first_constant, second_constant) {
            let d = self.ctx.promise_value(fp)? - self.ctx.promise_value(sp)?;
            self.ctx.constant_compare = match d.cmp(&0) {
                std::cmp::Ordering::Less => ConstantCompare::Less,
                std::cmp::Ordering::Greater => ConstantCompare::Greater,
                std::cmp::Ordering::Equal => ConstantCompare::Equal,
            };
        } else {
            self.ctx.constant_compare = ConstantCompare::None;
            let first_source = self.source_of(first)?;
            let second_source = self.source_of(second)?;
            self.apply_binary_sites(
                BinaryOperation::Compare,
                size,
                first_source,
                size,
                second_source,
            )?;
        }

        self.ctx.next_read(Some(e), first);
        self.ctx.next_read(Some(e), second);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_combine(
        &mut self,
        e: EventId,
        op: TernaryOperation,
        first_size: u32,
        first: ValueId,
        second_size: u32,
        second: ValueId,
        result_size: u32,
        result: ValueId,
        result_read: super::value::ReadId,
    ) -> CompileResult<()> {
        let stack = self.ctx.event(e).stack_before;
        let locals = self.ctx.event(e).locals_before;

        let target = if self.ctx.arch.condensed_addressing {
            let second_source = self.source_of(second)?;
            self.maybe_preserve(stack, locals, second_size, second, second_source)?;
            self.ctx.remove_site(second, second_source);
            second_source
        } else {
            let target = self
                .ctx
                .read_allocate_site(result_read)
                .ok_or(CompileError::RegisterAllocation { mask: 0 })?;
            self.add_site(stack, locals, result_size, result, target)?;
            target
        };

        let first_source = self.source_of(first)?;
        let second_source = self.source_of(second)?;
        self.apply_ternary_sites(
            op,
            first_size,
            first_source,
            second_size,
            second_source,
            result_size,
            target,
        )?;

        self.ctx.next_read(Some(e), first);
        self.ctx.next_read(Some(e), second);

        if self.ctx.arch.condensed_addressing && self.ctx.live(result) {
            self.add_site(None, &[], result_size, result, target)?;
        }
        Ok(())
    }

    fn compile_translate(
        &mut self,
        e: EventId,
        op: BinaryOperation,
        size: u32,
        value: ValueId,
        result: ValueId,
        result_read: super::value::ReadId,
    ) -> CompileResult<()> {
        let stack = self.ctx.event(e).stack_before;
        let locals = self.ctx.event(e).locals_before;

        let target = if self.ctx.arch.condensed_addressing {
            let source = self.source_of(value)?;
            self.maybe_preserve(stack, locals, size, value, source)?;
            self.ctx.remove_site(value, source);
            source
        } else {
            let target = self
                .ctx
                .read_allocate_site(result_read)
                .ok_or(CompileError::RegisterAllocation { mask: 0 })?;
            self.add_site(stack, locals, size, result, target)?;
            target
        };

        let source = self.source_of(value)?;
        self.apply_binary_sites(op, size, source, size, target)?;
        self.ctx.next_read(Some(e), value);

        if self.ctx.arch.condensed_addressing && self.ctx.live(result) {
            self.add_site(None, &[], size, result, target)?;
        }
        Ok(())
    }

    fn compile_memory(
        &mut self,
        e: EventId,
        base: ValueId,
        displacement: i32,
        index: Option<ValueId>,
        scale: u8,
        result: ValueId,
    ) -> CompileResult<()> {
        let mut displacement = displacement;
        let mut scale = scale;
        let mut index_register = None;

        if let Some(index) = index {
            if let Some((_, p)) = self.ctx.find_constant_site(index) {
                displacement += (self.ctx.promise_value(p)? * scale as i64) as i32;
                scale = 1;
            } else {
                let source = self.source_of(index)?;
                match self.ctx.site(source).kind {
                    SiteKind::Register { low: Some(low), .. } => index_register = Some(low),
                    _ => {
                        return Err(CompileError::Inconsistent(
                            "memory index operand not in a register",
                        ))
                    }
                }
            }
        }

        let base_source = self.source_of(base)?;
        let base_register = match self.ctx.site(base_source).kind {
            SiteKind::Register { low: Some(low), .. } => low,
            _ => {
                return Err(CompileError::Inconsistent(
                    "memory base operand not in a register",
                ))
            }
        };

        self.ctx.next_read(Some(e), base);
        if let Some(index) = index {
            if BYTES_PER_WORD == 8 && index_register.is_some() {
                // The index arrives as a 32-bit value; widen it before use.
                let source = self.source_of(index)?;
                self.apply_binary_sites(BinaryOperation::Move, 4, source, 8, source)?;
            }
            self.ctx.next_read(Some(e), index);
        }

        let site = self
            .ctx
            .memory_site(base_register, displacement, index_register, scale);
        self.ctx.value_mut(result).target = Some(site);
        self.add_site(None, &[], 0, result, site)?;
        Ok(())
    }

    fn compile_branch(
        &mut self,
        e: EventId,
        op: UnaryOperation,
        address: ValueId,
    ) -> CompileResult<()> {
        use UnaryOperation::*;

        let mut op = op;
        let jump = if op == Jump {
            true
        } else {
            match self.ctx.constant_compare {
                ConstantCompare::Less => match op {
                    JumpIfLess | JumpIfLessOrEqual | JumpIfNotEqual => {
                        op = Jump;
                        true
                    }
                    _ => false,
                },
                ConstantCompare::Greater => match op {
                    JumpIfGreater | JumpIfGreaterOrEqual | JumpIfNotEqual => {
                        op = Jump;
                        true
                    }
                    _ => false,
                },
                ConstantCompare::Equal => match op {
                    JumpIfEqual | JumpIfLessOrEqual | JumpIfGreaterOrEqual => {
                        op = Jump;
                        true
                    }
                    _ => false,
                },
                ConstantCompare::None => true,
            }
        };

        if jump {
            let source = self.source_of(address)?;
            self.apply_unary_sites(op, BYTES_PER_WORD, source)?;
        }
        self.ctx.next_read(Some(e), address);
        Ok(())
    }

    fn compile_bounds_check(
        &mut self,
        e: EventId,
        object: ValueId,
        length_offset: u32,
        index: ValueId,
        handler: i64,
    ) -> CompileResult<()> {
        let constant = self.ctx.find_constant_site(index);
        let next_promise = self.ctx.code_promise(None);
        let mut out_of_bounds = None;

        match constant {
            Some((_, p)) => {
                if self.ctx.promise_value(p)? < 0 {
                    return Err(CompileError::Inconsistent(
                        "bounds check with a negative constant index",
                    ));
                }
            }
            None => {
                let oob = self.ctx.code_promise(None);
                out_of_bounds = Some(oob);

                let zero_promise = self.ctx.resolved_promise(0);
                let zero = self.ctx.constant_site(zero_promise);
                let index_source = self.source_of(index)?;
                self.apply_binary_sites(BinaryOperation::Compare, 4, zero, 4, index_source)?;
                self.apply_unary_operand(
                    UnaryOperation::JumpIfLess,
                    BYTES_PER_WORD,
                    crate::assembler::AsmOperand::Constant(oob),
                )?;
            }
        }

        let object_source = self.source_of(object)?;
        let base = match self.ctx.site(object_source).kind {
            SiteKind::Register { low: Some(low), .. } => low,
            _ => {
                return Err(CompileError::Inconsistent(
                    "bounds-check object not in a register",
                ))
            }
        };

        let length = self.ctx.memory_site(base, length_offset as i32, None, 1);
        self.ctx.increment_register(base);

        let index_source = self.source_of(index)?;
        self.apply_binary_sites(BinaryOperation::Compare, 4, index_source, 4, length)?;

        self.ctx.decrement_register(base);

        self.apply_unary_operand(
            UnaryOperation::JumpIfGreater,
            BYTES_PER_WORD,
            crate::assembler::AsmOperand::Constant(next_promise),
        )?;

        if let Some(oob) = out_of_bounds {
            let token = self.asm.offset();
            self.ctx.promise_set_token(oob, token);
        }

        let handler_promise = self.ctx.resolved_promise(handler);
        self.apply_unary_operand(
            UnaryOperation::Call,
            BYTES_PER_WORD,
            crate::assembler::AsmOperand::Constant(handler_promise),
        )?;

        let token = self.asm.offset();
        self.ctx.promise_set_token(next_promise, token);

        self.ctx.next_read(Some(e), object);
        self.ctx.next_read(Some(e), index);
        Ok(())
    }

    fn compile_frame_site(
        &mut self,
        e: EventId,
        value: ValueId,
        size: u32,
        index: u32,
    ) -> CompileResult<()> {
        let stack = self.ctx.event(e).stack_before;
        let locals = self.ctx.event(e).locals_before;
        let site = self.ctx.frame_site(index);
        self.add_site(stack, locals, size, value, site)
    }

    fn compile_buddy(&mut self, e: EventId, original: ValueId, buddy: ValueId) {
        self.ctx.value_mut(buddy).buddy = original;
        let mut p = original;
        while self.ctx.value(p).buddy != original {
            p = self.ctx.value(p).buddy;
        }
        self.ctx.value_mut(p).buddy = buddy;
        log::trace!("buddies {:?} ~ {:?}", original, buddy);

        self.ctx.next_read(Some(e), original);
    }
}
