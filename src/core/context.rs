//! The compilation context.
//!
//! One `Context` owns everything a single compilation touches: the node
//! pools (values, sites, reads, events, links, promises, fork and junction
//! states), the register and frame-slot resource tables, the current
//! stack/locals/predecessor cursor the front-end mutates while appending,
//! and the frame geometry. Pools are `Vec`-backed and addressed by `u32`
//! newtype ids; snapshot-shaped allocations (locals arrays, stack
//! elements, site tables) live in the borrowed arena. Nothing is freed
//! individually - the compilation is dropped as a whole.

use bumpalo::Bump;
use smallvec::SmallVec;
use std::cell::Cell;

use crate::assembler::{Architecture, OffsetToken, PromiseResolver};
use crate::error::{CompileError, CompileResult};
use crate::{ceiling, pad, BYTES_PER_WORD};

use super::event::{Event, EventId, Link, LinkId};
use super::fork::{ForkId, ForkState, JunctionId, JunctionState};
use super::frame::{stack_footprint, FrameIter, Local, Locals, StackRef};
use super::promise::{Promise, PromiseId};
use super::site::{Site, SiteId};
use super::value::{Read, ReadId, Value, ValueId};

/// Target facts copied out of the [`Architecture`] at construction so the
/// context can answer geometry questions without holding the trait object.
#[derive(Debug, Clone)]
pub struct ArchInfo {
    pub register_count: u32,
    pub stack: u8,
    pub thread: u8,
    pub argument_registers: SmallVec<[u8; 6]>,
    pub return_low: u8,
    pub return_high: u8,
    pub frame_header_size: u32,
    pub frame_footer_size: u32,
    pub condensed_addressing: bool,
    pub reserved: u64,
}

impl ArchInfo {
    pub fn new(arch: &dyn Architecture) -> ArchInfo {
        let mut argument_registers = SmallVec::new();
        for i in 0..arch.argument_register_count() {
            argument_registers.push(arch.argument_register(i));
        }
        let mut reserved = 0u64;
        for r in 0..arch.register_count() {
            if arch.reserved(r as u8) {
                reserved |= 1 << r;
            }
        }
        ArchInfo {
            register_count: arch.register_count(),
            stack: arch.stack(),
            thread: arch.thread(),
            argument_registers,
            return_low: arch.return_low(),
            return_high: arch.return_high(),
            frame_header_size: arch.frame_header_size(),
            frame_footer_size: arch.frame_footer_size(),
            condensed_addressing: arch.condensed_addressing(),
            reserved,
        }
    }

    pub fn is_reserved(&self, register: u8) -> bool {
        self.reserved & (1 << register) != 0
    }
}

/// Per-physical-register occupancy.
#[derive(Debug, Default)]
pub struct RegisterResource {
    pub value: Option<ValueId>,
    pub site: Option<SiteId>,
    pub size: u32,
    /// Uses as base or index of a live memory site.
    pub ref_count: u32,
    /// Eviction-blocked while positive.
    pub freeze_count: u32,
    pub reserved: bool,
}

/// Per-word frame-slot occupancy.
#[derive(Debug, Default)]
pub struct FrameResource {
    pub value: Option<ValueId>,
    pub site: Option<SiteId>,
    pub size: u32,
}

/// One front-end operation's worth of events.
#[derive(Debug)]
pub struct LogicalInstruction<'a> {
    pub index: u32,
    pub first_event: Option<EventId>,
    pub last_event: Option<EventId>,
    pub stack: StackRef<'a>,
    pub locals: Locals<'a>,
    pub machine_offset_token: Option<OffsetToken>,
    pub machine_offset: Option<u32>,
}

/// Outcome of the latest constant-folded compare, consumed by the next
/// branch. A single field suffices because compare and branch are always
/// adjacent within one logical instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantCompare {
    None,
    Less,
    Greater,
    Equal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pass {
    Scan,
    Compile,
}

pub struct Context<'a> {
    pub(crate) arena: &'a Bump,
    pub(crate) arch: ArchInfo,

    pub(crate) values: Vec<Value>,
    pub(crate) sites: Vec<Site>,
    pub(crate) reads: Vec<Read>,
    pub(crate) events: Vec<Event<'a>>,
    pub(crate) links: Vec<Link>,
    pub(crate) promises: Vec<Promise>,
    pub(crate) forks: Vec<ForkState<'a>>,
    pub(crate) junctions: Vec<JunctionState>,

    pub(crate) registers: Vec<RegisterResource>,
    pub(crate) frame_resources: Vec<FrameResource>,
    pub(crate) logical_code: Vec<Option<LogicalInstruction<'a>>>,
    /// Value promises appended to the constant pool, in slot order.
    pub(crate) constants: Vec<PromiseId>,

    pub(crate) stack: StackRef<'a>,
    pub(crate) locals: Locals<'a>,
    pub(crate) predecessor: Option<EventId>,
    pub(crate) first_event: Option<EventId>,
    pub(crate) last_event: Option<EventId>,
    pub(crate) fork_state: Option<ForkId>,
    pub(crate) logical_ip: Option<u32>,

    pub(crate) parameter_footprint: u32,
    pub(crate) local_footprint: u32,
    pub(crate) aligned_frame_size: u32,
    pub(crate) machine_code_size: u32,
    /// Base address of the written machine code; promises resolve once
    /// this is known.
    pub(crate) machine_code: Option<u64>,
    pub(crate) available_register_count: u32,
    pub(crate) constant_compare: ConstantCompare,
    pub(crate) pass: Pass,
}

impl<'a> Context<'a> {
    pub fn new(arena: &'a Bump, arch: ArchInfo) -> Context<'a> {
        let mut registers = Vec::with_capacity(arch.register_count as usize);
        let mut available = arch.register_count;
        for r in 0..arch.register_count {
            let reserved = arch.is_reserved(r as u8);
            if reserved {
                available -= 1;
            }
            registers.push(RegisterResource {
                reserved,
                ..RegisterResource::default()
            });
        }
        Context {
            arena,
            arch,
            values: Vec::new(),
            sites: Vec::new(),
            reads: Vec::new(),
            events: Vec::new(),
            links: Vec::new(),
            promises: Vec::new(),
            forks: Vec::new(),
            junctions: Vec::new(),
            registers,
            frame_resources: Vec::new(),
            logical_code: Vec::new(),
            constants: Vec::new(),
            stack: None,
            locals: &[],
            predecessor: None,
            first_event: None,
            last_event: None,
            fork_state: None,
            logical_ip: None,
            parameter_footprint: 0,
            local_footprint: 0,
            aligned_frame_size: 0,
            machine_code_size: 0,
            machine_code: None,
            available_register_count: available,
            constant_compare: ConstantCompare::None,
            pass: Pass::Scan,
        }
    }

    pub(crate) fn init(
        &mut self,
        logical_code_length: u32,
        parameter_footprint: u32,
        local_footprint: u32,
        aligned_frame_size: u32,
    ) {
        self.parameter_footprint = parameter_footprint;
        self.local_footprint = local_footprint;
        self.aligned_frame_size = aligned_frame_size;

        let slots = (aligned_frame_size + parameter_footprint) as usize;
        self.frame_resources = Vec::with_capacity(slots);
        self.frame_resources
            .resize_with(slots, FrameResource::default);

        self.logical_code = Vec::with_capacity(logical_code_length as usize);
        self.logical_code
            .resize_with(logical_code_length as usize, || None);

        self.locals = self
            .arena
            .alloc_slice_fill_with(local_footprint as usize, |_| Cell::new(Local::default()));
    }

    // Pool accessors.

    pub(crate) fn value(&self, v: ValueId) -> &Value {
        &self.values[v.0 as usize]
    }

    pub(crate) fn value_mut(&mut self, v: ValueId) -> &mut Value {
        &mut self.values[v.0 as usize]
    }

    pub(crate) fn site(&self, s: SiteId) -> &Site {
        &self.sites[s.0 as usize]
    }

    pub(crate) fn site_mut(&mut self, s: SiteId) -> &mut Site {
        &mut self.sites[s.0 as usize]
    }

    pub(crate) fn read(&self, r: ReadId) -> &Read {
        &self.reads[r.0 as usize]
    }

    pub(crate) fn read_mut(&mut self, r: ReadId) -> &mut Read {
        &mut self.reads[r.0 as usize]
    }

    pub(crate) fn event(&self, e: EventId) -> &Event<'a> {
        &self.events[e.0 as usize]
    }

    pub(crate) fn event_mut(&mut self, e: EventId) -> &mut Event<'a> {
        &mut self.events[e.0 as usize]
    }

    pub(crate) fn link(&self, l: LinkId) -> &Link {
        &self.links[l.0 as usize]
    }

    pub(crate) fn link_mut(&mut self, l: LinkId) -> &mut Link {
        &mut self.links[l.0 as usize]
    }

    pub(crate) fn fork(&self, f: ForkId) -> &ForkState<'a> {
        &self.forks[f.0 as usize]
    }

    pub(crate) fn junction(&self, j: JunctionId) -> &JunctionState {
        &self.junctions[j.0 as usize]
    }

    pub(crate) fn instruction(&self, ip: u32) -> &LogicalInstruction<'a> {
        self.logical_code[ip as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("logical instruction {ip} was never started"))
    }

    pub(crate) fn instruction_mut(&mut self, ip: u32) -> &mut LogicalInstruction<'a> {
        self.logical_code[ip as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("logical instruction {ip} was never started"))
    }

    /// The next started logical instruction after `ip`, in index order.
    pub(crate) fn next_instruction(&self, ip: u32) -> Option<u32> {
        ((ip + 1)..self.logical_code.len() as u32)
            .find(|&n| self.logical_code[n as usize].is_some())
    }

    // Frame geometry.

    /// Table index of the frame slot backing `index` (a local number, or
    /// `stack index + local footprint` for operand-stack entries).
    pub(crate) fn frame_index(&self, index: u32, size_in_words: u32) -> u32 {
        self.aligned_frame_size + self.parameter_footprint - index - size_in_words
    }

    pub(crate) fn frame_index_for_local(&self, index: u32, size_bytes: u32) -> u32 {
        self.frame_index(index, ceiling(size_bytes, BYTES_PER_WORD))
    }

    /// Byte offset from the stack register for a frame index. Parameter
    /// slots sit beyond the frame header.
    pub(crate) fn frame_index_to_offset(&self, frame_index: u32) -> u32 {
        let words = if frame_index >= self.aligned_frame_size {
            frame_index + self.arch.frame_footer_size * 2 + self.arch.frame_header_size
        } else {
            frame_index + self.arch.frame_footer_size
        };
        words * BYTES_PER_WORD
    }

    pub(crate) fn offset_to_frame_index(&self, offset: u32) -> u32 {
        let normalized = offset / BYTES_PER_WORD;
        if normalized >= self.aligned_frame_size + self.arch.frame_footer_size {
            normalized - self.arch.frame_footer_size * 2 - self.arch.frame_header_size
        } else {
            normalized - self.arch.frame_footer_size
        }
    }

    /// Frame slots spanned by locals plus an operand-stack snapshot.
    pub(crate) fn frame_footprint(&self, stack: StackRef<'a>) -> u32 {
        self.local_footprint + stack_footprint(stack)
    }

    pub(crate) fn frame_iter(&self, stack: StackRef<'a>, locals: Locals<'a>) -> FrameIter<'a> {
        FrameIter::new(stack, locals, self.local_footprint, BYTES_PER_WORD)
    }

    // Register resource bookkeeping that never emits code.

    pub(crate) fn freeze_register(&mut self, register: u8) {
        debug_assert!(self.available_register_count > 0);
        let r = &mut self.registers[register as usize];
        log::trace!("freeze {} to {}", register, r.freeze_count + 1);
        r.freeze_count += 1;
        self.available_register_count -= 1;
    }

    pub(crate) fn thaw_register(&mut self, register: u8) {
        let r = &mut self.registers[register as usize];
        debug_assert!(r.freeze_count > 0);
        log::trace!("thaw {} to {}", register, r.freeze_count - 1);
        r.freeze_count -= 1;
        self.available_register_count += 1;
    }

    pub(crate) fn increment_register(&mut self, register: u8) {
        let r = &mut self.registers[register as usize];
        log::trace!("increment {} to {}", register, r.ref_count + 1);
        r.ref_count += 1;
    }

    pub(crate) fn decrement_register(&mut self, register: u8) {
        let r = &mut self.registers[register as usize];
        debug_assert!(r.ref_count > 0);
        log::trace!("decrement {} to {}", register, r.ref_count - 1);
        r.ref_count -= 1;
    }

    pub(crate) fn release_register(&mut self, register: u8) {
        log::trace!("release {}", register);
        let r = &mut self.registers[register as usize];
        r.size = 0;
        r.value = None;
        r.site = None;
    }

    pub(crate) fn release_frame_index(&mut self, frame_index: u32, recurse: bool) {
        debug_assert!((frame_index as usize) < self.frame_resources.len());
        log::trace!("release frame index {}", frame_index);
        if recurse && self.frame_resources[frame_index as usize].size > BYTES_PER_WORD {
            self.release_frame_index(frame_index + 1, false);
        }
        let r = &mut self.frame_resources[frame_index as usize];
        r.size = 0;
        r.value = None;
        r.site = None;
    }

    // Promises.

    fn push_promise(&mut self, p: Promise) -> PromiseId {
        let id = PromiseId(self.promises.len() as u32);
        self.promises.push(p);
        id
    }

    pub(crate) fn resolved_promise(&mut self, value: i64) -> PromiseId {
        self.push_promise(Promise::Resolved { value })
    }

    pub(crate) fn code_promise(&mut self, token: Option<OffsetToken>) -> PromiseId {
        self.push_promise(Promise::Code {
            token,
            offset: None,
        })
    }

    pub(crate) fn ip_promise(&mut self, logical_ip: u32) -> PromiseId {
        self.push_promise(Promise::Ip { logical_ip })
    }

    pub(crate) fn promise_set_token(&mut self, p: PromiseId, token: OffsetToken) {
        match &mut self.promises[p.0 as usize] {
            Promise::Code { token: slot, .. } => *slot = Some(token),
            _ => debug_assert!(false, "token pinned on a non-code promise"),
        }
    }

    /// Appends `value` to the constant pool; the returned promise resolves
    /// to the pool slot's address.
    pub(crate) fn pool_append_promise(&mut self, value: PromiseId) -> PromiseId {
        let index = self.constants.len() as u32;
        self.constants.push(value);
        self.push_promise(Promise::Pool { index })
    }

    pub(crate) fn pool_word_count(&self) -> u32 {
        self.constants.len() as u32
    }

    pub fn promise_resolved(&self, p: PromiseId) -> bool {
        match self.promises[p.0 as usize] {
            Promise::Resolved { .. } => true,
            Promise::Pool { .. } => self.machine_code.is_some(),
            Promise::Code { offset, .. } => self.machine_code.is_some() && offset.is_some(),
            Promise::Ip { logical_ip } => {
                self.machine_code.is_some()
                    && self.logical_code[logical_ip as usize]
                        .as_ref()
                        .is_some_and(|i| i.machine_offset.is_some())
            }
        }
    }

    pub fn promise_value(&self, p: PromiseId) -> CompileResult<i64> {
        match self.promises[p.0 as usize] {
            Promise::Resolved { value } => Ok(value),
            Promise::Pool { index } => {
                let base = self.machine_code.ok_or(CompileError::UnresolvedPromise)?;
                Ok(base as i64
                    + pad(self.machine_code_size) as i64
                    + (index * BYTES_PER_WORD) as i64)
            }
            Promise::Code { offset, .. } => {
                let base = self.machine_code.ok_or(CompileError::UnresolvedPromise)?;
                let offset = offset.ok_or(CompileError::UnresolvedPromise)?;
                Ok(base as i64 + offset as i64)
            }
            Promise::Ip { logical_ip } => {
                let base = self.machine_code.ok_or(CompileError::UnresolvedPromise)?;
                let offset = self.logical_code[logical_ip as usize]
                    .as_ref()
                    .and_then(|i| i.machine_offset)
                    .ok_or(CompileError::UnresolvedPromise)?;
                Ok(base as i64 + offset as i64)
            }
        }
    }

    pub(crate) fn push_fork(&mut self, fork: ForkState<'a>) -> ForkId {
        let id = ForkId(self.forks.len() as u32);
        self.forks.push(fork);
        id
    }

    pub(crate) fn push_junction(&mut self, junction: JunctionState) -> JunctionId {
        let id = JunctionId(self.junctions.len() as u32);
        self.junctions.push(junction);
        id
    }

    pub(crate) fn push_link(&mut self, link: Link) -> LinkId {
        let id = LinkId(self.links.len() as u32);
        self.links.push(link);
        id
    }
}

impl PromiseResolver for Context<'_> {
    fn resolved(&self, promise: PromiseId) -> bool {
        self.promise_resolved(promise)
    }

    fn value(&self, promise: PromiseId) -> CompileResult<i64> {
        self.promise_value(promise)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test_context;

    #[test]
    fn test_frame_index_round_trip() {
        let arena = Bump::new();
        let mut ctx = test_context(&arena);
        ctx.init(4, 2, 3, 6);

        // Local 0 of one word sits at the high end of the frame.
        let fi = ctx.frame_index(0, 1);
        assert_eq!(fi, 6 + 2 - 1);
        let offset = ctx.frame_index_to_offset(fi);
        assert_eq!(ctx.offset_to_frame_index(offset), fi);

        // A slot inside the frame proper round-trips too.
        let fi = ctx.frame_index(4, 1);
        let offset = ctx.frame_index_to_offset(fi);
        assert_eq!(ctx.offset_to_frame_index(offset), fi);
    }

    #[test]
    fn test_reserved_registers_reduce_availability() {
        let arena = Bump::new();
        let ctx = test_context(&arena);
        // The mock target reserves one of its eight registers.
        assert_eq!(ctx.available_register_count, 7);
        assert!(ctx.registers[7].reserved);
    }

    #[test]
    fn test_promise_resolution_gating() {
        let arena = Bump::new();
        let mut ctx = test_context(&arena);
        ctx.init(1, 0, 0, 2);

        let resolved = ctx.resolved_promise(42);
        assert!(ctx.promise_resolved(resolved));
        assert_eq!(ctx.promise_value(resolved).unwrap(), 42);

        let code = ctx.code_promise(None);
        assert!(!ctx.promise_resolved(code));
        assert!(ctx.promise_value(code).is_err());

        let pool = ctx.pool_append_promise(resolved);
        assert!(!ctx.promise_resolved(pool));
        ctx.machine_code_size = 10;
        ctx.machine_code = Some(0x1000);
        assert!(ctx.promise_resolved(pool));
        let value = ctx.promise_value(pool).unwrap();
        assert_eq!(value, 0x1000 + pad(10) as i64);
    }
}
