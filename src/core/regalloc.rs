//! Register and frame-slot selection, eviction and move emission.
//!
//! Allocation picks the cheapest register out of a candidate mask;
//! occupied registers are stolen (their value saved to a canonical frame
//! slot) or, when pinned by memory-operand reference counts, physically
//! swapped aside. Frame slots allocate the same way, but a slot that
//! cannot be stolen is fatal. Everything that can emit code lives on the
//! [`Compiler`]; pure table bookkeeping lives on the [`Context`].

use crate::assembler::{
    Assembler, AssemblerClient, AsmOperand, BinaryOperation, Client, OperandType, TernaryOperation,
    UnaryOperation, ANY_REGISTER_MASK,
};
use crate::compiler::Compiler;
use crate::error::{CompileError, CompileResult};
use crate::BYTES_PER_WORD;

use super::context::Context;
use super::frame::{Locals, StackRef};
use super::site::{SiteId, SiteKind};
use super::value::{ReadId, ValueId};

impl<'a> Context<'a> {
    /// Whether the register's owning value still lists the register's
    /// site, i.e. the register actually holds that value.
    pub(crate) fn register_used(&self, register: u8) -> bool {
        let r = &self.registers[register as usize];
        match (r.value, r.site) {
            (Some(v), Some(s)) => self.find_site(v, s),
            _ => false,
        }
    }

    /// Used, and the register is the value's only site.
    pub(crate) fn register_used_exclusively(&self, register: u8) -> bool {
        if !self.register_used(register) {
            return false;
        }
        let r = &self.registers[register as usize];
        r.value.is_some_and(|v| {
            self.value(v)
                .sites
                .is_some_and(|head| self.site(head).next.is_none())
        })
    }

    pub(crate) fn register_cost(&self, register: u8) -> u32 {
        let r = &self.registers[register as usize];
        if r.reserved || r.freeze_count > 0 {
            return 6;
        }
        let mut cost = 0;
        if self.register_used(register) {
            cost += 1;
            if self.register_used_exclusively(register) {
                cost += 2;
            }
        }
        if r.ref_count > 0 {
            cost += 2;
        }
        cost
    }

    /// Cheapest candidate in `mask`, ties broken towards the highest
    /// number. A single-register mask short-circuits regardless of cost.
    pub(crate) fn pick_register_number(&self, mask: u32) -> CompileResult<u8> {
        let mut best = None;
        let mut best_cost = 5;
        for i in (0..self.arch.register_count).rev() {
            if mask & (1 << i) == 0 {
                continue;
            }
            if mask == 1 << i {
                return Ok(i as u8);
            }
            let cost = self.register_cost(i as u8);
            if cost < best_cost {
                best = Some(i as u8);
                best_cost = cost;
            }
        }
        best.ok_or(CompileError::RegisterAllocation { mask: mask as u64 })
    }
}

/// Scratch-register interface handed to the assembler during `apply`.
pub(crate) struct Scratch<'x, 'a> {
    pub(crate) ctx: &'x mut Context<'a>,
}

impl AssemblerClient for Scratch<'_, '_> {
    fn acquire_temporary(&mut self, mask: u32) -> u8 {
        for i in (0..self.ctx.arch.register_count).rev() {
            if mask & (1 << i) == 0 {
                continue;
            }
            let r = &self.ctx.registers[i as usize];
            if !r.reserved && r.freeze_count == 0 && r.ref_count == 0 && r.value.is_none() {
                self.ctx.increment_register(i as u8);
                return i as u8;
            }
        }
        panic!("no scratch register available in mask {mask:#x}");
    }

    fn release_temporary(&mut self, register: u8) {
        self.ctx.decrement_register(register);
    }

    fn save(&mut self, register: u8) {
        assert!(
            self.ctx.registers[register as usize].value.is_none(),
            "scratch register {register} still holds a value"
        );
    }

    fn restore(&mut self, _register: u8) {}
}

impl<'a, A: Assembler, C: Client> Compiler<'a, A, C> {
    // Assembler plumbing. The scratch client borrows the context while
    // the assembler borrows itself, which is why these destructure.

    pub(crate) fn apply_unary_operand(
        &mut self,
        op: UnaryOperation,
        size: u32,
        a: AsmOperand,
    ) -> CompileResult<()> {
        let Self { ctx, asm, .. } = self;
        asm.apply_unary(op, size, a, &mut Scratch { ctx });
        Ok(())
    }

    pub(crate) fn apply_unary_sites(
        &mut self,
        op: UnaryOperation,
        size: u32,
        a: SiteId,
    ) -> CompileResult<()> {
        let a = self.ctx.site_as_operand(a)?;
        self.apply_unary_operand(op, size, a)
    }

    pub(crate) fn apply_binary_operands(
        &mut self,
        op: BinaryOperation,
        a_size: u32,
        a: AsmOperand,
        b_size: u32,
        b: AsmOperand,
    ) -> CompileResult<()> {
        let Self { ctx, asm, .. } = self;
        asm.apply_binary(op, a_size, a, b_size, b, &mut Scratch { ctx });
        Ok(())
    }

    pub(crate) fn apply_binary_sites(
        &mut self,
        op: BinaryOperation,
        a_size: u32,
        a: SiteId,
        b_size: u32,
        b: SiteId,
    ) -> CompileResult<()> {
        let a = self.ctx.site_as_operand(a)?;
        let b = self.ctx.site_as_operand(b)?;
        self.apply_binary_operands(op, a_size, a, b_size, b)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn apply_ternary_sites(
        &mut self,
        op: TernaryOperation,
        a_size: u32,
        a: SiteId,
        b_size: u32,
        b: SiteId,
        c_size: u32,
        c: SiteId,
    ) -> CompileResult<()> {
        let a = self.ctx.site_as_operand(a)?;
        let b = self.ctx.site_as_operand(b)?;
        let c = self.ctx.site_as_operand(c)?;
        let Self { ctx, asm, .. } = self;
        asm.apply_ternary(op, a_size, a, b_size, b, c_size, c, &mut Scratch { ctx });
        Ok(())
    }

    /// Adds `s` to `v`'s site list, acquiring its resources first. A site
    /// already listed is left alone.
    pub(crate) fn add_site(
        &mut self,
        stack: StackRef<'a>,
        locals: Locals<'a>,
        size: u32,
        v: ValueId,
        s: SiteId,
    ) -> CompileResult<()> {
        if !self.ctx.find_site(v, s) {
            log::trace!("add site {:?} to {:?}", s, v);
            self.site_acquire(s, stack, locals, size, v)?;
            let head = self.ctx.value(v).sites;
            self.ctx.site_mut(s).next = head;
            self.ctx.value_mut(v).sites = Some(s);
        }
        Ok(())
    }

    /// Claims the site's backing resources for `v`, evicting prior owners
    /// as needed.
    fn site_acquire(
        &mut self,
        s: SiteId,
        stack: StackRef<'a>,
        locals: Locals<'a>,
        size: u32,
        v: ValueId,
    ) -> CompileResult<()> {
        match self.ctx.site(s).kind {
            SiteKind::Constant { .. } | SiteKind::Address { .. } => Ok(()),
            SiteKind::Register { mask, low, high } => {
                let new_low =
                    self.validate_register(mask as u32, stack, locals, size, v, s, low)?;
                if let SiteKind::Register { low, .. } = &mut self.ctx.site_mut(s).kind {
                    *low = Some(new_low);
                }
                if size > BYTES_PER_WORD {
                    self.ctx.freeze_register(new_low);
                    let new_high = self.validate_register(
                        (mask >> 32) as u32,
                        stack,
                        locals,
                        size,
                        v,
                        s,
                        high,
                    )?;
                    if let SiteKind::Register { high, .. } = &mut self.ctx.site_mut(s).kind {
                        *high = Some(new_high);
                    }
                    self.ctx.thaw_register(new_low);
                }
                Ok(())
            }
            SiteKind::Memory { base, offset, index, .. } => {
                self.ctx.increment_register(base);
                if let Some(index) = index {
                    self.ctx.increment_register(index);
                }
                if base == self.ctx.arch.stack {
                    debug_assert!(index.is_none());
                    let fi = self.ctx.offset_to_frame_index(offset as u32);
                    self.acquire_frame_index(fi, stack, locals, size, v, s, true)?;
                }
                Ok(())
            }
        }
    }

    /// Ensures a register site holds a register from `mask`, keeping
    /// `current` when it still qualifies and moving the contents when the
    /// allocator picks a different register.
    #[allow(clippy::too_many_arguments)]
    fn validate_register(
        &mut self,
        mask: u32,
        stack: StackRef<'a>,
        locals: Locals<'a>,
        size: u32,
        value: ValueId,
        site: SiteId,
        current: Option<u8>,
    ) -> CompileResult<u8> {
        if let Some(cur) = current {
            if mask & (1 << cur) != 0 {
                let r = &self.ctx.registers[cur as usize];
                if r.reserved || r.value == Some(value) {
                    return Ok(cur);
                }
                if r.value.is_none() {
                    log::trace!("validate claims {} for {:?}", cur, value);
                    let r = &mut self.ctx.registers[cur as usize];
                    r.size = size;
                    r.value = Some(value);
                    r.site = Some(site);
                    return Ok(cur);
                }
            }
        }

        let r = self.acquire_register(mask, stack, locals, size, Some(value), Some(site))?;

        if let Some(cur) = current {
            if cur != r {
                self.ctx.release_register(cur);
                self.apply_binary_operands(
                    BinaryOperation::Move,
                    BYTES_PER_WORD,
                    AsmOperand::Register { low: cur, high: None },
                    BYTES_PER_WORD,
                    AsmOperand::Register { low: r, high: None },
                )?;
            }
        }
        Ok(r)
    }

    /// Picks and claims a register from `mask`, evicting or swapping the
    /// previous occupant out of the way.
    fn acquire_register(
        &mut self,
        mask: u32,
        stack: StackRef<'a>,
        locals: Locals<'a>,
        new_size: u32,
        new_value: Option<ValueId>,
        new_site: Option<SiteId>,
    ) -> CompileResult<u8> {
        let mut r = self.ctx.pick_register_number(mask)?;

        if self.ctx.registers[r as usize].reserved {
            return Ok(r);
        }

        log::trace!(
            "acquire {} for {:?}: freeze {} ref {} used {}",
            r,
            new_value,
            self.ctx.registers[r as usize].freeze_count,
            self.ctx.registers[r as usize].ref_count,
            self.ctx.register_used(r)
        );

        if self.ctx.registers[r as usize].ref_count > 0 {
            r = self.replace_register(stack, locals, r)?;
        } else {
            let old_value = self.ctx.registers[r as usize].value;
            let old_site = self.ctx.registers[r as usize].site;
            if let (Some(ov), Some(os)) = (old_value, old_site) {
                if Some(ov) != new_value && self.ctx.find_site(ov, os) {
                    if !self.try_steal_register(r, stack, locals)? {
                        r = self.replace_register(stack, locals, r)?;
                    }
                }
            }
        }

        let slot = &mut self.ctx.registers[r as usize];
        slot.size = new_size;
        slot.value = new_value;
        slot.site = new_site;
        Ok(r)
    }

    /// Moves a pinned register's contents to a substitute register via a
    /// machine `Swap`, then relabels the tables and sites.
    fn replace_register(
        &mut self,
        stack: StackRef<'a>,
        locals: Locals<'a>,
        r: u8,
    ) -> CompileResult<u8> {
        let (mask, size, value, site) = {
            let slot = &self.ctx.registers[r as usize];
            let mask = if slot.freeze_count > 0 {
                match slot.site {
                    Some(s) => match self.ctx.site(s).kind {
                        SiteKind::Register { mask, .. } => mask as u32,
                        _ => !0,
                    },
                    None => !0,
                }
            } else {
                !0
            };
            (mask, slot.size, slot.value, slot.site)
        };

        self.ctx.freeze_register(r);
        let s = self.acquire_register(mask, stack, locals, size, value, site)?;
        self.ctx.thaw_register(r);

        log::trace!("replace {} with {}", r, s);
        self.swap_registers(r, s)?;
        Ok(s)
    }

    /// Emits a machine `Swap` of `a` and `b` and renames everything that
    /// referred to them: the resource-table payloads trade places and
    /// every live site's register numbers are rewritten, so reference
    /// counts end up at the slot whose number their memory sites now
    /// name.
    fn swap_registers(&mut self, a: u8, b: u8) -> CompileResult<()> {
        debug_assert_ne!(a, b);
        self.apply_binary_operands(
            BinaryOperation::Swap,
            BYTES_PER_WORD,
            AsmOperand::Register { low: a, high: None },
            BYTES_PER_WORD,
            AsmOperand::Register { low: b, high: None },
        )?;

        let rename = |n: &mut u8| {
            if *n == a {
                *n = b;
            } else if *n == b {
                *n = a;
            }
        };
        for site in &mut self.ctx.sites {
            match &mut site.kind {
                SiteKind::Register { low, high, .. } => {
                    if let Some(low) = low {
                        rename(low);
                    }
                    if let Some(high) = high {
                        rename(high);
                    }
                }
                SiteKind::Memory { base, index, .. } => {
                    rename(base);
                    if let Some(index) = index {
                        rename(index);
                    }
                }
                _ => {}
            }
        }

        let registers = &mut self.ctx.registers;
        let (ai, bi) = (a as usize, b as usize);
        macro_rules! exchange {
            ($field:ident) => {{
                let tmp = std::mem::take(&mut registers[ai].$field);
                registers[ai].$field = std::mem::take(&mut registers[bi].$field);
                registers[bi].$field = tmp;
            }};
        }
        exchange!(value);
        exchange!(site);
        exchange!(size);
        exchange!(ref_count);
        exchange!(freeze_count);
        Ok(())
    }

    fn try_steal_register(
        &mut self,
        r: u8,
        stack: StackRef<'a>,
        locals: Locals<'a>,
    ) -> CompileResult<bool> {
        debug_assert_eq!(self.ctx.registers[r as usize].ref_count, 0);
        let (value, site, size) = {
            let slot = &self.ctx.registers[r as usize];
            match (slot.value, slot.site) {
                (Some(v), Some(s)) => (v, s, slot.size),
                _ => {
                    return Err(CompileError::Inconsistent(
                        "stealing from an unoccupied register",
                    ))
                }
            }
        };
        log::trace!("try steal {} from {:?}", r, value);
        self.try_steal_site(site, value, size, stack, locals)
    }

    /// Evicts `v` from `site`. When the site is `v`'s only one the value
    /// is first moved to a save site: the canonical frame slot for a
    /// local, or for a stack temporary its canonical slot or one allowed
    /// by the upcoming read. Fails when no save site is derivable.
    pub(crate) fn try_steal_site(
        &mut self,
        site: SiteId,
        v: ValueId,
        size: u32,
        stack: StackRef<'a>,
        locals: Locals<'a>,
    ) -> CompileResult<bool> {
        let only_site = self
            .ctx
            .value(v)
            .sites
            .is_some_and(|head| self.ctx.site(head).next.is_none());

        if only_site {
            let mut save = None;

            for li in 0..self.ctx.local_footprint {
                let local = locals[li as usize].get();
                if local.value == Some(v) {
                    let fi = self.ctx.frame_index_for_local(li, local.size_bytes);
                    save = Some(self.ctx.frame_site(fi));
                    break;
                }
            }

            if save.is_none() {
                let mut cursor = stack;
                while let Some(elem) = cursor {
                    if elem.value == v {
                        let constrained = match self.ctx.value(v).reads {
                            Some(head) => self.ctx.read_constraints(head).2.exact(),
                            None => None,
                        };
                        let fi = constrained.unwrap_or_else(|| {
                            self.ctx
                                .frame_index(elem.index + self.ctx.local_footprint, elem.size_words)
                        });
                        save = Some(self.ctx.frame_site(fi));
                        break;
                    }
                    cursor = elem.next;
                }
            }

            match save {
                Some(dst) => self.move_value(stack, locals, size, v, site, dst)?,
                None => {
                    log::trace!("unable to steal {:?} from {:?}", site, v);
                    return Ok(false);
                }
            }
        }

        self.ctx.remove_site(v, site);
        Ok(true)
    }

    /// Claims a frame slot (and the following one for multi-word values),
    /// stealing it from the previous owner. A slot that cannot be stolen
    /// is fatal.
    #[allow(clippy::too_many_arguments)]
    fn acquire_frame_index(
        &mut self,
        frame_index: u32,
        stack: StackRef<'a>,
        locals: Locals<'a>,
        new_size: u32,
        new_value: ValueId,
        new_site: SiteId,
        recurse: bool,
    ) -> CompileResult<()> {
        debug_assert!((frame_index as usize) < self.ctx.frame_resources.len());
        log::trace!("acquire frame index {} for {:?}", frame_index, new_value);

        if recurse && new_size > BYTES_PER_WORD {
            self.acquire_frame_index(
                frame_index + 1,
                stack,
                locals,
                new_size,
                new_value,
                new_site,
                false,
            )?;
        }

        let (old_value, old_site, old_size) = {
            let slot = &self.ctx.frame_resources[frame_index as usize];
            (slot.value, slot.site, slot.size)
        };
        if let (Some(ov), Some(os)) = (old_value, old_site) {
            if ov != new_value && self.ctx.find_site(ov, os) {
                if !self.try_steal_site(os, ov, old_size, stack, locals)? {
                    return Err(CompileError::StealFailure);
                }
            }
        }

        let slot = &mut self.ctx.frame_resources[frame_index as usize];
        slot.size = new_size;
        slot.value = Some(new_value);
        slot.site = Some(new_site);
        Ok(())
    }

    /// Moves `value` from `src` into `dst`, routing memory-to-memory
    /// through a temporary register. The destination (and any temporary)
    /// joins the value's site list.
    pub(crate) fn move_value(
        &mut self,
        stack: StackRef<'a>,
        locals: Locals<'a>,
        size: u32,
        value: ValueId,
        src: SiteId,
        dst: SiteId,
    ) -> CompileResult<()> {
        let mut src = src;
        let dst_type = self.ctx.site_operand_type(dst);
        let src_type = self.ctx.site_operand_type(src);

        if dst_type == OperandType::Memory
            && (src_type == OperandType::Memory || src_type == OperandType::Address)
        {
            let tmp = self.ctx.free_register_site(ANY_REGISTER_MASK);
            self.add_site(stack, locals, size, value, tmp)?;
            log::trace!("move {:?} through {:?} for {:?}", src, tmp, value);
            self.apply_binary_sites(BinaryOperation::Move, size, src, size, tmp)?;
            src = tmp;
        }

        self.add_site(stack, locals, size, value, dst)?;
        log::trace!("move {:?} to {:?} for {:?}", src, dst, value);
        self.apply_binary_sites(BinaryOperation::Move, size, src, size, dst)
    }

    /// Spills `v` somewhere acceptable to its next read before `s` is
    /// repurposed, when `s` is the value's only site and the value stays
    /// live.
    pub(crate) fn maybe_preserve(
        &mut self,
        stack: StackRef<'a>,
        locals: Locals<'a>,
        size: u32,
        v: ValueId,
        s: SiteId,
    ) -> CompileResult<()> {
        let only_site = self
            .ctx
            .value(v)
            .sites
            .is_some_and(|head| self.ctx.site(head).next.is_none());
        if only_site && self.ctx.live_next(v) {
            let next = match self.ctx.value(v).reads {
                Some(head) => self.ctx.read_next_of(head),
                None => None,
            };
            self.preserve(stack, locals, size, v, s, next)?;
        }
        Ok(())
    }

    fn preserve(
        &mut self,
        stack: StackRef<'a>,
        locals: Locals<'a>,
        size: u32,
        v: ValueId,
        s: SiteId,
        read: Option<ReadId>,
    ) -> CompileResult<()> {
        debug_assert_eq!(self.ctx.value(v).sites, Some(s));
        let target = self.ctx.target_or_register_for(v, read);
        self.move_value(stack, locals, size, v, s, target)
    }

    /// Picks the best existing site satisfying `r`, or materialises one
    /// and moves the value there.
    pub(crate) fn read_source(
        &mut self,
        stack: StackRef<'a>,
        locals: Locals<'a>,
        r: ReadId,
    ) -> CompileResult<SiteId> {
        let v = self
            .ctx
            .read(r)
            .value
            .ok_or(CompileError::Inconsistent("read not attached to a value"))?;
        if let Some(site) = self.ctx.read_pick_site(r, v) {
            return Ok(site);
        }

        let target = self
            .ctx
            .read_allocate_site(r)
            .ok_or(CompileError::RegisterAllocation { mask: 0 })?;
        let (site, cost) = self.ctx.pick_best(v, Some(target));
        let site = site.ok_or(CompileError::Inconsistent("live value has no site"))?;
        debug_assert!(cost > 0);
        let size = self.ctx.read_size(r);
        self.move_value(stack, locals, size, v, site, target)?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use crate::core::test_utils::test_context;

    #[test]
    fn test_pick_prefers_highest_free_register() {
        let arena = bumpalo::Bump::new();
        let mut ctx = test_context(&arena);
        ctx.init(1, 0, 0, 4);
        // Register 7 is reserved, 6 is the highest allocatable.
        assert_eq!(ctx.pick_register_number(!0).unwrap(), 6);
    }

    #[test]
    fn test_single_register_mask_short_circuits() {
        let arena = bumpalo::Bump::new();
        let mut ctx = test_context(&arena);
        ctx.init(1, 0, 0, 4);
        // Even a reserved register is returned when the mask allows
        // nothing else.
        assert_eq!(ctx.pick_register_number(1 << 7).unwrap(), 7);
    }

    #[test]
    fn test_occupied_registers_cost_more() {
        let arena = bumpalo::Bump::new();
        let mut ctx = test_context(&arena);
        ctx.init(1, 0, 0, 4);

        let site = ctx.register_site(6, None);
        let value = ctx.new_value_with(Some(site), None);
        ctx.registers[6].value = Some(value);
        ctx.registers[6].site = Some(site);
        ctx.registers[6].size = 8;

        // Used exclusively: 1 + 2.
        assert_eq!(ctx.register_cost(6), 3);
        ctx.increment_register(6);
        assert_eq!(ctx.register_cost(6), 5);
        ctx.decrement_register(6);
        ctx.freeze_register(6);
        assert_eq!(ctx.register_cost(6), 6);
        ctx.thaw_register(6);

        // The allocator now prefers the next register down.
        assert_eq!(ctx.pick_register_number(!0).unwrap(), 5);
    }

    #[test]
    fn test_empty_mask_is_an_error() {
        let arena = bumpalo::Bump::new();
        let mut ctx = test_context(&arena);
        ctx.init(1, 0, 0, 4);
        assert!(ctx.pick_register_number(0).is_err());
    }
}
