//! The compile walk.
//!
//! Events were linked and their reads registered during the scan (append)
//! phase; this pass walks them in order, adopts junction or saved site
//! tables across control-flow edges, picks a source site for every read,
//! calls each event's compile method, pins pending code promises, and
//! finally chains the assembler blocks into a contiguous layout.

use smallvec::SmallVec;
use std::cell::Cell;

use crate::assembler::{Assembler, Client, OperandType, TypeMask, ANY_REGISTER_MASK};
use crate::compiler::Compiler;
use crate::error::{CompileError, CompileResult};
use crate::{ceiling, BYTES_PER_WORD};

use super::context::{Context, Pass};
use super::event::{EventId, SiteTable};
use super::frame::FrameElement;
use super::promise::Promise;
use super::site::{FrameIndex, SiteId, SiteRecord};
use super::value::{ReadId, ValueId};

struct BlockData<B> {
    next_instruction: Option<u32>,
    assembler_block: Option<B>,
    start: u32,
}

impl<'a> Context<'a> {
    /// Hands the freshly allocated junction table backward to every
    /// predecessor that does not own one yet, and onward through their
    /// successors, so all edges reaching the junction agree on one table.
    fn propagate_junction_sites(&mut self, e: EventId, table: SiteTable<'a>) {
        let mut pl = self.event(e).predecessors;
        while let Some(l) = pl {
            let p = self.link(l).predecessor;
            if self.event(p).junction_sites.is_none() {
                self.event_mut(p).junction_sites = Some(table);
                let mut sl = self.event(p).successors;
                while let Some(s) = sl {
                    let successor = self.link(s).successor;
                    self.propagate_junction_sites(successor, table);
                    sl = self.link(s).next_successor;
                }
            }
            pl = self.link(l).next_predecessor;
        }
    }
}

impl<'a, A: Assembler, C: Client> Compiler<'a, A, C> {
    pub(crate) fn run_compile_pass(&mut self) -> CompileResult<u32> {
        if let Some(ip) = self.ctx.logical_ip {
            if self.ctx.instruction(ip).last_event.is_none() {
                self.ctx.append_dummy();
            }
        }
        self.ctx.pass = Pass::Compile;

        let Some(first) = self.ctx.first_event else {
            return Ok(0);
        };

        self.asm.allocate_frame(self.ctx.aligned_frame_size);

        let mut blocks: Vec<BlockData<A::Block>> = vec![BlockData {
            next_instruction: None,
            assembler_block: None,
            start: 0,
        }];
        let mut current = 0usize;

        let mut cursor = Some(first);
        while let Some(e) = cursor {
            log::trace!(
                "compile {} at {} with {} preds {} succs",
                self.ctx.event(e).name,
                self.ctx.event(e).logical_instruction,
                self.ctx.count_predecessors(self.ctx.event(e).predecessors),
                self.ctx.count_successors(self.ctx.event(e).successors),
            );

            self.ctx.event_mut(e).block = Some(current as u32);
            self.ctx.stack = self.ctx.event(e).stack_before;
            self.ctx.locals = self.ctx.event(e).locals_before;

            let ip = self.ctx.event(e).logical_instruction;
            if self.ctx.instruction(ip).machine_offset_token.is_none() {
                let token = self.asm.offset();
                self.ctx.instruction_mut(ip).machine_offset_token = Some(token);
            }

            if let Some(preds) = self.ctx.event(e).predecessors {
                let last = self.ctx.last_predecessor(preds);
                self.ctx.visit_link(last)?;

                let first_pred = self.ctx.link(preds).predecessor;
                if self.ctx.link(preds).next_predecessor.is_some() {
                    let mut pl = Some(preds);
                    while let Some(l) = pl {
                        let next = self.ctx.link(l).next_predecessor;
                        if next.is_some() {
                            if let Some(j) = self.ctx.link(l).junction_state {
                                self.ctx.update_junction_reads(j);
                            }
                        }
                        pl = next;
                    }
                    if let Some(table) = self.ctx.event(first_pred).junction_sites {
                        log::trace!("adopt junction sites of {:?}", first_pred);
                        self.set_sites(e, table)?;
                    }
                } else {
                    let multi_successor = self
                        .ctx
                        .event(first_pred)
                        .successors
                        .is_some_and(|s| self.ctx.link(s).next_successor.is_some());
                    if multi_successor {
                        if let Some(table) = self.ctx.event(first_pred).saved_sites {
                            log::trace!("adopt saved sites of {:?}", first_pred);
                            self.set_sites(e, table)?;
                        }
                    }
                }
            }

            self.populate_sources(e)?;

            let branch = self.ctx.event(e).is_branch;
            if branch && self.ctx.event(e).successors.is_some() {
                self.populate_site_tables(e)?;
            }
            self.compile_event(e)?;
            if !branch && self.ctx.event(e).successors.is_some() {
                self.populate_site_tables(e)?;
            }

            let visit_links = std::mem::take(&mut self.ctx.event_mut(e).visit_links);
            for l in visit_links {
                self.ctx.visit_link(l)?;
            }

            let promises = std::mem::take(&mut self.ctx.event_mut(e).promises);
            if !promises.is_empty() {
                let token = self.asm.offset();
                for p in promises {
                    self.ctx.promise_set_token(p, token);
                }
            }

            let next_event = self.ctx.event(e).next;
            let next_instruction = self.ctx.next_instruction(ip);
            let boundary = match next_event {
                None => true,
                Some(n) => {
                    let nip = self.ctx.event(n).logical_instruction;
                    nip != ip
                        && (self.ctx.instruction(ip).last_event == Some(e)
                            || Some(nip) != next_instruction)
                }
            };
            if boundary {
                blocks[current].next_instruction = next_instruction;
                blocks[current].assembler_block = Some(self.asm.end_block(next_event.is_some()));
                if next_event.is_some() {
                    blocks.push(BlockData {
                        next_instruction: None,
                        assembler_block: None,
                        start: 0,
                    });
                    current += 1;
                }
            }

            cursor = next_event;
        }

        let total = self.chain_blocks(&mut blocks)?;
        self.ctx.machine_code_size = total;
        self.finalize_offsets()?;
        Ok(total)
    }

    /// Fixes each block's start offset given the previous block's
    /// resolution; the last resolution yields the total code size.
    fn chain_blocks(&mut self, blocks: &mut [BlockData<A::Block>]) -> CompileResult<u32> {
        let mut index = 0usize;
        loop {
            match blocks[index].next_instruction {
                Some(ip) => {
                    let head = self
                        .ctx
                        .instruction(ip)
                        .first_event
                        .ok_or(CompileError::Inconsistent("instruction without events"))?;
                    let next_index = self
                        .ctx
                        .event(head)
                        .block
                        .ok_or(CompileError::Inconsistent("event compiled outside a block"))?
                        as usize;
                    let start = blocks[index].start;
                    let resolved = {
                        let block = blocks[index]
                            .assembler_block
                            .as_ref()
                            .ok_or(CompileError::Inconsistent("unterminated block"))?;
                        let next = blocks[next_index].assembler_block.as_ref();
                        self.asm.resolve_block(block, start, next)
                    };
                    blocks[next_index].start = resolved;
                    index = next_index;
                }
                None => {
                    let start = blocks[index].start;
                    let block = blocks[index]
                        .assembler_block
                        .as_ref()
                        .ok_or(CompileError::Inconsistent("unterminated block"))?;
                    return Ok(self.asm.resolve_block(block, start, None));
                }
            }
        }
    }

    /// Turns every pinned offset token into a final code offset, making
    /// promises pure data from here on.
    fn finalize_offsets(&mut self) -> CompileResult<()> {
        let Self { ctx, asm, .. } = self;
        for instruction in ctx.logical_code.iter_mut().flatten() {
            if let Some(token) = instruction.machine_offset_token {
                instruction.machine_offset = Some(
                    asm.offset_value(token)
                        .ok_or(CompileError::UnresolvedPromise)?,
                );
            }
        }
        for promise in ctx.promises.iter_mut() {
            if let Promise::Code {
                token: Some(token),
                offset: offset @ None,
            } = promise
            {
                *offset = Some(
                    asm.offset_value(*token)
                        .ok_or(CompileError::UnresolvedPromise)?,
                );
            }
        }
        Ok(())
    }

    /// Picks the best-matching existing site for every read of the event,
    /// materialising and filling new sites where nothing matches. Chosen
    /// sources stay frozen until all of the event's reads are placed so
    /// later reads cannot steal them.
    fn populate_sources(&mut self, e: EventId) -> CompileResult<()> {
        let stack = self.ctx.event(e).stack_before;
        let locals = self.ctx.event(e).locals_before;
        let mut frozen: SmallVec<[SiteId; 8]> = SmallVec::new();

        let mut cursor = self.ctx.event(e).reads;
        while let Some(r) = cursor {
            cursor = self.ctx.read(r).event_next;
            let source = self.read_source(stack, locals, r)?;
            let v = self
                .ctx
                .read(r)
                .value
                .ok_or(CompileError::Inconsistent("read not attached to a value"))?;
            self.ctx.value_mut(v).source = Some(source);
            self.ctx.site_freeze(source);
            frozen.push(source);
        }

        while let Some(s) = frozen.pop() {
            self.ctx.site_thaw(s);
        }
        Ok(())
    }

    /// After an event with successors compiles (or before, for branches),
    /// agree on junction sites with the other paths into any merging
    /// successor, and snapshot saved sites when several successors will
    /// restart from this event's state.
    fn populate_site_tables(&mut self, e: EventId) -> CompileResult<()> {
        let stack_after = self.ctx.event(e).stack_after;
        let locals_after = self
            .ctx
            .event(e)
            .locals_after
            .unwrap_or(self.ctx.event(e).locals_before);
        let frame_footprint = self.ctx.frame_footprint(stack_after);
        let mut frozen: SmallVec<[SiteId; 8]> = SmallVec::new();

        let elements: Vec<FrameElement> =
            self.ctx.frame_iter(stack_after, locals_after).collect();

        if let Some(table) = self.ctx.event(e).junction_sites {
            for el in &elements {
                if table
                    .get(el.local_index as usize)
                    .is_some_and(|slot| slot.get().is_some())
                {
                    self.resolve_junction_site(e, table, el, &mut frozen)?;
                }
            }
        } else {
            let mut sl = self.ctx.event(e).successors;
            while let Some(l) = sl {
                let successor = self.ctx.link(l).successor;
                let merging = self
                    .ctx
                    .event(successor)
                    .predecessors
                    .is_some_and(|p| self.ctx.link(p).next_predecessor.is_some());
                if merging {
                    let arena = self.ctx.arena;
                    let table: SiteTable<'a> = arena
                        .alloc_slice_fill_with(frame_footprint as usize, |_| Cell::new(None));
                    self.ctx.propagate_junction_sites(successor, table);
                    break;
                }
                sl = self.ctx.link(l).next_successor;
            }
        }

        if let Some(table) = self.ctx.event(e).junction_sites {
            for el in &elements {
                if table
                    .get(el.local_index as usize)
                    .is_some_and(|slot| slot.get().is_none())
                {
                    self.resolve_junction_site(e, table, el, &mut frozen)?;
                }
            }
            log::trace!("resolved junction sites at {:?}", e);
            for el in &elements {
                self.ctx.remove_buddy(el.value);
            }
        }

        while let Some(s) = frozen.pop() {
            self.ctx.site_thaw(s);
        }

        let multi_successor = self
            .ctx
            .event(e)
            .successors
            .is_some_and(|s| self.ctx.link(s).next_successor.is_some());
        if multi_successor {
            let arena = self.ctx.arena;
            let table: SiteTable<'a> =
                arena.alloc_slice_fill_with(frame_footprint as usize, |_| Cell::new(None));
            for el in &elements {
                let mut records: SmallVec<[SiteRecord; 2]> = SmallVec::new();
                let mut cursor = self.ctx.value(el.value).sites;
                while let Some(s) = cursor {
                    records.push(self.ctx.site_record(s));
                    cursor = self.ctx.site(s).next;
                }
                if !records.is_empty() {
                    if let Some(slot) = table.get(el.local_index as usize) {
                        slot.set(Some(arena.alloc_slice_copy(&records)));
                    }
                }
            }
            self.ctx.event_mut(e).saved_sites = Some(table);
            log::trace!("captured saved sites at {:?}", e);
        }
        Ok(())
    }

    /// Ensures `el.value` sits at the junction site agreed for its frame
    /// slot, electing (and freezing) a site when this event is the first
    /// path to decide.
    fn resolve_junction_site(
        &mut self,
        e: EventId,
        table: SiteTable<'a>,
        el: &FrameElement,
        frozen: &mut SmallVec<[SiteId; 8]>,
    ) -> CompileResult<()> {
        let v = el.value;
        if !self.ctx.live(v) {
            return Ok(());
        }
        debug_assert!(self.ctx.value(v).sites.is_some());

        let read = self.ctx.value(v).reads;
        let original = table
            .get(el.local_index as usize)
            .and_then(|slot| slot.get());
        let frame_index = self
            .ctx
            .frame_index(el.local_index, ceiling(el.size_bytes, BYTES_PER_WORD));

        let target = match original {
            Some(records) => self.ctx.materialize_record(records[0]),
            None => self.pick_junction_site(v, read, frame_index)?,
        };

        let (site, cost) = self.ctx.pick_best(v, Some(target));
        let site = site.ok_or(CompileError::Inconsistent("live value has no site"))?;
        let target = if cost > 0 {
            let size = match read {
                Some(r) => self.ctx.read_size(r),
                None => el.size_bytes,
            };
            let stack_after = self.ctx.event(e).stack_after;
            let locals_after = self
                .ctx
                .event(e)
                .locals_after
                .unwrap_or(self.ctx.event(e).locals_before);
            self.move_value(stack_after, locals_after, size, v, site, target)?;
            target
        } else {
            site
        };

        if original.is_none() {
            self.ctx.site_freeze(target);
            frozen.push(target);
            let record = self.ctx.site_record(target);
            let arena = self.ctx.arena;
            if let Some(slot) = table.get(el.local_index as usize) {
                slot.set(Some(arena.alloc_slice_copy(&[record])));
            }
        }
        log::trace!("junction site for {:?} at slot {}", v, el.local_index);
        Ok(())
    }

    /// A location all predecessors of a junction can agree on: an
    /// existing register-or-memory site, a site the pending read allows,
    /// any free register, or (under register exhaustion) the value's
    /// canonical frame slot.
    fn pick_junction_site(
        &mut self,
        v: ValueId,
        read: Option<ReadId>,
        frame_index: u32,
    ) -> CompileResult<SiteId> {
        if self.ctx.available_register_count > 1 {
            let mut site = match read {
                Some(r) => self.ctx.read_pick_site(r, v),
                None => None,
            };
            if site.is_none() {
                site = self.ctx.pick_best(v, None).0;
            }
            if let Some(s) = site {
                let agreeable =
                    TypeMask::of(OperandType::Memory).with(OperandType::Register);
                if self
                    .ctx
                    .site_matches(s, agreeable, ANY_REGISTER_MASK, FrameIndex::Any)
                {
                    return Ok(s);
                }
            }
            if let Some(r) = read {
                if let Some(s) = self.ctx.read_allocate_site(r) {
                    return Ok(s);
                }
            }
            Ok(self.ctx.free_register_site(ANY_REGISTER_MASK))
        } else {
            Ok(self.ctx.frame_site(frame_index))
        }
    }

    /// Replaces every live frame value's sites with the copies recorded
    /// in `table`, bringing this path's view in line with the agreement.
    fn set_sites(&mut self, e: EventId, table: SiteTable<'a>) -> CompileResult<()> {
        let stack = self.ctx.event(e).stack_before;
        let locals = self.ctx.event(e).locals_before;
        let elements: Vec<FrameElement> = self.ctx.frame_iter(stack, locals).collect();

        for el in &elements {
            self.ctx.clear_sites(el.value);
        }
        for el in &elements {
            let records = table
                .get(el.local_index as usize)
                .and_then(|slot| slot.get());
            if let Some(records) = records {
                if self.ctx.live(el.value) {
                    let size = match self.ctx.value(el.value).reads {
                        Some(r) => self.ctx.read_size(r),
                        None => el.size_bytes,
                    };
                    for &record in records {
                        let site = self.ctx.materialize_record(record);
                        self.add_site(stack, locals, size, el.value, site)?;
                    }
                    log::trace!("set sites for {:?} at slot {}", el.value, el.local_index);
                }
            }
        }
        Ok(())
    }
}
