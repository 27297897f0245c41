//! Speculative fork state and junction bookkeeping.
//!
//! `save_state` snapshots the front-end cursor plus one multi-read per
//! live frame value; every future recorded from that point accumulates
//! its constraints in a separate target slot, so `restore_state` can
//! rewind and record another future without corrupting the first. At
//! junctions (a jump to an already-seen logical instruction) each live
//! value gets a stub read that is later bound to the merged
//! continuation's first real read.

use crate::error::CompileResult;

use super::context::Context;
use super::event::{EventId, LinkId};
use super::frame::{Locals, StackRef};
use super::value::{ReadId, ReadKind, ValueId};

/// Handle to a pooled [`ForkState`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForkId(pub(crate) u32);

impl std::fmt::Debug for ForkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Handle to a pooled [`JunctionState`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct JunctionId(pub(crate) u32);

impl std::fmt::Debug for JunctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "j{}", self.0)
    }
}

/// Allocator snapshot taken by `save_state`.
pub struct ForkState<'a> {
    pub stack: StackRef<'a>,
    pub locals: Locals<'a>,
    pub predecessor: Option<EventId>,
    pub logical_ip: Option<u32>,
    /// One multi-read per live frame value at the fork point.
    pub reads: Vec<(ValueId, ReadId)>,
}

/// Stub reads installed on one junction edge.
pub struct JunctionState {
    pub reads: Vec<(ValueId, ReadId)>,
}

impl<'a> Context<'a> {
    /// Snapshots the compilation cursor so the front-end can rewind here
    /// and record an alternative future.
    pub(crate) fn save_state(&mut self) -> ForkId {
        let mut state = ForkState {
            stack: self.stack,
            locals: self.locals,
            predecessor: self.predecessor,
            logical_ip: self.logical_ip,
            reads: Vec::new(),
        };

        if self.predecessor.is_some() {
            let elements: Vec<_> = self.frame_iter(self.stack, self.locals).collect();
            for el in elements {
                let read = self.multi_read(el.size_bytes);
                log::trace!("add multi read {:?} to {:?}", read, el.value);
                self.add_read(None, el.value, read);
                state.reads.push((el.value, read));
            }
        }

        let id = self.push_fork(state);
        if self.predecessor.is_some() {
            self.fork_state = Some(id);
            self.allocate_targets(id);
        }
        id
    }

    /// Rewinds the cursor to a fork and opens fresh multi-read target
    /// slots for the future about to be recorded.
    pub(crate) fn restore_state(&mut self, f: ForkId) {
        if let Some(ip) = self.logical_ip {
            if self.instruction(ip).last_event.is_none() {
                self.append_dummy();
            }
        }

        let (stack, locals, predecessor, logical_ip) = {
            let state = self.fork(f);
            (state.stack, state.locals, state.predecessor, state.logical_ip)
        };
        self.stack = stack;
        self.locals = locals;
        self.predecessor = predecessor;
        self.logical_ip = logical_ip;

        if self.predecessor.is_some() {
            self.fork_state = Some(f);
            self.allocate_targets(f);
        }
    }

    fn allocate_targets(&mut self, f: ForkId) {
        let reads: Vec<_> = self.fork(f).reads.clone();
        for (value, read) in reads {
            self.value_mut(value).last_read = Some(read);
            self.multi_allocate_target(read);
        }
    }

    /// Installs one stub read per live frame value on a junction edge.
    pub(crate) fn populate_junction_reads(&mut self, link: LinkId) {
        let mut reads = Vec::new();
        let elements: Vec<_> = self.frame_iter(self.stack, self.locals).collect();
        for el in elements {
            let stub = self.stub_read(el.size_bytes);
            log::trace!("add stub read {:?} to {:?}", stub, el.value);
            self.add_read(None, el.value, stub);
            reads.push((el.value, stub));
        }
        let id = self.push_junction(JunctionState { reads });
        self.link_mut(link).junction_state = Some(id);
    }

    /// Binds still-unbound stubs of a junction edge to the merged value's
    /// current read-queue head, now that the continuation's reads exist.
    pub(crate) fn update_junction_reads(&mut self, j: JunctionId) {
        let reads: Vec<_> = self.junction(j).reads.clone();
        for (value, stub) in reads {
            let unbound = matches!(self.read(stub).kind, ReadKind::Stub { inner: None, .. });
            if unbound {
                let head = self.value(value).reads;
                if let ReadKind::Stub { inner, .. } = &mut self.read_mut(stub).kind {
                    *inner = head;
                }
            }
        }
    }

    /// Advances per-edge read bookkeeping when the compile pass crosses
    /// `link`: fork edges switch each multi-read to this future's
    /// continuation; junction edges retire their stub reads.
    pub(crate) fn visit_link(&mut self, l: LinkId) -> CompileResult<()> {
        log::trace!(
            "visit link {:?} -> {:?}",
            self.link(l).predecessor,
            self.link(l).successor
        );

        if let Some(f) = self.link(l).fork_state {
            let reads: Vec<_> = self.fork(f).reads.clone();
            for (value, read) in reads {
                let next = self.multi_next_target(read);
                self.value_mut(value).reads = next;
                if !self.live(value) {
                    self.clear_sites(value);
                }
            }
        }

        if let Some(j) = self.link(l).junction_state {
            let reads: Vec<_> = self.junction(j).reads.clone();
            for (value, stub) in reads {
                debug_assert_eq!(self.value(value).reads, Some(stub));
                self.next_read(None, value);
            }
        }
        Ok(())
    }
}
