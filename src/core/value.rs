//! Values, buddy rings and the read queue.
//!
//! A value is an abstract operand that may live in several sites at once.
//! Its future uses are queued as reads; each read constrains where the
//! value must be at one upcoming event. Values that must stay in lockstep
//! (a pushed operand that is also a live local) are linked into a buddy
//! ring: site lookups scan the whole ring, so a site added through one
//! member is visible to all of them.

use smallvec::SmallVec;

use crate::assembler::{OperandType, TypeMask, ANY_REGISTER_MASK};

use super::context::Context;
use super::event::EventId;
use super::promise::PromiseId;
use super::site::{FrameIndex, SiteId, SiteKind};

/// Handle to a pooled [`Value`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub(crate) u32);

impl std::fmt::Debug for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug)]
pub struct Value {
    /// Head of the read queue.
    pub reads: Option<ReadId>,
    /// Tail of the read queue; new reads are appended here.
    pub last_read: Option<ReadId>,
    /// Head of the site list.
    pub sites: Option<SiteId>,
    /// Site chosen for the event currently compiling.
    pub source: Option<SiteId>,
    /// Preferred destination site, when one is known ahead of time.
    pub target: Option<SiteId>,
    /// Next member of the buddy ring; self-link when unbuddied.
    pub buddy: ValueId,
    /// Whether the value currently backs a stack slot or local.
    pub local: bool,
}

/// Handle to a pooled [`Read`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadId(pub(crate) u32);

impl std::fmt::Debug for ReadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Debug)]
pub struct Read {
    pub kind: ReadKind,
    pub size: u32,
    pub value: Option<ValueId>,
    pub event: Option<EventId>,
    /// Next read of the same event (not of the same value).
    pub event_next: Option<ReadId>,
}

#[derive(Debug)]
pub enum ReadKind {
    /// A fixed constraint set.
    Single {
        type_mask: TypeMask,
        register_mask: u64,
        frame_index: FrameIndex,
        next: Option<ReadId>,
    },
    /// Alternative constraint sets harvested at a fork. Each saved or
    /// restored future owns one target slot; the slot receives the first
    /// read appended on that future and becomes the queue continuation
    /// when the corresponding edge is visited.
    Multi {
        members: Vec<ReadId>,
        targets: std::collections::VecDeque<Option<ReadId>>,
        visited: bool,
    },
    /// A placeholder installed at a junction, later bound to the first
    /// real read of the merged value.
    Stub {
        next: Option<ReadId>,
        inner: Option<ReadId>,
        visited: bool,
    },
}

impl<'a> Context<'a> {
    pub(crate) fn new_value(&mut self) -> ValueId {
        self.new_value_with(None, None)
    }

    /// A value whose site list starts out holding `site` without going
    /// through acquisition; used for constants, addresses and the
    /// reserved-register operands.
    pub(crate) fn new_value_with(
        &mut self,
        site: Option<SiteId>,
        target: Option<SiteId>,
    ) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(Value {
            reads: None,
            last_read: None,
            sites: site,
            source: None,
            target,
            buddy: id,
            local: false,
        });
        id
    }

    /// The buddy ring starting at `v`, including `v` itself.
    pub(crate) fn ring(&self, v: ValueId) -> SmallVec<[ValueId; 4]> {
        let mut members = SmallVec::new();
        members.push(v);
        let mut p = self.value(v).buddy;
        while p != v {
            members.push(p);
            p = self.value(p).buddy;
        }
        members
    }

    pub(crate) fn find_site(&self, v: ValueId, s: SiteId) -> bool {
        let mut cursor = self.value(v).sites;
        while let Some(id) = cursor {
            if id == s {
                return true;
            }
            cursor = self.site(id).next;
        }
        false
    }

    /// Releases `s` and unlinks it from whichever ring member holds it.
    pub(crate) fn remove_site(&mut self, v: ValueId, s: SiteId) {
        for member in self.ring(v) {
            let mut prev: Option<SiteId> = None;
            let mut cursor = self.value(member).sites;
            while let Some(id) = cursor {
                let next = self.site(id).next;
                if id == s {
                    log::trace!("remove site {:?} from {:?}", s, member);
                    self.site_release(s);
                    match prev {
                        Some(p) => self.site_mut(p).next = next,
                        None => self.value_mut(member).sites = next,
                    }
                    return;
                }
                prev = Some(id);
                cursor = next;
            }
        }
    }

    /// Releases every site of `v` itself (buddies keep theirs).
    pub(crate) fn clear_sites(&mut self, v: ValueId) {
        log::trace!("clear sites for {:?}", v);
        let mut ids: SmallVec<[SiteId; 4]> = SmallVec::new();
        let mut cursor = self.value(v).sites;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.site(id).next;
        }
        for id in ids {
            self.site_release(id);
        }
        self.value_mut(v).sites = None;
    }

    /// Whether any ring member still has a valid pending read.
    pub(crate) fn live(&mut self, v: ValueId) -> bool {
        for member in self.ring(v) {
            if let Some(head) = self.value(member).reads {
                if self.read_valid(head) {
                    return true;
                }
            }
        }
        false
    }

    /// Whether the value stays live once the current read retires.
    pub(crate) fn live_next(&mut self, v: ValueId) -> bool {
        if let Some(head) = self.value(v).reads {
            if let Some(next) = self.read_next_of(head) {
                if self.read_valid(next) {
                    return true;
                }
            }
        }
        let mut p = self.value(v).buddy;
        while p != v {
            if let Some(head) = self.value(p).reads {
                if self.read_valid(head) {
                    return true;
                }
            }
            p = self.value(p).buddy;
        }
        false
    }

    /// Retires the current read of `v`; `e` must be the event it was
    /// registered for (`None` for junction stubs). Once no ring member
    /// has a valid read left, all of `v`'s sites are released.
    pub(crate) fn next_read(&mut self, e: Option<EventId>, v: ValueId) {
        let Some(head) = self.value(v).reads else {
            debug_assert!(false, "read queue advanced past its end");
            return;
        };
        debug_assert_eq!(self.read(head).event, e);
        log::trace!("pop read {:?} from {:?}", head, v);
        let next = self.read_next_of(head);
        self.value_mut(v).reads = next;
        if !self.live(v) {
            self.clear_sites(v);
        }
    }

    /// The queue continuation after `r`. Multi-reads have per-future
    /// continuations and are advanced through their target slots instead.
    pub(crate) fn read_next_of(&mut self, r: ReadId) -> Option<ReadId> {
        match &self.read(r).kind {
            ReadKind::Single { next, .. } => *next,
            ReadKind::Stub { next, .. } => *next,
            ReadKind::Multi { .. } => {
                panic!("read queue advanced through a multi-read")
            }
        }
    }

    /// Registers `r` as the next read of `v`, optionally tying it to an
    /// event's read list.
    pub(crate) fn add_read(&mut self, e: Option<EventId>, v: ValueId, r: ReadId) {
        log::trace!("add read {:?} to {:?} at {:?}", r, v, e);
        self.read_mut(r).value = Some(v);
        if let Some(e) = e {
            self.read_mut(r).event = Some(e);
            let head = self.event(e).reads;
            self.read_mut(r).event_next = head;
            self.event_mut(e).reads = Some(r);
            self.event_mut(e).read_count += 1;
        }

        match self.value(v).last_read {
            Some(tail) => self.read_append(tail, r),
            None => self.value_mut(v).reads = Some(r),
        }
        self.value_mut(v).last_read = Some(r);
    }

    fn read_append(&mut self, tail: ReadId, r: ReadId) {
        match &mut self.read_mut(tail).kind {
            ReadKind::Single { next, .. } | ReadKind::Stub { next, .. } => {
                debug_assert!(next.is_none());
                *next = Some(r);
            }
            ReadKind::Multi { members, targets, .. } => {
                members.push(r);
                debug_assert!(!targets.is_empty());
                if let Some(slot) = targets.back_mut() {
                    *slot = Some(r);
                }
            }
        }
    }

    /// Narrows the constraint triple by `r`. Returns whether `r` is still
    /// satisfiable; multi-read members that have gone invalid are pruned
    /// on the way. Self-referential read graphs (stubs bound back into
    /// their own queue) are cut off by the visited flag.
    pub(crate) fn read_intersect(
        &mut self,
        r: ReadId,
        type_mask: &mut TypeMask,
        register_mask: &mut u64,
        frame_index: &mut FrameIndex,
    ) -> bool {
        // Inspect-and-flag first so the pool borrow ends before recursing.
        enum Shape {
            Cut(bool),
            Single(TypeMask, u64, FrameIndex),
            Multi(Vec<ReadId>),
            Stub(Option<ReadId>),
        }
        let shape = match &mut self.read_mut(r).kind {
            ReadKind::Single {
                type_mask,
                register_mask,
                frame_index,
                ..
            } => Shape::Single(*type_mask, *register_mask, *frame_index),
            ReadKind::Multi { members, visited, .. } => {
                if *visited {
                    Shape::Cut(false)
                } else {
                    *visited = true;
                    Shape::Multi(members.clone())
                }
            }
            ReadKind::Stub { inner, visited, .. } => {
                if *visited {
                    Shape::Cut(true)
                } else {
                    *visited = true;
                    Shape::Stub(*inner)
                }
            }
        };

        match shape {
            Shape::Cut(result) => result,
            Shape::Single(tm, rm, fi) => {
                *type_mask = type_mask.intersect(tm);
                *register_mask &= rm;
                *frame_index = frame_index.intersect(fi);
                true
            }
            Shape::Multi(snapshot) => {
                let mut kept = Vec::with_capacity(snapshot.len());
                let mut any = false;
                for member in snapshot {
                    if self.read_intersect(member, type_mask, register_mask, frame_index) {
                        any = true;
                        kept.push(member);
                    }
                }
                if let ReadKind::Multi { members, visited, .. } = &mut self.read_mut(r).kind {
                    *members = kept;
                    *visited = false;
                }
                any
            }
            Shape::Stub(inner) => {
                let survives = match inner {
                    Some(i) => self.read_intersect(i, type_mask, register_mask, frame_index),
                    None => true,
                };
                if let ReadKind::Stub { inner, visited, .. } = &mut self.read_mut(r).kind {
                    if !survives {
                        *inner = None;
                    }
                    *visited = false;
                }
                true
            }
        }
    }

    /// Whether `r` can still be satisfied. Stubs are unconditionally
    /// valid until bound; multi-reads prune dead members.
    pub(crate) fn read_valid(&mut self, r: ReadId) -> bool {
        let snapshot = match &mut self.read_mut(r).kind {
            ReadKind::Single { .. } | ReadKind::Stub { .. } => return true,
            ReadKind::Multi { members, visited, .. } => {
                if *visited {
                    return false;
                }
                *visited = true;
                members.clone()
            }
        };

        let mut kept = Vec::with_capacity(snapshot.len());
        let mut any = false;
        for member in snapshot {
            if self.read_valid(member) {
                any = true;
                kept.push(member);
            }
        }
        if let ReadKind::Multi { members, visited, .. } = &mut self.read_mut(r).kind {
            *members = kept;
            *visited = false;
        }
        any
    }

    /// The fully-intersected constraint triple of `r`.
    pub(crate) fn read_constraints(&mut self, r: ReadId) -> (TypeMask, u64, FrameIndex) {
        let mut type_mask = TypeMask::ALL;
        let mut register_mask = ANY_REGISTER_MASK;
        let mut frame_index = FrameIndex::Any;
        self.read_intersect(r, &mut type_mask, &mut register_mask, &mut frame_index);
        (type_mask, register_mask, frame_index)
    }

    pub(crate) fn read_size(&self, r: ReadId) -> u32 {
        self.read(r).size
    }

    /// The cheapest existing site of `v`'s ring satisfying the triple.
    pub(crate) fn pick_site_matching(
        &self,
        v: ValueId,
        type_mask: TypeMask,
        register_mask: u64,
        frame_index: FrameIndex,
    ) -> Option<SiteId> {
        let mut best = None;
        let mut best_cost = u32::MAX;
        for member in self.ring(v) {
            let mut cursor = self.value(member).sites;
            while let Some(s) = cursor {
                if self.site_matches(s, type_mask, register_mask, frame_index) {
                    let cost = self.site_copy_cost(s, None);
                    if cost < best_cost {
                        best = Some(s);
                        best_cost = cost;
                    }
                }
                cursor = self.site(s).next;
            }
        }
        best
    }

    pub(crate) fn read_pick_site(&mut self, r: ReadId, v: ValueId) -> Option<SiteId> {
        let (tm, rm, fi) = self.read_constraints(r);
        self.pick_site_matching(v, tm, rm, fi)
    }

    /// A fresh site satisfying the triple, preferring a register.
    pub(crate) fn allocate_site_for(
        &mut self,
        type_mask: TypeMask,
        register_mask: u64,
        frame_index: FrameIndex,
    ) -> Option<SiteId> {
        if type_mask.contains(OperandType::Register) && register_mask != 0 {
            Some(self.free_register_site(register_mask))
        } else {
            frame_index.exact().map(|fi| self.frame_site(fi))
        }
    }

    pub(crate) fn read_allocate_site(&mut self, r: ReadId) -> Option<SiteId> {
        let (tm, rm, fi) = self.read_constraints(r);
        self.allocate_site_for(tm, rm, fi)
    }

    /// The ring's cheapest site relative to `target`, with its cost.
    pub(crate) fn pick_best(
        &self,
        v: ValueId,
        target: Option<SiteId>,
    ) -> (Option<SiteId>, u32) {
        let mut best = None;
        let mut best_cost = u32::MAX;
        for member in self.ring(v) {
            let mut cursor = self.value(member).sites;
            while let Some(s) = cursor {
                let cost = self.site_copy_cost(s, target);
                if cost < best_cost {
                    best = Some(s);
                    best_cost = cost;
                }
                cursor = self.site(s).next;
            }
        }
        (best, best_cost)
    }

    pub(crate) fn target_or_null_for(&mut self, v: ValueId, r: Option<ReadId>) -> Option<SiteId> {
        if let Some(target) = self.value(v).target {
            return Some(target);
        }
        match r {
            Some(r) => self.read_allocate_site(r),
            None => None,
        }
    }

    pub(crate) fn target_or_null(&mut self, v: ValueId) -> Option<SiteId> {
        if let Some(target) = self.value(v).target {
            return Some(target);
        }
        if self.live(v) {
            let head = self.value(v).reads;
            return match head {
                Some(r) => self.read_allocate_site(r),
                None => None,
            };
        }
        None
    }

    pub(crate) fn target_or_register(&mut self, v: ValueId) -> SiteId {
        match self.target_or_null(v) {
            Some(s) => s,
            None => self.free_register_site(ANY_REGISTER_MASK),
        }
    }

    pub(crate) fn target_or_register_for(&mut self, v: ValueId, r: Option<ReadId>) -> SiteId {
        match self.target_or_null_for(v, r) {
            Some(s) => s,
            None => self.free_register_site(ANY_REGISTER_MASK),
        }
    }

    /// First constant site in `v`'s own list.
    pub(crate) fn find_constant_site(&self, v: ValueId) -> Option<(SiteId, PromiseId)> {
        let mut cursor = self.value(v).sites;
        while let Some(s) = cursor {
            if let SiteKind::Constant { value } = self.site(s).kind {
                return Some((s, value));
            }
            cursor = self.site(s).next;
        }
        None
    }

    /// Splices `v` out of its buddy ring.
    pub(crate) fn remove_buddy(&mut self, v: ValueId) {
        let next = self.value(v).buddy;
        if next == v {
            return;
        }
        log::trace!("unbuddy {:?}", v);
        self.value_mut(v).buddy = v;
        let mut p = next;
        while self.value(p).buddy != v {
            p = self.value(p).buddy;
        }
        self.value_mut(p).buddy = next;
    }

    // Read constructors.

    fn push_read(&mut self, kind: ReadKind, size: u32) -> ReadId {
        let id = ReadId(self.reads.len() as u32);
        self.reads.push(Read {
            kind,
            size,
            value: None,
            event: None,
            event_next: None,
        });
        id
    }

    pub(crate) fn read_single(
        &mut self,
        size: u32,
        type_mask: TypeMask,
        register_mask: u64,
        frame_index: FrameIndex,
    ) -> ReadId {
        debug_assert!(
            type_mask != TypeMask::of(OperandType::Memory) || frame_index.exact().is_some(),
            "memory-only read needs an exact frame index"
        );
        self.push_read(
            ReadKind::Single {
                type_mask,
                register_mask,
                frame_index,
                next: None,
            },
            size,
        )
    }

    pub(crate) fn any_register_read(&mut self, size: u32) -> ReadId {
        self.read_single(
            size,
            TypeMask::of(OperandType::Register),
            ANY_REGISTER_MASK,
            FrameIndex::None,
        )
    }

    pub(crate) fn register_or_constant_read(&mut self, size: u32) -> ReadId {
        self.read_single(
            size,
            TypeMask::of(OperandType::Register).with(OperandType::Constant),
            ANY_REGISTER_MASK,
            FrameIndex::None,
        )
    }

    pub(crate) fn fixed_register_read(&mut self, size: u32, low: u8, high: Option<u8>) -> ReadId {
        let mask = match high {
            Some(high) => (1u64 << (high + 32)) | (1u64 << low),
            None => (ANY_REGISTER_MASK << 32) | (1u64 << low),
        };
        self.read_single(
            size,
            TypeMask::of(OperandType::Register),
            mask,
            FrameIndex::None,
        )
    }

    pub(crate) fn multi_read(&mut self, size: u32) -> ReadId {
        self.push_read(
            ReadKind::Multi {
                members: Vec::new(),
                targets: std::collections::VecDeque::new(),
                visited: false,
            },
            size,
        )
    }

    pub(crate) fn stub_read(&mut self, size: u32) -> ReadId {
        self.push_read(
            ReadKind::Stub {
                next: None,
                inner: None,
                visited: false,
            },
            size,
        )
    }

    /// Reserves a continuation slot in a multi-read for the future about
    /// to be recorded.
    pub(crate) fn multi_allocate_target(&mut self, r: ReadId) {
        match &mut self.read_mut(r).kind {
            ReadKind::Multi { targets, .. } => targets.push_back(None),
            _ => debug_assert!(false, "allocate_target on a non-multi read"),
        }
    }

    /// Pops the continuation for the next future in creation order.
    pub(crate) fn multi_next_target(&mut self, r: ReadId) -> Option<ReadId> {
        match &mut self.read_mut(r).kind {
            ReadKind::Multi { targets, .. } => targets.pop_front().flatten(),
            _ => {
                debug_assert!(false, "next_target on a non-multi read");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test_context;

    #[test]
    fn test_buddy_ring_splice() {
        let arena = bumpalo::Bump::new();
        let mut ctx = test_context(&arena);
        let a = ctx.new_value();
        let b = ctx.new_value();
        let c = ctx.new_value();

        // Link b and c into a's ring the way the buddy event does.
        ctx.value_mut(b).buddy = a;
        ctx.value_mut(a).buddy = b;
        ctx.value_mut(c).buddy = a;
        ctx.value_mut(b).buddy = c;

        let ring = ctx.ring(a);
        assert_eq!(ring.len(), 3);

        ctx.remove_buddy(c);
        assert_eq!(ctx.ring(a).len(), 2);
        assert_eq!(ctx.ring(c).len(), 1);
        assert_eq!(ctx.value(c).buddy, c);
    }

    #[test]
    fn test_read_queue_advances() {
        let arena = bumpalo::Bump::new();
        let mut ctx = test_context(&arena);
        let v = ctx.new_value();
        let r1 = ctx.any_register_read(8);
        let r2 = ctx.any_register_read(8);
        ctx.add_read(None, v, r1);
        ctx.add_read(None, v, r2);

        assert_eq!(ctx.value(v).reads, Some(r1));
        assert!(ctx.live(v));
        ctx.next_read(None, v);
        assert_eq!(ctx.value(v).reads, Some(r2));
        ctx.next_read(None, v);
        assert_eq!(ctx.value(v).reads, None);
        assert!(!ctx.live(v));
    }

    #[test]
    fn test_multi_read_targets_stay_separate() {
        let arena = bumpalo::Bump::new();
        let mut ctx = test_context(&arena);
        let v = ctx.new_value();
        let multi = ctx.multi_read(8);
        ctx.add_read(None, v, multi);

        // Future one.
        ctx.multi_allocate_target(multi);
        let alpha = ctx.any_register_read(8);
        ctx.add_read(None, v, alpha);

        // Future two.
        if let Some(value) = ctx.read(multi).value {
            ctx.value_mut(value).last_read = Some(multi);
        }
        ctx.multi_allocate_target(multi);
        let beta = ctx.register_or_constant_read(8);
        ctx.add_read(None, v, beta);

        assert_eq!(ctx.multi_next_target(multi), Some(alpha));
        assert_eq!(ctx.multi_next_target(multi), Some(beta));
    }

    #[test]
    fn test_stub_read_defers_to_inner() {
        let arena = bumpalo::Bump::new();
        let mut ctx = test_context(&arena);
        let stub = ctx.stub_read(8);

        // Unbound stubs report no constraint.
        let (tm, rm, fi) = ctx.read_constraints(stub);
        assert_eq!(tm, TypeMask::ALL);
        assert_eq!(rm, ANY_REGISTER_MASK);
        assert_eq!(fi, FrameIndex::Any);

        let inner = ctx.fixed_register_read(8, 2, None);
        if let ReadKind::Stub { inner: slot, .. } = &mut ctx.read_mut(stub).kind {
            *slot = Some(inner);
        }
        let (tm, rm, _) = ctx.read_constraints(stub);
        assert_eq!(tm, TypeMask::of(OperandType::Register));
        assert_eq!(rm & 0xffff_ffff, 1 << 2);
    }
}
