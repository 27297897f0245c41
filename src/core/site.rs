//! Polymorphic operand locations.
//!
//! A site is a concrete physical place a value currently lives in:
//! an immediate, a code/data address, one or two registers, or a memory
//! operand (a frame slot when based on the stack register). The four
//! kinds are a closed set, so they are a tagged variant rather than a
//! trait object; every variant shares the intrusive `next` link that
//! threads a value's site list.

use crate::assembler::{AsmOperand, OperandType, TypeMask};
use crate::error::{CompileError, CompileResult};

use super::context::Context;
use super::promise::PromiseId;

/// Handle to a pooled [`Site`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SiteId(pub(crate) u32);

impl std::fmt::Debug for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Frame-slot constraint carried by reads and consulted by memory sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameIndex {
    /// Any frame slot satisfies the read.
    Any,
    /// No frame slot satisfies the read.
    None,
    /// Exactly this slot.
    At(u32),
}

impl FrameIndex {
    pub fn intersect(self, other: FrameIndex) -> FrameIndex {
        match (self, other) {
            (FrameIndex::None, _) | (_, FrameIndex::None) => FrameIndex::None,
            (FrameIndex::Any, b) => b,
            (a, FrameIndex::Any) => a,
            (FrameIndex::At(a), FrameIndex::At(b)) if a == b => FrameIndex::At(a),
            _ => FrameIndex::None,
        }
    }

    pub fn exact(self) -> Option<u32> {
        match self {
            FrameIndex::At(i) => Some(i),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SiteKind {
    Constant {
        value: PromiseId,
    },
    Address {
        address: PromiseId,
    },
    /// `mask` constrains which registers may back the site before
    /// acquisition; `low`/`high` are the registers actually claimed.
    Register {
        mask: u64,
        low: Option<u8>,
        high: Option<u8>,
    },
    Memory {
        base: u8,
        offset: i32,
        index: Option<u8>,
        scale: u8,
    },
}

/// A pooled site. `next` links the owning value's site list.
#[derive(Debug)]
pub struct Site {
    pub kind: SiteKind,
    pub next: Option<SiteId>,
}

/// A detached, resource-free description of a site, storable in the
/// junction and saved site tables and re-materialised later.
#[derive(Debug, Clone, Copy)]
pub enum SiteRecord {
    Constant(PromiseId),
    Address(PromiseId),
    Register { mask: u64 },
    Memory { base: u8, offset: i32, index: Option<u8>, scale: u8 },
}

impl<'a> Context<'a> {
    fn push_site(&mut self, kind: SiteKind) -> SiteId {
        let id = SiteId(self.sites.len() as u32);
        self.sites.push(Site { kind, next: None });
        id
    }

    pub(crate) fn constant_site(&mut self, value: PromiseId) -> SiteId {
        self.push_site(SiteKind::Constant { value })
    }

    pub(crate) fn address_site(&mut self, address: PromiseId) -> SiteId {
        self.push_site(SiteKind::Address { address })
    }

    /// A register site pinned to concrete registers, e.g. the stack or
    /// thread register, or the return registers after a call.
    pub(crate) fn register_site(&mut self, low: u8, high: Option<u8>) -> SiteId {
        debug_assert!((low as u32) < self.arch.register_count);
        self.push_site(SiteKind::Register {
            mask: !0,
            low: Some(low),
            high,
        })
    }

    /// A register site that will pick any register in `mask` on
    /// acquisition.
    pub(crate) fn free_register_site(&mut self, mask: u64) -> SiteId {
        self.push_site(SiteKind::Register {
            mask,
            low: None,
            high: None,
        })
    }

    pub(crate) fn memory_site(
        &mut self,
        base: u8,
        offset: i32,
        index: Option<u8>,
        scale: u8,
    ) -> SiteId {
        self.push_site(SiteKind::Memory {
            base,
            offset,
            index,
            scale,
        })
    }

    /// The canonical frame-slot site for `frame_index`.
    pub(crate) fn frame_site(&mut self, frame_index: u32) -> SiteId {
        let base = self.arch.stack;
        let offset = self.frame_index_to_offset(frame_index) as i32;
        self.memory_site(base, offset, None, 1)
    }

    /// Whether the site satisfies a read's constraint triple.
    pub(crate) fn site_matches(
        &self,
        s: SiteId,
        type_mask: TypeMask,
        register_mask: u64,
        frame_index: FrameIndex,
    ) -> bool {
        match self.site(s).kind {
            SiteKind::Constant { .. } => type_mask.contains(OperandType::Constant),
            SiteKind::Address { .. } => type_mask.contains(OperandType::Address),
            SiteKind::Register { low, high, .. } => match low {
                Some(low) if type_mask.contains(OperandType::Register) => {
                    register_mask & (1 << low) != 0
                        && high.map_or(true, |h| register_mask & (1u64 << (h + 32)) != 0)
                }
                _ => false,
            },
            SiteKind::Memory { base, offset, index, .. } => {
                if !type_mask.contains(OperandType::Memory) {
                    return false;
                }
                if base == self.arch.stack {
                    debug_assert!(index.is_none());
                    match frame_index {
                        FrameIndex::Any => true,
                        FrameIndex::None => false,
                        FrameIndex::At(fi) => self.frame_index_to_offset(fi) as i32 == offset,
                    }
                } else {
                    true
                }
            }
        }
    }

    /// Cost of moving the site's contents to `target`; 0 when no move is
    /// needed.
    pub(crate) fn site_copy_cost(&self, s: SiteId, target: Option<SiteId>) -> u32 {
        if target == Some(s) {
            return 0;
        }
        match self.site(s).kind {
            SiteKind::Constant { .. } => 1,
            SiteKind::Address { .. } => 3,
            SiteKind::Register { low, high, .. } => {
                debug_assert!(low.is_some());
                let (low, high) = (low.unwrap_or(0), high);
                let matching = target.is_some_and(|t| match self.site(t).kind {
                    SiteKind::Register { mask, .. } => {
                        mask & (1 << low) != 0
                            && high.map_or(true, |h| mask & (1u64 << (h + 32)) != 0)
                    }
                    _ => false,
                });
                if matching {
                    0
                } else {
                    2
                }
            }
            SiteKind::Memory {
                base,
                offset,
                index,
                scale,
            } => {
                let matching = target.is_some_and(|t| match self.site(t).kind {
                    SiteKind::Memory {
                        base: b,
                        offset: o,
                        index: i,
                        scale: sc,
                    } => b == base && o == offset && i == index && sc == scale,
                    _ => false,
                });
                if matching {
                    0
                } else {
                    4
                }
            }
        }
    }

    pub(crate) fn site_operand_type(&self, s: SiteId) -> OperandType {
        match self.site(s).kind {
            SiteKind::Constant { .. } => OperandType::Constant,
            SiteKind::Address { .. } => OperandType::Address,
            SiteKind::Register { .. } => OperandType::Register,
            SiteKind::Memory { .. } => OperandType::Memory,
        }
    }

    pub(crate) fn site_as_operand(&self, s: SiteId) -> CompileResult<AsmOperand> {
        match self.site(s).kind {
            SiteKind::Constant { value } => Ok(AsmOperand::Constant(value)),
            SiteKind::Address { address } => Ok(AsmOperand::Address(address)),
            SiteKind::Register { low, high, .. } => match low {
                Some(low) => Ok(AsmOperand::Register { low, high }),
                None => Err(CompileError::Inconsistent(
                    "register site used as operand before acquisition",
                )),
            },
            SiteKind::Memory {
                base,
                offset,
                index,
                scale,
            } => Ok(AsmOperand::Memory {
                base,
                offset,
                index,
                scale,
            }),
        }
    }

    /// Detached copy for the junction and saved site tables.
    pub(crate) fn site_record(&self, s: SiteId) -> SiteRecord {
        match self.site(s).kind {
            SiteKind::Constant { value } => SiteRecord::Constant(value),
            SiteKind::Address { address } => SiteRecord::Address(address),
            SiteKind::Register { mask, low, high } => {
                let mask = match low {
                    Some(low) => {
                        (1u64 << low) | high.map_or(0, |h| 1u64 << (h + 32))
                    }
                    None => mask,
                };
                SiteRecord::Register { mask }
            }
            SiteKind::Memory {
                base,
                offset,
                index,
                scale,
            } => SiteRecord::Memory {
                base,
                offset,
                index,
                scale,
            },
        }
    }

    pub(crate) fn materialize_record(&mut self, record: SiteRecord) -> SiteId {
        match record {
            SiteRecord::Constant(value) => self.constant_site(value),
            SiteRecord::Address(address) => self.address_site(address),
            SiteRecord::Register { mask } => self.free_register_site(mask),
            SiteRecord::Memory {
                base,
                offset,
                index,
                scale,
            } => self.memory_site(base, offset, index, scale),
        }
    }

    pub(crate) fn site_uses_register(&self, s: SiteId, register: u8) -> bool {
        match self.site(s).kind {
            SiteKind::Register { low, high, .. } => {
                low == Some(register) || high == Some(register)
            }
            SiteKind::Memory { base, index, .. } => {
                base == register || index == Some(register)
            }
            _ => false,
        }
    }

    /// Blocks the site's registers from eviction while move code for a
    /// sibling is generated. Only register sites hold evictable
    /// resources, the other kinds ignore this.
    pub(crate) fn site_freeze(&mut self, s: SiteId) {
        if let SiteKind::Register { low, high, .. } = self.site(s).kind {
            if let Some(low) = low {
                self.freeze_register(low);
            }
            if let Some(high) = high {
                self.freeze_register(high);
            }
        }
    }

    pub(crate) fn site_thaw(&mut self, s: SiteId) {
        if let SiteKind::Register { low, high, .. } = self.site(s).kind {
            if let Some(low) = low {
                self.thaw_register(low);
            }
            if let Some(high) = high {
                self.thaw_register(high);
            }
        }
    }

    /// Returns the site's resources to their tables.
    pub(crate) fn site_release(&mut self, s: SiteId) {
        match self.site(s).kind {
            SiteKind::Constant { .. } | SiteKind::Address { .. } => {}
            SiteKind::Register { low, high, .. } => {
                debug_assert!(low.is_some());
                if let Some(low) = low {
                    self.release_register(low);
                }
                if let Some(high) = high {
                    self.release_register(high);
                }
            }
            SiteKind::Memory { base, offset, index, .. } => {
                if base == self.arch.stack {
                    debug_assert!(index.is_none());
                    let fi = self.offset_to_frame_index(offset as u32);
                    self.release_frame_index(fi, true);
                }
                self.decrement_register(base);
                if let Some(index) = index {
                    self.decrement_register(index);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test_context;

    #[test]
    fn test_copy_costs() {
        let arena = bumpalo::Bump::new();
        let mut ctx = test_context(&arena);
        ctx.init(1, 0, 0, 4);

        let p = ctx.resolved_promise(42);
        let constant = ctx.constant_site(p);
        let address = ctx.address_site(p);
        let register = ctx.register_site(3, None);
        let narrow = ctx.free_register_site(1 << 3);
        let elsewhere = ctx.free_register_site(1 << 5);
        let memory = ctx.memory_site(2, 16, None, 1);
        let same_memory = ctx.memory_site(2, 16, None, 1);
        let other_memory = ctx.memory_site(2, 24, None, 1);

        assert_eq!(ctx.site_copy_cost(constant, None), 1);
        assert_eq!(ctx.site_copy_cost(address, None), 3);
        assert_eq!(ctx.site_copy_cost(register, None), 2);
        assert_eq!(ctx.site_copy_cost(register, Some(register)), 0);
        assert_eq!(ctx.site_copy_cost(register, Some(narrow)), 0);
        assert_eq!(ctx.site_copy_cost(register, Some(elsewhere)), 2);
        assert_eq!(ctx.site_copy_cost(memory, None), 4);
        assert_eq!(ctx.site_copy_cost(memory, Some(same_memory)), 0);
        assert_eq!(ctx.site_copy_cost(memory, Some(other_memory)), 4);
    }

    #[test]
    fn test_register_site_matching() {
        let arena = bumpalo::Bump::new();
        let mut ctx = test_context(&arena);
        ctx.init(1, 0, 0, 4);

        let register = ctx.register_site(3, None);
        let reg_mask = TypeMask::of(OperandType::Register);
        assert!(ctx.site_matches(register, reg_mask, 1 << 3, FrameIndex::None));
        assert!(!ctx.site_matches(register, reg_mask, 1 << 4, FrameIndex::None));
        assert!(!ctx.site_matches(
            register,
            TypeMask::of(OperandType::Memory),
            !0,
            FrameIndex::Any
        ));

        // An unacquired register site matches nothing yet.
        let free = ctx.free_register_site(!0);
        assert!(!ctx.site_matches(free, reg_mask, !0, FrameIndex::None));
    }

    #[test]
    fn test_frame_slot_matching() {
        let arena = bumpalo::Bump::new();
        let mut ctx = test_context(&arena);
        ctx.init(1, 0, 0, 4);

        let slot = ctx.frame_site(2);
        let mem_mask = TypeMask::of(OperandType::Memory);
        assert!(ctx.site_matches(slot, mem_mask, 0, FrameIndex::Any));
        assert!(ctx.site_matches(slot, mem_mask, 0, FrameIndex::At(2)));
        assert!(!ctx.site_matches(slot, mem_mask, 0, FrameIndex::At(3)));
        assert!(!ctx.site_matches(slot, mem_mask, 0, FrameIndex::None));
    }

    #[test]
    fn test_frame_index_intersection() {
        use FrameIndex::*;
        assert_eq!(Any.intersect(At(3)), At(3));
        assert_eq!(At(3).intersect(Any), At(3));
        assert_eq!(At(3).intersect(At(3)), At(3));
        assert_eq!(At(3).intersect(At(4)), None);
        assert_eq!(None.intersect(Any), None);
        assert_eq!(Any.intersect(None), None);
        assert_eq!(Any.intersect(Any), Any);
    }
}
