//! Deferred integers resolved after layout.
//!
//! A promise stands for a machine offset, a constant-pool slot or the
//! start of a logical instruction. All of them become resolvable exactly
//! when the machine-code base address is known, i.e. after
//! [`Compiler::write_to`](crate::Compiler::write_to); reading one earlier
//! is a fatal [`CompileError::UnresolvedPromise`]
//! (crate::CompileError::UnresolvedPromise). Promises are pooled in the
//! [`Context`](super::context::Context) and addressed by id.

use crate::assembler::OffsetToken;

/// Handle to a pooled [`Promise`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PromiseId(pub(crate) u32);

impl std::fmt::Debug for PromiseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// A deferred integer.
#[derive(Debug, Clone, Copy)]
pub enum Promise {
    /// Already known, independent of layout.
    Resolved { value: i64 },

    /// Address of slot `index` of the constant pool appended after the
    /// emitted code.
    Pool { index: u32 },

    /// Address of a position inside the emitted code. `token` is pinned
    /// while events compile; `offset` is finalised once blocks resolve.
    Code {
        token: Option<OffsetToken>,
        offset: Option<u32>,
    },

    /// Address of the first instruction of a logical instruction.
    Ip { logical_ip: u32 },
}
