//! Error types for the backend.
//!
//! Using thiserror for more idiomatic error handling. Every variant is a
//! programmer error in the sense of the front-end contract: an `Err` from
//! the compile pass means the compilation is abandoned, there is no
//! recovery within it.

use thiserror::Error;

/// Fatal compilation failures.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("promise read before resolution")]
    UnresolvedPromise,

    #[error("no allocatable register satisfies mask {mask:#x}")]
    RegisterAllocation { mask: u64 },

    #[error("cannot evict value: no save site is derivable")]
    StealFailure,

    #[error("inconsistent compiler state: {0}")]
    Inconsistent(&'static str),
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
