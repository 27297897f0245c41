//! Core backend infrastructure.
//!
//! This module tree holds the machinery the front-end API is built on:
//!
//! - [`context`] - the compilation context: node pools, resource tables,
//!   frame geometry and per-compilation state
//! - [`promise`] - deferred integers resolved after layout
//! - [`frame`] - operand-stack elements, locals snapshots and frame walks
//! - [`site`] - polymorphic operand locations
//! - [`value`] - values, buddy rings and the read queue
//! - [`regalloc`] - register and frame-slot selection, eviction and moves
//! - [`event`] - per-operation graph nodes and their compile methods
//! - [`fork`] - speculative fork state and junction bookkeeping
//! - [`pass`] - the final walk that assigns sites and drives the assembler
//! - [`test_utils`] - a mock architecture and recording assembler

pub mod context;
pub mod event;
pub mod fork;
pub mod frame;
pub mod pass;
pub mod promise;
pub mod regalloc;
pub mod site;
pub mod test_utils;
pub mod value;

pub use context::Context;
pub use promise::PromiseId;
pub use site::{FrameIndex, SiteId};
pub use value::{ReadId, ValueId};
