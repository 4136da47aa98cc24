//! A transactional x86/x86-64 inline-hooking engine.
//!
//! A hook replaces the first few bytes of a target function's prologue with
//! a jump to a callback, relocating the displaced instructions into a
//! trampoline so the original function remains callable. Everything that
//! touches a patch site — allocating the trampoline, writing the jump,
//! migrating any thread caught mid-prologue — goes through a
//! [`transaction::Transaction`]: at most one is open process-wide, and
//! `commit` either applies every queued install/remove or reverts all of
//! them, so a process never observes a half-applied hook.
//!
//! ## Layout
//!
//! - [`analysis`] decodes a target's prologue far enough to free up room
//!   for the patch jump.
//! - [`relocate`] rewrites the displaced instructions (RIP-relative
//!   operands, short branches that no longer reach) into a trampoline.
//! - [`arena`] carves trampolines out of executable memory within a signed
//!   32-bit displacement of the functions that need them.
//! - [`trampoline`] ties analysis, relocation and the arena together into a
//!   single built trampoline.
//! - [`migrate`] and [`barrier`] keep a hook safe to install, remove and
//!   reenter while other threads run through it.
//! - [`transaction`] is the only entry point that actually writes to a
//!   patch site.
//! - [`hook`] wraps a transaction in a typed, single-target/callback
//!   convenience type.
//! - [`platform`] is the narrow OS-specific surface (memory protection,
//!   cache flushing, thread suspension) everything above is written
//!   against.

#[macro_use]
mod macros;

pub mod analysis;
pub mod arena;
pub mod barrier;
mod constants;
pub mod error;
pub mod hook;
mod jump;
pub mod migrate;
pub mod platform;
pub mod relocate;
pub mod traits;
pub mod trampoline;
pub mod transaction;
pub mod translation;

pub use error::Error;
pub use hook::InlineHook;
pub use traits::Function;
pub use transaction::{CommitFailure, Transaction};
