//! OS primitives the engine treats as black-box collaborators (§1, §4.9):
//! executable memory mapping/protection, instruction-cache flushing, and
//! thread enumeration/suspension/IP access. Everything above this module is
//! written against the narrow interfaces here, not against `winapi`/`libc`
//! directly.

pub mod memory;
pub mod thread;
