//! Protection changes and instruction-cache flushing (§4.9), wrapping
//! `region` the same way the teacher's `util::is_executable_address` and
//! `arch::detour::Detour::toggle` do.

use crate::error::Result;

/// Returns `true` if `address` is currently mapped executable.
pub fn is_executable(address: *const ()) -> Result<bool> {
  Ok(region::query(address)?.protection.contains(region::Protection::EXECUTE))
}

/// Flips the page(s) covering `[address, address + len)` to
/// read-write-execute for the duration of `f`, then restores whatever
/// protection they had before. Used to patch a live patch site (the jump
/// written over a function's prologue) or to restore its original bytes on
/// `remove`, both of which touch memory this crate doesn't own the mapping
/// of — unlike a trampoline region, there's no at-rest protection to return
/// to beyond "whatever it was".
pub fn with_writable<T>(address: *const (), len: usize, f: impl FnOnce() -> T) -> Result<T> {
  let _guard = region::protect_with_handle(address, len, region::Protection::READ_WRITE_EXECUTE)?;
  Ok(f())
}

/// Flushes the instruction cache for `[address, address + len)` after a
/// patch is written.
///
/// x86/x86-64 is cache-coherent for self-modifying code once the
/// protection-changing syscall that made the page writable (and, on
/// commit, writable-again-then-executable) has executed — there's no
/// separate "iflush" instruction the way there is on ARM. This is still
/// called at every patch site so the abstraction stays uniform with any
/// future non-x86 backend, and so the commit sequence visibly performs the
/// step the specification calls for rather than silently relying on x86
/// semantics.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub fn flush_instruction_cache(_address: *const (), _len: usize) {}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn flush_is_callable_without_panicking() {
    let buf = [0u8; 16];
    flush_instruction_cache(buf.as_ptr() as *const (), buf.len());
  }
}
