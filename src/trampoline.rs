//! The trampoline builder (§4.5): turns an analyzed prologue into a fully
//! populated [`arena::chunk::Chunk`] — the callback jump, the relocated
//! prologue, the back-jump to the instructions the patch left behind, and
//! the bookkeeping (`original_code`, the translation map) `remove` and the
//! thread migrator need later.
//!
//! Grounded in `original_source/include/Zyrex/Internal/Trampoline.h`'s
//! `ZyrexTrampoline` struct shape; `Trampoline.c` itself is an unimplemented
//! stub in the original, so the actual build sequence below follows the
//! specification's textual description rather than a ported routine.

use crate::analysis::analyze_prologue;
use crate::arena::chunk::Chunk;
use crate::arena::{self, ChunkHandle};
use crate::constants::{MAX_PROLOGUE_READ_LENGTH, SIZEOF_ABSOLUTE_JUMP};
use crate::error::Result;
use crate::jump;
use crate::relocate;
use crate::translation::TranslationMap;

/// A built trampoline: a chunk holding the relocated prologue, the callback
/// jump and the back-jump, ready to be wired into a patch site.
pub struct Trampoline {
  chunk: *mut Chunk,
}

unsafe impl Send for Trampoline {}

impl Trampoline {
  /// Address of the first instruction a hooked caller should jump to —
  /// `code_buffer`'s address. This is the value `install` hands back to its
  /// caller, and the value `remove` is later given to locate this chunk.
  pub fn code_buffer_address(&self) -> usize {
    unsafe { (*self.chunk).code_buffer_address() }
  }

  /// Releases the underlying chunk back to the arena. Must only be called
  /// once the patch site no longer references this trampoline and no thread
  /// is executing inside it.
  pub fn release(self) -> Result<()> {
    arena::release_chunk(self.code_buffer_address())
  }
}

/// Everything a transaction needs to install, revert or remove a hook,
/// recovered from a chunk that's either just been built or was returned by
/// an earlier `install`.
pub struct TrampolineSnapshot {
  /// Address of the first byte of the hooked function.
  pub patch_site: usize,
  /// Number of bytes of `patch_site` the installing jump overwrites.
  pub prologue_length: usize,
  pub code_buffer_address: usize,
  /// Number of bytes actually written to `code_buffer` (relocated prologue
  /// plus back-jump); the boundary the thread migrator must check against,
  /// not the buffer's full worst-case capacity.
  pub code_buffer_size: usize,
  /// Address of the chunk's callback-jump stub — what the patch-site jump
  /// targets.
  pub callback_jump_address: usize,
  /// The exact bytes `patch_site` held before this trampoline's jump
  /// overwrote them.
  pub original_bytes: Vec<u8>,
  pub translation_map: TranslationMap,
}

/// Recovers a [`TrampolineSnapshot`] from a `code_buffer` address, by
/// reversing it back into the owning [`Chunk`] and reading its fields. Used
/// both right after `build` and by `remove`, which only ever receives the
/// `code_buffer` address back from its caller.
///
/// # Safety
///
/// `code_buffer_address` must be a value previously returned by
/// [`Trampoline::code_buffer_address`] on a still-allocated chunk.
pub unsafe fn inspect(code_buffer_address: usize) -> TrampolineSnapshot {
  let chunk = Chunk::from_code_buffer_address(code_buffer_address);
  let prologue_length = (*chunk).original_code_size as usize;
  TrampolineSnapshot {
    patch_site: (*chunk).backjump_address - prologue_length,
    prologue_length,
    code_buffer_address,
    code_buffer_size: (*chunk).code_buffer_size as usize,
    callback_jump_address: std::ptr::addr_of!((*chunk).callback_jump) as usize,
    original_bytes: (*chunk).original_code_bytes().to_vec(),
    translation_map: (*chunk).translation_map(),
  }
}

/// Builds a trampoline for the function prologue at `target`, dispatching
/// to `callback`. Allocates a chunk within a signed 32-bit displacement of
/// `target` and of every external target the prologue's relative
/// instructions resolve to (§4.4: those references still have to fit a
/// 32-bit displacement once relocated), analyzes and relocates the
/// prologue into it, and wires up both jumps.
pub fn build(target: usize, callback: usize) -> Result<Trampoline> {
  // Safety: the caller (the transaction) guarantees `target` is the address
  // of a live, readable function; `MAX_PROLOGUE_READ_LENGTH` is a
  // conservative bound on how far the analyzer can ever need to read.
  let code = unsafe { std::slice::from_raw_parts(target as *const u8, MAX_PROLOGUE_READ_LENGTH) };
  let prologue = analyze_prologue(code, target)?;
  let prologue_length = prologue.total_length();

  let (addr_lo, addr_hi) = range_window(target, &prologue);
  let ChunkHandle { chunk } = arena::find_or_allocate_chunk(addr_lo, addr_hi)?;

  let populate = arena::with_chunk_writable(chunk, || unsafe {
    populate_chunk(chunk, target, callback, &prologue, prologue_length, code)
  });

  match populate {
    Ok(Ok(())) => Ok(Trampoline { chunk }),
    Ok(Err(err)) => {
      let _ = arena::release_chunk(unsafe { (*chunk).code_buffer_address() });
      Err(err)
    }
    Err(err) => Err(err),
  }
}

/// The `[addr_lo, addr_hi]` window every chunk slot the arena hands back
/// must stay within ±2 GiB of (§4.4): `target` itself, widened to also
/// cover every absolute address a relative operand in the prologue
/// resolves to. A branch or RIP-relative load that already reaches 3 GiB
/// away from `target` still has to reach that same address once relocated
/// next to `target`'s trampoline, so the arena has to search for a chunk
/// in range of both ends, not just the patch site.
fn range_window(target: usize, prologue: &crate::analysis::AnalyzedPrologue) -> (usize, usize) {
  let mut lo = target;
  let mut hi = target;
  for instruction in &prologue.instructions {
    if let Some(operand) = instruction.decoded.relative_operand {
      let addr = operand.absolute_target as usize;
      lo = lo.min(addr);
      hi = hi.max(addr);
    }
  }
  (lo, hi)
}

/// Writes every part of the trampoline into an already-writable `chunk`.
///
/// # Safety
///
/// `chunk` must point at a writable, exclusively-owned chunk (the region's
/// protection must already be flipped to read-write-execute).
unsafe fn populate_chunk(
  chunk: *mut Chunk,
  target: usize,
  callback: usize,
  prologue: &crate::analysis::AnalyzedPrologue,
  prologue_length: usize,
  original_bytes: &[u8],
) -> Result<()> {
  (*chunk).in_use = 1;

  (*chunk).callback_address = callback;
  let callback_slot = std::ptr::addr_of!((*chunk).callback_address) as usize;
  jump::write_absolute_jump((*chunk).callback_jump.as_mut_ptr(), callback_slot);

  let dest_ptr = (*chunk).code_buffer.as_mut_ptr();
  let capacity = (*chunk).code_buffer.len();
  let saved_original_code = (*chunk).original_code.as_ptr() as usize;

  let relocated = relocate::relocate(prologue, target, dest_ptr, capacity, saved_original_code)?;

  let backjump_offset = relocated.bytes_written;
  let backjump_target = target + prologue_length;
  (*chunk).backjump_address = backjump_target;
  let backjump_slot = std::ptr::addr_of!((*chunk).backjump_address) as usize;
  jump::write_absolute_jump(dest_ptr.add(backjump_offset), backjump_slot);

  let used = backjump_offset + SIZEOF_ABSOLUTE_JUMP;
  if used < capacity {
    std::ptr::write_bytes(dest_ptr.add(used), 0xCC, capacity - used);
  }
  (*chunk).code_buffer_size = used as u8;

  let original_code_capacity = (*chunk).original_code.len();
  if prologue_length > original_code_capacity {
    return Err(crate::error::Error::OutOfRange);
  }
  (*chunk).original_code[..prologue_length].copy_from_slice(&original_bytes[..prologue_length]);
  (*chunk).original_code_size = prologue_length as u8;

  (*chunk).set_translation_map(&relocated.translation_map);

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builds_trampoline_for_straight_line_prologue() {
    // `build` reads up to MAX_PROLOGUE_READ_LENGTH bytes from `target`
    // regardless of how many the analyzer ends up decoding, so the backing
    // buffer needs to be at least that long to stay in bounds. All NOPs:
    // the analyzer only ever looks at the first MIN_BYTES_TO_RELOCATE of
    // them before it stops.
    let code = vec![0x90u8; MAX_PROLOGUE_READ_LENGTH];
    let target = code.as_ptr() as usize;

    let callback = 0x1234_5678usize;
    let trampoline = build(target, callback).expect("trampoline build should succeed");
    let snapshot = unsafe { inspect(trampoline.code_buffer_address()) };

    assert!(snapshot.prologue_length >= crate::constants::MIN_BYTES_TO_RELOCATE);
    assert_eq!(snapshot.patch_site, target);
    assert_eq!(snapshot.original_bytes, &code[..snapshot.prologue_length]);
    assert!(!snapshot.translation_map.items().is_empty());

    trampoline.release().unwrap();
  }
}
