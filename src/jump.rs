//! Machine-code emitters for the two jump forms the engine ever writes
//! (§4.1): a 5-byte relative near-jump, and a 6-byte indirect absolute jump
//! that dispatches through an adjacent pointer slot.
//!
//! Neither function range-checks its displacement — callers (the arena and
//! the relocator) are responsible for only ever calling these once the
//! destination is known to be reachable.

use crate::constants::{SIZEOF_ABSOLUTE_JUMP, SIZEOF_RELATIVE_JUMP};
use std::ptr;

/// Writes `E9 <disp32>` at `address`, jumping to `destination`.
///
/// # Safety
///
/// `address` must be valid, writable for `SIZEOF_RELATIVE_JUMP` bytes, and
/// the caller must guarantee `destination` is reachable with a signed
/// 32-bit displacement from `address + 5`.
pub unsafe fn write_relative_jump(address: *mut u8, destination: usize) {
  let disp = (destination as isize).wrapping_sub(address as isize + SIZEOF_RELATIVE_JUMP as isize);
  debug_assert!(disp >= i32::MIN as isize && disp <= i32::MAX as isize);

  ptr::write(address, 0xE9);
  ptr::write_unaligned(address.add(1) as *mut i32, disp as i32);
}

/// Writes `FF 25 <disp32>` at `address`: an indirect jump that dereferences
/// the pointer stored at `pointer_slot` and jumps there.
///
/// On 64-bit targets this is `jmp [rip+disp32]`, so `disp32` is the
/// distance from the end of the instruction to `pointer_slot`. On 32-bit
/// targets `FF 25` takes a bare 32-bit absolute address, so `disp32` is
/// simply `pointer_slot`.
///
/// # Safety
///
/// `address` must be valid and writable for `SIZEOF_ABSOLUTE_JUMP` bytes.
pub unsafe fn write_absolute_jump(address: *mut u8, pointer_slot: usize) {
  ptr::write(address, 0xFF);
  ptr::write(address.add(1), 0x25);

  #[cfg(target_pointer_width = "64")]
  let disp = (pointer_slot as isize).wrapping_sub(address as isize + SIZEOF_ABSOLUTE_JUMP as isize);
  #[cfg(target_pointer_width = "32")]
  let disp = pointer_slot as isize;

  debug_assert!(disp >= i32::MIN as isize && disp <= i32::MAX as isize);
  ptr::write_unaligned(address.add(2) as *mut i32, disp as i32);
}

/// Writes `EB 05`: a 2-byte short jump skipping exactly five bytes. Used by
/// the `JCXZ`/`LOOP` rewrite (§4.3) to jump from "case-not-taken" past the
/// 5-byte absolute-target jump that implements "case-taken".
pub unsafe fn write_short_jump_over_rel32(address: *mut u8) {
  ptr::write(address, 0xEB);
  ptr::write(address.add(1), 0x05);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn relative_jump_encodes_e9_and_disp32() {
    let mut buf = [0u8; 5];
    let base = buf.as_mut_ptr();
    unsafe { write_relative_jump(base, base as usize + 5 + 0x100) };
    assert_eq!(buf[0], 0xE9);
    assert_eq!(i32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]), 0x100);
  }

  #[test]
  fn relative_jump_handles_negative_displacement() {
    let mut buf = [0u8; 5];
    let base = buf.as_mut_ptr();
    let destination = base as usize - 0x40;
    unsafe { write_relative_jump(base, destination) };
    let disp = i32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
    assert_eq!(disp, -0x40 - 5);
  }

  #[test]
  fn absolute_jump_encodes_ff_25() {
    let mut buf = [0u8; 6];
    let base = buf.as_mut_ptr();
    let slot = base as usize + 64;
    unsafe { write_absolute_jump(base, slot) };
    assert_eq!(buf[0], 0xFF);
    assert_eq!(buf[1], 0x25);

    #[cfg(target_pointer_width = "64")]
    {
      let disp = i32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
      assert_eq!(disp as isize, slot as isize - (base as isize + 6));
    }
  }

  #[test]
  fn short_jump_skips_five_bytes() {
    let mut buf = [0u8; 2];
    unsafe { write_short_jump_over_rel32(buf.as_mut_ptr()) };
    assert_eq!(buf, [0xEB, 0x05]);
  }
}
