//! The relocator (§4.3): copies an analyzed prologue into a trampoline's
//! code buffer, rewriting every relative operand so it still resolves to
//! the same absolute address once the code lives at a different location.
//!
//! Each instruction is handled by exactly one of four policies:
//!
//!  - **verbatim** — no relative operand, copied byte-for-byte.
//!  - **internal branch** — targets another instruction inside the same
//!    prologue; copied verbatim first, then its offset field is overwritten
//!    once every instruction's destination offset is known (§4.3.3).
//!  - **external branch/RIP-relative** — targets something outside the
//!    prologue; rewritten in place with a recomputed displacement, enlarging
//!    8/16-bit branches to the 32-bit form where needed (§4.3.2).
//!  - **JCXZ/LOOP family** — has no 32-bit encoding, so it is expanded into
//!    three destination instructions (§4.3.3).
//!
//! `CALL` is rejected outright: relocating a call would require the pushed
//! return address to still point into the original function, which the
//! engine cannot guarantee.

use crate::analysis::AnalyzedPrologue;
use crate::constants::MAX_DISPLACEMENT_RANGE;
use crate::error::{Error, Result};
use crate::jump;
use crate::translation::TranslationMap;

/// The result of relocating a prologue into a trampoline buffer.
pub struct RelocatedCode {
  /// Number of bytes written to the destination buffer.
  pub bytes_written: usize,
  /// Source-offset/destination-offset pairs for every relocated
  /// instruction (plus, for JCXZ/LOOP expansions, the synthetic
  /// instructions that replaced it).
  pub translation_map: TranslationMap,
}

/// A fixup that must be applied only after every instruction has been
/// copied and its destination offset is known (an internal branch to an
/// instruction relocated later in the buffer).
struct PendingInternalFixup {
  /// Offset, in the destination buffer, of the operand field to patch.
  field_offset: usize,
  /// Width of the operand field.
  field_size: usize,
  /// Absolute source address the branch targets.
  target_source_address: usize,
  /// Address of the instruction *after* the rewritten branch, i.e. the base
  /// the new displacement is computed from.
  branch_end_address: usize,
}

/// Relocates `prologue` (decoded starting at `source`) into `destination`,
/// which must have room for at least `destination.len()` bytes and be
/// writable.
///
/// # Safety
///
/// `destination` must point at writable memory at least
/// `destination_capacity` bytes long.
pub unsafe fn relocate(
  prologue: &AnalyzedPrologue,
  source: usize,
  destination: *mut u8,
  destination_capacity: usize,
  saved_original_code: usize,
) -> Result<RelocatedCode> {
  let mut translation_map = TranslationMap::new();
  let mut pending_fixups = Vec::new();
  let mut write_offset = 0usize;

  // Destination offset of each source instruction, indexed by its position
  // in `prologue.instructions`, filled in as we go so internal-branch
  // fixups can resolve a forward reference once the pass completes.
  let mut destination_offsets = vec![0usize; prologue.instructions.len()];

  for (index, instruction) in prologue.instructions.iter().enumerate() {
    let decoded = &instruction.decoded;
    destination_offsets[index] = write_offset;
    let source_offset = (instruction.address() - source) as u8;

    if decoded.is_call {
      return Err(Error::UnsupportedInstruction);
    }

    let dest_ptr = destination.add(write_offset);
    let remaining = destination_capacity
      .checked_sub(write_offset)
      .ok_or(Error::OutOfRange)?;

    if decoded.is_loop_family {
      write_offset += relocate_loop_family(
        decoded,
        dest_ptr,
        remaining,
        source_offset,
        write_offset,
        &mut translation_map,
      )?;
      continue;
    }

    // Every other instruction produces exactly one destination instruction,
    // so its translation entry is just its own (source, destination) pair —
    // unlike the loop-family expansion above, which records the two bonus
    // instructions it introduces under the same `source_offset` itself.
    translation_map.push(source_offset, write_offset as u8);

    let Some(operand) = decoded.relative_operand else {
      // No relative operand: copy verbatim.
      if decoded.len() > remaining {
        return Err(Error::OutOfRange);
      }
      std::ptr::copy_nonoverlapping(decoded.bytes.as_ptr(), dest_ptr, decoded.len());
      write_offset += decoded.len();
      continue;
    };

    let target = operand.absolute_target as usize;
    let prologue_start = source;
    let prologue_end = source + prologue.total_length();
    let is_internal = target >= prologue_start && target < prologue_end;

    if is_internal {
      if decoded.len() > remaining {
        return Err(Error::OutOfRange);
      }
      std::ptr::copy_nonoverlapping(decoded.bytes.as_ptr(), dest_ptr, decoded.len());
      pending_fixups.push(PendingInternalFixup {
        field_offset: write_offset + operand.field_offset,
        field_size: operand.field_size,
        target_source_address: target,
        branch_end_address: write_offset + decoded.len(),
      });
      write_offset += decoded.len();
      continue;
    }

    // External target: RIP-relative memory operands and branch immediates
    // both need a recomputed displacement against the new address. 8/16-bit
    // branch immediates are enlarged to the 32-bit `0F 8x` form first.
    if operand.is_memory_displacement {
      write_offset += relocate_rip_relative(
        decoded,
        operand,
        dest_ptr,
        remaining,
        prologue_start,
        prologue_end,
        saved_original_code,
      )?;
    } else if decoded.is_short_conditional_jump {
      write_offset += relocate_enlarged_conditional(decoded, target, dest_ptr, remaining)?;
    } else {
      write_offset += relocate_external_branch(decoded, operand, target, dest_ptr, remaining)?;
    }
  }

  // Resolve internal-branch fixups now that every destination offset is
  // known.
  for fixup in pending_fixups {
    let target_index = prologue
      .instructions
      .iter()
      .position(|i| i.address() == fixup.target_source_address)
      .ok_or(Error::UnsupportedInstruction)?;
    let target_destination = destination.add(destination_offsets[target_index]);
    let branch_end_destination = destination.add(fixup.branch_end_address);
    write_signed_displacement(
      destination.add(fixup.field_offset),
      fixup.field_size,
      target_destination as isize - branch_end_destination as isize,
    )?;
  }

  Ok(RelocatedCode {
    bytes_written: write_offset,
    translation_map,
  })
}

/// Copies a RIP-relative instruction, recomputing its displacement. If the
/// operand targets somewhere inside the prologue being relocated (i.e. the
/// instruction reads its own, about-to-be-overwritten bytes as data), the
/// displacement is instead pointed at the trampoline's saved copy of the
/// original bytes — see §4.3.4: by the time the trampoline runs, the live
/// bytes at that range have been overwritten with the hook jump, so the only
/// place those bytes still exist is `chunk.original_code`.
unsafe fn relocate_rip_relative(
  decoded: &crate::analysis::decoder::DecodedInstruction,
  operand: crate::analysis::decoder::RelativeOperand,
  dest_ptr: *mut u8,
  remaining: usize,
  prologue_start: usize,
  prologue_end: usize,
  saved_original_code: usize,
) -> Result<usize> {
  if decoded.len() > remaining {
    return Err(Error::OutOfRange);
  }
  std::ptr::copy_nonoverlapping(decoded.bytes.as_ptr(), dest_ptr, decoded.len());

  let target = operand.absolute_target as usize;
  let resolved_target = if target >= prologue_start && target < prologue_end {
    saved_original_code + (target - prologue_start)
  } else {
    target
  };

  let field_address = dest_ptr.add(operand.field_offset);
  let next_instruction = dest_ptr.add(decoded.len());
  write_signed_displacement(
    field_address,
    operand.field_size,
    resolved_target as isize - next_instruction as isize,
  )?;
  Ok(decoded.len())
}

/// Rewrites an external branch immediate, enlarging it to 32 bits if it
/// isn't already.
unsafe fn relocate_external_branch(
  decoded: &crate::analysis::decoder::DecodedInstruction,
  operand: crate::analysis::decoder::RelativeOperand,
  target: usize,
  dest_ptr: *mut u8,
  remaining: usize,
) -> Result<usize> {
  if operand.field_size == 4 {
    if decoded.len() > remaining {
      return Err(Error::OutOfRange);
    }
    std::ptr::copy_nonoverlapping(decoded.bytes.as_ptr(), dest_ptr, decoded.len());
    let field_address = dest_ptr.add(operand.field_offset);
    let next_instruction = dest_ptr.add(decoded.len());
    write_signed_displacement(
      field_address,
      4,
      target as isize - next_instruction as isize,
    )?;
    return Ok(decoded.len());
  }

  relocate_enlarged_conditional(decoded, target, dest_ptr, remaining)
}

/// Builds the enlarged `0F 8x rel32` form of a short conditional jump (or,
/// for an already-near unconditional jump being rebased, a plain `E9
/// rel32`).
unsafe fn relocate_enlarged_conditional(
  decoded: &crate::analysis::decoder::DecodedInstruction,
  target: usize,
  dest_ptr: *mut u8,
  remaining: usize,
) -> Result<usize> {
  if let Some(condition_code) = decoded.condition_code {
    const LEN: usize = 6;
    if LEN > remaining {
      return Err(Error::OutOfRange);
    }
    std::ptr::write(dest_ptr, 0x0F);
    std::ptr::write(dest_ptr.add(1), 0x80 | condition_code);
    let next_instruction = dest_ptr.add(LEN);
    write_signed_displacement(dest_ptr.add(2), 4, target as isize - next_instruction as isize)?;
    Ok(LEN)
  } else {
    // Unconditional jump with a non-32-bit immediate: rebase onto E9.
    const LEN: usize = crate::constants::SIZEOF_RELATIVE_JUMP;
    if LEN > remaining {
      return Err(Error::OutOfRange);
    }
    jump::write_relative_jump(dest_ptr, target);
    Ok(LEN)
  }
}

/// Expands a `JCXZ`/`JECXZ`/`JRCXZ`/`LOOP`/`LOOPE`/`LOOPNE` instruction (none
/// of which have a 32-bit encoding) into three destination instructions
/// (§4.3.3):
///
/// 1. the original short instruction, retargeted to skip the next five
///    bytes when its condition is *not* taken,
/// 2. a 2-byte short jump that skips the absolute jump below when the
///    condition *is not* taken (so the two invert into "fall through to the
///    absolute jump only when taken"),
/// 3. a 5-byte relative jump to the real target.
///
/// All three destination instructions came from one source instruction, so
/// all three translation-map entries this pushes share `source_offset`
/// (§4.3: "source_offset is strictly non-decreasing, not strictly
/// increasing") — a thread migrated `DST→SRC` from any of the three still
/// resolves back to the original `JCXZ`/`LOOP`.
unsafe fn relocate_loop_family(
  decoded: &crate::analysis::decoder::DecodedInstruction,
  dest_ptr: *mut u8,
  remaining: usize,
  source_offset: u8,
  destination_offset: usize,
  translation_map: &mut TranslationMap,
) -> Result<usize> {
  let operand = decoded.relative_operand.ok_or(Error::UnsupportedInstruction)?;
  let target = operand.absolute_target as usize;

  const TOTAL_LEN: usize = 2 + 2 + crate::constants::SIZEOF_RELATIVE_JUMP;
  if TOTAL_LEN > remaining {
    return Err(Error::OutOfRange);
  }

  // 1. original opcode byte(s) unchanged, displacement rewritten to +2
  //    (skip over the short jump that follows).
  std::ptr::copy_nonoverlapping(decoded.bytes.as_ptr(), dest_ptr, decoded.bytes.len().min(2));
  std::ptr::write(dest_ptr.add(1), 0x02);
  translation_map.push(source_offset, destination_offset as u8);

  // 2. short jump skipping the 5-byte relative jump below.
  jump::write_short_jump_over_rel32(dest_ptr.add(2));
  translation_map.push(source_offset, (destination_offset + 2) as u8);

  // 3. relative jump to the real target.
  let jump_address = dest_ptr.add(4);
  jump::write_relative_jump(jump_address, target);
  translation_map.push(source_offset, (destination_offset + 4) as u8);

  Ok(TOTAL_LEN)
}

/// Writes a signed displacement of `size` bytes (1, 2, or 4) at `address`,
/// verifying it fits.
unsafe fn write_signed_displacement(address: *mut u8, size: usize, value: isize) -> Result<()> {
  match size {
    1 => {
      let v = i8::try_from(value).map_err(|_| Error::OutOfRange)?;
      std::ptr::write(address as *mut i8, v);
    }
    2 => {
      let v = i16::try_from(value).map_err(|_| Error::OutOfRange)?;
      std::ptr::write_unaligned(address as *mut i16, v);
    }
    4 => {
      if value > i32::MAX as isize || value < i32::MIN as isize {
        return Err(Error::OutOfRange);
      }
      debug_assert!((value as isize).unsigned_abs() < MAX_DISPLACEMENT_RANGE);
      std::ptr::write_unaligned(address as *mut i32, value as i32);
    }
    8 => {
      std::ptr::write_unaligned(address as *mut i64, value as i64);
    }
    _ => return Err(Error::InvalidArgument("unsupported displacement width")),
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::analysis::analyze_prologue;

  /// Straight-line prologue on 64-bit: `mov [rsp+8],rbx; push rdi; sub
  /// rsp,0x20`. No instruction carries a relative operand, so every byte is
  /// copied verbatim and the translation map records exactly the source
  /// instruction boundaries — offsets 0, 5, 6.
  #[test]
  fn s1_straight_line_prologue() {
    let code = [0x48u8, 0x89, 0x5C, 0x24, 0x08, 0x57, 0x48, 0x83, 0xEC, 0x20];
    let prologue = analyze_prologue(&code, 0x1000).unwrap();
    assert_eq!(prologue.total_length(), 10);

    let mut dest = [0u8; 32];
    let result = unsafe { relocate(&prologue, 0x1000, dest.as_mut_ptr(), dest.len(), 0).unwrap() };

    assert_eq!(result.bytes_written, 10);
    assert_eq!(&dest[..10], &code[..]);

    let offsets: Vec<u8> = result
      .translation_map
      .items()
      .iter()
      .map(|item| item.offset_source)
      .collect();
    assert_eq!(offsets, vec![0, 5, 6]);
  }

  /// Prologue containing `CALL`: relocating one would require the pushed
  /// return address to still point into the original function, which can't
  /// be guaranteed, so it's rejected outright.
  #[test]
  fn s4_call_in_prologue() {
    // call rel32 ; nop*8
    let mut code = vec![0xE8u8, 0, 0, 0, 0];
    code.extend(std::iter::repeat(0x90u8).take(8));
    let prologue = analyze_prologue(&code, 0x2000).unwrap();
    let mut dest = [0u8; 32];
    let result = unsafe { relocate(&prologue, 0x2000, dest.as_mut_ptr(), dest.len(), 0) };
    assert!(matches!(result, Err(Error::UnsupportedInstruction)));
  }

  /// Out-of-range prologue branch: the jump's original displacement can put
  /// its target far from where the trampoline's `source` tag lives, but as
  /// long as the arena placed the destination buffer near that target (its
  /// job per §4.4), relocating only has to rebase an already-32-bit
  /// displacement — no enlargement needed, `bytes_written == 5`.
  #[test]
  fn s3_out_of_range_prologue_branch() {
    let mut dest = [0u8; 16];
    let dest_ptr = dest.as_mut_ptr();

    // `target` sits close to the real destination buffer, as the arena
    // guarantees; `source` is placed ~1.75 GiB below it, which is still a
    // valid (encodable) `E9 rel32` displacement from the prologue's own
    // point of view, but is an address nothing in this process actually
    // occupies.
    let target = dest_ptr as usize + 0x2000;
    let disp: i32 = 0x7000_0000;
    let source = target - 5 - disp as usize;

    let mut code = vec![0xE9u8];
    code.extend_from_slice(&disp.to_le_bytes());
    let prologue = analyze_prologue(&code, source).unwrap();
    assert_eq!(prologue.total_length(), 5);

    let result = unsafe { relocate(&prologue, source, dest_ptr, dest.len(), 0).unwrap() };
    assert_eq!(result.bytes_written, 5);

    let rebased_disp = i32::from_le_bytes([dest[1], dest[2], dest[3], dest[4]]);
    let recomputed_target = (unsafe { dest_ptr.add(5) } as isize + rebased_disp as isize) as usize;
    assert_eq!(recomputed_target, target);
  }

  /// Short conditional jump, a short unconditional jump, and a `JECXZ` all
  /// packed into one prologue. None of them have an encoding this crate
  /// would leave alone: the conditional enlarges to `0F 8x rel32`, the
  /// unconditional rebases onto `E9`, and `JECXZ` expands to three
  /// instructions (§4.3.3) — so the relocated buffer is necessarily larger
  /// than the five source bytes the analyzer needed.
  #[test]
  fn s2_short_conditional_prologue() {
    let mut code = vec![0x75u8, 0x02, 0xEBu8, 0xFB, 0x67u8, 0xE3, 0xF8];
    code.extend(std::iter::repeat(0x90u8).take(8));
    let prologue = analyze_prologue(&code, 0x5000).unwrap();
    assert_eq!(prologue.instructions.len(), 3);

    let mut dest = [0u8; 32];
    let dest_ptr = dest.as_mut_ptr();
    let result = unsafe { relocate(&prologue, 0x5000, dest_ptr, dest.len(), 0).unwrap() };

    assert!(result.bytes_written > prologue.total_length());

    // One entry each for the Jcc and the rebased short JMP, plus three for
    // the JECXZ's expansion (§4.3.3) — five in total, not three: the
    // expansion must contribute translation entries of its own, not just
    // the one its first byte happens to share with every other instruction.
    assert!(
      result.translation_map.items().len() >= 5,
      "JCXZ/LOOP expansion must record all three of its destination instructions"
    );

    // The JECXZ's source offset (0x5004 - 0x5000) must back three distinct
    // destination offsets: the rewritten JECXZ itself, the short
    // case-not-taken jump, and the absolute-target jump.
    let jecxz_source_offset = 4u8;
    let jecxz_destination_offsets: Vec<u8> = result
      .translation_map
      .items()
      .iter()
      .filter(|item| item.offset_source == jecxz_source_offset)
      .map(|item| item.offset_destination)
      .collect();
    assert_eq!(jecxz_destination_offsets.len(), 3);

    // A thread whose IP lands on any of the three synthetic instructions
    // inside the JECXZ expansion must migrate DST→SRC back to the original
    // JECXZ's source offset, not hit the fatal "IP between instruction
    // boundaries" path (the defect this test used to mask).
    let source_base = 0x5000usize;
    let destination_base = dest_ptr as usize;
    for destination_offset in jecxz_destination_offsets {
      let thread = crate::platform::thread::ThreadHandle::current_for_test(
        destination_base + destination_offset as usize,
      );
      crate::migrate::migrate_thread(
        &thread,
        destination_base,
        result.bytes_written,
        source_base,
        &result.translation_map,
        crate::migrate::Direction::DestinationToSource,
      )
      .unwrap();
      assert_eq!(
        thread.instruction_pointer().unwrap(),
        source_base + jecxz_source_offset as usize
      );
    }
  }

  #[test]
  fn rip_relative_targets_saved_original() {
    // mov al, [rip+0x2]  (6 bytes) -- targets a byte inside its own
    // prologue, which must resolve into the trampoline's saved-original-code
    // slot rather than the (about to be hook-jumped) live function body.
    let mut code = vec![0x8Au8, 0x05, 0x02, 0x00, 0x00, 0x00];
    code.extend(std::iter::repeat(0x90u8).take(4));
    let prologue = analyze_prologue(&code, 0x3000).unwrap();
    let mut dest = [0u8; 64];
    let base = dest.as_mut_ptr();
    let saved_original_code = 0x9000usize;
    let result =
      unsafe { relocate(&prologue, 0x3000, base, dest.len(), saved_original_code).unwrap() };

    let disp = i32::from_le_bytes([dest[2], dest[3], dest[4], dest[5]]);
    let computed_target = (unsafe { base.add(6) } as isize + disp as isize) as usize;
    assert_eq!(computed_target, saved_original_code + 0x2);
    let _ = result;
  }

  #[test]
  fn expands_jcxz_into_three_instructions() {
    #[cfg(target_pointer_width = "64")]
    let jcxz = 0xE3u8; // JRCXZ in 64-bit mode
    #[cfg(not(target_pointer_width = "64"))]
    let jcxz = 0xE3u8; // JECXZ in 32-bit mode

    let mut code = vec![jcxz, 0x10];
    code.extend(std::iter::repeat(0x90u8).take(8));
    let prologue = analyze_prologue(&code, 0x4000).unwrap();
    let mut dest = [0u8; 32];
    let result = unsafe { relocate(&prologue, 0x4000, dest.as_mut_ptr(), dest.len(), 0).unwrap() };
    assert!(result.bytes_written >= 9);
  }
}
