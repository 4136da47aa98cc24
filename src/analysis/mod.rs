//! The prologue analyzer (§4.2): decodes instructions from a patch site
//! until enough bytes have been consumed to fit a relative jump, then
//! cross-links any internal branches so the relocator knows which
//! instructions are jump targets from *within* the prologue itself.
//!
//! This mirrors the two-pass shape of `ZyrexAnalyzeCode`/
//! `ZyrexRelocationContext` in the original implementation: a first pass
//! that decodes and classifies each instruction, and a second pass that
//! walks the decoded list again to mark which of them are targeted by an
//! internal branch.

pub mod decoder;

use crate::constants::{MAX_INSTRUCTION_COUNT, MIN_BYTES_TO_RELOCATE};
use crate::error::{Error, Result};
use decoder::DecodedInstruction;

/// One instruction from the analyzed prologue, augmented with whether any
/// other instruction in the same prologue branches to it.
#[derive(Debug, Clone)]
pub struct AnalyzedInstruction {
  pub decoded: DecodedInstruction,
  /// `true` if some other instruction in this prologue has a relative
  /// operand whose absolute target equals `decoded.address`.
  pub is_internal_branch_target: bool,
}

impl AnalyzedInstruction {
  pub fn address(&self) -> usize {
    self.decoded.address
  }

  pub fn len(&self) -> usize {
    self.decoded.len()
  }
}

/// The fully analyzed prologue of a hook target: every instruction needed
/// to free up `MIN_BYTES_TO_RELOCATE` bytes for the patch jump, cross-linked
/// for internal branch targets.
#[derive(Debug, Clone)]
pub struct AnalyzedPrologue {
  pub instructions: Vec<AnalyzedInstruction>,
}

impl AnalyzedPrologue {
  /// Total length, in bytes, of the analyzed prologue.
  pub fn total_length(&self) -> usize {
    self.instructions.iter().map(AnalyzedInstruction::len).sum()
  }

  /// Returns the instruction starting at `address`, if any.
  pub fn instruction_at(&self, address: usize) -> Option<&AnalyzedInstruction> {
    self.instructions.iter().find(|i| i.address() == address)
  }
}

/// Decodes and cross-links the prologue at `target`, reading from `code`
/// (which must start at `target` and be at least `MAX_INSTRUCTION_COUNT *
/// MAX_INSTRUCTION_LENGTH` bytes long, or run to the end of a readable
/// page).
pub fn analyze_prologue(code: &[u8], target: usize) -> Result<AnalyzedPrologue> {
  let mut instructions = Vec::with_capacity(MAX_INSTRUCTION_COUNT);
  let mut consumed = 0usize;

  while consumed < MIN_BYTES_TO_RELOCATE {
    if instructions.len() >= MAX_INSTRUCTION_COUNT {
      return Err(Error::UnsupportedInstruction);
    }

    let remaining = code.get(consumed..).ok_or(Error::DecodeError)?;
    let decoded = decoder::decode_one(remaining, target + consumed).ok_or(Error::DecodeError)?;

    // A return or unconditional jump ending the prologue before five bytes
    // are freed would hand control back before the patch jump is intact.
    if decoded.is_return && consumed < MIN_BYTES_TO_RELOCATE {
      return Err(Error::UnsupportedInstruction);
    }

    consumed += decoded.len();
    instructions.push(AnalyzedInstruction {
      decoded,
      is_internal_branch_target: false,
    });
  }

  let prologue_end = target + consumed;
  for i in 0..instructions.len() {
    let internal_target = instructions[i]
      .decoded
      .relative_operand
      .map(|op| op.absolute_target as usize)
      .filter(|&addr| addr >= target && addr < prologue_end);

    if let Some(addr) = internal_target {
      if let Some(target_instruction) = instructions.iter_mut().find(|ins| ins.address() == addr)
      {
        target_instruction.is_internal_branch_target = true;
      }
    }
  }

  Ok(AnalyzedPrologue { instructions })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn analyzes_straight_line_code() {
    // 5 single-byte nops, guaranteeing >= MIN_BYTES_TO_RELOCATE.
    let code = [0x90u8; 8];
    let prologue = analyze_prologue(&code, 0x1000).unwrap();
    assert!(prologue.total_length() >= MIN_BYTES_TO_RELOCATE);
    assert!(prologue
      .instructions
      .iter()
      .all(|i| !i.is_internal_branch_target));
  }

  #[test]
  fn flags_internal_branch_target() {
    // jmp +2 ; nop ; nop ; nop ; nop ; nop ; nop ; nop
    // The jump targets the third nop, which lands inside the prologue.
    let mut code = vec![0xEBu8, 0x02];
    code.extend(std::iter::repeat(0x90u8).take(8));
    let prologue = analyze_prologue(&code, 0x2000).unwrap();

    let target_addr = 0x2000 + 2 + 2;
    let target = prologue.instruction_at(target_addr).unwrap();
    assert!(target.is_internal_branch_target);
  }

  #[test]
  fn rejects_prologue_ending_in_early_return() {
    let code = [0xC3u8, 0x90, 0x90, 0x90, 0x90];
    let result = analyze_prologue(&code, 0x3000);
    assert!(result.is_err());
  }
}
