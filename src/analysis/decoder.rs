//! A safe, narrow wrapper around the disassembler.
//!
//! The rest of the crate treats this module as the black-box collaborator
//! the specification describes: something that can decode one instruction
//! and report its length, whether it carries a relative operand, the
//! absolute target of that operand, and the exact byte offset/size/
//! signedness of the field that would need patching if the instruction is
//! relocated. Everything upstream of this file is written against that
//! narrow contract, not against `iced_x86` directly, so the underlying
//! decoder could be swapped without touching `analysis::mod` or
//! `relocate`.

use iced_x86::{Decoder, DecoderOptions, FlowControl, Mnemonic, OpKind};

/// The bitness the decoder should operate in, mirroring the two supported
/// address widths.
#[cfg(target_pointer_width = "64")]
const BITNESS: u32 = 64;
#[cfg(target_pointer_width = "32")]
const BITNESS: u32 = 32;

/// A decoded instruction, together with everything the relocator needs to
/// know about its relative operand (if any).
#[derive(Debug, Clone)]
pub struct DecodedInstruction {
  /// Absolute runtime address this instruction was decoded at.
  pub address: usize,
  /// Raw bytes, as read from the source.
  pub bytes: Vec<u8>,
  /// Whether this is any form of `CALL`.
  pub is_call: bool,
  /// Whether this is an unconditional `JMP` (short or near).
  pub is_unconditional_jump: bool,
  /// Whether this is a conditional jump with a *single-byte* displacement
  /// field that has a 32-bit `0F 8x` long form (`Jcc rel8`).
  pub is_short_conditional_jump: bool,
  /// Whether this is `JCXZ`/`JECXZ`/`JRCXZ` or `LOOP`/`LOOPE`/`LOOPNE` —
  /// the family with no 32-bit encoding.
  pub is_loop_family: bool,
  /// Whether this is any kind of `RET`.
  pub is_return: bool,
  /// The relative operand, if this instruction carries one.
  pub relative_operand: Option<RelativeOperand>,
  /// The x86 condition-code nibble for a `Jcc`/`LOOPcc` family instruction
  /// (e.g. `0x4` for `JZ`/`JE`), used to build the enlarged `0F 8x` form.
  pub condition_code: Option<u8>,
}

/// Describes the relative operand of an instruction: where its
/// displacement/immediate field lives in the instruction bytes, how wide it
/// is, and the absolute address it refers to.
#[derive(Debug, Clone, Copy)]
pub struct RelativeOperand {
  /// Byte offset of the operand field, relative to the start of the
  /// instruction.
  pub field_offset: usize,
  /// Width of the operand field in bytes (1, 2, 4, or 8).
  pub field_size: usize,
  /// Whether the operand is a RIP-relative memory displacement (`true`) as
  /// opposed to a branch immediate (`false`).
  pub is_memory_displacement: bool,
  /// The absolute address the operand resolves to.
  pub absolute_target: u64,
}

impl DecodedInstruction {
  /// Returns the length of the instruction in bytes.
  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  /// Returns the address immediately following this instruction.
  pub fn next_address(&self) -> usize {
    self.address + self.len()
  }
}

/// Decodes exactly one instruction at `address`, reading at most
/// `max_len` bytes from `data` (which must start at `address`).
///
/// Returns `None` if the decoder fails to produce a valid instruction.
pub fn decode_one(data: &[u8], address: usize) -> Option<DecodedInstruction> {
  let mut decoder = Decoder::with_ip(BITNESS, data, address as u64, DecoderOptions::NONE);
  if !decoder.can_decode() {
    return None;
  }

  let instruction = decoder.decode();
  if instruction.is_invalid() {
    return None;
  }

  let len = instruction.len();
  if len == 0 || len > data.len() {
    return None;
  }

  let offsets = decoder.get_constant_offsets(&instruction);

  let condition_code = condition_code_of(instruction.mnemonic());
  let is_loop_family = matches!(
    instruction.mnemonic(),
    Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne | Mnemonic::Jcxz | Mnemonic::Jecxz
  );
  let is_short_conditional_jump = condition_code.is_some()
    && !is_loop_family
    && matches!(instruction.op0_kind(), OpKind::NearBranch16 | OpKind::NearBranch32)
    && len <= 2;

  let relative_operand = relative_operand_of(&instruction, &offsets);

  Some(DecodedInstruction {
    address,
    bytes: data[..len].to_vec(),
    is_call: matches!(
      instruction.flow_control(),
      FlowControl::Call | FlowControl::IndirectCall
    ),
    is_unconditional_jump: matches!(instruction.flow_control(), FlowControl::UnconditionalBranch),
    is_short_conditional_jump,
    is_loop_family,
    is_return: matches!(instruction.flow_control(), FlowControl::Return),
    relative_operand,
    condition_code,
  })
}

/// Maps a conditional branch/loop mnemonic to its x86 condition-code
/// nibble, used to build the enlarged `0F 8x rel32` form (§4.3).
fn condition_code_of(mnemonic: Mnemonic) -> Option<u8> {
  use Mnemonic::*;
  Some(match mnemonic {
    Jo => 0x0,
    Jno => 0x1,
    Jb => 0x2,
    Jae => 0x3,
    Je => 0x4,
    Jne => 0x5,
    Jbe => 0x6,
    Ja => 0x7,
    Js => 0x8,
    Jns => 0x9,
    Jp => 0xA,
    Jnp => 0xB,
    Jl => 0xC,
    Jge => 0xD,
    Jle => 0xE,
    Jg => 0xF,
    _ => return None,
  })
}

fn relative_operand_of(
  instruction: &iced_x86::Instruction,
  offsets: &iced_x86::ConstantOffsets,
) -> Option<RelativeOperand> {
  if instruction.is_ip_rel_memory_operand() && offsets.has_displacement() {
    return Some(RelativeOperand {
      field_offset: offsets.displacement_offset(),
      field_size: offsets.displacement_size(),
      is_memory_displacement: true,
      absolute_target: instruction.ip_rel_memory_address(),
    });
  }

  match instruction.op0_kind() {
    OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => Some(RelativeOperand {
      field_offset: offsets.immediate_offset(),
      field_size: offsets.immediate_size(),
      is_memory_displacement: false,
      absolute_target: instruction.near_branch_target(),
    }),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn decodes_simple_mov() {
    // mov [rsp+8], rbx
    let bytes = [0x48, 0x89, 0x5C, 0x24, 0x08];
    let inst = decode_one(&bytes, 0x1000).unwrap();
    assert_eq!(inst.len(), 5);
    assert!(inst.relative_operand.is_none());
  }

  #[test]
  fn decodes_relative_jump() {
    // jmp rel32 +0x10
    let bytes = [0xE9, 0x10, 0x00, 0x00, 0x00];
    let inst = decode_one(&bytes, 0x1000).unwrap();
    assert_eq!(inst.len(), 5);
    assert!(inst.is_unconditional_jump);
    let op = inst.relative_operand.unwrap();
    assert_eq!(op.field_offset, 1);
    assert_eq!(op.field_size, 4);
    assert_eq!(op.absolute_target, 0x1000 + 5 + 0x10);
  }

  #[test]
  fn decodes_short_conditional_jump() {
    // jz +2
    let bytes = [0x74, 0x02];
    let inst = decode_one(&bytes, 0x2000).unwrap();
    assert!(inst.is_short_conditional_jump);
    assert_eq!(inst.condition_code, Some(0x4));
    let op = inst.relative_operand.unwrap();
    assert_eq!(op.absolute_target, 0x2000 + 2 + 2);
  }

  #[test]
  fn decodes_call_as_call() {
    let bytes = [0xE8, 0x00, 0x00, 0x00, 0x00];
    let inst = decode_one(&bytes, 0x3000).unwrap();
    assert!(inst.is_call);
  }

  #[cfg(target_pointer_width = "64")]
  #[test]
  fn decodes_rip_relative_memory() {
    // mov al, [rip+0x3]
    let bytes = [0x8A, 0x05, 0x03, 0x00, 0x00, 0x00];
    let inst = decode_one(&bytes, 0x4000).unwrap();
    let op = inst.relative_operand.unwrap();
    assert!(op.is_memory_displacement);
    assert_eq!(op.absolute_target, 0x4000 + 6 + 0x3);
  }
}
