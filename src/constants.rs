//! Worst-case sizing constants shared by the relocator, the trampoline
//! builder and the arena (§9 "Worst-case sizing" of the specification).

/// Length of the relative near-jump the engine writes over a patch site
/// (`E9 rel32`).
pub const SIZEOF_RELATIVE_JUMP: usize = 5;

/// Length of the indirect absolute jump used for the callback- and
/// back-jump slots (`FF 25 disp32`, plus the 8-byte pointer it reads).
pub const SIZEOF_ABSOLUTE_JUMP: usize = 6;

/// The longest encoding x86/x86-64 allows for a single instruction.
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// The minimum number of prologue bytes that must be relocated: exactly
/// enough room for the relative jump that will overwrite them.
pub const MIN_BYTES_TO_RELOCATE: usize = SIZEOF_RELATIVE_JUMP;

/// Upper bound on the number of original bytes a trampoline chunk saves.
/// If the final decoded instruction starts at byte `MIN_BYTES_TO_RELOCATE -
/// 1`, it can still be up to `MAX_INSTRUCTION_LENGTH` bytes long.
pub const MAX_CODE_SIZE: usize = MAX_INSTRUCTION_LENGTH + SIZEOF_RELATIVE_JUMP - 1;

/// Extra relocated-code headroom reserved to absorb a single `JCXZ`/`LOOP`
/// three-instruction expansion (§4.3).
pub const MAX_CODE_SIZE_BONUS: usize = 8;

/// Total capacity of a chunk's `code_buffer`, including the trailing
/// absolute back-jump.
pub const MAX_CODE_SIZE_WITH_BACKJUMP: usize =
  MAX_CODE_SIZE + MAX_CODE_SIZE_BONUS + SIZEOF_ABSOLUTE_JUMP;

/// Upper bound on the number of instructions a prologue can decode to
/// before reaching `MIN_BYTES_TO_RELOCATE` bytes (one instruction can be at
/// minimum one byte, so bound by the jump size itself).
pub const MAX_INSTRUCTION_COUNT: usize = SIZEOF_RELATIVE_JUMP;

/// Extra translation-map slots reserved for a `JCXZ`/`LOOP` expansion, which
/// emits three destination instructions from one source instruction.
pub const MAX_INSTRUCTION_COUNT_BONUS: usize = 2;

/// Total translation-map capacity.
pub const MAX_TRANSLATION_ITEMS: usize = MAX_INSTRUCTION_COUNT + MAX_INSTRUCTION_COUNT_BONUS;

/// The furthest distance between a reference and its relocated counterpart
/// that a 32-bit relative displacement can still express (signed `i32`).
pub const MAX_DISPLACEMENT_RANGE: usize = 0x8000_0000;

/// Region header signature ('zrex' as a little-endian u32), written to the
/// first chunk-sized slot of every trampoline region.
pub const REGION_MAGIC: u32 = 0x7A72_6578;

/// Conservative upper bound on how many prologue bytes the analyzer could
/// ever need to read: worst case is `MAX_INSTRUCTION_COUNT` instructions,
/// each `MAX_INSTRUCTION_LENGTH` bytes long.
pub const MAX_PROLOGUE_READ_LENGTH: usize = MAX_INSTRUCTION_LENGTH * MAX_INSTRUCTION_COUNT;
