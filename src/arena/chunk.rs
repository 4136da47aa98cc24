//! The trampoline chunk layout (Data Model §3, wire layout §6): a single,
//! address-sensitive slot inside a [`super::region::Region`] that holds
//! everything a trampoline needs to run — the callback jump (64-bit only),
//! the relocated prologue, the back-jump, and enough bookkeeping to reverse
//! the whole thing on `remove`.
//!
//! `Chunk` is laid out with `#[repr(C)]` and is read/written through raw
//! pointers into the mmap'd region; it is never owned by value.

use crate::constants::{MAX_CODE_SIZE, MAX_CODE_SIZE_WITH_BACKJUMP, MAX_TRANSLATION_ITEMS};
use crate::translation::TranslationMap;

/// `code_buffer` worst case (§9): `max_instruction_length + sizeof(relative
/// jump) - 1 + rewrite-bonus + sizeof(absolute jump)`.
pub const CODE_BUFFER_CAPACITY: usize = MAX_CODE_SIZE_WITH_BACKJUMP;

/// `original_code` worst case: `max_instruction_length + sizeof(relative
/// jump) - 1`.
pub const ORIGINAL_CODE_CAPACITY: usize = MAX_CODE_SIZE;

// `Trampoline.h` only carries a dedicated `address_of_callback_jump` field
// under `ZYAN_X64`, since a 32-bit `rel32` jump can reach anywhere in a
// 4 GiB address space and x86-32 builds of the original dispatch to the
// callback without an indirection stub. This crate keeps one chunk layout
// for both widths instead: on 32-bit `write_absolute_jump`'s bare-disp32
// form reads the same in-chunk pointer slot `callback_jump` targets, which
// costs a few bytes per chunk but avoids a second prologue-building code
// path for a case (32-bit targets) this crate exercises far less.
#[repr(C)]
pub struct Chunk {
  pub in_use: u8,
  _pad0: [u8; 7],
  pub callback_address: usize,
  pub callback_jump: [u8; 6],
  _pad1: [u8; 2],
  pub backjump_address: usize,
  pub code_buffer: [u8; CODE_BUFFER_CAPACITY],
  pub code_buffer_size: u8,
  translation_map_count: u8,
  translation_map_entries: [(u8, u8); MAX_TRANSLATION_ITEMS],
  pub original_code: [u8; ORIGINAL_CODE_CAPACITY],
  pub original_code_size: u8,
}

pub const CHUNK_SIZE: usize = std::mem::size_of::<Chunk>();

impl Chunk {
  /// Address of the first byte of `code_buffer` — this is the value handed
  /// to callers as their "trampoline" / "original" pointer.
  pub fn code_buffer_address(&self) -> usize {
    self.code_buffer.as_ptr() as usize
  }

  /// Reverses a previously returned `code_buffer` address back into a
  /// `Chunk` pointer, by subtracting the known in-struct offset.
  ///
  /// # Safety
  ///
  /// `code_buffer_address` must be a value previously returned by
  /// [`Chunk::code_buffer_address`] on a live chunk.
  pub unsafe fn from_code_buffer_address(code_buffer_address: usize) -> *mut Chunk {
    let dummy = std::mem::MaybeUninit::<Chunk>::uninit();
    let base = dummy.as_ptr() as usize;
    let field_offset = (*dummy.as_ptr()).code_buffer.as_ptr() as usize - base;
    (code_buffer_address - field_offset) as *mut Chunk
  }

  pub fn translation_map(&self) -> TranslationMap {
    let mut map = TranslationMap::new();
    for &(src, dst) in &self.translation_map_entries[..self.translation_map_count as usize] {
      map.push(src, dst);
    }
    map
  }

  pub fn set_translation_map(&mut self, map: &TranslationMap) {
    let items = map.items();
    assert!(items.len() <= MAX_TRANSLATION_ITEMS, "translation map overflow");
    self.translation_map_count = items.len() as u8;
    for (slot, item) in self.translation_map_entries.iter_mut().zip(items.iter()) {
      *slot = (item.offset_source, item.offset_destination);
    }
  }

  pub fn original_code_bytes(&self) -> &[u8] {
    &self.original_code[..self.original_code_size as usize]
  }

  pub fn code_buffer_bytes(&self) -> &[u8] {
    &self.code_buffer[..self.code_buffer_size as usize]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn code_buffer_round_trips_through_address() {
    let mut chunk: Chunk = unsafe { std::mem::zeroed() };
    let address = chunk.code_buffer_address();
    let recovered = unsafe { Chunk::from_code_buffer_address(address) };
    assert_eq!(recovered as usize, &chunk as *const Chunk as usize);
  }

  #[test]
  fn fits_within_declared_capacities() {
    assert!(CODE_BUFFER_CAPACITY >= MAX_CODE_SIZE);
    assert!(ORIGINAL_CODE_CAPACITY >= crate::constants::MIN_BYTES_TO_RELOCATE);
  }
}
