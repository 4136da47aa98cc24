//! The thread migrator (§4.6): given a suspended thread and a translation
//! map between an original prologue and its relocated trampoline copy,
//! atomically rewrites the thread's instruction pointer so it resumes at
//! the semantically equivalent position — the mechanism that makes a
//! commit safe even for a thread caught mid-prologue.
//!
//! `current_base`/`current_length` describe the range the thread's IP is
//! expected to be in *right now*; `target_base` is where the matching
//! instruction lives in the other copy. For an install this is the original
//! prologue moving to the trampoline; for a remove it is the reverse.

use crate::error::{Error, Result};
use crate::platform::thread::ThreadHandle;
use crate::translation::TranslationMap;

/// Which side of the translation map a migration reads from: the original
/// prologue's offsets (install) or the trampoline's offsets (remove).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  SourceToDestination,
  DestinationToSource,
}

/// Migrates `thread`'s instruction pointer from `current_base` to the
/// matching offset under `target_base`, per `map` and `direction`. A thread
/// whose IP doesn't lie within `[current_base, current_base +
/// current_length)` is left untouched — it wasn't executing inside the
/// range being patched.
pub fn migrate_thread(
  thread: &ThreadHandle,
  current_base: usize,
  current_length: usize,
  target_base: usize,
  map: &TranslationMap,
  direction: Direction,
) -> Result<()> {
  let ip = thread.instruction_pointer()?;

  if ip < current_base || ip >= current_base + current_length {
    return Ok(());
  }

  let offset = (ip - current_base) as u8;

  let new_ip = match direction {
    Direction::SourceToDestination => {
      let entry = map
        .items()
        .iter()
        .find(|item| item.offset_source == offset)
        .ok_or(Error::InvalidOperation)?;
      target_base + entry.offset_destination as usize
    }
    // The intuitive formulation — the `target_base` (== the original
    // `source` parameter on a remove) as the base, `offset_source` as the
    // addend — rather than the original's `destination +
    // entry.source_offset`, which reads as a copy/paste bug against the
    // SRC→DST branch above it (§9 open question, resolved).
    Direction::DestinationToSource => {
      let entry = map
        .items()
        .iter()
        .find(|item| item.offset_destination == offset)
        .ok_or(Error::InvalidOperation)?;
      target_base + entry.offset_source as usize
    }
  };

  thread.set_instruction_pointer(new_ip)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::platform::thread::ThreadHandle;
  use crate::translation::TranslationMap;

  #[test]
  fn leaves_ip_outside_range_untouched() {
    let thread = ThreadHandle::current_for_test(0x5000);
    let map = TranslationMap::new();
    migrate_thread(&thread, 0x1000, 0x10, 0x2000, &map, Direction::SourceToDestination).unwrap();
    assert_eq!(thread.instruction_pointer().unwrap(), 0x5000);
  }

  #[test]
  fn migrates_ip_forward_through_map() {
    let thread = ThreadHandle::current_for_test(0x1003);
    let mut map = TranslationMap::new();
    map.push(0, 0);
    map.push(3, 5);
    map.push(8, 12);

    migrate_thread(&thread, 0x1000, 0x10, 0x2000, &map, Direction::SourceToDestination).unwrap();
    assert_eq!(thread.instruction_pointer().unwrap(), 0x2005);
  }

  #[test]
  fn migrates_ip_backward_through_map() {
    let thread = ThreadHandle::current_for_test(0x2005);
    let mut map = TranslationMap::new();
    map.push(0, 0);
    map.push(3, 5);
    map.push(8, 12);

    migrate_thread(&thread, 0x2000, 0x10, 0x1000, &map, Direction::DestinationToSource).unwrap();
    assert_eq!(thread.instruction_pointer().unwrap(), 0x1003);
  }

  #[test]
  fn fails_on_unmatched_boundary() {
    let thread = ThreadHandle::current_for_test(0x1001);
    let mut map = TranslationMap::new();
    map.push(0, 0);

    let result =
      migrate_thread(&thread, 0x1000, 0x10, 0x2000, &map, Direction::SourceToDestination);
    assert!(matches!(result, Err(Error::InvalidOperation)));
  }
}
