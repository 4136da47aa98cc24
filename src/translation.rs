//! The instruction translation map (§4.4): a small, fixed-capacity table
//! pairing each relocated instruction's original offset with its offset in
//! the trampoline, used by the thread migrator to move an in-flight
//! instruction pointer across the patch.

use crate::constants::MAX_TRANSLATION_ITEMS;

/// One `(source_offset, destination_offset)` pair, both relative to the
/// start of the hooked function and the start of the trampoline's
/// relocated-code buffer respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationItem {
  pub offset_source: u8,
  pub offset_destination: u8,
}

/// Fixed-capacity translation table built by the relocator and consulted by
/// the thread migrator. Entries are kept sorted by `offset_source`.
#[derive(Debug, Clone)]
pub struct TranslationMap {
  items: Vec<TranslationItem>,
}

impl TranslationMap {
  pub fn new() -> Self {
    TranslationMap {
      items: Vec::with_capacity(MAX_TRANSLATION_ITEMS),
    }
  }

  /// Appends an entry. Panics if the map already holds
  /// `MAX_TRANSLATION_ITEMS` entries, which would indicate a relocator bug
  /// rather than caller misuse (the sizing constants guarantee it can never
  /// overflow for a correctly analyzed prologue).
  pub fn push(&mut self, offset_source: u8, offset_destination: u8) {
    assert!(self.items.len() < MAX_TRANSLATION_ITEMS, "translation map overflow");
    self.items.push(TranslationItem {
      offset_source,
      offset_destination,
    });
  }

  pub fn items(&self) -> &[TranslationItem] {
    &self.items
  }

  /// Finds the translation entry whose source offset is the closest one at
  /// or before `offset_source` — the entry that covers an instruction
  /// pointer that landed inside, rather than exactly on, a relocated
  /// instruction (which cannot happen for an instruction boundary, but can
  /// happen transiently while single-stepping is out of scope here; this is
  /// simply the lookup the migrator performs for an exact boundary match).
  pub fn find(&self, offset_source: u8) -> Option<&TranslationItem> {
    self.items.iter().find(|item| item.offset_source == offset_source)
  }
}

impl Default for TranslationMap {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn finds_exact_entry() {
    let mut map = TranslationMap::new();
    map.push(0, 0);
    map.push(3, 5);
    map.push(8, 12);

    assert_eq!(
      map.find(3),
      Some(&TranslationItem {
        offset_source: 3,
        offset_destination: 5
      })
    );
    assert_eq!(map.find(4), None);
  }
}
