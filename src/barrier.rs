//! Per-thread reentrancy barrier (§4.8): guards a hook callback against
//! being re-entered past a caller-chosen depth by the same thread. Grounded
//! on `examples/original_source/src/Barrier.c`'s depth-counter table, keyed
//! here by hook identity (a trampoline's `code_buffer` address) instead of
//! the original's explicit TLS slot, since `std::thread_local!` already
//! gives per-thread storage with lazy initialization.

use std::cell::RefCell;
use std::collections::HashMap;

thread_local! {
  static DEPTHS: RefCell<HashMap<usize, usize>> = RefCell::new(HashMap::new());
}

/// Attempts to enter the hook identified by `handle` on the current thread.
/// Succeeds (incrementing the depth counter) iff the current depth is `<=
/// max_depth`; otherwise the counter is left untouched and `false` is
/// returned.
pub fn try_enter(handle: usize, max_depth: usize) -> bool {
  DEPTHS.with(|depths| {
    let mut depths = depths.borrow_mut();
    let depth = depths.entry(handle).or_insert(0);
    if *depth <= max_depth {
      *depth += 1;
      true
    } else {
      false
    }
  })
}

/// Leaves the hook identified by `handle` on the current thread, matching a
/// prior successful `try_enter`. Removes the entry once the depth reaches
/// zero, so the thread-local map doesn't grow unboundedly across the
/// process lifetime as hooks are installed and removed.
pub fn leave(handle: usize) {
  DEPTHS.with(|depths| {
    let mut depths = depths.borrow_mut();
    if let Some(depth) = depths.get_mut(&handle) {
      *depth = depth.saturating_sub(1);
      if *depth == 0 {
        depths.remove(&handle);
      }
    }
  });
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn allows_entry_up_to_max_depth() {
    let handle = 0x1000;
    assert!(try_enter(handle, 1));
    assert!(try_enter(handle, 1));
    assert!(!try_enter(handle, 1));
    leave(handle);
    leave(handle);
    assert!(try_enter(handle, 1));
    leave(handle);
  }

  #[test]
  fn removes_entry_once_empty() {
    let handle = 0x2000;
    assert!(try_enter(handle, 0));
    leave(handle);
    assert!(try_enter(handle, 0));
    leave(handle);
  }

  #[test]
  fn distinct_handles_track_independently() {
    assert!(try_enter(0x3000, 0));
    assert!(try_enter(0x4000, 0));
    assert!(!try_enter(0x3000, 0));
    assert!(!try_enter(0x4000, 0));
    leave(0x3000);
    leave(0x4000);
  }
}
