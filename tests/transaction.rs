//! End-to-end tests driving `zyrex::transaction` against real, in-process
//! functions, in the style of the teacher crate's `tests/lib.rs`
//! (`RawDetour`/`GenericDetour` round trips against a live `add` function).

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use lazy_static::lazy_static;
use zyrex::transaction;

// `transaction::begin` enforces a single *process-wide* open transaction
// (§4.7), so the tests in this file — which all hook the same `add`
// function, in the same process — can't be allowed to run concurrently the
// way `cargo test` otherwise would. This guard is test-only scaffolding,
// not part of the engine's own concurrency story.
lazy_static! {
  static ref SERIAL: Mutex<()> = Mutex::new(());
}

fn lock_serial() -> std::sync::MutexGuard<'static, ()> {
  SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type FnAdd = extern "C" fn(i32, i32) -> i32;

#[inline(never)]
extern "C" fn add(x: i32, y: i32) -> i32 {
  unsafe { std::ptr::read_volatile(&x as *const i32) + y }
}

#[inline(never)]
extern "C" fn sub_detour(x: i32, y: i32) -> i32 {
  unsafe { std::ptr::read_volatile(&x as *const i32) - y }
}

/// S6: install, commit, remove, commit. The patch site must end up
/// byte-identical to its pre-install bytes, and the function must behave
/// exactly as it did before the round trip.
#[test]
fn s6_install_then_remove() {
  let _guard = lock_serial();
  assert_eq!(add(10, 5), 15);

  let target = add as usize;
  let mut original_bytes = [0u8; 16];
  unsafe {
    std::ptr::copy_nonoverlapping(target as *const u8, original_bytes.as_mut_ptr(), original_bytes.len());
  }

  let mut txn = transaction::begin().unwrap();
  let trampoline_ptr = txn.install(target, sub_detour as usize).unwrap();
  txn.commit().unwrap();

  assert_eq!(add(10, 5), 5, "hooked function should dispatch to the callback");

  let trampoline: FnAdd = unsafe { mem::transmute(trampoline_ptr) };
  assert_eq!(trampoline(10, 5), 15, "trampoline should behave as the original function");

  let mut txn = transaction::begin().unwrap();
  txn.remove(trampoline_ptr).unwrap();
  txn.commit().unwrap();

  assert_eq!(add(10, 5), 15, "function should behave as original once unhooked");

  let mut restored_bytes = [0u8; 16];
  unsafe {
    std::ptr::copy_nonoverlapping(target as *const u8, restored_bytes.as_mut_ptr(), restored_bytes.len());
  }
  assert_eq!(original_bytes, restored_bytes, "patch site must be byte-identical after remove");
}

/// Only one transaction may be open process-wide; a second `begin` from the
/// same thread while the first is still open must fail.
#[test]
fn second_begin_while_open_fails() {
  let _guard = lock_serial();
  let first = transaction::begin().unwrap();
  assert!(transaction::begin().is_err());
  first.abort().unwrap();
}

/// Aborting a transaction must leave no hook installed and release any
/// trampoline the abandoned `install` allocated.
#[test]
fn abort_leaves_target_unpatched() {
  let _guard = lock_serial();
  assert_eq!(add(20, 1), 21);

  let mut txn = transaction::begin().unwrap();
  txn.install(add as usize, sub_detour as usize).unwrap();
  txn.abort().unwrap();

  assert_eq!(add(20, 1), 21, "abort must not leave the patch site modified");

  // The owner slot must be free again for a fresh transaction.
  let txn = transaction::begin().unwrap();
  txn.abort().unwrap();
}

/// S5 (approximated): install a hook with `update_all_threads` while another
/// thread is repeatedly calling the target. No suspended thread should ever
/// resume mid-patch, and the background thread must keep making forward
/// progress across the commit.
#[test]
fn concurrent_install_with_other_threads_running() {
  let _guard = lock_serial();
  static RUNNING: AtomicBool = AtomicBool::new(true);
  static CALLS: AtomicI64 = AtomicI64::new(0);

  let handle = thread::spawn(|| {
    while RUNNING.load(Ordering::SeqCst) {
      add(10, 5);
      CALLS.fetch_add(1, Ordering::SeqCst);
    }
  });

  // Give the helper thread a chance to actually be inside the loop above
  // (ideally mid-prologue) before the commit suspends and migrates it.
  thread::sleep(Duration::from_millis(20));

  let mut txn = transaction::begin().unwrap();
  let trampoline_ptr = txn.install(add as usize, sub_detour as usize).unwrap();
  txn.update_all_threads().unwrap();
  txn.commit().unwrap();

  let calls_at_commit = CALLS.load(Ordering::SeqCst);
  thread::sleep(Duration::from_millis(20));
  RUNNING.store(false, Ordering::SeqCst);
  handle.join().unwrap();

  assert!(
    CALLS.load(Ordering::SeqCst) > calls_at_commit,
    "background thread must keep progressing after the commit"
  );

  let mut txn = transaction::begin().unwrap();
  txn.remove(trampoline_ptr).unwrap();
  txn.commit().unwrap();

  assert_eq!(add(10, 5), 15);
}
