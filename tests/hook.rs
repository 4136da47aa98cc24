//! End-to-end tests for the typed [`zyrex::InlineHook`] convenience wrapper,
//! mirroring the teacher crate's `tests/lib.rs::generic` (`GenericDetour`)
//! round trip against a real, in-process function.

use std::sync::Mutex;

use lazy_static::lazy_static;
use zyrex::InlineHook;

// See the matching comment in `tests/transaction.rs`: `InlineHook::enable`/
// `disable` each open a process-wide transaction, so tests in this file
// can't run concurrently with each other.
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

#[test]
fn enable_disable_round_trip() {
  let _guard = lock_serial();

  unsafe {
    let hook = InlineHook::<FnAdd>::new(add, sub_detour).expect("target and callback are distinct, hookable functions");

    assert_eq!(add(10, 5), 15);
    assert!(!hook.is_enabled());

    hook.enable().unwrap();
    assert!(hook.is_enabled());

    // Through the typed `call` helper, the trampoline always behaves like
    // the original, unhooked function.
    assert_eq!(hook.call(10, 5), 15);
    assert_eq!(add(10, 5), 5, "the live function now dispatches to the callback");

    hook.disable().unwrap();
    assert!(!hook.is_enabled());
    assert_eq!(add(10, 5), 15);
  }
}

#[test]
fn enable_is_a_no_op_when_already_enabled() {
  let _guard = lock_serial();

  unsafe {
    let hook = InlineHook::<FnAdd>::new(add, sub_detour).unwrap();
    hook.enable().unwrap();
    hook.enable().unwrap();
    assert!(hook.is_enabled());
    assert_eq!(add(1, 1), 0, "still hooked after the redundant enable() call");
    hook.disable().unwrap();
  }
}

#[test]
fn rejects_identical_target_and_callback() {
  let _guard = lock_serial();

  unsafe {
    let result = InlineHook::<FnAdd>::new(add, add);
    assert!(result.is_err());
  }
}

#[test]
fn dropping_an_enabled_hook_disables_it() {
  let _guard = lock_serial();

  unsafe {
    {
      let hook = InlineHook::<FnAdd>::new(add, sub_detour).unwrap();
      hook.enable().unwrap();
      assert_eq!(add(10, 5), 5);
    }
    // `hook`'s `Drop` impl disabled it on scope exit.
    assert_eq!(add(10, 5), 15);
  }
}
