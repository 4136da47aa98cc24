//! A typed, single-hook convenience wrapper over [`transaction`] (§6,
//! "additional surface this crate adds on top of the core spec"). Modeled on
//! the teacher's `arch::detour::Detour`: a trampoline handle plus an
//! `AtomicBool` enabled flag, with `Drop` disabling the hook if it's still
//! active.
//!
//! Unlike `Detour`, which opens its own micro-transaction inline,
//! `InlineHook::enable`/`disable` go through the full [`transaction`] state
//! machine — there's no separate "patcher" type here, since a transaction
//! already is one.

use crate::error::{Error, Result};
use crate::traits::{Function, HookableWith};
use crate::transaction;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A single target/callback pair that can be toggled on and off. Neither
/// function is touched until [`InlineHook::enable`] is called.
pub struct InlineHook<F: Function> {
  target: F,
  callback: F,
  trampoline_pointer: AtomicUsize,
  enabled: AtomicBool,
}

impl<F: Function> InlineHook<F> {
  /// Builds a hook for `target` that will dispatch to `callback` once
  /// enabled. `callback` may have any calling convention `F` accepts hooking
  /// with (see [`HookableWith`]); it's stored re-typed as `F` since both
  /// ends of an inline hook are invoked through the same trampoline pointer.
  pub unsafe fn new<D: Function>(target: F, callback: D) -> Result<Self>
  where
    F: HookableWith<D>,
  {
    if target.to_ptr() == callback.to_ptr() {
      return Err(Error::InvalidArgument("target and callback must not be the same address"));
    }
    Ok(InlineHook {
      target,
      callback: F::from_ptr(callback.to_ptr()),
      trampoline_pointer: AtomicUsize::new(0),
      enabled: AtomicBool::new(false),
    })
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled.load(Ordering::SeqCst)
  }

  /// Enables the hook: opens a transaction, installs the patch, commits.
  /// A no-op if already enabled.
  pub unsafe fn enable(&self) -> Result<()> {
    if self.is_enabled() {
      return Ok(());
    }

    let mut txn = transaction::begin()?;
    let pointer = match txn.install(self.target.to_ptr() as usize, self.callback.to_ptr() as usize) {
      Ok(pointer) => pointer,
      Err(error) => {
        let _ = txn.abort();
        return Err(error);
      }
    };

    txn.commit().map_err(|failure| failure.error)?;
    self.trampoline_pointer.store(pointer, Ordering::SeqCst);
    self.enabled.store(true, Ordering::SeqCst);
    Ok(())
  }

  /// Disables the hook: opens a transaction, queues the removal, commits.
  /// A no-op if already disabled.
  pub unsafe fn disable(&self) -> Result<()> {
    if !self.is_enabled() {
      return Ok(());
    }

    let pointer = self.trampoline_pointer.load(Ordering::SeqCst);
    let mut txn = transaction::begin()?;
    if let Err(error) = txn.remove(pointer) {
      let _ = txn.abort();
      return Err(error);
    }

    txn.commit().map_err(|failure| failure.error)?;
    self.enabled.store(false, Ordering::SeqCst);
    Ok(())
  }

  /// The address to invoke in place of the original, unhooked function.
  /// Panics if the hook has never been enabled — mirroring the teacher's
  /// `Detour::trampoline`, which assumes the allocation already exists.
  pub fn trampoline(&self) -> *const () {
    let pointer = self.trampoline_pointer.load(Ordering::SeqCst);
    assert!(pointer != 0, "trampoline requested on a hook that was never enabled");
    pointer as *const ()
  }
}

impl<F: Function> Drop for InlineHook<F> {
  fn drop(&mut self) {
    if self.is_enabled() {
      if let Err(error) = unsafe { self.disable() } {
        log::error!("failed to disable hook while dropping it: {}", error);
      }
    }
  }
}

impl<F: Function> fmt::Debug for InlineHook<F> {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "InlineHook {{ enabled: {} }}", self.is_enabled())
  }
}

unsafe impl<F: Function> Send for InlineHook<F> {}
unsafe impl<F: Function> Sync for InlineHook<F> {}
