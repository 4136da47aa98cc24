//! Thread enumeration, suspension and instruction-pointer access (§4.9).
//!
//! `original_source/src/Transaction.c` only implements this under
//! `#ifdef ZYAN_WINDOWS`; the non-Windows branch is a silent no-op
//! (`ZYAN_UNUSED(thread_id); return ZYAN_STATUS_SUCCESS;`). Porting that
//! literally would make half of this crate's safety story — thread
//! migration across a commit — do nothing outside Windows, so this crate
//! supplements the dropped platform with a signal-based stop-the-world
//! handshake (see `unix`).

use crate::error::Result;

cfg_if::cfg_if! {
  if #[cfg(windows)] {
    mod windows;
    pub use self::windows::{current_thread_id, enumerate_other_threads, ThreadId};
    use self::windows as imp;
  } else if #[cfg(target_os = "linux")] {
    mod unix;
    pub use self::unix::{current_thread_id, enumerate_other_threads, ThreadId};
    use self::unix as imp;
  } else {
    compile_error!("unsupported platform: no thread-suspension backend (Windows and Linux only)");
  }
}

/// A suspended thread, owned by the transaction that suspended it. Dropping
/// it without calling [`ThreadHandle::resume`] leaves the underlying thread
/// suspended, mirroring the teacher's RAII-on-error caution around OS
/// handles.
pub struct ThreadHandle(Inner);

enum Inner {
  Platform(imp::RawHandle),
  /// Used only by unit tests that exercise `migrate::migrate_thread`
  /// without a real suspended OS thread.
  #[cfg(test)]
  Test(std::cell::Cell<usize>),
}

impl ThreadHandle {
  fn from_raw(raw: imp::RawHandle) -> Self {
    ThreadHandle(Inner::Platform(raw))
  }

  #[cfg(test)]
  pub fn current_for_test(initial_ip: usize) -> Self {
    ThreadHandle(Inner::Test(std::cell::Cell::new(initial_ip)))
  }

  pub fn instruction_pointer(&self) -> Result<usize> {
    match &self.0 {
      Inner::Platform(raw) => imp::get_instruction_pointer(raw),
      #[cfg(test)]
      Inner::Test(cell) => Ok(cell.get()),
    }
  }

  pub fn set_instruction_pointer(&self, ip: usize) -> Result<()> {
    match &self.0 {
      Inner::Platform(raw) => imp::set_instruction_pointer(raw, ip),
      #[cfg(test)]
      Inner::Test(cell) => {
        cell.set(ip);
        Ok(())
      }
    }
  }

  pub fn resume(self) -> Result<()> {
    match self.0 {
      Inner::Platform(raw) => imp::resume(raw),
      #[cfg(test)]
      Inner::Test(_) => Ok(()),
    }
  }
}

/// Opens and suspends the thread identified by `id`. Returns `None` if `id`
/// is the calling thread (the spec excludes the committing thread from its
/// own update list).
pub fn suspend_thread(id: ThreadId) -> Result<Option<ThreadHandle>> {
  if id == current_thread_id() {
    return Ok(None);
  }
  imp::suspend(id).map(|raw| Some(ThreadHandle::from_raw(raw)))
}
