//! Linux thread control.
//!
//! `original_source/src/Transaction.c` only implements thread suspension
//! under `#ifdef ZYAN_WINDOWS`; the non-Windows branch is
//! `ZYAN_UNUSED(thread_id); return ZYAN_STATUS_SUCCESS;` — a silent no-op
//! that would make `update_thread`/`update_all_threads` (and therefore the
//! whole thread-migration safety story of §4.6) do nothing on Linux. This
//! module supplements that gap with the same family of technique sampling
//! profilers and `gdb`-style in-process stoppers use to pause a sibling
//! pthread without a kernel suspend primitive: deliver `SIGUSR1` to the
//! target thread, have its handler publish a pointer to the `ucontext_t`
//! the kernel handed it and park until released, and read/write the
//! instruction pointer through that published context.
//!
//! This is new functionality relative to both the teacher and the original
//! C sources (see DESIGN.md).

use crate::error::{Error, Result};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, Once};

pub type ThreadId = libc::pid_t;

struct ParkedSlot {
  ucontext: AtomicPtr<libc::ucontext_t>,
  parked: AtomicBool,
  should_resume: AtomicBool,
}

impl ParkedSlot {
  fn new() -> Self {
    ParkedSlot {
      ucontext: AtomicPtr::new(std::ptr::null_mut()),
      parked: AtomicBool::new(false),
      should_resume: AtomicBool::new(false),
    }
  }
}

lazy_static! {
  static ref PARKED: Mutex<HashMap<ThreadId, Arc<ParkedSlot>>> = Mutex::new(HashMap::new());
}

static INSTALL_HANDLER: Once = Once::new();

/// Spin/sleep budget for a target thread to acknowledge the suspend signal
/// before this gives up and reports a system-call failure (the thread may
/// have exited, or be stuck in an uninterruptible state).
const SUSPEND_ACK_ATTEMPTS: u32 = 50_000;

pub fn current_thread_id() -> ThreadId {
  unsafe { libc::syscall(libc::SYS_gettid) as ThreadId }
}

pub struct RawHandle {
  id: ThreadId,
  slot: Arc<ParkedSlot>,
}

unsafe impl Send for RawHandle {}

extern "C" fn handle_sigusr1(_sig: i32, _info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
  let tid = current_thread_id();

  // Locking inside a signal handler isn't strictly async-signal-safe, but
  // this handler only ever runs on a thread this process itself targeted
  // with `tgkill` immediately after registering its slot, so the lock is
  // never contended by unrelated signal delivery.
  let slot = PARKED.lock().ok().and_then(|map| map.get(&tid).cloned());
  let Some(slot) = slot else { return };

  slot.ucontext.store(ctx as *mut libc::ucontext_t, Ordering::SeqCst);
  slot.parked.store(true, Ordering::SeqCst);

  while !slot.should_resume.load(Ordering::SeqCst) {
    unsafe { libc::usleep(200) };
  }

  slot.parked.store(false, Ordering::SeqCst);
  slot.ucontext.store(std::ptr::null_mut(), Ordering::SeqCst);
}

fn install_handler() {
  INSTALL_HANDLER.call_once(|| unsafe {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = handle_sigusr1 as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    libc::sigemptyset(&mut action.sa_mask);
    libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut());
  });
}

pub fn suspend(id: ThreadId) -> Result<RawHandle> {
  install_handler();

  let slot = Arc::new(ParkedSlot::new());
  PARKED.lock().unwrap().insert(id, slot.clone());

  let result = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), id, libc::SIGUSR1) };
  if result != 0 {
    PARKED.lock().unwrap().remove(&id);
    return Err(Error::SystemCall(io::Error::last_os_error()));
  }

  for _ in 0..SUSPEND_ACK_ATTEMPTS {
    if slot.parked.load(Ordering::SeqCst) {
      return Ok(RawHandle { id, slot });
    }
    unsafe { libc::usleep(20) };
  }

  PARKED.lock().unwrap().remove(&id);
  Err(Error::SystemCall(io::Error::new(
    io::ErrorKind::TimedOut,
    "target thread did not acknowledge suspend signal",
  )))
}

pub fn resume(handle: RawHandle) -> Result<()> {
  handle.slot.should_resume.store(true, Ordering::SeqCst);
  while handle.slot.parked.load(Ordering::SeqCst) {
    unsafe { libc::usleep(20) };
  }
  PARKED.lock().unwrap().remove(&handle.id);
  Ok(())
}

pub fn get_instruction_pointer(handle: &RawHandle) -> Result<usize> {
  with_ucontext(handle, |mcontext| mcontext.gregs[ip_register_index()] as usize)
}

pub fn set_instruction_pointer(handle: &RawHandle, ip: usize) -> Result<()> {
  with_ucontext(handle, |mcontext| {
    mcontext.gregs[ip_register_index()] = ip as i64;
  })
}

#[cfg(target_pointer_width = "64")]
fn ip_register_index() -> usize {
  libc::REG_RIP as usize
}

#[cfg(target_pointer_width = "32")]
fn ip_register_index() -> usize {
  libc::REG_EIP as usize
}

fn with_ucontext<T>(handle: &RawHandle, f: impl FnOnce(&mut libc::mcontext_t) -> T) -> Result<T> {
  let ptr = handle.slot.ucontext.load(Ordering::SeqCst);
  if ptr.is_null() {
    return Err(Error::InvalidOperation);
  }
  unsafe { Ok(f(&mut (*ptr).uc_mcontext)) }
}

/// Enumerates every thread of the current process other than `excluding`,
/// by listing `/proc/self/task`.
pub fn enumerate_other_threads(excluding: ThreadId) -> Result<Vec<ThreadId>> {
  let entries = std::fs::read_dir("/proc/self/task")?;
  let mut ids = Vec::new();
  for entry in entries {
    let entry = entry?;
    if let Some(id) = entry.file_name().to_str().and_then(|s| s.parse::<ThreadId>().ok()) {
      if id != excluding {
        ids.push(id);
      }
    }
  }
  Ok(ids)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn enumerate_excludes_current_thread() {
    let current = current_thread_id();
    let ids = enumerate_other_threads(current).unwrap();
    assert!(!ids.contains(&current));
  }
}
