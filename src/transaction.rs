//! The transaction (§4.7): the only way to install or remove a hook.
//! Exactly one transaction may be open process-wide; `begin` enforces that
//! with a CAS on an owner-thread-id field, mirroring
//! `original_source/src/Transaction.c`'s single-writer discipline, and every
//! subsequent operation checks the calling thread against that owner before
//! touching anything.
//!
//! `install`/`remove` only queue records and allocate/inspect trampolines;
//! nothing observable happens at the patch site until `commit`. `commit`
//! applies every record in order, migrating any thread caught mid-prologue
//! before patching so no thread ever resumes at a half-overwritten address,
//! and reverts everything already applied if a later record fails.

use crate::arena;
use crate::constants::SIZEOF_RELATIVE_JUMP;
use crate::error::{Error, Result};
use crate::jump;
use crate::migrate::{self, Direction};
use crate::platform::memory;
use crate::platform::thread::{self, ThreadHandle, ThreadId};
use crate::translation::TranslationMap;
use crate::trampoline;
use lazy_static::lazy_static;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

static OWNER: AtomicU64 = AtomicU64::new(0);

lazy_static! {
  static ref RECORDS: Mutex<Vec<Operation>> = Mutex::new(Vec::new());
  static ref SUSPENDED: Mutex<Vec<ThreadHandle>> = Mutex::new(Vec::new());
}

/// A queued install or remove, carrying everything `commit`'s forward and
/// reverse application need — both directions read the same fields, just
/// applied with the opposite sense.
struct HookRecord {
  patch_site: usize,
  prologue_length: usize,
  code_buffer_address: usize,
  code_buffer_size: usize,
  callback_jump_address: usize,
  original_bytes: Vec<u8>,
  translation_map: TranslationMap,
}

enum Operation {
  Attach(HookRecord),
  Remove(HookRecord),
}

/// The error `commit` returns on a mid-commit failure: which record failed,
/// and why. Every record before it has already been reverted by the time
/// this is returned.
#[derive(Debug)]
pub struct CommitFailure {
  pub index: usize,
  pub error: Error,
}

impl fmt::Display for CommitFailure {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "commit failed at record {}: {}", self.index, self.error)
  }
}

impl std::error::Error for CommitFailure {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    Some(&self.error)
  }
}

/// A single open transaction. Dropping one without calling `commit` or
/// `abort` leaks the open-transaction slot (and every thread it suspended);
/// this mirrors the teacher/original's expectation that callers always
/// conclude a transaction, and is deliberately not enforced with a `Drop`
/// impl that would have to choose a fallible action silently.
pub struct Transaction {
  _private: (),
}

fn current_owner_id() -> u64 {
  thread::current_thread_id() as u64
}

/// Opens a transaction, claiming ownership for the calling thread. Fails if
/// another transaction is already open anywhere in the process.
pub fn begin() -> Result<Transaction> {
  let tid = current_owner_id();
  OWNER
    .compare_exchange(0, tid, Ordering::SeqCst, Ordering::SeqCst)
    .map_err(|_| Error::InvalidOperation)?;
  Ok(Transaction { _private: () })
}

fn ensure_owner() -> Result<()> {
  if OWNER.load(Ordering::SeqCst) == current_owner_id() {
    Ok(())
  } else {
    Err(Error::InvalidOperation)
  }
}

impl Transaction {
  /// Builds a trampoline for `patch_site` dispatching to `callback`, queues
  /// an Attach record, and returns the address to invoke in place of the
  /// original function.
  pub fn install(&mut self, patch_site: usize, callback: usize) -> Result<usize> {
    ensure_owner()?;
    let built = trampoline::build(patch_site, callback)?;
    let code_buffer_address = built.code_buffer_address();
    let snapshot = unsafe { trampoline::inspect(code_buffer_address) };
    RECORDS.lock().unwrap().push(Operation::Attach(snapshot_to_record(snapshot)));
    Ok(code_buffer_address)
  }

  /// Queues a Remove record for the trampoline previously returned by a
  /// committed `install`.
  pub fn remove(&mut self, trampoline_pointer: usize) -> Result<()> {
    ensure_owner()?;
    let snapshot = unsafe { trampoline::inspect(trampoline_pointer) };
    RECORDS.lock().unwrap().push(Operation::Remove(snapshot_to_record(snapshot)));
    Ok(())
  }

  /// Suspends `tid` (unless it's the calling thread) and adds it to the
  /// update list.
  pub fn update_thread(&mut self, tid: ThreadId) -> Result<()> {
    ensure_owner()?;
    if let Some(handle) = thread::suspend_thread(tid)? {
      SUSPENDED.lock().unwrap().push(handle);
    }
    Ok(())
  }

  /// Suspends every other thread in the process.
  pub fn update_all_threads(&mut self) -> Result<()> {
    ensure_owner()?;
    for tid in thread::enumerate_other_threads(thread::current_thread_id())? {
      if let Some(handle) = thread::suspend_thread(tid)? {
        SUSPENDED.lock().unwrap().push(handle);
      }
    }
    Ok(())
  }

  /// Applies every queued record in order, migrating any suspended thread
  /// caught inside the affected range before each patch. On failure, every
  /// record already applied is reverted in reverse order before the error
  /// (identifying the failing record) is returned.
  pub fn commit(self) -> std::result::Result<(), CommitFailure> {
    let mut records = RECORDS.lock().unwrap();
    let mut suspended = SUSPENDED.lock().unwrap();
    let mut pending_release = Vec::new();

    for index in 0..records.len() {
      if let Err(error) = apply_forward(&records[index], &suspended, &mut pending_release) {
        for prior in records[..index].iter().rev() {
          if let Err(revert_error) = apply_reverse(prior, &suspended) {
            log::error!("commit rollback failed to revert a record: {}", revert_error);
          }
        }
        release_owner(&mut records, &mut suspended);
        return Err(CommitFailure { index, error });
      }
    }

    for code_buffer_address in pending_release {
      if let Err(error) = arena::release_chunk(code_buffer_address) {
        log::error!("failed to release trampoline chunk after commit: {}", error);
      }
    }

    release_owner(&mut records, &mut suspended);
    Ok(())
  }

  /// Discards every queued record, frees any trampoline allocated for a
  /// queued (uncommitted) install, and resumes every suspended thread.
  pub fn abort(self) -> Result<()> {
    let mut records = RECORDS.lock().unwrap();
    let mut suspended = SUSPENDED.lock().unwrap();

    for record in records.drain(..) {
      if let Operation::Attach(record) = record {
        if let Err(error) = arena::release_chunk(record.code_buffer_address) {
          log::error!("abort failed to release a queued trampoline: {}", error);
        }
      }
    }

    for handle in suspended.drain(..) {
      if let Err(error) = handle.resume() {
        log::error!("abort failed to resume a suspended thread: {}", error);
      }
    }

    OWNER.store(0, Ordering::SeqCst);
    Ok(())
  }
}

fn release_owner(records: &mut Vec<Operation>, suspended: &mut Vec<ThreadHandle>) {
  for handle in suspended.drain(..) {
    if let Err(error) = handle.resume() {
      log::error!("failed to resume a suspended thread: {}", error);
    }
  }
  records.clear();
  OWNER.store(0, Ordering::SeqCst);
}

fn snapshot_to_record(snapshot: trampoline::TrampolineSnapshot) -> HookRecord {
  HookRecord {
    patch_site: snapshot.patch_site,
    prologue_length: snapshot.prologue_length,
    code_buffer_address: snapshot.code_buffer_address,
    code_buffer_size: snapshot.code_buffer_size,
    callback_jump_address: snapshot.callback_jump_address,
    original_bytes: snapshot.original_bytes,
    translation_map: snapshot.translation_map,
  }
}

/// Writes the patch-site jump, having already migrated any suspended thread
/// caught inside the prologue into the trampoline.
fn patch_in(record: &HookRecord, suspended: &[ThreadHandle]) -> Result<()> {
  for handle in suspended {
    migrate::migrate_thread(
      handle,
      record.patch_site,
      record.prologue_length,
      record.code_buffer_address,
      &record.translation_map,
      Direction::SourceToDestination,
    )?;
  }
  memory::with_writable(record.patch_site as *const (), SIZEOF_RELATIVE_JUMP, || unsafe {
    jump::write_relative_jump(record.patch_site as *mut u8, record.callback_jump_address);
  })?;
  memory::flush_instruction_cache(record.patch_site as *const (), SIZEOF_RELATIVE_JUMP);
  Ok(())
}

/// Restores the patch site's original bytes, having already migrated any
/// suspended thread caught inside the trampoline back into the prologue.
fn patch_out(record: &HookRecord, suspended: &[ThreadHandle]) -> Result<()> {
  for handle in suspended {
    migrate::migrate_thread(
      handle,
      record.code_buffer_address,
      record.code_buffer_size,
      record.patch_site,
      &record.translation_map,
      Direction::DestinationToSource,
    )?;
  }
  let len = record.original_bytes.len();
  memory::with_writable(record.patch_site as *const (), len, || unsafe {
    std::ptr::copy_nonoverlapping(record.original_bytes.as_ptr(), record.patch_site as *mut u8, len);
  })?;
  memory::flush_instruction_cache(record.patch_site as *const (), len);
  Ok(())
}

fn apply_forward(op: &Operation, suspended: &[ThreadHandle], pending_release: &mut Vec<usize>) -> Result<()> {
  match op {
    Operation::Attach(record) => patch_in(record, suspended),
    Operation::Remove(record) => {
      patch_out(record, suspended)?;
      pending_release.push(record.code_buffer_address);
      Ok(())
    }
  }
}

/// Applies the inverse of an already-applied record, used to unwind a
/// partially-applied commit. A reverted Remove's chunk is never released
/// during the forward pass (release only happens after every record in the
/// commit has succeeded), so reverting it back to an Attach needs no
/// re-allocation.
fn apply_reverse(op: &Operation, suspended: &[ThreadHandle]) -> Result<()> {
  match op {
    Operation::Attach(record) => patch_out(record, suspended),
    Operation::Remove(record) => patch_in(record, suspended),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn second_begin_on_same_thread_fails() {
    let _first = begin().unwrap();
    let result = begin();
    assert!(matches!(result, Err(Error::InvalidOperation)));
    _first.abort().unwrap();
  }

  #[test]
  fn operations_after_abort_require_a_new_begin() {
    let txn = begin().unwrap();
    txn.abort().unwrap();
    assert!(matches!(ensure_owner(), Err(Error::InvalidOperation)));
  }
}
