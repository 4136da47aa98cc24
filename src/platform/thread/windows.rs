//! Windows thread control, ported near-verbatim from the `#ifdef
//! ZYAN_WINDOWS` branch of `original_source/src/Transaction.c`:
//! `CreateToolhelp32Snapshot`/`Thread32First`/`Thread32Next` for
//! enumeration, `OpenThread`/`SuspendThread`/`ResumeThread` for suspension,
//! `GetThreadContext`/`SetThreadContext` for instruction-pointer access.

use crate::error::{Error, Result};
use std::io;
use winapi::shared::minwindef::{DWORD, FALSE};
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::processthreadsapi::{
  GetCurrentThreadId, GetThreadContext, OpenThread, ResumeThread, SetThreadContext, SuspendThread,
  CONTEXT,
};
use winapi::um::tlhelp32::{
  CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use winapi::um::winnt::{CONTEXT_CONTROL, HANDLE, THREAD_GET_CONTEXT, THREAD_SET_CONTEXT, THREAD_SUSPEND_RESUME};

pub type ThreadId = DWORD;

pub struct RawHandle(HANDLE);

unsafe impl Send for RawHandle {}

pub fn current_thread_id() -> ThreadId {
  unsafe { GetCurrentThreadId() }
}

const DESIRED_ACCESS: DWORD = THREAD_SUSPEND_RESUME | THREAD_GET_CONTEXT | THREAD_SET_CONTEXT;

pub fn suspend(id: ThreadId) -> Result<RawHandle> {
  unsafe {
    let handle = OpenThread(DESIRED_ACCESS, FALSE, id);
    if handle.is_null() {
      return Err(Error::SystemCall(io::Error::last_os_error()));
    }
    if SuspendThread(handle) == DWORD::MAX {
      CloseHandle(handle);
      return Err(Error::SystemCall(io::Error::last_os_error()));
    }
    Ok(RawHandle(handle))
  }
}

pub fn resume(handle: RawHandle) -> Result<()> {
  unsafe {
    let result = ResumeThread(handle.0);
    CloseHandle(handle.0);
    if result == DWORD::MAX {
      return Err(Error::SystemCall(io::Error::last_os_error()));
    }
    Ok(())
  }
}

pub fn get_instruction_pointer(handle: &RawHandle) -> Result<usize> {
  unsafe {
    let mut context: CONTEXT = std::mem::zeroed();
    context.ContextFlags = CONTEXT_CONTROL;
    if GetThreadContext(handle.0, &mut context) == 0 {
      return Err(Error::SystemCall(io::Error::last_os_error()));
    }
    #[cfg(target_pointer_width = "64")]
    let ip = context.Rip as usize;
    #[cfg(target_pointer_width = "32")]
    let ip = context.Eip as usize;
    Ok(ip)
  }
}

pub fn set_instruction_pointer(handle: &RawHandle, ip: usize) -> Result<()> {
  unsafe {
    let mut context: CONTEXT = std::mem::zeroed();
    context.ContextFlags = CONTEXT_CONTROL;
    if GetThreadContext(handle.0, &mut context) == 0 {
      return Err(Error::SystemCall(io::Error::last_os_error()));
    }
    #[cfg(target_pointer_width = "64")]
    {
      context.Rip = ip as u64;
    }
    #[cfg(target_pointer_width = "32")]
    {
      context.Eip = ip as u32;
    }
    if SetThreadContext(handle.0, &context) == 0 {
      return Err(Error::SystemCall(io::Error::last_os_error()));
    }
    Ok(())
  }
}

/// Enumerates every thread of the current process other than `excluding`,
/// mirroring `ZyrexUpdateAllThreads`'s `CreateToolhelp32Snapshot` walk.
pub fn enumerate_other_threads(excluding: ThreadId) -> Result<Vec<ThreadId>> {
  unsafe {
    let pid = winapi::um::processthreadsapi::GetCurrentProcessId();
    let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, pid);
    if snapshot == INVALID_HANDLE_VALUE {
      return Err(Error::SystemCall(io::Error::last_os_error()));
    }

    let mut entry: THREADENTRY32 = std::mem::zeroed();
    entry.dwSize = std::mem::size_of::<THREADENTRY32>() as u32;

    let mut ids = Vec::new();
    if Thread32First(snapshot, &mut entry) != 0 {
      loop {
        if entry.th32OwnerProcessID == pid && entry.th32ThreadID != excluding {
          ids.push(entry.th32ThreadID);
        }
        if Thread32Next(snapshot, &mut entry) == 0 {
          break;
        }
      }
    }

    CloseHandle(snapshot);
    Ok(ids)
  }
}
