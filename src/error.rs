//! Error types and utilities.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// The result of an engine operation.
pub type Result<T> = ::std::result::Result<T, Error>;

/// A representation of all possible errors.
#[derive(Debug)]
pub enum Error {
  /// A null pointer, zero-sized request, or other caller-side misuse.
  InvalidArgument(&'static str),
  /// The operation is not valid for the current transaction state (e.g.
  /// `commit` without `begin`, or an operation issued from a thread that
  /// doesn't own the open transaction).
  InvalidOperation,
  /// No trampoline region could be allocated within range of the patch site
  /// and every relative target decoded from its prologue.
  OutOfRange,
  /// The prologue contains an instruction that can't be safely relocated
  /// (a `CALL`, or a branch whose rewritten form still can't reach its
  /// target).
  UnsupportedInstruction,
  /// `remove` was called with a pointer that isn't a trampoline returned by
  /// a prior `install`.
  NotFound,
  /// The system is out of (executable) memory.
  OutOfMemory,
  /// An OS primitive failed (protection change, thread suspend/resume,
  /// register access, cache flush, virtual allocation).
  SystemCall(io::Error),
  /// The disassembler refused to decode an instruction, or returned fewer
  /// bytes than it reported consuming.
  DecodeError,
  /// A memory query/protect operation failed.
  RegionFailure(region::Error),
}

impl StdError for Error {
  fn source(&self) -> Option<&(dyn StdError + 'static)> {
    match self {
      Error::RegionFailure(error) => Some(error),
      Error::SystemCall(error) => Some(error),
      _ => None,
    }
  }
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Error::InvalidArgument(reason) => write!(f, "Invalid argument: {}", reason),
      Error::InvalidOperation => write!(f, "No transaction is open on the current thread"),
      Error::OutOfRange => write!(f, "No trampoline region is reachable from this patch site"),
      Error::UnsupportedInstruction => write!(f, "Prologue contains an unsupported instruction"),
      Error::NotFound => write!(f, "No active trampoline corresponds to this pointer"),
      Error::OutOfMemory => write!(f, "Cannot allocate executable memory"),
      Error::SystemCall(ref error) => write!(f, "System call failed: {}", error),
      Error::DecodeError => write!(f, "Disassembler failed to decode an instruction"),
      Error::RegionFailure(ref error) => write!(f, "{}", error),
    }
  }
}

impl From<region::Error> for Error {
  fn from(error: region::Error) -> Self {
    Error::RegionFailure(error)
  }
}

impl From<io::Error> for Error {
  fn from(error: io::Error) -> Self {
    Error::SystemCall(error)
  }
}
