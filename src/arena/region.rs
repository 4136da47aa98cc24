//! A single OS-allocation-granularity executable block (§3 "Trampoline
//! region"), subdivided into fixed-size [`Chunk`]s. The first chunk-sized
//! slot is overlaid with a region header (magic + unused-chunk count); the
//! rest are trampoline chunks handed out by [`super::find_or_allocate_chunk`].

use crate::arena::chunk::{Chunk, CHUNK_SIZE};
use crate::constants::{MAX_DISPLACEMENT_RANGE, REGION_MAGIC};
use crate::error::{Error, Result};

/// Typical OS allocation granularity (64 KiB), matching the spec's "typically
/// 64 KiB" sizing for a region.
pub const REGION_SIZE: usize = 64 * 1024;

#[repr(C)]
struct RegionHeader {
  magic: u32,
  unused_chunks: u32,
}

/// A single mmap'd, chunk-subdivided region of executable memory.
pub struct Region {
  map: mmap::MemoryMap,
}

// The region is only ever mutated while the owning transaction holds the
// process-wide region-list lock and the region's protection has been
// flipped to writable; the raw pointer itself is safe to move between
// threads.
unsafe impl Send for Region {}

impl Region {
  /// Maps a fresh region at `address`, initializing its header and marking
  /// every non-header chunk slot unused.
  pub fn allocate_at(address: *const ()) -> Result<Self> {
    let map = mmap::MemoryMap::new(
      REGION_SIZE,
      &[
        mmap::MapOption::MapReadable,
        mmap::MapOption::MapWritable,
        mmap::MapOption::MapExecutable,
        mmap::MapOption::MapAddr(address as *const _),
      ],
    )
    .map_err(|_| Error::OutOfMemory)?;

    let region = Region { map };
    let chunk_count = region.chunk_count();

    unsafe {
      let header = region.header_mut();
      header.magic = REGION_MAGIC;
      header.unused_chunks = chunk_count as u32;

      for index in 0..chunk_count {
        std::ptr::write_bytes(region.chunk_ptr(index), 0, 1);
      }
    }

    // Regions sit at executable-read at rest (§4.4 protection discipline);
    // the fresh mapping above is RWX only because `mmap-fixed-fixed` has no
    // separate "allocate RX, then make this slice RW" step.
    region.protect_readonly()?;

    Ok(region)
  }

  pub fn base(&self) -> usize {
    self.map.data() as usize
  }

  pub fn len(&self) -> usize {
    self.map.len()
  }

  /// Number of chunk slots excluding the header slot.
  pub fn chunk_count(&self) -> usize {
    (self.map.len() / CHUNK_SIZE).saturating_sub(1)
  }

  fn header(&self) -> &RegionHeader {
    unsafe { &*(self.map.data() as *const RegionHeader) }
  }

  unsafe fn header_mut(&self) -> &mut RegionHeader {
    &mut *(self.map.data() as *mut RegionHeader)
  }

  pub fn unused_chunk_count(&self) -> u32 {
    self.header().unused_chunks
  }

  pub fn is_valid(&self) -> bool {
    self.header().magic == REGION_MAGIC
  }

  /// Pointer to chunk slot `index` (0-based, excluding the header slot).
  pub fn chunk_ptr(&self, index: usize) -> *mut Chunk {
    unsafe { self.map.data().add((index + 1) * CHUNK_SIZE) as *mut Chunk }
  }

  /// Returns `true` if every chunk slot in this region lies within a
  /// signed-32-bit displacement of both `addr_lo` and `addr_hi` (§4.4).
  pub fn fits_range(&self, addr_lo: usize, addr_hi: usize) -> bool {
    let first = self.chunk_ptr(0) as usize;
    let last = self.chunk_ptr(self.chunk_count().saturating_sub(1)) as usize + CHUNK_SIZE;
    fits_i32_distance(first, addr_lo)
      && fits_i32_distance(first, addr_hi)
      && fits_i32_distance(last, addr_lo)
      && fits_i32_distance(last, addr_hi)
  }

  /// Returns the first unused chunk index, if any.
  pub fn find_unused_chunk(&self) -> Option<usize> {
    (0..self.chunk_count()).find(|&index| unsafe { (*self.chunk_ptr(index)).in_use == 0 })
  }

  pub fn mark_used(&self, index: usize) {
    unsafe {
      (*self.chunk_ptr(index)).in_use = 1;
      self.header_mut().unused_chunks -= 1;
    }
  }

  pub fn mark_unused(&self, index: usize) {
    unsafe {
      std::ptr::write_bytes(self.chunk_ptr(index), 0, 1);
      self.header_mut().unused_chunks += 1;
    }
  }

  /// Flips the region to read-write-execute for the duration of `f`, then
  /// restores it to read-execute. Failures to change protection are fatal
  /// to the enclosing operation (§4.4).
  pub fn with_writable<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
    let _guard = region::protect_with_handle(
      self.map.data() as *const _,
      self.map.len(),
      region::Protection::READ_WRITE_EXECUTE,
    )?;
    Ok(f())
  }

  fn protect_readonly(&self) -> Result<()> {
    region::protect(
      self.map.data() as *const _,
      self.map.len(),
      region::Protection::READ_EXECUTE,
    )?;
    Ok(())
  }
}

fn fits_i32_distance(a: usize, b: usize) -> bool {
  let distance = (a as isize).wrapping_sub(b as isize);
  distance.unsigned_abs() < MAX_DISPLACEMENT_RANGE
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn distance_check_rejects_far_addresses() {
    assert!(fits_i32_distance(0x1000_0000, 0x1000_1000));
    assert!(!fits_i32_distance(0x1_0000_0000_0000, 0x1000));
  }
}
