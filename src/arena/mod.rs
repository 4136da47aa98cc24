//! The trampoline arena (§4.4): allocates executable memory chunks that are
//! guaranteed to sit within a signed 32-bit displacement of both the patch
//! site and every relative target decoded from the original prologue.
//!
//! Mirrors the teacher's `alloc::proximity`/`alloc::search` shape — "scan
//! existing pools for a fit, else probe free memory-map gaps and allocate a
//! fresh one close to the origin" — generalized from the teacher's single
//! `±max_distance` window to this spec's two-sided `[addr_lo, addr_hi]`
//! range, and from a generic slice-pool to the fixed-size-chunk/region-header
//! layout the spec's Data Model requires.

pub mod chunk;
pub mod region;

use self::chunk::{Chunk, CHUNK_SIZE};
use self::region::Region;
use crate::error::{Error, Result};
use lazy_static::lazy_static;
use std::sync::Mutex;

lazy_static! {
  /// The process-wide list of trampoline regions, sorted by base address.
  /// Protected implicitly by the single-open-transaction rule (§9); the
  /// `Mutex` here exists only to satisfy `lazy_static`'s `Sync` bound and is
  /// always uncontended in practice.
  static ref REGIONS: Mutex<Vec<Region>> = Mutex::new(Vec::new());
}

/// A resolved chunk allocation: the raw chunk pointer plus enough identity
/// to release it later.
pub struct ChunkHandle {
  pub chunk: *mut Chunk,
}

unsafe impl Send for ChunkHandle {}

/// Flips the chunk's owning region to read-write-execute for the duration of
/// `f`, then restores it to read-execute (§4.4 protection discipline:
/// regions sit executable-read at rest, writable only while being mutated).
pub fn with_chunk_writable<T>(chunk: *mut Chunk, f: impl FnOnce() -> T) -> Result<T> {
  let regions = REGIONS.lock().unwrap();
  let chunk_address = chunk as usize;
  let region = regions
    .iter()
    .find(|r| {
      let lower = r.base();
      let upper = lower + r.len();
      (lower..upper).contains(&chunk_address)
    })
    .ok_or(Error::NotFound)?;
  region.with_writable(f)
}

/// Finds or allocates a trampoline chunk all of whose chunk slots lie within
/// ±2 GiB of both `addr_lo` and `addr_hi`.
pub fn find_or_allocate_chunk(addr_lo: usize, addr_hi: usize) -> Result<ChunkHandle> {
  let mut regions = REGIONS.lock().unwrap();

  if let Some(handle) = find_in_existing_regions(&regions, addr_lo, addr_hi) {
    return Ok(handle);
  }

  let midpoint = addr_lo / 2 + addr_hi / 2;
  let region = allocate_region_near(midpoint, addr_lo, addr_hi)?;
  regions.push(region);
  regions.sort_by_key(Region::base);

  let region = regions
    .iter()
    .find(|r| r.fits_range(addr_lo, addr_hi))
    .expect("just-inserted region must satisfy the range it was allocated for");
  let index = region
    .find_unused_chunk()
    .expect("freshly allocated region always has unused chunks");
  region.with_writable(|| region.mark_used(index))?;

  Ok(ChunkHandle {
    chunk: region.chunk_ptr(index),
  })
}

/// Binary-searches `regions` by the midpoint of `[addr_lo, addr_hi]`, then
/// walks outward in both directions looking for a qualifying region with a
/// free chunk (§4.4 step 1).
fn find_in_existing_regions(regions: &[Region], addr_lo: usize, addr_hi: usize) -> Option<ChunkHandle> {
  if regions.is_empty() {
    return None;
  }

  let midpoint = addr_lo / 2 + addr_hi / 2;
  let start = regions.partition_point(|r| r.base() < midpoint);

  let mut left = start;
  let mut right = start;
  loop {
    let mut progressed = false;

    if right < regions.len() {
      let region = &regions[right];
      if region.unused_chunk_count() > 0 && region.fits_range(addr_lo, addr_hi) {
        if let Some(index) = region.find_unused_chunk() {
          if region.with_writable(|| region.mark_used(index)).is_ok() {
            return Some(ChunkHandle {
              chunk: region.chunk_ptr(index),
            });
          }
        }
      }
      right += 1;
      progressed = true;
    }

    if left > 0 {
      left -= 1;
      let region = &regions[left];
      if region.unused_chunk_count() > 0 && region.fits_range(addr_lo, addr_hi) {
        if let Some(index) = region.find_unused_chunk() {
          if region.with_writable(|| region.mark_used(index)).is_ok() {
            return Some(ChunkHandle {
              chunk: region.chunk_ptr(index),
            });
          }
        }
      }
      progressed = true;
    }

    if !progressed {
      return None;
    }
  }
}

/// Walks outward from `origin` probing OS memory-map gaps for one large
/// enough to hold a fresh region, within `[addr_lo, addr_hi]`'s ±2 GiB
/// window (§4.4 step 2).
fn allocate_region_near(origin: usize, addr_lo: usize, addr_hi: usize) -> Result<Region> {
  let window = crate::constants::MAX_DISPLACEMENT_RANGE;
  let range = addr_lo.saturating_sub(window)..addr_hi.saturating_add(window);

  let after = search::after(origin as *const (), Some(range.clone()));
  let before = search::before(origin as *const (), Some(range));

  for candidate in after.chain(before) {
    let address = candidate?;
    if let Ok(region) = Region::allocate_at(address) {
      return Ok(region);
    }
  }

  Err(Error::OutOfRange)
}

/// Releases a chunk previously returned by [`find_or_allocate_chunk`],
/// identified by the `code_buffer` address the caller was handed. Unmaps the
/// owning region once every non-header chunk in it is unused again.
pub fn release_chunk(code_buffer_address: usize) -> Result<()> {
  let chunk = unsafe { Chunk::from_code_buffer_address(code_buffer_address) };
  let chunk_address = chunk as usize;

  let mut regions = REGIONS.lock().unwrap();
  let region_index = regions
    .iter()
    .position(|r| {
      let lower = r.base();
      let upper = lower + r.len();
      (lower..upper).contains(&chunk_address)
    })
    .ok_or(Error::NotFound)?;

  {
    let region = &regions[region_index];
    debug_assert!(region.is_valid(), "region signature corrupted");
    let offset = chunk_address - region.chunk_ptr(0) as usize;
    let index = offset / CHUNK_SIZE;
    region.with_writable(|| region.mark_unused(index))?;
  }

  if regions[region_index].unused_chunk_count() as usize == regions[region_index].chunk_count() {
    regions.remove(region_index);
  }

  Ok(())
}

mod search {
  //! Free-memory-map probing, generalized from the teacher's
  //! `alloc::search::{before, after}` (`FreeRegionIter`) to take an explicit
  //! two-sided range rather than only a `±max_distance` window around a
  //! single origin.

  use crate::error::{Error, Result};
  use std::ops::Range;

  pub fn after(origin: *const (), range: Option<Range<usize>>) -> impl Iterator<Item = Result<*const ()>> {
    FreeRegionIter::new(origin, range, Direction::After)
  }

  pub fn before(origin: *const (), range: Option<Range<usize>>) -> impl Iterator<Item = Result<*const ()>> {
    FreeRegionIter::new(origin, range, Direction::Before)
  }

  enum Direction {
    Before,
    After,
  }

  struct FreeRegionIter {
    range: Range<usize>,
    direction: Direction,
    current: usize,
  }

  impl FreeRegionIter {
    fn new(origin: *const (), range: Option<Range<usize>>, direction: Direction) -> Self {
      FreeRegionIter {
        range: range.unwrap_or(0..usize::MAX),
        current: origin as usize,
        direction,
      }
    }
  }

  impl Iterator for FreeRegionIter {
    type Item = Result<*const ()>;

    fn next(&mut self) -> Option<Self::Item> {
      let page_size = region::page::size();

      while self.current > 0 && self.range.contains(&self.current) {
        match region::query(self.current as *const _) {
          Ok(found) => {
            self.current = match self.direction {
              Direction::Before => found.lower().saturating_sub(page_size),
              Direction::After => found.upper(),
            };
          }
          Err(region::Error::FreeMemory) => {
            let result = self.current as *const _;
            self.current = match self.direction {
              Direction::Before => self.current.saturating_sub(page_size),
              Direction::After => self.current + page_size,
            };
            return Some(Ok(result));
          }
          Err(error) => return Some(Err(Error::RegionFailure(error))),
        }
      }

      None
    }
  }
}
