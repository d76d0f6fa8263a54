//! Per-page protection state mirroring the OS protection bits.

use crate::{os, page, Error, Protection, Result};
use std::sync::atomic::{AtomicU8, Ordering};

/// A dense array recording each virtual page's current protection, so the
/// fault handler can classify a trap without a system call.
///
/// The table lives in its own anonymous mapping rather than on a heap: the
/// fault path reads and writes it, and must never touch an allocator. The
/// entries are atomic bytes, so a concurrent reader observes either the old
/// or the new protection, never a torn value.
pub(crate) struct ProtectionMap {
  table: *mut u8,
  table_size: usize,
  pages: usize,
  win_base: *mut u8,
  win_size: usize,
  page_size: usize,
}

impl ProtectionMap {
  /// Creates a map of `NONE` entries covering a window of `win_size` bytes
  /// split into pages of `page_size` bytes.
  pub fn new(win_base: *mut u8, win_size: usize, page_size: usize) -> Result<Self> {
    let pages = (win_size + page_size - 1) / page_size;
    let table_size = page::ceil(pages.max(1));
    let table = unsafe { os::alloc_data(table_size)? };

    Ok(ProtectionMap {
      table,
      table_size,
      pages,
      win_base,
      win_size,
      page_size,
    })
  }

  /// Returns the number of virtual pages covered.
  pub fn pages(&self) -> usize {
    self.pages
  }

  /// Returns the recorded protection of page `index`.
  pub fn get(&self, index: usize) -> Protection {
    debug_assert!(index < self.pages);
    let bits = self.entry(index).load(Ordering::Acquire);
    Protection::from_bits_truncate(bits as usize)
  }

  /// Changes the OS protection of page `index` and records the new value.
  ///
  /// The recorded state is only updated if the protection call succeeds.
  /// Async-signal-safe.
  pub fn set(&self, index: usize, protection: Protection) -> Result<()> {
    let (address, size) = self.span(index);
    unsafe { os::set_protection(address, size, protection)? };
    self.record(index, protection);
    Ok(())
  }

  /// Records a protection change performed by the caller, for the paths
  /// where the remap call itself set the OS bits.
  pub fn record(&self, index: usize, protection: Protection) {
    debug_assert!(index < self.pages);
    self
      .entry(index)
      .store(protection.bits() as u8, Ordering::Release);
  }

  /// Records the same protection for `count` pages starting at `start`.
  pub fn bulk_record(&self, start: usize, count: usize, protection: Protection) {
    for index in start..start + count {
      self.record(index, protection);
    }
  }

  /// Counts the pages whose recorded protection is not `NONE`.
  pub fn resident(&self) -> usize {
    (0..self.pages)
      .filter(|index| self.get(*index) != Protection::NONE)
      .count()
  }

  /// Returns the OS-page-aligned span of page `index` inside the window.
  pub fn span(&self, index: usize) -> (*mut u8, usize) {
    debug_assert!(index < self.pages);
    let offset = index * self.page_size;
    let len = self.page_size.min(self.win_size - offset);
    (unsafe { self.win_base.add(offset) }, page::ceil(len))
  }

  fn entry(&self, index: usize) -> &AtomicU8 {
    unsafe { &*self.table.add(index).cast::<AtomicU8>() }
  }
}

impl Drop for ProtectionMap {
  fn drop(&mut self) {
    let result = unsafe { os::free(self.table, self.table_size) };
    debug_assert!(result.is_ok(), "freeing protection table: {:?}", result);
  }
}

unsafe impl Send for ProtectionMap {}
unsafe impl Sync for ProtectionMap {}
