//! The encrypted demand-paged memory map.

use crate::cipher::PageCipher;
use crate::fmap::FileMap;
use crate::pool::{FramePool, NO_PAGE};
use crate::prot::ProtectionMap;
use crate::{os, page, router, Error, Protection, Result};
use log::debug;
use std::cell::UnsafeCell;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};

/// Construction options for an [EncMmap].
#[derive(Debug, Clone)]
pub struct Options {
  /// Size in bytes of one cache page. Must be a power of two and at least
  /// the operating system's page size.
  pub cache_page_size: usize,
  /// Plaintext cache budget in bytes. The pool holds
  /// `cache_size / cache_page_size` frames; must fit at least one.
  pub cache_size: usize,
  /// Bytes of the underlying mapping before this offset are stored in
  /// plaintext, so a header can be read without the key.
  pub encryption_start_offset: usize,
  /// Flush the underlying mapping to its file when the map is destroyed.
  /// Dirty pages are encrypted back regardless.
  pub sync_on_destroy: bool,
  /// Number of consecutive pages a fault on unmapped memory brings in,
  /// including the faulted one. Values below two disable read-ahead.
  pub read_ahead: usize,
}

impl Default for Options {
  fn default() -> Self {
    Options {
      cache_page_size: 16 * 1024,
      cache_size: 16 * 1024 * 1024,
      encryption_start_offset: 0,
      sync_on_destroy: false,
      read_ahead: 2,
    }
  }
}

impl Options {
  fn validate(&self, size: usize) -> Result<()> {
    let psize = self.cache_page_size;
    if !psize.is_power_of_two() || psize < page::size() {
      return Err(Error::InvalidParameter("cache_page_size"));
    }

    if self.cache_size < psize {
      return Err(Error::InvalidParameter("cache_size"));
    }

    if self.encryption_start_offset >= size {
      return Err(Error::InvalidParameter("encryption_start_offset"));
    }

    Ok(())
  }
}

/// The default protection that faults may escalate to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
  /// Faults make pages readable; a store traps again and the trap is
  /// handed to the previously-installed signal action.
  ReadOnly,
  /// Faults make pages readable, and a store to a readable page upgrades
  /// it to writable.
  ReadWrite,
}

/// What the fault handler did with a trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultOutcome {
  /// The faulting page is resident; the instruction can retry.
  Serviced,
  /// The trap does not belong to this map, or is a store to a read-only
  /// map; it must chain to the previous signal action.
  Foreign,
}

struct Inner {
  fmap: FileMap,
  cipher: PageCipher,
  pool: FramePool,
  prot: ProtectionMap,
  /// vpage index → frame index, `NO_PAGE` when not resident.
  table: Vec<u32>,
  base: *mut u8,
  size: usize,
  win_size: usize,
  page_size: usize,
  pages: usize,
  enc_start: usize,
  mode: AccessMode,
  read_ahead: usize,
  sync_on_destroy: bool,
  closed: bool,
}

/// A virtual address range whose bytes live encrypted in a file mapping
/// and decrypt on access, one page at a time, into a bounded cache.
///
/// Reads and writes through [as_ptr](EncMmap::as_ptr) trap on non-resident
/// pages; the trap handler decrypts the page into a cache frame, remaps
/// the page onto the frame and lets the instruction retry. At most
/// `cache_size / cache_page_size` pages are plaintext-resident at any
/// moment; evicted pages are encrypted back into the file mapping first
/// if they were written to.
///
/// # Examples
///
/// ```
/// # fn main() -> encmap::Result<()> {
/// use encmap::{EncMmap, FileMap, Options};
///
/// let dir = tempfile::tempdir()?;
/// let pz = encmap::page::size();
/// let file = FileMap::create(dir.path().join("cache.bin"), pz * 4)?;
///
/// let map = EncMmap::new(
///   file,
///   &[0x11; 16],
///   Options {
///     cache_page_size: pz,
///     cache_size: pz * 2,
///     ..Options::default()
///   },
/// )?;
///
/// unsafe {
///   *map.as_ptr() = 0xAB; // traps, decrypts, becomes writable
///   assert_eq!(*map.as_ptr(), 0xAB);
/// }
/// map.sync()?;
/// # Ok(())
/// # }
/// ```
pub struct EncMmap {
  inner: UnsafeCell<Inner>,
  lock: AtomicBool,
  base: *mut u8,
  size: usize,
  win_size: usize,
}

impl EncMmap {
  /// Creates an encrypted view over `fmap` with a 16-byte (AES-128) or
  /// 32-byte (AES-256) key.
  ///
  /// The map registers itself with the process-wide trap router; the
  /// returned box must stay alive for as long as its address range is
  /// accessed.
  pub fn new(fmap: FileMap, key: &[u8], options: Options) -> Result<Box<Self>> {
    let size = fmap.len();
    options.validate(size)?;

    let page_size = options.cache_page_size;
    let pages = (size + page_size - 1) / page_size;
    let frames = (options.cache_size / page_size).min(pages);
    let win_size = page::ceil(size);

    let cipher = PageCipher::new(key, options.encryption_start_offset)?;
    let pool = FramePool::new(frames, page_size)?;
    let base = unsafe { os::alloc_none(win_size)? };

    let prot = match ProtectionMap::new(base, size, page_size) {
      Ok(prot) => prot,
      Err(error) => {
        let _ = unsafe { os::free(base, win_size) };
        return Err(error);
      }
    };
    debug_assert_eq!(prot.pages(), pages);

    let map = Box::new(EncMmap {
      inner: UnsafeCell::new(Inner {
        fmap,
        cipher,
        pool,
        prot,
        table: vec![NO_PAGE; pages],
        base,
        size,
        win_size,
        page_size,
        pages,
        enc_start: options.encryption_start_offset,
        mode: AccessMode::ReadWrite,
        read_ahead: options.read_ahead,
        sync_on_destroy: options.sync_on_destroy,
        closed: false,
      }),
      lock: AtomicBool::new(false),
      base,
      size,
      win_size,
    });

    router::register(&*map, base as usize, win_size)?;
    debug!(
      "mapped {} pages of {} bytes over {} frames at {:p}",
      pages, page_size, frames, base
    );
    Ok(map)
  }

  /// Returns a pointer to the window's base address.
  ///
  /// The address is constant for the lifetime of the map and aligned to
  /// the cache page size.
  pub fn as_ptr(&self) -> *mut u8 {
    self.base
  }

  /// Returns the size of the window in bytes, equal to the underlying
  /// mapping's size.
  pub fn len(&self) -> usize {
    self.size
  }

  /// Returns whether the window is empty. Construction rejects empty
  /// mappings, so this is always false.
  pub fn is_empty(&self) -> bool {
    self.size == 0
  }

  /// Returns the number of frames in the plaintext cache.
  pub fn frames(&self) -> usize {
    let _guard = self.lock();
    unsafe { &*self.inner.get() }.pool.capacity()
  }

  /// Returns the number of currently resident pages. Diagnostic; the
  /// value may be stale by the time it is returned.
  pub fn resident_pages(&self) -> usize {
    let _guard = self.lock();
    unsafe { &*self.inner.get() }.prot.resident()
  }

  /// Acquires the map's mutual exclusion token.
  ///
  /// While the guard is alive no trap handler and no other public
  /// operation can change which pages are resident, so a caller walking
  /// already-resident memory observes a stable state.
  ///
  /// Touching a *non-resident* page while holding the guard deadlocks:
  /// the trap handler would wait for the guard on the same thread.
  pub fn lock(&self) -> MapGuard<'_> {
    self.raw_lock();
    MapGuard { map: self }
  }

  /// Encrypts every dirty page overlapping `[address, address + len)`
  /// back into the underlying mapping, downgrades it to read-only, and
  /// flushes the affected file range.
  ///
  /// After this returns, the ciphertext reflects every store to the range
  /// that happened before the call.
  pub fn sync_range(&self, address: *const u8, len: usize) -> Result<()> {
    let _guard = self.lock();
    unsafe { &mut *self.inner.get() }.sync_range(address, len)
  }

  /// Encrypts all dirty pages back and flushes the whole mapping;
  /// equivalent to `sync_range` over the entire window.
  pub fn sync(&self) -> Result<()> {
    self.sync_range(self.base, self.size)
  }

  /// Evicts every resident page, writing dirty ones back first, and
  /// advises the OS that the underlying mapping is not needed soon.
  ///
  /// Afterwards the pool is fully free and the next access to any page
  /// traps again.
  pub fn dont_need(&self) -> Result<()> {
    let _guard = self.lock();
    let inner = unsafe { &mut *self.inner.get() };
    inner.evict_all()?;
    inner.fmap.dont_need()
  }

  /// Replaces the encryption key.
  ///
  /// Fails with [Error::Busy] while any page is resident: residency ties
  /// plaintext to the old keystream. Call [dont_need](EncMmap::dont_need)
  /// (after an optional [sync](EncMmap::sync)) first.
  pub fn set_key(&self, key: &[u8]) -> Result<()> {
    let _guard = self.lock();
    let inner = unsafe { &mut *self.inner.get() };
    if inner.closed {
      return Err(Error::Closed);
    }

    if inner.table.iter().any(|frame| *frame != NO_PAGE) {
      return Err(Error::Busy);
    }

    inner.cipher = PageCipher::new(key, inner.enc_start)?;
    debug!("key replaced at {:p}", self.base);
    Ok(())
  }

  /// Selects the protection that future faults may escalate to. Pages
  /// that are already resident keep their current protection.
  pub fn set_access_mode(&self, mode: AccessMode) {
    let _guard = self.lock();
    unsafe { &mut *self.inner.get() }.mode = mode;
  }

  /// Tears the window down: writes dirty pages back, optionally flushes
  /// the file, deregisters from the trap router and unmaps the range.
  ///
  /// Idempotent. Accessing the window afterwards is undefined from this
  /// map's perspective; traps are no longer routed here.
  pub fn unmap(&self) -> Result<()> {
    let _guard = self.lock();
    let inner = unsafe { &mut *self.inner.get() };
    if inner.closed {
      return Ok(());
    }

    router::unregister(self as *const Self);

    let evicted = inner.evict_all();
    let synced = if inner.sync_on_destroy {
      inner.fmap.sync()
    } else {
      Ok(())
    };
    let freed = unsafe { os::free(self.base, self.win_size) };
    inner.closed = true;

    debug!("unmapped window at {:p}", self.base);
    evicted.and(synced).and(freed)
  }

  /// Services a trap at `address`. Called by the router with no locks
  /// held; async-signal-safe along every path it takes.
  ///
  /// `write` tells whether the trapped access was a store, on platforms
  /// where the trap context exposes that.
  pub(crate) fn handle_fault(&self, address: usize, write: Option<bool>) -> FaultOutcome {
    let start = self.base as usize;
    if address < start || address >= start + self.win_size {
      return FaultOutcome::Foreign;
    }

    self.raw_lock();
    let outcome = unsafe { &mut *self.inner.get() }.fault(address, write);
    self.raw_unlock();
    outcome
  }

  fn raw_lock(&self) {
    while self
      .lock
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      std::hint::spin_loop();
    }
  }

  fn raw_unlock(&self) {
    self.lock.store(false, Ordering::Release);
  }
}

impl Drop for EncMmap {
  fn drop(&mut self) {
    let result = self.unmap();
    debug_assert!(result.is_ok(), "tearing down encrypted map: {:?}", result);
  }
}

unsafe impl Send for EncMmap {}
unsafe impl Sync for EncMmap {}

/// An RAII implementation of the map's mutual exclusion token. When this
/// structure is dropped (falls out of scope), the token is released.
#[must_use]
pub struct MapGuard<'a> {
  map: &'a EncMmap,
}

impl Drop for MapGuard<'_> {
  fn drop(&mut self) {
    self.map.raw_unlock();
  }
}

impl Inner {
  /// The fault state machine. The recorded protection classifies the
  /// trap: an inaccessible page is brought in, a readable page being
  /// stored to is upgraded, and anything else lost a race with another
  /// thread and simply retries.
  ///
  /// When the trap context says whether the access was a store, a store
  /// to an inaccessible page becomes resident-writable in one fault, and
  /// a read that raced another thread's fault on a read-only map retries
  /// instead of being mistaken for a violation.
  fn fault(&mut self, address: usize, write: Option<bool>) -> FaultOutcome {
    if self.closed {
      return FaultOutcome::Foreign;
    }

    let index = (address - self.base as usize) / self.page_size;
    match self.prot.get(index) {
      Protection::NONE => {
        let protection = match (self.mode, write) {
          (AccessMode::ReadWrite, Some(true)) => Protection::READ_WRITE,
          _ => Protection::READ,
        };

        if let Err(error) = self.bring_in(index, protection) {
          fatal_fault(&error);
        }
        if write != Some(true) {
          self.read_ahead_from(index);
        }
        FaultOutcome::Serviced
      }
      Protection::READ => {
        if write == Some(false) {
          return FaultOutcome::Serviced;
        }
        if self.mode == AccessMode::ReadOnly {
          return FaultOutcome::Foreign;
        }

        if let Err(error) = self.prot.set(index, Protection::READ_WRITE) {
          fatal_fault(&error);
        }

        let frame = self.table[index] as usize;
        debug_assert_eq!(self.pool.bound_vpage(frame), Some(index));
        self.pool.touch(frame);
        FaultOutcome::Serviced
      }
      _ => FaultOutcome::Serviced,
    }
  }

  /// Makes page `index` resident: acquires a frame (evicting if needed),
  /// decrypts the page's ciphertext into it and binds it into the window.
  ///
  /// Decryption happens before the remap, and the remap carries the final
  /// protection, so no thread can ever read ciphertext through the
  /// window.
  fn bring_in(&mut self, index: usize, protection: Protection) -> Result<()> {
    let page_size = self.page_size;
    let size = self.size;
    let Inner {
      pool,
      prot,
      table,
      fmap,
      cipher,
      ..
    } = self;

    let frame = match pool.acquire(|data, victim| {
      evict(fmap, cipher, prot, table, data, victim, page_size, size)
    }) {
      Some(frame) => frame,
      None => os::fatal("encmap: fatal: all cache frames pinned\n"),
    };

    pool.pin(frame);

    let offset = index * page_size;
    let len = page_size.min(size - offset);
    unsafe {
      ptr::copy_nonoverlapping(fmap.as_ptr().add(offset), pool.frame_ptr(frame), len);
      cipher.apply(offset, slice::from_raw_parts_mut(pool.frame_ptr(frame), len))?;
    }

    let (address, span) = prot.span(index);
    unsafe { os::bind_page(address, span, pool.fd(), pool.frame_offset(frame), protection)? };
    prot.record(index, protection);
    table[index] = frame as u32;
    pool.bind(frame, index);
    pool.unpin(frame);
    Ok(())
  }

  /// Best-effort prefetch of the pages following a fault. Skips already
  /// resident pages and stops as soon as the pool runs low, so it never
  /// evicts on behalf of a page nobody asked for.
  fn read_ahead_from(&mut self, index: usize) {
    if self.read_ahead < 2 {
      return;
    }

    let end = index.saturating_add(self.read_ahead).min(self.pages);
    for next in index + 1..end {
      if self.pool.free_frames() <= 1 {
        break;
      }
      if self.prot.get(next) != Protection::NONE {
        continue;
      }
      if let Err(error) = self.bring_in(next, Protection::READ) {
        fatal_fault(&error);
      }
    }
  }

  fn sync_range(&mut self, address: *const u8, len: usize) -> Result<()> {
    if self.closed {
      return Err(Error::Closed);
    }

    if len == 0 {
      return Err(Error::InvalidParameter("len"));
    }

    let start = self.base as usize;
    let addr = address as usize;
    let end = addr.checked_add(len).ok_or(Error::UnmappedRegion)?;
    if addr < start || end > start + self.size {
      return Err(Error::UnmappedRegion);
    }

    let first = (addr - start) / self.page_size;
    let last = (addr + len - 1 - start) / self.page_size;
    let mut written = 0;

    for index in first..=last {
      if self.prot.get(index) != Protection::READ_WRITE {
        continue;
      }

      let frame = self.table[index] as usize;
      self.pool.pin(frame);

      // Downgrade before reading the frame: a store racing with the
      // write-back either lands before the protection change and is
      // captured, or traps and re-dirties the page afterwards.
      let downgraded = self.prot.set(index, Protection::READ);
      let result = downgraded.and_then(|()| {
        write_back(
          &self.fmap,
          &self.cipher,
          self.pool.frame_ptr(frame),
          index,
          self.page_size,
          self.size,
        )
      });

      self.pool.unpin(frame);
      result?;
      written += 1;
    }

    if written > 0 {
      debug!("synced {} dirty pages at {:p}", written, address);
    }
    self.fmap.sync_range(addr - start, len)
  }

  /// Evicts every resident page. Access to the whole window is cut off
  /// with a single remap before any frame is written back, so no store
  /// can slip in after its page was captured.
  fn evict_all(&mut self) -> Result<()> {
    if self.closed {
      return Err(Error::Closed);
    }

    unsafe { os::unbind_page(self.base, self.win_size)? };

    let mut dirty = 0;
    for index in 0..self.pages {
      let frame = self.table[index];
      if frame == NO_PAGE {
        continue;
      }

      if self.prot.get(index) == Protection::READ_WRITE {
        write_back(
          &self.fmap,
          &self.cipher,
          self.pool.frame_ptr(frame as usize),
          index,
          self.page_size,
          self.size,
        )?;
        dirty += 1;
      }

      self.table[index] = NO_PAGE;
      self.pool.release(frame as usize);
    }

    self.prot.bulk_record(0, self.pages, Protection::NONE);
    debug!("evicted all pages ({} written back)", dirty);
    Ok(())
  }
}

/// Detaches a victim page on behalf of the pool. The page's mapping is
/// replaced first, so every store that raced the eviction is either
/// already in the frame or traps and waits; only then is the frame's
/// plaintext encrypted back. Runs on the fault path.
#[allow(clippy::too_many_arguments)]
fn evict(
  fmap: &FileMap,
  cipher: &PageCipher,
  prot: &ProtectionMap,
  table: &mut [u32],
  data: *mut u8,
  victim: usize,
  page_size: usize,
  size: usize,
) {
  let (address, span) = prot.span(victim);
  if let Err(error) = unsafe { os::unbind_page(address, span) } {
    fatal_fault(&error);
  }

  if prot.get(victim) == Protection::READ_WRITE {
    if let Err(error) = write_back(fmap, cipher, data, victim, page_size, size) {
      fatal_fault(&error);
    }
  }

  prot.record(victim, Protection::NONE);
  table[victim] = NO_PAGE;
}

/// Encrypts one resident page's plaintext into the underlying mapping.
fn write_back(
  fmap: &FileMap,
  cipher: &PageCipher,
  data: *const u8,
  index: usize,
  page_size: usize,
  size: usize,
) -> Result<()> {
  let offset = index * page_size;
  let len = page_size.min(size - offset);

  let src = unsafe { slice::from_raw_parts(data, len) };
  let dst = unsafe { slice::from_raw_parts_mut(fmap.as_ptr().add(offset), len) };
  cipher.apply_b2b(offset, src, dst)
}

/// The fault path cannot return an error to the trapped instruction; its
/// only failure mode is process termination.
fn fatal_fault(error: &Error) -> ! {
  let message = match error {
    Error::SystemCall(_) => "encmap: fatal: memory map call failed in fault handler\n",
    Error::Cipher => "encmap: fatal: cipher failure in fault handler\n",
    _ => "encmap: fatal: unrecoverable error in fault handler\n",
  };
  os::fatal(message)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  const KEY: [u8; 16] = [0x5A; 16];
  const OTHER_KEY: [u8; 32] = [0xC3; 32];

  fn options(frames: usize) -> Options {
    Options {
      cache_page_size: page::size(),
      cache_size: page::size() * frames,
      encryption_start_offset: 0,
      sync_on_destroy: false,
      read_ahead: 0,
    }
  }

  fn scratch(pages: usize) -> Result<(TempDir, FileMap)> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir()?;
    let file = FileMap::create(dir.path().join("window.bin"), page::size() * pages)?;
    Ok((dir, file))
  }

  fn prot_of(map: &EncMmap, index: usize) -> Protection {
    let _guard = map.lock();
    unsafe { &*map.inner.get() }.prot.get(index)
  }

  #[test]
  fn construction_validates_its_options() -> Result<()> {
    let pz = page::size();

    let (_dir, file) = scratch(4)?;
    let mut bad = options(2);
    bad.cache_page_size = pz / 2;
    assert!(matches!(
      EncMmap::new(file, &KEY, bad),
      Err(Error::InvalidParameter("cache_page_size"))
    ));

    let (_dir, file) = scratch(4)?;
    let mut bad = options(2);
    bad.cache_page_size = pz * 3;
    assert!(matches!(
      EncMmap::new(file, &KEY, bad),
      Err(Error::InvalidParameter("cache_page_size"))
    ));

    let (_dir, file) = scratch(4)?;
    let mut bad = options(2);
    bad.cache_size = pz - 1;
    assert!(matches!(
      EncMmap::new(file, &KEY, bad),
      Err(Error::InvalidParameter("cache_size"))
    ));

    let (_dir, file) = scratch(4)?;
    let mut bad = options(2);
    bad.encryption_start_offset = pz * 4;
    assert!(matches!(
      EncMmap::new(file, &KEY, bad),
      Err(Error::InvalidParameter("encryption_start_offset"))
    ));

    let (_dir, file) = scratch(4)?;
    assert!(matches!(
      EncMmap::new(file, &[0; 10], options(2)),
      Err(Error::InvalidKeyLength)
    ));
    Ok(())
  }

  #[test]
  fn loads_return_stored_bytes_across_evictions() -> Result<()> {
    let pz = page::size();
    let dir = tempfile::tempdir()?;
    // A short last page, and a pool far smaller than the window.
    let size = pz * 4 + pz / 2;
    let file = FileMap::create(dir.path().join("window.bin"), size)?;
    let map = EncMmap::new(file, &KEY, options(2))?;

    assert_eq!(map.len(), size);
    assert_eq!(map.frames(), 2);

    let base = map.as_ptr();
    let step = pz / 2;
    unsafe {
      for offset in (0..size).step_by(step) {
        *base.add(offset) = (offset / step) as u8 + 1;
      }
      *base.add(size - 1) = 0xEE;

      for offset in (0..size).step_by(step) {
        assert_eq!(*base.add(offset), (offset / step) as u8 + 1);
      }
      assert_eq!(*base.add(size - 1), 0xEE);
    }
    Ok(())
  }

  #[test]
  fn stores_persist_across_a_reopen_with_the_same_key() -> Result<()> {
    let pz = page::size();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("persist.bin");

    {
      let map = EncMmap::new(FileMap::create(&path, pz * 4)?, &KEY, options(2))?;
      for index in 0..4 {
        unsafe { *map.as_ptr().add(index * pz) = 0xAB };
      }
      map.sync()?;
    }

    let map = EncMmap::new(FileMap::open(&path)?, &KEY, options(2))?;
    for index in 0..4 {
      assert_eq!(unsafe { *map.as_ptr().add(index * pz) }, 0xAB);
    }
    Ok(())
  }

  #[test]
  fn a_single_frame_suffices_for_correctness() -> Result<()> {
    let pz = page::size();
    let (_dir, file) = scratch(3)?;
    let map = EncMmap::new(file, &KEY, options(1))?;
    let base = map.as_ptr();

    // Every access forces the previous page out through the one frame.
    unsafe {
      *base = 0x01;
      *base.add(pz) = 0x02;
      *base.add(pz * 2) = 0x03;

      assert_eq!(*base, 0x01);
      assert_eq!(*base.add(pz), 0x02);
      assert_eq!(*base.add(pz * 2), 0x03);
    }
    assert_eq!(map.resident_pages(), 1);
    Ok(())
  }

  #[test]
  fn header_prefix_is_stored_as_plaintext() -> Result<()> {
    let pz = page::size();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("header.bin");

    let mut opts = options(2);
    opts.encryption_start_offset = 128;
    let map = EncMmap::new(FileMap::create(&path, pz * 4)?, &KEY, opts)?;

    unsafe {
      *map.as_ptr() = 0xCD;
      *map.as_ptr().add(pz) = 0xCD;
    }
    map.sync()?;

    let contents = std::fs::read(&path)?;
    assert_eq!(contents[0], 0xCD);
    assert_ne!(contents[pz], 0xCD);
    Ok(())
  }

  #[test]
  fn synced_ciphertext_decrypts_to_the_plaintext() -> Result<()> {
    let pz = page::size();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cipher.bin");
    let map = EncMmap::new(FileMap::create(&path, pz * 4)?, &KEY, options(2))?;

    let plaintext = *b"sixteen calibres";
    unsafe {
      ptr::copy_nonoverlapping(plaintext.as_ptr(), map.as_ptr().add(pz), plaintext.len());
    }
    map.sync()?;

    let contents = std::fs::read(&path)?;
    let mut recovered = contents[pz..pz + plaintext.len()].to_vec();
    assert_ne!(&recovered[..], &plaintext[..]);

    PageCipher::new(&KEY, 0)?.apply(pz, &mut recovered)?;
    assert_eq!(&recovered[..], &plaintext[..]);
    Ok(())
  }

  #[test]
  fn rekeying_requires_an_empty_cache() -> Result<()> {
    let (_dir, file) = scratch(4)?;
    let map = EncMmap::new(file, &KEY, options(2))?;

    let stored = *b"written with key";
    unsafe {
      ptr::copy_nonoverlapping(stored.as_ptr(), map.as_ptr(), stored.len());
    }

    assert!(matches!(map.set_key(&OTHER_KEY), Err(Error::Busy)));
    map.sync()?;
    // A clean resident page still pins the keystream.
    assert!(matches!(map.set_key(&OTHER_KEY), Err(Error::Busy)));

    map.dont_need()?;
    map.set_key(&OTHER_KEY)?;

    // Decrypting the old ciphertext with the new key yields garbage.
    let mut reread = [0; 16];
    unsafe {
      ptr::copy_nonoverlapping(map.as_ptr(), reread.as_mut_ptr(), reread.len());
    }
    assert_ne!(reread, stored);
    Ok(())
  }

  #[test]
  fn residency_never_exceeds_the_pool() -> Result<()> {
    let pz = page::size();
    let (_dir, file) = scratch(8)?;
    let mut opts = options(3);
    opts.read_ahead = 2;
    let map = EncMmap::new(file, &KEY, opts)?;

    let base = map.as_ptr();
    for round in 0..3u8 {
      for index in 0..8 {
        unsafe { *base.add(index * pz) = round };
        assert!(map.resident_pages() <= 3);
      }
      for index in 0..8 {
        assert_eq!(unsafe { *base.add(index * pz) }, round);
        assert!(map.resident_pages() <= 3);
      }
    }
    Ok(())
  }

  #[test]
  fn fault_states_follow_the_protection_map() -> Result<()> {
    let pz = page::size();
    let (_dir, file) = scratch(4)?;
    let map = EncMmap::new(file, &KEY, options(2))?;
    let base = map.as_ptr();

    unsafe { *base.add(pz) = 0x10 };
    assert_eq!(prot_of(&map, 1), Protection::READ_WRITE);

    let _ = unsafe { ptr::read_volatile(base) };
    assert_eq!(prot_of(&map, 0), Protection::READ);

    map.sync()?;
    assert_eq!(prot_of(&map, 1), Protection::READ);

    unsafe { *base.add(pz) = 0x11 };
    assert_eq!(prot_of(&map, 1), Protection::READ_WRITE);

    map.dont_need()?;
    assert_eq!(prot_of(&map, 0), Protection::NONE);
    assert_eq!(prot_of(&map, 1), Protection::NONE);
    assert_eq!(map.resident_pages(), 0);

    assert_eq!(unsafe { *base.add(pz) }, 0x11);
    Ok(())
  }

  #[test]
  fn sync_dont_need_and_unmap_are_idempotent() -> Result<()> {
    let (_dir, file) = scratch(4)?;
    let map = EncMmap::new(file, &KEY, options(2))?;

    unsafe { *map.as_ptr() = 0x77 };
    map.sync()?;
    map.sync()?;
    map.dont_need()?;
    map.dont_need()?;

    map.unmap()?;
    map.unmap()?;

    assert!(matches!(map.sync(), Err(Error::Closed)));
    assert!(matches!(map.dont_need(), Err(Error::Closed)));
    assert!(matches!(map.set_key(&OTHER_KEY), Err(Error::Closed)));
    Ok(())
  }

  #[test]
  fn read_faults_prefetch_the_following_pages() -> Result<()> {
    let pz = page::size();
    let (_dir, file) = scratch(8)?;
    let mut opts = options(4);
    opts.read_ahead = 3;
    let map = EncMmap::new(file, &KEY, opts)?;

    let _ = unsafe { ptr::read_volatile(map.as_ptr()) };

    // The fault on page 0 pulls in pages 1 and 2; page 3 stays out, and
    // read-ahead keeps one frame in reserve.
    assert_eq!(map.resident_pages(), 3);
    assert_eq!(prot_of(&map, 0), Protection::READ);
    assert_eq!(prot_of(&map, 1), Protection::READ);
    assert_eq!(prot_of(&map, 2), Protection::READ);
    assert_eq!(prot_of(&map, 3), Protection::NONE);

    let _ = unsafe { ptr::read_volatile(map.as_ptr().add(pz * 3)) };
    assert_eq!(prot_of(&map, 3), Protection::READ);
    assert_eq!(map.resident_pages(), 4);
    Ok(())
  }

  #[test]
  fn read_only_mode_serves_loads() -> Result<()> {
    let pz = page::size();
    let (_dir, file) = scratch(4)?;
    let map = EncMmap::new(file, &KEY, options(2))?;

    unsafe { *map.as_ptr().add(pz) = 0x42 };
    map.sync()?;
    map.dont_need()?;

    map.set_access_mode(AccessMode::ReadOnly);
    assert_eq!(unsafe { *map.as_ptr().add(pz) }, 0x42);
    assert_eq!(prot_of(&map, 1), Protection::READ);
    Ok(())
  }

  #[test]
  fn sync_range_touches_only_the_overlapping_pages() -> Result<()> {
    let pz = page::size();
    let (_dir, file) = scratch(4)?;
    let map = EncMmap::new(file, &KEY, options(4))?;
    let base = map.as_ptr();

    unsafe {
      *base = 0x01;
      *base.add(pz) = 0x02;
      *base.add(pz * 2) = 0x03;
    }

    map.sync_range(unsafe { base.add(pz) }, 1)?;
    assert_eq!(prot_of(&map, 0), Protection::READ_WRITE);
    assert_eq!(prot_of(&map, 1), Protection::READ);
    assert_eq!(prot_of(&map, 2), Protection::READ_WRITE);

    assert!(matches!(
      map.sync_range(base, 0),
      Err(Error::InvalidParameter("len"))
    ));
    assert!(matches!(
      map.sync_range(unsafe { base.add(pz * 4) }, 1),
      Err(Error::UnmappedRegion)
    ));
    Ok(())
  }

  #[test]
  fn concurrent_access_stays_transparent_and_bounded() -> Result<()> {
    use rand::{Rng, SeedableRng};

    let pz = page::size();
    let (_dir, file) = scratch(8)?;
    let map = EncMmap::new(file, &KEY, options(3))?;

    const THREADS: usize = 4;
    let iterations = 3000;
    let base_addr = map.as_ptr() as usize;
    let slots = pz * 8 / THREADS;

    std::thread::scope(|scope| {
      for thread in 0..THREADS {
        let map = &map;
        scope.spawn(move || {
          let mut rng = rand::rngs::StdRng::seed_from_u64(thread as u64 + 1);
          let mut written = vec![None; slots];

          for iteration in 0..iterations {
            // Each thread owns the bytes congruent to its index, so
            // values never race; pages still thrash freely.
            let slot = rng.gen_range(0..slots);
            let address = (base_addr + slot * THREADS + thread) as *mut u8;

            match written[slot] {
              Some(expected) if rng.gen_bool(0.5) => {
                assert_eq!(unsafe { *address }, expected);
              }
              _ => {
                let value = rng.gen::<u8>();
                unsafe { *address = value };
                written[slot] = Some(value);
              }
            }

            if iteration % 512 == 0 {
              assert!(map.resident_pages() <= 3);
            }
          }
        });
      }
    });

    assert!(map.resident_pages() <= 3);
    Ok(())
  }

  #[test]
  fn lock_guard_keeps_resident_pages_stable() -> Result<()> {
    let (_dir, file) = scratch(4)?;
    let map = EncMmap::new(file, &KEY, options(2))?;

    unsafe { *map.as_ptr() = 0x99 };
    let resident = map.resident_pages();

    let guard = map.lock();
    // Resident memory can be walked while the guard is held.
    assert_eq!(unsafe { *map.as_ptr() }, 0x99);
    drop(guard);

    assert_eq!(map.resident_pages(), resident);
    Ok(())
  }
}

