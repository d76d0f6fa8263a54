use crate::{Error, Protection, Result};
use std::os::unix::io::RawFd;

pub fn page_size() -> usize {
  unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

impl Protection {
  /// Converts the protection flags to native flags.
  pub(crate) fn to_native(self) -> libc::c_int {
    let mut result = libc::PROT_NONE;

    if self.contains(Protection::READ) {
      result |= libc::PROT_READ;
    }

    if self.contains(Protection::WRITE) {
      result |= libc::PROT_WRITE;
    }

    result
  }
}

/// Reserves a range of virtual memory with no access rights.
///
/// The reservation carries `MAP_NORESERVE`, since its pages are only ever
/// made accessible by binding scratch-fd pages over them.
pub unsafe fn alloc_none(size: usize) -> Result<*mut u8> {
  let base = libc::mmap(
    std::ptr::null_mut(),
    size,
    libc::PROT_NONE,
    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
    -1,
    0,
  );

  if base == libc::MAP_FAILED {
    Err(Error::SystemCall(errno::errno()))
  } else {
    Ok(base.cast())
  }
}

/// Allocates an anonymous, readable and writable range outside of any heap.
pub unsafe fn alloc_data(size: usize) -> Result<*mut u8> {
  let base = libc::mmap(
    std::ptr::null_mut(),
    size,
    libc::PROT_READ | libc::PROT_WRITE,
    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
    -1,
    0,
  );

  if base == libc::MAP_FAILED {
    Err(Error::SystemCall(errno::errno()))
  } else {
    Ok(base.cast())
  }
}

/// Maps `size` bytes of a file as shared, writable memory.
pub unsafe fn map_file(fd: RawFd, size: usize) -> Result<*mut u8> {
  let base = libc::mmap(
    std::ptr::null_mut(),
    size,
    libc::PROT_READ | libc::PROT_WRITE,
    libc::MAP_SHARED,
    fd,
    0,
  );

  if base == libc::MAP_FAILED {
    Err(Error::SystemCall(errno::errno()))
  } else {
    Ok(base.cast())
  }
}

pub unsafe fn free(base: *mut u8, size: usize) -> Result<()> {
  match libc::munmap(base.cast(), size) {
    0 => Ok(()),
    _ => Err(Error::SystemCall(errno::errno())),
  }
}

/// Replaces one page's backing with a range of the scratch fd.
///
/// The mapping is `MAP_SHARED`, so loads and stores at `address` alias the
/// scratch fd's pages, which stay reachable through the pool's own mapping
/// regardless of this page's protection. Async-signal-safe.
pub unsafe fn bind_page(
  address: *mut u8,
  size: usize,
  fd: RawFd,
  offset: usize,
  protection: Protection,
) -> Result<()> {
  let base = libc::mmap(
    address.cast(),
    size,
    protection.to_native(),
    libc::MAP_SHARED | libc::MAP_FIXED,
    fd,
    offset as libc::off_t,
  );

  if base == libc::MAP_FAILED {
    Err(Error::SystemCall(errno::errno()))
  } else {
    debug_assert_eq!(base.cast::<u8>(), address);
    Ok(())
  }
}

/// Restores one page to an inaccessible anonymous reservation.
///
/// A single `MAP_FIXED` call both detaches the scratch-fd backing and drops
/// the access rights. Async-signal-safe.
pub unsafe fn unbind_page(address: *mut u8, size: usize) -> Result<()> {
  let base = libc::mmap(
    address.cast(),
    size,
    libc::PROT_NONE,
    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | libc::MAP_NORESERVE,
    -1,
    0,
  );

  if base == libc::MAP_FAILED {
    Err(Error::SystemCall(errno::errno()))
  } else {
    debug_assert_eq!(base.cast::<u8>(), address);
    Ok(())
  }
}

/// Changes the protection of an already-bound range. Async-signal-safe.
pub unsafe fn set_protection(address: *mut u8, size: usize, protection: Protection) -> Result<()> {
  match libc::mprotect(address.cast(), size, protection.to_native()) {
    0 => Ok(()),
    _ => Err(Error::SystemCall(errno::errno())),
  }
}

/// Flushes modified bytes of a shared mapping to its file.
pub unsafe fn sync(address: *mut u8, size: usize) -> Result<()> {
  match libc::msync(address.cast(), size, libc::MS_SYNC) {
    0 => Ok(()),
    _ => Err(Error::SystemCall(errno::errno())),
  }
}

/// Tells the OS the range will not be needed soon.
pub unsafe fn dont_need(address: *mut u8, size: usize) -> Result<()> {
  match libc::madvise(address.cast(), size, libc::MADV_DONTNEED) {
    0 => Ok(()),
    _ => Err(Error::SystemCall(errno::errno())),
  }
}

/// Creates an anonymous scratch file of `size` bytes on Unixes without
/// `memfd_create`. The file is unlinked immediately, so the fd is its only
/// reference.
#[cfg(not(target_os = "linux"))]
pub fn scratch_fd(size: usize) -> Result<RawFd> {
  let mut raw = *b"/tmp/encmap.XXXXXX\0";

  unsafe {
    let fd = libc::mkstemp(raw.as_mut_ptr().cast());
    if fd < 0 {
      return Err(Error::SystemCall(errno::errno()));
    }

    libc::unlink(raw.as_ptr().cast());
    if libc::ftruncate(fd, size as libc::off_t) != 0 {
      let error = Error::SystemCall(errno::errno());
      libc::close(fd);
      return Err(error);
    }

    Ok(fd)
  }
}

/// Writes a message to stderr and aborts the process.
///
/// The fault path has no instruction to report an error to, so fatal
/// conditions terminate the process. Only async-signal-safe calls are used.
pub fn fatal(message: &str) -> ! {
  unsafe {
    let _ = libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
    libc::abort()
  }
}
