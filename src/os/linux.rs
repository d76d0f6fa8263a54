use crate::{Error, Result};
use std::os::unix::io::RawFd;

/// Creates an anonymous scratch file of `size` bytes backed by memory.
pub fn scratch_fd(size: usize) -> Result<RawFd> {
  unsafe {
    let fd = libc::memfd_create(b"encmap-pool\0".as_ptr().cast(), libc::MFD_CLOEXEC);
    if fd < 0 {
      return Err(Error::SystemCall(errno::errno()));
    }

    if libc::ftruncate(fd, size as libc::off_t) != 0 {
      let error = Error::SystemCall(errno::errno());
      libc::close(fd);
      return Err(error);
    }

    Ok(fd)
  }
}
