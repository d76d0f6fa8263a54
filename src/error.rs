//! Error types and utilities.

use std::error::Error as StdError;
use std::fmt;

/// The result type used by this library.
pub type Result<T> = std::result::Result<T, Error>;

/// A collection of possible errors.
#[derive(Debug)]
pub enum Error {
  /// A size or offset supplied at construction is invalid (e.g. a cache
  /// page size that is not a power of two).
  InvalidParameter(&'static str),
  /// The supplied key is not 16 or 32 bytes long.
  InvalidKeyLength,
  /// The stream cipher backend reported misuse.
  Cipher,
  /// The map still has resident pages; run `dont_need` first.
  Busy,
  /// The map has already been unmapped.
  Closed,
  /// The address range does not overlap the mapped window.
  UnmappedRegion,
  /// A file operation on the underlying mapping failed.
  Io(std::io::Error),
  /// A system call failed.
  SystemCall(errno::Errno),
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Error::InvalidParameter(param) => write!(f, "invalid parameter value: {}", param),
      Error::InvalidKeyLength => write!(f, "key must be 16 or 32 bytes"),
      Error::Cipher => write!(f, "stream cipher failure"),
      Error::Busy => write!(f, "operation requires no resident pages"),
      Error::Closed => write!(f, "the map has been unmapped"),
      Error::UnmappedRegion => write!(f, "address range is outside the mapped window"),
      Error::Io(error) => write!(f, "{}", error),
      Error::SystemCall(errno) => write!(f, "system call failed with: {}", errno),
    }
  }
}

impl StdError for Error {
  fn source(&self) -> Option<&(dyn StdError + 'static)> {
    match self {
      Error::Io(error) => Some(error),
      _ => None,
    }
  }
}

impl From<std::io::Error> for Error {
  fn from(error: std::io::Error) -> Self {
    Error::Io(error)
  }
}
