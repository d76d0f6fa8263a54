#![deny(missing_docs, nonstandard_style)]
//! Encrypted demand-paged memory maps.
//!
//! This crate exposes a large, logically contiguous virtual address range
//! whose backing bytes live encrypted in a file mapping but read and write
//! as plaintext. Access is serviced on demand: only a bounded number of
//! fixed-size cache pages are decrypted and resident at any time, the rest
//! of the range is protected so that accesses trap, and the trap handler
//! brings the required page in, evicting (and re-encrypting) another when
//! the cache is full.
//!
//! The building blocks are a process-wide trap router (`SIGSEGV`/`SIGBUS`
//! with `SA_SIGINFO`), per-page `mmap(MAP_FIXED)` remapping onto a scratch
//! fd, and an AES-CTR keystream addressed by virtual byte offset so every
//! page encrypts independently.
//!
//! # Parallelism
//!
//! A map may be shared between threads. Faults and public operations
//! serialize on a per-map token; everything else races freely, and a page
//! evicted under one thread's feet simply traps and returns on the next
//! access. After [EncMmap::sync] returns, the ciphertext reflects every
//! store that happened before the call.
//!
//! # Examples
//!
//! ```
//! # fn main() -> encmap::Result<()> {
//! use encmap::{EncMmap, FileMap, Options};
//!
//! let dir = tempfile::tempdir()?;
//! let pz = encmap::page::size();
//! let file = FileMap::create(dir.path().join("store.bin"), pz * 8)?;
//!
//! let map = EncMmap::new(
//!   file,
//!   &[0x42; 16],
//!   Options {
//!     cache_page_size: pz,
//!     cache_size: pz * 2,
//!     ..Options::default()
//!   },
//! )?;
//!
//! // Stores fault the pages in transparently; at most two stay resident.
//! for index in 0..8 {
//!   unsafe { *map.as_ptr().add(index * pz) = index as u8 };
//! }
//! map.sync()?;
//!
//! for index in 0..8 {
//!   assert_eq!(unsafe { *map.as_ptr().add(index * pz) }, index as u8);
//! }
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

pub use crate::cipher::PageCipher;
pub use crate::error::{Error, Result};
pub use crate::fmap::FileMap;
pub use crate::map::{AccessMode, EncMmap, MapGuard, Options};

mod cipher;
mod error;
mod fmap;
mod map;
mod os;
pub mod page;
mod pool;
mod prot;
mod router;

bitflags! {
  /// A bitflag of zero or more protection attributes.
  ///
  /// Determines the access rights of a virtual page. Pages never become
  /// executable; the window holds data only.
  #[derive(Default)]
  pub struct Protection: usize {
    /// No access allowed at all.
    const NONE = 0;
    /// Read access; a store traps.
    const READ = (1 << 1);
    /// Write access; this flag alone is never used by the map.
    const WRITE = (1 << 2);
    /// Read and write shorthand.
    const READ_WRITE = (Self::READ.bits | Self::WRITE.bits);
  }
}

impl std::fmt::Display for Protection {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    const MAPPINGS: &[(Protection, char)] = &[(Protection::READ, 'r'), (Protection::WRITE, 'w')];

    for (flag, symbol) in MAPPINGS {
      if self.contains(*flag) {
        write!(f, "{}", symbol)?;
      } else {
        write!(f, "-")?;
      }
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn protection_implements_display() {
    assert_eq!(Protection::NONE.to_string(), "--");
    assert_eq!(Protection::READ.to_string(), "r-");
    assert_eq!(Protection::READ_WRITE.to_string(), "rw");
  }
}
