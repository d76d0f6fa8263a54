//! Page related functions.

use crate::os;
use std::sync::Once;

/// Returns the operating system's page size.
///
/// This function uses an internally cached page size, and can be called
/// repeatedly without incurring a significant performance penalty.
#[inline]
pub fn size() -> usize {
  static INIT: Once = Once::new();
  static mut PAGE_SIZE: usize = 0;

  unsafe {
    INIT.call_once(|| PAGE_SIZE = os::page_size());
    PAGE_SIZE
  }
}

/// Rounds an offset down to its closest page boundary.
#[inline]
pub fn floor(offset: usize) -> usize {
  offset & !(size() - 1)
}

/// Rounds an offset up to its closest page boundary.
#[inline]
pub fn ceil(offset: usize) -> usize {
  match offset.checked_add(size() - 1) {
    Some(sum) => sum & !(size() - 1),
    None => floor(offset),
  }
}
