//! Process-wide routing of access traps to the owning map.
//!
//! Registration and deregistration are serialized by a registry mutex, but
//! the trap path must never block on it: a fault can interrupt a thread at
//! any instruction, including one holding that mutex. Lookups therefore
//! read an immutable snapshot of the range table through an atomic pointer.
//! Writers publish a fresh snapshot on every change and leak the retired
//! one, which a concurrently-running handler may still be reading; the leak
//! is bounded by the number of map constructions in the process lifetime.
//!
//! The SIGSEGV and SIGBUS actions are installed when the first map
//! registers and restored when the last one deregisters. A trap that lands
//! outside every registered range chains to the previously-installed
//! action with its original `siginfo`.

use crate::map::{EncMmap, FaultOutcome};
use crate::{Error, Result};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Mutex;

#[derive(Clone)]
struct Entry {
  start: usize,
  end: usize,
  map: *const EncMmap,
}

struct Snapshot {
  entries: Vec<Entry>,
}

impl Snapshot {
  /// Returns the map owning `address`, if any. Runs on the trap path.
  fn find(&self, address: usize) -> Option<*const EncMmap> {
    let index = self.entries.partition_point(|entry| entry.start <= address);
    if index == 0 {
      return None;
    }

    let entry = &self.entries[index - 1];
    if address < entry.end {
      Some(entry.map)
    } else {
      None
    }
  }
}

struct OldActions {
  segv: libc::sigaction,
  bus: libc::sigaction,
}

struct Registry {
  entries: Vec<Entry>,
  installed: bool,
}

unsafe impl Send for Registry {}

lazy_static! {
  static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    entries: Vec::new(),
    installed: false,
  });
}

/// Current lookup snapshot; never read through while null.
static SNAPSHOT: AtomicPtr<Snapshot> = AtomicPtr::new(ptr::null_mut());

/// Actions that were installed before ours; read by the chaining path.
static OLD_ACTIONS: AtomicPtr<OldActions> = AtomicPtr::new(ptr::null_mut());

fn registry() -> std::sync::MutexGuard<'static, Registry> {
  match REGISTRY.lock() {
    Ok(guard) => guard,
    Err(poisoned) => poisoned.into_inner(),
  }
}

/// Routes traps for `[start, start + size)` to `map`. Installs the signal
/// actions if this is the first registered map.
pub(crate) fn register(map: *const EncMmap, start: usize, size: usize) -> Result<()> {
  let mut registry = registry();

  registry.entries.push(Entry {
    start,
    end: start + size,
    map,
  });
  registry.entries.sort_by_key(|entry| entry.start);

  if !registry.installed {
    if let Err(error) = unsafe { install() } {
      registry.entries.retain(|entry| entry.map != map);
      return Err(error);
    }
    registry.installed = true;
  }

  publish(&registry.entries);
  Ok(())
}

/// Stops routing traps to `map`. Restores the previous signal actions if
/// this was the last registered map. Tolerates unknown pointers.
pub(crate) fn unregister(map: *const EncMmap) {
  let mut registry = registry();

  registry.entries.retain(|entry| entry.map != map);
  publish(&registry.entries);

  if registry.entries.is_empty() && registry.installed {
    unsafe { uninstall() };
    registry.installed = false;
  }
}

/// Publishes a new lookup snapshot. The retired snapshot is leaked, since
/// a handler on another thread may still hold a pointer into it.
fn publish(entries: &[Entry]) {
  let snapshot = Box::new(Snapshot {
    entries: entries.to_vec(),
  });
  SNAPSHOT.store(Box::into_raw(snapshot), Ordering::Release);
}

unsafe fn install() -> Result<()> {
  let mut action: libc::sigaction = mem::zeroed();
  action.sa_sigaction = handle_trap as usize;
  action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
  libc::sigemptyset(&mut action.sa_mask);

  let mut old = Box::new(OldActions {
    segv: mem::zeroed(),
    bus: mem::zeroed(),
  });

  if libc::sigaction(libc::SIGSEGV, &action, &mut old.segv) != 0 {
    return Err(Error::SystemCall(errno::errno()));
  }
  if libc::sigaction(libc::SIGBUS, &action, &mut old.bus) != 0 {
    let error = Error::SystemCall(errno::errno());
    libc::sigaction(libc::SIGSEGV, &old.segv, ptr::null_mut());
    return Err(error);
  }

  // Replaces (and leaks) the actions from any earlier install cycle.
  OLD_ACTIONS.store(Box::into_raw(old), Ordering::Release);
  Ok(())
}

unsafe fn uninstall() {
  let old = OLD_ACTIONS.load(Ordering::Acquire);
  if !old.is_null() {
    libc::sigaction(libc::SIGSEGV, &(*old).segv, ptr::null_mut());
    libc::sigaction(libc::SIGBUS, &(*old).bus, ptr::null_mut());
  }
}

extern "C" fn handle_trap(
  signal: libc::c_int,
  info: *mut libc::siginfo_t,
  context: *mut libc::c_void,
) {
  let address = unsafe { fault_address(info) };
  let write = unsafe { fault_was_write(context) };

  let snapshot = SNAPSHOT.load(Ordering::Acquire);
  if !snapshot.is_null() {
    if let Some(map) = unsafe { (*snapshot).find(address) } {
      if unsafe { (*map).handle_fault(address, write) } == FaultOutcome::Serviced {
        return;
      }
    }
  }

  unsafe { chain(signal, info, context) }
}

/// Hands a foreign trap to the action that was installed before ours.
unsafe fn chain(signal: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
  let old = OLD_ACTIONS.load(Ordering::Acquire);
  let action: libc::sigaction = if old.is_null() {
    mem::zeroed()
  } else if signal == libc::SIGBUS {
    (*old).bus
  } else {
    (*old).segv
  };

  let handler = action.sa_sigaction;
  if handler == libc::SIG_DFL {
    // Restore the default action and return: the instruction re-executes,
    // traps again and the process terminates with the original signal.
    let mut default: libc::sigaction = mem::zeroed();
    default.sa_sigaction = libc::SIG_DFL;
    libc::sigaction(signal, &default, ptr::null_mut());
  } else if handler == libc::SIG_IGN {
    // Ignored by the previous owner; let the instruction retry.
  } else if action.sa_flags & libc::SA_SIGINFO != 0 {
    let previous: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
      mem::transmute(handler);
    previous(signal, info, context);
  } else {
    let previous: extern "C" fn(libc::c_int) = mem::transmute(handler);
    previous(signal);
  }
}

#[cfg(target_os = "linux")]
unsafe fn fault_address(info: *const libc::siginfo_t) -> usize {
  (*info).si_addr() as usize
}

#[cfg(not(target_os = "linux"))]
unsafe fn fault_address(info: *const libc::siginfo_t) -> usize {
  (*info).si_addr as usize
}

/// Tells whether the trapped access was a store, where the trap context
/// exposes the page-fault error code.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn fault_was_write(context: *mut libc::c_void) -> Option<bool> {
  if context.is_null() {
    return None;
  }

  let context = &*context.cast::<libc::ucontext_t>();
  let code = context.uc_mcontext.gregs[libc::REG_ERR as usize];
  Some(code & 0x2 != 0)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
unsafe fn fault_was_write(_context: *mut libc::c_void) -> Option<bool> {
  None
}
