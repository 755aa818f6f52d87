//! Device Registry (C1)
//!
//! Maps a device id to a `[base, base+length)` window and answers "which
//! device owns address A?". The window is reserved at the exact address the
//! driver will dereference: `register` must fail rather than let the kernel
//! pick a different address, since driver code bakes the literal address
//! into its instructions.

use std::sync::Mutex;

use crate::with_signals_blocked;
use mmiotrap_config::MAX_DEVICES;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("device id {0} is already registered")]
    AlreadyRegistered(u32),
    #[error("device id {0} is not registered")]
    NotRegistered(u32),
    #[error("registry is full ({MAX_DEVICES} devices)")]
    Full,
    #[error("window [{base:#x}, {end:#x}) overlaps an existing device")]
    Overlaps { base: u32, end: u32 },
    #[error("could not reserve the window at the exact requested address: {0}")]
    ReservationFailed(std::io::Error),
}

/// A registered device's window, as handed to the fault handler.
#[derive(Debug, Clone, Copy)]
pub struct DeviceRecord {
    pub id: u32,
    pub base: u32,
    pub length: u32,
}

impl DeviceRecord {
    pub fn end(&self) -> u64 {
        self.base as u64 + self.length as u64
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base as u64 && address < self.end()
    }
}

/// An anonymous, `PROT_NONE` mapping reserved at an exact virtual address.
///
/// The base address of the mapping is, for its entire lifetime, the device's
/// "physical" address: this is the invariant the whole engine relies on to
/// stay transparent to driver code.
struct ProtectionWindow {
    base: *mut libc::c_void,
    length: usize,
}

// The mapping is exclusively owned by the registry; no aliasing pointers escape.
unsafe impl Send for ProtectionWindow {}

impl ProtectionWindow {
    /// Reserves `[base, base+length)` with no access permissions.
    ///
    /// Uses `MAP_FIXED_NOREPLACE` so a conflicting mapping causes a hard
    /// failure instead of silently clobbering existing memory at `base`.
    fn reserve(base: u32, length: u32) -> Result<ProtectionWindow, RegistryError> {
        let addr = base as usize as *mut libc::c_void;
        let len = length as usize;

        let ptr = unsafe {
            libc::mmap(
                addr,
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(RegistryError::ReservationFailed(std::io::Error::last_os_error()));
        }
        if ptr != addr {
            // Should not happen with MAP_FIXED_NOREPLACE (it fails rather than
            // relocate), but never silently accept a different address.
            unsafe { libc::munmap(ptr, len) };
            return Err(RegistryError::ReservationFailed(std::io::Error::last_os_error()));
        }

        Ok(ProtectionWindow { base: ptr, length: len })
    }
}

impl Drop for ProtectionWindow {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base, self.length);
        }
    }
}

struct Entry {
    record: DeviceRecord,
    #[allow(dead_code)] // kept alive only to hold the mapping until unregister
    window: ProtectionWindow,
}

/// The device registry: a small fixed-capacity table, touched from user
/// context (`register`/`unregister`) and from `SIGSEGV` context (`find`).
///
/// Driver processes described by this engine are single-threaded plus
/// asynchronous signals (see the crate-level docs), so blocking the fault
/// and interrupt signals around a mutation is sufficient to guarantee `find`
/// never observes a torn record: while the signals are blocked, `find` simply
/// cannot run on this thread.
pub struct Registry {
    entries: Mutex<Vec<Entry>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            entries: Mutex::new(Vec::with_capacity(MAX_DEVICES)),
        }
    }

    pub fn register(&self, id: u32, base: u32, length: u32) -> Result<(), RegistryError> {
        with_signals_blocked(|| {
            let mut entries = self.entries.lock().unwrap();

            if entries.len() >= MAX_DEVICES {
                return Err(RegistryError::Full);
            }
            if entries.iter().any(|e| e.record.id == id) {
                return Err(RegistryError::AlreadyRegistered(id));
            }

            let end = base as u64 + length as u64;
            if entries.iter().any(|e| windows_overlap(e.record.base as u64, e.record.end(), base as u64, end)) {
                return Err(RegistryError::Overlaps { base, end: end as u32 });
            }

            let window = ProtectionWindow::reserve(base, length)?;
            entries.push(Entry {
                record: DeviceRecord { id, base, length },
                window,
            });
            Ok(())
        })
    }

    pub fn unregister(&self, id: u32) -> Result<(), RegistryError> {
        with_signals_blocked(|| {
            let mut entries = self.entries.lock().unwrap();
            let pos = entries
                .iter()
                .position(|e| e.record.id == id)
                .ok_or(RegistryError::NotRegistered(id))?;
            entries.remove(pos);
            Ok(())
        })
    }

    /// Returns the record whose window contains `address`, if any.
    pub fn find(&self, address: u32) -> Option<DeviceRecord> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .find(|e| e.record.contains(address as u64))
            .map(|e| e.record)
    }

    /// Same as [`Registry::find`] but for a raw 64-bit address, used by the
    /// bulk-store path where the locator is a register value, not a `u32`.
    pub fn find_u64(&self, address: u64) -> Option<DeviceRecord> {
        let entries = self.entries.lock().unwrap();
        entries.iter().find(|e| e.record.contains(address)).map(|e| e.record)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn windows_overlap(a_base: u64, a_end: u64, b_base: u64, b_end: u64) -> bool {
    a_base < b_end && b_base < a_end
}
