//! Device registry: which device owns an address, and the protected
//! windows backing the answer.
//!
//! The table is read from the access-violation handler (`find`) and
//! written from user context (register/unregister). Readers cannot take a
//! lock, so mutations follow a fixed discipline: slot contents are written
//! with both engine signals blocked, and the live count is published last
//! on insertion and retired first on deletion. A concurrent signal-context
//! reader therefore sees either the old table or the new one, never a torn
//! record.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::EngineError;
use crate::interrupts::NOTIFY_SIGNAL;
use crate::window::ProtectedWindow;

/// Registry capacity. The working set of a driver process is a handful of
/// peripherals; a fixed bound keeps signal-context lookup allocation free.
pub const MAX_DEVICES: usize = 16;

/// One registered device window.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_id: u32,
    /// Base address. Identical to the reserved virtual address for the
    /// life of the record.
    pub base: u32,
    pub len: u32,
}

impl DeviceRecord {
    /// One past the last address of the window.
    pub fn end(&self) -> u64 {
        self.base as u64 + self.len as u64
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base as u64 && addr < self.end()
    }

    fn overlaps(&self, base: u32, len: u32) -> bool {
        (base as u64) < self.end() && (self.base as u64) < base as u64 + len as u64
    }
}

const EMPTY_RECORD: DeviceRecord = DeviceRecord {
    device_id: 0,
    base: 0,
    len: 0,
};

struct DeviceTable {
    slots: UnsafeCell<[DeviceRecord; MAX_DEVICES]>,
    count: AtomicUsize,
}

// Readers only ever touch slots[..count], and every slot below count was
// written before the count covering it was published.
unsafe impl Sync for DeviceTable {}

impl DeviceTable {
    fn new() -> Self {
        Self {
            slots: UnsafeCell::new([EMPTY_RECORD; MAX_DEVICES]),
            count: AtomicUsize::new(0),
        }
    }

    fn find(&self, pred: impl Fn(&DeviceRecord) -> bool) -> Option<DeviceRecord> {
        let n = self.count.load(Ordering::Acquire).min(MAX_DEVICES);
        let slots = unsafe { &*self.slots.get() };
        slots[..n].iter().copied().find(|r| pred(r))
    }

    /// Caller must hold the registry's writer lock and a [`SignalGuard`].
    fn insert(&self, record: DeviceRecord) -> Result<(), EngineError> {
        let n = self.count.load(Ordering::Relaxed);
        if n >= MAX_DEVICES {
            return Err(EngineError::DeviceTableFull);
        }
        unsafe {
            (*self.slots.get())[n] = record;
        }
        self.count.store(n + 1, Ordering::Release);
        Ok(())
    }

    /// Caller must hold the registry's writer lock and a [`SignalGuard`].
    fn remove(&self, device_id: u32) -> Option<DeviceRecord> {
        let n = self.count.load(Ordering::Relaxed);
        let slots = unsafe { &mut *self.slots.get() };
        let pos = slots[..n].iter().position(|r| r.device_id == device_id)?;
        let record = slots[pos];
        // Retire the count first, then compact by moving the last live
        // record into the hole.
        self.count.store(n - 1, Ordering::Release);
        slots[pos] = slots[n - 1];
        slots[n - 1] = EMPTY_RECORD;
        Some(record)
    }
}

/// Blocks the engine's two signals for the duration of a table mutation.
pub(crate) struct SignalGuard {
    old: libc::sigset_t,
}

impl SignalGuard {
    pub(crate) fn block_engine_signals() -> Self {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGSEGV);
            libc::sigaddset(&mut set, NOTIFY_SIGNAL);
            let mut old: libc::sigset_t = std::mem::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old);
            Self { old }
        }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.old, std::ptr::null_mut());
        }
    }
}

/// Device records plus the window reservations backing them.
pub(crate) struct Registry {
    table: DeviceTable,
    /// Window handles keyed by device id. User-context only; the fault
    /// handler needs records, never handles.
    windows: Mutex<Vec<(u32, ProtectedWindow)>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            table: DeviceTable::new(),
            windows: Mutex::new(Vec::new()),
        }
    }

    /// Reserve `[base, base+len)` and publish the record. Fails without
    /// side effects if the exact window cannot be had.
    pub(crate) fn register(
        &self,
        device_id: u32,
        base: u32,
        len: u32,
    ) -> Result<DeviceRecord, EngineError> {
        if len == 0 {
            return Err(EngineError::EmptyWindow);
        }
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        if base as u64 % page != 0 {
            return Err(EngineError::UnalignedBase(base));
        }

        let mut windows = self.windows.lock().unwrap();
        if self.table.count.load(Ordering::Relaxed) >= MAX_DEVICES {
            return Err(EngineError::DeviceTableFull);
        }
        if self.find_by_id(device_id).is_some() {
            return Err(EngineError::DuplicateDevice(device_id));
        }
        if self.table.find(|r| r.overlaps(base, len)).is_some() {
            return Err(EngineError::OverlappingWindow { base, len });
        }

        let window = ProtectedWindow::reserve(base as u64, len as usize)
            .map_err(|source| EngineError::WindowUnavailable { base, source })?;
        debug_assert_eq!(window.base(), base as u64);

        let record = DeviceRecord {
            device_id,
            base,
            len,
        };
        {
            let _blocked = SignalGuard::block_engine_signals();
            self.table.insert(record)?;
        }
        windows.push((device_id, window));
        Ok(record)
    }

    /// Retire the record and release its window.
    pub(crate) fn unregister(&self, device_id: u32) -> Result<DeviceRecord, EngineError> {
        let mut windows = self.windows.lock().unwrap();
        let record = {
            let _blocked = SignalGuard::block_engine_signals();
            self.table.remove(device_id)
        }
        .ok_or(EngineError::UnknownDevice(device_id))?;
        windows.retain(|(id, _)| *id != device_id);
        Ok(record)
    }

    /// Signal-context safe containment lookup.
    pub(crate) fn find(&self, addr: u64) -> Option<DeviceRecord> {
        self.table.find(|r| r.contains(addr))
    }

    pub(crate) fn find_by_id(&self, device_id: u32) -> Option<DeviceRecord> {
        self.table.find(|r| r.device_id == device_id)
    }
}
