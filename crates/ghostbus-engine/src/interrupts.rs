//! Model-to-driver interrupt delivery.
//!
//! Two paths surface a model interrupt as a callback:
//!
//! 1. **Asynchronous (file + signal).** The model writes a `"D,I"` record
//!    into the drop file named after the driver's PID (advertised in the
//!    PID rendezvous file) and sends [`NOTIFY_SIGNAL`]. The handler below
//!    reads, parses, dispatches, and unlinks — open/read/close/unlink with
//!    a stack buffer, nothing that can allocate. The drop-file path itself
//!    is pre-computed at init for the same reason.
//! 2. **Synchronous (socket poll).** [`poll_once`] accepts one connection
//!    on the engine's listening socket, bounded by a short `poll` timeout,
//!    and dispatches a protocol INTERRUPT message. Test fixtures and main
//!    loops that cannot tolerate signals use this.
//!
//! Callbacks take the single interrupt-id argument and run in whatever
//! context delivered them; for the signal path that means asynchronous
//! signal context, so callbacks should set a flag and return.

use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use ghostbus_proto::{parse_interrupt_record, Command, Message, WIRE_LEN};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::EngineState;

/// Signal a model sends to announce a pending interrupt record.
pub const NOTIFY_SIGNAL: libc::c_int = libc::SIGUSR1;

/// How many distinct interrupt ids can have handlers at once.
pub const MAX_INTERRUPT_HANDLERS: usize = 16;

/// Interrupt callback. Runs in signal context on the asynchronous path:
/// no allocation, no locks shared with the main thread, no blocking I/O.
pub type InterruptHandler = fn(u32);

/// How long one [`poll_once`] cycle waits for a connection.
pub(crate) const POLL_TIMEOUT_MS: i32 = 100;

struct Slot {
    id: AtomicU32,
    handler: AtomicUsize,
}

/// Fixed-capacity interrupt-id → callback map, readable from signal
/// context.
///
/// Handlers are stored as one machine word each (zero = empty) and the
/// live count is published after the slot it covers, so a signal-context
/// reader always sees whole entries. Registration is user-context only;
/// re-registering an id swaps its handler word in place.
pub(crate) struct InterruptTable {
    slots: [Slot; MAX_INTERRUPT_HANDLERS],
    count: AtomicUsize,
}

impl InterruptTable {
    pub(crate) fn new() -> Self {
        const EMPTY: Slot = Slot {
            id: AtomicU32::new(0),
            handler: AtomicUsize::new(0),
        };
        Self {
            slots: [EMPTY; MAX_INTERRUPT_HANDLERS],
            count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn register(&self, id: u32, handler: InterruptHandler) -> Result<(), EngineError> {
        let n = self.count.load(Ordering::Acquire);
        for slot in &self.slots[..n] {
            if slot.id.load(Ordering::Relaxed) == id {
                slot.handler.store(handler as usize, Ordering::Release);
                return Ok(());
            }
        }
        if n >= MAX_INTERRUPT_HANDLERS {
            return Err(EngineError::HandlerTableFull);
        }
        self.slots[n].id.store(id, Ordering::Relaxed);
        self.slots[n].handler.store(handler as usize, Ordering::Release);
        self.count.store(n + 1, Ordering::Release);
        Ok(())
    }

    /// Invoke the callback registered for `id`. Returns false (after a log
    /// line) when nothing is registered.
    pub(crate) fn dispatch(&self, id: u32) -> bool {
        let n = self.count.load(Ordering::Acquire).min(MAX_INTERRUPT_HANDLERS);
        for slot in &self.slots[..n] {
            if slot.id.load(Ordering::Relaxed) != id {
                continue;
            }
            let raw = slot.handler.load(Ordering::Acquire);
            if raw == 0 {
                break;
            }
            // Stored from a valid fn(u32) in register(); zero filtered above.
            let handler: InterruptHandler = unsafe { std::mem::transmute(raw) };
            handler(id);
            return true;
        }
        warn!(interrupt = id, "dropping interrupt with no registered handler");
        false
    }
}

/// `NOTIFY_SIGNAL` handler: deliver one drop-file record, if present.
pub(crate) extern "C" fn on_model_notification(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    if let Some(engine) = EngineState::get() {
        deliver_from_drop_file(engine);
    }
}

fn deliver_from_drop_file(engine: &EngineState) {
    let path = engine.drop_file.as_ptr();
    let mut buf = [0u8; 64];
    let n = unsafe {
        let fd = libc::open(path, libc::O_RDONLY);
        if fd < 0 {
            // Spurious signal, or the model signalled before writing.
            return;
        }
        let n = libc::read(fd, buf.as_mut_ptr().cast(), buf.len());
        libc::close(fd);
        libc::unlink(path);
        n
    };
    if n <= 0 {
        return;
    }

    // The device id is part of the record contract but callbacks take the
    // interrupt id alone.
    match parse_interrupt_record(&buf[..n as usize]) {
        Some((_device_id, interrupt_id)) => {
            engine.interrupts.dispatch(interrupt_id);
        }
        None => warn!("malformed interrupt record in drop file"),
    }
}

/// One non-blocking accept-and-dispatch cycle on the engine's listening
/// socket. Returns the dispatched interrupt id, or `None` if nothing
/// arrived (or the arrival was not a deliverable interrupt) within the
/// poll bound.
pub(crate) fn poll_once(engine: &EngineState) -> io::Result<Option<u32>> {
    let mut pfd = libc::pollfd {
        fd: engine.listener.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, POLL_TIMEOUT_MS) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if rc == 0 || pfd.revents & libc::POLLIN == 0 {
        return Ok(None);
    }

    let (mut stream, _) = engine.listener.accept()?;
    let mut buf = [0u8; WIRE_LEN];
    stream.read_exact(&mut buf)?;
    let message = Message::from_bytes(&buf)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

    if message.command != Command::Interrupt {
        debug!(command = ?message.command, "ignoring non-interrupt message on interrupt socket");
        return Ok(None);
    }

    // By wire agreement the interrupt id travels in the length field.
    let interrupt_id = message.length;
    if engine.interrupts.dispatch(interrupt_id) {
        Ok(Some(interrupt_id))
    } else {
        Ok(None)
    }
}
