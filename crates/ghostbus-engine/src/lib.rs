//! MMIO access-trap engine.
//!
//! ghostbus lets unmodified driver code run as a normal user-space process
//! while its device registers live in a behavioral model in another
//! process. A driver registers a device window (say `0x4000_0000` +
//! 4 KiB); the engine reserves exactly those addresses with no access
//! permissions, so every load and store traps. The fault handler decodes
//! the faulting instruction, forwards the access to the model over a local
//! socket, patches the saved register file and instruction pointer, and
//! resumes the driver none the wiser. Interrupts travel the other way:
//! the model drops a parameter record and signals the process (or the
//! driver polls the engine's socket), and a registered callback runs.
//!
//! Host requirements are deliberate non-goals elsewhere: x86-64 Linux,
//! single driver thread plus the engine's two signal contexts.
//!
//! ```no_run
//! fn on_rx(interrupt: u32) {
//!     // signal context: set a flag, return
//!     let _ = interrupt;
//! }
//!
//! ghostbus_engine::init()?;
//! ghostbus_engine::device_register(1, 0x4000_0000, 0x1000)?;
//! ghostbus_engine::interrupt_handler_register(0x1, on_rx)?;
//!
//! // From here on, `*(0x4000_0004 as *const u32)` traps into the engine.
//! let status = ghostbus_engine::register_read(0x4000_0004, 4)?;
//! assert_eq!(status & 1, 1);
//!
//! ghostbus_engine::device_unregister(1)?;
//! ghostbus_engine::deinit()?;
//! # Ok::<(), ghostbus_engine::EngineError>(())
//! ```

mod config;
mod context;
mod diag;
mod error;
mod fault;
mod interrupts;
mod registry;
mod transport;
mod window;

pub use config::{EngineConfig, DEFAULT_RUNTIME_DIR};
pub use error::EngineError;
pub use interrupts::{InterruptHandler, MAX_INTERRUPT_HANDLERS, NOTIFY_SIGNAL};
pub use registry::MAX_DEVICES;

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicPtr, Ordering};

use ghostbus_proto::{Command, Message, ResultCode};
use tracing::{info, warn};

/// Everything the engine owns, created by [`init`] and destroyed by
/// [`deinit`].
///
/// Signal handlers need a stable, non-relocatable handle to this state, so
/// the one instance lives behind a global pointer rather than in caller
/// hands. All signal-context access goes through [`EngineState::get`].
pub(crate) struct EngineState {
    config: EngineConfig,
    pub(crate) registry: registry::Registry,
    pub(crate) interrupts: interrupts::InterruptTable,
    pub(crate) listener: UnixListener,
    /// Drop-file path as a C string, pre-computed so the notification
    /// handler never formats or allocates.
    pub(crate) drop_file: CString,
    old_access: libc::sigaction,
    old_notify: libc::sigaction,
}

static ENGINE: AtomicPtr<EngineState> = AtomicPtr::new(std::ptr::null_mut());

impl EngineState {
    pub(crate) fn get() -> Option<&'static EngineState> {
        let ptr = ENGINE.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // Published by init and only retired by deinit, which the
            // single-driver-thread model forbids racing with an access.
            Some(unsafe { &*ptr })
        }
    }

    pub(crate) fn exchange(&self, request: &Message) -> Message {
        transport::exchange(&self.config.model_socket, request)
    }
}

/// Initialize the engine with configuration from the environment.
///
/// Installs the access-violation and interrupt-notification handlers,
/// binds the interrupt listening socket, and writes the PID rendezvous
/// file. Must be called before any device is registered.
pub fn init() -> Result<(), EngineError> {
    init_with_config(EngineConfig::from_env())
}

/// [`init`] with an explicit configuration.
pub fn init_with_config(config: EngineConfig) -> Result<(), EngineError> {
    if !ENGINE.load(Ordering::Acquire).is_null() {
        return Err(EngineError::AlreadyInitialized);
    }

    std::fs::create_dir_all(&config.runtime_dir)?;
    // A stale socket from a crashed run would make bind fail forever.
    let _ = std::fs::remove_file(&config.intr_socket);
    let listener = UnixListener::bind(&config.intr_socket)?;

    let pid = std::process::id();
    std::fs::write(&config.pid_file, format!("{pid}\n"))?;

    let drop_path = config.drop_file(pid);
    let drop_file = CString::new(drop_path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "NUL in runtime path"))?;

    let mut state = Box::new(EngineState {
        config,
        registry: registry::Registry::new(),
        interrupts: interrupts::InterruptTable::new(),
        listener,
        drop_file,
        old_access: unsafe { std::mem::zeroed() },
        old_notify: unsafe { std::mem::zeroed() },
    });

    unsafe {
        state.old_access = install_handler(libc::SIGSEGV, fault::on_access_violation)?;
        match install_handler(NOTIFY_SIGNAL, interrupts::on_model_notification) {
            Ok(old) => state.old_notify = old,
            Err(err) => {
                libc::sigaction(libc::SIGSEGV, &state.old_access, std::ptr::null_mut());
                return Err(err);
            }
        }
    }

    ENGINE.store(Box::into_raw(state), Ordering::Release);
    info!(pid, "engine initialized");
    Ok(())
}

type SigInfoHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// # Safety
///
/// `handler` must be safe to invoke for `SA_SIGINFO` delivery of `signal`.
unsafe fn install_handler(
    signal: libc::c_int,
    handler: SigInfoHandler,
) -> Result<libc::sigaction, EngineError> {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = handler as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    libc::sigemptyset(&mut action.sa_mask);
    let mut old: libc::sigaction = std::mem::zeroed();
    if libc::sigaction(signal, &action, &mut old) != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(old)
}

/// Tear the engine down: restore the previous signal dispositions, release
/// every window, close the listening socket, remove the rendezvous files.
pub fn deinit() -> Result<(), EngineError> {
    let ptr = ENGINE.swap(std::ptr::null_mut(), Ordering::AcqRel);
    if ptr.is_null() {
        return Err(EngineError::NotInitialized);
    }
    let state = unsafe { Box::from_raw(ptr) };

    unsafe {
        libc::sigaction(libc::SIGSEGV, &state.old_access, std::ptr::null_mut());
        libc::sigaction(NOTIFY_SIGNAL, &state.old_notify, std::ptr::null_mut());
    }

    let _ = std::fs::remove_file(&state.config.intr_socket);
    let _ = std::fs::remove_file(&state.config.pid_file);
    let _ = std::fs::remove_file(state.config.drop_file(std::process::id()));

    info!("engine deinitialized");
    // Dropping the state unmaps every window and closes the listener.
    drop(state);
    Ok(())
}

fn engine() -> Result<&'static EngineState, EngineError> {
    EngineState::get().ok_or(EngineError::NotInitialized)
}

fn validate_size(size: u32) -> Result<(), EngineError> {
    match size {
        1 | 2 | 4 | 8 => Ok(()),
        other => Err(EngineError::InvalidAccessSize(other)),
    }
}

/// Register a device window at exactly `[base, base+len)`.
///
/// On success every access in the window traps into the engine, and the
/// model has been told (best-effort) with an INIT message.
pub fn device_register(device_id: u32, base: u32, len: u32) -> Result<(), EngineError> {
    let state = engine()?;
    state.registry.register(device_id, base, len)?;
    info!(device_id, base, len, "device registered");

    let response = state.exchange(&Message::new(device_id, Command::Init, base, len));
    if response.result != ResultCode::Success {
        warn!(device_id, result = ?response.result, "model rejected INIT");
    }
    Ok(())
}

/// Unregister a device and release its window. Tells the model with a
/// DEINIT message (best-effort) first.
pub fn device_unregister(device_id: u32) -> Result<(), EngineError> {
    let state = engine()?;
    let record = state
        .registry
        .find_by_id(device_id)
        .ok_or(EngineError::UnknownDevice(device_id))?;

    let response = state.exchange(&Message::new(
        device_id,
        Command::Deinit,
        record.base,
        record.len,
    ));
    if response.result != ResultCode::Success {
        warn!(device_id, result = ?response.result, "model rejected DEINIT");
    }

    state.registry.unregister(device_id)?;
    info!(device_id, "device unregistered");
    Ok(())
}

/// Read a device register through the model without trapping.
///
/// `size` is 1, 2, 4, or 8; the result is the model's payload interpreted
/// little-endian. The address must fall inside a registered window.
pub fn register_read(address: u32, size: u32) -> Result<u64, EngineError> {
    validate_size(size)?;
    let state = engine()?;
    let device = state
        .registry
        .find(address as u64)
        .ok_or(EngineError::NoDeviceAt(address))?;

    let response = state.exchange(&Message::read(device.device_id, address, size));
    if response.result != ResultCode::Success {
        warn!(address, result = ?response.result, "model rejected register read");
    }
    Ok(response.payload_le(size as usize))
}

/// Write a device register through the model without trapping.
pub fn register_write(address: u32, value: u64, size: u32) -> Result<(), EngineError> {
    validate_size(size)?;
    let state = engine()?;
    let device = state
        .registry
        .find(address as u64)
        .ok_or(EngineError::NoDeviceAt(address))?;

    let payload = value.to_le_bytes();
    let response = state.exchange(&Message::write(
        device.device_id,
        address,
        &payload[..size as usize],
    ));
    if response.result != ResultCode::Success {
        warn!(address, result = ?response.result, "model rejected register write");
    }
    Ok(())
}

/// Register `handler` for `interrupt_id`, replacing any previous handler
/// for that id. At most [`MAX_INTERRUPT_HANDLERS`] distinct ids can be
/// registered. The handler may run in signal context; see
/// [`InterruptHandler`].
pub fn interrupt_handler_register(
    interrupt_id: u32,
    handler: InterruptHandler,
) -> Result<(), EngineError> {
    engine()?.interrupts.register(interrupt_id, handler)
}

/// Run one accept-and-dispatch cycle on the interrupt socket, waiting at
/// most ~100 ms. Returns the dispatched interrupt id, if any. This is the
/// synchronous alternative to the signal-based delivery path.
pub fn poll_model_interrupts() -> Result<Option<u32>, EngineError> {
    let state = engine()?;
    interrupts::poll_once(state).map_err(EngineError::from)
}
