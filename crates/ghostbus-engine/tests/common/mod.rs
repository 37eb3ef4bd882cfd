//! Shared fixtures for the trap-engine integration tests.
//!
//! Signal dispositions and device windows are process-global, so every
//! test takes a process-wide serial lock for its whole lifetime and runs
//! the full init/register/…/deinit cycle against a fresh runtime
//! directory. The mock model is a real listener on the engine's model
//! socket: one message per connection, every request recorded, reads
//! scripted per address — exactly the contract a production model speaks.

#![allow(dead_code)] // each test binary uses its own subset

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::JoinHandle;

use ghostbus_proto::{Command, Message, ResultCode, WIRE_LEN};
use tempfile::TempDir;

fn serial_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        // A poisoned lock just means an earlier test failed; the engine
        // was still torn down by the fixture's Drop.
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Serialized, tempdir-scoped engine instance.
pub struct EngineFixture {
    runtime: TempDir,
    _serial: MutexGuard<'static, ()>,
}

impl EngineFixture {
    pub fn new() -> Self {
        let serial = serial_lock();
        let runtime = TempDir::new().expect("create runtime dir");
        std::env::set_var("GHOSTBUS_RUNTIME_DIR", runtime.path());
        ghostbus_engine::init().expect("engine init");
        Self {
            runtime,
            _serial: serial,
        }
    }

    pub fn model_socket(&self) -> PathBuf {
        self.runtime.path().join("model.sock")
    }

    pub fn intr_socket(&self) -> PathBuf {
        self.runtime.path().join("intr.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.runtime.path().join("engine.pid")
    }

    pub fn drop_file(&self) -> PathBuf {
        self.runtime
            .path()
            .join(format!("intr-{}.msg", std::process::id()))
    }
}

impl Drop for EngineFixture {
    fn drop(&mut self) {
        let _ = ghostbus_engine::deinit();
    }
}

type Registers = Arc<Mutex<HashMap<u32, u64>>>;

/// In-process stand-in for the behavioral device model.
pub struct MockModel {
    socket: PathBuf,
    recorded: Arc<Mutex<Vec<Message>>>,
    registers: Registers,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MockModel {
    pub fn start(socket: PathBuf) -> Self {
        let listener = UnixListener::bind(&socket).expect("bind model socket");
        let recorded: Arc<Mutex<Vec<Message>>> = Arc::default();
        let registers: Registers = Arc::default();
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let recorded = Arc::clone(&recorded);
            let registers = Arc::clone(&registers);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || serve(listener, recorded, registers, stop))
        };

        Self {
            socket,
            recorded,
            registers,
            stop,
            thread: Some(thread),
        }
    }

    /// Script the value READs at `address` observe (low `length` bytes,
    /// little-endian).
    pub fn set_register(&self, address: u32, value: u64) {
        self.registers.lock().unwrap().insert(address, value);
    }

    pub fn recorded(&self) -> Vec<Message> {
        self.recorded.lock().unwrap().clone()
    }

    pub fn recorded_with(&self, command: Command) -> Vec<Message> {
        self.recorded()
            .into_iter()
            .filter(|m| m.command == command)
            .collect()
    }

    pub fn clear(&self) {
        self.recorded.lock().unwrap().clear();
    }
}

impl Drop for MockModel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Kick the accept loop awake so it can observe the stop flag.
        let _ = UnixStream::connect(&self.socket);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let _ = std::fs::remove_file(&self.socket);
    }
}

fn serve(
    listener: UnixListener,
    recorded: Arc<Mutex<Vec<Message>>>,
    registers: Registers,
    stop: Arc<AtomicBool>,
) {
    for connection in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let Ok(mut stream) = connection else { break };

        let mut buf = [0u8; WIRE_LEN];
        if stream.read_exact(&mut buf).is_err() {
            continue;
        }
        let Ok(request) = Message::from_bytes(&buf) else {
            continue;
        };
        recorded.lock().unwrap().push(request.clone());

        let mut response = request.clone();
        response.result = ResultCode::Success;
        if request.command == Command::Read {
            let value = registers
                .lock()
                .unwrap()
                .get(&request.address)
                .copied()
                .unwrap_or(0xDEAD_BEEF);
            response.data[..8].copy_from_slice(&value.to_le_bytes());
        }
        let _ = stream.write_all(&response.to_bytes());
    }
}

/// Deliver an INTERRUPT message to the engine's listening socket the way a
/// model does on the synchronous path.
pub fn send_interrupt_message(intr_socket: &std::path::Path, device_id: u32, interrupt_id: u32) {
    let mut stream = UnixStream::connect(intr_socket).expect("connect to engine");
    stream
        .write_all(&Message::interrupt(device_id, interrupt_id).to_bytes())
        .expect("send interrupt");
}
