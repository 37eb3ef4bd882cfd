//! Interrupt delivery round trips: the file+signal path and the
//! synchronous socket poll path.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use common::{send_interrupt_message, EngineFixture};
use ghostbus_engine::NOTIFY_SIGNAL;
use pretty_assertions::assert_eq;

static CALLS: AtomicU32 = AtomicU32::new(0);
static LAST_ID: AtomicU32 = AtomicU32::new(u32::MAX);

// Runs in signal context on the asynchronous path: flag-setting only.
fn on_interrupt(interrupt_id: u32) {
    LAST_ID.store(interrupt_id, Ordering::SeqCst);
    CALLS.fetch_add(1, Ordering::SeqCst);
}

fn reset_counters() {
    CALLS.store(0, Ordering::SeqCst);
    LAST_ID.store(u32::MAX, Ordering::SeqCst);
}

fn wait_for_calls(expected: u32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if CALLS.load(Ordering::SeqCst) == expected {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn notify_self() {
    unsafe {
        libc::kill(std::process::id() as libc::pid_t, NOTIFY_SIGNAL);
    }
}

#[test]
fn drop_file_and_signal_invoke_the_handler_exactly_once() {
    let fixture = EngineFixture::new();
    reset_counters();
    ghostbus_engine::interrupt_handler_register(0x42, on_interrupt).unwrap();

    // The model's side of the protocol: parameters first, then the signal.
    std::fs::write(fixture.drop_file(), "1,66\n").unwrap();
    notify_self();

    assert!(wait_for_calls(1), "callback did not run");
    assert_eq!(LAST_ID.load(Ordering::SeqCst), 0x42);

    // The record is consumed with the delivery.
    assert!(!fixture.drop_file().exists());

    // A second delivery is a second call, not a replay of the first.
    std::fs::write(fixture.drop_file(), "1,66\n").unwrap();
    notify_self();
    assert!(wait_for_calls(2));
}

#[test]
fn unregistered_id_is_dropped_quietly() {
    let fixture = EngineFixture::new();
    reset_counters();
    ghostbus_engine::interrupt_handler_register(0x42, on_interrupt).unwrap();

    // Interrupt id 0x00 has no handler: no callback, no crash.
    std::fs::write(fixture.drop_file(), "1,0\n").unwrap();
    notify_self();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(CALLS.load(Ordering::SeqCst), 0);

    // The engine is still live: a registered delivery works afterwards.
    std::fs::write(fixture.drop_file(), "1,66\n").unwrap();
    notify_self();
    assert!(wait_for_calls(1));
}

#[test]
fn spurious_signal_without_a_record_is_ignored() {
    let _fixture = EngineFixture::new();
    reset_counters();
    ghostbus_engine::interrupt_handler_register(0x42, on_interrupt).unwrap();

    notify_self();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(CALLS.load(Ordering::SeqCst), 0);
}

#[test]
fn malformed_records_are_ignored() {
    let fixture = EngineFixture::new();
    reset_counters();
    ghostbus_engine::interrupt_handler_register(0x42, on_interrupt).unwrap();

    for garbage in ["", "66", "a,b\n", "1,66,3\n"] {
        std::fs::write(fixture.drop_file(), garbage).unwrap();
        notify_self();
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(CALLS.load(Ordering::SeqCst), 0);
}

#[test]
fn poll_path_dispatches_a_socket_interrupt() {
    let fixture = EngineFixture::new();
    reset_counters();
    ghostbus_engine::interrupt_handler_register(0x7, on_interrupt).unwrap();

    send_interrupt_message(&fixture.intr_socket(), 1, 0x7);
    let dispatched = ghostbus_engine::poll_model_interrupts().unwrap();
    assert_eq!(dispatched, Some(0x7));
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(LAST_ID.load(Ordering::SeqCst), 0x7);
}

#[test]
fn poll_returns_promptly_when_idle() {
    let _fixture = EngineFixture::new();

    let started = Instant::now();
    let dispatched = ghostbus_engine::poll_model_interrupts().unwrap();
    assert_eq!(dispatched, None);
    // One poll cycle is bounded by its ~100 ms timeout, not by a blocking
    // accept.
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn poll_drops_interrupts_with_no_handler() {
    let fixture = EngineFixture::new();
    reset_counters();

    send_interrupt_message(&fixture.intr_socket(), 1, 0x9);
    let dispatched = ghostbus_engine::poll_model_interrupts().unwrap();
    assert_eq!(dispatched, None);
    assert_eq!(CALLS.load(Ordering::SeqCst), 0);
}
