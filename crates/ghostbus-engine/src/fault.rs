//! The access-violation handler: trap, decode, emulate, resume.
//!
//! Everything here runs in signal context on the faulting thread. The only
//! state read or written is the saved register file inside the signal
//! frame, the (signal-safe) device table, and the per-request model
//! socket. An access the engine cannot emulate faithfully — an opcode
//! outside the supported set, a fault outside every registered window, a
//! descending bulk store — terminates the process: silently advancing RIP
//! would corrupt the driver, and that is the one outcome this design must
//! never allow.

use ghostbus_decoder::{decode, Access, DecodedAccess, StoreSource, MAX_INSTRUCTION_LEN};
use ghostbus_proto::{Message, ResultCode};
use tracing::warn;

use crate::context::{SavedContext, DF_BIT};
use crate::diag::fatal;
use crate::registry::DeviceRecord;
use crate::EngineState;

pub(crate) extern "C" fn on_access_violation(
    _signal: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let fault_addr = unsafe { (*info).si_addr() } as u64;
    let mut saved = unsafe { SavedContext::from_signal(context) };

    let Some(engine) = EngineState::get() else {
        fatal!("ghostbus: fault at {fault_addr:#x} with no engine initialized");
    };

    let rip = saved.rip();
    if rip == 0 {
        fatal!("ghostbus: fault at {fault_addr:#x} with a null instruction pointer");
    }
    // The faulting instruction is well-defined at the saved RIP; read the
    // architectural maximum and let the decoder take what it needs.
    let bytes = unsafe { core::slice::from_raw_parts(rip as *const u8, MAX_INSTRUCTION_LEN) };

    let decoded = match decode(bytes) {
        Ok(decoded) => decoded,
        Err(err) => fatal!(
            "ghostbus: cannot emulate instruction at {rip:#x} (first byte {first:#04x}): {err}",
            first = bytes[0],
        ),
    };

    match decoded.access {
        Access::Load { .. } | Access::Store { .. } => {
            let Some(device) = engine.registry.find(fault_addr) else {
                fatal!("ghostbus: access at {fault_addr:#x} is outside every registered window");
            };
            emulate_scalar(engine, &mut saved, &decoded, device, fault_addr);
        }
        Access::BulkStore { elem_size, rep } => {
            emulate_bulk_store(engine, &mut saved, elem_size, rep, fault_addr);
        }
    }

    saved.advance_rip(decoded.len as u64);
}

fn emulate_scalar(
    engine: &EngineState,
    saved: &mut SavedContext,
    decoded: &DecodedAccess,
    device: DeviceRecord,
    fault_addr: u64,
) {
    match decoded.access {
        Access::Load {
            dest,
            mem_size,
            dest_size,
            sign_extend,
        } => {
            let request = Message::read(device.device_id, fault_addr as u32, mem_size as u32);
            let response = engine.exchange(&request);
            if response.result != ResultCode::Success {
                warn!(
                    result = ?response.result,
                    address = fault_addr,
                    "model rejected load; forwarding its payload anyway"
                );
            }
            let mut value = response.payload_le(mem_size as usize);
            if sign_extend {
                value = sign_extend_to(value, mem_size, dest_size);
            }
            saved.write_reg(dest, value, dest_size);
        }
        Access::Store { source, size } => {
            let value = match source {
                StoreSource::Register(reg) => saved.read_reg(reg, size),
                StoreSource::Immediate(imm) => imm,
            };
            let payload = value.to_le_bytes();
            let request =
                Message::write(device.device_id, fault_addr as u32, &payload[..size as usize]);
            let response = engine.exchange(&request);
            if response.result != ResultCode::Success {
                warn!(result = ?response.result, address = fault_addr, "model rejected store");
            }
        }
        Access::BulkStore { .. } => unreachable!("bulk stores take the dedicated path"),
    }
}

/// REP STOS with the direction flag clear: emit one WRITE per element in
/// ascending address order, truncated at the window end, then write the
/// architectural end state (DI past the last stored element, CX zero) back
/// into the saved frame. Without REP this is the single-element case and
/// CX is left alone.
fn emulate_bulk_store(
    engine: &EngineState,
    saved: &mut SavedContext,
    elem_size: u8,
    rep: bool,
    fault_addr: u64,
) {
    if saved.rflags() & DF_BIT != 0 {
        fatal!(
            "ghostbus: descending (DF=1) bulk store at {rip:#x} is unsupported",
            rip = saved.rip(),
        );
    }

    // The destination index is the locator: with DF clear the first fault
    // lands on the current element, so DI is in-window whenever this is a
    // device access at all.
    let di = saved.rdi();
    let Some(device) = engine.registry.find(di) else {
        fatal!(
            "ghostbus: bulk store to {di:#x} is outside every registered window (fault at {fault_addr:#x})"
        );
    };

    let width = elem_size as u64;
    let requested = if rep { saved.rcx() } else { 1 };
    let available = (device.end() - di) / width;
    let count = requested.min(available);

    let accumulator = saved.rax().to_le_bytes();
    let payload = &accumulator[..elem_size as usize];

    let mut stored: u64 = 0;
    while stored < count {
        let address = di + stored * width;
        let request = Message::write(device.device_id, address as u32, payload);
        let response = engine.exchange(&request);
        if response.result != ResultCode::Success {
            warn!(
                result = ?response.result,
                address,
                stored,
                requested,
                "model rejected bulk store element; stopping"
            );
            break;
        }
        stored += 1;
    }

    if count < requested {
        warn!(
            requested,
            emitted = count,
            window_end = device.end(),
            "bulk store truncated at window end"
        );
    }

    saved.set_rdi(di + stored * width);
    if rep {
        if stored == count {
            saved.set_rcx(0);
        } else {
            // Stopped early on a model error: leave the remainder, the way
            // an interrupted REP would.
            saved.set_rcx(requested - stored);
        }
    }
}

fn sign_extend_to(value: u64, from: u8, to: u8) -> u64 {
    let shift = 64 - 8 * from as u32;
    let wide = (((value << shift) as i64) >> shift) as u64;
    match to {
        2 => wide & 0xFFFF,
        4 => wide & 0xFFFF_FFFF,
        _ => wide,
    }
}
