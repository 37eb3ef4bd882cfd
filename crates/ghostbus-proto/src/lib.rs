//! Wire protocol shared by the ghostbus engine and device models.
//!
//! Both sides of the socket are separate processes (the model is typically
//! not even written in Rust), so the layout is pinned to the byte: five
//! little-endian `u32` header fields followed by a fixed 256-byte payload,
//! 276 bytes total, identical for requests and responses. Tests assert the
//! offsets and the numeric command/result codes so a change here cannot
//! slip past review as a refactor.
//!
//! This crate also owns the interrupt rendezvous record (`"D,I"` ASCII)
//! dropped into the filesystem by models. Parsing is allocation free
//! because the engine reads the record from a signal handler.

use thiserror::Error;

/// Number of payload bytes carried by every message.
pub const DATA_LEN: usize = 256;

/// Total encoded size of a [`Message`]: five `u32` fields plus the payload.
pub const WIRE_LEN: usize = 5 * 4 + DATA_LEN;

/// Command codes, as agreed with the model side.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// Read `length` bytes of register space at `address`.
    Read = 1,
    /// Write the first `length` payload bytes to `address`.
    Write = 2,
    /// Model-to-engine interrupt; the interrupt id travels in `length`.
    Interrupt = 3,
    /// Device registered with the engine.
    Init = 4,
    /// Device unregistered from the engine.
    Deinit = 5,
}

impl Command {
    fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Command::Read,
            2 => Command::Write,
            3 => Command::Interrupt,
            4 => Command::Init,
            5 => Command::Deinit,
            _ => return None,
        })
    }
}

/// Result codes, as agreed with the model side.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0,
    Error = 1,
    Timeout = 2,
    InvalidAddress = 3,
}

impl ResultCode {
    fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ResultCode::Success,
            1 => ResultCode::Error,
            2 => ResultCode::Timeout,
            3 => ResultCode::InvalidAddress,
            _ => return None,
        })
    }
}

/// Decode failure for an incoming message.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message truncated: got {got} of 276 bytes")]
    Truncated { got: usize },
    #[error("unknown command code {0}")]
    UnknownCommand(u32),
    #[error("unknown result code {0}")]
    UnknownResult(u32),
}

/// One request or response exchanged with the device model.
#[derive(Clone)]
pub struct Message {
    pub device_id: u32,
    pub command: Command,
    pub address: u32,
    /// Payload byte count for READ/WRITE; interrupt id for INTERRUPT.
    pub length: u32,
    pub result: ResultCode,
    pub data: [u8; DATA_LEN],
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The payload is 256 bytes of mostly zeroes; show only the live part.
        let live = (self.length as usize).min(DATA_LEN);
        f.debug_struct("Message")
            .field("device_id", &self.device_id)
            .field("command", &self.command)
            .field("address", &format_args!("{:#x}", self.address))
            .field("length", &self.length)
            .field("result", &self.result)
            .field("data", &&self.data[..live])
            .finish()
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.device_id == other.device_id
            && self.command == other.command
            && self.address == other.address
            && self.length == other.length
            && self.result == other.result
            && self.data[..] == other.data[..]
    }
}

impl Eq for Message {}

impl Message {
    /// A zero-payload message with the given header fields.
    pub fn new(device_id: u32, command: Command, address: u32, length: u32) -> Self {
        Self {
            device_id,
            command,
            address,
            length,
            result: ResultCode::Success,
            data: [0; DATA_LEN],
        }
    }

    /// READ request for `size` bytes at `address`.
    pub fn read(device_id: u32, address: u32, size: u32) -> Self {
        Self::new(device_id, Command::Read, address, size)
    }

    /// WRITE request carrying `payload` at `address`.
    ///
    /// Panics if `payload` exceeds [`DATA_LEN`]; callers pass at most the
    /// 8-byte scalar widths.
    pub fn write(device_id: u32, address: u32, payload: &[u8]) -> Self {
        assert!(payload.len() <= DATA_LEN);
        let mut msg = Self::new(device_id, Command::Write, address, payload.len() as u32);
        msg.data[..payload.len()].copy_from_slice(payload);
        msg
    }

    /// INTERRUPT notification for `interrupt_id` (travels in `length`).
    pub fn interrupt(device_id: u32, interrupt_id: u32) -> Self {
        Self::new(device_id, Command::Interrupt, 0, interrupt_id)
    }

    /// The live payload bytes (`length` clamped to the buffer).
    pub fn payload(&self) -> &[u8] {
        &self.data[..(self.length as usize).min(DATA_LEN)]
    }

    /// First `size` payload bytes as a little-endian unsigned integer.
    ///
    /// `size` must be 1, 2, 4, or 8.
    pub fn payload_le(&self, size: usize) -> u64 {
        debug_assert!(matches!(size, 1 | 2 | 4 | 8));
        let mut bytes = [0u8; 8];
        bytes[..size].copy_from_slice(&self.data[..size]);
        u64::from_le_bytes(bytes)
    }

    /// Encode to the fixed wire representation.
    pub fn to_bytes(&self) -> [u8; WIRE_LEN] {
        let mut out = [0u8; WIRE_LEN];
        out[0..4].copy_from_slice(&self.device_id.to_le_bytes());
        out[4..8].copy_from_slice(&(self.command as u32).to_le_bytes());
        out[8..12].copy_from_slice(&self.address.to_le_bytes());
        out[12..16].copy_from_slice(&self.length.to_le_bytes());
        out[16..20].copy_from_slice(&(self.result as u32).to_le_bytes());
        out[20..].copy_from_slice(&self.data);
        out
    }

    /// Decode from the fixed wire representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < WIRE_LEN {
            return Err(WireError::Truncated { got: bytes.len() });
        }
        let field = |i: usize| {
            let off = i * 4;
            u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
        };
        let raw_command = field(1);
        let raw_result = field(4);
        let mut data = [0u8; DATA_LEN];
        data.copy_from_slice(&bytes[20..WIRE_LEN]);
        Ok(Self {
            device_id: field(0),
            command: Command::from_u32(raw_command).ok_or(WireError::UnknownCommand(raw_command))?,
            address: field(2),
            length: field(3),
            result: ResultCode::from_u32(raw_result).ok_or(WireError::UnknownResult(raw_result))?,
            data,
        })
    }
}

/// Maximum encoded size of an interrupt rendezvous record, including the
/// trailing newline: two `u32`s in decimal plus separator.
pub const INTERRUPT_RECORD_MAX: usize = 10 + 1 + 10 + 1;

/// Format the drop-file record for an interrupt `(device_id, interrupt_id)`.
pub fn format_interrupt_record(device_id: u32, interrupt_id: u32) -> String {
    format!("{device_id},{interrupt_id}\n")
}

/// Parse a drop-file record: ASCII `"D,I"`, optional trailing newline.
///
/// Returns `None` on any malformed input. Does not allocate; safe to call
/// from a signal handler on a stack buffer.
pub fn parse_interrupt_record(bytes: &[u8]) -> Option<(u32, u32)> {
    let bytes = match bytes {
        [head @ .., b'\n'] => head,
        other => other,
    };
    let comma = bytes.iter().position(|&b| b == b',')?;
    let (device, interrupt) = (&bytes[..comma], &bytes[comma + 1..]);
    Some((parse_u32_ascii(device)?, parse_u32_ascii(interrupt)?))
}

fn parse_u32_ascii(digits: &[u8]) -> Option<u32> {
    if digits.is_empty() || digits.len() > 10 {
        return None;
    }
    let mut value: u32 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((b - b'0') as u32)?;
    }
    Some(value)
}
