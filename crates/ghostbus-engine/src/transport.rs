//! Request/response transport to the device model.
//!
//! One fresh connection per request: the model accepts, serves one
//! message, and closes, so there is no connection state to share with
//! signal context and no locking. Short reads and writes surface as I/O
//! errors and, like every other transport failure, drop the exchange into
//! the built-in synthetic oracle — the trap engine must stay runnable in
//! isolation, and a trapped instruction has no way to report "model away".

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use ghostbus_proto::{Command, Message, ResultCode, WIRE_LEN};
use tracing::debug;

pub(crate) fn exchange(socket: &Path, request: &Message) -> Message {
    match exchange_socket(socket, request) {
        Ok(response) => response,
        Err(err) => {
            debug!(
                path = %socket.display(),
                %err,
                "model unreachable, answering from the synthetic oracle"
            );
            simulate(request)
        }
    }
}

fn exchange_socket(socket: &Path, request: &Message) -> io::Result<Message> {
    let mut stream = UnixStream::connect(socket)?;
    stream.write_all(&request.to_bytes())?;
    let mut buf = [0u8; WIRE_LEN];
    stream.read_exact(&mut buf)?;
    Message::from_bytes(&buf).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Synthetic oracle used when no model is attached.
///
/// Reads answer `0xDEADBEEF` truncated to the requested size, except that
/// any address whose low byte is `0x04` — the conventional status-register
/// offset — reports a ready bit, so driver init loops make progress.
/// Writes echo the request with SUCCESS.
fn simulate(request: &Message) -> Message {
    let mut response = request.clone();
    response.result = ResultCode::Success;
    if request.command == Command::Read {
        let value: u32 = if request.address & 0xFF == 0x04 {
            0x0000_0001
        } else {
            0xDEAD_BEEF
        };
        response.data[..4].copy_from_slice(&value.to_le_bytes());
    }
    response
}
