//! Fatal diagnostics that are safe to emit from a signal handler.
//!
//! When the fault handler decides it cannot honor an access, the process
//! must die with a final line of context. `tracing` is not an option at
//! that point (subscribers allocate and lock), so the message is formatted
//! into a fixed stack buffer and pushed to stderr with a bare `write(2)`.
//! This module is the only place the engine terminates the process.

use core::fmt;

pub(crate) struct StackWriter {
    buf: [u8; 256],
    len: usize,
}

impl StackWriter {
    pub(crate) const fn new() -> Self {
        Self {
            buf: [0; 256],
            len: 0,
        }
    }

    /// Write the buffered message and a newline to stderr.
    pub(crate) fn flush_stderr(&self) {
        unsafe {
            libc::write(
                libc::STDERR_FILENO,
                self.buf.as_ptr().cast(),
                self.len,
            );
            libc::write(libc::STDERR_FILENO, b"\n".as_ptr().cast(), 1);
        }
    }
}

impl fmt::Write for StackWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // Truncate silently; a clipped diagnostic still beats none.
        let room = self.buf.len() - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Format a final line to stderr and exit the process with a failure code.
/// Everything it does is async-signal-safe.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        use ::core::fmt::Write as _;
        let mut line = $crate::diag::StackWriter::new();
        let _ = ::core::write!(line, $($arg)*);
        line.flush_stderr();
        unsafe { libc::_exit(1) }
    }};
}

pub(crate) use fatal;
