//! Passive serial monitor.
//!
//! A read-only mirror of the port: bytes are accumulated into a line buffer
//! and complete lines are handed to a callback. The monitor must never share
//! a port with an active [crate::Session]; stop it before opening one.

use std::{io::Read, time::Duration};

use crate::{
    error::Result,
    flasher::CancelToken,
    interface::{Interface, SerialInterface},
};

/// Buffered bytes are flushed through the callback once the buffer grows
/// past this without a line break.
const LINE_BUFFER_LIMIT: usize = 1000;

/// Accumulates raw output and yields it line by line.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    /// Feed a chunk of port output, emitting every complete line (trailing
    /// `\r` stripped, empty lines dropped).
    fn push(&mut self, chunk: &str, emit: &mut dyn FnMut(&str)) {
        self.pending.push_str(chunk);

        while let Some(index) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=index).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                emit(line);
            }
        }

        if self.pending.len() > LINE_BUFFER_LIMIT {
            let line = std::mem::take(&mut self.pending);
            let line = line.trim();
            if !line.is_empty() {
                emit(line);
            }
        }
    }
}

/// A line-oriented monitor on one serial port.
pub struct Monitor {
    interface: SerialInterface,
    buffer: LineBuffer,
}

impl Monitor {
    /// Open `port_name` at the user-selected baud rate.
    pub fn open(port_name: &str, baud: u32) -> Result<Self> {
        let mut interface = SerialInterface::open(port_name, baud)?;
        interface.set_read_timeout(Duration::from_millis(50))?;

        Ok(Monitor {
            interface,
            buffer: LineBuffer::default(),
        })
    }

    /// One read pass: pull whatever the port has and emit complete lines.
    /// A timeout without data is a normal, silent outcome.
    pub fn poll(&mut self, emit: &mut dyn FnMut(&str)) -> Result<()> {
        let mut chunk = [0u8; 1024];

        match self.interface.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]);
                self.buffer.push(&text, emit);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) => {}
            Err(err) => return Err(err.into()),
        }

        Ok(())
    }

    /// Poll until `stop` is cancelled. The port is released when the monitor
    /// is dropped.
    pub fn run(&mut self, stop: &CancelToken, emit: &mut dyn FnMut(&str)) -> Result<()> {
        while !stop.is_cancelled() {
            self.poll(emit)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(buffer: &mut LineBuffer, chunk: &str) -> Vec<String> {
        let mut lines = Vec::new();
        buffer.push(chunk, &mut |line| lines.push(line.to_string()));
        lines
    }

    #[test]
    fn emits_complete_lines_without_cr() {
        let mut buffer = LineBuffer::default();
        let lines = collect(&mut buffer, "hello\r\nworld\n");
        assert_eq!(lines, ["hello", "world"]);
    }

    #[test]
    fn holds_partial_lines_until_terminated() {
        let mut buffer = LineBuffer::default();
        assert!(collect(&mut buffer, "partial").is_empty());
        assert_eq!(collect(&mut buffer, " line\nnext"), ["partial line"]);
        assert_eq!(collect(&mut buffer, "\n"), ["next"]);
    }

    #[test]
    fn drops_empty_lines() {
        let mut buffer = LineBuffer::default();
        assert!(collect(&mut buffer, "\r\n\n\r\n").is_empty());
    }

    #[test]
    fn flushes_oversized_buffer_without_line_break() {
        let mut buffer = LineBuffer::default();
        let chunk = "x".repeat(LINE_BUFFER_LIMIT + 1);
        let lines = collect(&mut buffer, &chunk);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), LINE_BUFFER_LIMIT + 1);
        assert!(buffer.pending.is_empty());
    }
}
