//! Serial transport abstraction.
//!
//! The protocol layers talk to the target through the [Interface] trait so
//! that they stay I/O-agnostic; [SerialInterface] is the native
//! implementation on top of the `serialport` crate, and the test suite
//! substitutes an in-memory simulated target.

use std::{
    io::{Read, Write},
    time::Duration,
};

use serialport::{ClearBuffer, FlowControl, SerialPort};

use crate::error::{Error, Result};

/// How long a single blocking read may wait before reporting "no data yet".
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// A bidirectional byte stream with modem-control lines.
///
/// Reads are bounded by the configured timeout; running into it is normal
/// and surfaces as `Ok(0)` or [std::io::ErrorKind::TimedOut], never as a
/// protocol error. An interface has exactly one user at a time.
pub trait Interface: Read + Write {
    /// Drive the DTR output line.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Drive the RTS output line.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Discard everything received but not yet read.
    fn clear_input_buffer(&mut self) -> Result<()>;

    /// Discard everything written but not yet transmitted.
    fn clear_output_buffer(&mut self) -> Result<()>;

    /// Bound subsequent reads by `timeout`.
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Reconfigure the line speed.
    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;

    /// Current line speed.
    fn baud_rate(&self) -> u32;
}

/// Native serial port transport, 8N1 without flow control.
pub struct SerialInterface {
    port: Box<dyn SerialPort>,
    name: String,
    baud: u32,
}

impl SerialInterface {
    /// Open `port_name` at `baud`.
    pub fn open(port_name: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(port_name, baud)
            .flow_control(FlowControl::None)
            .timeout(POLL_TIMEOUT)
            .open()
            .map_err(|source| Error::PortOpenFailed {
                port: port_name.to_string(),
                source,
            })?;

        Ok(Self {
            port,
            name: port_name.to_string(),
            baud,
        })
    }

    /// The OS name this port was opened under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Read for SerialInterface {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialInterface {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }
}

impl Interface for SerialInterface {
    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.port.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.port.write_request_to_send(level)?;
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn clear_output_buffer(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::Output)?;
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.port.set_timeout(timeout)?;
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.port.set_baud_rate(baud)?;
        self.baud = baud;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }
}

/// Names of the serial ports known to the host.
pub fn available_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(|info| info.port_name).collect())
}
