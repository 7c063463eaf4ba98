//! Library error types.

use miette::Diagnostic;
use thiserror::Error;

use crate::command::CommandType;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between opening a port and rebooting the
/// target.
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Failed to open serial port '{port}'")]
    #[diagnostic(
        code(esprom::port_open),
        help("Make sure the device is connected and no other program holds the port")
    )]
    PortOpenFailed {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("I/O error while using serial port")]
    #[diagnostic(code(esprom::port_io))]
    PortIoFailed(#[source] serialport::Error),

    #[error("Timeout while waiting for the response to the {0} command")]
    #[diagnostic(code(esprom::timeout))]
    Timeout(CommandType),

    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(
        code(esprom::slip_framing),
        help("Hard-reset the device and try again")
    )]
    MalformedFrame,

    #[error("Received packet contains an invalid SLIP escape sequence")]
    #[diagnostic(code(esprom::slip_escape))]
    InvalidEscape,

    #[error("Expected a response to {expected} but the target answered opcode {got:#04x}")]
    #[diagnostic(code(esprom::unexpected_response))]
    UnexpectedResponse { expected: CommandType, got: u8 },

    #[error("Target reported failure: status {status:#04x}, error {code:#04x}")]
    #[diagnostic(code(esprom::target_error))]
    TargetError { status: u8, code: u8 },

    #[error("Gave up synchronizing with the ROM bootloader")]
    #[diagnostic(
        code(esprom::sync_exhausted),
        help("The target may be running an application image; re-enter download mode and retry")
    )]
    SyncExhausted,

    #[error("Could not bring the target into ROM download mode")]
    #[diagnostic(
        code(esprom::bootloader_entry),
        help("Hold the BOOT button, press and release RESET, release BOOT, then retry")
    )]
    BootloaderEntryFailed,

    #[error("Chip detection failed")]
    #[diagnostic(code(esprom::chip_detect))]
    ChipDetectFailed,

    #[error("Failed to attach the SPI flash")]
    #[diagnostic(code(esprom::spi_attach))]
    SpiAttachFailed,

    #[error("Failed to start the flash write")]
    #[diagnostic(code(esprom::flash_begin))]
    FlashBeginFailed,

    #[error("Writing flash block {0} failed")]
    #[diagnostic(code(esprom::flash_data))]
    FlashDataFailed(u32),

    #[error("Failed to finalize the flash write")]
    #[diagnostic(code(esprom::flash_end))]
    FlashEndFailed,

    #[error("Operation cancelled")]
    #[diagnostic(code(esprom::cancelled))]
    Cancelled,
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Error::PortIoFailed(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::PortIoFailed(serialport::Error::new(
            serialport::ErrorKind::Io(err.kind()),
            err.to_string(),
        ))
    }
}
