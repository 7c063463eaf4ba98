//! Flashing sessions against a target's ROM bootloader.
//!
//! A [Session] owns the serial transport for its whole lifetime and walks a
//! linear pipeline: bootloader entry, SYNC handshake, chip detection, SPI
//! flash attach, the FLASH_BEGIN / FLASH_DATA / FLASH_END write sequence,
//! and finally an optional reboot into the freshly written application.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::sleep,
    time::Duration,
};

use log::{debug, warn};

use crate::{
    command::Command,
    connection::{reset::hard_reset, Connection},
    error::{Error, Result},
    interface::{Interface, SerialInterface},
    progress::ProgressSink,
    targets::{Chip, CHIP_DETECT_MAGIC_REG_ADDR},
};

/// Baud rate every session starts at; the ROM listens here after reset.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Write unit passed to FLASH_DATA.
pub const FLASH_WRITE_SIZE: usize = 0x400;

/// Erase unit used to round the erase region.
pub const FLASH_SECTOR_SIZE: usize = 0x1000;

/// Attempts per FLASH_DATA block before the write is abandoned.
const FLASH_DATA_ATTEMPTS: usize = 3;

/// Cooperative cancellation handle for a running session.
///
/// Cloneable; flipping it from another thread makes the session abort with
/// [Error::Cancelled] at its next sleep point or block boundary.
#[derive(Debug, Default, Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the associated session to stop.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Total erase region for an image, rounded up to whole sectors.
pub(crate) fn erase_size(image_size: usize) -> u32 {
    (image_size.div_ceil(FLASH_SECTOR_SIZE) * FLASH_SECTOR_SIZE) as u32
}

/// Number of FLASH_DATA blocks an image needs.
pub(crate) fn block_count(image_size: usize, block_size: usize) -> u32 {
    image_size.div_ceil(block_size) as u32
}

/// An exclusive flashing session on one serial port.
///
/// The session either holds an open transport or has been closed; every exit
/// path, including errors, releases the port with both control lines low.
pub struct Session<'s, I: Interface = SerialInterface> {
    connection: Option<Connection<I>>,
    port_name: String,
    baud: u32,
    chip: Chip,
    block_size: usize,
    sink: &'s mut dyn ProgressSink,
}

impl<'s> Session<'s, SerialInterface> {
    /// Open `port_name` and force the target into ROM download mode using
    /// the reset engine.
    pub fn open(port_name: &str, sink: &'s mut dyn ProgressSink) -> Result<Self> {
        let interface = SerialInterface::open(port_name, DEFAULT_BAUD)?;
        let mut session = Session::with_interface_named(interface, port_name, sink);

        session.sink.emit_log("Entering ROM download mode...");
        match session.connection().and_then(Connection::begin) {
            Ok(()) => {
                session.sink.emit_log("Target is in ROM download mode");
                Ok(session)
            }
            Err(err) => {
                session.emit_entry_help(&err);
                session.close();
                Err(err)
            }
        }
    }

    /// Open `port_name` without touching the control lines; the user has put
    /// the target into download mode by hand. Validated with a single SYNC.
    pub fn open_manual(port_name: &str, sink: &'s mut dyn ProgressSink) -> Result<Self> {
        let interface = SerialInterface::open(port_name, DEFAULT_BAUD)?;
        let mut session = Session::with_interface_named(interface, port_name, sink);

        session.sink.emit_log("Manual mode: expecting the target to already be in download mode");
        let probe = session
            .connection()
            .and_then(|connection| connection.sync_probe(crate::command::CommandType::Sync.timeout()));

        match probe {
            Ok(()) => {
                session.sink.emit_log("Target is in ROM download mode");
                Ok(session)
            }
            Err(err) => {
                debug!("manual-mode SYNC probe failed: {err}");
                session.emit_entry_help(&Error::BootloaderEntryFailed);
                session.close();
                Err(Error::BootloaderEntryFailed)
            }
        }
    }
}

impl<'s, I: Interface> Session<'s, I> {
    /// Wrap an already-open transport.
    ///
    /// No reset or validation is performed; the caller vouches for the
    /// target's state. This is also the seam the test suite uses to drive a
    /// session against a simulated target.
    pub fn with_interface(interface: I, sink: &'s mut dyn ProgressSink) -> Self {
        Self::with_interface_named(interface, "<attached>", sink)
    }

    fn with_interface_named(interface: I, port_name: &str, sink: &'s mut dyn ProgressSink) -> Self {
        let baud = interface.baud_rate();
        Session {
            connection: Some(Connection::new(interface)),
            port_name: port_name.to_string(),
            baud,
            chip: Chip::Unknown,
            block_size: FLASH_WRITE_SIZE,
            sink,
        }
    }

    /// Route a cancellation handle into the session's wait loops.
    pub fn set_cancel_token(&mut self, token: CancelToken) {
        if let Some(connection) = self.connection.as_mut() {
            connection.set_cancel_token(token);
        }
    }

    /// The chip variant detected during the last flash operation.
    pub fn chip(&self) -> Chip {
        self.chip
    }

    /// The port this session was opened on.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// The current line speed.
    pub fn baud(&self) -> u32 {
        self.baud
    }

    fn connection(&mut self) -> Result<&mut Connection<I>> {
        self.connection.as_mut().ok_or_else(|| {
            Error::PortIoFailed(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                "session is closed",
            ))
        })
    }

    /// Write `image` into SPI flash at `offset`.
    ///
    /// Runs the full pipeline: sync, chip detection, SPI attach, erase and
    /// block writes, finalize. Any failure closes the session.
    pub fn flash_image(&mut self, image: &[u8], offset: u32) -> Result<()> {
        let result = self.run_flash_pipeline(image, offset);

        if let Err(err) = &result {
            self.sink.emit_log(&format!("Flashing failed: {err}"));
            self.close();
        }

        result
    }

    fn run_flash_pipeline(&mut self, image: &[u8], offset: u32) -> Result<()> {
        debug!(
            "flashing {} bytes to {offset:#x} on {}",
            image.len(),
            self.port_name
        );

        self.connection()?.wakeup()?;

        self.sink.emit_progress(10, "Synchronizing...");
        self.connection()?.sync()?;

        self.sink.emit_progress(20, "Detecting chip...");
        self.detect_chip()?;

        self.sink.emit_progress(30, "Attaching SPI flash...");
        self.spi_attach()?;

        self.sink.emit_progress(40, "Erasing flash...");
        self.flash_begin(image.len(), offset)?;
        self.sink.emit_log("Flash erased, writing data");

        self.write_blocks(image)?;

        self.sink.emit_progress(95, "Finalizing...");
        self.flash_end()?;

        self.sink.emit_progress(100, "Done");
        self.sink.emit_log("Flash write completed");
        Ok(())
    }

    fn detect_chip(&mut self) -> Result<()> {
        let magic = match self.connection()?.read_reg(CHIP_DETECT_MAGIC_REG_ADDR) {
            Ok(magic) => magic,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                debug!("chip detection failed: {err}");
                return Err(Error::ChipDetectFailed);
            }
        };

        debug!("chip detect magic: {magic:#010x}");
        self.chip = Chip::from_magic(magic).unwrap_or_else(|| {
            warn!("unrecognized chip magic {magic:#010x}, assuming ESP32");
            Chip::Esp32
        });

        self.sink.emit_log(&format!("Detected chip: {}", self.chip));
        Ok(())
    }

    fn spi_attach(&mut self) -> Result<()> {
        match self.connection()?.command(Command::SpiAttach) {
            Ok(_) => Ok(()),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) => {
                debug!("SPI attach failed: {err}");
                Err(Error::SpiAttachFailed)
            }
        }
    }

    fn flash_begin(&mut self, image_size: usize, offset: u32) -> Result<()> {
        let erase_size = erase_size(image_size);
        let blocks = block_count(image_size, self.block_size);

        debug!(
            "FLASH_BEGIN: erase {erase_size:#x} bytes, {blocks} blocks of {} at {offset:#x}",
            self.block_size
        );

        let command = Command::FlashBegin {
            erase_size,
            blocks,
            block_size: self.block_size as u32,
            offset,
        };

        match self.connection()?.command(command) {
            Ok(_) => Ok(()),
            Err(err @ (Error::TargetError { .. } | Error::Cancelled)) => Err(err),
            Err(err) => {
                debug!("FLASH_BEGIN failed: {err}");
                Err(Error::FlashBeginFailed)
            }
        }
    }

    fn write_blocks(&mut self, image: &[u8]) -> Result<()> {
        let total = block_count(image.len(), self.block_size);

        for (sequence, block) in image.chunks(self.block_size).enumerate() {
            let sequence = sequence as u32;
            self.write_block(block, sequence)?;

            let written = sequence + 1;
            let percent = 50 + (written * 40 / total.max(1)) as u8;
            self.sink.emit_progress(
                percent.min(90),
                &format!("Writing block {written}/{total}"),
            );

            if written % 10 == 0 || written == total {
                self.sink.emit_log(&format!(
                    "Wrote block {written}/{total} ({:.1}%)",
                    written as f64 / total as f64 * 100.0
                ));
            }
        }

        Ok(())
    }

    /// Send one block, re-sending the same sequence number on transport
    /// errors. A failure status from the target is final.
    fn write_block(&mut self, block: &[u8], sequence: u32) -> Result<()> {
        let pad_to = self.block_size;

        for attempt in 0..FLASH_DATA_ATTEMPTS {
            self.connection()?.check_cancelled()?;

            let command = Command::FlashData {
                data: block,
                pad_to,
                sequence,
            };

            match self.connection()?.command(command) {
                Ok(_) => return Ok(()),
                Err(err @ (Error::TargetError { .. } | Error::Cancelled)) => return Err(err),
                Err(err) => {
                    warn!(
                        "FLASH_DATA seq {sequence} attempt {}/{FLASH_DATA_ATTEMPTS} failed: {err}",
                        attempt + 1
                    );
                    sleep(Duration::from_millis(100));
                }
            }
        }

        Err(Error::FlashDataFailed(sequence))
    }

    fn flash_end(&mut self) -> Result<()> {
        match self.connection()?.command(Command::FlashEnd) {
            Ok(_) => Ok(()),
            Err(err @ (Error::TargetError { .. } | Error::Cancelled)) => Err(err),
            Err(err) => {
                debug!("FLASH_END failed: {err}");
                Err(Error::FlashEndFailed)
            }
        }
    }

    /// Switch the session to a different baud rate.
    ///
    /// Sends the CHANGE_BAUD command, then reconfigures the local port and
    /// lets the target's UART settle. Failure closes the session.
    pub fn set_baud(&mut self, rate: u32) -> Result<()> {
        self.sink.emit_log(&format!("Changing baud rate to {rate}..."));

        let result = self.try_set_baud(rate);
        match result {
            Ok(()) => {
                self.baud = rate;
                self.sink.emit_log(&format!("Baud rate changed to {rate}"));
                Ok(())
            }
            Err(err) => {
                self.sink.emit_log(&format!("Baud rate change failed: {err}"));
                self.close();
                Err(err)
            }
        }
    }

    fn try_set_baud(&mut self, rate: u32) -> Result<()> {
        self.connection()?
            .command(Command::ChangeBaud { new_baud: rate })?;

        let connection = self.connection()?;
        connection.interface_mut().set_baud_rate(rate)?;
        sleep(Duration::from_millis(100));
        connection.interface_mut().clear_input_buffer()?;
        Ok(())
    }

    /// Reset the target into its application (GPIO0 released, EN pulsed).
    pub fn reboot_target(&mut self) -> Result<()> {
        self.sink.emit_log("Rebooting target...");

        if let Err(err) = hard_reset(self.connection()?.interface_mut()) {
            self.sink.emit_log(&format!("Reboot failed: {err}"));
            self.close();
            return Err(err);
        }

        self.sink.emit_log("Target rebooted");
        Ok(())
    }

    /// Release the port. Idempotent; the control lines are parked low so the
    /// target is left free to boot normally.
    pub fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            let mut interface = connection.into_interface();
            if let Err(err) = interface.set_dtr(false) {
                debug!("failed to release DTR on close: {err}");
            }
            if let Err(err) = interface.set_rts(false) {
                debug!("failed to release RTS on close: {err}");
            }
            debug!("session on {} closed", self.port_name);
        }
    }

    fn emit_entry_help(&mut self, err: &Error) {
        if matches!(err, Error::BootloaderEntryFailed) {
            self.sink.emit_log("Automatic bootloader entry failed");
            self.sink
                .emit_log("Manual recovery: hold the BOOT button, press and release RESET, then release BOOT and retry");
        }
    }
}

impl<I: Interface> Drop for Session<'_, I> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erase_size_rounds_to_sectors() {
        assert_eq!(erase_size(0), 0);
        assert_eq!(erase_size(1), 4096);
        assert_eq!(erase_size(4096), 4096);
        assert_eq!(erase_size(4097), 8192);
        assert_eq!(erase_size(4100), 8192);
    }

    #[test]
    fn erase_size_covers_the_image() {
        for size in [0usize, 1, 1023, 1024, 4095, 4096, 4100, 65_536, 70_001] {
            let erase = erase_size(size) as usize;
            assert_eq!(erase % FLASH_SECTOR_SIZE, 0);
            assert!(erase >= size);
        }
    }

    #[test]
    fn block_count_is_ceiling_division() {
        assert_eq!(block_count(0, 1024), 0);
        assert_eq!(block_count(1, 1024), 1);
        assert_eq!(block_count(1024, 1024), 1);
        assert_eq!(block_count(1025, 1024), 2);
        assert_eq!(block_count(4100, 1024), 5);
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());

        clone.cancel();
        assert!(token.is_cancelled());
    }
}
