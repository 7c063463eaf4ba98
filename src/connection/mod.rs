//! Command/response exchange with the target ROM bootloader.
//!
//! [Connection] owns the transport and layers the SLIP-framed request and
//! response protocol on top of it: building and writing command packets,
//! fishing response frames out of a byte stream that also carries boot-time
//! diagnostic text, and running the SYNC handshake that establishes a
//! session against a possibly-rebooting target.

use std::{
    io::ErrorKind,
    thread::sleep,
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
    command::{Command, CommandType},
    connection::reset::{reset_strategy_sequence, stabilization_pulse},
    error::{Error, Result},
    flasher::CancelToken,
    interface::Interface,
    slip,
};

pub mod reset;

/// SYNC handshake attempts before the stabilization fallback kicks in.
const SYNC_ATTEMPTS: usize = 15;
/// SYNC attempts after forcing the target to settle.
const SYNC_FALLBACK_ATTEMPTS: usize = 5;
const SYNC_FALLBACK_TIMEOUT: Duration = Duration::from_secs(2);
/// Empty probes sent after an accepted SYNC to shake loose queued echoes.
const SYNC_FLUSH_PROBES: usize = 7;
/// How long boot-time output is drained while validating bootloader entry.
const BOOT_DRAIN_WINDOW: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Substrings in boot output that indicate the ROM is in download mode (or
/// about to land there).
const DOWNLOAD_MODE_MARKERS: &[&str] = &[
    "waiting for download",
    "download mode",
    "rst:0x10",
    "boot:0x13",
    "csum err",
    "ets_main.c",
    "Brownout",
];

/// Substrings that mean an application image is running instead.
const APPLICATION_MARKERS: &[&str] = &["WiFi", "IP", "ESP-NOW", "HTTP", "TCP", "app_main"];

/// What the drained boot output says about the target's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BootStage {
    Bootloader,
    Application,
    Indeterminate,
}

pub(crate) fn classify_boot_output(text: &str) -> BootStage {
    // An application banner wins: no amount of bootloader-looking noise
    // matters once the app is up.
    if APPLICATION_MARKERS.iter().any(|m| text.contains(m)) {
        return BootStage::Application;
    }
    if DOWNLOAD_MODE_MARKERS.iter().any(|m| text.contains(m)) {
        return BootStage::Bootloader;
    }
    BootStage::Indeterminate
}

/// Scan accumulated bytes for a decodable response frame.
///
/// Every substring between two END bytes is a candidate; candidates that do
/// not decode, or decode to something other than a response header, are
/// skipped. The ROM prints diagnostic text before and between frames, so
/// failed candidates are expected, not errors.
pub(crate) fn extract_response(buffer: &[u8]) -> Option<Vec<u8>> {
    let ends: Vec<usize> = buffer
        .iter()
        .enumerate()
        .filter(|(_, byte)| **byte == slip::END)
        .map(|(index, _)| index)
        .collect();

    for pair in ends.windows(2) {
        match slip::decode(&buffer[pair[0]..=pair[1]]) {
            Ok(payload) if payload.len() >= 8 && payload[0] == 0x01 => return Some(payload),
            _ => continue,
        }
    }

    None
}

/// Structural fallback: find `0x01 <opcode>` starting a run of at least 8
/// bytes in the raw buffer. Only SYNC matching trusts this.
pub(crate) fn degraded_scan(buffer: &[u8], opcode: u8) -> Option<Vec<u8>> {
    for index in 0..buffer.len().saturating_sub(1) {
        if buffer[index] == 0x01 && buffer[index + 1] == opcode && buffer.len() - index >= 8 {
            return Some(buffer[index..].to_vec());
        }
    }
    None
}

/// Validate a response frame against the success predicate for `ty`.
pub(crate) fn check_response(ty: CommandType, response: &[u8]) -> Result<()> {
    if response.len() < 8 || response[0] != 0x01 {
        return Err(Error::MalformedFrame);
    }
    if response[1] != ty as u8 {
        return Err(Error::UnexpectedResponse {
            expected: ty,
            got: response[1],
        });
    }
    if response.len() >= 12 {
        let status = response[response.len() - 4];
        if status != 0x00 {
            return Err(Error::TargetError {
                status,
                code: response[response.len() - 3],
            });
        }
    }
    Ok(())
}

/// The 32-bit value field of a response header.
pub(crate) fn response_value(response: &[u8]) -> u32 {
    u32::from_le_bytes(response[4..8].try_into().unwrap())
}

fn is_read_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

/// A command/response channel to the target's ROM bootloader.
pub struct Connection<I: Interface> {
    interface: I,
    cancel: CancelToken,
}

impl<I: Interface> Connection<I> {
    pub fn new(interface: I) -> Self {
        Connection {
            interface,
            cancel: CancelToken::default(),
        }
    }

    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    pub fn interface_mut(&mut self) -> &mut I {
        &mut self.interface
    }

    pub fn into_interface(self) -> I {
        self.interface
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep, honoring cancellation before the wait starts.
    fn pace(&self, duration: Duration) -> Result<()> {
        self.check_cancelled()?;
        sleep(duration);
        Ok(())
    }

    /// Frame a command and write it to the target in a single transmission.
    pub fn write_command(&mut self, command: Command<'_>) -> Result<()> {
        debug!("Writing command: {}", command.command_type());

        self.interface.clear_input_buffer()?;

        let mut packet = Vec::new();
        command.write(&mut packet)?;
        self.interface.write_all(&slip::encode(&packet))?;
        self.interface.flush()?;
        Ok(())
    }

    /// Read bytes until one response frame is captured or `deadline` passes.
    pub fn read_response(&mut self, ty: CommandType, deadline: Duration) -> Result<Vec<u8>> {
        let start = Instant::now();
        let mut accumulated: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            match self.interface.read(&mut chunk) {
                Ok(0) => {}
                Ok(n) => {
                    accumulated.extend_from_slice(&chunk[..n]);
                    if let Some(frame) = extract_response(&accumulated) {
                        return Ok(frame);
                    }
                }
                Err(err) if is_read_timeout(&err) => {}
                Err(err) => return Err(err.into()),
            }

            if start.elapsed() >= deadline {
                // Only SYNC trusts the structural fallback; other commands
                // need a properly framed response.
                if ty == CommandType::Sync {
                    if let Some(raw) = degraded_scan(&accumulated, ty as u8) {
                        return Ok(raw);
                    }
                }
                return Err(Error::Timeout(ty));
            }

            sleep(POLL_INTERVAL);
        }
    }

    /// Write a command and validate its response.
    pub fn command(&mut self, command: Command<'_>) -> Result<Vec<u8>> {
        let ty = command.command_type();
        self.write_command(command)?;
        let response = self.read_response(ty, ty.timeout())?;
        check_response(ty, &response)?;
        Ok(response)
    }

    /// Read a 32-bit register on the target.
    pub fn read_reg(&mut self, address: u32) -> Result<u32> {
        let response = self.command(Command::ReadReg { address })?;
        Ok(response_value(&response))
    }

    /// Nudge the ROM's UART receiver before the first SYNC.
    pub(crate) fn wakeup(&mut self) -> Result<()> {
        self.interface.write_all(&[0u8; 8])?;
        self.interface.flush()?;
        Ok(())
    }

    /// One SYNC exchange; used both as the handshake body and as the probe
    /// that validates a reset strategy.
    pub(crate) fn sync_probe(&mut self, deadline: Duration) -> Result<()> {
        self.write_command(Command::Sync)?;
        let response = self.read_response(CommandType::Sync, deadline)?;

        // Degraded responses carry no trustworthy status word, so SYNC
        // accepts on the structural match alone.
        if response[1] == CommandType::Sync as u8 {
            Ok(())
        } else {
            Err(Error::UnexpectedResponse {
                expected: CommandType::Sync,
                got: response[1],
            })
        }
    }

    /// Run the SYNC handshake until the ROM answers.
    ///
    /// The target may be cycling through reset on a corrupt image; each
    /// attempt flushes the line and waits for the narrow window in which the
    /// ROM is listening. After [SYNC_ATTEMPTS] failures the target is forced
    /// to settle with short reset pulses and probed a few more times.
    pub fn sync(&mut self) -> Result<()> {
        for attempt in 0..SYNC_ATTEMPTS {
            self.check_cancelled()?;
            debug!("SYNC attempt {}/{}", attempt + 1, SYNC_ATTEMPTS);

            self.interface.clear_input_buffer()?;
            self.interface.clear_output_buffer()?;
            self.pace(Duration::from_millis(200))?;

            match self.sync_probe(CommandType::Sync.timeout()) {
                Ok(()) => {
                    self.flush_sync_echoes()?;
                    return Ok(());
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    debug!("SYNC attempt failed: {err}");
                    self.pace(Duration::from_millis(150))?;
                }
            }
        }

        warn!("SYNC failed after {SYNC_ATTEMPTS} attempts, forcing the target to settle");
        self.stabilize_and_retry()
    }

    /// The ROM answers one SYNC with a burst of queued echoes. Send a few
    /// empty-payload probes, then discard everything pending so the next
    /// command sees a clean stream.
    fn flush_sync_echoes(&mut self) -> Result<()> {
        let probe = slip::encode(&[0x00, CommandType::Sync as u8, 0, 0, 0, 0, 0, 0]);
        for _ in 0..SYNC_FLUSH_PROBES {
            self.interface.write_all(&probe)?;
            self.interface.flush()?;
            sleep(Duration::from_millis(10));
        }

        self.drain_input(Duration::from_millis(200))?;
        self.interface.clear_input_buffer()?;
        Ok(())
    }

    fn stabilize_and_retry(&mut self) -> Result<()> {
        for _ in 0..3 {
            self.check_cancelled()?;
            stabilization_pulse(&mut self.interface)?;
            sleep(Duration::from_millis(200));
        }
        self.pace(Duration::from_millis(500))?;

        for attempt in 0..SYNC_FALLBACK_ATTEMPTS {
            self.check_cancelled()?;
            debug!(
                "post-stabilization SYNC attempt {}/{}",
                attempt + 1,
                SYNC_FALLBACK_ATTEMPTS
            );

            self.interface.clear_input_buffer()?;
            self.interface.clear_output_buffer()?;

            match self.sync_probe(SYNC_FALLBACK_TIMEOUT) {
                Ok(()) => {
                    self.flush_sync_echoes()?;
                    return Ok(());
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => debug!("SYNC attempt failed: {err}"),
            }
        }

        Err(Error::SyncExhausted)
    }

    /// Drive the target into ROM download mode.
    ///
    /// Line polarity differs between USB-UART bridges and is discovered, not
    /// configured: each reset strategy is tried in turn and validated by
    /// draining the boot output and probing with a single SYNC.
    pub fn begin(&mut self) -> Result<()> {
        self.interface.clear_input_buffer()?;
        self.interface.clear_output_buffer()?;
        sleep(Duration::from_millis(50));

        for strategy in reset_strategy_sequence() {
            self.check_cancelled()?;
            debug!("Trying {} reset", strategy.name());

            if let Err(err) = strategy.reset(&mut self.interface) {
                warn!("{} reset could not drive the control lines: {err}", strategy.name());
                continue;
            }

            if self.validate_entry()? {
                debug!("Bootloader confirmed after {} reset", strategy.name());
                return Ok(());
            }
        }

        // The target may have been sitting in download mode all along.
        if self.sync_probe(CommandType::Sync.timeout()).is_ok() {
            return Ok(());
        }

        Err(Error::BootloaderEntryFailed)
    }

    fn validate_entry(&mut self) -> Result<bool> {
        let drained = self.drain_boot_output(BOOT_DRAIN_WINDOW)?;
        let text = String::from_utf8_lossy(&drained);

        match classify_boot_output(&text) {
            BootStage::Application => {
                debug!("Application output detected, target is not in download mode");
                return Ok(false);
            }
            BootStage::Bootloader => debug!("Boot log indicates download mode"),
            BootStage::Indeterminate => {}
        }

        Ok(self.sync_probe(CommandType::Sync.timeout()).is_ok())
    }

    /// Collect boot-time output until it becomes classifiable, the line goes
    /// quiet, or `window` expires.
    fn drain_boot_output(&mut self, window: Duration) -> Result<Vec<u8>> {
        let start = Instant::now();
        let mut last_data = Instant::now();
        let mut drained: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 512];

        while start.elapsed() < window {
            match self.interface.read(&mut chunk) {
                Ok(0) => sleep(POLL_INTERVAL),
                Ok(n) => {
                    drained.extend_from_slice(&chunk[..n]);
                    last_data = Instant::now();

                    let text = String::from_utf8_lossy(&drained);
                    if classify_boot_output(&text) != BootStage::Indeterminate {
                        break;
                    }
                }
                Err(err) if is_read_timeout(&err) => sleep(POLL_INTERVAL),
                Err(err) => return Err(err.into()),
            }

            // A quiet line means the boot banner, if any, has already passed.
            if last_data.elapsed() > Duration::from_secs(1) {
                break;
            }
        }

        Ok(drained)
    }

    /// Read and discard whatever arrives within `window`.
    fn drain_input(&mut self, window: Duration) -> Result<()> {
        let start = Instant::now();
        let mut chunk = [0u8; 256];

        while start.elapsed() < window {
            match self.interface.read(&mut chunk) {
                Ok(0) => sleep(POLL_INTERVAL),
                Ok(_) => {}
                Err(err) if is_read_timeout(&err) => sleep(POLL_INTERVAL),
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }
}
