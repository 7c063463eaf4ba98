//! A library and CLI for flashing ESP32-family devices through their ROM
//! serial bootloader.
//!
//! ## As an application
//!
//! The `esprom` binary writes a firmware image to a device's SPI flash:
//!
//! ```bash
//! $ esprom flash /dev/ttyUSB0 app.bin --offset 0x10000
//! ```
//!
//! ## As a library
//!
//! ```toml
//! esprom = { version = "0.3", default-features = false }
//! ```
//!
//! Disabling default features drops the `cli` module and its dependencies,
//! which an embedding application will not need:
//!
//! ```rust,no_run
//! use esprom::{NullSink, Session};
//!
//! fn main() -> esprom::Result<()> {
//!     let mut sink = NullSink;
//!     let mut session = Session::open("/dev/ttyUSB0", &mut sink)?;
//!     session.flash_image(&[0xE9, 0x02, 0x02, 0x03], 0x10000)?;
//!     session.reboot_target()?;
//!     session.close();
//!     Ok(())
//! }
//! ```
//!
//! The session drives the whole protocol: it resets the target into its ROM
//! bootloader over DTR/RTS, synchronizes against boot-time noise, detects
//! the chip variant, attaches the SPI flash and streams the image in
//! checksummed blocks.

pub mod command;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod interface;
pub mod monitor;
pub mod progress;
pub mod slip;
pub mod targets;

pub use crate::{
    error::{Error, Result},
    flasher::{CancelToken, Session, DEFAULT_BAUD, FLASH_SECTOR_SIZE, FLASH_WRITE_SIZE},
    interface::{available_ports, Interface, SerialInterface},
    monitor::Monitor,
    progress::{NullSink, ProgressSink},
    targets::Chip,
};

/// Logging utilities
#[cfg(feature = "cli")]
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
