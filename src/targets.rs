//! Supported target devices.

use strum::Display;

/// Address of the register whose value identifies the chip family.
pub const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// ESP32-family chip variants recognized by the flasher.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display)]
#[non_exhaustive]
pub enum Chip {
    /// Not yet detected
    #[default]
    Unknown,
    /// ESP32
    #[strum(serialize = "ESP32")]
    Esp32,
    /// ESP32-S2
    #[strum(serialize = "ESP32-S2")]
    Esp32s2,
    /// ESP32-S3
    #[strum(serialize = "ESP32-S3")]
    Esp32s3,
    /// ESP32-C3
    #[strum(serialize = "ESP32-C3")]
    Esp32c3,
}

impl Chip {
    /// Classify a chip by the magic value read from the detection register.
    ///
    /// Returns `None` for values outside the table; callers fall back to
    /// [Chip::Esp32] in that case.
    pub fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            0x00f0_1d83 => Some(Chip::Esp32),
            0x0000_07c6 => Some(Chip::Esp32s2),
            0x0000_0009 => Some(Chip::Esp32s3),
            0x6921_506f => Some(Chip::Esp32c3),
            _ => None,
        }
    }
}
