//! SLIP framing for the ROM bootloader serial protocol.
//!
//! Every command and response on the wire is wrapped in a SLIP frame:
//! `END | escaped payload | END`, with `0xC0` and `0xDB` escaped inside the
//! frame. See <https://docs.espressif.com/projects/esptool/en/latest/esp32/advanced-topics/serial-protocol.html>.

use crate::error::{Error, Result};

/// SLIP end-of-frame token
pub const END: u8 = 0xC0;
/// SLIP escape token
pub const ESC: u8 = 0xDB;
/// SLIP escaped `0xC0` token
const ESC_END: u8 = 0xDC;
/// SLIP escaped `0xDB` token
const ESC_ESC: u8 = 0xDD;

/// Encode a packet into a single SLIP frame.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 2);
    frame.push(END);

    for value in data {
        match *value {
            END => frame.extend_from_slice(&[ESC, ESC_END]),
            ESC => frame.extend_from_slice(&[ESC, ESC_ESC]),
            _ => frame.push(*value),
        }
    }

    frame.push(END);
    frame
}

/// Decode a single SLIP frame back into its payload.
///
/// The frame must begin and end with [END]; bytes between frames are the
/// caller's responsibility and are never passed in here.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < 2 || frame[0] != END || frame[frame.len() - 1] != END {
        return Err(Error::MalformedFrame);
    }

    let mut payload = Vec::with_capacity(frame.len() - 2);
    let mut bytes = frame[1..frame.len() - 1].iter();

    while let Some(value) = bytes.next() {
        match *value {
            ESC => match bytes.next() {
                Some(&ESC_END) => payload.push(END),
                Some(&ESC_ESC) => payload.push(ESC),
                _ => return Err(Error::InvalidEscape),
            },
            END => return Err(Error::MalformedFrame),
            _ => payload.push(*value),
        }
    }

    Ok(payload)
}
