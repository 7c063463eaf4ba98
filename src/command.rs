//! Requests understood by the ROM bootloader.

use std::{io::Write, mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

const SYNC_TIMEOUT: Duration = Duration::from_secs(1);
const READ_REG_TIMEOUT: Duration = Duration::from_secs(2);
const SPI_ATTACH_TIMEOUT: Duration = Duration::from_secs(5);
/// Erase time dominates; the ROM only replies once the region is blank.
const FLASH_BEGIN_TIMEOUT: Duration = Duration::from_secs(20);
const FLASH_DATA_TIMEOUT: Duration = Duration::from_secs(5);
const FLASH_END_TIMEOUT: Duration = Duration::from_secs(5);
const CHANGE_BAUD_TIMEOUT: Duration = Duration::from_secs(1);

/// Seed for the XOR checksum carried by FLASH_DATA payloads.
pub const CHECKSUM_INIT: u8 = 0xEF;

/// Byte used to pad the final block of an image to the write block size.
pub const FLASH_PAD_BYTE: u8 = 0xFF;

/// XOR-reduce `data` into `checksum`.
pub fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

/// Opcodes of the ROM bootloader serial protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    Sync = 0x08,
    ReadReg = 0x0A,
    SpiAttach = 0x0D,
    ChangeBaud = 0x0F,
}

impl CommandType {
    /// Deadline for reading the response to this command.
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::FlashBegin => FLASH_BEGIN_TIMEOUT,
            CommandType::FlashData => FLASH_DATA_TIMEOUT,
            CommandType::FlashEnd => FLASH_END_TIMEOUT,
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::ReadReg => READ_REG_TIMEOUT,
            CommandType::SpiAttach => SPI_ATTACH_TIMEOUT,
            CommandType::ChangeBaud => CHANGE_BAUD_TIMEOUT,
        }
    }
}

/// A request packet, ready to be framed and written to the target.
#[derive(Copy, Clone, Debug)]
pub enum Command<'a> {
    FlashBegin {
        erase_size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashData {
        data: &'a [u8],
        pad_to: usize,
        sequence: u32,
    },
    /// Payload `0`: leave the target sitting in the bootloader. A physical
    /// reset is a separate operation.
    FlashEnd,
    Sync,
    ReadReg {
        address: u32,
    },
    SpiAttach,
    ChangeBaud {
        new_baud: u32,
    },
}

impl Command<'_> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd => CommandType::FlashEnd,
            Command::Sync => CommandType::Sync,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiAttach => CommandType::SpiAttach,
            Command::ChangeBaud { .. } => CommandType::ChangeBaud,
        }
    }

    /// Serialize the 8-byte header and payload into `writer`.
    ///
    /// The checksum word is zero for every command except [Command::FlashData],
    /// which carries the XOR checksum of its data bytes.
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&[0, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin {
                erase_size,
                blocks,
                block_size,
                offset,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct BeginParams {
                    erase_size: u32,
                    blocks: u32,
                    block_size: u32,
                    offset: u32,
                }
                let params = BeginParams {
                    erase_size,
                    blocks,
                    block_size,
                    offset,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::FlashData {
                data,
                pad_to,
                sequence,
            } => {
                data_command(writer, data, pad_to, sequence)?;
            }
            Command::FlashEnd => {
                write_basic(writer, &0u32.to_le_bytes(), 0)?;
            }
            Command::Sync => {
                write_basic(writer, &SYNC_PAYLOAD, 0)?;
            }
            Command::ReadReg { address } => {
                write_basic(writer, &address.to_le_bytes(), 0)?;
            }
            Command::SpiAttach => {
                // Default SPI pin mapping plus the reserved word the ROM
                // loader expects.
                write_basic(writer, &[0u8; 8], 0)?;
            }
            Command::ChangeBaud { new_baud } => {
                let mut payload = [0u8; 8];
                payload[..4].copy_from_slice(&new_baud.to_le_bytes());
                write_basic(writer, &payload, 0)?;
            }
        }
        Ok(())
    }
}

/// `0x07 0x07 0x12 0x20` followed by 32 copies of `0x55`.
pub const SYNC_PAYLOAD: [u8; 36] = [
    0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
];

fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    writer.write_all(&(data.len() as u16).to_le_bytes())?;
    writer.write_all(&checksum.to_le_bytes())?;
    writer.write_all(data)?;
    Ok(())
}

fn data_command<W: Write>(
    mut writer: W,
    block_data: &[u8],
    pad_to: usize,
    sequence: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let pad_length = pad_to.saturating_sub(block_data.len());

    let params = BlockParams {
        size: (block_data.len() + pad_length) as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let mut check = checksum(block_data, CHECKSUM_INIT);
    for _ in 0..pad_length {
        check = checksum(&[FLASH_PAD_BYTE], check);
    }

    let total_length = size_of::<BlockParams>() + block_data.len() + pad_length;
    writer.write_all(&(total_length as u16).to_le_bytes())?;
    writer.write_all(&(check as u32).to_le_bytes())?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block_data)?;
    for _ in 0..pad_length {
        writer.write_all(&[FLASH_PAD_BYTE])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(command: Command<'_>) -> Vec<u8> {
        let mut packet = Vec::new();
        command.write(&mut packet).unwrap();
        packet
    }

    #[test]
    fn checksum_seed_and_self_cancel() {
        assert_eq!(checksum(&[], CHECKSUM_INIT), 0xEF);
        assert_eq!(checksum(&[0xEF], CHECKSUM_INIT), 0);
    }

    #[test]
    fn header_layout() {
        let packet = encode(Command::ReadReg {
            address: 0x4000_1000,
        });

        assert_eq!(packet.len(), 8 + 4);
        assert_eq!(packet[0], 0x00);
        assert_eq!(packet[1], CommandType::ReadReg as u8);
        // Payload size, little endian.
        assert_eq!(u16::from_le_bytes([packet[2], packet[3]]), 4);
        // Checksum word is zero for commands without data.
        assert_eq!(&packet[4..8], &[0, 0, 0, 0]);
        assert_eq!(&packet[8..], &0x4000_1000u32.to_le_bytes());
    }

    #[test]
    fn sync_packet() {
        let packet = encode(Command::Sync);

        assert_eq!(packet[1], 0x08);
        assert_eq!(u16::from_le_bytes([packet[2], packet[3]]), 36);
        assert_eq!(&packet[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert!(packet[12..].iter().all(|b| *b == 0x55));
    }

    #[test]
    fn flash_begin_packet() {
        let packet = encode(Command::FlashBegin {
            erase_size: 8192,
            blocks: 5,
            block_size: 1024,
            offset: 0x10000,
        });

        assert_eq!(u16::from_le_bytes([packet[2], packet[3]]), 16);
        let words: Vec<u32> = packet[8..]
            .chunks(4)
            .map(|w| u32::from_le_bytes(w.try_into().unwrap()))
            .collect();
        assert_eq!(words, [8192, 5, 1024, 0x10000]);
    }

    #[test]
    fn flash_data_pads_and_checksums() {
        let data = [0x11u8, 0x22, 0x33];
        let packet = encode(Command::FlashData {
            data: &data,
            pad_to: 8,
            sequence: 7,
        });

        // 16-byte block header plus the padded block.
        assert_eq!(u16::from_le_bytes([packet[2], packet[3]]), 16 + 8);

        let mut expected = checksum(&data, CHECKSUM_INIT);
        expected = checksum(&[0xFF; 5], expected);
        assert_eq!(
            u32::from_le_bytes(packet[4..8].try_into().unwrap()),
            expected as u32
        );

        // data_size, sequence, two reserved words.
        assert_eq!(&packet[8..12], &8u32.to_le_bytes());
        assert_eq!(&packet[12..16], &7u32.to_le_bytes());
        assert_eq!(&packet[16..24], &[0; 8]);
        assert_eq!(&packet[24..27], &data);
        assert_eq!(&packet[27..], &[0xFF; 5]);
    }

    #[test]
    fn flash_end_stays_in_bootloader() {
        let packet = encode(Command::FlashEnd);
        assert_eq!(&packet[8..], &[0, 0, 0, 0]);
    }

    #[test]
    fn spi_attach_packet() {
        let packet = encode(Command::SpiAttach);
        assert_eq!(&packet[8..], &[0u8; 8]);
    }

    #[test]
    fn change_baud_packet() {
        let packet = encode(Command::ChangeBaud { new_baud: 460_800 });
        assert_eq!(&packet[8..12], &460_800u32.to_le_bytes());
        assert_eq!(&packet[12..16], &[0, 0, 0, 0]);
    }
}
