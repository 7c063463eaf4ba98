//! Protocol round-trips against a simulated ROM bootloader.
//!
//! The simulator implements [esprom::Interface] over in-memory queues: it
//! parses the SLIP frames the session writes, records every command, and
//! queues back scripted responses, including boot noise, dropped responses
//! and failure statuses.

use std::{
    collections::VecDeque,
    io::{Read, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

use esprom::{command::CHECKSUM_INIT, slip, Chip, Error, Interface, NullSink, Session};

const SYNC: u8 = 0x08;
const FLASH_BEGIN: u8 = 0x02;
const FLASH_DATA: u8 = 0x03;
const FLASH_END: u8 = 0x04;
const READ_REG: u8 = 0x0A;
const SPI_ATTACH: u8 = 0x0D;

const ESP32_MAGIC: u32 = 0x00f01d83;
const ESP32S3_MAGIC: u32 = 0x00000009;

#[derive(Default)]
struct Behavior {
    /// SYNC commands to ignore before the ROM starts answering.
    ignore_syncs: usize,
    /// ASCII boot noise queued in front of the first SYNC response.
    boot_noise: Vec<u8>,
    /// `(sequence, times)`: drop the response to this FLASH_DATA block.
    drop_data_response: Option<(u32, usize)>,
    /// `(sequence, status_block)`: answer this block with a failure status.
    data_status: Option<(u32, [u8; 4])>,
    /// Magic reported for the chip-detect register.
    chip_magic: u32,
}

#[derive(Default)]
struct TargetState {
    behavior: Behavior,
    /// Bytes queued for the host to read.
    output: VecDeque<u8>,
    /// Bytes received from the host, not yet parsed into frames.
    input: Vec<u8>,
    sync_commands: usize,
    read_regs: Vec<u32>,
    spi_attaches: usize,
    flash_begins: Vec<[u32; 4]>,
    /// `(sequence, checksum_field, block_data)` per received FLASH_DATA.
    blocks: Vec<(u32, u32, Vec<u8>)>,
    flash_ends: Vec<Vec<u8>>,
    dtr: bool,
    rts: bool,
}

impl TargetState {
    fn respond(&mut self, opcode: u8, value: u32, status: [u8; 4]) {
        let mut packet = vec![0x01, opcode, 0x04, 0x00];
        packet.extend_from_slice(&value.to_le_bytes());
        packet.extend_from_slice(&status);
        self.output.extend(slip::encode(&packet));
    }

    fn respond_ok(&mut self, opcode: u8) {
        self.respond(opcode, 0, [0, 0, 0, 0]);
    }

    /// Parse and handle every complete frame sitting in the input stream.
    fn process_input(&mut self) {
        loop {
            let Some(first) = self.input.iter().position(|b| *b == 0xC0) else {
                self.input.clear();
                return;
            };
            let Some(second) = self.input[first + 1..].iter().position(|b| *b == 0xC0) else {
                self.input.drain(..first);
                return;
            };
            let end = first + 1 + second;

            match slip::decode(&self.input[first..=end]) {
                Ok(packet) if packet.len() >= 8 => {
                    self.input.drain(..=end);
                    self.handle_packet(&packet);
                }
                _ => {
                    // Empty or unparseable candidate; skip its opening END.
                    self.input.drain(..=first);
                }
            }
        }
    }

    fn handle_packet(&mut self, packet: &[u8]) {
        assert_eq!(packet[0], 0x00, "host packets must have direction 0x00");
        let opcode = packet[1];
        let checksum_field = u32::from_le_bytes(packet[4..8].try_into().unwrap());
        let data = &packet[8..];

        match opcode {
            SYNC => {
                self.sync_commands += 1;
                if self.behavior.ignore_syncs > 0 {
                    self.behavior.ignore_syncs -= 1;
                    return;
                }

                let noise = std::mem::take(&mut self.behavior.boot_noise);
                self.output.extend(noise);
                self.respond_ok(SYNC);
            }
            READ_REG => {
                let address = u32::from_le_bytes(data[..4].try_into().unwrap());
                self.read_regs.push(address);
                let magic = self.behavior.chip_magic;
                self.respond(READ_REG, magic, [0, 0, 0, 0]);
            }
            SPI_ATTACH => {
                assert_eq!(data, [0u8; 8]);
                self.spi_attaches += 1;
                self.respond_ok(SPI_ATTACH);
            }
            FLASH_BEGIN => {
                let words: Vec<u32> = data
                    .chunks(4)
                    .map(|w| u32::from_le_bytes(w.try_into().unwrap()))
                    .collect();
                self.flash_begins
                    .push([words[0], words[1], words[2], words[3]]);
                self.respond_ok(FLASH_BEGIN);
            }
            FLASH_DATA => {
                let sequence = u32::from_le_bytes(data[4..8].try_into().unwrap());
                self.blocks
                    .push((sequence, checksum_field, data[16..].to_vec()));

                if let Some((seq, times)) = self.behavior.drop_data_response {
                    if seq == sequence && times > 0 {
                        self.behavior.drop_data_response = Some((seq, times - 1));
                        return;
                    }
                }
                if let Some((seq, status)) = self.behavior.data_status {
                    if seq == sequence {
                        self.respond(FLASH_DATA, 0, status);
                        return;
                    }
                }
                self.respond_ok(FLASH_DATA);
            }
            FLASH_END => {
                self.flash_ends.push(data.to_vec());
                self.respond_ok(FLASH_END);
            }
            other => panic!("simulator received unsupported opcode {other:#04x}"),
        }
    }
}

/// Host-side handle implementing the transport trait over the shared state.
#[derive(Clone)]
struct SimulatedTarget {
    state: Arc<Mutex<TargetState>>,
}

impl SimulatedTarget {
    fn new(behavior: Behavior) -> Self {
        let state = TargetState {
            behavior,
            ..TargetState::default()
        };
        SimulatedTarget {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TargetState> {
        self.state.lock().unwrap()
    }
}

impl Read for SimulatedTarget {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.state();
        if state.output.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no data",
            ));
        }

        let mut count = 0;
        while count < buf.len() {
            match state.output.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

impl Write for SimulatedTarget {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.state();
        state.input.extend_from_slice(buf);
        state.process_input();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Interface for SimulatedTarget {
    fn set_dtr(&mut self, level: bool) -> esprom::Result<()> {
        self.state().dtr = level;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> esprom::Result<()> {
        self.state().rts = level;
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> esprom::Result<()> {
        self.state().output.clear();
        Ok(())
    }

    fn clear_output_buffer(&mut self) -> esprom::Result<()> {
        Ok(())
    }

    fn set_read_timeout(&mut self, _timeout: Duration) -> esprom::Result<()> {
        Ok(())
    }

    fn set_baud_rate(&mut self, _baud: u32) -> esprom::Result<()> {
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        115_200
    }
}

fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(CHECKSUM_INIT, |check, byte| check ^ byte)
}

#[test]
fn sync_succeeds_on_first_attempt_and_flushes_echoes() {
    let target = SimulatedTarget::new(Behavior {
        chip_magic: ESP32_MAGIC,
        ..Behavior::default()
    });

    let mut sink = NullSink;
    let mut session = Session::with_interface(target.clone(), &mut sink);
    session.flash_image(&[0u8; 16], 0x1000).unwrap();
    drop(session);

    // One handshake SYNC plus seven empty follow-up probes.
    assert_eq!(target.state().sync_commands, 8);
}

#[test]
fn sync_survives_reboot_noise_and_ignored_attempts() {
    let mut boot_noise = Vec::new();
    while boot_noise.len() < 2048 {
        boot_noise.extend_from_slice(
            b"ets Jun  8 2016 00:22:57\r\nrst:0x10 (RTCWDT_RTC_RESET),boot:0x13 \
              (SPI_FAST_FLASH_BOOT)\r\nflash read err, 1000\r\nets_main.c 371\r\n",
        );
    }

    let target = SimulatedTarget::new(Behavior {
        ignore_syncs: 3,
        boot_noise,
        chip_magic: ESP32_MAGIC,
        ..Behavior::default()
    });

    let mut sink = NullSink;
    let mut session = Session::with_interface(target.clone(), &mut sink);
    session.flash_image(&[0xA5u8; 100], 0x1000).unwrap();
    drop(session);

    // Three ignored handshakes, the accepted one, and its flush probes.
    assert!(target.state().sync_commands >= 4 + 7);
}

#[test]
fn flashes_4100_bytes_at_0x10000() {
    let image: Vec<u8> = (0..4100u32).map(|i| (i % 251) as u8).collect();

    let target = SimulatedTarget::new(Behavior {
        chip_magic: ESP32S3_MAGIC,
        ..Behavior::default()
    });

    let mut sink = NullSink;
    let mut session = Session::with_interface(target.clone(), &mut sink);
    session.flash_image(&image, 0x10000).unwrap();

    assert_eq!(session.chip(), Chip::Esp32s3);
    drop(session);

    let state = target.state();
    assert_eq!(state.read_regs, [0x4000_1000]);
    assert_eq!(state.spi_attaches, 1);

    // erase_size, num_blocks, block_size, offset.
    assert_eq!(state.flash_begins, [[8192, 5, 1024, 0x10000]]);

    let sequences: Vec<u32> = state.blocks.iter().map(|(seq, _, _)| *seq).collect();
    assert_eq!(sequences, [0, 1, 2, 3, 4]);

    for (sequence, checksum_field, block) in &state.blocks {
        assert_eq!(block.len(), 1024);
        assert_eq!(*checksum_field, checksum(block) as u32);

        let start = *sequence as usize * 1024;
        let end = usize::min(start + 1024, image.len());
        assert_eq!(&block[..end - start], &image[start..end]);
        assert!(block[end - start..].iter().all(|b| *b == 0xFF));
    }

    // The last block carries 4 real bytes and 1020 bytes of padding.
    let (_, _, last) = state.blocks.last().unwrap();
    assert_eq!(&last[..4], &image[4096..4100]);
    assert!(last[4..].iter().all(|b| *b == 0xFF));

    assert_eq!(state.flash_ends, [vec![0, 0, 0, 0]]);
}

#[test]
fn retries_flash_data_after_a_dropped_response() {
    let image = vec![0x42u8; 5 * 1024];

    let target = SimulatedTarget::new(Behavior {
        chip_magic: ESP32_MAGIC,
        drop_data_response: Some((2, 1)),
        ..Behavior::default()
    });

    let mut sink = NullSink;
    let mut session = Session::with_interface(target.clone(), &mut sink);
    session.flash_image(&image, 0x10000).unwrap();
    drop(session);

    let state = target.state();
    let sequences: Vec<u32> = state.blocks.iter().map(|(seq, _, _)| *seq).collect();
    // Sequence 2 was sent twice; externally the order has no gaps.
    assert_eq!(sequences, [0, 1, 2, 2, 3, 4]);
    assert_eq!(state.flash_ends.len(), 1);
}

#[test]
fn target_error_aborts_the_write_and_releases_the_lines() {
    let image = vec![0x42u8; 5 * 1024];

    let target = SimulatedTarget::new(Behavior {
        chip_magic: ESP32_MAGIC,
        data_status: Some((3, [0x01, 0x06, 0, 0])),
        ..Behavior::default()
    });

    let mut sink = NullSink;
    let mut session = Session::with_interface(target.clone(), &mut sink);
    let err = session.flash_image(&image, 0x10000).unwrap_err();
    assert!(matches!(
        err,
        Error::TargetError {
            status: 0x01,
            code: 0x06
        }
    ));
    drop(session);

    let state = target.state();
    // The failing block is final: nothing after sequence 3 was sent.
    let max_seq = state.blocks.iter().map(|(seq, _, _)| *seq).max().unwrap();
    assert_eq!(max_seq, 3);
    assert!(state.flash_ends.is_empty());

    // The session parked both control lines on close.
    assert!(!state.dtr);
    assert!(!state.rts);
}

#[test]
fn cancellation_stops_the_write() {
    let image = vec![0x11u8; 4 * 1024];

    let target = SimulatedTarget::new(Behavior {
        chip_magic: ESP32_MAGIC,
        ..Behavior::default()
    });

    let mut sink = NullSink;
    let mut session = Session::with_interface(target.clone(), &mut sink);

    let token = esprom::CancelToken::new();
    session.set_cancel_token(token.clone());
    token.cancel();

    let err = session.flash_image(&image, 0x10000).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    drop(session);

    assert!(target.state().blocks.is_empty());
}
