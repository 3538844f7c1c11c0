//! Protocol and lifecycle tests against a scripted SPI card.
//!
//! `SimCard` emulates an SD card on the other end of the SPI bus: it parses
//! command frames byte by byte, answers with the proper R1/R7 responses and
//! data tokens, and keeps block contents in a map. The real driver runs
//! unmodified on top of it, including the full initialization handshake.

use std::collections::{HashMap, VecDeque};
use std::convert::TryInto;

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

use crate::card::{CardState, MountState, SdSpiCard};
use crate::config::Config;
use crate::fs::Volume;
use crate::sdcard::proto::{crc16, crc7};
use crate::sdcard::{Addressing, CardType, Error, SdCard};
use crate::{Block, BlockCount, BlockDevice, BlockIdx, MemoryBlockDevice};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SimKind {
    /// Version 2 card with the CCS bit set; block addressed.
    Sdhc,
    /// Version 1 card; byte addressed.
    Sdsc,
    /// No card in the slot; the bus floats high.
    Absent,
}

struct SimCard {
    kind: SimKind,
    memory: HashMap<u32, [u8; Block::LEN]>,
    responses: VecDeque<u8>,
    cmd: Vec<u8>,
    acmd: bool,
    acmd41_polls_left: u32,
    initialized: bool,
    /// Block index and captured bytes of an in-flight block write.
    write_capture: Option<(u32, Vec<u8>)>,
    reject_writes: bool,
}

impl SimCard {
    const BLOCKS: u32 = 1024;

    fn new(kind: SimKind) -> Self {
        Self {
            kind,
            memory: HashMap::new(),
            responses: VecDeque::new(),
            cmd: Vec::new(),
            acmd: false,
            acmd41_polls_left: 2,
            initialized: false,
            write_capture: None,
            reject_writes: false,
        }
    }

    fn with_image(kind: SimKind, image: &[u8]) -> Self {
        let mut card = Self::new(kind);
        for (idx, chunk) in image.chunks(Block::LEN).enumerate() {
            card.memory.insert(idx as u32, chunk.try_into().unwrap());
        }
        card
    }

    fn r1(&self) -> u8 {
        if self.initialized {
            0x00
        } else {
            0x01
        }
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        if self.kind == SimKind::Absent {
            return 0xFF;
        }

        if self.write_capture.is_some() {
            return self.capture_byte(mosi);
        }

        if !self.cmd.is_empty() {
            self.cmd.push(mosi);
            if self.cmd.len() == 6 {
                self.process_command();
            }
            return 0xFF;
        }

        if (mosi & 0xC0) == 0x40 {
            self.cmd.push(mosi);
            return 0xFF;
        }

        self.responses.pop_front().unwrap_or(0xFF)
    }

    fn capture_byte(&mut self, mosi: u8) -> u8 {
        let started = self
            .write_capture
            .as_ref()
            .map(|(_, buf)| !buf.is_empty())
            .unwrap_or(false);

        if !started {
            if mosi == 0xFE {
                if let Some((_, buf)) = &mut self.write_capture {
                    buf.push(mosi);
                }
                return 0xFF;
            }
            // The host is still polling for the R1 of the write command.
            return self.responses.pop_front().unwrap_or(0xFF);
        }

        let complete = match &mut self.write_capture {
            Some((_, buf)) => {
                buf.push(mosi);
                buf.len() == 1 + Block::LEN + 2
            }
            None => false,
        };
        if complete {
            self.finish_write();
        }
        0xFF
    }

    fn finish_write(&mut self) {
        let (block, buf) = self.write_capture.take().unwrap();
        assert_eq!(buf[0], 0xFE, "write data must start with the data token");
        let data = &buf[1..1 + Block::LEN];
        let sent_crc = (u16::from(buf[1 + Block::LEN]) << 8) | u16::from(buf[2 + Block::LEN]);
        assert_eq!(sent_crc, crc16(data), "write data CRC mismatch");

        if self.reject_writes {
            // Data response token with the CRC error bits set.
            self.responses.push_back(0x0D);
        } else {
            self.memory.insert(block, data.try_into().unwrap());
            self.responses.push_back(0x05);
            // Busy for a couple of byte times.
            self.responses.push_back(0x00);
            self.responses.push_back(0x00);
        }
    }

    fn wire_block(&self, arg: u32) -> u32 {
        match self.kind {
            SimKind::Sdhc => arg,
            SimKind::Sdsc => {
                assert_eq!(arg % Block::LEN as u32, 0, "byte address must be aligned");
                arg / Block::LEN as u32
            }
            SimKind::Absent => unreachable!(),
        }
    }

    fn csd_bytes(&self) -> [u8; 16] {
        let mut csd = [0u8; 16];
        match self.kind {
            // Version 2: capacity (device_size + 1) * 1024 blocks.
            SimKind::Sdhc => {
                csd[0] = 0x40;
                // device_size = 0 -> 1024 blocks
            }
            // Version 1: READ_BL_LEN 9, C_SIZE 255, C_SIZE_MULT 0
            // -> (255 + 1) << (0 + 9 - 7) = 1024 blocks.
            SimKind::Sdsc => {
                csd[5] = 0x09;
                csd[7] = 0x3F;
                csd[8] = 0xC0;
            }
            SimKind::Absent => unreachable!(),
        }
        csd
    }

    fn push_data_packet(&mut self, data: &[u8]) {
        self.responses.push_back(0xFE);
        self.responses.extend(data.iter().copied());
        let crc = crc16(data);
        self.responses.push_back((crc >> 8) as u8);
        self.responses.push_back(crc as u8);
    }

    fn process_command(&mut self) {
        let frame: Vec<u8> = core::mem::take(&mut self.cmd);
        assert_eq!(frame[5], crc7(&frame[0..5]), "command frame CRC mismatch");
        let cmd = frame[0] & 0x3F;
        let arg = u32::from_be_bytes(frame[1..5].try_into().unwrap());
        let was_acmd = self.acmd;
        self.acmd = false;

        match cmd {
            0 => {
                self.initialized = false;
                self.responses.clear();
                self.responses.push_back(0x01);
            }
            59 => {
                let r1 = self.r1();
                self.responses.push_back(r1);
            }
            8 => match self.kind {
                SimKind::Sdsc => self.responses.push_back(0x05),
                _ => {
                    self.responses.push_back(0x01);
                    self.responses.extend([0x00, 0x00, 0x01, 0xAA]);
                }
            },
            55 => {
                let r1 = self.r1();
                self.responses.push_back(r1);
                self.acmd = true;
            }
            41 if was_acmd => {
                if self.acmd41_polls_left > 0 {
                    self.acmd41_polls_left -= 1;
                    self.responses.push_back(0x01);
                } else {
                    self.initialized = true;
                    self.responses.push_back(0x00);
                }
            }
            58 => {
                self.responses.push_back(0x00);
                let ocr0 = match self.kind {
                    SimKind::Sdhc => 0xC0,
                    _ => 0x80,
                };
                self.responses.extend([ocr0, 0xFF, 0x80, 0x00]);
            }
            16 => {
                assert_eq!(self.kind, SimKind::Sdsc, "CMD16 only fits byte addressing");
                assert_eq!(arg, Block::LEN as u32);
                self.responses.push_back(0x00);
            }
            9 => {
                let r1 = self.r1();
                self.responses.push_back(r1);
                let csd = self.csd_bytes();
                self.push_data_packet(&csd);
            }
            17 => {
                let block = self.wire_block(arg);
                self.responses.push_back(0x00);
                let data = self
                    .memory
                    .get(&block)
                    .copied()
                    .unwrap_or([0u8; Block::LEN]);
                self.push_data_packet(&data);
            }
            24 => {
                let block = self.wire_block(arg);
                self.responses.push_back(0x00);
                self.write_capture = Some((block, Vec::new()));
            }
            13 => {
                self.responses.push_back(0x00);
                self.responses.push_back(0x00);
            }
            other => panic!("simulated card got unexpected CMD{}", other),
        }
    }
}

impl Transfer<u8> for SimCard {
    type Error = ();

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], ()> {
        for word in words.iter_mut() {
            *word = self.exchange(*word);
        }
        Ok(words)
    }
}

struct FakeCs;

impl OutputPin for FakeCs {
    type Error = core::convert::Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

struct FakePower(std::rc::Rc<std::cell::Cell<bool>>);

impl OutputPin for FakePower {
    type Error = core::convert::Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.set(true);
        Ok(())
    }
}

fn formatted_image(blocks: usize) -> Vec<u8> {
    let mut image = vec![0u8; blocks * Block::LEN];
    let mut device = MemoryBlockDevice::new(&mut image);
    Volume::format(&mut device).unwrap();
    image
}

#[test]
fn init_sdhc() {
    init_log();
    let card = SdCard::new(SimCard::new(SimKind::Sdhc), FakeCs);
    let card = card.init().map_err(|(e, _)| e).unwrap();
    assert_eq!(card.card_type(), CardType::Sdhc);
    assert_eq!(card.geometry().addressing, Addressing::Block);
    assert_eq!(card.geometry().block_count, BlockCount(SimCard::BLOCKS));
    assert_eq!(card.card_size_bytes(), 1024 * 512);
}

#[test]
fn init_sdsc() {
    init_log();
    let card = SdCard::new(SimCard::new(SimKind::Sdsc), FakeCs);
    let card = card.init().map_err(|(e, _)| e).unwrap();
    assert_eq!(card.card_type(), CardType::Sd1);
    assert_eq!(card.geometry().addressing, Addressing::Byte);
    assert_eq!(card.geometry().block_count, BlockCount(SimCard::BLOCKS));
}

#[test]
fn init_without_card_stays_bounded() {
    init_log();
    let card = SdCard::new(SimCard::new(SimKind::Absent), FakeCs);
    match card.init() {
        Ok(_) => panic!("an absent card must not initialize"),
        Err((e, _card)) => assert_eq!(e, Error::CardAbsent),
    }
}

#[test]
fn block_round_trip() {
    let card = SdCard::new(SimCard::new(SimKind::Sdhc), FakeCs);
    let mut card = card.init().map_err(|(e, _)| e).unwrap();

    let mut block = Block::new();
    for (i, b) in block.contents.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    card.write(core::slice::from_ref(&block), BlockIdx(5)).unwrap();

    let read_back = card.read_block(BlockIdx(5), "test").unwrap();
    assert_eq!(read_back, block);

    // An unwritten block reads as zeroes.
    let blank = card.read_block(BlockIdx(6), "test").unwrap();
    assert_eq!(blank, Block::new());
}

#[test]
fn byte_addressed_round_trip() {
    let card = SdCard::new(SimCard::new(SimKind::Sdsc), FakeCs);
    let mut card = card.init().map_err(|(e, _)| e).unwrap();

    let mut block = Block::new();
    block.contents[0] = 0xA5;
    block.contents[511] = 0x5A;
    card.write(core::slice::from_ref(&block), BlockIdx(42)).unwrap();
    assert_eq!(card.read_block(BlockIdx(42), "test").unwrap(), block);
}

#[test]
fn out_of_range_is_rejected() {
    let card = SdCard::new(SimCard::new(SimKind::Sdhc), FakeCs);
    let mut card = card.init().map_err(|(e, _)| e).unwrap();

    let mut blocks = [Block::new()];
    assert_eq!(
        card.read(&mut blocks, BlockIdx(SimCard::BLOCKS), "test"),
        Err(Error::OutOfRange)
    );
    assert_eq!(
        card.write(&blocks, BlockIdx(SimCard::BLOCKS)),
        Err(Error::OutOfRange)
    );
    // The last valid block is fine.
    assert!(card.read(&mut blocks, BlockIdx(SimCard::BLOCKS - 1), "test").is_ok());
}

#[test]
fn rejected_write_surfaces() {
    let mut sim = SimCard::new(SimKind::Sdhc);
    sim.reject_writes = true;
    let card = SdCard::new(sim, FakeCs);
    let mut card = card.init().map_err(|(e, _)| e).unwrap();

    let block = Block::new();
    assert_eq!(
        card.write(core::slice::from_ref(&block), BlockIdx(0)),
        Err(Error::WriteRejected)
    );
}

#[test]
fn mount_full_stack() {
    init_log();
    let image = formatted_image(SimCard::BLOCKS as usize);
    let sim = SimCard::with_image(SimKind::Sdhc, &image);
    let config = Config::new(5, 18, 23, 19);
    let mut card = SdSpiCard::new(config, sim, FakeCs).unwrap();

    assert!(!card.card_ok());
    card.mount().unwrap();
    assert!(card.card_ok());
    assert_eq!(card.mount_state(), MountState::Mounted);
    assert_eq!(card.card_state(), CardState::Ready);
    assert_eq!(card.card_type(), Some(CardType::Sdhc));
    assert_eq!(card.card_size_bytes(), Some(1024 * 512));

    // Mounting again is a no-op.
    card.mount().unwrap();
    assert!(card.card_ok());

    card.write_file("/sdcard/hello.txt", b"hello over spi").unwrap();
    let mut buffer = [0u8; 64];
    let n = card.read_file("/sdcard/hello.txt", &mut buffer).unwrap();
    assert_eq!(&buffer[..n], b"hello over spi");

    // The mount point prefix is optional.
    assert_eq!(card.file_size("/hello.txt"), Ok(14));

    card.append_file("/hello.txt", b", twice").unwrap();
    let n = card.read_file("/hello.txt", &mut buffer).unwrap();
    assert_eq!(&buffer[..n], b"hello over spi, twice");

    card.create_directory("/logs").unwrap();
    assert_eq!(card.remove_directory("/missing"), Err(crate::Error::NotFound));
    card.remove_directory("/logs").unwrap();

    card.unmount().unwrap();
    assert!(!card.card_ok());
    assert_eq!(card.card_state(), CardState::Uninitialized);

    // Remount finds the data again.
    card.mount().unwrap();
    let n = card.read_file("/hello.txt", &mut buffer).unwrap();
    assert_eq!(&buffer[..n], b"hello over spi, twice");
}

#[test]
fn mount_without_card_faults() {
    init_log();
    let config = Config::new(5, 18, 23, 19);
    let mut card = SdSpiCard::new(config, SimCard::new(SimKind::Absent), FakeCs).unwrap();

    assert_eq!(card.mount(), Err(crate::Error::CardAbsent));
    assert_eq!(card.mount_state(), MountState::Faulted);
    assert_eq!(card.card_state(), CardState::Absent);
    assert!(!card.card_ok());

    // Actions without a mounted card fail without panicking.
    assert_eq!(
        card.write_file("/x", b"data"),
        Err(crate::Error::CardAbsent)
    );

    // An explicit retry runs the whole sequence again.
    assert_eq!(card.mount(), Err(crate::Error::CardAbsent));
}

#[test]
fn mount_unformatted_card_faults() {
    let config = Config::new(5, 18, 23, 19);
    let mut card = SdSpiCard::new(config, SimCard::new(SimKind::Sdhc), FakeCs).unwrap();

    assert_eq!(card.mount(), Err(crate::Error::Io));
    assert_eq!(card.mount_state(), MountState::Faulted);
    assert_eq!(card.card_state(), CardState::Error);
}

#[test]
fn power_pin_follows_lifecycle() {
    let image = formatted_image(SimCard::BLOCKS as usize);
    let sim = SimCard::with_image(SimKind::Sdhc, &image);
    let config = Config::new(5, 18, 23, 19).with_power_ctrl_pin(27);
    let power = std::rc::Rc::new(std::cell::Cell::new(false));
    let mut card =
        SdSpiCard::with_power_pin(config, sim, FakeCs, FakePower(power.clone())).unwrap();

    card.mount().unwrap();
    assert!(power.get());
    card.write_file("/f", b"x").unwrap();
    card.unmount().unwrap();
    assert!(!power.get());
    assert_eq!(card.mount_state(), MountState::Unmounted);
}

#[test]
fn config_rejected_at_construction() {
    let config = Config::new(5, 18, 23, 19).with_spi_freq_khz(50_000);
    match SdSpiCard::new(config, SimCard::new(SimKind::Sdhc), FakeCs) {
        Ok(_) => panic!("invalid config must be rejected"),
        Err(e) => assert!(matches!(e, crate::Error::Config(_))),
    }
}
