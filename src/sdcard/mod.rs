//! sd-spi-card - SD card protocol driver
//!
//! Drives an SD card in SPI mode: the initialization handshake, single-block
//! reads and writes, and capacity discovery. Built on some generic SPI
//! interface and optimised for readability and debugability, not performance.

pub mod bus;
pub mod proto;

use bus::Transaction;
use proto::*;

use crate::{Block, BlockCount, BlockDevice, BlockIdx};

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;
#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

const DEFAULT_DELAY_COUNT: u32 = 32_000;
const CMD0_MAX_ATTEMPTS: i32 = 32;

/// The errors the card driver can produce.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Error {
    /// The SPI peripheral reported an error
    Transport,
    /// A chip select or power pin could not be driven
    Gpio,
    /// The card never answered the reset command
    CardAbsent,
    /// No response to this command within the poll budget
    CommandTimeout(u8),
    /// No response to this application-specific command within the poll budget
    AppCommandTimeout(u8),
    /// No data token arrived within the poll budget
    ReadTimeout,
    /// The card signalled busy for longer than the poll budget
    BusyTimeout,
    /// A data block failed its checksum
    Crc {
        /// The CRC16 the card sent
        received: u16,
        /// The CRC16 computed over the received data
        computed: u16,
    },
    /// The card rejected a read request
    ReadRejected,
    /// The card rejected written data
    WriteRejected,
    /// The card would not produce its CSD register
    RegisterError,
    /// The OCR register read failed
    OcrError,
    /// CRC checking could not be enabled
    CrcModeError,
    /// The block length could not be set on a byte-addressed card
    BlockLenError,
    /// A block index was past the end of the card
    OutOfRange,
}

/// Poll budget for a bounded busy-wait.
///
/// SD-SPI timeouts are poll counts, not wall-clock durations; with the bus
/// clock fixed at configuration time each count converts to a time budget.
pub(crate) struct Delay(u32);

impl Delay {
    pub(crate) fn new() -> Delay {
        Delay(DEFAULT_DELAY_COUNT)
    }

    pub(crate) fn delay(&mut self, err: Error) -> Result<(), Error> {
        if self.0 == 0 {
            Err(err)
        } else {
            let dummy_var: u32 = 0;
            for _ in 0..100 {
                unsafe { core::ptr::read_volatile(&dummy_var) };
            }
            self.0 -= 1;
            Ok(())
        }
    }
}

/// The different types of card we support.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum CardType {
    /// Version 1 standard capacity card
    Sd1,
    /// Version 2 standard capacity card
    Sd2,
    /// Version 2 high or extended capacity card
    Sdhc,
}

impl CardType {
    /// A human-readable label, in OCR terms.
    pub fn label(&self) -> &'static str {
        match self {
            CardType::Sd1 => "SDSC",
            CardType::Sd2 => "SDSC v2",
            CardType::Sdhc => "SDHC/SDXC",
        }
    }
}

/// How block indices are put on the wire for this card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Addressing {
    /// Standard capacity cards take byte offsets
    Byte,
    /// High capacity cards take block indices
    Block,
}

/// The card's shape, discovered once during initialization and fixed for
/// the session.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CardGeometry {
    /// Number of 512-byte blocks on the card
    pub block_count: BlockCount,
    /// Addressing mode on the wire
    pub addressing: Addressing,
}

impl CardGeometry {
    /// Usable card capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.block_count.into_bytes()
    }

    fn contains(&self, start: BlockIdx, count: usize) -> bool {
        (start.0 as u64) + count as u64 <= u64::from(self.block_count.0)
    }
}

/// The state of an [`SdCard`] before initialization
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct Uninit;

/// The state of an [`SdCard`] after a successful initialization handshake
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct Ready {
    geometry: CardGeometry,
}

/// An SD card on an SPI bus.
///
/// Built from an SPI peripheral and a Chip Select pin. Chip Select has to be
/// separate so the reset sequence can clock bytes out without it asserted
/// (which is what puts the card into SPI mode).
pub struct SdCard<SPI, CS, STATE>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    card_type: CardType,
    spi: SPI,
    cs: CS,
    state: STATE,
}

impl<SPI, CS> SdCard<SPI, CS, Uninit>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Create a driver for an uninitialized card.
    pub fn new(spi: SPI, cs: CS) -> Self {
        SdCard {
            card_type: CardType::Sd1,
            spi,
            cs,
            state: Uninit {},
        }
    }

    fn discard_byte(&mut self) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [0xFF])
            .map(|b| b[0])
            .map_err(|_e| Error::Transport)
    }

    /// Run the initialization handshake and bring the card to [`Ready`].
    ///
    /// On failure the driver is handed back so the caller can retry.
    pub fn init(mut self) -> Result<SdCard<SPI, CS, Ready>, (Error, Self)> {
        let f = |s: &mut Self| {
            trace!("Reset card..");

            // Supply minimum of 74 clock cycles without CS asserted.
            s.cs.set_high().map_err(|_| Error::Gpio)?;
            for _ in 0..10 {
                s.discard_byte()?;
            }

            let mut txn = Transaction::new(&mut s.spi, &mut s.cs)?;

            // Enter SPI mode
            let mut delay = Delay::new();
            let mut attempts = CMD0_MAX_ATTEMPTS;
            while attempts > 0 {
                trace!("Enter SPI mode, attempt: {}..", CMD0_MAX_ATTEMPTS - attempts);
                match txn.card_command(CMD0, 0) {
                    Err(Error::CommandTimeout(0)) => {
                        warn!("Timed out, trying again..");
                        attempts -= 1;
                    }
                    Err(e) => {
                        return Err(e);
                    }
                    Ok(R1_IDLE_STATE) => {
                        break;
                    }
                    Ok(r) => {
                        // Try again
                        warn!("Got response: {:x}, trying again..", r);
                    }
                }

                delay.delay(Error::CommandTimeout(CMD0))?;
            }
            if attempts == 0 {
                return Err(Error::CardAbsent);
            }

            // Enable CRC checking
            if txn.card_command(CMD59, 1)? != R1_IDLE_STATE {
                return Err(Error::CrcModeError);
            }

            // Check card version
            let mut delay = Delay::new();
            loop {
                if txn.card_command(CMD8, CMD8_CHECK_PATTERN)?
                    == (R1_ILLEGAL_COMMAND | R1_IDLE_STATE)
                {
                    s.card_type = CardType::Sd1;
                    break;
                }
                txn.receive()?;
                txn.receive()?;
                txn.receive()?;
                let status = txn.receive()?;
                if status == 0xAA {
                    s.card_type = CardType::Sd2;
                    break;
                }
                delay.delay(Error::CommandTimeout(CMD8))?;
            }
            debug!("Card version: {:?}", s.card_type);

            let arg = match s.card_type {
                CardType::Sd1 => 0,
                CardType::Sd2 | CardType::Sdhc => 0x4000_0000,
            };

            let mut delay = Delay::new();
            while txn.card_acmd(ACMD41, arg)? != R1_READY_STATE {
                delay.delay(Error::AppCommandTimeout(ACMD41))?;
            }

            if s.card_type == CardType::Sd2 {
                if txn.card_command(CMD58, 0)? != R1_READY_STATE {
                    return Err(Error::OcrError);
                }
                if (txn.receive()? & OCR_CCS_MASK) == OCR_CCS_MASK {
                    s.card_type = CardType::Sdhc;
                }
                // Discard other three bytes
                txn.receive()?;
                txn.receive()?;
                txn.receive()?;
            }

            let addressing = match s.card_type {
                CardType::Sd1 | CardType::Sd2 => Addressing::Byte,
                CardType::Sdhc => Addressing::Block,
            };

            // Byte-addressed cards can have a different power-on block
            // length; pin it to 512.
            if addressing == Addressing::Byte
                && txn.card_command(CMD16, Block::LEN_U32)? != R1_READY_STATE
            {
                return Err(Error::BlockLenError);
            }

            let block_count = Self::read_capacity(&mut txn, s.card_type)?;
            debug!("Card has {} blocks", block_count.0);

            Ok(CardGeometry {
                block_count,
                addressing,
            })
        };
        let result = f(&mut self);
        let _ = self.discard_byte();

        match result {
            Ok(geometry) => Ok(SdCard {
                card_type: self.card_type,
                spi: self.spi,
                cs: self.cs,
                state: Ready { geometry },
            }),
            Err(e) => Err((e, self)),
        }
    }

    fn read_capacity(
        txn: &mut Transaction<SPI, CS>,
        card_type: CardType,
    ) -> Result<BlockCount, Error> {
        if txn.card_command(CMD9, 0)? != R1_READY_STATE {
            return Err(Error::RegisterError);
        }
        let csd = match card_type {
            CardType::Sd1 => {
                let mut csd = CsdV1::new();
                txn.read_data(&mut csd.data)?;
                Csd::V1(csd)
            }
            CardType::Sd2 | CardType::Sdhc => {
                let mut csd = CsdV2::new();
                txn.read_data(&mut csd.data)?;
                Csd::V2(csd)
            }
        };
        let blocks = match csd {
            Csd::V1(contents) => contents.card_capacity_blocks(),
            Csd::V2(contents) => contents.card_capacity_blocks(),
        };
        Ok(BlockCount(blocks))
    }
}

impl<SPI, CS> SdCard<SPI, CS, Ready>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Mark the card as unused.
    /// This should be kept infallible, because Drop is unable to fail.
    pub fn deinit(self) -> SdCard<SPI, CS, Uninit> {
        SdCard {
            card_type: self.card_type,
            spi: self.spi,
            cs: self.cs,
            state: Uninit {},
        }
    }

    /// The card's geometry, as discovered during initialization.
    pub fn geometry(&self) -> &CardGeometry {
        &self.state.geometry
    }

    /// Which kind of card this is.
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// The usable size of this card in bytes.
    pub fn card_size_bytes(&self) -> u64 {
        self.state.geometry.capacity_bytes()
    }

    /// Run `f` inside a chip-select scoped transaction.
    ///
    /// Chip select is always deasserted, even if an error occured in `f`.
    fn with_transaction<F, R>(&mut self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Transaction<SPI, CS>) -> Result<R, Error>,
    {
        let mut txn = Transaction::new(&mut self.spi, &mut self.cs)?;
        f(&mut txn)
    }

    fn wire_address(&self, block: BlockIdx) -> u32 {
        match self.state.geometry.addressing {
            Addressing::Byte => block.0 * Block::LEN_U32,
            Addressing::Block => block.0,
        }
    }
}

impl<SPI, CS> BlockDevice for SdCard<SPI, CS, Ready>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    type Error = Error;

    /// Read one or more blocks, starting at the given block index.
    ///
    /// Issued as individual single-block reads; multi-block transfers are
    /// not part of this driver's contract.
    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        _reason: &str,
    ) -> Result<(), Self::Error> {
        if !self.state.geometry.contains(start_block_idx, blocks.len()) {
            return Err(Error::OutOfRange);
        }
        for (offset, block) in blocks.iter_mut().enumerate() {
            let addr = self.wire_address(start_block_idx + BlockCount(offset as u32));
            self.with_transaction(|txn| {
                txn.card_command(CMD17, addr)?;
                txn.read_data(&mut block.contents)
            })?;
        }
        Ok(())
    }

    /// Write one or more blocks, starting at the given block index.
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        if !self.state.geometry.contains(start_block_idx, blocks.len()) {
            return Err(Error::OutOfRange);
        }
        for (offset, block) in blocks.iter().enumerate() {
            let addr = self.wire_address(start_block_idx + BlockCount(offset as u32));
            self.with_transaction(|txn| {
                txn.card_command(CMD24, addr)?;
                txn.write_data(DATA_START_BLOCK, &block.contents)?;
                txn.wait_not_busy()?;
                if txn.card_command(CMD13, 0)? != 0x00 {
                    return Err(Error::WriteRejected);
                }
                if txn.receive()? != 0x00 {
                    return Err(Error::WriteRejected);
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Determine how many blocks this device can hold.
    ///
    /// Answered from the geometry captured at initialization; the bus is
    /// not touched.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        Ok(self.state.geometry.block_count)
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
