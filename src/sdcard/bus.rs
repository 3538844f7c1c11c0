//! The chip-select scoped bus transaction.
//!
//! All traffic to the card happens through a [`Transaction`], which asserts
//! chip select when it is created and deasserts it when dropped. The guard
//! carries the byte-level transfer primitives plus the command framing and
//! data-token handling built on top of them.

use embedded_hal::{blocking::spi::Transfer, digital::v2::OutputPin};

use super::proto::*;
use super::{Delay, Error};

/// A single logical transaction on the SPI bus.
///
/// Exactly one of these can exist at a time per bus; while it lives, chip
/// select stays asserted and no other device may be addressed.
pub struct Transaction<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    spi: &'spi mut SPI,
    cs: &'cs mut CS,
}

impl<'spi, 'cs, SPI, CS> Drop for Transaction<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    fn drop(&mut self) {
        self.cs_high().ok();
    }
}

impl<'spi, 'cs, SPI, CS> Transaction<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Begin a transaction. Chip select is asserted until the value is
    /// dropped, also on early error returns.
    pub fn new(spi: &'spi mut SPI, cs: &'cs mut CS) -> Result<Self, Error> {
        let mut me = Self { spi, cs };
        me.cs_low()?;
        Ok(me)
    }

    fn cs_high(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| Error::Gpio)
    }

    fn cs_low(&mut self) -> Result<(), Error> {
        self.cs.set_low().map_err(|_| Error::Gpio)
    }

    /// Send one byte and receive one byte.
    fn transfer(&mut self, out: u8) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [out])
            .map(|b| b[0])
            .map_err(|_e| Error::Transport)
    }

    /// Receive a byte from the card by clocking out an 0xFF byte.
    pub fn receive(&mut self) -> Result<u8, Error> {
        self.transfer(0xFF)
    }

    /// Send a byte to the card.
    pub fn send(&mut self, out: u8) -> Result<(), Error> {
        let _ = self.transfer(out)?;
        Ok(())
    }

    /// Spin until the card stops signalling busy (returns 0xFF), or the
    /// poll budget runs out.
    pub fn wait_not_busy(&mut self) -> Result<(), Error> {
        let mut delay = Delay::new();
        loop {
            let s = self.receive()?;
            if s == 0xFF {
                break;
            }
            delay.delay(Error::BusyTimeout)?;
        }
        Ok(())
    }

    /// Frame and send a command, then poll for its R1 response.
    pub fn card_command(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        self.wait_not_busy()?;
        let mut buf = [
            0x40 | command,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            0,
        ];
        buf[5] = crc7(&buf[0..5]);

        for b in buf.iter() {
            self.send(*b)?;
        }

        // R1 arrives within N_CR byte times; the budget is deliberately
        // generous because some cards stretch it while idle.
        for _ in 0..512 {
            let result = self.receive()?;
            if (result & 0x80) == 0 {
                return Ok(result);
            }
        }

        Err(Error::CommandTimeout(command))
    }

    /// Send an application-specific command (CMD55 escape, then `command`).
    pub fn card_acmd(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        self.card_command(CMD55, 0)?;
        self.card_command(command, arg)
    }

    /// Receive a data packet: wait for the start token, fill `buffer`, then
    /// check the trailing CRC16.
    pub fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        let mut delay = Delay::new();
        let status = loop {
            let s = self.receive()?;
            if s != 0xFF {
                break s;
            }
            delay.delay(Error::ReadTimeout)?;
        };
        if status != DATA_START_BLOCK {
            return Err(Error::ReadRejected);
        }

        for b in buffer.iter_mut() {
            *b = self.receive()?;
        }

        let mut crc = u16::from(self.receive()?);
        crc <<= 8;
        crc |= u16::from(self.receive()?);

        let computed = crc16(buffer);
        if crc != computed {
            return Err(Error::Crc {
                received: crc,
                computed,
            });
        }

        Ok(())
    }

    /// Send a data packet: start token, payload, CRC16, then check the data
    /// response token.
    pub fn write_data(&mut self, token: u8, buffer: &[u8]) -> Result<(), Error> {
        let crc = crc16(buffer);
        self.send(token)?;
        for b in buffer.iter() {
            self.send(*b)?;
        }
        self.send((crc >> 8) as u8)?;
        self.send(crc as u8)?;
        let status = self.receive()?;
        if (status & DATA_RES_MASK) != DATA_RES_ACCEPTED {
            Err(Error::WriteRejected)
        } else {
            Ok(())
        }
    }
}
