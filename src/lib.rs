//! # sd-spi-card
//!
//! > An SD-over-SPI storage stack written in Embedded Rust
//!
//! This crate drives an SD card in SPI mode and puts a small filesystem on
//! it: single-block reads and writes underneath, file and directory actions
//! on top, with a mount/lifecycle manager in between that owns the bus and
//! reports card status. It is written in pure-Rust, is `#![no_std]` and does
//! not use `alloc` to keep the memory footprint low. In the first instance
//! it is designed for readability and simplicity over performance.
//!
//! ## Using the crate
//!
//! The host constructs the SPI peripheral (anything implementing
//! `embedded_hal::blocking::spi::Transfer<u8>`) and the chip-select pin, and
//! hands both to an [`SdSpiCard`] together with a validated [`Config`]:
//!
//! ```rust,ignore
//! let config = sd_spi_card::Config::new(5, 18, 23, 19)
//!     .with_spi_freq_khz(4000)
//!     .with_mount_point("/sdcard");
//! let mut card = sd_spi_card::SdSpiCard::new(config, spi, cs)?;
//! card.mount()?;
//! card.write_file("/sdcard/boot.log", b"hello")?;
//! ```
//!
//! The block layer can also be used on its own: [`SdCard`] implements
//! [`BlockDevice`], and [`fs::Volume`] runs on any [`BlockDevice`]
//! (including [`MemoryBlockDevice`], which is how the filesystem is tested).
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the
//! `defmt-log` feature you can configure this crate to log messages over
//! defmt instead.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is
//! enabled.

#![cfg_attr(not(test), no_std)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[cfg(test)]
mod test;

#[macro_use]
mod structure;

pub mod block_device;
pub mod card;
pub mod config;
pub mod fs;
pub mod sdcard;

pub use crate::block_device::{Block, BlockCount, BlockDevice, BlockIdx, MemoryBlockDevice};
pub use crate::card::{CardState, Error, MountState, SdSpiCard};
pub use crate::config::{Config, ConfigError};
pub use crate::sdcard::Error as SdCardError;
pub use crate::sdcard::{CardType, SdCard};

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
