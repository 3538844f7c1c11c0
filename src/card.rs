//! The mount/lifecycle manager and the action-style file API.
//!
//! [`SdSpiCard`] owns the configuration, the optional power-control pin,
//! and the card driver / mounted volume. `mount()` drives the whole chain:
//! power up, card initialization handshake, volume mount. Any failure
//! lands in `Faulted` and is reported; nothing retries behind the caller's
//! back.

use core::convert::Infallible;

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;

#[cfg(feature = "log")]
use log::{debug, info, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::fs::dir::DirIter;
use crate::fs::{FsError, Volume};
use crate::sdcard::{self, CardType, Ready, SdCard, Uninit};

/// Everything a file action or the mount sequence can report.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// The configuration was rejected.
    Config(ConfigError),
    /// The SPI peripheral or a GPIO could not be driven.
    Transport,
    /// The card did not answer within a poll budget.
    ProtocolTimeout,
    /// A transfer failed its checksum.
    CrcMismatch,
    /// No usable card: never initialized, unresponsive, or unmounted.
    CardAbsent,
    /// The path is not valid for the requested operation.
    PathInvalid,
    /// No such file or directory.
    NotFound,
    /// The entry already exists.
    AlreadyExists,
    /// The directory is not empty.
    NotEmpty,
    /// Any other card or filesystem failure.
    Io,
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<sdcard::Error> for Error {
    fn from(e: sdcard::Error) -> Self {
        match e {
            sdcard::Error::Transport | sdcard::Error::Gpio => Self::Transport,
            sdcard::Error::CommandTimeout(_)
            | sdcard::Error::AppCommandTimeout(_)
            | sdcard::Error::ReadTimeout
            | sdcard::Error::BusyTimeout => Self::ProtocolTimeout,
            sdcard::Error::Crc { .. } => Self::CrcMismatch,
            sdcard::Error::CardAbsent => Self::CardAbsent,
            _ => Self::Io,
        }
    }
}

impl From<FsError<sdcard::Error>> for Error {
    fn from(e: FsError<sdcard::Error>) -> Self {
        match e {
            FsError::Device(inner) => inner.into(),
            FsError::PathInvalid => Self::PathInvalid,
            FsError::NotFound | FsError::NotAFile | FsError::NotADirectory => Self::NotFound,
            FsError::AlreadyExists => Self::AlreadyExists,
            FsError::NotEmpty => Self::NotEmpty,
            _ => Self::Io,
        }
    }
}

/// Where the manager is in its lifecycle.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MountState {
    /// No mount has been attempted, or the card was unmounted.
    Unmounted,
    /// A mount is in progress.
    Mounting,
    /// The volume is usable.
    Mounted,
    /// The last mount attempt failed; `mount()` may be called again.
    Faulted,
}

/// The card's condition as reported to the host's status surface.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CardState {
    /// Nothing has happened yet.
    Uninitialized,
    /// Initialization is running.
    Initializing,
    /// The card is mounted and usable.
    Ready,
    /// The last attempt failed with the card present.
    Error,
    /// The card did not respond at all.
    Absent,
}

/// Stand-in power pin for builds without power control.
pub struct NoPowerPin;

impl OutputPin for NoPowerPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Infallible> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

enum Bus<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    Idle(SdCard<SPI, CS, Uninit>),
    Mounted(Volume<SdCard<SPI, CS, Ready>>),
    // Transient marker while ownership moves through mount/unmount.
    Poisoned,
}

/// One SD card on one SPI bus, from power pin to file actions.
pub struct SdSpiCard<SPI, CS, PWR = NoPowerPin>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    PWR: OutputPin,
{
    config: Config,
    power_pin: Option<PWR>,
    state: MountState,
    last_error: Option<Error>,
    bus: Bus<SPI, CS>,
}

impl<SPI, CS> SdSpiCard<SPI, CS, NoPowerPin>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Create a manager without power control.
    pub fn new(config: Config, spi: SPI, cs: CS) -> Result<Self, Error> {
        Self::build(config, spi, cs, None)
    }
}

impl<SPI, CS, PWR> SdSpiCard<SPI, CS, PWR>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    PWR: OutputPin,
{
    /// Create a manager that asserts `power_pin` before mounting and
    /// deasserts it on unmount.
    pub fn with_power_pin(config: Config, spi: SPI, cs: CS, power_pin: PWR) -> Result<Self, Error> {
        Self::build(config, spi, cs, Some(power_pin))
    }

    fn build(config: Config, spi: SPI, cs: CS, power_pin: Option<PWR>) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            config,
            power_pin,
            state: MountState::Unmounted,
            last_error: None,
            bus: Bus::Idle(SdCard::new(spi, cs)),
        })
    }

    /// The configuration this manager was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Initialize the card and mount the volume.
    ///
    /// Calling this while mounted is a no-op. On failure the manager is
    /// `Faulted`; calling `mount()` again retries from the start.
    pub fn mount(&mut self) -> Result<(), Error> {
        if self.state == MountState::Mounted {
            debug!("already mounted at {}", self.config.mount_point);
            return Ok(());
        }

        self.state = MountState::Mounting;
        debug!(
            "mounting: cs={} clk={} mosi={} miso={} freq={}kHz",
            self.config.cs_pin,
            self.config.clk_pin,
            self.config.mosi_pin,
            self.config.miso_pin,
            self.config.spi_freq_khz
        );

        if let Some(pin) = &mut self.power_pin {
            if pin.set_high().is_err() {
                return Err(self.fault(Error::Transport));
            }
        }

        let card = match core::mem::replace(&mut self.bus, Bus::Poisoned) {
            Bus::Idle(card) => card,
            Bus::Mounted(volume) => {
                // State said otherwise; recover rather than lose the bus.
                self.bus = Bus::Mounted(volume);
                self.state = MountState::Mounted;
                return Ok(());
            }
            Bus::Poisoned => return Err(self.fault(Error::Io)),
        };

        let ready = match card.init() {
            Ok(ready) => ready,
            Err((e, card)) => {
                self.bus = Bus::Idle(card);
                warn!("card init failed: {:?}", e);
                return Err(self.fault(e.into()));
            }
        };

        match Volume::mount(ready, self.config.max_open_files) {
            Ok(volume) => {
                info!(
                    "card mounted at {}: {} ({} MiB)",
                    self.config.mount_point,
                    volume.block_device().card_type().label(),
                    volume.block_device().card_size_bytes() / (1024 * 1024)
                );
                self.bus = Bus::Mounted(volume);
                self.state = MountState::Mounted;
                self.last_error = None;
                Ok(())
            }
            Err((e, ready)) => {
                self.bus = Bus::Idle(ready.deinit());
                warn!("volume mount failed: {:?}", e);
                Err(self.fault(e.into()))
            }
        }
    }

    /// Unmount the volume and deinitialize the card. A no-op when nothing
    /// is mounted. Deasserts the power pin, power-cycling the card if the
    /// board is wired for it.
    pub fn unmount(&mut self) -> Result<(), Error> {
        match core::mem::replace(&mut self.bus, Bus::Poisoned) {
            Bus::Mounted(volume) => {
                let ready = volume.release();
                self.bus = Bus::Idle(ready.deinit());
            }
            Bus::Idle(card) => {
                self.bus = Bus::Idle(card);
            }
            Bus::Poisoned => return Err(Error::Io),
        }
        if let Some(pin) = &mut self.power_pin {
            pin.set_low().ok();
        }
        self.state = MountState::Unmounted;
        self.last_error = None;
        Ok(())
    }

    fn fault(&mut self, e: Error) -> Error {
        self.state = MountState::Faulted;
        self.last_error = Some(e);
        e
    }

    /// The binary card-status surface: true iff the volume is mounted.
    pub fn card_ok(&self) -> bool {
        self.state == MountState::Mounted
    }

    /// Where the manager is in its lifecycle.
    pub fn mount_state(&self) -> MountState {
        self.state
    }

    /// The card's condition for status reporting.
    pub fn card_state(&self) -> CardState {
        match self.state {
            MountState::Unmounted => CardState::Uninitialized,
            MountState::Mounting => CardState::Initializing,
            MountState::Mounted => CardState::Ready,
            MountState::Faulted => match self.last_error {
                Some(Error::CardAbsent) => CardState::Absent,
                _ => CardState::Error,
            },
        }
    }

    /// Which kind of card is mounted, for the host's card-type report.
    pub fn card_type(&self) -> Option<CardType> {
        match &self.bus {
            Bus::Mounted(volume) => Some(volume.block_device().card_type()),
            _ => None,
        }
    }

    /// Usable card capacity in bytes, once mounted.
    pub fn card_size_bytes(&self) -> Option<u64> {
        match &self.bus {
            Bus::Mounted(volume) => Some(volume.block_device().card_size_bytes()),
            _ => None,
        }
    }

    /// Unallocated volume space in bytes.
    pub fn free_space_bytes(&mut self) -> Result<u64, Error> {
        let volume = self.volume()?;
        Ok(volume.free_blocks()?.into_bytes())
    }

    fn volume(&mut self) -> Result<&mut Volume<SdCard<SPI, CS, Ready>>, Error> {
        match &mut self.bus {
            Bus::Mounted(volume) => Ok(volume),
            _ => Err(Error::CardAbsent),
        }
    }

    /// Strip the configured mount point off `path`, tolerating both
    /// `/sdcard/log.txt` and plain `/log.txt` spellings.
    fn volume_path<'p>(&self, path: &'p str) -> &'p str {
        let mount_point = self.config.mount_point;
        if mount_point.len() > 1 {
            if let Some(rest) = path.strip_prefix(mount_point) {
                if rest.is_empty() {
                    return "/";
                }
                if rest.starts_with('/') {
                    return rest;
                }
            }
        }
        path
    }

    // ------------------------------------------------------------------
    // File actions
    // ------------------------------------------------------------------

    /// Create or truncate the file at `path` and store `data` in it.
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), Error> {
        let vpath = self.volume_path(path);
        let result = self.volume()?.write_file(vpath, data);
        self.report("write_file", path, result)
    }

    /// Append `data` to the file at `path`, creating it if absent.
    pub fn append_file(&mut self, path: &str, data: &[u8]) -> Result<(), Error> {
        let vpath = self.volume_path(path);
        let result = self.volume()?.append_file(vpath, data);
        self.report("append_file", path, result)
    }

    /// Read the file at `path` into `buffer`, returning the bytes read.
    pub fn read_file(&mut self, path: &str, buffer: &mut [u8]) -> Result<usize, Error> {
        let vpath = self.volume_path(path);
        let result = self.volume()?.read_file(vpath, buffer);
        self.report("read_file", path, result)
    }

    /// Delete the file at `path`.
    pub fn delete_file(&mut self, path: &str) -> Result<(), Error> {
        let vpath = self.volume_path(path);
        let result = self.volume()?.delete_file(vpath);
        self.report("delete_file", path, result)
    }

    /// Create the directory at `path`. The parent has to exist.
    pub fn create_directory(&mut self, path: &str) -> Result<(), Error> {
        let vpath = self.volume_path(path);
        let result = self.volume()?.create_dir(vpath);
        self.report("create_directory", path, result)
    }

    /// Remove the empty directory at `path`.
    pub fn remove_directory(&mut self, path: &str) -> Result<(), Error> {
        let vpath = self.volume_path(path);
        let result = self.volume()?.remove_dir(vpath);
        self.report("remove_directory", path, result)
    }

    /// The size in bytes of the file at `path`.
    pub fn file_size(&mut self, path: &str) -> Result<u32, Error> {
        let vpath = self.volume_path(path);
        let result = self.volume()?.file_size(vpath);
        self.report("file_size", path, result)
    }

    /// Iterate the entries of the directory at `path`.
    pub fn dir_iter(&mut self, path: &str) -> Result<DirIter<'_, SdCard<SPI, CS, Ready>>, Error> {
        let vpath = self.volume_path(path);
        match &mut self.bus {
            Bus::Mounted(volume) => volume.dir_iter(vpath).map_err(Error::from),
            _ => Err(Error::CardAbsent),
        }
    }

    fn report<T>(
        &mut self,
        action: &str,
        path: &str,
        result: Result<T, FsError<sdcard::Error>>,
    ) -> Result<T, Error> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("{} failed for {}: {:?}", action, path, e);
                Err(e.into())
            }
        }
    }
}
