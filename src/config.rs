//! The immutable configuration handed over by the host at construction.
//!
//! The host framework owns pin muxing and constructs the SPI peripheral;
//! what arrives here is the validated wiring description plus the mount
//! parameters. The SPI peripheral passed alongside must be clocked at
//! [`Config::spi_freq_khz`].

use crate::fs::MAX_OPEN_FILES;

/// Lowest supported SPI clock, in kHz.
pub const SPI_FREQ_MIN_KHZ: u32 = 100;
/// Highest supported SPI clock, in kHz.
pub const SPI_FREQ_MAX_KHZ: u32 = 40_000;

/// The reasons a configuration can be rejected.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigError {
    /// The SPI clock is outside the 100 kHz - 40 MHz SD-SPI range.
    FrequencyOutOfRange(u32),
    /// More simultaneously open files than the filesystem supports, or zero.
    MaxOpenFilesOutOfRange(usize),
    /// Two roles are assigned to the same GPIO.
    PinConflict(u8),
    /// The mount point is not an absolute path.
    MountPointInvalid,
}

/// Wiring and mount parameters for one card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// Chip select GPIO number.
    pub cs_pin: u8,
    /// Clock GPIO number.
    pub clk_pin: u8,
    /// MOSI GPIO number.
    pub mosi_pin: u8,
    /// MISO GPIO number.
    pub miso_pin: u8,
    /// SPI clock in kHz.
    pub spi_freq_khz: u32,
    /// Where the volume appears to the host.
    pub mount_point: &'static str,
    /// Limit on simultaneously open files.
    pub max_open_files: usize,
    /// Optional GPIO powering the card, asserted before mounting.
    pub power_ctrl_pin: Option<u8>,
}

impl Config {
    /// A configuration with the default frequency (1 MHz), mount point
    /// (`/sdcard`), and open-file limit (5).
    pub fn new(cs_pin: u8, clk_pin: u8, mosi_pin: u8, miso_pin: u8) -> Self {
        Self {
            cs_pin,
            clk_pin,
            mosi_pin,
            miso_pin,
            spi_freq_khz: 1000,
            mount_point: "/sdcard",
            max_open_files: 5,
            power_ctrl_pin: None,
        }
    }

    /// Set the SPI clock in kHz.
    pub fn with_spi_freq_khz(mut self, freq_khz: u32) -> Self {
        self.spi_freq_khz = freq_khz;
        self
    }

    /// Set the mount point.
    pub fn with_mount_point(mut self, mount_point: &'static str) -> Self {
        self.mount_point = mount_point;
        self
    }

    /// Set the open-file limit.
    pub fn with_max_open_files(mut self, max_open_files: usize) -> Self {
        self.max_open_files = max_open_files;
        self
    }

    /// Set the power control pin.
    pub fn with_power_ctrl_pin(mut self, pin: u8) -> Self {
        self.power_ctrl_pin = Some(pin);
        self
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.spi_freq_khz < SPI_FREQ_MIN_KHZ || self.spi_freq_khz > SPI_FREQ_MAX_KHZ {
            return Err(ConfigError::FrequencyOutOfRange(self.spi_freq_khz));
        }
        if self.max_open_files == 0 || self.max_open_files > MAX_OPEN_FILES {
            return Err(ConfigError::MaxOpenFilesOutOfRange(self.max_open_files));
        }
        if !self.mount_point.starts_with('/')
            || (self.mount_point.len() > 1 && self.mount_point.ends_with('/'))
        {
            return Err(ConfigError::MountPointInvalid);
        }

        let mut pins = [
            Some(self.cs_pin),
            Some(self.clk_pin),
            Some(self.mosi_pin),
            Some(self.miso_pin),
            self.power_ctrl_pin,
        ];
        pins.sort_unstable();
        for pair in pins.windows(2) {
            if let [Some(a), Some(b)] = pair {
                if a == b {
                    return Err(ConfigError::PinConflict(*a));
                }
            }
        }

        Ok(())
    }
}
