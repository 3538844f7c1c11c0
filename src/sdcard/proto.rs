//! sd-spi-card - Constants and checksums from the SD Specifications.
//!
//! Covers the subset of the SD-SPI command set this driver speaks, the
//! response flags and data tokens, the two checksums, and the capacity
//! fields of the Card Specific Data register.

/// GO_IDLE_STATE - reset the card into SPI mode if CS is low
pub const CMD0: u8 = 0x00;
/// SEND_IF_COND - check the card's supported voltage range
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data register
pub const CMD9: u8 = 0x09;
/// SEND_STATUS - read the card status register
pub const CMD13: u8 = 0x0D;
/// SET_BLOCKLEN - set the block length for byte-addressed cards
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read one data block from the card
pub const CMD17: u8 = 0x11;
/// WRITE_BLOCK - write one data block to the card
pub const CMD24: u8 = 0x18;
/// APP_CMD - escape for application specific commands
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of the card
pub const CMD58: u8 = 0x3A;
/// CRC_ON_OFF - enable or disable CRC checking
pub const CMD59: u8 = 0x3B;
/// SD_SEND_OP_COND - start the card's initialization process
pub const ACMD41: u8 = 0x29;

/// R1 value for a card in the ready state
pub const R1_READY_STATE: u8 = 0x00;
/// R1 bit for a card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;
/// R1 bit for an illegal command
pub const R1_ILLEGAL_COMMAND: u8 = 0x04;

/// Start token preceding a single-block data transfer
pub const DATA_START_BLOCK: u8 = 0xFE;
/// Mask over the data response token after a block write
pub const DATA_RES_MASK: u8 = 0x1F;
/// Data response token for accepted write data
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// OCR bit 30, the Card Capacity Status. Set on block-addressed cards.
pub const OCR_CCS_MASK: u8 = 0xC0;

/// CMD8 check pattern: 2.7-3.6 V, echo byte 0xAA.
pub const CMD8_CHECK_PATTERN: u32 = 0x1AA;

/// The CRC7 checksum carried on every command frame.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for byte in data {
        let mut d = *byte;
        for _ in 0..8 {
            crc <<= 1;
            if ((d ^ crc) & 0x80) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}

/// The X25 CRC16 checksum carried on data blocks.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for byte in data {
        crc = crc.rotate_left(8);
        crc ^= u16::from(*byte);
        crc ^= (crc & 0xFF) >> 4;
        crc ^= crc << 12;
        crc ^= (crc & 0xFF) << 5;
    }
    crc
}

/// Card Specific Data, version 1 (standard capacity cards).
///
/// Only the capacity-related fields are decoded; the rest of the register
/// never influences this driver.
#[derive(Default)]
pub struct CsdV1 {
    /// The 16 bytes of the register.
    pub data: [u8; 16],
}

impl CsdV1 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV1 {
        CsdV1::default()
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() + 2;
        (u64::from(self.device_size()) + 1) << multiplier
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() - 7;
        (self.device_size() + 1) << multiplier
    }
}

/// Card Specific Data, version 2 (high and extended capacity cards).
#[derive(Default)]
pub struct CsdV2 {
    /// The 16 bytes of the register.
    pub data: [u8; 16],
}

impl CsdV2 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV2 {
        CsdV2::default()
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 512 * 1024
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u32 {
        (self.device_size() + 1) * 1024
    }
}

/// Card Specific Data
pub enum Csd {
    /// A version 1 CSD
    V1(CsdV1),
    /// A version 2 CSD
    V2(CsdV2),
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn crc7_command_frame() {
        // CMD0 with zero argument, the canonical 0x95 frame CRC.
        assert_eq!(crc7(&[0x40, 0x00, 0x00, 0x00, 0x00]), 0x95);
        // CMD8 with the voltage check pattern.
        assert_eq!(crc7(&[0x48, 0x00, 0x00, 0x01, 0xAA]), 0x87);
    }

    #[test]
    fn crc16_data_block() {
        // An actual CSD read from an SD card
        const DATA: [u8; 16] = hex!("00 26 00 32 5F 5A 83 AE FE FB CF FF 92 80 40 DF");
        assert_eq!(crc16(&DATA), 0x9fc5);
        // 512 bytes of 0xFF, the result for a blank block
        assert_eq!(crc16(&[0xFF; 512]), 0x7FA1);
    }

    #[test]
    fn csd_v1_capacity() {
        let csd = CsdV1 {
            data: hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5"),
        };
        assert_eq!(csd.csd_ver(), 0x00);
        assert_eq!(csd.read_block_length(), 0x09);
        assert_eq!(csd.device_size(), 3874);
        assert_eq!(csd.device_size_multiplier(), 7);
        assert_eq!(csd.card_capacity_bytes(), 1_015_808_000);
        assert_eq!(csd.card_capacity_blocks(), 1_984_000);
    }

    #[test]
    fn csd_v2_capacity() {
        let csd = CsdV2 {
            data: hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B"),
        };
        assert_eq!(csd.csd_ver(), 0x01);
        assert_eq!(csd.device_size(), 7529);
        assert_eq!(csd.card_capacity_bytes(), 3_947_888_640);
        assert_eq!(csd.card_capacity_blocks(), 7_710_720);
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
