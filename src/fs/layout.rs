//! On-disk layout of a cardfs volume.
//!
//! Block 0 holds the superblock. The chain table follows, one little-endian
//! `u32` per block on the device. Directories are chains of blocks holding
//! fixed 32-byte entries. All multi-byte fields are little-endian.

use crate::{Block, BlockCount, BlockIdx};

/// Magic bytes at the start of the superblock.
pub const SIGNATURE: [u8; 6] = *b"cardfs";
/// Current on-disk format version.
pub const VERSION: u16 = 1;

/// Length of a raw directory entry in bytes.
pub const DIR_ENTRY_LEN: usize = 32;
/// Directory entries per block.
pub const DIR_ENTRIES_PER_BLOCK: usize = Block::LEN / DIR_ENTRY_LEN;
/// Maximum length of a single name component.
pub const NAME_LEN: usize = 20;

/// First name byte marking the end of a directory.
pub const ENTRY_END: u8 = 0x00;
/// First name byte marking a deleted entry whose slot can be reused.
pub const ENTRY_FREE: u8 = 0xE5;

bitflags::bitflags! {
    /// Attribute bits of a directory entry.
    pub struct Attributes: u8 {
        const DIRECTORY = (1 << 0);
    }
}

/// The reasons a superblock can be rejected at mount.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SuperBlockError {
    /// The signature bytes did not match; the device is not formatted as
    /// cardfs.
    BadSignature,
    /// The format version is one this code does not speak.
    BadVersion(u16),
    /// The recorded block size is not 512.
    BadBlockSize(u16),
    /// The recorded region layout is inconsistent (overlapping regions, a
    /// chain table too small for the block count, or a size larger than the
    /// device).
    BadLayout,
}

/// Raw byte view of the superblock.
pub struct SuperBlockRaw {
    block: Block,
}

impl SuperBlockRaw {
    /// Wrap a block read from (or destined for) block 0.
    pub fn new(block: Block) -> Self {
        Self { block }
    }

    /// Give the underlying block back, e.g. for writing to the device.
    pub fn into_block(self) -> Block {
        self.block
    }

    fn data(&self) -> &[u8] {
        &self.block.contents
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.block.contents
    }

    /// The signature bytes.
    pub fn signature(&self) -> &[u8] {
        &self.data()[0..6]
    }

    /// Set the signature bytes.
    pub fn set_signature(&mut self, signature: &[u8; 6]) {
        self.data_mut()[0..6].copy_from_slice(signature);
    }

    define_field!(version, set_version, u16, 6);
    define_field!(total_blocks, set_total_blocks, u32, 8);
    define_field!(table_start, set_table_start, u32, 12);
    define_field!(table_blocks, set_table_blocks, u32, 16);
    define_field!(root_block, set_root_block, u32, 20);
    define_field!(block_size, set_block_size, u16, 24);
}

/// The verified superblock of a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuperBlock {
    /// Number of blocks the volume spans, superblock included.
    pub total_blocks: BlockCount,
    /// First block of the chain table.
    pub table_start: BlockIdx,
    /// Length of the chain table.
    pub table_blocks: BlockCount,
    /// First block of the root directory.
    pub root_block: BlockIdx,
}

impl SuperBlock {
    /// Chain-table entries held by one table block.
    pub const TABLE_ENTRIES_PER_BLOCK: u32 = (Block::LEN / 4) as u32;

    /// Parse and verify a superblock read from block 0.
    pub fn parse(block: Block) -> Result<Self, SuperBlockError> {
        let raw = SuperBlockRaw::new(block);

        if raw.signature() != SIGNATURE {
            return Err(SuperBlockError::BadSignature);
        }
        if raw.version() != VERSION {
            return Err(SuperBlockError::BadVersion(raw.version()));
        }
        if raw.block_size() as usize != Block::LEN {
            return Err(SuperBlockError::BadBlockSize(raw.block_size()));
        }

        let me = Self {
            total_blocks: BlockCount(raw.total_blocks()),
            table_start: BlockIdx(raw.table_start()),
            table_blocks: BlockCount(raw.table_blocks()),
            root_block: BlockIdx(raw.root_block()),
        };

        let table_end = me.table_start + me.table_blocks;
        let covered = u64::from(me.table_blocks.0) * u64::from(Self::TABLE_ENTRIES_PER_BLOCK);

        if me.table_start.0 == 0
            || me.table_blocks.0 == 0
            || me.root_block < table_end
            || me.root_block.0 >= me.total_blocks.0
            || covered < u64::from(me.total_blocks.0)
        {
            return Err(SuperBlockError::BadLayout);
        }

        Ok(me)
    }

    /// Serialize into a block destined for block 0.
    pub fn to_block(&self) -> Block {
        let mut raw = SuperBlockRaw::new(Block::new());
        raw.set_signature(&SIGNATURE);
        raw.set_version(VERSION);
        raw.set_total_blocks(self.total_blocks.0);
        raw.set_table_start(self.table_start.0);
        raw.set_table_blocks(self.table_blocks.0);
        raw.set_root_block(self.root_block.0);
        raw.set_block_size(Block::LEN as u16);
        raw.into_block()
    }

    /// First block usable for directory and file data.
    pub fn data_start(&self) -> BlockIdx {
        self.table_start + self.table_blocks
    }
}

/// Raw byte view of one 32-byte directory entry inside a block.
///
/// Layout: name (20 bytes, NUL padded), attributes (1 byte), 3 reserved
/// bytes, file size (u32), first data block (u32).
pub struct DirEntryRaw<'a> {
    data: &'a mut [u8],
}

impl<'a> DirEntryRaw<'a> {
    /// View the `DIR_ENTRY_LEN` bytes in `data`.
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// The raw, padded name bytes.
    pub fn name(&self) -> &[u8] {
        &self.data()[0..NAME_LEN]
    }

    /// Set the name, NUL padding to `NAME_LEN`.
    pub fn set_name(&mut self, name: &[u8]) {
        let dest = &mut self.data_mut()[0..NAME_LEN];
        dest.fill(0);
        dest[..name.len()].copy_from_slice(name);
    }

    define_field!(attr, set_attr, u8, 20);
    define_field!(file_size, set_file_size, u32, 24);
    define_field!(first_block, set_first_block, u32, 28);

    /// Does this entry mark the end of the directory?
    pub fn is_end(&self) -> bool {
        self.data()[0] == ENTRY_END
    }

    /// Is this a deleted entry whose slot can be reused?
    pub fn is_free_slot(&self) -> bool {
        self.data()[0] == ENTRY_FREE
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn superblock_round_trip() {
        let sb = SuperBlock {
            total_blocks: BlockCount(1024),
            table_start: BlockIdx(1),
            table_blocks: BlockCount(8),
            root_block: BlockIdx(9),
        };
        assert_eq!(SuperBlock::parse(sb.to_block()), Ok(sb));
        assert_eq!(sb.data_start(), BlockIdx(9));
    }

    #[test]
    fn superblock_rejects_garbage() {
        assert_eq!(
            SuperBlock::parse(Block::new()),
            Err(SuperBlockError::BadSignature)
        );

        // A table of 1 block only covers 128 entries.
        let sb = SuperBlock {
            total_blocks: BlockCount(1024),
            table_start: BlockIdx(1),
            table_blocks: BlockCount(1),
            root_block: BlockIdx(2),
        };
        assert_eq!(
            SuperBlock::parse(sb.to_block()),
            Err(SuperBlockError::BadLayout)
        );
    }

    #[test]
    fn dir_entry_fields() {
        let mut buf = [0u8; DIR_ENTRY_LEN];
        let mut raw = DirEntryRaw::new(&mut buf);
        assert!(raw.is_end());

        raw.set_name(b"notes.txt");
        raw.set_attr(0);
        raw.set_file_size(1234);
        raw.set_first_block(77);

        assert!(!raw.is_end());
        assert!(!raw.is_free_slot());
        assert_eq!(&raw.name()[..9], b"notes.txt");
        assert_eq!(raw.file_size(), 1234);
        assert_eq!(raw.first_block(), 77);
    }
}
