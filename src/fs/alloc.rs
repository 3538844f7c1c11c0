//! The block chain table.
//!
//! One `u32` entry per block on the volume, FAT-style: an entry is free,
//! reserved (superblock and table blocks themselves), the end of a chain,
//! or the index of the next block in its chain.

use core::convert::TryInto;

use crate::{Block, BlockCount, BlockDevice, BlockIdx};

use super::layout::SuperBlock;
use super::{FsError, Volume};

/// One chain-table entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entry(pub u32);

impl Entry {
    /// The block is unallocated.
    pub const FREE: Self = Self(0);
    /// The block is not available for allocation (superblock, table).
    pub const RESERVED: Self = Self(0xFFFF_FFFE);
    /// The block is the last of its chain.
    pub const END: Self = Self(0xFFFF_FFFF);

    /// Is this block unallocated?
    pub fn is_free(&self) -> bool {
        self == &Self::FREE
    }

    /// Is this block the last of its chain?
    pub fn is_end(&self) -> bool {
        self == &Self::END
    }

    /// The next block of the chain, if the entry is a chain link.
    pub fn next(&self) -> Option<BlockIdx> {
        if self.is_free() || self.is_end() || self == &Self::RESERVED {
            None
        } else {
            Some(BlockIdx(self.0))
        }
    }
}

impl<BD> Volume<BD>
where
    BD: BlockDevice,
{
    fn table_location(&self, block: BlockIdx) -> (BlockIdx, usize) {
        let per_block = SuperBlock::TABLE_ENTRIES_PER_BLOCK;
        let table_block = self.sb.table_start + BlockCount(block.0 / per_block);
        let offset = (block.0 % per_block) as usize * 4;
        (table_block, offset)
    }

    /// Read the chain-table entry for `block`.
    pub(crate) fn chain_entry(&mut self, block: BlockIdx) -> Result<Entry, FsError<BD::Error>> {
        if block.0 >= self.sb.total_blocks.0 {
            return Err(FsError::Corrupt);
        }
        let (table_block, offset) = self.table_location(block);
        let table = self
            .block_device
            .read_block(table_block, "chain-table")
            .map_err(FsError::Device)?;
        let raw = u32::from_le_bytes(
            table.contents[offset..offset + 4]
                .try_into()
                .expect("Infallible"),
        );
        Ok(Entry(raw))
    }

    /// Write the chain-table entry for `block`.
    pub(crate) fn set_chain_entry(
        &mut self,
        block: BlockIdx,
        entry: Entry,
    ) -> Result<(), FsError<BD::Error>> {
        if block.0 >= self.sb.total_blocks.0 {
            return Err(FsError::Corrupt);
        }
        let (table_block, offset) = self.table_location(block);
        let mut table = self
            .block_device
            .read_block(table_block, "chain-table")
            .map_err(FsError::Device)?;
        table.contents[offset..offset + 4].copy_from_slice(&entry.0.to_le_bytes());
        self.block_device
            .write_block(&table, table_block)
            .map_err(FsError::Device)
    }

    /// The block following `block` in its chain, or `None` at the end.
    ///
    /// A live chain running into a free or reserved entry means the table
    /// is inconsistent.
    pub(crate) fn next_in_chain(
        &mut self,
        block: BlockIdx,
    ) -> Result<Option<BlockIdx>, FsError<BD::Error>> {
        let entry = self.chain_entry(block)?;
        if entry.is_end() {
            Ok(None)
        } else {
            match entry.next() {
                Some(next) => Ok(Some(next)),
                None => Err(FsError::Corrupt),
            }
        }
    }

    /// Claim a free block and mark it as the end of a chain.
    ///
    /// The block's previous contents are left as-is; callers that need a
    /// blank block use [`Volume::allocate_zeroed_block`].
    pub(crate) fn allocate_block(&mut self) -> Result<BlockIdx, FsError<BD::Error>> {
        let per_block = SuperBlock::TABLE_ENTRIES_PER_BLOCK;
        for table_block in self.sb.table_start.range(self.sb.table_blocks) {
            let mut table = self
                .block_device
                .read_block(table_block, "chain-table")
                .map_err(FsError::Device)?;
            let base = (table_block.0 - self.sb.table_start.0) * per_block;
            for slot in 0..per_block {
                let idx = base + slot;
                if idx >= self.sb.total_blocks.0 {
                    break;
                }
                let offset = slot as usize * 4;
                let raw = u32::from_le_bytes(
                    table.contents[offset..offset + 4]
                        .try_into()
                        .expect("Infallible"),
                );
                if Entry(raw).is_free() {
                    table.contents[offset..offset + 4]
                        .copy_from_slice(&Entry::END.0.to_le_bytes());
                    self.block_device
                        .write_block(&table, table_block)
                        .map_err(FsError::Device)?;
                    return Ok(BlockIdx(idx));
                }
            }
        }
        Err(FsError::VolumeFull)
    }

    /// Claim a free block, zero it on the device, and mark it as the end of
    /// a chain.
    pub(crate) fn allocate_zeroed_block(&mut self) -> Result<BlockIdx, FsError<BD::Error>> {
        let block = self.allocate_block()?;
        self.block_device
            .write_block(&Block::new(), block)
            .map_err(FsError::Device)?;
        Ok(block)
    }

    /// Release every block of the chain starting at `first`.
    pub(crate) fn free_chain(&mut self, first: BlockIdx) -> Result<(), FsError<BD::Error>> {
        let mut current = Some(first);
        // The bound catches cycles in a damaged table.
        let mut remaining = self.sb.total_blocks.0;
        while let Some(block) = current {
            if remaining == 0 {
                return Err(FsError::Corrupt);
            }
            remaining -= 1;
            current = self.next_in_chain(block)?;
            self.set_chain_entry(block, Entry::FREE)?;
        }
        Ok(())
    }

    /// Walk the chain starting at `first` to its last block.
    pub(crate) fn chain_tail(&mut self, first: BlockIdx) -> Result<BlockIdx, FsError<BD::Error>> {
        let mut current = first;
        let mut remaining = self.sb.total_blocks.0;
        while let Some(next) = self.next_in_chain(current)? {
            if remaining == 0 {
                return Err(FsError::Corrupt);
            }
            remaining -= 1;
            current = next;
        }
        Ok(current)
    }

    /// Count the unallocated blocks on the volume.
    pub fn free_blocks(&mut self) -> Result<BlockCount, FsError<BD::Error>> {
        let per_block = SuperBlock::TABLE_ENTRIES_PER_BLOCK;
        let mut free = 0;
        for table_block in self.sb.table_start.range(self.sb.table_blocks) {
            let table = self
                .block_device
                .read_block(table_block, "chain-table")
                .map_err(FsError::Device)?;
            let base = (table_block.0 - self.sb.table_start.0) * per_block;
            for slot in 0..per_block {
                if base + slot >= self.sb.total_blocks.0 {
                    break;
                }
                let offset = slot as usize * 4;
                let raw = u32::from_le_bytes(
                    table.contents[offset..offset + 4]
                        .try_into()
                        .expect("Infallible"),
                );
                if Entry(raw).is_free() {
                    free += 1;
                }
            }
        }
        Ok(BlockCount(free))
    }
}
