//! Directory entries and directory scanning.
//!
//! A directory is a chain of blocks holding 32-byte entries. A first name
//! byte of 0x00 marks the end of the directory; 0xE5 marks a deleted entry
//! whose slot can be reused.

use crate::{Block, BlockDevice, BlockIdx};

use super::layout::{Attributes, DirEntryRaw, DIR_ENTRIES_PER_BLOCK, DIR_ENTRY_LEN, NAME_LEN};
use super::{FsError, Volume};

/// The slot a directory entry occupies on the volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct EntryLoc {
    pub block: BlockIdx,
    pub index: usize,
}

/// A read-only view of one directory entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirEntry {
    name: [u8; NAME_LEN],
    attributes: Attributes,
    size: u32,
    first_block: u32,
}

impl DirEntry {
    pub(crate) fn from_raw(raw: &DirEntryRaw) -> Self {
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(raw.name());
        Self {
            name,
            attributes: Attributes::from_bits_truncate(raw.attr()),
            size: raw.file_size(),
            first_block: raw.first_block(),
        }
    }

    pub(crate) fn new_file(name: &str) -> Self {
        Self::new(name, Attributes::empty(), 0)
    }

    pub(crate) fn new_dir(name: &str, first_block: BlockIdx) -> Self {
        Self::new(name, Attributes::DIRECTORY, first_block.0)
    }

    fn new(name: &str, attributes: Attributes, first_block: u32) -> Self {
        let mut padded = [0u8; NAME_LEN];
        padded[..name.len()].copy_from_slice(name.as_bytes());
        Self {
            name: padded,
            attributes,
            size: 0,
            first_block,
        }
    }

    /// The entry's name.
    pub fn name(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(NAME_LEN);
        core::str::from_utf8(&self.name[..end]).unwrap_or("<invalid>")
    }

    pub(crate) fn name_matches(&self, name: &str) -> bool {
        self.name() == name
    }

    /// Is this entry a directory?
    pub fn is_dir(&self) -> bool {
        self.attributes.contains(Attributes::DIRECTORY)
    }

    /// The file size in bytes. Always zero for directories.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub(crate) fn first_block(&self) -> Option<BlockIdx> {
        if self.first_block == 0 {
            None
        } else {
            Some(BlockIdx(self.first_block))
        }
    }

    fn store(&self, raw: &mut DirEntryRaw) {
        let end = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(NAME_LEN);
        raw.set_name(&self.name[..end]);
        raw.set_attr(self.attributes.bits());
        raw.set_file_size(self.size);
        raw.set_first_block(self.first_block);
    }
}

/// Walks the entries of one directory, one `dir_next` call at a time.
#[derive(Debug)]
pub(crate) struct DirCursor {
    current: Option<BlockIdx>,
    entry_index: usize,
    buffered: Option<(BlockIdx, Block)>,
}

impl DirCursor {
    pub(crate) fn new(dir_first: BlockIdx) -> Self {
        Self {
            current: Some(dir_first),
            entry_index: 0,
            buffered: None,
        }
    }
}

impl<BD> Volume<BD>
where
    BD: BlockDevice,
{
    /// Produce the next live entry of the directory, or `None` once the end
    /// marker or the end of the chain is reached.
    pub(crate) fn dir_next(
        &mut self,
        cursor: &mut DirCursor,
    ) -> Result<Option<(EntryLoc, DirEntry)>, FsError<BD::Error>> {
        loop {
            let block_idx = match cursor.current {
                Some(b) => b,
                None => return Ok(None),
            };

            if cursor.entry_index >= DIR_ENTRIES_PER_BLOCK {
                cursor.current = self.next_in_chain(block_idx)?;
                cursor.entry_index = 0;
                cursor.buffered = None;
                continue;
            }

            let needs_read = match &cursor.buffered {
                Some((idx, _)) => *idx != block_idx,
                None => true,
            };
            if needs_read {
                let block = self
                    .block_device
                    .read_block(block_idx, "dir")
                    .map_err(FsError::Device)?;
                cursor.buffered = Some((block_idx, block));
            }

            let (_, block) = match &mut cursor.buffered {
                Some(buffered) => buffered,
                None => return Err(FsError::Corrupt),
            };

            let offset = cursor.entry_index * DIR_ENTRY_LEN;
            let raw = DirEntryRaw::new(&mut block.contents[offset..offset + DIR_ENTRY_LEN]);
            let loc = EntryLoc {
                block: block_idx,
                index: cursor.entry_index,
            };
            cursor.entry_index += 1;

            if raw.is_end() {
                cursor.current = None;
                return Ok(None);
            }
            if raw.is_free_slot() {
                continue;
            }
            return Ok(Some((loc, DirEntry::from_raw(&raw))));
        }
    }

    /// Find the entry called `name` in the directory starting at `dir_first`.
    pub(crate) fn find_in_dir(
        &mut self,
        dir_first: BlockIdx,
        name: &str,
    ) -> Result<Option<(EntryLoc, DirEntry)>, FsError<BD::Error>> {
        let mut cursor = DirCursor::new(dir_first);
        while let Some((loc, entry)) = self.dir_next(&mut cursor)? {
            if entry.name_matches(name) {
                return Ok(Some((loc, entry)));
            }
        }
        Ok(None)
    }

    /// Does the directory starting at `dir_first` contain no live entries?
    pub(crate) fn dir_is_empty(&mut self, dir_first: BlockIdx) -> Result<bool, FsError<BD::Error>> {
        let mut cursor = DirCursor::new(dir_first);
        Ok(self.dir_next(&mut cursor)?.is_none())
    }

    /// Find a slot for a new entry in the directory starting at `dir_first`,
    /// extending the directory chain by one zeroed block when it is full.
    pub(crate) fn find_free_slot(
        &mut self,
        dir_first: BlockIdx,
    ) -> Result<EntryLoc, FsError<BD::Error>> {
        let mut block_idx = dir_first;
        loop {
            let mut block = self
                .block_device
                .read_block(block_idx, "dir")
                .map_err(FsError::Device)?;
            for index in 0..DIR_ENTRIES_PER_BLOCK {
                let offset = index * DIR_ENTRY_LEN;
                let raw = DirEntryRaw::new(&mut block.contents[offset..offset + DIR_ENTRY_LEN]);
                if raw.is_end() || raw.is_free_slot() {
                    return Ok(EntryLoc {
                        block: block_idx,
                        index,
                    });
                }
            }
            match self.next_in_chain(block_idx)? {
                Some(next) => block_idx = next,
                None => {
                    let new_block = self.allocate_zeroed_block()?;
                    self.set_chain_entry(block_idx, super::alloc::Entry(new_block.0))?;
                    return Ok(EntryLoc {
                        block: new_block,
                        index: 0,
                    });
                }
            }
        }
    }

    /// Store `entry` at `loc`.
    pub(crate) fn write_dir_entry(
        &mut self,
        loc: EntryLoc,
        entry: &DirEntry,
    ) -> Result<(), FsError<BD::Error>> {
        self.update_raw_entry(loc, |raw| entry.store(raw))
    }

    /// Update the size and first-block fields of the entry at `loc`.
    pub(crate) fn patch_dir_entry(
        &mut self,
        loc: EntryLoc,
        size: u32,
        first_block: u32,
    ) -> Result<(), FsError<BD::Error>> {
        self.update_raw_entry(loc, |raw| {
            raw.set_file_size(size);
            raw.set_first_block(first_block);
        })
    }

    /// Mark the entry at `loc` as deleted, freeing the slot for reuse.
    pub(crate) fn mark_entry_deleted(&mut self, loc: EntryLoc) -> Result<(), FsError<BD::Error>> {
        self.update_raw_entry(loc, |raw| {
            let mut name = [0u8; NAME_LEN];
            name[0] = super::layout::ENTRY_FREE;
            raw.set_name(&name[..1]);
        })
    }

    fn update_raw_entry<F>(&mut self, loc: EntryLoc, f: F) -> Result<(), FsError<BD::Error>>
    where
        F: FnOnce(&mut DirEntryRaw),
    {
        let mut block = self
            .block_device
            .read_block(loc.block, "dir")
            .map_err(FsError::Device)?;
        let offset = loc.index * DIR_ENTRY_LEN;
        let mut raw = DirEntryRaw::new(&mut block.contents[offset..offset + DIR_ENTRY_LEN]);
        f(&mut raw);
        self.block_device
            .write_block(&block, loc.block)
            .map_err(FsError::Device)
    }
}

/// Iterates over the live entries of one directory.
pub struct DirIter<'a, BD>
where
    BD: BlockDevice,
{
    volume: &'a mut Volume<BD>,
    cursor: DirCursor,
}

impl<'a, BD> DirIter<'a, BD>
where
    BD: BlockDevice,
{
    pub(crate) fn new(volume: &'a mut Volume<BD>, dir_first: BlockIdx) -> Self {
        Self {
            volume,
            cursor: DirCursor::new(dir_first),
        }
    }
}

impl<'a, BD> Iterator for DirIter<'a, BD>
where
    BD: BlockDevice,
{
    type Item = DirEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.volume
            .dir_next(&mut self.cursor)
            .ok()?
            .map(|(_, entry)| entry)
    }
}
