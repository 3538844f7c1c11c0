//! Open files and the per-handle read/write machinery.

use crate::{Block, BlockDevice, BlockIdx};

use super::alloc::Entry;
use super::dir::EntryLoc;
use super::{FsError, Volume};

/// What a file handle may be used for.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpenMode {
    /// Sequential reads from the start of the file.
    Read,
    /// The file was created or truncated; writes go from offset zero.
    Write,
    /// Writes go after the existing contents.
    Append,
}

/// A handle to an open file.
///
/// Handles are not `Copy`: closing consumes the handle, so a closed file
/// cannot be used again by accident.
#[derive(Debug)]
pub struct FileHandle {
    id: u32,
}

impl FileHandle {
    pub(crate) fn new(id: u32) -> Self {
        Self { id }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }
}

/// Book-keeping for one open file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpenFile {
    pub id: u32,
    pub mode: OpenMode,
    /// Where the directory entry lives, for the close-time update.
    pub entry_loc: EntryLoc,
    /// First data block, 0 while the file has none.
    pub first_block: u32,
    /// Last data block, 0 while the file has none. Only maintained for
    /// writable handles.
    pub tail_block: u32,
    pub size: u32,
    /// Read position.
    pub pos: u32,
    /// Block containing `cursor_base`, 0 before the first read.
    pub cursor_block: u32,
    /// File offset at which `cursor_block` starts.
    pub cursor_base: u32,
    /// Set when size or first block changed and the directory entry needs
    /// updating on close.
    pub dirty: bool,
}

impl OpenFile {
    pub(crate) fn new(
        id: u32,
        mode: OpenMode,
        entry_loc: EntryLoc,
        first_block: u32,
        tail_block: u32,
        size: u32,
    ) -> Self {
        Self {
            id,
            mode,
            entry_loc,
            first_block,
            tail_block,
            size,
            pos: 0,
            cursor_block: 0,
            cursor_base: 0,
            dirty: false,
        }
    }
}

impl<BD> Volume<BD>
where
    BD: BlockDevice,
{
    /// Read from an open file at its current position. Returns the number
    /// of bytes read, which is short only at end of file.
    pub fn read(
        &mut self,
        handle: &FileHandle,
        buffer: &mut [u8],
    ) -> Result<usize, FsError<BD::Error>> {
        let slot = self.slot_of(handle)?;
        let mut file = match self.open_files[slot] {
            Some(file) => file,
            None => return Err(FsError::BadHandle),
        };
        if file.mode != OpenMode::Read {
            return Err(FsError::BadHandle);
        }

        let result = self.read_at_cursor(&mut file, buffer);
        self.open_files[slot] = Some(file);
        result
    }

    /// Append `data` to an open writable file.
    pub fn write(&mut self, handle: &FileHandle, data: &[u8]) -> Result<(), FsError<BD::Error>> {
        let slot = self.slot_of(handle)?;
        let mut file = match self.open_files[slot] {
            Some(file) => file,
            None => return Err(FsError::BadHandle),
        };
        if file.mode == OpenMode::Read {
            return Err(FsError::BadHandle);
        }

        let result = self.append_bytes(&mut file, data);
        // Stored back even on error so `close` records the bytes that did
        // make it out.
        self.open_files[slot] = Some(file);
        result
    }

    /// Close an open file, updating its directory entry if needed.
    pub fn close(&mut self, handle: FileHandle) -> Result<(), FsError<BD::Error>> {
        let slot = self.slot_of(&handle)?;
        let file = match self.open_files[slot].take() {
            Some(file) => file,
            None => return Err(FsError::BadHandle),
        };
        if file.dirty {
            self.patch_dir_entry(file.entry_loc, file.size, file.first_block)?;
        }
        Ok(())
    }

    fn slot_of(&self, handle: &FileHandle) -> Result<usize, FsError<BD::Error>> {
        self.open_files
            .iter()
            .position(|slot| match slot {
                Some(file) => file.id == handle.id(),
                None => false,
            })
            .ok_or(FsError::BadHandle)
    }

    fn read_at_cursor(
        &mut self,
        file: &mut OpenFile,
        buffer: &mut [u8],
    ) -> Result<usize, FsError<BD::Error>> {
        let mut read_total = 0;

        while read_total < buffer.len() && file.pos < file.size {
            if file.cursor_block == 0 {
                match file.first_block {
                    0 => break,
                    first => {
                        file.cursor_block = first;
                        file.cursor_base = 0;
                    }
                }
            }

            // Advance the cursor until it covers the read position.
            while file.pos >= file.cursor_base + Block::LEN_U32 {
                let next = self
                    .next_in_chain(BlockIdx(file.cursor_block))?
                    .ok_or(FsError::Corrupt)?;
                file.cursor_block = next.0;
                file.cursor_base += Block::LEN_U32;
            }

            let block = self
                .block_device
                .read_block(BlockIdx(file.cursor_block), "file-data")
                .map_err(FsError::Device)?;

            let offset = (file.pos - file.cursor_base) as usize;
            let wanted = buffer.len() - read_total;
            let in_block = Block::LEN - offset;
            let in_file = (file.size - file.pos) as usize;
            let n = wanted.min(in_block).min(in_file);

            buffer[read_total..read_total + n]
                .copy_from_slice(&block.contents[offset..offset + n]);
            file.pos += n as u32;
            read_total += n;
        }

        Ok(read_total)
    }

    fn append_bytes(
        &mut self,
        file: &mut OpenFile,
        data: &[u8],
    ) -> Result<(), FsError<BD::Error>> {
        let mut data = data;

        while !data.is_empty() {
            let tail_offset = (file.size as usize) % Block::LEN;

            if tail_offset != 0 {
                // Fill up the partial tail block first.
                let tail = BlockIdx(file.tail_block);
                let mut block = self
                    .block_device
                    .read_block(tail, "file-data")
                    .map_err(FsError::Device)?;
                let n = data.len().min(Block::LEN - tail_offset);
                block.contents[tail_offset..tail_offset + n].copy_from_slice(&data[..n]);
                self.block_device
                    .write_block(&block, tail)
                    .map_err(FsError::Device)?;
                file.size += n as u32;
                data = &data[n..];
            } else {
                let new_block = self.allocate_block()?;
                if file.tail_block == 0 {
                    file.first_block = new_block.0;
                } else {
                    self.set_chain_entry(BlockIdx(file.tail_block), Entry(new_block.0))?;
                }
                file.tail_block = new_block.0;

                let mut block = Block::new();
                let n = data.len().min(Block::LEN);
                block.contents[..n].copy_from_slice(&data[..n]);
                self.block_device
                    .write_block(&block, new_block)
                    .map_err(FsError::Device)?;
                file.size += n as u32;
                data = &data[n..];
            }
            file.dirty = true;
        }

        Ok(())
    }
}
