//! cardfs - the filesystem front-end.
//!
//! A compact FAT-style volume: block 0 is the superblock, followed by a
//! chain table (one `u32` per block) and chained directories of fixed
//! 32-byte entries. Files and directories are block chains; there is no
//! caching, every operation is write-through to the block device.

use crate::{Block, BlockCount, BlockDevice, BlockIdx};

#[cfg(feature = "log")]
use log::{debug, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};

pub mod alloc;
pub mod dir;
pub mod file;
pub mod layout;
pub mod path;

use alloc::Entry;
use dir::{DirEntry, DirIter, EntryLoc};
use file::{FileHandle, OpenFile, OpenMode};
use layout::{SuperBlock, SuperBlockError};

/// Hard upper bound on simultaneously open files; the configured limit can
/// only lower it.
pub const MAX_OPEN_FILES: usize = 10;

/// The errors the filesystem can produce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FsError<E> {
    /// The underlying block device reported an error.
    Device(E),
    /// The superblock was rejected at mount.
    Superblock(SuperBlockError),
    /// The volume's metadata is inconsistent (broken chain, cycle, or size
    /// mismatch).
    Corrupt,
    /// The device has too few blocks to hold a volume.
    TooSmall,
    /// The path is not a valid absolute path for the requested operation.
    PathInvalid,
    /// No entry with this name exists.
    NotFound,
    /// An entry with this name already exists.
    AlreadyExists,
    /// The directory still contains entries.
    NotEmpty,
    /// The entry is a directory where a file was required.
    NotAFile,
    /// The entry is a file where a directory was required.
    NotADirectory,
    /// The file already has a live handle.
    FileOpen,
    /// The open-file limit was reached.
    TooManyOpenFiles,
    /// No free blocks are left on the volume.
    VolumeFull,
    /// The handle is unknown, closed, or used against its mode.
    BadHandle,
}

impl<E> From<SuperBlockError> for FsError<E> {
    fn from(e: SuperBlockError) -> Self {
        Self::Superblock(e)
    }
}

/// A mounted cardfs volume on a block device.
pub struct Volume<BD>
where
    BD: BlockDevice,
{
    pub(crate) block_device: BD,
    pub(crate) sb: SuperBlock,
    max_open_files: usize,
    next_handle_id: u32,
    open_files: [Option<OpenFile>; MAX_OPEN_FILES],
}

impl<BD> core::fmt::Debug for Volume<BD>
where
    BD: BlockDevice,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Volume").field("sb", &self.sb).finish()
    }
}

impl<BD> Volume<BD>
where
    BD: BlockDevice,
{
    /// Write a blank volume to the device. Everything on it is lost.
    ///
    /// Mounting never formats implicitly; this is an explicit provisioning
    /// step.
    pub fn format(block_device: &mut BD) -> Result<(), FsError<BD::Error>> {
        let total = block_device.num_blocks().map_err(FsError::Device)?;
        let per_block = SuperBlock::TABLE_ENTRIES_PER_BLOCK;
        let table_start = BlockIdx(1);
        let table_blocks = BlockCount((total.0 + per_block - 1) / per_block);
        let root_block = table_start + table_blocks;

        // Superblock, table, root, and at least one data block.
        if total.0 <= root_block.0 + 1 {
            return Err(FsError::TooSmall);
        }

        for (i, table_block) in table_start.range(table_blocks).enumerate() {
            let mut block = Block::new();
            for slot in 0..per_block {
                let idx = i as u32 * per_block + slot;
                let entry = if idx >= total.0 || idx < root_block.0 {
                    // Off-device entries and the metadata region are never
                    // handed out.
                    Entry::RESERVED
                } else if idx == root_block.0 {
                    Entry::END
                } else {
                    Entry::FREE
                };
                let offset = slot as usize * 4;
                block.contents[offset..offset + 4].copy_from_slice(&entry.0.to_le_bytes());
            }
            block_device
                .write_block(&block, table_block)
                .map_err(FsError::Device)?;
        }

        // Zeroed root directory: every entry is an end marker.
        block_device
            .write_block(&Block::new(), root_block)
            .map_err(FsError::Device)?;

        // The superblock goes last so a torn format stays unmountable.
        let sb = SuperBlock {
            total_blocks: total,
            table_start,
            table_blocks,
            root_block,
        };
        block_device
            .write_block(&sb.to_block(), BlockIdx(0))
            .map_err(FsError::Device)?;

        debug!("formatted volume: {} blocks", total.0);
        Ok(())
    }

    /// Mount the volume found on `block_device`.
    ///
    /// On failure the device is handed back so the caller can retry or
    /// format.
    pub fn mount(
        mut block_device: BD,
        max_open_files: usize,
    ) -> Result<Self, (FsError<BD::Error>, BD)> {
        let block = match block_device.read_block(BlockIdx(0), "superblock") {
            Ok(block) => block,
            Err(e) => return Err((FsError::Device(e), block_device)),
        };
        let sb = match SuperBlock::parse(block) {
            Ok(sb) => sb,
            Err(e) => {
                warn!("superblock rejected: {:?}", e);
                return Err((FsError::Superblock(e), block_device));
            }
        };
        let device_blocks = match block_device.num_blocks() {
            Ok(count) => count,
            Err(e) => return Err((FsError::Device(e), block_device)),
        };
        if sb.total_blocks > device_blocks {
            return Err((
                FsError::Superblock(SuperBlockError::BadLayout),
                block_device,
            ));
        }

        Ok(Self {
            block_device,
            sb,
            max_open_files: max_open_files.max(1).min(MAX_OPEN_FILES),
            next_handle_id: 0,
            open_files: [None; MAX_OPEN_FILES],
        })
    }

    /// Unmount, handing the block device back.
    pub fn release(self) -> BD {
        self.block_device
    }

    /// The block device the volume lives on.
    pub fn block_device(&self) -> &BD {
        &self.block_device
    }

    /// Number of blocks the volume spans.
    pub fn total_blocks(&self) -> BlockCount {
        self.sb.total_blocks
    }

    // ------------------------------------------------------------------
    // Path resolution
    // ------------------------------------------------------------------

    fn resolve_dir(&mut self, dir_path: &str) -> Result<BlockIdx, FsError<BD::Error>> {
        let components = path::components(dir_path).map_err(|_| FsError::PathInvalid)?;
        let mut current = self.sb.root_block;
        for component in components {
            match self.find_in_dir(current, component)? {
                Some((_, entry)) if entry.is_dir() => {
                    current = entry.first_block().ok_or(FsError::Corrupt)?;
                }
                Some(_) => return Err(FsError::NotADirectory),
                None => return Err(FsError::NotFound),
            }
        }
        Ok(current)
    }

    fn resolve_parent<'p>(
        &mut self,
        file_path: &'p str,
    ) -> Result<(BlockIdx, &'p str), FsError<BD::Error>> {
        let (parent, name) =
            path::split_parent(file_path).map_err(|_| FsError::PathInvalid)?;
        let dir = self.resolve_dir(parent)?;
        Ok((dir, name))
    }

    /// Write-style operations want a missing or non-directory parent
    /// reported as an invalid path.
    fn parent_as_path_invalid(e: FsError<BD::Error>) -> FsError<BD::Error> {
        match e {
            FsError::NotFound | FsError::NotADirectory => FsError::PathInvalid,
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // Open files
    // ------------------------------------------------------------------

    fn claim_slot(&mut self, entry_loc: EntryLoc) -> Result<(usize, u32), FsError<BD::Error>> {
        let already_open = self
            .open_files
            .iter()
            .flatten()
            .any(|file| file.entry_loc == entry_loc);
        if already_open {
            return Err(FsError::FileOpen);
        }
        let live = self.open_files.iter().flatten().count();
        if live >= self.max_open_files {
            return Err(FsError::TooManyOpenFiles);
        }
        let slot = self
            .open_files
            .iter()
            .position(Option::is_none)
            .ok_or(FsError::TooManyOpenFiles)?;
        self.next_handle_id = self.next_handle_id.wrapping_add(1);
        Ok((slot, self.next_handle_id))
    }

    /// Open an existing file for sequential reads.
    pub fn open_for_read(&mut self, file_path: &str) -> Result<FileHandle, FsError<BD::Error>> {
        let (dir, name) = self.resolve_parent(file_path)?;
        let (loc, entry) = self.find_in_dir(dir, name)?.ok_or(FsError::NotFound)?;
        if entry.is_dir() {
            return Err(FsError::NotAFile);
        }
        let (slot, id) = self.claim_slot(loc)?;
        self.open_files[slot] = Some(OpenFile::new(
            id,
            OpenMode::Read,
            loc,
            entry.first_block().map(|b| b.0).unwrap_or(0),
            0,
            entry.size(),
        ));
        Ok(FileHandle::new(id))
    }

    /// Open a file for writing, creating it or truncating existing content.
    pub fn open_for_write(&mut self, file_path: &str) -> Result<FileHandle, FsError<BD::Error>> {
        let (dir, name) = self
            .resolve_parent(file_path)
            .map_err(Self::parent_as_path_invalid)?;
        match self.find_in_dir(dir, name)? {
            Some((loc, entry)) => {
                if entry.is_dir() {
                    return Err(FsError::PathInvalid);
                }
                let (slot, id) = self.claim_slot(loc)?;
                if let Some(first) = entry.first_block() {
                    self.free_chain(first)?;
                }
                self.patch_dir_entry(loc, 0, 0)?;
                self.open_files[slot] = Some(OpenFile::new(id, OpenMode::Write, loc, 0, 0, 0));
                Ok(FileHandle::new(id))
            }
            None => self.create_and_open(dir, name, OpenMode::Write),
        }
    }

    /// Open a file for appending, creating it if absent.
    pub fn open_for_append(&mut self, file_path: &str) -> Result<FileHandle, FsError<BD::Error>> {
        let (dir, name) = self
            .resolve_parent(file_path)
            .map_err(Self::parent_as_path_invalid)?;
        match self.find_in_dir(dir, name)? {
            Some((loc, entry)) => {
                if entry.is_dir() {
                    return Err(FsError::PathInvalid);
                }
                let (slot, id) = self.claim_slot(loc)?;
                let (first, tail) = match entry.first_block() {
                    Some(first) => (first.0, self.chain_tail(first)?.0),
                    None if entry.size() == 0 => (0, 0),
                    None => return Err(FsError::Corrupt),
                };
                self.open_files[slot] = Some(OpenFile::new(
                    id,
                    OpenMode::Append,
                    loc,
                    first,
                    tail,
                    entry.size(),
                ));
                Ok(FileHandle::new(id))
            }
            None => self.create_and_open(dir, name, OpenMode::Append),
        }
    }

    fn create_and_open(
        &mut self,
        dir: BlockIdx,
        name: &str,
        mode: OpenMode,
    ) -> Result<FileHandle, FsError<BD::Error>> {
        // Check the handle limit before touching the directory, so a failed
        // open does not leave an empty file behind.
        if self.open_files.iter().flatten().count() >= self.max_open_files {
            return Err(FsError::TooManyOpenFiles);
        }
        let loc = self.find_free_slot(dir)?;
        self.write_dir_entry(loc, &DirEntry::new_file(name))?;
        let (slot, id) = self.claim_slot(loc)?;
        self.open_files[slot] = Some(OpenFile::new(id, mode, loc, 0, 0, 0));
        Ok(FileHandle::new(id))
    }

    // ------------------------------------------------------------------
    // One-shot operations
    // ------------------------------------------------------------------

    /// Create or truncate the file at `file_path` and store `data` in it.
    pub fn write_file(&mut self, file_path: &str, data: &[u8]) -> Result<(), FsError<BD::Error>> {
        let handle = self.open_for_write(file_path)?;
        let result = self.write(&handle, data);
        let closed = self.close(handle);
        result.and(closed)
    }

    /// Append `data` to the file at `file_path`, creating it if absent.
    pub fn append_file(&mut self, file_path: &str, data: &[u8]) -> Result<(), FsError<BD::Error>> {
        let handle = self.open_for_append(file_path)?;
        let result = self.write(&handle, data);
        let closed = self.close(handle);
        result.and(closed)
    }

    /// Read the file at `file_path` from the start into `buffer`. Returns
    /// the number of bytes read; content past `buffer.len()` is left on the
    /// volume.
    pub fn read_file(
        &mut self,
        file_path: &str,
        buffer: &mut [u8],
    ) -> Result<usize, FsError<BD::Error>> {
        let handle = self.open_for_read(file_path)?;
        let result = self.read(&handle, buffer);
        let closed = self.close(handle);
        let read = result?;
        closed?;
        Ok(read)
    }

    /// Delete the file at `file_path` and release its blocks.
    pub fn delete_file(&mut self, file_path: &str) -> Result<(), FsError<BD::Error>> {
        let (dir, name) = self.resolve_parent(file_path)?;
        let (loc, entry) = self.find_in_dir(dir, name)?.ok_or(FsError::NotFound)?;
        if entry.is_dir() {
            return Err(FsError::NotAFile);
        }
        let already_open = self
            .open_files
            .iter()
            .flatten()
            .any(|file| file.entry_loc == loc);
        if already_open {
            return Err(FsError::FileOpen);
        }
        if let Some(first) = entry.first_block() {
            self.free_chain(first)?;
        }
        self.mark_entry_deleted(loc)
    }

    /// Create the directory at `dir_path`. The parent has to exist.
    pub fn create_dir(&mut self, dir_path: &str) -> Result<(), FsError<BD::Error>> {
        let (dir, name) = self
            .resolve_parent(dir_path)
            .map_err(Self::parent_as_path_invalid)?;
        if self.find_in_dir(dir, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let loc = self.find_free_slot(dir)?;
        let first_block = self.allocate_zeroed_block()?;
        self.write_dir_entry(loc, &DirEntry::new_dir(name, first_block))
    }

    /// Remove the empty directory at `dir_path`.
    pub fn remove_dir(&mut self, dir_path: &str) -> Result<(), FsError<BD::Error>> {
        let (dir, name) = self.resolve_parent(dir_path)?;
        let (loc, entry) = self.find_in_dir(dir, name)?.ok_or(FsError::NotFound)?;
        if !entry.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let first = entry.first_block().ok_or(FsError::Corrupt)?;
        if !self.dir_is_empty(first)? {
            return Err(FsError::NotEmpty);
        }
        self.free_chain(first)?;
        self.mark_entry_deleted(loc)
    }

    /// Iterate the entries of the directory at `dir_path`.
    pub fn dir_iter(&mut self, dir_path: &str) -> Result<DirIter<'_, BD>, FsError<BD::Error>> {
        let dir = self.resolve_dir(dir_path)?;
        Ok(DirIter::new(self, dir))
    }

    /// The size in bytes of the file at `file_path`.
    pub fn file_size(&mut self, file_path: &str) -> Result<u32, FsError<BD::Error>> {
        let (dir, name) = self.resolve_parent(file_path)?;
        let (_, entry) = self.find_in_dir(dir, name)?.ok_or(FsError::NotFound)?;
        if entry.is_dir() {
            return Err(FsError::NotAFile);
        }
        Ok(entry.size())
    }

    /// Does `file_path` name an existing entry?
    pub fn exists(&mut self, file_path: &str) -> Result<bool, FsError<BD::Error>> {
        match self.resolve_parent(file_path) {
            Ok((dir, name)) => Ok(self.find_in_dir(dir, name)?.is_some()),
            // The bare root always exists.
            Err(FsError::PathInvalid) if file_path == "/" => Ok(true),
            Err(e) => Err(e),
        }
    }
}
