//! Filesystem behavior through the public API, on a RAM-backed device.

use sd_spi_card::fs::{FsError, Volume, MAX_OPEN_FILES};
use sd_spi_card::{Block, BlockCount, MemoryBlockDevice};

const DEVICE_BLOCKS: usize = 1024;

fn fresh_image() -> Vec<u8> {
    let mut image = vec![0u8; DEVICE_BLOCKS * Block::LEN];
    let mut device = MemoryBlockDevice::new(&mut image);
    Volume::format(&mut device).unwrap();
    image
}

fn mounted(image: &mut [u8]) -> Volume<MemoryBlockDevice<'_>> {
    Volume::mount(MemoryBlockDevice::new(image), 5).map_err(|(e, _)| e).unwrap()
}

#[test]
fn mount_requires_format() {
    let mut image = vec![0u8; DEVICE_BLOCKS * Block::LEN];
    assert!(matches!(
        Volume::mount(MemoryBlockDevice::new(&mut image), 5),
        Err((FsError::Superblock(_), _))
    ));

    let mut image = fresh_image();
    let volume = mounted(&mut image);
    assert_eq!(volume.total_blocks(), BlockCount(DEVICE_BLOCKS as u32));
}

#[test]
fn format_needs_room() {
    // 3 blocks cannot hold superblock, table, root and a data block.
    let mut image = vec![0u8; 3 * Block::LEN];
    let mut device = MemoryBlockDevice::new(&mut image);
    assert_eq!(Volume::format(&mut device), Err(FsError::TooSmall));
}

#[test]
fn write_read_round_trip_sizes() {
    let mut image = fresh_image();
    let mut volume = mounted(&mut image);

    // Empty, single byte, and a couple of blocks plus a remainder.
    let cases: &[Vec<u8>] = &[
        vec![],
        vec![0x42],
        (0..2 * Block::LEN + 37).map(|i| (i % 253) as u8).collect(),
    ];

    for (i, data) in cases.iter().enumerate() {
        let path = format!("/case-{}", i);
        volume.write_file(&path, data).unwrap();
        assert_eq!(volume.file_size(&path), Ok(data.len() as u32));

        let mut buffer = vec![0u8; data.len() + 16];
        let n = volume.read_file(&path, &mut buffer).unwrap();
        assert_eq!(&buffer[..n], &data[..]);
    }
}

#[test]
fn write_truncates_previous_content() {
    let mut image = fresh_image();
    let mut volume = mounted(&mut image);

    let long = vec![0xAB; 3 * Block::LEN];
    volume.write_file("/f", &long).unwrap();
    volume.write_file("/f", b"short").unwrap();

    let mut buffer = [0u8; 64];
    let n = volume.read_file("/f", &mut buffer).unwrap();
    assert_eq!(&buffer[..n], b"short");

    // The long file's blocks went back to the free pool.
    let free_after = volume.free_blocks().unwrap();
    volume.delete_file("/f").unwrap();
    assert_eq!(volume.free_blocks().unwrap(), free_after + BlockCount(1));
}

#[test]
fn append_concatenates() {
    let mut image = fresh_image();
    let mut volume = mounted(&mut image);

    // Also exercises appending into a partial tail block and across a
    // block boundary.
    let first = vec![0x11; 300];
    let second = vec![0x22; 300];
    volume.append_file("/log", &first).unwrap();
    volume.append_file("/log", &second).unwrap();

    let mut buffer = vec![0u8; 1024];
    let n = volume.read_file("/log", &mut buffer).unwrap();
    assert_eq!(n, 600);
    assert_eq!(&buffer[..300], &first[..]);
    assert_eq!(&buffer[300..600], &second[..]);
}

#[test]
fn directories_nest_and_guard_removal() {
    let mut image = fresh_image();
    let mut volume = mounted(&mut image);

    volume.create_dir("/logs").unwrap();
    volume.create_dir("/logs/2024").unwrap();
    assert_eq!(volume.create_dir("/logs"), Err(FsError::AlreadyExists));
    assert_eq!(volume.create_dir("/missing/sub"), Err(FsError::PathInvalid));

    volume.write_file("/logs/2024/jan.csv", b"1,2,3").unwrap();

    assert_eq!(volume.remove_dir("/logs/2024"), Err(FsError::NotEmpty));
    assert_eq!(volume.remove_dir("/logs"), Err(FsError::NotEmpty));

    volume.delete_file("/logs/2024/jan.csv").unwrap();
    volume.remove_dir("/logs/2024").unwrap();
    volume.remove_dir("/logs").unwrap();
    assert_eq!(volume.exists("/logs"), Ok(false));
}

#[test]
fn delete_missing_leaves_state_unchanged() {
    let mut image = fresh_image();
    let mut volume = mounted(&mut image);

    volume.write_file("/keep", b"data").unwrap();
    let free_before = volume.free_blocks().unwrap();

    assert_eq!(volume.delete_file("/nonexistent"), Err(FsError::NotFound));

    assert_eq!(volume.free_blocks().unwrap(), free_before);
    assert_eq!(volume.exists("/keep"), Ok(true));
    let mut buffer = [0u8; 16];
    assert_eq!(volume.read_file("/keep", &mut buffer), Ok(4));
}

#[test]
fn delete_rejects_directories() {
    let mut image = fresh_image();
    let mut volume = mounted(&mut image);

    volume.create_dir("/d").unwrap();
    assert_eq!(volume.delete_file("/d"), Err(FsError::NotAFile));
    assert_eq!(volume.remove_dir("/d"), Ok(()));
}

#[test]
fn paths_are_validated() {
    let mut image = fresh_image();
    let mut volume = mounted(&mut image);

    assert_eq!(volume.write_file("relative", b""), Err(FsError::PathInvalid));
    assert_eq!(volume.write_file("/../escape", b""), Err(FsError::PathInvalid));
    assert_eq!(volume.write_file("/a/../b", b""), Err(FsError::PathInvalid));
    assert_eq!(
        volume.write_file("/far-too-long-a-name-for-one-component", b""),
        Err(FsError::PathInvalid)
    );
    assert_eq!(volume.write_file("/", b""), Err(FsError::PathInvalid));
    // A missing parent is an invalid path for writes.
    assert_eq!(volume.write_file("/no/parent", b""), Err(FsError::PathInvalid));
}

#[test]
fn listing_shows_live_entries() {
    let mut image = fresh_image();
    let mut volume = mounted(&mut image);

    volume.create_dir("/data").unwrap();
    volume.write_file("/data/a.txt", b"aaa").unwrap();
    volume.write_file("/data/b.txt", b"bb").unwrap();
    volume.delete_file("/data/a.txt").unwrap();

    let entries: Vec<(String, bool, u32)> = volume
        .dir_iter("/data")
        .unwrap()
        .map(|e| (e.name().to_string(), e.is_dir(), e.size()))
        .collect();
    assert_eq!(entries, vec![("b.txt".to_string(), false, 2)]);

    let root: Vec<String> = volume
        .dir_iter("/")
        .unwrap()
        .map(|e| e.name().to_string())
        .collect();
    assert_eq!(root, vec!["data".to_string()]);
}

#[test]
fn directory_grows_past_one_block() {
    let mut image = fresh_image();
    let mut volume = mounted(&mut image);

    // One block holds 16 entries; go past that.
    for i in 0..20 {
        volume.write_file(&format!("/file-{:02}", i), b"x").unwrap();
    }
    let count = volume.dir_iter("/").unwrap().count();
    assert_eq!(count, 20);

    // Deleted slots get reused instead of growing the directory again.
    volume.delete_file("/file-00").unwrap();
    volume.write_file("/file-new", b"y").unwrap();
    let count = volume.dir_iter("/").unwrap().count();
    assert_eq!(count, 20);
}

#[test]
fn open_file_bookkeeping() {
    let mut image = fresh_image();
    let mut volume = mounted(&mut image);

    volume.write_file("/f", b"hello").unwrap();

    // Two live handles on one path are refused.
    let handle = volume.open_for_read("/f").unwrap();
    assert_eq!(volume.open_for_read("/f").unwrap_err(), FsError::FileOpen);
    assert_eq!(volume.delete_file("/f").unwrap_err(), FsError::FileOpen);

    // Reading in two chunks keeps the position.
    let mut buffer = [0u8; 3];
    assert_eq!(volume.read(&handle, &mut buffer), Ok(3));
    assert_eq!(&buffer, b"hel");
    assert_eq!(volume.read(&handle, &mut buffer), Ok(2));
    assert_eq!(&buffer[..2], b"lo");
    assert_eq!(volume.read(&handle, &mut buffer), Ok(0));

    // A read handle refuses writes.
    assert_eq!(volume.write(&handle, b"nope"), Err(FsError::BadHandle));

    volume.close(handle).unwrap();
    volume.delete_file("/f").unwrap();
}

#[test]
fn open_file_limit_holds() {
    let mut image = fresh_image();
    let mut device = MemoryBlockDevice::new(&mut image);
    Volume::format(&mut device).unwrap();
    let mut volume = Volume::mount(device, 2).map_err(|(e, _)| e).unwrap();

    let a = volume.open_for_write("/a").unwrap();
    let b = volume.open_for_write("/b").unwrap();
    assert_eq!(
        volume.open_for_write("/c").unwrap_err(),
        FsError::TooManyOpenFiles
    );
    volume.close(a).unwrap();
    let c = volume.open_for_write("/c").unwrap();
    volume.close(b).unwrap();
    volume.close(c).unwrap();

    // The configured limit cannot exceed the hard bound.
    assert!(MAX_OPEN_FILES >= 2);
}

#[test]
fn data_survives_remount() {
    let mut image = fresh_image();
    {
        let mut volume = mounted(&mut image);
        volume.create_dir("/boot").unwrap();
        volume.write_file("/boot/cfg", b"keep me").unwrap();
    }

    let mut volume = mounted(&mut image);
    let mut buffer = [0u8; 32];
    let n = volume.read_file("/boot/cfg", &mut buffer).unwrap();
    assert_eq!(&buffer[..n], b"keep me");
}

#[test]
fn volume_fills_up() {
    // A tiny volume: 8 blocks total, few data blocks.
    let mut image = vec![0u8; 8 * Block::LEN];
    let mut device = MemoryBlockDevice::new(&mut image);
    Volume::format(&mut device).unwrap();
    let mut volume = Volume::mount(device, 5).map_err(|(e, _)| e).unwrap();

    let big = vec![0u8; 16 * Block::LEN];
    assert_eq!(volume.write_file("/big", &big), Err(FsError::VolumeFull));

    // The close after the failed write recorded the bytes that made it out,
    // so the partial file can be deleted to free its blocks.
    volume.delete_file("/big").unwrap();
    volume.write_file("/small", b"fits again").unwrap();
}

#[cfg(feature = "refcell-blockdevice")]
#[test]
fn volume_over_shared_device() {
    use core::cell::RefCell;

    let mut image = fresh_image();
    let device = RefCell::new(MemoryBlockDevice::new(&mut image));

    let mut volume = Volume::mount(&device, 5).map_err(|(e, _)| e).unwrap();
    volume.write_file("/shared", b"via refcell").unwrap();

    let mut buffer = [0u8; 32];
    let n = volume.read_file("/shared", &mut buffer).unwrap();
    assert_eq!(&buffer[..n], b"via refcell");
}
