//! File-system scenarios over a memory-backed volume.
use mica::dev::{Disk, MemDisk};
use mica_fs::Fs;
use mica_fs::inode::MAX_LENGTH;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::sync::Arc;

fn fresh_fs(sectors: u32) -> (Fs, Arc<MemDisk>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dev = MemDisk::new(sectors);
    let fs = Fs::format(Disk::new(dev.clone())).unwrap();
    (fs, dev)
}

#[test]
fn cold_read_modify_write() {
    let (fs, dev) = fresh_fs(8192);
    let used_after_format = fs.used_sectors();

    fs.create("f", 0).unwrap();
    assert_eq!(fs.used_sectors(), used_after_format + 1); // the inode sector

    let pattern: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();
    let mut f = fs.open("f").unwrap();
    assert_eq!(f.write(&fs, &pattern), 4096);
    f.close(&fs);

    // Eight data sectors, no indirect blocks (8 <= 12 direct slots).
    assert_eq!(fs.used_sectors(), used_after_format + 1 + 8);

    let mut f = fs.open("f").unwrap();
    let mut out = vec![0u8; 4096];
    assert_eq!(f.read(&fs, &mut out), 4096);
    assert_eq!(out, pattern);
    f.close(&fs);

    // Survives a remount.
    drop(fs);
    let fs = Fs::mount(Disk::new(dev)).unwrap();
    let mut f = fs.open("f").unwrap();
    let mut out = vec![0u8; 4096];
    assert_eq!(f.read(&fs, &mut out), 4096);
    assert_eq!(out, pattern);
    f.close(&fs);
}

#[test]
fn extend_across_the_indirect_boundary() {
    let (fs, _dev) = fresh_fs(8192);
    let used_after_format = fs.used_sectors();

    fs.create("g", 0).unwrap();
    let f = fs.open("g").unwrap();
    assert_eq!(f.write_at(&fs, &[0xabu8], 6144), 1);
    assert_eq!(f.size(), 6145);

    let mut byte = [0xffu8];
    assert_eq!(f.read_at(&fs, &mut byte, 0), 1);
    assert_eq!(byte[0], 0x00);
    assert_eq!(f.read_at(&fs, &mut byte, 6143), 1);
    assert_eq!(byte[0], 0x00);
    assert_eq!(f.read_at(&fs, &mut byte, 6144), 1);
    assert_eq!(byte[0], 0xab);
    f.close(&fs);

    // 13 data sectors, one indirect block, one inode sector.
    assert_eq!(fs.used_sectors(), used_after_format + 13 + 1 + 1);
}

#[test]
fn boundary_offsets_allocate_and_read_back() {
    let (fs, _dev) = fresh_fs(2048);
    fs.create("b", 0).unwrap();
    let f = fs.open("b").unwrap();

    // Last byte of the last direct sector.
    assert_eq!(f.write_at(&fs, &[1u8], 12 * 512 - 1), 1);
    assert_eq!(f.size(), 12 * 512);
    // First byte of the first indirect sector.
    assert_eq!(f.write_at(&fs, &[2u8], 12 * 512), 1);
    assert_eq!(f.size(), 12 * 512 + 1);
    // First byte of the double-indirect region.
    assert_eq!(f.write_at(&fs, &[3u8], (12 + 256) * 512), 1);
    assert_eq!(f.size(), (12 + 256) * 512 + 1);

    let mut byte = [0u8];
    f.read_at(&fs, &mut byte, 12 * 512 - 1);
    assert_eq!(byte[0], 1);
    f.read_at(&fs, &mut byte, 12 * 512);
    assert_eq!(byte[0], 2);
    f.read_at(&fs, &mut byte, (12 + 256) * 512);
    assert_eq!(byte[0], 3);
    f.close(&fs);
}

#[test]
fn bytes_between_old_and_new_end_read_as_zero() {
    let (fs, _dev) = fresh_fs(2048);
    fs.create("sparse", 0).unwrap();
    let f = fs.open("sparse").unwrap();
    f.write_at(&fs, b"head", 0);
    f.write_at(&fs, b"tail", 100_000);

    let mut out = vec![0xffu8; 100_004];
    assert_eq!(f.read_at(&fs, &mut out, 0), 100_004);
    assert_eq!(&out[..4], b"head");
    assert!(out[4..100_000].iter().all(|&b| b == 0));
    assert_eq!(&out[100_000..], b"tail");
    f.close(&fs);
}

#[test]
fn random_partial_writes_round_trip() {
    let (fs, _dev) = fresh_fs(4096);
    fs.create("r", 0).unwrap();
    let f = fs.open("r").unwrap();

    let mut rng = StdRng::seed_from_u64(0x6d696361);
    let mut model = vec![0u8; 300_000];
    for _ in 0..64 {
        let ofs = rng.gen_range(0..model.len() - 2000);
        let len = rng.gen_range(1..2000);
        let chunk: Vec<u8> = (0..len).map(|_| rng.r#gen()).collect();
        assert_eq!(f.write_at(&fs, &chunk, ofs), len);
        model[ofs..ofs + len].copy_from_slice(&chunk);
    }

    let mut out = vec![0u8; model.len()];
    let n = f.read_at(&fs, &mut out, 0);
    assert_eq!(&out[..n], &model[..n]);
    f.close(&fs);
}

#[test]
fn megabyte_file_round_trips_through_the_double_indirect_region() {
    let (fs, _dev) = fresh_fs(4096);
    fs.create("big", 0).unwrap();
    let mut f = fs.open("big").unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    let data: Vec<u8> = (0..1024 * 1024).map(|_| rng.r#gen()).collect();
    for chunk in data.chunks(64 * 1024) {
        assert_eq!(f.write(&fs, chunk), chunk.len());
    }
    assert_eq!(f.size(), data.len());

    f.seek(0);
    let mut out = vec![0u8; data.len()];
    assert_eq!(f.read(&fs, &mut out), data.len());
    assert_eq!(out, data);

    // 2048 data sectors live behind 12 direct slots, both indirect
    // blocks, and the double-indirect chain.
    let mut byte = [0u8];
    f.read_at(&fs, &mut byte, (12 + 256) * 512 + 11);
    assert_eq!(byte[0], data[(12 + 256) * 512 + 11]);
    f.close(&fs);
}

#[test]
fn write_rolls_back_when_sectors_run_out() {
    let (fs, _dev) = fresh_fs(256);
    fs.create("small", 0).unwrap();
    let small = fs.open("small").unwrap();
    assert_eq!(small.write_at(&fs, &[7u8; 512], 0), 512);

    // Chew up most of the remaining sectors.
    fs.create("hog", 80 * 1024).unwrap();

    let used_before = fs.used_sectors();
    let big = vec![0x5au8; 1024 * 1024];
    assert_eq!(small.write_at(&fs, &big, 0), 0);
    assert_eq!(fs.used_sectors(), used_before);
    assert_eq!(small.size(), 512);

    // The file still works after the failed extension.
    let mut byte = [0u8];
    small.read_at(&fs, &mut byte, 511);
    assert_eq!(byte[0], 7);
    small.close(&fs);
}

#[test]
fn the_format_maximum_is_enforced() {
    let (fs, _dev) = fresh_fs(64);
    fs.create("m", 0).unwrap();
    let f = fs.open("m").unwrap();

    let used_before = fs.used_sectors();
    assert_eq!(f.write_at(&fs, &[1u8], MAX_LENGTH), 0);
    assert_eq!(f.size(), 0);
    assert_eq!(fs.used_sectors(), used_before);
    f.close(&fs);

    assert!(fs.create("toolarge", MAX_LENGTH + 1).is_err());
}

#[test]
fn deny_write_blocks_other_handles() {
    let (fs, _dev) = fresh_fs(1024);
    fs.create("exe", 0).unwrap();

    let mut protected = fs.open("exe").unwrap();
    let writer = fs.open("exe").unwrap();

    protected.deny_write();
    assert_eq!(writer.write_at(&fs, b"overwrite", 0), 0);

    protected.allow_write();
    assert_eq!(writer.write_at(&fs, b"overwrite", 0), 9);

    // Closing a denying handle also lifts the denial.
    protected.deny_write();
    protected.close(&fs);
    assert_eq!(writer.write_at(&fs, b"again", 0), 5);
    writer.close(&fs);
}

#[test]
fn opening_the_same_file_twice_shares_the_inode() {
    let (fs, _dev) = fresh_fs(1024);
    fs.create("shared", 0).unwrap();

    let open_inodes_before = fs.open_inode_count();
    let a = fs.open("shared").unwrap();
    let b = fs.open("shared").unwrap();
    assert_eq!(fs.open_inode_count(), open_inodes_before + 1);
    assert_eq!(a.inode().sector(), b.inode().sector());
    assert_eq!(a.inode().open_count(), 2);

    // A write through one handle is visible through the other.
    a.write_at(&fs, b"hello", 0);
    let mut out = [0u8; 5];
    b.read_at(&fs, &mut out, 0);
    assert_eq!(&out, b"hello");

    a.close(&fs);
    assert_eq!(b.inode().open_count(), 1);
    b.close(&fs);
    assert_eq!(fs.open_inode_count(), open_inodes_before);
}

#[test]
fn removed_files_live_until_the_last_close() {
    let (fs, _dev) = fresh_fs(1024);
    fs.create("doomed", 0).unwrap();
    let f = fs.open("doomed").unwrap();
    assert_eq!(f.write_at(&fs, &[9u8; 2048], 0), 2048);
    let used_with_file = fs.used_sectors();

    fs.remove("doomed").unwrap();
    assert!(fs.open("doomed").is_err());

    // The open handle still reads the data.
    let mut out = [0u8; 2048];
    assert_eq!(f.read_at(&fs, &mut out, 0), 2048);
    assert!(out.iter().all(|&b| b == 9));

    // The final close releases the data sectors and the inode sector.
    f.close(&fs);
    assert_eq!(fs.used_sectors(), used_with_file - 4 - 1);

    // The name can be reused.
    fs.create("doomed", 0).unwrap();
}

#[test]
fn free_map_survives_remount() {
    let dev = MemDisk::new(2048);
    let used = {
        let fs = Fs::format(Disk::new(dev.clone())).unwrap();
        fs.create("a", 3000).unwrap();
        fs.create("b", 0).unwrap();
        let f = fs.open("b").unwrap();
        f.write_at(&fs, &[1u8; 600], 0);
        f.close(&fs);
        fs.used_sectors()
    };

    let fs = Fs::mount(Disk::new(dev)).unwrap();
    assert_eq!(fs.used_sectors(), used);

    // And allocation continues without stomping existing files.
    fs.create("c", 0).unwrap();
    let f = fs.open("c").unwrap();
    f.write_at(&fs, &[2u8; 512], 0);
    f.close(&fs);

    let f = fs.open("b").unwrap();
    let mut out = [0u8; 600];
    f.read_at(&fs, &mut out, 0);
    assert!(out.iter().all(|&b| b == 1));
    f.close(&fs);
}

#[test]
fn directory_name_rules() {
    let (fs, _dev) = fresh_fs(1024);
    fs.create("dup", 0).unwrap();
    assert!(fs.create("dup", 0).is_err());
    assert!(fs.create("", 0).is_err());
    assert!(fs.create("name-way-too-long", 0).is_err());
    assert!(fs.open("missing").is_err());
    assert!(fs.remove("missing").is_err());
}
