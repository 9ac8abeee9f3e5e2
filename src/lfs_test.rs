#[cfg(test)]
mod tests {
    use alloc::{format, string::String, sync::Arc, vec, vec::Vec};

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use crate::{
        AccessMode, AtimePolicy, BlockDevice, Caller, GcMode, Geometry, Lfs, LfsConfig, LfsError,
        LfsFileType, LfsPermission, LfsTimeSpec, MemDisk, RenameFlags,
    };

    const BS: usize = 512;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn root() -> Caller {
        Caller::root(LfsTimeSpec::new(1_700_000_000, 0))
    }

    fn user() -> Caller {
        Caller::new(1000, 1000, LfsTimeSpec::new(1_700_000_100, 0))
    }

    fn perm(mode: u32) -> LfsPermission {
        LfsPermission::from_bits_truncate(mode)
    }

    /// 512-byte blocks, 32 blocks per segment (30 usable).
    fn config(segments: u32) -> LfsConfig {
        let geo = Geometry {
            block_size: BS as u32,
            blocks_per_segment: 32,
            segment_count: segments,
            max_inodes: 256,
        };
        LfsConfig {
            cache_bytes: 4 * geo.segment_size(),
            auto_gc: false,
            atime: AtimePolicy::Off,
            ..LfsConfig::default()
        }
        .with_geometry(geo)
    }

    fn setup(config: LfsConfig) -> (Arc<MemDisk>, Lfs) {
        init_log();
        let disk = Arc::new(MemDisk::new(config.geometry().image_size() as usize));
        let fs = Lfs::format(disk.clone(), config, &root()).unwrap();
        (disk, fs)
    }

    fn read_all(fs: &Lfs, path: &str) -> Vec<u8> {
        let size = fs.getattr(path, &root()).unwrap().size;
        let mut buf = vec![0u8; size as usize];
        let n = fs.read(path, &mut buf, 0, &root()).unwrap();
        assert_eq!(n, buf.len());
        buf
    }

    fn random_bytes(rng: &mut StdRng, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        data
    }

    #[test]
    fn created_file_resolves_to_its_inode() {
        let (_disk, fs) = setup(config(8));
        let ino = fs.create("/a", perm(0o644), &root()).unwrap();
        assert_eq!(fs.open("/a", &root()).unwrap(), ino);
        let attr = fs.getattr("/a", &root()).unwrap();
        assert_eq!(attr.ino, ino);
        assert_eq!(attr.kind, LfsFileType::RegularFile);
        assert_eq!((attr.size, attr.nlink), (0, 1));
        assert_eq!(fs.create("/a", perm(0o644), &root()), Err(LfsError::AlreadyExists));
        assert_eq!(fs.getattr("/missing", &root()), Err(LfsError::NotFound));
        assert_eq!(fs.getattr("relative", &root()), Err(LfsError::InvalidPath));
        let long = format!("/{}", "x".repeat(60));
        assert_eq!(fs.create(&long, perm(0o644), &root()), Err(LfsError::NameTooLong));
    }

    #[test]
    fn alternating_pattern_reads_back() {
        let (_disk, fs) = setup(config(8));
        fs.create("/xy", perm(0o644), &root()).unwrap();
        let data: Vec<u8> = b"XY".iter().copied().cycle().take(1500).collect();
        assert_eq!(fs.write("/xy", &data, 0, &root()).unwrap(), 1500);
        let attr = fs.getattr("/xy", &root()).unwrap();
        assert_eq!(attr.size, 1500);
        assert_eq!(attr.blocks, 3);
        assert_eq!(read_all(&fs, "/xy"), data);

        // Partial reads straddling block edges, and reads past the end.
        let mut buf = [0u8; 20];
        assert_eq!(fs.read("/xy", &mut buf, 505, &root()).unwrap(), 20);
        assert_eq!(&buf[..], &data[505..525]);
        assert_eq!(fs.read("/xy", &mut buf, 1490, &root()).unwrap(), 10);
        assert_eq!(fs.read("/xy", &mut buf, 1500, &root()).unwrap(), 0);
        assert_eq!(fs.read("/xy", &mut buf, 9000, &root()).unwrap(), 0);
    }

    #[test]
    fn overwrite_in_the_middle() {
        let (_disk, fs) = setup(config(8));
        let mut rng = StdRng::seed_from_u64(7);
        fs.create("/f", perm(0o644), &root()).unwrap();
        let mut expect = random_bytes(&mut rng, 4 * BS);
        fs.write("/f", &expect, 0, &root()).unwrap();
        let patch = random_bytes(&mut rng, 700);
        fs.write("/f", &patch, 300, &root()).unwrap();
        expect[300..1000].copy_from_slice(&patch);
        assert_eq!(read_all(&fs, "/f"), expect);
        assert_eq!(fs.getattr("/f", &root()).unwrap().size, 4 * BS as u64);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let (_disk, fs) = setup(config(8));
        fs.create("/sparse", perm(0o644), &root()).unwrap();
        fs.write("/sparse", b"head", 0, &root()).unwrap();
        fs.write("/sparse", b"tail", 2000, &root()).unwrap();
        let data = read_all(&fs, "/sparse");
        assert_eq!(data.len(), 2004);
        assert_eq!(&data[..4], b"head");
        assert!(data[4..2000].iter().all(|b| *b == 0));
        assert_eq!(&data[2000..], b"tail");
        assert_eq!(
            fs.write("/sparse", b"x", i32::MAX as u64, &root()),
            Err(LfsError::InvalidArgument)
        );
    }

    #[test]
    fn large_file_spans_continuation_inodes() {
        let (_disk, fs) = setup(config(16));
        let mut rng = StdRng::seed_from_u64(42);
        let per_inode = (BS - 96) / 4;
        let data = random_bytes(&mut rng, (per_inode + 6) * BS + 100);
        fs.create("/big", perm(0o644), &root()).unwrap();
        assert_eq!(fs.write("/big", &data, 0, &root()).unwrap(), data.len());
        assert_eq!(fs.stats().unwrap().live_inodes, 3);
        assert_eq!(read_all(&fs, "/big"), data);

        for _ in 0..20 {
            let offset = rng.gen_range(0..data.len());
            let len = rng.gen_range(1..3 * BS);
            let mut buf = vec![0u8; len];
            let n = fs.read("/big", &mut buf, offset as u64, &root()).unwrap();
            assert_eq!(n, len.min(data.len() - offset));
            assert_eq!(&buf[..n], &data[offset..offset + n]);
        }

        // Shrinking into the head drops the continuation link.
        fs.truncate("/big", (per_inode * BS + 7) as u64, &root()).unwrap();
        assert_eq!(fs.stats().unwrap().live_inodes, 3);
        fs.truncate("/big", (per_inode * BS) as u64, &root()).unwrap();
        assert_eq!(fs.stats().unwrap().live_inodes, 2);
        let attr = fs.getattr("/big", &root()).unwrap();
        assert_eq!(attr.size, (per_inode * BS) as u64);
        assert_eq!(attr.blocks, per_inode as u64);
        assert_eq!(read_all(&fs, "/big"), &data[..per_inode * BS]);

        // Growing again allocates a fresh link.
        fs.write("/big", b"again", (per_inode * BS) as u64, &root()).unwrap();
        assert_eq!(fs.stats().unwrap().live_inodes, 3);
        let tail = read_all(&fs, "/big");
        assert_eq!(&tail[per_inode * BS..], b"again");
    }

    #[test]
    fn continuation_inode_is_not_a_handle() {
        let (_disk, fs) = setup(config(16));
        let per_inode = (BS - 96) / 4;
        let head = fs.create("/big", perm(0o644), &root()).unwrap();
        fs.write("/big", &vec![5u8; (per_inode + 1) * BS], 0, &root()).unwrap();
        // The first continuation link takes the next inode number.
        let link = head + 1;
        assert!(fs.contains_inode(link).unwrap());

        let mut buf = [0u8; 8];
        assert_eq!(fs.read_ino(link, &mut buf, 0, &root()), Err(LfsError::InvalidArgument));
        assert_eq!(fs.write_ino(link, b"x", 0, &root()), Err(LfsError::InvalidArgument));
        assert_eq!(fs.truncate_ino(link, 0, &root()), Err(LfsError::InvalidArgument));
        assert_eq!(fs.read_ino(200, &mut buf, 0, &root()), Err(LfsError::NotFound));

        // The engine keeps serving.
        assert_eq!(fs.read_ino(head, &mut buf, 0, &root()).unwrap(), 8);
        assert_eq!(buf, [5u8; 8]);
        assert_eq!(fs.stats().unwrap().live_inodes, 3);
    }

    #[test]
    fn truncate_only_shrinks() {
        let (_disk, fs) = setup(config(8));
        fs.create("/t", perm(0o644), &root()).unwrap();
        fs.write("/t", &[9u8; 1200], 0, &root()).unwrap();
        fs.truncate("/t", 5000, &root()).unwrap();
        assert_eq!(fs.getattr("/t", &root()).unwrap().size, 1200);
        fs.truncate("/t", 10, &root()).unwrap();
        assert_eq!(read_all(&fs, "/t"), vec![9u8; 10]);
        // Bytes beyond the old end come back as zeros.
        fs.write("/t", b"z", 600, &root()).unwrap();
        let data = read_all(&fs, "/t");
        assert!(data[10..600].iter().all(|b| *b == 0));
        fs.truncate("/t", 0, &root()).unwrap();
        let attr = fs.getattr("/t", &root()).unwrap();
        assert_eq!((attr.size, attr.blocks), (0, 0));
    }

    #[test]
    fn rename_noreplace_keeps_both_files() {
        let (_disk, fs) = setup(config(8));
        fs.create("/a", perm(0o644), &root()).unwrap();
        fs.create("/b", perm(0o644), &root()).unwrap();
        fs.write("/a", b"alpha", 0, &root()).unwrap();
        fs.write("/b", b"bravo!", 0, &root()).unwrap();
        assert_eq!(
            fs.rename("/a", "/b", RenameFlags::NOREPLACE, &root()),
            Err(LfsError::AlreadyExists)
        );
        assert_eq!(read_all(&fs, "/a"), b"alpha");
        assert_eq!(read_all(&fs, "/b"), b"bravo!");
        assert_eq!(
            fs.rename("/a", "/b", RenameFlags::NOREPLACE | RenameFlags::EXCHANGE, &root()),
            Err(LfsError::InvalidArgument)
        );
    }

    #[test]
    fn rename_exchange_swaps_entries() {
        let (_disk, fs) = setup(config(8));
        let a = fs.create("/a", perm(0o644), &root()).unwrap();
        fs.mkdir("/d", perm(0o755), &root()).unwrap();
        let b = fs.create("/d/b", perm(0o644), &root()).unwrap();
        fs.write("/a", b"alpha", 0, &root()).unwrap();
        fs.write("/d/b", b"bravo", 0, &root()).unwrap();
        fs.rename("/a", "/d/b", RenameFlags::EXCHANGE, &root()).unwrap();
        assert_eq!(fs.open("/a", &root()).unwrap(), b);
        assert_eq!(fs.open("/d/b", &root()).unwrap(), a);
        assert_eq!(read_all(&fs, "/a"), b"bravo");
        assert_eq!(read_all(&fs, "/d/b"), b"alpha");
        assert_eq!(
            fs.rename("/a", "/nothing", RenameFlags::EXCHANGE, &root()),
            Err(LfsError::NotFound)
        );
    }

    #[test]
    fn rename_moves_and_replaces() {
        let (_disk, fs) = setup(config(8));
        let a = fs.create("/a", perm(0o644), &root()).unwrap();
        let b = fs.create("/b", perm(0o644), &root()).unwrap();
        fs.write("/a", b"moved", 0, &root()).unwrap();
        fs.rename("/a", "/c", RenameFlags::empty(), &root()).unwrap();
        assert_eq!(fs.getattr("/a", &root()), Err(LfsError::NotFound));
        assert_eq!(fs.open("/c", &root()).unwrap(), a);

        fs.rename("/c", "/b", RenameFlags::empty(), &root()).unwrap();
        assert_eq!(fs.open("/b", &root()).unwrap(), a);
        assert_eq!(read_all(&fs, "/b"), b"moved");
        assert!(!fs.contains_inode(b).unwrap());

        // Renaming onto itself changes nothing.
        fs.rename("/b", "/b", RenameFlags::empty(), &root()).unwrap();
        assert_eq!(read_all(&fs, "/b"), b"moved");
    }

    #[test]
    fn rename_over_linked_file_keeps_other_name() {
        let (_disk, fs) = setup(config(8));
        fs.create("/a", perm(0o644), &root()).unwrap();
        fs.write("/a", b"new", 0, &root()).unwrap();
        let old = fs.create("/b", perm(0o644), &root()).unwrap();
        fs.write("/b", b"old", 0, &root()).unwrap();
        fs.link("/b", "/keep", &root()).unwrap();

        fs.rename("/a", "/b", RenameFlags::empty(), &root()).unwrap();
        assert_eq!(read_all(&fs, "/b"), b"new");
        assert_eq!(fs.open("/keep", &root()).unwrap(), old);
        assert_eq!(fs.getattr("/keep", &root()).unwrap().nlink, 1);
        assert_eq!(read_all(&fs, "/keep"), b"old");

        // Overwriting the last name removes the inode.
        fs.rename("/b", "/keep", RenameFlags::empty(), &root()).unwrap();
        assert!(!fs.contains_inode(old).unwrap());
        assert_eq!(read_all(&fs, "/keep"), b"new");
        assert_eq!(fs.readdir("/", &root()).unwrap().len(), 3);
    }

    #[test]
    fn rename_directories_across_parents() {
        let (_disk, fs) = setup(config(8));
        fs.mkdir("/d1", perm(0o755), &root()).unwrap();
        fs.mkdir("/d2", perm(0o755), &root()).unwrap();
        fs.mkdir("/d1/sub", perm(0o755), &root()).unwrap();
        fs.create("/d1/sub/f", perm(0o644), &root()).unwrap();
        assert_eq!(fs.getattr("/d1", &root()).unwrap().nlink, 3);

        fs.rename("/d1/sub", "/d2/sub", RenameFlags::empty(), &root()).unwrap();
        assert_eq!(fs.getattr("/d1", &root()).unwrap().nlink, 2);
        assert_eq!(fs.getattr("/d2", &root()).unwrap().nlink, 3);
        assert!(fs.getattr("/d2/sub/f", &root()).is_ok());

        assert_eq!(
            fs.rename("/d2", "/d2/sub/inner", RenameFlags::empty(), &root()),
            Err(LfsError::InvalidArgument)
        );
        fs.create("/file", perm(0o644), &root()).unwrap();
        assert_eq!(
            fs.rename("/file", "/d2/sub", RenameFlags::empty(), &root()),
            Err(LfsError::IsADirectory)
        );
        assert_eq!(
            fs.rename("/d1", "/d2", RenameFlags::empty(), &root()),
            Err(LfsError::NotEmpty)
        );
    }

    #[test]
    fn mkdir_readdir_rmdir() {
        let (_disk, fs) = setup(config(8));
        let d = fs.mkdir("/d", perm(0o755), &root()).unwrap();
        assert_eq!(fs.getattr("/", &root()).unwrap().nlink, 3);
        assert_eq!(fs.opendir("/d", &root()).unwrap(), d);
        let x = fs.create("/d/x", perm(0o644), &root()).unwrap();

        let entries = fs.readdir("/d", &root()).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, [".", "..", "x"]);
        assert_eq!(entries[0].ino, d);
        assert_eq!(entries[1].ino, crate::ROOT_INO);
        assert_eq!((entries[2].ino, entries[2].kind), (x, LfsFileType::RegularFile));

        assert_eq!(fs.rmdir("/d", &root()), Err(LfsError::NotEmpty));
        assert_eq!(fs.rmdir("/d/x", &root()), Err(LfsError::NotADirectory));
        assert_eq!(fs.unlink("/d", &root()), Err(LfsError::IsADirectory));
        assert_eq!(fs.rmdir("/", &root()), Err(LfsError::InvalidArgument));
        assert_eq!(fs.readdir("/d/x", &root()), Err(LfsError::NotADirectory));
        assert_eq!(fs.create("/d/x/y", perm(0o644), &root()), Err(LfsError::NotADirectory));

        fs.unlink("/d/x", &root()).unwrap();
        fs.rmdir("/d", &root()).unwrap();
        assert_eq!(fs.getattr("/d", &root()), Err(LfsError::NotFound));
        assert_eq!(fs.getattr("/", &root()).unwrap().nlink, 2);
        assert!(!fs.contains_inode(d).unwrap());
    }

    #[test]
    fn directory_grows_past_one_block() {
        let (_disk, fs) = setup(config(8));
        fs.mkdir("/many", perm(0o755), &root()).unwrap();
        // Eight entries fit in a 512-byte block.
        for i in 0..20 {
            fs.create(&format!("/many/f{}", i), perm(0o644), &root()).unwrap();
        }
        assert_eq!(fs.getattr("/many", &root()).unwrap().size, 3 * BS as u64);
        assert_eq!(fs.readdir("/many", &root()).unwrap().len(), 22);

        fs.unlink("/many/f3", &root()).unwrap();
        fs.create("/many/refill", perm(0o644), &root()).unwrap();
        let names: Vec<String> = fs
            .readdir("/many", &root())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        // The freed slot is reused in place.
        assert_eq!(names[5], "refill");
        assert_eq!(fs.getattr("/many", &root()).unwrap().size, 3 * BS as u64);
    }

    #[test]
    fn hard_links_share_an_inode() {
        let (_disk, fs) = setup(config(8));
        let ino = fs.create("/a", perm(0o644), &root()).unwrap();
        fs.write("/a", b"shared", 0, &root()).unwrap();
        fs.link("/a", "/b", &root()).unwrap();
        assert_eq!(fs.open("/b", &root()).unwrap(), ino);
        assert_eq!(fs.getattr("/a", &root()).unwrap().nlink, 2);
        assert_eq!(fs.link("/a", "/b", &root()), Err(LfsError::AlreadyExists));

        fs.unlink("/a", &root()).unwrap();
        assert!(fs.contains_inode(ino).unwrap());
        assert_eq!(fs.getattr("/b", &root()).unwrap().nlink, 1);
        assert_eq!(read_all(&fs, "/b"), b"shared");
        fs.unlink("/b", &root()).unwrap();
        assert!(!fs.contains_inode(ino).unwrap());

        fs.mkdir("/dir", perm(0o755), &root()).unwrap();
        assert_eq!(fs.link("/dir", "/dir2", &root()), Err(LfsError::IsADirectory));
    }

    #[test]
    fn unlinked_inode_stays_gone() {
        let (disk, fs) = setup(config(8));
        let keep = fs.create("/keep", perm(0o644), &root()).unwrap();
        let gone = fs.create("/gone", perm(0o644), &root()).unwrap();
        fs.write("/keep", b"kept", 0, &root()).unwrap();
        fs.write("/gone", &[1u8; 3 * BS], 0, &root()).unwrap();
        fs.unlink("/gone", &root()).unwrap();
        assert_eq!(fs.getattr("/gone", &root()), Err(LfsError::NotFound));
        assert!(!fs.contains_inode(gone).unwrap());

        fs.collect_garbage(false).unwrap();
        assert!(!fs.contains_inode(gone).unwrap());
        assert!(fs.contains_inode(keep).unwrap());
        fs.unmount().unwrap();

        let fs = Lfs::mount(disk, config(8)).unwrap();
        assert!(!fs.contains_inode(gone).unwrap());
        assert_eq!(read_all(&fs, "/keep"), b"kept");
    }

    /// Files g1..g4 with 20 blocks each; g1 is rewritten three more times.
    fn churn(fs: &Lfs, rng: &mut StdRng) -> Vec<(String, Vec<u8>)> {
        let mut files = Vec::new();
        for i in 1..=4 {
            let path = format!("/g{}", i);
            fs.create(&path, perm(0o644), &root()).unwrap();
            files.push((path, Vec::new()));
        }
        for (path, data) in files.iter_mut() {
            *data = random_bytes(rng, 20 * BS);
            fs.write(path, data, 0, &root()).unwrap();
        }
        for _ in 0..3 {
            let data = random_bytes(rng, 20 * BS);
            fs.write("/g1", &data, 0, &root()).unwrap();
            files[0].1 = data;
        }
        files
    }

    #[test]
    fn normal_collection_preserves_content_and_metadata() {
        let (_disk, fs) = setup(config(12));
        let mut rng = StdRng::seed_from_u64(1);
        let files = churn(&fs, &mut rng);
        let attrs: Vec<_> = files.iter().map(|(p, _)| fs.getattr(p, &root()).unwrap()).collect();

        let report = fs.collect_garbage(false).unwrap();
        assert_eq!(report.mode, GcMode::Normal);
        assert!(report.segments_cleaned >= 1);
        assert!(report.segments_in_use_after <= report.segments_in_use_before);
        for ((path, data), attr) in files.iter().zip(attrs.iter()) {
            assert_eq!(&fs.getattr(path, &root()).unwrap(), attr);
            assert_eq!(&read_all(&fs, path), data);
        }
        // The log keeps working after the swap.
        fs.write("/g2", b"post-gc", 0, &root()).unwrap();
        assert_eq!(&read_all(&fs, "/g2")[..7], b"post-gc");
    }

    #[test]
    fn cleaned_tombstone_is_carried_forward() {
        let config = LfsConfig {
            gc_min_segments: 1,
            gc_utilization_threshold: 0.0,
            ..config(12)
        };
        let (disk, fs) = setup(config.clone());
        let mut rng = StdRng::seed_from_u64(6);
        // Segment 0: the victim and the first 20 blocks of /big.
        let victim = fs.create("/victim", perm(0o644), &root()).unwrap();
        fs.write("/victim", &[1u8; 2 * BS], 0, &root()).unwrap();
        fs.create("/big", perm(0o644), &root()).unwrap();
        let big = random_bytes(&mut rng, 20 * BS);
        fs.write("/big", &big, 0, &root()).unwrap();
        // Segment 1: /junk, almost all live.
        fs.create("/junk", perm(0o644), &root()).unwrap();
        let junk = random_bytes(&mut rng, 26 * BS);
        fs.write("/junk", &junk, 0, &root()).unwrap();
        // Segment 2: the victim's tombstone among blocks that soon die.
        fs.unlink("/victim", &root()).unwrap();
        fs.create("/junk2", perm(0o644), &root()).unwrap();
        fs.write("/junk2", &[2u8; 24 * BS], 0, &root()).unwrap();
        let junk2 = random_bytes(&mut rng, 24 * BS);
        fs.write("/junk2", &junk2, 0, &root()).unwrap();

        let report = fs.collect_garbage(false).unwrap();
        assert_eq!(report.mode, GcMode::Normal);
        assert_eq!(report.segments_cleaned, 1);
        assert_eq!(report.tombstones, 1);
        fs.unmount().unwrap();

        let fs = Lfs::mount(disk, config).unwrap();
        assert!(!fs.contains_inode(victim).unwrap());
        assert_eq!(fs.getattr("/victim", &root()), Err(LfsError::NotFound));
        assert_eq!(read_all(&fs, "/big"), big);
        assert_eq!(read_all(&fs, "/junk"), junk);
        assert_eq!(read_all(&fs, "/junk2"), junk2);
    }

    #[test]
    fn thorough_collection_never_grows_the_log() {
        let (disk, fs) = setup(config(12));
        let mut rng = StdRng::seed_from_u64(2);
        let files = churn(&fs, &mut rng);
        let before = fs.stats().unwrap().segments_in_use;

        let report = fs.collect_garbage(true).unwrap();
        assert_eq!(report.mode, GcMode::Thorough);
        assert!(report.segments_in_use_after <= before);
        assert_eq!(fs.stats().unwrap().segments_in_use, report.segments_in_use_after);
        for (path, data) in &files {
            assert_eq!(&read_all(&fs, path), data);
        }

        // The rebuilt log survives a remount.
        fs.unmount().unwrap();
        let fs = Lfs::mount(disk, config(12)).unwrap();
        for (path, data) in &files {
            assert_eq!(&read_all(&fs, path), data);
        }
    }

    #[test]
    fn full_log_escalates_to_thorough() {
        let (_disk, fs) = setup(config(6));
        let mut rng = StdRng::seed_from_u64(3);
        fs.create("/f", perm(0o644), &root()).unwrap();
        let mut data = Vec::new();
        let mut rounds = 0;
        while fs.stats().unwrap().free_segments > 0 {
            data = random_bytes(&mut rng, 20 * BS);
            fs.write("/f", &data, 0, &root()).unwrap();
            rounds += 1;
            assert!(rounds < 100);
        }

        let report = fs.collect_garbage(false).unwrap();
        assert_eq!(report.mode, GcMode::Thorough);
        assert!(fs.stats().unwrap().free_segments >= 1);
        assert_eq!(read_all(&fs, "/f"), data);
    }

    #[test]
    fn normal_collection_escalates_when_output_fills() {
        let config = || LfsConfig {
            gc_min_segments: 8,
            gc_utilization_threshold: 1.0,
            ..config(5)
        };
        let (disk, fs) = setup(config());
        let mut rng = StdRng::seed_from_u64(11);
        fs.create("/f", perm(0o644), &root()).unwrap();
        let data = random_bytes(&mut rng, 76 * BS);
        fs.write("/f", &data, 0, &root()).unwrap();
        let stats = fs.stats().unwrap();
        assert_eq!((stats.segments_in_use, stats.free_segments), (3, 2));

        // Two free segments cannot hold the live blocks of three.
        let report = fs.collect_garbage(false).unwrap();
        assert_eq!(report.mode, GcMode::Thorough);
        assert_eq!(report.segments_cleaned, 3);
        assert!(report.blocks_moved >= 76);
        assert_eq!(read_all(&fs, "/f"), data);
        fs.unmount().unwrap();

        let fs = Lfs::mount(disk, config()).unwrap();
        assert_eq!(read_all(&fs, "/f"), data);
    }

    #[test]
    fn automatic_collection_keeps_space_available() {
        let config = LfsConfig {
            auto_gc: true,
            ..config(8)
        };
        let (_disk, fs) = setup(config);
        let mut rng = StdRng::seed_from_u64(4);
        fs.create("/f", perm(0o644), &root()).unwrap();
        let mut data = Vec::new();
        for _ in 0..40 {
            data = random_bytes(&mut rng, 20 * BS);
            fs.write("/f", &data, 0, &root()).unwrap();
        }
        assert_eq!(read_all(&fs, "/f"), data);
        let stats = fs.stats().unwrap();
        assert!(stats.free_segments >= 1);
        assert!(!stats.is_full);
    }

    #[test]
    fn full_log_without_collection_is_no_space() {
        let (_disk, fs) = setup(config(3));
        fs.create("/f", perm(0o644), &root()).unwrap();
        let chunk = vec![7u8; 20 * BS];
        let mut offset = 0;
        let err = loop {
            match fs.write("/f", &chunk, offset, &root()) {
                Ok(n) => offset += n as u64,
                Err(e) => break e,
            }
            assert!(offset < (100 * BS) as u64);
        };
        assert_eq!(err, LfsError::NoSpace);
        // Reads still work on a full log.
        assert_eq!(read_all(&fs, "/f").len() as u64, offset);
    }

    #[test]
    fn remount_restores_synced_state() {
        let (disk, fs) = setup(config(8));
        fs.mkdir("/docs", perm(0o755), &root()).unwrap();
        let ino = fs.create("/docs/readme", perm(0o640), &root()).unwrap();
        fs.write("/docs/readme", b"persisted", 0, &root()).unwrap();
        fs.sync().unwrap();
        // Never synced: lost on remount.
        fs.write("/docs/readme", b"volatile!", 0, &root()).unwrap();
        let image = disk.snapshot();
        drop(fs);

        let fs = Lfs::mount(Arc::new(MemDisk::from_image(image)), config(8)).unwrap();
        assert_eq!(fs.open("/docs/readme", &root()).unwrap(), ino);
        assert_eq!(read_all(&fs, "/docs/readme"), b"persisted");
        let attr = fs.getattr("/docs/readme", &root()).unwrap();
        assert_eq!(attr.perm, perm(0o640));
        // Inode numbers keep counting from the checkpoint.
        let next = fs.create("/docs/new", perm(0o644), &root()).unwrap();
        assert!(next > ino);
    }

    #[test]
    fn remount_across_rotations() {
        let (disk, fs) = setup(config(8));
        let mut rng = StdRng::seed_from_u64(5);
        fs.create("/f", perm(0o644), &root()).unwrap();
        let data = random_bytes(&mut rng, 70 * BS);
        fs.write("/f", &data, 0, &root()).unwrap();
        assert!(fs.stats().unwrap().segments_in_use >= 3);
        fs.unmount().unwrap();

        let fs = Lfs::mount(disk.clone(), config(8)).unwrap();
        assert_eq!(read_all(&fs, "/f"), data);
        assert!(fs.stats().unwrap().segments_in_use >= 3);
    }

    #[test]
    fn mount_rejects_other_geometry() {
        let (disk, fs) = setup(config(8));
        fs.unmount().unwrap();
        let mut other = config(8);
        other.max_inodes = 512;
        assert!(matches!(Lfs::mount(disk.clone(), other), Err(LfsError::InvalidArgument)));
        let blank = Arc::new(MemDisk::new(config(8).geometry().image_size() as usize));
        assert!(matches!(Lfs::mount(blank.clone(), config(8)), Err(LfsError::Corrupt(_))));
        // A blank image is formatted on first use.
        let fs = Lfs::mount_or_format(blank, config(8), &root()).unwrap();
        assert_eq!(fs.readdir("/", &root()).unwrap().len(), 2);
    }

    #[test]
    fn corruption_halts_the_engine() {
        let (disk, fs) = setup(config(8));
        fs.create("/a", perm(0o644), &root()).unwrap();
        fs.unmount().unwrap();

        // Scribble over the data blocks of segment 0, which hold the root.
        let data_bytes = config(8).geometry().data_blocks() as usize * BS;
        disk.write_at(0, &vec![0x7f; data_bytes]).unwrap();
        let fs = Lfs::mount(disk, config(8)).unwrap();
        assert!(matches!(fs.getattr("/a", &root()), Err(LfsError::Corrupt(_))));
        assert!(matches!(fs.stats(), Err(LfsError::Corrupt(_))));
        assert!(matches!(fs.create("/b", perm(0o644), &root()), Err(LfsError::Corrupt(_))));
    }

    #[test]
    fn inode_number_mismatch_halts_the_engine() {
        let (disk, fs) = setup(config(8));
        fs.create("/a", perm(0o644), &root()).unwrap();
        fs.unmount().unwrap();

        // Block 3 holds the root copy written by the create, after the
        // first root, the file inode and the directory block.
        disk.write_at(3 * BS as u64, &77i32.to_le_bytes()).unwrap();
        let fs = Lfs::mount(disk, config(8)).unwrap();
        match fs.getattr("/", &root()) {
            Err(LfsError::Corrupt(msg)) => assert!(msg.contains("inode 77")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(fs.getattr("/a", &root()), Err(LfsError::Corrupt(_))));
        assert!(matches!(fs.stats(), Err(LfsError::Corrupt(_))));
    }

    #[test]
    fn permissions_are_enforced() {
        let (_disk, fs) = setup(config(8));
        fs.create("/secret", perm(0o600), &root()).unwrap();
        fs.write("/secret", b"hidden", 0, &root()).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(fs.read("/secret", &mut buf, 0, &user()), Err(LfsError::PermissionDenied));
        assert_eq!(fs.write("/secret", b"x", 0, &user()), Err(LfsError::PermissionDenied));
        assert_eq!(fs.access("/secret", AccessMode::READ, &user()), Err(LfsError::PermissionDenied));
        assert_eq!(fs.access("/secret", AccessMode::READ, &root()), Ok(()));
        assert_eq!(fs.create("/mine", perm(0o644), &user()), Err(LfsError::PermissionDenied));
        assert_eq!(fs.chmod("/secret", perm(0o666), &user()), Err(LfsError::PermissionDenied));

        fs.mkdir("/home", perm(0o755), &root()).unwrap();
        fs.chown("/home", Some(1000), Some(1000), &root()).unwrap();
        fs.create("/home/mine", perm(0o600), &user()).unwrap();
        fs.write("/home/mine", b"ok", 0, &user()).unwrap();
        let attr = fs.getattr("/home/mine", &user()).unwrap();
        assert_eq!((attr.uid, attr.gid), (1000, 1000));
        assert_eq!(fs.chown("/home/mine", Some(0), None, &user()), Err(LfsError::PermissionDenied));
        assert_eq!(fs.chown("/home/mine", None, Some(5), &user()), Err(LfsError::PermissionDenied));
        fs.chown("/home/mine", None, Some(1000), &user()).unwrap();

        fs.chmod("/secret", perm(0o644), &root()).unwrap();
        assert_eq!(fs.read("/secret", &mut buf, 0, &user()).unwrap(), 6);
        assert_eq!(&buf, b"hidden");

        // Search permission is needed on every directory along the path.
        fs.chmod("/home", perm(0o700), &root()).unwrap();
        fs.chown("/home", Some(0), Some(0), &root()).unwrap();
        assert_eq!(fs.getattr("/home/mine", &user()), Err(LfsError::PermissionDenied));
    }

    #[test]
    fn utimens_and_atime_policy() {
        let strict = LfsConfig {
            atime: AtimePolicy::Strict,
            ..config(8)
        };
        let (_disk, fs) = setup(strict);
        fs.create("/f", perm(0o644), &root()).unwrap();
        fs.write("/f", b"data", 0, &root()).unwrap();
        let old = LfsTimeSpec::new(1000, 0);
        fs.utimens("/f", Some(old), Some(old), &root()).unwrap();
        let attr = fs.getattr("/f", &root()).unwrap();
        assert_eq!((attr.atime, attr.mtime), (old, old));
        assert_eq!(attr.ctime, root().now);

        let later = Caller::root(LfsTimeSpec::new(1_800_000_000, 0));
        let mut buf = [0u8; 4];
        fs.read("/f", &mut buf, 0, &later).unwrap();
        let attr = fs.getattr("/f", &root()).unwrap();
        assert_eq!(attr.atime, later.now);
        assert_eq!(attr.mtime, old);
        assert_eq!(
            fs.utimens("/f", Some(old), None, &user()),
            Err(LfsError::PermissionDenied)
        );
    }

    #[test]
    fn statfs_tracks_free_space() {
        let (_disk, fs) = setup(config(8));
        let before = fs.statfs().unwrap();
        assert_eq!(before.block_size, BS as u32);
        assert_eq!(before.total_blocks, 8 * 30);
        assert_eq!(before.name_max, 59);
        fs.create("/f", perm(0o644), &root()).unwrap();
        fs.write("/f", &[0u8; 10 * BS], 0, &root()).unwrap();
        let after = fs.statfs().unwrap();
        assert!(after.free_blocks + 10 <= before.free_blocks);
        assert!(after.free_inodes < before.free_inodes);
    }

    #[test]
    fn stats_serialize_to_json() {
        let (_disk, fs) = setup(config(8));
        let stats = fs.stats().unwrap();
        assert_eq!(stats.segments_total, 8);
        assert_eq!(stats.live_inodes, 1);
        let text = serde_json::to_string(&stats).unwrap();
        assert!(text.contains("\"segments_in_use\":1"));
    }

    #[cfg(feature = "std")]
    #[test]
    fn image_file_round_trip() {
        init_log();
        let path = std::env::temp_dir().join(format!("lfs2-{}.img", rand::random::<u64>()));
        let fs = Lfs::open_image(&path, config(4), &root()).unwrap();
        fs.create("/on-disk", perm(0o644), &root()).unwrap();
        fs.write("/on-disk", b"mapped file", 0, &root()).unwrap();
        fs.unmount().unwrap();

        let fs = Lfs::open_image(&path, config(4), &root()).unwrap();
        assert_eq!(read_all(&fs, "/on-disk"), b"mapped file");
        fs.unmount().unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn concurrent_callers_see_whole_operations() {
        let fs = Arc::new(setup(config(48)).1);
        let workers: Vec<_> = (0..4u64)
            .map(|t| {
                let fs = fs.clone();
                std::thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(100 + t);
                    let mut written = Vec::new();
                    for i in 0..10 {
                        let dir = format!("/t{}_{}", t, i);
                        fs.mkdir(&dir, perm(0o755), &root()).unwrap();
                        let path = format!("{}/data", dir);
                        fs.create(&path, perm(0o644), &root()).unwrap();
                        let data = random_bytes(&mut rng, 2000);
                        assert_eq!(fs.write(&path, &data, 0, &root()).unwrap(), 2000);
                        written.push((path, data));
                    }
                    written
                })
            })
            .collect();
        let collector = {
            let fs = fs.clone();
            std::thread::spawn(move || {
                for _ in 0..3 {
                    fs.collect_garbage(false).unwrap();
                    std::thread::yield_now();
                }
            })
        };

        let mut files: Vec<(String, Vec<u8>)> = Vec::new();
        for worker in workers {
            files.extend(worker.join().unwrap());
        }
        collector.join().unwrap();
        fs.collect_garbage(false).unwrap();

        assert_eq!(fs.readdir("/", &root()).unwrap().len(), 2 + 40);
        for (path, data) in &files {
            assert_eq!(read_all(&fs, path), *data);
        }
    }
}
