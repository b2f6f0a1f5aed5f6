use std::sync::Arc;
use std::thread;

use rand::Rng;
use sector_fs::{
    BlockDevice, FileDisk, FileSystem, FsError, MemDisk, OpenFlags, Result, DEFAULT_NUM_SECTORS,
    DIRECT_DATA_COUNT, INDEX_DATA_ENTRIES, NUM_DIR_ENTRIES, SECTOR_SIZE,
};

fn fresh() -> Result<Arc<FileSystem>> {
    FileSystem::format(Arc::new(MemDisk::new(DEFAULT_NUM_SECTORS)))
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

#[test]
fn efs_test() -> Result<()> {
    let fs = fresh()?;
    fs.create("filea", 0)?;
    fs.create("fileb", 0)?;
    let names: Vec<String> = fs.list("/")?.into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, ["filea", "fileb"]);

    let filea = fs.open("filea")?;
    let greet_str = "Hello, world!";
    filea.write_at(0, greet_str.as_bytes())?;
    let mut buffer = [0u8; 233];
    let len = filea.read_at(0, &mut buffer)?;
    assert_eq!(greet_str.as_bytes(), &buffer[..len]);
    drop(filea);

    let mut random_str_test = |len: usize| -> Result<()> {
        let file = fs.open_with("filea", OpenFlags::READ_WRITE | OpenFlags::TRUNC)?;
        assert_eq!(file.read_at(0, &mut buffer)?, 0, "not cleared!");
        let data = random_bytes(len);
        let mut rng = rand::thread_rng();
        let mut written = 0;
        while written < len {
            let chunk = rng.gen_range(1..=3 * SECTOR_SIZE).min(len - written);
            assert_eq!(file.write(&data[written..written + chunk])?, chunk);
            written += chunk;
        }
        let mut read_buffer = [0u8; 127];
        let mut offset = 0usize;
        let mut read_back = Vec::new();
        loop {
            let len = file.read_at(offset, &mut read_buffer)?;
            if len == 0 {
                break;
            }
            offset += len;
            read_back.extend_from_slice(&read_buffer[..len]);
        }
        assert_eq!(read_back, data);
        Ok(())
    };

    random_str_test(4 * SECTOR_SIZE)?;
    random_str_test(8 * SECTOR_SIZE + SECTOR_SIZE / 2)?;
    random_str_test((DIRECT_DATA_COUNT + 1) * SECTOR_SIZE)?;
    random_str_test((DIRECT_DATA_COUNT + INDEX_DATA_ENTRIES) * SECTOR_SIZE + 1)?;
    random_str_test(300 * SECTOR_SIZE + SECTOR_SIZE / 7)?;
    Ok(())
}

#[test]
fn duplicate_create_changes_nothing() -> Result<()> {
    let fs = fresh()?;
    fs.create("/a", 5 * SECTOR_SIZE)?;
    let free = fs.free_sectors()?;
    let entries = fs.list("/")?;
    assert!(matches!(
        fs.create("/a", 40 * SECTOR_SIZE),
        Err(FsError::AlreadyExists(_))
    ));
    assert!(matches!(fs.mkdir("/a"), Err(FsError::AlreadyExists(_))));
    assert_eq!(fs.free_sectors()?, free);
    assert_eq!(fs.list("/")?, entries);
    Ok(())
}

#[test]
fn directory_must_be_empty_to_remove() -> Result<()> {
    let fs = fresh()?;
    let initial = fs.free_sectors()?;
    fs.mkdir("/docs")?;
    fs.mkdir("/docs/old")?;
    fs.create("/docs/old/notes.txt", 100)?;
    assert_eq!(
        fs.list("/docs")?,
        vec![("old".to_string(), true)]
    );

    assert!(matches!(
        fs.remove("/docs"),
        Err(FsError::DirectoryNotEmpty(_))
    ));
    assert!(matches!(
        fs.remove("/docs/old"),
        Err(FsError::DirectoryNotEmpty(_))
    ));
    fs.remove("/docs/old/notes.txt")?;
    fs.remove("/docs/old")?;
    let header = fs.stat("/docs")?.sector;
    fs.remove("/docs")?;
    assert!(fs.list("/")?.is_empty());
    assert_eq!(fs.free_sectors()?, initial);

    // the freed header sector is handed out again
    fs.create("/again", 0)?;
    assert_eq!(fs.stat("/again")?.sector, header);
    Ok(())
}

#[test]
fn open_files_cannot_be_removed() -> Result<()> {
    let fs = fresh()?;
    fs.create("busy", 10)?;
    let file = fs.open("busy")?;
    assert!(matches!(
        fs.remove("busy"),
        Err(FsError::InUse { handles: 1, .. })
    ));
    drop(file);
    fs.remove("busy")?;
    assert!(matches!(fs.open("busy"), Err(FsError::NotFound(_))));
    Ok(())
}

#[test]
fn path_errors() -> Result<()> {
    let fs = fresh()?;
    fs.create("plain", 0)?;
    assert!(matches!(fs.open("missing"), Err(FsError::NotFound(_))));
    assert!(matches!(fs.create("/nodir/a", 0), Err(FsError::NotFound(_))));
    assert!(matches!(fs.create("/plain/a", 0), Err(FsError::NotFound(_))));
    assert!(matches!(fs.list("/plain"), Err(FsError::NotFound(_))));
    assert!(matches!(
        fs.create("/tenletters", 0),
        Err(FsError::NameTooLong(_))
    ));
    assert!(matches!(fs.remove("/"), Err(FsError::PermissionDenied(_))));
    assert!(matches!(
        fs.open_with("/", OpenFlags::READ_WRITE),
        Err(FsError::PermissionDenied(_))
    ));
    Ok(())
}

#[test]
fn directory_capacity() -> Result<()> {
    let fs = fresh()?;
    for idx in 0..NUM_DIR_ENTRIES {
        fs.create(&format!("f{}", idx), 0)?;
    }
    let free = fs.free_sectors()?;
    assert!(matches!(
        fs.create("extra", 0),
        Err(FsError::DirectoryFull(_))
    ));
    assert_eq!(fs.free_sectors()?, free);
    Ok(())
}

#[test]
fn out_of_space_leaves_disk_untouched() -> Result<()> {
    let fs = FileSystem::format(Arc::new(MemDisk::new(64)))?;
    let free = fs.free_sectors()?;
    assert!(matches!(
        fs.create("huge", 64 * SECTOR_SIZE),
        Err(FsError::OutOfSpace { .. })
    ));
    assert_eq!(fs.free_sectors()?, free);
    assert!(fs.list("/")?.is_empty());

    fs.create("grow", 0)?;
    let file = fs.open("grow")?;
    let before = fs.free_sectors()?;
    assert!(matches!(
        file.write(&vec![1u8; 64 * SECTOR_SIZE]),
        Err(FsError::OutOfSpace { .. })
    ));
    assert_eq!(fs.free_sectors()?, before);
    assert_eq!(file.length()?, 0);
    Ok(())
}

#[test]
fn growth_keeps_earlier_content() -> Result<()> {
    let fs = fresh()?;
    fs.create("log", 0)?;
    let file = fs.open("log")?;
    let mut expected = Vec::new();
    // cross the direct table and two index blocks one record at a time
    let target = (DIRECT_DATA_COUNT + 2 * INDEX_DATA_ENTRIES + 4) * SECTOR_SIZE;
    while expected.len() < target {
        let record = random_bytes(SECTOR_SIZE / 2 + 7);
        file.write(&record)?;
        expected.extend_from_slice(&record);
    }
    file.seek(0);
    assert_eq!(file.read_all()?, expected);
    let stat = fs.stat("log")?;
    assert_eq!(stat.size, expected.len());
    assert_eq!(stat.sectors, (expected.len() + SECTOR_SIZE - 1) / SECTOR_SIZE);
    Ok(())
}

#[test]
fn small_writes_of_a_large_file() -> Result<()> {
    let fs = fresh()?;
    let initial = fs.free_sectors()?;
    let content: Vec<u8> = b"1234567890".iter().copied().cycle().take(5000).collect();
    fs.create("perf", 0)?;
    {
        let file = fs.open_with("perf", OpenFlags::WRITE_ONLY)?;
        for chunk in content.chunks(10) {
            assert_eq!(file.write(chunk)?, 10);
        }
    }
    {
        let file = fs.open_with("perf", OpenFlags::READ_ONLY)?;
        let mut chunk = [0u8; 10];
        for expected in content.chunks(10) {
            assert_eq!(file.read(&mut chunk)?, 10);
            assert_eq!(&chunk[..], expected);
        }
        assert_eq!(file.read(&mut chunk)?, 0);
    }
    fs.remove("perf")?;
    assert_eq!(fs.free_sectors()?, initial);
    Ok(())
}

#[test]
fn concurrent_files() -> Result<()> {
    let fs = fresh()?;
    let handles: Vec<_> = (0..4)
        .map(|idx| {
            let fs = Arc::clone(&fs);
            thread::spawn(move || -> Result<()> {
                let name = format!("t{}", idx);
                fs.create(&name, 0)?;
                let file = fs.open(&name)?;
                let data = random_bytes((DIRECT_DATA_COUNT + 5) * SECTOR_SIZE + idx);
                for chunk in data.chunks(100) {
                    file.write(chunk)?;
                }
                file.seek(0);
                assert_eq!(file.read_all()?, data);
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap()?;
    }
    assert_eq!(fs.list("/")?.len(), 4);
    Ok(())
}

#[test]
fn concurrent_readers_of_one_file() -> Result<()> {
    let fs = fresh()?;
    let data = random_bytes(30 * SECTOR_SIZE);
    fs.create("shared", 0)?;
    fs.open("shared")?.write(&data)?;
    let data = Arc::new(data);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let fs = Arc::clone(&fs);
            let data = Arc::clone(&data);
            thread::spawn(move || -> Result<()> {
                let file = fs.open_with("shared", OpenFlags::READ_ONLY)?;
                assert_eq!(file.read_all()?, *data);
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap()?;
    }
    Ok(())
}

#[test]
fn image_file_survives_remount() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("fs.img");
    let data = random_bytes(50 * SECTOR_SIZE + 3);
    {
        let disk: Arc<dyn BlockDevice> = Arc::new(FileDisk::create(&path, DEFAULT_NUM_SECTORS)?);
        let fs = FileSystem::format(disk)?;
        fs.mkdir("/home")?;
        fs.create("/home/blob.bin", 0)?;
        fs.open("/home/blob.bin")?.write(&data)?;
    }
    let disk: Arc<dyn BlockDevice> = Arc::new(FileDisk::open(&path)?);
    let fs = FileSystem::mount(disk)?;
    let stat = fs.stat("/home/blob.bin")?;
    assert_eq!(stat.size, data.len());
    assert_eq!(stat.file_type, "bin");
    assert_eq!(fs.open("/home/blob.bin")?.read_all()?, data);
    Ok(())
}
