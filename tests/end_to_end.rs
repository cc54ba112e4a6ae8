//! End-to-end scenarios exercised through the public `Mount` facade.

use std::sync::Arc;

use blockfs::device::{BlockDevice, MemBlockDevice, SECTOR_SIZE};
use blockfs::{Cwd, Mount};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fresh_mount(sector_count: u32) -> Mount {
    init();
    let device: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(sector_count));
    Mount::init(device, true).unwrap()
}

#[test]
fn create_and_read_back() {
    let mount = fresh_mount(4096);
    let cwd = Cwd::none();
    assert!(mount.create(&cwd, "/a", 2048, false).is_ok());

    let entry = mount.open(&cwd, "/a").unwrap();
    let file = entry.as_file().unwrap();
    assert_eq!(file.write(&vec![b'A'; 2048]).unwrap(), 2048);
    drop(entry);

    let entry = mount.open(&cwd, "/a").unwrap();
    let file = entry.as_file().unwrap();
    let mut buf = vec![0u8; 2048];
    assert_eq!(file.read(&mut buf), 2048);
    assert!(buf.iter().all(|&b| b == b'A'));
}

#[test]
fn grow_across_indirect_boundary() {
    let mount = fresh_mount(4096);
    let cwd = Cwd::none();
    mount.create(&cwd, "/b", 0, false).unwrap();
    let entry = mount.open(&cwd, "/b").unwrap();
    let file = entry.as_file().unwrap();

    let chunk = 4 * SECTOR_SIZE;
    file.seek(chunk as u32);
    assert_eq!(file.write(&vec![b'x'; chunk]).unwrap(), chunk);
    assert_eq!(file.filesize(), (8 * SECTOR_SIZE) as u32);

    file.seek(0);
    let mut head = vec![0u8; chunk];
    assert_eq!(file.read(&mut head), chunk);
    assert!(head.iter().all(|&b| b == 0));

    file.seek(chunk as u32);
    let mut tail = vec![0u8; chunk];
    assert_eq!(file.read(&mut tail), chunk);
    assert!(tail.iter().all(|&b| b == b'x'));
}

#[test]
fn double_indirect_reach() {
    let mount = fresh_mount(4096);
    let cwd = Cwd::none();
    mount.create(&cwd, "/c", 0, false).unwrap();
    let entry = mount.open(&cwd, "/c").unwrap();
    let file = entry.as_file().unwrap();

    let double_indirect_boundary = (4 + 9 * 128) * SECTOR_SIZE;
    file.seek(double_indirect_boundary as u32);
    assert_eq!(file.write(&[0x42]).unwrap(), 1);
    assert_eq!(file.filesize(), double_indirect_boundary as u32 + 1);

    file.seek(double_indirect_boundary as u32);
    let mut one = [0u8; 1];
    assert_eq!(file.read(&mut one), 1);
    assert_eq!(one[0], 0x42);

    file.seek(0);
    let mut first_byte = [0u8; 1];
    assert_eq!(file.read(&mut first_byte), 1);
    assert_eq!(first_byte[0], 0);
}

#[test]
fn nested_directories() {
    let mount = fresh_mount(4096);
    let mut cwd = Cwd::none();
    mount.mkdir(&cwd, "/x").unwrap();
    mount.mkdir(&cwd, "/x/y").unwrap();
    mount.chdir(&mut cwd, "/x/y").unwrap();
    mount.create(&cwd, "z", 1, false).unwrap();
    mount.chdir(&mut cwd, "..").unwrap();

    let here = mount.open(&cwd, ".").unwrap();
    let mut names = Vec::new();
    while let Some(n) = mount.readdir(here.as_dir().unwrap()) {
        names.push(n);
    }
    assert_eq!(names, vec!["y"]);

    mount.chdir(&mut cwd, "/").unwrap();
    let here = mount.open(&cwd, ".").unwrap();
    let mut names = Vec::new();
    while let Some(n) = mount.readdir(here.as_dir().unwrap()) {
        names.push(n);
    }
    assert_eq!(names, vec!["x"]);

    assert!(mount.remove(&cwd, "/x").is_err());
    assert!(mount.remove(&cwd, "/x/y/z").is_ok());
    assert!(mount.remove(&cwd, "/x/y").is_ok());
    assert!(mount.remove(&cwd, "/x").is_ok());
}

#[test]
fn deny_write() {
    let mount = fresh_mount(4096);
    let cwd = Cwd::none();
    mount.create(&cwd, "/a", 8, false).unwrap();
    let opener1 = mount.open(&cwd, "/a").unwrap();
    let opener2 = mount.open(&cwd, "/a").unwrap();

    opener1.as_file().unwrap().deny_write();
    assert_eq!(opener2.as_file().unwrap().write(b"no").unwrap(), 0);
    opener1.as_file().unwrap().allow_write();
    assert_eq!(opener2.as_file().unwrap().write(b"ok").unwrap(), 2);
}

#[test]
fn shutdown_durability() {
    init();
    let device: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(4096));
    let mount = Mount::init(Arc::clone(&device), true).unwrap();
    let cwd = Cwd::none();
    mount.create(&cwd, "/d", 0, false).unwrap();
    {
        let entry = mount.open(&cwd, "/d").unwrap();
        let file = entry.as_file().unwrap();
        assert_eq!(file.write(&vec![b'k'; 1024]).unwrap(), 1024);
    }
    mount.done();

    let mount = Mount::init(Arc::clone(&device), false).unwrap();
    let entry = mount.open(&cwd, "/d").unwrap();
    let file = entry.as_file().unwrap();
    let mut out = vec![0u8; 1024];
    assert_eq!(file.read(&mut out), 1024);
    assert!(out.iter().all(|&b| b == b'k'));
}
