#![allow(missing_docs)]

use std::{
    fs::{self, File},
    os::unix::fs::{FileExt as _, MetadataExt as _, PermissionsExt as _},
    path::Path,
};

use log as _;
use nix as _;
use part::{LayoutError, PartitionError, PartitionKind, MIB};
use partimage_image::{
    assemble, create_disk, plan, Content, ExternalPartitioner, ImageOptions, PartitionRequest,
    PartitionScript, TableKind, TableWriter, DEFAULT_GPT_DISK_GUID,
};
use tempfile::TempDir;
use test_log::test;

const GPT_TRAILER: u64 = 33 * 512;

fn empty(size: u64, kind: PartitionKind) -> PartitionRequest {
    PartitionRequest::new(Content::Empty(size), kind)
}

fn content_file(
    dir: &Path,
    name: &str,
    kind: PartitionKind,
    len: u64,
    data: &[(u64, &[u8])],
) -> PartitionRequest {
    let path = dir.join(name);
    let file = File::create(&path).unwrap();
    file.set_len(len).unwrap();

    for (offset, bytes) in data {
        file.write_all_at(bytes, *offset).unwrap();
    }

    PartitionRequest::new(Content::File(path), kind)
}

fn read_at(file: &File, offset: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0; len];
    file.read_exact_at(&mut buf, offset).unwrap();
    buf
}

#[test]
fn test_content_tokens() {
    assert_eq!("*".parse::<Content>().unwrap(), Content::Wildcard);
    assert_eq!("+4M".parse::<Content>().unwrap(), Content::Empty(4 * MIB));
    assert_eq!(
        "rootfs.img".parse::<Content>().unwrap(),
        Content::File("rootfs.img".into())
    );
    assert!(matches!(
        "+4Q".parse::<Content>(),
        Err(PartitionError::Input(_))
    ));
    assert!(matches!("".parse::<Content>(), Err(PartitionError::Input(_))));
}

#[test]
fn test_plan_left_to_right() {
    let layout = plan(
        &[
            empty(3 * MIB, PartitionKind::EfiSystem),
            empty(MIB + 1, PartitionKind::Linux),
            empty(MIB, PartitionKind::Linux),
        ],
        &ImageOptions::default(),
    )
    .unwrap();

    let placed: Vec<_> = layout
        .parts
        .iter()
        .map(|p| (p.ordinal, p.start, p.size))
        .collect();
    assert_eq!(
        placed,
        [
            (1, MIB, 3 * MIB),
            (2, 4 * MIB, 2 * MIB),
            (3, 6 * MIB, MIB)
        ]
    );

    assert_eq!(layout.disk_size, 8 * MIB);
}

#[test]
fn test_plan_dos_has_no_trailer() {
    let options = ImageOptions {
        table: TableKind::Dos,
        ..ImageOptions::default()
    };

    let layout = plan(&[empty(MIB, PartitionKind::Linux)], &options).unwrap();
    assert_eq!(layout.disk_size, 2 * MIB);
}

#[test]
fn test_plan_base() {
    let options = ImageOptions {
        base: Some(3 * MIB + 1),
        ..ImageOptions::default()
    };

    let layout = plan(&[empty(MIB, PartitionKind::Linux)], &options).unwrap();
    assert_eq!(layout.parts.last().unwrap().start, 4 * MIB);
}

#[test]
fn test_assemble_weak_alignment() {
    let dir = TempDir::new().unwrap();
    let options = ImageOptions {
        align_bits: 12,
        ..ImageOptions::default()
    };

    let layout = plan(&[empty(5000, PartitionKind::Linux)], &options).unwrap();
    let part = layout.parts.last().unwrap();
    assert_eq!(part.start, MIB);
    assert_eq!(part.size, 8192);
    assert_eq!(layout.disk_size, 4096 * 263);

    let disk = create_disk(&dir.path().join("disk.img")).unwrap();
    assemble(
        &disk,
        &layout,
        &mut TableWriter::new(options.table, options.label()),
    )
    .unwrap();

    let parts = gpt::read_parts(&disk, layout.disk_size).unwrap();
    let found: Vec<_> = parts.iter().map(|p| (p.ordinal, p.start, p.size)).collect();
    assert_eq!(found, [(1, MIB, 8192)]);
}

#[test]
fn test_plan_weak_alignment_base() {
    let options = ImageOptions {
        align_bits: 12,
        base: Some(2 * MIB + 1),
        ..ImageOptions::default()
    };

    let layout = plan(&[empty(MIB, PartitionKind::Linux)], &options).unwrap();
    assert_eq!(layout.parts.last().unwrap().start, 2 * MIB + 4096);
}

#[test]
fn test_plan_alignment_too_small() {
    let options = ImageOptions {
        align_bits: 8,
        ..ImageOptions::default()
    };

    assert!(matches!(
        plan(&[empty(MIB, PartitionKind::Linux)], &options),
        Err(PartitionError::Input(_))
    ));
}

#[test]
fn test_plan_wildcard_needs_size() {
    assert!(matches!(
        plan(
            &[PartitionRequest::new(Content::Wildcard, PartitionKind::Linux)],
            &ImageOptions::default()
        ),
        Err(PartitionError::Input(_))
    ));
}

#[test]
fn test_plan_wildcard() {
    let options = ImageOptions {
        size: Some(64 * MIB),
        ..ImageOptions::default()
    };

    let layout = plan(
        &[
            empty(MIB, PartitionKind::EfiSystem),
            PartitionRequest::new(Content::Wildcard, PartitionKind::Linux),
        ],
        &options,
    )
    .unwrap();

    let last = layout.parts.last().unwrap();
    assert_eq!(last.start, 2 * MIB);
    assert_eq!(last.end(), 64 * MIB - GPT_TRAILER);
    assert_eq!(layout.disk_size, 64 * MIB);
}

#[test]
fn test_plan_size_rounded_up() {
    let options = ImageOptions {
        size: Some(10 * MIB + 1),
        ..ImageOptions::default()
    };

    let layout = plan(&[empty(MIB, PartitionKind::Linux)], &options).unwrap();
    assert_eq!(layout.disk_size, 11 * MIB);
}

#[test]
fn test_plan_doesnt_fit() {
    let options = ImageOptions {
        size: Some(4 * MIB),
        ..ImageOptions::default()
    };

    assert!(matches!(
        plan(&[empty(8 * MIB, PartitionKind::Linux)], &options),
        Err(PartitionError::NoSpace(_))
    ));
}

#[test]
fn test_plan_wildcard_no_space_left() {
    let options = ImageOptions {
        size: Some(4 * MIB),
        ..ImageOptions::default()
    };

    assert!(matches!(
        plan(
            &[
                empty(3 * MIB, PartitionKind::Linux),
                PartitionRequest::new(Content::Wildcard, PartitionKind::Linux)
            ],
            &options
        ),
        Err(PartitionError::NoSpace(_))
    ));
}

#[test]
fn test_plan_empty_file_rejected() {
    let dir = TempDir::new().unwrap();

    assert!(matches!(
        plan(
            &[
                content_file(dir.path(), "empty.img", PartitionKind::Linux, 0, &[]),
                empty(MIB, PartitionKind::Linux)
            ],
            &ImageOptions::default()
        ),
        Err(PartitionError::Layout(LayoutError::Overlap { ordinal: 1 }))
    ));
}

#[test]
fn test_plan_missing_file() {
    let dir = TempDir::new().unwrap();
    let request = PartitionRequest::new(
        Content::File(dir.path().join("missing.img")),
        PartitionKind::Linux,
    );

    assert!(matches!(
        plan(&[request], &ImageOptions::default()),
        Err(PartitionError::Io(_))
    ));
}

#[test]
fn test_create_disk_exists() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("disk.img");
    fs::write(&path, b"").unwrap();

    assert!(matches!(create_disk(&path), Err(PartitionError::Io(_))));
}

#[test]
fn test_assemble_gpt() {
    let dir = TempDir::new().unwrap();
    let esp = content_file(
        dir.path(),
        "esp.img",
        PartitionKind::EfiSystem,
        1000,
        &[(0, &[0xee; 1000])],
    );
    let root = content_file(
        dir.path(),
        "root.img",
        PartitionKind::Linux,
        3 * MIB,
        &[(0, &[0x42; 4096])],
    );

    let options = ImageOptions::default();
    let layout = plan(&[esp, root], &options).unwrap();

    let disk = create_disk(&dir.path().join("disk.img")).unwrap();
    assemble(
        &disk,
        &layout,
        &mut TableWriter::new(options.table, options.label()),
    )
    .unwrap();

    assert_eq!(disk.metadata().unwrap().len(), 6 * MIB);

    let parts = gpt::read_parts(&disk, 6 * MIB).unwrap();
    let found: Vec<_> = parts
        .iter()
        .map(|p| (p.ordinal, p.kind.clone(), p.start, p.size))
        .collect();
    assert_eq!(
        found,
        [
            (1, PartitionKind::EfiSystem, MIB, MIB),
            (2, PartitionKind::Linux, 2 * MIB, 3 * MIB)
        ]
    );
    assert_eq!(gpt::disk_guid(&disk).unwrap(), DEFAULT_GPT_DISK_GUID);

    let esp_data = read_at(&disk, MIB, 1024);
    assert!(esp_data[..1000].iter().all(|b| *b == 0xee));
    assert!(esp_data[1000..].iter().all(|b| *b == 0));

    let root_data = read_at(&disk, 2 * MIB, 8192);
    assert!(root_data[..4096].iter().all(|b| *b == 0x42));
    assert!(root_data[4096..].iter().all(|b| *b == 0));
}

#[test]
fn test_assemble_dos() {
    let dir = TempDir::new().unwrap();
    let options = ImageOptions {
        table: TableKind::Dos,
        label: Some(String::from("0xdeadbeef")),
        size: Some(16 * MIB),
        ..ImageOptions::default()
    };

    let layout = plan(
        &[
            empty(MIB, PartitionKind::EfiSystem),
            PartitionRequest::new(Content::Wildcard, PartitionKind::Linux),
        ],
        &options,
    )
    .unwrap();

    let disk = create_disk(&dir.path().join("disk.img")).unwrap();
    assemble(
        &disk,
        &layout,
        &mut TableWriter::new(options.table, options.label()),
    )
    .unwrap();

    let sector = mbr::read_sector(&disk).unwrap();
    assert_eq!(mbr::disk_signature(&sector), 0xdead_beef);

    let parts = mbr::read_parts(&sector).unwrap();
    let found: Vec<_> = parts
        .iter()
        .map(|p| (p.ordinal, p.kind.clone(), p.start, p.size))
        .collect();
    assert_eq!(
        found,
        [
            (1, PartitionKind::EfiSystem, MIB, MIB),
            (2, PartitionKind::Linux, 2 * MIB, 14 * MIB)
        ]
    );
}

#[test]
fn test_assemble_dos_bad_label() {
    let dir = TempDir::new().unwrap();
    let options = ImageOptions {
        table: TableKind::Dos,
        label: Some(String::from("0x1deadbeef")),
        ..ImageOptions::default()
    };

    let layout = plan(&[empty(MIB, PartitionKind::Linux)], &options).unwrap();
    let disk = create_disk(&dir.path().join("disk.img")).unwrap();

    assert!(matches!(
        assemble(
            &disk,
            &layout,
            &mut TableWriter::new(options.table, options.label())
        ),
        Err(PartitionError::Input(_))
    ));
}

#[test]
fn test_assemble_sparse_source() {
    let dir = TempDir::new().unwrap();
    let data = vec![0x5a_u8; 1 << 20];
    let request = content_file(
        dir.path(),
        "sparse.img",
        PartitionKind::Linux,
        2 * MIB,
        &[(MIB, &data)],
    );

    let options = ImageOptions::default();
    let layout = plan(&[request], &options).unwrap();

    let disk = create_disk(&dir.path().join("disk.img")).unwrap();
    assemble(
        &disk,
        &layout,
        &mut TableWriter::new(options.table, options.label()),
    )
    .unwrap();

    let hole = read_at(&disk, MIB, 1 << 20);
    assert!(hole.iter().all(|b| *b == 0));
    assert_eq!(read_at(&disk, 2 * MIB, 1 << 20), data);

    let source_allocated = fs::metadata(dir.path().join("sparse.img")).unwrap().blocks() * 512;
    if source_allocated < 2 * MIB {
        // The partition table takes a few sectors at both ends of the disk
        let disk_allocated = disk.metadata().unwrap().blocks() * 512;
        assert!(
            disk_allocated < 2 * MIB,
            "Disk has {disk_allocated} bytes allocated"
        );
    }
}

#[test]
fn test_partition_script() {
    let layout = plan(
        &[
            empty(MIB, PartitionKind::EfiSystem),
            empty(4 * MIB, PartitionKind::Linux),
        ],
        &ImageOptions::default(),
    )
    .unwrap();

    assert_eq!(
        PartitionScript::new(DEFAULT_GPT_DISK_GUID, &layout.parts).to_string(),
        "label: gpt\n\
         label-id: 3782C3EE-1C16-F042-82A8-D6A40FB7CFAD\n\
         1024KiB 1024KiB U -\n\
         2048KiB 4096KiB L -\n"
    );
}

#[test]
fn test_external_partitioner() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("partitioner.sh");
    fs::write(&script, "#!/bin/sh\ncat > \"$1.script\"\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let options = ImageOptions::default();
    let layout = plan(&[empty(MIB, PartitionKind::Linux)], &options).unwrap();

    let disk_path = dir.path().join("disk.img");
    let disk = create_disk(&disk_path).unwrap();
    assemble(
        &disk,
        &layout,
        &mut ExternalPartitioner::new(script.into_os_string(), disk_path.clone(), options.label()),
    )
    .unwrap();

    let received = fs::read_to_string(dir.path().join("disk.img.script")).unwrap();
    assert_eq!(
        received,
        PartitionScript::new(options.label(), &layout.parts).to_string()
    );
}

#[test]
fn test_external_partitioner_failure() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("partitioner.sh");
    fs::write(&script, "#!/bin/sh\ncat > /dev/null\nexit 3\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let options = ImageOptions::default();
    let layout = plan(&[empty(MIB, PartitionKind::Linux)], &options).unwrap();

    let disk_path = dir.path().join("disk.img");
    let disk = create_disk(&disk_path).unwrap();

    assert!(matches!(
        assemble(
            &disk,
            &layout,
            &mut ExternalPartitioner::new(script.into_os_string(), disk_path, options.label()),
        ),
        Err(PartitionError::Partitioner(3))
    ));
}
