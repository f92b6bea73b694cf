#![doc = include_str!("../README.md")]

use std::{fs::File, os::unix::fs::FileExt as _};

use bit_field::BitField as _;
use log::{debug, warn};
use part::{
    bytes_to_lba, field_cast, lba_to_bytes, round_down, AppendedPartition, PartitionError,
    PartitionKind, PartitionList, PartitionSpec, MIB, SECTOR_SIZE,
};

/// Size of the Master Boot Record, in bytes
pub const MBR_SIZE: usize = 512;

const MBR_DISK_SIGNATURE_OFFSET_BYTES: usize = 440;
const MBR_PART_ENTRY_OFFSET_BYTES: usize = 446;
const MBR_PART_ENTRY_SIZE_BYTES: usize = 16;
const MBR_PART_ENTRY_NUM: usize = 4;
const MBR_PART_TABLE_SIZE_BYTES: usize = MBR_PART_ENTRY_SIZE_BYTES * MBR_PART_ENTRY_NUM;
const MBR_BOOT_SIGNATURE_OFFSET_BYTES: usize = 510;
const MBR_BOOT_SIGNATURE: [u8; 2] = [0x55, 0xaa];

const MBR_CHS_LBA_ONLY: [u8; 3] = [0xfe, 0xff, 0xff];
const MBR_ACTIVE_BIT: usize = 7;

// Where the first partition lands when appending to an empty table
const MBR_EMPTY_TABLE_START_LBA: u64 = 2048;

/// DOS Partition Type for Linux data partitions
pub const DOS_TYPE_LINUX: u8 = 0x83;

/// DOS Partition Type for EFI System Partitions
pub const DOS_TYPE_EFI_SYSTEM: u8 = 0xef;

/// DOS Partition Type of the entry of a GPT Protective MBR
pub const DOS_TYPE_GPT_PROTECTIVE: u8 = 0xee;

/// Returns the DOS partition type matching a [`PartitionKind`]
#[must_use]
pub fn dos_type(kind: &PartitionKind) -> u8 {
    match kind {
        PartitionKind::EfiSystem => DOS_TYPE_EFI_SYSTEM,
        PartitionKind::Linux | PartitionKind::Unknown | PartitionKind::Other(_) => DOS_TYPE_LINUX,
    }
}

fn has_boot_signature(mbr: &[u8; MBR_SIZE]) -> bool {
    mbr[MBR_BOOT_SIGNATURE_OFFSET_BYTES..] == MBR_BOOT_SIGNATURE
}

/// Returns true if the sector carries the `55 AA` boot signature
#[must_use]
pub fn is_present(mbr: &[u8; MBR_SIZE]) -> bool {
    has_boot_signature(mbr)
}

/// Returns the 32-bit disk identifier
#[must_use]
pub fn disk_signature(mbr: &[u8; MBR_SIZE]) -> u32 {
    let mut sig = [0; 4];
    sig.copy_from_slice(
        &mbr[MBR_DISK_SIGNATURE_OFFSET_BYTES..(MBR_DISK_SIGNATURE_OFFSET_BYTES + 4)],
    );

    u32::from_le_bytes(sig)
}

/// Sets the 32-bit disk identifier
pub fn set_disk_signature(mbr: &mut [u8; MBR_SIZE], sig: u32) {
    debug!("Using Disk Identifier 0x{sig:x}");

    mbr[MBR_DISK_SIGNATURE_OFFSET_BYTES..(MBR_DISK_SIGNATURE_OFFSET_BYTES + 4)]
        .copy_from_slice(&sig.to_le_bytes());
}

fn encode_entry(part: &PartitionSpec) -> Result<[u8; MBR_PART_ENTRY_SIZE_BYTES], PartitionError> {
    let type_code = part.type_code.unwrap_or_else(|| dos_type(&part.kind));

    let start_lba = bytes_to_lba(part.start)?;
    if start_lba < 1 {
        return Err(PartitionError::Range(format!(
            "Partition {} can't start at LBA 0",
            part.ordinal
        )));
    }

    let start_lba: u32 = field_cast(start_lba, "Start LBA")?;
    let size_lba: u32 = field_cast(bytes_to_lba(part.size)?, "Size")?;

    let mut bits = 0_u8;
    bits.set_bit(MBR_ACTIVE_BIT, type_code == DOS_TYPE_EFI_SYSTEM);

    let mut entry = [0_u8; MBR_PART_ENTRY_SIZE_BYTES];
    entry[0] = bits;
    entry[1..4].copy_from_slice(&MBR_CHS_LBA_ONLY);
    entry[4] = type_code;
    entry[5..8].copy_from_slice(&MBR_CHS_LBA_ONLY);
    entry[8..12].copy_from_slice(&start_lba.to_le_bytes());
    entry[12..16].copy_from_slice(&size_lba.to_le_bytes());

    debug!(
        "Partition {}: Type 0x{type_code:02x}, Start LBA {start_lba}, {size_lba} LBAs",
        part.ordinal
    );

    Ok(entry)
}

/// Writes a list of partitions as a DOS partition table.
///
/// Only the partition table and the boot signature are modified, the boot
/// code and disk identifier are left untouched. Hidden entries are skipped.
///
/// # Errors
///
/// Returns [`PartitionError::Input`] if a listed ordinal is outside of `1..=4` or
/// ordinals aren't strictly increasing, and [`PartitionError::Range`] if an offset
/// or size doesn't fit in the 32-bit LBA fields. Nothing is written in either case.
pub fn write_parts(mbr: &mut [u8; MBR_SIZE], parts: &PartitionList) -> Result<(), PartitionError> {
    let mut count = 0_usize;
    let mut prev: Option<u32> = None;
    for part in parts.listed() {
        let valid_ordinal = usize::try_from(part.ordinal)
            .is_ok_and(|ordinal| (1..=MBR_PART_ENTRY_NUM).contains(&ordinal));

        if !valid_ordinal {
            return Err(PartitionError::Input(format!(
                "Partition {} not valid for DOS",
                part.ordinal
            )));
        }

        if let Some(prev) = prev {
            if prev >= part.ordinal {
                return Err(PartitionError::Input(format!(
                    "Partition {prev} comes before {}",
                    part.ordinal
                )));
            }
        }

        prev = Some(part.ordinal);
        count += 1;
    }

    if count > MBR_PART_ENTRY_NUM {
        return Err(PartitionError::Input(format!(
            "Can't write {count} partitions to DOS"
        )));
    }

    let mut table = [0_u8; MBR_PART_TABLE_SIZE_BYTES];
    for part in parts.listed() {
        let entry = encode_entry(part)?;

        let idx = usize::try_from(part.ordinal - 1)
            .map_err(|_err| PartitionError::Range(format!("Partition {}", part.ordinal)))?
            * MBR_PART_ENTRY_SIZE_BYTES;

        table[idx..(idx + MBR_PART_ENTRY_SIZE_BYTES)].copy_from_slice(&entry);
    }

    mbr[MBR_PART_ENTRY_OFFSET_BYTES..(MBR_PART_ENTRY_OFFSET_BYTES + MBR_PART_TABLE_SIZE_BYTES)]
        .copy_from_slice(&table);
    mbr[MBR_BOOT_SIGNATURE_OFFSET_BYTES..].copy_from_slice(&MBR_BOOT_SIGNATURE);

    Ok(())
}

/// Parses the primary partitions of a DOS partition table
///
/// # Errors
///
/// Returns [`PartitionError::Format`] if the boot signature is missing.
pub fn read_parts(mbr: &[u8; MBR_SIZE]) -> Result<PartitionList, PartitionError> {
    if !has_boot_signature(mbr) {
        return Err(PartitionError::Format(format!(
            "Missing boot record, got bytes {:x} {:x}",
            mbr[MBR_BOOT_SIGNATURE_OFFSET_BYTES],
            mbr[MBR_BOOT_SIGNATURE_OFFSET_BYTES + 1]
        )));
    }

    let mut parts = PartitionList::new();
    for (idx, desc) in mbr
        [MBR_PART_ENTRY_OFFSET_BYTES..(MBR_PART_ENTRY_OFFSET_BYTES + MBR_PART_TABLE_SIZE_BYTES)]
        .chunks_exact(MBR_PART_ENTRY_SIZE_BYTES)
        .enumerate()
    {
        let ordinal: u32 = field_cast(idx + 1, "Partition Number")?;
        let type_code = desc[4];

        let kind = match type_code {
            0 => continue,
            DOS_TYPE_LINUX => PartitionKind::Linux,
            DOS_TYPE_EFI_SYSTEM => PartitionKind::EfiSystem,
            DOS_TYPE_GPT_PROTECTIVE => {
                warn!("Partition {ordinal} looks like a protective MBR");
                PartitionKind::Unknown
            }
            _ => {
                warn!("Unrecognized partition type in p{ordinal}: 0x{type_code:02x}");
                PartitionKind::Unknown
            }
        };

        let start_lba = u32::from_le_bytes([desc[8], desc[9], desc[10], desc[11]]);
        let size_lba = u32::from_le_bytes([desc[12], desc[13], desc[14], desc[15]]);
        if start_lba == 0 || size_lba == 0 {
            warn!("Partition {ordinal} might only use CHS addressing");
        }

        debug!("Partition {ordinal}: Type 0x{type_code:02x}, Start LBA {start_lba}, {size_lba} LBAs");

        parts.push(
            PartitionSpec::new(
                ordinal,
                kind,
                lba_to_bytes(start_lba.into())?,
                lba_to_bytes(size_lba.into())?,
            )
            .type_code(type_code),
        );
    }

    Ok(parts)
}

/// Appends a Linux partition that consumes all the disk space left after the
/// last partition of the table, and re-encodes the whole table.
///
/// If an ordinal is requested, it must be the one right after the last
/// partition.
///
/// # Errors
///
/// Returns [`PartitionError::NoSpace`] if all 4 entries are used or if less than
/// 1MiB is left, [`PartitionError::Input`] if the requested ordinal isn't the next
/// one, and a [`PartitionError::Layout`] if the existing table doesn't fit
/// the disk.
pub fn add_last(
    mbr: &mut [u8; MBR_SIZE],
    ordinal: Option<u32>,
    disk_size: u64,
) -> Result<AppendedPartition, PartitionError> {
    let mut parts = read_parts(mbr)?;

    let count = parts.listed_count();
    if count == MBR_PART_ENTRY_NUM {
        return Err(PartitionError::NoSpace(format!(
            "All {MBR_PART_ENTRY_NUM} DOS partitions already used"
        )));
    }

    let next: u32 = field_cast(count + 1, "Partition Number")?;
    if let Some(requested) = ordinal {
        if requested != next {
            return Err(PartitionError::Input(format!(
                "Cannot set partition {requested}, {count} partitions present"
            )));
        }
    }

    let disk_size = round_down(disk_size, SECTOR_SIZE);
    parts.validate(disk_size)?;

    let start = match parts.last() {
        Some(last) => last.end(),
        None => lba_to_bytes(MBR_EMPTY_TABLE_START_LBA)?,
    };

    if start >= disk_size {
        return Err(PartitionError::NoSpace(format!(
            "Last partition start {start} won't fit in disk of {disk_size} bytes"
        )));
    }

    let size = disk_size - start;
    if size < MIB {
        return Err(PartitionError::NoSpace(format!(
            "Only {size} bytes left after the last partition"
        )));
    }

    debug!("Appending partition {next} at {start}, {size} bytes");

    parts.push(PartitionSpec::new(next, PartitionKind::Linux, start, size).type_code(DOS_TYPE_LINUX));
    write_parts(mbr, &parts)?;

    Ok(AppendedPartition {
        ordinal: next,
        start,
        size,
    })
}

/// Reads the first sector of a disk
///
/// # Errors
///
/// Returns [`PartitionError::Io`] if the sector can't be read entirely
pub fn read_sector(file: &File) -> Result<[u8; MBR_SIZE], PartitionError> {
    let mut mbr = [0_u8; MBR_SIZE];
    file.read_exact_at(&mut mbr, 0)?;

    Ok(mbr)
}

/// Writes the first sector of a disk
///
/// # Errors
///
/// Returns [`PartitionError::Io`] if the sector can't be written entirely
pub fn write_sector(file: &File, mbr: &[u8; MBR_SIZE]) -> Result<(), PartitionError> {
    file.write_all_at(mbr, 0)?;
    file.sync_data()?;

    Ok(())
}
