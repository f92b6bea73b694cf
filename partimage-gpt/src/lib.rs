#![doc = include_str!("../README.md")]

use std::{fs::File, os::unix::fs::FileExt as _};

use log::{debug, warn};
use mbr::{DOS_TYPE_GPT_PROTECTIVE, MBR_SIZE};
use part::{
    align_up, bytes_to_lba, field_cast, lba_to_bytes, round_down, to_index, AppendedPartition,
    PartitionError, PartitionKind, PartitionList, PartitionSpec, MIB, SECTOR_SIZE,
};

mod guid;

pub use guid::{
    decode_guid, encode_guid, guid_bytes, EFI_SYSTEM_PART_GUID, GUID_SIZE, LINUX_DATA_PART_GUID,
};

const BLOCK_SIZE: usize = 512;

const GPT_SIGNATURE_HEADER: &[u8; 8] = b"EFI PART";
const GPT_VERSION_HEADER: u32 = 0x0001_0000;
const GPT_HEADER_SIZE: usize = 92;
const GPT_PARTITION_NUM: usize = 128;
const GPT_PARTITION_ENTRY_SIZE: usize = 128;
const GPT_PARTITION_TABLE_SIZE: usize = GPT_PARTITION_NUM * GPT_PARTITION_ENTRY_SIZE;
const GPT_PARTITION_TABLE_SIZE_LBA: u64 = (GPT_PARTITION_TABLE_SIZE / BLOCK_SIZE) as u64;

const GPT_PRIMARY_HEADER_LBA: u64 = 1;
const GPT_PARTITION_TABLE_LBA: u64 = 2;

/// First usable LBA of the tables we create, 1MiB into the disk
pub const GPT_FIRST_USABLE_LBA: u64 = 2048;

/// Number of sectors reserved at the end of the disk for the backup header
/// and partition entries
pub const GPT_RESERVED_LBAS: u64 = GPT_PARTITION_TABLE_SIZE_LBA + 1;

const GPT_RESERVED_SIZE: usize = GPT_PARTITION_TABLE_SIZE + BLOCK_SIZE;
const GPT_RESERVED_BYTES: u64 = GPT_RESERVED_LBAS * SECTOR_SIZE;

// Protective MBR, primary header and partition entries
const GPT_PRIMARY_REGION_SIZE: usize = MBR_SIZE + BLOCK_SIZE + GPT_PARTITION_TABLE_SIZE;

const GPT_HEADER_SIZE_OFFSET: usize = 12;
const GPT_HEADER_CRC_OFFSET: usize = 16;
const GPT_HEADER_THIS_LBA_OFFSET: usize = 24;
const GPT_HEADER_OTHER_LBA_OFFSET: usize = 32;
const GPT_HEADER_FIRST_USABLE_OFFSET: usize = 40;
const GPT_HEADER_LAST_USABLE_OFFSET: usize = 48;
const GPT_HEADER_DISK_GUID_OFFSET: usize = 56;
const GPT_HEADER_TABLE_LBA_OFFSET: usize = 72;
const GPT_HEADER_NUM_PARTS_OFFSET: usize = 80;
const GPT_HEADER_PART_SIZE_OFFSET: usize = 84;
const GPT_HEADER_TABLE_CRC_OFFSET: usize = 88;

const GPT_ENTRY_TYPE_OFFSET: usize = 0;
const GPT_ENTRY_GUID_OFFSET: usize = 16;
const GPT_ENTRY_FIRST_LBA_OFFSET: usize = 32;
const GPT_ENTRY_LAST_LBA_OFFSET: usize = 40;
const GPT_ENTRY_ATTRIBUTES_OFFSET: usize = 48;

const GPT_PART_GUID_SEED: u64 = 0x4979_9a93_3a97_c4c2;

// Largest area a protective MBR entry can describe
const GPT_PMBR_MAX_SIZE: u64 = SECTOR_SIZE * (u32::MAX as u64);

fn get_le32(buf: &[u8], offset: usize) -> u32 {
    let mut val = [0; 4];
    val.copy_from_slice(&buf[offset..(offset + 4)]);

    u32::from_le_bytes(val)
}

fn put_le32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..(offset + 4)].copy_from_slice(&val.to_le_bytes());
}

fn get_le64(buf: &[u8], offset: usize) -> u64 {
    let mut val = [0; 8];
    val.copy_from_slice(&buf[offset..(offset + 8)]);

    u64::from_le_bytes(val)
}

fn put_le64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..(offset + 8)].copy_from_slice(&val.to_le_bytes());
}

fn get_guid(buf: &[u8], offset: usize) -> [u8; GUID_SIZE] {
    let mut guid = [0; GUID_SIZE];
    guid.copy_from_slice(&buf[offset..(offset + GUID_SIZE)]);

    guid
}

/// Computes the CRC32 of a GPT header, as if its CRC field was zero
#[must_use]
pub fn header_crc(header: &[u8]) -> u32 {
    let mut hdr = [0_u8; GPT_HEADER_SIZE];
    hdr.copy_from_slice(&header[..GPT_HEADER_SIZE]);
    put_le32(&mut hdr, GPT_HEADER_CRC_OFFSET, 0);

    crc32fast::hash(&hdr)
}

fn update_header_crc(header: &mut [u8]) {
    let crc = header_crc(header);
    put_le32(header, GPT_HEADER_CRC_OFFSET, crc);
}

#[derive(Debug)]
struct PrimaryRegion {
    pmbr: [u8; MBR_SIZE],
    header: [u8; BLOCK_SIZE],
    entries: Vec<u8>,
}

impl PrimaryRegion {
    fn new() -> Self {
        Self {
            pmbr: [0; MBR_SIZE],
            header: [0; BLOCK_SIZE],
            entries: vec![0; GPT_PARTITION_TABLE_SIZE],
        }
    }

    fn read(file: &File) -> Result<Self, PartitionError> {
        let mut buf = vec![0_u8; GPT_PRIMARY_REGION_SIZE];
        file.read_exact_at(&mut buf, 0)?;

        let mut region = Self::new();
        region.pmbr.copy_from_slice(&buf[..MBR_SIZE]);
        region
            .header
            .copy_from_slice(&buf[MBR_SIZE..(MBR_SIZE + BLOCK_SIZE)]);
        region
            .entries
            .copy_from_slice(&buf[(MBR_SIZE + BLOCK_SIZE)..]);

        Ok(region)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(GPT_PRIMARY_REGION_SIZE);
        buf.extend_from_slice(&self.pmbr);
        buf.extend_from_slice(&self.header);
        buf.extend_from_slice(&self.entries);

        buf
    }

    fn num_parts(&self) -> u32 {
        get_le32(&self.header, GPT_HEADER_NUM_PARTS_OFFSET)
    }

    fn disk_guid(&self) -> [u8; GUID_SIZE] {
        get_guid(&self.header, GPT_HEADER_DISK_GUID_OFFSET)
    }

    fn update_crcs(&mut self, num_parts: usize) {
        let table_crc = crc32fast::hash(&self.entries[..(num_parts * GPT_PARTITION_ENTRY_SIZE)]);
        put_le32(&mut self.header, GPT_HEADER_TABLE_CRC_OFFSET, table_crc);

        update_header_crc(&mut self.header);
    }

    /// Checks that the primary header is one we can work with, and returns
    /// the number of partition entries
    fn check(&self) -> Result<usize, PartitionError> {
        let header = &self.header;

        if &header[0..8] != GPT_SIGNATURE_HEADER {
            return Err(PartitionError::Format(String::from("Missing GPT signature")));
        }

        let header_size = get_le32(header, GPT_HEADER_SIZE_OFFSET);
        if to_index(header_size)? != GPT_HEADER_SIZE {
            return Err(PartitionError::Format(format!(
                "Header size {header_size}, expected {GPT_HEADER_SIZE}"
            )));
        }

        let stored_crc = get_le32(header, GPT_HEADER_CRC_OFFSET);
        let crc = header_crc(header);
        if stored_crc != crc {
            return Err(PartitionError::Format(format!(
                "Primary header has invalid CRC {stored_crc:#x}, expected {crc:#x}"
            )));
        }

        let entry_size = get_le32(header, GPT_HEADER_PART_SIZE_OFFSET);
        if to_index(entry_size)? != GPT_PARTITION_ENTRY_SIZE {
            return Err(PartitionError::Format(format!(
                "Partition entries of {entry_size} bytes"
            )));
        }

        let num_parts = to_index(self.num_parts())?;
        if num_parts == 0 {
            return Err(PartitionError::Format(String::from(
                "Partition entry array is empty",
            )));
        }

        if num_parts > GPT_PARTITION_NUM {
            return Err(PartitionError::Unsupported(format!(
                "{num_parts} partition entries"
            )));
        }

        let table_lba = get_le64(header, GPT_HEADER_TABLE_LBA_OFFSET);
        if table_lba != GPT_PARTITION_TABLE_LBA {
            return Err(PartitionError::Format(format!(
                "Partition entries start at LBA {table_lba}"
            )));
        }

        let first_usable = get_le64(header, GPT_HEADER_FIRST_USABLE_OFFSET);
        let table_lbas = field_cast::<u64, usize>(
            (num_parts * GPT_PARTITION_ENTRY_SIZE).div_ceil(BLOCK_SIZE),
            "Partition Table LBAs",
        )?;
        if first_usable < GPT_PARTITION_TABLE_LBA + table_lbas {
            return Err(PartitionError::Format(format!(
                "{num_parts} partition entries bleed into first usable LBA {first_usable}"
            )));
        }

        let stored_crc = get_le32(header, GPT_HEADER_TABLE_CRC_OFFSET);
        let crc = crc32fast::hash(&self.entries[..(num_parts * GPT_PARTITION_ENTRY_SIZE)]);
        if stored_crc != crc {
            return Err(PartitionError::Format(format!(
                "Partition entries have invalid CRC {stored_crc:#x}, expected {crc:#x}"
            )));
        }

        Ok(num_parts)
    }

    /// Walks the partition entries, and returns the partitions found, the
    /// index of the first free entry and the end of the last partition.
    fn scan(&self, num_parts: usize, disk_size: u64) -> Result<EntryScan, PartitionError> {
        let usable_end = disk_size.saturating_sub(GPT_RESERVED_BYTES);

        let mut scan = EntryScan {
            parts: PartitionList::new(),
            free: None,
            end: lba_to_bytes(get_le64(&self.header, GPT_HEADER_FIRST_USABLE_OFFSET))?,
        };

        for (idx, entry) in self
            .entries
            .chunks_exact(GPT_PARTITION_ENTRY_SIZE)
            .take(num_parts)
            .enumerate()
        {
            let ordinal: u32 = field_cast(idx + 1, "Partition Number")?;
            let type_guid = get_guid(entry, GPT_ENTRY_TYPE_OFFSET);

            if type_guid == [0; GUID_SIZE] {
                if scan.free.is_none() {
                    scan.free = Some(idx);
                }

                continue;
            }

            if let Some(free) = scan.free {
                return Err(PartitionError::Format(format!(
                    "Partition {ordinal} found after free entry {}",
                    free + 1
                )));
            }

            let first_lba = get_le64(entry, GPT_ENTRY_FIRST_LBA_OFFSET);
            let last_lba = get_le64(entry, GPT_ENTRY_LAST_LBA_OFFSET);
            if last_lba < first_lba {
                return Err(PartitionError::Format(format!(
                    "Partition {ordinal}: strange bounds [{first_lba}, {last_lba}]"
                )));
            }

            let start = lba_to_bytes(first_lba)?;
            let end = lba_to_bytes(last_lba)?
                .checked_add(SECTOR_SIZE)
                .ok_or_else(|| PartitionError::Format(format!("Partition {ordinal} overflows")))?;

            if start < scan.end {
                return Err(PartitionError::Format(format!(
                    "Partition {ordinal}: overlapping or not in disk order ({start}, {})",
                    end - start
                )));
            }

            if end > usable_end {
                return Err(PartitionError::Format(format!(
                    "Partition {ordinal} ends at {end}, past the usable area ({usable_end})"
                )));
            }

            let kind = if type_guid == guid_bytes(&LINUX_DATA_PART_GUID) {
                PartitionKind::Linux
            } else if type_guid == guid_bytes(&EFI_SYSTEM_PART_GUID) {
                PartitionKind::EfiSystem
            } else {
                PartitionKind::Other(decode_guid(&type_guid))
            };

            debug!("Partition {ordinal}: {kind}, LBAs {first_lba} to {last_lba}");

            scan.parts
                .push(PartitionSpec::new(ordinal, kind, start, end - start));
            scan.end = end;
        }

        Ok(scan)
    }
}

#[derive(Debug)]
struct EntryScan {
    parts: PartitionList,
    free: Option<usize>,
    end: u64,
}

fn type_guid(kind: &PartitionKind) -> [u8; GUID_SIZE] {
    match kind {
        PartitionKind::Linux => guid_bytes(&LINUX_DATA_PART_GUID),
        PartitionKind::EfiSystem => guid_bytes(&EFI_SYSTEM_PART_GUID),
        PartitionKind::Unknown | PartitionKind::Other(_) => {
            encode_guid(kind.as_str()).unwrap_or_else(|err| {
                warn!("Couldn't handle partition type {kind}: {err}");
                [0; GUID_SIZE]
            })
        }
    }
}

/// Derives the unique GUID of a partition from the disk GUID, its type GUID,
/// its ordinal and its offset.
///
/// Identical inputs always lead to the same GUID, so that images are
/// reproducible.
#[must_use]
pub fn partition_guid(
    disk_guid: &[u8; GUID_SIZE],
    type_guid: &[u8; GUID_SIZE],
    ordinal: u32,
    start: u64,
) -> [u8; GUID_SIZE] {
    let seed = GPT_PART_GUID_SEED.rotate_left(ordinal & 63) ^ (start >> 20).wrapping_add(u64::from(ordinal));

    let mut guid = [0; GUID_SIZE];
    put_le64(
        &mut guid,
        0,
        get_le64(disk_guid, 0) ^ get_le64(type_guid, 0) ^ seed,
    );
    put_le64(
        &mut guid,
        8,
        get_le64(disk_guid, 8) ^ get_le64(type_guid, 8) ^ seed,
    );

    guid
}

fn write_entry(
    entries: &mut [u8],
    disk_guid: &[u8; GUID_SIZE],
    ordinal: u32,
    kind: &PartitionKind,
    start: u64,
    size: u64,
) -> Result<(), PartitionError> {
    let first_lba = bytes_to_lba(start)?;
    let last_lba = bytes_to_lba(
        start
            .checked_add(size)
            .ok_or_else(|| PartitionError::Range(format!("Partition {ordinal} end")))?,
    )?
    .checked_sub(1)
    .filter(|last| *last >= first_lba)
    .ok_or_else(|| PartitionError::Input(format!("Partition {ordinal} is empty")))?;

    let idx = to_index(ordinal - 1)? * GPT_PARTITION_ENTRY_SIZE;
    let entry = &mut entries[idx..(idx + GPT_PARTITION_ENTRY_SIZE)];

    let type_guid = type_guid(kind);
    entry[GPT_ENTRY_TYPE_OFFSET..(GPT_ENTRY_TYPE_OFFSET + GUID_SIZE)].copy_from_slice(&type_guid);
    entry[GPT_ENTRY_GUID_OFFSET..(GPT_ENTRY_GUID_OFFSET + GUID_SIZE)]
        .copy_from_slice(&partition_guid(disk_guid, &type_guid, ordinal, start));
    put_le64(entry, GPT_ENTRY_FIRST_LBA_OFFSET, first_lba);
    put_le64(entry, GPT_ENTRY_LAST_LBA_OFFSET, last_lba);

    // No attribute flags or partition name
    entry[GPT_ENTRY_ATTRIBUTES_OFFSET..].fill(0);

    debug!("Partition {ordinal}: {kind}, LBAs {first_lba} to {last_lba}");

    Ok(())
}

fn protect_mbr(pmbr: &mut [u8; MBR_SIZE], disk_size: u64) -> Result<(), PartitionError> {
    let size = disk_size.min(GPT_PMBR_MAX_SIZE) - SECTOR_SIZE;

    debug!("Protective MBR covers {size} bytes");

    let parts: PartitionList = [PartitionSpec::new(
        1,
        PartitionKind::Unknown,
        SECTOR_SIZE,
        size,
    )
    .type_code(DOS_TYPE_GPT_PROTECTIVE)]
    .into_iter()
    .collect();

    mbr::write_parts(pmbr, &parts)
}

/// Builds the trailing region holding the backup entries, followed by the
/// backup header in the last sector of the disk
fn backup_region(
    header: &[u8; BLOCK_SIZE],
    entries: &[u8],
    num_parts: usize,
    last_lba: u64,
) -> Vec<u8> {
    let mut trailer = vec![0_u8; GPT_RESERVED_SIZE];

    let backup = &mut trailer[GPT_PARTITION_TABLE_SIZE..];
    backup[..GPT_HEADER_SIZE].copy_from_slice(&header[..GPT_HEADER_SIZE]);
    put_le64(backup, GPT_HEADER_THIS_LBA_OFFSET, last_lba);
    put_le64(backup, GPT_HEADER_OTHER_LBA_OFFSET, GPT_PRIMARY_HEADER_LBA);
    put_le64(
        backup,
        GPT_HEADER_TABLE_LBA_OFFSET,
        last_lba - GPT_PARTITION_TABLE_SIZE_LBA,
    );
    update_header_crc(backup);

    let other_lba = get_le64(header, GPT_HEADER_OTHER_LBA_OFFSET);
    if other_lba != last_lba {
        warn!("GPT doesn't have its backup at LBA {last_lba}, but {other_lba}");
    }

    let table_size = num_parts * GPT_PARTITION_ENTRY_SIZE;
    trailer[..table_size].copy_from_slice(&entries[..table_size]);

    trailer
}

fn last_lba(disk_size: u64) -> Result<u64, PartitionError> {
    let last_lba = (disk_size / SECTOR_SIZE).saturating_sub(1);

    if last_lba <= GPT_FIRST_USABLE_LBA + GPT_RESERVED_LBAS {
        return Err(PartitionError::NoSpace(format!(
            "Disk too small ({disk_size} bytes) to retain sane partition alignment"
        )));
    }

    Ok(last_lba)
}

fn persist(
    file: &File,
    region: &PrimaryRegion,
    trailer: &[u8],
    disk_size: u64,
) -> Result<(), PartitionError> {
    let trailer_offset = disk_size - GPT_RESERVED_BYTES;

    debug!("Writing primary GPT at 0, backup GPT at {trailer_offset}");

    file.write_all_at(&region.to_bytes(), 0)?;
    file.write_all_at(trailer, trailer_offset)?;
    file.sync_data()?;

    Ok(())
}

/// Writes a list of partitions as a GUID Partition Table, along with its
/// protective MBR and backup header.
///
/// The first usable LBA is always 2048. Partition unique GUIDs are derived
/// from the table content, so identical inputs produce identical tables.
///
/// # Errors
///
/// Returns [`PartitionError::NoSpace`] if the disk is too small for the table,
/// [`PartitionError::Input`] if the disk GUID is malformed, if ordinals aren't
/// contiguous from 1 or if a partition starts before the first usable LBA,
/// [`PartitionError::Unsupported`] for ordinals above 128, and
/// [`PartitionError::Layout`] if the list doesn't fit the usable area.
pub fn write_parts(
    file: &File,
    parts: &PartitionList,
    disk_guid: &str,
    disk_size: u64,
) -> Result<(), PartitionError> {
    let disk_size = round_down(disk_size, SECTOR_SIZE);
    let last_lba = last_lba(disk_size)?;
    let last_usable = last_lba - GPT_RESERVED_LBAS;

    debug!("Disk of {disk_size} bytes, last LBA {last_lba}, last usable LBA {last_usable}");

    parts.validate(lba_to_bytes(last_usable + 1)?)?;

    let disk_guid = encode_guid(disk_guid)
        .map_err(|err| PartitionError::Input(format!("Bad disk GUID: {err}")))?;

    let mut region = PrimaryRegion::new();
    let header = &mut region.header;
    header[0..8].copy_from_slice(GPT_SIGNATURE_HEADER);
    put_le32(header, 8, GPT_VERSION_HEADER);
    put_le32(
        header,
        GPT_HEADER_SIZE_OFFSET,
        field_cast(GPT_HEADER_SIZE, "Header Size")?,
    );
    put_le64(header, GPT_HEADER_THIS_LBA_OFFSET, GPT_PRIMARY_HEADER_LBA);
    put_le64(header, GPT_HEADER_OTHER_LBA_OFFSET, last_lba);
    put_le64(header, GPT_HEADER_FIRST_USABLE_OFFSET, GPT_FIRST_USABLE_LBA);
    put_le64(header, GPT_HEADER_LAST_USABLE_OFFSET, last_usable);
    header[GPT_HEADER_DISK_GUID_OFFSET..(GPT_HEADER_DISK_GUID_OFFSET + GUID_SIZE)]
        .copy_from_slice(&disk_guid);
    put_le64(header, GPT_HEADER_TABLE_LBA_OFFSET, GPT_PARTITION_TABLE_LBA);
    put_le32(
        header,
        GPT_HEADER_NUM_PARTS_OFFSET,
        field_cast(GPT_PARTITION_NUM, "Number of Partitions")?,
    );
    put_le32(
        header,
        GPT_HEADER_PART_SIZE_OFFSET,
        field_cast(GPT_PARTITION_ENTRY_SIZE, "Partition Entry Size")?,
    );

    let first_usable = lba_to_bytes(GPT_FIRST_USABLE_LBA)?;
    for (expected, part) in (1_u32..).zip(parts.listed()) {
        if part.ordinal != expected {
            return Err(PartitionError::Input(format!(
                "Expected partition {expected} but got partition {}",
                part.ordinal
            )));
        }

        if to_index(part.ordinal)? > GPT_PARTITION_NUM {
            return Err(PartitionError::Unsupported(format!(
                "Partition number {} above highest supported number {GPT_PARTITION_NUM}",
                part.ordinal
            )));
        }

        if part.start < first_usable {
            return Err(PartitionError::Input(format!(
                "Partition {} starts at {} (below first usable offset {first_usable})",
                part.ordinal, part.start
            )));
        }

        if part.start % MIB != 0 {
            warn!("Partition {} not aligned to a 1MiB boundary", part.ordinal);
        }

        write_entry(
            &mut region.entries,
            &disk_guid,
            part.ordinal,
            &part.kind,
            part.start,
            part.size,
        )?;
    }

    region.update_crcs(GPT_PARTITION_NUM);
    protect_mbr(&mut region.pmbr, disk_size)?;

    let trailer = backup_region(
        &region.header,
        &region.entries,
        GPT_PARTITION_NUM,
        last_lba,
    );

    persist(file, &region, &trailer, disk_size)
}

/// Reads the partitions of an existing GUID Partition Table
///
/// # Errors
///
/// Returns [`PartitionError::Format`] if the primary header or entries are
/// malformed, their checksums don't match, or entries aren't 128 bytes wide,
/// and [`PartitionError::Unsupported`] for more than 128 entries.
pub fn read_parts(file: &File, disk_size: u64) -> Result<PartitionList, PartitionError> {
    let disk_size = round_down(disk_size, SECTOR_SIZE);
    let region = PrimaryRegion::read(file)?;
    let num_parts = region.check()?;

    Ok(region.scan(num_parts, disk_size)?.parts)
}

/// Appends a Linux partition that consumes all the space left after the last
/// partition of an existing GUID Partition Table.
///
/// The partition starts on the next 1MiB boundary. The backup header is
/// (re)written at the end of the disk, which allows to grow a table after
/// the disk itself has been enlarged. The protective MBR is only refreshed
/// if one was already there.
///
/// # Errors
///
/// Returns [`PartitionError::Format`] if the existing table is malformed,
/// [`PartitionError::Range`] if the requested ordinal isn't the first free
/// entry, and [`PartitionError::NoSpace`] if there's no free entry or less than
/// 1MiB left.
pub fn add_last(
    file: &File,
    ordinal: Option<u32>,
    disk_size: u64,
) -> Result<AppendedPartition, PartitionError> {
    let disk_size = round_down(disk_size, SECTOR_SIZE);
    let mut region = PrimaryRegion::read(file)?;
    let num_parts = region.check()?;
    let scan = region.scan(num_parts, disk_size)?;

    let slot = scan.free.unwrap_or(num_parts);
    let next: u32 = field_cast(slot + 1, "Partition Number")?;
    if let Some(requested) = ordinal {
        if requested != next {
            return Err(PartitionError::Range(format!(
                "Found available partition {next}, not equal to expected partition {requested}"
            )));
        }
    }

    if scan.free.is_none() {
        return Err(PartitionError::NoSpace(format!(
            "All partition entries ({num_parts}) already used"
        )));
    }

    let last_lba = last_lba(disk_size)?;
    let usable_end = disk_size - GPT_RESERVED_BYTES;
    let start = align_up(scan.end, 20)?;
    if start >= usable_end || usable_end - start < MIB {
        return Err(PartitionError::NoSpace(format!(
            "Less than 1MiB left after {start} in a disk of {disk_size} bytes"
        )));
    }

    let size = usable_end - start;

    let other_lba = get_le64(&region.header, GPT_HEADER_OTHER_LBA_OFFSET);
    if other_lba == last_lba {
        debug!("Backup GPT at LBA {last_lba} will be overwritten");
    } else {
        warn!("Moving backup GPT LBA {other_lba} -> {last_lba}");
    }

    put_le64(&mut region.header, GPT_HEADER_OTHER_LBA_OFFSET, last_lba);
    put_le64(
        &mut region.header,
        GPT_HEADER_LAST_USABLE_OFFSET,
        last_lba - GPT_RESERVED_LBAS,
    );

    let disk_guid = region.disk_guid();
    write_entry(
        &mut region.entries,
        &disk_guid,
        next,
        &PartitionKind::Linux,
        start,
        size,
    )?;

    region.update_crcs(num_parts);

    let trailer = backup_region(&region.header, &region.entries, num_parts, last_lba);

    if mbr::is_present(&region.pmbr) {
        protect_mbr(&mut region.pmbr, disk_size)?;
    } else {
        debug!("No protective MBR, leaving sector 0 alone");
    }

    persist(file, &region, &trailer, disk_size)?;

    Ok(AppendedPartition {
        ordinal: next,
        start,
        size,
    })
}

/// Returns the textual disk GUID of an existing GUID Partition Table
///
/// # Errors
///
/// Returns [`PartitionError::Format`] if the primary header is malformed
pub fn disk_guid(file: &File) -> Result<String, PartitionError> {
    let region = PrimaryRegion::read(file)?;
    region.check()?;

    Ok(decode_guid(&region.disk_guid()))
}
