#![doc = include_str!("../README.md")]

use core::str::FromStr;
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use part::{
    align_up, PartitionError, PartitionKind, PartitionList, PartitionSource, PartitionSpec, MIB,
    SECTOR_SIZE,
};

mod blkdev;
mod sink;
mod size;
mod sparse;

pub use blkdev::{file_size, kernel_add_partition};
pub use sink::{ExternalPartitioner, PartitionScript, PartitionTableSink, TableWriter};
pub use size::{aligned_size, parse_dos_label, parse_size};
pub use sparse::{copy_sparse, next_data, next_hole};

/// Default partition alignment, in bits
pub const DEFAULT_ALIGN_BITS: u32 = 20;

/// Smallest partition alignment, one sector
pub const MIN_ALIGN_BITS: u32 = 9;

/// Disk GUID used for GPT images if none is given
pub const DEFAULT_GPT_DISK_GUID: &str = "3782C3EE-1C16-F042-82A8-D6A40FB7CFAD";

/// Disk identifier used for DOS images if none is given
pub const DEFAULT_DOS_DISK_SIGNATURE: &str = "0x77777777";

/// Partition table format of an image
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TableKind {
    /// GUID Partition Table
    #[default]
    Gpt,

    /// DOS Partition Table
    Dos,
}

impl TableKind {
    /// Space to leave at the end of the disk, in bytes
    #[must_use]
    pub fn trailer_size(self) -> u64 {
        match self {
            Self::Gpt => gpt::GPT_RESERVED_LBAS * SECTOR_SIZE,
            Self::Dos => 0,
        }
    }

    /// Label used if none is given
    #[must_use]
    pub fn default_label(self) -> &'static str {
        match self {
            Self::Gpt => DEFAULT_GPT_DISK_GUID,
            Self::Dos => DEFAULT_DOS_DISK_SIGNATURE,
        }
    }
}

/// What to fill a partition with
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Content {
    /// Empty partition, taking all the space left on the disk (`*`)
    Wildcard,

    /// Empty partition of a given size (`+SIZE`)
    Empty(u64),

    /// Partition holding the content of a file or block device
    File(PathBuf),
}

impl FromStr for Content {
    type Err = PartitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Self::Wildcard);
        }

        if let Some(size) = s.strip_prefix('+') {
            return Ok(Self::Empty(parse_size(size)?));
        }

        if s.is_empty() {
            return Err(PartitionError::Input(String::from("Empty partition content")));
        }

        Ok(Self::File(PathBuf::from(s)))
    }
}

/// A partition to put in an image
#[derive(Clone, Debug)]
pub struct PartitionRequest {
    /// Partition content
    pub content: Content,

    /// Partition kind
    pub kind: PartitionKind,
}

impl PartitionRequest {
    /// Creates a new partition request
    #[must_use]
    pub fn new(content: Content, kind: PartitionKind) -> Self {
        Self { content, kind }
    }
}

/// Image layout options
#[derive(Clone, Debug)]
pub struct ImageOptions {
    /// Partitions start and size alignment, in bits
    pub align_bits: u32,

    /// Offset of the first partition, in bytes. Defaults to 1MiB, aligned up.
    pub base: Option<u64>,

    /// Total disk size, in bytes. Defaults to the smallest size fitting all
    /// partitions.
    pub size: Option<u64>,

    /// Partition table format
    pub table: TableKind,

    /// Disk GUID or DOS disk identifier
    pub label: Option<String>,
}

impl ImageOptions {
    /// Returns the disk label, or the default one for the table format
    #[must_use]
    pub fn label(&self) -> &str {
        self.label
            .as_deref()
            .unwrap_or_else(|| self.table.default_label())
    }
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            align_bits: DEFAULT_ALIGN_BITS,
            base: None,
            size: None,
            table: TableKind::default(),
            label: None,
        }
    }
}

/// Placement of every partition of an image, and its total size
#[derive(Debug)]
pub struct ImageLayout {
    /// Partitions, with their content
    pub parts: PartitionList,

    /// Disk size, in bytes
    pub disk_size: u64,
}

/// Places the requested partitions one after the other, each one aligned,
/// and computes the disk size. File contents are opened and their size
/// queried.
///
/// # Errors
///
/// Returns [`PartitionError::Input`] if the alignment is below a sector or if
/// a wildcard partition is requested without a disk size,
/// [`PartitionError::NoSpace`] if the partitions don't fit in the requested
/// size, and [`PartitionError::Io`] if a content file can't be opened.
pub fn plan(
    requests: &[PartitionRequest],
    options: &ImageOptions,
) -> Result<ImageLayout, PartitionError> {
    let bits = options.align_bits;
    if bits < MIN_ALIGN_BITS {
        return Err(PartitionError::Input(format!(
            "Alignment {bits} below minimum alignment {MIN_ALIGN_BITS}"
        )));
    }

    if bits < DEFAULT_ALIGN_BITS {
        warn!("Alignment {bits} below recommended alignment of {DEFAULT_ALIGN_BITS}");
    }

    let trailer = options.table.trailer_size();
    let requested_size = options.size.map(|size| align_up(size, bits)).transpose()?;
    let mut offset = align_up(options.base.unwrap_or(MIB), bits)?;

    debug!("First partition at {offset}, disk size {requested_size:?}, trailer of {trailer} bytes");

    let mut parts = PartitionList::new();
    for (idx, request) in requests.iter().enumerate() {
        let ordinal = u32::try_from(idx + 1)
            .map_err(|_err| PartitionError::Range(format!("Partition {}", idx + 1)))?;

        let (size, source) = match &request.content {
            Content::Wildcard => {
                let Some(disk_size) = requested_size else {
                    return Err(PartitionError::Input(String::from(
                        "Cannot use a wildcard partition size without a disk size",
                    )));
                };

                let usable = disk_size.saturating_sub(trailer);
                if offset >= usable {
                    return Err(PartitionError::NoSpace(String::from(
                        "No space remaining for wildcard partition",
                    )));
                }

                (usable - offset, None)
            }
            Content::Empty(size) => (align_up(*size, bits)?, None),
            Content::File(path) => {
                let file = File::open(path)?;
                let len = file_size(&file)?;

                debug!("Content {} is {len} bytes", path.display());

                (align_up(len, bits)?, Some(PartitionSource::new(file, len)))
            }
        };

        info!("p{ordinal}: {offset} + {size} {}", request.kind);

        let mut spec = PartitionSpec::new(ordinal, request.kind.clone(), offset, size);
        if let Some(source) = source {
            spec = spec.source(source);
        }
        parts.push(spec);

        offset = offset
            .checked_add(size)
            .ok_or_else(|| PartitionError::Range(format!("Partition {ordinal} end")))?;
    }

    let end = align_up(
        offset
            .checked_add(trailer)
            .ok_or_else(|| PartitionError::Range(String::from("Disk size")))?,
        bits,
    )?;

    let disk_size = match requested_size {
        Some(size) if end > size => {
            return Err(PartitionError::NoSpace(format!(
                "Partitions ({end} bytes) do not fit in {size} bytes"
            )));
        }
        Some(size) => size,
        None => end,
    };

    parts.validate(disk_size - trailer)?;

    Ok(ImageLayout { parts, disk_size })
}

/// Creates a new disk image file. The file must not exist.
///
/// # Errors
///
/// Returns [`PartitionError::Io`] if the file exists or can't be created
pub fn create_disk(path: &Path) -> Result<File, PartitionError> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?)
}

/// Sizes the disk, writes its partition table through `sink`, and copies
/// every partition content in place.
///
/// # Errors
///
/// Returns the [`PartitionError`] of the table creation, and
/// [`PartitionError::Io`] if the disk can't be resized or a content copy fails.
pub fn assemble(
    disk: &File,
    layout: &ImageLayout,
    sink: &mut dyn PartitionTableSink,
) -> Result<(), PartitionError> {
    debug!("Sizing disk to {} bytes", layout.disk_size);
    disk.set_len(layout.disk_size)?;

    sink.write_table(disk, layout)?;

    for part in &layout.parts {
        if let Some(source) = &part.source {
            info!(
                "Copying {} bytes to partition {} at {}",
                source.size(),
                part.ordinal,
                part.start
            );

            copy_sparse(source.file(), disk, part.start, source.size())?;
        }
    }

    disk.sync_data()?;

    Ok(())
}
