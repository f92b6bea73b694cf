use core::fmt;
use std::fs::File;

use log::warn;

use crate::{LayoutError, SECTOR_SIZE};

/// Partition Kind, a short tag resolved to a type by each table codec
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum PartitionKind {
    /// Generic Linux data partition ("L")
    Linux,

    /// EFI System Partition ("U")
    EfiSystem,

    /// Unknown or raw partition ("?")
    Unknown,

    /// Explicit type, usually a GUID in its textual form
    Other(String),
}

impl PartitionKind {
    /// Returns the textual tag of the kind
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Linux => "L",
            Self::EfiSystem => "U",
            Self::Unknown => "?",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for PartitionKind {
    fn from(s: &str) -> Self {
        match s {
            "L" => Self::Linux,
            "U" => Self::EfiSystem,
            "?" => Self::Unknown,
            _ => Self::Other(s.to_owned()),
        }
    }
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External content for a partition: a readable file and its logical size
#[derive(Debug)]
pub struct PartitionSource {
    file: File,
    size: u64,
}

impl PartitionSource {
    /// Creates a new content source out of a [`File`] and the number of bytes to use from it
    #[must_use]
    pub fn new(file: File, size: u64) -> Self {
        Self { file, size }
    }

    /// Returns the underlying [`File`]
    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Returns the logical size of the content, in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// A planned or parsed partition
#[derive(Debug)]
pub struct PartitionSpec {
    /// 1-based slot number. Only meaningful when the partition isn't hidden.
    pub ordinal: u32,

    /// Partition Kind
    pub kind: PartitionKind,

    /// Start offset, in bytes
    pub start: u64,

    /// Size, in bytes
    pub size: u64,

    /// Content to populate the partition with. Partitions without any are
    /// left zero-filled.
    pub source: Option<PartitionSource>,

    /// Reserved area that isn't an actual partition
    pub hidden: bool,

    /// DOS partition type byte. Derived from the kind if unset.
    pub type_code: Option<u8>,
}

impl PartitionSpec {
    /// Creates a new, listed, partition without any content
    #[must_use]
    pub fn new(ordinal: u32, kind: PartitionKind, start: u64, size: u64) -> Self {
        Self {
            ordinal,
            kind,
            start,
            size,
            source: None,
            hidden: false,
            type_code: None,
        }
    }

    /// Sets the partition content
    #[must_use]
    pub fn source(mut self, source: PartitionSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Sets the DOS partition type byte
    #[must_use]
    pub fn type_code(mut self, code: u8) -> Self {
        self.type_code = Some(code);
        self
    }

    /// Marks the area as reserved
    #[must_use]
    pub fn hidden(mut self, val: bool) -> Self {
        self.hidden = val;
        self
    }

    /// Returns the offset right past the end of the partition, in bytes
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }
}

/// Placement of a partition appended to an existing table
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AppendedPartition {
    /// Ordinal the partition was given
    pub ordinal: u32,

    /// Start offset, in bytes
    pub start: u64,

    /// Size, in bytes
    pub size: u64,
}

/// An ordered, offset-ascending, list of partitions
#[derive(Debug, Default)]
pub struct PartitionList {
    parts: Vec<PartitionSpec>,
}

impl PartitionList {
    /// Creates an empty partition list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a partition to the end of the list
    pub fn push(&mut self, part: PartitionSpec) {
        self.parts.push(part);
    }

    /// Returns the number of entries, hidden ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Returns true if the list has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Returns an iterator over all the entries
    pub fn iter(&self) -> core::slice::Iter<'_, PartitionSpec> {
        self.parts.iter()
    }

    /// Returns an iterator over the entries that aren't hidden
    pub fn listed(&self) -> impl Iterator<Item = &PartitionSpec> {
        self.parts.iter().filter(|p| !p.hidden)
    }

    /// Returns the number of entries that aren't hidden
    #[must_use]
    pub fn listed_count(&self) -> usize {
        self.listed().count()
    }

    /// Returns the last entry of the list
    #[must_use]
    pub fn last(&self) -> Option<&PartitionSpec> {
        self.parts.last()
    }

    /// Checks that every entry fits within `disk_limit` bytes, that entries are
    /// sector aligned, ordered and don't overlap, and that the listed ordinals
    /// are strictly increasing.
    ///
    /// The whole list is dumped to the log if anything is wrong.
    ///
    /// # Errors
    ///
    /// Returns the first [`LayoutError`] found.
    pub fn validate(&self, disk_limit: u64) -> Result<(), LayoutError> {
        let mut first_err = None;
        let mut record = |err: LayoutError| {
            warn!("{err}");

            if first_err.is_none() {
                first_err = Some(err);
            }
        };

        let mut prev_listed: Option<u32> = None;
        for (idx, part) in self.parts.iter().enumerate() {
            if part.start % SECTOR_SIZE != 0 || part.size % SECTOR_SIZE != 0 {
                record(LayoutError::Unaligned {
                    ordinal: part.ordinal,
                });
            }

            if part
                .start
                .checked_add(part.size)
                .map_or(true, |end| end > disk_limit)
            {
                record(LayoutError::DoesNotFit {
                    ordinal: part.ordinal,
                    start: part.start,
                    size: part.size,
                    limit: disk_limit,
                });
            }

            if let Some(next) = self.parts.get(idx + 1) {
                if part.start >= next.start || part.end() > next.start {
                    record(LayoutError::Overlap {
                        ordinal: part.ordinal,
                    });
                }
            }

            if !part.hidden {
                if let Some(prev) = prev_listed {
                    if prev >= part.ordinal {
                        record(LayoutError::OutOfOrder {
                            first: prev,
                            second: part.ordinal,
                        });
                    }
                }

                prev_listed = Some(part.ordinal);
            }
        }

        match first_err {
            Some(err) => {
                self.dump();
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn dump(&self) {
        for part in &self.parts {
            if part.hidden {
                warn!("reserved: {} + {} {}", part.start, part.size, part.kind);
            } else {
                warn!(
                    "p{}: {} + {} {}",
                    part.ordinal, part.start, part.size, part.kind
                );
            }
        }
    }
}

impl FromIterator<PartitionSpec> for PartitionList {
    fn from_iter<I: IntoIterator<Item = PartitionSpec>>(iter: I) -> Self {
        Self {
            parts: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for PartitionList {
    type Item = PartitionSpec;
    type IntoIter = std::vec::IntoIter<PartitionSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.parts.into_iter()
    }
}

impl<'a> IntoIterator for &'a PartitionList {
    type Item = &'a PartitionSpec;
    type IntoIter = core::slice::Iter<'a, PartitionSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.parts.iter()
    }
}
