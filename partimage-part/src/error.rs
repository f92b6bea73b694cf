use std::io;

/// A partition list invariant violation, as found by [`crate::PartitionList::validate`]
#[derive(thiserror::Error, Clone, Debug, Eq, PartialEq)]
pub enum LayoutError {
    /// The entry ends past the disk limit
    #[error("Partition {ordinal} ({start} + {size}) doesn't fit in {limit} bytes")]
    DoesNotFit {
        /// Ordinal of the offending entry
        ordinal: u32,

        /// Start offset, in bytes
        start: u64,

        /// Size, in bytes
        size: u64,

        /// Disk limit, in bytes
        limit: u64,
    },

    /// The entry overlaps with, or comes after, the next entry in the list
    #[error("Partition {ordinal} overlaps with the next partition")]
    Overlap {
        /// Ordinal of the offending entry
        ordinal: u32,
    },

    /// Two listed entries have out-of-order ordinals
    #[error("Partition numbers ({first}, {second}) out of order")]
    OutOfOrder {
        /// Ordinal of the earlier entry
        first: u32,

        /// Ordinal of the later entry
        second: u32,
    },

    /// The entry offset or size isn't a multiple of the sector size
    #[error("Partition {ordinal} isn't sector aligned")]
    Unaligned {
        /// Ordinal of the offending entry
        ordinal: u32,
    },
}

/// Our Error Type
#[derive(thiserror::Error, Debug)]
pub enum PartitionError {
    /// An existing partition table is malformed or unrecognized
    #[error("Malformed Partition Table: {0}")]
    Format(String),

    /// A numeric value doesn't fit in its on-disk field
    #[error("Value Out of Range: {0}")]
    Range(String),

    /// A caller-supplied ordinal, kind or size is invalid
    #[error("Invalid Input: {0}")]
    Input(String),

    /// There's no room left for the requested region
    #[error("No Space Left: {0}")]
    NoSpace(String),

    /// The table is valid, but uses a variant we don't handle
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The partition list doesn't hold its invariants
    #[error("Invalid Layout")]
    Layout(#[from] LayoutError),

    /// The external partitioner exited with a failure code
    #[error("External Partitioner Failed with Exit Code {0}")]
    Partitioner(i32),

    /// An error has occurred when accessing the disk or the content files
    #[error("I/O Error")]
    Io(#[from] io::Error),
}
