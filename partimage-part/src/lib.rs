#![doc = include_str!("../README.md")]

use core::{
    fmt,
    ops::{Div, Mul},
};

use num_traits::ToPrimitive;

mod error;
mod list;

pub use error::{LayoutError, PartitionError};
pub use list::{
    AppendedPartition, PartitionKind, PartitionList, PartitionSource, PartitionSpec,
};

/// Size of a sector (or LBA), in bytes
pub const SECTOR_SIZE: u64 = 512;

/// Size of a Mebibyte, the alignment most partitioning tools default to
pub const MIB: u64 = 1 << 20;

/// Returns a rounded down number to the nearest multiple
///
/// # Panics
///
/// If the multiple is zero.
pub fn round_down<T>(number: T, multiple: T) -> T
where
    T: Copy + Div<Output = T> + Mul<Output = T>,
{
    let div = number / multiple;

    div * multiple
}

/// Rounds a byte offset or width up to a multiple of `1 << bits`
///
/// # Errors
///
/// Returns [`PartitionError::Range`] if the result doesn't fit in a [`u64`]
pub fn align_up(number: u64, bits: u32) -> Result<u64, PartitionError> {
    let multiple = 1_u64
        .checked_shl(bits)
        .ok_or_else(|| PartitionError::Range(format!("Alignment of {bits} bits")))?;

    let mask = multiple - 1;
    number
        .checked_add(mask)
        .map(|n| n & !mask)
        .ok_or_else(|| PartitionError::Range(format!("{number} aligned to {bits} bits")))
}

/// Converts a value to the integer type of an on-disk field
///
/// # Errors
///
/// Returns [`PartitionError::Range`] if the value doesn't fit
pub fn field_cast<T, V>(value: V, field: &str) -> Result<T, PartitionError>
where
    T: TryFrom<V>,
    V: Copy + fmt::Display,
{
    T::try_from(value).map_err(|_err| {
        PartitionError::Range(format!(
            "{field} value {value} doesn't fit in {}",
            core::any::type_name::<T>()
        ))
    })
}

/// Converts a byte offset to an LBA
///
/// # Errors
///
/// Returns [`PartitionError::Input`] if the offset isn't sector aligned
pub fn bytes_to_lba(bytes: u64) -> Result<u64, PartitionError> {
    if bytes % SECTOR_SIZE != 0 {
        return Err(PartitionError::Input(format!(
            "Offset {bytes} isn't aligned to a {SECTOR_SIZE} bytes sector"
        )));
    }

    Ok(bytes / SECTOR_SIZE)
}

/// Converts an LBA to a byte offset
///
/// # Errors
///
/// Returns [`PartitionError::Range`] if the offset doesn't fit in a [`u64`]
pub fn lba_to_bytes(lba: u64) -> Result<u64, PartitionError> {
    lba.checked_mul(SECTOR_SIZE)
        .ok_or_else(|| PartitionError::Range(format!("LBA {lba} overflows a byte offset")))
}

/// Returns the value as an [`usize`] for buffer indexing
///
/// # Errors
///
/// Returns [`PartitionError::Range`] if the value doesn't fit
pub fn to_index<V: ToPrimitive + fmt::Display>(value: V) -> Result<usize, PartitionError> {
    value
        .to_usize()
        .ok_or_else(|| PartitionError::Range(format!("{value} doesn't fit in a buffer index")))
}
