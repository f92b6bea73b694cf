use std::{
    fs::File,
    io,
    os::{fd::AsRawFd as _, unix::fs::FileExt as _},
};

use log::{debug, trace};
use nix::{
    errno::Errno,
    libc::off_t,
    unistd::{lseek, Whence},
};
use part::{field_cast, to_index, PartitionError};

const COPY_CHUNK_SIZE: usize = 1 << 20;

fn seek(file: &File, offset: u64, whence: Whence) -> Result<Option<u64>, PartitionError> {
    let offset: off_t = field_cast(offset, "Source Offset")?;

    match lseek(file.as_raw_fd(), offset, whence) {
        Ok(pos) => Ok(Some(field_cast(pos, "Source Offset")?)),
        Err(Errno::ENXIO) => Ok(None),
        Err(err) => Err(io::Error::from(err).into()),
    }
}

/// Returns the offset of the first byte of data at or after `offset`, or
/// [`None`] if there's only a hole left until the end of the file
///
/// # Errors
///
/// Returns [`PartitionError::Io`] if the file can't be queried
pub fn next_data(file: &File, offset: u64) -> Result<Option<u64>, PartitionError> {
    seek(file, offset, Whence::SeekData)
}

/// Returns the offset of the first hole at or after `offset`. The end of the
/// file counts as a hole.
///
/// # Errors
///
/// Returns [`PartitionError::Io`] if the file can't be queried
pub fn next_hole(file: &File, offset: u64) -> Result<Option<u64>, PartitionError> {
    seek(file, offset, Whence::SeekHole)
}

fn copy_extent(
    src: &File,
    dst: &File,
    start: u64,
    end: u64,
    dst_offset: u64,
    buf: &mut [u8],
) -> Result<(), PartitionError> {
    trace!("Copying data extent [{start}, {end})");

    let mut pos = start;
    while pos < end {
        let len = to_index(end - pos)?.min(buf.len());
        let chunk = &mut buf[..len];

        src.read_exact_at(chunk, pos)?;

        let target = dst_offset
            .checked_add(pos)
            .ok_or_else(|| PartitionError::Range(format!("Destination offset {pos}")))?;
        dst.write_all_at(chunk, target)?;

        pos += field_cast::<u64, usize>(len, "Chunk Length")?;
    }

    Ok(())
}

/// Copies the first `len` bytes of `src` into `dst`, starting at `dst_offset`.
///
/// Only the data extents of the source are copied, its holes are skipped so
/// they stay holes in the destination, if it supports them. Returns the
/// number of bytes actually copied.
///
/// # Errors
///
/// Returns [`PartitionError::Io`] if any read, write or extent query fails.
pub fn copy_sparse(
    src: &File,
    dst: &File,
    dst_offset: u64,
    len: u64,
) -> Result<u64, PartitionError> {
    let mut buf = vec![0_u8; COPY_CHUNK_SIZE];
    let mut copied = 0;
    let mut pos = 0;

    while pos < len {
        let Some(data) = next_data(src, pos)? else {
            break;
        };

        if data >= len {
            break;
        }

        let hole = next_hole(src, data)?.unwrap_or(len).min(len);
        copy_extent(src, dst, data, hole, dst_offset, &mut buf)?;

        copied += hole - data;
        pos = hole;
    }

    debug!("Copied {copied} bytes out of {len} to offset {dst_offset}");

    Ok(copied)
}
