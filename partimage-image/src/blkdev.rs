use core::ffi::{c_char, c_int, c_longlong, c_void};
use std::{
    fs::File,
    io,
    os::{fd::AsRawFd as _, unix::fs::FileTypeExt as _},
};

use log::debug;
use nix::libc::size_t;
use part::{field_cast, AppendedPartition, PartitionError};

const BLKPG_ADD_PARTITION: c_int = 1;
const BLKPG_DEVNAMELTH: usize = 64;
const BLKPG_VOLNAMELTH: usize = 64;

#[repr(C)]
struct BlkpgPartition {
    start: c_longlong,
    length: c_longlong,
    pno: c_int,
    devname: [c_char; BLKPG_DEVNAMELTH],
    volname: [c_char; BLKPG_VOLNAMELTH],
}

#[repr(C)]
struct BlkpgIoctlArg {
    op: c_int,
    flags: c_int,
    datalen: c_int,
    data: *mut c_void,
}

// create unsafe ioctl wrappers
#[allow(clippy::missing_safety_doc)]
mod ioctl {
    use nix::{ioctl_read, ioctl_write_ptr_bad, request_code_none};

    use super::{size_t, BlkpgIoctlArg};

    ioctl_read!(blkgetsize64, 0x12, 114, size_t);
    ioctl_write_ptr_bad!(blkpg, request_code_none!(0x12, 105), BlkpgIoctlArg);
}

/// Returns the size of a file, or the capacity of a block device
///
/// # Errors
///
/// Returns [`PartitionError::Io`] if the file metadata can't be read
pub fn file_size(file: &File) -> Result<u64, PartitionError> {
    let metadata = file.metadata()?;
    let len = metadata.len();

    if len != 0 || !metadata.file_type().is_block_device() {
        return Ok(len);
    }

    let mut size: size_t = 0;

    // SAFETY: size is a valid, writable, size_t for the whole call
    match unsafe { ioctl::blkgetsize64(file.as_raw_fd(), &mut size) } {
        Ok(_) => {
            debug!("Block device has a capacity of {size} bytes");
            Ok(field_cast(size, "Block Device Size")?)
        }
        Err(err) => {
            debug!("Couldn't query the block device size: {err}");
            Ok(0)
        }
    }
}

/// Asks the kernel to register a partition that has just been added to the
/// partition table of a block device
///
/// # Errors
///
/// Returns [`PartitionError::Io`] if the kernel refuses the partition, and
/// [`PartitionError::Range`] if its offset or size can't be expressed.
pub fn kernel_add_partition(disk: &File, part: &AppendedPartition) -> Result<(), PartitionError> {
    let mut blkpg_part = BlkpgPartition {
        start: field_cast(part.start, "Partition Start")?,
        length: field_cast(part.size, "Partition Length")?,
        pno: field_cast(part.ordinal, "Partition Number")?,
        devname: [0; BLKPG_DEVNAMELTH],
        volname: [0; BLKPG_VOLNAMELTH],
    };

    let arg = BlkpgIoctlArg {
        op: BLKPG_ADD_PARTITION,
        flags: 0,
        datalen: field_cast(core::mem::size_of::<BlkpgPartition>(), "BLKPG Data Length")?,
        data: core::ptr::addr_of_mut!(blkpg_part).cast(),
    };

    debug!(
        "Adding partition {} to the kernel, {} + {}",
        part.ordinal, part.start, part.size
    );

    // SAFETY: arg and the partition it points to outlive the call
    unsafe { ioctl::blkpg(disk.as_raw_fd(), &arg) }.map_err(io::Error::from)?;

    Ok(())
}
