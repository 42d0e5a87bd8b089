//! Physical extent discovery via FIEMAP.
//!
//! The rest of the workspace consumes the [`FilesystemProbe`] trait and never
//! assumes a particular kernel mechanism; [`FiemapProbe`] is the shipped
//! implementation. Holes are reported by omission, never as zero-physical
//! extents.

use frs_error::{FrsError, Result};
use frs_extent::{BlockBitmask, Extent, ExtentVector};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use tracing::{debug, trace};

/// Reads the physical layout of files and the size of devices.
pub trait FilesystemProbe {
    /// Physical extents of an open file, in bytes, covering its data exactly
    /// once, plus the bitwise OR of every offset and length reported.
    fn extents_of(&self, file: &File) -> Result<(ExtentVector<u64>, BlockBitmask<u64>)>;

    /// Byte length of a device (or regular file standing in for one).
    fn device_size(&self, file: &File) -> Result<u64>;
}

// ── FIEMAP plumbing ─────────────────────────────────────────────────────────

// From <linux/fiemap.h> and <linux/fs.h>; not exposed by the libc crate.
const FS_IOC_FIEMAP: libc::c_ulong = 0xC020_660B;
const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

const FIEMAP_FLAG_SYNC: u32 = 0x0000_0001;
const FIEMAP_EXTENT_LAST: u32 = 0x0000_0001;
const FIEMAP_EXTENT_UNKNOWN: u32 = 0x0000_0002;
const FIEMAP_EXTENT_DELALLOC: u32 = 0x0000_0004;
const FIEMAP_EXTENT_ENCODED: u32 = 0x0000_0008;

const EXTENT_BATCH: usize = 256;

// Kernel ABI mirrors; the reserved fields exist only for layout.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct FiemapExtent {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

#[repr(C)]
#[allow(dead_code)]
struct FiemapBuffer {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
    fm_extents: [FiemapExtent; EXTENT_BATCH],
}

impl FiemapBuffer {
    fn zeroed() -> Box<Self> {
        let extent = FiemapExtent {
            fe_logical: 0,
            fe_physical: 0,
            fe_length: 0,
            fe_reserved64: [0; 2],
            fe_flags: 0,
            fe_reserved: [0; 3],
        };
        Box::new(Self {
            fm_start: 0,
            fm_length: 0,
            fm_flags: 0,
            fm_mapped_extents: 0,
            fm_extent_count: 0,
            fm_reserved: 0,
            fm_extents: [extent; EXTENT_BATCH],
        })
    }
}

fn is_unsupported_errno(errno: i32) -> bool {
    errno == libc::EOPNOTSUPP || errno == libc::ENOTTY || errno == libc::ENOSYS
}

/// FIEMAP-based probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct FiemapProbe;

impl FilesystemProbe for FiemapProbe {
    fn extents_of(&self, file: &File) -> Result<(ExtentVector<u64>, BlockBitmask<u64>)> {
        let fd = file.as_raw_fd();
        let mut vector = ExtentVector::new();
        let mut bitmask = BlockBitmask::new();
        let mut buffer = FiemapBuffer::zeroed();
        let mut start = 0_u64;

        loop {
            buffer.fm_start = start;
            buffer.fm_length = u64::MAX - start;
            buffer.fm_flags = FIEMAP_FLAG_SYNC;
            buffer.fm_mapped_extents = 0;
            buffer.fm_extent_count = EXTENT_BATCH as u32;

            // SAFETY: fd is a valid open descriptor and the buffer is a
            // correctly laid out, exclusively owned fiemap request.
            let rc =
                unsafe { libc::ioctl(fd, FS_IOC_FIEMAP, &mut *buffer as *mut FiemapBuffer) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                let errno = err.raw_os_error().unwrap_or(0);
                if is_unsupported_errno(errno) {
                    return Err(FrsError::Unsupported(
                        "filesystem does not support extent mapping (FIEMAP)".to_owned(),
                    ));
                }
                return Err(FrsError::Io(err));
            }

            let mapped = buffer.fm_mapped_extents as usize;
            if mapped == 0 {
                break;
            }

            let mut saw_last = false;
            for raw in &buffer.fm_extents[..mapped.min(EXTENT_BATCH)] {
                if raw.fe_flags & (FIEMAP_EXTENT_UNKNOWN | FIEMAP_EXTENT_DELALLOC) != 0 {
                    return Err(FrsError::Unsupported(
                        "file has unallocated or delayed-allocation extents".to_owned(),
                    ));
                }
                if raw.fe_flags & FIEMAP_EXTENT_ENCODED != 0 {
                    return Err(FrsError::Unsupported(
                        "file has encoded extents, physical offsets are not usable".to_owned(),
                    ));
                }
                let extent = Extent::new(raw.fe_physical, raw.fe_logical, raw.fe_length);
                trace!(
                    target: "frs::io::probe",
                    physical = extent.physical,
                    logical = extent.logical,
                    length = extent.length,
                    "extent"
                );
                bitmask.or_extent(&extent);
                vector.push(extent);
                start = raw.fe_logical + raw.fe_length;
                saw_last |= raw.fe_flags & FIEMAP_EXTENT_LAST != 0;
            }
            if saw_last {
                break;
            }
        }

        debug!(
            target: "frs::io::probe",
            extents = vector.len(),
            bitmask = bitmask.get(),
            "probed file layout"
        );
        Ok((vector, bitmask))
    }

    fn device_size(&self, file: &File) -> Result<u64> {
        device_length_of(file)
    }
}

/// Byte length of `file`: `BLKGETSIZE64` for block devices, `fstat` size for
/// regular files (which also lets tests run against image files).
pub fn device_length_of(file: &File) -> Result<u64> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = file.metadata()?;
    if metadata.file_type().is_block_device() {
        let mut length = 0_u64;
        // SAFETY: fd is valid and BLKGETSIZE64 writes one u64.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut length as *mut u64) };
        if rc != 0 {
            return Err(FrsError::Io(std::io::Error::last_os_error()));
        }
        Ok(length)
    } else {
        Ok(metadata.len())
    }
}
