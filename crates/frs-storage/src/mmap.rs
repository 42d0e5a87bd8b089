//! Owned virtual-memory reservation for the scratch region.
//!
//! The scratch region is reserved once as an anonymous `PROT_NONE` mapping,
//! then pieces of it are replaced in place with shared read-write views of
//! the device (primary storage) and of the overflow file (secondary
//! storage). Keeping one contiguous address range lets the remap worker
//! treat both as a single buffer.
//!
//! This module is the only place in the workspace that calls `mmap`; the
//! raw pointers never leave [`MappedRegion`].

use frs_error::{FrsError, Result};
use std::os::unix::io::RawFd;
use tracing::{debug, warn};

/// System page size in bytes.
#[must_use]
pub fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(value).unwrap_or(4096)
}

/// A contiguous reserved address range, parts of which are file-backed.
///
/// Only sub-ranges previously replaced via [`MappedRegion::map_file_fixed`]
/// are accessible; the accessors verify that before handing out slices.
#[derive(Debug)]
pub struct MappedRegion {
    base: *mut u8,
    len: usize,
    /// File-backed `(offset, length)` sub-ranges, in replacement order.
    mapped: Vec<(usize, usize)>,
}

impl MappedRegion {
    /// Reserve `len` bytes of contiguous address space with no access
    /// permissions.
    pub fn reserve(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(FrsError::Invalid(
                "cannot reserve an empty storage region".to_owned(),
            ));
        }
        // SAFETY: anonymous mapping, no file descriptor involved.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(FrsError::Io(std::io::Error::last_os_error()));
        }
        debug!(target: "frs::storage::mmap", len, "reserved contiguous region");
        Ok(Self {
            base: base.cast(),
            len,
            mapped: Vec::new(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Replace `[offset, offset + len)` of the reservation with a shared
    /// read-write mapping of `fd` at `file_offset`.
    ///
    /// The kernel must honor the requested address; if it places the mapping
    /// elsewhere the stray mapping is torn down and `MapMoved` reported.
    pub fn map_file_fixed(
        &mut self,
        offset: usize,
        len: usize,
        fd: RawFd,
        file_offset: u64,
    ) -> Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or(FrsError::Overflow)?;
        if end > self.len {
            return Err(FrsError::Invalid(format!(
                "mapping [{offset}, {end}) overflows the {}-byte reservation",
                self.len
            )));
        }
        let file_offset = libc::off_t::try_from(file_offset).map_err(|_| FrsError::Overflow)?;

        // SAFETY: [offset, end) lies inside our own reservation.
        let target = unsafe { self.base.add(offset) };
        // SAFETY: unmapping a range we own; it is re-mapped immediately after.
        if unsafe { libc::munmap(target.cast(), len) } != 0 {
            return Err(FrsError::Io(std::io::Error::last_os_error()));
        }
        // SAFETY: MAP_FIXED onto the hole just punched in our reservation.
        let mapped = unsafe {
            libc::mmap(
                target.cast(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                file_offset,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(FrsError::Io(std::io::Error::last_os_error()));
        }
        if mapped != target.cast() {
            // SAFETY: tearing down the mapping the kernel just handed us.
            if unsafe { libc::munmap(mapped, len) } != 0 {
                warn!(
                    target: "frs::storage::mmap",
                    "munmap of relocated mapping failed too"
                );
            }
            return Err(FrsError::MapMoved);
        }
        self.mapped.push((offset, len));
        Ok(())
    }

    fn check_accessible(&self, offset: usize, len: usize) -> Result<()> {
        let end = offset.checked_add(len).ok_or(FrsError::Overflow)?;
        let covered = self
            .mapped
            .iter()
            .any(|&(start, length)| offset >= start && end <= start + length);
        // Replacements are performed in ascending adjacent order, so a range
        // spanning two replacements still fails here; callers slice within
        // one extent at a time.
        if covered {
            Ok(())
        } else {
            Err(FrsError::Invalid(format!(
                "storage range [{offset}, {end}) is not file-backed"
            )))
        }
    }

    /// Read access to a file-backed sub-range.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_accessible(offset, len)?;
        // SAFETY: range verified to lie in a PROT_READ|PROT_WRITE mapping
        // owned by self.
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(offset), len) })
    }

    /// Write access to a file-backed sub-range.
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.check_accessible(offset, len)?;
        // SAFETY: as above, plus &mut self guarantees exclusivity.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.add(offset), len) })
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // One munmap covers the reservation and every replacement inside it.
        // SAFETY: base/len describe the mapping obtained in reserve().
        if unsafe { libc::munmap(self.base.cast(), self.len) } != 0 {
            warn!(
                target: "frs::storage::mmap",
                len = self.len,
                "munmap of storage region failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn reserve_zero_fails() {
        assert!(MappedRegion::reserve(0).is_err());
    }

    #[test]
    fn unmapped_region_refuses_access() {
        let region = MappedRegion::reserve(page_size()).unwrap();
        assert!(region.slice(0, 16).is_err());
    }

    #[test]
    fn file_backed_view_reads_and_writes_through() {
        let page = page_size();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0x11_u8; 2 * page]).unwrap();
        file.sync_all().unwrap();

        let mut region = MappedRegion::reserve(2 * page).unwrap();
        region
            .map_file_fixed(0, 2 * page, file.as_raw_fd(), 0)
            .unwrap();

        assert_eq!(region.slice(0, 4).unwrap(), &[0x11; 4]);

        region.slice_mut(page, 4).unwrap().copy_from_slice(&[0xEE; 4]);
        // The write must be visible through the file descriptor.
        use std::os::unix::fs::FileExt;
        let mut back = [0_u8; 4];
        file.read_exact_at(&mut back, page as u64).unwrap();
        assert_eq!(back, [0xEE; 4]);
    }

    #[test]
    fn out_of_bounds_mapping_is_rejected() {
        let page = page_size();
        let file = tempfile::tempfile().unwrap();
        file.set_len(page as u64).unwrap();
        let mut region = MappedRegion::reserve(page).unwrap();
        assert!(region
            .map_file_fixed(page, page, file.as_raw_fd(), 0)
            .is_err());
    }
}
