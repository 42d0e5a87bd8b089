//! The descriptor set of a remap job: DEVICE, LOOP-FILE and ZERO-FILE.
//!
//! The loop-file holds the image of the filesystem being installed; the
//! zero-file's extents approximate the free space of the filesystem being
//! replaced. Both must live on the device being rewritten.

use crate::probe::{device_length_of, FilesystemProbe};
use frs_error::{FrsError, Result};
use frs_extent::{BlockBitmask, ExtentVector};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::Path;
use tracing::{debug, info, warn};

/// The roles a descriptor can play in a remap job, for log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Device,
    LoopFile,
    ZeroFile,
    PrimaryStorage,
    SecondaryStorage,
    Storage,
}

impl Role {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::LoopFile => "loop-file",
            Self::ZeroFile => "zero-file",
            Self::PrimaryStorage => "primary-storage",
            Self::SecondaryStorage => "secondary-storage",
            Self::Storage => "storage",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── Block-level device access ───────────────────────────────────────────────

/// Positioned block-granular access, the worker's view of a device.
pub trait BlockIo {
    /// Device length in bytes, fixed at open time.
    fn length(&self) -> u64;

    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`. Interrupted writes are restarted.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush written data to the underlying medium.
    fn sync(&self) -> Result<()>;
}

/// A device (or image file) opened read-write, with its length captured.
#[derive(Debug)]
pub struct DeviceFile {
    file: File,
    length: u64,
}

impl DeviceFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let length = device_length_of(&file)?;
        Ok(Self { file, length })
    }

    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }
}

impl BlockIo for DeviceFile {
    fn length(&self) -> u64 {
        self.length
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        // write_all_at restarts on EINTR.
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

// ── Descriptor set ──────────────────────────────────────────────────────────

/// Open descriptors of a remap job. The loop-file and zero-file are dropped
/// as soon as their extents have been read; the device lives until the job
/// ends.
#[derive(Debug, Default)]
pub struct RemapIo {
    device: Option<DeviceFile>,
    loop_file: Option<File>,
    zero_file: Option<File>,
}

impl RemapIo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the device descriptor is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// True if the loop-file and zero-file descriptors are still open.
    #[must_use]
    pub fn is_open_extents(&self) -> bool {
        self.is_open() && self.loop_file.is_some() && self.zero_file.is_some()
    }

    /// Open DEVICE read-write and LOOP-FILE / ZERO-FILE read-only, verifying
    /// that both files actually live on DEVICE.
    pub fn open(&mut self, device: &Path, loop_file: &Path, zero_file: &Path) -> Result<()> {
        if self.is_open() {
            return Err(FrsError::AlreadyOpen);
        }

        let device_file = DeviceFile::open(device)?;
        info!(
            target: "frs::io::device",
            path = %device.display(),
            length = device_file.length(),
            "opened {}",
            Role::Device
        );

        let device_meta = device_file.file().metadata()?;
        let device_is_blockdev = {
            use std::os::unix::fs::FileTypeExt;
            device_meta.file_type().is_block_device()
        };

        let open_role = |path: &Path, role: Role| -> Result<File> {
            let file = File::open(path)?;
            if device_is_blockdev {
                let containing = file.metadata()?.dev();
                if containing != device_meta.rdev() {
                    return Err(FrsError::Invalid(format!(
                        "{role} '{}' is on device {containing:#x}, not on {} '{}' ({:#x})",
                        path.display(),
                        Role::Device,
                        device.display(),
                        device_meta.rdev(),
                    )));
                }
            } else {
                // An image file cannot contain other files; skip the check
                // so image-based runs and tests still work.
                debug!(
                    target: "frs::io::device",
                    "{} is a regular file, skipping {role} containment check",
                    Role::Device
                );
            }
            Ok(file)
        };

        let loop_fd = open_role(loop_file, Role::LoopFile)?;
        let zero_fd = open_role(zero_file, Role::ZeroFile)?;

        self.device = Some(device_file);
        self.loop_file = Some(loop_fd);
        self.zero_file = Some(zero_fd);
        Ok(())
    }

    /// Read LOOP-FILE and ZERO-FILE extents through `probe`, accumulating a
    /// shared block-size bitmask.
    pub fn read_extents(
        &self,
        probe: &dyn FilesystemProbe,
    ) -> Result<(ExtentVector<u64>, ExtentVector<u64>, BlockBitmask<u64>)> {
        if !self.is_open_extents() {
            return Err(FrsError::NotOpen);
        }
        let loop_file = self.loop_file.as_ref().ok_or(FrsError::NotOpen)?;
        let zero_file = self.zero_file.as_ref().ok_or(FrsError::NotOpen)?;

        let (loop_extents, loop_mask) = probe.extents_of(loop_file)?;
        let (free_extents, free_mask) = probe.extents_of(zero_file)?;

        let mut bitmask = BlockBitmask::from_raw(loop_mask.get() | free_mask.get());
        // The effective block size must divide the device length too.
        bitmask.or_value(self.device_length()?);

        debug!(
            target: "frs::io::device",
            loop_extents = loop_extents.len(),
            free_extents = free_extents.len(),
            bitmask = bitmask.get(),
            "read extents"
        );
        Ok((loop_extents, free_extents, bitmask))
    }

    /// Drop the loop-file and zero-file descriptors; their extents have been
    /// consumed.
    pub fn close_extents(&mut self) {
        self.loop_file = None;
        self.zero_file = None;
    }

    pub fn device(&self) -> Result<&DeviceFile> {
        self.device.as_ref().ok_or(FrsError::NotOpen)
    }

    pub fn device_length(&self) -> Result<u64> {
        Ok(self.device()?.length())
    }

    /// Drop every descriptor.
    pub fn close(&mut self) {
        if self.device.take().is_some() {
            debug!(target: "frs::io::device", "closed {}", Role::Device);
        }
        self.close_extents();
    }
}

impl Drop for RemapIo {
    fn drop(&mut self) {
        if self.is_open() {
            warn!(
                target: "frs::io::device",
                "descriptor set dropped while still open"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frs_extent::Extent;
    use std::io::Write;

    struct FakeProbe;

    impl FilesystemProbe for FakeProbe {
        fn extents_of(&self, file: &File) -> Result<(ExtentVector<u64>, BlockBitmask<u64>)> {
            // Pretend the whole file is one extent at physical 8192.
            let length = file.metadata()?.len();
            let vector: ExtentVector<u64> = vec![Extent::new(8192, 0, length)].into();
            let mut bitmask = BlockBitmask::new();
            bitmask.or_vector(&vector);
            Ok((vector, bitmask))
        }

        fn device_size(&self, file: &File) -> Result<u64> {
            device_length_of(file)
        }
    }

    fn touch(path: &Path, bytes: usize) {
        let mut file = File::create(path).unwrap();
        file.write_all(&vec![0_u8; bytes]).unwrap();
    }

    #[test]
    fn open_and_read_extents_via_probe() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("device.img");
        let loop_file = dir.path().join("loop");
        let zero_file = dir.path().join("zero");
        touch(&device, 64 * 4096);
        touch(&loop_file, 2 * 4096);
        touch(&zero_file, 4096);

        let mut io = RemapIo::new();
        io.open(&device, &loop_file, &zero_file).unwrap();
        assert!(io.is_open_extents());
        assert!(matches!(
            io.open(&device, &loop_file, &zero_file),
            Err(FrsError::AlreadyOpen)
        ));

        let (loop_extents, free_extents, bitmask) = io.read_extents(&FakeProbe).unwrap();
        assert_eq!(loop_extents.len(), 1);
        assert_eq!(free_extents.len(), 1);
        // Device length is folded into the bitmask.
        assert_eq!(bitmask.get() & (64 * 4096), 64 * 4096);

        io.close_extents();
        assert!(!io.is_open_extents());
        assert!(matches!(io.read_extents(&FakeProbe), Err(FrsError::NotOpen)));
        assert_eq!(io.device_length().unwrap(), 64 * 4096);
        io.close();
        assert!(!io.is_open());
    }

    #[test]
    fn read_extents_before_open_is_not_open() {
        let io = RemapIo::new();
        assert!(matches!(io.read_extents(&FakeProbe), Err(FrsError::NotOpen)));
    }

    #[test]
    fn device_block_io_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.img");
        touch(&path, 16 * 4096);

        let device = DeviceFile::open(&path).unwrap();
        assert_eq!(device.length(), 16 * 4096);

        let payload = vec![0x5A_u8; 4096];
        device.write_at(3 * 4096, &payload).unwrap();
        device.sync().unwrap();

        let mut back = vec![0_u8; 4096];
        device.read_at(3 * 4096, &mut back).unwrap();
        assert_eq!(back, payload);
    }
}
