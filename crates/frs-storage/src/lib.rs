//! Scratch storage for the remap worker.
//!
//! Given where the new filesystem's image physically lives and which device
//! blocks the old filesystem considers free, the planner picks the device
//! regions that are safe to overwrite ("primary storage"), sizes an overflow
//! file on another filesystem ("secondary storage") for whatever the budget
//! still misses, and maps both as one contiguous scratch buffer.

pub mod mmap;

pub use mmap::{page_size, MappedRegion};

use frs_error::{FrsError, Result};
use frs_extent::{Extent, ExtentMap, ExtentVector};
use frs_types::Offset;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ── Planner ─────────────────────────────────────────────────────────────────

/// Shrink an identity extent inward to `2^align_log2` boundaries.
///
/// Returns `None` when nothing aligned survives.
fn shrink_to_alignment<T: Offset>(extent: &Extent<T>, align_log2: u32) -> Option<Extent<T>> {
    if align_log2 == 0 {
        return Some(*extent);
    }
    let start = extent.physical;
    let end = extent.physical_end();
    let floor = (start >> align_log2) << align_log2;
    let aligned_start = if floor == start {
        start
    } else {
        floor.checked_add(T::ONE << align_log2)?
    };
    let aligned_end = (end >> align_log2) << align_log2;
    (aligned_end > aligned_start).then(|| {
        Extent::new(
            aligned_start,
            aligned_start,
            aligned_end - aligned_start,
        )
    })
}

/// Choose primary-storage extents and the secondary-storage length.
///
/// Candidates are the device ranges both free in the old filesystem and not
/// holding image data. They are taken greedily by descending length
/// (ascending physical offset on ties, for determinism) until `budget` is
/// reached, the last one trimmed to land exactly on it. A shortfall becomes
/// the secondary length, or `StorageTooSmall` when `exact` is set.
///
/// With `align_log2 > 0`, candidates are first shrunk inward to
/// `2^align_log2` boundaries so their byte ranges stay mappable.
pub fn plan_primary<T: Offset>(
    free_space: &ExtentMap<T>,
    loop_map: &ExtentMap<T>,
    device_length: T,
    budget: T,
    exact: bool,
    align_log2: u32,
) -> Result<(ExtentVector<T>, T)> {
    let candidates = free_space
        .physical_coverage()
        .intersect_all(&loop_map.complement0_physical(device_length));

    let mut usable: Vec<Extent<T>> = candidates
        .iter()
        .filter_map(|extent| shrink_to_alignment(&extent, align_log2))
        .collect();
    usable.sort_by(|a, b| b.length.cmp(&a.length).then(a.physical.cmp(&b.physical)));

    let mut selected = ExtentVector::new();
    let mut total = T::ZERO;
    for extent in usable {
        if total >= budget {
            break;
        }
        let take = extent.length.min(budget - total);
        selected.push(Extent::new(extent.physical, extent.physical, take));
        total += take;
    }

    let secondary = if total < budget {
        if exact {
            return Err(FrsError::StorageTooSmall {
                requested: budget.to_u64(),
                available: total.to_u64(),
            });
        }
        budget - total
    } else {
        T::ZERO
    };

    debug!(
        target: "frs::storage::plan",
        primary_extents = selected.len(),
        primary = total.to_u64(),
        secondary = secondary.to_u64(),
        "planned storage"
    );
    Ok((selected, secondary))
}

// ── Secondary storage ───────────────────────────────────────────────────────

const ZERO_FILL_CHUNK: usize = 64 * 1024;

/// The overflow file. Owns its path and unlinks it on drop, whether the job
/// succeeded or unwound.
#[derive(Debug)]
pub struct SecondaryStorage {
    file: File,
    path: PathBuf,
}

impl SecondaryStorage {
    /// Create `path` and extend it to exactly `length` bytes, preferring
    /// `posix_fallocate` and falling back to explicit zero writes.
    pub fn create(path: &Path, length: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        info!(
            target: "frs::storage::secondary",
            path = %path.display(),
            length,
            "creating secondary storage"
        );

        let wanted = libc::off_t::try_from(length).map_err(|_| FrsError::Overflow)?;
        // posix_fallocate reports its error as the return value.
        let mut rc = libc::EINTR;
        while rc == libc::EINTR {
            // SAFETY: plain fd + integer arguments.
            rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, wanted) };
        }
        if rc != 0 {
            debug!(
                target: "frs::storage::secondary",
                errno = rc,
                "posix_fallocate unavailable, zero-filling"
            );
            let zeroes = [0_u8; ZERO_FILL_CHUNK];
            let mut left = usize::try_from(length).map_err(|_| FrsError::Overflow)?;
            while left > 0 {
                let chunk = left.min(ZERO_FILL_CHUNK);
                // write_all restarts on EINTR.
                file.write_all(&zeroes[..chunk])?;
                left -= chunk;
            }
            file.flush()?;
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for SecondaryStorage {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(
                target: "frs::storage::secondary",
                path = %self.path.display(),
                error = %err,
                "removing secondary storage failed"
            );
        }
    }
}

// ── Storage plan ────────────────────────────────────────────────────────────

/// One primary extent inside the scratch region: its device byte range and
/// where it sits inside the mapped reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageExtent {
    pub physical: u64,
    pub length: u64,
    pub mem_offset: usize,
}

/// The assembled scratch region handed to the remap worker.
///
/// Owns the reservation and the secondary file; dropping the plan unmaps
/// the region and removes the file.
#[derive(Debug)]
pub struct StoragePlan {
    region: MappedRegion,
    primary: Vec<StorageExtent>,
    secondary_length: u64,
    secondary: Option<SecondaryStorage>,
}

impl StoragePlan {
    #[must_use]
    pub fn mmap_size(&self) -> usize {
        self.region.len()
    }

    #[must_use]
    pub fn primary(&self) -> &[StorageExtent] {
        &self.primary
    }

    #[must_use]
    pub fn secondary_length(&self) -> u64 {
        self.secondary_length
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.region.slice(offset, len)
    }

    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.region.slice_mut(offset, len)
    }

    /// Flush file-backed pages of the scratch region to their files.
    pub fn sync(&self) -> Result<()> {
        if let Some(secondary) = &self.secondary {
            secondary.file().sync_data()?;
        }
        Ok(())
    }
}

/// Map `primary` device extents (byte-granular, page-aligned) and a
/// `secondary_length`-byte overflow file at `storage_path` into one
/// contiguous scratch region.
///
/// Any failure after the reservation unwinds completely: the region is
/// unmapped and the secondary file unlinked by the owning types' `Drop`.
pub fn create_storage(
    device: &File,
    primary: &ExtentVector<u64>,
    secondary_length: u64,
    storage_path: &Path,
) -> Result<StoragePlan> {
    let primary_bytes = primary.total_length()?;
    let total = primary_bytes
        .checked_add(secondary_length)
        .ok_or(FrsError::Overflow)?;
    let mem_len = usize::try_from(total).map_err(|_| FrsError::Overflow)?;
    if mem_len == 0 {
        return Err(FrsError::Invalid(
            "storage budget is zero, nothing to map".to_owned(),
        ));
    }

    let mut region = MappedRegion::reserve(mem_len)?;

    let secondary = if secondary_length > 0 {
        Some(SecondaryStorage::create(storage_path, secondary_length)?)
    } else {
        info!(
            target: "frs::storage",
            "primary storage is large enough, not creating secondary storage"
        );
        None
    };

    let mut extents = Vec::with_capacity(primary.len());
    let mut mem_offset = 0_usize;
    for extent in primary.iter() {
        let length = usize::try_from(extent.length).map_err(|_| FrsError::Overflow)?;
        region.map_file_fixed(mem_offset, length, device.as_raw_fd(), extent.physical)?;
        extents.push(StorageExtent {
            physical: extent.physical,
            length: extent.length,
            mem_offset,
        });
        mem_offset += length;
    }

    if let Some(secondary) = &secondary {
        let length = usize::try_from(secondary_length).map_err(|_| FrsError::Overflow)?;
        region.map_file_fixed(mem_offset, length, secondary.file().as_raw_fd(), 0)?;
        mem_offset += length;
    }

    if mem_offset != mem_len {
        return Err(FrsError::Invalid(format!(
            "mapped {mem_offset} bytes of storage, expected {mem_len}"
        )));
    }

    info!(
        target: "frs::storage",
        primary = primary_bytes,
        secondary = secondary_length,
        total = mem_len,
        "storage mapped as contiguous region"
    );
    Ok(StoragePlan {
        region,
        primary: extents,
        secondary_length,
        secondary,
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn map_of(extents: &[(u64, u64, u64)]) -> ExtentMap<u64> {
        let mut map = ExtentMap::new();
        for &(physical, logical, length) in extents {
            map.insert(Extent::new(physical, logical, length)).unwrap();
        }
        map
    }

    fn identity_map(ranges: &[(u64, u64)]) -> ExtentMap<u64> {
        let mut map = ExtentMap::new();
        for &(start, length) in ranges {
            map.insert(Extent::new(start, start, length)).unwrap();
        }
        map
    }

    fn plan_entries(vector: &ExtentVector<u64>) -> Vec<(u64, u64)> {
        vector.iter().map(|e| (e.physical, e.length)).collect()
    }

    // ── planner ─────────────────────────────────────────────────────────

    #[test]
    fn exact_budget_is_met_from_primary_alone() {
        let free = identity_map(&[(0, 10000), (20000, 5000)]);
        let loop_map = map_of(&[(0, 0, 2000)]);
        let (primary, secondary) =
            plan_primary(&free, &loop_map, 100_000, 9000, true, 0).unwrap();
        assert_eq!(plan_entries(&primary), vec![(2000, 8000), (20000, 1000)]);
        assert_eq!(secondary, 0);
        assert_eq!(primary.total_length().unwrap(), 9000);
    }

    #[test]
    fn shortfall_becomes_secondary_length() {
        let free = identity_map(&[(0, 10000), (20000, 5000)]);
        let loop_map = map_of(&[(0, 0, 2000)]);
        let (primary, secondary) =
            plan_primary(&free, &loop_map, 100_000, 20000, false, 0).unwrap();
        assert_eq!(primary.total_length().unwrap(), 13000);
        assert_eq!(secondary, 7000);
    }

    #[test]
    fn exact_shortfall_is_an_error() {
        let free = identity_map(&[(0, 1000)]);
        let loop_map: ExtentMap<u64> = ExtentMap::new();
        let err = plan_primary(&free, &loop_map, 100_000, 20000, true, 0).unwrap_err();
        match err {
            FrsError::StorageTooSmall {
                requested,
                available,
            } => {
                assert_eq!(requested, 20000);
                assert_eq!(available, 1000);
            }
            other => panic!("expected StorageTooSmall, got {other:?}"),
        }
    }

    #[test]
    fn primary_never_touches_loop_data() {
        // Free space overlapping loop data must be rejected as candidates.
        let free = identity_map(&[(0, 8000)]);
        let loop_map = map_of(&[(2000, 0, 2000), (6000, 2000, 1000)]);
        let (primary, _) = plan_primary(&free, &loop_map, 10_000, 8000, false, 0).unwrap();

        let loop_coverage = loop_map.physical_coverage();
        for extent in primary.iter() {
            assert!(free.intersect_range(extent.physical, extent.length).len() == 1);
            assert!(loop_coverage
                .intersect_range(extent.physical, extent.length)
                .is_empty());
        }
    }

    #[test]
    fn tie_break_prefers_lower_physical() {
        let free = identity_map(&[(5000, 1000), (1000, 1000)]);
        let loop_map: ExtentMap<u64> = ExtentMap::new();
        let (primary, _) = plan_primary(&free, &loop_map, 10_000, 1500, false, 0).unwrap();
        assert_eq!(plan_entries(&primary), vec![(1000, 1000), (5000, 500)]);
    }

    #[test]
    fn alignment_shrinks_candidates_inward() {
        // One free run [100, 9000); with 4096-alignment only [4096, 8192)
        // survives.
        let free = identity_map(&[(100, 8900)]);
        let loop_map: ExtentMap<u64> = ExtentMap::new();
        let (primary, secondary) =
            plan_primary(&free, &loop_map, 16384, 8192, false, 12).unwrap();
        assert_eq!(plan_entries(&primary), vec![(4096, 4096)]);
        assert_eq!(secondary, 4096);
    }

    // ── storage assembly ────────────────────────────────────────────────

    #[test]
    fn create_storage_maps_primary_and_secondary() {
        let page = page_size() as u64;
        let dir = tempfile::tempdir().unwrap();
        let device_path = dir.path().join("device.img");
        std::fs::write(&device_path, vec![0xAB_u8; (8 * page) as usize]).unwrap();
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&device_path)
            .unwrap();

        let primary: ExtentVector<u64> =
            vec![Extent::new(2 * page, 2 * page, page), Extent::new(5 * page, 5 * page, page)]
                .into();
        let storage_path = dir.path().join("job.1.storage");
        let mut plan = create_storage(&device, &primary, page, &storage_path).unwrap();

        // Totals invariant.
        assert_eq!(plan.mmap_size() as u64, 3 * page);
        assert_eq!(
            plan.primary().iter().map(|e| e.length).sum::<u64>()
                + plan.secondary_length(),
            plan.mmap_size() as u64
        );
        assert!(storage_path.exists());
        assert_eq!(
            storage_path.metadata().unwrap().len(),
            page,
            "secondary file sized to the deficit"
        );

        // The first primary extent window shows device bytes.
        let view = plan.slice(0, 16).unwrap();
        assert_eq!(view, &[0xAB; 16]);

        // Writing through the region reaches the device.
        plan.slice_mut(0, 4).unwrap().copy_from_slice(&[0x77; 4]);
        plan.sync().unwrap();
        use std::os::unix::fs::FileExt;
        let mut back = [0_u8; 4];
        device.read_exact_at(&mut back, 2 * page).unwrap();
        assert_eq!(back, [0x77; 4]);

        // Unwind: dropping the plan removes the secondary file.
        drop(plan);
        assert!(!storage_path.exists());
    }

    #[test]
    fn create_storage_secondary_only() {
        let page = page_size() as u64;
        let dir = tempfile::tempdir().unwrap();
        let device_path = dir.path().join("device.img");
        std::fs::write(&device_path, vec![0_u8; page as usize]).unwrap();
        let device = File::open(&device_path).unwrap();

        let storage_path = dir.path().join("job.2.storage");
        let plan =
            create_storage(&device, &ExtentVector::new(), 2 * page, &storage_path).unwrap();
        assert_eq!(plan.mmap_size() as u64, 2 * page);
        assert!(plan.primary().is_empty());
        // Freshly allocated secondary storage reads as zeroes.
        assert!(plan.slice(0, 64).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn create_storage_rejects_zero_budget() {
        let dir = tempfile::tempdir().unwrap();
        let device_path = dir.path().join("device.img");
        std::fs::write(&device_path, [0_u8; 64]).unwrap();
        let device = File::open(&device_path).unwrap();
        let err = create_storage(
            &device,
            &ExtentVector::new(),
            0,
            &dir.path().join("job.3.storage"),
        )
        .unwrap_err();
        assert!(matches!(err, FrsError::Invalid(_)));
    }
}
