#![forbid(unsafe_code)]
//! Extent interval algebra: ordered maps and vectors of device extents.
//!
//! Everything the remapper decides is expressed on these two containers:
//!
//! - **[`ExtentMap`]**: ordered by logical offset, non-overlapping, fully
//!   coalesced. Supports union-by-insertion, intersection, complement
//!   against a total range, and block shifts.
//! - **[`ExtentVector`]**: raw extent sequence in probe order, converted to
//!   a map when canonical form is wanted.
//!
//! Offsets are generic over [`Offset`] so the algebra works the same in
//! bytes and in blocks.

use frs_error::{FrsError, Result};
use frs_types::Offset;
use std::collections::BTreeMap;

// ── Extent ──────────────────────────────────────────────────────────────────

/// A contiguous run of blocks: where it lives (`physical`), where it belongs
/// (`logical`), and how long it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent<T> {
    pub physical: T,
    pub logical: T,
    pub length: T,
}

impl<T: Offset> Extent<T> {
    #[must_use]
    pub fn new(physical: T, logical: T, length: T) -> Self {
        Self {
            physical,
            logical,
            length,
        }
    }

    /// One past the last logical offset covered.
    #[must_use]
    pub fn logical_end(&self) -> T {
        self.logical + self.length
    }

    /// One past the last physical offset covered.
    #[must_use]
    pub fn physical_end(&self) -> T {
        self.physical + self.length
    }
}

/// True if `a` and `b` apply the same logical→physical translation,
/// i.e. they could be fragments of one larger extent.
fn same_translation<T: Offset>(a: &Extent<T>, b: &Extent<T>) -> bool {
    // Cross-addition avoids signed deltas: phys_a - log_a == phys_b - log_b.
    u128::from(a.physical.to_u64()) + u128::from(b.logical.to_u64())
        == u128::from(b.physical.to_u64()) + u128::from(a.logical.to_u64())
}

// ── ExtentVector ────────────────────────────────────────────────────────────

/// A non-canonical extent sequence, in whatever order the producer emitted.
///
/// Used where ordering and coalescing would lose information, e.g. raw
/// probe output and the persistence artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentVector<T>(pub Vec<Extent<T>>);

impl<T: Offset> ExtentVector<T> {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, extent: Extent<T>) {
        self.0.push(extent);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extent<T>> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of all lengths. Vectors are unconstrained, so this can overflow.
    pub fn total_length(&self) -> Result<T> {
        let mut total = T::ZERO;
        for extent in &self.0 {
            total = total.checked_add(extent.length).ok_or(FrsError::Overflow)?;
        }
        Ok(total)
    }

    /// Multiply every offset and length by `2^n`.
    pub fn shift_left(&mut self, n: u32) -> Result<()> {
        for extent in &mut self.0 {
            extent.physical = extent
                .physical
                .checked_shl_lossless(n)
                .ok_or(FrsError::Overflow)?;
            extent.logical = extent
                .logical
                .checked_shl_lossless(n)
                .ok_or(FrsError::Overflow)?;
            extent.length = extent
                .length
                .checked_shl_lossless(n)
                .ok_or(FrsError::Overflow)?;
        }
        Ok(())
    }

    /// Divide every offset and length by `2^n`. Every value must be an
    /// exact multiple of `2^n`.
    pub fn shift_right(&mut self, n: u32) -> Result<()> {
        for extent in &mut self.0 {
            let physical = extent.physical.checked_shr_exact(n);
            let logical = extent.logical.checked_shr_exact(n);
            let length = extent.length.checked_shr_exact(n);
            match (physical, logical, length) {
                (Some(physical), Some(logical), Some(length)) => {
                    *extent = Extent {
                        physical,
                        logical,
                        length,
                    };
                }
                _ => {
                    return Err(FrsError::Invalid(format!(
                        "extent ({}, {}, {}) is not aligned to 2^{n}",
                        extent.physical, extent.logical, extent.length
                    )))
                }
            }
        }
        Ok(())
    }
}

impl<T> From<Vec<Extent<T>>> for ExtentVector<T> {
    fn from(v: Vec<Extent<T>>) -> Self {
        Self(v)
    }
}

impl<T> IntoIterator for ExtentVector<T> {
    type Item = Extent<T>;
    type IntoIter = std::vec::IntoIter<Extent<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<T: Offset> FromIterator<Extent<T>> for ExtentVector<T> {
    fn from_iter<I: IntoIterator<Item = Extent<T>>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ── ExtentMap ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot<T> {
    physical: T,
    length: T,
}

/// Canonical extent map: keyed by logical offset, non-overlapping, with
/// logically and physically adjacent entries coalesced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentMap<T: Offset> {
    entries: BTreeMap<T, Slot<T>>,
}

impl<T: Offset> Default for ExtentMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Offset> ExtentMap<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Canonicalize a vector into a fresh map.
    pub fn from_vector(vector: &ExtentVector<T>) -> Result<Self> {
        let mut map = Self::new();
        map.append_vector(vector)?;
        Ok(map)
    }

    /// Merge every extent of `vector` into this map.
    pub fn append_vector(&mut self, vector: &ExtentVector<T>) -> Result<()> {
        for extent in vector.iter() {
            self.insert(*extent)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Extent<T>> + '_ {
        self.entries.iter().map(|(&logical, slot)| Extent {
            physical: slot.physical,
            logical,
            length: slot.length,
        })
    }

    /// First extent in logical order, if any.
    #[must_use]
    pub fn first(&self) -> Option<Extent<T>> {
        self.iter().next()
    }

    /// Sum of all lengths.
    ///
    /// Entries are disjoint subranges of `[0, T::MAX]`, so the sum cannot
    /// overflow `T`.
    #[must_use]
    pub fn total_count(&self) -> T {
        let mut total = T::ZERO;
        for slot in self.entries.values() {
            total += slot.length;
        }
        total
    }

    /// Key of the last entry starting strictly before `logical`.
    fn predecessor_key(&self, logical: T) -> Option<T> {
        self.entries.range(..logical).next_back().map(|(&k, _)| k)
    }

    /// Internal insertion for entries already known to be disjoint and
    /// non-adjacent (complement and intersection outputs).
    fn insert_entry(&mut self, extent: Extent<T>) {
        debug_assert!(extent.length > T::ZERO);
        self.entries.insert(
            extent.logical,
            Slot {
                physical: extent.physical,
                length: extent.length,
            },
        );
    }

    /// Merge `extent` into the map, coalescing with every compatible
    /// neighbour.
    ///
    /// Re-inserting an already-covered subrange with the same mapping is a
    /// no-op; an overlap with a different mapping is `OverlapConflict`; a
    /// zero-length extent is ignored.
    pub fn insert(&mut self, extent: Extent<T>) -> Result<()> {
        if extent.length == T::ZERO {
            return Ok(());
        }
        let logical_end = extent
            .logical
            .checked_add(extent.length)
            .ok_or(FrsError::Overflow)?;
        extent
            .physical
            .checked_add(extent.length)
            .ok_or(FrsError::Overflow)?;

        let mut merged = extent;
        let mut merged_end = logical_end;
        let mut stale = Vec::new();

        // Only the predecessor can reach into the new range from the left;
        // every other candidate starts inside [logical, logical_end].
        let candidates: Vec<T> = self
            .predecessor_key(extent.logical)
            .into_iter()
            .chain(
                self.entries
                    .range(extent.logical..=logical_end)
                    .map(|(&k, _)| k),
            )
            .collect();

        for key in candidates {
            let slot = self.entries[&key];
            let entry = Extent {
                physical: slot.physical,
                logical: key,
                length: slot.length,
            };
            let entry_end = entry.logical_end();
            if entry_end < merged.logical || entry.logical > merged_end {
                continue;
            }
            let overlaps = entry.logical < merged_end && entry_end > merged.logical;
            if !same_translation(&entry, &merged) {
                if overlaps {
                    let at = entry.logical.max(merged.logical);
                    return Err(FrsError::OverlapConflict {
                        logical: at.to_u64(),
                        existing: (entry.physical + (at - entry.logical)).to_u64(),
                        conflicting: (merged.physical + (at - merged.logical)).to_u64(),
                    });
                }
                // Logically adjacent but physically apart: stays separate.
                continue;
            }
            stale.push(entry.logical);
            if entry.logical < merged.logical {
                merged.physical = entry.physical;
                merged.logical = entry.logical;
            }
            merged_end = merged_end.max(entry_end);
            merged.length = merged_end - merged.logical;
        }

        for key in stale {
            self.entries.remove(&key);
        }
        self.insert_entry(merged);
        Ok(())
    }

    /// Delete the logical range `[logical, logical + length)`, splitting
    /// entries that only partially overlap.
    pub fn remove(&mut self, logical: T, length: T) {
        if length == T::ZERO {
            return;
        }
        let end = logical.checked_add(length).unwrap_or(T::MAX);

        let candidates: Vec<T> = self
            .predecessor_key(logical)
            .into_iter()
            .chain(self.entries.range(logical..end).map(|(&k, _)| k))
            .collect();

        for key in candidates {
            let slot = self.entries[&key];
            let entry = Extent {
                physical: slot.physical,
                logical: key,
                length: slot.length,
            };
            let entry_end = entry.logical_end();
            if entry_end <= logical || entry.logical >= end {
                continue;
            }
            self.entries.remove(&key);
            if entry.logical < logical {
                self.insert_entry(Extent {
                    physical: entry.physical,
                    logical: entry.logical,
                    length: logical - entry.logical,
                });
            }
            if entry_end > end {
                let skip = end - entry.logical;
                self.insert_entry(Extent {
                    physical: entry.physical + skip,
                    logical: end,
                    length: entry_end - end,
                });
            }
        }
    }

    /// Portions of this map falling inside the logical range
    /// `[logical, logical + length)`, clipped to it.
    #[must_use]
    pub fn intersect_range(&self, logical: T, length: T) -> Vec<Extent<T>> {
        let mut out = Vec::new();
        if length == T::ZERO {
            return out;
        }
        let end = logical.checked_add(length).unwrap_or(T::MAX);

        let candidates = self
            .predecessor_key(logical)
            .into_iter()
            .chain(self.entries.range(logical..end).map(|(&k, _)| k));

        for key in candidates {
            let slot = self.entries[&key];
            let entry_end = key + slot.length;
            let start = key.max(logical);
            let stop = entry_end.min(end);
            if start < stop {
                out.push(Extent {
                    physical: slot.physical + (start - key),
                    logical: start,
                    length: stop - start,
                });
            }
        }
        out
    }

    /// True if `[logical, logical + length)` is fully covered by this map.
    #[must_use]
    pub fn contains_range(&self, logical: T, length: T) -> bool {
        let mut covered = T::ZERO;
        for part in self.intersect_range(logical, length) {
            covered += part.length;
        }
        covered == length
    }

    /// Extents present in both maps with a consistent mapping. Overlaps
    /// whose physical translations disagree are dropped.
    #[must_use]
    pub fn intersect_all(&self, other: &Self) -> Self {
        let mut out = Self::new();
        let mut left = self.iter().peekable();
        let mut right = other.iter().peekable();

        while let (Some(a), Some(b)) = (left.peek().copied(), right.peek().copied()) {
            let start = a.logical.max(b.logical);
            let stop = a.logical_end().min(b.logical_end());
            if start < stop && same_translation(&a, &b) {
                out.insert_entry(Extent {
                    physical: a.physical + (start - a.logical),
                    logical: start,
                    length: stop - start,
                });
            }
            if a.logical_end() <= b.logical_end() {
                left.next();
            } else {
                right.next();
            }
        }
        out
    }

    /// Complement of this map's *physical* coverage against `[0, total)`.
    ///
    /// Logical offsets are ignored; the output is an identity map
    /// (`logical == physical`).
    #[must_use]
    pub fn complement0_physical(&self, total: T) -> Self {
        let ranges: Vec<(T, T)> = self
            .entries
            .values()
            .map(|slot| (slot.physical, slot.length))
            .collect();
        Self::complement_of_ranges(ranges, total)
    }

    /// Complement of this map's *logical* coverage against `[0, total)`.
    ///
    /// Physical offsets are ignored; the output is an identity map.
    #[must_use]
    pub fn complement0_logical(&self, total: T) -> Self {
        let ranges: Vec<(T, T)> = self
            .entries
            .iter()
            .map(|(&logical, slot)| (logical, slot.length))
            .collect();
        Self::complement_of_ranges(ranges, total)
    }

    /// Complement the logical coverage of a byte-granular vector, converted
    /// to blocks of `2^block_size_log2` bytes, against
    /// `[0, total_length >> block_size_log2)`.
    #[must_use]
    pub fn complement0_logical_shift(
        input: &ExtentVector<T>,
        block_size_log2: u32,
        total_length: T,
    ) -> Self {
        let ranges: Vec<(T, T)> = input
            .iter()
            .map(|extent| {
                let start = extent.logical >> block_size_log2;
                let end = extent
                    .logical
                    .checked_add(extent.length)
                    .unwrap_or(T::MAX)
                    >> block_size_log2;
                (start, end - start)
            })
            .collect();
        Self::complement_of_ranges(ranges, total_length >> block_size_log2)
    }

    /// Identity map covering the union of this map's physical ranges.
    #[must_use]
    pub fn physical_coverage(&self) -> Self {
        let ranges: Vec<(T, T)> = self
            .entries
            .values()
            .map(|slot| (slot.physical, slot.length))
            .collect();
        let mut out = Self::new();
        for (start, length) in Self::merge_ranges(ranges) {
            out.insert_entry(Extent {
                physical: start,
                logical: start,
                length,
            });
        }
        out
    }

    /// Sort `(start, length)` ranges and merge overlapping/touching ones.
    fn merge_ranges(mut ranges: Vec<(T, T)>) -> Vec<(T, T)> {
        ranges.retain(|&(_, length)| length > T::ZERO);
        ranges.sort_by_key(|&(start, _)| start);
        let mut merged: Vec<(T, T)> = Vec::with_capacity(ranges.len());
        for (start, length) in ranges {
            let end = start.checked_add(length).unwrap_or(T::MAX);
            match merged.last_mut() {
                Some((last_start, last_length)) if start <= *last_start + *last_length => {
                    let last_end = *last_start + *last_length;
                    if end > last_end {
                        *last_length = end - *last_start;
                    }
                }
                _ => merged.push((start, end - start)),
            }
        }
        merged
    }

    fn complement_of_ranges(ranges: Vec<(T, T)>, total: T) -> Self {
        let mut out = Self::new();
        let mut cursor = T::ZERO;
        for (start, length) in Self::merge_ranges(ranges) {
            let clipped_start = start.min(total);
            if clipped_start > cursor {
                out.insert_entry(Extent {
                    physical: cursor,
                    logical: cursor,
                    length: clipped_start - cursor,
                });
            }
            cursor = cursor.max((start + length).min(total));
        }
        if total > cursor {
            out.insert_entry(Extent {
                physical: cursor,
                logical: cursor,
                length: total - cursor,
            });
        }
        out
    }

    /// Multiply every offset and length by `2^n`.
    pub fn shift_left(&mut self, n: u32) -> Result<()> {
        let mut shifted = BTreeMap::new();
        for (&logical, slot) in &self.entries {
            let logical = logical.checked_shl_lossless(n).ok_or(FrsError::Overflow)?;
            let physical = slot
                .physical
                .checked_shl_lossless(n)
                .ok_or(FrsError::Overflow)?;
            let length = slot
                .length
                .checked_shl_lossless(n)
                .ok_or(FrsError::Overflow)?;
            shifted.insert(logical, Slot { physical, length });
        }
        self.entries = shifted;
        Ok(())
    }

    /// Divide every offset and length by `2^n`. Every value must be an
    /// exact multiple of `2^n`.
    pub fn shift_right(&mut self, n: u32) -> Result<()> {
        let mut shifted = BTreeMap::new();
        for (&logical, slot) in &self.entries {
            let fields = (
                logical.checked_shr_exact(n),
                slot.physical.checked_shr_exact(n),
                slot.length.checked_shr_exact(n),
            );
            let (Some(logical), Some(physical), Some(length)) = fields else {
                return Err(FrsError::Invalid(format!(
                    "extent ({}, {logical}, {}) is not aligned to 2^{n}",
                    slot.physical, slot.length
                )));
            };
            shifted.insert(logical, Slot { physical, length });
        }
        self.entries = shifted;
        Ok(())
    }
}

impl<'a, T: Offset> IntoIterator for &'a ExtentMap<T> {
    type Item = Extent<T>;
    type IntoIter = std::vec::IntoIter<Extent<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter().collect::<Vec<_>>().into_iter()
    }
}

// ── Block size bitmask ──────────────────────────────────────────────────────

/// Accumulates the bitwise OR of every offset and length seen while reading
/// extents. The lowest set bit gives the device's effective block size: the
/// largest power of two dividing every value exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockBitmask<T>(T);

impl<T: Offset> Default for BlockBitmask<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Offset> BlockBitmask<T> {
    #[must_use]
    pub fn new() -> Self {
        Self(T::ZERO)
    }

    #[must_use]
    pub fn from_raw(raw: T) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn get(self) -> T {
        self.0
    }

    pub fn or_value(&mut self, value: T) {
        self.0 |= value;
    }

    pub fn or_extent(&mut self, extent: &Extent<T>) {
        self.0 |= extent.physical;
        self.0 |= extent.logical;
        self.0 |= extent.length;
    }

    pub fn or_vector(&mut self, vector: &ExtentVector<T>) {
        for extent in vector.iter() {
            self.or_extent(extent);
        }
    }

    /// `log2` of the effective block size, `None` while nothing has been
    /// accumulated.
    #[must_use]
    pub fn effective_block_size_log2(self) -> Option<u32> {
        (self.0 != T::ZERO).then(|| self.0.trailing_zeros())
    }

    /// The effective block size itself, zero while nothing has been
    /// accumulated.
    #[must_use]
    pub fn effective_block_size(self) -> T {
        match self.effective_block_size_log2() {
            Some(log2) => T::ONE << log2,
            None => T::ZERO,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
