use serde::Serialize;

use crate::format::MAX_VSLICES;

/// A run of virtual slices backed by consecutive physical slices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub vslice: u64,
    pub pslice: u64,
    pub len: u64,
}

impl Extent {
    fn vend(&self) -> u64 {
        self.vslice + self.len
    }

    fn contains(&self, vslice: u64) -> bool {
        self.vslice <= vslice && vslice < self.vend()
    }

    /// `next` continues this extent both virtually and physically.
    fn joins(&self, next: &Extent) -> bool {
        self.vend() == next.vslice && self.pslice + self.len == next.pslice
    }
}

/// Answer to a slice query: the run starting at the queried vslice that is
/// uniformly allocated or unallocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VsliceRange {
    pub allocated: bool,
    pub count: u64,
}

/// Sparse vslice to pslice map of one partition, kept as sorted,
/// non-overlapping extents with adjacent extents merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceMap {
    extents: Vec<Extent>,
    slice_count: u64,
}

impl SliceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slice_count(&self) -> u64 {
        self.slice_count
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Highest mapped vslice, if any.
    pub fn last_vslice(&self) -> Option<u64> {
        self.extents.last().map(|e| e.vend() - 1)
    }

    fn find(&self, vslice: u64) -> Option<usize> {
        let index = self.extents.partition_point(|e| e.vslice <= vslice);
        (index > 0 && self.extents[index - 1].contains(vslice)).then(|| index - 1)
    }

    pub fn lookup(&self, vslice: u64) -> Option<u64> {
        self.find(vslice).map(|i| {
            let extent = &self.extents[i];
            extent.pslice + (vslice - extent.vslice)
        })
    }

    /// Physical slice of `vslice` plus how many following vslices continue
    /// on consecutive physical slices.
    pub fn run_at(&self, vslice: u64) -> Option<(u64, u64)> {
        self.find(vslice).map(|i| {
            let extent = &self.extents[i];
            let offset = vslice - extent.vslice;
            (extent.pslice + offset, extent.len - offset)
        })
    }

    /// First mapped vslice in `[start, start + count)`.
    pub fn first_mapped_in(&self, start: u64, count: u64) -> Option<u64> {
        if count == 0 {
            return None;
        }
        if self.find(start).is_some() {
            return Some(start);
        }
        let end = start.saturating_add(count);
        let index = self.extents.partition_point(|e| e.vslice <= start);
        self.extents
            .get(index)
            .map(|e| e.vslice)
            .filter(|&vslice| vslice < end)
    }

    /// Mapped `(vslice, pslice)` pairs in `[start, start + count)`.
    pub fn mapped_in(&self, start: u64, count: u64) -> Vec<(u64, u64)> {
        let end = start.saturating_add(count);
        let first = self.extents.partition_point(|e| e.vend() <= start);
        self.extents[first..]
            .iter()
            .take_while(|e| e.vslice < end)
            .flat_map(|e| {
                let lo = e.vslice.max(start);
                let hi = e.vend().min(end);
                (lo..hi).map(move |v| (v, e.pslice + (v - e.vslice)))
            })
            .collect()
    }

    /// Maps `vslice` to `pslice`. Returns false if `vslice` was already mapped.
    pub fn insert(&mut self, vslice: u64, pslice: u64) -> bool {
        if self.find(vslice).is_some() {
            return false;
        }
        let single = Extent {
            vslice,
            pslice,
            len: 1,
        };
        let index = self.extents.partition_point(|e| e.vslice < vslice);
        let joins_prev = index > 0 && self.extents[index - 1].joins(&single);
        let joins_next = index < self.extents.len() && single.joins(&self.extents[index]);
        match (joins_prev, joins_next) {
            (true, true) => {
                let next = self.extents.remove(index);
                self.extents[index - 1].len += 1 + next.len;
            }
            (true, false) => self.extents[index - 1].len += 1,
            (false, true) => {
                let next = &mut self.extents[index];
                next.vslice = vslice;
                next.pslice = pslice;
                next.len += 1;
            }
            (false, false) => self.extents.insert(index, single),
        }
        self.slice_count += 1;
        true
    }

    /// Unmaps `vslice`, returning the pslice it was mapped to.
    pub fn remove(&mut self, vslice: u64) -> Option<u64> {
        let index = self.find(vslice)?;
        let extent = self.extents[index];
        let offset = vslice - extent.vslice;
        if extent.len == 1 {
            self.extents.remove(index);
        } else if offset == 0 {
            let e = &mut self.extents[index];
            e.vslice += 1;
            e.pslice += 1;
            e.len -= 1;
        } else if offset == extent.len - 1 {
            self.extents[index].len -= 1;
        } else {
            self.extents[index].len = offset;
            self.extents.insert(
                index + 1,
                Extent {
                    vslice: vslice + 1,
                    pslice: extent.pslice + offset + 1,
                    len: extent.len - offset - 1,
                },
            );
        }
        self.slice_count -= 1;
        Some(extent.pslice + offset)
    }

    /// Length of the run starting at `vslice` that is entirely allocated or
    /// entirely unallocated. Allocated runs follow virtual contiguity even
    /// when the physical slices are scattered.
    pub fn query(&self, vslice: u64) -> VsliceRange {
        match self.find(vslice) {
            Some(mut index) => {
                let mut end = self.extents[index].vend();
                while index + 1 < self.extents.len() && self.extents[index + 1].vslice == end {
                    index += 1;
                    end = self.extents[index].vend();
                }
                VsliceRange {
                    allocated: true,
                    count: end - vslice,
                }
            }
            None => {
                let index = self.extents.partition_point(|e| e.vslice <= vslice);
                let end = self
                    .extents
                    .get(index)
                    .map_or(MAX_VSLICES, |e| e.vslice);
                VsliceRange {
                    allocated: false,
                    count: end - vslice,
                }
            }
        }
    }
}
