//! Storage-range tracker.
//!
//! A [`LocationMap`] is a set of disjoint storage ranges, each tagged with the heritage pass
//! in which it was first linked. Adding a range fuses it with everything it overlaps and
//! reports whether any part of it had already been linked by an earlier pass.

use std::{collections::BTreeMap, ops::Bound};

use crate::{
    ir::{Address, Storage},
    Error, Result,
};

/// Size of a tracked range and the pass that first linked it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizePass {
    /// Length of the range in bytes.
    pub size: u32,
    /// Pass in which the range was first linked.
    pub pass: u32,
}

/// How a newly added range relates to ranges linked by earlier passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Intersect {
    /// No overlap with an earlier pass.
    New,
    /// Partial overlap with a range from an earlier pass.
    Partial,
    /// Entirely inside a range from an earlier pass.
    Contained,
}

/// Disjoint storage ranges keyed by start address.
#[derive(Debug, Clone, Default)]
pub struct LocationMap {
    map: BTreeMap<Address, SizePass>,
}

fn end_of(addr: Address, size: u32) -> u128 {
    u128::from(addr.offset) + u128::from(size)
}

fn clamp_size(size: u128) -> u32 {
    u32::try_from(size).unwrap_or(u32::MAX)
}

impl LocationMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry containing `addr`.
    pub fn find(&self, addr: Address) -> Option<(Address, SizePass)> {
        let (start, sp) = self.map.range(..=addr).next_back()?;
        addr.overlap(0, *start, sp.size).map(|_| (*start, *sp))
    }

    /// Pass in which the byte at `addr` was first linked.
    pub fn find_pass(&self, addr: Address) -> Option<u32> {
        self.find(addr).map(|(_, sp)| sp.pass)
    }

    /// Adds `[addr, addr + size)` as linked in `pass`.
    ///
    /// Every overlapping entry is absorbed into one range whose pass is the earliest among
    /// them. Returns the start of the resulting entry and how the new range related to
    /// earlier passes. A range fully inside an existing entry leaves the map unchanged.
    pub fn add(&mut self, addr: Address, size: u32, pass: u32) -> (Address, Intersect) {
        let mut addr = addr;
        let mut end = end_of(addr, size);
        let mut pass = pass;
        let mut intersect = Intersect::New;

        if let Some((start, sp)) = self.find(addr) {
            if end <= end_of(start, sp.size) {
                let kind = if sp.pass < pass {
                    Intersect::Contained
                } else {
                    Intersect::New
                };
                return (start, kind);
            }
            addr = start;
            if sp.pass < pass {
                intersect = Intersect::Partial;
                pass = sp.pass;
            }
            self.map.remove(&start);
        }

        let absorbed: Vec<(Address, SizePass)> = self
            .map
            .range(addr..)
            .take_while(|(a, _)| a.space == addr.space && u128::from(a.offset) < end)
            .map(|(a, sp)| (*a, *sp))
            .collect();
        for (start, sp) in absorbed {
            end = end.max(end_of(start, sp.size));
            if sp.pass < pass {
                intersect = Intersect::Partial;
                pass = sp.pass;
            }
            self.map.remove(&start);
        }

        let size = clamp_size(end - u128::from(addr.offset));
        self.map.insert(addr, SizePass { size, pass });
        (addr, intersect)
    }

    /// First entry starting after `addr`, or the first entry overall.
    pub fn next_after(&self, addr: Option<Address>) -> Option<(Storage, u32)> {
        let mut iter = match addr {
            Some(a) => self.map.range((Bound::Excluded(a), Bound::Unbounded)),
            None => self.map.range(..),
        };
        iter.next().map(|(a, sp)| (Storage::new(*a, sp.size), sp.pass))
    }

    /// Removes the entry starting at `addr`.
    pub fn remove(&mut self, addr: Address) -> Option<SizePass> {
        self.map.remove(&addr)
    }

    /// Inserts an entry without fusing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RangeOverlap`] if the entry would overlap one already present.
    pub(crate) fn insert_raw(&mut self, addr: Address, size: u32, pass: u32) -> Result<()> {
        if self.overlaps(&Storage::new(addr, size)) {
            return Err(Error::RangeOverlap(addr));
        }
        self.map.insert(addr, SizePass { size, pass });
        Ok(())
    }

    /// True if `storage` overlaps any entry.
    pub fn overlaps(&self, storage: &Storage) -> bool {
        if self.find(storage.addr).is_some() {
            return true;
        }
        self.map
            .range(storage.addr..)
            .next()
            .is_some_and(|(a, _)| {
                a.space == storage.addr.space && u128::from(a.offset) < storage.end()
            })
    }

    /// Entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = (Storage, u32)> + '_ {
        self.map
            .iter()
            .map(|(a, sp)| (Storage::new(*a, sp.size), sp.pass))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::SpaceId;

    fn at(offset: u64) -> Address {
        Address::new(SpaceId::new(4), offset)
    }

    #[test]
    fn test_add_new_ranges() {
        let mut map = LocationMap::new();
        assert_eq!(map.add(at(0), 4, 0), (at(0), Intersect::New));
        assert_eq!(map.add(at(8), 4, 0), (at(8), Intersect::New));
        assert_eq!(map.len(), 2);
        assert_eq!(map.find_pass(at(10)), Some(0));
        assert_eq!(map.find_pass(at(5)), None);
    }

    #[test]
    fn test_contained_in_earlier_pass() {
        let mut map = LocationMap::new();
        map.add(at(0), 8, 0);
        assert_eq!(map.add(at(2), 2, 1), (at(0), Intersect::Contained));
        assert_eq!(map.add(at(2), 2, 0), (at(0), Intersect::New));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_partial_overlap_fuses_and_keeps_oldest_pass() {
        let mut map = LocationMap::new();
        map.add(at(4), 4, 0);
        map.add(at(12), 4, 1);
        let (start, kind) = map.add(at(0), 14, 2);
        assert_eq!(start, at(0));
        assert_eq!(kind, Intersect::Partial);
        let entries: Vec<_> = map.iter().collect();
        assert_eq!(entries, vec![(Storage::new(at(0), 16), 0)]);
    }

    #[test]
    fn test_same_pass_fuses_silently() {
        let mut map = LocationMap::new();
        map.add(at(0), 4, 3);
        assert_eq!(map.add(at(2), 4, 3), (at(0), Intersect::New));
        assert_eq!(map.iter().next(), Some((Storage::new(at(0), 6), 3)));
        assert!(map.overlaps(&Storage::new(at(5), 4)));
        assert!(!map.overlaps(&Storage::new(at(6), 4)));
    }

    #[test]
    fn test_range_ending_at_top_of_space_keeps_full_size() {
        let mut map = LocationMap::new();
        let slot = at(0u64.wrapping_sub(8));
        map.add(slot, 8, 0);
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![(Storage::new(slot, 8), 0)]);

        let last = at(0u64.wrapping_sub(1));
        assert_eq!(map.add(last, 1, 1), (slot, Intersect::Contained));
        assert!(map.overlaps(&Storage::new(last, 1)));
        assert!(!map.overlaps(&Storage::new(at(0), 4)));
    }

    #[test]
    fn test_insert_raw_rejects_overlap() {
        let mut map = LocationMap::new();
        map.insert_raw(at(0), 4, 0).unwrap();
        map.insert_raw(at(4), 4, 0).unwrap();
        assert!(matches!(
            map.insert_raw(at(6), 4, 1),
            Err(Error::RangeOverlap(addr)) if addr == at(6)
        ));
        assert_eq!(map.len(), 2);
    }
}
