// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Sparse page-granular lookup table over the guest address space.
//!
//! Layout: `[L0: 13 bits][L1: 14 bits][Offset: 12 bits]` = 39 bits total.
//! L1 tables are allocated on first write.

use mirage_common::{ADDRESS_SPACE_SIZE, PAGE_SHIFT};

const L1_BITS: u32 = 14;
const L0_BITS: u32 = 13;
const L1_SIZE: usize = 1 << L1_BITS;
const L0_SIZE: usize = 1 << L0_BITS;

const _: () = assert!(1u64 << (L0_BITS + L1_BITS + PAGE_SHIFT) == ADDRESS_SPACE_SIZE);

pub struct SegmentTable<T: Clone> {
    tables: Vec<Option<Box<[Option<T>]>>>,
}

impl<T: Clone> SegmentTable<T> {
    pub fn new() -> Self {
        let mut tables = Vec::with_capacity(L0_SIZE);
        tables.resize_with(L0_SIZE, || None);
        Self { tables }
    }

    /// Entry for the page containing `addr`.
    pub fn get(&self, addr: u64) -> Option<&T> {
        if addr >= ADDRESS_SPACE_SIZE {
            return None;
        }
        let (l0, l1) = Self::split(addr);
        self.tables[l0].as_ref()?[l1].as_ref()
    }

    /// Set every page overlapping `[start, end)` to `value`. Clearing never
    /// allocates.
    pub fn set(&mut self, start: u64, end: u64, value: Option<T>) {
        let end = end.min(ADDRESS_SPACE_SIZE);
        if start >= end {
            return;
        }

        let first_page = start >> PAGE_SHIFT;
        let last_page = (end - 1) >> PAGE_SHIFT;
        for page in first_page..=last_page {
            let (l0, l1) = Self::split(page << PAGE_SHIFT);
            if self.tables[l0].is_none() {
                if value.is_none() {
                    continue;
                }
                self.tables[l0] = Some(vec![None; L1_SIZE].into_boxed_slice());
            }
            if let Some(table) = &mut self.tables[l0] {
                table[l1] = value.clone();
            }
        }
    }

    /// Number of allocated L1 tables.
    pub fn allocated_tables(&self) -> usize {
        self.tables.iter().filter(|t| t.is_some()).count()
    }

    fn split(addr: u64) -> (usize, usize) {
        let page = addr >> PAGE_SHIFT;
        let l1 = (page as usize) & (L1_SIZE - 1);
        let l0 = (page >> L1_BITS) as usize;
        (l0, l1)
    }
}

impl<T: Clone> Default for SegmentTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_set_and_get() {
        let mut table = SegmentTable::new();
        table.set(0x1000, 0x3000, Some(7u32));
        assert_eq!(table.get(0x0FFF), None);
        assert_eq!(table.get(0x1000), Some(&7));
        assert_eq!(table.get(0x2FFF), Some(&7));
        assert_eq!(table.get(0x3000), None);
        assert_eq!(table.allocated_tables(), 1);
    }

    #[test]
    fn test_partial_pages_are_covered() {
        let mut table = SegmentTable::new();
        table.set(0x1800, 0x2001, Some(1u32));
        assert_eq!(table.get(0x1000), Some(&1));
        assert_eq!(table.get(0x2FFF), Some(&1));
    }

    #[test]
    fn test_clear_does_not_allocate() {
        let mut table: SegmentTable<u32> = SegmentTable::new();
        table.set(0x4000_0000, 0x4001_0000, None);
        assert_eq!(table.allocated_tables(), 0);
    }

    #[test]
    fn test_out_of_range_ignored() {
        let mut table = SegmentTable::new();
        table.set(ADDRESS_SPACE_SIZE - 0x1000, ADDRESS_SPACE_SIZE + 0x1000, Some(3u32));
        assert_eq!(table.get(ADDRESS_SPACE_SIZE - 1), Some(&3));
        assert_eq!(table.get(ADDRESS_SPACE_SIZE), None);
    }

    proptest! {
        #[test]
        fn test_lookup_matches_last_write(
            writes in proptest::collection::vec((0u64..0x40u64, 1u64..0x8u64, proptest::option::of(0u8..4)), 1..16),
            lookup in 0u64..0x48u64,
        ) {
            let mut table = SegmentTable::new();
            let mut model = vec![None; 0x48];
            for (page, pages, value) in &writes {
                let start = page << PAGE_SHIFT;
                table.set(start, start + (pages << PAGE_SHIFT), *value);
                for p in *page..page + pages {
                    model[p as usize] = *value;
                }
            }
            prop_assert_eq!(table.get(lookup << PAGE_SHIFT).copied(), model[lookup as usize]);
        }
    }
}
