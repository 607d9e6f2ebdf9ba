// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Registry of page traps and the fault-servicing state machine.
//!
//! Each trap covers one or more guest spans and carries a protection level.
//! A page's effective permission is the strongest protection among the traps
//! touching it. Servicing a fault walks those traps, invokes the matching
//! handler callback and lowers the trap's protection when it succeeds.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use bitflags::bitflags;

use mirage_common::memory::{TrapHandle, TrapHandler, TrapProtection};
use mirage_common::{align_down, align_up, GuestSpan, PAGE_SHIFT, PAGE_SIZE_U64};

bitflags! {
    /// Effective host permission of a guest page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPermission: u32 {
        const READ  = 1;
        const WRITE = 2;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const NONE       = 0;
    }
}

impl std::fmt::Display for MemoryPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = if self.contains(Self::READ) { 'R' } else { '-' };
        let w = if self.contains(Self::WRITE) { 'W' } else { '-' };
        write!(f, "{r}{w}")
    }
}

impl From<TrapProtection> for MemoryPermission {
    fn from(protection: TrapProtection) -> Self {
        match protection {
            TrapProtection::None => Self::READ_WRITE,
            TrapProtection::WriteOnly => Self::READ,
            TrapProtection::ReadWrite => Self::NONE,
        }
    }
}

pub(crate) struct TrapEntry {
    pub regions: Vec<GuestSpan>,
    pub protection: TrapProtection,
    pub handler: Weak<dyn TrapHandler>,
}

/// Result of servicing a fault on one page.
pub(crate) enum FaultOutcome {
    /// Every trap on the page now permits the access.
    Allowed,
    /// A handler could not service the fault without blocking. The caller
    /// must drop the trap lock, run the handler's pre-access callback and
    /// retry.
    Retry(Arc<dyn TrapHandler>),
}

#[derive(Default)]
pub(crate) struct TrapMap {
    entries: BTreeMap<u64, TrapEntry>,
    /// Guest page number to the traps touching it.
    pages: HashMap<u64, Vec<u64>>,
    next_handle: u64,
}

impl TrapMap {
    pub fn insert(&mut self, regions: Vec<GuestSpan>, handler: Weak<dyn TrapHandler>) -> TrapHandle {
        self.next_handle += 1;
        let handle = self.next_handle;
        for page in pages_of(&regions) {
            self.pages.entry(page).or_default().push(handle);
        }
        self.entries.insert(
            handle,
            TrapEntry {
                regions,
                protection: TrapProtection::None,
                handler,
            },
        );
        TrapHandle(handle)
    }

    pub fn get_mut(&mut self, handle: TrapHandle) -> Option<&mut TrapEntry> {
        self.entries.get_mut(&handle.0)
    }

    pub fn get(&self, handle: TrapHandle) -> Option<&TrapEntry> {
        self.entries.get(&handle.0)
    }

    pub fn remove(&mut self, handle: TrapHandle) -> Option<TrapEntry> {
        let entry = self.entries.remove(&handle.0)?;
        for page in pages_of(&entry.regions) {
            if let Some(handles) = self.pages.get_mut(&page) {
                handles.retain(|&h| h != handle.0);
                if handles.is_empty() {
                    self.pages.remove(&page);
                }
            }
        }
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Strongest protection among the traps touching `page`.
    pub fn protection_of_page(&self, page: u64) -> TrapProtection {
        self.pages
            .get(&page)
            .into_iter()
            .flatten()
            .filter_map(|h| self.entries.get(h))
            .map(|e| e.protection)
            .max()
            .unwrap_or(TrapProtection::None)
    }

    /// Service an access to `page`. Upgraded handlers are pushed onto
    /// `held` so they are only dropped once the caller releases the trap
    /// lock.
    pub fn service_fault(
        &mut self,
        page: u64,
        write: bool,
        held: &mut Vec<Arc<dyn TrapHandler>>,
    ) -> FaultOutcome {
        let Some(handles) = self.pages.get(&page).cloned() else {
            return FaultOutcome::Allowed;
        };

        for handle in handles {
            let Some(entry) = self.entries.get_mut(&handle) else {
                continue;
            };

            let faults = if write {
                entry.protection != TrapProtection::None
            } else {
                entry.protection == TrapProtection::ReadWrite
            };
            if !faults {
                continue;
            }

            let lowered = if write {
                TrapProtection::None
            } else {
                TrapProtection::WriteOnly
            };

            let Some(handler) = entry.handler.upgrade() else {
                entry.protection = lowered;
                continue;
            };
            held.push(handler.clone());

            let serviced = if write {
                handler.on_write_fault()
            } else {
                handler.on_read_fault()
            };
            if !serviced {
                log::trace!("trap {}: handler busy on page {:#X}, retrying", handle, page);
                return FaultOutcome::Retry(handler);
            }
            entry.protection = lowered;
        }

        FaultOutcome::Allowed
    }
}

/// Page numbers touched by any of `regions`.
pub(crate) fn pages_of(regions: &[GuestSpan]) -> impl Iterator<Item = u64> + '_ {
    regions.iter().flat_map(|r| {
        let first = align_down(r.addr, PAGE_SIZE_U64) >> PAGE_SHIFT;
        let last = align_up(r.end(), PAGE_SIZE_U64) >> PAGE_SHIFT;
        first..last
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingHandler {
        reads: AtomicUsize,
        writes: AtomicUsize,
        busy: AtomicBool,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                busy: AtomicBool::new(false),
            })
        }
    }

    impl TrapHandler for CountingHandler {
        fn on_pre_access(&self) {
            self.busy.store(false, Ordering::SeqCst);
        }

        fn on_read_fault(&self) -> bool {
            self.reads.fetch_add(1, Ordering::SeqCst);
            !self.busy.load(Ordering::SeqCst)
        }

        fn on_write_fault(&self) -> bool {
            self.writes.fetch_add(1, Ordering::SeqCst);
            !self.busy.load(Ordering::SeqCst)
        }
    }

    fn weak_of(handler: &Arc<CountingHandler>) -> Weak<dyn TrapHandler> {
        let handler: Arc<dyn TrapHandler> = handler.clone();
        Arc::downgrade(&handler)
    }

    #[test]
    fn test_read_fault_lowers_to_write_only() {
        let handler = CountingHandler::new();
        let mut map = TrapMap::default();
        let handle = map.insert(vec![GuestSpan::new(0x1000, 0x1000)], weak_of(&handler));
        map.get_mut(handle).unwrap().protection = TrapProtection::ReadWrite;

        let mut held = Vec::new();
        assert!(matches!(map.service_fault(1, false, &mut held), FaultOutcome::Allowed));
        assert_eq!(handler.reads.load(Ordering::SeqCst), 1);
        assert_eq!(map.protection_of_page(1), TrapProtection::WriteOnly);

        // A second read no longer faults.
        assert!(matches!(map.service_fault(1, false, &mut held), FaultOutcome::Allowed));
        assert_eq!(handler.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_fault_clears_protection() {
        let handler = CountingHandler::new();
        let mut map = TrapMap::default();
        let handle = map.insert(vec![GuestSpan::new(0x1000, 0x2000)], weak_of(&handler));
        map.get_mut(handle).unwrap().protection = TrapProtection::WriteOnly;

        let mut held = Vec::new();
        assert!(matches!(map.service_fault(2, true, &mut held), FaultOutcome::Allowed));
        assert_eq!(handler.writes.load(Ordering::SeqCst), 1);
        assert_eq!(map.protection_of_page(1), TrapProtection::None);
        assert_eq!(map.protection_of_page(2), TrapProtection::None);
    }

    #[test]
    fn test_busy_handler_requests_retry() {
        let handler = CountingHandler::new();
        handler.busy.store(true, Ordering::SeqCst);
        let mut map = TrapMap::default();
        let handle = map.insert(vec![GuestSpan::new(0x1000, 0x1000)], weak_of(&handler));
        map.get_mut(handle).unwrap().protection = TrapProtection::WriteOnly;

        let mut held = Vec::new();
        match map.service_fault(1, true, &mut held) {
            FaultOutcome::Retry(h) => h.on_pre_access(),
            FaultOutcome::Allowed => panic!("busy handler should not allow the write"),
        }
        assert_eq!(map.protection_of_page(1), TrapProtection::WriteOnly);
        assert!(matches!(map.service_fault(1, true, &mut held), FaultOutcome::Allowed));
    }

    #[test]
    fn test_dead_handler_allows_access() {
        let handler = CountingHandler::new();
        let mut map = TrapMap::default();
        let handle = map.insert(vec![GuestSpan::new(0x1000, 0x1000)], weak_of(&handler));
        map.get_mut(handle).unwrap().protection = TrapProtection::ReadWrite;
        drop(handler);

        let mut held = Vec::new();
        assert!(matches!(map.service_fault(1, true, &mut held), FaultOutcome::Allowed));
        assert!(held.is_empty());
    }

    #[test]
    fn test_remove_drops_page_index() {
        let handler = CountingHandler::new();
        let mut map = TrapMap::default();
        let handle = map.insert(vec![GuestSpan::new(0x1800, 0x1000)], weak_of(&handler));
        map.get_mut(handle).unwrap().protection = TrapProtection::ReadWrite;
        assert_eq!(map.protection_of_page(2), TrapProtection::ReadWrite);

        assert!(map.remove(handle).is_some());
        assert_eq!(map.len(), 0);
        assert_eq!(map.protection_of_page(1), TrapProtection::None);
        assert_eq!(map.protection_of_page(2), TrapProtection::None);
    }

    #[test]
    fn test_permission_display() {
        assert_eq!(MemoryPermission::from(TrapProtection::None).to_string(), "RW");
        assert_eq!(MemoryPermission::from(TrapProtection::WriteOnly).to_string(), "R-");
        assert_eq!(MemoryPermission::from(TrapProtection::ReadWrite).to_string(), "--");
    }
}
