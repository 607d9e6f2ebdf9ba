// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-thread re-entrant ownership lock with execution-context tags.
//!
//! A GPU execution locks every resource it touches once, under its own tag.
//! Later attempts to lock under the same tag report that the resource is
//! already part of the execution instead of taking the lock again.
//!
//! Built on a `parking_lot` mutex and condvar rather than
//! `parking_lot::ReentrantMutex`: a same-tag relock must return without
//! deepening the hold, and buffers need the current depth and tag to know
//! when the outermost unlock happens. Neither is exposed by a reentrant
//! mutex guard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

/// Identifies one logical execution context. The default tag is "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContextTag(u64);

impl ContextTag {
    pub const NONE: ContextTag = ContextTag(0);

    /// A fresh tag, never equal to any other allocated tag.
    pub fn allocate() -> Self {
        Self(NEXT_TAG.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_some(&self) -> bool {
        self.0 != 0
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Default)]
struct LockOwner {
    thread: Option<ThreadId>,
    depth: u32,
    tag: ContextTag,
}

#[derive(Default)]
pub struct ContextLock {
    owner: Mutex<LockOwner>,
    released: Condvar,
}

impl ContextLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the calling thread owns the lock. Re-entrant.
    pub fn lock(&self) {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        loop {
            match owner.thread {
                None => {
                    owner.thread = Some(me);
                    owner.depth = 1;
                    return;
                }
                Some(thread) if thread == me => {
                    owner.depth += 1;
                    return;
                }
                Some(_) => self.released.wait(&mut owner),
            }
        }
    }

    /// Take the lock if it is free or already owned by the calling thread.
    pub fn try_lock(&self) -> bool {
        let me = thread::current().id();
        let Some(mut owner) = self.owner.try_lock() else {
            return false;
        };
        match owner.thread {
            None => {
                owner.thread = Some(me);
                owner.depth = 1;
                true
            }
            Some(thread) if thread == me => {
                owner.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Lock on behalf of the context `tag`.
    ///
    /// Returns `false` without locking if the calling thread already holds
    /// the lock under the same (non-empty) tag.
    pub fn lock_with_tag(&self, tag: ContextTag) -> bool {
        let me = thread::current().id();
        if tag.is_some() {
            let owner = self.owner.lock();
            if owner.tag == tag && owner.thread == Some(me) {
                return false;
            }
        }

        self.lock();
        self.owner.lock().tag = tag;
        true
    }

    /// Release one level of ownership. Returns `true` once the lock is free.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not own the lock.
    pub fn unlock(&self) -> bool {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        assert_eq!(owner.thread, Some(me), "unlocking a lock held by another thread");
        owner.depth -= 1;
        if owner.depth > 0 {
            return false;
        }
        owner.thread = None;
        owner.tag = ContextTag::NONE;
        drop(owner);
        self.released.notify_one();
        true
    }

    /// Ownership depth of the calling thread, 0 if it does not hold the lock.
    pub fn held_depth(&self) -> u32 {
        let owner = self.owner.lock();
        if owner.thread == Some(thread::current().id()) {
            owner.depth
        } else {
            0
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.held_depth() > 0
    }

    /// Tag of the current holder.
    pub fn tag(&self) -> ContextTag {
        self.owner.lock().tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_lock_is_reentrant() {
        let lock = ContextLock::new();
        lock.lock();
        lock.lock();
        assert_eq!(lock.held_depth(), 2);
        assert!(!lock.unlock());
        assert!(lock.unlock());
        assert!(!lock.is_held_by_current_thread());
    }

    #[test]
    fn test_same_tag_is_not_locked_twice() {
        let lock = ContextLock::new();
        let tag = ContextTag::allocate();
        assert!(lock.lock_with_tag(tag));
        assert!(!lock.lock_with_tag(tag));
        assert_eq!(lock.held_depth(), 1);

        let other = ContextTag::allocate();
        assert!(lock.lock_with_tag(other));
        assert_eq!(lock.tag(), other);
        lock.unlock();
        assert!(lock.unlock());
        assert_eq!(lock.tag(), ContextTag::NONE);
    }

    #[test]
    fn test_tag_outlives_nested_holds() {
        let lock = ContextLock::new();
        let tag = ContextTag::allocate();
        assert!(lock.lock_with_tag(tag));
        lock.lock();
        assert!(!lock.unlock());
        assert_eq!(lock.tag(), tag);
        assert!(!lock.lock_with_tag(tag));
        assert_eq!(lock.held_depth(), 1);
        assert!(lock.unlock());
    }

    #[test]
    fn test_empty_tag_always_locks() {
        let lock = ContextLock::new();
        assert!(lock.lock_with_tag(ContextTag::NONE));
        assert!(lock.lock_with_tag(ContextTag::NONE));
        assert_eq!(lock.held_depth(), 2);
    }

    #[test]
    fn test_try_lock_fails_across_threads() {
        let lock = Arc::new(ContextLock::new());
        lock.lock();

        let other = lock.clone();
        let acquired = std::thread::spawn(move || other.try_lock()).join().unwrap();
        assert!(!acquired);
        lock.unlock();
    }

    #[test]
    fn test_lock_waits_for_release() {
        let lock = Arc::new(ContextLock::new());
        lock.lock();

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let lock = lock.clone();
            let acquired = acquired.clone();
            std::thread::spawn(move || {
                lock.lock();
                acquired.store(true, Ordering::SeqCst);
                lock.unlock();
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!acquired.load(Ordering::SeqCst));
        lock.unlock();
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
