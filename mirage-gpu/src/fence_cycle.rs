// SPDX-FileCopyrightText: 2025 mirage contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! One-shot completion tracking for submitted GPU work.
//!
//! A [`FenceCycle`] wraps a host fence for exactly one submission of a
//! command buffer slot. It owns every resource the submission depends on and
//! releases them once the fence is observed signalled. Cycles can be chained
//! so that waiting on one cycle also waits on the work it depends on.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::backend::{BackendResult, HostFence, HostSemaphore};

/// Type-erased resource kept alive until a cycle signals.
pub type Dependency = Arc<dyn Any + Send + Sync>;

struct SubmitState {
    submitted: bool,
    /// The semaphore must be waited on before this submission starts, to
    /// unsignal it after the slot's previous submission.
    semaphore_submit_wait: bool,
    /// Whether the next cycle on the same slot needs that wait.
    next_semaphore_submit_wait: bool,
    /// Submission that consumed the semaphore signal, if any. It must
    /// complete before the semaphore can be signalled again.
    semaphore_unsignal_cycle: Option<Arc<FenceCycle>>,
}

pub struct FenceCycle {
    /// Set once the fence has been observed signalled (or the cycle was
    /// cancelled). Does not imply dependencies are gone yet.
    signalled: AtomicBool,
    already_destroyed: AtomicBool,
    fence: Arc<dyn HostFence>,
    semaphore: Arc<dyn HostSemaphore>,
    state: Mutex<SubmitState>,
    submit_condition: Condvar,
    dependencies: Mutex<Vec<Dependency>>,
    chained_cycles: RwLock<Vec<Arc<FenceCycle>>>,
}

impl FenceCycle {
    /// Wrap `fence`. An unsignalled cycle resets the fence.
    pub fn new(
        fence: Arc<dyn HostFence>,
        semaphore: Arc<dyn HostSemaphore>,
        signalled: bool,
    ) -> BackendResult<Arc<Self>> {
        if !signalled {
            fence.reset()?;
        }
        Ok(Arc::new(Self {
            signalled: AtomicBool::new(signalled),
            already_destroyed: AtomicBool::new(false),
            fence,
            semaphore,
            state: Mutex::new(SubmitState {
                submitted: false,
                semaphore_submit_wait: false,
                next_semaphore_submit_wait: !signalled,
                semaphore_unsignal_cycle: None,
            }),
            submit_condition: Condvar::new(),
            dependencies: Mutex::new(Vec::new()),
            chained_cycles: RwLock::new(Vec::new()),
        }))
    }

    /// The next cycle on the same fence and semaphore. The fence is reset.
    pub fn next(&self) -> BackendResult<Arc<Self>> {
        let semaphore_submit_wait = self.state.lock().next_semaphore_submit_wait;
        let cycle = Self::new(self.fence.clone(), self.semaphore.clone(), false)?;
        cycle.state.lock().semaphore_submit_wait = semaphore_submit_wait;
        Ok(cycle)
    }

    pub fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::Acquire)
    }

    pub fn is_submitted(&self) -> bool {
        self.state.lock().submitted
    }

    /// Mark the cycle signalled without waiting, e.g. after a failed
    /// submission, and release its dependencies.
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock();
            if !state.submitted {
                // The semaphore was never signalled by this cycle.
                state.next_semaphore_submit_wait = state.semaphore_submit_wait;
            }
            self.signalled.store(true, Ordering::Release);
            // Wake anyone blocked waiting for a submission that won't come.
            self.submit_condition.notify_all();
        }
        self.destroy_dependencies();
    }

    /// Block until the cycle has been submitted to the queue, including
    /// every chained cycle.
    pub fn wait_submit(&self) {
        if self.is_signalled() {
            return;
        }

        if self.state.lock().submitted {
            return;
        }

        for cycle in self.chained_snapshot() {
            cycle.wait_submit();
        }

        let mut state = self.state.lock();
        while !state.submitted && !self.is_signalled() {
            self.submit_condition.wait(&mut state);
        }
    }

    /// Block until the fence and every chained cycle are signalled, then
    /// release dependencies.
    ///
    /// # Panics
    ///
    /// Panics if the driver reports an error other than a timeout.
    pub fn wait(&self) {
        if self.is_signalled() {
            self.destroy_dependencies();
            return;
        }

        for cycle in self.chained_snapshot() {
            cycle.wait();
        }

        let mut state = self.state.lock();
        while !state.submitted && !self.is_signalled() {
            self.submit_condition.wait(&mut state);
        }

        if !self.is_signalled() {
            loop {
                match self.fence.wait(None) {
                    Ok(true) => break,
                    // Timeouts and interrupted waits are retried.
                    Ok(false) => continue,
                    Err(e) => {
                        log::error!(
                            "fence cycle: error waiting on fence {:#X}: {}",
                            self.fence.handle(),
                            e
                        );
                        panic!("error waiting on fence {:#X}: {e}", self.fence.handle());
                    }
                }
            }

            if let Some(unsignal) = state.semaphore_unsignal_cycle.clone() {
                drop(state);
                unsignal.wait();
            } else {
                drop(state);
            }

            self.signalled.store(true, Ordering::Release);
        } else {
            drop(state);
        }

        self.destroy_dependencies();
    }

    /// Like [`FenceCycle::wait`] but gives up after `timeout`, returning
    /// `false` if the cycle did not signal in time.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if self.is_signalled() {
            self.destroy_dependencies();
            return true;
        }

        for cycle in self.chained_snapshot() {
            if !cycle.wait_timeout(deadline.saturating_duration_since(Instant::now())) {
                return false;
            }
        }

        let mut state = self.state.lock();
        while !state.submitted && !self.is_signalled() {
            if self.submit_condition.wait_until(&mut state, deadline).timed_out()
                && !state.submitted
                && !self.is_signalled()
            {
                return false;
            }
        }

        if !self.is_signalled() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.fence.wait(Some(remaining)) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    log::error!(
                        "fence cycle: error waiting on fence {:#X}: {}",
                        self.fence.handle(),
                        e
                    );
                    panic!("error waiting on fence {:#X}: {e}", self.fence.handle());
                }
            }

            let unsignal = state.semaphore_unsignal_cycle.clone();
            drop(state);
            if let Some(unsignal) = unsignal {
                if !unsignal.wait_timeout(deadline.saturating_duration_since(Instant::now())) {
                    return false;
                }
            }
            self.signalled.store(true, Ordering::Release);
        } else {
            drop(state);
        }

        self.destroy_dependencies();
        true
    }

    /// Like [`FenceCycle::poll`], but only consults the cached signalled
    /// flag. Used where a stale "not yet" is cheaper than touching the fence.
    pub fn poll_quick(&self) -> bool {
        if self.is_signalled() {
            self.destroy_dependencies();
            return true;
        }
        false
    }

    /// Check for completion without blocking: the chained cycles are polled,
    /// then the fence itself. Contended locks report "not yet" rather than
    /// blocking.
    pub fn poll(&self) -> bool {
        if self.poll_quick() {
            return true;
        }

        {
            let Some(chained) = self.chained_cycles.try_read() else {
                return false;
            };
            if !chained.iter().all(|cycle| cycle.poll()) {
                return false;
            }
        }

        let Some(state) = self.state.try_lock() else {
            return false;
        };

        if self.is_signalled() {
            drop(state);
            self.destroy_dependencies();
            return true;
        }

        if !state.submitted {
            return false;
        }

        match self.fence.is_signalled() {
            Ok(true) => {
                if let Some(unsignal) = &state.semaphore_unsignal_cycle {
                    if !unsignal.poll() {
                        return false;
                    }
                }
                drop(state);
                self.signalled.store(true, Ordering::Release);
                self.destroy_dependencies();
                true
            }
            Ok(false) => false,
            Err(e) => {
                log::error!(
                    "fence cycle: error polling fence {:#X}: {}",
                    self.fence.handle(),
                    e
                );
                panic!("error polling fence {:#X}: {e}", self.fence.handle());
            }
        }
    }

    /// Keep `dependency` alive until the cycle signals. No-op once signalled.
    pub fn attach_object(&self, dependency: Dependency) {
        let mut dependencies = self.dependencies.lock();
        if self.is_signalled() || self.already_destroyed.load(Ordering::Acquire) {
            return;
        }
        dependencies.push(dependency);
    }

    pub fn attach_objects(&self, new_dependencies: impl IntoIterator<Item = Dependency>) {
        let mut dependencies = self.dependencies.lock();
        if self.is_signalled() || self.already_destroyed.load(Ordering::Acquire) {
            return;
        }
        dependencies.extend(new_dependencies);
    }

    /// Number of dependencies currently held.
    pub fn dependency_count(&self) -> usize {
        self.dependencies.lock().len()
    }

    /// Make this cycle depend on `cycle`: waiting on `self` waits on it too.
    /// Ignored for `None`, `self` and cycles that have already signalled.
    pub fn chain_cycle(&self, cycle: Option<&Arc<FenceCycle>>) {
        let Some(cycle) = cycle else {
            return;
        };
        if self.is_signalled() || std::ptr::eq(Arc::as_ptr(cycle), self) || cycle.poll_quick() {
            return;
        }
        self.chained_cycles.write().push(cycle.clone());
    }

    /// Record a GPU-side wait on this cycle's semaphore.
    ///
    /// `record` submits the waiting work and returns its cycle. It is handed
    /// the semaphore only if the semaphore's signal has not already been
    /// consumed and the cycle has not signalled; otherwise it gets `None`
    /// and this call first waits for the cycle on the host.
    pub fn record_semaphore_wait_usage(
        &self,
        record: impl FnOnce(Option<&Arc<dyn HostSemaphore>>) -> Arc<FenceCycle>,
    ) -> Arc<FenceCycle> {
        // A wait can only be submitted after the signal.
        self.wait_submit();

        let mut state = self.state.lock();

        if state.semaphore_unsignal_cycle.is_some() {
            drop(state);
            self.wait();
            return record(None);
        }

        if self.is_signalled() {
            drop(state);
            return record(None);
        }

        let cycle = record(Some(&self.semaphore));
        state.semaphore_unsignal_cycle = Some(cycle.clone());
        state.next_semaphore_submit_wait = false;
        cycle
    }

    // ── Scheduler hooks ──

    pub(crate) fn semaphore(&self) -> &Arc<dyn HostSemaphore> {
        &self.semaphore
    }

    pub(crate) fn fence(&self) -> &Arc<dyn HostFence> {
        &self.fence
    }

    pub(crate) fn semaphore_submit_wait(&self) -> bool {
        self.state.lock().semaphore_submit_wait
    }

    pub(crate) fn notify_submitted(&self) {
        let mut state = self.state.lock();
        state.submitted = true;
        self.submit_condition.notify_all();
    }

    // ── Internal helpers ──

    fn chained_snapshot(&self) -> Vec<Arc<FenceCycle>> {
        self.chained_cycles.read().clone()
    }

    fn destroy_dependencies(&self) {
        if self.already_destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Dropped outside the locks: a dependency's destructor may wait on
        // other cycles.
        let dependencies = std::mem::take(&mut *self.dependencies.lock());
        let unsignal = self.state.lock().semaphore_unsignal_cycle.take();
        let chained = std::mem::take(&mut *self.chained_cycles.write());
        log::trace!(
            "fence cycle {:#X}: releasing {} dependencies",
            self.fence.handle(),
            dependencies.len()
        );
        drop(dependencies);
        drop(unsignal);
        drop(chained);
    }
}

impl Drop for FenceCycle {
    fn drop(&mut self) {
        // Unsubmitted cycles have nothing to wait for.
        if self.state.get_mut().submitted && !self.is_signalled() {
            self.wait();
        }
    }
}

impl std::fmt::Debug for FenceCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceCycle")
            .field("fence", &self.fence.handle())
            .field("signalled", &self.is_signalled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CommandBuffer, GpuBackend, SoftBackend};
    use std::sync::atomic::AtomicUsize;

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn cycle(backend: &SoftBackend) -> Arc<FenceCycle> {
        let fence = backend.create_fence(false).unwrap();
        let semaphore = backend.create_semaphore().unwrap();
        FenceCycle::new(fence, semaphore, false).unwrap()
    }

    /// Submit an empty command buffer signalling `cycle`.
    fn submit(backend: &SoftBackend, cycle: &Arc<FenceCycle>) {
        let mut pool = backend.create_command_pool().unwrap();
        let mut cmd = pool.allocate().unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();
        backend
            .submit(cmd.as_mut(), &[], &[cycle.semaphore().clone()], cycle.fence())
            .unwrap();
        cycle.notify_submitted();
    }

    #[test]
    fn test_wait_releases_dependencies_once() {
        let backend = SoftBackend::new();
        let cycle = cycle(&backend);
        let drops = Arc::new(AtomicUsize::new(0));
        cycle.attach_object(Arc::new(DropCounter(drops.clone())));
        assert_eq!(cycle.dependency_count(), 1);

        submit(&backend, &cycle);
        cycle.wait();
        assert!(cycle.is_signalled());
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        cycle.wait();
        assert!(cycle.poll_quick());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attach_after_wait_is_ignored() {
        let backend = SoftBackend::new();
        let cycle = cycle(&backend);
        submit(&backend, &cycle);
        cycle.wait();

        let drops = Arc::new(AtomicUsize::new(0));
        cycle.attach_object(Arc::new(DropCounter(drops.clone())));
        assert_eq!(cycle.dependency_count(), 0);
        // The rejected dependency is dropped straight away.
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_chained_cycle_gates_wait() {
        let backend = SoftBackend::new();
        let first = cycle(&backend);
        let second = cycle(&backend);
        second.chain_cycle(Some(&first));

        backend.pause();
        submit(&backend, &first);
        submit(&backend, &second);
        assert!(!second.wait_timeout(Duration::from_millis(20)));
        assert!(!second.poll());

        backend.resume();
        second.wait();
        assert!(first.is_signalled());
        assert!(second.is_signalled());
    }

    #[test]
    fn test_chain_ignores_self_and_signalled() {
        let backend = SoftBackend::new();
        let a = cycle(&backend);
        a.chain_cycle(Some(&a));
        a.chain_cycle(None);
        assert!(a.chained_snapshot().is_empty());

        let done = cycle(&backend);
        done.cancel();
        a.chain_cycle(Some(&done));
        assert!(a.chained_snapshot().is_empty());
    }

    #[test]
    fn test_poll_observes_signal() {
        let backend = SoftBackend::new();
        let cycle = cycle(&backend);
        assert!(!cycle.poll(), "unsubmitted cycle must not report signalled");

        submit(&backend, &cycle);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cycle.poll() {
            assert!(Instant::now() < deadline, "cycle never signalled");
            std::thread::yield_now();
        }
        assert!(cycle.poll_quick());
    }

    #[test]
    fn test_poll_quick_only_reads_cached_flag() {
        let backend = SoftBackend::new();
        let cycle = cycle(&backend);
        let drops = Arc::new(AtomicUsize::new(0));
        cycle.attach_object(Arc::new(DropCounter(drops.clone())));

        submit(&backend, &cycle);
        assert!(cycle.fence().wait(Some(Duration::from_secs(5))).unwrap());
        // The fence has signalled, but nothing has observed it yet.
        assert!(!cycle.poll_quick());
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        assert!(cycle.poll());
        assert!(cycle.poll_quick());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_blocks_until_submitted() {
        let backend = Arc::new(SoftBackend::new());
        let cycle = cycle(&backend);

        let waiter = {
            let cycle = cycle.clone();
            std::thread::spawn(move || cycle.wait())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!cycle.is_signalled());

        submit(&backend, &cycle);
        waiter.join().unwrap();
        assert!(cycle.is_signalled());
    }

    #[test]
    fn test_cancel_releases_without_submit() {
        let backend = SoftBackend::new();
        let cycle = cycle(&backend);
        let drops = Arc::new(AtomicUsize::new(0));
        cycle.attach_object(Arc::new(DropCounter(drops.clone())));

        cycle.cancel();
        assert!(cycle.is_signalled());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        cycle.wait_submit();
    }

    #[test]
    fn test_semaphore_wait_usage_consumes_signal() {
        let backend = SoftBackend::new();
        let producer = cycle(&backend);
        backend.pause();
        submit(&backend, &producer);

        let consumer = cycle(&backend);
        let result = producer.record_semaphore_wait_usage(|semaphore| {
            assert!(semaphore.is_some());
            consumer.clone()
        });
        assert!(Arc::ptr_eq(&result, &consumer));

        let next = producer.next().unwrap();
        assert!(!next.semaphore_submit_wait());

        // A second usage cannot wait on the semaphore again.
        consumer.cancel();
        backend.resume();
        let other = cycle(&backend);
        producer.record_semaphore_wait_usage(|semaphore| {
            assert!(semaphore.is_none());
            other.clone()
        });
        assert!(producer.is_signalled());
    }

    #[test]
    fn test_next_cycle_waits_on_semaphore_by_default() {
        let backend = SoftBackend::new();
        let first = cycle(&backend);
        submit(&backend, &first);
        first.wait();

        let next = first.next().unwrap();
        assert!(next.semaphore_submit_wait());
        assert!(!next.is_signalled());
    }
}
