//! The sequence lock: single synchronization primitive for all ledger state
//!
//! One writer at a time, any number of concurrent readers, plus a lock-free
//! optimistic mode validated after the fact against a version counter. The
//! counter is odd exactly while a writer is inside the critical section, so
//! an optimistic stamp validates iff no write started or finished since it
//! was taken.
//!
//! # Contract
//!
//! The lock is NOT reentrant: acquiring any mode while the same thread holds
//! any mode on the same lock deadlocks. Debug builds panic on same-thread
//! reacquisition instead. Operations that must run inside an already-held
//! lock take a [`WriteToken`]/[`ReadToken`], which is only obtainable by
//! borrowing from a live stamp — misuse is a compile error, not a runtime
//! hazard.
//!
//! Release is by drop (RAII), guaranteed on every exit path including
//! errors. Stamps are owned by the acquiring call frame and never shared.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::{Error, Result};

/// Lock acquisition mode, used by the tracer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Exclusive writer
    Write,
    /// Shared reader
    Read,
    /// Lock-free optimistic read
    Optimistic,
}

#[derive(Default)]
struct LockState {
    readers: usize,
    writer: bool,
}

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Read/write/optimistic lock guarding one ledger instance
///
/// Owned by the facade as an explicit context object, never an ambient
/// singleton, so independent ledger instances stay independent under test.
pub struct SequenceLock {
    state: Mutex<LockState>,
    available: Condvar,
    /// Odd while a writer is inside the critical section
    version: AtomicU64,
    tracer: LockTracer,
    id: u64,
}

impl std::fmt::Debug for SequenceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceLock")
            .field("id", &self.id)
            .field("version", &self.version.load(Ordering::Relaxed))
            .finish()
    }
}

impl SequenceLock {
    /// Create a new unlocked sequence lock
    pub fn new(trace_lifecycle: bool) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            available: Condvar::new(),
            version: AtomicU64::new(0),
            tracer: LockTracer::new(trace_lifecycle),
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Block until exclusive access is granted
    pub fn acquire_write(&self) -> WriteStamp<'_> {
        self.debug_check_not_held();

        let mut state = self.state.lock();
        while state.writer || state.readers > 0 {
            self.available.wait(&mut state);
        }
        state.writer = true;
        drop(state);

        self.finish_write_acquire()
    }

    /// Block until exclusive access is granted or the deadline expires
    ///
    /// Expiry is a distinct error; acquisition is never silently skipped.
    pub fn acquire_write_for(&self, deadline: Duration) -> Result<WriteStamp<'_>> {
        self.debug_check_not_held();

        let started = Instant::now();
        let until = started + deadline;
        let mut state = self.state.lock();
        while state.writer || state.readers > 0 {
            if self.available.wait_until(&mut state, until).timed_out() {
                return Err(Error::LockTimeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        }
        state.writer = true;
        drop(state);

        Ok(self.finish_write_acquire())
    }

    fn finish_write_acquire(&self) -> WriteStamp<'_> {
        // Version goes odd before any mutation becomes visible
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        self.debug_mark_held();
        self.tracer.on_acquire(LockMode::Write, version);

        WriteStamp {
            lock: self,
            version,
            write_token: WriteToken {
                read: ReadToken { _priv: () },
            },
        }
    }

    /// Block only while a writer holds the lock; readers coexist
    pub fn acquire_read(&self) -> ReadStamp<'_> {
        self.debug_check_not_held();

        let mut state = self.state.lock();
        while state.writer {
            self.available.wait(&mut state);
        }
        state.readers += 1;
        drop(state);

        let version = self.version.load(Ordering::Acquire);
        self.debug_mark_held();
        self.tracer.on_acquire(LockMode::Read, version);

        ReadStamp {
            lock: self,
            version,
            read_token: ReadToken { _priv: () },
        }
    }

    /// Lock-free acquisition; returns immediately, no exclusion guaranteed
    ///
    /// Hot-path pattern: optimistic acquire, read, [`SequenceLock::validate`];
    /// on failure fall back to [`SequenceLock::acquire_read`] and re-read.
    pub fn acquire_optimistic(&self) -> OptimisticStamp {
        let version = self.version.load(Ordering::Acquire);
        self.tracer.on_acquire(LockMode::Optimistic, version);
        OptimisticStamp { version }
    }

    /// True iff no write occurred since the stamp was taken
    pub fn validate(&self, stamp: &OptimisticStamp) -> bool {
        stamp.version % 2 == 0 && self.version.load(Ordering::Acquire) == stamp.version
    }

    /// Lifecycle instrumentation for this lock
    pub fn tracer(&self) -> &LockTracer {
        &self.tracer
    }

    fn release_write(&self, version: u64) {
        // Version goes even only after the writer's mutations are complete
        self.version.fetch_add(1, Ordering::AcqRel);
        let mut state = self.state.lock();
        state.writer = false;
        drop(state);
        self.available.notify_all();
        self.debug_unmark_held();
        self.tracer.on_release(LockMode::Write, version);
    }

    fn release_read(&self, version: u64) {
        let mut state = self.state.lock();
        state.readers -= 1;
        let last_reader = state.readers == 0;
        drop(state);
        if last_reader {
            self.available.notify_all();
        }
        self.debug_unmark_held();
        self.tracer.on_release(LockMode::Read, version);
    }

    #[cfg(debug_assertions)]
    fn debug_check_not_held(&self) {
        reentrancy::check_not_held(self.id);
    }

    #[cfg(debug_assertions)]
    fn debug_mark_held(&self) {
        reentrancy::mark_held(self.id);
    }

    #[cfg(debug_assertions)]
    fn debug_unmark_held(&self) {
        reentrancy::unmark_held(self.id);
    }

    #[cfg(not(debug_assertions))]
    fn debug_check_not_held(&self) {}

    #[cfg(not(debug_assertions))]
    fn debug_mark_held(&self) {}

    #[cfg(not(debug_assertions))]
    fn debug_unmark_held(&self) {}
}

/// Capability proving the holder is inside the write critical section
///
/// Only obtainable by borrowing from a live [`WriteStamp`]; lock-free
/// mutating variants require `&WriteToken`. A writer may also read:
/// [`WriteToken::as_read`] derives the read capability.
pub struct WriteToken {
    read: ReadToken,
}

impl WriteToken {
    /// Read capability implied by write exclusivity
    pub fn as_read(&self) -> &ReadToken {
        &self.read
    }
}

impl std::fmt::Debug for WriteToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WriteToken")
    }
}

/// Capability proving the holder is inside a read (or write) critical section
pub struct ReadToken {
    _priv: (),
}

impl std::fmt::Debug for ReadToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReadToken")
    }
}

/// Exclusive stamp; releases the write lock on drop
pub struct WriteStamp<'a> {
    lock: &'a SequenceLock,
    version: u64,
    write_token: WriteToken,
}

impl WriteStamp<'_> {
    /// Capability for lock-free mutating variants
    pub fn token(&self) -> &WriteToken {
        &self.write_token
    }

    /// Writers may also perform lock-free reads
    pub fn read_token(&self) -> &ReadToken {
        self.write_token.as_read()
    }

    /// Version counter value at acquisition (odd)
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl Drop for WriteStamp<'_> {
    fn drop(&mut self) {
        self.lock.release_write(self.version);
    }
}

impl std::fmt::Debug for WriteStamp<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteStamp")
            .field("version", &self.version)
            .finish()
    }
}

/// Shared stamp; releases the read lock on drop
pub struct ReadStamp<'a> {
    lock: &'a SequenceLock,
    version: u64,
    read_token: ReadToken,
}

impl ReadStamp<'_> {
    /// Capability for lock-free read variants
    pub fn token(&self) -> &ReadToken {
        &self.read_token
    }

    /// Version counter value at acquisition
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl Drop for ReadStamp<'_> {
    fn drop(&mut self) {
        self.lock.release_read(self.version);
    }
}

impl std::fmt::Debug for ReadStamp<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadStamp")
            .field("version", &self.version)
            .finish()
    }
}

/// Version snapshot for an optimistic read; no exclusion, validate after use
#[derive(Debug, Clone, Copy)]
pub struct OptimisticStamp {
    version: u64,
}

/// Acquire/release lifecycle instrumentation
///
/// Counters are always maintained (cheap atomics); per-event trace logging
/// is opt-in via config.
pub struct LockTracer {
    trace_lifecycle: bool,
    write_acquires: AtomicU64,
    read_acquires: AtomicU64,
    optimistic_acquires: AtomicU64,
    writers_in_section: AtomicUsize,
    peak_writers: AtomicUsize,
}

impl LockTracer {
    fn new(trace_lifecycle: bool) -> Self {
        Self {
            trace_lifecycle,
            write_acquires: AtomicU64::new(0),
            read_acquires: AtomicU64::new(0),
            optimistic_acquires: AtomicU64::new(0),
            writers_in_section: AtomicUsize::new(0),
            peak_writers: AtomicUsize::new(0),
        }
    }

    fn on_acquire(&self, mode: LockMode, version: u64) {
        match mode {
            LockMode::Write => {
                self.write_acquires.fetch_add(1, Ordering::Relaxed);
                let current = self.writers_in_section.fetch_add(1, Ordering::AcqRel) + 1;
                self.peak_writers.fetch_max(current, Ordering::AcqRel);
            }
            LockMode::Read => {
                self.read_acquires.fetch_add(1, Ordering::Relaxed);
            }
            LockMode::Optimistic => {
                self.optimistic_acquires.fetch_add(1, Ordering::Relaxed);
            }
        }

        if self.trace_lifecycle {
            tracing::trace!(
                mode = ?mode,
                version,
                thread = ?std::thread::current().id(),
                "lock acquired"
            );
        }
    }

    fn on_release(&self, mode: LockMode, version: u64) {
        if mode == LockMode::Write {
            self.writers_in_section.fetch_sub(1, Ordering::AcqRel);
        }

        if self.trace_lifecycle {
            tracing::trace!(
                mode = ?mode,
                version,
                thread = ?std::thread::current().id(),
                "lock released"
            );
        }
    }

    /// Total write acquisitions
    pub fn write_acquisitions(&self) -> u64 {
        self.write_acquires.load(Ordering::Relaxed)
    }

    /// Total read acquisitions
    pub fn read_acquisitions(&self) -> u64 {
        self.read_acquires.load(Ordering::Relaxed)
    }

    /// Total optimistic acquisitions
    pub fn optimistic_acquisitions(&self) -> u64 {
        self.optimistic_acquires.load(Ordering::Relaxed)
    }

    /// Writers currently inside the critical section
    pub fn current_writers(&self) -> usize {
        self.writers_in_section.load(Ordering::Acquire)
    }

    /// Highest concurrent writer count ever observed (must stay at 1)
    pub fn peak_writers(&self) -> usize {
        self.peak_writers.load(Ordering::Acquire)
    }
}

/// Debug-only same-thread reacquisition guard; compiled out in release
#[cfg(debug_assertions)]
mod reentrancy {
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<u64>> = RefCell::new(Vec::new());
    }

    pub fn check_not_held(lock_id: u64) {
        HELD.with(|held| {
            assert!(
                !held.borrow().contains(&lock_id),
                "SequenceLock is not reentrant: thread {:?} already holds lock {}",
                std::thread::current().id(),
                lock_id
            );
        });
    }

    pub fn mark_held(lock_id: u64) {
        HELD.with(|held| held.borrow_mut().push(lock_id));
    }

    pub fn unmark_held(lock_id: u64) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().position(|id| *id == lock_id) {
                held.swap_remove(pos);
            }
        });
    }
}
