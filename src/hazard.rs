//! Filepath: src/hazard.rs
//!
//! Hazard-pointer domain for safe memory reclamation.
//!
//! Lock-free traversals dereference nodes that a concurrent remover may
//! have already unlinked. Before freeing, the remover must therefore prove
//! that no thread still holds such a reference. Hazard pointers make that
//! proof cheap: a thread *publishes* the address it is about to dereference
//! into one of its slots, re-reads the source to validate the publication,
//! and reclaimers refuse to free any address found in someone's slot.
//!
//! # Structure
//!
//! A [`HazardDomain`] owns a lock-free list of `HazardRecord`s. Each record
//! carries [`SLOT_COUNT`] published-pointer slots, an `active` ownership
//! flag, and a retired list private to the owning thread. Records are
//! pushed once and reused: a thread that needs one first tries to adopt an
//! inactive record (CAS on `active`) and only allocates when none is free.
//! Records are freed exclusively by the domain's `Drop`.
//!
//! Each map owns its domain, so a fresh map can be exercised (and its
//! reclamation unit-tested) without process-global state.
//!
//! # Ordering
//!
//! The publish/validate handshake needs store-load ordering, which
//! release/acquire alone cannot provide: the publishing store must be
//! ordered before the validating load, and the reclaimer's collection of
//! retired pointers before its reads of the slots. Both sides therefore go
//! through `SeqCst` fences.

use std::cell::{RefCell, UnsafeCell};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering, fence};

use crate::tagged;
use crate::tracing_helpers::debug_log;

/// Hazard slots per thread. The list traversal needs three (prev, cur,
/// next) plus one for insert's not-yet-linked node.
pub(crate) const SLOT_COUNT: usize = 4;

/// A retired list shorter than this is never scanned; below it, the scan's
/// O(threads) walk costs more than the memory it would recover.
const MIN_SCAN_THRESHOLD: usize = 64;

static NEXT_DOMAIN_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Records this thread has adopted, one per domain it has touched.
    /// Dropped at thread exit, which releases the records for reuse.
    static ADOPTED: RefCell<Vec<AdoptedRecord>> = const { RefCell::new(Vec::new()) };
}

// ============================================================================
//  Retired
// ============================================================================

/// A node awaiting reclamation, type-erased so the domain need not know
/// the map's key and value types.
struct Retired {
    ptr: *mut u8,
    free_fn: unsafe fn(*mut u8),
}

// ============================================================================
//  HazardRecord
// ============================================================================

struct HazardRecord {
    /// Published pointers. Null means "protecting nothing". Reclaimers
    /// read these; only the owning thread writes them.
    slots: [AtomicPtr<u8>; SLOT_COUNT],

    /// Whether some thread currently owns this record.
    active: AtomicBool,

    /// Intrusive link in the domain's record list. Written once before the
    /// record is published, immutable afterwards.
    next: AtomicPtr<HazardRecord>,

    /// Nodes retired by the owning thread, awaiting a scan that proves
    /// them unprotected. Only the owning thread (or the domain's `Drop`,
    /// which has exclusive access) touches this.
    retired: UnsafeCell<Vec<Retired>>,
}

impl HazardRecord {
    fn new() -> Self {
        Self {
            slots: [const { AtomicPtr::new(ptr::null_mut()) }; SLOT_COUNT],
            active: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
            retired: UnsafeCell::new(Vec::new()),
        }
    }
}

// ============================================================================
//  HazardDomain
// ============================================================================

/// A reclamation domain: the set of hazard slots and retired lists for one
/// map.
///
/// The map and every thread-local adoption hold the domain behind an
/// [`Arc`]; records are freed only when the last holder drops, at which
/// point no thread can publish into them anymore.
pub struct HazardDomain {
    /// Head of the record list. Push-only; records live until domain drop.
    head: AtomicPtr<HazardRecord>,

    /// Number of records ever pushed, which bounds the number of published
    /// hazards and thereby sizes the scan threshold.
    records: AtomicUsize,

    /// Distinguishes domains in the thread-local adoption cache.
    id: u64,
}

// SAFETY: the raw record pointers are only dereferenced while the domain
// is alive, records are never freed before domain drop, and the interior
// `retired` lists are confined to their owning thread by the `active`
// protocol.
unsafe impl Send for HazardDomain {}
// SAFETY: as above; all cross-thread communication goes through atomics.
unsafe impl Sync for HazardDomain {}

impl HazardDomain {
    /// Create an empty domain with no records.
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            records: AtomicUsize::new(0),
            id: NEXT_DOMAIN_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Retired-list length at which [`ThreadHazards::retire`] triggers a
    /// scan: twice the worst-case number of published hazards.
    fn scan_threshold(&self) -> usize {
        (2 * SLOT_COUNT * self.records.load(Ordering::Relaxed)).max(MIN_SCAN_THRESHOLD)
    }

    /// The calling thread's hazard slots for this domain, adopting or
    /// allocating a record on first use.
    pub(crate) fn hazards(self: &Arc<Self>) -> ThreadHazards<'_> {
        let record = ADOPTED.with(|adopted| {
            let mut adopted = adopted.borrow_mut();
            if let Some(entry) = adopted.iter().find(|entry| entry.domain_id == self.id) {
                return entry.record;
            }
            let record = self.adopt_record();
            adopted.push(AdoptedRecord {
                domain_id: self.id,
                domain: Arc::clone(self),
                record,
            });
            record
        });

        ThreadHazards {
            domain: self,
            // SAFETY: the record was pushed to this domain's list and is
            // kept alive by it; the thread-local entry holds an `Arc` to
            // the domain, so it outlives this borrow.
            record: unsafe { &*record },
        }
    }

    /// Find an inactive record to reuse, or push a fresh one.
    fn adopt_record(&self) -> *mut HazardRecord {
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            // SAFETY: records are never freed while the domain is alive.
            let record = unsafe { &*cursor };
            if !record.active.load(Ordering::Relaxed)
                && record
                    .active
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return cursor;
            }
            cursor = record.next.load(Ordering::Acquire);
        }

        let record = Box::into_raw(Box::new(HazardRecord::new()));
        self.records.fetch_add(1, Ordering::Relaxed);
        debug_log!(domain = self.id, "allocated hazard record");

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `record` is unpublished; this thread owns it.
            unsafe { &*record }.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, record, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => return record,
                Err(current) => head = current,
            }
        }
    }

    /// Release a record back for reuse: reclaim what it can, clear its
    /// slots, drop ownership. Whatever survives the scan stays with the
    /// record and is picked up by the next adopter or by domain drop.
    fn release_record(&self, record: *mut HazardRecord) {
        // SAFETY: called by the owning thread (from the TLS destructor),
        // so the record is active and its retired list is ours.
        let record = unsafe { &*record };
        self.scan(record);
        for slot in &record.slots {
            slot.store(ptr::null_mut(), Ordering::Release);
        }
        record.active.store(false, Ordering::Release);
    }

    /// Free every retired node in `record` that no published hazard
    /// protects.
    fn scan(&self, record: &HazardRecord) {
        // SAFETY: only the owning thread scans an active record.
        let retired = unsafe { &mut *record.retired.get() };
        if retired.is_empty() {
            return;
        }

        // Order the retired-set snapshot before the hazard reads: a
        // traversal that published its hazard after this fence will also
        // observe the nodes as unlinked and retry, so missing it is safe.
        fence(Ordering::SeqCst);

        let mut protected: Vec<*mut u8> = Vec::with_capacity(
            SLOT_COUNT * self.records.load(Ordering::Relaxed),
        );
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            // SAFETY: records live until domain drop.
            let other = unsafe { &*cursor };
            for slot in &other.slots {
                let hazard = slot.load(Ordering::Acquire);
                if !hazard.is_null() {
                    protected.push(hazard);
                }
            }
            cursor = other.next.load(Ordering::Acquire);
        }
        protected.sort_unstable();

        let before = retired.len();
        retired.retain(|candidate| {
            if protected.binary_search(&candidate.ptr).is_ok() {
                true
            } else {
                // SAFETY: the node was unlinked before retirement and no
                // hazard protects it, so this thread holds the only
                // reference.
                unsafe { (candidate.free_fn)(candidate.ptr) };
                false
            }
        });
        debug_log!(
            domain = self.id,
            freed = before - retired.len(),
            kept = retired.len(),
            "hazard scan"
        );
    }
}

impl Default for HazardDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HazardDomain {
    fn drop(&mut self) {
        // The last Arc is gone: no thread holds an adoption, no operation
        // is in flight, so every record and every leftover retired node
        // can be freed directly.
        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            // SAFETY: exclusive access; each record is freed exactly once.
            let mut record = unsafe { Box::from_raw(cursor) };
            cursor = *record.next.get_mut();
            for candidate in record.retired.get_mut().drain(..) {
                // SAFETY: nothing can protect or reach the node anymore.
                unsafe { (candidate.free_fn)(candidate.ptr) };
            }
        }
    }
}

// ============================================================================
//  Thread-local adoption
// ============================================================================

struct AdoptedRecord {
    domain_id: u64,
    /// Keeps the domain (and therefore the record) alive until this thread
    /// lets go.
    domain: Arc<HazardDomain>,
    record: *mut HazardRecord,
}

impl Drop for AdoptedRecord {
    fn drop(&mut self) {
        self.domain.release_record(self.record);
    }
}

// ============================================================================
//  ThreadHazards
// ============================================================================

/// The calling thread's view of a domain: its four slots and its retired
/// list. Slots are cleared when this handle drops, so a map operation
/// cannot leak protection past its return.
pub(crate) struct ThreadHazards<'d> {
    domain: &'d HazardDomain,
    record: &'d HazardRecord,
}

impl ThreadHazards<'_> {
    /// Publish that slot `index` protects `ptr`.
    #[inline]
    pub(crate) fn set<T>(&self, index: usize, ptr: *mut T) {
        self.record.slots[index].store(tagged::clear(ptr).cast::<u8>(), Ordering::SeqCst);
    }

    /// Publish null into slot `index`.
    #[inline]
    pub(crate) fn clear(&self, index: usize) {
        self.record.slots[index].store(ptr::null_mut(), Ordering::SeqCst);
    }

    /// Publish null into every slot.
    #[inline]
    pub(crate) fn clear_all(&self) {
        for slot in &self.record.slots {
            slot.store(ptr::null_mut(), Ordering::SeqCst);
        }
    }

    /// Read `src` and publish the result to slot `index`, retrying until a
    /// validating re-read proves the publication was visible before the
    /// pointer could have been retired.
    ///
    /// The published word is the cleared address (retired-set membership
    /// is by unmarked address); the returned word is raw, mark bit
    /// included.
    #[inline]
    pub(crate) fn load_and_set<T>(&self, src: &AtomicPtr<T>, index: usize) -> *mut T {
        let mut current = src.load(Ordering::Acquire);
        loop {
            self.set(index, current);
            fence(Ordering::SeqCst);
            let reread = src.load(Ordering::Acquire);
            if reread == current {
                return current;
            }
            current = reread;
        }
    }

    /// Single-round variant of [`load_and_set`](Self::load_and_set):
    /// publishes what it read and reports whether the validating re-read
    /// still agreed. On failure the caller's snapshot is stale and it must
    /// restart; `out` is left untouched.
    #[inline]
    pub(crate) fn load_and_set_or_fail<T>(
        &self,
        src: &AtomicPtr<T>,
        index: usize,
        out: &mut *mut T,
    ) -> bool {
        let current = src.load(Ordering::Acquire);
        self.set(index, current);
        fence(Ordering::SeqCst);
        if src.load(Ordering::Acquire) != current {
            return false;
        }
        *out = current;
        true
    }

    /// Hand an unlinked node to the domain; frees a batch once enough have
    /// accumulated.
    pub(crate) fn retire(&self, ptr: *mut u8, free_fn: unsafe fn(*mut u8)) {
        // SAFETY: this thread owns the record while the handle exists.
        let retired = unsafe { &mut *self.record.retired.get() };
        retired.push(Retired { ptr, free_fn });
        if retired.len() >= self.domain.scan_threshold() {
            self.domain.scan(self.record);
        }
    }

    /// Run a reclamation pass immediately, regardless of the threshold.
    #[cfg(test)]
    pub(crate) fn reclaim(&self) {
        self.domain.scan(self.record);
    }

    /// Retired nodes currently waiting on this thread.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        // SAFETY: this thread owns the record while the handle exists.
        unsafe { &*self.record.retired.get() }.len()
    }
}

impl Drop for ThreadHazards<'_> {
    fn drop(&mut self) {
        self.clear_all();
    }
}

// ============================================================================
//  Tests
// ============================================================================
