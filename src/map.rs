//! Filepath: src/map.rs
//!
//! The concurrent skip-list map.
//!
//! A sorted lock-free linked list at level 0 holds every entry and decides
//! every race; the index levels above it only accelerate search. Insert
//! links a node into level 0 with a CAS and then builds its index tower
//! best-effort, giving up on the first inconsistency. Remove marks the
//! victim's pointers top-down and lets the next traversal unlink it.
//! Reclamation goes through the map's hazard-pointer domain.

mod search;


use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use crate::hazard::{HazardDomain, ThreadHazards};
use crate::node::{MAX_HEIGHT, Node};
use crate::ordering::{
    CAS_FAILURE, CAS_SUCCESS, HEIGHT_READ, HEIGHT_WRITE, READ_ORD, RELAXED, WRITE_ORD,
};
use crate::random;
use crate::tagged;
use crate::tracing_helpers::trace_log;

// Hazard slot assignment, shared by every operation: the traversal's
// moving window plus one slot for insert's not-yet-linked node.
pub(crate) const HP_NEXT: usize = 0;
pub(crate) const HP_CUR: usize = 1;
pub(crate) const HP_PREV: usize = 2;
pub(crate) const HP_NEW: usize = 3;

/// A lock-free ordered map backed by a concurrent skip list.
///
/// Point operations (`insert`, `get`, `contains_key`, `remove`,
/// `first_key`) are linearizable; `values` and `entries` are weakly
/// consistent snapshots. All operations may be called concurrently from
/// any number of threads.
///
/// Keys are immutable once inserted. `K` needs a total order; values are
/// returned by cloning, so lookups require `V: Clone`.
///
/// # Example
///
/// ```
/// use skipmap::SkipListMap;
///
/// let map = SkipListMap::new();
/// assert!(map.insert("a", 1));
/// assert_eq!(map.get(&"a"), Some(1));
/// assert!(map.remove(&"a"));
/// assert_eq!(map.get(&"a"), None);
/// ```
pub struct SkipListMap<K, V> {
    /// Sentinel of full height; first on every level, never marked, never
    /// retired.
    head: *mut Node<K, V>,

    /// Highest index level currently in use, in `[0, MAX_HEIGHT - 1]`.
    /// Grows by at most one per insert and never shrinks.
    height: AtomicUsize,

    /// Reclamation domain shared by this map's operations.
    smr: Arc<HazardDomain>,
}

// SAFETY: the map owns its nodes, and keys and values only cross threads
// by value: insert moves them in, lookups clone them out under hazard
// protection.
unsafe impl<K: Send, V: Send> Send for SkipListMap<K, V> {}
// SAFETY: shared access hands out &K / &V only for comparison and cloning
// while a hazard slot pins the node, so the usual bounds suffice.
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for SkipListMap<K, V> {}

impl<K, V> SkipListMap<K, V>
where
    K: Ord,
{
    /// Create an empty map with its own reclamation domain.
    #[must_use]
    pub fn new() -> Self {
        Self::with_domain(Arc::new(HazardDomain::new()))
    }

    /// Create an empty map on an existing reclamation domain.
    ///
    /// Sharing one domain across maps amortizes per-thread hazard records;
    /// a dedicated domain isolates a map's reclamation (useful in tests).
    #[must_use]
    pub fn with_domain(smr: Arc<HazardDomain>) -> Self {
        Self {
            head: Node::alloc_head(),
            height: AtomicUsize::new(0),
            smr,
        }
    }

    /// Draw a tower level in `[0, MAX_HEIGHT)`: geometric with P = 0.5,
    /// per Pugh's cookbook.
    fn random_level() -> usize {
        let mut bits = random::next_u64();
        let mut level = 0;
        while level < MAX_HEIGHT - 1 && {
            bits >>= 1;
            bits & 1 != 0
        } {
            level += 1;
        }
        level
    }

    /// Insert `key -> value`, returning `true` iff the key was absent.
    ///
    /// Linearizes at the CAS that links the new node into level 0; a
    /// duplicate key leaves the map unchanged and returns `false`.
    pub fn insert(&self, key: K, value: V) -> bool {
        let mut level = Self::random_level();
        let current = self.height.load(HEIGHT_READ);
        if level > current {
            // Clamp growth to one level per insert.
            level = current + 1;
            self.height.store(level, HEIGHT_WRITE);
            trace_log!(height = level, "index height grew");
        }

        let hp = self.smr.hazards();
        let mut found = self.search(&key, &hp);
        if found.found {
            return false;
        }

        // The node becomes visible before its index linkage completes, so
        // it stays hazard-protected for the rest of the operation.
        let node = Node::alloc(level + 1, key, value);
        hp.set(HP_NEW, node);
        // SAFETY: freshly allocated, protected by HP_NEW.
        let node_ref = unsafe { &*node };

        // Assume full linkage on every list; corrected on exit.
        node_ref.assume_fully_linked();

        loop {
            node_ref.next(0).store(found.cur, WRITE_ORD);
            // SAFETY: found.prev is the head or protected by HP_PREV.
            if unsafe { &*found.prev }
                .next(0)
                .compare_exchange(found.cur, node, CAS_SUCCESS, CAS_FAILURE)
                .is_ok()
            {
                break;
            }

            // A possibly intervening entry was inserted. Repeating the
            // search from the top is always correct.
            // SAFETY: the node is still exclusively ours.
            found = self.search(unsafe { node_ref.key() }, &hp);
            if found.found {
                hp.clear(HP_NEW);
                // Never visible to another thread: free directly, no
                // retirement needed.
                // SAFETY: the level-0 CAS never succeeded.
                unsafe { Node::free(node) };
                return false;
            }
        }

        self.link_index_levels(node, level, &hp);
        true
    }

    /// Best-effort linkage of a freshly inserted node into its index
    /// levels, following the structure of the search descent.
    ///
    /// Concurrent modification shows up as CAS failures or marked
    /// pointers; since the index lists are an optimization only, the
    /// first inconsistency simply abandons the remaining levels. That
    /// costs performance, never correctness.
    fn link_index_levels(&self, node: *mut Node<K, V>, level: usize, hp: &ThreadHazards<'_>) {
        // SAFETY: protected by HP_NEW for the whole call.
        let node_ref = unsafe { &*node };
        // SAFETY: key is immutable after allocation.
        let key = unsafe { node_ref.key() };

        let mut prev = self.head;
        let mut overage = node_ref.height() - 1;

        let top = self.height.load(HEIGHT_READ);
        'link: {
            for index_level in (1..=level.max(top)).rev() {
                // SAFETY: prev is the head or protected by HP_PREV.
                let mut cur = hp.load_and_set(unsafe { &*prev }.next(index_level), HP_CUR);
                // Note the _explicit_ level-0 mark test: a marked null
                // here is another insert's half-built tower, and splicing
                // into it would break that tower's linkage.
                if tagged::is_marked_level0(cur) {
                    break 'link;
                }

                loop {
                    let cur_clean = tagged::clear(cur);
                    if cur_clean.is_null() {
                        break;
                    }
                    // SAFETY: published to HP_CUR by load_and_set.
                    let cur_ref = unsafe { &*cur_clean };
                    // SAFETY: data nodes only below the head.
                    if unsafe { cur_ref.key() } >= key {
                        break;
                    }

                    // Spurious failures from an insert after cur are fine;
                    // they just end index construction early.
                    let next = hp.load_and_set(cur_ref.next(index_level), HP_NEXT);
                    if tagged::is_marked_index(next) {
                        break 'link;
                    }
                    // SAFETY: prev as above.
                    if unsafe { &*prev }.next(index_level).load(READ_ORD) != cur {
                        // prev changed; a full restart would be needed to
                        // keep searching, so give up instead.
                        break 'link;
                    }

                    prev = cur_clean;
                    hp.set(HP_PREV, prev);
                    cur = next;
                    hp.set(HP_CUR, cur);
                }

                if index_level <= level {
                    node_ref.next(index_level).store(cur, WRITE_ORD);
                    // SAFETY: prev as above.
                    if unsafe { &*prev }
                        .next(index_level)
                        .compare_exchange(cur, node, CAS_SUCCESS, CAS_FAILURE)
                        .is_err()
                    {
                        // Insert after prev on this level, or prev was
                        // marked. Abort the remaining levels.
                        break 'link;
                    }
                    overage -= 1;
                }

                if node_ref.dead() {
                    // Concurrently erased; stop building the tower.
                    break 'link;
                }
            }
        }

        if overage > 0 {
            trace_log!(unlinked_levels = overage, "index linkage cut short");
            // The link count assumed a full tower; drop the levels that
            // never happened. Whoever takes the count to zero retires.
            // Heights are bounded by MAX_HEIGHT, far below u8::MAX.
            #[allow(clippy::cast_possible_truncation)]
            let overage = overage as u8;
            if node_ref.link_count.fetch_sub(overage, CAS_SUCCESS) == overage {
                hp.clear(HP_NEW);
                hp.retire(node.cast::<u8>(), Node::<K, V>::free_erased);
            }
        }
    }

    /// Look up `key`, cloning its value on a hit.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let hp = self.smr.hazards();
        let found = self.search(key, &hp);
        found
            .found
            // SAFETY: found.cur is a data node protected by HP_CUR.
            .then(|| unsafe { (*found.cur).value() }.clone())
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        let hp = self.smr.hazards();
        self.search(key, &hp).found
    }

    /// Remove `key`, returning `true` iff this caller logically removed
    /// it.
    ///
    /// Linearizes at the CAS that marks the victim's level-0 pointer: of
    /// any number of concurrent removers of the same key, exactly one
    /// observes the unmarked-to-marked transition and reports success.
    pub fn remove(&self, key: &K) -> bool {
        let hp = self.smr.hazards();
        let found = self.search(key, &hp);
        if !found.found {
            return false;
        }
        // SAFETY: found.cur is a data node protected by HP_CUR.
        let cur_ref = unsafe { &*found.cur };

        // Mark the node dead at every level, top down. Marking needs no
        // consistent neighborhood snapshot: on CAS failure just reload,
        // since marking is tolerant of concurrent pointer changes.
        let mut won_level0 = false;
        for level in (0..cur_ref.height()).rev() {
            let mut next = cur_ref.next(level).load(READ_ORD);
            while let Err(actual) = cur_ref.next(level).compare_exchange(
                next,
                tagged::mark(next),
                CAS_SUCCESS,
                CAS_FAILURE,
            ) {
                next = actual;
            }
            if level == 0 && !tagged::is_marked_level0(next) {
                // Marking list 0 is the linearization point: only one of
                // N concurrent removers can install this transition.
                won_level0 = true;
            }
        }

        // The node is dead but may still be linked. We hold no snapshot
        // of its neighborhood at every level, so run the search again and
        // let its descent unlink (and eventually retire) the node.
        let _ = self.search(key, &hp);

        won_level0
    }

    /// The smallest key, or `None` when the map is empty.
    #[must_use]
    pub fn first_key(&self) -> Option<K>
    where
        K: Clone,
    {
        let hp = self.smr.hazards();
        // SAFETY: the head is live for the map's lifetime.
        let head_ref = unsafe { &*self.head };
        let cur = loop {
            let cur = hp.load_and_set(head_ref.next(0), HP_CUR);
            if !tagged::is_marked_level0(cur) {
                break cur;
            }
        };
        // SAFETY: a non-null cur is a data node protected by HP_CUR.
        (!cur.is_null()).then(|| unsafe { (*cur).key() }.clone())
    }

    /// A weakly consistent snapshot of the values.
    ///
    /// Contains the value of every key present for the whole call; keys
    /// inserted or removed concurrently may or may not appear. Note
    /// carefully that the order is not specified.
    #[must_use]
    pub fn values(&self) -> Vec<V>
    where
        V: Clone,
    {
        let hp = self.smr.hazards();
        // SAFETY: every node on level 0 is a data node.
        self.sweep(&hp, |node| unsafe { node.value() }.clone())
    }

    /// A weakly consistent snapshot of the entries; same contract as
    /// [`values`](Self::values).
    #[must_use]
    pub fn entries(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let hp = self.smr.hazards();
        // SAFETY: every node on level 0 is a data node.
        self.sweep(&hp, |node| unsafe {
            (node.key().clone(), node.value().clone())
        })
    }
}

impl<K, V> Default for SkipListMap<K, V>
where
    K: Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for SkipListMap<K, V> {
    fn drop(&mut self) {
        // Exclusive access: the caller guarantees no operation is still in
        // flight. Walk level 0 freeing every data node, then the head.
        // Nodes that were retired earlier are unreachable from the head
        // and drain when the domain's last holder lets go of it.
        // SAFETY: exclusive access to a quiescent list; every node is
        // freed exactly once because retirement only happens after a node
        // is unlinked from level 0.
        unsafe {
            let mut cur = tagged::clear((*self.head).next(0).load(RELAXED));
            while !cur.is_null() {
                let next = tagged::clear((*cur).next(0).load(RELAXED));
                Node::free(cur);
                cur = next;
            }
            Node::free_head(self.head);
        }
    }
}

// ============================================================================
//  Tests
// ============================================================================
