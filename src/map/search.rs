//! Hazard-protected list traversal.
//!
//! [`SkipListMap::search`] is a variation on the find algorithm from Maged
//! Michael's lock-free list-based sets (the SMR variant); the skip-list
//! extension descends the index levels but does not change the basic
//! algorithm or its safety argument. Besides locating a key, the traversal
//! is responsible for physically unlinking nodes that an eraser has marked
//! dead, on every level it passes them.

use std::ptr;

use crate::hazard::ThreadHazards;
use crate::node::Node;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, HEIGHT_READ, READ_ORD, RELAXED};
use crate::tagged;

use super::{HP_CUR, HP_NEXT, HP_PREV, SkipListMap};

/// A consistent snapshot of the level-0 neighborhood of a key:
///
/// - `cur` is the node with the smallest key >= the probe (or null),
/// - `prev` is the node immediately preceding it,
/// - `found` says whether `cur` actually carries the probe key.
///
/// `prev` and `cur` (and `cur`'s successor) remain hazard-protected until
/// the caller's [`ThreadHazards`] handle is dropped or overwritten, so the
/// pointers stay dereferenceable across the return.
pub(super) struct FindResult<K, V> {
    pub(super) prev: *mut Node<K, V>,
    pub(super) cur: *mut Node<K, V>,
    pub(super) found: bool,
}

impl<K, V> SkipListMap<K, V>
where
    K: Ord,
{
    /// Take a snapshot of the nodes around `key`, unlinking dead nodes
    /// encountered on the way down.
    ///
    /// Restarts from the head whenever a validation fails; each retry is
    /// caused by another thread completing its own mutation, so the search
    /// is lock-free but not wait-free.
    pub(super) fn search(&self, key: &K, hp: &ThreadHazards<'_>) -> FindResult<K, V> {
        'restart: loop {
            let mut prev = self.head;
            hp.set(HP_PREV, prev);

            let mut cur: *mut Node<K, V> = ptr::null_mut();
            let top = self.height.load(HEIGHT_READ);

            for level in (0..=top).rev() {
                // SAFETY: prev is the head or a node protected by HP_PREV.
                cur = hp.load_and_set(unsafe { &*prev }.next(level), HP_CUR);
                if tagged::is_marked(cur, level) {
                    // prev is inconsistent, and the published hazard is
                    // not validated for anything reachable. Shoot again.
                    continue 'restart;
                }

                loop {
                    let cur_clean = tagged::clear(cur);
                    if cur_clean.is_null() {
                        // End of this level (or an index-level stub of a
                        // half-built tower); descend.
                        cur = ptr::null_mut();
                        break;
                    }
                    // SAFETY: cur_clean was published to HP_CUR and
                    // validated against prev's next pointer.
                    let cur_ref = unsafe { &*cur_clean };

                    let mut next = ptr::null_mut();
                    if !hp.load_and_set_or_fail(cur_ref.next(level), HP_NEXT, &mut next) {
                        // Inconsistent read of cur.next: either cur got
                        // marked or an insert landed right behind it.
                        continue 'restart;
                    }
                    // SAFETY: prev as above.
                    if unsafe { &*prev }.next(level).load(READ_ORD) != cur {
                        // Either prev got marked or an insert landed after
                        // prev.
                        continue 'restart;
                    }

                    let cur_dead = tagged::is_marked(next, level) || cur_ref.dead();
                    if !cur_dead {
                        // SAFETY: only data nodes hang off the head.
                        if unsafe { cur_ref.key() } >= key {
                            break;
                        }
                        prev = cur_clean;
                        hp.set(HP_PREV, prev);
                        cur = next;
                        hp.set(HP_CUR, cur);
                    } else {
                        // Unlink cur at this level. Once dead, a node's
                        // next pointers are stable apart from their mark
                        // bit, so a relaxed reload is fine.
                        let stale = cur_ref.next(level).load(RELAXED);
                        // SAFETY: prev as above.
                        if unsafe { &*prev }
                            .next(level)
                            .compare_exchange(
                                cur,
                                tagged::clear(stale),
                                CAS_SUCCESS,
                                CAS_FAILURE,
                            )
                            .is_err()
                        {
                            // Insert after prev, or a concurrent unlink of
                            // cur, on this level. Restart.
                            continue 'restart;
                        }
                        // Unlinked: drop one reference, retire on the last.
                        if cur_ref.link_count.fetch_sub(1, CAS_SUCCESS) == 1 {
                            hp.clear(HP_CUR);
                            hp.retire(cur_clean.cast::<u8>(), Node::<K, V>::free_erased);
                        }
                        cur = ptr::null_mut();
                        break;
                    }
                }
            }

            let found = !cur.is_null()
                // SAFETY: a non-null cur is a data node protected by HP_CUR.
                && unsafe { (*cur).key() } == key;
            return FindResult { prev, cur, found };
        }
    }

    /// Weakly consistent level-0 sweep, applying `f` to every node that
    /// stays reachable across the pass.
    ///
    /// Restarts only when both `cur` and `prev` have gone inconsistent.
    /// The result contains every key continuously present during the
    /// sweep; keys inserted or removed while it runs may or may not
    /// appear.
    pub(super) fn sweep<T>(
        &self,
        hp: &ThreadHazards<'_>,
        f: impl Fn(&Node<K, V>) -> T,
    ) -> Vec<T> {
        'restart: loop {
            let mut out = Vec::new();
            let mut prev = self.head;
            hp.set(HP_PREV, prev);
            // The head never dies, so its next pointer is never marked.
            // SAFETY: the head is live for the map's lifetime.
            let mut cur = hp.load_and_set(unsafe { &*prev }.next(0), HP_CUR);

            'node: loop {
                if cur.is_null() {
                    return out;
                }
                // SAFETY: every path assigning cur checked it unmarked;
                // HP_CUR protects it.
                let cur_ref = unsafe { &*cur };
                out.push(f(cur_ref));

                let mut next = hp.load_and_set(cur_ref.next(0), HP_NEXT);
                while tagged::is_marked_level0(next) {
                    // cur is being deleted. Reacquire the successor of
                    // prev, giving up only if prev is dying as well.
                    // SAFETY: prev is the head or protected by HP_PREV.
                    let reacquired = hp.load_and_set(unsafe { &*prev }.next(0), HP_CUR);
                    if tagged::is_marked_level0(reacquired) {
                        continue 'restart;
                    }
                    if reacquired.is_null() {
                        return out;
                    }
                    if reacquired != cur {
                        // A replacement successor surfaced; resume from it
                        // so its entry is not dropped from the snapshot.
                        cur = reacquired;
                        continue 'node;
                    }
                    // Still the same dying node: wait for its eraser's
                    // unlink pass by reloading.
                    next = hp.load_and_set(cur_ref.next(0), HP_NEXT);
                }

                prev = cur;
                hp.set(HP_PREV, prev);
                cur = next;
                hp.set(HP_CUR, cur);
            }
        }
    }
}
