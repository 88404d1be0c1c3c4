//! Skip-list node allocation and layout.
//!
//! Nodes are allocated with `Box::into_raw` for clean pointer provenance
//! and freed along one of three paths: directly by the thread that
//! allocated them (insert lost a race before the node became visible),
//! through the hazard domain once unlinked from every level, or by the
//! map's teardown walk.

use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8};

use crate::ordering::{READ_ORD, RELAXED};
use crate::tagged;

/// Maximum tower height. With P = 0.5 the index saturates around 2^12
/// entries, which matches the intended working set.
pub(crate) const MAX_HEIGHT: usize = 12;

/// A single entry in the list, owning its key, value, and forward tower.
///
/// The key, value, and height are immutable after publication; only the
/// tower pointers, their mark bits, and `link_count` are ever mutated.
/// The head sentinel is a `Node` whose key and value are never initialized
/// and never read.
pub(crate) struct Node<K, V> {
    key: MaybeUninit<K>,
    value: MaybeUninit<V>,
    height: u8,
    /// Number of levels this node is still linked on. The thread that
    /// drops it to zero after the node is dead retires the node, exactly
    /// once.
    pub(crate) link_count: AtomicU8,
    /// Forward pointers, one per level in `0..height`.
    tower: Box<[AtomicPtr<Node<K, V>>]>,
}

impl<K, V> Node<K, V> {
    /// Allocate a node suitable for inclusion in `height` lists.
    ///
    /// `tower[0]` starts null; the index levels start as marked-null stubs
    /// so concurrent traversals can tell "not yet linked here" from "end
    /// of list" (see the `tagged` module).
    pub(crate) fn alloc(height: usize, key: K, value: V) -> *mut Self {
        debug_assert!((1..=MAX_HEIGHT).contains(&height));

        let tower: Box<[AtomicPtr<Self>]> = (0..height)
            .map(|level| {
                if level == 0 {
                    AtomicPtr::new(ptr::null_mut())
                } else {
                    AtomicPtr::new(tagged::marked_null())
                }
            })
            .collect();

        // Heights are bounded by MAX_HEIGHT, far below u8::MAX.
        #[allow(clippy::cast_possible_truncation)]
        let height = height as u8;

        Box::into_raw(Box::new(Self {
            key: MaybeUninit::new(key),
            value: MaybeUninit::new(value),
            height,
            link_count: AtomicU8::new(0),
            tower,
        }))
    }

    /// Allocate the head sentinel: full height, all-null tower, no entry.
    pub(crate) fn alloc_head() -> *mut Self {
        let tower: Box<[AtomicPtr<Self>]> = (0..MAX_HEIGHT)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();

        #[allow(clippy::cast_possible_truncation)]
        let height = MAX_HEIGHT as u8;

        Box::into_raw(Box::new(Self {
            key: MaybeUninit::uninit(),
            value: MaybeUninit::uninit(),
            height,
            link_count: AtomicU8::new(0),
            tower,
        }))
    }

    #[inline]
    pub(crate) fn height(&self) -> usize {
        usize::from(self.height)
    }

    /// The forward pointer at `level`.
    #[inline]
    pub(crate) fn next(&self, level: usize) -> &AtomicPtr<Self> {
        &self.tower[level]
    }

    /// Whether this node has been marked dead (level-0 pointer carries the
    /// mark).
    #[inline]
    pub(crate) fn dead(&self) -> bool {
        tagged::is_marked_level0(self.tower[0].load(READ_ORD))
    }

    /// Set the link count to one reference per level, the inserter's
    /// optimistic assumption before index linkage begins.
    #[inline]
    pub(crate) fn assume_fully_linked(&self) {
        self.link_count.store(self.height, RELAXED);
    }

    /// # Safety
    ///
    /// Only data nodes carry an entry; the head sentinel must never reach
    /// this accessor.
    #[inline]
    pub(crate) unsafe fn key(&self) -> &K {
        // SAFETY: per the caller contract, `self` is a data node, whose
        // key was written in `alloc` and is immutable afterwards.
        unsafe { self.key.assume_init_ref() }
    }

    /// # Safety
    ///
    /// Only data nodes carry an entry; the head sentinel must never reach
    /// this accessor.
    #[inline]
    pub(crate) unsafe fn value(&self) -> &V {
        // SAFETY: as for `key`.
        unsafe { self.value.assume_init_ref() }
    }

    /// Free a data node, dropping its entry.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Node::alloc`], must not be freed twice, and
    /// no other thread may hold a reference to it.
    pub(crate) unsafe fn free(ptr: *mut Self) {
        // SAFETY: caller guarantees exclusive ownership of a live node
        // allocated by `alloc`, so the entry is initialized and the box
        // round-trips through `from_raw`.
        unsafe {
            (*ptr).key.assume_init_drop();
            (*ptr).value.assume_init_drop();
            drop(Box::from_raw(ptr));
        }
    }

    /// Free the head sentinel, which has no entry to drop.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Node::alloc_head`] and must not be freed
    /// twice.
    pub(crate) unsafe fn free_head(ptr: *mut Self) {
        // SAFETY: caller guarantees this is the sentinel from `alloc_head`;
        // its key and value were never initialized, so only the box is
        // reclaimed.
        unsafe {
            drop(Box::from_raw(ptr));
        }
    }

    /// Type-erased reclaimer handed to the hazard domain.
    ///
    /// # Safety
    ///
    /// `ptr` must be a retired `Node<K, V>` allocated by [`Node::alloc`],
    /// and the hazard domain must have established that no thread still
    /// protects it.
    pub(crate) unsafe fn free_erased(ptr: *mut u8) {
        // SAFETY: the retire call that registered this function paired it
        // with a pointer of exactly this type.
        unsafe {
            Self::free(ptr.cast::<Self>());
        }
    }
}
