//! Standard memory orderings for concurrent list access.
//!
//! These constants ensure consistent ordering usage across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for loading next pointers during traversal.
/// Pairs with writers' Release stores.
pub(crate) const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing next pointers.
/// Pairs with readers' Acquire loads.
pub(crate) const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for CAS success (link, unlink, mark installs).
pub(crate) const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for CAS failure.
/// Only need to see the current value.
pub(crate) const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for loads where synchronization is established elsewhere.
/// A dead node's next pointers are stable apart from their mark bit.
pub(crate) const RELAXED: Ordering = Ordering::Relaxed;

/// Ordering for reading the map's current index height.
/// The height is a hint; a stale read only costs extra descent levels.
pub(crate) const HEIGHT_READ: Ordering = Ordering::Relaxed;

/// Ordering for growing the map's current index height.
pub(crate) const HEIGHT_WRITE: Ordering = Ordering::Release;
