//! # skipmap
//!
//! A lock-free concurrent ordered map, implemented as a skip list with safe
//! memory reclamation via hazard pointers.
//!
//! [`SkipListMap`] supports concurrent `insert`, `get`, `contains_key`,
//! `remove`, `first_key`, and weakly consistent `values`/`entries` snapshots
//! from any number of threads. Lookups never block; mutations are CAS-based
//! and lock-free.
//!
//! ## Design
//!
//! - A sorted, lock-free level-0 linked list holds every entry and is the
//!   linearizable source of truth (a variation on Maged Michael's list-based
//!   set algorithm).
//! - Probabilistic index levels above it (P = 0.5, max height 12) accelerate
//!   search to expected O(log n). Index linkage is best-effort: an inserter
//!   that loses a race on an upper level simply gives up on that level,
//!   which affects performance but never correctness.
//! - Logical deletion is a mark bit in the low bit of each next pointer;
//!   marked nodes are physically unlinked by later traversals and handed to
//!   a per-map hazard-pointer domain for deferred reclamation.
//!
//! ## Example
//!
//! ```
//! use skipmap::SkipListMap;
//!
//! let map = SkipListMap::new();
//! assert!(map.insert(3, "three"));
//! assert!(map.insert(1, "one"));
//! assert!(!map.insert(3, "again")); // duplicate keys are rejected
//!
//! assert_eq!(map.get(&3), Some("three"));
//! assert_eq!(map.first_key(), Some(1));
//!
//! assert!(map.remove(&3));
//! assert!(!map.remove(&3)); // only one caller observes the removal
//! ```
//!
//! ## Concurrency contract
//!
//! Point operations are linearizable: `insert` takes effect at the CAS that
//! links the node into level 0, `remove` at the CAS that marks the victim's
//! level-0 pointer. `values` and `entries` are weakly consistent: they see
//! every key that is present for the whole scan and may or may not see keys
//! inserted or removed while the scan runs.

mod hazard;
mod map;
mod node;
mod ordering;
mod random;
mod tagged;
mod tracing_helpers;

pub use hazard::HazardDomain;
pub use map::SkipListMap;
