//! The per-bucket storage engine.
//!
//! Each logical bucket is a versioned key-value store: values are kept as sets of concurrent
//! siblings tagged with dotted version vectors, so writes never conflict destructively, and a
//! fixed-depth merkle tree indexes the keyspace so that peers can efficiently locate
//! divergent ranges during anti-entropy sync sessions.

pub mod merkle;
#[cfg(test)]
mod merkle_test;
pub mod multilock;
pub mod siblings;
#[cfg(test)]
mod siblings_test;
pub mod store;
#[cfg(test)]
mod store_test;

pub use siblings::{ConflictResolution, Sibling, SiblingSet, UpdateBatch};
pub use store::BucketStore;
