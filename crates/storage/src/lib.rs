//! Storage layer for Tessera
//!
//! This crate implements the multi-version tuple store:
//! - TileGroup: fixed-capacity block of slot cells holding chain heads
//! - TupleVersion: one physical version with atomic visibility metadata
//! - VersionArena: id-keyed owner of every version (links are arena ids)
//! - VersionStore: slot allocation, chain traversal, head CAS
//! - VersionCollector: epoch-based reclamation of superseded versions

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod gc;
pub mod store;
pub mod tile_group;
pub mod version;

pub use gc::VersionCollector;
pub use store::{ChainIter, VersionStore, DEFAULT_TILE_GROUP_CAPACITY};
pub use tile_group::TileGroup;
pub use version::{TupleVersion, VersionArena, VersionId};
