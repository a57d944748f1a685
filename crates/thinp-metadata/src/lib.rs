//! A `thinp_core::metadata::MetadataStore` implementation backed by
//! in-process state, guarded by a single `tokio::sync::Mutex`.
//!
//! Unlike `thinp_core::testing::InMemoryMetadataStore` (a bare
//! synchronous stand-in used by the demo binary and unit tests inside
//! `thinp-core` itself), this store is meant to be exercised from the
//! simulation harness: it models held metadata roots and commit
//! generations, and holds its state behind an async mutex so the
//! simulation can interleave commits with concurrent lookups the way a
//! real B-tree-backed store would.

mod store;

pub use store::TokioMetadataStore;
