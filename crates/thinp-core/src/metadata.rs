//! The metadata store boundary (§6.1): the persistent B-tree and space-map
//! layer, consumed only from worker context.

use async_trait::async_trait;

use crate::error::MetadataError;
use crate::ids::{DBlock, ThinId, VBlock};

/// Result of a (possibly non-blocking) lookup of `(thin, v)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    NotFound,
    WouldBlock,
    Found { data_block: DBlock, shared: bool },
}

/// The metadata store. Implementations own the on-disk (or, for this repo's
/// reference implementation, in-memory) B-tree and space-map.
///
/// Every operation is `async` so the worker task can await it without
/// blocking its executor thread; §5 still requires that no pool queue lock
/// is held across any of these calls.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Rebinds the store to a new metadata backing device path, e.g. after
    /// the pool target is reloaded with a different `metadata_dev` table
    /// argument. Does not touch the B-tree or space-map state.
    async fn rebind(&self, new_bdev: &str) -> Result<(), MetadataError>;

    async fn get_data_dev_size(&self) -> Result<u64, MetadataError>;
    async fn resize_data_dev(&self, new_blocks: u64) -> Result<(), MetadataError>;

    async fn alloc_data_block(&self) -> Result<DBlock, MetadataError>;
    async fn get_free_block_count(&self) -> Result<u64, MetadataError>;
    async fn get_free_metadata_block_count(&self) -> Result<u64, MetadataError>;
    async fn get_held_metadata_root(&self) -> Result<Option<u64>, MetadataError>;

    async fn get_transaction_id(&self) -> Result<u64, MetadataError>;
    async fn set_transaction_id(&self, old: u64, new: u64) -> Result<(), MetadataError>;

    async fn create_thin(&self, id: ThinId) -> Result<(), MetadataError>;
    async fn create_snap(&self, id: ThinId, origin_id: ThinId) -> Result<(), MetadataError>;
    async fn delete_thin(&self, id: ThinId) -> Result<(), MetadataError>;
    async fn trim_thin(&self, id: ThinId, new_blocks: u64) -> Result<(), MetadataError>;

    async fn find_block(
        &self,
        thin: ThinId,
        v: VBlock,
        can_block: bool,
    ) -> Result<LookupResult, MetadataError>;
    async fn insert_block(&self, thin: ThinId, v: VBlock, d: DBlock) -> Result<(), MetadataError>;

    async fn get_mapped_count(&self, thin: ThinId) -> Result<u64, MetadataError>;
    async fn get_highest_mapped(&self, thin: ThinId) -> Result<Option<VBlock>, MetadataError>;

    async fn commit(&self) -> Result<(), MetadataError>;
}
