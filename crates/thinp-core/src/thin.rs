//! A single thin device bound to a pool (§3, §4.7).

use std::sync::Arc;

use crate::config::ThinConfig;
use crate::error::MetadataError;
use crate::io::Bio;
use crate::ids::{ThinId, VBlock};
use crate::mapper::MapOutcome;
use crate::pool::Pool;

/// A bound thin device. Submitting I/O through this type stamps the bio
/// with the device's id before handing it to the pool's fast path.
pub struct ThinDevice {
    pool: Arc<Pool>,
    config: ThinConfig,
}

impl ThinDevice {
    /// Binds a new thin device to `pool`. Fails if the metadata store has
    /// no record of `config.dev_id` (the device must already have been
    /// created via a `create_thin`/`create_snap` pool message).
    pub async fn bind(pool: Arc<Pool>, config: ThinConfig) -> Result<Self, MetadataError> {
        // A cheap existence probe: an unmapped lookup on block 0 either
        // succeeds (device exists, possibly with no mapping yet) or fails
        // with ThinNotFound.
        match pool.metadata.find_block(config.dev_id, 0, true).await {
            Ok(_) | Err(MetadataError::WouldBlock) => {}
            Err(e) => return Err(e),
        }
        pool.bind();
        Ok(Self { pool, config })
    }

    pub fn id(&self) -> ThinId {
        self.config.dev_id
    }

    /// Maps and issues `bio` against this device (§4.5). The bio's
    /// `thin_id` is overwritten to match this device regardless of what
    /// the caller set.
    pub async fn submit(&self, mut bio: Bio) -> MapOutcome {
        bio.thin_id = self.config.dev_id;
        self.pool.map_bio(bio).await
    }

    pub async fn mapped_block_count(&self) -> Result<u64, MetadataError> {
        self.pool.metadata.get_mapped_count(self.config.dev_id).await
    }

    pub async fn highest_mapped_block(&self) -> Result<Option<VBlock>, MetadataError> {
        self.pool.metadata.get_highest_mapped(self.config.dev_id).await
    }

    /// Thin INFO line: `<mapped_sectors> <highest_mapped_sector|->`, or
    /// just `-` if the device has no mapping at all (§6.3).
    pub async fn status_info(&self) -> Result<String, MetadataError> {
        let highest = self.highest_mapped_block().await?;
        let Some(highest_block) = highest else {
            return Ok("-".to_string());
        };
        let sectors_per_block = u64::from(self.pool.config.sectors_per_block);
        let mapped_sectors = self.mapped_block_count().await? * sectors_per_block;
        let highest_sector = highest_block * sectors_per_block;
        Ok(format!("{mapped_sectors} {highest_sector}"))
    }

    pub fn status_table(&self) -> String {
        self.config.status_table()
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }
}

impl Drop for ThinDevice {
    fn drop(&mut self) {
        self.pool.unbind();
    }
}
