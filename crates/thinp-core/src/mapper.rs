//! The fast path (§4.5): runs in submitter context and must never suspend
//! on anything but the metadata store's own (typically instant) lookup.

use std::sync::Arc;

use crate::io::{Bio, BioCompletion};
use crate::metadata::LookupResult;
use crate::pool::Pool;

/// What the fast path did with a bio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOutcome {
    /// Remapped onto an existing, unshared data block and issued directly.
    Remapped,
    /// Handed to the worker: not yet mapped, shared, a flush, or the
    /// lookup would otherwise have blocked.
    Deferred,
}

impl Pool {
    /// Attempts to map and issue `bio` without blocking. Falls back to the
    /// deferred queue on anything that needs the worker (§4.5).
    pub async fn map_bio(self: &Arc<Self>, bio: Bio) -> MapOutcome {
        if bio.flags.needs_flush() {
            self.defer_bio(bio);
            return MapOutcome::Deferred;
        }

        let block = self.config.block_of(bio.sector);
        match self.metadata.find_block(bio.thin_id, block, false).await {
            Ok(LookupResult::Found { data_block, shared: false }) => {
                let mut bio = bio;
                self.remap(&mut bio, block, data_block);
                self.issue(bio).await;
                MapOutcome::Remapped
            }
            _ => {
                self.defer_bio(bio);
                MapOutcome::Deferred
            }
        }
    }

    /// Rewrites a bio's sector from `(virtual block, offset)` to the
    /// physical `data_block` (§3, "remap").
    pub(crate) fn remap(&self, bio: &mut Bio, _virt_block: u64, data_block: u64) {
        let original = bio.sector;
        bio.sector = self.config.remap_sector(data_block, original);
        bio.remapped = true;
    }

    /// Submits a remapped bio to the underlying device and completes it.
    pub(crate) async fn issue(&self, mut bio: Bio) {
        let block = self.config.block_of(bio.sector);
        let begin = self.config.offset_of(bio.sector) as u32;
        let result = self.io.submit(block, begin, bio.nr_sectors, &bio.payload).await;
        match result {
            Ok(Some(data)) => bio.complete(Ok(BioCompletion::Data(data))),
            Ok(None) => bio.complete(Ok(BioCompletion::Written)),
            Err(e) => bio.complete(Err(e)),
        }
    }
}
