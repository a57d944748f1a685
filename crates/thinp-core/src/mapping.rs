//! New-mapping records and end-I/O hooks (C3) and the record's state
//! machine (§4.6).

use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;

use crate::deferred_set::DeferredHandle;
use crate::error::BioError;
use crate::ids::{DBlock, ThinId, VBlock};
use crate::prison::Cell;

/// Which end-I/O interceptor is attached to a bio's context slot. Dispatch
/// in this port happens inline in the async function driving the bio
/// rather than through a stored callback (there is no interrupt context to
/// defer to), but the tag is retained on the bio for introspection and to
/// keep the two code paths (overwrite vs. shared-read) textually distinct,
/// matching the original two-variant design.
#[derive(Debug, Clone, Copy)]
pub enum EndioHook {
    /// Attached to a whole-block write that is itself driving a
    /// provision or sharing-break. Marks the record prepared once the
    /// remap-and-issue completes.
    Overwrite,
    /// Attached to a read remapped onto a still-shared data block. Drains
    /// the bound deferred-set handle once the read completes.
    SharedRead { handle: DeferredHandle },
}

/// States of a new-mapping record (§4.6). `Failed` is terminal and is not
/// modeled as a variant here — callers route to failure out-of-band, since
/// a failed record carries an error and is about to be dropped rather than
/// transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    Created,
    Scheduled,
    Prepared,
    Committed,
    Released,
}

/// An in-flight provisioning/COW record (§3, §4.6).
pub struct NewMappingRecord {
    pub thin_id: ThinId,
    pub virt_block: VBlock,
    pub data_block: DBlock,
    pub cell: Arc<Cell>,
    /// The data-scope cell serializing this record's sharing-break against
    /// other thin devices racing to break sharing on the same physical
    /// block. `None` for records created by fresh provisioning, which
    /// never contends with another thin device over a not-yet-shared `d`.
    pub data_cell: Option<Arc<Cell>>,
    /// The whole-block write driving an overwrite-path record. `None` for
    /// copy/zero records where the triggering bio is left in the cell's
    /// queue to be redispatched once the mapping commits.
    pub driving_bio: Option<crate::io::Bio>,
    pub state: MappingState,
    pub err: Option<BioError>,
    /// Holds the mapping-record reserve permit for the record's lifetime;
    /// freed automatically on drop, once the record is released.
    mapping_permit: Option<OwnedSemaphorePermit>,
}

impl NewMappingRecord {
    pub fn new(
        thin_id: ThinId,
        virt_block: VBlock,
        data_block: DBlock,
        cell: Arc<Cell>,
        mapping_permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            thin_id,
            virt_block,
            data_block,
            cell,
            data_cell: None,
            driving_bio: None,
            state: MappingState::Created,
            err: None,
            mapping_permit: Some(mapping_permit),
        }
    }

    pub fn with_driving_bio(mut self, bio: crate::io::Bio) -> Self {
        self.driving_bio = Some(bio);
        self
    }

    pub fn with_data_cell(mut self, data_cell: Arc<Cell>) -> Self {
        self.data_cell = Some(data_cell);
        self
    }

    pub fn mark_scheduled(&mut self) {
        debug_assert_eq!(self.state, MappingState::Created);
        self.state = MappingState::Scheduled;
    }

    pub fn mark_prepared(&mut self) {
        debug_assert_eq!(self.state, MappingState::Scheduled);
        self.state = MappingState::Prepared;
    }

    pub fn mark_committed(&mut self) {
        debug_assert_eq!(self.state, MappingState::Prepared);
        self.state = MappingState::Committed;
    }

    pub fn mark_released(&mut self) {
        debug_assert_eq!(self.state, MappingState::Committed);
        self.state = MappingState::Released;
    }

    pub fn fail(&mut self, err: BioError) {
        self.err = Some(err);
    }

    pub fn is_prepared(&self) -> bool {
        self.state == MappingState::Prepared
    }
}
