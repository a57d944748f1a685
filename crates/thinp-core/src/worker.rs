//! The worker task (§4.4): the only context allowed to touch the metadata
//! store, drive copies, or block on a reserve pool. Drains the deferred-bio
//! queue and the prepared-mapping queue until both are empty, then sleeps.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;

use crate::copy_engine::Region;
use crate::error::{BioError, MetadataError};
use crate::io::{Bio, BioCompletion, BioFlags, SECTOR_SIZE};
use crate::mapping::{EndioHook, NewMappingRecord};
use crate::metadata::LookupResult;
use crate::pool::Pool;
use crate::prison::{Cell, CellKey, Detain};

/// Drains both pool queues to quiescence, then waits to be woken.
pub async fn run(pool: Arc<Pool>) {
    loop {
        let (prepared, deferred) = {
            let mut q = pool.queues.lock().unwrap();
            (
                std::mem::take(&mut q.prepared_mappings),
                std::mem::take(&mut q.deferred_bios),
            )
        };

        if prepared.is_empty() && deferred.is_empty() {
            pool.wake.notified().await;
            continue;
        }

        for record in prepared {
            process_prepared(&pool, record).await;
        }
        for bio in deferred {
            process_deferred_bio(&pool, bio).await;
        }
    }
}

/// A mapping record has reached `Prepared`: install it in the metadata
/// store, commit, release the cell, and redeliver anything that queued up
/// behind it (§4.6).
async fn process_prepared(pool: &Arc<Pool>, mut record: NewMappingRecord) {
    if let Err(e) = pool
        .metadata
        .insert_block(record.thin_id, record.virt_block, record.data_block)
        .await
    {
        tracing::error!(
            thin_id = record.thin_id,
            virt_block = record.virt_block,
            error = %e,
            "mapping insert failed"
        );
        let mut out = VecDeque::new();
        pool.prison.release(&record.cell, &mut out);
        if let Some(data_cell) = record.data_cell.take() {
            pool.prison.release(&data_cell, &mut out);
        }
        if let Some(mut bio) = record.driving_bio.take() {
            bio.fail(e.clone().into());
        }
        for mut bio in out {
            bio.fail(e.clone().into());
        }
        return;
    }
    record.mark_committed();

    if let Err(e) = pool.metadata.commit().await {
        tracing::error!(error = %e, "metadata commit failed");
        let mut out = VecDeque::new();
        pool.prison.release(&record.cell, &mut out);
        if let Some(data_cell) = record.data_cell.take() {
            pool.prison.release(&data_cell, &mut out);
        }
        if let Some(mut bio) = record.driving_bio.take() {
            bio.fail(e.clone().into());
        }
        for mut bio in out {
            bio.fail(e.clone().into());
        }
        return;
    }

    let mut siblings = VecDeque::new();
    pool.prison.release(&record.cell, &mut siblings);
    if let Some(data_cell) = record.data_cell.take() {
        pool.prison.release(&data_cell, &mut siblings);
    }
    record.mark_released();

    if let Some(mut bio) = record.driving_bio.take() {
        bio.complete(Ok(BioCompletion::Written));
    }
    for bio in siblings {
        pool.defer_bio(bio);
    }
}

/// The slow path for a single deferred bio (§4.5, §4.6).
async fn process_deferred_bio(pool: &Arc<Pool>, mut bio: Bio) {
    if bio.flags.needs_flush() {
        if let Err(e) = pool.metadata.commit().await {
            tracing::error!(error = %e, "flush commit failed");
            bio.fail(e.into());
            return;
        }
        bio.flags.remove(BioFlags::FLUSH | BioFlags::FUA);
        if bio.nr_sectors == 0 {
            bio.complete(Ok(BioCompletion::Written));
            return;
        }
    }

    let block = pool.config.block_of(bio.sector);
    let key = CellKey::virt(bio.thin_id, block);

    let (cell, prior) = match pool.prison.detain(key, bio) {
        Detain::Existing { cell, prior } => (cell, prior),
        Detain::NeedsNew(bio) => {
            let permit = pool.cell_reserve.acquire().await;
            pool.prison.create_cell(key, bio, permit)
        }
    };
    if prior > 0 {
        // Already being handled by an in-flight mapping record for this key.
        return;
    }

    match pool.metadata.find_block(key.thin_id, block, true).await {
        Ok(LookupResult::NotFound) => {
            let bio = cell
                .take_driving()
                .expect("freshly created cell must hold its initiating bio");
            if bio.flags.is_write() {
                provision(Arc::clone(pool), bio, key, cell).await;
            } else {
                let mut out = VecDeque::new();
                pool.prison.release(&cell, &mut out);
                debug_assert!(out.is_empty());
                complete_zero_read(bio);
            }
        }
        Ok(LookupResult::Found { data_block, shared: false }) => {
            let mut bio = pool.prison.release_singleton(&cell);
            pool.remap(&mut bio, block, data_block);
            pool.issue(bio).await;
        }
        Ok(LookupResult::Found { data_block, shared: true }) => {
            let bio = cell
                .take_driving()
                .expect("freshly created cell must hold its initiating bio");
            if bio.flags.is_write() {
                break_sharing(Arc::clone(pool), bio, key, data_block, cell).await;
            } else {
                shared_read(Arc::clone(pool), bio, data_block, cell).await;
            }
        }
        Ok(LookupResult::WouldBlock) => {
            unreachable!("blocking lookup (can_block = true) must not return WouldBlock")
        }
        Err(e) => {
            pool.prison.fail(&cell, || e.clone().into());
        }
    }
}

/// A read against a virtual block with no mapping reads as all zeros,
/// without provisioning anything (§4.5).
fn complete_zero_read(mut bio: Bio) {
    let zeros = vec![0u8; bio.nr_sectors as usize * SECTOR_SIZE];
    bio.complete(Ok(BioCompletion::Data(zeros)));
}

/// A write landed on an unmapped virtual block: allocate a fresh data
/// block and schedule either a direct overwrite or a zero-then-write,
/// depending on whether the bio covers the whole block (§4.5, §4.6).
async fn provision(pool: Arc<Pool>, bio: Bio, key: CellKey, cell: Arc<Cell>) {
    match pool.metadata.alloc_data_block().await {
        Ok(d) => {
            let permit = pool.mapping_reserve.acquire().await;
            dispatch_new_block(pool, bio, key, d, cell, permit).await;
        }
        Err(e) if is_out_of_space(&e) => {
            release_to_retry(&pool, bio, &cell).await;
        }
        Err(e) => {
            fail_driving_and_cell(&pool, bio, &cell, e);
        }
    }
}

/// A write landed on a shared data block: allocate a fresh block, copy or
/// zero it as needed, and schedule the install, serialized against any
/// other thin device racing to break sharing on the same physical block
/// (§3, data-scope cell keys) and gated through `deferred_set` so the
/// install cannot commit while a read admitted before scheduling is still
/// outstanding on the old block (§4.2, Invariant 3; §4.6, "break sharing").
async fn break_sharing(pool: Arc<Pool>, bio: Bio, key: CellKey, old_data_block: u64, cell: Arc<Cell>) {
    let data_key = CellKey::data(old_data_block);
    match pool.prison.detain(data_key, bio) {
        Detain::Existing { .. } => {
            // Another sharing-break against this physical block is already
            // in flight, from this or another thin device. The bio is
            // queued on that data cell now; release the virtual cell since
            // nothing is pending on it for this attempt, and let the
            // queued bio be redelivered once the in-flight break's data
            // cell releases.
            let mut out = VecDeque::new();
            pool.prison.release(&cell, &mut out);
            for sibling in out {
                pool.defer_bio(sibling);
            }
        }
        Detain::NeedsNew(bio) => {
            let data_permit = pool.cell_reserve.acquire().await;
            let (data_cell, _) = pool.prison.create_cell(data_key, bio, data_permit);
            let bio = data_cell
                .take_driving()
                .expect("freshly created data cell must hold its initiating bio");

            match pool.metadata.alloc_data_block().await {
                Ok(d) => {
                    let permit = pool.mapping_reserve.acquire().await;
                    dispatch_cow_block(pool, bio, key, old_data_block, d, cell, data_cell, permit).await;
                }
                Err(e) if is_out_of_space(&e) => {
                    release_to_retry(&pool, bio, &cell).await;
                    let mut out = VecDeque::new();
                    pool.prison.release(&data_cell, &mut out);
                    for sibling in out {
                        pool.defer_bio(sibling);
                    }
                }
                Err(e) => {
                    fail_driving_and_cell(&pool, bio, &cell, e.clone());
                    pool.prison.fail(&data_cell, || e.clone().into());
                }
            }
        }
    }
}

/// A read against a shared data block: remap directly onto the existing
/// block (no allocation), registering with `deferred_set` so a future
/// reclaiming allocator has a correctness hook to gate on (§4.2). No cell
/// is held across the I/O: the cell only serializes the lookup-and-remap
/// step, not the read itself.
async fn shared_read(pool: Arc<Pool>, mut bio: Bio, data_block: u64, cell: Arc<Cell>) {
    let block = pool.config.block_of(bio.sector);
    let mut out = VecDeque::new();
    pool.prison.release(&cell, &mut out);
    debug_assert!(out.is_empty());

    let handle = pool.deferred_set.inc();
    bio.hook = Some(EndioHook::SharedRead { handle });
    pool.remap(&mut bio, block, data_block);
    pool.issue(bio).await;

    let mut drained = VecDeque::new();
    pool.deferred_set.dec(handle, &mut drained);
    for record in drained {
        pool.post_prepared(record);
    }
}

fn is_out_of_space(e: &MetadataError) -> bool {
    matches!(e, MetadataError::OutOfSpace | MetadataError::MetadataOutOfSpace)
}

async fn release_to_retry(pool: &Arc<Pool>, bio: Bio, cell: &Arc<Cell>) {
    let mut out = VecDeque::new();
    pool.prison.release(cell, &mut out);
    debug_assert!(out.is_empty());
    pool.queues.lock().unwrap().retry.push_back(bio);
    match pool.metadata.get_free_block_count().await {
        Ok(free) => pool.maybe_raise_low_water(free),
        Err(_) => pool.maybe_raise_low_water(0),
    }
}

fn fail_driving_and_cell(pool: &Arc<Pool>, mut bio: Bio, cell: &Arc<Cell>, e: MetadataError) {
    let mut out = VecDeque::new();
    pool.prison.release(cell, &mut out);
    bio.fail(e.clone().into());
    for mut sibling in out {
        sibling.fail(e.clone().into());
    }
}

/// Whole-block write onto a freshly provisioned block: no copy/zero is
/// needed, so the driving write is itself what prepares the mapping.
async fn dispatch_new_block(
    pool: Arc<Pool>,
    bio: Bio,
    key: CellKey,
    d: u64,
    cell: Arc<Cell>,
    permit: OwnedSemaphorePermit,
) {
    let whole = bio.covers_whole_block(pool.config.sectors_per_block, pool.config.offset_of(bio.sector));
    if whole {
        schedule_overwrite(pool, bio, key, d, cell, None, permit, false).await;
    } else if pool.config.skip_block_zeroing {
        schedule_partial_no_zero(pool, bio, key, d, cell, permit).await;
    } else {
        schedule_zero_then_write(pool, bio, key, d, cell, permit).await;
    }
}

/// A sharing-break onto a freshly allocated block: whole-block writes
/// overwrite directly; partial writes copy the old block's contents first.
/// Both sub-cases gate their install through `deferred_set` (§4.2,
/// Invariant 3) and carry `data_cell` through to release alongside the
/// virtual cell once the mapping commits.
async fn dispatch_cow_block(
    pool: Arc<Pool>,
    bio: Bio,
    key: CellKey,
    old_d: u64,
    new_d: u64,
    cell: Arc<Cell>,
    data_cell: Arc<Cell>,
    permit: OwnedSemaphorePermit,
) {
    let whole = bio.covers_whole_block(pool.config.sectors_per_block, pool.config.offset_of(bio.sector));
    if whole {
        schedule_overwrite(pool, bio, key, new_d, cell, Some(data_cell), permit, true).await;
    } else {
        schedule_copy_then_write(pool, bio, key, old_d, new_d, cell, data_cell, permit).await;
    }
}

/// Posts `record` to the prepared queue, first gating it on `deferred_set`
/// when `gate` is set: a sharing-break's record must not commit while a
/// read admitted before scheduling remains outstanding on the old block
/// (§4.2, Invariant 3). If there is nothing to wait on, `add_work` hands
/// the record back and it is posted directly.
fn post_prepared_or_deferred(pool: &Arc<Pool>, record: NewMappingRecord, gate: bool) {
    if !gate {
        pool.post_prepared(record);
        return;
    }
    if let Err(record) = pool.deferred_set.add_work(record) {
        pool.post_prepared(record);
    }
}

/// Remaps the driving write onto `d` and issues it directly; the write's
/// own completion is what prepares the mapping record. The bio itself is
/// not completed to its submitter until the record commits (§4.6).
async fn schedule_overwrite(
    pool: Arc<Pool>,
    mut bio: Bio,
    key: CellKey,
    d: u64,
    cell: Arc<Cell>,
    data_cell: Option<Arc<Cell>>,
    permit: OwnedSemaphorePermit,
    gate: bool,
) {
    pool.remap(&mut bio, key.block, d);
    bio.hook = Some(EndioHook::Overwrite);
    let mut record = NewMappingRecord::new(key.thin_id, key.block, d, Arc::clone(&cell), permit);
    if let Some(dc) = data_cell.clone() {
        record = record.with_data_cell(dc);
    }
    record.mark_scheduled();

    tokio::spawn(async move {
        let begin = pool.config.offset_of(bio.sector) as u32;
        let result = pool.io.submit(d, begin, bio.nr_sectors, &bio.payload).await;
        match result {
            Ok(_) => {
                record.mark_prepared();
                record.driving_bio = Some(bio);
                post_prepared_or_deferred(&pool, record, gate);
            }
            Err(e) => {
                bio.fail(e.clone());
                pool.prison.fail(&cell, || e.clone());
                if let Some(dc) = data_cell {
                    pool.prison.fail(&dc, || e.clone());
                }
            }
        }
    });
}

/// Zeroes the whole block, then writes the driving bio's partial range,
/// before preparing the mapping (§4.6: "copy or zero before the mapping is
/// visible").
async fn schedule_zero_then_write(
    pool: Arc<Pool>,
    bio: Bio,
    key: CellKey,
    d: u64,
    cell: Arc<Cell>,
    permit: OwnedSemaphorePermit,
) {
    let mut record = NewMappingRecord::new(key.thin_id, key.block, d, Arc::clone(&cell), permit);
    record.mark_scheduled();

    tokio::spawn(async move {
        let region = Region::whole_block(d, pool.config.sectors_per_block);
        if let Err(e) = pool.copy_engine.zero(region).await {
            let mut bio = bio;
            bio.fail(e.clone().into());
            pool.prison.fail(&cell, || e.clone().into());
            return;
        }
        complete_partial_write_and_prepare(pool, bio, d, record, cell, false).await;
    });
}

/// `skip_block_zeroing` is set: the unwritten part of the block is left
/// with whatever garbage the data device already holds, trading a data
/// leak across thin devices for provisioning speed (§6.3).
async fn schedule_partial_no_zero(
    pool: Arc<Pool>,
    bio: Bio,
    key: CellKey,
    d: u64,
    cell: Arc<Cell>,
    permit: OwnedSemaphorePermit,
) {
    let mut record = NewMappingRecord::new(key.thin_id, key.block, d, Arc::clone(&cell), permit);
    record.mark_scheduled();
    tokio::spawn(async move {
        complete_partial_write_and_prepare(pool, bio, d, record, cell, false).await;
    });
}

/// Copies the old block's contents onto the new block, then writes the
/// driving bio's partial range, before preparing the mapping. Gated
/// through `deferred_set` (§4.2, Invariant 3): a break-sharing install
/// must not commit while a read admitted before scheduling is still
/// outstanding on the old block.
async fn schedule_copy_then_write(
    pool: Arc<Pool>,
    bio: Bio,
    key: CellKey,
    old_d: u64,
    new_d: u64,
    cell: Arc<Cell>,
    data_cell: Arc<Cell>,
    permit: OwnedSemaphorePermit,
) {
    let mut record = NewMappingRecord::new(key.thin_id, key.block, new_d, Arc::clone(&cell), permit)
        .with_data_cell(Arc::clone(&data_cell));
    record.mark_scheduled();

    tokio::spawn(async move {
        let src = Region::whole_block(old_d, pool.config.sectors_per_block);
        let dst = Region::whole_block(new_d, pool.config.sectors_per_block);
        if let Err(e) = pool.copy_engine.copy(src, dst).await {
            let mut bio = bio;
            bio.fail(e.clone().into());
            pool.prison.fail(&cell, || e.clone().into());
            pool.prison.fail(&data_cell, || e.clone().into());
            return;
        }
        complete_partial_write_and_prepare(pool, bio, new_d, record, cell, true).await;
    });
}

/// Shared tail of the zero/copy-then-write paths: issues the driving
/// bio's own write against the new block, then marks the record prepared
/// and posts it, gated through `deferred_set` when `gate` is set (§4.2,
/// Invariant 3; break-sharing callers only). The bio itself is carried
/// inside the record and is not completed to its submitter until the
/// record commits (§4.6), matching the overwrite path's ordering
/// guarantee.
async fn complete_partial_write_and_prepare(
    pool: Arc<Pool>,
    mut bio: Bio,
    d: u64,
    mut record: NewMappingRecord,
    cell: Arc<Cell>,
    gate: bool,
) {
    let begin = pool.config.offset_of(bio.sector) as u32;
    let result = pool.io.submit(d, begin, bio.nr_sectors, &bio.payload).await;
    match result {
        Ok(_) => {
            record.mark_prepared();
            record.driving_bio = Some(bio);
            post_prepared_or_deferred(&pool, record, gate);
        }
        Err(e) => {
            let data_cell = record.data_cell.take();
            bio.fail(e.clone().into());
            pool.prison.fail(&cell, || e.clone().into());
            if let Some(dc) = data_cell {
                pool.prison.fail(&dc, || e.clone().into());
            }
        }
    }
}
