//! The bio prison (C1): keyed serialization of concurrent I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedSemaphorePermit;

use crate::error::BioError;
use crate::ids::ThinId;
use crate::invariants::{debug_assert_cell_count_consistent, debug_assert_queue_drained};
use crate::io::Bio;

const MIN_BUCKETS: usize = 128;
const MAX_BUCKETS: usize = 8192;
const HASH_MULTIPLIER: u64 = 4_294_967_291;

/// Which address space a cell key names (§3): `virtual` gates provisioning
/// of a logical block; `data` gates sharing-breaks of a physical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellScope {
    Virtual,
    Data,
}

/// `(scope, thin_id, block)` — equality is bytewise, as required by §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellKey {
    pub scope: CellScope,
    pub thin_id: ThinId,
    pub block: u64,
}

impl CellKey {
    pub fn virt(thin_id: ThinId, block: u64) -> Self {
        Self {
            scope: CellScope::Virtual,
            thin_id,
            block,
        }
    }

    /// Keys a sharing-break by the physical data block alone. `thin_id` is
    /// fixed regardless of caller, since two different thin devices can
    /// both resolve the same shared `d` and race to break its sharing —
    /// the whole reason this scope exists is to serialize that race across
    /// thin devices, not within one.
    pub fn data(block: u64) -> Self {
        Self {
            scope: CellScope::Data,
            thin_id: 0,
            block,
        }
    }
}

struct CellInner {
    queue: VecDeque<Bio>,
    count: usize,
}

/// A queue of I/O detained under a single key, plus the reserve-pool permit
/// that keeps it alive (§5, "reserve pools as bounded semaphores" in the
/// design notes).
pub struct Cell {
    pub key: CellKey,
    inner: Mutex<CellInner>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl Cell {
    fn new(key: CellKey, bio: Bio, permit: Option<OwnedSemaphorePermit>) -> Self {
        let mut queue = VecDeque::new();
        queue.push_back(bio);
        Self {
            key,
            inner: Mutex::new(CellInner { queue, count: 1 }),
            permit: Mutex::new(permit),
        }
    }

    /// Number of bios currently queued (for tests and status reporting).
    /// Note this can be smaller than the detain count once
    /// [`take_driving`](Self::take_driving) has removed the initiating bio
    /// for direct processing — the key remains occupied regardless.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pops the first queued bio out for direct processing by the worker
    /// (e.g. to remap-and-issue the sole initiating write of a fresh
    /// provision), leaving the cell registered so later detains for the
    /// same key still see `prior > 0`.
    pub fn take_driving(&self) -> Option<Bio> {
        self.inner.lock().unwrap().queue.pop_front()
    }
}

/// Outcome of attempting to detain against an already-detained key.
pub enum Detain {
    /// A cell already existed; the bio was appended. `prior` is the number
    /// of bios already queued before this one (callers treat `prior > 0` as
    /// "already being handled").
    Existing { cell: Arc<Cell>, prior: usize },
    /// No cell existed for this key; the caller must acquire a reserve
    /// permit and call [`Prison::create_cell`].
    NeedsNew(Bio),
}

/// A fixed-size open hash of cells (§4.1).
pub struct Prison {
    buckets: Vec<Mutex<HashMap<CellKey, Arc<Cell>>>>,
}

impl Prison {
    /// `nr_cells` is a sizing hint; the bucket count is the next power of
    /// two ≥ `max(128, nr_cells/4)`, capped at 8192.
    pub fn new(nr_cells: usize) -> Self {
        let hint = (nr_cells / 4).max(MIN_BUCKETS).min(MAX_BUCKETS);
        let bucket_count = hint.next_power_of_two().min(MAX_BUCKETS);
        let buckets = (0..bucket_count).map(|_| Mutex::new(HashMap::new())).collect();
        Self { buckets }
    }

    fn bucket_index(&self, key: &CellKey) -> usize {
        let h = key.block.wrapping_mul(HASH_MULTIPLIER);
        (h as usize) % self.buckets.len()
    }

    /// Attempts to detain `bio` under `key` without allocating a new cell.
    pub fn detain(&self, key: CellKey, bio: Bio) -> Detain {
        let idx = self.bucket_index(&key);
        let bucket = self.buckets[idx].lock().unwrap();
        if let Some(existing) = bucket.get(&key) {
            let cell = Arc::clone(existing);
            drop(bucket);
            let mut inner = cell.inner.lock().unwrap();
            let prior = inner.count;
            inner.count += 1;
            inner.queue.push_back(bio);
            drop(inner);
            Detain::Existing { cell, prior }
        } else {
            Detain::NeedsNew(bio)
        }
    }

    /// Allocates a new cell for `key`, bound to `permit`. If another task
    /// raced us and inserted a cell for the same key while we were
    /// acquiring the permit, the bio is appended to that cell instead and
    /// `permit` is dropped (freeing it back to the reserve), matching the
    /// re-check-on-re-entry requirement in §4.1.
    pub fn create_cell(
        &self,
        key: CellKey,
        bio: Bio,
        permit: OwnedSemaphorePermit,
    ) -> (Arc<Cell>, usize) {
        let idx = self.bucket_index(&key);
        let mut bucket = self.buckets[idx].lock().unwrap();
        if let Some(existing) = bucket.get(&key) {
            let cell = Arc::clone(existing);
            drop(bucket);
            drop(permit); // freed back to the reserve semaphore
            let mut inner = cell.inner.lock().unwrap();
            let prior = inner.count;
            inner.count += 1;
            inner.queue.push_back(bio);
            (cell, prior)
        } else {
            let cell = Arc::new(Cell::new(key.clone(), bio, Some(permit)));
            bucket.insert(key, Arc::clone(&cell));
            (cell, 0)
        }
    }

    /// Unlinks `cell` from its bucket and moves its queued bios into
    /// `out_queue`. After this call, `cell` must not be detained against
    /// again.
    pub fn release(&self, cell: &Arc<Cell>, out_queue: &mut VecDeque<Bio>) {
        let idx = self.bucket_index(&cell.key);
        let mut bucket = self.buckets[idx].lock().unwrap();
        bucket.remove(&cell.key);
        drop(bucket);

        let mut inner = cell.inner.lock().unwrap();
        debug_assert_cell_count_consistent!(inner.count);
        out_queue.extend(inner.queue.drain(..));
        debug_assert_queue_drained!(inner.queue);
        drop(inner);

        cell.permit.lock().unwrap().take();
    }

    /// Like [`release`](Self::release), but asserts the cell held exactly
    /// one bio (the caller knows it was the first and only detainer).
    pub fn release_singleton(&self, cell: &Arc<Cell>) -> Bio {
        let mut out = VecDeque::new();
        self.release(cell, &mut out);
        debug_assert_eq!(out.len(), 1, "release_singleton called on a non-singleton cell");
        out.pop_front().expect("singleton cell had no bio")
    }

    /// Releases `cell` and fails every detained bio with `err`.
    pub fn fail(&self, cell: &Arc<Cell>, err: impl Fn() -> BioError) {
        let mut out = VecDeque::new();
        self.release(cell, &mut out);
        for mut bio in out {
            bio.fail(err());
        }
    }

    /// Number of live cells, for tests and diagnostics.
    pub fn live_cell_count(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().unwrap().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{BioFlags, BioPayload};

    fn make_bio(thin: ThinId, sector: u64) -> Bio {
        let (bio, _rx) = Bio::new(thin, sector, 8, BioFlags::WRITE, BioPayload::Write(vec![0; 8]));
        bio
    }

    #[test]
    fn first_detain_creates_cell_with_prior_zero() {
        let prison = Prison::new(128);
        let key = CellKey::virt(0, 5);
        let bio = make_bio(0, 5 * 8);
        match prison.detain(key, bio) {
            Detain::NeedsNew(_) => {}
            Detain::Existing { .. } => panic!("expected NeedsNew on first detain"),
        }
    }

    #[test]
    fn double_detain_reuses_cell() {
        let prison = Prison::new(128);
        let key = CellKey::virt(0, 5);
        let bio1 = make_bio(0, 5 * 8);
        let permit = Arc::new(tokio::sync::Semaphore::new(4));
        let owned = tokio::sync::Semaphore::try_acquire_owned(permit).unwrap();
        let (cell, prior) = prison.create_cell(key.clone(), bio1, owned);
        assert_eq!(prior, 0);
        assert_eq!(cell.len(), 1);

        let bio2 = make_bio(0, 5 * 8);
        match prison.detain(key, bio2) {
            Detain::Existing { cell: cell2, prior } => {
                assert_eq!(prior, 1);
                assert_eq!(cell2.len(), 2);
                assert_eq!(prison.live_cell_count(), 1);
            }
            Detain::NeedsNew(_) => panic!("expected Existing on second detain"),
        }
    }

    #[test]
    fn release_drains_queue_and_frees_key() {
        let prison = Prison::new(128);
        let key = CellKey::virt(0, 5);
        let permit = Arc::new(tokio::sync::Semaphore::new(4));
        let owned = tokio::sync::Semaphore::try_acquire_owned(permit).unwrap();
        let (cell, _) = prison.create_cell(key.clone(), make_bio(0, 40), owned);
        let mut out = VecDeque::new();
        prison.release(&cell, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(prison.live_cell_count(), 0);

        // The key is free again.
        match prison.detain(key, make_bio(0, 40)) {
            Detain::NeedsNew(_) => {}
            Detain::Existing { .. } => panic!("key should have been freed"),
        }
    }
}
