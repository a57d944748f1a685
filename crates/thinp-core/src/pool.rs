//! Pool state (C4): the shared backing of one or more thin devices.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::{PoolConfig, PoolMessage};
use crate::copy_engine::CopyEngine;
use crate::deferred_set::DeferredSet;
use crate::invariants::debug_assert_prepared_before_post;
use crate::io::{Bio, IoSubmitter};
use crate::mapping::NewMappingRecord;
use crate::metadata::MetadataStore;
use crate::prison::Prison;
use crate::reserve::ReservePool;
use crate::worker;

/// Default capacity for the cell and mapping-record reserves. Real sizing
/// would track the number of in-flight thin devices; a single generous
/// constant is enough for this port (§5, "reserve pools as bounded
/// semaphores").
pub const DEFAULT_RESERVE_CAPACITY: usize = 1024;

pub(crate) struct PoolQueues {
    pub deferred_bios: VecDeque<Bio>,
    pub prepared_mappings: VecDeque<NewMappingRecord>,
    pub retry: VecDeque<Bio>,
}

impl PoolQueues {
    fn new() -> Self {
        Self {
            deferred_bios: VecDeque::new(),
            prepared_mappings: VecDeque::new(),
            retry: VecDeque::new(),
        }
    }
}

/// The shared state behind one or more thin devices (§3, §4.4).
pub struct Pool {
    pub config: PoolConfig,
    pub(crate) metadata: Arc<dyn MetadataStore>,
    pub(crate) copy_engine: Arc<dyn CopyEngine>,
    pub(crate) io: Arc<dyn IoSubmitter>,
    pub(crate) prison: Prison,
    pub(crate) deferred_set: DeferredSet<NewMappingRecord>,
    pub(crate) queues: Mutex<PoolQueues>,
    pub(crate) wake: Notify,
    pub(crate) cell_reserve: ReservePool,
    pub(crate) mapping_reserve: ReservePool,
    low_water_triggered: AtomicBool,
    binding_refcount: AtomicUsize,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
    /// Builds a pool and spawns its worker task (§4.4: "a single worker
    /// executing on a dedicated task").
    pub fn start(
        config: PoolConfig,
        metadata: Arc<dyn MetadataStore>,
        copy_engine: Arc<dyn CopyEngine>,
        io: Arc<dyn IoSubmitter>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            metadata,
            copy_engine,
            io,
            prison: Prison::new(DEFAULT_RESERVE_CAPACITY),
            deferred_set: DeferredSet::new(),
            queues: Mutex::new(PoolQueues::new()),
            wake: Notify::new(),
            cell_reserve: ReservePool::new(DEFAULT_RESERVE_CAPACITY),
            mapping_reserve: ReservePool::new(DEFAULT_RESERVE_CAPACITY),
            low_water_triggered: AtomicBool::new(false),
            binding_refcount: AtomicUsize::new(0),
            worker_handle: Mutex::new(None),
        });

        let handle = tokio::spawn(worker::run(Arc::clone(&pool)));
        *pool.worker_handle.lock().unwrap() = Some(handle);
        pool
    }

    /// Pushes `bio` onto the deferred queue and wakes the worker.
    pub(crate) fn defer_bio(&self, bio: Bio) {
        self.queues.lock().unwrap().deferred_bios.push_back(bio);
        self.wake.notify_one();
    }

    /// Posts a now-prepared mapping record onto the prepared queue (§4.3).
    pub(crate) fn post_prepared(&self, record: NewMappingRecord) {
        debug_assert_prepared_before_post!(record.is_prepared());
        self.queues.lock().unwrap().prepared_mappings.push_back(record);
        self.wake.notify_one();
    }

    /// Raises the low-water event exactly once per latch (§4.5, §7).
    pub(crate) fn maybe_raise_low_water(&self, free_blocks: u64) {
        if free_blocks <= self.config.low_water_blocks() {
            if !self.low_water_triggered.swap(true, Ordering::AcqRel) {
                tracing::warn!(free_blocks, "low water mark crossed");
            }
        }
    }

    pub fn low_water_triggered(&self) -> bool {
        self.low_water_triggered.load(Ordering::Acquire)
    }

    fn clear_low_water(&self) {
        self.low_water_triggered.store(false, Ordering::Release);
    }

    /// A thin device has bound to this pool.
    pub(crate) fn bind(&self) {
        self.binding_refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// A thin device has unbound. Returns the refcount after the decrement.
    pub(crate) fn unbind(&self) -> usize {
        self.binding_refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn binding_count(&self) -> usize {
        self.binding_refcount.load(Ordering::Acquire)
    }

    /// Preresume (§4.7): grows the data device if needed, clears the
    /// low-water latch, and splices the retry queue back onto the deferred
    /// queue so previously ENOSPC'd I/O resumes.
    pub async fn preresume(&self, declared_data_blocks: u64) -> Result<(), crate::error::PoolError> {
        let current = self.metadata.get_data_dev_size().await?;
        if declared_data_blocks > current {
            self.metadata.resize_data_dev(declared_data_blocks).await?;
            self.metadata.commit().await?;
        }
        self.clear_low_water();

        let mut queues = self.queues.lock().unwrap();
        let retried: Vec<Bio> = queues.retry.drain(..).collect();
        let retried_count = retried.len();
        queues.deferred_bios.extend(retried);
        drop(queues);
        if retried_count > 0 {
            tracing::info!(retried_count, "preresume drained retry queue");
            self.wake.notify_one();
        }
        Ok(())
    }

    /// Postsuspend (§4.7): flushes the worker queue and commits metadata.
    pub async fn postsuspend(&self) -> Result<(), crate::error::PoolError> {
        self.drain_worker_queue().await;
        if let Err(e) = self.metadata.commit().await {
            tracing::error!(error = %e, "postsuspend commit failed");
            return Err(e.into());
        }
        Ok(())
    }

    /// Waits until both pool queues are empty (best-effort; used by
    /// postsuspend and by tests).
    pub async fn drain_worker_queue(&self) {
        loop {
            let empty = {
                let q = self.queues.lock().unwrap();
                q.deferred_bios.is_empty() && q.prepared_mappings.is_empty()
            };
            if empty {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    pub fn status_info(&self, transaction_id: u64, free_meta_sectors: u64, free_data_sectors: u64, held_root: Option<u64>) -> String {
        match held_root {
            Some(root) => format!("{transaction_id} {free_meta_sectors} {free_data_sectors} {root}"),
            None => format!("{transaction_id} {free_meta_sectors} {free_data_sectors} -"),
        }
    }

    pub fn status_table(&self) -> String {
        self.config.status_table()
    }

    /// Dispatches a runtime message (§4.7, §6.3) to the metadata store.
    /// Messages run inline on the caller's task; they are not expected to
    /// be on a latency-sensitive path.
    pub async fn handle_message(&self, msg: PoolMessage) -> Result<(), crate::error::PoolError> {
        match msg {
            PoolMessage::CreateThin(id) => self.metadata.create_thin(id).await.map_err(Into::into),
            PoolMessage::CreateSnap { dev_id, origin_id } => self
                .metadata
                .create_snap(dev_id, origin_id)
                .await
                .map_err(Into::into),
            PoolMessage::Delete(id) => self.metadata.delete_thin(id).await.map_err(Into::into),
            PoolMessage::Trim {
                dev_id,
                new_size_sectors,
            } => {
                let new_blocks = self.config.block_of(new_size_sectors);
                self.metadata.trim_thin(dev_id, new_blocks).await.map_err(Into::into)
            }
            PoolMessage::SetTransactionId { old, new } => self
                .metadata
                .set_transaction_id(old, new)
                .await
                .map_err(Into::into),
        }
    }
}
