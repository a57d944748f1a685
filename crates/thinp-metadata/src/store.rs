use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use thinp_core::{DBlock, MetadataError, ThinId, VBlock};
use thinp_core::metadata::{LookupResult, MetadataStore};

struct ThinEntry {
    mappings: BTreeMap<VBlock, DBlock>,
}

struct State {
    thins: HashMap<ThinId, ThinEntry>,
    refcount: HashMap<DBlock, u32>,
    next_data_block: DBlock,
    data_dev_blocks: u64,
    transaction_id: u64,
    metadata_bdev: String,
    /// The metadata root held by the last snapshot of metadata taken for
    /// userspace (e.g. `dm_pool_metadata_snap`). `None` until a caller
    /// records one; this store never takes one on its own.
    held_root: Option<u64>,
    /// Monotonic counter standing in for the on-disk metadata generation;
    /// bumped on every `commit`.
    generation: u64,
}

/// An async-mutex-guarded [`MetadataStore`] for the simulation harness.
pub struct TokioMetadataStore {
    state: Mutex<State>,
}

impl TokioMetadataStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                thins: HashMap::new(),
                refcount: HashMap::new(),
                next_data_block: 0,
                data_dev_blocks: 0,
                transaction_id: 0,
                held_root: None,
                generation: 0,
                metadata_bdev: String::new(),
            }),
        }
    }

    /// Records a held metadata root, simulating a userspace-triggered
    /// metadata snapshot. Exposed for simulation scenarios; not part of
    /// the `MetadataStore` trait.
    pub async fn hold_metadata_root(&self, root: u64) {
        self.state.lock().await.held_root = Some(root);
    }

    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }
}

impl Default for TokioMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for TokioMetadataStore {
    async fn rebind(&self, new_bdev: &str) -> Result<(), MetadataError> {
        self.state.lock().await.metadata_bdev = new_bdev.to_string();
        Ok(())
    }

    async fn get_data_dev_size(&self) -> Result<u64, MetadataError> {
        Ok(self.state.lock().await.data_dev_blocks)
    }

    async fn resize_data_dev(&self, new_blocks: u64) -> Result<(), MetadataError> {
        let mut state = self.state.lock().await;
        state.data_dev_blocks = state.data_dev_blocks.max(new_blocks);
        Ok(())
    }

    async fn alloc_data_block(&self) -> Result<DBlock, MetadataError> {
        let mut state = self.state.lock().await;
        if state.next_data_block >= state.data_dev_blocks {
            tracing::warn!(data_dev_blocks = state.data_dev_blocks, "data device out of space");
            return Err(MetadataError::OutOfSpace);
        }
        let d = state.next_data_block;
        state.next_data_block += 1;
        state.refcount.insert(d, 1);
        tracing::trace!(data_block = d, "allocated data block");
        Ok(d)
    }

    async fn get_free_block_count(&self) -> Result<u64, MetadataError> {
        let state = self.state.lock().await;
        Ok(state.data_dev_blocks.saturating_sub(state.next_data_block))
    }

    async fn get_free_metadata_block_count(&self) -> Result<u64, MetadataError> {
        Ok(u64::MAX / 2)
    }

    async fn get_held_metadata_root(&self) -> Result<Option<u64>, MetadataError> {
        Ok(self.state.lock().await.held_root)
    }

    async fn get_transaction_id(&self) -> Result<u64, MetadataError> {
        Ok(self.state.lock().await.transaction_id)
    }

    async fn set_transaction_id(&self, old: u64, new: u64) -> Result<(), MetadataError> {
        let mut state = self.state.lock().await;
        if state.transaction_id != old {
            return Err(MetadataError::StaleTransactionId {
                expected: state.transaction_id,
                got: old,
            });
        }
        state.transaction_id = new;
        Ok(())
    }

    async fn create_thin(&self, id: ThinId) -> Result<(), MetadataError> {
        let mut state = self.state.lock().await;
        if state.thins.contains_key(&id) {
            return Err(MetadataError::ThinExists(id));
        }
        state.thins.insert(
            id,
            ThinEntry {
                mappings: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn create_snap(&self, id: ThinId, origin_id: ThinId) -> Result<(), MetadataError> {
        let mut state = self.state.lock().await;
        if state.thins.contains_key(&id) {
            return Err(MetadataError::ThinExists(id));
        }
        let mappings = state
            .thins
            .get(&origin_id)
            .ok_or(MetadataError::ThinNotFound(origin_id))?
            .mappings
            .clone();
        for d in mappings.values() {
            *state.refcount.entry(*d).or_insert(1) += 1;
        }
        state.thins.insert(id, ThinEntry { mappings });
        Ok(())
    }

    async fn delete_thin(&self, id: ThinId) -> Result<(), MetadataError> {
        let mut state = self.state.lock().await;
        let entry = state.thins.remove(&id).ok_or(MetadataError::ThinNotFound(id))?;
        for d in entry.mappings.values() {
            if let Some(count) = state.refcount.get_mut(d) {
                *count = count.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn trim_thin(&self, id: ThinId, new_blocks: u64) -> Result<(), MetadataError> {
        let mut state = self.state.lock().await;
        let entry = state.thins.get_mut(&id).ok_or(MetadataError::ThinNotFound(id))?;
        let tail: Vec<(VBlock, DBlock)> = entry.mappings.range(new_blocks..).map(|(v, d)| (*v, *d)).collect();
        for (v, d) in &tail {
            entry.mappings.remove(v);
            if let Some(count) = state.refcount.get_mut(d) {
                *count = count.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn find_block(&self, thin: ThinId, v: VBlock, _can_block: bool) -> Result<LookupResult, MetadataError> {
        let state = self.state.lock().await;
        let entry = state.thins.get(&thin).ok_or(MetadataError::ThinNotFound(thin))?;
        match entry.mappings.get(&v) {
            None => Ok(LookupResult::NotFound),
            Some(d) => {
                let shared = state.refcount.get(d).copied().unwrap_or(1) > 1;
                Ok(LookupResult::Found {
                    data_block: *d,
                    shared,
                })
            }
        }
    }

    async fn insert_block(&self, thin: ThinId, v: VBlock, d: DBlock) -> Result<(), MetadataError> {
        let mut state = self.state.lock().await;
        let old = state
            .thins
            .get_mut(&thin)
            .ok_or(MetadataError::ThinNotFound(thin))?
            .mappings
            .insert(v, d);
        if let Some(old_d) = old {
            if old_d != d {
                if let Some(count) = state.refcount.get_mut(&old_d) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        Ok(())
    }

    async fn get_mapped_count(&self, thin: ThinId) -> Result<u64, MetadataError> {
        let state = self.state.lock().await;
        let entry = state.thins.get(&thin).ok_or(MetadataError::ThinNotFound(thin))?;
        Ok(entry.mappings.len() as u64)
    }

    async fn get_highest_mapped(&self, thin: ThinId) -> Result<Option<VBlock>, MetadataError> {
        let state = self.state.lock().await;
        let entry = state.thins.get(&thin).ok_or(MetadataError::ThinNotFound(thin))?;
        Ok(entry.mappings.keys().next_back().copied())
    }

    async fn commit(&self) -> Result<(), MetadataError> {
        let mut state = self.state.lock().await;
        state.generation += 1;
        tracing::debug!(generation = state.generation, "metadata committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_thin_has_no_mappings() {
        let store = TokioMetadataStore::new();
        store.resize_data_dev(16).await.unwrap();
        store.create_thin(0).await.unwrap();
        assert_eq!(store.get_mapped_count(0).await.unwrap(), 0);
        assert_eq!(store.find_block(0, 3, true).await.unwrap(), LookupResult::NotFound);
    }

    #[tokio::test]
    async fn alloc_exhausts_and_reports_out_of_space() {
        let store = TokioMetadataStore::new();
        store.resize_data_dev(1).await.unwrap();
        assert_eq!(store.alloc_data_block().await.unwrap(), 0);
        assert!(matches!(
            store.alloc_data_block().await,
            Err(MetadataError::OutOfSpace)
        ));
    }

    #[tokio::test]
    async fn snapshot_marks_shared_blocks_on_both_devices() {
        let store = TokioMetadataStore::new();
        store.resize_data_dev(16).await.unwrap();
        store.create_thin(0).await.unwrap();
        let d = store.alloc_data_block().await.unwrap();
        store.insert_block(0, 5, d).await.unwrap();

        store.create_snap(1, 0).await.unwrap();

        let origin = store.find_block(0, 5, true).await.unwrap();
        let snap = store.find_block(1, 5, true).await.unwrap();
        assert_eq!(
            origin,
            LookupResult::Found {
                data_block: d,
                shared: true
            }
        );
        assert_eq!(snap, origin);
    }

    #[tokio::test]
    async fn commit_advances_generation() {
        let store = TokioMetadataStore::new();
        assert_eq!(store.generation().await, 0);
        store.commit().await.unwrap();
        assert_eq!(store.generation().await, 1);
    }
}
