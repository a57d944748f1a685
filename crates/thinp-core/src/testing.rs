//! In-memory reference implementations of the I/O and copy-engine
//! boundaries, for tests and the demo binary. Not part of the public data
//! path contract.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::copy_engine::{CopyEngine, Region};
use crate::error::{BioError, CopyError, MetadataError};
use crate::ids::{DBlock, ThinId, VBlock};
use crate::io::{BioPayload, IoSubmitter, SECTOR_SIZE};
use crate::metadata::{LookupResult, MetadataStore};

/// A data device backed by an in-memory byte store, implementing both
/// [`IoSubmitter`] and [`CopyEngine`] against the same backing blocks so
/// writes through one are visible to copies through the other.
pub struct InMemoryDataDevice {
    sectors_per_block: u32,
    blocks: Mutex<HashMap<DBlock, Vec<u8>>>,
}

impl InMemoryDataDevice {
    pub fn new(sectors_per_block: u32) -> Self {
        Self {
            sectors_per_block,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    fn block_bytes(&self) -> usize {
        self.sectors_per_block as usize * SECTOR_SIZE
    }

    fn sector_range(&self, begin_sector: u32, nr_sectors: u32) -> (usize, usize) {
        let begin = begin_sector as usize * SECTOR_SIZE;
        let end = begin + nr_sectors as usize * SECTOR_SIZE;
        (begin, end)
    }

    /// Number of distinct data blocks ever touched, for test assertions.
    pub fn touched_block_count(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }
}

#[async_trait]
impl IoSubmitter for InMemoryDataDevice {
    async fn submit(
        &self,
        data_block: DBlock,
        begin_sector: u32,
        nr_sectors: u32,
        payload: &BioPayload,
    ) -> Result<Option<Vec<u8>>, BioError> {
        let (begin, end) = self.sector_range(begin_sector, nr_sectors);
        let block_bytes = self.block_bytes();
        let mut blocks = self.blocks.lock().unwrap();
        let block = blocks.entry(data_block).or_insert_with(|| vec![0u8; block_bytes]);
        if end > block.len() {
            return Err(BioError::Io);
        }

        match payload {
            BioPayload::Write(bytes) => {
                if bytes.len() != end - begin {
                    return Err(BioError::Io);
                }
                block[begin..end].copy_from_slice(bytes);
                Ok(None)
            }
            BioPayload::Read => Ok(Some(block[begin..end].to_vec())),
        }
    }
}

#[async_trait]
impl CopyEngine for InMemoryDataDevice {
    async fn copy(&self, src: Region, dst: Region) -> Result<(), CopyError> {
        if src.end_sector - src.begin_sector != dst.end_sector - dst.begin_sector {
            return Err(CopyError::ReadFailed);
        }
        let block_bytes = self.block_bytes();
        let (src_begin, src_end) = self.sector_range(src.begin_sector, src.end_sector - src.begin_sector);
        let (dst_begin, dst_end) = self.sector_range(dst.begin_sector, dst.end_sector - dst.begin_sector);

        let mut blocks = self.blocks.lock().unwrap();
        let src_bytes = blocks
            .get(&src.data_block)
            .cloned()
            .unwrap_or_else(|| vec![0u8; block_bytes]);
        if src_end > src_bytes.len() {
            return Err(CopyError::ReadFailed);
        }
        let chunk = src_bytes[src_begin..src_end].to_vec();

        let dst_block = blocks
            .entry(dst.data_block)
            .or_insert_with(|| vec![0u8; block_bytes]);
        if dst_end > dst_block.len() {
            return Err(CopyError::WriteFailed);
        }
        dst_block[dst_begin..dst_end].copy_from_slice(&chunk);
        Ok(())
    }

    async fn zero(&self, dst: Region) -> Result<(), CopyError> {
        let block_bytes = self.block_bytes();
        let (begin, end) = self.sector_range(dst.begin_sector, dst.end_sector - dst.begin_sector);
        let mut blocks = self.blocks.lock().unwrap();
        let block = blocks.entry(dst.data_block).or_insert_with(|| vec![0u8; block_bytes]);
        if end > block.len() {
            return Err(CopyError::WriteFailed);
        }
        block[begin..end].fill(0);
        Ok(())
    }
}

struct MetadataInner {
    thins: HashMap<ThinId, BTreeMap<VBlock, DBlock>>,
    refcount: HashMap<DBlock, u32>,
    next_data_block: DBlock,
    data_dev_blocks: u64,
    transaction_id: u64,
    metadata_bdev: String,
}

/// A bare-bones in-memory metadata store: a per-thin `BTreeMap` of virtual
/// to data blocks, a bump allocator for new data blocks, and a refcount
/// map standing in for the real on-disk space map's sharing accounting.
/// Freed blocks are never reused (no real space reclamation); see the
/// design notes for why that's an acceptable simplification here.
pub struct InMemoryMetadataStore {
    inner: Mutex<MetadataInner>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetadataInner {
                thins: HashMap::new(),
                refcount: HashMap::new(),
                next_data_block: 0,
                data_dev_blocks: 0,
                transaction_id: 0,
                metadata_bdev: String::new(),
            }),
        }
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn rebind(&self, new_bdev: &str) -> Result<(), MetadataError> {
        self.inner.lock().unwrap().metadata_bdev = new_bdev.to_string();
        Ok(())
    }

    async fn get_data_dev_size(&self) -> Result<u64, MetadataError> {
        Ok(self.inner.lock().unwrap().data_dev_blocks)
    }

    async fn resize_data_dev(&self, new_blocks: u64) -> Result<(), MetadataError> {
        let mut inner = self.inner.lock().unwrap();
        inner.data_dev_blocks = inner.data_dev_blocks.max(new_blocks);
        Ok(())
    }

    async fn alloc_data_block(&self) -> Result<DBlock, MetadataError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.next_data_block >= inner.data_dev_blocks {
            return Err(MetadataError::OutOfSpace);
        }
        let d = inner.next_data_block;
        inner.next_data_block += 1;
        inner.refcount.insert(d, 1);
        Ok(d)
    }

    async fn get_free_block_count(&self) -> Result<u64, MetadataError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.data_dev_blocks.saturating_sub(inner.next_data_block))
    }

    async fn get_free_metadata_block_count(&self) -> Result<u64, MetadataError> {
        // No on-disk space map to exhaust in this reference store.
        Ok(u64::MAX / 2)
    }

    async fn get_held_metadata_root(&self) -> Result<Option<u64>, MetadataError> {
        Ok(None)
    }

    async fn get_transaction_id(&self) -> Result<u64, MetadataError> {
        Ok(self.inner.lock().unwrap().transaction_id)
    }

    async fn set_transaction_id(&self, old: u64, new: u64) -> Result<(), MetadataError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.transaction_id != old {
            return Err(MetadataError::StaleTransactionId {
                expected: inner.transaction_id,
                got: old,
            });
        }
        inner.transaction_id = new;
        Ok(())
    }

    async fn create_thin(&self, id: ThinId) -> Result<(), MetadataError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.thins.contains_key(&id) {
            return Err(MetadataError::ThinExists(id));
        }
        inner.thins.insert(id, BTreeMap::new());
        Ok(())
    }

    async fn create_snap(&self, id: ThinId, origin_id: ThinId) -> Result<(), MetadataError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.thins.contains_key(&id) {
            return Err(MetadataError::ThinExists(id));
        }
        let origin = inner
            .thins
            .get(&origin_id)
            .ok_or(MetadataError::ThinNotFound(origin_id))?
            .clone();
        for d in origin.values() {
            *inner.refcount.entry(*d).or_insert(1) += 1;
        }
        inner.thins.insert(id, origin);
        Ok(())
    }

    async fn delete_thin(&self, id: ThinId) -> Result<(), MetadataError> {
        let mut inner = self.inner.lock().unwrap();
        let map = inner.thins.remove(&id).ok_or(MetadataError::ThinNotFound(id))?;
        for d in map.values() {
            if let Some(count) = inner.refcount.get_mut(d) {
                *count = count.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn trim_thin(&self, id: ThinId, new_blocks: u64) -> Result<(), MetadataError> {
        let mut inner = self.inner.lock().unwrap();
        let map = inner.thins.get_mut(&id).ok_or(MetadataError::ThinNotFound(id))?;
        let tail: Vec<(VBlock, DBlock)> = map
            .range(new_blocks..)
            .map(|(v, d)| (*v, *d))
            .collect();
        for (v, d) in &tail {
            map.remove(v);
            if let Some(count) = inner.refcount.get_mut(d) {
                *count = count.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn find_block(&self, thin: ThinId, v: VBlock, _can_block: bool) -> Result<LookupResult, MetadataError> {
        let inner = self.inner.lock().unwrap();
        let map = inner.thins.get(&thin).ok_or(MetadataError::ThinNotFound(thin))?;
        match map.get(&v) {
            None => Ok(LookupResult::NotFound),
            Some(d) => {
                let shared = inner.refcount.get(d).copied().unwrap_or(1) > 1;
                Ok(LookupResult::Found {
                    data_block: *d,
                    shared,
                })
            }
        }
    }

    async fn insert_block(&self, thin: ThinId, v: VBlock, d: DBlock) -> Result<(), MetadataError> {
        let mut inner = self.inner.lock().unwrap();
        let old = inner
            .thins
            .get_mut(&thin)
            .ok_or(MetadataError::ThinNotFound(thin))?
            .insert(v, d);
        if let Some(old_d) = old {
            if old_d != d {
                if let Some(count) = inner.refcount.get_mut(&old_d) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        Ok(())
    }

    async fn get_mapped_count(&self, thin: ThinId) -> Result<u64, MetadataError> {
        let inner = self.inner.lock().unwrap();
        let map = inner.thins.get(&thin).ok_or(MetadataError::ThinNotFound(thin))?;
        Ok(map.len() as u64)
    }

    async fn get_highest_mapped(&self, thin: ThinId) -> Result<Option<VBlock>, MetadataError> {
        let inner = self.inner.lock().unwrap();
        let map = inner.thins.get(&thin).ok_or(MetadataError::ThinNotFound(thin))?;
        Ok(map.keys().next_back().copied())
    }

    async fn commit(&self) -> Result<(), MetadataError> {
        Ok(())
    }
}
