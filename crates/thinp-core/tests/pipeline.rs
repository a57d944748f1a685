//! Integration tests driving a real `Pool` through the literal scenarios
//! the core pipeline has to get right: fresh provisioning, snapshot
//! writes breaking sharing, concurrent shared reads, running out of data
//! space, flush ordering, and two writers racing the same unmapped block.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use thinp_core::config::ThinConfig;
use thinp_core::copy_engine::{CopyEngine, Region};
use thinp_core::error::{BioError, CopyError};
use thinp_core::ids::DBlock;
use thinp_core::io::{BioFlags, BioPayload, IoSubmitter};
use thinp_core::testing::{InMemoryDataDevice, InMemoryMetadataStore};
use thinp_core::thin::ThinDevice;
use thinp_core::{Bio, BioCompletion, Pool, PoolConfig, PoolMessage};

const SECTORS_PER_BLOCK: u32 = 128;
const BLOCK_BYTES: usize = SECTORS_PER_BLOCK as usize * 512;

async fn new_pool(data_blocks: u64) -> Arc<Pool> {
    let config = PoolConfig::new("meta0", "data0", SECTORS_PER_BLOCK, 8, false).unwrap();
    let metadata = Arc::new(InMemoryMetadataStore::new());
    metadata.resize_data_dev(data_blocks).await.unwrap();
    let device = Arc::new(InMemoryDataDevice::new(SECTORS_PER_BLOCK));
    Pool::start(config, metadata, device.clone(), device)
}

async fn write_whole_block(thin: &ThinDevice, virt_block: u64, byte: u8) {
    let sector = virt_block * u64::from(SECTORS_PER_BLOCK);
    let (bio, rx) = Bio::new(0, sector, SECTORS_PER_BLOCK, BioFlags::WRITE, BioPayload::Write(vec![byte; BLOCK_BYTES]));
    thin.submit(bio).await;
    timeout(rx).await.unwrap().unwrap();
}

async fn read_whole_block(thin: &ThinDevice, thin_id: thinp_core::ThinId, virt_block: u64) -> Vec<u8> {
    let sector = virt_block * u64::from(SECTORS_PER_BLOCK);
    let (mut bio, rx) = Bio::new(thin_id, sector, SECTORS_PER_BLOCK, BioFlags::READ, BioPayload::Read);
    bio.thin_id = thin_id;
    thin.submit(bio).await;
    match timeout(rx).await.unwrap().unwrap() {
        BioCompletion::Data(bytes) => bytes,
        BioCompletion::Written => panic!("read completed as a write"),
    }
}

async fn timeout<T>(fut: impl std::future::Future<Output = T>) -> Result<T, tokio::time::error::Elapsed> {
    tokio::time::timeout(Duration::from_secs(5), fut).await
}

#[tokio::test]
async fn fresh_write_provisions_and_reads_back() {
    let pool = new_pool(8).await;
    pool.handle_message(PoolMessage::CreateThin(0)).await.unwrap();
    let thin = ThinDevice::bind(pool, ThinConfig::parse_table_args("/dev/mapper/p 0").unwrap())
        .await
        .unwrap();

    write_whole_block(&thin, 3, 0xaa).await;
    let data = read_whole_block(&thin, 0, 3).await;
    assert!(data.iter().all(|&b| b == 0xaa));
    assert_eq!(thin.mapped_block_count().await.unwrap(), 1);
}

#[tokio::test]
async fn read_of_unmapped_block_is_zero_filled_without_provisioning() {
    let pool = new_pool(8).await;
    pool.handle_message(PoolMessage::CreateThin(0)).await.unwrap();
    let thin = ThinDevice::bind(pool, ThinConfig::parse_table_args("/dev/mapper/p 0").unwrap())
        .await
        .unwrap();

    let data = read_whole_block(&thin, 0, 5).await;
    assert!(data.iter().all(|&b| b == 0));
    assert_eq!(thin.mapped_block_count().await.unwrap(), 0);
}

#[tokio::test]
async fn snapshot_write_breaks_sharing_without_disturbing_origin() {
    let pool = new_pool(8).await;
    pool.handle_message(PoolMessage::CreateThin(0)).await.unwrap();
    let origin = ThinDevice::bind(Arc::clone(&pool), ThinConfig::parse_table_args("/dev/mapper/p 0").unwrap())
        .await
        .unwrap();

    write_whole_block(&origin, 0, 0x11).await;

    pool.handle_message(PoolMessage::CreateSnap { dev_id: 1, origin_id: 0 })
        .await
        .unwrap();
    let snap = ThinDevice::bind(Arc::clone(&pool), ThinConfig::parse_table_args("/dev/mapper/p 1").unwrap())
        .await
        .unwrap();

    // Snapshot starts out sharing the origin's data.
    assert_eq!(read_whole_block(&snap, 1, 0).await, vec![0x11; BLOCK_BYTES]);

    // Writing through the snapshot must break sharing: origin unaffected.
    write_whole_block(&snap, 0, 0x22).await;
    assert_eq!(read_whole_block(&origin, 0, 0).await, vec![0x11; BLOCK_BYTES]);
    assert_eq!(read_whole_block(&snap, 1, 0).await, vec![0x22; BLOCK_BYTES]);
}

/// A copy engine that signals `entered` the moment `copy` is called, then
/// stalls until `gate` is released, so a test can pin down exactly when a
/// break-sharing install's copy step runs relative to a concurrent read.
struct GatedCopyEngine {
    inner: Arc<InMemoryDataDevice>,
    entered: Arc<Notify>,
    gate: Arc<Notify>,
}

#[async_trait]
impl CopyEngine for GatedCopyEngine {
    async fn copy(&self, src: Region, dst: Region) -> Result<(), CopyError> {
        self.entered.notify_one();
        self.gate.notified().await;
        self.inner.copy(src, dst).await
    }

    async fn zero(&self, dst: Region) -> Result<(), CopyError> {
        self.inner.zero(dst).await
    }
}

/// An I/O submitter that stalls reads (never writes) the same way, so a
/// test can hold a shared read open across a concurrent break-sharing
/// install.
struct GatedReadIo {
    inner: Arc<InMemoryDataDevice>,
    entered: Arc<Notify>,
    gate: Arc<Notify>,
}

#[async_trait]
impl IoSubmitter for GatedReadIo {
    async fn submit(
        &self,
        data_block: DBlock,
        begin_sector: u32,
        nr_sectors: u32,
        payload: &BioPayload,
    ) -> Result<Option<Vec<u8>>, BioError> {
        if matches!(payload, BioPayload::Read) {
            self.entered.notify_one();
            self.gate.notified().await;
        }
        self.inner.submit(data_block, begin_sector, nr_sectors, payload).await
    }
}

#[tokio::test]
async fn break_sharing_commit_waits_for_a_read_admitted_before_it_completes() {
    let config = PoolConfig::new("meta0", "data0", SECTORS_PER_BLOCK, 8, false).unwrap();
    let metadata = Arc::new(InMemoryMetadataStore::new());
    metadata.resize_data_dev(8).await.unwrap();
    let device = Arc::new(InMemoryDataDevice::new(SECTORS_PER_BLOCK));

    let copy_entered = Arc::new(Notify::new());
    let copy_gate = Arc::new(Notify::new());
    let read_entered = Arc::new(Notify::new());
    let read_gate = Arc::new(Notify::new());
    let copy_engine = Arc::new(GatedCopyEngine {
        inner: Arc::clone(&device),
        entered: Arc::clone(&copy_entered),
        gate: Arc::clone(&copy_gate),
    });
    let io = Arc::new(GatedReadIo {
        inner: Arc::clone(&device),
        entered: Arc::clone(&read_entered),
        gate: Arc::clone(&read_gate),
    });
    let pool = Pool::start(config, metadata, copy_engine, io);

    pool.handle_message(PoolMessage::CreateThin(0)).await.unwrap();
    let origin = Arc::new(
        ThinDevice::bind(Arc::clone(&pool), ThinConfig::parse_table_args("/dev/mapper/p 0").unwrap())
            .await
            .unwrap(),
    );
    write_whole_block(&origin, 0, 0x11).await;

    pool.handle_message(PoolMessage::CreateSnap { dev_id: 1, origin_id: 0 })
        .await
        .unwrap();
    let snap = ThinDevice::bind(Arc::clone(&pool), ThinConfig::parse_table_args("/dev/mapper/p 1").unwrap())
        .await
        .unwrap();

    // A partial write through the snapshot breaks sharing: the old block's
    // contents must be copied onto a new block before the driving write's
    // own range is applied and the mapping installed.
    let (write_bio, mut write_rx) = Bio::new(
        1,
        0,
        SECTORS_PER_BLOCK / 2,
        BioFlags::WRITE,
        BioPayload::Write(vec![0x22; BLOCK_BYTES / 2]),
    );
    snap.submit(write_bio).await;

    // Wait for the worker to detain, allocate the replacement block, and
    // reach the copy step.
    timeout(copy_entered.notified()).await.unwrap();

    // Admit a read of the still-shared block while the copy is stalled.
    let read_origin = Arc::clone(&origin);
    let read_task = tokio::spawn(async move { read_whole_block(&read_origin, 0, 0).await });
    timeout(read_entered.notified()).await.unwrap();

    // Let the copy and the driving write's own I/O run to completion. The
    // resulting mapping record must gate on the read above rather than
    // commit immediately, since that read was admitted before the copy
    // finished.
    copy_gate.notify_one();
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    assert!(
        matches!(write_rx.try_recv(), Err(tokio::sync::oneshot::error::TryRecvError::Empty)),
        "break-sharing commit must not run while the admitted read is still outstanding"
    );

    // Only now release the read; its completion drains the gated record.
    read_gate.notify_one();

    let read_data = timeout(read_task).await.unwrap().unwrap();
    assert_eq!(read_data, vec![0x11; BLOCK_BYTES], "read must see pre-break contents");

    timeout(write_rx).await.unwrap().unwrap();
    assert_eq!(read_whole_block(&origin, 0, 0).await, vec![0x11; BLOCK_BYTES]);
    let expected_snap: Vec<u8> = std::iter::repeat(0x22)
        .take(BLOCK_BYTES / 2)
        .chain(std::iter::repeat(0x11).take(BLOCK_BYTES / 2))
        .collect();
    assert_eq!(read_whole_block(&snap, 1, 0).await, expected_snap);
}

#[tokio::test]
async fn running_out_of_space_defers_to_the_retry_queue_and_resumes_after_preresume() {
    let pool = new_pool(1).await;
    pool.handle_message(PoolMessage::CreateThin(0)).await.unwrap();
    let thin = ThinDevice::bind(Arc::clone(&pool), ThinConfig::parse_table_args("/dev/mapper/p 0").unwrap())
        .await
        .unwrap();

    write_whole_block(&thin, 0, 0x44).await; // consumes the single data block

    let sector = 1 * u64::from(SECTORS_PER_BLOCK);
    let (bio, rx) = Bio::new(0, sector, SECTORS_PER_BLOCK, BioFlags::WRITE, BioPayload::Write(vec![0x55; BLOCK_BYTES]));
    thin.submit(bio).await;

    // Give the worker a chance to discover OOS and latch low water.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(pool.low_water_triggered());

    pool.preresume(4).await.unwrap();
    timeout(rx).await.unwrap().unwrap();
    assert_eq!(read_whole_block(&thin, 0, 1).await, vec![0x55; BLOCK_BYTES]);
}

#[tokio::test]
async fn flush_commits_metadata_before_completing() {
    let pool = new_pool(8).await;
    pool.handle_message(PoolMessage::CreateThin(0)).await.unwrap();
    let thin = ThinDevice::bind(Arc::clone(&pool), ThinConfig::parse_table_args("/dev/mapper/p 0").unwrap())
        .await
        .unwrap();

    write_whole_block(&thin, 0, 0x66).await;

    let (bio, rx) = Bio::new(0, 0, 0, BioFlags::FLUSH, BioPayload::Read);
    thin.submit(bio).await;
    timeout(rx).await.unwrap().unwrap();
}

#[tokio::test]
async fn two_writers_to_the_same_unmapped_block_both_complete_with_one_mapping() {
    let pool = new_pool(8).await;
    pool.handle_message(PoolMessage::CreateThin(0)).await.unwrap();
    let thin = ThinDevice::bind(Arc::clone(&pool), ThinConfig::parse_table_args("/dev/mapper/p 0").unwrap())
        .await
        .unwrap();

    let (bio_a, rx_a) = Bio::new(0, 0, SECTORS_PER_BLOCK, BioFlags::WRITE, BioPayload::Write(vec![0x01; BLOCK_BYTES]));
    let (bio_b, rx_b) = Bio::new(0, 0, SECTORS_PER_BLOCK, BioFlags::WRITE, BioPayload::Write(vec![0x02; BLOCK_BYTES]));
    thin.submit(bio_a).await;
    thin.submit(bio_b).await;

    timeout(rx_a).await.unwrap().unwrap();
    timeout(rx_b).await.unwrap().unwrap();
    assert_eq!(thin.mapped_block_count().await.unwrap(), 1);
}
