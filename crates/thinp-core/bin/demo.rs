//! Wires a pool end to end against the in-memory reference metadata store
//! and data device: create a thin device, provision a few blocks, take a
//! snapshot, and print the resulting status lines.

use std::sync::Arc;

use thinp_core::config::ThinConfig;
use thinp_core::io::{BioFlags, BioPayload};
use thinp_core::testing::{InMemoryDataDevice, InMemoryMetadataStore};
use thinp_core::thin::ThinDevice;
use thinp_core::{Bio, Pool, PoolConfig, PoolMessage};

const SECTORS_PER_BLOCK: u32 = 128;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = PoolConfig::new("meta0", "data0", SECTORS_PER_BLOCK, 8, false).expect("valid pool config");
    let metadata = Arc::new(InMemoryMetadataStore::new());
    metadata.resize_data_dev(64).await.expect("resize data dev");

    let device = Arc::new(InMemoryDataDevice::new(SECTORS_PER_BLOCK));
    let pool = Pool::start(config, metadata, device.clone(), device);

    pool.handle_message(PoolMessage::CreateThin(0)).await.expect("create thin 0");

    let thin0 = ThinDevice::bind(Arc::clone(&pool), ThinConfig::parse_table_args("/dev/mapper/pool 0").unwrap())
        .await
        .expect("bind thin 0");

    let payload = vec![0x42u8; SECTORS_PER_BLOCK as usize * 512];
    let (bio, rx) = Bio::new(0, 0, SECTORS_PER_BLOCK, BioFlags::WRITE, BioPayload::Write(payload));
    thin0.submit(bio).await;
    rx.await.expect("write completes").expect("write succeeds");

    pool.handle_message(PoolMessage::CreateSnap { dev_id: 1, origin_id: 0 })
        .await
        .expect("create snapshot");
    let thin1 = ThinDevice::bind(Arc::clone(&pool), ThinConfig::parse_table_args("/dev/mapper/pool 1").unwrap())
        .await
        .expect("bind thin 1");

    let (read_bio, read_rx) = Bio::new(1, 0, SECTORS_PER_BLOCK, BioFlags::READ, BioPayload::Read);
    thin1.submit(read_bio).await;
    let completion = read_rx.await.expect("read completes").expect("read succeeds");
    println!("snapshot read back {} bytes", match completion {
        thinp_core::BioCompletion::Data(bytes) => bytes.len(),
        thinp_core::BioCompletion::Written => 0,
    });

    println!("pool table: {}", pool.status_table());
    println!("thin 0 table: {}", thin0.status_table());
    println!("thin 1 table: {}", thin1.status_table());
    println!("thin 0 mapped blocks: {}", thin0.mapped_block_count().await.unwrap());
    println!("thin 1 mapped blocks: {}", thin1.mapped_block_count().await.unwrap());
}
