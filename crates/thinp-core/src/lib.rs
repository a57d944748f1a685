//! Core pipeline for a thin-provisioning block-storage pool: the bio
//! prison, the deferred-read set, and the provisioning/copy-on-write
//! worker that ties them to a metadata store and a copy engine.

pub mod config;
pub mod copy_engine;
pub mod deferred_set;
pub mod error;
pub mod ids;
pub mod io;
mod invariants;
pub mod mapper;
pub mod mapping;
pub mod metadata;
pub mod pool;
pub mod prison;
pub mod registry;
pub mod reserve;
pub mod testing;
pub mod thin;
mod worker;

pub use config::{PoolConfig, PoolMessage, ThinConfig};
pub use error::{BioError, ConfigError, CopyError, MetadataError, PoolError};
pub use ids::{DBlock, ThinId, VBlock};
pub use io::{Bio, BioCompletion, BioFlags, BioPayload, BioResult};
pub use mapper::MapOutcome;
pub use pool::Pool;
pub use thin::ThinDevice;
