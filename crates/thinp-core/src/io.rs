//! The bio type and the I/O-submitter boundary (the block-device adapter).

use async_trait::async_trait;
use bitflags::bitflags;
use tokio::sync::oneshot;

use crate::error::BioError;
use crate::ids::{DBlock, ThinId};
use crate::mapping::EndioHook;

bitflags! {
    /// Flags carried by a bio. `FLUSH`/`FUA` force an ordered metadata
    /// commit before the bio is remapped and issued (§4.5).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BioFlags: u8 {
        const READ  = 0b0001;
        const WRITE = 0b0010;
        const FLUSH = 0b0100;
        const FUA   = 0b1000;
    }
}

impl BioFlags {
    #[inline]
    pub fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }

    #[inline]
    pub fn needs_flush(self) -> bool {
        self.intersects(Self::FLUSH | Self::FUA)
    }
}

/// The payload carried by a bio: bytes to write, or nothing (a read fills
/// its own buffer from the submitter).
#[derive(Debug, Clone)]
pub enum BioPayload {
    Write(Vec<u8>),
    Read,
}

/// What a submitted bio resolves to.
#[derive(Debug, Clone)]
pub enum BioCompletion {
    Written,
    Data(Vec<u8>),
}

pub type BioResult = Result<BioCompletion, BioError>;

/// Bytes per sector, used to size zero-filled reads of unmapped blocks.
pub const SECTOR_SIZE: usize = 512;

/// A single logical I/O request against a thin device's virtual address
/// space (§ GLOSSARY). `sector` starts as the virtual sector and is
/// rewritten in place on remap, exactly as described in §4.5.
pub struct Bio {
    pub thin_id: ThinId,
    pub sector: u64,
    pub nr_sectors: u32,
    pub flags: BioFlags,
    pub payload: BioPayload,
    pub(crate) remapped: bool,
    pub(crate) hook: Option<EndioHook>,
    completion: Option<oneshot::Sender<BioResult>>,
}

impl Bio {
    /// Creates a bio paired with a receiver the submitter awaits for the
    /// outcome.
    pub fn new(
        thin_id: ThinId,
        sector: u64,
        nr_sectors: u32,
        flags: BioFlags,
        payload: BioPayload,
    ) -> (Self, oneshot::Receiver<BioResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                thin_id,
                sector,
                nr_sectors,
                flags,
                payload,
                remapped: false,
                hook: None,
                completion: Some(tx),
            },
            rx,
        )
    }

    /// Whether this bio covers an entire block, given the block's sector
    /// count and the virtual block boundary it starts at.
    pub fn covers_whole_block(&self, sectors_per_block: u32, offset_in_block: u64) -> bool {
        offset_in_block == 0 && u64::from(self.nr_sectors) >= u64::from(sectors_per_block)
    }

    /// Completes the bio with a final outcome, consuming any attached hook.
    /// Exactly-once; a second call is a programming error and is ignored
    /// rather than panicking, matching "no lost bios, no double completion"
    /// without turning a bug into a crash on the I/O path.
    pub fn complete(&mut self, result: BioResult) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }

    pub fn fail(&mut self, err: BioError) {
        self.complete(Err(err));
    }
}

/// The block-device adapter that actually moves bytes for a `(data_block,
/// intra-block sector range)`.
#[async_trait]
pub trait IoSubmitter: Send + Sync {
    async fn submit(
        &self,
        data_block: DBlock,
        begin_sector: u32,
        nr_sectors: u32,
        payload: &BioPayload,
    ) -> Result<Option<Vec<u8>>, BioError>;
}
