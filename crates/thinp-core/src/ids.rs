//! Block and device identifiers.

/// Index into a thin device's virtual address space.
pub type VBlock = u64;

/// Index into the pool's physical data device.
pub type DBlock = u64;

/// A thin-device identifier. Device ids are bounded at `2^24 - 1` (§4.5).
pub type ThinId = u32;

/// Upper bound (inclusive) on a thin device id.
pub const MAX_THIN_ID: u32 = (1 << 24) - 1;

/// Validates a device id against the `2^24 - 1` bound.
pub fn validate_thin_id(id: u32) -> Result<(), crate::error::ConfigError> {
    if id > MAX_THIN_ID {
        Err(crate::error::ConfigError::DeviceIdOutOfRange {
            id,
            max: MAX_THIN_ID,
        })
    } else {
        Ok(())
    }
}
