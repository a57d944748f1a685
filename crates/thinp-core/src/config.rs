//! Pool/thin configuration and the constructor-argument / message / status
//! line surface described in §6.3.

use crate::error::ConfigError;
use crate::ids::{validate_thin_id, ThinId};

/// `64 KiB` expressed in 512-byte sectors.
pub const MIN_SECTORS_PER_BLOCK: u32 = 128;
/// `1 GiB` expressed in 512-byte sectors.
pub const MAX_SECTORS_PER_BLOCK: u32 = 2_097_152;
/// `255 * 2^14 * 8` sectors (§4.5).
pub const MAX_METADATA_SECTORS: u64 = 255 * (1u64 << 14) * 8;

/// Geometry and feature configuration for a pool, parsed from the
/// constructor arguments in §6.3:
/// `<metadata_dev> <data_dev> <block_size_sectors> <low_water_sectors> [<#feat> [skip_block_zeroing]]`.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub metadata_dev: String,
    pub data_dev: String,
    pub sectors_per_block: u32,
    pub low_water_sectors: u64,
    pub skip_block_zeroing: bool,
    block_shift: u32,
    offset_mask: u64,
}

impl PoolConfig {
    /// Builds a validated configuration from already-parsed fields.
    pub fn new(
        metadata_dev: impl Into<String>,
        data_dev: impl Into<String>,
        sectors_per_block: u32,
        low_water_sectors: u64,
        skip_block_zeroing: bool,
    ) -> Result<Self, ConfigError> {
        if !sectors_per_block.is_power_of_two()
            || sectors_per_block < MIN_SECTORS_PER_BLOCK
            || sectors_per_block > MAX_SECTORS_PER_BLOCK
        {
            return Err(ConfigError::BadBlockSize {
                min: MIN_SECTORS_PER_BLOCK,
                max: MAX_SECTORS_PER_BLOCK,
                got: sectors_per_block,
            });
        }

        Ok(Self {
            metadata_dev: metadata_dev.into(),
            data_dev: data_dev.into(),
            sectors_per_block,
            low_water_sectors,
            skip_block_zeroing,
            block_shift: sectors_per_block.trailing_zeros(),
            offset_mask: u64::from(sectors_per_block - 1),
        })
    }

    /// Parses `<metadata_dev> <data_dev> <block_size_sectors> <low_water_sectors> [<#feat> [skip_block_zeroing]]`.
    pub fn parse_table_args(args: &str) -> Result<Self, ConfigError> {
        let tokens: Vec<&str> = args.split_whitespace().collect();
        if tokens.len() < 4 {
            return Err(ConfigError::MissingArgument("data_dev"));
        }

        let metadata_dev = tokens[0].to_string();
        let data_dev = tokens[1].to_string();
        let sectors_per_block = parse_field(tokens[2], "block_size_sectors")?;
        let low_water_sectors = parse_field(tokens[3], "low_water_sectors")?;

        let mut skip_block_zeroing = false;
        if tokens.len() > 4 {
            let nr_feat: usize = parse_field(tokens[4], "#feat")?;
            let features = &tokens[5..];
            if features.len() != nr_feat {
                return Err(ConfigError::InvalidArgument {
                    name: "#feat",
                    value: tokens[4].to_string(),
                });
            }
            for feat in features {
                match *feat {
                    "skip_block_zeroing" => skip_block_zeroing = true,
                    other => return Err(ConfigError::UnknownFeature(other.to_string())),
                }
            }
        }

        Self::new(
            metadata_dev,
            data_dev,
            sectors_per_block,
            low_water_sectors,
            skip_block_zeroing,
        )
    }

    /// Checks the metadata device's declared sector count against the hard
    /// cap in §4.5.
    pub fn validate_metadata_sectors(&self, metadata_sectors: u64) -> Result<(), ConfigError> {
        if metadata_sectors > MAX_METADATA_SECTORS {
            return Err(ConfigError::MetadataDeviceTooLarge {
                max: MAX_METADATA_SECTORS,
            });
        }
        Ok(())
    }

    #[inline]
    pub fn block_shift(&self) -> u32 {
        self.block_shift
    }

    #[inline]
    pub fn offset_mask(&self) -> u64 {
        self.offset_mask
    }

    /// `block = sector >> block_shift`.
    #[inline]
    pub fn block_of(&self, sector: u64) -> u64 {
        sector >> self.block_shift
    }

    /// `sector & offset_mask`.
    #[inline]
    pub fn offset_of(&self, sector: u64) -> u64 {
        sector & self.offset_mask
    }

    /// `(data << block_shift) | (sector & offset_mask)`.
    #[inline]
    pub fn remap_sector(&self, data_block: u64, original_sector: u64) -> u64 {
        (data_block << self.block_shift) | self.offset_of(original_sector)
    }

    /// Low water threshold expressed in whole data blocks (rounded down).
    pub fn low_water_blocks(&self) -> u64 {
        self.low_water_sectors / u64::from(self.sectors_per_block)
    }

    /// Status TABLE line (§6.3).
    pub fn status_table(&self) -> String {
        if self.skip_block_zeroing {
            format!(
                "{} {} {} {} 1 skip_block_zeroing",
                self.metadata_dev, self.data_dev, self.sectors_per_block, self.low_water_sectors
            )
        } else {
            format!(
                "{} {} {} {} 0",
                self.metadata_dev, self.data_dev, self.sectors_per_block, self.low_water_sectors
            )
        }
    }
}

/// Thin-target constructor configuration: `<pool_dev> <dev_id>`.
#[derive(Debug, Clone)]
pub struct ThinConfig {
    pub pool_dev: String,
    pub dev_id: ThinId,
}

impl ThinConfig {
    pub fn parse_table_args(args: &str) -> Result<Self, ConfigError> {
        let tokens: Vec<&str> = args.split_whitespace().collect();
        if tokens.len() != 2 {
            return Err(ConfigError::MissingArgument("dev_id"));
        }
        let pool_dev = tokens[0].to_string();
        let dev_id: u32 = parse_field(tokens[1], "dev_id")?;
        validate_thin_id(dev_id)?;
        Ok(Self { pool_dev, dev_id })
    }

    pub fn status_table(&self) -> String {
        format!("{} {}", self.pool_dev, self.dev_id)
    }
}

/// Runtime messages accepted by a pool target (§4.7, §6.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolMessage {
    CreateThin(ThinId),
    CreateSnap { dev_id: ThinId, origin_id: ThinId },
    Delete(ThinId),
    Trim { dev_id: ThinId, new_size_sectors: u64 },
    SetTransactionId { old: u64, new: u64 },
}

impl PoolMessage {
    pub fn parse(line: &str) -> Result<Self, ConfigError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (cmd, rest) = tokens
            .split_first()
            .ok_or(ConfigError::MissingArgument("message"))?;

        match *cmd {
            "create_thin" => {
                let id = parse_dev_id(rest, 0, "dev_id")?;
                Ok(Self::CreateThin(id))
            }
            "create_snap" => {
                let dev_id = parse_dev_id(rest, 0, "dev_id")?;
                let origin_id = parse_dev_id(rest, 1, "origin_id")?;
                Ok(Self::CreateSnap { dev_id, origin_id })
            }
            "delete" => {
                let id = parse_dev_id(rest, 0, "dev_id")?;
                Ok(Self::Delete(id))
            }
            "trim" => {
                let dev_id = parse_dev_id(rest, 0, "dev_id")?;
                let new_size_sectors = parse_field(
                    rest.get(1).ok_or(ConfigError::MissingArgument("new_size_sectors"))?,
                    "new_size_sectors",
                )?;
                Ok(Self::Trim {
                    dev_id,
                    new_size_sectors,
                })
            }
            "set_transaction_id" => {
                let old = parse_field(
                    rest.first().ok_or(ConfigError::MissingArgument("old"))?,
                    "old",
                )?;
                let new = parse_field(
                    rest.get(1).ok_or(ConfigError::MissingArgument("new"))?,
                    "new",
                )?;
                Ok(Self::SetTransactionId { old, new })
            }
            other => Err(ConfigError::UnknownMessage(other.to_string())),
        }
    }
}

fn parse_dev_id(rest: &[&str], idx: usize, name: &'static str) -> Result<ThinId, ConfigError> {
    let raw: u32 = parse_field(rest.get(idx).ok_or(ConfigError::MissingArgument(name))?, name)?;
    validate_thin_id(raw)?;
    Ok(raw)
}

fn parse_field<T: std::str::FromStr>(token: &str, name: &'static str) -> Result<T, ConfigError> {
    token.parse().map_err(|_| ConfigError::InvalidArgument {
        name,
        value: token.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pool_table_args() {
        let cfg = PoolConfig::parse_table_args("/dev/meta /dev/data 128 1024").unwrap();
        assert_eq!(cfg.sectors_per_block, 128);
        assert_eq!(cfg.low_water_sectors, 1024);
        assert!(!cfg.skip_block_zeroing);
        assert_eq!(cfg.block_shift(), 7);
        assert_eq!(cfg.offset_mask(), 127);
    }

    #[test]
    fn parses_pool_table_args_with_feature() {
        let cfg =
            PoolConfig::parse_table_args("/dev/meta /dev/data 128 1024 1 skip_block_zeroing")
                .unwrap();
        assert!(cfg.skip_block_zeroing);
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        let err = PoolConfig::parse_table_args("/dev/meta /dev/data 130 1024").unwrap_err();
        assert!(matches!(err, ConfigError::BadBlockSize { .. }));
    }

    #[test]
    fn remaps_sector_correctly() {
        let cfg = PoolConfig::new("m", "d", 128, 1024, false).unwrap();
        // virtual sector 200 -> block 1, offset 72
        assert_eq!(cfg.block_of(200), 1);
        assert_eq!(cfg.offset_of(200), 72);
        assert_eq!(cfg.remap_sector(5, 200), (5 << 7) | 72);
    }

    #[test]
    fn parses_thin_table_args() {
        let cfg = ThinConfig::parse_table_args("/dev/mapper/pool 3").unwrap();
        assert_eq!(cfg.dev_id, 3);
    }

    #[test]
    fn parses_messages() {
        assert_eq!(
            PoolMessage::parse("create_thin 1").unwrap(),
            PoolMessage::CreateThin(1)
        );
        assert_eq!(
            PoolMessage::parse("create_snap 2 1").unwrap(),
            PoolMessage::CreateSnap {
                dev_id: 2,
                origin_id: 1
            }
        );
        assert_eq!(
            PoolMessage::parse("trim 1 4096").unwrap(),
            PoolMessage::Trim {
                dev_id: 1,
                new_size_sectors: 4096
            }
        );
        assert!(PoolMessage::parse("bogus").is_err());
    }

    #[test]
    fn rejects_oversize_device_id() {
        let err = PoolMessage::parse("create_thin 99999999").unwrap_err();
        assert!(matches!(err, ConfigError::DeviceIdOutOfRange { .. }));
    }
}
