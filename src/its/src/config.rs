// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::{Backoff, SZ_4K};

/// Default size of the command queue, in bytes.
pub const DEFAULT_CMD_QUEUE_SIZE: usize = 0x1_0000;
/// Largest command queue GITS_CBASER can describe (256 4K pages).
pub const MAX_CMD_QUEUE_SIZE: usize = 256 * SZ_4K;
/// Default number of polls before a hardware wait is abandoned.
pub const DEFAULT_POLL_ITERATIONS: u32 = 1_000_000;
/// Default delay between two polls, in microseconds.
pub const DEFAULT_POLL_DELAY_US: u64 = 1;
/// Default (and maximum) number of LPI ID bits.
pub const DEFAULT_LPI_ID_BITS: u32 = 16;
/// Smallest usable number of LPI ID bits: LPIs start at 8192.
pub const MIN_LPI_ID_BITS: u32 = 14;
/// Default number of VPE ID bits.
pub const DEFAULT_VPE_ID_BITS: u32 = 16;

/// Errors associated with the ITS configuration.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum ConfigError {
    /// Cannot parse the ITS configuration: {0}
    Parse(String),
    /// Invalid command queue size {0:#x}: must be a non-zero multiple of 4K, at most 1M
    InvalidQueueSize(usize),
    /// Invalid number of LPI ID bits {0}: must be between 14 and 16
    InvalidLpiIdBits(u32),
    /// Invalid restricted LPI count {0}
    InvalidLpiCount(u32),
    /// Invalid number of VPE ID bits {0}: must be between 1 and 16
    InvalidVpeIdBits(u32),
}

/// Strongly typed structure that represents the configuration of the ITS driver.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ItsConfig {
    /// Size of each controller's command queue, in bytes.
    #[serde(default = "default_cmd_queue_size")]
    pub cmd_queue_size: usize,
    /// Number of polls of a hardware register before giving up.
    #[serde(default = "default_poll_iterations")]
    pub poll_iterations: u32,
    /// Delay between two polls, in microseconds.
    #[serde(default = "default_poll_delay_us")]
    pub poll_delay_us: u64,
    /// Number of LPI ID bits supported by the redistributors.
    #[serde(default = "default_lpi_id_bits")]
    pub lpi_id_bits: u32,
    /// Number of LPIs the hypervisor lets us use, when restricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nr_lpis: Option<u32>,
    /// Number of VPE ID bits.
    #[serde(default = "default_vpe_id_bits")]
    pub vpe_id_bits: u32,
}

fn default_cmd_queue_size() -> usize {
    DEFAULT_CMD_QUEUE_SIZE
}

fn default_poll_iterations() -> u32 {
    DEFAULT_POLL_ITERATIONS
}

fn default_poll_delay_us() -> u64 {
    DEFAULT_POLL_DELAY_US
}

fn default_lpi_id_bits() -> u32 {
    DEFAULT_LPI_ID_BITS
}

fn default_vpe_id_bits() -> u32 {
    DEFAULT_VPE_ID_BITS
}

impl Default for ItsConfig {
    fn default() -> Self {
        ItsConfig {
            cmd_queue_size: DEFAULT_CMD_QUEUE_SIZE,
            poll_iterations: DEFAULT_POLL_ITERATIONS,
            poll_delay_us: DEFAULT_POLL_DELAY_US,
            lpi_id_bits: DEFAULT_LPI_ID_BITS,
            nr_lpis: None,
            vpe_id_bits: DEFAULT_VPE_ID_BITS,
        }
    }
}

impl ItsConfig {
    /// Parses and validates a JSON configuration. Missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ItsConfig =
            serde_json::from_str(json).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every field is within the range the hardware can describe.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cmd_queue_size == 0
            || self.cmd_queue_size % SZ_4K != 0
            || self.cmd_queue_size > MAX_CMD_QUEUE_SIZE
        {
            return Err(ConfigError::InvalidQueueSize(self.cmd_queue_size));
        }
        if !(MIN_LPI_ID_BITS..=DEFAULT_LPI_ID_BITS).contains(&self.lpi_id_bits) {
            return Err(ConfigError::InvalidLpiIdBits(self.lpi_id_bits));
        }
        if let Some(nr_lpis) = self.nr_lpis {
            // Anything smaller than this is ignored by the allocator, anything larger than the
            // LPI space is invalid.
            let space = (1u64 << self.lpi_id_bits) - u64::from(crate::lpi::LPI_BASE);
            if u64::from(nr_lpis) > space {
                return Err(ConfigError::InvalidLpiCount(nr_lpis));
            }
        }
        if !(1..=16).contains(&self.vpe_id_bits) {
            return Err(ConfigError::InvalidVpeIdBits(self.vpe_id_bits));
        }
        Ok(())
    }

    /// Polling parameters derived from `poll_iterations` and `poll_delay_us`.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            max_iters: self.poll_iterations,
            delay: Duration::from_micros(self.poll_delay_us),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ItsConfig::from_json("{}").unwrap();
        assert_eq!(config, ItsConfig::default());
        assert_eq!(config.cmd_queue_size, 0x1_0000);
        assert_eq!(
            config.backoff(),
            Backoff {
                max_iters: 1_000_000,
                delay: Duration::from_micros(1)
            }
        );
    }

    #[test]
    fn test_from_json() {
        let config = ItsConfig::from_json(
            r#"{"cmd_queue_size": 8192, "poll_iterations": 10, "poll_delay_us": 0,
                "nr_lpis": 4096, "vpe_id_bits": 8}"#,
        )
        .unwrap();
        assert_eq!(config.cmd_queue_size, 8192);
        assert_eq!(config.nr_lpis, Some(4096));
        assert_eq!(config.backoff().delay, Duration::ZERO);

        assert!(matches!(
            ItsConfig::from_json(r#"{"queue_size": 8192}"#),
            Err(ConfigError::Parse(_))
        ));
        assert_eq!(
            ItsConfig::from_json(r#"{"cmd_queue_size": 100}"#),
            Err(ConfigError::InvalidQueueSize(100))
        );
    }

    #[test]
    fn test_validate() {
        let mut config = ItsConfig {
            cmd_queue_size: 2 * MAX_CMD_QUEUE_SIZE,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidQueueSize(2 * MAX_CMD_QUEUE_SIZE))
        );

        config.cmd_queue_size = MAX_CMD_QUEUE_SIZE;
        config.validate().unwrap();

        config.lpi_id_bits = 13;
        assert_eq!(config.validate(), Err(ConfigError::InvalidLpiIdBits(13)));
        config.lpi_id_bits = 14;
        config.nr_lpis = Some(8193);
        assert_eq!(config.validate(), Err(ConfigError::InvalidLpiCount(8193)));
        config.nr_lpis = Some(8192);
        config.validate().unwrap();

        config.vpe_id_bits = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidVpeIdBits(0)));
    }

    #[test]
    fn test_serialize_skips_unset_lpi_count() {
        let json = serde_json::to_string(&ItsConfig::default()).unwrap();
        assert!(!json.contains("nr_lpis"));
        let back: ItsConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ItsConfig::default());
    }
}
