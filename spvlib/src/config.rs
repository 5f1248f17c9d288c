// Copyright (C) 2013-2020 Blockstack PBC, a public benefit corporation
// Copyright (C) 2020-2024 Stacks Open Internet Foundation
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use spv_common::consts::MAX_BLOCKS_PER_MSG;

use crate::stall::{STALL_RESPONSE_TIMEOUT, STALL_TICK_INTERVAL};

#[derive(thiserror::Error, Debug)]
/// An error occurred parsing the provided configuration
pub enum ConfigError {
    /// Error occurred reading config file
    #[error("{0}")]
    InvalidConfig(String),
    /// An error occurred parsing the TOML data
    #[error("{0}")]
    ParseError(String),
    /// A field was malformed
    #[error("identifier={0}, value={1}")]
    BadField(String, String),
}

/// Settings for one SPV peer session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpvConfig {
    /// How often the stall detector checks for overdue responses
    pub stall_tick_interval: Duration,
    /// How long after the last observed traffic an outstanding request may
    /// go unanswered before the peer is dropped
    pub stall_response_timeout: Duration,
    /// How many announced block hashes may wait to be requested
    pub block_queue_size: usize,
}

impl Default for SpvConfig {
    fn default() -> Self {
        SpvConfig {
            stall_tick_interval: STALL_TICK_INTERVAL,
            stall_response_timeout: STALL_RESPONSE_TIMEOUT,
            block_queue_size: MAX_BLOCKS_PER_MSG,
        }
    }
}

/// Internal struct for loading up the config file
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct RawConfigFile {
    /// Stall check interval, in millisecs
    pub stall_tick_interval_ms: Option<u64>,
    /// Grace period for outstanding responses, in millisecs
    pub stall_response_timeout_ms: Option<u64>,
    /// Capacity of the queue of block hashes awaiting download
    pub block_queue_size: Option<usize>,
}

impl RawConfigFile {
    /// load the config from a string
    pub fn load_from_str(data: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(data).map_err(|e| ConfigError::ParseError(format!("{e:?}")))?;
        Ok(config)
    }
}

impl TryFrom<&PathBuf> for RawConfigFile {
    type Error = ConfigError;

    fn try_from(path: &PathBuf) -> Result<Self, Self::Error> {
        Self::load_from_str(&fs::read_to_string(path).map_err(|e| {
            ConfigError::InvalidConfig(format!("failed to read config file: {e:?}"))
        })?)
    }
}

impl TryFrom<RawConfigFile> for SpvConfig {
    type Error = ConfigError;

    fn try_from(raw_data: RawConfigFile) -> Result<Self, Self::Error> {
        let defaults = SpvConfig::default();

        let stall_tick_interval = raw_data
            .stall_tick_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.stall_tick_interval);
        if stall_tick_interval.is_zero() {
            return Err(ConfigError::BadField(
                "stall_tick_interval_ms".to_string(),
                "0".to_string(),
            ));
        }

        let stall_response_timeout = raw_data
            .stall_response_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.stall_response_timeout);
        if stall_response_timeout < stall_tick_interval {
            return Err(ConfigError::BadField(
                "stall_response_timeout_ms".to_string(),
                format!(
                    "{} (must be at least stall_tick_interval_ms)",
                    stall_response_timeout.as_millis()
                ),
            ));
        }

        let block_queue_size = raw_data
            .block_queue_size
            .unwrap_or(defaults.block_queue_size);
        if block_queue_size == 0 {
            return Err(ConfigError::BadField(
                "block_queue_size".to_string(),
                "0".to_string(),
            ));
        }

        Ok(SpvConfig {
            stall_tick_interval,
            stall_response_timeout,
            block_queue_size,
        })
    }
}

impl TryFrom<&PathBuf> for SpvConfig {
    type Error = ConfigError;
    fn try_from(path: &PathBuf) -> Result<Self, ConfigError> {
        let config_file = RawConfigFile::try_from(path)?;
        Self::try_from(config_file)
    }
}

impl SpvConfig {
    /// load the config from a string and parse it
    pub fn load_from_str(data: &str) -> Result<Self, ConfigError> {
        RawConfigFile::load_from_str(data)?.try_into()
    }

    /// load the config from a file and parse it
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        Self::try_from(&PathBuf::from(path))
    }

    /// One-line summary for the logs
    pub fn config_to_log_string(&self) -> String {
        format!(
            "stall tick interval: {}ms, stall response timeout: {}ms, block queue size: {}",
            self.stall_tick_interval.as_millis(),
            self.stall_response_timeout.as_millis(),
            self.block_queue_size
        )
    }
}
