// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Engine configuration
//!
//! Values come from defaults, builder calls, or the `COLLECTIVE_*`
//! environment variables read by [`EngineConfig::from_env`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CollectiveError, CollectiveResult};

pub const FUSION_THRESHOLD_ENV: &str = "COLLECTIVE_FUSION_THRESHOLD";
pub const TIMELINE_ENV: &str = "COLLECTIVE_TIMELINE";
pub const CYCLE_TIME_ENV: &str = "COLLECTIVE_CYCLE_TIME";
pub const HIERARCHICAL_ALLGATHER_ENV: &str = "COLLECTIVE_HIERARCHICAL_ALLGATHER";

/// 64 MiB
pub const DEFAULT_FUSION_THRESHOLD_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_CYCLE_TIME_MS: f64 = 5.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Size of the fusion buffer allocated per device/framework pair
    pub fusion_threshold_bytes: usize,
    /// Pause between coordination cycles; consumed by the coordination loop
    pub cycle_time_ms: f64,
    /// Chrome trace output; no timeline when unset
    pub timeline_path: Option<PathBuf>,
    /// Gather through a host-shared buffer and one cross-host exchange
    pub hierarchical_allgather: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fusion_threshold_bytes: DEFAULT_FUSION_THRESHOLD_BYTES,
            cycle_time_ms: DEFAULT_CYCLE_TIME_MS,
            timeline_path: None,
            hierarchical_allgather: false,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by whatever `COLLECTIVE_*` variables are set
    pub fn from_env() -> CollectiveResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup
    pub fn from_lookup<F>(lookup: F) -> CollectiveResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(FUSION_THRESHOLD_ENV) {
            config.fusion_threshold_bytes = value.trim().parse().map_err(|_| {
                CollectiveError::InvalidArgument(format!(
                    "{} must be a byte count, got '{}'",
                    FUSION_THRESHOLD_ENV, value
                ))
            })?;
        }

        if let Some(value) = lookup(CYCLE_TIME_ENV) {
            let cycle: f64 = value.trim().parse().map_err(|_| {
                CollectiveError::InvalidArgument(format!(
                    "{} must be a number of milliseconds, got '{}'",
                    CYCLE_TIME_ENV, value
                ))
            })?;
            if cycle.is_nan() || cycle < 0.0 {
                return Err(CollectiveError::InvalidArgument(format!(
                    "{} must not be negative",
                    CYCLE_TIME_ENV
                )));
            }
            config.cycle_time_ms = cycle;
        }

        if let Some(value) = lookup(HIERARCHICAL_ALLGATHER_ENV) {
            config.hierarchical_allgather = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "" | "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(CollectiveError::InvalidArgument(format!(
                        "{} must be a boolean, got '{}'",
                        HIERARCHICAL_ALLGATHER_ENV, value
                    )))
                }
            };
        }

        if let Some(value) = lookup(TIMELINE_ENV) {
            if !value.is_empty() {
                config.timeline_path = Some(PathBuf::from(value));
            }
        }

        Ok(config)
    }

    pub fn with_fusion_threshold_bytes(mut self, bytes: usize) -> Self {
        self.fusion_threshold_bytes = bytes;
        self
    }

    pub fn with_cycle_time_ms(mut self, ms: f64) -> Self {
        self.cycle_time_ms = ms;
        self
    }

    pub fn with_hierarchical_allgather(mut self, enabled: bool) -> Self {
        self.hierarchical_allgather = enabled;
        self
    }

    pub fn with_timeline_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.timeline_path = Some(path.into());
        self
    }
}
