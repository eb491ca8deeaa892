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

//! Per-process state shared by all operations
//!
//! A [`CollectiveContext`] is built once at process start and passed by
//! reference into every operation call.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{CollectiveError, CollectiveResult};
use crate::fusion_buffer::FusionBufferManager;
use crate::net::Channel;
use crate::parameter_manager::ParameterManager;
use crate::timeline::Timeline;

pub struct CollectiveContext {
    rank: i32,
    size: i32,
    fusion_buffer: FusionBufferManager,
    timeline: Arc<Timeline>,
    parameter_manager: ParameterManager,
    config: EngineConfig,
}

impl CollectiveContext {
    pub fn new(rank: i32, size: i32, config: EngineConfig) -> CollectiveResult<Self> {
        if size < 1 || rank < 0 || rank >= size {
            return Err(CollectiveError::InvalidArgument(format!(
                "Malformed rank: {} or group size: {}",
                rank, size
            )));
        }

        let timeline = match &config.timeline_path {
            Some(path) => {
                log::info!("Writing timeline to {}", path.display());
                Timeline::to_file(path)?
            }
            None => Timeline::disabled(),
        };

        Ok(Self {
            rank,
            size,
            fusion_buffer: FusionBufferManager::new(),
            timeline: Arc::new(timeline),
            parameter_manager: ParameterManager::new(&config),
            config,
        })
    }

    /// Rank and group size taken from the transport
    pub fn for_channel(channel: &dyn Channel, config: EngineConfig) -> CollectiveResult<Self> {
        Self::new(channel.rank(), channel.size(), config)
    }

    /// Single-process context with default configuration
    pub fn local() -> Self {
        Self {
            rank: 0,
            size: 1,
            fusion_buffer: FusionBufferManager::new(),
            timeline: Arc::new(Timeline::disabled()),
            parameter_manager: ParameterManager::default(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_timeline(mut self, timeline: Arc<Timeline>) -> Self {
        self.timeline = timeline;
        self
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    pub fn fusion_buffer(&self) -> &FusionBufferManager {
        &self.fusion_buffer
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn parameter_manager(&self) -> &ParameterManager {
        &self.parameter_manager
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
