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

//! Tuning state read by operations

use std::sync::RwLock;

use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Params {
    fusion_threshold_bytes: usize,
    cycle_time_ms: f64,
    hierarchical_allgather: bool,
}

/// Current tuning parameters. An external tuner may update them between
/// cycles; operations only read.
#[derive(Debug)]
pub struct ParameterManager {
    params: RwLock<Params>,
}

impl ParameterManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            params: RwLock::new(Params {
                fusion_threshold_bytes: config.fusion_threshold_bytes,
                cycle_time_ms: config.cycle_time_ms,
                hierarchical_allgather: config.hierarchical_allgather,
            }),
        }
    }

    pub fn tensor_fusion_threshold_bytes(&self) -> usize {
        self.read().fusion_threshold_bytes
    }

    pub fn cycle_time_ms(&self) -> f64 {
        self.read().cycle_time_ms
    }

    /// Whether allgather should go through the host-shared buffer
    pub fn hierarchical_allgather(&self) -> bool {
        self.read().hierarchical_allgather
    }

    pub fn set_tensor_fusion_threshold_bytes(&self, bytes: usize) {
        self.write().fusion_threshold_bytes = bytes;
    }

    pub fn set_cycle_time_ms(&self, ms: f64) {
        self.write().cycle_time_ms = ms;
    }

    pub fn set_hierarchical_allgather(&self, enabled: bool) {
        self.write().hierarchical_allgather = enabled;
    }

    fn read(&self) -> Params {
        // Params is Copy, a poisoned lock still holds a consistent value
        match self.params.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Params> {
        match self.params.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for ParameterManager {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}
