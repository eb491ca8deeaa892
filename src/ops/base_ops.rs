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

//! Operation contract and per-device copy strategies
//!
//! The architecture follows a two-level design:
//! 1. Each operation (allreduce, allgather, broadcast, error) implements
//!    [`CollectiveOp`] and owns the layout and staging logic.
//! 2. The wire primitives come from a [`Channel`](crate::net::Channel), and
//!    the per-entry copies into and out of the fusion buffer come from a
//!    [`MemcpyStrategy`] chosen by device and framework.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ctx::CollectiveContext;
use crate::entry::TensorTableEntry;
use crate::error::{CollectiveError, CollectiveResult};
use crate::message::Response;
use crate::parameter_manager::ParameterManager;
use crate::tensor::{Device, Framework, CPU_DEVICE_ID};

/// Contract shared by every collective operation
pub trait CollectiveOp: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the collective step for the whole batch.
    ///
    /// On success every entry's output holds its result. On failure the
    /// error describes the batch; no output may be treated as valid.
    fn execute(
        &self,
        ctx: &CollectiveContext,
        entries: &mut [TensorTableEntry],
        response: &Response,
    ) -> CollectiveResult<()>;

    /// Whether this operation applies to the batch. Must not have side effects.
    fn enabled(
        &self,
        _params: &ParameterManager,
        _entries: &[TensorTableEntry],
        _response: &Response,
    ) -> bool {
        true
    }
}

/// Copies one entry into or out of its slot in a fusion buffer.
///
/// The slices handed in are exactly the entry's slot: `tensor.size()` bytes
/// starting at the entry's offset.
pub trait MemcpyStrategy: Send + Sync {
    fn memcpy_entry_in(&self, buffer_at_offset: &mut [u8], entry: &TensorTableEntry) -> CollectiveResult<()>;

    fn memcpy_entry_out(&self, buffer_at_offset: &[u8], entry: &mut TensorTableEntry) -> CollectiveResult<()>;
}

/// Plain byte copies for host-visible memory
#[derive(Debug, Default, Clone, Copy)]
pub struct HostMemcpy;

impl MemcpyStrategy for HostMemcpy {
    fn memcpy_entry_in(&self, buffer_at_offset: &mut [u8], entry: &TensorTableEntry) -> CollectiveResult<()> {
        let data = entry.tensor.data();
        if buffer_at_offset.len() != data.len() {
            return Err(CollectiveError::InvalidArgument(format!(
                "slot of {} bytes for tensor {} of {} bytes",
                buffer_at_offset.len(),
                entry.tensor_name,
                data.len()
            )));
        }
        buffer_at_offset.copy_from_slice(data);
        Ok(())
    }

    fn memcpy_entry_out(&self, buffer_at_offset: &[u8], entry: &mut TensorTableEntry) -> CollectiveResult<()> {
        let name = entry.tensor_name.clone();
        let out = entry.output_mut()?.data_mut();
        if out.len() != buffer_at_offset.len() {
            return Err(CollectiveError::InvalidArgument(format!(
                "output of tensor {} holds {} bytes, slot has {}",
                name,
                out.len(),
                buffer_at_offset.len()
            )));
        }
        out.copy_from_slice(buffer_at_offset);
        Ok(())
    }
}

/// Copy strategies keyed by (device, framework).
///
/// Host tensors fall back to [`HostMemcpy`] unless a strategy was
/// registered for the exact key.
#[derive(Clone)]
pub struct CopyStrategies {
    host: Arc<dyn MemcpyStrategy>,
    by_key: HashMap<(Device, Framework), Arc<dyn MemcpyStrategy>>,
}

impl CopyStrategies {
    pub fn new() -> Self {
        Self {
            host: Arc::new(HostMemcpy),
            by_key: HashMap::new(),
        }
    }

    pub fn register(&mut self, device: Device, framework: Framework, strategy: Arc<dyn MemcpyStrategy>) {
        self.by_key.insert((device, framework), strategy);
    }

    pub fn with_strategy(mut self, device: Device, framework: Framework, strategy: Arc<dyn MemcpyStrategy>) -> Self {
        self.register(device, framework, strategy);
        self
    }

    pub fn get(&self, device: Device, framework: Framework) -> Option<Arc<dyn MemcpyStrategy>> {
        match self.by_key.get(&(device, framework)) {
            Some(strategy) => Some(strategy.clone()),
            None if device == CPU_DEVICE_ID => Some(self.host.clone()),
            None => None,
        }
    }

    pub fn supports(&self, device: Device, framework: Framework) -> bool {
        self.get(device, framework).is_some()
    }
}

impl Default for CopyStrategies {
    fn default() -> Self {
        Self::new()
    }
}

/// All entries must share one element type to travel in one wire call
pub(crate) fn check_uniform_dtype(entries: &[TensorTableEntry]) -> CollectiveResult<()> {
    let first = entries
        .first()
        .ok_or_else(|| CollectiveError::InvalidArgument("empty batch".to_string()))?;
    let dtype = first.dtype();
    if let Some(other) = entries.iter().find(|e| e.dtype() != dtype) {
        return Err(CollectiveError::InvalidArgument(format!(
            "tensor {} is {} but the batch is {}",
            other.tensor_name,
            other.dtype(),
            dtype
        )));
    }
    Ok(())
}
