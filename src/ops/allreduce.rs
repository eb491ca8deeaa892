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

//! Fused allreduce
//!
//! A batch of several tensors is packed back to back into the fusion buffer
//! of its (device, framework), summed across the group with one wire call,
//! and unpacked into the entries' outputs. A batch of one skips the staging
//! buffer and reduces directly in the output.

use std::sync::Arc;

use crate::ctx::CollectiveContext;
use crate::entry::TensorTableEntry;
use crate::error::{CollectiveError, CollectiveResult};
use crate::fusion_buffer::lock_buffer;
use crate::message::Response;
use crate::net::{Channel, Communicator};
use crate::ops::base_ops::{check_uniform_dtype, CollectiveOp, CopyStrategies, MemcpyStrategy};
use crate::parameter_manager::ParameterManager;
use crate::timeline;

pub struct AllreduceOp {
    channel: Arc<dyn Channel>,
    copiers: CopyStrategies,
}

impl AllreduceOp {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self::with_copy_strategies(channel, CopyStrategies::new())
    }

    pub fn with_copy_strategies(channel: Arc<dyn Channel>, copiers: CopyStrategies) -> Self {
        Self { channel, copiers }
    }

    /// Total element count of the batch
    pub fn num_elements(entries: &[TensorTableEntry]) -> i64 {
        entries.iter().map(|e| e.tensor.shape().num_elements()).sum()
    }

    /// Byte offset of every entry inside the fusion buffer, in batch order
    pub fn fusion_offsets(entries: &[TensorTableEntry]) -> Vec<usize> {
        let mut offset = 0;
        entries
            .iter()
            .map(|e| {
                let at = offset;
                offset += e.tensor.size();
                at
            })
            .collect()
    }

    /// Pack every input at its running offset. Returns the staged length.
    fn memcpy_in_fusion_buffer(
        &self,
        copier: &dyn MemcpyStrategy,
        entries: &[TensorTableEntry],
        buffer: &mut [u8],
    ) -> CollectiveResult<usize> {
        let staged: usize = entries.iter().map(|e| e.tensor.size()).sum();
        if staged > buffer.len() {
            return Err(CollectiveError::Capacity(format!(
                "batch of {} bytes exceeds the fusion buffer of {} bytes",
                staged,
                buffer.len()
            )));
        }

        let mut offset = 0;
        for e in entries {
            let len = e.tensor.size();
            copier.memcpy_entry_in(&mut buffer[offset..offset + len], e)?;
            offset += len;
        }
        Ok(offset)
    }

    /// Copy every entry's reduced slot back out, using the same offsets
    fn memcpy_out_fusion_buffer(
        &self,
        copier: &dyn MemcpyStrategy,
        entries: &mut [TensorTableEntry],
        buffer: &[u8],
    ) -> CollectiveResult<()> {
        let mut offset = 0;
        for e in entries.iter_mut() {
            let len = e.tensor.size();
            copier.memcpy_entry_out(&buffer[offset..offset + len], e)?;
            offset += len;
        }
        Ok(())
    }

    fn reduce_single(
        &self,
        ctx: &CollectiveContext,
        copier: &dyn MemcpyStrategy,
        entry: &mut TensorTableEntry,
        num_elements: usize,
    ) -> CollectiveResult<()> {
        let dtype = entry.dtype();
        let mut output = entry.output.take().ok_or_else(|| {
            CollectiveError::InvalidArgument(format!("tensor {} has no output allocated", entry.tensor_name))
        })?;

        let result = copier
            .memcpy_entry_in(output.data_mut(), entry)
            .and_then(|_| {
                ctx.timeline().activity_start(&entry.tensor_name, timeline::ALLREDUCE);
                let reduced = self
                    .channel
                    .allreduce(output.data_mut(), num_elements, dtype, Communicator::Global);
                ctx.timeline().activity_end(&entry.tensor_name);
                reduced
            });

        entry.output = Some(output);
        result
    }

    fn reduce_fused(
        &self,
        ctx: &CollectiveContext,
        copier: &dyn MemcpyStrategy,
        entries: &mut [TensorTableEntry],
        num_elements: usize,
    ) -> CollectiveResult<()> {
        let first = &entries[0];
        let (device, framework, dtype) = (first.device, first.framework(), first.dtype());

        let staged_len: usize = entries.iter().map(|e| e.tensor.size()).sum();
        let threshold = ctx.parameter_manager().tensor_fusion_threshold_bytes();
        ctx.fusion_buffer()
            .initialize_buffer(threshold.max(staged_len), device, framework)?;
        let shared = ctx.fusion_buffer().get_buffer(device, framework)?;
        let mut guard = lock_buffer(&shared)?;
        let buffer = guard.access_data_mut();

        ctx.timeline().activity_start_all(entries, timeline::MEMCPY_IN_FUSION_BUFFER);
        let staged = self.memcpy_in_fusion_buffer(copier, entries, buffer);
        ctx.timeline().activity_end_all(entries);
        let staged = staged?;

        ctx.timeline().activity_start_all(entries, timeline::ALLREDUCE);
        let reduced = self
            .channel
            .allreduce(&mut buffer[..staged], num_elements, dtype, Communicator::Global);
        ctx.timeline().activity_end_all(entries);
        reduced?;

        ctx.timeline().activity_start_all(entries, timeline::MEMCPY_OUT_FUSION_BUFFER);
        let copied = self.memcpy_out_fusion_buffer(copier, entries, &buffer[..staged]);
        ctx.timeline().activity_end_all(entries);
        copied
    }
}

impl CollectiveOp for AllreduceOp {
    fn name(&self) -> &'static str {
        "allreduce"
    }

    fn execute(
        &self,
        ctx: &CollectiveContext,
        entries: &mut [TensorTableEntry],
        _response: &Response,
    ) -> CollectiveResult<()> {
        check_uniform_dtype(entries)?;
        let (device, framework) = (entries[0].device, entries[0].framework());
        if let Some(other) = entries.iter().find(|e| e.device != device || e.framework() != framework) {
            return Err(CollectiveError::InvalidArgument(format!(
                "tensor {} is on device {} ({:?}) but the batch is on device {} ({:?})",
                other.tensor_name,
                other.device,
                other.framework(),
                device,
                framework
            )));
        }
        let copier = self.copiers.get(device, framework).ok_or_else(|| {
            CollectiveError::NotImplemented(format!("no copy strategy for device {} ({:?})", device, framework))
        })?;

        let num_elements = Self::num_elements(entries);
        log::debug!(
            "Allreduce of {} tensors, {} elements on rank {}",
            entries.len(),
            num_elements,
            ctx.rank()
        );
        let num_elements = usize::try_from(num_elements)
            .map_err(|_| CollectiveError::InvalidArgument(format!("negative element count {}", num_elements)))?;

        ctx.timeline().activity_start_all(entries, timeline::ALLOCATE_OUTPUT);
        let allocated = entries.iter_mut().try_for_each(|e| e.ensure_output_like_input());
        ctx.timeline().activity_end_all(entries);
        allocated?;

        if entries.len() == 1 {
            self.reduce_single(ctx, copier.as_ref(), &mut entries[0], num_elements)
        } else {
            self.reduce_fused(ctx, copier.as_ref(), entries, num_elements)
        }
    }

    fn enabled(&self, _params: &ParameterManager, entries: &[TensorTableEntry], _response: &Response) -> bool {
        match entries.first() {
            Some(e) => self.copiers.supports(e.device, e.framework()),
            None => false,
        }
    }
}
