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

use std::sync::Arc;

use crate::ctx::CollectiveContext;
use crate::entry::TensorTableEntry;
use crate::error::{CollectiveError, CollectiveResult};
use crate::message::Response;
use crate::net::{Channel, Communicator};
use crate::ops::base_ops::CollectiveOp;
use crate::timeline;

/// Single-source broadcast of one tensor.
///
/// The root places its input in the output and sends the output, so every
/// rank, root included, ends with the result in its output.
pub struct BroadcastOp {
    channel: Arc<dyn Channel>,
}

impl BroadcastOp {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }
}

impl CollectiveOp for BroadcastOp {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn execute(
        &self,
        ctx: &CollectiveContext,
        entries: &mut [TensorTableEntry],
        _response: &Response,
    ) -> CollectiveResult<()> {
        if entries.len() != 1 {
            return Err(CollectiveError::InvalidArgument(format!(
                "broadcast takes exactly one tensor, got {}",
                entries.len()
            )));
        }
        let entry = &mut entries[0];
        let root_rank = entry.root_rank;
        if root_rank < 0 || root_rank >= ctx.size() {
            return Err(CollectiveError::InvalidArgument(format!(
                "root rank {} of tensor {} is outside a group of {}",
                root_rank,
                entry.tensor_name,
                ctx.size()
            )));
        }

        let dtype = entry.dtype();
        let num_elements = usize::try_from(entry.tensor.shape().num_elements()).map_err(|_| {
            CollectiveError::InvalidArgument(format!("negative shape for tensor {}", entry.tensor_name))
        })?;
        log::debug!(
            "Broadcast of {} ({} elements) from root {} on rank {}",
            entry.tensor_name,
            num_elements,
            root_rank,
            ctx.rank()
        );

        entry.ensure_output_like_input()?;
        let name = entry.tensor_name.clone();
        let input = entry.tensor.clone();
        let output = entry.output_mut()?;
        if ctx.rank() == root_rank {
            output.data_mut().copy_from_slice(input.data());
        }

        ctx.timeline().activity_start(&name, timeline::BROADCAST);
        let result = self
            .channel
            .broadcast(output.data_mut(), num_elements, dtype, root_rank, Communicator::Global);
        ctx.timeline().activity_end(&name);
        result
    }
}
