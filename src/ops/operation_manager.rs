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

//! Dispatch of negotiated responses to operations

use std::sync::Arc;

use crate::ctx::CollectiveContext;
use crate::entry::TensorTableEntry;
use crate::error::Status;
use crate::message::{Response, ResponseType};
use crate::net::Channel;
use crate::ops::allgather::AllgatherOp;
use crate::ops::allreduce::AllreduceOp;
use crate::ops::base_ops::CollectiveOp;
use crate::ops::broadcast::BroadcastOp;
use crate::ops::error_op::ErrorOp;
use crate::ops::hierarchical_allgather::HierarchicalAllgatherOp;

/// Ordered candidate operations per response type.
///
/// For each batch the first operation whose `enabled` accepts it runs, so
/// more specialized implementations go first in each list.
pub struct OperationManager {
    allreduce_ops: Vec<Box<dyn CollectiveOp>>,
    allgather_ops: Vec<Box<dyn CollectiveOp>>,
    broadcast_ops: Vec<Box<dyn CollectiveOp>>,
    error_op: ErrorOp,
}

impl OperationManager {
    pub fn new(
        allreduce_ops: Vec<Box<dyn CollectiveOp>>,
        allgather_ops: Vec<Box<dyn CollectiveOp>>,
        broadcast_ops: Vec<Box<dyn CollectiveOp>>,
    ) -> Self {
        Self {
            allreduce_ops,
            allgather_ops,
            broadcast_ops,
            error_op: ErrorOp::new(),
        }
    }

    /// Default operation set over a single channel. The hierarchical
    /// allgather runs when the parameter manager asks for it, the flat one
    /// otherwise.
    pub fn for_channel(channel: Arc<dyn Channel>) -> Self {
        Self::new(
            vec![Box::new(AllreduceOp::new(channel.clone()))],
            vec![
                Box::new(HierarchicalAllgatherOp::new(channel.clone())),
                Box::new(AllgatherOp::new(channel.clone())),
            ],
            vec![Box::new(BroadcastOp::new(channel))],
        )
    }

    fn candidates(&self, response_type: ResponseType) -> &[Box<dyn CollectiveOp>] {
        match response_type {
            ResponseType::Allreduce => &self.allreduce_ops,
            ResponseType::Allgather => &self.allgather_ops,
            ResponseType::Broadcast => &self.broadcast_ops,
            ResponseType::Error => &[],
        }
    }

    /// Run the batch described by `response` and return its status
    pub fn execute_operation(
        &self,
        ctx: &CollectiveContext,
        entries: &mut [TensorTableEntry],
        response: &Response,
    ) -> Status {
        if entries.is_empty() {
            return Status::invalid_argument(format!("empty {} batch", response.response_type()));
        }
        if response.has_error() || response.response_type() == ResponseType::Error {
            return self.error_op.execute(ctx, entries, response).into();
        }

        let response_type = response.response_type();
        let op = self
            .candidates(response_type)
            .iter()
            .find(|op| op.enabled(ctx.parameter_manager(), entries, response));

        match op {
            Some(op) => {
                log::debug!("Executing {} over {} tensors", op.name(), entries.len());
                match op.execute(ctx, entries, response) {
                    Ok(()) => Status::ok(),
                    Err(e) => {
                        log::warn!("{} failed on rank {}: {}", op.name(), ctx.rank(), e);
                        e.into()
                    }
                }
            }
            None => {
                log::error!("No enabled {} operation for {} tensors", response_type, entries.len());
                Status::precondition_error(format!(
                    "No enabled {} operation for {} tensors",
                    response_type,
                    entries.len()
                ))
            }
        }
    }

    /// Execute the batch, then hand every entry's callback the batch status
    pub fn perform_operation(
        &self,
        ctx: &CollectiveContext,
        entries: &mut [TensorTableEntry],
        response: &Response,
    ) -> Status {
        let status = self.execute_operation(ctx, entries, response);
        for e in entries.iter_mut() {
            e.finish(&status);
        }
        status
    }
}
