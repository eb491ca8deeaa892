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

//! Tensor table entries
//!
//! One entry per tensor request. A batch of entries is a `&mut [TensorTableEntry]`
//! whose order fixes the fusion buffer layout on every rank.

use std::fmt;
use std::sync::Arc;

use crate::data_types::DataType;
use crate::error::{CollectiveError, CollectiveResult, Status};
use crate::tensor::{Device, Framework, OpContext, Tensor, TensorMut, TensorShape, CPU_DEVICE_ID};

/// Invoked once with the final status of the batch the entry belonged to
pub type StatusCallback = Box<dyn FnOnce(&Status) + Send>;

pub struct TensorTableEntry {
    pub tensor_name: String,
    pub tensor: Arc<dyn Tensor>,
    pub output: Option<Box<dyn TensorMut>>,
    pub context: Arc<dyn OpContext>,
    pub device: Device,
    /// Source rank, only meaningful for broadcast
    pub root_rank: i32,
    pub callback: Option<StatusCallback>,
}

impl TensorTableEntry {
    pub fn new(
        tensor_name: impl Into<String>,
        tensor: Arc<dyn Tensor>,
        context: Arc<dyn OpContext>,
    ) -> Self {
        Self {
            tensor_name: tensor_name.into(),
            tensor,
            output: None,
            context,
            device: CPU_DEVICE_ID,
            root_rank: 0,
            callback: None,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_root_rank(mut self, root_rank: i32) -> Self {
        self.root_rank = root_rank;
        self
    }

    pub fn with_output(mut self, output: Box<dyn TensorMut>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_callback(mut self, callback: impl FnOnce(&Status) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn framework(&self) -> Framework {
        self.context.framework()
    }

    pub fn dtype(&self) -> DataType {
        self.tensor.dtype()
    }

    /// Allocate the output through the framework context
    pub fn allocate_output(&mut self, shape: &TensorShape) -> CollectiveResult<()> {
        let output = self.context.allocate_output(shape, self.tensor.dtype())?;
        self.output = Some(output);
        Ok(())
    }

    /// Allocate an output shaped like the input unless the caller already
    /// supplied one of the right size.
    pub fn ensure_output_like_input(&mut self) -> CollectiveResult<()> {
        let needs_alloc = match &self.output {
            Some(out) => out.size() != self.tensor.size(),
            None => true,
        };
        if needs_alloc {
            let shape = self.tensor.shape().clone();
            self.allocate_output(&shape)?;
        }
        Ok(())
    }

    pub fn output_mut(&mut self) -> CollectiveResult<&mut dyn TensorMut> {
        match self.output.as_deref_mut() {
            Some(out) => Ok(out),
            None => Err(CollectiveError::InvalidArgument(format!(
                "tensor {} has no output allocated",
                self.tensor_name
            ))),
        }
    }

    /// Deliver the batch status to the requester
    pub fn finish(&mut self, status: &Status) {
        if let Some(callback) = self.callback.take() {
            callback(status);
        }
    }
}

impl fmt::Debug for TensorTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorTableEntry")
            .field("tensor_name", &self.tensor_name)
            .field("dtype", &self.tensor.dtype())
            .field("shape", self.tensor.shape())
            .field("device", &self.device)
            .field("root_rank", &self.root_rank)
            .field("has_output", &self.output.is_some())
            .finish()
    }
}
