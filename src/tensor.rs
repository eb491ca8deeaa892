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

//! Tensor abstractions consumed by the engine
//!
//! The engine never owns tensor storage. Frameworks hand tensors in through
//! the [`Tensor`] trait and allocate outputs through [`OpContext`]. A plain
//! host implementation ([`HostTensor`], [`HostContext`]) is provided for
//! CPU frameworks and tests.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data_types::DataType;
use crate::error::{CollectiveError, CollectiveResult};

/// Device identifier. Host memory is [`CPU_DEVICE_ID`].
pub type Device = i32;

pub const CPU_DEVICE_ID: Device = -1;

/// Framework owning the tensors of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Framework {
    Tensorflow,
    Pytorch,
    Mxnet,
}

/// Shape of a tensor
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    dims: Vec<i64>,
}

impl TensorShape {
    pub fn new() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn from_dims(dims: impl Into<Vec<i64>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn add_dim(&mut self, dim: i64) {
        self.dims.push(dim);
    }

    pub fn append_shape(&mut self, other: &TensorShape) {
        self.dims.extend_from_slice(&other.dims);
    }

    /// Number of dimensions
    pub fn dims(&self) -> usize {
        self.dims.len()
    }

    pub fn dim_size(&self, idx: usize) -> i64 {
        self.dims[idx]
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.dims
    }

    /// Product of all dimensions; a rank-0 shape holds one element
    pub fn num_elements(&self) -> i64 {
        self.dims.iter().product()
    }

    /// Shape with the leading dimension removed
    pub fn slice_shape(&self) -> TensorShape {
        Self {
            dims: self.dims.iter().skip(1).copied().collect(),
        }
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

/// Read access to a framework tensor
pub trait Tensor: Send + Sync {
    fn dtype(&self) -> DataType;
    fn shape(&self) -> &TensorShape;
    fn data(&self) -> &[u8];

    /// Size of the tensor data in bytes
    fn size(&self) -> usize {
        self.data().len()
    }
}

/// Writable tensor; outputs are always of this kind
pub trait TensorMut: Tensor {
    fn data_mut(&mut self) -> &mut [u8];
}

/// Framework-side handle used to create outputs
pub trait OpContext: Send + Sync {
    fn framework(&self) -> Framework;

    /// Allocate an output tensor of the given shape. A failure must leave
    /// nothing half-allocated behind.
    fn allocate_output(&self, shape: &TensorShape, dtype: DataType)
        -> CollectiveResult<Box<dyn TensorMut>>;
}

/// Contiguous host tensor
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    dtype: DataType,
    shape: TensorShape,
    data: Vec<u8>,
}

impl HostTensor {
    /// Zero-filled tensor
    pub fn zeros(dtype: DataType, shape: TensorShape) -> Self {
        let len = shape.num_elements().max(0) as usize * dtype.element_size();
        Self {
            dtype,
            shape,
            data: vec![0; len],
        }
    }

    pub fn from_bytes(dtype: DataType, shape: TensorShape, data: Vec<u8>) -> CollectiveResult<Self> {
        let expected = shape.num_elements().max(0) as usize * dtype.element_size();
        if data.len() != expected {
            return Err(CollectiveError::InvalidArgument(format!(
                "{} bytes do not match shape {} of {}",
                data.len(),
                shape,
                dtype
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_f32(shape: TensorShape, values: &[f32]) -> CollectiveResult<Self> {
        let data = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::from_bytes(DataType::Float32, shape, data)
    }

    pub fn from_i32(shape: TensorShape, values: &[i32]) -> CollectiveResult<Self> {
        let data = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::from_bytes(DataType::Int32, shape, data)
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.data
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn to_i32_vec(&self) -> Vec<i32> {
        self.data
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

impl Tensor for HostTensor {
    fn dtype(&self) -> DataType {
        self.dtype
    }

    fn shape(&self) -> &TensorShape {
        &self.shape
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}

impl TensorMut for HostTensor {
    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Host allocator for a given framework
#[derive(Debug, Clone)]
pub struct HostContext {
    framework: Framework,
}

impl HostContext {
    pub fn new(framework: Framework) -> Self {
        Self { framework }
    }
}

impl OpContext for HostContext {
    fn framework(&self) -> Framework {
        self.framework
    }

    fn allocate_output(
        &self,
        shape: &TensorShape,
        dtype: DataType,
    ) -> CollectiveResult<Box<dyn TensorMut>> {
        if shape.as_slice().iter().any(|d| *d < 0) {
            return Err(CollectiveError::Allocation(format!(
                "negative dimension in shape {}",
                shape
            )));
        }
        Ok(Box::new(HostTensor::zeros(dtype, shape.clone())))
    }
}
