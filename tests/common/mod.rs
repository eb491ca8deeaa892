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

//! Shared helpers for the integration tests: recording mocks and tensor builders

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use fusion_collectives::data_types::DataType;
use fusion_collectives::entry::TensorTableEntry;
use fusion_collectives::error::{CollectiveError, CollectiveResult};
use fusion_collectives::net::{Channel, Communicator};
use fusion_collectives::ops::{HostMemcpy, MemcpyStrategy};
use fusion_collectives::tensor::{
    Framework, HostContext, HostTensor, OpContext, Tensor, TensorMut, TensorShape,
};

/// A wire call observed by [`RecordingChannel`]
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Allreduce {
        len: usize,
        num_elements: usize,
        dtype: DataType,
    },
    Allgatherv {
        send_len: usize,
        recv_len: usize,
        recvcounts: Vec<usize>,
        displacements: Vec<usize>,
    },
    Broadcast {
        len: usize,
        num_elements: usize,
        root_rank: i32,
    },
    Barrier,
}

/// Channel that records every call and behaves as if the other ranks sent
/// zeros: allreduce leaves the buffer unchanged, allgatherv places only the
/// local contribution.
pub struct RecordingChannel {
    rank: i32,
    size: i32,
    calls: Mutex<Vec<Call>>,
}

impl RecordingChannel {
    pub fn new(rank: i32, size: i32) -> Arc<Self> {
        Arc::new(Self {
            rank,
            size,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Channel for RecordingChannel {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.size
    }

    fn allreduce(
        &self,
        buffer: &mut [u8],
        num_elements: usize,
        dtype: DataType,
        _communicator: Communicator,
    ) -> CollectiveResult<()> {
        self.record(Call::Allreduce {
            len: buffer.len(),
            num_elements,
            dtype,
        });
        Ok(())
    }

    fn allgatherv(
        &self,
        send: &[u8],
        recv: &mut [u8],
        recvcounts: &[usize],
        displacements: &[usize],
        dtype: DataType,
        _communicator: Communicator,
    ) -> CollectiveResult<()> {
        self.record(Call::Allgatherv {
            send_len: send.len(),
            recv_len: recv.len(),
            recvcounts: recvcounts.to_vec(),
            displacements: displacements.to_vec(),
        });
        let es = dtype.element_size();
        let start = displacements[self.rank as usize] * es;
        recv[start..start + send.len()].copy_from_slice(send);
        Ok(())
    }

    fn broadcast(
        &self,
        buffer: &mut [u8],
        num_elements: usize,
        _dtype: DataType,
        root_rank: i32,
        _communicator: Communicator,
    ) -> CollectiveResult<()> {
        self.record(Call::Broadcast {
            len: buffer.len(),
            num_elements,
            root_rank,
        });
        Ok(())
    }

    fn barrier(&self, _communicator: Communicator) -> CollectiveResult<()> {
        self.record(Call::Barrier);
        Ok(())
    }
}

/// Channel whose every wire call fails with the same transport error
pub struct FailingChannel {
    rank: i32,
    size: i32,
    message: String,
}

impl FailingChannel {
    pub fn new(rank: i32, size: i32, message: &str) -> Arc<Self> {
        Arc::new(Self {
            rank,
            size,
            message: message.to_string(),
        })
    }

    fn fail(&self) -> CollectiveResult<()> {
        Err(CollectiveError::Transport(self.message.clone()))
    }
}

impl Channel for FailingChannel {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.size
    }

    fn allreduce(&self, _: &mut [u8], _: usize, _: DataType, _: Communicator) -> CollectiveResult<()> {
        self.fail()
    }

    fn allgatherv(
        &self,
        _: &[u8],
        _: &mut [u8],
        _: &[usize],
        _: &[usize],
        _: DataType,
        _: Communicator,
    ) -> CollectiveResult<()> {
        self.fail()
    }

    fn broadcast(&self, _: &mut [u8], _: usize, _: DataType, _: i32, _: Communicator) -> CollectiveResult<()> {
        self.fail()
    }

    fn barrier(&self, _: Communicator) -> CollectiveResult<()> {
        self.fail()
    }
}

/// A copy observed by [`RecordingCopier`]
#[derive(Debug, Clone, PartialEq)]
pub struct CopyRecord {
    pub tensor_name: String,
    pub inbound: bool,
    pub address: usize,
    pub len: usize,
}

/// Host copies that remember the slot each entry was copied through
#[derive(Default)]
pub struct RecordingCopier {
    copies: Mutex<Vec<CopyRecord>>,
}

impl RecordingCopier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn copies(&self) -> Vec<CopyRecord> {
        self.copies.lock().unwrap().clone()
    }

    /// Offsets of the inbound copies relative to the first one
    pub fn inbound_offsets(&self) -> Vec<usize> {
        let inbound: Vec<CopyRecord> = self.copies().into_iter().filter(|c| c.inbound).collect();
        let base = inbound.first().map(|c| c.address).unwrap_or(0);
        inbound.iter().map(|c| c.address - base).collect()
    }
}

impl MemcpyStrategy for RecordingCopier {
    fn memcpy_entry_in(&self, buffer_at_offset: &mut [u8], entry: &TensorTableEntry) -> CollectiveResult<()> {
        self.copies.lock().unwrap().push(CopyRecord {
            tensor_name: entry.tensor_name.clone(),
            inbound: true,
            address: buffer_at_offset.as_ptr() as usize,
            len: buffer_at_offset.len(),
        });
        HostMemcpy.memcpy_entry_in(buffer_at_offset, entry)
    }

    fn memcpy_entry_out(&self, buffer_at_offset: &[u8], entry: &mut TensorTableEntry) -> CollectiveResult<()> {
        self.copies.lock().unwrap().push(CopyRecord {
            tensor_name: entry.tensor_name.clone(),
            inbound: false,
            address: buffer_at_offset.as_ptr() as usize,
            len: buffer_at_offset.len(),
        });
        HostMemcpy.memcpy_entry_out(buffer_at_offset, entry)
    }
}

/// Framework context whose allocations always fail
pub struct FailingContext;

impl OpContext for FailingContext {
    fn framework(&self) -> Framework {
        Framework::Pytorch
    }

    fn allocate_output(&self, shape: &TensorShape, _dtype: DataType) -> CollectiveResult<Box<dyn TensorMut>> {
        Err(CollectiveError::Allocation(format!("no memory for {}", shape)))
    }
}

pub fn host_context() -> Arc<dyn OpContext> {
    Arc::new(HostContext::new(Framework::Pytorch))
}

pub fn f32_entry(name: &str, dims: Vec<i64>, values: &[f32]) -> TensorTableEntry {
    let tensor = HostTensor::from_f32(TensorShape::from_dims(dims), values).unwrap();
    TensorTableEntry::new(name, Arc::new(tensor), host_context())
}

/// `count` consecutive values starting at `start`
pub fn ramp(start: f32, count: usize) -> Vec<f32> {
    (0..count).map(|i| start + i as f32).collect()
}

pub fn output_f32(entry: &TensorTableEntry) -> Vec<f32> {
    let out = entry.output.as_ref().expect("output allocated");
    out.data()
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn output_shape(entry: &TensorTableEntry) -> Vec<i64> {
    let out = entry.output.as_ref().expect("output allocated");
    out.shape().as_slice().to_vec()
}
