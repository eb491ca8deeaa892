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

//! Channel trait implemented by every transport backend

use std::fmt;

use crate::data_types::DataType;
use crate::error::{CollectiveError, CollectiveResult};

/// Process group a primitive runs over.
///
/// `Local` holds the ranks sharing a host, `Cross` the ranks with the same
/// local rank on every host. Ranks are laid out host by host, so global rank
/// `r` is `cross_rank * local_size + local_rank`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Communicator {
    Global,
    Local,
    Cross,
}

impl fmt::Display for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Communicator::Global => write!(f, "global"),
            Communicator::Local => write!(f, "local"),
            Communicator::Cross => write!(f, "cross"),
        }
    }
}

/// Wire-level collective primitives.
///
/// Every call is synchronous: it returns once the step has completed
/// across the whole communicator. Counts and displacements are in elements
/// of `dtype`, buffers are raw bytes.
pub trait Channel: Send + Sync {
    /// Rank in the global communicator
    fn rank(&self) -> i32;

    /// Size of the global communicator
    fn size(&self) -> i32;

    fn rank_in(&self, communicator: Communicator) -> CollectiveResult<i32> {
        match communicator {
            Communicator::Global => Ok(self.rank()),
            other => Err(unsupported(other)),
        }
    }

    fn size_in(&self, communicator: Communicator) -> CollectiveResult<i32> {
        match communicator {
            Communicator::Global => Ok(self.size()),
            other => Err(unsupported(other)),
        }
    }

    /// Sum-reduce `num_elements` values in place across all ranks
    fn allreduce(
        &self,
        buffer: &mut [u8],
        num_elements: usize,
        dtype: DataType,
        communicator: Communicator,
    ) -> CollectiveResult<()>;

    /// Variable-length allgather.
    ///
    /// Rank `r` contributes `recvcounts[r]` elements which land in `recv`
    /// starting at element `displacements[r]`.
    fn allgatherv(
        &self,
        send: &[u8],
        recv: &mut [u8],
        recvcounts: &[usize],
        displacements: &[usize],
        dtype: DataType,
        communicator: Communicator,
    ) -> CollectiveResult<()>;

    /// Broadcast `num_elements` values from `root_rank` into `buffer` on every rank
    fn broadcast(
        &self,
        buffer: &mut [u8],
        num_elements: usize,
        dtype: DataType,
        root_rank: i32,
        communicator: Communicator,
    ) -> CollectiveResult<()>;

    fn barrier(&self, communicator: Communicator) -> CollectiveResult<()>;

    /// Collectively allocate a window of `window_bytes` shared by the ranks
    /// of `communicator`. At most one window is open per channel.
    fn allocate_shared_buffer(&self, _window_bytes: usize, communicator: Communicator) -> CollectiveResult<()> {
        Err(CollectiveError::NotImplemented(format!(
            "shared buffers over the {} communicator",
            communicator
        )))
    }

    /// Copy `data` into the open window at byte `offset`
    fn write_shared_buffer(&self, _offset: usize, _data: &[u8]) -> CollectiveResult<()> {
        Err(no_window())
    }

    /// Copy `out.len()` bytes of the open window, from byte `offset`, into `out`
    fn query_shared_buffer(&self, _offset: usize, _out: &mut [u8]) -> CollectiveResult<()> {
        Err(no_window())
    }

    /// Collectively release the open window
    fn free_shared_buffer(&self) -> CollectiveResult<()> {
        Err(no_window())
    }
}

fn unsupported(communicator: Communicator) -> CollectiveError {
    CollectiveError::NotImplemented(format!("{} communicator", communicator))
}

pub(crate) fn no_window() -> CollectiveError {
    CollectiveError::Precondition("no shared buffer is allocated".to_string())
}

/// Fail unless `offset..offset + len` lies inside a window of `window_len` bytes
pub fn check_window_range(window_len: usize, offset: usize, len: usize) -> CollectiveResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= window_len => Ok(()),
        _ => Err(CollectiveError::InvalidArgument(format!(
            "shared buffer range {}+{} is outside a window of {} bytes",
            offset, len, window_len
        ))),
    }
}

/// Fail unless `buffer` holds at least `num_elements` values of `dtype`.
/// Returns the byte length those elements occupy.
pub fn checked_byte_len(
    buffer_len: usize,
    num_elements: usize,
    dtype: DataType,
    what: &str,
) -> CollectiveResult<usize> {
    let bytes = num_elements
        .checked_mul(dtype.element_size())
        .ok_or_else(|| CollectiveError::InvalidArgument(format!("{} element count overflows", what)))?;
    if bytes > buffer_len {
        return Err(CollectiveError::InvalidArgument(format!(
            "{} needs {} bytes but the buffer holds {}",
            what, bytes, buffer_len
        )));
    }
    Ok(bytes)
}

/// Validate an allgatherv layout against the group size and receive buffer
pub fn check_allgatherv_layout(
    size: usize,
    recv_len: usize,
    recvcounts: &[usize],
    displacements: &[usize],
    dtype: DataType,
) -> CollectiveResult<()> {
    if recvcounts.len() != size || displacements.len() != size {
        return Err(CollectiveError::InvalidArgument(format!(
            "allgatherv expects {} counts and displacements, got {} and {}",
            size,
            recvcounts.len(),
            displacements.len()
        )));
    }
    for (rank, (count, displ)) in recvcounts.iter().zip(displacements).enumerate() {
        let end = displ
            .checked_add(*count)
            .ok_or_else(|| CollectiveError::InvalidArgument("allgatherv layout overflows".to_string()))?;
        checked_byte_len(recv_len, end, dtype, &format!("allgatherv segment of rank {}", rank))?;
    }
    Ok(())
}
