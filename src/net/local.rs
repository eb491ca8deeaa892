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

//! In-process transport
//!
//! A group of [`LocalChannel`]s, one per rank, each driven from its own
//! thread. Ranks exchange data through shared slots and meet at a
//! [`Barrier`] twice per collective: once after publishing, once after
//! consuming, so the next call cannot overwrite a slot still being read.
//!
//! [`LocalChannel::group_with_hosts`] splits the ranks into simulated hosts
//! so the local and cross communicators have their own slots and barriers.

use std::sync::{Arc, Barrier, Mutex, MutexGuard};

use half::f16;

use crate::data_types::DataType;
use crate::error::{CollectiveError, CollectiveResult};
use crate::net::channel::{
    check_allgatherv_layout, check_window_range, checked_byte_len, no_window, Channel, Communicator,
};

/// State shared by the ranks of one communicator
struct Group {
    size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Vec<u8>>>,
    window: Mutex<Vec<u8>>,
}

impl Group {
    fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![Vec::new(); size]),
            window: Mutex::new(Vec::new()),
        })
    }
}

/// A rank's position in one communicator
#[derive(Clone)]
struct Member {
    rank: usize,
    group: Arc<Group>,
}

impl Member {
    fn slots(&self) -> CollectiveResult<MutexGuard<'_, Vec<Vec<u8>>>> {
        self.group
            .slots
            .lock()
            .map_err(|_| CollectiveError::Transport("local group slots poisoned".to_string()))
    }

    fn window(&self) -> CollectiveResult<MutexGuard<'_, Vec<u8>>> {
        self.group
            .window
            .lock()
            .map_err(|_| CollectiveError::Transport("local shared buffer poisoned".to_string()))
    }

    fn publish(&self, data: &[u8]) -> CollectiveResult<()> {
        let mut slots = self.slots()?;
        slots[self.rank].clear();
        slots[self.rank].extend_from_slice(data);
        Ok(())
    }

    fn wait(&self) {
        self.group.barrier.wait();
    }
}

pub struct LocalChannel {
    global: Member,
    local: Member,
    cross: Member,
    // Communicator of the open shared buffer
    window: Mutex<Option<Communicator>>,
}

impl LocalChannel {
    /// Create the channels of a group of `size` ranks on one host.
    /// Channel `i` is rank `i`.
    pub fn group(size: usize) -> Vec<LocalChannel> {
        Self::build(size, size.max(1))
    }

    /// Create the channels of `size` ranks spread over hosts of
    /// `ranks_per_host` consecutive ranks each
    pub fn group_with_hosts(size: usize, ranks_per_host: usize) -> CollectiveResult<Vec<LocalChannel>> {
        if ranks_per_host == 0 || size % ranks_per_host != 0 {
            return Err(CollectiveError::InvalidArgument(format!(
                "{} ranks cannot be split into hosts of {}",
                size, ranks_per_host
            )));
        }
        Ok(Self::build(size, ranks_per_host))
    }

    fn build(size: usize, ranks_per_host: usize) -> Vec<LocalChannel> {
        let hosts = size / ranks_per_host;
        let global = Group::new(size);
        let locals: Vec<Arc<Group>> = (0..hosts).map(|_| Group::new(ranks_per_host)).collect();
        let crosses: Vec<Arc<Group>> = (0..ranks_per_host).map(|_| Group::new(hosts)).collect();

        (0..size)
            .map(|rank| {
                let (host, local_rank) = (rank / ranks_per_host, rank % ranks_per_host);
                LocalChannel {
                    global: Member {
                        rank,
                        group: global.clone(),
                    },
                    local: Member {
                        rank: local_rank,
                        group: locals[host].clone(),
                    },
                    cross: Member {
                        rank: host,
                        group: crosses[local_rank].clone(),
                    },
                    window: Mutex::new(None),
                }
            })
            .collect()
    }

    fn member(&self, communicator: Communicator) -> &Member {
        match communicator {
            Communicator::Global => &self.global,
            Communicator::Local => &self.local,
            Communicator::Cross => &self.cross,
        }
    }

    fn window_slot(&self) -> CollectiveResult<MutexGuard<'_, Option<Communicator>>> {
        self.window
            .lock()
            .map_err(|_| CollectiveError::Transport("local shared buffer state poisoned".to_string()))
    }

    /// Member of the communicator the open window belongs to
    fn window_member(&self) -> CollectiveResult<&Member> {
        let open = *self.window_slot()?;
        open.map(|communicator| self.member(communicator)).ok_or_else(no_window)
    }
}

impl Channel for LocalChannel {
    fn rank(&self) -> i32 {
        self.global.rank as i32
    }

    fn size(&self) -> i32 {
        self.global.group.size as i32
    }

    fn rank_in(&self, communicator: Communicator) -> CollectiveResult<i32> {
        Ok(self.member(communicator).rank as i32)
    }

    fn size_in(&self, communicator: Communicator) -> CollectiveResult<i32> {
        Ok(self.member(communicator).group.size as i32)
    }

    fn allreduce(
        &self,
        buffer: &mut [u8],
        num_elements: usize,
        dtype: DataType,
        communicator: Communicator,
    ) -> CollectiveResult<()> {
        let member = self.member(communicator);
        let len = checked_byte_len(buffer.len(), num_elements, dtype, "allreduce")?;
        member.publish(&buffer[..len])?;
        member.wait();

        let result = member.slots().and_then(|slots| {
            // Same rank order everywhere so every rank computes identical sums
            let mut acc = slots[0].clone();
            for contribution in slots.iter().skip(1) {
                sum_into(&mut acc, contribution, dtype)?;
            }
            buffer[..len].copy_from_slice(&acc);
            Ok(())
        });

        member.wait();
        result
    }

    fn allgatherv(
        &self,
        send: &[u8],
        recv: &mut [u8],
        recvcounts: &[usize],
        displacements: &[usize],
        dtype: DataType,
        communicator: Communicator,
    ) -> CollectiveResult<()> {
        let member = self.member(communicator);
        check_allgatherv_layout(member.group.size, recv.len(), recvcounts, displacements, dtype)?;
        let es = dtype.element_size();
        let send_len = checked_byte_len(send.len(), recvcounts[member.rank], dtype, "allgatherv send")?;
        member.publish(&send[..send_len])?;
        member.wait();

        let result = member.slots().and_then(|slots| {
            for (rank, contribution) in slots.iter().enumerate() {
                let len = recvcounts[rank] * es;
                if contribution.len() != len {
                    return Err(CollectiveError::Transport(format!(
                        "rank {} sent {} bytes, expected {}",
                        rank,
                        contribution.len(),
                        len
                    )));
                }
                let start = displacements[rank] * es;
                recv[start..start + len].copy_from_slice(contribution);
            }
            Ok(())
        });

        member.wait();
        result
    }

    fn broadcast(
        &self,
        buffer: &mut [u8],
        num_elements: usize,
        dtype: DataType,
        root_rank: i32,
        communicator: Communicator,
    ) -> CollectiveResult<()> {
        let member = self.member(communicator);
        let len = checked_byte_len(buffer.len(), num_elements, dtype, "broadcast")?;
        let root = usize::try_from(root_rank)
            .ok()
            .filter(|r| *r < member.group.size)
            .ok_or_else(|| CollectiveError::InvalidArgument(format!("invalid root rank {}", root_rank)))?;

        if member.rank == root {
            member.publish(&buffer[..len])?;
        }
        member.wait();

        let result = if member.rank == root {
            Ok(())
        } else {
            member.slots().and_then(|slots| {
                let source = &slots[root];
                if source.len() != len {
                    return Err(CollectiveError::Transport(format!(
                        "root {} broadcast {} bytes, expected {}",
                        root,
                        source.len(),
                        len
                    )));
                }
                buffer[..len].copy_from_slice(source);
                Ok(())
            })
        };

        member.wait();
        result
    }

    fn barrier(&self, communicator: Communicator) -> CollectiveResult<()> {
        self.member(communicator).wait();
        Ok(())
    }

    fn allocate_shared_buffer(&self, window_bytes: usize, communicator: Communicator) -> CollectiveResult<()> {
        let mut open = self.window_slot()?;
        if let Some(current) = *open {
            return Err(CollectiveError::Precondition(format!(
                "a shared buffer over the {} communicator is already allocated",
                current
            )));
        }

        // Rank 0 of the communicator owns the memory, as with MPI shared windows
        let member = self.member(communicator);
        if member.rank == 0 {
            let mut window = member.window()?;
            window.clear();
            window.resize(window_bytes, 0);
        }
        member.wait();
        *open = Some(communicator);
        Ok(())
    }

    fn write_shared_buffer(&self, offset: usize, data: &[u8]) -> CollectiveResult<()> {
        let member = self.window_member()?;
        let mut window = member.window()?;
        check_window_range(window.len(), offset, data.len())?;
        window[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn query_shared_buffer(&self, offset: usize, out: &mut [u8]) -> CollectiveResult<()> {
        let member = self.window_member()?;
        let window = member.window()?;
        check_window_range(window.len(), offset, out.len())?;
        out.copy_from_slice(&window[offset..offset + out.len()]);
        Ok(())
    }

    fn free_shared_buffer(&self) -> CollectiveResult<()> {
        let mut open = self.window_slot()?;
        let communicator = open.take().ok_or_else(no_window)?;
        let member = self.member(communicator);
        // Nobody may still be reading when rank 0 releases the memory
        member.wait();
        if member.rank == 0 {
            let mut window = member.window()?;
            window.clear();
            window.shrink_to_fit();
        }
        Ok(())
    }
}

macro_rules! sum_chunks {
    ($ty:ty, $width:expr, $acc:expr, $src:expr) => {
        for (a, b) in $acc.chunks_exact_mut($width).zip($src.chunks_exact($width)) {
            let mut lhs_bytes = [0u8; $width];
            let mut rhs_bytes = [0u8; $width];
            lhs_bytes.copy_from_slice(a);
            rhs_bytes.copy_from_slice(b);
            let lhs = <$ty>::from_ne_bytes(lhs_bytes);
            let rhs = <$ty>::from_ne_bytes(rhs_bytes);
            a.copy_from_slice(&(lhs + rhs).to_ne_bytes());
        }
    };
}

macro_rules! wrapping_sum_chunks {
    ($ty:ty, $width:expr, $acc:expr, $src:expr) => {
        for (a, b) in $acc.chunks_exact_mut($width).zip($src.chunks_exact($width)) {
            let mut lhs_bytes = [0u8; $width];
            let mut rhs_bytes = [0u8; $width];
            lhs_bytes.copy_from_slice(a);
            rhs_bytes.copy_from_slice(b);
            let lhs = <$ty>::from_ne_bytes(lhs_bytes);
            let rhs = <$ty>::from_ne_bytes(rhs_bytes);
            a.copy_from_slice(&lhs.wrapping_add(rhs).to_ne_bytes());
        }
    };
}

/// Element-wise `acc += src` for values of `dtype`
fn sum_into(acc: &mut [u8], src: &[u8], dtype: DataType) -> CollectiveResult<()> {
    if acc.len() != src.len() {
        return Err(CollectiveError::Transport(format!(
            "allreduce contributions differ in length: {} vs {}",
            acc.len(),
            src.len()
        )));
    }
    match dtype {
        DataType::UInt8 => wrapping_sum_chunks!(u8, 1, acc, src),
        DataType::Int8 => wrapping_sum_chunks!(i8, 1, acc, src),
        DataType::UInt16 => wrapping_sum_chunks!(u16, 2, acc, src),
        DataType::Int16 => wrapping_sum_chunks!(i16, 2, acc, src),
        DataType::Int32 => wrapping_sum_chunks!(i32, 4, acc, src),
        DataType::Int64 => wrapping_sum_chunks!(i64, 8, acc, src),
        DataType::Float16 => sum_chunks!(f16, 2, acc, src),
        DataType::Float32 => sum_chunks!(f32, 4, acc, src),
        DataType::Float64 => sum_chunks!(f64, 8, acc, src),
        DataType::Bool => {
            for (a, b) in acc.iter_mut().zip(src) {
                *a = u8::from(*a != 0 || *b != 0);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_into_half_precision() {
        let mut acc: Vec<u8> = [f16::from_f32(1.5), f16::from_f32(-2.0)]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        let src: Vec<u8> = [f16::from_f32(0.5), f16::from_f32(4.0)]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        sum_into(&mut acc, &src, DataType::Float16).unwrap();
        let out: Vec<f32> = acc
            .chunks_exact(2)
            .map(|c| f16::from_ne_bytes([c[0], c[1]]).to_f32())
            .collect();
        assert_eq!(out, vec![2.0, 2.0]);
    }

    #[test]
    fn sum_into_bool_is_logical_or() {
        let mut acc = vec![0u8, 1, 0];
        sum_into(&mut acc, &[0, 0, 1], DataType::Bool).unwrap();
        assert_eq!(acc, vec![0, 1, 1]);
    }

    #[test]
    fn sum_into_rejects_length_mismatch() {
        let mut acc = vec![0u8; 8];
        assert!(sum_into(&mut acc, &[0u8; 4], DataType::Float32).is_err());
    }
}
