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

//! Variable-length allgather
//!
//! Every rank contributes a different leading extent for each tensor of the
//! batch. The negotiated response carries those extents as a flat table
//! `tensor_sizes[entry * group_size + rank]`, from which every rank derives
//! the same receive layout:
//!
//! ```text
//! recv buffer:  | rank 0                  | rank 1                  | ...
//!               | e0 comp | e1 comp | ... | e0 comp | e1 comp | ... |
//!               ^ displacement[0]         ^ displacement[1]
//! ```
//!
//! Each rank's segment holds its components in batch order. After the wire
//! call the components of entry `e` are scattered into that entry's output,
//! rank after rank.

use std::sync::Arc;

use crate::ctx::CollectiveContext;
use crate::data_types::DataType;
use crate::entry::TensorTableEntry;
use crate::error::{CollectiveError, CollectiveResult};
use crate::fusion_buffer::lock_buffer;
use crate::message::Response;
use crate::net::{Channel, Communicator};
use crate::ops::base_ops::{check_uniform_dtype, CollectiveOp};
use crate::tensor::TensorShape;
use crate::timeline;

/// Receive layout of one allgather batch. Counts, displacements and offsets
/// are in elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllgatherLayout {
    /// Elements contributed by each rank, all entries together
    pub recvcounts: Vec<usize>,
    /// Start of each rank's segment in the receive buffer
    pub displacements: Vec<usize>,
    /// `[entry][rank]` component sizes
    pub entry_component_sizes: Vec<Vec<usize>>,
    /// `[entry][rank]` component starts in the receive buffer
    pub entry_component_offsets: Vec<Vec<usize>>,
    /// Gathered output shape of each entry
    pub output_shapes: Vec<TensorShape>,
    pub total_size: usize,
}

fn overflow(what: String) -> CollectiveError {
    CollectiveError::InvalidArgument(format!("{} overflows in the size table", what))
}

impl AllgatherLayout {
    pub fn compute(shapes: &[TensorShape], tensor_sizes: &[i64], group_size: usize) -> CollectiveResult<Self> {
        if shapes.is_empty() {
            return Err(CollectiveError::InvalidArgument("empty allgather batch".to_string()));
        }
        if group_size == 0 {
            return Err(CollectiveError::InvalidArgument("allgather over an empty group".to_string()));
        }
        let expected = shapes.len() * group_size;
        if tensor_sizes.len() != expected {
            return Err(CollectiveError::InvalidArgument(format!(
                "size table has {} entries, expected {} ({} tensors x {} ranks)",
                tensor_sizes.len(),
                expected,
                shapes.len(),
                group_size
            )));
        }

        let mut recvcounts = vec![0usize; group_size];
        let mut entry_component_sizes = Vec::with_capacity(shapes.len());
        let mut output_shapes = Vec::with_capacity(shapes.len());

        for (ec, shape) in shapes.iter().enumerate() {
            if shape.dims() == 0 {
                return Err(CollectiveError::InvalidArgument(format!(
                    "tensor {} is a scalar; allgather needs a leading dimension",
                    ec
                )));
            }
            let slice_shape = shape.slice_shape();
            let slice_elements = usize::try_from(slice_shape.num_elements()).map_err(|_| {
                CollectiveError::InvalidArgument(format!("negative dimension in shape {}", shape))
            })?;

            let mut sizes = Vec::with_capacity(group_size);
            let mut total_entry_dim = 0i64;
            for rc in 0..group_size {
                let extent = tensor_sizes[ec * group_size + rc];
                if extent < 0 {
                    return Err(CollectiveError::InvalidArgument(format!(
                        "negative extent {} for tensor {} on rank {}",
                        extent, ec, rc
                    )));
                }
                let component = (extent as usize)
                    .checked_mul(slice_elements)
                    .ok_or_else(|| overflow(format!("component of tensor {} on rank {}", ec, rc)))?;
                recvcounts[rc] = recvcounts[rc]
                    .checked_add(component)
                    .ok_or_else(|| overflow(format!("receive count of rank {}", rc)))?;
                sizes.push(component);
                total_entry_dim = total_entry_dim
                    .checked_add(extent)
                    .ok_or_else(|| overflow(format!("gathered extent of tensor {}", ec)))?;
            }

            let mut output_shape = TensorShape::new();
            output_shape.add_dim(total_entry_dim);
            output_shape.append_shape(&slice_shape);
            output_shapes.push(output_shape);
            entry_component_sizes.push(sizes);
        }

        let mut displacements = vec![0usize; group_size];
        for rc in 1..group_size {
            displacements[rc] = displacements[rc - 1]
                .checked_add(recvcounts[rc - 1])
                .ok_or_else(|| overflow(format!("displacement of rank {}", rc)))?;
        }

        let mut entry_component_offsets: Vec<Vec<usize>> = Vec::with_capacity(shapes.len());
        for ec in 0..shapes.len() {
            let offsets = match entry_component_offsets.last() {
                None => displacements.clone(),
                Some(prev) => prev
                    .iter()
                    .zip(&entry_component_sizes[ec - 1])
                    .map(|(offset, size)| offset + size)
                    .collect(),
            };
            entry_component_offsets.push(offsets);
        }

        let total_size = displacements[group_size - 1]
            .checked_add(recvcounts[group_size - 1])
            .ok_or_else(|| overflow("total receive size".to_string()))?;

        Ok(Self {
            recvcounts,
            displacements,
            entry_component_sizes,
            entry_component_offsets,
            output_shapes,
            total_size,
        })
    }

    pub fn group_size(&self) -> usize {
        self.recvcounts.len()
    }
}

pub struct AllgatherOp {
    channel: Arc<dyn Channel>,
}

impl AllgatherOp {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    /// Derive the layout, check the local contribution and allocate every
    /// output. Nothing touches the wire before this succeeds.
    pub(crate) fn prepare(
        ctx: &CollectiveContext,
        entries: &mut [TensorTableEntry],
        response: &Response,
    ) -> CollectiveResult<(AllgatherLayout, DataType)> {
        check_uniform_dtype(entries)?;
        let dtype = entries[0].dtype();
        let group_size = ctx.size() as usize;
        let rank = ctx.rank() as usize;

        let shapes: Vec<TensorShape> = entries.iter().map(|e| e.tensor.shape().clone()).collect();
        let layout = AllgatherLayout::compute(&shapes, response.tensor_sizes(), group_size)?;
        log::debug!(
            "Allgather of {} tensors, {} elements on rank {}",
            entries.len(),
            layout.total_size,
            rank
        );
        log::trace!(
            "Allgather layout recvcounts {:?} displacements {:?}",
            layout.recvcounts,
            layout.displacements
        );
        Self::check_local_contribution(entries, &layout, rank)?;
        Self::allocate_outputs(ctx, entries, &layout)?;
        Ok((layout, dtype))
    }

    /// The local input of every entry must be exactly what the table
    /// promises the other ranks.
    fn check_local_contribution(
        entries: &[TensorTableEntry],
        layout: &AllgatherLayout,
        rank: usize,
    ) -> CollectiveResult<()> {
        for (e, sizes) in entries.iter().zip(&layout.entry_component_sizes) {
            let local = e.tensor.shape().num_elements();
            if usize::try_from(local).ok() != Some(sizes[rank]) {
                return Err(CollectiveError::InvalidArgument(format!(
                    "tensor {} has {} elements but rank {} is expected to send {}",
                    e.tensor_name, local, rank, sizes[rank]
                )));
            }
        }
        Ok(())
    }

    fn allocate_outputs(
        ctx: &CollectiveContext,
        entries: &mut [TensorTableEntry],
        layout: &AllgatherLayout,
    ) -> CollectiveResult<()> {
        ctx.timeline().activity_start_all(entries, timeline::ALLOCATE_OUTPUT);
        let allocated = entries
            .iter_mut()
            .zip(&layout.output_shapes)
            .try_for_each(|(e, shape)| {
                e.allocate_output(shape).map_err(|err| {
                    log::warn!("Failed to allocate allgather output {} {}: {}", e.tensor_name, shape, err);
                    err
                })
            });
        ctx.timeline().activity_end_all(entries);
        allocated
    }

    fn gather_single(
        &self,
        entry: &mut TensorTableEntry,
        layout: &AllgatherLayout,
        dtype: DataType,
    ) -> CollectiveResult<()> {
        let input = entry.tensor.clone();
        let output = entry.output_mut()?;
        self.channel.allgatherv(
            input.data(),
            output.data_mut(),
            &layout.recvcounts,
            &layout.displacements,
            dtype,
            Communicator::Global,
        )
    }

    fn gather_fused(
        &self,
        ctx: &CollectiveContext,
        entries: &mut [TensorTableEntry],
        layout: &AllgatherLayout,
        dtype: DataType,
    ) -> CollectiveResult<()> {
        let es = dtype.element_size();
        let (device, framework) = (entries[0].device, entries[0].framework());
        let send_len: usize = entries.iter().map(|e| e.tensor.size()).sum();
        let threshold = ctx.parameter_manager().tensor_fusion_threshold_bytes();
        ctx.fusion_buffer()
            .initialize_buffer(threshold.max(send_len), device, framework)?;
        let shared = ctx.fusion_buffer().get_buffer(device, framework)?;

        // Every rank receives the whole batch; a per-call region keeps the
        // shared fusion buffer out of the receive path.
        let mut recv = vec![0u8; layout.total_size * es];
        {
            let mut guard = lock_buffer(&shared)?;
            let buffer = guard.access_data_mut();
            if send_len > buffer.len() {
                return Err(CollectiveError::Capacity(format!(
                    "allgather send of {} bytes exceeds the fusion buffer of {} bytes",
                    send_len,
                    buffer.len()
                )));
            }
            let mut offset = 0;
            for e in entries.iter() {
                let data = e.tensor.data();
                buffer[offset..offset + data.len()].copy_from_slice(data);
                offset += data.len();
            }
            self.channel.allgatherv(
                &buffer[..send_len],
                &mut recv,
                &layout.recvcounts,
                &layout.displacements,
                dtype,
                Communicator::Global,
            )?;
        }

        scatter_components(entries, layout, &recv, es)
    }
}

/// Copy every entry's components out of a receive region laid out by
/// `layout`, rank after rank
pub(crate) fn scatter_components(
    entries: &mut [TensorTableEntry],
    layout: &AllgatherLayout,
    recv: &[u8],
    es: usize,
) -> CollectiveResult<()> {
    for (ec, e) in entries.iter_mut().enumerate() {
        let name = e.tensor_name.clone();
        let out = e.output_mut()?.data_mut();
        let expected: usize = layout.entry_component_sizes[ec].iter().sum::<usize>() * es;
        if out.len() != expected {
            return Err(CollectiveError::InvalidArgument(format!(
                "output of tensor {} holds {} bytes, expected {}",
                name,
                out.len(),
                expected
            )));
        }
        let mut pos = 0;
        for (size, offset) in layout.entry_component_sizes[ec]
            .iter()
            .zip(&layout.entry_component_offsets[ec])
        {
            let (len, src) = (size * es, offset * es);
            out[pos..pos + len].copy_from_slice(&recv[src..src + len]);
            pos += len;
        }
    }
    Ok(())
}

impl CollectiveOp for AllgatherOp {
    fn name(&self) -> &'static str {
        "allgather"
    }

    fn execute(
        &self,
        ctx: &CollectiveContext,
        entries: &mut [TensorTableEntry],
        response: &Response,
    ) -> CollectiveResult<()> {
        let (layout, dtype) = Self::prepare(ctx, entries, response)?;

        ctx.timeline().activity_start_all(entries, timeline::ALLGATHER);
        let result = if entries.len() == 1 {
            self.gather_single(&mut entries[0], &layout, dtype)
        } else {
            self.gather_fused(ctx, entries, &layout, dtype)
        };
        ctx.timeline().activity_end_all(entries);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_advance_by_previous_entry() {
        let shapes = vec![TensorShape::from_dims(vec![1, 2]), TensorShape::from_dims(vec![3])];
        // entry 0: extents 1, 2 (slice 2); entry 1: extents 3, 1 (slice 1)
        let layout = AllgatherLayout::compute(&shapes, &[1, 2, 3, 1], 2).unwrap();
        assert_eq!(layout.recvcounts, vec![5, 5]);
        assert_eq!(layout.displacements, vec![0, 5]);
        assert_eq!(layout.entry_component_offsets, vec![vec![0, 5], vec![2, 9]]);
        assert_eq!(layout.output_shapes[0].as_slice(), &[3, 2]);
        assert_eq!(layout.output_shapes[1].as_slice(), &[4]);
        assert_eq!(layout.total_size, 10);
    }

    #[test]
    fn rejects_scalars() {
        let shapes = vec![TensorShape::new()];
        assert!(AllgatherLayout::compute(&shapes, &[1, 1], 2).is_err());
    }
}
