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

//! Two-level allgather
//!
//! The ranks of a host share one window laid out exactly like the flat
//! receive buffer. Each rank writes its components at their final offsets,
//! local rank 0 of every host exchanges the host segments over the cross
//! communicator, and every rank then reads the whole batch back out of the
//! window. Only one process per host touches the network.

use std::sync::Arc;

use crate::ctx::CollectiveContext;
use crate::data_types::DataType;
use crate::entry::TensorTableEntry;
use crate::error::{CollectiveError, CollectiveResult};
use crate::message::Response;
use crate::net::{Channel, Communicator};
use crate::ops::allgather::{scatter_components, AllgatherLayout, AllgatherOp};
use crate::ops::base_ops::CollectiveOp;
use crate::parameter_manager::ParameterManager;
use crate::timeline;

/// Position of this rank in the host grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Topology {
    local_rank: usize,
    local_size: usize,
    cross_rank: usize,
    cross_size: usize,
}

pub struct HierarchicalAllgatherOp {
    channel: Arc<dyn Channel>,
}

impl HierarchicalAllgatherOp {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    /// Host grid of the channel. Ranks must be laid out host by host with the
    /// same number of ranks on every host.
    fn topology(&self, ctx: &CollectiveContext) -> CollectiveResult<Topology> {
        let as_index = |value: i32| usize::try_from(value).unwrap_or(0);
        let topology = Topology {
            local_rank: as_index(self.channel.rank_in(Communicator::Local)?),
            local_size: as_index(self.channel.size_in(Communicator::Local)?),
            cross_rank: as_index(self.channel.rank_in(Communicator::Cross)?),
            cross_size: as_index(self.channel.size_in(Communicator::Cross)?),
        };
        let (rank, size) = (ctx.rank() as usize, ctx.size() as usize);
        if topology.local_size * topology.cross_size != size
            || topology.cross_rank * topology.local_size + topology.local_rank != rank
        {
            return Err(CollectiveError::Precondition(format!(
                "hierarchical allgather needs ranks laid out host by host; rank {} of {} is local {} of {} on host {} of {}",
                rank,
                size,
                topology.local_rank,
                topology.local_size,
                topology.cross_rank,
                topology.cross_size
            )));
        }
        Ok(topology)
    }

    /// Exchange the host segments of the window between hosts. Runs on local
    /// rank 0 only.
    fn exchange_hosts(
        &self,
        layout: &AllgatherLayout,
        topology: &Topology,
        dtype: DataType,
        window_bytes: usize,
    ) -> CollectiveResult<()> {
        let es = dtype.element_size();
        let host_counts: Vec<usize> = layout
            .recvcounts
            .chunks(topology.local_size)
            .map(|counts| counts.iter().sum())
            .collect();
        let host_displacements: Vec<usize> = (0..topology.cross_size)
            .map(|host| layout.displacements[host * topology.local_size])
            .collect();

        let mut send = vec![0u8; host_counts[topology.cross_rank] * es];
        self.channel
            .query_shared_buffer(host_displacements[topology.cross_rank] * es, &mut send)?;
        let mut recv = vec![0u8; window_bytes];
        self.channel.allgatherv(
            &send,
            &mut recv,
            &host_counts,
            &host_displacements,
            dtype,
            Communicator::Cross,
        )?;
        self.channel.write_shared_buffer(0, &recv)
    }

    fn gather_through_window(
        &self,
        ctx: &CollectiveContext,
        entries: &mut [TensorTableEntry],
        layout: &AllgatherLayout,
        topology: &Topology,
        dtype: DataType,
        window_bytes: usize,
    ) -> CollectiveResult<()> {
        let rank = ctx.rank() as usize;
        let es = dtype.element_size();
        for (ec, e) in entries.iter().enumerate() {
            let offset = layout.entry_component_offsets[ec][rank] * es;
            self.channel.write_shared_buffer(offset, e.tensor.data())?;
        }
        self.channel.barrier(Communicator::Local)?;

        if topology.local_rank == 0 && topology.cross_size > 1 {
            self.exchange_hosts(layout, topology, dtype, window_bytes)?;
        }
        self.channel.barrier(Communicator::Local)?;

        let mut recv = vec![0u8; window_bytes];
        self.channel.query_shared_buffer(0, &mut recv)?;
        scatter_components(entries, layout, &recv, es)
    }
}

impl CollectiveOp for HierarchicalAllgatherOp {
    fn name(&self) -> &'static str {
        "hierarchical_allgather"
    }

    fn execute(
        &self,
        ctx: &CollectiveContext,
        entries: &mut [TensorTableEntry],
        response: &Response,
    ) -> CollectiveResult<()> {
        let topology = self.topology(ctx)?;
        let (layout, dtype) = AllgatherOp::prepare(ctx, entries, response)?;
        let window_bytes = layout
            .total_size
            .checked_mul(dtype.element_size())
            .ok_or_else(|| CollectiveError::InvalidArgument("allgather receive size overflows".to_string()))?;
        log::debug!(
            "Hierarchical allgather on rank {}: local {} of {}, host {} of {}, window of {} bytes",
            ctx.rank(),
            topology.local_rank,
            topology.local_size,
            topology.cross_rank,
            topology.cross_size,
            window_bytes
        );

        ctx.timeline().activity_start_all(entries, timeline::ALLGATHER);
        let result = self
            .channel
            .allocate_shared_buffer(window_bytes, Communicator::Local)
            .and_then(|_| {
                let gathered = self.gather_through_window(ctx, entries, &layout, &topology, dtype, window_bytes);
                let freed = self.channel.free_shared_buffer();
                gathered.and(freed)
            });
        ctx.timeline().activity_end_all(entries);
        result
    }

    fn enabled(&self, params: &ParameterManager, _entries: &[TensorTableEntry], _response: &Response) -> bool {
        params.hierarchical_allgather() && self.channel.size_in(Communicator::Local).is_ok()
    }
}
