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

//! MPI transport tests
//!
//! Run under an MPI launcher, e.g. `mpirun -n 3 cargo test --features mpi --test mpi_channel_test`.
//! MPI can only be initialized once per process, so everything runs in one test.

#[cfg(feature = "mpi")]
mod common;

#[cfg(feature = "mpi")]
mod mpi_tests {
    use std::sync::Arc;

    use fusion_collectives::config::EngineConfig;
    use fusion_collectives::ctx::CollectiveContext;
    use fusion_collectives::error::CollectiveResult;
    use fusion_collectives::message::{Response, ResponseType};
    use fusion_collectives::net::mpi::MpiChannel;
    use fusion_collectives::net::{Channel, Communicator};
    use fusion_collectives::ops::OperationManager;

    use crate::common::*;

    #[test]
    fn test_mpi_collectives() -> CollectiveResult<()> {
        let mpi = MpiChannel::make()?;
        let rank = mpi.rank();
        let size = mpi.size();
        let channel: Arc<dyn Channel> = mpi.clone();
        let ctx = CollectiveContext::for_channel(
            channel.as_ref(),
            EngineConfig::default().with_fusion_threshold_bytes(4096),
        )?;
        let manager = OperationManager::for_channel(channel.clone());
        println!("Rank {}/{} starting MPI collective test", rank, size);

        // Fused allreduce: sum over ranks of (rank + v)
        let mut entries = vec![
            f32_entry("a", vec![4], &ramp(rank as f32, 4)),
            f32_entry("b", vec![2], &ramp(rank as f32 + 10.0, 2)),
        ];
        let status = manager.execute_operation(&ctx, &mut entries, &Response::new(ResponseType::Allreduce));
        assert!(status.is_ok(), "{}", status);
        let base = (size * (size - 1) / 2) as f32;
        let expected: Vec<f32> = (0..4).map(|v| base + (size * v) as f32).collect();
        assert_eq!(output_f32(&entries[0]), expected);

        // Allgather: rank r sends r + 1 values
        let mut gather = Response::new(ResponseType::Allgather);
        gather.set_tensor_sizes((1..=size as i64).collect());
        let mut entries = vec![f32_entry("g", vec![rank as i64 + 1], &vec![rank as f32; rank as usize + 1])];
        let status = manager.execute_operation(&ctx, &mut entries, &gather);
        assert!(status.is_ok(), "{}", status);
        let expected: Vec<f32> = (0..size).flat_map(|r| vec![r as f32; r as usize + 1]).collect();
        assert_eq!(output_f32(&entries[0]), expected);

        // Same gather through the host-shared window
        println!(
            "Rank {}: local {} of {}, cross {} of {}",
            rank,
            channel.rank_in(Communicator::Local)?,
            channel.size_in(Communicator::Local)?,
            channel.rank_in(Communicator::Cross)?,
            channel.size_in(Communicator::Cross)?
        );
        ctx.parameter_manager().set_hierarchical_allgather(true);
        let mut entries = vec![f32_entry("g", vec![rank as i64 + 1], &vec![rank as f32; rank as usize + 1])];
        let status = manager.execute_operation(&ctx, &mut entries, &gather);
        assert!(status.is_ok(), "{}", status);
        assert_eq!(output_f32(&entries[0]), expected);
        ctx.parameter_manager().set_hierarchical_allgather(false);

        // Broadcast from the last rank
        let root = size - 1;
        let mut entries = vec![f32_entry("w", vec![3], &ramp(rank as f32 * 10.0, 3)).with_root_rank(root)];
        let status = manager.execute_operation(&ctx, &mut entries, &Response::new(ResponseType::Broadcast));
        assert!(status.is_ok(), "{}", status);
        assert_eq!(output_f32(&entries[0]), ramp(root as f32 * 10.0, 3));

        channel.barrier(Communicator::Global)?;
        mpi.finalize()?;
        println!("Rank {}: MPI collective test passed", rank);
        Ok(())
    }
}
