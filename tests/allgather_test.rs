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

//! Tests for the variable-length allgather and its receive layout

mod common;

use std::sync::Arc;

use fusion_collectives::config::EngineConfig;
use fusion_collectives::ctx::CollectiveContext;
use fusion_collectives::entry::TensorTableEntry;
use fusion_collectives::error::Code;
use fusion_collectives::message::{Response, ResponseType};
use fusion_collectives::net::{Channel, LocalChannel};
use fusion_collectives::ops::{AllgatherLayout, AllgatherOp, CollectiveOp, OperationManager};
use fusion_collectives::tensor::{HostTensor, TensorShape};

use common::*;

fn gather_response(names: &[&str], tensor_sizes: Vec<i64>) -> Response {
    let mut response = Response::new(ResponseType::Allgather);
    for name in names {
        response.add_tensor_name(*name);
    }
    response.set_tensor_sizes(tensor_sizes);
    response
}

// =============================================================================
// Layout
// =============================================================================

#[test]
fn test_layout_with_empty_rank() {
    let shapes = vec![TensorShape::from_dims(vec![2, 4])];
    let layout = AllgatherLayout::compute(&shapes, &[2, 0, 5], 3).unwrap();

    assert_eq!(layout.recvcounts, vec![8, 0, 20]);
    assert_eq!(layout.displacements, vec![0, 8, 8]);
    assert_eq!(layout.entry_component_sizes, vec![vec![8, 0, 20]]);
    assert_eq!(layout.output_shapes[0].as_slice(), &[7, 4]);
    assert_eq!(layout.total_size, 28);
}

#[test]
fn test_layout_invariants() {
    let shapes = vec![
        TensorShape::from_dims(vec![1, 3]),
        TensorShape::from_dims(vec![0]),
        TensorShape::from_dims(vec![2, 2, 2]),
    ];
    #[rustfmt::skip]
    let sizes = vec![
        1, 0, 4, 2,
        0, 0, 7, 1,
        2, 3, 0, 1,
    ];
    let layout = AllgatherLayout::compute(&shapes, &sizes, 4).unwrap();
    let g = layout.group_size();
    assert_eq!(g, 4);

    let components: usize = layout.entry_component_sizes.iter().flatten().sum();
    assert_eq!(layout.recvcounts.iter().sum::<usize>(), components);
    assert_eq!(layout.total_size, layout.displacements[g - 1] + layout.recvcounts[g - 1]);
    assert_eq!(layout.total_size, components);

    for rc in 0..g {
        let segment_end = layout.displacements[rc] + layout.recvcounts[rc];
        for ec in 0..shapes.len() {
            let offset = layout.entry_component_offsets[ec][rc];
            assert!(offset >= layout.displacements[rc]);
            assert!(offset + layout.entry_component_sizes[ec][rc] <= segment_end);
        }
    }

    // Entry 1 contributes nothing on rank 0, so entry 2 starts right after entry 0
    assert_eq!(layout.entry_component_sizes[1][0], 0);
    assert_eq!(
        layout.entry_component_offsets[2][0],
        layout.entry_component_offsets[0][0] + layout.entry_component_sizes[0][0]
    );

    assert_eq!(layout.output_shapes[0].as_slice(), &[7, 3]);
    assert_eq!(layout.output_shapes[1].as_slice(), &[8]);
    assert_eq!(layout.output_shapes[2].as_slice(), &[6, 2, 2]);
}

#[test]
fn test_layout_rejects_bad_tables() {
    let shapes = vec![TensorShape::from_dims(vec![2])];

    let short = AllgatherLayout::compute(&shapes, &[2, 1], 3).unwrap_err();
    assert_eq!(short.code(), Code::InvalidArgument);

    let negative = AllgatherLayout::compute(&shapes, &[2, -1, 3], 3).unwrap_err();
    assert_eq!(negative.code(), Code::InvalidArgument);
}

#[test]
fn test_layout_rejects_overflowing_tables() {
    // Gathered extent i64::MAX + i64::MAX
    let one = vec![TensorShape::from_dims(vec![1])];
    let err = AllgatherLayout::compute(&one, &[i64::MAX, i64::MAX], 2).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // Three entries of i64::MAX elements on rank 0 overflow its receive count
    let three = vec![TensorShape::from_dims(vec![1]); 3];
    let err = AllgatherLayout::compute(&three, &[i64::MAX, 0, i64::MAX, 0, i64::MAX, 0], 2).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // Each rank fits, their sum does not
    let wide = vec![TensorShape::from_dims(vec![1, 4])];
    let big = i64::MAX / 4;
    let err = AllgatherLayout::compute(&wide, &[big, big, big], 3).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

// =============================================================================
// Operation against a recording channel
// =============================================================================

#[test]
fn test_single_entry_gathers_into_output() {
    let channel = RecordingChannel::new(0, 3);
    let op = AllgatherOp::new(channel.clone());
    let ctx = CollectiveContext::new(0, 3, EngineConfig::default()).unwrap();

    let mut entries = vec![f32_entry("x", vec![2, 4], &ramp(1.0, 8))];
    op.execute(&ctx, &mut entries, &gather_response(&["x"], vec![2, 0, 5]))
        .unwrap();

    assert_eq!(
        channel.calls(),
        vec![Call::Allgatherv {
            send_len: 32,
            recv_len: 112,
            recvcounts: vec![8, 0, 20],
            displacements: vec![0, 8, 8],
        }]
    );
    assert!(ctx.fusion_buffer().is_empty());
    assert_eq!(output_shape(&entries[0]), vec![7, 4]);

    let gathered = output_f32(&entries[0]);
    assert_eq!(&gathered[..8], ramp(1.0, 8).as_slice());
    assert!(gathered[8..].iter().all(|v| *v == 0.0));
}

#[test]
fn test_allocation_failure_skips_transport() {
    let channel = RecordingChannel::new(0, 1);
    let op = AllgatherOp::new(channel.clone());
    let ctx = CollectiveContext::local();

    let tensor = HostTensor::from_f32(TensorShape::from_dims(vec![2]), &[1.0, 2.0]).unwrap();
    let mut entries = vec![
        f32_entry("ok", vec![1], &[3.0]),
        TensorTableEntry::new("fails", Arc::new(tensor), Arc::new(FailingContext)),
    ];
    let err = op
        .execute(&ctx, &mut entries, &gather_response(&["ok", "fails"], vec![1, 2]))
        .unwrap_err();

    assert_eq!(err.code(), Code::OutOfMemory);
    assert!(channel.calls().is_empty());
}

#[test]
fn test_local_contribution_must_match_table() {
    let channel = RecordingChannel::new(1, 2);
    let op = AllgatherOp::new(channel.clone());
    let ctx = CollectiveContext::new(1, 2, EngineConfig::default()).unwrap();

    // Rank 1 holds 3 rows but the table promises 1
    let mut entries = vec![f32_entry("x", vec![3], &[1.0, 2.0, 3.0])];
    let err = op
        .execute(&ctx, &mut entries, &gather_response(&["x"], vec![2, 1]))
        .unwrap_err();

    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(entries[0].output.is_none());
    assert!(channel.calls().is_empty());
}

#[test]
fn test_scalar_rejected() {
    let channel = RecordingChannel::new(0, 1);
    let op = AllgatherOp::new(channel.clone());
    let ctx = CollectiveContext::local();

    let mut entries = vec![f32_entry("s", vec![], &[4.0])];
    let err = op
        .execute(&ctx, &mut entries, &gather_response(&["s"], vec![1]))
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(channel.calls().is_empty());
}

// =============================================================================
// Three-rank group
// =============================================================================

/// Rank `r` sends `r + 1` rows of width 2 for "rows" and `{0, 2, 1}[r]`
/// values for "tail".
fn gather_rank(channel: LocalChannel) -> Vec<(Vec<i64>, Vec<f32>)> {
    let channel: Arc<dyn Channel> = Arc::new(channel);
    let rank = channel.rank();
    let ctx = CollectiveContext::for_channel(
        channel.as_ref(),
        EngineConfig::default().with_fusion_threshold_bytes(256),
    )
    .unwrap();
    let manager = OperationManager::for_channel(channel.clone());

    let rows = (rank + 1) as usize;
    let tail = [0usize, 2, 1][rank as usize];
    let mut entries = vec![
        f32_entry("rows", vec![rows as i64, 2], &ramp(rank as f32 * 100.0, rows * 2)),
        f32_entry("tail", vec![tail as i64], &ramp(rank as f32 * 1000.0, tail)),
    ];
    let response = gather_response(&["rows", "tail"], vec![1, 2, 3, 0, 2, 1]);

    let status = manager.execute_operation(&ctx, &mut entries, &response);
    assert!(status.is_ok(), "rank {}: {}", rank, status);

    entries
        .iter()
        .map(|e| (output_shape(e), output_f32(e)))
        .collect()
}

#[test]
fn test_multi_entry_gather_across_group() {
    fusion_collectives::util::logging::init_test_logging();
    let channels = LocalChannel::group(3);
    let results: Vec<Vec<(Vec<i64>, Vec<f32>)>> = std::thread::scope(|s| {
        let handles: Vec<_> = channels
            .into_iter()
            .map(|channel| s.spawn(move || gather_rank(channel)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut expected_rows = ramp(0.0, 2);
    expected_rows.extend(ramp(100.0, 4));
    expected_rows.extend(ramp(200.0, 6));
    let expected_tail = vec![1000.0, 1001.0, 2000.0];

    for (rank, outputs) in results.iter().enumerate() {
        assert_eq!(outputs[0].0, vec![6, 2], "rank {}", rank);
        assert_eq!(outputs[0].1, expected_rows, "rank {}", rank);
        assert_eq!(outputs[1].0, vec![3], "rank {}", rank);
        assert_eq!(outputs[1].1, expected_tail, "rank {}", rank);
    }
}

fn single_entry_rank(channel: LocalChannel) -> (Vec<i64>, Vec<f32>) {
    let channel: Arc<dyn Channel> = Arc::new(channel);
    let rank = channel.rank();
    let ctx = CollectiveContext::for_channel(channel.as_ref(), EngineConfig::default()).unwrap();
    let op = AllgatherOp::new(channel.clone());

    let extent = [2usize, 0, 5][rank as usize];
    let mut entries = vec![f32_entry(
        "x",
        vec![extent as i64, 4],
        &ramp(rank as f32 * 10.0, extent * 4),
    )];
    op.execute(&ctx, &mut entries, &gather_response(&["x"], vec![2, 0, 5]))
        .unwrap();
    (output_shape(&entries[0]), output_f32(&entries[0]))
}

#[test]
fn test_zero_extent_rank_across_group() {
    let channels = LocalChannel::group(3);
    let results: Vec<(Vec<i64>, Vec<f32>)> = std::thread::scope(|s| {
        let handles: Vec<_> = channels
            .into_iter()
            .map(|channel| s.spawn(move || single_entry_rank(channel)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut expected = ramp(0.0, 8);
    expected.extend(ramp(20.0, 20));
    for (shape, values) in &results {
        assert_eq!(shape, &vec![7, 4]);
        assert_eq!(values, &expected);
    }
}
