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

//! Collective operations

pub mod allgather;
pub mod allreduce;
pub mod base_ops;
pub mod broadcast;
pub mod error_op;
pub mod hierarchical_allgather;
pub mod operation_manager;

pub use allgather::{AllgatherLayout, AllgatherOp};
pub use allreduce::AllreduceOp;
pub use base_ops::{CollectiveOp, CopyStrategies, HostMemcpy, MemcpyStrategy};
pub use broadcast::BroadcastOp;
pub use error_op::ErrorOp;
pub use hierarchical_allgather::HierarchicalAllgatherOp;
pub use operation_manager::OperationManager;
