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

//! fusion-collectives: execution engine for negotiated tensor collectives
//!
//! Once a group of training processes has agreed which tensors to exchange
//! and how (a [`Response`]), this crate performs the step: fused allreduce
//! through a persistent fusion buffer, variable-length allgather, broadcast
//! from a root, or delivery of a negotiation error. Wire primitives come
//! from a [`Channel`](net::Channel) backend: an in-process group for tests
//! and single-host runs, or MPI behind the `mpi` feature.

pub mod config;
pub mod ctx;
pub mod data_types;
pub mod entry;
pub mod error;
pub mod fusion_buffer;
pub mod message;
pub mod net;
pub mod ops;
pub mod parameter_manager;
pub mod tensor;
pub mod timeline;
pub mod util;

// Re-export commonly used types
pub use crate::config::EngineConfig;
pub use crate::ctx::CollectiveContext;
pub use crate::data_types::DataType;
pub use crate::entry::TensorTableEntry;
pub use crate::error::{Code, CollectiveError, CollectiveResult, Status};
pub use crate::message::{Response, ResponseType};
pub use crate::ops::{CollectiveOp, OperationManager};
pub use crate::tensor::{HostContext, HostTensor, Tensor, TensorMut, TensorShape};

/// The main entry point and version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
