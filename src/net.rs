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

//! Transport backends
//!
//! Operations reach the wire only through the [`Channel`] trait. Two
//! backends ship with the crate: an in-process group for single-host runs
//! and tests, and MPI behind the `mpi` feature.

pub mod channel;
pub mod local;

#[cfg(feature = "mpi")]
pub mod mpi;

pub use channel::{Channel, Communicator};
pub use local::LocalChannel;
