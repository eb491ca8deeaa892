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

use crate::ctx::CollectiveContext;
use crate::entry::TensorTableEntry;
use crate::error::{CollectiveError, CollectiveResult};
use crate::message::Response;
use crate::ops::base_ops::CollectiveOp;

/// Surfaces a negotiation failure for one tensor. Touches neither the
/// channel nor any buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorOp;

impl ErrorOp {
    pub fn new() -> Self {
        Self
    }
}

impl CollectiveOp for ErrorOp {
    fn name(&self) -> &'static str {
        "error"
    }

    fn execute(
        &self,
        _ctx: &CollectiveContext,
        entries: &mut [TensorTableEntry],
        response: &Response,
    ) -> CollectiveResult<()> {
        if entries.len() != 1 {
            return Err(CollectiveError::InvalidArgument(format!(
                "an error response covers exactly one tensor, got {}",
                entries.len()
            )));
        }
        log::debug!(
            "Failing tensor {}: {}",
            entries[0].tensor_name,
            response.error_message()
        );
        Err(CollectiveError::Precondition(response.error_message().to_string()))
    }
}
