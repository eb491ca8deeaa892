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

//! Negotiated responses
//!
//! A [`Response`] is produced by the negotiation layer and is identical on
//! every rank for a given step. The engine only reads it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CollectiveResult;
use crate::tensor::Device;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseType {
    Allreduce,
    Allgather,
    Broadcast,
    Error,
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseType::Allreduce => write!(f, "ALLREDUCE"),
            ResponseType::Allgather => write!(f, "ALLGATHER"),
            ResponseType::Broadcast => write!(f, "BROADCAST"),
            ResponseType::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    response_type: ResponseType,
    tensor_names: Vec<String>,
    #[serde(default)]
    error_message: String,
    #[serde(default)]
    devices: Vec<Device>,
    /// Allgather only: leading dimension of entry `e` on rank `r` at
    /// `e * group_size + r`.
    #[serde(default)]
    tensor_sizes: Vec<i64>,
}

impl Response {
    pub fn new(response_type: ResponseType) -> Self {
        Self {
            response_type,
            tensor_names: Vec::new(),
            error_message: String::new(),
            devices: Vec::new(),
            tensor_sizes: Vec::new(),
        }
    }

    /// Error response carrying the message every rank will surface
    pub fn error(tensor_name: impl Into<String>, message: impl Into<String>) -> Self {
        let mut response = Self::new(ResponseType::Error);
        response.add_tensor_name(tensor_name);
        response.set_error_message(message);
        response
    }

    pub fn response_type(&self) -> ResponseType {
        self.response_type
    }

    pub fn set_response_type(&mut self, response_type: ResponseType) {
        self.response_type = response_type;
    }

    pub fn tensor_names(&self) -> &[String] {
        &self.tensor_names
    }

    pub fn add_tensor_name(&mut self, name: impl Into<String>) {
        self.tensor_names.push(name.into());
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn set_error_message(&mut self, message: impl Into<String>) {
        self.error_message = message.into();
    }

    pub fn has_error(&self) -> bool {
        !self.error_message.is_empty()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn set_devices(&mut self, devices: Vec<Device>) {
        self.devices = devices;
    }

    pub fn tensor_sizes(&self) -> &[i64] {
        &self.tensor_sizes
    }

    pub fn add_tensor_size(&mut self, size: i64) {
        self.tensor_sizes.push(size);
    }

    pub fn set_tensor_sizes(&mut self, sizes: Vec<i64>) {
        self.tensor_sizes = sizes;
    }

    pub fn to_json(&self) -> CollectiveResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> CollectiveResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_keeps_size_table() {
        let mut response = Response::new(ResponseType::Allgather);
        response.add_tensor_name("grad/w");
        response.set_tensor_sizes(vec![2, 0, 5]);
        let parsed = Response::from_json(&response.to_json().unwrap()).unwrap();
        assert_eq!(parsed.tensor_sizes(), &[2, 0, 5]);
        assert!(!parsed.has_error());
    }
}
