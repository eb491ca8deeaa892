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

//! Error handling for collective operations
//!
//! Every operation reports a whole-batch outcome. Internally operations
//! return [`CollectiveResult`]; the operation manager converts the result
//! into a [`Status`] which is what entry callbacks observe.

use std::fmt;

/// Outcome codes of a collective operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Ok = 0,
    UnknownError = 1,
    PreconditionError = 2,
    Aborted = 3,
    InvalidArgument = 4,
    InProgress = 5,
    OutOfMemory = 6,
    CapacityError = 7,
    TransportError = 8,
    IoError = 9,
    SerializationError = 10,
    NotImplemented = 11,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Ok => write!(f, "OK"),
            Code::UnknownError => write!(f, "Unknown error"),
            Code::PreconditionError => write!(f, "Precondition error"),
            Code::Aborted => write!(f, "Aborted"),
            Code::InvalidArgument => write!(f, "Invalid argument"),
            Code::InProgress => write!(f, "In progress"),
            Code::OutOfMemory => write!(f, "Out of memory"),
            Code::CapacityError => write!(f, "Capacity error"),
            Code::TransportError => write!(f, "Transport error"),
            Code::IoError => write!(f, "IO error"),
            Code::SerializationError => write!(f, "Serialization error"),
            Code::NotImplemented => write!(f, "Not implemented"),
        }
    }
}

/// Main error type for collective operations
#[derive(thiserror::Error, Debug)]
pub enum CollectiveError {
    /// Negotiation decided the batch cannot run; the message is surfaced verbatim.
    #[error("{0}")]
    Precondition(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Output allocation failed: {0}")]
    Allocation(String),

    #[error("Fusion buffer capacity exceeded: {0}")]
    Capacity(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Error with code {code}: {message}")]
    Generic { code: Code, message: String },
}

impl CollectiveError {
    /// Create a new error with a specific code and message
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        CollectiveError::Generic {
            code,
            message: message.into(),
        }
    }

    /// Get the error code
    pub fn code(&self) -> Code {
        match self {
            CollectiveError::Precondition(_) => Code::PreconditionError,
            CollectiveError::InvalidArgument(_) => Code::InvalidArgument,
            CollectiveError::Allocation(_) => Code::OutOfMemory,
            CollectiveError::Capacity(_) => Code::CapacityError,
            CollectiveError::Transport(_) => Code::TransportError,
            CollectiveError::NotImplemented(_) => Code::NotImplemented,
            CollectiveError::Io(_) => Code::IoError,
            CollectiveError::Serialization(_) => Code::SerializationError,
            CollectiveError::Generic { code, .. } => *code,
        }
    }

    /// Human readable message without the variant prefix
    pub fn message(&self) -> String {
        match self {
            CollectiveError::Precondition(m)
            | CollectiveError::InvalidArgument(m)
            | CollectiveError::Allocation(m)
            | CollectiveError::Capacity(m)
            | CollectiveError::Transport(m)
            | CollectiveError::NotImplemented(m) => m.clone(),
            CollectiveError::Generic { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Type alias for Results using CollectiveError
pub type CollectiveResult<T> = Result<T, CollectiveError>;

/// Whole-batch outcome handed back to the coordination loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: Code,
    reason: String,
}

impl Status {
    pub fn new(code: Code, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Create a success status
    pub fn ok() -> Self {
        Self {
            code: Code::Ok,
            reason: String::new(),
        }
    }

    pub fn precondition_error(reason: impl Into<String>) -> Self {
        Self::new(Code::PreconditionError, reason)
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, reason)
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::new(Code::Aborted, reason)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.reason)
        }
    }
}

impl From<CollectiveError> for Status {
    fn from(error: CollectiveError) -> Self {
        Self {
            code: error.code(),
            reason: error.message(),
        }
    }
}

impl From<CollectiveResult<()>> for Status {
    fn from(result: CollectiveResult<()>) -> Self {
        match result {
            Ok(()) => Status::ok(),
            Err(e) => e.into(),
        }
    }
}

impl From<Status> for CollectiveResult<()> {
    fn from(status: Status) -> Self {
        match status.code {
            Code::Ok => Ok(()),
            Code::PreconditionError => Err(CollectiveError::Precondition(status.reason)),
            code => Err(CollectiveError::new(code, status.reason)),
        }
    }
}
