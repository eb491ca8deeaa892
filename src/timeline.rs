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

//! Activity timeline
//!
//! Records begin/end events per tensor in Chrome trace format. A disabled
//! timeline accepts every call and does nothing, so operations can bracket
//! their phases unconditionally.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::entry::TensorTableEntry;
use crate::error::CollectiveResult;

pub const ALLOCATE_OUTPUT: &str = "ALLOCATE_OUTPUT";
pub const MEMCPY_IN_FUSION_BUFFER: &str = "MEMCPY_IN_FUSION_BUFFER";
pub const MEMCPY_OUT_FUSION_BUFFER: &str = "MEMCPY_OUT_FUSION_BUFFER";
pub const ALLREDUCE: &str = "ALLREDUCE";
pub const ALLGATHER: &str = "ALLGATHER";
pub const BROADCAST: &str = "BROADCAST";

/// One Chrome trace event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Activity label; empty for end events
    pub name: String,
    /// "B" or "E"
    pub ph: String,
    /// Microseconds since the timeline started
    pub ts: u64,
    /// Tensor name, shown as the trace process
    pub pid: String,
}

enum Sink {
    Disabled,
    Memory(Vec<TimelineEvent>),
    File {
        writer: BufWriter<File>,
        first: bool,
    },
}

pub struct Timeline {
    start: Instant,
    sink: Mutex<Sink>,
}

impl Timeline {
    pub fn disabled() -> Self {
        Self::with_sink(Sink::Disabled)
    }

    /// Keep events in memory, readable through [`events`](Self::events)
    pub fn in_memory() -> Self {
        Self::with_sink(Sink::Memory(Vec::new()))
    }

    /// Stream events to a Chrome trace file
    pub fn to_file(path: impl AsRef<Path>) -> CollectiveResult<Self> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        writer.write_all(b"[\n")?;
        writer.flush()?;
        Ok(Self::with_sink(Sink::File {
            writer,
            first: true,
        }))
    }

    fn with_sink(sink: Sink) -> Self {
        Self {
            start: Instant::now(),
            sink: Mutex::new(sink),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink
            .lock()
            .map(|s| !matches!(*s, Sink::Disabled))
            .unwrap_or(false)
    }

    pub fn activity_start_all(&self, entries: &[TensorTableEntry], activity: &str) {
        for e in entries {
            self.activity_start(&e.tensor_name, activity);
        }
    }

    pub fn activity_end_all(&self, entries: &[TensorTableEntry]) {
        for e in entries {
            self.activity_end(&e.tensor_name);
        }
    }

    pub fn activity_start(&self, tensor_name: &str, activity: &str) {
        self.record(tensor_name, activity, "B");
    }

    pub fn activity_end(&self, tensor_name: &str) {
        self.record(tensor_name, "", "E");
    }

    /// Events recorded by an in-memory timeline
    pub fn events(&self) -> Vec<TimelineEvent> {
        match self.sink.lock() {
            Ok(sink) => match &*sink {
                Sink::Memory(events) => events.clone(),
                _ => Vec::new(),
            },
            Err(_) => Vec::new(),
        }
    }

    pub fn flush(&self) -> CollectiveResult<()> {
        if let Ok(mut sink) = self.sink.lock() {
            if let Sink::File { writer, .. } = &mut *sink {
                writer.flush()?;
            }
        }
        Ok(())
    }

    fn record(&self, tensor_name: &str, activity: &str, phase: &str) {
        let mut sink = match self.sink.lock() {
            Ok(sink) => sink,
            Err(_) => return,
        };
        if matches!(*sink, Sink::Disabled) {
            return;
        }

        let event = TimelineEvent {
            name: activity.to_string(),
            ph: phase.to_string(),
            ts: self.start.elapsed().as_micros() as u64,
            pid: tensor_name.to_string(),
        };

        match &mut *sink {
            Sink::Disabled => {}
            Sink::Memory(events) => events.push(event),
            Sink::File { writer, first } => {
                let line = match serde_json::to_string(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        log::warn!("Dropping timeline event for {}: {}", tensor_name, e);
                        return;
                    }
                };
                let sep = if *first { "" } else { ",\n" };
                if let Err(e) = write!(writer, "{}{}", sep, line) {
                    log::warn!("Failed to write timeline event: {}", e);
                    return;
                }
                *first = false;
            }
        }
    }
}

impl Drop for Timeline {
    fn drop(&mut self) {
        if let Ok(sink) = self.sink.get_mut() {
            if let Sink::File { writer, .. } = sink {
                let _ = writer.write_all(b"\n]\n");
                let _ = writer.flush();
            }
        }
    }
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
