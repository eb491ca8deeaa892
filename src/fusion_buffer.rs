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

//! Fusion buffers
//!
//! One persistent staging region per (device, framework) pair. Buffers are
//! created on first initialization, grown when a request exceeds their
//! capacity, and otherwise reused across batches. They never shrink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Code, CollectiveError, CollectiveResult};
use crate::tensor::{Device, Framework};

/// Reusable byte region
#[derive(Debug)]
pub struct PersistentBuffer {
    data: Vec<u8>,
    device: Device,
    framework: Framework,
}

impl PersistentBuffer {
    pub fn new(size: usize, device: Device, framework: Framework) -> Self {
        Self {
            data: vec![0; size],
            device,
            framework,
        }
    }

    pub fn access_data(&self) -> &[u8] {
        &self.data
    }

    pub fn access_data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn framework(&self) -> Framework {
        self.framework
    }
}

pub type SharedBuffer = Arc<Mutex<PersistentBuffer>>;

/// Process-local pool of fusion buffers
#[derive(Debug, Default)]
pub struct FusionBufferManager {
    buffers: Mutex<HashMap<(Device, Framework), (SharedBuffer, usize)>>,
}

impl FusionBufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure a buffer of at least `size` bytes exists for the key.
    ///
    /// Returns `true` when a buffer was allocated, `false` when the existing
    /// one was large enough and kept.
    pub fn initialize_buffer(
        &self,
        size: usize,
        device: Device,
        framework: Framework,
    ) -> CollectiveResult<bool> {
        let mut buffers = self.lock_pool()?;
        let key = (device, framework);
        let previous = match buffers.get(&key) {
            Some((_, capacity)) if *capacity >= size => return Ok(false),
            Some((_, capacity)) => Some(*capacity),
            None => None,
        };

        match previous {
            Some(capacity) => log::debug!(
                "Growing fusion buffer for device {} framework {:?} from {} to {} bytes",
                device,
                framework,
                capacity,
                size
            ),
            None => log::debug!(
                "Allocating fusion buffer of {} bytes for device {} framework {:?}",
                size,
                device,
                framework
            ),
        }
        let buffer = Arc::new(Mutex::new(PersistentBuffer::new(size, device, framework)));
        buffers.insert(key, (buffer, size));
        Ok(true)
    }

    /// The buffer for the key, if one was initialized
    pub fn get_buffer(&self, device: Device, framework: Framework) -> CollectiveResult<SharedBuffer> {
        let buffers = self.lock_pool()?;
        buffers
            .get(&(device, framework))
            .map(|(buffer, _)| buffer.clone())
            .ok_or_else(|| {
                CollectiveError::InvalidArgument(format!(
                    "fusion buffer for device {} framework {:?} was not initialized",
                    device, framework
                ))
            })
    }

    pub fn len(&self) -> usize {
        self.buffers.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_pool(&self) -> CollectiveResult<MutexGuard<'_, HashMap<(Device, Framework), (SharedBuffer, usize)>>> {
        self.buffers
            .lock()
            .map_err(|_| CollectiveError::new(Code::Aborted, "fusion buffer pool lock poisoned"))
    }
}

/// Lock a shared buffer for the duration of one batch
pub fn lock_buffer(buffer: &SharedBuffer) -> CollectiveResult<MutexGuard<'_, PersistentBuffer>> {
    buffer
        .lock()
        .map_err(|_| CollectiveError::new(Code::Aborted, "fusion buffer lock poisoned"))
}
