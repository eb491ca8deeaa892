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

//! Tests for the fusion buffer pool

use std::sync::Arc;

use fusion_collectives::error::Code;
use fusion_collectives::fusion_buffer::{lock_buffer, FusionBufferManager};
use fusion_collectives::tensor::{Framework, CPU_DEVICE_ID};

#[test]
fn test_initialize_is_idempotent() {
    let manager = FusionBufferManager::new();
    assert!(manager.initialize_buffer(1024, CPU_DEVICE_ID, Framework::Tensorflow).unwrap());
    let first = manager.get_buffer(CPU_DEVICE_ID, Framework::Tensorflow).unwrap();

    assert!(!manager.initialize_buffer(1024, CPU_DEVICE_ID, Framework::Tensorflow).unwrap());
    let second = manager.get_buffer(CPU_DEVICE_ID, Framework::Tensorflow).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(lock_buffer(&second).unwrap().capacity(), 1024);
    assert_eq!(manager.len(), 1);
}

#[test]
fn test_larger_request_grows_buffer() {
    let manager = FusionBufferManager::new();
    manager.initialize_buffer(64, CPU_DEVICE_ID, Framework::Pytorch).unwrap();
    assert!(manager.initialize_buffer(128, CPU_DEVICE_ID, Framework::Pytorch).unwrap());

    let buffer = manager.get_buffer(CPU_DEVICE_ID, Framework::Pytorch).unwrap();
    let guard = lock_buffer(&buffer).unwrap();
    assert_eq!(guard.capacity(), 128);
    assert_eq!(guard.device(), CPU_DEVICE_ID);
    assert_eq!(guard.framework(), Framework::Pytorch);
}

#[test]
fn test_smaller_request_keeps_buffer() {
    let manager = FusionBufferManager::new();
    manager.initialize_buffer(48, CPU_DEVICE_ID, Framework::Pytorch).unwrap();
    let first = manager.get_buffer(CPU_DEVICE_ID, Framework::Pytorch).unwrap();

    for size in [40, 16, 48, 0] {
        assert!(!manager.initialize_buffer(size, CPU_DEVICE_ID, Framework::Pytorch).unwrap());
    }
    let kept = manager.get_buffer(CPU_DEVICE_ID, Framework::Pytorch).unwrap();
    assert!(Arc::ptr_eq(&first, &kept));
    assert_eq!(lock_buffer(&kept).unwrap().capacity(), 48);
}

#[test]
fn test_buffers_are_per_device_and_framework() {
    let manager = FusionBufferManager::new();
    manager.initialize_buffer(64, CPU_DEVICE_ID, Framework::Pytorch).unwrap();
    manager.initialize_buffer(64, CPU_DEVICE_ID, Framework::Mxnet).unwrap();
    manager.initialize_buffer(64, 0, Framework::Pytorch).unwrap();
    assert_eq!(manager.len(), 3);

    let a = manager.get_buffer(CPU_DEVICE_ID, Framework::Pytorch).unwrap();
    let b = manager.get_buffer(0, Framework::Pytorch).unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
}

#[test]
fn test_get_before_initialize_fails() {
    let manager = FusionBufferManager::new();
    assert!(manager.is_empty());
    let err = manager.get_buffer(3, Framework::Tensorflow).unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}
