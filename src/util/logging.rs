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

//! Logging utilities
//!
//! The crate logs through the `log` facade; binaries pick the backend.
//! These helpers install `env_logger`, honouring `RUST_LOG`.

use log::LevelFilter;

/// Initialize logging from `RUST_LOG`. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_default_env().try_init();
}

/// Initialize logging with a fixed level, e.g. per-rank debug runs
pub fn init_logging_with_level(level: LevelFilter) {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

/// Initialize logging for tests; output is captured per test
pub fn init_test_logging() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// Log macros prefixed with the crate name, for embedding code. The crate
/// itself calls the `log` macros directly.
#[macro_export]
macro_rules! collective_info {
    ($($arg:tt)*) => {
        log::info!($($arg)*)
    };
}

#[macro_export]
macro_rules! collective_debug {
    ($($arg:tt)*) => {
        log::debug!($($arg)*)
    };
}

#[macro_export]
macro_rules! collective_warn {
    ($($arg:tt)*) => {
        log::warn!($($arg)*)
    };
}

#[macro_export]
macro_rules! collective_error {
    ($($arg:tt)*) => {
        log::error!($($arg)*)
    };
}

#[macro_export]
macro_rules! collective_trace {
    ($($arg:tt)*) => {
        log::trace!($($arg)*)
    };
}
