// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Panics reported through `tracing` before the default hook runs.

use std::{panic, sync::LazyLock};

use backtrace::Backtrace;
use prometheus::{IntCounter, register_int_counter};

pub static PANIC_COUNTER: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("diskq_panic_counter", "Number of panics in the process").unwrap()
});

/// Logs every panic at error level with its location and backtrace, counts
/// it, then hands it to the previously installed hook.
pub fn set_panic_hook() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic| {
        let backtrace = format!("{:?}", Backtrace::new());
        let thread = std::thread::current();
        let thread = thread.name().unwrap_or("<unnamed>");
        match panic.location() {
            Some(location) => tracing::error!(
                message = %panic,
                thread,
                backtrace = %backtrace,
                panic.file = location.file(),
                panic.line = location.line(),
                panic.column = location.column(),
            ),
            None => tracing::error!(message = %panic, thread, backtrace = %backtrace),
        }
        PANIC_COUNTER.inc();
        default_hook(panic);
    }));
}
