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

use std::{path::Path, sync::LazyLock};

use prometheus::{
    HistogramTimer, HistogramVec, IntCounterVec, IntGaugeVec, register_histogram_vec,
    register_int_counter_vec, register_int_gauge_vec,
};

pub const QUEUE_LABEL: &str = "queue";
pub const OP_LABEL: &str = "op";

pub static QUEUE_PUT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "diskq_put_total",
        "Total number of items durably enqueued",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static QUEUE_GET: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "diskq_get_total",
        "Total number of items dequeued",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static QUEUE_TASK_DONE: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "diskq_task_done_total",
        "Total number of acknowledged tasks",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static QUEUE_CORRUPT_STORES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "diskq_corrupt_stores_total",
        "Total number of data files quarantined as unreadable",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static QUEUE_SIZE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "diskq_size",
        "Number of items currently in the queue",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static QUEUE_PEAK_SIZE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "diskq_peak_size",
        "Largest number of items held since the queue was opened",
        &[QUEUE_LABEL]
    )
    .unwrap()
});

pub static QUEUE_PERSIST_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "diskq_persist_duration_seconds",
        "Time spent persisting one mutation",
        &[QUEUE_LABEL, OP_LABEL]
    )
    .unwrap()
});

/// Label of a queue in the metrics above.
pub(crate) fn queue_label(path: &Path) -> String { path.display().to_string() }

fn gauge_value(size: usize) -> i64 { i64::try_from(size).unwrap_or(i64::MAX) }

/// Per-queue handle onto the shared metric families.
#[derive(Debug, Clone)]
pub(crate) struct QueueMetrics {
    label: String,
}

impl QueueMetrics {
    pub(crate) fn new(path: &Path) -> Self {
        Self {
            label: queue_label(path),
        }
    }

    pub(crate) fn record_recovered(&self, size: usize) {
        QUEUE_SIZE
            .with_label_values(&[self.label.as_str()])
            .set(gauge_value(size));
        QUEUE_PEAK_SIZE
            .with_label_values(&[self.label.as_str()])
            .set(gauge_value(size));
    }

    pub(crate) fn record_put(&self, size: usize, peak: usize) {
        QUEUE_PUT.with_label_values(&[self.label.as_str()]).inc();
        QUEUE_SIZE
            .with_label_values(&[self.label.as_str()])
            .set(gauge_value(size));
        QUEUE_PEAK_SIZE
            .with_label_values(&[self.label.as_str()])
            .set(gauge_value(peak));
    }

    pub(crate) fn record_get(&self, size: usize) {
        QUEUE_GET.with_label_values(&[self.label.as_str()]).inc();
        QUEUE_SIZE
            .with_label_values(&[self.label.as_str()])
            .set(gauge_value(size));
    }

    pub(crate) fn record_restored(&self, size: usize) {
        QUEUE_SIZE
            .with_label_values(&[self.label.as_str()])
            .set(gauge_value(size));
    }

    pub(crate) fn record_task_done(&self) {
        QUEUE_TASK_DONE
            .with_label_values(&[self.label.as_str()])
            .inc();
    }

    pub(crate) fn persist_timer(&self, op: &str) -> HistogramTimer {
        QUEUE_PERSIST_DURATION_SECONDS
            .with_label_values(&[self.label.as_str(), op])
            .start_timer()
    }
}
