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

//! Queue coordination on top of a storage engine.
//!
//! The [`Queue`] keeps an in-memory mirror of the persisted sequence and a
//! storage engine behind one async mutex. Every mutation runs its capacity
//! check, mirror update and durable write inside that mutex, so the store and
//! the mirror always agree once the lock is released.
//!
//! ## Usage
//!
//! ```ignore
//! let queue = Queue::<String>::builder("/var/lib/app/jobs.db")
//!     .maxsize(128)
//!     .build()
//!     .await?;
//!
//! // Producer
//! queue.put("resize image 42".to_string()).await?;
//!
//! // Consumer
//! let job = queue.get().await?;
//! handle(job);
//! queue.task_done()?;
//!
//! // Wait until every job put so far has been acknowledged
//! queue.join().await;
//! ```
//!
//! ## Cancellation
//!
//! Mutations run on a task of their own, so dropping a `put` or `get` future
//! never interrupts a write. A dropped `put` may still land, and then counts
//! as an unfinished task like any other. An item removed on behalf of a
//! dropped `get` is put back at the head of the queue.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use snafu::{OptionExt, ResultExt};
use tokio::{
    runtime::Handle,
    sync::{Mutex, Notify, OwnedMutexGuard},
};
use tracing::{debug, error, info, warn};

use crate::{
    EngineKind, Item, QueueBuilder, QueueConfig, Result,
    engine::StorageEngine,
    error::{BlockingTaskSnafu, EmptySnafu, FullSnafu, TaskDoneUnderflowSnafu},
    metrics::QueueMetrics,
    path::{ensure_parent_dir, validate_data_path},
    recovery::recover,
};

struct State<T> {
    mirror: VecDeque<T>,
    engine: Box<dyn StorageEngine<T>>,
}

/// Everything a mutation touches. Mutation tasks hold their own handle.
struct Shared<T> {
    state:            Arc<Mutex<State<T>>>,
    path:             PathBuf,
    maxsize:          usize,
    has_new_item:     Notify,
    has_free_slot:    Notify,
    tasks_finished:   Notify,
    unfinished_tasks: AtomicUsize,
    peak_size:        AtomicUsize,
    metrics:          QueueMetrics,
}

/// An item already removed from the store, on its way to a `get` caller.
///
/// The queue stays locked until the caller takes the item. Dropped before
/// that, it puts the item back at the head of the queue under the same lock.
struct Delivery<T: Item> {
    item:   Option<T>,
    state:  Option<OwnedMutexGuard<State<T>>>,
    shared: Arc<Shared<T>>,
}

impl<T: Item> Delivery<T> {
    fn take(mut self) -> Option<T> { self.item.take() }
}

impl<T: Item> Drop for Delivery<T> {
    fn drop(&mut self) {
        let (Some(item), Some(state)) = (self.item.take(), self.state.take()) else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { shared.restore_head(state, item).await });
            }
            Err(_) => error!(
                path = ?shared.path,
                "Undelivered item dropped outside a runtime, it is lost"
            ),
        }
    }
}

impl<T: Item> Shared<T> {
    const fn is_at_capacity(&self, len: usize) -> bool { self.maxsize > 0 && len >= self.maxsize }

    /// Appends `item` unless the queue is full, in which case it is handed
    /// back.
    async fn append(&self, item: T) -> Result<Option<T>> {
        let mut state = self.state.lock().await;
        if self.is_at_capacity(state.mirror.len()) {
            return Ok(Some(item));
        }

        let State { mirror, engine } = &mut *state;
        mirror.push_back(item);
        let persisted = {
            let _timer = self.metrics.persist_timer("put");
            match mirror.back() {
                Some(last) if engine.can_append() => engine.add_item(last, mirror).await,
                _ => engine.save_all(mirror).await,
            }
        };
        if let Err(err) = persisted {
            mirror.pop_back();
            return Err(err);
        }

        let size = mirror.len();
        self.unfinished_tasks.fetch_add(1, Ordering::AcqRel);
        let peak = self.peak_size.fetch_max(size, Ordering::AcqRel).max(size);
        drop(state);

        self.metrics.record_put(size, peak);
        debug!(path = ?self.path, items = size, "Put item");
        self.has_new_item.notify_one();
        Ok(None)
    }

    /// Removes the head item if there is one.
    async fn take_head(self: Arc<Self>) -> Result<Option<Delivery<T>>> {
        let mut state = Arc::clone(&self.state).lock_owned().await;
        let State { mirror, engine } = &mut *state;
        let Some(item) = mirror.pop_front() else {
            return Ok(None);
        };

        let persisted = {
            let _timer = self.metrics.persist_timer("get");
            if engine.can_append() {
                engine.remove_item(mirror).await
            } else {
                engine.save_all(mirror).await
            }
        };
        if let Err(err) = persisted {
            mirror.push_front(item);
            return Err(err);
        }

        let size = mirror.len();
        self.metrics.record_get(size);
        debug!(path = ?self.path, items = size, "Got item");
        if self.maxsize > 0 {
            self.has_free_slot.notify_one();
        }
        Ok(Some(Delivery {
            item:   Some(item),
            state:  Some(state),
            shared: Arc::clone(&self),
        }))
    }

    /// Puts an item nobody received back at the head of the queue.
    async fn restore_head(&self, mut state: OwnedMutexGuard<State<T>>, item: T) {
        let State { mirror, engine } = &mut *state;
        mirror.push_front(item);
        let restored = {
            let _timer = self.metrics.persist_timer("restore");
            engine.save_all(mirror).await
        };
        let size = mirror.len();
        drop(state);

        match restored {
            Ok(()) => warn!(
                path = ?self.path,
                items = size,
                "Returned an undelivered item to the head of the queue"
            ),
            Err(err) => error!(
                path = ?self.path,
                error = %err,
                "Failed to persist an undelivered item, it is held in memory only"
            ),
        }
        self.metrics.record_restored(size);
        self.has_new_item.notify_one();
    }
}

/// A durable FIFO queue shared between async tasks.
///
/// Wrap it in an `Arc` to share it; every method takes `&self`.
pub struct Queue<T: Item> {
    shared:      Arc<Shared<T>>,
    engine_kind: EngineKind,
}

impl<T: Item> Queue<T> {
    pub fn builder<P: Into<PathBuf>>(path: P) -> QueueBuilder { QueueBuilder::new(path) }

    /// Opens the queue at `path` with the default codec.
    pub async fn create<P: Into<PathBuf>>(
        path: P,
        maxsize: usize,
        engine: EngineKind,
    ) -> Result<Self> {
        QueueBuilder::new(path)
            .maxsize(maxsize)
            .engine(engine)
            .build()
            .await
    }

    pub(crate) async fn open(config: QueueConfig) -> Result<Self> {
        validate_data_path(&config.path)?;
        ensure_parent_dir(&config.path).await?;

        let mut engine = config.engine.open::<T>(&config.path, config.codec);
        let mirror = recover(engine.as_mut()).await?;
        let recovered = mirror.len();

        let metrics = QueueMetrics::new(&config.path);
        metrics.record_recovered(recovered);
        info!(
            path = ?config.path,
            engine = ?config.engine,
            codec = ?config.codec,
            maxsize = config.maxsize,
            items = recovered,
            "Opened queue"
        );

        let shared = Shared {
            state: Arc::new(Mutex::new(State { mirror, engine })),
            path: config.path,
            maxsize: config.maxsize,
            has_new_item: Notify::new(),
            has_free_slot: Notify::new(),
            tasks_finished: Notify::new(),
            unfinished_tasks: AtomicUsize::new(0),
            peak_size: AtomicUsize::new(recovered),
            metrics,
        };
        Ok(Self {
            shared:      Arc::new(shared),
            engine_kind: config.engine,
        })
    }

    /// Capacity bound; 0 means unbounded.
    pub fn maxsize(&self) -> usize { self.shared.maxsize }

    pub fn path(&self) -> &Path { &self.shared.path }

    pub const fn engine_kind(&self) -> EngineKind { self.engine_kind }

    /// Items put through this instance and not yet acknowledged with
    /// [`Queue::task_done`].
    pub fn unfinished_tasks(&self) -> usize {
        self.shared.unfinished_tasks.load(Ordering::Acquire)
    }

    /// Largest number of items held since the queue was opened.
    pub fn peak_size(&self) -> usize { self.shared.peak_size.load(Ordering::Acquire) }

    /// Number of items in the queue.
    ///
    /// Concurrent mutators may change it before the caller looks at it.
    pub async fn qsize(&self) -> usize { self.shared.state.lock().await.mirror.len() }

    pub async fn empty(&self) -> bool { self.qsize().await == 0 }

    /// Always false for an unbounded queue.
    pub async fn full(&self) -> bool { self.shared.is_at_capacity(self.qsize().await) }

    async fn try_put(&self, item: T) -> Result<Option<T>> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.append(item).await })
            .await
            .context(BlockingTaskSnafu)?
    }

    async fn try_get(&self) -> Result<Option<T>> {
        let shared = Arc::clone(&self.shared);
        let delivery = tokio::spawn(shared.take_head())
            .await
            .context(BlockingTaskSnafu)??;
        Ok(delivery.and_then(Delivery::take))
    }

    /// Durably appends `item`, failing with `Full` instead of waiting.
    ///
    /// A rejected item is dropped.
    pub async fn put_nowait(&self, item: T) -> Result<()> {
        match self.try_put(item).await? {
            None => Ok(()),
            Some(_) => FullSnafu.fail(),
        }
    }

    /// Durably appends `item`, waiting for a free slot if the queue is full.
    pub async fn put(&self, mut item: T) -> Result<()> {
        loop {
            let mut slot_freed = pin!(self.shared.has_free_slot.notified());
            slot_freed.as_mut().enable();

            match self.try_put(item).await? {
                None => return Ok(()),
                Some(rejected) => item = rejected,
            }
            slot_freed.await;
        }
    }

    /// Removes and returns the head item, failing with `Empty` instead of
    /// waiting.
    pub async fn get_nowait(&self) -> Result<T> { self.try_get().await?.context(EmptySnafu) }

    /// Removes and returns the head item, waiting for one if the queue is
    /// empty.
    pub async fn get(&self) -> Result<T> {
        loop {
            let mut item_added = pin!(self.shared.has_new_item.notified());
            item_added.as_mut().enable();

            if let Some(item) = self.try_get().await? {
                return Ok(item);
            }
            item_added.await;
        }
    }

    /// Acknowledges one item obtained from the queue.
    ///
    /// Fails with `TaskDoneUnderflow` if every item put through this instance
    /// has already been acknowledged.
    pub fn task_done(&self) -> Result<()> {
        let previous = self
            .shared
            .unfinished_tasks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => self.shared.tasks_finished.notify_waiters(),
            Ok(_) => {}
            Err(_) => return TaskDoneUnderflowSnafu.fail(),
        }
        self.shared.metrics.record_task_done();
        Ok(())
    }

    /// Waits until every item put so far has been acknowledged.
    pub async fn join(&self) {
        loop {
            let mut finished = pin!(self.shared.tasks_finished.notified());
            finished.as_mut().enable();

            if self.unfinished_tasks() == 0 {
                return;
            }
            finished.await;
        }
    }
}
