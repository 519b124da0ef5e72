/*
 * taskq.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Phineas, a store-and-forward ebXML messaging node.
 *
 * Phineas is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Phineas is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Phineas.  If not, see <http://www.gnu.org/licenses/>.
 */

//! A bounded worker pool on the tokio runtime.
//!
//! `submit` never blocks: the task joins the pending list and a new
//! worker is spawned only when none is idle and the pool is below its
//! limit. Idle workers wait on a notifier with a timeout and exit when it
//! expires, so the pool shrinks back on quiet periods. `stop` is
//! idempotent and may be called from inside a task: the calling worker
//! counts as one running worker and is excluded from the wait. A task
//! that panics takes down neither its worker nor the pool.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

tokio::task_local! {
    /// Set inside pool workers so stop() can tell whether it was called
    /// from within a task of this pool.
    static WORKER_POOL: usize;
}

struct Inner {
    pending: Mutex<VecDeque<Task>>,
    ready: Notify,
    max_workers: usize,
    idle_timeout: Duration,
    running: AtomicUsize,
    waiting: AtomicUsize,
    stop: AtomicBool,
    /// Identity used by the worker task-local.
    id: usize,
}

/// The pool handle. Cloning shares the pool.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

static POOL_IDS: AtomicUsize = AtomicUsize::new(1);

impl TaskQueue {
    pub fn new(max_workers: usize, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(VecDeque::new()),
                ready: Notify::new(),
                max_workers: max_workers.max(1),
                idle_timeout,
                running: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                stop: AtomicBool::new(false),
                id: POOL_IDS.fetch_add(1, Ordering::Relaxed),
            }),
        }
    }

    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    pub fn waiting(&self) -> usize {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    /// Queue a task. Non-blocking; a stopped pool silently drops the
    /// submission.
    pub fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_stopping() {
            debug!("task submitted to stopped pool, dropped");
            return;
        }
        {
            let mut pending = self.inner.pending.lock().expect("taskq lock");
            pending.push_back(Box::pin(task));
        }
        self.inner.ready.notify_one();
        if self.waiting() == 0 && self.running() < self.inner.max_workers {
            self.spawn_worker();
        }
    }

    fn spawn_worker(&self) {
        let inner = self.inner.clone();
        inner.running.fetch_add(1, Ordering::SeqCst);
        let scope = inner.clone();
        tokio::spawn(WORKER_POOL.scope(scope.id, async move {
            debug!("worker started");
            loop {
                if inner.stop.load(Ordering::SeqCst) {
                    break;
                }
                let task = {
                    let mut pending = inner.pending.lock().expect("taskq lock");
                    pending.pop_front()
                };
                match task {
                    Some(task) => {
                        // run behind a join handle so a panic is
                        // contained and reported, not propagated; the
                        // task keeps the pool identity so it may call
                        // stop() on its own pool
                        let handle = tokio::spawn(WORKER_POOL.scope(inner.id, task));
                        if let Err(e) = handle.await {
                            error!("pool task failed: {}", e);
                        }
                    }
                    None => {
                        inner.waiting.fetch_add(1, Ordering::SeqCst);
                        let idle =
                            tokio::time::timeout(inner.idle_timeout, inner.ready.notified())
                                .await;
                        inner.waiting.fetch_sub(1, Ordering::SeqCst);
                        if idle.is_err() {
                            debug!("worker idle timeout");
                            break;
                        }
                    }
                }
            }
            inner.running.fetch_sub(1, Ordering::SeqCst);
            debug!("worker exiting");
        }));
    }

    /// Signal shutdown and wait for the other workers to exit. Returns
    /// false when the pool was already stopping.
    pub async fn stop(&self) -> bool {
        if self.inner.stop.swap(true, Ordering::SeqCst) {
            return false;
        }
        let in_worker = WORKER_POOL
            .try_with(|id| *id == self.inner.id)
            .unwrap_or(false);
        let floor = if in_worker { 1 } else { 0 };
        debug!("waiting on pool tasks to exit");
        loop {
            self.inner.ready.notify_waiters();
            if self.waiting() == 0 && self.running() <= floor {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        debug!("pool stop completed");
        true
    }
}
