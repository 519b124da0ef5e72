/*
 * poller.rs
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

//! The queue poller.
//!
//! Every poll interval each configured queue is drained: rows are popped
//! until none remain and each is handed to the processor registered for
//! the queue's type, as a task on a pool sized by MaxThreads. A popped
//! row is owned by exactly one task until its terminal push.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::folder::sleep_observing;
use super::ProcessorRegistry;
use crate::runtime::Runtime;
use crate::taskq::TaskQueue;

pub async fn run(runtime: Arc<Runtime>) {
    run_with(runtime, &ProcessorRegistry::default()).await;
}

pub async fn run_with(runtime: Arc<Runtime>, registry: &ProcessorRegistry) {
    info!("queue poller starting");
    let interval = Duration::from_secs(runtime.config.queue_poll_interval());
    let pool = TaskQueue::new(runtime.config.queue_max_threads(), interval);
    while runtime.is_running() {
        for entry in runtime.config.queue_entries() {
            poll_queue(&runtime, registry, &pool, &entry.name, &entry.type_name);
        }
        sleep_observing(&runtime, interval).await;
    }
    debug!("queue poller shutting down");
    pool.stop().await;
    info!("queue poller exiting");
}

fn poll_queue(
    runtime: &Arc<Runtime>,
    registry: &ProcessorRegistry,
    pool: &TaskQueue,
    queue_name: &str,
    type_name: &str,
) {
    let Some(processor) = registry.find(type_name) else {
        debug!("no processor found for queue type {}", type_name);
        return;
    };
    let Some(queue) = runtime.queues.find(queue_name) else {
        debug!("can't find queue {}", queue_name);
        return;
    };
    loop {
        if !runtime.is_running() {
            break;
        }
        let row = match queue.pop() {
            Ok(Some(row)) => row,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("pop from {} failed: {}", queue_name, e);
                break;
            }
        };
        debug!(
            "starting processor {} for {} row {}",
            type_name, queue_name, row.rowid
        );
        pool.submit(processor.process(runtime.clone(), row));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::queue::QueueRow;
    use crate::runtime::Phase;
    use crate::sender::QueueProcessor;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Recording {
        count: Arc<AtomicU32>,
        ids: Arc<Mutex<Vec<i64>>>,
    }

    impl QueueProcessor for Recording {
        fn process(
            &self,
            _runtime: Arc<Runtime>,
            row: QueueRow,
        ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            let count = self.count.clone();
            let ids = self.ids.clone();
            Box::pin(async move {
                ids.lock().unwrap().push(row.rowid);
                count.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    fn runtime(dir: &std::path::Path) -> Arc<Runtime> {
        let cfg = Config::parse(&format!(
            "<Phineas><Organization>lab</Organization>\
             <QueueInfo><PollInterval>1</PollInterval><MaxThreads>2</MaxThreads>\
             <Connection><Name>c</Name><Type>file</Type><Unc>{}</Unc></Connection>\
             <Queue><Name>SendQ</Name><Type>EbXmlSndQ</Type><Connection>c</Connection><Table>SendQ</Table></Queue>\
             </QueueInfo></Phineas>",
            dir.display()
        ))
        .unwrap();
        let rt = Runtime::new(cfg).unwrap();
        rt.set_phase(Phase::Running);
        rt
    }

    #[tokio::test]
    async fn drains_queued_rows_once() {
        let dir = std::env::temp_dir().join(format!(
            "phineas-qpoll-{}-{:x}",
            std::process::id(),
            rand::random::<u64>()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let rt = runtime(&dir);
        let queue = rt.queues.find("SendQ").unwrap();
        for i in 0..3 {
            let mut row = queue.new_row();
            row.set("MESSAGEID", &format!("m{}", i));
            row.set("TRANSPORTSTATUS", "queued");
            queue.push(&mut row).unwrap();
        }

        let count = Arc::new(AtomicU32::new(0));
        let ids = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ProcessorRegistry::default();
        registry.register(
            crate::queue::SEND_QUEUE_TYPE,
            Arc::new(Recording {
                count: count.clone(),
                ids: ids.clone(),
            }),
        );
        let pool = TaskQueue::new(2, Duration::from_millis(100));
        poll_queue(&rt, &registry, &pool, "SendQ", crate::queue::SEND_QUEUE_TYPE);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        let mut got = ids.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, vec![1, 2, 3]);

        // a second cycle finds nothing new
        poll_queue(&rt, &registry, &pool, "SendQ", crate::queue::SEND_QUEUE_TYPE);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        pool.stop().await;
        let _ = std::fs::remove_dir_all(dir);
    }
}
