/*
 * runtime.rs
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

//! The runtime value every component receives: configuration, queues,
//! the process-id source, the process phase, and the receive-side
//! duplicate cache. There are no process globals; a restart builds a
//! fresh runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;

use crate::config::Config;
use crate::queue::{QueueError, QueueManager};
use crate::stamp::ProcessId;
use crate::taskq::TaskQueue;

/// Reported in the Server header and startup banner.
pub const SOFTWARE: &str = "PHINEAS 0.1.0";

/// Process lifecycle. Restart means shutdown followed by re-entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Start = 0,
    Running = 1,
    Restart = 2,
    Shutdown = 3,
    Stopped = 4,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::Start,
            1 => Phase::Running,
            2 => Phase::Restart,
            3 => Phase::Shutdown,
            _ => Phase::Stopped,
        }
    }
}

pub struct Runtime {
    pub config: Config,
    pub queues: QueueManager,
    pub pid: ProcessId,
    phase: AtomicU8,
    duplicates: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Arc<Runtime>, QueueError> {
        let queues = QueueManager::from_config(&config)?;
        Ok(Arc::new(Runtime {
            config,
            queues,
            pid: ProcessId::new(),
            phase: AtomicU8::new(Phase::Start as u8),
            duplicates: Mutex::new(HashMap::new()),
        }))
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// True while the node should keep working; every polling loop and
    /// blocking wait checks this at least every couple of seconds.
    pub fn is_running(&self) -> bool {
        matches!(self.phase(), Phase::Start | Phase::Running)
    }

    pub fn request_shutdown(&self) {
        self.set_phase(Phase::Shutdown);
    }

    pub fn request_restart(&self) {
        if self.phase() == Phase::Running {
            self.set_phase(Phase::Restart);
        }
    }

    /// Duplicate-detection cache: the ack already produced for a
    /// `{FromPartyId, RecordId}` pair, when one exists.
    pub fn cached_ack(&self, from_party: &str, record_id: &str) -> Option<Vec<u8>> {
        let cache = self.duplicates.lock().expect("dup cache lock");
        cache
            .get(&(from_party.to_string(), record_id.to_string()))
            .cloned()
    }

    pub fn cache_ack(&self, from_party: &str, record_id: &str, ack: &[u8]) {
        let mut cache = self.duplicates.lock().expect("dup cache lock");
        cache.insert(
            (from_party.to_string(), record_id.to_string()),
            ack.to_vec(),
        );
    }
}

/// Run the node until shutdown or restart is requested: HTTP server,
/// folder poller and queue poller each run as a task on one small pool.
/// Returns the phase that ended the run.
pub async fn run(runtime: Arc<Runtime>) -> Phase {
    info!("{} is starting", SOFTWARE);
    let pool = TaskQueue::new(3, Duration::from_secs(1));

    if runtime.config.server_port() > 0 || runtime.config.server_ssl_port() > 0 {
        let rt = runtime.clone();
        pool.submit(async move {
            crate::server::run(rt).await;
        });
    }
    if !runtime.config.folder_maps().is_empty() {
        let rt = runtime.clone();
        pool.submit(async move {
            crate::sender::folder::run(rt).await;
        });
    }
    let rt = runtime.clone();
    pool.submit(async move {
        crate::sender::poller::run(rt).await;
    });

    runtime.set_phase(Phase::Running);
    info!("initialization complete - {} is running", SOFTWARE);
    while runtime.is_running() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    let ending = runtime.phase();

    info!("{} is stopping", SOFTWARE);
    pool.stop().await;
    runtime.queues.shutdown();
    runtime.set_phase(Phase::Stopped);
    info!("{} is stopped", SOFTWARE);
    ending
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        Config::parse("<Phineas><Organization>t</Organization></Phineas>").unwrap()
    }

    #[test]
    fn phase_transitions() {
        let rt = Runtime::new(minimal_config()).unwrap();
        assert!(rt.is_running());
        rt.set_phase(Phase::Running);
        rt.request_restart();
        assert_eq!(rt.phase(), Phase::Restart);
        rt.request_shutdown();
        assert_eq!(rt.phase(), Phase::Shutdown);
        assert!(!rt.is_running());
    }

    #[test]
    fn restart_only_from_running() {
        let rt = Runtime::new(minimal_config()).unwrap();
        rt.set_phase(Phase::Shutdown);
        rt.request_restart();
        assert_eq!(rt.phase(), Phase::Shutdown);
    }

    #[test]
    fn duplicate_cache_round_trip() {
        let rt = Runtime::new(minimal_config()).unwrap();
        assert!(rt.cached_ack("party", "rec1").is_none());
        rt.cache_ack("party", "rec1", b"ack bytes");
        assert_eq!(rt.cached_ack("party", "rec1").unwrap(), b"ack bytes");
        assert!(rt.cached_ack("party", "rec2").is_none());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let rt = Runtime::new(minimal_config()).unwrap();
        let handle = tokio::spawn(run(rt.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        rt.request_shutdown();
        let phase = handle.await.unwrap();
        assert_eq!(phase, Phase::Shutdown);
        assert_eq!(rt.phase(), Phase::Stopped);
    }
}
