/*
 * folder.rs
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

//! The folder poller.
//!
//! Every poll interval each configured folder map is scanned for regular
//! files. Empty files are discarded. A found file is renamed into the
//! map's Processed directory under a process-id suffix before its queue
//! row is pushed; the rename is the durable hand-off, the file is never
//! removed ahead of the row landing.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{FolderProcessor, FolderRegistry};
use crate::config::FolderMap;
use crate::runtime::Runtime;

/// Poll all folder maps until shutdown.
pub async fn run(runtime: Arc<Runtime>) {
    run_with(runtime, &FolderRegistry::default()).await;
}

pub async fn run_with(runtime: Arc<Runtime>, registry: &FolderRegistry) {
    info!("folder poller starting");
    let interval = Duration::from_secs(runtime.config.sender_poll_interval());
    while runtime.is_running() {
        for map in runtime.config.folder_maps() {
            poll_map(&runtime, registry, &map);
        }
        sleep_observing(&runtime, interval).await;
    }
    info!("folder poller exiting");
}

/// Sleep for up to `total`, waking regularly to observe shutdown.
pub async fn sleep_observing(runtime: &Arc<Runtime>, total: Duration) {
    let mut left = total;
    while runtime.is_running() && !left.is_zero() {
        let step = left.min(Duration::from_millis(500));
        tokio::time::sleep(step).await;
        left -= step;
    }
}

fn poll_map(runtime: &Arc<Runtime>, registry: &FolderRegistry, map: &FolderMap) {
    let Some(processor) = registry.find(&map.processor) else {
        debug!("no folder processor found for {}", map.processor);
        return;
    };
    let folder = runtime.config.resolve(&map.folder);
    let entries = match std::fs::read_dir(&folder) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("can't scan folder {}: {}", folder.display(), e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        processor.process(runtime, map, &path);
        if !runtime.is_running() {
            break;
        }
    }
}

/// The standard processor: move the file into Processed and queue an
/// ebXML send row.
pub struct EbxmlFolderProcessor;

impl FolderProcessor for EbxmlFolderProcessor {
    fn process(&self, runtime: &Arc<Runtime>, map: &FolderMap, file: &Path) {
        let meta = match std::fs::metadata(file) {
            Ok(m) => m,
            Err(e) => {
                warn!("can't access {}: {}", file.display(), e);
                return;
            }
        };
        if meta.len() == 0 {
            warn!("file {} empty... discarding", file.display());
            let _ = std::fs::remove_file(file);
            return;
        }
        info!("queuing ebXML folder {} for {}", file.display(), map.name);
        let base = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let pid = runtime.pid.next();
        let qname = format!("{}.{}", base, pid);

        let processed = runtime.config.resolve(&map.processed);
        let _ = std::fs::create_dir_all(&processed);
        let target = processed.join(&qname);
        if let Err(e) = std::fs::rename(file, &target) {
            error!(
                "couldn't move {} to {}: {}",
                file.display(),
                target.display(),
                e
            );
            return;
        }

        let Some(queue) = runtime.queues.find(&map.queue) else {
            error!("can't find queue for {}", map.queue);
            return;
        };
        let mut row = queue.new_row();
        row.set("MESSAGEID", &format!("{}-{}", map.name, pid));
        row.set("PAYLOADFILE", &qname);
        row.set("DESTINATIONFILENAME", &base);
        row.set("ROUTEINFO", &map.route);
        row.set("SERVICE", &map.service);
        row.set("ACTION", &map.action);
        row.set("ARGUMENTS", &map.arguments);
        row.set("MESSAGERECIPIENT", &map.recipient);
        row.set(
            "ENCRYPTION",
            if map.encryption.algorithm.is_empty() {
                "no"
            } else {
                "yes"
            },
        );
        row.set("SIGNATURE", "no");
        row.set("CERTIFICATEURL", &map.encryption.unc);
        row.set("PROCESSINGSTATUS", "queued");
        row.set("TRANSPORTSTATUS", "queued");
        row.set("PRIORITY", "0");
        if let Err(e) = queue.push(&mut row) {
            error!("failed queueing {}: {}", file.display(), e);
            return;
        }
        info!(
            "ebXML folder {} for {} queueing completed",
            file.display(),
            map.name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::runtime::Phase;

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "phineas-fold-{}-{}-{:x}",
            tag,
            std::process::id(),
            rand::random::<u64>()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn runtime(dir: &Path) -> Arc<Runtime> {
        let cfg = Config::parse(&format!(
            "<Phineas><Organization>lab</Organization><Sender><MapInfo><Map>\
             <Name>drop</Name><Folder>{in_dir}</Folder><Processed>{done}</Processed>\
             <Route>peer</Route><Service>elr</Service><Action>save</Action>\
             <Queue>SendQ</Queue><Processor>ebxml</Processor><Recipient>rcpt</Recipient>\
             </Map></MapInfo></Sender>\
             <QueueInfo>\
             <Connection><Name>c</Name><Type>file</Type><Unc>{q}</Unc></Connection>\
             <Queue><Name>SendQ</Name><Type>EbXmlSndQ</Type><Connection>c</Connection><Table>SendQ</Table></Queue>\
             </QueueInfo></Phineas>",
            in_dir = dir.join("in").display(),
            done = dir.join("done").display(),
            q = dir.join("q").display(),
        ))
        .unwrap();
        std::fs::create_dir_all(dir.join("in")).unwrap();
        let rt = Runtime::new(cfg).unwrap();
        rt.set_phase(Phase::Running);
        rt
    }

    #[test]
    fn file_moves_and_row_lands() {
        let dir = temp_dir("move");
        let rt = runtime(&dir);
        let dropped = dir.join("in").join("hello");
        std::fs::write(&dropped, b"hello").unwrap();
        let map = rt.config.folder_map(0).unwrap();
        EbxmlFolderProcessor.process(&rt, &map, &dropped);

        assert!(!dropped.exists());
        let moved: Vec<_> = std::fs::read_dir(dir.join("done")).unwrap().collect();
        assert_eq!(moved.len(), 1);
        let name = moved[0].as_ref().unwrap().file_name();
        assert!(name.to_string_lossy().starts_with("hello."));

        let queue = rt.queues.find("SendQ").unwrap();
        let row = queue.pop().unwrap().unwrap();
        assert_eq!(row.get("DESTINATIONFILENAME"), "hello");
        assert_eq!(row.get("ROUTEINFO"), "peer");
        assert_eq!(row.get("ENCRYPTION"), "no");
        assert_eq!(row.get("PROCESSINGSTATUS"), "queued");
        assert_eq!(row.get("PRIORITY"), "0");
        assert!(row.get("MESSAGEID").starts_with("drop-"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn empty_file_discarded_without_row() {
        let dir = temp_dir("empty");
        let rt = runtime(&dir);
        let dropped = dir.join("in").join("nothing");
        std::fs::write(&dropped, b"").unwrap();
        let map = rt.config.folder_map(0).unwrap();
        EbxmlFolderProcessor.process(&rt, &map, &dropped);
        assert!(!dropped.exists());
        let queue = rt.queues.find("SendQ").unwrap();
        assert!(queue.pop().unwrap().is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn poll_cycle_picks_up_files() {
        let dir = temp_dir("cycle");
        let rt = runtime(&dir);
        std::fs::write(dir.join("in").join("a.dat"), b"data").unwrap();
        poll_map(&rt, &FolderRegistry::default(), &rt.config.folder_map(0).unwrap());
        let queue = rt.queues.find("SendQ").unwrap();
        let row = queue.pop().unwrap().unwrap();
        assert_eq!(row.get("DESTINATIONFILENAME"), "a.dat");
        let _ = std::fs::remove_dir_all(dir);
    }
}
