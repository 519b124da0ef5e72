/*
 * mod.rs
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

//! The send side: the folder poller that turns dropped files into queue
//! rows, the queue poller that drives transport-ready rows into worker
//! tasks, and the ebXML transmitter itself.
//!
//! Both pollers dispatch through small registries keyed by configuration
//! tags (the folder map's `Processor`, the queue's `Type`), so further
//! message profiles can be added beside the ebXML one.

pub mod folder;
pub mod poller;
pub mod transmit;

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::FolderMap;
use crate::queue::QueueRow;
use crate::runtime::Runtime;

/// Handles one file found in a watched folder.
pub trait FolderProcessor: Send + Sync {
    fn process(&self, runtime: &Arc<Runtime>, map: &FolderMap, file: &Path);
}

/// Handles one popped transport row. Boxed future so implementations can
/// do network I/O.
pub trait QueueProcessor: Send + Sync {
    fn process(
        &self,
        runtime: Arc<Runtime>,
        row: QueueRow,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Folder processors by tag. The default set carries the ebXML
/// processor under its customary name.
pub struct FolderRegistry {
    processors: HashMap<String, Arc<dyn FolderProcessor>>,
}

impl Default for FolderRegistry {
    fn default() -> Self {
        let mut processors: HashMap<String, Arc<dyn FolderProcessor>> = HashMap::new();
        processors.insert("ebxml".to_string(), Arc::new(folder::EbxmlFolderProcessor));
        Self { processors }
    }
}

impl FolderRegistry {
    pub fn register(&mut self, tag: &str, processor: Arc<dyn FolderProcessor>) {
        self.processors.insert(tag.to_string(), processor);
    }

    pub fn find(&self, tag: &str) -> Option<Arc<dyn FolderProcessor>> {
        // an unset tag means the ebXML processor
        let tag = if tag.is_empty() { "ebxml" } else { tag };
        self.processors.get(tag).cloned()
    }
}

/// Queue processors by queue type name.
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn QueueProcessor>>,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        let mut processors: HashMap<String, Arc<dyn QueueProcessor>> = HashMap::new();
        processors.insert(
            crate::queue::SEND_QUEUE_TYPE.to_string(),
            Arc::new(transmit::EbxmlQueueProcessor),
        );
        Self { processors }
    }
}

impl ProcessorRegistry {
    pub fn register(&mut self, type_name: &str, processor: Arc<dyn QueueProcessor>) {
        self.processors.insert(type_name.to_string(), processor);
    }

    pub fn find(&self, type_name: &str) -> Option<Arc<dyn QueueProcessor>> {
        self.processors.get(type_name).cloned()
    }
}
