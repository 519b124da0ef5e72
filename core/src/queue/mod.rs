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

//! Durable message queues.
//!
//! A queue is a named, typed collection of rows backed by a connection.
//! Rows are ordered tuples of string fields; the first field is the
//! numeric row id, assigned monotonically and never reused. A queue whose
//! type carries TRANSPORTSTATUS is transport-bearing: pop follows the
//! queued-cursor discipline instead of returning the newest row.

pub mod filequeue;
pub mod sqlqueue;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::config::Config;

pub const SEND_QUEUE_TYPE: &str = "EbXmlSndQ";
pub const RECEIVE_QUEUE_TYPE: &str = "EbXmlRcvQ";
const TRANSPORT_FIELD: &str = "TRANSPORTSTATUS";

/// Default field lists, used when the configuration does not define the
/// type itself.
const SEND_FIELDS: &[&str] = &[
    "RECORDID",
    "MESSAGEID",
    "PAYLOADFILE",
    "DESTINATIONFILENAME",
    "ROUTEINFO",
    "SERVICE",
    "ACTION",
    "ARGUMENTS",
    "MESSAGERECIPIENT",
    "MESSAGECREATIONTIME",
    "ENCRYPTION",
    "SIGNATURE",
    "PUBLICKEYLDAPADDRESS",
    "PUBLICKEYLDAPBASEDN",
    "PUBLICKEYLDAPDN",
    "CERTIFICATEURL",
    "PROCESSINGSTATUS",
    "TRANSPORTSTATUS",
    "TRANSPORTERRORCODE",
    "APPLICATIONSTATUS",
    "APPLICATIONERRORCODE",
    "APPLICATIONRESPONSE",
    "MESSAGESENTTIME",
    "MESSAGERECEIVEDTIME",
    "RESPONSEMESSAGEID",
    "RESPONSEARGUMENTS",
    "RESPONSELOCALFILE",
    "RESPONSEFILENAME",
    "RESPONSEMESSAGEORIGIN",
    "RESPONSEMESSAGESIGNATURE",
    "PRIORITY",
];

const RECEIVE_FIELDS: &[&str] = &[
    "RECORDID",
    "MESSAGEID",
    "PAYLOADNAME",
    "LOCALFILENAME",
    "SERVICE",
    "ACTION",
    "ARGUMENTS",
    "FROMPARTYID",
    "MESSAGERECIPIENT",
    "ERRORCODE",
    "ERRORMESSAGE",
    "PROCESSINGSTATUS",
    "APPLICATIONSTATUS",
    "ENCRYPTION",
    "RECEIVEDTIME",
    "LASTUPDATETIME",
    "PROCESSID",
];

#[derive(Debug)]
pub struct QueueError(String);

impl QueueError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for QueueError {}

/// A queue type: the ordered field names shared by every row.
#[derive(Debug, Clone)]
pub struct QueueType {
    pub name: String,
    pub fields: Vec<String>,
}

impl QueueType {
    pub fn new(name: &str, fields: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.eq_ignore_ascii_case(name))
    }

    /// Transport-bearing types change the pop discipline.
    pub fn is_transport(&self) -> bool {
        matches!(self.field_index(TRANSPORT_FIELD), Some(i) if i > 0)
    }
}

/// One row. `fields[0]` mirrors `rowid`; a rowid of 0 means "not yet
/// assigned" and push will allocate the next id. The row remembers the
/// queue it belongs to so a popped row can find its way back for the
/// terminal status push.
#[derive(Debug, Clone)]
pub struct QueueRow {
    pub rowid: i64,
    pub queue_name: String,
    qtype: Arc<QueueType>,
    fields: Vec<String>,
}

impl QueueRow {
    pub fn new(qtype: Arc<QueueType>) -> Self {
        let fields = vec![String::new(); qtype.fields.len()];
        Self {
            rowid: 0,
            queue_name: String::new(),
            qtype,
            fields,
        }
    }

    pub fn queue_type(&self) -> &Arc<QueueType> {
        &self.qtype
    }

    pub fn get(&self, name: &str) -> &str {
        match self.qtype.field_index(name) {
            Some(i) => &self.fields[i],
            None => "",
        }
    }

    /// Set a field by name; unknown names are ignored (and reported),
    /// matching how rows tolerate older type definitions.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.qtype.field_index(name) {
            Some(0) => {
                self.rowid = value.trim().parse().unwrap_or(0);
                self.fields[0] = self.rowid.to_string();
            }
            Some(i) => self.fields[i] = value.to_string(),
            None => debug!("queue type {} has no field {}", self.qtype.name, name),
        }
    }

    pub fn values(&self) -> &[String] {
        &self.fields
    }

    pub fn set_rowid(&mut self, rowid: i64) {
        self.rowid = rowid;
        self.fields[0] = rowid.to_string();
    }

    /// Rebuild a row from raw field values (backend use).
    pub fn from_values(qtype: Arc<QueueType>, values: Vec<String>) -> Self {
        let mut fields = values;
        fields.resize(qtype.fields.len(), String::new());
        let rowid = fields[0].trim().parse().unwrap_or(0);
        Self {
            rowid,
            queue_name: String::new(),
            qtype,
            fields,
        }
    }
}

/// What a backend needs to know about a queue.
#[derive(Debug, Clone)]
pub struct QueueDef {
    pub name: String,
    pub table: String,
    pub qtype: Arc<QueueType>,
}

/// Capability interface each backend registers.
pub trait QueueBackend: Send + Sync {
    fn push(&self, q: &QueueDef, row: &mut QueueRow) -> Result<i64, QueueError>;
    fn pop(&self, q: &QueueDef) -> Result<Option<QueueRow>, QueueError>;
    fn get(&self, q: &QueueDef, rowid: i64) -> Result<Option<QueueRow>, QueueError>;
    fn next_row(&self, q: &QueueDef, rowid: i64) -> Result<Option<QueueRow>, QueueError>;
    fn prev_row(&self, q: &QueueDef, rowid: i64) -> Result<Option<QueueRow>, QueueError>;
    fn close(&self) -> Result<(), QueueError>;
}

/// A live queue: definition plus its connection's backend. All row
/// operations serialize on the queue mutex.
pub struct Queue {
    def: QueueDef,
    backend: Arc<dyn QueueBackend>,
    lock: Mutex<()>,
}

impl Queue {
    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn queue_type(&self) -> &Arc<QueueType> {
        &self.def.qtype
    }

    pub fn is_transport(&self) -> bool {
        self.def.qtype.is_transport()
    }

    pub fn new_row(&self) -> QueueRow {
        let mut row = QueueRow::new(self.def.qtype.clone());
        row.queue_name = self.def.name.clone();
        row
    }

    pub fn push(&self, row: &mut QueueRow) -> Result<i64, QueueError> {
        let _guard = self.lock.lock().expect("queue lock");
        self.backend.push(&self.def, row)
    }

    pub fn pop(&self) -> Result<Option<QueueRow>, QueueError> {
        let _guard = self.lock.lock().expect("queue lock");
        let mut row = self.backend.pop(&self.def)?;
        if let Some(row) = row.as_mut() {
            row.queue_name = self.def.name.clone();
        }
        Ok(row)
    }

    pub fn get(&self, rowid: i64) -> Result<Option<QueueRow>, QueueError> {
        let _guard = self.lock.lock().expect("queue lock");
        self.backend.get(&self.def, rowid)
    }

    pub fn next_row(&self, rowid: i64) -> Result<Option<QueueRow>, QueueError> {
        let _guard = self.lock.lock().expect("queue lock");
        self.backend.next_row(&self.def, rowid)
    }

    pub fn prev_row(&self, rowid: i64) -> Result<Option<QueueRow>, QueueError> {
        let _guard = self.lock.lock().expect("queue lock");
        self.backend.prev_row(&self.def, rowid)
    }
}

/// All queues, types and connections from the QueueInfo configuration.
/// One backend instance exists per connection name.
pub struct QueueManager {
    queues: HashMap<String, Arc<Queue>>,
    backends: Vec<Arc<dyn QueueBackend>>,
}

impl QueueManager {
    pub fn from_config(config: &Config) -> Result<Self, QueueError> {
        let mut types: HashMap<String, Arc<QueueType>> = HashMap::new();
        types.insert(
            SEND_QUEUE_TYPE.to_string(),
            Arc::new(QueueType::new(SEND_QUEUE_TYPE, SEND_FIELDS)),
        );
        types.insert(
            RECEIVE_QUEUE_TYPE.to_string(),
            Arc::new(QueueType::new(RECEIVE_QUEUE_TYPE, RECEIVE_FIELDS)),
        );
        for t in config.queue_types() {
            if t.fields.is_empty() {
                return Err(QueueError::new(format!("queue type {} has no fields", t.name)));
            }
            types.insert(t.name.clone(), Arc::new(t));
        }

        let mut backends: HashMap<String, Arc<dyn QueueBackend>> = HashMap::new();
        for conn in config.queue_connections() {
            let backend: Arc<dyn QueueBackend> = match conn.kind.as_str() {
                "file" => Arc::new(filequeue::FileQueueBackend::new(&conn.unc)),
                // the SQL store also answers to the legacy odbc tag
                "sql" | "sqlite" | "odbc" => {
                    Arc::new(sqlqueue::SqlQueueBackend::open(&conn.unc)?)
                }
                other => {
                    return Err(QueueError::new(format!(
                        "unknown queue connection type '{}' for {}",
                        other, conn.name
                    )))
                }
            };
            debug!("connection {} ({}) ready", conn.name, conn.kind);
            backends.insert(conn.name.clone(), backend);
        }

        let mut queues = HashMap::new();
        for q in config.queue_entries() {
            let Some(qtype) = types.get(&q.type_name) else {
                error!("no queue type {} found for queue {}", q.type_name, q.name);
                continue;
            };
            let Some(backend) = backends.get(&q.connection) else {
                error!(
                    "no queue connection {} found for queue {}",
                    q.connection, q.name
                );
                continue;
            };
            let def = QueueDef {
                name: q.name.clone(),
                table: if q.table.is_empty() {
                    q.name.clone()
                } else {
                    q.table.clone()
                },
                qtype: qtype.clone(),
            };
            debug!("queue {} using table {}", def.name, def.table);
            queues.insert(
                q.name.clone(),
                Arc::new(Queue {
                    def,
                    backend: backend.clone(),
                    lock: Mutex::new(()),
                }),
            );
        }
        Ok(Self {
            queues,
            backends: backends.into_values().collect(),
        })
    }

    pub fn find(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).cloned()
    }

    pub fn shutdown(&self) {
        for backend in &self.backends {
            if let Err(e) = backend.close() {
                error!("queue backend close: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_type_is_transport_bearing() {
        let t = QueueType::new(SEND_QUEUE_TYPE, SEND_FIELDS);
        assert!(t.is_transport());
        let r = QueueType::new(RECEIVE_QUEUE_TYPE, RECEIVE_FIELDS);
        assert!(!r.is_transport());
    }

    #[test]
    fn row_field_round_trip() {
        let t = Arc::new(QueueType::new(SEND_QUEUE_TYPE, SEND_FIELDS));
        let mut row = QueueRow::new(t);
        row.set("MESSAGEID", "map-1234");
        row.set("messageid", "map-5678"); // case-insensitive
        assert_eq!(row.get("MESSAGEID"), "map-5678");
        assert_eq!(row.get("NOSUCHFIELD"), "");
        row.set("RECORDID", "42");
        assert_eq!(row.rowid, 42);
    }

    #[test]
    fn from_values_pads_missing_fields() {
        let t = Arc::new(QueueType::new(RECEIVE_QUEUE_TYPE, RECEIVE_FIELDS));
        let row = QueueRow::from_values(t, vec!["7".into(), "mid".into()]);
        assert_eq!(row.rowid, 7);
        assert_eq!(row.get("MESSAGEID"), "mid");
        assert_eq!(row.get("PROCESSID"), "");
    }
}
