/*
 * filequeue.rs
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

//! File-backed queues: one tab-delimited text file per queue, first line
//! the column header. The file is append-only; updating a row appends a
//! fresh line with the same id and the in-memory byte-offset index keeps
//! only the latest offset per id (last write wins). The index is a
//! rolling window of the newest 500 ids; older rows fall off the window
//! and are no longer addressable, which suits an audit trail.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, error, warn};

use super::{QueueBackend, QueueDef, QueueError, QueueRow};

const SEP: char = '\t';
const INDEX_CAPACITY: usize = 500;
const TRANSPORT_FIELD: &str = "TRANSPORTSTATUS";
const QUEUED: &str = "queued";

struct FileState {
    file: File,
    /// Highest row id ever seen in this queue.
    max_rowid: i64,
    /// Row id held in index slot 0.
    base: i64,
    /// Byte offset of each row's latest line; 0 marks deleted/absent.
    index: Vec<u64>,
    /// Byte offset of the next transport row to consider, when the type
    /// is transport-bearing.
    transport: Option<u64>,
}

impl FileState {
    /// Record the latest offset for a row, sliding the window forward
    /// when the id runs past capacity.
    fn index_row(&mut self, rowid: i64, offset: u64) {
        if rowid < self.base {
            return;
        }
        let mut slot = (rowid - self.base) as usize;
        if slot >= INDEX_CAPACITY {
            let shift = slot - INDEX_CAPACITY + 1;
            debug!("file queue index full, sliding by {}", shift);
            self.index.drain(..shift.min(self.index.len()));
            self.base += shift as i64;
            slot = (rowid - self.base) as usize;
        }
        if self.index.len() <= slot {
            self.index.resize(slot + 1, 0);
        }
        self.index[slot] = offset;
        if rowid > self.max_rowid {
            self.max_rowid = rowid;
        }
    }

    fn offset_of(&self, rowid: i64) -> Option<u64> {
        if rowid < self.base {
            return None;
        }
        let slot = (rowid - self.base) as usize;
        match self.index.get(slot) {
            Some(&p) if p != 0 => Some(p),
            _ => None,
        }
    }

    fn clear(&mut self, rowid: i64) {
        if rowid < self.base {
            return;
        }
        let slot = (rowid - self.base) as usize;
        if let Some(p) = self.index.get_mut(slot) {
            *p = 0;
        }
    }
}

/// The file backend for one connection; the connection Unc is the folder
/// holding the queue files.
pub struct FileQueueBackend {
    dir: PathBuf,
    states: Mutex<HashMap<String, FileState>>,
}

impl FileQueueBackend {
    pub fn new(dir: &str) -> Self {
        Self {
            dir: PathBuf::from(dir),
            states: Mutex::new(HashMap::new()),
        }
    }

    fn with_state<T>(
        &self,
        q: &QueueDef,
        op: impl FnOnce(&mut FileState) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let mut states = self.states.lock().expect("fileq lock");
        if !states.contains_key(&q.name) {
            let state = open_state(&self.dir, q)?;
            states.insert(q.name.clone(), state);
        }
        op(states.get_mut(&q.name).expect("state just inserted"))
    }
}

/// Open (creating as needed) and reindex one queue file.
fn open_state(dir: &PathBuf, q: &QueueDef) -> Result<FileState, QueueError> {
    let path = dir.join(format!("{}.txt", q.table));
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(&path)
        .map_err(|e| QueueError::new(format!("can't open file queue {}: {}", path.display(), e)))?;
    debug!("opened file queue {}", path.display());
    let mut state = FileState {
        file,
        max_rowid: 0,
        base: 1,
        index: Vec::new(),
        transport: None,
    };
    reindex(q, &mut state, &path)?;
    Ok(state)
}

fn reindex(q: &QueueDef, state: &mut FileState, path: &PathBuf) -> Result<(), QueueError> {
    state.file.seek(SeekFrom::Start(0)).map_err(io_err)?;
    let mut reader = BufReader::new(&mut state.file);
    let mut header = String::new();
    let n = reader.read_line(&mut header).map_err(io_err)?;
    let transport_bearing = q.qtype.is_transport();
    if n == 0 {
        // fresh file: write the column header
        drop(reader);
        let line = q.qtype.fields.join("\t") + "\n";
        state.file.write_all(line.as_bytes()).map_err(io_err)?;
        state.file.flush().map_err(io_err)?;
        if transport_bearing {
            state.transport = Some(line.len() as u64);
        }
        return Ok(());
    }
    let columns: Vec<&str> = header.trim_end_matches(['\r', '\n']).split(SEP).collect();
    if columns.len() != q.qtype.fields.len()
        || columns
            .iter()
            .zip(q.qtype.fields.iter())
            .any(|(a, b)| *a != b)
    {
        return Err(QueueError::new(format!(
            "queue file {} columns do not match type {}",
            path.display(),
            q.qtype.name
        )));
    }
    let mut pos = n as u64;
    let first_row = pos;
    let mut entries: Vec<(i64, u64)> = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).map_err(io_err)?;
        if n == 0 {
            break;
        }
        if let Ok(rowid) = leading_id(&line) {
            entries.push((rowid, pos));
        }
        pos += n as u64;
    }
    drop(reader);
    if transport_bearing {
        state.transport = Some(first_row);
    }
    for (rowid, offset) in entries {
        state.index_row(rowid, offset);
    }
    debug!(
        "indexed {} to row {} from {}",
        q.name, state.max_rowid, state.base
    );
    Ok(())
}

fn io_err(e: std::io::Error) -> QueueError {
    QueueError::new(format!("file queue i/o: {}", e))
}

fn leading_id(line: &str) -> Result<i64, QueueError> {
    let first = line.split(SEP).next().unwrap_or("");
    first
        .trim()
        .parse()
        .map_err(|_| QueueError::new(format!("bad row id '{}'", first)))
}

/// Values joined by tabs; embedded separators are flattened to spaces so
/// a row always stays one line.
fn format_row(row: &QueueRow) -> String {
    let mut out = String::new();
    for (i, value) in row.values().iter().enumerate() {
        if i > 0 {
            out.push(SEP);
        }
        for c in value.chars() {
            out.push(if c == SEP || c == '\n' || c == '\r' { ' ' } else { c });
        }
    }
    out.push('\n');
    out
}

fn parse_row(q: &QueueDef, line: &str) -> QueueRow {
    let values: Vec<String> = line
        .trim_end_matches(['\r', '\n'])
        .split(SEP)
        .map(str::to_string)
        .collect();
    QueueRow::from_values(q.qtype.clone(), values)
}

/// Read the line at a known offset.
fn read_line_at(state: &mut FileState, offset: u64) -> Result<String, QueueError> {
    state.file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
    let mut reader = BufReader::new(&mut state.file);
    let mut line = String::new();
    reader.read_line(&mut line).map_err(io_err)?;
    Ok(line)
}

fn get_row(state: &mut FileState, q: &QueueDef, rowid: i64) -> Result<Option<QueueRow>, QueueError> {
    let Some(offset) = state.offset_of(rowid) else {
        return Ok(None);
    };
    let line = read_line_at(state, offset)?;
    let row = parse_row(q, &line);
    if row.rowid != rowid {
        error!("row id {} does not match line '{:.12}'", rowid, line);
        return Ok(None);
    }
    Ok(Some(row))
}

/// Scan forward from the transport cursor for the next current row whose
/// TRANSPORTSTATUS starts "queued".
fn pop_transport(state: &mut FileState, q: &QueueDef) -> Result<Option<QueueRow>, QueueError> {
    let Some(field) = q.qtype.field_index(TRANSPORT_FIELD) else {
        return Ok(None);
    };
    let mut cursor = state.transport.unwrap_or(0);
    state.file.seek(SeekFrom::Start(cursor)).map_err(io_err)?;
    let mut reader = BufReader::new(&mut state.file);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).map_err(io_err)?;
        if n == 0 {
            state.transport = Some(cursor);
            return Ok(None);
        }
        let line_start = cursor;
        cursor += n as u64;
        let status = line.split(SEP).nth(field).unwrap_or("");
        if !status.starts_with(QUEUED) {
            continue;
        }
        let Ok(rowid) = leading_id(&line) else {
            continue;
        };
        // the line must still be current (not superseded by a later
        // append); ids that fell off the index window can't be checked
        // and are taken as-is. Field access keeps the reader's borrow of
        // state.file disjoint.
        let current = if rowid < state.base {
            true
        } else {
            let slot = (rowid - state.base) as usize;
            matches!(state.index.get(slot), Some(&p) if p != 0 && p == line_start)
        };
        if current {
            state.transport = Some(cursor);
            drop(reader);
            let row = parse_row(q, &line);
            return Ok(Some(row));
        }
    }
}

/// Highest live row at or below `from`.
fn scan_prev(state: &mut FileState, q: &QueueDef, from: i64) -> Result<Option<QueueRow>, QueueError> {
    let mut rowid = from;
    while rowid >= state.base {
        if state.offset_of(rowid).is_some() {
            return get_row(state, q, rowid);
        }
        rowid -= 1;
    }
    Ok(None)
}

impl QueueBackend for FileQueueBackend {
    fn push(&self, q: &QueueDef, row: &mut QueueRow) -> Result<i64, QueueError> {
        self.with_state(q, |state| {
            if row.rowid == 0 {
                row.set_rowid(state.max_rowid + 1);
            }
            let line = format_row(row);
            let offset = state.file.seek(SeekFrom::End(0)).map_err(io_err)?;
            state.file.write_all(line.as_bytes()).map_err(io_err)?;
            state.file.flush().map_err(io_err)?;
            state.index_row(row.rowid, offset);
            Ok(row.rowid)
        })
    }

    fn pop(&self, q: &QueueDef) -> Result<Option<QueueRow>, QueueError> {
        self.with_state(q, |state| {
            let popped = if state.transport.is_some() {
                pop_transport(state, q)?
            } else {
                scan_prev(state, q, state.max_rowid)?
            };
            if let Some(row) = &popped {
                state.clear(row.rowid);
            }
            Ok(popped)
        })
    }

    fn get(&self, q: &QueueDef, rowid: i64) -> Result<Option<QueueRow>, QueueError> {
        self.with_state(q, |state| get_row(state, q, rowid))
    }

    fn next_row(&self, q: &QueueDef, rowid: i64) -> Result<Option<QueueRow>, QueueError> {
        self.with_state(q, |state| {
            let mut next = if rowid == 0 { state.base } else { rowid + 1 };
            while next <= state.max_rowid {
                if state.offset_of(next).is_some() {
                    return get_row(state, q, next);
                }
                next += 1;
            }
            Ok(None)
        })
    }

    fn prev_row(&self, q: &QueueDef, rowid: i64) -> Result<Option<QueueRow>, QueueError> {
        self.with_state(q, |state| {
            let from = if rowid == 0 {
                state.max_rowid
            } else {
                rowid - 1
            };
            scan_prev(state, q, from)
        })
    }

    fn close(&self) -> Result<(), QueueError> {
        let mut states = self.states.lock().expect("fileq lock");
        for (name, state) in states.drain() {
            if let Err(e) = (&state.file).sync_all() {
                warn!("closing file queue {}: {}", name, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueType, SEND_QUEUE_TYPE};
    use std::sync::Arc;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "phineas-fileq-{}-{}-{:x}",
            tag,
            std::process::id(),
            rand::random::<u64>()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn send_def() -> QueueDef {
        let qtype = Arc::new(QueueType::new(
            SEND_QUEUE_TYPE,
            &[
                "RECORDID",
                "MESSAGEID",
                "PROCESSINGSTATUS",
                "TRANSPORTSTATUS",
            ],
        ));
        QueueDef {
            name: "SendQ".into(),
            table: "SendQ".into(),
            qtype,
        }
    }

    fn receive_def() -> QueueDef {
        let qtype = Arc::new(QueueType::new("EbXmlRcvQ", &["RECORDID", "MESSAGEID"]));
        QueueDef {
            name: "RcvQ".into(),
            table: "RcvQ".into(),
            qtype,
        }
    }

    fn queued_row(def: &QueueDef, mid: &str) -> QueueRow {
        let mut row = QueueRow::new(def.qtype.clone());
        row.set("MESSAGEID", mid);
        row.set("PROCESSINGSTATUS", "queued");
        row.set("TRANSPORTSTATUS", "queued");
        row
    }

    #[test]
    fn push_assigns_monotonic_ids() {
        let dir = temp_dir("ids");
        let backend = FileQueueBackend::new(dir.to_str().unwrap());
        let def = send_def();
        for expect in 1..=5 {
            let mut row = queued_row(&def, "m");
            let id = backend.push(&def, &mut row).unwrap();
            assert_eq!(id, expect);
        }
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn header_written_and_verified() {
        let dir = temp_dir("hdr");
        let backend = FileQueueBackend::new(dir.to_str().unwrap());
        let def = send_def();
        let mut row = queued_row(&def, "m1");
        backend.push(&def, &mut row).unwrap();
        let content = std::fs::read_to_string(dir.join("SendQ.txt")).unwrap();
        assert!(content.starts_with("RECORDID\tMESSAGEID\tPROCESSINGSTATUS\tTRANSPORTSTATUS\n"));

        // a different field list must be rejected on reopen
        let other = FileQueueBackend::new(dir.to_str().unwrap());
        let mut bad = send_def();
        bad.qtype = Arc::new(QueueType::new(SEND_QUEUE_TYPE, &["RECORDID", "OTHER"]));
        let mut row = QueueRow::new(bad.qtype.clone());
        assert!(other.push(&bad, &mut row).is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn transport_pop_in_fifo_order_without_repeats() {
        let dir = temp_dir("pop");
        let backend = FileQueueBackend::new(dir.to_str().unwrap());
        let def = send_def();
        for mid in ["a", "b", "c"] {
            backend.push(&def, &mut queued_row(&def, mid)).unwrap();
        }
        let first = backend.pop(&def).unwrap().unwrap();
        assert_eq!(first.get("MESSAGEID"), "a");
        let second = backend.pop(&def).unwrap().unwrap();
        assert_eq!(second.get("MESSAGEID"), "b");
        let third = backend.pop(&def).unwrap().unwrap();
        assert_eq!(third.get("MESSAGEID"), "c");
        assert!(backend.pop(&def).unwrap().is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn updated_row_is_not_repopped() {
        let dir = temp_dir("upd");
        let backend = FileQueueBackend::new(dir.to_str().unwrap());
        let def = send_def();
        let mut row = queued_row(&def, "a");
        backend.push(&def, &mut row).unwrap();
        // advance its status before any pop: the old "queued" line is
        // superseded and must be skipped
        row.set("TRANSPORTSTATUS", "attempted");
        backend.push(&def, &mut row).unwrap();
        assert!(backend.pop(&def).unwrap().is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn requeued_row_pops_again() {
        let dir = temp_dir("requeue");
        let backend = FileQueueBackend::new(dir.to_str().unwrap());
        let def = send_def();
        let mut row = queued_row(&def, "a");
        backend.push(&def, &mut row).unwrap();
        let popped = backend.pop(&def).unwrap().unwrap();
        assert!(backend.pop(&def).unwrap().is_none());
        // explicit resend: status back to queued, pushed again
        let mut resend = popped;
        resend.set("TRANSPORTSTATUS", "queued");
        backend.push(&def, &mut resend).unwrap();
        let again = backend.pop(&def).unwrap().unwrap();
        assert_eq!(again.rowid, resend.rowid);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn reindex_survives_reopen() {
        let dir = temp_dir("reopen");
        let def = send_def();
        {
            let backend = FileQueueBackend::new(dir.to_str().unwrap());
            for mid in ["a", "b"] {
                backend.push(&def, &mut queued_row(&def, mid)).unwrap();
            }
        }
        let backend = FileQueueBackend::new(dir.to_str().unwrap());
        let mut row = queued_row(&def, "c");
        let id = backend.push(&def, &mut row).unwrap();
        assert_eq!(id, 3);
        let got = backend.get(&def, 2).unwrap().unwrap();
        assert_eq!(got.get("MESSAGEID"), "b");
        let first = backend.pop(&def).unwrap().unwrap();
        assert_eq!(first.get("MESSAGEID"), "a");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn non_transport_pop_returns_newest() {
        let dir = temp_dir("rcv");
        let backend = FileQueueBackend::new(dir.to_str().unwrap());
        let def = receive_def();
        for mid in ["one", "two"] {
            let mut row = QueueRow::new(def.qtype.clone());
            row.set("MESSAGEID", mid);
            backend.push(&def, &mut row).unwrap();
        }
        let top = backend.pop(&def).unwrap().unwrap();
        assert_eq!(top.get("MESSAGEID"), "two");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn next_and_prev_walk_live_rows() {
        let dir = temp_dir("walk");
        let backend = FileQueueBackend::new(dir.to_str().unwrap());
        let def = receive_def();
        for mid in ["one", "two", "three"] {
            let mut row = QueueRow::new(def.qtype.clone());
            row.set("MESSAGEID", mid);
            backend.push(&def, &mut row).unwrap();
        }
        let first = backend.next_row(&def, 0).unwrap().unwrap();
        assert_eq!(first.rowid, 1);
        let second = backend.next_row(&def, first.rowid).unwrap().unwrap();
        assert_eq!(second.rowid, 2);
        let last = backend.prev_row(&def, 0).unwrap().unwrap();
        assert_eq!(last.rowid, 3);
        let mid = backend.prev_row(&def, 3).unwrap().unwrap();
        assert_eq!(mid.rowid, 2);
        assert!(backend.next_row(&def, 3).unwrap().is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn tabs_in_values_are_flattened() {
        let dir = temp_dir("tabs");
        let backend = FileQueueBackend::new(dir.to_str().unwrap());
        let def = receive_def();
        let mut row = QueueRow::new(def.qtype.clone());
        row.set("MESSAGEID", "a\tb\nc");
        backend.push(&def, &mut row).unwrap();
        let got = backend.get(&def, 1).unwrap().unwrap();
        assert_eq!(got.get("MESSAGEID"), "a b c");
        let _ = std::fs::remove_dir_all(dir);
    }
}
