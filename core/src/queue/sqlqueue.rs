/*
 * sqlqueue.rs
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

//! SQL-backed queues: one table per queue, column names matching the
//! registered field names. On first use the table is created when absent
//! and the column layout is compared against the type; fields without a
//! column are tolerated and logged. Transport pop selects
//! `min(id) where TRANSPORTSTATUS='queued' and id > cursor`; other
//! queues pop `max(id)`. The transport cursor lives in memory, like the
//! row index of the file backend.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, warn};

use super::{QueueBackend, QueueDef, QueueError, QueueRow};

const TRANSPORT_FIELD: &str = "TRANSPORTSTATUS";
const QUEUED: &str = "queued";

pub struct SqlQueueBackend {
    conn: Mutex<Connection>,
    /// Tables already created/verified this run.
    ready: Mutex<HashSet<String>>,
    /// Next-pop cursor per transport-bearing queue.
    cursors: Mutex<HashMap<String, i64>>,
}

fn sql_err(e: rusqlite::Error) -> QueueError {
    QueueError::new(format!("sql queue: {}", e))
}

/// Double-quoted SQL identifier.
fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl SqlQueueBackend {
    /// Open (or create) the database at `path`.
    pub fn open(path: &str) -> Result<Self, QueueError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)
            .map_err(|e| QueueError::new(format!("can't open queue db {}: {}", path, e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
            ready: Mutex::new(HashSet::new()),
            cursors: Mutex::new(HashMap::new()),
        })
    }

    /// In-memory database, for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            ready: Mutex::new(HashSet::new()),
            cursors: Mutex::new(HashMap::new()),
        })
    }

    /// Create the table when missing and report fields with no backing
    /// column.
    fn ensure_table(&self, conn: &Connection, q: &QueueDef) -> Result<(), QueueError> {
        {
            let ready = self.ready.lock().expect("sqlq ready lock");
            if ready.contains(&q.table) {
                return Ok(());
            }
        }
        let mut columns: Vec<String> = Vec::new();
        for (i, field) in q.qtype.fields.iter().enumerate() {
            if i == 0 {
                columns.push(format!("{} INTEGER PRIMARY KEY", ident(field)));
            } else {
                columns.push(format!("{} TEXT", ident(field)));
            }
        }
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            ident(&q.table),
            columns.join(", ")
        );
        conn.execute(&create, []).map_err(sql_err)?;

        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", ident(&q.table)))
            .map_err(sql_err)?;
        let existing: HashSet<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(sql_err)?
            .filter_map(|r| r.ok())
            .collect();
        for field in &q.qtype.fields {
            if !existing.contains(field) {
                warn!("table {} has no column for field {}", q.table, field);
            }
        }
        debug!("table {} ready with {} columns", q.table, existing.len());
        self.ready
            .lock()
            .expect("sqlq ready lock")
            .insert(q.table.clone());
        Ok(())
    }

    fn fetch(
        &self,
        conn: &Connection,
        q: &QueueDef,
        rowid: i64,
    ) -> Result<Option<QueueRow>, QueueError> {
        let cols: Vec<String> = q.qtype.fields.iter().map(|f| ident(f)).collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            cols.join(", "),
            ident(&q.table),
            ident(&q.qtype.fields[0])
        );
        let qtype = q.qtype.clone();
        let n = qtype.fields.len();
        conn.query_row(&sql, [rowid], |row| {
            let mut values = Vec::with_capacity(n);
            for i in 0..n {
                let v: Option<String> = match row.get::<_, Option<i64>>(i) {
                    Ok(num) => num.map(|x| x.to_string()),
                    Err(_) => row.get(i)?,
                };
                values.push(v.unwrap_or_default());
            }
            Ok(values)
        })
        .optional()
        .map_err(sql_err)
        .map(|opt| opt.map(|values| QueueRow::from_values(qtype, values)))
    }

    fn select_id(&self, conn: &Connection, sql: &str) -> Result<Option<i64>, QueueError> {
        conn.query_row(sql, [], |row| row.get::<_, Option<i64>>(0))
            .optional()
            .map_err(sql_err)
            .map(|opt| opt.flatten())
    }
}

impl QueueBackend for SqlQueueBackend {
    fn push(&self, q: &QueueDef, row: &mut QueueRow) -> Result<i64, QueueError> {
        let conn = self.conn.lock().expect("sqlq lock");
        self.ensure_table(&conn, q)?;
        let id_col = ident(&q.qtype.fields[0]);
        let table = ident(&q.table);
        if row.rowid == 0 {
            let next = self
                .select_id(&conn, &format!("SELECT MAX({}) FROM {}", id_col, table))?
                .unwrap_or(0)
                + 1;
            row.set_rowid(next);
            let cols: Vec<String> = q.qtype.fields.iter().map(|f| ident(f)).collect();
            let marks: Vec<String> = (1..=cols.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                cols.join(", "),
                marks.join(", ")
            );
            let values = row.values().to_vec();
            let params: Vec<&dyn rusqlite::ToSql> =
                values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
            conn.execute(&sql, params.as_slice()).map_err(sql_err)?;
        } else {
            let sets: Vec<String> = q.qtype.fields[1..]
                .iter()
                .enumerate()
                .map(|(i, f)| format!("{} = ?{}", ident(f), i + 1))
                .collect();
            let sql = format!(
                "UPDATE {} SET {} WHERE {} = ?{}",
                table,
                sets.join(", "),
                id_col,
                q.qtype.fields.len()
            );
            let values = row.values().to_vec();
            let rowid = row.rowid;
            let mut params: Vec<&dyn rusqlite::ToSql> = values[1..]
                .iter()
                .map(|v| v as &dyn rusqlite::ToSql)
                .collect();
            params.push(&rowid);
            let changed = conn.execute(&sql, params.as_slice()).map_err(sql_err)?;
            if changed == 0 {
                // update of a row that never landed: insert it instead
                let cols: Vec<String> = q.qtype.fields.iter().map(|f| ident(f)).collect();
                let marks: Vec<String> = (1..=cols.len()).map(|i| format!("?{}", i)).collect();
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table,
                    cols.join(", "),
                    marks.join(", ")
                );
                let params: Vec<&dyn rusqlite::ToSql> =
                    values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
                conn.execute(&sql, params.as_slice()).map_err(sql_err)?;
            }
        }
        Ok(row.rowid)
    }

    fn pop(&self, q: &QueueDef) -> Result<Option<QueueRow>, QueueError> {
        let conn = self.conn.lock().expect("sqlq lock");
        self.ensure_table(&conn, q)?;
        let id_col = ident(&q.qtype.fields[0]);
        let table = ident(&q.table);
        if q.qtype.is_transport() {
            let cursor = *self
                .cursors
                .lock()
                .expect("sqlq cursor lock")
                .get(&q.name)
                .unwrap_or(&0);
            let sql = format!(
                "SELECT MIN({}) FROM {} WHERE {} = '{}' AND {} > {}",
                id_col,
                table,
                ident(TRANSPORT_FIELD),
                QUEUED,
                id_col,
                cursor
            );
            let Some(id) = self.select_id(&conn, &sql)? else {
                return Ok(None);
            };
            self.cursors
                .lock()
                .expect("sqlq cursor lock")
                .insert(q.name.clone(), id);
            self.fetch(&conn, q, id)
        } else {
            let sql = format!("SELECT MAX({}) FROM {}", id_col, table);
            match self.select_id(&conn, &sql)? {
                Some(id) => self.fetch(&conn, q, id),
                None => Ok(None),
            }
        }
    }

    fn get(&self, q: &QueueDef, rowid: i64) -> Result<Option<QueueRow>, QueueError> {
        let conn = self.conn.lock().expect("sqlq lock");
        self.ensure_table(&conn, q)?;
        self.fetch(&conn, q, rowid)
    }

    fn next_row(&self, q: &QueueDef, rowid: i64) -> Result<Option<QueueRow>, QueueError> {
        let conn = self.conn.lock().expect("sqlq lock");
        self.ensure_table(&conn, q)?;
        let sql = format!(
            "SELECT MIN({}) FROM {} WHERE {} > {}",
            ident(&q.qtype.fields[0]),
            ident(&q.table),
            ident(&q.qtype.fields[0]),
            rowid
        );
        match self.select_id(&conn, &sql)? {
            Some(id) => self.fetch(&conn, q, id),
            None => Ok(None),
        }
    }

    fn prev_row(&self, q: &QueueDef, rowid: i64) -> Result<Option<QueueRow>, QueueError> {
        let conn = self.conn.lock().expect("sqlq lock");
        self.ensure_table(&conn, q)?;
        let id_col = ident(&q.qtype.fields[0]);
        let sql = if rowid == 0 {
            format!("SELECT MAX({}) FROM {}", id_col, ident(&q.table))
        } else {
            format!(
                "SELECT MAX({}) FROM {} WHERE {} < {}",
                id_col,
                ident(&q.table),
                id_col,
                rowid
            )
        };
        match self.select_id(&conn, &sql)? {
            Some(id) => self.fetch(&conn, q, id),
            None => Ok(None),
        }
    }

    fn close(&self) -> Result<(), QueueError> {
        // the connection closes on drop; flush WAL state eagerly
        let conn = self.conn.lock().expect("sqlq lock");
        conn.execute_batch("PRAGMA optimize").map_err(sql_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueType;
    use std::sync::Arc;

    fn send_def() -> QueueDef {
        let qtype = Arc::new(QueueType::new(
            "EbXmlSndQ",
            &["RECORDID", "MESSAGEID", "TRANSPORTSTATUS"],
        ));
        QueueDef {
            name: "SendQ".into(),
            table: "SendQ".into(),
            qtype,
        }
    }

    fn queued_row(def: &QueueDef, mid: &str) -> QueueRow {
        let mut row = QueueRow::new(def.qtype.clone());
        row.set("MESSAGEID", mid);
        row.set("TRANSPORTSTATUS", "queued");
        row
    }

    #[test]
    fn insert_update_and_get() {
        let backend = SqlQueueBackend::open_in_memory().unwrap();
        let def = send_def();
        let mut row = queued_row(&def, "m1");
        let id = backend.push(&def, &mut row).unwrap();
        assert_eq!(id, 1);
        row.set("TRANSPORTSTATUS", "attempted");
        backend.push(&def, &mut row).unwrap();
        let got = backend.get(&def, 1).unwrap().unwrap();
        assert_eq!(got.get("TRANSPORTSTATUS"), "attempted");
        assert!(backend.get(&def, 9).unwrap().is_none());
    }

    #[test]
    fn transport_pop_advances_cursor() {
        let backend = SqlQueueBackend::open_in_memory().unwrap();
        let def = send_def();
        for mid in ["a", "b"] {
            backend.push(&def, &mut queued_row(&def, mid)).unwrap();
        }
        let first = backend.pop(&def).unwrap().unwrap();
        assert_eq!(first.get("MESSAGEID"), "a");
        let second = backend.pop(&def).unwrap().unwrap();
        assert_eq!(second.get("MESSAGEID"), "b");
        assert!(backend.pop(&def).unwrap().is_none());
    }

    #[test]
    fn pop_skips_non_queued_rows() {
        let backend = SqlQueueBackend::open_in_memory().unwrap();
        let def = send_def();
        let mut done = queued_row(&def, "done");
        backend.push(&def, &mut done).unwrap();
        done.set("TRANSPORTSTATUS", "success");
        backend.push(&def, &mut done).unwrap();
        let mut live = queued_row(&def, "live");
        backend.push(&def, &mut live).unwrap();
        let popped = backend.pop(&def).unwrap().unwrap();
        assert_eq!(popped.get("MESSAGEID"), "live");
    }

    #[test]
    fn non_transport_pop_returns_max() {
        let backend = SqlQueueBackend::open_in_memory().unwrap();
        let qtype = Arc::new(QueueType::new("EbXmlRcvQ", &["RECORDID", "MESSAGEID"]));
        let def = QueueDef {
            name: "RcvQ".into(),
            table: "RcvQ".into(),
            qtype,
        };
        for mid in ["one", "two"] {
            let mut row = QueueRow::new(def.qtype.clone());
            row.set("MESSAGEID", mid);
            backend.push(&def, &mut row).unwrap();
        }
        let top = backend.pop(&def).unwrap().unwrap();
        assert_eq!(top.get("MESSAGEID"), "two");
        // non-transport pop has no cursor: the same row tops again
        let again = backend.pop(&def).unwrap().unwrap();
        assert_eq!(again.rowid, top.rowid);
    }

    #[test]
    fn next_prev_navigation() {
        let backend = SqlQueueBackend::open_in_memory().unwrap();
        let def = send_def();
        for mid in ["a", "b", "c"] {
            backend.push(&def, &mut queued_row(&def, mid)).unwrap();
        }
        assert_eq!(backend.next_row(&def, 0).unwrap().unwrap().rowid, 1);
        assert_eq!(backend.next_row(&def, 1).unwrap().unwrap().rowid, 2);
        assert_eq!(backend.prev_row(&def, 0).unwrap().unwrap().rowid, 3);
        assert_eq!(backend.prev_row(&def, 2).unwrap().unwrap().rowid, 1);
        assert!(backend.next_row(&def, 3).unwrap().is_none());
    }
}
