/*
 * stamp.rs
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

//! Message timestamps and process ids.
//!
//! Timestamps are local time, `YYYY-MM-DDTHH:MM:SS`. Process ids are
//! `<seconds-since-epoch><milliseconds:3>`; the generator bumps the
//! millisecond field on collision so ids are strictly monotonic within
//! the process.

use std::sync::Mutex;

use chrono::Local;

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Current local time in the wire format.
pub fn timestamp() -> String {
    Local::now().format(TIME_FORMAT).to_string()
}

/// Monotonic process-id source. One per runtime.
#[derive(Debug, Default)]
pub struct ProcessId {
    last: Mutex<(i64, u32)>,
}

impl ProcessId {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id: epoch seconds plus a three-digit millisecond field.
    pub fn next(&self) -> String {
        let now = Local::now();
        let mut secs = now.timestamp();
        let mut ms = now.timestamp_subsec_millis() % 1000;
        let mut last = self.last.lock().expect("pid lock");
        if secs < last.0 || (secs == last.0 && ms <= last.1) {
            // clock stalled or stepped back; stay after the previous id
            secs = last.0;
            ms = last.1 + 1;
            if ms > 999 {
                secs += 1;
                ms = 0;
            }
        }
        *last = (secs, ms);
        format!("{}{:03}", secs, ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_shape() {
        let t = timestamp();
        // 2026-08-01T12:34:56
        assert_eq!(t.len(), 19);
        assert_eq!(&t[4..5], "-");
        assert_eq!(&t[10..11], "T");
        assert_eq!(&t[13..14], ":");
    }

    #[test]
    fn pids_strictly_increase() {
        let gen = ProcessId::new();
        let mut prev = gen.next().parse::<u128>().unwrap();
        for _ in 0..1000 {
            let next = gen.next().parse::<u128>().unwrap();
            assert!(next > prev, "{} !> {}", next, prev);
            prev = next;
        }
    }
}
