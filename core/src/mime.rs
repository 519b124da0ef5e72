/*
 * mime.rs
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

//! multipart/related in the ebXML profile: an outer entity whose headers
//! double as the HTTP header block, plus ordered parts separated by
//! `\n--boundary` markers and terminated by `\n--boundary--`.
//!
//! Headers keep document order; Content-Length is recomputed when a body
//! is set and again when the message is formatted.

use std::fmt;

use rand::Rng;

pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_ID: &str = "Content-ID";
pub const CONTENT_DISPOSITION: &str = "Content-Disposition";
pub const CONTENT_ENCODING: &str = "Content-Transfer-Encoding";
pub const TEXT_XML: &str = "text/xml";
pub const OCTET_STREAM: &str = "application/octet-stream";
pub const BASE64: &str = "base64";
pub const MULTIPART_RELATED: &str = "multipart/related";

#[derive(Debug)]
pub struct MimeError(String);

impl MimeError {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for MimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MimeError {}

/// One MIME entity. For a multipart the body holds any preamble and the
/// parts hold the pieces.
#[derive(Debug, Default)]
pub struct Mime {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    parts: Vec<Mime>,
}

impl Mime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set (replace) a header, inserting at `pos` when new; a large pos
    /// appends.
    pub fn set_header(&mut self, name: &str, value: &str, pos: usize) {
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            slot.1 = value.to_string();
            return;
        }
        let at = pos.min(self.headers.len());
        self.headers.insert(at, (name.to_string(), value.to_string()));
    }

    pub fn content_length(&self) -> usize {
        self.header(CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
        self.set_header(CONTENT_LENGTH, &self.body.len().to_string(), 1);
    }

    pub fn parts(&self) -> &[Mime] {
        &self.parts
    }

    /// Parts are indexed from 1, matching the protocol descriptions
    /// ("part 1 is the SOAP envelope").
    pub fn part(&self, index: usize) -> Option<&Mime> {
        if index == 0 {
            return None;
        }
        self.parts.get(index - 1)
    }

    /// Make this entity a multipart/related container. `attributes` is
    /// spliced between the media type and the generated boundary, e.g.
    /// `type="text/xml"; start="ebxml-envelope@org";`.
    pub fn set_multipart(&mut self, attributes: &str, tsec: i64) {
        let boundary = format!("_Part_{}_{}", tsec, rand::thread_rng().gen::<u32>());
        let value = format!(
            "{}; {} boundary=\"{}\"",
            MULTIPART_RELATED, attributes, boundary
        );
        self.set_header(CONTENT_TYPE, &value, 0);
    }

    pub fn add_part(&mut self, part: Mime) {
        self.parts.push(part);
    }

    /// The boundary string, when this entity is a multipart.
    pub fn boundary(&self) -> Option<&str> {
        let ct = self.header(CONTENT_TYPE)?;
        if !ct
            .trim_start()
            .to_ascii_lowercase()
            .starts_with(MULTIPART_RELATED)
        {
            return None;
        }
        let at = ct.find("boundary=\"")? + 10;
        let rest = &ct[at..];
        let end = rest.find('"')?;
        Some(&rest[..end])
    }

    /// Serialize: headers, blank line, body, then each part behind its
    /// boundary marker and the closing marker. Content-Length covers
    /// everything after the blank line.
    pub fn format(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.body.len() + 256);
        payload.extend_from_slice(&self.body);
        if let Some(boundary) = self.boundary().map(str::to_string) {
            for part in &self.parts {
                payload.extend_from_slice(b"\r\n--");
                payload.extend_from_slice(boundary.as_bytes());
                payload.extend_from_slice(b"\r\n");
                payload.extend_from_slice(&part.format());
            }
            payload.extend_from_slice(b"\r\n--");
            payload.extend_from_slice(boundary.as_bytes());
            payload.extend_from_slice(b"--\r\n");
        }
        let mut out = Vec::with_capacity(payload.len() + 256);
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case(CONTENT_LENGTH) {
                out.extend_from_slice(
                    format!("{}: {}\r\n", CONTENT_LENGTH, payload.len()).as_bytes(),
                );
                continue;
            }
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        if self.header(CONTENT_LENGTH).is_none() {
            out.extend_from_slice(
                format!("{}: {}\r\n", CONTENT_LENGTH, payload.len()).as_bytes(),
            );
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&payload);
        out
    }

    /// Parse an entity: header block to the first blank line, then the
    /// body, recursing into parts when a multipart boundary is declared.
    pub fn parse(input: &[u8]) -> Result<Mime, MimeError> {
        let header_end = find_header_end(input)
            .ok_or_else(|| MimeError::new("end of header block not found"))?;
        let mut entity = Mime::new();
        for line in split_lines(&input[..header_end.0]) {
            let Some((name, value)) = split_header(line) else {
                continue;
            };
            entity.headers.push((
                String::from_utf8_lossy(name).into_owned(),
                String::from_utf8_lossy(value).trim().to_string(),
            ));
        }
        let body = &input[header_end.1..];
        let Some(boundary) = entity.boundary().map(str::to_string) else {
            entity.body = body.to_vec();
            return Ok(entity);
        };
        // multipart: split on \n--boundary markers
        let marker = format!("\n--{}", boundary);
        let mut rest = body;
        let first = find(rest, marker.as_bytes())
            .ok_or_else(|| MimeError::new(format!("boundary '{}' not found", boundary)))?;
        entity.body = trim_trailing_crlf(&rest[..first]).to_vec();
        rest = &rest[first + marker.len()..];
        loop {
            if rest.starts_with(b"--") {
                break; // closing marker
            }
            let rest_body = skip_crlf(rest);
            let end = find(rest_body, marker.as_bytes())
                .ok_or_else(|| MimeError::new("terminating boundary not found"))?;
            let part = Mime::parse(trim_trailing_crlf(&rest_body[..end]))?;
            entity.parts.push(part);
            rest = &rest_body[end + marker.len()..];
        }
        Ok(entity)
    }
}

/// Position of the blank line ending a header block: returns
/// (header bytes length, offset of the body).
pub fn find_header_end(input: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'\n' {
            if input[i + 1..].starts_with(b"\r\n") {
                return Some((i + 1, i + 3));
            }
            if input[i + 1..].starts_with(b"\n") {
                return Some((i + 1, i + 2));
            }
        }
        i += 1;
    }
    None
}

fn split_lines(block: &[u8]) -> impl Iterator<Item = &[u8]> {
    block
        .split(|&b| b == b'\n')
        .map(trim_trailing_crlf)
        .filter(|l| !l.is_empty())
}

fn split_header(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = line.iter().position(|&b| b == b':')?;
    if colon == 0 {
        return None;
    }
    let name = &line[..colon];
    let value = line.get(colon + 1..).unwrap_or(&[]);
    let value = value.strip_prefix(b" ").unwrap_or(value);
    Some((name, value))
}

fn trim_trailing_crlf(s: &[u8]) -> &[u8] {
    let mut end = s.len();
    if end >= 2 && s[end - 2] == b'\r' && s[end - 1] == b'\n' {
        end -= 2;
    } else if end >= 1 && (s[end - 1] == b'\n' || s[end - 1] == b'\r') {
        end -= 1;
    }
    &s[..end]
}

fn skip_crlf(s: &[u8]) -> &[u8] {
    let s = s.strip_prefix(b"\r").unwrap_or(s);
    s.strip_prefix(b"\n").unwrap_or(s)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_entity_round_trip() {
        let mut m = Mime::new();
        m.set_header(CONTENT_TYPE, TEXT_XML, 0);
        m.set_body(b"<a/>".to_vec());
        let bytes = m.format();
        let parsed = Mime::parse(&bytes).unwrap();
        assert_eq!(parsed.header(CONTENT_TYPE), Some(TEXT_XML));
        assert_eq!(parsed.body(), b"<a/>");
        assert_eq!(parsed.content_length(), 4);
    }

    #[test]
    fn multipart_round_trip() {
        let mut soap = Mime::new();
        soap.set_header(CONTENT_ID, "<ebxml-envelope@lab>", 0);
        soap.set_header(CONTENT_TYPE, TEXT_XML, 1);
        soap.set_body(b"<soap/>".to_vec());

        let mut payload = Mime::new();
        payload.set_header(CONTENT_ID, "<file@lab>", 0);
        payload.set_header(CONTENT_TYPE, OCTET_STREAM, 1);
        payload.set_header(CONTENT_ENCODING, BASE64, 2);
        payload.set_body(b"aGVsbG8=".to_vec());

        let mut msg = Mime::new();
        msg.set_multipart("type=\"text/xml\"; start=\"ebxml-envelope@lab\";", 1000);
        msg.set_header("SOAPAction", "\"ebXML\"", 99);
        msg.add_part(soap);
        msg.add_part(payload);

        let bytes = msg.format();
        let parsed = Mime::parse(&bytes).unwrap();
        assert_eq!(parsed.parts().len(), 2);
        assert_eq!(parsed.part(1).unwrap().body(), b"<soap/>");
        assert_eq!(parsed.part(2).unwrap().body(), b"aGVsbG8=");
        assert_eq!(
            parsed.part(2).unwrap().header(CONTENT_ENCODING),
            Some(BASE64)
        );
        assert_eq!(parsed.part(1).unwrap().header(CONTENT_ID), Some("<ebxml-envelope@lab>"));
    }

    #[test]
    fn boundary_extraction() {
        let mut m = Mime::new();
        m.set_multipart("type=\"text/xml\";", 99);
        let b = m.boundary().unwrap().to_string();
        assert!(b.starts_with("_Part_99_"));
    }

    #[test]
    fn content_length_covers_parts() {
        let mut part = Mime::new();
        part.set_header(CONTENT_TYPE, TEXT_XML, 0);
        part.set_body(b"x".to_vec());
        let mut msg = Mime::new();
        msg.set_multipart("type=\"text/xml\";", 5);
        msg.add_part(part);
        let bytes = msg.format();
        let parsed = Mime::parse(&bytes).unwrap();
        let blank = find_header_end(&bytes).unwrap().1;
        assert_eq!(parsed.content_length(), bytes.len() - blank);
    }

    #[test]
    fn missing_terminator_rejected() {
        let raw = b"Content-Type: multipart/related; boundary=\"b\"\r\n\r\n\r\n--b\r\nContent-Type: text/xml\r\n\r\n<x/>\r\n";
        assert!(Mime::parse(raw).is_err());
    }
}
