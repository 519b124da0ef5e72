/*
 * payload.rs
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

//! The payload MIME part.
//!
//! Outbound: a file becomes either a base64 `application/octet-stream`
//! part or, when the folder map configures encryption, a `text/xml` part
//! holding the encryption envelope. Inbound: the reverse, with a
//! PHINMS-compatible fallback that stores an undecryptable envelope
//! verbatim rather than dropping the message.

use std::fmt;
use std::path::Path;

use tracing::{info, warn};

use crate::crypto::envelope;
use crate::crypto::Algorithm;
use crate::mime::{self, Mime};
use crate::xml::Xml;

/// Failure text that flows into the acknowledgment status fields, so the
/// wording is part of the wire behavior.
#[derive(Debug)]
pub struct PayloadError(String);

impl PayloadError {
    fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PayloadError {}

/// Encryption profile from a folder or service map.
#[derive(Debug, Clone, Default)]
pub struct EncryptionProfile {
    /// Certificate (outbound) or private key (inbound) location.
    pub unc: String,
    /// Distinguished name to pin, empty to accept and report.
    pub id: String,
    pub password: String,
    /// Algorithm name; empty means the default (3DES outbound).
    pub algorithm: String,
}

impl EncryptionProfile {
    pub fn is_configured(&self) -> bool {
        !self.unc.is_empty()
    }
}

/// A processed inbound payload.
#[derive(Debug)]
pub struct Payload {
    pub name: String,
    pub data: Vec<u8>,
    pub encrypted: bool,
}

/// Build the payload part for `data`. The Content-ID carries the queued
/// payload file name (it must match the manifest reference); the
/// disposition carries `dest_name`, the name the receiver will store
/// under.
pub fn create(
    data: &[u8],
    file_name: &str,
    dest_name: &str,
    org: &str,
    encryption: &EncryptionProfile,
) -> Result<Mime, PayloadError> {
    if data.is_empty() {
        return Err(PayloadError::new("empty payload"));
    }
    let base = base_name(file_name);
    let dest = if dest_name.is_empty() {
        base
    } else {
        base_name(dest_name)
    };
    let mut part = Mime::new();
    part.set_header(mime::CONTENT_ID, &format!("<{}@{}>", base, org), 0);
    if encryption.is_configured() {
        part.set_header(mime::CONTENT_TYPE, mime::TEXT_XML, 99);
        let algorithm = if encryption.algorithm.is_empty() {
            Algorithm::TripleDes
        } else {
            Algorithm::parse(&encryption.algorithm).ok_or_else(|| {
                PayloadError::new(format!("unknown encryption type {}", encryption.algorithm))
            })?
        };
        let xml = envelope::encrypt(
            data,
            Path::new(&encryption.unc),
            &encryption.password,
            &encryption.id,
            algorithm,
        )
        .map_err(|e| PayloadError::new(format!("can't build encryption envelope: {}", e)))?;
        part.set_header(
            mime::CONTENT_DISPOSITION,
            &format!("attachment; name=\"{}\"", dest),
            99,
        );
        part.set_body(xml.format().into_bytes());
    } else {
        part.set_header(mime::CONTENT_TYPE, mime::OCTET_STREAM, 99);
        part.set_header(mime::CONTENT_ENCODING, mime::BASE64, 99);
        part.set_header(
            mime::CONTENT_DISPOSITION,
            &format!("attachment; name=\"{}\"", dest),
            99,
        );
        part.set_body(envelope::base64_wrapped(data).into_bytes());
    }
    Ok(part)
}

/// Unpack an inbound payload part, decrypting when it carries an
/// envelope. `expected_dn` is filled with the KeyName when it arrives
/// empty.
pub fn process(
    part: &Mime,
    encryption: &EncryptionProfile,
    expected_dn: &mut String,
) -> Result<Payload, PayloadError> {
    let name = disposition_name(part)
        .ok_or_else(|| PayloadError::new("Missing Payload DISPOSITION"))?;
    let Some(content_type) = part.header(mime::CONTENT_TYPE) else {
        // no declared type: taken verbatim
        return Ok(Payload {
            name,
            data: part.body().to_vec(),
            encrypted: false,
        });
    };
    if content_type.contains(mime::TEXT_XML) {
        let text = String::from_utf8_lossy(part.body());
        let xml = Xml::parse(&text).map_err(|_| PayloadError::new("Malformed Payload"))?;
        match envelope::decrypt(
            &xml,
            Path::new(&encryption.unc),
            &encryption.password,
            expected_dn,
        ) {
            Ok(data) => {
                info!("payload decryption for {} successful", name);
                Ok(Payload {
                    name,
                    data,
                    encrypted: true,
                })
            }
            Err(e) => {
                // PHINMS stores the envelope itself when it can't decrypt
                warn!("failed to decrypt payload for {}: {}", name, e);
                Ok(Payload {
                    name,
                    data: xml.format().into_bytes(),
                    encrypted: true,
                })
            }
        }
    } else if content_type.to_ascii_lowercase().contains("octet-stream") {
        let encoding = part.header(mime::CONTENT_ENCODING).unwrap_or("");
        if !encoding.trim().eq_ignore_ascii_case(mime::BASE64) {
            return Err(PayloadError::new("Unknown payload encoding"));
        }
        let text = String::from_utf8_lossy(part.body());
        let data = envelope::base64_unwrapped(&text)
            .map_err(|_| PayloadError::new("Malformed base64 payload"))?;
        Ok(Payload {
            name,
            data,
            encrypted: false,
        })
    } else {
        Err(PayloadError::new("Unsupported payload Content-Type"))
    }
}

/// File name from `Content-Disposition: attachment; name="..."`.
fn disposition_name(part: &Mime) -> Option<String> {
    let disposition = part.header(mime::CONTENT_DISPOSITION)?;
    let open = disposition.find('"')? + 1;
    let rest = &disposition[open..];
    let close = rest.find('"')?;
    Some(rest[..close].to_string())
}

fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleartext_round_trip() {
        let profile = EncryptionProfile::default();
        let part = create(b"hello", "/drop/hello.1234", "hello", "lab.org", &profile).unwrap();
        assert_eq!(part.header(mime::CONTENT_TYPE), Some(mime::OCTET_STREAM));
        assert_eq!(part.header(mime::CONTENT_ENCODING), Some(mime::BASE64));
        assert_eq!(part.header(mime::CONTENT_ID), Some("<hello.1234@lab.org>"));
        let mut dn = String::new();
        let payload = process(&part, &profile, &mut dn).unwrap();
        assert_eq!(payload.name, "hello");
        assert_eq!(payload.data, b"hello");
        assert!(!payload.encrypted);
    }

    #[test]
    fn empty_payload_rejected() {
        let profile = EncryptionProfile::default();
        assert!(create(b"", "x", "x", "org", &profile).is_err());
    }

    #[test]
    fn missing_disposition_is_reported() {
        let mut part = Mime::new();
        part.set_header(mime::CONTENT_TYPE, mime::OCTET_STREAM, 0);
        part.set_header(mime::CONTENT_ENCODING, mime::BASE64, 1);
        part.set_body(b"aGk=".to_vec());
        let mut dn = String::new();
        let err = process(&part, &EncryptionProfile::default(), &mut dn).unwrap_err();
        assert_eq!(err.to_string(), "Missing Payload DISPOSITION");
    }

    #[test]
    fn unsupported_content_type_is_reported() {
        let mut part = Mime::new();
        part.set_header(mime::CONTENT_TYPE, "image/png", 0);
        part.set_header(mime::CONTENT_DISPOSITION, "attachment; name=\"x\"", 1);
        part.set_body(vec![1, 2, 3]);
        let mut dn = String::new();
        let err = process(&part, &EncryptionProfile::default(), &mut dn).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported payload Content-Type");
    }

    #[test]
    fn undecryptable_envelope_stored_verbatim() {
        // a well-formed envelope pointing at a key that does not exist
        let mut part = Mime::new();
        part.set_header(mime::CONTENT_TYPE, mime::TEXT_XML, 0);
        part.set_header(mime::CONTENT_DISPOSITION, "attachment; name=\"enc\"", 1);
        let body = "<EncryptedData><KeyInfo><EncryptedKey><CipherData><CipherValue>aGk=</CipherValue></CipherData></EncryptedKey></KeyInfo><CipherData><CipherValue>aGk=</CipherValue></CipherData></EncryptedData>";
        part.set_body(body.as_bytes().to_vec());
        let profile = EncryptionProfile {
            unc: "/no/such/key.pem".into(),
            ..Default::default()
        };
        let mut dn = String::new();
        let payload = process(&part, &profile, &mut dn).unwrap();
        assert!(payload.encrypted);
        assert!(String::from_utf8_lossy(&payload.data).contains("EncryptedData"));
    }
}
