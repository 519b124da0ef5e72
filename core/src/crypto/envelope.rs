/*
 * envelope.rs
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

//! The hybrid encryption envelope: a symmetric-encrypted payload and the
//! RSA-wrapped symmetric key, both base64 with 76-column lines, bound to
//! the certificate identity through KeyName (the subject DN).

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::cipher::{self, Algorithm};
use super::keys;
use super::CryptoError;
use crate::xml::Xml;

const DN_PATH: &str = "EncryptedData.KeyInfo.EncryptedKey.KeyInfo.KeyName";
const KEY_PATH: &str = "EncryptedData.KeyInfo.EncryptedKey.CipherData.CipherValue";
const DATA_PATH: &str = "EncryptedData.CipherData.CipherValue";
const METHOD_PATH: &str = "EncryptedData.EncryptionMethod";
const KEY_METHOD_PATH: &str = "EncryptedData.KeyInfo.EncryptedKey.EncryptionMethod";

const TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?><EncryptedData Id="ed1" Type="http://www.w3.org/2001/04/xmlenc#Element" xmlns="http://www.w3.org/2001/04/xmlenc#"><EncryptionMethod Algorithm="http://www.w3.org/2001/04/xmlenc#tripledes-cbc"/><KeyInfo xmlns="http://www.w3.org/2000/09/xmldsig#"><EncryptedKey xmlns="http://www.w3.org/2001/04/xmlenc#"><EncryptionMethod Algorithm="http://www.w3.org/2001/04/xmlenc#rsa-1_5"/><KeyInfo xmlns="http://www.w3.org/2000/09/xmldsig#"><KeyName>key</KeyName></KeyInfo><CipherData><CipherValue/></CipherData></EncryptedKey></KeyInfo><CipherData><CipherValue/></CipherData></EncryptedData>"#;

/// Base64 with line breaks every 76 characters, as peers expect.
pub fn base64_wrapped(data: &[u8]) -> String {
    let flat = STANDARD.encode(data);
    let mut out = String::with_capacity(flat.len() + flat.len() / 76 + 1);
    let bytes = flat.as_bytes();
    for chunk in bytes.chunks(76) {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
    }
    out
}

/// Decode base64 that may carry line breaks and surrounding whitespace.
pub fn base64_unwrapped(text: &str) -> Result<Vec<u8>, CryptoError> {
    let flat: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(flat.as_bytes())
        .map_err(|e| CryptoError::new(format!("base64 decode: {}", e)))
}

/// Encrypt a payload into an envelope document.
///
/// The certificate at `cert_path` supplies the wrapping key and the
/// KeyName. When `expected_dn` is non-empty it is recorded instead of the
/// certificate subject, matching how operators pin an identity.
pub fn encrypt(
    plain: &[u8],
    cert_path: &Path,
    password: &str,
    expected_dn: &str,
    algorithm: Algorithm,
) -> Result<Xml, CryptoError> {
    let cert = keys::load_certificate(cert_path, password)?;
    let key = algorithm.generate_key()?;
    let enc = cipher::encrypt(algorithm, &key, plain)?;
    let wrapped = keys::rsa_encrypt(&cert, &key)?;

    let mut xml = Xml::parse(TEMPLATE).map_err(|e| CryptoError::new(e.to_string()))?;
    let set = |xml: &mut Xml, path: &str, value: &str| {
        xml.set_text(path, value)
            .map_err(|e| CryptoError::new(e.to_string()))
    };
    xml.set_attribute(METHOD_PATH, "Algorithm", &algorithm.uri())
        .map_err(|e| CryptoError::new(e.to_string()))?;
    set(&mut xml, DATA_PATH, &base64_wrapped(&enc))?;
    set(&mut xml, KEY_PATH, &base64_wrapped(&wrapped))?;
    let dn = if expected_dn.is_empty() {
        cert.subject_dn.as_str()
    } else {
        expected_dn
    };
    set(&mut xml, DN_PATH, dn)?;
    Ok(xml)
}

/// Decrypt an envelope document with the private key at `key_path`.
///
/// `expected_dn` works both ways: when it holds a value the envelope's
/// KeyName must match; when empty it receives the KeyName found.
pub fn decrypt(
    envelope: &Xml,
    key_path: &Path,
    password: &str,
    expected_dn: &mut String,
) -> Result<Vec<u8>, CryptoError> {
    let key_name = envelope.get(DN_PATH);
    if expected_dn.is_empty() {
        *expected_dn = key_name.to_string();
    } else if expected_dn != key_name {
        return Err(CryptoError::new(format!(
            "envelope KeyName '{}' does not match expected '{}'",
            key_name, expected_dn
        )));
    }
    let algorithm = envelope
        .attribute(METHOD_PATH, "Algorithm")
        .and_then(Algorithm::parse)
        .unwrap_or(Algorithm::TripleDes);

    let wrapped = envelope
        .get_text(KEY_PATH)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CryptoError::new("envelope has no cipher key"))?;
    let wrapped = base64_unwrapped(wrapped)?;
    let private = keys::load_private_key(key_path, password)?;
    let sym_key = keys::rsa_decrypt(&private, &wrapped)?;

    let data = envelope
        .get_text(DATA_PATH)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CryptoError::new("envelope has no cipher payload"))?;
    let data = base64_unwrapped(data)?;
    cipher::decrypt(algorithm, &sym_key, &data)
}

/// The key-wrapping method recorded in every envelope.
pub fn key_wrap_uri(envelope: &Xml) -> &str {
    envelope
        .attribute(KEY_METHOD_PATH, "Algorithm")
        .unwrap_or("")
}
