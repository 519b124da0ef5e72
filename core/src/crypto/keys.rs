/*
 * keys.rs
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

//! X.509 identity material. Certificate and private-key files are
//! auto-detected as PEM, then DER, then PKCS12; the password applies to
//! PKCS12 stores. The subject DN is rendered PHINMS style: attributes in
//! reverse document order, comma separated, names uppercased.

use std::path::Path;

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use x509_parser::prelude::{FromDer, X509Certificate};

use super::CryptoError;

/// A loaded certificate: the RSA public key and the normalized subject DN.
#[derive(Debug)]
pub struct Certificate {
    pub public_key: RsaPublicKey,
    pub subject_dn: String,
    /// Raw DER, kept for TLS contexts.
    pub der: Vec<u8>,
}

/// Load a certificate, trying PEM, DER, then PKCS12.
pub fn load_certificate(path: &Path, password: &str) -> Result<Certificate, CryptoError> {
    let raw = std::fs::read(path)
        .map_err(|e| CryptoError::new(format!("can't read certificate {}: {}", path.display(), e)))?;
    let der = certificate_der(&raw, password).ok_or_else(|| {
        CryptoError::new(format!(
            "can't read certificate from {} (tried PEM, DER, PKCS12)",
            path.display()
        ))
    })?;
    certificate_from_der(der)
}

fn certificate_from_der(der: Vec<u8>) -> Result<Certificate, CryptoError> {
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| CryptoError::new(format!("certificate parse: {}", e)))?;
    let subject_dn = subject_dn(&cert);
    let spki = cert.public_key();
    let public_key = RsaPublicKey::from_pkcs1_der(&spki.subject_public_key.data)
        .map_err(|e| CryptoError::new(format!("certificate public key is not RSA: {}", e)))?;
    Ok(Certificate {
        public_key,
        subject_dn,
        der,
    })
}

/// The certificate chain as raw DER, for TLS use. A PEM file may carry a
/// whole chain; DER and PKCS12 files yield what they contain.
pub fn load_certificate_chain(path: &Path, password: &str) -> Result<Vec<Vec<u8>>, CryptoError> {
    let raw = std::fs::read(path)
        .map_err(|e| CryptoError::new(format!("can't read certificate {}: {}", path.display(), e)))?;
    let pem_chain: Vec<Vec<u8>> = rustls_pemfile::certs(&mut &raw[..])
        .filter_map(|c| c.ok())
        .map(|c| c.to_vec())
        .collect();
    if !pem_chain.is_empty() {
        return Ok(pem_chain);
    }
    if X509Certificate::from_der(&raw).is_ok() {
        return Ok(vec![raw]);
    }
    if let Ok(pfx) = p12::PFX::parse(&raw) {
        if let Ok(certs) = pfx.cert_x509_bags(password) {
            if !certs.is_empty() {
                return Ok(certs);
            }
        }
    }
    Err(CryptoError::new(format!(
        "can't read certificate chain from {}",
        path.display()
    )))
}

fn certificate_der(raw: &[u8], password: &str) -> Option<Vec<u8>> {
    // PEM
    if let Some(Ok(cert)) = rustls_pemfile::certs(&mut &raw[..]).next() {
        return Some(cert.to_vec());
    }
    // DER
    if X509Certificate::from_der(raw).is_ok() {
        return Some(raw.to_vec());
    }
    // PKCS12
    let pfx = p12::PFX::parse(raw).ok()?;
    pfx.cert_x509_bags(password).ok()?.into_iter().next()
}

/// Load an RSA private key, trying PEM (PKCS#8 or PKCS#1), DER, then
/// PKCS12.
pub fn load_private_key(path: &Path, password: &str) -> Result<RsaPrivateKey, CryptoError> {
    let raw = std::fs::read(path)
        .map_err(|e| CryptoError::new(format!("can't read key {}: {}", path.display(), e)))?;
    if let Ok(text) = std::str::from_utf8(&raw) {
        if text.contains("-----BEGIN") {
            if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(text) {
                return Ok(key);
            }
            if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(text) {
                return Ok(key);
            }
        }
    }
    if let Ok(key) = RsaPrivateKey::from_pkcs8_der(&raw) {
        return Ok(key);
    }
    if let Ok(key) = RsaPrivateKey::from_pkcs1_der(&raw) {
        return Ok(key);
    }
    if let Ok(pfx) = p12::PFX::parse(&raw) {
        if let Ok(bags) = pfx.key_bags(password) {
            for der in bags {
                if let Ok(key) = RsaPrivateKey::from_pkcs8_der(&der) {
                    return Ok(key);
                }
            }
        }
    }
    Err(CryptoError::new(format!(
        "can't read private key from {} (tried PEM, DER, PKCS12)",
        path.display()
    )))
}

/// The private key as DER bytes for TLS contexts (PKCS#8 or PKCS#1 PEM,
/// raw DER, or PKCS12 shrouded bags).
pub fn load_private_key_der(path: &Path, password: &str) -> Result<Vec<u8>, CryptoError> {
    let raw = std::fs::read(path)
        .map_err(|e| CryptoError::new(format!("can't read key {}: {}", path.display(), e)))?;
    let mut cursor = &raw[..];
    while let Some(Ok(item)) = rustls_pemfile::read_one(&mut cursor).transpose() {
        match item {
            rustls_pemfile::Item::Pkcs8Key(k) => return Ok(k.secret_pkcs8_der().to_vec()),
            rustls_pemfile::Item::Pkcs1Key(k) => return Ok(k.secret_pkcs1_der().to_vec()),
            rustls_pemfile::Item::Sec1Key(k) => return Ok(k.secret_sec1_der().to_vec()),
            _ => {}
        }
    }
    if RsaPrivateKey::from_pkcs8_der(&raw).is_ok() || RsaPrivateKey::from_pkcs1_der(&raw).is_ok() {
        return Ok(raw);
    }
    if let Ok(pfx) = p12::PFX::parse(&raw) {
        if let Ok(bags) = pfx.key_bags(password) {
            if let Some(der) = bags.into_iter().next() {
                return Ok(der);
            }
        }
    }
    Err(CryptoError::new(format!(
        "can't read private key from {}",
        path.display()
    )))
}

/// RSA-encrypt a symmetric key under a certificate's public key.
pub fn rsa_encrypt(cert: &Certificate, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut rng = rand::thread_rng();
    cert.public_key
        .encrypt(&mut rng, Pkcs1v15Encrypt, plain)
        .map_err(|e| CryptoError::new(format!("rsa encrypt: {}", e)))
}

/// RSA-decrypt a wrapped symmetric key.
pub fn rsa_decrypt(key: &RsaPrivateKey, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
    key.decrypt(Pkcs1v15Encrypt, cipher)
        .map_err(|e| CryptoError::new(format!("rsa decrypt: {}", e)))
}

/// Subject attribute short names. Unknown types fall back to the dotted
/// OID, uppercased like the rest.
fn attribute_abbrev(oid: &str) -> &str {
    match oid {
        "2.5.4.3" => "CN",
        "2.5.4.4" => "SN",
        "2.5.4.5" => "SERIALNUMBER",
        "2.5.4.6" => "C",
        "2.5.4.7" => "L",
        "2.5.4.8" => "ST",
        "2.5.4.9" => "STREET",
        "2.5.4.10" => "O",
        "2.5.4.11" => "OU",
        "2.5.4.12" => "TITLE",
        "2.5.4.42" => "GIVENNAME",
        "0.9.2342.19200300.100.1.25" => "DC",
        "0.9.2342.19200300.100.1.1" => "UID",
        "1.2.840.113549.1.9.1" => "EMAILADDRESS",
        other => other,
    }
}

/// One-line subject DN: document order reversed (CN first for typical
/// certificates), `NAME=value` joined by ", ".
pub fn subject_dn(cert: &X509Certificate<'_>) -> String {
    let mut items: Vec<String> = Vec::new();
    for attr in cert.subject().iter_attributes() {
        let oid = attr.attr_type().to_id_string();
        let value = attr.as_str().unwrap_or_default();
        items.push(format!("{}={}", attribute_abbrev(&oid), value));
    }
    items.reverse();
    items.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abbrevs_cover_common_subject_attributes() {
        assert_eq!(attribute_abbrev("2.5.4.3"), "CN");
        assert_eq!(attribute_abbrev("2.5.4.10"), "O");
        assert_eq!(attribute_abbrev("1.2.840.113549.1.9.1"), "EMAILADDRESS");
        assert_eq!(attribute_abbrev("1.2.3.4"), "1.2.3.4");
    }

    #[test]
    fn rsa_wrap_round_trip() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = RsaPublicKey::from(&private);
        let cert = Certificate {
            public_key: public,
            subject_dn: String::new(),
            der: Vec::new(),
        };
        let key = b"0123456789abcdef01234567";
        let wrapped = rsa_encrypt(&cert, key).unwrap();
        assert_ne!(&wrapped[..], &key[..]);
        let unwrapped = rsa_decrypt(&private, &wrapped).unwrap();
        assert_eq!(&unwrapped[..], &key[..]);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_certificate(Path::new("/no/such/cert.pem"), "").unwrap_err();
        assert!(err.to_string().contains("/no/such/cert.pem"));
    }
}
