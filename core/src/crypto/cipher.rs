/*
 * cipher.rs
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

//! Symmetric payload ciphers: 3DES-CBC and AES-128/192/256-CBC, PKCS7
//! padded. The IV is generated fresh per message and carried as the first
//! plaintext block: encryption prepends it, decryption strips it, so the
//! ciphertext is self-contained.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use des::TdesEde3;

use super::CryptoError;

/// Supported symmetric algorithms, named as they appear in the
/// EncryptionMethod URI and in folder-map configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    TripleDes,
    Aes128,
    Aes192,
    Aes256,
}

const XMLENC_NS: &str = "http://www.w3.org/2001/04/xmlenc#";

impl Algorithm {
    /// Parse a configuration name or EncryptionMethod URI.
    pub fn parse(name: &str) -> Option<Algorithm> {
        let short = name.strip_prefix(XMLENC_NS).unwrap_or(name);
        match short {
            "tripledes-cbc" | "3des" => Some(Algorithm::TripleDes),
            "aes128-cbc" => Some(Algorithm::Aes128),
            "aes192-cbc" => Some(Algorithm::Aes192),
            "aes256-cbc" => Some(Algorithm::Aes256),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::TripleDes => "tripledes-cbc",
            Algorithm::Aes128 => "aes128-cbc",
            Algorithm::Aes192 => "aes192-cbc",
            Algorithm::Aes256 => "aes256-cbc",
        }
    }

    pub fn uri(&self) -> String {
        format!("{}{}", XMLENC_NS, self.name())
    }

    pub fn key_len(&self) -> usize {
        match self {
            Algorithm::TripleDes => 24,
            Algorithm::Aes128 => 16,
            Algorithm::Aes192 => 24,
            Algorithm::Aes256 => 32,
        }
    }

    pub fn block_len(&self) -> usize {
        match self {
            Algorithm::TripleDes => 8,
            _ => 16,
        }
    }

    /// Fresh random key; 3DES keys get the customary odd parity bit.
    pub fn generate_key(&self) -> Result<Vec<u8>, CryptoError> {
        let mut key = vec![0u8; self.key_len()];
        getrandom::getrandom(&mut key)
            .map_err(|e| CryptoError::new(format!("getrandom key: {}", e)))?;
        if *self == Algorithm::TripleDes {
            set_odd_parity(&mut key);
        }
        Ok(key)
    }

    pub fn generate_iv(&self) -> Result<Vec<u8>, CryptoError> {
        let mut iv = vec![0u8; self.block_len()];
        getrandom::getrandom(&mut iv)
            .map_err(|e| CryptoError::new(format!("getrandom iv: {}", e)))?;
        Ok(iv)
    }
}

/// Each byte of a DES key carries its parity in bit 0.
fn set_odd_parity(key: &mut [u8]) {
    for b in key.iter_mut() {
        let ones = (*b >> 1).count_ones();
        if ones % 2 == 0 {
            *b |= 1;
        } else {
            *b &= 0xfe;
        }
    }
}

/// Encrypt: generate an IV, prepend it to the plaintext, CBC-encrypt the
/// whole with PKCS7 padding.
pub fn encrypt(alg: Algorithm, key: &[u8], plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let iv = alg.generate_iv()?;
    let mut buf = Vec::with_capacity(iv.len() + plain.len());
    buf.extend_from_slice(&iv);
    buf.extend_from_slice(plain);
    cbc_encrypt(alg, key, &iv, &buf)
}

/// Decrypt and strip the leading IV block. The CBC IV used here is all
/// zeroes; only the first block depends on it and that block is discarded.
pub fn decrypt(alg: Algorithm, key: &[u8], cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let zero_iv = vec![0u8; alg.block_len()];
    let mut plain = cbc_decrypt(alg, key, &zero_iv, cipher)?;
    if plain.len() < alg.block_len() {
        return Err(CryptoError::new("decrypted payload shorter than one block"));
    }
    plain.drain(..alg.block_len());
    Ok(plain)
}

fn cbc_encrypt(
    alg: Algorithm,
    key: &[u8],
    iv: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let bad_key = |_| CryptoError::new(format!("bad {} key or iv length", alg.name()));
    Ok(match alg {
        Algorithm::TripleDes => cbc::Encryptor::<TdesEde3>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        Algorithm::Aes128 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        Algorithm::Aes192 => cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        Algorithm::Aes256 => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
    })
}

fn cbc_decrypt(
    alg: Algorithm,
    key: &[u8],
    iv: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let bad_key = |_| CryptoError::new(format!("bad {} key or iv length", alg.name()));
    let bad_pad = |_| CryptoError::new(format!("{} decrypt: bad padding", alg.name()));
    match alg {
        Algorithm::TripleDes => cbc::Decryptor::<TdesEde3>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(bad_pad),
        Algorithm::Aes128 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(bad_pad),
        Algorithm::Aes192 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(bad_pad),
        Algorithm::Aes256 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(bad_pad),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Algorithm; 4] = [
        Algorithm::TripleDes,
        Algorithm::Aes128,
        Algorithm::Aes192,
        Algorithm::Aes256,
    ];

    #[test]
    fn round_trip_every_algorithm() {
        let msg = b"The quick brown fox jumped over the lazy dogs!";
        for alg in ALL {
            let key = alg.generate_key().unwrap();
            let enc = encrypt(alg, &key, msg).unwrap();
            assert_ne!(&enc[..], &msg[..]);
            let dec = decrypt(alg, &key, &enc).unwrap();
            assert_eq!(&dec[..], &msg[..], "{}", alg.name());
        }
    }

    #[test]
    fn same_plaintext_differs_by_iv() {
        let alg = Algorithm::Aes256;
        let key = alg.generate_key().unwrap();
        let a = encrypt(alg, &key, b"payload").unwrap();
        let b = encrypt(alg, &key, b"payload").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn des_keys_have_odd_parity() {
        let key = Algorithm::TripleDes.generate_key().unwrap();
        assert_eq!(key.len(), 24);
        for b in key {
            assert_eq!(b.count_ones() % 2, 1, "byte {:02x}", b);
        }
    }

    #[test]
    fn parse_names_and_uris() {
        assert_eq!(Algorithm::parse("tripledes-cbc"), Some(Algorithm::TripleDes));
        assert_eq!(
            Algorithm::parse("http://www.w3.org/2001/04/xmlenc#aes256-cbc"),
            Some(Algorithm::Aes256)
        );
        assert_eq!(Algorithm::parse("rot13"), None);
    }

    #[test]
    fn empty_payload_round_trip() {
        let alg = Algorithm::TripleDes;
        let key = alg.generate_key().unwrap();
        let enc = encrypt(alg, &key, b"").unwrap();
        let dec = decrypt(alg, &key, &enc).unwrap();
        assert!(dec.is_empty());
    }

    #[test]
    fn wrong_key_fails_or_garbles() {
        let alg = Algorithm::Aes128;
        let key = alg.generate_key().unwrap();
        let other = alg.generate_key().unwrap();
        let enc = encrypt(alg, &key, b"some payload data").unwrap();
        match decrypt(alg, &other, &enc) {
            Err(_) => {}
            Ok(plain) => assert_ne!(&plain[..], b"some payload data"),
        }
    }
}
