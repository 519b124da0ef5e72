/*
 * basicauth.rs
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

//! HTTP Basic authentication against the configured user list.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// A configured user entry.
#[derive(Debug, Clone)]
pub struct BasicAuthUser {
    pub user_id: String,
    pub password: String,
}

/// Outcome of checking a request against a realm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCheck {
    /// No realm configured, or credentials matched.
    Ok,
    /// Header present but no user matched.
    Denied,
    /// Realm configured and no usable Authorization header.
    NotAttempted,
}

/// Check `Authorization: Basic` in a raw request header block. Any
/// configured user may match.
pub fn check(users: &[BasicAuthUser], request: &str) -> AuthCheck {
    if users.is_empty() {
        return AuthCheck::Ok;
    }
    let Some(at) = request.find("Authorization: Basic ") else {
        return AuthCheck::NotAttempted;
    };
    let tail = &request[at + 21..];
    let token: String = tail
        .chars()
        .take_while(|c| !c.is_whitespace())
        .collect();
    let Ok(decoded) = STANDARD.decode(token.as_bytes()) else {
        return AuthCheck::NotAttempted;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return AuthCheck::NotAttempted;
    };
    let Some((uid, pw)) = decoded.split_once(':') else {
        return AuthCheck::NotAttempted;
    };
    for user in users {
        if user.user_id == uid && user.password == pw {
            return AuthCheck::Ok;
        }
    }
    AuthCheck::Denied
}

/// 401 response body in the server's `Status:`-headed convention.
pub fn response(realm: &str) -> Vec<u8> {
    let html = "<html><body>Access restricted - Authorization required!</body></html>";
    format!(
        "Status: 401\r\nWWW-Authenticate: Basic realm=\"{}\"\r\nContent-Length: {}\r\n\r\n{}",
        realm,
        html.len(),
        html
    )
    .into_bytes()
}

/// Value for an outbound `Authorization` header.
pub fn request_value(user_id: &str, password: &str) -> String {
    let token = STANDARD.encode(format!("{}:{}", user_id, password));
    format!("Basic {}", token)
}
