/*
 * server.rs
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

//! The integrated HTTP server.
//!
//! Up to two listeners (plain and TLS) feed one accept loop that wakes
//! every couple of seconds to observe shutdown. Each connection is
//! handled by a pool task: requests are framed by the blank line plus
//! Content-Length, dispatched on the URL prefix, and answered with the
//! handler's `Status:`-headed body behind an `HTTP/1.1` status line.
//! Connections stay open until the peer closes or the node stops.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::mime;
use crate::net::{self, Listener, NetCon};
use crate::runtime::{Runtime, SOFTWARE};
use crate::taskq::TaskQueue;

/// Open the configured listeners and serve until shutdown.
pub async fn run(runtime: Arc<Runtime>) {
    let mut plain = None;
    if runtime.config.server_port() > 0 {
        match Listener::open(runtime.config.server_port(), None).await {
            Ok(l) => plain = Some(l),
            Err(e) => {
                error!("failed to open server port: {}", e);
                runtime.request_shutdown();
                return;
            }
        }
    }
    let mut tls = None;
    if runtime.config.server_ssl_port() > 0 {
        let cert = runtime.config.resolve(runtime.config.server_ssl_cert());
        let key_name = runtime.config.server_ssl_key();
        // the key may be bundled with the certificate
        let key = if key_name.is_empty() {
            cert.clone()
        } else {
            runtime.config.resolve(key_name)
        };
        let auth = runtime.config.server_ssl_auth();
        let auth_path = if auth.is_empty() {
            None
        } else {
            Some(runtime.config.resolve(auth))
        };
        let config = net::server_tls_config(
            &cert,
            &key,
            runtime.config.server_ssl_password(),
            auth_path.as_deref(),
        );
        match config {
            Ok(config) => {
                match Listener::open(runtime.config.server_ssl_port(), Some(config)).await {
                    Ok(l) => tls = Some(l),
                    Err(e) => {
                        error!("failed to open SSL port: {}", e);
                        runtime.request_shutdown();
                        return;
                    }
                }
            }
            Err(e) => {
                error!("failed getting SSL context for server: {}", e);
                runtime.request_shutdown();
                return;
            }
        }
    }
    let mut threads = runtime.config.server_threads();
    if plain.is_some() && tls.is_some() {
        threads *= 2;
    }
    serve(runtime, plain, tls, threads).await;
}

/// The accept loop over already-bound listeners; also the test entry.
pub async fn serve(
    runtime: Arc<Runtime>,
    plain: Option<Listener>,
    tls: Option<Listener>,
    threads: usize,
) {
    if plain.is_none() && tls.is_none() {
        return;
    }
    let pool = TaskQueue::new(threads.max(1), Duration::from_secs(2));
    info!("server accepting connections");
    loop {
        if !runtime.is_running() {
            break;
        }
        tokio::select! {
            conn = accept_on(&plain) => dispatch_connection(&runtime, &pool, conn),
            conn = accept_on(&tls) => dispatch_connection(&runtime, &pool, conn),
            _ = tokio::time::sleep(Duration::from_secs(2)) => continue,
        }
    }
    pool.stop().await;
    info!("server stopped");
}

async fn accept_on(listener: &Option<Listener>) -> Result<NetCon, net::NetError> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

fn dispatch_connection(
    runtime: &Arc<Runtime>,
    pool: &TaskQueue,
    conn: Result<NetCon, net::NetError>,
) {
    let conn = match conn {
        Ok(conn) => conn,
        Err(e) => {
            debug!("accept failed: {}", e);
            return;
        }
    };
    if pool.waiting() == 0 && pool.running() >= pool.max_workers() {
        warn!("no available server threads for request");
    }
    let rt = runtime.clone();
    pool.submit(async move {
        handle_connection(rt, conn).await;
    });
}

async fn handle_connection(runtime: Arc<Runtime>, mut conn: NetCon) {
    loop {
        let request = match read_request(&mut conn).await {
            Some(r) if !r.is_empty() => r,
            _ => break,
        };
        log_request(&conn, &request);
        let response = respond_to(&runtime, &request).await;
        let framed = frame_response(response);
        if let Err(e) = conn.write_all(&framed).await {
            debug!("response write failed: {}", e);
            break;
        }
        if !runtime.is_running() {
            break;
        }
    }
    conn.close().await;
    debug!("request connection completed");
}

/// Read one request: headers to the blank line, then exactly
/// Content-Length body bytes. None when the peer is gone before a
/// complete header block arrives.
pub async fn read_request(conn: &mut NetCon) -> Option<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];
    let body_at = loop {
        if let Some((_, body_at)) = mime::find_header_end(&buf) {
            break body_at;
        }
        match conn.read(&mut chunk).await {
            Ok(0) => {
                if !buf.is_empty() {
                    warn!("connection closed before end of request header");
                }
                return None;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                if !e.is_timeout() || buf.is_empty() {
                    debug!("request read: {}", e);
                    return None;
                }
                warn!("request header read timed out");
                return None;
            }
        }
    };
    let expect = content_length(&buf[..body_at]);
    while buf.len() < body_at + expect {
        match conn.read(&mut chunk).await {
            Ok(0) => {
                warn!(
                    "expected {} body bytes but read {}",
                    expect,
                    buf.len() - body_at
                );
                break;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                warn!("request body read: {}", e);
                break;
            }
        }
    }
    Some(buf)
}

/// Content-Length from a raw header block; absent means no body.
pub fn content_length(headers: &[u8]) -> usize {
    let text = String::from_utf8_lossy(headers);
    for line in text.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

fn log_request(conn: &NetCon, request: &[u8]) {
    let line_end = request
        .iter()
        .position(|&b| b == b'\n' || b == b'\r')
        .unwrap_or(request.len());
    info!(
        "{}: {}",
        conn.remote_host(),
        String::from_utf8_lossy(&request[..line_end])
    );
}

async fn respond_to(runtime: &Arc<Runtime>, request: &[u8]) -> Vec<u8> {
    let head = String::from_utf8_lossy(&request[..request.len().min(512)]).into_owned();
    let (method, url) = match head.split_once(' ') {
        Some((m, rest)) => match rest.split_once(' ') {
            Some((u, _)) => (m.to_string(), u.to_string()),
            None => (m.to_string(), rest.to_string()),
        },
        None => (String::new(), String::new()),
    };
    let receiver_url = runtime.config.receiver_url();
    if !receiver_url.is_empty() && url.starts_with(receiver_url) {
        if method == "POST" {
            return crate::receiver::process_request(runtime, request).await;
        }
        return respond(
            200,
            &format!("<h3>{}</h3>Receiver", SOFTWARE),
            runtime.is_running(),
        );
    }
    warn!("request not found for {} {}", method, url);
    respond(
        400,
        &format!("404 - <bold>{}</bold> not found", url),
        runtime.is_running(),
    )
}

/// A small `Status:`-headed HTML response.
pub fn respond(code: u16, body: &str, keep_alive: bool) -> Vec<u8> {
    let html = format!("<html><body>{}</body></html>", body);
    format!(
        "Status: {}\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n{}",
        code,
        html.len(),
        if keep_alive { "Keep-alive" } else { "Close" },
        html
    )
    .into_bytes()
}

/// Prepend the HTTP status line, deriving the code from a `Status:`
/// header when the handler set one.
pub fn frame_response(response: Vec<u8>) -> Vec<u8> {
    let mut code = 200;
    match mime::find_header_end(&response) {
        Some((hdr_len, _)) => {
            let text = String::from_utf8_lossy(&response[..hdr_len]);
            for line in text.lines() {
                if let Some(value) = line.strip_prefix("Status:") {
                    code = value.trim().parse().unwrap_or(200);
                    break;
                }
            }
            let mut out = status_line(code).into_bytes();
            out.extend_from_slice(&response);
            out
        }
        None => {
            // no header block at all: the whole payload is the body
            let mut out = status_line(code).into_bytes();
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&response);
            out
        }
    }
}

fn status_line(code: u16) -> String {
    let phrase = if code < 300 {
        "OK"
    } else if code == 401 {
        "Authorization Required"
    } else if code < 500 {
        "NOT FOUND"
    } else {
        "SERVER ERROR"
    };
    format!("HTTP/1.1 {} {}\r\n", code, phrase)
}
