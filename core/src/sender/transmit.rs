/*
 * transmit.rs
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

//! The ebXML transmitter: compose the multipart request for a popped
//! send row, deliver it over the row's route with retry and redirect
//! handling, parse the acknowledgment, persist terminal status, and
//! drop a key=value ack file beside the folder map when one is asked
//! for.
//!
//! Retry schedule: the delay starts at the configured DelayRetry, is
//! reset to it after an attempt that reached the peer, and doubles after
//! an attempt that could not connect. Redirects are followed without
//! consuming a retry, up to a fixed hop limit.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::QueueProcessor;
use crate::basicauth;
use crate::config::{Route, FILTER_TIMEOUT_MS};
use crate::mime::{self, Mime};
use crate::net;
use crate::payload;
use crate::queue::{Queue, QueueRow};
use crate::runtime::Runtime;
use crate::soap;
use crate::stamp;
use crate::xml::Xml;

/// Redirect hops honored per send before giving up.
const MAX_REDIRECTS: usize = 5;

/// Registered for the send queue type.
pub struct EbxmlQueueProcessor;

impl QueueProcessor for EbxmlQueueProcessor {
    fn process(
        &self,
        runtime: Arc<Runtime>,
        row: QueueRow,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            process_row(runtime, row).await;
        })
    }
}

/// Drive one send row to its terminal state.
pub async fn process_row(runtime: Arc<Runtime>, mut row: QueueRow) {
    let Some(queue) = runtime.queues.find(&row.queue_name) else {
        error!("send row {} has no queue", row.rowid);
        return;
    };
    let message = match build_message(&runtime, &mut row).await {
        Some(m) => m,
        None => {
            row.set("MESSAGECREATIONTIME", &stamp::timestamp());
            row.set("PROCESSINGSTATUS", "done");
            row.set("TRANSPORTSTATUS", "failed");
            row.set("TRANSPORTERRORCODE", "bad message");
            push(&queue, &mut row);
            return;
        }
    };
    row.set("PROCESSINGSTATUS", "waiting");
    row.set("TRANSPORTSTATUS", "attempted");
    row.set("TRANSPORTERRORCODE", "");
    push(&queue, &mut row);

    if send(&runtime, &mut row, &message).await {
        file_ack(&runtime, &row).await;
    }
    push(&queue, &mut row);
    info!("ebXML {}:{} send completed", queue.name(), row.rowid);
}

fn push(queue: &Arc<Queue>, row: &mut QueueRow) {
    if let Err(e) = queue.push(row) {
        error!("failed to update {} row {}: {}", queue.name(), row.rowid, e);
    }
}

/// The map name and process id packed into MESSAGEID as `<map>-<pid>`.
fn split_message_id(row: &QueueRow) -> Option<(String, String)> {
    let mid = row.get("MESSAGEID");
    let (map, pid) = mid.split_once('-')?;
    Some((map.to_string(), pid.to_string()))
}

/// Compose the complete multipart request for a row, or None when the
/// row can't be sent.
pub async fn build_message(runtime: &Arc<Runtime>, row: &mut QueueRow) -> Option<Mime> {
    let route = route_of(runtime, row)?;
    let org = runtime.config.organization().to_string();
    let is_ping = row.get("ACTION") == soap::PING_ACTION;

    let payload_part = if is_ping {
        None
    } else {
        Some(build_payload(runtime, row).await?)
    };
    let soap_part = build_soap(runtime, row, &route)?;

    let mut msg = Mime::new();
    msg.set_multipart(
        &format!("type=\"text/xml\"; start=\"ebxml-envelope@{}\";", org),
        chrono::Local::now().timestamp(),
    );
    msg.set_header("Host", &format!("{}:{}", route.host, route.port), 99);
    msg.set_header("Connection", "Close", 99);
    if route.auth_type.eq_ignore_ascii_case("basic") {
        msg.set_header(
            "Authorization",
            &basicauth::request_value(&route.auth_id, &route.auth_password),
            99,
        );
    }
    msg.set_header("SOAPAction", "\"ebXML\"", 99);
    msg.add_part(soap_part);
    if let Some(part) = payload_part {
        msg.add_part(part);
    }
    debug!("completed multipart soap message");
    Some(msg)
}

fn route_of(runtime: &Arc<Runtime>, row: &QueueRow) -> Option<Route> {
    let name = row.get("ROUTEINFO");
    let Some(index) = runtime.config.route_index(name) else {
        error!("no route {} for row {}", name, row.rowid);
        return None;
    };
    let mut route = runtime.config.route(index)?;
    if route.port == 0 {
        route.port = if route.is_https() { 443 } else { 80 };
    }
    Some(route)
}

/// Read the processed payload file (through the map's filter when one is
/// set) and wrap it as the payload part.
async fn build_payload(runtime: &Arc<Runtime>, row: &QueueRow) -> Option<Mime> {
    let (map_name, _) = split_message_id(row)?;
    let map_index = runtime.config.folder_map_index(&map_name)?;
    let map = runtime.config.folder_map(map_index)?;
    let file: PathBuf = runtime
        .config
        .resolve(&map.processed)
        .join(row.get("PAYLOADFILE"));

    let data = if map.filter.is_empty() {
        match tokio::fs::read(&file).await {
            Ok(d) => d,
            Err(e) => {
                error!("can't read {}: {}", file.display(), e);
                return None;
            }
        }
    } else {
        debug!("filter read {} with {}", file.display(), map.filter);
        let raw = tokio::fs::read(&file).await.ok()?;
        match crate::filter::run(&map.filter, &raw, Duration::from_millis(FILTER_TIMEOUT_MS)).await
        {
            Ok(out) => {
                if !out.stderr.is_empty() {
                    warn!("filter {} returned {}", map.filter, out.stderr);
                }
                out.data
            }
            Err(e) => {
                error!("can't filter {}: {}", file.display(), e);
                return None;
            }
        }
    };

    let mut profile = map.encryption.clone();
    if !profile.unc.is_empty() {
        profile.unc = runtime.config.resolve(&profile.unc).display().to_string();
    }
    match payload::create(
        &data,
        row.get("PAYLOADFILE"),
        row.get("DESTINATIONFILENAME"),
        runtime.config.organization(),
        &profile,
    ) {
        Ok(part) => Some(part),
        Err(e) => {
            error!("can't create payload container for {}: {}", file.display(), e);
            None
        }
    }
}

fn build_soap(runtime: &Arc<Runtime>, row: &mut QueueRow, route: &Route) -> Option<Mime> {
    let org = runtime.config.organization().to_string();
    let (_, pid) = split_message_id(row)?;

    let mut envelope = soap::request_template(&runtime.config);
    let set = |envelope: &mut Xml, path: &str, value: &str| {
        if let Err(e) = envelope.set_text(path, value) {
            error!("soap template: {}", e);
        }
    };
    set(&mut envelope, soap::FROM_PARTY, runtime.config.party_id());
    set(&mut envelope, soap::TO_PARTY, &route.party_id);
    set(&mut envelope, soap::CPA_ID, &route.cpa);
    set(&mut envelope, soap::CONVERSATION_ID, &pid);
    set(&mut envelope, soap::SERVICE, row.get("SERVICE"));
    set(&mut envelope, soap::ACTION, row.get("ACTION"));
    set(&mut envelope, soap::MESSAGE_ID, &format!("{}@{}", pid, org));
    let now = stamp::timestamp();
    row.set("MESSAGECREATIONTIME", &now);
    set(&mut envelope, soap::TIMESTAMP, &now);

    if row.get("ACTION") == soap::PING_ACTION {
        envelope.remove("soap-env:Envelope.soap-env:Body");
    } else {
        let href = format!("cid:{}@{}", row.get("PAYLOADFILE"), org);
        if let Err(e) = envelope.set_attribute(soap::MANIFEST_REF, "xlink:href", &href) {
            error!("soap template: {}", e);
        }
        let record = format!("{}.{}", row.queue_name, row.rowid);
        set(&mut envelope, soap::DB_RECORD_ID, &record);
        set(&mut envelope, soap::DB_MESSAGE_ID, row.get("MESSAGEID"));
        set(&mut envelope, soap::DB_ARGUMENTS, row.get("ARGUMENTS"));
        set(&mut envelope, soap::DB_RECIPIENT, row.get("MESSAGERECIPIENT"));
    }

    let mut part = Mime::new();
    part.set_header(mime::CONTENT_ID, &format!("<ebxml-envelope@{}>", org), 0);
    part.set_header(mime::CONTENT_TYPE, mime::TEXT_XML, 99);
    part.set_body(envelope.format().into_bytes());
    Some(part)
}

/// Deliver the message. True when a reply was received and parsed into
/// the row (including a MessageError reply); false when retries were
/// exhausted or the reply was garbled.
pub async fn send(runtime: &Arc<Runtime>, row: &mut QueueRow, message: &Mime) -> bool {
    let Some(route) = route_of(runtime, row) else {
        row.set("PROCESSINGSTATUS", "done");
        row.set("TRANSPORTSTATUS", "failed");
        row.set("TRANSPORTERRORCODE", "bad route");
        return false;
    };
    let content = message.format();

    let tls = if route.is_https() {
        let ca = runtime.config.sender_ca();
        let ca_path = if ca.is_empty() {
            None
        } else {
            Some(runtime.config.resolve(ca))
        };
        let identity_path;
        let identity = if route.auth_type.eq_ignore_ascii_case("certificate") {
            identity_path = runtime.config.resolve(&route.auth_unc);
            Some((
                identity_path.as_path(),
                identity_path.as_path(),
                route.auth_password.as_str(),
            ))
        } else {
            None
        };
        match net::client_tls_config(identity, ca_path.as_deref()) {
            Ok(config) => Some(config),
            Err(e) => {
                error!("can't build TLS context for route {}: {}", route.name, e);
                row.set("PROCESSINGSTATUS", "done");
                row.set("TRANSPORTSTATUS", "failed");
                row.set("TRANSPORTERRORCODE", "bad route");
                return false;
            }
        }
    } else {
        None
    };

    let mut host = route.host.clone();
    let mut port = route.port;
    let mut path = route.path.clone();
    let mut retries = if route.retry > 0 {
        route.retry
    } else {
        runtime.config.max_retry()
    };
    let delay_base = runtime.config.delay_retry().max(1);
    let mut delay = delay_base;
    let mut read_timeout = route.timeout;
    let mut redirects = 0;

    let reply = loop {
        info!("sending ebXML {} to {}", row.get("MESSAGEID"), route.name);
        let mut connected = false;
        let attempt = async {
            let mut conn = net::connect(&host, port, tls.clone()).await?;
            connected = true;
            if read_timeout > 0 {
                conn.set_read_timeout(Duration::from_secs(read_timeout));
                read_timeout <<= 1;
            }
            row.set("MESSAGESENTTIME", &stamp::timestamp());
            conn.write_all(format!("POST {} HTTP/1.1\r\n", path).as_bytes())
                .await?;
            conn.write_all(&content).await?;
            debug!("reading response");
            let reply = crate::server::read_request(&mut conn).await;
            conn.close().await;
            Ok::<Option<Vec<u8>>, net::NetError>(reply)
        }
        .await;

        let failure = match attempt {
            Ok(Some(reply)) => {
                if let Some((new_host, new_port, new_path)) = redirect_target(&reply) {
                    if redirects < MAX_REDIRECTS {
                        redirects += 1;
                        info!("redirected to {}:{}{}", new_host, new_port, new_path);
                        host = new_host;
                        port = new_port;
                        path = new_path;
                        continue; // no retry consumed
                    }
                    warn!("redirect limit reached for {}", route.name);
                    Some("too many redirects".to_string())
                } else if http_status(&reply) == 200 {
                    break Some(reply);
                } else {
                    Some(format!("HTTP status {}", http_status(&reply)))
                }
            }
            Ok(None) => Some("reply timed out or closed".to_string()),
            Err(e) => Some(e.to_string()),
        };

        if let Some(reason) = failure {
            warn!("send attempt to {} failed: {}", route.name, reason);
            if retries == 0 || !runtime.is_running() {
                break None;
            }
            retries -= 1;
            info!("retrying send to {} in {} seconds", route.name, delay);
            super::folder::sleep_observing(runtime, Duration::from_secs(delay)).await;
            delay = if connected { delay_base } else { delay * 2 };
        }
    };

    let Some(reply) = reply else {
        row.set("PROCESSINGSTATUS", "done");
        row.set("TRANSPORTSTATUS", "failed");
        row.set("TRANSPORTERRORCODE", "retries exhausted");
        return false;
    };
    if parse_reply(&reply, row) {
        true
    } else {
        row.set("PROCESSINGSTATUS", "done");
        row.set("TRANSPORTSTATUS", "failed");
        row.set("TRANSPORTERRORCODE", "garbled reply");
        false
    }
}

/// First-line HTTP status code, 0 when unparsable.
fn http_status(reply: &[u8]) -> u16 {
    let line_end = reply
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(reply.len());
    let line = String::from_utf8_lossy(&reply[..line_end]);
    line.split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// For a 300-399 reply with a Location header, the new (host, port,
/// path); the port defaults by scheme.
fn redirect_target(reply: &[u8]) -> Option<(String, u16, String)> {
    let status = http_status(reply);
    if !(300..400).contains(&status) {
        return None;
    }
    let text = String::from_utf8_lossy(reply);
    let location = text.lines().find_map(|l| {
        let (name, value) = l.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("location") {
            Some(value.trim().to_string())
        } else {
            None
        }
    })?;
    let (default_port, rest) = if let Some(rest) = location.strip_prefix("https://") {
        (443u16, rest)
    } else if let Some(rest) = location.strip_prefix("http://") {
        (80u16, rest)
    } else {
        return None;
    };
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], rest[i..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().unwrap_or(default_port)),
        None => (authority.to_string(), default_port),
    };
    Some((host, port, path))
}

/// Parse the acknowledgment into the row. True when the reply was
/// understood, whether it reported success or a message error.
pub fn parse_reply(reply: &[u8], row: &mut QueueRow) -> bool {
    let msg = match Mime::parse(reply) {
        Ok(m) => m,
        Err(e) => {
            error!("failed parsing reply message: {}", e);
            return false;
        }
    };
    let Some(envelope_part) = msg.part(1) else {
        error!("reply missing ebxml envelope");
        return false;
    };
    let envelope = match Xml::parse(&String::from_utf8_lossy(envelope_part.body())) {
        Ok(x) => x,
        Err(e) => {
            error!("failed parsing ebxml envelope: {}", e);
            return false;
        }
    };
    let action = envelope.get(soap::ACTION).to_string();
    let now = stamp::timestamp();

    if action == "MessageError" {
        debug!("error reply received");
        row.set("PROCESSINGSTATUS", "done");
        row.set("TRANSPORTSTATUS", "failed");
        row.set(
            "TRANSPORTERRORCODE",
            envelope.attribute(soap::ERROR, "eb:errorCode").unwrap_or(""),
        );
        row.set("APPLICATIONSTATUS", "not-set");
        row.set("APPLICATIONERRORCODE", "none");
        row.set("APPLICATIONRESPONSE", envelope.get(soap::ERROR));
        row.set("MESSAGERECEIVEDTIME", &now);
        return true;
    }

    if row.get("ACTION") == soap::PING_ACTION {
        if action != soap::PONG_ACTION {
            error!("expected 'Pong' action but got '{}'", action);
            return false;
        }
        row.set("APPLICATIONSTATUS", "not-set");
        row.set("APPLICATIONERRORCODE", "none");
        row.set("APPLICATIONRESPONSE", "none");
        row.set("MESSAGERECEIVEDTIME", &now);
    } else {
        let Some(status_part) = msg.part(2) else {
            error!("reply missing status part");
            return false;
        };
        let status = match Xml::parse(&String::from_utf8_lossy(status_part.body())) {
            Ok(x) => x,
            Err(e) => {
                error!("malformed reply status: {}", e);
                return false;
            }
        };
        row.set(
            "APPLICATIONSTATUS",
            status.get("response.msh_response.status"),
        );
        row.set(
            "APPLICATIONERRORCODE",
            status.get("response.msh_response.error"),
        );
        row.set(
            "APPLICATIONRESPONSE",
            status.get("response.msh_response.appdata"),
        );
        row.set("MESSAGERECEIVEDTIME", &now);
    }
    row.set("PROCESSINGSTATUS", "done");
    row.set("TRANSPORTSTATUS", "success");
    row.set("TRANSPORTERRORCODE", "none");
    true
}

/// Write the key=value acknowledgment record when the folder map asks
/// for one. Pings have no folder map and no ack file.
pub async fn file_ack(runtime: &Arc<Runtime>, row: &QueueRow) {
    if row.get("ACTION") == soap::PING_ACTION {
        return;
    }
    let Some((map_name, _)) = split_message_id(row) else {
        return;
    };
    let Some(index) = runtime.config.folder_map_index(&map_name) else {
        return;
    };
    let map = runtime.config.folder_map(index).expect("index just found");
    if map.acknowledged.is_empty() {
        return;
    }
    let dir = runtime.config.resolve(&map.acknowledged);
    let _ = tokio::fs::create_dir_all(&dir).await;
    let path = dir.join(row.get("PAYLOADFILE"));
    let body = format!(
        "transportStatus={}\ntransportError={}\napplicationStatus={}\n\
         applicationError={}\napplicationData={}\nresponseMessageId={}\n\
         responseArguments={}\nresponseLocalFile={}\nresponseFileName={}\n\
         responseSignature={}\nresponseMessageOrigin={}\n",
        row.get("TRANSPORTSTATUS"),
        row.get("TRANSPORTERRORCODE"),
        row.get("APPLICATIONSTATUS"),
        row.get("APPLICATIONERRORCODE"),
        row.get("APPLICATIONRESPONSE"),
        row.get("RESPONSEMESSAGEID"),
        row.get("RESPONSEARGUMENTS"),
        row.get("RESPONSELOCALFILE"),
        row.get("RESPONSEFILENAME"),
        row.get("RESPONSEMESSAGESIGNATURE"),
        row.get("RESPONSEMESSAGEORIGIN"),
    );
    if let Err(e) = tokio::fs::write(&path, body).await {
        warn!("can't write ack file {}: {}", path.display(), e);
    }
}

/// Queue a connectivity Ping for a named route.
pub fn queue_ping(runtime: &Arc<Runtime>, route_name: &str) -> Result<i64, String> {
    let index = runtime
        .config
        .route_index(route_name)
        .ok_or_else(|| format!("no route {}", route_name))?;
    let route = runtime.config.route(index).ok_or("bad route")?;
    let queue = runtime
        .queues
        .find(&route.queue)
        .ok_or_else(|| format!("can't find queue for {}", route.queue))?;
    let pid = runtime.pid.next();
    let mut row = queue.new_row();
    row.set("MESSAGEID", &format!("{}-{}", route.name, pid));
    row.set("PAYLOADFILE", "");
    row.set("DESTINATIONFILENAME", "");
    row.set("ROUTEINFO", &route.name);
    row.set("SERVICE", soap::PING_SERVICE);
    row.set("ACTION", soap::PING_ACTION);
    row.set("ARGUMENTS", &route.arguments);
    row.set("MESSAGERECIPIENT", &route.recipient);
    row.set("ENCRYPTION", "no");
    row.set("SIGNATURE", "no");
    row.set("CERTIFICATEURL", "");
    row.set("PROCESSINGSTATUS", "queued");
    row.set("TRANSPORTSTATUS", "queued");
    row.set("PRIORITY", "0");
    let id = queue.push(&mut row).map_err(|e| e.to_string())?;
    info!("ebXML Ping for {} queueing completed", route.name);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueRow, QueueType, SEND_QUEUE_TYPE};

    fn send_row() -> QueueRow {
        let qtype = Arc::new(QueueType::new(
            SEND_QUEUE_TYPE,
            &[
                "RECORDID",
                "MESSAGEID",
                "ACTION",
                "PROCESSINGSTATUS",
                "TRANSPORTSTATUS",
                "TRANSPORTERRORCODE",
                "APPLICATIONSTATUS",
                "APPLICATIONERRORCODE",
                "APPLICATIONRESPONSE",
                "MESSAGERECEIVEDTIME",
            ],
        ));
        QueueRow::new(qtype)
    }

    #[test]
    fn http_status_parse() {
        assert_eq!(http_status(b"HTTP/1.1 200 OK\r\n"), 200);
        assert_eq!(http_status(b"HTTP/1.1 302 Found\r\nLocation: x\r\n"), 302);
        assert_eq!(http_status(b"garbage"), 0);
    }

    #[test]
    fn redirect_parsing_defaults_ports() {
        let reply = b"HTTP/1.1 302 Found\r\nLocation: https://alt:4443/path\r\n\r\n";
        assert_eq!(
            redirect_target(reply),
            Some(("alt".to_string(), 4443, "/path".to_string()))
        );
        let reply = b"HTTP/1.1 301 Moved\r\nLocation: https://alt/path\r\n\r\n";
        assert_eq!(
            redirect_target(reply),
            Some(("alt".to_string(), 443, "/path".to_string()))
        );
        let reply = b"HTTP/1.1 301 Moved\r\nLocation: http://alt\r\n\r\n";
        assert_eq!(
            redirect_target(reply),
            Some(("alt".to_string(), 80, "/".to_string()))
        );
        assert_eq!(redirect_target(b"HTTP/1.1 200 OK\r\n\r\n"), None);
    }

    fn wrap_reply(action: &str, status_body: Option<&str>) -> Vec<u8> {
        let envelope = format!(
            "<soap-env:Envelope><soap-env:Header><eb:MessageHeader><eb:Action>{}</eb:Action></eb:MessageHeader></soap-env:Header></soap-env:Envelope>",
            action
        );
        let mut soap_part = Mime::new();
        soap_part.set_header(mime::CONTENT_TYPE, mime::TEXT_XML, 0);
        soap_part.set_body(envelope.into_bytes());
        let mut msg = Mime::new();
        msg.set_multipart("", 3);
        msg.add_part(soap_part);
        if let Some(body) = status_body {
            let mut part = Mime::new();
            part.set_header(mime::CONTENT_TYPE, mime::TEXT_XML, 0);
            part.set_body(body.as_bytes().to_vec());
            msg.add_part(part);
        }
        let mut reply = b"HTTP/1.1 200 OK\r\n".to_vec();
        reply.extend_from_slice(&msg.format());
        reply
    }

    #[test]
    fn ack_reply_marks_success() {
        let mut row = send_row();
        row.set("ACTION", "save");
        let reply = wrap_reply(
            "Acknowledgment",
            Some("<response><msh_response><status>InsertSucceeded</status><error>none</error><appdata>ok</appdata></msh_response></response>"),
        );
        assert!(parse_reply(&reply, &mut row));
        assert_eq!(row.get("TRANSPORTSTATUS"), "success");
        assert_eq!(row.get("PROCESSINGSTATUS"), "done");
        assert_eq!(row.get("APPLICATIONSTATUS"), "InsertSucceeded");
        assert_eq!(row.get("APPLICATIONRESPONSE"), "ok");
        assert!(!row.get("MESSAGERECEIVEDTIME").is_empty());
    }

    #[test]
    fn pong_reply_completes_ping() {
        let mut row = send_row();
        row.set("ACTION", "Ping");
        let reply = wrap_reply("Pong", None);
        assert!(parse_reply(&reply, &mut row));
        assert_eq!(row.get("TRANSPORTSTATUS"), "success");
        assert_eq!(row.get("APPLICATIONRESPONSE"), "none");
    }

    #[test]
    fn unexpected_action_for_ping_is_garbled() {
        let mut row = send_row();
        row.set("ACTION", "Ping");
        let reply = wrap_reply("Acknowledgment", None);
        assert!(!parse_reply(&reply, &mut row));
    }

    #[test]
    fn message_error_reply_marks_failed() {
        let mut row = send_row();
        row.set("ACTION", "save");
        let envelope = "<soap-env:Envelope><soap-env:Header><eb:MessageHeader><eb:Action>MessageError</eb:Action></eb:MessageHeader><eb:ErrorList><eb:Error eb:errorCode=\"ValueNotRecognized\">bad cpa</eb:Error></eb:ErrorList></soap-env:Header></soap-env:Envelope>";
        let mut soap_part = Mime::new();
        soap_part.set_header(mime::CONTENT_TYPE, mime::TEXT_XML, 0);
        soap_part.set_body(envelope.as_bytes().to_vec());
        let mut msg = Mime::new();
        msg.set_multipart("", 3);
        msg.add_part(soap_part);
        let mut reply = b"HTTP/1.1 200 OK\r\n".to_vec();
        reply.extend_from_slice(&msg.format());

        assert!(parse_reply(&reply, &mut row));
        assert_eq!(row.get("TRANSPORTSTATUS"), "failed");
        assert_eq!(row.get("TRANSPORTERRORCODE"), "ValueNotRecognized");
        assert_eq!(row.get("APPLICATIONRESPONSE"), "bad cpa");
        assert_eq!(row.get("APPLICATIONSTATUS"), "not-set");
    }
}
