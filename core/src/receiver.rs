/*
 * receiver.rs
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

//! The inbound ebXML pipeline: basic-auth gate, MIME and SOAP parsing,
//! ping short-circuit, service-map lookup, duplicate suppression,
//! payload decryption, file write (optionally through a filter), queue
//! insert, acknowledgment. Every stage failure still produces a fully
//! formed acknowledgment; nothing is silently dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tracing::{error, info, warn};

use crate::basicauth::{self, AuthCheck};
use crate::config::{ServiceMap, FILTER_TIMEOUT_MS};
use crate::mime::{self, Mime};
use crate::payload;
use crate::queue::QueueRow;
use crate::runtime::{Runtime, SOFTWARE};
use crate::soap::{self, SoapHeader};
use crate::stamp;
use crate::xml::Xml;

const REALM: &str = "Phineas Receiver";
/// RefToMessageId constant peers expect ahead of the echoed request id.
const STATUS_RESPONSE_REF: &str = "statusResponse@cdc.gov";

/// Process one buffered POST request into a complete response.
pub async fn process_request(runtime: &Arc<Runtime>, request: &[u8]) -> Vec<u8> {
    info!("begin processing ebXML request");
    let text = String::from_utf8_lossy(request);
    let users = runtime.config.receiver_users();
    if basicauth::check(&users, &text) != AuthCheck::Ok {
        return basicauth::response(REALM);
    }

    let msg = match Mime::parse(request) {
        Ok(m) => m,
        Err(e) => {
            error!("failed to parse MIME payload: {}", e);
            return crate::server::respond(400, "Failed to parse MIME payload", true);
        }
    };
    let Some(envelope_part) = msg.part(1) else {
        error!("failed to get SOAP envelope");
        return crate::server::respond(400, "Missing SOAP envelope", true);
    };
    let envelope = match Xml::parse(&String::from_utf8_lossy(envelope_part.body())) {
        Ok(x) => x,
        Err(e) => {
            error!("failed to parse SOAP xml: {}", e);
            return crate::server::respond(400, "Malformed SOAP envelope", true);
        }
    };
    let header = SoapHeader::parse(&envelope);

    if header.action == soap::PING_ACTION {
        let reply = build_reply(runtime, &header, None, "success", "none", "none");
        info!("ebXML request processing completed");
        return reply;
    }

    // service map selects queue, directory and decryption profile
    let Some(index) = runtime
        .config
        .service_map_for(&header.service, &header.action)
    else {
        error!("unknown service/action {}/{}", header.service, header.action);
        return build_reply(
            runtime,
            &header,
            None,
            "InsertFailed",
            "Unknown Service/Action",
            "none",
        );
    };
    let service = runtime.config.service_map(index).expect("index just found");

    let Some(queue) = runtime.queues.find(&service.queue) else {
        error!("queue not found for {}", service.queue);
        return build_reply(
            runtime,
            &header,
            None,
            "InsertFailed",
            "Queue not found",
            "none",
        );
    };
    let mut row = queue.new_row();
    fill_request_row(&mut row, &envelope, &header);

    // duplicate suppression: the same sender record answered before gets
    // the identical acknowledgment and no second row
    let dup_key = !header.from_party.is_empty() && !header.db_record_id.is_empty();
    if dup_key {
        if let Some(cached) = runtime.cached_ack(&header.from_party, &header.db_record_id) {
            info!(
                "duplicate of {}/{}; returning cached acknowledgment",
                header.from_party, header.db_record_id
            );
            return cached;
        }
    }

    let Some(payload_part) = msg.part(2) else {
        error!("failed to get payload envelope");
        let reply = build_reply(
            runtime,
            &header,
            Some(&mut row),
            "InsertFailed",
            "Missing Payload Envelope",
            "none",
        );
        push_row(&queue, &mut row);
        return reply;
    };

    let mut profile = service.encryption.clone();
    if !profile.unc.is_empty() {
        profile.unc = runtime.config.resolve(&profile.unc).display().to_string();
    }
    let mut dn = profile.id.clone();
    let payload = match payload::process(payload_part, &profile, &mut dn) {
        Ok(p) => p,
        Err(e) => {
            error!("failed processing payload: {}", e);
            let reply = build_reply(
                runtime,
                &header,
                Some(&mut row),
                "InsertFailed",
                &e.to_string(),
                "none",
            );
            push_row(&queue, &mut row);
            return reply;
        }
    };

    let destination = runtime
        .config
        .resolve(&service.directory)
        .join(&payload.name);
    row.set("PAYLOADNAME", &payload.name);
    row.set("LOCALFILENAME", &destination.display().to_string());
    row.set("ENCRYPTION", if payload.encrypted { "yes" } else { "no" });

    if let Err(e) = write_payload(&service, &destination, &payload.data).await {
        error!("can't save {}: {}", destination.display(), e);
        let reply = build_reply(
            runtime,
            &header,
            Some(&mut row),
            "InsertFailed",
            "Can not save file",
            "none",
        );
        push_row(&queue, &mut row);
        return reply;
    }
    info!("wrote ebXML payload to {}", destination.display());

    let reply = build_reply(runtime, &header, Some(&mut row), "InsertSucceeded", "none", "none");
    push_row(&queue, &mut row);
    if dup_key {
        runtime.cache_ack(&header.from_party, &header.db_record_id, &reply);
    }
    info!("ebXML request processing completed");
    reply
}

fn fill_request_row(row: &mut QueueRow, envelope: &Xml, header: &SoapHeader) {
    row.set("MESSAGEID", &header.db_message_id);
    row.set("SERVICE", &header.service);
    row.set("ACTION", &header.action);
    row.set("ARGUMENTS", &soap::metadata_arguments(envelope));
    row.set("FROMPARTYID", &header.from_party);
    row.set("MESSAGERECIPIENT", &header.db_recipient);
    row.set("PROCESSINGSTATUS", "received");
    row.set("PROCESSID", &header.conversation_id);
}

fn push_row(queue: &Arc<crate::queue::Queue>, row: &mut QueueRow) {
    if let Err(e) = queue.push(row) {
        error!("failed to insert receive row into {}: {}", queue.name(), e);
    }
}

async fn write_payload(
    service: &ServiceMap,
    destination: &std::path::Path,
    data: &[u8],
) -> Result<(), String> {
    if let Some(parent) = destination.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    if service.filter.is_empty() {
        return tokio::fs::write(destination, data)
            .await
            .map_err(|e| e.to_string());
    }
    let out = crate::filter::run(
        &service.filter,
        data,
        Duration::from_millis(FILTER_TIMEOUT_MS),
    )
    .await
    .map_err(|e| e.to_string())?;
    if !out.stderr.is_empty() {
        warn!("filter {} returned {}", service.filter, out.stderr);
    }
    tokio::fs::write(destination, out.data)
        .await
        .map_err(|e| e.to_string())
}

/// Build the acknowledgment message. A Ping gets a Pong with no status
/// part; any error other than "none" becomes a MessageError.
fn build_reply(
    runtime: &Arc<Runtime>,
    header: &SoapHeader,
    row: Option<&mut QueueRow>,
    status: &str,
    error_text: &str,
    appdata: &str,
) -> Vec<u8> {
    let org = runtime.config.organization().to_string();
    let pid = runtime.pid.next();
    let now = stamp::timestamp();

    let mut ack = soap::ack_template(&runtime.config);
    let set = |ack: &mut Xml, path: &str, value: &str| {
        if let Err(e) = ack.set_text(path, value) {
            error!("ack template: {}", e);
        }
    };
    set(&mut ack, soap::TO_PARTY, &header.from_party);
    set(&mut ack, soap::FROM_PARTY, &header.to_party);
    set(&mut ack, soap::CPA_ID, &header.cpa_id);
    set(&mut ack, soap::CONVERSATION_ID, &header.conversation_id);
    let action = if header.action == soap::PING_ACTION {
        soap::PONG_ACTION
    } else if error_text != "none" {
        "MessageError"
    } else {
        "Acknowledgment"
    };
    set(&mut ack, soap::ACTION, action);
    set(&mut ack, soap::MESSAGE_ID, &format!("{}@{}", pid, org));
    set(&mut ack, soap::TIMESTAMP, &now);
    set(&mut ack, soap::ACK_TIMESTAMP, &now);
    set(&mut ack, soap::REF_TO_MESSAGE_ID, STATUS_RESPONSE_REF);
    set(
        &mut ack,
        &format!("{}[1]", soap::REF_TO_MESSAGE_ID),
        &header.message_id,
    );
    set(&mut ack, soap::ACK_REF, &header.message_id);
    if error_text != "none" {
        set(&mut ack, soap::ERROR, error_text);
        if let Err(e) = ack.set_attribute(soap::ERROR, "eb:errorCode", error_text) {
            error!("ack template: {}", e);
        }
    }

    if let Some(row) = row {
        row.set("RECEIVEDTIME", &now);
        row.set("LASTUPDATETIME", &now);
        row.set("APPLICATIONSTATUS", status);
        row.set("ERRORCODE", error_text);
        row.set("ERRORMESSAGE", appdata);
    }

    let mut soap_part = Mime::new();
    soap_part.set_header(mime::CONTENT_ID, &format!("<ebxml-envelope@{}>", org), 0);
    soap_part.set_header(mime::CONTENT_TYPE, mime::TEXT_XML, 1);
    soap_part.set_body(ack.format().into_bytes());

    let status_part = if header.action != soap::PING_ACTION {
        let body = format!(
            "<response><msh_response><status>{}</status><error>{}</error><appdata>{}</appdata></msh_response></response>",
            status, error_text, appdata
        );
        let mut part = Mime::new();
        part.set_header(mime::CONTENT_ID, &format!("<statusResponse@{}>", org), 0);
        part.set_header(mime::CONTENT_TYPE, mime::TEXT_XML, 1);
        part.set_body(body.into_bytes());
        Some(part)
    } else {
        None
    };

    let mut msg = Mime::new();
    msg.set_multipart("", Local::now().timestamp());
    msg.set_header("SOAPAction", "\"ebXML\"", 99);
    msg.set_header(
        "Date",
        &Local::now().format("%a %b %e %H:%M:%S %Y").to_string(),
        99,
    );
    msg.set_header("Connection", "close", 99);
    msg.set_header("Server", SOFTWARE, 99);
    msg.add_part(soap_part);
    if let Some(part) = status_part {
        msg.add_part(part);
    }
    msg.format()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::runtime::Phase;

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "phineas-rcv-{}-{}-{:x}",
            tag,
            std::process::id(),
            rand::random::<u64>()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn runtime(dir: &std::path::Path) -> Arc<Runtime> {
        let cfg = Config::parse(&format!(
            "<Phineas><Organization>rcv.lab</Organization><PartyId>rcv.party</PartyId>\
             <Receiver><Url>/phineas/receiver</Url><MapInfo><Map>\
             <Name>in</Name><Service>elr</Service><Action>save</Action>\
             <Queue>RcvQ</Queue><Directory>{}</Directory></Map></MapInfo></Receiver>\
             <QueueInfo>\
             <Connection><Name>c</Name><Type>file</Type><Unc>{}</Unc></Connection>\
             <Queue><Name>RcvQ</Name><Type>EbXmlRcvQ</Type><Connection>c</Connection><Table>RcvQ</Table></Queue>\
             </QueueInfo></Phineas>",
            dir.join("incoming").display(),
            dir.join("queues").display(),
        ))
        .unwrap();
        let rt = Runtime::new(cfg).unwrap();
        rt.set_phase(Phase::Running);
        rt
    }

    fn request_for(action: &str, record_id: &str, payload_body: &[u8]) -> Vec<u8> {
        let mut envelope = Xml::parse(
            r#"<soap-env:Envelope><soap-env:Header><eb:MessageHeader><eb:From><eb:PartyId>peer.party</eb:PartyId></eb:From><eb:To><eb:PartyId>rcv.party</eb:PartyId></eb:To><eb:CPAId>cpa</eb:CPAId><eb:ConversationId>17</eb:ConversationId><eb:Service>elr</eb:Service><eb:Action/><eb:MessageData><eb:MessageId>9@peer</eb:MessageId></eb:MessageData></eb:MessageHeader></soap-env:Header><soap-env:Body><eb:Manifest><MetaData><DatabaseInfo><MessageId>map-9</MessageId><RecordId/><MessageRecipient>someone</MessageRecipient><Arguments/></DatabaseInfo></MetaData></eb:Manifest></soap-env:Body></soap-env:Envelope>"#,
        )
        .unwrap();
        envelope.set_text(soap::ACTION, action).unwrap();
        envelope.set_text(soap::DB_RECORD_ID, record_id).unwrap();

        let mut soap_part = Mime::new();
        soap_part.set_header(mime::CONTENT_ID, "<ebxml-envelope@peer>", 0);
        soap_part.set_header(mime::CONTENT_TYPE, mime::TEXT_XML, 1);
        soap_part.set_body(envelope.format().into_bytes());

        let mut msg = Mime::new();
        msg.set_multipart("type=\"text/xml\"; start=\"ebxml-envelope@peer\";", 7);
        msg.add_part(soap_part);
        if !payload_body.is_empty() {
            let mut part = Mime::new();
            part.set_header(mime::CONTENT_ID, "<hello@peer>", 0);
            part.set_header(mime::CONTENT_TYPE, mime::OCTET_STREAM, 1);
            part.set_header(mime::CONTENT_ENCODING, mime::BASE64, 2);
            part.set_header(
                mime::CONTENT_DISPOSITION,
                "attachment; name=\"hello\"",
                3,
            );
            part.set_body(crate::crypto::envelope::base64_wrapped(payload_body).into_bytes());
            msg.add_part(part);
        }
        let mut request = b"POST /phineas/receiver HTTP/1.1\r\n".to_vec();
        request.extend_from_slice(&msg.format());
        request
    }

    fn reply_action(reply: &[u8]) -> String {
        let parsed = Mime::parse(reply).unwrap();
        let xml = Xml::parse(&String::from_utf8_lossy(parsed.part(1).unwrap().body())).unwrap();
        xml.get(soap::ACTION).to_string()
    }

    #[tokio::test]
    async fn ping_returns_pong_without_row() {
        let dir = temp_dir("ping");
        let rt = runtime(&dir);
        let reply = process_request(&rt, &request_for("Ping", "", b"")).await;
        assert_eq!(reply_action(&reply), "Pong");
        let parsed = Mime::parse(&reply).unwrap();
        assert_eq!(parsed.parts().len(), 1); // no status part on Pong
        assert!(!dir.join("queues").join("RcvQ.txt").exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn file_lands_and_row_is_inserted() {
        let dir = temp_dir("save");
        let rt = runtime(&dir);
        let reply = process_request(&rt, &request_for("save", "SendQ.1", b"hello")).await;
        assert_eq!(reply_action(&reply), "Acknowledgment");
        let written = std::fs::read(dir.join("incoming").join("hello")).unwrap();
        assert_eq!(written, b"hello");
        let parsed = Mime::parse(&reply).unwrap();
        let status = String::from_utf8_lossy(parsed.part(2).unwrap().body()).into_owned();
        assert!(status.contains("<status>InsertSucceeded</status>"), "{}", status);

        let queue = rt.queues.find("RcvQ").unwrap();
        let row = queue.prev_row(0).unwrap().unwrap();
        assert_eq!(row.get("PAYLOADNAME"), "hello");
        assert_eq!(row.get("FROMPARTYID"), "peer.party");
        assert_eq!(row.get("PROCESSINGSTATUS"), "received");
        assert_eq!(row.get("APPLICATIONSTATUS"), "InsertSucceeded");
        assert_eq!(row.get("ENCRYPTION"), "no");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn unknown_service_yields_message_error() {
        let dir = temp_dir("unknown");
        let rt = runtime(&dir);
        let mut req = request_for("save", "SendQ.2", b"hello");
        // break the action so no service map matches
        let text = String::from_utf8(req).unwrap();
        req = text.replace("<eb:Service>elr</eb:Service>", "<eb:Service>none</eb:Service>")
            .into_bytes();
        let reply = process_request(&rt, &req).await;
        assert_eq!(reply_action(&reply), "MessageError");
        let parsed = Mime::parse(&reply).unwrap();
        let status = String::from_utf8_lossy(parsed.part(2).unwrap().body()).into_owned();
        assert!(status.contains("<error>Unknown Service/Action</error>"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn duplicate_record_gets_cached_ack_and_one_row() {
        let dir = temp_dir("dup");
        let rt = runtime(&dir);
        let req = request_for("save", "SendQ.3", b"hello");
        let first = process_request(&rt, &req).await;
        let second = process_request(&rt, &req).await;
        assert_eq!(first, second);
        let queue = rt.queues.find("RcvQ").unwrap();
        let top = queue.prev_row(0).unwrap().unwrap();
        assert_eq!(top.rowid, 1, "second arrival must not insert a row");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn basic_auth_challenge() {
        let dir = temp_dir("auth");
        let cfg = Config::parse(
            "<Phineas><Organization>o</Organization><Receiver><Url>/r</Url>\
             <BasicAuth><UserID>u</UserID><Password>p</Password></BasicAuth>\
             </Receiver></Phineas>",
        )
        .unwrap();
        let rt = Runtime::new(cfg).unwrap();
        let reply = process_request(&rt, b"POST /r HTTP/1.1\r\n\r\n").await;
        let text = String::from_utf8_lossy(&reply).into_owned();
        assert!(text.starts_with("Status: 401\r\n"));
        assert!(text.contains("WWW-Authenticate: Basic realm=\"Phineas Receiver\""));
        let _ = std::fs::remove_dir_all(dir);
    }
}
