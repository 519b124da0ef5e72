/*
 * soap.rs
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

//! ebXML SOAP envelopes: the request and acknowledgment template
//! documents, the dotted paths into them, and header extraction for the
//! receive side. Prefixes are part of the element names; no namespace
//! processing happens anywhere in the node.

use crate::config::Config;
use crate::xml::{Xml, XmlNode};

// common prefixes
pub const HEADER: &str = "soap-env:Envelope.soap-env:Header.";
pub const BODY: &str = "soap-env:Envelope.soap-env:Body.";

// header fields
pub const TO_PARTY: &str = "soap-env:Envelope.soap-env:Header.eb:MessageHeader.eb:To.eb:PartyId";
pub const FROM_PARTY: &str =
    "soap-env:Envelope.soap-env:Header.eb:MessageHeader.eb:From.eb:PartyId";
pub const CPA_ID: &str = "soap-env:Envelope.soap-env:Header.eb:MessageHeader.eb:CPAId";
pub const CONVERSATION_ID: &str =
    "soap-env:Envelope.soap-env:Header.eb:MessageHeader.eb:ConversationId";
pub const SERVICE: &str = "soap-env:Envelope.soap-env:Header.eb:MessageHeader.eb:Service";
pub const ACTION: &str = "soap-env:Envelope.soap-env:Header.eb:MessageHeader.eb:Action";
pub const MESSAGE_ID: &str =
    "soap-env:Envelope.soap-env:Header.eb:MessageHeader.eb:MessageData.eb:MessageId";
pub const TIMESTAMP: &str =
    "soap-env:Envelope.soap-env:Header.eb:MessageHeader.eb:MessageData.eb:Timestamp";
pub const REF_TO_MESSAGE_ID: &str =
    "soap-env:Envelope.soap-env:Header.eb:MessageHeader.eb:MessageData.eb:RefToMessageId";
pub const ERROR: &str = "soap-env:Envelope.soap-env:Header.eb:ErrorList.eb:Error";

// acknowledgment block
pub const ACK_TIMESTAMP: &str =
    "soap-env:Envelope.soap-env:Header.eb:Acknowledgment.eb:Timestamp";
pub const ACK_REF: &str =
    "soap-env:Envelope.soap-env:Header.eb:Acknowledgment.eb:RefToMessageId";

// body: manifest and database metadata
pub const MANIFEST_REF: &str = "soap-env:Envelope.soap-env:Body.eb:Manifest.eb:Reference";
pub const METADATA: &str = "soap-env:Envelope.soap-env:Body.eb:Manifest.MetaData";
pub const DB_MESSAGE_ID: &str =
    "soap-env:Envelope.soap-env:Body.eb:Manifest.MetaData.DatabaseInfo.MessageId";
pub const DB_RECIPIENT: &str =
    "soap-env:Envelope.soap-env:Body.eb:Manifest.MetaData.DatabaseInfo.MessageRecipient";
pub const DB_RECORD_ID: &str =
    "soap-env:Envelope.soap-env:Body.eb:Manifest.MetaData.DatabaseInfo.RecordId";
pub const DB_ARGUMENTS: &str =
    "soap-env:Envelope.soap-env:Body.eb:Manifest.MetaData.DatabaseInfo.Arguments";

/// The fixed service and action used for connectivity pings.
pub const PING_SERVICE: &str = "urn:oasis:names:tc:ebxml-msg:service";
pub const PING_ACTION: &str = "Ping";
pub const PONG_ACTION: &str = "Pong";

const REQUEST_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?><soap-env:Envelope xmlns:soap-env="http://schemas.xmlsoap.org/soap/envelope/" xmlns:eb="http://www.oasis-open.org/committees/ebxml-msg/schema/msg-header-2_0.xsd" xmlns:xlink="http://www.w3.org/1999/xlink"><soap-env:Header><eb:MessageHeader eb:version="2.0" soap-env:mustUnderstand="1"><eb:From><eb:PartyId>sender</eb:PartyId></eb:From><eb:To><eb:PartyId>receiver</eb:PartyId></eb:To><eb:CPAId/><eb:ConversationId/><eb:Service eb:type="string"/><eb:Action/><eb:MessageData><eb:MessageId/><eb:Timestamp/></eb:MessageData></eb:MessageHeader></soap-env:Header><soap-env:Body><eb:Manifest eb:version="2.0"><eb:Reference xlink:href=""/><MetaData><DatabaseInfo><MessageId/><MessageRecipient/><RecordId/><Arguments/></DatabaseInfo></MetaData></eb:Manifest></soap-env:Body></soap-env:Envelope>"#;

const ACK_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?><soap-env:Envelope xmlns:soap-env="http://schemas.xmlsoap.org/soap/envelope/" xmlns:eb="http://www.oasis-open.org/committees/ebxml-msg/schema/msg-header-2_0.xsd"><soap-env:Header><eb:MessageHeader eb:version="2.0" soap-env:mustUnderstand="1"><eb:From><eb:PartyId>receiver</eb:PartyId></eb:From><eb:To><eb:PartyId>sender</eb:PartyId></eb:To><eb:CPAId/><eb:ConversationId/><eb:Service>urn:oasis:names:tc:ebxml-msg:service</eb:Service><eb:Action>Acknowledgment</eb:Action><eb:MessageData><eb:MessageId/><eb:Timestamp/><eb:RefToMessageId/></eb:MessageData></eb:MessageHeader><eb:Acknowledgment eb:version="2.0" soap-env:mustUnderstand="1"><eb:Timestamp/><eb:RefToMessageId/></eb:Acknowledgment></soap-env:Header><soap-env:Body/></soap-env:Envelope>"#;

/// The outbound request template: the configured file when one is named,
/// the built-in otherwise.
pub fn request_template(config: &Config) -> Xml {
    load_template(config, config.soap_template(), REQUEST_TEMPLATE)
}

/// The acknowledgment template.
pub fn ack_template(config: &Config) -> Xml {
    load_template(config, config.ack_template(), ACK_TEMPLATE)
}

fn load_template(config: &Config, name: &str, builtin: &str) -> Xml {
    if !name.is_empty() {
        match Xml::load(&config.resolve(name)) {
            Ok(xml) => return xml,
            Err(e) => tracing::warn!("can't load template {}: {}; using built-in", name, e),
        }
    }
    Xml::parse(builtin).expect("built-in template parses")
}

/// Fields lifted from an inbound SOAP envelope.
#[derive(Debug, Clone, Default)]
pub struct SoapHeader {
    pub action: String,
    pub service: String,
    pub message_id: String,
    pub from_party: String,
    pub to_party: String,
    pub cpa_id: String,
    pub conversation_id: String,
    pub db_message_id: String,
    pub db_record_id: String,
    pub db_recipient: String,
    pub db_arguments: String,
}

impl SoapHeader {
    pub fn parse(envelope: &Xml) -> SoapHeader {
        SoapHeader {
            action: envelope.get(ACTION).to_string(),
            service: envelope.get(SERVICE).to_string(),
            message_id: envelope.get(MESSAGE_ID).to_string(),
            from_party: envelope.get(FROM_PARTY).to_string(),
            to_party: envelope.get(TO_PARTY).to_string(),
            cpa_id: envelope.get(CPA_ID).to_string(),
            conversation_id: envelope.get(CONVERSATION_ID).to_string(),
            db_message_id: envelope.get(DB_MESSAGE_ID).to_string(),
            db_record_id: envelope.get(DB_RECORD_ID).to_string(),
            db_recipient: envelope.get(DB_RECIPIENT).to_string(),
            db_arguments: envelope.get(DB_ARGUMENTS).to_string(),
        }
    }
}

/// Render the manifest metadata for the receive row's ARGUMENTS field:
/// the MetaData subtree wrapped in a bare Manifest element.
pub fn metadata_arguments(envelope: &Xml) -> String {
    let Some(meta) = envelope.node(METADATA) else {
        return String::new();
    };
    let mut manifest = XmlNode::new("Manifest");
    manifest.children.push(meta.clone());
    Xml::format_node(&manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_template_has_all_paths() {
        let xml = Xml::parse(REQUEST_TEMPLATE).unwrap();
        for path in [
            FROM_PARTY,
            TO_PARTY,
            CPA_ID,
            CONVERSATION_ID,
            SERVICE,
            ACTION,
            MESSAGE_ID,
            TIMESTAMP,
            DB_MESSAGE_ID,
            DB_RECIPIENT,
            DB_RECORD_ID,
            DB_ARGUMENTS,
        ] {
            assert!(xml.get_text(path).is_some(), "missing {}", path);
        }
        assert!(xml.attribute(MANIFEST_REF, "xlink:href").is_some());
    }

    #[test]
    fn ack_template_has_ack_block() {
        let xml = Xml::parse(ACK_TEMPLATE).unwrap();
        assert!(xml.get_text(ACK_TIMESTAMP).is_some());
        assert!(xml.get_text(ACK_REF).is_some());
        assert!(xml.get_text(REF_TO_MESSAGE_ID).is_some());
    }

    #[test]
    fn header_extraction() {
        let mut xml = Xml::parse(REQUEST_TEMPLATE).unwrap();
        xml.set_text(ACTION, "save").unwrap();
        xml.set_text(SERVICE, "elr").unwrap();
        xml.set_text(FROM_PARTY, "them").unwrap();
        xml.set_text(MESSAGE_ID, "123@lab").unwrap();
        xml.set_text(DB_RECORD_ID, "SendQ.42").unwrap();
        let hdr = SoapHeader::parse(&xml);
        assert_eq!(hdr.action, "save");
        assert_eq!(hdr.service, "elr");
        assert_eq!(hdr.from_party, "them");
        assert_eq!(hdr.message_id, "123@lab");
        assert_eq!(hdr.db_record_id, "SendQ.42");
    }

    #[test]
    fn metadata_round_trip() {
        let mut xml = Xml::parse(REQUEST_TEMPLATE).unwrap();
        xml.set_text(DB_ARGUMENTS, "do=this").unwrap();
        let args = metadata_arguments(&xml);
        assert!(args.starts_with("<Manifest>"));
        assert!(args.contains("<Arguments>do=this</Arguments>"));
    }
}
