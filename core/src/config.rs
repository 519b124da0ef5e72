/*
 * config.rs
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

//! The node configuration: a typed view over the XML tree.
//!
//! The document root is `Phineas`. A file whose root is anything else is
//! taken to be an encryption envelope around the real configuration and
//! is decrypted on load with the operator-supplied key file; saving an
//! encrypted configuration always uses AES-256.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::basicauth::BasicAuthUser;
use crate::crypto::{envelope, Algorithm};
use crate::payload::EncryptionProfile;
use crate::queue::QueueType;
use crate::xml::Xml;

const ROOT: &str = "Phineas";
const MAP: &str = "Phineas.Sender.MapInfo.Map";
const ROUTE: &str = "Phineas.Sender.RouteInfo.Route";
const SERVICE: &str = "Phineas.Receiver.MapInfo.Map";
const QUEUE: &str = "Phineas.QueueInfo.Queue";
const CONNECTION: &str = "Phineas.QueueInfo.Connection";
const TYPE: &str = "Phineas.QueueInfo.Type";
const BASIC_AUTH: &str = "Phineas.Receiver.BasicAuth";

/// Filter subprocesses get this long to finish.
pub const FILTER_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug)]
pub struct ConfigError(String);

impl ConfigError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// An outbound destination.
#[derive(Debug, Clone, Default)]
pub struct Route {
    pub name: String,
    pub party_id: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub protocol: String,
    pub cpa: String,
    pub auth_type: String,
    pub auth_id: String,
    pub auth_password: String,
    pub auth_unc: String,
    pub retry: u32,
    pub timeout: u64,
    pub recipient: String,
    pub arguments: String,
    pub queue: String,
}

impl Route {
    pub fn is_https(&self) -> bool {
        self.protocol.eq_ignore_ascii_case("https")
    }
}

/// A folder-map rule: dropped file to queued send.
#[derive(Debug, Clone, Default)]
pub struct FolderMap {
    pub name: String,
    pub folder: String,
    pub processed: String,
    pub acknowledged: String,
    pub route: String,
    pub service: String,
    pub action: String,
    pub arguments: String,
    pub recipient: String,
    pub queue: String,
    pub encryption: EncryptionProfile,
    pub filter: String,
    pub processor: String,
}

/// A service-map rule: inbound service/action to directory.
#[derive(Debug, Clone, Default)]
pub struct ServiceMap {
    pub name: String,
    pub service: String,
    pub action: String,
    pub queue: String,
    pub directory: String,
    pub encryption: EncryptionProfile,
    pub filter: String,
}

/// A queue connection definition.
#[derive(Debug, Clone, Default)]
pub struct ConnectionDef {
    pub name: String,
    pub kind: String,
    pub unc: String,
    pub user: String,
    pub password: String,
    pub driver: String,
}

/// A queue definition.
#[derive(Debug, Clone, Default)]
pub struct QueueEntry {
    pub name: String,
    pub type_name: String,
    pub connection: String,
    pub table: String,
}

/// The loaded configuration. Read-only for the life of the runtime.
pub struct Config {
    xml: Xml,
}

impl Config {
    pub fn from_xml(xml: Xml) -> Result<Self, ConfigError> {
        if xml.root_name() != ROOT {
            return Err(ConfigError::new(format!(
                "configuration root is '{}', expected '{}'",
                xml.root_name(),
                ROOT
            )));
        }
        Ok(Self { xml })
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let xml = Xml::parse(text).map_err(|e| ConfigError::new(e.to_string()))?;
        Self::from_xml(xml)
    }

    /// Load from disk. A document whose root is not `Phineas` is an
    /// encryption envelope; `key` names the private key (and password)
    /// that unwraps it.
    pub fn load(path: &Path, key: Option<(&Path, &str)>) -> Result<Self, ConfigError> {
        let xml = Xml::load(path).map_err(|e| ConfigError::new(e.to_string()))?;
        if xml.root_name() == ROOT {
            return Self::from_xml(xml);
        }
        let Some((key_path, password)) = key else {
            return Err(ConfigError::new(format!(
                "configuration {} is encrypted and no key file was given",
                path.display()
            )));
        };
        let mut dn = String::new();
        let plain = envelope::decrypt(&xml, key_path, password, &mut dn)
            .map_err(|e| ConfigError::new(format!("configuration decrypt: {}", e)))?;
        let text = String::from_utf8(plain)
            .map_err(|_| ConfigError::new("decrypted configuration is not UTF-8"))?;
        Self::parse(text.trim_end_matches('\0'))
    }

    /// Save encrypted at rest. The cipher is pinned to AES-256
    /// regardless of what the loaded file used.
    pub fn save_encrypted(
        &self,
        path: &Path,
        cert: &Path,
        password: &str,
    ) -> Result<(), ConfigError> {
        let plain = self.xml.format();
        let enc = envelope::encrypt(plain.as_bytes(), cert, password, "", Algorithm::Aes256)
            .map_err(|e| ConfigError::new(format!("configuration encrypt: {}", e)))?;
        std::fs::write(path, enc.format())
            .map_err(|e| ConfigError::new(format!("write {}: {}", path.display(), e)))
    }

    pub fn get(&self, path: &str) -> &str {
        self.xml.get(path)
    }

    pub fn get_int(&self, path: &str) -> i64 {
        self.xml.get_int(path)
    }

    pub fn count(&self, path: &str) -> usize {
        self.xml.count(path)
    }

    /// Resolve a possibly relative path against InstallDirectory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            return p.to_path_buf();
        }
        let install = self.get("Phineas.InstallDirectory");
        if install.is_empty() {
            p.to_path_buf()
        } else {
            Path::new(install).join(p)
        }
    }

    pub fn organization(&self) -> &str {
        self.get("Phineas.Organization")
    }

    pub fn party_id(&self) -> &str {
        self.get("Phineas.PartyId")
    }

    pub fn log_file(&self) -> &str {
        self.get("Phineas.LogFile")
    }

    pub fn log_level(&self) -> &str {
        self.get("Phineas.LogLevel")
    }

    pub fn soap_template(&self) -> &str {
        self.get("Phineas.SoapTemplate")
    }

    pub fn ack_template(&self) -> &str {
        self.get("Phineas.AckTemplate")
    }

    // server

    pub fn server_port(&self) -> u16 {
        self.get_int("Phineas.Server.Port") as u16
    }

    pub fn server_ssl_port(&self) -> u16 {
        self.get_int("Phineas.Server.SSL.Port") as u16
    }

    pub fn server_threads(&self) -> usize {
        match self.get_int("Phineas.Server.NumThreads") {
            n if n > 0 => n as usize,
            _ => 2,
        }
    }

    pub fn server_ssl_cert(&self) -> &str {
        self.get("Phineas.Server.SSL.CertFile")
    }

    pub fn server_ssl_key(&self) -> &str {
        self.get("Phineas.Server.SSL.KeyFile")
    }

    pub fn server_ssl_password(&self) -> &str {
        self.get("Phineas.Server.SSL.Password")
    }

    pub fn server_ssl_auth(&self) -> &str {
        self.get("Phineas.Server.SSL.AuthFile")
    }

    // sender

    pub fn max_retry(&self) -> u32 {
        self.get_int("Phineas.Sender.MaxRetry").max(0) as u32
    }

    pub fn delay_retry(&self) -> u64 {
        self.get_int("Phineas.Sender.DelayRetry").max(0) as u64
    }

    pub fn sender_poll_interval(&self) -> u64 {
        match self.get_int("Phineas.Sender.PollInterval") {
            n if n >= 1 => n as u64,
            _ => 5,
        }
    }

    pub fn sender_ca(&self) -> &str {
        self.get("Phineas.Sender.CertificateAuthority")
    }

    pub fn folder_maps(&self) -> Vec<FolderMap> {
        (0..self.count(MAP)).filter_map(|i| self.folder_map(i)).collect()
    }

    pub fn folder_map(&self, index: usize) -> Option<FolderMap> {
        if index >= self.count(MAP) {
            return None;
        }
        let at = |suffix: &str| self.get(&format!("{}[{}].{}", MAP, index, suffix)).to_string();
        Some(FolderMap {
            name: at("Name"),
            folder: at("Folder"),
            processed: at("Processed"),
            acknowledged: at("Acknowledged"),
            route: at("Route"),
            service: at("Service"),
            action: at("Action"),
            arguments: at("Arguments"),
            recipient: at("Recipient"),
            queue: at("Queue"),
            encryption: EncryptionProfile {
                algorithm: at("Encryption.Type"),
                unc: at("Encryption.Unc"),
                id: at("Encryption.Id"),
                password: at("Encryption.Password"),
            },
            filter: at("Filter"),
            processor: at("Processor"),
        })
    }

    pub fn folder_map_index(&self, name: &str) -> Option<usize> {
        (0..self.count(MAP)).find(|i| self.get(&format!("{}[{}].Name", MAP, i)) == name)
    }

    pub fn routes(&self) -> Vec<Route> {
        (0..self.count(ROUTE)).filter_map(|i| self.route(i)).collect()
    }

    pub fn route(&self, index: usize) -> Option<Route> {
        if index >= self.count(ROUTE) {
            return None;
        }
        let at = |suffix: &str| self.get(&format!("{}[{}].{}", ROUTE, index, suffix)).to_string();
        let int = |suffix: &str| -> String {
            self.get(&format!("{}[{}].{}", ROUTE, index, suffix))
                .trim()
                .to_string()
        };
        Some(Route {
            name: at("Name"),
            party_id: at("PartyId"),
            host: at("Host"),
            port: int("Port").parse().unwrap_or(0),
            path: at("Path"),
            protocol: at("Protocol"),
            cpa: at("Cpa"),
            auth_type: at("Authentication.Type"),
            auth_id: at("Authentication.Id"),
            auth_password: at("Authentication.Password"),
            auth_unc: at("Authentication.Unc"),
            retry: int("Retry").parse().unwrap_or(0),
            timeout: int("Timeout").parse().unwrap_or(0),
            recipient: at("Recipient"),
            arguments: at("Arguments"),
            queue: at("Queue"),
        })
    }

    pub fn route_index(&self, name: &str) -> Option<usize> {
        (0..self.count(ROUTE)).find(|i| self.get(&format!("{}[{}].Name", ROUTE, i)) == name)
    }

    // receiver

    pub fn receiver_url(&self) -> &str {
        self.get("Phineas.Receiver.Url")
    }

    pub fn receiver_users(&self) -> Vec<BasicAuthUser> {
        (0..self.count(BASIC_AUTH))
            .map(|i| BasicAuthUser {
                user_id: self
                    .get(&format!("{}[{}].UserID", BASIC_AUTH, i))
                    .to_string(),
                password: self
                    .get(&format!("{}[{}].Password", BASIC_AUTH, i))
                    .to_string(),
            })
            .collect()
    }

    pub fn service_maps(&self) -> Vec<ServiceMap> {
        (0..self.count(SERVICE)).filter_map(|i| self.service_map(i)).collect()
    }

    pub fn service_map(&self, index: usize) -> Option<ServiceMap> {
        if index >= self.count(SERVICE) {
            return None;
        }
        let at = |suffix: &str| {
            self.get(&format!("{}[{}].{}", SERVICE, index, suffix))
                .to_string()
        };
        Some(ServiceMap {
            name: at("Name"),
            service: at("Service"),
            action: at("Action"),
            queue: at("Queue"),
            directory: at("Directory"),
            encryption: EncryptionProfile {
                algorithm: String::new(),
                unc: at("Encryption.Unc"),
                id: at("Encryption.Id"),
                password: at("Encryption.Password"),
            },
            filter: at("Filter"),
        })
    }

    /// Index of the service map matching a service/action pair.
    pub fn service_map_for(&self, service: &str, action: &str) -> Option<usize> {
        (0..self.count(SERVICE)).find(|i| {
            self.get(&format!("{}[{}].Service", SERVICE, i)) == service
                && self.get(&format!("{}[{}].Action", SERVICE, i)) == action
        })
    }

    // queues

    pub fn queue_poll_interval(&self) -> u64 {
        match self.get_int("Phineas.QueueInfo.PollInterval") {
            n if n >= 1 => n as u64,
            _ => 5,
        }
    }

    pub fn queue_max_threads(&self) -> usize {
        match self.get_int("Phineas.QueueInfo.MaxThreads") {
            n if n >= 1 => n as usize,
            _ => 1,
        }
    }

    pub fn queue_types(&self) -> Vec<QueueType> {
        (0..self.count(TYPE))
            .map(|i| {
                let name = self.get(&format!("{}[{}].Name", TYPE, i)).to_string();
                let field_path = format!("{}[{}].Field", TYPE, i);
                let fields: Vec<String> = (0..self.count(&field_path))
                    .map(|f| self.get(&format!("{}[{}]", field_path, f)).to_string())
                    .collect();
                QueueType { name, fields }
            })
            .collect()
    }

    pub fn queue_connections(&self) -> Vec<ConnectionDef> {
        (0..self.count(CONNECTION))
            .map(|i| {
                let at = |suffix: &str| {
                    self.get(&format!("{}[{}].{}", CONNECTION, i, suffix))
                        .to_string()
                };
                ConnectionDef {
                    name: at("Name"),
                    kind: at("Type"),
                    unc: at("Unc"),
                    user: at("Id"),
                    password: at("Password"),
                    driver: at("Driver"),
                }
            })
            .collect()
    }

    pub fn queue_entries(&self) -> Vec<QueueEntry> {
        (0..self.count(QUEUE))
            .map(|i| {
                let at =
                    |suffix: &str| self.get(&format!("{}[{}].{}", QUEUE, i, suffix)).to_string();
                QueueEntry {
                    name: at("Name"),
                    type_name: at("Type"),
                    connection: at("Connection"),
                    table: at("Table"),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<Phineas>
      <Organization>test.lab</Organization>
      <PartyId>test.party</PartyId>
      <Server><Port>8088</Port><SSL><Port>8443</Port></SSL></Server>
      <Sender>
        <MaxRetry>3</MaxRetry>
        <DelayRetry>2</DelayRetry>
        <MapInfo><Map>
          <Name>drop</Name><Folder>in</Folder><Processed>done</Processed>
          <Route>peer</Route><Service>elr</Service><Action>save</Action>
          <Queue>SendQ</Queue><Processor>ebxml</Processor>
          <Encryption><Type>tripledes-cbc</Type><Unc>certs/peer.pem</Unc></Encryption>
        </Map></MapInfo>
        <RouteInfo><Route>
          <Name>peer</Name><PartyId>peer.party</PartyId><Host>peer.example</Host>
          <Port>8089</Port><Path>/phineas/receiver</Path><Protocol>https</Protocol>
          <Cpa>cpa1</Cpa><Retry>2</Retry><Queue>SendQ</Queue>
          <Authentication><Type>basic</Type><Id>u</Id><Password>p</Password></Authentication>
        </Route></RouteInfo>
      </Sender>
      <Receiver>
        <Url>/phineas/receiver</Url>
        <BasicAuth><UserID>alice</UserID><Password>pw</Password></BasicAuth>
        <MapInfo><Map>
          <Name>inbound</Name><Service>elr</Service><Action>save</Action>
          <Queue>RcvQ</Queue><Directory>incoming</Directory>
        </Map></MapInfo>
      </Receiver>
      <QueueInfo>
        <PollInterval>1</PollInterval>
        <MaxThreads>2</MaxThreads>
        <Connection><Name>conn</Name><Type>file</Type><Unc>queues</Unc></Connection>
        <Queue><Name>SendQ</Name><Type>EbXmlSndQ</Type><Connection>conn</Connection><Table>SendQ</Table></Queue>
        <Queue><Name>RcvQ</Name><Type>EbXmlRcvQ</Type><Connection>conn</Connection><Table>RcvQ</Table></Queue>
      </QueueInfo>
    </Phineas>"#;

    #[test]
    fn typed_accessors() {
        let cfg = Config::parse(DOC).unwrap();
        assert_eq!(cfg.organization(), "test.lab");
        assert_eq!(cfg.server_port(), 8088);
        assert_eq!(cfg.server_ssl_port(), 8443);
        assert_eq!(cfg.max_retry(), 3);
        assert_eq!(cfg.sender_poll_interval(), 5); // default
        assert_eq!(cfg.queue_poll_interval(), 1);
    }

    #[test]
    fn maps_and_routes() {
        let cfg = Config::parse(DOC).unwrap();
        let maps = cfg.folder_maps();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].name, "drop");
        assert!(maps[0].encryption.is_configured());
        assert_eq!(cfg.folder_map_index("drop"), Some(0));
        assert_eq!(cfg.folder_map_index("missing"), None);

        let route = cfg.route(cfg.route_index("peer").unwrap()).unwrap();
        assert_eq!(route.host, "peer.example");
        assert_eq!(route.port, 8089);
        assert!(route.is_https());
        assert_eq!(route.auth_type, "basic");
        assert_eq!(route.retry, 2);
    }

    #[test]
    fn service_lookup_by_pair() {
        let cfg = Config::parse(DOC).unwrap();
        assert_eq!(cfg.service_map_for("elr", "save"), Some(0));
        assert_eq!(cfg.service_map_for("elr", "other"), None);
        let map = cfg.service_map(0).unwrap();
        assert_eq!(map.directory, "incoming");
    }

    #[test]
    fn queue_definitions() {
        let cfg = Config::parse(DOC).unwrap();
        let conns = cfg.queue_connections();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].kind, "file");
        let entries = cfg.queue_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].type_name, "EbXmlRcvQ");
        let users = cfg.receiver_users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_id, "alice");
    }

    #[test]
    fn wrong_root_rejected() {
        assert!(Config::parse("<Other/>").is_err());
    }

    #[test]
    fn resolve_against_install_dir() {
        let cfg =
            Config::parse("<Phineas><InstallDirectory>/opt/phineas</InstallDirectory></Phineas>")
                .unwrap();
        assert_eq!(
            cfg.resolve("queues/q.txt"),
            PathBuf::from("/opt/phineas/queues/q.txt")
        );
        assert_eq!(cfg.resolve("/abs/path"), PathBuf::from("/abs/path"));
    }

    #[test]
    fn encrypted_round_trip() {
        // save encrypted against a generated key, then load it back
        use rsa::pkcs8::{EncodePrivateKey, LineEnding};
        let mut rng = rand::thread_rng();
        let key = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let dir = std::env::temp_dir();
        let tag = format!("{}-{:x}", std::process::id(), rand::random::<u64>());
        let key_path = dir.join(format!("phineas-cfgkey-{}.pem", tag));
        std::fs::write(&key_path, key.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes()).unwrap();

        // public side: self-signed certs aren't buildable here, so wrap
        // via the envelope layer with the key pair split by hand
        let cfg = Config::parse(DOC).unwrap();
        let enc_path = dir.join(format!("phineas-cfg-{}.xml", tag));
        let plain = cfg.xml.format();
        let alg = Algorithm::Aes256;
        let sym = alg.generate_key().unwrap();
        let body = crate::crypto::cipher::encrypt(alg, &sym, plain.as_bytes()).unwrap();
        let wrapped = rsa::RsaPublicKey::from(&key)
            .encrypt(&mut rng, rsa::Pkcs1v15Encrypt, &sym)
            .unwrap();
        let mut env = Xml::parse(
            "<EncryptedData><EncryptionMethod Algorithm=\"http://www.w3.org/2001/04/xmlenc#aes256-cbc\"/><KeyInfo><EncryptedKey><CipherData><CipherValue/></CipherData></EncryptedKey></KeyInfo><CipherData><CipherValue/></CipherData></EncryptedData>",
        )
        .unwrap();
        env.set_text(
            "EncryptedData.KeyInfo.EncryptedKey.CipherData.CipherValue",
            &envelope::base64_wrapped(&wrapped),
        )
        .unwrap();
        env.set_text(
            "EncryptedData.CipherData.CipherValue",
            &envelope::base64_wrapped(&body),
        )
        .unwrap();
        std::fs::write(&enc_path, env.format()).unwrap();

        let loaded = Config::load(&enc_path, Some((key_path.as_path(), ""))).unwrap();
        assert_eq!(loaded.organization(), "test.lab");

        // without the key the load must fail loudly
        assert!(Config::load(&enc_path, None).is_err());

        let _ = std::fs::remove_file(&key_path);
        let _ = std::fs::remove_file(&enc_path);
    }
}
