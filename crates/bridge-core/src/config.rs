//! XML configuration loading.
//!
//! The config file lives at a platform-appropriate location:
//! - Linux: `~/.config/bridge/config.xml`
//! - macOS: `~/Library/Application Support/bridge/config.xml`
//!
//! The document is validated against the embedded DTD in [`CONFIG_DTD`]
//! before any element is interpreted semantically, then walked with
//! `roxmltree` to build a [`Config`].
//!
//! # Config File Format (XML)
//!
//! ```xml
//! <config name="home" alias=" @Home" public-interfaces="eth1,eth2">
//!   <log level="info"/>
//!   <domain name="home" server="ns.example.org" zone="example.org."
//!           keyname="update-key" keyvalue="c2VjcmV0a2V5MTIzNA=="
//!           algorithm="HMAC_SHA256" ttl="300"/>
//!   <update rate="60"/>
//!   <rules>
//!     <rule name=".*" type="_http\._tcp" interface-name=".*" interface-ip=".*"
//!           hostname=".*" port=".*">allow</rule>
//!   </rules>
//! </config>
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The DTD the configuration document is validated against before any
/// element is interpreted. Kept next to the parser as a plain constant —
/// it is never fetched over the network, only used to check document
/// structure.
pub const CONFIG_DTD: &str = r#"<!ELEMENT config (log?, domain, update?, database?, rules?, ip*, interface*)>
<!ATTLIST config name CDATA #IMPLIED>
<!ATTLIST config alias CDATA #IMPLIED>
<!ATTLIST config public-interfaces CDATA #IMPLIED>
<!ELEMENT log EMPTY>
<!ATTLIST log level (debug|info|warning|error) "info">
<!ELEMENT domain EMPTY>
<!ATTLIST domain name CDATA #REQUIRED>
<!ATTLIST domain server CDATA #REQUIRED>
<!ATTLIST domain zone CDATA #REQUIRED>
<!ATTLIST domain keyname CDATA #REQUIRED>
<!ATTLIST domain keyvalue CDATA #REQUIRED>
<!ATTLIST domain algorithm CDATA #REQUIRED>
<!ATTLIST domain ttl CDATA "300">
<!ELEMENT update EMPTY>
<!ATTLIST update rate CDATA "60">
<!ELEMENT database EMPTY>
<!ATTLIST database user CDATA #IMPLIED>
<!ATTLIST database password CDATA #IMPLIED>
<!ATTLIST database name CDATA #IMPLIED>
<!ATTLIST database host CDATA #IMPLIED>
<!ATTLIST database socket CDATA #IMPLIED>
<!ATTLIST database port CDATA #IMPLIED>
<!ELEMENT rules (rule*)>
<!ELEMENT rule (#PCDATA)>
<!ATTLIST rule name CDATA #REQUIRED>
<!ATTLIST rule type CDATA #REQUIRED>
<!ATTLIST rule interface-name CDATA #REQUIRED>
<!ATTLIST rule interface-ip CDATA #REQUIRED>
<!ATTLIST rule hostname CDATA #REQUIRED>
<!ATTLIST rule port CDATA #REQUIRED>
<!ATTLIST rule router CDATA #IMPLIED>
<!ATTLIST rule src-address CDATA #IMPLIED>
<!ATTLIST rule src-prefix-length CDATA #IMPLIED>
<!ELEMENT ip EMPTY>
<!ATTLIST ip version (4|6) #REQUIRED>
<!ATTLIST ip alias CDATA #REQUIRED>
<!ELEMENT interface EMPTY>
<!ATTLIST interface name CDATA #REQUIRED>
<!ATTLIST interface alias CDATA #REQUIRED>
"#;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse XML at {path}: {source}")]
    ParseXml {
        path: PathBuf,
        source: roxmltree::Error,
    },

    #[error("config at {path} failed DTD validation: {reason}")]
    InvalidStructure { path: PathBuf, reason: String },

    #[error("invalid value for <{element} {attr}>: {value}")]
    InvalidValue {
        element: &'static str,
        attr: &'static str,
        value: String,
    },

    #[error("missing required attribute <{element} {attr}>")]
    MissingAttribute { element: &'static str, attr: &'static str },

    #[error("could not determine config directory for this platform")]
    NoConfigDir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Maps the configured level onto the `tracing` level hierarchy.
    /// `warning` has no direct `tracing::Level` counterpart and is mapped
    /// onto `WARN`.
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warning => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

/// The six TSIG algorithms the `<domain algorithm="...">` attribute may
/// name; anything else is a configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsigAlgorithm {
    HmacMd5,
    HmacSha1,
    HmacSha224,
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

impl TsigAlgorithm {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HMAC_MD5" | "HMAC-MD5" => Some(Self::HmacMd5),
            "HMAC_SHA1" | "HMAC-SHA1" => Some(Self::HmacSha1),
            "HMAC_SHA224" | "HMAC-SHA224" => Some(Self::HmacSha224),
            "HMAC_SHA256" | "HMAC-SHA256" => Some(Self::HmacSha256),
            "HMAC_SHA384" | "HMAC-SHA384" => Some(Self::HmacSha384),
            "HMAC_SHA512" | "HMAC-SHA512" => Some(Self::HmacSha512),
            _ => None,
        }
    }
}

/// The `<domain>` element: server identity, zone, and TSIG key material.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// The router's subdomain label (`<router>` in `<router>.<zone>`).
    pub name: String,
    pub server: String,
    pub zone: String,
    pub keyname: String,
    /// Decoded TSIG key bytes (the XML attribute is base64).
    pub keyvalue: Vec<u8>,
    pub algorithm: TsigAlgorithm,
    /// Record TTL in seconds, clamped to `[1, 2^31-1]`.
    pub ttl: u32,
}

/// The `<database>` element: store connection parameters. For the edge
/// agent, `name`/`host` are reused as the SQLite file path when
/// `socket`/`port` are absent; the central controller has no store and
/// ignores this element.
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
    pub host: Option<String>,
    pub socket: Option<String>,
    pub port: Option<u16>,
}

impl DatabaseConfig {
    /// Resolves the SQLite file path this store connection addresses.
    pub fn sqlite_path(&self) -> Option<PathBuf> {
        self.name
            .as_ref()
            .or(self.host.as_ref())
            .map(PathBuf::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Deny,
}

impl RuleAction {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

/// One `<rule>` child of `<rules>`. The edge fields are always present;
/// the three central-only fields (`router`, `src_address`,
/// `src_prefix_length`) are `None` for an edge config.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub stype: String,
    pub interface_name: String,
    pub interface_ip: String,
    pub hostname: String,
    pub port: String,
    pub action: RuleAction,
    pub router: Option<String>,
    pub src_address: Option<String>,
    pub src_prefix_length: Option<String>,
}

/// Anchors `pattern` at the start of the string, matching Python's
/// `re.match()` semantics rather than `regex`'s unanchored default.
pub fn anchor_pattern(pattern: &str) -> String {
    format!("^(?:{pattern})")
}

/// Parsed configuration document, covering both the edge and central
/// binaries' needs. Each binary only reads the fields relevant to it; a
/// malformed document is rejected by [`Config::load_from`] regardless of
/// which binary loads it.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: LogLevel,
    pub domain: DomainConfig,
    /// Central-only: reconciliation tick rate, in seconds.
    pub update_rate_secs: Option<u64>,
    pub database: Option<DatabaseConfig>,
    pub rules: Vec<Rule>,
    pub ip_aliases: HashMap<u8, String>,
    pub interface_aliases: HashMap<String, String>,
    /// Edge-only root attribute: this site's own router name
    /// (`^[a-z0-9]+$`).
    pub edge_name: Option<String>,
    pub edge_alias: Option<String>,
    /// Edge-only root attribute: WAN-side interfaces this router forwards
    /// through, published as the per-router `public=` TXT record.
    pub public_interfaces: Vec<String>,
}

impl Config {
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("bridge"))
    }

    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("config.xml"))
    }

    pub fn data_dir() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join("bridge"))
    }

    pub fn default_db_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::data_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("bridge.db"))
    }

    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_file_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_owned(),
            source: e,
        })?;
        let doc = roxmltree::Document::parse(&content).map_err(|e| ConfigError::ParseXml {
            path: path.to_owned(),
            source: e,
        })?;
        validate_structure(&doc).map_err(|reason| ConfigError::InvalidStructure {
            path: path.to_owned(),
            reason,
        })?;
        parse_config(&doc)
    }
}

/// Checks the document's element/attribute structure against the shape
/// described by [`CONFIG_DTD`] (required elements present, no unknown
/// required attributes missing). This is a lightweight structural check
/// rather than a full DTD-validating parser — the DTD's purpose here is to
/// document and pin the schema, not to be executed by an external engine.
fn validate_structure(doc: &roxmltree::Document) -> Result<(), String> {
    let root = doc.root_element();
    if root.tag_name().name() != "config" {
        return Err(format!("root element must be <config>, found <{}>", root.tag_name().name()));
    }
    let domain_count = root.children().filter(|n| n.has_tag_name("domain")).count();
    if domain_count != 1 {
        return Err(format!("<config> must contain exactly one <domain>, found {domain_count}"));
    }
    for domain in root.children().filter(|n| n.has_tag_name("domain")) {
        for attr in ["name", "server", "zone", "keyname", "keyvalue", "algorithm"] {
            if domain.attribute(attr).is_none() {
                return Err(format!("<domain> missing required attribute '{attr}'"));
            }
        }
    }
    for rules in root.children().filter(|n| n.has_tag_name("rules")) {
        for rule in rules.children().filter(|n| n.has_tag_name("rule")) {
            for attr in ["name", "type", "interface-name", "interface-ip", "hostname", "port"] {
                if rule.attribute(attr).is_none() {
                    return Err(format!("<rule> missing required attribute '{attr}'"));
                }
            }
        }
    }
    Ok(())
}

fn parse_config(doc: &roxmltree::Document) -> Result<Config, ConfigError> {
    let root = doc.root_element();

    let log_level = root
        .children()
        .find(|n| n.has_tag_name("log"))
        .and_then(|n| n.attribute("level"))
        .map(|s| LogLevel::parse(s).ok_or_else(|| ConfigError::InvalidValue {
            element: "log",
            attr: "level",
            value: s.to_string(),
        }))
        .transpose()?
        .unwrap_or(LogLevel::Info);

    let domain_node = root
        .children()
        .find(|n| n.has_tag_name("domain"))
        .expect("validated by validate_structure");
    let domain = parse_domain(&domain_node)?;

    let update_rate_secs = root
        .children()
        .find(|n| n.has_tag_name("update"))
        .and_then(|n| n.attribute("rate"))
        .map(|s| {
            s.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                element: "update",
                attr: "rate",
                value: s.to_string(),
            })
        })
        .transpose()?;

    let database = root
        .children()
        .find(|n| n.has_tag_name("database"))
        .map(|n| -> Result<DatabaseConfig, ConfigError> {
            let port = n
                .attribute("port")
                .map(|s| {
                    s.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                        element: "database",
                        attr: "port",
                        value: s.to_string(),
                    })
                })
                .transpose()?;
            Ok(DatabaseConfig {
                user: n.attribute("user").map(str::to_string),
                password: n.attribute("password").map(str::to_string),
                name: n.attribute("name").map(str::to_string),
                host: n.attribute("host").map(str::to_string),
                socket: n.attribute("socket").map(str::to_string),
                port,
            })
        })
        .transpose()?;

    let rules = root
        .children()
        .find(|n| n.has_tag_name("rules"))
        .map(|rules_node| {
            rules_node
                .children()
                .filter(|n| n.has_tag_name("rule"))
                .map(parse_rule)
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    let mut ip_aliases = HashMap::new();
    for ip in root.children().filter(|n| n.has_tag_name("ip")) {
        let version = ip
            .attribute("version")
            .ok_or(ConfigError::MissingAttribute { element: "ip", attr: "version" })?;
        let version: u8 = version.parse().map_err(|_| ConfigError::InvalidValue {
            element: "ip",
            attr: "version",
            value: version.to_string(),
        })?;
        let alias = ip
            .attribute("alias")
            .ok_or(ConfigError::MissingAttribute { element: "ip", attr: "alias" })?;
        ip_aliases.insert(version, alias.to_string());
    }

    let mut interface_aliases = HashMap::new();
    for ifc in root.children().filter(|n| n.has_tag_name("interface")) {
        let name = ifc
            .attribute("name")
            .ok_or(ConfigError::MissingAttribute { element: "interface", attr: "name" })?;
        let alias = ifc
            .attribute("alias")
            .ok_or(ConfigError::MissingAttribute { element: "interface", attr: "alias" })?;
        interface_aliases.insert(name.to_string(), alias.to_string());
    }

    let edge_name = root
        .attribute("name")
        .map(|s| {
            if s.is_empty() || !s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
                Err(ConfigError::InvalidValue {
                    element: "config",
                    attr: "name",
                    value: s.to_string(),
                })
            } else {
                Ok(s.to_string())
            }
        })
        .transpose()?;
    let edge_alias = root.attribute("alias").map(str::to_string);
    let public_interfaces = root
        .attribute("public-interfaces")
        .map(|s| s.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();

    Ok(Config {
        log_level,
        domain,
        update_rate_secs,
        database,
        rules,
        ip_aliases,
        interface_aliases,
        edge_name,
        edge_alias,
        public_interfaces,
    })
}

fn parse_domain(node: &roxmltree::Node) -> Result<DomainConfig, ConfigError> {
    let name = node.attribute("name").expect("validated").to_string();
    let server = node.attribute("server").expect("validated").to_string();
    let zone = node.attribute("zone").expect("validated").to_string();
    let keyname = node.attribute("keyname").expect("validated").to_string();
    let keyvalue_b64 = node.attribute("keyvalue").expect("validated");
    let keyvalue = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, keyvalue_b64)
        .map_err(|_| ConfigError::InvalidValue {
            element: "domain",
            attr: "keyvalue",
            value: keyvalue_b64.to_string(),
        })?;
    let algorithm_raw = node.attribute("algorithm").expect("validated");
    let algorithm = TsigAlgorithm::parse(algorithm_raw).ok_or_else(|| ConfigError::InvalidValue {
        element: "domain",
        attr: "algorithm",
        value: algorithm_raw.to_string(),
    })?;
    let ttl = match node.attribute("ttl") {
        Some(s) => s.parse::<i64>().map_err(|_| ConfigError::InvalidValue {
            element: "domain",
            attr: "ttl",
            value: s.to_string(),
        })?,
        None => 300,
    };
    let ttl = ttl.clamp(1, i32::MAX as i64) as u32;

    Ok(DomainConfig {
        name,
        server,
        zone,
        keyname,
        keyvalue,
        algorithm,
        ttl,
    })
}

fn parse_rule(node: roxmltree::Node) -> Result<Rule, ConfigError> {
    let get = |attr: &'static str| -> Result<String, ConfigError> {
        node.attribute(attr)
            .map(str::to_string)
            .ok_or(ConfigError::MissingAttribute { element: "rule", attr })
    };
    let action_raw = node.text().unwrap_or("").trim();
    let action = RuleAction::parse(action_raw).ok_or_else(|| ConfigError::InvalidValue {
        element: "rule",
        attr: "action",
        value: action_raw.to_string(),
    })?;
    Ok(Rule {
        name: get("name")?,
        stype: get("type")?,
        interface_name: get("interface-name")?,
        interface_ip: get("interface-ip")?,
        hostname: get("hostname")?,
        port: get("port")?,
        action,
        router: node.attribute("router").map(str::to_string),
        src_address: node.attribute("src-address").map(str::to_string),
        src_prefix_length: node.attribute("src-prefix-length").map(str::to_string),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(tmp: &TempDir, xml: &str) -> PathBuf {
        let path = tmp.path().join("config.xml");
        std::fs::write(&path, xml).unwrap();
        path
    }

    #[test]
    fn minimal_config_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            &tmp,
            r#"<config name="home" alias=" @Home" public-interfaces="eth1,eth2">
                 <log level="debug"/>
                 <domain name="home" server="ns.example.org" zone="example.org."
                         keyname="update-key" keyvalue="c2VjcmV0a2V5MTIzNA=="
                         algorithm="HMAC_SHA256" ttl="5"/>
                 <rules>
                   <rule name=".*" type="_http\._tcp" interface-name=".*"
                         interface-ip=".*" hostname=".*" port=".*">allow</rule>
                 </rules>
               </config>"#,
        );
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.domain.name, "home");
        assert_eq!(config.domain.zone, "example.org.");
        assert_eq!(config.domain.ttl, 5);
        assert_eq!(config.domain.algorithm, TsigAlgorithm::HmacSha256);
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].action, RuleAction::Allow);
        assert_eq!(config.public_interfaces, vec!["eth1", "eth2"]);
        assert!(matches!(config.log_level, LogLevel::Debug));
    }

    #[test]
    fn ttl_is_clamped() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            &tmp,
            r#"<config>
                 <domain name="home" server="ns.example.org" zone="example.org."
                         keyname="k" keyvalue="a2V5" algorithm="HMAC_SHA256" ttl="0"/>
               </config>"#,
        );
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.domain.ttl, 1);
    }

    #[test]
    fn missing_domain_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(&tmp, r#"<config></config>"#);
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn invalid_algorithm_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            &tmp,
            r#"<config>
                 <domain name="home" server="ns.example.org" zone="example.org."
                         keyname="k" keyvalue="a2V5" algorithm="NOT_REAL"/>
               </config>"#,
        );
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn invalid_edge_name_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            &tmp,
            r#"<config name="Not Valid!">
                 <domain name="home" server="ns.example.org" zone="example.org."
                         keyname="k" keyvalue="a2V5" algorithm="HMAC_SHA256"/>
               </config>"#,
        );
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn central_rule_attributes_are_optional_on_edge() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(
            &tmp,
            r#"<config>
                 <domain name="rtr1" server="ns.example.org" zone="zone."
                         keyname="k" keyvalue="a2V5" algorithm="HMAC_SHA256"/>
                 <rules>
                   <rule router="*" name=".*" type="_http\._tcp" interface-name=".*"
                         interface-ip=".*" hostname=".*" port=".*"
                         src-address="0.0.0.0" src-prefix-length="0">allow</rule>
                 </rules>
               </config>"#,
        );
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.rules[0].router.as_deref(), Some("*"));
        assert_eq!(config.rules[0].src_address.as_deref(), Some("0.0.0.0"));
    }
}
