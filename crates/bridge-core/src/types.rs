//! Domain types shared by the edge agent and central controller.
//!
//! The identity tuples and naming rules come straight from the data model:
//! a [`ServiceKey`] identifies a browsed service instance, an
//! [`AddressKey`] identifies one of its host's global addresses, and the
//! escaping/aliasing helpers at the bottom are the single boundary where
//! mDNS-local names are turned into the labels actually written into the
//! zone.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

// ---------------------------------------------------------------------------
// IpVersion
// ---------------------------------------------------------------------------

/// Which IP family a local interface, address, or published record belongs
/// to. Carried as a small enum rather than bare `4`/`6` so call sites read
/// naturally (`IpVersion::V4`) and can't be confused with a port or TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::V4 => 4,
            Self::V6 => 6,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            4 => Some(Self::V4),
            6 => Some(Self::V6),
            _ => None,
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

// ---------------------------------------------------------------------------
// ServiceKey / AddressKey — identity tuples from the data model
// ---------------------------------------------------------------------------

/// Identity tuple of a browsed service instance: `(iface_name, iface_ipver,
/// name, type)`. This is the primary key of the `services` table and the
/// key used to address in-flight resolver/browser subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    pub iface_name: String,
    pub iface_ipver: IpVersion,
    pub name: String,
    pub stype: String,
}

impl ServiceKey {
    pub fn new(
        iface_name: impl Into<String>,
        iface_ipver: IpVersion,
        name: impl Into<String>,
        stype: impl Into<String>,
    ) -> Self {
        Self {
            iface_name: iface_name.into(),
            iface_ipver,
            name: name.into(),
            stype: stype.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.iface_name, self.iface_ipver, self.name, self.stype
        )
    }
}

/// Identity tuple of a host's global address: `(iface_name, iface_ipver,
/// hostname, addr_ipver, address)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressKey {
    pub iface_name: String,
    pub iface_ipver: IpVersion,
    pub hostname: String,
    pub addr_ipver: IpVersion,
    pub address: IpAddr,
}

// ---------------------------------------------------------------------------
// ServiceRecord / AddressRecord — the mutable rows
// ---------------------------------------------------------------------------

/// The full mutable state of one `services` row.
///
/// Invariant upheld by the Reconciler: `announced ⇒ resolved ⇒ hostname is
/// Some`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub key: ServiceKey,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub txt: Option<Vec<u8>>,
    pub resolved: bool,
    pub announced: bool,
}

impl ServiceRecord {
    pub fn new(key: ServiceKey) -> Self {
        Self {
            key,
            hostname: None,
            port: None,
            txt: None,
            resolved: false,
            announced: false,
        }
    }
}

/// One row of the `addresses` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub key: AddressKey,
}

// ---------------------------------------------------------------------------
// Scope — the zone/subdomain an update or query targets
// ---------------------------------------------------------------------------

/// Where a DNS Update or query is rooted: either the router's subdomain
/// (`<router>.<zone>`) for records 1-6, or the bare parent zone for the
/// four per-router records (`b.`/`lb.`/`db._dns-sd._udp`, `public=` TXT).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Subdomain { router: String, zone: String },
    Zone { zone: String },
}

impl Scope {
    /// The fully-qualified domain this scope resolves to, with a trailing
    /// dot, e.g. `home.example.org.` or `example.org.`.
    pub fn fqdn(&self) -> String {
        match self {
            Self::Subdomain { router, zone } => format!("{router}.{}", trim_trailing_dot(zone)),
            Self::Zone { zone } => trim_trailing_dot(zone).to_string(),
        }
    }
}

fn trim_trailing_dot(s: &str) -> &str {
    s.strip_suffix('.').unwrap_or(s)
}

// ---------------------------------------------------------------------------
// Name escaping and aliasing — the boundary into DNSUpdater
// ---------------------------------------------------------------------------

/// Escapes a single DNS label per the rule at the DNSUpdater boundary:
/// spaces, parentheses, backslashes, newlines, carriage returns, and single
/// or double quotes become backslash-escaped. Applied once, right before a
/// label is placed into an owner name.
pub fn escape_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for c in label.chars() {
        match c {
            ' ' | '(' | ')' | '\\' | '\'' | '"' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

/// The longest a single DNS label may be (RFC 1035 §3.1).
pub const MAX_LABEL_LEN: usize = 63;

/// Validates a label is non-empty and within the DNS length limit. Returns
/// `false` if the label would trigger `LABEL_NAME_ERROR` downstream.
pub fn label_is_valid(label: &str) -> bool {
    !label.is_empty() && label.len() <= MAX_LABEL_LEN
}

/// Configured per-interface/per-version aliasing overrides, read from
/// `<ip>`/`<interface>` configuration elements.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    pub interface_aliases: std::collections::HashMap<String, String>,
    pub ip_aliases: std::collections::HashMap<IpVersion, String>,
}

impl AliasTable {
    fn ifc_suffix(&self, iface_name: &str) -> String {
        match self.interface_aliases.get(iface_name) {
            Some(alias) => alias.clone(),
            None => format!(" @ {iface_name}"),
        }
    }

    fn ip_suffix(&self, ipver: IpVersion) -> String {
        match self.ip_aliases.get(&ipver) {
            Some(alias) => alias.clone(),
            None => format!(" (IPv{ipver})"),
        }
    }

    /// Builds the published instance name:
    /// `<mdns_name> <alias> <ifc_suffix> <ip_suffix>`.
    pub fn instance_name(&self, mdns_name: &str, alias: &str, iface_name: &str, ipver: IpVersion) -> String {
        format!(
            "{mdns_name}{alias}{}{}",
            self.ifc_suffix(iface_name),
            self.ip_suffix(ipver)
        )
    }
}

/// Rewrites an mDNS host (`<name>.local`) into its published host label:
/// `<name minus ".local">-<iface>-v<ipver>`.
pub fn rewrite_host(mdns_host: &str, iface_name: &str, ipver: IpVersion) -> String {
    let base = mdns_host.strip_suffix(".local").unwrap_or(mdns_host);
    let base = base.strip_suffix('.').unwrap_or(base);
    format!("{base}-{iface_name}-v{ipver}")
}

/// Whether a host name is link-local per the mDNS convention (ends in
/// `.local` or `.local.`).
pub fn is_local_host(host: &str) -> bool {
    host.ends_with(".local") || host.ends_with(".local.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_label_handles_spaces_and_parens() {
        assert_eq!(escape_label("My Printer (Office)"), r"My\ Printer\ \(Office\)");
    }

    #[test]
    fn escape_label_handles_quotes_and_backslash() {
        assert_eq!(escape_label(r#"a"b'c\d"#), r#"a\"b\'c\\d"#);
    }

    #[test]
    fn label_validity() {
        assert!(!label_is_valid(""));
        assert!(label_is_valid("a"));
        assert!(!label_is_valid(&"a".repeat(64)));
        assert!(label_is_valid(&"a".repeat(63)));
    }

    #[test]
    fn instance_name_uses_default_suffixes() {
        let table = AliasTable::default();
        let name = table.instance_name("WebServer", " @Home", "eth0", IpVersion::V4);
        assert_eq!(name, "WebServer @Home @ eth0 (IPv4)");
    }

    #[test]
    fn instance_name_uses_configured_aliases() {
        let mut table = AliasTable::default();
        table
            .interface_aliases
            .insert("eth0".to_string(), " via LAN".to_string());
        table.ip_aliases.insert(IpVersion::V4, " [v4]".to_string());
        let name = table.instance_name("WebServer", "", "eth0", IpVersion::V4);
        assert_eq!(name, "WebServer via LAN [v4]");
    }

    #[test]
    fn rewrite_host_strips_local_suffix() {
        assert_eq!(
            rewrite_host("amo-laptop.local", "eth0", IpVersion::V4),
            "amo-laptop-eth0-v4"
        );
    }

    #[test]
    fn scope_fqdn() {
        let sub = Scope::Subdomain {
            router: "home".to_string(),
            zone: "example.org.".to_string(),
        };
        assert_eq!(sub.fqdn(), "home.example.org");
        let zone = Scope::Zone {
            zone: "example.org".to_string(),
        };
        assert_eq!(zone.fqdn(), "example.org");
    }

    #[test]
    fn is_local_host_detection() {
        assert!(is_local_host("amo-laptop.local"));
        assert!(is_local_host("amo-laptop.local."));
        assert!(!is_local_host("amo-laptop.example.org"));
    }
}
