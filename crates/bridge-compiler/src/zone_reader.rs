//! Walks the published DNS-SD zone from the central side: `b._dns-sd._udp`
//! to discover routers, `_services._dns-sd._udp` for service types, the
//! per-type PTR for instances, and SRV/AAAA/A for each instance's
//! host/port/addresses.
//!
//! Every name read off the wire is a [`hickory_proto::rr::Name`]; its raw
//! label bytes are already unescaped, so turning a label into the plain
//! string the rest of this crate works with is just a UTF-8 decode of that
//! label — no separate unescaping step is needed.

use bridge_core::config::DomainConfig;
use bridge_core::dnssd::BROWSE_LABEL;
use hickory_client::client::{Client, ClientHandle};
use hickory_proto::op::Query;
use hickory_proto::rr::{DNSClass, Name, RecordType};
use hickory_proto::runtime::TokioRuntimeProvider;
use hickory_proto::tcp::TcpClientStream;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const DNS_PORT: u16 = 53;

#[derive(Debug, Error)]
pub enum ZoneReaderError {
    #[error("could not resolve nameserver {0}")]
    NsUnresolved(String),
    #[error("could not connect to nameserver: {0}")]
    Connect(String),
    #[error("zone name is invalid: {0}")]
    InvalidZone(String),
}

/// One service instance discovered under a type, as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub name: String,
    pub port: u16,
    pub host: String,
    pub addresses: Vec<IpAddr>,
}

/// `{ router : { full_type_name : [services] } }`, e.g.
/// `{ "home" : { "_http._tcp.home.example.org." : [...] } }`.
pub type ZoneSnapshot = HashMap<String, HashMap<String, Vec<DiscoveredService>>>;

/// Reads the zone's published DNS-SD tree and its SOA serial over plain DNS
/// queries (no TSIG needed — these are ordinary lookups, not updates).
pub struct ZoneReader {
    server: String,
    zone: Name,
}

impl ZoneReader {
    pub fn new(domain: &DomainConfig) -> Result<Self, ZoneReaderError> {
        let zone = Name::from_str(&domain.zone)
            .map_err(|e| ZoneReaderError::InvalidZone(e.to_string()))?;
        Ok(Self {
            server: domain.server.clone(),
            zone,
        })
    }

    async fn connect(&self) -> Result<Client, ZoneReaderError> {
        let target = format!("{}:{}", self.server, DNS_PORT);
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| ZoneReaderError::NsUnresolved(e.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(ZoneReaderError::NsUnresolved(self.server.clone()));
        }
        let mut ordered: Vec<SocketAddr> = addrs.iter().filter(|a| a.is_ipv6()).copied().collect();
        ordered.extend(addrs.iter().filter(|a| a.is_ipv4()).copied());

        let mut last_err = String::from("no addresses");
        for addr in ordered {
            let (stream, sender) =
                TcpClientStream::new(addr, None, Some(QUERY_TIMEOUT), TokioRuntimeProvider::new());
            match Client::new(stream, sender, None).await {
                Ok((client, bg)) => {
                    tokio::spawn(bg);
                    return Ok(client);
                }
                Err(e) => last_err = e.to_string(),
            }
        }
        Err(ZoneReaderError::Connect(last_err))
    }

    async fn query_names(
        client: &mut Client,
        name: Name,
        rtype: RecordType,
    ) -> Option<Vec<Name>> {
        match client.query(name, DNSClass::IN, rtype).await {
            Ok(response) => Some(
                response
                    .answers()
                    .iter()
                    .filter_map(|r| match rtype {
                        RecordType::PTR => r.data().as_ptr().map(|p| p.0.clone()),
                        RecordType::SRV => r.data().as_srv().map(|s| s.target().clone()),
                        _ => None,
                    })
                    .collect(),
            ),
            Err(_) => None,
        }
    }

    async fn query_addresses(client: &mut Client, host: Name) -> Option<Vec<IpAddr>> {
        let mut addrs = Vec::new();
        if let Ok(response) = client
            .query(host.clone(), DNSClass::IN, RecordType::AAAA)
            .await
        {
            addrs.extend(
                response
                    .answers()
                    .iter()
                    .filter_map(|r| r.data().as_aaaa().map(|a| IpAddr::V6(a.0))),
            );
        }
        if let Ok(response) = client
            .query(host, DNSClass::IN, RecordType::A)
            .await
        {
            addrs.extend(
                response
                    .answers()
                    .iter()
                    .filter_map(|r| r.data().as_a().map(|a| IpAddr::V4(a.0))),
            );
        }
        Some(addrs)
    }

    /// Fetches the zone's current SOA serial; `None` on any query failure.
    pub async fn read_soa_serial(&self) -> Option<u32> {
        let mut client = self.connect().await.ok()?;
        let mut query = Query::new();
        query.set_name(self.zone.clone());
        query.set_query_class(DNSClass::IN);
        query.set_query_type(RecordType::SOA);

        match client
            .query(self.zone.clone(), DNSClass::IN, RecordType::SOA)
            .await
        {
            Ok(response) => response
                .answers()
                .iter()
                .find_map(|r| r.data().as_soa().map(|s| s.serial())),
            Err(_) => None,
        }
    }

    /// Fetches a router's `public=ifc1,ifc2` TXT record at the parent zone.
    pub async fn read_public_interfaces(&self, router: &str) -> Option<Vec<String>> {
        let mut client = self.connect().await.ok()?;
        let owner = Name::from_str(router).ok()?.append_domain(&self.zone).ok()?;

        match client.query(owner, DNSClass::IN, RecordType::TXT).await {
            Ok(response) => {
                let strings: Vec<String> = response
                    .answers()
                    .iter()
                    .filter_map(|r| r.data().as_txt())
                    .flat_map(|txt| txt.iter().map(|b| String::from_utf8_lossy(b).into_owned()))
                    .collect();
                Some(
                    strings
                        .iter()
                        .find_map(|s| {
                            let interfaces = bridge_core::dnssd::parse_public_interfaces(s);
                            (!interfaces.is_empty()).then_some(interfaces)
                        })
                        .unwrap_or_default(),
                )
            }
            Err(_) => None,
        }
    }

    /// Performs the full tree walk described in the module docs. Returns
    /// `None` on any intermediate DNS failure (the caller retries next
    /// tick), `Some(snapshot)` otherwise — a zone with no published
    /// routers yields `Some(empty map)`.
    pub async fn read(&self) -> Option<ZoneSnapshot> {
        let mut client = self.connect().await.ok()?;

        let browse_name = Name::from_str(BROWSE_LABEL)
            .ok()?
            .append_domain(&self.zone)
            .ok()?;
        let routers_names = Self::query_names(&mut client, browse_name, RecordType::PTR).await?;

        let mut snapshot = ZoneSnapshot::new();

        for router_name in routers_names {
            let router = first_label(&router_name);

            let services_name = Name::from_str("_services._dns-sd._udp")
                .ok()?
                .append_domain(&router_name)
                .ok()?;
            let stype_names =
                match Self::query_names(&mut client, services_name, RecordType::PTR).await {
                    Some(names) => names,
                    None => {
                        debug!(router, "no service types published");
                        continue;
                    }
                };

            let mut types: HashMap<String, Vec<DiscoveredService>> = HashMap::new();

            for stype_name in stype_names {
                let instance_names =
                    match Self::query_names(&mut client, stype_name.clone(), RecordType::PTR).await
                    {
                        Some(names) => names,
                        None => return None,
                    };

                let mut services = Vec::new();
                for instance_name in instance_names {
                    let targets =
                        match Self::query_names(&mut client, instance_name.clone(), RecordType::SRV)
                            .await
                        {
                            Some(t) => t,
                            None => return None,
                        };
                    let Some(host_name) = targets.into_iter().next() else {
                        continue;
                    };

                    let port = match client
                        .query(instance_name.clone(), DNSClass::IN, RecordType::SRV)
                        .await
                    {
                        Ok(response) => response
                            .answers()
                            .iter()
                            .find_map(|r| r.data().as_srv().map(|s| s.port())),
                        Err(_) => None,
                    };
                    let Some(port) = port else { continue };

                    let addresses = match Self::query_addresses(&mut client, host_name.clone()).await
                    {
                        Some(a) => a,
                        None => return None,
                    };

                    services.push(DiscoveredService {
                        name: first_label(&instance_name),
                        port,
                        host: host_name.to_utf8(),
                        addresses,
                    });
                }

                types.insert(stype_name.to_utf8(), services);
            }

            snapshot.insert(router, types);
        }

        Some(snapshot)
    }
}

/// Decodes the first label of a name as a plain UTF-8 string. Raw label
/// bytes are not DNS-escaped, so this is the full unescaping step.
fn first_label(name: &Name) -> String {
    name.iter()
        .next()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_label_extracts_unescaped_name() {
        let name = Name::from_ascii("WebServer._http._tcp.home.example.org.").unwrap();
        assert_eq!(first_label(&name), "WebServer");
    }

    #[test]
    fn first_label_of_router_ptr_target() {
        let name = Name::from_ascii("home.example.org.").unwrap();
        assert_eq!(first_label(&name), "home");
    }
}
