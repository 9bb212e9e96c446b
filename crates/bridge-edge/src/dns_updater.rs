//! RFC 2136 Dynamic Update transport.
//!
//! # Why connect-per-transaction?
//!
//! Every public operation here opens a fresh TCP connection, signs and
//! sends one update message, and closes. For the rate at which the
//! Reconciler publishes changes this is simpler than pooling a connection,
//! and it sidesteps having to notice a half-dead connection to the
//! nameserver. If update volume ever becomes a bottleneck this is the
//! first place to add pooling.

use bridge_core::config::{DomainConfig, TsigAlgorithm as ConfigTsigAlgorithm};
use bridge_core::error::DnsOutcome;
use bridge_core::types::{escape_label, label_is_valid, IpVersion, Scope};
use hickory_client::client::{Client, ClientHandle};
use hickory_proto::dnssec::rdata::tsig::TsigAlgorithm;
use hickory_proto::dnssec::tsig::TSigner;
use hickory_proto::op::{update_message::UpdateMessage, Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::{PTR, SRV, TXT, A, AAAA};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::runtime::TokioRuntimeProvider;
use hickory_proto::tcp::TcpClientStream;
use hickory_proto::DnsHandle;
use tokio_stream::StreamExt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

const UPDATE_TIMEOUT: Duration = Duration::from_secs(5);
const DNS_PORT: u16 = 53;

fn map_tsig_algorithm(alg: ConfigTsigAlgorithm) -> TsigAlgorithm {
    match alg {
        ConfigTsigAlgorithm::HmacMd5 => TsigAlgorithm::HmacMd5,
        ConfigTsigAlgorithm::HmacSha1 => TsigAlgorithm::HmacSha1,
        ConfigTsigAlgorithm::HmacSha224 => TsigAlgorithm::HmacSha224,
        ConfigTsigAlgorithm::HmacSha256 => TsigAlgorithm::HmacSha256,
        ConfigTsigAlgorithm::HmacSha384 => TsigAlgorithm::HmacSha384,
        ConfigTsigAlgorithm::HmacSha512 => TsigAlgorithm::HmacSha512,
    }
}

/// Executes RFC 2136 Dynamic Update transactions against one nameserver.
pub struct DnsUpdater {
    domain: DomainConfig,
    zone: Name,
}

/// One record to stage into a combined update transaction.
enum Staged {
    Add { name: Name, rdata: RData, ttl: u32 },
    DeleteRrset { name: Name, rtype: RecordType },
    DeleteRdata { name: Name, rdata: RData },
}

impl Staged {
    fn into_record(self, class: DNSClass) -> Record {
        match self {
            Staged::Add { name, rdata, ttl } => {
                let mut record = Record::from_rdata(name, ttl, rdata);
                record.set_dns_class(class);
                record
            }
            Staged::DeleteRrset { name, rtype } => {
                let mut record = Record::update0(name, 0, rtype);
                record.set_dns_class(DNSClass::ANY);
                record
            }
            Staged::DeleteRdata { name, rdata } => {
                let mut record = Record::from_rdata(name, 0, rdata);
                record.set_dns_class(DNSClass::NONE);
                record
            }
        }
    }
}

/// Checks every dot-separated label of `name` against [`label_is_valid`]
/// before handing the string to `Name::from_str`, so an oversized or empty
/// label produces a deterministic [`DnsOutcome::LabelNameError`] rather than
/// whatever `hickory_proto`'s parser happens to report.
fn check_labels(name: &str) -> Result<(), DnsOutcome> {
    if name.trim_end_matches('.').split('.').all(label_is_valid) {
        Ok(())
    } else {
        Err(DnsOutcome::LabelNameError)
    }
}

impl DnsUpdater {
    pub fn new(domain: DomainConfig) -> Result<Self, DnsOutcome> {
        check_labels(&domain.zone)?;
        let zone = Name::from_str(&domain.zone).map_err(|_| DnsOutcome::LabelNameError)?;
        Ok(Self { domain, zone })
    }

    fn owner_name(&self, label: &str, scope: &Scope) -> Result<Name, DnsOutcome> {
        if !label.is_empty() && !label_is_valid(label) {
            return Err(DnsOutcome::LabelNameError);
        }
        let fqdn = scope.fqdn();
        let full = if label.is_empty() {
            fqdn
        } else {
            format!("{}.{}", escape_label(label), fqdn)
        };
        Name::from_str(&full).map_err(|_| DnsOutcome::LabelNameError)
    }

    async fn connect(&self, addr: SocketAddr) -> Result<Client, DnsOutcome> {
        check_labels(&self.domain.keyname)?;
        let key_name = Name::from_str(&self.domain.keyname).map_err(|_| DnsOutcome::LabelNameError)?;
        let signer = TSigner::new(
            self.domain.keyvalue.clone(),
            map_tsig_algorithm(self.domain.algorithm),
            key_name,
            300,
        )
        .map_err(|_| DnsOutcome::NsQueryingError)?;

        let (stream, sender) = TcpClientStream::new(
            addr,
            None,
            Some(UPDATE_TIMEOUT),
            TokioRuntimeProvider::new(),
        );

        match Client::new(stream, sender, Some(Arc::new(signer))).await {
            Ok((client, bg)) => {
                tokio::spawn(bg);
                Ok(client)
            }
            Err(e) => {
                warn!(error = %e, addr = %addr, "failed to connect to nameserver");
                Err(DnsOutcome::SocketError)
            }
        }
    }

    /// Opens a connection, preferring the resolved IPv6 address and falling
    /// back to IPv4 once on failure.
    async fn connect_any(&self) -> Result<Client, DnsOutcome> {
        let target = format!("{}:{}", self.domain.server, DNS_PORT);
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&target)
            .await
            .map_err(|_| DnsOutcome::NsUnresolved)?
            .collect();
        if addrs.is_empty() {
            return Err(DnsOutcome::NsUnresolved);
        }

        let mut ordered: Vec<SocketAddr> = addrs.iter().filter(|a| a.is_ipv6()).copied().collect();
        ordered.extend(addrs.iter().filter(|a| a.is_ipv4()).copied());

        let mut last_err = DnsOutcome::NsQueryingError;
        for addr in ordered {
            match self.connect(addr).await {
                Ok(client) => return Ok(client),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn send_transaction(&self, zone: &Name, updates: Vec<Record>) -> DnsOutcome {
        let client = match self.connect_any().await {
            Ok(c) => c,
            Err(e) => return e,
        };

        let mut zone_query = Query::new();
        zone_query.set_name(zone.clone());
        zone_query.set_query_class(DNSClass::IN);
        zone_query.set_query_type(RecordType::SOA);

        let id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u16)
            .unwrap_or(0);

        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Update)
            .set_recursion_desired(false);
        message.add_zone(zone_query);
        message.add_updates(updates);

        match client.send(message).next().await {
            Some(Ok(response)) => {
                DnsOutcome::from_rcode(u16::from(response.response_code())).unwrap_or(DnsOutcome::ServFail)
            }
            Some(Err(e)) => {
                debug!(error = %e, "dynamic update transaction failed");
                DnsOutcome::SocketError
            }
            None => {
                debug!("dynamic update transaction returned no response");
                DnsOutcome::SocketError
            }
        }
    }

    pub async fn add_record(
        &self,
        name: &str,
        rtype: RecordType,
        rdata: RData,
        ttl: u32,
        scope: Scope,
    ) -> DnsOutcome {
        let owner = match self.owner_name(name, &scope) {
            Ok(n) => n,
            Err(e) => return e,
        };
        debug_assert_eq!(rtype, rdata.record_type());
        let record = Staged::Add { name: owner, rdata, ttl }.into_record(DNSClass::IN);
        self.send_transaction(&self.zone.clone(), vec![record]).await
    }

    pub async fn remove_record(
        &self,
        name: &str,
        rtype: RecordType,
        rdata: Option<RData>,
        scope: Scope,
    ) -> DnsOutcome {
        let owner = match self.owner_name(name, &scope) {
            Ok(n) => n,
            Err(e) => return e,
        };
        let staged = match rdata {
            Some(rdata) => Staged::DeleteRdata { name: owner, rdata },
            None => Staged::DeleteRrset { name: owner, rtype },
        };
        let record = match &staged {
            Staged::DeleteRdata { .. } => staged.into_record(DNSClass::NONE),
            _ => staged.into_record(DNSClass::ANY),
        };
        self.send_transaction(&self.zone.clone(), vec![record]).await
    }

    /// Atomically publishes records 1-4 and each present address (5/6).
    #[allow(clippy::too_many_arguments)]
    pub async fn add_service(
        &self,
        instance: &str,
        stype: &str,
        host: &str,
        addresses: &[(IpVersion, IpAddr)],
        port: u16,
        txt: &[String],
        ttl: u32,
        scope: Scope,
    ) -> DnsOutcome {
        let services_name = match self.owner_name("_services._dns-sd._udp", &scope) {
            Ok(n) => n,
            Err(e) => return e,
        };
        let stype_name = match self.owner_name(stype, &scope) {
            Ok(n) => n,
            Err(e) => return e,
        };
        let instance_name = match self.owner_name(&format!("{instance}.{stype}"), &scope) {
            Ok(n) => n,
            Err(e) => return e,
        };
        let host_name = match self.owner_name(host, &scope) {
            Ok(n) => n,
            Err(e) => return e,
        };

        let mut updates = vec![
            Staged::Add { name: services_name, rdata: RData::PTR(PTR(stype_name.clone())), ttl }
            .into_record(DNSClass::IN),
            Staged::Add { name: stype_name, rdata: RData::PTR(PTR(instance_name.clone())), ttl }
            .into_record(DNSClass::IN),
            Staged::Add {
                name: instance_name.clone(),
                rdata: RData::SRV(SRV::new(0, 0, port, host_name.clone())),
                ttl,
            }
            .into_record(DNSClass::IN),
            Staged::Add { name: instance_name, rdata: RData::TXT(TXT::new(txt.to_vec())), ttl }
            .into_record(DNSClass::IN),
        ];

        for (ipver, addr) in addresses {
            match (ipver, addr) {
                (IpVersion::V6, IpAddr::V6(v6)) => updates.push(
                    Staged::Add { name: host_name.clone(), rdata: RData::AAAA(AAAA(*v6)), ttl }
                    .into_record(DNSClass::IN),
                ),
                (IpVersion::V4, IpAddr::V4(v4)) => updates.push(
                    Staged::Add { name: host_name.clone(), rdata: RData::A(A(*v4)), ttl }
                    .into_record(DNSClass::IN),
                ),
                _ => continue,
            }
        }

        self.send_transaction(&self.zone.clone(), updates).await
    }

    /// Always removes 2/3/4; conditionally removes 1 and 5/6.
    pub async fn remove_service(
        &self,
        instance: &str,
        stype: &str,
        host: &str,
        delete_type_ptr: bool,
        delete_host_addrs: bool,
        scope: Scope,
    ) -> DnsOutcome {
        let stype_name = match self.owner_name(stype, &scope) {
            Ok(n) => n,
            Err(e) => return e,
        };
        let instance_name = match self.owner_name(&format!("{instance}.{stype}"), &scope) {
            Ok(n) => n,
            Err(e) => return e,
        };
        let host_name = match self.owner_name(host, &scope) {
            Ok(n) => n,
            Err(e) => return e,
        };

        let mut updates = vec![
            Staged::DeleteRrset { name: instance_name.clone(), rtype: RecordType::SRV }
                .into_record(DNSClass::ANY),
            Staged::DeleteRrset { name: instance_name, rtype: RecordType::TXT }
                .into_record(DNSClass::ANY),
        ];

        if delete_type_ptr {
            let services_name = match self.owner_name("_services._dns-sd._udp", &scope) {
                Ok(n) => n,
                Err(e) => return e,
            };
            updates.push(
                Staged::DeleteRrset { name: stype_name.clone(), rtype: RecordType::PTR }
                    .into_record(DNSClass::ANY),
            );
            updates.push(
                Staged::DeleteRdata { name: services_name, rdata: RData::PTR(PTR(stype_name)) }
                .into_record(DNSClass::NONE),
            );
        }

        if delete_host_addrs {
            updates.push(
                Staged::DeleteRrset { name: host_name.clone(), rtype: RecordType::AAAA }
                    .into_record(DNSClass::ANY),
            );
            updates.push(
                Staged::DeleteRrset { name: host_name, rtype: RecordType::A }
                    .into_record(DNSClass::ANY),
            );
        }

        self.send_transaction(&self.zone.clone(), updates).await
    }

    /// Returns the zone to a clean state: see module-level teardown notes.
    pub async fn clear_zone(&self, scope: Scope) -> DnsOutcome {
        let mut client = match self.connect_any().await {
            Ok(c) => c,
            Err(e) => return e,
        };

        let services_name = match self.owner_name("_services._dns-sd._udp", &scope) {
            Ok(n) => n,
            Err(e) => return e,
        };

        let mut query = Query::new();
        query.set_name(services_name.clone());
        query.set_query_class(DNSClass::IN);
        query.set_query_type(RecordType::PTR);

        let response = match client.query(services_name.clone(), DNSClass::IN, RecordType::PTR).await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "no services to clear, treating as success");
                return DnsOutcome::Success;
            }
        };

        let stypes: Vec<Name> = response
            .answers()
            .iter()
            .filter_map(|r| r.data().as_ptr().map(|p| p.0.clone()))
            .collect();

        if stypes.is_empty() {
            return DnsOutcome::Success;
        }

        let mut updates = vec![
            Staged::DeleteRrset { name: services_name, rtype: RecordType::PTR }
                .into_record(DNSClass::ANY),
        ];

        for stype_name in stypes {
            updates.push(
                Staged::DeleteRrset { name: stype_name.clone(), rtype: RecordType::PTR }
                    .into_record(DNSClass::ANY),
            );

            let instances = match client.query(stype_name.clone(), DNSClass::IN, RecordType::PTR).await {
                Ok(r) => r,
                Err(_) => continue,
            };
            let instance_names: Vec<Name> = instances
                .answers()
                .iter()
                .filter_map(|r| r.data().as_ptr().map(|p| p.0.clone()))
                .collect();

            for instance_name in instance_names {
                updates.push(
                    Staged::DeleteRrset { name: instance_name.clone(), rtype: RecordType::SRV }
                        .into_record(DNSClass::ANY),
                );
                updates.push(
                    Staged::DeleteRrset { name: instance_name.clone(), rtype: RecordType::TXT }
                        .into_record(DNSClass::ANY),
                );

                if let Ok(srv_response) = client.query(instance_name, DNSClass::IN, RecordType::SRV).await {
                    for host_name in srv_response
                        .answers()
                        .iter()
                        .filter_map(|r| r.data().as_srv().map(|s| s.target().clone()))
                    {
                        updates.push(
                            Staged::DeleteRrset { name: host_name.clone(), rtype: RecordType::AAAA }
                                .into_record(DNSClass::ANY),
                        );
                        updates.push(
                            Staged::DeleteRrset { name: host_name, rtype: RecordType::A }
                                .into_record(DNSClass::ANY),
                        );
                    }
                }
            }
        }

        if let Ok(browse_name) = self.owner_name("b._dns-sd._udp", &Scope::Zone { zone: self.domain.zone.clone() }) {
            updates.push(
                Staged::DeleteRdata { name: browse_name, rdata: RData::PTR(PTR(scope.fqdn().parse().unwrap_or_else(|_| self.zone.clone()))) }
                .into_record(DNSClass::NONE),
            );
        }

        self.send_transaction(&self.zone.clone(), updates).await
    }
}
