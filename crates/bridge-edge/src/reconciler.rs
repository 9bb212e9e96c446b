//! The Reconciler: the sole writer of the local store and the DNS zone.
//!
//! One `Reconciler` covers one site. It consumes discovery events strictly
//! in order from a single queue and, on each one, mutates the `services`/
//! `addresses` tables and issues RFC 2136 transactions to keep the
//! published zone in sync. See module docs on `dns_updater` for the wire
//! side and `policy` for the allow/deny decision.

use crate::discovery::DiscoveryEvent;
use crate::dns_updater::DnsUpdater;
use crate::policy::PolicyEvaluator;
use bridge_core::config::Config;
use bridge_core::db::Database;
use bridge_core::types::{AddressKey, AliasTable, IpVersion, Scope, ServiceKey};
use hickory_proto::rr::RecordType;
use std::collections::HashSet;
use std::net::IpAddr;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Router-parent-zone PTR owners published once per site.
const BROWSE_PTRS: [&str; 3] = ["b._dns-sd._udp", "lb._dns-sd._udp", "db._dns-sd._udp"];

pub struct Reconciler {
    db: Database,
    updater: DnsUpdater,
    config: Config,
    aliases: AliasTable,
    scope: Scope,
    ttl: u32,
    active_types: HashSet<(String, IpVersion, String)>,
    active_instances: HashSet<ServiceKey>,
    active_host_browsers: HashSet<String>,
}

fn is_private(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || (v6.segments()[0] & 0xfe00) == 0xfc00 // fc00::/7, unique local
                || (v6.segments()[0] & 0xffc0) == 0xfe80 // fe80::/10, link-local
        }
    }
}

impl Reconciler {
    pub fn new(db: Database, updater: DnsUpdater, config: Config) -> Self {
        let aliases = AliasTable {
            interface_aliases: config.interface_aliases.clone(),
            ip_aliases: config
                .ip_aliases
                .iter()
                .filter_map(|(v, alias)| IpVersion::from_u8(*v).map(|v| (v, alias.clone())))
                .collect(),
        };
        let scope = Scope::Subdomain {
            router: config.domain.name.clone(),
            zone: config.domain.zone.clone(),
        };
        let ttl = config.domain.ttl;
        Self {
            db,
            updater,
            config,
            aliases,
            scope,
            ttl,
            active_types: HashSet::new(),
            active_instances: HashSet::new(),
            active_host_browsers: HashSet::new(),
        }
    }

    fn policy(&self) -> PolicyEvaluator<'_> {
        PolicyEvaluator::new(&self.config.rules)
    }

    /// Tears down the zone, then publishes the per-router browse PTRs and
    /// the `public=` TXT record, per the startup sequence.
    pub async fn startup(&self) -> Result<(), String> {
        let outcome = self.updater.clear_zone(self.scope.clone()).await;
        if !outcome.is_success() {
            warn!(%outcome, "clear_zone at startup did not fully succeed");
        }

        let zone_scope = Scope::Zone {
            zone: self.config.domain.zone.clone(),
        };
        for owner in BROWSE_PTRS {
            let rdata = hickory_proto::rr::RData::PTR(hickory_proto::rr::rdata::PTR(
                format!("{}.", self.scope.fqdn())
                    .parse()
                    .map_err(|_| "bad router name".to_string())?,
            ));
            let outcome = self
                .updater
                .add_record(owner, RecordType::PTR, rdata, self.ttl, zone_scope.clone())
                .await;
            if !outcome.is_success() {
                warn!(%outcome, owner, "failed to publish per-router browse PTR");
            }
        }

        let public_txt =
            bridge_core::dnssd::format_public_interfaces(&self.config.public_interfaces);
        let txt_rdata =
            hickory_proto::rr::RData::TXT(hickory_proto::rr::rdata::TXT::new(vec![public_txt]));
        let outcome = self
            .updater
            .add_record(
                &self.config.domain.name,
                RecordType::TXT,
                txt_rdata,
                self.ttl,
                zone_scope,
            )
            .await;
        if !outcome.is_success() {
            warn!(%outcome, "failed to publish public= TXT record");
        }

        Ok(())
    }

    pub async fn shutdown(&self) {
        let outcome = self.updater.clear_zone(self.scope.clone()).await;
        if !outcome.is_success() {
            warn!(%outcome, "clear_zone at shutdown did not fully succeed");
        }
        let zone_scope = Scope::Zone {
            zone: self.config.domain.zone.clone(),
        };
        for owner in BROWSE_PTRS {
            let _ = self
                .updater
                .remove_record(owner, RecordType::PTR, None, zone_scope.clone())
                .await;
        }
        let _ = self
            .updater
            .remove_record(&self.config.domain.name, RecordType::TXT, None, zone_scope)
            .await;
    }

    /// Runs the event loop until the channel closes. Returns on the first
    /// fatal store error or unexpected non-zero RCODE per the failure
    /// semantics; a `LABEL_NAME_ERROR` only skips the offending service.
    pub async fn run(&mut self, mut events: mpsc::Receiver<DiscoveryEvent>) {
        info!("reconciler event loop started");
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle(event).await {
                error!(error = %e, "reconciler stopping due to fatal error");
                break;
            }
        }
        info!("reconciler event loop exited");
    }

    async fn handle(&mut self, event: DiscoveryEvent) -> Result<(), String> {
        match event {
            DiscoveryEvent::TypeSeen {
                iface,
                proto,
                stype,
            } => {
                self.active_types.insert((iface, proto, stype));
                Ok(())
            }
            DiscoveryEvent::InstanceSeen {
                iface,
                proto,
                name,
                stype,
            } => self.on_instance_seen(iface, proto, name, stype),
            DiscoveryEvent::Resolved {
                iface,
                proto,
                name,
                stype,
                host,
                port,
                txt,
            } => {
                self.on_resolved(iface, proto, name, stype, host, port, txt)
                    .await
            }
            DiscoveryEvent::AddressAppeared {
                iface,
                proto,
                host,
                ipver,
                addr,
            } => {
                self.on_address_appeared(iface, proto, host, ipver, addr)
                    .await
            }
            DiscoveryEvent::AddressGone {
                iface,
                proto,
                host,
                ipver,
                addr,
            } => self.on_address_gone(iface, proto, host, ipver, addr).await,
            DiscoveryEvent::InstanceGone {
                iface,
                proto,
                name,
                stype,
            } => self.on_instance_gone(iface, proto, name, stype).await,
        }
    }

    fn on_instance_seen(
        &mut self,
        iface: String,
        proto: IpVersion,
        name: String,
        stype: String,
    ) -> Result<(), String> {
        let key = ServiceKey::new(&iface, proto, &name, &stype);
        if !self.active_instances.insert(key.clone()) {
            return Ok(());
        }
        if let Err(e) = self.db.insert_service(&key) {
            warn!(error = %e, %key, "failed to insert service row (treated as logged no-op)");
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_resolved(
        &mut self,
        iface: String,
        proto: IpVersion,
        name: String,
        stype: String,
        host: String,
        port: u16,
        txt: Vec<u8>,
    ) -> Result<(), String> {
        let key = ServiceKey::new(&iface, proto, &name, &stype);

        let browser_already_active = !self.active_host_browsers.insert(host.clone());

        if browser_already_active {
            let addresses = self
                .db
                .addresses_for_hostname(&host)
                .map_err(|e| e.to_string())?;
            if !addresses.is_empty() {
                let instance_name = self.aliases.instance_name(
                    &name,
                    self.config.edge_alias.as_deref().unwrap_or(""),
                    &iface,
                    proto,
                );
                let rewritten_host = bridge_core::types::rewrite_host(&host, &iface, proto);
                let allowed = self
                    .policy()
                    .evaluate(&name, &stype, &iface, proto, &host, port)
                    .map_err(|e| e.to_string())?;

                let mut announced = false;
                if allowed {
                    let addr_pairs: Vec<(IpVersion, IpAddr)> = addresses
                        .iter()
                        .map(|a| (a.addr_ipver, a.address))
                        .collect();
                    let txt_strings = bridge_core::dnssd::decode_txt(&txt);
                    let outcome = self
                        .updater
                        .add_service(
                            &instance_name,
                            &stype,
                            &rewritten_host,
                            &addr_pairs,
                            port,
                            &txt_strings,
                            self.ttl,
                            self.scope.clone(),
                        )
                        .await;
                    announced = outcome.is_success();
                    if !outcome.is_success() && !outcome.is_recoverable() {
                        return Err(format!("add_service failed with {outcome}"));
                    }
                }

                self.db
                    .update_service(&key, Some(&host), Some(port), Some(&txt), true, announced)
                    .map_err(|e| e.to_string())?;
                return Ok(());
            }
        }

        self.db
            .update_service(&key, Some(&host), Some(port), Some(&txt), false, false)
            .map_err(|e| e.to_string())?;

        if !bridge_core::types::is_local_host(&host) || browser_already_active {
            return Ok(());
        }

        debug!(host, "starting address tracking for resolved host");
        Ok(())
    }

    async fn on_address_appeared(
        &mut self,
        iface: String,
        proto: IpVersion,
        host: String,
        ipver: IpVersion,
        addr: IpAddr,
    ) -> Result<(), String> {
        if is_private(&addr) {
            return Ok(());
        }

        let addr_key = AddressKey {
            iface_name: iface.clone(),
            iface_ipver: proto,
            hostname: host.clone(),
            addr_ipver: ipver,
            address: addr,
        };
        self.db
            .insert_address(&addr_key)
            .map_err(|e| e.to_string())?;

        let services = self
            .db
            .services_for_hostname(&host)
            .map_err(|e| e.to_string())?;
        for service in services {
            self.db
                .set_service_flags(&service.key, true, service.announced)
                .map_err(|e| e.to_string())?;

            let stype = service.key.stype.clone();
            let name = service.key.name.clone();
            let allowed = self
                .policy()
                .evaluate(
                    &name,
                    &stype,
                    &service.key.iface_name,
                    service.key.iface_ipver,
                    &host,
                    service.port.unwrap_or(0),
                )
                .map_err(|e| e.to_string())?;
            if !allowed {
                continue;
            }

            let instance_name = self.aliases.instance_name(
                &name,
                self.config.edge_alias.as_deref().unwrap_or(""),
                &service.key.iface_name,
                service.key.iface_ipver,
            );
            let rewritten_host = bridge_core::types::rewrite_host(
                &host,
                &service.key.iface_name,
                service.key.iface_ipver,
            );
            let txt_strings = service
                .txt
                .as_deref()
                .map(bridge_core::dnssd::decode_txt)
                .unwrap_or_default();
            let outcome = self
                .updater
                .add_service(
                    &instance_name,
                    &stype,
                    &rewritten_host,
                    &[(ipver, addr)],
                    service.port.unwrap_or(0),
                    &txt_strings,
                    self.ttl,
                    self.scope.clone(),
                )
                .await;
            let announced = outcome.is_success();
            if !outcome.is_success() && !outcome.is_recoverable() {
                return Err(format!("add_service failed with {outcome}"));
            }
            self.db
                .set_service_flags(&service.key, true, announced)
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    async fn on_address_gone(
        &mut self,
        iface: String,
        proto: IpVersion,
        host: String,
        ipver: IpVersion,
        addr: IpAddr,
    ) -> Result<(), String> {
        if is_private(&addr) {
            return Ok(());
        }

        let addr_key = AddressKey {
            iface_name: iface,
            iface_ipver: proto,
            hostname: host.clone(),
            addr_ipver: ipver,
            address: addr,
        };
        self.db
            .delete_address(&addr_key)
            .map_err(|e| e.to_string())?;

        let services = self
            .db
            .services_for_hostname(&host)
            .map_err(|e| e.to_string())?;
        let rdata = match addr {
            IpAddr::V4(v4) => hickory_proto::rr::RData::A(hickory_proto::rr::rdata::A(v4)),
            IpAddr::V6(v6) => hickory_proto::rr::RData::AAAA(hickory_proto::rr::rdata::AAAA(v6)),
        };
        let rtype = if ipver == IpVersion::V6 {
            RecordType::AAAA
        } else {
            RecordType::A
        };

        for service in &services {
            if !service.announced {
                continue;
            }
            let rewritten_host = bridge_core::types::rewrite_host(
                &host,
                &service.key.iface_name,
                service.key.iface_ipver,
            );
            let outcome = self
                .updater
                .remove_record(
                    &rewritten_host,
                    rtype,
                    Some(rdata.clone()),
                    self.scope.clone(),
                )
                .await;
            if !outcome.is_success() && !outcome.is_recoverable() {
                return Err(format!("remove_record failed with {outcome}"));
            }
        }

        let remaining = self
            .db
            .address_count_for_hostname(&host)
            .map_err(|e| e.to_string())?;
        if remaining == 0 {
            for service in services {
                if !service.announced {
                    continue;
                }
                self.db
                    .set_service_flags(&service.key, false, false)
                    .map_err(|e| e.to_string())?;
                let t_count = self
                    .db
                    .announced_count_for_type(&service.key.stype)
                    .map_err(|e| e.to_string())?;
                let instance_name = self.aliases.instance_name(
                    &service.key.name,
                    self.config.edge_alias.as_deref().unwrap_or(""),
                    &service.key.iface_name,
                    service.key.iface_ipver,
                );
                let rewritten_host = bridge_core::types::rewrite_host(
                    &host,
                    &service.key.iface_name,
                    service.key.iface_ipver,
                );
                let outcome = self
                    .updater
                    .remove_service(
                        &instance_name,
                        &service.key.stype,
                        &rewritten_host,
                        t_count == 0,
                        true,
                        self.scope.clone(),
                    )
                    .await;
                if !outcome.is_success() && !outcome.is_recoverable() {
                    return Err(format!("remove_service failed with {outcome}"));
                }
            }
        }
        Ok(())
    }

    async fn on_instance_gone(
        &mut self,
        iface: String,
        proto: IpVersion,
        name: String,
        stype: String,
    ) -> Result<(), String> {
        let key = ServiceKey::new(&iface, proto, &name, &stype);
        if !self.active_instances.remove(&key) {
            return Ok(());
        }

        let row = self.db.get_service(&key).map_err(|e| e.to_string())?;
        self.db.delete_service(&key).map_err(|e| e.to_string())?;

        let Some(row) = row else { return Ok(()) };
        let Some(host) = row.hostname.clone() else {
            return Ok(());
        };

        let t_count = self
            .db
            .announced_count_for_type(&stype)
            .map_err(|e| e.to_string())?;
        let h_count = self
            .db
            .announced_count_for_hostname(&host)
            .map_err(|e| e.to_string())?;
        let a_count = self
            .db
            .total_count_for_hostname(&host)
            .map_err(|e| e.to_string())?;

        if row.announced {
            let instance_name = self.aliases.instance_name(
                &name,
                self.config.edge_alias.as_deref().unwrap_or(""),
                &iface,
                proto,
            );
            let rewritten_host = bridge_core::types::rewrite_host(&host, &iface, proto);
            let outcome = self
                .updater
                .remove_service(
                    &instance_name,
                    &stype,
                    &rewritten_host,
                    t_count == 0,
                    h_count == 0,
                    self.scope.clone(),
                )
                .await;
            if !outcome.is_success() && !outcome.is_recoverable() {
                return Err(format!("remove_service failed with {outcome}"));
            }
        }

        if a_count == 0 {
            self.active_host_browsers.remove(&host);
            self.db
                .delete_addresses_for_hostname(&host)
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}
