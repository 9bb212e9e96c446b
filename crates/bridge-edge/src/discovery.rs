//! The concrete LocalDiscoveryAdapter: browses all DNS-SD service types on
//! the local link via `mdns-sd` and emits the Reconciler's event vocabulary.
//!
//! # How mDNS Browsing Works Here
//!
//! 1. We browse the meta-query `_services._dns-sd._udp.local.`. Each
//!    `ServiceFound` on that browse names one service *type* present on the
//!    link — we emit `TypeSeen` and start a second browse for that type.
//! 2. On the per-type browse, `ServiceFound` names one service *instance*
//!    (`InstanceSeen`); `ServiceResolved` carries its host/port/TXT
//!    (`Resolved`); `ServiceRemoved` means it's gone (`InstanceGone`).
//! 3. `mdns-sd` doesn't expose a standalone address-record browser, so we
//!    infer `AddressAppeared`/`AddressGone` by diffing the address set
//!    carried on each `ServiceResolved` for a host against the set seen on
//!    the previous resolution of that same host.

use bridge_core::types::IpVersion;
use mdns_sd::{ServiceDaemon, ServiceEvent, IfKind};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const META_QUERY: &str = "_services._dns-sd._udp.local.";

/// One local-link event, in the Reconciler's vocabulary.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    TypeSeen {
        iface: String,
        proto: IpVersion,
        stype: String,
    },
    InstanceSeen {
        iface: String,
        proto: IpVersion,
        name: String,
        stype: String,
    },
    InstanceGone {
        iface: String,
        proto: IpVersion,
        name: String,
        stype: String,
    },
    Resolved {
        iface: String,
        proto: IpVersion,
        name: String,
        stype: String,
        host: String,
        port: u16,
        txt: Vec<u8>,
    },
    AddressAppeared {
        iface: String,
        proto: IpVersion,
        host: String,
        ipver: IpVersion,
        addr: IpAddr,
    },
    AddressGone {
        iface: String,
        proto: IpVersion,
        host: String,
        ipver: IpVersion,
        addr: IpAddr,
    },
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mDNS daemon error: {0}")]
    Mdns(String),
}

/// Manages the mDNS browsing session for a single configured interface and
/// IP family. One `LocalDiscoveryAdapter` covers one site.
pub struct LocalDiscoveryAdapter {
    daemon: ServiceDaemon,
}

impl LocalDiscoveryAdapter {
    /// Starts browsing, restricted to `iface_name` if given (otherwise all
    /// interfaces), tagging every emitted event with `proto`. Returns the
    /// adapter handle plus the receiving end of its event channel.
    pub fn start(
        iface_name: String,
        proto: IpVersion,
    ) -> Result<(Self, mpsc::Receiver<DiscoveryEvent>), DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Mdns(e.to_string()))?;

        if !iface_name.is_empty() {
            daemon
                .disable_interface(IfKind::All)
                .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
            daemon
                .enable_interface(IfKind::Name(iface_name.clone()))
                .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
            if proto == IpVersion::V4 {
                daemon
                    .disable_interface(IfKind::IPv6)
                    .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;
            }
        }

        let meta_receiver = daemon
            .browse(META_QUERY)
            .map_err(|e| DiscoveryError::Mdns(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel::<DiscoveryEvent>(256);

        let daemon_for_loop = daemon.clone();
        tokio::task::spawn_blocking(move || {
            Self::meta_loop(daemon_for_loop, meta_receiver, event_tx, iface_name, proto);
        });

        Ok((Self { daemon }, event_rx))
    }

    /// Handles the meta-query browse: one `ServiceFound` per discovered
    /// type, each of which spawns its own per-type browse thread.
    fn meta_loop(
        daemon: ServiceDaemon,
        meta_receiver: mdns_sd::Receiver<ServiceEvent>,
        event_tx: mpsc::Sender<DiscoveryEvent>,
        iface_name: String,
        proto: IpVersion,
    ) {
        let mut seen_types: HashSet<String> = HashSet::new();

        while let Ok(event) = meta_receiver.recv() {
            if let ServiceEvent::ServiceFound(_ty_domain, fullname) = event {
                // fullname looks like "_http._tcp.local."
                if !seen_types.insert(fullname.clone()) {
                    continue;
                }
                let stype = strip_local_suffix(&fullname);
                if event_tx
                    .blocking_send(DiscoveryEvent::TypeSeen {
                        iface: iface_name.clone(),
                        proto,
                        stype: stype.clone(),
                    })
                    .is_err()
                {
                    break;
                }

                match daemon.browse(&fullname) {
                    Ok(type_receiver) => {
                        let tx = event_tx.clone();
                        let iface = iface_name.clone();
                        let stype = stype.clone();
                        tokio::task::spawn_blocking(move || {
                            Self::type_loop(type_receiver, tx, iface, proto, stype);
                        });
                    }
                    Err(e) => {
                        warn!(stype, error = %e, "failed to browse service type");
                    }
                }
            }
        }
        debug!("meta browse loop exited");
    }

    /// Handles a per-type browse: instance lifecycle and resolution.
    fn type_loop(
        type_receiver: mdns_sd::Receiver<ServiceEvent>,
        event_tx: mpsc::Sender<DiscoveryEvent>,
        iface_name: String,
        proto: IpVersion,
        stype: String,
    ) {
        // host -> last-seen address set, used to diff AddressAppeared/Gone.
        let mut host_addresses: HashMap<String, HashSet<IpAddr>> = HashMap::new();

        while let Ok(event) = type_receiver.recv() {
            match event {
                ServiceEvent::ServiceFound(_ty, fullname) => {
                    let name = strip_suffix_for_instance(&fullname, &stype);
                    if event_tx
                        .blocking_send(DiscoveryEvent::InstanceSeen {
                            iface: iface_name.clone(),
                            proto,
                            name,
                            stype: stype.clone(),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                ServiceEvent::ServiceResolved(info) => {
                    let name = strip_suffix_for_instance(info.get_fullname(), &stype);
                    let host = info.get_hostname().to_string();
                    let port = info.get_port();
                    let txt = info.get_properties().clone();
                    let txt_bytes = bridge_core::dnssd::encode_txt(
                        &txt.iter()
                            .map(|p| match p.val_str() {
                                "" => p.key().to_string(),
                                v => format!("{}={}", p.key(), v),
                            })
                            .collect::<Vec<_>>(),
                    );

                    if event_tx
                        .blocking_send(DiscoveryEvent::Resolved {
                            iface: iface_name.clone(),
                            proto,
                            name,
                            stype: stype.clone(),
                            host: host.clone(),
                            port,
                            txt: txt_bytes,
                        })
                        .is_err()
                    {
                        break;
                    }

                    let current: HashSet<IpAddr> = info.get_addresses().iter().cloned().collect();
                    let previous = host_addresses.entry(host.clone()).or_default();

                    for addr in current.difference(previous) {
                        if event_tx
                            .blocking_send(DiscoveryEvent::AddressAppeared {
                                iface: iface_name.clone(),
                                proto,
                                host: host.clone(),
                                ipver: IpVersion::of(addr),
                                addr: *addr,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    for addr in previous.difference(&current) {
                        if event_tx
                            .blocking_send(DiscoveryEvent::AddressGone {
                                iface: iface_name.clone(),
                                proto,
                                host: host.clone(),
                                ipver: IpVersion::of(addr),
                                addr: *addr,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    *previous = current;
                }
                ServiceEvent::ServiceRemoved(_ty, fullname) => {
                    let name = strip_suffix_for_instance(&fullname, &stype);
                    if event_tx
                        .blocking_send(DiscoveryEvent::InstanceGone {
                            iface: iface_name.clone(),
                            proto,
                            name,
                            stype: stype.clone(),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                ServiceEvent::SearchStarted(_) | ServiceEvent::SearchStopped(_) => {}
            }
        }
        debug!(stype, "type browse loop exited");
    }

    pub fn shutdown(self) {
        info!("shutting down mDNS discovery adapter");
        if let Ok(receiver) = self.daemon.shutdown() {
            let _ = receiver.recv();
        }
    }
}

fn strip_local_suffix(fullname: &str) -> String {
    fullname
        .strip_suffix(".local.")
        .unwrap_or(fullname)
        .to_string()
}

fn strip_suffix_for_instance(fullname: &str, stype: &str) -> String {
    let suffix = format!(".{stype}.local.");
    fullname.strip_suffix(&suffix).unwrap_or(fullname).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_local_suffix_from_type() {
        assert_eq!(strip_local_suffix("_http._tcp.local."), "_http._tcp");
    }

    #[test]
    fn strips_instance_suffix() {
        assert_eq!(
            strip_suffix_for_instance("WebServer._http._tcp.local.", "_http._tcp"),
            "WebServer"
        );
    }
}
