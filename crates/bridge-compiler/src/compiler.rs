//! Compiles the zone snapshot plus the rule set into one iptables/ip6tables
//! FORWARD script per router.

use crate::zone_reader::DiscoveredService;
use bridge_core::config::{anchor_pattern, Rule, RuleAction};
use regex::Regex;
use std::collections::HashMap;
use std::net::IpAddr;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("invalid regular expression in rule {rule}, field {field}: {source}")]
    InvalidRegex {
        rule: String,
        field: &'static str,
        #[source]
        source: regex::Error,
    },
}

/// Compiles one router's FORWARD script: all matched rule lines first, the
/// two default-DROP lines last.
pub fn compile_router(
    router: &str,
    rules: &[Rule],
    types: &HashMap<String, Vec<DiscoveredService>>,
    public_interfaces: &[String],
) -> Result<Vec<String>, CompileError> {
    let mut lines = Vec::new();

    let applicable: Vec<&Rule> = rules
        .iter()
        .filter(|r| matches!(r.router.as_deref(), Some(name) if name == router || name == "*"))
        .collect();

    for rule in applicable {
        let Some(src_address) = rule.src_address.as_deref() else {
            continue;
        };
        let Some(prefix_len) = rule.src_prefix_length.as_deref() else {
            continue;
        };
        let Ok(src_ip) = src_address.parse::<IpAddr>() else {
            warn!(rule = %rule.name, src_address, "not a valid source address, skipping rule");
            continue;
        };
        let family_v6 = src_ip.is_ipv6();

        let type_re = Regex::new(&anchor_pattern(&rule.stype)).map_err(|source| {
            CompileError::InvalidRegex {
                rule: rule.name.clone(),
                field: "type",
                source,
            }
        })?;
        let name_re = Regex::new(&anchor_pattern(&rule.name)).map_err(|source| {
            CompileError::InvalidRegex {
                rule: rule.name.clone(),
                field: "name",
                source,
            }
        })?;

        for (full_type, services) in types {
            let short_type = short_type_name(full_type, router);
            if !type_re.is_match(&short_type) {
                continue;
            }
            let proto = if short_type.ends_with("_tcp") {
                "tcp"
            } else {
                "!tcp"
            };
            let tool = if family_v6 { "ip6tables" } else { "iptables" };

            for service in services {
                if !name_re.is_match(&service.name) {
                    continue;
                }
                let matching_addrs: Vec<IpAddr> = service
                    .addresses
                    .iter()
                    .copied()
                    .filter(|a| a.is_ipv6() == family_v6)
                    .collect();
                if matching_addrs.is_empty() {
                    continue;
                }

                let verdict = match rule.action {
                    RuleAction::Allow => "ACCEPT",
                    RuleAction::Deny => "DROP",
                };

                for iface in public_interfaces {
                    for addr in &matching_addrs {
                        lines.push(format!(
                            "{tool} -t filter -A FORWARD -p {proto} -s {src_address}/{prefix_len} -i {iface} -d {addr} --dport {port} -j {verdict}",
                            port = service.port,
                        ));
                    }
                }
            }
        }
    }

    lines.push("iptables -t filter -A FORWARD -j DROP".to_string());
    lines.push("ip6tables -t filter -A FORWARD -j DROP".to_string());

    Ok(lines)
}

/// Strips the trailing `.<router>.<zone>.` (or `.<router>.<zone>`) suffix
/// off a fully-qualified service type name, leaving the bare
/// `_service._proto` pair the rule's `type` regex matches against.
fn short_type_name(full_type: &str, router: &str) -> String {
    let trimmed = full_type.trim_end_matches('.');
    match trimmed.find(&format!(".{router}.")) {
        Some(idx) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}

/// Renders a router's compiled rule lines into a complete, shebang-prefixed
/// shell script body.
pub fn render_script(lines: &[String]) -> String {
    let mut body = String::from("#!/bin/sh\n");
    for line in lines {
        body.push_str(line);
        body.push('\n');
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(
        router: &str,
        stype: &str,
        name: &str,
        src: &str,
        len: &str,
        action: RuleAction,
    ) -> Rule {
        Rule {
            name: name.to_string(),
            stype: stype.to_string(),
            interface_name: ".*".to_string(),
            interface_ip: ".*".to_string(),
            hostname: ".*".to_string(),
            port: ".*".to_string(),
            action,
            router: Some(router.to_string()),
            src_address: Some(src.to_string()),
            src_prefix_length: Some(len.to_string()),
        }
    }

    #[test]
    fn emits_accept_line_for_matching_service() {
        let mut types = HashMap::new();
        types.insert(
            "_http._tcp.rtr1.zone.".to_string(),
            vec![DiscoveredService {
                name: "Web".to_string(),
                port: 80,
                host: "laptop-eth0-v4.rtr1.zone.".to_string(),
                addresses: vec!["203.0.113.7".parse().unwrap()],
            }],
        );
        let rules = vec![rule(
            "*",
            r"_http\._tcp",
            ".*",
            "0.0.0.0",
            "0",
            RuleAction::Allow,
        )];

        let lines = compile_router("rtr1", &rules, &types, &["eth1".to_string()]).unwrap();

        assert_eq!(
            lines[0],
            "iptables -t filter -A FORWARD -p tcp -s 0.0.0.0/0 -i eth1 -d 203.0.113.7 --dport 80 -j ACCEPT"
        );
        assert_eq!(
            lines[lines.len() - 2],
            "iptables -t filter -A FORWARD -j DROP"
        );
        assert_eq!(
            lines[lines.len() - 1],
            "ip6tables -t filter -A FORWARD -j DROP"
        );
    }

    #[test]
    fn family_mismatch_is_skipped() {
        let mut types = HashMap::new();
        types.insert(
            "_http._tcp.rtr1.zone.".to_string(),
            vec![DiscoveredService {
                name: "Web".to_string(),
                port: 80,
                host: "laptop-eth0-v6.rtr1.zone.".to_string(),
                addresses: vec!["2001:db8::1".parse().unwrap()],
            }],
        );
        let rules = vec![rule(
            "*",
            r"_http\._tcp",
            ".*",
            "0.0.0.0",
            "0",
            RuleAction::Allow,
        )];

        let lines = compile_router("rtr1", &rules, &types, &["eth1".to_string()]).unwrap();
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn no_rules_emits_only_default_drop() {
        let lines = compile_router("rtr1", &[], &HashMap::new(), &["eth1".to_string()]).unwrap();
        assert_eq!(
            lines,
            vec![
                "iptables -t filter -A FORWARD -j DROP".to_string(),
                "ip6tables -t filter -A FORWARD -j DROP".to_string(),
            ]
        );
    }
}
