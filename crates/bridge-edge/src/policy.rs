//! Ordered allow/deny matching over discovered service attributes.

use bridge_core::config::{anchor_pattern, Rule, RuleAction};
use bridge_core::types::IpVersion;
use regex::Regex;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid regular expression in rule {rule}, field {field}: {source}")]
    InvalidRegex {
        rule: String,
        field: &'static str,
        #[source]
        source: regex::Error,
    },
}

pub struct PolicyEvaluator<'a> {
    rules: &'a [Rule],
}

impl<'a> PolicyEvaluator<'a> {
    pub fn new(rules: &'a [Rule]) -> Self {
        Self { rules }
    }

    /// Returns true if the service should be published, false if denied.
    /// An invalid regular expression in a rule is a hard error: the caller
    /// must stop its event loop.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        name: &str,
        stype: &str,
        iface_name: &str,
        iface_ipver: IpVersion,
        hostname: &str,
        port: u16,
    ) -> Result<bool, PolicyError> {
        let port_str = port.to_string();
        let ipver_str = iface_ipver.to_string();

        for rule in self.rules {
            let fields: [(&'static str, &str, &str); 6] = [
                ("name", &rule.name, name),
                ("stype", &rule.stype, stype),
                ("interface_name", &rule.interface_name, iface_name),
                ("interface_ip", &rule.interface_ip, &ipver_str),
                ("hostname", &rule.hostname, hostname),
                ("port", &rule.port, &port_str),
            ];

            let mut all_matched = true;
            for (field, pattern, value) in fields {
                let re = Regex::new(&anchor_pattern(pattern)).map_err(|source| {
                    PolicyError::InvalidRegex {
                        rule: rule.name.clone(),
                        field,
                        source,
                    }
                })?;
                if !re.is_match(value) {
                    all_matched = false;
                    break;
                }
            }

            if !all_matched {
                continue;
            }

            return match rule.action {
                RuleAction::Allow => Ok(true),
                RuleAction::Deny => Ok(false),
            };
        }

        warn!(name, stype, "no rule matched, defaulting to deny");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, action: RuleAction) -> Rule {
        Rule {
            name: name.to_string(),
            stype: ".*".to_string(),
            interface_name: ".*".to_string(),
            interface_ip: ".*".to_string(),
            hostname: ".*".to_string(),
            port: ".*".to_string(),
            action,
            router: None,
            src_address: None,
            src_prefix_length: None,
        }
    }

    #[test]
    fn patterns_are_anchored_at_start() {
        let rules = vec![rule("abc", RuleAction::Allow)];
        let evaluator = PolicyEvaluator::new(&rules);

        assert!(evaluator
            .evaluate("abc", "_http._tcp", "eth0", IpVersion::V4, "host", 80)
            .unwrap());
        assert!(!evaluator
            .evaluate("xxabcxx", "_http._tcp", "eth0", IpVersion::V4, "host", 80)
            .unwrap());
    }
}
