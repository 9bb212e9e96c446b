//! DNS-SD wire-format helpers shared by the edge DNSUpdater and the central
//! ZoneReader: TXT record string encoding (RFC 6763 §6) and the fixed label
//! constants used to build the well-known owner names.

/// Owner label for the services enumeration PTR (record class 1).
pub const SERVICES_LABEL: &str = "_services._dns-sd._udp";
/// Owner label for the primary browsing-domain PTR.
pub const BROWSE_LABEL: &str = "b._dns-sd._udp";
/// Owner label for the legacy default-browsing-domain PTR.
pub const LEGACY_BROWSE_LABEL: &str = "lb._dns-sd._udp";
/// Owner label for the default-browsing-domain PTR.
pub const DEFAULT_BROWSE_LABEL: &str = "db._dns-sd._udp";

/// Encodes a set of `key=value` (or bare flag) strings into the RFC 6763 §6
/// TXT wire format: each string prefixed by its own length byte,
/// concatenated with no separators.
///
/// Strings longer than 255 bytes are truncated at the byte boundary closest
/// to (but not exceeding) 255, since a single length byte cannot address
/// more.
pub fn encode_txt(strings: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for s in strings {
        let bytes = s.as_bytes();
        let len = bytes.len().min(255);
        out.push(len as u8);
        out.extend_from_slice(&bytes[..len]);
    }
    out
}

/// Decodes an RFC 6763 §6 TXT wire blob back into its component strings.
/// Malformed trailing data (a length byte claiming more bytes than remain)
/// truncates the result rather than erroring, mirroring a permissive reader.
pub fn decode_txt(data: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let len = data[i] as usize;
        i += 1;
        if i + len > data.len() {
            break;
        }
        out.push(String::from_utf8_lossy(&data[i..i + len]).into_owned());
        i += len;
    }
    out
}

/// Splits a `public=ifc1,ifc2` TXT string into its interface name list.
/// Returns an empty vec if the string doesn't start with the expected
/// `public=` prefix.
pub fn parse_public_interfaces(txt: &str) -> Vec<String> {
    match txt.strip_prefix("public=") {
        Some(rest) if !rest.is_empty() => rest.split(',').map(|s| s.to_string()).collect(),
        _ => Vec::new(),
    }
}

/// Builds the `public=ifc1,ifc2` TXT string from a router's WAN interface
/// list.
pub fn format_public_interfaces(interfaces: &[String]) -> String {
    format!("public={}", interfaces.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txt_roundtrip() {
        let strings = vec!["path=/x".to_string(), "version=1".to_string()];
        let encoded = encode_txt(&strings);
        assert_eq!(decode_txt(&encoded), strings);
    }

    #[test]
    fn txt_encoding_is_length_prefixed() {
        let encoded = encode_txt(&["ab".to_string()]);
        assert_eq!(encoded, vec![2, b'a', b'b']);
    }

    #[test]
    fn public_interfaces_roundtrip() {
        let interfaces = vec!["eth1".to_string(), "eth2".to_string()];
        let txt = format_public_interfaces(&interfaces);
        assert_eq!(txt, "public=eth1,eth2");
        assert_eq!(parse_public_interfaces(&txt), interfaces);
    }

    #[test]
    fn public_interfaces_malformed_is_empty() {
        assert!(parse_public_interfaces("other=thing").is_empty());
    }
}
