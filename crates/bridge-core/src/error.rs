//! The internal result taxonomy shared between the DNS updater and its
//! callers, plus the error types of the ambient layers (config, store).
//!
//! `DnsOutcome` is not a `std::error::Error` — it is a closed set of integer
//! results a DNS Update transaction can produce, exactly as described by the
//! RFC 2136 RCODE space plus a handful of transport-level conditions. It is
//! returned by value (never via `Result`'s `Err` arm) because `SUCCESS` is a
//! perfectly ordinary outcome the caller branches on, not an exceptional one.

use std::fmt;

/// Closed taxonomy of DNS Update outcomes.
///
/// The ten RFC 2136 RCODEs 1-10 are carried verbatim (`Rcode::from(n)` maps
/// a raw wire RCODE onto these variants); `NsUnresolved`, `NsQueryingError`,
/// `SocketError`, and `LabelNameError` are transport/application conditions
/// that never appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsOutcome {
    Success,
    NsUnresolved,
    NsQueryingError,
    SocketError,
    LabelNameError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    YxDomain,
    YxRrSet,
    NxRrSet,
    NotAuth,
    NotZone,
}

impl DnsOutcome {
    /// Maps a raw RFC 2136 RCODE (1-10) onto its taxonomy variant.
    ///
    /// RCODE 0 is not passed here — callers check for success before
    /// calling this, since 0 has no corresponding named error variant.
    pub fn from_rcode(rcode: u16) -> Option<Self> {
        Some(match rcode {
            1 => Self::FormErr,
            2 => Self::ServFail,
            3 => Self::NxDomain,
            4 => Self::NotImp,
            5 => Self::Refused,
            6 => Self::YxDomain,
            7 => Self::YxRrSet,
            8 => Self::NxRrSet,
            9 => Self::NotAuth,
            10 => Self::NotZone,
            _ => return None,
        })
    }

    /// Whether the loop-stopping policy of the Reconciler treats this
    /// outcome as recoverable (skip just the one service) rather than
    /// fatal (stop the whole event loop).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Success | Self::LabelNameError)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for DnsOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "SUCCESS",
            Self::NsUnresolved => "NS_UNRESOLVED",
            Self::NsQueryingError => "NS_QUERYING_ERROR",
            Self::SocketError => "SOCKET_ERROR",
            Self::LabelNameError => "LABEL_NAME_ERROR",
            Self::FormErr => "FORMERR",
            Self::ServFail => "SERVFAIL",
            Self::NxDomain => "NXDOMAIN",
            Self::NotImp => "NOTIMP",
            Self::Refused => "REFUSED",
            Self::YxDomain => "YXDOMAIN",
            Self::YxRrSet => "YXRRSET",
            Self::NxRrSet => "NXRRSET",
            Self::NotAuth => "NOTAUTH",
            Self::NotZone => "NOTZONE",
        };
        write!(f, "{s}")
    }
}

/// Umbrella error for the agent/controller's operational boundary (used at
/// the outermost `main` layer, collected into `anyhow::Error` from there).
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("store error: {0}")]
    Store(#[from] crate::db::StoreError),

    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("DNS update failed: {0}")]
    NetworkFailure(DnsOutcome),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rcode_roundtrip() {
        assert_eq!(DnsOutcome::from_rcode(3), Some(DnsOutcome::NxDomain));
        assert_eq!(DnsOutcome::from_rcode(10), Some(DnsOutcome::NotZone));
        assert_eq!(DnsOutcome::from_rcode(0), None);
        assert_eq!(DnsOutcome::from_rcode(11), None);
    }

    #[test]
    fn only_success_and_label_error_are_recoverable() {
        assert!(DnsOutcome::Success.is_recoverable());
        assert!(DnsOutcome::LabelNameError.is_recoverable());
        assert!(!DnsOutcome::ServFail.is_recoverable());
        assert!(!DnsOutcome::NsQueryingError.is_recoverable());
    }
}
