//! Address grammar and the UTLS ⇄ TLS ⇄ local-IPC derivation rules.
//!
//! This is deliberately small: full address-family parsing (DNS resolution,
//! IPv6 zone ids, etc.) is out of scope for the core. What the core *does*
//! need is the `proto:rest` split (for registry lookup, §4.1) and the
//! host+port round-trip UTLS depends on to derive its sibling addresses
//! (§4.5).

use crate::error::XcmError;

/// Maximum length of a transport protocol name, matching the registry's
/// address-protocol maximum (§4.1).
pub const MAX_PROTO_LEN: usize = 16;

/// Splits a user-supplied address into its leading `proto:` token and the
/// remainder, e.g. `"tcp:127.0.0.1:4711"` -> `("tcp", "127.0.0.1:4711")`.
pub fn split_proto(addr: &str) -> Result<(&str, &str), XcmError> {
    match addr.split_once(':') {
        Some((proto, rest)) if !proto.is_empty() && proto.len() <= MAX_PROTO_LEN => {
            Ok((proto, rest))
        }
        _ => Err(XcmError::AddrParse(addr.to_string())),
    }
}

/// A parsed `host:port` pair, as used by the `tcp`/`tls`/`utls`/`sctp`
/// address families.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    /// Parses the `host:port` tail of a `tcp:`/`tls:`/`utls:` address.
    /// `host` is taken verbatim (IPv4, bracketed IPv6, DNS name, or `*`
    /// wildcard) -- resolution is left to the concrete transport.
    pub fn parse(rest: &str) -> Result<Self, XcmError> {
        let (host, port_str) = rest
            .rsplit_once(':')
            .ok_or_else(|| XcmError::AddrParse(rest.to_string()))?;
        if host.is_empty() {
            return Err(XcmError::AddrParse(rest.to_string()));
        }
        let port: u16 = port_str
            .parse()
            .map_err(|_| XcmError::AddrParse(rest.to_string()))?;
        Ok(HostPort {
            host: host.to_string(),
            port,
        })
    }

    pub fn to_tls_addr(&self) -> String {
        format!("tls:{}:{}", self.host, self.port)
    }

    pub fn to_utls_addr(&self) -> String {
        format!("utls:{}:{}", self.host, self.port)
    }

    /// Derives the local-IPC abstract name a UTLS address maps onto: the
    /// host+port substring becomes the `ux` name verbatim (§4.5, §6).
    pub fn to_ux_addr(&self) -> String {
        format!("ux:{}:{}", self.host, self.port)
    }
}

/// Parses a full `tcp:`/`tls:`/`utls:` address into (proto, host, port).
pub fn parse_host_port_addr(addr: &str) -> Result<(String, HostPort), XcmError> {
    let (proto, rest) = split_proto(addr)?;
    let hp = HostPort::parse(rest)?;
    Ok((proto.to_string(), hp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_proto_extracts_leading_token() {
        assert_eq!(split_proto("tcp:127.0.0.1:99").unwrap(), ("tcp", "127.0.0.1:99"));
        assert_eq!(split_proto("ux:my-name").unwrap(), ("ux", "my-name"));
    }

    #[test]
    fn split_proto_rejects_missing_colon() {
        assert!(split_proto("garbage").is_err());
    }

    #[test]
    fn host_port_round_trips_through_utls_derivation() {
        let (proto, hp) = parse_host_port_addr("utls:127.0.0.1:13001").unwrap();
        assert_eq!(proto, "utls");
        assert_eq!(hp.host, "127.0.0.1");
        assert_eq!(hp.port, 13001);
        assert_eq!(hp.to_tls_addr(), "tls:127.0.0.1:13001");
        assert_eq!(hp.to_ux_addr(), "ux:127.0.0.1:13001");
        assert_eq!(hp.to_utls_addr(), "utls:127.0.0.1:13001");
    }

    #[test]
    fn bracketed_ipv6_host_is_preserved() {
        let hp = HostPort::parse("[::1]:443").unwrap();
        assert_eq!(hp.host, "[::1]");
        assert_eq!(hp.port, 443);
    }

    #[test]
    fn port_zero_is_legal_for_kernel_allocation() {
        let hp = HostPort::parse("127.0.0.1:0").unwrap();
        assert_eq!(hp.port, 0);
    }
}
