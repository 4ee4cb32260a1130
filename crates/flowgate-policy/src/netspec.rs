//! Grammars for endpoint filter fields.
//!
//! Ports: `port | lo-hi | spec,spec,...` with ports in 1..=65535 and
//! `lo <= hi`. Addresses: IPv4 literal or `IPv4/prefix` CIDR. IPv6 forms are
//! recognized as well-formed so the validator can accept them; the compiler
//! is the layer that refuses to emit them.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

/// A single parsed element of a port spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortCondition {
    Single(u16),
    Range(u16, u16),
}

impl PortCondition {
    pub fn contains(&self, port: u16) -> bool {
        match self {
            Self::Single(p) => *p == port,
            Self::Range(lo, hi) => (*lo..=*hi).contains(&port),
        }
    }
}

impl std::fmt::Display for PortCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(p) => write!(f, "{p}"),
            Self::Range(lo, hi) => write!(f, "{lo}-{hi}"),
        }
    }
}

/// Expands a comma-separated port spec into its ordered elements. The order
/// is load-bearing: the element index feeds filter-key derivation.
pub fn parse_port_spec(spec: &str) -> Result<Vec<PortCondition>, String> {
    if spec.trim().is_empty() {
        return Err("port spec is empty".to_string());
    }
    let mut conditions = Vec::new();
    for element in spec.split(',') {
        conditions.push(parse_port_element(element.trim())?);
    }
    Ok(conditions)
}

fn parse_port_element(element: &str) -> Result<PortCondition, String> {
    if element.is_empty() {
        return Err("empty element in port spec".to_string());
    }
    if let Some((lo, hi)) = element.split_once('-') {
        let lo = parse_port(lo.trim())?;
        let hi = parse_port(hi.trim())?;
        if lo > hi {
            return Err(format!("port range start {lo} exceeds end {hi}"));
        }
        return Ok(PortCondition::Range(lo, hi));
    }
    Ok(PortCondition::Single(parse_port(element)?))
}

fn parse_port(text: &str) -> Result<u16, String> {
    let port: u32 = text
        .parse()
        .map_err(|_| format!("'{text}' is not a port number"))?;
    if !(1..=65_535).contains(&port) {
        return Err(format!("port {port} is outside 1..65535"));
    }
    Ok(port as u16)
}

/// Parsed address spec. The model admits IPv6; only the V4 arms survive
/// compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpSpec {
    V4(Ipv4Addr),
    V4Net(Ipv4Net),
    V6(Ipv6Addr),
    V6Net(Ipv6Net),
}

pub fn parse_ip_spec(text: &str) -> Result<IpSpec, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("ip spec is empty".to_string());
    }
    if let Ok(addr) = Ipv4Addr::from_str(text) {
        return Ok(IpSpec::V4(addr));
    }
    if let Ok(addr) = Ipv6Addr::from_str(text) {
        return Ok(IpSpec::V6(addr));
    }
    if let Some((addr, prefix)) = text.split_once('/') {
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| format!("'{prefix}' is not a prefix length"))?;
        if let Ok(v4) = Ipv4Addr::from_str(addr) {
            let net = Ipv4Net::new(v4, prefix)
                .map_err(|_| format!("prefix /{prefix} is outside 0..32"))?;
            return Ok(IpSpec::V4Net(net));
        }
        if let Ok(v6) = Ipv6Addr::from_str(addr) {
            let net = Ipv6Net::new(v6, prefix)
                .map_err(|_| format!("prefix /{prefix} is outside 0..128"))?;
            return Ok(IpSpec::V6Net(net));
        }
    }
    Err(format!("'{text}' is not an IPv4/IPv6 address or CIDR"))
}

impl IpSpec {
    pub fn is_v6(&self) -> bool {
        matches!(self, Self::V6(_) | Self::V6Net(_))
    }

    /// Membership test against a concrete v4 address; v6 specs match nothing
    /// here because the evaluator only models the v4 layers.
    pub fn matches_v4(&self, addr: Ipv4Addr) -> bool {
        match self {
            Self::V4(exact) => *exact == addr,
            Self::V4Net(net) => net.contains(&addr),
            Self::V6(_) | Self::V6Net(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_port() {
        assert_eq!(parse_port_spec("443").unwrap(), vec![PortCondition::Single(443)]);
    }

    #[test]
    fn range_and_list_preserve_order() {
        let parsed = parse_port_spec("80,443,8000-9000").unwrap();
        assert_eq!(
            parsed,
            vec![
                PortCondition::Single(80),
                PortCondition::Single(443),
                PortCondition::Range(8000, 9000),
            ]
        );
    }

    #[test]
    fn whitespace_is_tolerated_between_elements() {
        let parsed = parse_port_spec(" 80 , 443 ").unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn rejects_zero_and_overflow_and_inverted_ranges() {
        assert!(parse_port_spec("0").is_err());
        assert!(parse_port_spec("65536").is_err());
        assert!(parse_port_spec("100-50").is_err());
        assert!(parse_port_spec("80,,443").is_err());
        assert!(parse_port_spec("").is_err());
    }

    #[test]
    fn ip_literal_and_cidr() {
        assert!(matches!(parse_ip_spec("1.1.1.1").unwrap(), IpSpec::V4(_)));
        assert!(matches!(parse_ip_spec("10.0.0.0/8").unwrap(), IpSpec::V4Net(_)));
        assert!(parse_ip_spec("10.0.0.0/33").is_err());
        assert!(parse_ip_spec("not-an-ip").is_err());
    }

    #[test]
    fn ipv6_is_wellformed_but_flagged() {
        assert!(parse_ip_spec("::1").unwrap().is_v6());
        assert!(parse_ip_spec("2001:db8::/32").unwrap().is_v6());
    }

    #[test]
    fn cidr_membership() {
        let spec = parse_ip_spec("10.0.0.0/8").unwrap();
        assert!(spec.matches_v4("10.1.2.3".parse().unwrap()));
        assert!(!spec.matches_v4("11.0.0.1".parse().unwrap()));
    }
}
