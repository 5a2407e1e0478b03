//! Multiaddress list parsing.
//!
//! # Responsibilities
//! - Split a comma-separated address list and parse each entry
//! - Resolve `ip4|ip6 + tcp` addresses into socket addresses for binding
//!
//! # Design Decisions
//! - Whitespace around entries is ignored; empty entries are skipped
//! - The first bad entry fails the whole list and is named in the error

use std::net::{IpAddr, SocketAddr};

use multiaddr::{Multiaddr, Protocol};

/// Error for an address list entry that is not a valid multiaddress.
#[derive(Debug, thiserror::Error)]
#[error("invalid multiaddress '{token}': {source}")]
pub struct AddressParseError {
    pub token: String,
    #[source]
    pub source: multiaddr::Error,
}

/// Why an address cannot be bound by the host.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnsupportedAddress {
    #[error("no ip4/ip6 component")]
    NoIp,
    #[error("transport '{0}' is not supported")]
    Transport(String),
    #[error("no tcp port")]
    NoPort,
}

/// Parse a comma-separated list of multiaddresses.
///
/// Empty input yields an empty list.
pub fn parse_address_list(input: &str) -> Result<Vec<Multiaddr>, AddressParseError> {
    input
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            token.parse::<Multiaddr>().map_err(|source| AddressParseError {
                token: token.to_string(),
                source,
            })
        })
        .collect()
}

/// Resolve a TCP multiaddress into a socket address.
pub fn socket_addr(addr: &Multiaddr) -> Result<SocketAddr, UnsupportedAddress> {
    let mut iter = addr.iter();
    let ip: IpAddr = match iter.next() {
        Some(Protocol::Ip4(ip)) => ip.into(),
        Some(Protocol::Ip6(ip)) => ip.into(),
        _ => return Err(UnsupportedAddress::NoIp),
    };
    match iter.next() {
        Some(Protocol::Tcp(port)) => Ok(SocketAddr::new(ip, port)),
        Some(other) => Err(UnsupportedAddress::Transport(protocol_name(&other))),
        None => Err(UnsupportedAddress::NoPort),
    }
}

/// Build the TCP multiaddress for a bound socket.
pub fn to_multiaddr(addr: SocketAddr) -> Multiaddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) => Protocol::Ip4(ip),
        IpAddr::V6(ip) => Protocol::Ip6(ip),
    };
    Multiaddr::empty().with(ip).with(Protocol::Tcp(addr.port()))
}

fn protocol_name(p: &Protocol<'_>) -> String {
    p.tag().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_with_whitespace_and_empty_entries() {
        let addrs =
            parse_address_list(" /ip4/0.0.0.0/tcp/4040 ,, /ip4/0.0.0.0/udp/4141/quic ,").unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].to_string(), "/ip4/0.0.0.0/tcp/4040");
        assert_eq!(addrs[1].to_string(), "/ip4/0.0.0.0/udp/4141/quic");
    }

    #[test]
    fn test_empty_input_is_empty_list() {
        assert!(parse_address_list("").unwrap().is_empty());
        assert!(parse_address_list(" , ").unwrap().is_empty());
    }

    #[test]
    fn test_bad_entry_is_named() {
        let err = parse_address_list("/ip4/1.2.3.4/tcp/1,not-an-addr").unwrap_err();
        assert_eq!(err.token, "not-an-addr");
        assert!(err.to_string().contains("not-an-addr"));
    }

    #[test]
    fn test_socket_addr_resolution() {
        let tcp: Multiaddr = "/ip4/127.0.0.1/tcp/4040".parse().unwrap();
        assert_eq!(socket_addr(&tcp).unwrap(), "127.0.0.1:4040".parse().unwrap());

        let v6: Multiaddr = "/ip6/::1/tcp/9".parse().unwrap();
        assert_eq!(socket_addr(&v6).unwrap(), "[::1]:9".parse().unwrap());

        let quic: Multiaddr = "/ip4/0.0.0.0/udp/4141/quic".parse().unwrap();
        assert!(matches!(socket_addr(&quic), Err(UnsupportedAddress::Transport(_))));

        let dns: Multiaddr = "/dns4/example.com/tcp/1".parse().unwrap();
        assert_eq!(socket_addr(&dns), Err(UnsupportedAddress::NoIp));
    }

    #[test]
    fn test_to_multiaddr() {
        let addr = to_multiaddr("10.0.0.1:80".parse().unwrap());
        assert_eq!(addr.to_string(), "/ip4/10.0.0.1/tcp/80");
    }
}
