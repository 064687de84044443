//! Canonical peer addresses.
//!
//! Peers are identified by a canonicalized `host:port` string. The canonical
//! form doubles as the total order used by the mesh-formation rule, so two
//! daemons always agree on which of them dials the other.
use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

/// Default TCP port daemons listen on.
pub const DEFAULT_PORT: u16 = 4040;

/// An invalid address string.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddrError {
    #[error("empty address")]
    Empty,
    #[error("invalid port in `{0}`")]
    Port(String),
    #[error("invalid host in `{0}`")]
    Host(String),
}

/// Rough placement of an address on the network, which decides how far
/// broadcasts travel towards it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkClass {
    /// This very host.
    Loopback,
    /// Same LAN or datacenter.
    Private,
    /// Another datacenter.
    Public,
}

impl NetworkClass {
    /// Classify an IP address.
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::of_v4(v4),
            IpAddr::V6(v6) => {
                if let Some(v4) = v6.to_ipv4_mapped() {
                    return Self::of_v4(v4);
                }
                if v6.is_loopback() {
                    NetworkClass::Loopback
                } else if is_unique_local(&v6) || is_unicast_link_local(&v6) {
                    NetworkClass::Private
                } else {
                    NetworkClass::Public
                }
            }
        }
    }

    fn of_v4(ip: Ipv4Addr) -> Self {
        if ip.is_loopback() {
            NetworkClass::Loopback
        } else if ip.is_private() || ip.is_link_local() {
            NetworkClass::Private
        } else {
            NetworkClass::Public
        }
    }
}

// `Ipv6Addr::is_unique_local` / `is_unicast_link_local` are unstable.
fn is_unique_local(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xfe00 == 0xfc00
}

fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

/// A canonicalized `host:port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CanonicalAddr {
    ip: IpAddr,
    port: u16,
}

impl CanonicalAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Parse an address string, filling in `default_port` when the port is
    /// absent.
    ///
    /// IPv4 hosts are accepted in the historical `inet_aton` notations:
    /// dotted decimal, `0x`-prefixed hexadecimal and `0`-prefixed octal
    /// components, with one to four components.
    pub fn parse(input: &str, default_port: u16) -> Result<Self, AddrError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AddrError::Empty);
        }

        let (host, port) = split_host_port(input, default_port)?;

        if let Some(ip) = parse_ipv4_host(&host) {
            return Ok(Self::new(IpAddr::V4(ip), port));
        }
        if let Ok(ip) = host.parse::<Ipv6Addr>() {
            return Ok(Self::new(IpAddr::V6(ip), port));
        }

        Err(AddrError::Host(input.to_owned()))
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host part of the canonical form, without the port.
    pub fn host_string(&self) -> String {
        match self.ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => v6.to_string(),
        }
    }

    /// Network placement of this address.
    pub fn class(&self) -> NetworkClass {
        NetworkClass::of(self.ip)
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for CanonicalAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for CanonicalAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(v4) => write!(f, "{}:{}", v4, self.port),
            IpAddr::V6(v6) => write!(f, "[{}]:{}", v6, self.port),
        }
    }
}

/// The mesh-formation order: lexicographic over the canonical string form.
impl Ord for CanonicalAddr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl PartialOrd for CanonicalAddr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn split_host_port(input: &str, default_port: u16) -> Result<(String, u16), AddrError> {
    // Bracketed IPv6, `[::1]:4040` or `[::1]`.
    if let Some(rest) = input.strip_prefix('[') {
        let Some((host, after)) = rest.split_once(']') else {
            return Err(AddrError::Host(input.to_owned()));
        };
        let port = match after.strip_prefix(':') {
            Some(port) => port
                .parse()
                .map_err(|_| AddrError::Port(input.to_owned()))?,
            None if after.is_empty() => default_port,
            None => return Err(AddrError::Port(input.to_owned())),
        };
        return Ok((host.to_owned(), port));
    }

    // A bare IPv6 literal contains more than one colon and carries no port.
    if input.matches(':').count() > 1 {
        return Ok((input.to_owned(), default_port));
    }

    match input.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| AddrError::Port(input.to_owned()))?;
            Ok((host.to_owned(), port))
        }
        None => Ok((input.to_owned(), default_port)),
    }
}

/// `inet_aton`-style IPv4 parsing: 1 to 4 components, each decimal,
/// `0x`-hex or `0`-octal; trailing components fill the remaining bits.
fn parse_ipv4_host(host: &str) -> Option<Ipv4Addr> {
    let parts: Vec<&str> = host.split('.').collect();
    if parts.is_empty() || parts.len() > 4 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }

    let mut values = Vec::with_capacity(parts.len());
    for part in &parts {
        values.push(parse_ipv4_component(part)?);
    }

    let value: u32 = match values.as_slice() {
        [a] => *a,
        [a, b] => {
            if *a > 0xff || *b > 0xff_ffff {
                return None;
            }
            (a << 24) | b
        }
        [a, b, c] => {
            if *a > 0xff || *b > 0xff || *c > 0xffff {
                return None;
            }
            (a << 24) | (b << 16) | c
        }
        [a, b, c, d] => {
            if values.iter().any(|v| *v > 0xff) {
                return None;
            }
            (a << 24) | (b << 16) | (c << 8) | d
        }
        _ => return None,
    };

    Some(Ipv4Addr::from(value))
}

fn parse_ipv4_component(part: &str) -> Option<u32> {
    if let Some(hex) = part.strip_prefix("0x").or_else(|| part.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if part.len() > 1 && part.starts_with('0') {
        u32::from_str_radix(part, 8).ok()
    } else {
        part.parse().ok()
    }
}
