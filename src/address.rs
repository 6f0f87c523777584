//! Minimal host/authority address types, in the shape of
//! `rama_net::address::{Host, Authority}`, scoped down to what the
//! connection fabric and proxy connectors need.

use std::fmt;
use std::net::IpAddr;

/// A hostname or a literal IP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Name(String),
    Ip(IpAddr),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Name(n) => f.write_str(n),
            Host::Ip(IpAddr::V4(ip)) => write!(f, "{ip}"),
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]"),
        }
    }
}

impl From<&str> for Host {
    fn from(s: &str) -> Self {
        if let Ok(ip) = s.parse::<IpAddr>() {
            Host::Ip(ip)
        } else {
            Host::Name(s.to_string())
        }
    }
}

/// A [`Host`] with an associated port, e.g. `example.com:443`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
    pub host: Host,
    pub port: u16,
}

impl Authority {
    pub fn new(host: Host, port: u16) -> Self {
        Self { host, port }
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv6_host_is_bracketed() {
        let a = Authority::new(Host::from("::1"), 8080);
        assert_eq!(a.to_string(), "[::1]:8080");
    }

    #[test]
    fn name_host_round_trips() {
        let a = Authority::new(Host::from("example.com"), 443);
        assert_eq!(a.to_string(), "example.com:443");
    }
}
