//! Bootstrap seed addresses.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tapmesh_wire::{MacAddr, ParseMacError};
use thiserror::Error;

/// A bootstrap peer: expected identity plus dial address
///
/// Written `MAC@HOST:PORT`. The host may be bracketed (`[::1]:1234`); a bare
/// IPv6 address also works because the port is split off at the last colon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seed {
    /// MAC the dialed peer must prove via its certificate
    pub mac: MacAddr,
    /// Address to dial
    pub addr: SocketAddr,
}

/// Errors for malformed seed strings
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SeedError {
    /// No `@` separating the MAC from the address
    #[error("seed is missing '@' between mac and address")]
    MissingAt,
    /// No `:` separating the host from the port
    #[error("seed is missing a port")]
    MissingPort,
    /// The identity part is not a MAC
    #[error(transparent)]
    BadMac(#[from] ParseMacError),
    /// The host part is not an IP address
    #[error("seed host {0:?} is not an ip address")]
    BadHost(String),
    /// The port part is not a valid port number
    #[error("seed port {0:?} is invalid")]
    BadPort(String),
}

impl FromStr for Seed {
    type Err = SeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mac_str, addr_str) = s.split_once('@').ok_or(SeedError::MissingAt)?;
        let mac: MacAddr = mac_str.parse()?;

        let (host, port_str) = addr_str.rsplit_once(':').ok_or(SeedError::MissingPort)?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| SeedError::BadPort(port_str.to_string()))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let ip: IpAddr = host
            .parse()
            .map_err(|_| SeedError::BadHost(host.to_string()))?;

        Ok(Seed {
            mac,
            addr: SocketAddr::new(ip, port),
        })
    }
}

impl fmt::Display for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.mac, self.addr)
    }
}
