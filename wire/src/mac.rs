//! MAC addresses as node identity.
//!
//! Every tapmesh node derives its 6-byte MAC from the common name of its
//! X.509 certificate, so the same value names the node on the wire, in the
//! route table, and on the local TAP interface.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A 6-byte layer-2 hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// The Ethernet broadcast address `ff:ff:ff:ff:ff:ff`.
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    /// Create an address from raw bytes.
    pub const fn new(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }

    /// Whether this is the Ethernet broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// The raw octets.
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Read an address from the first six bytes of a buffer.
    ///
    /// Returns `None` when the buffer is shorter than six bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<MacAddr> {
        let octets: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(MacAddr(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Error for strings that do not parse as a colon-separated MAC
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid mac address: {0:?}")]
pub struct ParseMacError(pub String);

impl FromStr for MacAddr {
    type Err = ParseMacError;

    /// Parse `aa:bb:cc:dd:ee:ff` (either case) into an address.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseMacError(s.to_string());
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');

        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(err)?;
            if part.len() != 2 {
                return Err(err());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }

        if parts.next().is_some() {
            return Err(err());
        }
        Ok(MacAddr(octets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:0f".parse().unwrap();
        assert_eq!(mac.as_bytes(), &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x0f]);
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:0f");

        // Uppercase is accepted, display is always lowercase
        let upper: MacAddr = "AA:BB:CC:DD:EE:0F".parse().unwrap();
        assert_eq!(upper, mac);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:f".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:zz".parse::<MacAddr>().is_err());
        assert!("aabbccddeeff".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_broadcast() {
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert_eq!(MacAddr::BROADCAST.to_string(), "ff:ff:ff:ff:ff:ff");

        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert!(!mac.is_broadcast());
    }

    #[test]
    fn test_from_slice() {
        let bytes = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mac = MacAddr::from_slice(&bytes).unwrap();
        assert_eq!(mac.as_bytes(), &[1, 2, 3, 4, 5, 6]);

        assert!(MacAddr::from_slice(&bytes[..5]).is_none());
    }
}
