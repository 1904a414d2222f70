//! IP prefixes.

use serde::{Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// An IPv4 or IPv6 prefix such as `10.0.0.0/8`.
///
/// Host bits must be zero; `10.1.2.3/8` is rejected rather than silently
/// masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Prefix {
    addr: IpAddr,
    len: u8,
}

/// Why a prefix failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrefixError {
    /// No `/` separator.
    #[error("missing prefix length in '{0}'")]
    MissingLength(String),
    /// The address part is not an IP address.
    #[error("invalid address in '{0}'")]
    InvalidAddress(String),
    /// The length is not a number or too long for the family.
    #[error("invalid prefix length in '{0}'")]
    InvalidLength(String),
    /// Bits set beyond the prefix length.
    #[error("host bits set in '{0}'")]
    HostBits(String),
}

impl Prefix {
    /// Creates a prefix, checking length and host bits.
    pub fn new(addr: IpAddr, len: u8) -> Result<Self, PrefixError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if len > max {
            return Err(PrefixError::InvalidLength(format!("{addr}/{len}")));
        }
        let host_bits = match addr {
            IpAddr::V4(a) => {
                let bits = u32::from(a);
                bits.checked_shl(u32::from(len)).unwrap_or(0) != 0
            }
            IpAddr::V6(a) => {
                let bits = u128::from(a);
                bits.checked_shl(u32::from(len)).unwrap_or(0) != 0
            }
        };
        if host_bits {
            return Err(PrefixError::HostBits(format!("{addr}/{len}")));
        }
        Ok(Self { addr, len })
    }

    /// Network address.
    #[must_use]
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length in bits.
    #[must_use]
    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    /// True for the default route.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.len == 0
    }
}

impl FromStr for Prefix {
    type Err = PrefixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| PrefixError::MissingLength(s.to_string()))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| PrefixError::InvalidAddress(s.to_string()))?;
        let len: u8 = len
            .parse()
            .map_err(|_| PrefixError::InvalidLength(s.to_string()))?;
        Self::new(addr, len)
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl Serialize for Prefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let p: Prefix = "10.0.0.0/8".parse().unwrap();
        assert_eq!(p.prefix_len(), 8);
        assert_eq!(p.to_string(), "10.0.0.0/8");

        let v6: Prefix = "2001:db8::/32".parse().unwrap();
        assert_eq!(v6.to_string(), "2001:db8::/32");

        let default: Prefix = "0.0.0.0/0".parse().unwrap();
        assert!(default.is_default());
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!(
            "10.0.0.0".parse::<Prefix>(),
            Err(PrefixError::MissingLength(_))
        ));
        assert!(matches!(
            "10.0.0.300/8".parse::<Prefix>(),
            Err(PrefixError::InvalidAddress(_))
        ));
        assert!(matches!(
            "10.0.0.0/33".parse::<Prefix>(),
            Err(PrefixError::InvalidLength(_))
        ));
        assert!(matches!(
            "10.1.0.0/8".parse::<Prefix>(),
            Err(PrefixError::HostBits(_))
        ));
    }

    #[test]
    fn host_route() {
        let p: Prefix = "192.168.1.1/32".parse().unwrap();
        assert_eq!(p.addr().to_string(), "192.168.1.1");
    }
}
