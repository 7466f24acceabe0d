//! CIDR network range parsing.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// An IPv4 or IPv6 network range with all host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    /// Network address.
    pub address: IpAddr,
    /// Prefix length in bits.
    pub prefix_len: u8,
}

/// Reasons a CIDR string is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CidrError {
    /// No `/` separator.
    #[error("missing '/<prefix>' in '{0}'")]
    MissingPrefix(String),

    /// The address part is not an IP address.
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    /// The prefix part is not a number.
    #[error("invalid prefix length '{0}'")]
    InvalidPrefix(String),

    /// The prefix is longer than the address.
    #[error("prefix length {prefix} exceeds {max}")]
    PrefixTooLong {
        /// Parsed prefix length.
        prefix: u8,
        /// Address width in bits.
        max: u8,
    },

    /// The address has bits set beyond the prefix.
    #[error("host bits set; network address is {network}")]
    HostBitsSet {
        /// The range with host bits cleared.
        network: String,
    },
}

impl Cidr {
    /// Parses `address/prefix`.
    ///
    /// # Errors
    ///
    /// Returns a [`CidrError`] when the string is malformed or when bits
    /// beyond the prefix are set.
    pub fn parse(input: &str) -> Result<Self, CidrError> {
        let (addr, prefix) = input
            .split_once('/')
            .ok_or_else(|| CidrError::MissingPrefix(input.to_string()))?;

        let address: IpAddr = addr
            .parse()
            .map_err(|_| CidrError::InvalidAddress(addr.to_string()))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| CidrError::InvalidPrefix(prefix.to_string()))?;

        let max = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(CidrError::PrefixTooLong {
                prefix: prefix_len,
                max,
            });
        }

        let network = Self::mask(address, prefix_len);
        if network != address {
            return Err(CidrError::HostBitsSet {
                network: format!("{network}/{prefix_len}"),
            });
        }

        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// Returns true for IPv4 ranges.
    #[must_use]
    pub const fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    fn mask(address: IpAddr, prefix_len: u8) -> IpAddr {
        match address {
            IpAddr::V4(v4) => {
                let bits = u32::from(v4);
                let mask = u32::MAX.checked_shl(32 - u32::from(prefix_len)).unwrap_or(0);
                IpAddr::V4((bits & mask).into())
            }
            IpAddr::V6(v6) => {
                let bits = u128::from(v6);
                let mask = u128::MAX.checked_shl(128 - u32::from(prefix_len)).unwrap_or(0);
                IpAddr::V6((bits & mask).into())
            }
        }
    }
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let cidr = Cidr::parse("10.40.0.0/16").unwrap();
        assert!(cidr.is_ipv4());
        assert_eq!(cidr.prefix_len, 16);
        assert_eq!(cidr.to_string(), "10.40.0.0/16");

        assert!(Cidr::parse("0.0.0.0/0").is_ok());
        assert!(Cidr::parse("192.168.1.7/32").is_ok());
    }

    #[test]
    fn test_parse_ipv6() {
        let cidr: Cidr = "2001:db8::/32".parse().unwrap();
        assert!(!cidr.is_ipv4());
        assert!(Cidr::parse("::/0").is_ok());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(Cidr::parse("10.0.0.0"), Err(CidrError::MissingPrefix(_))));
        assert!(matches!(Cidr::parse("10.0.0/16"), Err(CidrError::InvalidAddress(_))));
        assert!(matches!(Cidr::parse("10.0.0.0/x"), Err(CidrError::InvalidPrefix(_))));
        assert_eq!(
            Cidr::parse("10.0.0.0/33"),
            Err(CidrError::PrefixTooLong { prefix: 33, max: 32 })
        );
    }

    #[test]
    fn test_rejects_host_bits() {
        let err = Cidr::parse("10.0.0.1/16").unwrap_err();
        assert_eq!(
            err,
            CidrError::HostBitsSet {
                network: String::from("10.0.0.0/16")
            }
        );
    }
}
