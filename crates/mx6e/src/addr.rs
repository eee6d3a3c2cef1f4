//! Address arithmetic and parsing utilities.
//!
//! Translation works on 128-bit quantities; addresses are converted to
//! `u128` (network bit order, MSB first) so that prefix masks and
//! sub-byte prefix copies are plain integer operations.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error type for address parsing.
#[derive(Debug, thiserror::Error)]
pub enum AddrError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid prefix length: {0}")]
    InvalidPrefix(String),

    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("invalid plane ID: {0}")]
    InvalidPlaneId(String),
}

pub type Result<T> = std::result::Result<T, AddrError>;

/// Produce the 128-bit mask with the top `n` bits set, `n` in `0..=128`.
#[inline]
pub fn mask_from_prefix(n: u8) -> u128 {
    match n {
        0 => 0,
        1..=127 => !0u128 << (128 - n as u32),
        _ => !0u128,
    }
}

/// Copy the top `n` bits of `src` into `dst`, leaving the remaining
/// bits of `dst` untouched. Sub-byte residue needs no special casing:
/// the mask is exact at any bit position.
#[inline]
pub fn apply_prefix(dst: u128, src: u128, n: u8) -> u128 {
    let m = mask_from_prefix(n);
    (src & m) | (dst & !m)
}

/// Compare two addresses under a mask.
#[inline]
pub fn addr_equal_masked(a: u128, b: u128, m: u128) -> bool {
    (a & m) == (b & m)
}

/// Produce the IPv4 subnet mask for a CIDR prefix length, `n` in `0..=32`.
#[inline]
pub fn v4_mask_from_cidr(n: u8) -> u32 {
    match n {
        0 => 0,
        1..=31 => !0u32 << (32 - n as u32),
        _ => !0u32,
    }
}

/// Check that an IPv4 address is the network address of its CIDR block
/// (host bits all zero).
pub fn is_network_addr(addr: Ipv4Addr, cidr: u8) -> bool {
    if cidr > 32 {
        return false;
    }
    let bits = u32::from(addr);
    bits & !v4_mask_from_cidr(cidr) == 0
}

/// Significant width of a plane ID in bits: the distance from the most
/// significant set bit down to bit 0. An all-zero plane ID has width 0
/// and acts as a wildcard.
#[inline]
pub fn pid_width(pid: u128) -> u8 {
    (128 - pid.leading_zeros()) as u8
}

/// Parse a textual plane ID as an IPv6 suffix by prepending `::`.
///
/// `"1:2"` parses to `0x10002`, `"8000"` to `0x8000`. A string that is
/// not a valid IPv6 suffix is rejected.
pub fn parse_plane_id(s: &str) -> Result<u128> {
    let text = format!("::{s}");
    let addr: Ipv6Addr = text
        .parse()
        .map_err(|_| AddrError::InvalidPlaneId(s.to_string()))?;
    Ok(u128::from(addr))
}

/// Parse an IPv6 address with prefix length (`addr/len` form).
pub fn parse_v6_prefix(s: &str) -> Result<(Ipv6Addr, u8)> {
    let (addr_str, len_str) = s
        .split_once('/')
        .ok_or_else(|| AddrError::InvalidPrefix(s.to_string()))?;
    let addr: Ipv6Addr = addr_str
        .parse()
        .map_err(|_| AddrError::InvalidAddress(addr_str.to_string()))?;
    let len: u8 = len_str
        .parse()
        .map_err(|_| AddrError::InvalidPrefix(len_str.to_string()))?;
    if len > 128 {
        return Err(AddrError::InvalidPrefix(format!(
            "{len} exceeds maximum 128"
        )));
    }
    Ok((addr, len))
}

/// Parse an IPv4 network with CIDR (`addr/len` form).
pub fn parse_v4_prefix(s: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr_str, len_str) = s
        .split_once('/')
        .ok_or_else(|| AddrError::InvalidPrefix(s.to_string()))?;
    let addr: Ipv4Addr = addr_str
        .parse()
        .map_err(|_| AddrError::InvalidAddress(addr_str.to_string()))?;
    let len: u8 = len_str
        .parse()
        .map_err(|_| AddrError::InvalidPrefix(len_str.to_string()))?;
    if len > 32 {
        return Err(AddrError::InvalidPrefix(format!("{len} exceeds maximum 32")));
    }
    Ok((addr, len))
}

/// A 48-bit Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// The broadcast address (all 0xff).
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    /// The low 48 bits as an integer, for embedding into an IPv6 address.
    #[inline]
    pub fn to_u128(self) -> u128 {
        let mut v = 0u128;
        for b in self.0 {
            v = (v << 8) | b as u128;
        }
        v
    }

    /// Extract a MAC from the low 48 bits of an integer.
    pub fn from_low_bits(v: u128) -> Self {
        let mut octets = [0u8; 6];
        for (i, b) in octets.iter_mut().enumerate() {
            *b = (v >> (8 * (5 - i))) as u8;
        }
        MacAddr(octets)
    }

    /// Check for the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
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

impl FromStr for MacAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(AddrError::InvalidMac(s.to_string()));
        }

        let mut mac = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            mac[i] =
                u8::from_str_radix(part, 16).map_err(|_| AddrError::InvalidMac(s.to_string()))?;
        }

        Ok(MacAddr(mac))
    }
}

/// Format a 128-bit value as an IPv6 address.
pub fn format_v6(bits: u128) -> String {
    Ipv6Addr::from(bits).to_string()
}
