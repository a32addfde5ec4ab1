//! IP access control list for inbound links
//!
//! Parses "all", "a.b.c.d", "a.b.c.d/bits" or "a.b.c.d/e.f.g.h" masks.
//! The master role uses an [`AccessList`] to decide which peers may open an
//! edge link; an empty list admits everyone.

use std::net::{IpAddr, Ipv4Addr};

/// An IPv4 address + mask pair, both in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessControl {
    pub ip: u32,
    /// 0 means "match all".
    pub mask: u32,
}

impl AccessControl {
    /// Returns true if `ip` falls within this entry.
    ///
    /// IPv6 peers only match the catch-all entry; IPv4-mapped addresses are
    /// compared as IPv4.
    pub fn matches(&self, ip: IpAddr) -> bool {
        if self.mask == 0 {
            return true;
        }
        let v4 = match ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => v4,
                None => return false,
            },
        };
        (u32::from(v4) & self.mask) == (self.ip & self.mask)
    }
}

/// Parse an IP/mask string into an [`AccessControl`].
///
/// Returns `None` on invalid input.
pub fn parse_ipmask(s: &str) -> Option<AccessControl> {
    let s = s.trim();
    if s == "all" {
        return Some(AccessControl { ip: 0, mask: 0 });
    }

    if let Some((addr_part, mask_part)) = s.split_once('/') {
        let ip = parse_ipv4(addr_part)?;
        if mask_part.contains('.') {
            let mask = parse_ipv4(mask_part)?;
            return Some(AccessControl { ip, mask });
        }
        let bits: u32 = mask_part.parse().ok()?;
        if bits > 32 {
            return None;
        }
        return Some(AccessControl { ip, mask: prefix_to_mask(bits) });
    }

    let ip = parse_ipv4(s)?;
    Some(AccessControl {
        ip,
        mask: 0xFFFF_FFFF,
    })
}

/// An ordered allow-list. Empty means "allow everything".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessList {
    entries: Vec<AccessControl>,
}

impl AccessList {
    /// Parse every mask, returning the first one that fails.
    pub fn parse<S: AsRef<str>>(masks: &[S]) -> Result<Self, String> {
        let mut entries = Vec::with_capacity(masks.len());
        for mask in masks {
            let mask = mask.as_ref();
            entries.push(parse_ipmask(mask).ok_or_else(|| mask.to_string())?);
        }
        Ok(Self { entries })
    }

    pub fn permits(&self, ip: IpAddr) -> bool {
        self.entries.is_empty() || self.entries.iter().any(|acl| acl.matches(ip))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_ipv4(s: &str) -> Option<u32> {
    s.parse::<Ipv4Addr>().ok().map(u32::from)
}

/// Convert a CIDR prefix length (0–32) to a host-order mask.
fn prefix_to_mask(bits: u32) -> u32 {
    match bits {
        0 => 0,
        32 => 0xFFFF_FFFF,
        n => 0xFFFF_FFFF_u32 << (32 - n),
    }
}
