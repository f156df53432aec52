use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Serialize;

/// An IP network identity: the address masked down to a prefix.
///
/// Keys derived with the same prefix lengths partition the address
/// space, so grouping by `SubnetKey` is a well-defined rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubnetKey {
    pub network: IpAddr,
    pub prefix: u8,
}

impl SubnetKey {
    /// Derive the key for `ip`, using the prefix length matching the
    /// address family.
    pub fn of(ip: IpAddr, prefix_v4: u8, prefix_v6: u8) -> SubnetKey {
        match ip {
            IpAddr::V4(v4) => SubnetKey {
                network: IpAddr::V4(mask_v4(v4, prefix_v4)),
                prefix: prefix_v4,
            },
            IpAddr::V6(v6) => SubnetKey {
                network: IpAddr::V6(mask_v6(v6, prefix_v6)),
                prefix: prefix_v6,
            },
        }
    }
}

fn mask_v4(ip: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    let bits = u32::from(ip);
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    };
    Ipv4Addr::from(bits & mask)
}

fn mask_v6(ip: Ipv6Addr, prefix: u8) -> Ipv6Addr {
    let bits = u128::from(ip);
    let mask = if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u128::from(prefix.min(128)))
    };
    Ipv6Addr::from(bits & mask)
}

impl fmt::Display for SubnetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl Serialize for SubnetKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
