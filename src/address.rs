// Deterministic per-service IPv6 addresses
//
// Every service gets its own address inside a unique local /64:
//
// ```text
// | 127 ........ 64 | 63 ... 48 | 47 ......... 0 |
// |   ULA prefix    | port field | host suffix    |
// ```
//
// The host suffix is the low 48 bits of the uplink's link-local interface
// identifier, so the same host always derives the same address for the
// same port, across restarts, with no state kept anywhere.

use anyhow::{Result, anyhow};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

/// Ports whose decimal digits fit into the four nibbles of the port field
const DECIMAL_PORTS: u32 = 10_000;

const HOST_BITS_MASK: u64 = 0xffff_ffff_ffff;

/// Interface identifier of this host: the low 64 bits of its link-local address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostSuffix(u64);

impl HostSuffix {
    pub fn new(bits: u64) -> Self {
        Self(bits)
    }

    pub fn from_addr(ip: &Ipv6Addr) -> Self {
        Self(u128::from(*ip) as u64)
    }

    pub fn bits(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HostSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:x}:{:x}:{:x}:{:x}",
            (b >> 48) as u16,
            (b >> 32) as u16,
            (b >> 16) as u16,
            b as u16
        )
    }
}

/// Pick the suffix of the first link-local IPv6 address (fe80::/10)
pub fn suffix_from_addresses<I>(addrs: I) -> Option<HostSuffix>
where
    I: IntoIterator<Item = IpAddr>,
{
    addrs.into_iter().find_map(|ip| match ip {
        IpAddr::V6(v6) if v6.is_unicast_link_local() => Some(HostSuffix::from_addr(&v6)),
        _ => None,
    })
}

/// Scan the interfaces that are up for this host's interface identifier.
///
/// Assumes a single relevant uplink: the first link-local address wins.
pub fn host_suffix() -> Result<HostSuffix> {
    for iface in pnet_datalink::interfaces() {
        if !iface.is_up() {
            continue;
        }
        if let Some(suffix) = suffix_from_addresses(iface.ips.iter().map(|net| net.ip())) {
            log::debug!("Host suffix {} from interface {}", suffix, iface.name);
            return Ok(suffix);
        }
    }
    Err(anyhow!(
        "No interface with an IPv6 link-local address found"
    ))
}

/// Decimal digits of `port` as hex nibbles: 8080 -> 0x8080
fn decimal_nibbles(mut port: u16) -> u16 {
    let mut field = 0;
    let mut shift = 0;
    while port > 0 {
        field |= (port % 10) << shift;
        port /= 10;
        shift += 4;
    }
    field
}

/// How many 16-bit values below `v` consist of decimal nibbles only
fn decimal_values_below(v: u32) -> u32 {
    if v > 0xffff {
        return DECIMAL_PORTS;
    }
    let mut count = 0;
    for i in (0..4).rev() {
        let nibble = (v >> (4 * i)) & 0xf;
        count += nibble.min(10) * 10u32.pow(i);
        if nibble >= 10 {
            break;
        }
    }
    count
}

/// The `k`-th (0-based) 16-bit value containing a nibble >= 0xa
fn nth_non_decimal(k: u32) -> u16 {
    let (mut lo, mut hi) = (0u32, 0xffffu32);
    while lo < hi {
        let mid = (lo + hi) / 2;
        let non_decimal_through_mid = mid + 1 - decimal_values_below(mid + 1);
        if non_decimal_through_mid > k {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo as u16
}

/// 16-bit port field of a service address.
///
/// Ports below 10000 keep their decimal digits readable (port 8080 ->
/// `:8080:`). Higher ports take the remaining values, those with at least
/// one nibble in `a..=f`, in ascending order. Every port maps to a
/// distinct field.
pub fn port_field(port: u16) -> u16 {
    let port = u32::from(port);
    if port < DECIMAL_PORTS {
        decimal_nibbles(port as u16)
    } else {
        nth_non_decimal(port - DECIMAL_PORTS)
    }
}

/// Address of the service listening on `port`: a pure function of the
/// prefix, the port and the host suffix
pub fn service_address(prefix: Ipv6Addr, port: u16, suffix: HostSuffix) -> Ipv6Addr {
    let network = u128::from(prefix) & !u128::from(u64::MAX);
    let port_bits = u128::from(port_field(port)) << 48;
    let host_bits = u128::from(suffix.bits() & HOST_BITS_MASK);
    Ipv6Addr::from(network | port_bits | host_bits)
}
