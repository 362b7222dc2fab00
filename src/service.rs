// Service data model shared by discovery and provisioning

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

/// A TCP socket in LISTEN (or CLOSE) state as reported by the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListeningSocket {
    pub local_addr: IpAddr,
    pub local_port: u16,
    /// Socket inode, unique within the kernel's socket table at query time
    pub inode: u32,
    /// Program path of the owning process, if attribution found it
    pub command: Option<String>,
}

impl ListeningSocket {
    pub fn new(local_addr: IpAddr, local_port: u16, inode: u32) -> Self {
        Self {
            local_addr,
            local_port,
            inode,
            command: None,
        }
    }

    /// True for sockets bound to `[::]` or `[::1]`
    pub fn is_wildcard_or_loopback(&self) -> bool {
        match self.local_addr {
            IpAddr::V6(ip) => ip == Ipv6Addr::UNSPECIFIED || ip == Ipv6Addr::LOCALHOST,
            IpAddr::V4(_) => false,
        }
    }
}

impl fmt::Display for ListeningSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local_addr {
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.local_port),
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.local_port),
        }
    }
}

/// A service exposed under its own name and proxy address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub proxy_address: Ipv6Addr,
    pub port: u16,
}
