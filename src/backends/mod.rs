// Backend trait definitions and the kernel-backed discovery

pub mod dyndns;
pub mod interface;
pub mod process;

use crate::address::{self, HostSuffix};
use crate::service::ListeningSocket;
use crate::sock_diag;
use anyhow::{Context, Result};
use std::future::Future;
use std::net::Ipv6Addr;
use std::path::PathBuf;

pub use dyndns::HttpDynDns;
pub use interface::IpCommandConfigurator;

/// Source of the facts one provisioning pass starts from
pub trait ServiceDiscovery: Send + Sync {
    /// This host's interface identifier
    fn host_suffix(&self) -> Result<HostSuffix>;

    /// Listening TCP sockets, attributed to their owning programs where possible
    fn listening_sockets(&self) -> Result<Vec<ListeningSocket>>;
}

/// Puts addresses onto network links
pub trait AddressConfigurator: Send + Sync {
    /// Backend name (e.g., "ip")
    fn name(&self) -> &'static str;

    fn link_exists(&self, link: &str) -> bool;

    /// Add `addr/prefix_len` to `link`, replacing an identical address if
    /// present. Duplicate address detection is skipped so the address can be
    /// bound right away.
    fn replace_address(&self, link: &str, addr: Ipv6Addr, prefix_len: u8) -> Result<()>;

    /// First of `candidates` that exists on this host
    fn first_existing_link<'a>(&self, candidates: &'a [String]) -> Option<&'a str> {
        candidates
            .iter()
            .map(String::as_str)
            .find(|link| self.link_exists(link))
    }
}

/// Dynamic DNS updater
pub trait DynDns: Send + Sync {
    /// Create or update `label` to point at `addr`. Idempotent.
    fn set_subname(&self, label: &str, addr: Ipv6Addr) -> impl Future<Output = Result<()>> + Send;
}

/// Discovery straight from the kernel: sock_diag for sockets, procfs for
/// their owners, link-local addresses for the host suffix
pub struct KernelDiscovery {
    netns: Option<PathBuf>,
    processes: process::ProcfsTable,
}

impl KernelDiscovery {
    /// `netns`: query sockets inside the network namespace at this path
    /// instead of our own. `proc_root`: procfs mount to find their owners in.
    pub fn new(netns: Option<PathBuf>, proc_root: PathBuf) -> Self {
        Self {
            netns,
            processes: process::ProcfsTable::with_root(proc_root),
        }
    }
}

impl ServiceDiscovery for KernelDiscovery {
    fn host_suffix(&self) -> Result<HostSuffix> {
        address::host_suffix()
    }

    fn listening_sockets(&self) -> Result<Vec<ListeningSocket>> {
        let mut sockets = sock_diag::discover_listening_sockets(self.netns.as_deref())
            .context("Failed to query listening sockets")?;
        process::attribute_processes(&mut sockets, &self.processes).with_context(|| {
            format!(
                "Failed to attribute sockets to processes ({})",
                process::ProcessTable::name(&self.processes)
            )
        })?;
        Ok(sockets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sock_diag::SockDiagError;
    use std::net::IpAddr;

    fn own_program_path() -> String {
        std::fs::read("/proc/self/cmdline")
            .map(|raw| {
                let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
                String::from_utf8_lossy(&raw[..end]).into_owned()
            })
            .unwrap()
    }

    struct Links(Vec<&'static str>);

    impl AddressConfigurator for Links {
        fn name(&self) -> &'static str {
            "links"
        }

        fn link_exists(&self, link: &str) -> bool {
            self.0.iter().any(|known| *known == link)
        }

        fn replace_address(&self, _: &str, _: Ipv6Addr, _: u8) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_first_existing_link_keeps_candidate_order() {
        let candidates = vec!["eth0".to_string(), "lan0".to_string()];
        assert_eq!(
            Links(vec!["lan0", "eth0"]).first_existing_link(&candidates),
            Some("eth0")
        );
        assert_eq!(Links(vec!["lan0"]).first_existing_link(&candidates), Some("lan0"));
        assert_eq!(Links(vec!["wlan0"]).first_existing_link(&candidates), None);
    }

    #[test]
    fn test_discovers_own_wildcard_listener() {
        // Hosts without IPv6 cannot run this
        let Ok(listener) = std::net::TcpListener::bind("[::]:0") else {
            return;
        };
        let port = listener.local_addr().unwrap().port();

        let sockets = match sock_diag::discover_listening_sockets(None) {
            Ok(sockets) => sockets,
            // Sandboxes without netlink access
            Err(SockDiagError::Open(_)) => return,
            Err(err) => panic!("sock_diag failed: {}", err),
        };
        let mut sockets: Vec<_> = sockets
            .into_iter()
            .filter(|s| s.local_port == port)
            .collect();
        process::attribute_processes(&mut sockets, &process::ProcfsTable::default()).unwrap();

        assert_eq!(sockets.len(), 1);
        assert_eq!(sockets[0].local_addr, IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        assert_eq!(sockets[0].command.as_deref(), Some(own_program_path().as_str()));
    }

    #[test]
    fn test_unreadable_proc_root_fails_attribution() {
        // Keeps at least one socket around so the process walk runs
        let Ok(_listener) = std::net::TcpListener::bind("[::]:0") else {
            return;
        };
        if matches!(
            sock_diag::discover_listening_sockets(None),
            Err(SockDiagError::Open(_))
        ) {
            return;
        }
        let discovery = KernelDiscovery::new(None, PathBuf::from("/nonexistent-proc-root"));

        let err = discovery.listening_sockets().unwrap_err();

        assert!(format!("{:#}", err).contains("/nonexistent-proc-root"));
    }

    #[test]
    #[ignore = "needs CAP_SYS_ADMIN to create a network namespace"]
    fn test_discovers_listener_in_isolated_namespace() {
        use nix::sched::{CloneFlags, unshare};
        use std::os::fd::AsRawFd;

        let (listener, ns) = std::thread::spawn(|| {
            unshare(CloneFlags::CLONE_NEWNET).unwrap();
            let listener = std::net::TcpListener::bind("[::]:1313").unwrap();
            let ns = std::fs::File::open("/proc/thread-self/ns/net").unwrap();
            (listener, ns)
        })
        .join()
        .unwrap();

        let discovery = KernelDiscovery::new(
            Some(PathBuf::from(format!("/proc/self/fd/{}", ns.as_raw_fd()))),
            PathBuf::from("/proc"),
        );
        let sockets = discovery.listening_sockets().unwrap();

        let mut expected = ListeningSocket::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 1313, 0);
        expected.command = Some(own_program_path());
        assert_eq!(sockets.len(), 1);
        assert_eq!(
            (sockets[0].local_addr, sockets[0].local_port, &sockets[0].command),
            (expected.local_addr, expected.local_port, &expected.command)
        );
        drop(listener);
    }
}
