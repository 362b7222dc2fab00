// Discovery-and-provision pass.
//
// One pass turns the current set of listening sockets into exposed
// services: every socket bound to `[::]` or `[::1]` gets a name, its own
// address on the uplink, a reverse proxy on that address and a dynamic DNS
// record. An address counts as provisioned once it is configured and its
// proxy is listening, and stays so for the lifetime of the process. Later
// passes only re-issue the DNS records for provisioned addresses and retry
// the ones whose listener could not be bound.

use crate::address::{self, HostSuffix};
use crate::backends::{AddressConfigurator, DynDns, ServiceDiscovery};
use crate::config::Config;
use crate::naming::{self, NameRegistry};
use crate::proxy::{self, Upstream};
use crate::service::{ListeningSocket, ServiceRecord};
use anyhow::{Context, Result, anyhow};
use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

/// A socket together with the record it will be exposed under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedService {
    pub socket: ListeningSocket,
    pub record: ServiceRecord,
}

fn is_skipped(socket: &ListeningSocket, config: &Config) -> bool {
    let Some(base) = socket
        .command
        .as_deref()
        .and_then(|cmd| Path::new(cmd).file_name())
    else {
        return false;
    };
    config
        .skip_commands
        .iter()
        .any(|skip| base == std::ffi::OsStr::new(skip))
}

/// Pick the sockets worth exposing and give each a name and an address.
///
/// Pure: nothing on the host is touched.
pub fn plan_services(sockets: &[ListeningSocket], suffix: HostSuffix, config: &Config) -> Vec<PlannedService> {
    let mut names = NameRegistry::new();
    let mut planned = Vec::new();

    for socket in sockets {
        // A socket on a specific address is assumed to be exposed already
        if !socket.is_wildcard_or_loopback() {
            log::trace!("Skipping {}: bound to a specific address", socket);
            continue;
        }
        if is_skipped(socket, config) {
            log::trace!("Skipping {}: {:?} is excluded", socket, socket.command);
            continue;
        }

        let label = match naming::service_label(socket.command.as_deref(), socket.local_port) {
            Ok(label) => label,
            Err(e) => {
                log::warn!("Skipping {}: {:#}", socket, e);
                continue;
            }
        };

        planned.push(PlannedService {
            record: ServiceRecord {
                name: names.claim(&label),
                proxy_address: address::service_address(config.ula_prefix, socket.local_port, suffix),
                port: socket.local_port,
            },
            socket: socket.clone(),
        });
    }

    planned
}

/// Addresses already configured on the uplink. Never shrinks.
#[derive(Debug, Default)]
pub struct ProvisionedAddressSet {
    addrs: HashSet<Ipv6Addr>,
}

impl ProvisionedAddressSet {
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        self.addrs.contains(addr)
    }

    /// Returns false if the address was already present
    pub fn insert(&mut self, addr: Ipv6Addr) -> bool {
        self.addrs.insert(addr)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }
}

/// Long-running tasks, one per service, joined together
#[derive(Default)]
pub struct TaskGroup {
    tasks: JoinSet<(String, Result<()>)>,
}

impl TaskGroup {
    pub fn spawn<F>(&mut self, name: String, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.spawn(async move { (name, task.await) });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task. Failures are collected into one error once all
    /// tasks are done; one task failing never stops the others.
    pub async fn join_all(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => log::debug!("Proxy for {} stopped", name),
                Ok((name, Err(e))) => {
                    log::error!("Proxy for {} failed: {:#}", name, e);
                    failures.push(format!("{}: {:#}", name, e));
                }
                Err(e) => {
                    log::error!("Proxy task died: {}", e);
                    failures.push(format!("task died: {}", e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "{} proxy task(s) failed: {}",
                failures.len(),
                failures.join("; ")
            ))
        }
    }
}

/// Owns everything that outlives a single pass: provisioned addresses and
/// the proxy tasks serving them
pub struct ProxyOrchestrator<N: DynDns> {
    config: Config,
    discovery: Arc<dyn ServiceDiscovery>,
    configurator: Arc<dyn AddressConfigurator>,
    dyndns: N,
    provisioned: ProvisionedAddressSet,
    tasks: TaskGroup,
    shutdown: watch::Receiver<bool>,
}

impl<N: DynDns> ProxyOrchestrator<N> {
    pub fn new(
        config: Config,
        discovery: Arc<dyn ServiceDiscovery>,
        configurator: Arc<dyn AddressConfigurator>,
        dyndns: N,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            discovery,
            configurator,
            dyndns,
            provisioned: ProvisionedAddressSet::default(),
            tasks: TaskGroup::default(),
            shutdown,
        }
    }

    pub fn provisioned(&self) -> &ProvisionedAddressSet {
        &self.provisioned
    }

    pub fn running_proxies(&self) -> usize {
        self.tasks.len()
    }

    /// Discover sockets and plan the services, touching nothing
    pub async fn plan(&self) -> Result<Vec<PlannedService>> {
        let discovery = self.discovery.clone();
        let (suffix, sockets) = tokio::task::spawn_blocking(move || -> Result<_> {
            let suffix = discovery.host_suffix().context("Failed to determine host suffix")?;
            let sockets = discovery.listening_sockets()?;
            Ok((suffix, sockets))
        })
        .await
        .context("Discovery task failed")??;

        log::debug!("Host suffix {}, {} listening socket(s)", suffix, sockets.len());
        Ok(plan_services(&sockets, suffix, &self.config))
    }

    /// Run one pass and return the services registered in it
    pub async fn provision(&mut self) -> Result<Vec<ServiceRecord>> {
        let planned = self.plan().await?;
        let mut registered = Vec::with_capacity(planned.len());

        for service in planned {
            let PlannedService { socket, record } = service;
            log::info!("  {} {} -> {}", socket, record.name, record.proxy_address);

            if !self.provisioned.contains(&record.proxy_address) {
                self.configure_address(record.proxy_address).await?;

                let bind_addr = SocketAddr::new(IpAddr::V6(record.proxy_address), self.config.listen_port);
                let listener = match TcpListener::bind(bind_addr).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        log::warn!("Cannot listen on {} for {}: {}", bind_addr, record.name, e);
                        continue;
                    }
                };
                self.provisioned.insert(record.proxy_address);
                let upstream = Upstream {
                    target: SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), record.port),
                    source: IpAddr::V6(record.proxy_address),
                };
                self.tasks.spawn(
                    record.name.clone(),
                    proxy::serve(listener, upstream, self.shutdown.clone()),
                );
            }

            self.dyndns
                .set_subname(&record.name, record.proxy_address)
                .await
                .with_context(|| {
                    format!("Failed to register {} -> {}", record.name, record.proxy_address)
                })?;
            registered.push(record);
        }

        log::debug!(
            "{} address(es) provisioned, {} proxies running",
            self.provisioned.len(),
            self.tasks.len()
        );
        Ok(registered)
    }

    async fn configure_address(&self, addr: Ipv6Addr) -> Result<()> {
        let configurator = self.configurator.clone();
        let uplinks = self.config.uplink_interfaces.clone();
        let prefix_len = self.config.address_prefix_len;

        tokio::task::spawn_blocking(move || -> Result<()> {
            let link = configurator.first_existing_link(&uplinks).ok_or_else(|| {
                anyhow!("No uplink interface found (tried {})", uplinks.join(", "))
            })?;
            configurator
                .replace_address(link, addr, prefix_len)
                .with_context(|| format!("Failed to configure {}/{} on {}", addr, prefix_len, link))?;
            log::debug!("Configured {}/{} on {} ({})", addr, prefix_len, link, configurator.name());
            Ok(())
        })
        .await
        .context("Address configuration task failed")?
    }

    /// Wait for all proxy tasks to end
    pub async fn wait(&mut self) -> Result<()> {
        self.tasks.join_all().await
    }

    /// Provision, keep rescanning if configured, then wait for the proxies.
    ///
    /// Rescanning stops when shutdown is signalled.
    pub async fn run(&mut self) -> Result<()> {
        self.provision().await?;

        if let Some(period) = self.config.rescan_interval() {
            let mut shutdown = self.shutdown.clone();
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            while !*shutdown.borrow_and_update() {
                tokio::select! {
                    _ = ticker.tick() => {
                        log::debug!("Rescanning listening sockets");
                        self.provision().await?;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        if self.tasks.is_empty() {
            log::info!("No proxies running");
        }
        self.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn socket(addr: &str, port: u16, command: Option<&str>) -> ListeningSocket {
        let mut socket = ListeningSocket::new(addr.parse().unwrap(), port, u32::from(port));
        socket.command = command.map(str::to_string);
        socket
    }

    fn suffix() -> HostSuffix {
        HostSuffix::new(0xba27_ebff_fe8a_e014)
    }

    fn names(planned: &[PlannedService]) -> Vec<&str> {
        planned.iter().map(|p| p.record.name.as_str()).collect()
    }

    struct FakeDiscovery {
        suffix: Option<HostSuffix>,
        sockets: Vec<ListeningSocket>,
    }

    impl ServiceDiscovery for FakeDiscovery {
        fn host_suffix(&self) -> Result<HostSuffix> {
            self.suffix.ok_or_else(|| anyhow!("no link-local address"))
        }

        fn listening_sockets(&self) -> Result<Vec<ListeningSocket>> {
            Ok(self.sockets.clone())
        }
    }

    #[derive(Default)]
    struct FakeConfigurator {
        links: Vec<&'static str>,
        calls: Mutex<Vec<(String, Ipv6Addr, u8)>>,
    }

    impl AddressConfigurator for FakeConfigurator {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn link_exists(&self, link: &str) -> bool {
            self.links.iter().any(|known| *known == link)
        }

        fn replace_address(&self, link: &str, addr: Ipv6Addr, prefix_len: u8) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((link.to_string(), addr, prefix_len));
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeDns {
        calls: Arc<Mutex<Vec<(String, Ipv6Addr)>>>,
        fail: bool,
    }

    impl DynDns for FakeDns {
        async fn set_subname(&self, label: &str, addr: Ipv6Addr) -> Result<()> {
            if self.fail {
                return Err(anyhow!("router unreachable"));
            }
            self.calls.lock().unwrap().push((label.to_string(), addr));
            Ok(())
        }
    }

    struct Harness {
        orchestrator: ProxyOrchestrator<FakeDns>,
        configurator: Arc<FakeConfigurator>,
        dns: FakeDns,
        shutdown: watch::Sender<bool>,
    }

    fn harness(config: Config, discovery: FakeDiscovery, dns: FakeDns) -> Harness {
        let configurator = Arc::new(FakeConfigurator {
            links: vec!["lan0"],
            ..Default::default()
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let orchestrator = ProxyOrchestrator::new(
            config,
            Arc::new(discovery),
            configurator.clone(),
            dns.clone(),
            shutdown_rx,
        );
        Harness {
            orchestrator,
            configurator,
            dns,
            shutdown,
        }
    }

    /// Prefix `::`, suffix 1 and port 0 derive `::1`, which tests can bind
    fn loopback_config() -> Config {
        Config {
            ula_prefix: Ipv6Addr::UNSPECIFIED,
            listen_port: 0,
            ..Config::default()
        }
    }

    fn ipv6_loopback_available() -> bool {
        std::net::TcpListener::bind("[::1]:0").is_ok()
    }

    #[test]
    fn test_plan_keeps_wildcard_and_loopback_only() {
        let sockets = vec![
            socket("::", 80, Some("/usr/bin/web")),
            socket("::1", 8080, Some("/user/timestamps")),
            socket("2001:db8::1", 22, Some("/usr/sbin/sshd")),
            socket("0.0.0.0", 25, Some("/usr/sbin/smtpd")),
        ];

        let planned = plan_services(&sockets, suffix(), &Config::default());

        assert_eq!(names(&planned), vec!["web", "timestamps"]);
        assert_eq!(
            planned[1].record.proxy_address,
            "fdf5:3606:2a21:0:8080:ebff:fe8a:e014".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(planned[1].record.port, 8080);
    }

    #[test]
    fn test_plan_skips_init() {
        let sockets = vec![
            socket("::", 5353, Some("/sbin/init")),
            socket("::", 9100, Some("/usr/bin/node_exporter")),
        ];

        let planned = plan_services(&sockets, suffix(), &Config::default());

        assert_eq!(names(&planned), vec!["node_exporter"]);
    }

    #[test]
    fn test_plan_same_program_twice() {
        let sockets = vec![
            socket("::", 80, Some("/usr/bin/http")),
            socket("::1", 81, Some("/opt/bin/http")),
        ];

        let planned = plan_services(&sockets, suffix(), &Config::default());

        assert_eq!(names(&planned), vec!["http", "http.2"]);
        assert_ne!(planned[0].record.proxy_address, planned[1].record.proxy_address);
    }

    #[test]
    fn test_plan_unattributed_socket_gets_port_name() {
        let planned = plan_services(&[socket("::", 1313, None)], suffix(), &Config::default());

        assert_eq!(names(&planned), vec!["port-1313"]);
    }

    #[tokio::test]
    async fn test_missing_uplink_is_fatal() {
        let mut h = harness(
            Config {
                uplink_interfaces: vec!["eth0".to_string()],
                ..Config::default()
            },
            FakeDiscovery {
                suffix: Some(suffix()),
                sockets: vec![socket("::", 80, Some("/usr/bin/web"))],
            },
            FakeDns::default(),
        );

        let err = h.orchestrator.provision().await.unwrap_err();

        assert!(format!("{:#}", err).contains("No uplink interface found"));
        assert!(h.dns.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_host_suffix_is_fatal() {
        let mut h = harness(
            Config::default(),
            FakeDiscovery {
                suffix: None,
                sockets: vec![],
            },
            FakeDns::default(),
        );

        assert!(h.orchestrator.provision().await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_skips_only_that_service() {
        if !ipv6_loopback_available() {
            return;
        }
        // Port 0 derives ::1, port 5 an address nobody has configured
        let mut h = harness(
            loopback_config(),
            FakeDiscovery {
                suffix: Some(HostSuffix::new(1)),
                sockets: vec![
                    socket("::", 5, Some("/bin/broken")),
                    socket("::", 0, Some("/bin/ok")),
                ],
            },
            FakeDns::default(),
        );

        let records = h.orchestrator.provision().await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "ok");
        assert_eq!(records[0].proxy_address, Ipv6Addr::LOCALHOST);
        assert_eq!(h.configurator.calls.lock().unwrap().len(), 2);
        assert_eq!(
            *h.dns.calls.lock().unwrap(),
            vec![("ok".to_string(), Ipv6Addr::LOCALHOST)]
        );
        assert_eq!(h.orchestrator.running_proxies(), 1);
        assert_eq!(h.orchestrator.provisioned().len(), 1);
        assert!(h.orchestrator.provisioned().contains(&Ipv6Addr::LOCALHOST));

        h.shutdown.send(true).unwrap();
        h.orchestrator.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_listener_is_retried_next_pass() {
        if !ipv6_loopback_available() {
            return;
        }
        let broken: Ipv6Addr = "::5:0:0:1".parse().unwrap();
        let mut h = harness(
            loopback_config(),
            FakeDiscovery {
                suffix: Some(HostSuffix::new(1)),
                sockets: vec![socket("::", 5, Some("/bin/broken"))],
            },
            FakeDns::default(),
        );

        let first = h.orchestrator.provision().await.unwrap();
        let second = h.orchestrator.provision().await.unwrap();

        assert!(first.is_empty());
        assert!(second.is_empty());
        // Configured again on the second pass, never registered without a proxy
        assert_eq!(
            *h.configurator.calls.lock().unwrap(),
            vec![
                ("lan0".to_string(), broken, 48),
                ("lan0".to_string(), broken, 48),
            ]
        );
        assert!(h.dns.calls.lock().unwrap().is_empty());
        assert!(!h.orchestrator.provisioned().contains(&broken));
        assert_eq!(h.orchestrator.provisioned().len(), 0);
        assert_eq!(h.orchestrator.running_proxies(), 0);
    }

    #[tokio::test]
    async fn test_second_pass_only_reregisters_dns() {
        if !ipv6_loopback_available() {
            return;
        }
        let mut h = harness(
            loopback_config(),
            FakeDiscovery {
                suffix: Some(HostSuffix::new(1)),
                sockets: vec![socket("::1", 0, Some("/user/timestamps"))],
            },
            FakeDns::default(),
        );

        h.orchestrator.provision().await.unwrap();
        h.orchestrator.provision().await.unwrap();

        assert_eq!(
            *h.configurator.calls.lock().unwrap(),
            vec![("lan0".to_string(), Ipv6Addr::LOCALHOST, 48)]
        );
        assert_eq!(h.dns.calls.lock().unwrap().len(), 2);
        assert_eq!(h.orchestrator.provisioned().len(), 1);
        assert_eq!(h.orchestrator.running_proxies(), 1);

        h.shutdown.send(true).unwrap();
        h.orchestrator.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_dns_failure_is_fatal() {
        if !ipv6_loopback_available() {
            return;
        }
        let mut h = harness(
            loopback_config(),
            FakeDiscovery {
                suffix: Some(HostSuffix::new(1)),
                sockets: vec![socket("::", 0, Some("/bin/web"))],
            },
            FakeDns {
                fail: true,
                ..Default::default()
            },
        );

        let err = h.orchestrator.provision().await.unwrap_err();

        assert!(format!("{:#}", err).contains("router unreachable"));
        h.shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        if !ipv6_loopback_available() {
            return;
        }
        let mut h = harness(
            Config {
                rescan_interval_secs: Some(3600),
                ..loopback_config()
            },
            FakeDiscovery {
                suffix: Some(HostSuffix::new(1)),
                sockets: vec![socket("::", 0, Some("/bin/web"))],
            },
            FakeDns::default(),
        );
        let shutdown = h.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.send(true).unwrap();
        });

        h.orchestrator.run().await.unwrap();

        assert_eq!(h.dns.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_task_group_collects_failures_without_cancelling() {
        let finished = Arc::new(AtomicBool::new(false));
        let mut group = TaskGroup::default();

        group.spawn("broken".to_string(), async { Err(anyhow!("listener closed")) });
        group.spawn("fine".to_string(), async { Ok(()) });
        let flag = finished.clone();
        group.spawn("slow".to_string(), async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let err = group.join_all().await.unwrap_err();

        assert!(finished.load(Ordering::SeqCst));
        assert!(err.to_string().contains("broken: listener closed"));
        assert!(err.to_string().starts_with("1 proxy task(s) failed"));
        assert!(group.is_empty());
    }

    #[test]
    fn test_provisioned_set_only_grows() {
        let mut set = ProvisionedAddressSet::default();
        assert!(set.insert(Ipv6Addr::LOCALHOST));
        assert!(!set.insert(Ipv6Addr::LOCALHOST));
        assert!(set.contains(&Ipv6Addr::LOCALHOST));
        assert_eq!(set.len(), 1);
    }
}
