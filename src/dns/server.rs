use super::handlers::{Handler, Shared};
use super::zone::Zone;
use crate::config::ServerSettings;
use crate::error::Error;
use crate::managers::{Registered, SocketManager, Spawner, TimerManager};
use crate::server::{ServerContext, ServerFactory, ServerOption, ServerResources};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use trust_dns_server::ServerFuture;

/// Builds [`NameServer`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct NameServerFactory;

impl ServerFactory for NameServerFactory {
    fn create(&self, resources: ServerResources<'_>) -> Result<Box<dyn ServerContext>, Error> {
        Ok(Box::new(NameServer::new(resources)?))
    }
}

/// The authoritative name server context.
pub struct NameServer {
    shared: Arc<Shared>,
    settings: ServerSettings,
    config_file: PathBuf,
    spawner: Spawner,
    timer: TimerManager,
    sockets: SocketManager,
    udp_listeners: usize,
    hasher: ahash::RandomState,
    local_addrs: Vec<SocketAddr>,
}

impl NameServer {
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] when the configured addresses don't fit the zone.
    pub fn new(resources: ServerResources<'_>) -> Result<Self, Error> {
        let ServerResources {
            managers,
            config,
            builtin,
            backends,
        } = resources;
        let hasher = managers.hash().build_hasher();
        let zone = Zone::from_settings(&config.server, hasher.clone())?;
        tracing::debug!(domain = %zone.domain, names = zone.len(), "zone loaded");
        let shared = Arc::new(Shared::new(
            zone,
            managers.socket().max_udp(),
            builtin,
            backends,
        ));
        Ok(Self {
            shared,
            settings: config.server.clone(),
            config_file: config.reload_path(),
            spawner: managers.task().spawner(),
            timer: managers.timer().clone(),
            sockets: managers.socket().clone(),
            udp_listeners: managers.settings().udp_listeners,
            hasher,
            local_addrs: Vec::new(),
        })
    }

    /// Addresses bound by [`ServerContext::start`], UDP first.
    #[must_use]
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    fn listen_addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        let no_v4 = self.shared.option(ServerOption::DisableIpv4);
        let no_v6 = self.shared.option(ServerOption::DisableIpv6);
        let port = self.settings.port;
        self.settings
            .listen_addrs
            .iter()
            .filter(move |ip| match ip {
                IpAddr::V4(_) => !no_v4,
                IpAddr::V6(_) => !no_v6,
            })
            .map(move |ip| SocketAddr::new(*ip, port))
    }

    fn bind(&self) -> (Vec<Registered<UdpSocket>>, Vec<Registered<TcpListener>>) {
        let mut udp = Vec::new();
        let mut tcp = Vec::new();
        let reuse_port = self.udp_listeners > 1;
        for addr in self.listen_addrs() {
            let mut addr = addr;
            for _ in 0..self.udp_listeners {
                match self.sockets.bind_udp(addr, reuse_port) {
                    Ok(socket) => {
                        // Port 0 resolves on the first bind; the rest share that port.
                        if let Ok(local) = socket.local_addr() {
                            addr = local;
                        }
                        udp.push(socket);
                    }
                    Err(e) => {
                        tracing::warn!(%addr, "could not listen on UDP: {e}");
                        break;
                    }
                }
            }
            if self.shared.option(ServerOption::NoTcp) {
                continue;
            }
            match self.sockets.bind_tcp(addr) {
                Ok(listener) => tcp.push(listener),
                Err(e) => tracing::warn!(%addr, "could not listen on TCP: {e}"),
            }
        }
        (udp, tcp)
    }
}

impl ServerContext for NameServer {
    fn set_option(&mut self, option: ServerOption, value: bool) {
        tracing::debug!(%option, value, "server option");
        self.shared.set_option(option, value);
    }

    fn set_delay(&mut self, delay: Duration) {
        self.shared.set_delay(delay);
    }

    fn start(&mut self) -> Result<(), Error> {
        let (udp, tcp) = self.bind();
        if udp.is_empty() && tcp.is_empty() {
            return Err(Error::Server("no listening sockets".to_string()));
        }
        self.local_addrs = udp
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .chain(tcp.iter().filter_map(|l| l.local_addr().ok()))
            .collect();
        tracing::info!(
            udp = udp.len(),
            tcp = tcp.len(),
            "listening on {:?}",
            self.local_addrs
        );

        let handler = Handler::new(Arc::clone(&self.shared));
        let tcp_timeout = self.settings.tcp_timeout;
        let shutdown = self.spawner.shutdown_token();
        self.spawner.spawn(async move {
            // The slots go back to the socket manager once the server future is gone.
            let mut slots = Vec::with_capacity(udp.len() + tcp.len());
            let mut server = ServerFuture::new(handler);
            for (socket, slot) in udp.into_iter().map(Registered::into_parts) {
                server.register_socket(socket);
                slots.push(slot);
            }
            for (listener, slot) in tcp.into_iter().map(Registered::into_parts) {
                server.register_listener(listener, tcp_timeout);
                slots.push(slot);
            }
            tokio::select! {
                () = shutdown.cancelled() => tracing::debug!("name server stopping"),
                result = server.block_until_done() => {
                    if let Err(e) = result {
                        tracing::error!("name server failed: {e}");
                    }
                }
            }
        });

        let interval = self.settings.stats_interval;
        if !interval.is_zero() {
            let shared = Arc::clone(&self.shared);
            self.timer.every(interval, move || shared.stats.log());
        }
        Ok(())
    }

    fn request_reload(&self) {
        let shared = Arc::clone(&self.shared);
        let config_file = self.config_file.clone();
        let hasher = self.hasher.clone();
        self.spawner.spawn(async move {
            let zone = ServerSettings::try_from_file(&config_file)
                .and_then(|settings| Zone::from_settings(&settings, hasher));
            match zone {
                Ok(zone) => {
                    let names = zone.len();
                    *shared.zone.write().await = Arc::new(zone);
                    tracing::info!(names, "zone reloaded");
                }
                Err(e) => tracing::error!(
                    "reloading {} failed, keeping the current zone: {e}",
                    config_file.display()
                ),
            }
            for e in shared.backends.reload_all() {
                tracing::warn!("{e}");
            }
        });
    }

    fn destroy(self: Box<Self>) -> Result<(), Error> {
        self.shared.stats.log();
        tracing::debug!("name server destroyed");
        Ok(())
    }
}
