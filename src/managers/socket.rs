//! The socket multiplexer: hands out sockets registered with the task scheduler's reactor,
//! enforcing a ceiling on the number open at once.
use super::task::TaskManager;
use crate::error::Error;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::runtime::Handle;

const LISTEN_BACKLOG: i32 = 1024;

#[derive(Clone, Debug)]
pub struct SocketManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    handle: Handle,
    max_sockets: usize,
    max_udp: Option<u16>,
    opened: AtomicUsize,
}

impl SocketManager {
    /// Without an explicit ceiling the soft open-files limit is used.
    pub(super) fn create(
        tasks: &TaskManager,
        max_sockets: Option<usize>,
        max_udp: Option<u16>,
    ) -> Result<Self, Error> {
        let max_sockets = match max_sockets {
            Some(0) => return Err(Error::InvalidConfig("socket ceiling of zero".into())),
            Some(n) => n,
            None => {
                let (soft, _) = rlimit::getrlimit(rlimit::Resource::NOFILE)?;
                usize::try_from(soft).unwrap_or(usize::MAX)
            }
        };
        Ok(Self {
            inner: Arc::new(Inner {
                handle: tasks.handle().clone(),
                max_sockets,
                max_udp,
                opened: AtomicUsize::new(0),
            }),
        })
    }

    #[must_use]
    pub fn max_sockets(&self) -> usize {
        self.inner.max_sockets
    }

    /// Override for the largest UDP payload, if one was configured.
    #[must_use]
    pub fn max_udp(&self) -> Option<u16> {
        self.inner.max_udp
    }

    /// Sockets handed out and not yet released.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Bind a UDP socket. With `reuse_port` several sockets may share one address so the kernel
    /// spreads datagrams across listeners.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SocketCeiling`] when the ceiling is reached and [`Error::IO`] when the
    /// socket can't be created or bound.
    pub fn bind_udp(
        &self,
        addr: SocketAddr,
        reuse_port: bool,
    ) -> Result<Registered<UdpSocket>, Error> {
        let slot = self.reserve()?;
        let sock = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if addr.is_ipv6() {
            sock.set_only_v6(true)?;
        }
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        if reuse_port {
            sock.set_reuse_port(true)?;
        }
        #[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
        let _ = reuse_port;
        sock.set_nonblocking(true)?;
        sock.bind(&addr.into())?;
        let _guard = self.inner.handle.enter();
        Ok(Registered {
            socket: UdpSocket::from_std(sock.into())?,
            slot,
        })
    }

    /// Bind a listening TCP socket.
    ///
    /// # Errors
    ///
    /// As for [`SocketManager::bind_udp`].
    pub fn bind_tcp(&self, addr: SocketAddr) -> Result<Registered<TcpListener>, Error> {
        let slot = self.reserve()?;
        let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if addr.is_ipv6() {
            sock.set_only_v6(true)?;
        }
        sock.set_reuse_address(true)?;
        sock.set_nonblocking(true)?;
        sock.bind(&addr.into())?;
        sock.listen(LISTEN_BACKLOG)?;
        let _guard = self.inner.handle.enter();
        Ok(Registered {
            socket: TcpListener::from_std(sock.into())?,
            slot,
        })
    }

    // A failed bind drops the slot again on the way out.
    fn reserve(&self) -> Result<SocketSlot, Error> {
        let max = self.inner.max_sockets;
        self.inner
            .opened
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .map(|_| SocketSlot {
                inner: Arc::clone(&self.inner),
            })
            .map_err(|_| Error::SocketCeiling(max))
    }

    pub(super) fn destroy(self) {
        tracing::debug!(opened = self.opened(), "socket manager destroyed");
    }
}

/// One place under the socket ceiling, given back when dropped.
#[derive(Debug)]
pub struct SocketSlot {
    inner: Arc<Inner>,
}

impl Drop for SocketSlot {
    fn drop(&mut self) {
        self.inner.opened.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A socket handed out by the [`SocketManager`]. Its place under the ceiling is held until the
/// slot is dropped; keep the slot alongside the socket when splitting them with
/// [`Registered::into_parts`].
#[derive(Debug)]
pub struct Registered<T> {
    socket: T,
    slot: SocketSlot,
}

impl<T> Registered<T> {
    #[must_use]
    pub fn into_parts(self) -> (T, SocketSlot) {
        (self.socket, self.slot)
    }
}

impl<T> Deref for Registered<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_is_enforced() {
        let tasks = TaskManager::create(1).unwrap();
        let sockets = SocketManager::create(&tasks, Some(2), Some(1232)).unwrap();
        assert_eq!(sockets.max_udp(), Some(1232));

        let udp = sockets.bind_udp("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let tcp = sockets.bind_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(udp.local_addr().unwrap().port() > 0);
        assert!(tcp.local_addr().unwrap().port() > 0);
        assert!(matches!(
            sockets.bind_udp("127.0.0.1:0".parse().unwrap(), false),
            Err(Error::SocketCeiling(2))
        ));
        assert_eq!(sockets.opened(), 2);
        drop((udp, tcp));
        assert_eq!(sockets.opened(), 0);
        sockets.destroy();
        tasks.destroy();
    }

    #[test]
    fn closed_sockets_release_their_slot() {
        let tasks = TaskManager::create(1).unwrap();
        let sockets = SocketManager::create(&tasks, Some(1), None).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let first = sockets.bind_udp(addr, false).unwrap();
        assert!(sockets.bind_tcp(addr).is_err());
        let (socket, slot) = first.into_parts();
        drop(socket);
        assert_eq!(sockets.opened(), 1);
        drop(slot);
        assert_eq!(sockets.opened(), 0);

        let second = sockets.bind_tcp(addr).unwrap();
        assert_eq!(sockets.opened(), 1);
        drop(second);
        assert_eq!(sockets.opened(), 0);
        sockets.destroy();
        tasks.destroy();
    }

    #[test]
    fn failed_bind_does_not_hold_a_slot() {
        let tasks = TaskManager::create(1).unwrap();
        let sockets = SocketManager::create(&tasks, Some(4), None).unwrap();
        let held = sockets.bind_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
        let taken = held.local_addr().unwrap();

        assert!(matches!(sockets.bind_tcp(taken), Err(Error::IO(_))));
        assert_eq!(sockets.opened(), 1);
        drop(held);
        sockets.destroy();
        tasks.destroy();
    }

    #[test]
    fn default_ceiling_comes_from_rlimit() {
        let tasks = TaskManager::create(1).unwrap();
        let sockets = SocketManager::create(&tasks, None, None).unwrap();
        assert!(sockets.max_sockets() > 0);
        assert!(SocketManager::create(&tasks, Some(0), None).is_err());
        tasks.destroy();
    }
}
