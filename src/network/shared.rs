//! Process-wide network I/O resources
//!
//! [`SharedIo`] owns two thread pools: the accept ("boss") pool runs listener
//! accept loops, the I/O ("worker") pool runs every connection, outbound link
//! and datagram loop. All roles share both pools; no role gets a private one.
//!
//! Roles never see `SharedIo` directly. They receive only the capabilities
//! they declared: [`AcceptFactory`], [`ConnectFactory`], [`DatagramFactory`].
//! Each factory call returns a [`Channel`] the role closes on `stop`.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::IoConfig;

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs one accepted connection on the I/O pool.
pub type StreamHandler = Arc<dyn Fn(TcpStream, SocketAddr) -> BoxFuture + Send + Sync>;

/// Runs one established outbound link on the I/O pool.
pub type LinkHandler = Arc<dyn Fn(TcpStream) -> BoxFuture + Send + Sync>;

/// Runs the receive loop of a bound datagram socket on the I/O pool.
pub type DatagramHandler = Box<dyn FnOnce(Arc<UdpSocket>) -> BoxFuture + Send>;

/// Inbound TCP: bind a listener and hand each connection to a handler.
pub trait AcceptFactory: Send + Sync {
    fn listen(&self, addr: SocketAddr, handler: StreamHandler) -> io::Result<Channel>;
}

/// Outbound TCP: keep a link to `addr` up, reconnecting every `retry`.
pub trait ConnectFactory: Send + Sync {
    fn dial(&self, addr: SocketAddr, retry: Duration, handler: LinkHandler) -> Channel;
}

/// UDP: bind a socket and run a handler over it.
pub trait DatagramFactory: Send + Sync {
    fn bind_datagram(&self, addr: SocketAddr, handler: DatagramHandler) -> io::Result<Channel>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Accept,
    Connect,
    Datagram,
}

/// A running accept loop, outbound link or datagram loop.
///
/// [`Channel::close`] blocks until the loop and all of its connection tasks
/// are gone. Dropping the channel signals the loop without waiting.
#[derive(Debug)]
pub struct Channel {
    kind: ChannelKind,
    local_addr: Option<SocketAddr>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
    handle: Handle,
}

impl Channel {
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Bound address (accept and datagram channels only).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop the loop and wait for it. Must not be called from an async context.
    pub fn close(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.block_on(self.task) {
            if e.is_panic() {
                tracing::error!("[io] [channel_panicked] kind={:?} addr={:?}", self.kind, self.local_addr);
            }
        }
    }
}

/// The two shared pools and the three factories built on them.
pub struct SharedIo {
    accept: Runtime,
    io: Runtime,
    shutdown_timeout: Duration,
}

impl SharedIo {
    pub fn new(config: &IoConfig) -> io::Result<Self> {
        let accept = Builder::new_multi_thread()
            .worker_threads(config.accept_threads)
            .thread_name("triad-accept")
            .enable_all()
            .build()?;
        let io = Builder::new_multi_thread()
            .worker_threads(config.io_threads)
            .thread_name("triad-io")
            .enable_all()
            .build()?;
        tracing::info!(
            "[io] [pools_ready] accept_threads={} io_threads={}",
            config.accept_threads,
            config.io_threads
        );
        Ok(Self {
            accept,
            io,
            shutdown_timeout: config.shutdown_timeout(),
        })
    }

    /// Handle to the I/O pool (signal waiting, supervision tasks).
    pub fn io_handle(&self) -> &Handle {
        self.io.handle()
    }

    /// Shut both pools down. Call only once every role has stopped.
    pub fn shutdown(self) {
        let timeout = self.shutdown_timeout;
        self.accept.shutdown_timeout(timeout);
        self.io.shutdown_timeout(timeout);
        tracing::info!("[io] [pools_closed]");
    }
}

impl std::fmt::Debug for SharedIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedIo")
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

impl AcceptFactory for SharedIo {
    fn listen(&self, addr: SocketAddr, handler: StreamHandler) -> io::Result<Channel> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let listener = {
            let _guard = self.accept.enter();
            TcpListener::from_std(std_listener)?
        };

        let (tx, rx) = broadcast::channel(1);
        let task = self.accept.spawn(accept_loop(
            listener,
            self.io.handle().clone(),
            handler,
            rx,
        ));
        tracing::debug!("[io] [listen] addr={}", local_addr);

        Ok(Channel {
            kind: ChannelKind::Accept,
            local_addr: Some(local_addr),
            shutdown: tx,
            task,
            handle: self.accept.handle().clone(),
        })
    }
}

impl ConnectFactory for SharedIo {
    fn dial(&self, addr: SocketAddr, retry: Duration, handler: LinkHandler) -> Channel {
        let (tx, rx) = broadcast::channel(1);
        let task = self.io.spawn(dial_loop(addr, retry, handler, rx));
        Channel {
            kind: ChannelKind::Connect,
            local_addr: None,
            shutdown: tx,
            task,
            handle: self.io.handle().clone(),
        }
    }
}

impl DatagramFactory for SharedIo {
    fn bind_datagram(&self, addr: SocketAddr, handler: DatagramHandler) -> io::Result<Channel> {
        let std_socket = std::net::UdpSocket::bind(addr)?;
        std_socket.set_nonblocking(true)?;
        let local_addr = std_socket.local_addr()?;

        let socket = {
            let _guard = self.io.enter();
            Arc::new(UdpSocket::from_std(std_socket)?)
        };

        let (tx, mut rx) = broadcast::channel(1);
        let task = self.io.spawn(async move {
            tokio::select! {
                _ = rx.recv() => {}
                _ = handler(socket) => {}
            }
        });
        tracing::debug!("[io] [bind_datagram] addr={}", local_addr);

        Ok(Channel {
            kind: ChannelKind::Datagram,
            local_addr: Some(local_addr),
            shutdown: tx,
            task,
            handle: self.io.handle().clone(),
        })
    }
}

/// Accepts on the accept pool, re-registers each stream with the I/O pool
/// and runs its handler there.
async fn accept_loop(
    listener: TcpListener,
    io: Handle,
    handler: StreamHandler,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let std_stream = match stream.into_std() {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!("[io] [accept_detach_failed] peer={} err={}", peer, e);
                            continue;
                        }
                    };
                    let handler = Arc::clone(&handler);
                    conns.spawn_on(
                        async move {
                            match TcpStream::from_std(std_stream) {
                                Ok(stream) => handler(stream, peer).await,
                                Err(e) => tracing::warn!("[io] [accept_attach_failed] peer={} err={}", peer, e),
                            }
                        },
                        &io,
                    );
                }
                Err(e) => {
                    tracing::warn!("[io] [accept_failed] err={}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }
    drop(listener);
    conns.shutdown().await;
}

async fn dial_loop(
    addr: SocketAddr,
    retry: Duration,
    handler: LinkHandler,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let connected = tokio::select! {
            _ = shutdown.recv() => return,
            res = TcpStream::connect(addr) => res,
        };
        match connected {
            Ok(stream) => {
                tracing::debug!("[io] [dial_connected] addr={}", addr);
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = handler(stream) => {}
                }
                tracing::debug!("[io] [dial_link_ended] addr={}", addr);
            }
            Err(e) => tracing::debug!("[io] [dial_failed] addr={} err={}", addr, e),
        }
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(retry) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_io() -> SharedIo {
        SharedIo::new(&IoConfig {
            accept_threads: 1,
            io_threads: 2,
            shutdown_timeout_ms: 1000,
        })
        .unwrap()
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_listen_runs_handler_on_io_pool() {
        let io = small_io();
        let handler: StreamHandler = Arc::new(|mut stream, _peer| {
            Box::pin(async move {
                use tokio::io::AsyncWriteExt;
                let name = std::thread::current().name().unwrap_or("").to_string();
                let _ = stream.write_all(name.as_bytes()).await;
            })
        });
        let channel = io.listen(loopback(), handler).unwrap();
        assert_eq!(channel.kind(), ChannelKind::Accept);

        let mut client = std::net::TcpStream::connect(channel.local_addr().unwrap()).unwrap();
        let mut name = String::new();
        client.read_to_string(&mut name).unwrap();
        assert!(name.starts_with("triad-io"), "handler ran on {:?}", name);

        channel.close();
        io.shutdown();
    }

    #[test]
    fn test_close_releases_listener_and_connections() {
        let io = small_io();
        let handler: StreamHandler = Arc::new(|stream, _peer| {
            Box::pin(async move {
                // Hold the connection open until aborted.
                let _stream = stream;
                std::future::pending::<()>().await;
            })
        });
        let channel = io.listen(loopback(), handler).unwrap();
        let addr = channel.local_addr().unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        channel.close();

        // The aborted handler drops its stream: the client sees EOF.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert!(std::net::TcpStream::connect(addr).is_err());
        io.shutdown();
    }

    #[test]
    fn test_dial_reconnects_after_link_ends() {
        let io = small_io();
        let server = std::net::TcpListener::bind(loopback()).unwrap();
        let addr = server.local_addr().unwrap();

        let links = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&links);
        let handler: LinkHandler = Arc::new(move |mut stream| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                use tokio::io::AsyncWriteExt;
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = stream.write_all(b"x").await;
            })
        });
        let channel = io.dial(addr, Duration::from_millis(20), handler);
        assert_eq!(channel.kind(), ChannelKind::Connect);
        assert_eq!(channel.local_addr(), None);

        for _ in 0..2 {
            let (mut conn, _) = server.accept().unwrap();
            let mut buf = [0u8; 1];
            conn.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"x");
        }
        channel.close();
        assert!(links.load(Ordering::SeqCst) >= 2);
        io.shutdown();
    }

    #[test]
    fn test_datagram_channel() {
        let io = small_io();
        let handler: DatagramHandler = Box::new(|socket| {
            Box::pin(async move {
                let mut buf = [0u8; 64];
                while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                    let _ = socket.send_to(&buf[..n], from).await;
                }
            })
        });
        let channel = io.bind_datagram(loopback(), handler).unwrap();
        let addr = channel.local_addr().unwrap();

        let client = std::net::UdpSocket::bind(loopback()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.send_to(b"ping", addr).unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");

        channel.close();
        std::net::UdpSocket::bind(addr).unwrap();
        io.shutdown();
    }

    #[test]
    fn test_listen_bind_conflict_is_error() {
        let io = small_io();
        let taken = std::net::TcpListener::bind(loopback()).unwrap();
        let handler: StreamHandler = Arc::new(|_stream, _peer| Box::pin(async {}));
        assert!(io.listen(taken.local_addr().unwrap(), handler).is_err());
        io.shutdown();
    }

    #[test]
    fn test_drop_channel_ends_loop() {
        let io = small_io();
        let handler: StreamHandler = Arc::new(|_stream, _peer| Box::pin(async {}));
        let channel = io.listen(loopback(), handler).unwrap();
        let addr = channel.local_addr().unwrap();
        drop(channel);
        let mut rebound = None;
        for _ in 0..50 {
            if let Ok(l) = std::net::TcpListener::bind(addr) {
                rebound = Some(l);
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(rebound.is_some());
        io.shutdown();
    }
}
