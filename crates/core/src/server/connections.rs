//! Live-connection bookkeeping so a server can be torn down without waiting
//! for keep-alive clients.

use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::serve::Listener;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

#[derive(Default)]
struct ConnectionMap {
    next_serial: u64,
    live: HashMap<SocketAddr, (u64, std::net::TcpStream)>,
}

/// Sockets currently open on a server, keyed by remote endpoint.
#[derive(Clone, Default)]
pub struct ConnectionSet {
    inner: Arc<Mutex<ConnectionMap>>,
}

impl ConnectionSet {
    fn lock(&self) -> MutexGuard<'_, ConnectionMap> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, peer: SocketAddr, handle: std::net::TcpStream) -> ConnectionGuard {
        let mut map = self.lock();
        map.next_serial += 1;
        let serial = map.next_serial;
        map.live.insert(peer, (serial, handle));
        ConnectionGuard {
            set: self.clone(),
            peer,
            serial,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shuts down both directions of every tracked socket. Entries leave the
    /// set once the server drops the corresponding stream.
    pub fn destroy_all(&self) -> usize {
        let map = self.lock();
        for (peer, (_, handle)) in &map.live {
            if let Err(err) = handle.shutdown(Shutdown::Both) {
                if err.kind() != io::ErrorKind::NotConnected {
                    debug!(%peer, error = %err, "Failed to shut down connection");
                }
            }
        }
        map.live.len()
    }
}

/// Removes its entry on drop, unless a newer connection from the same peer
/// already replaced it.
struct ConnectionGuard {
    set: ConnectionSet,
    peer: SocketAddr,
    serial: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut map = self.set.lock();
        if map
            .live
            .get(&self.peer)
            .is_some_and(|(serial, _)| *serial == self.serial)
        {
            map.live.remove(&self.peer);
        }
    }
}

/// Accepted stream that stays registered in its [`ConnectionSet`] while alive.
pub struct TrackedStream {
    inner: TcpStream,
    _guard: ConnectionGuard,
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// [`TcpListener`] that registers every accepted socket in a [`ConnectionSet`].
pub struct TrackedListener {
    inner: TcpListener,
    connections: ConnectionSet,
}

impl TrackedListener {
    pub fn new(inner: TcpListener, connections: ConnectionSet) -> Self {
        Self { inner, connections }
    }

    fn track(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<TrackedStream> {
        let std_stream = stream.into_std()?;
        let handle = std_stream.try_clone()?;
        let inner = TcpStream::from_std(std_stream)?;
        let _guard = self.connections.insert(peer, handle);
        Ok(TrackedStream { inner, _guard })
    }
}

impl Listener for TrackedListener {
    type Io = TrackedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, peer)) => match self.track(stream, peer) {
                    Ok(tracked) => return (tracked, peer),
                    Err(err) => debug!(%peer, error = %err, "Dropping connection that could not be tracked"),
                },
                Err(err) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    error!(error = %err, "Accept failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}
