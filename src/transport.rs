//! Framed TCP transport.
//!
//! Every item on a connection starts with a one-byte tag: `MESSAGE_TAG`
//! announces a control frame read as a single chunk of up to 2048 bytes;
//! `STREAM_TAG` announces raw bytes whose length only the upper layer
//! knows. On a stream tag the read loop hands the socket over and parks
//! until the consumer calls `close_stream`, so stream payload bytes are
//! never misread as frame tags.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, Notify, Semaphore};

use crate::MAX_MESSAGE_SIZE;

pub const MESSAGE_TAG: u8 = 0x01;
pub const STREAM_TAG: u8 = 0x02;

const RPC_CHANNEL_CAPACITY: usize = 1024;

/// One decoded item from a connection, delivered on the consumer channel.
/// For a stream the payload is empty: the bytes stay on the socket for
/// whichever handler drains them.
#[derive(Debug, Clone)]
pub struct Rpc {
    pub from: SocketAddr,
    pub payload: Vec<u8>,
    pub stream: bool,
}

/// Validates a freshly accepted or dialed connection before it is
/// registered. The default does nothing.
pub type HandshakeFn = fn(&TcpPeer) -> io::Result<()>;

pub fn noop_handshake(_peer: &TcpPeer) -> io::Result<()> {
    Ok(())
}

type OnPeerFn = Arc<dyn Fn(TcpPeer) + Send + Sync>;
type OnPeerCloseFn = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// A live connection handle. Cloneable; all clones share the socket.
///
/// The transport read loop is the exclusive reader except while it is
/// parked on the stream handshake, during which exactly one consumer may
/// take `lock_reader` and must finish with `close_stream`.
#[derive(Clone)]
pub struct TcpPeer {
    addr: SocketAddr,
    outbound: bool,
    reader: Arc<AsyncMutex<OwnedReadHalf>>,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    // One permit per stream tag consumed by the read loop; holders of a
    // permit own the socket until they signal stream_done.
    stream_open: Arc<Semaphore>,
    stream_done: Arc<Notify>,
}

impl TcpPeer {
    fn new(stream: TcpStream, outbound: bool) -> io::Result<Self> {
        let addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(TcpPeer {
            addr,
            outbound,
            reader: Arc::new(AsyncMutex::new(reader)),
            writer: Arc::new(AsyncMutex::new(writer)),
            stream_open: Arc::new(Semaphore::new(0)),
            stream_done: Arc::new(Notify::new()),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Writes one frame (tag plus payload) atomically with respect to
    /// other writers on this connection.
    pub async fn send(&self, frame: &[u8]) -> io::Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(frame).await?;
        w.flush().await
    }

    /// Writes a stream frame carrying `payload` raw bytes.
    pub async fn send_stream_bytes(&self, payload: &[u8]) -> io::Result<()> {
        let mut w = self.writer.lock().await;
        w.write_u8(STREAM_TAG).await?;
        w.write_all(payload).await?;
        w.flush().await
    }

    /// Writes a stream frame of `[size as u64-LE][contents of r]`, the
    /// shape of a get-file response. Returns the bytes copied from `r`.
    pub async fn send_stream_from<R>(&self, size: u64, r: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut w = self.writer.lock().await;
        w.write_u8(STREAM_TAG).await?;
        w.write_u64_le(size).await?;
        let n = tokio::io::copy(r, &mut *w).await?;
        w.flush().await?;
        Ok(n)
    }

    /// Waits until the read loop has consumed a stream tag on this
    /// connection and parked. The caller then owns the socket and must
    /// call `close_stream` exactly once. Errors when the connection dies
    /// before a stream arrives.
    pub async fn stream_ready(&self) -> io::Result<()> {
        match self.stream_open.acquire().await {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed before the stream arrived",
            )),
        }
    }

    /// Non-blocking variant of `stream_ready`: claims a pending inbound
    /// stream if one exists.
    pub fn stream_pending(&self) -> bool {
        match self.stream_open.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Exclusive access to the socket's read half. Only valid while the
    /// read loop is parked (after `stream_ready` / `stream_pending`).
    pub async fn lock_reader(&self) -> MutexGuard<'_, OwnedReadHalf> {
        self.reader.lock().await
    }

    /// Releases the read loop after an inbound stream has been fully
    /// consumed. Must be called exactly once per stream.
    pub fn close_stream(&self) {
        self.stream_done.notify_one();
    }

    /// Shuts down the write side; the remote observes EOF and its read
    /// loop terminates.
    pub async fn close(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

pub struct TcpTransportOpts {
    pub listen_addr: String,
    pub handshake: HandshakeFn,
}

/// Listens for inbound connections, dials outbound ones, and runs a read
/// loop per connection. Decoded frames from every connection funnel into
/// one consumer channel.
pub struct TcpTransport {
    opts: TcpTransportOpts,
    rpc_tx: Sender<Rpc>,
    rpc_rx: Mutex<Option<Receiver<Rpc>>>,
    on_peer: Mutex<Option<OnPeerFn>>,
    on_peer_close: Mutex<Option<OnPeerCloseFn>>,
    shutdown: Notify,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Arc<Self> {
        let (rpc_tx, rpc_rx) = mpsc::channel(RPC_CHANNEL_CAPACITY);
        Arc::new(TcpTransport {
            opts,
            rpc_tx,
            rpc_rx: Mutex::new(Some(rpc_rx)),
            on_peer: Mutex::new(None),
            on_peer_close: Mutex::new(None),
            shutdown: Notify::new(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.opts.listen_addr
    }

    /// Registers the callback invoked with every connection that survives
    /// the handshake, inbound and outbound alike.
    pub fn set_on_peer<F>(&self, f: F)
    where
        F: Fn(TcpPeer) + Send + Sync + 'static,
    {
        *self.on_peer.lock().unwrap() = Some(Arc::new(f));
    }

    /// Registers the callback invoked when a connection's read loop
    /// terminates.
    pub fn set_on_peer_close<F>(&self, f: F)
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        *self.on_peer_close.lock().unwrap() = Some(Arc::new(f));
    }

    /// Hands out the sole consumer end of the rpc channel. Returns `None`
    /// on every call after the first.
    pub fn consume(&self) -> Option<Receiver<Rpc>> {
        self.rpc_rx.lock().unwrap().take()
    }

    /// Binds the listen address and spawns the accept loop. Returns the
    /// bound address (useful when listening on port 0).
    pub async fn listen_and_accept(self: &Arc<Self>) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.opts.listen_addr).await?;
        let local = listener.local_addr()?;
        info!("transport listening on {local}");
        let transport = Arc::clone(self);
        tokio::spawn(async move { transport.accept_loop(listener).await });
        Ok(local)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, addr)) => {
                        debug!("inbound connection from {addr}");
                        let transport = Arc::clone(&self);
                        tokio::spawn(async move { transport.handle_conn(stream, false).await });
                    }
                    Err(e) => {
                        error!("accept error: {e}");
                    }
                },
                _ = self.shutdown.notified() => {
                    debug!("accept loop shutting down");
                    return;
                }
            }
        }
    }

    /// Connects to `addr` and spawns the same handshake and read-loop
    /// machinery used for inbound connections.
    pub async fn dial(self: &Arc<Self>, addr: &str) -> io::Result<()> {
        let stream = TcpStream::connect(addr).await?;
        debug!("dialed {addr}");
        let transport = Arc::clone(self);
        tokio::spawn(async move { transport.handle_conn(stream, true).await });
        Ok(())
    }

    /// Stops the accept loop. Established connections terminate when
    /// their sockets close.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, outbound: bool) {
        let peer = match TcpPeer::new(stream, outbound) {
            Ok(p) => p,
            Err(e) => {
                error!("failed to set up connection: {e}");
                return;
            }
        };
        let addr = peer.remote_addr();

        if let Err(e) = (self.opts.handshake)(&peer) {
            error!("handshake with {addr} failed: {e}");
            let _ = peer.close().await;
            return;
        }

        let on_peer = self.on_peer.lock().unwrap().clone();
        if let Some(cb) = on_peer {
            cb(peer.clone());
        }

        if let Err(e) = self.read_loop(&peer).await {
            error!("read error on {addr}: {e}");
        }
        // Unblock anyone waiting on a stream from this connection
        peer.stream_open.close();
        debug!("connection closed: {addr}");

        let on_close = self.on_peer_close.lock().unwrap().clone();
        if let Some(cb) = on_close {
            cb(addr);
        }
    }

    async fn read_loop(&self, peer: &TcpPeer) -> io::Result<()> {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        loop {
            let mut r = peer.reader.lock().await;
            let tag = match r.read_u8().await {
                Ok(tag) => tag,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };

            if tag == STREAM_TAG {
                // Hand the socket over: park until the consumer is done.
                drop(r);
                peer.stream_open.add_permits(1);
                let rpc = Rpc {
                    from: peer.remote_addr(),
                    payload: Vec::new(),
                    stream: true,
                };
                if self.rpc_tx.send(rpc).await.is_err() {
                    return Ok(());
                }
                peer.stream_done.notified().await;
                continue;
            }

            // Anything else opens a control frame: one read of up to
            // MAX_MESSAGE_SIZE bytes is the whole payload.
            let n = r.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            drop(r);
            let rpc = Rpc {
                from: peer.remote_addr(),
                payload: buf[..n].to_vec(),
                stream: false,
            };
            if self.rpc_tx.send(rpc).await.is_err() {
                return Ok(());
            }
        }
    }
}
