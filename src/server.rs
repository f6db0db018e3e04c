use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::Receiver;
use tokio::sync::Notify;
use tokio::time::sleep;

use crate::crypto::{copy_encrypt, generate_id, hash_key, new_encryption_key};
use crate::message::ControlMessage;
use crate::store::{cas_path_transform, PathTransformFn, Store};
use crate::transport::{Rpc, TcpPeer, TcpTransport, MESSAGE_TAG};
use crate::{BLOCK_SIZE, DEFAULT_STORAGE_FOLDER, KEY_SIZE};

/// Delay between broadcasting a StoreFile frame and streaming its payload,
/// giving every peer's read loop time to return to the tag boundary.
const STORE_SETTLE: Duration = Duration::from_millis(5);
/// Delay between broadcasting a GetFile frame and draining replies.
const GET_SETTLE: Duration = Duration::from_millis(100);

pub struct FileServerOpts {
    /// Node id; generated when `None`.
    pub id: Option<String>,
    /// Symmetric key for outbound stream encryption; generated when `None`.
    pub enc_key: Option<[u8; KEY_SIZE]>,
    pub storage_folder: String,
    pub bootstrap_nodes: Vec<String>,
    pub path_transform: PathTransformFn,
    pub transport: Arc<TcpTransport>,
}

impl FileServerOpts {
    /// Options with a generated identity, the default storage folder and
    /// the content-addressed layout.
    pub fn new(transport: Arc<TcpTransport>) -> Self {
        FileServerOpts {
            id: None,
            enc_key: None,
            storage_folder: DEFAULT_STORAGE_FOLDER.to_string(),
            bootstrap_nodes: Vec::new(),
            path_transform: cas_path_transform,
            transport,
        }
    }
}

/// A file-server node: one disk store, one transport, and the set of
/// currently connected peers. Blobs stored here replicate to every
/// connected peer; blobs this node originated can be fetched back from
/// the network after a local delete.
pub struct FileServer {
    id: String,
    enc_key: [u8; KEY_SIZE],
    storage_folder: String,
    bootstrap_nodes: Vec<String>,
    store: Store,
    transport: Arc<TcpTransport>,
    peers: Mutex<HashMap<String, TcpPeer>>,
    quit: Notify,
}

impl FileServer {
    pub fn new(opts: FileServerOpts) -> Arc<Self> {
        let id = opts.id.unwrap_or_else(generate_id);
        let enc_key = opts.enc_key.unwrap_or_else(new_encryption_key);
        let store = Store::new(&opts.storage_folder, opts.path_transform);
        Arc::new(FileServer {
            id,
            enc_key,
            storage_folder: opts.storage_folder,
            bootstrap_nodes: opts.bootstrap_nodes,
            store,
            transport: opts.transport,
            peers: Mutex::new(HashMap::new()),
            quit: Notify::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store_ref(&self) -> &Store {
        &self.store
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Starts listening, dials the bootstrap nodes, and spawns the
    /// control loop as its own task.
    pub async fn start(self: &Arc<Self>) -> io::Result<()> {
        let rx = self
            .transport
            .consume()
            .ok_or_else(|| io::Error::other("transport consumer already claimed"))?;

        let server = Arc::clone(self);
        self.transport.set_on_peer(move |peer| server.on_peer(peer));
        let server = Arc::clone(self);
        self.transport
            .set_on_peer_close(move |addr| server.on_peer_close(addr));

        let addr = self.transport.listen_and_accept().await?;
        info!("[{}] file server listening on {addr}", self.storage_folder);

        self.bootstrap();

        let server = Arc::clone(self);
        tokio::spawn(server.run(rx));
        Ok(())
    }

    /// Signals the control loop to close the transport and exit.
    pub fn stop(&self) {
        self.quit.notify_one();
    }

    /// Registers a connection that survived the handshake. Invoked by the
    /// transport for inbound and outbound connections alike.
    fn on_peer(&self, peer: TcpPeer) {
        let addr = peer.remote_addr();
        self.peers.lock().unwrap().insert(addr.to_string(), peer);
        info!(
            "[{}] connection established with peer {addr}",
            self.storage_folder
        );
    }

    fn on_peer_close(&self, addr: SocketAddr) {
        if self.peers.lock().unwrap().remove(&addr.to_string()).is_some() {
            debug!("[{}] dropped peer {addr}", self.storage_folder);
        }
    }

    fn bootstrap(&self) {
        for addr in &self.bootstrap_nodes {
            if addr.is_empty() {
                continue;
            }
            let transport = Arc::clone(&self.transport);
            let addr = addr.clone();
            tokio::spawn(async move {
                debug!("attempting to connect to {addr}");
                if let Err(e) = transport.dial(&addr).await {
                    warn!("failed to connect to {addr}: {e}");
                }
            });
        }
    }

    fn connected_peers(&self) -> Vec<TcpPeer> {
        self.peers.lock().unwrap().values().cloned().collect()
    }

    fn peer_named(&self, from: &str) -> io::Result<TcpPeer> {
        self.peers.lock().unwrap().get(from).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("peer {from} is not registered"),
            )
        })
    }

    /// Stores `r` under this node's namespace and, when `replicate` is
    /// set, announces the blob and streams its ciphertext to every
    /// connected peer. Per-peer replication failures are logged, never
    /// fatal. Returns the local byte count.
    pub async fn store<R>(&self, key: &str, mut r: R, replicate: bool) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        // Tee into a replication buffer while writing the plaintext locally
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).await?;
        let size = self.store.write(&self.id, key, &mut buf.as_slice()).await?;
        info!(
            "[{}] stored ({key}) to disk locally, {size} bytes",
            self.storage_folder
        );

        if replicate {
            let msg = ControlMessage::StoreFile {
                server_id: self.id.clone(),
                key_hash: hash_key(key),
                size: size + BLOCK_SIZE as u64,
            };
            self.broadcast(&msg).await?;
            sleep(STORE_SETTLE).await;
            let n = self.stream_to_peers(&buf).await?;
            info!(
                "[{}] streamed ({key}) of {n} bytes to the network",
                self.storage_folder
            );
        }
        Ok(size)
    }

    /// Serves `key` from the local disk, or fetches it back from the
    /// network when this node originated the blob but no longer holds it.
    /// A missing local file after the network pass is the user-visible
    /// not-found.
    pub async fn get(&self, key: &str) -> io::Result<File> {
        if self.store.has(&self.id, key).await {
            debug!(
                "[{}] serving ({key}) from local disk",
                self.storage_folder
            );
            let (_, f) = self.store.read(&self.id, key).await?;
            return Ok(f);
        }

        info!(
            "[{}] ({key}) not found on local disk, searching network",
            self.storage_folder
        );
        let msg = ControlMessage::GetFile {
            server_id: self.id.clone(),
            key_hash: hash_key(key),
        };
        self.broadcast(&msg).await?;
        sleep(GET_SETTLE).await;

        for peer in self.connected_peers() {
            // Peers without the blob never open a stream; skip them after
            // the settle window instead of blocking on their sockets.
            if !peer.stream_pending() {
                debug!("no reply from {}", peer.remote_addr());
                continue;
            }
            let outcome = {
                let mut r = peer.lock_reader().await;
                match r.read_u64_le().await {
                    Ok(size) => {
                        let mut limited = (&mut *r).take(size);
                        self.store
                            .write_decrypt(&self.enc_key, &self.id, key, &mut limited)
                            .await
                    }
                    Err(e) => Err(e),
                }
            };
            peer.close_stream();
            let n = outcome?;
            info!(
                "[{}] received {n} bytes over the network from {}",
                self.storage_folder,
                peer.remote_addr()
            );
        }

        let (_, f) = self.store.read(&self.id, key).await?;
        Ok(f)
    }

    /// Deletes the local copy when present, then tells every peer to drop
    /// theirs. Fire-and-forget: no acknowledgement is awaited.
    pub async fn delete(&self, key: &str) -> io::Result<()> {
        if self.store.has(&self.id, key).await {
            self.store.delete(&self.id, key).await?;
            info!(
                "[{}] deleted ({key}) from local disk",
                self.storage_folder
            );
        }
        let msg = ControlMessage::DeleteFile {
            server_id: self.id.clone(),
            key_hash: hash_key(key),
        };
        self.broadcast(&msg).await
    }

    /// Sends a control frame to every connected peer. Send failures are
    /// logged and skipped.
    async fn broadcast(&self, msg: &ControlMessage) -> io::Result<()> {
        let payload = msg
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut frame = Vec::with_capacity(1 + payload.len());
        frame.push(MESSAGE_TAG);
        frame.extend_from_slice(&payload);

        for peer in self.connected_peers() {
            if let Err(e) = peer.send(&frame).await {
                warn!("broadcast to {} failed: {e}", peer.remote_addr());
            }
        }
        Ok(())
    }

    /// Encrypts `plaintext` once and fans the stream frame out to every
    /// connected peer. A failure on one peer does not abort the others.
    async fn stream_to_peers(&self, plaintext: &[u8]) -> io::Result<u64> {
        let mut ciphertext = Vec::with_capacity(plaintext.len() + BLOCK_SIZE);
        let n = copy_encrypt(&self.enc_key, &mut &plaintext[..], &mut ciphertext).await?;
        for peer in self.connected_peers() {
            if let Err(e) = peer.send_stream_bytes(&ciphertext).await {
                warn!("stream to {} failed: {e}", peer.remote_addr());
            }
        }
        Ok(n)
    }

    /// The control loop: drains the transport's consumer channel until
    /// the quit signal fires, then closes the transport and the peers.
    async fn run(self: Arc<Self>, mut rx: Receiver<Rpc>) {
        loop {
            tokio::select! {
                maybe_rpc = rx.recv() => {
                    let Some(rpc) = maybe_rpc else { break };
                    if rpc.stream {
                        // Stream frames are drained by the handler that
                        // awaits them; nothing to dispatch here.
                        continue;
                    }
                    let msg = match ControlMessage::decode(&rpc.payload) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!("dropping undecodable frame from {}: {e}", rpc.from);
                            continue;
                        }
                    };
                    if let Err(e) = self.handle_message(&rpc.from.to_string(), msg).await {
                        error!("message handler error: {e}");
                    }
                }
                _ = self.quit.notified() => break,
            }
        }

        info!("[{}] file server stopping", self.storage_folder);
        self.transport.close();
        let peers: Vec<TcpPeer> = self.peers.lock().unwrap().drain().map(|(_, p)| p).collect();
        for peer in peers {
            let _ = peer.close().await;
        }
    }

    async fn handle_message(&self, from: &str, msg: ControlMessage) -> io::Result<()> {
        match msg {
            ControlMessage::StoreFile {
                server_id,
                key_hash,
                size,
            } => self.handle_store_file(from, &server_id, &key_hash, size).await,
            ControlMessage::GetFile {
                server_id,
                key_hash,
            } => self.handle_get_file(from, &server_id, &key_hash).await,
            ControlMessage::DeleteFile {
                server_id,
                key_hash,
            } => self.handle_delete_file(from, &server_id, &key_hash).await,
        }
    }

    /// Pulls `size` raw bytes off the announcing peer's socket and stores
    /// them under the origin's namespace. The bytes are ciphertext and
    /// stay ciphertext on disk: a replica cannot read a blob without the
    /// origin's key.
    async fn handle_store_file(
        &self,
        from: &str,
        server_id: &str,
        key_hash: &str,
        size: u64,
    ) -> io::Result<()> {
        debug!(
            "[{}] [store file] request from ({from}) for ({key_hash})",
            self.storage_folder
        );
        let peer = self.peer_named(from)?;

        // Wait for the read loop to reach the stream tag and park
        peer.stream_ready().await?;
        let outcome = {
            let mut r = peer.lock_reader().await;
            let mut limited = (&mut *r).take(size);
            self.store.write(server_id, key_hash, &mut limited).await
        };
        peer.close_stream();
        let n = outcome?;
        info!(
            "[{}] received file of {n} bytes from ({from})",
            self.storage_folder
        );
        Ok(())
    }

    /// Streams the blob back as `[STREAM][size u64-LE][bytes]` when it is
    /// on the local disk; otherwise logs and lets the requester time out.
    async fn handle_get_file(
        &self,
        from: &str,
        server_id: &str,
        key_hash: &str,
    ) -> io::Result<()> {
        debug!(
            "[{}] [get file] request from ({from}) for ({key_hash})",
            self.storage_folder
        );
        if !self.store.has(server_id, key_hash).await {
            info!(
                "[{}] ({key_hash}) requested by ({from}) but not on local disk",
                self.storage_folder
            );
            return Ok(());
        }

        let peer = self.peer_named(from)?;
        let (size, mut f) = self.store.read(server_id, key_hash).await?;
        let n = peer.send_stream_from(size, &mut f).await?;
        info!(
            "[{}] streamed ({key_hash}) of {n} bytes to ({from})",
            self.storage_folder
        );
        Ok(())
    }

    async fn handle_delete_file(
        &self,
        from: &str,
        server_id: &str,
        key_hash: &str,
    ) -> io::Result<()> {
        self.store.delete(server_id, key_hash).await?;
        info!(
            "[{}] deleted ({key_hash}) as requested by ({from})",
            self.storage_folder
        );
        Ok(())
    }
}
