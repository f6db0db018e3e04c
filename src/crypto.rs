use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use ctr::Ctr128BE;
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{BLOCK_SIZE, KEY_SIZE, STREAM_CHUNK_SIZE};

type Aes256Ctr = Ctr128BE<Aes256>;

/// Generates a random node id, rendered as 64 lowercase hex characters.
///
/// The id namespaces a node's on-disk tree, so one process may host
/// several logical nodes under the same storage root.
pub fn generate_id() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Hashes a caller-provided key into the 40-char lowercase hex form used
/// on the wire and on disk. The raw key never leaves the node after this.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Returns a fresh random symmetric key for outbound stream encryption.
pub fn new_encryption_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Encrypts `src` into `dst`: a random 16-byte IV first, then the CTR-mode
/// ciphertext in 32 KiB chunks.
///
/// Returns `16 + plaintext_len`. The IV is part of the byte count on
/// purpose: the advertised stream size on the wire is `plaintext + 16`
/// and the receiver limit-reads exactly that many bytes.
pub async fn copy_encrypt<R, W>(
    key: &[u8; KEY_SIZE],
    src: &mut R,
    dst: &mut W,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut iv = [0u8; BLOCK_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    dst.write_all(&iv).await?;

    let mut cipher = Aes256Ctr::new(key.into(), (&iv).into());
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    let mut written = BLOCK_SIZE as u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    dst.flush().await?;
    Ok(written)
}

/// Decrypts `src` into `dst`: consumes the 16-byte IV, then streams the
/// CTR-mode plaintext. Returns the number of plaintext bytes written.
pub async fn copy_decrypt<R, W>(
    key: &[u8; KEY_SIZE],
    src: &mut R,
    dst: &mut W,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut iv = [0u8; BLOCK_SIZE];
    src.read_exact(&mut iv).await?;

    let mut cipher = Aes256Ctr::new(key.into(), (&iv).into());
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    dst.flush().await?;
    Ok(written)
}
