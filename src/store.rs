use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::crypto::{copy_decrypt, hash_key};
use crate::KEY_SIZE;

/// On-disk location for a key, relative to `{root}/{node_id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    /// Directory segments joined with `/`.
    pub dir: String,
    /// File name inside `dir`.
    pub file: String,
}

impl PathKey {
    /// The first directory segment: the shallowest directory uniquely
    /// attributable to this key. Delete removes it recursively.
    pub fn root_segment(&self) -> &str {
        self.dir.split('/').next().unwrap_or(&self.dir)
    }

    pub fn full_path(&self) -> String {
        format!("{}/{}", self.dir, self.file)
    }
}

pub type PathTransformFn = fn(&str) -> PathKey;

/// Content-addressed layout: the 40-hex-char SHA-1 of the key, chunked
/// into five 8-char directory segments, with the full hash as file name.
pub fn cas_path_transform(key: &str) -> PathKey {
    let hash = hash_key(key);
    let dir = (0..5)
        .map(|i| &hash[i * 8..(i + 1) * 8])
        .collect::<Vec<_>>()
        .join("/");
    PathKey { dir, file: hash }
}

/// Flat layout that uses the key verbatim. Only suitable for trusted keys.
pub fn plain_path_transform(key: &str) -> PathKey {
    PathKey {
        dir: key.to_string(),
        file: key.to_string(),
    }
}

/// A disk-backed blob store, namespaced by node id.
pub struct Store {
    root: PathBuf,
    transform: PathTransformFn,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>, transform: PathTransformFn) -> Self {
        Store {
            root: root.into(),
            transform,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_key(&self, key: &str) -> PathKey {
        (self.transform)(key)
    }

    fn dir_path(&self, id: &str, pk: &PathKey) -> PathBuf {
        self.root.join(id).join(&pk.dir)
    }

    fn file_path(&self, id: &str, pk: &PathKey) -> PathBuf {
        self.dir_path(id, pk).join(&pk.file)
    }

    /// Streams `r` to disk under `(id, key)`, creating the directory tree
    /// as needed. Returns the number of bytes written.
    pub async fn write<R>(&self, id: &str, key: &str, r: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut f = self.create(id, key).await?;
        let n = tokio::io::copy(r, &mut f).await?;
        f.flush().await?;
        debug!("wrote ({n}) bytes to disk: {}", self.file_path(id, &self.path_key(key)).display());
        Ok(n)
    }

    /// Like `write`, but treats `r` as ciphertext: the leading 16 bytes are
    /// the IV and the rest is CTR-mode ciphertext. The plaintext lands on
    /// disk. Returns the number of plaintext bytes written.
    pub async fn write_decrypt<R>(
        &self,
        enc_key: &[u8; KEY_SIZE],
        id: &str,
        key: &str,
        r: &mut R,
    ) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut f = self.create(id, key).await?;
        let n = copy_decrypt(enc_key, r, &mut f).await?;
        debug!("decrypted ({n}) bytes to disk under ({id})");
        Ok(n)
    }

    async fn create(&self, id: &str, key: &str) -> io::Result<File> {
        let pk = self.path_key(key);
        fs::create_dir_all(self.dir_path(id, &pk)).await?;
        File::create(self.file_path(id, &pk)).await
    }

    /// Opens the blob at `(id, key)` and returns its size with a handle
    /// positioned at the start. Missing keys are an `io::Error`.
    pub async fn read(&self, id: &str, key: &str) -> io::Result<(u64, File)> {
        let path = self.file_path(id, &self.path_key(key));
        let size = fs::metadata(&path).await?.len();
        let f = File::open(&path).await?;
        Ok((size, f))
    }

    pub async fn has(&self, id: &str, key: &str) -> bool {
        let path = self.file_path(id, &self.path_key(key));
        fs::metadata(&path).await.is_ok()
    }

    /// Removes the key's first-segment directory recursively. Keys sharing
    /// the first 8 hash characters would be removed together; with a
    /// 160-bit hash that needs a hash collision in practice.
    pub async fn delete(&self, id: &str, key: &str) -> io::Result<()> {
        let pk = self.path_key(key);
        let target = self.root.join(id).join(pk.root_segment());
        match fs::remove_dir_all(&target).await {
            Ok(()) => {
                debug!("deleted ({key}) from disk: {}", target.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Removes the entire storage root. Test support.
    pub async fn clear(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
