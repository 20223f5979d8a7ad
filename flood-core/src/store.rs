//! Content-addressable store: key -> sharded path on local disk, streaming read/write.

use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::debug;

/// Root directory used when none is configured.
pub const DEFAULT_ROOT: &str = "flood_store";

/// Hex characters per directory segment in the CAS layout.
const BLOCK_SIZE: usize = 5;

/// Derives the on-disk location of a key.
pub type PathTransform = Arc<dyn Fn(&str) -> PathKey + Send + Sync>;

/// Sharded directory path plus filename for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    pub segments: Vec<String>,
    pub filename: String,
}

impl PathKey {
    /// Directory segments joined with `/`.
    pub fn pathname(&self) -> String {
        self.segments.join("/")
    }

    /// Top-level directory created for this key, if any.
    pub fn first_segment(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Directory holding the file, under `root`.
    pub fn dir(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        path.extend(&self.segments);
        path
    }

    /// `root/segment.../filename`.
    pub fn full_path(&self, root: &Path) -> PathBuf {
        self.dir(root).join(&self.filename)
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pathname(), self.filename)
    }
}

/// SHA-1 of the key, hex-encoded, split into 5-char directory segments.
/// Filename is the full digest.
pub fn cas_path_transform(key: &str) -> PathKey {
    shard_digest(format!("{:x}", Sha1::digest(key.as_bytes())))
}

/// Same layout as [`cas_path_transform`] over a SHA-256 digest. Trailing
/// characters that do not fill a whole segment stay in the filename only.
pub fn sha256_path_transform(key: &str) -> PathKey {
    shard_digest(format!("{:x}", Sha256::digest(key.as_bytes())))
}

/// Stores the key verbatim: `root/key/key`. Keys that are not a single plain
/// path component are refused by the store.
pub fn identity_path_transform(key: &str) -> PathKey {
    PathKey {
        segments: vec![key.to_string()],
        filename: key.to_string(),
    }
}

fn is_plain_component(part: &str) -> bool {
    let mut components = Path::new(part).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(c)), None) if c == OsStr::new(part)
    )
}

fn shard_digest(hash: String) -> PathKey {
    let segments = hash
        .as_bytes()
        .chunks_exact(BLOCK_SIZE)
        .map(|block| String::from_utf8_lossy(block).into_owned())
        .collect();
    PathKey {
        segments,
        filename: hash,
    }
}

#[derive(Clone)]
pub struct StoreOptions {
    /// Directory owning every file this store writes.
    pub root: PathBuf,
    pub path_transform: PathTransform,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            path_transform: Arc::new(cas_path_transform),
        }
    }
}

/// Files on local disk addressed by key. Filesystem errors are returned unmodified.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
    path_transform: PathTransform,
}

impl Store {
    pub fn new(opts: StoreOptions) -> Self {
        let root = if opts.root.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_ROOT)
        } else {
            opts.root
        };
        Self {
            root,
            path_transform: opts.path_transform,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_key(&self, key: &str) -> PathKey {
        (self.path_transform)(key)
    }

    /// The key's location, refused with `InvalidInput` unless every segment
    /// and the filename stay a single component under the root.
    fn locate(&self, key: &str) -> io::Result<PathKey> {
        let path_key = self.path_key(key);
        if is_plain_component(&path_key.filename)
            && path_key.segments.iter().all(|s| is_plain_component(s))
        {
            Ok(path_key)
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("key {:?} escapes the store root", key),
            ))
        }
    }

    /// Persist everything `reader` yields under `key`. Returns the byte count.
    pub async fn write<R>(&self, key: &str, reader: R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.write_stream(key, reader).await
    }

    /// Create the key's directories, truncate its file and stream `reader` into it.
    pub async fn write_stream<R>(&self, key: &str, mut reader: R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let path_key = self.locate(key)?;
        fs::create_dir_all(path_key.dir(&self.root)).await?;
        let full_path = path_key.full_path(&self.root);
        let mut file = File::create(&full_path).await?;
        let n = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        debug!(key, bytes = n, path = %full_path.display(), "wrote file");
        Ok(n)
    }

    pub async fn has(&self, key: &str) -> bool {
        match self.locate(key) {
            Ok(path_key) => fs::metadata(path_key.full_path(&self.root)).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Open the key's file for reading. `NotFound` if absent.
    pub async fn read(&self, key: &str) -> io::Result<File> {
        File::open(self.locate(key)?.full_path(&self.root)).await
    }

    /// Remove the key's whole top-level directory. Absent keys are not an error.
    pub async fn delete(&self, key: &str) -> io::Result<()> {
        let path_key = self.locate(key)?;
        let result = match path_key.first_segment() {
            Some(first) => fs::remove_dir_all(self.root.join(first)).await,
            None => fs::remove_file(path_key.full_path(&self.root)).await,
        };
        match result {
            Ok(()) => {
                debug!(key, path = %path_key, "deleted file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove the root directory and everything under it.
    pub async fn clear(&self) -> io::Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
