//! Content digests used to decide whether an incoming file matches the one already stored.
//!
//! The digest is a 128-bit MD5 and is only ever compared for equality, it is not a security
//! control.

use md5::Digest as _;
use tokio::io::AsyncReadExt;
use tracing::instrument;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Digest([u8; 16]);

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Digest({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Digest {
    // callers pass MD5 output, which is always 16 bytes
    fn from_output(raw: &[u8]) -> Self {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(raw);
        Digest(bytes)
    }
}

pub fn digest_bytes(data: &[u8]) -> Digest {
    Digest::from_output(md5::Md5::digest(data).as_slice())
}

/// Hashes a file on disk without loading it into memory at once.
#[instrument]
pub async fn digest_file(path: &std::path::Path) -> std::io::Result<Digest> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = md5::Md5::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Digest::from_output(hasher.finalize().as_slice()))
}
