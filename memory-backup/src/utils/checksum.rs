//! SHA-256 digests for artifacts and manifests.

use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

const CHUNK_SIZE: usize = 64 * 1024;

/// Hex digest of the file's on-disk bytes, read in fixed-size chunks.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn sha256_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}
