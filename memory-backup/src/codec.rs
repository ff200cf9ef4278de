//! Reversible artifact compression.
//!
//! Artifacts are streamed through an `async-compression` encoder into a
//! sibling file, so memory use stays flat regardless of dump size.

use crate::utils::errors::{CoordinatorError, Result};
use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder, ZstdDecoder, ZstdEncoder};
use async_compression::Level;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWriteExt, BufReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Gzip,
    Zstd,
}

impl Algorithm {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "gzip" | "gz" => Ok(Algorithm::Gzip),
            "zstd" | "zst" => Ok(Algorithm::Zstd),
            other => Err(CoordinatorError::Config(format!(
                "unsupported compression algorithm: {}",
                other
            ))),
        }
    }

    /// File suffix appended to compressed artifacts.
    pub fn extension(self) -> &'static str {
        match self {
            Algorithm::Gzip => "gz",
            Algorithm::Zstd => "zst",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Gzip => f.write_str("gzip"),
            Algorithm::Zstd => f.write_str("zstd"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompressionCodec {
    algorithm: Algorithm,
    level: Option<i32>,
}

impl CompressionCodec {
    pub fn new(algorithm: Algorithm, level: Option<i32>) -> Self {
        Self { algorithm, level }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    fn quality(&self) -> Level {
        match self.level {
            Some(level) => Level::Precise(level),
            None => Level::Default,
        }
    }

    /// Wrap a reader so that reading from it yields compressed bytes.
    pub fn encoder<'a, R>(&self, reader: R) -> Box<dyn AsyncRead + Unpin + Send + 'a>
    where
        R: AsyncBufRead + Unpin + Send + 'a,
    {
        match self.algorithm {
            Algorithm::Gzip => Box::new(GzipEncoder::with_quality(reader, self.quality())),
            Algorithm::Zstd => Box::new(ZstdEncoder::with_quality(reader, self.quality())),
        }
    }

    /// Wrap a reader of compressed bytes so that reading from it yields the original.
    pub fn decoder<'a, R>(&self, reader: R) -> Box<dyn AsyncRead + Unpin + Send + 'a>
    where
        R: AsyncBufRead + Unpin + Send + 'a,
    {
        match self.algorithm {
            Algorithm::Gzip => Box::new(GzipDecoder::new(reader)),
            Algorithm::Zstd => Box::new(ZstdDecoder::new(reader)),
        }
    }

    /// Compress `src` into `dst`, returning the number of bytes written.
    pub async fn compress_file(&self, src: &Path, dst: &Path) -> std::io::Result<u64> {
        let input = BufReader::new(tokio::fs::File::open(src).await?);
        let mut encoder = self.encoder(input);
        copy_to_file(&mut encoder, dst).await
    }

    /// Decompress `src` into `dst`, returning the number of bytes written.
    pub async fn decompress_file(&self, src: &Path, dst: &Path) -> std::io::Result<u64> {
        let input = BufReader::new(tokio::fs::File::open(src).await?);
        let mut decoder = self.decoder(input);
        copy_to_file(&mut decoder, dst).await
    }
}

async fn copy_to_file<R>(reader: &mut R, dst: &Path) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut output = tokio::fs::File::create(dst).await?;
    let written = tokio::io::copy(reader, &mut output).await?;
    output.flush().await?;
    output.sync_all().await?;
    Ok(written)
}
