//! Byte compression for the blobs that ride inside job records: recorded
//! environments, uploaded files, and captured stdout/stderr.

use crate::proto;
use anyhow::{Context as _, Result};
use async_compression::tokio::{bufread::GzipDecoder, write::GzipEncoder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

/// The decoded form of a job's `env_c` blob.
#[derive(Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct EnvVars {
    pub environ: Vec<String>,
}

pub async fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzipEncoder::new(Vec::new());
    encoder.write_all(bytes).await?;
    encoder.shutdown().await?;
    Ok(encoder.into_inner())
}

pub async fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzipDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).await?;
    Ok(out)
}

/// Encode then compress an environment, ready to store in `Job::env_c`.
pub async fn compress_env(environ: Vec<String>) -> Result<Vec<u8>> {
    let encoded = proto::serialize(&EnvVars { environ })?;
    compress(&encoded).await
}

pub async fn decompress_env(bytes: &[u8]) -> Result<Vec<String>> {
    let encoded = decompress(bytes).await?;
    let env: EnvVars = proto::deserialize(&encoded)?;
    Ok(env.environ)
}

/// Read and compress a file's contents, ready to ship to the server.
pub async fn compress_file(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("could not read {}", path.display()))?;
    compress(&bytes).await
}
