//! Encoding used on the wire and for stored blobs: bincode via serde. Frames
//! on the socket are this encoding behind a u32 big-endian length prefix; the
//! framing itself lives with the transport.

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
