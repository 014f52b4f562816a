//! Fetching the CDI document out of a node's memory
//!
//! The CDI XML lives in a dedicated memory space, NUL-terminated and
//! possibly padded. The fetch walks the space forward in datagram-sized
//! chunks and stops at the terminator or the end of the space.

use thiserror::Error;
use tracing::debug;

use crate::transport::{MemoryClient, TransportError, MAX_DATAGRAM_PAYLOAD, SPACE_CDI};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("failed to read CDI space: {0}")]
    Transport(#[from] TransportError),
    #[error("CDI text is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Read the CDI XML from the node's CDI space.
pub async fn read_cdi(client: &MemoryClient) -> Result<String, FetchError> {
    read_space_text(client, SPACE_CDI).await
}

/// Read a NUL-terminated text document from `space`, starting at offset 0.
/// Trailing NUL padding is stripped.
pub async fn read_space_text(client: &MemoryClient, space: u8) -> Result<String, FetchError> {
    let mut buf: Vec<u8> = Vec::new();
    let mut offset = 0u32;
    loop {
        let chunk = client
            .read_bytes(space, offset, MAX_DATAGRAM_PAYLOAD)
            .await?;
        match chunk.iter().position(|&b| b == 0) {
            Some(n) => {
                buf.extend_from_slice(&chunk[..n]);
                break;
            }
            None => {
                let got = chunk.len();
                buf.extend_from_slice(&chunk);
                if got < MAX_DATAGRAM_PAYLOAD {
                    break;
                }
                offset += got as u32;
            }
        }
    }
    while buf.last() == Some(&0) {
        buf.pop();
    }
    debug!(node = %client.node(), space, bytes = buf.len(), "fetched document");
    Ok(String::from_utf8(buf)?)
}
