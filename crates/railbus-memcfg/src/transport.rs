//! Memory-configuration transport seam
//!
//! The engine never talks to the wire directly. A bus adapter owns the
//! receiving end of the request channel and answers read/write datagrams
//! addressed to one remote node; replies come back over per-request oneshot
//! channels. Timeouts live in the adapter, not here.

use railbus_core::NodeId;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

/// Largest payload carried by one memory read/write datagram.
pub const MAX_DATAGRAM_PAYLOAD: usize = 64;

/// Memory space holding the CDI document.
pub const SPACE_CDI: u8 = 0xFF;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no response from node")]
    Timeout,
    #[error("request rejected by node (code {0:#06x})")]
    Rejected(u16),
    #[error("transport connection closed")]
    ConnectionClosed,
}

/// One memory-configuration request handed to the bus adapter.
#[derive(Debug)]
pub enum MemoryRequest {
    Read {
        node: NodeId,
        space: u8,
        offset: u32,
        len: usize,
        reply: oneshot::Sender<Result<Vec<u8>, TransportError>>,
    },
    Write {
        node: NodeId,
        space: u8,
        offset: u32,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
}

/// Handle for issuing memory-configuration requests to one remote node.
#[derive(Debug, Clone)]
pub struct MemoryClient {
    node: NodeId,
    tx: mpsc::Sender<MemoryRequest>,
}

impl MemoryClient {
    /// Create a client plus the request stream the bus adapter must serve.
    pub fn channel(node: NodeId, capacity: usize) -> (Self, mpsc::Receiver<MemoryRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { node, tx }, rx)
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Read up to `len` bytes from `space` at `offset`. A result shorter than
    /// `len` means the end of the space was reached.
    pub async fn read_bytes(
        &self,
        space: u8,
        offset: u32,
        len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        trace!(node = %self.node, space, offset, len, "memory read");
        let (reply, response) = oneshot::channel();
        self.tx
            .send(MemoryRequest::Read {
                node: self.node,
                space,
                offset,
                len,
                reply,
            })
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        response.await.map_err(|_| TransportError::ConnectionClosed)?
    }

    /// Write `data` into `space` at `offset` and wait for the ack.
    pub async fn write_bytes(
        &self,
        space: u8,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<(), TransportError> {
        trace!(node = %self.node, space, offset, len = data.len(), "memory write");
        let (reply, response) = oneshot::channel();
        self.tx
            .send(MemoryRequest::Write {
                node: self.node,
                space,
                offset,
                data,
                reply,
            })
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        response.await.map_err(|_| TransportError::ConnectionClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node() -> NodeId {
        NodeId::new([2, 1, 0x12, 0xFE, 0x3C, 0x9D])
    }

    #[tokio::test]
    async fn test_read_round_trip() {
        let (client, mut rx) = MemoryClient::channel(test_node(), 4);
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                match req {
                    MemoryRequest::Read {
                        space,
                        offset,
                        len,
                        reply,
                        ..
                    } => {
                        assert_eq!((space, offset, len), (253, 16, 4));
                        let _ = reply.send(Ok(vec![1, 2, 3, 4]));
                    }
                    MemoryRequest::Write { .. } => panic!("unexpected write"),
                }
            }
        });
        let bytes = client.read_bytes(253, 16, 4).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_write_round_trip() {
        let (client, mut rx) = MemoryClient::channel(test_node(), 4);
        tokio::spawn(async move {
            if let Some(MemoryRequest::Write {
                space,
                offset,
                data,
                reply,
                ..
            }) = rx.recv().await
            {
                assert_eq!((space, offset), (253, 8));
                assert_eq!(data, vec![9, 9]);
                let _ = reply.send(Ok(()));
            }
        });
        client.write_bytes(253, 8, vec![9, 9]).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_adapter_surfaces_connection_error() {
        let (client, rx) = MemoryClient::channel(test_node(), 4);
        drop(rx);
        assert_eq!(
            client.read_bytes(253, 0, 1).await.unwrap_err(),
            TransportError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn test_dropped_reply_surfaces_connection_error() {
        let (client, mut rx) = MemoryClient::channel(test_node(), 4);
        tokio::spawn(async move {
            // Drop the reply sender without answering.
            let _ = rx.recv().await;
        });
        assert_eq!(
            client.read_bytes(253, 0, 1).await.unwrap_err(),
            TransportError::ConnectionClosed
        );
    }
}
