//! Railbus MemCfg - memory-configuration protocol client plumbing
//!
//! This crate provides the I/O layer of the railbus system:
//! - The transport seam over which a bus adapter serves memory datagrams
//! - A per-space byte cache with range registration and change notification
//! - The CDI document fetch loop

pub mod cache;
pub mod reader;
pub mod transport;

pub use cache::{CacheEvent, MemError, MemorySpaceCache, RangeListener};
pub use reader::{read_cdi, read_space_text, FetchError};
pub use transport::{
    MemoryClient, MemoryRequest, TransportError, MAX_DATAGRAM_PAYLOAD, SPACE_CDI,
};
