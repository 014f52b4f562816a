//! Per-space byte cache over the memory-configuration protocol
//!
//! One cache instance covers one `(node, space)` pair. Callers register the
//! byte ranges they care about, attach range listeners, and trigger a bulk
//! prefill; afterwards point reads are served from local state and writes go
//! through to the node.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::transport::{MemoryClient, TransportError, MAX_DATAGRAM_PAYLOAD};

/// Callback attached to a byte range; invoked with the updated `[lo, hi)`
/// once per overlapping update event. Listeners run outside the cache lock
/// and may call back into the cache.
pub type RangeListener = Arc<dyn Fn(u32, u32) + Send + Sync>;

/// Events published on a cache's broadcast channel.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// One `fill_cache` pass finished. `failed_ranges` counts registered
    /// ranges that could not be read; their bytes stay absent.
    LoadingComplete { failed_ranges: usize },
}

#[derive(Error, Debug)]
pub enum MemError {
    #[error("remote write failed: {0}")]
    Write(#[from] TransportError),
}

#[derive(Default)]
struct CacheState {
    data: BTreeMap<u32, u8>,
    ranges: Vec<(u32, u32)>,
    listeners: Vec<(u32, u32, RangeListener)>,
}

pub struct MemorySpaceCache {
    client: MemoryClient,
    space: u8,
    state: Mutex<CacheState>,
    events: broadcast::Sender<CacheEvent>,
}

impl MemorySpaceCache {
    pub fn new(client: MemoryClient, space: u8) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            client,
            space,
            state: Mutex::new(CacheState::default()),
            events,
        }
    }

    pub fn space(&self) -> u8 {
        self.space
    }

    /// Subscribe to fill-completion events.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Declare interest in `[lo, hi)`. Idempotent; overlapping ranges are
    /// merged when the fill runs.
    pub fn add_range(&self, lo: u32, hi: u32) {
        let mut state = self.state.lock().unwrap();
        if !state.ranges.contains(&(lo, hi)) {
            state.ranges.push((lo, hi));
        }
    }

    /// Attach `listener` to every byte of `[lo, hi)`.
    pub fn add_range_listener(&self, lo: u32, hi: u32, listener: RangeListener) {
        self.state.lock().unwrap().listeners.push((lo, hi, listener));
    }

    /// Read `len` bytes at `lo` from local state. Returns `None` unless every
    /// byte of the window is present; never partial.
    pub fn read(&self, lo: u32, len: usize) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::with_capacity(len);
        for addr in lo..lo + len as u32 {
            out.push(*state.data.get(&addr)?);
        }
        Some(out)
    }

    /// Write `data` at `lo`: the local cache is updated first, then the bytes
    /// go to the node in datagram-sized chunks. Range listeners fire after
    /// the ack. On failure the local bytes are kept (a later fill
    /// reconciles) and the error is returned.
    pub async fn write(&self, lo: u32, data: &[u8]) -> Result<(), MemError> {
        {
            let mut state = self.state.lock().unwrap();
            for (i, b) in data.iter().enumerate() {
                state.data.insert(lo + i as u32, *b);
            }
        }
        let mut offset = lo;
        for chunk in data.chunks(MAX_DATAGRAM_PAYLOAD) {
            if let Err(err) = self
                .client
                .write_bytes(self.space, offset, chunk.to_vec())
                .await
            {
                warn!(
                    space = self.space,
                    offset,
                    len = chunk.len(),
                    error = %err,
                    "memory write failed"
                );
                return Err(err.into());
            }
            offset += chunk.len() as u32;
        }
        self.notify(lo, lo + data.len() as u32);
        Ok(())
    }

    /// Read every registered range from the node, merging overlapping ranges
    /// and splitting reads at the datagram payload limit. Bytes are applied
    /// and listeners fired as chunks arrive; a failed range keeps its
    /// remaining bytes absent. Emits [`CacheEvent::LoadingComplete`] exactly
    /// once per invocation.
    pub async fn fill_cache(&self) {
        let ranges = coalesce(self.state.lock().unwrap().ranges.clone());
        let mut failed_ranges = 0;
        for (lo, hi) in ranges {
            let mut addr = lo;
            while addr < hi {
                let len = ((hi - addr) as usize).min(MAX_DATAGRAM_PAYLOAD);
                match self.client.read_bytes(self.space, addr, len).await {
                    Ok(bytes) => {
                        if bytes.is_empty() {
                            debug!(space = self.space, offset = addr, "end of space");
                            break;
                        }
                        let got = bytes.len();
                        self.apply(addr, &bytes);
                        addr += got as u32;
                        if got < len {
                            debug!(space = self.space, offset = addr, "end of space");
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(
                            space = self.space,
                            offset = addr,
                            len,
                            error = %err,
                            "memory read failed during fill"
                        );
                        failed_ranges += 1;
                        break;
                    }
                }
            }
        }
        let _ = self
            .events
            .send(CacheEvent::LoadingComplete { failed_ranges });
    }

    /// Apply bytes delivered by the node, overwriting any cached values, and
    /// fire overlapping listeners.
    fn apply(&self, lo: u32, bytes: &[u8]) {
        {
            let mut state = self.state.lock().unwrap();
            for (i, b) in bytes.iter().enumerate() {
                state.data.insert(lo + i as u32, *b);
            }
        }
        self.notify(lo, lo + bytes.len() as u32);
    }

    /// Fire every listener whose range overlaps the updated `[lo, hi)`.
    /// Listeners are cloned out of the lock before any of them runs.
    fn notify(&self, lo: u32, hi: u32) {
        let hit: Vec<RangeListener> = {
            let state = self.state.lock().unwrap();
            state
                .listeners
                .iter()
                .filter(|(l, h, _)| *l < hi && lo < *h)
                .map(|(_, _, f)| f.clone())
                .collect()
        };
        for listener in hit {
            listener(lo, hi);
        }
    }
}

/// Merge adjacent and overlapping ranges into a minimal sorted set.
fn coalesce(mut ranges: Vec<(u32, u32)>) -> Vec<(u32, u32)> {
    ranges.sort_unstable();
    let mut out: Vec<(u32, u32)> = Vec::new();
    for (lo, hi) in ranges {
        if let Some(last) = out.last_mut() {
            if lo <= last.1 {
                last.1 = last.1.max(hi);
                continue;
            }
        }
        out.push((lo, hi));
    }
    out
}
