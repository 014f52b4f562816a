//! Configuration representation of a remote node
//!
//! Maintains a parsed cache of a remote node's CDI: fetches the document,
//! resolves the entry tree, prefills the per-space byte caches, and serves
//! typed reads and writes against configuration variables. Progress and
//! data changes are published on a broadcast channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use railbus_core::codec;
use railbus_core::layout::{self, Entry, EntryHeader, Root};
use railbus_core::visitor::Visit;
use railbus_core::{CdiRep, EventId, NodeId};
use railbus_memcfg::{read_cdi, MemError, MemoryClient, MemorySpaceCache};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Loading state of a representation. `Failed` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Fetching,
    Parsing,
    Ready,
    Prefilling,
    CacheComplete,
    Failed(String),
}

impl State {
    pub fn is_failed(&self) -> bool {
        matches!(self, State::Failed(_))
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Uninitialized => write!(f, "Uninitialized"),
            State::Fetching => write!(f, "Fetching CDI"),
            State::Parsing => write!(f, "Parsing CDI"),
            State::Ready => write!(f, "Representation complete"),
            State::Prefilling => write!(f, "Prefilling caches"),
            State::CacheComplete => write!(f, "Cache complete"),
            State::Failed(msg) => write!(f, "{msg}"),
        }
    }
}

/// Notifications published while a representation loads and afterwards.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    /// Loading state changed; carries the human-readable description.
    StateChanged(String),
    /// The CDI is parsed and the entry tree is available.
    RepresentationReady,
    /// Every space finished its prefill pass.
    CacheComplete,
    /// The bytes backing one variable changed, from a remote read or a
    /// local write.
    EntryChanged { key: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("representation is not ready")]
    NotReady,
    #[error("no such variable: {0}")]
    UnknownKey(String),
    #[error("variable {key} is not {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
    },
    #[error(transparent)]
    Memory(#[from] MemError),
}

/// Live configuration representation of one remote node.
pub struct ConfigRepresentation {
    client: MemoryClient,
    state: Mutex<State>,
    root: Mutex<Option<Arc<Root>>>,
    spaces: Mutex<HashMap<u8, Arc<MemorySpaceCache>>>,
    events: broadcast::Sender<ConfigEvent>,
}

impl ConfigRepresentation {
    pub fn new(client: MemoryClient) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            client,
            state: Mutex::new(State::Uninitialized),
            root: Mutex::new(None),
            spaces: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn node(&self) -> NodeId {
        self.client.node()
    }

    pub fn state(&self) -> State {
        self.state.lock().unwrap().clone()
    }

    /// Subscribe to loading and data-change events. Subscribers attached
    /// before [`start`](Self::start) see the full lifecycle sequence.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.events.subscribe()
    }

    /// The resolved entry tree, available once the representation is ready.
    pub fn root(&self) -> Option<Arc<Root>> {
        self.root.lock().unwrap().clone()
    }

    /// Look up an entry by its dotted key.
    pub fn entry(&self, key: &str) -> Option<Entry> {
        self.root()?.find(key).cloned()
    }

    /// Traverse the resolved tree with `visitor`. No-op before ready.
    pub fn visit<V: Visit>(&self, visitor: &mut V) {
        if let Some(root) = self.root() {
            visitor.visit_root(&root);
        }
    }

    /// Fetch, parse and resolve the node's CDI, then prefill every space.
    /// Runs in the background; progress arrives on the event channel. A
    /// second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await });
    }

    async fn run(self: Arc<Self>) {
        if !self.try_transition(State::Uninitialized, State::Fetching) {
            debug!(node = %self.node(), "representation already started");
            return;
        }
        info!(node = %self.node(), "fetching CDI");
        let xml = match read_cdi(&self.client).await {
            Ok(xml) => xml,
            Err(err) => return self.fail(format!("Failed to fetch CDI: {err}")),
        };
        self.set_state(State::Parsing);
        let rep = match CdiRep::from_xml(&xml) {
            Ok(rep) => rep,
            Err(err) => return self.fail(format!("Failed to parse CDI: {err}")),
        };
        let root = match layout::resolve(&rep) {
            Ok(root) => Arc::new(root),
            Err(err) => return self.fail(format!("Failed to lay out CDI: {err}")),
        };
        *self.root.lock().unwrap() = Some(Arc::clone(&root));
        self.set_state(State::Ready);
        let _ = self.events.send(ConfigEvent::RepresentationReady);
        self.prefill(&root).await;
    }

    /// Register every leaf range with its space's cache, wire per-leaf
    /// change notifications, then fill all caches. `CacheComplete` goes out
    /// only after every space reported its own completion.
    async fn prefill(&self, root: &Root) {
        self.set_state(State::Prefilling);

        struct Register<'a> {
            rep: &'a ConfigRepresentation,
        }
        impl Visit for Register<'_> {
            fn visit_leaf(&mut self, header: &EntryHeader) {
                let cache = self.rep.cache_for_space(header.space);
                let (lo, hi) = header.range();
                cache.add_range(lo, hi);
                let events = self.rep.events.clone();
                let key = header.key.clone();
                cache.add_range_listener(
                    lo,
                    hi,
                    Arc::new(move |_, _| {
                        let _ = events.send(ConfigEvent::EntryChanged { key: key.clone() });
                    }),
                );
            }
        }
        Register { rep: self }.visit_root(root);

        let caches: Vec<Arc<MemorySpaceCache>> =
            self.spaces.lock().unwrap().values().cloned().collect();
        info!(node = %self.node(), spaces = caches.len(), "prefilling caches");
        let mut fills = JoinSet::new();
        for cache in caches {
            debug!(node = %self.node(), space = cache.space(), "filling space");
            fills.spawn(async move { cache.fill_cache().await });
        }
        while let Some(result) = fills.join_next().await {
            if let Err(err) = result {
                warn!(node = %self.node(), error = %err, "prefill task panicked");
            }
        }
        self.set_state(State::CacheComplete);
        let _ = self.events.send(ConfigEvent::CacheComplete);
    }

    /// Cache for `space`, created on first use.
    pub fn cache_for_space(&self, space: u8) -> Arc<MemorySpaceCache> {
        let mut spaces = self.spaces.lock().unwrap();
        Arc::clone(
            spaces
                .entry(space)
                .or_insert_with(|| Arc::new(MemorySpaceCache::new(self.client.clone(), space))),
        )
    }

    fn set_state(&self, next: State) {
        {
            let mut state = self.state.lock().unwrap();
            if state.is_failed() {
                // Terminal; completions from abandoned work land here.
                debug!(node = %self.node(), dropped = %next, "state change after failure");
                return;
            }
            *state = next.clone();
        }
        let _ = self.events.send(ConfigEvent::StateChanged(next.to_string()));
    }

    fn try_transition(&self, from: State, to: State) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if *state != from {
                return false;
            }
            *state = to.clone();
        }
        let _ = self.events.send(ConfigEvent::StateChanged(to.to_string()));
        true
    }

    fn fail(&self, msg: String) {
        warn!(node = %self.node(), "{msg}");
        self.set_state(State::Failed(msg));
    }

    fn with_leaf<T>(
        &self,
        key: &str,
        f: impl FnOnce(&Entry, &MemorySpaceCache) -> Result<T, ConfigError>,
    ) -> Result<T, ConfigError> {
        let root = self.root().ok_or(ConfigError::NotReady)?;
        let entry = root
            .find(key)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        let cache = self.cache_for_space(entry.header().space);
        f(entry, &cache)
    }

    /// Current value of an integer variable. Returns 0 while the backing
    /// bytes are absent from the cache.
    pub fn int_value(&self, key: &str) -> Result<u64, ConfigError> {
        self.with_leaf(key, |entry, cache| match entry {
            Entry::Int(v) => Ok(cache
                .read(v.header.origin, v.header.size as usize)
                .map(|bytes| codec::decode_u64(&bytes))
                .unwrap_or(0)),
            _ => Err(wrong_type(key, "an integer")),
        })
    }

    /// Write an integer variable, truncating high bits to the declared size.
    pub async fn set_int_value(&self, key: &str, value: u64) -> Result<(), ConfigError> {
        let (space, origin, bytes) = self.with_leaf(key, |entry, _| match entry {
            Entry::Int(v) => Ok((
                v.header.space,
                v.header.origin,
                codec::encode_u64(value, v.header.size as usize),
            )),
            _ => Err(wrong_type(key, "an integer")),
        })?;
        Ok(self.cache_for_space(space).write(origin, &bytes).await?)
    }

    /// Current value of an event variable, or `None` while the backing bytes
    /// are absent.
    pub fn event_value(&self, key: &str) -> Result<Option<EventId>, ConfigError> {
        self.with_leaf(key, |entry, cache| match entry {
            Entry::Event(v) => {
                let Some(bytes) = cache.read(v.header.origin, v.header.size as usize) else {
                    return Ok(None);
                };
                match <[u8; 8]>::try_from(bytes) {
                    Ok(raw) => Ok(Some(EventId::new(raw))),
                    Err(_) => Ok(None),
                }
            }
            _ => Err(wrong_type(key, "an event id")),
        })
    }

    /// Write an event variable as its 8 raw bytes.
    pub async fn set_event_value(&self, key: &str, event: EventId) -> Result<(), ConfigError> {
        let (space, origin) = self.with_leaf(key, |entry, _| match entry {
            Entry::Event(v) => Ok((v.header.space, v.header.origin)),
            _ => Err(wrong_type(key, "an event id")),
        })?;
        Ok(self
            .cache_for_space(space)
            .write(origin, event.as_bytes())
            .await?)
    }

    /// Current value of a string variable, or `None` while the backing bytes
    /// are absent. The NUL terminator and anything after it are dropped.
    pub fn string_value(&self, key: &str) -> Result<Option<String>, ConfigError> {
        self.with_leaf(key, |entry, cache| match entry {
            Entry::Str(v) => Ok(cache
                .read(v.header.origin, v.header.size as usize)
                .map(|bytes| codec::decode_string(&bytes))),
            _ => Err(wrong_type(key, "a string")),
        })
    }

    /// Write a string variable into its fixed buffer, truncating so a NUL
    /// terminator always fits.
    pub async fn set_string_value(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let (space, origin, bytes) = self.with_leaf(key, |entry, _| match entry {
            Entry::Str(v) => Ok((
                v.header.space,
                v.header.origin,
                codec::encode_string(value, v.header.size as usize),
            )),
            _ => Err(wrong_type(key, "a string")),
        })?;
        Ok(self.cache_for_space(space).write(origin, &bytes).await?)
    }
}

fn wrong_type(key: &str, expected: &'static str) -> ConfigError {
    ConfigError::WrongType {
        key: key.to_string(),
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(State::Uninitialized.to_string(), "Uninitialized");
        assert_eq!(State::Ready.to_string(), "Representation complete");
        assert_eq!(
            State::Failed("Failed to parse CDI: bad".to_string()).to_string(),
            "Failed to parse CDI: bad"
        );
    }

    #[test]
    fn test_failed_is_terminal_marker() {
        assert!(State::Failed(String::new()).is_failed());
        assert!(!State::CacheComplete.is_failed());
    }
}
