//! Railbus Node - live configuration representation of a remote node
//!
//! Ties the pieces together: fetches and parses a node's CDI, resolves the
//! entry tree, prefills the per-space byte caches, and serves typed reads
//! and writes against configuration variables by key.

pub mod rep;

pub use rep::{ConfigError, ConfigEvent, ConfigRepresentation, State};
