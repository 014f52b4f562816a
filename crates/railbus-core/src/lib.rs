//! Railbus Core - bus identifiers, CDI parsing, and configuration layout
//!
//! This crate provides the foundational types for the railbus system:
//! - Node and event identifiers used on the control bus
//! - CDI (Configuration Description Information) XML parsing
//! - Layout resolution from description items to absolute-addressed entries
//! - Tree traversal and typed value codecs

pub mod cdi;
pub mod codec;
pub mod ids;
pub mod layout;
pub mod visitor;

pub use cdi::{
    CdiError, CdiRep, EventIdRep, Group, Identification, IntegerRep, Item, MapEntry, Segment,
    StringRep,
};
pub use ids::{EventId, IdParseError, NodeId};
pub use layout::{
    Entry, EntryHeader, EventEntry, GroupEntry, GroupRep, IntegerEntry, LayoutError, Root,
    SegmentEntry, StringEntry,
};
pub use visitor::Visit;
