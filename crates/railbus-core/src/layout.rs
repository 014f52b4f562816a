//! Layout resolution
//!
//! Transforms the parsed CDI description tree into a tree of entries, each
//! carrying the absolute `(space, origin, size)` byte range it occupies on
//! the remote node. Containers get the footprint of their children; repeated
//! groups are expanded into one replica entry per repeat, laid out
//! contiguously.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::cdi::{CdiRep, EventIdRep, Group, Identification, IntegerRep, Item, Segment, StringRep};

/// Byte footprint of an event identifier variable.
pub const EVENT_SIZE: u32 = 8;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LayoutError {
    #[error("missing size for {kind} variable {key:?}")]
    MissingSize { kind: &'static str, key: String },
    #[error("address overflow while laying out {key:?}")]
    Overflow { key: String },
}

/// Address and identity shared by every resolved entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHeader {
    /// Memory space number this entry lives in.
    pub space: u8,
    /// Address of the entry's first byte within that space.
    pub origin: u32,
    /// Total byte footprint.
    pub size: u32,
    /// Dotted path identifier, unique across the tree.
    pub key: String,
}

impl EntryHeader {
    /// Half-open byte range `[origin, origin + size)`.
    pub fn range(&self) -> (u32, u32) {
        (self.origin, self.origin + self.size)
    }
}

/// A node of the resolved tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Entry {
    Segment(SegmentEntry),
    Group(GroupEntry),
    GroupRep(GroupRep),
    Int(IntegerEntry),
    Event(EventEntry),
    Str(StringEntry),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentEntry {
    pub header: EntryHeader,
    pub name: Option<String>,
    pub description: Option<String>,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEntry {
    pub header: EntryHeader,
    pub name: Option<String>,
    pub description: Option<String>,
    pub rep_name: Option<String>,
    pub replication: u32,
    /// Replicas when `replication > 1`, otherwise the group's own items.
    pub entries: Vec<Entry>,
}

/// One repeat of a replicated group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRep {
    pub header: EntryHeader,
    /// 1-based index of this replica (keys use the 0-based form).
    pub index: u32,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegerEntry {
    pub header: EntryHeader,
    pub rep: IntegerRep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub header: EntryHeader,
    pub rep: EventIdRep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringEntry {
    pub header: EntryHeader,
    pub rep: StringRep,
}

impl Entry {
    pub fn header(&self) -> &EntryHeader {
        match self {
            Entry::Segment(e) => &e.header,
            Entry::Group(e) => &e.header,
            Entry::GroupRep(e) => &e.header,
            Entry::Int(e) => &e.header,
            Entry::Event(e) => &e.header,
            Entry::Str(e) => &e.header,
        }
    }

    /// Children of a container entry; `None` for variables.
    pub fn entries(&self) -> Option<&[Entry]> {
        match self {
            Entry::Segment(e) => Some(&e.entries),
            Entry::Group(e) => Some(&e.entries),
            Entry::GroupRep(e) => Some(&e.entries),
            _ => None,
        }
    }

    pub fn key(&self) -> &str {
        &self.header().key
    }
}

/// Root of the resolved tree. Its children are the segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Root {
    pub identification: Option<Identification>,
    pub entries: Vec<Entry>,
}

impl Root {
    /// Look up an entry by its dotted key.
    pub fn find(&self, key: &str) -> Option<&Entry> {
        fn walk<'a>(entries: &'a [Entry], key: &str) -> Option<&'a Entry> {
            for entry in entries {
                if entry.key() == key {
                    return Some(entry);
                }
                // Child keys extend the parent key, so unrelated subtrees
                // can be pruned.
                if key.starts_with(entry.key()) {
                    if let Some(children) = entry.entries() {
                        if let Some(found) = walk(children, key) {
                            return Some(found);
                        }
                    }
                }
            }
            None
        }
        walk(&self.entries, key)
    }
}

/// Resolve a parsed CDI document into an addressed entry tree.
pub fn resolve(rep: &CdiRep) -> Result<Root, LayoutError> {
    let mut entries = Vec::with_capacity(rep.segments.len());
    for (i, segment) in rep.segments.iter().enumerate() {
        entries.push(Entry::Segment(resolve_segment(segment, i)?));
    }
    Ok(Root {
        identification: rep.identification.clone(),
        entries,
    })
}

fn resolve_segment(segment: &Segment, index: usize) -> Result<SegmentEntry, LayoutError> {
    let key = match &segment.name {
        Some(name) if !name.is_empty() => name.clone(),
        _ => format!("seg{index}"),
    };
    let mut entries = Vec::new();
    let size = process_group(
        &key,
        segment.space,
        &segment.items,
        &mut entries,
        segment.origin,
    )?;
    Ok(SegmentEntry {
        header: EntryHeader {
            space: segment.space,
            origin: segment.origin,
            size,
            key,
        },
        name: segment.name.clone(),
        description: segment.description.clone(),
        entries,
    })
}

/// Lay out the items of one container, appending resolved entries to `out`.
///
/// The cursor starts at `start` and advances by each item's declared offset
/// and then its computed size. Returns the number of bytes the container
/// covers.
fn process_group(
    base_key: &str,
    space: u8,
    items: &[Item],
    out: &mut Vec<Entry>,
    start: u32,
) -> Result<u32, LayoutError> {
    let mut origin = start;
    for (i, item) in items.iter().enumerate() {
        if let Item::Unknown { element } = item {
            warn!(
                element = %element,
                container = %base_key,
                "skipping unknown CDI item"
            );
            continue;
        }
        origin = checked_advance(origin, item.offset(), base_key)?;
        let key = match item.name() {
            Some(name) if !name.is_empty() => format!("{base_key}.{name}"),
            _ => format!("{base_key}.item{i}"),
        };
        let entry = match item {
            Item::Group(group) => Entry::Group(resolve_group(&key, group, space, origin)?),
            Item::Int(rep) => {
                let size = require_size(rep.size, "integer", &key)?;
                Entry::Int(IntegerEntry {
                    header: header(space, origin, size, key),
                    rep: rep.clone(),
                })
            }
            Item::Str(rep) => {
                let size = require_size(rep.size, "string", &key)?;
                Entry::Str(StringEntry {
                    header: header(space, origin, size, key),
                    rep: rep.clone(),
                })
            }
            Item::Event(rep) => Entry::Event(EventEntry {
                header: header(space, origin, EVENT_SIZE, key),
                rep: rep.clone(),
            }),
            Item::Unknown { .. } => unreachable!("handled above"),
        };
        origin = checked_advance(entry.header().origin, entry.header().size, entry.key())?;
        out.push(entry);
    }
    Ok(origin - start)
}

fn resolve_group(
    key: &str,
    group: &Group,
    space: u8,
    origin: u32,
) -> Result<GroupEntry, LayoutError> {
    let mut entries = Vec::new();
    let size = if group.replication <= 1 {
        process_group(key, space, &group.items, &mut entries, origin)?
    } else {
        let mut cursor = origin;
        for i in 0..group.replication {
            let rep_key = format!("{key}({i})");
            let mut rep_entries = Vec::new();
            let rep_size = process_group(&rep_key, space, &group.items, &mut rep_entries, cursor)?;
            entries.push(Entry::GroupRep(GroupRep {
                header: EntryHeader {
                    space,
                    origin: cursor,
                    size: rep_size,
                    key: rep_key,
                },
                index: i + 1,
                entries: rep_entries,
            }));
            cursor = checked_advance(cursor, rep_size, key)?;
        }
        cursor - origin
    };
    Ok(GroupEntry {
        header: EntryHeader {
            space,
            origin,
            size,
            key: key.to_string(),
        },
        name: group.name.clone(),
        description: group.description.clone(),
        rep_name: group.rep_name.clone(),
        replication: group.replication,
        entries,
    })
}

fn header(space: u8, origin: u32, size: u32, key: String) -> EntryHeader {
    EntryHeader {
        space,
        origin,
        size,
        key,
    }
}

fn require_size(size: Option<u32>, kind: &'static str, key: &str) -> Result<u32, LayoutError> {
    match size {
        Some(s) if s > 0 => Ok(s),
        _ => Err(LayoutError::MissingSize {
            kind,
            key: key.to_string(),
        }),
    }
}

fn checked_advance(origin: u32, delta: u32, key: &str) -> Result<u32, LayoutError> {
    origin.checked_add(delta).ok_or_else(|| LayoutError::Overflow {
        key: key.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdi::CdiRep;

    fn resolve_xml(xml: &str) -> Root {
        resolve(&CdiRep::from_xml(xml).unwrap()).unwrap()
    }

    #[test]
    fn test_single_integer() {
        let root = resolve_xml(
            r#"<cdi><segment space="251">
                 <name>root</name>
                 <int size="2" offset="4"><name>v</name></int>
               </segment></cdi>"#,
        );
        let entry = root.find("root.v").unwrap();
        let header = entry.header();
        assert_eq!(header.space, 251);
        assert_eq!(header.origin, 4);
        assert_eq!(header.size, 2);
        assert!(matches!(entry, Entry::Int(_)));
        assert_eq!(root.entries[0].header().size, 6);
    }

    #[test]
    fn test_repeated_group() {
        let root = resolve_xml(
            r#"<cdi><segment space="1">
                 <name>s</name>
                 <group replication="3">
                   <name>g</name>
                   <int size="1"><name>a</name></int>
                   <int size="1"><name>b</name></int>
                 </group>
               </segment></cdi>"#,
        );
        let group = root.find("s.g").unwrap();
        assert_eq!(group.header().size, 6);
        for i in 0..3u32 {
            let rep = root.find(&format!("s.g({i})")).unwrap();
            assert_eq!(rep.header().origin, i * 2);
            assert_eq!(rep.header().size, 2);
            let Entry::GroupRep(rep) = rep else {
                panic!("expected replica");
            };
            assert_eq!(rep.index, i + 1);
            let a = root.find(&format!("s.g({i}).a")).unwrap();
            let b = root.find(&format!("s.g({i}).b")).unwrap();
            assert_eq!(a.header().origin, i * 2);
            assert_eq!(b.header().origin, i * 2 + 1);
        }
    }

    #[test]
    fn test_nested_offsets() {
        let root = resolve_xml(
            r#"<cdi><segment space="2" origin="100">
                 <name>s</name>
                 <int size="4" offset="8"><name>i</name></int>
                 <string size="16" offset="4"><name>t</name></string>
               </segment></cdi>"#,
        );
        let int = root.find("s.i").unwrap().header();
        assert_eq!((int.origin, int.size), (108, 4));
        let string = root.find("s.t").unwrap().header();
        assert_eq!((string.origin, string.size), (116, 16));
        assert_eq!(root.entries[0].header().size, 32);
    }

    #[test]
    fn test_nested_group_offsets() {
        let root = resolve_xml(
            r#"<cdi><segment space="5" origin="10">
                 <name>s</name>
                 <group offset="2">
                   <name>g</name>
                   <eventid offset="1"><name>e</name></eventid>
                 </group>
                 <int size="1"><name>tail</name></int>
               </segment></cdi>"#,
        );
        let group = root.find("s.g").unwrap().header();
        assert_eq!((group.origin, group.size), (12, 9));
        let event = root.find("s.g.e").unwrap().header();
        assert_eq!((event.origin, event.size), (13, 8));
        let tail = root.find("s.tail").unwrap().header();
        assert_eq!(tail.origin, 21);
    }

    #[test]
    fn test_leaf_ranges_disjoint() {
        let root = resolve_xml(
            r#"<cdi><segment space="1">
                 <name>s</name>
                 <group replication="4">
                   <name>g</name>
                   <int size="2"><name>a</name></int>
                   <string size="5"><name>n</name></string>
                   <eventid><name>e</name></eventid>
                 </group>
                 <int size="8"><name>z</name></int>
               </segment></cdi>"#,
        );
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        fn collect(entries: &[Entry], out: &mut Vec<(u32, u32)>) {
            for e in entries {
                match e.entries() {
                    Some(children) => collect(children, out),
                    None => out.push(e.header().range()),
                }
            }
        }
        collect(&root.entries, &mut ranges);
        assert_eq!(ranges.len(), 13);
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlap between {pair:?}");
        }
    }

    #[test]
    fn test_unknown_item_skipped_preserving_cursor() {
        let root = resolve_xml(
            r#"<cdi><segment space="1">
                 <name>s</name>
                 <int size="2"><name>a</name></int>
                 <widget/>
                 <int size="2"><name>b</name></int>
               </segment></cdi>"#,
        );
        assert_eq!(root.find("s.b").unwrap().header().origin, 2);
    }

    #[test]
    fn test_missing_int_size_fails() {
        let rep = CdiRep::from_xml(
            r#"<cdi><segment space="1"><name>s</name><int><name>a</name></int></segment></cdi>"#,
        )
        .unwrap();
        assert_eq!(
            resolve(&rep).unwrap_err(),
            LayoutError::MissingSize {
                kind: "integer",
                key: "s.a".to_string()
            }
        );
    }

    #[test]
    fn test_unnamed_items_get_positional_keys() {
        let root = resolve_xml(
            r#"<cdi><segment space="1"><name>s</name><int size="1"/><int size="1"/></segment></cdi>"#,
        );
        assert!(root.find("s.item0").is_some());
        assert_eq!(root.find("s.item1").unwrap().header().origin, 1);
    }

    #[test]
    fn test_keys_unique() {
        let root = resolve_xml(
            r#"<cdi><segment space="1">
                 <name>s</name>
                 <group replication="2"><name>g</name><int size="1"><name>a</name></int></group>
               </segment></cdi>"#,
        );
        let mut keys = Vec::new();
        fn collect(entries: &[Entry], out: &mut Vec<String>) {
            for e in entries {
                out.push(e.key().to_string());
                if let Some(children) = e.entries() {
                    collect(children, out);
                }
            }
        }
        collect(&root.entries, &mut keys);
        let total = keys.len();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), total);
    }

    #[test]
    fn test_address_overflow() {
        let rep = CdiRep::from_xml(
            r#"<cdi><segment space="1" origin="4294967295"><name>s</name><int size="2"><name>a</name></int></segment></cdi>"#,
        )
        .unwrap();
        assert!(matches!(
            resolve(&rep).unwrap_err(),
            LayoutError::Overflow { .. }
        ));
    }
}
