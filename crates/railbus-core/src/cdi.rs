//! CDI (Configuration Description Information) parsing
//!
//! CDI is an XML document published by a node on the bus describing its
//! configuration variables and their byte layout across numbered memory
//! spaces. This module parses the document into a description-item tree;
//! address assignment happens later in [`crate::layout`].

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CdiError {
    #[error("failed to parse CDI: {0}")]
    Parse(String),
    #[error("invalid {attr} attribute on <{element}>: {value:?}")]
    BadAttribute {
        element: String,
        attr: String,
        value: String,
    },
}

/// Parsed CDI document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CdiRep {
    pub identification: Option<Identification>,
    /// Whether the node also publishes the abbreviated ACDI form.
    pub acdi: bool,
    pub segments: Vec<Segment>,
}

/// Manufacturer block from the head of the document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identification {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub hardware_version: Option<String>,
    pub software_version: Option<String>,
}

/// Top-level container bound to a memory space and an absolute origin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Segment {
    pub space: u8,
    pub origin: u32,
    pub name: Option<String>,
    pub description: Option<String>,
    pub items: Vec<Item>,
}

/// One description item inside a segment or group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Item {
    Group(Group),
    Int(IntegerRep),
    Str(StringRep),
    Event(EventIdRep),
    /// Element the reader did not recognize. Carried through so the layout
    /// pass can report it.
    Unknown { element: String },
}

impl Item {
    pub fn name(&self) -> Option<&str> {
        match self {
            Item::Group(g) => g.name.as_deref(),
            Item::Int(v) => v.name.as_deref(),
            Item::Str(v) => v.name.as_deref(),
            Item::Event(v) => v.name.as_deref(),
            Item::Unknown { .. } => None,
        }
    }

    /// Declared gap in bytes between the previous item and this one.
    pub fn offset(&self) -> u32 {
        match self {
            Item::Group(g) => g.offset,
            Item::Int(v) => v.offset,
            Item::Str(v) => v.offset,
            Item::Event(v) => v.offset,
            Item::Unknown { .. } => 0,
        }
    }
}

/// Intermediate container, possibly replicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: Option<String>,
    pub description: Option<String>,
    /// Display name for individual replicas.
    pub rep_name: Option<String>,
    pub offset: u32,
    pub replication: u32,
    pub items: Vec<Item>,
}

/// Integer variable. `min`/`max`/`default` and the enumeration map are
/// carried as metadata and not enforced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegerRep {
    pub name: Option<String>,
    pub description: Option<String>,
    pub offset: u32,
    pub size: Option<u32>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub default: Option<i64>,
    pub map: Vec<MapEntry>,
}

/// String variable occupying a fixed-size NUL-terminated buffer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StringRep {
    pub name: Option<String>,
    pub description: Option<String>,
    pub offset: u32,
    pub size: Option<u32>,
}

/// Event identifier variable. Always 8 bytes on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventIdRep {
    pub name: Option<String>,
    pub description: Option<String>,
    pub offset: u32,
}

/// One relation of an enumeration map: stored value to display name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapEntry {
    pub key: String,
    pub value: String,
}

impl CdiRep {
    /// Parse a CDI document.
    pub fn from_xml(xml: &str) -> Result<CdiRep, CdiError> {
        let mut reader = Reader::from_str(xml);
        let mut rep = CdiRep::default();
        let mut saw_root = false;
        loop {
            match read(&mut reader)? {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"cdi" => saw_root = true,
                    b"identification" => {
                        rep.identification = Some(parse_identification(&mut reader)?)
                    }
                    b"segment" => rep.segments.push(parse_segment(&mut reader, &e, false)?),
                    b"acdi" => {
                        rep.acdi = true;
                        skip(&mut reader, &e)?;
                    }
                    other => {
                        debug!(
                            element = %String::from_utf8_lossy(other),
                            "skipping top-level element"
                        );
                        skip(&mut reader, &e)?;
                    }
                },
                Event::Empty(e) => match e.local_name().as_ref() {
                    b"segment" => rep.segments.push(parse_segment(&mut reader, &e, true)?),
                    b"acdi" => rep.acdi = true,
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }
        if !saw_root {
            return Err(CdiError::Parse("missing <cdi> root element".to_string()));
        }
        Ok(rep)
    }
}

/// Metadata and items collected from a container's child elements.
#[derive(Default)]
struct Children {
    name: Option<String>,
    description: Option<String>,
    rep_name: Option<String>,
    min: Option<i64>,
    max: Option<i64>,
    default: Option<i64>,
    map: Vec<MapEntry>,
    items: Vec<Item>,
}

fn parse_segment(
    reader: &mut Reader<&[u8]>,
    e: &BytesStart,
    empty: bool,
) -> Result<Segment, CdiError> {
    let space = attr_num::<u8>(e, "segment", "space")?
        .ok_or_else(|| CdiError::Parse("<segment> missing required space attribute".to_string()))?;
    let origin = attr_num::<u32>(e, "segment", "origin")?.unwrap_or(0);
    let children = if empty {
        Children::default()
    } else {
        parse_children(reader, b"segment", true)?
    };
    Ok(Segment {
        space,
        origin,
        name: children.name,
        description: children.description,
        items: children.items,
    })
}

fn parse_group(reader: &mut Reader<&[u8]>, e: &BytesStart, empty: bool) -> Result<Group, CdiError> {
    let replication = attr_num::<u32>(e, "group", "replication")?.unwrap_or(1);
    let offset = attr_num::<u32>(e, "group", "offset")?.unwrap_or(0);
    let children = if empty {
        Children::default()
    } else {
        parse_children(reader, b"group", true)?
    };
    Ok(Group {
        name: children.name,
        description: children.description,
        rep_name: children.rep_name,
        offset,
        replication,
        items: children.items,
    })
}

fn parse_int(
    reader: &mut Reader<&[u8]>,
    e: &BytesStart,
    empty: bool,
) -> Result<IntegerRep, CdiError> {
    let size = attr_num::<u32>(e, "int", "size")?;
    let offset = attr_num::<u32>(e, "int", "offset")?.unwrap_or(0);
    let children = if empty {
        Children::default()
    } else {
        parse_children(reader, b"int", false)?
    };
    Ok(IntegerRep {
        name: children.name,
        description: children.description,
        offset,
        size,
        min: children.min,
        max: children.max,
        default: children.default,
        map: children.map,
    })
}

fn parse_string(
    reader: &mut Reader<&[u8]>,
    e: &BytesStart,
    empty: bool,
) -> Result<StringRep, CdiError> {
    let size = attr_num::<u32>(e, "string", "size")?;
    let offset = attr_num::<u32>(e, "string", "offset")?.unwrap_or(0);
    let children = if empty {
        Children::default()
    } else {
        parse_children(reader, b"string", false)?
    };
    Ok(StringRep {
        name: children.name,
        description: children.description,
        offset,
        size,
    })
}

fn parse_eventid(
    reader: &mut Reader<&[u8]>,
    e: &BytesStart,
    empty: bool,
) -> Result<EventIdRep, CdiError> {
    let offset = attr_num::<u32>(e, "eventid", "offset")?.unwrap_or(0);
    let children = if empty {
        Children::default()
    } else {
        parse_children(reader, b"eventid", false)?
    };
    Ok(EventIdRep {
        name: children.name,
        description: children.description,
        offset,
    })
}

fn parse_identification(reader: &mut Reader<&[u8]>) -> Result<Identification, CdiError> {
    let mut ident = Identification::default();
    loop {
        match read(reader)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"manufacturer" => ident.manufacturer = Some(text_of(reader, &e)?),
                b"model" => ident.model = Some(text_of(reader, &e)?),
                b"hardwareVersion" => ident.hardware_version = Some(text_of(reader, &e)?),
                b"softwareVersion" => ident.software_version = Some(text_of(reader, &e)?),
                _ => skip(reader, &e)?,
            },
            Event::End(e) if e.local_name().as_ref() == b"identification" => break,
            Event::Eof => {
                return Err(CdiError::Parse(
                    "unexpected end of document inside <identification>".to_string(),
                ))
            }
            _ => {}
        }
    }
    Ok(ident)
}

fn parse_children(
    reader: &mut Reader<&[u8]>,
    element: &[u8],
    collect_items: bool,
) -> Result<Children, CdiError> {
    let mut out = Children::default();
    loop {
        match read(reader)? {
            Event::Start(e) => handle_child(reader, &e, false, &mut out, collect_items)?,
            Event::Empty(e) => handle_child(reader, &e, true, &mut out, collect_items)?,
            Event::End(e) if e.local_name().as_ref() == element => break,
            Event::Eof => {
                return Err(CdiError::Parse(format!(
                    "unexpected end of document inside <{}>",
                    String::from_utf8_lossy(element)
                )))
            }
            _ => {}
        }
    }
    Ok(out)
}

fn handle_child(
    reader: &mut Reader<&[u8]>,
    e: &BytesStart,
    empty: bool,
    out: &mut Children,
    collect_items: bool,
) -> Result<(), CdiError> {
    match e.local_name().as_ref() {
        b"name" => out.name = Some(maybe_text(reader, e, empty)?),
        b"description" => out.description = Some(maybe_text(reader, e, empty)?),
        b"repname" => out.rep_name = Some(maybe_text(reader, e, empty)?),
        b"min" => out.min = Some(number_of(reader, e, empty)?),
        b"max" => out.max = Some(number_of(reader, e, empty)?),
        b"default" => out.default = Some(number_of(reader, e, empty)?),
        b"map" => {
            if !empty {
                out.map = parse_map(reader)?;
            }
        }
        b"group" => out.items.push(Item::Group(parse_group(reader, e, empty)?)),
        b"int" => out.items.push(Item::Int(parse_int(reader, e, empty)?)),
        b"string" => out.items.push(Item::Str(parse_string(reader, e, empty)?)),
        b"eventid" => out
            .items
            .push(Item::Event(parse_eventid(reader, e, empty)?)),
        other => {
            if collect_items {
                out.items.push(Item::Unknown {
                    element: String::from_utf8_lossy(other).into_owned(),
                });
            }
            if !empty {
                skip(reader, e)?;
            }
        }
    }
    Ok(())
}

fn parse_map(reader: &mut Reader<&[u8]>) -> Result<Vec<MapEntry>, CdiError> {
    let mut entries = Vec::new();
    loop {
        match read(reader)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"relation" => {
                    let mut entry = MapEntry::default();
                    loop {
                        match read(reader)? {
                            Event::Start(inner) => match inner.local_name().as_ref() {
                                b"property" => entry.key = text_of(reader, &inner)?,
                                b"value" => entry.value = text_of(reader, &inner)?,
                                _ => skip(reader, &inner)?,
                            },
                            Event::End(inner) if inner.local_name().as_ref() == b"relation" => {
                                break
                            }
                            Event::Eof => {
                                return Err(CdiError::Parse(
                                    "unexpected end of document inside <relation>".to_string(),
                                ))
                            }
                            _ => {}
                        }
                    }
                    entries.push(entry);
                }
                _ => skip(reader, &e)?,
            },
            Event::End(e) if e.local_name().as_ref() == b"map" => break,
            Event::Eof => {
                return Err(CdiError::Parse(
                    "unexpected end of document inside <map>".to_string(),
                ))
            }
            _ => {}
        }
    }
    Ok(entries)
}

fn read<'a>(reader: &mut Reader<&'a [u8]>) -> Result<Event<'a>, CdiError> {
    reader
        .read_event()
        .map_err(|e| CdiError::Parse(e.to_string()))
}

fn skip(reader: &mut Reader<&[u8]>, e: &BytesStart) -> Result<(), CdiError> {
    reader
        .read_to_end(e.name())
        .map(|_| ())
        .map_err(|err| CdiError::Parse(err.to_string()))
}

fn text_of(reader: &mut Reader<&[u8]>, e: &BytesStart) -> Result<String, CdiError> {
    reader
        .read_text(e.name())
        .map(|t| t.trim().to_string())
        .map_err(|err| CdiError::Parse(err.to_string()))
}

fn maybe_text(reader: &mut Reader<&[u8]>, e: &BytesStart, empty: bool) -> Result<String, CdiError> {
    if empty {
        Ok(String::new())
    } else {
        text_of(reader, e)
    }
}

fn number_of(reader: &mut Reader<&[u8]>, e: &BytesStart, empty: bool) -> Result<i64, CdiError> {
    let text = maybe_text(reader, e, empty)?;
    text.parse::<i64>().map_err(|_| {
        CdiError::Parse(format!(
            "invalid numeric value {:?} in <{}>",
            text,
            String::from_utf8_lossy(e.local_name().as_ref())
        ))
    })
}

fn attr_string(e: &BytesStart, name: &str) -> Result<Option<String>, CdiError> {
    match e.try_get_attribute(name) {
        Ok(Some(attr)) => Ok(Some(
            attr.unescape_value()
                .map_err(|err| CdiError::Parse(err.to_string()))?
                .into_owned(),
        )),
        Ok(None) => Ok(None),
        Err(err) => Err(CdiError::Parse(err.to_string())),
    }
}

fn attr_num<T: std::str::FromStr>(
    e: &BytesStart,
    element: &str,
    name: &str,
) -> Result<Option<T>, CdiError> {
    match attr_string(e, name)? {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| CdiError::BadAttribute {
                element: element.to_string(),
                attr: name.to_string(),
                value: raw,
            }),
        None => Ok(None),
    }
}
