//! Bus identifier types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdParseError {
    #[error("expected {expected} bytes, got {actual}")]
    BadLength { expected: usize, actual: usize },
    #[error("invalid hex digits in {0:?}")]
    BadDigits(String),
}

/// 6-byte address of a node on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 6]);

impl NodeId {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_dotted(f, &self.0)
    }
}

impl FromStr for NodeId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(parse_id(s)?))
    }
}

/// 8-byte event identifier used for producer/consumer events on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub [u8; 8]);

impl EventId {
    pub fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_dotted(f, &self.0)
    }
}

impl FromStr for EventId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(parse_id(s)?))
    }
}

fn write_dotted(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            write!(f, ".")?;
        }
        write!(f, "{:02X}", b)?;
    }
    Ok(())
}

/// Accepts the dotted form (`02.01.12.FE.3C.9D`) and the plain hex form
/// (`020112FE3C9D`).
fn parse_id<const N: usize>(s: &str) -> Result<[u8; N], IdParseError> {
    let raw = if s.contains('.') {
        let mut out = Vec::with_capacity(N);
        for part in s.split('.') {
            out.push(
                u8::from_str_radix(part, 16).map_err(|_| IdParseError::BadDigits(s.to_string()))?,
            );
        }
        out
    } else {
        hex::decode(s).map_err(|_| IdParseError::BadDigits(s.to_string()))?
    };
    raw.try_into().map_err(|v: Vec<u8>| IdParseError::BadLength {
        expected: N,
        actual: v.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display() {
        let id = NodeId::new([0x02, 0x01, 0x12, 0xFE, 0x3C, 0x9D]);
        assert_eq!(id.to_string(), "02.01.12.FE.3C.9D");
    }

    #[test]
    fn test_node_id_parse_roundtrip() {
        let id: NodeId = "02.01.12.FE.3C.9D".parse().unwrap();
        assert_eq!(id, NodeId::new([0x02, 0x01, 0x12, 0xFE, 0x3C, 0x9D]));
        assert_eq!(id.to_string().parse::<NodeId>().unwrap(), id);
    }

    #[test]
    fn test_node_id_parse_plain_hex() {
        let id: NodeId = "020112fe3c9d".parse().unwrap();
        assert_eq!(id, NodeId::new([0x02, 0x01, 0x12, 0xFE, 0x3C, 0x9D]));
    }

    #[test]
    fn test_event_id_parse() {
        let id: EventId = "05.01.01.01.14.FF.00.01".parse().unwrap();
        assert_eq!(
            id.as_bytes(),
            &[0x05, 0x01, 0x01, 0x01, 0x14, 0xFF, 0x00, 0x01]
        );
    }

    #[test]
    fn test_bad_length() {
        assert_eq!(
            "02.01.12".parse::<NodeId>().unwrap_err(),
            IdParseError::BadLength {
                expected: 6,
                actual: 3
            }
        );
    }

    #[test]
    fn test_bad_digits() {
        assert!("02.01.12.ZZ.3C.9D".parse::<NodeId>().is_err());
    }
}
