pub mod btree;
pub mod hash;
pub mod isam;
pub mod rtree;
pub mod sequential;

use crate::catalog::DataType;
use crate::error::{OmnidexError, OmnidexResult};
use crate::storage::codec::{CommonCodec, FieldCodec};
use crate::storage::Rid;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// The index families a table can bind its primary index to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Sequential,
    Isam,
    Hash,
    BTree,
    RTree,
    Spimi,
    Media,
}

impl FromStr for IndexKind {
    type Err = OmnidexError;

    fn from_str(s: &str) -> OmnidexResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(IndexKind::Sequential),
            "isam" => Ok(IndexKind::Isam),
            "hash" => Ok(IndexKind::Hash),
            "btree" => Ok(IndexKind::BTree),
            "rtree" => Ok(IndexKind::RTree),
            "spimi" => Ok(IndexKind::Spimi),
            other => Err(OmnidexError::Parse(format!(
                "unknown index kind \"{}\"",
                other
            ))),
        }
    }
}

impl Display for IndexKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IndexKind::Sequential => "sequential",
            IndexKind::Isam => "isam",
            IndexKind::Hash => "hash",
            IndexKind::BTree => "btree",
            IndexKind::RTree => "rtree",
            IndexKind::Spimi => "spimi",
            IndexKind::Media => "media",
        };
        write!(f, "{}", name)
    }
}

/// An immutable key drawn from one field. Numeric fields order numerically,
/// text lexicographically; floats use the IEEE total order so keys always
/// have a total order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Key {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Key {
    /// Parse a raw field value or SQL literal under the field's declared type.
    pub fn parse(raw: &str, data_type: DataType) -> OmnidexResult<Key> {
        let trimmed = raw.trim();
        match data_type {
            DataType::Int => trimmed
                .parse::<i64>()
                .map(Key::Int)
                .map_err(|_| OmnidexError::Parse(format!("\"{}\" is not an integer", trimmed))),
            DataType::Float => trimmed
                .parse::<f64>()
                .map(Key::Float)
                .map_err(|_| OmnidexError::Parse(format!("\"{}\" is not a number", trimmed))),
            DataType::Text | DataType::Geo2d => Ok(Key::Text(trimmed.to_string())),
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Key::Int(_) => 0,
            Key::Float(_) => 1,
            Key::Text(_) => 2,
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Int(a), Key::Int(b)) => a.cmp(b),
            (Key::Float(a), Key::Float(b)) => a.total_cmp(b),
            (Key::Int(a), Key::Float(b)) => (*a as f64).total_cmp(b),
            (Key::Float(a), Key::Int(b)) => a.total_cmp(&(*b as f64)),
            (Key::Text(a), Key::Text(b)) => a.cmp(b),
            (a, b) => a.tag().cmp(&b.tag()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Key::Int(v) => {
                state.write_u8(0);
                state.write_i64(*v);
            }
            Key::Float(v) => {
                state.write_u8(1);
                state.write_u64(v.to_bits());
            }
            Key::Text(v) => {
                state.write_u8(2);
                state.write(v.as_bytes());
            }
        }
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Int(v) => write!(f, "{}", v),
            Key::Float(v) => write!(f, "{}", v),
            Key::Text(v) => write!(f, "{}", v),
        }
    }
}

/// Fixed-width on-disk layout of one `(key, rid)` entry, used by the
/// file-backed index families. The key is stored in its canonical text
/// form padded to the indexed field's width.
#[derive(Debug, Clone, Copy)]
pub struct EntryCodec {
    pub data_type: DataType,
    pub key_width: usize,
}

impl EntryCodec {
    pub fn new(data_type: DataType, key_width: usize) -> Self {
        EntryCodec {
            data_type,
            key_width,
        }
    }

    pub fn entry_size(&self) -> usize {
        self.key_width + 8
    }

    pub fn encode(&self, key: &Key, rid: Rid, buf: &mut BytesMut) {
        FieldCodec::encode_padded(&key.to_string(), self.key_width, buf);
        buf.extend_from_slice(&CommonCodec::encode_u64(rid));
    }

    pub fn decode(&self, bytes: &[u8]) -> OmnidexResult<(Key, Rid)> {
        if bytes.len() < self.entry_size() {
            return Err(OmnidexError::Internal(format!(
                "entry needs {} bytes, got {}",
                self.entry_size(),
                bytes.len()
            )));
        }
        let key = Key::parse(
            &FieldCodec::decode_padded(&bytes[..self.key_width]),
            self.data_type,
        )?;
        let (rid, _) = CommonCodec::decode_u64(&bytes[self.key_width..])?;
        Ok((key, rid))
    }
}

/// The operations shared by the key-ordered and hashed index families.
/// Indexes store `(key, rid)` entries only; rows are resolved through the
/// record store. The index layer surfaces `NotFound`, `DuplicateKey` and
/// IO errors; predicate/kind mismatches are the engine's concern.
pub trait KeyIndex: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> IndexKind;

    fn insert(&mut self, key: Key, rid: Rid) -> OmnidexResult<()>;

    /// All rids filed under `key`. Empty when absent.
    fn search(&self, key: &Key) -> OmnidexResult<Vec<Rid>>;

    /// Entries with `lo <= key <= hi`, in non-decreasing key order.
    fn range(&self, lo: &Key, hi: &Key) -> OmnidexResult<Vec<(Key, Rid)>>;

    /// Unlink every entry under `key`, returning the rids removed.
    /// Deleting a missing key is a no-op returning an empty vec.
    fn delete(&mut self, key: &Key) -> OmnidexResult<Vec<Rid>>;

    /// Every live entry; in key order for the ordered families.
    fn entries(&self) -> OmnidexResult<Vec<(Key, Rid)>>;

    /// Flush any in-memory snapshot to disk. The file-backed families
    /// persist on every mutation and keep the default no-op.
    fn persist(&self) -> OmnidexResult<()> {
        Ok(())
    }

    fn supports_range(&self) -> bool {
        !matches!(self.kind(), IndexKind::Hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_order_by_declared_type() {
        assert!(Key::Int(9) < Key::Int(10));
        assert!(Key::Float(9.5) < Key::Float(10.0));
        // Lexicographic text ordering, unlike numeric.
        assert!(Key::Text("10".into()) < Key::Text("9".into()));
    }

    #[test]
    fn entry_codec_round_trip() {
        let codec = EntryCodec::new(DataType::Int, 12);
        let mut buf = BytesMut::new();
        codec.encode(&Key::Int(42), 7, &mut buf);
        assert_eq!(buf.len(), codec.entry_size());
        let (key, rid) = codec.decode(&buf).unwrap();
        assert_eq!(key, Key::Int(42));
        assert_eq!(rid, 7);
    }

    #[test]
    fn parse_respects_type() {
        assert_eq!(Key::parse("080", DataType::Int).unwrap(), Key::Int(80));
        assert_eq!(
            Key::parse("80.5", DataType::Float).unwrap(),
            Key::Float(80.5)
        );
        assert!(Key::parse("abc", DataType::Int).is_err());
    }
}
