//! Binary document codec ("BSON").
//!
//! This module converts in-memory [`Document`] trees to and from the self-describing,
//! type-tagged byte encoding spoken by the server. It holds no state and performs no I/O;
//! every function either fully succeeds or returns an error before producing output.
//!
//! # Overview
//!
//! - [`Bson`]: the closed set of value variants a document may hold.
//! - [`Document`]: an insertion-ordered map of string keys to [`Bson`] values.
//! - [`ObjectId`]: the 12-byte identifier generated client side.
//! - [`DbRef`]: a reference to a document in another collection.
//! - [`encode`], [`decode`], [`decode_all`], [`is_valid`]: the codec entry points.
//!
//! # Binary Format
//!
//! A document is a 4-byte little-endian total length, a sequence of elements and a single
//! terminating zero byte. Each element is a one byte type tag, a NUL terminated key and a
//! type-specific payload. Arrays are documents whose keys are `"0"`, `"1"`, ... and
//! references are documents with `$ref`/`$id` (and optionally `$db`) keys.
//!
//! An encoded document may not exceed [`MAX_DOCUMENT_SIZE`] bytes.
//!
//! # Example
//! ```rust
//! use tallow::bson::{self, Bson};
//! use tallow::doc;
//!
//! let document = doc! { "_id" => 1, "name" => "a" };
//! let bytes = bson::encode(&document).unwrap();
//! let (decoded, rest) = bson::decode(&bytes).unwrap();
//!
//! assert!(rest.is_empty());
//! assert_eq!(decoded.get("name"), Some(&Bson::from("a")));
//! ```
mod decode;
mod document;
mod encode;
mod oid;

use chrono::{DateTime, Utc};

use crate::error::Error;

pub use decode::{decode, decode_all, is_valid};
pub use document::Document;
pub use encode::{encode, encode_checked, validate_key};
pub use oid::ObjectId;

/// Largest encoded document the server accepts.
pub const MAX_DOCUMENT_SIZE: usize = 4 * 1024 * 1024;

/// Key the server uses as a document's identifier; always serialized first.
pub const ID_KEY: &str = "_id";

pub(crate) mod tag {
    pub(crate) const DOUBLE: u8 = 0x01;
    pub(crate) const STRING: u8 = 0x02;
    pub(crate) const DOCUMENT: u8 = 0x03;
    pub(crate) const ARRAY: u8 = 0x04;
    pub(crate) const BINARY: u8 = 0x05;
    pub(crate) const UNDEFINED: u8 = 0x06;
    pub(crate) const OBJECT_ID: u8 = 0x07;
    pub(crate) const BOOLEAN: u8 = 0x08;
    pub(crate) const DATETIME: u8 = 0x09;
    pub(crate) const NULL: u8 = 0x0A;
    pub(crate) const REGEX: u8 = 0x0B;
    pub(crate) const DB_POINTER: u8 = 0x0C;
    pub(crate) const CODE: u8 = 0x0D;
    pub(crate) const SYMBOL: u8 = 0x0E;
    pub(crate) const CODE_WITH_SCOPE: u8 = 0x0F;
    pub(crate) const INT32: u8 = 0x10;
    pub(crate) const TIMESTAMP: u8 = 0x11;
    pub(crate) const INT64: u8 = 0x12;
    pub(crate) const MIN_KEY: u8 = 0xFF;
    pub(crate) const MAX_KEY: u8 = 0x7F;
}

/// Binary subtypes with a special meaning to the server.
pub mod subtype {
    pub const GENERIC: u8 = 0x00;
    pub const FUNCTION: u8 = 0x01;
    /// Deprecated subtype whose payload carries a second, inner length prefix.
    pub const BINARY_OLD: u8 = 0x02;
    pub const UUID: u8 = 0x03;
    pub const MD5: u8 = 0x05;
    pub const USER_DEFINED: u8 = 0x80;
}

/// A single value stored in a [`Document`].
#[derive(Debug, Clone, PartialEq)]
pub enum Bson {
    Double(f64),
    String(String),
    Document(Document),
    Array(Vec<Bson>),
    Binary { subtype: u8, bytes: Vec<u8> },
    ObjectId(ObjectId),
    Boolean(bool),
    /// UTC timestamp, stored with millisecond precision.
    DateTime(DateTime<Utc>),
    Null,
    RegularExpression { pattern: String, flags: String },
    DbRef(DbRef),
    JavaScriptCode(String),
    Symbol(String),
    JavaScriptCodeWithScope { code: String, scope: Document },
    Int32(i32),
    /// Replication timestamp: seconds since epoch and an ordinal within that second.
    Timestamp { time: u32, increment: u32 },
    Int64(i64),
    MinKey,
    MaxKey,
}

/// Reference to a document identified by `id` inside `collection`, optionally in
/// another `database`.
#[derive(Debug, Clone, PartialEq)]
pub struct DbRef {
    pub collection: String,
    pub id: Box<Bson>,
    pub database: Option<String>,
}

impl DbRef {
    pub fn new(collection: impl Into<String>, id: impl Into<Bson>) -> Self {
        Self {
            collection: collection.into(),
            id: Box::new(id.into()),
            database: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Document form used on the wire.
    pub(crate) fn to_document(&self) -> Document {
        let mut document = Document::new();
        document.insert("$ref", self.collection.as_str());
        document.insert("$id", (*self.id).clone());
        if let Some(database) = &self.database {
            document.insert("$db", database.as_str());
        }
        document
    }

    /// Recognises the `{$ref, $id[, $db]}` shape. Documents carrying any other key stay
    /// plain documents so that no data is dropped.
    pub(crate) fn from_document(document: &Document) -> Option<Self> {
        let collection = document.get_str("$ref")?;
        let id = document.get("$id")?;
        let database = match document.get("$db") {
            Some(Bson::String(db)) => Some(db.clone()),
            Some(_) => return None,
            None => None,
        };
        let expected = 2 + usize::from(database.is_some());
        if document.len() != expected {
            return None;
        }

        Some(Self {
            collection: collection.to_string(),
            id: Box::new(id.clone()),
            database,
        })
    }
}

impl Bson {
    /// The wire type tag for this value.
    pub fn element_type(&self) -> u8 {
        match self {
            Bson::Double(_) => tag::DOUBLE,
            Bson::String(_) => tag::STRING,
            Bson::Document(_) | Bson::DbRef(_) => tag::DOCUMENT,
            Bson::Array(_) => tag::ARRAY,
            Bson::Binary { .. } => tag::BINARY,
            Bson::ObjectId(_) => tag::OBJECT_ID,
            Bson::Boolean(_) => tag::BOOLEAN,
            Bson::DateTime(_) => tag::DATETIME,
            Bson::Null => tag::NULL,
            Bson::RegularExpression { .. } => tag::REGEX,
            Bson::JavaScriptCode(_) => tag::CODE,
            Bson::Symbol(_) => tag::SYMBOL,
            Bson::JavaScriptCodeWithScope { .. } => tag::CODE_WITH_SCOPE,
            Bson::Int32(_) => tag::INT32,
            Bson::Timestamp { .. } => tag::TIMESTAMP,
            Bson::Int64(_) => tag::INT64,
            Bson::MinKey => tag::MIN_KEY,
            Bson::MaxKey => tag::MAX_KEY,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Bson::String(s) | Bson::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Bson::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Bson::Int32(i) => Some(*i),
            _ => None,
        }
    }

    /// Integral view of any numeric value. Doubles are accepted when they hold an
    /// integer, since the server reports counters as doubles.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Bson::Int32(i) => Some(i64::from(*i)),
            Bson::Int64(i) => Some(*i),
            Bson::Double(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Bson::Double(f) => Some(*f),
            Bson::Int32(i) => Some(f64::from(*i)),
            Bson::Int64(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Bson::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Bson]> {
        match self {
            Bson::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object_id(&self) -> Option<&ObjectId> {
        match self {
            Bson::ObjectId(oid) => Some(oid),
            _ => None,
        }
    }

    /// Truthiness the server applies to command replies such as `ok` and `ismaster`.
    pub fn is_truthy(&self) -> bool {
        match self {
            Bson::Boolean(b) => *b,
            Bson::Null => false,
            other => other.as_f64().map(|f| f != 0.0).unwrap_or(true),
        }
    }
}

impl From<f64> for Bson {
    fn from(value: f64) -> Self {
        Bson::Double(value)
    }
}

impl From<&str> for Bson {
    fn from(value: &str) -> Self {
        Bson::String(value.to_string())
    }
}

impl From<String> for Bson {
    fn from(value: String) -> Self {
        Bson::String(value)
    }
}

impl From<Document> for Bson {
    fn from(value: Document) -> Self {
        Bson::Document(value)
    }
}

impl From<bool> for Bson {
    fn from(value: bool) -> Self {
        Bson::Boolean(value)
    }
}

impl From<i32> for Bson {
    fn from(value: i32) -> Self {
        Bson::Int32(value)
    }
}

impl From<u32> for Bson {
    fn from(value: u32) -> Self {
        Bson::from(i64::from(value))
    }
}

/// Picks the narrowest integer width that holds `value`.
impl From<i64> for Bson {
    fn from(value: i64) -> Self {
        match i32::try_from(value) {
            Ok(small) => Bson::Int32(small),
            Err(_) => Bson::Int64(value),
        }
    }
}

impl TryFrom<u64> for Bson {
    type Error = Error;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        i64::try_from(value).map(Bson::from).map_err(|_| overflow())
    }
}

impl TryFrom<i128> for Bson {
    type Error = Error;

    fn try_from(value: i128) -> Result<Self, Self::Error> {
        i64::try_from(value).map(Bson::from).map_err(|_| overflow())
    }
}

fn overflow() -> Error {
    Error::InvalidDocument("integer overflow: can only handle up to 8-byte ints".into())
}

impl From<ObjectId> for Bson {
    fn from(value: ObjectId) -> Self {
        Bson::ObjectId(value)
    }
}

impl From<DateTime<Utc>> for Bson {
    fn from(value: DateTime<Utc>) -> Self {
        Bson::DateTime(value)
    }
}

impl From<DbRef> for Bson {
    fn from(value: DbRef) -> Self {
        Bson::DbRef(value)
    }
}

impl<T: Into<Bson>> From<Vec<T>> for Bson {
    fn from(value: Vec<T>) -> Self {
        Bson::Array(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Bson>> From<Option<T>> for Bson {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Bson::Null)
    }
}

/// Builds a [`Document`] from `key => value` pairs, preserving their order.
///
/// ```rust
/// use tallow::doc;
///
/// let filter = doc! { "name" => "a", "age" => doc! { "$gt" => 3 } };
/// assert_eq!(filter.keys().collect::<Vec<_>>(), vec!["name", "age"]);
/// ```
#[macro_export]
macro_rules! doc {
    () => {
        $crate::bson::Document::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut document = $crate::bson::Document::new();
        $(
            document.insert($key, $value);
        )+
        document
    }};
}
