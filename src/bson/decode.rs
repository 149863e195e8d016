use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

use super::{Bson, DbRef, Document, ObjectId, subtype, tag};

/// Nesting depth past which input is treated as malformed.
const MAX_DEPTH: usize = 100;

/// Decodes the first document in `bytes`, returning it together with the unread rest.
///
/// # Errors
///
/// Fails with [`Error::InvalidBson`] when the declared length exceeds the buffer, a
/// string is not NUL terminated or not UTF-8, a boolean is neither 0 nor 1, an element
/// type is unknown or the trailing terminator byte is missing.
pub fn decode(bytes: &[u8]) -> Result<(Document, &[u8])> {
    let len = document_length(bytes)?;
    let document = Reader::new(&bytes[..len], 0).document()?;
    Ok((document, &bytes[len..]))
}

/// Decodes back-to-back documents until `bytes` is consumed. A trailing partial
/// document is an error.
pub fn decode_all(mut bytes: &[u8]) -> Result<Vec<Document>> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        let (document, rest) = decode(bytes)?;
        out.push(document);
        bytes = rest;
    }
    Ok(out)
}

/// Reports whether [`decode_all`] would accept `bytes`. Never fails.
pub fn is_valid(bytes: &[u8]) -> bool {
    decode_all(bytes).is_ok()
}

fn invalid(reason: impl Into<String>) -> Error {
    Error::InvalidBson(reason.into())
}

/// Validates the length prefix of the document starting at `bytes[0]`.
fn document_length(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < 5 {
        return Err(invalid(format!(
            "not enough data for a document ({} bytes)",
            bytes.len()
        )));
    }
    let declared = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let len = usize::try_from(declared)
        .ok()
        .filter(|len| *len >= 5)
        .ok_or_else(|| invalid(format!("invalid document length {declared}")))?;
    if len > bytes.len() {
        return Err(invalid(format!(
            "declared document length {len} exceeds the {} available bytes",
            bytes.len()
        )));
    }
    if bytes[len - 1] != 0 {
        return Err(invalid("bad eoo: document is not terminated by a zero byte"));
    }
    Ok(len)
}

/// Cursor over exactly one encoded document (length prefix and terminator included).
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], depth: usize) -> Self {
        Self {
            bytes,
            pos: 0,
            depth,
        }
    }

    fn document(mut self) -> Result<Document> {
        if self.depth > MAX_DEPTH {
            return Err(invalid("documents nested too deeply"));
        }
        self.pos = 4;
        let end = self.bytes.len() - 1;
        let mut document = Document::new();

        while self.pos < end {
            let kind = self.u8()?;
            let key = self.cstring()?;
            let value = self.value(kind)?;
            document.insert(key, value);
        }
        if self.pos != end {
            return Err(invalid("element overran the document length"));
        }
        Ok(document)
    }

    fn value(&mut self, kind: u8) -> Result<Bson> {
        Ok(match kind {
            tag::DOUBLE => Bson::Double(f64::from_le_bytes(self.array()?)),
            tag::STRING => Bson::String(self.string()?),
            tag::DOCUMENT => {
                let document = self.embedded()?;
                match DbRef::from_document(&document) {
                    Some(reference) => Bson::DbRef(reference),
                    None => Bson::Document(document),
                }
            }
            tag::ARRAY => Bson::Array(self.embedded()?.into_iter().map(|(_, v)| v).collect()),
            tag::BINARY => self.binary()?,
            tag::UNDEFINED => Bson::Null,
            tag::OBJECT_ID => Bson::ObjectId(ObjectId::from_bytes(self.array()?)),
            tag::BOOLEAN => match self.u8()? {
                0 => Bson::Boolean(false),
                1 => Bson::Boolean(true),
                other => return Err(invalid(format!("invalid boolean value {other}"))),
            },
            tag::DATETIME => {
                let millis = i64::from_le_bytes(self.array()?);
                let time: DateTime<Utc> = DateTime::from_timestamp_millis(millis)
                    .ok_or_else(|| invalid(format!("date {millis} out of range")))?;
                Bson::DateTime(time)
            }
            tag::NULL => Bson::Null,
            tag::REGEX => Bson::RegularExpression {
                pattern: self.cstring()?,
                flags: self.cstring()?,
            },
            tag::DB_POINTER => {
                let collection = self.string()?;
                let oid = ObjectId::from_bytes(self.array()?);
                Bson::DbRef(DbRef::new(collection, oid))
            }
            tag::CODE => Bson::JavaScriptCode(self.string()?),
            tag::SYMBOL => Bson::Symbol(self.string()?),
            tag::CODE_WITH_SCOPE => {
                let start = self.pos;
                let total = self.i32()?;
                let code = self.string()?;
                let scope = self.embedded()?;
                if usize::try_from(total).ok() != Some(self.pos - start) {
                    return Err(invalid("code with scope length mismatch"));
                }
                Bson::JavaScriptCodeWithScope { code, scope }
            }
            tag::INT32 => Bson::Int32(self.i32()?),
            tag::TIMESTAMP => {
                let increment = u32::from_le_bytes(self.array()?);
                let time = u32::from_le_bytes(self.array()?);
                Bson::Timestamp { time, increment }
            }
            tag::INT64 => Bson::Int64(i64::from_le_bytes(self.array()?)),
            tag::MIN_KEY => Bson::MinKey,
            tag::MAX_KEY => Bson::MaxKey,
            other => return Err(invalid(format!("unknown element type 0x{other:02X}"))),
        })
    }

    fn embedded(&mut self) -> Result<Document> {
        let rest = &self.bytes[self.pos..self.bytes.len() - 1];
        let len = document_length(rest)?;
        let document = Reader::new(&rest[..len], self.depth + 1).document()?;
        self.pos += len;
        Ok(document)
    }

    fn binary(&mut self) -> Result<Bson> {
        let len = self.length()?;
        let kind = self.u8()?;
        let bytes = if kind == subtype::BINARY_OLD {
            let inner = self.length()?;
            if inner + 4 != len {
                return Err(invalid("old binary inner length mismatch"));
            }
            self.take(inner)?
        } else {
            self.take(len)?
        };
        Ok(Bson::Binary {
            subtype: kind,
            bytes: bytes.to_vec(),
        })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end < self.bytes.len())
            .ok_or_else(|| invalid("element overran the document length"))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take(N)?;
        let mut out = [0; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn length(&mut self) -> Result<usize> {
        let len = self.i32()?;
        usize::try_from(len).map_err(|_| invalid(format!("negative length {len}")))
    }

    fn cstring(&mut self) -> Result<String> {
        let rest = &self.bytes[self.pos..self.bytes.len() - 1];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| invalid("string is not NUL terminated"))?;
        let s = utf8(&rest[..nul])?;
        self.pos += nul + 1;
        Ok(s)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.length()?;
        if len == 0 {
            return Err(invalid("string length must include the terminator"));
        }
        let bytes = self.take(len)?;
        let (body, last) = bytes.split_at(len - 1);
        if last != [0] {
            return Err(invalid("string is not NUL terminated"));
        }
        utf8(body)
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| invalid(format!("invalid utf-8: {e}")))
}
