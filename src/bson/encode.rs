use crate::error::{Error, Result};

use super::{Bson, Document, ID_KEY, MAX_DOCUMENT_SIZE, subtype, tag};

/// Encodes `document`, writing its `_id` first when present.
///
/// # Errors
///
/// Fails with [`Error::InvalidDocument`] when the result would exceed
/// [`MAX_DOCUMENT_SIZE`] or a key or C-string contains a NUL byte.
pub fn encode(document: &Document) -> Result<Vec<u8>> {
    encode_checked(document, false)
}

/// Same as [`encode`]; when `check_keys` is set every key, at any depth, must also be a
/// legal field name for stored documents (see [`validate_key`]).
pub fn encode_checked(document: &Document, check_keys: bool) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    write_document(&mut buf, document, check_keys, true)?;

    if buf.len() > MAX_DOCUMENT_SIZE {
        return Err(Error::InvalidDocument(format!(
            "document too large ({} bytes), documents are limited to {MAX_DOCUMENT_SIZE} bytes",
            buf.len()
        )));
    }
    Ok(buf)
}

/// Rejects keys the server refuses to store: a leading `$` or an embedded `.`.
pub fn validate_key(key: &str) -> Result<()> {
    if key.starts_with('$') {
        return Err(Error::InvalidName(format!("key {key:?} must not start with '$'")));
    }
    if key.contains('.') {
        return Err(Error::InvalidName(format!("key {key:?} must not contain '.'")));
    }
    Ok(())
}

fn write_document(
    buf: &mut Vec<u8>,
    document: &Document,
    check_keys: bool,
    top_level: bool,
) -> Result<()> {
    let start = buf.len();
    buf.extend_from_slice(&[0; 4]);

    if top_level {
        if let Some(id) = document.get(ID_KEY) {
            write_element(buf, ID_KEY, id, check_keys)?;
        }
    }
    for (key, value) in document.iter() {
        if top_level && key == ID_KEY {
            continue;
        }
        write_element(buf, key, value, check_keys)?;
    }
    buf.push(0);

    patch_length(buf, start)
}

fn write_array(buf: &mut Vec<u8>, values: &[Bson], check_keys: bool) -> Result<()> {
    let start = buf.len();
    buf.extend_from_slice(&[0; 4]);
    for (i, value) in values.iter().enumerate() {
        write_element(buf, &i.to_string(), value, check_keys)?;
    }
    buf.push(0);

    patch_length(buf, start)
}

/// Writes the byte count from `start` to the end of `buf` into the 4 bytes at `start`.
fn patch_length(buf: &mut [u8], start: usize) -> Result<()> {
    let len = i32::try_from(buf.len() - start)
        .map_err(|_| Error::InvalidDocument("document length overflows 32 bits".into()))?;
    buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
    Ok(())
}

fn write_element(buf: &mut Vec<u8>, key: &str, value: &Bson, check_keys: bool) -> Result<()> {
    if check_keys {
        validate_key(key)?;
    }
    buf.push(value.element_type());
    write_cstring(buf, key).map_err(|_| {
        Error::InvalidDocument(format!("key {key:?} must not contain a NUL character"))
    })?;

    match value {
        Bson::Double(f) => buf.extend_from_slice(&f.to_le_bytes()),
        Bson::String(s) | Bson::JavaScriptCode(s) | Bson::Symbol(s) => write_string(buf, s)?,
        Bson::Document(d) => write_document(buf, d, check_keys, false)?,
        Bson::DbRef(reference) => write_document(buf, &reference.to_document(), false, false)?,
        Bson::Array(values) => write_array(buf, values, check_keys)?,
        Bson::Binary { subtype, bytes } => write_binary(buf, *subtype, bytes)?,
        Bson::ObjectId(oid) => buf.extend_from_slice(&oid.bytes()),
        Bson::Boolean(b) => buf.push(u8::from(*b)),
        // Sub-millisecond precision is dropped.
        Bson::DateTime(time) => buf.extend_from_slice(&time.timestamp_millis().to_le_bytes()),
        Bson::Null | Bson::MinKey | Bson::MaxKey => {}
        Bson::RegularExpression { pattern, flags } => {
            write_cstring(buf, pattern).map_err(|_| {
                Error::InvalidStringData("regex patterns must not contain a NUL character".into())
            })?;
            write_cstring(buf, flags).map_err(|_| {
                Error::InvalidStringData("regex flags must not contain a NUL character".into())
            })?;
        }
        Bson::JavaScriptCodeWithScope { code, scope } => {
            let start = buf.len();
            buf.extend_from_slice(&[0; 4]);
            write_string(buf, code)?;
            write_document(buf, scope, false, false)?;
            patch_length(buf, start)?;
        }
        Bson::Int32(i) => buf.extend_from_slice(&i.to_le_bytes()),
        Bson::Timestamp { time, increment } => {
            buf.extend_from_slice(&increment.to_le_bytes());
            buf.extend_from_slice(&time.to_le_bytes());
        }
        Bson::Int64(i) => buf.extend_from_slice(&i.to_le_bytes()),
    }
    Ok(())
}

fn write_cstring(buf: &mut Vec<u8>, s: &str) -> std::result::Result<(), ()> {
    if s.as_bytes().contains(&0) {
        return Err(());
    }
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}

fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let len = i32::try_from(s.len() + 1)
        .map_err(|_| Error::InvalidDocument("string length overflows 32 bits".into()))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}

fn write_binary(buf: &mut Vec<u8>, kind: u8, bytes: &[u8]) -> Result<()> {
    let overflow = || Error::InvalidDocument("binary length overflows 32 bits".into());
    let len = i32::try_from(bytes.len()).map_err(|_| overflow())?;

    if kind == subtype::BINARY_OLD {
        let outer = len.checked_add(4).ok_or_else(overflow)?;
        buf.extend_from_slice(&outer.to_le_bytes());
        buf.push(kind);
        buf.extend_from_slice(&len.to_le_bytes());
    } else {
        buf.extend_from_slice(&len.to_le_bytes());
        buf.push(kind);
    }
    buf.extend_from_slice(bytes);
    Ok(())
}
