use rand::Rng;

use crate::{
    bson::{self, Document},
    error::{Error, Result},
};

use super::{HEADER_SIZE, QueryFlags, opcode};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct InsertFlags: i32 {
        const CONTINUE_ON_ERROR = 1;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct UpdateFlags: i32 {
        const UPSERT = 1;
        const MULTI = 1 << 1;
    }
}

/// An encoded request ready to be written to a socket.
///
/// The request id identifies the frame the server's reply will answer. For acknowledged
/// writes this is the id of the trailing `getlasterror` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    request_id: i32,
    bytes: Vec<u8>,
    acknowledged: bool,
}

impl WireMessage {
    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// True when a `getlasterror` frame was appended, i.e. the server will reply.
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    fn single(opcode: i32, body: &[u8]) -> Result<Self> {
        let (request_id, bytes) = frame(opcode, body)?;
        Ok(Self {
            request_id,
            bytes,
            acknowledged: false,
        })
    }

    /// Appends a `getlasterror` query for the database `namespace` belongs to.
    fn acknowledge(mut self, options: Option<&Document>) -> Result<Self> {
        let Some(options) = options else {
            return Ok(self);
        };
        let last_error = last_error(options)?;
        self.bytes.extend_from_slice(last_error.as_bytes());
        self.request_id = last_error.request_id;
        self.acknowledged = true;
        Ok(self)
    }
}

/// Prefixes `body` with a header carrying a fresh random request id.
fn frame(opcode: i32, body: &[u8]) -> Result<(i32, Vec<u8>)> {
    let request_id: i32 = rand::thread_rng().r#gen();
    let len = i32::try_from(HEADER_SIZE + body.len())
        .map_err(|_| Error::InvalidDocument("message length overflows 32 bits".into()))?;

    let mut bytes = Vec::with_capacity(HEADER_SIZE + body.len());
    bytes.extend_from_slice(&len.to_le_bytes());
    bytes.extend_from_slice(&request_id.to_le_bytes());
    bytes.extend_from_slice(&0_i32.to_le_bytes());
    bytes.extend_from_slice(&opcode.to_le_bytes());
    bytes.extend_from_slice(body);
    Ok((request_id, bytes))
}

/// Splits `"db.collection"` at the first dot.
pub fn split_namespace(namespace: &str) -> Result<(&str, &str)> {
    match namespace.split_once('.') {
        Some((db, collection))
            if !db.is_empty() && !collection.is_empty() && !namespace.contains('\0') =>
        {
            Ok((db, collection))
        }
        _ => Err(Error::InvalidName(format!(
            "{namespace:?} is not a valid namespace, expected \"database.collection\""
        ))),
    }
}

/// The command namespace (`"<db>.$cmd"`) for a database.
pub fn command_namespace(db: &str) -> String {
    format!("{db}.$cmd")
}

fn write_cstring(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// `OP_INSERT` for one or more documents.
///
/// `check_keys` rejects keys that cannot be stored (see
/// [`validate_key`](crate::bson::validate_key)). When `ack` is given, the write is followed
/// by a `getlasterror` query built from those options.
pub fn insert(
    namespace: &str,
    documents: &[Document],
    check_keys: bool,
    continue_on_error: bool,
    ack: Option<&Document>,
) -> Result<WireMessage> {
    split_namespace(namespace)?;
    if documents.is_empty() {
        return Err(Error::InvalidOperation("cannot do an empty bulk insert".into()));
    }

    let mut flags = InsertFlags::empty();
    flags.set(InsertFlags::CONTINUE_ON_ERROR, continue_on_error);
    let mut body = Vec::new();
    body.extend_from_slice(&flags.bits().to_le_bytes());
    write_cstring(&mut body, namespace);
    for document in documents {
        body.extend(bson::encode_checked(document, check_keys)?);
    }

    WireMessage::single(opcode::INSERT, &body)?.acknowledge(ack)
}

/// `OP_UPDATE` applying `update_doc` to documents matching `filter`.
pub fn update(
    namespace: &str,
    upsert: bool,
    multi: bool,
    filter: &Document,
    update_doc: &Document,
    ack: Option<&Document>,
) -> Result<WireMessage> {
    split_namespace(namespace)?;

    let mut flags = UpdateFlags::empty();
    flags.set(UpdateFlags::UPSERT, upsert);
    flags.set(UpdateFlags::MULTI, multi);
    let mut body = Vec::new();
    body.extend_from_slice(&0_i32.to_le_bytes());
    write_cstring(&mut body, namespace);
    body.extend_from_slice(&flags.bits().to_le_bytes());
    body.extend(bson::encode(filter)?);
    body.extend(bson::encode(update_doc)?);

    WireMessage::single(opcode::UPDATE, &body)?.acknowledge(ack)
}

/// `OP_DELETE` removing every document matching `filter`.
pub fn delete(namespace: &str, filter: &Document, ack: Option<&Document>) -> Result<WireMessage> {
    split_namespace(namespace)?;

    let mut body = Vec::new();
    body.extend_from_slice(&0_i32.to_le_bytes());
    write_cstring(&mut body, namespace);
    body.extend_from_slice(&0_i32.to_le_bytes());
    body.extend(bson::encode(filter)?);

    WireMessage::single(opcode::DELETE, &body)?.acknowledge(ack)
}

/// `OP_QUERY`. A negative `limit` asks for a single batch after which the server closes
/// the cursor.
pub fn query(
    flags: QueryFlags,
    namespace: &str,
    skip: i32,
    limit: i32,
    filter: &Document,
    projection: Option<&Document>,
) -> Result<WireMessage> {
    split_namespace(namespace)?;

    let mut body = Vec::new();
    body.extend_from_slice(&flags.bits().to_le_bytes());
    write_cstring(&mut body, namespace);
    body.extend_from_slice(&skip.to_le_bytes());
    body.extend_from_slice(&limit.to_le_bytes());
    body.extend(bson::encode(filter)?);
    if let Some(projection) = projection {
        body.extend(bson::encode(projection)?);
    }

    WireMessage::single(opcode::QUERY, &body)
}

/// `OP_GET_MORE` for the next `batch_size` results of `cursor_id`; zero lets the server
/// pick the batch size.
pub fn get_more(namespace: &str, batch_size: i32, cursor_id: i64) -> Result<WireMessage> {
    split_namespace(namespace)?;

    let mut body = Vec::new();
    body.extend_from_slice(&0_i32.to_le_bytes());
    write_cstring(&mut body, namespace);
    body.extend_from_slice(&batch_size.to_le_bytes());
    body.extend_from_slice(&cursor_id.to_le_bytes());

    WireMessage::single(opcode::GET_MORE, &body)
}

/// `OP_KILL_CURSORS` releasing the given server-side cursors.
pub fn kill_cursors(cursor_ids: &[i64]) -> Result<WireMessage> {
    let count = i32::try_from(cursor_ids.len())
        .map_err(|_| Error::InvalidOperation("too many cursors to kill at once".into()))?;

    let mut body = Vec::with_capacity(8 + cursor_ids.len() * 8);
    body.extend_from_slice(&0_i32.to_le_bytes());
    body.extend_from_slice(&count.to_le_bytes());
    for id in cursor_ids {
        body.extend_from_slice(&id.to_le_bytes());
    }

    WireMessage::single(opcode::KILL_CURSORS, &body)
}

/// Query for `{getlasterror: 1}` merged with write-concern `options` (`w`, `wtimeout`,
/// `fsync`, `j`).
pub fn last_error(options: &Document) -> Result<WireMessage> {
    let mut command = Document::with_capacity(options.len() + 1);
    command.insert("getlasterror", 1);
    for (key, value) in options.iter() {
        command.insert(key, value.clone());
    }
    query(
        QueryFlags::NONE,
        &command_namespace("admin"),
        0,
        -1,
        &command,
        None,
    )
}
