use crate::{
    bson::{self, Document},
    error::{Error, Result},
};

const CURSOR_NOT_FOUND: i32 = 1;
const QUERY_FAILURE: i32 = 1 << 1;

const REPLY_FIXED_SIZE: usize = 20;

/// Body of an `OP_REPLY` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub response_flags: i32,
    /// Server cursor handle; zero once the server has no more results.
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<Document>,
}

/// Failure conditions signalled through the reply flags.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyFailure {
    /// The cursor id sent with a get-more is unknown to the server.
    CursorNotFound,
    /// The query failed; carries the `$err` document the server sent back.
    QueryFailure(Document),
}

impl Reply {
    /// Parses a reply body (the bytes following the header).
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < REPLY_FIXED_SIZE {
            return Err(Error::InvalidBson(format!(
                "reply body of {} bytes is shorter than its fixed fields",
                body.len()
            )));
        }
        let i32_at = |at: usize| i32::from_le_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]);

        let response_flags = i32_at(0);
        let mut cursor_id = [0; 8];
        cursor_id.copy_from_slice(&body[4..12]);
        let cursor_id = i64::from_le_bytes(cursor_id);
        let starting_from = i32_at(12);
        let number_returned = i32_at(16);

        let documents = bson::decode_all(&body[REPLY_FIXED_SIZE..])?;
        if usize::try_from(number_returned).ok() != Some(documents.len()) {
            return Err(Error::InvalidBson(format!(
                "reply announced {number_returned} documents but carried {}",
                documents.len()
            )));
        }

        Ok(Self {
            response_flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }

    /// Encodes a reply body; the inverse of [`Reply::parse`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(REPLY_FIXED_SIZE);
        body.extend_from_slice(&self.response_flags.to_le_bytes());
        body.extend_from_slice(&self.cursor_id.to_le_bytes());
        body.extend_from_slice(&self.starting_from.to_le_bytes());
        body.extend_from_slice(&self.number_returned.to_le_bytes());
        for document in &self.documents {
            body.extend(bson::encode(document)?);
        }
        Ok(body)
    }

    /// A successful reply carrying `documents` and leaving `cursor_id` open.
    pub fn new(cursor_id: i64, starting_from: i32, documents: Vec<Document>) -> Self {
        Self {
            response_flags: 0,
            cursor_id,
            starting_from,
            number_returned: documents.len() as i32,
            documents,
        }
    }

    /// A query-failure reply carrying `{"$err": message}`.
    pub fn query_failure(message: &str) -> Self {
        let mut error = Document::new();
        error.insert("$err", message);
        Self {
            response_flags: QUERY_FAILURE,
            ..Self::new(0, 0, vec![error])
        }
    }

    pub fn cursor_not_found() -> Self {
        Self {
            response_flags: CURSOR_NOT_FOUND,
            ..Self::new(0, 0, vec![])
        }
    }

    /// Failure signalled by the response flags, if any.
    pub fn failure(&self) -> Option<ReplyFailure> {
        if self.response_flags & CURSOR_NOT_FOUND != 0 {
            return Some(ReplyFailure::CursorNotFound);
        }
        if self.response_flags & QUERY_FAILURE != 0 {
            let error = self.documents.first().cloned().unwrap_or_default();
            return Some(ReplyFailure::QueryFailure(error));
        }
        None
    }
}
