//! Paged query results.
//!
//! # Overview
//!
//! A [`Cursor`] turns one query into a stream of documents. Nothing is sent until the
//! first call to [`Cursor::advance`] (or the first item of [`Cursor::documents`]); from then on the
//! cursor refills its buffer with get-more requests whenever it runs dry, until the server
//! reports a zero handle or the configured limit is reached.
//!
//! # Lifecycle
//!
//! ```text
//! Unstarted --advance--> Active --zero handle, empty buffer--> Exhausted
//!     |                    |
//!     +-----close/drop-----+-----------------------------------> Killed
//! ```
//!
//! Configuration methods only work while [`CursorState::Unstarted`]. A cursor that still
//! holds a live server handle when it is closed or dropped hands that handle to the
//! connection's [`CursorManager`](crate::connection::CursorManager) exactly once, on the
//! slot the query ran on when the cursor is tailable or its thread is pinned.
//!
//! # Limits
//!
//! A positive limit caps the total number of documents; once reached the server cursor is
//! killed even if it could return more. A negative limit asks for a single batch of at most
//! that many documents and never issues a get-more.
use std::collections::VecDeque;

use log::{debug, warn};

use crate::{
    bson::{Bson, Document},
    connection::Connection,
    doc,
    error::{Error, Result},
    protocol::{self, QueryFlags, Reply},
};

/// Where a cursor is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Unstarted,
    Active,
    Exhausted,
    Killed,
}

pub struct Cursor {
    connection: Connection,
    namespace: String,
    filter: Document,
    projection: Option<Document>,
    skip: i32,
    limit: i32,
    batch_size: i32,
    ordering: Option<Document>,
    hint: Option<Document>,
    explain: bool,
    snapshot: bool,
    flags: QueryFlags,

    buffer: VecDeque<Document>,
    /// `None` until the query was sent; zero once the server closed its side.
    id: Option<i64>,
    retrieved: usize,
    killed: bool,
    /// Slot later requests must reuse.
    slot: Option<usize>,
}

impl Cursor {
    /// Creates an unstarted cursor over `namespace` (`"db.collection"`).
    pub fn new(
        connection: &Connection,
        namespace: &str,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Self> {
        protocol::split_namespace(namespace)?;
        let mut flags = QueryFlags::NONE;
        flags.set(QueryFlags::SLAVE_OK, connection.options().slave_okay);

        Ok(Self {
            connection: connection.clone(),
            namespace: namespace.to_string(),
            filter,
            projection,
            skip: 0,
            limit: 0,
            batch_size: 0,
            ordering: None,
            hint: None,
            explain: false,
            snapshot: false,
            flags,
            buffer: VecDeque::new(),
            id: None,
            retrieved: 0,
            killed: false,
            slot: None,
        })
    }

    /// Caps the number of results. Zero means no limit; a negative value returns a
    /// single batch of at most that many documents.
    pub fn limit(&mut self, limit: i32) -> Result<&mut Self> {
        self.check_unstarted()?;
        self.limit = limit;
        Ok(self)
    }

    pub fn skip(&mut self, skip: i32) -> Result<&mut Self> {
        self.check_unstarted()?;
        if skip < 0 {
            return Err(Error::InvalidOperation("skip must be >= 0".into()));
        }
        self.skip = skip;
        Ok(self)
    }

    /// Orders results, e.g. `doc! { "age" => -1 }`.
    pub fn sort(&mut self, ordering: Document) -> Result<&mut Self> {
        self.check_unstarted()?;
        self.ordering = Some(ordering);
        Ok(self)
    }

    /// Forces the server to use the given index.
    pub fn hint(&mut self, index: Document) -> Result<&mut Self> {
        self.check_unstarted()?;
        self.hint = Some(index);
        Ok(self)
    }

    /// Adds a `$where` JavaScript predicate to the filter.
    pub fn where_clause(&mut self, code: &str) -> Result<&mut Self> {
        self.check_unstarted()?;
        self.filter
            .insert("$where", Bson::JavaScriptCode(code.to_string()));
        Ok(self)
    }

    /// Number of documents requested per round trip; zero lets the server decide.
    pub fn batch_size(&mut self, batch_size: i32) -> Result<&mut Self> {
        self.check_unstarted()?;
        if batch_size < 0 {
            return Err(Error::InvalidOperation("batch size must be >= 0".into()));
        }
        self.batch_size = batch_size;
        Ok(self)
    }

    /// Keeps the cursor open after the last result so later inserts can be read.
    pub fn tailable(&mut self, enabled: bool) -> Result<&mut Self> {
        self.set_flag(QueryFlags::TAILABLE_CURSOR, enabled)
    }

    pub fn no_timeout(&mut self, enabled: bool) -> Result<&mut Self> {
        self.set_flag(QueryFlags::NO_CURSOR_TIMEOUT, enabled)
    }

    pub fn slave_okay(&mut self, enabled: bool) -> Result<&mut Self> {
        self.set_flag(QueryFlags::SLAVE_OK, enabled)
    }

    pub fn snapshot(&mut self, enabled: bool) -> Result<&mut Self> {
        self.check_unstarted()?;
        self.snapshot = enabled;
        Ok(self)
    }

    fn set_flag(&mut self, flag: QueryFlags, enabled: bool) -> Result<&mut Self> {
        self.check_unstarted()?;
        self.flags.set(flag, enabled);
        Ok(self)
    }

    pub fn state(&self) -> CursorState {
        match self.id {
            _ if self.killed => CursorState::Killed,
            None => CursorState::Unstarted,
            Some(0) if self.buffer.is_empty() => CursorState::Exhausted,
            Some(_) => CursorState::Active,
        }
    }

    /// True while more documents may still arrive. A tailable cursor stays alive after
    /// an empty get-more.
    pub fn alive(&self) -> bool {
        matches!(self.state(), CursorState::Unstarted | CursorState::Active)
    }

    /// The server-side handle; `None` before the query was sent.
    pub fn cursor_id(&self) -> Option<i64> {
        self.id
    }

    /// Documents received from the server so far.
    pub fn retrieved(&self) -> usize {
        self.retrieved
    }

    /// Returns the next document, fetching a batch if the buffer is empty.
    ///
    /// `Ok(None)` means no document is available right now. For a tailable cursor that is
    /// still [`alive`](Cursor::alive), polling again later may yield more.
    ///
    /// # Errors
    ///
    /// Query and connection failures; the cursor is unusable afterwards.
    pub fn advance(&mut self) -> Result<Option<Document>> {
        if self.killed {
            return Ok(None);
        }
        if self.buffer.is_empty() {
            if let Err(e) = self.refresh() {
                self.killed = true;
                self.id = Some(0);
                return Err(e);
            }
        }
        Ok(self.buffer.pop_front())
    }

    /// Iterates the remaining documents through [`Cursor::advance`].
    pub fn documents(&mut self) -> Documents<'_> {
        Documents { cursor: self }
    }

    fn refresh(&mut self) -> Result<()> {
        let Some(id) = self.id else {
            return self.send_query();
        };
        if id == 0 || self.limit < 0 {
            return Ok(());
        }
        if self.limit_reached() {
            self.kill_server_cursor();
            return Ok(());
        }

        let message = protocol::get_more(&self.namespace, self.next_batch_size(), id)?;
        let (reply, _) = self.connection.query_reply(&message, self.slot)?;
        self.absorb(reply);
        Ok(())
    }

    fn send_query(&mut self) -> Result<()> {
        let message = protocol::query(
            self.flags,
            &self.namespace,
            self.skip,
            self.first_batch_size(),
            &self.query_document(),
            self.projection.as_ref(),
        )?;
        let (reply, slot) = self.connection.query_reply(&message, None)?;
        if self.flags.contains(QueryFlags::TAILABLE_CURSOR)
            || self.connection.pinned_slot().is_some()
        {
            self.slot = Some(slot);
        }
        debug!(
            "query on {} returned {} documents, cursor {}",
            self.namespace, reply.number_returned, reply.cursor_id
        );
        self.absorb(reply);
        Ok(())
    }

    /// Buffers a batch, clipped to what the limit still allows.
    fn absorb(&mut self, reply: Reply) {
        let mut documents = reply.documents;
        if self.limit != 0 {
            let allowed = (self.limit.unsigned_abs() as usize).saturating_sub(self.retrieved);
            documents.truncate(allowed);
        }
        self.retrieved += documents.len();
        self.buffer.extend(documents);
        self.id = Some(reply.cursor_id);

        if reply.cursor_id != 0 && (self.limit < 0 || self.limit_reached()) {
            self.kill_server_cursor();
        }
    }

    fn limit_reached(&self) -> bool {
        self.limit > 0 && self.retrieved >= self.limit as usize
    }

    /// `ntoreturn` of the initial query.
    fn first_batch_size(&self) -> i32 {
        if self.explain || self.limit < 0 {
            return self.limit;
        }
        match (self.limit, self.batch_size) {
            (0, batch) => batch,
            (limit, 0) => limit,
            (limit, batch) => limit.min(batch),
        }
    }

    /// `n` of a get-more: what the limit still allows, capped by the batch size.
    fn next_batch_size(&self) -> i32 {
        if self.limit == 0 {
            return self.batch_size;
        }
        let remaining = i32::try_from(self.limit as usize - self.retrieved).unwrap_or(i32::MAX);
        if self.batch_size == 0 {
            remaining
        } else {
            remaining.min(self.batch_size)
        }
    }

    /// The query document, wrapped in `$query` when modifiers are present.
    fn query_document(&self) -> Document {
        if self.ordering.is_none() && self.hint.is_none() && !self.explain && !self.snapshot {
            return self.filter.clone();
        }
        let mut wrapped = doc! { "$query" => self.filter.clone() };
        if let Some(ordering) = &self.ordering {
            wrapped.insert("$orderby", ordering.clone());
        }
        if let Some(hint) = &self.hint {
            wrapped.insert("$hint", hint.clone());
        }
        if self.explain {
            wrapped.insert("$explain", true);
        }
        if self.snapshot {
            wrapped.insert("$snapshot", true);
        }
        wrapped
    }

    /// Hands a live server handle to the connection, at most once.
    fn kill_server_cursor(&mut self) {
        let Some(id) = self.id.filter(|id| *id != 0) else {
            return;
        };
        self.id = Some(0);
        if let Err(e) = self.connection.close_cursor_on(id, self.slot) {
            warn!("failed to kill cursor {id}: {e}");
        }
    }

    /// Releases the server cursor and discards buffered documents.
    pub fn close(&mut self) {
        self.kill_server_cursor();
        self.buffer.clear();
        self.killed = true;
    }

    /// Kills any live server cursor and returns to the unstarted state with the same
    /// query.
    pub fn rewind(&mut self) -> &mut Self {
        self.kill_server_cursor();
        self.buffer.clear();
        self.id = None;
        self.retrieved = 0;
        self.killed = false;
        self.slot = None;
        self
    }

    /// A fresh unstarted cursor with the same query and options.
    pub fn clone_query(&self) -> Cursor {
        Cursor {
            connection: self.connection.clone(),
            namespace: self.namespace.clone(),
            filter: self.filter.clone(),
            projection: self.projection.clone(),
            skip: self.skip,
            limit: self.limit,
            batch_size: self.batch_size,
            ordering: self.ordering.clone(),
            hint: self.hint.clone(),
            explain: self.explain,
            snapshot: self.snapshot,
            flags: self.flags,
            buffer: VecDeque::new(),
            id: None,
            retrieved: 0,
            killed: false,
            slot: None,
        }
    }

    /// The server's query plan for this cursor. The plan is fetched with a single-batch
    /// copy of the query, leaving this cursor untouched.
    pub fn explain(&self) -> Result<Document> {
        self.check_unstarted()?;
        let mut plan = self.clone_query();
        plan.explain = true;
        plan.limit = -plan.limit.saturating_abs().max(1);
        plan.advance()?
            .ok_or_else(|| Error::operation("explain returned no document", None))
    }

    /// Counts matching documents with the `count` command, independent of the cursor's
    /// position. With `with_limit_and_skip` the cursor's own skip and limit apply.
    pub fn count(&self, with_limit_and_skip: bool) -> Result<i64> {
        let (db, collection) = protocol::split_namespace(&self.namespace)?;
        let mut command = doc! {
            "count" => collection,
            "query" => self.filter.clone(),
        };
        if let Some(projection) = &self.projection {
            command.insert("fields", projection.clone());
        }
        if with_limit_and_skip {
            if self.limit != 0 {
                command.insert("limit", self.limit);
            }
            if self.skip != 0 {
                command.insert("skip", self.skip);
            }
        }

        let answer = self.connection.command(db, &command, &["ns missing"])?;
        if answer.get_str("errmsg") == Some("ns missing") {
            return Ok(0);
        }
        answer
            .get_i64("n")
            .ok_or_else(|| Error::operation("count returned no n", None))
    }

    /// Distinct values of `key` among documents matching the filter.
    pub fn distinct(&self, key: &str) -> Result<Vec<Bson>> {
        let (db, collection) = protocol::split_namespace(&self.namespace)?;
        let command = doc! {
            "distinct" => collection,
            "key" => key,
            "query" => self.filter.clone(),
        };
        let answer = self.connection.command(db, &command, &[])?;
        Ok(answer.get_array("values").unwrap_or_default().to_vec())
    }

    fn check_unstarted(&self) -> Result<()> {
        if self.id.is_some() || self.killed {
            return Err(Error::InvalidOperation(
                "cannot set options after executing query".into(),
            ));
        }
        Ok(())
    }
}

/// Borrowing iterator over a cursor's documents, see [`Cursor::documents`].
pub struct Documents<'a> {
    cursor: &'a mut Cursor,
}

impl Iterator for Documents<'_> {
    type Item = Result<Document>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.advance().transpose()
    }
}

impl<'a> IntoIterator for &'a mut Cursor {
    type Item = Result<Document>;
    type IntoIter = Documents<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.documents()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.kill_server_cursor();
    }
}
