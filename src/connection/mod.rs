//! Pooled, thread-safe connection to a server or a set of mirrored servers.
//!
//! # Overview
//!
//! A [`Connection`] owns a fixed number of socket slots to the node discovered as master.
//! Every operation locks exactly one slot for one request/response exchange and releases
//! it right after. Sockets are opened lazily on first use of a slot, and a socket that
//! fails mid-exchange is closed before the error is returned, so the next user of the slot
//! reconnects transparently.
//!
//! A server reporting `not master` (through a `getlasterror` acknowledgement or a query
//! failure) triggers a pool reset before the error reaches the caller: every slot is
//! locked, every socket closed, discovery rerun, then the slots are released. Concurrent
//! detections of the same change reset the pool once.
//!
//! # Key Components
//!
//! - [`Connection`]: the cloneable handle shared by threads and cursors.
//! - [`ConnectionOptions`]: nodes, pool size, timeouts and policy flags.
//! - [`CursorManager`]: pluggable policy for releasing server-side cursors.
//!
//! # Request Pinning
//!
//! [`Connection::start_request`] pins the calling thread to one slot until
//! [`Connection::end_request`], so a sequence of operations reaches the server in order
//! over one socket. Pins are tracked per thread and per connection.
//!
//! # See Also
//!
//! - [`protocol`](crate::protocol): the frames sent over the pooled sockets.
//! - [`Cursor`](crate::cursor::Cursor): paged queries on top of a connection.
mod auth;
mod cursor_manager;
mod discovery;
mod index_cache;
mod options;
mod pool;
mod socket;

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

pub use cursor_manager::{BatchCursorManager, CursorManager, ImmediateCursorManager};
pub use options::{ConnectionOptions, DEFAULT_PORT, Node, UriCredentials};

use crate::{
    bson::{Bson, Document},
    doc,
    error::{Error, Result},
    protocol::{self, ProtocolTransport, QueryFlags, Reply, ReplyFailure, WireMessage},
};

use discovery::Discovered;
use index_cache::IndexCache;
use pool::{SlotState, SocketPool, Transport};

const NOT_MASTER: &str = "not master";

/// Cloneable handle to a socket pool; clones share the pool.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Shared>,
}

struct Shared {
    options: ConnectionOptions,
    pool: SocketPool,
    master: RwLock<Option<Discovered>>,
    /// Bumped whenever every socket was closed; lets concurrent failure reports detect
    /// that a reset already happened.
    generation: AtomicU64,
    reset_lock: Mutex<()>,
    discovery_lock: Mutex<()>,
    resets: AtomicUsize,
    closed: AtomicBool,
    cursor_manager: RwLock<Arc<dyn CursorManager>>,
    indexes: IndexCache,
    /// database -> (user, password)
    credentials: Mutex<HashMap<String, (String, String)>>,
}

/// Result of an exchange plus the slot it ran on and the pool generation it saw.
struct Exchanged<R> {
    value: R,
    slot: usize,
    generation: u64,
}

impl Connection {
    /// Builds the pool and, unless deferred, discovers the master right away.
    ///
    /// # Errors
    ///
    /// Invalid options, discovery failures, and failed authentication for credentials
    /// given in the options.
    pub fn new(options: ConnectionOptions) -> Result<Self> {
        options.validate()?;

        let cursor_manager: Arc<dyn CursorManager> = match options.cursor_close_batch {
            Some(threshold) => Arc::new(BatchCursorManager::new(threshold)),
            None => Arc::new(ImmediateCursorManager),
        };
        let connection = Self {
            inner: Arc::new(Shared {
                pool: SocketPool::new(options.pool_size, options.acquire_timeout),
                options,
                master: RwLock::new(None),
                generation: AtomicU64::new(0),
                reset_lock: Mutex::new(()),
                discovery_lock: Mutex::new(()),
                resets: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                cursor_manager: RwLock::new(cursor_manager),
                indexes: IndexCache::default(),
                credentials: Mutex::new(HashMap::new()),
            }),
        };

        if !connection.inner.options.defer_discovery {
            connection.master()?;
        }
        if let Some(credentials) = connection.inner.options.credentials.clone() {
            connection.authenticate(
                &credentials.database,
                &credentials.user,
                &credentials.password,
            )?;
        }
        Ok(connection)
    }

    /// Connects using a `mongodb://` URI or a `host[:port]` shorthand.
    pub fn open(uri: &str) -> Result<Self> {
        Self::new(ConnectionOptions::parse_uri(uri)?)
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Sends a message. Unacknowledged messages return `None` as soon as the bytes are
    /// written; acknowledged ones wait for the `getlasterror` answer and return it.
    ///
    /// # Errors
    ///
    /// - [`Error::OperationFailure`] when the acknowledgement reports an error.
    /// - [`Error::AutoReconnect`] with `"not master"` after the pool was reset because the
    ///   node stepped down.
    /// - Connection failures when the socket broke.
    pub fn send(&self, message: &WireMessage) -> Result<Option<Document>> {
        if !message.is_acknowledged() {
            self.with_slot(None, |slot| {
                transport(slot)?.write_message(message)?;
                Ok(())
            })?;
            debug!("sent unacknowledged request {}", message.request_id());
            return Ok(None);
        }

        let exchanged = self.round_trip(message, None)?;
        let last_error = checked(exchanged.value)?
            .documents
            .into_iter()
            .next()
            .ok_or_else(|| Error::operation("getlasterror returned no document", None))?;
        self.check_last_error(last_error, exchanged.generation)
            .map(Some)
    }

    /// Sends a message and waits for the reply that answers it.
    ///
    /// Query failures other than `not master` are left in the reply for the caller; see
    /// [`Reply::failure`].
    pub fn send_and_receive(&self, message: &WireMessage) -> Result<Reply> {
        self.round_trip(message, None).map(|exchanged| exchanged.value)
    }

    /// Like [`Connection::send_and_receive`] on a chosen slot, with every reply failure
    /// turned into an error. Returns the slot the exchange ran on.
    pub(crate) fn query_reply(
        &self,
        message: &WireMessage,
        affinity: Option<usize>,
    ) -> Result<(Reply, usize)> {
        let exchanged = self.round_trip(message, affinity)?;
        Ok((checked(exchanged.value)?, exchanged.slot))
    }

    /// Pins the calling thread to one socket until [`Connection::end_request`].
    pub fn start_request(&self) -> Result<()> {
        self.check_open()?;
        self.inner.pool.pin();
        Ok(())
    }

    /// Releases the calling thread's pin. Without a pin this does nothing.
    pub fn end_request(&self) {
        self.inner.pool.unpin();
    }

    pub(crate) fn pinned_slot(&self) -> Option<usize> {
        self.inner.pool.pinned()
    }

    /// Hands a dead cursor to the installed [`CursorManager`].
    pub fn close_cursor(&self, cursor_id: i64) -> Result<()> {
        self.close_cursor_on(cursor_id, None)
    }

    pub(crate) fn close_cursor_on(&self, cursor_id: i64, slot: Option<usize>) -> Result<()> {
        let manager = Arc::clone(&*self.inner.cursor_manager.read());
        manager.close(self, cursor_id, slot)
    }

    /// Sends one kill-cursors message, on `slot` when given.
    pub fn kill_cursors(&self, cursor_ids: &[i64], slot: Option<usize>) -> Result<()> {
        if cursor_ids.is_empty() {
            return Ok(());
        }
        let message = protocol::kill_cursors(cursor_ids)?;
        self.with_slot(slot, |state| {
            transport(state)?.write_message(&message)?;
            Ok(())
        })?;
        debug!("killed cursors {cursor_ids:?}");
        Ok(())
    }

    /// Installs a new cursor-closing policy after flushing the current one.
    pub fn set_cursor_manager(&self, manager: impl CursorManager + 'static) -> Result<()> {
        let manager: Arc<dyn CursorManager> = Arc::new(manager);
        let previous = std::mem::replace(&mut *self.inner.cursor_manager.write(), manager);
        previous.flush(self)
    }

    /// Sends cursor kills the current policy is still holding back.
    pub fn flush_cursors(&self) -> Result<()> {
        let manager = Arc::clone(&*self.inner.cursor_manager.read());
        manager.flush(self)
    }

    /// Closes every socket and reruns discovery.
    ///
    /// # Errors
    ///
    /// [`Error::PoolExhausted`] if some slot stays busy past the acquire timeout, or the
    /// discovery failure.
    pub fn reset(&self) -> Result<()> {
        self.reset_observed(self.inner.generation.load(Ordering::SeqCst))
    }

    /// Resets unless the pool already moved past `observed`.
    fn reset_observed(&self, observed: u64) -> Result<()> {
        let _serial = self.inner.reset_lock.lock();
        if self.inner.generation.load(Ordering::SeqCst) != observed {
            debug!("pool already reset since generation {observed}");
            return Ok(());
        }

        let mut slots = self.inner.pool.acquire_all()?;
        for slot in slots.iter_mut() {
            slot.close();
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.resets.fetch_add(1, Ordering::SeqCst);
        info!("pool reset, rediscovering master");

        let _discovery = self.inner.discovery_lock.lock();
        *self.inner.master.write() = None;
        let found = discovery::find_master(&self.inner.options)?;
        *self.inner.master.write() = Some(found);
        Ok(())
    }

    /// Number of completed pool resets.
    pub fn reset_count(&self) -> usize {
        self.inner.resets.load(Ordering::SeqCst)
    }

    /// Runs `command` against `db.$cmd`.
    ///
    /// # Errors
    ///
    /// [`Error::OperationFailure`] when the answer's `ok` is falsy and its `errmsg` is not
    /// one of `allowable_errors`.
    pub fn command(
        &self,
        db: &str,
        command: &Document,
        allowable_errors: &[&str],
    ) -> Result<Document> {
        let mut flags = QueryFlags::NONE;
        flags.set(QueryFlags::SLAVE_OK, self.inner.options.slave_okay);
        let message =
            protocol::query(flags, &protocol::command_namespace(db), 0, -1, command, None)?;
        let (reply, _) = self.query_reply(&message, None)?;
        let answer = reply
            .documents
            .into_iter()
            .next()
            .ok_or_else(|| Error::operation("command returned no document", None))?;
        let name = command.keys().next().unwrap_or_default();
        socket::check_command(name, answer, allowable_errors)
    }

    /// The server's `buildinfo`.
    pub fn server_info(&self) -> Result<Document> {
        self.command("admin", &doc! { "buildinfo" => 1 }, &[])
    }

    pub fn database_names(&self) -> Result<Vec<String>> {
        let answer = self.command("admin", &doc! { "listDatabases" => 1 }, &[])?;
        Ok(answer
            .get_array("databases")
            .unwrap_or_default()
            .iter()
            .filter_map(Bson::as_document)
            .filter_map(|db| db.get_str("name"))
            .map(str::to_string)
            .collect())
    }

    /// Host of the adopted node, if discovery ran.
    pub fn host(&self) -> Option<String> {
        self.inner
            .master
            .read()
            .as_ref()
            .map(|found| found.node.host.clone())
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.master.read().as_ref().map(|found| found.node.port)
    }

    /// True when the adopted node is a master rather than a permitted secondary.
    pub fn is_primary(&self) -> bool {
        self.inner
            .master
            .read()
            .as_ref()
            .is_some_and(|found| found.primary)
    }

    /// Configured candidate nodes.
    pub fn nodes(&self) -> &[Node] {
        &self.inner.options.nodes
    }

    /// Closes every socket and forgets the adopted node; the next operation rediscovers.
    pub fn disconnect(&self) -> Result<()> {
        let _serial = self.inner.reset_lock.lock();
        let mut slots = self.inner.pool.acquire_all()?;
        for slot in slots.iter_mut() {
            slot.close();
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *self.inner.master.write() = None;
        info!("disconnected");
        Ok(())
    }

    /// Flushes pending cursor kills, closes every socket and makes the connection
    /// unusable.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.flush_cursors() {
            warn!("failed to flush cursor kills on close: {e}");
        }
        self.inner.closed.store(true, Ordering::SeqCst);
        self.disconnect()?;
        self.inner.indexes.clear();
        info!("connection closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Authenticates against `db` and remembers the credentials so every socket opened
    /// later authenticates as well.
    pub fn authenticate(&self, db: &str, user: &str, password: &str) -> Result<()> {
        self.with_slot(None, |slot| {
            auth::authenticate_on(transport(slot)?, db, user, password)?;
            slot.authenticated.insert(db.to_string());
            Ok(())
        })?;
        self.inner
            .credentials
            .lock()
            .insert(db.to_string(), (user.to_string(), password.to_string()));
        info!("authenticated {user} on {db}");
        Ok(())
    }

    /// Forgets the credentials for `db` and logs out every socket that used them.
    pub fn logout(&self, db: &str) -> Result<()> {
        self.check_open()?;
        self.inner.credentials.lock().remove(db);

        let mut slots = self.inner.pool.acquire_all()?;
        for slot in slots.iter_mut() {
            if !slot.authenticated.remove(db) {
                continue;
            }
            let Some(transport) = slot.transport.as_mut() else {
                continue;
            };
            if let Err(e) = auth::logout_on(transport, db) {
                warn!("logout on slot {} failed: {e}", slot.index());
                slot.close();
            }
        }
        Ok(())
    }

    /// Records that `index` was ensured on `db.collection` for `ttl`. Returns false if an
    /// unexpired entry already existed.
    pub fn cache_index(&self, db: &str, collection: &str, index: &str, ttl: Duration) -> bool {
        self.inner.indexes.cache(db, collection, index, ttl)
    }

    pub fn is_index_cached(&self, db: &str, collection: &str, index: &str) -> bool {
        self.inner.indexes.is_cached(db, collection, index)
    }

    /// Forgets cached indexes for a database, one of its collections, or one index.
    pub fn purge_index(&self, db: &str, collection: Option<&str>, index: Option<&str>) {
        self.inner.indexes.purge(db, collection, index);
    }

    fn round_trip(
        &self,
        message: &WireMessage,
        affinity: Option<usize>,
    ) -> Result<Exchanged<Reply>> {
        let exchanged = self.with_slot(affinity, |slot| {
            let transport = transport(slot)?;
            transport.write_message(message)?;
            Ok(transport.read_reply(message.request_id())?)
        })?;
        let reply = Reply::parse(&exchanged.value)?;

        if let Some(ReplyFailure::QueryFailure(error)) = reply.failure() {
            if error.get_str("$err") == Some(NOT_MASTER) {
                return Err(self.not_master(exchanged.generation));
            }
        }
        Ok(Exchanged {
            value: reply,
            slot: exchanged.slot,
            generation: exchanged.generation,
        })
    }

    fn check_last_error(&self, last_error: Document, generation: u64) -> Result<Document> {
        let Some(message) = last_error.get("err").filter(|err| **err != Bson::Null) else {
            return Ok(last_error);
        };
        let message = message.as_str().unwrap_or("unknown error").to_string();
        if message == NOT_MASTER {
            return Err(self.not_master(generation));
        }
        Err(Error::operation(message, last_error.get_i32("code")))
    }

    /// Resets the pool after a node stepped down and builds the error to report.
    fn not_master(&self, generation: u64) -> Error {
        warn!("server is no longer master");
        if let Err(e) = self.reset_observed(generation) {
            warn!("pool reset after not master failed: {e}");
        }
        Error::AutoReconnect(NOT_MASTER.to_string())
    }

    /// Locks a slot, makes sure its socket is open and authenticated, then runs `f`.
    ///
    /// Socket-level failures close the slot before they are returned.
    fn with_slot<R>(
        &self,
        affinity: Option<usize>,
        f: impl FnOnce(&mut SlotState) -> Result<R>,
    ) -> Result<Exchanged<R>> {
        self.check_open()?;
        let mut slot = match affinity {
            Some(index) => self.inner.pool.acquire_slot(index)?,
            None => self.inner.pool.acquire()?,
        };
        let index = slot.index();
        let generation = self.inner.generation.load(Ordering::SeqCst);

        let result = self
            .ensure_socket(&mut slot)
            .and_then(|()| self.authenticate_slot(&mut slot))
            .and_then(|()| f(&mut slot));
        match result {
            Ok(value) => Ok(Exchanged {
                value,
                slot: index,
                generation,
            }),
            Err(e @ (Error::Io(_) | Error::ConnectionFailure(_))) => {
                warn!("socket error on slot {index}: {e}");
                slot.close();
                Err(self.reconnect_error(&e))
            }
            Err(e) => Err(e),
        }
    }

    fn reconnect_error(&self, cause: &Error) -> Error {
        let message = match cause {
            Error::ConnectionFailure(message) => message.clone(),
            other => other.to_string(),
        };
        if self.inner.options.auto_reconnect {
            Error::AutoReconnect(message)
        } else {
            Error::ConnectionFailure(message)
        }
    }

    fn ensure_socket(&self, slot: &mut SlotState) -> Result<()> {
        if slot.transport.is_some() {
            return Ok(());
        }
        let node = self.master()?;
        let stream = match socket::connect(&node, &self.inner.options) {
            Ok(stream) => stream,
            Err(e) if self.inner.options.auto_reconnect => {
                warn!("could not connect to {node}: {e}, rediscovering");
                let node = self.rediscover(&node)?;
                socket::connect(&node, &self.inner.options).map_err(|e| {
                    Error::AutoReconnect(format!("could not connect to {node}: {e}"))
                })?
            }
            Err(e) => {
                return Err(Error::ConnectionFailure(format!(
                    "could not connect to {node}: {e}"
                )));
            }
        };
        slot.transport = Some(ProtocolTransport::new(stream));
        slot.authenticated.clear();
        Ok(())
    }

    fn authenticate_slot(&self, slot: &mut SlotState) -> Result<()> {
        let missing: Vec<(String, String, String)> = self
            .inner
            .credentials
            .lock()
            .iter()
            .filter(|(db, _)| !slot.authenticated.contains(*db))
            .map(|(db, (user, password))| (db.clone(), user.clone(), password.clone()))
            .collect();
        for (db, user, password) in missing {
            auth::authenticate_on(transport(slot)?, &db, &user, &password)?;
            slot.authenticated.insert(db);
        }
        Ok(())
    }

    /// The adopted node, discovering it first if needed.
    fn master(&self) -> Result<Node> {
        if let Some(found) = self.inner.master.read().as_ref() {
            return Ok(found.node.clone());
        }
        let _discovery = self.inner.discovery_lock.lock();
        if let Some(found) = self.inner.master.read().as_ref() {
            return Ok(found.node.clone());
        }
        self.adopt(discovery::find_master(&self.inner.options)?)
    }

    /// Reruns discovery after `failed` refused a connection, unless another thread already
    /// moved on to a different node.
    fn rediscover(&self, failed: &Node) -> Result<Node> {
        let _discovery = self.inner.discovery_lock.lock();
        if let Some(found) = self.inner.master.read().as_ref() {
            if found.node != *failed {
                return Ok(found.node.clone());
            }
        }
        *self.inner.master.write() = None;
        self.adopt(discovery::find_master(&self.inner.options)?)
    }

    fn adopt(&self, found: Discovered) -> Result<Node> {
        let node = found.node.clone();
        *self.inner.master.write() = Some(found);
        Ok(node)
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::InvalidOperation("connection is closed".into()));
        }
        Ok(())
    }
}

/// Turns a failure flagged in the reply into an error.
fn checked(reply: Reply) -> Result<Reply> {
    match reply.failure() {
        None => Ok(reply),
        Some(ReplyFailure::CursorNotFound) => {
            Err(Error::operation("cursor id not valid at server", None))
        }
        Some(ReplyFailure::QueryFailure(error)) => Err(Error::operation(
            error.get_str("$err").unwrap_or("query failure"),
            error.get_i32("code"),
        )),
    }
}

/// The open socket of a slot whose socket was just ensured.
fn transport(slot: &mut SlotState) -> Result<&mut Transport> {
    slot.transport
        .as_mut()
        .ok_or_else(|| Error::ConnectionFailure("socket is not open".into()))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Barrier,
        thread,
        time::Duration,
    };

    use crate::testing::{MockServer, init_logging};

    use super::*;

    fn connect(server: &MockServer) -> Connection {
        Connection::new(ConnectionOptions::new([server.node()])).unwrap()
    }

    fn insert(ns: &str, ack: bool) -> WireMessage {
        let concern = doc! {};
        protocol::insert(ns, &[doc! { "x" => 1 }], true, false, ack.then_some(&concern)).unwrap()
    }

    fn secondary_of(master: &MockServer) -> Document {
        doc! { "ismaster" => false, "secondary" => true, "primary" => master.host_port(), "ok" => 1.0 }
    }

    #[test]
    fn discovers_and_reports_master() {
        init_logging();
        let server = MockServer::start();
        let connection = connect(&server);
        let (host, port) = server.node();
        assert_eq!(connection.host(), Some(host));
        assert_eq!(connection.port(), Some(port));
        assert!(connection.is_primary());
        assert_eq!(connection.nodes(), &[Node::from(server.node())]);
    }

    #[test]
    fn deferred_discovery_waits_for_first_use() {
        init_logging();
        let server = MockServer::start();
        let options = ConnectionOptions::new([server.node()]).with_deferred_discovery(true);
        let connection = Connection::new(options).unwrap();
        assert_eq!(server.state().ismaster_calls, 0);
        assert!(connection.host().is_none());

        connection.server_info().unwrap();
        assert_eq!(server.state().ismaster_calls, 1);
        assert!(connection.host().is_some());
    }

    #[test]
    fn unacknowledged_and_acknowledged_writes() {
        init_logging();
        let server = MockServer::start();
        let connection =
            Connection::new(ConnectionOptions::new([server.node()]).with_pool_size(1)).unwrap();

        assert!(connection.send(&insert("app.things", false)).unwrap().is_none());
        let answer = connection.send(&insert("app.things", true)).unwrap().unwrap();
        assert_eq!(answer.get_f64("ok"), Some(1.0));
        assert_eq!(server.state().collections["app.things"].len(), 2);
    }

    #[test]
    fn acknowledged_write_error_is_operation_failure() {
        init_logging();
        let server = MockServer::start();
        server.state().last_error =
            doc! { "err" => "E11000 duplicate key", "code" => 11000, "n" => 0, "ok" => 1.0 };
        let connection = connect(&server);

        let err = connection.send(&insert("app.things", true)).unwrap_err();
        assert!(matches!(err, Error::OperationFailure { .. }));
        assert_eq!(err.code(), Some(11000));
        assert_eq!(connection.reset_count(), 0);
    }

    #[test]
    fn not_master_ack_resets_to_new_master() {
        init_logging();
        let first = MockServer::start();
        let second = MockServer::start();
        second.state().is_master = secondary_of(&first);
        let connection =
            Connection::new(ConnectionOptions::new([first.node(), second.node()])).unwrap();
        assert_eq!(connection.port(), Some(first.address().port()));

        // roles flip
        first.state().is_master = secondary_of(&second);
        first.state().last_error = doc! { "err" => "not master", "ok" => 1.0 };
        second.state().is_master = doc! { "ismaster" => true, "ok" => 1.0 };

        let err = connection.send(&insert("app.things", true)).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "auto reconnect: not master");
        assert_eq!(connection.reset_count(), 1);
        assert_eq!(connection.port(), Some(second.address().port()));

        connection.send(&insert("app.things", true)).unwrap();
        assert_eq!(second.state().collections["app.things"].len(), 1);
    }

    #[test]
    fn rejected_acknowledgement_is_not_success() {
        init_logging();
        let server = MockServer::start();
        let connection =
            Connection::new(ConnectionOptions::new([server.node()]).with_pool_size(1)).unwrap();

        server.state().fail_last_error = Some("unauthorized".to_string());
        let err = connection.send(&insert("app.things", true)).unwrap_err();
        assert!(matches!(err, Error::OperationFailure { .. }), "{err}");
        assert!(err.to_string().contains("unauthorized"), "{err}");
        assert_eq!(connection.reset_count(), 0);
    }

    #[test]
    fn not_master_failure_on_acknowledgement_resets() {
        init_logging();
        let first = MockServer::start();
        let second = MockServer::start();
        second.state().is_master = secondary_of(&first);
        let connection =
            Connection::new(ConnectionOptions::new([first.node(), second.node()])).unwrap();

        first.state().is_master = secondary_of(&second);
        first.state().fail_last_error = Some("not master".to_string());
        second.state().is_master = doc! { "ismaster" => true, "ok" => 1.0 };

        let err = connection.send(&insert("app.things", true)).unwrap_err();
        assert_eq!(err.to_string(), "auto reconnect: not master");
        assert_eq!(connection.reset_count(), 1);
        assert_eq!(connection.port(), Some(second.address().port()));
        assert!(connection.send(&insert("app.things", true)).unwrap().is_some());
    }

    #[test]
    fn concurrent_not_master_resets_once() {
        init_logging();
        let first = MockServer::start();
        let second = MockServer::start();
        second.state().is_master = secondary_of(&first);
        let options = ConnectionOptions::new([first.node(), second.node()]).with_pool_size(4);
        let connection = Connection::new(options).unwrap();

        {
            let mut state = first.state();
            state.is_master = secondary_of(&second);
            state.reject_queries_not_master = true;
            state.delay = Some(Duration::from_millis(100));
        }
        second.state().is_master = doc! { "ismaster" => true, "ok" => 1.0 };
        second.state().seed("app.things", 3);

        let threads = 4;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let connection = connection.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let message = protocol::query(
                        QueryFlags::NONE,
                        "app.things",
                        0,
                        0,
                        &doc! {},
                        None,
                    )
                    .unwrap();
                    barrier.wait();
                    connection.send_and_receive(&message).map(|reply| reply.documents.len())
                })
            })
            .collect();

        for handle in handles {
            let result = handle.join().unwrap();
            assert!(matches!(result, Err(ref e) if e.is_retryable()), "{result:?}");
        }
        assert_eq!(connection.reset_count(), 1);

        let message =
            protocol::query(QueryFlags::NONE, "app.things", 0, 0, &doc! {}, None).unwrap();
        let reply = connection.send_and_receive(&message).unwrap();
        assert_eq!(reply.documents.len(), 3);
    }

    #[test]
    fn broken_socket_is_replaced_on_next_use() {
        init_logging();
        let server = MockServer::start();
        let connection =
            Connection::new(ConnectionOptions::new([server.node()]).with_pool_size(1)).unwrap();
        connection.server_info().unwrap();
        // discovery probe plus the pooled socket
        assert_eq!(server.state().accepted, 2);

        server.state().drop_requests = 1;
        let err = connection.server_info().unwrap_err();
        assert!(err.is_retryable(), "{err}");

        connection.server_info().unwrap();
        assert_eq!(server.state().accepted, 3);
    }

    #[test]
    fn broken_socket_without_auto_reconnect() {
        init_logging();
        let server = MockServer::start();
        let options = ConnectionOptions::new([server.node()])
            .with_pool_size(1)
            .with_auto_reconnect(false);
        let connection = Connection::new(options).unwrap();
        server.state().drop_requests = 1;

        let err = connection.server_info().unwrap_err();
        assert!(matches!(err, Error::ConnectionFailure(_)), "{err}");
        connection.server_info().unwrap();
    }

    #[test]
    fn pool_shared_by_many_threads() {
        init_logging();
        let server = MockServer::start();
        server.state().seed("app.things", 5);
        let slots = 3;
        let connection =
            Connection::new(ConnectionOptions::new([server.node()]).with_pool_size(slots)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let connection = connection.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        let answer = connection
                            .command("app", &doc! { "count" => "things" }, &[])
                            .unwrap();
                        assert_eq!(answer.get_i64("n"), Some(5));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        // never more sockets than slots, plus the discovery probe
        assert!(server.state().accepted <= slots + 1);
    }

    #[test]
    fn busy_pool_times_out() {
        init_logging();
        let server = MockServer::start();
        let options = ConnectionOptions::new([server.node()])
            .with_pool_size(1)
            .with_acquire_timeout(Duration::from_millis(50));
        let connection = Connection::new(options).unwrap();
        server.state().delay = Some(Duration::from_millis(400));

        let busy = connection.clone();
        let holder = thread::spawn(move || busy.server_info());
        thread::sleep(Duration::from_millis(100));
        let err = connection.server_info().unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { slot: 0, .. }), "{err}");
        holder.join().unwrap().unwrap();
    }

    #[test]
    fn request_keeps_one_socket() {
        init_logging();
        let server = MockServer::start();
        let connection =
            Connection::new(ConnectionOptions::new([server.node()]).with_pool_size(4)).unwrap();

        connection.start_request().unwrap();
        for _ in 0..10 {
            connection.send(&insert("app.things", false)).unwrap();
        }
        let count = connection
            .command("app", &doc! { "count" => "things" }, &[])
            .unwrap();
        connection.end_request();

        assert_eq!(count.get_i64("n"), Some(10));
        assert_eq!(server.state().accepted, 2);
        assert!(connection.pinned_slot().is_none());
    }

    #[test]
    fn command_errors_and_allow_list() {
        init_logging();
        let server = MockServer::start();
        let connection = connect(&server);

        let err = connection
            .command("app", &doc! { "count" => "missing" }, &[])
            .unwrap_err();
        assert!(matches!(err, Error::OperationFailure { .. }));

        let answer = connection
            .command("app", &doc! { "count" => "missing" }, &["ns missing"])
            .unwrap();
        assert_eq!(answer.get_str("errmsg"), Some("ns missing"));
    }

    #[test]
    fn server_info_and_database_names() {
        init_logging();
        let server = MockServer::start();
        server.state().seed("alpha.c", 1);
        server.state().seed("beta.c", 1);
        let connection = connect(&server);

        assert_eq!(connection.server_info().unwrap().get_str("version"), Some("1.8.0"));
        assert_eq!(connection.database_names().unwrap(), vec!["alpha", "beta"]);
    }

    #[test]
    fn credentials_follow_new_sockets() {
        init_logging();
        let server = MockServer::start();
        server
            .state()
            .users
            .insert(("app".into(), "bob".into()), "secret".into());
        let connection =
            Connection::new(ConnectionOptions::new([server.node()]).with_pool_size(1)).unwrap();

        let err = connection.authenticate("app", "bob", "wrong").unwrap_err();
        assert!(matches!(err, Error::OperationFailure { .. }));

        connection.authenticate("app", "bob", "secret").unwrap();
        connection.disconnect().unwrap();
        connection.server_info().unwrap();

        let authenticated = server
            .state()
            .authenticated
            .values()
            .filter(|dbs| dbs.contains("app"))
            .count();
        assert_eq!(authenticated, 2);

        connection.logout("app").unwrap();
        let authenticated = server
            .state()
            .authenticated
            .values()
            .filter(|dbs| dbs.contains("app"))
            .count();
        assert_eq!(authenticated, 1);
    }

    #[test]
    fn uri_credentials_authenticate_on_connect() {
        init_logging();
        let server = MockServer::start();
        server
            .state()
            .users
            .insert(("app".into(), "bob".into()), "secret".into());

        let uri = format!("mongodb://bob:secret@{}/app", server.host_port());
        Connection::open(&uri).unwrap();
        assert_eq!(server.state().authenticated.len(), 1);

        let uri = format!("mongodb://bob:nope@{}/app", server.host_port());
        assert!(Connection::open(&uri).is_err());
    }

    #[test]
    fn batched_cursor_kills() {
        init_logging();
        let server = MockServer::start();
        let options = ConnectionOptions::new([server.node()])
            .with_cursor_close_batch(2)
            .with_pool_size(1);
        let connection = Connection::new(options).unwrap();

        connection.close_cursor(5).unwrap();
        assert!(server.state().killed_cursors.is_empty());
        connection.close_cursor(6).unwrap();
        connection.close_cursor(7).unwrap();
        connection.flush_cursors().unwrap();
        // the kill message is fire-and-forget; a round trip orders it before the check
        connection.server_info().unwrap();
        let mut killed = server.state().killed_cursors.clone();
        killed.sort();
        assert_eq!(killed, vec![5, 6, 7]);
    }

    #[test]
    fn replacing_cursor_manager_flushes() {
        init_logging();
        let server = MockServer::start();
        let options = ConnectionOptions::new([server.node()])
            .with_cursor_close_batch(10)
            .with_pool_size(1);
        let connection = Connection::new(options).unwrap();

        connection.close_cursor(9).unwrap();
        connection.set_cursor_manager(ImmediateCursorManager).unwrap();
        connection.close_cursor(10).unwrap();
        connection.server_info().unwrap();
        assert_eq!(server.state().killed_cursors, vec![9, 10]);
    }

    #[test]
    fn index_cache() {
        init_logging();
        let server = MockServer::start();
        let connection = connect(&server);
        let ttl = Duration::from_secs(60);

        assert!(connection.cache_index("app", "things", "x_1", ttl));
        assert!(!connection.cache_index("app", "things", "x_1", ttl));
        assert!(connection.is_index_cached("app", "things", "x_1"));
        connection.purge_index("app", None, None);
        assert!(!connection.is_index_cached("app", "things", "x_1"));
    }

    #[test]
    fn explicit_reset_reopens_sockets() {
        init_logging();
        let server = MockServer::start();
        let connection =
            Connection::new(ConnectionOptions::new([server.node()]).with_pool_size(1)).unwrap();
        connection.server_info().unwrap();

        connection.reset().unwrap();
        assert_eq!(connection.reset_count(), 1);
        connection.server_info().unwrap();
        // two probes, two pooled sockets
        assert_eq!(server.state().accepted, 4);
        assert_eq!(server.state().ismaster_calls, 2);
    }

    #[test]
    #[should_panic(expected = "InvalidOperation")]
    fn closed_connection_rejects_operations() {
        init_logging();
        let server = MockServer::start();
        let connection = connect(&server);
        connection.close().unwrap();
        assert!(connection.is_closed());
        connection.server_info().unwrap();
    }
}
