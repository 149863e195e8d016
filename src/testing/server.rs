use std::{
    collections::{HashMap, HashSet},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use md5::{Digest, Md5};

use crate::{
    bson::{self, Bson, Document},
    doc,
    protocol::{FrameHeader, ProtocolTransport, QueryFlags, Reply, TransportError, opcode},
};

use super::thread::ConnectionWorkers;

const WORKERS: usize = 64;
pub(crate) const NONCE: &str = "2375531c32080ae8";

/// Scriptable behaviour and recorded traffic of a [`MockServer`].
#[derive(Debug)]
pub(crate) struct ServerState {
    pub collections: HashMap<String, Vec<Document>>,
    /// Most documents returned in one reply.
    pub batch_size: usize,
    /// Answer to `{ismaster: 1}`.
    pub is_master: Document,
    /// Answer to `{getlasterror: 1}`.
    pub last_error: Document,
    /// Query failures answer with `$err: "not master"`.
    pub reject_queries_not_master: bool,
    /// `getlasterror` answers with a query failure carrying this `$err`.
    pub fail_last_error: Option<String>,
    /// Number of upcoming requests answered by closing the socket instead.
    pub drop_requests: usize,
    /// Pause before answering any request.
    pub delay: Option<Duration>,
    /// `(db, user) -> password`
    pub users: HashMap<(String, String), String>,

    pub accepted: usize,
    pub ismaster_calls: usize,
    pub queries: usize,
    pub get_mores: usize,
    pub killed_cursors: Vec<i64>,
    /// Kill-cursors traffic as `(peer, cursor id)`.
    pub kills: Vec<(SocketAddr, i64)>,
    /// Peer whose query opened each cursor.
    pub cursor_peers: HashMap<i64, SocketAddr>,
    pub commands: Vec<Document>,
    /// Databases each connection authenticated against, keyed by peer address.
    pub authenticated: HashMap<SocketAddr, HashSet<String>>,

    cursors: HashMap<i64, MockCursor>,
    next_cursor: i64,
}

#[derive(Debug)]
struct MockCursor {
    namespace: String,
    remaining: Vec<Document>,
    tailable: bool,
    /// Next collection index a tailable cursor reads from.
    position: usize,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            collections: HashMap::new(),
            batch_size: 101,
            is_master: doc! { "ismaster" => true, "ok" => 1.0 },
            last_error: doc! { "err" => Bson::Null, "n" => 0, "ok" => 1.0 },
            reject_queries_not_master: false,
            fail_last_error: None,
            drop_requests: 0,
            delay: None,
            users: HashMap::new(),
            accepted: 0,
            ismaster_calls: 0,
            queries: 0,
            get_mores: 0,
            killed_cursors: Vec::new(),
            kills: Vec::new(),
            cursor_peers: HashMap::new(),
            commands: Vec::new(),
            authenticated: HashMap::new(),
            cursors: HashMap::new(),
            next_cursor: 1000,
        }
    }
}

impl ServerState {
    /// Stores `count` documents `{_id: i, n: i}` in `namespace`.
    pub fn seed(&mut self, namespace: &str, count: i32) {
        let documents = (0..count).map(|i| doc! { "_id" => i, "n" => i }).collect();
        self.collections.insert(namespace.to_string(), documents);
    }

    pub fn open_cursors(&self) -> usize {
        self.cursors.len()
    }
}

/// Mock wire-protocol server bound to an ephemeral local port.
///
/// The accept loop runs on a detached thread for the rest of the test process.
pub(crate) struct MockServer {
    address: SocketAddr,
    state: Arc<Mutex<ServerState>>,
}

impl MockServer {
    pub fn start() -> Self {
        Self::with_state(ServerState::default())
    }

    pub fn with_state(state: ServerState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("mock server address");
        let state = Arc::new(Mutex::new(state));
        let shared = Arc::clone(&state);

        info!("mock server listening at {address}");
        thread::spawn(move || {
            let handler_state = Arc::clone(&shared);
            let workers = ConnectionWorkers::spawn(WORKERS, move |stream| {
                if let Err(e) = handle_connection(stream, Arc::clone(&handler_state)) {
                    debug!("mock connection ended: {e}");
                }
            });
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        shared.lock().unwrap().accepted += 1;
                        workers.dispatch(stream);
                    }
                    Err(e) => warn!("broken connection: {e:?}"),
                }
            }
        });

        Self { address, state }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// `(host, port)` pair as it appears in connection options.
    pub fn node(&self) -> (String, u16) {
        (self.address.ip().to_string(), self.address.port())
    }

    /// `"host:port"` as reported in `ismaster` answers.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.address.ip(), self.address.port())
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }
}

fn handle_connection(stream: TcpStream, state: Arc<Mutex<ServerState>>) -> Result<(), TransportError> {
    let peer = stream.peer_addr()?;
    let mut transport = ProtocolTransport::new(stream);

    loop {
        let (header, body) = transport.read_frame()?;

        let delay = {
            let mut state = state.lock().unwrap();
            if state.drop_requests > 0 {
                state.drop_requests -= 1;
                info!("dropping connection on request {}", header.request_id);
                return Ok(());
            }
            state.delay
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let reply = {
            let mut state = state.lock().unwrap();
            dispatch(&mut state, peer, &header, &body)
        };
        if let Some(reply) = reply {
            transport.write_reply(header.request_id, &reply)?;
        }
    }
}

/// Parsing helper over a request body.
struct Body<'a> {
    bytes: &'a [u8],
}

impl<'a> Body<'a> {
    fn i32(&mut self) -> i32 {
        let (head, rest) = self.bytes.split_at(4);
        self.bytes = rest;
        i32::from_le_bytes(head.try_into().unwrap())
    }

    fn i64(&mut self) -> i64 {
        let (head, rest) = self.bytes.split_at(8);
        self.bytes = rest;
        i64::from_le_bytes(head.try_into().unwrap())
    }

    fn cstring(&mut self) -> String {
        let nul = self.bytes.iter().position(|b| *b == 0).unwrap();
        let s = String::from_utf8(self.bytes[..nul].to_vec()).unwrap();
        self.bytes = &self.bytes[nul + 1..];
        s
    }

    fn document(&mut self) -> Option<Document> {
        if self.bytes.is_empty() {
            return None;
        }
        let (document, rest) = bson::decode(self.bytes).unwrap();
        self.bytes = rest;
        Some(document)
    }
}

fn dispatch(
    state: &mut ServerState,
    peer: SocketAddr,
    header: &FrameHeader,
    body: &[u8],
) -> Option<Reply> {
    let mut body = Body { bytes: body };
    match header.opcode {
        opcode::QUERY => {
            let flags = QueryFlags::from_bits_retain(body.i32());
            let namespace = body.cstring();
            let skip = body.i32();
            let limit = body.i32();
            let query = body.document().unwrap_or_default();
            Some(match namespace.strip_suffix(".$cmd") {
                Some(db) => command(state, peer, db, query),
                None => run_query(state, peer, flags, namespace, skip, limit, query),
            })
        }
        opcode::GET_MORE => {
            body.i32();
            let _namespace = body.cstring();
            let batch = body.i32();
            let cursor_id = body.i64();
            state.get_mores += 1;
            Some(get_more(state, cursor_id, batch))
        }
        opcode::INSERT => {
            body.i32();
            let namespace = body.cstring();
            while let Some(document) = body.document() {
                state
                    .collections
                    .entry(namespace.clone())
                    .or_default()
                    .push(document);
            }
            None
        }
        opcode::UPDATE => {
            body.i32();
            let namespace = body.cstring();
            let flags = body.i32();
            let filter = body.document().unwrap_or_default();
            let update = body.document().unwrap_or_default();
            let documents = state.collections.entry(namespace).or_default();
            let mut matched = false;
            for document in documents.iter_mut().filter(|d| matches(d, &filter)) {
                apply_update(document, &update);
                matched = true;
                if flags & 2 == 0 {
                    break;
                }
            }
            if !matched && flags & 1 != 0 {
                let mut document = filter.clone();
                apply_update(&mut document, &update);
                documents.push(document);
            }
            None
        }
        opcode::DELETE => {
            body.i32();
            let namespace = body.cstring();
            body.i32();
            let filter = body.document().unwrap_or_default();
            if let Some(documents) = state.collections.get_mut(&namespace) {
                documents.retain(|d| !matches(d, &filter));
            }
            None
        }
        opcode::KILL_CURSORS => {
            body.i32();
            let count = body.i32();
            for _ in 0..count {
                let id = body.i64();
                state.killed_cursors.push(id);
                state.kills.push((peer, id));
                state.cursors.remove(&id);
            }
            None
        }
        other => {
            warn!("mock server ignoring opcode {other}");
            None
        }
    }
}

fn matches(document: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .filter(|(key, _)| !key.starts_with('$'))
        .all(|(key, value)| document.get(key) == Some(value))
}

fn apply_update(document: &mut Document, update: &Document) {
    match update.get_document("$set") {
        Some(set) => {
            for (key, value) in set.iter() {
                document.insert(key, value.clone());
            }
        }
        None => {
            let id = document.get("_id").cloned();
            *document = update.clone();
            if let Some(id) = id {
                document.insert("_id", id);
            }
        }
    }
}

fn run_query(
    state: &mut ServerState,
    peer: SocketAddr,
    flags: QueryFlags,
    namespace: String,
    skip: i32,
    limit: i32,
    query: Document,
) -> Reply {
    state.queries += 1;
    if state.reject_queries_not_master {
        return Reply::query_failure("not master");
    }

    let filter = match query.get_document("$query") {
        Some(inner) => inner.clone(),
        None => query.clone(),
    };
    let collection = state.collections.get(&namespace).cloned().unwrap_or_default();
    let mut results: Vec<Document> = collection
        .iter()
        .filter(|d| matches(d, &filter))
        .skip(usize::try_from(skip).unwrap_or(0))
        .cloned()
        .collect();

    if query.get("$explain").is_some_and(Bson::is_truthy) {
        let explain = doc! { "cursor" => "BasicCursor", "n" => results.len() as i64 };
        return Reply::new(0, 0, vec![explain]);
    }
    if let Some(Bson::Document(orderby)) = query.get("$orderby") {
        if let Some((key, direction)) = orderby.iter().next() {
            results.sort_by_key(|d| d.get_i64(key).unwrap_or_default());
            if direction.as_i64() == Some(-1) {
                results.reverse();
            }
        }
    }

    let batch = if limit < 0 {
        limit.unsigned_abs() as usize
    } else if limit == 0 {
        state.batch_size
    } else {
        (limit as usize).min(state.batch_size)
    };
    let batch = batch.min(state.batch_size).min(results.len());
    let remaining = results.split_off(batch);

    let tailable = flags.contains(QueryFlags::TAILABLE_CURSOR);
    let keep_open = limit >= 0 && (!remaining.is_empty() || tailable);
    let cursor_id = if keep_open {
        let id = state.next_cursor;
        state.next_cursor += 1;
        state.cursor_peers.insert(id, peer);
        state.cursors.insert(
            id,
            MockCursor {
                position: collection.len(),
                namespace,
                remaining,
                tailable,
            },
        );
        id
    } else {
        0
    };
    Reply::new(cursor_id, 0, results)
}

fn get_more(state: &mut ServerState, cursor_id: i64, batch: i32) -> Reply {
    let batch_size = state.batch_size;
    let Some(cursor) = state.cursors.get_mut(&cursor_id) else {
        return Reply::cursor_not_found();
    };

    if cursor.tailable {
        let collection = state
            .collections
            .get(&cursor.namespace)
            .cloned()
            .unwrap_or_default();
        let fresh = collection.get(cursor.position..).unwrap_or_default().to_vec();
        cursor.remaining.extend(fresh);
        cursor.position = collection.len();
    }

    let n = if batch > 0 {
        (batch as usize).min(batch_size)
    } else {
        batch_size
    };
    let n = n.min(cursor.remaining.len());
    let documents: Vec<Document> = cursor.remaining.drain(..n).collect();

    if cursor.remaining.is_empty() && !cursor.tailable {
        state.cursors.remove(&cursor_id);
        return Reply::new(0, 0, documents);
    }
    Reply::new(cursor_id, 0, documents)
}

fn command(state: &mut ServerState, peer: SocketAddr, db: &str, command: Document) -> Reply {
    state.commands.push(command.clone());
    let Some(name) = command.keys().next().map(str::to_string) else {
        return Reply::new(0, 0, vec![doc! { "ok" => 0.0, "errmsg" => "empty command" }]);
    };

    if name == "getlasterror" {
        if let Some(message) = &state.fail_last_error {
            return Reply::query_failure(message);
        }
    }
    let answer = match name.as_str() {
        "ismaster" => {
            state.ismaster_calls += 1;
            state.is_master.clone()
        }
        "getlasterror" => state.last_error.clone(),
        "count" => {
            let collection = command.get_str("count").unwrap_or_default();
            match state.collections.get(&format!("{db}.{collection}")) {
                None => doc! { "ok" => 0.0, "errmsg" => "ns missing" },
                Some(documents) => {
                    let filter = command.get_document("query").cloned().unwrap_or_default();
                    let mut n = documents.iter().filter(|d| matches(d, &filter)).count() as i64;
                    if let Some(skip) = command.get_i64("skip") {
                        n = (n - skip).max(0);
                    }
                    if let Some(limit) = command.get_i64("limit").filter(|l| *l != 0) {
                        n = n.min(limit.abs());
                    }
                    doc! { "n" => n as f64, "ok" => 1.0 }
                }
            }
        }
        "distinct" => {
            let collection = command.get_str("distinct").unwrap_or_default();
            let key = command.get_str("key").unwrap_or_default();
            let filter = command.get_document("query").cloned().unwrap_or_default();
            let mut values: Vec<Bson> = Vec::new();
            for document in state
                .collections
                .get(&format!("{db}.{collection}"))
                .into_iter()
                .flatten()
                .filter(|d| matches(d, &filter))
            {
                if let Some(value) = document.get(key) {
                    if !values.contains(value) {
                        values.push(value.clone());
                    }
                }
            }
            doc! { "values" => values, "ok" => 1.0 }
        }
        "getnonce" => doc! { "nonce" => NONCE, "ok" => 1.0 },
        "authenticate" => {
            let user = command.get_str("user").unwrap_or_default().to_string();
            let key = command.get_str("key").unwrap_or_default();
            match state.users.get(&(db.to_string(), user.clone())) {
                Some(password) if key == expected_key(&user, password) => {
                    state
                        .authenticated
                        .entry(peer)
                        .or_default()
                        .insert(db.to_string());
                    doc! { "ok" => 1.0 }
                }
                _ => doc! { "ok" => 0.0, "errmsg" => "auth fails" },
            }
        }
        "logout" => {
            if let Some(dbs) = state.authenticated.get_mut(&peer) {
                dbs.remove(db);
            }
            doc! { "ok" => 1.0 }
        }
        "buildinfo" => doc! { "version" => "1.8.0", "ok" => 1.0 },
        "listDatabases" => {
            let mut names: Vec<String> = state
                .collections
                .keys()
                .filter_map(|ns| ns.split_once('.').map(|(db, _)| db.to_string()))
                .collect();
            names.sort();
            names.dedup();
            let databases: Vec<Bson> = names
                .into_iter()
                .map(|name| Bson::from(doc! { "name" => name, "empty" => false }))
                .collect();
            doc! { "databases" => databases, "ok" => 1.0 }
        }
        other => doc! { "ok" => 0.0, "errmsg" => format!("no such cmd: {other}") },
    };
    Reply::new(0, 0, vec![answer])
}

fn expected_key(user: &str, password: &str) -> String {
    let digest = hex::encode(Md5::digest(format!("{user}:mongo:{password}")));
    hex::encode(Md5::digest(format!("{NONCE}{user}{digest}")))
}
