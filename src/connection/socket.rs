use std::{
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
};

use log::debug;

use crate::{
    bson::{Bson, Document},
    error::{Error, Result},
    protocol::{self, ProtocolTransport, QueryFlags, Reply, ReplyFailure},
};

use super::{ConnectionOptions, Node};

/// Opens a TCP socket to `node` with the configured timeouts applied.
pub(crate) fn connect(node: &Node, options: &ConnectionOptions) -> io::Result<TcpStream> {
    let mut last_error = None;
    for address in (node.host.as_str(), node.port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&address, options.connect_timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                stream.set_read_timeout(options.network_timeout)?;
                stream.set_write_timeout(options.network_timeout)?;
                debug!("connected to {node} at {address}");
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("{node} did not resolve"))
    }))
}

/// Runs `command` against `db` over an already locked socket and returns the server's
/// answer without interpreting `ok`.
pub(crate) fn command_on<T: Read + Write>(
    transport: &mut ProtocolTransport<T>,
    db: &str,
    command: &Document,
    flags: QueryFlags,
) -> Result<Document> {
    let message = protocol::query(flags, &protocol::command_namespace(db), 0, -1, command, None)?;
    transport.write_message(&message)?;
    let body = transport.read_reply(message.request_id())?;
    let reply = Reply::parse(&body)?;

    if let Some(ReplyFailure::QueryFailure(error)) = reply.failure() {
        return Err(Error::operation(
            error.get_str("$err").unwrap_or("command failed"),
            error.get_i32("code"),
        ));
    }
    reply
        .documents
        .into_iter()
        .next()
        .ok_or_else(|| Error::operation("command returned no document", None))
}

/// Turns a command answer with a falsy `ok` into an [`Error::OperationFailure`], unless its
/// `errmsg` is one of `allowable_errors` exactly.
pub(crate) fn check_command(
    name: &str,
    answer: Document,
    allowable_errors: &[&str],
) -> Result<Document> {
    if answer.get("ok").is_some_and(Bson::is_truthy) {
        return Ok(answer);
    }
    let message = answer.get_str("errmsg").unwrap_or_default();
    if allowable_errors.contains(&message) {
        return Ok(answer);
    }
    Err(Error::operation(
        format!("command {name:?} failed: {message}"),
        answer.get_i32("code"),
    ))
}
