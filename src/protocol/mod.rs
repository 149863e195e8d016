//! Client-server wire protocol.
//!
//! This module defines how requests are framed on the socket and how replies are taken
//! apart again. Builders are pure functions over [`Document`](crate::bson::Document)s; they
//! know nothing about sockets or connection state.
//!
//! # Overview
//!
//! Every frame starts with a fixed 16 byte header followed by an opcode-specific body:
//!
//! | bytes  | field                                                  |
//! |--------|--------------------------------------------------------|
//! | 0..4   | total length, header included                          |
//! | 4..8   | request id                                             |
//! | 8..12  | response-to: echoes the request id on replies, else 0  |
//! | 12..16 | opcode                                                 |
//!
//! All integers are little-endian.
//!
//! # Key Components
//!
//! - [`WireMessage`]: an immutable `(request id, bytes)` pair produced by the builders
//!   [`insert`], [`update`], [`delete`], [`query`], [`get_more`] and [`kill_cursors`].
//! - [`QueryFlags`]: option bits carried by query frames.
//! - [`Reply`]: the parsed body of an `OP_REPLY` frame.
//! - [`ProtocolTransport`]: frame-level reads and writes over any `Read + Write` stream.
//!
//! # Acknowledged Writes
//!
//! Mutating builders given write-concern options append a second frame querying the
//! `getlasterror` command. Both frames are sent together and the single reply answers the
//! second frame, so the message's request id is the second frame's id.
//!
//! # See Also
//!
//! - [`connection`](crate::connection): sends these frames over pooled sockets.
mod message;
mod reply;
mod transport;

pub use message::{
    WireMessage, command_namespace, delete, get_more, insert, kill_cursors, last_error, query,
    split_namespace, update,
};
pub use reply::{Reply, ReplyFailure};
pub use transport::{FrameHeader, ProtocolTransport, TransportError};

pub(crate) const HEADER_SIZE: usize = 16;

/// Largest frame accepted from the wire; well above any legal reply.
pub(crate) const MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

pub mod opcode {
    pub const REPLY: i32 = 1;
    pub const UPDATE: i32 = 2001;
    pub const INSERT: i32 = 2002;
    pub const QUERY: i32 = 2004;
    pub const GET_MORE: i32 = 2005;
    pub const DELETE: i32 = 2006;
    pub const KILL_CURSORS: i32 = 2007;
}

bitflags::bitflags! {
    /// Option bits for query frames.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueryFlags: i32 {
        const NONE = 0;
        /// Keep the cursor open after the last result so new data can be polled for.
        const TAILABLE_CURSOR = 1 << 1;
        /// Allow the query to run on a secondary.
        const SLAVE_OK = 1 << 2;
        const OPLOG_REPLAY = 1 << 3;
        /// Never time out the server-side cursor.
        const NO_CURSOR_TIMEOUT = 1 << 4;
    }
}
