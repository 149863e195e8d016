pub mod bson;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod protocol;

#[cfg(test)]
mod testing;

pub use bson::{Bson, Document, ObjectId};
pub use connection::{Connection, ConnectionOptions};
pub use cursor::Cursor;
pub use error::{Error, Result};
