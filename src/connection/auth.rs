//! Legacy nonce/digest authentication.
use std::io::{Read, Write};

use log::debug;
use md5::{Digest, Md5};

use crate::{
    doc,
    error::{Error, Result},
    protocol::{ProtocolTransport, QueryFlags},
};

use super::socket::{check_command, command_on};

/// `md5_hex("<user>:mongo:<password>")`
pub(crate) fn password_digest(user: &str, password: &str) -> String {
    hex::encode(Md5::digest(format!("{user}:mongo:{password}")))
}

/// `md5_hex(nonce + user + password_digest)`
pub(crate) fn auth_key(nonce: &str, user: &str, password: &str) -> String {
    let digest = password_digest(user, password);
    hex::encode(Md5::digest(format!("{nonce}{user}{digest}")))
}

/// Authenticates one socket against `database`.
pub(crate) fn authenticate_on<T: Read + Write>(
    transport: &mut ProtocolTransport<T>,
    database: &str,
    user: &str,
    password: &str,
) -> Result<()> {
    let answer = command_on(transport, database, &doc! { "getnonce" => 1 }, QueryFlags::NONE)?;
    let answer = check_command("getnonce", answer, &[])?;
    let nonce = answer
        .get_str("nonce")
        .ok_or_else(|| Error::operation("getnonce returned no nonce", None))?;

    let command = doc! {
        "authenticate" => 1,
        "user" => user,
        "nonce" => nonce,
        "key" => auth_key(nonce, user, password),
    };
    let answer = command_on(transport, database, &command, QueryFlags::NONE)?;
    check_command("authenticate", answer, &[])?;
    debug!("authenticated {user} on {database}");
    Ok(())
}

pub(crate) fn logout_on<T: Read + Write>(
    transport: &mut ProtocolTransport<T>,
    database: &str,
) -> Result<()> {
    let answer = command_on(transport, database, &doc! { "logout" => 1 }, QueryFlags::NONE)?;
    check_command("logout", answer, &[]).map(drop)
}
