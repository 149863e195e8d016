//! Master discovery: find the node that currently accepts writes.
//!
//! Every candidate is probed in configured order with `{ismaster: 1}` over a short-lived
//! socket. A node that names some other node as master is never trusted blindly: if that
//! master is one of the candidates we keep probing and let it answer for itself.
use std::collections::HashSet;

use log::{debug, info, warn};

use crate::{
    bson::Document,
    doc,
    error::{Error, Result},
    protocol::{ProtocolTransport, QueryFlags},
};

use super::{
    ConnectionOptions, Node,
    socket::{self, check_command},
};

/// Outcome of a discovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Discovered {
    pub node: Node,
    /// False when a secondary was adopted because `slave_okay` is set.
    pub primary: bool,
}

/// Probes the candidates of `options` until a usable node is found.
///
/// # Errors
///
/// - [`Error::Configuration`] when a node turns out to be a secondary (or names a master
///   outside the candidate set) and `slave_okay` is off.
/// - [`Error::AutoReconnect`] when every candidate was tried without success.
pub(crate) fn find_master(options: &ConnectionOptions) -> Result<Discovered> {
    let candidates: HashSet<&Node> = options.nodes.iter().collect();
    let mut fallback: Option<Node> = None;
    let mut failures = Vec::new();

    for node in &options.nodes {
        let answer = match probe(node, options) {
            Ok(answer) => answer,
            Err(e) => {
                warn!("ismaster probe of {node} failed: {e}");
                failures.push(format!("{node}: {e}"));
                continue;
            }
        };

        if answer.get("ismaster").is_some_and(|v| v.is_truthy()) {
            info!("{node} is master");
            return Ok(Discovered {
                node: node.clone(),
                primary: true,
            });
        }

        match named_master(&answer) {
            Some(master) if candidates.contains(&master) => {
                debug!("{node} names {master} as master, continuing");
                if options.slave_okay && fallback.is_none() {
                    fallback = Some(node.clone());
                }
            }
            Some(master) if !options.slave_okay => {
                return Err(Error::Configuration(format!(
                    "{node} is not master and names unknown master {master}"
                )));
            }
            _ if !options.slave_okay => {
                return Err(Error::Configuration(format!(
                    "{node} is a secondary and slave_okay is not set"
                )));
            }
            _ => {
                info!("using secondary {node}");
                return Ok(Discovered {
                    node: node.clone(),
                    primary: false,
                });
            }
        }
    }

    if let Some(node) = fallback {
        info!("no master answered, using secondary {node}");
        return Ok(Discovered {
            node,
            primary: false,
        });
    }
    Err(Error::AutoReconnect(if failures.is_empty() {
        "could not find master".to_string()
    } else {
        format!("could not find master: {}", failures.join(", "))
    }))
}

/// Asks one node whether it is master.
fn probe(node: &Node, options: &ConnectionOptions) -> Result<Document> {
    let stream = socket::connect(node, options)?;
    let mut transport = ProtocolTransport::new(stream);
    let answer = socket::command_on(
        &mut transport,
        "admin",
        &doc! { "ismaster" => 1 },
        QueryFlags::SLAVE_OK,
    )?;
    check_command("ismaster", answer, &[])
}

/// The master a non-master node points at, as `primary` (replica sets) or `remote`
/// (pairs).
fn named_master(answer: &Document) -> Option<Node> {
    ["primary", "remote"]
        .iter()
        .find_map(|key| answer.get_str(key))
        .and_then(|address| address.parse().ok())
}
