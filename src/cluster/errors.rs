//! Parsing of cluster error replies.
//!
//! Error replies carry their kind as the first word. The cluster kinds are
//! turned into typed errors here, once, so routing code never looks at raw
//! strings:
//! - `MOVED <slot> <host>:<port>` - permanent redirect
//! - `ASK <slot> <host>:<port>` - one-shot redirect during migration
//! - `TRYAGAIN ...` - transient, retry later
//! - `CLUSTERDOWN ...` - cluster not serving
//! - `CROSSSLOT ...` - keys span slots
//!
//! Anything else is a command error and passes through as `Error::Server`.

use crate::Error;

/// Converts an error reply payload (without the leading `-`) to a typed error.
pub fn parse_redis_error(error_msg: &[u8]) -> Error {
    let msg = String::from_utf8_lossy(error_msg);
    let msg = msg.trim();
    let (kind, rest) = msg.split_once(' ').unwrap_or((msg, ""));

    match kind {
        "MOVED" => {
            if let Some((slot, address)) = parse_redirect(rest) {
                return Error::Moved { slot, address };
            }
        }
        "ASK" => {
            if let Some((slot, address)) = parse_redirect(rest) {
                return Error::Ask { slot, address };
            }
        }
        "TRYAGAIN" => {
            return Error::TryAgain {
                message: rest.trim().to_string(),
            }
        }
        "CLUSTERDOWN" => {
            return Error::ClusterDown {
                message: rest.trim().to_string(),
            }
        }
        "CROSSSLOT" => return Error::CrossSlot { slots: None },
        _ => {}
    }

    Error::Server {
        message: msg.to_string(),
    }
}

/// Parses redirect arguments: `<slot> <host>:<port>`.
fn parse_redirect(args: &str) -> Option<(u16, String)> {
    let mut parts = args.split_whitespace();
    let slot: u16 = parts.next()?.parse().ok()?;
    let address = parts.next()?;
    if parts.next().is_some() || !address.contains(':') {
        return None;
    }
    if slot >= crate::cluster::slot::SLOT_COUNT {
        return None;
    }
    Some((slot, address.to_string()))
}
