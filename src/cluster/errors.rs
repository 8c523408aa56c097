//! Parsing utilities for Redis Cluster error responses.
//!
//! Redis Cluster uses special error responses for redirects:
//! - `MOVED <slot> <host>:<port>` - Permanent redirect
//! - `ASK <slot> <host>:<port>` - Temporary redirect during migration
//! - `CLUSTERDOWN` - Cluster is unavailable
//!
//! The bridge turns a redirect into a [`Redirect`] before handing it to the
//! selection strategy, so routing never looks at raw error text.

use crate::Error;

/// Kind of cluster redirect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// The slot has permanently moved.
    Moved,
    /// One-off hop while the slot migrates.
    Ask,
}

/// A parsed `MOVED`/`ASK` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    /// Redirect kind.
    pub kind: RedirectKind,
    /// Slot named by the server.
    pub slot: u16,
    /// Endpoint that should receive the command.
    pub endpoint: String,
}

impl Redirect {
    /// Returns true for `MOVED`.
    #[inline]
    pub fn is_moved(&self) -> bool {
        self.kind == RedirectKind::Moved
    }

    /// Converts the redirect into the error surfaced when it cannot be
    /// followed.
    pub fn into_error(self) -> Error {
        match self.kind {
            RedirectKind::Moved => Error::Moved {
                slot: self.slot,
                address: self.endpoint,
            },
            RedirectKind::Ask => Error::Ask {
                slot: self.slot,
                address: self.endpoint,
            },
        }
    }
}

/// Recognises a redirect in the text of an error reply.
///
/// # Arguments
///
/// * `error_msg` - The error message bytes (e.g., b"MOVED 3999 127.0.0.1:7000")
///
/// # Returns
///
/// `Some(Redirect)` for a well-formed `MOVED` or `ASK`, `None` otherwise
pub fn parse_redirect(error_msg: &[u8]) -> Option<Redirect> {
    let msg = String::from_utf8_lossy(error_msg);
    let msg = msg.trim();

    let (kind, args) = if let Some(args) = msg.strip_prefix("MOVED ") {
        (RedirectKind::Moved, args)
    } else if let Some(args) = msg.strip_prefix("ASK ") {
        (RedirectKind::Ask, args)
    } else {
        return None;
    };

    let (slot, endpoint) = parse_redirect_args(args)?;
    Some(Redirect {
        kind,
        slot,
        endpoint,
    })
}

/// Parses a Redis error message into a typed error.
///
/// # Returns
///
/// - `Error::Moved` / `Error::Ask` for redirects
/// - `Error::ClusterDown` for CLUSTERDOWN errors
/// - `Error::CrossSlot` for CROSSSLOT errors
/// - `Error::Server` for other errors
pub fn parse_redis_error(error_msg: &[u8]) -> Error {
    if let Some(redirect) = parse_redirect(error_msg) {
        return redirect.into_error();
    }

    let msg = String::from_utf8_lossy(error_msg);
    let msg = msg.trim();

    if msg.starts_with("CLUSTERDOWN") {
        return Error::ClusterDown;
    }
    if msg.starts_with("CROSSSLOT") {
        return Error::CrossSlot;
    }

    Error::Server {
        message: msg.to_string(),
    }
}

/// Parses redirect arguments: "<slot> <host>:<port>"
fn parse_redirect_args(args: &str) -> Option<(u16, String)> {
    let mut parts = args.split_whitespace();
    let slot: u16 = parts.next()?.parse().ok()?;
    let endpoint = parts.next()?.to_string();
    if parts.next().is_some() || slot >= crate::cluster::SLOT_COUNT {
        return None;
    }
    Some((slot, endpoint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_moved_redirect() {
        let redirect = parse_redirect(b"MOVED 3999 127.0.0.1:7000").unwrap();
        assert!(redirect.is_moved());
        assert_eq!(redirect.slot, 3999);
        assert_eq!(redirect.endpoint, "127.0.0.1:7000");
    }

    #[test]
    fn test_parse_ask_redirect() {
        let redirect = parse_redirect(b"ASK 12345 192.168.1.100:6379").unwrap();
        assert_eq!(redirect.kind, RedirectKind::Ask);
        assert_eq!(redirect.slot, 12345);
        assert_eq!(redirect.endpoint, "192.168.1.100:6379");
    }

    #[test]
    fn test_parse_redirect_rejects_malformed() {
        assert_eq!(parse_redirect(b"MOVED 3999"), None);
        assert_eq!(parse_redirect(b"MOVED invalid 127.0.0.1:7000"), None);
        assert_eq!(parse_redirect(b"MOVED 20000 127.0.0.1:7000"), None);
        assert_eq!(parse_redirect(b"MOVED 1 a:1 extra"), None);
        assert_eq!(parse_redirect(b"ERR unknown command"), None);
    }

    #[test]
    fn test_parse_redirect_with_ipv6() {
        let redirect = parse_redirect(b"MOVED 1234 [::1]:7000").unwrap();
        assert_eq!(redirect.endpoint, "[::1]:7000");
    }

    #[test]
    fn test_parse_moved_with_whitespace() {
        let redirect = parse_redirect(b"  MOVED 100 localhost:7001  ").unwrap();
        assert_eq!(redirect.slot, 100);
        assert_eq!(redirect.endpoint, "localhost:7001");
    }

    #[test]
    fn test_redirect_into_error() {
        let error = parse_redis_error(b"ASK 7 10.0.0.1:7002");
        match error {
            Error::Ask { slot, address } => {
                assert_eq!(slot, 7);
                assert_eq!(address, "10.0.0.1:7002");
            }
            _ => panic!("Expected Ask error"),
        }
    }

    #[test]
    fn test_parse_clusterdown() {
        assert!(matches!(
            parse_redis_error(b"CLUSTERDOWN Hash slot not served"),
            Error::ClusterDown
        ));
    }

    #[test]
    fn test_parse_crossslot() {
        let error = parse_redis_error(b"CROSSSLOT Keys in request don't hash to the same slot");
        assert!(matches!(error, Error::CrossSlot));
    }

    #[test]
    fn test_parse_generic_error() {
        match parse_redis_error(b"ERR unknown command") {
            Error::Server { message } => assert_eq!(message, "ERR unknown command"),
            _ => panic!("Expected Server error"),
        }
    }
}
