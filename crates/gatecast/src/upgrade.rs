//! Websocket handshake validation.
//!
//! Runs before any shard state changes; the first violation wins and maps
//! to a client-visible 4xx.

use crate::envelope::ClientRequest;
use crate::error::RoutingError;

/// The only websocket protocol version accepted.
pub const SUPPORTED_VERSION: &str = "13";

/// Whether a request asks for a protocol switch at all.
///
/// Requests without upgrade intent skip handshake validation entirely and
/// go to the application dispatch path.
pub fn is_upgrade_intent(request: &ClientRequest) -> bool {
    request
        .header("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Validate the handshake preconditions of an upgrade request.
pub fn validate_handshake(request: &ClientRequest) -> Result<(), RoutingError> {
    if !request.method.eq_ignore_ascii_case("GET") {
        return Err(RoutingError::Protocol {
            code: 405,
            reason: format!("handshake must use GET, got {}", request.method),
        });
    }
    match request.header("upgrade") {
        Some(v) if v.eq_ignore_ascii_case("websocket") => {}
        _ => {
            return Err(RoutingError::Protocol {
                code: 426,
                reason: "missing websocket upgrade intent".into(),
            })
        }
    }
    let connection_ok = request
        .header("connection")
        .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));
    if !connection_ok {
        return Err(RoutingError::Protocol {
            code: 400,
            reason: "connection header does not request an upgrade".into(),
        });
    }
    match request.header("sec-websocket-key") {
        Some(key) if well_formed_key(key) => {}
        Some(_) => {
            return Err(RoutingError::Protocol {
                code: 400,
                reason: "malformed sec-websocket-key".into(),
            })
        }
        None => {
            return Err(RoutingError::Protocol {
                code: 400,
                reason: "missing sec-websocket-key".into(),
            })
        }
    }
    match request.header("sec-websocket-version") {
        Some(SUPPORTED_VERSION) => Ok(()),
        Some(v) => Err(RoutingError::Protocol {
            code: 400,
            reason: format!("unsupported websocket version {v}"),
        }),
        None => Err(RoutingError::Protocol {
            code: 400,
            reason: "missing sec-websocket-version".into(),
        }),
    }
}

/// A handshake key is 16 random bytes base64-encoded: 22 alphabet
/// characters plus `==` padding.
fn well_formed_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    bytes.len() == 24
        && bytes.ends_with(b"==")
        && bytes[..22]
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
}
