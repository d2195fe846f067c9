use crate::types::{ClientId, GatewayId, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tagged enum for messages between gateway and shard actors.
///
/// Everything that crosses an actor boundary is one of these, whether the
/// transport is in-process or a real wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    /// Client traffic forwarded gateway -> shard (upgrade or application).
    Request(RequestEnvelope),
    /// Decrement notice, shard -> gateway.
    Close(CloseNotice),
    /// Neighbor introduction, fired after on-demand shard creation.
    Neighbor(NeighborIntro),
    /// Cross-shard broadcast relay, shard -> neighbor shard.
    Broadcast(BroadcastRelay),
    /// Cross-shard targeted whisper relay, shard -> neighbor shard.
    Whisper(WhisperRelay),
}

/// Routing identifiers tagged onto every forwarded client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteMeta {
    pub gateway: GatewayId,
    pub client: ClientId,
    pub shard: ShardId,
}

/// A client request as seen by a shard: method, headers, opaque body.
///
/// Transport framing is the host's concern; this carries just enough for
/// upgrade validation and application dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientRequest {
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl ClientRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub meta: RouteMeta,
    pub request: ClientRequest,
}

/// Close/decrement notice. `is_empty` means the shard retains no knowledge
/// of the client, instructing the gateway to forget the sticky mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseNotice {
    pub gateway: GatewayId,
    pub shard: ShardId,
    pub client: ClientId,
    pub is_empty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborIntro {
    pub neighbor: ShardId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastRelay {
    pub sender: ClientId,
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperRelay {
    pub sender: ClientId,
    pub target: ClientId,
    pub message: Vec<u8>,
}

/// Replies to envelopes. Control routes answer with an empty [`Reply::Ack`];
/// the only payload-bearing replies are the protocol switch and the
/// embedding application's own responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    /// Empty success acknowledgment for control routes.
    Ack,
    /// Protocol switch: the connection is now a duplex socket, no payload.
    Upgraded,
    /// Application (or error) response for plain client requests.
    Response { status: u16, body: Vec<u8> },
}

impl Reply {
    pub fn is_upgrade(&self) -> bool {
        matches!(self, Reply::Upgraded)
    }

    /// Build the client-visible response for a rejected request.
    pub fn rejection(err: &crate::error::RoutingError) -> Self {
        Reply::Response {
            status: err.status(),
            body: err.to_string().into_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> RouteMeta {
        RouteMeta {
            gateway: GatewayId::new("lobby"),
            client: ClientId::new("c-1"),
            shard: ShardId::new("shard-0"),
        }
    }

    #[test]
    fn request_envelope_serde_roundtrip() {
        let env = Envelope::Request(RequestEnvelope {
            meta: sample_meta(),
            request: ClientRequest {
                method: "GET".into(),
                headers: HashMap::from([("Upgrade".into(), "websocket".into())]),
                body: vec![],
            },
        });
        let bytes = rmp_serde::to_vec(&env).unwrap();
        let decoded: Envelope = rmp_serde::from_slice(&bytes).unwrap();
        match decoded {
            Envelope::Request(r) => {
                assert_eq!(r.meta.client, ClientId::new("c-1"));
                assert_eq!(r.request.header("upgrade"), Some("websocket"));
            }
            other => panic!("expected Request variant, got {other:?}"),
        }
    }

    #[test]
    fn close_notice_serde_roundtrip() {
        let env = Envelope::Close(CloseNotice {
            gateway: GatewayId::new("lobby"),
            shard: ShardId::new("shard-0"),
            client: ClientId::new("c-1"),
            is_empty: true,
        });
        let bytes = rmp_serde::to_vec(&env).unwrap();
        let decoded: Envelope = rmp_serde::from_slice(&bytes).unwrap();
        match decoded {
            Envelope::Close(c) => {
                assert!(c.is_empty);
                assert_eq!(c.shard, ShardId::new("shard-0"));
            }
            other => panic!("expected Close variant, got {other:?}"),
        }
    }

    #[test]
    fn relay_serde_roundtrips() {
        let b = Envelope::Broadcast(BroadcastRelay {
            sender: ClientId::new("c-1"),
            message: b"hello".to_vec(),
        });
        let bytes = rmp_serde::to_vec(&b).unwrap();
        assert!(matches!(
            rmp_serde::from_slice::<Envelope>(&bytes).unwrap(),
            Envelope::Broadcast(_)
        ));

        let w = Envelope::Whisper(WhisperRelay {
            sender: ClientId::new("c-1"),
            target: ClientId::new("c-2"),
            message: b"psst".to_vec(),
        });
        let bytes = rmp_serde::to_vec(&w).unwrap();
        match rmp_serde::from_slice::<Envelope>(&bytes).unwrap() {
            Envelope::Whisper(w) => assert_eq!(w.target, ClientId::new("c-2")),
            other => panic!("expected Whisper variant, got {other:?}"),
        }
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let req = ClientRequest {
            method: "GET".into(),
            headers: HashMap::from([("Sec-WebSocket-Version".into(), "13".into())]),
            body: vec![],
        };
        assert_eq!(req.header("sec-websocket-version"), Some("13"));
        assert_eq!(req.header("missing"), None);
    }

    #[test]
    fn rejection_carries_status_and_diagnostic() {
        let err = crate::error::RoutingError::Validation {
            reason: "missing client id".into(),
        };
        match Reply::rejection(&err) {
            Reply::Response { status, body } => {
                assert_eq!(status, 400);
                assert!(String::from_utf8(body).unwrap().contains("missing client id"));
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }
}
