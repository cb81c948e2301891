//! Message engine: request/response correlation over live connections.
//!
//! Every outstanding request is a pending entry keyed by its correlation
//! seq, resolved exactly once: by the matching response, or by the deadline
//! (which removes the entry first, so a late response finds nothing and is
//! dropped). Responses never observed by a pending entry are logged and
//! ignored, never errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::P2pError;
use crate::p2p::connections::ConnectionRegistry;
use crate::p2p::message::{self, Envelope, MessageType, P2pMessage, P2pResponse};

struct PendingCall {
    expected: MessageType,
    created_at: Instant,
    completion: oneshot::Sender<Vec<u8>>,
}

pub struct MessageEngine {
    connections: Arc<ConnectionRegistry>,
    pending: DashMap<u32, PendingCall>,
}

impl MessageEngine {
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            connections,
            pending: DashMap::new(),
        }
    }

    /// Fire-and-forget send. Assigns a fresh seq when the message has none.
    pub async fn send(&self, node_id: &str, mut msg: P2pMessage<Value>) -> Result<(), P2pError> {
        if msg.seq == 0 {
            msg.seq = message::next_seq();
        }
        let envelope = Envelope::new(MessageType::ResourceRequest, msg.seq, msg.to_payload()?);
        self.send_envelope(node_id, envelope).await
    }

    /// Send a request and await its correlated response up to `deadline`.
    ///
    /// The response payload is deserialized as `P2pResponse<T>`. Transport
    /// failures and deadline expiry surface as `Err`; application-level
    /// failures arrive as nonzero `result` inside `Ok`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        node_id: &str,
        mut msg: P2pMessage<Value>,
        deadline: Duration,
    ) -> Result<P2pResponse<T>, P2pError> {
        // fresh seq, unique among currently-outstanding requests
        let seq = loop {
            let candidate = message::next_seq();
            if !self.pending.contains_key(&candidate) {
                break candidate;
            }
        };
        msg.seq = seq;

        let payload = msg.to_payload()?;
        let (completion, receiver) = oneshot::channel();
        self.pending.insert(
            seq,
            PendingCall {
                expected: MessageType::ResourceResponse,
                created_at: Instant::now(),
                completion,
            },
        );

        let envelope = Envelope::new(MessageType::ResourceRequest, seq, payload);
        if let Err(e) = self.send_envelope(node_id, envelope).await {
            self.pending.remove(&seq);
            return Err(e);
        }

        match tokio::time::timeout(deadline, receiver).await {
            Ok(Ok(payload)) => {
                let response: P2pResponse<T> = P2pResponse::from_payload(&payload)?;
                if response.seq != seq {
                    warn!(
                        expected = seq,
                        got = response.seq,
                        "response payload seq does not match envelope"
                    );
                }
                Ok(response)
            }
            // completion dropped without firing: the engine itself went away
            Ok(Err(_)) => Err(P2pError::NoRoute(node_id.to_string())),
            Err(_) => {
                // remove first so a late response cannot resurrect the call
                if let Some((_, call)) = self.pending.remove(&seq) {
                    debug!(
                        seq,
                        outstanding_ms = call.created_at.elapsed().as_millis() as u64,
                        "request timed out"
                    );
                }
                Err(P2pError::Timeout(seq))
            }
        }
    }

    /// Route an inbound response envelope to its pending call, if any.
    ///
    /// No match (already resolved, never registered, duplicate) is a
    /// logged no-op.
    pub fn handle_response(&self, envelope: Envelope) {
        let msg_type = envelope.msg_type();
        let removed = self
            .pending
            .remove_if(&envelope.seq, |_, call| Some(call.expected) == msg_type);
        match removed {
            Some((seq, call)) => {
                // completion delivery wakes the awaiting task; nothing runs
                // on this (I/O) path beyond the channel send
                if call.completion.send(envelope.payload).is_err() {
                    debug!(seq, "response arrived after caller gave up");
                }
            }
            None => {
                debug!(seq = envelope.seq, "unmatched response dropped");
            }
        }
    }

    pub(crate) async fn send_envelope(
        &self,
        node_id: &str,
        envelope: Envelope,
    ) -> Result<(), P2pError> {
        let sender = self
            .connections
            .sender_for(node_id)
            .ok_or_else(|| P2pError::NoRoute(node_id.to_string()))?;
        sender
            .send(envelope)
            .await
            .map_err(|_| P2pError::NoRoute(node_id.to_string()))
    }

    /// Number of not-yet-resolved requests.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;
    use crate::p2p::message::status;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn fixture() -> (Arc<ConnectionRegistry>, Arc<MessageEngine>, mpsc::Receiver<Envelope>) {
        let connections = Arc::new(ConnectionRegistry::new());
        let identity = NodeIdentity::new("peer1".into(), "127.0.0.1:8942".parse().unwrap());
        let (_, receiver) = connections.insert(identity);
        let engine = Arc::new(MessageEngine::new(connections.clone()));
        (connections, engine, receiver)
    }

    fn response_for(envelope: &Envelope, data: Value) -> Envelope {
        let response: P2pResponse<Value> = P2pResponse::success(envelope.seq, data);
        Envelope::new(
            MessageType::ResourceResponse,
            envelope.seq,
            response.to_payload().unwrap(),
        )
    }

    #[tokio::test]
    async fn request_resolves_with_matching_response() {
        let (_connections, engine, mut wire) = fixture();

        let responder = engine.clone();
        let task = tokio::spawn(async move {
            let sent = wire.recv().await.unwrap();
            responder.handle_response(response_for(&sent, json!("pong")));
            sent.seq
        });

        let response: P2pResponse<Value> = engine
            .request("peer1", P2pMessage::new("ping", Value::Null), Duration::from_secs(5))
            .await
            .unwrap();
        let sent_seq = task.await.unwrap();

        assert_eq!(response.result, status::SUCCESS);
        assert_eq!(response.seq, sent_seq);
        assert_eq!(response.data, Some(json!("pong")));
        assert_eq!(engine.outstanding(), 0);
    }

    #[tokio::test]
    async fn duplicate_response_is_noop() {
        let (_connections, engine, mut wire) = fixture();

        let responder = engine.clone();
        let task = tokio::spawn(async move {
            let sent = wire.recv().await.unwrap();
            responder.handle_response(response_for(&sent, json!(1)));
            // duplicate with different data: must be dropped silently
            responder.handle_response(response_for(&sent, json!(2)));
        });

        let response: P2pResponse<Value> = engine
            .request("peer1", P2pMessage::new("ping", Value::Null), Duration::from_secs(5))
            .await
            .unwrap();
        task.await.unwrap();

        assert_eq!(response.data, Some(json!(1)));
        assert_eq!(engine.outstanding(), 0);
    }

    #[tokio::test]
    async fn timeout_removes_entry_and_late_response_is_dropped() {
        let (_connections, engine, mut wire) = fixture();

        let err = engine
            .request::<Value>(
                "peer1",
                P2pMessage::new("ping", Value::Null),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, P2pError::Timeout(_)));
        assert_eq!(engine.outstanding(), 0);

        // very late response: table entry is gone, so this is a no-op
        let sent = wire.recv().await.unwrap();
        engine.handle_response(response_for(&sent, json!("late")));
        assert_eq!(engine.outstanding(), 0);
    }

    #[tokio::test]
    async fn no_route_fails_fast() {
        let (_connections, engine, _wire) = fixture();
        let err = engine
            .request::<Value>(
                "nobody",
                P2pMessage::new("ping", Value::Null),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, P2pError::NoRoute(_)));
        assert_eq!(engine.outstanding(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_out_of_order() {
        let (_connections, engine, mut wire) = fixture();

        let responder = engine.clone();
        let task = tokio::spawn(async move {
            let first = wire.recv().await.unwrap();
            let second = wire.recv().await.unwrap();
            // answer in reverse arrival order
            responder.handle_response(response_for(&second, json!({"for": second.seq})));
            responder.handle_response(response_for(&first, json!({"for": first.seq})));
        });

        let (a, b) = tokio::join!(
            engine.request::<Value>(
                "peer1",
                P2pMessage::new("ping", Value::Null),
                Duration::from_secs(5)
            ),
            engine.request::<Value>(
                "peer1",
                P2pMessage::new("ping", Value::Null),
                Duration::from_secs(5)
            ),
        );
        task.await.unwrap();

        let a = a.unwrap();
        let b = b.unwrap();
        assert_ne!(a.seq, b.seq);
        assert_eq!(a.data, Some(json!({"for": a.seq})));
        assert_eq!(b.data, Some(json!({"for": b.seq})));
    }

    #[tokio::test]
    async fn wrong_type_response_does_not_consume_pending_entry() {
        let (_connections, engine, mut wire) = fixture();

        let responder = engine.clone();
        let task = tokio::spawn(async move {
            let sent = wire.recv().await.unwrap();
            // a request-typed frame with a matching seq must not resolve the call
            responder.handle_response(Envelope::new(
                MessageType::ResourceRequest,
                sent.seq,
                Vec::new(),
            ));
            responder.handle_response(response_for(&sent, json!("real")));
        });

        let response: P2pResponse<Value> = engine
            .request("peer1", P2pMessage::new("ping", Value::Null), Duration::from_secs(5))
            .await
            .unwrap();
        task.await.unwrap();
        assert_eq!(response.data, Some(json!("real")));
    }
}
