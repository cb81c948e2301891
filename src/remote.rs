//! Remote resource proxy.
//!
//! Adapts a call-shaped invocation into a wire exchange: build the
//! `network/chain/resource/transaction` message, await the correlated
//! response, and hand the caller a plain `ResourceResponse`. Remote
//! failures (no route, reset, deadline) come back as data with a
//! remote-query-failed code, never as errors or panics.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::identity::NodeIdentity;
use crate::p2p::engine::MessageEngine;
use crate::p2p::message::{status, P2pMessage};
use crate::resource::{ResourcePath, ResourceRequest, ResourceResponse};

/// Caller-side handle for a resource owned by a remote peer.
pub struct RemoteResource {
    peer: NodeIdentity,
    path: ResourcePath,
    engine: Arc<MessageEngine>,
    deadline: Duration,
}

impl RemoteResource {
    pub fn new(
        peer: NodeIdentity,
        path: ResourcePath,
        engine: Arc<MessageEngine>,
        deadline: Duration,
    ) -> Self {
        Self {
            peer,
            path,
            engine,
            deadline,
        }
    }

    pub fn peer(&self) -> &NodeIdentity {
        &self.peer
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// Invoke the remote resource and wait for its result.
    pub async fn call(&self, mut request: ResourceRequest) -> ResourceResponse {
        // the owning side resolves identity from its own lookup; caller-side
        // metadata is stripped so it cannot spoof a different resource
        request.resource = None;

        let data = match serde_json::to_value(&request) {
            Ok(data) => data,
            Err(e) => {
                return ResourceResponse::error(
                    status::REMOTE_QUERY_FAILED,
                    format!("request serialization failed: {}", e),
                )
            }
        };
        let method = format!("{}/transaction", self.path);
        let msg = P2pMessage::new(&method, data);

        match self
            .engine
            .request::<ResourceResponse>(&self.peer.id, msg, self.deadline)
            .await
        {
            Ok(response) if response.result == status::SUCCESS => {
                response.data.unwrap_or_else(|| {
                    ResourceResponse::error(
                        status::REMOTE_QUERY_FAILED,
                        "remote response carried no data",
                    )
                })
            }
            Ok(response) => {
                debug!(
                    peer = %self.peer,
                    path = %self.path,
                    result = response.result,
                    "remote call rejected"
                );
                ResourceResponse::error(response.result, response.message)
            }
            Err(e) => {
                warn!(peer = %self.peer, path = %self.path, error = %e, "remote call failed");
                ResourceResponse::error(
                    status::REMOTE_QUERY_FAILED,
                    format!("remote call failed: {}", e),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::connections::ConnectionRegistry;
    use crate::p2p::message::{Envelope, MessageType, P2pResponse};
    use serde_json::{json, Value};

    fn peer() -> NodeIdentity {
        NodeIdentity::new("owner1".into(), "127.0.0.1:9000".parse().unwrap())
    }

    #[tokio::test]
    async fn unroutable_peer_resolves_as_remote_query_failed() {
        let connections = Arc::new(ConnectionRegistry::new());
        let engine = Arc::new(MessageEngine::new(connections));
        let proxy = RemoteResource::new(
            peer(),
            "net1/chainA/resX".parse().unwrap(),
            engine,
            Duration::from_millis(200),
        );

        let response = proxy.call(ResourceRequest::default()).await;
        assert_eq!(response.error_code, status::REMOTE_QUERY_FAILED);
    }

    #[tokio::test]
    async fn strips_caller_supplied_resource_metadata() {
        let connections = Arc::new(ConnectionRegistry::new());
        let (_, mut wire) = connections.insert(peer());
        let engine = Arc::new(MessageEngine::new(connections));

        let responder = engine.clone();
        let inspect = tokio::spawn(async move {
            let sent = wire.recv().await.unwrap();
            let msg: P2pMessage<Value> = P2pMessage::from_payload(&sent.payload).unwrap();
            assert_eq!(msg.method, "net1/chainA/resX/transaction");
            assert!(msg.data.get("resource").is_none());

            let reply: P2pResponse<Value> = P2pResponse::success(
                sent.seq,
                serde_json::to_value(ResourceResponse::ok(json!("done"))).unwrap(),
            );
            responder.handle_response(Envelope::new(
                MessageType::ResourceResponse,
                sent.seq,
                reply.to_payload().unwrap(),
            ));
        });

        let proxy = RemoteResource::new(
            peer(),
            "net1/chainA/resX".parse().unwrap(),
            engine,
            Duration::from_secs(5),
        );
        let request = ResourceRequest {
            op: "set".into(),
            data: json!({"key": "k"}),
            resource: Some(crate::resource::ResourceInfo {
                path: "spoofed/else/where".into(),
                stub_type: "memory".into(),
                properties: Default::default(),
            }),
        };
        let response = proxy.call(request).await;
        inspect.await.unwrap();

        assert_eq!(response.error_code, 0);
        assert_eq!(response.data, json!("done"));
    }

    #[tokio::test]
    async fn application_error_passes_through_as_data() {
        let connections = Arc::new(ConnectionRegistry::new());
        let (_, mut wire) = connections.insert(peer());
        let engine = Arc::new(MessageEngine::new(connections));

        let responder = engine.clone();
        tokio::spawn(async move {
            let sent = wire.recv().await.unwrap();
            let reply: P2pResponse<Value> =
                P2pResponse::error(sent.seq, status::RESOURCE_NOT_FOUND, "gone");
            responder.handle_response(Envelope::new(
                MessageType::ResourceResponse,
                sent.seq,
                reply.to_payload().unwrap(),
            ));
        });

        let proxy = RemoteResource::new(
            peer(),
            "net1/chainA/resX".parse().unwrap(),
            engine,
            Duration::from_secs(5),
        );
        let response = proxy.call(ResourceRequest::default()).await;
        assert_eq!(response.error_code, status::RESOURCE_NOT_FOUND);
        assert_eq!(response.error_message, "gone");
    }
}
