//! Request processor: dispatch for inbound application messages.
//!
//! The method string decides the route. A single segment is a control verb
//! for peer discovery/sync; four segments address a resource call
//! (`network/chain/resource/verb`); anything else is malformed. Parsing
//! happens once, up front, into a tagged variant.
//!
//! Application failures (resource missing, unsupported verb, driver error)
//! always come back as well-formed error responses on the same correlation
//! seq so the remote caller's pending call resolves. Only the pure `seq`
//! acknowledgment suppresses its response.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::identity::NodeIdentity;
use crate::p2p::engine::MessageEngine;
use crate::p2p::message::{
    status, version_compatible, Envelope, MessageType, P2pMessage, P2pResponse, PeerInfoPayload,
    PeerSeqPayload,
};
use crate::p2p::peer_registry::PeerRegistry;
use crate::resource::{CatalogProvider, ResourcePath, ResourceRequest, ResourceRouter};

enum MethodKind<'a> {
    Control(&'a str),
    ResourceCall {
        network: &'a str,
        chain: &'a str,
        resource: &'a str,
        verb: &'a str,
    },
    Malformed,
}

fn parse_method(method: &str) -> MethodKind<'_> {
    let parts: Vec<&str> = method.split('/').collect();
    match *parts.as_slice() {
        [verb] => MethodKind::Control(verb),
        [network, chain, resource, verb] => MethodKind::ResourceCall {
            network,
            chain,
            resource,
            verb,
        },
        _ => MethodKind::Malformed,
    }
}

pub struct RequestProcessor {
    peers: Arc<PeerRegistry>,
    router: Arc<dyn ResourceRouter>,
    catalog: Arc<dyn CatalogProvider>,
    engine: Arc<MessageEngine>,
    request_timeout: Duration,
}

impl RequestProcessor {
    pub fn new(
        peers: Arc<PeerRegistry>,
        router: Arc<dyn ResourceRouter>,
        catalog: Arc<dyn CatalogProvider>,
        engine: Arc<MessageEngine>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            peers,
            router,
            catalog,
            engine,
            request_timeout,
        }
    }

    /// Handle one inbound request envelope; the returned envelope, if any,
    /// goes back on the same connection with the inbound seq.
    pub async fn process(&self, from: &NodeIdentity, envelope: &Envelope) -> Option<Envelope> {
        let msg: P2pMessage<Value> = match P2pMessage::from_payload(&envelope.payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %from, seq = envelope.seq, error = %e, "unparseable request payload dropped");
                return None;
            }
        };
        if !version_compatible(&msg.version) {
            warn!(peer = %from, version = %msg.version, "request with incompatible version dropped");
            return None;
        }

        debug!(peer = %from, seq = msg.seq, method = %msg.method, "request received");

        let response = match parse_method(&msg.method) {
            MethodKind::Control(verb) => self.on_control(from, verb, &msg),
            MethodKind::ResourceCall {
                network,
                chain,
                resource,
                verb,
            } => Some(self.on_resource_call(network, chain, resource, verb, &msg)),
            MethodKind::Malformed => {
                error!(peer = %from, seq = msg.seq, method = %msg.method, "invalid method format");
                Some(P2pResponse::error(
                    msg.seq,
                    status::INTERNAL_ERROR,
                    "invalid method format",
                ))
            }
        };

        let response = response?;
        match response.to_payload() {
            Ok(payload) => Some(Envelope::new(
                MessageType::ResourceResponse,
                envelope.seq,
                payload,
            )),
            Err(e) => {
                error!(peer = %from, seq = envelope.seq, error = %e, "response serialization failed");
                None
            }
        }
    }

    fn on_control(
        &self,
        from: &NodeIdentity,
        verb: &str,
        msg: &P2pMessage<Value>,
    ) -> Option<P2pResponse<Value>> {
        match verb {
            "requestPeerInfo" => {
                let (seq, resources) = self.catalog.catalog_snapshot();
                info!(peer = %from, seq, resources = resources.len(), "serving peer info");
                let payload = PeerInfoPayload { seq, resources };
                match serde_json::to_value(payload) {
                    Ok(data) => Some(P2pResponse::success(msg.seq, data)),
                    Err(e) => Some(P2pResponse::error(
                        msg.seq,
                        status::INTERNAL_ERROR,
                        e.to_string(),
                    )),
                }
            }
            "seq" => {
                let announced: PeerSeqPayload =
                    match serde_json::from_value(msg.data.clone()) {
                        Ok(payload) => payload,
                        Err(_) => {
                            warn!(peer = %from, "unrecognized seq announcement dropped");
                            return None;
                        }
                    };
                if self.peers.has_changed(&from.id, announced.seq) {
                    self.spawn_peer_info_fetch(from.clone());
                } else {
                    debug!(peer = %from, announced = announced.seq, "catalog already current");
                }
                // pure acknowledgment: no response
                None
            }
            other => {
                warn!(peer = %from, method = %other, "unsupported control method");
                Some(P2pResponse::error(
                    msg.seq,
                    status::METHOD_ERROR,
                    format!("unsupported method: {}", other),
                ))
            }
        }
    }

    /// Second round of the anti-entropy exchange: fetch the announcer's full
    /// snapshot and apply it, re-validating the version gate at apply time.
    fn spawn_peer_info_fetch(&self, from: NodeIdentity) {
        let engine = self.engine.clone();
        let peers = self.peers.clone();
        let deadline = self.request_timeout;
        tokio::spawn(async move {
            let request = P2pMessage::new("requestPeerInfo", Value::Null);
            match engine
                .request::<PeerInfoPayload>(&from.id, request, deadline)
                .await
            {
                Ok(response) if response.result == status::SUCCESS => match response.data {
                    Some(info) => {
                        if !peers.apply_snapshot(&from, info.seq, info.resources) {
                            debug!(peer = %from, seq = info.seq, "peer info not newer than cached");
                        }
                    }
                    None => warn!(peer = %from, "peer info response carried no data"),
                },
                Ok(response) => {
                    warn!(peer = %from, result = response.result, message = %response.message, "peer info request rejected");
                }
                Err(e) => {
                    warn!(peer = %from, error = %e, "peer info request failed");
                }
            }
        });
    }

    fn on_resource_call(
        &self,
        network: &str,
        chain: &str,
        resource: &str,
        verb: &str,
        msg: &P2pMessage<Value>,
    ) -> P2pResponse<Value> {
        let path = ResourcePath::new(network, chain, resource);
        let Some(target) = self.router.resolve(&path) else {
            warn!(path = %path, "resource not found");
            return P2pResponse::error(
                msg.seq,
                status::RESOURCE_NOT_FOUND,
                format!("resource not found: {}", path),
            );
        };

        match verb {
            "transaction" => {
                let request: ResourceRequest = match serde_json::from_value(msg.data.clone()) {
                    Ok(request) => request,
                    Err(e) => {
                        return P2pResponse::error(
                            msg.seq,
                            status::INTERNAL_ERROR,
                            format!("invalid request payload: {}", e),
                        )
                    }
                };
                match target.on_remote_call(request) {
                    Ok(result) => match serde_json::to_value(result) {
                        Ok(data) => P2pResponse::success(msg.seq, data),
                        Err(e) => {
                            P2pResponse::error(msg.seq, status::INTERNAL_ERROR, e.to_string())
                        }
                    },
                    Err(e) => {
                        warn!(path = %path, error = %e, "backend invocation failed");
                        P2pResponse::error(
                            msg.seq,
                            status::INTERNAL_ERROR,
                            format!("backend invocation failed: {}", e),
                        )
                    }
                }
            }
            other => {
                warn!(path = %path, method = %other, "unsupported resource method");
                P2pResponse::error(
                    msg.seq,
                    status::METHOD_ERROR,
                    format!("unsupported method: {}", other),
                )
            }
        }
    }
}
