//! Channel lifecycle: listener, dialer, and per-connection task pair.
//!
//! Each live connection gets one reader task and one writer task. The reader
//! reassembles frames and dispatches each on a spawned worker, so handler
//! logic (which may itself issue network calls) never re-enters the I/O
//! path. Identity comes from the peer's verified certificate, established
//! before any frame is processed; a connection without a certificate chain
//! is closed without ever touching the registries.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, MissedTickBehavior};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::error::P2pError;
use crate::identity::{node_id_from_cert, NodeIdentity};
use crate::p2p::connections::ConnectionRegistry;
use crate::p2p::engine::MessageEngine;
use crate::p2p::message::{
    Envelope, HeartbeatPayload, MessageType, P2pMessage, PeerSeqPayload,
};
use crate::p2p::peer_registry::PeerRegistry;
use crate::p2p::processor::RequestProcessor;
use crate::p2p::{DIAL_TIMEOUT_SECS, HANDSHAKE_TIMEOUT_SECS};
use crate::remote::RemoteResource;
use crate::resource::{CatalogProvider, ResourcePath, ResourceRouter};
use crate::tls::TlsIdentity;

type TlsIo = tokio_rustls::TlsStream<TcpStream>;

pub struct P2pService {
    config: NodeConfig,
    node_id: String,
    connections: Arc<ConnectionRegistry>,
    peers: Arc<PeerRegistry>,
    engine: Arc<MessageEngine>,
    processor: Arc<RequestProcessor>,
    catalog: Arc<dyn CatalogProvider>,
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl P2pService {
    /// Build the service from config, loading TLS material from disk.
    pub fn new(
        config: NodeConfig,
        router: Arc<dyn ResourceRouter>,
        catalog: Arc<dyn CatalogProvider>,
    ) -> Result<Arc<Self>, P2pError> {
        let identity = TlsIdentity::load(&config.tls.cert_path, &config.tls.key_path)?;
        Self::with_identity(config, identity, router, catalog)
    }

    /// Build the service with already-loaded TLS material.
    pub fn with_identity(
        config: NodeConfig,
        identity: TlsIdentity,
        router: Arc<dyn ResourceRouter>,
        catalog: Arc<dyn CatalogProvider>,
    ) -> Result<Arc<Self>, P2pError> {
        let node_id = identity.node_id()?;
        let acceptor = TlsAcceptor::from(identity.server_config()?);
        let connector = TlsConnector::from(identity.client_config()?);

        let connections = Arc::new(ConnectionRegistry::new());
        let peers = Arc::new(PeerRegistry::new());
        let engine = Arc::new(MessageEngine::new(connections.clone()));
        let request_timeout = Duration::from_secs(config.p2p.request_timeout_secs);
        let processor = Arc::new(RequestProcessor::new(
            peers.clone(),
            router,
            catalog.clone(),
            engine.clone(),
            request_timeout,
        ));

        Ok(Arc::new(Self {
            config,
            node_id,
            connections,
            peers,
            engine,
            processor,
            catalog,
            acceptor,
            connector,
        }))
    }

    /// Bind the listener and launch the background loops. Returns the bound
    /// address (useful when configured with port 0).
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, P2pError> {
        let listener = TcpListener::bind(self.config.node.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(node_id = %short(&self.node_id), addr = %local_addr, "p2p service started");

        tokio::spawn(self.clone().accept_loop(listener));
        for endpoint in self.config.p2p.peers.clone() {
            tokio::spawn(self.clone().dial_loop(endpoint));
        }
        tokio::spawn(self.clone().announce_loop());
        Ok(local_addr)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn engine(&self) -> &Arc<MessageEngine> {
        &self.engine
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Proxy for a resource some connected peer advertises, if any.
    pub fn remote(&self, path: &ResourcePath) -> Option<RemoteResource> {
        let owner = self.peers.find_owner(path)?;
        Some(self.remote_to(owner, path.clone()))
    }

    /// Proxy targeting an explicit peer, routable or not.
    pub fn remote_to(&self, peer: NodeIdentity, path: ResourcePath) -> RemoteResource {
        RemoteResource::new(
            peer,
            path,
            self.engine.clone(),
            Duration::from_secs(self.config.p2p.request_timeout_secs),
        )
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let service = self.clone();
                    tokio::spawn(async move {
                        service.handle_inbound(stream, addr).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let handshake = self.acceptor.accept(stream);
        let tls = match timeout(Duration::from_secs(HANDSHAKE_TIMEOUT_SECS), handshake).await {
            Ok(Ok(tls)) => TlsIo::from(tls),
            Ok(Err(e)) => {
                warn!(peer_addr = %addr, error = %e, "tls handshake failed");
                return;
            }
            Err(_) => {
                warn!(peer_addr = %addr, "tls handshake timed out");
                return;
            }
        };
        match self.peer_identity(&tls, addr) {
            Ok(identity) => self.run_connection(tls, identity).await,
            Err(e) => warn!(peer_addr = %addr, error = %e, "closing connection without identity"),
        }
    }

    async fn dial_loop(self: Arc<Self>, endpoint: String) {
        let retry = Duration::from_secs(self.config.p2p.dial_retry_secs);
        let mut known_id: Option<String> = None;
        loop {
            // if the peer dialed us in the meantime, keep that connection
            if let Some(id) = &known_id {
                if self.connections.is_connected(id) {
                    sleep(retry).await;
                    continue;
                }
            }
            match self.dial(&endpoint).await {
                Ok((tls, identity)) => {
                    known_id = Some(identity.id.clone());
                    self.clone().run_connection(tls, identity).await;
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "dial failed");
                }
            }
            sleep(retry).await;
        }
    }

    async fn dial(&self, endpoint: &str) -> Result<(TlsIo, NodeIdentity), P2pError> {
        let stream = timeout(
            Duration::from_secs(DIAL_TIMEOUT_SECS),
            TcpStream::connect(endpoint),
        )
        .await
        .map_err(|_| P2pError::Handshake(format!("dial {} timed out", endpoint)))??;
        stream.set_nodelay(true)?;
        let addr = stream.peer_addr()?;

        // identity comes from the peer certificate, so SNI is a placeholder
        let server_name = ServerName::try_from(format!("node-{}.mesh.invalid", addr.port()))
            .map_err(|e| P2pError::Handshake(format!("bad sni: {}", e)))?;
        let tls = timeout(
            Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            self.connector.connect(server_name, stream),
        )
        .await
        .map_err(|_| P2pError::Handshake(format!("tls handshake with {} timed out", endpoint)))??;

        let tls = TlsIo::from(tls);
        let identity = self.peer_identity(&tls, addr)?;
        Ok((tls, identity))
    }

    /// Derive the peer's identity from its verified certificate chain.
    fn peer_identity(&self, tls: &TlsIo, addr: SocketAddr) -> Result<NodeIdentity, P2pError> {
        let (_, session) = tls.get_ref();
        let certs = session
            .peer_certificates()
            .ok_or_else(|| P2pError::Handshake("no peer certificate chain".into()))?;
        let leaf = certs
            .first()
            .ok_or_else(|| P2pError::Handshake("empty peer certificate chain".into()))?;
        let id = node_id_from_cert(leaf.as_ref())?;
        if id == self.node_id {
            return Err(P2pError::Handshake("connected to self".into()));
        }
        Ok(NodeIdentity::new(id, addr))
    }

    /// Own one live connection: register it, pump frames until close, then
    /// clean up (only if this handle is still the registered one).
    async fn run_connection(self: Arc<Self>, stream: TlsIo, identity: NodeIdentity) {
        let (mut reader, writer) = tokio::io::split(stream);
        let (handle, outbound) = self.connections.insert(identity.clone());
        let connection_id = handle.connection_id;
        self.peers.note_connected(&identity);
        info!(peer = %identity, connection_id, "peer connected");

        let writer_task = tokio::spawn(write_loop(writer, outbound, identity.clone()));

        // connect event: announce our catalog version, off this I/O path
        {
            let service = self.clone();
            let peer_id = identity.id.clone();
            tokio::spawn(async move {
                service.announce_seq_to(&peer_id).await;
            });
        }

        loop {
            match Envelope::read_from(&mut reader, self.config.p2p.max_frame_bytes).await {
                Ok(envelope) => self.dispatch(&identity, envelope, &handle.sender),
                Err(P2pError::Io(e)) => {
                    debug!(peer = %identity, error = %e, "connection closed");
                    break;
                }
                Err(e) => {
                    warn!(peer = %identity, error = %e, "protocol error, closing connection");
                    break;
                }
            }
        }

        writer_task.abort();
        if self.connections.remove_if_current(&identity.id, connection_id) {
            self.peers.remove(&identity.id);
            info!(peer = %identity, connection_id, "peer disconnected");
        } else {
            debug!(peer = %identity, connection_id, "superseded connection closed");
        }
    }

    /// Route one inbound frame. Requests run on a spawned worker; responses
    /// complete their pending call; heartbeat probes are answered in place.
    fn dispatch(self: &Arc<Self>, from: &NodeIdentity, envelope: Envelope, reply: &mpsc::Sender<Envelope>) {
        match envelope.msg_type() {
            Some(MessageType::ResourceRequest) => {
                let service = self.clone();
                let from = from.clone();
                let reply = reply.clone();
                tokio::spawn(async move {
                    if let Some(response) = service.processor.process(&from, &envelope).await {
                        if reply.send(response).await.is_err() {
                            debug!(peer = %from, "response dropped, connection gone");
                        }
                    }
                });
            }
            Some(MessageType::ResourceResponse) => self.engine.handle_response(envelope),
            Some(MessageType::Heartbeat) => self.on_heartbeat(from, envelope, reply),
            None => {
                warn!(peer = %from, type_code = envelope.type_code, "unknown envelope type dropped");
            }
        }
    }

    fn on_heartbeat(&self, from: &NodeIdentity, envelope: Envelope, reply: &mpsc::Sender<Envelope>) {
        let probe: HeartbeatPayload = match serde_json::from_slice(&envelope.payload) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(peer = %from, error = %e, "malformed heartbeat dropped");
                return;
            }
        };
        if probe.state != 0 {
            trace!(peer = %from, seq = envelope.seq, "heartbeat reply");
            return;
        }
        let pong = HeartbeatPayload { state: 1 };
        match serde_json::to_vec(&pong) {
            Ok(payload) => {
                let reply = reply.clone();
                let envelope = Envelope::new(MessageType::Heartbeat, envelope.seq, payload);
                let peer = from.clone();
                tokio::spawn(async move {
                    if reply.send(envelope).await.is_err() {
                        debug!(peer = %peer, "heartbeat reply dropped, connection gone");
                    }
                });
            }
            Err(e) => debug!(peer = %from, error = %e, "heartbeat reply serialization failed"),
        }
    }

    async fn announce_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.p2p.announce_interval_secs,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for identity in self.connections.identities() {
                self.announce_seq_to(&identity.id).await;
            }
        }
    }

    /// Cheap half of the anti-entropy exchange: gossip our catalog version.
    /// The receiver fetches the full snapshot only on detected divergence.
    async fn announce_seq_to(&self, node_id: &str) {
        let seq = self.catalog.catalog_seq();
        let data = match serde_json::to_value(PeerSeqPayload { seq }) {
            Ok(data) => data,
            Err(_) => return,
        };
        let msg: P2pMessage<Value> = P2pMessage::new("seq", data);
        match self.engine.send(node_id, msg).await {
            Ok(()) => trace!(peer_id = %short(node_id), seq, "announced catalog version"),
            Err(e) => debug!(peer_id = %short(node_id), error = %e, "seq announcement failed"),
        }
    }
}

async fn write_loop(
    mut writer: WriteHalf<TlsIo>,
    mut outbound: mpsc::Receiver<Envelope>,
    peer: NodeIdentity,
) {
    while let Some(envelope) = outbound.recv().await {
        if let Err(e) = envelope.write_to(&mut writer).await {
            debug!(peer = %peer, error = %e, "write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

fn short(id: &str) -> &str {
    &id[..id.len().min(16)]
}
