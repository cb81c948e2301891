//! Shared two-node harness: each node gets a throwaway self-signed
//! identity and a listener on an ephemeral loopback port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crossmesh::config::{NodeConfig, NodeSection, P2pSection, TlsSection};
use crossmesh::p2p::P2pService;
use crossmesh::resource::LocalResourceTable;
use crossmesh::tls::{self, TlsIdentity};

pub struct TestNode {
    pub service: Arc<P2pService>,
    pub table: Arc<LocalResourceTable>,
    pub addr: SocketAddr,
    pub node_id: String,
}

/// Start a node on 127.0.0.1:0 that keeps dialing `peers`.
pub async fn start_node(peers: Vec<String>) -> TestNode {
    let (cert_pem, key_pem) = tls::generate_identity_pem().expect("generate identity");
    let identity = TlsIdentity::from_pem(&cert_pem, &key_pem).expect("load identity");

    let config = NodeConfig {
        node: NodeSection {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
        },
        tls: TlsSection {
            // unused: the identity is injected directly
            cert_path: "unused.pem".into(),
            key_path: "unused.pem".into(),
        },
        p2p: P2pSection {
            peers,
            request_timeout_secs: 5,
            announce_interval_secs: 1,
            dial_retry_secs: 1,
            max_frame_bytes: 1024 * 1024,
        },
        resources: Vec::new(),
    };

    let table = Arc::new(LocalResourceTable::new());
    let service = P2pService::with_identity(config, identity, table.clone(), table.clone())
        .expect("build service");
    let addr = service.start().await.expect("start service");

    TestNode {
        node_id: service.node_id().to_string(),
        service,
        table,
        addr,
    }
}

/// Poll `condition` for up to ~10 seconds before giving up.
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}
