//! Two-node scenarios over real loopback TLS connections.

mod common;

use std::sync::Arc;

use serde_json::json;

use crossmesh::config::NodeConfig;
use crossmesh::identity::NodeIdentity;
use crossmesh::p2p::message::status;
use crossmesh::resource::{MemoryResource, ResourcePath, ResourceRequest};

use common::{start_node, wait_until};

#[tokio::test]
async fn catalogs_converge_in_both_directions() {
    let server = start_node(Vec::new()).await;
    let server_path = ResourcePath::new("net1", "chainA", "resX");
    server
        .table
        .register(Arc::new(MemoryResource::new(&server_path)));

    let client = start_node(vec![server.addr.to_string()]).await;
    let client_path = ResourcePath::new("net2", "chainB", "resY");
    client
        .table
        .register(Arc::new(MemoryResource::new(&client_path)));

    // the dialer learns the listener's catalog...
    {
        let service = client.service.clone();
        let path = server_path.clone();
        wait_until("client to learn server catalog", move || {
            service.peers().find_owner(&path).is_some()
        })
        .await;
    }
    // ...and the listener independently learns the dialer's
    {
        let service = server.service.clone();
        let path = client_path.clone();
        wait_until("server to learn client catalog", move || {
            service.peers().find_owner(&path).is_some()
        })
        .await;
    }

    let owner = client.service.peers().find_owner(&server_path).unwrap();
    assert_eq!(owner.id, server.node_id);
}

#[tokio::test]
async fn remote_call_round_trips_over_tls() {
    let server = start_node(Vec::new()).await;
    let path = ResourcePath::new("payment", "chain0", "ledger");
    server.table.register(Arc::new(MemoryResource::new(&path)));

    let client = start_node(vec![server.addr.to_string()]).await;
    {
        let service = client.service.clone();
        let path = path.clone();
        wait_until("catalog sync", move || {
            service.peers().find_owner(&path).is_some()
        })
        .await;
    }

    let proxy = client.service.remote(&path).expect("remote proxy");
    let set = proxy
        .call(ResourceRequest {
            op: "set".into(),
            data: json!({"key": "acct-1", "value": {"balance": 250}}),
            resource: None,
        })
        .await;
    assert_eq!(set.error_code, 0, "set failed: {}", set.error_message);

    let get = proxy
        .call(ResourceRequest {
            op: "get".into(),
            data: json!({"key": "acct-1"}),
            resource: None,
        })
        .await;
    assert_eq!(get.error_code, 0);
    assert_eq!(get.data, json!({"balance": 250}));
}

#[tokio::test]
async fn catalog_update_propagates_after_initial_sync() {
    let server = start_node(Vec::new()).await;
    let first = ResourcePath::new("net1", "chainA", "resX");
    server.table.register(Arc::new(MemoryResource::new(&first)));

    let client = start_node(vec![server.addr.to_string()]).await;
    {
        let service = client.service.clone();
        let path = first.clone();
        wait_until("initial sync", move || {
            service.peers().find_owner(&path).is_some()
        })
        .await;
    }

    // a later registration bumps the catalog version; the periodic
    // announcement carries it over without a reconnect
    let second = ResourcePath::new("net1", "chainA", "resNew");
    server.table.register(Arc::new(MemoryResource::new(&second)));
    {
        let service = client.service.clone();
        let path = second.clone();
        wait_until("update propagation", move || {
            service.peers().find_owner(&path).is_some()
        })
        .await;
    }
}

#[tokio::test]
async fn unroutable_peer_yields_remote_query_failed() {
    let node = start_node(Vec::new()).await;
    let nobody = NodeIdentity::new("feedface".repeat(8), "127.0.0.1:1".parse().unwrap());
    let proxy = node
        .service
        .remote_to(nobody, ResourcePath::new("net1", "chainA", "resX"));

    let response = proxy.call(ResourceRequest::default()).await;
    assert_eq!(response.error_code, status::REMOTE_QUERY_FAILED);
}

#[tokio::test]
async fn concurrent_calls_resolve_independently() {
    let server = start_node(Vec::new()).await;
    let path = ResourcePath::new("net1", "chainA", "resX");
    server.table.register(Arc::new(MemoryResource::new(&path)));

    let client = start_node(vec![server.addr.to_string()]).await;
    {
        let service = client.service.clone();
        let path = path.clone();
        wait_until("catalog sync", move || {
            service.peers().find_owner(&path).is_some()
        })
        .await;
    }

    let proxy = Arc::new(client.service.remote(&path).expect("remote proxy"));
    let mut tasks = Vec::new();
    for i in 0..8 {
        let proxy = proxy.clone();
        tasks.push(tokio::spawn(async move {
            let set = proxy
                .call(ResourceRequest {
                    op: "set".into(),
                    data: json!({"key": format!("k{}", i), "value": i}),
                    resource: None,
                })
                .await;
            assert_eq!(set.error_code, 0);

            let get = proxy
                .call(ResourceRequest {
                    op: "get".into(),
                    data: json!({"key": format!("k{}", i)}),
                    resource: None,
                })
                .await;
            assert_eq!(get.error_code, 0);
            assert_eq!(get.data, json!(i));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn config_loads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("node.toml");
    std::fs::write(
        &config_path,
        r#"
            [node]
            listen_addr = "127.0.0.1:0"

            [tls]
            cert_path = "node_cert.pem"
            key_path = "node_key.pem"

            [p2p]
            peers = ["127.0.0.1:8942"]

            [[resources]]
            path = "payment/chain0/ledger"
        "#,
    )
    .unwrap();

    let config = NodeConfig::load(&config_path).unwrap();
    assert_eq!(config.p2p.peers, vec!["127.0.0.1:8942".to_string()]);
    assert_eq!(config.resources[0].stub_type, "memory");
}
