//! Resource model and the driver boundary.
//!
//! A resource is an addressable backend endpoint keyed by
//! `network/chain/resource`. Drivers implement [`Resource`]; routing to a
//! driver goes through [`ResourceRouter`]. The [`LocalResourceTable`] backs
//! both, and doubles as the catalog snapshot provider the control protocol
//! answers `requestPeerInfo` from.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::P2pError;

/// Three-segment resource address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    pub network: String,
    pub chain: String,
    pub resource: String,
}

impl ResourcePath {
    pub fn new(network: &str, chain: &str, resource: &str) -> Self {
        Self {
            network: network.to_string(),
            chain: chain.to_string(),
            resource: resource.to_string(),
        }
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.network, self.chain, self.resource)
    }
}

impl FromStr for ResourcePath {
    type Err = P2pError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(P2pError::Config(format!(
                "resource path '{}' is not network/chain/resource",
                s
            )));
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

/// Wire-visible description of one advertised resource.
///
/// Immutable once published under a given catalog version; catalog updates
/// replace whole snapshots, never individual entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub path: String,
    pub stub_type: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Request payload crossing the driver boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub data: Value,
    /// Resource metadata a caller may attach. The remote proxy strips this
    /// before sending: the owning side resolves identity from its own path
    /// lookup, never from caller-supplied data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceInfo>,
}

/// Result payload crossing the driver boundary. `error_code == 0` is success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceResponse {
    pub error_code: i32,
    pub error_message: String,
    #[serde(default)]
    pub data: Value,
}

impl ResourceResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            error_code: 0,
            error_message: "success".to_string(),
            data,
        }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self {
            error_code: code,
            error_message: message.into(),
            data: Value::Null,
        }
    }
}

/// A backend driver endpoint. Implementations own their backend timeout
/// policy; `on_remote_call` must not block its worker indefinitely.
pub trait Resource: Send + Sync {
    fn info(&self) -> ResourceInfo;

    /// Entry point for calls arriving from remote peers.
    fn on_remote_call(&self, request: ResourceRequest) -> anyhow::Result<ResourceResponse>;
}

/// Routing collaborator: resolve an addressed resource, or not-found.
pub trait ResourceRouter: Send + Sync {
    fn resolve(&self, path: &ResourcePath) -> Option<Arc<dyn Resource>>;
}

/// Catalog snapshot provider: what this node currently advertises.
pub trait CatalogProvider: Send + Sync {
    fn catalog_seq(&self) -> u32;

    /// Version and contents read as one consistent snapshot.
    fn catalog_snapshot(&self) -> (u32, HashMap<String, ResourceInfo>);
}

struct TableInner {
    seq: u32,
    entries: HashMap<String, Arc<dyn Resource>>,
}

/// In-process resource table: the node's local catalog.
///
/// Registering or removing a resource bumps the catalog version, which the
/// announcer then gossips to peers.
pub struct LocalResourceTable {
    inner: RwLock<TableInner>,
}

impl LocalResourceTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner {
                seq: 1,
                entries: HashMap::new(),
            }),
        }
    }

    pub fn register(&self, resource: Arc<dyn Resource>) {
        let mut inner = self.inner.write();
        inner.entries.insert(resource.info().path, resource);
        inner.seq = inner.seq.wrapping_add(1).max(1);
    }

    pub fn remove(&self, path: &str) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.entries.remove(path).is_some();
        if removed {
            inner.seq = inner.seq.wrapping_add(1).max(1);
        }
        removed
    }
}

impl Default for LocalResourceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRouter for LocalResourceTable {
    fn resolve(&self, path: &ResourcePath) -> Option<Arc<dyn Resource>> {
        self.inner.read().entries.get(&path.to_string()).cloned()
    }
}

impl CatalogProvider for LocalResourceTable {
    fn catalog_seq(&self) -> u32 {
        self.inner.read().seq
    }

    fn catalog_snapshot(&self) -> (u32, HashMap<String, ResourceInfo>) {
        let inner = self.inner.read();
        let catalog = inner
            .entries
            .iter()
            .map(|(path, res)| (path.clone(), res.info()))
            .collect();
        (inner.seq, catalog)
    }
}

/// Reference driver: an in-process key-value store. Useful for wiring tests
/// and as the `memory` stub type in node config.
pub struct MemoryResource {
    info: ResourceInfo,
    store: Mutex<HashMap<String, Value>>,
}

impl MemoryResource {
    pub fn new(path: &ResourcePath) -> Self {
        Self {
            info: ResourceInfo {
                path: path.to_string(),
                stub_type: "memory".to_string(),
                properties: HashMap::new(),
            },
            store: Mutex::new(HashMap::new()),
        }
    }
}

impl Resource for MemoryResource {
    fn info(&self) -> ResourceInfo {
        self.info.clone()
    }

    fn on_remote_call(&self, request: ResourceRequest) -> anyhow::Result<ResourceResponse> {
        match request.op.as_str() {
            "set" => {
                let key = request.data["key"]
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("set requires a string 'key'"))?
                    .to_string();
                let value = request.data["value"].clone();
                self.store.lock().insert(key, value);
                Ok(ResourceResponse::ok(Value::Null))
            }
            "get" => {
                let key = request.data["key"]
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("get requires a string 'key'"))?;
                let value = self
                    .store
                    .lock()
                    .get(key)
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(ResourceResponse::ok(value))
            }
            other => Ok(ResourceResponse::error(
                1,
                format!("unsupported operation: {}", other),
            )),
        }
    }
}
