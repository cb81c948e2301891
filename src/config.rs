//! Node configuration.
//!
//! Loaded from a TOML file. Every tunable has a serde default so a minimal
//! config only needs the listen address, the TLS material and a peer list.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::P2pError;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub tls: TlsSection,
    #[serde(default)]
    pub p2p: P2pSection,
    /// Local resources this node serves, advertised in its catalog.
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Address the p2p listener binds to.
    pub listen_addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSection {
    /// PEM certificate chain presented to peers; the leaf's public key
    /// determines this node's identity.
    pub cert_path: PathBuf,
    /// PEM private key matching the leaf certificate.
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pSection {
    /// Peer endpoints ("host:port") to dial and keep dialed.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Deadline for one outstanding request before it resolves as failed.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Interval between unsolicited catalog version announcements.
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,
    /// Delay between redial attempts for a configured peer.
    #[serde(default = "default_dial_retry")]
    pub dial_retry_secs: u64,
    /// Hard cap on a single wire frame; larger frames tear the connection down.
    #[serde(default = "default_max_frame")]
    pub max_frame_bytes: usize,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_announce_interval() -> u64 {
    10
}

fn default_dial_retry() -> u64 {
    5
}

fn default_max_frame() -> usize {
    32 * 1024 * 1024
}

impl Default for P2pSection {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            request_timeout_secs: default_request_timeout(),
            announce_interval_secs: default_announce_interval(),
            dial_retry_secs: default_dial_retry(),
            max_frame_bytes: default_max_frame(),
        }
    }
}

/// Declaration of one locally-served resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDecl {
    /// Three-segment path: `network/chain/resource`.
    pub path: String,
    /// Driver type backing the resource. `memory` is built in.
    #[serde(default = "default_stub_type")]
    pub stub_type: String,
}

fn default_stub_type() -> String {
    "memory".to_string()
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, P2pError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| P2pError::Config(format!("read {}: {}", path.display(), e)))?;
        let config: NodeConfig = toml::from_str(&raw)
            .map_err(|e| P2pError::Config(format!("parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), P2pError> {
        for peer in &self.p2p.peers {
            if !peer.contains(':') {
                return Err(P2pError::Config(format!(
                    "peer endpoint '{}' is not host:port",
                    peer
                )));
            }
        }
        if self.p2p.max_frame_bytes == 0 {
            return Err(P2pError::Config("max_frame_bytes must be nonzero".into()));
        }
        Ok(())
    }
}
