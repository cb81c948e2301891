//! Cross-organization interoperability middleware.
//!
//! Each operator runs a node exposing local resources (endpoints to backend
//! ledgers) and discovers and invokes resources other organizations' nodes
//! expose, over a mutually-authenticated TLS overlay with no central broker.

pub mod config;
pub mod error;
pub mod identity;
pub mod p2p;
pub mod remote;
pub mod resource;
pub mod tls;

pub use config::NodeConfig;
pub use error::P2pError;
pub use identity::NodeIdentity;
pub use p2p::P2pService;
pub use remote::RemoteResource;
pub use resource::{
    CatalogProvider, LocalResourceTable, MemoryResource, Resource, ResourceInfo, ResourcePath,
    ResourceRequest, ResourceResponse, ResourceRouter,
};
