//! Peer transport seam.
//!
//! `KvStoreDb` talks to peers exclusively through [`PeerClient`], built
//! per peer from its [`PeerSpec`] by a [`PeerTransport`]. The in-process
//! [`MemNetwork`] implementation routes calls straight into another
//! node's `KvStore` handle; it backs the simulation and the integration
//! tests, and keeps the store logic independent of any wire stack.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use trellis_model::{
    DualMessages, DumpParams, FloodTopoSetParams, PeerSpec, Publication,
};

use crate::KvStoreHandle;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote error: {0}")]
    Remote(String),
}

/// Typed client for one peer. All calls are subject to the caller's RPC
/// deadline.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn key_set(&self, area: &str, publication: Publication) -> Result<(), ClientError>;

    async fn key_get(&self, area: &str, keys: Vec<String>) -> Result<Publication, ClientError>;

    async fn key_dump(&self, area: &str, params: DumpParams) -> Result<Publication, ClientError>;

    async fn dual_messages(&self, area: &str, msgs: DualMessages) -> Result<(), ClientError>;

    async fn flood_topo_set(
        &self,
        area: &str,
        params: FloodTopoSetParams,
    ) -> Result<(), ClientError>;

    /// No-op round trip keeping the transport session alive.
    async fn keep_alive(&self) -> Result<(), ClientError>;
}

/// Builds peer clients from peer specs.
pub trait PeerTransport: Send + Sync {
    fn connect(&self, spec: &PeerSpec) -> Result<Arc<dyn PeerClient>, ClientError>;
}

/// In-process broker: node name (used as `PeerSpec.addr`) to store handle.
#[derive(Clone, Default)]
pub struct MemNetwork {
    nodes: Arc<Mutex<HashMap<String, KvStoreHandle>>>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_name: impl Into<String>, handle: KvStoreHandle) {
        self.nodes
            .lock()
            .expect("mem network lock poisoned")
            .insert(node_name.into(), handle);
    }

    pub fn unregister(&self, node_name: &str) {
        self.nodes
            .lock()
            .expect("mem network lock poisoned")
            .remove(node_name);
    }

    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        Arc::new(MemTransport {
            network: self.clone(),
        })
    }

    fn resolve(&self, addr: &str) -> Result<KvStoreHandle, ClientError> {
        self.nodes
            .lock()
            .expect("mem network lock poisoned")
            .get(addr)
            .cloned()
            .ok_or_else(|| ClientError::Transport(format!("no such node: {addr}")))
    }
}

struct MemTransport {
    network: MemNetwork,
}

impl PeerTransport for MemTransport {
    fn connect(&self, spec: &PeerSpec) -> Result<Arc<dyn PeerClient>, ClientError> {
        // Resolution is deferred to call time so peers can be configured
        // before the remote node has registered.
        Ok(Arc::new(MemClient {
            network: self.network.clone(),
            addr: spec.addr.clone(),
        }))
    }
}

struct MemClient {
    network: MemNetwork,
    addr: String,
}

impl MemClient {
    fn remote(&self) -> Result<KvStoreHandle, ClientError> {
        self.network.resolve(&self.addr)
    }
}

#[async_trait]
impl PeerClient for MemClient {
    async fn key_set(&self, area: &str, publication: Publication) -> Result<(), ClientError> {
        self.remote()?
            .set_key_vals(area, publication)
            .await
            .map_err(|e| ClientError::Remote(e.to_string()))
    }

    async fn key_get(&self, area: &str, keys: Vec<String>) -> Result<Publication, ClientError> {
        self.remote()?
            .get_key_vals(area, keys)
            .await
            .map_err(|e| ClientError::Remote(e.to_string()))
    }

    async fn key_dump(&self, area: &str, params: DumpParams) -> Result<Publication, ClientError> {
        self.remote()?
            .dump_area(area, params)
            .await
            .map_err(|e| ClientError::Remote(e.to_string()))
    }

    async fn dual_messages(&self, area: &str, msgs: DualMessages) -> Result<(), ClientError> {
        self.remote()?
            .process_dual_messages(area, msgs)
            .await
            .map_err(|e| ClientError::Remote(e.to_string()))
    }

    async fn flood_topo_set(
        &self,
        area: &str,
        params: FloodTopoSetParams,
    ) -> Result<(), ClientError> {
        self.remote()?
            .flood_topo_set(area, params)
            .await
            .map_err(|e| ClientError::Remote(e.to_string()))
    }

    async fn keep_alive(&self) -> Result<(), ClientError> {
        // Resolving the handle is the liveness check.
        self.remote().map(|_| ())
    }
}
