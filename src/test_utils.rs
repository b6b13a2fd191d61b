//! In-memory implementations of the collaborator traits, plus a loopback
//! transport that routes calls straight to other protocol instances in the
//! same process.
//!
//! This is not suitable for any sort of real world usage outside of testing.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::components::{DataProcessor, DataStorage, FailedTaskHandler, TransportAgent};
use crate::core::{DataOperation, DistroData, DistroKey, VerifyData, VerifyDiff};
use crate::error::TransportError;
use crate::DistroProtocol;

/// The resource type every fixture registers under.
pub const TEST_RESOURCE_TYPE: &str = "ephemeral-instances";

/// Shorthand for a loopback address on the given port.
pub fn localhost(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// A in-memory keyed byte store acting as the registry layer's data.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone)]
pub struct MemStore {
    resource_type: String,
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new(TEST_RESOURCE_TYPE)
    }
}

impl MemStore {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            data: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Local mutation, as the registry layer would perform before calling
    /// `sync`.
    pub fn put(&self, key: impl Into<String>, payload: impl Into<Vec<u8>>) {
        self.data.write().insert(key.into(), payload.into());
    }

    pub fn remove(&self, key: &str) -> bool {
        self.data.write().remove(key).is_some()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }
}

#[async_trait]
impl DataStorage for MemStore {
    async fn get_datum_snapshot(&self) -> Result<Vec<DistroData>, anyhow::Error> {
        Ok(self
            .data
            .read()
            .iter()
            .map(|(key, payload)| {
                DistroData::new(
                    DistroKey::new(key, &self.resource_type),
                    DataOperation::Snapshot,
                    payload.clone(),
                )
            })
            .collect())
    }

    async fn get_distro_data(
        &self,
        key: &DistroKey,
    ) -> Result<Option<DistroData>, anyhow::Error> {
        Ok(self.data.read().get(key.resource_key()).map(|payload| {
            DistroData::new(key.untargeted(), DataOperation::Change, payload.clone())
        }))
    }
}

/// Applies inbound data into a [`MemStore`] and keeps a log of everything it
/// applied, in order, for assertions.
pub struct MemProcessor {
    store: MemStore,
    applied: Mutex<Vec<DistroData>>,
}

impl MemProcessor {
    pub fn new(store: MemStore) -> Self {
        Self {
            store,
            applied: Mutex::new(Vec::new()),
        }
    }

    /// Everything applied so far, in application order.
    pub fn applied(&self) -> Vec<DistroData> {
        self.applied.lock().clone()
    }

    /// How many inbound operations touched `resource_key`.
    pub fn applied_for(&self, resource_key: &str) -> usize {
        self.applied
            .lock()
            .iter()
            .filter(|data| data.key().resource_key() == resource_key)
            .count()
    }

    fn apply(&self, data: DistroData) {
        match data.operation() {
            DataOperation::Delete => {
                self.store.remove(data.key().resource_key());
            },
            _ => {
                self.store
                    .put(data.key().resource_key(), data.payload().to_vec());
            },
        }
        self.applied.lock().push(data);
    }
}

#[async_trait]
impl DataProcessor for MemProcessor {
    fn process_type(&self) -> &str {
        self.store.resource_type()
    }

    async fn process_data(&self, data: DistroData) -> Result<(), anyhow::Error> {
        self.apply(data);
        Ok(())
    }

    async fn process_verify_data(&self, data: &VerifyData) -> Result<VerifyDiff, anyhow::Error> {
        let mut diff = VerifyDiff::default();
        for checksum in &data.checksums {
            let matches = self
                .store
                .get(&checksum.resource_key)
                .map(|payload| crc32fast::hash(&payload) == checksum.checksum)
                .unwrap_or(false);

            if !matches {
                diff.to_update.push(checksum.resource_key.clone());
            }
        }
        Ok(diff)
    }

    async fn process_snapshot(&self, data: DistroData) -> Result<(), anyhow::Error> {
        self.apply(data);
        Ok(())
    }
}

/// An in-process "network" connecting protocol instances by address, with
/// per-target failure injection.
///
/// Cloning shares the underlying routing table.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    nodes: Arc<RwLock<HashMap<SocketAddr, Arc<DistroProtocol>>>>,
    down: Arc<RwLock<HashSet<SocketAddr>>>,
}

impl LoopbackNetwork {
    pub fn register(&self, addr: SocketAddr, protocol: Arc<DistroProtocol>) {
        self.nodes.write().insert(addr, protocol);
    }

    /// Makes every call towards `addr` fail until re-enabled.
    pub fn set_down(&self, addr: SocketAddr, down: bool) {
        if down {
            self.down.write().insert(addr);
        } else {
            self.down.write().remove(&addr);
        }
    }

    /// A transport agent for one resource type, routing over this network.
    pub fn transport(&self, resource_type: impl Into<String>) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
            resource_type: resource_type.into(),
        }
    }

    fn node(&self, addr: SocketAddr) -> Result<Arc<DistroProtocol>, TransportError> {
        if self.down.read().contains(&addr) {
            return Err(TransportError::Unreachable(addr));
        }
        self.nodes
            .read()
            .get(&addr)
            .cloned()
            .ok_or(TransportError::Unreachable(addr))
    }
}

/// A [`TransportAgent`] that delivers straight into the target protocol's
/// inbound surface.
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    resource_type: String,
}

#[async_trait]
impl TransportAgent for LoopbackTransport {
    async fn sync_data(
        &self,
        target: SocketAddr,
        data: DistroData,
    ) -> Result<(), TransportError> {
        let node = self.network.node(target)?;
        node.on_receive(data)
            .await
            .map_err(|e| TransportError::Remote(e.to_string()))
    }

    async fn sync_verify_data(
        &self,
        target: SocketAddr,
        data: VerifyData,
    ) -> Result<(), TransportError> {
        let node = self.network.node(target)?;
        node.on_verify(data)
            .await
            .map_err(|e| TransportError::Remote(e.to_string()))
    }

    async fn get_data(
        &self,
        target: SocketAddr,
        key: DistroKey,
    ) -> Result<DistroData, TransportError> {
        let node = self.network.node(target)?;
        node.on_query(key)
            .await
            .map_err(|e| TransportError::Remote(e.to_string()))
    }

    async fn get_datum_snapshot(
        &self,
        target: SocketAddr,
    ) -> Result<Vec<DistroData>, TransportError> {
        let node = self.network.node(target)?;
        node.on_snapshot(&self.resource_type)
            .await
            .map_err(|e| TransportError::Remote(e.to_string()))
    }
}

/// A [`FailedTaskHandler`] that only records what it was asked to retry.
#[derive(Clone, Default)]
pub struct RecordingFailedTaskHandler {
    retries: Arc<Mutex<Vec<(DistroKey, DataOperation, u32)>>>,
}

#[async_trait]
impl FailedTaskHandler for RecordingFailedTaskHandler {
    async fn retry(&self, key: DistroKey, operation: DataOperation, attempts: u32) {
        self.retries.lock().push((key, operation, attempts));
    }
}

impl RecordingFailedTaskHandler {
    pub fn retries(&self) -> Vec<(DistroKey, DataOperation, u32)> {
        self.retries.lock().clone()
    }
}
