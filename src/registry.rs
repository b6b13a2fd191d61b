use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::components::{DataProcessor, DataStorage, FailedTaskHandler, TransportAgent};

/// Directory of the pluggable per-resource-type implementations the engine
/// dispatches through.
///
/// Registration happens at wiring time; afterwards the maps are read-mostly.
/// Lookups on an unregistered type return `None` and the engine surfaces that
/// as a configuration error, never as a silently dropped operation.
#[derive(Default)]
pub struct ComponentRegistry {
    storages: RwLock<HashMap<String, Arc<dyn DataStorage>>>,
    transports: RwLock<HashMap<String, Arc<dyn TransportAgent>>>,
    failed_handlers: RwLock<HashMap<String, Arc<dyn FailedTaskHandler>>>,
    processors: RwLock<HashMap<String, Arc<dyn DataProcessor>>>,
}

impl ComponentRegistry {
    pub fn register_data_storage(
        &self,
        resource_type: impl Into<String>,
        storage: Arc<dyn DataStorage>,
    ) {
        self.storages.write().insert(resource_type.into(), storage);
    }

    pub fn register_transport_agent(
        &self,
        resource_type: impl Into<String>,
        agent: Arc<dyn TransportAgent>,
    ) {
        self.transports.write().insert(resource_type.into(), agent);
    }

    pub fn register_failed_task_handler(
        &self,
        resource_type: impl Into<String>,
        handler: Arc<dyn FailedTaskHandler>,
    ) {
        self.failed_handlers
            .write()
            .insert(resource_type.into(), handler);
    }

    /// Processors describe their own type via [`DataProcessor::process_type`].
    pub fn register_data_processor(&self, processor: Arc<dyn DataProcessor>) {
        let resource_type = processor.process_type().to_string();
        self.processors.write().insert(resource_type, processor);
    }

    pub fn find_data_storage(&self, resource_type: &str) -> Option<Arc<dyn DataStorage>> {
        self.storages.read().get(resource_type).cloned()
    }

    pub fn find_transport_agent(&self, resource_type: &str) -> Option<Arc<dyn TransportAgent>> {
        self.transports.read().get(resource_type).cloned()
    }

    pub fn find_failed_task_handler(
        &self,
        resource_type: &str,
    ) -> Option<Arc<dyn FailedTaskHandler>> {
        self.failed_handlers.read().get(resource_type).cloned()
    }

    pub fn find_data_processor(&self, resource_type: &str) -> Option<Arc<dyn DataProcessor>> {
        self.processors.read().get(resource_type).cloned()
    }

    /// Every resource type with registered storage, in the order the
    /// verification cycle should visit them.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.storages.read().keys().cloned().collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use async_trait::async_trait;

    use super::*;
    use crate::core::{DistroData, DistroKey, VerifyData, VerifyDiff};
    use crate::error::TransportError;

    struct NullStorage;

    #[async_trait]
    impl DataStorage for NullStorage {
        async fn get_datum_snapshot(&self) -> Result<Vec<DistroData>, anyhow::Error> {
            Ok(Vec::new())
        }

        async fn get_distro_data(
            &self,
            _key: &DistroKey,
        ) -> Result<Option<DistroData>, anyhow::Error> {
            Ok(None)
        }
    }

    struct NullProcessor;

    #[async_trait]
    impl DataProcessor for NullProcessor {
        fn process_type(&self) -> &str {
            "ephemeral-instances"
        }

        async fn process_data(&self, _data: DistroData) -> Result<(), anyhow::Error> {
            Ok(())
        }

        async fn process_verify_data(
            &self,
            _data: &VerifyData,
        ) -> Result<VerifyDiff, anyhow::Error> {
            Ok(VerifyDiff::default())
        }

        async fn process_snapshot(&self, _data: DistroData) -> Result<(), anyhow::Error> {
            Ok(())
        }
    }

    struct NullTransport;

    #[async_trait]
    impl TransportAgent for NullTransport {
        async fn sync_data(
            &self,
            _target: SocketAddr,
            _data: DistroData,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn sync_verify_data(
            &self,
            _target: SocketAddr,
            _data: VerifyData,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn get_data(
            &self,
            _target: SocketAddr,
            key: DistroKey,
        ) -> Result<DistroData, TransportError> {
            Ok(DistroData::new(key, crate::DataOperation::Snapshot, Vec::new()))
        }

        async fn get_datum_snapshot(
            &self,
            _target: SocketAddr,
        ) -> Result<Vec<DistroData>, TransportError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn lookup_of_unregistered_type_is_none() {
        let registry = ComponentRegistry::default();
        assert!(registry.find_data_storage("ephemeral-instances").is_none());
        assert!(registry.find_data_processor("ephemeral-instances").is_none());
        assert!(registry.find_transport_agent("ephemeral-instances").is_none());
        assert!(registry
            .find_failed_task_handler("ephemeral-instances")
            .is_none());
    }

    #[test]
    fn registered_components_are_found_by_type() {
        let registry = ComponentRegistry::default();
        registry.register_data_storage("ephemeral-instances", Arc::new(NullStorage));
        registry.register_data_processor(Arc::new(NullProcessor));
        registry.register_transport_agent("ephemeral-instances", Arc::new(NullTransport));

        assert!(registry.find_data_storage("ephemeral-instances").is_some());
        assert!(registry.find_data_processor("ephemeral-instances").is_some());
        assert!(registry.find_transport_agent("ephemeral-instances").is_some());
        // A different type stays unregistered.
        assert!(registry.find_data_storage("persistent-config").is_none());

        assert_eq!(registry.registered_types(), vec!["ephemeral-instances"]);
    }
}
