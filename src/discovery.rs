//! The discovery boundary: tells the proxy what this user function serves.
//!
//! The proxy calls `discover` once on startup and expects the full picture
//! back: one aggregated `FileDescriptorSet` covering every registered
//! service, the entity list with protocol types and persistence ids, and
//! support library metadata. `reportError` is the proxy's channel for
//! telling us we misbehaved; it is logged and acknowledged.

use std::collections::HashSet;
use std::sync::Arc;

use prost::Message;
use tonic::{Request, Response, Status};

use crate::proto::cloudstate::entity_discovery_server::EntityDiscovery;
use crate::proto::{EntitySpec, ProxyInfo, ServiceInfo, UserFunctionError};
use crate::registry::EntityRegistry;

const SUPPORT_LIBRARY_NAME: &str = "cloudstate-rust-support";

/// gRPC service answering the proxy's discovery calls.
pub(crate) struct DiscoveryService {
    registry: Arc<EntityRegistry>,
}

impl DiscoveryService {
    pub(crate) fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }

    /// Merge every registered entity's descriptor set into one, deduplicated
    /// by file name. A set that fails to decode is skipped with a warning
    /// rather than failing discovery for the entities that provided good
    /// descriptors.
    fn aggregate_descriptors(&self) -> Vec<u8> {
        let mut merged = prost_types::FileDescriptorSet { file: Vec::new() };
        let mut seen: HashSet<String> = HashSet::new();

        for bytes in self.registry.descriptor_sets() {
            let set = match prost_types::FileDescriptorSet::decode(bytes) {
                Ok(set) => set,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping undecodable descriptor set");
                    continue;
                }
            };
            for file in set.file {
                let name = file.name().to_string();
                if seen.insert(name) {
                    merged.file.push(file);
                }
            }
        }

        merged.encode_to_vec()
    }
}

#[tonic::async_trait]
impl EntityDiscovery for DiscoveryService {
    async fn discover(
        &self,
        request: Request<ProxyInfo>,
    ) -> Result<Response<EntitySpec>, Status> {
        let proxy = request.into_inner();
        tracing::info!(
            proxy_name = %proxy.proxy_name,
            proxy_version = %proxy.proxy_version,
            protocol_major_version = proxy.protocol_major_version,
            protocol_minor_version = proxy.protocol_minor_version,
            "discovery requested"
        );

        let entities = self.registry.discovery_entities();
        tracing::debug!(count = entities.len(), "announcing entities");

        Ok(Response::new(EntitySpec {
            proto: self.aggregate_descriptors(),
            entities,
            service_info: Some(ServiceInfo {
                service_name: String::new(),
                service_version: String::new(),
                service_runtime: "rust".to_string(),
                support_library_name: SUPPORT_LIBRARY_NAME.to_string(),
                support_library_version: env!("CARGO_PKG_VERSION").to_string(),
            }),
        }))
    }

    async fn report_error(
        &self,
        request: Request<UserFunctionError>,
    ) -> Result<Response<()>, Status> {
        let error = request.into_inner();
        tracing::error!(message = %error.message, "error reported from proxy");
        Ok(Response::new(()))
    }
}
