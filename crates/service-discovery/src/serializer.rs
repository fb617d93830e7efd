//! Instance record encoding

use crate::{
    error::{Error, Result},
    models::ServiceInstance,
};

/// Converts instance records to and from the bytes stored in the tree
pub trait InstanceSerializer: Send + Sync {
    /// Encode an instance
    fn serialize(&self, instance: &ServiceInstance) -> Result<Vec<u8>>;

    /// Decode an instance
    fn deserialize(&self, data: &[u8]) -> Result<ServiceInstance>;
}

/// JSON encoding, compatible with Curator's `JsonInstanceSerializer`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonInstanceSerializer;

impl InstanceSerializer for JsonInstanceSerializer {
    fn serialize(&self, instance: &ServiceInstance) -> Result<Vec<u8>> {
        serde_json::to_vec(instance).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn deserialize(&self, data: &[u8]) -> Result<ServiceInstance> {
        serde_json::from_slice(data).map_err(|e| Error::Serialization(e.to_string()))
    }
}
