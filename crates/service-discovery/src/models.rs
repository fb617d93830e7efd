//! Data models for service discovery

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One advertised endpoint of a named service.
///
/// The field layout follows the Curator `ServiceInstance` JSON record so that
/// registrations written by this crate can be read by JVM discovery clients
/// and vice versa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    /// Service name this instance belongs to
    pub name: String,

    /// Identifier, unique within the service name
    pub id: String,

    /// Host or IP the instance listens on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Plain port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// TLS port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_port: Option<u16>,

    /// Application-defined payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    /// When the instance was registered
    #[serde(rename = "registrationTimeUTC", with = "chrono::serde::ts_milliseconds")]
    pub registration_time_utc: DateTime<Utc>,

    /// Lifetime of the backing node
    #[serde(rename = "serviceType")]
    pub kind: RegistrationKind,

    /// URI template for reaching the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri_spec: Option<String>,
}

/// Lifetime of a registration node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RegistrationKind {
    /// Node survives session loss and must be removed explicitly
    #[serde(rename = "STATIC", alias = "PERMANENT")]
    Durable,
    /// Node is removed by the coordination service when the session ends
    #[default]
    #[serde(rename = "DYNAMIC")]
    Ephemeral,
}

impl ServiceInstance {
    /// Start building an instance of `name`
    pub fn builder(name: impl Into<String>) -> ServiceInstanceBuilder {
        ServiceInstanceBuilder::new(name)
    }

    /// `address:port` rendering used in log lines
    pub fn spec(&self) -> String {
        match (&self.address, self.port.or(self.ssl_port)) {
            (Some(address), Some(port)) => format!("{}:{}", address, port),
            (Some(address), None) => address.clone(),
            (None, Some(port)) => format!(":{}", port),
            (None, None) => self.id.clone(),
        }
    }

    /// Whether the node is removed on session loss
    pub fn is_ephemeral(&self) -> bool {
        self.kind == RegistrationKind::Ephemeral
    }
}

/// Builder for [`ServiceInstance`]
#[derive(Debug, Clone)]
pub struct ServiceInstanceBuilder {
    name: String,
    id: Option<String>,
    address: Option<String>,
    port: Option<u16>,
    ssl_port: Option<u16>,
    payload: Option<serde_json::Value>,
    kind: RegistrationKind,
    uri_spec: Option<String>,
}

impl ServiceInstanceBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            address: None,
            port: None,
            ssl_port: None,
            payload: None,
            kind: RegistrationKind::default(),
            uri_spec: None,
        }
    }

    /// Use a fixed id instead of a generated one
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the listen address
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Set the plain port
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the TLS port
    pub fn ssl_port(mut self, port: u16) -> Self {
        self.ssl_port = Some(port);
        self
    }

    /// Attach an application payload
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Set the registration kind
    pub fn kind(mut self, kind: RegistrationKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the URI template
    pub fn uri_spec(mut self, uri_spec: impl Into<String>) -> Self {
        self.uri_spec = Some(uri_spec.into());
        self
    }

    /// Validate and build the instance
    pub fn build(self) -> crate::Result<ServiceInstance> {
        if self.name.trim().is_empty() {
            return Err(crate::Error::InvalidInstance(
                "Service name cannot be empty".to_string(),
            ));
        }
        if self.name.contains('/') {
            return Err(crate::Error::InvalidInstance(format!(
                "Service name cannot contain '/': {}",
                self.name
            )));
        }

        let id = self.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if id.trim().is_empty() || id.contains('/') {
            return Err(crate::Error::InvalidInstance(format!(
                "Invalid instance id: {:?}",
                id
            )));
        }

        Ok(ServiceInstance {
            name: self.name,
            id,
            address: self.address,
            port: self.port,
            ssl_port: self.ssl_port,
            payload: self.payload,
            registration_time_utc: now_millis(),
            kind: self.kind,
            uri_spec: self.uri_spec,
        })
    }
}

/// Current time truncated to the millisecond precision of the stored record
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_generates_id() {
        let a = ServiceInstance::builder("api").build().unwrap();
        let b = ServiceInstance::builder("api").build().unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.kind, RegistrationKind::Ephemeral);
    }

    #[test]
    fn test_builder_rejects_bad_names() {
        assert!(ServiceInstance::builder("").build().is_err());
        assert!(ServiceInstance::builder("a/b").build().is_err());
        assert!(ServiceInstance::builder("api").id("x/y").build().is_err());
    }

    #[test]
    fn test_spec_rendering() {
        let instance = ServiceInstance::builder("api")
            .id("1")
            .address("10.0.0.1")
            .port(8080)
            .build()
            .unwrap();
        assert_eq!(instance.spec(), "10.0.0.1:8080");

        let bare = ServiceInstance::builder("api").id("7").build().unwrap();
        assert_eq!(bare.spec(), "7");
    }

    #[test]
    fn test_curator_field_names() {
        let instance = ServiceInstance::builder("api")
            .id("1")
            .ssl_port(8443)
            .kind(RegistrationKind::Durable)
            .build()
            .unwrap();
        let json = serde_json::to_value(&instance).unwrap();
        assert_eq!(json["serviceType"], "STATIC");
        assert_eq!(json["sslPort"], 8443);
        assert!(json["registrationTimeUTC"].is_i64());
        assert!(json.get("address").is_none());
    }

    #[test]
    fn test_permanent_alias() {
        let json = r#"{"name":"api","id":"1","registrationTimeUTC":0,"serviceType":"PERMANENT"}"#;
        let instance: ServiceInstance = serde_json::from_str(json).unwrap();
        assert_eq!(instance.kind, RegistrationKind::Durable);
    }
}
