//! Binding URIs
//!
//! Services are wired to resources through binding URIs of the form
//! `<usage_type>:<resource_name>?k1=v1&k2=v2`. The orchestrator parses each
//! binding into a [`ResourceContext`] and hands it to the resource, which
//! returns the wrapped handle injected into the service.

use std::collections::HashMap;

use thiserror::Error;

/// Recognised usage types.
pub const USAGE_QUEUE_IN: &str = "queue-in";
pub const USAGE_QUEUE_OUT: &str = "queue-out";
pub const USAGE_STORAGE_READ: &str = "storage-read";
pub const USAGE_STORAGE_WRITE: &str = "storage-write";
pub const USAGE_DATABASE_METADATA: &str = "database-metadata";
pub const USAGE_DATABASE_ORGANISM: &str = "database-organism";
pub const USAGE_DATABASE_ENVIRONMENT: &str = "database-environment";
pub const USAGE_TOPIC_WRITE: &str = "topic-write";
pub const USAGE_TOPIC_READ: &str = "topic-read";

/// Parameter name carrying the consumer group for `topic-read` bindings.
pub const PARAM_CONSUMER_GROUP: &str = "consumerGroup";

const KNOWN_USAGE_TYPES: &[&str] = &[
    USAGE_QUEUE_IN,
    USAGE_QUEUE_OUT,
    USAGE_STORAGE_READ,
    USAGE_STORAGE_WRITE,
    USAGE_DATABASE_METADATA,
    USAGE_DATABASE_ORGANISM,
    USAGE_DATABASE_ENVIRONMENT,
    USAGE_TOPIC_WRITE,
    USAGE_TOPIC_READ,
];

#[derive(Debug, Error, PartialEq)]
pub enum BindingError {
    #[error("binding {uri:?} has no usage type separator ':'")]
    MissingSeparator { uri: String },

    #[error("binding {uri:?} has an empty {part}")]
    EmptyPart { uri: String, part: &'static str },

    #[error("binding {uri:?} uses unknown usage type {usage_type:?}")]
    UnknownUsageType { uri: String, usage_type: String },

    #[error("binding {uri:?} has malformed parameter {param:?}")]
    MalformedParameter { uri: String, param: String },

    #[error("topic-read binding {uri:?} requires parameter consumerGroup")]
    MissingConsumerGroup { uri: String },
}

/// A parsed binding, scoped to the service and port it wires.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceContext {
    pub service_name: String,
    pub port_name: String,
    pub usage_type: String,
    pub resource_name: String,
    pub parameters: HashMap<String, String>,
}

impl ResourceContext {
    /// Parse a binding URI for a given service port.
    pub fn parse(service_name: &str, port_name: &str, uri: &str) -> Result<Self, BindingError> {
        let (usage_type, rest) = uri.split_once(':').ok_or_else(|| {
            BindingError::MissingSeparator {
                uri: uri.to_string(),
            }
        })?;
        if usage_type.is_empty() {
            return Err(BindingError::EmptyPart {
                uri: uri.to_string(),
                part: "usage type",
            });
        }
        if !KNOWN_USAGE_TYPES.contains(&usage_type) {
            return Err(BindingError::UnknownUsageType {
                uri: uri.to_string(),
                usage_type: usage_type.to_string(),
            });
        }

        let (resource_name, query) = match rest.split_once('?') {
            Some((name, query)) => (name, Some(query)),
            None => (rest, None),
        };
        if resource_name.is_empty() {
            return Err(BindingError::EmptyPart {
                uri: uri.to_string(),
                part: "resource name",
            });
        }

        let mut parameters = HashMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    BindingError::MalformedParameter {
                        uri: uri.to_string(),
                        param: pair.to_string(),
                    }
                })?;
                if key.is_empty() {
                    return Err(BindingError::MalformedParameter {
                        uri: uri.to_string(),
                        param: pair.to_string(),
                    });
                }
                parameters.insert(key.to_string(), value.to_string());
            }
        }

        if usage_type == USAGE_TOPIC_READ && !parameters.contains_key(PARAM_CONSUMER_GROUP) {
            return Err(BindingError::MissingConsumerGroup {
                uri: uri.to_string(),
            });
        }

        Ok(Self {
            service_name: service_name.to_string(),
            port_name: port_name.to_string(),
            usage_type: usage_type.to_string(),
            resource_name: resource_name.to_string(),
            parameters,
        })
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }
}
