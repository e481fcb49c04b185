//! Resources and per-binding handles
//!
//! A resource is constructed once by the orchestrator and then wrapped per
//! binding: each `bind` call returns a distinct handle selected by the
//! binding's usage type. Handles own their per-binding state (a dedicated
//! database connection, a topic delegate with its statement set) and release
//! it on close; resources expose health and metrics for all of them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use duckdb::Connection;
use parking_lot::Mutex;
use thiserror::Error;

use super::binding::{
    ResourceContext, PARAM_CONSUMER_GROUP, USAGE_DATABASE_ENVIRONMENT, USAGE_DATABASE_METADATA,
    USAGE_DATABASE_ORGANISM, USAGE_QUEUE_IN, USAGE_QUEUE_OUT, USAGE_STORAGE_READ,
    USAGE_STORAGE_WRITE, USAGE_TOPIC_READ, USAGE_TOPIC_WRITE,
};
use super::monitor::{ErrorRecord, ResourceMonitor, UsageState};
use super::queue::{QueueReceiver, QueueResource, QueueSender};
use crate::data::blobs::RunStore;
use crate::data::error::DataError;
use crate::data::relational::RelationalService;
use crate::data::topics::{NotificationHub, TopicReader, TopicWriter};
use crate::wire::TickData;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource {resource} does not support usage type {usage_type:?}")]
    UnsupportedUsage {
        resource: String,
        usage_type: String,
    },

    #[error("queue input of {resource} is already bound")]
    InputTaken { resource: String },

    #[error("binding for {resource} is missing parameter {param:?}")]
    MissingParameter {
        resource: String,
        param: &'static str,
    },

    #[error(transparent)]
    Data(#[from] DataError),
}

/// Concrete handle injected into a service for one bound port.
pub enum PortHandle {
    QueueIn(QueueReceiver<TickData>),
    QueueOut(QueueSender<TickData>),
    StorageRead(Arc<dyn RunStore>),
    StorageWrite(Arc<dyn RunStore>),
    Database(DatabaseHandle),
    TopicWrite(Arc<TopicWriter>),
    TopicRead(Arc<TopicReader>),
}

impl std::fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            PortHandle::QueueIn(_) => "QueueIn",
            PortHandle::QueueOut(_) => "QueueOut",
            PortHandle::StorageRead(_) => "StorageRead",
            PortHandle::StorageWrite(_) => "StorageWrite",
            PortHandle::Database(_) => "Database",
            PortHandle::TopicWrite(_) => "TopicWrite",
            PortHandle::TopicRead(_) => "TopicRead",
        };
        f.debug_tuple(kind).finish()
    }
}

/// Capability-based resource contract.
pub trait Resource: Send + Sync {
    fn name(&self) -> &str;

    /// The shared monitor all of this resource's handles record into.
    fn monitor(&self) -> Arc<ResourceMonitor>;

    /// Wrap this resource for one binding.
    fn bind(&self, ctx: &ResourceContext) -> Result<PortHandle, ResourceError>;

    /// Release everything the resource handed out. Idempotent.
    fn close(&self);

    fn usage_state(&self, usage_type: &str) -> UsageState {
        self.monitor().usage_state(usage_type)
    }

    fn metrics(&self) -> HashMap<String, f64> {
        self.monitor().metrics()
    }

    fn errors(&self) -> Vec<ErrorRecord> {
        self.monitor().errors()
    }

    fn is_healthy(&self) -> bool {
        self.monitor().is_healthy()
    }
}

// =============================================================================
// Database resource
// =============================================================================

/// Dedicated connection handle for one database binding.
#[derive(Clone)]
pub struct DatabaseHandle {
    usage_type: String,
    conn: Arc<Mutex<Connection>>,
    monitor: Arc<ResourceMonitor>,
}

impl DatabaseHandle {
    pub fn usage_type(&self) -> &str {
        &self.usage_type
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    /// Run a closure against the binding's dedicated connection.
    pub fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> R) -> R {
        let conn = self.conn.lock();
        f(&conn)
    }
}

/// Wraps the relational service; every binding gets its own cloned
/// connection.
pub struct DatabaseResource {
    name: String,
    relational: Arc<RelationalService>,
    monitor: Arc<ResourceMonitor>,
}

impl DatabaseResource {
    pub fn new(
        name: impl Into<String>,
        relational: Arc<RelationalService>,
        monitor: Arc<ResourceMonitor>,
    ) -> Self {
        Self {
            name: name.into(),
            relational,
            monitor,
        }
    }
}

impl Resource for DatabaseResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn monitor(&self) -> Arc<ResourceMonitor> {
        Arc::clone(&self.monitor)
    }

    fn bind(&self, ctx: &ResourceContext) -> Result<PortHandle, ResourceError> {
        match ctx.usage_type.as_str() {
            USAGE_DATABASE_METADATA | USAGE_DATABASE_ORGANISM | USAGE_DATABASE_ENVIRONMENT => {
                let conn = self.relational.delegate_connection()?;
                tracing::debug!(
                    resource = %self.name,
                    service = %ctx.service_name,
                    usage = %ctx.usage_type,
                    "Database connection bound"
                );
                Ok(PortHandle::Database(DatabaseHandle {
                    usage_type: ctx.usage_type.clone(),
                    conn: Arc::new(Mutex::new(conn)),
                    monitor: Arc::clone(&self.monitor),
                }))
            }
            other => Err(ResourceError::UnsupportedUsage {
                resource: self.name.clone(),
                usage_type: other.to_string(),
            }),
        }
    }

    fn close(&self) {}
}

// =============================================================================
// Storage resource
// =============================================================================

/// Wraps the blob store for storage-read / storage-write bindings.
pub struct StorageResource {
    name: String,
    store: Arc<dyn RunStore>,
    monitor: Arc<ResourceMonitor>,
}

impl StorageResource {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn RunStore>,
        monitor: Arc<ResourceMonitor>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            monitor,
        }
    }
}

impl Resource for StorageResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn monitor(&self) -> Arc<ResourceMonitor> {
        Arc::clone(&self.monitor)
    }

    fn bind(&self, ctx: &ResourceContext) -> Result<PortHandle, ResourceError> {
        match ctx.usage_type.as_str() {
            USAGE_STORAGE_READ => Ok(PortHandle::StorageRead(Arc::clone(&self.store))),
            USAGE_STORAGE_WRITE => Ok(PortHandle::StorageWrite(Arc::clone(&self.store))),
            other => Err(ResourceError::UnsupportedUsage {
                resource: self.name.clone(),
                usage_type: other.to_string(),
            }),
        }
    }

    fn close(&self) {}
}

// =============================================================================
// Queue resource
// =============================================================================

/// Bounded tick queue between the engine and the persistence service.
pub struct TickQueueResource {
    name: String,
    queue: QueueResource<TickData>,
    monitor: Arc<ResourceMonitor>,
}

impl TickQueueResource {
    pub fn new(name: impl Into<String>, capacity: usize, monitor: Arc<ResourceMonitor>) -> Self {
        let name = name.into();
        Self {
            queue: QueueResource::new(name.clone(), capacity, Arc::clone(&monitor)),
            name,
            monitor,
        }
    }
}

impl Resource for TickQueueResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn monitor(&self) -> Arc<ResourceMonitor> {
        Arc::clone(&self.monitor)
    }

    fn bind(&self, ctx: &ResourceContext) -> Result<PortHandle, ResourceError> {
        match ctx.usage_type.as_str() {
            USAGE_QUEUE_OUT => Ok(PortHandle::QueueOut(self.queue.output())),
            USAGE_QUEUE_IN => self
                .queue
                .input()
                .map(PortHandle::QueueIn)
                .ok_or_else(|| ResourceError::InputTaken {
                    resource: self.name.clone(),
                }),
            other => Err(ResourceError::UnsupportedUsage {
                resource: self.name.clone(),
                usage_type: other.to_string(),
            }),
        }
    }

    fn close(&self) {}
}

// =============================================================================
// Topic resource
// =============================================================================

/// One durable topic; bindings create reader/writer delegates, each with a
/// dedicated connection.
pub struct TopicResource {
    name: String,
    topic: String,
    claim_timeout: Duration,
    relational: Arc<RelationalService>,
    hub: Arc<NotificationHub>,
    monitor: Arc<ResourceMonitor>,
    writers: Mutex<Vec<Arc<TopicWriter>>>,
    readers: Mutex<Vec<Arc<TopicReader>>>,
}

impl TopicResource {
    pub fn new(
        name: impl Into<String>,
        topic: impl Into<String>,
        claim_timeout: Duration,
        relational: Arc<RelationalService>,
        hub: Arc<NotificationHub>,
        monitor: Arc<ResourceMonitor>,
    ) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            claim_timeout,
            relational,
            hub,
            monitor,
            writers: Mutex::new(Vec::new()),
            readers: Mutex::new(Vec::new()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Resource for TopicResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn monitor(&self) -> Arc<ResourceMonitor> {
        Arc::clone(&self.monitor)
    }

    fn bind(&self, ctx: &ResourceContext) -> Result<PortHandle, ResourceError> {
        match ctx.usage_type.as_str() {
            USAGE_TOPIC_WRITE => {
                let conn = self.relational.delegate_connection()?;
                let writer = Arc::new(TopicWriter::new(
                    self.topic.clone(),
                    conn,
                    Arc::clone(&self.hub),
                    Arc::clone(&self.monitor),
                ));
                self.writers.lock().push(Arc::clone(&writer));
                Ok(PortHandle::TopicWrite(writer))
            }
            USAGE_TOPIC_READ => {
                let group = ctx.parameter(PARAM_CONSUMER_GROUP).ok_or(
                    ResourceError::MissingParameter {
                        resource: self.name.clone(),
                        param: PARAM_CONSUMER_GROUP,
                    },
                )?;
                let conn = self.relational.delegate_connection()?;
                let reader = Arc::new(TopicReader::new(
                    self.topic.clone(),
                    group,
                    self.claim_timeout,
                    conn,
                    Arc::clone(&self.hub),
                    Arc::clone(&self.monitor),
                ));
                self.readers.lock().push(Arc::clone(&reader));
                Ok(PortHandle::TopicRead(reader))
            }
            other => Err(ResourceError::UnsupportedUsage {
                resource: self.name.clone(),
                usage_type: other.to_string(),
            }),
        }
    }

    fn close(&self) {
        let mut schemas: Vec<String> = Vec::new();
        for writer in self.writers.lock().drain(..) {
            if let Some(schema) = writer.schema() {
                schemas.push(schema);
            }
            writer.close();
        }
        for reader in self.readers.lock().drain(..) {
            if let Some(schema) = reader.schema() {
                schemas.push(schema);
            }
            reader.close();
        }
        schemas.sort();
        schemas.dedup();
        for schema in schemas {
            self.hub.remove(&self.topic, &schema);
        }
    }

    fn metrics(&self) -> HashMap<String, f64> {
        let mut metrics = self.monitor.metrics();
        let conflicts = self.monitor.counter("claim_conflicts") as f64;
        let received = self.monitor.counter("messages_received") as f64;
        let attempts = conflicts + received;
        metrics.insert(
            "claim_conflict_ratio".to_string(),
            if attempts > 0.0 { conflicts / attempts } else { 0.0 },
        );
        metrics
    }
}
