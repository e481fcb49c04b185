//! Service orchestration
//!
//! The manager owns every resource and service in the process. Resources are
//! registered once; services obtain their port handles through binding URIs
//! resolved against the registry. Wiring happens entirely at startup - a
//! service that starts has every handle it will ever use.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use super::binding::ResourceContext;
use super::monitor::UsageState;
use super::resource::{PortHandle, Resource};
use super::{Service, ServiceState};

/// Health snapshot of one resource.
#[derive(Debug, Clone)]
pub struct ResourceHealth {
    pub name: String,
    pub healthy: bool,
    pub error_count: u64,
    pub metrics: HashMap<String, f64>,
}

/// Health snapshot of one service.
#[derive(Debug, Clone)]
pub struct ServiceHealth {
    pub name: String,
    pub state: ServiceState,
}

#[derive(Default)]
pub struct ServiceManager {
    resources: HashMap<String, Arc<dyn Resource>>,
    services: Vec<Arc<dyn Service>>,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource under its unique name.
    pub fn register_resource(&mut self, resource: Arc<dyn Resource>) -> Result<()> {
        let name = resource.name().to_string();
        if self.resources.contains_key(&name) {
            bail!("resource {name:?} registered twice");
        }
        self.resources.insert(name, resource);
        Ok(())
    }

    pub fn resource(&self, name: &str) -> Option<&Arc<dyn Resource>> {
        self.resources.get(name)
    }

    /// Resolve one binding URI into a port handle.
    pub fn bind(&self, service_name: &str, port_name: &str, uri: &str) -> Result<PortHandle> {
        let ctx = ResourceContext::parse(service_name, port_name, uri)
            .with_context(|| format!("parsing binding for {service_name}.{port_name}"))?;
        let resource = self.resources.get(&ctx.resource_name).with_context(|| {
            format!(
                "binding {service_name}.{port_name}: unknown resource {:?}",
                ctx.resource_name
            )
        })?;
        let handle = resource
            .bind(&ctx)
            .with_context(|| format!("binding {service_name}.{port_name} to {uri}"))?;
        tracing::debug!(
            service = service_name,
            port = port_name,
            uri,
            handle = ?handle,
            "Port bound"
        );
        Ok(handle)
    }

    /// Resolve a full port map for one service.
    pub fn bind_all(
        &self,
        service_name: &str,
        bindings: &HashMap<String, String>,
    ) -> Result<HashMap<String, PortHandle>> {
        let mut handles = HashMap::new();
        for (port, uri) in bindings {
            handles.insert(port.clone(), self.bind(service_name, port, uri)?);
        }
        Ok(handles)
    }

    pub fn register_service(&mut self, service: Arc<dyn Service>) {
        self.services.push(service);
    }

    pub fn services(&self) -> &[Arc<dyn Service>] {
        &self.services
    }

    /// Start every registered service in registration order.
    pub async fn start_all(&self) -> Result<()> {
        for service in &self.services {
            let name = service.name().to_string();
            Arc::clone(service)
                .start()
                .await
                .with_context(|| format!("starting service {name}"))?;
            tracing::debug!(service = %name, "Service started");
        }
        Ok(())
    }

    /// Stop services in reverse registration order, then close resources.
    pub async fn stop_all(&self) {
        for service in self.services.iter().rev() {
            service.stop().await;
            tracing::debug!(service = %service.name(), "Service stopped");
        }
        for resource in self.resources.values() {
            resource.close();
        }
    }

    pub fn service_health(&self) -> Vec<ServiceHealth> {
        self.services
            .iter()
            .map(|s| ServiceHealth {
                name: s.name().to_string(),
                state: s.state(),
            })
            .collect()
    }

    pub fn resource_health(&self) -> Vec<ResourceHealth> {
        let mut health: Vec<ResourceHealth> = self
            .resources
            .values()
            .map(|r| ResourceHealth {
                name: r.name().to_string(),
                healthy: r.is_healthy(),
                error_count: r.monitor().counter("error_count"),
                metrics: r.metrics(),
            })
            .collect();
        health.sort_by(|a, b| a.name.cmp(&b.name));
        health
    }

    /// Log a compact health report (periodic background task).
    pub fn log_health_report(&self) {
        for service in self.service_health() {
            tracing::info!(service = %service.name, state = %service.state, "Service health");
        }
        for resource in self.resource_health() {
            tracing::info!(
                resource = %resource.name,
                healthy = resource.healthy,
                errors = resource.error_count,
                "Resource health"
            );
        }
    }

    /// Usage state of a resource for a usage type, for health surfaces.
    pub fn usage_state(&self, resource: &str, usage_type: &str) -> Option<UsageState> {
        self.resources
            .get(resource)
            .map(|r| r.usage_state(usage_type))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::core::constants::DEFAULT_METRICS_WINDOW_MS;
    use crate::services::monitor::ResourceMonitor;
    use crate::services::resource::TickQueueResource;
    use crate::services::ServiceCore;

    struct NoopService {
        core: ServiceCore,
    }

    #[async_trait]
    impl Service for NoopService {
        fn name(&self) -> &str {
            self.core.name()
        }

        fn state(&self) -> ServiceState {
            self.core.state()
        }

        async fn start(self: Arc<Self>) -> Result<()> {
            if !self.core.transition_to_running() {
                return Ok(());
            }
            let mut cancel = self.core.cancel_rx();
            self.core
                .attach_task(tokio::spawn(async move {
                    let _ = cancel.changed().await;
                }))
                .await;
            Ok(())
        }

        async fn stop(&self) {
            self.core.stop_and_join().await;
        }

        fn pause(&self) {
            self.core.pause();
        }

        fn resume(&self) {
            self.core.resume();
        }
    }

    fn queue_resource(name: &str) -> Arc<dyn Resource> {
        Arc::new(TickQueueResource::new(
            name,
            8,
            Arc::new(ResourceMonitor::new(name, DEFAULT_METRICS_WINDOW_MS)),
        ))
    }

    #[tokio::test]
    async fn test_register_resource_rejects_duplicates() {
        let mut manager = ServiceManager::new();
        manager.register_resource(queue_resource("engine-queue")).unwrap();
        assert!(manager.register_resource(queue_resource("engine-queue")).is_err());
    }

    #[tokio::test]
    async fn test_bind_resolves_registered_resource() {
        let mut manager = ServiceManager::new();
        manager.register_resource(queue_resource("engine-queue")).unwrap();

        let handle = manager
            .bind("persistence", "input", "queue-in:engine-queue")
            .unwrap();
        assert!(matches!(handle, PortHandle::QueueIn(_)));
    }

    #[tokio::test]
    async fn test_bind_unknown_resource_fails() {
        let manager = ServiceManager::new();
        assert!(manager.bind("svc", "input", "queue-in:missing").is_err());
    }

    #[tokio::test]
    async fn test_start_stop_all() {
        let mut manager = ServiceManager::new();
        let service = Arc::new(NoopService {
            core: ServiceCore::new("noop"),
        });
        manager.register_service(service.clone());

        manager.start_all().await.unwrap();
        assert_eq!(service.state(), ServiceState::Running);

        tokio::time::timeout(Duration::from_secs(2), manager.stop_all())
            .await
            .expect("stop_all must finish");
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_health_snapshots() {
        let mut manager = ServiceManager::new();
        manager.register_resource(queue_resource("engine-queue")).unwrap();
        let service = Arc::new(NoopService {
            core: ServiceCore::new("noop"),
        });
        manager.register_service(service);

        let services = manager.service_health();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].state, ServiceState::Stopped);

        let resources = manager.resource_health();
        assert_eq!(resources.len(), 1);
        assert!(resources[0].healthy);
    }
}
