//! Core application

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use crate::core::cli::{self, CliConfig, Commands};
use crate::core::config::AppConfig;
use crate::core::constants::{
    DATABASE_FILENAME, ENV_LOG, HEALTH_REPORT_INTERVAL_SECS, TOPIC_BATCHES, TOPIC_METADATA,
};
use crate::core::shutdown::ShutdownService;
use crate::core::storage::{AppStorage, DataSubdir};
use crate::data::blobs::FilesystemRunStore;
use crate::data::relational::RelationalService;
use crate::data::topics::NotificationHub;
use crate::domain::indexer::discovery::RunDiscovery;
use crate::domain::indexer::environment::EnvironmentIndexer;
use crate::domain::indexer::metadata::{MetadataIndexerConfig, MetadataIndexerService};
use crate::domain::indexer::metadata_gate::MetadataGate;
use crate::domain::indexer::organism::OrganismIndexer;
use crate::domain::indexer::{BatchIndexer, BatchIndexerService, IndexerConfig};
use crate::domain::persistence::{PersistenceConfig, PersistenceService};
use crate::services::manager::ServiceManager;
use crate::services::monitor::ResourceMonitor;
use crate::services::resource::{
    DatabaseHandle, DatabaseResource, PortHandle, StorageResource, TickQueueResource,
    TopicResource,
};
use crate::wire::SimulationMetadata;

pub struct CoreApp {
    pub config: AppConfig,
    pub storage: AppStorage,
    pub relational: Arc<RelationalService>,
    pub manager: Arc<ServiceManager>,
    pub shutdown: ShutdownService,
    pub gate: MetadataGate,
}

impl CoreApp {
    /// Run the application with CLI argument parsing.
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");
        let (cli_config, command) = cli::parse();

        match command {
            Some(Commands::CheckConfig) => {
                let config = AppConfig::load(&cli_config)?;
                for (service, ports) in &config.bindings {
                    for (port, uri) in ports {
                        crate::services::binding::ResourceContext::parse(service, port, uri)
                            .with_context(|| format!("invalid binding {service}.{port}"))?;
                    }
                }
                println!("{}", serde_json::to_string_pretty(&config.summary())?);
                return Ok(());
            }
            Some(Commands::Run) | None => {}
        }

        let app = Self::init(&cli_config).await?;
        app.run_until_shutdown().await
    }

    fn init_logging() {
        let filter = EnvFilter::try_from_env(ENV_LOG)
            .unwrap_or_else(|_| EnvFilter::new("info,vivarium_pipeline=debug"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    /// Construct every resource and service from the resolved configuration.
    pub async fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;
        let storage = AppStorage::init(config.data_dir.as_deref()).await?;

        let db_path = storage.subdir_path(DataSubdir::Database, DATABASE_FILENAME);
        let relational = Arc::new(RelationalService::init(&db_path).await?);

        let blob_root = config
            .storage_root
            .clone()
            .unwrap_or_else(|| storage.subdir(DataSubdir::Runs));
        let store = Arc::new(FilesystemRunStore::new(blob_root));
        let hub = Arc::new(NotificationHub::new());

        let manager = Self::build_manager(&config, &relational, &store, &hub)?;
        let gate = MetadataGate::new();
        let manager = Self::build_services(&config, manager, &store, &gate)?;

        let shutdown = ShutdownService::new(Arc::clone(&relational));
        Ok(Self {
            config,
            storage,
            relational,
            manager: Arc::new(manager),
            shutdown,
            gate,
        })
    }

    fn build_manager(
        config: &AppConfig,
        relational: &Arc<RelationalService>,
        store: &Arc<FilesystemRunStore>,
        hub: &Arc<NotificationHub>,
    ) -> Result<ServiceManager> {
        let window = config.metrics_window_ms;
        let monitor = |name: &str| Arc::new(ResourceMonitor::new(name, window));
        let mut manager = ServiceManager::new();

        manager.register_resource(Arc::new(TopicResource::new(
            "batch-topic",
            TOPIC_BATCHES,
            config.claim_timeout,
            Arc::clone(relational),
            Arc::clone(hub),
            monitor("batch-topic"),
        )))?;
        manager.register_resource(Arc::new(TopicResource::new(
            "metadata-topic",
            TOPIC_METADATA,
            config.claim_timeout,
            Arc::clone(relational),
            Arc::clone(hub),
            monitor("metadata-topic"),
        )))?;
        manager.register_resource(Arc::new(DatabaseResource::new(
            "run-database",
            Arc::clone(relational),
            monitor("run-database"),
        )))?;
        manager.register_resource(Arc::new(StorageResource::new(
            "run-store",
            Arc::clone(store) as _,
            monitor("run-store"),
        )))?;
        manager.register_resource(Arc::new(TickQueueResource::new(
            "engine-queue",
            config.persistence.queue_capacity,
            monitor("engine-queue"),
        )))?;

        Ok(manager)
    }

    fn build_services(
        config: &AppConfig,
        mut manager: ServiceManager,
        store: &Arc<FilesystemRunStore>,
        gate: &MetadataGate,
    ) -> Result<ServiceManager> {
        let discovery = RunDiscovery {
            run_id: config.indexer.run_id.clone(),
            poll_interval: config.indexer.poll_interval,
            max_poll_duration: config.indexer.max_poll_duration,
        };
        let store_monitor = manager
            .resource("run-store")
            .map(|r| r.monitor())
            .context("run-store resource missing")?;

        // metadata indexer
        {
            let name = "metadata-indexer";
            let bindings = config
                .bindings
                .get(name)
                .with_context(|| format!("no bindings for {name}"))?;
            let db = expect_database(manager.bind(name, "database", &bindings["database"])?)?;
            let reader = expect_topic_read(manager.bind(name, "topic", &bindings["topic"])?)?;
            manager.register_service(Arc::new(MetadataIndexerService::new(
                name,
                MetadataIndexerConfig {
                    discovery: discovery.clone(),
                    file_poll_interval: config.indexer.metadata_file_poll_interval,
                    file_max_poll_duration: config.indexer.metadata_file_max_poll_duration,
                },
                Arc::clone(store) as _,
                db,
                reader,
                gate.clone(),
            )));
        }

        // batch indexers
        for name in ["organism-indexer", "environment-indexer"] {
            let bindings = config
                .bindings
                .get(name)
                .with_context(|| format!("no bindings for {name}"))?;
            let db = expect_database(manager.bind(name, "database", &bindings["database"])?)?;
            let reader = expect_topic_read(manager.bind(name, "topic", &bindings["topic"])?)?;
            let indexer: Arc<dyn BatchIndexer> = if name == "organism-indexer" {
                Arc::new(OrganismIndexer::new(db, config.persistence.codec))
            } else {
                Arc::new(EnvironmentIndexer::new(db, config.persistence.codec))
            };
            manager.register_service(Arc::new(BatchIndexerService::new(
                name,
                IndexerConfig {
                    discovery: discovery.clone(),
                    insert_batch_size: config.indexer.insert_batch_size,
                    flush_timeout: config.indexer.flush_timeout,
                },
                reader,
                Arc::clone(store) as _,
                Arc::clone(&store_monitor),
                indexer,
            )));
        }

        // persistence, registered last so live-mode indexers can observe the
        // run being created after their own start
        if config.persistence.enabled {
            let name = "persistence";
            let bindings = config
                .bindings
                .get(name)
                .with_context(|| format!("no bindings for {name}"))?;
            let input = match manager.bind(name, "input", &bindings["input"])? {
                PortHandle::QueueIn(input) => input,
                other => bail!("persistence input port expects queue-in, got {other:?}"),
            };
            let batch_writer =
                expect_topic_write(manager.bind(name, "batches", &bindings["batches"])?)?;
            let metadata_writer =
                expect_topic_write(manager.bind(name, "metadata", &bindings["metadata"])?)?;

            let metadata = SimulationMetadata {
                simulation_run_id: String::new(),
                environment: Some(config.persistence.environment.clone()),
                start_time_ms: crate::utils::time::now_ms(),
                initial_seed: config.persistence.initial_seed,
            };
            manager.register_service(Arc::new(PersistenceService::new(
                name,
                PersistenceConfig {
                    run_id: config.indexer.run_id.clone(),
                    batch_size: config.persistence.batch_size,
                    flush_timeout: config.persistence.flush_timeout,
                },
                metadata,
                input,
                Arc::clone(store) as _,
                Arc::clone(&store_monitor),
                batch_writer,
                metadata_writer,
            )));
        }

        Ok(manager)
    }

    /// Start everything and block until a shutdown signal arrives.
    pub async fn run_until_shutdown(self) -> Result<()> {
        self.shutdown
            .register(
                self.relational
                    .start_checkpoint_task(self.shutdown.subscribe()),
            )
            .await;
        self.shutdown
            .register(Self::start_health_report_task(
                Arc::clone(&self.manager),
                self.shutdown.subscribe(),
            ))
            .await;

        self.manager.start_all().await?;
        self.shutdown.install_signal_handlers();
        tracing::info!("Pipeline running; Ctrl+C to stop");

        self.shutdown.wait().await;
        self.shutdown.shutdown(&self.manager).await;
        Ok(())
    }

    fn start_health_report_task(
        manager: Arc<ServiceManager>,
        mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(HEALTH_REPORT_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => manager.log_health_report(),
                }
            }
        })
    }
}

fn expect_database(handle: PortHandle) -> Result<DatabaseHandle> {
    match handle {
        PortHandle::Database(db) => Ok(db),
        other => bail!("expected database handle, got {other:?}"),
    }
}

fn expect_topic_read(handle: PortHandle) -> Result<Arc<crate::data::topics::TopicReader>> {
    match handle {
        PortHandle::TopicRead(reader) => Ok(reader),
        other => bail!("expected topic-read handle, got {other:?}"),
    }
}

fn expect_topic_write(handle: PortHandle) -> Result<Arc<crate::data::topics::TopicWriter>> {
    match handle {
        PortHandle::TopicWrite(writer) => Ok(writer),
        other => bail!("expected topic-write handle, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ServiceState;
    use crate::wire::TickData;

    fn test_cli(tmp: &tempfile::TempDir, run_id: Option<&str>) -> CliConfig {
        CliConfig {
            data_dir: Some(tmp.path().join("data").to_string_lossy().into_owned()),
            storage_root: Some(tmp.path().join("runs").to_string_lossy().into_owned()),
            run_id: run_id.map(str::to_string),
            claim_timeout_secs: Some(2),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_init_builds_resources_and_services() {
        let tmp = tempfile::tempdir().unwrap();
        let app = CoreApp::init(&test_cli(&tmp, None)).await.unwrap();

        for resource in [
            "batch-topic",
            "metadata-topic",
            "run-database",
            "run-store",
            "engine-queue",
        ] {
            assert!(app.manager.resource(resource).is_some(), "{resource}");
        }

        let names: Vec<_> = app
            .manager
            .services()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "metadata-indexer",
                "organism-indexer",
                "environment-indexer",
                "persistence"
            ]
        );
    }

    #[tokio::test]
    async fn test_no_persistence_flag_drops_service() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cli = test_cli(&tmp, None);
        cli.no_persistence = true;
        let app = CoreApp::init(&cli).await.unwrap();
        assert!(
            !app.manager
                .services()
                .iter()
                .any(|s| s.name() == "persistence")
        );
    }

    /// End-to-end: engine ticks in, per-run rows out.
    #[tokio::test]
    async fn test_pipeline_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let run_id = crate::data::blobs::new_run_id();
        let mut cli = test_cli(&tmp, Some(&run_id));
        cli.claim_timeout_secs = Some(60);
        let app = CoreApp::init(&cli).await.unwrap();

        // feed a handful of ticks before starting, then start everything
        let sender = match app
            .manager
            .bind("test-engine", "output", "queue-out:engine-queue")
            .unwrap()
        {
            PortHandle::QueueOut(sender) => sender,
            other => panic!("unexpected handle {other:?}"),
        };
        app.manager.start_all().await.unwrap();

        for n in 0..5i64 {
            sender
                .put(TickData {
                    tick_number: n,
                    organisms: vec![crate::wire::OrganismState {
                        organism_id: 1,
                        birth_tick: 0,
                        program_id: "seed.s".into(),
                        energy: 100 + n,
                        ..Default::default()
                    }],
                    environment_state: Some(crate::wire::EnvironmentState {
                        cells: vec![0u8; 16],
                    }),
                })
                .await
                .unwrap();
        }

        // organisms appear in the per-run schema once the pipeline settles
        let schema = crate::data::relational::schema::schema_for_run(&run_id).unwrap();
        let count_states = || {
            app.relational
                .conn()
                .query_row(
                    &format!("SELECT count(*) FROM {schema}.organism_states"),
                    [],
                    |row| row.get::<_, i64>(0),
                )
                .unwrap_or(0)
        };
        tokio::time::timeout(Duration::from_secs(20), async {
            while count_states() < 5 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("organism states indexed");

        let metadata = tokio::time::timeout(Duration::from_secs(10), app.gate.get())
            .await
            .expect("metadata gate opens")
            .unwrap();
        assert_eq!(metadata.simulation_run_id, run_id);

        app.manager.stop_all().await;
        for service in app.manager.services() {
            assert_ne!(service.state(), ServiceState::Running, "{}", service.name());
        }
    }
}
