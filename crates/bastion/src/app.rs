//! Main application logic and lifecycle management.
//!
//! The composition root: builds every subsystem in dependency order with
//! shared context, bridges the event pipelines, and owns the phased
//! shutdown.

use crate::config::AppConfig;
use crate::logging::display_banner;
use crate::signals::{arm_fast_exit, wait_for_shutdown};
use crate::store::Store;
use crate::wiring::{plugin_api_factory, CoreServices, PanelDispatcher};
use bastion_access::{InMemoryRoleStore, PermissionService};
use bastion_connectors::{register_builtin_connectors, ConnectorManager};
use bastion_events::{EventBus, EventType, JoinSucceededPayload, ServerRecord, ShutdownState};
use bastion_logwatch::{LogWatcherClient, LogWatcherConfig};
use bastion_plugin_system::{
    register_builtin_plugins, DynamicPluginLoader, PluginManager, SandboxLimits,
};
use bastion_rcon::ConnectionManager;
use bastion_telemetry::{
    IdentityResolver, JoinLedger, JsonlAnalyticsStore, JsonlSink, TelemetrySink,
};
use bastion_workflow::WorkflowEngine;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Main application struct.
///
/// Owns every subsystem for the lifetime of the process. Bring-up order is
/// sink → bus → access → console manager → log watchers → connectors →
/// plugins → workflows; shutdown walks the same order in reverse with
/// bounded waits.
pub struct Application {
    config: AppConfig,
    root_cancel: CancellationToken,
    bus: Arc<EventBus>,
    connections: Arc<ConnectionManager>,
    connectors: Arc<ConnectorManager>,
    plugins: Arc<PluginManager>,
    workflows: Arc<WorkflowEngine>,
}

impl Application {
    /// Builds the full core from configuration and persisted state.
    pub async fn new(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        config.validate().map_err(|e| format!("Configuration validation failed: {e}"))?;
        display_banner();

        let root_cancel = CancellationToken::new();
        let store = Store::new(&config.data.data_dir);

        // --- Telemetry sink (first up, last down: everything logs into it)
        let sink: Arc<dyn TelemetrySink> =
            Arc::new(JsonlSink::open(&config.data.telemetry_dir).await?);
        let analytics = Arc::new(JsonlAnalyticsStore::open(&config.data.telemetry_dir).await?);

        // --- Event bus
        let bus = Arc::new(EventBus::with_capacity(config.limits.subscription_buffer));

        // --- Access control
        let role_store = Arc::new(InMemoryRoleStore::new());
        for role in store.load_roles().await {
            role_store.upsert_role(role);
        }
        for assignment in store.load_role_assignments().await {
            role_store.assign(&assignment.principal, assignment.server_id, &assignment.role_id);
        }
        let permissions = Arc::new(PermissionService::with_ttl(
            role_store.clone(),
            Duration::from_secs(config.limits.permission_cache_ttl_secs),
        ));

        // --- Console connection manager (with its private event bus,
        // bridged onto the main bus so ordering per connection is preserved)
        let connections = Arc::new(ConnectionManager::new());
        Self::bridge_console_events(&connections, &bus);

        // --- Server registry
        let servers: Arc<DashMap<_, ServerRecord>> = Arc::new(DashMap::new());
        for entry in &config.servers {
            servers.insert(entry.id, entry.to_record());
        }

        // --- Connectors
        let connectors = Arc::new(ConnectorManager::new(Arc::clone(&bus)));
        register_builtin_connectors(&connectors);
        connectors.boot_from_store(&store.load_connectors().await).await;

        // --- Shared service context for capability wiring
        let services = CoreServices {
            bus: Arc::clone(&bus),
            connections: Arc::clone(&connections),
            permissions: Arc::clone(&permissions),
            connectors: Arc::clone(&connectors),
            sink: Arc::clone(&sink),
            servers: Arc::clone(&servers),
            plugin_store: Arc::new(DashMap::new()),
        };

        // --- Plugins: built-ins, then verified dynamic libraries
        let plugins = Arc::new(PluginManager::with_factory(
            plugin_api_factory(services.clone()),
            SandboxLimits::default(),
        ));
        register_builtin_plugins(&plugins);
        Self::load_dynamic_plugins(&config, &store, &plugins).await;

        for plugin_config in store.load_plugin_configs().await {
            if !plugin_config.enabled {
                continue;
            }
            match plugins
                .create_instance(
                    &plugin_config.plugin_id,
                    plugin_config.server_id,
                    &plugin_config.config,
                )
                .await
            {
                Ok(instance) => {
                    if let Err(e) = plugins.start(instance.id).await {
                        error!("❌ Plugin '{}' failed to start: {e}", plugin_config.plugin_id);
                    }
                }
                Err(e) => {
                    error!("❌ Plugin '{}' failed to create: {e}", plugin_config.plugin_id)
                }
            }
        }
        plugins.spawn_event_pump(bus.subscribe(None));
        plugins.spawn_sandbox_monitor();

        // --- Workflows
        let dispatcher = Arc::new(PanelDispatcher::new(services.clone())?);
        let workflows = Arc::new(WorkflowEngine::new(dispatcher, Arc::clone(&sink)));
        for record in store.load_workflows().await {
            if let Err(e) = workflows.upsert_workflow(record) {
                error!("❌ Rejected persisted workflow: {e}");
            }
        }
        workflows.spawn_event_pump(bus.subscribe(None));

        // --- Event store pump: every bus event lands in the monthly files
        Self::spawn_event_store_pump(&bus, &sink, &root_cancel);

        // --- Identity resolver: live ledger + periodic full refresh
        Self::spawn_identity_job(
            &bus,
            Arc::new(IdentityResolver::new(analytics)),
            Duration::from_secs(config.limits.identity_refresh_secs),
            &root_cancel,
        );

        Ok(Self {
            config,
            root_cancel,
            bus,
            connections,
            connectors,
            plugins,
            workflows,
        })
    }

    /// Runs the application until a shutdown signal, then performs the
    /// phased teardown.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("🌟 Starting Bastion control panel core");
        self.log_configuration_summary();

        // Bring up console sessions and log watchers for every server.
        let records: Vec<ServerRecord> =
            self.config.servers.iter().map(|s| s.to_record()).collect();
        self.connections.boot_from_store(&records).await;
        self.connections.start_reconnect_loop();

        for server in &self.config.servers {
            LogWatcherClient::spawn(
                server.id,
                LogWatcherConfig {
                    endpoint: server.logwatch_endpoint.clone(),
                    token: server.logwatch_token.clone(),
                },
                Arc::clone(&self.bus),
                &self.root_cancel,
            );
        }

        // Periodic health reporting.
        let monitoring_handle = {
            let bus = Arc::clone(&self.bus);
            let connections = Arc::clone(&self.connections);
            let plugins = Arc::clone(&self.plugins);
            let workflows = Arc::clone(&self.workflows);
            let period = Duration::from_secs(self.config.limits.stats_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                let mut last_published = 0u64;
                loop {
                    ticker.tick().await;
                    let stats = bus.stats();
                    let this_period = stats.events_published - last_published;
                    last_published = stats.events_published;
                    info!(
                        "📊 Health - {} events/period | {} dropped total | {} subscribers | {} servers | {} plugins | {} workflows",
                        this_period,
                        stats.events_dropped,
                        stats.subscriber_count,
                        connections.server_count(),
                        plugins.instance_count(),
                        workflows.workflow_count(),
                    );
                }
            })
        };

        info!("✅ Bastion core is running");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        let shutdown_state = ShutdownState::new();
        wait_for_shutdown(&shutdown_state).await?;
        arm_fast_exit();

        self.shutdown(shutdown_state, monitoring_handle).await;
        Ok(())
    }

    async fn shutdown(
        self,
        shutdown_state: ShutdownState,
        monitoring_handle: tokio::task::JoinHandle<()>,
    ) {
        info!("🛑 Beginning graceful shutdown");
        monitoring_handle.abort();

        // Phase 1: stop event intake - watchers and the console sessions.
        info!("📡 Phase 1: stopping event intake...");
        self.root_cancel.cancel();
        self.connections.shutdown().await;

        // Phase 2: let in-flight deliveries drain briefly.
        info!("⏳ Phase 2: draining in-flight events...");
        tokio::time::sleep(Duration::from_millis(250)).await;
        shutdown_state.complete_shutdown();

        // Phase 3: reactors and engines.
        info!("🔌 Phase 3: stopping workflows and plugins...");
        self.workflows.shutdown();
        self.plugins.shutdown_all().await;

        // Phase 4: connectors last - plugins may call them while stopping.
        info!("🔗 Phase 4: stopping connectors...");
        self.connectors.shutdown_all().await;

        let stats = self.bus.stats();
        info!("📊 Final statistics:");
        info!("  - Events published: {}", stats.events_published);
        info!("  - Events delivered: {}", stats.events_delivered);
        info!("  - Events dropped:   {}", stats.events_dropped);
        info!("✅ Bastion shutdown complete");
    }

    /// Forwards console-manager events (typed notifications plus connection
    /// lifecycle) onto the main bus.
    fn bridge_console_events(connections: &Arc<ConnectionManager>, bus: &Arc<EventBus>) {
        let mut subscription = connections.subscribe_events();
        let bus = Arc::clone(bus);
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                bus.publish_arc(event);
            }
        });
    }

    async fn load_dynamic_plugins(config: &AppConfig, store: &Store, plugins: &Arc<PluginManager>) {
        let plugin_dir = std::path::Path::new(&config.data.plugin_dir);
        if !plugin_dir.is_dir() {
            return;
        }
        let trusted_keys = store.load_trusted_keys().await;
        if trusted_keys.is_empty() {
            warn!("Plugin directory exists but no trusted signer keys are configured; skipping dynamic plugins");
            return;
        }
        let mut loader = DynamicPluginLoader::new(trusted_keys);
        let Ok(entries) = std::fs::read_dir(plugin_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("so") {
                continue;
            }
            let signature_path = path.with_extension("so.sig");
            match loader.load(&path, &signature_path) {
                Ok(loaded) => {
                    info!(
                        "🧩 Dynamic plugin '{}' available (features: {:?})",
                        loaded.manifest.plugin_id, loaded.manifest.required_features
                    );
                    // Definition registration for dynamic plugins binds the
                    // library factory; the manifest supplies the metadata.
                    register_dynamic_definition(plugins, loaded);
                }
                Err(e) => {
                    error!("❌ Dynamic plugin {} rejected: {e}", path.display());
                }
            }
        }
        // Libraries must outlive their instances; the loader leaks them for
        // the process lifetime, the documented best-effort unload.
        std::mem::forget(loader);
    }

    fn log_configuration_summary(&self) {
        info!("📋 Configuration summary:");
        info!("  🎮 Servers: {}", self.config.servers.len());
        for server in &self.config.servers {
            info!(
                "     - {} ({}:{} console, log agent {})",
                server.name, server.host, server.rcon_port, server.logwatch_endpoint
            );
        }
        info!("  📂 Data: {} | Telemetry: {}", self.config.data.data_dir, self.config.data.telemetry_dir);
        info!(
            "  ⏱️ Buffers: {} | Permission TTL: {}s",
            self.config.limits.subscription_buffer, self.config.limits.permission_cache_ttl_secs
        );
    }

    fn spawn_event_store_pump(
        bus: &Arc<EventBus>,
        sink: &Arc<dyn TelemetrySink>,
        cancel: &CancellationToken,
    ) {
        let mut subscription = bus.subscribe(None);
        let sink = Arc::clone(sink);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = subscription.recv() => {
                        let Some(event) = event else { break };
                        if let Err(e) = sink.write_event(&event).await {
                            error!("Event store write failed: {e}");
                        }
                    }
                }
            }
        });
    }

    fn spawn_identity_job(
        bus: &Arc<EventBus>,
        resolver: Arc<IdentityResolver>,
        period: Duration,
        cancel: &CancellationToken,
    ) {
        let filter: HashSet<EventType> = [EventType::JoinSucceeded].into_iter().collect();
        let mut subscription = bus.subscribe(Some(filter));
        let ledger = Arc::new(JoinLedger::new());
        let cancel = cancel.clone();

        let recorder_ledger = Arc::clone(&ledger);
        let recorder_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = recorder_cancel.cancelled() => break,
                    event = subscription.recv() => {
                        let Some(event) = event else { break };
                        match event.payload::<JoinSucceededPayload>() {
                            Ok(payload) => recorder_ledger.record(&payload, event.timestamp),
                            Err(e) => warn!("Unparseable join record: {e}"),
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // skip the immediate first tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let observations = ledger.snapshot();
                if observations.is_empty() {
                    continue;
                }
                if let Err(e) = resolver.run(&observations).await {
                    error!("Identity refresh failed: {e}");
                }
            }
        });
    }
}

/// Registers a verified dynamic library's plugin definition.
fn register_dynamic_definition(
    plugins: &Arc<PluginManager>,
    loaded: &bastion_plugin_system::dynamic::LoadedLibrary,
) {
    use bastion_plugin_system::PluginDefinition;

    let manifest = loaded.manifest.clone();
    let plugin = match loaded.create_plugin() {
        Ok(plugin) => std::sync::Mutex::new(Some(plugin)),
        Err(e) => {
            error!("❌ Dynamic plugin '{}' factory failed: {e}", manifest.plugin_id);
            return;
        }
    };

    // The library factory can only mint one instance per load here; the
    // definition's factory hands it out once and errors afterwards, which
    // the manager surfaces as an initialization failure.
    let plugin_id: &'static str = Box::leak(manifest.plugin_id.clone().into_boxed_str());
    let version: &'static str = Box::leak(manifest.version.clone().into_boxed_str());
    let author: &'static str = Box::leak(manifest.author.clone().into_boxed_str());

    let mut definition = PluginDefinition::new(plugin_id, version, author, move || {
        plugin
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_else(|| Box::new(ExhaustedFactoryPlugin))
    })
    .with_features(manifest.required_features.clone())
    .with_events(
        manifest
            .events
            .iter()
            .map(|name| EventType::from_name(name)),
    )
    .sandboxed();
    if manifest.long_running {
        definition = definition.long_running();
    }
    if manifest.allow_multiple_instances {
        definition = definition.allow_multiple();
    }
    plugins.register_definition(definition);
}

/// Placeholder returned when a dynamic library's single instance was
/// already handed out; initialize fails loudly.
struct ExhaustedFactoryPlugin;

#[async_trait::async_trait]
impl bastion_plugin_system::Plugin for ExhaustedFactoryPlugin {
    async fn initialize(
        &mut self,
        _config: &serde_json::Value,
        _apis: bastion_plugin_system::PluginApis,
    ) -> Result<(), bastion_plugin_system::PluginError> {
        Err(bastion_plugin_system::PluginError::InitializationFailed(
            "dynamic plugin library allows a single live instance".to_string(),
        ))
    }

    async fn handle_event(
        &mut self,
        _event: &bastion_events::NormalizedEvent,
    ) -> Result<(), bastion_plugin_system::PluginError> {
        Ok(())
    }
}
