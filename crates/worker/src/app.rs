//! Process wiring: every component is built once here and handed its
//! collaborators explicitly.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use scriptorium_events::{AuditSink, FanoutAuditSink, TracingAuditSink};
use scriptorium_infra::{
    artifacts::{ArtifactStore, FsArtifactStore},
    audit::PostgresAuditSink,
    config::EngineSettings,
    dispatcher::Dispatcher,
    jobs::{InMemoryJobStore, JobStore, PostgresJobStore},
    pipeline::{Escalator, PhasePipeline},
    queue::JobQueue,
    reaper::Reaper,
};
use scriptorium_core::CostGuard;
use scriptorium_llm::{BackendRegistry, ScriptedBackend};

/// Where generation calls go.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum BackendMode {
    /// The backends named in the settings.
    #[default]
    Configured,
    /// Every configured backend name answers with a local echo.
    DryRun,
}

pub struct App {
    pub settings: EngineSettings,
    pub store: Arc<dyn JobStore>,
    pub audit: Arc<dyn AuditSink>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub queue: JobQueue,
    pub dispatcher: Dispatcher,
    pub reaper: Reaper,
    /// False when jobs only live in this process.
    pub persistent: bool,
}

impl core::fmt::Debug for App {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("App")
            .field("persistent", &self.persistent)
            .field("dispatcher", &self.dispatcher)
            .field("reaper", &self.reaper)
            .finish_non_exhaustive()
    }
}

pub async fn build_app(settings: EngineSettings, mode: BackendMode) -> anyhow::Result<App> {
    let (store, audit, persistent): (Arc<dyn JobStore>, Arc<dyn AuditSink>, bool) =
        match settings.database_url.as_deref() {
            Some(url) => {
                let store = PostgresJobStore::connect(url, settings.database_max_connections)
                    .await
                    .context("connecting to postgres")?;
                store
                    .ensure_schema()
                    .await
                    .context("creating job tables")?;
                let audit = FanoutAuditSink::new()
                    .with(Arc::new(TracingAuditSink))
                    .with(Arc::new(PostgresAuditSink::new(store.pool().clone())));
                info!(max_connections = settings.database_max_connections, "using postgres job store");
                (Arc::new(store), Arc::new(audit), true)
            }
            None => {
                warn!("database_url not set; jobs are kept in memory and lost on exit");
                (Arc::new(InMemoryJobStore::new()), Arc::new(TracingAuditSink), false)
            }
        };

    let backends = match mode {
        BackendMode::Configured => BackendRegistry::from_configs(&settings.backends)
            .context("building generation backends")?,
        BackendMode::DryRun => dry_run_backends(&settings),
    };

    let artifacts = Arc::new(FsArtifactStore::new(
        settings.artifacts.root.clone(),
        settings.artifacts.inbox.clone(),
    ));

    let mut app = assemble(settings, store, audit, artifacts, backends)?;
    app.persistent = persistent;
    Ok(app)
}

/// Build the engine around already-constructed stores and backends.
pub fn assemble(
    settings: EngineSettings,
    store: Arc<dyn JobStore>,
    audit: Arc<dyn AuditSink>,
    artifacts: Arc<dyn ArtifactStore>,
    backends: BackendRegistry,
) -> anyhow::Result<App> {
    settings.validate()?;
    let router = Arc::new(settings.router()?);
    let top_tier = router.top_tier();

    let escalator = Escalator::new(
        router,
        backends,
        CostGuard::new(settings.cost_guard.clone(), settings.prices.clone()),
        settings.escalation.clone(),
        audit.clone(),
    );
    let pipeline = PhasePipeline::new(
        settings.pipeline.clone(),
        escalator,
        store.clone(),
        artifacts.clone(),
        audit.clone(),
    );
    let dispatcher = Dispatcher::new(
        store.clone(),
        pipeline,
        audit.clone(),
        settings.dispatcher.clone(),
    );
    let reaper = Reaper::new(store.clone(), audit.clone(), settings.reaper.clone());
    let queue = JobQueue::new(
        store.clone(),
        audit.clone(),
        settings.pipeline.clone(),
        top_tier,
    );

    Ok(App {
        settings,
        store,
        audit,
        artifacts,
        queue,
        dispatcher,
        reaper,
        persistent: false,
    })
}

fn dry_run_backends(settings: &EngineSettings) -> BackendRegistry {
    let echo = Arc::new(ScriptedBackend::new());
    settings
        .backends
        .keys()
        .fold(BackendRegistry::new(), |registry, name| {
            registry.with(name.clone(), echo.clone())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptorium_core::{JobStatus, NewJob};
    use scriptorium_events::{EventKind, InMemoryAuditSink};
    use scriptorium_infra::artifacts::InMemoryArtifactStore;
    use scriptorium_infra::pipeline::MANIFEST_NAME;
    use scriptorium_llm::ScriptStep;

    #[tokio::test]
    async fn default_settings_process_a_job_end_to_end() {
        let settings = EngineSettings::default();
        let store = Arc::new(InMemoryJobStore::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        artifacts.add_source("ep-7", "A long conversation about type systems.");
        let backend = Arc::new(ScriptedBackend::new());
        let backends = BackendRegistry::new().with("openrouter", backend.clone());

        let app = assemble(settings, store, audit.clone(), artifacts.clone(), backends).unwrap();
        let job = app.queue.submit(NewJob::new("ep-7")).await.unwrap();

        let report = app.dispatcher.run_once().await.unwrap().unwrap();
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(backend.call_count(), app.settings.pipeline.len());
        // copy_editor has base tier 1.
        assert_eq!(
            backend.models_called().last().map(String::as_str),
            Some("anthropic/claude-3.5-haiku")
        );
        assert!(artifacts.read(job.id, MANIFEST_NAME).await.unwrap().is_some());
        assert_eq!(audit.count(EventKind::JobCompleted), 1);
    }

    #[tokio::test]
    async fn configured_models_are_used_per_tier() {
        let mut settings = EngineSettings::default();
        settings.escalation.backoff = scriptorium_infra::pipeline::RetryPolicy::immediate();
        let backend = Arc::new(ScriptedBackend::new());
        backend.push("openai/gpt-4o-mini", ScriptStep::server_error());
        backend.push("openai/gpt-4o-mini", ScriptStep::server_error());

        let artifacts = Arc::new(InMemoryArtifactStore::new());
        artifacts.add_source("ep-8", "Short source.");
        let app = assemble(
            settings,
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryAuditSink::new()),
            artifacts,
            BackendRegistry::new().with("openrouter", backend.clone()),
        )
        .unwrap();
        let job = app.queue.submit(NewJob::new("ep-8")).await.unwrap();

        app.dispatcher.run_once().await.unwrap().unwrap();
        let analyst = app.queue.get(job.id).await.unwrap();
        let analyst = analyst.phase("analyst").unwrap();
        assert_eq!(analyst.tier, Some(1));
        assert_eq!(analyst.attempts, 3);
    }

    #[test]
    fn dry_run_registers_every_configured_backend() {
        let settings = EngineSettings::default();
        let registry = dry_run_backends(&settings);
        assert!(registry.contains("openrouter"));
    }
}
