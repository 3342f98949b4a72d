//! The watch graph of one master term: delivery pipeline, router, watchers and synthesizer.

use std::sync::Arc;

use datawatch_core::{
    Application, ConfigMap, Deployment, Endpoint, ExportService, IpPool, ResourceType, Secret, Service, SyncEntity,
    TaskGroup, WatchConfig,
};
use datawatch_kubehub::Source;
use datawatch_store::{DeliveryPipeline, EventRouter, EventSink, StorageClient, TaskCounter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::synth::ExportServiceSynthesizer;
use crate::watcher::{ResourceWatcher, TeeSink};
use crate::SyncError;

const TAP_CAPACITY: usize = 10_240;

/// Sources to watch; a `None` entry leaves that resource type unwatched.
///
/// Without an `export_services` source, ExportServices are synthesized from the Service and
/// TaskGroup streams whenever both are present.
#[derive(Default, Clone)]
pub struct EngineSources {
    pub applications: Option<Arc<dyn Source<Application>>>,
    pub taskgroups: Option<Arc<dyn Source<TaskGroup>>>,
    pub services: Option<Arc<dyn Source<Service>>>,
    pub deployments: Option<Arc<dyn Source<Deployment>>>,
    pub configmaps: Option<Arc<dyn Source<ConfigMap>>>,
    pub secrets: Option<Arc<dyn Source<Secret>>>,
    pub endpoints: Option<Arc<dyn Source<Endpoint>>>,
    pub export_services: Option<Arc<dyn Source<ExportService>>>,
    pub ip_pools: Option<Arc<dyn Source<IpPool>>>,
}

impl EngineSources {
    fn synthesizes_exports(&self) -> bool {
        self.export_services.is_none() && self.services.is_some() && self.taskgroups.is_some()
    }
}

pub struct WatchEngine {
    cancel: CancellationToken,
    router: Arc<EventRouter>,
    pipeline: DeliveryPipeline,
    tasks: Vec<JoinHandle<()>>,
    live: TaskCounter,
}

impl WatchEngine {
    /// Build and start the graph. Every configured resource is listed once before its watcher
    /// is spawned; the first failing listing tears down what was started and is returned.
    pub async fn start(
        cfg: &WatchConfig,
        sources: EngineSources,
        storage: Arc<dyn StorageClient>,
        cancel: CancellationToken,
    ) -> Result<Self, SyncError> {
        cfg.validate()?;
        let pipeline = DeliveryPipeline::start(cfg, storage, &cancel);
        let router = Arc::new(EventRouter::for_pipeline(&cfg.cluster_id, Arc::new(cfg.planner()), &pipeline));
        let live = pipeline.task_counter();
        let mut engine = Self { cancel, router, pipeline, tasks: Vec::new(), live };

        match engine.launch(cfg, sources).await {
            Ok(()) => {
                info!(cluster = %cfg.cluster_id, tasks = engine.tasks.len(), "watch engine started");
                Ok(engine)
            }
            Err(e) => {
                error!(cluster = %cfg.cluster_id, error = %e, "watch engine bootstrap failed");
                engine.shutdown().await;
                Err(e)
            }
        }
    }

    async fn launch(&mut self, cfg: &WatchConfig, sources: EngineSources) -> Result<(), SyncError> {
        let router: Arc<dyn EventSink> = self.router.clone();
        let mut tapped = router.clone();
        if sources.synthesizes_exports() {
            let (tap, rx) = mpsc::channel(TAP_CAPACITY);
            let timing = cfg.timing(ResourceType::ExportService);
            let synth = ExportServiceSynthesizer::new(&cfg.cluster_id, timing.stale_after());
            let cancel = self.cancel.child_token();
            let sink = router.clone();
            self.tasks.push(self.live.spawn(synth.run(rx, sink, timing.tick(), cancel)));
            tapped = Arc::new(TeeSink::new(router.clone(), tap));
        }

        self.watch(cfg, sources.applications, &router).await?;
        self.watch(cfg, sources.taskgroups, &tapped).await?;
        self.watch(cfg, sources.services, &tapped).await?;
        self.watch(cfg, sources.deployments, &router).await?;
        self.watch(cfg, sources.configmaps, &router).await?;
        self.watch(cfg, sources.secrets, &router).await?;
        self.watch(cfg, sources.endpoints, &router).await?;
        self.watch(cfg, sources.export_services, &router).await?;
        self.watch(cfg, sources.ip_pools, &router).await?;
        Ok(())
    }

    async fn watch<T: SyncEntity>(
        &mut self,
        cfg: &WatchConfig,
        source: Option<Arc<dyn Source<T>>>,
        sink: &Arc<dyn EventSink>,
    ) -> Result<(), SyncError> {
        let Some(source) = source else { return Ok(()) };
        let mut w = ResourceWatcher::new(&cfg.cluster_id, source, sink.clone(), cfg.timing(T::RESOURCE));
        let n = w.reconcile_once().await.map_err(|source| SyncError::Bootstrap { resource: T::RESOURCE, source })?;
        info!(resource = %T::RESOURCE, events = n, "initial sync done");
        self.tasks.push(self.live.spawn(w.run(self.cancel.child_token())));
        Ok(())
    }

    pub fn router(&self) -> Arc<EventRouter> { self.router.clone() }

    pub fn pipeline(&self) -> &DeliveryPipeline { &self.pipeline }

    /// Number of spawned watcher and synthesizer tasks still running.
    pub fn running_tasks(&self) -> usize { self.tasks.iter().filter(|t| !t.is_finished()).count() }

    /// Every task of the graph: watchers, synthesizer, consumers and sweeps. Outlives the engine.
    pub fn task_counter(&self) -> TaskCounter { self.live.clone() }

    /// Cancel the term token and wait until every task of the graph has exited.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for t in self.tasks {
            let _ = t.await;
        }
        self.pipeline.shutdown().await;
        info!("watch engine stopped");
    }
}
