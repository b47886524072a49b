//! Collaborators shared by one delegation session.
//!
//! Everything a coordinator touches is built here and handed over at
//! construction, so two sessions (or two tests) never share registries,
//! breakers or subscriptions.

use std::path::Path;
use std::sync::Arc;

use crate::bus::{MessageBus, MessageSink};
use crate::classifier::TaskClassifier;
use crate::config::DelegatorConfig;
use crate::embedding::{Embedder, EmbeddingService};
use crate::error::Error;
use crate::routing::RoutingEngine;
use crate::store::{Database, LibSqlBackend};
use crate::tracker::StatusTracker;
use crate::transport::TransportPool;
use crate::workers::WorkerRegistry;

pub struct DelegationContext {
    pub config: DelegatorConfig,
    pub store: Arc<dyn Database>,
    pub transports: Arc<TransportPool>,
    pub bus: Arc<MessageBus>,
    pub registry: Arc<WorkerRegistry>,
    pub routing: Arc<RoutingEngine>,
    pub tracker: Arc<StatusTracker>,
    pub classifier: TaskClassifier,
    pub embeddings: Arc<EmbeddingService>,
}

impl DelegationContext {
    /// Wire up a session over an already migrated store.
    pub fn new(
        config: DelegatorConfig,
        store: Arc<dyn Database>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let transports = Arc::new(TransportPool::new(&config));
        let bus = Arc::new(MessageBus::new(&config, transports.clone(), sink, store.clone()));
        let registry = Arc::new(WorkerRegistry::new(&config));
        let routing = Arc::new(RoutingEngine::new(registry.clone(), config.routing.clone()));
        let tracker = Arc::new(StatusTracker::new(store.clone(), config.notifications.clone()));
        Self {
            config,
            store,
            transports,
            bus,
            registry,
            routing,
            tracker,
            classifier: TaskClassifier::new(),
            embeddings: Arc::new(EmbeddingService::fallback_only()),
        }
    }

    /// Open the libSQL store (in memory when `db_path` is `None`), run
    /// migrations and wire up a session.
    pub async fn open(
        config: DelegatorConfig,
        db_path: Option<&Path>,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let backend = match db_path {
            Some(path) => LibSqlBackend::new_local(path).await?,
            None => LibSqlBackend::new_memory().await?,
        };
        backend.run_migrations().await?;
        Ok(Self::new(config, Arc::new(backend), sink))
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>, dimensions: usize) -> Self {
        self.embeddings = Arc::new(EmbeddingService::new(Some(embedder), dimensions));
        self
    }
}
