use std::sync::Arc;
use std::time::Duration;

use citegraph_core::{
    AppConfig, GraphGateway, MARKER_PROPERTY, NodeIdentity, PlaceholderEdge, PlaceholderOutcome,
    Role, SchedulerConfig, SqliteGraphStore, publication_identity, section_identity,
};
use tracing::info;

use crate::error::Result;
use crate::eutils::EutilsClient;
use crate::pipeline::{CompletionPipeline, CycleReport, PipelineOptions};
use crate::scheduler::{Schedule, ScheduledCompletion};
use crate::source::RecordSource;

/// Entry point for ingestion code that discovers publication ids.
///
/// Registration only records that a publication exists; the completion
/// pipeline fills it in later, either on demand or on a schedule.
pub struct PublicationLoader {
    gateway: Arc<GraphGateway>,
    pipeline: Arc<CompletionPipeline>,
    scheduler: SchedulerConfig,
}

impl PublicationLoader {
    pub fn new(gateway: Arc<GraphGateway>, source: Arc<dyn RecordSource>, config: &AppConfig) -> Self {
        let pipeline = Arc::new(CompletionPipeline::new(
            gateway.clone(),
            source,
            PipelineOptions::from_config(config),
        ));
        Self {
            gateway,
            pipeline,
            scheduler: config.scheduler.clone(),
        }
    }

    /// Open the configured SQLite graph and E-utilities client.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let store = SqliteGraphStore::open(&config.database_path())?;
        let gateway = Arc::new(GraphGateway::new(Arc::new(store)));
        let source = Arc::new(EutilsClient::new(&config.eutils)?);
        Ok(Self::new(gateway, source, config))
    }

    pub fn gateway(&self) -> &Arc<GraphGateway> {
        &self.gateway
    }

    pub fn pipeline(&self) -> &Arc<CompletionPipeline> {
        &self.pipeline
    }

    pub fn register_placeholder(
        &self,
        parent: NodeIdentity,
        child: NodeIdentity,
        relationship_type: &str,
    ) -> Result<PlaceholderOutcome> {
        let edge = PlaceholderEdge::new(parent, child, relationship_type, MARKER_PROPERTY);
        Ok(self.gateway.create_placeholder(&edge)?)
    }

    /// Register `pub_id` as a primary record discovered through `parent`.
    pub fn register_publication(
        &self,
        parent: NodeIdentity,
        pub_id: &str,
    ) -> Result<PlaceholderOutcome> {
        let child = publication_identity(pub_id.trim()).with_role(Role::PubMed.label());
        self.register_placeholder(parent, child, Role::PubMed.parent_relationship())
    }

    pub async fn run_completion_cycle(&self) -> Result<CycleReport> {
        self.pipeline.run_completion_cycle().await
    }

    pub async fn run_repeated(&self, times: u32) -> Result<Vec<CycleReport>> {
        self.pipeline.run_repeated(times).await
    }

    /// Start the background completion loop with the configured initial
    /// delay and repeat count.
    pub fn start_scheduled_completion(&self, interval: Duration) -> ScheduledCompletion {
        let schedule = Schedule {
            interval,
            ..Schedule::from_config(&self.scheduler)
        };
        ScheduledCompletion::start(self.pipeline.clone(), schedule)
    }

    /// Remove a publication, its abstract section and every relationship
    /// touching either. Returns false if the publication did not exist.
    pub fn delete_publication(&self, pub_id: &str) -> Result<bool> {
        self.gateway.delete_node(&section_identity(pub_id))?;
        let deleted = self.gateway.delete_node(&publication_identity(pub_id))?;
        if deleted {
            info!(pub_id, "publication deleted");
        }
        Ok(deleted)
    }
}
