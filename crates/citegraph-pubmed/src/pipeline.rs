//! Placeholder completion: discover → retrieve → merge → expand → finalize.
//!
//! Each pass runs the five stages concurrently within one task, connected by
//! bounded channels. Items flow strictly in order through every stage. Work
//! is rediscovered from the graph on every pass, so an item dropped after a
//! failure is simply picked up again by the next pass.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use citegraph_core::{
    AppConfig, BibliographicEntry, GraphGateway, MARKER_PROPERTY, NodeIdentity, PUBLICATION_LABEL,
    PlaceholderEdge, Role, publication_identity,
};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::error::{PubMedError, Result};
use crate::eutils::types::RawRecord;
use crate::record_parser::parse;
use crate::source::RecordSource;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub channel_capacity: usize,
    pub batch_size: usize,
    /// Register citing publications as `Citation` placeholders.
    pub expand_citations: bool,
}

impl PipelineOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            channel_capacity: config.pipeline.channel_capacity,
            batch_size: config.eutils.batch_size,
            expand_citations: config.pipeline.expand_citations,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// The relationship through which a placeholder was discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub parent: NodeIdentity,
    pub rel_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderWork {
    pub id: String,
    pub role: Role,
    pub parent: Option<ParentLink>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    /// A placeholder to fetch and merge.
    Complete(PlaceholderWork),
    /// A complete primary record whose references were never expanded.
    Expand { id: String },
}

enum Retrieved {
    Record {
        work: PlaceholderWork,
        raw: RawRecord,
        /// False when links needed for expansion could not be looked up.
        links_complete: bool,
    },
    Links {
        id: String,
        reference_ids: BTreeSet<String>,
        citation_ids: BTreeSet<String>,
    },
}

enum Merged {
    Complete {
        entry: BibliographicEntry,
        parent: Option<ParentLink>,
        expand: bool,
    },
    Links {
        id: String,
        reference_ids: BTreeSet<String>,
        citation_ids: BTreeSet<String>,
    },
}

struct Finalize {
    child: NodeIdentity,
    link: ParentLink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Discover,
    Retrieve,
    Merge,
    Expand,
    Finalize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub id: String,
    pub stage: Stage,
    pub message: String,
}

/// Outcome of one completion pass.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub discovered: usize,
    pub retrieved: usize,
    pub merged: usize,
    pub expanded: usize,
    pub placeholders_created: usize,
    pub relationships_finalized: usize,
    pub failures: Vec<ItemFailure>,
    pub elapsed_ms: u64,
}

impl CycleReport {
    /// Nothing was left to do when the pass started.
    pub fn is_idle(&self) -> bool {
        self.discovered == 0
    }
}

#[derive(Default)]
struct Tally {
    processed: usize,
    created: usize,
    failures: Vec<ItemFailure>,
}

impl Tally {
    fn fail(&mut self, id: impl Into<String>, stage: Stage, message: impl Into<String>) {
        self.failures.push(ItemFailure {
            id: id.into(),
            stage,
            message: message.into(),
        });
    }
}

/// Keeps a graph write failure local to its item unless the store itself is
/// unavailable, which halts the pass.
fn absorb<T>(
    result: citegraph_core::Result<T>,
    id: &str,
    stage: Stage,
    tally: &mut Tally,
) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_unavailable() => Err(e.into()),
        Err(e) => {
            warn!(pub_id = id, ?stage, "graph write failed: {e}");
            tally.fail(id, stage, e.to_string());
            Ok(None)
        }
    }
}

fn log_halt(e: PubMedError) -> PubMedError {
    warn!("completion pass halted: {e}");
    e
}

fn primary_role(roles: &[Role]) -> Role {
    [Role::PubMed, Role::Reference, Role::Citation]
        .into_iter()
        .find(|r| roles.contains(r))
        .unwrap_or(Role::Reference)
}

pub struct CompletionPipeline {
    gateway: Arc<GraphGateway>,
    source: Arc<dyn RecordSource>,
    options: PipelineOptions,
    /// Held for the duration of a run; at most one run per pipeline.
    running: Mutex<()>,
}

impl CompletionPipeline {
    pub fn new(
        gateway: Arc<GraphGateway>,
        source: Arc<dyn RecordSource>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            gateway,
            source,
            options,
            running: Mutex::new(()),
        }
    }

    pub fn gateway(&self) -> &Arc<GraphGateway> {
        &self.gateway
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// One discover→finalize pass. Waits for a run already in progress.
    pub async fn run_completion_cycle(&self) -> Result<CycleReport> {
        let _running = self.running.lock().await;
        self.run_pass().await
    }

    /// Up to `times` passes, stopping early once a pass finds no work.
    pub async fn run_repeated(&self, times: u32) -> Result<Vec<CycleReport>> {
        let _running = self.running.lock().await;
        self.run_passes(times).await
    }

    /// Like [`run_repeated`](Self::run_repeated) but returns `None` at once
    /// if another run holds the pipeline.
    pub async fn try_run_repeated(&self, times: u32) -> Result<Option<Vec<CycleReport>>> {
        let Ok(_running) = self.running.try_lock() else {
            return Ok(None);
        };
        self.run_passes(times).await.map(Some)
    }

    async fn run_passes(&self, times: u32) -> Result<Vec<CycleReport>> {
        let mut reports = Vec::new();
        for _ in 0..times {
            let report = self.run_pass().await?;
            let idle = report.is_idle();
            reports.push(report);
            if idle {
                break;
            }
        }
        Ok(reports)
    }

    async fn run_pass(&self) -> Result<CycleReport> {
        let started_at = Utc::now();
        let timer = Instant::now();
        let capacity = self.options.channel_capacity.max(1);

        let (work_tx, work_rx) = mpsc::channel(capacity);
        let (fetched_tx, fetched_rx) = mpsc::channel(capacity);
        let (merged_tx, merged_rx) = mpsc::channel(capacity);
        let (final_tx, final_rx) = mpsc::channel(capacity);

        let (discover, retrieve, merge, expand, finalize) = tokio::join!(
            self.discover(work_tx),
            self.retrieve(work_rx, fetched_tx),
            self.merge(fetched_rx, merged_tx),
            self.expand(merged_rx, final_tx),
            self.finalize(final_rx),
        );

        let discover = discover.map_err(log_halt)?;
        let retrieve = retrieve.map_err(log_halt)?;
        let merge = merge.map_err(log_halt)?;
        let expand = expand.map_err(log_halt)?;
        let finalize = finalize.map_err(log_halt)?;

        let report = CycleReport {
            started_at,
            discovered: discover.processed,
            retrieved: retrieve.processed,
            merged: merge.processed,
            expanded: expand.processed,
            placeholders_created: expand.created,
            relationships_finalized: finalize.processed,
            failures: [
                discover.failures,
                retrieve.failures,
                merge.failures,
                expand.failures,
                finalize.failures,
            ]
            .concat(),
            elapsed_ms: u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        if !report.is_idle() {
            info!(
                discovered = report.discovered,
                merged = report.merged,
                expanded = report.expanded,
                placeholders = report.placeholders_created,
                failures = report.failures.len(),
                elapsed_ms = report.elapsed_ms,
                "completion pass finished"
            );
        }
        Ok(report)
    }

    // ─── Stages ───────────────────────────────────────────────────────────────

    async fn discover(&self, tx: mpsc::Sender<WorkItem>) -> Result<Tally> {
        let mut tally = Tally::default();
        let placeholders = self.gateway.find_placeholder_ids()?;
        let pending = self.gateway.find_pending_expansion_ids()?;
        debug!(placeholders = placeholders.len(), pending = pending.len(), "work discovered");

        for id in placeholders {
            let Some(work) = absorb(self.describe(&id), &id, Stage::Discover, &mut tally)? else {
                continue;
            };
            tally.processed += 1;
            if tx.send(WorkItem::Complete(work)).await.is_err() {
                return Ok(tally);
            }
        }
        for id in pending {
            tally.processed += 1;
            if tx.send(WorkItem::Expand { id }).await.is_err() {
                return Ok(tally);
            }
        }
        Ok(tally)
    }

    fn describe(&self, id: &str) -> citegraph_core::Result<PlaceholderWork> {
        let role = primary_role(&self.gateway.roles(id)?);
        let links = self.gateway.parent_links(id)?;
        let link = links
            .iter()
            .find(|l| l.rel_type == role.parent_relationship())
            .or_else(|| links.first())
            .map(|l| ParentLink {
                parent: l.parent.clone(),
                rel_type: l.rel_type.clone(),
            });
        Ok(PlaceholderWork {
            id: id.to_string(),
            role,
            parent: link,
        })
    }

    async fn retrieve(
        &self,
        mut rx: mpsc::Receiver<WorkItem>,
        tx: mpsc::Sender<Retrieved>,
    ) -> Result<Tally> {
        let mut tally = Tally::default();
        let batch_size = self.options.batch_size.max(1);
        let mut chunk: Vec<PlaceholderWork> = Vec::new();

        while let Some(item) = rx.recv().await {
            match item {
                WorkItem::Complete(work) => {
                    chunk.push(work);
                    if chunk.len() >= batch_size
                        && !self.fetch_chunk(std::mem::take(&mut chunk), &tx, &mut tally).await
                    {
                        return Ok(tally);
                    }
                }
                WorkItem::Expand { id } => {
                    if !chunk.is_empty()
                        && !self.fetch_chunk(std::mem::take(&mut chunk), &tx, &mut tally).await
                    {
                        return Ok(tally);
                    }
                    let (reference_ids, citation_ids) = match self.lookup_links(&id).await {
                        Ok(links) => links,
                        Err(e) => {
                            warn!(pub_id = %id, "link lookup failed, retrying next cycle: {e}");
                            tally.fail(id, Stage::Retrieve, e.to_string());
                            continue;
                        }
                    };
                    tally.processed += 1;
                    let links = Retrieved::Links {
                        id,
                        reference_ids,
                        citation_ids,
                    };
                    if tx.send(links).await.is_err() {
                        return Ok(tally);
                    }
                }
            }
        }
        if !chunk.is_empty() {
            self.fetch_chunk(chunk, &tx, &mut tally).await;
        }
        Ok(tally)
    }

    /// Links of an already complete record. Failures are reported so the
    /// node stays pending instead of being expanded with nothing.
    async fn lookup_links(&self, id: &str) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
        let reference_ids = self.source.lookup_reference_ids(id).await?;
        let citation_ids = if self.options.expand_citations {
            self.source.lookup_citation_ids(id).await?
        } else {
            BTreeSet::new()
        };
        Ok((reference_ids, citation_ids))
    }

    /// Fetch one chunk of placeholders. Returns false once downstream is gone.
    async fn fetch_chunk(
        &self,
        chunk: Vec<PlaceholderWork>,
        tx: &mpsc::Sender<Retrieved>,
        tally: &mut Tally,
    ) -> bool {
        let ids: Vec<String> = chunk.iter().map(|w| w.id.clone()).collect();
        let fetched = match ids.as_slice() {
            [single] => self.source.fetch_record(single).await.map(|r| vec![r]),
            _ => self.source.fetch_record_batch(&ids).await,
        };
        let mut records: HashMap<String, RawRecord> = match fetched {
            Ok(records) => records.into_iter().map(|r| (r.pmid.clone(), r)).collect(),
            Err(e) => {
                warn!(count = ids.len(), "record fetch failed, retrying next cycle: {e}");
                for id in ids {
                    tally.fail(id, Stage::Retrieve, e.to_string());
                }
                return true;
            }
        };

        for work in chunk {
            let Some(mut raw) = records.remove(&work.id) else {
                warn!(pub_id = %work.id, "record missing from fetch response");
                tally.fail(work.id, Stage::Retrieve, "record missing from fetch response");
                continue;
            };
            let links_complete = if self.options.expand_citations {
                match self.source.lookup_citation_ids(&work.id).await {
                    Ok(ids) => {
                        raw.citation_ids = ids;
                        true
                    }
                    Err(e) => {
                        warn!(pub_id = %work.id, "citation lookup failed, expansion deferred: {e}");
                        tally.fail(work.id.clone(), Stage::Retrieve, e.to_string());
                        false
                    }
                }
            } else {
                raw.citation_ids = self.source.fetch_citation_ids(&work.id).await;
                true
            };
            tally.processed += 1;
            let record = Retrieved::Record {
                work,
                raw,
                links_complete,
            };
            if tx.send(record).await.is_err() {
                return false;
            }
        }
        true
    }

    async fn merge(
        &self,
        mut rx: mpsc::Receiver<Retrieved>,
        tx: mpsc::Sender<Merged>,
    ) -> Result<Tally> {
        let mut tally = Tally::default();
        while let Some(item) = rx.recv().await {
            let next = match item {
                Retrieved::Record {
                    work,
                    raw,
                    links_complete,
                } => {
                    let parent_id = work
                        .parent
                        .as_ref()
                        .filter(|l| l.parent.primary_label == PUBLICATION_LABEL)
                        .map(|l| l.parent.id_value.as_str());
                    let entry = parse(&raw, work.role, parent_id);
                    let merged = self.gateway.merge_complete(&entry);
                    if absorb(merged, &entry.id, Stage::Merge, &mut tally)?.is_none() {
                        continue;
                    }
                    tally.processed += 1;

                    let pending = self.needs_expansion(&entry);
                    let Some(expand) = absorb(pending, &entry.id, Stage::Merge, &mut tally)? else {
                        continue;
                    };
                    Merged::Complete {
                        entry,
                        parent: work.parent,
                        expand: expand && links_complete,
                    }
                }
                Retrieved::Links {
                    id,
                    reference_ids,
                    citation_ids,
                } => Merged::Links {
                    id,
                    reference_ids,
                    citation_ids,
                },
            };
            if tx.send(next).await.is_err() {
                break;
            }
        }
        Ok(tally)
    }

    /// Primary records are expanded once; the loaded flag bounds traversal.
    fn needs_expansion(&self, entry: &BibliographicEntry) -> citegraph_core::Result<bool> {
        if !entry.role.is_primary() {
            return Ok(false);
        }
        Ok(!self.gateway.references_loaded(&entry.id)?)
    }

    async fn expand(
        &self,
        mut rx: mpsc::Receiver<Merged>,
        tx: mpsc::Sender<Finalize>,
    ) -> Result<Tally> {
        let mut tally = Tally::default();
        while let Some(item) = rx.recv().await {
            match item {
                Merged::Complete {
                    entry,
                    parent,
                    expand,
                } => {
                    if expand {
                        self.expand_node(&entry.id, &entry.reference_ids, &entry.citation_ids, &mut tally)?;
                    }
                    if let Some(link) = parent {
                        let finalize = Finalize {
                            child: entry.identity(),
                            link,
                        };
                        if tx.send(finalize).await.is_err() {
                            break;
                        }
                    }
                }
                Merged::Links {
                    id,
                    reference_ids,
                    citation_ids,
                } => self.expand_node(&id, &reference_ids, &citation_ids, &mut tally)?,
            }
        }
        Ok(tally)
    }

    fn expand_node(
        &self,
        id: &str,
        reference_ids: &BTreeSet<String>,
        citation_ids: &BTreeSet<String>,
        tally: &mut Tally,
    ) -> Result<()> {
        let node = publication_identity(id);
        let mut created = 0;
        let mut failed = 0;

        let mut linked: Vec<(&String, Role)> = reference_ids
            .iter()
            .map(|r| (r, Role::Reference))
            .collect();
        if self.options.expand_citations {
            linked.extend(citation_ids.iter().map(|c| (c, Role::Citation)));
        }

        for (linked_id, role) in linked.into_iter().filter(|(l, _)| l.as_str() != id) {
            let edge = PlaceholderEdge::new(
                node.clone(),
                publication_identity(linked_id.clone()).with_role(role.label()),
                role.parent_relationship(),
                MARKER_PROPERTY,
            );
            let outcome = self.gateway.create_placeholder(&edge);
            match absorb(outcome, linked_id, Stage::Expand, tally)? {
                Some(outcome) if outcome.node_created() => created += 1,
                Some(_) => {}
                None => failed += 1,
            }
        }
        tally.created += created;

        // Left pending so the next pass retries the links that failed.
        if failed > 0 {
            debug!(pub_id = id, failed, "expansion incomplete");
            return Ok(());
        }
        if absorb(self.gateway.mark_references_loaded(id), id, Stage::Expand, tally)?.is_some() {
            tally.processed += 1;
        }
        debug!(pub_id = id, references = reference_ids.len(), created, "references expanded");
        Ok(())
    }

    async fn finalize(&self, mut rx: mpsc::Receiver<Finalize>) -> Result<Tally> {
        let mut tally = Tally::default();
        while let Some(Finalize { child, link }) = rx.recv().await {
            let ensured = self
                .gateway
                .merge_relationship(&link.parent, &child, &link.rel_type);
            if absorb(ensured, &child.id_value, Stage::Finalize, &mut tally)?.is_some() {
                tally.processed += 1;
            }
        }
        Ok(tally)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSource, FlakyStore, memory_gateway, publication_count, seed};
    use citegraph_core::{HAS_CITATION, HAS_REFERENCE};

    fn pipeline(gateway: &Arc<GraphGateway>, source: &Arc<FakeSource>) -> CompletionPipeline {
        CompletionPipeline::new(gateway.clone(), source.clone(), PipelineOptions::default())
    }

    fn reference_targets(gateway: &GraphGateway, id: &str) -> Vec<String> {
        gateway
            .store()
            .relationships_from(&publication_identity(id), Some(HAS_REFERENCE))
            .unwrap()
            .into_iter()
            .map(|r| r.child.id_value)
            .collect()
    }

    #[tokio::test]
    async fn test_seed_completes_and_expands_references() {
        let gateway = memory_gateway();
        let source = Arc::new(FakeSource::new().with_record("100", "Courtship genes", &["200", "300"]));
        seed(&gateway, "100", Role::PubMed);

        let report = pipeline(&gateway, &source).run_completion_cycle().await.unwrap();

        assert_eq!(report.discovered, 1);
        assert_eq!(report.retrieved, 1);
        assert_eq!(report.merged, 1);
        assert_eq!(report.expanded, 1);
        assert_eq!(report.placeholders_created, 2);
        assert_eq!(report.relationships_finalized, 1);
        assert!(report.failures.is_empty());

        assert!(gateway.is_complete(&publication_identity("100")).unwrap());
        assert!(gateway.references_loaded("100").unwrap());
        assert_eq!(reference_targets(&gateway, "100"), vec!["200", "300"]);
        for id in ["200", "300"] {
            let node = publication_identity(id);
            assert!(gateway.exists(&node).unwrap());
            assert!(gateway.has_role(&node, "Reference").unwrap());
            assert!(!gateway.is_complete(&node).unwrap());
        }
        assert_eq!(gateway.find_placeholder_ids().unwrap(), vec!["200", "300"]);
        // A single placeholder goes through the single-record fetch.
        assert_eq!(source.calls(), vec!["fetch:100", "cites:100"]);
    }

    #[tokio::test]
    async fn test_references_complete_without_further_expansion() {
        let gateway = memory_gateway();
        let source = Arc::new(
            FakeSource::new()
                .with_record("100", "Root", &["200", "300"])
                .with_record("200", "Ref two", &["400"])
                .with_record("300", "Ref three", &[]),
        );
        seed(&gateway, "100", Role::PubMed);
        let pipeline = pipeline(&gateway, &source);

        pipeline.run_completion_cycle().await.unwrap();
        let second = pipeline.run_completion_cycle().await.unwrap();

        assert_eq!(second.merged, 2);
        assert_eq!(second.expanded, 0);
        assert!(source.calls().contains(&"batch:200,300".to_string()));
        assert!(gateway.find_placeholder_ids().unwrap().is_empty());
        assert!(!gateway.exists(&publication_identity("400")).unwrap());
        assert_eq!(gateway.roles("200").unwrap(), vec![Role::Reference]);
    }

    #[tokio::test]
    async fn test_reference_cycle_terminates() {
        let gateway = memory_gateway();
        let source = Arc::new(
            FakeSource::new()
                .with_record("1", "A", &["2"])
                .with_record("2", "B", &["1"]),
        );
        seed(&gateway, "1", Role::PubMed);
        seed(&gateway, "2", Role::PubMed);

        let reports = pipeline(&gateway, &source).run_repeated(10).await.unwrap();

        assert_eq!(reports.len(), 2);
        assert!(reports[1].is_idle());
        assert_eq!(publication_count(&gateway), 2);
        assert_eq!(reference_targets(&gateway, "1"), vec!["2"]);
        assert_eq!(reference_targets(&gateway, "2"), vec!["1"]);
        assert_eq!(source.calls_of("batch") + source.calls_of("fetch"), 1);
    }

    #[tokio::test]
    async fn test_completed_reference_promoted_to_primary() {
        let gateway = memory_gateway();
        let source = Arc::new(FakeSource::new().with_record("200", "Ref", &[]).with_record("500", "Deep", &[]));
        source.set_references("200", &["500"]);
        seed(&gateway, "200", Role::Reference);
        let pipeline = pipeline(&gateway, &source);
        pipeline.run_completion_cycle().await.unwrap();
        assert!(gateway.find_pending_expansion_ids().unwrap().is_empty());

        // Later discovered as a primary record in its own right.
        seed(&gateway, "200", Role::PubMed);
        let report = pipeline.run_completion_cycle().await.unwrap();

        assert_eq!(report.discovered, 1);
        assert_eq!(report.retrieved, 1);
        assert_eq!(report.merged, 0);
        assert_eq!(report.expanded, 1);
        assert_eq!(reference_targets(&gateway, "200"), vec!["500"]);
        assert_eq!(source.calls_of("fetch"), 1);

        let roles = gateway.roles("200").unwrap();
        assert!(roles.contains(&Role::PubMed) && roles.contains(&Role::Reference));

        pipeline.run_repeated(3).await.unwrap();
        assert_eq!(source.calls_of("refs"), 1);
        assert!(gateway.is_complete(&publication_identity("500")).unwrap());
    }

    #[tokio::test]
    async fn test_failed_items_are_dropped_until_next_cycle() {
        let gateway = memory_gateway();
        let source = Arc::new(FakeSource::new().with_record("100", "Found", &[]));
        seed(&gateway, "100", Role::PubMed);
        seed(&gateway, "101", Role::PubMed);
        let pipeline = pipeline(&gateway, &source);

        let report = pipeline.run_completion_cycle().await.unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, "101");
        assert_eq!(report.failures[0].stage, Stage::Retrieve);
        assert_eq!(gateway.find_placeholder_ids().unwrap(), vec!["101"]);

        source.add_record("101", "Late", &[]);
        source.fail("101");
        let report = pipeline.run_completion_cycle().await.unwrap();
        assert_eq!(report.merged, 0);
        assert_eq!(report.failures.len(), 1);

        source.heal("101");
        let report = pipeline.run_completion_cycle().await.unwrap();
        assert_eq!(report.merged, 1);
        assert!(gateway.find_placeholder_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let gateway = memory_gateway();
        let source = Arc::new(
            FakeSource::new()
                .with_record("100", "Root", &["200"])
                .with_record("200", "Leaf", &[]),
        );
        seed(&gateway, "100", Role::PubMed);
        let pipeline = pipeline(&gateway, &source);
        pipeline.run_repeated(5).await.unwrap();
        let settled = gateway.store().stats().unwrap();

        // Forget the expansion so the next pass redoes it.
        source.set_references("100", &["200"]);
        let mut reset = citegraph_core::Properties::new();
        reset.insert("references_loaded".into(), serde_json::Value::Bool(false));
        gateway
            .store()
            .merge_node(&publication_identity("100"), &reset, citegraph_core::MergeMode::Always)
            .unwrap();
        let report = pipeline.run_completion_cycle().await.unwrap();

        assert_eq!(report.expanded, 1);
        assert_eq!(report.placeholders_created, 0);
        assert_eq!(gateway.store().stats().unwrap(), settled);
    }

    #[tokio::test]
    async fn test_citation_expansion() {
        let gateway = memory_gateway();
        let source = Arc::new(FakeSource::new().with_record("100", "Cited", &[]));
        source.set_citations("100", &["900", "901"]);
        seed(&gateway, "100", Role::PubMed);
        let options = PipelineOptions {
            expand_citations: true,
            ..PipelineOptions::default()
        };
        let pipeline = CompletionPipeline::new(gateway.clone(), source.clone(), options);

        let report = pipeline.run_completion_cycle().await.unwrap();

        assert_eq!(report.placeholders_created, 2);
        let citing = gateway
            .store()
            .relationships_from(&publication_identity("100"), Some(HAS_CITATION))
            .unwrap();
        assert_eq!(citing.len(), 2);
        assert!(gateway.has_role(&publication_identity("900"), "Citation").unwrap());
        let props = gateway
            .store()
            .node_properties(&publication_identity("100"))
            .unwrap()
            .unwrap();
        assert_eq!(props["cited_by_count"], serde_json::json!(2));
    }

    #[tokio::test]
    async fn test_rejected_reference_write_is_retried() {
        let store = Arc::new(FlakyStore::new());
        let gateway = Arc::new(GraphGateway::new(store.clone()));
        let source = Arc::new(FakeSource::new().with_record("100", "Root", &["200", "300"]));
        source.set_references("100", &["200", "300"]);
        seed(&gateway, "100", Role::PubMed);
        store.reject_once("300");
        let pipeline = pipeline(&gateway, &source);

        let first = pipeline.run_completion_cycle().await.unwrap();
        // The rest of the pass carries on around the rejected write.
        assert_eq!(first.merged, 1);
        assert_eq!(first.placeholders_created, 1);
        assert_eq!(first.relationships_finalized, 1);
        assert_eq!(first.expanded, 0);
        assert_eq!(first.failures.len(), 1);
        assert_eq!(first.failures[0].id, "300");
        assert_eq!(first.failures[0].stage, Stage::Expand);
        assert!(!gateway.references_loaded("100").unwrap());
        assert_eq!(reference_targets(&gateway, "100"), vec!["200"]);

        pipeline.run_repeated(3).await.unwrap();
        assert!(gateway.references_loaded("100").unwrap());
        assert_eq!(reference_targets(&gateway, "100"), vec!["200", "300"]);
        assert_eq!(source.calls_of("refs"), 1);
    }

    #[tokio::test]
    async fn test_failed_link_lookup_keeps_promoted_node_pending() {
        let gateway = memory_gateway();
        let source = Arc::new(FakeSource::new().with_record("200", "Ref", &[]).with_record("500", "Deep", &[]));
        seed(&gateway, "200", Role::Reference);
        let pipeline = pipeline(&gateway, &source);
        pipeline.run_completion_cycle().await.unwrap();

        seed(&gateway, "200", Role::PubMed);
        source.fail_links("200");
        let report = pipeline.run_completion_cycle().await.unwrap();

        assert_eq!(report.discovered, 1);
        assert_eq!(report.expanded, 0);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, "200");
        assert_eq!(report.failures[0].stage, Stage::Retrieve);
        assert!(!gateway.references_loaded("200").unwrap());
        assert_eq!(gateway.find_pending_expansion_ids().unwrap(), vec!["200"]);

        source.heal_links("200");
        source.set_references("200", &["500"]);
        pipeline.run_repeated(3).await.unwrap();
        assert!(gateway.references_loaded("200").unwrap());
        assert_eq!(reference_targets(&gateway, "200"), vec!["500"]);
        assert!(gateway.is_complete(&publication_identity("500")).unwrap());
    }

    #[tokio::test]
    async fn test_failed_citation_lookup_defers_expansion() {
        let gateway = memory_gateway();
        let source = Arc::new(FakeSource::new().with_record("100", "Cited", &["200"]));
        source.set_references("100", &["200"]);
        source.set_citations("100", &["900"]);
        source.fail_links("100");
        seed(&gateway, "100", Role::PubMed);
        let options = PipelineOptions {
            expand_citations: true,
            ..PipelineOptions::default()
        };
        let pipeline = CompletionPipeline::new(gateway.clone(), source.clone(), options);

        let report = pipeline.run_completion_cycle().await.unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.expanded, 0);
        assert_eq!(report.failures[0].stage, Stage::Retrieve);
        assert!(gateway.is_complete(&publication_identity("100")).unwrap());
        assert!(!gateway.exists(&publication_identity("200")).unwrap());

        source.heal_links("100");
        let report = pipeline.run_completion_cycle().await.unwrap();
        assert_eq!(report.expanded, 1);
        assert_eq!(reference_targets(&gateway, "100"), vec!["200"]);
        assert!(gateway.has_role(&publication_identity("900"), "Citation").unwrap());
    }

    #[tokio::test]
    async fn test_store_unavailable_halts_cycle() {
        let store = Arc::new(FlakyStore::new());
        let gateway = Arc::new(GraphGateway::new(store.clone()));
        let source = Arc::new(FakeSource::new().with_record("100", "Root", &[]));
        seed(&gateway, "100", Role::PubMed);
        let pipeline = pipeline(&gateway, &source);

        store.set_broken(true);
        let err = pipeline.run_completion_cycle().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(gateway.find_placeholder_ids().unwrap(), vec!["100"]);

        store.set_broken(false);
        let report = pipeline.run_completion_cycle().await.unwrap();
        assert_eq!(report.merged, 1);
    }

    #[tokio::test]
    async fn test_overlapping_run_is_skipped() {
        let gateway = memory_gateway();
        let source = Arc::new(FakeSource::new());
        let pipeline = pipeline(&gateway, &source);

        let held = pipeline.running.lock().await;
        assert!(pipeline.try_run_repeated(2).await.unwrap().is_none());
        drop(held);

        let reports = pipeline.try_run_repeated(2).await.unwrap().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_idle());
    }

    #[test]
    fn test_primary_role_precedence() {
        assert_eq!(primary_role(&[Role::Reference, Role::PubMed]), Role::PubMed);
        assert_eq!(primary_role(&[Role::Citation]), Role::Citation);
        assert_eq!(primary_role(&[]), Role::Reference);
    }
}
