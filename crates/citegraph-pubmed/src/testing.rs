//! In-memory fixtures shared by the pipeline, scheduler and loader tests.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use citegraph_core::storage::{GraphStats, GraphStore, MergeMode, NodePredicate, Properties, Relationship};
use citegraph_core::{
    GraphError, GraphGateway, MARKER_PROPERTY, NodeIdentity, PlaceholderEdge, Role,
    SqliteGraphStore, publication_identity,
};

use crate::error::{PubMedError, Result};
use crate::eutils::types::{ArticleId, RawAuthor, RawRecord};
use crate::source::RecordSource;

pub fn raw_record(id: &str, title: &str, references: &[&str]) -> RawRecord {
    RawRecord {
        pmid: id.to_string(),
        title: title.to_string(),
        journal_title: "Genetics".to_string(),
        volume: Some("12".to_string()),
        issue: Some("3".to_string()),
        year: Some("2019".to_string()),
        pagination: Some("100-110".to_string()),
        abstract_paragraphs: vec![format!("Abstract of {id}.")],
        authors: vec![RawAuthor::Person {
            last_name: "Smith".to_string(),
            fore_name: Some("Ann".to_string()),
            initials: None,
            suffix: None,
        }],
        article_ids: vec![ArticleId::new("pubmed", id)],
        references: references
            .iter()
            .map(|r| vec![ArticleId::new("pubmed", *r)])
            .collect(),
        citation_ids: BTreeSet::new(),
    }
}

/// Scripted record source. Every call is logged as `"<kind>:<ids>"`.
#[derive(Default)]
pub struct FakeSource {
    records: Mutex<HashMap<String, RawRecord>>,
    references: Mutex<HashMap<String, BTreeSet<String>>>,
    citations: Mutex<HashMap<String, BTreeSet<String>>>,
    failing: Mutex<HashSet<String>>,
    failing_links: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(self, id: &str, title: &str, references: &[&str]) -> Self {
        self.add_record(id, title, references);
        self
    }

    pub fn add_record(&self, id: &str, title: &str, references: &[&str]) {
        self.records
            .lock()
            .unwrap()
            .insert(id.to_string(), raw_record(id, title, references));
    }

    pub fn set_references(&self, id: &str, ids: &[&str]) {
        self.references
            .lock()
            .unwrap()
            .insert(id.to_string(), ids.iter().map(|s| s.to_string()).collect());
    }

    pub fn set_citations(&self, id: &str, ids: &[&str]) {
        self.citations
            .lock()
            .unwrap()
            .insert(id.to_string(), ids.iter().map(|s| s.to_string()).collect());
    }

    pub fn fail(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        self.failing.lock().unwrap().remove(id);
    }

    /// Make link lookups for `id` fail until healed.
    pub fn fail_links(&self, id: &str) {
        self.failing_links.lock().unwrap().insert(id.to_string());
    }

    pub fn heal_links(&self, id: &str) {
        self.failing_links.lock().unwrap().remove(id);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_of(&self, kind: &str) -> usize {
        let prefix = format!("{kind}:");
        self.calls().iter().filter(|c| c.starts_with(&prefix)).count()
    }

    fn log(&self, kind: &str, ids: &str) {
        self.calls.lock().unwrap().push(format!("{kind}:{ids}"));
    }

    fn failing(&self, ids: &[String]) -> bool {
        let failing = self.failing.lock().unwrap();
        ids.iter().any(|id| failing.contains(id))
    }

    fn links(
        &self,
        table: &Mutex<HashMap<String, BTreeSet<String>>>,
        id: &str,
    ) -> Result<BTreeSet<String>> {
        if self.failing_links.lock().unwrap().contains(id) {
            return Err(PubMedError::ApiError("/elink.fcgi".into(), "HTTP 503".into()));
        }
        Ok(table.lock().unwrap().get(id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl RecordSource for FakeSource {
    async fn fetch_record(&self, id: &str) -> Result<RawRecord> {
        self.log("fetch", id);
        if self.failing(&[id.to_string()]) {
            return Err(PubMedError::ApiError("/efetch.fcgi".into(), "HTTP 502".into()));
        }
        self.records
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| PubMedError::NotFound(id.to_string()))
    }

    async fn lookup_reference_ids(&self, id: &str) -> Result<BTreeSet<String>> {
        self.log("refs", id);
        self.links(&self.references, id)
    }

    async fn lookup_citation_ids(&self, id: &str) -> Result<BTreeSet<String>> {
        self.log("cites", id);
        self.links(&self.citations, id)
    }

    async fn fetch_record_batch(&self, ids: &[String]) -> Result<Vec<RawRecord>> {
        self.log("batch", &ids.join(","));
        if self.failing(ids) {
            return Err(PubMedError::ApiError("/efetch.fcgi".into(), "HTTP 502".into()));
        }
        let records = self.records.lock().unwrap();
        Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
    }
}

/// SQLite store whose node writes can be switched to fail with `SQLITE_BUSY`,
/// or rejected once per id with `SQLITE_CONSTRAINT`.
pub struct FlakyStore {
    inner: SqliteGraphStore,
    broken: AtomicBool,
    rejected: Mutex<HashSet<String>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteGraphStore::open_in_memory().unwrap(),
            broken: AtomicBool::new(false),
            rejected: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    /// The next node write for `id_value` fails with a constraint violation.
    pub fn reject_once(&self, id_value: &str) {
        self.rejected.lock().unwrap().insert(id_value.to_string());
    }

    fn check(&self, identity: &NodeIdentity) -> citegraph_core::Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(sqlite_failure(rusqlite::ffi::SQLITE_BUSY));
        }
        if self.rejected.lock().unwrap().remove(&identity.id_value) {
            return Err(sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT));
        }
        Ok(())
    }
}

fn sqlite_failure(code: std::os::raw::c_int) -> GraphError {
    let err = rusqlite::ffi::Error::new(code);
    GraphError::Database(rusqlite::Error::SqliteFailure(err, None))
}

impl GraphStore for FlakyStore {
    fn node_exists(&self, identity: &NodeIdentity) -> citegraph_core::Result<bool> {
        self.inner.node_exists(identity)
    }

    fn has_label(&self, identity: &NodeIdentity, label: &str) -> citegraph_core::Result<bool> {
        self.inner.has_label(identity, label)
    }

    fn merge_node(
        &self,
        identity: &NodeIdentity,
        properties: &Properties,
        mode: MergeMode,
    ) -> citegraph_core::Result<bool> {
        self.check(identity)?;
        self.inner.merge_node(identity, properties, mode)
    }

    fn add_label(&self, identity: &NodeIdentity, label: &str) -> citegraph_core::Result<bool> {
        self.inner.add_label(identity, label)
    }

    fn delete_node(&self, identity: &NodeIdentity) -> citegraph_core::Result<bool> {
        self.inner.delete_node(identity)
    }

    fn node_properties(&self, identity: &NodeIdentity) -> citegraph_core::Result<Option<Properties>> {
        self.inner.node_properties(identity)
    }

    fn labels(&self, identity: &NodeIdentity) -> citegraph_core::Result<Vec<String>> {
        self.inner.labels(identity)
    }

    fn query_by_predicate(&self, predicate: &NodePredicate) -> citegraph_core::Result<Vec<NodeIdentity>> {
        self.inner.query_by_predicate(predicate)
    }

    fn merge_relationship(
        &self,
        parent: &NodeIdentity,
        child: &NodeIdentity,
        rel_type: &str,
        properties: &Properties,
    ) -> citegraph_core::Result<bool> {
        self.inner.merge_relationship(parent, child, rel_type, properties)
    }

    fn relationships_from(
        &self,
        parent: &NodeIdentity,
        rel_type: Option<&str>,
    ) -> citegraph_core::Result<Vec<Relationship>> {
        self.inner.relationships_from(parent, rel_type)
    }

    fn relationships_to(
        &self,
        child: &NodeIdentity,
        rel_type: Option<&str>,
    ) -> citegraph_core::Result<Vec<Relationship>> {
        self.inner.relationships_to(child, rel_type)
    }

    fn stats(&self) -> citegraph_core::Result<GraphStats> {
        self.inner.stats()
    }
}

pub fn memory_gateway() -> Arc<GraphGateway> {
    Arc::new(GraphGateway::new(Arc::new(
        SqliteGraphStore::open_in_memory().unwrap(),
    )))
}

pub fn go_term() -> NodeIdentity {
    NodeIdentity::new("GoTerm", "go_id", "GO:0007619")
}

/// Register `pub_id` as a placeholder under a GO term parent.
pub fn seed(gateway: &GraphGateway, pub_id: &str, role: Role) {
    let parent = go_term();
    gateway.ensure_node(&parent).unwrap();
    let edge = PlaceholderEdge::new(
        parent,
        publication_identity(pub_id).with_role(role.label()),
        role.parent_relationship(),
        MARKER_PROPERTY,
    );
    gateway.create_placeholder(&edge).unwrap();
}

pub fn publication_count(gateway: &GraphGateway) -> usize {
    gateway
        .store()
        .query_by_predicate(&NodePredicate::HasLabel("Publication".to_string()))
        .unwrap()
        .len()
}
