use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;
use crate::eutils::types::RawRecord;

/// Remote bibliographic record retrieval.
///
/// Record fetches return errors as values. Link lookups come in two forms:
/// `lookup_*` reports failures, while `fetch_*` treats links as best-effort
/// enrichment and yields an empty set on failure.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_record(&self, id: &str) -> Result<RawRecord>;

    /// One request for many ids. Ids unknown upstream are simply absent
    /// from the result.
    async fn fetch_record_batch(&self, ids: &[String]) -> Result<Vec<RawRecord>>;

    async fn lookup_reference_ids(&self, id: &str) -> Result<BTreeSet<String>>;

    async fn lookup_citation_ids(&self, id: &str) -> Result<BTreeSet<String>>;

    async fn fetch_reference_ids(&self, id: &str) -> BTreeSet<String> {
        fail_soft(id, "references", self.lookup_reference_ids(id).await)
    }

    async fn fetch_citation_ids(&self, id: &str) -> BTreeSet<String> {
        fail_soft(id, "citations", self.lookup_citation_ids(id).await)
    }
}

fn fail_soft(id: &str, kind: &str, result: Result<BTreeSet<String>>) -> BTreeSet<String> {
    match result {
        Ok(ids) => {
            debug!(pub_id = id, kind, count = ids.len(), "linked ids fetched");
            ids
        }
        Err(e) => {
            warn!(pub_id = id, kind, "link lookup failed: {e}");
            BTreeSet::new()
        }
    }
}
