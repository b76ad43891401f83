use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use citegraph_core::EutilsConfig;
use reqwest::Url;

use crate::error::{PubMedError, Result};
use crate::eutils::parser::{parse_efetch_response, parse_elink_response};
use crate::eutils::types::RawRecord;
use crate::http::{Clock, RateLimitedClient, RateLimiter, SystemClock};
use crate::source::RecordSource;

const REFERENCES_LINK: &str = "pubmed_pubmed_refs";
const CITED_IN_LINK: &str = "pubmed_pubmed_citedin";

/// NCBI E-utilities client (efetch + elink) behind a shared rate limiter.
pub struct EutilsClient {
    http: RateLimitedClient,
    base_url: String,
    tool: String,
    email: Option<String>,
    api_key: Option<String>,
}

impl EutilsClient {
    pub fn new(config: &EutilsConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &EutilsConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(
            Duration::from_millis(config.min_interval_ms),
            clock,
        ));
        Self::with_limiter(config, limiter)
    }

    /// Build a client sharing an existing rate-limit clock.
    pub fn with_limiter(config: &EutilsConfig, limiter: Arc<RateLimiter>) -> Result<Self> {
        let user_agent = format!("{}/{}", config.tool, env!("CARGO_PKG_VERSION"));
        Ok(Self {
            http: RateLimitedClient::new(limiter, config.max_retries, &user_agent)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tool: config.tool.clone(),
            email: config.email.clone(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        self.http.limiter()
    }

    fn endpoint(&self, utility: &str, params: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/{utility}", self.base_url))
            .map_err(|e| PubMedError::Parse(format!("invalid E-utilities base URL: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in params {
                query.append_pair(key, value);
            }
            if !self.tool.is_empty() {
                query.append_pair("tool", &self.tool);
            }
            if let Some(email) = &self.email {
                query.append_pair("email", email);
            }
            if let Some(key) = &self.api_key {
                query.append_pair("api_key", key);
            }
        }
        Ok(url)
    }

    async fn efetch(&self, ids: &[String]) -> Result<Vec<RawRecord>> {
        let joined = ids.join(",");
        let url = self.endpoint(
            "efetch.fcgi",
            &[("db", "pubmed"), ("retmode", "xml"), ("id", &joined)],
        )?;
        let xml = self.http.get(url).await?;
        parse_efetch_response(&xml)
    }

    async fn elink(&self, id: &str, link_name: &str) -> Result<BTreeSet<String>> {
        let url = self.endpoint(
            "elink.fcgi",
            &[("dbfrom", "pubmed"), ("linkname", link_name), ("id", id)],
        )?;
        let xml = self.http.get(url).await?;
        parse_elink_response(&xml, link_name)
    }
}

#[async_trait]
impl RecordSource for EutilsClient {
    async fn fetch_record(&self, id: &str) -> Result<RawRecord> {
        let records = self.efetch(&[id.to_string()]).await?;
        records
            .into_iter()
            .find(|r| r.pmid == id)
            .ok_or_else(|| PubMedError::NotFound(id.to_string()))
    }

    async fn fetch_record_batch(&self, ids: &[String]) -> Result<Vec<RawRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.efetch(ids).await
    }

    async fn lookup_reference_ids(&self, id: &str) -> Result<BTreeSet<String>> {
        self.elink(id, REFERENCES_LINK).await
    }

    async fn lookup_citation_ids(&self, id: &str) -> Result<BTreeSet<String>> {
        self.elink(id, CITED_IN_LINK).await
    }
}
