use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// One `PubmedArticle` as decoded from an efetch response, before any
/// normalization. Text fields are whitespace-collapsed with inline markup
/// flattened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub pmid: String,
    pub title: String,
    pub journal_title: String,
    pub volume: Option<String>,
    pub issue: Option<String>,
    pub year: Option<String>,
    /// `MedlinePgn`, else the first `ELocationID`.
    pub pagination: Option<String>,
    pub abstract_paragraphs: Vec<String>,
    pub authors: Vec<RawAuthor>,
    pub article_ids: Vec<ArticleId>,
    /// Article ids of each `Reference` in the record's reference list.
    pub references: Vec<Vec<ArticleId>>,
    /// Filled from elink, not efetch.
    #[serde(default)]
    pub citation_ids: BTreeSet<String>,
}

impl RawRecord {
    pub fn article_id(&self, id_type: &str) -> Option<&str> {
        self.article_ids
            .iter()
            .find(|a| a.id_type.eq_ignore_ascii_case(id_type))
            .map(|a| a.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawAuthor {
    Person {
        last_name: String,
        fore_name: Option<String>,
        initials: Option<String>,
        suffix: Option<String>,
    },
    Collective(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleId {
    pub id_type: String,
    pub value: String,
}

impl ArticleId {
    pub fn new(id_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id_type: id_type.into(),
            value: value.into(),
        }
    }

    pub fn is_numeric(&self) -> bool {
        !self.value.is_empty() && self.value.bytes().all(|b| b.is_ascii_digit())
    }
}
