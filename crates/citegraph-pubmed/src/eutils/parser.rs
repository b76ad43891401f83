use std::collections::BTreeSet;

use quick_xml::Reader;
use quick_xml::de::from_str;
use quick_xml::events::{BytesStart, Event};
use serde::Deserialize;

use crate::error::{PubMedError, Result};
use crate::eutils::types::{ArticleId, RawAuthor, RawRecord};

/// Elements whose children are inline markup (`<i>`, `<sup>`, ...) to be
/// flattened into the parent's text.
const MIXED_CONTENT: [&str; 2] = ["ArticleTitle", "AbstractText"];

// ─── efetch ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct AuthorParts {
    last_name: Option<String>,
    fore_name: Option<String>,
    initials: Option<String>,
    suffix: Option<String>,
    collective: Option<String>,
}

impl AuthorParts {
    fn set(&mut self, element: &str, value: String) {
        let value = non_empty(value);
        match element {
            "LastName" => self.last_name = value,
            "ForeName" => self.fore_name = value,
            "Initials" => self.initials = value,
            "Suffix" => self.suffix = value,
            "CollectiveName" => self.collective = value,
            _ => {}
        }
    }

    fn finish(self) -> Option<RawAuthor> {
        if let Some(name) = self.collective {
            return Some(RawAuthor::Collective(name));
        }
        Some(RawAuthor::Person {
            last_name: self.last_name?,
            fore_name: self.fore_name,
            initials: self.initials,
            suffix: self.suffix,
        })
    }
}

/// Decode a `PubmedArticleSet` document. Articles without a PMID are dropped.
pub fn parse_efetch_response(xml: &str) -> Result<Vec<RawRecord>> {
    let mut reader = Reader::from_str(xml);
    let mut path: Vec<String> = Vec::new();
    let mut text = String::new();

    let mut records = Vec::new();
    let mut record: Option<RawRecord> = None;
    let mut author: Option<AuthorParts> = None;
    let mut reference: Option<Vec<ArticleId>> = None;
    let mut id_type = String::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| PubMedError::Parse(format!("invalid efetch xml: {e}")))?;
        match event {
            Event::Start(e) => {
                let name = local_name(&e);
                match name.as_str() {
                    "PubmedArticle" => record = Some(RawRecord::default()),
                    "Author" => author = Some(AuthorParts::default()),
                    "Reference" => reference = Some(Vec::new()),
                    "ArticleId" => id_type = attribute(&e, "IdType")?.unwrap_or_default(),
                    _ => {}
                }
                if !in_mixed_content(&path) {
                    text.clear();
                }
                path.push(name);
            }
            Event::Text(t) => {
                let chunk = t
                    .unescape()
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                text.push_str(&chunk);
            }
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c)),
            Event::End(_) => {
                let name = path.pop().unwrap_or_default();
                if in_mixed_content(&path) {
                    continue;
                }
                let value = clean_text(&text);
                text.clear();

                let Some(rec) = record.as_mut() else { continue };
                let parent = path.last().map(String::as_str).unwrap_or_default();
                match name.as_str() {
                    "PubmedArticle" => {
                        let done = std::mem::take(rec);
                        record = None;
                        if !done.pmid.is_empty() {
                            records.push(done);
                        }
                    }
                    "PMID" if parent == "MedlineCitation" && rec.pmid.is_empty() => {
                        rec.pmid = value;
                    }
                    "ArticleTitle" => rec.title = value,
                    "Title" if parent == "Journal" => rec.journal_title = value,
                    "Volume" if parent == "JournalIssue" => rec.volume = non_empty(value),
                    "Issue" if parent == "JournalIssue" => rec.issue = non_empty(value),
                    "Year" if parent == "PubDate" => rec.year = non_empty(value),
                    "MedlineDate" if parent == "PubDate" && rec.year.is_none() => {
                        rec.year = value
                            .get(..4)
                            .filter(|y| y.bytes().all(|b| b.is_ascii_digit()))
                            .map(String::from);
                    }
                    // Whichever of the two comes first in the article.
                    "MedlinePgn" | "ELocationID"
                        if rec.pagination.is_none()
                            && matches!(
                                (name.as_str(), parent),
                                ("MedlinePgn", "Pagination") | ("ELocationID", "Article")
                            ) =>
                    {
                        rec.pagination = non_empty(value);
                    }
                    "AbstractText" if parent == "Abstract" && !value.is_empty() => {
                        rec.abstract_paragraphs.push(value);
                    }
                    "LastName" | "ForeName" | "Initials" | "Suffix" | "CollectiveName"
                        if parent == "Author" =>
                    {
                        if let Some(parts) = author.as_mut() {
                            parts.set(&name, value);
                        }
                    }
                    "Author" => {
                        if let Some(a) = author.take().and_then(AuthorParts::finish) {
                            rec.authors.push(a);
                        }
                    }
                    "ArticleId" => {
                        let id = ArticleId::new(std::mem::take(&mut id_type), value);
                        match reference.as_mut() {
                            Some(ids) => ids.push(id),
                            None if path.iter().any(|p| p == "PubmedData") => {
                                rec.article_ids.push(id);
                            }
                            None => {}
                        }
                    }
                    "Reference" => {
                        if let Some(ids) = reference.take().filter(|ids| !ids.is_empty()) {
                            rec.references.push(ids);
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(records)
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    let attr = e
        .try_get_attribute(name)
        .map_err(|err| PubMedError::Parse(format!("invalid attribute {name}: {err}")))?;
    attr.map(|a| {
        a.unescape_value()
            .map(|v| v.into_owned())
            .map_err(|err| PubMedError::Parse(format!("invalid attribute {name}: {err}")))
    })
    .transpose()
}

fn in_mixed_content(path: &[String]) -> bool {
    path.iter().any(|p| MIXED_CONTENT.contains(&p.as_str()))
}

// ─── elink ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ELinkResult {
    #[serde(rename = "LinkSet", default)]
    link_sets: Vec<LinkSet>,
    #[serde(rename = "ERROR")]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LinkSet {
    #[serde(rename = "LinkSetDb", default)]
    link_set_dbs: Vec<LinkSetDb>,
    #[serde(rename = "ERROR")]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LinkSetDb {
    #[serde(rename = "LinkName", default)]
    link_name: String,
    #[serde(rename = "Link", default)]
    links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    #[serde(rename = "Id")]
    id: String,
}

/// Ids linked under `link_name` (e.g. `pubmed_pubmed_refs`).
pub fn parse_elink_response(xml: &str, link_name: &str) -> Result<BTreeSet<String>> {
    let result: ELinkResult =
        from_str(xml).map_err(|e| PubMedError::Parse(format!("invalid elink xml: {e}")))?;

    let error = result
        .error
        .as_deref()
        .or_else(|| result.link_sets.iter().find_map(|s| s.error.as_deref()));
    if let Some(message) = error {
        return Err(PubMedError::ApiError("elink".to_string(), message.trim().to_string()));
    }

    Ok(result
        .link_sets
        .into_iter()
        .flat_map(|set| set.link_set_dbs)
        .filter(|db| db.link_name == link_name)
        .flat_map(|db| db.links)
        .map(|link| link.id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect())
}

fn clean_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}
