//! Normalization of decoded PubMed articles into [`BibliographicEntry`].

use std::collections::BTreeSet;

use citegraph_core::{BibliographicEntry, Role};

use crate::eutils::types::{RawAuthor, RawRecord};

/// Pure mapping from a decoded article to the entry persisted on its node.
pub fn parse(raw: &RawRecord, role: Role, parent_id: Option<&str>) -> BibliographicEntry {
    let reference_ids: BTreeSet<String> = raw
        .references
        .iter()
        .flatten()
        .filter(|id| id.is_numeric())
        .map(|id| id.value.clone())
        .collect();

    BibliographicEntry {
        role,
        id: raw.pmid.clone(),
        parent_id: parent_id.map(str::to_string),
        pmc_id: raw.article_id("pmc").unwrap_or_default().to_string(),
        doi: raw.article_id("doi").unwrap_or_default().to_string(),
        journal_name: raw.journal_title.clone(),
        journal_issue: journal_issue(raw),
        title: sanitize(&raw.title),
        abstract_text: raw
            .abstract_paragraphs
            .first()
            .map(|p| sanitize(p))
            .unwrap_or_default(),
        author_caption: author_caption(&raw.authors),
        reference_ids,
        citation_ids: raw.citation_ids.clone(),
        citation_count: u32::try_from(raw.citation_ids.len()).unwrap_or(u32::MAX),
    }
}

/// `""`, `"A"`, `"A; B"` or `"A; B; et al"`.
pub fn author_caption(authors: &[RawAuthor]) -> String {
    match authors {
        [] => String::new(),
        [only] => author_name(only),
        [first, second] => format!("{}; {}", author_name(first), author_name(second)),
        [first, second, ..] => {
            format!("{}; {}; et al", author_name(first), author_name(second))
        }
    }
}

pub fn author_name(author: &RawAuthor) -> String {
    match author {
        RawAuthor::Collective(name) => name.clone(),
        RawAuthor::Person {
            last_name,
            fore_name,
            initials,
            suffix,
        } => match fore_name.as_ref().or(initials.as_ref()).or(suffix.as_ref()) {
            Some(given) => format!("{last_name}, {given}"),
            None => last_name.clone(),
        },
    }
}

/// `"<year> <volume>(<issue>):<pagination>"`. Empty without a volume; issue
/// and pagination are only printed when issue is present.
pub fn journal_issue(raw: &RawRecord) -> String {
    let Some(volume) = raw.volume.as_deref() else {
        return String::new();
    };
    let mut caption = format!("{} {volume}", raw.year.as_deref().unwrap_or_default());
    if let Some(issue) = raw.issue.as_deref() {
        caption.push_str(&format!("({issue})"));
        if let Some(pages) = raw.pagination.as_deref() {
            caption.push(':');
            caption.push_str(pages);
        }
    }
    caption.trim_start().to_string()
}

/// Double quotes become single quotes in free text.
pub fn sanitize(text: &str) -> String {
    text.replace('"', "'")
}
