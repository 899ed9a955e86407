use std::collections::BTreeMap;

use crate::entities::article::normalize_doi;
use crate::entities::{
    ArticleLink, Author, LinkKind, Provenance, PubDate, PublicationType, UnifiedArticle,
};
use crate::sources::SourceId;
use crate::sources::crossref::CrossrefWork;

/// Crossref abstracts arrive as JATS fragments; strip the tags.
fn strip_jats(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for ch in text.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn from_work(work: &CrossrefWork) -> Option<UnifiedArticle> {
    let doi = work.doi.as_deref().and_then(normalize_doi)?;

    let pub_date = work
        .issued
        .as_ref()
        .and_then(|d| d.date_parts.first())
        .map(|parts| PubDate {
            year: parts.first().copied(),
            month: parts.get(1).and_then(|m| u8::try_from(*m).ok()),
            day: parts.get(2).and_then(|d| u8::try_from(*d).ok()),
        })
        .unwrap_or_default();

    let authors = work
        .author
        .iter()
        .filter_map(|a| {
            let name = match (&a.given, &a.family) {
                (Some(given), Some(family)) => format!("{given} {family}"),
                (None, Some(family)) => family.clone(),
                (Some(given), None) => given.clone(),
                (None, None) => return None,
            };
            Some(Author {
                name,
                affiliation: a.affiliation.first().and_then(|aff| aff.name.clone()),
            })
        })
        .collect();

    let mut links = Vec::new();
    if let Some(url) = &work.url {
        links.push(ArticleLink {
            kind: LinkKind::HtmlLanding,
            url: url.clone(),
            source: SourceId::Crossref,
            open_access: false,
        });
    }
    for link in &work.link {
        let Some(url) = link.url.clone() else { continue };
        let kind = match link.content_type.as_deref() {
            Some("application/pdf") => LinkKind::Pdf,
            Some("application/xml") | Some("text/xml") => LinkKind::Xml,
            Some("text/plain") => LinkKind::RawText,
            _ => LinkKind::HtmlLanding,
        };
        links.push(ArticleLink {
            kind,
            url,
            source: SourceId::Crossref,
            open_access: false,
        });
    }

    Some(UnifiedArticle {
        pmid: None,
        pmcid: None,
        doi: Some(doi.clone()),
        other_ids: BTreeMap::new(),
        title: work.title.first().cloned().unwrap_or_default(),
        abstract_text: work
            .abstract_text
            .as_deref()
            .map(strip_jats)
            .filter(|t| !t.is_empty()),
        authors,
        journal: work.container_title.first().cloned(),
        pub_date,
        publication_types: work
            .work_type
            .as_deref()
            .map(|t| vec![PublicationType::from_label(t)])
            .unwrap_or_default(),
        language: work.language.clone(),
        mesh_terms: Vec::new(),
        links,
        citation_count: work.is_referenced_by_count,
        influential_citations: None,
        impact: None,
        provenance: vec![match work.score {
            Some(score) => Provenance::scored(SourceId::Crossref, doi, score),
            None => Provenance::now(SourceId::Crossref, doi),
        }],
    })
}
