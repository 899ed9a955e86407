use std::collections::BTreeMap;

use crate::entities::article::normalize_doi;
use crate::entities::{
    ArticleLink, Author, LinkKind, Provenance, PubDate, UnifiedArticle,
};
use crate::sources::SourceId;
use crate::sources::core::CoreWork;

pub fn from_work(work: &CoreWork) -> Option<UnifiedArticle> {
    let local_id = match &work.id {
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        _ => return None,
    };
    let doi = work.doi.as_deref().and_then(normalize_doi);

    let mut other_ids = BTreeMap::new();
    other_ids.insert(SourceId::Core.as_str().to_string(), local_id.clone());

    let mut links = Vec::new();
    if let Some(url) = &work.download_url {
        links.push(ArticleLink {
            kind: LinkKind::Pdf,
            url: url.clone(),
            source: SourceId::Core,
            open_access: true,
        });
    }
    for url in &work.source_fulltext_urls {
        links.push(ArticleLink {
            kind: LinkKind::HtmlLanding,
            url: url.clone(),
            source: SourceId::Core,
            open_access: true,
        });
    }

    Some(UnifiedArticle {
        pmid: None,
        pmcid: None,
        doi,
        other_ids,
        title: work.title.clone().unwrap_or_default(),
        abstract_text: work.abstract_text.clone(),
        authors: work
            .authors
            .iter()
            .filter_map(|a| a.name.clone())
            .map(|name| Author::new(name.replace(", ", " ")))
            .collect(),
        journal: work.publisher.clone(),
        pub_date: work
            .published_date
            .as_deref()
            .map(PubDate::parse)
            .filter(|d| d.is_known())
            .or_else(|| work.year_published.map(PubDate::year))
            .unwrap_or_default(),
        publication_types: Vec::new(),
        language: work.language.as_ref().and_then(|l| l.code.clone()),
        mesh_terms: Vec::new(),
        links,
        citation_count: None,
        influential_citations: None,
        impact: None,
        provenance: vec![Provenance::now(SourceId::Core, local_id)],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_work_keeps_core_id_and_oa_links() {
        let work = CoreWork {
            id: Some(serde_json::json!(123)),
            doi: Some("10.1/X".into()),
            title: Some("T".into()),
            year_published: Some(2021),
            download_url: Some("https://core.ac.uk/download/123.pdf".into()),
            ..Default::default()
        };
        let article = from_work(&work).unwrap();
        assert_eq!(article.other_ids.get("core").map(String::as_str), Some("123"));
        assert_eq!(article.doi.as_deref(), Some("10.1/x"));
        assert!(article.has_open_access_link());
    }

    #[test]
    fn from_work_without_id_is_dropped() {
        assert!(from_work(&CoreWork::default()).is_none());
    }
}
