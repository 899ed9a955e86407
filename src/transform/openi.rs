use std::collections::BTreeMap;

use crate::entities::{
    ArticleLink, Author, LinkKind, Provenance, PubDate, UnifiedArticle,
};
use crate::sources::SourceId;
use crate::sources::openi::OpenIRecord;

pub fn from_record(record: &OpenIRecord, base: &str) -> Option<UnifiedArticle> {
    let local_id = record
        .uid
        .clone()
        .or_else(|| record.pmid.clone())
        .or_else(|| record.pmcid.clone())?;

    let mut other_ids = BTreeMap::new();
    if record.pmid.is_none() && record.pmcid.is_none() {
        other_ids.insert(SourceId::Openi.as_str().to_string(), local_id.clone());
    }

    let mut links = Vec::new();
    if let Some(img) = &record.img_large {
        let url = if img.starts_with("http") {
            img.clone()
        } else {
            format!("{}/{}", base.trim_end_matches('/'), img.trim_start_matches('/'))
        };
        links.push(ArticleLink {
            kind: LinkKind::RawText,
            url,
            source: SourceId::Openi,
            open_access: true,
        });
    }
    if let Some(detail) = &record.detail_url {
        links.push(ArticleLink {
            kind: LinkKind::HtmlLanding,
            url: detail.clone(),
            source: SourceId::Openi,
            open_access: true,
        });
    }

    let year = record
        .journal_date
        .as_ref()
        .and_then(|d| d.year.as_ref())
        .and_then(|y| match y {
            serde_json::Value::Number(n) => n.as_i64().map(|v| v as i32),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        });

    Some(UnifiedArticle {
        pmid: record.pmid.clone(),
        pmcid: record.pmcid.clone(),
        doi: None,
        other_ids,
        title: record.title.clone().unwrap_or_default(),
        abstract_text: None,
        authors: record
            .authors
            .as_deref()
            .map(|a| {
                a.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(Author::new)
                    .collect()
            })
            .unwrap_or_default(),
        journal: record.journal_title.clone(),
        pub_date: year.map(PubDate::year).unwrap_or_default(),
        publication_types: Vec::new(),
        language: None,
        mesh_terms: Vec::new(),
        links,
        citation_count: None,
        influential_citations: None,
        impact: None,
        provenance: vec![Provenance::now(SourceId::Openi, local_id)],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_image_paths_join_the_base() {
        let record = OpenIRecord {
            uid: Some("PMC123_fig1".into()),
            pmid: Some("22663011".into()),
            img_large: Some("/img/large/PMC123_fig1.png".into()),
            ..Default::default()
        };
        let article = from_record(&record, "https://openi.nlm.nih.gov").unwrap();
        assert_eq!(
            article.links[0].url,
            "https://openi.nlm.nih.gov/img/large/PMC123_fig1.png"
        );
        assert!(article.links[0].open_access);
    }

    #[test]
    fn record_without_any_id_is_dropped() {
        assert!(from_record(&OpenIRecord::default(), "https://x").is_none());
    }
}
