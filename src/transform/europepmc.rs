use std::collections::BTreeMap;

use crate::entities::article::normalize_doi;
use crate::entities::{
    ArticleLink, Author, LinkKind, Provenance, PubDate, PublicationType, UnifiedArticle,
};
use crate::sources::SourceId;
use crate::sources::europepmc::EuropePmcResult;

/// Europe PMC author strings look like `"Doe J, Smith A."`.
fn split_authors(author_string: &str) -> Vec<Author> {
    author_string
        .trim_end_matches('.')
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(Author::new)
        .collect()
}

pub fn from_result(result: &EuropePmcResult) -> Option<UnifiedArticle> {
    let local_id = result.id.clone().or_else(|| result.pmid.clone())?;
    let doi = result.doi.as_deref().and_then(normalize_doi);

    let mut other_ids = BTreeMap::new();
    if result.pmid.is_none() && result.pmcid.is_none() && doi.is_none() {
        other_ids.insert(SourceId::Europepmc.as_str().to_string(), local_id.clone());
    }

    let open_access = result.is_open_access.as_deref() == Some("Y");
    let mut links = Vec::new();
    if let Some(source) = &result.source {
        links.push(ArticleLink {
            kind: LinkKind::HtmlLanding,
            url: format!("https://europepmc.org/article/{source}/{local_id}"),
            source: SourceId::Europepmc,
            open_access,
        });
    }
    for ft in result
        .full_text_url_list
        .as_ref()
        .map(|l| l.full_text_url.as_slice())
        .unwrap_or_default()
    {
        let Some(url) = ft.url.clone() else { continue };
        let kind = match ft.document_style.as_deref() {
            Some("pdf") => LinkKind::Pdf,
            Some("html") => LinkKind::HtmlLanding,
            _ => LinkKind::Xml,
        };
        links.push(ArticleLink {
            kind,
            url,
            source: SourceId::Europepmc,
            open_access: ft.availability_code.as_deref() == Some("OA") || open_access,
        });
    }

    let pub_date = result
        .first_publication_date
        .as_deref()
        .map(PubDate::parse)
        .filter(|d| d.is_known())
        .or_else(|| {
            result
                .pub_year
                .as_deref()
                .and_then(|y| y.parse::<i32>().ok())
                .map(PubDate::year)
        })
        .unwrap_or_default();

    let publication_types = result
        .pub_type
        .as_deref()
        .map(|t| {
            t.split(';')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(PublicationType::from_label)
                .collect()
        })
        .unwrap_or_default();

    Some(UnifiedArticle {
        pmid: result.pmid.clone(),
        pmcid: result.pmcid.clone(),
        doi,
        other_ids,
        title: result.title.clone().unwrap_or_default(),
        abstract_text: result.abstract_text.clone(),
        authors: result
            .author_string
            .as_deref()
            .map(split_authors)
            .unwrap_or_default(),
        journal: result.journal_title.clone(),
        pub_date,
        publication_types,
        language: result.language.clone(),
        mesh_terms: Vec::new(),
        links,
        citation_count: result.cited_by_count,
        influential_citations: None,
        impact: None,
        provenance: vec![Provenance::now(SourceId::Europepmc, local_id)],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_result_maps_fields() {
        let result = EuropePmcResult {
            id: Some("22663011".into()),
            source: Some("MED".into()),
            pmid: Some("22663011".into()),
            doi: Some("10.1186/X".into()),
            title: Some("Remimazolam trial".into()),
            author_string: Some("Doe J, Smith A.".into()),
            journal_title: Some("Critical Care".into()),
            pub_year: Some("2024".into()),
            first_publication_date: Some("2024-05-17".into()),
            pub_type: Some("research-article; review".into()),
            cited_by_count: Some(12),
            is_open_access: Some("Y".into()),
            ..Default::default()
        };

        let article = from_result(&result).unwrap();
        assert_eq!(article.pmid.as_deref(), Some("22663011"));
        assert_eq!(article.doi.as_deref(), Some("10.1186/x"));
        assert_eq!(article.authors.len(), 2);
        assert_eq!(article.pub_date, PubDate::parse("2024-05-17"));
        assert_eq!(article.citation_count, Some(12));
        assert!(article.has_open_access_link());
        assert!(article.other_ids.is_empty());
        assert_eq!(article.provenance.len(), 1);
    }

    #[test]
    fn from_result_without_ids_is_dropped() {
        assert!(from_result(&EuropePmcResult::default()).is_none());
    }

    #[test]
    fn from_result_keeps_source_local_id_when_nothing_else() {
        let result = EuropePmcResult {
            id: Some("PPR123456".into()),
            source: Some("PPR".into()),
            title: Some("A preprint".into()),
            ..Default::default()
        };
        let article = from_result(&result).unwrap();
        assert!(article.pmid.is_none());
        assert_eq!(
            article.other_ids.get("europepmc").map(String::as_str),
            Some("PPR123456")
        );
        assert!(article.has_identifier());
    }
}
