use std::collections::BTreeMap;

use crate::entities::article::normalize_doi;
use crate::entities::{
    ArticleLink, Author, LinkKind, Provenance, PubDate, PublicationType, UnifiedArticle,
};
use crate::sources::SourceId;
use crate::sources::openalex::OpenAlexWork;

/// OpenAlex reports PMIDs as full `https://pubmed.ncbi.nlm.nih.gov/<n>`
/// URLs; keep the digits.
pub(crate) fn strip_pmid_url(value: &str) -> Option<String> {
    let digits: String = value
        .rsplit('/')
        .find(|seg| !seg.is_empty())
        .unwrap_or(value)
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() { None } else { Some(digits) }
}

pub fn from_work(work: &OpenAlexWork) -> Option<UnifiedArticle> {
    let openalex_id = work
        .id
        .as_deref()
        .map(|id| id.rsplit('/').next().unwrap_or(id).to_string())?;
    let doi = work.doi.as_deref().and_then(normalize_doi);
    let pmid = work
        .ids
        .as_ref()
        .and_then(|ids| ids.pmid.as_deref())
        .and_then(strip_pmid_url);
    let pmcid = work.ids.as_ref().and_then(|ids| ids.pmcid.as_deref()).map(|p| {
        let tail = p.rsplit('/').next().unwrap_or(p);
        tail.to_string()
    });

    let mut other_ids = BTreeMap::new();
    other_ids.insert(SourceId::Openalex.as_str().to_string(), openalex_id.clone());

    let is_oa = work
        .open_access
        .as_ref()
        .and_then(|oa| oa.is_oa)
        .unwrap_or(false);
    let mut links = Vec::new();
    if let Some(oa_url) = work.open_access.as_ref().and_then(|oa| oa.oa_url.clone()) {
        let kind = if oa_url.ends_with(".pdf") {
            LinkKind::Pdf
        } else {
            LinkKind::HtmlLanding
        };
        links.push(ArticleLink {
            kind,
            url: oa_url,
            source: SourceId::Openalex,
            open_access: true,
        });
    }
    if let Some(loc) = &work.primary_location {
        if let Some(url) = loc.landing_page_url.clone() {
            links.push(ArticleLink {
                kind: LinkKind::HtmlLanding,
                url,
                source: SourceId::Openalex,
                open_access: is_oa,
            });
        }
        if let Some(url) = loc.pdf_url.clone() {
            links.push(ArticleLink {
                kind: LinkKind::Pdf,
                url,
                source: SourceId::Openalex,
                open_access: is_oa,
            });
        }
    }

    let pub_date = work
        .publication_date
        .as_deref()
        .map(PubDate::parse)
        .filter(|d| d.is_known())
        .or_else(|| work.publication_year.map(PubDate::year))
        .unwrap_or_default();

    let authors = work
        .authorships
        .iter()
        .filter_map(|a| {
            let name = a.author.as_ref()?.display_name.clone()?;
            Some(Author {
                name,
                affiliation: a
                    .institutions
                    .first()
                    .and_then(|i| i.display_name.clone()),
            })
        })
        .collect();

    Some(UnifiedArticle {
        pmid,
        pmcid,
        doi,
        other_ids,
        title: work.display_name.clone().unwrap_or_default(),
        abstract_text: None,
        authors,
        journal: work
            .primary_location
            .as_ref()
            .and_then(|l| l.source.as_ref())
            .and_then(|s| s.display_name.clone()),
        pub_date,
        publication_types: work
            .work_type
            .as_deref()
            .map(|t| vec![PublicationType::from_label(t)])
            .unwrap_or_default(),
        language: work.language.clone(),
        mesh_terms: Vec::new(),
        links,
        citation_count: work.cited_by_count,
        influential_citations: None,
        impact: None,
        provenance: vec![match work.relevance_score {
            Some(score) => Provenance::scored(SourceId::Openalex, openalex_id, score),
            None => Provenance::now(SourceId::Openalex, openalex_id),
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_work_extracts_short_ids() {
        let work = OpenAlexWork {
            id: Some("https://openalex.org/W2741809807".into()),
            doi: Some("https://doi.org/10.1186/X".into()),
            display_name: Some("Title".into()),
            publication_year: Some(2023),
            ..Default::default()
        };
        let article = from_work(&work).unwrap();
        assert_eq!(
            article.other_ids.get("openalex").map(String::as_str),
            Some("W2741809807")
        );
        assert_eq!(article.doi.as_deref(), Some("10.1186/x"));
        assert_eq!(article.pub_date, PubDate::year(2023));
    }

    #[test]
    fn from_work_without_id_is_dropped() {
        assert!(from_work(&OpenAlexWork::default()).is_none());
    }

    #[test]
    fn strip_pmid_url_handles_bare_and_url_forms() {
        assert_eq!(
            strip_pmid_url("https://pubmed.ncbi.nlm.nih.gov/22663011"),
            Some("22663011".into())
        );
        assert_eq!(strip_pmid_url("22663011"), Some("22663011".into()));
    }
}
