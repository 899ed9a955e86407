use std::collections::BTreeMap;

use crate::entities::article::normalize_doi;
use crate::entities::{
    ArticleId, ArticleLink, Author, LinkKind, Provenance, PubDate, PublicationType,
    UnifiedArticle,
};
use crate::sources::SourceId;
use crate::sources::semanticscholar::S2Paper;

/// Best identifier for a linked paper, in the usual priority order.
pub fn paper_id(paper: &S2Paper) -> Option<ArticleId> {
    let ids = paper.external_ids.as_ref();
    if let Some(pmid) = ids.and_then(|i| i.pub_med.clone()) {
        return Some(ArticleId::Pmid(pmid));
    }
    if let Some(pmcid) = ids.and_then(|i| i.pub_med_central.clone()) {
        // S2 reports the PMC id without its prefix.
        let pmcid = if pmcid.starts_with("PMC") {
            pmcid
        } else {
            format!("PMC{pmcid}")
        };
        return Some(ArticleId::Pmcid(pmcid));
    }
    ids.and_then(|i| i.doi.as_deref())
        .and_then(normalize_doi)
        .map(ArticleId::Doi)
}

pub fn from_paper(paper: &S2Paper) -> Option<UnifiedArticle> {
    let local_id = paper.paper_id.clone()?;
    let ids = paper.external_ids.as_ref();
    let pmid = ids.and_then(|i| i.pub_med.clone());
    let pmcid = ids
        .and_then(|i| i.pub_med_central.clone())
        .map(|p| if p.starts_with("PMC") { p } else { format!("PMC{p}") });
    let doi = ids.and_then(|i| i.doi.as_deref()).and_then(normalize_doi);

    let mut other_ids = BTreeMap::new();
    other_ids.insert(
        SourceId::Semanticscholar.as_str().to_string(),
        local_id.clone(),
    );

    let mut links = Vec::new();
    if let Some(url) = paper.open_access_pdf.as_ref().and_then(|p| p.url.clone()) {
        links.push(ArticleLink {
            kind: LinkKind::Pdf,
            url,
            source: SourceId::Semanticscholar,
            open_access: true,
        });
    }
    links.push(ArticleLink {
        kind: LinkKind::HtmlLanding,
        url: format!("https://www.semanticscholar.org/paper/{local_id}"),
        source: SourceId::Semanticscholar,
        open_access: paper.is_open_access.unwrap_or(false),
    });

    // Normalized impact: share of citations marked influential.
    let impact = match (paper.influential_citation_count, paper.citation_count) {
        (Some(inf), Some(total)) if total > 0 => {
            Some((inf as f64 / total as f64).clamp(0.0, 1.0))
        }
        _ => None,
    };

    Some(UnifiedArticle {
        pmid,
        pmcid,
        doi,
        other_ids,
        title: paper.title.clone().unwrap_or_default(),
        abstract_text: paper.abstract_text.clone(),
        authors: paper
            .authors
            .iter()
            .filter_map(|a| a.name.clone())
            .map(Author::new)
            .collect(),
        journal: paper.venue.clone().filter(|v| !v.is_empty()),
        pub_date: paper
            .publication_date
            .as_deref()
            .map(PubDate::parse)
            .filter(|d| d.is_known())
            .or_else(|| paper.year.map(PubDate::year))
            .unwrap_or_default(),
        publication_types: paper
            .publication_types
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|t| PublicationType::from_label(t))
            .collect(),
        language: None,
        mesh_terms: Vec::new(),
        links,
        citation_count: paper.citation_count,
        influential_citations: paper.influential_citation_count,
        impact,
        provenance: vec![Provenance::now(SourceId::Semanticscholar, local_id)],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::semanticscholar::S2ExternalIds;

    #[test]
    fn impact_is_influential_share() {
        let paper = S2Paper {
            paper_id: Some("abc".into()),
            citation_count: Some(40),
            influential_citation_count: Some(10),
            ..Default::default()
        };
        let article = from_paper(&paper).unwrap();
        assert_eq!(article.impact, Some(0.25));
    }

    #[test]
    fn impact_absent_without_citations() {
        let paper = S2Paper {
            paper_id: Some("abc".into()),
            citation_count: Some(0),
            influential_citation_count: Some(0),
            ..Default::default()
        };
        assert_eq!(from_paper(&paper).unwrap().impact, None);
    }

    #[test]
    fn paper_id_prefers_pmid() {
        let paper = S2Paper {
            paper_id: Some("abc".into()),
            external_ids: Some(S2ExternalIds {
                doi: Some("10.1/x".into()),
                pub_med: Some("22663011".into()),
                pub_med_central: None,
            }),
            ..Default::default()
        };
        assert_eq!(paper_id(&paper), Some(ArticleId::Pmid("22663011".into())));
    }
}
