use std::collections::BTreeMap;

use crate::entities::{
    ArticleLink, Author, LinkKind, Provenance, PubDate, PublicationType, UnifiedArticle,
};
use crate::sources::SourceId;
use crate::sources::pubmed::PubmedRecord;

pub fn from_record(record: &PubmedRecord) -> UnifiedArticle {
    let authors = record
        .authors
        .iter()
        .map(|a| {
            let name = match a.fore_name.as_deref() {
                Some(fore) => format!("{fore} {}", a.last_name),
                None => a.last_name.clone(),
            };
            Author {
                name,
                affiliation: a.affiliation.clone(),
            }
        })
        .collect();

    let mut links = vec![ArticleLink {
        kind: LinkKind::HtmlLanding,
        url: format!("https://pubmed.ncbi.nlm.nih.gov/{}/", record.pmid),
        source: SourceId::Pubmed,
        open_access: false,
    }];
    if let Some(pmcid) = &record.pmcid {
        links.push(ArticleLink {
            kind: LinkKind::HtmlLanding,
            url: format!("https://www.ncbi.nlm.nih.gov/pmc/articles/{pmcid}/"),
            source: SourceId::Pubmed,
            open_access: true,
        });
    }

    UnifiedArticle {
        pmid: Some(record.pmid.clone()),
        pmcid: record.pmcid.clone(),
        doi: record.doi.clone(),
        other_ids: BTreeMap::new(),
        title: record.title.clone(),
        abstract_text: record.abstract_text.clone(),
        authors,
        journal: record.journal.clone(),
        pub_date: PubDate::from_parts(record.year, record.month.as_deref(), record.day.as_deref()),
        publication_types: record
            .publication_types
            .iter()
            .map(|p| PublicationType::from_label(p))
            .collect(),
        language: record.language.clone(),
        mesh_terms: record.mesh_terms.clone(),
        links,
        citation_count: None,
        influential_citations: None,
        impact: None,
        provenance: vec![Provenance::now(SourceId::Pubmed, record.pmid.clone())],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::pubmed::PubmedAuthor;

    #[test]
    fn from_record_maps_identifiers_and_links() {
        let record = PubmedRecord {
            pmid: "22663011".into(),
            pmcid: Some("PMC9984800".into()),
            doi: Some("10.1186/s13054-024-0001".into()),
            title: "Remimazolam for ICU sedation".into(),
            abstract_text: Some("Background.".into()),
            authors: vec![PubmedAuthor {
                last_name: "Doe".into(),
                fore_name: Some("Jane Q".into()),
                affiliation: None,
            }],
            journal: Some("Critical Care".into()),
            year: Some(2024),
            month: Some("May".into()),
            day: Some("17".into()),
            publication_types: vec!["Randomized Controlled Trial".into()],
            language: Some("eng".into()),
            mesh_terms: vec!["Intensive Care Units".into()],
        };

        let article = from_record(&record);
        assert_eq!(article.pmid.as_deref(), Some("22663011"));
        assert_eq!(article.primary_id(), "pmid:22663011");
        assert_eq!(article.authors[0].name, "Jane Q Doe");
        assert_eq!(article.pub_date, PubDate::parse("2024-05-17"));
        assert_eq!(article.publication_types, vec![PublicationType::ClinicalTrial]);
        assert_eq!(article.provenance.len(), 1);
        assert_eq!(article.provenance[0].source, SourceId::Pubmed);
        // The PMC mirror link is the open-access one.
        assert!(article.links.iter().any(|l| l.open_access));
    }

    #[test]
    fn from_record_tolerates_sparse_records() {
        let record = PubmedRecord {
            pmid: "1".into(),
            ..Default::default()
        };
        let article = from_record(&record);
        assert!(article.has_identifier());
        assert_eq!(article.title, "");
        assert!(article.authors.is_empty());
        assert!(!article.pub_date.is_known());
        assert_eq!(article.provenance.len(), 1);
    }
}
