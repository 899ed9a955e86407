//! Result rendering for the tool surface: Markdown tables for humans,
//! structured JSON for machines, and the cache-backed export formats
//! (RIS, BibTeX) plus OA-availability and timeline summaries.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::entities::{LinkKind, UnifiedArticle};
use crate::pipeline::PipelineResult;

#[derive(Debug, Clone, Serialize)]
pub struct OaSummary {
    pub total: usize,
    pub open_access: usize,
    pub with_any_link: usize,
    pub by_link_kind: BTreeMap<String, usize>,
}

pub fn oa_summary(articles: &[UnifiedArticle]) -> OaSummary {
    let mut by_link_kind: BTreeMap<String, usize> = BTreeMap::new();
    for article in articles {
        for link in &article.links {
            let kind = match link.kind {
                LinkKind::HtmlLanding => "html-landing",
                LinkKind::Pdf => "pdf",
                LinkKind::Xml => "xml",
                LinkKind::RawText => "raw-text",
            };
            *by_link_kind.entry(kind.to_string()).or_insert(0) += 1;
        }
    }
    OaSummary {
        total: articles.len(),
        open_access: articles.iter().filter(|a| a.has_open_access_link()).count(),
        with_any_link: articles.iter().filter(|a| !a.links.is_empty()).count(),
        by_link_kind,
    }
}

/// Publication-year histogram; unknown years are left out.
pub fn timeline(articles: &[UnifiedArticle]) -> BTreeMap<i32, usize> {
    let mut years = BTreeMap::new();
    for article in articles {
        if let Some(year) = article.pub_date.year {
            *years.entry(year).or_insert(0) += 1;
        }
    }
    years
}

pub fn structured_result(session_id: &str, result: &PipelineResult) -> serde_json::Value {
    let articles: Vec<UnifiedArticle> =
        result.articles.iter().map(|s| s.article.clone()).collect();
    serde_json::json!({
        "session": session_id,
        "status": result.status.as_str(),
        "article_count": result.articles.len(),
        "articles": result.articles,
        "oa_summary": oa_summary(&articles),
        "timeline": timeline(&articles),
        "errors": result.per_step_errors,
    })
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}

pub fn table(session_id: &str, result: &PipelineResult) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "# Search results ({}, {} articles)\n\n",
        result.status.as_str(),
        result.articles.len()
    ));
    if result.articles.is_empty() {
        out.push_str("No results.\n");
    } else {
        out.push_str("| # | Title | Year | Citations | Sources | OA | Id |\n");
        out.push_str("|---|-------|------|-----------|---------|----|----|\n");
        for (i, scored) in result.articles.iter().enumerate() {
            let a = &scored.article;
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} | {} |\n",
                i + 1,
                truncate(&a.title, 70),
                a.pub_date
                    .year
                    .map(|y| y.to_string())
                    .unwrap_or_else(|| "-".into()),
                a.citation_count
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".into()),
                a.provenance.len(),
                if a.has_open_access_link() { "yes" } else { "no" },
                a.primary_id(),
            ));
        }
    }
    if !result.per_step_errors.is_empty() {
        out.push_str("\n## Step errors\n\n");
        for (step, error) in &result.per_step_errors {
            out.push_str(&format!("- `{step}`: {error}\n"));
        }
    }
    out.push_str(&format!("\nSession: {session_id} (use `last` to refer to this set)\n"));
    out
}

fn ris_date(article: &UnifiedArticle) -> Option<String> {
    let year = article.pub_date.year?;
    Some(match (article.pub_date.month, article.pub_date.day) {
        (Some(m), Some(d)) => format!("{year}/{m:02}/{d:02}"),
        (Some(m), None) => format!("{year}/{m:02}"),
        _ => format!("{year}"),
    })
}

pub fn to_ris(articles: &[UnifiedArticle]) -> String {
    let mut out = String::new();
    for article in articles {
        out.push_str("TY  - JOUR\n");
        if !article.title.is_empty() {
            out.push_str(&format!("TI  - {}\n", article.title));
        }
        for author in &article.authors {
            out.push_str(&format!("AU  - {}\n", author.name));
        }
        if let Some(journal) = &article.journal {
            out.push_str(&format!("JO  - {journal}\n"));
        }
        if let Some(date) = ris_date(article) {
            out.push_str(&format!("PY  - {date}\n"));
        }
        if let Some(doi) = &article.doi {
            out.push_str(&format!("DO  - {doi}\n"));
        }
        if let Some(abstract_text) = &article.abstract_text {
            out.push_str(&format!("AB  - {abstract_text}\n"));
        }
        if let Some(pmid) = &article.pmid {
            out.push_str(&format!("AN  - {pmid}\n"));
        }
        if let Some(link) = article.links.first() {
            out.push_str(&format!("UR  - {}\n", link.url));
        }
        out.push_str("ER  - \n\n");
    }
    out
}

fn bibtex_key(article: &UnifiedArticle) -> String {
    let author = article
        .authors
        .first()
        .map(|a| {
            a.name
                .split_whitespace()
                .last()
                .unwrap_or("anon")
                .to_lowercase()
        })
        .unwrap_or_else(|| "anon".into());
    let year = article
        .pub_date
        .year
        .map(|y| y.to_string())
        .unwrap_or_else(|| "nd".into());
    let id: String = article
        .primary_id()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    format!("{author}{year}{}", &id[..id.len().min(8)])
}

fn bibtex_escape(text: &str) -> String {
    text.replace(['{', '}'], "")
}

pub fn to_bibtex(articles: &[UnifiedArticle]) -> String {
    let mut out = String::new();
    for article in articles {
        out.push_str(&format!("@article{{{},\n", bibtex_key(article)));
        if !article.title.is_empty() {
            out.push_str(&format!("  title = {{{}}},\n", bibtex_escape(&article.title)));
        }
        if !article.authors.is_empty() {
            let authors: Vec<String> = article
                .authors
                .iter()
                .map(|a| bibtex_escape(&a.name))
                .collect();
            out.push_str(&format!("  author = {{{}}},\n", authors.join(" and ")));
        }
        if let Some(journal) = &article.journal {
            out.push_str(&format!("  journal = {{{}}},\n", bibtex_escape(journal)));
        }
        if let Some(year) = article.pub_date.year {
            out.push_str(&format!("  year = {{{year}}},\n"));
        }
        if let Some(doi) = &article.doi {
            out.push_str(&format!("  doi = {{{doi}}},\n"));
        }
        out.push_str("}\n\n");
    }
    out
}

pub fn export(articles: &[UnifiedArticle], format: &str) -> Result<String, crate::LitMcpError> {
    match format.trim().to_ascii_lowercase().as_str() {
        "ris" => Ok(to_ris(articles)),
        "bibtex" | "bib" => Ok(to_bibtex(articles)),
        other => Err(crate::LitMcpError::invalid(format!(
            "Unknown export format \"{other}\". Available: ris, bibtex"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{ArticleLink, Author, Provenance, PubDate};
    use crate::sources::SourceId;

    fn article(pmid: &str, year: i32, oa: bool) -> UnifiedArticle {
        UnifiedArticle {
            pmid: Some(pmid.to_string()),
            pmcid: None,
            doi: Some(format!("10.1/{pmid}")),
            other_ids: BTreeMap::new(),
            title: format!("Article {pmid}"),
            abstract_text: None,
            authors: vec![Author::new("Jane Doe")],
            journal: Some("Critical Care".into()),
            pub_date: PubDate::year(year),
            publication_types: Vec::new(),
            language: None,
            mesh_terms: Vec::new(),
            links: vec![ArticleLink {
                kind: LinkKind::Pdf,
                url: format!("https://example.org/{pmid}.pdf"),
                source: SourceId::Core,
                open_access: oa,
            }],
            citation_count: Some(5),
            influential_citations: None,
            impact: None,
            provenance: vec![Provenance::now(SourceId::Pubmed, pmid)],
        }
    }

    #[test]
    fn oa_summary_counts_links_and_flags() {
        let articles = vec![article("1", 2024, true), article("2", 2023, false)];
        let summary = oa_summary(&articles);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.open_access, 1);
        assert_eq!(summary.with_any_link, 2);
        assert_eq!(summary.by_link_kind.get("pdf"), Some(&2));
    }

    #[test]
    fn timeline_buckets_by_year() {
        let articles = vec![
            article("1", 2024, true),
            article("2", 2024, false),
            article("3", 2020, false),
        ];
        let t = timeline(&articles);
        assert_eq!(t.get(&2024), Some(&2));
        assert_eq!(t.get(&2020), Some(&1));
    }

    #[test]
    fn ris_carries_the_core_fields() {
        let ris = to_ris(&[article("1", 2024, true)]);
        assert!(ris.contains("TY  - JOUR"));
        assert!(ris.contains("TI  - Article 1"));
        assert!(ris.contains("AU  - Jane Doe"));
        assert!(ris.contains("PY  - 2024"));
        assert!(ris.contains("DO  - 10.1/1"));
        assert!(ris.ends_with("ER  - \n\n"));
    }

    #[test]
    fn bibtex_keys_are_filename_safe() {
        let bib = to_bibtex(&[article("1", 2024, true)]);
        assert!(bib.starts_with("@article{doe2024pmid1,"));
        assert!(bib.contains("author = {Jane Doe}"));
    }

    #[test]
    fn export_rejects_unknown_formats() {
        assert!(export(&[], "endnote").is_err());
        assert!(export(&[], "ris").is_ok());
    }
}
