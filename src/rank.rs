//! Multi-dimensional ranker. Every component scores in [0, 1]; the
//! strategy picks the weight vector. Output order is total-score
//! descending with ties broken by primary identifier, so equal inputs
//! always rank identically.

use serde::{Deserialize, Serialize};

use crate::entities::{NormalizedQuery, UnifiedArticle};
use crate::error::LitMcpError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RankStrategy {
    Relevance,
    Recent,
    MostCited,
    Quality,
    Impact,
    #[default]
    Balanced,
}

impl RankStrategy {
    pub fn parse(value: &str) -> Result<Self, LitMcpError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "relevance" => Ok(Self::Relevance),
            "recent" => Ok(Self::Recent),
            "most-cited" | "most_cited" | "cited" => Ok(Self::MostCited),
            "quality" => Ok(Self::Quality),
            "impact" => Ok(Self::Impact),
            "balanced" => Ok(Self::Balanced),
            _ => Err(LitMcpError::invalid(
                "Invalid ranking strategy. Expected one of: relevance, recent, most-cited, quality, impact, balanced",
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Relevance => "relevance",
            Self::Recent => "recent",
            Self::MostCited => "most-cited",
            Self::Quality => "quality",
            Self::Impact => "impact",
            Self::Balanced => "balanced",
        }
    }

    /// Weights for [relevance, recency, citation, authority, fulltext,
    /// specificity].
    fn weights(self) -> [f64; 6] {
        match self {
            Self::Balanced => [0.35, 0.15, 0.20, 0.10, 0.10, 0.10],
            Self::Relevance => [0.60, 0.10, 0.10, 0.05, 0.05, 0.10],
            Self::Recent => [0.25, 0.45, 0.10, 0.05, 0.05, 0.10],
            Self::MostCited => [0.20, 0.10, 0.50, 0.05, 0.05, 0.10],
            Self::Quality => [0.20, 0.10, 0.25, 0.25, 0.10, 0.10],
            Self::Impact => [0.20, 0.10, 0.35, 0.10, 0.05, 0.20],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub relevance: f64,
    pub recency: f64,
    pub citation: f64,
    pub authority: f64,
    pub fulltext: f64,
    /// Absent for non-clinical queries; the remaining weights renormalize.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specificity: Option<f64>,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredArticle {
    pub article: UnifiedArticle,
    pub score: ScoreBreakdown,
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "in",
    "into", "is", "it", "its", "of", "on", "or", "that", "the", "their", "there", "these",
    "this", "to", "was", "were", "which", "with",
];

/// Light suffix-stripping so "sedation"/"sedated" and plural forms meet.
fn stem(token: &str) -> String {
    for suffix in ["ations", "ation", "ing", "ions", "ion", "ies", "es", "ed", "ly", "s"] {
        if token.len() > suffix.len() + 3
            && let Some(stripped) = token.strip_suffix(suffix)
        {
            return stripped.to_string();
        }
    }
    token.to_string()
}

/// Casefolded, stopworded, stemmed token bag.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|t| t.len() >= 2 && !STOPWORDS.contains(&t.as_str()))
        .map(|t| stem(&t))
        .collect()
}

fn raw_relevance(article: &UnifiedArticle) -> Option<f64> {
    article
        .provenance
        .iter()
        .filter_map(|p| p.raw_score)
        .fold(None, |acc, s| Some(acc.map_or(s, |a: f64| a.max(s))))
}

/// TF-IDF-style overlap: each query token weighted by its rarity in the
/// batch; title hits count double.
fn overlap_score(
    query_tokens: &[String],
    article: &UnifiedArticle,
    df: &std::collections::HashMap<String, usize>,
    batch_size: usize,
) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let title_tokens = tokenize(&article.title);
    let abstract_tokens = article
        .abstract_text
        .as_deref()
        .map(tokenize)
        .unwrap_or_default();

    let mut weight_sum = 0.0;
    let mut hit_sum = 0.0;
    for token in query_tokens {
        let n = *df.get(token).unwrap_or(&0) as f64;
        let idf = (1.0 + batch_size as f64 / (1.0 + n)).ln();
        weight_sum += idf;
        if title_tokens.contains(token) {
            hit_sum += idf;
        } else if abstract_tokens.contains(token) {
            hit_sum += 0.5 * idf;
        }
    }
    if weight_sum == 0.0 { 0.0 } else { hit_sum / weight_sum }
}

fn recency_score(article: &UnifiedArticle, now_year: i32) -> f64 {
    match article.pub_date.year {
        Some(year) => {
            let age = (now_year - year).max(0) as f64;
            // Half-life of five years.
            0.5f64.powf(age / 5.0)
        }
        None => 0.0,
    }
}

fn citation_score(article: &UnifiedArticle, max_citations: u64) -> f64 {
    match article.citation_count {
        Some(count) if max_citations > 0 => {
            ((count as f64).ln_1p()) / ((max_citations as f64).ln_1p())
        }
        _ => 0.0,
    }
}

fn authority_score(article: &UnifiedArticle) -> f64 {
    let mut sources: Vec<_> = article.provenance.iter().map(|p| p.source).collect();
    sources.sort();
    sources.dedup();
    let k = sources.len() as i32;
    1.0 - 0.7f64.powi(k)
}

fn fulltext_score(article: &UnifiedArticle) -> f64 {
    if article.has_open_access_link() {
        1.0
    } else if !article.links.is_empty() {
        0.5
    } else {
        0.0
    }
}

fn specificity_score(query: &NormalizedQuery, article: &UnifiedArticle) -> Option<f64> {
    let pico = query.pico.as_ref().filter(|_| query.is_clinical())?;
    let doc_tokens: std::collections::HashSet<String> = tokenize(&article.title)
        .into_iter()
        .chain(
            article
                .abstract_text
                .as_deref()
                .map(tokenize)
                .unwrap_or_default(),
        )
        .collect();

    let mut matched = 0usize;
    for (_, part) in pico.parts() {
        let Some(part) = part else { continue };
        let part_tokens = tokenize(part);
        if !part_tokens.is_empty() && part_tokens.iter().any(|t| doc_tokens.contains(t)) {
            matched += 1;
        }
    }
    Some(matched as f64 / 4.0)
}

pub fn rank(
    articles: Vec<UnifiedArticle>,
    query: &NormalizedQuery,
    strategy: RankStrategy,
) -> Vec<ScoredArticle> {
    rank_at(
        articles,
        query,
        strategy,
        time::OffsetDateTime::now_utc().year(),
    )
}

/// Ranking with an injected clock year, for determinism in tests.
pub fn rank_at(
    articles: Vec<UnifiedArticle>,
    query: &NormalizedQuery,
    strategy: RankStrategy,
    now_year: i32,
) -> Vec<ScoredArticle> {
    if articles.is_empty() {
        return Vec::new();
    }

    let query_tokens = tokenize(&query.text);
    let batch_size = articles.len();

    // Document frequency per query token, for the overlap fallback.
    let mut df: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for article in &articles {
        let mut doc: Vec<String> = tokenize(&article.title);
        doc.extend(
            article
                .abstract_text
                .as_deref()
                .map(tokenize)
                .unwrap_or_default(),
        );
        doc.sort();
        doc.dedup();
        for token in doc {
            *df.entry(token).or_insert(0) += 1;
        }
    }

    let max_raw = articles
        .iter()
        .filter_map(raw_relevance)
        .fold(0.0f64, f64::max);
    let max_citations = articles
        .iter()
        .filter_map(|a| a.citation_count)
        .max()
        .unwrap_or(0);

    let weights = strategy.weights();
    let mut scored: Vec<ScoredArticle> = articles
        .into_iter()
        .map(|article| {
            let relevance = match raw_relevance(&article) {
                Some(raw) if max_raw > 0.0 => (raw / max_raw).clamp(0.0, 1.0),
                _ => overlap_score(&query_tokens, &article, &df, batch_size),
            };
            let recency = recency_score(&article, now_year);
            let citation = citation_score(&article, max_citations);
            let authority = authority_score(&article);
            let fulltext = fulltext_score(&article);
            let specificity = specificity_score(query, &article);

            let components = [
                relevance,
                recency,
                citation,
                authority,
                fulltext,
                specificity.unwrap_or(0.0),
            ];
            let active = if specificity.is_some() { 6 } else { 5 };
            let weight_sum: f64 = weights.iter().take(active).sum();
            let total = components
                .iter()
                .take(active)
                .zip(weights.iter())
                .map(|(c, w)| c * w)
                .sum::<f64>()
                / weight_sum;

            ScoredArticle {
                score: ScoreBreakdown {
                    relevance,
                    recency,
                    citation,
                    authority,
                    fulltext,
                    specificity,
                    total,
                },
                article,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .total
            .total_cmp(&a.score.total)
            .then_with(|| a.article.primary_id().cmp(&b.article.primary_id()))
    });
    scored
}
