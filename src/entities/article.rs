use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::sources::SourceId;

/// Controlled publication-type vocabulary. Unknown upstream values map to
/// `Other` rather than failing normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublicationType {
    JournalArticle,
    Review,
    ClinicalTrial,
    MetaAnalysis,
    Preprint,
    CaseReport,
    Editorial,
    Letter,
    Other,
}

impl PublicationType {
    pub fn from_label(label: &str) -> Self {
        let l = label.trim().to_ascii_lowercase();
        if l.contains("meta-analysis") || l.contains("meta analysis") {
            Self::MetaAnalysis
        } else if l.contains("clinical trial") || l.contains("randomized") {
            Self::ClinicalTrial
        } else if l.contains("review") {
            Self::Review
        } else if l.contains("preprint") {
            Self::Preprint
        } else if l.contains("case report") {
            Self::CaseReport
        } else if l.contains("editorial") {
            Self::Editorial
        } else if l.contains("letter") || l.contains("comment") {
            Self::Letter
        } else if l.contains("journal article") || l.contains("article") {
            Self::JournalArticle
        } else {
            Self::Other
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::JournalArticle => "journal-article",
            Self::Review => "review",
            Self::ClinicalTrial => "clinical-trial",
            Self::MetaAnalysis => "meta-analysis",
            Self::Preprint => "preprint",
            Self::CaseReport => "case-report",
            Self::Editorial => "editorial",
            Self::Letter => "letter",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkKind {
    HtmlLanding,
    Pdf,
    Xml,
    RawText,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleLink {
    pub kind: LinkKind,
    pub url: String,
    pub source: SourceId,
    pub open_access: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affiliation: Option<String>,
}

impl Author {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            affiliation: None,
        }
    }

    /// Merge key: normalized last name plus first initial.
    pub fn merge_key(&self) -> String {
        let name = self.name.trim();
        let mut parts = name.split_whitespace();
        let first = parts.next().unwrap_or("");
        let last = parts.last().unwrap_or(first);
        let initial = first.chars().next().map(|c| c.to_ascii_lowercase());
        match initial {
            Some(i) => format!("{}|{}", last.to_lowercase(), i),
            None => last.to_lowercase(),
        }
    }
}

/// Publication date with optional precision. `year: None` means the date is
/// unknown entirely; such articles are retained but score zero on recency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubDate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day: Option<u8>,
}

const MONTH_NAMES: &[(&str, u8)] = &[
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

fn parse_month(value: &str) -> Option<u8> {
    let v = value.trim();
    if let Ok(n) = v.parse::<u8>() {
        return (1..=12).contains(&n).then_some(n);
    }
    let lower = v.to_ascii_lowercase();
    MONTH_NAMES
        .iter()
        .find(|(name, _)| lower.starts_with(name))
        .map(|(_, n)| *n)
}

impl PubDate {
    pub fn year(year: i32) -> Self {
        Self {
            year: Some(year),
            month: None,
            day: None,
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_known(&self) -> bool {
        self.year.is_some()
    }

    /// True when the date carries less than day precision.
    pub fn is_partial(&self) -> bool {
        self.year.is_some() && (self.month.is_none() || self.day.is_none())
    }

    /// Accepts `YYYY`, `YYYY-MM`, `YYYY-MM-DD`, and `YYYY Mon [DD]` forms.
    /// Anything else is an unknown date, never an error.
    pub fn parse(value: &str) -> Self {
        let v = value.trim();
        if v.is_empty() {
            return Self::unknown();
        }
        let mut parts = v.splitn(3, |c| c == '-' || c == '/' || c == ' ');
        let year = match parts.next().and_then(|y| y.parse::<i32>().ok()) {
            Some(y) if (1000..=9999).contains(&y) => y,
            _ => return Self::unknown(),
        };
        let month = parts.next().and_then(parse_month);
        let day = parts
            .next()
            .and_then(|d| d.trim().parse::<u8>().ok())
            .filter(|d| (1..=31).contains(d));
        Self {
            year: Some(year),
            month,
            day: if month.is_some() { day } else { None },
        }
    }

    pub fn from_parts(year: Option<i32>, month: Option<&str>, day: Option<&str>) -> Self {
        let Some(year) = year else {
            return Self::unknown();
        };
        let month = month.and_then(parse_month);
        let day = day
            .and_then(|d| d.trim().parse::<u8>().ok())
            .filter(|d| (1..=31).contains(d));
        Self {
            year: Some(year),
            month,
            day: if month.is_some() { day } else { None },
        }
    }

    /// Missing day defaults to 1, missing month to January.
    pub fn sort_key(&self) -> (i32, u8, u8) {
        (
            self.year.unwrap_or(0),
            self.month.unwrap_or(1),
            self.day.unwrap_or(1),
        )
    }

    pub fn display(&self) -> String {
        match (self.year, self.month, self.day) {
            (Some(y), Some(m), Some(d)) => format!("{y:04}-{m:02}-{d:02}"),
            (Some(y), Some(m), None) => format!("{y:04}-{m:02}"),
            (Some(y), None, _) => format!("{y:04}"),
            (None, _, _) => "unknown".to_string(),
        }
    }
}

/// One source's contribution to a merged article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub source: SourceId,
    pub local_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub fetched_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_score: Option<f64>,
}

impl Provenance {
    pub fn now(source: SourceId, local_id: impl Into<String>) -> Self {
        Self {
            source,
            local_id: local_id.into(),
            fetched_at: OffsetDateTime::now_utc(),
            raw_score: None,
        }
    }

    pub fn scored(source: SourceId, local_id: impl Into<String>, raw_score: f64) -> Self {
        Self {
            raw_score: Some(raw_score),
            ..Self::now(source, local_id)
        }
    }
}

/// The canonical article record every source normalizes into.
///
/// Identifier fields are fixed at construction; enrichment and merging
/// always produce a new value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedArticle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pmid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pmcid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    /// Source-local identifiers keyed by source name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub other_ids: BTreeMap<String, String>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub authors: Vec<Author>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,
    #[serde(default)]
    pub pub_date: PubDate,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publication_types: Vec<PublicationType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mesh_terms: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<ArticleLink>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citation_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub influential_citations: Option<u64>,
    /// Normalized impact in [0, 1], from the single service that provides it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impact: Option<f64>,
    pub provenance: Vec<Provenance>,
}

impl UnifiedArticle {
    /// A record with no identifier at all is not admissible.
    pub fn has_identifier(&self) -> bool {
        self.pmid.is_some()
            || self.pmcid.is_some()
            || self.doi.is_some()
            || !self.other_ids.is_empty()
    }

    /// Identifier used for cache keys, tie-breaking, and diffs, in the
    /// dedup priority order.
    pub fn primary_id(&self) -> String {
        if let Some(pmid) = &self.pmid {
            return format!("pmid:{pmid}");
        }
        if let Some(pmcid) = &self.pmcid {
            return format!("pmcid:{pmcid}");
        }
        if let Some(doi) = &self.doi {
            return format!("doi:{doi}");
        }
        self.other_ids
            .iter()
            .next()
            .map(|(src, id)| format!("{src}:{id}"))
            .unwrap_or_default()
    }

    pub fn has_open_access_link(&self) -> bool {
        self.links.iter().any(|l| l.open_access)
    }

    /// Last-resort dedup key; `None` when any component is missing.
    pub fn near_match_key(&self) -> Option<String> {
        let year = self.pub_date.year?;
        let title = normalize_title(&self.title);
        if title.is_empty() {
            return None;
        }
        let last_name = self
            .authors
            .first()
            .map(|a| a.name.split_whitespace().last().unwrap_or("").to_lowercase())
            .filter(|n| !n.is_empty())?;
        Some(format!("{title}|{last_name}|{year}"))
    }
}

/// Casefold, strip punctuation, collapse whitespace.
pub fn normalize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_space = true;
    for ch in title.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Lowercase and strip `doi:` and URL prefixes.
pub fn normalize_doi(raw: &str) -> Option<String> {
    let mut doi = raw.trim().to_ascii_lowercase();
    for prefix in [
        "https://doi.org/",
        "http://doi.org/",
        "https://dx.doi.org/",
        "http://dx.doi.org/",
        "doi:",
    ] {
        if let Some(rest) = doi.strip_prefix(prefix) {
            doi = rest.trim().to_string();
        }
    }
    if doi.starts_with("10.") && doi.contains('/') && !doi.contains(char::is_whitespace) {
        Some(doi)
    } else {
        None
    }
}

fn parse_pmid(id: &str) -> Option<String> {
    let id = id.trim();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let trimmed = id.trim_start_matches('0');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_pmcid(id: &str) -> Option<String> {
    let mut id = id.trim();
    if id.len() > 6 && id[..6].eq_ignore_ascii_case("PMCID:") {
        id = id[6..].trim();
    }
    if id.len() < 4 {
        return None;
    }
    let (prefix, rest) = id.split_at(3);
    if !prefix.eq_ignore_ascii_case("PMC") {
        return None;
    }
    let rest = rest.trim();
    if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("PMC{rest}"))
}

/// A caller-supplied identifier, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArticleId {
    Pmid(String),
    Pmcid(String),
    Doi(String),
}

impl ArticleId {
    /// Accepts bare PMIDs, `PMC`-prefixed ids, DOIs (with or without a
    /// `doi:`/URL prefix), and the `pmid:`/`pmcid:`/`doi:` forms used by
    /// [`UnifiedArticle::primary_id`].
    pub fn parse(id: &str) -> Option<Self> {
        let id = id.trim();
        let id = id.strip_prefix("pmid:").unwrap_or(id);
        if let Some(pmcid) = parse_pmcid(id.strip_prefix("pmcid:").unwrap_or(id)) {
            return Some(Self::Pmcid(pmcid));
        }
        if let Some(doi) = normalize_doi(id) {
            return Some(Self::Doi(doi));
        }
        parse_pmid(id).map(Self::Pmid)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pmid(v) | Self::Pmcid(v) | Self::Doi(v) => v,
        }
    }

    /// The `kind:value` form matching [`UnifiedArticle::primary_id`].
    pub fn tagged(&self) -> String {
        match self {
            Self::Pmid(v) => format!("pmid:{v}"),
            Self::Pmcid(v) => format!("pmcid:{v}"),
            Self::Doi(v) => format!("doi:{v}"),
        }
    }
}
