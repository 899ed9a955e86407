//! NCBI E-utilities adapter: esearch (JSON), efetch (XML), elink (JSON).

use std::borrow::Cow;
use std::sync::Arc;

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde::Deserialize;

use crate::entities::{ArticleId, NormalizedQuery, PublicationType, QueryKind, UnifiedArticle};
use crate::error::LitMcpError;
use crate::gateway::Gateway;
use crate::transform;

use super::{CallCtx, Capability, Cursor, SearchOutcome, SourceAdapter, SourceId};

const PUBMED_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const PUBMED_BASE_ENV: &str = "LITMCP_PUBMED_BASE";

const CAPABILITIES: &[Capability] = &[
    Capability::Search,
    Capability::FetchOne,
    Capability::FetchReferences,
    Capability::FetchCitations,
];

pub struct PubmedClient {
    gateway: Arc<Gateway>,
    base: Cow<'static, str>,
    api_key: Option<String>,
}

/// One record out of an efetch `PubmedArticleSet`. Raw wire shape; the
/// mapping into [`UnifiedArticle`] lives in `transform::pubmed`.
#[derive(Debug, Clone, Default)]
pub struct PubmedRecord {
    pub pmid: String,
    pub pmcid: Option<String>,
    pub doi: Option<String>,
    pub title: String,
    pub abstract_text: Option<String>,
    pub authors: Vec<PubmedAuthor>,
    pub journal: Option<String>,
    pub year: Option<i32>,
    pub month: Option<String>,
    pub day: Option<String>,
    pub publication_types: Vec<String>,
    pub language: Option<String>,
    pub mesh_terms: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PubmedAuthor {
    pub last_name: String,
    pub fore_name: Option<String>,
    pub affiliation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ESearchEnvelope {
    esearchresult: ESearchResult,
}

#[derive(Debug, Deserialize)]
struct ESearchResult {
    #[serde(default)]
    count: Option<String>,
    #[serde(default)]
    idlist: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ELinkEnvelope {
    #[serde(default)]
    linksets: Vec<ELinkSet>,
}

#[derive(Debug, Deserialize)]
struct ELinkSet {
    #[serde(default)]
    linksetdbs: Vec<ELinkSetDb>,
}

#[derive(Debug, Deserialize)]
struct ELinkSetDb {
    #[serde(default)]
    linkname: String,
    #[serde(default)]
    links: Vec<serde_json::Value>,
}

impl PubmedClient {
    pub fn new(gateway: Arc<Gateway>, config: &crate::config::AppConfig) -> Self {
        Self {
            gateway,
            base: super::env_base(PUBMED_BASE, PUBMED_BASE_ENV),
            api_key: config.ncbi_api_key.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(gateway: Arc<Gateway>, base: String) -> Self {
        Self {
            gateway,
            base: Cow::Owned(base),
            api_key: None,
        }
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> String {
        let mut url = format!("{}?", super::join_endpoint(&self.base, path));
        let mut first = true;
        for (name, value) in params {
            if !first {
                url.push('&');
            }
            first = false;
            url.push_str(name);
            url.push('=');
            url.push_str(&urlencode(value));
        }
        if let Some(key) = &self.api_key {
            url.push_str("&api_key=");
            url.push_str(&urlencode(key));
        }
        url
    }

    async fn get(&self, url: String, ctx: &CallCtx) -> Result<Vec<u8>, LitMcpError> {
        let resp = self
            .gateway
            .fetch(ctx.request(url))
            .await
            .map_err(|e| super::fetch_error(SourceId::Pubmed, e))?;
        Ok(resp.body)
    }

    /// Translate the normalized query into PubMed term syntax. Boolean
    /// queries pass through verbatim.
    fn build_term(query: &NormalizedQuery) -> (String, Vec<&'static str>) {
        let mut unsupported = Vec::new();
        if query.kind == QueryKind::Boolean {
            return (query.text.clone(), unsupported);
        }

        let mut clauses: Vec<String> = Vec::new();
        let text = query.text.trim();
        if !text.is_empty() {
            if query.expansions.is_empty() {
                clauses.push(text.to_string());
            } else {
                // Each expanded term becomes an OR-group of its synonyms.
                for (term, exp) in &query.expansions {
                    let mut alternatives = vec![term.clone()];
                    if !exp.preferred.is_empty() && !alternatives.contains(&exp.preferred) {
                        alternatives.push(exp.preferred.clone());
                    }
                    alternatives.extend(exp.synonyms.iter().cloned());
                    let group = alternatives
                        .iter()
                        .map(|t| format!("\"{t}\""))
                        .collect::<Vec<_>>()
                        .join(" OR ");
                    clauses.push(format!("({group})"));
                }
                let residual: Vec<&str> = text
                    .split_whitespace()
                    .filter(|w| !query.expansions.contains_key(&w.to_lowercase()))
                    .collect();
                if !residual.is_empty() {
                    clauses.push(residual.join(" "));
                }
            }
        }

        for pt in &query.article_types {
            let label = match pt {
                PublicationType::Review => Some("Review"),
                PublicationType::ClinicalTrial => Some("Clinical Trial"),
                PublicationType::MetaAnalysis => Some("Meta-Analysis"),
                PublicationType::JournalArticle => Some("Journal Article"),
                PublicationType::CaseReport => Some("Case Reports"),
                PublicationType::Editorial => Some("Editorial"),
                PublicationType::Letter => Some("Letter"),
                _ => None,
            };
            match label {
                Some(l) => clauses.push(format!("\"{l}\"[Publication Type]")),
                None => unsupported.push("article-type"),
            }
        }

        if let Some(lang) = &query.language {
            clauses.push(format!("{lang}[Language]"));
        }
        for demo in &query.demographics {
            clauses.push(format!("\"{demo}\"[MeSH Terms]"));
        }

        match (&query.date_from, &query.date_to) {
            (None, None) => {}
            (from, to) => {
                let lo = from
                    .map(|d| {
                        let (y, m, dd) = d.sort_key();
                        format!("{y:04}/{m:02}/{dd:02}")
                    })
                    .unwrap_or_else(|| "1000/01/01".into());
                let hi = to
                    .map(|d| {
                        let (y, m, dd) = d.sort_key();
                        format!("{y:04}/{m:02}/{dd:02}")
                    })
                    .unwrap_or_else(|| "3000/12/31".into());
                clauses.push(format!(
                    "(\"{lo}\"[Date - Publication] : \"{hi}\"[Date - Publication])"
                ));
            }
        }

        if query.open_access_only {
            unsupported.push("open-access");
        }

        (clauses.join(" AND "), unsupported)
    }

    async fn efetch(&self, pmids: &[String], ctx: &CallCtx) -> Result<Vec<PubmedRecord>, LitMcpError> {
        let ids = pmids.join(",");
        let url = self.endpoint(
            "efetch.fcgi",
            &[
                ("db", "pubmed"),
                ("id", ids.as_str()),
                ("retmode", "xml"),
                ("rettype", "abstract"),
            ],
        );
        let body = self.get(url, ctx).await?;
        let xml = String::from_utf8_lossy(&body);
        Ok(parse_efetch_xml(&xml))
    }

    async fn elink(
        &self,
        pmid: &str,
        linkname: &str,
        ctx: &CallCtx,
    ) -> Result<Vec<ArticleId>, LitMcpError> {
        let url = self.endpoint(
            "elink.fcgi",
            &[
                ("dbfrom", "pubmed"),
                ("db", "pubmed"),
                ("id", pmid),
                ("linkname", linkname),
                ("retmode", "json"),
            ],
        );
        let body = self.get(url, ctx).await?;
        let envelope: ELinkEnvelope = super::parse_json(SourceId::Pubmed, &body)?;
        let mut out = Vec::new();
        for set in envelope.linksets {
            for db in set.linksetdbs {
                if db.linkname != linkname {
                    continue;
                }
                for link in db.links {
                    // elink emits ids either as bare numbers or strings.
                    let id = match link {
                        serde_json::Value::Number(n) => n.to_string(),
                        serde_json::Value::String(s) => s,
                        _ => continue,
                    };
                    out.push(ArticleId::Pmid(id));
                }
            }
        }
        Ok(out)
    }

    fn require_pmid(id: &ArticleId) -> Result<&str, LitMcpError> {
        match id {
            ArticleId::Pmid(pmid) => Ok(pmid),
            other => Err(LitMcpError::invalid(format!(
                "pubmed requires a PMID, got \"{}\"",
                other.as_str()
            ))),
        }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for PubmedClient {
    fn id(&self) -> SourceId {
        SourceId::Pubmed
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    async fn search(
        &self,
        query: &NormalizedQuery,
        cursor: Option<Cursor>,
        page_size: usize,
        ctx: &CallCtx,
    ) -> Result<SearchOutcome, LitMcpError> {
        let (term, unsupported_filters) = Self::build_term(query);
        if term.is_empty() {
            return Err(LitMcpError::invalid("pubmed search needs a non-empty term"));
        }
        let offset = cursor.map(|c| c.offset()).unwrap_or(0);
        let retmax = page_size.to_string();
        let retstart = offset.to_string();
        let url = self.endpoint(
            "esearch.fcgi",
            &[
                ("db", "pubmed"),
                ("term", term.as_str()),
                ("retmax", retmax.as_str()),
                ("retstart", retstart.as_str()),
                ("retmode", "json"),
            ],
        );
        let body = self.get(url, ctx).await?;
        let envelope: ESearchEnvelope = super::parse_json(SourceId::Pubmed, &body)?;
        let total = envelope
            .esearchresult
            .count
            .and_then(|c| c.parse::<u64>().ok());
        let idlist = envelope.esearchresult.idlist;

        let articles = if idlist.is_empty() {
            Vec::new()
        } else {
            self.efetch(&idlist, ctx)
                .await?
                .iter()
                .map(transform::pubmed::from_record)
                .collect()
        };

        let next = offset + articles.len() as u64;
        let cursor = match total {
            Some(t) if next < t && !articles.is_empty() => Some(Cursor::Offset(next)),
            _ => None,
        };
        Ok(SearchOutcome {
            articles,
            total,
            cursor,
            unsupported_filters,
        })
    }

    async fn fetch_one(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Option<UnifiedArticle>, LitMcpError> {
        let pmid = Self::require_pmid(id)?;
        let records = self.efetch(&[pmid.to_string()], ctx).await?;
        Ok(records.first().map(transform::pubmed::from_record))
    }

    async fn fetch_references(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Vec<ArticleId>, LitMcpError> {
        let pmid = Self::require_pmid(id)?;
        self.elink(pmid, "pubmed_pubmed_refs", ctx).await
    }

    async fn fetch_citations(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Vec<ArticleId>, LitMcpError> {
        let pmid = Self::require_pmid(id)?;
        self.elink(pmid, "pubmed_pubmed_citedin", ctx).await
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// Element name with any namespace prefix stripped.
fn local_name(raw: &[u8]) -> String {
    let name = String::from_utf8_lossy(raw);
    name.rsplit(':').next().unwrap_or(&name).to_string()
}

/// Streaming parse of an efetch `PubmedArticleSet`. Unknown elements are
/// skipped; missing optional elements leave their fields empty.
pub fn parse_efetch_xml(xml: &str) -> Vec<PubmedRecord> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut records = Vec::new();
    let mut current: Option<PubmedRecord> = None;
    let mut element = String::new();
    let mut path: Vec<String> = Vec::new();
    let mut abstract_parts: Vec<String> = Vec::new();
    let mut author: Option<PubmedAuthor> = None;
    let mut id_type: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref());
                match name.as_str() {
                    "PubmedArticle" => current = Some(PubmedRecord::default()),
                    "Abstract" => abstract_parts.clear(),
                    "Author" => author = Some(PubmedAuthor::default()),
                    "ArticleId" => {
                        id_type = e
                            .attributes()
                            .flatten()
                            .find(|a| local_name(a.key.as_ref()) == "IdType")
                            .map(|a| String::from_utf8_lossy(&a.value).to_string());
                    }
                    _ => {}
                }
                path.push(name.clone());
                element = name;
            }
            Ok(Event::End(e)) => {
                let name = local_name(e.name().as_ref());
                match name.as_str() {
                    "PubmedArticle" => {
                        if let Some(mut record) = current.take()
                            && !record.pmid.is_empty()
                        {
                            if !abstract_parts.is_empty() {
                                record.abstract_text = Some(abstract_parts.join(" "));
                                abstract_parts.clear();
                            }
                            records.push(record);
                        }
                        abstract_parts.clear();
                    }
                    "Author" => {
                        if let (Some(record), Some(a)) = (current.as_mut(), author.take())
                            && !a.last_name.is_empty()
                        {
                            record.authors.push(a);
                        }
                    }
                    _ => {}
                }
                path.pop();
                element = path.last().cloned().unwrap_or_default();
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().to_string();
                if text.is_empty() {
                    continue;
                }
                let Some(record) = current.as_mut() else {
                    continue;
                };
                let in_medline_citation = path.iter().any(|p| p == "MedlineCitation");
                match element.as_str() {
                    "PMID" if in_medline_citation && record.pmid.is_empty() => {
                        record.pmid = text;
                    }
                    "ArticleTitle" => record.title.push_str(&text),
                    "AbstractText" => abstract_parts.push(text),
                    "LastName" => {
                        if let Some(a) = author.as_mut() {
                            a.last_name = text;
                        }
                    }
                    "ForeName" => {
                        if let Some(a) = author.as_mut() {
                            a.fore_name = Some(text);
                        }
                    }
                    "Affiliation" => {
                        if let Some(a) = author.as_mut()
                            && a.affiliation.is_none()
                        {
                            a.affiliation = Some(text);
                        }
                    }
                    "Title" if path.iter().any(|p| p == "Journal") => {
                        record.journal = Some(text);
                    }
                    "Year" if path.iter().any(|p| p == "PubDate") => {
                        record.year = text.parse().ok();
                    }
                    "MedlineDate" => {
                        // e.g. "2023 Jan-Feb"; keep the year.
                        if record.year.is_none() {
                            record.year = text
                                .split_whitespace()
                                .next()
                                .and_then(|y| y.parse().ok());
                        }
                    }
                    "Month" if path.iter().any(|p| p == "PubDate") => {
                        record.month = Some(text);
                    }
                    "Day" if path.iter().any(|p| p == "PubDate") => {
                        record.day = Some(text);
                    }
                    "PublicationType" => record.publication_types.push(text),
                    "Language" => record.language = Some(text),
                    "DescriptorName" => record.mesh_terms.push(text),
                    "ArticleId" => match id_type.as_deref() {
                        Some("doi") => record.doi = crate::entities::article::normalize_doi(&text),
                        Some("pmc") => record.pmcid = Some(text),
                        _ => {}
                    },
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    records
}
