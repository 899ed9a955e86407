//! Europe PMC REST adapter: search (JSON), references/citations (JSON),
//! full text (XML).

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::entities::{ArticleId, NormalizedQuery, PublicationType, QueryKind, UnifiedArticle};
use crate::error::LitMcpError;
use crate::gateway::Gateway;
use crate::transform;

use super::{CallCtx, Capability, Cursor, FullText, SearchOutcome, SourceAdapter, SourceId};

const EUROPEPMC_BASE: &str = "https://www.ebi.ac.uk/europepmc/webservices/rest";
const EUROPEPMC_BASE_ENV: &str = "LITMCP_EUROPEPMC_BASE";

const CAPABILITIES: &[Capability] = &[
    Capability::Search,
    Capability::FetchOne,
    Capability::FetchReferences,
    Capability::FetchCitations,
    Capability::FetchFulltext,
];

pub struct EuropePmcClient {
    gateway: Arc<Gateway>,
    base: Cow<'static, str>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EuropePmcSearchResponse {
    pub hit_count: Option<u64>,
    pub next_cursor_mark: Option<String>,
    pub result_list: Option<EuropePmcResultList>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EuropePmcResultList {
    #[serde(default)]
    pub result: Vec<EuropePmcResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EuropePmcResult {
    pub id: Option<String>,
    pub source: Option<String>,
    pub pmid: Option<String>,
    pub pmcid: Option<String>,
    pub doi: Option<String>,
    pub title: Option<String>,
    pub author_string: Option<String>,
    pub journal_title: Option<String>,
    pub pub_year: Option<String>,
    pub first_publication_date: Option<String>,
    pub pub_type: Option<String>,
    pub language: Option<String>,
    pub abstract_text: Option<String>,
    pub cited_by_count: Option<u64>,
    pub is_open_access: Option<String>,
    pub full_text_url_list: Option<EuropePmcFullTextUrlList>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EuropePmcFullTextUrlList {
    #[serde(default)]
    pub full_text_url: Vec<EuropePmcFullTextUrl>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EuropePmcFullTextUrl {
    pub document_style: Option<String>,
    pub availability_code: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReferenceEnvelope {
    reference_list: Option<ReferenceList>,
}

#[derive(Debug, Deserialize)]
struct ReferenceList {
    #[serde(default)]
    reference: Vec<LinkedRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CitationEnvelope {
    citation_list: Option<CitationList>,
}

#[derive(Debug, Deserialize)]
struct CitationList {
    #[serde(default)]
    citation: Vec<LinkedRecord>,
}

#[derive(Debug, Deserialize)]
struct LinkedRecord {
    id: Option<String>,
}

/// Escape Europe PMC query metacharacters.
fn escape(value: &str) -> String {
    let value = value.trim();
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(
            ch,
            '\\' | '"' | '+' | '-' | '!' | '(' | ')' | '{' | '}' | '[' | ']' | '^' | '~' | '*'
                | '?' | ':' | '|'
        ) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Quote multi-word values so they match as phrases.
fn phrase(value: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        return String::new();
    }
    let escaped = escape(value);
    if value.chars().any(|c| c.is_whitespace()) || value.contains('/') {
        format!("\"{escaped}\"")
    } else {
        escaped
    }
}

impl EuropePmcClient {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            base: super::env_base(EUROPEPMC_BASE, EUROPEPMC_BASE_ENV),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(gateway: Arc<Gateway>, base: String) -> Self {
        Self {
            gateway,
            base: Cow::Owned(base),
        }
    }

    async fn get(&self, url: String, ctx: &CallCtx) -> Result<Vec<u8>, LitMcpError> {
        let resp = self
            .gateway
            .fetch(ctx.request(url))
            .await
            .map_err(|e| super::fetch_error(SourceId::Europepmc, e))?;
        Ok(resp.body)
    }

    fn build_query(query: &NormalizedQuery) -> (String, Vec<&'static str>) {
        let mut unsupported = Vec::new();
        if query.kind == QueryKind::Boolean {
            return (query.text.clone(), unsupported);
        }

        let mut terms: Vec<String> = Vec::new();
        let text = query.expanded_text();
        let text = text.trim();
        if !text.is_empty() {
            terms.push(escape(text));
        }

        for pt in &query.article_types {
            let label = match pt {
                PublicationType::Review => Some("review"),
                PublicationType::ClinicalTrial => Some("clinical trial"),
                PublicationType::MetaAnalysis => Some("meta-analysis"),
                PublicationType::CaseReport => Some("case-reports"),
                PublicationType::JournalArticle => Some("research-article"),
                PublicationType::Preprint => Some("preprint"),
                _ => None,
            };
            match label {
                Some(l) => terms.push(format!("PUB_TYPE:\"{l}\"")),
                None => unsupported.push("article-type"),
            }
        }

        if let Some(lang) = &query.language {
            terms.push(format!("LANG:\"{lang}\""));
        }
        if query.open_access_only {
            terms.push("OPEN_ACCESS:y".into());
        }
        if !query.demographics.is_empty() {
            unsupported.push("demographics");
        }

        let from = query.date_from.as_ref().map(|d| {
            let (y, m, dd) = d.sort_key();
            format!("{y:04}-{m:02}-{dd:02}")
        });
        let to = query.date_to.as_ref().map(|d| {
            let (y, m, dd) = d.sort_key();
            format!("{y:04}-{m:02}-{dd:02}")
        });
        match (from, to) {
            (Some(from), to) => {
                let to = to.unwrap_or_else(|| "*".into());
                terms.push(format!("FIRST_PDATE:[{from} TO {to}]"));
            }
            (None, Some(to)) => terms.push(format!("FIRST_PDATE:[* TO {to}]")),
            (None, None) => {}
        }

        (terms.join(" AND "), unsupported)
    }

    async fn search_raw(
        &self,
        query: &str,
        cursor: Option<&str>,
        page_size: usize,
        ctx: &CallCtx,
    ) -> Result<EuropePmcSearchResponse, LitMcpError> {
        let mut url = format!(
            "{}?query={}&format=json&resultType=core&pageSize={}",
            super::join_endpoint(&self.base, "search"),
            urlencoded(query),
            page_size.clamp(1, 100)
        );
        if let Some(cursor) = cursor {
            url.push_str("&cursorMark=");
            url.push_str(&urlencoded(cursor));
        }
        let body = self.get(url, ctx).await?;
        super::parse_json(SourceId::Europepmc, &body)
    }

    async fn find_by_id(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Option<EuropePmcResult>, LitMcpError> {
        let query = match id {
            ArticleId::Pmid(pmid) => format!("EXT_ID:{pmid} AND SRC:MED"),
            ArticleId::Pmcid(pmcid) => format!("PMCID:{pmcid}"),
            ArticleId::Doi(doi) => format!("DOI:{}", phrase(doi)),
        };
        let resp = self.search_raw(&query, None, 1, ctx).await?;
        Ok(resp.result_list.and_then(|l| l.result.into_iter().next()))
    }

    /// (source, id) pair Europe PMC uses in its path-style endpoints.
    fn rest_id(id: &ArticleId) -> (&'static str, String) {
        match id {
            ArticleId::Pmid(pmid) => ("MED", pmid.clone()),
            ArticleId::Pmcid(pmcid) => ("PMC", pmcid.clone()),
            ArticleId::Doi(doi) => ("DOI", doi.clone()),
        }
    }
}

fn urlencoded(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[async_trait::async_trait]
impl SourceAdapter for EuropePmcClient {
    fn id(&self) -> SourceId {
        SourceId::Europepmc
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
        let (term, unsupported_filters) = Self::build_query(query);
        if term.is_empty() {
            return Err(LitMcpError::invalid(
                "europepmc search needs a non-empty query",
            ));
        }
        let cursor_mark = match &cursor {
            Some(Cursor::Token(token)) => Some(token.as_str()),
            _ => None,
        };
        let resp = self.search_raw(&term, cursor_mark, page_size, ctx).await?;
        let total = resp.hit_count;
        let next = resp.next_cursor_mark.clone();
        let articles: Vec<UnifiedArticle> = resp
            .result_list
            .map(|l| l.result)
            .unwrap_or_default()
            .iter()
            .filter_map(transform::europepmc::from_result)
            .collect();
        let cursor = match next {
            Some(token) if !articles.is_empty() => Some(Cursor::Token(token)),
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
        let hit = self.find_by_id(id, ctx).await?;
        Ok(hit.as_ref().and_then(transform::europepmc::from_result))
    }

    async fn fetch_references(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Vec<ArticleId>, LitMcpError> {
        let (src, local) = Self::rest_id(id);
        let url = format!(
            "{}?format=json&pageSize=100",
            super::join_endpoint(&self.base, &format!("{src}/{local}/references"))
        );
        let body = self.get(url, ctx).await?;
        let envelope: ReferenceEnvelope = super::parse_json(SourceId::Europepmc, &body)?;
        Ok(envelope
            .reference_list
            .map(|l| l.reference)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|r| r.id)
            .filter_map(|id| ArticleId::parse(&id))
            .collect())
    }

    async fn fetch_citations(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Vec<ArticleId>, LitMcpError> {
        let (src, local) = Self::rest_id(id);
        let url = format!(
            "{}?format=json&pageSize=100",
            super::join_endpoint(&self.base, &format!("{src}/{local}/citations"))
        );
        let body = self.get(url, ctx).await?;
        let envelope: CitationEnvelope = super::parse_json(SourceId::Europepmc, &body)?;
        Ok(envelope
            .citation_list
            .map(|l| l.citation)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|r| r.id)
            .filter_map(|id| ArticleId::parse(&id))
            .collect())
    }

    async fn fetch_fulltext(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Option<FullText>, LitMcpError> {
        let (src, local) = Self::rest_id(id);
        let url = super::join_endpoint(&self.base, &format!("{src}/{local}/fullTextXML"));
        let resp = self.gateway.fetch(ctx.request(url)).await;
        let body = match resp {
            Ok(resp) => resp.body,
            Err(err) if err.last_status == Some(404) => return Ok(None),
            Err(err) => return Err(super::fetch_error(SourceId::Europepmc, err)),
        };
        let xml = String::from_utf8_lossy(&body);
        let sections = extract_sections(&xml);
        if sections.is_empty() && xml.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(FullText {
            sections,
            raw: Some(xml.to_string()),
        }))
    }
}

/// Pull titled sections out of JATS full-text XML. Tolerant: unknown tags
/// contribute their text to the enclosing section.
pub(crate) fn extract_sections(xml: &str) -> BTreeMap<String, String> {
    use quick_xml::events::Event;
    use quick_xml::reader::Reader;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut sections: BTreeMap<String, String> = BTreeMap::new();
    let mut current_title: Option<String> = None;
    let mut in_title = false;
    let mut depth_in_sec = 0usize;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.name();
                let name = String::from_utf8_lossy(name.as_ref()).to_string();
                let local = name.rsplit(':').next().unwrap_or(&name).to_string();
                match local.as_str() {
                    "sec" => depth_in_sec += 1,
                    "title" if depth_in_sec > 0 => in_title = true,
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                let name = String::from_utf8_lossy(name.as_ref()).to_string();
                let local = name.rsplit(':').next().unwrap_or(&name).to_string();
                match local.as_str() {
                    "sec" => {
                        depth_in_sec = depth_in_sec.saturating_sub(1);
                        if depth_in_sec == 0 {
                            current_title = None;
                        }
                    }
                    "title" => in_title = false,
                    _ => {}
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().to_string();
                if text.is_empty() {
                    continue;
                }
                if in_title && depth_in_sec > 0 {
                    if current_title.is_none() || depth_in_sec == 1 {
                        current_title = Some(text.clone());
                        sections.entry(text).or_default();
                    }
                } else if depth_in_sec > 0
                    && let Some(title) = &current_title
                    && let Some(body) = sections.get_mut(title)
                {
                    if !body.is_empty() {
                        body.push(' ');
                    }
                    body.push_str(&text);
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    sections.retain(|_, v| !v.is_empty());
    sections
}
