//! CORE v3 adapter (open-access aggregator). Authenticated via bearer key
//! when configured; anonymous otherwise.

use std::borrow::Cow;
use std::sync::Arc;

use serde::Deserialize;

use crate::entities::{NormalizedQuery, UnifiedArticle};
use crate::error::LitMcpError;
use crate::gateway::Gateway;
use crate::transform;

use super::{CallCtx, Capability, Cursor, SearchOutcome, SourceAdapter, SourceId};

const CORE_BASE: &str = "https://api.core.ac.uk/v3";
const CORE_BASE_ENV: &str = "LITMCP_CORE_BASE";

const CAPABILITIES: &[Capability] = &[Capability::Search];

pub struct CoreClient {
    gateway: Arc<Gateway>,
    base: Cow<'static, str>,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchEnvelope {
    total_hits: Option<u64>,
    #[serde(default)]
    results: Vec<CoreWork>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreWork {
    pub id: Option<serde_json::Value>,
    pub doi: Option<String>,
    pub title: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub year_published: Option<i32>,
    pub published_date: Option<String>,
    #[serde(default)]
    pub authors: Vec<CoreAuthor>,
    pub download_url: Option<String>,
    pub language: Option<CoreLanguage>,
    pub publisher: Option<String>,
    #[serde(default)]
    pub source_fulltext_urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoreAuthor {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoreLanguage {
    pub code: Option<String>,
}

impl CoreClient {
    pub fn new(gateway: Arc<Gateway>, config: &crate::config::AppConfig) -> Self {
        Self {
            gateway,
            base: super::env_base(CORE_BASE, CORE_BASE_ENV),
            api_key: config.core_api_key.clone(),
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
impl SourceAdapter for CoreClient {
    fn id(&self) -> SourceId {
        SourceId::Core
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
        let mut unsupported_filters = Vec::new();
        let mut q = query.expanded_text().trim().to_string();
        if q.is_empty() {
            return Err(LitMcpError::invalid("core search needs a non-empty query"));
        }
        // CORE supports fielded ranges in its query string.
        if let Some(from) = &query.date_from {
            let (y, _, _) = from.sort_key();
            q.push_str(&format!(" AND yearPublished>={y}"));
        }
        if let Some(to) = &query.date_to {
            let (y, _, _) = to.sort_key();
            q.push_str(&format!(" AND yearPublished<={y}"));
        }
        if !query.article_types.is_empty() {
            unsupported_filters.push("article-type");
        }
        if query.language.is_some() {
            unsupported_filters.push("language");
        }
        if !query.demographics.is_empty() {
            unsupported_filters.push("demographics");
        }
        // Everything CORE serves is open access, so the flag is a no-op.

        let offset = cursor.map(|c| c.offset()).unwrap_or(0);
        let url = format!(
            "{}?q={}&limit={}&offset={}",
            super::join_endpoint(&self.base, "search/works"),
            urlencoded(&q),
            page_size.clamp(1, 100),
            offset
        );
        let mut request = ctx.request(url);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        let resp = self
            .gateway
            .fetch(request)
            .await
            .map_err(|e| super::fetch_error(SourceId::Core, e))?;
        let envelope: SearchEnvelope = super::parse_json(SourceId::Core, &resp.body)?;

        let articles: Vec<UnifiedArticle> = envelope
            .results
            .iter()
            .filter_map(transform::core::from_work)
            .collect();
        let total = envelope.total_hits;
        let next = offset + articles.len() as u64;
        Ok(SearchOutcome {
            cursor: match total {
                Some(t) if next < t && !articles.is_empty() => Some(Cursor::Offset(next)),
                _ => None,
            },
            total,
            articles,
            unsupported_filters,
        })
    }
}
