//! Open-i adapter (NLM open-access image repository). Results are articles
//! with figure links; everything it serves is open access.

use std::borrow::Cow;
use std::sync::Arc;

use serde::Deserialize;

use crate::entities::{NormalizedQuery, UnifiedArticle};
use crate::error::LitMcpError;
use crate::gateway::Gateway;
use crate::transform;

use super::{CallCtx, Capability, Cursor, SearchOutcome, SourceAdapter, SourceId};

const OPENI_BASE: &str = "https://openi.nlm.nih.gov";
const OPENI_BASE_ENV: &str = "LITMCP_OPENI_BASE";

const CAPABILITIES: &[Capability] = &[Capability::Search];

pub struct OpenIClient {
    gateway: Arc<Gateway>,
    base: Cow<'static, str>,
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    total: Option<u64>,
    #[serde(default)]
    list: Vec<OpenIRecord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenIRecord {
    pub uid: Option<String>,
    pub pmid: Option<String>,
    pub pmcid: Option<String>,
    pub title: Option<String>,
    pub authors: Option<String>,
    pub journal_title: Option<String>,
    pub journal_date: Option<OpenIDate>,
    #[serde(rename = "imgLarge")]
    pub img_large: Option<String>,
    #[serde(rename = "detailedQueryURL")]
    pub detail_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenIDate {
    pub year: Option<serde_json::Value>,
}

impl OpenIClient {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            base: super::env_base(OPENI_BASE, OPENI_BASE_ENV),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(gateway: Arc<Gateway>, base: String) -> Self {
        Self {
            gateway,
            base: Cow::Owned(base),
        }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for OpenIClient {
    fn id(&self) -> SourceId {
        SourceId::Openi
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
        let text = query.text.trim();
        if text.is_empty() {
            return Err(LitMcpError::invalid("openi search needs a non-empty query"));
        }
        let mut unsupported_filters = Vec::new();
        if query.date_from.is_some() || query.date_to.is_some() {
            unsupported_filters.push("date-range");
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

        let encoded: String = text
            .bytes()
            .map(|b| match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    (b as char).to_string()
                }
                other => format!("%{other:02X}"),
            })
            .collect();
        // Open-i pages with inclusive 1-based m..n bounds.
        let start = cursor.map(|c| c.offset()).unwrap_or(0);
        let url = format!(
            "{}?query={}&m={}&n={}",
            super::join_endpoint(&self.base, "api/search"),
            encoded,
            start + 1,
            start + page_size as u64
        );
        let resp = self
            .gateway
            .fetch(ctx.request(url))
            .await
            .map_err(|e| super::fetch_error(SourceId::Openi, e))?;
        let envelope: SearchEnvelope = super::parse_json(SourceId::Openi, &resp.body)?;

        let articles: Vec<UnifiedArticle> = envelope
            .list
            .iter()
            .filter_map(|r| transform::openi::from_record(r, &self.base))
            .collect();
        let total = envelope.total;
        let next = start + articles.len() as u64;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn search_uses_one_based_page_bounds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/search"))
            .and(query_param("m", "1"))
            .and(query_param("n", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total": 1,
                "list": [{
                    "uid": "PMC123_fig1",
                    "pmid": "22663011",
                    "pmcid": "PMC123",
                    "title": "Figure: sedation depth",
                    "imgLarge": "/img/large/PMC123_fig1.png"
                }]
            })))
            .mount(&server)
            .await;

        let mut config = GatewayConfig::new("litmcp-test".into());
        config.policies.clear();
        let gateway = Arc::new(Gateway::new(config).unwrap());
        let client = OpenIClient::new_for_test(gateway, server.uri());

        let ctx = CallCtx::with_timeout(std::time::Duration::from_secs(10));
        let outcome = client
            .search(&NormalizedQuery::topic("sedation"), None, 10, &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.articles.len(), 1);
        assert_eq!(outcome.articles[0].pmid.as_deref(), Some("22663011"));
        assert!(outcome.articles[0].has_open_access_link());
    }
}
