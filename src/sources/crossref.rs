//! Crossref works adapter. Polite-pool identification goes through the
//! `mailto` query parameter.

use std::borrow::Cow;
use std::sync::Arc;

use serde::Deserialize;

use crate::entities::{ArticleId, NormalizedQuery, PublicationType, UnifiedArticle};
use crate::error::LitMcpError;
use crate::gateway::Gateway;
use crate::transform;

use super::{CallCtx, Capability, Cursor, SearchOutcome, SourceAdapter, SourceId};

const CROSSREF_BASE: &str = "https://api.crossref.org";
const CROSSREF_BASE_ENV: &str = "LITMCP_CROSSREF_BASE";

const CAPABILITIES: &[Capability] = &[
    Capability::Search,
    Capability::FetchOne,
    Capability::FetchReferences,
];

pub struct CrossrefClient {
    gateway: Arc<Gateway>,
    base: Cow<'static, str>,
    mailto: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorksEnvelope {
    message: WorksMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct WorksMessage {
    total_results: Option<u64>,
    #[serde(default)]
    items: Vec<CrossrefWork>,
}

#[derive(Debug, Deserialize)]
struct WorkEnvelope {
    message: CrossrefWork,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CrossrefWork {
    #[serde(rename = "DOI")]
    pub doi: Option<String>,
    #[serde(default)]
    pub title: Vec<String>,
    #[serde(default)]
    pub author: Vec<CrossrefAuthor>,
    #[serde(default)]
    pub container_title: Vec<String>,
    pub issued: Option<CrossrefDate>,
    #[serde(rename = "type")]
    pub work_type: Option<String>,
    pub language: Option<String>,
    pub is_referenced_by_count: Option<u64>,
    #[serde(rename = "URL")]
    pub url: Option<String>,
    #[serde(default)]
    pub link: Vec<CrossrefLink>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub score: Option<f64>,
    #[serde(default)]
    pub reference: Vec<CrossrefReference>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrossrefAuthor {
    pub given: Option<String>,
    pub family: Option<String>,
    #[serde(default)]
    pub affiliation: Vec<CrossrefAffiliation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrossrefAffiliation {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrossrefDate {
    #[serde(rename = "date-parts", default)]
    pub date_parts: Vec<Vec<i32>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrossrefLink {
    #[serde(rename = "URL")]
    pub url: Option<String>,
    #[serde(rename = "content-type")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrossrefReference {
    #[serde(rename = "DOI")]
    pub doi: Option<String>,
}

impl CrossrefClient {
    pub fn new(gateway: Arc<Gateway>, config: &crate::config::AppConfig) -> Self {
        Self {
            gateway,
            base: super::env_base(CROSSREF_BASE, CROSSREF_BASE_ENV),
            mailto: config.crossref_mailto.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(gateway: Arc<Gateway>, base: String) -> Self {
        Self {
            gateway,
            base: Cow::Owned(base),
            mailto: None,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        ctx: &CallCtx,
    ) -> Result<T, LitMcpError> {
        let resp = self
            .gateway
            .fetch(ctx.request(url))
            .await
            .map_err(|e| super::fetch_error(SourceId::Crossref, e))?;
        super::parse_json(SourceId::Crossref, &resp.body)
    }

    fn build_filters(query: &NormalizedQuery) -> (Vec<String>, Vec<&'static str>) {
        let mut filters = Vec::new();
        let mut unsupported = Vec::new();
        if let Some(from) = &query.date_from {
            let (y, m, d) = from.sort_key();
            filters.push(format!("from-pub-date:{y:04}-{m:02}-{d:02}"));
        }
        if let Some(to) = &query.date_to {
            let (y, m, d) = to.sort_key();
            filters.push(format!("until-pub-date:{y:04}-{m:02}-{d:02}"));
        }
        for pt in &query.article_types {
            match pt {
                PublicationType::JournalArticle | PublicationType::ClinicalTrial => {
                    filters.push("type:journal-article".into())
                }
                PublicationType::Preprint => filters.push("type:posted-content".into()),
                _ => unsupported.push("article-type"),
            }
        }
        if query.open_access_only {
            unsupported.push("open-access");
        }
        if query.language.is_some() {
            unsupported.push("language");
        }
        if !query.demographics.is_empty() {
            unsupported.push("demographics");
        }
        (filters, unsupported)
    }
}

fn urlencoded(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' | b','
            | b'/' => out.push(byte as char),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[async_trait::async_trait]
impl SourceAdapter for CrossrefClient {
    fn id(&self) -> SourceId {
        SourceId::Crossref
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
        let text = query.expanded_text();
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(LitMcpError::invalid("crossref search needs a non-empty query"));
        }
        let (filters, unsupported_filters) = Self::build_filters(query);
        let offset = cursor.map(|c| c.offset()).unwrap_or(0);
        let mut url = format!(
            "{}?query={}&rows={}&offset={}",
            super::join_endpoint(&self.base, "works"),
            urlencoded(&text),
            page_size.clamp(1, 100),
            offset
        );
        if !filters.is_empty() {
            url.push_str("&filter=");
            url.push_str(&urlencoded(&filters.join(",")));
        }
        if let Some(mailto) = &self.mailto {
            url.push_str("&mailto=");
            url.push_str(&urlencoded(mailto));
        }
        let envelope: WorksEnvelope = self.get_json(url, ctx).await?;
        let articles: Vec<UnifiedArticle> = envelope
            .message
            .items
            .iter()
            .filter_map(transform::crossref::from_work)
            .collect();
        let total = envelope.message.total_results;
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

    async fn fetch_one(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Option<UnifiedArticle>, LitMcpError> {
        let ArticleId::Doi(doi) = id else {
            return Err(LitMcpError::invalid(format!(
                "crossref requires a DOI, got \"{}\"",
                id.as_str()
            )));
        };
        let url = super::join_endpoint(&self.base, &format!("works/{}", urlencoded(doi)));
        match self.gateway.fetch(ctx.request(url)).await {
            Ok(resp) => {
                let envelope: WorkEnvelope = super::parse_json(SourceId::Crossref, &resp.body)?;
                Ok(transform::crossref::from_work(&envelope.message))
            }
            Err(err) if err.last_status == Some(404) => Ok(None),
            Err(err) => Err(super::fetch_error(SourceId::Crossref, err)),
        }
    }

    async fn fetch_references(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Vec<ArticleId>, LitMcpError> {
        let ArticleId::Doi(doi) = id else {
            return Err(LitMcpError::invalid(format!(
                "crossref requires a DOI, got \"{}\"",
                id.as_str()
            )));
        };
        let url = super::join_endpoint(&self.base, &format!("works/{}", urlencoded(doi)));
        let envelope: WorkEnvelope = self.get_json(url, ctx).await?;
        Ok(envelope
            .message
            .reference
            .into_iter()
            .filter_map(|r| r.doi)
            .filter_map(|d| crate::entities::article::normalize_doi(&d))
            .map(ArticleId::Doi)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server: &MockServer) -> CrossrefClient {
        let mut config = GatewayConfig::new("litmcp-test".into());
        config.policies.clear();
        let gateway = Arc::new(Gateway::new(config).unwrap());
        CrossrefClient::new_for_test(gateway, server.uri())
    }

    #[tokio::test]
    async fn search_parses_message_items() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/works"))
            .and(query_param("query", "remimazolam"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {
                    "total-results": 1,
                    "items": [{
                        "DOI": "10.1186/X",
                        "title": ["Remimazolam study"],
                        "author": [{"given": "Jane", "family": "Doe", "affiliation": []}],
                        "container-title": ["Critical Care"],
                        "issued": {"date-parts": [[2024, 5, 17]]},
                        "type": "journal-article",
                        "is-referenced-by-count": 3,
                        "URL": "https://doi.org/10.1186/X",
                        "score": 42.0
                    }]
                }
            })))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let ctx = CallCtx::with_timeout(std::time::Duration::from_secs(10));
        let outcome = client
            .search(&NormalizedQuery::topic("remimazolam"), None, 20, &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.total, Some(1));
        let a = &outcome.articles[0];
        assert_eq!(a.doi.as_deref(), Some("10.1186/x"));
        assert_eq!(a.authors[0].name, "Jane Doe");
        assert_eq!(a.citation_count, Some(3));
        assert_eq!(a.pub_date.sort_key(), (2024, 5, 17));
    }

    #[tokio::test]
    async fn fetch_references_maps_dois() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/works/10.1186/x"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {
                    "DOI": "10.1186/x",
                    "reference": [{"DOI": "10.1/A"}, {"unstructured": "no doi"}]
                }
            })))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let ctx = CallCtx::with_timeout(std::time::Duration::from_secs(10));
        let refs = client
            .fetch_references(&ArticleId::Doi("10.1186/x".into()), &ctx)
            .await
            .unwrap();
        assert_eq!(refs, vec![ArticleId::Doi("10.1/a".into())]);
    }
}
