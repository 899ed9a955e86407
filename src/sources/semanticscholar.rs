//! Semantic Scholar Graph API adapter. Also the enrichment source for
//! citation metrics (citation count, influential citations, impact).

use std::borrow::Cow;
use std::sync::Arc;

use serde::Deserialize;

use crate::entities::{ArticleId, NormalizedQuery, UnifiedArticle};
use crate::error::LitMcpError;
use crate::gateway::Gateway;
use crate::transform;

use super::{CallCtx, Capability, Cursor, SearchOutcome, SourceAdapter, SourceId};

const S2_BASE: &str = "https://api.semanticscholar.org/graph/v1";
const S2_BASE_ENV: &str = "LITMCP_S2_BASE";

const PAPER_FIELDS: &str = "title,abstract,year,publicationDate,venue,publicationTypes,externalIds,citationCount,influentialCitationCount,isOpenAccess,openAccessPdf,authors";

const CAPABILITIES: &[Capability] = &[
    Capability::Search,
    Capability::FetchOne,
    Capability::FetchReferences,
    Capability::FetchCitations,
];

pub struct SemanticScholarClient {
    gateway: Arc<Gateway>,
    base: Cow<'static, str>,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    total: Option<u64>,
    next: Option<u64>,
    #[serde(default)]
    data: Vec<S2Paper>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S2Paper {
    pub paper_id: Option<String>,
    pub external_ids: Option<S2ExternalIds>,
    pub title: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub venue: Option<String>,
    pub year: Option<i32>,
    pub publication_date: Option<String>,
    pub publication_types: Option<Vec<String>>,
    pub citation_count: Option<u64>,
    pub influential_citation_count: Option<u64>,
    pub is_open_access: Option<bool>,
    pub open_access_pdf: Option<S2OpenAccessPdf>,
    #[serde(default)]
    pub authors: Vec<S2Author>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct S2ExternalIds {
    #[serde(rename = "DOI")]
    pub doi: Option<String>,
    pub pub_med: Option<String>,
    pub pub_med_central: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S2OpenAccessPdf {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S2Author {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LinkedPapersEnvelope {
    #[serde(default)]
    data: Vec<LinkedPaperEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkedPaperEntry {
    citing_paper: Option<S2Paper>,
    cited_paper: Option<S2Paper>,
}

impl SemanticScholarClient {
    pub fn new(gateway: Arc<Gateway>, config: &crate::config::AppConfig) -> Self {
        Self {
            gateway,
            base: super::env_base(S2_BASE, S2_BASE_ENV),
            api_key: config.s2_api_key.clone(),
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

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        ctx: &CallCtx,
    ) -> Result<T, LitMcpError> {
        let mut request = ctx.request(url);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key.clone());
        }
        let resp = self
            .gateway
            .fetch(request)
            .await
            .map_err(|e| super::fetch_error(SourceId::Semanticscholar, e))?;
        super::parse_json(SourceId::Semanticscholar, &resp.body)
    }

    /// Path id S2 accepts: `PMID:…`, `PMCID:…`, or `DOI:…`.
    fn paper_path(id: &ArticleId) -> String {
        match id {
            ArticleId::Pmid(pmid) => format!("paper/PMID:{pmid}"),
            ArticleId::Pmcid(pmcid) => format!("paper/PMCID:{pmcid}"),
            ArticleId::Doi(doi) => format!("paper/DOI:{doi}"),
        }
    }

    async fn linked(
        &self,
        id: &ArticleId,
        edge: &str,
        ctx: &CallCtx,
    ) -> Result<Vec<ArticleId>, LitMcpError> {
        let url = format!(
            "{}/{edge}?fields=externalIds&limit=100",
            super::join_endpoint(&self.base, &Self::paper_path(id))
        );
        let envelope: LinkedPapersEnvelope = self.get_json(url, ctx).await?;
        Ok(envelope
            .data
            .into_iter()
            .filter_map(|entry| entry.citing_paper.or(entry.cited_paper))
            .filter_map(|paper| transform::semanticscholar::paper_id(&paper))
            .collect())
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
impl SourceAdapter for SemanticScholarClient {
    fn id(&self) -> SourceId {
        SourceId::Semanticscholar
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
            return Err(LitMcpError::invalid(
                "semanticscholar search needs a non-empty query",
            ));
        }
        // S2 paper search takes free text only; structured filters are
        // reported back so the ranker can discount this source.
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
        if query.open_access_only {
            unsupported_filters.push("open-access");
        }
        if !query.demographics.is_empty() {
            unsupported_filters.push("demographics");
        }

        let offset = cursor.map(|c| c.offset()).unwrap_or(0);
        let url = format!(
            "{}?query={}&offset={}&limit={}&fields={}",
            super::join_endpoint(&self.base, "paper/search"),
            urlencoded(&text),
            offset,
            page_size.clamp(1, 100),
            PAPER_FIELDS
        );
        let envelope: SearchEnvelope = self.get_json(url, ctx).await?;
        let articles: Vec<UnifiedArticle> = envelope
            .data
            .iter()
            .filter_map(transform::semanticscholar::from_paper)
            .collect();
        Ok(SearchOutcome {
            cursor: envelope
                .next
                .filter(|_| !articles.is_empty())
                .map(Cursor::Offset),
            total: envelope.total,
            articles,
            unsupported_filters,
        })
    }

    async fn fetch_one(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Option<UnifiedArticle>, LitMcpError> {
        let url = format!(
            "{}?fields={}",
            super::join_endpoint(&self.base, &Self::paper_path(id)),
            PAPER_FIELDS
        );
        let mut request = ctx.request(url);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key.clone());
        }
        match self.gateway.fetch(request).await {
            Ok(resp) => {
                let paper: S2Paper = super::parse_json(SourceId::Semanticscholar, &resp.body)?;
                Ok(transform::semanticscholar::from_paper(&paper))
            }
            Err(err) if err.last_status == Some(404) => Ok(None),
            Err(err) => Err(super::fetch_error(SourceId::Semanticscholar, err)),
        }
    }

    async fn fetch_references(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Vec<ArticleId>, LitMcpError> {
        self.linked(id, "references", ctx).await
    }

    async fn fetch_citations(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Vec<ArticleId>, LitMcpError> {
        self.linked(id, "citations", ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server: &MockServer) -> SemanticScholarClient {
        let mut config = GatewayConfig::new("litmcp-test".into());
        config.policies.clear();
        let gateway = Arc::new(Gateway::new(config).unwrap());
        SemanticScholarClient::new_for_test(gateway, server.uri())
    }

    #[tokio::test]
    async fn search_reports_structured_filters_unsupported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/search"))
            .and(query_param("query", "remimazolam"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total": 1,
                "next": 1,
                "data": [{
                    "paperId": "abc123",
                    "title": "Remimazolam",
                    "year": 2023,
                    "citationCount": 40,
                    "influentialCitationCount": 4,
                    "externalIds": {"DOI": "10.1/x", "PubMed": "22663011"},
                    "authors": [{"name": "Jane Doe"}]
                }]
            })))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let mut q = NormalizedQuery::topic("remimazolam");
        q.open_access_only = true;
        let ctx = CallCtx::with_timeout(std::time::Duration::from_secs(10));
        let outcome = client.search(&q, None, 10, &ctx).await.unwrap();
        assert_eq!(outcome.unsupported_filters, vec!["open-access"]);
        let a = &outcome.articles[0];
        assert_eq!(a.pmid.as_deref(), Some("22663011"));
        assert_eq!(a.citation_count, Some(40));
        assert_eq!(a.influential_citations, Some(4));
        assert!(matches!(outcome.cursor, Some(Cursor::Offset(1))));
    }

    #[tokio::test]
    async fn fetch_citations_follows_citing_papers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/paper/PMID:22663011/citations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"citingPaper": {"externalIds": {"PubMed": "100"}}},
                    {"citingPaper": {"externalIds": {"DOI": "10.1/y"}}}
                ]
            })))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let ctx = CallCtx::with_timeout(std::time::Duration::from_secs(10));
        let ids = client
            .fetch_citations(&ArticleId::Pmid("22663011".into()), &ctx)
            .await
            .unwrap();
        assert_eq!(
            ids,
            vec![
                ArticleId::Pmid("100".into()),
                ArticleId::Doi("10.1/y".into())
            ]
        );
    }
}
