//! OpenAlex works adapter. Cursor-paged JSON; relevance scores are kept as
//! raw per-source scores for the ranker.

use std::borrow::Cow;
use std::sync::Arc;

use serde::Deserialize;

use crate::entities::{ArticleId, NormalizedQuery, PublicationType, UnifiedArticle};
use crate::error::LitMcpError;
use crate::gateway::Gateway;
use crate::transform;

use super::{CallCtx, Capability, Cursor, SearchOutcome, SourceAdapter, SourceId};

const OPENALEX_BASE: &str = "https://api.openalex.org";
const OPENALEX_BASE_ENV: &str = "LITMCP_OPENALEX_BASE";

const CAPABILITIES: &[Capability] = &[
    Capability::Search,
    Capability::FetchOne,
    Capability::FetchReferences,
    Capability::FetchCitations,
];

pub struct OpenAlexClient {
    gateway: Arc<Gateway>,
    base: Cow<'static, str>,
    mailto: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorksEnvelope {
    meta: Option<WorksMeta>,
    #[serde(default)]
    results: Vec<OpenAlexWork>,
}

#[derive(Debug, Deserialize)]
struct WorksMeta {
    count: Option<u64>,
    next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenAlexWork {
    pub id: Option<String>,
    pub doi: Option<String>,
    pub display_name: Option<String>,
    pub publication_year: Option<i32>,
    pub publication_date: Option<String>,
    pub language: Option<String>,
    #[serde(rename = "type")]
    pub work_type: Option<String>,
    pub cited_by_count: Option<u64>,
    pub relevance_score: Option<f64>,
    pub open_access: Option<OpenAlexOpenAccess>,
    #[serde(default)]
    pub authorships: Vec<OpenAlexAuthorship>,
    pub primary_location: Option<OpenAlexLocation>,
    pub ids: Option<OpenAlexIds>,
    #[serde(default)]
    pub referenced_works: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAlexOpenAccess {
    pub is_oa: Option<bool>,
    pub oa_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAlexAuthorship {
    pub author: Option<OpenAlexAuthor>,
    #[serde(default)]
    pub institutions: Vec<OpenAlexInstitution>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAlexAuthor {
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAlexInstitution {
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAlexLocation {
    pub source: Option<OpenAlexSource>,
    pub landing_page_url: Option<String>,
    pub pdf_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAlexSource {
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAlexIds {
    pub pmid: Option<String>,
    pub pmcid: Option<String>,
}

impl OpenAlexClient {
    pub fn new(gateway: Arc<Gateway>, config: &crate::config::AppConfig) -> Self {
        Self {
            gateway,
            base: super::env_base(OPENALEX_BASE, OPENALEX_BASE_ENV),
            mailto: config.email.clone(),
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
            .map_err(|e| super::fetch_error(SourceId::Openalex, e))?;
        super::parse_json(SourceId::Openalex, &resp.body)
    }

    fn build_filter(query: &NormalizedQuery) -> (Vec<String>, Vec<&'static str>) {
        let mut filters = Vec::new();
        let mut unsupported = Vec::new();

        if let Some(from) = &query.date_from {
            let (y, m, d) = from.sort_key();
            filters.push(format!("from_publication_date:{y:04}-{m:02}-{d:02}"));
        }
        if let Some(to) = &query.date_to {
            let (y, m, d) = to.sort_key();
            filters.push(format!("to_publication_date:{y:04}-{m:02}-{d:02}"));
        }
        if query.open_access_only {
            filters.push("is_oa:true".into());
        }
        if let Some(lang) = &query.language {
            // OpenAlex wants two-letter codes.
            let code = match lang.to_ascii_lowercase().as_str() {
                "eng" | "en" | "english" => "en".to_string(),
                other => other.chars().take(2).collect(),
            };
            filters.push(format!("language:{code}"));
        }
        for pt in &query.article_types {
            let t = match pt {
                PublicationType::Review => Some("review"),
                PublicationType::JournalArticle | PublicationType::ClinicalTrial => {
                    Some("article")
                }
                PublicationType::Preprint => Some("preprint"),
                PublicationType::Editorial => Some("editorial"),
                PublicationType::Letter => Some("letter"),
                _ => None,
            };
            match t {
                Some(t) => filters.push(format!("type:{t}")),
                None => unsupported.push("article-type"),
            }
        }
        if !query.demographics.is_empty() {
            unsupported.push("demographics");
        }
        (filters, unsupported)
    }

    fn id_path(id: &ArticleId) -> String {
        match id {
            ArticleId::Pmid(pmid) => format!("works/pmid:{pmid}"),
            ArticleId::Pmcid(pmcid) => format!("works/pmcid:{pmcid}"),
            ArticleId::Doi(doi) => format!("works/doi:{doi}"),
        }
    }
}

fn urlencoded(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' | b',' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[async_trait::async_trait]
impl SourceAdapter for OpenAlexClient {
    fn id(&self) -> SourceId {
        SourceId::Openalex
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
            return Err(LitMcpError::invalid("openalex search needs a non-empty query"));
        }
        let (filters, unsupported_filters) = Self::build_filter(query);

        let mut url = format!(
            "{}?search={}&per-page={}",
            super::join_endpoint(&self.base, "works"),
            urlencoded(&text),
            page_size.clamp(1, 100)
        );
        if !filters.is_empty() {
            url.push_str("&filter=");
            url.push_str(&urlencoded(&filters.join(",")));
        }
        let cursor_value = match &cursor {
            Some(Cursor::Token(token)) => token.clone(),
            _ => "*".to_string(),
        };
        url.push_str("&cursor=");
        url.push_str(&urlencoded(&cursor_value));
        if let Some(mailto) = &self.mailto {
            url.push_str("&mailto=");
            url.push_str(&urlencoded(mailto));
        }

        let envelope: WorksEnvelope = self.get_json(url, ctx).await?;
        let articles: Vec<UnifiedArticle> = envelope
            .results
            .iter()
            .filter_map(transform::openalex::from_work)
            .collect();
        let meta = envelope.meta;
        let next_cursor = meta.as_ref().and_then(|m| m.next_cursor.clone());
        Ok(SearchOutcome {
            cursor: next_cursor
                .filter(|_| !articles.is_empty())
                .map(Cursor::Token),
            total: meta.and_then(|m| m.count),
            articles,
            unsupported_filters,
        })
    }

    async fn fetch_one(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Option<UnifiedArticle>, LitMcpError> {
        let url = super::join_endpoint(&self.base, &Self::id_path(id));
        let resp = self.gateway.fetch(ctx.request(url)).await;
        match resp {
            Ok(resp) => {
                let work: OpenAlexWork = super::parse_json(SourceId::Openalex, &resp.body)?;
                Ok(transform::openalex::from_work(&work))
            }
            Err(err) if err.last_status == Some(404) => Ok(None),
            Err(err) => Err(super::fetch_error(SourceId::Openalex, err)),
        }
    }

    async fn fetch_references(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Vec<ArticleId>, LitMcpError> {
        // OpenAlex lists referenced works as OpenAlex ids; resolve the DOIs
        // the engine can use from the work body itself.
        let url = format!(
            "{}?select=referenced_works",
            super::join_endpoint(&self.base, &Self::id_path(id))
        );
        let work: OpenAlexWork = self.get_json(url, ctx).await?;
        let mut out = Vec::new();
        for w in work.referenced_works.iter().take(50) {
            if let Some(doi) = self.work_doi(w, ctx).await {
                out.push(ArticleId::Doi(doi));
            }
        }
        Ok(out)
    }

    async fn fetch_citations(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Vec<ArticleId>, LitMcpError> {
        // Works citing this one: filter=cites:<openalex id of the work>.
        let this = self.fetch_one(id, ctx).await?;
        let Some(openalex_id) = this
            .as_ref()
            .and_then(|a| a.other_ids.get(SourceId::Openalex.as_str()))
        else {
            return Ok(Vec::new());
        };
        let url = format!(
            "{}?filter=cites:{}&per-page=50&select=doi,ids",
            super::join_endpoint(&self.base, "works"),
            urlencoded(openalex_id)
        );
        let envelope: WorksEnvelope = self.get_json(url, ctx).await?;
        Ok(envelope
            .results
            .iter()
            .filter_map(|w| {
                w.ids
                    .as_ref()
                    .and_then(|ids| ids.pmid.as_deref())
                    .and_then(transform::openalex::strip_pmid_url)
                    .map(ArticleId::Pmid)
                    .or_else(|| {
                        w.doi
                            .as_deref()
                            .and_then(crate::entities::article::normalize_doi)
                            .map(ArticleId::Doi)
                    })
            })
            .collect())
    }
}

impl OpenAlexClient {
    pub(crate) async fn work_doi(&self, openalex_id: &str, ctx: &CallCtx) -> Option<String> {
        let short = openalex_id.rsplit('/').next().unwrap_or(openalex_id);
        let url = format!(
            "{}?select=doi",
            super::join_endpoint(&self.base, &format!("works/{short}"))
        );
        let work: OpenAlexWork = self.get_json(url, ctx).await.ok()?;
        work.doi
            .as_deref()
            .and_then(crate::entities::article::normalize_doi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server: &MockServer) -> OpenAlexClient {
        let mut config = GatewayConfig::new("litmcp-test".into());
        config.policies.clear();
        let gateway = Arc::new(Gateway::new(config).unwrap());
        OpenAlexClient::new_for_test(gateway, server.uri())
    }

    #[tokio::test]
    async fn search_passes_filters_and_parses_works() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/works"))
            .and(query_param("search", "remimazolam"))
            .and(query_param("filter", "is_oa:true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "meta": {"count": 1, "next_cursor": null},
                "results": [{
                    "id": "https://openalex.org/W2741809807",
                    "doi": "https://doi.org/10.1186/x",
                    "display_name": "Remimazolam study",
                    "publication_year": 2023,
                    "publication_date": "2023-02-01",
                    "cited_by_count": 7,
                    "relevance_score": 12.5,
                    "open_access": {"is_oa": true, "oa_url": "https://example.org/oa.pdf"},
                    "authorships": [{"author": {"display_name": "Jane Doe"}, "institutions": []}],
                    "ids": {"pmid": "https://pubmed.ncbi.nlm.nih.gov/22663011"}
                }]
            })))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let mut q = NormalizedQuery::topic("remimazolam");
        q.open_access_only = true;
        let ctx = CallCtx::with_timeout(std::time::Duration::from_secs(10));
        let outcome = client.search(&q, None, 25, &ctx).await.unwrap();
        assert_eq!(outcome.total, Some(1));
        let a = &outcome.articles[0];
        assert_eq!(a.pmid.as_deref(), Some("22663011"));
        assert_eq!(a.doi.as_deref(), Some("10.1186/x"));
        assert_eq!(a.citation_count, Some(7));
        assert_eq!(a.provenance[0].raw_score, Some(12.5));
        assert!(a.has_open_access_link());
    }

    #[tokio::test]
    async fn fetch_citations_keeps_url_form_pmids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/works/doi:10.1186/x"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "https://openalex.org/W1",
                "doi": "https://doi.org/10.1186/x"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/works"))
            .and(query_param("filter", "cites:W1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "meta": {"count": 1, "next_cursor": null},
                "results": [{
                    "id": "https://openalex.org/W2",
                    "ids": {"pmid": "https://pubmed.ncbi.nlm.nih.gov/22663011"}
                }]
            })))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let ctx = CallCtx::with_timeout(std::time::Duration::from_secs(10));
        let ids = client
            .fetch_citations(&ArticleId::Doi("10.1186/x".into()), &ctx)
            .await
            .unwrap();
        assert_eq!(ids, vec![ArticleId::Pmid("22663011".into())]);
    }

    #[test]
    fn build_filter_maps_language_to_two_letter_code() {
        let mut q = NormalizedQuery::topic("x");
        q.language = Some("eng".into());
        let (filters, _) = OpenAlexClient::build_filter(&q);
        assert!(filters.contains(&"language:en".to_string()));
    }
}
