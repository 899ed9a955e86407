//! Biomedical thesaurus client (NCBI MeSH via E-utilities). Used by the
//! query analyzer for vocabulary expansion; not an article source.

use std::borrow::Cow;
use std::sync::Arc;

use serde::Deserialize;

use crate::entities::TermExpansion;
use crate::error::LitMcpError;
use crate::gateway::Gateway;

use super::{CallCtx, SourceId};

const MESH_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const MESH_BASE_ENV: &str = "LITMCP_MESH_BASE";

pub struct MeshClient {
    gateway: Arc<Gateway>,
    base: Cow<'static, str>,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ESearchEnvelope {
    esearchresult: ESearchResult,
}

#[derive(Debug, Deserialize)]
struct ESearchResult {
    #[serde(default)]
    idlist: Vec<String>,
}

impl MeshClient {
    pub fn new(gateway: Arc<Gateway>, config: &crate::config::AppConfig) -> Self {
        Self {
            gateway,
            base: super::env_base(MESH_BASE, MESH_BASE_ENV),
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

    fn url(&self, path: &str, params: &str) -> String {
        let mut url = format!("{}?{params}", super::join_endpoint(&self.base, path));
        if let Some(key) = &self.api_key {
            url.push_str("&api_key=");
            url.push_str(key);
        }
        url
    }

    async fn get(&self, url: String, ctx: &CallCtx) -> Result<Vec<u8>, LitMcpError> {
        let resp = self
            .gateway
            .fetch(ctx.request(url))
            .await
            .map_err(|e| super::fetch_error(SourceId::Mesh, e))?;
        Ok(resp.body)
    }

    /// Expand one topic term. `None` means the thesaurus does not know the
    /// term; the caller passes it through unchanged.
    pub async fn expand(
        &self,
        term: &str,
        ctx: &CallCtx,
    ) -> Result<Option<TermExpansion>, LitMcpError> {
        let term = term.trim();
        if term.is_empty() {
            return Ok(None);
        }

        let encoded: String = term
            .bytes()
            .map(|b| match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    (b as char).to_string()
                }
                b' ' => "+".to_string(),
                other => format!("%{other:02X}"),
            })
            .collect();

        let url = self.url(
            "esearch.fcgi",
            &format!("db=mesh&term={encoded}&retmode=json&retmax=1"),
        );
        let body = self.get(url, ctx).await?;
        let envelope: ESearchEnvelope = super::parse_json(SourceId::Mesh, &body)?;
        let Some(uid) = envelope.esearchresult.idlist.into_iter().next() else {
            return Ok(None);
        };

        let url = self.url("esummary.fcgi", &format!("db=mesh&id={uid}&retmode=json"));
        let body = self.get(url, ctx).await?;
        let summary: serde_json::Value = super::parse_json(SourceId::Mesh, &body)?;
        let terms: Vec<String> = summary
            .get("result")
            .and_then(|r| r.get(&uid))
            .and_then(|e| e.get("ds_meshterms"))
            .and_then(|t| t.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let Some((preferred, synonyms)) = terms.split_first() else {
            return Ok(None);
        };
        // A small bag is enough for query expansion.
        Ok(Some(TermExpansion {
            preferred: preferred.clone(),
            synonyms: synonyms.iter().take(5).cloned().collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server: &MockServer) -> MeshClient {
        let mut config = GatewayConfig::new("litmcp-test".into());
        config.policies.clear();
        let gateway = Arc::new(Gateway::new(config).unwrap());
        MeshClient::new_for_test(gateway, server.uri())
    }

    #[tokio::test]
    async fn expand_returns_preferred_and_synonyms() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .and(query_param("db", "mesh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "esearchresult": {"idlist": ["68019315"]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/esummary.fcgi"))
            .and(query_param("id", "68019315"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": {
                    "uids": ["68019315"],
                    "68019315": {"ds_meshterms": ["Midazolam", "Versed", "Dormicum"]}
                }
            })))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let ctx = CallCtx::with_timeout(std::time::Duration::from_secs(10));
        let exp = client.expand("midazolam", &ctx).await.unwrap().unwrap();
        assert_eq!(exp.preferred, "Midazolam");
        assert_eq!(exp.synonyms, vec!["Versed", "Dormicum"]);
    }

    #[tokio::test]
    async fn unknown_terms_pass_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "esearchresult": {"idlist": []}
            })))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let ctx = CallCtx::with_timeout(std::time::Duration::from_secs(10));
        assert!(client.expand("zzgibberish", &ctx).await.unwrap().is_none());
    }
}
