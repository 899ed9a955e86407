//! PubMed Central full-text adapter (efetch XML). The national archive
//! counterpart to the Europe PMC full-text endpoint.

use std::borrow::Cow;
use std::sync::Arc;

use crate::entities::ArticleId;
use crate::error::LitMcpError;
use crate::gateway::Gateway;

use super::{CallCtx, Capability, FullText, SourceAdapter, SourceId};

const PMC_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const PMC_BASE_ENV: &str = "LITMCP_PMC_BASE";

const CAPABILITIES: &[Capability] = &[Capability::FetchFulltext];

pub struct PmcClient {
    gateway: Arc<Gateway>,
    base: Cow<'static, str>,
}

impl PmcClient {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            base: super::env_base(PMC_BASE, PMC_BASE_ENV),
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
impl SourceAdapter for PmcClient {
    fn id(&self) -> SourceId {
        SourceId::Pmc
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    async fn fetch_fulltext(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Option<FullText>, LitMcpError> {
        let ArticleId::Pmcid(pmcid) = id else {
            return Err(LitMcpError::invalid(format!(
                "pmc requires a PMCID, got \"{}\"",
                id.as_str()
            )));
        };
        let numeric = pmcid.trim_start_matches("PMC");
        let url = format!(
            "{}?db=pmc&id={numeric}&retmode=xml",
            super::join_endpoint(&self.base, "efetch.fcgi")
        );
        let resp = match self.gateway.fetch(ctx.request(url)).await {
            Ok(resp) => resp,
            Err(err) if err.last_status == Some(404) => return Ok(None),
            Err(err) => return Err(super::fetch_error(SourceId::Pmc, err)),
        };
        let xml = String::from_utf8_lossy(&resp.body);
        if xml.trim().is_empty() {
            return Ok(None);
        }
        let sections = super::europepmc::extract_sections(&xml);
        if sections.is_empty() && !xml.contains("<article") {
            // efetch answers 200 with an error body for unknown ids.
            return Ok(None);
        }
        Ok(Some(FullText {
            sections,
            raw: Some(xml.to_string()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetch_fulltext_parses_jats_sections() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/efetch.fcgi"))
            .and(query_param("db", "pmc"))
            .and(query_param("id", "9984800"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<article><body><sec><title>Methods</title><p>Blinded trial.</p></sec></body></article>"#,
            ))
            .mount(&server)
            .await;

        let mut config = GatewayConfig::new("litmcp-test".into());
        config.policies.clear();
        let gateway = Arc::new(Gateway::new(config).unwrap());
        let client = PmcClient::new_for_test(gateway, server.uri());

        let ctx = CallCtx::with_timeout(std::time::Duration::from_secs(10));
        let full = client
            .fetch_fulltext(&ArticleId::Pmcid("PMC9984800".into()), &ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(full.sections.get("Methods").unwrap(), "Blinded trial.");
    }

    #[tokio::test]
    async fn fetch_fulltext_rejects_non_pmcid() {
        let mut config = GatewayConfig::new("litmcp-test".into());
        config.policies.clear();
        let gateway = Arc::new(Gateway::new(config).unwrap());
        let client = PmcClient::new_for_test(gateway, "http://127.0.0.1:1".into());
        let ctx = CallCtx::with_timeout(std::time::Duration::from_secs(1));
        let err = client
            .fetch_fulltext(&ArticleId::Pmid("1".into()), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, LitMcpError::InvalidInput(_)));
    }
}
