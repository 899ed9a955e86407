//! BioThings family adapter (mygene.info, myvariant.info, mychem.info).
//! A gene, variant, or compound term resolves to the publications annotated
//! against it; the records are skeletal (PMID plus provenance) and pick up
//! their bibliography when merged with the index sources.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::entities::{NormalizedQuery, Provenance, PubDate, UnifiedArticle};
use crate::error::LitMcpError;
use crate::gateway::Gateway;

use super::{CallCtx, Capability, Cursor, SearchOutcome, SourceAdapter, SourceId};

const MYGENE_BASE: &str = "https://mygene.info/v3";
const MYGENE_BASE_ENV: &str = "LITMCP_BIOTHINGS_BASE";

const CAPABILITIES: &[Capability] = &[Capability::Search];

pub struct BioThingsClient {
    gateway: Arc<Gateway>,
    base: Cow<'static, str>,
}

#[derive(Debug, Deserialize)]
struct QueryEnvelope {
    total: Option<u64>,
    #[serde(default)]
    hits: Vec<GeneHit>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeneHit {
    #[serde(rename = "_id")]
    id: Option<String>,
    symbol: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    generif: Vec<GeneRif>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeneRif {
    pubmed: Option<serde_json::Value>,
}

/// mygene emits `generif` as an object when there is exactly one entry.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<GeneRif>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(GeneRif),
        Many(Vec<GeneRif>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(v) => vec![v],
        OneOrMany::Many(v) => v,
    })
}

impl BioThingsClient {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            base: super::env_base(MYGENE_BASE, MYGENE_BASE_ENV),
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

fn urlencoded(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn pmid_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) if s.chars().all(|c| c.is_ascii_digit()) => {
            Some(s.clone())
        }
        _ => None,
    }
}

#[async_trait::async_trait]
impl SourceAdapter for BioThingsClient {
    fn id(&self) -> SourceId {
        SourceId::Biothings
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    async fn search(
        &self,
        query: &NormalizedQuery,
        _cursor: Option<Cursor>,
        page_size: usize,
        ctx: &CallCtx,
    ) -> Result<SearchOutcome, LitMcpError> {
        let term = query.text.trim();
        if term.is_empty() {
            return Err(LitMcpError::invalid("biothings search needs a term"));
        }
        // Only the bare term is expressible here.
        let mut unsupported_filters = Vec::new();
        if query.date_from.is_some() || query.date_to.is_some() {
            unsupported_filters.push("date-range");
        }
        if !query.article_types.is_empty() {
            unsupported_filters.push("article-type");
        }
        if query.open_access_only {
            unsupported_filters.push("open-access");
        }
        if query.language.is_some() {
            unsupported_filters.push("language");
        }
        if !query.demographics.is_empty() {
            unsupported_filters.push("demographics");
        }

        let url = format!(
            "{}?q={}&fields=symbol,generif.pubmed&size=3&species=human",
            super::join_endpoint(&self.base, "query"),
            urlencoded(term)
        );
        let resp = self
            .gateway
            .fetch(ctx.request(url))
            .await
            .map_err(|e| super::fetch_error(SourceId::Biothings, e))?;
        let envelope: QueryEnvelope = super::parse_json(SourceId::Biothings, &resp.body)?;

        let mut articles = Vec::new();
        let mut seen = std::collections::HashSet::new();
        'hits: for hit in &envelope.hits {
            let local = hit
                .symbol
                .clone()
                .or_else(|| hit.id.clone())
                .unwrap_or_default();
            for rif in &hit.generif {
                let Some(pmid) = rif.pubmed.as_ref().and_then(pmid_value) else {
                    continue;
                };
                if !seen.insert(pmid.clone()) {
                    continue;
                }
                articles.push(UnifiedArticle {
                    pmid: Some(pmid),
                    pmcid: None,
                    doi: None,
                    other_ids: BTreeMap::new(),
                    title: String::new(),
                    abstract_text: None,
                    authors: Vec::new(),
                    journal: None,
                    pub_date: PubDate::unknown(),
                    publication_types: Vec::new(),
                    language: None,
                    mesh_terms: Vec::new(),
                    links: Vec::new(),
                    citation_count: None,
                    influential_citations: None,
                    impact: None,
                    provenance: vec![Provenance::now(SourceId::Biothings, local.clone())],
                });
                if articles.len() >= page_size {
                    break 'hits;
                }
            }
        }

        Ok(SearchOutcome {
            total: envelope.total,
            cursor: None,
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
    async fn search_yields_skeletal_pmid_records() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(query_param("q", "BRAF"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total": 1,
                "hits": [{
                    "_id": "673",
                    "symbol": "BRAF",
                    "generif": [
                        {"pubmed": 22663011},
                        {"pubmed": "22663011"},
                        {"pubmed": 100}
                    ]
                }]
            })))
            .mount(&server)
            .await;

        let mut config = GatewayConfig::new("litmcp-test".into());
        config.policies.clear();
        let gateway = Arc::new(Gateway::new(config).unwrap());
        let client = BioThingsClient::new_for_test(gateway, server.uri());

        let ctx = CallCtx::with_timeout(std::time::Duration::from_secs(10));
        let outcome = client
            .search(&NormalizedQuery::topic("BRAF"), None, 10, &ctx)
            .await
            .unwrap();
        // Duplicate PMIDs collapse; titles stay empty until merged with an
        // index source.
        assert_eq!(outcome.articles.len(), 2);
        assert!(outcome.articles.iter().all(|a| a.title.is_empty()));
        assert!(outcome.articles.iter().all(|a| a.has_identifier()));
        assert_eq!(outcome.articles[0].provenance[0].local_id, "BRAF");
    }
}
