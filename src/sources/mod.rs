//! One adapter per external service, plus the shared capability surface
//! the pipeline engine programs against. Adapters translate a
//! [`NormalizedQuery`] into their own wire form and hand raw records to
//! `transform`; they hold no state between calls.

pub mod biothings;
pub mod core;
pub mod crossref;
pub mod europepmc;
pub mod mesh;
pub mod openalex;
pub mod openi;
pub mod pmc;
pub mod pubmed;
pub mod semanticscholar;

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::entities::{ArticleId, NormalizedQuery, UnifiedArticle};
use crate::error::LitMcpError;
use crate::gateway::{FetchError, FetchErrorKind, FetchRequest, Gateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    Pubmed,
    Pmc,
    Europepmc,
    Openalex,
    Semanticscholar,
    Crossref,
    Core,
    Biothings,
    Mesh,
    Openi,
}

impl SourceId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pubmed => "pubmed",
            Self::Pmc => "pmc",
            Self::Europepmc => "europepmc",
            Self::Openalex => "openalex",
            Self::Semanticscholar => "semanticscholar",
            Self::Crossref => "crossref",
            Self::Core => "core",
            Self::Biothings => "biothings",
            Self::Mesh => "mesh",
            Self::Openi => "openi",
        }
    }

    pub fn parse(value: &str) -> Result<Self, LitMcpError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pubmed" => Ok(Self::Pubmed),
            "pmc" => Ok(Self::Pmc),
            "europepmc" | "europe-pmc" => Ok(Self::Europepmc),
            "openalex" => Ok(Self::Openalex),
            "semanticscholar" | "s2" => Ok(Self::Semanticscholar),
            "crossref" => Ok(Self::Crossref),
            "core" => Ok(Self::Core),
            "biothings" => Ok(Self::Biothings),
            "mesh" => Ok(Self::Mesh),
            "openi" => Ok(Self::Openi),
            other => Err(LitMcpError::invalid(format!(
                "Unknown source \"{other}\". Available: pubmed, pmc, europepmc, openalex, semanticscholar, crossref, core, biothings, mesh, openi"
            ))),
        }
    }

    /// Merge authority: when two sources disagree on a bibliographic field,
    /// the higher-ranked source wins.
    pub fn authority(self) -> u8 {
        match self {
            Self::Pubmed => 9,
            Self::Pmc => 8,
            Self::Europepmc => 7,
            Self::Crossref => 6,
            Self::Openalex => 5,
            Self::Semanticscholar => 4,
            Self::Core => 3,
            Self::Biothings => 2,
            Self::Mesh | Self::Openi => 1,
        }
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sources queried when a search names none explicitly.
pub const DEFAULT_SEARCH_SOURCES: &[SourceId] = &[
    SourceId::Pubmed,
    SourceId::Europepmc,
    SourceId::Openalex,
    SourceId::Semanticscholar,
    SourceId::Crossref,
    SourceId::Core,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Search,
    FetchOne,
    FetchReferences,
    FetchCitations,
    FetchFulltext,
}

/// Pagination handle. Opaque to the engine; adapters that cannot mint a
/// token fall back to an offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cursor {
    Token(String),
    Offset(u64),
}

impl Cursor {
    pub fn offset(&self) -> u64 {
        match self {
            Self::Offset(n) => *n,
            Self::Token(_) => 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct SearchOutcome {
    pub articles: Vec<UnifiedArticle>,
    pub total: Option<u64>,
    pub cursor: Option<Cursor>,
    /// Filters this source could not express; the ranker discounts the
    /// source's contribution accordingly.
    pub unsupported_filters: Vec<&'static str>,
}

#[derive(Debug, Clone, Default)]
pub struct FullText {
    pub sections: BTreeMap<String, String>,
    pub raw: Option<String>,
}

/// Deadline and cancellation for one adapter call, inherited from the
/// pipeline step that issued it.
#[derive(Debug, Clone)]
pub struct CallCtx {
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl CallCtx {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn child(&self) -> Self {
        self.clone()
    }

    pub fn request(&self, url: impl Into<String>) -> FetchRequest {
        FetchRequest::get(url)
            .deadline(self.deadline)
            .cancel_token(self.cancel.clone())
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> SourceId;
    fn capabilities(&self) -> &'static [Capability];

    async fn search(
        &self,
        query: &NormalizedQuery,
        cursor: Option<Cursor>,
        page_size: usize,
        ctx: &CallCtx,
    ) -> Result<SearchOutcome, LitMcpError> {
        let _ = (query, cursor, page_size, ctx);
        Err(unsupported(self.id(), "search"))
    }

    async fn fetch_one(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Option<UnifiedArticle>, LitMcpError> {
        let _ = (id, ctx);
        Err(unsupported(self.id(), "fetch_one"))
    }

    async fn fetch_references(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Vec<ArticleId>, LitMcpError> {
        let _ = (id, ctx);
        Err(unsupported(self.id(), "fetch_references"))
    }

    async fn fetch_citations(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Vec<ArticleId>, LitMcpError> {
        let _ = (id, ctx);
        Err(unsupported(self.id(), "fetch_citations"))
    }

    async fn fetch_fulltext(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Option<FullText>, LitMcpError> {
        let _ = (id, ctx);
        Err(unsupported(self.id(), "fetch_fulltext"))
    }
}

pub(crate) fn unsupported(id: SourceId, capability: &str) -> LitMcpError {
    LitMcpError::invalid(format!("{id} does not support {capability}"))
}

/// Base-URL override hook used by tests to point an adapter at a mock
/// server.
pub(crate) fn env_base(default: &'static str, env: &str) -> Cow<'static, str> {
    match std::env::var(env) {
        Ok(value) if !value.trim().is_empty() => Cow::Owned(value.trim().to_string()),
        _ => Cow::Borrowed(default),
    }
}

pub(crate) fn join_endpoint(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Map a gateway failure into the error taxonomy, tagged with the source.
pub(crate) fn fetch_error(source: SourceId, err: FetchError) -> LitMcpError {
    let message = err.to_string();
    match err.kind {
        FetchErrorKind::Network | FetchErrorKind::Timeout | FetchErrorKind::RateLimitTimeout => {
            LitMcpError::transient(source.as_str(), message)
        }
        FetchErrorKind::Cancelled => LitMcpError::Cancelled,
        _ => LitMcpError::upstream(source.as_str(), message),
    }
}

pub(crate) fn parse_json<T: DeserializeOwned>(
    source: SourceId,
    body: &[u8],
) -> Result<T, LitMcpError> {
    serde_json::from_slice(body).map_err(|e| {
        LitMcpError::upstream(
            source.as_str(),
            format!(
                "Invalid JSON response: {} ({e})",
                crate::gateway::body_excerpt(body)
            ),
        )
    })
}

/// All adapters plus the thesaurus client, built once at startup.
pub struct SourceRegistry {
    adapters: HashMap<SourceId, Arc<dyn SourceAdapter>>,
    mesh: Arc<mesh::MeshClient>,
}

impl SourceRegistry {
    pub fn new(gateway: Arc<Gateway>, config: &AppConfig) -> Self {
        let mut adapters: HashMap<SourceId, Arc<dyn SourceAdapter>> = HashMap::new();
        adapters.insert(
            SourceId::Pubmed,
            Arc::new(pubmed::PubmedClient::new(gateway.clone(), config)),
        );
        adapters.insert(
            SourceId::Pmc,
            Arc::new(pmc::PmcClient::new(gateway.clone())),
        );
        adapters.insert(
            SourceId::Europepmc,
            Arc::new(europepmc::EuropePmcClient::new(gateway.clone())),
        );
        adapters.insert(
            SourceId::Openalex,
            Arc::new(openalex::OpenAlexClient::new(gateway.clone(), config)),
        );
        adapters.insert(
            SourceId::Semanticscholar,
            Arc::new(semanticscholar::SemanticScholarClient::new(
                gateway.clone(),
                config,
            )),
        );
        adapters.insert(
            SourceId::Crossref,
            Arc::new(crossref::CrossrefClient::new(gateway.clone(), config)),
        );
        adapters.insert(
            SourceId::Core,
            Arc::new(core::CoreClient::new(gateway.clone(), config)),
        );
        adapters.insert(
            SourceId::Biothings,
            Arc::new(biothings::BioThingsClient::new(gateway.clone())),
        );
        adapters.insert(
            SourceId::Openi,
            Arc::new(openi::OpenIClient::new(gateway.clone())),
        );
        let mesh = Arc::new(mesh::MeshClient::new(gateway, config));
        Self { adapters, mesh }
    }

    /// Registry with hand-picked adapters, for tests that point individual
    /// sources at mock servers.
    #[cfg(test)]
    pub(crate) fn with_adapters(
        adapters: HashMap<SourceId, Arc<dyn SourceAdapter>>,
        mesh: Arc<mesh::MeshClient>,
    ) -> Self {
        Self { adapters, mesh }
    }

    pub fn get(&self, id: SourceId) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&id).cloned()
    }

    pub fn mesh(&self) -> Arc<mesh::MeshClient> {
        self.mesh.clone()
    }

    /// The subset of `requested` that can search, in request order.
    pub fn search_sources(&self, requested: &[SourceId]) -> Vec<Arc<dyn SourceAdapter>> {
        requested
            .iter()
            .filter_map(|id| self.get(*id))
            .filter(|a| a.capabilities().contains(&Capability::Search))
            .collect()
    }

    /// Every source offering `capability`, most authoritative first. Fetch
    /// steps program against this surface instead of naming adapters;
    /// callers try each in order and fall through on failure.
    pub fn capable_sources(&self, capability: Capability) -> Vec<Arc<dyn SourceAdapter>> {
        let mut out: Vec<Arc<dyn SourceAdapter>> = self
            .adapters
            .values()
            .filter(|a| a.capabilities().contains(&capability))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.id()
                .authority()
                .cmp(&a.id().authority())
                .then_with(|| a.id().as_str().cmp(b.id().as_str()))
        });
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SourceId, &Arc<dyn SourceAdapter>)> {
        self.adapters.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_round_trips_through_parse() {
        for id in [
            SourceId::Pubmed,
            SourceId::Pmc,
            SourceId::Europepmc,
            SourceId::Openalex,
            SourceId::Semanticscholar,
            SourceId::Crossref,
            SourceId::Core,
            SourceId::Biothings,
            SourceId::Mesh,
            SourceId::Openi,
        ] {
            assert_eq!(SourceId::parse(id.as_str()).unwrap(), id);
        }
        assert!(SourceId::parse("scihub").is_err());
    }

    #[test]
    fn authority_prefers_the_national_index() {
        assert!(SourceId::Pubmed.authority() > SourceId::Europepmc.authority());
        assert!(SourceId::Europepmc.authority() > SourceId::Core.authority());
    }

    #[test]
    fn capable_sources_order_by_authority() {
        let gateway = Arc::new(
            crate::gateway::Gateway::new(crate::gateway::GatewayConfig::new(
                "litmcp-test".into(),
            ))
            .unwrap(),
        );
        let registry = SourceRegistry::new(gateway, &crate::config::AppConfig::default());

        let refs: Vec<SourceId> = registry
            .capable_sources(Capability::FetchReferences)
            .iter()
            .map(|a| a.id())
            .collect();
        assert_eq!(
            refs,
            vec![
                SourceId::Pubmed,
                SourceId::Europepmc,
                SourceId::Crossref,
                SourceId::Openalex,
                SourceId::Semanticscholar,
            ]
        );

        let fulltext: Vec<SourceId> = registry
            .capable_sources(Capability::FetchFulltext)
            .iter()
            .map(|a| a.id())
            .collect();
        assert_eq!(fulltext, vec![SourceId::Pmc, SourceId::Europepmc]);
    }

    #[test]
    fn join_endpoint_normalizes_slashes() {
        assert_eq!(
            join_endpoint("https://api.example.org/", "/works"),
            "https://api.example.org/works"
        );
    }
}
