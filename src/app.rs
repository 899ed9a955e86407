//! Composition root. Construction order matters: gateway, then adapters,
//! then analyzer and engine, then cache, store, and scheduler, with the
//! tool facade on top. Teardown stops the scheduler first so no new work
//! enters while the rest drains.

use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::analyze::QueryAnalyzer;
use crate::cache::SessionCache;
use crate::config::AppConfig;
use crate::entities::NormalizedQuery;
use crate::error::LitMcpError;
use crate::gateway::{Gateway, GatewayConfig};
use crate::pipeline::{
    ExecOptions, OutputFormat, PipelineConfig, PipelineEngine, PipelineResult,
};
use crate::rank::RankStrategy;
use crate::sched::{ChangeNotifier, LogNotifier, Scheduler};
use crate::sources::{CallCtx, SourceRegistry};
use crate::store::{PipelineStore, SourceRef};

const FACADE_DEADLINE: Duration = Duration::from_secs(90);

pub struct App {
    pub config: AppConfig,
    pub gateway: Arc<Gateway>,
    pub sources: Arc<SourceRegistry>,
    pub analyzer: Arc<QueryAnalyzer>,
    pub engine: Arc<PipelineEngine>,
    pub cache: Arc<SessionCache>,
    pub store: Arc<PipelineStore>,
    pub scheduler: Arc<Scheduler>,
}

/// One `unified_search` invocation. Exactly one of `query` and `pipeline`
/// must be set.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: Option<String>,
    pub pipeline: Option<String>,
    pub session: Option<String>,
    pub sources: Vec<String>,
    pub strategy: Option<String>,
    pub limit: Option<usize>,
    pub format: Option<String>,
}

pub struct SearchReply {
    pub session_id: String,
    pub result: PipelineResult,
    pub format: OutputFormat,
}

impl App {
    pub fn new(config: AppConfig) -> Result<Arc<Self>, LitMcpError> {
        Self::with_notifier(config, Arc::new(LogNotifier))
    }

    pub fn with_notifier(
        config: AppConfig,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Result<Arc<Self>, LitMcpError> {
        let mut gateway_config = GatewayConfig::new(config.user_agent());
        gateway_config.proxy = config.proxy.clone();
        let gateway = Arc::new(Gateway::new(gateway_config)?);

        let sources = Arc::new(SourceRegistry::new(gateway.clone(), &config));
        let analyzer = Arc::new(QueryAnalyzer::new(sources.mesh()));
        let engine = Arc::new(PipelineEngine::new(sources.clone(), analyzer.clone()));
        let cache = Arc::new(SessionCache::new());
        let current_dir = std::env::current_dir()
            .map_err(|e| LitMcpError::Internal(format!("cannot read current dir: {e}")))?;
        let store = Arc::new(PipelineStore::open(&current_dir, config.data_dir.clone()));
        let scheduler = Scheduler::new(store.clone(), engine.clone(), notifier);

        Ok(Arc::new(Self {
            config,
            gateway,
            sources,
            analyzer,
            engine,
            cache,
            store,
            scheduler,
        }))
    }

    /// Start the scheduler loop. Call once at process init.
    pub async fn start_background(&self) -> Result<(), LitMcpError> {
        self.scheduler.init(time::OffsetDateTime::now_utc()).await?;
        self.scheduler.clone().start();
        Ok(())
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    fn requested_format(format: Option<&str>) -> Result<Option<OutputFormat>, LitMcpError> {
        match format.map(str::trim) {
            None | Some("") => Ok(None),
            Some("structured") | Some("json") => Ok(Some(OutputFormat::Structured)),
            Some("table") | Some("markdown") => Ok(Some(OutputFormat::Table)),
            Some(other) => Err(LitMcpError::invalid(format!(
                "Unknown output format \"{other}\". Expected structured or table"
            ))),
        }
    }

    /// An inline pipeline document, as opposed to a saved/file/url
    /// reference: references are single-line names or carry a prefix.
    fn is_inline_pipeline(text: &str) -> bool {
        let text = text.trim();
        if text.starts_with("saved:") || text.starts_with("file:") || text.starts_with("url:") {
            return false;
        }
        if text.contains('\n') || text.starts_with('{') {
            return true;
        }
        crate::store::validate_name(text).is_err()
    }

    pub async fn unified_search(&self, request: SearchRequest) -> Result<SearchReply, LitMcpError> {
        let requested_format = Self::requested_format(request.format.as_deref())?;
        let session_id = request
            .session
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.cache.mint_session_id());
        self.cache.sweep_idle(time::OffsetDateTime::now_utc()).await;

        let query_given = request
            .query
            .as_deref()
            .map(str::trim)
            .is_some_and(|q| !q.is_empty());
        let pipeline_given = request
            .pipeline
            .as_deref()
            .map(str::trim)
            .is_some_and(|p| !p.is_empty());

        let (config, query_hint, origin) = match (query_given, pipeline_given) {
            (true, true) | (false, false) => {
                return Err(LitMcpError::invalid(
                    "Provide exactly one of \"query\" or \"pipeline\"",
                ));
            }
            (true, false) => {
                let text = request.query.as_deref().unwrap_or_default().trim();
                let ctx = CallCtx::with_timeout(Duration::from_secs(15));
                let query = self.analyzer.analyze(text, &ctx).await?;
                let config = self.quick_pipeline(&request, &query)?;
                (config, Some(query), text.to_string())
            }
            (false, true) => {
                let text = request.pipeline.as_deref().unwrap_or_default().trim();
                let (config, origin) = if Self::is_inline_pipeline(text) {
                    (PipelineConfig::parse(text)?, "inline pipeline".to_string())
                } else {
                    let source = SourceRef::parse(text)?;
                    let (body, meta) = self
                        .store
                        .load_source(&source, &self.gateway, &self.config.allowed_url_hosts())
                        .await?;
                    let origin = meta
                        .map(|m| format!("pipeline:{}", m.name))
                        .unwrap_or_else(|| text.to_string());
                    (PipelineConfig::parse(&body)?, origin)
                };
                (config, None, origin)
            }
        };

        let options = ExecOptions {
            deadline: Some(Instant::now() + FACADE_DEADLINE),
            cancel: CancellationToken::new(),
            query_hint,
        };
        let result = self.engine.execute(&config, options).await?;

        let articles: Vec<_> = result.articles.iter().map(|s| s.article.clone()).collect();
        self.cache
            .record_results(&session_id, &origin, &articles)
            .await;

        let format = requested_format.unwrap_or(config.output.format);
        Ok(SearchReply {
            session_id,
            result,
            format,
        })
    }

    /// Synthesized single-search pipeline for the simple query path.
    fn quick_pipeline(
        &self,
        request: &SearchRequest,
        query: &NormalizedQuery,
    ) -> Result<PipelineConfig, LitMcpError> {
        let strategy = match request.strategy.as_deref() {
            Some(s) => RankStrategy::parse(s)?,
            None => RankStrategy::Balanced,
        };
        let limit = request.limit.unwrap_or(20).clamp(1, 100);

        let mut search_params = serde_yaml::Mapping::new();
        search_params.insert("query".into(), query.text.clone().into());
        if !request.sources.is_empty() {
            let sources: Vec<serde_yaml::Value> = request
                .sources
                .iter()
                .map(|s| serde_yaml::Value::from(s.as_str()))
                .collect();
            search_params.insert("sources".into(), serde_yaml::Value::Sequence(sources));
        }
        let mut rank_params = serde_yaml::Mapping::new();
        rank_params.insert("strategy".into(), strategy.as_str().into());
        rank_params.insert("limit".into(), (limit as u64).into());

        let config = PipelineConfig {
            steps: vec![
                crate::pipeline::Step {
                    id: "search".into(),
                    action: crate::pipeline::StepAction::Search,
                    params: serde_yaml::Value::Mapping(search_params),
                    depends_on: None,
                },
                crate::pipeline::Step {
                    id: "rank_results".into(),
                    action: crate::pipeline::StepAction::Rank,
                    params: serde_yaml::Value::Mapping(rank_params),
                    depends_on: None,
                },
            ],
            output: crate::pipeline::OutputSpec {
                format: OutputFormat::Structured,
                limit,
                ranking: strategy,
            },
            ..PipelineConfig::default()
        };
        Ok(config)
    }
}
