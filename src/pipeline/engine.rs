//! Pipeline executor. Steps inside one topological level run concurrently;
//! levels run strictly in order. Soft step failures are recorded and leave
//! an empty value behind; fatal failures stop the run with whatever was
//! produced so far.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::analyze::QueryAnalyzer;
use crate::dedup;
use crate::entities::{ArticleId, NormalizedQuery, PubDate, PublicationType, UnifiedArticle};
use crate::error::LitMcpError;
use crate::rank::{self, RankStrategy, ScoredArticle};
use crate::sources::{
    CallCtx, Capability, Cursor, DEFAULT_SEARCH_SOURCES, FullText, SourceAdapter, SourceId,
    SourceRegistry,
};

use super::config::{
    FetchParams, FilterParams, PipelineConfig, RankParams, SearchParams, Step, StepAction,
};
use super::graph;

const SEARCH_STEP_TIMEOUT: Duration = Duration::from_secs(30);
const FULLTEXT_STEP_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_PIPELINE_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_PAGE_SIZE: usize = 25;
/// Cap on per-id fan-out inside fetch and enrich steps.
const MAX_FETCH_IDS: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Partial,
    Failure,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Partial => "partial",
            Self::Failure => "failure",
        }
    }
}

/// What a step hands to its dependents.
#[derive(Debug, Clone)]
enum StepValue {
    Articles(Vec<UnifiedArticle>),
    Ranked(Vec<ScoredArticle>),
    Query(NormalizedQuery),
    Ids(Vec<String>),
    FullTexts(BTreeMap<String, FullText>),
}

impl StepValue {
    fn articles(&self) -> Option<Vec<UnifiedArticle>> {
        match self {
            Self::Articles(a) => Some(a.clone()),
            Self::Ranked(r) => Some(r.iter().map(|s| s.article.clone()).collect()),
            _ => None,
        }
    }

    fn ids(&self) -> Option<Vec<String>> {
        match self {
            Self::Ids(ids) => Some(ids.clone()),
            Self::Articles(a) => Some(a.iter().map(|x| x.primary_id()).collect()),
            Self::Ranked(r) => Some(r.iter().map(|s| s.article.primary_id()).collect()),
            _ => None,
        }
    }

    fn query(&self) -> Option<NormalizedQuery> {
        match self {
            Self::Query(q) => Some(q.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
    /// Pre-analyzed query from the facade; search and rank steps fall back
    /// to it when the pipeline document supplies none.
    pub query_hint: Option<NormalizedQuery>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
            query_hint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub status: RunStatus,
    pub articles: Vec<ScoredArticle>,
    /// Keys are `step` or `step:source` / `step:id` for partial fan-outs.
    pub per_step_errors: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<NormalizedQuery>,
    /// Full-text sections collected by fetch-fulltext steps, keyed by id.
    #[serde(skip)]
    pub fulltexts: BTreeMap<String, FullText>,
}

struct StepFailure {
    error: LitMcpError,
    fatal: bool,
}

struct StepSuccess {
    value: StepValue,
    /// Partial fan-out failures, keyed by `source` or `id` suffix.
    sub_errors: BTreeMap<String, String>,
}

pub struct PipelineEngine {
    sources: Arc<SourceRegistry>,
    analyzer: Arc<QueryAnalyzer>,
}

impl PipelineEngine {
    pub fn new(sources: Arc<SourceRegistry>, analyzer: Arc<QueryAnalyzer>) -> Self {
        Self { sources, analyzer }
    }

    /// Validate everything that must fail before any execution: template
    /// resolution, the step DAG, and per-action params.
    pub fn validate(&self, config: &PipelineConfig) -> Result<PipelineConfig, LitMcpError> {
        let resolved = config.resolve()?;
        resolved.validate_shape()?;
        graph::topo_levels(&resolved.steps)?;
        for step in &resolved.steps {
            match step.action {
                StepAction::Search => {
                    let params: SearchParams = step.typed_params()?;
                    for source in &params.sources {
                        SourceId::parse(source)?;
                    }
                }
                StepAction::Filter => {
                    let params: FilterParams = step.typed_params()?;
                    for t in &params.article_types {
                        if PublicationType::from_label(t) == PublicationType::Other
                            && t.trim().to_ascii_lowercase() != "other"
                        {
                            return Err(LitMcpError::invalid(format!(
                                "Step \"{}\": unknown article type \"{t}\"",
                                step.id
                            )));
                        }
                    }
                }
                StepAction::Rank => {
                    let params: RankParams = step.typed_params()?;
                    if let Some(strategy) = &params.strategy {
                        RankStrategy::parse(strategy)?;
                    }
                }
                StepAction::FetchDetails
                | StepAction::FetchCitations
                | StepAction::FetchReferences
                | StepAction::FetchFulltext => {
                    let _: FetchParams = step.typed_params()?;
                }
                StepAction::Expand | StepAction::Merge | StepAction::Enrich => {}
            }
        }
        Ok(resolved)
    }

    pub async fn execute(
        &self,
        config: &PipelineConfig,
        options: ExecOptions,
    ) -> Result<PipelineResult, LitMcpError> {
        let config = self.validate(config)?;
        let levels = graph::topo_levels(&config.steps)?;
        let deps = graph::dependencies(&config.steps)?;
        let pipeline_deadline = options
            .deadline
            .unwrap_or_else(|| Instant::now() + DEFAULT_PIPELINE_TIMEOUT);

        // The query rank steps score against: the facade's hint, else the
        // first search step's own text.
        let effective_query = match &options.query_hint {
            Some(q) => Some(q.clone()),
            None => self.first_search_query(&config.steps)?,
        };

        let search_steps: Vec<usize> = config
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.action == StepAction::Search)
            .map(|(i, _)| i)
            .collect();
        let lone_search_fatal = |i: usize, params: &SearchParams| {
            search_steps.len() == 1
                && search_steps[0] == i
                && (params.sources.len() == 1
                    || (params.sources.is_empty() && DEFAULT_SEARCH_SOURCES.len() == 1))
        };

        let mut values: HashMap<usize, StepValue> = HashMap::new();
        let mut failed: HashSet<usize> = HashSet::new();
        let mut errors: BTreeMap<String, String> = BTreeMap::new();
        let mut fatal = false;

        'levels: for level in &levels {
            if options.cancel.is_cancelled() {
                return Err(LitMcpError::Cancelled);
            }

            let mut pending = Vec::with_capacity(level.len());
            for &i in level {
                let step = &config.steps[i];
                let inputs: Vec<StepValue> = deps[i]
                    .iter()
                    .filter_map(|d| values.get(d).cloned())
                    .collect();
                let all_deps_failed =
                    !deps[i].is_empty() && deps[i].iter().all(|d| failed.contains(d));
                pending.push((i, self.run_step(
                    step,
                    inputs,
                    all_deps_failed,
                    &options,
                    &effective_query,
                    pipeline_deadline,
                )));
            }

            let (indices, futures): (Vec<usize>, Vec<_>) = pending.into_iter().unzip();
            let results = join_all(futures).await;

            for (i, result) in indices.into_iter().zip(results) {
                let step = &config.steps[i];
                match result {
                    Ok(success) => {
                        for (suffix, message) in success.sub_errors {
                            errors.insert(format!("{}:{suffix}", step.id), message);
                        }
                        values.insert(i, success.value);
                    }
                    Err(failure) => {
                        if matches!(failure.error, LitMcpError::Cancelled) {
                            return Err(LitMcpError::Cancelled);
                        }
                        warn!(step = %step.id, error = %failure.error, "pipeline step failed");
                        errors.insert(step.id.clone(), failure.error.to_string());
                        failed.insert(i);
                        if failure.fatal
                            || matches!(step.action, StepAction::Search if {
                                let params: SearchParams = step.typed_params().unwrap_or_default();
                                lone_search_fatal(i, &params)
                            })
                        {
                            fatal = true;
                            break 'levels;
                        }
                    }
                }
            }
        }

        let mut fulltexts = BTreeMap::new();
        for value in values.values() {
            if let StepValue::FullTexts(map) = value {
                for (k, v) in map {
                    fulltexts.insert(k.clone(), v.clone());
                }
            }
        }

        // Final articles: the last ranked step in document order wins, else
        // the last article-producing step ranked by the output spec.
        let mut articles: Vec<ScoredArticle> = Vec::new();
        for i in (0..config.steps.len()).rev() {
            match values.get(&i) {
                Some(StepValue::Ranked(ranked)) => {
                    articles = ranked.clone();
                    break;
                }
                Some(StepValue::Articles(list)) => {
                    let query = effective_query
                        .clone()
                        .unwrap_or_else(|| NormalizedQuery::topic(""));
                    articles = rank::rank(list.clone(), &query, config.output.ranking);
                    break;
                }
                _ => {}
            }
        }
        articles.truncate(config.output.limit);

        let status = if fatal {
            RunStatus::Failure
        } else if errors.is_empty() {
            RunStatus::Ok
        } else {
            RunStatus::Partial
        };

        Ok(PipelineResult {
            status,
            articles,
            per_step_errors: errors,
            query: effective_query,
            fulltexts,
        })
    }

    fn first_search_query(
        &self,
        steps: &[Step],
    ) -> Result<Option<NormalizedQuery>, LitMcpError> {
        for step in steps {
            if step.action != StepAction::Search {
                continue;
            }
            let params: SearchParams = step.typed_params()?;
            if let Some(text) = params.query.as_deref().map(str::trim).filter(|t| !t.is_empty())
            {
                return Ok(Some(self.analyzer.normalize_only(text)?));
            }
        }
        Ok(None)
    }

    async fn run_step(
        &self,
        step: &Step,
        inputs: Vec<StepValue>,
        all_deps_failed: bool,
        options: &ExecOptions,
        effective_query: &Option<NormalizedQuery>,
        pipeline_deadline: Instant,
    ) -> Result<StepSuccess, StepFailure> {
        let soft = |error: LitMcpError| StepFailure { error, fatal: false };

        if all_deps_failed
            && matches!(step.action, StepAction::Merge | StepAction::Rank)
        {
            return Err(StepFailure {
                error: LitMcpError::invalid(format!(
                    "Step \"{}\": all inputs are missing",
                    step.id
                )),
                fatal: true,
            });
        }

        let step_timeout = match step.action {
            StepAction::FetchFulltext => FULLTEXT_STEP_TIMEOUT,
            _ => SEARCH_STEP_TIMEOUT,
        };
        let deadline = pipeline_deadline.min(Instant::now() + step_timeout);
        let ctx = CallCtx {
            deadline,
            cancel: options.cancel.clone(),
        };

        let ok = |value: StepValue| {
            Ok(StepSuccess {
                value,
                sub_errors: BTreeMap::new(),
            })
        };

        match step.action {
            StepAction::Search => {
                self.step_search(step, &inputs, effective_query, &ctx).await
            }
            StepAction::Expand => {
                let mut query = match inputs.iter().find_map(StepValue::query) {
                    Some(q) => q,
                    None => {
                        let params: SearchParams = step.typed_params().map_err(soft)?;
                        let text = params
                            .query
                            .or_else(|| effective_query.as_ref().map(|q| q.text.clone()))
                            .ok_or_else(|| {
                                soft(LitMcpError::invalid(format!(
                                    "Step \"{}\": nothing to expand",
                                    step.id
                                )))
                            })?;
                        self.analyzer.normalize_only(&text).map_err(soft)?
                    }
                };
                self.analyzer
                    .expand_in_place(&mut query, &ctx)
                    .await
                    .map_err(soft)?;
                ok(StepValue::Query(query))
            }
            StepAction::Merge => {
                let mut all = Vec::new();
                for input in &inputs {
                    if let Some(articles) = input.articles() {
                        all.extend(articles);
                    }
                }
                ok(StepValue::Articles(dedup::dedup(all)))
            }
            StepAction::Filter => {
                let params: FilterParams = step.typed_params().map_err(soft)?;
                let articles = inputs
                    .iter()
                    .find_map(StepValue::articles)
                    .unwrap_or_default();
                ok(StepValue::Articles(apply_filter(articles, &params)))
            }
            StepAction::Rank => {
                let params: RankParams = step.typed_params().map_err(soft)?;
                let strategy = match params.strategy.as_deref() {
                    Some(s) => RankStrategy::parse(s).map_err(soft)?,
                    None => RankStrategy::Balanced,
                };
                let mut all = Vec::new();
                for input in &inputs {
                    if let Some(articles) = input.articles() {
                        all.extend(articles);
                    }
                }
                let all = dedup::dedup(all);
                let query = effective_query
                    .clone()
                    .unwrap_or_else(|| NormalizedQuery::topic(""));
                let mut ranked = rank::rank(all, &query, strategy);
                if let Some(limit) = params.limit {
                    ranked.truncate(limit.max(1));
                }
                ok(StepValue::Ranked(ranked))
            }
            StepAction::Enrich => self.step_enrich(&inputs, &ctx).await,
            StepAction::FetchDetails => self.step_fetch_details(step, &inputs, &ctx).await,
            StepAction::FetchCitations => {
                self.step_fetch_linked(step, &inputs, &ctx, true).await
            }
            StepAction::FetchReferences => {
                self.step_fetch_linked(step, &inputs, &ctx, false).await
            }
            StepAction::FetchFulltext => self.step_fetch_fulltext(step, &inputs, &ctx).await,
        }
    }

    async fn step_search(
        &self,
        step: &Step,
        inputs: &[StepValue],
        effective_query: &Option<NormalizedQuery>,
        ctx: &CallCtx,
    ) -> Result<StepSuccess, StepFailure> {
        let soft = |error: LitMcpError| StepFailure { error, fatal: false };
        let params: SearchParams = step.typed_params().map_err(soft)?;

        let mut query = match inputs.iter().find_map(StepValue::query) {
            Some(q) => q,
            None => match params.query.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                Some(text) => self.analyzer.normalize_only(text).map_err(soft)?,
                None => effective_query.clone().ok_or_else(|| {
                    soft(LitMcpError::invalid(format!(
                        "Step \"{}\": no query available",
                        step.id
                    )))
                })?,
            },
        };

        if let Some(from) = params.date_from.as_deref() {
            query.date_from = Some(PubDate::parse(from)).filter(|d| d.is_known());
        }
        if let Some(to) = params.date_to.as_deref() {
            query.date_to = Some(PubDate::parse(to)).filter(|d| d.is_known());
        }
        if let Some(lang) = params.language.clone() {
            query.language = Some(lang);
        }
        if let Some(oa) = params.open_access {
            query.open_access_only = oa;
        }
        for t in &params.article_types {
            let pt = PublicationType::from_label(t);
            if !query.article_types.contains(&pt) {
                query.article_types.push(pt);
            }
        }

        let source_ids: Vec<SourceId> = if params.sources.is_empty() {
            DEFAULT_SEARCH_SOURCES.to_vec()
        } else {
            let mut ids = Vec::new();
            for s in &params.sources {
                ids.push(SourceId::parse(s).map_err(soft)?);
            }
            ids
        };
        let adapters = self.sources.search_sources(&source_ids);
        if adapters.is_empty() {
            return Err(soft(LitMcpError::invalid(format!(
                "Step \"{}\": no searchable sources selected",
                step.id
            ))));
        }

        let page_size = params.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 100);
        let calls = adapters.iter().map(|adapter| {
            let query = query.clone();
            let ctx = ctx.child();
            let adapter = adapter.clone();
            async move {
                let outcome = adapter
                    .search(&query, None::<Cursor>, page_size, &ctx)
                    .await;
                (adapter.id(), outcome)
            }
        });

        let mut articles = Vec::new();
        let mut sub_errors = BTreeMap::new();
        let mut any_ok = false;
        for (source, outcome) in join_all(calls).await {
            match outcome {
                Ok(mut out) => {
                    any_ok = true;
                    if !out.unsupported_filters.is_empty() {
                        debug!(
                            source = %source,
                            filters = ?out.unsupported_filters,
                            "source ignored unsupported filters"
                        );
                        // A source that could not express the filters is not
                        // trusted for relevance; drop its raw scores so the
                        // ranker falls back to token overlap.
                        for article in &mut out.articles {
                            for p in &mut article.provenance {
                                if p.source == source {
                                    p.raw_score = None;
                                }
                            }
                        }
                    }
                    articles.extend(out.articles);
                }
                Err(LitMcpError::Cancelled) => {
                    return Err(StepFailure {
                        error: LitMcpError::Cancelled,
                        fatal: false,
                    });
                }
                Err(err) => {
                    sub_errors.insert(source.as_str().to_string(), err.to_string());
                }
            }
        }

        if !any_ok {
            let summary = sub_errors
                .iter()
                .map(|(s, e)| format!("{s}: {e}"))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(soft(LitMcpError::transient(
                "search",
                format!("all sources failed ({summary})"),
            )));
        }

        Ok(StepSuccess {
            value: StepValue::Articles(articles),
            sub_errors,
        })
    }

    async fn step_enrich(
        &self,
        inputs: &[StepValue],
        ctx: &CallCtx,
    ) -> Result<StepSuccess, StepFailure> {
        let articles = inputs
            .iter()
            .find_map(StepValue::articles)
            .unwrap_or_default();
        let Some(metrics) = self.sources.get(SourceId::Semanticscholar) else {
            return Ok(StepSuccess {
                value: StepValue::Articles(articles),
                sub_errors: BTreeMap::new(),
            });
        };

        let calls = articles.into_iter().map(|article| {
            let metrics = metrics.clone();
            let ctx = ctx.child();
            async move {
                let Some(id) = ArticleId::parse(&article.primary_id()) else {
                    return article;
                };
                match metrics.fetch_one(&id, &ctx).await {
                    Ok(Some(found)) => enrich_metrics(article, &found),
                    Ok(None) => article,
                    Err(err) => {
                        debug!(id = %id.as_str(), error = %err, "metric enrichment skipped");
                        article
                    }
                }
            }
        });
        let enriched = join_all(calls).await;
        Ok(StepSuccess {
            value: StepValue::Articles(enriched),
            sub_errors: BTreeMap::new(),
        })
    }

    /// Resolve one id against every source with the capability, most
    /// authoritative first; a source that cannot handle the id kind (or
    /// fails) falls through to the next.
    async fn try_fetch_one(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Option<UnifiedArticle>, LitMcpError> {
        let mut last_err: Option<LitMcpError> = None;
        for adapter in self.sources.capable_sources(Capability::FetchOne) {
            match adapter.fetch_one(id, ctx).await {
                Ok(Some(article)) => return Ok(Some(article)),
                Ok(None) => {}
                Err(LitMcpError::Cancelled) => return Err(LitMcpError::Cancelled),
                Err(err) => {
                    debug!(source = %adapter.id(), id = %id.as_str(), error = %err, "detail fetch fell through");
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }

    /// Citation-graph neighbors of one id. The first source to answer with
    /// a non-empty list wins; an empty answer keeps trying lower-authority
    /// sources before settling for empty.
    async fn try_fetch_linked(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
        citations: bool,
    ) -> Result<Vec<ArticleId>, LitMcpError> {
        let capability = if citations {
            Capability::FetchCitations
        } else {
            Capability::FetchReferences
        };
        let mut last_err: Option<LitMcpError> = None;
        let mut answered = false;
        for adapter in self.sources.capable_sources(capability) {
            let outcome = if citations {
                adapter.fetch_citations(id, ctx).await
            } else {
                adapter.fetch_references(id, ctx).await
            };
            match outcome {
                Ok(linked) if !linked.is_empty() => return Ok(linked),
                Ok(_) => answered = true,
                Err(LitMcpError::Cancelled) => return Err(LitMcpError::Cancelled),
                Err(err) => {
                    debug!(source = %adapter.id(), id = %id.as_str(), error = %err, "linked fetch fell through");
                    last_err = Some(err);
                }
            }
        }
        if answered {
            Ok(Vec::new())
        } else {
            Err(last_err.unwrap_or_else(|| {
                LitMcpError::invalid(format!(
                    "No source can fetch {} for \"{}\"",
                    if citations { "citations" } else { "references" },
                    id.as_str()
                ))
            }))
        }
    }

    async fn try_fetch_fulltext(
        &self,
        id: &ArticleId,
        ctx: &CallCtx,
    ) -> Result<Option<FullText>, LitMcpError> {
        let mut last_err: Option<LitMcpError> = None;
        for adapter in self.sources.capable_sources(Capability::FetchFulltext) {
            match adapter.fetch_fulltext(id, ctx).await {
                Ok(Some(full)) => return Ok(Some(full)),
                Ok(None) => {}
                Err(LitMcpError::Cancelled) => return Err(LitMcpError::Cancelled),
                Err(err) => {
                    debug!(source = %adapter.id(), id = %id.as_str(), error = %err, "fulltext fetch fell through");
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }

    async fn step_fetch_details(
        &self,
        step: &Step,
        inputs: &[StepValue],
        ctx: &CallCtx,
    ) -> Result<StepSuccess, StepFailure> {
        let ids = gather_ids(step, inputs)?;
        let calls = ids.iter().map(|id| {
            let ctx = ctx.child();
            let id = id.clone();
            async move { (id.clone(), self.try_fetch_one(&id, &ctx).await) }
        });

        let mut articles = Vec::new();
        let mut sub_errors = BTreeMap::new();
        for (id, result) in join_all(calls).await {
            match result {
                Ok(Some(article)) => articles.push(article),
                Ok(None) => {}
                Err(LitMcpError::Cancelled) => {
                    return Err(StepFailure {
                        error: LitMcpError::Cancelled,
                        fatal: false,
                    });
                }
                Err(err) => {
                    sub_errors.insert(id.tagged(), err.to_string());
                }
            }
        }
        Ok(StepSuccess {
            value: StepValue::Articles(dedup::dedup(articles)),
            sub_errors,
        })
    }

    async fn step_fetch_linked(
        &self,
        step: &Step,
        inputs: &[StepValue],
        ctx: &CallCtx,
        citations: bool,
    ) -> Result<StepSuccess, StepFailure> {
        let ids = gather_ids(step, inputs)?;
        let calls = ids.iter().map(|id| {
            let ctx = ctx.child();
            let id = id.clone();
            async move { (id.clone(), self.try_fetch_linked(&id, &ctx, citations).await) }
        });

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut sub_errors = BTreeMap::new();
        for (id, result) in join_all(calls).await {
            match result {
                Ok(linked) => {
                    for l in linked {
                        let tagged = l.tagged();
                        if seen.insert(tagged.clone()) {
                            out.push(tagged);
                        }
                    }
                }
                Err(LitMcpError::Cancelled) => {
                    return Err(StepFailure {
                        error: LitMcpError::Cancelled,
                        fatal: false,
                    });
                }
                Err(err) => {
                    sub_errors.insert(id.tagged(), err.to_string());
                }
            }
        }
        Ok(StepSuccess {
            value: StepValue::Ids(out),
            sub_errors,
        })
    }

    async fn step_fetch_fulltext(
        &self,
        step: &Step,
        inputs: &[StepValue],
        ctx: &CallCtx,
    ) -> Result<StepSuccess, StepFailure> {
        let ids = gather_ids(step, inputs)?;
        let calls = ids.iter().map(|id| {
            let ctx = ctx.child();
            let id = id.clone();
            async move { (id.clone(), self.try_fetch_fulltext(&id, &ctx).await) }
        });

        let mut texts = BTreeMap::new();
        let mut sub_errors = BTreeMap::new();
        for (id, result) in join_all(calls).await {
            match result {
                Ok(Some(full)) => {
                    texts.insert(id.tagged(), full);
                }
                Ok(None) => {}
                Err(LitMcpError::Cancelled) => {
                    return Err(StepFailure {
                        error: LitMcpError::Cancelled,
                        fatal: false,
                    });
                }
                Err(err) => {
                    sub_errors.insert(id.tagged(), err.to_string());
                }
            }
        }
        Ok(StepSuccess {
            value: StepValue::FullTexts(texts),
            sub_errors,
        })
    }
}

fn gather_ids(step: &Step, inputs: &[StepValue]) -> Result<Vec<ArticleId>, StepFailure> {
    let params: FetchParams = step.typed_params().map_err(|error| StepFailure {
        error,
        fatal: false,
    })?;
    let raw: Vec<String> = if params.ids.is_empty() {
        inputs.iter().filter_map(StepValue::ids).flatten().collect()
    } else {
        params.ids
    };
    let limit = params.limit.unwrap_or(MAX_FETCH_IDS).clamp(1, 100);

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for value in raw {
        let Some(id) = ArticleId::parse(&value) else {
            continue;
        };
        if seen.insert(id.tagged()) {
            out.push(id);
        }
        if out.len() >= limit {
            break;
        }
    }
    if out.is_empty() {
        return Err(StepFailure {
            error: LitMcpError::invalid(format!(
                "Step \"{}\": no usable identifiers",
                step.id
            )),
            fatal: false,
        });
    }
    Ok(out)
}

fn apply_filter(articles: Vec<UnifiedArticle>, params: &FilterParams) -> Vec<UnifiedArticle> {
    let from = params
        .date_from
        .as_deref()
        .map(PubDate::parse)
        .filter(PubDate::is_known);
    let to = params
        .date_to
        .as_deref()
        .map(PubDate::parse)
        .filter(PubDate::is_known);
    let types: Vec<PublicationType> = params
        .article_types
        .iter()
        .map(|t| PublicationType::from_label(t))
        .collect();

    articles
        .into_iter()
        .filter(|a| {
            if let Some(from) = &from
                && (!a.pub_date.is_known() || a.pub_date.sort_key() < from.sort_key())
            {
                return false;
            }
            if let Some(to) = &to
                && (!a.pub_date.is_known() || a.pub_date.sort_key() > to.sort_key())
            {
                return false;
            }
            if !types.is_empty() && !a.publication_types.iter().any(|t| types.contains(t)) {
                return false;
            }
            if params.has_fulltext == Some(true) && a.links.is_empty() {
                return false;
            }
            if params.open_access == Some(true) && !a.has_open_access_link() {
                return false;
            }
            true
        })
        .collect()
}

/// Attach the metric service's numbers to an article, keeping the larger
/// citation count and recording the extra provenance once.
fn enrich_metrics(article: UnifiedArticle, found: &UnifiedArticle) -> UnifiedArticle {
    let mut out = article;
    out.citation_count = match (out.citation_count, found.citation_count) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    if out.influential_citations.is_none() {
        out.influential_citations = found.influential_citations;
    }
    if out.impact.is_none() {
        out.impact = found.impact;
    }
    if !out
        .provenance
        .iter()
        .any(|p| p.source == SourceId::Semanticscholar)
    {
        out.provenance.extend(
            found
                .provenance
                .iter()
                .filter(|p| p.source == SourceId::Semanticscholar)
                .cloned(),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Gateway, GatewayConfig};
    use crate::sources::mesh::MeshClient;
    use crate::sources::pubmed::PubmedClient;
    use crate::sources::SourceAdapter;
    use std::collections::HashMap as StdHashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway() -> Arc<Gateway> {
        let mut config = GatewayConfig::new("litmcp-test".into());
        config.policies.clear();
        Arc::new(Gateway::new(config).unwrap())
    }

    fn engine_with_pubmed(server: &MockServer) -> PipelineEngine {
        let gw = gateway();
        let mut adapters: StdHashMap<SourceId, Arc<dyn SourceAdapter>> = StdHashMap::new();
        adapters.insert(
            SourceId::Pubmed,
            Arc::new(PubmedClient::new_for_test(gw.clone(), server.uri())),
        );
        let mesh = Arc::new(MeshClient::new_for_test(gw, "http://127.0.0.1:1".into()));
        let registry = Arc::new(SourceRegistry::with_adapters(adapters, mesh.clone()));
        PipelineEngine::new(registry, Arc::new(QueryAnalyzer::new(mesh)))
    }

    async fn mount_empty_pubmed(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "esearchresult": {"count": "0", "idlist": []}
            })))
            .mount(server)
            .await;
    }

    const SIMPLE_PIPELINE: &str = r#"
steps:
  - id: s1
    action: search
    params:
      query: remimazolam
      sources: [pubmed]
  - id: ranked
    action: rank
    params: {limit: 10}
"#;

    #[tokio::test]
    async fn zero_results_is_a_well_formed_ok_run() {
        let server = MockServer::start().await;
        mount_empty_pubmed(&server).await;

        let engine = engine_with_pubmed(&server);
        let config = PipelineConfig::parse(SIMPLE_PIPELINE).unwrap();
        let result = engine.execute(&config, ExecOptions::default()).await.unwrap();
        assert_eq!(result.status, RunStatus::Ok);
        assert!(result.articles.is_empty());
        assert!(result.per_step_errors.is_empty());
    }

    #[tokio::test]
    async fn lone_single_source_search_failure_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let engine = engine_with_pubmed(&server);
        let config = PipelineConfig::parse(SIMPLE_PIPELINE).unwrap();
        let result = engine.execute(&config, ExecOptions::default()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failure);
        assert!(result.per_step_errors.contains_key("s1"));
    }

    #[tokio::test]
    async fn multi_source_search_with_one_failure_is_partial() {
        let server = MockServer::start().await;
        mount_empty_pubmed(&server).await;
        // europepmc is not registered in this engine, so register a second
        // pubmed-backed step instead: one search step per source, one of
        // which points at a failing path.
        let failing = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&failing)
            .await;

        let gw = gateway();
        let mut adapters: StdHashMap<SourceId, Arc<dyn SourceAdapter>> = StdHashMap::new();
        adapters.insert(
            SourceId::Pubmed,
            Arc::new(PubmedClient::new_for_test(gw.clone(), server.uri())),
        );
        adapters.insert(
            SourceId::Europepmc,
            Arc::new(crate::sources::europepmc::EuropePmcClient::new_for_test(
                gw.clone(),
                failing.uri(),
            )),
        );
        let mesh = Arc::new(MeshClient::new_for_test(gw, "http://127.0.0.1:1".into()));
        let registry = Arc::new(SourceRegistry::with_adapters(adapters, mesh.clone()));
        let engine = PipelineEngine::new(registry, Arc::new(QueryAnalyzer::new(mesh)));

        let config = PipelineConfig::parse(
            r#"
steps:
  - id: s1
    action: search
    params:
      query: remimazolam
      sources: [pubmed, europepmc]
  - id: ranked
    action: rank
"#,
        )
        .unwrap();
        let result = engine.execute(&config, ExecOptions::default()).await.unwrap();
        assert_eq!(result.status, RunStatus::Partial);
        assert!(result.per_step_errors.contains_key("s1:europepmc"));
        assert!(result.articles.is_empty());
    }

    #[tokio::test]
    async fn doi_fetch_steps_dispatch_by_capability() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/works/10.1186/x"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"DOI": "10.1186/x", "reference": [{"DOI": "10.1/a"}]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/works/10.1/a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {
                    "DOI": "10.1/a",
                    "title": ["Cited work"],
                    "issued": {"date-parts": [[2022]]}
                }
            })))
            .mount(&server)
            .await;

        // Crossref is the only registered source; a DOI-keyed reference
        // walk must reach it through the capability surface.
        let gw = gateway();
        let mut adapters: StdHashMap<SourceId, Arc<dyn SourceAdapter>> = StdHashMap::new();
        adapters.insert(
            SourceId::Crossref,
            Arc::new(crate::sources::crossref::CrossrefClient::new_for_test(
                gw.clone(),
                server.uri(),
            )),
        );
        let mesh = Arc::new(MeshClient::new_for_test(gw, "http://127.0.0.1:1".into()));
        let registry = Arc::new(SourceRegistry::with_adapters(adapters, mesh.clone()));
        let engine = PipelineEngine::new(registry, Arc::new(QueryAnalyzer::new(mesh)));

        let config = PipelineConfig::parse(
            r#"
steps:
  - id: refs
    action: fetch-references
    params: {ids: ["10.1186/x"]}
  - id: details
    action: fetch-details
"#,
        )
        .unwrap();
        let result = engine.execute(&config, ExecOptions::default()).await.unwrap();
        assert_eq!(result.status, RunStatus::Ok);
        assert_eq!(result.articles.len(), 1);
        assert_eq!(result.articles[0].article.doi.as_deref(), Some("10.1/a"));
    }

    #[tokio::test]
    async fn invalid_pipelines_fail_before_any_execution() {
        let server = MockServer::start().await;
        let engine = engine_with_pubmed(&server);

        let cycle = PipelineConfig::parse(
            r#"
steps:
  - id: a
    action: merge
    depends_on: [b]
  - id: b
    action: merge
    depends_on: [a]
"#,
        )
        .unwrap();
        let err = engine.execute(&cycle, ExecOptions::default()).await.unwrap_err();
        assert!(matches!(err, LitMcpError::InvalidInput(_)));
        // No request reached the mock server.
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_aborts_without_partial_publication() {
        let server = MockServer::start().await;
        mount_empty_pubmed(&server).await;
        let engine = engine_with_pubmed(&server);
        let config = PipelineConfig::parse(SIMPLE_PIPELINE).unwrap();

        let options = ExecOptions::default();
        options.cancel.cancel();
        let err = engine.execute(&config, options).await.unwrap_err();
        assert!(matches!(err, LitMcpError::Cancelled));
    }

    #[test]
    fn filter_applies_date_window_and_fulltext() {
        let mut old = sample_article("1", 2010);
        old.links.clear();
        let recent = sample_article("2", 2024);

        let params = FilterParams {
            date_from: Some("2020".into()),
            has_fulltext: Some(true),
            ..Default::default()
        };
        let out = apply_filter(vec![old, recent], &params);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pmid.as_deref(), Some("2"));
    }

    fn sample_article(pmid: &str, year: i32) -> UnifiedArticle {
        UnifiedArticle {
            pmid: Some(pmid.into()),
            pmcid: None,
            doi: None,
            other_ids: BTreeMap::new(),
            title: "t".into(),
            abstract_text: None,
            authors: Vec::new(),
            journal: None,
            pub_date: PubDate::year(year),
            publication_types: Vec::new(),
            language: None,
            mesh_terms: Vec::new(),
            links: vec![crate::entities::ArticleLink {
                kind: crate::entities::LinkKind::HtmlLanding,
                url: "https://example.org".into(),
                source: SourceId::Pubmed,
                open_access: false,
            }],
            citation_count: None,
            influential_citations: None,
            impact: None,
            provenance: vec![crate::entities::Provenance::now(SourceId::Pubmed, pmid)],
        }
    }
}
