//! Scheduler: a 60-second tick loop over the persisted schedule entries.
//! Fires are dispatched as detached tasks bounded by a concurrency
//! semaphore and a per-run deadline; overlapping runs of one pipeline are
//! skipped, and missed fires are never backfilled.

pub mod cron;

use std::collections::HashSet;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Duration as TokioDuration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::LitMcpError;
use crate::pipeline::{ExecOptions, PipelineEngine, RunStatus};
use crate::store::{
    ArticleSummary, PipelineRun, PipelineStore, RunDiff, ScheduleEntry, diff_runs,
};

use cron::CronExpr;

pub const MAX_ENABLED_SCHEDULES: usize = 5;
pub const MAX_CONCURRENT_RUNS: usize = 5;
pub const TICK_PERIOD: TokioDuration = TokioDuration::from_secs(60);
pub const RUN_DEADLINE: TokioDuration = TokioDuration::from_secs(300);
pub const MIN_FIRE_GAP: time::Duration = time::Duration::hours(1);
const TOP_SUMMARY_COUNT: usize = 5;

/// Best-effort change notifications; no queue, no delivery state.
pub trait ChangeNotifier: Send + Sync {
    fn resource_updated(&self, uri: &str);
}

/// Default notifier when no MCP peer is attached.
pub struct LogNotifier;

impl ChangeNotifier for LogNotifier {
    fn resource_updated(&self, uri: &str) {
        info!(uri, "resource updated");
    }
}

pub struct Scheduler {
    store: Arc<PipelineStore>,
    engine: Arc<PipelineEngine>,
    notifier: Arc<dyn ChangeNotifier>,
    entries: Mutex<Vec<ScheduleEntry>>,
    running: Mutex<HashSet<String>>,
    slots: Arc<Semaphore>,
    stop: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: Arc<PipelineStore>,
        engine: Arc<PipelineEngine>,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            engine,
            notifier,
            entries: Mutex::new(Vec::new()),
            running: Mutex::new(HashSet::new()),
            slots: Arc::new(Semaphore::new(MAX_CONCURRENT_RUNS)),
            stop: CancellationToken::new(),
        })
    }

    /// Load persisted schedules and recompute every `next-run` from the
    /// clock; stale fire times from a previous process are discarded.
    pub async fn init(&self, now: OffsetDateTime) -> Result<(), LitMcpError> {
        let mut schedules = self.store.load_schedules()?;
        for entry in &mut schedules {
            match CronExpr::parse(&entry.cron) {
                Ok(cron) => entry.next_run = cron.next_after(now),
                Err(err) => {
                    warn!(pipeline = %entry.pipeline_name, error = %err, "disabling schedule with bad cron");
                    entry.enabled = false;
                    entry.next_run = None;
                }
            }
        }
        self.store.save_schedules(&schedules)?;
        *self.entries.lock().await = schedules;
        Ok(())
    }

    /// Spawn the tick loop. Runs until [`Scheduler::shutdown`].
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(Instant::now() + TICK_PERIOD, TICK_PERIOD);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let handles = self.clone().tick(OffsetDateTime::now_utc()).await;
                        drop(handles);
                    }
                    _ = self.stop.cancelled() => break,
                }
            }
        })
    }

    /// Stop the loop. In-flight runs finish on their own deadlines.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    pub async fn list(&self) -> Vec<ScheduleEntry> {
        self.entries.lock().await.clone()
    }

    /// Create or update a schedule. Enforces the fleet limit and the
    /// one-hour minimum fire gap.
    pub async fn set_schedule(
        &self,
        pipeline_name: &str,
        cron_text: &str,
        diff_mode: bool,
        notify_mode: bool,
        enabled: bool,
        now: OffsetDateTime,
    ) -> Result<ScheduleEntry, LitMcpError> {
        // The pipeline must exist somewhere before it can be scheduled.
        self.store.load(pipeline_name)?;

        let cron = CronExpr::parse(cron_text)?;
        if let Some(gap) = cron.min_fire_gap(now)
            && gap < MIN_FIRE_GAP
        {
            return Err(LitMcpError::invalid(format!(
                "Schedule \"{cron_text}\" fires every {gap}; the minimum interval is one hour"
            )));
        }

        let mut entries = self.entries.lock().await;
        let enabled_others = entries
            .iter()
            .filter(|e| e.enabled && e.pipeline_name != pipeline_name)
            .count();
        if enabled && enabled_others >= MAX_ENABLED_SCHEDULES {
            return Err(LitMcpError::Conflict(format!(
                "At most {MAX_ENABLED_SCHEDULES} schedules can be enabled at once"
            )));
        }

        let next_run = cron.next_after(now);
        let entry = match entries
            .iter_mut()
            .find(|e| e.pipeline_name == pipeline_name)
        {
            Some(existing) => {
                existing.cron = cron_text.trim().to_string();
                existing.enabled = enabled;
                existing.diff_mode = diff_mode;
                existing.notify_mode = notify_mode;
                existing.next_run = next_run;
                existing.clone()
            }
            None => {
                let entry = ScheduleEntry {
                    pipeline_name: pipeline_name.to_string(),
                    cron: cron_text.trim().to_string(),
                    enabled,
                    diff_mode,
                    notify_mode,
                    next_run,
                    last_run: None,
                    last_status: None,
                    run_count: 0,
                };
                entries.push(entry.clone());
                entry
            }
        };
        self.store.save_schedules(&entries)?;
        Ok(entry)
    }

    /// One scheduler tick. Returns the handles of any dispatched runs so
    /// tests can await them; the tick loop drops them.
    pub async fn tick(self: Arc<Self>, now: OffsetDateTime) -> Vec<JoinHandle<()>> {
        let mut due: Vec<String> = Vec::new();
        {
            let mut entries = self.entries.lock().await;
            let running = self.running.lock().await;
            let mut dirty = false;
            for entry in entries.iter_mut() {
                if !entry.enabled {
                    continue;
                }
                let Some(next_run) = entry.next_run else {
                    continue;
                };
                if next_run > now {
                    continue;
                }
                let Ok(cron) = CronExpr::parse(&entry.cron) else {
                    continue;
                };
                // Advance past `now` whether or not we dispatch; missed
                // fires are not backfilled.
                entry.next_run = cron.next_after(now);
                dirty = true;
                if running.contains(&entry.pipeline_name) {
                    warn!(pipeline = %entry.pipeline_name, "previous run still in flight; skipping");
                    continue;
                }
                due.push(entry.pipeline_name.clone());
            }
            if dirty && let Err(err) = self.store.save_schedules(&entries) {
                warn!(error = %err, "failed to persist schedule state");
            }
        }

        let mut handles = Vec::with_capacity(due.len());
        for name in due {
            self.running.lock().await.insert(name.clone());
            let scheduler = self.clone();
            handles.push(tokio::spawn(async move {
                scheduler.run_scheduled(&name).await;
                scheduler.running.lock().await.remove(&name);
            }));
        }
        handles
    }

    async fn run_scheduled(&self, name: &str) {
        let Ok(_permit) = self.slots.acquire().await else {
            return;
        };
        let started_at = OffsetDateTime::now_utc();

        let (status, article_ids, top_articles, per_step_errors, scope) =
            match self.execute_once(name).await {
                Ok((result, scope)) => {
                    let ids: Vec<String> = result
                        .articles
                        .iter()
                        .map(|s| s.article.primary_id())
                        .collect();
                    let top = result
                        .articles
                        .iter()
                        .take(TOP_SUMMARY_COUNT)
                        .map(|s| ArticleSummary::from_article(&s.article))
                        .collect();
                    (result.status, ids, top, result.per_step_errors, scope)
                }
                Err((err, scope)) => {
                    warn!(pipeline = %name, error = %err, "scheduled run failed");
                    let mut errors = std::collections::BTreeMap::new();
                    errors.insert("pipeline".to_string(), err.to_string());
                    (RunStatus::Failure, Vec::new(), Vec::new(), errors, scope)
                }
            };

        let diff_mode = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .find(|e| e.pipeline_name == name)
                .map(|e| (e.diff_mode, e.notify_mode))
        };
        let (diff_mode, notify_mode) = diff_mode.unwrap_or((true, false));

        let previous = self.store.last_run(name).ok().flatten();
        let diff: Option<RunDiff> = diff_mode.then(|| {
            diff_runs(
                &article_ids,
                previous
                    .as_ref()
                    .map(|r| r.article_ids.as_slice())
                    .unwrap_or_default(),
            )
        });

        let finished_at = OffsetDateTime::now_utc();
        let run = PipelineRun {
            run_id: format!(
                "run-{:012}-{:09}",
                started_at.unix_timestamp(),
                started_at.nanosecond()
            ),
            pipeline_name: name.to_string(),
            scope,
            started_at,
            finished_at,
            status,
            article_count: article_ids.len(),
            article_ids,
            top_articles,
            diff: diff.clone(),
            per_step_errors,
        };
        if let Err(err) = self.store.record_run(&run) {
            warn!(pipeline = %name, error = %err, "failed to record run");
        }

        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.iter_mut().find(|e| e.pipeline_name == name) {
                entry.last_run = Some(started_at);
                entry.last_status = Some(status);
                entry.run_count += 1;
            }
            if let Err(err) = self.store.save_schedules(&entries) {
                warn!(error = %err, "failed to persist schedule state");
            }
        }

        let has_new = diff.as_ref().is_some_and(|d| !d.new.is_empty());
        if notify_mode && status != RunStatus::Failure && has_new {
            self.notifier
                .resource_updated(&format!("pipeline://history/{name}/latest"));
        }
    }

    async fn execute_once(
        &self,
        name: &str,
    ) -> Result<
        (crate::pipeline::PipelineResult, crate::store::Scope),
        (LitMcpError, crate::store::Scope),
    > {
        let fallback_scope = crate::store::Scope::Global;
        let (config, meta) = self
            .store
            .load(name)
            .map_err(|e| (e, fallback_scope))?;
        let options = ExecOptions {
            deadline: Some(Instant::now() + RUN_DEADLINE),
            cancel: self.stop.child_token(),
            query_hint: None,
        };
        let result = self
            .engine
            .execute(&config, options)
            .await
            .map_err(|e| (e, meta.scope))?;
        Ok((result, meta.scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::QueryAnalyzer;
    use crate::gateway::{Gateway, GatewayConfig};
    use crate::pipeline::PipelineConfig;
    use crate::sources::mesh::MeshClient;
    use crate::sources::pubmed::PubmedClient;
    use crate::sources::{SourceAdapter, SourceId, SourceRegistry};
    use crate::store::ScopeSelector;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use time::macros::datetime;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct RecordingNotifier {
        uris: StdMutex<Vec<String>>,
    }

    impl ChangeNotifier for RecordingNotifier {
        fn resource_updated(&self, uri: &str) {
            self.uris.lock().unwrap().push(uri.to_string());
        }
    }

    struct Fixture {
        scheduler: Arc<Scheduler>,
        store: Arc<PipelineStore>,
        notifier: Arc<RecordingNotifier>,
        _tmp: TempDir,
        _server: MockServer,
    }

    async fn fixture_with_pmids(pmids: &[&str]) -> Fixture {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "esearchresult": {
                    "count": pmids.len().to_string(),
                    "idlist": pmids
                }
            })))
            .mount(&server)
            .await;
        let articles: String = pmids
            .iter()
            .map(|p| {
                format!(
                    "<PubmedArticle><MedlineCitation><PMID>{p}</PMID><Article><ArticleTitle>Article {p}</ArticleTitle></Article></MedlineCitation></PubmedArticle>"
                )
            })
            .collect();
        Mock::given(method("GET"))
            .and(path("/efetch.fcgi"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "<PubmedArticleSet>{articles}</PubmedArticleSet>"
            )))
            .mount(&server)
            .await;

        let mut config = GatewayConfig::new("litmcp-test".into());
        config.policies.clear();
        let gateway = Arc::new(Gateway::new(config).unwrap());
        let mut adapters: HashMap<SourceId, Arc<dyn SourceAdapter>> = HashMap::new();
        adapters.insert(
            SourceId::Pubmed,
            Arc::new(PubmedClient::new_for_test(gateway.clone(), server.uri())),
        );
        let mesh = Arc::new(MeshClient::new_for_test(
            gateway,
            "http://127.0.0.1:1".into(),
        ));
        let registry = Arc::new(SourceRegistry::with_adapters(adapters, mesh.clone()));
        let engine = Arc::new(PipelineEngine::new(
            registry,
            Arc::new(QueryAnalyzer::new(mesh)),
        ));

        let tmp = TempDir::new().unwrap();
        let ws = tmp.path().join("project/.litmcp");
        std::fs::create_dir_all(&ws).unwrap();
        let store = Arc::new(PipelineStore::new(Some(ws), tmp.path().join("global")));
        let pipeline = PipelineConfig::parse(
            r#"
steps:
  - id: s1
    action: search
    params: {query: remimazolam, sources: [pubmed]}
  - id: ranked
    action: rank
"#,
        )
        .unwrap();
        store
            .save("weekly_remi", &pipeline, ScopeSelector::Workspace)
            .unwrap();

        let notifier = Arc::new(RecordingNotifier {
            uris: StdMutex::new(Vec::new()),
        });
        let scheduler = Scheduler::new(store.clone(), engine, notifier.clone());
        Fixture {
            scheduler,
            store,
            notifier,
            _tmp: tmp,
            _server: server,
        }
    }

    #[tokio::test]
    async fn set_schedule_rejects_sub_hour_cron() {
        let fx = fixture_with_pmids(&["1"]).await;
        let now = datetime!(2026-08-01 12:00 UTC);
        let err = fx
            .scheduler
            .set_schedule("weekly_remi", "* * * * *", true, false, true, now)
            .await
            .unwrap_err();
        assert!(matches!(err, LitMcpError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn set_schedule_rejects_unknown_pipelines_and_enforces_the_fleet_limit() {
        let fx = fixture_with_pmids(&["1"]).await;
        let now = datetime!(2026-08-01 12:00 UTC);
        assert!(matches!(
            fx.scheduler
                .set_schedule("ghost", "0 9 * * 1", true, false, true, now)
                .await,
            Err(LitMcpError::NotFound { .. })
        ));

        for i in 0..MAX_ENABLED_SCHEDULES {
            let name = format!("p{i}");
            let pipeline = PipelineConfig::parse(
                "steps:\n  - id: s\n    action: search\n    params: {query: q, sources: [pubmed]}\n",
            )
            .unwrap();
            fx.store.save(&name, &pipeline, ScopeSelector::Workspace).unwrap();
            fx.scheduler
                .set_schedule(&name, "0 9 * * 1", true, false, true, now)
                .await
                .unwrap();
        }
        let err = fx
            .scheduler
            .set_schedule("weekly_remi", "0 9 * * 1", true, false, true, now)
            .await
            .unwrap_err();
        assert!(matches!(err, LitMcpError::Conflict(_)));
    }

    #[tokio::test]
    async fn due_schedule_fires_once_and_advances_next_run() {
        let fx = fixture_with_pmids(&["22663011"]).await;
        let registered = datetime!(2026-08-01 12:00 UTC);
        fx.scheduler
            .set_schedule("weekly_remi", "0 9 * * 1", true, true, true, registered)
            .await
            .unwrap();
        let before = fx.scheduler.list().await[0].clone();
        assert_eq!(before.next_run, Some(datetime!(2026-08-03 09:00 UTC)));

        // The clock reaches Monday 09:00.
        let monday = datetime!(2026-08-03 09:00:30 UTC);
        let handles = fx.scheduler.clone().tick(monday).await;
        assert_eq!(handles.len(), 1);
        for handle in handles {
            handle.await.unwrap();
        }
        // A second tick in the same minute does not fire again.
        let handles = fx.scheduler.clone().tick(datetime!(2026-08-03 09:00:55 UTC)).await;
        assert!(handles.is_empty());

        let entry = fx.scheduler.list().await[0].clone();
        assert_eq!(entry.run_count, 1);
        assert_eq!(entry.last_status, Some(RunStatus::Ok));
        assert_eq!(entry.next_run, Some(datetime!(2026-08-10 09:00 UTC)));

        let run = fx.store.last_run("weekly_remi").unwrap().unwrap();
        assert_eq!(run.article_count, 1);
        let diff = run.diff.unwrap();
        assert_eq!(diff.new, vec!["pmid:22663011"]);
        assert_eq!(diff.unchanged_count, 0);

        // First run produced new identifiers; the notification fired.
        let uris = fx.notifier.uris.lock().unwrap().clone();
        assert_eq!(uris, vec!["pipeline://history/weekly_remi/latest"]);
    }

    #[tokio::test]
    async fn init_recomputes_next_run_from_the_clock() {
        let fx = fixture_with_pmids(&["1"]).await;
        let now = datetime!(2026-08-01 12:00 UTC);
        fx.scheduler
            .set_schedule("weekly_remi", "0 9 * * 1", true, false, true, now)
            .await
            .unwrap();

        // A fresh scheduler over the same store recomputes fire times.
        let later = datetime!(2026-08-20 12:00 UTC);
        fx.scheduler.init(later).await.unwrap();
        let entry = fx.scheduler.list().await[0].clone();
        // 2026-08-24 is the Monday after the 20th.
        assert_eq!(entry.next_run, Some(datetime!(2026-08-24 09:00 UTC)));
    }
}
