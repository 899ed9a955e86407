//! Pipeline persistence. Two scopes: workspace (project-local, meant to be
//! revision-controlled) and global (user-wide). Lookup is workspace-first.
//! All durable writes go through rename-into-place under an exclusive file
//! lock; reads take the shared lock.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;
use url::Url;

use crate::entities::UnifiedArticle;
use crate::error::LitMcpError;
use crate::gateway::{FetchErrorKind, FetchRequest, Gateway};
use crate::pipeline::{PipelineConfig, RunStatus};

/// Cap on the body of a `url:`-loaded pipeline.
pub const URL_PIPELINE_CAP: usize = 100 * 1024;
/// Run records kept per pipeline, newest first.
pub const RUN_RETENTION: usize = 100;

pub const WORKSPACE_DIR: &str = ".litmcp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Workspace,
    Global,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Global => "global",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScopeSelector {
    Workspace,
    Global,
    #[default]
    Auto,
}

impl ScopeSelector {
    pub fn parse(value: &str) -> Result<Self, LitMcpError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "workspace" => Ok(Self::Workspace),
            "global" => Ok(Self::Global),
            "auto" | "" => Ok(Self::Auto),
            other => Err(LitMcpError::invalid(format!(
                "Unknown scope \"{other}\". Expected workspace, global, or auto"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineMeta {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub scope: Scope,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub content_hash: String,
    pub step_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDiff {
    #[serde(default)]
    pub new: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
    pub unchanged_count: usize,
}

/// Set difference of a run's identifiers against the previous run.
pub fn diff_runs(current: &[String], previous: &[String]) -> RunDiff {
    let prev: std::collections::HashSet<&String> = previous.iter().collect();
    let cur: std::collections::HashSet<&String> = current.iter().collect();
    RunDiff {
        new: current
            .iter()
            .filter(|id| !prev.contains(*id))
            .cloned()
            .collect(),
        removed: previous
            .iter()
            .filter(|id| !cur.contains(*id))
            .cloned()
            .collect(),
        unchanged_count: current.iter().filter(|id| prev.contains(*id)).count(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleSummary {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

impl ArticleSummary {
    pub fn from_article(article: &UnifiedArticle) -> Self {
        Self {
            id: article.primary_id(),
            title: article.title.clone(),
            journal: article.journal.clone(),
            date: article
                .pub_date
                .is_known()
                .then(|| article.pub_date.display()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub pipeline_name: String,
    pub scope: Scope,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub status: RunStatus,
    pub article_count: usize,
    pub article_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub top_articles: Vec<ArticleSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<RunDiff>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub per_step_errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub pipeline_name: String,
    pub cron: String,
    pub enabled: bool,
    #[serde(default)]
    pub diff_mode: bool,
    #[serde(default)]
    pub notify_mode: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_run: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_run: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(default)]
    pub run_count: u64,
}

/// Kinds of `load_pipeline` source references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Saved(String),
    File(PathBuf),
    Url(String),
}

impl SourceRef {
    pub fn parse(source: &str) -> Result<Self, LitMcpError> {
        let source = source.trim();
        if let Some(rest) = source.strip_prefix("saved:") {
            return Ok(Self::Saved(rest.trim().to_string()));
        }
        if let Some(rest) = source.strip_prefix("file:") {
            return Ok(Self::File(PathBuf::from(rest.trim())));
        }
        if let Some(rest) = source.strip_prefix("url:") {
            return Ok(Self::Url(rest.trim().to_string()));
        }
        if source.contains("://") {
            return Err(LitMcpError::invalid(
                "URL sources must use the url: prefix",
            ));
        }
        Ok(Self::Saved(source.to_string()))
    }
}

pub fn validate_name(name: &str) -> Result<&str, LitMcpError> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(name)
    } else {
        Err(LitMcpError::invalid(format!(
            "Invalid pipeline name \"{name}\": must match ^[A-Za-z0-9_-]{{1,64}}$"
        )))
    }
}

pub struct PipelineStore {
    workspace_root: Option<PathBuf>,
    global_root: PathBuf,
}

impl PipelineStore {
    pub fn new(workspace_root: Option<PathBuf>, global_root: PathBuf) -> Self {
        Self {
            workspace_root,
            global_root,
        }
    }

    /// Workspace root derived from the current directory when it carries a
    /// project marker directory.
    pub fn open(current_dir: &Path, global_root: PathBuf) -> Self {
        let candidate = current_dir.join(WORKSPACE_DIR);
        let workspace_root = candidate.is_dir().then_some(candidate);
        Self::new(workspace_root, global_root)
    }

    fn root(&self, scope: Scope) -> Option<&Path> {
        match scope {
            Scope::Workspace => self.workspace_root.as_deref(),
            Scope::Global => Some(&self.global_root),
        }
    }

    fn pick_scope(&self, selector: ScopeSelector) -> Result<Scope, LitMcpError> {
        match selector {
            ScopeSelector::Workspace => {
                if self.workspace_root.is_some() {
                    Ok(Scope::Workspace)
                } else {
                    Err(LitMcpError::invalid(
                        "No workspace scope here; create a .litmcp directory in the project or use scope=global",
                    ))
                }
            }
            ScopeSelector::Global => Ok(Scope::Global),
            ScopeSelector::Auto => Ok(if self.workspace_root.is_some() {
                Scope::Workspace
            } else {
                Scope::Global
            }),
        }
    }

    fn pipeline_path(&self, scope: Scope, name: &str) -> Option<PathBuf> {
        self.root(scope)
            .map(|r| r.join("pipelines").join(format!("{name}.yaml")))
    }

    fn runs_dir(&self, scope: Scope, name: &str) -> Option<PathBuf> {
        self.root(scope).map(|r| r.join("runs").join(name))
    }

    fn schedules_path(&self) -> PathBuf {
        self.global_root.join("schedules.json")
    }

    fn lock_path(root: &Path) -> PathBuf {
        root.join(".lock")
    }

    fn lock(root: &Path, exclusive: bool) -> Result<File, LitMcpError> {
        fs::create_dir_all(root).map_err(io_err)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(Self::lock_path(root))
            .map_err(io_err)?;
        if exclusive {
            file.lock_exclusive().map_err(io_err)?;
        } else {
            file.lock_shared().map_err(io_err)?;
        }
        Ok(file)
    }

    pub fn save(
        &self,
        name: &str,
        config: &PipelineConfig,
        selector: ScopeSelector,
    ) -> Result<PipelineMeta, LitMcpError> {
        validate_name(name)?;
        config.validate_shape()?;
        let scope = self.pick_scope(selector)?;
        let root = self.root(scope).expect("picked scope has a root").to_path_buf();
        let path = self.pipeline_path(scope, name).expect("scope has a root");

        let mut stored = config.clone();
        stored.name = Some(name.to_string());
        let text = stored.canonical_yaml()?;

        let _guard = Self::lock(&root, true)?;
        let existed = path.exists();
        write_atomic(&path, text.as_bytes())?;
        debug!(name, scope = scope.as_str(), upsert = existed, "saved pipeline");
        drop(_guard);

        self.meta_for(scope, name, &stored)
    }

    fn meta_for(
        &self,
        scope: Scope,
        name: &str,
        config: &PipelineConfig,
    ) -> Result<PipelineMeta, LitMcpError> {
        let path = self
            .pipeline_path(scope, name)
            .ok_or_else(|| LitMcpError::Internal("scope without root".into()))?;
        let meta = fs::metadata(&path).map_err(io_err)?;
        let updated_at = meta
            .modified()
            .map(OffsetDateTime::from)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());
        let created_at = meta.created().map(OffsetDateTime::from).unwrap_or(updated_at);
        Ok(PipelineMeta {
            name: name.to_string(),
            description: config.description.clone(),
            tags: config.tags.clone(),
            scope,
            created_at,
            updated_at,
            content_hash: config.content_hash()?,
            step_count: config.resolve().map(|r| r.steps.len()).unwrap_or(0),
        })
    }

    /// Workspace first, then global; first hit wins.
    pub fn load(&self, name: &str) -> Result<(PipelineConfig, PipelineMeta), LitMcpError> {
        validate_name(name)?;
        for scope in [Scope::Workspace, Scope::Global] {
            let Some(path) = self.pipeline_path(scope, name) else {
                continue;
            };
            if !path.exists() {
                continue;
            }
            let root = self.root(scope).expect("scope has a root");
            let _guard = Self::lock(root, false)?;
            let text = fs::read_to_string(&path).map_err(io_err)?;
            drop(_guard);
            let config = PipelineConfig::parse(&text)?;
            let meta = self.meta_for(scope, name, &config)?;
            return Ok((config, meta));
        }
        Err(LitMcpError::not_found(
            "pipeline",
            name,
            "Use save_pipeline first, or list_pipelines to see what exists.",
        ))
    }

    pub fn list(
        &self,
        tag: Option<&str>,
        scope: Option<Scope>,
    ) -> Result<Vec<PipelineMeta>, LitMcpError> {
        let mut out = Vec::new();
        for s in [Scope::Workspace, Scope::Global] {
            if scope.is_some_and(|want| want != s) {
                continue;
            }
            let Some(root) = self.root(s) else { continue };
            let dir = root.join("pipelines");
            if !dir.is_dir() {
                continue;
            }
            let _guard = Self::lock(root, false)?;
            let mut entries: Vec<PathBuf> = fs::read_dir(&dir)
                .map_err(io_err)?
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "yaml"))
                .collect();
            drop(_guard);
            entries.sort();
            for path in entries {
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let Ok(text) = fs::read_to_string(&path) else {
                    continue;
                };
                let Ok(config) = PipelineConfig::parse(&text) else {
                    continue;
                };
                if let Some(tag) = tag
                    && !config.tags.iter().any(|t| t == tag)
                {
                    continue;
                }
                if let Ok(meta) = self.meta_for(s, name, &config) {
                    out.push(meta);
                }
            }
        }
        Ok(out)
    }

    /// Remove the pipeline, its run records, and any schedule entry
    /// pointing at it.
    pub fn delete(&self, name: &str) -> Result<Scope, LitMcpError> {
        validate_name(name)?;
        for scope in [Scope::Workspace, Scope::Global] {
            let Some(path) = self.pipeline_path(scope, name) else {
                continue;
            };
            if !path.exists() {
                continue;
            }
            let root = self.root(scope).expect("scope has a root");
            let _guard = Self::lock(root, true)?;
            fs::remove_file(&path).map_err(io_err)?;
            if let Some(runs) = self.runs_dir(scope, name)
                && runs.is_dir()
            {
                fs::remove_dir_all(&runs).map_err(io_err)?;
            }
            drop(_guard);

            let mut schedules = self.load_schedules()?;
            let before = schedules.len();
            schedules.retain(|s| s.pipeline_name != name);
            if schedules.len() != before {
                self.save_schedules(&schedules)?;
            }
            return Ok(scope);
        }
        Err(LitMcpError::not_found(
            "pipeline",
            name,
            "Nothing to delete.",
        ))
    }

    pub fn record_run(&self, run: &PipelineRun) -> Result<(), LitMcpError> {
        let dir = self
            .runs_dir(run.scope, &run.pipeline_name)
            .ok_or_else(|| LitMcpError::Internal("run scope without root".into()))?;
        let root = self.root(run.scope).expect("scope has a root").to_path_buf();
        let _guard = Self::lock(&root, true)?;
        fs::create_dir_all(&dir).map_err(io_err)?;
        let path = dir.join(format!("{}.json", run.run_id));
        let body = serde_json::to_vec_pretty(run)
            .map_err(|e| LitMcpError::Internal(format!("run serialization failed: {e}")))?;
        write_atomic(&path, &body)?;

        // FIFO retention: file names sort by start time.
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(io_err)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        while files.len() > RUN_RETENTION {
            let oldest = files.remove(0);
            let _ = fs::remove_file(oldest);
        }
        Ok(())
    }

    /// Newest first.
    pub fn history(&self, name: &str, limit: usize) -> Result<Vec<PipelineRun>, LitMcpError> {
        validate_name(name)?;
        let mut out = Vec::new();
        for scope in [Scope::Workspace, Scope::Global] {
            let Some(dir) = self.runs_dir(scope, name) else {
                continue;
            };
            if !dir.is_dir() {
                continue;
            }
            let root = self.root(scope).expect("scope has a root");
            let _guard = Self::lock(root, false)?;
            let mut files: Vec<PathBuf> = fs::read_dir(&dir)
                .map_err(io_err)?
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            drop(_guard);
            files.sort();
            files.reverse();
            for path in files.into_iter().take(limit.saturating_sub(out.len())) {
                if let Ok(text) = fs::read(&path)
                    && let Ok(run) = serde_json::from_slice::<PipelineRun>(&text)
                {
                    out.push(run);
                }
            }
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    pub fn last_run(&self, name: &str) -> Result<Option<PipelineRun>, LitMcpError> {
        Ok(self.history(name, 1)?.into_iter().next())
    }

    pub fn load_schedules(&self) -> Result<Vec<ScheduleEntry>, LitMcpError> {
        let path = self.schedules_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let _guard = Self::lock(&self.global_root, false)?;
        let text = fs::read(&path).map_err(io_err)?;
        drop(_guard);
        serde_json::from_slice(&text).map_err(|e| {
            LitMcpError::Internal(format!("schedules file is corrupt: {e}"))
        })
    }

    /// Persisted synchronously on every change.
    pub fn save_schedules(&self, schedules: &[ScheduleEntry]) -> Result<(), LitMcpError> {
        let body = serde_json::to_vec_pretty(schedules)
            .map_err(|e| LitMcpError::Internal(format!("schedule serialization failed: {e}")))?;
        let _guard = Self::lock(&self.global_root, true)?;
        write_atomic(&self.schedules_path(), &body)
    }

    /// Load pipeline text from a saved name, a scoped file path, or an
    /// allow-listed HTTPS URL.
    pub async fn load_source(
        &self,
        source: &SourceRef,
        gateway: &Arc<Gateway>,
        allowed_hosts: &[String],
    ) -> Result<(String, Option<PipelineMeta>), LitMcpError> {
        match source {
            SourceRef::Saved(name) => {
                let (config, meta) = self.load(name)?;
                Ok((config.canonical_yaml()?, Some(meta)))
            }
            SourceRef::File(path) => Ok((self.read_scoped_file(path)?, None)),
            SourceRef::Url(raw) => {
                let url = Url::parse(raw)
                    .map_err(|e| LitMcpError::invalid(format!("Invalid pipeline URL: {e}")))?;
                if url.scheme() != "https" {
                    return Err(LitMcpError::invalid(
                        "Pipeline URLs must use the https scheme",
                    ));
                }
                let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
                if !allowed_hosts.iter().any(|h| h == &host) {
                    return Err(LitMcpError::invalid(format!(
                        "Host \"{host}\" is not on the pipeline URL allow-list"
                    )));
                }
                let request = FetchRequest::get(url.to_string()).size_cap(URL_PIPELINE_CAP);
                let resp = gateway.fetch(request).await.map_err(|e| {
                    if e.kind == FetchErrorKind::Oversize {
                        LitMcpError::invalid(format!(
                            "Pipeline at {raw} exceeds the {URL_PIPELINE_CAP}-byte cap"
                        ))
                    } else {
                        LitMcpError::upstream("pipeline-url", e.to_string())
                    }
                })?;
                if let Some(ct) = resp.content_type.as_deref() {
                    let ct = ct.to_ascii_lowercase();
                    let text_typed = ct.starts_with("text/")
                        || ct.contains("yaml")
                        || ct.contains("json");
                    if !text_typed {
                        return Err(LitMcpError::invalid(format!(
                            "Pipeline URL answered with non-text content type \"{ct}\""
                        )));
                    }
                }
                let text = String::from_utf8(resp.body).map_err(|_| {
                    LitMcpError::invalid("Pipeline URL body is not valid UTF-8")
                })?;
                Ok((text, None))
            }
        }
    }

    /// `file:` paths must resolve under a scope root; `..` segments and
    /// symbolic links are refused.
    fn read_scoped_file(&self, path: &Path) -> Result<String, LitMcpError> {
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(LitMcpError::invalid(
                "Pipeline file paths must not contain .. segments",
            ));
        }
        let meta = fs::symlink_metadata(path).map_err(|_| {
            LitMcpError::not_found("pipeline file", path.display().to_string(), "")
        })?;
        if meta.file_type().is_symlink() {
            return Err(LitMcpError::invalid(
                "Pipeline file paths must not be symbolic links",
            ));
        }
        let canonical = fs::canonicalize(path).map_err(io_err)?;
        let in_scope = [self.workspace_root.as_deref(), Some(self.global_root.as_path())]
            .into_iter()
            .flatten()
            .filter_map(|root| fs::canonicalize(root).ok())
            .any(|root| canonical.starts_with(&root));
        if !in_scope {
            return Err(LitMcpError::invalid(
                "Pipeline file paths must live under the workspace or global scope root",
            ));
        }
        fs::read_to_string(&canonical).map_err(io_err)
    }
}

fn io_err(e: std::io::Error) -> LitMcpError {
    LitMcpError::Internal(format!("store I/O error: {e}"))
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<(), LitMcpError> {
    let parent = path
        .parent()
        .ok_or_else(|| LitMcpError::Internal("write target has no parent".into()))?;
    fs::create_dir_all(parent).map_err(io_err)?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
        std::process::id()
    ));
    fs::write(&tmp, body).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_config() -> PipelineConfig {
        PipelineConfig::parse(
            r#"
description: weekly check
tags: [icu]
steps:
  - id: s1
    action: search
    params: {query: remimazolam, sources: [pubmed]}
  - id: ranked
    action: rank
"#,
        )
        .unwrap()
    }

    fn store_with_both(tmp: &TempDir) -> PipelineStore {
        let ws = tmp.path().join("project/.litmcp");
        let global = tmp.path().join("global");
        fs::create_dir_all(&ws).unwrap();
        PipelineStore::new(Some(ws), global)
    }

    #[test]
    fn save_load_save_keeps_the_content_hash() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_both(&tmp);
        let config = sample_config();
        let meta1 = store.save("weekly_remi", &config, ScopeSelector::Auto).unwrap();
        let (loaded, _) = store.load("weekly_remi").unwrap();
        let meta2 = store.save("weekly_remi", &loaded, ScopeSelector::Auto).unwrap();
        assert_eq!(meta1.content_hash, meta2.content_hash);
        assert_eq!(meta1.scope, Scope::Workspace);
        assert_eq!(meta1.step_count, 2);
    }

    #[test]
    fn workspace_copy_shadows_the_global_one() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_both(&tmp);
        let mut global_cfg = sample_config();
        global_cfg.description = Some("global copy".into());
        store
            .save("shared", &global_cfg, ScopeSelector::Global)
            .unwrap();
        let mut ws_cfg = sample_config();
        ws_cfg.description = Some("workspace copy".into());
        store
            .save("shared", &ws_cfg, ScopeSelector::Workspace)
            .unwrap();

        let (loaded, meta) = store.load("shared").unwrap();
        assert_eq!(meta.scope, Scope::Workspace);
        assert_eq!(loaded.description.as_deref(), Some("workspace copy"));
    }

    #[test]
    fn list_combines_scopes_and_filters_by_tag() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_both(&tmp);
        store
            .save("one", &sample_config(), ScopeSelector::Workspace)
            .unwrap();
        let mut untagged = sample_config();
        untagged.tags.clear();
        store
            .save("two", &untagged, ScopeSelector::Global)
            .unwrap();

        let all = store.list(None, None).unwrap();
        assert_eq!(all.len(), 2);
        let tagged = store.list(Some("icu"), None).unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].name, "one");
        let global_only = store.list(None, Some(Scope::Global)).unwrap();
        assert_eq!(global_only.len(), 1);
        assert_eq!(global_only[0].name, "two");
    }

    #[test]
    fn bad_names_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_both(&tmp);
        for bad in ["", "has space", "dot.dot", "../escape", &"x".repeat(65)] {
            assert!(
                store.save(bad, &sample_config(), ScopeSelector::Auto).is_err(),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn delete_removes_pipeline_runs_and_schedule() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_both(&tmp);
        store
            .save("doomed", &sample_config(), ScopeSelector::Workspace)
            .unwrap();
        let run = PipelineRun {
            run_id: "run-1".into(),
            pipeline_name: "doomed".into(),
            scope: Scope::Workspace,
            started_at: OffsetDateTime::now_utc(),
            finished_at: OffsetDateTime::now_utc(),
            status: RunStatus::Ok,
            article_count: 0,
            article_ids: Vec::new(),
            top_articles: Vec::new(),
            diff: None,
            per_step_errors: BTreeMap::new(),
        };
        store.record_run(&run).unwrap();
        store
            .save_schedules(&[ScheduleEntry {
                pipeline_name: "doomed".into(),
                cron: "0 9 * * 1".into(),
                enabled: true,
                diff_mode: true,
                notify_mode: false,
                next_run: None,
                last_run: None,
                last_status: None,
                run_count: 0,
            }])
            .unwrap();

        store.delete("doomed").unwrap();
        assert!(store.load("doomed").is_err());
        assert!(store.history("doomed", 10).unwrap().is_empty());
        assert!(store.load_schedules().unwrap().is_empty());
    }

    #[test]
    fn run_retention_keeps_the_newest_hundred() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_both(&tmp);
        store
            .save("busy", &sample_config(), ScopeSelector::Workspace)
            .unwrap();
        for i in 0..105 {
            let run = PipelineRun {
                run_id: format!("run-{i:05}"),
                pipeline_name: "busy".into(),
                scope: Scope::Workspace,
                started_at: OffsetDateTime::now_utc(),
                finished_at: OffsetDateTime::now_utc(),
                status: RunStatus::Ok,
                article_count: 0,
                article_ids: Vec::new(),
                top_articles: Vec::new(),
                diff: None,
                per_step_errors: BTreeMap::new(),
            };
            store.record_run(&run).unwrap();
        }
        let history = store.history("busy", 200).unwrap();
        assert_eq!(history.len(), RUN_RETENTION);
        assert_eq!(history[0].run_id, "run-00104");
    }

    #[test]
    fn diff_runs_matches_set_semantics() {
        let prev = vec!["a".to_string(), "b".to_string()];
        let cur = vec!["b".to_string(), "c".to_string()];
        let diff = diff_runs(&cur, &prev);
        assert_eq!(diff.new, vec!["c"]);
        assert_eq!(diff.removed, vec!["a"]);
        assert_eq!(diff.unchanged_count, 1);

        // Self-diff is empty; new/removed are anti-symmetric.
        let self_diff = diff_runs(&cur, &cur);
        assert!(self_diff.new.is_empty() && self_diff.removed.is_empty());
        let back = diff_runs(&prev, &cur);
        assert_eq!(back.new, vec!["a"]);
        assert_eq!(back.removed, vec!["c"]);
    }

    #[test]
    fn source_ref_classifies_inputs() {
        assert_eq!(
            SourceRef::parse("weekly").unwrap(),
            SourceRef::Saved("weekly".into())
        );
        assert_eq!(
            SourceRef::parse("saved:weekly").unwrap(),
            SourceRef::Saved("weekly".into())
        );
        assert_eq!(
            SourceRef::parse("file:/tmp/p.yaml").unwrap(),
            SourceRef::File(PathBuf::from("/tmp/p.yaml"))
        );
        assert_eq!(
            SourceRef::parse("url:https://raw.githubusercontent.com/x/p.yaml").unwrap(),
            SourceRef::Url("https://raw.githubusercontent.com/x/p.yaml".into())
        );
        assert!(SourceRef::parse("https://example.com/p.yaml").is_err());
    }

    #[tokio::test]
    async fn url_loads_refuse_hosts_off_the_allow_list() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_both(&tmp);
        let gateway = Arc::new(
            Gateway::new(crate::gateway::GatewayConfig::new("litmcp-test".into())).unwrap(),
        );
        let err = store
            .load_source(
                &SourceRef::parse("url:https://evil.example.com/p.yaml").unwrap(),
                &gateway,
                &["raw.githubusercontent.com".to_string()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LitMcpError::InvalidInput(_)));
        assert!(err.to_string().contains("allow-list"));
    }

    #[tokio::test]
    async fn file_loads_refuse_parent_segments_and_out_of_scope_paths() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_both(&tmp);
        let gateway = Arc::new(
            Gateway::new(crate::gateway::GatewayConfig::new("litmcp-test".into())).unwrap(),
        );

        let err = store
            .load_source(
                &SourceRef::File(PathBuf::from("pipelines/../../etc/passwd")),
                &gateway,
                &[],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains(".."));

        // A real file outside both scope roots is refused too.
        let outside = tmp.path().join("outside.yaml");
        fs::write(&outside, "steps: []").unwrap();
        let err = store
            .load_source(&SourceRef::File(outside), &gateway, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, LitMcpError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn file_loads_inside_a_scope_root_succeed() {
        let tmp = TempDir::new().unwrap();
        let store = store_with_both(&tmp);
        let gateway = Arc::new(
            Gateway::new(crate::gateway::GatewayConfig::new("litmcp-test".into())).unwrap(),
        );
        store
            .save("inside", &sample_config(), ScopeSelector::Workspace)
            .unwrap();
        let path = tmp.path().join("project/.litmcp/pipelines/inside.yaml");
        let (text, _) = store
            .load_source(&SourceRef::File(path), &gateway, &[])
            .await
            .unwrap();
        assert!(text.contains("remimazolam"));
    }
}
