//! Agent-facing tool surface over the model-context protocol. Seven tools
//! route into the search engine, the pipeline store, and the scheduler;
//! saved pipelines and templates are also exposed as read-only resources,
//! and scheduled runs with new results emit `resources/updated`.

pub mod format;

use std::sync::Arc;

use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler, ServiceExt,
    handler::server::tool::{ToolCallContext, ToolRouter},
    handler::server::wrapper::Parameters,
    model::*,
    service::RequestContext,
    tool, tool_router,
};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{info, warn};

use crate::app::{App, SearchRequest};
use crate::config::AppConfig;
use crate::error::LitMcpError;
use crate::pipeline::OutputFormat;
use crate::sched::ChangeNotifier;
use crate::store::{Scope, ScopeSelector, SourceRef};

fn tool_error(err: LitMcpError) -> McpError {
    let message = format!("[{}] {err}", err.kind());
    match err {
        LitMcpError::InvalidInput(_)
        | LitMcpError::NotFound { .. }
        | LitMcpError::Conflict(_) => McpError::invalid_params(message, None),
        _ => McpError::internal_error(message, None),
    }
}

fn json_text(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UnifiedSearchParams {
    /// Free-text query (simple path). Mutually exclusive with `pipeline`.
    pub query: Option<String>,
    /// Inline pipeline YAML/JSON, or a reference: a saved name,
    /// `saved:<name>`, `file:<path>`, or `url:<https-url>`.
    pub pipeline: Option<String>,
    /// Session id; minted and returned when absent.
    pub session: Option<String>,
    /// Source names for the simple path (default: the built-in set).
    pub sources: Option<Vec<String>>,
    /// Ranking strategy: relevance, recent, most-cited, quality, impact,
    /// balanced.
    pub strategy: Option<String>,
    /// Result cap (default 20).
    pub limit: Option<usize>,
    /// Output rendering: structured or table.
    pub format: Option<String>,
    /// Render the result set as an export format instead: ris or bibtex.
    pub export: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SavePipelineParams {
    /// Storage name, `[A-Za-z0-9_-]{1,64}`.
    pub name: String,
    /// Pipeline document (YAML or JSON).
    pub config: String,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    /// workspace, global, or auto (default).
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListPipelinesParams {
    pub tag: Option<String>,
    /// workspace or global; both when absent.
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct LoadPipelineParams {
    /// Saved name, `saved:<name>`, `file:<path>`, or `url:<https-url>`.
    pub source: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeletePipelineParams {
    pub name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PipelineHistoryParams {
    pub name: String,
    /// Newest-first run count (default 10).
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SchedulePipelineParams {
    /// set, list, or status (default set).
    pub action: Option<String>,
    pub name: Option<String>,
    /// Five-field cron expression, minimum interval one hour.
    pub cron: Option<String>,
    /// Compute the run-over-run diff (default true).
    pub diff: Option<bool>,
    /// Emit resources/updated on new results (default false).
    pub notify: Option<bool>,
    pub enabled: Option<bool>,
}

#[derive(Clone)]
pub struct LitMcpServer {
    app: Arc<App>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl LitMcpServer {
    pub fn new(app: Arc<App>) -> Self {
        Self {
            app,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        name = "unified_search",
        description = "Search the scholarly literature across PubMed, Europe PMC, OpenAlex, Semantic Scholar, Crossref, CORE and more. Provide exactly one of `query` (free text; clinical PICO questions are detected) or `pipeline` (inline YAML/JSON, a saved name, file:<path>, or url:<https-url>). Results are deduplicated, ranked, and cached in the session; later tools can address them with the id token `last`."
    )]
    async fn unified_search(
        &self,
        params: Parameters<UnifiedSearchParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let export = p.export.clone();
        let reply = self
            .app
            .unified_search(SearchRequest {
                query: p.query,
                pipeline: p.pipeline,
                session: p.session,
                sources: p.sources.unwrap_or_default(),
                strategy: p.strategy,
                limit: p.limit,
                format: p.format,
            })
            .await
            .map_err(tool_error)?;

        let articles: Vec<_> = reply
            .result
            .articles
            .iter()
            .map(|s| s.article.clone())
            .collect();
        let text = if let Some(export) = export {
            format::export(&articles, &export).map_err(tool_error)?
        } else {
            match reply.format {
                OutputFormat::Structured => {
                    json_text(&format::structured_result(&reply.session_id, &reply.result))
                }
                OutputFormat::Table => format::table(&reply.session_id, &reply.result),
            }
        };
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    #[tool(
        name = "save_pipeline",
        description = "Save a pipeline document under a name. Scope: workspace (project-local), global (user-wide), or auto (workspace when available). Saving an existing name overwrites it."
    )]
    async fn save_pipeline(
        &self,
        params: Parameters<SavePipelineParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let mut config = crate::pipeline::PipelineConfig::parse(&p.config).map_err(tool_error)?;
        if let Some(description) = p.description {
            config.description = Some(description);
        }
        if let Some(tags) = p.tags {
            config.tags = tags;
        }
        let selector =
            ScopeSelector::parse(p.scope.as_deref().unwrap_or("auto")).map_err(tool_error)?;
        let meta = self
            .app
            .store
            .save(&p.name, &config, selector)
            .map_err(tool_error)?;
        // A schedule block inside the document registers it in one step.
        if let Some(schedule) = &config.schedule {
            self.app
                .scheduler
                .set_schedule(
                    &p.name,
                    &schedule.cron,
                    schedule.diff,
                    schedule.notify,
                    schedule.enabled,
                    time::OffsetDateTime::now_utc(),
                )
                .await
                .map_err(tool_error)?;
        }
        let value = serde_json::to_value(&meta)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(json_text(&value))]))
    }

    #[tool(
        name = "list_pipelines",
        description = "List saved pipelines from both scopes, optionally filtered by tag or scope. Workspace entries shadow same-named global ones on load."
    )]
    async fn list_pipelines(
        &self,
        params: Parameters<ListPipelinesParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let scope = match p.scope.as_deref() {
            None | Some("") => None,
            Some("workspace") => Some(Scope::Workspace),
            Some("global") => Some(Scope::Global),
            Some(other) => {
                return Err(McpError::invalid_params(
                    format!("Unknown scope \"{other}\""),
                    None,
                ));
            }
        };
        let list = self
            .app
            .store
            .list(p.tag.as_deref(), scope)
            .map_err(tool_error)?;
        let value = serde_json::to_value(&list)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(json_text(&value))]))
    }

    #[tool(
        name = "load_pipeline",
        description = "Load a pipeline's canonical text and metadata from a saved name, a scoped file path (file:<path>), or an allow-listed HTTPS URL (url:<u>)."
    )]
    async fn load_pipeline(
        &self,
        params: Parameters<LoadPipelineParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let source = SourceRef::parse(&p.source).map_err(tool_error)?;
        let (text, meta) = self
            .app
            .store
            .load_source(&source, &self.app.gateway, &self.app.config.allowed_url_hosts())
            .await
            .map_err(tool_error)?;
        // Re-parse so URL- and file-loaded documents are normalized too.
        let config = crate::pipeline::PipelineConfig::parse(&text).map_err(tool_error)?;
        let value = serde_json::json!({
            "pipeline": config.canonical_yaml().map_err(tool_error)?,
            "content_hash": config.content_hash().map_err(tool_error)?,
            "meta": meta,
        });
        Ok(CallToolResult::success(vec![Content::text(json_text(&value))]))
    }

    #[tool(
        name = "delete_pipeline",
        description = "Delete a saved pipeline, its run history, and any schedule that references it."
    )]
    async fn delete_pipeline(
        &self,
        params: Parameters<DeletePipelineParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let scope = self.app.store.delete(&p.name).map_err(tool_error)?;
        Ok(CallToolResult::success(vec![Content::text(format!(
            "Deleted pipeline \"{}\" from the {} scope.",
            p.name,
            scope.as_str()
        ))]))
    }

    #[tool(
        name = "get_pipeline_history",
        description = "Run summaries for a saved pipeline, newest first, each with its identifier diff against the previous run."
    )]
    async fn get_pipeline_history(
        &self,
        params: Parameters<PipelineHistoryParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        let history = self
            .app
            .store
            .history(&p.name, p.limit.unwrap_or(10).clamp(1, 100))
            .map_err(tool_error)?;
        let value = serde_json::to_value(&history)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(json_text(&value))]))
    }

    #[tool(
        name = "schedule_pipeline",
        description = "Manage cron schedules for saved pipelines. action=set registers or updates (name + cron required; minimum interval one hour, at most five enabled); action=list or status shows the schedule table."
    )]
    async fn schedule_pipeline(
        &self,
        params: Parameters<SchedulePipelineParams>,
    ) -> Result<CallToolResult, McpError> {
        let p = params.0;
        match p.action.as_deref().unwrap_or("set") {
            "list" | "status" => {
                let entries = self.app.scheduler.list().await;
                let value = serde_json::to_value(&entries)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                Ok(CallToolResult::success(vec![Content::text(json_text(&value))]))
            }
            "set" => {
                let name = p.name.as_deref().ok_or_else(|| {
                    McpError::invalid_params("schedule_pipeline set requires a name", None)
                })?;
                let cron = p.cron.as_deref().ok_or_else(|| {
                    McpError::invalid_params("schedule_pipeline set requires a cron", None)
                })?;
                let entry = self
                    .app
                    .scheduler
                    .set_schedule(
                        name,
                        cron,
                        p.diff.unwrap_or(true),
                        p.notify.unwrap_or(false),
                        p.enabled.unwrap_or(true),
                        time::OffsetDateTime::now_utc(),
                    )
                    .await
                    .map_err(tool_error)?;
                let value = serde_json::to_value(&entry)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                Ok(CallToolResult::success(vec![Content::text(json_text(&value))]))
            }
            other => Err(McpError::invalid_params(
                format!("Unknown action \"{other}\". Expected set, list, or status"),
                None,
            )),
        }
    }
}

impl LitMcpServer {
    fn read_resource_text(&self, uri: &str) -> Result<String, McpError> {
        if let Some(name) = uri.strip_prefix("pipeline://saved/") {
            let (config, _) = self.app.store.load(name).map_err(tool_error)?;
            return config.canonical_yaml().map_err(tool_error);
        }
        if let Some(name) = uri.strip_prefix("pipeline://templates/") {
            let def = crate::pipeline::template::get(name).ok_or_else(|| {
                McpError::invalid_params(format!("Unknown template \"{name}\""), None)
            })?;
            let params: Vec<serde_json::Value> = def
                .params
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.name,
                        "required": p.required,
                        "default": p.default,
                        "description": p.description,
                    })
                })
                .collect();
            return Ok(json_text(&serde_json::json!({
                "name": def.name,
                "description": def.description,
                "params": params,
            })));
        }
        if let Some(rest) = uri.strip_prefix("pipeline://history/") {
            let Some(name) = rest.strip_suffix("/latest") else {
                return Err(McpError::invalid_params(
                    "History resources use pipeline://history/{name}/latest",
                    None,
                ));
            };
            let run = self
                .app
                .store
                .last_run(name)
                .map_err(tool_error)?
                .ok_or_else(|| {
                    McpError::invalid_params(format!("Pipeline \"{name}\" has no runs yet"), None)
                })?;
            let value = serde_json::to_value(&run)
                .map_err(|e| McpError::internal_error(e.to_string(), None))?;
            return Ok(json_text(&value));
        }
        Err(McpError::invalid_params(
            format!("Unknown resource URI \"{uri}\""),
            None,
        ))
    }
}

impl ServerHandler for LitMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Literature-research aggregation server. unified_search fans a \
                 query out across biomedical and scholarly sources, deduplicates \
                 and ranks the results, and caches them per session (address the \
                 newest set with the id token `last`). save_pipeline / \
                 list_pipelines / load_pipeline / delete_pipeline manage named \
                 search pipelines in workspace and global scopes; \
                 get_pipeline_history and schedule_pipeline re-run them on cron \
                 schedules with run-over-run diffs."
                    .into(),
            ),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: None }),
                resources: Some(ResourcesCapability {
                    subscribe: None,
                    list_changed: None,
                }),
                ..Default::default()
            },
            server_info: Implementation {
                name: "litmcp".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: Some("litmcp".into()),
                icons: None,
                website_url: None,
            },
            ..Default::default()
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult {
            tools: self.tool_router.list_all(),
            next_cursor: None,
        }))
    }

    fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        let tool_context = ToolCallContext::new(self, request, context);
        async move { self.tool_router.call(tool_context).await }
    }

    fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListResourcesResult, McpError>> + Send + '_ {
        let mut resources = Vec::new();
        if let Ok(saved) = self.app.store.list(None, None) {
            for meta in saved {
                let mut raw = RawResource::new(
                    format!("pipeline://saved/{}", meta.name),
                    meta.name.clone(),
                );
                raw.description = meta.description.clone();
                raw.mime_type = Some("application/yaml".into());
                resources.push(raw.no_annotation());
            }
        }
        for def in crate::pipeline::template::catalog() {
            let mut raw = RawResource::new(
                format!("pipeline://templates/{}", def.name),
                def.name.to_string(),
            );
            raw.description = Some(def.description.to_string());
            raw.mime_type = Some("application/json".into());
            resources.push(raw.no_annotation());
        }
        std::future::ready(Ok(ListResourcesResult {
            resources,
            next_cursor: None,
        }))
    }

    fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ReadResourceResult, McpError>> + Send + '_ {
        let outcome = self.read_resource_text(&request.uri).map(|text| {
            ReadResourceResult {
                contents: vec![ResourceContents::text(text, request.uri.clone())],
            }
        });
        std::future::ready(outcome)
    }
}

/// Notifier that forwards scheduler events to the connected MCP peer;
/// falls back to logging until a peer attaches.
pub struct McpNotifier {
    peer: std::sync::Mutex<Option<rmcp::service::Peer<RoleServer>>>,
}

impl McpNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peer: std::sync::Mutex::new(None),
        })
    }

    pub fn attach(&self, peer: rmcp::service::Peer<RoleServer>) {
        *self.peer.lock().expect("notifier lock") = Some(peer);
    }
}

impl ChangeNotifier for McpNotifier {
    fn resource_updated(&self, uri: &str) {
        let peer = self.peer.lock().expect("notifier lock").clone();
        match peer {
            Some(peer) => {
                let uri = uri.to_string();
                tokio::spawn(async move {
                    let params = ResourceUpdatedNotificationParam { uri: uri.clone() };
                    if let Err(err) = peer.notify_resource_updated(params).await {
                        warn!(uri, error = %err, "resource notification failed");
                    }
                });
            }
            None => info!(uri, "resource updated (no peer attached)"),
        }
    }
}

/// Run the MCP server over stdio until the peer disconnects.
pub async fn serve_stdio(config: AppConfig) -> anyhow::Result<()> {
    let notifier = McpNotifier::new();
    let app = App::with_notifier(config, notifier.clone())?;
    app.start_background().await?;

    let server = LitMcpServer::new(app.clone());
    let service = server
        .serve(rmcp::transport::io::stdio())
        .await
        .inspect_err(|e| {
            eprintln!("MCP serve error: {e}");
        })?;
    notifier.attach(service.peer().clone());
    service.waiting().await?;
    app.shutdown();
    Ok(())
}
