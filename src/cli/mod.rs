//! Top-level CLI parsing and command execution.

use clap::{Parser, Subcommand};

use crate::app::{App, SearchRequest};
use crate::config::AppConfig;
use crate::mcp::format;
use crate::pipeline::OutputFormat;
use crate::store::Scope;

pub mod health;

#[derive(Parser, Debug)]
#[command(
    name = "litmcp",
    about = "Literature-research MCP server: multi-source scholarly search, saved pipelines, scheduling",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output as JSON instead of Markdown
    #[arg(short, long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the MCP server over stdio
    Mcp,
    /// Alias for `mcp`
    Serve,
    /// One-shot search from the command line
    Search {
        /// Free-text query
        query: Vec<String>,
        /// Result cap
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Ranking strategy: relevance, recent, most-cited, quality, impact, balanced
        #[arg(long, default_value = "balanced")]
        strategy: String,
        /// Restrict to specific sources (repeatable)
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Saved-pipeline management
    Pipeline {
        #[command(subcommand)]
        cmd: PipelineCommand,
    },
    /// Check external source connectivity
    Health,
}

#[derive(Subcommand, Debug)]
pub enum PipelineCommand {
    /// List saved pipelines from both scopes
    List {
        #[arg(long)]
        tag: Option<String>,
        /// workspace or global; both when omitted
        #[arg(long)]
        scope: Option<String>,
    },
    /// Print a saved pipeline's canonical text
    Show { name: String },
    /// Delete a saved pipeline, its runs, and its schedule
    Delete { name: String },
    /// Show run history with diffs
    History {
        name: String,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    match cli.command {
        Commands::Mcp | Commands::Serve => crate::mcp::serve_stdio(config).await,
        Commands::Search {
            query,
            limit,
            strategy,
            sources,
        } => {
            let app = App::new(config)?;
            let reply = app
                .unified_search(SearchRequest {
                    query: Some(query.join(" ")),
                    limit: Some(limit),
                    strategy: Some(strategy),
                    sources,
                    format: Some(if cli.json { "structured" } else { "table" }.into()),
                    ..SearchRequest::default()
                })
                .await?;
            match reply.format {
                OutputFormat::Structured => println!(
                    "{}",
                    serde_json::to_string_pretty(&format::structured_result(
                        &reply.session_id,
                        &reply.result
                    ))?
                ),
                OutputFormat::Table => println!("{}", format::table(&reply.session_id, &reply.result)),
            }
            Ok(())
        }
        Commands::Pipeline { cmd } => {
            let app = App::new(config)?;
            run_pipeline_command(&app, cmd, cli.json)
        }
        Commands::Health => {
            let app = App::new(config)?;
            let report = health::check(&app.gateway).await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.to_markdown());
            }
            if report.all_healthy() {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
    }
}

fn run_pipeline_command(app: &App, cmd: PipelineCommand, json: bool) -> anyhow::Result<()> {
    match cmd {
        PipelineCommand::List { tag, scope } => {
            let scope = match scope.as_deref() {
                None => None,
                Some("workspace") => Some(Scope::Workspace),
                Some("global") => Some(Scope::Global),
                Some(other) => anyhow::bail!("unknown scope \"{other}\""),
            };
            let list = app.store.list(tag.as_deref(), scope)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else if list.is_empty() {
                println!("No saved pipelines.");
            } else {
                println!("| Name | Scope | Steps | Tags | Updated |");
                println!("|------|-------|-------|------|---------|");
                for meta in list {
                    println!(
                        "| {} | {} | {} | {} | {} |",
                        meta.name,
                        meta.scope.as_str(),
                        meta.step_count,
                        meta.tags.join(", "),
                        meta.updated_at
                            .format(&time::format_description::well_known::Rfc3339)
                            .unwrap_or_default(),
                    );
                }
            }
            Ok(())
        }
        PipelineCommand::Show { name } => {
            let (config, meta) = app.store.load(&name)?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "meta": meta,
                        "pipeline": config.canonical_yaml()?,
                    }))?
                );
            } else {
                println!("# {} ({})\n", meta.name, meta.scope.as_str());
                println!("{}", config.canonical_yaml()?);
            }
            Ok(())
        }
        PipelineCommand::Delete { name } => {
            let scope = app.store.delete(&name)?;
            println!("Deleted \"{name}\" from the {} scope.", scope.as_str());
            Ok(())
        }
        PipelineCommand::History { name, limit } => {
            let history = app.store.history(&name, limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&history)?);
            } else if history.is_empty() {
                println!("No runs recorded for \"{name}\".");
            } else {
                println!("| Run | Status | Articles | New | Removed | Unchanged |");
                println!("|-----|--------|----------|-----|---------|-----------|");
                for run in history {
                    let (new, removed, unchanged) = run
                        .diff
                        .as_ref()
                        .map(|d| (d.new.len(), d.removed.len(), d.unchanged_count))
                        .unwrap_or((0, 0, 0));
                    println!(
                        "| {} | {} | {} | {} | {} | {} |",
                        run.run_id,
                        run.status.as_str(),
                        run.article_count,
                        new,
                        removed,
                        unchanged
                    );
                }
            }
            Ok(())
        }
    }
}
