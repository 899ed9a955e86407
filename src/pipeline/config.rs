//! Pipeline document model. Two interchangeable input shapes are accepted
//! (YAML's structured-indent form and JSON's braces-plus-quotes form, which
//! the YAML parser also reads); saving always re-serializes to YAML, and
//! the content hash covers that canonical form rather than the raw text.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::LitMcpError;
use crate::rank::RankStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepAction {
    Search,
    Expand,
    Merge,
    Filter,
    Rank,
    Enrich,
    FetchDetails,
    FetchCitations,
    FetchReferences,
    FetchFulltext,
}

impl StepAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Expand => "expand",
            Self::Merge => "merge",
            Self::Filter => "filter",
            Self::Rank => "rank",
            Self::Enrich => "enrich",
            Self::FetchDetails => "fetch-details",
            Self::FetchCitations => "fetch-citations",
            Self::FetchReferences => "fetch-references",
            Self::FetchFulltext => "fetch-fulltext",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub action: StepAction,
    #[serde(default, skip_serializing_if = "is_null")]
    pub params: serde_yaml::Value,
    /// `None` defaults to the previous step; an explicit empty list makes
    /// the step a root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
}

fn is_null(value: &serde_yaml::Value) -> bool {
    matches!(value, serde_yaml::Value::Null)
}

impl Step {
    /// Action-specific params, decoded on demand.
    pub fn typed_params<T: serde::de::DeserializeOwned + Default>(
        &self,
    ) -> Result<T, LitMcpError> {
        if is_null(&self.params) {
            return Ok(T::default());
        }
        serde_yaml::from_value(self.params.clone()).map_err(|e| {
            LitMcpError::invalid(format!("Step \"{}\": invalid params: {e}", self.id))
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    #[default]
    Structured,
    Table,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSpec {
    pub format: OutputFormat,
    pub limit: usize,
    pub ranking: RankStrategy,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            format: OutputFormat::Structured,
            limit: 20,
            ranking: RankStrategy::Balanced,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub cron: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub diff: bool,
    #[serde(default)]
    pub notify: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub template_params: BTreeMap<String, serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub output: OutputSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleSpec>,
}

impl PipelineConfig {
    /// Parse either input shape.
    pub fn parse(text: &str) -> Result<Self, LitMcpError> {
        let config: Self = serde_yaml::from_str(text)
            .map_err(|e| LitMcpError::invalid(format!("Pipeline parse error: {e}")))?;
        config.validate_shape()?;
        Ok(config)
    }

    /// Structural checks that need no graph analysis.
    pub fn validate_shape(&self) -> Result<(), LitMcpError> {
        match (&self.template, self.steps.is_empty()) {
            (Some(_), false) => {
                return Err(LitMcpError::invalid(
                    "Pipeline must set either \"template\" or \"steps\", not both",
                ));
            }
            (None, true) => {
                return Err(LitMcpError::invalid(
                    "Pipeline needs a \"template\" or at least one step",
                ));
            }
            _ => {}
        }

        let mut seen = BTreeSet::new();
        for step in &self.steps {
            let id = step.id.trim();
            if id.is_empty() {
                return Err(LitMcpError::invalid("Step ids must not be empty"));
            }
            if !seen.insert(id.to_string()) {
                return Err(LitMcpError::invalid(format!("Duplicate step id \"{id}\"")));
            }
        }
        if self.output.limit == 0 {
            return Err(LitMcpError::invalid("output.limit must be at least 1"));
        }
        Ok(())
    }

    /// Expand the template reference, if any, into concrete steps. The
    /// result always carries steps and no template fields.
    pub fn resolve(&self) -> Result<Self, LitMcpError> {
        let Some(template) = &self.template else {
            return Ok(self.clone());
        };
        let resolved = super::template::resolve(template, &self.template_params)?;
        Ok(Self {
            name: self.name.clone().or(resolved.name),
            description: self.description.clone().or(resolved.description),
            tags: if self.tags.is_empty() {
                resolved.tags
            } else {
                self.tags.clone()
            },
            template: None,
            template_params: BTreeMap::new(),
            steps: resolved.steps,
            output: resolved.output,
            schedule: self.schedule.clone().or(resolved.schedule),
        })
    }

    /// Canonical serialized form; reformatting the input does not change it.
    pub fn canonical_yaml(&self) -> Result<String, LitMcpError> {
        serde_yaml::to_string(self)
            .map_err(|e| LitMcpError::Internal(format!("Pipeline serialization failed: {e}")))
    }

    /// SHA-256 over the canonical form.
    pub fn content_hash(&self) -> Result<String, LitMcpError> {
        let yaml = self.canonical_yaml()?;
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Typed `params` for search steps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    pub query: Option<String>,
    pub sources: Vec<String>,
    pub page_size: Option<usize>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub language: Option<String>,
    pub open_access: Option<bool>,
    pub article_types: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub article_types: Vec<String>,
    pub has_fulltext: Option<bool>,
    pub open_access: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RankParams {
    pub strategy: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FetchParams {
    pub ids: Vec<String>,
    pub limit: Option<usize>,
}
