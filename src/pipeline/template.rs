//! Built-in pipeline templates. The catalog is closed and versioned with
//! the binary; resolution is a pure function from (name, params) to a
//! concrete pipeline.

use std::collections::BTreeMap;

use minijinja::{Environment, UndefinedBehavior};

use crate::error::LitMcpError;

use super::config::PipelineConfig;

pub struct TemplateParam {
    pub name: &'static str,
    pub required: bool,
    /// YAML literal merged in when the caller omits the parameter.
    pub default: Option<&'static str>,
    pub description: &'static str,
}

pub struct TemplateDef {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [TemplateParam],
    body: &'static str,
}

const QUICK: TemplateDef = TemplateDef {
    name: "quick",
    description: "Single fan-out search with ranking",
    params: &[
        TemplateParam {
            name: "query",
            required: true,
            default: None,
            description: "Free-text query",
        },
        TemplateParam {
            name: "sources",
            required: false,
            default: Some("[]"),
            description: "Source names; the default set when empty",
        },
        TemplateParam {
            name: "strategy",
            required: false,
            default: Some("balanced"),
            description: "Ranking strategy",
        },
        TemplateParam {
            name: "limit",
            required: false,
            default: Some("20"),
            description: "Result cap",
        },
    ],
    body: r#"
description: Single fan-out search with ranking
steps:
  - id: search
    action: search
    params:
      query: {{ query | tojson }}
{% if sources %}
      sources: {{ sources | tojson }}
{% endif %}
  - id: rank_results
    action: rank
    params:
      strategy: {{ strategy | tojson }}
      limit: {{ limit }}
output:
  limit: {{ limit }}
  ranking: {{ strategy | tojson }}
"#,
};

const PICO: TemplateDef = TemplateDef {
    name: "pico",
    description: "Clinical four-part question: one search per clause, merged and ranked",
    params: &[
        TemplateParam {
            name: "population",
            required: true,
            default: None,
            description: "Patient population clause",
        },
        TemplateParam {
            name: "intervention",
            required: true,
            default: None,
            description: "Intervention clause",
        },
        TemplateParam {
            name: "comparator",
            required: false,
            default: Some("\"\""),
            description: "Comparator clause, omitted when empty",
        },
        TemplateParam {
            name: "outcome",
            required: false,
            default: Some("\"\""),
            description: "Outcome clause, omitted when empty",
        },
        TemplateParam {
            name: "limit",
            required: false,
            default: Some("20"),
            description: "Result cap",
        },
    ],
    body: r#"
description: Clinical four-part question search
steps:
  - id: search_population
    action: search
    depends_on: []
    params:
      query: {{ population | tojson }}
  - id: search_intervention
    action: search
    depends_on: []
    params:
      query: {{ intervention | tojson }}
{% if comparator %}
  - id: search_comparator
    action: search
    depends_on: []
    params:
      query: {{ comparator | tojson }}
{% endif %}
{% if outcome %}
  - id: search_outcome
    action: search
    depends_on: []
    params:
      query: {{ outcome | tojson }}
{% endif %}
  - id: merge_clauses
    action: merge
    depends_on: [search_population, search_intervention{% if comparator %}, search_comparator{% endif %}{% if outcome %}, search_outcome{% endif %}]
  - id: rank_results
    action: rank
    params:
      strategy: balanced
      limit: {{ limit }}
output:
  limit: {{ limit }}
"#,
};

const COMPREHENSIVE: TemplateDef = TemplateDef {
    name: "comprehensive",
    description: "Vocabulary expansion, wide fan-out, metric enrichment, ranking",
    params: &[
        TemplateParam {
            name: "query",
            required: true,
            default: None,
            description: "Free-text query",
        },
        TemplateParam {
            name: "page_size",
            required: false,
            default: Some("25"),
            description: "Per-source page size",
        },
        TemplateParam {
            name: "strategy",
            required: false,
            default: Some("balanced"),
            description: "Ranking strategy",
        },
        TemplateParam {
            name: "limit",
            required: false,
            default: Some("50"),
            description: "Result cap",
        },
    ],
    body: r#"
description: Expanded wide search with enrichment
steps:
  - id: expand_query
    action: expand
    params:
      query: {{ query | tojson }}
  - id: search_all
    action: search
    params:
      page_size: {{ page_size }}
  - id: merge_results
    action: merge
  - id: enrich_metrics
    action: enrich
  - id: rank_results
    action: rank
    params:
      strategy: {{ strategy | tojson }}
      limit: {{ limit }}
output:
  limit: {{ limit }}
  ranking: {{ strategy | tojson }}
"#,
};

const CITATION_CHASE: TemplateDef = TemplateDef {
    name: "citation_chase",
    description: "Seed article plus everything it cites and everything citing it",
    params: &[
        TemplateParam {
            name: "id",
            required: true,
            default: None,
            description: "Seed identifier (PMID, PMCID, or DOI)",
        },
        TemplateParam {
            name: "limit",
            required: false,
            default: Some("30"),
            description: "Result cap",
        },
    ],
    body: r#"
description: Citation-graph neighborhood of one article
steps:
  - id: seed
    action: fetch-details
    params:
      ids: [{{ id | tojson }}]
  - id: cited_by
    action: fetch-citations
    depends_on: [seed]
  - id: references
    action: fetch-references
    depends_on: [seed]
  - id: neighborhood
    action: fetch-details
    depends_on: [cited_by, references]
  - id: merge_neighborhood
    action: merge
    depends_on: [seed, neighborhood]
  - id: rank_results
    action: rank
    params:
      strategy: most-cited
      limit: {{ limit }}
output:
  limit: {{ limit }}
  ranking: most-cited
"#,
};

const OA_SWEEP: TemplateDef = TemplateDef {
    name: "oa_sweep",
    description: "Open-access-only sweep over the archives and aggregators",
    params: &[
        TemplateParam {
            name: "query",
            required: true,
            default: None,
            description: "Free-text query",
        },
        TemplateParam {
            name: "limit",
            required: false,
            default: Some("20"),
            description: "Result cap",
        },
    ],
    body: r#"
description: Open-access availability sweep
steps:
  - id: search_oa
    action: search
    params:
      query: {{ query | tojson }}
      sources: [europepmc, core, openalex]
      open_access: true
  - id: filter_fulltext
    action: filter
    params:
      has_fulltext: true
  - id: rank_results
    action: rank
    params:
      strategy: balanced
      limit: {{ limit }}
output:
  limit: {{ limit }}
"#,
};

pub fn catalog() -> &'static [TemplateDef] {
    &[QUICK, PICO, COMPREHENSIVE, CITATION_CHASE, OA_SWEEP]
}

pub fn get(name: &str) -> Option<&'static TemplateDef> {
    catalog().iter().find(|t| t.name == name)
}

/// Resolve a template into concrete steps. All referenced parameters must
/// be supplied or carry a default; unknown parameters are rejected.
pub fn resolve(
    name: &str,
    params: &BTreeMap<String, serde_yaml::Value>,
) -> Result<PipelineConfig, LitMcpError> {
    let def = get(name).ok_or_else(|| {
        let known: Vec<&str> = catalog().iter().map(|t| t.name).collect();
        LitMcpError::invalid(format!(
            "Unknown template \"{name}\". Available: {}",
            known.join(", ")
        ))
    })?;

    for supplied in params.keys() {
        if !def.params.iter().any(|p| p.name == supplied) {
            return Err(LitMcpError::invalid(format!(
                "Template \"{name}\" has no parameter \"{supplied}\""
            )));
        }
    }

    let mut context: BTreeMap<String, minijinja::Value> = BTreeMap::new();
    for param in def.params {
        match params.get(param.name) {
            Some(value) => {
                context.insert(param.name.to_string(), minijinja::Value::from_serialize(value));
            }
            None => match param.default {
                Some(default) => {
                    let value: serde_yaml::Value = serde_yaml::from_str(default)
                        .map_err(|e| {
                            LitMcpError::Internal(format!(
                                "Template \"{name}\" default for \"{}\" is invalid: {e}",
                                param.name
                            ))
                        })?;
                    context.insert(
                        param.name.to_string(),
                        minijinja::Value::from_serialize(&value),
                    );
                }
                None => {
                    return Err(LitMcpError::invalid(format!(
                        "Template \"{name}\" requires parameter \"{}\"",
                        param.name
                    )));
                }
            },
        }
    }

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template(def.name, def.body)
        .map_err(|e| LitMcpError::Internal(format!("Template \"{name}\" is malformed: {e}")))?;
    let rendered = env
        .get_template(def.name)
        .and_then(|t| t.render(&context))
        .map_err(|e| {
            LitMcpError::invalid(format!("Template \"{name}\" substitution failed: {e}"))
        })?;

    let config = PipelineConfig::parse(&rendered)?;
    super::graph::topo_levels(&config.steps)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::StepAction;

    fn yaml(v: &str) -> serde_yaml::Value {
        serde_yaml::from_str(v).unwrap()
    }

    #[test]
    fn pico_emits_one_search_per_clause() {
        let mut params = BTreeMap::new();
        params.insert("population".into(), yaml("ICU patients"));
        params.insert("intervention".into(), yaml("remimazolam"));
        params.insert("comparator".into(), yaml("propofol"));
        params.insert("outcome".into(), yaml("delirium"));

        let config = resolve("pico", &params).unwrap();
        let searches: Vec<&str> = config
            .steps
            .iter()
            .filter(|s| s.action == StepAction::Search)
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(
            searches,
            vec![
                "search_population",
                "search_intervention",
                "search_comparator",
                "search_outcome"
            ]
        );
        let merge = config
            .steps
            .iter()
            .find(|s| s.action == StepAction::Merge)
            .unwrap();
        assert_eq!(merge.depends_on.as_ref().unwrap().len(), 4);
    }

    #[test]
    fn pico_without_comparator_drops_the_clause() {
        let mut params = BTreeMap::new();
        params.insert("population".into(), yaml("ICU patients"));
        params.insert("intervention".into(), yaml("remimazolam"));

        let config = resolve("pico", &params).unwrap();
        assert!(config.steps.iter().all(|s| s.id != "search_comparator"));
        let merge = config
            .steps
            .iter()
            .find(|s| s.action == StepAction::Merge)
            .unwrap();
        assert_eq!(merge.depends_on.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn missing_required_parameter_is_invalid_input() {
        let err = resolve("pico", &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("requires parameter"));
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let mut params = BTreeMap::new();
        params.insert("query".into(), yaml("x"));
        params.insert("mystery".into(), yaml("y"));
        let err = resolve("quick", &params).unwrap_err();
        assert!(err.to_string().contains("no parameter"));
    }

    #[test]
    fn unknown_template_lists_the_catalog() {
        let err = resolve("nonesuch", &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("pico"));
    }

    #[test]
    fn quoting_survives_awkward_query_text() {
        let mut params = BTreeMap::new();
        params.insert("query".into(), yaml("\"tricky: [query] {here}\""));
        let config = resolve("quick", &params).unwrap();
        let search = &config.steps[0];
        let p: crate::pipeline::config::SearchParams = search.typed_params().unwrap();
        assert_eq!(p.query.as_deref(), Some("tricky: [query] {here}"));
    }

    #[test]
    fn every_catalog_template_resolves_with_minimal_params() {
        for def in catalog() {
            let mut params = BTreeMap::new();
            for p in def.params {
                if p.required {
                    let value = if p.name == "id" { "22663011" } else { "sepsis" };
                    params.insert(p.name.to_string(), yaml(value));
                }
            }
            let config = resolve(def.name, &params)
                .unwrap_or_else(|e| panic!("template {} failed: {e}", def.name));
            assert!(!config.steps.is_empty(), "template {} has no steps", def.name);
        }
    }
}
