//! Query analyzer: classifies free text, decomposes clinical four-part
//! questions, and expands topic terms through the thesaurus. It rewrites
//! queries; it never dispatches a search.

use std::sync::Arc;

use regex::Regex;
use tracing::warn;

use crate::entities::{ArticleId, NormalizedQuery, PicoQuestion, QueryKind};
use crate::error::LitMcpError;
use crate::rank::tokenize;
use crate::sources::mesh::MeshClient;
use crate::sources::CallCtx;

pub struct QueryAnalyzer {
    mesh: Arc<MeshClient>,
    field_tag: Regex,
    boolean_op: Regex,
    comparative: Regex,
    population_re: Regex,
    intervention_re: Regex,
    comparator_re: Regex,
    outcome_re: Regex,
}

/// Per-query caps keep expansion traffic bounded.
const MAX_EXPANDED_TERMS: usize = 4;

impl QueryAnalyzer {
    pub fn new(mesh: Arc<MeshClient>) -> Self {
        Self {
            mesh,
            // PubMed-style [Field] tags or EuropePMC-style FIELD: tags.
            field_tag: Regex::new(r"\[[A-Za-z][A-Za-z /-]*\]|\b[A-Z_]{2,}:").expect("static regex"),
            boolean_op: Regex::new(r"\b(AND|OR|NOT)\b").expect("static regex"),
            comparative: Regex::new(r"(?i)\b(vs\.?|versus|compared\s+(?:to|with))\b")
                .expect("static regex"),
            population_re: Regex::new(
                r"(?i)\b(?:in|among)\s+([A-Za-z0-9][A-Za-z0-9 \-]*?)\s*(?:,|\?|$|\bdoes\b|\bis\b|\bdo\b)",
            )
            .expect("static regex"),
            intervention_re: Regex::new(
                r"(?i)\b(?:does|is|can)\s+([A-Za-z0-9][A-Za-z0-9 \-]*?)\s+(?:vs\.?|versus|compared\s+(?:to|with))\b",
            )
            .expect("static regex"),
            comparator_re: Regex::new(
                r"(?i)\b(?:vs\.?|versus|compared\s+(?:to|with))\s+([A-Za-z0-9][A-Za-z0-9 \-]*?)\s*(?:,|\?|$|\breduce\b|\bimprove\b|\bprevent\b|\bincrease\b|\bdecrease\b|\blower\b|\bfor\b|\bon\b)",
            )
            .expect("static regex"),
            outcome_re: Regex::new(
                r"(?i)\b(?:reduce|improve|prevent|increase|decrease|lower|affect)\s+([A-Za-z0-9][A-Za-z0-9 \-]*?)\s*(?:\?|$|,)",
            )
            .expect("static regex"),
        }
    }

    /// Classification heuristics, in precedence order: a bare identifier,
    /// boolean operators with field tags, a four-part comparative phrase,
    /// otherwise a plain topic.
    pub fn classify(&self, text: &str) -> QueryKind {
        let text = text.trim();
        if ArticleId::parse(text).is_some() {
            return QueryKind::IdentifierLookup;
        }
        if self.boolean_op.is_match(text) && self.field_tag.is_match(text) {
            return QueryKind::Boolean;
        }
        if self.comparative.is_match(text) {
            return QueryKind::ClinicalQuestion;
        }
        QueryKind::SimpleTopic
    }

    /// Decompose a clinical question. Parts that do not parse stay empty;
    /// nothing is guessed.
    pub fn parse_pico(&self, text: &str) -> PicoQuestion {
        let capture = |re: &Regex| {
            re.captures(text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut pico = PicoQuestion {
            population: capture(&self.population_re),
            intervention: capture(&self.intervention_re),
            comparator: capture(&self.comparator_re),
            outcome: capture(&self.outcome_re),
        };
        // Fallback: "<intervention> vs <comparator>" without a leading verb.
        if pico.intervention.is_none()
            && let Some(m) = self.comparative.find(text)
        {
            let head = text[..m.start()].trim();
            let tail_words: Vec<&str> = head.split_whitespace().rev().take(2).collect();
            if !tail_words.is_empty() {
                let candidate = tail_words
                    .into_iter()
                    .rev()
                    .collect::<Vec<_>>()
                    .join(" ");
                let candidate = candidate
                    .trim_start_matches(|c: char| !c.is_alphanumeric())
                    .to_string();
                if !candidate.is_empty()
                    && pico.population.as_deref() != Some(candidate.as_str())
                {
                    pico.intervention = Some(candidate);
                }
            }
        }
        pico
    }

    /// Classification and clinical-part parsing without any thesaurus
    /// traffic. Pipeline search steps normalize their `query` params this
    /// way; expansion is the `expand` action's job.
    pub fn normalize_only(&self, text: &str) -> Result<NormalizedQuery, LitMcpError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(LitMcpError::invalid("Query must not be empty"));
        }
        let mut query = NormalizedQuery::topic(text);
        query.kind = self.classify(text);
        if query.kind == QueryKind::ClinicalQuestion {
            query.pico = Some(self.parse_pico(text));
        }
        Ok(query)
    }

    /// Build the normalized query for a free-text input: classify, parse
    /// the clinical parts, and expand topic terms. Thesaurus failures
    /// leave terms unexpanded rather than failing the query.
    pub async fn analyze(
        &self,
        text: &str,
        ctx: &CallCtx,
    ) -> Result<NormalizedQuery, LitMcpError> {
        let mut query = self.normalize_only(text)?;
        if matches!(query.kind, QueryKind::SimpleTopic | QueryKind::ClinicalQuestion) {
            self.expand_in_place(&mut query, ctx).await?;
        }
        Ok(query)
    }

    /// Vocabulary expansion for an already-normalized query (the `expand`
    /// pipeline action). Touches only the thesaurus.
    pub async fn expand_in_place(
        &self,
        query: &mut NormalizedQuery,
        ctx: &CallCtx,
    ) -> Result<(), LitMcpError> {
        let mut terms: Vec<String> = Vec::new();
        match &query.pico {
            Some(pico) => {
                for (_, part) in pico.parts() {
                    if let Some(part) = part {
                        terms.extend(tokenize(part));
                    }
                }
            }
            None => terms.extend(tokenize(&query.text)),
        }
        terms.dedup();
        terms.truncate(MAX_EXPANDED_TERMS);

        for term in terms {
            if query.expansions.contains_key(&term) {
                continue;
            }
            match self.mesh.expand(&term, ctx).await {
                Ok(Some(expansion)) => {
                    query.expansions.insert(term, expansion);
                }
                Ok(None) => {}
                Err(LitMcpError::Cancelled) => return Err(LitMcpError::Cancelled),
                Err(err) => {
                    warn!(term, error = %err, "thesaurus expansion failed");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Gateway, GatewayConfig};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn analyzer_for(server: &MockServer) -> QueryAnalyzer {
        let mut config = GatewayConfig::new("litmcp-test".into());
        config.policies.clear();
        let gateway = Arc::new(Gateway::new(config).unwrap());
        QueryAnalyzer::new(Arc::new(MeshClient::new_for_test(gateway, server.uri())))
    }

    fn offline_analyzer() -> QueryAnalyzer {
        let mut config = GatewayConfig::new("litmcp-test".into());
        config.policies.clear();
        let gateway = Arc::new(Gateway::new(config).unwrap());
        QueryAnalyzer::new(Arc::new(MeshClient::new_for_test(
            gateway,
            "http://127.0.0.1:1".into(),
        )))
    }

    #[test]
    fn classify_distinguishes_the_four_kinds() {
        let a = offline_analyzer();
        assert_eq!(a.classify("22663011"), QueryKind::IdentifierLookup);
        assert_eq!(
            a.classify("doi:10.1056/NEJMoa1203421"),
            QueryKind::IdentifierLookup
        );
        assert_eq!(
            a.classify("remimazolam[Title] AND sedation[MeSH Terms]"),
            QueryKind::Boolean
        );
        assert_eq!(
            a.classify("AUTH:doe AND OPEN_ACCESS:y"),
            QueryKind::Boolean
        );
        assert_eq!(
            a.classify("In ICU patients, does remimazolam versus propofol reduce delirium?"),
            QueryKind::ClinicalQuestion
        );
        assert_eq!(a.classify("remimazolam ICU sedation"), QueryKind::SimpleTopic);
        // Operators without field tags stay a topic query.
        assert_eq!(a.classify("cats AND dogs"), QueryKind::SimpleTopic);
    }

    #[test]
    fn parse_pico_extracts_all_four_parts() {
        let a = offline_analyzer();
        let pico =
            a.parse_pico("In ICU patients, does remimazolam versus propofol reduce delirium?");
        assert_eq!(pico.population.as_deref(), Some("ICU patients"));
        assert_eq!(pico.intervention.as_deref(), Some("remimazolam"));
        assert_eq!(pico.comparator.as_deref(), Some("propofol"));
        assert_eq!(pico.outcome.as_deref(), Some("delirium"));
        assert_eq!(pico.present_count(), 4);
    }

    #[test]
    fn parse_pico_leaves_unparseable_parts_empty() {
        let a = offline_analyzer();
        let pico = a.parse_pico("remimazolam vs propofol");
        assert_eq!(pico.population, None);
        assert_eq!(pico.intervention.as_deref(), Some("remimazolam"));
        assert_eq!(pico.comparator.as_deref(), Some("propofol"));
        assert_eq!(pico.outcome, None);
    }

    #[tokio::test]
    async fn analyze_expands_topic_terms() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .and(query_param("term", "midazolam"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "esearchresult": {"idlist": ["68019315"]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/esearch.fcgi"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "esearchresult": {"idlist": []}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/esummary.fcgi"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": {"68019315": {"ds_meshterms": ["Midazolam", "Versed"]}}
            })))
            .mount(&server)
            .await;

        let analyzer = analyzer_for(&server);
        let ctx = CallCtx::with_timeout(std::time::Duration::from_secs(10));
        let query = analyzer.analyze("midazolam weaning", &ctx).await.unwrap();
        assert_eq!(query.kind, QueryKind::SimpleTopic);
        let exp = query.expansions.get("midazolam").unwrap();
        assert_eq!(exp.preferred, "Midazolam");
        assert_eq!(exp.synonyms, vec!["Versed"]);
        // Unknown terms pass through without an entry.
        assert!(!query.expansions.contains_key("weaning"));
    }

    #[tokio::test]
    async fn analyze_rejects_empty_queries() {
        let analyzer = offline_analyzer();
        let ctx = CallCtx::with_timeout(std::time::Duration::from_secs(1));
        assert!(matches!(
            analyzer.analyze("  ", &ctx).await,
            Err(LitMcpError::InvalidInput(_))
        ));
    }
}
