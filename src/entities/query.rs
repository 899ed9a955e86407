use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::article::{PubDate, PublicationType};

/// How the analyzer classified the free-text query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryKind {
    SimpleTopic,
    Boolean,
    ClinicalQuestion,
    IdentifierLookup,
}

/// A clinical four-element question. Unparseable parts stay empty; they are
/// never guessed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PicoQuestion {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub population: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intervention: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl PicoQuestion {
    pub fn parts(&self) -> [(&'static str, Option<&str>); 4] {
        [
            ("population", self.population.as_deref()),
            ("intervention", self.intervention.as_deref()),
            ("comparator", self.comparator.as_deref()),
            ("outcome", self.outcome.as_deref()),
        ]
    }

    pub fn present_count(&self) -> usize {
        self.parts().iter().filter(|(_, v)| v.is_some()).count()
    }
}

/// Thesaurus expansion of one topic term.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermExpansion {
    pub preferred: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synonyms: Vec<String>,
}

/// The normalized query object every adapter consumes. Adapters translate
/// the subset they support and report the rest back as unsupported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedQuery {
    pub text: String,
    pub kind: QueryKind,
    /// Controlled-vocabulary expansions keyed by the original term.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub expansions: BTreeMap<String, TermExpansion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pico: Option<PicoQuestion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_from: Option<PubDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_to: Option<PubDate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub article_types: Vec<PublicationType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub open_access_only: bool,
    /// Demographic filters (e.g. "humans", "female", "aged"). Most sources
    /// cannot express these and report them back as unsupported.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub demographics: Vec<String>,
}

impl Default for QueryKind {
    fn default() -> Self {
        Self::SimpleTopic
    }
}

impl NormalizedQuery {
    pub fn topic(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn is_clinical(&self) -> bool {
        self.kind == QueryKind::ClinicalQuestion
    }

    /// The query with expansion synonyms appended, for sources that take a
    /// flat term list instead of fielded syntax.
    pub fn expanded_text(&self) -> String {
        if self.expansions.is_empty() {
            return self.text.clone();
        }
        let mut out = self.text.clone();
        for exp in self.expansions.values() {
            for syn in &exp.synonyms {
                if !out.to_lowercase().contains(&syn.to_lowercase()) {
                    out.push(' ');
                    out.push_str(syn);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pico_present_count_skips_empty_parts() {
        let pico = PicoQuestion {
            population: Some("ICU patients".into()),
            intervention: Some("remimazolam".into()),
            comparator: None,
            outcome: Some("delirium".into()),
        };
        assert_eq!(pico.present_count(), 3);
        assert_eq!(PicoQuestion::default().present_count(), 0);
    }

    #[test]
    fn expanded_text_appends_new_synonyms_once() {
        let mut q = NormalizedQuery::topic("midazolam sedation");
        q.expansions.insert(
            "midazolam".into(),
            TermExpansion {
                preferred: "Midazolam".into(),
                synonyms: vec!["Versed".into(), "Sedation".into()],
            },
        );
        let text = q.expanded_text();
        assert!(text.contains("Versed"));
        // Already present in the query, case-insensitively.
        assert_eq!(text.to_lowercase().matches("sedation").count(), 1);
    }
}
