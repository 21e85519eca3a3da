//! Rule sets for the offline extraction stages
//!
//! ```toml
//! [[terms]]
//! text = "Acme Corp"
//! class = "ex:Organization"
//! aliases = ["Acme"]
//!
//! [[patterns]]
//! regex = "\\b[A-Z][a-z]+ [A-Z][a-z]+\\b"
//! class = "Person"
//! confidence = 0.6
//!
//! [[relations]]
//! subject = "Person"
//! object = "Organization"
//! predicate = "meetingWith"
//! keywords = ["met with", "meeting with"]
//! ```
//!
//! Class and predicate names are resolved against the ontology at
//! extraction time, so one rule set can serve several ontology versions.

use std::path::Path;

use kex_core::{KexError, Result};
use serde::{Deserialize, Serialize};

fn default_confidence() -> f64 {
    0.8
}

fn default_max_distance() -> usize {
    50
}

/// Dictionary entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermRule {
    pub text: String,
    pub class: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

/// Regex entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRule {
    pub regex: String,
    pub class: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

/// Keyword-triggered relation between two typed entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRule {
    pub subject: String,
    pub object: String,
    pub predicate: String,
    pub keywords: Vec<String>,
    /// Maximum gap between the two mentions, in bytes
    #[serde(default = "default_max_distance")]
    pub max_distance: usize,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

/// Terms, patterns, and relation rules loaded from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub terms: Vec<TermRule>,
    #[serde(default)]
    pub patterns: Vec<PatternRule>,
    #[serde(default)]
    pub relations: Vec<RelationRule>,
}

impl RuleSet {
    pub fn from_toml(source: &str) -> Result<Self> {
        let rules: Self = toml::from_str(source)
            .map_err(|e| KexError::Config(format!("Invalid rule set: {e}")))?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            KexError::Config(format!("Failed to read rule set {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.patterns.is_empty() && self.relations.is_empty()
    }

    fn validate(&self) -> Result<()> {
        let confidences = self
            .terms
            .iter()
            .map(|t| t.confidence)
            .chain(self.patterns.iter().map(|p| p.confidence))
            .chain(self.relations.iter().map(|r| r.confidence));
        for c in confidences {
            if !(0.0..=1.0).contains(&c) {
                return Err(KexError::Config(format!(
                    "Rule confidence {c} outside [0, 1]"
                )));
            }
        }
        if let Some(rule) = self.relations.iter().find(|r| r.keywords.is_empty()) {
            return Err(KexError::Config(format!(
                "Relation rule for {} has no keywords",
                rule.predicate
            )));
        }
        Ok(())
    }
}
