//! Hostname Rules Engine
//!
//! Named regex rules mapping a TLS server name to allow or deny.
//! Rules are evaluated in load order and the first enabled match wins;
//! no match is left to the caller, which rejects.

use l7proxify_shared::{Error, Result};
use regex::Regex;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Action to take when a rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Deny,
}

impl RuleAction {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(RuleAction::Allow),
            "deny" => Some(RuleAction::Deny),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Allow => "allow",
            RuleAction::Deny => "deny",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule as written in configuration, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    /// Regular expression matched against the server name
    #[serde(rename = "match")]
    pub pattern: String,
    /// "allow" or "deny"
    pub action: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Rule definitions keyed by name, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSpecs(pub Vec<(String, RuleSpec)>);

impl<'de> Deserialize<'de> for RuleSpecs {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SpecsVisitor;

        impl<'de> Visitor<'de> for SpecsVisitor {
            type Value = RuleSpecs;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of rule names to rules")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<RuleSpecs, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut rules = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, spec)) = map.next_entry::<String, RuleSpec>()? {
                    rules.push((name, spec));
                }
                Ok(RuleSpecs(rules))
            }
        }

        deserializer.deserialize_map(SpecsVisitor)
    }
}

/// A validated rule with its compiled pattern
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub pattern: Regex,
    pub action: RuleAction,
    pub enabled: bool,
}

impl Rule {
    fn from_spec(name: &str, spec: &RuleSpec) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidRule {
            name: name.to_string(),
            reason,
        };

        if name.is_empty() {
            return Err(invalid("rule is missing a name".into()));
        }
        let action = RuleAction::parse(&spec.action)
            .ok_or_else(|| invalid(format!("invalid action '{}'", spec.action)))?;
        let pattern = Regex::new(&spec.pattern)
            .map_err(|e| invalid(format!("cannot compile match pattern: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            pattern,
            action,
            enabled: spec.enabled,
        })
    }
}

/// Outcome of evaluating a host name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub rule: String,
    pub action: RuleAction,
}

/// Rules engine that evaluates rules in order
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    /// Build an engine from configuration. Any invalid rule fails the whole load.
    pub fn load(specs: &RuleSpecs) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(specs.0.len());

        for (name, spec) in &specs.0 {
            if !seen.insert(name.as_str()) {
                return Err(Error::InvalidRule {
                    name: name.clone(),
                    reason: "duplicate rule name".into(),
                });
            }
            let rule = Rule::from_spec(name, spec)?;
            debug!(
                rule = %rule.name,
                pattern = %rule.pattern,
                action = %rule.action,
                enabled = rule.enabled,
                "parsed rule"
            );
            rules.push(rule);
        }

        Ok(Self { rules })
    }

    /// Evaluate a host name against the rules. Returns the first enabled match.
    pub fn evaluate(&self, host: &str) -> Option<RuleMatch> {
        self.rules
            .iter()
            .filter(|rule| rule.enabled)
            .find(|rule| rule.pattern.is_match(host))
            .map(|rule| RuleMatch {
                rule: rule.name.clone(),
                action: rule.action,
            })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Rule engine shared by every session; swapped as a whole on reload.
#[derive(Clone, Default)]
pub struct SharedRules {
    inner: Arc<RwLock<RuleEngine>>,
}

impl SharedRules {
    pub fn new(engine: RuleEngine) -> Self {
        Self {
            inner: Arc::new(RwLock::new(engine)),
        }
    }

    pub async fn evaluate(&self, host: &str) -> Option<RuleMatch> {
        self.inner.read().await.evaluate(host)
    }

    /// Replace the active ruleset, returning the number of rules now loaded.
    pub async fn replace(&self, engine: RuleEngine) -> usize {
        let mut guard = self.inner.write().await;
        *guard = engine;
        guard.len()
    }
}
