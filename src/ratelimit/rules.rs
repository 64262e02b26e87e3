//! Rate limit rules configuration and matching.
//!
//! This module handles loading rate limit rules from configuration and
//! selecting the rule for a normalized endpoint. Rules are matched in
//! configuration order and the first match wins; anything unmatched falls
//! back to the default rule.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::key::endpoint;
use super::normalize::{PathNormalizer, WILDCARD};
use crate::error::{Result, TurnstileError};

/// Reserved pattern name of the fallback rule.
pub const DEFAULT_PATTERN: &str = "DEFAULT";

/// A rate limit rule specifying the limit and time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Endpoint template, e.g. `POST:/v1/courses/*/regenerate`
    pub pattern: String,
    /// Number of requests allowed per window
    pub limit: u64,
    /// Window length in seconds
    pub window_seconds: u64,
}

impl RateLimitRule {
    pub fn new(pattern: &str, limit: u64, window_seconds: u64) -> Self {
        Self {
            pattern: pattern.to_string(),
            limit,
            window_seconds,
        }
    }

    /// Get the duration of this rule's window.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(TurnstileError::Config(format!(
                "rule '{}': limit must be greater than zero",
                self.pattern
            )));
        }
        if self.window_seconds == 0 {
            return Err(TurnstileError::Config(format!(
                "rule '{}': window_seconds must be greater than zero",
                self.pattern
            )));
        }
        Ok(())
    }
}

/// Limit and window of the fallback rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultRuleConfig {
    pub limit: u64,
    pub window_seconds: u64,
}

/// On-disk form of a rule table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTableConfig {
    /// Fallback applied to endpoints no rule matches
    pub default: DefaultRuleConfig,
    /// Anchors whose following path segment is an identifier
    #[serde(default)]
    pub normalize: Vec<String>,
    /// Rules in match order
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
}

impl RuleTableConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }

    /// Rules guarding the course-generation pipeline and the geocoding API.
    pub fn builtin() -> Self {
        Self {
            default: DefaultRuleConfig {
                limit: 100,
                window_seconds: 60,
            },
            normalize: vec!["/v1/courses/".to_string()],
            rules: vec![
                RateLimitRule::new("POST:/v1/courses", 10, 60),
                RateLimitRule::new("POST:/v1/courses/*/regenerate", 5, 60),
                RateLimitRule::new("GET:/v1/geocode", 30, 60),
                RateLimitRule::new("GET:/v1/geocode/reverse", 30, 60),
            ],
        }
    }
}

/// A rule together with its precompiled matcher.
#[derive(Debug, Clone)]
struct CompiledRule {
    rule: RateLimitRule,
    matcher: Regex,
}

impl CompiledRule {
    fn compile(rule: RateLimitRule) -> Result<Self> {
        rule.validate()?;
        if rule.pattern == DEFAULT_PATTERN {
            return Err(TurnstileError::Config(format!(
                "'{}' is reserved for the fallback rule",
                DEFAULT_PATTERN
            )));
        }
        if rule.pattern.is_empty() || !rule.pattern.contains(':') {
            return Err(TurnstileError::Config(format!(
                "rule pattern '{}' must have the form METHOD:/path",
                rule.pattern
            )));
        }

        let matcher = Regex::new(&pattern_to_regex(&rule.pattern))?;
        Ok(Self { rule, matcher })
    }
}

/// Translate an endpoint template into an anchored regex where each
/// wildcard stands for exactly one non-empty, slash-free segment.
fn pattern_to_regex(pattern: &str) -> String {
    let body = pattern
        .split(WILDCARD)
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[^/]+");
    format!("^{}$", body)
}

/// The immutable rule table shared by every request.
///
/// Patterns are compiled once at construction; matching never allocates a
/// regex.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<CompiledRule>,
    default_rule: RateLimitRule,
    normalizer: PathNormalizer,
}

impl RuleTable {
    /// Build and validate a table from its configuration.
    pub fn new(config: RuleTableConfig) -> Result<Self> {
        let default_rule = RateLimitRule::new(
            DEFAULT_PATTERN,
            config.default.limit,
            config.default.window_seconds,
        );
        default_rule.validate()?;

        let rules = config
            .rules
            .into_iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;
        let normalizer = PathNormalizer::new(&config.normalize)?;

        info!(
            rules = rules.len(),
            anchors = normalizer.len(),
            default_limit = default_rule.limit,
            default_window_secs = default_rule.window_seconds,
            "Rule table compiled"
        );

        Ok(Self {
            rules,
            default_rule,
            normalizer,
        })
    }

    /// The built-in table, see [`RuleTableConfig::builtin`].
    pub fn builtin() -> Result<Self> {
        Self::new(RuleTableConfig::builtin())
    }

    /// Load and compile a table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(RuleTableConfig::from_file(path)?)
    }

    /// Load and compile a table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::new(RuleTableConfig::from_yaml(yaml)?)
    }

    /// Find the rule for a normalized path.
    ///
    /// The first configured rule whose pattern matches `METHOD:path` wins;
    /// otherwise the default rule is returned.
    pub fn find_limit(&self, method: &str, normalized_path: &str) -> &RateLimitRule {
        let candidate = endpoint(method, normalized_path);
        self.rules
            .iter()
            .find(|compiled| compiled.matcher.is_match(&candidate))
            .map(|compiled| &compiled.rule)
            .unwrap_or(&self.default_rule)
    }

    /// The normalizer configured alongside these rules.
    pub fn normalizer(&self) -> &PathNormalizer {
        &self.normalizer
    }

    pub fn default_rule(&self) -> &RateLimitRule {
        &self.default_rule
    }

    /// Explicit rules in match order, excluding the default.
    pub fn rules(&self) -> impl Iterator<Item = &RateLimitRule> {
        self.rules.iter().map(|compiled| &compiled.rule)
    }

    /// Longest window of any rule, the default included.
    pub fn longest_window(&self) -> Duration {
        self.rules()
            .chain(std::iter::once(&self.default_rule))
            .map(RateLimitRule::window)
            .max()
            .unwrap_or_default()
    }
}
