//! Rate limit rules configuration and matching.
//!
//! Rules are evaluated in declaration order and the first rule whose method
//! and path both match wins; overlapping rules are never merged. A default
//! rule that matches every request is always checked last.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use super::window::Window;
use crate::error::{QuotaGateError, Result};

/// Identity of the fallback rule in counter keys.
pub const DEFAULT_RULE_ID: &str = "default";

/// HTTP methods a rule can be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    Trace,
    Connect,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Connect => "CONNECT",
        }
    }

    /// Parse a method token, ignoring case.
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "PATCH" => Some(HttpMethod::Patch),
            "DELETE" => Some(HttpMethod::Delete),
            "HEAD" => Some(HttpMethod::Head),
            "OPTIONS" => Some(HttpMethod::Options),
            "TRACE" => Some(HttpMethod::Trace),
            "CONNECT" => Some(HttpMethod::Connect),
            _ => None,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The method side of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodMatcher {
    /// Matches every request method, including unrecognized ones.
    Any,
    Exact(HttpMethod),
}

impl MethodMatcher {
    /// Parse a configured method token. `*` and `ANY` are wildcards.
    pub fn parse(token: &str) -> Result<Self> {
        let token = token.trim();
        if token == "*" || token.eq_ignore_ascii_case("any") {
            return Ok(MethodMatcher::Any);
        }
        HttpMethod::parse(token)
            .map(MethodMatcher::Exact)
            .ok_or_else(|| QuotaGateError::Config(format!("unknown HTTP method '{}'", token)))
    }

    /// `method` is `None` when the request carried an unrecognized verb.
    pub fn matches(&self, method: Option<HttpMethod>) -> bool {
        match self {
            MethodMatcher::Any => true,
            MethodMatcher::Exact(expected) => method == Some(*expected),
        }
    }
}

impl fmt::Display for MethodMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodMatcher::Any => f.write_str("*"),
            MethodMatcher::Exact(method) => method.fmt(f),
        }
    }
}

/// The path side of a rule.
#[derive(Debug, Clone)]
pub enum PathMatcher {
    Exact(String),
    Prefix(String),
    /// Regular expression matched against the whole path.
    Pattern { source: String, regex: Regex },
}

impl PathMatcher {
    pub fn pattern(source: &str) -> Result<Self> {
        let regex = Regex::new(&format!("^(?:{})$", source)).map_err(|e| {
            QuotaGateError::Config(format!("invalid path pattern '{}': {}", source, e))
        })?;
        Ok(PathMatcher::Pattern {
            source: source.to_string(),
            regex,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Exact(expected) => path == expected,
            PathMatcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathMatcher::Pattern { regex, .. } => regex.is_match(path),
        }
    }
}

impl fmt::Display for PathMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathMatcher::Exact(path) => write!(f, "={}", path),
            PathMatcher::Prefix(prefix) => write!(f, "^{}", prefix),
            PathMatcher::Pattern { source, .. } => write!(f, "~{}", source),
        }
    }
}

/// Time unit for rule windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl From<TimeUnit> for Window {
    fn from(unit: TimeUnit) -> Self {
        match unit {
            TimeUnit::Second => Window::SECOND,
            TimeUnit::Minute => Window::MINUTE,
            TimeUnit::Hour => Window::HOUR,
            TimeUnit::Day => Window::DAY,
        }
    }
}

/// A configured window: either a named unit or a number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WindowConfig {
    Unit(TimeUnit),
    Seconds(u64),
}

impl WindowConfig {
    pub fn to_window(self) -> Result<Window> {
        match self {
            WindowConfig::Unit(unit) => Ok(unit.into()),
            WindowConfig::Seconds(secs) => Window::from_secs(secs).ok_or_else(|| {
                QuotaGateError::Config("rule window must be at least one second".to_string())
            }),
        }
    }
}

fn default_method() -> String {
    "*".to_string()
}

/// A rate limit rule as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// HTTP method, or `*` for any method
    #[serde(default = "default_method")]
    pub method: String,
    /// Exact path to match
    #[serde(default)]
    pub path: Option<String>,
    /// Path prefix to match
    #[serde(default)]
    pub path_prefix: Option<String>,
    /// Regular expression the whole path must match
    #[serde(default)]
    pub path_regex: Option<String>,
    /// Requests allowed per window
    pub limit: u64,
    /// Window length; the configured default window when absent
    #[serde(default)]
    pub window: Option<WindowConfig>,
    /// Optional name, used as the rule identity in counter keys
    #[serde(default)]
    pub name: Option<String>,
}

impl RuleConfig {
    pub fn new(method: &str, limit: u64) -> Self {
        Self {
            method: method.to_string(),
            path: None,
            path_prefix: None,
            path_regex: None,
            limit,
            window: None,
            name: None,
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn with_path_prefix(mut self, prefix: &str) -> Self {
        self.path_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_path_regex(mut self, pattern: &str) -> Self {
        self.path_regex = Some(pattern.to_string());
        self
    }

    pub fn with_window(mut self, window: WindowConfig) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    fn path_matcher(&self) -> Result<Option<PathMatcher>> {
        let matchers = [&self.path, &self.path_prefix, &self.path_regex]
            .iter()
            .filter(|m| m.is_some())
            .count();
        if matchers > 1 {
            return Err(QuotaGateError::Config(format!(
                "rule '{} {}' sets more than one of path, path_prefix and path_regex",
                self.method,
                self.path
                    .as_deref()
                    .or(self.path_prefix.as_deref())
                    .unwrap_or_default()
            )));
        }

        if let Some(ref path) = self.path {
            return Ok(Some(PathMatcher::Exact(path.clone())));
        }
        if let Some(ref prefix) = self.path_prefix {
            return Ok(Some(PathMatcher::Prefix(prefix.clone())));
        }
        self.path_regex
            .as_deref()
            .map(PathMatcher::pattern)
            .transpose()
    }
}

/// A validated rate limit rule.
#[derive(Debug, Clone)]
pub struct Rule {
    id: String,
    method: MethodMatcher,
    path: Option<PathMatcher>,
    limit: u64,
    window: Window,
}

impl Rule {
    pub fn new(
        method: MethodMatcher,
        path: Option<PathMatcher>,
        limit: u64,
        window: Window,
        name: Option<&str>,
    ) -> Result<Self> {
        let id = match name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            Some(_) => {
                return Err(QuotaGateError::Config("rule name must not be blank".to_string()))
            }
            None => match path {
                Some(ref matcher) => format!("{} {}", method, matcher),
                None => format!("{} *", method),
            },
        };

        if limit < 1 {
            return Err(QuotaGateError::Config(format!(
                "rule '{}' has limit {}; limits must be at least 1",
                id, limit
            )));
        }

        Ok(Self {
            id,
            method,
            path,
            limit,
            window,
        })
    }

    /// Build a rule from its configuration, using `default_window` when the
    /// rule does not set one.
    pub fn from_config(config: &RuleConfig, default_window: Window) -> Result<Self> {
        let method = MethodMatcher::parse(&config.method)?;
        let path = config.path_matcher()?;
        let window = match config.window {
            Some(window) => window.to_window()?,
            None => default_window,
        };
        Self::new(method, path, config.limit, window, config.name.as_deref())
    }

    /// The rule that governs requests no explicit rule matches.
    pub fn fallback(limit: u64, window: Window) -> Result<Self> {
        Self::new(MethodMatcher::Any, None, limit, window, Some(DEFAULT_RULE_ID))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> MethodMatcher {
        self.method
    }

    pub fn path(&self) -> Option<&PathMatcher> {
        self.path.as_ref()
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Window {
        self.window
    }

    /// Whether the rule matches every method and every path.
    pub fn is_catch_all(&self) -> bool {
        self.method == MethodMatcher::Any && self.path.is_none()
    }

    pub fn matches(&self, method: Option<HttpMethod>, path: &str) -> bool {
        self.method.matches(method)
            && self.path.as_ref().map_or(true, |matcher| matcher.matches(path))
    }
}

/// An ordered, immutable set of rules ending in a default rule.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
    default: Rule,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>, default: Rule) -> Result<Self> {
        let mut seen = HashSet::new();
        seen.insert(default.id().to_string());
        let mut catch_all: Option<&str> = None;

        for rule in &rules {
            if !seen.insert(rule.id().to_string()) {
                return Err(QuotaGateError::Config(format!(
                    "duplicate rule identity '{}'",
                    rule.id()
                )));
            }
            if rule.is_catch_all() {
                if let Some(previous) = catch_all {
                    return Err(QuotaGateError::Config(format!(
                        "rules '{}' and '{}' both match every request; configure a single default",
                        previous,
                        rule.id()
                    )));
                }
                catch_all = Some(rule.id());
            }
        }

        Ok(Self { rules, default })
    }

    /// Build a rule set from configured rules and the default limit and window.
    pub fn from_config(
        configs: &[RuleConfig],
        default_limit: u64,
        default_window: Window,
    ) -> Result<Self> {
        let rules = configs
            .iter()
            .map(|config| Rule::from_config(config, default_window))
            .collect::<Result<Vec<_>>>()?;
        Self::new(rules, Rule::fallback(default_limit, default_window)?)
    }

    /// Find the first explicit rule matching the request, ignoring the default.
    pub fn find(&self, method: &str, path: &str) -> Option<&Rule> {
        let method = HttpMethod::parse(method);
        self.rules.iter().find(|rule| rule.matches(method, path))
    }

    /// Find the rule governing the request. Falls back to the default rule.
    pub fn resolve(&self, method: &str, path: &str) -> &Rule {
        self.find(method, path).unwrap_or(&self.default)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn default_rule(&self) -> &Rule {
        &self.default
    }

    /// Number of explicit rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
