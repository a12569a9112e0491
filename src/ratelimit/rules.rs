//! Endpoint-specific rate limit overrides and path matching.
//!
//! Overrides are compiled once at startup into an immutable [`EndpointRules`]
//! snapshot that request handling only ever reads. Paths are normalized so
//! that `/pipelines/{id}`, `/pipelines/:id` and `/pipelines/:id/` all name
//! the same endpoint, and a request for `/pipelines/42` shares its bucket
//! with every other pipeline id.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::bucket::Limit;
use crate::config::EndpointLimit;
use crate::error::{GatekeeperError, Result};

const METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "PATCH", "OPTIONS", "CONNECT", "TRACE",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param,
    /// Matches the rest of the path, including nothing.
    Tail,
}

/// A normalized path pattern such as `/pipelines/:id/runs`.
#[derive(Debug, Clone)]
pub struct PathPattern {
    normalized: Arc<str>,
    segments: Vec<Segment>,
}

impl PathPattern {
    /// Parse and normalize a configured path pattern.
    pub fn parse(raw: &str) -> Result<Self> {
        if !raw.starts_with('/') {
            return Err(GatekeeperError::Config(format!(
                "Endpoint path '{}' must start with '/'",
                raw
            )));
        }

        let parts: Vec<&str> = split_path(raw).collect();
        let mut segments = Vec::with_capacity(parts.len());
        let mut rendered = Vec::with_capacity(parts.len());

        for (index, part) in parts.iter().enumerate() {
            let (segment, text) = if let Some(name) = param_name(part) {
                if name.is_empty() {
                    return Err(GatekeeperError::Config(format!(
                        "Endpoint path '{}' has an unnamed parameter",
                        raw
                    )));
                }
                (Segment::Param, format!(":{}", name))
            } else if let Some(name) = part.strip_prefix('*') {
                if index + 1 != parts.len() {
                    return Err(GatekeeperError::Config(format!(
                        "Endpoint path '{}' has a wildcard before the last segment",
                        raw
                    )));
                }
                (Segment::Tail, format!("*{}", name))
            } else if part.contains(['{', '}', ':', '*']) {
                return Err(GatekeeperError::Config(format!(
                    "Endpoint path '{}' has a malformed segment '{}'",
                    raw, part
                )));
            } else {
                (Segment::Literal((*part).to_string()), (*part).to_string())
            };
            segments.push(segment);
            rendered.push(text);
        }

        Ok(Self {
            normalized: format!("/{}", rendered.join("/")).into(),
            segments,
        })
    }

    /// The normalized form, used as the endpoint bucket key.
    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    /// Whether the pattern contains no parameters.
    pub fn is_static(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Match a concrete request path.
    pub fn matches(&self, path: &str) -> bool {
        let mut parts = split_path(path);
        for segment in &self.segments {
            match segment {
                Segment::Tail => return true,
                Segment::Param => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(literal) => match parts.next() {
                    Some(part) if part == literal => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }

    /// Ordering key: more literal segments first, tails last.
    fn specificity(&self) -> (bool, usize, usize) {
        let literals = self
            .segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count();
        let has_tail = self.segments.iter().any(|s| matches!(s, Segment::Tail));
        (!has_tail, literals, self.segments.len())
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// The request path with empty segments dropped. Borrows when the path is
/// already in normal form, which is the common case.
fn normalize(path: &str) -> Cow<'_, str> {
    let canonical = path.starts_with('/')
        && !path.contains("//")
        && (path.len() == 1 || !path.ends_with('/'));
    if canonical {
        Cow::Borrowed(path)
    } else {
        Cow::Owned(format!("/{}", split_path(path).collect::<Vec<_>>().join("/")))
    }
}

fn param_name(part: &str) -> Option<&str> {
    if let Some(name) = part.strip_prefix(':') {
        return Some(name);
    }
    part.strip_prefix('{')?.strip_suffix('}')
}

/// One compiled endpoint override.
#[derive(Debug, Clone)]
pub struct EndpointRule {
    method: Arc<str>,
    pattern: PathPattern,
    limit: Limit,
}

impl EndpointRule {
    pub fn method(&self) -> &Arc<str> {
        &self.method
    }

    pub fn pattern(&self) -> Arc<str> {
        self.pattern.normalized.clone()
    }

    pub fn limit(&self) -> Limit {
        self.limit
    }
}

/// Immutable lookup table of endpoint overrides.
#[derive(Debug, Clone, Default)]
pub struct EndpointRules {
    /// Parameter-free patterns keyed by normalized path, one rule per method
    exact: HashMap<String, Vec<EndpointRule>>,
    /// Parameterized patterns, most specific first
    patterns: Vec<EndpointRule>,
}

impl EndpointRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile configured overrides. Duplicate `(method, path)` pairs,
    /// unknown methods, and malformed patterns are configuration errors.
    pub fn from_limits(limits: &[EndpointLimit]) -> Result<Self> {
        let mut rules = EndpointRules::new();
        let mut seen = HashSet::new();

        for limit in limits {
            let method = limit.method.trim().to_ascii_uppercase();
            if !METHODS.contains(&method.as_str()) {
                return Err(GatekeeperError::Config(format!(
                    "Unknown HTTP method '{}' for endpoint '{}'",
                    limit.method, limit.path
                )));
            }

            let pattern = PathPattern::parse(limit.path.trim())?;
            if !seen.insert((method.clone(), pattern.as_str().to_string())) {
                return Err(GatekeeperError::Config(format!(
                    "Duplicate endpoint limit for {} {}",
                    method,
                    pattern.as_str()
                )));
            }

            let rule = EndpointRule {
                method: method.into(),
                pattern,
                limit: Limit::new(limit.rps, limit.burst),
            };

            if rule.pattern.is_static() {
                rules
                    .exact
                    .entry(rule.pattern.as_str().to_string())
                    .or_default()
                    .push(rule);
            } else {
                rules.patterns.push(rule);
            }
        }

        rules
            .patterns
            .sort_by(|a, b| b.pattern.specificity().cmp(&a.pattern.specificity()));
        Ok(rules)
    }

    /// Find the override for a request, if any.
    pub fn find(&self, method: &str, path: &str) -> Option<&EndpointRule> {
        if self.is_empty() {
            return None;
        }

        let exact = self
            .exact
            .get(&*normalize(path))
            .and_then(|rules| rules.iter().find(|rule| rule.method.eq_ignore_ascii_case(method)));
        if exact.is_some() {
            return exact;
        }

        self.patterns
            .iter()
            .find(|rule| rule.method.eq_ignore_ascii_case(method) && rule.pattern.matches(path))
    }

    pub fn len(&self) -> usize {
        self.exact.values().map(Vec::len).sum::<usize>() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(method: &str, path: &str, rps: f64) -> EndpointLimit {
        EndpointLimit {
            method: method.to_string(),
            path: path.to_string(),
            rps,
            burst: rps,
        }
    }

    #[test]
    fn test_normalize_param_spellings() {
        let colon = PathPattern::parse("/pipelines/:id").unwrap();
        let braces = PathPattern::parse("/pipelines/{id}/").unwrap();
        assert_eq!(colon.as_str(), "/pipelines/:id");
        assert_eq!(braces.as_str(), "/pipelines/:id");
        assert!(!colon.is_static());
        assert!(PathPattern::parse("/auth/login").unwrap().is_static());
    }

    #[test]
    fn test_pattern_matching() {
        let pattern = PathPattern::parse("/pipelines/:id/runs").unwrap();
        assert!(pattern.matches("/pipelines/42/runs"));
        assert!(pattern.matches("/pipelines/42/runs/"));
        assert!(!pattern.matches("/pipelines/42"));
        assert!(!pattern.matches("/pipelines/42/runs/7"));
        assert!(!pattern.matches("/projects/42/runs"));

        let tail = PathPattern::parse("/files/*rest").unwrap();
        assert!(tail.matches("/files"));
        assert!(tail.matches("/files/a/b/c"));
        assert!(!tail.matches("/other"));
    }

    #[test]
    fn test_malformed_patterns() {
        assert!(PathPattern::parse("auth/login").is_err());
        assert!(PathPattern::parse("/a/:").is_err());
        assert!(PathPattern::parse("/a/*rest/b").is_err());
        assert!(PathPattern::parse("/a/{id").is_err());
    }

    #[test]
    fn test_find_exact() {
        let rules = EndpointRules::from_limits(&[limit("post", "/auth/login", 2.0)]).unwrap();
        let rule = rules.find("POST", "/auth/login").unwrap();
        assert_eq!(&**rule.method(), "POST");
        assert_eq!(&*rule.pattern(), "/auth/login");
        assert_eq!(rule.limit(), Limit::new(2.0, 2.0));

        assert!(rules.find("post", "/auth/login/").is_some());
        assert!(rules.find("GET", "/auth/login").is_none());
        assert!(rules.find("POST", "/auth/logout").is_none());
    }

    #[test]
    fn test_find_same_path_different_methods() {
        let rules = EndpointRules::from_limits(&[
            limit("GET", "/auth/login", 20.0),
            limit("POST", "/auth/login", 2.0),
        ])
        .unwrap();

        assert_eq!(rules.len(), 2);
        assert_eq!(rules.find("post", "//auth//login").unwrap().limit().rps, 2.0);
        assert_eq!(rules.find("GET", "/auth/login").unwrap().limit().rps, 20.0);
        assert!(rules.find("DELETE", "/auth/login").is_none());
    }

    #[test]
    fn test_normalize_borrows_canonical_paths() {
        assert!(matches!(normalize("/auth/login"), Cow::Borrowed("/auth/login")));
        assert!(matches!(normalize("/"), Cow::Borrowed("/")));
        assert_eq!(normalize("/auth/login/"), "/auth/login");
        assert_eq!(normalize("//auth///login"), "/auth/login");
        assert_eq!(normalize(""), "/");
    }

    #[test]
    fn test_find_prefers_specific_patterns() {
        let rules = EndpointRules::from_limits(&[
            limit("GET", "/pipelines/*rest", 50.0),
            limit("GET", "/pipelines/:id", 10.0),
            limit("GET", "/pipelines/:id/logs", 1.0),
        ])
        .unwrap();

        assert_eq!(rules.len(), 3);
        assert_eq!(&*rules.find("GET", "/pipelines/9").unwrap().pattern(), "/pipelines/:id");
        assert_eq!(
            &*rules.find("GET", "/pipelines/9/logs").unwrap().pattern(),
            "/pipelines/:id/logs"
        );
        assert_eq!(
            &*rules.find("GET", "/pipelines/9/stages/2").unwrap().pattern(),
            "/pipelines/*rest"
        );
    }

    #[test]
    fn test_duplicate_after_normalization_rejected() {
        let result = EndpointRules::from_limits(&[
            limit("GET", "/pipelines/:id", 1.0),
            limit("get", "/pipelines/{id}", 2.0),
        ]);
        assert!(matches!(result, Err(GatekeeperError::Config(_))));
    }

    #[test]
    fn test_unknown_method_rejected() {
        assert!(EndpointRules::from_limits(&[limit("FETCH", "/a", 1.0)]).is_err());
    }

    #[test]
    fn test_empty_rules_find_nothing() {
        let rules = EndpointRules::new();
        assert!(rules.is_empty());
        assert!(rules.find("GET", "/anything").is_none());
    }
}
