//! Route predicates.
//!
//! # Responsibilities
//! - Match method (optional) and path template
//! - Extract named path parameters on match
//!
//! # Design Decisions
//! - Literal templates compare strings; only templates with `{name}` or `*`
//!   segments compile to a regex
//! - Path matching is case-sensitive
//! - A `None` method matches every method

use std::collections::HashMap;
use std::fmt;

use hyper::Method;
use regex::Regex;

/// Named path parameters captured by a predicate.
pub type Params = HashMap<String, String>;

/// Decides whether a request belongs to a route.
pub trait Predicate: Send + Sync + fmt::Debug {
    /// `Some(params)` on match.
    fn test(&self, method: &Method, path: &str) -> Option<Params>;
}

/// Compiled path template.
///
/// Segments: `{name}` captures one segment, `*` matches one segment,
/// a trailing `**` matches the rest of the path.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    raw: String,
    regex: Option<Regex>,
    names: Vec<String>,
}

impl PathTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        let raw = template.into();
        let mut names = Vec::new();
        let mut pattern = String::from("^");
        let mut dynamic = false;
        let segments: Vec<&str> = raw.split('/').collect();

        for (i, segment) in segments.iter().enumerate() {
            if i > 0 {
                pattern.push('/');
            }
            let is_last = i + 1 == segments.len();
            if let Some(name) = capture_name(segment) {
                pattern.push_str(&format!("(?P<{name}>[^/]+)"));
                names.push(name.to_string());
                dynamic = true;
            } else if *segment == "**" && is_last {
                pattern.push_str(".*");
                dynamic = true;
            } else if *segment == "*" {
                pattern.push_str("[^/]+");
                dynamic = true;
            } else {
                pattern.push_str(&regex::escape(segment));
            }
        }
        pattern.push('$');

        let regex = if dynamic {
            match Regex::new(&pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    tracing::warn!(template = %raw, error = %e, "Falling back to literal route");
                    names.clear();
                    None
                }
            }
        } else {
            None
        };

        Self { raw, regex, names }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, path: &str) -> Option<Params> {
        match &self.regex {
            None => (path == self.raw).then(Params::new),
            Some(regex) => {
                let captures = regex.captures(path)?;
                Some(
                    self.names
                        .iter()
                        .filter_map(|name| {
                            captures
                                .name(name)
                                .map(|m| (name.clone(), m.as_str().to_string()))
                        })
                        .collect(),
                )
            }
        }
    }
}

fn capture_name(segment: &str) -> Option<&str> {
    let name = segment.strip_prefix('{')?.strip_suffix('}')?;
    let mut chars = name.chars();
    let first = chars.next()?;
    let valid = (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then_some(name)
}

/// Method + path-template predicate.
#[derive(Debug, Clone)]
pub struct HttpPredicate {
    method: Option<Method>,
    template: PathTemplate,
}

impl HttpPredicate {
    pub fn new(method: Option<Method>, template: &str) -> Self {
        Self {
            method,
            template: PathTemplate::new(template),
        }
    }

    pub fn get(template: &str) -> Self {
        Self::new(Some(Method::GET), template)
    }

    pub fn post(template: &str) -> Self {
        Self::new(Some(Method::POST), template)
    }

    pub fn put(template: &str) -> Self {
        Self::new(Some(Method::PUT), template)
    }

    pub fn delete(template: &str) -> Self {
        Self::new(Some(Method::DELETE), template)
    }

    pub fn any(template: &str) -> Self {
        Self::new(None, template)
    }
}

impl Predicate for HttpPredicate {
    fn test(&self, method: &Method, path: &str) -> Option<Params> {
        if let Some(expected) = &self.method {
            if expected != method {
                return None;
            }
        }
        self.template.matches(path)
    }
}

/// Matches every path under a prefix on segment boundaries.
#[derive(Debug, Clone)]
pub struct PrefixPredicate {
    method: Option<Method>,
    prefix: String,
}

impl PrefixPredicate {
    pub fn new(method: Option<Method>, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        while prefix.len() > 1 && prefix.ends_with('/') {
            prefix.pop();
        }
        Self { method, prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Predicate for PrefixPredicate {
    fn test(&self, method: &Method, path: &str) -> Option<Params> {
        if let Some(expected) = &self.method {
            if expected != method {
                return None;
            }
        }
        let rest = path.strip_prefix(&self.prefix)?;
        let on_boundary = rest.is_empty() || rest.starts_with('/') || self.prefix == "/";
        on_boundary.then(Params::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_template_matches_exactly() {
        let p = HttpPredicate::get("/status");
        assert!(p.test(&Method::GET, "/status").is_some());
        assert!(p.test(&Method::GET, "/status/extra").is_none());
        assert!(p.test(&Method::POST, "/status").is_none());
    }

    #[test]
    fn captures_named_segments() {
        let p = HttpPredicate::any("/users/{id}/posts/{post_id}");
        let params = p.test(&Method::DELETE, "/users/42/posts/7").unwrap();
        assert_eq!(params["id"], "42");
        assert_eq!(params["post_id"], "7");
        assert!(p.test(&Method::GET, "/users/42/posts").is_none());
    }

    #[test]
    fn wildcards() {
        let one = HttpPredicate::get("/files/*/meta");
        assert!(one.test(&Method::GET, "/files/a/meta").is_some());
        assert!(one.test(&Method::GET, "/files/a/b/meta").is_none());

        let rest = HttpPredicate::get("/assets/**");
        assert!(rest.test(&Method::GET, "/assets/css/site.css").is_some());
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let p = HttpPredicate::get("/a.b/{x}");
        assert!(p.test(&Method::GET, "/a.b/1").is_some());
        assert!(p.test(&Method::GET, "/axb/1").is_none());
    }

    #[test]
    fn prefix_respects_segment_boundaries() {
        let p = PrefixPredicate::new(Some(Method::GET), "/static/");
        assert_eq!(p.prefix(), "/static");
        assert!(p.test(&Method::GET, "/static").is_some());
        assert!(p.test(&Method::GET, "/static/app.js").is_some());
        assert!(p.test(&Method::GET, "/staticfoo").is_none());

        let root = PrefixPredicate::new(None, "/");
        assert!(root.test(&Method::PUT, "/anything").is_some());
    }
}
