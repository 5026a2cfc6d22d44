//! Label selectors
//!
//! A selector is a PromQL instant vector selector, parsed with
//! `promql_parser`. The braces may be omitted for a plain matcher list:
//!
//! ```text
//! node_load1{job="node", env!="dev", path!~"/tmp/.*"}
//! job="node", instance=~"10\\.0\\..*"
//! ```
//!
//! Regexes use RE2 syntax and are anchored at both ends. A label that is
//! absent from a series is matched as the empty string, so `name=~".+"`
//! selects exactly the series carrying `name`. Prefix matchers have no PromQL
//! spelling and are added with [`Selector::with_matcher`].

use std::fmt;
use std::str::FromStr;

use promql_parser::label::MatchOp as PromMatchOp;
use promql_parser::parser::{self, Expr};
use regex::Regex;
use thiserror::Error;

use crate::types::Labels;

/// Maximum accepted regex pattern length.
const MAX_REGEX_PATTERN_LEN: usize = 4096;

/// Selector used when none is configured: every series with a metric name.
pub const MATCH_ALL_SELECTOR: &str = r#"{__name__=~".+"}"#;

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("selector is empty")]
    Empty,
    #[error("invalid selector: {0}")]
    Syntax(String),
    #[error("expected a plain series selector, got {0}")]
    NotASelector(String),
    #[error("invalid prefix matcher {0:?}, expected NAME=PREFIX")]
    InvalidPrefix(String),
    #[error("invalid regex for label {name}: {source}")]
    Regex {
        name: String,
        #[source]
        source: regex::Error,
    },
    #[error("regex for label {name} is {len} bytes long (max {MAX_REGEX_PATTERN_LEN})")]
    RegexTooLong { name: String, len: usize },
}

#[derive(Debug, Clone)]
pub enum MatchOp {
    Equal(String),
    NotEqual(String),
    Prefix(String),
    Regex(Regex),
    NotRegex(Regex),
}

#[derive(Debug, Clone)]
pub struct Matcher {
    pub name: String,
    pub op: MatchOp,
}

impl Matcher {
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Equal(value.into()),
        }
    }

    pub fn prefix(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Prefix(prefix.into()),
        }
    }

    pub fn regex(name: impl Into<String>, pattern: &str) -> Result<Self, SelectorError> {
        let name = name.into();
        let regex = compile_anchored(&name, pattern)?;
        Ok(Self {
            name,
            op: MatchOp::Regex(regex),
        })
    }

    pub fn matches(&self, value: &str) -> bool {
        match &self.op {
            MatchOp::Equal(expected) => value == expected,
            MatchOp::NotEqual(expected) => value != expected,
            MatchOp::Prefix(prefix) => value.starts_with(prefix.as_str()),
            MatchOp::Regex(regex) => regex.is_match(value),
            MatchOp::NotRegex(regex) => !regex.is_match(value),
        }
    }
}

fn compile_anchored(name: &str, pattern: &str) -> Result<Regex, SelectorError> {
    if pattern.len() > MAX_REGEX_PATTERN_LEN {
        return Err(SelectorError::RegexTooLong {
            name: name.to_owned(),
            len: pattern.len(),
        });
    }
    Regex::new(&format!("^(?:{pattern})$")).map_err(|source| SelectorError::Regex {
        name: name.to_owned(),
        source,
    })
}

/// Conjunction of matchers. A series is selected when every matcher accepts it.
#[derive(Debug, Clone)]
pub struct Selector {
    matchers: Vec<Matcher>,
}

impl Selector {
    pub fn new(matchers: Vec<Matcher>) -> Self {
        Self { matchers }
    }

    /// `{__name__=~".+"}`: every series that has a metric name.
    pub fn match_all() -> Self {
        let regex = Regex::new("^(?:.+)$").unwrap_or_else(|_| unreachable!("literal regex"));
        Self {
            matchers: vec![Matcher {
                name: "__name__".to_owned(),
                op: MatchOp::Regex(regex),
            }],
        }
    }

    pub fn with_matcher(mut self, matcher: Matcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn matchers(&self) -> &[Matcher] {
        &self.matchers
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.matchers
            .iter()
            .all(|m| m.matches(labels.get(&m.name).unwrap_or("")))
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::match_all()
    }
}

/// Canonical PromQL form. Prefix matchers are written as the equivalent regex.
impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, m) in self.matchers.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match &m.op {
                MatchOp::Equal(v) => write!(f, "{}={v:?}", m.name)?,
                MatchOp::NotEqual(v) => write!(f, "{}!={v:?}", m.name)?,
                MatchOp::Prefix(v) => {
                    write!(f, "{}=~{:?}", m.name, format!("{}.*", regex::escape(v)))?
                }
                MatchOp::Regex(r) => write!(f, "{}=~{:?}", m.name, strip_anchors(r.as_str()))?,
                MatchOp::NotRegex(r) => write!(f, "{}!~{:?}", m.name, strip_anchors(r.as_str()))?,
            }
        }
        f.write_str("}")
    }
}

fn strip_anchors(pattern: &str) -> &str {
    pattern
        .strip_prefix("^(?:")
        .and_then(|p| p.strip_suffix(")$"))
        .unwrap_or(pattern)
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SelectorError::Empty);
        }
        // A bare matcher list starts with a label name followed by an operator.
        let name_end = input
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == ':'))
            .unwrap_or(input.len());
        let after_name = input[name_end..].trim_start();
        let query = if name_end > 0 && after_name.starts_with(['=', '!']) {
            format!("{{{input}}}")
        } else {
            input.to_owned()
        };

        let expr = parser::parse(&query).map_err(SelectorError::Syntax)?;
        let Expr::VectorSelector(vs) = expr else {
            return Err(SelectorError::NotASelector(input.to_owned()));
        };
        if vs.offset.is_some() || vs.at.is_some() || !vs.matchers.or_matchers.is_empty() {
            return Err(SelectorError::NotASelector(input.to_owned()));
        }

        // The metric name always comes first, whether written as `name{..}`
        // or as an explicit `__name__` matcher.
        let mut matchers = Vec::with_capacity(vs.matchers.matchers.len() + 1);
        if let Some(name) = &vs.name {
            matchers.push(Matcher::equal("__name__", name.clone()));
        }
        for m in vs.matchers.matchers {
            let duplicate_name = m.name == "__name__"
                && matches!(m.op, PromMatchOp::Equal)
                && vs.name.as_deref() == Some(m.value.as_str());
            if duplicate_name {
                continue;
            }
            let op = match m.op {
                PromMatchOp::Equal => MatchOp::Equal(m.value),
                PromMatchOp::NotEqual => MatchOp::NotEqual(m.value),
                PromMatchOp::Re(_) => MatchOp::Regex(compile_anchored(&m.name, &m.value)?),
                PromMatchOp::NotRe(_) => MatchOp::NotRegex(compile_anchored(&m.name, &m.value)?),
            };
            matchers.push(Matcher { name: m.name, op });
        }
        if matchers.is_empty() {
            return Err(SelectorError::Empty);
        }
        Ok(Self { matchers })
    }
}

/// Parses a `NAME=PREFIX` prefix matcher.
pub fn parse_prefix_matcher(spec: &str) -> Result<Matcher, SelectorError> {
    match spec.split_once('=') {
        Some((name, prefix)) if !name.trim().is_empty() => {
            Ok(Matcher::prefix(name.trim(), prefix))
        }
        _ => Err(SelectorError::InvalidPrefix(spec.to_owned())),
    }
}
