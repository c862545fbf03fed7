//! URL templates.
//!
//! A template is a URL split into scheme, host, port, path segments,
//! query parameters and fragment, where any segment may be a wildcard
//! (`*`, `{*}`), a glob (`**`, `{**}`), a named capture (`{name}`,
//! `{name=*}`, `{name=**}`) or, on the render side, a function call
//! (`{$fn(arg)}`). Templates are matched against concrete URLs to
//! produce a [`MatchedTemplate`], and rendered back to strings by
//! substituting bound values.

mod error;
mod matcher;
mod parser;
mod render;

use std::collections::{BTreeSet, HashMap};
use std::fmt;

pub use error::TemplateError;
pub use matcher::match_template;
pub use render::{render, Params};

/// Name under which an unnamed path glob stores its segments.
pub const UNNAMED_GLOB: &str = "**";

/// Name an unnamed single wildcard would have; never bound.
pub const UNNAMED_WILDCARD: &str = "*";

/// One component of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text, kept exactly as written (percent-encoding preserved).
    Literal(String),
    /// Matches exactly one segment, optionally capturing it.
    Wildcard(Option<String>),
    /// Matches zero or more path segments, optionally capturing them.
    Glob(Option<String>),
    /// Render-only function invocation: `{$name(arg)}`.
    Function { name: String, arg: Option<String> },
}

impl Segment {
    /// Returns the literal text, if this is a literal.
    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Segment::Literal(s) => Some(s),
            _ => None,
        }
    }

    /// Name this segment reads when rendered, if it reads a variable.
    fn variable(&self) -> Option<&str> {
        match self {
            Segment::Wildcard(Some(n)) | Segment::Glob(Some(n)) => Some(n),
            Segment::Wildcard(None) => Some(UNNAMED_WILDCARD),
            Segment::Glob(None) => Some(UNNAMED_GLOB),
            _ => None,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Literal(s) => f.write_str(s),
            Segment::Wildcard(None) => f.write_str("*"),
            Segment::Wildcard(Some(n)) => write!(f, "{{{}}}", n),
            Segment::Glob(None) => f.write_str("**"),
            Segment::Glob(Some(n)) => write!(f, "{{{}=**}}", n),
            Segment::Function { name, arg: None } => write!(f, "{{${}}}", name),
            Segment::Function {
                name,
                arg: Some(a),
            } => write!(f, "{{${}({})}}", name, a),
        }
    }
}

/// A query parameter. `value` is `None` for a bare flag (`?debug`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParam {
    pub name: String,
    pub value: Option<Segment>,
}

/// A parsed URL template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    scheme: Option<Segment>,
    host: Option<Segment>,
    port: Option<Segment>,
    absolute: bool,
    path: Vec<Segment>,
    trailing_slash: bool,
    query: Vec<QueryParam>,
    query_glob: bool,
    fragment: Option<Segment>,
}

impl Template {
    /// Parses a template, interpreting `*`, `**` and `{...}` expressions.
    pub fn parse(input: &str) -> Result<Self, TemplateError> {
        parser::parse(input, parser::Mode::Pattern)
    }

    /// Parses a concrete URL. Every component becomes a literal.
    pub fn parse_literal(input: &str) -> Result<Self, TemplateError> {
        parser::parse(input, parser::Mode::Literal)
    }

    pub fn scheme(&self) -> Option<&Segment> {
        self.scheme.as_ref()
    }

    pub fn host(&self) -> Option<&Segment> {
        self.host.as_ref()
    }

    pub fn port(&self) -> Option<&Segment> {
        self.port.as_ref()
    }

    pub fn path(&self) -> &[Segment] {
        &self.path
    }

    pub fn query(&self) -> &[QueryParam] {
        &self.query
    }

    /// Returns the path and query of a literal template (`/a/b?x=1`).
    pub fn path_and_query(&self) -> String {
        let rest = Template {
            scheme: None,
            host: None,
            port: None,
            absolute: true,
            fragment: None,
            ..self.clone()
        };
        rest.to_string()
    }

    /// Names captured when this template is used as a match pattern.
    pub fn captures(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let authority = [&self.scheme, &self.host, &self.port, &self.fragment];
        for seg in authority.into_iter().flatten() {
            if let Segment::Wildcard(Some(n)) | Segment::Glob(Some(n)) = seg {
                out.insert(n.clone());
            }
        }
        for seg in &self.path {
            match seg {
                Segment::Wildcard(Some(n)) | Segment::Glob(Some(n)) => {
                    out.insert(n.clone());
                }
                Segment::Glob(None) => {
                    out.insert(UNNAMED_GLOB.to_string());
                }
                _ => {}
            }
        }
        for param in &self.query {
            if let Some(Segment::Wildcard(Some(n)) | Segment::Glob(Some(n))) = &param.value {
                out.insert(n.clone());
            }
        }
        out
    }

    /// Variables read when this template is rendered. Function arguments
    /// are not included: an unbound argument is passed literally.
    pub fn variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let authority = [&self.scheme, &self.host, &self.port, &self.fragment];
        let segments = authority
            .into_iter()
            .flatten()
            .chain(self.path.iter())
            .chain(self.query.iter().filter_map(|p| p.value.as_ref()));
        for seg in segments {
            if let Some(name) = seg.variable() {
                out.insert(name.to_string());
            }
        }
        out
    }

    /// Names of the functions this template invokes.
    pub fn functions(&self) -> BTreeSet<String> {
        let authority = [&self.scheme, &self.host, &self.port, &self.fragment];
        authority
            .into_iter()
            .flatten()
            .chain(self.path.iter())
            .chain(self.query.iter().filter_map(|p| p.value.as_ref()))
            .filter_map(|seg| match seg {
                Segment::Function { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scheme) = &self.scheme {
            write!(f, "{}://", scheme)?;
        }
        if let Some(host) = &self.host {
            write!(f, "{}", host)?;
        }
        if let Some(port) = &self.port {
            write!(f, ":{}", port)?;
        }
        if self.absolute {
            f.write_str("/")?;
        }
        for (i, seg) in self.path.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", seg)?;
        }
        if self.trailing_slash && !self.path.is_empty() {
            f.write_str("/")?;
        }
        let mut items: Vec<String> = self
            .query
            .iter()
            .map(|p| match &p.value {
                None => p.name.clone(),
                Some(v) => format!("{}={}", p.name, v),
            })
            .collect();
        if self.query_glob {
            items.push("{**}".to_string());
        }
        if !items.is_empty() {
            write!(f, "?{}", items.join("&"))?;
        }
        if let Some(fragment) = &self.fragment {
            write!(f, "#{}", fragment)?;
        }
        Ok(())
    }
}

/// Values captured by matching a pattern against a concrete URL.
///
/// Captures are multi-valued: a glob binds one value per path segment and
/// a repeated query parameter binds one value per occurrence. A name can
/// be bound to zero values (a glob that matched nothing).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchedTemplate {
    values: HashMap<String, Vec<String>>,
    extra_query: Vec<(String, Option<String>)>,
}

impl MatchedTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all values bound to `name`.
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.values.get(name).map(Vec::as_slice)
    }

    /// Returns the first value bound to `name`.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Replaces the values bound to `name`.
    pub fn bind(&mut self, name: impl Into<String>, values: Vec<String>) {
        self.values.insert(name.into(), values);
    }

    /// Query parameters absorbed by a `{**}` query glob, in request order.
    pub fn extra_query(&self) -> &[(String, Option<String>)] {
        &self.extra_query
    }

    /// Copies every binding of `other` over this one.
    pub fn merge(&mut self, other: MatchedTemplate) {
        self.values.extend(other.values);
        if !other.extra_query.is_empty() {
            self.extra_query = other.extra_query;
        }
    }

    fn declare(&mut self, name: &str) {
        self.values.entry(name.to_string()).or_default();
    }

    fn push(&mut self, name: &str, value: String) {
        self.values.entry(name.to_string()).or_default().push(value);
    }
}
