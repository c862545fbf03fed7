//! Rule-based URL rewriting.
//!
//! A [`RuleStore`] holds named [`RewriteRule`]s in insertion order. The
//! [`UrlRewriter`] picks the first rule whose direction applies and whose
//! pattern matches a URL, then runs the rule's steps against a fresh
//! [`RewriteContext`] seeded with the pattern's captures.

mod context;
pub mod descriptor;
mod processor;
mod store;

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::template::{Template, TemplateError};

#[cfg(test)]
pub use context::MapResolver;
pub use context::{Resolver, RewriteContext};
pub use processor::UrlRewriter;
pub use store::RuleStore;

/// Direction a URL travels through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client request, rewritten toward the backend.
    In,
    /// Backend response, rewritten toward the client.
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => f.write_str("in"),
            Direction::Out => f.write_str("out"),
        }
    }
}

/// Directions a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleDirection {
    In,
    Out,
    #[default]
    Both,
}

impl RuleDirection {
    pub fn applies_to(self, direction: Direction) -> bool {
        matches!(
            (self, direction),
            (RuleDirection::Both, _) | (RuleDirection::In, Direction::In) | (RuleDirection::Out, Direction::Out)
        )
    }

    /// Parses `in`, `out` or `both`, ignoring case.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "in" | "inbound" | "request" => Some(RuleDirection::In),
            "out" | "outbound" | "response" => Some(RuleDirection::Out),
            "both" | "" => Some(RuleDirection::Both),
            _ => None,
        }
    }
}

/// Predicate evaluated by control-flow steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// The variable is bound to at least one value.
    Exists(String),
    /// One of the variable's values equals the literal.
    Equals(String, String),
    /// None of the variable's values equals the literal.
    NotEquals(String, String),
    /// The current URL matches the pattern; its captures are added to the
    /// context.
    Matches(Template),
}

impl Condition {
    pub fn matches(pattern: &str) -> Result<Self, TemplateError> {
        Ok(Condition::Matches(Template::parse(pattern)?))
    }
}

/// One step of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteStep {
    /// Renders the template and makes the result the current URL.
    Rewrite(Template),
    /// Binds `name` to the rendered value.
    Set { name: String, value: Template },
    /// Resolves `param` through `function` and binds the result to `into`.
    /// `param` names a variable, or is passed literally when unbound.
    Function {
        function: String,
        param: String,
        into: String,
    },
    If {
        condition: Condition,
        steps: Vec<RewriteStep>,
    },
    /// Runs the steps of the first branch whose condition holds.
    Choose {
        when: Vec<(Condition, Vec<RewriteStep>)>,
        otherwise: Vec<RewriteStep>,
    },
}

impl RewriteStep {
    pub fn rewrite(template: &str) -> Result<Self, TemplateError> {
        Ok(RewriteStep::Rewrite(Template::parse(template)?))
    }

    pub fn set(name: impl Into<String>, value: &str) -> Result<Self, TemplateError> {
        Ok(RewriteStep::Set {
            name: name.into(),
            value: Template::parse(value)?,
        })
    }

    pub fn function(function: impl Into<String>, param: impl Into<String>, into: impl Into<String>) -> Self {
        RewriteStep::Function {
            function: function.into(),
            param: param.into(),
            into: into.into(),
        }
    }
}

/// A named pattern plus the steps run when it matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRule {
    pub name: String,
    pub direction: RuleDirection,
    pub pattern: Template,
    pub steps: Vec<RewriteStep>,
}

impl RewriteRule {
    /// Builds a rule, parsing `pattern` eagerly.
    pub fn new(
        name: impl Into<String>,
        direction: RuleDirection,
        pattern: &str,
        steps: Vec<RewriteStep>,
    ) -> Result<Self, RewriteError> {
        let name = name.into();
        let pattern = Template::parse(pattern).map_err(|source| RewriteError::Template {
            rule: name.clone(),
            source,
        })?;
        Ok(Self {
            name,
            direction,
            pattern,
            steps,
        })
    }
}

#[derive(Error, Debug)]
pub enum RewriteError {
    #[error("rule `{rule}`: {source}")]
    Template { rule: String, source: TemplateError },
    #[error("duplicate rule name `{0}`")]
    DuplicateRule(String),
    #[error("rule `{0}` has no match pattern")]
    MissingPattern(String),
    #[error("rule `{rule}` references unbound variable `{name}`")]
    UnboundVariable { rule: String, name: String },
    #[error("rule `{rule}` references unknown function `{function}`")]
    UnknownFunction { rule: String, function: String },
    #[error("unknown rule `{0}`")]
    UnknownRule(String),
    #[error("invalid rule descriptor: {0}")]
    Descriptor(String),
    #[error("failed to read rule descriptor {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed URL: {0}")]
    InvalidUrl(#[source] TemplateError),
}
