//! Rule selection and step execution.

use std::sync::Arc;

use tracing::debug;

use super::{Condition, Direction, Resolver, RewriteContext, RewriteError, RewriteRule, RewriteStep, RuleStore};
use crate::function::FunctionRegistry;
use crate::template::{match_template, render, MatchedTemplate, Template, TemplateError};

/// Applies the rules of one topology to URLs.
///
/// Cheap to clone; the store and registry are shared read-only.
#[derive(Debug, Clone)]
pub struct UrlRewriter {
    store: Arc<RuleStore>,
    functions: Arc<FunctionRegistry>,
}

impl UrlRewriter {
    pub fn new(store: Arc<RuleStore>, functions: Arc<FunctionRegistry>) -> Self {
        Self { store, functions }
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    /// Rewrites `url` with the first rule that applies to `direction` and
    /// matches it. Returns `url` unchanged when no rule matches.
    pub fn rewrite(&self, resolver: &dyn Resolver, url: &str, direction: Direction) -> Result<String, RewriteError> {
        Ok(self
            .rewrite_matched(resolver, url, direction)?
            .unwrap_or_else(|| url.to_string()))
    }

    /// Like [`UrlRewriter::rewrite`], but returns `None` when no rule
    /// matched, even if a matching rule would leave the URL as it was.
    pub fn rewrite_matched(
        &self,
        resolver: &dyn Resolver,
        url: &str,
        direction: Direction,
    ) -> Result<Option<String>, RewriteError> {
        let candidate = Template::parse_literal(url).map_err(RewriteError::InvalidUrl)?;

        for rule in self.store.rules() {
            if !rule.direction.applies_to(direction) {
                continue;
            }
            if let Some(bindings) = match_template(&rule.pattern, &candidate) {
                return self.apply(rule, resolver, url, candidate, bindings, direction).map(Some);
            }
        }
        Ok(None)
    }

    /// Rewrites `url` with the rule named `rule` only.
    pub fn rewrite_with_rule(
        &self,
        resolver: &dyn Resolver,
        url: &str,
        direction: Direction,
        rule: &str,
    ) -> Result<String, RewriteError> {
        let rule = self
            .store
            .get_rule(rule)
            .ok_or_else(|| RewriteError::UnknownRule(rule.to_string()))?;
        if !rule.direction.applies_to(direction) {
            return Ok(url.to_string());
        }

        let candidate = Template::parse_literal(url).map_err(RewriteError::InvalidUrl)?;
        match match_template(&rule.pattern, &candidate) {
            Some(bindings) => self.apply(rule, resolver, url, candidate, bindings, direction),
            None => Ok(url.to_string()),
        }
    }

    fn apply(
        &self,
        rule: &RewriteRule,
        resolver: &dyn Resolver,
        url: &str,
        candidate: Template,
        bindings: MatchedTemplate,
        direction: Direction,
    ) -> Result<String, RewriteError> {
        let mut ctx = RewriteContext::new(
            direction,
            url.to_string(),
            candidate,
            bindings,
            resolver,
            &self.functions,
        );
        execute(rule, &rule.steps, &mut ctx)?;
        debug!(rule = %rule.name, %direction, from = %url, to = %ctx.url(), "Applied rewrite rule");
        Ok(ctx.into_url())
    }
}

fn execute(rule: &RewriteRule, steps: &[RewriteStep], ctx: &mut RewriteContext<'_>) -> Result<(), RewriteError> {
    for step in steps {
        match step {
            RewriteStep::Rewrite(template) => {
                let rendered = render(template, &*ctx).map_err(|e| rule_error(rule, e))?;
                let parsed = Template::parse_literal(&rendered).map_err(|e| rule_error(rule, e))?;
                ctx.set_url(rendered, parsed);
            }
            RewriteStep::Set { name, value } => {
                let rendered = render(value, &*ctx).map_err(|e| rule_error(rule, e))?;
                ctx.bind(name.clone(), vec![rendered]);
            }
            RewriteStep::Function { function, param, into } => {
                let args = ctx.lookup(param).unwrap_or_else(|| vec![param.clone()]);
                let values = ctx.call_function(function, &args);
                ctx.bind(into.clone(), values);
            }
            RewriteStep::If { condition, steps } => {
                if evaluate(condition, ctx) {
                    execute(rule, steps, ctx)?;
                }
            }
            RewriteStep::Choose { when, otherwise } => {
                let branch = when
                    .iter()
                    .find(|(condition, _)| evaluate(condition, ctx))
                    .map(|(_, steps)| steps)
                    .unwrap_or(otherwise);
                execute(rule, branch, ctx)?;
            }
        }
    }
    Ok(())
}

fn rule_error(rule: &RewriteRule, err: TemplateError) -> RewriteError {
    match err {
        TemplateError::UnboundVariable(name) => RewriteError::UnboundVariable {
            rule: rule.name.clone(),
            name,
        },
        source => RewriteError::Template {
            rule: rule.name.clone(),
            source,
        },
    }
}

fn evaluate(condition: &Condition, ctx: &mut RewriteContext<'_>) -> bool {
    match condition {
        Condition::Exists(name) => ctx.lookup(name).is_some_and(|v| !v.is_empty()),
        Condition::Equals(name, value) => ctx.lookup(name).is_some_and(|v| v.iter().any(|x| x == value)),
        Condition::NotEquals(name, value) => !ctx.lookup(name).is_some_and(|v| v.iter().any(|x| x == value)),
        Condition::Matches(pattern) => match match_template(pattern, ctx.template()) {
            Some(captures) => {
                ctx.merge(captures);
                true
            }
            None => false,
        },
    }
}
