#[cfg(test)]
use std::collections::HashMap;

use super::Direction;
use crate::function::{FunctionContext, FunctionRegistry};
use crate::template::{MatchedTemplate, Params, Template};

/// Supplies ambient values (topology parameters, the request principal)
/// that rules may reference but do not capture.
pub trait Resolver {
    fn resolve(&self, name: &str) -> Option<Vec<String>>;

    /// Authenticated principal of the current request.
    fn principal(&self) -> Option<&str> {
        None
    }
}

/// A [`Resolver`] backed by a plain map.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct MapResolver {
    values: HashMap<String, Vec<String>>,
    principal: Option<String>,
}

#[cfg(test)]
impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.entry(name.into()).or_default().push(value.into());
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }
}

#[cfg(test)]
impl Resolver for MapResolver {
    fn resolve(&self, name: &str) -> Option<Vec<String>> {
        self.values.get(name).cloned()
    }

    fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }
}

/// Mutable state of one rewrite: the current URL and the variables bound
/// so far. Created per rewrite and dropped afterwards.
pub struct RewriteContext<'a> {
    direction: Direction,
    url: String,
    template: Template,
    bindings: MatchedTemplate,
    resolver: &'a dyn Resolver,
    functions: &'a FunctionRegistry,
}

impl<'a> RewriteContext<'a> {
    pub fn new(
        direction: Direction,
        url: String,
        template: Template,
        bindings: MatchedTemplate,
        resolver: &'a dyn Resolver,
        functions: &'a FunctionRegistry,
    ) -> Self {
        Self {
            direction,
            url,
            template,
            bindings,
            resolver,
            functions,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The current URL in parsed form.
    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn set_url(&mut self, url: String, template: Template) {
        self.url = url;
        self.template = template;
    }

    pub fn bind(&mut self, name: impl Into<String>, values: Vec<String>) {
        self.bindings.bind(name, values);
    }

    pub fn merge(&mut self, captures: MatchedTemplate) {
        self.bindings.merge(captures);
    }

    /// Looks `name` up in the bindings, then in the resolver.
    pub fn lookup(&self, name: &str) -> Option<Vec<String>> {
        match self.bindings.get(name) {
            Some(values) => Some(values.to_vec()),
            None => self.resolver.resolve(name),
        }
    }

    pub fn call_function(&self, function: &str, args: &[String]) -> Vec<String> {
        let ctx = FunctionContext {
            principal: self.resolver.principal(),
        };
        self.functions.resolve(function, &ctx, self.direction, args)
    }

    pub fn into_url(self) -> String {
        self.url
    }
}

impl Params for RewriteContext<'_> {
    fn values(&self, name: &str) -> Option<Vec<String>> {
        self.lookup(name)
    }

    fn extra_query(&self) -> Vec<(String, Option<String>)> {
        self.bindings.extra_query().to_vec()
    }

    fn call(&self, function: &str, args: Vec<String>) -> Vec<String> {
        self.call_function(function, &args)
    }
}
