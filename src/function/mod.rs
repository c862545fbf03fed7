//! Named functions invocable from rewrite templates as `{$name(arg)}`.
//!
//! Functions are registered from an explicit startup table
//! ([`FunctionRegistry::builtin`]). A function that cannot resolve its
//! parameter returns nothing and the registry substitutes the parameter
//! itself, so an unresolved function never fails a rewrite.

mod hostmap;
mod service;
mod username;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::rewrite::Direction;

pub use hostmap::{HostMap, HostMapFunction};
pub use service::{ServiceFunction, ServiceLookup, ServicePart};
pub use username::UsernameFunction;

/// Request-scoped state a function may read.
#[derive(Debug, Clone, Copy, Default)]
pub struct FunctionContext<'a> {
    /// Authenticated principal of the current request.
    pub principal: Option<&'a str>,
}

/// A named rewrite function.
pub trait RewriteFunction: Send + Sync {
    /// Resolves one parameter. An empty result means "unresolved".
    fn resolve(&self, ctx: &FunctionContext<'_>, direction: Direction, param: &str) -> Vec<String>;
}

/// Collaborators the built-in functions are constructed from.
#[derive(Clone)]
pub struct FunctionSetup {
    pub hostmap: Arc<HostMap>,
    pub services: Arc<dyn ServiceLookup>,
}

#[derive(Debug, Clone, Copy)]
enum Builtin {
    HostMap,
    Username,
    Service(ServicePart),
}

impl Builtin {
    fn build(self, setup: &FunctionSetup) -> Arc<dyn RewriteFunction> {
        match self {
            Builtin::HostMap => Arc::new(HostMapFunction::new(setup.hostmap.clone())),
            Builtin::Username => Arc::new(UsernameFunction),
            Builtin::Service(part) => Arc::new(ServiceFunction::new(part, setup.services.clone())),
        }
    }
}

const BUILTIN_FUNCTIONS: &[(&str, Builtin)] = &[
    ("hostmap", Builtin::HostMap),
    ("username", Builtin::Username),
    ("serviceUrl", Builtin::Service(ServicePart::Url)),
    ("serviceScheme", Builtin::Service(ServicePart::Scheme)),
    ("serviceHost", Builtin::Service(ServicePart::Host)),
    ("servicePort", Builtin::Service(ServicePart::Port)),
    ("servicePath", Builtin::Service(ServicePart::Path)),
    ("serviceAddr", Builtin::Service(ServicePart::Addr)),
];

/// Maps function names to implementations. Read-only once built.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn RewriteFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry holding every built-in function.
    pub fn builtin(setup: &FunctionSetup) -> Self {
        let mut registry = Self::new();
        for (name, builtin) in BUILTIN_FUNCTIONS {
            registry.register(*name, builtin.build(setup));
        }
        registry
    }

    /// Registers `function` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, function: Arc<dyn RewriteFunction>) {
        self.functions.insert(name.into(), function);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Resolves each parameter through function `name`.
    ///
    /// Unresolved parameters and unknown functions pass through unchanged.
    pub fn resolve(
        &self,
        name: &str,
        ctx: &FunctionContext<'_>,
        direction: Direction,
        params: &[String],
    ) -> Vec<String> {
        let Some(function) = self.functions.get(name) else {
            warn!(function = %name, "Unknown rewrite function, passing parameters through");
            return params.to_vec();
        };

        params
            .iter()
            .flat_map(|param| {
                let resolved = function.resolve(ctx, direction, param);
                if resolved.is_empty() {
                    vec![param.clone()]
                } else {
                    resolved
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}
