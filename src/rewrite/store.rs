//! Ordered, name-indexed rule storage.

use std::collections::{BTreeSet, HashMap};

use super::{Condition, RewriteError, RewriteRule, RewriteStep};
use crate::function::FunctionRegistry;
use crate::template::Template;

/// Rules of one topology, kept in insertion order for first-match lookup.
///
/// Built once at deployment and shared read-only afterwards; a redeploy
/// swaps in a whole new store.
#[derive(Debug, Clone, Default)]
pub struct RuleStore {
    rules: Vec<RewriteRule>,
    index: HashMap<String, usize>,
}

impl RuleStore {
    /// Creates a new empty rule store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule. Rule names are unique within a store.
    pub fn add_rule(&mut self, rule: RewriteRule) -> Result<(), RewriteError> {
        if self.index.contains_key(&rule.name) {
            return Err(RewriteError::DuplicateRule(rule.name));
        }
        self.index.insert(rule.name.clone(), self.rules.len());
        self.rules.push(rule);
        Ok(())
    }

    /// Returns the rule named `name`.
    pub fn get_rule(&self, name: &str) -> Option<&RewriteRule> {
        self.index.get(name).map(|&i| &self.rules[i])
    }

    /// Returns all rules in insertion order.
    pub fn rules(&self) -> &[RewriteRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Checks every rule against the variables and functions available at
    /// request time.
    ///
    /// `ambient` lists names the request resolver provides (topology
    /// parameters). A variable is available if the rule pattern captures
    /// it, an earlier step binds it, or an enclosing `Matches` condition
    /// captures it.
    pub fn validate(&self, ambient: &BTreeSet<String>, functions: &FunctionRegistry) -> Result<(), RewriteError> {
        for rule in &self.rules {
            let mut known: BTreeSet<String> = ambient.clone();
            known.extend(rule.pattern.captures());
            Validator { rule, functions }.steps(&rule.steps, &mut known)?;
        }
        Ok(())
    }
}

struct Validator<'a> {
    rule: &'a RewriteRule,
    functions: &'a FunctionRegistry,
}

impl Validator<'_> {
    fn steps(&self, steps: &[RewriteStep], known: &mut BTreeSet<String>) -> Result<(), RewriteError> {
        for step in steps {
            match step {
                RewriteStep::Rewrite(template) => self.template(template, known)?,
                RewriteStep::Set { name, value } => {
                    self.template(value, known)?;
                    known.insert(name.clone());
                }
                RewriteStep::Function { function, into, .. } => {
                    self.function(function)?;
                    known.insert(into.clone());
                }
                RewriteStep::If { condition, steps } => self.branch(condition, steps, known)?,
                RewriteStep::Choose { when, otherwise } => {
                    for (condition, steps) in when {
                        self.branch(condition, steps, known)?;
                    }
                    self.steps(otherwise, &mut known.clone())?;
                }
            }
        }
        Ok(())
    }

    // Bindings made inside a branch are not visible after it.
    fn branch(&self, condition: &Condition, steps: &[RewriteStep], known: &BTreeSet<String>) -> Result<(), RewriteError> {
        let mut inner = known.clone();
        if let Condition::Matches(pattern) = condition {
            inner.extend(pattern.captures());
        }
        self.steps(steps, &mut inner)
    }

    fn template(&self, template: &Template, known: &BTreeSet<String>) -> Result<(), RewriteError> {
        if let Some(name) = template.variables().into_iter().find(|v| !known.contains(v)) {
            return Err(RewriteError::UnboundVariable {
                rule: self.rule.name.clone(),
                name,
            });
        }
        for function in template.functions() {
            self.function(&function)?;
        }
        Ok(())
    }

    fn function(&self, function: &str) -> Result<(), RewriteError> {
        if self.functions.contains(function) {
            Ok(())
        } else {
            Err(RewriteError::UnknownFunction {
                rule: self.rule.name.clone(),
                function: function.to_string(),
            })
        }
    }
}
