use super::{FunctionContext, RewriteFunction};
use crate::rewrite::Direction;

/// `{$username}`: the authenticated principal of the current request.
pub struct UsernameFunction;

impl RewriteFunction for UsernameFunction {
    fn resolve(&self, ctx: &FunctionContext<'_>, _direction: Direction, _param: &str) -> Vec<String> {
        ctx.principal
            .map(|p| vec![p.to_string()])
            .unwrap_or_default()
    }
}
