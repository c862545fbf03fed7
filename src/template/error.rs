use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unbalanced brace in `{0}`")]
    UnbalancedBrace(String),
    #[error("invalid percent-encoding in `{0}`")]
    InvalidPercentEncoding(String),
    #[error("invalid expression `{{{0}}}`")]
    InvalidExpression(String),
    #[error("segment `{0}` mixes literal text with an expression")]
    MixedSegment(String),
    #[error("more than one glob in the {0} of a template")]
    MultipleGlobs(&'static str),
    #[error("unbound variable `{0}`")]
    UnboundVariable(String),
}
