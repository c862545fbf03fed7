use super::{MatchedTemplate, Segment, Template, TemplateError};

/// Source of values for [`render`].
pub trait Params {
    /// Values bound to `name`, or `None` when the name was never bound.
    fn values(&self, name: &str) -> Option<Vec<String>>;

    /// Query parameters to re-emit in place of a `{**}` query glob.
    fn extra_query(&self) -> Vec<(String, Option<String>)> {
        Vec::new()
    }

    /// Invokes a template function. Without a registry the arguments pass
    /// through unchanged.
    fn call(&self, _function: &str, args: Vec<String>) -> Vec<String> {
        args
    }
}

impl Params for MatchedTemplate {
    fn values(&self, name: &str) -> Option<Vec<String>> {
        self.get(name).map(<[String]>::to_vec)
    }

    fn extra_query(&self) -> Vec<(String, Option<String>)> {
        self.extra_query.clone()
    }
}

/// Renders `template` into a URL string.
///
/// A single-segment slot with no values renders as an empty segment. A glob
/// slot with no values is dropped along with its separator, and so is a
/// query parameter whose value has no values.
pub fn render(template: &Template, params: &dyn Params) -> Result<String, TemplateError> {
    let mut out = String::new();

    if let Some(scheme) = &template.scheme {
        out.push_str(&first(resolve(scheme, params)?));
        out.push_str("://");
    }
    if let Some(host) = &template.host {
        out.push_str(&first(resolve(host, params)?));
    }
    if let Some(port) = &template.port {
        let port = first(resolve(port, params)?);
        if !port.is_empty() {
            out.push(':');
            out.push_str(&port);
        }
    }

    let mut pieces = Vec::with_capacity(template.path.len());
    for seg in &template.path {
        let values = resolve(seg, params)?;
        if matches!(seg, Segment::Glob(_)) && values.is_empty() {
            continue;
        }
        pieces.push(values.join("/"));
    }
    if template.absolute {
        out.push('/');
    }
    out.push_str(&pieces.join("/"));
    if template.trailing_slash && !pieces.is_empty() {
        out.push('/');
    }

    let mut items = Vec::new();
    for param in &template.query {
        match &param.value {
            None => items.push(param.name.clone()),
            Some(seg) => {
                for value in resolve(seg, params)? {
                    items.push(format!("{}={}", param.name, value));
                }
            }
        }
    }
    if template.query_glob {
        for (name, value) in params.extra_query() {
            match value {
                Some(value) => items.push(format!("{}={}", name, value)),
                None => items.push(name),
            }
        }
    }
    if !items.is_empty() {
        out.push('?');
        out.push_str(&items.join("&"));
    }

    if let Some(fragment) = &template.fragment {
        let fragment = first(resolve(fragment, params)?);
        if !fragment.is_empty() {
            out.push('#');
            out.push_str(&fragment);
        }
    }

    Ok(out)
}

fn resolve(seg: &Segment, params: &dyn Params) -> Result<Vec<String>, TemplateError> {
    match seg {
        Segment::Literal(text) => Ok(vec![text.clone()]),
        Segment::Function { name, arg } => {
            let args = match arg {
                Some(arg) => params.values(arg).unwrap_or_else(|| vec![arg.clone()]),
                None => vec![String::new()],
            };
            Ok(params.call(name, args))
        }
        _ => {
            let name = seg.variable().unwrap_or_default();
            params
                .values(name)
                .ok_or_else(|| TemplateError::UnboundVariable(name.to_string()))
        }
    }
}

fn first(values: Vec<String>) -> String {
    values.into_iter().next().unwrap_or_default()
}
