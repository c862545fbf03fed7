//! Template and URL parsing.

use super::{QueryParam, Segment, Template, TemplateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Mode {
    /// `*`, `**` and `{...}` are expressions.
    Pattern,
    /// Everything is literal text.
    Literal,
}

pub(super) fn parse(input: &str, mode: Mode) -> Result<Template, TemplateError> {
    if mode == Mode::Pattern {
        check_braces(input)?;
    }

    let mut template = Template::default();
    let (rest, fragment) = split_once_outside(input, "#", mode);
    let (rest, query) = split_once_outside(rest, "?", mode);

    let path = match find_outside(rest, "://", mode) {
        Some(idx) if !rest[..idx].contains('/') => {
            template.scheme = Some(segment(&rest[..idx], mode)?);
            let after = &rest[idx + 3..];
            let end = find_outside(after, "/", mode).unwrap_or(after.len());
            parse_authority(&mut template, &after[..end], mode)?;
            &after[end..]
        }
        _ => rest,
    };

    parse_path(&mut template, path, mode)?;
    if let Some(query) = query {
        parse_query(&mut template, query, mode)?;
    }
    if let Some(fragment) = fragment {
        template.fragment = Some(segment(fragment, mode)?);
    }
    Ok(template)
}

fn parse_authority(template: &mut Template, authority: &str, mode: Mode) -> Result<(), TemplateError> {
    if authority.is_empty() {
        return Ok(());
    }

    // [::1]:8080
    if authority.starts_with('[') {
        if let Some(end) = authority.find(']') {
            template.host = Some(Segment::Literal(authority[..=end].to_string()));
            if let Some(port) = authority[end + 1..].strip_prefix(':') {
                template.port = Some(segment(port, mode)?);
            }
            return Ok(());
        }
    }

    match rfind_outside(authority, ':', mode) {
        Some(idx) => {
            template.host = Some(segment(&authority[..idx], mode)?);
            template.port = Some(segment(&authority[idx + 1..], mode)?);
        }
        None => template.host = Some(segment(authority, mode)?),
    }
    Ok(())
}

fn parse_path(template: &mut Template, path: &str, mode: Mode) -> Result<(), TemplateError> {
    if path.is_empty() {
        return Ok(());
    }

    template.absolute = path.starts_with('/');
    let mut body = path.strip_prefix('/').unwrap_or(path);
    if body.is_empty() {
        return Ok(());
    }
    if let Some(stripped) = body.strip_suffix('/') {
        template.trailing_slash = true;
        body = stripped;
    }

    for token in split_outside(body, '/', mode) {
        template.path.push(segment(token, mode)?);
    }

    let globs = template
        .path
        .iter()
        .filter(|s| matches!(s, Segment::Glob(_)))
        .count();
    if globs > 1 {
        return Err(TemplateError::MultipleGlobs("path"));
    }
    Ok(())
}

fn parse_query(template: &mut Template, query: &str, mode: Mode) -> Result<(), TemplateError> {
    for item in split_outside(query, '&', mode) {
        if item.is_empty() {
            continue;
        }

        if mode == Mode::Pattern && item.starts_with('{') && find_outside(item, "=", mode).is_none() {
            match segment(item, mode)? {
                Segment::Glob(None) => {
                    if template.query_glob {
                        return Err(TemplateError::MultipleGlobs("query"));
                    }
                    template.query_glob = true;
                }
                Segment::Wildcard(Some(name)) => template.query.push(QueryParam {
                    value: Some(Segment::Wildcard(Some(name.clone()))),
                    name,
                }),
                Segment::Glob(Some(name)) => template.query.push(QueryParam {
                    value: Some(Segment::Glob(Some(name.clone()))),
                    name,
                }),
                _ => return Err(TemplateError::InvalidExpression(item.to_string())),
            }
            continue;
        }

        let (name, value) = match find_outside(item, "=", mode) {
            Some(idx) => (&item[..idx], Some(&item[idx + 1..])),
            None => (item, None),
        };
        if mode == Mode::Pattern && (name.contains('{') || name.contains('}')) {
            return Err(TemplateError::MixedSegment(name.to_string()));
        }
        validate_percent(name)?;
        let value = value.map(|v| segment(v, mode)).transpose()?;
        template.query.push(QueryParam {
            name: name.to_string(),
            value,
        });
    }
    Ok(())
}

fn segment(token: &str, mode: Mode) -> Result<Segment, TemplateError> {
    if mode == Mode::Literal {
        validate_percent(token)?;
        return Ok(Segment::Literal(token.to_string()));
    }

    match token {
        "*" => return Ok(Segment::Wildcard(None)),
        "**" => return Ok(Segment::Glob(None)),
        _ => {}
    }

    if token.contains('{') || token.contains('}') {
        let inner = token
            .strip_prefix('{')
            .and_then(|t| t.strip_suffix('}'))
            .filter(|inner| !inner.contains('{') && !inner.contains('}'))
            .ok_or_else(|| TemplateError::MixedSegment(token.to_string()))?;
        return expression(inner);
    }

    validate_percent(token)?;
    Ok(Segment::Literal(token.to_string()))
}

fn expression(inner: &str) -> Result<Segment, TemplateError> {
    let invalid = || TemplateError::InvalidExpression(inner.to_string());

    match inner {
        "*" => return Ok(Segment::Wildcard(None)),
        "**" => return Ok(Segment::Glob(None)),
        _ => {}
    }

    if let Some(call) = inner.strip_prefix('$') {
        let (name, arg) = match call.find('(') {
            Some(open) => {
                let arg = call[open + 1..].strip_suffix(')').ok_or_else(invalid)?.trim();
                (&call[..open], (!arg.is_empty()).then(|| arg.to_string()))
            }
            None => (call, None),
        };
        if !valid_name(name) {
            return Err(invalid());
        }
        return Ok(Segment::Function {
            name: name.to_string(),
            arg,
        });
    }

    if let Some((name, kind)) = inner.split_once('=') {
        if !valid_name(name) {
            return Err(invalid());
        }
        return match kind {
            "*" => Ok(Segment::Wildcard(Some(name.to_string()))),
            "**" => Ok(Segment::Glob(Some(name.to_string()))),
            _ => Err(invalid()),
        };
    }

    if !valid_name(inner) {
        return Err(invalid());
    }
    Ok(Segment::Wildcard(Some(inner.to_string())))
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn validate_percent(text: &str) -> Result<(), TemplateError> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let ok = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !ok {
                return Err(TemplateError::InvalidPercentEncoding(text.to_string()));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(())
}

fn check_braces(input: &str) -> Result<(), TemplateError> {
    let mut open = false;
    for c in input.chars() {
        match c {
            '{' if open => return Err(TemplateError::UnbalancedBrace(input.to_string())),
            '{' => open = true,
            '}' if !open => return Err(TemplateError::UnbalancedBrace(input.to_string())),
            '}' => open = false,
            _ => {}
        }
    }
    if open {
        return Err(TemplateError::UnbalancedBrace(input.to_string()));
    }
    Ok(())
}

/// Byte offsets of `input` that sit outside `{...}` in pattern mode.
fn outside(input: &str, mode: Mode) -> impl Iterator<Item = (usize, char)> + '_ {
    let mut depth = 0usize;
    input.char_indices().filter(move |&(_, c)| {
        if mode == Mode::Literal {
            return true;
        }
        match c {
            '{' => {
                depth += 1;
                false
            }
            '}' => {
                depth = depth.saturating_sub(1);
                false
            }
            _ => depth == 0,
        }
    })
}

fn find_outside(input: &str, needle: &str, mode: Mode) -> Option<usize> {
    outside(input, mode)
        .map(|(i, _)| i)
        .find(|&i| input[i..].starts_with(needle))
}

fn rfind_outside(input: &str, needle: char, mode: Mode) -> Option<usize> {
    outside(input, mode)
        .filter(|&(_, c)| c == needle)
        .map(|(i, _)| i)
        .last()
}

fn split_once_outside<'a>(input: &'a str, needle: &str, mode: Mode) -> (&'a str, Option<&'a str>) {
    match find_outside(input, needle, mode) {
        Some(idx) => (&input[..idx], Some(&input[idx + needle.len()..])),
        None => (input, None),
    }
}

fn split_outside(input: &str, sep: char, mode: Mode) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    for (i, c) in outside(input, mode) {
        if c == sep {
            parts.push(&input[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&input[start..]);
    parts
}
