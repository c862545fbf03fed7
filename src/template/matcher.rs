use super::{MatchedTemplate, Segment, Template, UNNAMED_GLOB};

/// Matches a concrete URL against a pattern template.
///
/// Parts the pattern leaves out do not constrain the match. Scheme and host
/// compare case-insensitively, everything else exactly. A trailing slash on
/// either side is ignored.
pub fn match_template(pattern: &Template, candidate: &Template) -> Option<MatchedTemplate> {
    let mut matched = MatchedTemplate::new();

    match_component(pattern.scheme.as_ref(), candidate.scheme.as_ref(), true, &mut matched)?;
    match_component(pattern.host.as_ref(), candidate.host.as_ref(), true, &mut matched)?;
    match_component(pattern.port.as_ref(), candidate.port.as_ref(), false, &mut matched)?;

    if !pattern.path.is_empty() || pattern.absolute {
        let path: Vec<String> = candidate.path.iter().map(text).collect();
        if !match_path(&pattern.path, &path, &mut matched) {
            return None;
        }
    }

    match_query(pattern, candidate, &mut matched)?;
    match_component(pattern.fragment.as_ref(), candidate.fragment.as_ref(), false, &mut matched)?;

    Some(matched)
}

fn text(seg: &Segment) -> String {
    match seg.as_literal() {
        Some(s) => s.to_string(),
        None => seg.to_string(),
    }
}

fn match_component(
    pattern: Option<&Segment>,
    candidate: Option<&Segment>,
    ignore_case: bool,
    matched: &mut MatchedTemplate,
) -> Option<()> {
    let Some(pattern) = pattern else {
        return Some(());
    };
    let value = candidate.map(text);

    match (pattern, value) {
        (Segment::Literal(lit), Some(value)) => {
            let equal = if ignore_case {
                lit.eq_ignore_ascii_case(&value)
            } else {
                *lit == value
            };
            equal.then_some(())
        }
        (Segment::Literal(_), None) => None,
        (Segment::Wildcard(name) | Segment::Glob(name), value) => {
            if let Some(name) = name {
                matched.declare(name);
                if let Some(value) = value {
                    matched.push(name, value);
                }
            }
            Some(())
        }
        (Segment::Function { .. }, _) => None,
    }
}

fn match_single(pattern: &Segment, value: &str, matched: &mut MatchedTemplate) -> bool {
    match pattern {
        Segment::Literal(lit) => lit == value,
        Segment::Wildcard(Some(name)) => {
            matched.push(name, value.to_string());
            true
        }
        Segment::Wildcard(None) => true,
        Segment::Glob(_) | Segment::Function { .. } => false,
    }
}

/// A path holds at most one glob, so the match splits into a fixed prefix,
/// the glob's middle and a fixed suffix.
fn match_path(pattern: &[Segment], path: &[String], matched: &mut MatchedTemplate) -> bool {
    let glob = pattern.iter().position(|s| matches!(s, Segment::Glob(_)));

    let Some(glob_idx) = glob else {
        return pattern.len() == path.len()
            && pattern
                .iter()
                .zip(path)
                .all(|(p, v)| match_single(p, v, matched));
    };

    let prefix = &pattern[..glob_idx];
    let suffix = &pattern[glob_idx + 1..];
    if path.len() < prefix.len() + suffix.len() {
        return false;
    }
    let middle_end = path.len() - suffix.len();

    let fixed_ok = prefix
        .iter()
        .zip(&path[..prefix.len()])
        .chain(suffix.iter().zip(&path[middle_end..]))
        .all(|(p, v)| match_single(p, v, matched));
    if !fixed_ok {
        return false;
    }

    let key = match &pattern[glob_idx] {
        Segment::Glob(Some(name)) => name.as_str(),
        _ => UNNAMED_GLOB,
    };
    matched.declare(key);
    for value in &path[prefix.len()..middle_end] {
        matched.push(key, value.clone());
    }
    true
}

fn match_query(pattern: &Template, candidate: &Template, matched: &mut MatchedTemplate) -> Option<()> {
    let params: Vec<(String, Option<String>)> = candidate
        .query
        .iter()
        .map(|p| (p.name.clone(), p.value.as_ref().map(text)))
        .collect();
    let mut consumed = vec![false; params.len()];

    for expected in &pattern.query {
        let occurrences: Vec<usize> = params
            .iter()
            .enumerate()
            .filter(|(_, (name, _))| *name == expected.name)
            .map(|(i, _)| i)
            .collect();
        if occurrences.is_empty() {
            return None;
        }

        match &expected.value {
            None => occurrences.iter().for_each(|&i| consumed[i] = true),
            Some(Segment::Literal(lit)) => {
                let hit = occurrences
                    .iter()
                    .copied()
                    .find(|&i| params[i].1.as_deref() == Some(lit.as_str()))?;
                consumed[hit] = true;
            }
            Some(Segment::Wildcard(name) | Segment::Glob(name)) => {
                for &i in &occurrences {
                    consumed[i] = true;
                    if let Some(name) = name {
                        matched.push(name, params[i].1.clone().unwrap_or_default());
                    }
                }
            }
            Some(Segment::Function { .. }) => return None,
        }
    }

    if pattern.query_glob {
        matched.extra_query = params
            .into_iter()
            .zip(consumed)
            .filter(|(_, used)| !used)
            .map(|(param, _)| param)
            .collect();
    }
    Some(())
}
