//! XML rule descriptors.
//!
//! ```xml
//! <rules>
//!   <rule name="WEBHDFS/inbound" dir="in" pattern="*://*:*/*/*/webhdfs/v1/{path=**}?{**}">
//!     <rewrite template="{$serviceUrl(WEBHDFS)}/v1/{path=**}?{**}"/>
//!   </rule>
//! </rules>
//! ```
//!
//! A rule takes its pattern from a `pattern` attribute or a `<match>` child.
//! Steps are `<rewrite template>`, `<set name value>`, `<function name param
//! into>`, `<if>` and `<choose>` with `<when>`/`<otherwise>` branches.
//! Conditions are written as attributes: `exists="var"`, `var="x"` with
//! `equals`/`not-equals`, or `pattern="..."`.

use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{Condition, RewriteError, RewriteRule, RewriteStep, RuleDirection};
use crate::template::Template;

#[derive(Debug)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
}

impl Element {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn require(&self, key: &str, rule: &str) -> Result<&str, RewriteError> {
        self.attr(key).ok_or_else(|| {
            RewriteError::Descriptor(format!("rule `{}`: <{}> requires `{}`", rule, self.name, key))
        })
    }
}

/// Reads and parses a rule descriptor file.
pub fn load_rules_file(path: &Path) -> Result<Vec<RewriteRule>, RewriteError> {
    let xml = std::fs::read_to_string(path).map_err(|source| RewriteError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_rules(&xml)
}

/// Parses a `<rules>` document.
pub fn parse_rules(xml: &str) -> Result<Vec<RewriteRule>, RewriteError> {
    let root = parse_document(xml)?;
    if root.name != "rules" {
        return Err(RewriteError::Descriptor(format!(
            "expected <rules> root element, found <{}>",
            root.name
        )));
    }

    root.children
        .iter()
        .map(|child| match child.name.as_str() {
            "rule" => build_rule(child),
            other => Err(RewriteError::Descriptor(format!("unexpected element <{}> in <rules>", other))),
        })
        .collect()
}

fn parse_document(xml: &str) -> Result<Element, RewriteError> {
    let mut reader = Reader::from_reader(xml.as_bytes());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let element = start_element(&e)?;
                return parse_children(&mut reader, element);
            }
            Ok(Event::Empty(e)) => return start_element(&e),
            Ok(Event::Eof) => return Err(RewriteError::Descriptor("empty document".to_string())),
            Err(e) => {
                return Err(RewriteError::Descriptor(format!(
                    "malformed XML at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }
}

fn parse_children(reader: &mut Reader<&[u8]>, mut parent: Element) -> Result<Element, RewriteError> {
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let child = start_element(&e)?;
                parent.children.push(parse_children(reader, child)?);
            }
            Ok(Event::Empty(e)) => parent.children.push(start_element(&e)?),
            Ok(Event::End(_)) => return Ok(parent),
            Ok(Event::Eof) => {
                return Err(RewriteError::Descriptor(format!(
                    "unexpected end of document inside <{}>",
                    parent.name
                )))
            }
            Err(e) => {
                return Err(RewriteError::Descriptor(format!(
                    "malformed XML at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }
}

fn start_element(e: &BytesStart<'_>) -> Result<Element, RewriteError> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| RewriteError::Descriptor(format!("<{}>: {}", name, err)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| RewriteError::Descriptor(format!("<{}> attribute `{}`: {}", name, key, err)))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(Element {
        name,
        attributes,
        children: Vec::new(),
    })
}

fn build_rule(element: &Element) -> Result<RewriteRule, RewriteError> {
    let name = element
        .attr("name")
        .ok_or_else(|| RewriteError::Descriptor("<rule> without a name".to_string()))?;
    let direction = match element.attr("dir") {
        Some(dir) => RuleDirection::parse(dir)
            .ok_or_else(|| RewriteError::Descriptor(format!("rule `{}`: invalid dir `{}`", name, dir)))?,
        None => RuleDirection::Both,
    };

    let mut pattern = element.attr("pattern");
    let mut steps = Vec::new();
    for child in &element.children {
        if child.name == "match" {
            pattern = Some(child.require("pattern", name)?);
            steps.extend(build_steps(name, &child.children)?);
        } else {
            steps.push(build_step(name, child)?);
        }
    }

    let pattern = pattern.ok_or_else(|| RewriteError::MissingPattern(name.to_string()))?;
    RewriteRule::new(name, direction, pattern, steps)
}

fn build_steps(rule: &str, elements: &[Element]) -> Result<Vec<RewriteStep>, RewriteError> {
    elements.iter().map(|e| build_step(rule, e)).collect()
}

fn build_step(rule: &str, element: &Element) -> Result<RewriteStep, RewriteError> {
    let template = |key: &str| -> Result<Template, RewriteError> {
        let raw = element.require(key, rule)?;
        parse_template(rule, raw)
    };

    match element.name.as_str() {
        "rewrite" => Ok(RewriteStep::Rewrite(template("template")?)),
        "set" => Ok(RewriteStep::Set {
            name: element.require("name", rule)?.to_string(),
            value: template("value")?,
        }),
        "function" => {
            let function = element.require("name", rule)?;
            Ok(RewriteStep::function(
                function,
                element.attr("param").unwrap_or_default(),
                element.attr("into").unwrap_or(function),
            ))
        }
        "if" => Ok(RewriteStep::If {
            condition: build_condition(rule, element)?,
            steps: build_steps(rule, &element.children)?,
        }),
        "choose" => {
            let mut when = Vec::new();
            let mut otherwise = Vec::new();
            for branch in &element.children {
                match branch.name.as_str() {
                    "when" => when.push((build_condition(rule, branch)?, build_steps(rule, &branch.children)?)),
                    "otherwise" => otherwise = build_steps(rule, &branch.children)?,
                    other => {
                        return Err(RewriteError::Descriptor(format!(
                            "rule `{}`: unexpected <{}> in <choose>",
                            rule, other
                        )))
                    }
                }
            }
            Ok(RewriteStep::Choose { when, otherwise })
        }
        other => Err(RewriteError::Descriptor(format!(
            "rule `{}`: unknown step <{}>",
            rule, other
        ))),
    }
}

fn build_condition(rule: &str, element: &Element) -> Result<Condition, RewriteError> {
    if let Some(var) = element.attr("exists") {
        return Ok(Condition::Exists(var.to_string()));
    }
    if let Some(pattern) = element.attr("pattern") {
        return Ok(Condition::Matches(parse_template(rule, pattern)?));
    }
    if let Some(var) = element.attr("var") {
        if let Some(value) = element.attr("equals") {
            return Ok(Condition::Equals(var.to_string(), value.to_string()));
        }
        if let Some(value) = element.attr("not-equals") {
            return Ok(Condition::NotEquals(var.to_string(), value.to_string()));
        }
        return Ok(Condition::Exists(var.to_string()));
    }
    Err(RewriteError::Descriptor(format!(
        "rule `{}`: <{}> needs `exists`, `var` or `pattern`",
        rule, element.name
    )))
}

fn parse_template(rule: &str, raw: &str) -> Result<Template, RewriteError> {
    Template::parse(raw).map_err(|source| RewriteError::Template {
        rule: rule.to_string(),
        source,
    })
}
