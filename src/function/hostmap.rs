//! Bidirectional hostname aliasing.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use super::{FunctionContext, RewriteFunction};
use crate::rewrite::Direction;

/// Static table mapping external host names to internal ones and back.
///
/// Each line of the descriptor reads `ext1,ext2=int1,int2`. Inbound lookups
/// map any external name to the first internal name; outbound lookups map
/// any internal name to the first external name. Names compare
/// case-insensitively and the first line naming a host wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostMap {
    inbound: HashMap<String, String>,
    outbound: HashMap<String, String>,
}

impl HostMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a hostmap descriptor. Blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Self {
        let mut map = Self::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('=') {
                Some((external, internal)) => map.add(external, internal),
                None => warn!(line = lineno + 1, "Skipping hostmap line without '='"),
            }
        }
        map
    }

    /// Reads and parses a hostmap descriptor file.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Adds one mapping; both sides are comma-separated alias lists.
    pub fn add(&mut self, external: &str, internal: &str) {
        let externals = split_names(external);
        let internals = split_names(internal);
        let (Some(first_ext), Some(first_int)) = (externals.first(), internals.first()) else {
            warn!(external, internal, "Skipping hostmap entry with an empty side");
            return;
        };

        for ext in &externals {
            self.inbound
                .entry(ext.to_ascii_lowercase())
                .or_insert_with(|| first_int.clone());
        }
        for int in &internals {
            self.outbound
                .entry(int.to_ascii_lowercase())
                .or_insert_with(|| first_ext.clone());
        }
    }

    /// External name → internal name.
    pub fn inbound(&self, host: &str) -> Option<&str> {
        self.inbound.get(&host.to_ascii_lowercase()).map(String::as_str)
    }

    /// Internal name → external name.
    pub fn outbound(&self, host: &str) -> Option<&str> {
        self.outbound.get(&host.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.inbound.is_empty()
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for HostMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (external, internal) in iter {
            map.add(external.as_ref(), internal.as_ref());
        }
        map
    }
}

fn split_names(side: &str) -> Vec<String> {
    side.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// `{$hostmap(host)}`: inbound maps external to internal, outbound the reverse.
pub struct HostMapFunction {
    map: Arc<HostMap>,
}

impl HostMapFunction {
    pub fn new(map: Arc<HostMap>) -> Self {
        Self { map }
    }
}

impl RewriteFunction for HostMapFunction {
    fn resolve(&self, _ctx: &FunctionContext<'_>, direction: Direction, param: &str) -> Vec<String> {
        let mapped = match direction {
            Direction::In => self.map.inbound(param),
            Direction::Out => self.map.outbound(param),
        };
        mapped.map(|host| vec![host.to_string()]).unwrap_or_default()
    }
}
